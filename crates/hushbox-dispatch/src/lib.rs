//! Request contract and the stateless dispatcher in front of the vault.

mod dispatcher;
pub mod request;
pub mod response;

pub use dispatcher::{DispatchSettings, Dispatcher};
pub use request::Request;
pub use response::Response;
