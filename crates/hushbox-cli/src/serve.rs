use std::{sync::Arc, time::Duration};

use color_eyre::{eyre::eyre, Result};
use hushbox_core::{collab::AllowListScopeResolver, storage::RecordStore};
use hushbox_dispatch::Dispatcher;
use hushbox_guard::{
    audit::{AuditSink, JsonlAuditSink},
    rate_limit::{CounterStore, InMemoryCounterStore},
    AuditLogger, RateLimiter,
};
use hushbox_storage::file_record_store::FileRecordStore;
use hushbox_vault::ArtifactVault;
use serde::Deserialize;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncWrite, AsyncWriteExt, BufReader};
use tracing::{debug, info};

use crate::{config::Config, storage};

/// Line written by the fronting proxy: the caller's network identity next to
/// the client's request, which is passed through untouched.
#[derive(Debug, Deserialize)]
struct Envelope {
    #[serde(default)]
    identity: Option<String>,
    request: serde_json::Value,
}

/// Wire a dispatcher around `vault` using the limits and scopes from `config`.
pub fn build_dispatcher<S: RecordStore + 'static>(
    config: &Config,
    vault: ArtifactVault<S>,
    sink: Arc<dyn AuditSink>,
    counters: Arc<dyn CounterStore>,
) -> Dispatcher<S> {
    let limiter = RateLimiter::new(counters, config.rate_limit);
    let audit = AuditLogger::spawn(sink, config.dispatch.audit_queue_capacity);
    let scopes = AllowListScopeResolver::new(config.dispatch.allowed_scopes.iter().cloned());
    Dispatcher::new(
        Arc::new(vault),
        Arc::new(limiter),
        audit,
        Arc::new(scopes),
        config.dispatch.clone(),
    )
}

fn dispatcher_from_config(config: &Config) -> Result<Dispatcher<FileRecordStore>> {
    let vault = storage::vault_from_config(config)?;
    let sink = JsonlAuditSink::open(storage::audit_log_path(config)?)
        .map_err(|e| eyre!("opening audit log: {e:#}"))?;
    Ok(build_dispatcher(
        config,
        vault,
        Arc::new(sink),
        Arc::new(InMemoryCounterStore::new()),
    ))
}

/// `hushbox serve`: stdin to stdout until EOF, with the expiry sweeper and
/// counter pruning running alongside.
pub async fn run_serve(config: &Config, identity: Option<String>) -> Result<()> {
    let dispatcher = dispatcher_from_config(config)?;
    let sweeper = Arc::clone(dispatcher.vault()).spawn_sweeper(Duration::from_secs(
        config.dispatch.sweep_interval_secs.max(1),
    ));
    let pruner = Arc::clone(dispatcher.limiter())
        .spawn_pruner(Duration::from_secs(config.rate_limit.window_secs.max(1)));
    match identity.as_deref() {
        Some(_) => info!("serving bare requests on stdin"),
        None => info!("serving proxy envelopes on stdin"),
    }

    let result = serve_lines(
        &dispatcher,
        BufReader::new(tokio::io::stdin()),
        tokio::io::stdout(),
        identity.as_deref(),
    )
    .await;

    sweeper.abort();
    pruner.abort();
    dispatcher.audit().clone().shutdown().await;
    let handled = result?;
    info!(handled, "input closed, exiting");
    Ok(())
}

/// `hushbox request '<json>'`.
pub async fn run_request(config: &Config, raw: &str, identity: Option<String>) -> Result<()> {
    let dispatcher = dispatcher_from_config(config)?;
    let response = dispatcher.handle_json(raw, identity.as_deref()).await;
    dispatcher.audit().clone().shutdown().await;
    println!("{}", serde_json::to_string(&response)?);
    Ok(())
}

/// Answer each non-blank input line with exactly one output line. Returns the
/// number of requests handled.
///
/// With `fixed_identity` every line is a bare request counted under it.
/// Otherwise lines are proxy envelopes; anything else is counted under the
/// fallback identity. The identity never comes from the request itself.
pub async fn serve_lines<S, R, W>(
    dispatcher: &Dispatcher<S>,
    input: R,
    mut output: W,
    fixed_identity: Option<&str>,
) -> Result<usize>
where
    S: RecordStore + 'static,
    R: AsyncBufRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut lines = input.lines();
    let mut handled = 0;
    while let Some(line) = lines.next_line().await? {
        if line.trim().is_empty() {
            continue;
        }
        let response = match fixed_identity {
            Some(identity) => dispatcher.handle_json(&line, Some(identity)).await,
            None => match serde_json::from_str::<Envelope>(&line) {
                Ok(envelope) => {
                    dispatcher
                        .handle_json(&envelope.request.to_string(), envelope.identity.as_deref())
                        .await
                }
                Err(err) => {
                    debug!(error = %err, "line is not a proxy envelope");
                    dispatcher.handle_json(&line, None).await
                }
            },
        };
        let mut body = serde_json::to_vec(&response)?;
        body.push(b'\n');
        output.write_all(&body).await?;
        output.flush().await?;
        handled += 1;
    }
    Ok(handled)
}
