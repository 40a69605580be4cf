//! Agent entry point: wires configuration, logging, the pipeline and
//! shutdown handling together. The transport and uploader are external
//! collaborators; the binary drains the uploader channel into the log so the
//! pipeline can run standalone.

use std::sync::Arc;

use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use trace_agent::agent::{payload_channel, Agent};
use trace_agent::config::Config;
use trace_agent::logger::Formatter;
use trace_agent::receiver::trace_channel;
use trace_agent::watchdog::default_die;

#[tokio::main]
async fn main() {
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with(fmt::layer().event_format(Formatter))
        .init();

    let config = Arc::new(Config::from_env());
    info!(
        "starting trace agent, hostname={} env={}",
        config.hostname, config.default_env
    );

    let shutdown = CancellationToken::new();
    let (_trace_tx, trace_rx) = trace_channel(config.trace_channel_capacity);
    let (_distributed_tx, distributed_rx) = trace_channel(config.trace_channel_capacity);
    let (payload_tx, mut payload_rx) = payload_channel();

    // Stand-in uploader: logs what would be shipped upstream.
    tokio::spawn(async move {
        while let Some(payload) = payload_rx.recv().await {
            debug!(
                "payload ready: {} stats buckets, {} traces",
                payload.stats.len(),
                payload.traces.len()
            );
        }
    });

    let agent = Agent::new(
        config,
        trace_rx,
        distributed_rx,
        payload_tx,
        default_die(),
        shutdown.clone(),
    );
    let agent_task = tokio::spawn(agent.run());

    if let Err(err) = tokio::signal::ctrl_c().await {
        error!("could not listen for shutdown signal: {err}");
    }
    info!("shutdown requested");
    shutdown.cancel();
    if let Err(err) = agent_task.await {
        error!("agent task failed: {err}");
    }
}
