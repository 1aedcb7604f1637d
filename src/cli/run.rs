use crate::config::types::Config;
use crate::config::{load_config, ConfigError};
use crate::formatter::FormatterRegistry;
use crate::pipeline::{bounded, Heartbeat, Sender};
use crate::record::Normalizer;
use crate::sink::{NsqSink, Sink, SinkError};
use crate::source::Scanner;
use crate::storage::CursorStore;
use crate::supervisor::{Supervisor, UnitError};
use std::future::Future;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

#[derive(Debug, Error)]
pub enum RunError {
    #[error("config error: {0}")]
    Config(#[from] ConfigError),

    #[error("sink error: {0}")]
    Sink(#[from] SinkError),

    #[error("cannot create state directory: {0}")]
    StateDir(#[from] std::io::Error),

    #[error("{0}")]
    Unit(UnitError),
}

/// Load the configuration at `config_path` and ship logs to the configured
/// nsqd until Ctrl-C
pub async fn run(config_path: &Path) -> Result<(), RunError> {
    info!(config_path = %config_path.display(), "Loading configuration");
    let formatters = Arc::new(FormatterRegistry::with_builtins());
    let config = load_config(config_path, &formatters)?;

    let sink: Arc<dyn Sink> = Arc::new(NsqSink::new(&config.sink)?);
    run_agent(config, formatters, sink, ctrl_c()).await
}

async fn ctrl_c() {
    match tokio::signal::ctrl_c().await {
        Ok(()) => info!("Shutdown signal received"),
        Err(e) => {
            error!(error = %e, "Cannot listen for Ctrl-C, running until killed");
            std::future::pending::<()>().await;
        }
    }
}

/// Run the whole collection pipeline against `sink` until `shutdown`
/// resolves or a unit fails fatally. Every unit is joined before returning.
pub async fn run_agent<F>(
    config: Config,
    formatters: Arc<FormatterRegistry>,
    sink: Arc<dyn Sink>,
    shutdown: F,
) -> Result<(), RunError>
where
    F: Future<Output = ()>,
{
    let host = config.host_identity();
    let cancel = CancellationToken::new();
    tokio::pin!(shutdown);

    tokio::fs::create_dir_all(&config.state.dir).await?;
    info!(
        host = %host,
        state_dir = %config.state.dir.display(),
        sources = config.sources.len(),
        "Starting log shipper"
    );

    let mut topics = vec![config.sink.topic.clone()];
    if config.heartbeat.enabled {
        topics.push(config.sink.heartbeat_topic.clone());
    }
    tokio::select! {
        _ = &mut shutdown => return Ok(()),
        _ = ensure_topics(sink.as_ref(), &topics, config.sender.retry_wait) => {}
    }

    let (producer, consumer) = bounded(
        config.queue.capacity,
        config.queue.put_timeout,
        config.queue.get_timeout,
    );
    let normalizer = Arc::new(Normalizer::new(host.clone(), Arc::clone(&formatters)));

    let mut supervisor = Supervisor::new(cancel);

    let scanner = Scanner::new(
        config.sources.clone(),
        formatters,
        normalizer,
        CursorStore::new(config.state.dir.clone()),
        producer,
        config.tailer.clone(),
        &config.scanner,
    );
    // Scan failures are configuration errors and end the run
    supervisor.spawn(scanner, config.scanner.interval);

    let sender = Sender::new(
        Arc::clone(&sink),
        config.sink.topic.clone(),
        consumer,
        &config.sender,
    );
    supervisor.spawn(sender, config.sender.restart_delay);

    if config.heartbeat.enabled {
        let heartbeat = Heartbeat::new(
            Arc::clone(&sink),
            config.sink.heartbeat_topic.clone(),
            host,
            config.heartbeat.interval,
        );
        supervisor.spawn(heartbeat, config.heartbeat.restart_delay);
    }

    info!("Pipeline started, press Ctrl+C to shutdown");
    let result = supervisor.run_until(shutdown).await;
    info!("Pipeline shutdown complete");
    result.map_err(RunError::Unit)
}

/// Create every topic, retrying until the sink answers
async fn ensure_topics(sink: &dyn Sink, topics: &[String], retry_wait: Duration) {
    for topic in topics {
        while let Err(e) = sink.ensure_topic(topic).await {
            warn!(topic = %topic, error = %e, "Could not create topic, retrying");
            tokio::time::sleep(retry_wait).await;
        }
    }
}
