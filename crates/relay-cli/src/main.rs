mod config;
mod seed;
mod telemetry;

use std::io::Write;
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use tokio::signal;
use tokio::sync::mpsc;
use tracing::{error, info, warn};

use relay_core::app::{Relay, RelayBuilder, wait_for_broker};
use relay_core::domain::{Parameters, StreamEvent, TaskEnvelope};
use relay_core::impls::{
    InMemoryBroker, InMemoryCache, InMemoryStore, OpenAiBackend, ScriptedBackend, SystemLoadSampler,
};
use relay_core::ports::{GenerationBackend, RequestStore};

use crate::config::{CliArgs, CliConfig};
use crate::seed::seed_explanations;
use crate::telemetry::init_telemetry;

const BROKER_READY_ATTEMPTS: u32 = 10;
const BROKER_READY_INTERVAL: Duration = Duration::from_secs(1);

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load from .env
    let _ = dotenvy::dotenv();
    let args = CliArgs::parse();
    let config = CliConfig::try_from(args)?;
    init_telemetry()?;

    let broker = Arc::new(InMemoryBroker::new());
    let store = Arc::new(InMemoryStore::new());
    let seeded = seed_explanations(&store).await;

    let backend: Arc<dyn GenerationBackend> = match &config.openai {
        Some(openai) => Arc::new(OpenAiBackend::with_base_url(
            openai.api_key.clone(),
            openai.base_url.clone(),
        )),
        None => {
            warn!("OPENAI_API_KEY is not set; echoing inputs back");
            Arc::new(ScriptedBackend::echo().with_fragment_delay(Duration::from_millis(30)))
        }
    };

    let mut builder = RelayBuilder::new(config.relay.clone())
        .broker(broker)
        .requests(store.clone())
        .explanations(store.clone())
        .cache(Arc::new(InMemoryCache::new(config.relay.cache_ttl)))
        .backend(backend);
    if config.controller_enabled {
        builder = builder.load_sampler(Arc::new(SystemLoadSampler::new()));
    }
    let relay = builder.build()?;

    wait_for_broker(
        relay.broker.as_ref(),
        &relay.config.queues.task_queue,
        BROKER_READY_ATTEMPTS,
        BROKER_READY_INTERVAL,
    )
    .await?;

    info!(
        task_queue = %relay.config.queues.task_queue,
        capacity = relay.gate.capacity(),
        max = relay.gate.max(),
        controller = config.controller_enabled,
        explanations = seeded,
        "relay started"
    );
    let group = relay.start();

    let failed = tokio::select! {
        failed = run_session(&relay, store.as_ref(), &config) => failed,
        _ = signal::ctrl_c() => {
            warn!("interrupted; shutting down");
            0
        }
    };

    println!("{}", serde_json::to_string_pretty(&group.status())?);
    group.shutdown_and_join().await?;

    if failed > 0 {
        anyhow::bail!("{failed} of {} requests failed", config.inputs.len());
    }
    Ok(())
}

/// Submit every input in turn and stream its fragments to stdout. Returns the failure count.
async fn run_session(relay: &Relay, store: &dyn RequestStore, config: &CliConfig) -> usize {
    let parameters: Parameters = config.params.iter().cloned().collect();
    let mut failed = 0;

    for input in &config.inputs {
        let request_id = match store.create_request(input, &parameters, &config.model).await {
            Ok(id) => id,
            Err(e) => {
                error!(error = %e, "could not create request");
                failed += 1;
                continue;
            }
        };
        let task = parameters.iter().fold(
            TaskEnvelope::new(request_id, input.as_str(), config.model.as_str()),
            |task, (scale, value)| task.with_parameter(scale.as_str(), *value),
        );

        let (tx, mut rx) = mpsc::channel(32);
        let printer = tokio::spawn(async move {
            let mut stdout = std::io::stdout();
            while let Some(event) = rx.recv().await {
                match event {
                    Ok(StreamEvent::Fragment(text)) => {
                        let _ = write!(stdout, "{text}");
                        let _ = stdout.flush();
                    }
                    Ok(StreamEvent::Final(_)) => {
                        let _ = writeln!(stdout);
                    }
                    Err(_) => {}
                }
            }
        });

        let result = relay.dispatcher.submit_and_stream(task, tx).await;
        if let Err(e) = printer.await {
            warn!(error = %e, "stdout printer stopped");
        }

        match result {
            Ok(text) => info!(request_id = %request_id, chars = text.chars().count(), "request completed"),
            Err(e) => {
                error!(request_id = %request_id, error = %e, "request failed");
                failed += 1;
            }
        }
    }
    failed
}
