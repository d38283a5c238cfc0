//! kubehandler demo - logs pod lifecycle events.
//!
//! Runs a logging handler over an in-memory pod informer fed with synthetic
//! changes. Stop with Ctrl+C; a second Ctrl+C exits immediately.

use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use kubehandler::{
    Config, DefaultHandler, EventLoop, Handler, HandlerResult, MemoryInformer, ObjectKey,
};
use serde_json::json;
use tokio_util::sync::CancellationToken;

#[derive(Parser, Debug)]
#[command(name = "kubehandler-demo")]
#[command(about = "Log pod add/update/delete events through a kubehandler event loop")]
#[command(version = env!("CARGO_PKG_VERSION"))]
struct Args {
    /// Number of concurrent workers (overrides the config file)
    #[arg(short, long)]
    workers: Option<usize>,

    /// Path to a JSON config file
    #[arg(short, long, env = "KUBEHANDLER_CONFIG")]
    config: Option<PathBuf>,

    /// Milliseconds between synthetic pod changes
    #[arg(long, default_value_t = 1000)]
    churn_ms: u64,
}

#[derive(Debug)]
struct PodLogger {
    base: DefaultHandler,
    pods: Arc<MemoryInformer>,
}

impl PodLogger {
    fn phase(&self, namespace: &str, name: &str) -> String {
        self.pods
            .get(&ObjectKey::new(namespace, name))
            .and_then(|pod| pod["status"]["phase"].as_str().map(str::to_string))
            .unwrap_or_else(|| "Unknown".to_string())
    }
}

#[async_trait]
impl Handler for PodLogger {
    fn name(&self) -> &str {
        "PodLogger"
    }

    fn kind(&self) -> &str {
        "Pod"
    }

    fn base(&self) -> Option<&DefaultHandler> {
        Some(&self.base)
    }

    async fn on_add(&self, namespace: &str, name: &str) -> HandlerResult {
        tracing::info!(
            "Pod {} added in namespace {} (phase {})",
            name,
            namespace,
            self.phase(namespace, name)
        );
        Ok(())
    }

    async fn on_update(&self, namespace: &str, name: &str) -> HandlerResult {
        tracing::info!(
            "Pod {} updated in namespace {} (phase {})",
            name,
            namespace,
            self.phase(namespace, name)
        );
        Ok(())
    }

    async fn on_delete(&self, namespace: &str, name: &str) -> HandlerResult {
        tracing::info!("Pod {} deleted from namespace {}", name, namespace);
        Ok(())
    }
}

fn pod(name: &str, phase: &str) -> serde_json::Value {
    json!({
        "kind": "Pod",
        "metadata": { "namespace": "default", "name": name },
        "status": { "phase": phase }
    })
}

/// Seed the cache, mark it synced, then cycle pods until stopped.
async fn churn(pods: Arc<MemoryInformer>, every: Duration, stop: CancellationToken) {
    const PHASES: [&str; 3] = ["Pending", "Running", "Succeeded"];

    for i in 0..3 {
        if let Err(e) = pods.upsert(pod(&format!("web-{}", i), "Pending")) {
            tracing::warn!(error = %e, "Failed to seed pod");
        }
    }
    pods.mark_synced();

    let mut ticker = tokio::time::interval(every);
    ticker.tick().await;
    let mut step = 0usize;
    loop {
        tokio::select! {
            biased;
            _ = stop.cancelled() => break,
            _ = ticker.tick() => {}
        }

        step += 1;
        let name = format!("web-{}", step % 3);
        let phase = PHASES[step % PHASES.len()];
        let result = if phase == "Succeeded" {
            pods.remove(&ObjectKey::new("default", &name));
            pods.upsert(pod(&name, "Pending"))
        } else {
            pods.upsert(pod(&name, phase))
        };
        if let Err(e) = result {
            tracing::warn!(error = %e, "Failed to apply synthetic change");
        }
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();

    // Load configuration
    let config = match &args.config {
        Some(path) => Config::from_file(path)?,
        None => Config::default(),
    };
    let workers = args.workers.unwrap_or(config.event_loop.workers);

    // Initialize observability
    kubehandler::observability::init_tracing(&config.observability);

    let stop = kubehandler::setup_signal_handler()?;

    let pods = Arc::new(MemoryInformer::new());
    let event_loop = EventLoop::with_config("logger_queue", config);
    event_loop.register(Arc::new(PodLogger {
        base: DefaultHandler::new(pods.clone()),
        pods: pods.clone(),
    }));

    tracing::info!(workers, "Starting kubehandler demo");
    let feeder = tokio::spawn(churn(
        pods,
        Duration::from_millis(args.churn_ms.max(1)),
        stop.clone(),
    ));

    event_loop.run(workers, stop).await?;
    feeder.await?;

    let stats = event_loop.queue().stats();
    tracing::info!(
        processed = stats.processed,
        coalesced = stats.coalesced,
        dropped = stats.dropped,
        "Demo shut down"
    );
    Ok(())
}
