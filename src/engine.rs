//! Wiring of store, metamodel and processor for the demo engine.

use std::sync::Arc;

use anyhow::{Context, Result};
use tokio::sync::broadcast::error::RecvError;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use drover_demo::{demo_metamodel, demo_types, seed_namespace};
use drover_objectbase::{
    IdMapping, IdentityMapping, InMemoryObjectbase, MappedObjectbase, NamespacePrefixMapping,
    Objectbase, TracingObjectbase,
};
use drover_processing::{EngineConfig, Processor};

use crate::cli::Cli;

/// Engine configuration from `--config`, else from the environment.
///
/// # Errors
///
/// Returns an error if the file cannot be read or parsed, or the resulting
/// configuration is invalid.
pub fn load_config(cli: &Cli) -> Result<EngineConfig> {
    let config = match &cli.config {
        Some(path) => EngineConfig::from_file(path)
            .with_context(|| format!("Failed to load config from {}", path.display()))?,
        None => EngineConfig::from_env(),
    };
    config.validate().context("Invalid engine configuration")?;
    Ok(config)
}

/// The traced store the engine works on, mapped below the configured
/// namespace prefix.
#[must_use]
pub fn build_store(memory: Arc<InMemoryObjectbase>, config: &EngineConfig) -> Arc<dyn Objectbase> {
    let mapping: Arc<dyn IdMapping> = if config.namespace_prefix.is_empty() {
        Arc::new(IdentityMapping)
    } else {
        Arc::new(NamespacePrefixMapping::new(config.namespace_prefix.clone()))
    };
    Arc::new(TracingObjectbase::new(MappedObjectbase::new(memory, mapping)))
}

/// A started demo engine.
pub struct DemoEngine {
    pub processor: Processor,
    /// The engine's view of the store.
    pub store: Arc<dyn Objectbase>,
    /// The backing store in technical ids.
    pub memory: Arc<InMemoryObjectbase>,
    printer: Option<JoinHandle<()>>,
}

impl DemoEngine {
    /// Build and start the engine; seed a namespace if asked to.
    ///
    /// # Errors
    ///
    /// Returns an error if the metamodel does not compile, the engine fails
    /// to start or seeding fails.
    pub async fn start(config: EngineConfig, seed: Option<&str>, watch: bool) -> Result<Self> {
        let types = demo_types();
        let metamodel = Arc::new(demo_metamodel(&types).context("Demo metamodel is invalid")?);
        let memory = InMemoryObjectbase::new_arc(types.scheme().clone());
        let store = build_store(Arc::clone(&memory), &config);

        let processor = Processor::new(Arc::clone(&store), metamodel, types, config)
            .context("Failed to create processor")?;
        let printer = watch.then(|| spawn_printer(&processor));
        processor.start().await.context("Failed to start processor")?;
        info!(metamodel = processor.metamodel().name(), "Engine started");

        if let Some(namespace) = seed {
            seed_namespace(store.as_ref(), namespace)
                .await
                .with_context(|| format!("Failed to seed namespace {namespace}"))?;
        }

        Ok(Self {
            processor,
            store,
            memory,
            printer,
        })
    }

    pub async fn shutdown(self) {
        self.processor.shutdown().await;
        if let Some(printer) = self.printer {
            printer.abort();
        }
        info!("Engine stopped");
    }
}

fn spawn_printer(processor: &Processor) -> JoinHandle<()> {
    let mut events = processor.subscribe();
    tokio::spawn(async move {
        loop {
            match events.recv().await {
                Ok(event) => match serde_json::to_string(&event) {
                    Ok(line) => println!("{line}"),
                    Err(e) => warn!(error = %e, "Failed to render watch event"),
                },
                Err(RecvError::Lagged(skipped)) => {
                    warn!(skipped, "Watch printer lagged behind");
                }
                Err(RecvError::Closed) => {
                    debug!("Watch feed closed");
                    return;
                }
            }
        }
    })
}
