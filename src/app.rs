//! The main application logic, decoupled from the entry point.

use crate::{
    broker::AmqpBroker,
    config::Config,
    core::{Broker, Notifier, SourceRecord},
    dispatcher::Dispatcher,
    distributor::{DistributionReport, Distributor},
    error::PipelineError,
    handlers::SinkHandler,
    notification,
    outputs::CsvSink,
    rules::AlertRule,
    task_manager::{wait_for_shutdown, TaskManager},
    topology::Topology,
};
use std::{sync::Arc, time::Duration};
use tokio::sync::watch;
use tracing::{info, instrument, warn};

/// A handle to the running consumer side, one dispatcher task per binding.
pub struct ConsumerApp {
    task_manager: TaskManager,
    broker: Arc<dyn Broker>,
}

impl ConsumerApp {
    /// Creates a new `ConsumerAppBuilder` to construct a `ConsumerApp`.
    pub fn builder(config: Config) -> ConsumerAppBuilder {
        ConsumerAppBuilder::new(config)
    }

    /// A sender-side handle that stops every dispatcher when triggered.
    pub fn shutdown_handle(&self) -> TaskManager {
        self.task_manager.clone()
    }

    /// Waits until shutdown is signalled or a dispatcher stops fatally, then
    /// waits for all dispatchers and closes the broker connection.
    pub async fn run(self) -> Result<(), PipelineError> {
        let mut shutdown_rx = self.task_manager.get_shutdown_rx();
        wait_for_shutdown(&mut shutdown_rx).await;
        info!("Shutdown signal received. Waiting for dispatchers to close...");

        let result = self.task_manager.shutdown().await;

        if let Err(e) = self.broker.close().await {
            warn!(error = %e, "Failed to close broker connection cleanly");
        }
        info!("All dispatchers shut down.");
        result
    }
}

/// Builder for the consumer application.
///
/// Allows the broker and the notification transport to be replaced in tests.
pub struct ConsumerAppBuilder {
    config: Config,
    broker_override: Option<Arc<dyn Broker>>,
    notifier_override: Option<Arc<dyn Notifier>>,
}

impl ConsumerAppBuilder {
    pub fn new(config: Config) -> Self {
        Self {
            config,
            broker_override: None,
            notifier_override: None,
        }
    }

    /// Uses `broker` instead of connecting to the configured AMQP broker.
    pub fn broker_override(mut self, broker: Arc<dyn Broker>) -> Self {
        self.broker_override = Some(broker);
        self
    }

    /// Overrides the notification transport for testing.
    pub fn notifier_override(mut self, notifier: Arc<dyn Notifier>) -> Self {
        self.notifier_override = Some(notifier);
        self
    }

    /// Validates the configuration, connects, and spawns one dispatcher per binding.
    #[instrument(skip_all)]
    pub async fn build(self) -> Result<ConsumerApp, PipelineError> {
        let config = self.config;
        config.validate()?;

        let broker: Arc<dyn Broker> = match self.broker_override {
            Some(broker) => broker,
            None => Arc::new(AmqpBroker::connect(&config.broker.amqp_uri()).await?),
        };

        let notifier = self
            .notifier_override
            .unwrap_or_else(|| notification::from_config(&config.notification));
        let rule = AlertRule::from_config(&config.alert);

        let task_manager = TaskManager::new();
        for binding in &config.dispatcher.bindings {
            let mut handler = SinkHandler::new(&binding.queue, CsvSink::new(&binding.sink_path));
            if binding.alert {
                if let Some(rule) = &rule {
                    handler = handler.with_alert(rule.clone(), notifier.clone());
                }
            }

            info!(
                queue = %binding.queue,
                sink = %binding.sink_path.display(),
                alert = binding.alert && rule.is_some(),
                "Binding queue"
            );
            let dispatcher = Dispatcher::new(
                binding.queue.clone(),
                config.dispatcher.prefetch,
                Arc::new(handler),
            );
            let broker = broker.clone();
            let shutdown_rx = task_manager.get_shutdown_rx();
            task_manager.spawn(format!("Dispatcher[{}]", binding.queue), async move {
                dispatcher.run(broker, shutdown_rx).await
            });
        }

        info!(
            dispatchers = config.dispatcher.bindings.len(),
            notifier = notifier.name(),
            "brewq consumers initialized. Waiting for messages..."
        );
        Ok(ConsumerApp {
            task_manager,
            broker,
        })
    }
}

/// Runs one distribution pass over `source`.
///
/// `topology` is the result of [`Config::validate`], obtained before the
/// broker connection was opened. Prepares the queues, publishes every
/// record and releases the channel whether or not publishing succeeded.
#[instrument(skip_all)]
pub async fn run_distribution<I>(
    config: &Config,
    topology: Topology,
    broker: &dyn Broker,
    source: I,
    shutdown_rx: watch::Receiver<bool>,
) -> Result<DistributionReport, PipelineError>
where
    I: IntoIterator<Item = Result<SourceRecord, PipelineError>>,
{
    let delay = Duration::from_millis(config.distributor.publish_delay_ms);
    let distributor = Distributor::open(broker, topology, delay).await?;

    let result = async {
        distributor.prepare(config.distributor.reset_queues).await?;
        info!(
            "Queues ready. Watch them at {}",
            config.broker.management_url()
        );
        distributor.distribute(source, shutdown_rx).await
    }
    .await;

    if let Err(e) = distributor.close().await {
        warn!(error = %e, "Failed to close distributor channel cleanly");
    }
    result
}
