//! The publishing side: fans each source record out to every queue.

use crate::{
    core::{Broker, BrokerChannel, SourceRecord},
    error::PipelineError,
    task_manager::wait_for_shutdown,
    topology::Topology,
};
use std::{collections::BTreeMap, time::Duration};
use tokio::sync::watch;
use tracing::{debug, info, instrument, warn};

/// Summary of one distribution run.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DistributionReport {
    /// Source records read.
    pub records: usize,
    /// Confirmed publishes per queue.
    pub published: BTreeMap<String, usize>,
    /// True when the run stopped early on the shutdown signal.
    pub interrupted: bool,
}

impl DistributionReport {
    pub fn total_published(&self) -> usize {
        self.published.values().sum()
    }
}

/// Publishes the projections of each record to the queues of a topology.
///
/// Owns one channel for its whole lifetime; call [`Distributor::close`] on
/// every exit path.
pub struct Distributor {
    topology: Topology,
    publish_delay: Duration,
    channel: Box<dyn BrokerChannel>,
}

impl Distributor {
    /// Opens a dedicated channel on `broker`.
    pub async fn open(
        broker: &dyn Broker,
        topology: Topology,
        publish_delay: Duration,
    ) -> Result<Self, PipelineError> {
        let channel = broker.open_channel().await?;
        Ok(Self {
            topology,
            publish_delay,
            channel,
        })
    }

    /// Declares every queue durable, deleting it first when `reset` is set.
    pub async fn prepare(&self, reset: bool) -> Result<(), PipelineError> {
        for queue in self.topology.queues() {
            if reset {
                self.channel.delete_queue(&queue.name).await?;
                info!(queue = %queue.name, "Deleted queue before publishing");
            }
            self.channel.declare_queue(&queue.name).await?;
        }
        Ok(())
    }

    /// Publishes one message per queue for each record, in record order.
    ///
    /// Stops at the first source or transport error. Messages already
    /// published stay in their queues.
    #[instrument(skip_all)]
    pub async fn distribute<I>(
        &self,
        source: I,
        mut shutdown_rx: watch::Receiver<bool>,
    ) -> Result<DistributionReport, PipelineError>
    where
        I: IntoIterator<Item = Result<SourceRecord, PipelineError>>,
    {
        let mut report = DistributionReport::default();
        for queue in self.topology.queues() {
            report.published.insert(queue.name.clone(), 0);
        }

        for record in source {
            if *shutdown_rx.borrow() {
                report.interrupted = true;
                break;
            }
            let record = record?;
            report.records += 1;

            for queue in self.topology.queues() {
                let payload = queue.projection.apply(&record);
                self.channel.publish(&queue.name, &payload).await?;
                metrics::counter!("messages_published_total", "queue" => queue.name.clone())
                    .increment(1);
                if let Some(count) = report.published.get_mut(&queue.name) {
                    *count += 1;
                }
                debug!(queue = %queue.name, "[x] Sent {}", payload);

                // An interrupted record still reaches every queue.
                if !self.publish_delay.is_zero() && !report.interrupted {
                    tokio::select! {
                        biased;
                        _ = wait_for_shutdown(&mut shutdown_rx) => {
                            report.interrupted = true;
                        }
                        _ = tokio::time::sleep(self.publish_delay) => {}
                    }
                }
            }

            if report.interrupted {
                break;
            }
        }

        if report.interrupted {
            warn!(
                records = report.records,
                published = report.total_published(),
                "Distribution interrupted"
            );
        } else {
            info!(
                records = report.records,
                published = report.total_published(),
                "Distribution complete"
            );
        }
        Ok(report)
    }

    /// Releases the distributor's channel.
    pub async fn close(self) -> Result<(), PipelineError> {
        self.channel.close().await
    }
}
