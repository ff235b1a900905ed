use futures_util::StreamExt;
use std::sync::Arc;
use tokio::sync::watch;
use tokio::task::JoinHandle;

use crate::config::ChangeStreamConfig;
use crate::metrics::Metrics;
use crate::utils::Backoff;

use super::messaging_outbox::MessagingOutbox;
use super::repository::MessagingOutboxRepo;

/// Triggers a publish cycle as soon as a new outbox entry is inserted.
///
/// The subscription is re-established forever with capped exponential
/// backoff; the polling loop in `MessagingOutbox::start` covers any gap.
pub struct MessagingOutboxChangeStream {
    outbox: Arc<MessagingOutbox>,
    repo: Arc<dyn MessagingOutboxRepo>,
    config: ChangeStreamConfig,
    metrics: Option<Arc<Metrics>>,
}

impl MessagingOutboxChangeStream {
    pub fn new(
        outbox: Arc<MessagingOutbox>,
        repo: Arc<dyn MessagingOutboxRepo>,
        config: ChangeStreamConfig,
    ) -> Self {
        Self {
            outbox,
            repo,
            config,
            metrics: None,
        }
    }

    pub fn with_metrics(mut self, metrics: Arc<Metrics>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    pub fn start(self, shutdown: watch::Receiver<bool>) -> JoinHandle<()> {
        tokio::spawn(async move { self.run(shutdown).await })
    }

    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        let mut backoff = Backoff::new(self.config.backoff.clone());

        loop {
            if *shutdown.borrow() {
                break;
            }

            match self.repo.watch_inserts().await {
                Ok(mut inserts) => {
                    tracing::info!("👀 Watching outbox inserts");
                    loop {
                        tokio::select! {
                            changed = shutdown.changed() => {
                                if changed.is_err() || *shutdown.borrow() {
                                    tracing::info!("🛑 Outbox change stream stopped");
                                    return;
                                }
                            }
                            next = inserts.next() => match next {
                                Some(Ok(entry_id)) => {
                                    backoff.reset();
                                    tracing::debug!(entry_id = %entry_id, "Outbox insert observed");
                                    if let Err(e) = self.outbox.publish_next_unpublished_entries().await {
                                        tracing::warn!(error = %e, "Publish triggered by change stream failed");
                                    }
                                }
                                Some(Err(e)) => {
                                    tracing::warn!(error = %e, "Outbox change stream failed");
                                    break;
                                }
                                None => {
                                    tracing::warn!("Outbox change stream ended");
                                    break;
                                }
                            }
                        }
                    }
                }
                Err(e) => {
                    tracing::warn!(error = %e, "Could not subscribe to outbox inserts");
                }
            }

            if let Some(metrics) = &self.metrics {
                metrics.record_change_stream_restart();
            }

            let delay = backoff.next_delay();
            tracing::info!(
                attempt = backoff.attempts(),
                delay_ms = delay.as_millis() as u64,
                "Re-subscribing to outbox inserts after delay"
            );

            tokio::select! {
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
                _ = tokio::time::sleep(delay) => {}
            }
        }

        tracing::info!("🛑 Outbox change stream stopped");
    }
}
