//! Periodic sync cycle over the monitored channels.
//!
//! Each cycle reads the latest messages of every channel through the
//! access probe, so a read doubles as a permission check. Blacklisted
//! channels are skipped without any request. Fetched messages go to the
//! same [`EventHandler`] as gateway events.

use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use super::access::{ChannelAccessProbe, ProbeOutcome};
use crate::gateway::EventHandler;

/// Counts from one poll cycle.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PollReport {
    pub checked: usize,
    pub skipped: usize,
    pub denied: usize,
    pub inconclusive: usize,
    pub delivered: usize,
}

pub struct ChannelPoller {
    probe: Arc<ChannelAccessProbe>,
    handler: Arc<dyn EventHandler>,
    channel_ids: Vec<String>,
    interval: Duration,
}

impl ChannelPoller {
    pub fn new(
        probe: Arc<ChannelAccessProbe>,
        handler: Arc<dyn EventHandler>,
        channel_ids: Vec<String>,
        interval: Duration,
    ) -> Self {
        Self {
            probe,
            handler,
            channel_ids,
            interval,
        }
    }

    /// Run cycles every `interval` until `cancel` fires.
    pub fn spawn(self, cancel: CancellationToken) -> JoinHandle<()> {
        tokio::spawn(async move {
            info!(
                channels = self.channel_ids.len(),
                interval_secs = self.interval.as_secs(),
                "Channel poller started"
            );
            let mut tick = tokio::time::interval(self.interval.max(Duration::from_millis(10)));
            tick.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => {
                        info!("Channel poller shutting down");
                        return;
                    }
                    _ = tick.tick() => {
                        let report = self.poll_once().await;
                        debug!(?report, "Channel poll cycle complete");
                    }
                }
            }
        })
    }

    pub async fn poll_once(&self) -> PollReport {
        let registry = self.probe.registry();
        let mut report = PollReport::default();

        for channel_id in &self.channel_ids {
            if registry.is_blacklisted(channel_id) {
                report.skipped += 1;
                debug!(channel_id, "Skipping blacklisted channel");
                continue;
            }
            report.checked += 1;

            match self.probe.check(channel_id).await {
                ProbeOutcome::Accessible(messages) => {
                    // Oldest first.
                    for message in messages.into_iter().rev() {
                        self.handler.on_event(message.into_event()).await;
                        report.delivered += 1;
                    }
                }
                ProbeOutcome::Denied { .. } => report.denied += 1,
                ProbeOutcome::Inconclusive(_) => report.inconclusive += 1,
            }
        }
        report
    }
}
