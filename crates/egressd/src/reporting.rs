//! Periodic reports to the management plane: per key statistics,
//! queue depths and daily limits. Reports are skipped until a sink
//! id has been assigned.
use crate::accounting::Accounting;
use crate::lifecycle::ShutdownSubscription;
use crate::queue_status::QueueStatus;
use crate::sender::Sender;
use crate::upstream::{ReportKind, Upstream};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::{Instant, MissedTickBehavior};

#[derive(Debug, Clone)]
pub struct ReportIntervals {
    pub stats: Duration,
    pub queue: Duration,
    pub limits: Duration,
}

impl Default for ReportIntervals {
    fn default() -> Self {
        Self {
            stats: Duration::from_secs(60),
            queue: Duration::from_secs(91),
            limits: Duration::from_secs(259),
        }
    }
}

pub struct Reporter {
    sender: Arc<Sender>,
    accounting: Arc<Accounting>,
    queue: Arc<QueueStatus>,
    upstream: Arc<dyn Upstream>,
}

impl Reporter {
    pub fn new(
        sender: Arc<Sender>,
        accounting: Arc<Accounting>,
        queue: Arc<QueueStatus>,
        upstream: Arc<dyn Upstream>,
    ) -> Self {
        Self {
            sender,
            accounting,
            queue,
            upstream,
        }
    }

    fn sink_id(&self) -> Option<String> {
        let sink_id = self.accounting.sink_id();
        (!sink_id.is_empty()).then_some(sink_id)
    }

    /// Posts and zeroes the statistics gathered since the last report.
    /// Returns false if there was nothing to send.
    pub async fn report_stats(&self) -> anyhow::Result<bool> {
        let Some(sink_id) = self.sink_id() else {
            return Ok(false);
        };
        let stats = self.accounting.take_stats();
        if stats.is_empty() {
            return Ok(false);
        }
        let count = stats.len();
        let body = serde_json::json!({ "ipstats": stats });
        self.upstream
            .post(ReportKind::Stats, &sink_id, body)
            .await?;
        tracing::debug!("posted statistics for {count} keys");
        Ok(true)
    }

    /// Posts the queue depths. Campaigns reported as complete are
    /// forgotten once the post succeeded.
    pub async fn report_queue(&self) -> anyhow::Result<bool> {
        let Some(sink_id) = self.sink_id() else {
            return Ok(false);
        };
        let msg = self.queue.report();
        let body = serde_json::to_value(&msg)?;
        self.upstream
            .post(ReportKind::Queue, &sink_id, body)
            .await?;
        if !msg.completecampaigns.is_empty() {
            tracing::debug!("campaigns complete: {:?}", msg.completecampaigns);
            self.queue.forget(&msg.completecampaigns);
        }
        Ok(true)
    }

    pub async fn report_limits(&self) -> anyhow::Result<bool> {
        let Some(sink_id) = self.sink_id() else {
            return Ok(false);
        };
        let body = serde_json::json!({ "limits": self.sender.limits_report() });
        self.upstream
            .post(ReportKind::Limits, &sink_id, body)
            .await?;
        Ok(true)
    }
}

fn ticker(period: Duration) -> tokio::time::Interval {
    let mut ticker = tokio::time::interval_at(Instant::now() + period, period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    ticker
}

pub async fn run_reporting(
    reporter: Arc<Reporter>,
    intervals: ReportIntervals,
    mut shutdown: ShutdownSubscription,
) {
    let mut stats = ticker(intervals.stats);
    let mut queue = ticker(intervals.queue);
    let mut limits = ticker(intervals.limits);

    loop {
        tokio::select! {
            _ = stats.tick() => {
                if let Err(err) = reporter.report_stats().await {
                    tracing::warn!("posting statistics: {err:#}");
                }
                crate::metrics::log_totals();
            }
            _ = queue.tick() => {
                if let Err(err) = reporter.report_queue().await {
                    tracing::warn!("posting queue status: {err:#}");
                }
            }
            _ = limits.tick() => {
                if let Err(err) = reporter.report_limits().await {
                    tracing::warn!("posting limits: {err:#}");
                }
            }
            _ = shutdown.shutting_down() => break,
        }
    }

    // statistics are not persisted, so make one last attempt
    if let Err(err) = reporter.report_stats().await {
        tracing::warn!("posting statistics: {err:#}");
    }
}
