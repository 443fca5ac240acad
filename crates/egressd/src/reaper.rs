//! Periodic housekeeping of the sender: lifts expired deferrals,
//! closes idle connections and flushes state changes that were not
//! persisted immediately.
use crate::lifecycle::ShutdownSubscription;
use crate::sender::Sender;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::{Instant, MissedTickBehavior};

const MINUTE: Duration = Duration::from_secs(60);

#[derive(Debug, Clone)]
pub struct ReaperConfig {
    pub interval: Duration,
    /// Idle connections older than this are closed
    pub idle_timeout: Duration,
    /// Enables deferral of keys whose delivery rate is too low
    pub rate_deferral: bool,
}

impl Default for ReaperConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(1),
            idle_timeout: Duration::from_secs(4),
            rate_deferral: false,
        }
    }
}

pub async fn run_reaper(
    sender: Arc<Sender>,
    config: ReaperConfig,
    mut shutdown: ShutdownSubscription,
) {
    let idle_timeout = match chrono::Duration::from_std(config.idle_timeout) {
        Ok(timeout) => timeout,
        Err(err) => {
            tracing::error!("idle timeout {:?} is out of range: {err}", config.idle_timeout);
            return;
        }
    };

    let mut ticker = tokio::time::interval(config.interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    let mut last_broadcast = Instant::now();

    loop {
        tokio::select! {
            _ = ticker.tick() => {}
            _ = shutdown.shutting_down() => break,
        }

        let minute_elapsed = last_broadcast.elapsed() >= MINUTE;
        if minute_elapsed {
            last_broadcast = Instant::now();
        }
        if sender.sweep(idle_timeout, config.rate_deferral, minute_elapsed) {
            tracing::trace!("reaper woke blocked callers");
        }
    }

    tracing::debug!("reaper stopped");
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::classify::{ConnResult, ResultKind};
    use crate::lifecycle::LifeCycle;
    use crate::limits::DeferReason;
    use crate::sender::test::{basic_update, harness, open, t0, TestRecipient};

    #[tokio::test(start_paused = true)]
    async fn lifts_deferrals_and_closes_idle_connections() {
        let h = harness();
        h.sender.set_settings(basic_update(2));
        let rcpt = TestRecipient::new("bob@example.com");

        let mut grant = h.sender.get_conn("p1", &rcpt, 0).await.unwrap();
        open(&mut grant.conn);
        let ip = grant.conn.ip.clone();
        h.sender
            .process_result(&grant.lease, Some(grant.conn), &ConnResult::delivered(), false);

        let other = h.sender.get_conn("p1", &rcpt, 0).await.unwrap();
        assert_ne!(other.conn.ip, ip);
        let key = other.lease.key.clone();
        let failure = ConnResult {
            kind: ResultKind::Deferred,
            defer: Some(DeferReason::Default),
            message: "421 try later".to_string(),
            log_defer: true,
            retry: true,
            next_mx: false,
            stat: None,
        };
        h.sender.process_result(&other.lease, None, &failure, false);
        assert_eq!(
            h.sender.limits("p1", &key).unwrap().defer_until,
            Some(t0() + chrono::Duration::seconds(60))
        );

        let life = LifeCycle::new();
        let task = tokio::spawn(run_reaper(
            h.sender.clone(),
            ReaperConfig::default(),
            life.subscribe(),
        ));

        // a few passes with the clock standing still change nothing
        tokio::time::sleep(Duration::from_secs(3)).await;
        assert!(h.sender.limits("p1", &key).unwrap().defer_until.is_some());
        let idle: usize = h.sender.pool_status("p1").iter().map(|p| p.idle).sum();
        assert_eq!(idle, 1);

        h.advance(chrono::Duration::seconds(61));
        tokio::time::sleep(Duration::from_secs(2)).await;
        assert_eq!(h.sender.limits("p1", &key).unwrap().defer_until, None);
        let idle: usize = h.sender.pool_status("p1").iter().map(|p| p.idle).sum();
        assert_eq!(idle, 0);

        life.request_shutdown();
        task.await.unwrap();
    }
}
