//! Coordinates graceful shutdown of the background tasks.
//!
//! See <https://tokio.rs/tokio/topics/shutdown> for the general shape.
use tokio::sync::watch::{Receiver as WatchReceiver, Sender as WatchSender};

/// Owns the shutdown signal. Tasks obtain a [`ShutdownSubscription`]
/// and finish their current unit of work once it fires.
pub struct LifeCycle {
    tx: WatchSender<bool>,
    rx: WatchReceiver<bool>,
}

impl Default for LifeCycle {
    fn default() -> Self {
        Self::new()
    }
}

impl LifeCycle {
    pub fn new() -> Self {
        let (tx, rx) = tokio::sync::watch::channel(false);
        Self { tx, rx }
    }

    pub fn subscribe(&self) -> ShutdownSubscription {
        ShutdownSubscription {
            rx: self.rx.clone(),
        }
    }

    /// Signals every subscriber
    pub fn request_shutdown(&self) {
        tracing::info!("shutdown requested");
        self.tx.send_replace(true);
    }

    pub fn is_shutting_down(&self) -> bool {
        *self.rx.borrow()
    }
}

/// Select on your timeout and [`ShutdownSubscription::shutting_down`]
/// to wake up when either the timeout expires or the process is
/// about to shut down.
#[derive(Clone)]
pub struct ShutdownSubscription {
    rx: WatchReceiver<bool>,
}

impl ShutdownSubscription {
    /// Resolves once shutdown has been requested, including when it
    /// was requested before this call.
    pub async fn shutting_down(&mut self) {
        // An error means the LifeCycle is gone, which is as final
        // as a shutdown request.
        self.rx.wait_for(|stopping| *stopping).await.ok();
    }

    pub fn is_shutting_down(&self) -> bool {
        *self.rx.borrow()
    }
}

/// Waits for SIGTERM or ctrl-c
pub async fn wait_for_signal() -> anyhow::Result<()> {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let mut term = signal(SignalKind::terminate())?;
        tokio::select! {
            _ = term.recv() => tracing::info!("received SIGTERM"),
            res = tokio::signal::ctrl_c() => {
                res?;
                tracing::info!("received interrupt");
            }
        }
    }
    #[cfg(not(unix))]
    {
        tokio::signal::ctrl_c().await?;
        tracing::info!("received interrupt");
    }
    Ok(())
}

#[cfg(test)]
mod test {
    use super::*;

    #[tokio::test]
    async fn subscribers_observe_shutdown() {
        let life = LifeCycle::new();
        let mut early = life.subscribe();
        assert!(!early.is_shutting_down());

        let waiter = tokio::spawn(async move {
            early.shutting_down().await;
        });
        life.request_shutdown();
        waiter.await.unwrap();

        // subscribing after the fact still resolves immediately
        let mut late = life.subscribe();
        late.shutting_down().await;
        assert!(life.is_shutting_down());
    }
}
