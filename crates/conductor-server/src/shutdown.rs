//! Shutdown signalling shared by the control loop and background tasks.

use tokio::sync::watch;

/// Fires the paired [`ShutdownSignal`]s.
#[derive(Debug)]
pub struct ShutdownTrigger {
    tx: watch::Sender<bool>,
}

/// Cloneable receiver side; every clone observes the same trigger.
#[derive(Debug, Clone)]
pub struct ShutdownSignal {
    rx: watch::Receiver<bool>,
}

/// Create a connected trigger/signal pair.
pub fn channel() -> (ShutdownTrigger, ShutdownSignal) {
    let (tx, rx) = watch::channel(false);
    (ShutdownTrigger { tx }, ShutdownSignal { rx })
}

impl ShutdownTrigger {
    /// Fire the trigger. Signals subscribed afterwards observe it too.
    pub fn trigger(&self) {
        self.tx.send_replace(true);
    }

    pub fn signal(&self) -> ShutdownSignal {
        ShutdownSignal {
            rx: self.tx.subscribe(),
        }
    }
}

impl ShutdownSignal {
    /// Resolves once the trigger fires.
    ///
    /// A dropped trigger can never fire, so the future then stays pending.
    pub async fn wait(&mut self) {
        if self.rx.wait_for(|triggered| *triggered).await.is_err() {
            std::future::pending::<()>().await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test(start_paused = true)]
    async fn test_all_clones_observe_trigger() {
        let (trigger, mut signal) = channel();
        let mut first = signal.clone();
        let mut second = trigger.signal();

        let early = tokio::time::timeout(Duration::from_secs(1), signal.wait()).await;
        assert!(early.is_err());
        trigger.trigger();

        first.wait().await;
        second.wait().await;
        signal.wait().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_late_subscriber_observes_trigger() {
        let (trigger, signal) = channel();
        drop(signal);
        trigger.trigger();

        let mut late = trigger.signal();
        let waited = tokio::time::timeout(Duration::from_secs(1), late.wait()).await;
        assert!(waited.is_ok());
    }

    #[tokio::test(start_paused = true)]
    async fn test_dropped_trigger_never_fires() {
        let (trigger, mut signal) = channel();
        drop(trigger);

        let waited = tokio::time::timeout(Duration::from_secs(60), signal.wait()).await;
        assert!(waited.is_err());
    }
}
