//! Monotonic one-shot and periodic timers whose callbacks run on the event
//! loop. Each timer is an event source plus a small tokio task that sleeps
//! and signals the source.

use std::time::Duration;

use tokio::sync::watch;

use crate::reactor::{Callback, Notifier, Ops, ReactorHandle, SourceId, SourceKind};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct TimerConfig {
    initial: Duration,
    interval: Duration,
}

impl TimerConfig {
    fn disarmed() -> Self {
        Self {
            initial: Duration::ZERO,
            interval: Duration::ZERO,
        }
    }

    fn is_disarmed(&self) -> bool {
        self.initial.is_zero() && self.interval.is_zero()
    }
}

pub struct Timer {
    source: SourceId,
    config_tx: watch::Sender<TimerConfig>,
}

impl Timer {
    /// Create a disarmed timer. `callback` runs on the event loop for every
    /// expiration.
    pub fn create<C>(
        ops: &mut Ops<C>,
        handle: &ReactorHandle,
        name: impl Into<String>,
        callback: Callback<C>,
    ) -> Self {
        let source = ops.add_source(name, SourceKind::Generic, callback);
        let notifier = handle.notifier(source);
        let (config_tx, config_rx) = watch::channel(TimerConfig::disarmed());

        tokio::spawn(run_timer(config_rx, notifier));

        Self { source, config_tx }
    }

    /// Arm or re-arm. `initial` is the delay until the first expiration
    /// (zero means one interval), `interval` the period afterwards (zero
    /// means one-shot). `(0, 0)` disarms. Re-configuration discards any
    /// pending schedule.
    pub fn configure(&self, initial: Duration, interval: Duration) -> anyhow::Result<()> {
        self.config_tx
            .send(TimerConfig { initial, interval })
            .map_err(|_| anyhow::anyhow!("timer task is gone"))
    }

    pub fn disarm(&self) -> anyhow::Result<()> {
        self.configure(Duration::ZERO, Duration::ZERO)
    }

    /// Remove the timer's event source. Dropping the timer afterwards ends
    /// its task.
    pub fn destroy<C>(&self, ops: &mut Ops<C>) {
        ops.remove_source(self.source);
    }

    pub fn source(&self) -> SourceId {
        self.source
    }
}

async fn run_timer(mut config_rx: watch::Receiver<TimerConfig>, notifier: Notifier) {
    loop {
        let config = *config_rx.borrow_and_update();

        if config.is_disarmed() {
            if config_rx.changed().await.is_err() {
                return;
            }
            continue;
        }

        let mut delay = if config.initial.is_zero() {
            config.interval
        } else {
            config.initial
        };

        loop {
            tokio::select! {
                _ = tokio::time::sleep(delay) => {
                    if !notifier.notify() {
                        return;
                    }

                    if config.interval.is_zero() {
                        // one-shot: nothing more to do until reconfigured
                        if config_rx.changed().await.is_err() {
                            return;
                        }
                        break;
                    }

                    delay = config.interval;
                }
                changed = config_rx.changed() => {
                    if changed.is_err() {
                        return;
                    }
                    break;
                }
            }
        }
    }
}
