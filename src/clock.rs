//! Wall-clock watermark driver
//!
//! For live evaluation a background thread advances every topic's watermark
//! to `now - grace_ms` once per tick. Replay and backfill runs skip the
//! driver and call `advance_watermark` directly. The thread is joined on
//! `stop()` or drop, so no work outlives the driver.

use crate::config::ClockConfig;
use crate::error::TopicError;
use crate::registry::TopicRegistry;
use crate::types::Millis;
use chrono::Utc;
use log::{debug, info};
use parking_lot::{Condvar, Mutex};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

struct StopSignal {
    stopped: Mutex<bool>,
    wake: Condvar,
}

/// Background thread advancing watermarks from a clock
pub struct ClockDriver {
    signal: Arc<StopSignal>,
    thread: Option<JoinHandle<u64>>,
}

impl ClockDriver {
    /// Drive `registry` from the system clock
    pub fn spawn(registry: Arc<TopicRegistry>, config: ClockConfig) -> Result<Self, TopicError> {
        Self::spawn_with_clock(registry, config, || Utc::now().timestamp_millis())
    }

    /// Drive `registry` from a custom clock
    pub fn spawn_with_clock<F>(
        registry: Arc<TopicRegistry>,
        config: ClockConfig,
        now: F,
    ) -> Result<Self, TopicError>
    where
        F: Fn() -> Millis + Send + 'static,
    {
        let signal = Arc::new(StopSignal {
            stopped: Mutex::new(false),
            wake: Condvar::new(),
        });
        let tick = Duration::from_millis(config.tick_ms.max(1));
        let grace = config.grace_ms;

        let thread_signal = Arc::clone(&signal);
        let thread = thread::Builder::new()
            .name("topic-watch-clock".to_string())
            .spawn(move || {
                info!("clock driver started (tick {:?}, grace {}ms)", tick, grace);
                let mut ticks = 0u64;
                loop {
                    {
                        let mut stopped = thread_signal.stopped.lock();
                        if !*stopped {
                            thread_signal.wake.wait_for(&mut stopped, tick);
                        }
                        if *stopped {
                            break;
                        }
                    }
                    ticks += 1;
                    let watermark = now().saturating_sub(grace);
                    let published = registry.advance_all(watermark);
                    if !published.is_empty() {
                        debug!(
                            "clock tick {} at {} published {} event(s)",
                            ticks,
                            watermark,
                            published.len()
                        );
                    }
                }
                info!("clock driver stopped after {} tick(s)", ticks);
                ticks
            })
            .map_err(|e| TopicError::Resource(format!("cannot spawn clock thread: {e}")))?;

        Ok(Self {
            signal,
            thread: Some(thread),
        })
    }

    /// Stop the thread and wait for it; returns the number of ticks run
    pub fn stop(mut self) -> u64 {
        self.shutdown()
    }

    fn shutdown(&mut self) -> u64 {
        *self.signal.stopped.lock() = true;
        self.signal.wake.notify_all();
        self.thread
            .take()
            .and_then(|thread| thread.join().ok())
            .unwrap_or(0)
    }
}

impl Drop for ClockDriver {
    fn drop(&mut self) {
        if self.thread.is_some() {
            self.shutdown();
        }
    }
}
