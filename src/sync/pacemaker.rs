use crate::error::{Error, Result};
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Notify;
use tokio::time::MissedTickBehavior;

/// Periodic heartbeat driver with liveness detection.
///
/// Construct with [`Pacemaker::new`], take an [`EchoHandle`] to hand to the
/// gateway's read loop and a [`StopHandle`] to request shutdown, then drive
/// the loop with [`Pacemaker::run`] (typically inside `tokio::spawn`).
pub struct Pacemaker {
    heartrate: Duration,
    started: Instant,
    sent_at: Arc<AtomicInstant>,
    echo_at: Arc<AtomicInstant>,
    stop: Arc<Notify>,
}

/// Epoch-millis-since-start timestamp stored atomically; zero means "never".
struct AtomicInstant {
    millis: AtomicU64,
}

impl AtomicInstant {
    fn new() -> Self {
        AtomicInstant {
            millis: AtomicU64::new(0),
        }
    }

    fn mark(&self, started: Instant, now: Instant) {
        let elapsed = now.saturating_duration_since(started).as_millis() as u64;
        // never store 0 for a real mark so that "zero" unambiguously means "never set"
        self.millis.store(elapsed.max(1), Ordering::SeqCst);
    }

    fn get(&self) -> Option<Duration> {
        let millis = self.millis.load(Ordering::SeqCst);
        if millis == 0 {
            None
        } else {
            Some(Duration::from_millis(millis))
        }
    }
}

impl Pacemaker {
    /// Create a pacemaker. An initial echo is recorded immediately so the
    /// first tick isn't judged against a nonexistent prior heartbeat.
    pub fn new(heartrate: Duration) -> Self {
        let started = Instant::now();
        let echo_at = Arc::new(AtomicInstant::new());
        echo_at.mark(started, started);

        Pacemaker {
            heartrate,
            started,
            sent_at: Arc::new(AtomicInstant::new()),
            echo_at,
            stop: Arc::new(Notify::new()),
        }
    }

    pub fn heartrate(&self) -> Duration {
        self.heartrate
    }

    /// A handle usable to acknowledge heartbeats from the gateway's read loop.
    pub fn echo_handle(&self) -> EchoHandle {
        EchoHandle {
            started: self.started,
            echo_at: self.echo_at.clone(),
        }
    }

    /// A handle usable to idempotently request pacemaker shutdown.
    pub fn stop_handle(&self) -> StopHandle {
        StopHandle {
            stop: self.stop.clone(),
        }
    }

    /// Run the loop to completion: invoke `pace` once per heartrate tick;
    /// its failure terminates the loop immediately. Terminates with
    /// [`Error::PacemakerDead`] if no echo arrives within `2 * heartrate` of
    /// the most recent send, and cleanly (`Ok(())`) once `stop()` is called.
    pub async fn run<F, Fut>(&self, mut pace: F) -> Result<()>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<()>>,
    {
        let mut interval = tokio::time::interval(self.heartrate);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
        interval.tick().await; // consume the immediate first tick

        loop {
            tokio::select! {
                _ = self.stop.notified() => return Ok(()),
                _ = interval.tick() => {
                    pace().await?;

                    let now = Instant::now();
                    self.sent_at.mark(self.started, now);

                    let sent = self.sent_at.get().unwrap();
                    if let Some(echoed) = self.echo_at.get() {
                        if sent > echoed && sent - echoed > self.heartrate * 2 {
                            return Err(Error::PacemakerDead);
                        }
                    }
                }
            }
        }
    }
}

/// Handle passed to the gateway read loop so it can acknowledge heartbeats
/// without holding a reference to the pacemaker itself.
#[derive(Clone)]
pub struct EchoHandle {
    started: Instant,
    echo_at: Arc<AtomicInstant>,
}

impl EchoHandle {
    pub fn echo(&self) {
        self.echo_at.mark(self.started, Instant::now());
    }
}

/// Handle usable to idempotently request pacemaker shutdown.
#[derive(Clone)]
pub struct StopHandle {
    stop: Arc<Notify>,
}

impl StopHandle {
    /// Safe to call multiple times, including after the loop already exited.
    pub fn stop(&self) {
        self.stop.notify_one();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    #[tokio::test]
    async fn stop_terminates_the_loop_cleanly() {
        let pm = Pacemaker::new(Duration::from_millis(10));
        let stop = pm.stop_handle();
        stop.stop();

        let result = tokio::time::timeout(Duration::from_secs(1), pm.run(|| async { Ok(()) }))
            .await
            .expect("run should return promptly after stop()");
        assert!(result.is_ok());
    }

    #[tokio::test]
    async fn healthy_echoes_keep_the_loop_alive() {
        let pm = Pacemaker::new(Duration::from_millis(15));
        let echo = pm.echo_handle();
        let stop = pm.stop_handle();
        let sends = Arc::new(AtomicUsize::new(0));

        let runner = async {
            let sends = sends.clone();
            pm.run(move || {
                echo.echo();
                let sends = sends.clone();
                async move {
                    sends.fetch_add(1, Ordering::SeqCst);
                    Ok(())
                }
            })
            .await
        };

        tokio::select! {
            _ = runner => {},
            _ = tokio::time::sleep(Duration::from_millis(80)) => { stop.stop(); }
        }

        assert!(sends.load(Ordering::SeqCst) >= 2);
    }

    #[tokio::test]
    async fn dead_echo_terminates_with_pacemaker_dead() {
        let pm = Pacemaker::new(Duration::from_millis(10));

        let result = tokio::time::timeout(Duration::from_secs(2), pm.run(|| async { Ok(()) }))
            .await
            .expect("pacemaker should self-terminate");

        assert!(matches!(result, Err(Error::PacemakerDead)));
    }
}
