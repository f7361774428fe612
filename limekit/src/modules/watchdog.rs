//! Remote-ping idle watchdog.
//!
//! Once the session is established, the watchdog sends periodic ping
//! requests and tracks inbound activity. Every received envelope resets
//! the activity clock; when nothing arrives within the idle timeout, the
//! channel is closed with an idle failure.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};
use uuid::Uuid;

use super::{ChannelModule, ModuleFuture, ModuleOutcome};
use crate::channel::{ChannelError, PipelineFailure, SenderHandle};
use crate::envelope::{Command, CommandMethod, Envelope, SessionState};

use super::ping::PING_URI;

/// Sends periodic pings and closes the channel when the peer goes idle.
pub struct RemotePingWatchdog {
    sender: SenderHandle,
    ping_interval: Duration,
    idle_timeout: Option<Duration>,
    last_activity_ms: Arc<AtomicU64>,
    failures: mpsc::UnboundedSender<PipelineFailure>,
    shutdown: CancellationToken,
    started: AtomicBool,
}

impl RemotePingWatchdog {
    pub(crate) fn new(
        sender: SenderHandle,
        ping_interval: Duration,
        idle_timeout: Option<Duration>,
        failures: mpsc::UnboundedSender<PipelineFailure>,
        shutdown: CancellationToken,
    ) -> Self {
        Self {
            sender,
            ping_interval,
            idle_timeout,
            last_activity_ms: Arc::new(AtomicU64::new(now_ms())),
            failures,
            shutdown,
            started: AtomicBool::new(false),
        }
    }

    fn touch(&self) {
        self.last_activity_ms.store(now_ms(), Ordering::Relaxed);
    }

    fn spawn_pinger(&self) {
        let sender = self.sender.clone();
        let ping_interval = self.ping_interval;
        let idle_timeout = self.idle_timeout;
        let last_activity_ms = Arc::clone(&self.last_activity_ms);
        let failures = self.failures.clone();
        let shutdown = self.shutdown.clone();

        tokio::spawn(async move {
            let start = tokio::time::Instant::now() + ping_interval;
            let mut interval = tokio::time::interval_at(start, ping_interval);
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

            debug!(
                interval_ms = ping_interval.as_millis() as u64,
                "Remote-ping watchdog started"
            );

            loop {
                tokio::select! {
                    biased;
                    _ = shutdown.cancelled() => break,
                    _ = interval.tick() => {}
                }

                if let Some(idle_timeout) = idle_timeout {
                    let idle_ms =
                        now_ms().saturating_sub(last_activity_ms.load(Ordering::Relaxed));
                    if idle_ms > idle_timeout.as_millis() as u64 {
                        warn!(
                            idle_ms,
                            idle_timeout_ms = idle_timeout.as_millis() as u64,
                            "No envelope received within idle timeout; closing channel"
                        );
                        let _ = failures.send(PipelineFailure::consumer(
                            ChannelError::RemoteIdle(idle_timeout),
                        ));
                        break;
                    }
                }

                let ping = Command::request(CommandMethod::Get, PING_URI)
                    .with_id(Uuid::new_v4().to_string());
                if sender.send_detached(ping.into()).await.is_err() {
                    // Send pipeline is gone; the channel is closing.
                    break;
                }
            }

            debug!("Remote-ping watchdog stopped");
        });
    }
}

impl ChannelModule for RemotePingWatchdog {
    fn name(&self) -> &str {
        "remote-ping-watchdog"
    }

    fn on_state_changed(&self, state: SessionState) -> ModuleFuture<'_, ()> {
        if state.is_established() && !self.started.swap(true, Ordering::SeqCst) {
            self.touch();
            self.spawn_pinger();
        }
        Box::pin(async {})
    }

    fn on_receiving(&self, envelope: Envelope) -> ModuleFuture<'_, ModuleOutcome> {
        self.touch();
        Box::pin(async move { Ok(Some(envelope)) })
    }
}

fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}
