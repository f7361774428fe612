//! The receive pipeline.
//!
//! Two tasks chained by a bounded intake buffer:
//!
//! ```text
//! transport --receive--> read loop --intake--> demux --modules--> {MsgQ, NotifQ, CmdQ, SessQ}
//!                                                        \
//!                                                         -> correlator (command responses)
//! ```
//!
//! Backpressure flows backwards: a ready queue the application does not
//! drain fills the intake buffer, which parks the read loop, which stops
//! reading from the transport. The consume timeout converts a stuck
//! consumer into a channel failure instead of unbounded blocking.
//!
//! Per envelope kind, delivery order equals transport arrival order.
//! Cross-kind ordering is not preserved.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::correlator::CommandCorrelator;
use super::error::{ChannelError, QueueDepths};
use super::events::PipelineFailure;
use super::queue::{envelope_queue, QueueReceiver, QueueSender};
use crate::envelope::{Command, Envelope, Message, Notification, Session};
use crate::modules::{apply_on_receiving, ChannelModules};
use crate::transport::Transport;

/// Producer halves of the per-kind ready queues.
pub(crate) struct ReadySenders {
    message: QueueSender<Message>,
    notification: QueueSender<Notification>,
    command: QueueSender<Command>,
    session: QueueSender<Session>,
}

impl Clone for ReadySenders {
    fn clone(&self) -> Self {
        Self {
            message: self.message.clone(),
            notification: self.notification.clone(),
            command: self.command.clone(),
            session: self.session.clone(),
        }
    }
}

impl ReadySenders {
    /// Snapshot of the per-kind queue depths for diagnostics.
    pub(crate) fn depths(&self) -> QueueDepths {
        QueueDepths {
            messages: self.message.depth(),
            notifications: self.notification.depth(),
            commands: self.command.depth(),
            sessions: self.session.depth(),
        }
    }
}

/// Consumer halves of the per-kind ready queues.
///
/// Each receiver sits behind a mutex: concurrent `receive_*` callers of
/// the same kind serialize on the lock and each envelope is delivered to
/// exactly one of them.
pub(crate) struct ReadyReceivers {
    pub(crate) message: Mutex<QueueReceiver<Message>>,
    pub(crate) notification: Mutex<QueueReceiver<Notification>>,
    pub(crate) command: Mutex<QueueReceiver<Command>>,
    pub(crate) session: Mutex<QueueReceiver<Session>>,
}

/// Creates the four ready queues; a capacity of zero means unbounded.
pub(crate) fn ready_queues(capacity: usize) -> (ReadySenders, ReadyReceivers) {
    let (message_tx, message_rx) = envelope_queue(capacity);
    let (notification_tx, notification_rx) = envelope_queue(capacity);
    let (command_tx, command_rx) = envelope_queue(capacity);
    let (session_tx, session_rx) = envelope_queue(capacity);

    (
        ReadySenders {
            message: message_tx,
            notification: notification_tx,
            command: command_tx,
            session: session_tx,
        },
        ReadyReceivers {
            message: Mutex::new(message_rx),
            notification: Mutex::new(notification_rx),
            command: Mutex::new(command_rx),
            session: Mutex::new(session_rx),
        },
    )
}

/// Spawns the transport read loop.
///
/// The loop owns the intake sender; when it exits, the demux task drains
/// whatever is buffered and then stops.
pub(crate) fn spawn_read_loop<T: Transport>(
    transport: Arc<T>,
    intake: QueueSender<Envelope>,
    ready: ReadySenders,
    consume_timeout: Option<Duration>,
    stop: CancellationToken,
    failures: mpsc::UnboundedSender<PipelineFailure>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        debug!("Transport read loop started");

        loop {
            let received = tokio::select! {
                biased;
                _ = stop.cancelled() => break,
                received = transport.receive() => received,
            };

            let envelope = match received {
                Ok(Some(envelope)) => envelope,
                Ok(None) => {
                    info!("Transport reached end-of-stream; closing channel");
                    let _ = failures.send(PipelineFailure::remote_eof());
                    break;
                }
                Err(err) => {
                    warn!(error = %err, "Transport receive failed; closing channel");
                    let _ = failures.send(PipelineFailure::consumer(ChannelError::Transport(err)));
                    break;
                }
            };

            if enqueue_intake(&intake, envelope, &ready, consume_timeout, &stop, &failures)
                .await
                .is_err()
            {
                break;
            }
        }

        debug!("Transport read loop stopped");
    })
}

/// Enqueues one envelope into the intake buffer, bounded by the consume
/// timeout when one is configured.
async fn enqueue_intake(
    intake: &QueueSender<Envelope>,
    envelope: Envelope,
    ready: &ReadySenders,
    consume_timeout: Option<Duration>,
    stop: &CancellationToken,
    failures: &mpsc::UnboundedSender<PipelineFailure>,
) -> Result<(), ()> {
    let send = intake.send(envelope);

    let result = match consume_timeout {
        Some(timeout) => {
            tokio::select! {
                biased;
                _ = stop.cancelled() => return Err(()),
                sent = tokio::time::timeout(timeout, send) => match sent {
                    Ok(sent) => sent,
                    Err(_elapsed) => {
                        let depths = ready.depths();
                        warn!(
                            timeout_ms = timeout.as_millis() as u64,
                            %depths,
                            "Envelope consumer timed out; closing channel"
                        );
                        let _ = failures.send(PipelineFailure::consumer(
                            ChannelError::ConsumeTimeout { timeout, depths },
                        ));
                        return Err(());
                    }
                },
            }
        }
        None => {
            tokio::select! {
                biased;
                _ = stop.cancelled() => return Err(()),
                sent = send => sent,
            }
        }
    };

    result.map_err(|_| ())
}

/// Spawns the demux stage: pulls from the intake buffer, runs the
/// receive-side modules, and routes each surviving envelope.
pub(crate) fn spawn_demux_loop(
    mut intake: QueueReceiver<Envelope>,
    modules: Arc<ChannelModules>,
    correlator: Arc<CommandCorrelator>,
    ready: ReadySenders,
    consumer: CancellationToken,
    failures: mpsc::UnboundedSender<PipelineFailure>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        debug!("Demux stage started");

        while let Some(envelope) = intake.recv().await {
            let snapshot = modules.registry_for(&envelope).snapshot();

            let envelope = match apply_on_receiving(&snapshot, envelope, &consumer).await {
                Ok(Some(envelope)) => envelope,
                Ok(None) => continue,
                Err(err) => {
                    warn!(error = %err, "Receive module failed; closing channel");
                    let _ = failures.send(PipelineFailure::consumer(ChannelError::Module {
                        module: "receive".into(),
                        message: err.to_string(),
                    }));
                    break;
                }
            };

            if route(envelope, &correlator, &ready, &consumer).await.is_err() {
                break;
            }
        }

        debug!("Demux stage stopped");
    })
}

/// Routes one envelope to its ready queue or to the correlator.
async fn route(
    envelope: Envelope,
    correlator: &CommandCorrelator,
    ready: &ReadySenders,
    consumer: &CancellationToken,
) -> Result<(), ()> {
    match envelope {
        Envelope::Message(message) => deliver(&ready.message, message, consumer).await,
        Envelope::Notification(notification) => {
            deliver(&ready.notification, notification, consumer).await
        }
        Envelope::Session(session) => deliver(&ready.session, session, consumer).await,
        Envelope::Command(command) => {
            if command.is_correlatable_response() {
                match correlator.try_submit_result(command) {
                    Ok(()) => Ok(()),
                    // A response nobody awaits (canceled, timed out, or
                    // never registered) is dropped, not surfaced.
                    Err(response) => {
                        debug!(id = ?response.id, "Dropping unmatched command response");
                        Ok(())
                    }
                }
            } else {
                deliver(&ready.command, command, consumer).await
            }
        }
    }
}

async fn deliver<E>(
    queue: &QueueSender<E>,
    item: E,
    consumer: &CancellationToken,
) -> Result<(), ()> {
    tokio::select! {
        biased;
        _ = consumer.cancelled() => Err(()),
        sent = queue.send(item) => sent.map_err(|_| ()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::envelope::{CommandMethod, NotificationEvent};
    use crate::modules::{ChannelModule, ModuleFuture, ModuleOutcome};
    use crate::transport::pair;

    struct Rig {
        remote: crate::transport::LoopbackTransport,
        ready: ReadySenders,
        receivers: ReadyReceivers,
        correlator: Arc<CommandCorrelator>,
        modules: Arc<ChannelModules>,
        stop: CancellationToken,
        consumer: CancellationToken,
        failure_rx: mpsc::UnboundedReceiver<PipelineFailure>,
        read_task: JoinHandle<()>,
        demux_task: JoinHandle<()>,
    }

    fn start(
        capacity: usize,
        consume_timeout: Option<Duration>,
        modules: Arc<ChannelModules>,
    ) -> Rig {
        let (local, remote) = pair();
        let (ready, receivers) = ready_queues(capacity);
        let (intake_tx, intake_rx) = envelope_queue(capacity);
        let correlator = Arc::new(CommandCorrelator::new());
        let stop = CancellationToken::new();
        let consumer = CancellationToken::new();
        let (failure_tx, failure_rx) = mpsc::unbounded_channel();

        let read_task = spawn_read_loop(
            Arc::new(local),
            intake_tx,
            ready.clone(),
            consume_timeout,
            stop.clone(),
            failure_tx.clone(),
        );
        let demux_task = spawn_demux_loop(
            intake_rx,
            Arc::clone(&modules),
            Arc::clone(&correlator),
            ready.clone(),
            consumer.clone(),
            failure_tx,
        );

        Rig {
            remote,
            ready,
            receivers,
            correlator,
            modules,
            stop,
            consumer,
            failure_rx,
            read_task,
            demux_task,
        }
    }

    async fn shut_down(rig: Rig) {
        rig.stop.cancel();
        rig.consumer.cancel();
        let _ = rig.read_task.await;
        let _ = rig.demux_task.await;
    }

    #[tokio::test]
    async fn test_demux_routes_by_kind() {
        let rig = start(8, None, Arc::new(ChannelModules::new()));

        rig.remote.send(Message::text("hi").into()).await.unwrap();
        rig.remote
            .send(Notification::new(NotificationEvent::Received).into())
            .await
            .unwrap();
        rig.remote
            .send(Command::request(CommandMethod::Get, "/a").with_id("c1").into())
            .await
            .unwrap();

        let message = rig.receivers.message.lock().await.recv().await.unwrap();
        assert_eq!(message.content, serde_json::json!("hi"));

        let notification = rig.receivers.notification.lock().await.recv().await.unwrap();
        assert_eq!(notification.event, NotificationEvent::Received);

        let command = rig.receivers.command.lock().await.recv().await.unwrap();
        assert_eq!(command.id.as_deref(), Some("c1"));

        shut_down(rig).await;
    }

    #[tokio::test]
    async fn test_per_kind_fifo() {
        let rig = start(32, None, Arc::new(ChannelModules::new()));

        for i in 0..10 {
            rig.remote
                .send(Message::text(format!("m{i}")).into())
                .await
                .unwrap();
        }

        let mut rx = rig.receivers.message.lock().await;
        for i in 0..10 {
            let message = rx.recv().await.unwrap();
            assert_eq!(message.content, serde_json::json!(format!("m{i}")));
        }
        drop(rx);

        shut_down(rig).await;
    }

    #[tokio::test]
    async fn test_matched_response_bypasses_command_queue() {
        let rig = start(8, None, Arc::new(ChannelModules::new()));

        let request = Command::request(CommandMethod::Get, "/a").with_id("c1");
        let slot = rig.correlator.register(&request).unwrap();

        rig.remote
            .send(request.success_response().into())
            .await
            .unwrap();

        let response = tokio::time::timeout(Duration::from_secs(1), slot)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(response.id.as_deref(), Some("c1"));

        // Nothing must reach the application command queue.
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(rig.ready.depths().commands, 0);

        shut_down(rig).await;
    }

    #[tokio::test]
    async fn test_unmatched_response_is_dropped() {
        let rig = start(8, None, Arc::new(ChannelModules::new()));

        let stray = Command::request(CommandMethod::Get, "/a")
            .with_id("nobody")
            .success_response();
        rig.remote.send(stray.into()).await.unwrap();

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(rig.ready.depths().commands, 0);

        shut_down(rig).await;
    }

    #[tokio::test]
    async fn test_observe_bypasses_correlation() {
        let rig = start(8, None, Arc::new(ChannelModules::new()));

        let mut observe = Command::request(CommandMethod::Observe, "/a").with_id("c1");
        observe.status = crate::envelope::CommandStatus::Success;
        rig.remote.send(observe.into()).await.unwrap();

        let delivered = rig.receivers.command.lock().await.recv().await.unwrap();
        assert_eq!(delivered.method, CommandMethod::Observe);

        shut_down(rig).await;
    }

    #[tokio::test]
    async fn test_consume_timeout_reports_depths_and_stops() {
        let mut rig = start(1, Some(Duration::from_millis(50)), Arc::new(ChannelModules::new()));

        // Nobody drains the message queue: queue (1) + intake (1) fill,
        // and the next envelope trips the consume timeout.
        for i in 0..4 {
            rig.remote
                .send(Message::text(format!("m{i}")).into())
                .await
                .unwrap();
        }

        let failure = tokio::time::timeout(Duration::from_secs(1), rig.failure_rx.recv())
            .await
            .unwrap()
            .unwrap();
        let error = failure.error.unwrap();
        assert!(matches!(error, ChannelError::ConsumeTimeout { .. }));
        assert!(error.to_string().contains("messages="));

        shut_down(rig).await;
    }

    #[tokio::test]
    async fn test_eof_reports_graceful_close() {
        let mut rig = start(8, None, Arc::new(ChannelModules::new()));

        rig.remote.close().await.unwrap();

        let failure = tokio::time::timeout(Duration::from_secs(1), rig.failure_rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert!(failure.error.is_none(), "EOF is not an exception");

        shut_down(rig).await;
    }

    #[tokio::test]
    async fn test_module_error_stops_demux() {
        struct Failer;

        impl ChannelModule for Failer {
            fn name(&self) -> &str {
                "failer"
            }

            fn on_receiving(&self, _envelope: Envelope) -> ModuleFuture<'_, ModuleOutcome> {
                Box::pin(async { Err(crate::modules::ModuleError::new("boom")) })
            }
        }

        let modules = Arc::new(ChannelModules::new());
        modules.message.register(Arc::new(Failer));
        let mut rig = start(8, None, modules);

        rig.remote.send(Message::text("hi").into()).await.unwrap();

        let failure = tokio::time::timeout(Duration::from_secs(1), rig.failure_rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert!(matches!(
            failure.error.unwrap(),
            ChannelError::Module { .. }
        ));

        shut_down(rig).await;
    }

    #[tokio::test]
    async fn test_module_drop_suppresses_delivery() {
        struct DropAll;

        impl ChannelModule for DropAll {
            fn name(&self) -> &str {
                "drop-all"
            }

            fn on_receiving(&self, _envelope: Envelope) -> ModuleFuture<'_, ModuleOutcome> {
                Box::pin(async { Ok(None) })
            }
        }

        let modules = Arc::new(ChannelModules::new());
        modules.message.register(Arc::new(DropAll));
        let rig = start(8, None, modules);

        rig.remote.send(Message::text("hi").into()).await.unwrap();
        rig.remote
            .send(Notification::new(NotificationEvent::Received).into())
            .await
            .unwrap();

        // The notification (different registry) still arrives; the
        // message does not.
        let notification = tokio::time::timeout(
            Duration::from_secs(1),
            async { rig.receivers.notification.lock().await.recv().await },
        )
        .await
        .unwrap()
        .unwrap();
        assert_eq!(notification.event, NotificationEvent::Received);
        assert_eq!(rig.ready.depths().messages, 0);

        shut_down(rig).await;
    }

    #[tokio::test]
    async fn test_session_envelopes_use_session_queue() {
        let rig = start(8, None, Arc::new(ChannelModules::new()));

        rig.remote
            .send(Session::new(crate::envelope::SessionState::Finishing).into())
            .await
            .unwrap();

        let session = rig.receivers.session.lock().await.recv().await.unwrap();
        assert_eq!(session.state, crate::envelope::SessionState::Finishing);

        shut_down(rig).await;
    }

    #[tokio::test]
    async fn test_late_registration_applies_to_next_envelope() {
        struct DropAll;

        impl ChannelModule for DropAll {
            fn name(&self) -> &str {
                "drop-all"
            }

            fn on_receiving(&self, _envelope: Envelope) -> ModuleFuture<'_, ModuleOutcome> {
                Box::pin(async { Ok(None) })
            }
        }

        let rig = start(8, None, Arc::new(ChannelModules::new()));

        rig.remote.send(Message::text("first").into()).await.unwrap();
        let first = tokio::time::timeout(Duration::from_secs(1), async {
            rig.receivers.message.lock().await.recv().await
        })
        .await
        .unwrap()
        .unwrap();
        assert_eq!(first.content, serde_json::json!("first"));

        rig.modules.message.register(Arc::new(DropAll));
        rig.remote.send(Message::text("second").into()).await.unwrap();

        tokio::time::sleep(Duration::from_millis(30)).await;
        assert_eq!(rig.ready.depths().messages, 0);

        shut_down(rig).await;
    }
}
