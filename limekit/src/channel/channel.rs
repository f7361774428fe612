//! The channel: session state owner and component wiring.
//!
//! # Architecture
//!
//! ```text
//! ┌────────────────────────────────────────────────────────────────┐
//! │                           Channel                              │
//! │                                                                │
//! │  send_* ──► modules ──► batcher task ──► transport.send        │
//! │                                                                │
//! │  transport.receive ──► read loop ──► intake ──► demux          │
//! │                                  │                │            │
//! │                                  ▼                ▼            │
//! │                          consume timeout   {MsgQ NotifQ CmdQ   │
//! │                                             SessQ, correlator} │
//! │                                                                │
//! │  process_command ──► correlator.register ──► send ──► await    │
//! │                                                                │
//! │  pipeline failures ──► dispatcher task ──► events + close      │
//! └────────────────────────────────────────────────────────────────┘
//! ```
//!
//! The receiver pipeline starts when the session enters `established`;
//! before that, `receive_session` reads the transport directly. The
//! channel owns the transport for its lifetime and closes it exactly
//! once, no matter how many close triggers race.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use tokio::sync::{broadcast, mpsc, watch, Mutex};
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::config::{ChannelConfig, DEFAULT_ENVELOPE_BUFFER_SIZE, PIPELINE_STOP_TIMEOUT};
use super::correlator::CommandCorrelator;
use super::error::{ChannelError, QueueDepths};
use super::events::{ChannelEvent, ExceptionSide, PipelineFailure};
use super::queue::{envelope_queue, QueueReceiver, QueueSender};
use super::receiver::{
    ready_queues, spawn_demux_loop, spawn_read_loop, ReadyReceivers, ReadySenders,
};
use super::sender::{spawn_batcher, BatcherConfig, SenderHandle};
use super::state::SessionStateTracker;
use crate::envelope::{Command, Envelope, Message, Notification, Session, SessionState};
use crate::modules::{
    apply_on_sending, ChannelModule, ChannelModules, PingAutoReply, RecipientFiller,
    RemotePingWatchdog,
};
use crate::transport::{Transport, TransportEvent};

/// Capacity of the channel event broadcast.
const EVENT_CHANNEL_CAPACITY: usize = 32;

/// A multiplexed, typed envelope channel over one transport.
///
/// Construct through [`ChannelBuilder`]. All operations take `&self`;
/// the channel is shared behind the [`Arc`] the builder returns.
pub struct Channel<T: Transport> {
    transport: Arc<T>,
    config: ChannelConfig,
    state: SessionStateTracker,
    correlator: Arc<CommandCorrelator>,
    modules: Arc<ChannelModules>,

    sender: SenderHandle,
    sender_task: StdMutex<Option<JoinHandle<()>>>,

    ready_senders: ReadySenders,
    ready: ReadyReceivers,
    intake: StdMutex<Option<(QueueSender<Envelope>, QueueReceiver<Envelope>)>>,
    receiver_tasks: StdMutex<Option<(JoinHandle<()>, JoinHandle<()>)>>,
    receiver_started: AtomicBool,

    /// Serializes direct (pre-established) session receives.
    session_direct: Mutex<()>,

    /// Cancels the read loop and the send batcher.
    stop_token: CancellationToken,
    /// Cancels module dispatch and ready-queue handoffs.
    consumer_token: CancellationToken,
    /// Cancelled at the start of close; public operations observe it.
    shutdown: CancellationToken,

    failures_tx: mpsc::UnboundedSender<PipelineFailure>,
    events_tx: broadcast::Sender<ChannelEvent>,

    close_started: AtomicBool,
    close_done: watch::Sender<bool>,
}

impl<T: Transport> Channel<T> {
    /// Returns the current session state.
    pub fn state(&self) -> SessionState {
        self.state.state()
    }

    /// Subscribes to channel events.
    pub fn events(&self) -> broadcast::Receiver<ChannelEvent> {
        self.events_tx.subscribe()
    }

    /// Returns the shared command correlator.
    pub fn correlator(&self) -> &Arc<CommandCorrelator> {
        &self.correlator
    }

    /// Snapshot of the per-kind ready-queue depths.
    pub fn queue_depths(&self) -> QueueDepths {
        self.ready_senders.depths()
    }

    // ------------------------------------------------------------------
    // Send operations
    // ------------------------------------------------------------------

    /// Sends a message. Requires an established session.
    pub async fn send_message(
        &self,
        message: Message,
        cancellation: CancellationToken,
    ) -> Result<(), ChannelError> {
        self.ensure_sending_allowed()?;
        self.dispatch_send(message.into(), cancellation).await
    }

    /// Sends a notification. Requires an established session.
    pub async fn send_notification(
        &self,
        notification: Notification,
        cancellation: CancellationToken,
    ) -> Result<(), ChannelError> {
        self.ensure_sending_allowed()?;
        self.dispatch_send(notification.into(), cancellation).await
    }

    /// Sends a command. Requires an established session.
    ///
    /// This is fire-and-forget; use [`Channel::process_command`] to await
    /// the response of a request.
    pub async fn send_command(
        &self,
        command: Command,
        cancellation: CancellationToken,
    ) -> Result<(), ChannelError> {
        self.ensure_sending_allowed()?;
        self.dispatch_send(command.into(), cancellation).await
    }

    /// Sends a session envelope and derives the channel state from it.
    ///
    /// Allowed in any non-terminal state; this is how the handshake layer
    /// drives the lifecycle.
    pub async fn send_session(
        &self,
        session: Session,
        cancellation: CancellationToken,
    ) -> Result<(), ChannelError> {
        if self.shutdown.is_cancelled() {
            return Err(ChannelError::Closed);
        }
        if self.state.state().is_terminal() {
            return Err(ChannelError::Closed);
        }

        let announced = session.state;
        self.dispatch_send(session.into(), cancellation).await?;
        self.apply_session_state(announced).await
    }

    /// Sends a request and awaits its correlated response.
    ///
    /// The request must be pending, must carry a non-empty id, and must
    /// not use the `observe` method. Cancellation removes the pending
    /// slot; a response arriving afterwards is dropped.
    pub async fn process_command(
        &self,
        request: Command,
        cancellation: CancellationToken,
    ) -> Result<Command, ChannelError> {
        self.ensure_sending_allowed()?;

        let response_rx = self.correlator.register(&request)?;
        let id = request.id.clone().unwrap_or_default();

        if let Err(err) = self.dispatch_send(request.into(), cancellation.clone()).await {
            self.correlator.remove(&id);
            return Err(err);
        }

        tokio::select! {
            biased;
            _ = cancellation.cancelled() => {
                self.correlator.remove(&id);
                Err(ChannelError::Canceled)
            }
            response = response_rx => response.map_err(|_| ChannelError::Canceled),
        }
    }

    // ------------------------------------------------------------------
    // Receive operations
    // ------------------------------------------------------------------

    /// Receives the next message. Requires an established session.
    pub async fn receive_message(
        &self,
        cancellation: CancellationToken,
    ) -> Result<Message, ChannelError> {
        self.ensure_receiving_allowed()?;
        tokio::select! {
            biased;
            _ = cancellation.cancelled() => Err(ChannelError::Canceled),
            _ = self.shutdown.cancelled() => Err(ChannelError::Closed),
            received = async {
                let mut queue = self.ready.message.lock().await;
                queue.recv().await
            } => received.ok_or(ChannelError::Closed),
        }
    }

    /// Receives the next notification. Requires an established session.
    pub async fn receive_notification(
        &self,
        cancellation: CancellationToken,
    ) -> Result<Notification, ChannelError> {
        self.ensure_receiving_allowed()?;
        tokio::select! {
            biased;
            _ = cancellation.cancelled() => Err(ChannelError::Canceled),
            _ = self.shutdown.cancelled() => Err(ChannelError::Closed),
            received = async {
                let mut queue = self.ready.notification.lock().await;
                queue.recv().await
            } => received.ok_or(ChannelError::Closed),
        }
    }

    /// Receives the next command request (or observe). Requires an
    /// established session.
    ///
    /// Responses matched by [`Channel::process_command`] never appear
    /// here.
    pub async fn receive_command(
        &self,
        cancellation: CancellationToken,
    ) -> Result<Command, ChannelError> {
        self.ensure_receiving_allowed()?;
        tokio::select! {
            biased;
            _ = cancellation.cancelled() => Err(ChannelError::Canceled),
            _ = self.shutdown.cancelled() => Err(ChannelError::Closed),
            received = async {
                let mut queue = self.ready.command.lock().await;
                queue.recv().await
            } => received.ok_or(ChannelError::Closed),
        }
    }

    /// Receives the next session envelope and derives the channel state
    /// from it.
    ///
    /// Before the session is established this reads the transport
    /// directly (one caller at a time); afterwards session envelopes
    /// flow through the ordinary demux path.
    pub async fn receive_session(
        &self,
        cancellation: CancellationToken,
    ) -> Result<Session, ChannelError> {
        if self.shutdown.is_cancelled() {
            return Err(ChannelError::Closed);
        }
        if self.state.state().is_terminal() {
            return Err(ChannelError::Closed);
        }

        let session = loop {
            if self.state.state().is_established() {
                break tokio::select! {
                    biased;
                    _ = cancellation.cancelled() => return Err(ChannelError::Canceled),
                    _ = self.shutdown.cancelled() => return Err(ChannelError::Closed),
                    received = async {
                        let mut queue = self.ready.session.lock().await;
                        queue.recv().await
                    } => received.ok_or(ChannelError::Closed)?,
                };
            }

            match self.receive_session_direct(&cancellation).await? {
                Some(session) => break session,
                // The session became established while waiting for the
                // direct-receive guard; retry through the demux path.
                None => continue,
            }
        };

        self.apply_session_state(session.state).await?;
        Ok(session)
    }

    /// Direct transport read used before the session is established.
    ///
    /// Returns `Ok(None)` when the state flipped to established before
    /// the read started.
    async fn receive_session_direct(
        &self,
        cancellation: &CancellationToken,
    ) -> Result<Option<Session>, ChannelError> {
        tokio::select! {
            biased;
            _ = cancellation.cancelled() => Err(ChannelError::Canceled),
            _ = self.shutdown.cancelled() => Err(ChannelError::Closed),
            received = async {
                let _guard = self.session_direct.lock().await;
                if self.state.state().is_established() {
                    return Ok(None);
                }
                self.transport.receive().await.map(Some)
            } => match received {
                Ok(None) => Ok(None),
                Ok(Some(Some(Envelope::Session(session)))) => Ok(Some(session)),
                Ok(Some(Some(other))) => Err(ChannelError::InvalidArgument(format!(
                    "expected a session envelope, received a {}",
                    other.kind()
                ))),
                Ok(Some(None)) => {
                    let _ = self.failures_tx.send(PipelineFailure::remote_eof());
                    Err(ChannelError::Closed)
                }
                Err(err) => {
                    let transport_error = ChannelError::Transport(err.clone());
                    let _ = self
                        .failures_tx
                        .send(PipelineFailure::consumer(ChannelError::Transport(err)));
                    Err(transport_error)
                }
            },
        }
    }

    // ------------------------------------------------------------------
    // Module registration
    // ------------------------------------------------------------------

    /// Registers a message module. Fails once the session has entered
    /// `established`.
    pub fn add_message_module(&self, module: Arc<dyn ChannelModule>) -> Result<(), ChannelError> {
        self.ensure_modules_mutable()?;
        self.modules.message.register(module);
        Ok(())
    }

    /// Registers a notification module. Fails once the session has
    /// entered `established`.
    pub fn add_notification_module(
        &self,
        module: Arc<dyn ChannelModule>,
    ) -> Result<(), ChannelError> {
        self.ensure_modules_mutable()?;
        self.modules.notification.register(module);
        Ok(())
    }

    /// Registers a command module. Fails once the session has entered
    /// `established`.
    pub fn add_command_module(&self, module: Arc<dyn ChannelModule>) -> Result<(), ChannelError> {
        self.ensure_modules_mutable()?;
        self.modules.command.register(module);
        Ok(())
    }

    /// Registers a session module. Fails once the session has entered
    /// `established`.
    pub fn add_session_module(&self, module: Arc<dyn ChannelModule>) -> Result<(), ChannelError> {
        self.ensure_modules_mutable()?;
        self.modules.session.register(module);
        Ok(())
    }

    // ------------------------------------------------------------------
    // Closing
    // ------------------------------------------------------------------

    /// Runs the closing protocol.
    ///
    /// Idempotent: concurrent calls collapse into one close; late
    /// callers wait for it to finish and return `Ok`. Only the call
    /// that performs the close surfaces a failure.
    pub async fn close(&self) -> Result<(), ChannelError> {
        if self.close_started.swap(true, Ordering::SeqCst) {
            let mut done = self.close_done.subscribe();
            while !*done.borrow_and_update() {
                if done.changed().await.is_err() {
                    break;
                }
            }
            return Ok(());
        }

        info!("Channel closing");
        let result = self.close_inner().await;
        self.close_done.send_replace(true);
        match &result {
            Ok(()) => info!("Channel closed"),
            Err(err) => warn!(error = %err, "Channel closed with error"),
        }
        result
    }

    async fn close_inner(&self) -> Result<(), ChannelError> {
        let mut first_error: Option<ChannelError> = None;

        self.shutdown.cancel();
        self.stop_token.cancel();

        // 1. Stop the pipelines. The read loop owns the intake sender, so
        // awaiting it first lets the demux stage drain what is buffered.
        let receiver_tasks = self
            .receiver_tasks
            .lock()
            .expect("receiver task lock poisoned")
            .take();
        if let Some((read_task, demux_task)) = receiver_tasks {
            if timeout(PIPELINE_STOP_TIMEOUT, read_task).await.is_err() {
                warn!("Transport read loop did not stop in time");
            }
            self.consumer_token.cancel();
            if timeout(PIPELINE_STOP_TIMEOUT, demux_task).await.is_err() {
                warn!("Demux stage did not stop in time");
            }
        } else {
            self.consumer_token.cancel();
        }

        let sender_task = self
            .sender_task
            .lock()
            .expect("sender task lock poisoned")
            .take();
        if let Some(task) = sender_task {
            if timeout(PIPELINE_STOP_TIMEOUT, task).await.is_err() {
                warn!("Send batcher did not stop in time");
            }
        }

        // 2. Cancel every pending command.
        self.correlator.cancel_all();

        // 3. Close the transport, bounded by the close timeout.
        if self.transport.is_connected() {
            match timeout(self.config.close_timeout, self.transport.close()).await {
                Ok(Ok(())) => {}
                Ok(Err(err)) => {
                    first_error.get_or_insert(ChannelError::Transport(err));
                }
                Err(_) => {
                    first_error.get_or_insert(ChannelError::CloseTimeout(self.config.close_timeout));
                }
            }
        }

        match first_error {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    // ------------------------------------------------------------------
    // Internals
    // ------------------------------------------------------------------

    fn ensure_sending_allowed(&self) -> Result<(), ChannelError> {
        if self.shutdown.is_cancelled() || self.close_started.load(Ordering::SeqCst) {
            return Err(ChannelError::Closed);
        }
        let state = self.state.state();
        if state.is_terminal() {
            return Err(ChannelError::Closed);
        }
        if !state.is_established() {
            return Err(ChannelError::InvalidState { state });
        }
        Ok(())
    }

    fn ensure_receiving_allowed(&self) -> Result<(), ChannelError> {
        if self.shutdown.is_cancelled() {
            return Err(ChannelError::Closed);
        }
        let state = self.state.state();
        if state.is_terminal() {
            return Err(ChannelError::Closed);
        }
        if !state.is_established() {
            return Err(ChannelError::InvalidState { state });
        }
        Ok(())
    }

    fn ensure_modules_mutable(&self) -> Result<(), ChannelError> {
        let state = self.state.state();
        if matches!(
            state,
            SessionState::New | SessionState::Negotiating | SessionState::Authenticating
        ) {
            Ok(())
        } else {
            Err(ChannelError::InvalidState { state })
        }
    }

    /// Runs the send-side modules and hands the envelope to the batcher,
    /// bounded by the send timeout.
    async fn dispatch_send(
        &self,
        envelope: Envelope,
        cancellation: CancellationToken,
    ) -> Result<(), ChannelError> {
        let snapshot = self.modules.registry_for(&envelope).snapshot();

        let envelope = tokio::select! {
            biased;
            _ = cancellation.cancelled() => return Err(ChannelError::Canceled),
            outcome = apply_on_sending(&snapshot, envelope) => match outcome {
                Ok(Some(envelope)) => envelope,
                Ok(None) => return Ok(()),
                Err(err) => {
                    warn!(error = %err, "Send module failed; closing channel");
                    let _ = self.failures_tx.send(PipelineFailure::sender(
                        ChannelError::Module {
                            module: "send".into(),
                            message: err.to_string(),
                        },
                    ));
                    return Err(ChannelError::Module {
                        module: "send".into(),
                        message: err.to_string(),
                    });
                }
            },
        };

        tokio::select! {
            biased;
            _ = cancellation.cancelled() => Err(ChannelError::Canceled),
            _ = self.shutdown.cancelled() => Err(ChannelError::Closed),
            sent = timeout(self.config.send_timeout, self.sender.send(envelope)) => match sent {
                Ok(sent) => sent,
                Err(_elapsed) => {
                    let bound = self.config.send_timeout;
                    warn!(timeout_ms = bound.as_millis() as u64, "Send timed out; closing channel");
                    let _ = self
                        .failures_tx
                        .send(PipelineFailure::sender(ChannelError::SendTimeout(bound)));
                    Err(ChannelError::SendTimeout(bound))
                }
            },
        }
    }

    /// Applies a session state announced by a sent or received session
    /// envelope, notifying modules and starting the receiver when the
    /// session becomes established.
    async fn apply_session_state(&self, next: SessionState) -> Result<(), ChannelError> {
        let previous = self.state.transition(next)?;
        if previous == next {
            return Ok(());
        }

        self.modules.notify_state_changed(next).await;

        if next.is_established() {
            self.start_receiver();
        }
        Ok(())
    }

    /// Starts the read loop and demux stage. Idempotent.
    fn start_receiver(&self) {
        if self.receiver_started.swap(true, Ordering::SeqCst) {
            return;
        }
        let Some((intake_tx, intake_rx)) = self
            .intake
            .lock()
            .expect("intake lock poisoned")
            .take()
        else {
            return;
        };

        info!("Session established; starting receiver pipeline");

        let read_task = spawn_read_loop(
            Arc::clone(&self.transport),
            intake_tx,
            self.ready_senders.clone(),
            self.config.consume_timeout,
            self.stop_token.clone(),
            self.failures_tx.clone(),
        );
        let demux_task = spawn_demux_loop(
            intake_rx,
            Arc::clone(&self.modules),
            Arc::clone(&self.correlator),
            self.ready_senders.clone(),
            self.consumer_token.clone(),
            self.failures_tx.clone(),
        );

        *self
            .receiver_tasks
            .lock()
            .expect("receiver task lock poisoned") = Some((read_task, demux_task));
    }
}

impl<T: Transport> Drop for Channel<T> {
    fn drop(&mut self) {
        // A channel dropped without close() must not leave its tasks
        // running.
        self.shutdown.cancel();
        self.stop_token.cancel();
        self.consumer_token.cancel();
    }
}

/// Builder for [`Channel`].
pub struct ChannelBuilder<T: Transport> {
    transport: T,
    config: ChannelConfig,
    correlator: Option<Arc<CommandCorrelator>>,
    message_modules: Vec<Arc<dyn ChannelModule>>,
    notification_modules: Vec<Arc<dyn ChannelModule>>,
    command_modules: Vec<Arc<dyn ChannelModule>>,
    session_modules: Vec<Arc<dyn ChannelModule>>,
}

impl<T: Transport> ChannelBuilder<T> {
    /// Starts a builder over the given transport with default
    /// configuration.
    pub fn new(transport: T) -> Self {
        Self {
            transport,
            config: ChannelConfig::default(),
            correlator: None,
            message_modules: Vec::new(),
            notification_modules: Vec::new(),
            command_modules: Vec::new(),
            session_modules: Vec::new(),
        }
    }

    /// Replaces the whole configuration.
    pub fn with_config(mut self, config: ChannelConfig) -> Self {
        self.config = config;
        self
    }

    /// Bound on each send operation.
    pub fn send_timeout(mut self, value: Duration) -> Self {
        self.config.send_timeout = value;
        self
    }

    /// Bound on enqueueing received envelopes when the application does
    /// not drain them.
    pub fn consume_timeout(mut self, value: Duration) -> Self {
        self.config.consume_timeout = Some(value);
        self
    }

    /// Bound on closing the transport.
    pub fn close_timeout(mut self, value: Duration) -> Self {
        self.config.close_timeout = value;
        self
    }

    /// Capacity of the intake buffer and each ready queue; zero means
    /// unbounded.
    pub fn envelope_buffer_size(mut self, value: usize) -> Self {
        self.config.envelope_buffer_size = value;
        self
    }

    /// Number of envelopes flushed per batch; 1 disables batching.
    pub fn send_batch_size(mut self, value: usize) -> Self {
        self.config.send_batch_size = value;
        self
    }

    /// Interval after which a partially filled batch is flushed.
    pub fn send_flush_interval(mut self, value: Duration) -> Self {
        self.config.send_flush_interval = value;
        self
    }

    /// Fills absent `from`/`to` fields from the given identities.
    pub fn fill_envelope_recipients(
        mut self,
        local: Option<crate::envelope::Node>,
        remote: Option<crate::envelope::Node>,
    ) -> Self {
        self.config.fill_envelope_recipients = true;
        self.config.local_node = local;
        self.config.remote_node = remote;
        self
    }

    /// Answers `/ping` requests automatically.
    pub fn auto_reply_pings(mut self) -> Self {
        self.config.auto_reply_pings = true;
        self
    }

    /// Enables the remote-ping watchdog.
    pub fn remote_ping(mut self, interval: Duration, idle_timeout: Option<Duration>) -> Self {
        self.config.remote_ping_interval = Some(interval);
        self.config.remote_idle_timeout = idle_timeout;
        self
    }

    /// Uses a shared correlator instead of a channel-private one.
    ///
    /// Entries stay keyed by request id, so channels sharing a
    /// correlator must also share an id space.
    pub fn with_shared_correlator(mut self, correlator: Arc<CommandCorrelator>) -> Self {
        self.correlator = Some(correlator);
        self
    }

    /// Registers a message module.
    pub fn with_message_module(mut self, module: Arc<dyn ChannelModule>) -> Self {
        self.message_modules.push(module);
        self
    }

    /// Registers a notification module.
    pub fn with_notification_module(mut self, module: Arc<dyn ChannelModule>) -> Self {
        self.notification_modules.push(module);
        self
    }

    /// Registers a command module.
    pub fn with_command_module(mut self, module: Arc<dyn ChannelModule>) -> Self {
        self.command_modules.push(module);
        self
    }

    /// Registers a session module.
    pub fn with_session_module(mut self, module: Arc<dyn ChannelModule>) -> Self {
        self.session_modules.push(module);
        self
    }

    /// Wires the channel together and spawns its long-lived tasks.
    pub fn build(self) -> Result<Arc<Channel<T>>, ChannelError> {
        let Self {
            transport,
            config,
            correlator,
            message_modules,
            notification_modules,
            command_modules,
            session_modules,
        } = self;

        if config.close_timeout.is_zero() {
            return Err(ChannelError::InvalidArgument(
                "close timeout must be non-zero".into(),
            ));
        }

        let transport = Arc::new(transport);
        let stop_token = CancellationToken::new();
        let consumer_token = CancellationToken::new();
        let shutdown = CancellationToken::new();
        let (failures_tx, failures_rx) = mpsc::unbounded_channel();
        let (events_tx, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);

        let sender_queue_capacity = if config.envelope_buffer_size == 0 {
            DEFAULT_ENVELOPE_BUFFER_SIZE
        } else {
            config.envelope_buffer_size
        };
        let (sender, sender_task) = spawn_batcher(
            Arc::clone(&transport),
            BatcherConfig {
                batch_size: config.send_batch_size,
                flush_interval: config.send_flush_interval,
                queue_capacity: sender_queue_capacity,
            },
            stop_token.clone(),
            failures_tx.clone(),
        );

        let modules = Arc::new(ChannelModules::new());
        if config.fill_envelope_recipients {
            let filler = Arc::new(RecipientFiller::new(
                config.local_node.clone(),
                config.remote_node.clone(),
            ));
            modules.message.register(Arc::clone(&filler) as Arc<dyn ChannelModule>);
            modules
                .notification
                .register(Arc::clone(&filler) as Arc<dyn ChannelModule>);
            modules.command.register(filler);
        }
        if config.auto_reply_pings {
            modules.command.register(Arc::new(PingAutoReply::new(sender.clone())));
        }
        if let Some(interval) = config.remote_ping_interval {
            let watchdog = Arc::new(RemotePingWatchdog::new(
                sender.clone(),
                interval,
                config.remote_idle_timeout,
                failures_tx.clone(),
                shutdown.clone(),
            ));
            modules.register_all(watchdog);
        }
        for module in message_modules {
            modules.message.register(module);
        }
        for module in notification_modules {
            modules.notification.register(module);
        }
        for module in command_modules {
            modules.command.register(module);
        }
        for module in session_modules {
            modules.session.register(module);
        }

        let (ready_senders, ready) = ready_queues(config.envelope_buffer_size);
        let intake = envelope_queue(config.envelope_buffer_size);
        let (close_done, _) = watch::channel(false);

        let channel = Arc::new(Channel {
            transport,
            config,
            state: SessionStateTracker::new(),
            correlator: correlator.unwrap_or_default(),
            modules,
            sender,
            sender_task: StdMutex::new(Some(sender_task)),
            ready_senders,
            ready,
            intake: StdMutex::new(Some(intake)),
            receiver_tasks: StdMutex::new(None),
            receiver_started: AtomicBool::new(false),
            session_direct: Mutex::new(()),
            stop_token,
            consumer_token,
            shutdown,
            failures_tx,
            events_tx,
            close_started: AtomicBool::new(false),
            close_done,
        });

        spawn_exception_dispatcher(&channel, failures_rx);
        spawn_event_forwarder(&channel);
        register_closing_listener(&channel);

        Ok(channel)
    }
}

/// Spawns the exception dispatcher: logs pipeline failures, raises the
/// corresponding channel event, and runs the closing protocol.
fn spawn_exception_dispatcher<T: Transport>(
    channel: &Arc<Channel<T>>,
    mut failures_rx: mpsc::UnboundedReceiver<PipelineFailure>,
) {
    let weak = Arc::downgrade(channel);
    let events = channel.events_tx.clone();

    tokio::spawn(async move {
        while let Some(failure) = failures_rx.recv().await {
            match failure.error {
                Some(failure_error) => {
                    error!(
                        side = %failure.side,
                        error = %failure_error,
                        "Channel pipeline failed; closing"
                    );
                    let failure_error = Arc::new(failure_error);
                    let event = match failure.side {
                        ExceptionSide::Consumer => {
                            ChannelEvent::ConsumerException(Arc::clone(&failure_error))
                        }
                        ExceptionSide::Sender => {
                            ChannelEvent::SenderException(Arc::clone(&failure_error))
                        }
                    };
                    let _ = events.send(event);
                }
                None => info!("Remote peer closed the session"),
            }

            match weak.upgrade() {
                Some(channel) => {
                    let _ = channel.close().await;
                }
                None => break,
            }
        }
        debug!("Exception dispatcher stopped");
    });
}

/// Forwards transport lifecycle events as channel events.
fn spawn_event_forwarder<T: Transport>(channel: &Arc<Channel<T>>) {
    let mut transport_events = channel.transport.events();
    let events = channel.events_tx.clone();

    tokio::spawn(async move {
        loop {
            match transport_events.recv().await {
                Ok(TransportEvent::Closing) => {
                    let _ = events.send(ChannelEvent::Closing);
                }
                Ok(TransportEvent::Closed) => {
                    let _ = events.send(ChannelEvent::Closed);
                    break;
                }
                Err(broadcast::error::RecvError::Lagged(_)) => continue,
                Err(broadcast::error::RecvError::Closed) => break,
            }
        }
    });
}

/// Registers the channel's closing deferral on the transport: when the
/// close is initiated elsewhere (the peer, or a direct transport close),
/// the channel runs its own shutdown before the transport tears down.
fn register_closing_listener<T: Transport>(channel: &Arc<Channel<T>>) {
    let weak = Arc::downgrade(channel);
    channel.transport.on_closing(Box::new(move || {
        let weak = weak.clone();
        Box::pin(async move {
            let Some(channel) = weak.upgrade() else {
                return;
            };
            // A locally initiated close is already driving the shutdown;
            // awaiting it from inside its own deferral would deadlock.
            if channel.close_started.load(Ordering::SeqCst) {
                return;
            }
            debug!("Transport closing; running channel shutdown as a deferral");
            let _ = channel.close().await;
        })
    }));
}
