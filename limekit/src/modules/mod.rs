//! Envelope interceptor modules.
//!
//! A module is registered per envelope kind and hooked into the send and
//! receive paths: it can replace the envelope, drop it, or fail the
//! pipeline. Modules also observe session state changes.
//!
//! # Snapshot semantics
//!
//! Dispatch iterates a snapshot taken at the start of each envelope, so
//! registering a module while envelopes are in flight is safe and takes
//! effect from the next envelope on. The registry is never locked for
//! the duration of a dispatch.

mod fill;
mod ping;
mod watchdog;

use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, RwLock};

use thiserror::Error;
use tokio_util::sync::CancellationToken;

use crate::envelope::{Envelope, SessionState};

pub use fill::RecipientFiller;
pub use ping::PingAutoReply;
pub use watchdog::RemotePingWatchdog;

/// Boxed future returned by module hooks, so module collections stay
/// object-safe.
pub type ModuleFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// A module hook failed; the channel treats this as fatal.
#[derive(Debug, Clone, Error)]
#[error("{0}")]
pub struct ModuleError(String);

impl ModuleError {
    /// Creates a module error from a failure description.
    pub fn new(message: impl Into<String>) -> Self {
        Self(message.into())
    }
}

/// Outcome of a module hook: the (possibly replaced) envelope, or `None`
/// to drop it.
pub type ModuleOutcome = Result<Option<Envelope>, ModuleError>;

/// An envelope interceptor.
///
/// The default hooks pass envelopes through untouched and ignore state
/// changes; implementors override what they need.
pub trait ChannelModule: Send + Sync {
    /// Name used in diagnostics.
    fn name(&self) -> &str;

    /// Observes a session state change.
    ///
    /// Runs before any subsequent envelope passes through this module.
    fn on_state_changed(&self, state: SessionState) -> ModuleFuture<'_, ()> {
        let _ = state;
        Box::pin(async {})
    }

    /// Intercepts an envelope on the send path.
    fn on_sending(&self, envelope: Envelope) -> ModuleFuture<'_, ModuleOutcome> {
        Box::pin(async move { Ok(Some(envelope)) })
    }

    /// Intercepts an envelope on the receive path.
    fn on_receiving(&self, envelope: Envelope) -> ModuleFuture<'_, ModuleOutcome> {
        Box::pin(async move { Ok(Some(envelope)) })
    }
}

/// An ordered, snapshot-iterated collection of modules.
pub struct ModuleRegistry {
    modules: RwLock<Vec<Arc<dyn ChannelModule>>>,
}

impl ModuleRegistry {
    /// Creates an empty registry.
    pub fn new() -> Self {
        Self {
            modules: RwLock::new(Vec::new()),
        }
    }

    /// Appends a module; it runs after all previously registered ones.
    pub fn register(&self, module: Arc<dyn ChannelModule>) {
        self.modules
            .write()
            .expect("module registry lock poisoned")
            .push(module);
    }

    /// Returns a snapshot of the registered modules in order.
    pub fn snapshot(&self) -> Vec<Arc<dyn ChannelModule>> {
        self.modules
            .read()
            .expect("module registry lock poisoned")
            .clone()
    }

    /// Returns the number of registered modules.
    pub fn len(&self) -> usize {
        self.modules
            .read()
            .expect("module registry lock poisoned")
            .len()
    }

    /// Returns true when no modules are registered.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for ModuleRegistry {
    fn default() -> Self {
        Self::new()
    }
}

/// The per-kind module registries of a channel.
pub(crate) struct ChannelModules {
    pub(crate) message: ModuleRegistry,
    pub(crate) notification: ModuleRegistry,
    pub(crate) command: ModuleRegistry,
    pub(crate) session: ModuleRegistry,
}

impl ChannelModules {
    pub(crate) fn new() -> Self {
        Self {
            message: ModuleRegistry::new(),
            notification: ModuleRegistry::new(),
            command: ModuleRegistry::new(),
            session: ModuleRegistry::new(),
        }
    }

    /// Registers a module for every envelope kind.
    pub(crate) fn register_all(&self, module: Arc<dyn ChannelModule>) {
        self.message.register(Arc::clone(&module));
        self.notification.register(Arc::clone(&module));
        self.command.register(Arc::clone(&module));
        self.session.register(module);
    }

    /// Returns the registry for the given envelope.
    pub(crate) fn registry_for(&self, envelope: &Envelope) -> &ModuleRegistry {
        match envelope {
            Envelope::Message(_) => &self.message,
            Envelope::Notification(_) => &self.notification,
            Envelope::Command(_) => &self.command,
            Envelope::Session(_) => &self.session,
        }
    }

    /// Broadcasts a state change to every registered module, in
    /// registration order per registry.
    ///
    /// A module registered for several kinds is notified once per
    /// registration; hooks must tolerate repeated delivery.
    pub(crate) async fn notify_state_changed(&self, state: SessionState) {
        for registry in [
            &self.message,
            &self.notification,
            &self.command,
            &self.session,
        ] {
            for module in registry.snapshot() {
                module.on_state_changed(state).await;
            }
        }
    }
}

/// Runs the receive-side hooks of `modules` over `envelope` in order.
///
/// Cancellation mid-chain drops the envelope silently, per the receive
/// pipeline contract.
pub(crate) async fn apply_on_receiving(
    modules: &[Arc<dyn ChannelModule>],
    mut envelope: Envelope,
    cancellation: &CancellationToken,
) -> ModuleOutcome {
    for module in modules {
        let outcome = tokio::select! {
            biased;
            _ = cancellation.cancelled() => return Ok(None),
            outcome = module.on_receiving(envelope) => outcome,
        };
        match outcome {
            Ok(Some(replacement)) => envelope = replacement,
            Ok(None) => return Ok(None),
            Err(err) => return Err(err),
        }
    }
    Ok(Some(envelope))
}

/// Runs the send-side hooks of `modules` over `envelope` in order.
pub(crate) async fn apply_on_sending(
    modules: &[Arc<dyn ChannelModule>],
    mut envelope: Envelope,
) -> ModuleOutcome {
    for module in modules {
        match module.on_sending(envelope).await {
            Ok(Some(replacement)) => envelope = replacement,
            Ok(None) => return Ok(None),
            Err(err) => return Err(err),
        }
    }
    Ok(Some(envelope))
}
