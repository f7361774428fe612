//! limekit - channel core for a LIME-style messaging protocol
//!
//! This library turns a byte-oriented duplex transport into a
//! multiplexed, typed, asynchronous envelope channel with a session
//! lifecycle and command request/response correlation.
//!
//! # High-Level API
//!
//! ```ignore
//! use limekit::channel::ChannelBuilder;
//! use limekit::envelope::{Command, CommandMethod, Message};
//! use tokio_util::sync::CancellationToken;
//!
//! let channel = ChannelBuilder::new(transport)
//!     .auto_reply_pings()
//!     .build()?;
//!
//! // Drive the handshake to `established` with send_session /
//! // receive_session, then exchange envelopes:
//! channel.send_message(Message::text("hi"), CancellationToken::new()).await?;
//!
//! let request = Command::request(CommandMethod::Get, "/account").with_id("c1");
//! let response = channel.process_command(request, CancellationToken::new()).await?;
//! ```

pub mod channel;
pub mod envelope;
pub mod modules;
pub mod transport;

/// Version of the limekit library.
///
/// Defined in `Cargo.toml` and injected at compile time.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
