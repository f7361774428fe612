//! End-to-end channel tests over a loopback transport pair.
//!
//! Two channels are wired back to back; the handshake helper drives the
//! session to `established` the way a client/server layer would, then
//! the scenarios exercise envelope round-trips, command correlation,
//! built-in modules, backpressure, and the closing protocol.

use std::sync::Arc;
use std::time::Duration;

use tokio::time::timeout;
use tokio_util::sync::CancellationToken;

use limekit::channel::{Channel, ChannelBuilder, ChannelError, ChannelEvent};
use limekit::envelope::{
    Command, CommandMethod, CommandStatus, Envelope, MediaType, Message, Notification,
    NotificationEvent, Session, SessionState,
};
use limekit::transport::{pair, pair_with_capacity, LoopbackTransport, Transport};

const TICK: Duration = Duration::from_millis(50);
const WAIT: Duration = Duration::from_secs(2);

fn ct() -> CancellationToken {
    CancellationToken::new()
}

fn channel_pair() -> (Arc<Channel<LoopbackTransport>>, Arc<Channel<LoopbackTransport>>) {
    let (client_side, server_side) = pair();
    let client = ChannelBuilder::new(client_side).build().unwrap();
    let server = ChannelBuilder::new(server_side).build().unwrap();
    (client, server)
}

/// Drives both channels to `established`: the client announces a new
/// session, the server confirms establishment.
async fn establish(
    client: &Arc<Channel<LoopbackTransport>>,
    server: &Arc<Channel<LoopbackTransport>>,
) {
    client
        .send_session(Session::new(SessionState::New).with_id("s1"), ct())
        .await
        .unwrap();

    let opening = server.receive_session(ct()).await.unwrap();
    assert_eq!(opening.state, SessionState::New);

    server
        .send_session(Session::new(SessionState::Established).with_id("s1"), ct())
        .await
        .unwrap();

    let established = client.receive_session(ct()).await.unwrap();
    assert_eq!(established.state, SessionState::Established);

    assert_eq!(client.state(), SessionState::Established);
    assert_eq!(server.state(), SessionState::Established);
}

/// Builds one channel and drives it straight to `established`, leaving
/// the peer side as a raw transport the test scripts by hand.
async fn established_with_raw_peer() -> (Arc<Channel<LoopbackTransport>>, LoopbackTransport) {
    let (local, peer) = pair();
    let channel = ChannelBuilder::new(local).build().unwrap();
    channel
        .send_session(Session::new(SessionState::Established), ct())
        .await
        .unwrap();
    // Drain the establishment envelope the channel pushed to the peer.
    let _ = peer.receive().await.unwrap();
    (channel, peer)
}

// ----------------------------------------------------------------------
// S1: message round-trip
// ----------------------------------------------------------------------

#[tokio::test]
async fn test_message_round_trip() {
    let (client, server) = channel_pair();
    establish(&client, &server).await;

    client
        .send_message(Message::text("hi").with_id("m1"), ct())
        .await
        .unwrap();

    let received = timeout(WAIT, server.receive_message(ct()))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(received.id.as_deref(), Some("m1"));
    assert_eq!(received.content, serde_json::json!("hi"));

    client.close().await.unwrap();
    server.close().await.unwrap();
}

// ----------------------------------------------------------------------
// S2: command request/response
// ----------------------------------------------------------------------

#[tokio::test]
async fn test_command_request_response() {
    let (client, server) = channel_pair();
    establish(&client, &server).await;

    let caller = {
        let client = Arc::clone(&client);
        tokio::spawn(async move {
            client
                .process_command(
                    Command::request(CommandMethod::Get, "/account").with_id("c1"),
                    ct(),
                )
                .await
        })
    };

    let request = timeout(WAIT, server.receive_command(ct()))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(request.id.as_deref(), Some("c1"));
    assert!(request.is_request());

    let response = request.success_response().with_resource(
        MediaType::new("application/json"),
        serde_json::json!({"balance": 10}),
    );
    server.send_command(response, ct()).await.unwrap();

    let resolved = timeout(WAIT, caller).await.unwrap().unwrap().unwrap();
    assert_eq!(resolved.id.as_deref(), Some("c1"));
    assert_eq!(resolved.status, CommandStatus::Success);
    assert_eq!(
        resolved.resource,
        Some(serde_json::json!({"balance": 10}))
    );

    // The response was consumed by the correlator; no channel's
    // receive_command may observe it.
    tokio::time::sleep(TICK).await;
    assert_eq!(client.queue_depths().commands, 0);
    assert_eq!(server.queue_depths().commands, 0);

    client.close().await.unwrap();
    server.close().await.unwrap();
}

// ----------------------------------------------------------------------
// S3: duplicate correlation
// ----------------------------------------------------------------------

#[tokio::test]
async fn test_duplicate_correlation_id() {
    let (client, server) = channel_pair();
    establish(&client, &server).await;

    let first = {
        let client = Arc::clone(&client);
        tokio::spawn(async move {
            client
                .process_command(
                    Command::request(CommandMethod::Get, "/account").with_id("c2"),
                    ct(),
                )
                .await
        })
    };

    // Wait until the first request is in flight on the server side.
    let request = timeout(WAIT, server.receive_command(ct()))
        .await
        .unwrap()
        .unwrap();

    let second = client
        .process_command(
            Command::request(CommandMethod::Get, "/account").with_id("c2"),
            ct(),
        )
        .await;
    assert!(matches!(
        second,
        Err(ChannelError::DuplicateCommand { id }) if id == "c2"
    ));

    // The first call still completes normally.
    server
        .send_command(request.success_response(), ct())
        .await
        .unwrap();
    let resolved = timeout(WAIT, first).await.unwrap().unwrap().unwrap();
    assert_eq!(resolved.status, CommandStatus::Success);

    client.close().await.unwrap();
    server.close().await.unwrap();
}

// ----------------------------------------------------------------------
// S4: ping auto-reply
// ----------------------------------------------------------------------

#[tokio::test]
async fn test_ping_auto_reply() {
    let (local, peer) = pair();
    let channel = ChannelBuilder::new(local).auto_reply_pings().build().unwrap();
    channel
        .send_session(Session::new(SessionState::Established), ct())
        .await
        .unwrap();
    let _ = peer.receive().await.unwrap();

    peer.send(
        Command::request(CommandMethod::Get, "/ping")
            .with_id("p1")
            .into(),
    )
    .await
    .unwrap();

    let reply = timeout(WAIT, peer.receive()).await.unwrap().unwrap().unwrap();
    let Envelope::Command(reply) = reply else {
        panic!("expected command reply");
    };
    assert_eq!(reply.id.as_deref(), Some("p1"));
    assert_eq!(reply.status, CommandStatus::Success);
    assert_eq!(reply.media_type, Some(MediaType::ping()));

    // The application never observes the ping request.
    let unseen = timeout(TICK, channel.receive_command(ct())).await;
    assert!(unseen.is_err());

    channel.close().await.unwrap();
}

// ----------------------------------------------------------------------
// S5: consume timeout
// ----------------------------------------------------------------------

#[tokio::test]
async fn test_consume_timeout_closes_channel() {
    let (local, peer) = pair_with_capacity(16);
    let channel = ChannelBuilder::new(local)
        .envelope_buffer_size(1)
        .consume_timeout(Duration::from_millis(100))
        .close_timeout(Duration::from_secs(1))
        .build()
        .unwrap();
    let mut events = channel.events();

    channel
        .send_session(Session::new(SessionState::Established), ct())
        .await
        .unwrap();
    let _ = peer.receive().await.unwrap();

    // A pending command that must observe cancellation when the channel
    // closes.
    let pending = {
        let channel = Arc::clone(&channel);
        tokio::spawn(async move {
            channel
                .process_command(
                    Command::request(CommandMethod::Get, "/slow").with_id("c-slow"),
                    ct(),
                )
                .await
        })
    };
    let _ = peer.receive().await.unwrap();

    // Flood messages without anybody draining them.
    for i in 0..4 {
        peer.send(Message::text(format!("m{i}")).into()).await.unwrap();
    }

    // The consumer exception carries the timeout with per-type depths.
    let event = loop {
        let event = timeout(WAIT, events.recv()).await.unwrap().unwrap();
        if let ChannelEvent::ConsumerException(error) = event {
            break error;
        }
    };
    assert!(matches!(*event, ChannelError::ConsumeTimeout { .. }));
    assert!(event.to_string().contains("messages="));

    // The pending command observes cancellation and the transport is
    // closed: the peer sees end-of-stream.
    let resolved = timeout(WAIT, pending).await.unwrap().unwrap();
    assert!(matches!(resolved, Err(ChannelError::Canceled)));

    let eof = timeout(WAIT, async {
        loop {
            if peer.receive().await.unwrap().is_none() {
                break;
            }
        }
    })
    .await;
    assert!(eof.is_ok(), "transport must be closed after the timeout");
}

// ----------------------------------------------------------------------
// S6: cancellation of process_command
// ----------------------------------------------------------------------

#[tokio::test]
async fn test_cancelled_process_command_ignores_late_response() {
    let (client, server) = channel_pair();
    establish(&client, &server).await;

    let cancellation = ct();
    let pending = {
        let client = Arc::clone(&client);
        let cancellation = cancellation.clone();
        tokio::spawn(async move {
            client
                .process_command(
                    Command::request(CommandMethod::Get, "/account").with_id("c3"),
                    cancellation,
                )
                .await
        })
    };

    let request = timeout(WAIT, server.receive_command(ct()))
        .await
        .unwrap()
        .unwrap();

    cancellation.cancel();
    let resolved = timeout(WAIT, pending).await.unwrap().unwrap();
    assert!(matches!(resolved, Err(ChannelError::Canceled)));

    // The late response is dropped by the correlator and never reaches
    // receive_command.
    server
        .send_command(request.success_response(), ct())
        .await
        .unwrap();
    tokio::time::sleep(TICK).await;
    assert_eq!(client.queue_depths().commands, 0);
    assert_eq!(client.correlator().pending_count(), 0);

    client.close().await.unwrap();
    server.close().await.unwrap();
}

// ----------------------------------------------------------------------
// Universal properties
// ----------------------------------------------------------------------

#[tokio::test]
async fn test_sends_are_state_gated() {
    let (local, peer) = pair();
    let channel = ChannelBuilder::new(local).build().unwrap();

    let message = channel.send_message(Message::text("early"), ct()).await;
    assert!(matches!(
        message,
        Err(ChannelError::InvalidState {
            state: SessionState::New
        })
    ));

    let notification = channel
        .send_notification(Notification::new(NotificationEvent::Received), ct())
        .await;
    assert!(matches!(notification, Err(ChannelError::InvalidState { .. })));

    let command = channel
        .send_command(Command::request(CommandMethod::Get, "/a").with_id("c1"), ct())
        .await;
    assert!(matches!(command, Err(ChannelError::InvalidState { .. })));

    // No bytes reached the wire.
    let nothing = timeout(TICK, peer.receive()).await;
    assert!(nothing.is_err());

    channel.close().await.unwrap();
}

#[tokio::test]
async fn test_per_type_fifo_delivery() {
    let (channel, peer) = established_with_raw_peer().await;

    // Interleave kinds; per-kind order must survive.
    for i in 0..10 {
        peer.send(Message::text(format!("m{i}")).into()).await.unwrap();
        peer.send(
            Notification::new(NotificationEvent::Received)
                .with_id(format!("n{i}"))
                .into(),
        )
        .await
        .unwrap();
    }

    for i in 0..10 {
        let message = timeout(WAIT, channel.receive_message(ct()))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(message.content, serde_json::json!(format!("m{i}")));
    }
    for i in 0..10 {
        let notification = timeout(WAIT, channel.receive_notification(ct()))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(notification.id.as_deref(), Some(format!("n{i}").as_str()));
    }

    channel.close().await.unwrap();
}

#[tokio::test]
async fn test_close_is_idempotent_across_concurrent_callers() {
    let (client, server) = channel_pair();
    establish(&client, &server).await;

    let mut closers = Vec::new();
    for _ in 0..8 {
        let client = Arc::clone(&client);
        closers.push(tokio::spawn(async move { client.close().await }));
    }
    for closer in closers {
        timeout(WAIT, closer).await.unwrap().unwrap().unwrap();
    }

    server.close().await.unwrap();
}

#[tokio::test]
async fn test_transport_closes_exactly_once() {
    let (local, _peer) = pair();
    let transport_events = local.events();
    let channel = ChannelBuilder::new(local).build().unwrap();

    let mut closers = Vec::new();
    for _ in 0..4 {
        let channel = Arc::clone(&channel);
        closers.push(tokio::spawn(async move { channel.close().await }));
    }
    for closer in closers {
        timeout(WAIT, closer).await.unwrap().unwrap().unwrap();
    }

    let mut events = transport_events;
    let mut closed = 0;
    while let Ok(event) = events.try_recv() {
        if event == limekit::transport::TransportEvent::Closed {
            closed += 1;
        }
    }
    assert_eq!(closed, 1);
}

#[tokio::test]
async fn test_observe_commands_bypass_correlation() {
    let (channel, peer) = established_with_raw_peer().await;

    // process_command rejects observe outright.
    let observe = Command::request(CommandMethod::Observe, "/presence").with_id("o1");
    let rejected = channel.process_command(observe.clone(), ct()).await;
    assert!(matches!(rejected, Err(ChannelError::InvalidArgument(_))));
    assert_eq!(channel.correlator().pending_count(), 0);

    // send_command never registers observe commands.
    channel.send_command(observe, ct()).await.unwrap();
    assert_eq!(channel.correlator().pending_count(), 0);
    let _ = peer.receive().await.unwrap();

    // An inbound observe, even response-shaped, reaches the application.
    let mut inbound = Command::request(CommandMethod::Observe, "/presence").with_id("o2");
    inbound.status = CommandStatus::Success;
    peer.send(inbound.into()).await.unwrap();

    let delivered = timeout(WAIT, channel.receive_command(ct()))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(delivered.method, CommandMethod::Observe);
    assert_eq!(delivered.id.as_deref(), Some("o2"));

    channel.close().await.unwrap();
}

// ----------------------------------------------------------------------
// Lifecycle details
// ----------------------------------------------------------------------

#[tokio::test]
async fn test_peer_close_shuts_down_channel() {
    let (client, server) = channel_pair();
    establish(&client, &server).await;

    server.close().await.unwrap();

    // The client notices end-of-stream and runs its own close; its
    // operations then fail with Closed.
    let outcome = timeout(WAIT, async {
        loop {
            match client.send_message(Message::text("hi"), ct()).await {
                Err(ChannelError::Closed) => break,
                _ => tokio::time::sleep(Duration::from_millis(10)).await,
            }
        }
    })
    .await;
    assert!(outcome.is_ok(), "client must observe the peer close");
}

#[tokio::test]
async fn test_receives_fail_after_close() {
    let (client, server) = channel_pair();
    establish(&client, &server).await;

    client.close().await.unwrap();

    assert!(matches!(
        client.receive_message(ct()).await,
        Err(ChannelError::Closed)
    ));
    assert!(matches!(
        client.receive_command(ct()).await,
        Err(ChannelError::Closed)
    ));
    assert!(matches!(
        client.send_message(Message::text("late"), ct()).await,
        Err(ChannelError::Closed)
    ));

    server.close().await.unwrap();
}

#[tokio::test]
async fn test_session_finish_handshake() {
    let (client, server) = channel_pair();
    establish(&client, &server).await;

    client
        .send_session(Session::new(SessionState::Finishing), ct())
        .await
        .unwrap();
    assert_eq!(client.state(), SessionState::Finishing);

    let finishing = timeout(WAIT, server.receive_session(ct()))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(finishing.state, SessionState::Finishing);

    server
        .send_session(Session::new(SessionState::Finished), ct())
        .await
        .unwrap();

    // The server session is now terminal; no further sends are allowed.
    let late = server.send_message(Message::text("late"), ct()).await;
    assert!(matches!(late, Err(ChannelError::Closed)));

    client.close().await.unwrap();
    server.close().await.unwrap();
}

#[tokio::test]
async fn test_module_registration_locked_after_established() {
    struct Noop;

    impl limekit::modules::ChannelModule for Noop {
        fn name(&self) -> &str {
            "noop"
        }
    }

    let (client, server) = channel_pair();
    client.add_message_module(Arc::new(Noop)).unwrap();

    establish(&client, &server).await;

    let locked = client.add_message_module(Arc::new(Noop));
    assert!(matches!(locked, Err(ChannelError::InvalidState { .. })));

    client.close().await.unwrap();
    server.close().await.unwrap();
}

#[tokio::test]
async fn test_remote_ping_watchdog_closes_idle_channel() {
    let (local, peer) = pair();
    let channel = ChannelBuilder::new(local)
        .remote_ping(Duration::from_millis(30), Some(Duration::from_millis(90)))
        .close_timeout(Duration::from_secs(1))
        .build()
        .unwrap();
    let mut events = channel.events();

    channel
        .send_session(Session::new(SessionState::Established), ct())
        .await
        .unwrap();

    // The peer stays silent: pings accumulate, then the idle timeout
    // closes the channel.
    let event = loop {
        let event = timeout(WAIT, events.recv()).await.unwrap().unwrap();
        if let ChannelEvent::ConsumerException(error) = event {
            break error;
        }
    };
    assert!(matches!(*event, ChannelError::RemoteIdle(_)));

    // The peer saw at least one ping before the close.
    let mut saw_ping = false;
    loop {
        match timeout(WAIT, peer.receive()).await.unwrap().unwrap() {
            Some(Envelope::Command(command))
                if command.uri.as_deref() == Some("/ping") && command.is_request() =>
            {
                saw_ping = true;
            }
            Some(_) => continue,
            None => break,
        }
    }
    assert!(saw_ping);
}
