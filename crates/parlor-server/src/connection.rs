//! One WebSocket session: an inbound pump that decodes, sanitizes and hands
//! envelopes to the hub, and an outbound pump that drains the connection's
//! queue to the wire and keeps the peer alive with pings.
//!
//! The pumps are generic over `Stream`/`Sink` of WebSocket messages so they
//! run the same against a split axum socket or an in-memory channel.

use std::fmt;
use std::time::Duration;

use axum::extract::ws::{Message, WebSocket};
use futures::{Sink, SinkExt, Stream, StreamExt};
use parlor_shared::envelope::{now_secs, Envelope};
use parlor_shared::UserId;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::time::{timeout, MissedTickBehavior};
use tracing::{debug, error, info, warn};

use crate::config::Timing;
use crate::hub::{ConnectionId, HubError, HubHandle, Payload};

#[derive(Debug, Error)]
pub enum ConnectionError {
    #[error("Transport error: {0}")]
    Transport(String),

    #[error("Frame too large: {size} bytes (max {max})")]
    FrameTooLarge { size: usize, max: usize },

    #[error("No frame from peer within {0:?}")]
    ReadTimeout(Duration),

    #[error("Write deadline of {0:?} exceeded")]
    WriteTimeout(Duration),

    #[error(transparent)]
    Hub(#[from] HubError),
}

#[derive(Clone)]
pub struct Connection {
    id: ConnectionId,
    user_id: UserId,
    hub: HubHandle,
    max_frame_size: usize,
    timing: Timing,
}

impl Connection {
    /// Register `user_id` with the hub and build the connection around it.
    ///
    /// The returned receiver is this connection's outbound queue; pass it to
    /// [`Connection::run`].
    pub async fn register(
        hub: HubHandle,
        user_id: UserId,
        max_frame_size: usize,
        timing: Timing,
    ) -> Result<(Self, mpsc::Receiver<Payload>), HubError> {
        let registration = hub.register(user_id.clone()).await?;
        let connection = Self {
            id: registration.id,
            user_id,
            hub,
            max_frame_size,
            timing,
        };
        Ok((connection, registration.outbound))
    }

    pub fn id(&self) -> ConnectionId {
        self.id
    }

    pub fn user_id(&self) -> &UserId {
        &self.user_id
    }

    /// Drive an upgraded socket until either side gives up.
    pub async fn run(self, socket: WebSocket, outbound: mpsc::Receiver<Payload>) {
        let (sink, stream) = socket.split();
        self.serve(sink, stream, outbound).await;
    }

    /// Run both pumps; unregister once either of them stops.
    pub async fn serve<W, S, E>(self, sink: W, stream: S, outbound: mpsc::Receiver<Payload>)
    where
        W: Sink<Message> + Unpin + Send + 'static,
        W::Error: fmt::Display + Send,
        S: Stream<Item = Result<Message, E>> + Unpin,
        E: fmt::Display,
    {
        info!(conn = %self.id, user = %self.user_id, "Connection open");

        let writer = self.clone();
        let mut write_task = tokio::spawn(async move { writer.write_pump(sink, outbound).await });
        let mut writer_done = false;

        let outcome = tokio::select! {
            read = self.read_pump(stream) => read,
            written = &mut write_task => {
                writer_done = true;
                written.unwrap_or_else(|e| Err(ConnectionError::Transport(e.to_string())))
            }
        };

        match &outcome {
            Ok(()) => info!(conn = %self.id, user = %self.user_id, "Connection closing"),
            Err(e) => warn!(conn = %self.id, user = %self.user_id, error = %e, "Connection closing"),
        }

        if let Err(e) = self.hub.unregister(self.id).await {
            debug!(conn = %self.id, error = %e, "Unregister skipped");
        }

        // Unregistering closes the queue; give the writer time to send the
        // close frame.
        if !writer_done && timeout(self.timing.write_wait, &mut write_task).await.is_err() {
            write_task.abort();
        }

        info!(conn = %self.id, user = %self.user_id, "Connection closed");
    }

    /// Read frames until the peer leaves, faults, stalls or oversteps the
    /// frame limit. Bad envelopes are dropped one at a time.
    pub async fn read_pump<S, E>(&self, mut stream: S) -> Result<(), ConnectionError>
    where
        S: Stream<Item = Result<Message, E>> + Unpin,
        E: fmt::Display,
    {
        loop {
            let frame = match timeout(self.timing.pong_wait, stream.next()).await {
                Err(_) => return Err(ConnectionError::ReadTimeout(self.timing.pong_wait)),
                Ok(None) => return Ok(()),
                Ok(Some(Err(e))) => return Err(ConnectionError::Transport(e.to_string())),
                Ok(Some(Ok(frame))) => frame,
            };

            let data: &[u8] = match &frame {
                Message::Text(text) => text.as_bytes(),
                Message::Binary(bytes) => bytes,
                Message::Close(_) => return Ok(()),
                // axum answers pings itself; both only reset the read deadline
                Message::Ping(_) | Message::Pong(_) => continue,
            };

            if data.len() > self.max_frame_size {
                return Err(ConnectionError::FrameTooLarge {
                    size: data.len(),
                    max: self.max_frame_size,
                });
            }

            self.relay(data).await?;
        }
    }

    async fn relay(&self, data: &[u8]) -> Result<(), HubError> {
        let envelope = match Envelope::from_slice(data)
            .and_then(|envelope| envelope.prepare_inbound(&self.user_id, now_secs()))
        {
            Ok(envelope) => envelope,
            Err(e) => {
                warn!(user = %self.user_id, error = %e, "Discarding envelope");
                return Ok(());
            }
        };

        let json = match envelope.to_json() {
            Ok(json) => json,
            Err(e) => {
                error!(user = %self.user_id, error = %e, "Failed to encode envelope");
                return Ok(());
            }
        };

        debug!(
            user = %self.user_id,
            kind = %envelope.kind(),
            bytes = json.len(),
            "Relaying envelope"
        );
        self.hub.broadcast(json).await
    }

    /// Drain the outbound queue and ping on a timer.
    ///
    /// Returns `Ok` once the hub closes the queue and the close frame is
    /// out. Never unregisters.
    pub async fn write_pump<W>(
        &self,
        mut sink: W,
        mut outbound: mpsc::Receiver<Payload>,
    ) -> Result<(), ConnectionError>
    where
        W: Sink<Message> + Unpin,
        W::Error: fmt::Display,
    {
        let mut ticker = tokio::time::interval(self.timing.ping_period);
        // a stalled write must not be followed by a burst of catch-up pings
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        ticker.tick().await;

        loop {
            tokio::select! {
                next = outbound.recv() => match next {
                    Some(payload) => {
                        self.write(&mut sink, Message::Text(payload.to_string())).await?;
                    }
                    None => {
                        debug!(conn = %self.id, "Outbound queue released");
                        return self.write(&mut sink, Message::Close(None)).await;
                    }
                },
                _ = ticker.tick() => {
                    self.write(&mut sink, Message::Ping(Vec::new())).await?;
                }
            }
        }
    }

    async fn write<W>(&self, sink: &mut W, message: Message) -> Result<(), ConnectionError>
    where
        W: Sink<Message> + Unpin,
        W::Error: fmt::Display,
    {
        match timeout(self.timing.write_wait, sink.send(message)).await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(e)) => Err(ConnectionError::Transport(e.to_string())),
            Err(_) => Err(ConnectionError::WriteTimeout(self.timing.write_wait)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hub::tests::{expect_count, next_envelope, user, wait_for_count};
    use crate::hub::Hub;
    use futures::channel::mpsc as wire;
    use futures::stream;
    use parlor_shared::EnvelopeKind;

    type Frame = Result<Message, std::io::Error>;

    fn fast_timing() -> Timing {
        Timing::new(Duration::from_millis(200), Duration::from_millis(100))
    }

    fn frames(texts: &[&str]) -> stream::Iter<std::vec::IntoIter<Frame>> {
        let frames: Vec<Frame> = texts.iter().map(|t| Ok(Message::Text(t.to_string()))).collect();
        stream::iter(frames)
    }

    async fn connect(hub: &HubHandle, name: &str) -> (Connection, mpsc::Receiver<Payload>) {
        Connection::register(hub.clone(), user(name), 5120, fast_timing())
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn test_inbound_identity_is_server_assigned() {
        let hub = Hub::spawn(16, 16);
        let (alice, mut alice_rx) = connect(&hub, "alice").await;
        let (_bob, mut bob_rx) = connect(&hub, "bob").await;
        expect_count(&mut alice_rx, 1).await;
        expect_count(&mut alice_rx, 2).await;
        expect_count(&mut bob_rx, 2).await;

        let spoofed = r#"{"type":"message","userID":"bob","username":"Alice","content":"hi","timestamp":1762886360000}"#;
        alice.read_pump(frames(&[spoofed])).await.unwrap();

        for rx in [&mut alice_rx, &mut bob_rx] {
            let env = next_envelope(rx).await;
            assert_eq!(env.kind, Some(EnvelopeKind::Message));
            assert_eq!(env.user_id, "alice");
            assert_eq!(env.username, "Alice");
            assert_eq!(env.content, "hi");
            assert_eq!(env.timestamp, 1_762_886_360);
        }
    }

    #[tokio::test]
    async fn test_bad_envelopes_are_skipped() {
        let hub = Hub::spawn(16, 16);
        let (alice, mut rx) = connect(&hub, "alice").await;
        expect_count(&mut rx, 1).await;

        alice
            .read_pump(frames(&[
                "{not json",
                r#"{"type":"message","content":""}"#,
                r#"{"type":"file","filedata":"AA=="}"#,
                r#"{"type":"client_count","clientCount":42}"#,
                r#"{"type":"shout"}"#,
                r#"{"type":"typing","username":"Alice"}"#,
            ]))
            .await
            .unwrap();

        let env = next_envelope(&mut rx).await;
        assert_eq!(env.kind, Some(EnvelopeKind::Typing));
        assert_eq!(env.user_id, "alice");
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_binary_frames_are_decoded() {
        let hub = Hub::spawn(16, 16);
        let (alice, mut rx) = connect(&hub, "alice").await;
        expect_count(&mut rx, 1).await;

        let file = br#"{"type":"file","filename":"a.txt","filesize":3,"filedata":"YWJj"}"#;
        let input: Vec<Frame> = vec![Ok(Message::Binary(file.to_vec()))];
        alice.read_pump(stream::iter(input)).await.unwrap();

        let env = next_envelope(&mut rx).await;
        assert_eq!(env.kind, Some(EnvelopeKind::File));
        assert_eq!(env.filename, "a.txt");
        assert_eq!(env.filedata, "YWJj");
    }

    #[tokio::test]
    async fn test_oversized_frame_ends_pump() {
        let hub = Hub::spawn(16, 16);
        let (alice, _rx) = connect(&hub, "alice").await;

        let huge = format!(r#"{{"content":"{}"}}"#, "x".repeat(6000));
        let result = alice.read_pump(frames(&[huge.as_str(), r#"{"content":"after"}"#])).await;

        assert!(matches!(
            result,
            Err(ConnectionError::FrameTooLarge { max: 5120, .. })
        ));
    }

    #[tokio::test]
    async fn test_close_frame_and_errors_end_pump() {
        let hub = Hub::spawn(16, 16);
        let (alice, _rx) = connect(&hub, "alice").await;

        let closed: Vec<Frame> = vec![Ok(Message::Close(None))];
        assert!(alice.read_pump(stream::iter(closed)).await.is_ok());

        let broken: Vec<Frame> = vec![Err(std::io::Error::other("reset"))];
        assert!(matches!(
            alice.read_pump(stream::iter(broken)).await,
            Err(ConnectionError::Transport(_))
        ));
    }

    #[tokio::test]
    async fn test_silent_peer_times_out() {
        let hub = Hub::spawn(16, 16);
        let (alice, _rx) = connect(&hub, "alice").await;

        let result = alice.read_pump(stream::pending::<Frame>()).await;
        assert!(matches!(result, Err(ConnectionError::ReadTimeout(_))));
    }

    #[tokio::test]
    async fn test_pongs_keep_reader_alive() {
        let hub = Hub::spawn(16, 16);
        let (alice, _rx) = connect(&hub, "alice").await;

        // 4 pongs 60ms apart outlast the 100ms inactivity timeout
        let pongs = stream::unfold(0, |n| async move {
            if n == 4 {
                return None;
            }
            tokio::time::sleep(Duration::from_millis(60)).await;
            Some((Ok::<_, std::io::Error>(Message::Pong(Vec::new())), n + 1))
        });
        assert!(alice.read_pump(Box::pin(pongs)).await.is_ok());
    }

    #[tokio::test]
    async fn test_write_pump_drains_then_closes() {
        let hub = Hub::spawn(16, 16);
        let (alice, _rx) = connect(&hub, "alice").await;

        let (queue_tx, queue_rx) = mpsc::channel::<Payload>(4);
        let (sink, mut wire_rx) = wire::channel::<Message>(16);
        queue_tx.send(Payload::from("one")).await.unwrap();
        queue_tx.send(Payload::from("two")).await.unwrap();
        drop(queue_tx);

        alice.write_pump(sink, queue_rx).await.unwrap();

        assert!(matches!(wire_rx.next().await, Some(Message::Text(t)) if t == "one"));
        assert!(matches!(wire_rx.next().await, Some(Message::Text(t)) if t == "two"));
        assert!(matches!(wire_rx.next().await, Some(Message::Close(None))));
    }

    #[tokio::test]
    async fn test_write_pump_pings() {
        let hub = Hub::spawn(16, 16);
        let (alice, _rx) = connect(&hub, "alice").await;

        let (queue_tx, queue_rx) = mpsc::channel::<Payload>(4);
        let (sink, mut wire_rx) = wire::channel::<Message>(16);
        let writer = tokio::spawn(async move { alice.write_pump(sink, queue_rx).await });

        let first = timeout(Duration::from_secs(2), wire_rx.next()).await.unwrap();
        assert!(matches!(first, Some(Message::Ping(_))));

        drop(queue_tx);
        writer.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_stalled_writer_does_not_burst_pings() {
        let hub = Hub::spawn(16, 16);
        let timing = Timing::new(Duration::from_secs(1), Duration::from_millis(50));
        let (alice, _rx) = Connection::register(hub.clone(), user("alice"), 5120, timing)
            .await
            .unwrap();

        // zero-buffer wire: every ping after the first blocks until read
        let (queue_tx, queue_rx) = mpsc::channel::<Payload>(4);
        let (sink, mut wire_rx) = wire::channel::<Message>(0);
        let writer = tokio::spawn(async move { alice.write_pump(sink, queue_rx).await });

        // roughly nine ping periods go by while nobody reads
        tokio::time::sleep(Duration::from_millis(400)).await;

        let mut pings = 0;
        let window = tokio::time::sleep(Duration::from_millis(30));
        tokio::pin!(window);
        loop {
            tokio::select! {
                _ = &mut window => break,
                next = wire_rx.next() => match next {
                    Some(Message::Ping(_)) => pings += 1,
                    _ => break,
                },
            }
        }
        assert!(pings <= 3, "{pings} pings delivered back to back");

        writer.abort();
        drop(queue_tx);
    }

    #[tokio::test]
    async fn test_write_failure_ends_pump() {
        let hub = Hub::spawn(16, 16);
        let (alice, _rx) = connect(&hub, "alice").await;

        let (queue_tx, queue_rx) = mpsc::channel::<Payload>(4);
        let (sink, wire_rx) = wire::channel::<Message>(16);
        drop(wire_rx);
        queue_tx.send(Payload::from("lost")).await.unwrap();

        assert!(matches!(
            alice.write_pump(sink, queue_rx).await,
            Err(ConnectionError::Transport(_))
        ));
    }

    #[tokio::test]
    async fn test_serve_unregisters_on_exit() {
        let hub = Hub::spawn(16, 16);
        let (observer, mut observer_rx) = connect(&hub, "observer").await;
        expect_count(&mut observer_rx, 1).await;

        let (alice, alice_rx) = connect(&hub, "alice").await;
        expect_count(&mut observer_rx, 2).await;

        let (sink, mut wire_rx) = wire::channel::<Message>(16);
        alice
            .serve(sink, frames(&[r#"{"content":"bye"}"#]), alice_rx)
            .await;

        let env = next_envelope(&mut observer_rx).await;
        assert_eq!(env.content, "bye");
        expect_count(&mut observer_rx, 1).await;
        wait_for_count(&hub, 1).await;

        // alice saw her count updates and her own message before the close
        let mut last = None;
        while let Some(message) = wire_rx.next().await {
            last = Some(message);
        }
        assert!(matches!(last, Some(Message::Close(None))));
        drop(observer);
    }

    #[tokio::test]
    async fn test_serve_stops_reading_when_writer_exits() {
        let hub = Hub::spawn(16, 16);
        let patient = Timing::new(Duration::from_millis(200), Duration::from_secs(30));
        let (alice, alice_rx) = Connection::register(hub.clone(), user("alice"), 5120, patient)
            .await
            .unwrap();
        let alice_id = alice.id();
        wait_for_count(&hub, 1).await;

        // the peer never sends, so only the writer can end the session
        let (sink, mut wire_rx) = wire::channel::<Message>(16);
        let session = tokio::spawn(alice.serve(sink, stream::pending::<Frame>(), alice_rx));

        // a forced drop releases the outbound queue
        hub.unregister(alice_id).await.unwrap();

        timeout(Duration::from_secs(1), session)
            .await
            .expect("serve kept reading after its writer exited")
            .unwrap();
        wait_for_count(&hub, 0).await;

        let mut last = None;
        while let Some(message) = wire_rx.next().await {
            last = Some(message);
        }
        assert!(matches!(last, Some(Message::Close(None))));
    }

    #[tokio::test]
    async fn test_two_client_session() {
        let hub = Hub::spawn(16, 16);

        let (a, mut a_rx) = connect(&hub, "a").await;
        expect_count(&mut a_rx, 1).await;
        let (_b, mut b_rx) = connect(&hub, "b").await;
        expect_count(&mut a_rx, 2).await;
        expect_count(&mut b_rx, 2).await;

        a.read_pump(frames(&[r#"{"type":"message","content":"hi"}"#]))
            .await
            .unwrap();
        for rx in [&mut a_rx, &mut b_rx] {
            let env = next_envelope(rx).await;
            assert_eq!(env.user_id, "a");
            assert_eq!(env.content, "hi");
        }

        // b's transport dies without an unregister from its own side
        drop(b_rx);
        a.read_pump(frames(&[r#"{"type":"typing"}"#])).await.unwrap();

        assert_eq!(next_envelope(&mut a_rx).await.kind, Some(EnvelopeKind::Typing));
        expect_count(&mut a_rx, 1).await;
        wait_for_count(&hub, 1).await;
    }
}
