//! Per-connection duplex pump.
//!
//! One reader feeds text frames to the [`MessageRouter`]; one writer drains a
//! bounded queue and sends keepalive pings. Closing either side cancels a
//! shared token so both halves stop together, and the connection is
//! unregistered exactly once.

use super::hub::{Connection, Hub};
use super::protocol::OutboundFrame;
use super::router::MessageRouter;
use axum::extract::ws::Message;
use futures_util::{Sink, SinkExt, Stream, StreamExt};
use std::fmt::Display;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::{timeout, Instant};
use tokio_util::sync::CancellationToken;

static NEXT_CONNECTION_ID: AtomicU64 = AtomicU64::new(1);

/// Timing and buffering for every connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConnectionSettings {
    pub outbound_queue: usize,
    pub ping_interval: Duration,
    pub read_deadline: Duration,
    pub write_timeout: Duration,
}

impl Default for ConnectionSettings {
    fn default() -> Self {
        Self {
            outbound_queue: 256,
            ping_interval: Duration::from_secs(30),
            read_deadline: Duration::from_secs(60),
            write_timeout: Duration::from_secs(10),
        }
    }
}

/// The hub-facing half of a live connection.
pub struct ClientConnection {
    id: u64,
    user_id: String,
    outbound: mpsc::Sender<String>,
    cancel: CancellationToken,
}

impl Connection for ClientConnection {
    fn id(&self) -> u64 {
        self.id
    }

    fn user_id(&self) -> &str {
        &self.user_id
    }

    fn push(&self, frame: &OutboundFrame) -> bool {
        let text = match serde_json::to_string(frame) {
            Ok(text) => text,
            Err(e) => {
                tracing::error!(error = %e, "Failed to encode frame");
                return false;
            }
        };
        match self.outbound.try_send(text) {
            Ok(()) => true,
            Err(mpsc::error::TrySendError::Full(_)) => {
                tracing::warn!(
                    user_id = %self.user_id,
                    conn_id = self.id,
                    frame = frame.kind(),
                    "Outbound queue full, dropping frame"
                );
                false
            }
            Err(mpsc::error::TrySendError::Closed(_)) => false,
        }
    }

    fn close(&self) {
        self.cancel.cancel();
    }
}

pub struct ConnectionActor {
    hub: Hub,
    router: Arc<MessageRouter>,
    settings: ConnectionSettings,
}

impl ConnectionActor {
    pub fn new(hub: Hub, router: Arc<MessageRouter>, settings: ConnectionSettings) -> Self {
        Self {
            hub,
            router,
            settings,
        }
    }

    /// Drive one authenticated connection until either side ends it.
    pub async fn run<W, R, E>(&self, user_id: String, sink: W, stream: R)
    where
        W: Sink<Message> + Send + 'static,
        W::Error: Display,
        R: Stream<Item = Result<Message, E>> + Send,
        E: Display,
    {
        let (outbound, queue) = mpsc::channel(self.settings.outbound_queue.max(1));
        let cancel = CancellationToken::new();
        let conn = Arc::new(ClientConnection {
            id: NEXT_CONNECTION_ID.fetch_add(1, Ordering::Relaxed),
            user_id: user_id.clone(),
            outbound,
            cancel: cancel.clone(),
        });

        let writer = tokio::spawn(write_loop(
            sink,
            queue,
            cancel.clone(),
            self.settings,
            conn.id,
        ));

        self.hub.register(conn.clone()).await;
        self.router.announce_presence(&user_id, true);

        self.read_loop(&user_id, stream, &cancel).await;

        cancel.cancel();
        if let Err(e) = writer.await {
            tracing::warn!(user_id = %user_id, error = %e, "Writer task failed");
        }

        // An evicted connection is no longer in the map and stays quiet.
        if self.hub.unregister(conn.as_ref()).await {
            self.router.announce_presence(&user_id, false);
        }
        tracing::debug!(user_id = %user_id, conn_id = conn.id, "Connection closed");
    }

    async fn read_loop<R, E>(&self, user_id: &str, stream: R, cancel: &CancellationToken)
    where
        R: Stream<Item = Result<Message, E>>,
        E: Display,
    {
        let mut stream = std::pin::pin!(stream);
        loop {
            let next = tokio::select! {
                () = cancel.cancelled() => break,
                next = timeout(self.settings.read_deadline, stream.next()) => next,
            };
            match next {
                Err(_) => {
                    tracing::debug!(user_id = %user_id, "Read deadline exceeded");
                    break;
                }
                Ok(None) => break,
                Ok(Some(Err(e))) => {
                    tracing::debug!(user_id = %user_id, error = %e, "Read failed");
                    break;
                }
                Ok(Some(Ok(message))) => match message {
                    Message::Text(text) => self.router.dispatch(user_id, text.as_str()),
                    Message::Close(_) => break,
                    // Pings, pongs and binary frames only renew the deadline.
                    _ => {}
                },
            }
        }
    }
}

async fn write_loop<W>(
    sink: W,
    mut queue: mpsc::Receiver<String>,
    cancel: CancellationToken,
    settings: ConnectionSettings,
    conn_id: u64,
) where
    W: Sink<Message>,
    W::Error: Display,
{
    let mut sink = std::pin::pin!(sink);
    let mut ping = tokio::time::interval_at(
        Instant::now() + settings.ping_interval,
        settings.ping_interval,
    );

    loop {
        let message = tokio::select! {
            () = cancel.cancelled() => break,
            frame = queue.recv() => match frame {
                Some(text) => Message::Text(text.into()),
                None => break,
            },
            _ = ping.tick() => Message::Ping(axum::body::Bytes::new()),
        };
        match timeout(settings.write_timeout, sink.send(message)).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                tracing::debug!(conn_id, error = %e, "Write failed");
                break;
            }
            Err(_) => {
                tracing::warn!(conn_id, "Write timed out");
                break;
            }
        }
    }

    cancel.cancel();
    let _ = timeout(settings.write_timeout, sink.close()).await;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::sqlite::tests::seed_user;
    use crate::store::SqliteStore;
    use futures_util::{sink, stream};
    use tokio::sync::mpsc::{unbounded_channel, UnboundedReceiver, UnboundedSender};

    struct Peer {
        inbound: UnboundedSender<Message>,
        outbound: UnboundedReceiver<Message>,
        task: tokio::task::JoinHandle<()>,
    }

    fn settings() -> ConnectionSettings {
        ConnectionSettings {
            outbound_queue: 8,
            ping_interval: Duration::from_secs(30),
            read_deadline: Duration::from_secs(30),
            write_timeout: Duration::from_secs(1),
        }
    }

    fn setup() -> (Arc<SqliteStore>, Hub, Arc<ConnectionActor>) {
        setup_with(settings())
    }

    fn setup_with(settings: ConnectionSettings) -> (Arc<SqliteStore>, Hub, Arc<ConnectionActor>) {
        let store = Arc::new(SqliteStore::open_in_memory().unwrap());
        for id in ["alice", "bob"] {
            seed_user(&store, id);
        }
        let hub = Hub::spawn();
        let router = Arc::new(MessageRouter::new(
            hub.clone(),
            store.clone(),
            store.clone(),
            store.clone(),
        ));
        let actor = Arc::new(ConnectionActor::new(hub.clone(), router, settings));
        (store, hub, actor)
    }

    /// Run an actor over in-memory channels standing in for a websocket.
    fn connect(actor: &Arc<ConnectionActor>, user_id: &str) -> Peer {
        let (in_tx, in_rx) = unbounded_channel::<Message>();
        let (out_tx, out_rx) = unbounded_channel::<Message>();

        let reader = stream::unfold(in_rx, |mut rx| async move {
            rx.recv().await.map(|m| (Ok::<_, &'static str>(m), rx))
        });
        let writer = sink::unfold(out_tx, |tx, m: Message| async move {
            tx.send(m).map_err(|_| "peer gone")?;
            Ok::<_, &'static str>(tx)
        });

        let actor = Arc::clone(actor);
        let user_id = user_id.to_string();
        let task = tokio::spawn(async move { actor.run(user_id, writer, reader).await });
        Peer {
            inbound: in_tx,
            outbound: out_rx,
            task,
        }
    }

    async fn wait_for(mut cond: impl FnMut() -> bool) {
        for _ in 0..200 {
            if cond() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("condition not reached");
    }

    async fn next_frame(peer: &mut Peer) -> serde_json::Value {
        loop {
            let message = timeout(Duration::from_secs(2), peer.outbound.recv())
                .await
                .expect("frame within deadline")
                .expect("connection still open");
            if let Message::Text(text) = message {
                return serde_json::from_str(text.as_str()).unwrap();
            }
        }
    }

    #[tokio::test]
    async fn relays_message_between_two_connections() {
        let (_store, hub, actor) = setup();
        let mut alice = connect(&actor, "alice");
        let mut bob = connect(&actor, "bob");
        wait_for(|| hub.is_online("alice") && hub.is_online("bob")).await;

        let frame = serde_json::json!({
            "t": "msg",
            "p": {"to": "bob", "encrypted_content": "ct", "temp_id": "t-1"}
        });
        alice
            .inbound
            .send(Message::Text(frame.to_string().into()))
            .unwrap();

        let delivered = next_frame(&mut alice).await;
        assert_eq!(delivered["t"], "delivered");
        assert_eq!(delivered["p"]["temp_id"], "t-1");

        let msg = next_frame(&mut bob).await;
        assert_eq!(msg["t"], "msg");
        assert_eq!(msg["p"]["sender_id"], "alice");
        assert_eq!(msg["p"]["id"], delivered["p"]["message"]["id"]);
    }

    #[tokio::test]
    async fn close_frame_unregisters_and_announces_offline() {
        let (store, hub, actor) = setup();
        store.link_friends("alice", "bob").unwrap();
        let mut bob = connect(&actor, "bob");
        wait_for(|| hub.is_online("bob")).await;

        let alice = connect(&actor, "alice");
        let online = next_frame(&mut bob).await;
        assert_eq!(online, serde_json::json!({"t": "online", "p": {"user_id": "alice"}}));

        alice.inbound.send(Message::Close(None)).unwrap();
        alice.task.await.unwrap();
        assert!(!hub.is_online("alice"));

        let offline = next_frame(&mut bob).await;
        assert_eq!(offline["t"], "offline");
    }

    #[tokio::test]
    async fn takeover_closes_old_connection_without_offline() {
        let (store, hub, actor) = setup();
        store.link_friends("alice", "bob").unwrap();
        let mut bob = connect(&actor, "bob");
        wait_for(|| hub.is_online("bob")).await;

        let first = connect(&actor, "alice");
        assert_eq!(next_frame(&mut bob).await["t"], "online");
        let mut second = connect(&actor, "alice");
        assert_eq!(next_frame(&mut bob).await["t"], "online");

        // The first actor ends on its own once evicted.
        timeout(Duration::from_secs(2), first.task)
            .await
            .expect("evicted connection stops")
            .unwrap();
        assert!(hub.is_online("alice"));

        // Bob hears nothing about alice going offline; frames reach the second.
        let typing = r#"{"t":"typing","p":{"to":"alice","conversation_id":"c1"}}"#;
        bob.inbound.send(Message::Text(typing.into())).unwrap();
        let frame = next_frame(&mut second).await;
        assert_eq!(frame["t"], "typing");
        assert!(bob.outbound.try_recv().is_err());
    }

    #[tokio::test]
    async fn read_deadline_ends_idle_connection() {
        let (_store, hub, actor) = setup_with(ConnectionSettings {
            read_deadline: Duration::from_millis(50),
            ..settings()
        });
        let idle = connect(&actor, "alice");
        timeout(Duration::from_secs(2), idle.task)
            .await
            .expect("idle connection times out")
            .unwrap();
        assert!(!hub.is_online("alice"));
        // Keep the inbound side alive so only the deadline can end it.
        drop(idle.inbound);
    }

    #[tokio::test]
    async fn write_failure_stops_reader_and_unregisters() {
        let (store, hub, actor) = setup_with(ConnectionSettings {
            ping_interval: Duration::from_millis(20),
            ..settings()
        });
        store.link_friends("alice", "bob").unwrap();
        let mut bob = connect(&actor, "bob");
        wait_for(|| hub.is_online("bob")).await;

        // Inbound stays open, so only the writer can end this connection.
        let (_in_tx, in_rx) = unbounded_channel::<Message>();
        let reader = stream::unfold(in_rx, |mut rx| async move {
            rx.recv().await.map(|m| (Ok::<_, &'static str>(m), rx))
        });
        let broken = sink::unfold((), |(), _m: Message| async move {
            Err::<(), &'static str>("socket reset")
        });

        let run = {
            let actor = Arc::clone(&actor);
            tokio::spawn(async move { actor.run("alice".into(), broken, reader).await })
        };
        timeout(Duration::from_secs(2), run)
            .await
            .expect("connection stops after a failed write")
            .unwrap();
        assert!(!hub.is_online("alice"));

        assert_eq!(next_frame(&mut bob).await["t"], "online");
        let offline = next_frame(&mut bob).await;
        assert_eq!(offline, serde_json::json!({"t": "offline", "p": {"user_id": "alice"}}));
    }

    #[tokio::test]
    async fn pings_are_sent_on_interval() {
        let (_store, _hub, actor) = setup_with(ConnectionSettings {
            ping_interval: Duration::from_millis(20),
            ..settings()
        });
        let mut peer = connect(&actor, "alice");
        let first = timeout(Duration::from_secs(2), peer.outbound.recv())
            .await
            .unwrap()
            .unwrap();
        assert!(matches!(first, Message::Ping(_)));
    }

    #[tokio::test]
    async fn full_queue_drops_newest_frame() {
        let (tx, mut rx) = mpsc::channel(1);
        let conn = ClientConnection {
            id: 1,
            user_id: "alice".into(),
            outbound: tx,
            cancel: CancellationToken::new(),
        };
        let frame = OutboundFrame::Online {
            user_id: "bob".into(),
        };
        assert!(conn.push(&frame));
        assert!(!conn.push(&OutboundFrame::Offline {
            user_id: "bob".into()
        }));
        let queued = rx.recv().await.unwrap();
        assert!(queued.contains("online"));
        assert!(rx.try_recv().is_err());
    }
}
