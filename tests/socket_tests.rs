//! Socket-layer tests over real TCP connections: lifecycle events, envelope
//! framing in both directions, shutdown semantics and the broker wiring.

use async_trait::async_trait;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::AsyncReadExt;
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::time::timeout;

use corriere::domain::{BrokerError, Result};
use corriere::infrastructure::broker::MessageBroker;
use corriere::infrastructure::client::{BodyReader, ClientEvents, SocketClient};
use corriere::infrastructure::handler::{BrokerHandler, MAX_BODY_SIZE};
use corriere::infrastructure::server::SocketServer;
use corriere::settings::BrokerSettings;
use tempfile::TempDir;

#[derive(Debug, PartialEq, Eq)]
enum Event {
    Started(u64),
    Stopped(u64),
    Message { meta: String, body: Vec<u8> },
}

/// Records every callback on a channel; optionally echoes messages back.
struct Recorder {
    tx: mpsc::UnboundedSender<Event>,
    echo: bool,
}

impl Recorder {
    fn new(echo: bool) -> (Arc<Self>, mpsc::UnboundedReceiver<Event>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Arc::new(Self { tx, echo }), rx)
    }
}

#[async_trait]
impl ClientEvents for Recorder {
    async fn on_started(&self, client: &Arc<SocketClient>) -> Result<()> {
        let _ = self.tx.send(Event::Started(client.id()));
        Ok(())
    }

    async fn on_stopped(&self, client: &Arc<SocketClient>) -> Result<()> {
        let _ = self.tx.send(Event::Stopped(client.id()));
        Ok(())
    }

    async fn on_message(
        &self,
        client: &Arc<SocketClient>,
        meta: &str,
        body_size: u64,
        body: &mut BodyReader<'_>,
    ) -> Result<()> {
        let mut payload = vec![0u8; body_size as usize];
        body.read_exact(&mut payload).await?;
        if self.echo {
            client.send(&format!("echo {meta}"), &payload).await?;
        }
        let _ = self.tx.send(Event::Message {
            meta: meta.to_string(),
            body: payload,
        });
        Ok(())
    }
}

async fn start_server(events: Arc<dyn ClientEvents>) -> (SocketServer, SocketAddr) {
    let server = SocketServer::new(vec![IpAddr::V4(Ipv4Addr::LOCALHOST)], 0);
    server.register_events(events);
    let addrs = server.start().await.expect("server start");
    (server, addrs[0])
}

async fn next_event(rx: &mut mpsc::UnboundedReceiver<Event>) -> Event {
    timeout(Duration::from_secs(5), rx.recv())
        .await
        .expect("timed out waiting for event")
        .expect("event channel closed")
}

async fn next_reply(rx: &mut mpsc::UnboundedReceiver<Event>) -> (String, Vec<u8>) {
    match next_event(rx).await {
        Event::Message { meta, body } => (meta, body),
        other => panic!("expected a reply, got {other:?}"),
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn client_connect_and_close_fire_lifecycle_events() {
    let (recorder, mut rx) = Recorder::new(false);
    let (server, addr) = start_server(recorder).await;

    let stream = TcpStream::connect(addr).await.expect("connect");
    let started = next_event(&mut rx).await;
    let Event::Started(id) = started else {
        panic!("expected Started, got {started:?}");
    };

    drop(stream);
    assert_eq!(next_event(&mut rx).await, Event::Stopped(id));

    server.stop().await.expect("stop");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn envelopes_round_trip_in_both_directions() {
    let (recorder, mut server_rx) = Recorder::new(true);
    let (server, addr) = start_server(recorder).await;

    let client = SocketClient::connect(&addr.ip().to_string(), addr.port())
        .await
        .expect("client connect");
    let (client_events, mut client_rx) = Recorder::new(false);
    client.start(client_events);
    assert!(matches!(next_event(&mut client_rx).await, Event::Started(_)));

    // a body larger than the 4 KiB send chunk, to exercise chunked writes
    let body: Vec<u8> = (0..100_000u32).map(|i| i as u8).collect();
    client.send("produce orders", &body).await.expect("send");

    assert!(matches!(next_event(&mut server_rx).await, Event::Started(_)));
    let received = next_event(&mut server_rx).await;
    assert_eq!(
        received,
        Event::Message {
            meta: "produce orders".to_string(),
            body: body.clone(),
        }
    );

    // the echoed reply comes back through the client's own read loop
    let reply = next_event(&mut client_rx).await;
    let Event::Message {
        meta: reply_meta,
        body: reply_body,
    } = reply
    else {
        panic!("expected a reply message, got {reply:?}");
    };
    assert_eq!(reply_meta, "echo produce orders");
    assert_eq!(reply_body, body);

    client.dispose().await;
    server.stop().await.expect("stop");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn empty_body_envelopes_are_valid() {
    let (recorder, mut rx) = Recorder::new(false);
    let (server, addr) = start_server(recorder).await;

    let client = SocketClient::connect(&addr.ip().to_string(), addr.port())
        .await
        .expect("client connect");
    client.send("ping", &[]).await.expect("send");

    assert!(matches!(next_event(&mut rx).await, Event::Started(_)));
    assert_eq!(
        next_event(&mut rx).await,
        Event::Message {
            meta: "ping".to_string(),
            body: Vec::new(),
        }
    );

    client.dispose().await;
    server.stop().await.expect("stop");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn dispose_fires_the_stop_callback() {
    let (server_events, _server_rx) = Recorder::new(false);
    let (server, addr) = start_server(server_events).await;

    let client = SocketClient::connect(&addr.ip().to_string(), addr.port())
        .await
        .expect("client connect");
    let (client_events, mut rx) = Recorder::new(false);
    client.start(client_events);
    assert!(matches!(next_event(&mut rx).await, Event::Started(_)));

    client.dispose().await;
    assert!(matches!(next_event(&mut rx).await, Event::Stopped(_)));

    server.stop().await.expect("stop");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn send_to_an_unknown_client_is_an_error() {
    let (recorder, _rx) = Recorder::new(false);
    let (server, _addr) = start_server(recorder).await;

    assert!(matches!(
        server.send_to(4242, "meta", &[]).await,
        Err(BrokerError::ClientNotFound(4242))
    ));
    server.stop().await.expect("stop");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn stopping_twice_is_an_operational_error() {
    let (recorder, _rx) = Recorder::new(false);
    let (server, _addr) = start_server(recorder).await;

    server.stop().await.expect("first stop");
    assert!(matches!(
        server.stop().await,
        Err(BrokerError::AlreadyStopped)
    ));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn stopped_server_refuses_new_connections() {
    let (recorder, mut rx) = Recorder::new(false);
    let (server, addr) = start_server(recorder).await;
    server.stop().await.expect("stop");

    // the listener is gone; a fresh connection must not produce events
    let connect = TcpStream::connect(addr).await;
    if let Ok(mut stream) = connect {
        // even if the OS accepted it before teardown, the server ignores it
        let mut buf = [0u8; 1];
        let read = timeout(Duration::from_millis(500), stream.read(&mut buf)).await;
        assert!(!matches!(read, Ok(Ok(n)) if n > 0));
    }
    assert!(
        timeout(Duration::from_millis(500), rx.recv()).await.is_err(),
        "no lifecycle events after stop"
    );
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn oversized_bodies_are_refused_without_desync() {
    let dir = TempDir::new().expect("tempdir");
    let broker = Arc::new(MessageBroker::new(BrokerSettings {
        storage_dir: dir.path().to_path_buf(),
        segment_split: 100,
        ..BrokerSettings::default()
    }));

    let (server, addr) = start_server(Arc::new(BrokerHandler::new(Arc::clone(&broker)))).await;

    let client = SocketClient::connect(&addr.ip().to_string(), addr.port())
        .await
        .expect("client connect");
    let (client_events, mut replies) = Recorder::new(false);
    client.start(client_events);
    assert!(matches!(next_event(&mut replies).await, Event::Started(_)));

    let body = vec![0u8; MAX_BODY_SIZE as usize + 1];
    client.send("produce orders", &body).await.expect("send");
    let (meta, _) = next_reply(&mut replies).await;
    assert!(meta.starts_with("err "), "unexpected refusal reply: {meta}");

    // the oversized body was drained, so the next envelope still parses
    client
        .send("produce orders", b"small")
        .await
        .expect("send after refusal");
    let (meta, _) = next_reply(&mut replies).await;
    assert!(meta.starts_with("ok 0 "), "framing lost after refusal: {meta}");

    client.dispose().await;
    server.stop().await.expect("server stop");
    broker.stop().expect("broker stop");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn broker_handler_serves_the_command_grammar_end_to_end() {
    let dir = TempDir::new().expect("tempdir");
    let broker = Arc::new(MessageBroker::new(BrokerSettings {
        storage_dir: dir.path().to_path_buf(),
        segment_split: 100,
        ..BrokerSettings::default()
    }));

    let (server, addr) = start_server(Arc::new(BrokerHandler::new(Arc::clone(&broker)))).await;

    let client = SocketClient::connect(&addr.ip().to_string(), addr.port())
        .await
        .expect("client connect");
    let (client_events, mut replies) = Recorder::new(false);
    client.start(client_events);
    assert!(matches!(next_event(&mut replies).await, Event::Started(_)));

    // produce, then read the record back through every consume flavor
    client
        .send("produce orders order-created", b"order #42")
        .await
        .expect("send produce");
    let (meta, _) = next_reply(&mut replies).await;
    assert!(meta.starts_with("ok 0 "), "unexpected produce reply: {meta}");

    client
        .send("consume orders workers", &[])
        .await
        .expect("send consume");
    let (meta, body) = next_reply(&mut replies).await;
    assert!(meta.starts_with("msg 0 "), "unexpected consume reply: {meta}");
    assert!(meta.ends_with(" order-created"));
    assert_eq!(body, b"order #42");

    client
        .send("consume orders workers", &[])
        .await
        .expect("send consume");
    let (meta, _) = next_reply(&mut replies).await;
    assert_eq!(meta, "none");

    client.send("peek orders 0", &[]).await.expect("send peek");
    let (meta, body) = next_reply(&mut replies).await;
    assert!(meta.starts_with("msg 0 "));
    assert!(body.is_empty(), "peek must not return the body");

    client
        .send("seek orders workers 0", &[])
        .await
        .expect("send seek");
    let (meta, _) = next_reply(&mut replies).await;
    assert_eq!(meta, "ok");

    client
        .send("consume orders workers", &[])
        .await
        .expect("send consume");
    let (meta, body) = next_reply(&mut replies).await;
    assert!(meta.starts_with("msg 0 "));
    assert_eq!(body, b"order #42");

    client.send("topics", &[]).await.expect("send topics");
    let (meta, _) = next_reply(&mut replies).await;
    assert_eq!(meta, "orders");

    client.send("nonsense", &[]).await.expect("send nonsense");
    let (meta, _) = next_reply(&mut replies).await;
    assert!(meta.starts_with("err "));

    client
        .send("peek orders notanumber", &[])
        .await
        .expect("send bad offset");
    let (meta, _) = next_reply(&mut replies).await;
    assert!(meta.starts_with("err "), "bad offsets answer err: {meta}");

    client.dispose().await;
    server.stop().await.expect("server stop");
    broker.stop().expect("broker stop");
}
