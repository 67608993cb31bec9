//! End-to-end tests: a relay node on a loopback port, an in-process
//! backbone, and real WebSocket clients.

use async_trait::async_trait;
use bytes::Bytes;
use futures::{SinkExt, StreamExt};
use pubsub_client::{Backbone, MemoryBackbone};
use relay::{
    ChannelTopology, Ingestor, Payload, PresenceAnnouncement, RelayConfig, RelayHandle,
    RelayServer, StaticTokenValidator,
};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::sync::Mutex;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};

type Client = WebSocketStream<MaybeTlsStream<TcpStream>>;

#[derive(Default)]
struct Recorder {
    received: Mutex<Vec<(String, Payload)>>,
}

#[async_trait]
impl Ingestor for Recorder {
    async fn forward(&self, user_id: &str, payload: Payload) -> relay::Result<()> {
        self.received.lock().await.push((user_id.to_string(), payload));
        Ok(())
    }
}

struct Node {
    handle: RelayHandle,
    backbone: Arc<MemoryBackbone>,
    recorder: Arc<Recorder>,
}

async fn start_node(topology: ChannelTopology) -> Node {
    let backbone = Arc::new(MemoryBackbone::new());
    let recorder = Arc::new(Recorder::default());
    let validator = StaticTokenValidator::new()
        .with_token("alice-token", "alice")
        .with_token("alice-token-2", "alice")
        .with_token("carol-token", "carol");

    let config = RelayConfig {
        listen_addr: "127.0.0.1:0".parse().unwrap(),
        node_id: "node-a".into(),
        topology,
        static_tokens: Some("unused".into()),
        shutdown_grace: Duration::from_secs(2),
        ..RelayConfig::default()
    };

    let handle = RelayServer::start(
        config,
        Arc::new(validator),
        recorder.clone(),
        backbone.clone(),
    )
    .await
    .unwrap();

    // Deliveries published before the bridge subscribes would be lost.
    eventually(|| backbone.subscriber_count() > 0).await;

    Node {
        handle,
        backbone,
        recorder,
    }
}

async fn eventually(mut check: impl FnMut() -> bool) {
    for _ in 0..200 {
        if check() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("condition not reached");
}

async fn connect(node: &Node, user_id: &str, token: &str) -> Client {
    let url = format!(
        "ws://{}/ws?user_id={}&token={}",
        node.handle.local_addr(),
        user_id,
        token
    );
    let (client, _) = connect_async(url).await.unwrap();
    client
}

async fn connect_registered(node: &Node, user_id: &str, token: &str) -> Client {
    let client = connect(node, user_id, token).await;
    eventually(|| node.handle.registry().lookup(user_id).is_some()).await;
    client
}

async fn publish(node: &Node, channel: &str, envelope: &str) {
    node.backbone
        .publish(channel, Bytes::from(envelope.to_string()))
        .await
        .unwrap();
}

/// Next data frame, skipping keepalives.
async fn next_data(client: &mut Client) -> Option<Message> {
    let read = async {
        while let Some(msg) = client.next().await {
            match msg {
                Ok(Message::Ping(_)) | Ok(Message::Pong(_)) => continue,
                Ok(msg) => return Some(msg),
                Err(_) => return None,
            }
        }
        None
    };
    tokio::time::timeout(Duration::from_secs(5), read)
        .await
        .expect("timed out waiting for a frame")
}

#[tokio::test]
async fn delivers_envelope_to_connected_user() {
    let node = start_node(ChannelTopology::Shared).await;
    let mut alice = connect_registered(&node, "alice", "alice-token").await;

    publish(&node, "chat:global", r#"{"destination":"alice","payload":"hi"}"#).await;

    let msg = next_data(&mut alice).await.unwrap();
    assert_eq!(msg.to_text().unwrap(), "hi");

    eventually(|| node.handle.bridge_stats().delivered == 1).await;
    node.handle.stop().await.unwrap();
}

#[tokio::test]
async fn envelope_for_absent_user_is_a_miss() {
    let node = start_node(ChannelTopology::Shared).await;
    let mut alice = connect_registered(&node, "alice", "alice-token").await;

    publish(&node, "chat:global", r#"{"to":"carol","payload":"anyone?"}"#).await;
    publish(&node, "chat:global", r#"{"to":"alice","payload":{"kind":"ping"}}"#).await;

    // Alice only sees her own envelope, verbatim.
    let msg = next_data(&mut alice).await.unwrap();
    assert_eq!(msg.to_text().unwrap(), r#"{"kind":"ping"}"#);

    eventually(|| node.handle.bridge_stats().misses == 1).await;
    node.handle.stop().await.unwrap();
}

#[tokio::test]
async fn rejects_invalid_token() {
    let node = start_node(ChannelTopology::Shared).await;
    let mut events = node.handle.registry().subscribe_events();
    let mut bob = connect(&node, "bob", "not-a-token").await;

    match next_data(&mut bob).await {
        None | Some(Message::Close(None)) => {}
        other => panic!("expected close without reason, got {:?}", other),
    }
    assert!(events.try_recv().is_err());
    assert!(node.handle.registry().is_empty());

    node.handle.stop().await.unwrap();
}

#[tokio::test]
async fn rejects_token_for_other_user() {
    let node = start_node(ChannelTopology::Shared).await;
    let mut mallory = connect(&node, "alice", "carol-token").await;

    assert!(matches!(
        next_data(&mut mallory).await,
        None | Some(Message::Close(None))
    ));
    assert!(node.handle.registry().lookup("alice").is_none());

    node.handle.stop().await.unwrap();
}

#[tokio::test]
async fn accepts_bearer_token_header() {
    let node = start_node(ChannelTopology::Shared).await;
    let mut request = format!("ws://{}/ws?user_id=alice", node.handle.local_addr())
        .into_client_request()
        .unwrap();
    request
        .headers_mut()
        .insert("Authorization", "Bearer alice-token".parse().unwrap());
    let (mut alice, _) = connect_async(request).await.unwrap();
    eventually(|| node.handle.registry().lookup("alice").is_some()).await;

    publish(&node, "chat:global", r#"{"destination":"alice","payload":"via header"}"#).await;
    assert_eq!(
        next_data(&mut alice).await.unwrap().to_text().unwrap(),
        "via header"
    );

    node.handle.stop().await.unwrap();
}

#[tokio::test]
async fn reconnect_replaces_previous_connection() {
    let node = start_node(ChannelTopology::Shared).await;
    let mut first = connect_registered(&node, "alice", "alice-token").await;
    let first_id = node.handle.registry().lookup("alice").unwrap().id;

    let mut second = connect(&node, "alice", "alice-token-2").await;
    eventually(|| {
        node.handle
            .registry()
            .lookup("alice")
            .is_some_and(|c| c.id != first_id)
    })
    .await;

    match next_data(&mut first).await {
        Some(Message::Close(Some(frame))) => assert_eq!(u16::from(frame.code), 4000),
        other => panic!("expected replacement close, got {:?}", other),
    }

    publish(&node, "chat:global", r#"{"destination":"alice","payload":"latest"}"#).await;
    assert_eq!(next_data(&mut second).await.unwrap().to_text().unwrap(), "latest");
    assert_eq!(node.handle.registry().len(), 1);

    node.handle.stop().await.unwrap();
}

#[tokio::test]
async fn forwards_client_messages() {
    let node = start_node(ChannelTopology::Shared).await;
    let mut alice = connect_registered(&node, "alice", "alice-token").await;

    alice
        .send(Message::Text(r#"{"to":"carol","text":"hey"}"#.into()))
        .await
        .unwrap();

    eventually(|| {
        node.recorder
            .received
            .try_lock()
            .map(|r| r.len() == 1)
            .unwrap_or(false)
    })
    .await;
    let received = node.recorder.received.lock().await;
    assert_eq!(received[0].0, "alice");
    assert_eq!(
        received[0].1,
        Payload::Text(r#"{"to":"carol","text":"hey"}"#.into())
    );
    drop(received);

    node.handle.stop().await.unwrap();
}

#[tokio::test]
async fn stop_closes_open_connections() {
    let node = start_node(ChannelTopology::Shared).await;
    let mut alice = connect_registered(&node, "alice", "alice-token").await;
    let backbone = node.backbone.clone();

    node.handle.stop().await.unwrap();

    assert!(matches!(
        next_data(&mut alice).await,
        None | Some(Message::Close(_))
    ));
    // Bridge has unsubscribed.
    eventually(|| backbone.subscriber_count() == 0).await;
}

#[tokio::test]
async fn per_node_topology_routes_node_channel_and_announces_presence() {
    let node = start_node(ChannelTopology::PerNode).await;
    let mut presence = node
        .backbone
        .subscribe(&["chat:global:presence".to_string()])
        .await
        .unwrap();

    let mut alice = connect_registered(&node, "alice", "alice-token").await;

    let announced = tokio::time::timeout(Duration::from_secs(5), presence.next())
        .await
        .unwrap()
        .unwrap();
    let announced: PresenceAnnouncement = serde_json::from_slice(&announced.payload).unwrap();
    assert_eq!(announced.user_id, "alice");
    assert_eq!(announced.node_id, "node-a");
    assert!(announced.online);

    publish(
        &node,
        "chat:global:node:node-a",
        r#"{"destination":"alice","payload":"direct"}"#,
    )
    .await;
    assert_eq!(next_data(&mut alice).await.unwrap().to_text().unwrap(), "direct");

    node.handle.stop().await.unwrap();
}
