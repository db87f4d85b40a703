use std::time::Duration;

use net_sim::{Endpoint, NetSimError, NetworkEdge, Simulator, SimulatorConfig};

async fn two_node_sim(latency_ms: u64) -> (Simulator, net_sim::Node, net_sim::Node) {
    let sim = Simulator::new(SimulatorConfig::default());
    sim.add_node("a").await;
    sim.add_node("b").await;
    sim.add_edge("a", "b", NetworkEdge::new(Duration::from_millis(latency_ms), 1.0)).await;
    sim.add_edge("b", "a", NetworkEdge::new(Duration::from_millis(latency_ms), 1.0)).await;
    sim.start();
    let a = sim.create_node("a");
    let b = sim.create_node("b");
    (sim, a, b)
}

#[tokio::test]
async fn connect_fails_without_a_listener() {
    let (_sim, a, _b) = two_node_sim(1).await;
    let err = a.connect("b", 7000).await.unwrap_err();
    assert!(matches!(err, NetSimError::ConnectionRefused(_)));
}

#[tokio::test]
async fn connect_succeeds_once_the_peer_is_listening_and_bytes_round_trip() {
    let (_sim, a, b) = two_node_sim(5).await;
    let listener = b.bind_port(7000).await.unwrap();

    let client = tokio::spawn(async move { a.connect("b", 7000).await.unwrap() });
    let server = listener.accept().await.unwrap();
    let client = client.await.unwrap();

    assert_eq!(client.remote_endpoint(), &Endpoint::new("b", 7000));

    client.write(b"ping".to_vec()).await.unwrap();
    let received = server.read().await.unwrap();
    assert_eq!(received, b"ping");

    server.write(b"pong".to_vec()).await.unwrap();
    let reply = client.read().await.unwrap();
    assert_eq!(reply, b"pong");
}

#[tokio::test]
async fn closing_a_connection_surfaces_as_connection_closed_on_the_peer() {
    let (_sim, a, b) = two_node_sim(1).await;
    let listener = b.bind_port(7001).await.unwrap();

    let client = tokio::spawn(async move { a.connect("b", 7001).await.unwrap() });
    let server = listener.accept().await.unwrap();
    let client = client.await.unwrap();

    client.close();
    tokio::time::sleep(Duration::from_millis(20)).await;
    let err = server.write(b"too late".to_vec()).await;
    assert!(err.is_ok() || matches!(err, Err(NetSimError::ConnectionClosed)));
    assert!(!client.is_open());
}

#[tokio::test]
async fn bytes_written_in_sequence_arrive_in_the_same_order() {
    let (_sim, a, b) = two_node_sim(2).await;
    let listener = b.bind_port(7002).await.unwrap();

    let client = tokio::spawn(async move { a.connect("b", 7002).await.unwrap() });
    let server = listener.accept().await.unwrap();
    let client = client.await.unwrap();

    for chunk in ["one-", "two-", "three"] {
        client.write(chunk.as_bytes().to_vec()).await.unwrap();
    }

    let mut received = Vec::new();
    while received.len() < "one-two-three".len() {
        received.extend(server.read().await.unwrap());
    }
    assert_eq!(received, b"one-two-three");
}

#[tokio::test]
async fn a_latency_drop_mid_connection_never_reorders_bytes() {
    let (sim, a, b) = two_node_sim(200).await;
    let listener = b.bind_port(7003).await.unwrap();

    let client = tokio::spawn(async move { a.connect("b", 7003).await.unwrap() });
    let server = listener.accept().await.unwrap();
    let client = client.await.unwrap();

    // "first" is sampled against the 200ms edge and is still in flight when
    // the edge heals to 1ms; without deadline clamping "second" would be
    // scheduled to arrive well before "first".
    client.write(b"first-".to_vec()).await.unwrap();
    sim.add_edge("a", "b", NetworkEdge::new(Duration::from_millis(1), 1.0)).await;
    client.write(b"second".to_vec()).await.unwrap();

    let mut received = Vec::new();
    while received.len() < "first-second".len() {
        received.extend(server.read().await.unwrap());
    }
    assert_eq!(received, b"first-second");
}
