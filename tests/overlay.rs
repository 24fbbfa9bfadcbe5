//! Multi-node overlays on a simulated network.
//!
//! Run with: cargo test --test overlay

use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use overlay_routing::transport::memory::MemoryNetwork;
use overlay_routing::transport::udp::UdpTransport;
use overlay_routing::{Bytes, Config, Error, Id, Message, Router, ID_SIZE};

/// Start `size` nodes, each joining through the first one.
fn overlay(network: &Arc<MemoryNetwork>, size: usize, config: impl Fn() -> Config) -> Vec<Router> {
    let mut nodes: Vec<Router> = Vec::with_capacity(size);

    for _ in 0..size {
        let bootstrap: Vec<SocketAddr> = nodes.first().map(Router::local_addr).into_iter().collect();

        let node = Router::new(
            Config {
                bootstrap,
                ..config()
            },
            network.bind(),
        )
        .unwrap();
        network.deliver_all();

        nodes.push(node);
    }

    nodes
}

/// Id at XOR distance 1 from `id`.
fn next_to(id: &Id) -> Id {
    let mut bytes = *id.as_bytes();
    bytes[ID_SIZE - 1] ^= 1;
    Id::from(bytes)
}

/// Reply to every application message with its own payload reversed.
fn serve_reversed(node: &Router) {
    let responder = node.clone();

    node.on_message_received().subscribe(move |(_, request)| {
        let mut payload = request.payload.to_vec();
        payload.reverse();

        let _ = responder.forward(request.reply(responder.id(), payload));
    });
}

#[test]
fn join_builds_full_mesh() {
    let network = MemoryNetwork::new();
    let nodes = overlay(&network, 12, Config::default);

    for node in &nodes {
        assert_eq!(node.size(), nodes.len() - 1, "{:?}", node);
        assert_eq!(node.pending_requests(), 0);
    }
}

#[test]
fn request_response_across_overlay() {
    let network = MemoryNetwork::new();
    let nodes = overlay(&network, 8, Config::default);

    let (client, server) = (&nodes[3], &nodes[6]);

    let served = Arc::new(AtomicUsize::new(0));
    for node in &nodes {
        serve_reversed(node);

        let served = served.clone();
        node.on_message_received().subscribe(move |_| {
            served.fetch_add(1, Ordering::SeqCst);
        });
    }

    let (tx, rx) = flume::bounded(1);
    let request = Message::new(150, client.id(), next_to(&server.id()), &b"abc"[..]);

    client
        .send(request, move |response| {
            let _ = tx.send(response);
        })
        .unwrap();
    network.deliver_all();

    let response = rx.try_recv().unwrap().unwrap();

    assert_eq!(response.payload, Bytes::from_static(b"cba"));
    assert_eq!(response.source_id, server.id());
    assert_eq!(response.destination_id, client.id());
    assert_eq!(served.load(Ordering::SeqCst), 1);
}

#[test]
fn replicas_reach_close_peers() {
    let network = MemoryNetwork::new();
    let nodes = overlay(&network, 10, Config::default);

    let destination = next_to(&nodes[5].id());

    let delivered = Arc::new(AtomicUsize::new(0));
    for node in &nodes {
        let delivered = delivered.clone();
        node.on_message_received().subscribe(move |_| {
            delivered.fetch_add(1, Ordering::SeqCst);
        });
    }

    let before = network.delivered();

    let message = Message::new(200, nodes[0].id(), destination, &b"data"[..]).with_replication(3);
    nodes[0].forward(message).unwrap();
    network.deliver_all();

    // One hop to the closest node, then three replicas.
    assert_eq!(network.delivered() - before, 4);
    // Replicas are not reported to observers.
    assert_eq!(delivered.load(Ordering::SeqCst), 1);
}

#[test]
fn unanswered_request_times_out() {
    let network = MemoryNetwork::new();
    let nodes = overlay(&network, 3, || Config {
        request_timeout: Duration::from_millis(100),
        ..Default::default()
    });

    let (tx, rx) = flume::bounded(1);
    let request = Message::new(150, nodes[0].id(), next_to(&nodes[2].id()), Bytes::new());

    let id = nodes[0]
        .send(request, move |response| {
            let _ = tx.send(response);
        })
        .unwrap();
    network.deliver_all();

    assert!(matches!(
        rx.recv_timeout(Duration::from_secs(5)).unwrap(),
        Err(Error::RequestTimeout(timed_out)) if timed_out == id
    ));
    assert_eq!(nodes[0].pending_requests(), 0);
}

#[test]
fn bootstrap_from_replaces_peers() {
    let network = MemoryNetwork::new();
    let first = overlay(&network, 4, Config::default);
    let second = overlay(&network, 3, Config::default);

    let node = &first[1];
    assert_eq!(node.size(), 3);

    let (tx, rx) = flume::unbounded();
    node.on_network_status().subscribe(move |size| {
        let _ = tx.send(*size);
    });

    assert_eq!(node.bootstrap_from(second[0].local_addr()), 1);
    network.deliver_all();

    assert_eq!(rx.try_recv().unwrap(), 0);
    assert_eq!(node.bootstrap(), vec![second[0].local_addr()]);

    let known: Vec<Id> = node.routing_table().nodes().map(|peer| peer.id).collect();
    assert_eq!(known.len(), second.len());
    for peer in &second {
        assert!(known.contains(&peer.id()));
    }
}

#[test]
fn dropped_node_is_no_longer_a_hop() {
    let network = MemoryNetwork::new();
    let nodes = overlay(&network, 4, Config::default);

    let target = nodes[3].id();
    assert!(nodes[0].drop_node(&target).is_some());

    let message = Message::new(150, nodes[0].id(), target, Bytes::new());
    let hop = nodes[0].forward(message).unwrap();

    assert_ne!(hop, target);
}

#[test]
fn udp_join_and_ping_pong() {
    let localhost: SocketAddr = ([127, 0, 0, 1], 0).into();

    let server = Router::new(
        Config::default(),
        Arc::new(UdpTransport::bind(localhost).unwrap()),
    )
    .unwrap();
    serve_reversed(&server);

    let client = Router::new(
        Config {
            bootstrap: vec![server.local_addr()],
            ..Default::default()
        },
        Arc::new(UdpTransport::bind(localhost).unwrap()),
    )
    .unwrap();

    let deadline = std::time::Instant::now() + Duration::from_secs(5);
    while client.size() == 0 && std::time::Instant::now() < deadline {
        std::thread::sleep(Duration::from_millis(10));
    }
    assert_eq!(client.size(), 1);

    let request = Message::new(150, client.id(), next_to(&server.id()), &b"ping"[..]);
    let response = client.send_blocking(request).unwrap();

    assert_eq!(response.payload.as_ref(), b"gnip");
}

#[cfg(feature = "async")]
#[test]
fn send_async() {
    let network = MemoryNetwork::new();
    let nodes = overlay(&network, 2, Config::default);
    serve_reversed(&nodes[1]);

    let client = nodes[0].clone();
    let request = Message::new(150, client.id(), next_to(&nodes[1].id()), &b"xy"[..]);

    let pump = {
        let network = network.clone();
        std::thread::spawn(move || {
            for _ in 0..50 {
                network.deliver_all();
                std::thread::sleep(Duration::from_millis(10));
            }
        })
    };

    let response = futures::executor::block_on(client.send_async(request)).unwrap();
    pump.join().unwrap();

    assert_eq!(response.payload.as_ref(), b"yx");
}
