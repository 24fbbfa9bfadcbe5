//! Run an overlay node over UDP that echoes application messages back.
//!
//! Run: `cargo run --example node -- --port 5483`
//! and: `cargo run --example node -- --port 5484 --bootstrap 127.0.0.1:5483 --send hello`

use std::net::{IpAddr, SocketAddr};
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use overlay_routing::transport::udp::{UdpTransport, DEFAULT_PORT};
use overlay_routing::{Config, Id, Message, Router};
use tracing::Level;

/// Message type used by this demo.
const ECHO: u32 = 150;

#[derive(Parser)]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Address to listen on
    #[arg(long, default_value = "127.0.0.1")]
    ip: IpAddr,
    /// Port to listen on
    #[arg(short, long, default_value_t = DEFAULT_PORT)]
    port: u16,
    /// Nodes to join the overlay through
    #[arg(short, long)]
    bootstrap: Vec<SocketAddr>,
    /// Id of this node, random if omitted
    #[arg(long)]
    id: Option<String>,
    /// Payload to send to a random destination once joined
    #[arg(short, long)]
    send: Option<String>,
    /// Log at debug level
    #[arg(short, long)]
    verbose: bool,
}

fn main() {
    let cli = Cli::parse();

    tracing_subscriber::fmt()
        .with_max_level(if cli.verbose {
            Level::DEBUG
        } else {
            Level::INFO
        })
        .init();

    let id = cli
        .id
        .as_deref()
        .map(|id| Id::from_str(id).expect("invalid id"));

    let transport = UdpTransport::bind(SocketAddr::new(cli.ip, cli.port)).expect("could not bind");

    let router = Router::new(
        Config {
            id,
            bootstrap: cli.bootstrap,
            ..Default::default()
        },
        Arc::new(transport),
    )
    .expect("could not start router");

    println!("Node {} listening on {}", router.id(), router.local_addr());

    router.on_network_status().subscribe(|size| {
        println!("Routing table size: {size}");
    });

    let responder = router.clone();
    router.on_message_received().subscribe(move |(kind, request)| {
        if *kind != ECHO {
            return;
        }

        println!(
            "Echoing {:?} from {}",
            String::from_utf8_lossy(&request.payload),
            request.source_id
        );

        let reply = request.reply(responder.id(), request.payload.clone());
        if let Err(error) = responder.forward(reply) {
            println!("Could not echo: {error}");
        }
    });

    if let Some(payload) = cli.send {
        // Give the bootstrap exchange a moment.
        std::thread::sleep(Duration::from_millis(500));

        let request = Message::new(ECHO, router.id(), Id::random(), payload.into_bytes());

        match router.send_blocking(request) {
            Ok(response) => println!(
                "Response from {}: {:?}",
                response.source_id,
                String::from_utf8_lossy(&response.payload)
            ),
            Err(error) => println!("Request failed: {error}"),
        }
    }

    let (tx_interrupted, rx_interrupted) = flume::bounded::<()>(1);

    ctrlc::set_handler(move || {
        println!();
        println!("Received Ctrl+C! Shutting down.");
        let _ = tx_interrupted.send(());
    })
    .expect("Error setting Ctrl-C handler");

    while rx_interrupted
        .recv_timeout(Duration::from_secs(30))
        .is_err()
    {
        println!(
            "{} peers, close group of {}, {} pending requests",
            router.size(),
            router.close_group().len(),
            router.pending_requests()
        );
    }
}
