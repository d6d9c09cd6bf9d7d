#![allow(clippy::unwrap_used, clippy::panic)] // Integration tests use unwrap for brevity

//! End-to-end tests for the HTTP/1.1 proxy listener.
//!
//! Runs `serve_tcp` on a loopback port with an in-memory ticket ledger and a
//! static user, then speaks raw HTTP/1.1 to it.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio_util::sync::CancellationToken;

use tollgate_core::config::TunnelConfig;
use tollgate_core::db::unix_millis;
use tollgate_relay::auth::password::hash_password;
use tollgate_relay::auth::{Admission, UserDirectory};
use tollgate_relay::dispatch::Dispatcher;
use tollgate_relay::ledger::Ledger;
use tollgate_relay::server::serve_tcp;
use tollgate_relay::storage::{Grant, TicketDatabase};

struct Relay {
    addr: SocketAddr,
    db: TicketDatabase,
    shutdown: CancellationToken,
}

impl Drop for Relay {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

async fn start_relay() -> Relay {
    let db = TicketDatabase::open_in_memory().await.unwrap();
    let users = UserDirectory::new(HashMap::from([(
        "alice".to_string(),
        hash_password("wonderland").unwrap(),
    )]));
    let admission = Admission::new(users.subscribe(), Arc::new(db.clone()));
    let config = TunnelConfig {
        meter_interval_ms: 50,
        ..TunnelConfig::default()
    };
    let dispatcher = Arc::new(Dispatcher::new(admission, &config));

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let shutdown = CancellationToken::new();
    tokio::spawn(serve_tcp(listener, None, dispatcher, shutdown.clone()));

    Relay { addr, db, shutdown }
}

async fn echo_server() -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        while let Ok((mut stream, _)) = listener.accept().await {
            tokio::spawn(async move {
                let (mut r, mut w) = stream.split();
                let _ = tokio::io::copy(&mut r, &mut w).await;
            });
        }
    });
    addr
}

async fn grant(db: &TicketDatabase, token: &str, bytes: i64, pay_order: &str) {
    db.create_ticket(
        &Grant {
            token: token.to_string(),
            bytes,
            days: 1,
            buy_order: String::new(),
            pay_order: pay_order.to_string(),
        },
        unix_millis(),
    )
    .await
    .unwrap();
}

fn basic(user: &str, pass: &str) -> String {
    format!(
        "Proxy-Authorization: Basic {}\r\n",
        STANDARD.encode(format!("{user}:{pass}"))
    )
}

/// Read a response head byte by byte so tunnelled data stays in the socket.
async fn read_head(stream: &mut TcpStream) -> String {
    let mut head = Vec::new();
    while !head.ends_with(b"\r\n\r\n") {
        let mut byte = [0u8; 1];
        let n = stream.read(&mut byte).await.unwrap();
        assert!(n > 0, "connection closed inside response head");
        head.push(byte[0]);
    }
    String::from_utf8(head).unwrap().to_ascii_lowercase()
}

async fn connect(relay: &Relay, target: SocketAddr, auth: &str) -> (TcpStream, String) {
    let mut stream = TcpStream::connect(relay.addr).await.unwrap();
    stream
        .write_all(format!("CONNECT {target} HTTP/1.1\r\nHost: {target}\r\n{auth}\r\n").as_bytes())
        .await
        .unwrap();
    let head = read_head(&mut stream).await;
    (stream, head)
}

/// Send a one-shot request and return the whole response.
async fn exchange(relay: &Relay, request: &str) -> String {
    let mut stream = TcpStream::connect(relay.addr).await.unwrap();
    stream.write_all(request.as_bytes()).await.unwrap();
    let mut out = Vec::new();
    stream.read_to_end(&mut out).await.unwrap();
    String::from_utf8(out).unwrap()
}

async fn echo_roundtrip(stream: &mut TcpStream, payload: &[u8]) {
    stream.write_all(payload).await.unwrap();
    let mut buf = vec![0u8; payload.len()];
    stream.read_exact(&mut buf).await.unwrap();
    assert_eq!(buf, payload);
}

async fn wait_for_balance(db: &TicketDatabase, token: &str, expected: i64) {
    for _ in 0..100 {
        let tickets = db.list(token, 1).await.unwrap();
        if tickets[0].bytes == expected {
            return;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    panic!("balance of {token} never reached {expected}");
}

#[tokio::test]
async fn connect_without_credentials_is_challenged() {
    let relay = start_relay().await;
    let echo = echo_server().await;

    let (_stream, head) = connect(&relay, echo, "").await;
    assert!(head.starts_with("http/1.1 407"), "{head}");
    assert!(head.contains("proxy-authenticate: basic realm=\"word wide web\""));
}

#[tokio::test]
async fn static_user_tunnel_is_not_billed() {
    let relay = start_relay().await;
    let echo = echo_server().await;

    let (mut stream, head) = connect(&relay, echo, &basic("alice", "wonderland")).await;
    assert!(head.starts_with("http/1.1 200"), "{head}");
    echo_roundtrip(&mut stream, b"hello through the tunnel").await;

    let (_stream, head) = connect(&relay, echo, &basic("alice", "wrong")).await;
    assert!(head.starts_with("http/1.1 407"), "{head}");
}

#[tokio::test]
async fn ticket_tunnel_is_metered() {
    let relay = start_relay().await;
    let echo = echo_server().await;
    grant(&relay.db, "prepaid-token", 1000, "pay-1").await;

    let (mut stream, head) = connect(&relay, echo, &basic("prepaid-token", "")).await;
    assert!(head.starts_with("http/1.1 200"), "{head}");
    echo_roundtrip(&mut stream, b"ping").await;
    stream.shutdown().await.unwrap();

    // Four bytes up, four bytes back.
    wait_for_balance(&relay.db, "prepaid-token", 992).await;
}

#[tokio::test]
async fn exhausted_ticket_is_challenged() {
    let relay = start_relay().await;
    let echo = echo_server().await;
    grant(&relay.db, "empty-token", 0, "pay-empty").await;

    let (_stream, head) = connect(&relay, echo, &basic("empty-token", "")).await;
    assert!(head.starts_with("http/1.1 407"), "{head}");

    let (_stream, head) = connect(&relay, echo, &basic("unknown-token", "")).await;
    assert!(head.starts_with("http/1.1 407"), "{head}");
}

#[tokio::test]
async fn unreachable_target_is_bad_gateway() {
    let relay = start_relay().await;
    let closed = {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        listener.local_addr().unwrap()
    };

    let (_stream, head) = connect(&relay, closed, &basic("alice", "wonderland")).await;
    assert!(head.starts_with("http/1.1 502"), "{head}");
}

#[tokio::test]
async fn balance_endpoint_lists_tickets() {
    let relay = start_relay().await;
    grant(&relay.db, "balance-token", 500, "pay-b1").await;

    let response = exchange(
        &relay,
        "GET /ticket?token=balance-token HTTP/1.1\r\nHost: proxy\r\nConnection: close\r\n\r\n",
    )
    .await;
    assert!(response.starts_with("HTTP/1.1 200"), "{response}");
    let body = response.split("\r\n\r\n").nth(1).unwrap();
    let tickets: serde_json::Value = serde_json::from_str(body).unwrap();
    assert_eq!(tickets[0]["bytes"], 500);
    assert_eq!(tickets[0]["pay_order"], "pay-b1");
    assert!(!body.contains("balance-token"));

    let response = exchange(
        &relay,
        "GET /ticket HTTP/1.1\r\nHost: proxy\r\nConnection: close\r\n\r\n",
    )
    .await;
    assert!(response.starts_with("HTTP/1.1 400"), "{response}");
}

#[tokio::test]
async fn connect_udp_needs_http3() {
    let relay = start_relay().await;

    let response = exchange(
        &relay,
        &format!(
            "GET /.well-known/masque/udp/127.0.0.1/53/ HTTP/1.1\r\nHost: proxy\r\n{}Connection: close\r\n\r\n",
            basic("alice", "wonderland")
        ),
    )
    .await;
    assert!(response.starts_with("HTTP/1.1 501"), "{response}");
}
