//! Shared helpers for the loopback integration tests.

#![allow(dead_code)]

use std::future::Future;
use std::time::Duration;

use isolink_transport::{
    BinaryCodec, ClientConfig, IsoClient, IsoMessage, IsoServer, MessageCodec, ServerRequest,
    TokioProviders, serialize_frame, try_deserialize_frame,
};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::task::LocalSet;

/// Run `future` on a current-thread runtime inside a `LocalSet`.
pub fn run_local<F: Future>(future: F) -> F::Output {
    let _ = tracing_subscriber::fmt().with_test_writer().try_init();
    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .expect("Failed to build current-thread runtime");
    LocalSet::new().block_on(&runtime, future)
}

/// A loopback address nothing listens on (yet).
pub fn free_address() -> String {
    let listener = std::net::TcpListener::bind("127.0.0.1:0").expect("bind");
    listener.local_addr().expect("local addr").to_string()
}

/// Client settings with short intervals so tests settle quickly.
pub fn fast_config(address: &str) -> ClientConfig {
    ClientConfig::local_network(address)
        .with_poll_interval(Duration::from_millis(10))
        .with_reconnect_delay(Duration::from_millis(10))
        .with_response_timeout(Duration::from_secs(2))
        .with_when_active_timeout(Duration::from_secs(5))
}

pub fn new_client(config: ClientConfig) -> IsoClient<TokioProviders> {
    IsoClient::new(TokioProviders::new(), BinaryCodec, config)
}

/// Server that answers every request with its response MTI.
pub fn echo_server() -> IsoServer<TokioProviders> {
    IsoServer::new(TokioProviders::new(), BinaryCodec).with_handler(
        |request: ServerRequest<BinaryCodec>| {
            request.respond().expect("echo");
        },
    )
}

/// Server that only acknowledges handshakes and ignores everything else.
pub fn handshake_only_server() -> IsoServer<TokioProviders> {
    IsoServer::new(TokioProviders::new(), BinaryCodec).with_handler(
        |request: ServerRequest<BinaryCodec>| {
            if request.message().mti() == "2800" {
                request.respond().expect("handshake ack");
            }
        },
    )
}

/// Poll `condition` every 5ms until it holds, panicking after `limit`.
pub async fn eventually<F: FnMut() -> bool>(limit: Duration, what: &str, mut condition: F) {
    let deadline = tokio::time::Instant::now() + limit;
    while !condition() {
        assert!(
            tokio::time::Instant::now() < deadline,
            "timed out waiting for {what}"
        );
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}

/// Read one framed message from a raw stream. `None` on EOF.
pub async fn read_message(stream: &mut TcpStream, buffer: &mut Vec<u8>) -> Option<IsoMessage> {
    loop {
        if let Some((payload, consumed)) = try_deserialize_frame(buffer).expect("valid frame") {
            buffer.drain(..consumed);
            return Some(BinaryCodec.decode(&payload).expect("decode"));
        }
        let mut chunk = [0u8; 1024];
        match stream.read(&mut chunk).await {
            Ok(0) | Err(_) => return None,
            Ok(n) => buffer.extend_from_slice(&chunk[..n]),
        }
    }
}

/// Frame `msg` and write it to a raw stream.
pub async fn write_message(stream: &mut TcpStream, msg: &IsoMessage) {
    let payload = BinaryCodec.encode(msg).expect("encode");
    let frame = serialize_frame(&payload).expect("frame");
    stream.write_all(&frame).await.expect("write");
}

/// A framed message whose checksum no longer matches its payload.
pub fn corrupt_frame(msg: &IsoMessage) -> Vec<u8> {
    let payload = BinaryCodec.encode(msg).expect("encode");
    let mut frame = serialize_frame(&payload).expect("frame");
    let last = frame.len() - 1;
    frame[last] ^= 0xff;
    frame
}
