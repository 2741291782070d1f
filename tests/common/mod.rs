//! Scripted in-process mock broker for integration tests.
//!
//! Accepts real TCP connections, parses 0.8 request framing, and hands each
//! request to a test-supplied responder that returns zero or more
//! `(correlation_id, body)` frames to write back. Giving the responder
//! explicit control over correlation ids lets tests play broken brokers as
//! well as correct ones.

#![allow(dead_code)]

use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use bytes::{BufMut, BytesMut};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinHandle;

/// A request as seen on the wire.
#[derive(Debug, Clone)]
pub struct ParsedRequest {
    pub api_key: i16,
    pub api_version: i16,
    pub correlation_id: i32,
    pub client_id: String,
    pub body: Vec<u8>,
}

/// Frames to write back: explicit correlation id plus response body.
pub type Responses = Vec<(i32, Vec<u8>)>;

pub struct MockBroker {
    pub addr: SocketAddr,
    accepted: Arc<AtomicUsize>,
    _listener_task: JoinHandle<()>,
}

impl MockBroker {
    /// Binds a listener on a free port and serves every connection with the
    /// shared responder.
    pub async fn spawn<F>(respond: F) -> Self
    where
        F: FnMut(ParsedRequest) -> Responses + Send + 'static,
    {
        init_logging();
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let accepted = Arc::new(AtomicUsize::new(0));
        let respond = Arc::new(Mutex::new(respond));

        let accept_count = accepted.clone();
        let listener_task = tokio::spawn(async move {
            loop {
                let Ok((stream, _)) = listener.accept().await else {
                    return;
                };
                accept_count.fetch_add(1, Ordering::SeqCst);
                tokio::spawn(serve(stream, respond.clone()));
            }
        });

        Self {
            addr,
            accepted,
            _listener_task: listener_task,
        }
    }

    pub fn accepted_connections(&self) -> usize {
        self.accepted.load(Ordering::SeqCst)
    }

    pub fn addr_string(&self) -> String {
        self.addr.to_string()
    }
}

/// Makes client logs visible when the test runs with `RUST_LOG` set.
pub fn init_logging() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .try_init();
}

async fn serve<F>(mut stream: TcpStream, respond: Arc<Mutex<F>>)
where
    F: FnMut(ParsedRequest) -> Responses + Send + 'static,
{
    loop {
        let mut len_buf = [0u8; 4];
        if stream.read_exact(&mut len_buf).await.is_err() {
            return;
        }
        let len = i32::from_be_bytes(len_buf);
        assert!(len > 0, "mock broker got invalid request length {len}");
        let mut payload = vec![0u8; len as usize];
        if stream.read_exact(&mut payload).await.is_err() {
            return;
        }

        let request = parse_request(&payload);
        let responses = {
            let mut respond = respond.lock().unwrap();
            (*respond)(request)
        };
        for (correlation_id, body) in responses {
            let mut frame = BytesMut::with_capacity(8 + body.len());
            frame.put_i32((4 + body.len()) as i32);
            frame.put_i32(correlation_id);
            frame.put_slice(&body);
            if stream.write_all(&frame).await.is_err() {
                return;
            }
        }
    }
}

fn parse_request(payload: &[u8]) -> ParsedRequest {
    let api_key = i16::from_be_bytes([payload[0], payload[1]]);
    let api_version = i16::from_be_bytes([payload[2], payload[3]]);
    let correlation_id = i32::from_be_bytes([payload[4], payload[5], payload[6], payload[7]]);
    let client_id_len = i16::from_be_bytes([payload[8], payload[9]]) as usize;
    let client_id = String::from_utf8(payload[10..10 + client_id_len].to_vec()).unwrap();
    let body = payload[10 + client_id_len..].to_vec();
    ParsedRequest {
        api_key,
        api_version,
        correlation_id,
        client_id,
        body,
    }
}

fn put_str(buf: &mut BytesMut, s: &str) {
    buf.put_i16(s.len() as i16);
    buf.put_slice(s.as_bytes());
}

/// Produce response body for a single (topic, partition).
pub fn produce_response_body(
    topic: &str,
    partition_id: i32,
    error_code: i16,
    offset: i64,
) -> Vec<u8> {
    let mut buf = BytesMut::new();
    buf.put_i32(1);
    put_str(&mut buf, topic);
    buf.put_i32(1);
    buf.put_i32(partition_id);
    buf.put_i16(error_code);
    buf.put_i64(offset);
    buf.to_vec()
}

/// Metadata response body: `brokers` as (node_id, host, port), `leaders` as
/// (topic, partition, leader node id).
pub fn metadata_response_body(
    brokers: &[(i32, &str, i32)],
    leaders: &[(&str, i32, i32)],
) -> Vec<u8> {
    let mut buf = BytesMut::new();

    buf.put_i32(brokers.len() as i32);
    for (node_id, host, port) in brokers {
        buf.put_i32(*node_id);
        put_str(&mut buf, host);
        buf.put_i32(*port);
    }

    let mut topics: Vec<(&str, Vec<(i32, i32)>)> = Vec::new();
    for (topic, partition_id, leader) in leaders {
        match topics.iter_mut().find(|(name, _)| name == topic) {
            Some((_, partitions)) => partitions.push((*partition_id, *leader)),
            None => topics.push((topic, vec![(*partition_id, *leader)])),
        }
    }

    buf.put_i32(topics.len() as i32);
    for (topic, partitions) in topics {
        buf.put_i16(0);
        put_str(&mut buf, topic);
        buf.put_i32(partitions.len() as i32);
        for (partition_id, leader) in partitions {
            buf.put_i16(0);
            buf.put_i32(partition_id);
            buf.put_i32(leader);
            buf.put_i32(1); // replicas
            buf.put_i32(leader);
            buf.put_i32(1); // isr
            buf.put_i32(leader);
        }
    }

    buf.to_vec()
}
