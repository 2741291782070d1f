//! Connection actor behavior against a scripted mock broker: ordering,
//! correlation handling, connect lifecycle, and failure draining.

mod common;

use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use bytes::Bytes;
use kafsink::broker::{Broker, ConnState};
use kafsink::protocol::{api_key, BrokerIdentity};
use kafsink::ClientError;

use common::MockBroker;

fn identity_for(mock: &MockBroker) -> BrokerIdentity {
    BrokerIdentity {
        node_id: 1,
        host: mock.addr.ip().to_string(),
        port: mock.addr.port() as i32,
    }
}

/// Responder that echoes each request body back under its own correlation
/// id, recording the correlation ids it saw in wire order.
fn echo_responder(
    seen: Arc<Mutex<Vec<i32>>>,
) -> impl FnMut(common::ParsedRequest) -> common::Responses + Send + 'static {
    move |request| {
        seen.lock().unwrap().push(request.correlation_id);
        vec![(request.correlation_id, request.body)]
    }
}

#[tokio::test]
async fn pipelined_requests_complete_in_submission_order() {
    let seen = Arc::new(Mutex::new(Vec::new()));
    let mock = MockBroker::spawn(echo_responder(seen.clone())).await;

    let broker = Broker::new(identity_for(&mock), "test".into());
    broker
        .wait_for_connect(Duration::from_secs(1))
        .await
        .unwrap();

    let completions: Vec<_> = (0..100i32)
        .map(|i| {
            broker.call(
                api_key::PRODUCE,
                Bytes::copy_from_slice(&i.to_be_bytes()),
                true,
            )
        })
        .collect();

    for (i, completion) in completions.into_iter().enumerate() {
        let mut decoder = completion.await.unwrap().unwrap();
        assert_eq!(decoder.get_i32().unwrap(), i as i32, "response out of order");
    }

    // Correlation ids on the wire are a contiguous range in submission
    // order, starting at 1 on a fresh connection.
    let seen = seen.lock().unwrap();
    assert_eq!(seen.len(), 100);
    assert_eq!(*seen, (1..=100).collect::<Vec<i32>>());
}

#[tokio::test]
async fn requests_submitted_before_connect_are_flushed_in_order() {
    let seen = Arc::new(Mutex::new(Vec::new()));
    let mock = MockBroker::spawn(echo_responder(seen.clone())).await;

    let broker = Broker::new(identity_for(&mock), "test".into());

    // Submit while still Init; nothing is written yet.
    let first = broker.call(api_key::PRODUCE, Bytes::from_static(b"a"), true);
    let second = broker.call(api_key::PRODUCE, Bytes::from_static(b"b"), true);
    assert_eq!(broker.state(), ConnState::Init);

    broker
        .wait_for_connect(Duration::from_secs(1))
        .await
        .unwrap();

    let mut decoder = first.await.unwrap().unwrap();
    assert_eq!(decoder.slice(1).unwrap(), Bytes::from_static(b"a"));
    let mut decoder = second.await.unwrap().unwrap();
    assert_eq!(decoder.slice(1).unwrap(), Bytes::from_static(b"b"));
}

#[tokio::test]
async fn correlation_mismatch_is_fatal() {
    // Hold the first request, then answer both with swapped correlation ids.
    let held: Arc<Mutex<Option<common::ParsedRequest>>> = Arc::new(Mutex::new(None));
    let mock = MockBroker::spawn(move |request| {
        let mut held = held.lock().unwrap();
        match held.take() {
            None => {
                *held = Some(request);
                vec![]
            }
            Some(first) => vec![
                (request.correlation_id, first.body.clone()),
                (first.correlation_id, request.body),
            ],
        }
    })
    .await;

    let broker = Broker::new(identity_for(&mock), "test".into());
    broker
        .wait_for_connect(Duration::from_secs(1))
        .await
        .unwrap();

    let first = broker.call(api_key::PRODUCE, Bytes::from_static(b"a"), true);
    let second = broker.call(api_key::PRODUCE, Bytes::from_static(b"b"), true);

    // The head request fails on the mismatch itself, the second is drained
    // as part of the close.
    let first_err = first.await.unwrap().unwrap_err();
    assert!(matches!(first_err, ClientError::Encoding { .. }), "{first_err}");
    let second_err = second.await.unwrap().unwrap_err();
    assert!(
        matches!(second_err, ClientError::NetworkFail { .. }),
        "{second_err}"
    );

    broker.wait_closed().await;
    assert_eq!(broker.state(), ConnState::Closed);

    // Further submissions fail immediately.
    let late = broker.call(api_key::PRODUCE, Bytes::from_static(b"c"), true);
    assert!(matches!(
        late.await.unwrap(),
        Err(ClientError::NetworkFail { .. })
    ));
}

#[tokio::test]
async fn eof_fails_all_in_flight_requests() {
    // A listener that accepts and immediately drops the connection.
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        loop {
            let Ok((stream, _)) = listener.accept().await else {
                return;
            };
            drop(stream);
        }
    });

    let broker = Broker::new(
        BrokerIdentity {
            node_id: 1,
            host: addr.ip().to_string(),
            port: addr.port() as i32,
        },
        "test".into(),
    );
    broker
        .wait_for_connect(Duration::from_secs(1))
        .await
        .unwrap();

    let completion = broker.call(api_key::PRODUCE, Bytes::from_static(b"a"), true);
    assert!(matches!(
        completion.await.unwrap(),
        Err(ClientError::NetworkFail { .. })
    ));
    broker.wait_closed().await;
}

#[tokio::test]
async fn connect_timeout_against_unroutable_host() {
    // TEST-NET-ish address that blackholes SYNs.
    let broker = Broker::new(
        BrokerIdentity {
            node_id: 1,
            host: "10.255.255.1".into(),
            port: 9092,
        },
        "test".into(),
    );

    let started = Instant::now();
    let err = broker
        .wait_for_connect(Duration::from_millis(100))
        .await
        .unwrap_err();
    assert!(matches!(err, ClientError::NetworkTimeout), "{err}");
    assert!(
        started.elapsed() < Duration::from_millis(1000),
        "took {:?}",
        started.elapsed()
    );

    // The abandoned attempt closes the broker for everyone.
    broker.wait_closed().await;
    assert_eq!(broker.state(), ConnState::Closed);
}

#[tokio::test]
async fn concurrent_connect_waits_share_one_attempt() {
    let mock = MockBroker::spawn(|_| vec![]).await;
    let broker = Arc::new(Broker::new(identity_for(&mock), "test".into()));

    let waits: Vec<_> = (0..10)
        .map(|_| {
            let broker = broker.clone();
            tokio::spawn(async move { broker.wait_for_connect(Duration::from_secs(1)).await })
        })
        .collect();
    for wait in waits {
        wait.await.unwrap().unwrap();
    }

    assert_eq!(mock.accepted_connections(), 1);
    assert!(broker.is_connected());
}

#[tokio::test]
async fn close_is_idempotent_and_drains_the_queue() {
    let mock = MockBroker::spawn(|_| vec![]).await;
    let broker = Broker::new(identity_for(&mock), "test".into());
    broker
        .wait_for_connect(Duration::from_secs(1))
        .await
        .unwrap();

    // An in-flight request the mock never answers.
    let pending = broker.call(api_key::PRODUCE, Bytes::from_static(b"a"), true);

    broker.close();
    broker.close();
    broker.wait_closed().await;
    assert_eq!(broker.state(), ConnState::Closed);

    assert!(matches!(
        pending.await.unwrap(),
        Err(ClientError::NetworkFail { .. })
    ));

    let late = broker.call(api_key::PRODUCE, Bytes::from_static(b"b"), true);
    assert!(matches!(
        late.await.unwrap(),
        Err(ClientError::NetworkFail { .. })
    ));

    broker.close();
    assert_eq!(broker.state(), ConnState::Closed);
}

#[tokio::test]
async fn fire_and_forget_completes_at_write() {
    // The responder never replies; with expects_response = false the call
    // must still complete.
    let mock = MockBroker::spawn(|_| vec![]).await;
    let broker = Broker::new(identity_for(&mock), "test".into());
    broker
        .wait_for_connect(Duration::from_secs(1))
        .await
        .unwrap();

    let completion = broker.call(api_key::PRODUCE, Bytes::from_static(b"a"), false);
    let decoder = tokio::time::timeout(Duration::from_secs(1), completion)
        .await
        .expect("must not wait for a response")
        .unwrap()
        .unwrap();
    assert_eq!(decoder.remaining(), 0);
    assert!(broker.is_connected());
}

#[tokio::test]
async fn abandoned_completion_does_not_disturb_later_requests() {
    let seen = Arc::new(Mutex::new(Vec::new()));
    let mock = MockBroker::spawn(echo_responder(seen)).await;
    let broker = Broker::new(identity_for(&mock), "test".into());
    broker
        .wait_for_connect(Duration::from_secs(1))
        .await
        .unwrap();

    // Caller "times out": the receiver is dropped before the response
    // arrives. The slot stays aligned and the next request still matches.
    drop(broker.call(api_key::PRODUCE, Bytes::from_static(b"slow"), true));

    let completion = broker.call(api_key::PRODUCE, Bytes::from_static(b"next"), true);
    let mut decoder = completion.await.unwrap().unwrap();
    assert_eq!(decoder.slice(4).unwrap(), Bytes::from_static(b"next"));
    assert!(broker.is_connected());
}
