//! End-to-end server-to-client handoff through the process-wide API.
//!
//! These tests share the global cache, so each one holds `SERIAL` and starts
//! with `wipe_cache()`.

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use slotfetch::{
    FetchError, TransportError, fetch_or_reuse, initialize_cache, preload, serialize_cache, use_caching_fetch,
    wipe_cache,
};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;
use tokio::sync::Mutex;

static SERIAL: Mutex<()> = Mutex::const_new(());

const PEOPLE: &str = r#"[{"first":"Ann","last":"Lee","email":"ann@example.com","address":"1 Main St","created":"2024-01-01","balance":"$10.00"},{"first":"Bob","last":"Ray","extraField":1},"not-an-object"]"#;

const ANN: &str = r#"[{"first":"Ann","last":"Lee","email":"ann@example.com","address":"1 Main St","created":"2024-01-01","balance":"$10.00"}]"#;

/// Local people endpoint. Serves `bodies` in order (the last one repeats),
/// chunked, and counts requests.
async fn people_api(bodies: Vec<&'static str>) -> (String, Arc<AtomicUsize>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let requests = Arc::new(AtomicUsize::new(0));

    let counter = Arc::clone(&requests);
    tokio::spawn(async move {
        loop {
            let (mut socket, _) = listener.accept().await.unwrap();
            let n = counter.fetch_add(1, Ordering::SeqCst);
            let body = bodies[n.min(bodies.len() - 1)];
            tokio::spawn(async move {
                let mut head = Vec::new();
                let mut buf = [0u8; 512];
                while !head.windows(4).any(|w| w == b"\r\n\r\n") {
                    let read = socket.read(&mut buf).await.unwrap();
                    if read == 0 {
                        return;
                    }
                    head.extend_from_slice(&buf[..read]);
                }

                let (first, rest) = body.as_bytes().split_at(body.len() / 2);
                let mut response =
                    b"HTTP/1.1 200 OK\r\nContent-Type: application/json\r\nTransfer-Encoding: chunked\r\nConnection: close\r\n\r\n"
                        .to_vec();
                for part in [first, rest] {
                    response.extend_from_slice(format!("{:x}\r\n", part.len()).as_bytes());
                    response.extend_from_slice(part);
                    response.extend_from_slice(b"\r\n");
                }
                response.extend_from_slice(b"0\r\n\r\n");
                let _ = socket.write_all(&response).await;
            });
        }
    });

    (format!("http://{addr}/people"), requests)
}

#[tokio::test]
async fn preload_serialize_hydrate_without_refetch() {
    let _serial = SERIAL.lock().await;
    wipe_cache();
    let (url, requests) = people_api(vec![PEOPLE]).await;

    preload(&url).await.unwrap();
    assert_eq!(requests.load(Ordering::SeqCst), 1);

    let payload = serialize_cache().unwrap();
    assert_eq!(payload, ANN);

    wipe_cache();
    assert_eq!(serialize_cache().unwrap(), "[]");
    initialize_cache(&payload).unwrap();

    let people = fetch_or_reuse(&url).await.unwrap();
    assert_eq!(people.len(), 1);
    assert_eq!(people[0].first, "Ann");

    let consumers = [
        use_caching_fetch(url.clone()),
        use_caching_fetch(url.clone()),
        use_caching_fetch(url.clone()),
    ];
    for consumer in &consumers {
        let state = consumer.state();
        assert!(!state.is_loading);
        assert_eq!(state.data, people);
    }

    assert_eq!(requests.load(Ordering::SeqCst), 1);
    wipe_cache();
}

#[tokio::test]
async fn concurrent_consumers_trigger_one_request() {
    let _serial = SERIAL.lock().await;
    wipe_cache();
    let (url, requests) = people_api(vec![PEOPLE]).await;

    let callers: Vec<_> = (0..5)
        .map(|_| {
            let url = url.clone();
            tokio::spawn(async move { fetch_or_reuse(&url).await })
        })
        .collect();
    let mut consumers: Vec<_> = (0..3).map(|_| use_caching_fetch(url.clone())).collect();

    for caller in callers {
        assert_eq!(caller.await.unwrap().unwrap().len(), 1);
    }
    for consumer in &mut consumers {
        let state = consumer.settled().await;
        assert!(state.error.is_none());
        assert_eq!(state.data.len(), 1);
    }

    assert_eq!(requests.load(Ordering::SeqCst), 1);
    wipe_cache();
}

#[tokio::test]
async fn failed_fetch_leaves_cache_empty_and_retry_populates() {
    let _serial = SERIAL.lock().await;
    wipe_cache();
    let (url, requests) = people_api(vec![r#"{"not":"an array"}"#, PEOPLE]).await;

    let err = fetch_or_reuse(&url).await.unwrap_err();
    assert!(matches!(err, FetchError::Malformed(_)));
    assert_eq!(serialize_cache().unwrap(), "[]");

    let people = fetch_or_reuse(&url).await.unwrap();
    assert_eq!(people.len(), 1);
    assert_eq!(requests.load(Ordering::SeqCst), 2);
    wipe_cache();
}

#[tokio::test]
async fn unreachable_endpoint_is_transport_error() {
    let _serial = SERIAL.lock().await;
    wipe_cache();
    let addr = TcpListener::bind("127.0.0.1:0")
        .await
        .unwrap()
        .local_addr()
        .unwrap();

    let err = preload(&format!("http://{addr}/people")).await.unwrap_err();
    assert!(err.is_transport());
    assert_eq!(serialize_cache().unwrap(), "[]");
}

#[tokio::test]
async fn https_endpoint_goes_through_the_transport() {
    let _serial = SERIAL.lock().await;
    wipe_cache();
    let addr = TcpListener::bind("127.0.0.1:0")
        .await
        .unwrap()
        .local_addr()
        .unwrap();

    let err = preload(&format!("https://{addr}/people")).await.unwrap_err();
    assert!(matches!(
        err,
        FetchError::Transport(TransportError::Connect { .. })
    ));
    assert_eq!(serialize_cache().unwrap(), "[]");
}

#[tokio::test]
async fn loosely_typed_records_are_kept() {
    let _serial = SERIAL.lock().await;
    wipe_cache();
    let (url, _) = people_api(vec![
        r#"[{"first":"Ann","balance":12.5},{"first":"Bob","email":null}]"#,
    ])
    .await;

    let people = fetch_or_reuse(&url).await.unwrap();
    assert_eq!(people.len(), 2);
    assert_eq!(people[0].balance, "12.5");
    assert_eq!(people[1].email, "");
    wipe_cache();
}
