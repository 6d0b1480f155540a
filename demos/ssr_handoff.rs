//! Server-render then hydrate, with one request in total.
//!
//! Run with `RUST_LOG=slotfetch=debug cargo run --example ssr_handoff`.

use slotfetch::{fetch, initialize_cache, preload, serialize_cache, use_caching_fetch, wipe_cache};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;
use tracing_subscriber::EnvFilter;

const PEOPLE: &str = r#"[
  {"first":"Ann","last":"Lee","email":"ann@example.com","address":"1 Main St","created":"2024-01-01","balance":"$10.00"},
  {"first":"Zoë","last":"Ng","email":"zoe@example.com","address":"9 Elm Rd","created":"2024-02-11","balance":"$2,310.55"},
  {"first":"Bob","last":"Ray","nickname":"Bobby"}
]"#;

/// Stand-in for the remote people API.
async fn serve_people() -> std::io::Result<String> {
    let listener = TcpListener::bind("127.0.0.1:0").await?;
    let addr = listener.local_addr()?;

    tokio::spawn(async move {
        while let Ok((mut socket, peer)) = listener.accept().await {
            tracing::info!(%peer, "people API hit");
            let mut buf = [0u8; 1024];
            let _ = socket.read(&mut buf).await;
            let response = format!(
                "HTTP/1.1 200 OK\r\nContent-Type: application/json\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
                PEOPLE.len(),
                PEOPLE
            );
            let _ = socket.write_all(response.as_bytes()).await;
        }
    });

    Ok(format!("http://{addr}/people"))
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .init();

    let url = serve_people().await?;

    // Server side: preload before rendering, then embed the payload.
    preload(&url).await?;
    let payload = serialize_cache()?;
    println!("embedded payload: {payload}");

    // Client side: a fresh cache hydrated from the payload.
    wipe_cache();
    initialize_cache(&payload)?;

    let consumers = [
        use_caching_fetch(url.clone()),
        use_caching_fetch(url.clone()),
        use_caching_fetch(url.clone()),
    ];
    for (i, consumer) in consumers.iter().enumerate() {
        let state = consumer.state();
        println!(
            "consumer {i}: loading={} people={:?}",
            state.is_loading,
            state.data.iter().map(|p| p.first.as_str()).collect::<Vec<_>>()
        );
    }

    let stats = fetch::global().stats();
    println!(
        "network fetches: {}, cache hits: {}, joins: {}",
        stats.fetches, stats.hits, stats.joins
    );
    Ok(())
}
