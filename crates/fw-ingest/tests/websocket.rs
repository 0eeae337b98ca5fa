use std::sync::Arc;
use std::time::Duration;

use chrono::{TimeZone, Utc};
use futures_util::{SinkExt, StreamExt};
use fw_core::{Policy, SessionStatus, StaticDirectory};
use fw_db::{Database, SessionFilter, SqliteStore};
use fw_ingest::{Gateway, IngestConfig, RetryPolicy, WebSocketError, run_websocket};
use serde_json::json;
use tokio::net::TcpListener;
use tokio_tungstenite::tungstenite::Message;

fn frame(secs: i64, status: &str, fuel: f64) -> String {
    let at = Utc.with_ymd_and_hms(2025, 3, 1, 6, 0, 0).unwrap() + chrono::Duration::seconds(secs);
    json!({
        "plate": "GEN-01",
        "device_time": at.to_rfc3339(),
        "status_token": status,
        "fuel_volume_liters": fuel,
    })
    .to_string()
}

fn gateway(store: Arc<SqliteStore>) -> Gateway {
    Gateway::new(
        store,
        Arc::new(Policy::default()),
        Arc::new(StaticDirectory::default()),
        IngestConfig::default(),
    )
}

#[tokio::test]
async fn frames_from_feed_reach_the_store() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let url = format!("ws://{}", listener.local_addr().unwrap());
    let frames = vec![
        frame(0, "ENGINE ON", 300.0),
        "{\"plate\": 42}".to_string(),
        frame(1800, "", 290.0),
        frame(3600, "ENGINE OFF", 280.0),
    ];

    let server = tokio::spawn(async move {
        let (tcp, _) = listener.accept().await.unwrap();
        let mut ws = tokio_tungstenite::accept_async(tcp).await.unwrap();
        for text in frames {
            ws.send(Message::Text(text)).await.unwrap();
        }
        while let Some(Ok(_)) = ws.next().await {}
    });

    let store = Arc::new(SqliteStore::new(Database::open_in_memory().unwrap()));
    let mut gateway = gateway(store.clone());
    let stats = gateway.stats();
    let all_received = async move {
        while stats.snapshot().received < 4 {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    };

    run_websocket(&url, &mut gateway, &RetryPolicy::default(), all_received)
        .await
        .unwrap();
    let stats = gateway.shutdown().await;
    server.await.unwrap();

    assert_eq!(stats.malformed, 1);
    let rows = store
        .with_db(|db| db.list_sessions(&SessionFilter::default()))
        .unwrap();
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0].status, SessionStatus::Completed);
    assert_eq!(rows[0].cost_code, "UNMAPPED");
    assert!((rows[0].fuel_used_liters - 20.0).abs() < 1e-3);
}

#[tokio::test]
async fn unsupported_scheme_is_rejected() {
    let store = Arc::new(SqliteStore::new(Database::open_in_memory().unwrap()));
    let mut gateway = gateway(store);

    let result = run_websocket(
        "ftp://feed.invalid",
        &mut gateway,
        &RetryPolicy::default(),
        std::future::pending(),
    )
    .await;

    assert!(matches!(result, Err(WebSocketError::InvalidUrl { .. })));
}
