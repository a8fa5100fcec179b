//! End-to-end test of the SaaS delivery path: send a record, close the
//! manager, and confirm the gzipped NDJSON that actually reached the mock
//! collector decodes back to what was sent.

use std::io::Read;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use analytics::{AuthContext, FixedClock, Manager, ManagerOptions, Record};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;

struct TestAuth;

impl AuthContext for TestAuth {
    fn organization(&self) -> &str {
        "acme"
    }
    fn environment(&self) -> &str {
        "prod"
    }
    fn developer_email(&self) -> &str {
        "dev@acme.test"
    }
    fn application(&self) -> &str {
        "mobile-app"
    }
    fn access_token(&self) -> &str {
        "tok-123"
    }
    fn client_id(&self) -> &str {
        "client-abc"
    }
    fn api_products(&self) -> &[String] {
        &[]
    }
}

fn sample_record(now_ms: i64) -> Record {
    Record {
        client_received_start: now_ms - 10,
        client_received_end: now_ms,
        client_sent_start: now_ms - 9,
        client_sent_end: now_ms - 1,
        target_received_start: now_ms - 8,
        target_received_end: now_ms - 2,
        target_sent_start: now_ms - 7,
        target_sent_end: now_ms - 3,
        api_proxy: "proxy".into(),
        request_uri: "/v1/thing".into(),
        request_path: "/v1/thing".into(),
        request_verb: "GET".into(),
        client_ip: "10.0.0.1".into(),
        user_agent: "test-agent".into(),
        api_proxy_revision: "1".into(),
        response_status_code: 200,
        developer_email: String::new(),
        developer_app: String::new(),
        access_token: String::new(),
        client_id: String::new(),
        api_product: String::new(),
        organization: String::new(),
        environment: String::new(),
        gateway_source: "sidecar".into(),
        record_type: String::new(),
    }
}

/// A minimal hand-rolled HTTP/1.1 server: answers the signed-url GET with a
/// JSON body pointing back at itself, then captures whatever body arrives on
/// the follow-up PUT.
async fn spawn_mock_collector() -> (String, Arc<Mutex<Vec<u8>>>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let captured = Arc::new(Mutex::new(Vec::new()));
    let captured_task = captured.clone();

    tokio::spawn(async move {
        loop {
            let (mut socket, _) = match listener.accept().await {
                Ok(v) => v,
                Err(_) => return,
            };
            let captured = captured_task.clone();
            tokio::spawn(async move {
                let mut buf = vec![0u8; 16 * 1024];
                let n = socket.read(&mut buf).await.unwrap_or(0);
                let request = String::from_utf8_lossy(&buf[..n]).to_string();
                let Some(first_line) = request.lines().next() else { return };

                if first_line.starts_with("GET") {
                    let body = format!("{{\"url\":\"http://{addr}/put-target\"}}");
                    let response = format!(
                        "HTTP/1.1 200 OK\r\nContent-Type: application/json\r\nContent-Length: {}\r\n\r\n{}",
                        body.len(),
                        body
                    );
                    socket.write_all(response.as_bytes()).await.ok();
                } else if first_line.starts_with("PUT") {
                    let header_end = request.find("\r\n\r\n").map(|i| i + 4).unwrap_or(n);
                    let content_length: usize = request[..header_end]
                        .lines()
                        .find_map(|l| {
                            let lower = l.to_ascii_lowercase();
                            lower
                                .starts_with("content-length")
                                .then(|| lower.split(':').nth(1).unwrap_or("0").trim().parse().unwrap_or(0))
                        })
                        .unwrap_or(0);

                    let mut body = buf[header_end.min(n)..n].to_vec();
                    while body.len() < content_length {
                        let mut more = vec![0u8; 16 * 1024];
                        match socket.read(&mut more).await {
                            Ok(0) | Err(_) => break,
                            Ok(m) => body.extend_from_slice(&more[..m]),
                        }
                    }
                    *captured.lock().unwrap() = body;
                    socket.write_all(b"HTTP/1.1 200 OK\r\nContent-Length: 0\r\n\r\n").await.ok();
                }
            });
        }
    });

    (format!("http://{addr}"), captured)
}

#[tokio::test]
async fn send_records_then_close_uploads_gzipped_ndjson() {
    let (base_url, captured) = spawn_mock_collector().await;
    let buffer_dir = tempfile::TempDir::new().unwrap();

    let now_ms: i64 = 1_521_221_450_000;
    let opts = ManagerOptions {
        legacy_endpoint: false,
        buffer_path: buffer_dir.path().to_owned(),
        staging_file_limit: 16,
        base_url: Some(base_url),
        key: Some("key".into()),
        secret: Some("secret".into()),
        client: reqwest::Client::new(),
        send_channel_size: 8,
        hybrid_config_file: None,
        collection_interval: Duration::from_secs(60),
        clock: Arc::new(FixedClock(now_ms)),
    };

    let manager = Manager::new(opts).unwrap();
    manager.start().await;

    manager.send_records(&TestAuth, vec![sample_record(now_ms)]).await.unwrap();
    manager.close().await;

    let uploaded = captured.lock().unwrap().clone();
    assert!(!uploaded.is_empty(), "mock collector never received a PUT body");

    let mut decoded = Vec::new();
    flate2::read::GzDecoder::new(uploaded.as_slice()).read_to_end(&mut decoded).unwrap();
    let text = String::from_utf8(decoded).unwrap();
    let line = text.lines().next().unwrap();
    let record: serde_json::Value = serde_json::from_str(line).unwrap();

    assert_eq!(record["organization"], "acme");
    assert_eq!(record["environment"], "prod");
    assert_eq!(record["recordType"], "APIAnalytics");
    assert_eq!(record["request_path"], "/v1/thing");
}

#[tokio::test]
async fn send_records_rejects_invalid_record() {
    let buffer_dir = tempfile::TempDir::new().unwrap();
    let opts = ManagerOptions {
        legacy_endpoint: false,
        buffer_path: buffer_dir.path().to_owned(),
        staging_file_limit: 16,
        base_url: Some("http://127.0.0.1:1".into()),
        key: Some("key".into()),
        secret: Some("secret".into()),
        client: reqwest::Client::new(),
        send_channel_size: 8,
        hybrid_config_file: None,
        collection_interval: Duration::from_secs(60),
        clock: Arc::new(FixedClock(1_521_221_450_000)),
    };

    let manager = Manager::new(opts).unwrap();
    let mut record = sample_record(1_521_221_450_000);
    record.client_received_start = 0;
    record.client_received_end = 0;

    let result = manager.send_records(&TestAuth, vec![record]).await;
    assert!(result.is_err());
    manager.close().await;
}
