//! HTTP client tests against a throwaway local server.

use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use execq::client::{ExecutionClient, HttpExecutionClient};
use execq::config::Config;
use execq::config::secrets::{ExposeSecret, SecretString};
use execq::model::{ExecutionHandle, ExecutionStatus};
use serde_json::json;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;

#[derive(Debug, Clone)]
struct Request {
    method: String,
    path: String,
    authorization: Option<String>,
    body: String,
}

type Route = dyn Fn(&Request) -> (u16, String) + Send + Sync;

/// Serve one response per connection until the test ends. Returns the base
/// URL and the log of received requests.
async fn serve(route: Arc<Route>) -> (String, Arc<Mutex<Vec<Request>>>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let base = format!("http://{}", listener.local_addr().unwrap());
    let seen = Arc::new(Mutex::new(Vec::new()));

    let log = seen.clone();
    tokio::spawn(async move {
        loop {
            let Ok((mut socket, _)) = listener.accept().await else {
                return;
            };
            let route = route.clone();
            let log = log.clone();
            tokio::spawn(async move {
                let Some(request) = read_request(&mut socket).await else {
                    return;
                };
                let (status, body) = route(&request);
                log.lock().unwrap().push(request);
                let response = format!(
                    "HTTP/1.1 {status} X\r\ncontent-type: application/json\r\ncontent-length: {}\r\nconnection: close\r\n\r\n{body}",
                    body.len()
                );
                let _ = socket.write_all(response.as_bytes()).await;
                let _ = socket.shutdown().await;
            });
        }
    });
    (base, seen)
}

async fn read_request(socket: &mut tokio::net::TcpStream) -> Option<Request> {
    let mut buf = Vec::new();
    let mut chunk = [0u8; 4096];
    let header_end = loop {
        let n = socket.read(&mut chunk).await.ok()?;
        if n == 0 {
            return None;
        }
        buf.extend_from_slice(&chunk[..n]);
        if let Some(pos) = buf.windows(4).position(|w| w == b"\r\n\r\n") {
            break pos + 4;
        }
    };

    let head = String::from_utf8_lossy(&buf[..header_end]).into_owned();
    let mut lines = head.lines();
    let mut start = lines.next()?.split_whitespace();
    let method = start.next()?.to_string();
    let path = start.next()?.to_string();

    let mut content_length = 0;
    let mut authorization = None;
    for line in lines {
        if let Some((name, value)) = line.split_once(':') {
            match name.trim().to_ascii_lowercase().as_str() {
                "content-length" => content_length = value.trim().parse().unwrap_or(0),
                "authorization" => authorization = Some(value.trim().to_string()),
                _ => {}
            }
        }
    }

    while buf.len() < header_end + content_length {
        let n = socket.read(&mut chunk).await.ok()?;
        if n == 0 {
            break;
        }
        buf.extend_from_slice(&chunk[..n]);
    }
    let body = String::from_utf8_lossy(&buf[header_end..]).into_owned();

    Some(Request {
        method,
        path,
        authorization,
        body,
    })
}

fn config_for(base: &str, access: Option<&str>) -> Config {
    Config {
        api_url: format!("{base}/shanoir-ng"),
        auth_url: Some(format!("{base}/token")),
        client_id: "shanoir-uploader".to_string(),
        access_token: access.map(|t| SecretString::from(t.to_string())),
        refresh_token: SecretString::from("refresh-1".to_string()),
        request_timeout: Duration::from_secs(5),
        max_thread: 1,
        pause_window: None,
        work_dir: PathBuf::from("unused"),
        project: "test".to_string(),
        tracking_file: PathBuf::from("unused.json"),
        error_file: PathBuf::from("unused.txt"),
        poll_deadline: None,
        otel_endpoint: None,
        log_level: "info".to_string(),
    }
}

fn payload() -> execq::model::Payload {
    json!({"exam": "a", "refreshToken": "refresh-1"})
        .as_object()
        .cloned()
        .unwrap()
}

#[tokio::test]
async fn submit_refreshes_expired_token_and_resolves_monitoring_id() {
    let route: Arc<Route> = Arc::new(|req: &Request| {
        let fresh = req.authorization.as_deref() == Some("Bearer fresh");
        match (req.method.as_str(), req.path.as_str()) {
            ("POST", "/token") => (
                200,
                json!({"access_token": "fresh", "refresh_token": "refresh-2"}).to_string(),
            ),
            (_, _) if !fresh => (401, String::new()),
            ("POST", "/shanoir-ng/datasets/vip/execution/") => (200, json!({"id": 17}).to_string()),
            ("GET", "/shanoir-ng/datasets/execution-monitoring/17") => {
                (200, json!({"identifier": 9001}).to_string())
            }
            ("GET", "/shanoir-ng/datasets/vip/execution/9001/status") => {
                (200, "\"Finished\"".to_string())
            }
            _ => (404, String::new()),
        }
    });
    let (base, seen) = serve(route).await;
    let client = HttpExecutionClient::from_config(&config_for(&base, Some("expired")))
        .unwrap()
        .with_monitoring_retry_delay(Duration::from_millis(1));

    let handle = client.submit(&payload()).await.unwrap();
    assert_eq!(handle.id.as_deref(), Some("17"));
    assert_eq!(handle.status_key(), Some("9001"));

    let status = client.status(&handle).await.unwrap();
    assert_eq!(status, ExecutionStatus::Finished);

    let token = client.current_refresh_token().await.unwrap();
    assert_eq!(token.expose_secret(), "refresh-2");

    let requests = seen.lock().unwrap().clone();
    let token_calls: Vec<_> = requests.iter().filter(|r| r.path == "/token").collect();
    assert_eq!(token_calls.len(), 1);
    assert!(token_calls[0].body.contains("grant_type=refresh_token"));
    assert!(token_calls[0].body.contains("refresh_token=refresh-1"));
    let posts: Vec<_> = requests.iter().filter(|r| r.method == "POST" && r.path != "/token").collect();
    assert_eq!(posts.len(), 2, "one rejected attempt, one retry");
    assert!(posts[1].body.contains("\"exam\":\"a\""));
}

#[tokio::test]
async fn rejected_submission_returns_handle_without_id() {
    let route: Arc<Route> = Arc::new(|req: &Request| match req.method.as_str() {
        "POST" => (
            400,
            json!({"message": "dataset not found", "details": "exam a"}).to_string(),
        ),
        _ => (404, String::new()),
    });
    let (base, _seen) = serve(route).await;
    let client = HttpExecutionClient::from_config(&config_for(&base, Some("good"))).unwrap();

    let handle = client.submit(&payload()).await.unwrap();

    assert!(handle.id.is_none());
    assert_eq!(handle.message.as_deref(), Some("dataset not found"));
    assert_eq!(handle.details.as_deref(), Some("exam a"));
}

#[tokio::test]
async fn status_errors_are_transient() {
    let route: Arc<Route> = Arc::new(|_: &Request| (503, String::new()));
    let (base, _seen) = serve(route).await;
    let client = HttpExecutionClient::from_config(&config_for(&base, Some("good"))).unwrap();

    let err = client
        .status(&ExecutionHandle::accepted("1", "2"))
        .await
        .unwrap_err();
    assert!(matches!(err, execq::error::Error::TransientPolling(_)));
}

#[tokio::test]
async fn running_status_body_is_unquoted() {
    let route: Arc<Route> = Arc::new(|_: &Request| (200, "\"Running\"".to_string()));
    let (base, _seen) = serve(route).await;
    let client = HttpExecutionClient::from_config(&config_for(&base, Some("good"))).unwrap();

    let status = client
        .status(&ExecutionHandle::accepted("1", "2"))
        .await
        .unwrap();
    assert_eq!(status, ExecutionStatus::Running);
}
