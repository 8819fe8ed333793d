//! Integration tests for Tenantgate
//!
//! Each test boots real servers on fixed loopback ports. The router talks to
//! a small hyper origin standing in for the artifact store; the gateway uses
//! the in-memory bus and a recording scheduler.

use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use http_body_util::Full;
use hyper::body::{Bytes, Incoming};
use hyper::service::service_fn;
use hyper::{Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use parking_lot::Mutex;
use tenantgate::bus::{LogBus, MemoryBus};
use tenantgate::config::RouterConfig;
use tenantgate::dispatcher::{Dispatcher, PublicUrl};
use tenantgate::gateway::{GatewayServer, GatewayState};
use tenantgate::realtime::SessionSettings;
use tenantgate::relay::{Backoff, LogRelay};
use tenantgate::rooms::RoomRegistry;
use tenantgate::router::RouterServer;
use tenantgate::scheduler::{BuildTask, SchedulerError, TaskHandle, TaskScheduler};
use tenantgate::topic::TopicPattern;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};

type Client = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Wait for a port to become available (server listening)
async fn wait_for_port(port: u16, timeout: Duration) -> bool {
    let start = std::time::Instant::now();
    while start.elapsed() < timeout {
        if TcpStream::connect(format!("127.0.0.1:{}", port)).await.is_ok() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    false
}

/// Send a raw HTTP request and read the whole response.
///
/// A server that answers before consuming the body may reset the connection
/// afterwards; whatever arrived before the reset is kept.
async fn http_request(port: u16, raw: String) -> Result<String, Box<dyn std::error::Error>> {
    let mut stream = TcpStream::connect(format!("127.0.0.1:{}", port)).await?;
    stream.write_all(raw.as_bytes()).await?;

    let mut response = Vec::new();
    let mut buf = [0u8; 4096];
    loop {
        match stream.read(&mut buf).await {
            Ok(0) => break,
            Ok(n) => response.extend_from_slice(&buf[..n]),
            Err(_) if !response.is_empty() => break,
            Err(e) => return Err(e.into()),
        }
    }
    Ok(String::from_utf8_lossy(&response).into_owned())
}

/// Send HTTP GET with custom Host header
async fn http_get_with_host(port: u16, path: &str, host: &str) -> Result<String, Box<dyn std::error::Error>> {
    http_request(
        port,
        format!("GET {} HTTP/1.1\r\nHost: {}\r\nConnection: close\r\n\r\n", path, host),
    )
    .await
}

async fn http_post_json(port: u16, path: &str, body: &str) -> Result<String, Box<dyn std::error::Error>> {
    http_request(
        port,
        format!(
            "POST {} HTTP/1.1\r\nHost: 127.0.0.1:{}\r\nContent-Type: application/json\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
            path,
            port,
            body.len(),
            body
        ),
    )
    .await
}

fn status_of(response: &str) -> u16 {
    response
        .split_whitespace()
        .nth(1)
        .and_then(|s| s.parse().ok())
        .unwrap_or(0)
}

/// Parse the JSON document in a response body (bodies here are never chunked mid-object)
fn json_body(response: &str) -> serde_json::Value {
    let body = response.split("\r\n\r\n").nth(1).unwrap_or("");
    let start = body.find('{').expect("JSON body");
    let end = body.rfind('}').expect("JSON body");
    serde_json::from_str(&body[start..=end]).expect("valid JSON body")
}

// ============================================================================
// Router
// ============================================================================

/// A request as the origin saw it
#[derive(Debug, Clone)]
struct SeenRequest {
    path: String,
    headers: hyper::HeaderMap,
}

type Seen = Arc<Mutex<Vec<SeenRequest>>>;

fn seen_paths(seen: &Seen) -> Vec<String> {
    seen.lock().iter().map(|r| r.path.clone()).collect()
}

/// Artifact store stand-in. Records every request; `demo` has an index
/// document and a script, `slow` answers after 3 seconds, anything else
/// answers 403 like a private bucket.
async fn start_origin(port: u16) -> Seen {
    let seen: Seen = Arc::new(Mutex::new(Vec::new()));
    let listener = TcpListener::bind(("127.0.0.1", port)).await.unwrap();
    let recorder = Arc::clone(&seen);

    tokio::spawn(async move {
        loop {
            let Ok((stream, _)) = listener.accept().await else {
                break;
            };
            let recorder = Arc::clone(&recorder);
            tokio::spawn(async move {
                let service = service_fn(move |req: Request<Incoming>| {
                    let recorder = Arc::clone(&recorder);
                    async move {
                        let path = req.uri().path().to_string();
                        recorder.lock().push(SeenRequest {
                            path: path.clone(),
                            headers: req.headers().clone(),
                        });
                        let (status, body) = match path.as_str() {
                            "/__outputs/demo/index.html" => (StatusCode::OK, "<h1>demo site</h1>"),
                            "/__outputs/demo/assets/app.js" => (StatusCode::OK, "console.log('demo')"),
                            "/__outputs/slow/index.html" => {
                                tokio::time::sleep(Duration::from_secs(3)).await;
                                (StatusCode::OK, "too late")
                            }
                            _ => (StatusCode::FORBIDDEN, "<Error>AccessDenied</Error>"),
                        };
                        Ok::<_, Infallible>(
                            Response::builder()
                                .status(status)
                                .body(Full::new(Bytes::from(body)))
                                .unwrap(),
                        )
                    }
                });
                let _ = hyper::server::conn::http1::Builder::new()
                    .serve_connection(TokioIo::new(stream), service)
                    .await;
            });
        }
    });

    seen
}

/// Origin that sends headers promising 100 bytes, sends 5, then stalls
async fn start_stalling_origin(port: u16) {
    let listener = TcpListener::bind(("127.0.0.1", port)).await.unwrap();
    tokio::spawn(async move {
        while let Ok((mut stream, _)) = listener.accept().await {
            tokio::spawn(async move {
                let mut buf = [0u8; 2048];
                let _ = stream.read(&mut buf).await;
                let _ = stream
                    .write_all(b"HTTP/1.1 200 OK\r\nContent-Length: 100\r\n\r\nhello")
                    .await;
                tokio::time::sleep(Duration::from_secs(30)).await;
            });
        }
    });
}

async fn start_router(port: u16, artifact_base: String) -> watch::Sender<bool> {
    start_router_with_timeout(port, artifact_base, 5).await
}

async fn start_router_with_timeout(port: u16, artifact_base: String, timeout_secs: u64) -> watch::Sender<bool> {
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let config = RouterConfig {
        port,
        bind: "127.0.0.1".to_string(),
        artifact_base,
        request_timeout_secs: timeout_secs,
        ..Default::default()
    };
    let addr: SocketAddr = format!("127.0.0.1:{}", port).parse().unwrap();
    let server = RouterServer::new(addr, &config, shutdown_rx).unwrap();
    tokio::spawn(async move {
        let _ = server.run().await;
    });
    assert!(wait_for_port(port, Duration::from_secs(5)).await, "router did not start");
    shutdown_tx
}

#[tokio::test]
async fn test_router_serves_index_for_subdomain() {
    let seen = start_origin(18111).await;
    let _shutdown = start_router(18101, "http://127.0.0.1:18111/__outputs".to_string()).await;

    let response = http_get_with_host(18101, "/", "demo.localhost:8000").await.unwrap();
    assert_eq!(status_of(&response), 200, "{}", response);
    assert!(response.contains("<h1>demo site</h1>"));
    assert!(response.to_ascii_lowercase().contains("x-request-id"));

    // Client-side route falls back to the index document
    let response = http_get_with_host(18101, "/about/team", "demo.localhost:8000").await.unwrap();
    assert_eq!(status_of(&response), 200);

    // Files are fetched as-is
    let response = http_get_with_host(18101, "/assets/app.js", "demo.localhost:8000").await.unwrap();
    assert_eq!(status_of(&response), 200);
    assert!(response.contains("console.log('demo')"));

    assert_eq!(
        seen_paths(&seen),
        vec![
            "/__outputs/demo/index.html",
            "/__outputs/demo/index.html",
            "/__outputs/demo/assets/app.js",
        ]
    );
}

#[tokio::test]
async fn test_router_rewrites_host_and_sets_forwarded_headers() {
    let seen = start_origin(18116).await;
    let _shutdown = start_router(18106, "http://127.0.0.1:18116/__outputs".to_string()).await;

    let response = http_request(
        18106,
        "GET / HTTP/1.1\r\nHost: demo.localhost:8000\r\nX-Forwarded-For: 203.0.113.9\r\nX-Forwarded-Proto: https\r\nConnection: close\r\n\r\n"
            .to_string(),
    )
    .await
    .unwrap();
    assert_eq!(status_of(&response), 200, "{}", response);

    let seen = seen.lock();
    assert_eq!(seen.len(), 1);
    let headers = &seen[0].headers;
    let header = |name: &str| {
        headers
            .get(name)
            .and_then(|v| v.to_str().ok())
            .map(String::from)
            .unwrap_or_default()
    };

    // Host matches the origin, not the client-facing host
    assert_eq!(header("host"), "127.0.0.1:18116");
    assert_eq!(header("x-original-host"), "demo.localhost:8000");
    assert_eq!(header("x-forwarded-host"), "demo.localhost");
    assert_eq!(header("x-forwarded-for"), "127.0.0.1");
    assert_eq!(header("x-forwarded-proto"), "https");
    assert!(!header("x-request-id").is_empty());
}

#[tokio::test]
async fn test_router_slow_origin_times_out() {
    let _seen = start_origin(18117).await;
    let _shutdown = start_router_with_timeout(18107, "http://127.0.0.1:18117/__outputs".to_string(), 1).await;

    let started = std::time::Instant::now();
    let response = http_get_with_host(18107, "/", "slow.localhost:8000").await.unwrap();
    assert_eq!(status_of(&response), 504, "{}", response);
    assert_eq!(json_body(&response)["code"], "REQUEST_TIMEOUT");
    assert!(started.elapsed() < Duration::from_millis(2500));

    // Other tenants are unaffected
    let response = http_get_with_host(18107, "/", "demo.localhost:8000").await.unwrap();
    assert_eq!(status_of(&response), 200);
}

#[tokio::test]
async fn test_router_stalled_body_is_cut_off() {
    start_stalling_origin(18118).await;
    let _shutdown = start_router_with_timeout(18108, "http://127.0.0.1:18118/__outputs".to_string(), 1).await;

    let response = tokio::time::timeout(
        Duration::from_secs(5),
        http_get_with_host(18108, "/", "demo.localhost:8000"),
    )
    .await
    .expect("router must end the response once the request timeout passes")
    .unwrap_or_default();

    // Headers and the partial body got through; the rest never will
    assert_eq!(status_of(&response), 200, "{}", response);
    let body = response.split("\r\n\r\n").nth(1).unwrap_or("");
    assert!(body.len() < 100, "{}", response);
}

#[tokio::test]
async fn test_router_forwarded_host_wins() {
    let seen = start_origin(18112).await;
    let _shutdown = start_router(18102, "http://127.0.0.1:18112/__outputs".to_string()).await;

    let response = http_request(
        18102,
        "GET / HTTP/1.1\r\nHost: internal-lb:8000\r\nX-Forwarded-Host: demo.example.com\r\nConnection: close\r\n\r\n"
            .to_string(),
    )
    .await
    .unwrap();

    assert_eq!(status_of(&response), 200, "{}", response);
    assert_eq!(seen_paths(&seen), vec!["/__outputs/demo/index.html"]);
}

#[tokio::test]
async fn test_router_unknown_slug_then_recovers() {
    let _seen = start_origin(18113).await;
    let _shutdown = start_router(18103, "http://127.0.0.1:18113/__outputs".to_string()).await;

    let response = http_get_with_host(18103, "/", "ghost.localhost:8000").await.unwrap();
    assert_eq!(status_of(&response), 404, "{}", response);
    let body = json_body(&response);
    assert_eq!(body["code"], "ARTIFACT_NOT_FOUND");
    assert!(response.contains("X-Proxy-Error") || response.contains("x-proxy-error"));

    // One tenant's miss doesn't affect the next request
    let response = http_get_with_host(18103, "/", "demo.localhost:8000").await.unwrap();
    assert_eq!(status_of(&response), 200);
}

#[tokio::test]
async fn test_router_unreachable_origin() {
    let _shutdown = start_router(18104, "http://127.0.0.1:1/__outputs".to_string()).await;

    let response = http_get_with_host(18104, "/", "demo.localhost:8000").await.unwrap();
    assert_eq!(status_of(&response), 502, "{}", response);
    assert_eq!(json_body(&response)["code"], "ORIGIN_UNREACHABLE");

    // The router itself keeps serving
    let response = http_get_with_host(18104, "/health", "demo.localhost:8000").await.unwrap();
    assert_eq!(status_of(&response), 200);
    let health = json_body(&response);
    assert_eq!(health["health"], "ok");
    assert_eq!(health["forwards"]["failed"], 1);
}

#[tokio::test]
async fn test_router_stops_on_shutdown() {
    let _seen = start_origin(18115).await;
    let shutdown = start_router(18105, "http://127.0.0.1:18115/__outputs".to_string()).await;

    shutdown.send(true).unwrap();
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert!(TcpStream::connect("127.0.0.1:18105").await.is_err());
}

// ============================================================================
// Gateway
// ============================================================================

#[derive(Default)]
struct TestScheduler {
    tasks: Mutex<Vec<BuildTask>>,
    reject: bool,
}

#[async_trait]
impl TaskScheduler for TestScheduler {
    async fn submit(&self, task: &BuildTask) -> Result<TaskHandle, SchedulerError> {
        if self.reject {
            return Err(SchedulerError::Rejected("cluster not found".to_string()));
        }
        self.tasks.lock().push(task.clone());
        Ok(TaskHandle(format!("arn:task/{}", task.slug)))
    }

    fn name(&self) -> &'static str {
        "test"
    }
}

struct Gateway {
    bus: Arc<MemoryBus>,
    rooms: Arc<RoomRegistry>,
    scheduler: Arc<TestScheduler>,
    _shutdown: watch::Sender<bool>,
}

async fn start_gateway(port: u16, scheduler: TestScheduler) -> Gateway {
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let bus = Arc::new(MemoryBus::new(64));
    let rooms = Arc::new(RoomRegistry::new());
    let scheduler = Arc::new(scheduler);

    let relay = LogRelay::new(
        Arc::clone(&bus) as Arc<dyn LogBus>,
        Arc::clone(&rooms),
        TopicPattern::default(),
        Backoff::new(Duration::from_millis(10), Duration::from_millis(100)),
        shutdown_rx.clone(),
    );
    let relay_stats = relay.stats();
    tokio::spawn(relay.run());

    let dispatcher = Dispatcher::new(
        Arc::clone(&scheduler) as Arc<dyn TaskScheduler>,
        PublicUrl {
            scheme: "http".to_string(),
            platform_domain: "localhost:8000".to_string(),
        },
    );

    let addr: SocketAddr = format!("127.0.0.1:{}", port).parse().unwrap();
    let server = GatewayServer::new(
        addr,
        GatewayState {
            dispatcher,
            rooms: Arc::clone(&rooms),
            relay_stats,
            session: SessionSettings::default(),
            max_body_bytes: 4096,
        },
        shutdown_rx,
    );
    tokio::spawn(async move {
        let _ = server.run().await;
    });

    assert!(wait_for_port(port, Duration::from_secs(5)).await, "gateway did not start");

    // Relay must be subscribed before anything is published
    let start = std::time::Instant::now();
    while bus.subscriber_count() == 0 && start.elapsed() < Duration::from_secs(5) {
        tokio::time::sleep(Duration::from_millis(10)).await;
    }

    Gateway {
        bus,
        rooms,
        scheduler,
        _shutdown: shutdown_tx,
    }
}

async fn connect(port: u16) -> Client {
    let (ws, _) = connect_async(format!("ws://127.0.0.1:{}/", port)).await.unwrap();
    ws
}

async fn send_event(ws: &mut Client, event: &str, data: &str) {
    let frame = serde_json::json!({"event": event, "data": data}).to_string();
    ws.send(Message::text(frame)).await.unwrap();
}

/// Next text frame as JSON, skipping control frames
async fn next_frame(ws: &mut Client) -> serde_json::Value {
    loop {
        let message = tokio::time::timeout(Duration::from_secs(5), ws.next())
            .await
            .expect("timed out waiting for frame")
            .expect("stream ended")
            .expect("read error");
        if let Message::Text(text) = message {
            return serde_json::from_str(text.as_str()).unwrap();
        }
    }
}

/// Assert nothing but control frames arrive within `wait`
async fn assert_silent(ws: &mut Client, wait: Duration) {
    let deadline = tokio::time::Instant::now() + wait;
    loop {
        match tokio::time::timeout_at(deadline, ws.next()).await {
            Err(_) => return,
            Ok(Some(Ok(Message::Text(text)))) => panic!("unexpected frame: {}", text.as_str()),
            Ok(Some(Ok(_))) => continue,
            Ok(other) => panic!("connection ended: {:?}", other.map(|r| r.is_ok())),
        }
    }
}

#[tokio::test]
async fn test_gateway_subscribe_ack_then_logs() {
    let gateway = start_gateway(18201, TestScheduler::default()).await;
    let mut ws = connect(18201).await;

    send_event(&mut ws, "subscribe", "demo").await;
    assert_eq!(
        next_frame(&mut ws).await,
        serde_json::json!({"event": "message", "data": "Joined demo"})
    );

    gateway.bus.publish("logs:demo", "Cloning repository...");
    gateway.bus.publish("logs:demo", "{\"step\":\"build\",\"ok\":true}");

    assert_eq!(
        next_frame(&mut ws).await,
        serde_json::json!({"event": "message", "data": "Cloning repository..."})
    );
    assert_eq!(
        next_frame(&mut ws).await,
        serde_json::json!({"event": "message", "data": "{\"step\":\"build\",\"ok\":true}"})
    );
}

#[tokio::test]
async fn test_gateway_rooms_are_isolated() {
    let gateway = start_gateway(18202, TestScheduler::default()).await;
    let mut alice = connect(18202).await;
    let mut bob = connect(18202).await;

    send_event(&mut alice, "subscribe", "demo").await;
    next_frame(&mut alice).await;
    send_event(&mut bob, "subscribe", "logs:other").await;
    assert_eq!(next_frame(&mut bob).await["data"], "Joined other");

    gateway.bus.publish("logs:demo", "for alice");
    assert_eq!(next_frame(&mut alice).await["data"], "for alice");
    assert_silent(&mut bob, Duration::from_millis(200)).await;

    gateway.bus.publish("logs:other", "for bob");
    assert_eq!(next_frame(&mut bob).await["data"], "for bob");
    assert_silent(&mut alice, Duration::from_millis(200)).await;
}

#[tokio::test]
async fn test_gateway_unsubscribe_and_bad_frames() {
    let gateway = start_gateway(18203, TestScheduler::default()).await;
    let mut ws = connect(18203).await;

    ws.send(Message::text("not json".to_string())).await.unwrap();
    assert_eq!(next_frame(&mut ws).await["event"], "error");

    send_event(&mut ws, "subscribe", "demo").await;
    next_frame(&mut ws).await;
    send_event(&mut ws, "unsubscribe", "demo").await;
    assert_eq!(next_frame(&mut ws).await["data"], "Left demo");

    gateway.bus.publish("logs:demo", "nobody listening");
    assert_silent(&mut ws, Duration::from_millis(200)).await;
}

#[tokio::test]
async fn test_gateway_disconnect_leaves_rooms() {
    let gateway = start_gateway(18204, TestScheduler::default()).await;
    let mut ws = connect(18204).await;

    send_event(&mut ws, "subscribe", "demo").await;
    next_frame(&mut ws).await;
    assert_eq!(gateway.rooms.member_count("demo"), 1);

    ws.close(None).await.unwrap();
    drop(ws);

    let start = std::time::Instant::now();
    while gateway.rooms.member_count("demo") > 0 && start.elapsed() < Duration::from_secs(5) {
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    assert_eq!(gateway.rooms.member_count("demo"), 0);
    assert_eq!(gateway.rooms.stats().sessions, 0);

    // Publishing to an empty room is harmless
    gateway.bus.publish("logs:demo", "late line");
}

#[tokio::test]
async fn test_gateway_submit_project() {
    let gateway = start_gateway(18205, TestScheduler::default()).await;

    let response = http_post_json(
        18205,
        "/project",
        r#"{"gitURL":"https://github.com/acme/site.git","slug":"demo"}"#,
    )
    .await
    .unwrap();
    assert_eq!(status_of(&response), 200, "{}", response);
    assert_eq!(
        json_body(&response),
        serde_json::json!({
            "status": "queued",
            "data": {"projectSlug": "demo", "url": "http://demo.localhost:8000"}
        })
    );
    assert!(response.to_ascii_lowercase().contains("access-control-allow-origin: *"));

    // Without a slug one is generated
    let response = http_post_json(18205, "/project", r#"{"gitURL":"https://github.com/acme/site.git"}"#)
        .await
        .unwrap();
    assert_eq!(status_of(&response), 200);
    let slug = json_body(&response)["data"]["projectSlug"]
        .as_str()
        .unwrap()
        .to_string();
    assert!(tenantgate::slug::is_valid_slug(&slug));

    let tasks = gateway.scheduler.tasks.lock();
    assert_eq!(tasks.len(), 2);
    assert_eq!(tasks[0].slug, "demo");
    assert_eq!(tasks[1].slug, slug);
}

#[tokio::test]
async fn test_gateway_submit_errors() {
    let gateway = start_gateway(18206, TestScheduler::default()).await;

    let response = http_post_json(18206, "/project", "{not json").await.unwrap();
    assert_eq!(status_of(&response), 400);
    assert_eq!(json_body(&response)["status"], "error");

    let response = http_post_json(18206, "/project", r#"{"slug":"demo"}"#).await.unwrap();
    assert_eq!(status_of(&response), 400);
    assert_eq!(json_body(&response)["error"], "gitURL is required");

    let big = format!(r#"{{"gitURL":"https://github.com/{}"}}"#, "a".repeat(8192));
    let response = http_post_json(18206, "/project", &big).await.unwrap();
    assert_eq!(status_of(&response), 413);

    assert!(gateway.scheduler.tasks.lock().is_empty());

    let rejecting = start_gateway(
        18207,
        TestScheduler {
            reject: true,
            ..Default::default()
        },
    )
    .await;
    let response = http_post_json(18207, "/project", r#"{"gitURL":"https://github.com/acme/site.git"}"#)
        .await
        .unwrap();
    assert_eq!(status_of(&response), 502);
    assert!(json_body(&response)["error"]
        .as_str()
        .unwrap()
        .contains("cluster not found"));
    assert!(rejecting.scheduler.tasks.lock().is_empty());
}

#[tokio::test]
async fn test_gateway_preflight_and_health() {
    let _gateway = start_gateway(18208, TestScheduler::default()).await;

    let response = http_request(
        18208,
        "OPTIONS /project HTTP/1.1\r\nHost: 127.0.0.1\r\nOrigin: http://app.example\r\nConnection: close\r\n\r\n"
            .to_string(),
    )
    .await
    .unwrap();
    assert_eq!(status_of(&response), 204);
    assert!(response.to_ascii_lowercase().contains("access-control-allow-methods: get, post"));

    let response = http_get_with_host(18208, "/health", "127.0.0.1").await.unwrap();
    assert_eq!(status_of(&response), 200);
    let health = json_body(&response);
    assert_eq!(health["health"], "ok");
    assert_eq!(health["scheduler"], "test");
    assert_eq!(health["relay"]["connected"], true);

    let response = http_get_with_host(18208, "/nope", "127.0.0.1").await.unwrap();
    assert_eq!(status_of(&response), 404);
}
