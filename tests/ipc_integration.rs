//! End-to-end tests for the daemon engine: a mock browser endpoint on
//! one side, the real session manager, demultiplexer, router, and IPC
//! server on the other.

#![allow(clippy::needless_pass_by_value)]

use std::sync::{Arc, Mutex};
use std::time::Duration;

use browserd::cdp::{CdpClient, CdpConfig};
use browserd::config::{ConfigFile, Settings, SettingsOverride};
use browserd::daemon::DaemonContext;
use browserd::events::EventRouter;
use browserd::ipc::{IpcRequest, IpcServer, pid_file_path};
use browserd::router::Router;
use browserd::session::SessionManager;
use futures_util::{SinkExt, StreamExt};
use serde_json::{Value, json};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, UnixStream};
use tokio::sync::{mpsc, watch};
use tokio_tungstenite::tungstenite::Message;

// =============================================================================
// Browser simulator
// =============================================================================

/// A scripted browser endpoint: one page target, canned `Runtime`
/// evaluation results, a cookie jar, and optional automatic load
/// events after `Page.navigate`.
struct Simulator {
    url: String,
    /// Every command the "browser" received, in order.
    record_rx: mpsc::Receiver<Value>,
    /// Inject raw frames (events) into the connection.
    frame_tx: mpsc::Sender<Value>,
}

async fn start_simulator(auto_load: bool) -> Simulator {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let (record_tx, record_rx) = mpsc::channel::<Value>(256);
    let (frame_tx, mut frame_rx) = mpsc::channel::<Value>(32);
    let jar: Arc<Mutex<Vec<Value>>> = Arc::new(Mutex::new(Vec::new()));

    tokio::spawn(async move {
        let Ok((stream, _)) = listener.accept().await else {
            return;
        };
        let ws = tokio_tungstenite::accept_async(stream).await.unwrap();
        let (mut sink, mut source) = ws.split();

        loop {
            tokio::select! {
                msg = source.next() => {
                    let text = match msg {
                        Some(Ok(Message::Text(text))) => text,
                        None | Some(Err(_)) => break,
                        _ => continue,
                    };
                    let cmd: Value = serde_json::from_str(&text).unwrap();
                    let _ = record_tx.send(cmd.clone()).await;

                    let method = cmd["method"].as_str().unwrap_or_default();
                    let result = respond(method, &cmd, &jar);
                    let mut response = json!({"id": cmd["id"], "result": result});
                    if let Some(sid) = cmd.get("sessionId") {
                        response["sessionId"] = sid.clone();
                    }
                    sink.send(Message::Text(response.to_string().into()))
                        .await
                        .unwrap();

                    if auto_load && method == "Page.navigate" {
                        let load = json!({
                            "method": "Page.loadEventFired",
                            "params": {"timestamp": 1.0},
                            "sessionId": cmd["sessionId"],
                        });
                        sink.send(Message::Text(load.to_string().into()))
                            .await
                            .unwrap();
                    }
                }
                frame = frame_rx.recv() => {
                    match frame {
                        Some(frame) => {
                            sink.send(Message::Text(frame.to_string().into()))
                                .await
                                .unwrap();
                        }
                        None => break,
                    }
                }
            }
        }
    });

    Simulator {
        url: format!("ws://{addr}"),
        record_rx,
        frame_tx,
    }
}

fn respond(method: &str, cmd: &Value, jar: &Arc<Mutex<Vec<Value>>>) -> Value {
    match method {
        "Target.getTargets" => json!({
            "targetInfos": [
                {"targetId": "T1", "type": "page", "url": "about:blank", "title": "New Tab"}
            ]
        }),
        "Target.attachToTarget" => {
            let tid = cmd["params"]["targetId"].as_str().unwrap_or("T");
            json!({"sessionId": format!("sess-{tid}")})
        }
        "Page.navigate" => json!({"frameId": "F1"}),
        "Page.getNavigationHistory" => json!({
            "currentIndex": 0,
            "entries": [{"id": 1, "url": "about:blank"}]
        }),
        "Runtime.evaluate" => evaluate(cmd["params"]["expression"].as_str().unwrap_or_default()),
        "Network.getCookies" => {
            let cookies = jar.lock().unwrap().clone();
            json!({"cookies": cookies})
        }
        "Network.setCookie" => {
            let params = &cmd["params"];
            let mut jar = jar.lock().unwrap();
            jar.retain(|c| c["name"] != params["name"]);
            jar.push(json!({
                "name": params["name"],
                "value": params["value"],
                "domain": params["domain"].as_str().unwrap_or("example.com"),
                "path": params["path"].as_str().unwrap_or("/"),
            }));
            json!({"success": true})
        }
        "Network.deleteCookies" => {
            jar.lock()
                .unwrap()
                .retain(|c| c["name"] != cmd["params"]["name"]);
            json!({})
        }
        _ => json!({}),
    }
}

fn evaluate(expression: &str) -> Value {
    let result = match expression {
        "document.documentElement.outerHTML" => json!({
            "type": "string",
            "value": "<!DOCTYPE html>\n<html>\n<head><title>Example Domain</title></head>\n<body><p>Example body</p></body>\n</html>"
        }),
        "document.readyState" => json!({"type": "string", "value": "complete"}),
        "1+1" => json!({"type": "number", "value": 2}),
        "'x'" => json!({"type": "string", "value": "x"}),
        "null" => json!({"type": "object", "subtype": "null", "value": null}),
        "undefined" => json!({"type": "undefined"}),
        "throw new Error('boom')" => {
            return json!({
                "result": {"type": "object", "className": "Error"},
                "exceptionDetails": {
                    "text": "Uncaught",
                    "exception": {"description": "Error: boom"}
                }
            });
        }
        _ => json!({"type": "undefined"}),
    };
    json!({"result": result})
}

// =============================================================================
// Harness
// =============================================================================

/// The daemon engine wired to a simulator, minus the browser process.
struct Harness {
    router: Arc<Router>,
    ctx: Arc<DaemonContext>,
    sim: Simulator,
}

async fn start_harness(auto_load: bool) -> Harness {
    let sim = start_simulator(auto_load).await;

    let cdp_config = CdpConfig {
        connect_timeout: Duration::from_secs(5),
        call_timeout: Duration::from_secs(5),
        event_capacity: 256,
    };
    let (client, events) = CdpClient::connect(&sim.url, cdp_config).await.unwrap();

    let settings = Settings::resolve(&SettingsOverride::default(), &ConfigFile::default());
    let sessions = SessionManager::new(client.clone());
    let ctx = Arc::new(DaemonContext::assemble(
        client.clone(),
        Arc::clone(&sessions),
        settings,
    ));

    let demux = EventRouter::new(
        client,
        Arc::clone(&ctx.sessions),
        Arc::clone(&ctx.console),
        Arc::clone(&ctx.network),
        ctx.settings.body_limit,
    );
    tokio::spawn(demux.run(events));

    sessions.start_discovery().await.unwrap();
    for _ in 0..100 {
        if sessions.has_sessions() {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert!(sessions.has_sessions(), "simulator session never attached");
    // Let the attach-time domain enables drain.
    tokio::time::sleep(Duration::from_millis(50)).await;

    let router = Arc::new(Router::new(Arc::clone(&ctx)));
    Harness { router, ctx, sim }
}

impl Harness {
    async fn dispatch(&self, cmd: &str, params: Value) -> browserd::ipc::IpcResponse {
        self.router
            .dispatch(IpcRequest {
                cmd: cmd.into(),
                params,
                target: None,
            })
            .await
    }

    /// Methods the simulator has seen so far.
    fn drain_methods(&mut self) -> Vec<String> {
        let mut methods = Vec::new();
        while let Ok(cmd) = self.sim.record_rx.try_recv() {
            methods.push(cmd["method"].as_str().unwrap_or_default().to_owned());
        }
        methods
    }
}

// =============================================================================
// Status, target, clear
// =============================================================================

#[tokio::test]
async fn status_reports_the_attached_session() {
    let harness = start_harness(false).await;
    let response = harness.dispatch("status", Value::Null).await;

    assert!(response.ok);
    let data = response.data.unwrap();
    assert_eq!(data["running"], true);
    assert_eq!(data["activeSession"], "sess-T1");
    assert_eq!(data["sessions"][0]["url"], "about:blank");
}

#[tokio::test]
async fn unknown_command_is_rejected() {
    let harness = start_harness(false).await;
    let response = harness.dispatch("frobnicate", Value::Null).await;
    assert!(!response.ok);
    assert!(response.error.unwrap().contains("unknown command"));
}

#[tokio::test]
async fn clear_console_then_console_is_empty() {
    let harness = start_harness(false).await;
    harness.ctx.console.push(browserd::telemetry::ConsoleEntry {
        timestamp_ms: 1,
        level: browserd::telemetry::ConsoleLevel::Log,
        text: "hello".into(),
        url: None,
        line: None,
        column: None,
        stack: None,
    });

    let response = harness
        .dispatch("clear", json!({"target": "console"}))
        .await;
    assert!(response.ok);

    let response = harness.dispatch("console", Value::Null).await;
    let data = response.data.unwrap();
    assert_eq!(data["total"], 0);
    assert_eq!(data["entries"].as_array().unwrap().len(), 0);
}

#[tokio::test]
async fn clear_rejects_unknown_rings() {
    let harness = start_harness(false).await;
    let response = harness.dispatch("clear", json!({"target": "sessions"})).await;
    assert!(!response.ok);
    assert!(response.error.unwrap().contains("invalid clear target"));
}

// =============================================================================
// Eval value shapes
// =============================================================================

#[tokio::test]
async fn eval_value_shapes_round_trip() {
    let harness = start_harness(false).await;

    let data = harness
        .dispatch("eval", json!({"expr": "1+1"}))
        .await
        .data
        .unwrap();
    assert_eq!(data["value"], 2);
    assert_eq!(data["type"], "number");

    let data = harness
        .dispatch("eval", json!({"expr": "'x'"}))
        .await
        .data
        .unwrap();
    assert_eq!(data["value"], "x");
    assert_eq!(data["type"], "string");

    let data = harness
        .dispatch("eval", json!({"expr": "null"}))
        .await
        .data
        .unwrap();
    assert_eq!(data["value"], Value::Null);
    assert_eq!(data["type"], "object");

    let data = harness
        .dispatch("eval", json!({"expr": "undefined"}))
        .await
        .data
        .unwrap();
    assert_eq!(data["value"], Value::Null);
    assert_eq!(data["type"], "undefined");
}

#[tokio::test]
async fn eval_surfaces_js_exceptions() {
    let harness = start_harness(false).await;
    let response = harness
        .dispatch("eval", json!({"expr": "throw new Error('boom')"}))
        .await;
    assert!(!response.ok);
    assert_eq!(
        response.error.unwrap(),
        "JavaScript error: Error: boom"
    );
}

// =============================================================================
// Navigation
// =============================================================================

#[tokio::test]
async fn navigate_with_wait_then_html_is_fast_without_network_enable() {
    let mut harness = start_harness(true).await;
    harness.drain_methods();

    let response = harness
        .dispatch(
            "navigate",
            json!({"url": "https://example.com", "wait": true, "timeout": 5000}),
        )
        .await;
    assert!(response.ok, "navigate failed: {:?}", response.error);

    // The regression guard: html right after a waited navigation
    // answers promptly because nothing enabled the Network domain.
    let started = std::time::Instant::now();
    let response = harness.dispatch("html", Value::Null).await;
    assert!(response.ok);
    assert!(started.elapsed() < Duration::from_millis(500));
    let html = response.data.unwrap()["html"].as_str().unwrap().to_owned();
    assert!(html.contains("<title>"));

    let methods = harness.drain_methods();
    assert!(
        !methods.iter().any(|m| m == "Network.enable"),
        "navigate/html must not enable Network: {methods:?}"
    );
}

#[tokio::test]
async fn second_navigation_supersedes_the_first_wait() {
    let harness = start_harness(false).await;

    let first = {
        let router = Arc::clone(&harness.router);
        tokio::spawn(async move {
            router
                .dispatch(IpcRequest {
                    cmd: "navigate".into(),
                    params: json!({"url": "https://a.test", "wait": true, "timeout": 10000}),
                    target: None,
                })
                .await
        })
    };
    // Let the first navigation arm its waiter.
    tokio::time::sleep(Duration::from_millis(150)).await;

    let second = harness
        .dispatch("navigate", json!({"url": "https://b.test"}))
        .await;
    assert!(second.ok);

    let first = first.await.unwrap();
    assert!(!first.ok);
    assert_eq!(first.error.unwrap(), "Superseded");
}

#[tokio::test]
async fn back_with_no_history_is_an_error() {
    let harness = start_harness(false).await;
    let response = harness.dispatch("back", Value::Null).await;
    assert!(!response.ok);
    assert_eq!(response.error.unwrap(), "No previous page");
}

#[tokio::test]
async fn ready_returns_immediately_when_complete() {
    let harness = start_harness(false).await;
    let response = harness.dispatch("ready", json!({"timeout": 2000})).await;
    assert!(response.ok);
    let data = response.data.unwrap();
    assert_eq!(data["mode"], "page-load");
    assert!(data["waitedMs"].as_u64().unwrap() < 2000);
}

#[tokio::test]
async fn ready_modes_are_mutually_exclusive() {
    let harness = start_harness(false).await;
    let response = harness
        .dispatch(
            "ready",
            json!({"selector": "#app", "networkIdle": true}),
        )
        .await;
    assert!(!response.ok);
    assert!(response.error.unwrap().contains("mutually exclusive"));
}

// =============================================================================
// Telemetry commands
// =============================================================================

#[tokio::test]
async fn network_command_enables_network_exactly_once() {
    let mut harness = start_harness(false).await;
    harness.drain_methods();

    for _ in 0..3 {
        let response = harness.dispatch("network", Value::Null).await;
        assert!(response.ok);
    }

    let methods = harness.drain_methods();
    let enables = methods.iter().filter(|m| *m == "Network.enable").count();
    assert_eq!(enables, 1, "lazy enable must be once per session: {methods:?}");
}

#[tokio::test]
async fn console_events_land_in_the_ring() {
    let harness = start_harness(false).await;

    harness
        .sim
        .frame_tx
        .send(json!({
            "method": "Runtime.consoleAPICalled",
            "params": {
                "type": "error",
                "args": [{"type": "string", "value": "kaboom"}]
            },
            "sessionId": "sess-T1"
        }))
        .await
        .unwrap();

    // The demux runs on its own task; give it a beat.
    for _ in 0..50 {
        if !harness.ctx.console.is_empty() {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }

    let response = harness.dispatch("console", json!({"type": "error"})).await;
    let data = response.data.unwrap();
    assert_eq!(data["total"], 1);
    assert_eq!(data["entries"][0]["text"], "kaboom");
}

#[tokio::test]
async fn cookie_set_get_delete_round_trip() {
    let harness = start_harness(false).await;

    let response = harness
        .dispatch(
            "cookies",
            json!({"action": "set", "name": "k", "value": "v", "domain": "example.com"}),
        )
        .await;
    assert!(response.ok, "{:?}", response.error);

    let data = harness
        .dispatch("cookies", json!({"action": "get"}))
        .await
        .data
        .unwrap();
    let cookies = data["cookies"].as_array().unwrap();
    assert!(
        cookies
            .iter()
            .any(|c| c["name"] == "k" && c["value"] == "v")
    );

    let response = harness
        .dispatch("cookies", json!({"action": "delete", "name": "k"}))
        .await;
    assert!(response.ok);

    let data = harness
        .dispatch("cookies", json!({"action": "get"}))
        .await
        .data
        .unwrap();
    assert!(
        data["cookies"]
            .as_array()
            .unwrap()
            .iter()
            .all(|c| c["name"] != "k")
    );
}

#[tokio::test]
async fn find_searches_the_page_html() {
    let harness = start_harness(false).await;

    let data = harness
        .dispatch("find", json!({"text": "example domain"}))
        .await
        .data
        .unwrap();
    assert_eq!(data["total"], 1);
    assert!(
        data["matches"][0]["text"]
            .as_str()
            .unwrap()
            .contains("Example Domain")
    );

    let response = harness.dispatch("find", json!({"text": "ab"})).await;
    assert!(!response.ok, "short queries must be rejected");
}

// =============================================================================
// IPC wire
// =============================================================================

#[tokio::test]
async fn ipc_socket_serves_requests_line_by_line() {
    let harness = start_harness(false).await;

    let dir = tempfile::tempdir().unwrap();
    let socket_path = dir.path().join("browserd.sock");
    let server = Arc::new(IpcServer::bind(&socket_path).unwrap());
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let server_task = {
        let server = Arc::clone(&server);
        let router = Arc::clone(&harness.router);
        tokio::spawn(async move { server.run(router, shutdown_rx).await })
    };

    let stream = UnixStream::connect(&socket_path).await.unwrap();
    let (read_half, mut write_half) = stream.into_split();
    let mut lines = BufReader::new(read_half).lines();

    // Two requests, two responses, in order.
    write_half
        .write_all(b"{\"cmd\":\"status\"}\n{\"cmd\":\"nonsense\"}\n")
        .await
        .unwrap();

    let first: Value =
        serde_json::from_str(&lines.next_line().await.unwrap().unwrap()).unwrap();
    assert_eq!(first["ok"], true);
    assert_eq!(first["data"]["running"], true);

    let second: Value =
        serde_json::from_str(&lines.next_line().await.unwrap().unwrap()).unwrap();
    assert_eq!(second["ok"], false);

    // Malformed JSON gets an error response, not a hangup.
    write_half.write_all(b"this is not json\n").await.unwrap();
    let third: Value =
        serde_json::from_str(&lines.next_line().await.unwrap().unwrap()).unwrap();
    assert_eq!(third["ok"], false);
    assert!(third["error"].as_str().unwrap().contains("malformed"));

    shutdown_tx.send(true).unwrap();
    server_task.await.unwrap();
    server.cleanup();
    assert!(!socket_path.exists());
    assert!(!pid_file_path(&socket_path).exists());
}
