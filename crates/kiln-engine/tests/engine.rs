//! End-to-end tests over a real loopback HTTP server.
//!
//! These exercise the paths the unit tests stub out: the HTTP dispatch
//! target and the sandboxed fetch capability talking to an actual socket.

use std::sync::Arc;

use serde_json::Value;
use tokio::io::{AsyncReadExt, AsyncWriteExt};

use kiln_engine::{
    DetailLevel, EngineConfig, ExecutionRequest, HttpDispatcher, ScriptEngine, ToolDispatcher,
    EXIT_OK,
};

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_test_writer()
        .try_init();
}

/// Minimal one-response-per-connection HTTP server on an ephemeral loopback
/// port. Good enough for reqwest: fixed status line, JSON body, close.
async fn spawn_stub_server(status_line: &'static str, body: &'static str) -> std::net::SocketAddr {
    init_tracing();
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        loop {
            let Ok((mut socket, _)) = listener.accept().await else {
                break;
            };
            tokio::spawn(async move {
                let mut buf = vec![0u8; 64 * 1024];
                let _ = socket.read(&mut buf).await;
                let response = format!(
                    "HTTP/1.1 {status_line}\r\n\
                     content-type: application/json\r\n\
                     content-length: {}\r\n\
                     connection: close\r\n\r\n{body}",
                    body.len()
                );
                let _ = socket.write_all(response.as_bytes()).await;
                let _ = socket.shutdown().await;
            });
        }
    });
    addr
}

fn engine_over(dir: &tempfile::TempDir, dispatcher: Arc<dyn ToolDispatcher>) -> ScriptEngine {
    ScriptEngine::new(EngineConfig::new(dir.path()), dispatcher).unwrap()
}

#[tokio::test]
async fn http_dispatcher_round_trips_tool_calls() {
    let addr = spawn_stub_server("200 OK", r#"{"issues": ["a", "b"]}"#).await;
    let invoke_url = format!("http://127.0.0.1:{}/invoke", addr.port())
        .parse()
        .unwrap();
    let search_url = format!("http://127.0.0.1:{}/search", addr.port())
        .parse()
        .unwrap();
    let dispatcher = HttpDispatcher::new(invoke_url, search_url);

    let result = dispatcher
        .call_tool("github__list_issues", serde_json::json!({ "repo": "kiln" }))
        .await
        .unwrap();
    assert_eq!(result["issues"][0], "a");

    let result = dispatcher
        .search_tools("issues", DetailLevel::FullSchema)
        .await
        .unwrap();
    assert_eq!(result["issues"][1], "b");
}

#[tokio::test]
async fn http_dispatcher_surfaces_upstream_failures() {
    let addr = spawn_stub_server("500 Internal Server Error", r#"{"error": "db down"}"#).await;
    let invoke_url = format!("http://127.0.0.1:{}/invoke", addr.port())
        .parse()
        .unwrap();
    let search_url = format!("http://127.0.0.1:{}/search", addr.port())
        .parse()
        .unwrap();
    let dispatcher = HttpDispatcher::new(invoke_url, search_url);

    let err = dispatcher
        .call_tool("github__list_issues", Value::Null)
        .await
        .unwrap_err();
    let msg = err.to_string();
    assert!(msg.contains("500"), "got: {msg}");
    assert!(msg.contains("github__list_issues"), "got: {msg}");
}

#[tokio::test]
async fn script_runs_against_http_dispatch_target() {
    let addr = spawn_stub_server("200 OK", r#"{"y": 7}"#).await;
    let invoke_url = format!("http://127.0.0.1:{}/invoke", addr.port())
        .parse()
        .unwrap();
    let search_url = format!("http://127.0.0.1:{}/search", addr.port())
        .parse()
        .unwrap();
    let dispatcher = Arc::new(HttpDispatcher::new(invoke_url, search_url));

    let dir = tempfile::tempdir().unwrap();
    let engine = engine_over(&dir, dispatcher);

    let code = r#"
        const r = await callTool("svc__op", {x: 1});
        console.log(r.y);
    "#;
    let result = engine.execute(ExecutionRequest::new(code)).await.unwrap();

    assert_eq!(result.exit_code, EXIT_OK, "error: {}", result.error);
    assert_eq!(result.stdout, "7\n");
    assert_eq!(result.tools_called, vec!["svc__op".to_string()]);
}

#[tokio::test]
async fn sandboxed_fetch_reaches_loopback_services() {
    let addr = spawn_stub_server("200 OK", r#"{"status": "healthy"}"#).await;

    let dir = tempfile::tempdir().unwrap();
    let null_dispatcher = Arc::new(NullDispatcher);
    let engine = engine_over(&dir, null_dispatcher);

    let code = format!(
        r#"
        const res = await fetch("http://127.0.0.1:{}/health");
        console.log(res.ok, res.status, res.statusText);
        const data = await res.json();
        console.log(data.status);
        console.log(await res.text());
        "#,
        addr.port()
    );
    let result = engine.execute(ExecutionRequest::new(code)).await.unwrap();

    assert_eq!(result.exit_code, EXIT_OK, "error: {}", result.error);
    assert_eq!(
        result.stdout,
        "true 200 OK\nhealthy\n{\"status\": \"healthy\"}\n"
    );
}

#[tokio::test]
async fn sandboxed_fetch_reports_error_statuses() {
    let addr = spawn_stub_server("404 Not Found", r#"{"error": "no such route"}"#).await;

    let dir = tempfile::tempdir().unwrap();
    let engine = engine_over(&dir, Arc::new(NullDispatcher));

    let code = format!(
        r#"
        const res = await fetch("http://localhost:{}/missing", {{method: "POST", body: "x=1"}});
        console.log(res.ok, res.status, res.statusText);
        "#,
        addr.port()
    );
    let result = engine.execute(ExecutionRequest::new(code)).await.unwrap();

    assert_eq!(result.exit_code, EXIT_OK, "error: {}", result.error);
    assert_eq!(result.stdout, "false 404 Not Found\n");
}

/// Dispatcher for tests that never touch the tool shims.
struct NullDispatcher;

#[async_trait::async_trait]
impl ToolDispatcher for NullDispatcher {
    async fn call_tool(
        &self,
        tool: &str,
        _args: Value,
    ) -> Result<Value, kiln_engine::DispatchError> {
        Err(kiln_engine::DispatchError::ToolNotFound(tool.to_string()))
    }

    async fn search_tools(
        &self,
        _query: &str,
        _detail: DetailLevel,
    ) -> Result<Value, kiln_engine::DispatchError> {
        Ok(Value::Array(Vec::new()))
    }
}
