//! RPC Surface (C12, spec.md §6): a local JSON request/response HTTP
//! listener, default `localhost:8473`, path `/mcp`, POST-only, CORS
//! permissive.
//!
//! Grounded on spec.md §9's "RPC tool set" design note (a static
//! `{name, schema, handler}` dispatch table rather than an ad hoc
//! match per endpoint) and on the teacher's `hyper`/`hyper-util`
//! dependency pair, already used the same way in
//! `crates/cuenv/src/coordinator` for its own local listener.

use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::Arc;

use bytes::Bytes;
use http_body_util::{BodyExt, Full};
use hyper::body::Incoming;
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Method, Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use serde::{Deserialize, Serialize};
use serde_json::json;
use tokio::net::TcpListener;
use tracing::{error, info, warn};

use crate::daemon::Daemon;

const DEFAULT_HOST: &str = "localhost";
const DEFAULT_PORT: u16 = 8473;
const RPC_PATH: &str = "/mcp";

/// One callable tool, matching spec.md §6's literal endpoint set.
#[derive(Debug, Deserialize)]
#[serde(tag = "tool", rename_all = "camelCase")]
enum RpcRequest {
    ListTools,
    Pause,
    Resume,
    GetArtifacts { filter: Option<String> },
    ComputeArtifact { output: String },
    ComputeAllArtifacts,
    GetStatus,
    ClearCache,
}

const TOOL_NAMES: &[&str] =
    &["listTools", "pause", "resume", "getArtifacts", "computeArtifact", "computeAllArtifacts", "getStatus", "clearCache"];

#[derive(Debug, Serialize)]
struct StatusPayload {
    paused: bool,
    watcher_count: usize,
}

async fn dispatch(daemon: &Arc<Daemon>, request: RpcRequest) -> Result<serde_json::Value, shadowdog_core::Error> {
    match request {
        RpcRequest::ListTools => Ok(json!({ "tools": TOOL_NAMES })),
        RpcRequest::Pause => {
            daemon.pause();
            Ok(json!({ "paused": true }))
        }
        RpcRequest::Resume => {
            daemon.resume().await;
            Ok(json!({ "paused": false }))
        }
        RpcRequest::GetArtifacts { filter } => {
            let config = daemon.config_snapshot();
            let mut outputs: Vec<String> = config
                .watchers
                .iter()
                .filter(|w| w.enabled)
                .flat_map(|w| &w.commands)
                .flat_map(|c| &c.artifacts)
                .map(|a| a.output.to_string_lossy())
                .collect();
            if let Some(filter) = filter {
                outputs.retain(|o| o.contains(&filter));
            }
            Ok(json!({ "artifacts": outputs }))
        }
        RpcRequest::ComputeArtifact { output } => {
            daemon.compute_artifact(&output).await?;
            Ok(json!({ "computed": output }))
        }
        RpcRequest::ComputeAllArtifacts => {
            daemon.compute_all_artifacts().await?;
            Ok(json!({ "computed": "all" }))
        }
        RpcRequest::GetStatus => {
            let config = daemon.config_snapshot();
            Ok(serde_json::to_value(StatusPayload {
                paused: daemon.is_paused(),
                watcher_count: config.watchers.iter().filter(|w| w.enabled).count(),
            })
            .expect("StatusPayload always serializes"))
        }
        RpcRequest::ClearCache => {
            daemon.clear_cache()?;
            Ok(json!({ "cleared": true }))
        }
    }
}

fn json_response(status: StatusCode, body: serde_json::Value) -> Response<Full<Bytes>> {
    let bytes = serde_json::to_vec(&body).unwrap_or_else(|_| b"{}".to_vec());
    Response::builder()
        .status(status)
        .header("content-type", "application/json")
        .header("access-control-allow-origin", "*")
        .header("access-control-allow-methods", "POST, OPTIONS")
        .header("access-control-allow-headers", "content-type")
        .body(Full::new(Bytes::from(bytes)))
        .expect("static response headers are always valid")
}

fn bad_request(message: impl Into<String>) -> Response<Full<Bytes>> {
    json_response(StatusCode::BAD_REQUEST, json!({ "error": { "kind": "RpcBadRequest", "message": message.into() } }))
}

fn error_response(error: shadowdog_core::Error) -> Response<Full<Bytes>> {
    let kind = error_kind(&error);
    json_response(StatusCode::INTERNAL_SERVER_ERROR, json!({ "error": { "kind": kind, "message": error.to_string() } }))
}

fn error_kind(error: &shadowdog_core::Error) -> &'static str {
    use shadowdog_core::Error;
    match error {
        Error::ConfigInvalid { .. } => "ConfigInvalid",
        Error::CycleDetected { .. } => "CycleDetected",
        Error::CachePackUnpackFail { .. } => "CachePackUnpackFail",
        Error::CommandFailed { .. } => "CommandFailed",
        Error::ArtifactUnavailable { .. } => "ArtifactUnavailable",
        Error::Io { .. } => "IoError",
        Error::RpcBadRequest { .. } => "RpcBadRequest",
        Error::CacheKeyInput { .. } => "CacheKeyInput",
    }
}

async fn handle(daemon: Arc<Daemon>, req: Request<Incoming>) -> Result<Response<Full<Bytes>>, Infallible> {
    if req.method() == Method::OPTIONS {
        return Ok(json_response(StatusCode::NO_CONTENT, serde_json::Value::Null));
    }
    if req.method() != Method::POST {
        return Ok(bad_request("only POST is accepted"));
    }
    if req.uri().path() != RPC_PATH {
        return Ok(bad_request(format!("unknown path '{}', expected '{RPC_PATH}'", req.uri().path())));
    }

    let body = match req.collect().await {
        Ok(collected) => collected.to_bytes(),
        Err(e) => return Ok(bad_request(format!("failed to read request body: {e}"))),
    };
    let request: RpcRequest = match serde_json::from_slice(&body) {
        Ok(r) => r,
        Err(e) => return Ok(bad_request(format!("malformed request: {e}"))),
    };

    Ok(match dispatch(&daemon, request).await {
        Ok(value) => json_response(StatusCode::OK, value),
        Err(e) => error_response(e),
    })
}

/// Start the RPC listener and serve connections until the daemon's
/// shutdown signal fires. Never panics the caller's task on a bind
/// failure; logs and returns instead, since the daemon should still
/// run the watch loop without RPC if the port is unavailable.
pub async fn serve(daemon: Arc<Daemon>, host: Option<&str>, port: Option<u16>) {
    let host = host.unwrap_or(DEFAULT_HOST);
    let port = port.unwrap_or(DEFAULT_PORT);
    let addr: SocketAddr = match format!("{host}:{port}").parse() {
        Ok(addr) => addr,
        Err(e) => {
            // `localhost` does not parse as a SocketAddr directly; resolve via std first.
            match std::net::ToSocketAddrs::to_socket_addrs(&(host, port)).ok().and_then(|mut it| it.next()) {
                Some(addr) => addr,
                None => {
                    error!(error = %e, host, port, "could not resolve RPC listener address");
                    return;
                }
            }
        }
    };

    let listener = match TcpListener::bind(addr).await {
        Ok(l) => l,
        Err(e) => {
            error!(error = %e, %addr, "failed to bind RPC listener");
            return;
        }
    };
    info!(%addr, path = RPC_PATH, "RPC surface listening");

    loop {
        let (stream, _peer) = match listener.accept().await {
            Ok(pair) => pair,
            Err(e) => {
                warn!(error = %e, "RPC listener accept failed");
                continue;
            }
        };
        let io = TokioIo::new(stream);
        let daemon = Arc::clone(&daemon);
        tokio::spawn(async move {
            let service = service_fn(move |req| handle(Arc::clone(&daemon), req));
            if let Err(e) = http1::Builder::new().serve_connection(io, service).await {
                warn!(error = %e, "RPC connection error");
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use shadowdog_core::config::Config;
    use shadowdog_core::types::{Artifact, Command, Invalidators, RelativePath, Watcher};
    use shadowdog_events::EventBus;
    use tempfile::TempDir;

    use crate::notify_channel::NotifyChannel;
    use crate::shutdown::ShutdownCoordinator;

    fn test_daemon(project: &std::path::Path) -> Arc<Daemon> {
        let config = Config {
            schema: None,
            debounce_time_ms: 50,
            default_ignored_files: vec![],
            plugins: vec![],
            watchers: vec![Watcher {
                enabled: true,
                files: vec![],
                invalidators: Invalidators::default(),
                ignored: vec![],
                label: None,
                commands: vec![Command {
                    command: "sh -c 'echo hi > out.txt'".to_string(),
                    working_directory: RelativePath::new(".").unwrap(),
                    tags: Default::default(),
                    artifacts: vec![Artifact { output: RelativePath::new("out.txt").unwrap(), description: None, ignore: vec![] }],
                }],
            }],
        };
        Daemon::new(
            project.to_path_buf(),
            project.join("shadowdog.json"),
            config,
            Arc::new(EventBus::new()),
            vec![],
            Arc::new(NotifyChannel::disabled()),
            ShutdownCoordinator::new(),
        )
    }

    #[tokio::test]
    async fn list_tools_reports_the_fixed_tool_set() {
        let project = TempDir::new().unwrap();
        let daemon = test_daemon(project.path());
        let value = dispatch(&daemon, RpcRequest::ListTools).await.unwrap();
        assert_eq!(value["tools"].as_array().unwrap().len(), TOOL_NAMES.len());
    }

    #[tokio::test]
    async fn pause_then_get_status_reports_paused() {
        let project = TempDir::new().unwrap();
        let daemon = test_daemon(project.path());
        dispatch(&daemon, RpcRequest::Pause).await.unwrap();
        let status = dispatch(&daemon, RpcRequest::GetStatus).await.unwrap();
        assert_eq!(status["paused"], true);
    }

    #[tokio::test]
    async fn compute_artifact_via_dispatch_runs_the_command() {
        let project = TempDir::new().unwrap();
        let daemon = test_daemon(project.path());
        dispatch(&daemon, RpcRequest::ComputeArtifact { output: "out.txt".to_string() }).await.unwrap();
        assert!(project.path().join("out.txt").exists());
    }

    #[tokio::test]
    async fn unknown_tool_name_is_rejected_without_touching_daemon_state() {
        let parsed: Result<RpcRequest, _> = serde_json::from_str(r#"{"tool":"deleteEverything"}"#);
        assert!(parsed.is_err());
    }

    #[tokio::test]
    async fn malformed_request_body_yields_bad_request_response() {
        let body = Bytes::from_static(b"not json");
        let req: Result<RpcRequest, _> = serde_json::from_slice(&body);
        assert!(req.is_err());
    }
}
