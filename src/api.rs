use std::io::Read;
use std::net::{IpAddr, Ipv6Addr, SocketAddr};
use std::str::FromStr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, Sender};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use anyhow::Result;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use tiny_http::{Header, Method, Response, Server, StatusCode};
use tracing::{debug, info, warn};

use crate::engine::{CommandReply, EngineCommand, EngineSnapshot};
use crate::service::CommandEnvelope;
use crate::task::TaskError;
use crate::task::model::{TaskDraft, TaskId, parse_deadline};

const COMMAND_REPLY_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, Clone, Default)]
pub struct ApiSharedState {
    pub snapshot: EngineSnapshot,
    pub total_requests: u64,
    pub server_started_unix_ms: i64,
}

#[derive(Debug, Clone)]
pub struct ApiServerConfig {
    pub bind_addr: String,
    pub port: u16,
}

pub struct ApiServer {
    pub state: Arc<Mutex<ApiSharedState>>,
    port: u16,
    stop: Arc<AtomicBool>,
    http_join: Option<JoinHandle<()>>,
}

impl ApiServer {
    pub fn start(config: ApiServerConfig, commands: Sender<CommandEnvelope>) -> Result<Self> {
        let bind = format!("{}:{}", config.bind_addr, config.port);
        let server = Server::http(&bind)
            .map_err(|err| anyhow::anyhow!("failed to start API server on {bind}: {err}"))?;
        let port = server
            .server_addr()
            .to_ip()
            .map(|addr| addr.port())
            .unwrap_or(config.port);
        info!(bind = %config.bind_addr, port, "local API listening");

        let state = Arc::new(Mutex::new(ApiSharedState {
            server_started_unix_ms: Utc::now().timestamp_millis(),
            ..ApiSharedState::default()
        }));
        let stop = Arc::new(AtomicBool::new(false));
        let state_for_thread = Arc::clone(&state);
        let stop_for_thread = Arc::clone(&stop);
        let http_join = thread::spawn(move || {
            run_server_loop(server, state_for_thread, commands, stop_for_thread)
        });

        Ok(Self {
            state,
            port,
            stop,
            http_join: Some(http_join),
        })
    }

    pub fn port(&self) -> u16 {
        self.port
    }
}

impl Drop for ApiServer {
    fn drop(&mut self) {
        self.stop.store(true, Ordering::Relaxed);
        if let Some(join) = self.http_join.take() {
            let _ = join.join();
        }
    }
}

fn run_server_loop(
    server: Server,
    state: Arc<Mutex<ApiSharedState>>,
    commands: Sender<CommandEnvelope>,
    stop: Arc<AtomicBool>,
) {
    while !stop.load(Ordering::Relaxed) {
        match server.recv_timeout(Duration::from_millis(200)) {
            Ok(Some(request)) => handle_request(request, &state, &commands),
            Ok(None) => continue,
            Err(_) => continue,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Route {
    Index,
    Health,
    State,
    Tasks,
    Missed,
    CreateTask,
    UpdateTask(TaskId),
    BeginEdit(TaskId),
    Acknowledge(TaskId),
    DeleteTask(TaskId),
    ActivateNotification(TaskId),
    ClearMissed,
    BadTaskId,
    MethodNotAllowed,
    NotFound,
}

fn resolve_route(method: &Method, path: &str) -> Route {
    let segments = path
        .split('/')
        .filter(|segment| !segment.is_empty())
        .collect::<Vec<_>>();

    let route = match (method, segments.as_slice()) {
        (Method::Get, []) | (Method::Get, ["v1", "state"]) => Some(Route::State),
        (Method::Get, ["v1"]) => Some(Route::Index),
        (Method::Get, ["healthz"]) => Some(Route::Health),
        (Method::Get, ["v1", "tasks"]) => Some(Route::Tasks),
        (Method::Post, ["v1", "tasks"]) => Some(Route::CreateTask),
        (Method::Get, ["v1", "missed"]) => Some(Route::Missed),
        (Method::Delete, ["v1", "missed"]) => Some(Route::ClearMissed),
        (Method::Put, ["v1", "tasks", id]) => with_id(id, Route::UpdateTask),
        (Method::Delete, ["v1", "tasks", id]) => with_id(id, Route::DeleteTask),
        (Method::Post, ["v1", "tasks", id, "edit"]) => with_id(id, Route::BeginEdit),
        (Method::Post, ["v1", "tasks", id, "ack"]) => with_id(id, Route::Acknowledge),
        (Method::Post, ["v1", "notifications", id, "activate"]) => {
            with_id(id, Route::ActivateNotification)
        }
        _ => None,
    };
    if let Some(route) = route {
        return route;
    }

    let known_path = matches!(
        segments.as_slice(),
        [] | ["v1"]
            | ["healthz"]
            | ["v1", "state"]
            | ["v1", "tasks"]
            | ["v1", "missed"]
            | ["v1", "tasks", _]
            | ["v1", "tasks", _, "edit" | "ack"]
            | ["v1", "notifications", _, "activate"]
    );
    if known_path {
        Route::MethodNotAllowed
    } else {
        Route::NotFound
    }
}

fn with_id(raw: &str, route: fn(TaskId) -> Route) -> Option<Route> {
    Some(match raw.parse::<TaskId>() {
        Ok(id) => route(id),
        Err(_) => Route::BadTaskId,
    })
}

/// JSON body accepted by create and update. `deadline` takes the same forms
/// as the CLI `--deadline` flag.
#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
struct TaskBody {
    title: String,
    content: String,
    deadline: Option<String>,
    alarm_enabled: bool,
}

impl TaskBody {
    fn into_draft(self) -> Result<TaskDraft, TaskError> {
        let deadline = match self.deadline.as_deref().map(str::trim) {
            None | Some("") => None,
            Some(raw) => Some(
                parse_deadline(raw).map_err(|_| TaskError::InvalidDeadline(raw.to_string()))?,
            ),
        };
        Ok(TaskDraft {
            title: self.title,
            content: self.content,
            deadline,
            alarm_enabled: self.alarm_enabled,
        })
    }
}

fn handle_request(
    mut request: tiny_http::Request,
    state: &Arc<Mutex<ApiSharedState>>,
    commands: &Sender<CommandEnvelope>,
) {
    if let Err((status, message)) = admit(request.remote_addr()) {
        let _ = send_text(request, status, message);
        return;
    }

    let url = request.url().to_string();
    let (path, _query) = split_path_query(&url);
    let route = resolve_route(request.method(), path);

    let snapshot = {
        let mut guard = match state.lock() {
            Ok(guard) => guard,
            Err(_) => {
                let _ = send_text(request, StatusCode(500), "internal state lock error");
                return;
            }
        };
        guard.total_requests += 1;
        match route {
            Route::State | Route::Tasks | Route::Missed => Some(guard.clone()),
            _ => None,
        }
    };

    let command = match route {
        Route::Index => {
            #[derive(Serialize)]
            struct ApiIndexResponse {
                api_base: String,
                state_url: String,
                tasks_url: String,
                missed_url: String,
                health_url: String,
            }

            let base_url = request_base_url(&request);
            let payload = ApiIndexResponse {
                state_url: format!("{base_url}/v1/state"),
                tasks_url: format!("{base_url}/v1/tasks"),
                missed_url: format!("{base_url}/v1/missed"),
                health_url: format!("{base_url}/healthz"),
                api_base: base_url,
            };
            let _ = send_json(request, StatusCode(200), &payload);
            return;
        }
        Route::Health => {
            let _ = send_text(request, StatusCode(200), "ok");
            return;
        }
        Route::State | Route::Tasks | Route::Missed => {
            let Some(shared) = snapshot else {
                let _ = send_text(request, StatusCode(500), "internal state lock error");
                return;
            };
            let _ = match route {
                Route::Tasks => send_json(request, StatusCode(200), &shared.snapshot.tasks),
                Route::Missed => send_json(request, StatusCode(200), &shared.snapshot.missed),
                _ => {
                    #[derive(Serialize)]
                    #[serde(rename_all = "camelCase")]
                    struct StateResponse<'a> {
                        #[serde(flatten)]
                        snapshot: &'a EngineSnapshot,
                        total_requests: u64,
                        server_started_unix_ms: i64,
                    }

                    let payload = StateResponse {
                        snapshot: &shared.snapshot,
                        total_requests: shared.total_requests,
                        server_started_unix_ms: shared.server_started_unix_ms,
                    };
                    send_json(request, StatusCode(200), &payload)
                }
            };
            return;
        }
        Route::CreateTask | Route::UpdateTask(_) => {
            let draft = match read_task_body(&mut request) {
                Ok(draft) => draft,
                Err(message) => {
                    let _ = send_json(request, StatusCode(400), &error_reply(message));
                    return;
                }
            };
            match route {
                Route::UpdateTask(id) => EngineCommand::Update(id, draft),
                _ => EngineCommand::Create(draft),
            }
        }
        Route::BeginEdit(id) => EngineCommand::BeginEdit(id),
        Route::Acknowledge(id) => EngineCommand::Acknowledge(id),
        Route::DeleteTask(id) => EngineCommand::Delete(id),
        Route::ActivateNotification(id) => EngineCommand::ActivateNotification(id),
        Route::ClearMissed => EngineCommand::ClearMissed,
        Route::BadTaskId => {
            let _ = send_text(request, StatusCode(400), "invalid task id");
            return;
        }
        Route::MethodNotAllowed => {
            let _ = send_text(request, StatusCode(405), "method not allowed");
            return;
        }
        Route::NotFound => {
            let _ = send_text(request, StatusCode(404), "not found");
            return;
        }
    };

    match forward_command(commands, command) {
        Ok(reply) => {
            let status = if reply.error.is_some() {
                StatusCode(400)
            } else {
                StatusCode(200)
            };
            let _ = send_json(request, status, &reply);
        }
        Err(message) => {
            warn!(error = %message, "engine did not answer API command");
            let _ = send_text(request, StatusCode(503), &message);
        }
    }
}

fn read_task_body(request: &mut tiny_http::Request) -> Result<TaskDraft, String> {
    let mut body = String::new();
    request
        .as_reader()
        .read_to_string(&mut body)
        .map_err(|err| format!("unable to read request body: {err}"))?;
    let parsed = serde_json::from_str::<TaskBody>(&body).map_err(|err| {
        format!(
            "invalid JSON at line {}, column {}: {err}",
            err.line(),
            err.column()
        )
    })?;
    parsed.into_draft().map_err(|err| err.to_string())
}

fn error_reply(message: String) -> CommandReply {
    CommandReply {
        error: Some(message),
        ..CommandReply::default()
    }
}

fn forward_command(
    commands: &Sender<CommandEnvelope>,
    command: EngineCommand,
) -> Result<CommandReply, String> {
    let (reply_tx, reply_rx) = mpsc::channel();
    commands
        .send(CommandEnvelope {
            command,
            reply: reply_tx,
        })
        .map_err(|_| "reminder engine is not running".to_string())?;
    reply_rx
        .recv_timeout(COMMAND_REPLY_TIMEOUT)
        .map_err(|_| "reminder engine did not reply in time".to_string())
}

fn send_json<T: Serialize>(
    request: tiny_http::Request,
    status: StatusCode,
    body: &T,
) -> Result<()> {
    let payload = serde_json::to_vec(body)?;
    let content_type = Header::from_str("Content-Type: application/json; charset=utf-8")
        .map_err(|_| anyhow::anyhow!("failed to build content-type header"))?;
    request.respond(
        Response::from_data(payload)
            .with_status_code(status)
            .with_header(content_type),
    )?;
    Ok(())
}

fn send_text(request: tiny_http::Request, status: StatusCode, body: &str) -> Result<()> {
    let content_type = Header::from_str("Content-Type: text/plain; charset=utf-8")
        .map_err(|_| anyhow::anyhow!("failed to build content-type header"))?;
    request.respond(
        Response::from_string(body.to_string())
            .with_status_code(status)
            .with_header(content_type),
    )?;
    Ok(())
}

fn split_path_query(url: &str) -> (&str, &str) {
    match url.split_once('?') {
        Some((path, query)) => (path, query),
        None => (url, ""),
    }
}

fn request_base_url(request: &tiny_http::Request) -> String {
    for header in request.headers() {
        if header.field.equiv("Host") {
            let host = header.value.as_str().trim();
            if !host.is_empty() {
                return format!("http://{host}");
            }
        }
    }
    "http://127.0.0.1:8098".to_string()
}

/// Only clients on the local network reach the routes.
fn admit(remote: Option<&SocketAddr>) -> Result<(), (StatusCode, &'static str)> {
    let Some(remote) = remote else {
        return Err((StatusCode(400), "missing remote address"));
    };
    if !is_local_network_ip(remote.ip()) {
        debug!(remote = %remote.ip(), "rejected non-local client");
        return Err((StatusCode(403), "forbidden: local network only"));
    }
    Ok(())
}

fn is_local_network_ip(ip: IpAddr) -> bool {
    match ip {
        IpAddr::V4(v4) => v4.is_loopback() || v4.is_private() || v4.is_link_local(),
        IpAddr::V6(v6) => {
            v6.is_loopback()
                || v6.is_unique_local()
                || v6.is_unicast_link_local()
                || is_ipv4_mapped_local(v6)
        }
    }
}

fn is_ipv4_mapped_local(v6: Ipv6Addr) -> bool {
    match v6.to_ipv4_mapped() {
        Some(v4) => v4.is_loopback() || v4.is_private() || v4.is_link_local(),
        None => false,
    }
}

#[cfg(test)]
mod tests {
    use std::io::Write;
    use std::net::{Ipv4Addr, TcpStream};

    use super::*;

    fn http_exchange(port: u16, raw_request: &str) -> String {
        let mut stream = TcpStream::connect(("127.0.0.1", port)).expect("connect");
        stream
            .set_read_timeout(Some(Duration::from_secs(5)))
            .expect("timeout");
        stream.write_all(raw_request.as_bytes()).expect("write");
        let mut response = String::new();
        let _ = stream.read_to_string(&mut response);
        response
    }

    fn start_server() -> (ApiServer, mpsc::Receiver<CommandEnvelope>) {
        let (tx, rx) = mpsc::channel();
        let server = ApiServer::start(
            ApiServerConfig {
                bind_addr: "127.0.0.1".to_string(),
                port: 0,
            },
            tx,
        )
        .expect("start");
        (server, rx)
    }

    #[test]
    fn non_local_clients_are_turned_away() {
        let public: SocketAddr = "8.8.8.8:40000".parse().expect("addr");
        let (status, message) = admit(Some(&public)).expect_err("public client");
        assert_eq!(status.0, 403);
        assert!(message.contains("local network only"));

        let (status, _) = admit(None).expect_err("no address");
        assert_eq!(status.0, 400);

        let lan: SocketAddr = "192.168.1.44:40000".parse().expect("addr");
        assert!(admit(Some(&lan)).is_ok());
        let loopback: SocketAddr = "[::1]:40000".parse().expect("addr");
        assert!(admit(Some(&loopback)).is_ok());
    }

    #[test]
    fn local_network_ip_filter_accepts_private_and_loopback() {
        assert!(is_local_network_ip(IpAddr::V4(Ipv4Addr::new(127, 0, 0, 1))));
        assert!(is_local_network_ip(IpAddr::V4(Ipv4Addr::new(
            192, 168, 1, 44
        ))));
        assert!(is_local_network_ip(IpAddr::V6(Ipv6Addr::LOCALHOST)));
        assert!(is_local_network_ip(IpAddr::V6(
            Ipv4Addr::new(10, 0, 0, 2).to_ipv6_mapped()
        )));
        assert!(!is_local_network_ip(IpAddr::V4(Ipv4Addr::new(8, 8, 8, 8))));
        assert!(!is_local_network_ip(IpAddr::V6(Ipv6Addr::new(
            0x2001, 0x4860, 0, 0, 0, 0, 0, 0x8888
        ))));
    }

    #[test]
    fn routes_resolve_by_method_and_path() {
        assert_eq!(resolve_route(&Method::Get, "/"), Route::State);
        assert_eq!(resolve_route(&Method::Get, "/v1/state"), Route::State);
        assert_eq!(resolve_route(&Method::Post, "/v1/tasks"), Route::CreateTask);
        assert_eq!(
            resolve_route(&Method::Put, "/v1/tasks/17"),
            Route::UpdateTask(TaskId(17))
        );
        assert_eq!(
            resolve_route(&Method::Post, "/v1/tasks/17/ack"),
            Route::Acknowledge(TaskId(17))
        );
        assert_eq!(
            resolve_route(&Method::Post, "/v1/notifications/17/activate"),
            Route::ActivateNotification(TaskId(17))
        );
        assert_eq!(resolve_route(&Method::Delete, "/v1/missed"), Route::ClearMissed);
        assert_eq!(resolve_route(&Method::Put, "/v1/tasks/abc"), Route::BadTaskId);
        assert_eq!(resolve_route(&Method::Post, "/healthz"), Route::MethodNotAllowed);
        assert_eq!(resolve_route(&Method::Get, "/v1/tasks/17/ack"), Route::MethodNotAllowed);
        assert_eq!(resolve_route(&Method::Get, "/v2"), Route::NotFound);
    }

    #[test]
    fn task_body_parses_deadline_and_defaults() {
        let body: TaskBody =
            serde_json::from_str(r#"{"title":"Essay","deadline":"2026-03-02T09:00:00Z","alarmEnabled":true}"#)
                .expect("body");
        let draft = body.into_draft().expect("draft");
        assert_eq!(draft.title, "Essay");
        assert!(draft.alarm_enabled);
        assert!(draft.deadline.is_some());

        let body: TaskBody = serde_json::from_str(r#"{"title":"Later","deadline":""}"#).expect("body");
        assert_eq!(body.into_draft().expect("draft").deadline, None);
    }

    #[test]
    fn task_body_rejects_bad_deadline() {
        let body: TaskBody =
            serde_json::from_str(r#"{"title":"Essay","deadline":"tomorrow"}"#).expect("body");
        assert_eq!(
            body.into_draft(),
            Err(TaskError::InvalidDeadline("tomorrow".to_string()))
        );
    }

    #[test]
    fn health_endpoint_answers_over_http() {
        let (server, _rx) = start_server();
        let response = http_exchange(
            server.port(),
            "GET /healthz HTTP/1.1\r\nHost: localhost\r\nConnection: close\r\n\r\n",
        );
        assert!(response.starts_with("HTTP/1.1 200"));
        assert!(response.ends_with("ok"));
    }

    #[test]
    fn create_is_forwarded_to_engine() {
        let (server, rx) = start_server();
        let engine = thread::spawn(move || {
            let envelope = rx.recv().expect("command");
            let command = envelope.command.clone();
            envelope
                .reply
                .send(CommandReply {
                    changed: true,
                    task_id: Some(TaskId(1)),
                    error: None,
                })
                .expect("reply");
            command
        });

        let body = r#"{"title":"Essay","alarmEnabled":true}"#;
        let response = http_exchange(
            server.port(),
            &format!(
                "POST /v1/tasks HTTP/1.1\r\nHost: localhost\r\nContent-Type: application/json\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{body}",
                body.len()
            ),
        );
        let command = engine.join().expect("engine thread");
        assert_eq!(
            command,
            EngineCommand::Create(TaskDraft::new("Essay").with_alarm(true))
        );
        assert!(response.starts_with("HTTP/1.1 200"));
        assert!(response.contains(r#""changed":true"#));
    }

    #[test]
    fn malformed_body_is_rejected_before_engine() {
        let (server, rx) = start_server();
        let body = "{ nope";
        let response = http_exchange(
            server.port(),
            &format!(
                "POST /v1/tasks HTTP/1.1\r\nHost: localhost\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{body}",
                body.len()
            ),
        );
        assert!(response.starts_with("HTTP/1.1 400"));
        assert!(response.contains("invalid JSON"));
        assert!(rx.try_recv().is_err());
    }
}
