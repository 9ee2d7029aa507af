//! HTTP API server for the Cascade pipeline.
//!
//! A thin routing layer over [`cascade_core::Engine`]: parse the URL,
//! decode the JSON body, call the engine, map the error to a status
//! code. All state lives in the engine; handlers hold no locks of
//! their own, so requests are served concurrently-safe on a single
//! accept loop.
//!
//! The [`TestServer`] helper starts a server on a random port with
//! mock adapters for integration testing.

use cascade_adapters::AdapterSet;
use cascade_core::{CoreError, Engine, EngineOptions, PromoteRequest};
use cascade_schema::{Components, EnvId, JobId, ProfileId, SiteId};
use serde::Deserialize;
use std::io::Read;
use std::path::PathBuf;
use std::sync::Arc;
use tiny_http::{Header, Method, Response, Server, StatusCode};
use tracing::{debug, error};

/// Status code for an engine error.
///
/// Conflicts (locks, wrong state) map to 409 so clients can retry after
/// the holder finishes; policy rejections are the caller's fault (400);
/// a full queue asks the client to back off (429).
pub fn status_for(err: &CoreError) -> u16 {
    match err {
        CoreError::LockConflict { .. }
        | CoreError::NotHolder { .. }
        | CoreError::InvalidState(_)
        | CoreError::InvalidTransition { .. } => 409,
        CoreError::PolicyViolation(_) | CoreError::Schema(_) => 400,
        CoreError::NotFound(_) => 404,
        CoreError::QueueFull => 429,
        _ => 500,
    }
}

/// Parse `/pipeline/environments/{id}/{action}` into (id, action).
pub fn parse_env_route(path: &str) -> Option<(&str, &str)> {
    let rest = path.strip_prefix("/pipeline/environments/")?;
    let (id, action) = rest.split_once('/')?;
    if id.is_empty() || action.is_empty() || action.contains('/') {
        return None;
    }
    Some((id, action))
}

/// Parse `/pipeline/jobs/{id}` or `/pipeline/jobs/{id}/cancel`.
pub fn parse_job_route(path: &str) -> Option<(&str, bool)> {
    let rest = path.strip_prefix("/pipeline/jobs/")?;
    if let Some((id, action)) = rest.split_once('/') {
        (!id.is_empty() && action == "cancel").then_some((id, true))
    } else {
        (!rest.is_empty()).then_some((rest, false))
    }
}

/// Split a URL into path and decoded-enough query pairs. Values are
/// taken verbatim; ids and page numbers never need percent escapes.
fn split_query(url: &str) -> (&str, Vec<(&str, &str)>) {
    match url.split_once('?') {
        Some((path, query)) => {
            let pairs = query
                .split('&')
                .filter_map(|kv| kv.split_once('='))
                .collect();
            (path, pairs)
        }
        None => (url, Vec::new()),
    }
}

fn query_param<'a>(pairs: &[(&'a str, &'a str)], key: &str) -> Option<&'a str> {
    pairs.iter().find(|(k, _)| *k == key).map(|(_, v)| *v)
}

fn respond_json(req: tiny_http::Request, json: impl Into<Vec<u8>>) {
    let header = Header::from_bytes("Content-Type", "application/json").expect("valid header");
    let _ = req.respond(Response::from_data(json.into()).with_header(header));
}

fn respond_value(req: tiny_http::Request, value: &impl serde::Serialize) {
    match serde_json::to_vec(value) {
        Ok(body) => respond_json(req, body),
        Err(e) => {
            error!("response serialization failed: {e}");
            respond_plain_err(req, 500, "serialization error");
        }
    }
}

fn respond_core_err(req: tiny_http::Request, err: &CoreError) {
    let code = status_for(err);
    let body = serde_json::json!({ "error": err.to_string() });
    let header = Header::from_bytes("Content-Type", "application/json").expect("valid header");
    let _ = req.respond(
        Response::from_data(body.to_string().into_bytes())
            .with_header(header)
            .with_status_code(StatusCode(code)),
    );
}

fn respond_plain_err(req: tiny_http::Request, code: u16, msg: &str) {
    let body = serde_json::json!({ "error": msg });
    let _ = req.respond(
        Response::from_string(body.to_string()).with_status_code(StatusCode(code)),
    );
}

fn respond_result(req: tiny_http::Request, result: Result<serde_json::Value, CoreError>) {
    respond_result_as(req, 200, result);
}

/// Like [`respond_result`], but with 202 Accepted on success: the work
/// was queued or handed to an adapter, not completed in-request.
fn respond_accepted(req: tiny_http::Request, result: Result<serde_json::Value, CoreError>) {
    respond_result_as(req, 202, result);
}

fn respond_result_as(
    req: tiny_http::Request,
    code: u16,
    result: Result<serde_json::Value, CoreError>,
) {
    match result {
        Ok(value) => {
            let header =
                Header::from_bytes("Content-Type", "application/json").expect("valid header");
            let _ = req.respond(
                Response::from_data(value.to_string().into_bytes())
                    .with_header(header)
                    .with_status_code(StatusCode(code)),
            );
        }
        Err(e) => respond_core_err(req, &e),
    }
}

fn read_body(req: &mut tiny_http::Request) -> Option<Vec<u8>> {
    let mut body = Vec::new();
    req.as_reader().read_to_end(&mut body).ok()?;
    Some(body)
}

fn parse_body<T: for<'de> Deserialize<'de>>(req: &mut tiny_http::Request) -> Result<T, String> {
    let body = read_body(req).ok_or_else(|| "body read error".to_owned())?;
    serde_json::from_slice(&body).map_err(|e| format!("invalid request body: {e}"))
}

/// Optional caller identity, recorded on the activity trail.
fn user_of(req: &tiny_http::Request) -> Option<String> {
    req.headers()
        .iter()
        .find(|h| h.field.as_str().as_str().eq_ignore_ascii_case("x-user"))
        .map(|h| h.value.as_str().to_owned())
}

// --- Request bodies ---

#[derive(Deserialize)]
struct SiteBody {
    name: String,
}

#[derive(Deserialize)]
struct EnvBody {
    site_id: String,
    stage: String,
    #[serde(default)]
    production_source: bool,
}

#[derive(Deserialize)]
struct LockBody {
    reason: String,
}

#[derive(Deserialize)]
struct PromoteBody {
    source_env: String,
    dest_env: String,
    components: Vec<String>,
    #[serde(default)]
    sanitization_profile: Option<String>,
    #[serde(default)]
    restore_stopped: bool,
}

#[derive(Deserialize)]
struct SyncBody {
    site_id: String,
    dest_env: String,
    components: Vec<String>,
    #[serde(default)]
    sanitization_profile: Option<String>,
}

// --- Handlers ---

fn handle_env_action(engine: &Engine, mut req: tiny_http::Request, id: &str, action: &str) {
    let env_id = EnvId::new(id);
    let user = user_of(&req);
    let user = user.as_deref();

    let result = match action {
        "start" => engine.start_env(&env_id, user),
        "stop" => engine.stop_env(&env_id, user),
        "restart" => engine.restart_env(&env_id, user),
        "destroy" => engine.destroy_env(&env_id, user),
        "unlock" => engine.unlock_env(&env_id, user),
        "lock" => match parse_body::<LockBody>(&mut req) {
            Ok(body) => engine.lock_env(&env_id, &body.reason, user),
            Err(msg) => {
                respond_plain_err(req, 400, &msg);
                return;
            }
        },
        _ => {
            respond_plain_err(req, 404, "unknown action");
            return;
        }
    };
    let body = result.map(|()| serde_json::json!({ "env": env_id.as_str(), "action": action }));
    // Lifecycle actions drive the runtime adapter; locking is settled
    // in-request.
    if matches!(action, "start" | "stop" | "restart" | "destroy") {
        respond_accepted(req, body);
    } else {
        respond_result(req, body);
    }
}

fn handle_promote(engine: &Engine, mut req: tiny_http::Request) {
    let body: PromoteBody = match parse_body(&mut req) {
        Ok(b) => b,
        Err(msg) => {
            respond_plain_err(req, 400, &msg);
            return;
        }
    };
    let components = match Components::from_list(&body.components) {
        Ok(c) => c,
        Err(e) => {
            respond_plain_err(req, 400, &e.to_string());
            return;
        }
    };
    let request = PromoteRequest {
        source_env: EnvId::new(body.source_env),
        dest_env: EnvId::new(body.dest_env),
        components,
        sanitization_profile: body.sanitization_profile.map(ProfileId::new),
        restore_stopped: body.restore_stopped,
        user_id: user_of(&req),
    };
    respond_accepted(
        req,
        engine
            .promote(&request)
            .map(|job_id| serde_json::json!({ "job_id": job_id.as_str() })),
    );
}

fn handle_sync(engine: &Engine, mut req: tiny_http::Request) {
    let body: SyncBody = match parse_body(&mut req) {
        Ok(b) => b,
        Err(msg) => {
            respond_plain_err(req, 400, &msg);
            return;
        }
    };
    let components = match Components::from_list(&body.components) {
        Ok(c) => c,
        Err(e) => {
            respond_plain_err(req, 400, &e.to_string());
            return;
        }
    };
    let user = user_of(&req);
    respond_accepted(
        req,
        engine
            .sync_from_production(
                &SiteId::new(body.site_id),
                &EnvId::new(body.dest_env),
                components,
                body.sanitization_profile.map(ProfileId::new),
                user,
            )
            .map(|job_id| serde_json::json!({ "job_id": job_id.as_str() })),
    );
}

fn handle_activities(engine: &Engine, req: tiny_http::Request, pairs: &[(&str, &str)]) {
    let Some(site) = query_param(pairs, "site_id") else {
        respond_plain_err(req, 400, "missing 'site_id' query parameter");
        return;
    };
    let page = query_param(pairs, "page")
        .and_then(|p| p.parse().ok())
        .unwrap_or(1);
    let per_page = query_param(pairs, "per_page")
        .and_then(|p| p.parse().ok())
        .unwrap_or(50);
    match engine.activities(&SiteId::new(site), page, per_page) {
        Ok(activity_page) => respond_value(req, &activity_page),
        Err(e) => respond_core_err(req, &e),
    }
}

fn handle_compare(engine: &Engine, req: tiny_http::Request, pairs: &[(&str, &str)]) {
    let (Some(a), Some(b)) = (
        query_param(pairs, "env_a"),
        query_param(pairs, "env_b"),
    ) else {
        respond_plain_err(req, 400, "compare requires 'env_a' and 'env_b' query parameters");
        return;
    };
    match engine.compare(&EnvId::new(a), &EnvId::new(b)) {
        Ok(comparison) => respond_value(req, &comparison),
        Err(e) => respond_core_err(req, &e),
    }
}

/// Handle a single HTTP request, dispatching to the appropriate route.
pub fn handle_request(engine: &Engine, mut req: tiny_http::Request) {
    let method = req.method().clone();
    let url = req.url().to_owned();
    debug!("{method} {url}");
    let (path, query) = split_query(&url);

    match (&method, path) {
        (Method::Get, "/health") => {
            let _ = req.respond(Response::from_string(r#"{"status":"ok"}"#));
        }
        (Method::Get, "/pipeline/projects") => match engine.list_projects() {
            Ok(projects) => respond_value(req, &projects),
            Err(e) => respond_core_err(req, &e),
        },
        (Method::Get, "/pipeline/locks") => respond_value(req, &engine.locks()),
        (Method::Get, "/pipeline/activities") => handle_activities(engine, req, &query),
        (Method::Get, "/pipeline/compare") => handle_compare(engine, req, &query),
        (Method::Post, "/pipeline/sites") => match parse_body::<SiteBody>(&mut req) {
            Ok(body) => respond_result(
                req,
                engine
                    .register_site(&body.name)
                    .map(|site| serde_json::json!({ "site_id": site.id.as_str() })),
            ),
            Err(msg) => respond_plain_err(req, 400, &msg),
        },
        (Method::Post, "/pipeline/environments") => match parse_body::<EnvBody>(&mut req) {
            Ok(body) => respond_result(
                req,
                engine
                    .register_env(
                        &SiteId::new(body.site_id),
                        &body.stage,
                        body.production_source,
                    )
                    .map(|env| serde_json::json!({ "env_id": env.id.as_str() })),
            ),
            Err(msg) => respond_plain_err(req, 400, &msg),
        },
        (Method::Post, "/pipeline/promote") => handle_promote(engine, req),
        (Method::Post, "/pipeline/sync-from-production") => handle_sync(engine, req),
        (Method::Post, "/pipeline/profiles") => {
            let Some(body) = read_body(&mut req) else {
                respond_plain_err(req, 400, "body read error");
                return;
            };
            let src = String::from_utf8_lossy(&body);
            respond_result(
                req,
                engine
                    .create_profile(&src)
                    .map(|p| serde_json::json!({ "profile_id": p.id.as_str() })),
            );
        }
        _ => {
            if let Some((id, action)) = parse_env_route(path) {
                match (&method, action) {
                    (Method::Get, "logs") => {
                        let result = engine.env_logs(&EnvId::new(id));
                        match result {
                            Ok(logs) => {
                                let _ = req.respond(Response::from_string(logs));
                            }
                            Err(e) => respond_core_err(req, &e),
                        }
                    }
                    (Method::Post, _) => handle_env_action(engine, req, id, action),
                    _ => respond_plain_err(req, 405, "method not allowed"),
                }
            } else if let Some((id, cancel)) = parse_job_route(path) {
                let job_id = JobId::new(id);
                match (&method, cancel) {
                    (Method::Get, false) => match engine.job(&job_id) {
                        Ok(job) => respond_value(req, &job),
                        Err(e) => respond_core_err(req, &e),
                    },
                    (Method::Post, true) => respond_result(
                        req,
                        engine
                            .cancel_job(&job_id)
                            .map(|()| serde_json::json!({ "job_id": job_id.as_str() })),
                    ),
                    _ => respond_plain_err(req, 405, "method not allowed"),
                }
            } else {
                respond_plain_err(req, 404, "not found");
            }
        }
    }
}

/// Start the server loop, blocking the current thread until the server
/// is unblocked (see [`Server::unblock`]).
pub fn run_server(engine: &Engine, server: &Server) {
    for request in server.incoming_requests() {
        handle_request(engine, request);
    }
}

/// A test helper that starts a cascade-server on a random port in a
/// background thread, backed by mock adapters on a fresh store.
///
/// Drop the `TestServer` to stop the accept loop.
pub struct TestServer {
    pub url: String,
    pub port: u16,
    pub data_dir: PathBuf,
    /// Handle to the shared mock state for seeding and inspection.
    pub mock: cascade_adapters::MockAdapters,
    server: Arc<Server>,
    _handle: std::thread::JoinHandle<()>,
}

impl TestServer {
    /// Start a test server on `127.0.0.1:0` (random port).
    pub fn start(data_dir: PathBuf) -> Self {
        let mock = cascade_adapters::MockAdapters::new();
        Self::start_with(data_dir, mock.to_set(), mock)
    }

    fn start_with(data_dir: PathBuf, adapters: AdapterSet, mock: cascade_adapters::MockAdapters) -> Self {
        std::fs::create_dir_all(&data_dir).expect("failed to create test data dir");
        let engine = Engine::open(&data_dir, adapters, EngineOptions::default())
            .expect("failed to open test engine");

        let server =
            Arc::new(Server::http("127.0.0.1:0").expect("failed to bind test HTTP server"));
        let port = server.server_addr().to_ip().expect("not an IP addr").port();
        let url = format!("http://127.0.0.1:{port}");

        let srv = Arc::clone(&server);
        let handle = std::thread::spawn(move || {
            for request in srv.incoming_requests() {
                handle_request(&engine, request);
            }
        });

        Self {
            url,
            port,
            data_dir,
            mock,
            server,
            _handle: handle,
        }
    }
}

impl Drop for TestServer {
    fn drop(&mut self) {
        self.server.unblock();
    }
}
