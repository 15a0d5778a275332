//! Management API
//!
//! JSON over HTTP under `/api/v1/notebooks`. Every error body is `{"error": "..."}`.
//!
//! | Method | Path | Result |
//! |--------|------|--------|
//! | GET | `/api/v1/notebooks` | `{"notebooks": [...]}` |
//! | POST | `/api/v1/notebooks` | 201 `{"notebook": {...}}` |
//! | GET | `/api/v1/notebooks/{id}` | `{"notebook": {...}}` |
//! | PUT | `/api/v1/notebooks/{id}` | `{"notebook": {...}}` |
//! | DELETE | `/api/v1/notebooks/{id}` | 204 |
//! | GET | `/api/v1/notebooks/{id}/status` | `{"status": "Running"}` |
//! | POST | `/api/v1/notebooks/{id}/reload` | 204 |
//! | GET | `/health`, `/version` | service info |

use crate::error::HubError;
use crate::notebook::{Notebook, NotebookRequest, Status};
use crate::registry::Registry;
use crate::runner::Runner;
use anyhow::Result;
use http_body_util::{BodyExt, Full};
use hyper::body::{Body, Bytes};
use hyper::service::service_fn;
use hyper::{Method, Request, Response, StatusCode};
use hyper_util::rt::{TokioExecutor, TokioIo};
use hyper_util::server::conn::auto::Builder as AutoBuilder;
use serde::Serialize;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpListener;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

const NOTEBOOKS_PATH: &str = "/api/v1/notebooks";

#[derive(Debug, Serialize)]
pub struct NotebookResponse {
    pub notebook: Notebook,
}

#[derive(Debug, Serialize)]
pub struct NotebooksResponse {
    pub notebooks: Vec<Notebook>,
}

#[derive(Debug, Serialize)]
pub struct StatusResponse {
    pub status: Status,
}

#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub error: String,
}

fn json_response(status: StatusCode, body: impl Into<Bytes>) -> Response<Full<Bytes>> {
    Response::builder()
        .status(status)
        .header("content-type", "application/json")
        .body(Full::new(body.into()))
        .expect("valid response with StatusCode enum and static header")
}

fn json_body<T: Serialize>(status: StatusCode, value: &T) -> Result<Response<Full<Bytes>>> {
    Ok(json_response(status, serde_json::to_string(value)?))
}

fn json_error(status: StatusCode, msg: impl Into<String>) -> Response<Full<Bytes>> {
    let body = ErrorResponse { error: msg.into() };
    let json = serde_json::to_string(&body).unwrap_or_else(|_| r#"{"error":"internal error"}"#.to_string());
    json_response(status, json)
}

fn hub_error(err: HubError) -> Response<Full<Bytes>> {
    json_error(err.status_code(), err.to_string())
}

fn no_content() -> Response<Full<Bytes>> {
    Response::builder()
        .status(StatusCode::NO_CONTENT)
        .body(Full::new(Bytes::new()))
        .expect("valid response with StatusCode enum")
}

#[derive(Debug, PartialEq, Eq)]
enum Route<'a> {
    Health,
    Version,
    List,
    Create,
    Get(&'a str),
    Update(&'a str),
    Delete(&'a str),
    Status(&'a str),
    Reload(&'a str),
    MethodNotAllowed,
    NotFound,
}

fn route<'a>(method: &Method, path: &'a str) -> Route<'a> {
    let path = if path.len() > 1 { path.trim_end_matches('/') } else { path };

    match path {
        "/health" if method == Method::GET => return Route::Health,
        "/version" if method == Method::GET => return Route::Version,
        "/health" | "/version" => return Route::MethodNotAllowed,
        NOTEBOOKS_PATH => {
            return match *method {
                Method::GET => Route::List,
                Method::POST => Route::Create,
                _ => Route::MethodNotAllowed,
            }
        }
        _ => {}
    }

    let Some(rest) = path
        .strip_prefix(NOTEBOOKS_PATH)
        .and_then(|p| p.strip_prefix('/'))
    else {
        return Route::NotFound;
    };

    let segments: Vec<&str> = rest.split('/').collect();
    match (method, segments.as_slice()) {
        (&Method::GET, &[id]) => Route::Get(id),
        (&Method::PUT, &[id]) => Route::Update(id),
        (&Method::DELETE, &[id]) => Route::Delete(id),
        (_, &[_]) => Route::MethodNotAllowed,
        (&Method::GET, &[id, "status"]) => Route::Status(id),
        (&Method::POST, &[id, "reload"]) => Route::Reload(id),
        (_, &[_, "status" | "reload"]) => Route::MethodNotAllowed,
        _ => Route::NotFound,
    }
}

/// Management API server
pub struct ApiServer {
    bind_addr: SocketAddr,
    registry: Arc<Registry>,
    runner: Arc<Runner>,
    shutdown_rx: watch::Receiver<bool>,
}

impl ApiServer {
    pub fn new(
        bind_addr: SocketAddr,
        registry: Arc<Registry>,
        runner: Arc<Runner>,
        shutdown_rx: watch::Receiver<bool>,
    ) -> Self {
        Self {
            bind_addr,
            registry,
            runner,
            shutdown_rx,
        }
    }

    pub async fn run(self: Arc<Self>) -> Result<()> {
        let listener = TcpListener::bind(self.bind_addr).await?;
        info!(addr = %self.bind_addr, "Management API listening");

        let mut shutdown_rx = self.shutdown_rx.clone();

        loop {
            tokio::select! {
                result = listener.accept() => {
                    match result {
                        Ok((stream, addr)) => {
                            let api = Arc::clone(&self);
                            tokio::spawn(async move {
                                if let Err(e) = api.serve_connection(stream, addr).await {
                                    debug!(addr = %addr, error = %e, "Connection error");
                                }
                            });
                        }
                        Err(e) => {
                            error!(error = %e, "Failed to accept connection");
                        }
                    }
                }
                _ = shutdown_rx.changed() => {
                    if *shutdown_rx.borrow() {
                        info!("Management API shutting down");
                        break;
                    }
                }
            }
        }

        Ok(())
    }

    async fn serve_connection<S>(self: Arc<Self>, stream: S, addr: SocketAddr) -> Result<()>
    where
        S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        let io = TokioIo::new(stream);
        let service = service_fn(move |req: Request<hyper::body::Incoming>| {
            let api = Arc::clone(&self);
            async move { Ok::<_, hyper::Error>(api.handle(req, addr).await) }
        });

        AutoBuilder::new(TokioExecutor::new())
            .serve_connection(io, service)
            .await
            .map_err(|e| anyhow::anyhow!("Connection error: {}", e))?;

        Ok(())
    }

    /// Route and answer one request
    pub async fn handle<B>(&self, req: Request<B>, client: SocketAddr) -> Response<Full<Bytes>>
    where
        B: Body<Data = Bytes>,
        B::Error: std::error::Error + Send + Sync + 'static,
    {
        let method = req.method().clone();
        let path = req.uri().path().to_string();
        debug!(%method, %path, ip = %client.ip(), "API request");

        let response = match route(&method, &path) {
            Route::Health => Ok(json_response(StatusCode::OK, r#"{"status":"ok"}"#)),
            Route::Version => {
                let version = serde_json::json!({
                    "name": env!("CARGO_PKG_NAME"),
                    "version": env!("CARGO_PKG_VERSION"),
                });
                Ok(json_response(StatusCode::OK, version.to_string()))
            }
            Route::List => self.list_notebooks(),
            Route::Create => self.create_notebook(req).await,
            Route::Get(id) => self.get_notebook(id),
            Route::Update(id) => self.update_notebook(id, req).await,
            Route::Delete(id) => Ok(self.delete_notebook(id)),
            Route::Status(id) => self.notebook_status(id),
            Route::Reload(id) => Ok(self.reload_notebook(id).await),
            Route::MethodNotAllowed => Ok(json_error(StatusCode::METHOD_NOT_ALLOWED, "Method not allowed")),
            Route::NotFound => Ok(json_error(StatusCode::NOT_FOUND, "Not found")),
        };

        response.unwrap_or_else(|e| {
            error!(error = %e, "API error");
            json_error(StatusCode::INTERNAL_SERVER_ERROR, format!("Internal error: {}", e))
        })
    }

    fn list_notebooks(&self) -> Result<Response<Full<Bytes>>> {
        let notebooks = self.registry.list();
        json_body(StatusCode::OK, &NotebooksResponse { notebooks })
    }

    fn get_notebook(&self, id: &str) -> Result<Response<Full<Bytes>>> {
        match self.registry.get(id) {
            Some(notebook) => json_body(StatusCode::OK, &NotebookResponse { notebook }),
            None => Ok(json_error(StatusCode::NOT_FOUND, "Notebook not found")),
        }
    }

    async fn create_notebook<B>(&self, req: Request<B>) -> Result<Response<Full<Bytes>>>
    where
        B: Body<Data = Bytes>,
        B::Error: std::error::Error + Send + Sync + 'static,
    {
        let create_req = match read_request(req).await? {
            Ok(r) => r,
            Err(response) => return Ok(response),
        };

        if create_req.name().is_none() || create_req.path().is_none() || create_req.domain().is_none() {
            return Ok(json_error(StatusCode::BAD_REQUEST, "Missing required fields"));
        }

        match self.registry.add(create_req) {
            Ok(notebook) => json_body(StatusCode::CREATED, &NotebookResponse { notebook }),
            Err(e) => {
                warn!(error = %e, "Failed to create notebook");
                Ok(hub_error(e))
            }
        }
    }

    async fn update_notebook<B>(&self, id: &str, req: Request<B>) -> Result<Response<Full<Bytes>>>
    where
        B: Body<Data = Bytes>,
        B::Error: std::error::Error + Send + Sync + 'static,
    {
        let update_req = match read_request(req).await? {
            Ok(r) => r,
            Err(response) => return Ok(response),
        };

        match self.registry.update(id, update_req) {
            Ok(notebook) => json_body(StatusCode::OK, &NotebookResponse { notebook }),
            Err(e) => {
                warn!(id, error = %e, "Failed to update notebook");
                Ok(hub_error(e))
            }
        }
    }

    fn delete_notebook(&self, id: &str) -> Response<Full<Bytes>> {
        match self.registry.delete(id) {
            Ok(()) => no_content(),
            Err(e) => hub_error(e),
        }
    }

    fn notebook_status(&self, id: &str) -> Result<Response<Full<Bytes>>> {
        match self.runner.get_status(id) {
            Ok(status) => json_body(StatusCode::OK, &StatusResponse { status }),
            Err(e) => Ok(hub_error(e)),
        }
    }

    /// Relaunch the process from the stored record, reviving a stopped or crashed one
    async fn reload_notebook(&self, id: &str) -> Response<Full<Bytes>> {
        let Some(notebook) = self.registry.get(id) else {
            return json_error(StatusCode::NOT_FOUND, "Notebook not found");
        };

        info!(id, "Reloading notebook");
        match self.runner.reload(notebook).await {
            Ok(()) => no_content(),
            Err(e) => hub_error(e),
        }
    }
}

/// Parse and validate a JSON notebook request. The inner `Err` is a ready 400.
async fn read_request<B>(req: Request<B>) -> Result<std::result::Result<NotebookRequest, Response<Full<Bytes>>>>
where
    B: Body<Data = Bytes>,
    B::Error: std::error::Error + Send + Sync + 'static,
{
    let body = req.into_body().collect().await?.to_bytes();

    let parsed: NotebookRequest = match serde_json::from_slice(&body) {
        Ok(r) => r,
        Err(e) => {
            debug!(error = %e, "Invalid JSON body");
            return Ok(Err(json_error(StatusCode::BAD_REQUEST, "Invalid request")));
        }
    };

    if let Err(msg) = parsed.validate() {
        return Ok(Err(json_error(StatusCode::BAD_REQUEST, msg)));
    }

    Ok(Ok(parsed))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{PortRange, RunnerConfig};
    use crate::db::Database;
    use std::time::Duration;

    fn client() -> SocketAddr {
        "127.0.0.1:50000".parse().unwrap()
    }

    fn api() -> ApiServer {
        let (_tx, rx) = watch::channel(false);
        let runner = Arc::new(Runner::new(
            RunnerConfig {
                program: "sh".to_string(),
                args: vec!["-c".to_string(), "sleep 30".to_string(), "notebook".to_string()],
                host: "127.0.0.1".to_string(),
            },
            PortRange::default(),
            rx.clone(),
        ));
        let registry = Arc::new(
            Registry::new(Database::open_in_memory().unwrap(), vec![runner.subscriber()]).unwrap(),
        );
        ApiServer::new(client(), registry, runner, rx)
    }

    async fn call(api: &ApiServer, method: Method, uri: &str, body: &str) -> (StatusCode, serde_json::Value) {
        let req = Request::builder()
            .method(method)
            .uri(uri)
            .body(Full::new(Bytes::from(body.to_string())))
            .unwrap();
        let response = api.handle(req, client()).await;
        let status = response.status();
        let bytes = response.into_body().collect().await.unwrap().to_bytes();
        let json = if bytes.is_empty() {
            serde_json::Value::Null
        } else {
            serde_json::from_slice(&bytes).unwrap()
        };
        (status, json)
    }

    async fn create(api: &ApiServer, name: &str, domain: &str) -> String {
        let body = serde_json::json!({ "name": name, "path": format!("/nb/{}.py", name), "domain": domain });
        let (status, json) = call(api, Method::POST, NOTEBOOKS_PATH, &body.to_string()).await;
        assert_eq!(status, StatusCode::CREATED, "{}", json);
        json["notebook"]["id"].as_str().unwrap().to_string()
    }

    #[test]
    fn test_routes() {
        assert_eq!(route(&Method::GET, "/api/v1/notebooks"), Route::List);
        assert_eq!(route(&Method::GET, "/api/v1/notebooks/"), Route::List);
        assert_eq!(route(&Method::POST, "/api/v1/notebooks"), Route::Create);
        assert_eq!(route(&Method::GET, "/api/v1/notebooks/abc"), Route::Get("abc"));
        assert_eq!(route(&Method::PUT, "/api/v1/notebooks/abc"), Route::Update("abc"));
        assert_eq!(route(&Method::DELETE, "/api/v1/notebooks/abc"), Route::Delete("abc"));
        assert_eq!(route(&Method::GET, "/api/v1/notebooks/abc/status"), Route::Status("abc"));
        assert_eq!(route(&Method::POST, "/api/v1/notebooks/abc/reload"), Route::Reload("abc"));
        assert_eq!(route(&Method::GET, "/api/v1/notebooks/abc/reload"), Route::MethodNotAllowed);
        assert_eq!(route(&Method::PATCH, "/api/v1/notebooks"), Route::MethodNotAllowed);
        assert_eq!(route(&Method::GET, "/api/v1/notebooks/abc/logs"), Route::NotFound);
        assert_eq!(route(&Method::GET, "/api/v2/notebooks"), Route::NotFound);
        assert_eq!(route(&Method::GET, "/health"), Route::Health);
    }

    #[tokio::test]
    async fn test_create_and_get() {
        let api = api();
        let id = create(&api, "a", "a.example.com").await;

        let (status, json) = call(&api, Method::GET, &format!("{}/{}", NOTEBOOKS_PATH, id), "").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(json["notebook"]["domain"], "a.example.com");
        assert_eq!(json["notebook"]["show_code"], false);

        let (status, json) = call(&api, Method::GET, NOTEBOOKS_PATH, "").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(json["notebooks"].as_array().unwrap().len(), 1);

        api.runner.shutdown().await;
    }

    #[tokio::test]
    async fn test_create_rejects_bad_requests() {
        let api = api();

        let (status, json) = call(&api, Method::POST, NOTEBOOKS_PATH, "not json").await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(json["error"], "Invalid request");

        let (status, json) = call(&api, Method::POST, NOTEBOOKS_PATH, r#"{"name":"a","path":"/nb/a.py"}"#).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(json["error"], "Missing required fields");

        let body = r#"{"name":"a","path":"/nb/../a.py","domain":"a.example.com"}"#;
        let (status, json) = call(&api, Method::POST, NOTEBOOKS_PATH, body).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert!(json["error"].as_str().unwrap().starts_with("validation failed"));
    }

    #[tokio::test]
    async fn test_create_duplicate_domain_conflicts() {
        let api = api();
        create(&api, "a", "a.example.com").await;

        let body = r#"{"name":"b","path":"/nb/b.py","domain":"a.example.com"}"#;
        let (status, json) = call(&api, Method::POST, NOTEBOOKS_PATH, body).await;
        assert_eq!(status, StatusCode::CONFLICT);
        assert_eq!(json["error"], "domain a.example.com is already in use");

        api.runner.shutdown().await;
    }

    #[tokio::test]
    async fn test_update_and_delete() {
        let api = api();
        let id = create(&api, "a", "a.example.com").await;
        let uri = format!("{}/{}", NOTEBOOKS_PATH, id);

        let (status, json) = call(&api, Method::PUT, &uri, r#"{"watch":true}"#).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(json["notebook"]["watch"], true);
        assert_eq!(json["notebook"]["name"], "a");

        let (status, _) = call(&api, Method::PUT, "/api/v1/notebooks/missing", r#"{"watch":true}"#).await;
        assert_eq!(status, StatusCode::NOT_FOUND);

        let (status, json) = call(&api, Method::DELETE, &uri, "").await;
        assert_eq!(status, StatusCode::NO_CONTENT);
        assert_eq!(json, serde_json::Value::Null);

        let (status, _) = call(&api, Method::DELETE, &uri, "").await;
        assert_eq!(status, StatusCode::NOT_FOUND);

        api.runner.shutdown().await;
    }

    #[tokio::test]
    async fn test_status_and_reload() {
        let api = api();
        let id = create(&api, "a", "a.example.com").await;
        let status_uri = format!("{}/{}/status", NOTEBOOKS_PATH, id);

        let mut running = false;
        for _ in 0..50 {
            let (_, json) = call(&api, Method::GET, &status_uri, "").await;
            if json["status"] == "Running" {
                running = true;
                break;
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
        assert!(running, "notebook never reported Running");

        api.runner.stop(&id).await.unwrap();
        let (_, json) = call(&api, Method::GET, &status_uri, "").await;
        assert_eq!(json["status"], "Stopped");

        let (status, _) = call(&api, Method::POST, &format!("{}/{}/reload", NOTEBOOKS_PATH, id), "").await;
        assert_eq!(status, StatusCode::NO_CONTENT);
        let (_, json) = call(&api, Method::GET, &status_uri, "").await;
        assert_eq!(json["status"], "Running");

        let pid = api.runner.pid(&id).unwrap();
        let (status, _) = call(&api, Method::POST, &format!("{}/{}/reload", NOTEBOOKS_PATH, id), "").await;
        assert_eq!(status, StatusCode::NO_CONTENT);
        assert_ne!(api.runner.pid(&id), Some(pid));
        assert_eq!(api.runner.get_status(&id).unwrap(), Status::Running);

        let (status, _) = call(&api, Method::GET, "/api/v1/notebooks/missing/status", "").await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        let (status, _) = call(&api, Method::POST, "/api/v1/notebooks/missing/reload", "").await;
        assert_eq!(status, StatusCode::NOT_FOUND);

        api.runner.shutdown().await;
    }

    #[tokio::test]
    async fn test_health_and_version() {
        let api = api();
        let (status, json) = call(&api, Method::GET, "/health", "").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(json["status"], "ok");

        let (_, json) = call(&api, Method::GET, "/version", "").await;
        assert_eq!(json["name"], "notebook-hub");

        let (status, _) = call(&api, Method::GET, "/nope", "").await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }
}
