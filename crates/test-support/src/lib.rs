//! Shared test helpers: a scripted OData service on localhost.

use anyhow::Context as _;
use axum::Router;
use axum::body::Bytes;
use axum::extract::State;
use axum::http::{HeaderMap, HeaderValue, Method, StatusCode, Uri};
use axum::response::{IntoResponse, Response};
use axum::routing::any;
use parking_lot::Mutex;
use serde_json::{Value, json};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;

/// Northwind-style metadata used throughout the tests.
pub const NORTHWIND_METADATA: &str = include_str!("../fixtures/northwind.xml");

/// Path prefix of the mock service root.
pub const SERVICE_ROOT: &str = "/odata";

/// One request as the mock saw it.
#[derive(Debug, Clone)]
pub struct RecordedRequest {
    pub method: String,
    /// Path as sent on the wire (still percent-encoded).
    pub path: String,
    pub query: Option<String>,
    pub headers: HashMap<String, String>,
    pub body: Option<Value>,
}

impl RecordedRequest {
    #[must_use]
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .get(&name.to_ascii_lowercase())
            .map(String::as_str)
    }
}

/// A scripted reply.
#[derive(Debug, Clone)]
pub struct MockResponse {
    pub status: u16,
    pub headers: Vec<(String, String)>,
    pub body: String,
    pub delay: Option<Duration>,
}

impl MockResponse {
    #[must_use]
    pub fn json(status: u16, body: &Value) -> Self {
        Self {
            status,
            headers: vec![("content-type".to_string(), "application/json".to_string())],
            body: body.to_string(),
            delay: None,
        }
    }

    #[must_use]
    pub fn empty(status: u16) -> Self {
        Self::raw(status, "")
    }

    #[must_use]
    pub fn raw(status: u16, body: &str) -> Self {
        Self {
            status,
            headers: Vec::new(),
            body: body.to_string(),
            delay: None,
        }
    }

    /// An OData error payload.
    #[must_use]
    pub fn odata_error(status: u16, code: &str, message: &str) -> Self {
        Self::json(status, &json!({ "error": { "code": code, "message": message } }))
    }

    #[must_use]
    pub fn with_header(mut self, name: &str, value: &str) -> Self {
        self.headers.push((name.to_string(), value.to_string()));
        self
    }

    #[must_use]
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }
}

#[derive(Default)]
struct Shared {
    routes: Mutex<HashMap<(String, String), MockResponse>>,
    metadata: Mutex<Option<MockResponse>>,
    requests: Mutex<Vec<RecordedRequest>>,
}

/// In-process OData service. Replies are scripted per method and path; anything unscripted gets
/// a 404 OData error. `$metadata` serves [`NORTHWIND_METADATA`] until replaced.
pub struct MockODataService {
    base_url: String,
    shared: Arc<Shared>,
    shutdown_tx: Option<oneshot::Sender<()>>,
    handle: Option<JoinHandle<std::io::Result<()>>>,
}

impl MockODataService {
    /// Bind an ephemeral localhost port and start serving.
    ///
    /// # Errors
    ///
    /// Returns an error if the listener cannot be bound.
    pub async fn start() -> anyhow::Result<Self> {
        let shared = Arc::new(Shared::default());
        *shared.metadata.lock() = Some(metadata_response(NORTHWIND_METADATA));

        let app = Router::new()
            .route("/{*path}", any(handle))
            .with_state(Arc::clone(&shared));
        let listener = TcpListener::bind("127.0.0.1:0")
            .await
            .context("bind mock OData service")?;
        let addr = listener.local_addr().context("mock local_addr")?;

        let (shutdown_tx, shutdown_rx) = oneshot::channel::<()>();
        let server = axum::serve(listener, app).with_graceful_shutdown(async move {
            let _ = shutdown_rx.await;
        });
        let handle = tokio::spawn(async move { server.await });

        Ok(Self {
            base_url: format!("http://{addr}{SERVICE_ROOT}"),
            shared,
            shutdown_tx: Some(shutdown_tx),
            handle: Some(handle),
        })
    }

    /// Service root, e.g. `http://127.0.0.1:4321/odata`.
    #[must_use]
    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    #[must_use]
    pub fn metadata_url(&self) -> String {
        format!("{}/$metadata", self.base_url)
    }

    /// Script the reply for `method` on `path` (relative to the service root, encoded form).
    pub fn respond(&self, method: &str, path: &str, response: MockResponse) {
        let key = (
            method.to_ascii_uppercase(),
            format!("{SERVICE_ROOT}{path}"),
        );
        self.shared.routes.lock().insert(key, response);
    }

    /// Replace the metadata document.
    pub fn set_metadata(&self, document: &str) {
        *self.shared.metadata.lock() = Some(metadata_response(document));
    }

    /// Make `$metadata` fail with `status`.
    pub fn fail_metadata(&self, status: u16) {
        *self.shared.metadata.lock() = Some(MockResponse::raw(status, "unavailable"));
    }

    /// Every request received so far, oldest first.
    #[must_use]
    pub fn requests(&self) -> Vec<RecordedRequest> {
        self.shared.requests.lock().clone()
    }

    /// Requests other than `$metadata` fetches.
    #[must_use]
    pub fn data_requests(&self) -> Vec<RecordedRequest> {
        self.requests()
            .into_iter()
            .filter(|r| !r.path.ends_with("/$metadata"))
            .collect()
    }

    /// Stop the server and wait for it to exit.
    ///
    /// # Errors
    ///
    /// Returns an error if the server task failed.
    pub async fn shutdown(mut self) -> anyhow::Result<()> {
        if let Some(tx) = self.shutdown_tx.take() {
            let _ = tx.send(());
        }
        if let Some(handle) = self.handle.take() {
            handle
                .await
                .context("mock server task join")?
                .context("mock server result")?;
        }
        Ok(())
    }
}

impl Drop for MockODataService {
    fn drop(&mut self) {
        if let Some(tx) = self.shutdown_tx.take() {
            let _ = tx.send(());
        }
    }
}

fn metadata_response(document: &str) -> MockResponse {
    MockResponse::raw(200, document).with_header("content-type", "application/xml")
}

async fn handle(
    State(shared): State<Arc<Shared>>,
    method: Method,
    uri: Uri,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let path = uri.path().to_string();
    let body_json = if body.is_empty() {
        None
    } else {
        Some(
            serde_json::from_slice(&body)
                .unwrap_or_else(|_| Value::String(String::from_utf8_lossy(&body).into_owned())),
        )
    };
    shared.requests.lock().push(RecordedRequest {
        method: method.as_str().to_string(),
        path: path.clone(),
        query: uri.query().map(str::to_string),
        headers: headers
            .iter()
            .filter_map(|(k, v)| Some((k.as_str().to_string(), v.to_str().ok()?.to_string())))
            .collect(),
        body: body_json,
    });

    let scripted = if path == format!("{SERVICE_ROOT}/$metadata") && method == Method::GET {
        shared.metadata.lock().clone()
    } else {
        shared
            .routes
            .lock()
            .get(&(method.as_str().to_string(), path.clone()))
            .cloned()
    };
    let reply = scripted.unwrap_or_else(|| {
        MockResponse::odata_error(404, "NotFound", &format!("no resource at {path}"))
    });

    if let Some(delay) = reply.delay {
        tokio::time::sleep(delay).await;
    }

    let status = StatusCode::from_u16(reply.status).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
    let mut response = (status, reply.body).into_response();
    for (name, value) in &reply.headers {
        if let (Ok(name), Ok(value)) = (
            axum::http::HeaderName::try_from(name.as_str()),
            HeaderValue::from_str(value),
        ) {
            response.headers_mut().insert(name, value);
        }
    }
    response
}
