//! A local http server with canned responses, for testing the code paths
//! that talk to package indexes, channels and mapping sources.

use std::{
    collections::HashMap,
    future::IntoFuture,
    sync::{Arc, Mutex},
};

use axum::{
    Router,
    body::Body,
    extract::{Request, State},
    http::{
        HeaderMap, StatusCode,
        header::{ACCEPT, AUTHORIZATION, CONTENT_TYPE},
    },
    response::{IntoResponse, Response},
};
use miette::IntoDiagnostic;
use tokio::{net::TcpListener, task::JoinHandle};
use url::Url;

use crate::pypi_index::FlatIndex;

/// Media type of PEP 691 json project pages.
const SIMPLE_API_JSON: &str = "application/vnd.pypi.simple.v1+json";

#[derive(Debug, Clone)]
struct Route {
    status: StatusCode,
    content_type: String,
    body: Vec<u8>,
    /// Requests without this media type in their `Accept` header get a 406.
    accept: Option<String>,
}

/// A request the server received.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReceivedRequest {
    pub path: String,
    pub accept: Option<String>,
    pub authorization: Option<String>,
}

#[derive(Default)]
struct ServerState {
    routes: HashMap<String, Route>,
    requests: Mutex<Vec<ReceivedRequest>>,
    bearer_token: Option<String>,
}

/// Collects the routes of a [`TestServer`].
#[derive(Default)]
pub struct TestServerBuilder {
    state: ServerState,
}

impl TestServerBuilder {
    /// Serves `body` at `path` with status 200.
    pub fn with_file(
        mut self,
        path: &str,
        content_type: &str,
        body: impl Into<Vec<u8>>,
    ) -> Self {
        self.state.routes.insert(
            normalize_path(path),
            Route {
                status: StatusCode::OK,
                content_type: content_type.to_string(),
                body: body.into(),
                accept: None,
            },
        );
        self
    }

    pub fn with_json(self, path: &str, value: &serde_json::Value) -> Self {
        self.with_file(path, "application/json", value.to_string())
    }

    /// Answers requests to `path` with an empty body and `status`.
    pub fn with_status(mut self, path: &str, status: u16) -> Self {
        self.state.routes.insert(
            normalize_path(path),
            Route {
                status: StatusCode::from_u16(status).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR),
                content_type: "text/plain".to_string(),
                body: Vec::new(),
                accept: None,
            },
        );
        self
    }

    /// Serves the wheels of `index` as a PEP 691 json simple index below
    /// `/simple/`, with the wheels themselves below `/files/`.
    ///
    /// Project pages refer to the wheels with relative urls and are only
    /// served to clients that ask for the json media type.
    pub fn with_simple_index(mut self, index: &FlatIndex) -> miette::Result<Self> {
        for project in index.projects() {
            let page = index.json_project_page_with(&project, |filename| {
                Ok(format!("../../files/{filename}"))
            })?;
            self.state.routes.insert(
                format!("/simple/{project}/"),
                Route {
                    status: StatusCode::OK,
                    content_type: SIMPLE_API_JSON.to_string(),
                    body: page.to_string().into_bytes(),
                    accept: Some(SIMPLE_API_JSON.to_string()),
                },
            );
        }
        for (filename, path) in index.wheels() {
            let body = fs_err::read(&path).into_diagnostic()?;
            self = self.with_file(&format!("/files/{filename}"), "application/zip", body);
        }
        Ok(self)
    }

    /// Rejects every request without `Authorization: Bearer <token>`.
    pub fn with_bearer_token(mut self, token: impl Into<String>) -> Self {
        self.state.bearer_token = Some(token.into());
        self
    }

    /// Binds to a random local port and starts serving.
    pub async fn start(self) -> miette::Result<TestServer> {
        let listener = TcpListener::bind("127.0.0.1:0").await.into_diagnostic()?;
        let address = listener.local_addr().into_diagnostic()?;
        let state = Arc::new(self.state);

        let router = Router::new()
            .fallback(respond)
            .with_state(state.clone());
        let handle = tokio::spawn(axum::serve(listener, router).into_future());

        let url = Url::parse(&format!("http://{address}/")).into_diagnostic()?;
        Ok(TestServer { url, state, handle })
    }
}

/// A running server, stopped when dropped.
pub struct TestServer {
    url: Url,
    state: Arc<ServerState>,
    handle: JoinHandle<Result<(), std::io::Error>>,
}

impl TestServer {
    pub fn builder() -> TestServerBuilder {
        TestServerBuilder::default()
    }

    /// The root url of the server, with a trailing slash.
    pub fn url(&self) -> &Url {
        &self.url
    }

    /// `path` joined onto the root url.
    pub fn url_for(&self, path: &str) -> Url {
        self.url
            .join(path.trim_start_matches('/'))
            .expect("valid path")
    }

    /// The requests received so far, in order.
    pub fn requests(&self) -> Vec<ReceivedRequest> {
        self.state
            .requests
            .lock()
            .map(|requests| requests.clone())
            .unwrap_or_default()
    }

    /// The received requests for `path`.
    pub fn requests_for(&self, path: &str) -> Vec<ReceivedRequest> {
        let path = normalize_path(path);
        self.requests()
            .into_iter()
            .filter(|request| request.path == path)
            .collect()
    }
}

impl Drop for TestServer {
    fn drop(&mut self) {
        self.handle.abort();
    }
}

fn normalize_path(path: &str) -> String {
    format!("/{}", path.trim_start_matches('/'))
}

fn header(headers: &HeaderMap, name: axum::http::HeaderName) -> Option<String> {
    headers
        .get(name)
        .and_then(|value| value.to_str().ok())
        .map(str::to_string)
}

async fn respond(State(state): State<Arc<ServerState>>, request: Request) -> Response {
    let received = ReceivedRequest {
        path: request.uri().path().to_string(),
        accept: header(request.headers(), ACCEPT),
        authorization: header(request.headers(), AUTHORIZATION),
    };
    if let Ok(mut requests) = state.requests.lock() {
        requests.push(received.clone());
    }

    if let Some(token) = &state.bearer_token {
        if received.authorization.as_deref() != Some(format!("Bearer {token}").as_str()) {
            return StatusCode::UNAUTHORIZED.into_response();
        }
    }

    let Some(route) = state.routes.get(&received.path) else {
        return StatusCode::NOT_FOUND.into_response();
    };
    if let Some(accept) = &route.accept {
        if !received
            .accept
            .as_deref()
            .is_some_and(|header| header.contains(accept.as_str()))
        {
            return StatusCode::NOT_ACCEPTABLE.into_response();
        }
    }

    Response::builder()
        .status(route.status)
        .header(CONTENT_TYPE, route.content_type.as_str())
        .body(Body::from(route.body.clone()))
        .unwrap_or_else(|_| StatusCode::INTERNAL_SERVER_ERROR.into_response())
}
