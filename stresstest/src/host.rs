use std::collections::{HashMap, VecDeque};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;

use axum::extract::{Path, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::Router;
use bytes::Bytes;
use chunkhaul::error::TransportError;
use chunkhaul::manifest::Manifest;
use chunkhaul::model::Container;
use chunkhaul::synthetic::{Fault, SyntheticBackup};
use chunkhaul::transport::Transport;
use parking_lot::Mutex;
use sketches_ddsketch::DDSketch;
use tokio::net::TcpListener;

const CONTAINERS_PREFIX: &str = "/containers/";

#[derive(Default)]
struct HostState {
    token: String,
    manifest: Bytes,
    payloads: HashMap<String, Bytes>,
    faults: Mutex<HashMap<String, VecDeque<Fault>>>,
}

/// An HTTP server handing out container payloads, behind a bearer token.
pub struct ContainerHost {
    addr: SocketAddr,
    state: SharedState,
}

impl ContainerHost {
    pub async fn start(token: &str) -> anyhow::Result<Self> {
        let state = Arc::new(Mutex::new(Arc::new(HostState {
            token: token.into(),
            ..Default::default()
        })));

        let app = Router::new()
            .route("/manifest", get(serve_manifest))
            .route("/containers/{name}", get(serve_container))
            .with_state(Arc::clone(&state));

        let listener = TcpListener::bind(SocketAddr::from(([127, 0, 0, 1], 0))).await?;
        let addr = listener.local_addr()?;
        tokio::spawn(async move {
            if let Err(err) = axum::serve(listener, app).await {
                tracing::error!(error = %err, "container host stopped");
            }
        });

        Ok(Self { addr, state })
    }

    pub fn base_url(&self) -> String {
        format!("http://{}", self.addr)
    }

    /// Replaces what the host serves with the manifest and containers of
    /// `backup`.
    pub fn publish(&self, backup: &SyntheticBackup) -> anyhow::Result<()> {
        let manifest = Bytes::from(backup.manifest.to_bytes()?);
        let mut payloads = HashMap::new();
        for container in backup.containers() {
            if let Some(name) = container.host.uri.split(CONTAINERS_PREFIX).nth(1) {
                payloads.insert(name.to_owned(), backup.payload(&container.id));
            }
        }
        let mut state = self.state.lock();
        let token = state.token.clone();
        *state = Arc::new(HostState {
            token,
            manifest,
            payloads,
            faults: Default::default(),
        });
        Ok(())
    }

    /// Queues faults for the next requests of `container`.
    pub fn fail(&self, container: &Container, faults: Vec<Fault>) {
        let Some(name) = container.host.uri.split(CONTAINERS_PREFIX).nth(1) else {
            return;
        };
        let state = Arc::clone(&self.state.lock());
        state
            .faults
            .lock()
            .entry(name.to_owned())
            .or_default()
            .extend(faults);
    }
}

type SharedState = Arc<Mutex<Arc<HostState>>>;

fn authorized(state: &HostState, headers: &HeaderMap) -> bool {
    let expected = format!("Bearer {}", state.token);
    headers
        .get("authorization")
        .and_then(|value| value.to_str().ok())
        .is_some_and(|value| value == expected)
}

async fn serve_manifest(State(state): State<SharedState>, headers: HeaderMap) -> Response {
    let state = Arc::clone(&state.lock());
    if !authorized(&state, &headers) {
        return (StatusCode::UNAUTHORIZED, "session expired").into_response();
    }
    state.manifest.clone().into_response()
}

async fn serve_container(
    State(state): State<SharedState>,
    Path(name): Path<String>,
    headers: HeaderMap,
) -> Response {
    let state = Arc::clone(&state.lock());
    if !authorized(&state, &headers) {
        return (StatusCode::UNAUTHORIZED, "session expired").into_response();
    }

    let Some(payload) = state.payloads.get(&name).cloned() else {
        return (StatusCode::NOT_FOUND, "no such container").into_response();
    };
    let fault = state
        .faults
        .lock()
        .get_mut(&name)
        .and_then(VecDeque::pop_front);

    match fault {
        None => payload.into_response(),
        Some(Fault::Status(code)) => {
            let status = StatusCode::from_u16(code).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
            (status, "injected").into_response()
        }
        // a handler cannot cut the connection, a gateway error is the closest
        Some(Fault::Io) => (StatusCode::BAD_GATEWAY, "connection reset").into_response(),
        Some(Fault::Corrupt) => {
            let mut corrupt = payload.to_vec();
            if let Some(byte) = corrupt.last_mut() {
                *byte ^= 0xff;
            }
            Bytes::from(corrupt).into_response()
        }
    }
}

/// Lists the files the host currently serves.
pub async fn fetch_manifest(
    client: &reqwest::Client,
    base_url: &str,
    token: &str,
) -> anyhow::Result<Manifest> {
    let response = client
        .get(format!("{base_url}/manifest"))
        .bearer_auth(token)
        .send()
        .await?
        .error_for_status()?;
    let bytes = response.bytes().await?;
    Ok(Manifest::from_bytes(&bytes)?)
}

/// Fetches containers over HTTP, recording how long each request took.
pub struct HttpTransport {
    client: reqwest::Client,
    token: String,
    pub latencies: Mutex<DDSketch>,
}

impl HttpTransport {
    pub fn new(client: reqwest::Client, token: impl Into<String>) -> Self {
        Self {
            client,
            token: token.into(),
            latencies: Mutex::new(DDSketch::default()),
        }
    }
}

#[async_trait::async_trait]
impl Transport for HttpTransport {
    async fn fetch(&self, container: &Container) -> Result<Bytes, TransportError> {
        let method = reqwest::Method::from_bytes(container.host.method.as_bytes())
            .map_err(|err| TransportError::Other(err.to_string()))?;
        let mut request = self
            .client
            .request(method, &container.host.uri)
            .bearer_auth(&self.token);
        for (name, value) in &container.host.headers {
            request = request.header(name, value);
        }

        let start = Instant::now();
        let response = request
            .send()
            .await
            .map_err(|err| TransportError::Other(err.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            let message = response.text().await.unwrap_or_default();
            return Err(TransportError::Status {
                code: status.as_u16(),
                message,
            });
        }
        let payload = response
            .bytes()
            .await
            .map_err(|err| TransportError::Other(err.to_string()))?;

        self.latencies
            .lock()
            .add(start.elapsed().as_secs_f64());
        Ok(payload)
    }
}
