pub mod args;
pub mod auth;
pub mod backend;
pub mod challenge;
pub mod engine;
pub mod http;
pub mod lobby;
pub mod packets;
pub mod round;
pub mod runner;
pub mod session;
pub mod state;

use crate::{
    args::Args,
    auth::{AuthError, AuthSecret, Credential, Identity, JwtIdentity, RemoteIdentity},
    backend::{Backend, HttpBackend, LocalBackend},
    engine::{LobbyHandle, LobbySummary},
    http::ApiClient,
    lobby::{Profile, UserId},
    runner::HttpRunner,
    session::AdmissionError,
    state::{LobbyRegistry, Services},
};
use anyhow::Context;
use axum::{
    extract::{ws::WebSocketUpgrade, Path, State},
    http::{header, HeaderValue, Method, StatusCode},
    response::{IntoResponse, Json, Response},
    routing::get,
    Router,
};
use futures::future::join_all;
use std::sync::Arc;
use tokio::net::TcpListener;
use tower_http::{cors::CorsLayer, trace::TraceLayer};
use tracing::info;
use tracing_subscriber::prelude::*;
use uuid::Uuid;

pub fn setup_logging() {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "codeduel_lobby=info,tower_http=debug".into()),
        )
        .with(
            tracing_subscriber::fmt::layer()
                .compact()
                .with_file(false)
                .with_target(false),
        )
        .init();
}

/// How a connection enters the lobby system.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Entry {
    Create,
    Join(String),
    Connect(String),
}

#[derive(Clone)]
pub struct AppState {
    pub registry: LobbyRegistry,
    pub services: Services,
    pub identity: Arc<dyn Identity>,
    pub max_message_size: usize,
}

impl AppState {
    pub fn new(services: Services, identity: Arc<dyn Identity>) -> Self {
        Self {
            registry: LobbyRegistry::new(),
            services,
            identity,
            max_message_size: 64 * 1024,
        }
    }

    pub fn from_args(args: &Args) -> Self {
        let backend_client = ApiClient::new(&args.backend_url, &args.backend_api_key);
        let backend: Arc<dyn Backend> = if args.offline {
            info!("offline mode: serving built-in challenges");
            Arc::new(LocalBackend::default())
        } else {
            Arc::new(HttpBackend::new(backend_client.clone()))
        };
        let runner = Arc::new(HttpRunner::new(ApiClient::new(
            &args.runner_url,
            &args.runner_api_key,
        )));
        let identity: Arc<dyn Identity> = match &args.jwt_secret {
            Some(secret) => Arc::new(JwtIdentity::new(AuthSecret(secret.clone()))),
            None => Arc::new(RemoteIdentity::new(backend_client)),
        };

        Self {
            max_message_size: args.max_message_size,
            ..Self::new(Services { backend, runner }, identity)
        }
    }

    fn find(&self, lobby_id: &str) -> Result<LobbyHandle, AdmissionError> {
        let id = Uuid::parse_str(lobby_id).map_err(|_| AdmissionError::NotFound)?;
        self.registry.get(&id).ok_or(AdmissionError::NotFound)
    }

    /// Authenticates the caller and resolves the lobby the connection binds to.
    pub async fn admit(
        &self,
        token: Option<String>,
        entry: Entry,
    ) -> Result<(LobbyHandle, UserId), AdmissionError> {
        let token = token.ok_or(AuthError::MissingToken)?;
        let profile = Profile::from(self.identity.verify(&token).await?);
        let user = profile.id;

        match entry {
            Entry::Create => {
                let lobby = self.registry.create(profile, self.services.clone())?;
                info!(lobby = %lobby.id(), user, "lobby created");
                Ok((lobby, user))
            }
            Entry::Join(lobby_id) => {
                let lobby = self.find(&lobby_id)?;
                self.registry.claim(user, lobby.id())?;
                if let Err(e) = lobby.join(profile).await {
                    self.registry.release(user, lobby.id());
                    return Err(e.into());
                }
                Ok((lobby, user))
            }
            Entry::Connect(lobby_id) => Ok((self.find(&lobby_id)?, user)),
        }
    }
}

pub fn app(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health_handler))
        .route("/lobbies", get(list_lobbies_handler))
        .route("/create", get(create_handler))
        .route("/join/:lobby_id", get(join_handler))
        .route("/connect/:lobby_id", get(connect_handler))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

pub fn cors(origin: &str) -> anyhow::Result<CorsLayer> {
    let origin: HeaderValue = origin.parse().context("invalid CORS origin")?;
    Ok(CorsLayer::new()
        .allow_origin(origin)
        .allow_credentials(true)
        .allow_methods([Method::GET, Method::OPTIONS])
        .allow_headers([header::AUTHORIZATION, header::CONTENT_TYPE]))
}

pub async fn run(args: Args) -> anyhow::Result<()> {
    let cors = cors(&args.cors_origin)?;
    let state = AppState::from_args(&args);
    let listener = TcpListener::bind(args.host)
        .await
        .with_context(|| format!("failed to bind {}", args.host))?;

    info!("listening on {}", args.host);
    axum::serve(listener, app(state).layer(cors)).await?;
    Ok(())
}

pub async fn health_handler() -> impl IntoResponse {
    StatusCode::OK
}

async fn list_lobbies_handler(State(state): State<AppState>) -> Json<Vec<LobbySummary>> {
    let handles = state.registry.handles();
    let mut lobbies: Vec<LobbySummary> = join_all(handles.iter().map(|handle| handle.summary()))
        .await
        .into_iter()
        .filter_map(Result::ok)
        .collect();
    lobbies.sort_by_key(|lobby| lobby.id);
    Json(lobbies)
}

fn upgrade(ws: WebSocketUpgrade, state: AppState, token: Option<String>, entry: Entry) -> Response {
    ws.max_message_size(state.max_message_size)
        .on_upgrade(move |socket| async move {
            match state.admit(token, entry).await {
                Ok((lobby, user)) => session::run(socket, lobby, user).await,
                Err(e) => session::reject(socket, &e).await,
            }
        })
}

async fn create_handler(
    ws: WebSocketUpgrade,
    State(state): State<AppState>,
    Credential(token): Credential,
) -> Response {
    upgrade(ws, state, token, Entry::Create)
}

async fn join_handler(
    ws: WebSocketUpgrade,
    State(state): State<AppState>,
    Path(lobby_id): Path<String>,
    Credential(token): Credential,
) -> Response {
    upgrade(ws, state, token, Entry::Join(lobby_id))
}

async fn connect_handler(
    ws: WebSocketUpgrade,
    State(state): State<AppState>,
    Path(lobby_id): Path<String>,
    Credential(token): Credential,
) -> Response {
    upgrade(ws, state, token, Entry::Connect(lobby_id))
}
