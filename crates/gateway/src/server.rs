use std::{net::SocketAddr, sync::Arc, time::Duration};

use {
    axum::{
        Router,
        extract::{ConnectInfo, State, WebSocketUpgrade},
        response::{IntoResponse, Json},
        routing::get,
    },
    tower_http::trace::TraceLayer,
    tracing::{info, warn},
};

use {
    duet_config::{DatabaseLocation, DuetConfig},
    duet_protocol::{PROTOCOL_VERSION, WS_PATH},
    duet_store::{
        CredentialStore, HistoryStore, InMemoryCredentialStore, InMemoryHistoryStore,
        SqliteCredentialStore, SqliteHistoryStore,
    },
};

use crate::{state::GatewayState, ws::handle_connection};

/// How long shutdown waits for open connections to finish their teardown.
const DRAIN_TIMEOUT: Duration = Duration::from_secs(10);

// ── Server startup ───────────────────────────────────────────────────────────

/// Build the gateway router (shared between production startup and tests).
pub fn build_gateway_app(state: Arc<GatewayState>) -> Router {
    Router::new()
        .route("/health", get(health_handler))
        .route(WS_PATH, get(ws_upgrade_handler))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Open the configured stores.
async fn open_stores(
    config: &DuetConfig,
) -> anyhow::Result<(Arc<dyn CredentialStore>, Arc<dyn HistoryStore>, String)> {
    let stores: (Arc<dyn CredentialStore>, Arc<dyn HistoryStore>, String) =
        match config.server.database_location() {
            DatabaseLocation::Memory => (
                Arc::new(InMemoryCredentialStore::new()),
                Arc::new(InMemoryHistoryStore::new()),
                "in-memory".to_string(),
            ),
            DatabaseLocation::File(path) => {
                let pool = duet_store::open_sqlite(&path).await?;
                let credentials: Arc<dyn CredentialStore> =
                    Arc::new(SqliteCredentialStore::new(pool.clone()));
                let history: Arc<dyn HistoryStore> = Arc::new(SqliteHistoryStore::new(pool));
                (credentials, history, path.display().to_string())
            },
        };
    Ok(stores)
}

/// Start the chat server on `port` and run until ctrl-c or SIGTERM.
pub async fn start_gateway(port: u16, config: &DuetConfig) -> anyhow::Result<()> {
    let (credentials, history, store_label) = open_stores(config).await?;
    let state = GatewayState::new(config, credentials, history);
    let app = build_gateway_app(Arc::clone(&state));

    let addr: SocketAddr = format!("{}:{port}", config.server.bind).parse()?;
    let listener = tokio::net::TcpListener::bind(addr).await?;

    // Startup banner.
    let lines = [
        format!("duet server v{} on {}", state.version, state.hostname),
        format!("protocol v{PROTOCOL_VERSION}, listening on ws://{addr}{WS_PATH}"),
        format!("store: {store_label}"),
        format!(
            "heartbeat: every {}s, {} missed allowed",
            state.heartbeat.interval.as_secs(),
            state.heartbeat.max_missed
        ),
    ];
    let width = lines.iter().map(|l| l.len()).max().unwrap_or(0) + 4;
    info!("┌{}┐", "─".repeat(width));
    for line in &lines {
        info!("│  {:<w$}│", line, w = width - 2);
    }
    info!("└{}┘", "─".repeat(width));

    let shutdown_state = Arc::clone(&state);
    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(async move {
        shutdown_signal().await;
        info!("shutting down, notifying connected users");
        if let Err(e) = shutdown_state.registry.shutdown().await {
            warn!(error = %e, "could not notify sessions");
        }
    })
    .await?;

    state.sessions.close();
    if tokio::time::timeout(DRAIN_TIMEOUT, state.sessions.wait())
        .await
        .is_err()
    {
        warn!(
            remaining = state.sessions.len(),
            "connections still open after drain timeout"
        );
    }
    info!("server stopped");
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!(error = %e, "failed to listen for ctrl-c");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            },
            Err(e) => {
                warn!(error = %e, "failed to listen for SIGTERM");
                std::future::pending::<()>().await;
            },
        }
    };
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {},
        () = terminate => {},
    }
}

// ── Handlers ─────────────────────────────────────────────────────────────────

async fn health_handler(State(state): State<Arc<GatewayState>>) -> impl IntoResponse {
    let online = state.registry.online().await.map(|n| n.len()).unwrap_or(0);
    Json(serde_json::json!({
        "status": "ok",
        "version": state.version,
        "protocol": PROTOCOL_VERSION,
        "online": online,
        "connections": state.sessions.len(),
    }))
}

async fn ws_upgrade_handler(
    ws: WebSocketUpgrade,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    State(state): State<Arc<GatewayState>>,
) -> impl IntoResponse {
    let sessions = state.sessions.clone();
    ws.on_upgrade(move |socket| sessions.track_future(handle_connection(socket, state, addr)))
}
