use axum::{
    routing::{get, post},
    Router,
};
use clap::Parser;
use collate_core::{JsonRecord, QueryEngine, QueryResult, QuerySpec, Schema};
use collate_io::{Aggregator, ControllerError, JsonDirSource, QueryController, RecordSource};
use serde::Serialize;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;
use tower_http::cors::CorsLayer;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

mod api;
mod config;
mod source;

use config::{Config, SourceConfig};
use source::HttpSource;

// =============================================================================
// CLI
// =============================================================================

#[derive(Parser)]
#[command(name = "collate-hub", version, about = "COLLATE query hub")]
struct Args {
    /// Server bind address (overrides [server].bind)
    #[arg(long)]
    bind: Option<String>,

    /// Path to config file
    #[arg(long, default_value = "collate-hub.toml")]
    config: PathBuf,
}

// =============================================================================
// Application State
// =============================================================================

pub type DynSource = Arc<dyn RecordSource<Record = JsonRecord>>;

pub struct AppState {
    pub controller: QueryController<DynSource>,
    pub start_time: Instant,
    pub started_at: chrono::DateTime<chrono::Utc>,
    /// Held while the first aggregation is in flight.
    warming: tokio::sync::Mutex<()>,
}

impl AppState {
    pub fn new(controller: QueryController<DynSource>) -> Self {
        Self {
            controller,
            start_time: Instant::now(),
            started_at: chrono::Utc::now(),
            warming: tokio::sync::Mutex::new(()),
        }
    }

    /// Rerun `spec`, aggregating every parent first if nothing is published
    /// yet. Callers that find the controller cold share one aggregation.
    pub async fn query_or_warm_up(
        &self,
        spec: QuerySpec,
    ) -> Result<QueryResult<JsonRecord>, ControllerError> {
        match self.controller.rerun(spec.clone()).await {
            Err(ControllerError::NotReady) => {}
            other => return other,
        }
        let _guard = self.warming.lock().await;
        match self.controller.rerun(spec.clone()).await {
            Err(ControllerError::NotReady) => self.controller.refresh_all(spec).await,
            other => other,
        }
    }

    /// Aggregate every parent with the default spec unless a query already
    /// published a snapshot.
    pub async fn warm_up(&self) -> Result<(), ControllerError> {
        let _guard = self.warming.lock().await;
        if self.controller.current().await.is_none() {
            self.controller.refresh_all(QuerySpec::default()).await?;
        }
        Ok(())
    }
}

#[derive(Debug, Serialize)]
pub struct ApiError {
    error: String,
}

impl ApiError {
    pub fn new(error: impl Into<String>) -> Self {
        Self {
            error: error.into(),
        }
    }
}

fn build_source(config: &SourceConfig) -> Result<DynSource, collate_io::SourceError> {
    let source: DynSource = match config {
        SourceConfig::Dir { dir, pointer } => {
            let mut source = JsonDirSource::new(dir);
            if let Some(p) = pointer {
                source = source.with_pointer(p);
            }
            Arc::new(source)
        }
        SourceConfig::Http(http) => Arc::new(HttpSource::new(http.clone())?),
    };
    Ok(source)
}

fn app(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/api/status", get(api::status))
        .route("/api/parents", get(api::list_parents))
        .route("/api/query", post(api::execute_query))
        .route("/api/refresh", post(api::refresh))
        .layer(CorsLayer::permissive())
        .with_state(state)
}

// =============================================================================
// Main
// =============================================================================

#[tokio::main]
async fn main() {
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG")
                .unwrap_or_else(|_| "collate_hub=info,collate_io=info,tower_http=info".into()),
        ))
        .with(tracing_subscriber::fmt::layer())
        .init();

    let args = Args::parse();

    let config = match Config::load(&args.config) {
        Ok(c) => c,
        Err(e) => {
            tracing::error!("Failed to load {:?}: {}", args.config, e);
            std::process::exit(1);
        }
    };

    if config.schema.fields.is_empty() {
        tracing::error!("No [[schema.fields]] configured in {:?}. Exiting.", args.config);
        std::process::exit(1);
    }
    let schema = match Schema::from_specs(&config.schema.fields) {
        Ok(s) => s,
        Err(e) => {
            tracing::error!("Invalid schema: {}", e);
            std::process::exit(1);
        }
    };

    let source = match build_source(&config.source) {
        Ok(s) => s,
        Err(e) => {
            tracing::error!("Failed to set up record source: {}", e);
            std::process::exit(1);
        }
    };

    let controller = QueryController::new(
        Aggregator::new(source, config.aggregator.clone()),
        QueryEngine::new(schema),
    );
    let state = Arc::new(AppState::new(controller));

    if config.server.refresh_on_start {
        let bg_state = state.clone();
        tokio::spawn(async move {
            if let Err(e) = bg_state.warm_up().await {
                tracing::warn!("Initial aggregation failed: {}", e);
            }
        });
    }

    let bind = args.bind.unwrap_or(config.server.bind);
    let addr: SocketAddr = match bind.parse() {
        Ok(a) => a,
        Err(e) => {
            tracing::error!("Invalid bind address {}: {}", bind, e);
            std::process::exit(1);
        }
    };

    tracing::info!("━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━");
    tracing::info!("  COLLATE hub v{}", env!("CARGO_PKG_VERSION"));
    tracing::info!("  API:     http://{}/api/status", addr);
    tracing::info!("  Source:  {}", state.controller.aggregator().source().name());
    tracing::info!("  Fields:  {}", config.schema.fields.len());
    tracing::info!("━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━");

    let listener = match tokio::net::TcpListener::bind(addr).await {
        Ok(l) => l,
        Err(e) => {
            tracing::error!("Failed to bind {}: {}", addr, e);
            std::process::exit(1);
        }
    };
    if let Err(e) = axum::serve(listener, app(state)).await {
        tracing::error!("Server error: {}", e);
    }
}
