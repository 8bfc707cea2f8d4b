#![allow(clippy::too_many_arguments)]
pub mod api;
pub mod error;
pub mod git;
pub mod rpc;

use std::net::SocketAddr;
use std::process::Command;
use std::str;
use std::sync::Arc;

use anyhow::Context as _;
use axum::Router;
use tower_http::trace::TraceLayer;

use keel::chain::ChainView;
use keel::node::Node;
use keel::push;
use keel::storage::Storage;

/// Daemon options.
#[derive(Debug, Clone)]
pub struct Options {
    pub listen: SocketAddr,
}

/// State shared by the HTTP handlers.
pub struct Context {
    pub storage: Storage,
    pub handler: Arc<push::Handler>,
    pub chain: Arc<dyn ChainView>,
}

impl Context {
    pub fn new(node: &Node, chain: Arc<dyn ChainView>) -> Self {
        Self {
            storage: node.storage.clone(),
            handler: node.handler.clone(),
            chain,
        }
    }
}

/// Run the server.
pub async fn run(options: Options, ctx: Context) -> anyhow::Result<()> {
    let git_version = Command::new("git")
        .arg("version")
        .output()
        .context("'git' command must be available")?
        .stdout;

    tracing::info!("{}", str::from_utf8(&git_version)?.trim());
    tracing::info!("listening on http://{}", options.listen);

    let app = router(ctx)
        .layer(TraceLayer::new_for_http())
        .into_make_service_with_connect_info::<SocketAddr>();

    axum_server::bind(options.listen)
        .serve(app)
        .await
        .map_err(anyhow::Error::from)
}

/// Create a router consisting of other sub-routers.
pub fn router(ctx: Context) -> Router {
    let ctx = Arc::new(ctx);
    let git_router = git::router(ctx.clone());
    let api_router = api::router(ctx);

    Router::new().merge(git_router).nest("/api", api_router)
}

pub mod logger {
    pub fn init() -> Result<(), tracing::subscriber::SetGlobalDefaultError> {
        tracing::subscriber::set_global_default(subscriber())
    }

    pub fn subscriber() -> impl tracing::Subscriber {
        tracing_subscriber::FmtSubscriber::builder()
            .with_target(false)
            .with_max_level(tracing::Level::DEBUG)
            .finish()
    }
}
