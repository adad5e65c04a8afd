use anyhow::Context;
use kube::Client;
use std::env;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use crate::config::Config;
use crate::controller::namespace::NamespaceController;
use crate::controller::{ControllerRegistry, configmap, deployment, job};
use crate::event::ImageEventBus;
use crate::state::AppState;

mod config;
mod controller;
mod event;
mod image_reference;
mod informer;
mod repository;
mod rollout;
mod state;
mod webhook;
mod webserver;

#[cfg(target_env = "musl")]
#[global_allocator]
static GLOBAL: mimalloc::MiMalloc = mimalloc::MiMalloc;

static DEFAULT_CONFIG_PATH: &str = "/etc/laborer/laborer.yaml";

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();
    info!("Starting laborer {}", env!("CARGO_PKG_VERSION"));

    let config_path = env::var("LABORER_CONFIG").unwrap_or_else(|_| DEFAULT_CONFIG_PATH.to_string());
    let config = config::load_config_or_default(&config_path)?;
    config.validate().context("Invalid laborer config")?;

    let repository = repository::new_repository_service(&config.repository)
        .context("Failed to create repository service")?;

    let client = create_client().await?;
    let registry = create_registry(&config, &client)?;

    let token = CancellationToken::new();
    let (collector, mut bus) = ImageEventBus::new(config.event_bus.capacity);

    let namespace_controller = Arc::new(NamespaceController::new(registry, token.child_token()));
    let handler_controller = namespace_controller.clone();
    bus.add_handler_func(move |event| {
        let controller = handler_controller.clone();
        async move { controller.process_image_event(event).await }
    });
    let bus_handle = bus.start(token.child_token());

    let namespace_handle = tokio::spawn(namespace_controller.start(client));

    let app = webserver::create_app(AppState {
        collector,
        repository,
    });
    let addr = format!("{}:{}", config.webserver.host, config.webserver.port);
    info!("Starting webserver on {}", addr);
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("Failed to bind webserver to {}", addr))?;

    let shutdown = token.clone();
    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            if let Err(e) = tokio::signal::ctrl_c().await {
                error!("Failed to listen for shutdown signal: {}", e);
            }
            info!("Shutdown signal received");
            shutdown.cancel();
        })
        .await?;

    token.cancel();
    if let Err(e) = namespace_handle.await {
        error!("Namespace controller task failed: {}", e);
    }
    if let Err(e) = bus_handle.await {
        error!("Image event bus task failed: {}", e);
    }
    info!("Laborer stopped");
    Ok(())
}

async fn create_client() -> anyhow::Result<Client> {
    info!("Initializing K8s client");
    let client = Client::try_default().await?;
    let api_server_info = client.apiserver_version().await?;
    info!(
        "Connected to Kubernetes API server with version {}.{}",
        api_server_info.major, api_server_info.minor
    );
    Ok(client)
}

fn create_registry(config: &Config, client: &Client) -> anyhow::Result<ControllerRegistry> {
    let mut registry = ControllerRegistry::default();
    for kind in &config.controllers {
        let new_func = match kind.as_str() {
            "deployment" => deployment::new_controller_func(client.clone()),
            "configmap" => configmap::new_controller_func(client.clone()),
            "job" => job::new_controller_func(client.clone()),
            other => anyhow::bail!("Unknown controller {}", other),
        };
        registry.register(kind, new_func)?;
    }
    info!("Enabled controllers: {:?}", registry.kinds());
    Ok(registry)
}
