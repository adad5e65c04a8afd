use async_trait::async_trait;
use futures::FutureExt;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use crate::event::{ImageEvent, panic_message};

pub mod configmap;
pub mod deployment;
pub mod job;
pub mod namespace;

/// Watches one resource kind inside one namespace.
#[async_trait]
pub trait Controller: Send + Sync {
    fn namespace(&self) -> &str;

    /// Starts the caches and returns once they are synced or the controller was stopped.
    async fn run(&self);

    fn stop(&self);

    /// Failures are logged here, never returned.
    async fn process_image_event(&self, _event: &ImageEvent) {}
}

/// Namespace identity and cancellation shared by every controller.
pub struct BaseController {
    namespace: String,
    token: CancellationToken,
}

impl BaseController {
    /// `token` is a child of the owner's token, so stopping the owner stops this controller.
    pub fn new(namespace: &str, token: CancellationToken) -> Self {
        Self {
            namespace: namespace.to_string(),
            token,
        }
    }

    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    pub fn token(&self) -> &CancellationToken {
        &self.token
    }

    pub fn stop(&self) {
        self.token.cancel();
    }
}

pub type NewControllerFunc =
    Arc<dyn Fn(&str, CancellationToken) -> Box<dyn Controller> + Send + Sync>;

/// Named controller constructors, applied in registration order for every managed namespace.
#[derive(Default, Clone)]
pub struct ControllerRegistry {
    factories: Vec<(String, NewControllerFunc)>,
}

impl ControllerRegistry {
    pub fn register(&mut self, kind: &str, new_func: NewControllerFunc) -> anyhow::Result<()> {
        if self.factories.iter().any(|(existing, _)| existing == kind) {
            anyhow::bail!("Controller kind {} is already registered", kind);
        }
        info!("Registering {} controller", kind);
        self.factories.push((kind.to_string(), new_func));
        Ok(())
    }

    pub fn kinds(&self) -> Vec<&str> {
        self.factories.iter().map(|(kind, _)| kind.as_str()).collect()
    }

    fn build(&self, namespace: &str, parent: &CancellationToken) -> Vec<Box<dyn Controller>> {
        self.factories
            .iter()
            .map(|(_, new_func)| new_func(namespace, parent.child_token()))
            .collect()
    }
}

/// Runs one instance of every registered controller for a namespace.
pub struct AggregationController {
    base: BaseController,
    controllers: Vec<Box<dyn Controller>>,
}

impl AggregationController {
    pub fn new(namespace: &str, registry: &ControllerRegistry, token: CancellationToken) -> Self {
        let controllers = registry.build(namespace, &token);
        Self {
            base: BaseController::new(namespace, token),
            controllers,
        }
    }
}

#[async_trait]
impl Controller for AggregationController {
    fn namespace(&self) -> &str {
        self.base.namespace()
    }

    async fn run(&self) {
        info!(
            "Starting {} controllers for namespace {}",
            self.controllers.len(),
            self.namespace()
        );
        for controller in &self.controllers {
            controller.run().await;
        }
    }

    fn stop(&self) {
        info!("Stopping controllers for namespace {}", self.namespace());
        for controller in &self.controllers {
            controller.stop();
        }
        self.base.stop();
    }

    async fn process_image_event(&self, event: &ImageEvent) {
        for controller in &self.controllers {
            let result = AssertUnwindSafe(controller.process_image_event(event))
                .catch_unwind()
                .await;
            if let Err(panic) = result {
                error!(
                    "Controller for namespace {} panicked while processing image event {}: {}",
                    self.namespace(),
                    event,
                    panic_message(&*panic)
                );
            }
        }
    }
}
