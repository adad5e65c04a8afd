use futures::FutureExt;
use futures::future::BoxFuture;
use serde::{Deserialize, Serialize};
use std::any::Any;
use std::fmt;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::image_reference::DEFAULT_TAG;

pub static DEFAULT_QUEUE_CAPACITY: usize = 100;

/// A pushed image, as announced by a registry webhook.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImageEvent {
    pub image: String,
    pub tag: String,
}

impl ImageEvent {
    /// Splits a raw reference on its last `:`. A missing or empty tag becomes `latest`.
    pub fn from_reference(reference: &str) -> Self {
        match reference.rsplit_once(':') {
            Some((image, tag)) if !tag.is_empty() => Self {
                image: image.to_string(),
                tag: tag.to_string(),
            },
            Some((image, _)) => Self {
                image: image.to_string(),
                tag: DEFAULT_TAG.to_string(),
            },
            None => Self {
                image: reference.to_string(),
                tag: DEFAULT_TAG.to_string(),
            },
        }
    }

    pub fn image_and_tag(&self) -> String {
        format!("{}:{}", self.image, self.tag)
    }
}

impl fmt::Display for ImageEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.image, self.tag)
    }
}

type ImageEventHandlerFunc = Arc<dyn Fn(ImageEvent) -> BoxFuture<'static, ()> + Send + Sync>;

/// Producer side of the bus. Cheap to clone, handed to the push webhooks.
#[derive(Clone)]
pub struct ImageEventCollector {
    sender: mpsc::Sender<ImageEvent>,
}

impl ImageEventCollector {
    /// Enqueues an event, waiting while the queue is full.
    pub async fn collect(&self, event: ImageEvent) {
        debug!("Collecting image event {}", event);
        if let Err(e) = self.sender.send(event).await {
            warn!(
                "Image event bus is closed, dropping image event {}",
                e.0
            );
        }
    }
}

/// Consumer side of the bus. Handlers are registered before `start`, which consumes the bus.
pub struct ImageEventBus {
    receiver: mpsc::Receiver<ImageEvent>,
    handler_funcs: Vec<ImageEventHandlerFunc>,
}

impl ImageEventBus {
    pub fn new(capacity: usize) -> (ImageEventCollector, Self) {
        let (sender, receiver) = mpsc::channel(capacity);
        (
            ImageEventCollector { sender },
            Self {
                receiver,
                handler_funcs: Vec::new(),
            },
        )
    }

    pub fn add_handler_func<F, Fut>(&mut self, handler: F)
    where
        F: Fn(ImageEvent) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        self.handler_funcs
            .push(Arc::new(move |event: ImageEvent| handler(event).boxed()));
    }

    /// Spawns the dispatch loop. Every event is handed to each handler in registration order;
    /// a panicking handler is logged and skipped.
    pub fn start(self, token: CancellationToken) -> JoinHandle<()> {
        let Self {
            mut receiver,
            handler_funcs,
        } = self;
        info!(
            "Starting image event bus with {} handlers",
            handler_funcs.len()
        );

        tokio::spawn(async move {
            loop {
                tokio::select! {
                    biased;
                    _ = token.cancelled() => {
                        info!("Stopping image event bus");
                        break;
                    }
                    event = receiver.recv() => match event {
                        Some(event) => {
                            for handler in &handler_funcs {
                                dispatch(handler, event.clone()).await;
                            }
                        }
                        None => {
                            info!("All image event collectors are gone, stopping image event bus");
                            break;
                        }
                    }
                }
            }
            receiver.close();
        })
    }
}

async fn dispatch(handler: &ImageEventHandlerFunc, event: ImageEvent) {
    let future = match std::panic::catch_unwind(AssertUnwindSafe(|| handler(event.clone()))) {
        Ok(future) => future,
        Err(panic) => {
            error!(
                "Image event handler panicked for {}: {}",
                event,
                panic_message(&*panic)
            );
            return;
        }
    };
    if let Err(panic) = AssertUnwindSafe(future).catch_unwind().await {
        error!(
            "Image event handler panicked for {}: {}",
            event,
            panic_message(&*panic)
        );
    }
}

pub fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(message) = panic.downcast_ref::<&str>() {
        message.to_string()
    } else if let Some(message) = panic.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic".to_string()
    }
}
