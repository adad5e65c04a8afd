use futures::{FutureExt, StreamExt};
use futures::future::BoxFuture;
use kube::runtime::reflector::{self, ObjectRef, Store, store::Writer};
use kube::runtime::{WatchStreamExt, watcher};
use kube::{Api, Resource};
use serde::de::DeserializeOwned;
use std::fmt::Debug;
use std::panic::AssertUnwindSafe;
use std::sync::{Arc, Mutex};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, warn};

use crate::event::panic_message;

pub type ResourceEventHandler<K> =
    Arc<dyn Fn(watcher::Event<K>) -> BoxFuture<'static, ()> + Send + Sync>;

/// A namespaced read-through cache of one resource kind, fed by a watcher.
pub struct Informer<K>
where
    K: Resource<DynamicType = ()> + Clone + Debug + Send + Sync + DeserializeOwned + 'static,
{
    api: Api<K>,
    store: Store<K>,
    writer: Mutex<Option<Writer<K>>>,
    handler: Option<ResourceEventHandler<K>>,
}

impl<K> Informer<K>
where
    K: Resource<DynamicType = ()> + Clone + Debug + Send + Sync + DeserializeOwned + 'static,
{
    pub fn new(api: Api<K>) -> Self {
        let (store, writer) = reflector::store();
        Self {
            api,
            store,
            writer: Mutex::new(Some(writer)),
            handler: None,
        }
    }

    /// Receives every watcher event once it has been applied to the store.
    pub fn with_handler(mut self, handler: ResourceEventHandler<K>) -> Self {
        self.handler = Some(handler);
        self
    }

    pub fn get(&self, namespace: &str, name: &str) -> Option<Arc<K>> {
        self.store.get(&ObjectRef::new(name).within(namespace))
    }

    pub fn list(&self) -> Vec<Arc<K>> {
        self.store.state()
    }

    /// Spawns the reflector. A second call is a no-op.
    pub fn start(&self, token: CancellationToken) {
        let writer = match self.writer.lock() {
            Ok(mut writer) => writer.take(),
            Err(poisoned) => poisoned.into_inner().take(),
        };
        let Some(writer) = writer else {
            warn!("{} informer is already running", K::kind(&()));
            return;
        };

        let kind = K::kind(&()).to_string();
        let handler = self.handler.clone();
        let stream = watcher(self.api.clone(), watcher::Config::default())
            .default_backoff()
            .reflect(writer);

        tokio::spawn(async move {
            let mut stream = stream.boxed();
            loop {
                tokio::select! {
                    _ = token.cancelled() => {
                        debug!("Stopping {} informer", kind);
                        break;
                    }
                    event = stream.next() => match event {
                        Some(Ok(event)) => {
                            if let Some(handler) = &handler
                                && let Err(panic) = AssertUnwindSafe(handler(event)).catch_unwind().await
                            {
                                error!("{} informer event handler panicked: {}", kind, panic_message(&*panic));
                            }
                        }
                        Some(Err(e)) => {
                            error!("{} informer watch error, will retry: {}", kind, e);
                        }
                        None => {
                            warn!("{} informer stream has terminated unexpectedly", kind);
                            break;
                        }
                    }
                }
            }
        });
    }

    /// Waits for the first complete list. Returns `false` if cancelled first.
    pub async fn wait_for_cache_sync(&self, token: &CancellationToken) -> bool {
        tokio::select! {
            _ = token.cancelled() => false,
            ready = self.store.wait_until_ready() => ready.is_ok(),
        }
    }
}
