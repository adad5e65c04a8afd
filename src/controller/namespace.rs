use futures::{FutureExt, StreamExt};
use k8s_openapi::api::core::v1::Namespace;
use kube::runtime::{WatchStreamExt, watcher};
use kube::{Api, Client, ResourceExt};
use std::collections::{HashMap, HashSet};
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::controller::{AggregationController, Controller, ControllerRegistry};
use crate::event::{ImageEvent, panic_message};

pub static LABORER_ENABLE_LABEL: &str = "laborer.enable";
static ENABLED: &str = "true";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NamespaceEventType {
    Added,
    Modified,
    Deleted,
}

/// Starts an aggregation controller for every namespace labelled `laborer.enable=true`
/// and fans image events out to them.
pub struct NamespaceController {
    registry: ControllerRegistry,
    token: CancellationToken,
    aggregation_controllers: Mutex<HashMap<String, Arc<AggregationController>>>,
}

impl NamespaceController {
    /// Every aggregation controller gets a child of `token`.
    pub fn new(registry: ControllerRegistry, token: CancellationToken) -> Self {
        Self {
            registry,
            token,
            aggregation_controllers: Mutex::new(HashMap::new()),
        }
    }

    /// Watches namespaces cluster-wide until the token is cancelled, then stops every
    /// running aggregation controller.
    pub async fn start(self: Arc<Self>, client: Client) {
        let token = self.token.clone();
        info!("Starting namespace controller");
        let namespaces: Api<Namespace> = Api::all(client);
        let mut stream = watcher(namespaces, watcher::Config::default())
            .default_backoff()
            .boxed();
        let mut tracker = NamespaceTracker::default();

        loop {
            tokio::select! {
                _ = token.cancelled() => break,
                event = stream.next() => match event {
                    Some(Ok(event)) => {
                        for (event_type, namespace) in tracker.observe(event) {
                            self.sync_aggregation_controller(event_type, &namespace).await;
                        }
                    }
                    Some(Err(e)) => error!("Namespace watch error, will retry: {}", e),
                    None => {
                        warn!("Namespace watch stream has terminated unexpectedly");
                        break;
                    }
                }
            }
        }

        info!("Shutting down namespace controller");
        let mut controllers = self.aggregation_controllers.lock().await;
        for (_, controller) in controllers.drain() {
            controller.stop();
        }
    }

    /// Applies one namespace notification to the managed set. Panics are logged and
    /// leave the set as it was before the failing step.
    pub async fn sync_aggregation_controller(
        &self,
        event_type: NamespaceEventType,
        namespace: &Namespace,
    ) {
        let result = AssertUnwindSafe(self.transition(event_type, namespace))
            .catch_unwind()
            .await;
        if let Err(panic) = result {
            error!(
                "Failed to sync namespace {} after {:?}: {}",
                namespace.name_any(),
                event_type,
                panic_message(&*panic)
            );
        }
    }

    async fn transition(&self, event_type: NamespaceEventType, namespace: &Namespace) {
        let name = namespace.name_any();
        let enabled = is_enabled(namespace);
        let mut controllers = self.aggregation_controllers.lock().await;
        let managed = controllers.contains_key(&name);

        match event_type {
            NamespaceEventType::Added | NamespaceEventType::Modified if enabled && !managed => {
                let controller = Arc::new(AggregationController::new(
                    &name,
                    &self.registry,
                    self.token.child_token(),
                ));
                controllers.insert(name.clone(), controller.clone());
                info!("Namespace {} is now managed", name);

                // Runs outside the map lock: cache sync may never finish.
                tokio::spawn(async move {
                    if let Err(panic) = AssertUnwindSafe(controller.run()).catch_unwind().await {
                        error!(
                            "Controllers for namespace {} panicked while starting: {}",
                            controller.namespace(),
                            panic_message(&*panic)
                        );
                    }
                });
            }
            NamespaceEventType::Modified if !enabled && managed => {
                if let Some(controller) = controllers.remove(&name) {
                    controller.stop();
                }
                info!("Namespace {} is no longer managed", name);
            }
            NamespaceEventType::Deleted if managed => {
                if let Some(controller) = controllers.remove(&name) {
                    controller.stop();
                }
                info!("Namespace {} was deleted, controllers stopped", name);
            }
            _ => debug!("Namespace {} {:?}, nothing to do", name, event_type),
        }
    }

    /// Forwards an image event to every managed namespace. Holds the map for the whole
    /// fan-out, so namespaces cannot start or stop halfway through.
    pub async fn process_image_event(&self, event: ImageEvent) {
        let controllers = self.aggregation_controllers.lock().await;
        info!(
            "Dispatching image event {} to {} namespaces",
            event,
            controllers.len()
        );
        for controller in controllers.values() {
            controller.process_image_event(&event).await;
        }
    }

    #[cfg(test)]
    async fn managed_namespaces(&self) -> Vec<String> {
        let mut names: Vec<String> = self
            .aggregation_controllers
            .lock()
            .await
            .keys()
            .cloned()
            .collect();
        names.sort();
        names
    }
}

fn is_enabled(namespace: &Namespace) -> bool {
    namespace
        .labels()
        .get(LABORER_ENABLE_LABEL)
        .is_some_and(|value| value == ENABLED)
}

/// Turns watcher events into add/modify/delete notifications by remembering which
/// namespaces have been seen. Namespaces missing from a relist are reported deleted.
#[derive(Default)]
struct NamespaceTracker {
    known: HashMap<String, Namespace>,
    relisted: Option<HashSet<String>>,
}

impl NamespaceTracker {
    fn observe(&mut self, event: watcher::Event<Namespace>) -> Vec<(NamespaceEventType, Namespace)> {
        match event {
            watcher::Event::Init => {
                self.relisted = Some(HashSet::new());
                Vec::new()
            }
            watcher::Event::InitApply(namespace) => {
                if let Some(relisted) = self.relisted.as_mut() {
                    relisted.insert(namespace.name_any());
                }
                vec![self.apply(namespace)]
            }
            watcher::Event::InitDone => {
                let Some(relisted) = self.relisted.take() else {
                    return Vec::new();
                };
                let gone: Vec<String> = self
                    .known
                    .keys()
                    .filter(|name| !relisted.contains(*name))
                    .cloned()
                    .collect();
                gone.into_iter()
                    .filter_map(|name| self.known.remove(&name))
                    .map(|namespace| (NamespaceEventType::Deleted, namespace))
                    .collect()
            }
            watcher::Event::Apply(namespace) => vec![self.apply(namespace)],
            watcher::Event::Delete(namespace) => {
                self.known.remove(&namespace.name_any());
                vec![(NamespaceEventType::Deleted, namespace)]
            }
        }
    }

    fn apply(&mut self, namespace: Namespace) -> (NamespaceEventType, Namespace) {
        let event_type = match self.known.insert(namespace.name_any(), namespace.clone()) {
            Some(_) => NamespaceEventType::Modified,
            None => NamespaceEventType::Added,
        };
        (event_type, namespace)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::controller::tests::{Calls, FakeMode, eventually, fake_controller_func};
    use std::collections::BTreeMap;
    use std::sync::atomic::Ordering;
    use std::time::Duration;

    fn namespace(name: &str, label: Option<&str>) -> Namespace {
        let mut namespace = Namespace::default();
        namespace.metadata.name = Some(name.to_string());
        namespace.metadata.labels = label.map(|value| {
            BTreeMap::from([(LABORER_ENABLE_LABEL.to_string(), value.to_string())])
        });
        namespace
    }

    fn controller_with(calls: &Arc<Calls>, mode: FakeMode) -> NamespaceController {
        let mut registry = ControllerRegistry::default();
        registry
            .register("fake", fake_controller_func(calls.clone(), mode))
            .unwrap();
        NamespaceController::new(registry, CancellationToken::new())
    }

    fn controller(calls: &Arc<Calls>) -> NamespaceController {
        controller_with(calls, FakeMode::Healthy)
    }

    #[tokio::test]
    async fn test_add_then_update_enabled_starts_once() {
        let calls = Arc::new(Calls::default());
        let controller = controller(&calls);

        controller
            .sync_aggregation_controller(NamespaceEventType::Added, &namespace("team", Some("true")))
            .await;
        controller
            .sync_aggregation_controller(
                NamespaceEventType::Modified,
                &namespace("team", Some("true")),
            )
            .await;

        assert_eq!(calls.created.load(Ordering::SeqCst), 1);
        eventually(|| calls.runs.load(Ordering::SeqCst) == 1).await;
        assert_eq!(controller.managed_namespaces().await, vec!["team"]);
    }

    #[tokio::test]
    async fn test_add_disable_delete_starts_and_stops_once() {
        let calls = Arc::new(Calls::default());
        let controller = controller(&calls);

        controller
            .sync_aggregation_controller(NamespaceEventType::Added, &namespace("team", Some("true")))
            .await;
        controller
            .sync_aggregation_controller(
                NamespaceEventType::Modified,
                &namespace("team", Some("false")),
            )
            .await;
        controller
            .sync_aggregation_controller(NamespaceEventType::Deleted, &namespace("team", None))
            .await;

        assert_eq!(calls.created.load(Ordering::SeqCst), 1);
        assert_eq!(calls.stops.load(Ordering::SeqCst), 1);
        assert!(controller.managed_namespaces().await.is_empty());
    }

    #[tokio::test]
    async fn test_unlabelled_namespace_stays_unmanaged() {
        let calls = Arc::new(Calls::default());
        let controller = controller(&calls);

        controller
            .sync_aggregation_controller(NamespaceEventType::Added, &namespace("other", None))
            .await;
        controller
            .sync_aggregation_controller(
                NamespaceEventType::Modified,
                &namespace("other", Some("false")),
            )
            .await;

        assert_eq!(calls.created.load(Ordering::SeqCst), 0);
        assert!(controller.managed_namespaces().await.is_empty());
    }

    #[tokio::test]
    async fn test_update_enables_and_delete_stops() {
        let calls = Arc::new(Calls::default());
        let controller = controller(&calls);

        controller
            .sync_aggregation_controller(NamespaceEventType::Added, &namespace("team", None))
            .await;
        controller
            .sync_aggregation_controller(
                NamespaceEventType::Modified,
                &namespace("team", Some("true")),
            )
            .await;
        assert_eq!(controller.managed_namespaces().await, vec!["team"]);

        controller
            .sync_aggregation_controller(
                NamespaceEventType::Deleted,
                &namespace("team", Some("true")),
            )
            .await;
        assert_eq!(calls.stops.load(Ordering::SeqCst), 1);
        assert!(controller.managed_namespaces().await.is_empty());
    }

    #[tokio::test]
    async fn test_image_events_reach_managed_namespaces_only() {
        let calls = Arc::new(Calls::default());
        let controller = controller(&calls);

        for (name, label) in [("a", Some("true")), ("b", None), ("c", Some("true"))] {
            controller
                .sync_aggregation_controller(NamespaceEventType::Added, &namespace(name, label))
                .await;
        }
        controller
            .process_image_event(ImageEvent::from_reference("team/app:v2"))
            .await;

        let mut namespaces: Vec<String> = calls
            .events
            .lock()
            .unwrap()
            .iter()
            .map(|(namespace, _)| namespace.clone())
            .collect();
        namespaces.sort();
        assert_eq!(namespaces, vec!["a", "c"]);
    }

    #[test]
    fn test_tracker_reports_added_then_modified() {
        let mut tracker = NamespaceTracker::default();
        let first = tracker.observe(watcher::Event::Apply(namespace("team", None)));
        let second = tracker.observe(watcher::Event::Apply(namespace("team", Some("true"))));

        assert_eq!(first[0].0, NamespaceEventType::Added);
        assert_eq!(second[0].0, NamespaceEventType::Modified);
    }

    #[test]
    fn test_tracker_relist_reports_vanished_namespaces() {
        let mut tracker = NamespaceTracker::default();
        tracker.observe(watcher::Event::Apply(namespace("kept", None)));
        tracker.observe(watcher::Event::Apply(namespace("gone", Some("true"))));

        tracker.observe(watcher::Event::Init);
        let relisted = tracker.observe(watcher::Event::InitApply(namespace("kept", None)));
        let done = tracker.observe(watcher::Event::InitDone);

        assert_eq!(relisted[0].0, NamespaceEventType::Modified);
        assert_eq!(done.len(), 1);
        assert_eq!(done[0].0, NamespaceEventType::Deleted);
        assert_eq!(done[0].1.name_any(), "gone");
    }

    #[tokio::test]
    async fn test_unsynced_namespace_blocks_neither_events_nor_delete() {
        let calls = Arc::new(Calls::default());
        let controller = controller_with(&calls, FakeMode::NeverSyncs);
        let limit = Duration::from_secs(2);

        tokio::time::timeout(
            limit,
            controller
                .sync_aggregation_controller(NamespaceEventType::Added, &namespace("stuck", Some("true"))),
        )
        .await
        .expect("adding a namespace must not wait for its caches");
        eventually(|| calls.runs.load(Ordering::SeqCst) == 1).await;

        tokio::time::timeout(
            limit,
            controller.process_image_event(ImageEvent::from_reference("team/app:v2")),
        )
        .await
        .expect("fan-out must not wait for cache sync");
        assert_eq!(calls.events.lock().unwrap().len(), 1);

        tokio::time::timeout(
            limit,
            controller.sync_aggregation_controller(
                NamespaceEventType::Deleted,
                &namespace("stuck", Some("true")),
            ),
        )
        .await
        .expect("deleting a namespace must not wait for its caches");
        assert_eq!(calls.stops.load(Ordering::SeqCst), 1);
        assert!(controller.managed_namespaces().await.is_empty());
        eventually(|| calls.finished_runs.load(Ordering::SeqCst) == 1).await;
    }

    #[tokio::test]
    async fn test_root_cancellation_ends_pending_runs() {
        let calls = Arc::new(Calls::default());
        let controller = controller_with(&calls, FakeMode::NeverSyncs);

        for name in ["a", "b"] {
            controller
                .sync_aggregation_controller(NamespaceEventType::Added, &namespace(name, Some("true")))
                .await;
        }
        eventually(|| calls.runs.load(Ordering::SeqCst) == 2).await;

        controller.token.cancel();
        eventually(|| calls.finished_runs.load(Ordering::SeqCst) == 2).await;
    }
}
