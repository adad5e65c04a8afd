use async_trait::async_trait;
use k8s_openapi::api::batch::v1::Job;
use kube::api::{DeleteParams, PostParams};
use kube::{Api, Client, ResourceExt};
use std::collections::HashSet;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::controller::{BaseController, Controller, NewControllerFunc};
use crate::event::ImageEvent;
use crate::informer::Informer;

pub static RERUN_ANNOTATION: &str = "laborer.job.rerun";
static DISABLE_RERUN: &str = "false";
static REVISIONS_ANNOTATION: &str = "revisions";
static CONTROLLER_UID_LABELS: [&str; 2] = ["controller-uid", "batch.kubernetes.io/controller-uid"];
static PULL_ALWAYS: &str = "Always";

static CREATE_RETRY_TIMES: usize = 3;
static CREATE_RETRY_BACKOFF: Duration = Duration::from_secs(1);

/// Re-creates opted-in jobs when a new tag of one of their images is pushed.
pub struct JobController {
    base: BaseController,
    informer: Informer<Job>,
    jobs: Api<Job>,
    in_flight: InFlight,
}

pub fn new_controller_func(client: Client) -> NewControllerFunc {
    Arc::new(
        move |namespace: &str, token: CancellationToken| -> Box<dyn Controller> {
            Box::new(JobController::new(namespace, client.clone(), token))
        },
    )
}

impl JobController {
    pub fn new(namespace: &str, client: Client, token: CancellationToken) -> Self {
        let jobs: Api<Job> = Api::namespaced(client, namespace);
        Self {
            base: BaseController::new(namespace, token),
            informer: Informer::new(jobs.clone()),
            jobs,
            in_flight: InFlight::default(),
        }
    }
}

#[async_trait]
impl Controller for JobController {
    fn namespace(&self) -> &str {
        self.base.namespace()
    }

    async fn run(&self) {
        info!("Starting job controller for namespace {}", self.namespace());
        self.informer.start(self.base.token().clone());

        if !self.informer.wait_for_cache_sync(self.base.token()).await {
            warn!(
                "Job controller for namespace {} stopped before caches synced",
                self.namespace()
            );
        }
    }

    fn stop(&self) {
        info!("Stopping job controller for namespace {}", self.namespace());
        self.base.stop();
    }

    async fn process_image_event(&self, event: &ImageEvent) {
        for job in self.informer.list() {
            if !needs_rerun(&job, event) {
                continue;
            }
            let Some(claim) = self.in_flight.claim(&job.name_any()) else {
                debug!(
                    "Job {}/{} is already being rerun, skipping image event {}",
                    self.namespace(),
                    job.name_any(),
                    event
                );
                continue;
            };
            info!(
                "Image event {} triggers rerun of job {}/{}",
                event,
                self.namespace(),
                job.name_any()
            );

            // The create retries may take seconds; keep them off the event dispatch path.
            let jobs = self.jobs.clone();
            let job = job.as_ref().clone();
            tokio::spawn(async move {
                let _claim = claim;
                if let Err(e) = rerun(&jobs, &job).await {
                    error!(
                        "Failed to rerun job {}/{}: {:?}",
                        job.namespace().unwrap_or_default(),
                        job.name_any(),
                        e
                    );
                }
            });
        }
    }
}

/// Names of the jobs whose rerun task is still running.
#[derive(Clone, Default)]
struct InFlight(Arc<Mutex<HashSet<String>>>);

impl InFlight {
    /// `None` while another claim on `name` is alive.
    fn claim(&self, name: &str) -> Option<Claim> {
        let mut names = self.0.lock().unwrap_or_else(PoisonError::into_inner);
        names.insert(name.to_string()).then(|| Claim {
            names: self.0.clone(),
            name: name.to_string(),
        })
    }
}

/// Releases the job name when dropped.
struct Claim {
    names: Arc<Mutex<HashSet<String>>>,
    name: String,
}

impl Drop for Claim {
    fn drop(&mut self) {
        self.names
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&self.name);
    }
}

/// A job reruns when it opted in and runs the event's image under another tag,
/// or with an `Always` pull policy.
pub fn needs_rerun(job: &Job, event: &ImageEvent) -> bool {
    match job.annotations().get(RERUN_ANNOTATION) {
        Some(value) if value != DISABLE_RERUN => {}
        _ => return false,
    }

    let Some(pod_spec) = job.spec.as_ref().and_then(|spec| spec.template.spec.as_ref()) else {
        return false;
    };
    pod_spec.containers.iter().any(|container| {
        let Some(image) = container.image.as_deref() else {
            return false;
        };
        let current = ImageEvent::from_reference(image);
        current.image == event.image
            && (current.tag != event.tag
                || container.image_pull_policy.as_deref() == Some(PULL_ALWAYS))
    })
}

/// Copy of the job that the API server accepts as a new object.
pub fn rerun_job(job: &Job) -> Job {
    let mut new_job = job.clone();
    new_job.metadata.resource_version = None;
    new_job.metadata.uid = None;
    new_job.metadata.creation_timestamp = None;
    new_job.metadata.managed_fields = None;
    new_job.status = None;

    if let Some(revisions) = new_job
        .metadata
        .annotations
        .as_mut()
        .and_then(|annotations| annotations.get_mut(REVISIONS_ANNOTATION))
    {
        *revisions = revisions.replace("running", "unfinished");
    }

    if let Some(spec) = new_job.spec.as_mut() {
        for label in CONTROLLER_UID_LABELS {
            if let Some(match_labels) = spec
                .selector
                .as_mut()
                .and_then(|selector| selector.match_labels.as_mut())
            {
                match_labels.remove(label);
            }
            if let Some(labels) = spec.template.metadata.as_mut().and_then(|m| m.labels.as_mut()) {
                labels.remove(label);
            }
        }
    }
    new_job
}

/// Deletes the job and creates it again. Only the create is retried; if every attempt
/// fails the job stays deleted.
async fn rerun(jobs: &Api<Job>, job: &Job) -> anyhow::Result<()> {
    let name = job.name_any();
    let new_job = rerun_job(job);

    jobs.delete(&name, &DeleteParams::background()).await?;
    debug!("Deleted job {} for rerun", name);

    let mut attempt = 0;
    loop {
        attempt += 1;
        match jobs.create(&PostParams::default(), &new_job).await {
            Ok(_) => {
                info!("Job {} rerun created", name);
                return Ok(());
            }
            Err(e) if attempt < CREATE_RETRY_TIMES => {
                debug!("Attempt {} to recreate job {} failed: {}", attempt, name, e);
                tokio::time::sleep(CREATE_RETRY_BACKOFF).await;
            }
            Err(e) => return Err(e.into()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn job(annotations: serde_json::Value, pull_policy: &str, image: &str) -> Job {
        serde_json::from_value(json!({
            "metadata": {
                "name": "migrate",
                "namespace": "team",
                "uid": "1234",
                "resourceVersion": "42",
                "annotations": annotations
            },
            "spec": {
                "selector": {"matchLabels": {"controller-uid": "1234", "app": "migrate"}},
                "template": {
                    "metadata": {"labels": {
                        "controller-uid": "1234",
                        "batch.kubernetes.io/controller-uid": "1234",
                        "app": "migrate"
                    }},
                    "spec": {
                        "restartPolicy": "Never",
                        "containers": [{"name": "migrate", "image": image, "imagePullPolicy": pull_policy}]
                    }
                }
            },
            "status": {"succeeded": 1}
        }))
        .unwrap()
    }

    #[test]
    fn test_job_without_annotation_never_reruns() {
        let job = job(json!({}), "IfNotPresent", "team/migrate:v1");
        assert!(!needs_rerun(&job, &ImageEvent::from_reference("team/migrate:v2")));
    }

    #[test]
    fn test_disabled_annotation_never_reruns() {
        let job = job(json!({RERUN_ANNOTATION: "false"}), "IfNotPresent", "team/migrate:v1");
        assert!(!needs_rerun(&job, &ImageEvent::from_reference("team/migrate:v2")));
    }

    #[test]
    fn test_new_tag_reruns() {
        let job = job(json!({RERUN_ANNOTATION: "true"}), "IfNotPresent", "team/migrate:v1");
        assert!(needs_rerun(&job, &ImageEvent::from_reference("team/migrate:v2")));
        assert!(!needs_rerun(&job, &ImageEvent::from_reference("team/migrate:v1")));
        assert!(!needs_rerun(&job, &ImageEvent::from_reference("team/other:v2")));
    }

    #[test]
    fn test_pull_always_reruns_on_same_tag() {
        let job = job(json!({RERUN_ANNOTATION: "true"}), "Always", "team/migrate:v1");
        assert!(needs_rerun(&job, &ImageEvent::from_reference("team/migrate:v1")));
    }

    #[test]
    fn test_rerun_job_strips_server_fields() {
        let job = job(
            json!({RERUN_ANNOTATION: "true", REVISIONS_ANNOTATION: "{\"1\":\"running\"}"}),
            "Always",
            "team/migrate:v1",
        );
        let new_job = rerun_job(&job);

        assert_eq!(new_job.metadata.uid, None);
        assert_eq!(new_job.metadata.resource_version, None);
        assert!(new_job.status.is_none());
        assert_eq!(
            new_job.annotations().get(REVISIONS_ANNOTATION).map(String::as_str),
            Some("{\"1\":\"unfinished\"}")
        );

        let spec = new_job.spec.unwrap();
        let match_labels = spec.selector.unwrap().match_labels.unwrap();
        assert!(!match_labels.contains_key("controller-uid"));
        assert_eq!(match_labels.get("app").map(String::as_str), Some("migrate"));

        let labels = spec.template.metadata.unwrap().labels.unwrap();
        assert!(!labels.contains_key("controller-uid"));
        assert!(!labels.contains_key("batch.kubernetes.io/controller-uid"));
    }

    #[test]
    fn test_in_flight_job_is_claimed_once() {
        let in_flight = InFlight::default();
        let claim = in_flight.claim("migrate").unwrap();
        assert!(in_flight.claim("migrate").is_none());
        assert!(in_flight.claim("seed").is_some());

        drop(claim);
        assert!(in_flight.claim("migrate").is_some());
    }

    #[tokio::test]
    async fn test_claim_is_released_when_rerun_task_ends() {
        let in_flight = InFlight::default();
        let claim = in_flight.claim("migrate").unwrap();
        tokio::spawn(async move {
            let _claim = claim;
        })
        .await
        .unwrap();
        assert!(in_flight.claim("migrate").is_some());
    }
}
