use anyhow::Context;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reqwest::Client;
use reqwest::header::ACCEPT;
use serde::Deserialize;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, info, warn};

static ARTIFACT_PAGE_SIZE: u32 = 100;

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct RepositoryServiceOptions {
    pub mock: bool,
    /// `[host/][project/]repo` → tag, used when `mock` is set.
    pub mock_tags: HashMap<String, String>,
    pub host: String,
    pub protocol: String,
    pub insecure_skip_verify: bool,
    pub api_path_prefix: String,
}

impl Default for RepositoryServiceOptions {
    fn default() -> Self {
        Self {
            mock: false,
            mock_tags: HashMap::new(),
            host: String::new(),
            protocol: "https".to_string(),
            insecure_skip_verify: true,
            api_path_prefix: "/api/v2.0".to_string(),
        }
    }
}

impl RepositoryServiceOptions {
    pub fn validate(&self) -> Result<(), RepositoryError> {
        if self.protocol != "http" && self.protocol != "https" {
            return Err(RepositoryError::InvalidOptions(format!(
                "repository protocol only supports http and https, got {}",
                self.protocol
            )));
        }
        Ok(())
    }

    fn base_url(&self) -> String {
        format!(
            "{}://{}/{}",
            self.protocol,
            self.host,
            self.api_path_prefix.trim_matches('/')
        )
    }
}

#[derive(Debug, thiserror::Error)]
pub enum RepositoryError {
    #[error("{message}")]
    NotFoundRepo { message: String },
    #[error("registry {host} is not supported")]
    NotSupportRegistry { host: String },
    #[error("invalid repository options: {0}")]
    InvalidOptions(String),
    #[error(transparent)]
    Http(#[from] anyhow::Error),
}

impl RepositoryError {
    fn not_found(project: &str, repo: &str) -> Self {
        RepositoryError::NotFoundRepo {
            message: format!("repo {}/{} not found", project, repo),
        }
    }
}

/// Resolves the most recently pushed tag of an image.
#[async_trait]
pub trait RepositoryService: Send + Sync {
    async fn latest_tag(&self, host: &str, project: &str, repo: &str)
    -> Result<String, RepositoryError>;
}

/// Builds the resolver selected by the options. Invalid options fail here, before anything runs.
pub fn new_repository_service(
    options: &RepositoryServiceOptions,
) -> Result<Arc<dyn RepositoryService>, RepositoryError> {
    options.validate()?;

    if options.mock {
        info!(
            "Using mock repository service with {} tags",
            options.mock_tags.len()
        );
        return Ok(Arc::new(MockRepositoryService::new(options.mock_tags.clone())));
    }
    if options.host.is_empty() {
        warn!("No repository host configured, latest tag resolution is disabled");
        return Ok(Arc::new(UnsupportedRepositoryService));
    }
    Ok(Arc::new(HarborRepositoryService::new(options)?))
}

/// Harbor v2 API client bound to a single registry host.
pub struct HarborRepositoryService {
    host: String,
    base_url: String,
    client: Client,
}

#[derive(Debug, Deserialize)]
struct Artifact {
    #[serde(default)]
    push_time: Option<DateTime<Utc>>,
    #[serde(default)]
    tags: Option<Vec<Tag>>,
}

#[derive(Debug, Deserialize)]
struct Tag {
    name: String,
    #[serde(default)]
    push_time: Option<DateTime<Utc>>,
}

impl HarborRepositoryService {
    pub fn new(options: &RepositoryServiceOptions) -> Result<Self, RepositoryError> {
        info!(
            "Initializing repository HTTP client for {}://{}",
            options.protocol, options.host
        );
        let client = Client::builder()
            .danger_accept_invalid_certs(options.insecure_skip_verify)
            .build()
            .context("Failed to build HTTP client")?;

        Ok(Self {
            host: options.host.clone(),
            base_url: options.base_url(),
            client,
        })
    }

    async fn list_artifacts(&self, project: &str, repo: &str) -> anyhow::Result<Vec<Artifact>> {
        let url = artifacts_url(&self.base_url, project, repo);
        debug!("Listing artifacts from URL {}", url);

        let response = self
            .client
            .get(&url)
            .header(ACCEPT, "application/json")
            .query(&[
                ("page", "1".to_string()),
                ("page_size", ARTIFACT_PAGE_SIZE.to_string()),
                ("with_tag", "true".to_string()),
            ])
            .send()
            .await
            .context("Failed to send request to list artifacts")?;

        if !response.status().is_success() {
            anyhow::bail!(
                "Registry {} returned error status {} while listing artifacts of {}/{}",
                self.host,
                response.status(),
                project,
                repo
            );
        }

        response
            .json::<Vec<Artifact>>()
            .await
            .context("Failed to decode artifact list")
    }
}

#[async_trait]
impl RepositoryService for HarborRepositoryService {
    async fn latest_tag(
        &self,
        host: &str,
        project: &str,
        repo: &str,
    ) -> Result<String, RepositoryError> {
        if host != self.host {
            return Err(RepositoryError::NotSupportRegistry {
                host: host.to_string(),
            });
        }

        let artifacts = self.list_artifacts(project, repo).await?;
        latest_pushed_tag(artifacts).ok_or_else(|| RepositoryError::not_found(project, repo))
    }
}

/// Harbor wants a `/` inside a repository name encoded twice, as `%252F`.
fn artifacts_url(base_url: &str, project: &str, repo: &str) -> String {
    format!(
        "{}/projects/{}/repositories/{}/artifacts",
        base_url,
        urlencoding::encode(project),
        urlencoding::encode(&urlencoding::encode(repo))
    )
}

/// Picks the newest artifact by push time, then its newest tag. Equal push times resolve to
/// the later entry in list order.
fn latest_pushed_tag(artifacts: Vec<Artifact>) -> Option<String> {
    let artifact = artifacts
        .into_iter()
        .max_by_key(|artifact| artifact.push_time)?;
    artifact
        .tags
        .unwrap_or_default()
        .into_iter()
        .max_by_key(|tag| tag.push_time)
        .map(|tag| tag.name)
}

/// Serves tags from a static map.
pub struct MockRepositoryService {
    tags: HashMap<String, String>,
}

impl MockRepositoryService {
    pub fn new(tags: HashMap<String, String>) -> Self {
        Self { tags }
    }
}

#[async_trait]
impl RepositoryService for MockRepositoryService {
    async fn latest_tag(
        &self,
        host: &str,
        project: &str,
        repo: &str,
    ) -> Result<String, RepositoryError> {
        let key = [host, project, repo]
            .into_iter()
            .filter(|part| !part.is_empty())
            .collect::<Vec<_>>()
            .join("/");

        self.tags
            .get(&key)
            .cloned()
            .ok_or_else(|| RepositoryError::not_found(project, repo))
    }
}

/// Used when no registry is configured.
pub struct UnsupportedRepositoryService;

#[async_trait]
impl RepositoryService for UnsupportedRepositoryService {
    async fn latest_tag(
        &self,
        host: &str,
        _project: &str,
        _repo: &str,
    ) -> Result<String, RepositoryError> {
        Err(RepositoryError::NotSupportRegistry {
            host: host.to_string(),
        })
    }
}
