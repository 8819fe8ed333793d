//! Job dispatcher: turns a submission into one scheduled build
//!
//! `submit` assigns the slug, hands the task to the scheduler and returns
//! immediately. There's no job tracking and no retry; a scheduler failure is
//! reported straight back to the caller.

use crate::scheduler::{BuildTask, SchedulerError, TaskScheduler};
use crate::slug::{generate_slug, is_valid_slug, MAX_SLUG_LEN};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::sync::Arc;
use tracing::{error, info};

/// Longest accepted source URL
const MAX_GIT_URL_LEN: usize = 2048;

#[derive(Debug, thiserror::Error)]
pub enum DispatchError {
    #[error("gitURL is required")]
    MissingGitUrl,
    #[error("gitURL must be an http(s), ssh or git URL")]
    InvalidGitUrl,
    #[error("slug must be 1-{} lowercase letters, digits or hyphens, not starting or ending with '-'", MAX_SLUG_LEN)]
    InvalidSlug,
    #[error("failed to schedule build: {0}")]
    Scheduler(#[from] SchedulerError),
}

impl DispatchError {
    /// Whether the caller sent something invalid, as opposed to a downstream failure
    pub fn is_client_error(&self) -> bool {
        !matches!(self, DispatchError::Scheduler(_))
    }
}

/// Result of a successful submission
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Submission {
    pub project_slug: String,
    pub url: String,
    #[serde(skip)]
    pub task_id: String,
    #[serde(skip)]
    pub created_at: DateTime<Utc>,
}

/// Where deployed projects are served
#[derive(Debug, Clone)]
pub struct PublicUrl {
    pub scheme: String,
    pub platform_domain: String,
}

impl PublicUrl {
    pub fn for_slug(&self, slug: &str) -> String {
        format!("{}://{}.{}", self.scheme, slug, self.platform_domain)
    }
}

pub struct Dispatcher {
    scheduler: Arc<dyn TaskScheduler>,
    public_url: PublicUrl,
}

impl Dispatcher {
    pub fn new(scheduler: Arc<dyn TaskScheduler>, public_url: PublicUrl) -> Self {
        Self {
            scheduler,
            public_url,
        }
    }

    pub fn scheduler_name(&self) -> &'static str {
        self.scheduler.name()
    }

    /// Schedule a build of `git_url`, under `slug` if given or a generated one otherwise
    pub async fn submit(&self, git_url: &str, slug: Option<&str>) -> Result<Submission, DispatchError> {
        let git_url = git_url.trim();
        if git_url.is_empty() {
            return Err(DispatchError::MissingGitUrl);
        }
        if !is_plausible_git_url(git_url) {
            return Err(DispatchError::InvalidGitUrl);
        }

        let slug = match slug.map(str::trim).filter(|s| !s.is_empty()) {
            Some(slug) if is_valid_slug(slug) => slug.to_string(),
            Some(_) => return Err(DispatchError::InvalidSlug),
            None => generate_slug(),
        };

        let task = BuildTask {
            slug: slug.clone(),
            git_url: git_url.to_string(),
        };

        let handle = self.scheduler.submit(&task).await.map_err(|e| {
            error!(slug, scheduler = self.scheduler.name(), error = %e, "Build submission failed");
            DispatchError::from(e)
        })?;

        info!(slug, task = %handle.0, scheduler = self.scheduler.name(), "Build queued");

        Ok(Submission {
            url: self.public_url.for_slug(&slug),
            project_slug: slug,
            task_id: handle.0,
            created_at: Utc::now(),
        })
    }
}

/// Cheap shape check; the build itself reports unreachable repositories
fn is_plausible_git_url(url: &str) -> bool {
    if url.len() > MAX_GIT_URL_LEN || url.chars().any(|c| c.is_whitespace() || c.is_control()) {
        return false;
    }
    ["https://", "http://", "ssh://", "git://", "git@"]
        .iter()
        .any(|prefix| url.starts_with(prefix) && url.len() > prefix.len())
}
