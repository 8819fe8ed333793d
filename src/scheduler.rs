//! Build task schedulers
//!
//! A scheduler takes one [`BuildTask`] and starts an isolated build for it,
//! returning as soon as the task is accepted. [`EcsScheduler`] issues an ECS
//! `RunTask` through the AWS SDK.

use crate::config::SchedulerConfig;
use async_trait::async_trait;
use aws_config::timeout::TimeoutConfig;
use aws_config::{BehaviorVersion, Region};
use aws_sdk_ecs::config::Credentials;
use aws_sdk_ecs::error::{DisplayErrorContext, ProvideErrorMetadata, SdkError};
use aws_sdk_ecs::operation::run_task::RunTaskError;
use aws_sdk_ecs::types::{
    AssignPublicIp, AwsVpcConfiguration, ContainerOverride, Failure, KeyValuePair, LaunchType,
    NetworkConfiguration, Task, TaskOverride,
};
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Environment variable carrying the source repository URL
pub const ENV_GIT_REPOSITORY_URL: &str = "GIT_REPOSITORY_URL";
/// Environment variable carrying the project slug
pub const ENV_PROJECT_ID: &str = "PROJECT_ID";

/// Provider name attached to credentials taken from configuration
const STATIC_CREDENTIALS_SOURCE: &str = "tenantgate-config";

/// One build to schedule
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BuildTask {
    pub slug: String,
    pub git_url: String,
}

impl BuildTask {
    /// Environment handed to the build container, extras first so the task
    /// values always win
    pub fn environment(&self, extra: &HashMap<String, String>) -> BTreeMap<String, String> {
        let mut env: BTreeMap<String, String> = extra
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();
        env.insert(ENV_GIT_REPOSITORY_URL.to_string(), self.git_url.clone());
        env.insert(ENV_PROJECT_ID.to_string(), self.slug.clone());
        env
    }
}

/// Identifier of a scheduled task (the task ARN)
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TaskHandle(pub String);

#[derive(Debug, thiserror::Error)]
pub enum SchedulerError {
    /// The scheduler answered and refused the task
    #[error("scheduler rejected task: {0}")]
    Rejected(String),
    /// The scheduler could not be reached or answered garbage
    #[error("scheduler unavailable: {0}")]
    Unavailable(String),
    #[error("scheduler did not answer within {0:?}")]
    Timeout(Duration),
}

/// Submits build tasks to an external execution environment
#[async_trait]
pub trait TaskScheduler: Send + Sync {
    async fn submit(&self, task: &BuildTask) -> Result<TaskHandle, SchedulerError>;

    /// Back-end name for logs and health output
    fn name(&self) -> &'static str;
}

/// Build the scheduler described by configuration
pub async fn from_config(config: &SchedulerConfig) -> anyhow::Result<Arc<dyn TaskScheduler>> {
    Ok(Arc::new(EcsScheduler::new(config).await?))
}

/// Fixed placement and sizing for every build task
#[derive(Debug, Clone)]
pub struct EcsProfile {
    pub cluster: String,
    pub task_definition: String,
    pub launch_type: String,
    pub subnets: Vec<String>,
    pub security_groups: Vec<String>,
    pub assign_public_ip: bool,
    pub container_name: String,
    pub cpu: Option<String>,
    pub memory: Option<String>,
    pub env: HashMap<String, String>,
}

impl EcsProfile {
    fn from_config(config: &SchedulerConfig) -> anyhow::Result<Self> {
        let missing = |field: &str| anyhow::anyhow!("scheduler: '{}' is required", field);
        Ok(Self {
            cluster: config.cluster.clone().ok_or_else(|| missing("cluster"))?,
            task_definition: config
                .task_definition
                .clone()
                .ok_or_else(|| missing("task_definition"))?,
            launch_type: config.launch_type.clone(),
            subnets: config.subnets.clone(),
            security_groups: config.security_groups.clone(),
            assign_public_ip: config.assign_public_ip,
            container_name: config.container_name.clone(),
            cpu: config.cpu.clone(),
            memory: config.memory.clone(),
            env: config.env.clone(),
        })
    }

    /// `awsvpc` placement shared by every task
    pub fn network_configuration(&self) -> anyhow::Result<NetworkConfiguration> {
        let assign_public_ip = if self.assign_public_ip {
            AssignPublicIp::Enabled
        } else {
            AssignPublicIp::Disabled
        };
        let vpc = AwsVpcConfiguration::builder()
            .set_subnets(Some(self.subnets.clone()))
            .set_security_groups(Some(self.security_groups.clone()))
            .assign_public_ip(assign_public_ip)
            .build()
            .map_err(|e| anyhow::anyhow!("Invalid task network configuration: {}", e))?;

        Ok(NetworkConfiguration::builder().awsvpc_configuration(vpc).build())
    }

    /// Per-build overrides: the builder container's environment plus task sizing
    pub fn overrides(&self, task: &BuildTask) -> TaskOverride {
        let environment: Vec<KeyValuePair> = task
            .environment(&self.env)
            .into_iter()
            .map(|(name, value)| KeyValuePair::builder().name(name).value(value).build())
            .collect();

        let container = ContainerOverride::builder()
            .name(&self.container_name)
            .set_environment(Some(environment))
            .build();

        TaskOverride::builder()
            .container_overrides(container)
            .set_cpu(self.cpu.clone())
            .set_memory(self.memory.clone())
            .build()
    }
}

/// Interpret a `RunTask` result: the first started task wins, otherwise the
/// reported failures become the rejection reason
fn parse_run_task_output(tasks: &[Task], failures: &[Failure]) -> Result<TaskHandle, SchedulerError> {
    if let Some(arn) = tasks.iter().find_map(Task::task_arn) {
        return Ok(TaskHandle(arn.to_string()));
    }

    let reasons: Vec<String> = failures
        .iter()
        .map(|f| match (f.arn(), f.reason()) {
            (Some(arn), Some(reason)) => format!("{} ({})", reason, arn),
            (None, Some(reason)) => reason.to_string(),
            (Some(arn), None) => arn.to_string(),
            (None, None) => "unknown failure".to_string(),
        })
        .collect();

    if reasons.is_empty() {
        Err(SchedulerError::Rejected("no task was started".to_string()))
    } else {
        Err(SchedulerError::Rejected(reasons.join("; ")))
    }
}

/// Map an SDK failure onto the scheduler's error kinds
fn classify_error<R: std::fmt::Debug>(err: SdkError<RunTaskError, R>, timeout: Duration) -> SchedulerError {
    match err {
        SdkError::TimeoutError(_) => SchedulerError::Timeout(timeout),
        SdkError::ServiceError(service) => {
            let err = service.into_err();
            let detail = match (err.code(), err.message()) {
                (Some(code), Some(message)) => format!("{}: {}", code, message),
                (Some(code), None) => code.to_string(),
                _ => DisplayErrorContext(&err).to_string(),
            };
            if matches!(err, RunTaskError::ServerException(_)) {
                SchedulerError::Unavailable(detail)
            } else {
                SchedulerError::Rejected(detail)
            }
        }
        other => SchedulerError::Unavailable(DisplayErrorContext(&other).to_string()),
    }
}

pub struct EcsScheduler {
    client: aws_sdk_ecs::Client,
    profile: EcsProfile,
    network: NetworkConfiguration,
    timeout: Duration,
}

impl EcsScheduler {
    /// Static keys from configuration win; without them the standard AWS
    /// credential chain (environment, profile, instance role) applies
    pub async fn new(config: &SchedulerConfig) -> anyhow::Result<Self> {
        config.validate().map_err(|errors| {
            anyhow::anyhow!("Invalid scheduler configuration: {}", errors.join("; "))
        })?;

        let region = config
            .region
            .clone()
            .ok_or_else(|| anyhow::anyhow!("scheduler: 'region' is required"))?;
        let profile = EcsProfile::from_config(config)?;
        let network = profile.network_configuration()?;

        let mut loader = aws_config::defaults(BehaviorVersion::latest())
            .region(Region::new(region))
            .timeout_config(
                TimeoutConfig::builder()
                    .operation_timeout(config.submit_timeout())
                    .build(),
            );

        if let (Some(access_key), Some(secret_key)) = (&config.access_key, &config.secret_key) {
            loader = loader.credentials_provider(Credentials::new(
                access_key,
                secret_key,
                config.session_token.clone(),
                None,
                STATIC_CREDENTIALS_SOURCE,
            ));
        }
        if let Some(ref endpoint) = config.endpoint {
            loader = loader.endpoint_url(endpoint);
        }

        let sdk_config = loader.load().await;

        debug!(
            cluster = %profile.cluster,
            endpoint = config.endpoint.as_deref().unwrap_or("default"),
            static_credentials = config.access_key.is_some(),
            "ECS scheduler initialized"
        );

        Ok(Self {
            client: aws_sdk_ecs::Client::new(&sdk_config),
            profile,
            network,
            timeout: config.submit_timeout(),
        })
    }
}

#[async_trait]
impl TaskScheduler for EcsScheduler {
    async fn submit(&self, task: &BuildTask) -> Result<TaskHandle, SchedulerError> {
        let output = self
            .client
            .run_task()
            .cluster(&self.profile.cluster)
            .task_definition(&self.profile.task_definition)
            .launch_type(LaunchType::from(self.profile.launch_type.as_str()))
            .count(1)
            .network_configuration(self.network.clone())
            .overrides(self.profile.overrides(task))
            .send()
            .await
            .map_err(|e| {
                let err = classify_error(e, self.timeout);
                warn!(slug = %task.slug, error = %err, "RunTask failed");
                err
            })?;

        let handle = parse_run_task_output(output.tasks(), output.failures())?;
        info!(slug = %task.slug, task = %handle.0, "Build task started");
        Ok(handle)
    }

    fn name(&self) -> &'static str {
        "ecs"
    }
}
