//! Job executors: local shell commands and remote HTTP calls.

use std::time::Duration;

use {
    async_trait::async_trait,
    cadence_config::RemoteConfig,
    reqwest::{
        Client, Method,
        header::{HeaderMap, HeaderName, HeaderValue},
    },
    tokio::process::Command,
    tracing::debug,
};

use crate::{
    Context, Error, Result,
    types::{Job, JobKind, RemoteProperties},
};

/// Longest output kept on a run record.
const MAX_OUTPUT_CHARS: usize = 4096;

/// What a successful attempt produced.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ExecutionOutput {
    pub output: Option<String>,
}

/// Runs one attempt of a job.
#[async_trait]
pub trait Executor: Send + Sync {
    async fn execute(&self, job: &Job) -> Result<ExecutionOutput>;
}

fn truncate(text: &str) -> String {
    match text.char_indices().nth(MAX_OUTPUT_CHARS) {
        Some((idx, _)) => format!("{}…", &text[..idx]),
        None => text.to_string(),
    }
}

/// Runs `sh -c <command>` and waits for it to exit.
#[derive(Debug, Default, Clone)]
pub struct LocalExecutor;

impl LocalExecutor {
    pub async fn run(&self, command: &str) -> Result<ExecutionOutput> {
        let output = Command::new("sh")
            .args(["-c", command])
            .kill_on_drop(true)
            .output()
            .await
            .map_err(|e| Error::execution(format!("failed to spawn sh: {e}")))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            let stderr = stderr.trim();
            let status = match output.status.code() {
                Some(code) => format!("exited with code {code}"),
                None => "terminated by signal".to_string(),
            };
            return Err(if stderr.is_empty() {
                Error::execution(status)
            } else {
                Error::execution(format!("{status}: {}", truncate(stderr)))
            });
        }

        let stdout = String::from_utf8_lossy(&output.stdout);
        let stdout = stdout.trim();
        Ok(ExecutionOutput {
            output: (!stdout.is_empty()).then(|| truncate(stdout)),
        })
    }
}

/// Issues the HTTP request described by a remote job.
#[derive(Debug, Clone)]
pub struct RemoteExecutor {
    client: Client,
    default_timeout: Duration,
}

impl RemoteExecutor {
    pub fn new(config: &RemoteConfig) -> Result<Self> {
        let client = Client::builder()
            .user_agent(config.user_agent.as_str())
            .build()
            .context("failed to build HTTP client")?;
        Ok(Self {
            client,
            default_timeout: Duration::from_secs(config.timeout_secs),
        })
    }

    pub async fn run(&self, props: &RemoteProperties) -> Result<ExecutionOutput> {
        let method = Method::from_bytes(props.method.to_ascii_uppercase().as_bytes())
            .map_err(|_| Error::invalid_job(format!("invalid http method: {}", props.method)))?;

        let mut headers = HeaderMap::new();
        for (name, value) in &props.headers {
            let name = HeaderName::from_bytes(name.as_bytes())
                .map_err(|e| Error::invalid_job(format!("invalid header name '{name}': {e}")))?;
            let value = HeaderValue::from_str(value)
                .map_err(|e| Error::invalid_job(format!("invalid header value: {e}")))?;
            headers.insert(name, value);
        }

        let timeout = props
            .timeout_secs
            .map_or(self.default_timeout, Duration::from_secs);
        let mut request = self
            .client
            .request(method, &props.url)
            .headers(headers)
            .timeout(timeout);
        if let Some(body) = &props.body {
            request = request.body(body.clone());
        }

        debug!(url = %props.url, method = %props.method, "sending remote job request");
        let response = request
            .send()
            .await
            .map_err(|e| Error::execution(format!("request to {} failed: {e}", props.url)))?;

        let status = response.status();
        let accepted = if props.expected_response_codes.is_empty() {
            status.is_success()
        } else {
            props.expected_response_codes.contains(&status.as_u16())
        };
        if !accepted {
            return Err(Error::execution(format!(
                "unexpected response status {status} from {}",
                props.url
            )));
        }
        Ok(ExecutionOutput {
            output: Some(status.to_string()),
        })
    }
}

/// Default executor: local jobs to [`LocalExecutor`], remote jobs to
/// [`RemoteExecutor`].
#[derive(Debug, Clone)]
pub struct JobExecutor {
    local: LocalExecutor,
    remote: RemoteExecutor,
}

impl JobExecutor {
    pub fn new(config: &RemoteConfig) -> Result<Self> {
        Ok(Self {
            local: LocalExecutor,
            remote: RemoteExecutor::new(config)?,
        })
    }
}

#[async_trait]
impl Executor for JobExecutor {
    async fn execute(&self, job: &Job) -> Result<ExecutionOutput> {
        match &job.kind {
            JobKind::Local { command } => self.local.run(command).await,
            JobKind::Remote(props) => self.remote.run(props).await,
        }
    }
}
