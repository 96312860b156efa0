//! In-pod agent
//!
//! Runs as a sidecar in every compute pod. It reads the pod's own labels from
//! the downward API file, asks the grant service for the pod's profiles, and
//! writes them to the AWS config file the workload reads. Attempts repeat at a
//! fixed interval until one succeeds; the agent then idles until interrupted.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
#[cfg(test)]
use mockall::automock;
use reqwest::StatusCode;
use serde::Serialize;
use tracing::{debug, info};

use crate::config::AgentConfig;
use crate::retry::{retry_at_interval, RetryConfig};
use crate::Error;

/// Downward API label naming the run
pub const RUN_NAME_LABEL: &str = "app.kubernetes.io/name";

/// Extract the run id from the pod-info properties file
///
/// The file holds one `key="value"` pair per line. The run id is the value of
/// [`RUN_NAME_LABEL`] without surrounding quotes and without its `run-` prefix.
pub fn parse_pod_info(contents: &str) -> Option<String> {
    contents
        .lines()
        .filter_map(|line| line.split_once('='))
        .find(|(key, _)| key.trim() == RUN_NAME_LABEL)
        .map(|(_, value)| {
            let value = value.trim().trim_matches('"');
            value.strip_prefix("run-").unwrap_or(value).to_string()
        })
        .filter(|run_id| !run_id.is_empty())
}

#[derive(Serialize)]
struct GrantRequest<'a> {
    run_id: &'a str,
}

/// Trait abstracting the call to the grant endpoint
///
/// Allows mocking the grant service in tests.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait ProfileFetcher: Send + Sync {
    /// Request the AWS config for `run_id`, authenticating with `token`
    async fn fetch(&self, run_id: &str, token: &str) -> Result<String, Error>;
}

/// Fetches profiles from the grant service over HTTP
pub struct HttpProfileFetcher {
    endpoint: String,
    http_client: reqwest::Client,
}

impl HttpProfileFetcher {
    /// Create a fetcher posting to `endpoint`
    pub fn new(endpoint: impl Into<String>) -> Result<Self, Error> {
        let http_client = reqwest::Client::builder()
            .timeout(Duration::from_secs(30))
            .build()
            .map_err(|e| Error::agent(format!("failed to build HTTP client: {}", e)))?;
        Ok(Self {
            endpoint: endpoint.into(),
            http_client,
        })
    }
}

#[async_trait]
impl ProfileFetcher for HttpProfileFetcher {
    async fn fetch(&self, run_id: &str, token: &str) -> Result<String, Error> {
        let response = self
            .http_client
            .post(&self.endpoint)
            .bearer_auth(token)
            .json(&GrantRequest { run_id })
            .send()
            .await
            .map_err(|e| Error::agent(format!("POST {} failed: {}", self.endpoint, e)))?;

        let status = response.status();
        let body = response
            .text()
            .await
            .map_err(|e| Error::agent(format!("failed to read response body: {}", e)))?;
        debug!(status = %status, "Grant endpoint responded");

        if status != StatusCode::OK {
            return Err(Error::agent(format!(
                "grant endpoint returned {}: {}",
                status, body
            )));
        }
        Ok(body)
    }
}

async fn read_file(path: &Path) -> Result<String, Error> {
    tokio::fs::read_to_string(path)
        .await
        .map_err(|e| Error::agent(format!("failed to read {}: {}", path.display(), e)))
}

/// Poll loop writing the pod's AWS config
pub struct Agent {
    config: AgentConfig,
    fetcher: Arc<dyn ProfileFetcher>,
}

impl Agent {
    /// Create an agent
    pub fn new(config: AgentConfig, fetcher: Arc<dyn ProfileFetcher>) -> Self {
        Self { config, fetcher }
    }

    /// Make one attempt: read inputs, fetch profiles, write the config file
    ///
    /// Inputs are re-read on every attempt since the downward API and token
    /// files may appear after the agent starts.
    pub async fn run_once(&self) -> Result<(), Error> {
        let pod_info = read_file(&self.config.pod_info_path).await?;
        let run_id = parse_pod_info(&pod_info).ok_or_else(|| {
            Error::agent(format!(
                "{} has no {} label",
                self.config.pod_info_path.display(),
                RUN_NAME_LABEL
            ))
        })?;
        let token = read_file(&self.config.token_file).await?;

        let aws_config = self.fetcher.fetch(&run_id, token.trim()).await?;

        tokio::fs::write(&self.config.aws_config_file, aws_config)
            .await
            .map_err(|e| {
                Error::agent(format!(
                    "failed to write {}: {}",
                    self.config.aws_config_file.display(),
                    e
                ))
            })?;
        info!(
            run_id = %run_id,
            path = %self.config.aws_config_file.display(),
            "Wrote AWS config"
        );
        Ok(())
    }

    /// Retry [`Agent::run_once`] at a fixed interval until it succeeds
    pub async fn provision(&self) -> Result<(), Error> {
        retry_at_interval(
            &RetryConfig::forever(self.config.retry_interval),
            "provision_aws_config",
            || self.run_once(),
        )
        .await
    }

    /// Provision, then stay alive until ctrl-c
    pub async fn run(&self) -> Result<(), Error> {
        self.provision().await?;

        let mut ticker = tokio::time::interval(self.config.keep_alive_interval);
        ticker.tick().await;
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    debug!("AWS config provisioned, idling");
                }
                _ = tokio::signal::ctrl_c() => {
                    info!("Received shutdown signal");
                    return Ok(());
                }
            }
        }
    }
}
