//! Runtime configuration
//!
//! Plain structs filled from CLI flags and environment in `main.rs`. The
//! library never reads the process environment itself.

use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::{
    Error, DEFAULT_ACCOUNT_PREFIX_LEN, DEFAULT_COMPUTE_NAMESPACE, DEFAULT_PLATFORM_NAMESPACE,
    DEFAULT_PORT, DEFAULT_USER_HOST, DEFAULT_WEB_IDENTITY_TOKEN_FILE,
};

/// Grant service configuration
#[derive(Clone, Debug)]
pub struct ServiceConfig {
    /// Address the HTTP server binds
    pub listen_addr: SocketAddr,
    /// Namespace holding the mapping ConfigMaps
    pub platform_namespace: String,
    /// Namespace where compute pods run
    pub compute_namespace: String,
    /// OIDC provider of the cluster, e.g. `oidc.eks.<region>.amazonaws.com/id/<id>`
    pub oidc_provider: String,
    /// Base URL of the user API
    pub user_host: String,
    /// Length of the system prefix on pod service account names
    pub account_prefix_len: usize,
    /// Token file written into generated profiles
    pub web_identity_token_file: String,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            listen_addr: SocketAddr::from(([0, 0, 0, 0], DEFAULT_PORT)),
            platform_namespace: DEFAULT_PLATFORM_NAMESPACE.to_string(),
            compute_namespace: DEFAULT_COMPUTE_NAMESPACE.to_string(),
            oidc_provider: String::new(),
            user_host: DEFAULT_USER_HOST.to_string(),
            account_prefix_len: DEFAULT_ACCOUNT_PREFIX_LEN,
            web_identity_token_file: DEFAULT_WEB_IDENTITY_TOKEN_FILE.to_string(),
        }
    }
}

impl ServiceConfig {
    /// Reject configurations the service cannot run with
    pub fn validate(&self) -> Result<(), Error> {
        if self.oidc_provider.trim().is_empty() {
            return Err(Error::config("OIDC provider must be set"));
        }
        if self.oidc_provider.contains("://") {
            return Err(Error::config(
                "OIDC provider must be given without a URL scheme",
            ));
        }
        if self.platform_namespace.is_empty() || self.compute_namespace.is_empty() {
            return Err(Error::config("namespaces must not be empty"));
        }
        Ok(())
    }
}

/// In-pod agent configuration
#[derive(Clone, Debug)]
pub struct AgentConfig {
    /// Grant endpoint URL
    pub endpoint: String,
    /// Downward API file with the pod's labels
    pub pod_info_path: PathBuf,
    /// File holding the platform bearer token
    pub token_file: PathBuf,
    /// Where the AWS config file is written
    pub aws_config_file: PathBuf,
    /// Delay between failed attempts
    pub retry_interval: Duration,
    /// Interval between keep-alive log lines once the file is written
    pub keep_alive_interval: Duration,
}

impl AgentConfig {
    /// Prefix every file path with `root`
    ///
    /// Paths are joined as strings so absolute paths stay under `root`.
    pub fn rooted(mut self, root: &Path) -> Self {
        let prefix = |p: &Path| {
            let mut joined = root.as_os_str().to_owned();
            joined.push(p.as_os_str());
            PathBuf::from(joined)
        };
        self.pod_info_path = prefix(&self.pod_info_path);
        self.token_file = prefix(&self.token_file);
        self.aws_config_file = prefix(&self.aws_config_file);
        self
    }
}
