//! Identity resolution for compute workloads
//!
//! Given an execution id and the requesting user, finds the pod that runs the
//! execution and returns its service account as a [`ComputeIdentity`]. The same
//! scan collects the service accounts of every pod in the `Running` phase into
//! a [`RunningIdentitySet`], which the trust policy reconciler uses to prune
//! grants for pods that no longer exist.
//!
//! # Identity Forms
//!
//! Pod service accounts carry a fixed-length system prefix. Stripping it gives
//! the account name. Trust policies list subjects in the form
//! `*:<namespace>:<name>`; the leading `*` stands in for the token issuer part of
//! the federated subject so the same string matches however the issuer renders it.
//! Subjects in the older `*<name>` form carry no separators, never match the
//! running set, and are pruned by the first grant that touches their role.
//!
//! No state is kept between calls: each resolution lists pods fresh.

use std::collections::BTreeSet;
use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use k8s_openapi::api::core::v1::Pod;
use kube::api::{Api, ListParams};
use kube::Client;
#[cfg(test)]
use mockall::automock;
use tracing::debug;

use crate::{Error, EXECUTION_ID_LABEL, STARTING_USER_ID_LABEL};

/// Pod phase that counts toward the running set
const RUNNING_PHASE: &str = "running";

/// Wildcard that replaces the issuer part of a federated subject
const SUBJECT_WILDCARD: &str = "*";

/// Strip the fixed-length system prefix from a pod's service account name
///
/// Returns `None` when the account is not longer than the prefix or the prefix
/// would split a character.
pub fn strip_account_prefix(account: &str, prefix_len: usize) -> Option<&str> {
    match account.get(prefix_len..) {
        Some(name) if !name.is_empty() => Some(name),
        _ => None,
    }
}

/// Remove the wildcard and namespace segments from a subject
///
/// `*:ns:run-abc` becomes `run-abc`. A subject without separators is returned
/// unchanged.
pub fn unwildcard(subject: &str) -> &str {
    subject.rsplit(':').next().unwrap_or(subject)
}

/// Service identity of a compute workload
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct ComputeIdentity {
    namespace: String,
    name: String,
}

impl ComputeIdentity {
    /// Create an identity from a namespace and an already prefix-stripped name
    pub fn new(namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
            name: name.into(),
        }
    }

    /// Build an identity from a raw pod service account name
    pub fn from_account(namespace: &str, account: &str, prefix_len: usize) -> Option<Self> {
        strip_account_prefix(account, prefix_len).map(|name| Self::new(namespace, name))
    }

    /// Namespace the workload runs in
    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    /// Prefix-stripped account name
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Wildcarded subject as it appears in trust policies
    pub fn subject(&self) -> String {
        format!("{}:{}:{}", SUBJECT_WILDCARD, self.namespace, self.name)
    }
}

impl fmt::Display for ComputeIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.subject())
    }
}

/// Account names (prefix-stripped) of every running pod at scan time
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct RunningIdentitySet(BTreeSet<String>);

impl RunningIdentitySet {
    /// Create an empty set
    pub fn new() -> Self {
        Self::default()
    }

    /// Add an account name
    pub fn insert(&mut self, name: impl Into<String>) {
        self.0.insert(name.into());
    }

    /// Whether the account name is running
    pub fn contains(&self, name: &str) -> bool {
        self.0.contains(name)
    }

    /// Whether the workload behind a wildcarded subject is running
    pub fn contains_subject(&self, subject: &str) -> bool {
        self.contains(unwildcard(subject))
    }

    /// Number of running accounts
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// Whether no account is running
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Iterate over the account names in sorted order
    pub fn iter(&self) -> impl Iterator<Item = &str> {
        self.0.iter().map(String::as_str)
    }
}

impl<S: Into<String>> FromIterator<S> for RunningIdentitySet {
    fn from_iter<I: IntoIterator<Item = S>>(iter: I) -> Self {
        Self(iter.into_iter().map(Into::into).collect())
    }
}

/// Outcome of a single pod scan
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Resolution {
    /// Identity of the pod matching the execution and user, if any
    pub identity: Option<ComputeIdentity>,
    /// Accounts of all running pods in the namespace
    pub running: RunningIdentitySet,
}

/// Trait abstracting pod listing
///
/// Allows mocking the Kubernetes API in tests.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait PodLister: Send + Sync {
    /// List every pod in a namespace
    async fn list_pods(&self, namespace: &str) -> Result<Vec<Pod>, Error>;
}

/// Pod lister backed by the Kubernetes API
pub struct KubePodLister {
    client: Client,
}

impl KubePodLister {
    /// Create a new lister wrapping the given kube Client
    pub fn new(client: Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl PodLister for KubePodLister {
    async fn list_pods(&self, namespace: &str) -> Result<Vec<Pod>, Error> {
        let api: Api<Pod> = Api::namespaced(self.client.clone(), namespace);
        let pods = api.list(&ListParams::default()).await?;
        Ok(pods.items)
    }
}

fn service_account(pod: &Pod) -> Option<&str> {
    let spec = pod.spec.as_ref()?;
    spec.service_account_name
        .as_deref()
        .or(spec.service_account.as_deref())
}

fn is_running(pod: &Pod) -> bool {
    pod.status
        .as_ref()
        .and_then(|s| s.phase.as_deref())
        .map(|phase| phase.eq_ignore_ascii_case(RUNNING_PHASE))
        .unwrap_or(false)
}

fn matches_execution(pod: &Pod, user_id: &str, execution_id: &str) -> bool {
    let Some(labels) = pod.metadata.labels.as_ref() else {
        return false;
    };
    labels.get(EXECUTION_ID_LABEL).map(String::as_str) == Some(execution_id)
        && labels.get(STARTING_USER_ID_LABEL).map(String::as_str) == Some(user_id)
}

/// Scan a pod list for the requested workload and the running set
///
/// Every pod is visited even after a match so the running set is complete.
/// A matching pod does not need to be running: its role configuration is
/// provisioned before it reaches that phase.
pub fn scan_pods(
    pods: &[Pod],
    namespace: &str,
    user_id: &str,
    execution_id: &str,
    prefix_len: usize,
) -> Resolution {
    let mut resolution = Resolution::default();

    for pod in pods {
        let Some(account) = service_account(pod) else {
            continue;
        };

        if is_running(pod) {
            if let Some(name) = strip_account_prefix(account, prefix_len) {
                resolution.running.insert(name);
            }
        }

        if resolution.identity.is_none() && matches_execution(pod, user_id, execution_id) {
            resolution.identity = ComputeIdentity::from_account(namespace, account, prefix_len);
        }
    }

    resolution
}

/// Resolves compute identities from the current pod list
pub struct IdentityResolver {
    pods: Arc<dyn PodLister>,
    prefix_len: usize,
}

impl IdentityResolver {
    /// Create a resolver stripping `prefix_len` characters from account names
    pub fn new(pods: Arc<dyn PodLister>, prefix_len: usize) -> Self {
        Self { pods, prefix_len }
    }

    /// Find the pod for `execution_id` started by `user_id`, and the running set
    ///
    /// Lists pods exactly once. A missing match is reported as `identity: None`
    /// rather than an error so callers decide how to surface it.
    pub async fn resolve(
        &self,
        user_id: &str,
        execution_id: &str,
        namespace: &str,
    ) -> Result<Resolution, Error> {
        let pods = self.pods.list_pods(namespace).await?;
        let resolution = scan_pods(&pods, namespace, user_id, execution_id, self.prefix_len);

        debug!(
            namespace = %namespace,
            execution_id = %execution_id,
            pods = pods.len(),
            running = resolution.running.len(),
            matched = resolution.identity.is_some(),
            "Scanned pods for compute identity"
        );

        Ok(resolution)
    }
}
