//! Trust policy reconciliation
//!
//! Each federated role has a trust policy whose first statement carries a
//! `StringLike` condition on `<oidc-provider>:sub`. The value of that key is the
//! subject allow-list: the service accounts allowed to assume the role.
//!
//! # Reconciliation
//!
//! [`TrustPolicyReconciler::ensure_granted`] reads the policy, and if the
//! candidate subject is already listed it stops without writing. Otherwise it
//! writes a new list made of the candidate followed by every existing subject
//! whose pod is still running. Subjects of pods that are gone are dropped in the
//! same write, so no separate sweep is needed.
//!
//! The policy update is an unconditional overwrite. Callers must serialize
//! reconciliations (see [`crate::coordinator`]). Faults are never retried here.
//!
//! # Condition Value Shapes
//!
//! The condition value may be a bare string or a list of strings. Both are read
//! as an ordered list; writes always use the list form.

mod aws;

use std::sync::Arc;

use async_trait::async_trait;
#[cfg(test)]
use mockall::automock;
use serde::Deserialize;
use serde_json::Value;
use tracing::{debug, info};

use crate::identity::{unwildcard, ComputeIdentity, RunningIdentitySet};
use crate::Error;

pub use aws::AwsIamClient;

/// Condition operator holding the subject allow-list
const CONDITION_OPERATOR: &str = "StringLike";

/// Condition key for the federated subject of an OIDC provider
pub fn subject_condition_key(oidc_provider: &str) -> String {
    format!("{}:sub", oidc_provider)
}

/// Raw condition value as stored in the policy
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
enum ConditionValue {
    Single(String),
    Multiple(Vec<String>),
}

impl ConditionValue {
    fn into_vec(self) -> Vec<String> {
        match self {
            ConditionValue::Single(s) => vec![s],
            ConditionValue::Multiple(v) => v,
        }
    }
}

/// Ordered list of subjects allowed to assume a role
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct SubjectAllowList(Vec<String>);

impl SubjectAllowList {
    /// Create a list from subjects in order
    pub fn new(subjects: Vec<String>) -> Self {
        Self(subjects)
    }

    /// Whether the exact subject is listed
    pub fn contains(&self, subject: &str) -> bool {
        self.0.iter().any(|s| s == subject)
    }

    /// Subjects in policy order
    pub fn as_slice(&self) -> &[String] {
        &self.0
    }

    /// Number of subjects
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// Whether the list is empty
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

/// Compute the allow-list that grants `candidate`
///
/// Returns `None` when `candidate` is already listed. Otherwise the result
/// starts with `candidate` and keeps each other subject only if its pod is in
/// `running`, without duplicates and in their existing order.
pub fn reconcile_subjects(
    existing: &SubjectAllowList,
    candidate: &str,
    running: &RunningIdentitySet,
) -> Option<SubjectAllowList> {
    if existing.contains(candidate) {
        return None;
    }

    let mut subjects = vec![candidate.to_string()];
    for subject in existing.as_slice() {
        if running.contains_subject(subject) && !subjects.contains(subject) {
            subjects.push(subject.clone());
        }
    }

    Some(SubjectAllowList(subjects))
}

/// Assume-role policy document of a single role
///
/// Kept as raw JSON so fields this crate does not manage are written back
/// untouched.
#[derive(Clone, Debug)]
pub struct TrustPolicyDocument {
    role: String,
    condition_key: String,
    document: Value,
}

impl TrustPolicyDocument {
    /// Parse a policy document for `role` using the subject key of `oidc_provider`
    pub fn parse(role: &str, json: &str, oidc_provider: &str) -> Result<Self, Error> {
        let document: Value = serde_json::from_str(json).map_err(|e| {
            Error::malformed_policy(role, format!("policy is not valid JSON: {}", e))
        })?;

        Ok(Self {
            role: role.to_string(),
            condition_key: subject_condition_key(oidc_provider),
            document,
        })
    }

    /// Role the document belongs to
    pub fn role(&self) -> &str {
        &self.role
    }

    /// Current subject allow-list
    pub fn subjects(&self) -> Result<SubjectAllowList, Error> {
        let value = self.condition().and_then(|c| {
            c.get(&self.condition_key).ok_or_else(|| {
                self.malformed(format!(
                    "{} has no {} key",
                    CONDITION_OPERATOR, self.condition_key
                ))
            })
        })?;

        let parsed: ConditionValue = serde_json::from_value(value.clone()).map_err(|_| {
            self.malformed(format!(
                "{} must be a string or a list of strings",
                self.condition_key
            ))
        })?;

        Ok(SubjectAllowList(parsed.into_vec()))
    }

    /// Replace the subject allow-list, always in list form
    pub fn set_subjects(&mut self, subjects: &SubjectAllowList) -> Result<(), Error> {
        let key = self.condition_key.clone();
        let list = Value::Array(subjects.0.iter().cloned().map(Value::String).collect());

        let condition = self.condition_mut()?;
        condition.insert(key, list);
        Ok(())
    }

    /// Serialize for the policy update call
    pub fn to_json(&self) -> Result<String, Error> {
        Ok(serde_json::to_string(&self.document)?)
    }

    fn malformed(&self, message: String) -> Error {
        Error::malformed_policy(&self.role, message)
    }

    fn first_statement(&self) -> Result<&Value, Error> {
        match self.document.get("Statement") {
            Some(Value::Array(statements)) => statements
                .first()
                .ok_or_else(|| self.malformed("Statement is empty".to_string())),
            Some(statement @ Value::Object(_)) => Ok(statement),
            _ => Err(self.malformed("document has no Statement".to_string())),
        }
    }

    fn condition(&self) -> Result<&serde_json::Map<String, Value>, Error> {
        self.first_statement()?
            .get("Condition")
            .ok_or_else(|| self.malformed("Statement[0] has no Condition".to_string()))?
            .get(CONDITION_OPERATOR)
            .and_then(Value::as_object)
            .ok_or_else(|| {
                self.malformed(format!("Condition has no {} block", CONDITION_OPERATOR))
            })
    }

    fn condition_mut(&mut self) -> Result<&mut serde_json::Map<String, Value>, Error> {
        // Validate the shape with shared borrows first so errors can name the role
        self.condition()?;

        let statement = match self.document.get_mut("Statement") {
            Some(Value::Array(statements)) => statements.first_mut(),
            Some(statement @ Value::Object(_)) => Some(statement),
            _ => None,
        };

        statement
            .and_then(|s| s.get_mut("Condition"))
            .and_then(|c| c.get_mut(CONDITION_OPERATOR))
            .and_then(Value::as_object_mut)
            .ok_or_else(|| Error::malformed_policy(&self.role, "Condition block vanished"))
    }
}

/// Trait abstracting the cloud IAM role API
///
/// Allows mocking IAM in tests.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait IamClient: Send + Sync {
    /// Fetch the decoded assume-role policy document of a role
    async fn get_trust_policy(&self, role_name: &str) -> Result<String, Error>;

    /// Overwrite the assume-role policy document of a role
    async fn update_trust_policy(&self, role_name: &str, document: &str) -> Result<(), Error>;
}

/// Result of a single reconciliation
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum GrantOutcome {
    /// The subject was already listed; nothing was written
    AlreadyGranted,
    /// The policy was rewritten
    Updated {
        /// Allow-list that was written
        subjects: Vec<String>,
        /// Previous subjects dropped because their pods are no longer running
        pruned: Vec<String>,
    },
}

/// Reconciles role trust policies against the running set
pub struct TrustPolicyReconciler {
    iam: Arc<dyn IamClient>,
    oidc_provider: String,
}

impl TrustPolicyReconciler {
    /// Create a reconciler for subjects issued by `oidc_provider`
    pub fn new(iam: Arc<dyn IamClient>, oidc_provider: impl Into<String>) -> Self {
        Self {
            iam,
            oidc_provider: oidc_provider.into(),
        }
    }

    /// Ensure `candidate` may assume `role_name`
    ///
    /// Performs at most one policy write. Calling again with the same inputs
    /// performs none.
    pub async fn ensure_granted(
        &self,
        role_name: &str,
        candidate: &ComputeIdentity,
        running: &RunningIdentitySet,
    ) -> Result<GrantOutcome, Error> {
        let json = self.iam.get_trust_policy(role_name).await?;
        let mut policy = TrustPolicyDocument::parse(role_name, &json, &self.oidc_provider)?;
        let existing = policy.subjects()?;

        let subject = candidate.subject();
        let Some(updated) = reconcile_subjects(&existing, &subject, running) else {
            debug!(role = %role_name, subject = %subject, "Subject already granted");
            return Ok(GrantOutcome::AlreadyGranted);
        };

        let pruned: Vec<String> = existing
            .as_slice()
            .iter()
            .filter(|s| !updated.contains(s))
            .cloned()
            .collect();

        policy.set_subjects(&updated)?;
        self.iam
            .update_trust_policy(role_name, &policy.to_json()?)
            .await?;

        let pruned_names: Vec<&str> = pruned.iter().map(|s| unwildcard(s)).collect();
        info!(
            role = %role_name,
            subject = %subject,
            subjects = updated.len(),
            pruned = ?pruned_names,
            "Trust policy updated"
        );

        Ok(GrantOutcome::Updated {
            subjects: updated.0,
            pruned,
        })
    }
}
