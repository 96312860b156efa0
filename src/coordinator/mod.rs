//! Serialized grant workflow
//!
//! Trust policy updates are unconditional overwrites with no version check,
//! so two grants racing on the same role would lose one another's subjects.
//! The coordinator runs every grant (pod scan, role resolution and all policy
//! writes) under a single process-wide lock. Calls complete in lock order: a
//! call's pruning is visible to the next call's policy read.
//!
//! A stuck downstream call holds the lock and blocks later grants. Grants
//! happen once per pod start, so throughput is not a concern.

use std::sync::Arc;

use tokio::sync::Mutex;
use tracing::{info, instrument};

use crate::catalog::RoleCatalog;
use crate::identity::IdentityResolver;
use crate::oracle::Credentials;
use crate::profile::RoleProfile;
use crate::trust::{GrantOutcome, TrustPolicyReconciler};
use crate::Error;

/// Authenticated caller of a grant
#[derive(Clone, Debug)]
pub struct Caller {
    /// Canonical user id, compared against the starting-user pod label
    pub user_id: String,
    /// Credentials forwarded to the user API for membership lookups
    pub credentials: Credentials,
}

/// Runs grants one at a time
pub struct Coordinator {
    lock: Mutex<()>,
    resolver: IdentityResolver,
    catalog: Arc<RoleCatalog>,
    reconciler: TrustPolicyReconciler,
}

impl Coordinator {
    /// Create a coordinator over the three grant stages
    pub fn new(
        resolver: IdentityResolver,
        catalog: Arc<RoleCatalog>,
        reconciler: TrustPolicyReconciler,
    ) -> Self {
        Self {
            lock: Mutex::new(()),
            resolver,
            catalog,
            reconciler,
        }
    }

    /// Grant the caller's pod every role its organizations allow
    ///
    /// Returns one profile per role. If no pod matches `execution_id` for the
    /// caller, fails with [`Error::NotFound`] before any role is looked up or
    /// any policy is read. The first fault aborts the remaining roles; roles
    /// already reconciled keep their grant, and a retry converges.
    #[instrument(skip(self, caller), fields(user_id = %caller.user_id))]
    pub async fn grant_roles(
        &self,
        caller: &Caller,
        execution_id: &str,
        namespace: &str,
        platform_namespace: &str,
    ) -> Result<Vec<RoleProfile>, Error> {
        let _guard = self.lock.lock().await;

        let resolution = self
            .resolver
            .resolve(&caller.user_id, execution_id, namespace)
            .await?;
        let identity = resolution.identity.ok_or_else(|| {
            Error::not_found(format!(
                "no pod found with run id {} for the user",
                execution_id
            ))
        })?;

        let bindings = self
            .catalog
            .bindings(&caller.credentials, platform_namespace)
            .await?;

        let mut profiles = Vec::with_capacity(bindings.len());
        for binding in &bindings {
            let outcome = self
                .reconciler
                .ensure_granted(binding.federated_role_name(), &identity, &resolution.running)
                .await?;
            if let GrantOutcome::Updated { pruned, .. } = &outcome {
                info!(
                    role = %binding.name,
                    federated_role = %binding.federated_role_name(),
                    pruned = pruned.len(),
                    "Granted role to pod"
                );
            }
            profiles.push(RoleProfile::from(binding));
        }

        info!(
            subject = %identity,
            roles = profiles.len(),
            "Grant complete"
        );
        Ok(profiles)
    }
}
