//! Role catalog: which IAM roles a caller may assume
//!
//! Two ConfigMaps in the platform namespace drive role resolution:
//!
//! - `domino-org-iamrole-mapping`: organization name → resource role ARN
//! - `resource-role-to-eks-role-mapping`: resource role name → federated role ARN
//!
//! A caller is granted the resource roles of every organization they belong
//! to. Each resource role is assumed through its federated role, whose trust
//! policy lists the pod's service account. A resource role with no federated
//! role mapping yet is skipped: mappings are maintained by admins and may lag.

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use k8s_openapi::api::core::v1::ConfigMap;
use kube::api::{Api, Patch, PatchParams};
use kube::Client;
#[cfg(test)]
use mockall::automock;
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::oracle::{Credentials, IdentityOracle};
use crate::{Error, FIELD_MANAGER, ORG_ROLE_MAPPING_CONFIG_MAP, ROLE_NAME_MAPPING_CONFIG_MAP};

/// Role name of an IAM role ARN (the part after the last `/`)
///
/// `arn:aws:iam::123456789012:role/team/reader` → `reader`
pub fn role_name_from_arn(arn: &str) -> &str {
    arn.rsplit('/').next().unwrap_or(arn)
}

/// A role the caller may assume, with the federated role that fronts it
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RoleBinding {
    /// Resource role name, used as the profile name
    pub name: String,
    /// Resource role ARN the caller ultimately assumes
    pub role_arn: String,
    /// Federated role ARN assumed with the pod's web identity token
    pub federated_role_arn: String,
}

impl RoleBinding {
    /// Name of the federated role, whose trust policy is reconciled
    pub fn federated_role_name(&self) -> &str {
        role_name_from_arn(&self.federated_role_arn)
    }
}

/// Result of an organization mapping update
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct MappingChange {
    /// Organization that was mapped
    pub organization: String,
    /// Previous role ARN, if the organization was mapped before
    pub previous: Option<String>,
    /// Role ARN now mapped
    pub current: String,
}

/// Trait abstracting key/value configuration records
///
/// Allows mocking ConfigMap access in tests.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait ConfigStore: Send + Sync {
    /// Read the data of a record; a record without data reads as empty
    async fn read(&self, namespace: &str, name: &str) -> Result<BTreeMap<String, String>, Error>;

    /// Set one key of a record, returning the previous value
    async fn set_entry(
        &self,
        namespace: &str,
        name: &str,
        key: &str,
        value: &str,
    ) -> Result<Option<String>, Error>;
}

/// Configuration records stored as Kubernetes ConfigMaps
pub struct KubeConfigStore {
    client: Client,
}

impl KubeConfigStore {
    /// Create a new store wrapping the given kube Client
    pub fn new(client: Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl ConfigStore for KubeConfigStore {
    async fn read(&self, namespace: &str, name: &str) -> Result<BTreeMap<String, String>, Error> {
        let api: Api<ConfigMap> = Api::namespaced(self.client.clone(), namespace);
        let cm = api.get(name).await?;
        Ok(cm.data.unwrap_or_default())
    }

    async fn set_entry(
        &self,
        namespace: &str,
        name: &str,
        key: &str,
        value: &str,
    ) -> Result<Option<String>, Error> {
        let api: Api<ConfigMap> = Api::namespaced(self.client.clone(), namespace);
        let previous = api
            .get(name)
            .await?
            .data
            .and_then(|mut data| data.remove(key));

        let patch = serde_json::json!({
            "data": { key: value }
        });
        api.patch(name, &PatchParams::apply(FIELD_MANAGER), &Patch::Merge(&patch))
            .await?;

        Ok(previous)
    }
}

/// Resolves role grants from organization membership
pub struct RoleCatalog {
    store: Arc<dyn ConfigStore>,
    oracle: Arc<dyn IdentityOracle>,
}

impl RoleCatalog {
    /// Create a catalog reading records from `store` and memberships from `oracle`
    pub fn new(store: Arc<dyn ConfigStore>, oracle: Arc<dyn IdentityOracle>) -> Self {
        Self { store, oracle }
    }

    /// Resource role ARNs granted to the caller, keyed by organization
    pub async fn roles_for_user(
        &self,
        credentials: &Credentials,
        platform_namespace: &str,
    ) -> Result<BTreeMap<String, String>, Error> {
        let organizations = self.oracle.organizations(credentials).await?;
        let grants = self
            .store
            .read(platform_namespace, ORG_ROLE_MAPPING_CONFIG_MAP)
            .await?;

        Ok(project_grants(&organizations, &grants))
    }

    /// Concrete role bindings for the caller
    ///
    /// Roles without a federated role mapping are omitted.
    pub async fn bindings(
        &self,
        credentials: &Credentials,
        platform_namespace: &str,
    ) -> Result<Vec<RoleBinding>, Error> {
        let granted = self.roles_for_user(credentials, platform_namespace).await?;
        let federated = self
            .store
            .read(platform_namespace, ROLE_NAME_MAPPING_CONFIG_MAP)
            .await?;

        let bindings = resolve_bindings(granted.values().map(String::as_str), &federated);
        debug!(
            granted = granted.len(),
            bound = bindings.len(),
            "Resolved role bindings"
        );
        Ok(bindings)
    }

    /// Map an organization to a resource role ARN
    ///
    /// Callers must check admin rights first.
    pub async fn map_organization(
        &self,
        organization: &str,
        role_arn: &str,
        platform_namespace: &str,
    ) -> Result<MappingChange, Error> {
        let previous = self
            .store
            .set_entry(
                platform_namespace,
                ORG_ROLE_MAPPING_CONFIG_MAP,
                organization,
                role_arn,
            )
            .await?;

        info!(
            organization = %organization,
            previous = ?previous,
            current = %role_arn,
            "Organization role mapping updated"
        );

        Ok(MappingChange {
            organization: organization.to_string(),
            previous,
            current: role_arn.to_string(),
        })
    }
}

/// Keep the grants of organizations the caller belongs to
pub fn project_grants(
    organizations: &[String],
    grants: &BTreeMap<String, String>,
) -> BTreeMap<String, String> {
    organizations
        .iter()
        .filter_map(|org| grants.get(org).map(|arn| (org.clone(), arn.clone())))
        .collect()
}

/// Pair each granted resource role with its federated role
///
/// Resource roles are keyed by role name, so two organizations granting the
/// same role yield one binding. Output is sorted by role name.
pub fn resolve_bindings<'a>(
    role_arns: impl IntoIterator<Item = &'a str>,
    federated: &BTreeMap<String, String>,
) -> Vec<RoleBinding> {
    let by_name: BTreeMap<&str, &str> = role_arns
        .into_iter()
        .map(|arn| (role_name_from_arn(arn), arn))
        .collect();

    by_name
        .into_iter()
        .filter_map(|(name, arn)| match federated.get(name) {
            Some(federated_arn) => Some(RoleBinding {
                name: name.to_string(),
                role_arn: arn.to_string(),
                federated_role_arn: federated_arn.clone(),
            }),
            None => {
                warn!(role = %name, "No federated role mapped for resource role, skipping");
                None
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::oracle::MockIdentityOracle;
    use mockall::predicate::*;

    fn creds() -> Credentials {
        Credentials::Authorization("Bearer token".to_string())
    }

    fn map(entries: &[(&str, &str)]) -> BTreeMap<String, String> {
        entries
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    // =========================================================================
    // Name Resolution
    // =========================================================================

    #[test]
    fn role_name_is_after_last_slash() {
        assert_eq!(
            role_name_from_arn("arn:aws:iam::123456789012:role/reader"),
            "reader"
        );
        assert_eq!(
            role_name_from_arn("arn:aws:iam::123456789012:role/team/a/reader"),
            "reader"
        );
        assert_eq!(role_name_from_arn("reader"), "reader");
    }

    #[test]
    fn grants_are_projected_to_memberships() {
        let grants = map(&[
            ("data-science", "arn:aws:iam::1:role/ds-reader"),
            ("finance", "arn:aws:iam::1:role/fin-reader"),
        ]);
        let orgs = vec!["data-science".to_string(), "marketing".to_string()];

        let projected = project_grants(&orgs, &grants);

        assert_eq!(
            projected,
            map(&[("data-science", "arn:aws:iam::1:role/ds-reader")])
        );
    }

    #[test]
    fn bindings_pair_resource_and_federated_roles() {
        let federated = map(&[("ds-reader", "arn:aws:iam::1:role/eks-ds-reader")]);

        let bindings = resolve_bindings(["arn:aws:iam::1:role/ds-reader"], &federated);

        assert_eq!(
            bindings,
            vec![RoleBinding {
                name: "ds-reader".to_string(),
                role_arn: "arn:aws:iam::1:role/ds-reader".to_string(),
                federated_role_arn: "arn:aws:iam::1:role/eks-ds-reader".to_string(),
            }]
        );
        assert_eq!(bindings[0].federated_role_name(), "eks-ds-reader");
    }

    #[test]
    fn unmapped_roles_are_omitted_without_error() {
        let federated = map(&[("ds-reader", "arn:aws:iam::1:role/eks-ds-reader")]);

        let bindings = resolve_bindings(
            [
                "arn:aws:iam::1:role/ds-reader",
                "arn:aws:iam::1:role/new-role",
            ],
            &federated,
        );

        assert_eq!(bindings.len(), 1);
        assert_eq!(bindings[0].name, "ds-reader");
    }

    #[test]
    fn same_role_from_two_orgs_binds_once() {
        let federated = map(&[("shared", "arn:aws:iam::1:role/eks-shared")]);

        let bindings = resolve_bindings(
            ["arn:aws:iam::1:role/shared", "arn:aws:iam::1:role/shared"],
            &federated,
        );

        assert_eq!(bindings.len(), 1);
    }

    // =========================================================================
    // Catalog
    // =========================================================================

    #[tokio::test]
    async fn bindings_read_both_mappings() {
        let mut oracle = MockIdentityOracle::new();
        oracle
            .expect_organizations()
            .times(1)
            .returning(|_| Ok(vec!["data-science".to_string()]));

        let mut store = MockConfigStore::new();
        store
            .expect_read()
            .with(eq("platform"), eq(ORG_ROLE_MAPPING_CONFIG_MAP))
            .times(1)
            .returning(|_, _| Ok(map(&[("data-science", "arn:aws:iam::1:role/ds-reader")])));
        store
            .expect_read()
            .with(eq("platform"), eq(ROLE_NAME_MAPPING_CONFIG_MAP))
            .times(1)
            .returning(|_, _| Ok(map(&[("ds-reader", "arn:aws:iam::1:role/eks-ds-reader")])));

        let catalog = RoleCatalog::new(Arc::new(store), Arc::new(oracle));
        let bindings = catalog.bindings(&creds(), "platform").await.unwrap();

        assert_eq!(bindings.len(), 1);
        assert_eq!(bindings[0].federated_role_name(), "eks-ds-reader");
    }

    #[tokio::test]
    async fn user_without_memberships_has_no_roles() {
        let mut oracle = MockIdentityOracle::new();
        oracle.expect_organizations().returning(|_| Ok(vec![]));

        let mut store = MockConfigStore::new();
        store
            .expect_read()
            .returning(|_, _| Ok(map(&[("data-science", "arn:aws:iam::1:role/ds-reader")])));

        let catalog = RoleCatalog::new(Arc::new(store), Arc::new(oracle));
        let roles = catalog.roles_for_user(&creds(), "platform").await.unwrap();

        assert!(roles.is_empty());
    }

    #[tokio::test]
    async fn oracle_failure_propagates() {
        let mut oracle = MockIdentityOracle::new();
        oracle
            .expect_organizations()
            .returning(|_| Err(Error::oracle("connection refused")));
        let store = MockConfigStore::new();

        let catalog = RoleCatalog::new(Arc::new(store), Arc::new(oracle));
        let result = catalog.bindings(&creds(), "platform").await;

        assert!(matches!(result, Err(Error::Oracle(_))));
    }

    #[tokio::test]
    async fn map_organization_reports_previous_value() {
        let mut store = MockConfigStore::new();
        store
            .expect_set_entry()
            .with(
                eq("platform"),
                eq(ORG_ROLE_MAPPING_CONFIG_MAP),
                eq("finance"),
                eq("arn:aws:iam::1:role/fin-writer"),
            )
            .times(1)
            .returning(|_, _, _, _| Ok(Some("arn:aws:iam::1:role/fin-reader".to_string())));

        let catalog = RoleCatalog::new(Arc::new(store), Arc::new(MockIdentityOracle::new()));
        let change = catalog
            .map_organization("finance", "arn:aws:iam::1:role/fin-writer", "platform")
            .await
            .unwrap();

        assert_eq!(
            change.previous.as_deref(),
            Some("arn:aws:iam::1:role/fin-reader")
        );
        assert_eq!(change.current, "arn:aws:iam::1:role/fin-writer");
    }
}
