//! IAM role to service account mapping
//!
//! Grants short-lived compute pods the right to assume cloud IAM roles by
//! editing each role's federated trust policy so it lists the calling pod's
//! service account as an allowed subject. Every grant also prunes subjects
//! whose pods are no longer running, so the allow-list stays bounded.
//!
//! # Flow
//!
//! 1. [`identity`] lists pods and finds the caller's pod plus the running set
//! 2. [`catalog`] resolves which roles the caller's organizations grant
//! 3. [`trust`] reconciles each role's trust policy
//! 4. [`coordinator`] runs the three steps above under one process-wide lock
//!
//! # Modules
//!
//! - [`identity`] - Compute identities and pod scanning
//! - [`catalog`] - Organization grants and role name mappings
//! - [`trust`] - Trust policy documents and reconciliation
//! - [`coordinator`] - Serialized grant workflow
//! - [`oracle`] - User and organization lookups
//! - [`profile`] - AWS shared-config profiles produced for the pod
//! - [`server`] - HTTP endpoints
//! - [`agent`] - In-pod poller that fetches and writes the profile file
//! - [`retry`] - Fixed-interval retry for outer loops
//! - [`config`] - Runtime configuration
//! - [`error`] - Error types

#![deny(missing_docs)]

pub mod agent;
pub mod catalog;
pub mod config;
pub mod coordinator;
pub mod error;
pub mod identity;
pub mod oracle;
pub mod profile;
pub mod retry;
pub mod server;
pub mod trust;

pub use error::Error;

/// Result type alias using our custom Error type
pub type Result<T> = std::result::Result<T, Error>;

// =============================================================================
// Default Configuration Constants
// =============================================================================

/// Namespace holding the mapping ConfigMaps
pub const DEFAULT_PLATFORM_NAMESPACE: &str = "domino-platform";

/// Namespace where compute pods run
pub const DEFAULT_COMPUTE_NAMESPACE: &str = "domino-compute";

/// Length of the system prefix on pod service account names
pub const DEFAULT_ACCOUNT_PREFIX_LEN: usize = 4;

/// Default port for the HTTP server
pub const DEFAULT_PORT: u16 = 6000;

/// Default base URL of the identity oracle
pub const DEFAULT_USER_HOST: &str = "http://nucleus-frontend.domino-platform:80";

/// Projected service account token used for web identity role assumption
pub const DEFAULT_WEB_IDENTITY_TOKEN_FILE: &str =
    "/var/run/secrets/eks.amazonaws.com/serviceaccount/token";

/// Pod label carrying the execution id
pub const EXECUTION_ID_LABEL: &str = "dominodatalab.com/execution-id";

/// Pod label carrying the id of the user who started the execution
pub const STARTING_USER_ID_LABEL: &str = "dominodatalab.com/starting-user-id";

/// ConfigMap mapping organizations to resource role ARNs
pub const ORG_ROLE_MAPPING_CONFIG_MAP: &str = "domino-org-iamrole-mapping";

/// ConfigMap mapping resource role names to federated role ARNs
pub const ROLE_NAME_MAPPING_CONFIG_MAP: &str = "resource-role-to-eks-role-mapping";

/// Field manager used for ConfigMap patches
pub const FIELD_MANAGER: &str = "iam-sa-mapping";
