//! AWS shared-config profiles handed to a pod
//!
//! Each granted role becomes two profiles: `src_<name>` assumes the federated
//! role with the pod's web identity token, and `<name>` chains from it into the
//! resource role.

use std::fmt::Write;

use serde::{Deserialize, Serialize};

use crate::catalog::RoleBinding;

/// One role the pod can assume
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct RoleProfile {
    /// Profile name (the resource role name)
    pub name: String,
    /// Resource role ARN
    pub role_arn: String,
    /// Federated role ARN assumed with the web identity token
    pub federated_role_arn: String,
}

impl From<&RoleBinding> for RoleProfile {
    fn from(binding: &RoleBinding) -> Self {
        Self {
            name: binding.name.clone(),
            role_arn: binding.role_arn.clone(),
            federated_role_arn: binding.federated_role_arn.clone(),
        }
    }
}

/// Render profiles into an AWS config file
pub fn render_aws_config(profiles: &[RoleProfile], web_identity_token_file: &str) -> String {
    let mut out = String::new();
    for p in profiles {
        // Writing to a String cannot fail
        let _ = writeln!(out, "[profile {}]", p.name);
        let _ = writeln!(out, "source_profile = src_{}", p.name);
        let _ = writeln!(out, "role_arn={}", p.role_arn);
        let _ = writeln!(out, "[profile src_{}]", p.name);
        let _ = writeln!(out, "web_identity_token_file = {}", web_identity_token_file);
        let _ = writeln!(out, "role_arn={}", p.federated_role_arn);
    }
    out
}
