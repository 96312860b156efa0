//! IAM client backed by the AWS SDK

use async_trait::async_trait;
use aws_sdk_iam::error::DisplayErrorContext;
use aws_sdk_iam::Client;
use tracing::debug;

use super::IamClient;
use crate::Error;

/// IAM role API client using the default AWS credential chain
#[derive(Clone, Debug)]
pub struct AwsIamClient {
    client: Client,
}

impl AwsIamClient {
    /// Create a client from a loaded SDK configuration
    pub fn new(sdk_config: &aws_config::SdkConfig) -> Self {
        Self {
            client: Client::new(sdk_config),
        }
    }
}

/// IAM returns policy documents URL-encoded
fn decode_policy_document(role_name: &str, encoded: &str) -> Result<String, Error> {
    urlencoding::decode(encoded)
        .map(|decoded| decoded.into_owned())
        .map_err(|e| {
            Error::malformed_policy(role_name, format!("policy is not valid UTF-8: {}", e))
        })
}

#[async_trait]
impl IamClient for AwsIamClient {
    async fn get_trust_policy(&self, role_name: &str) -> Result<String, Error> {
        let output = self
            .client
            .get_role()
            .role_name(role_name)
            .send()
            .await
            .map_err(|e| {
                let not_found = e
                    .as_service_error()
                    .map(|se| se.is_no_such_entity_exception())
                    .unwrap_or(false);
                if not_found {
                    Error::iam(format!("role {} does not exist", role_name))
                } else {
                    Error::iam(format!(
                        "GetRole {} failed: {}",
                        role_name,
                        DisplayErrorContext(&e)
                    ))
                }
            })?;

        let encoded = output
            .role()
            .and_then(|role| role.assume_role_policy_document())
            .ok_or_else(|| {
                Error::malformed_policy(role_name, "role has no assume-role policy document")
            })?;

        debug!(role = %role_name, "Fetched trust policy");
        decode_policy_document(role_name, encoded)
    }

    async fn update_trust_policy(&self, role_name: &str, document: &str) -> Result<(), Error> {
        self.client
            .update_assume_role_policy()
            .role_name(role_name)
            .policy_document(document)
            .send()
            .await
            .map_err(|e| {
                Error::iam(format!(
                    "UpdateAssumeRolePolicy {} failed: {}",
                    role_name,
                    DisplayErrorContext(&e)
                ))
            })?;

        Ok(())
    }
}
