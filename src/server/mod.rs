//! HTTP endpoints
//!
//! Routes:
//! - `POST /map_iam_role_to_pod_sa` - Grant the caller's pod its roles, returns an AWS config
//! - `GET /get_my_roles` - Role ARNs granted to the caller, keyed by organization
//! - `POST /map_org_to_iam_role` - Map an organization to a role ARN (admin only)
//! - `GET /healthz` - Liveness probe
//!
//! Every route except `/healthz` forwards the caller's `Authorization` or
//! `X-Domino-Api-Key` header to the user API.

use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::sync::Arc;

use axum::extract::rejection::JsonRejection;
use axum::extract::State;
use axum::http::{header, HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::{Deserialize, Serialize};
use tracing::{debug, error, info};

use crate::catalog::{MappingChange, RoleCatalog};
use crate::config::ServiceConfig;
use crate::coordinator::{Caller, Coordinator};
use crate::oracle::{Credentials, IdentityOracle, API_KEY_HEADER};
use crate::profile::render_aws_config;
use crate::Error;

impl IntoResponse for Error {
    fn into_response(self) -> Response {
        let (status, message) = match &self {
            Error::NotFound(_) => (StatusCode::NOT_FOUND, self.to_string()),
            Error::Unauthorized(_) => (StatusCode::UNAUTHORIZED, self.to_string()),
            Error::Forbidden(_) => (StatusCode::FORBIDDEN, self.to_string()),
            Error::InvalidRequest(_) => (StatusCode::BAD_REQUEST, self.to_string()),
            Error::Kube(_) | Error::Iam(_) | Error::Oracle(_) => {
                (StatusCode::BAD_GATEWAY, self.to_string())
            }
            _ => {
                error!(error = %self, "Request failed");
                (StatusCode::INTERNAL_SERVER_ERROR, "internal error".to_string())
            }
        };

        (status, Json(serde_json::json!({"error": message}))).into_response()
    }
}

/// Shared state of the HTTP handlers
pub struct AppState {
    /// Serialized grant workflow
    pub coordinator: Arc<Coordinator>,
    /// Role catalog, also used by the coordinator
    pub catalog: Arc<RoleCatalog>,
    /// User API
    pub oracle: Arc<dyn IdentityOracle>,
    /// Service configuration
    pub config: ServiceConfig,
}

/// Body of `POST /map_iam_role_to_pod_sa`
#[derive(Debug, Deserialize)]
pub struct GrantRequest {
    /// Execution id of the calling pod
    pub run_id: String,
}

/// Body of `POST /map_org_to_iam_role`
#[derive(Debug, Default, Deserialize)]
pub struct MapOrganizationRequest {
    /// Organization name
    #[serde(default)]
    pub domino_org: Option<String>,
    /// Resource role ARN
    #[serde(default)]
    pub iam_role: Option<String>,
}

/// Body of `GET /get_my_roles`
#[derive(Debug, Serialize, Deserialize)]
pub struct RolesResponse {
    /// Role ARN per organization
    pub result: BTreeMap<String, String>,
}

/// Pick the caller's credentials, preferring `Authorization`
fn extract_credentials(headers: &HeaderMap) -> Result<Credentials, Error> {
    let value = |name: &str| -> Result<Option<String>, Error> {
        headers
            .get(name)
            .map(|v| {
                v.to_str()
                    .map(str::to_string)
                    .map_err(|_| {
                        Error::unauthorized(format!("{} header is not valid text", name))
                    })
            })
            .transpose()
    };

    if let Some(auth) = value(header::AUTHORIZATION.as_str())? {
        return Ok(Credentials::Authorization(auth));
    }
    if let Some(key) = value(API_KEY_HEADER)? {
        return Ok(Credentials::ApiKey(key));
    }
    Err(Error::unauthorized(format!(
        "missing Authorization or {} header",
        API_KEY_HEADER
    )))
}

fn non_empty(field: Option<String>) -> Option<String> {
    field.filter(|v| !v.trim().is_empty())
}

/// Grant endpoint handler
pub async fn grant_handler(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    payload: Result<Json<GrantRequest>, JsonRejection>,
) -> Result<Response, Error> {
    let credentials = extract_credentials(&headers)?;
    let Json(request) = payload.map_err(|e| Error::invalid_request(e.body_text()))?;
    debug!(run_id = %request.run_id, "Grant request received");

    let principal = state.oracle.principal(&credentials).await?;
    let caller = Caller {
        user_id: principal.canonical_id,
        credentials,
    };

    let profiles = state
        .coordinator
        .grant_roles(
            &caller,
            &request.run_id,
            &state.config.compute_namespace,
            &state.config.platform_namespace,
        )
        .await?;

    let body = render_aws_config(&profiles, &state.config.web_identity_token_file);
    Ok(([(header::CONTENT_TYPE, "text/plain; charset=utf-8")], body).into_response())
}

/// Role listing handler
pub async fn roles_handler(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
) -> Result<Json<RolesResponse>, Error> {
    let credentials = extract_credentials(&headers)?;
    let result = state
        .catalog
        .roles_for_user(&credentials, &state.config.platform_namespace)
        .await?;
    Ok(Json(RolesResponse { result }))
}

/// Organization mapping handler
///
/// Admin rights are checked before the payload is validated.
pub async fn map_organization_handler(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    payload: Result<Json<MapOrganizationRequest>, JsonRejection>,
) -> Result<Json<MappingChange>, Error> {
    let credentials = extract_credentials(&headers)?;
    let principal = state.oracle.principal(&credentials).await?;
    if !principal.is_admin {
        return Err(Error::forbidden(
            "only an admin can map organizations to IAM roles",
        ));
    }

    let Json(request) = payload.map_err(|e| Error::invalid_request(e.body_text()))?;
    let (Some(organization), Some(role_arn)) =
        (non_empty(request.domino_org), non_empty(request.iam_role))
    else {
        return Err(Error::invalid_request(
            "payload must contain a non-empty domino_org and iam_role",
        ));
    };

    let change = state
        .catalog
        .map_organization(&organization, &role_arn, &state.config.platform_namespace)
        .await?;
    Ok(Json(change))
}

/// Liveness handler
pub async fn health_handler() -> Json<serde_json::Value> {
    Json(serde_json::json!({"status": "Healthy"}))
}

/// Create the service router
pub fn router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/map_iam_role_to_pod_sa", post(grant_handler))
        .route("/get_my_roles", get(roles_handler))
        .route("/map_org_to_iam_role", post(map_organization_handler))
        .route("/healthz", get(health_handler))
        .with_state(state)
}

/// Serve `router` on `addr` until the process is interrupted
pub async fn serve(addr: SocketAddr, router: Router) -> Result<(), Error> {
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .map_err(|e| Error::config(format!("failed to bind {}: {}", addr, e)))?;
    info!(addr = %addr, "Listening");

    axum::serve(listener, router)
        .with_graceful_shutdown(async {
            // An error here means the handler could not be installed; shut down.
            let _ = tokio::signal::ctrl_c().await;
            info!("Received shutdown signal");
        })
        .await
        .map_err(|e| Error::config(format!("server error: {}", e)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::{ConfigStore, MockConfigStore};
    use crate::identity::tests::pod;
    use crate::identity::{IdentityResolver, MockPodLister};
    use crate::oracle::{MockIdentityOracle, Principal};
    use crate::trust::{MockIamClient, TrustPolicyReconciler};
    use crate::{ORG_ROLE_MAPPING_CONFIG_MAP, ROLE_NAME_MAPPING_CONFIG_MAP};
    use axum::body::Body;
    use axum::http::Request;
    use tower::ServiceExt;

    const OIDC: &str = "oidc.eks.us-west-2.amazonaws.com/id/EXAMPLE";

    // =========================================================================
    // Test Helpers
    // =========================================================================

    fn oracle(is_admin: bool) -> MockIdentityOracle {
        let mut oracle = MockIdentityOracle::new();
        oracle.expect_principal().returning(move |_| {
            Ok(Principal {
                canonical_id: "user-1".to_string(),
                is_admin,
            })
        });
        oracle
            .expect_organizations()
            .returning(|_| Ok(vec!["data-science".to_string()]));
        oracle
    }

    fn mapping_store() -> MockConfigStore {
        let mut store = MockConfigStore::new();
        store.expect_read().returning(|_, name| {
            let entries: &[(&str, &str)] = if name == ORG_ROLE_MAPPING_CONFIG_MAP {
                &[("data-science", "arn:aws:iam::1:role/ds-reader")]
            } else if name == ROLE_NAME_MAPPING_CONFIG_MAP {
                &[("ds-reader", "arn:aws:iam::1:role/eks-ds-reader")]
            } else {
                &[]
            };
            Ok(entries
                .iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect())
        });
        store
    }

    fn state_with(
        pods: MockPodLister,
        iam: MockIamClient,
        store: MockConfigStore,
        oracle: MockIdentityOracle,
    ) -> Arc<AppState> {
        let oracle: Arc<dyn IdentityOracle> = Arc::new(oracle);
        let store: Arc<dyn ConfigStore> = Arc::new(store);
        let catalog = Arc::new(RoleCatalog::new(store, oracle.clone()));
        let coordinator = Arc::new(Coordinator::new(
            IdentityResolver::new(Arc::new(pods), 4),
            catalog.clone(),
            TrustPolicyReconciler::new(Arc::new(iam), OIDC),
        ));
        Arc::new(AppState {
            coordinator,
            catalog,
            oracle,
            config: ServiceConfig {
                oidc_provider: OIDC.to_string(),
                ..Default::default()
            },
        })
    }

    fn idle_state(is_admin: bool) -> Arc<AppState> {
        state_with(
            MockPodLister::new(),
            MockIamClient::new(),
            mapping_store(),
            oracle(is_admin),
        )
    }

    fn post_json(uri: &str, body: serde_json::Value) -> Request<Body> {
        Request::builder()
            .method("POST")
            .uri(uri)
            .header("authorization", "Bearer user-token")
            .header("content-type", "application/json")
            .body(Body::from(body.to_string()))
            .unwrap()
    }

    async fn body_string(response: Response) -> String {
        let bytes = axum::body::to_bytes(response.into_body(), 1024 * 1024)
            .await
            .unwrap();
        String::from_utf8(bytes.to_vec()).unwrap()
    }

    // =========================================================================
    // Credentials
    // =========================================================================

    #[test]
    fn authorization_header_wins_over_api_key() {
        let mut headers = HeaderMap::new();
        headers.insert("authorization", "Bearer abc".parse().unwrap());
        headers.insert("x-domino-api-key", "key".parse().unwrap());

        assert_eq!(
            extract_credentials(&headers).unwrap(),
            Credentials::Authorization("Bearer abc".to_string())
        );
    }

    #[test]
    fn api_key_is_used_without_authorization() {
        let mut headers = HeaderMap::new();
        headers.insert("x-domino-api-key", "key".parse().unwrap());

        assert_eq!(
            extract_credentials(&headers).unwrap(),
            Credentials::ApiKey("key".to_string())
        );
    }

    #[test]
    fn missing_credentials_are_unauthorized() {
        let result = extract_credentials(&HeaderMap::new());
        assert!(matches!(result, Err(Error::Unauthorized(_))));
    }

    #[test]
    fn errors_map_to_status_codes() {
        let cases = [
            (Error::not_found("x"), StatusCode::NOT_FOUND),
            (Error::unauthorized("x"), StatusCode::UNAUTHORIZED),
            (Error::forbidden("x"), StatusCode::FORBIDDEN),
            (Error::invalid_request("x"), StatusCode::BAD_REQUEST),
            (Error::iam("x"), StatusCode::BAD_GATEWAY),
            (Error::oracle("x"), StatusCode::BAD_GATEWAY),
            (Error::malformed_policy("r", "x"), StatusCode::INTERNAL_SERVER_ERROR),
        ];
        for (err, status) in cases {
            assert_eq!(err.into_response().status(), status);
        }
    }

    // =========================================================================
    // Story Tests: Grant Endpoint
    // =========================================================================

    /// Story: a pod's agent asks for its roles and receives an AWS config
    #[tokio::test]
    async fn story_grant_returns_aws_config() {
        let mut pods = MockPodLister::new();
        pods.expect_list_pods().returning(|_| {
            Ok(vec![pod(
                "sa1-run-abc",
                "Running",
                Some("abc"),
                Some("user-1"),
            )])
        });

        let mut iam = MockIamClient::new();
        iam.expect_get_trust_policy()
            .withf(|role| role == "eks-ds-reader")
            .returning(|_| {
                Ok(serde_json::json!({
                    "Statement": [{
                        "Condition": { "StringLike": { format!("{}:sub", OIDC): [] } }
                    }]
                })
                .to_string())
            });
        iam.expect_update_trust_policy()
            .withf(|role, doc| {
                role == "eks-ds-reader" && doc.contains("*:domino-compute:run-abc")
            })
            .times(1)
            .returning(|_, _| Ok(()));

        let router = router(state_with(pods, iam, mapping_store(), oracle(false)));
        let response = router
            .oneshot(post_json(
                "/map_iam_role_to_pod_sa",
                serde_json::json!({"run_id": "abc"}),
            ))
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        let body = body_string(response).await;
        assert!(body.starts_with("[profile ds-reader]\n"));
        assert!(body.contains("role_arn=arn:aws:iam::1:role/eks-ds-reader"));
    }

    /// Story: a run id the caller does not own yields 404 and no IAM traffic
    #[tokio::test]
    async fn story_unknown_run_is_not_found() {
        let mut pods = MockPodLister::new();
        pods.expect_list_pods().returning(|_| {
            Ok(vec![pod(
                "sa1-run-abc",
                "Running",
                Some("abc"),
                Some("someone-else"),
            )])
        });
        let mut iam = MockIamClient::new();
        iam.expect_get_trust_policy().times(0);
        iam.expect_update_trust_policy().times(0);

        let router = router(state_with(pods, iam, mapping_store(), oracle(false)));
        let response = router
            .oneshot(post_json(
                "/map_iam_role_to_pod_sa",
                serde_json::json!({"run_id": "abc"}),
            ))
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::NOT_FOUND);
        assert!(body_string(response).await.contains("abc"));
    }

    #[tokio::test]
    async fn grant_without_credentials_is_unauthorized() {
        let request = Request::builder()
            .method("POST")
            .uri("/map_iam_role_to_pod_sa")
            .header("content-type", "application/json")
            .body(Body::from(r#"{"run_id":"abc"}"#))
            .unwrap();

        let response = router(idle_state(false)).oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn grant_without_run_id_is_bad_request() {
        let response = router(idle_state(false))
            .oneshot(post_json("/map_iam_role_to_pod_sa", serde_json::json!({})))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    // =========================================================================
    // Story Tests: Role Catalog Endpoints
    // =========================================================================

    /// Story: a user lists the roles their organizations grant
    #[tokio::test]
    async fn story_get_my_roles_projects_memberships() {
        let request = Request::builder()
            .uri("/get_my_roles")
            .header("x-domino-api-key", "key")
            .body(Body::empty())
            .unwrap();

        let response = router(idle_state(false)).oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        let roles: RolesResponse = serde_json::from_str(&body_string(response).await).unwrap();
        assert_eq!(
            roles.result.get("data-science").map(String::as_str),
            Some("arn:aws:iam::1:role/ds-reader")
        );
    }

    /// Story: only admins may change organization mappings
    #[tokio::test]
    async fn story_non_admin_cannot_map_organization() {
        let mut store = mapping_store();
        store.expect_set_entry().times(0);

        let state = state_with(
            MockPodLister::new(),
            MockIamClient::new(),
            store,
            oracle(false),
        );
        let response = router(state)
            .oneshot(post_json(
                "/map_org_to_iam_role",
                serde_json::json!({
                    "domino_org": "finance",
                    "iam_role": "arn:aws:iam::1:role/fin",
                }),
            ))
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::FORBIDDEN);
    }

    #[tokio::test]
    async fn admin_mapping_requires_both_fields() {
        let response = router(idle_state(true))
            .oneshot(post_json(
                "/map_org_to_iam_role",
                serde_json::json!({"domino_org": "finance", "iam_role": ""}),
            ))
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    /// Story: an admin remaps an organization and sees the previous value
    #[tokio::test]
    async fn story_admin_maps_organization() {
        let mut store = mapping_store();
        store
            .expect_set_entry()
            .withf(|ns, name, key, value| {
                ns == "domino-platform"
                    && name == ORG_ROLE_MAPPING_CONFIG_MAP
                    && key == "finance"
                    && value == "arn:aws:iam::1:role/fin"
            })
            .times(1)
            .returning(|_, _, _, _| Ok(Some("arn:aws:iam::1:role/old".to_string())));

        let state = state_with(
            MockPodLister::new(),
            MockIamClient::new(),
            store,
            oracle(true),
        );
        let response = router(state)
            .oneshot(post_json(
                "/map_org_to_iam_role",
                serde_json::json!({
                    "domino_org": "finance",
                    "iam_role": "arn:aws:iam::1:role/fin",
                }),
            ))
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        let change: serde_json::Value =
            serde_json::from_str(&body_string(response).await).unwrap();
        assert_eq!(change["previous"], "arn:aws:iam::1:role/old");
        assert_eq!(change["current"], "arn:aws:iam::1:role/fin");
    }

    #[tokio::test]
    async fn healthz_reports_healthy() {
        let request = Request::builder()
            .uri("/healthz")
            .body(Body::empty())
            .unwrap();

        let response = router(idle_state(false)).oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(body_string(response).await, r#"{"status":"Healthy"}"#);
    }
}
