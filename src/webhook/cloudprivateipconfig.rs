//! CloudPrivateIPConfig admission handler
//!
//! Wire contract: POST only (the router returns 405 otherwise), the body
//! must be `application/json`, a malformed or request-less review yields
//! 400. A well-formed review always gets a 200 admission response:
//! admitted iff `spec.node` names an existing node, denied with the lookup
//! error as the user-facing message otherwise.

use std::sync::Arc;

use axum::body::Bytes;
use axum::extract::State;
use axum::http::{header, HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Json;
use kube::core::admission::{AdmissionRequest, AdmissionResponse, AdmissionReview};
use tracing::{error, info, warn};

use crate::crd::CloudPrivateIPConfig;

use super::WebhookState;

const JSON_CONTENT_TYPE: &str = "application/json";

/// Handle a validating admission review for CloudPrivateIPConfig
pub async fn validate_handler(
    State(state): State<Arc<WebhookState>>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    info!("Handling webhook request");

    let content_type = headers
        .get(header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .unwrap_or_default();
    if !content_type.starts_with(JSON_CONTENT_TYPE) {
        let message = format!(
            "unsupported content type {content_type}, only {JSON_CONTENT_TYPE} is supported"
        );
        error!(error = %message, "Error handling webhook request");
        return (StatusCode::BAD_REQUEST, message).into_response();
    }

    let review: AdmissionReview<CloudPrivateIPConfig> = match serde_json::from_slice(&body) {
        Ok(review) => review,
        Err(e) => {
            let message = format!("could not deserialize request: {e}");
            error!(error = %message, "Error handling webhook request");
            return (StatusCode::BAD_REQUEST, message).into_response();
        }
    };
    let request: AdmissionRequest<CloudPrivateIPConfig> = match review.try_into() {
        Ok(request) => request,
        Err(e) => {
            let message = format!("malformed admission review: {e}");
            error!(error = %message, "Error handling webhook request");
            return (StatusCode::BAD_REQUEST, message).into_response();
        }
    };

    let response = validate(state.as_ref(), &request).await;
    info!("Webhook request handled successfully");
    Json(response.into_review()).into_response()
}

/// Admit iff the requested node exists.
async fn validate(
    state: &WebhookState,
    request: &AdmissionRequest<CloudPrivateIPConfig>,
) -> AdmissionResponse {
    let Some(config) = request.object.as_ref() else {
        return AdmissionResponse::from(request)
            .deny("malformed admission review: no object in request");
    };

    match state.nodes.get_node(&config.spec.node).await {
        Ok(_) => AdmissionResponse::from(request),
        Err(e) => {
            warn!(
                config = %request.name,
                node = %config.spec.node,
                error = %e,
                "Denying CloudPrivateIPConfig"
            );
            AdmissionResponse::from(request).deny(e.to_string())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::webhook::{webhook_router, MockNodeLookup, WebhookState};
    use axum::body::Body;
    use axum::http::Request;
    use http_body_util::BodyExt;
    use k8s_openapi::api::core::v1::Node;
    use kube::api::ObjectMeta;
    use kube::core::ErrorResponse;
    use tower::ServiceExt;

    fn review_body(node: &str) -> String {
        serde_json::json!({
            "apiVersion": "admission.k8s.io/v1",
            "kind": "AdmissionReview",
            "request": {
                "uid": "705ab4f5-6393-11e8-b7cc-42010a800002",
                "kind": {
                    "group": "cloud.network.openshift.io",
                    "version": "v1",
                    "kind": "CloudPrivateIPConfig"
                },
                "resource": {
                    "group": "cloud.network.openshift.io",
                    "version": "v1",
                    "resource": "cloudprivateipconfigs"
                },
                "name": "192.168.172.12",
                "operation": "CREATE",
                "userInfo": {},
                "object": {
                    "apiVersion": "cloud.network.openshift.io/v1",
                    "kind": "CloudPrivateIPConfig",
                    "metadata": {"name": "192.168.172.12"},
                    "spec": {"node": node}
                }
            }
        })
        .to_string()
    }

    fn router_with(mock: MockNodeLookup) -> axum::Router {
        webhook_router(Arc::new(WebhookState {
            nodes: Arc::new(mock),
        }))
    }

    async fn post_review(router: axum::Router, content_type: &str, body: String) -> Response {
        router
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri("/cloudprivateipconfigs")
                    .header(header::CONTENT_TYPE, content_type)
                    .body(Body::from(body))
                    .unwrap(),
            )
            .await
            .unwrap()
    }

    async fn response_json(response: Response) -> serde_json::Value {
        let bytes = response.into_body().collect().await.unwrap().to_bytes();
        serde_json::from_slice(&bytes).unwrap()
    }

    #[tokio::test]
    async fn admits_when_the_node_exists() {
        let mut mock = MockNodeLookup::new();
        mock.expect_get_node().returning(|name| {
            Ok(Node {
                metadata: ObjectMeta {
                    name: Some(name.to_string()),
                    ..Default::default()
                },
                ..Default::default()
            })
        });

        let response = post_review(router_with(mock), JSON_CONTENT_TYPE, review_body("nodeA")).await;
        assert_eq!(response.status(), StatusCode::OK);

        let review = response_json(response).await;
        assert_eq!(review["response"]["allowed"], true);
        assert_eq!(
            review["response"]["uid"],
            "705ab4f5-6393-11e8-b7cc-42010a800002"
        );
    }

    #[tokio::test]
    async fn denies_with_the_lookup_error_when_the_node_is_missing() {
        let mut mock = MockNodeLookup::new();
        mock.expect_get_node().returning(|name| {
            Err(kube::Error::Api(ErrorResponse {
                status: "Failure".to_string(),
                message: format!("nodes \"{name}\" not found"),
                reason: "NotFound".to_string(),
                code: 404,
            }))
        });

        let response =
            post_review(router_with(mock), JSON_CONTENT_TYPE, review_body("ghost-node")).await;
        // A deny is still a well-formed 200 admission response
        assert_eq!(response.status(), StatusCode::OK);

        let review = response_json(response).await;
        assert_eq!(review["response"]["allowed"], false);
        let message = review["response"]["status"]["message"].as_str().unwrap();
        assert!(message.contains("not found"), "got message: {message}");
    }

    #[tokio::test]
    async fn rejects_non_json_content_types() {
        let response = post_review(
            router_with(MockNodeLookup::new()),
            "text/plain",
            review_body("nodeA"),
        )
        .await;
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn rejects_undecodable_bodies() {
        let response = post_review(
            router_with(MockNodeLookup::new()),
            JSON_CONTENT_TYPE,
            "not json".to_string(),
        )
        .await;
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn rejects_reviews_without_a_request() {
        let body = serde_json::json!({
            "apiVersion": "admission.k8s.io/v1",
            "kind": "AdmissionReview"
        })
        .to_string();
        let response = post_review(router_with(MockNodeLookup::new()), JSON_CONTENT_TYPE, body).await;
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn non_post_methods_get_405() {
        let response = router_with(MockNodeLookup::new())
            .oneshot(
                Request::builder()
                    .method("GET")
                    .uri("/cloudprivateipconfigs")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::METHOD_NOT_ALLOWED);
    }
}
