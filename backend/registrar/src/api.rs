//! Axum REST API handlers.

use std::sync::Arc;

use axum::{
    extract::{rejection::JsonRejection, Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::{error, warn};

use crate::errors::ServiceError;
use crate::gateway::Gateway;
use crate::intake::{IntakeService, RegistrationRequest};
use crate::models::Payment;
use crate::payments::{InitiateRequest, PaymentService, VerifyRequest};

const NEXT_STEPS: [&str; 4] = [
    "Our team will review your application within 24 hours",
    "You will receive a payment link via email",
    "Submit required documents as per our checklist",
    "Track your application status using the application ID",
];

#[derive(Clone)]
pub struct ApiState {
    pub intake: Arc<IntakeService>,
    pub payments: Arc<PaymentService>,
}

pub fn router(state: ApiState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/api/register", post(submit_registration).get(get_registration))
        .route("/api/payment/initiate", post(initiate_payment))
        .route("/api/payment/verify", post(verify_payment))
        .route("/api/payment/history", get(payment_history))
        .with_state(Arc::new(state))
}

// ─────────────────────────────────────────────────────────
// Response shapes
// ─────────────────────────────────────────────────────────

#[derive(Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
    pub version: &'static str,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SubmittedResponse {
    pub application_id: String,
    pub message: &'static str,
    pub estimated_days: u32,
    pub total_fee: i64,
    pub next_steps: [&'static str; 4],
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
pub struct InitiatedResponse {
    pub gateway: Gateway,
    pub payment_url: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pidx: Option<String>,
    pub message: String,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HistoryResponse {
    pub application_id: String,
    pub count: usize,
    pub payments: Vec<Payment>,
}

#[derive(Deserialize)]
pub struct ApplicationQuery {
    #[serde(rename = "applicationId")]
    pub application_id: Option<String>,
}

impl ApplicationQuery {
    fn require(self) -> Result<String, ServiceError> {
        self.application_id
            .map(|id| id.trim().to_string())
            .filter(|id| !id.is_empty())
            .ok_or_else(|| ServiceError::Validation("Application ID is required".to_string()))
    }
}

fn ok<T: Serialize>(data: T) -> Response {
    (StatusCode::OK, Json(json!({ "success": true, "data": data }))).into_response()
}

fn failure(status: StatusCode, message: &str) -> Response {
    (status, Json(json!({ "success": false, "error": message }))).into_response()
}

impl IntoResponse for ServiceError {
    fn into_response(self) -> Response {
        match self {
            ServiceError::Validation(msg) | ServiceError::Gateway(msg) => {
                failure(StatusCode::BAD_REQUEST, &msg)
            }
            ServiceError::NotFound(msg) => failure(StatusCode::NOT_FOUND, &msg),
            ServiceError::Internal(e) => {
                error!("Request failed: {e}");
                failure(StatusCode::INTERNAL_SERVER_ERROR, "Internal server error")
            }
        }
    }
}

fn bad_body(rejection: JsonRejection) -> Response {
    warn!("Rejected request body: {rejection}");
    failure(StatusCode::BAD_REQUEST, "Invalid JSON body")
}

// ─────────────────────────────────────────────────────────
// Handlers
// ─────────────────────────────────────────────────────────

/// `GET /health`
pub async fn health() -> impl IntoResponse {
    Json(HealthResponse {
        status: "ok",
        version: env!("CARGO_PKG_VERSION"),
    })
}

/// `POST /api/register`
pub async fn submit_registration(
    State(state): State<Arc<ApiState>>,
    body: Result<Json<RegistrationRequest>, JsonRejection>,
) -> Response {
    let Json(request) = match body {
        Ok(body) => body,
        Err(rejection) => return bad_body(rejection),
    };
    match state.intake.submit(request).await {
        Ok(submission) => ok(SubmittedResponse {
            application_id: submission.application_id,
            message: "Application submitted successfully",
            estimated_days: submission.estimated_days,
            total_fee: submission.total_fee,
            next_steps: NEXT_STEPS,
        }),
        Err(e) => e.into_response(),
    }
}

/// `GET /api/register?applicationId=...`
pub async fn get_registration(
    State(state): State<Arc<ApiState>>,
    Query(query): Query<ApplicationQuery>,
) -> Response {
    let application_id = match query.require() {
        Ok(id) => id,
        Err(e) => return e.into_response(),
    };
    match state.intake.lookup(&application_id).await {
        Ok(summary) => ok(summary),
        Err(e) => e.into_response(),
    }
}

/// `POST /api/payment/initiate`
pub async fn initiate_payment(
    State(state): State<Arc<ApiState>>,
    body: Result<Json<InitiateRequest>, JsonRejection>,
) -> Response {
    let Json(request) = match body {
        Ok(body) => body,
        Err(rejection) => return bad_body(rejection),
    };
    match state.payments.initiate(request).await {
        Ok(initiated) => ok(InitiatedResponse {
            message: format!("Redirect to {} for payment", display_name(initiated.gateway)),
            gateway: initiated.gateway,
            payment_url: initiated.checkout.payment_url,
            pidx: initiated.checkout.pidx,
        }),
        Err(e) => e.into_response(),
    }
}

/// `POST /api/payment/verify`
pub async fn verify_payment(
    State(state): State<Arc<ApiState>>,
    body: Result<Json<VerifyRequest>, JsonRejection>,
) -> Response {
    let Json(request) = match body {
        Ok(body) => body,
        Err(rejection) => return bad_body(rejection),
    };
    match state.payments.verify(request).await {
        Ok(verified) => (
            StatusCode::OK,
            Json(json!({
                "success": true,
                "message": "Payment verified successfully",
                "data": verified,
            })),
        )
            .into_response(),
        Err(e) => e.into_response(),
    }
}

/// `GET /api/payment/history?applicationId=...`
pub async fn payment_history(
    State(state): State<Arc<ApiState>>,
    Query(query): Query<ApplicationQuery>,
) -> Response {
    let application_id = match query.require() {
        Ok(id) => id,
        Err(e) => return e.into_response(),
    };
    match state.payments.history(&application_id).await {
        Ok(payments) => ok(HistoryResponse {
            count: payments.len(),
            application_id,
            payments,
        }),
        Err(e) => e.into_response(),
    }
}

fn display_name(gateway: Gateway) -> &'static str {
    match gateway {
        Gateway::Esewa => "eSewa",
        Gateway::Khalti => "Khalti",
    }
}

#[cfg(test)]
mod tests {
    use axum::body::{to_bytes, Body};
    use axum::http::Request;
    use axum::routing::post;
    use serde_json::Value;
    use tower::ServiceExt;

    use super::*;
    use crate::config::{EsewaConfig, KhaltiConfig};
    use crate::gateway::{dead_url, serve_fake, test_client, EsewaGateway, KhaltiGateway};
    use crate::notify::RecordingNotifier;
    use crate::store::MemoryStore;

    /// Khalti sandbox stand-in: every session is created, `pidx-paid` looks up as completed.
    async fn fake_khalti() -> String {
        let router = Router::new()
            .route(
                "/epayment/initiate/",
                post(|| async {
                    Json(json!({
                        "pidx": "pidx-paid",
                        "payment_url": "https://test-pay.khalti.com/?pidx=pidx-paid"
                    }))
                }),
            )
            .route(
                "/epayment/lookup/",
                post(|Json(body): Json<Value>| async move {
                    let status = if body["pidx"] == "pidx-paid" {
                        "Completed"
                    } else {
                        "Pending"
                    };
                    Json(json!({
                        "status": status,
                        "total_amount": 1_700_000,
                        "transaction_id": "KTXN-1"
                    }))
                }),
            );
        serve_fake(router).await
    }

    async fn app() -> Router {
        let store = Arc::new(MemoryStore::new());
        let notifier = Arc::new(RecordingNotifier::default());
        let esewa = EsewaGateway::new(
            test_client(),
            EsewaConfig {
                merchant_id: "EPAYTEST".to_string(),
                base_url: dead_url().await,
                success_url: "http://localhost:3000/payment/success".to_string(),
                failure_url: "http://localhost:3000/payment/failure".to_string(),
            },
        );
        let khalti = KhaltiGateway::new(
            test_client(),
            KhaltiConfig {
                secret_key: "key".to_string(),
                base_url: fake_khalti().await,
                return_url: "http://localhost:3000/payment/success".to_string(),
                website_url: "http://localhost:3000".to_string(),
            },
        );
        router(ApiState {
            intake: Arc::new(IntakeService::new(store.clone(), notifier.clone())),
            payments: Arc::new(PaymentService::new(store, notifier, esewa, khalti)),
        })
    }

    async fn send(app: &Router, request: Request<Body>) -> (StatusCode, Value) {
        let response = app.clone().oneshot(request).await.unwrap();
        let status = response.status();
        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        (status, serde_json::from_slice(&bytes).unwrap())
    }

    fn post_json(uri: &str, body: Value) -> Request<Body> {
        Request::post(uri)
            .header("content-type", "application/json")
            .body(Body::from(body.to_string()))
            .unwrap()
    }

    fn get(uri: &str) -> Request<Body> {
        Request::get(uri).body(Body::empty()).unwrap()
    }

    fn acme() -> Value {
        json!({
            "companyType": "private",
            "companyName": "Acme Pvt Ltd",
            "businessActivity": "Trading",
            "registeredAddress": "Kathmandu",
            "contactPerson": "Ram Shrestha",
            "email": "ram@x.com",
            "phone": "9800000000",
            "additionalServices": ["PAN Registration"]
        })
    }

    #[tokio::test]
    async fn health_reports_version() {
        let app = app().await;
        let (status, body) = send(&app, get("/health")).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["status"], "ok");
        assert_eq!(body["version"], env!("CARGO_PKG_VERSION"));
    }

    #[tokio::test]
    async fn register_then_lookup() {
        let app = app().await;
        let (status, body) = send(&app, post_json("/api/register", acme())).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["success"], true);
        assert_eq!(body["data"]["totalFee"], 17000);
        assert_eq!(body["data"]["estimatedDays"], 10);
        assert_eq!(body["data"]["message"], "Application submitted successfully");
        assert_eq!(body["data"]["nextSteps"].as_array().unwrap().len(), 4);

        let id = body["data"]["applicationId"].as_str().unwrap().to_string();
        let (status, body) = send(&app, get(&format!("/api/register?applicationId={id}"))).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["data"]["applicationId"], id.as_str());
        assert_eq!(body["data"]["status"], "pending");
        assert_eq!(body["data"]["paymentStatus"], "unpaid");
        assert_eq!(body["data"]["message"], "Application is being processed");
    }

    #[tokio::test]
    async fn register_missing_fields_is_400() {
        let app = app().await;
        let (status, body) = send(
            &app,
            post_json("/api/register", json!({ "companyType": "private" })),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["success"], false);
        assert!(body["error"]
            .as_str()
            .unwrap()
            .starts_with("Missing required fields: companyName"));
    }

    #[tokio::test]
    async fn malformed_body_is_400() {
        let app = app().await;
        let request = Request::post("/api/register")
            .header("content-type", "application/json")
            .body(Body::from("{not json"))
            .unwrap();
        let (status, body) = send(&app, request).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["success"], false);
    }

    #[tokio::test]
    async fn lookup_requires_and_resolves_id() {
        let app = app().await;
        let (status, body) = send(&app, get("/api/register")).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["error"], "Application ID is required");

        let (status, body) = send(&app, get("/api/register?applicationId=NLS-0-NONE")).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert_eq!(body["success"], false);
    }

    #[tokio::test]
    async fn esewa_initiate_returns_redirect() {
        let app = app().await;
        let (status, body) = send(
            &app,
            post_json(
                "/api/payment/initiate",
                json!({ "gateway": "esewa", "applicationId": "NLS-123", "amount": 17000 }),
            ),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["data"]["gateway"], "esewa");
        assert_eq!(body["data"]["message"], "Redirect to eSewa for payment");
        assert!(body["data"]["paymentUrl"]
            .as_str()
            .unwrap()
            .contains("pid=NLS-123"));
        assert!(body["data"].get("pidx").is_none());
    }

    #[tokio::test]
    async fn initiate_rejects_unknown_gateway() {
        let app = app().await;
        let (status, body) = send(
            &app,
            post_json(
                "/api/payment/initiate",
                json!({ "gateway": "paypal", "applicationId": "NLS-123", "amount": 17000 }),
            ),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["error"], "Invalid payment gateway");
    }

    #[tokio::test]
    async fn khalti_flow_end_to_end() {
        let app = app().await;
        let (_, body) = send(&app, post_json("/api/register", acme())).await;
        let id = body["data"]["applicationId"].as_str().unwrap().to_string();

        let (status, body) = send(
            &app,
            post_json(
                "/api/payment/initiate",
                json!({ "gateway": "khalti", "applicationId": id, "amount": 17000 }),
            ),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["data"]["pidx"], "pidx-paid");
        assert_eq!(body["data"]["message"], "Redirect to Khalti for payment");

        let (status, body) = send(
            &app,
            post_json(
                "/api/payment/verify",
                json!({ "gateway": "khalti", "pidx": "pidx-paid", "purchase_order_id": id }),
            ),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["message"], "Payment verified successfully");
        assert_eq!(body["data"]["transactionId"], "KTXN-1");
        assert_eq!(body["data"]["paymentStatus"], "paid");

        let (status, body) = send(
            &app,
            get(&format!("/api/payment/history?applicationId={id}")),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["data"]["count"], 1);
        assert_eq!(body["data"]["payments"][0]["method"], "khalti");

        let (_, body) = send(&app, get(&format!("/api/register?applicationId={id}"))).await;
        assert_eq!(body["data"]["paidAmount"], 17000);
    }

    #[tokio::test]
    async fn failed_verification_is_400() {
        let app = app().await;
        let (status, body) = send(
            &app,
            post_json(
                "/api/payment/verify",
                json!({ "gateway": "khalti", "pidx": "pidx-other", "purchase_order_id": "NLS-1" }),
            ),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["error"], "Payment not completed");
    }

    #[tokio::test]
    async fn history_requires_id() {
        let app = app().await;
        let (status, body) = send(&app, get("/api/payment/history")).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["error"], "Application ID is required");
    }
}
