//! Khalti ePayment v2 client — `epayment/initiate/` and `epayment/lookup/`.
//!
//! Khalti works in paisa: amounts are multiplied by 100 on the way out and
//! divided by 100 on the way back.

use async_trait::async_trait;
use reqwest::header::AUTHORIZATION;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use super::{Checkout, Confirmation, GatewayOutcome, PaymentGateway, PaymentRequest};
use crate::config::KhaltiConfig;

const PURCHASE_ORDER_NAME: &str = "Company Registration Service";
const COMPLETED: &str = "Completed";
const PAISA_PER_RUPEE: i64 = 100;

// ─────────────────────────────────────────────────────────
// Wire shapes
// ─────────────────────────────────────────────────────────

#[derive(Debug, Serialize)]
struct InitiateBody<'a> {
    return_url: &'a str,
    website_url: &'a str,
    amount: i64,
    purchase_order_id: &'a str,
    purchase_order_name: &'a str,
    customer_info: CustomerInfo<'a>,
}

#[derive(Debug, Serialize)]
struct CustomerInfo<'a> {
    name: &'a str,
    email: &'a str,
    phone: &'a str,
}

#[derive(Debug, Deserialize)]
struct InitiateResponse {
    pidx: Option<String>,
    payment_url: Option<String>,
    detail: Option<String>,
}

#[derive(Debug, Serialize)]
struct LookupBody<'a> {
    pidx: &'a str,
}

#[derive(Debug, Deserialize)]
struct LookupResponse {
    status: Option<String>,
    transaction_id: Option<String>,
    total_amount: Option<i64>,
}

// ─────────────────────────────────────────────────────────
// Adapter
// ─────────────────────────────────────────────────────────

pub struct KhaltiGateway {
    client: Client,
    config: KhaltiConfig,
}

impl KhaltiGateway {
    pub fn new(client: Client, config: KhaltiConfig) -> Self {
        Self { client, config }
    }

    async fn post<B, R>(&self, path: &str, body: &B) -> reqwest::Result<R>
    where
        B: Serialize + ?Sized,
        R: for<'de> Deserialize<'de>,
    {
        self.client
            .post(format!("{}/{path}", self.config.base_url))
            .header(AUTHORIZATION, format!("Key {}", self.config.secret_key))
            .json(body)
            .send()
            .await?
            .json()
            .await
    }
}

#[async_trait]
impl PaymentGateway for KhaltiGateway {
    /// The `pidx` returned by `initiate`.
    type Proof = String;

    async fn initiate(&self, request: &PaymentRequest) -> GatewayOutcome<Checkout> {
        let body = InitiateBody {
            return_url: &self.config.return_url,
            website_url: &self.config.website_url,
            amount: request.amount.saturating_mul(PAISA_PER_RUPEE),
            purchase_order_id: &request.application_id,
            purchase_order_name: PURCHASE_ORDER_NAME,
            customer_info: CustomerInfo {
                name: &request.customer_name,
                email: &request.customer_email,
                phone: &request.customer_phone,
            },
        };

        match self.post::<_, InitiateResponse>("epayment/initiate/", &body).await {
            Ok(InitiateResponse {
                pidx: Some(pidx),
                payment_url,
                ..
            }) => {
                debug!(application_id = %request.application_id, %pidx, "Khalti session created");
                GatewayOutcome::Success(Checkout {
                    payment_url: payment_url.unwrap_or_default(),
                    pidx: Some(pidx),
                })
            }
            Ok(InitiateResponse { detail, .. }) => GatewayOutcome::failure(
                detail.unwrap_or_else(|| "Payment initiation failed".to_string()),
            ),
            Err(e) => {
                warn!(application_id = %request.application_id, "Khalti initiation error: {e}");
                GatewayOutcome::failure("Payment initiation error")
            }
        }
    }

    async fn verify(&self, pidx: &String) -> GatewayOutcome<Confirmation> {
        match self
            .post::<_, LookupResponse>("epayment/lookup/", &LookupBody { pidx: pidx.as_str() })
            .await
        {
            Ok(LookupResponse {
                status: Some(status),
                transaction_id,
                total_amount: Some(total_amount),
            }) if status == COMPLETED => {
                debug!(%pidx, "Khalti payment verified");
                GatewayOutcome::Success(Confirmation {
                    transaction_id: transaction_id.unwrap_or_else(|| pidx.clone()),
                    amount: total_amount / PAISA_PER_RUPEE,
                    status,
                })
            }
            Ok(LookupResponse {
                status: Some(status),
                total_amount: None,
                ..
            }) if status == COMPLETED => {
                warn!(%pidx, "Khalti lookup reported completion without an amount");
                GatewayOutcome::failure("Payment verification error")
            }
            Ok(_) => GatewayOutcome::failure("Payment not completed"),
            Err(e) => {
                warn!(%pidx, "Khalti verification error: {e}");
                GatewayOutcome::failure("Payment verification error")
            }
        }
    }
}
