//! eSewa ePay: redirect URL construction and `transrec` verification.

use async_trait::async_trait;
use reqwest::Client;
use tracing::{debug, warn};
use url::Url;

use super::{Checkout, Confirmation, GatewayOutcome, PaymentGateway, PaymentRequest};
use crate::config::EsewaConfig;

/// `transrec` answers with a small XML document containing this marker on success.
const SUCCESS_MARKER: &str = "Success";

/// Query values eSewa appends to the success URL.
#[derive(Debug, Clone, PartialEq)]
pub struct EsewaProof {
    /// Order id, i.e. the application id sent as `pid`.
    pub oid: String,
    /// Amount as eSewa echoed it back.
    pub amt: String,
    /// eSewa reference id of the transaction.
    pub ref_id: String,
}

pub struct EsewaGateway {
    client: Client,
    config: EsewaConfig,
}

impl EsewaGateway {
    pub fn new(client: Client, config: EsewaConfig) -> Self {
        Self { client, config }
    }

    /// Build the checkout URL the customer's browser is sent to. No network I/O.
    pub fn build_redirect_url(&self, request: &PaymentRequest) -> Result<Url, url::ParseError> {
        let amount = request.amount.to_string();
        Url::parse_with_params(
            &format!("{}/main", self.config.base_url),
            &[
                ("amt", amount.as_str()),
                ("psc", "0"),
                ("pdc", "0"),
                ("txAmt", "0"),
                ("tAmt", amount.as_str()),
                ("pid", request.application_id.as_str()),
                ("scd", self.config.merchant_id.as_str()),
                ("su", self.config.success_url.as_str()),
                ("fu", self.config.failure_url.as_str()),
            ],
        )
    }

    async fn fetch_transrec(&self, proof: &EsewaProof) -> reqwest::Result<String> {
        self.client
            .get(format!("{}/transrec", self.config.base_url))
            .query(&[
                ("amt", proof.amt.as_str()),
                ("rid", proof.ref_id.as_str()),
                ("pid", proof.oid.as_str()),
                ("scd", self.config.merchant_id.as_str()),
            ])
            .send()
            .await?
            .text()
            .await
    }
}

#[async_trait]
impl PaymentGateway for EsewaGateway {
    type Proof = EsewaProof;

    async fn initiate(&self, request: &PaymentRequest) -> GatewayOutcome<Checkout> {
        match self.build_redirect_url(request) {
            Ok(url) => GatewayOutcome::Success(Checkout {
                payment_url: url.to_string(),
                pidx: None,
            }),
            Err(e) => {
                warn!("eSewa base URL is invalid: {e}");
                GatewayOutcome::failure("Payment initiation error")
            }
        }
    }

    async fn verify(&self, proof: &EsewaProof) -> GatewayOutcome<Confirmation> {
        let Some(amount) = parse_amount(&proof.amt) else {
            return GatewayOutcome::failure("Invalid payment amount");
        };

        match self.fetch_transrec(proof).await {
            Ok(body) if body.contains(SUCCESS_MARKER) => {
                debug!(oid = %proof.oid, ref_id = %proof.ref_id, "eSewa payment verified");
                GatewayOutcome::Success(Confirmation {
                    transaction_id: proof.ref_id.clone(),
                    amount,
                    status: "Complete".to_string(),
                })
            }
            Ok(_) => GatewayOutcome::failure("Payment verification failed"),
            Err(e) => {
                warn!(oid = %proof.oid, "eSewa verification error: {e}");
                GatewayOutcome::failure("Payment verification error")
            }
        }
    }
}

/// Parse an eSewa amount such as `17000` or `17000.0` into whole rupees.
fn parse_amount(raw: &str) -> Option<i64> {
    let raw = raw.trim();
    if let Ok(whole) = raw.parse::<i64>() {
        return Some(whole);
    }
    let (whole, fraction) = raw.split_once('.')?;
    if !fraction.is_empty() && fraction.chars().all(|c| c == '0') {
        whole.parse().ok()
    } else {
        None
    }
}
