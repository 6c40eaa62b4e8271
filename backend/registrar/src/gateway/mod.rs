//! Payment gateway adapters.
//!
//! eSewa and Khalti share nothing beyond the two operation names: eSewa is
//! a browser redirect followed by a server-side `transrec` check whose body
//! must contain a success marker, Khalti is an authenticated JSON API whose
//! lookup must report `status == "Completed"`. [`PaymentGateway`] unifies
//! only `initiate` and `verify`; each adapter keeps its own request shapes.
//!
//! Adapters never return `Err`. Transport failures, timeouts and unexpected
//! bodies all become [`GatewayOutcome::Failure`].

pub mod esewa;
pub mod khalti;

use std::fmt;

use async_trait::async_trait;
use serde::Serialize;

pub use esewa::{EsewaGateway, EsewaProof};
pub use khalti::KhaltiGateway;

/// Supported gateway names.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Gateway {
    Esewa,
    Khalti,
}

impl Gateway {
    pub fn parse(name: &str) -> Option<Self> {
        match name {
            "esewa" => Some(Self::Esewa),
            "khalti" => Some(Self::Khalti),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Esewa => "esewa",
            Self::Khalti => "khalti",
        }
    }
}

impl fmt::Display for Gateway {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// An internal request to collect `amount` NPR for an application.
#[derive(Debug, Clone, PartialEq)]
pub struct PaymentRequest {
    pub application_id: String,
    pub amount: i64,
    pub customer_name: String,
    pub customer_email: String,
    pub customer_phone: String,
}

/// Where to send the customer to complete payment.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Checkout {
    pub payment_url: String,
    /// Khalti payment-session identifier.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pidx: Option<String>,
}

/// What a gateway confirmed about a completed payment.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Confirmation {
    pub transaction_id: String,
    /// Amount in NPR.
    pub amount: i64,
    pub status: String,
}

#[derive(Debug, Clone, PartialEq)]
pub enum GatewayOutcome<T> {
    Success(T),
    Failure { reason: String },
}

impl<T> GatewayOutcome<T> {
    pub fn failure(reason: impl Into<String>) -> Self {
        Self::Failure {
            reason: reason.into(),
        }
    }

    pub fn into_result(self) -> Result<T, String> {
        match self {
            Self::Success(value) => Ok(value),
            Self::Failure { reason } => Err(reason),
        }
    }
}

#[async_trait]
pub trait PaymentGateway: Send + Sync {
    /// Gateway-specific evidence that a payment happened.
    type Proof: Send + Sync;

    async fn initiate(&self, request: &PaymentRequest) -> GatewayOutcome<Checkout>;

    async fn verify(&self, proof: &Self::Proof) -> GatewayOutcome<Confirmation>;
}

/// Serve `router` on an ephemeral local port and return its base URL.
#[cfg(test)]
pub(crate) async fn serve_fake(router: axum::Router) -> String {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, router).await.unwrap();
    });
    format!("http://{addr}")
}

/// A base URL nothing is listening on.
#[cfg(test)]
pub(crate) async fn dead_url() -> String {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    drop(listener);
    format!("http://{addr}")
}

#[cfg(test)]
pub(crate) fn test_client() -> reqwest::Client {
    reqwest::Client::builder()
        .timeout(std::time::Duration::from_secs(5))
        .build()
        .unwrap()
}
