//! Payment orchestration: gateway dispatch and write-back of verified payments.
//!
//! A payment attempt is never stored before the gateway confirms it:
//!
//! ```text
//! created --initiate ok--> awaiting confirmation --verify ok--> completed
//! created --initiate fails--> failed
//! awaiting confirmation --verify fails--> failed
//! ```
//!
//! Only the `completed` edge touches the record store.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::OwnedMutexGuard;
use tracing::{info, warn};

use crate::errors::ServiceError;
use crate::gateway::{
    Checkout, Confirmation, EsewaGateway, EsewaProof, Gateway, KhaltiGateway,
    PaymentGateway, PaymentRequest,
};
use crate::models::{Payment, PaymentMethod, PaymentStatus, Settlement};
use crate::notify::{Notification, SharedNotifier};
use crate::store::SharedStore;

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InitiateRequest {
    pub gateway: Option<String>,
    pub application_id: Option<String>,
    /// NPR; a JSON number or a numeric string such as `"17000"`.
    pub amount: Option<Value>,
    #[serde(default)]
    pub customer_name: String,
    #[serde(default)]
    pub customer_email: String,
    #[serde(default)]
    pub customer_phone: String,
}

/// Gateway return payload. eSewa sends `oid`, `amt`, `refId`; Khalti sends
/// `pidx` and echoes `purchase_order_id`.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct VerifyRequest {
    pub gateway: Option<String>,
    pub oid: Option<String>,
    /// eSewa echoes the amount as text; clients may forward it as a number.
    pub amt: Option<Value>,
    #[serde(rename = "refId")]
    pub ref_id: Option<String>,
    pub pidx: Option<String>,
    #[serde(alias = "applicationId")]
    pub purchase_order_id: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Initiated {
    pub gateway: Gateway,
    #[serde(flatten)]
    pub checkout: Checkout,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Verified {
    pub gateway: Gateway,
    pub application_id: String,
    #[serde(flatten)]
    pub confirmation: Confirmation,
    pub payment_status: PaymentStatus,
    pub paid_amount: i64,
    /// `true` when this transaction had been verified before.
    pub already_recorded: bool,
}

/// Per-key async mutexes. Entries nobody holds are pruned on the next acquire.
#[derive(Default)]
pub struct KeyedLocks {
    locks: Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>,
}

impl KeyedLocks {
    pub async fn lock(&self, key: &str) -> OwnedMutexGuard<()> {
        let lock = {
            let mut locks = self.locks.lock().unwrap_or_else(|e| e.into_inner());
            locks.retain(|_, m| Arc::strong_count(m) > 1);
            locks.entry(key.to_string()).or_default().clone()
        };
        lock.lock_owned().await
    }
}

pub struct PaymentService {
    store: SharedStore,
    notifier: SharedNotifier,
    esewa: EsewaGateway,
    khalti: KhaltiGateway,
    settlement_locks: KeyedLocks,
}

impl PaymentService {
    pub fn new(
        store: SharedStore,
        notifier: SharedNotifier,
        esewa: EsewaGateway,
        khalti: KhaltiGateway,
    ) -> Self {
        Self {
            store,
            notifier,
            esewa,
            khalti,
            settlement_locks: KeyedLocks::default(),
        }
    }

    pub async fn initiate(&self, request: InitiateRequest) -> Result<Initiated, ServiceError> {
        let mut missing = Vec::new();
        if blank(&request.gateway) {
            missing.push("gateway");
        }
        if blank(&request.application_id) {
            missing.push("applicationId");
        }
        if request.amount.as_ref().map_or(true, Value::is_null) {
            missing.push("amount");
        }
        if !missing.is_empty() {
            return Err(ServiceError::Validation(format!(
                "Missing required fields: {}",
                missing.join(", ")
            )));
        }

        let gateway = parse_gateway(request.gateway.as_deref())?;
        let amount = request
            .amount
            .as_ref()
            .and_then(whole_rupees)
            .filter(|amount| *amount > 0)
            .ok_or_else(|| {
                ServiceError::Validation("Amount must be a positive number".to_string())
            })?;

        let payment = PaymentRequest {
            application_id: request.application_id.unwrap_or_default().trim().to_string(),
            amount,
            customer_name: request.customer_name,
            customer_email: request.customer_email,
            customer_phone: request.customer_phone,
        };

        let outcome = match gateway {
            Gateway::Esewa => self.esewa.initiate(&payment).await,
            Gateway::Khalti => self.khalti.initiate(&payment).await,
        };
        let checkout = outcome.into_result().map_err(|reason| {
            warn!(application_id = %payment.application_id, %gateway, %reason, "Payment initiation rejected");
            ServiceError::Gateway(reason)
        })?;
        info!(application_id = %payment.application_id, %gateway, amount, "Payment initiated");
        Ok(Initiated { gateway, checkout })
    }

    pub async fn verify(&self, request: VerifyRequest) -> Result<Verified, ServiceError> {
        if blank(&request.gateway) {
            return Err(ServiceError::Validation("Gateway not specified".to_string()));
        }
        let gateway = parse_gateway(request.gateway.as_deref())?;

        let (application_id, outcome) = match gateway {
            Gateway::Esewa => {
                let proof = esewa_proof(&request).ok_or_else(|| {
                    ServiceError::Validation("Missing eSewa verification parameters".to_string())
                })?;
                let outcome = self.esewa.verify(&proof).await;
                (proof.oid, outcome)
            }
            Gateway::Khalti => {
                let pidx = present(&request.pidx)
                    .ok_or_else(|| ServiceError::Validation("Missing Khalti pidx".to_string()))?;
                let application_id = present(&request.purchase_order_id).ok_or_else(|| {
                    ServiceError::Validation("Missing Khalti purchase_order_id".to_string())
                })?;
                (application_id, self.khalti.verify(&pidx).await)
            }
        };

        let confirmation = outcome.into_result().map_err(|reason| {
            warn!(%application_id, %gateway, %reason, "Payment verification failed");
            ServiceError::Gateway(reason)
        })?;

        self.record(gateway, application_id, confirmation).await
    }

    /// Write a confirmed payment back. Serialized per application; the
    /// gateway call has already finished so no lock spans network I/O.
    async fn record(
        &self,
        gateway: Gateway,
        application_id: String,
        confirmation: Confirmation,
    ) -> Result<Verified, ServiceError> {
        let _guard = self.settlement_locks.lock(&application_id).await;

        let settlement = Settlement {
            application_id: application_id.clone(),
            amount: confirmation.amount,
            method: payment_method(gateway),
            transaction_id: confirmation.transaction_id.clone(),
        };
        let Some(settled) = self.store.settle_payment(settlement).await? else {
            warn!(
                %application_id,
                %gateway,
                transaction_id = %confirmation.transaction_id,
                "Verified payment references an unknown application"
            );
            return Err(ServiceError::NotFound("Application not found".to_string()));
        };

        if settled.newly_recorded {
            info!(
                %application_id,
                %gateway,
                transaction_id = %confirmation.transaction_id,
                amount = confirmation.amount,
                paid_amount = settled.registration.paid_amount,
                "Payment recorded"
            );
            self.notifier.notify(Notification::payment_received(
                &settled.registration,
                &settled.payment,
            ));
        } else {
            info!(
                %application_id,
                transaction_id = %confirmation.transaction_id,
                "Payment already recorded; nothing to do"
            );
        }

        Ok(Verified {
            gateway,
            application_id,
            confirmation,
            payment_status: settled.registration.payment_status,
            paid_amount: settled.registration.paid_amount,
            already_recorded: !settled.newly_recorded,
        })
    }

    pub async fn history(&self, application_id: &str) -> Result<Vec<Payment>, ServiceError> {
        Ok(self.store.list_payments(application_id).await?)
    }
}

fn parse_gateway(name: Option<&str>) -> Result<Gateway, ServiceError> {
    name.map(str::trim)
        .and_then(Gateway::parse)
        .ok_or_else(|| ServiceError::Validation("Invalid payment gateway".to_string()))
}

fn payment_method(gateway: Gateway) -> PaymentMethod {
    match gateway {
        Gateway::Esewa => PaymentMethod::Esewa,
        Gateway::Khalti => PaymentMethod::Khalti,
    }
}

fn blank(value: &Option<String>) -> bool {
    present(value).is_none()
}

fn present(value: &Option<String>) -> Option<String> {
    value
        .as_deref()
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .map(String::from)
}

/// Accept `17000`, `17000.0`, `"17000"` or `"17000.00"`; anything with a
/// fractional rupee is rejected.
fn whole_rupees(value: &Value) -> Option<i64> {
    let from_float =
        |f: f64| (f.is_finite() && f.fract() == 0.0 && f.abs() < 1e15).then_some(f as i64);
    match value {
        Value::Number(n) => n.as_i64().or_else(|| n.as_f64().and_then(from_float)),
        Value::String(s) => {
            let s = s.trim();
            s.parse::<i64>()
                .ok()
                .or_else(|| s.parse::<f64>().ok().and_then(from_float))
        }
        _ => None,
    }
}

fn esewa_proof(request: &VerifyRequest) -> Option<EsewaProof> {
    let amt = match request.amt.as_ref()? {
        Value::String(s) if !s.trim().is_empty() => s.trim().to_string(),
        Value::Number(n) => n.to_string(),
        _ => return None,
    };
    Some(EsewaProof {
        oid: present(&request.oid)?,
        amt,
        ref_id: present(&request.ref_id)?,
    })
}
