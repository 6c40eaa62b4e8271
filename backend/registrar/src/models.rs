//! Registration and payment records, plus the enums that describe their state.

use std::collections::BTreeSet;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

// ─────────────────────────────────────────────────────────
// Enumerations
// ─────────────────────────────────────────────────────────

/// Legal form of the company being registered.
///
/// Unrecognised labels are kept verbatim in [`CompanyType::Other`] so the
/// record still round-trips; pricing treats them like a private company.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum CompanyType {
    Private,
    Public,
    Partnership,
    Sole,
    Other(String),
}

impl CompanyType {
    pub fn from_label(label: &str) -> Self {
        match label {
            "private" => Self::Private,
            "public" => Self::Public,
            "partnership" => Self::Partnership,
            "sole" => Self::Sole,
            other => Self::Other(other.to_string()),
        }
    }

    pub fn as_str(&self) -> &str {
        match self {
            Self::Private => "private",
            Self::Public => "public",
            Self::Partnership => "partnership",
            Self::Sole => "sole",
            Self::Other(label) => label,
        }
    }
}

impl From<String> for CompanyType {
    fn from(label: String) -> Self {
        Self::from_label(&label)
    }
}

impl From<CompanyType> for String {
    fn from(kind: CompanyType) -> Self {
        kind.as_str().to_string()
    }
}

impl fmt::Display for CompanyType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Back-office processing state of an application.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RegistrationStatus {
    Pending,
    Processing,
    Completed,
    Rejected,
}

/// How much of an application's fee has been collected.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PaymentStatus {
    Unpaid,
    Partial,
    Paid,
}

/// Channel a payment was collected through.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PaymentMethod {
    Esewa,
    Khalti,
    BankTransfer,
    Cash,
}

/// Lifecycle of a single payment record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransactionStatus {
    Pending,
    Completed,
    Failed,
    Refunded,
}

/// Review state of an uploaded document.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DocumentStatus {
    Pending,
    Approved,
    Rejected,
}

macro_rules! str_codec {
    ($ty:ty { $($variant:ident => $label:literal),+ $(,)? }) => {
        impl $ty {
            /// Short identifier used for storage columns and JSON.
            pub fn as_str(&self) -> &'static str {
                match self {
                    $(Self::$variant => $label,)+
                }
            }

            pub fn parse(raw: &str) -> Option<Self> {
                match raw {
                    $($label => Some(Self::$variant),)+
                    _ => None,
                }
            }
        }
    };
}

str_codec!(RegistrationStatus {
    Pending => "pending",
    Processing => "processing",
    Completed => "completed",
    Rejected => "rejected",
});

str_codec!(PaymentStatus {
    Unpaid => "unpaid",
    Partial => "partial",
    Paid => "paid",
});

str_codec!(PaymentMethod {
    Esewa => "esewa",
    Khalti => "khalti",
    BankTransfer => "bank_transfer",
    Cash => "cash",
});

str_codec!(TransactionStatus {
    Pending => "pending",
    Completed => "completed",
    Failed => "failed",
    Refunded => "refunded",
});

// ─────────────────────────────────────────────────────────
// Records
// ─────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Document {
    pub id: String,
    pub name: String,
    #[serde(rename = "type")]
    pub kind: String,
    pub url: String,
    pub uploaded_at: DateTime<Utc>,
    pub status: DocumentStatus,
}

/// A company registration application as held by the record store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Registration {
    pub id: String,
    pub application_id: String,
    pub company_type: CompanyType,
    pub company_name: String,
    pub business_activity: String,
    pub registered_address: String,
    pub contact_person: String,
    pub email: String,
    pub phone: String,
    pub pan_number: Option<String>,
    pub number_of_directors: Option<u32>,
    pub capital_amount: Option<i64>,
    pub additional_services: BTreeSet<String>,
    pub status: RegistrationStatus,
    pub total_fee: i64,
    pub estimated_completion_days: u32,
    pub paid_amount: i64,
    pub payment_status: PaymentStatus,
    pub documents: Vec<Document>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub estimated_completion_date: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub notes: Option<String>,
}

impl Registration {
    /// Build a registration from its creation fields. Identity and
    /// timestamps are supplied by the store.
    pub fn from_new(new: NewRegistration, id: String, now: DateTime<Utc>) -> Self {
        Self {
            id,
            application_id: new.application_id,
            company_type: new.company_type,
            company_name: new.company_name,
            business_activity: new.business_activity,
            registered_address: new.registered_address,
            contact_person: new.contact_person,
            email: new.email,
            phone: new.phone,
            pan_number: new.pan_number,
            number_of_directors: new.number_of_directors,
            capital_amount: new.capital_amount,
            additional_services: new.additional_services,
            status: new.status,
            total_fee: new.total_fee,
            estimated_completion_days: new.estimated_completion_days,
            paid_amount: new.paid_amount,
            payment_status: new.payment_status,
            documents: Vec::new(),
            created_at: now,
            updated_at: now,
            estimated_completion_date: new.estimated_completion_date,
            completed_at: None,
            notes: None,
        }
    }

    /// Merge the set fields of `patch` and refresh `updated_at`.
    pub fn apply(&mut self, patch: RegistrationPatch, now: DateTime<Utc>) {
        if let Some(status) = patch.status {
            self.status = status;
        }
        if let Some(payment_status) = patch.payment_status {
            self.payment_status = payment_status;
        }
        if let Some(paid_amount) = patch.paid_amount {
            self.paid_amount = paid_amount;
        }
        if let Some(completed_at) = patch.completed_at {
            self.completed_at = Some(completed_at);
        }
        if let Some(notes) = patch.notes {
            self.notes = Some(notes);
        }
        self.updated_at = now;
    }

    /// Patch describing the effect of collecting `amount` against this
    /// application. `paid_amount` never decreases.
    pub fn payment_patch(&self, amount: i64) -> RegistrationPatch {
        let paid_amount = self.paid_amount.saturating_add(amount.max(0));
        let payment_status = if paid_amount >= self.total_fee {
            PaymentStatus::Paid
        } else if paid_amount > 0 {
            PaymentStatus::Partial
        } else {
            PaymentStatus::Unpaid
        };
        RegistrationPatch {
            payment_status: Some(payment_status),
            paid_amount: Some(paid_amount),
            ..Default::default()
        }
    }
}

/// Creation fields of a [`Registration`].
#[derive(Debug, Clone, PartialEq)]
pub struct NewRegistration {
    pub application_id: String,
    pub company_type: CompanyType,
    pub company_name: String,
    pub business_activity: String,
    pub registered_address: String,
    pub contact_person: String,
    pub email: String,
    pub phone: String,
    pub pan_number: Option<String>,
    pub number_of_directors: Option<u32>,
    pub capital_amount: Option<i64>,
    pub additional_services: BTreeSet<String>,
    pub status: RegistrationStatus,
    pub total_fee: i64,
    pub estimated_completion_days: u32,
    pub paid_amount: i64,
    pub payment_status: PaymentStatus,
    pub estimated_completion_date: Option<DateTime<Utc>>,
}

/// Partial update of a [`Registration`]; `None` leaves a field untouched.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RegistrationPatch {
    pub status: Option<RegistrationStatus>,
    pub payment_status: Option<PaymentStatus>,
    pub paid_amount: Option<i64>,
    pub completed_at: Option<DateTime<Utc>>,
    pub notes: Option<String>,
}

/// A payment collected against an application.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Payment {
    pub id: String,
    pub application_id: String,
    pub amount: i64,
    pub method: PaymentMethod,
    pub transaction_id: Option<String>,
    pub status: TransactionStatus,
    pub created_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl Payment {
    pub fn from_new(new: NewPayment, id: String, now: DateTime<Utc>) -> Self {
        Self {
            id,
            application_id: new.application_id,
            amount: new.amount,
            method: new.method,
            transaction_id: new.transaction_id,
            status: new.status,
            created_at: now,
            completed_at: new.completed_at,
        }
    }

    /// Whether this record is the completed payment for `transaction_id`
    /// on `method`.
    pub fn settles(&self, method: PaymentMethod, transaction_id: &str) -> bool {
        self.status == TransactionStatus::Completed
            && self.method == method
            && self.transaction_id.as_deref() == Some(transaction_id)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct NewPayment {
    pub application_id: String,
    pub amount: i64,
    pub method: PaymentMethod,
    pub transaction_id: Option<String>,
    pub status: TransactionStatus,
    pub completed_at: Option<DateTime<Utc>>,
}

/// A gateway-confirmed payment to be written back against an application.
#[derive(Debug, Clone, PartialEq)]
pub struct Settlement {
    pub application_id: String,
    pub amount: i64,
    pub method: PaymentMethod,
    pub transaction_id: String,
}

impl Settlement {
    pub fn to_payment(&self, now: DateTime<Utc>) -> NewPayment {
        NewPayment {
            application_id: self.application_id.clone(),
            amount: self.amount,
            method: self.method,
            transaction_id: Some(self.transaction_id.clone()),
            status: TransactionStatus::Completed,
            completed_at: Some(now),
        }
    }
}

/// Result of applying a [`Settlement`].
#[derive(Debug, Clone, PartialEq)]
pub struct Settled {
    pub registration: Registration,
    pub payment: Payment,
    /// `false` when the transaction had already been recorded and nothing changed.
    pub newly_recorded: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn registration(total_fee: i64, paid_amount: i64) -> Registration {
        let now = Utc::now();
        Registration::from_new(
            NewRegistration {
                application_id: "NLS-1".to_string(),
                company_type: CompanyType::Private,
                company_name: "Acme Pvt Ltd".to_string(),
                business_activity: "Trading".to_string(),
                registered_address: "Kathmandu".to_string(),
                contact_person: "Ram Shrestha".to_string(),
                email: "ram@x.com".to_string(),
                phone: "9800000000".to_string(),
                pan_number: None,
                number_of_directors: None,
                capital_amount: None,
                additional_services: BTreeSet::new(),
                status: RegistrationStatus::Pending,
                total_fee,
                estimated_completion_days: 10,
                paid_amount,
                payment_status: PaymentStatus::Unpaid,
                estimated_completion_date: None,
            },
            "r1".to_string(),
            now,
        )
    }

    #[test]
    fn company_type_labels() {
        assert_eq!(CompanyType::from_label("public"), CompanyType::Public);
        assert_eq!(
            CompanyType::from_label("cooperative"),
            CompanyType::Other("cooperative".to_string())
        );
        assert_eq!(CompanyType::Other("ngo".to_string()).as_str(), "ngo");
    }

    #[test]
    fn company_type_serde_keeps_unknown_labels() {
        let kind: CompanyType = serde_json::from_str(r#""cooperative""#).unwrap();
        assert_eq!(serde_json::to_string(&kind).unwrap(), r#""cooperative""#);
    }

    #[test]
    fn status_codec() {
        assert_eq!(PaymentMethod::BankTransfer.as_str(), "bank_transfer");
        assert_eq!(PaymentMethod::parse("khalti"), Some(PaymentMethod::Khalti));
        assert_eq!(TransactionStatus::parse("refunded"), Some(TransactionStatus::Refunded));
        assert_eq!(RegistrationStatus::parse("archived"), None);
    }

    #[test]
    fn payment_patch_partial_then_paid() {
        let reg = registration(17000, 0);
        let patch = reg.payment_patch(5000);
        assert_eq!(patch.paid_amount, Some(5000));
        assert_eq!(patch.payment_status, Some(PaymentStatus::Partial));

        let reg = registration(17000, 5000);
        let patch = reg.payment_patch(12000);
        assert_eq!(patch.paid_amount, Some(17000));
        assert_eq!(patch.payment_status, Some(PaymentStatus::Paid));
    }

    #[test]
    fn payment_patch_never_decreases() {
        let reg = registration(17000, 5000);
        assert_eq!(reg.payment_patch(-300).paid_amount, Some(5000));
    }

    #[test]
    fn apply_refreshes_updated_at_only_for_set_fields() {
        let mut reg = registration(17000, 0);
        let later = reg.updated_at + chrono::Duration::seconds(5);
        reg.apply(
            RegistrationPatch {
                status: Some(RegistrationStatus::Processing),
                ..Default::default()
            },
            later,
        );
        assert_eq!(reg.status, RegistrationStatus::Processing);
        assert_eq!(reg.payment_status, PaymentStatus::Unpaid);
        assert_eq!(reg.updated_at, later);
        assert!(reg.created_at < reg.updated_at);
    }
}
