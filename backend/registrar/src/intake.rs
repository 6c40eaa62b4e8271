//! Application intake: validation, pricing, id assignment, and status lookup.

use std::collections::BTreeSet;

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use tracing::info;
use uuid::Uuid;

use crate::errors::ServiceError;
use crate::fees;
use crate::models::{CompanyType, NewRegistration, PaymentStatus, RegistrationStatus};
use crate::notify::{Notification, SharedNotifier};
use crate::store::SharedStore;

const APPLICATION_PREFIX: &str = "NLS";

/// Registration form as submitted by the client. Every field is optional
/// here so that validation can report all missing fields at once.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RegistrationRequest {
    pub company_type: Option<String>,
    pub company_name: Option<String>,
    pub business_activity: Option<String>,
    pub registered_address: Option<String>,
    pub contact_person: Option<String>,
    pub email: Option<String>,
    pub phone: Option<String>,
    pub pan_number: Option<String>,
    pub number_of_directors: Option<u32>,
    pub capital_amount: Option<i64>,
    #[serde(default)]
    pub additional_services: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Submission {
    pub application_id: String,
    pub estimated_days: u32,
    pub total_fee: i64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StatusSummary {
    pub application_id: String,
    pub status: RegistrationStatus,
    pub payment_status: PaymentStatus,
    pub total_fee: i64,
    pub paid_amount: i64,
    pub message: String,
}

pub struct IntakeService {
    store: SharedStore,
    notifier: SharedNotifier,
}

impl IntakeService {
    pub fn new(store: SharedStore, notifier: SharedNotifier) -> Self {
        Self { store, notifier }
    }

    pub async fn submit(&self, request: RegistrationRequest) -> Result<Submission, ServiceError> {
        let required = RequiredFields::extract(&request)?;
        let now = Utc::now();

        let company_type = CompanyType::from_label(required.company_type);
        let additional_services: BTreeSet<String> = request
            .additional_services
            .iter()
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
            .collect();
        let total_fee = fees::compute_fee(
            &company_type,
            additional_services.iter().map(String::as_str),
        );
        let estimated_days = fees::estimate_days(&company_type);

        let registration = self
            .store
            .create_registration(NewRegistration {
                application_id: generate_application_id(now),
                company_type,
                company_name: required.company_name.to_string(),
                business_activity: required.business_activity.to_string(),
                registered_address: required.registered_address.to_string(),
                contact_person: required.contact_person.to_string(),
                email: required.email.to_string(),
                phone: required.phone.to_string(),
                pan_number: request
                    .pan_number
                    .as_deref()
                    .map(str::trim)
                    .filter(|s| !s.is_empty())
                    .map(String::from),
                number_of_directors: request.number_of_directors,
                capital_amount: request.capital_amount,
                additional_services,
                status: RegistrationStatus::Pending,
                total_fee,
                estimated_completion_days: estimated_days,
                paid_amount: 0,
                payment_status: PaymentStatus::Unpaid,
                estimated_completion_date: Some(now + Duration::days(i64::from(estimated_days))),
            })
            .await?;

        info!(
            application_id = %registration.application_id,
            company_type = %registration.company_type,
            total_fee,
            "Registration received"
        );
        self.notifier
            .notify(Notification::registration_received(&registration));

        Ok(Submission {
            application_id: registration.application_id,
            estimated_days,
            total_fee,
        })
    }

    pub async fn lookup(&self, application_id: &str) -> Result<StatusSummary, ServiceError> {
        let registration = self
            .store
            .get_registration(application_id)
            .await?
            .ok_or_else(|| ServiceError::NotFound("Application not found".to_string()))?;

        Ok(StatusSummary {
            message: status_message(registration.status).to_string(),
            application_id: registration.application_id,
            status: registration.status,
            payment_status: registration.payment_status,
            total_fee: registration.total_fee,
            paid_amount: registration.paid_amount,
        })
    }
}

/// Borrowed, trimmed values of the mandatory form fields.
struct RequiredFields<'a> {
    company_type: &'a str,
    company_name: &'a str,
    business_activity: &'a str,
    registered_address: &'a str,
    contact_person: &'a str,
    email: &'a str,
    phone: &'a str,
}

impl<'a> RequiredFields<'a> {
    fn extract(request: &'a RegistrationRequest) -> Result<Self, ServiceError> {
        let mut missing = Vec::new();
        let mut take = |name: &'static str, value: &'a Option<String>| {
            match value.as_deref().map(str::trim).filter(|v| !v.is_empty()) {
                Some(v) => v,
                None => {
                    missing.push(name);
                    ""
                }
            }
        };

        let fields = RequiredFields {
            company_type: take("companyType", &request.company_type),
            company_name: take("companyName", &request.company_name),
            business_activity: take("businessActivity", &request.business_activity),
            registered_address: take("registeredAddress", &request.registered_address),
            contact_person: take("contactPerson", &request.contact_person),
            email: take("email", &request.email),
            phone: take("phone", &request.phone),
        };

        if missing.is_empty() {
            Ok(fields)
        } else {
            Err(ServiceError::Validation(format!(
                "Missing required fields: {}",
                missing.join(", ")
            )))
        }
    }
}

/// `NLS-<unix millis>-<12 random hex digits>`. Carries nothing about the applicant.
pub fn generate_application_id(now: DateTime<Utc>) -> String {
    let random = Uuid::new_v4().simple().to_string();
    format!(
        "{APPLICATION_PREFIX}-{}-{}",
        now.timestamp_millis(),
        random[..12].to_ascii_uppercase()
    )
}

fn status_message(status: RegistrationStatus) -> &'static str {
    match status {
        RegistrationStatus::Pending => "Application is being processed",
        RegistrationStatus::Processing => "Application is under review with the registrar",
        RegistrationStatus::Completed => "Company registration is complete",
        RegistrationStatus::Rejected => "Application was rejected; please contact us",
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use std::collections::HashSet;
    use std::sync::Arc;

    use super::*;
    use crate::models::RegistrationPatch;
    use crate::notify::RecordingNotifier;
    use crate::store::{MemoryStore, RecordStore};

    pub fn acme_request() -> RegistrationRequest {
        RegistrationRequest {
            company_type: Some("private".to_string()),
            company_name: Some("Acme Pvt Ltd".to_string()),
            business_activity: Some("Trading".to_string()),
            registered_address: Some("Kathmandu".to_string()),
            contact_person: Some("Ram Shrestha".to_string()),
            email: Some("ram@x.com".to_string()),
            phone: Some("9800000000".to_string()),
            additional_services: vec!["PAN Registration".to_string()],
            ..Default::default()
        }
    }

    fn service() -> (IntakeService, MemoryStore, Arc<RecordingNotifier>) {
        let store = MemoryStore::new();
        let notifier = Arc::new(RecordingNotifier::default());
        let service = IntakeService::new(Arc::new(store.clone()), notifier.clone());
        (service, store, notifier)
    }

    #[tokio::test]
    async fn acme_private_with_pan() {
        let (service, store, notifier) = service();
        let submission = service.submit(acme_request()).await.unwrap();

        assert_eq!(submission.total_fee, 17000);
        assert_eq!(submission.estimated_days, 10);
        assert!(submission.application_id.starts_with("NLS-"));

        let stored = store
            .get_registration(&submission.application_id)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(stored.status, RegistrationStatus::Pending);
        assert_eq!(stored.payment_status, PaymentStatus::Unpaid);
        assert_eq!(stored.paid_amount, 0);
        assert_eq!(
            stored.estimated_completion_date,
            Some(stored.created_at + Duration::days(10))
        );

        let sent = notifier.sent();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].application_id(), submission.application_id);
    }

    #[tokio::test]
    async fn reports_every_missing_field() {
        let (service, _, notifier) = service();
        let request = RegistrationRequest {
            company_name: Some("   ".to_string()),
            email: None,
            phone: Some(String::new()),
            ..acme_request()
        };
        let err = service.submit(request).await.unwrap_err();
        match err {
            ServiceError::Validation(msg) => {
                assert_eq!(msg, "Missing required fields: companyName, email, phone")
            }
            other => panic!("expected validation error, got {other:?}"),
        }
        assert!(notifier.sent().is_empty());
    }

    #[tokio::test]
    async fn empty_request_names_all_seven_fields() {
        let (service, _, _) = service();
        let Err(ServiceError::Validation(msg)) =
            service.submit(RegistrationRequest::default()).await
        else {
            panic!("expected validation error");
        };
        let named: Vec<&str> = msg
            .trim_start_matches("Missing required fields: ")
            .split(", ")
            .collect();
        assert_eq!(
            named,
            [
                "companyType",
                "companyName",
                "businessActivity",
                "registeredAddress",
                "contactPerson",
                "email",
                "phone"
            ]
        );
    }

    #[tokio::test]
    async fn duplicate_services_are_charged_once() {
        let (service, _, _) = service();
        let request = RegistrationRequest {
            additional_services: vec![
                "PAN Registration".to_string(),
                "PAN Registration".to_string(),
                "VAT Registration".to_string(),
            ],
            ..acme_request()
        };
        assert_eq!(service.submit(request).await.unwrap().total_fee, 20000);
    }

    #[test]
    fn application_ids_do_not_collide() {
        let now = Utc::now();
        let ids: HashSet<String> = (0..10_000).map(|_| generate_application_id(now)).collect();
        assert_eq!(ids.len(), 10_000);
    }

    #[tokio::test]
    async fn distinct_submissions_get_distinct_ids() {
        let (service, _, _) = service();
        let first = service.submit(acme_request()).await.unwrap();
        let second = service
            .submit(RegistrationRequest {
                company_name: Some("Beta Traders".to_string()),
                ..acme_request()
            })
            .await
            .unwrap();
        assert_ne!(first.application_id, second.application_id);
    }

    #[tokio::test]
    async fn lookup_unknown_is_not_found() {
        let (service, _, _) = service();
        assert!(matches!(
            service.lookup("NLS-0-MISSING").await,
            Err(ServiceError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn lookup_reflects_current_status_without_mutating() {
        let (service, store, _) = service();
        let submission = service.submit(acme_request()).await.unwrap();
        let before = store
            .get_registration(&submission.application_id)
            .await
            .unwrap()
            .unwrap();

        let summary = service.lookup(&submission.application_id).await.unwrap();
        assert_eq!(summary.status, RegistrationStatus::Pending);
        assert_eq!(summary.message, "Application is being processed");

        let after = store
            .get_registration(&submission.application_id)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(before, after);

        store
            .update_registration(
                &after.id,
                RegistrationPatch {
                    status: Some(RegistrationStatus::Completed),
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        let summary = service.lookup(&submission.application_id).await.unwrap();
        assert_eq!(summary.status, RegistrationStatus::Completed);
    }
}
