//! Record store interface and the default in-process implementation.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use tokio::sync::RwLock;
use uuid::Uuid;

use crate::errors::Result;
use crate::models::{
    NewPayment, NewRegistration, Payment, Registration, RegistrationPatch, Settled, Settlement,
};

/// Create/read/update access to registrations and payments.
///
/// Services hold an `Arc<dyn RecordStore>` so a durable backend can replace
/// the in-memory map without touching callers.
#[async_trait]
pub trait RecordStore: Send + Sync {
    async fn create_registration(&self, new: NewRegistration) -> Result<Registration>;

    async fn get_registration(&self, application_id: &str) -> Result<Option<Registration>>;

    /// Merge `patch` into the registration with store id `id`.
    async fn update_registration(
        &self,
        id: &str,
        patch: RegistrationPatch,
    ) -> Result<Option<Registration>>;

    async fn create_payment(&self, new: NewPayment) -> Result<Payment>;

    async fn list_payments(&self, application_id: &str) -> Result<Vec<Payment>>;

    /// Record a gateway-confirmed payment and credit the registration in a
    /// single step. A transaction id already recorded for the same method
    /// is returned unchanged with `newly_recorded = false`.
    ///
    /// Returns `None` when no registration has `settlement.application_id`.
    async fn settle_payment(&self, settlement: Settlement) -> Result<Option<Settled>>;
}

pub type SharedStore = Arc<dyn RecordStore>;

pub(crate) fn new_record_id() -> String {
    Uuid::new_v4().simple().to_string()
}

#[derive(Default)]
struct Tables {
    registrations: HashMap<String, Registration>,
    payments: Vec<Payment>,
}

impl Tables {
    fn find_by_application(&self, application_id: &str) -> Option<&Registration> {
        self.registrations
            .values()
            .find(|r| r.application_id == application_id)
    }
}

/// A thread-safe, non-persistent store.
///
/// Both tables sit behind one lock so settlement is atomic.
#[derive(Default, Clone)]
pub struct MemoryStore {
    tables: Arc<RwLock<Tables>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl RecordStore for MemoryStore {
    async fn create_registration(&self, new: NewRegistration) -> Result<Registration> {
        let registration = Registration::from_new(new, new_record_id(), Utc::now());
        let mut tables = self.tables.write().await;
        tables
            .registrations
            .insert(registration.id.clone(), registration.clone());
        Ok(registration)
    }

    async fn get_registration(&self, application_id: &str) -> Result<Option<Registration>> {
        let tables = self.tables.read().await;
        Ok(tables.find_by_application(application_id).cloned())
    }

    async fn update_registration(
        &self,
        id: &str,
        patch: RegistrationPatch,
    ) -> Result<Option<Registration>> {
        let mut tables = self.tables.write().await;
        Ok(tables.registrations.get_mut(id).map(|registration| {
            registration.apply(patch, Utc::now());
            registration.clone()
        }))
    }

    async fn create_payment(&self, new: NewPayment) -> Result<Payment> {
        let payment = Payment::from_new(new, new_record_id(), Utc::now());
        let mut tables = self.tables.write().await;
        tables.payments.push(payment.clone());
        Ok(payment)
    }

    async fn list_payments(&self, application_id: &str) -> Result<Vec<Payment>> {
        let tables = self.tables.read().await;
        Ok(tables
            .payments
            .iter()
            .filter(|p| p.application_id == application_id)
            .cloned()
            .collect())
    }

    async fn settle_payment(&self, settlement: Settlement) -> Result<Option<Settled>> {
        let mut tables = self.tables.write().await;
        let Some(registration) = tables.find_by_application(&settlement.application_id) else {
            return Ok(None);
        };
        let registration_id = registration.id.clone();

        if let Some(existing) = tables
            .payments
            .iter()
            .find(|p| p.settles(settlement.method, &settlement.transaction_id))
        {
            return Ok(Some(Settled {
                registration: registration.clone(),
                payment: existing.clone(),
                newly_recorded: false,
            }));
        }

        let now = Utc::now();
        let patch = registration.payment_patch(settlement.amount);
        let payment = Payment::from_new(settlement.to_payment(now), new_record_id(), now);
        tables.payments.push(payment.clone());

        let registration = match tables.registrations.get_mut(&registration_id) {
            Some(registration) => {
                registration.apply(patch, now);
                registration.clone()
            }
            None => return Ok(None),
        };

        Ok(Some(Settled {
            registration,
            payment,
            newly_recorded: true,
        }))
    }
}
