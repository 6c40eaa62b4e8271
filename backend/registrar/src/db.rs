//! SQLite-backed [`RecordStore`] — migrations, row mapping, and queries.

use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions};
use sqlx::{Sqlite, SqlitePool, Transaction};
use tokio::sync::Mutex;
use tracing::{info, warn};

use crate::errors::{RegistrarError, Result};
use crate::models::{
    CompanyType, NewPayment, NewRegistration, Payment, PaymentMethod, PaymentStatus, Registration,
    RegistrationPatch, RegistrationStatus, Settled, Settlement, TransactionStatus,
};
use crate::store::{new_record_id, RecordStore};

const BUSY_TIMEOUT: Duration = Duration::from_secs(5);

/// Establish a SQLite connection pool and run pending migrations.
pub async fn init_pool(database_url: &str) -> Result<SqlitePool> {
    let url = if database_url.starts_with("sqlite:") {
        database_url.to_string()
    } else {
        format!("sqlite:{database_url}")
    };
    let options = SqliteConnectOptions::from_str(&url)?
        .create_if_missing(true)
        .busy_timeout(BUSY_TIMEOUT);

    // Every connection to `:memory:` opens its own database, so keep exactly one alive.
    let pool = if url.contains(":memory:") {
        SqlitePoolOptions::new()
            .max_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect_with(options)
            .await?
    } else {
        SqlitePoolOptions::new()
            .max_connections(5)
            .connect_with(options.journal_mode(SqliteJournalMode::Wal))
            .await?
    };

    sqlx::migrate!("./migrations").run(&pool).await?;
    info!("Database migrations applied successfully");
    Ok(pool)
}

/// Write transactions read before they write, so two of them interleaving
/// on separate connections cannot both upgrade to a write lock. `writer`
/// lets one through at a time.
#[derive(Clone)]
pub struct SqliteStore {
    pool: SqlitePool,
    writer: Arc<Mutex<()>>,
}

impl SqliteStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self {
            pool,
            writer: Arc::default(),
        }
    }

    pub async fn connect(database_url: &str) -> Result<Self> {
        Ok(Self::new(init_pool(database_url).await?))
    }

    async fn already_settled(&self, settlement: &Settlement) -> Result<Option<Settled>> {
        let mut tx = self.pool.begin().await?;
        let registration =
            fetch_registration(&mut tx, "application_id", &settlement.application_id).await?;
        let payment = fetch_settled(&mut tx, settlement).await?;
        tx.commit().await?;
        Ok(registration.zip(payment).map(|(registration, payment)| Settled {
            registration,
            payment,
            newly_recorded: false,
        }))
    }
}

// ─────────────────────────────────────────────────────────
// Row shapes
// ─────────────────────────────────────────────────────────

#[derive(sqlx::FromRow)]
struct RegistrationRow {
    id: String,
    application_id: String,
    company_type: String,
    company_name: String,
    business_activity: String,
    registered_address: String,
    contact_person: String,
    email: String,
    phone: String,
    pan_number: Option<String>,
    number_of_directors: Option<i64>,
    capital_amount: Option<i64>,
    additional_services: String,
    status: String,
    total_fee: i64,
    estimated_completion_days: i64,
    paid_amount: i64,
    payment_status: String,
    documents: String,
    created_at: i64,
    updated_at: i64,
    estimated_completion_date: Option<i64>,
    completed_at: Option<i64>,
    notes: Option<String>,
}

impl TryFrom<RegistrationRow> for Registration {
    type Error = RegistrarError;

    fn try_from(row: RegistrationRow) -> Result<Self> {
        Ok(Registration {
            company_type: CompanyType::from_label(&row.company_type),
            additional_services: serde_json::from_str(&row.additional_services)?,
            status: RegistrationStatus::parse(&row.status)
                .ok_or_else(|| corrupt("registration status", &row.status))?,
            payment_status: PaymentStatus::parse(&row.payment_status)
                .ok_or_else(|| corrupt("payment status", &row.payment_status))?,
            number_of_directors: row
                .number_of_directors
                .map(u32::try_from)
                .transpose()
                .map_err(|_| corrupt("number_of_directors", &row.id))?,
            estimated_completion_days: u32::try_from(row.estimated_completion_days)
                .map_err(|_| corrupt("estimated_completion_days", &row.id))?,
            documents: serde_json::from_str(&row.documents)?,
            created_at: from_millis(row.created_at)?,
            updated_at: from_millis(row.updated_at)?,
            estimated_completion_date: row.estimated_completion_date.map(from_millis).transpose()?,
            completed_at: row.completed_at.map(from_millis).transpose()?,
            id: row.id,
            application_id: row.application_id,
            company_name: row.company_name,
            business_activity: row.business_activity,
            registered_address: row.registered_address,
            contact_person: row.contact_person,
            email: row.email,
            phone: row.phone,
            pan_number: row.pan_number,
            capital_amount: row.capital_amount,
            total_fee: row.total_fee,
            paid_amount: row.paid_amount,
            notes: row.notes,
        })
    }
}

#[derive(sqlx::FromRow)]
struct PaymentRow {
    id: String,
    application_id: String,
    amount: i64,
    method: String,
    transaction_id: Option<String>,
    status: String,
    created_at: i64,
    completed_at: Option<i64>,
}

impl TryFrom<PaymentRow> for Payment {
    type Error = RegistrarError;

    fn try_from(row: PaymentRow) -> Result<Self> {
        Ok(Payment {
            method: PaymentMethod::parse(&row.method)
                .ok_or_else(|| corrupt("payment method", &row.method))?,
            status: TransactionStatus::parse(&row.status)
                .ok_or_else(|| corrupt("payment status", &row.status))?,
            created_at: from_millis(row.created_at)?,
            completed_at: row.completed_at.map(from_millis).transpose()?,
            id: row.id,
            application_id: row.application_id,
            amount: row.amount,
            transaction_id: row.transaction_id,
        })
    }
}

fn corrupt(what: &str, value: &str) -> RegistrarError {
    RegistrarError::Corrupt(format!("unexpected {what}: {value}"))
}

fn from_millis(ms: i64) -> Result<DateTime<Utc>> {
    DateTime::from_timestamp_millis(ms)
        .ok_or_else(|| RegistrarError::Corrupt(format!("timestamp out of range: {ms}")))
}

const REGISTRATION_COLUMNS: &str = r#"
    id, application_id, company_type, company_name, business_activity,
    registered_address, contact_person, email, phone, pan_number,
    number_of_directors, capital_amount, additional_services, status,
    total_fee, estimated_completion_days, paid_amount, payment_status,
    documents, created_at, updated_at, estimated_completion_date,
    completed_at, notes
"#;

const PAYMENT_COLUMNS: &str =
    "id, application_id, amount, method, transaction_id, status, created_at, completed_at";

// ─────────────────────────────────────────────────────────
// Query helpers
// ─────────────────────────────────────────────────────────

async fn fetch_registration(
    tx: &mut Transaction<'_, Sqlite>,
    column: &str,
    value: &str,
) -> Result<Option<Registration>> {
    let sql = format!("SELECT {REGISTRATION_COLUMNS} FROM registrations WHERE {column} = ?1");
    let row = sqlx::query_as::<_, RegistrationRow>(&sql)
        .bind(value)
        .fetch_optional(&mut **tx)
        .await?;
    row.map(Registration::try_from).transpose()
}

/// Write back the mutable columns of `registration`.
async fn save_mutable_fields(
    tx: &mut Transaction<'_, Sqlite>,
    registration: &Registration,
) -> Result<()> {
    sqlx::query(
        r#"
        UPDATE registrations
        SET    status = ?1, payment_status = ?2, paid_amount = ?3,
               completed_at = ?4, notes = ?5, updated_at = ?6
        WHERE  id = ?7
        "#,
    )
    .bind(registration.status.as_str())
    .bind(registration.payment_status.as_str())
    .bind(registration.paid_amount)
    .bind(registration.completed_at.map(|t| t.timestamp_millis()))
    .bind(&registration.notes)
    .bind(registration.updated_at.timestamp_millis())
    .bind(&registration.id)
    .execute(&mut **tx)
    .await?;
    Ok(())
}

/// The completed payment already recorded for this settlement's transaction.
async fn fetch_settled(
    tx: &mut Transaction<'_, Sqlite>,
    settlement: &Settlement,
) -> Result<Option<Payment>> {
    let sql = format!(
        "SELECT {PAYMENT_COLUMNS} FROM payments \
         WHERE method = ?1 AND transaction_id = ?2 AND status = 'completed'"
    );
    let row = sqlx::query_as::<_, PaymentRow>(&sql)
        .bind(settlement.method.as_str())
        .bind(&settlement.transaction_id)
        .fetch_optional(&mut **tx)
        .await?;
    row.map(Payment::try_from).transpose()
}

fn is_unique_violation(e: &RegistrarError) -> bool {
    match e {
        RegistrarError::Database(e) => e
            .as_database_error()
            .is_some_and(|db| db.is_unique_violation()),
        _ => false,
    }
}

async fn insert_payment(tx: &mut Transaction<'_, Sqlite>, payment: &Payment) -> Result<()> {
    sqlx::query(
        r#"
        INSERT INTO payments
            (id, application_id, amount, method, transaction_id, status, created_at, completed_at)
        VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)
        "#,
    )
    .bind(&payment.id)
    .bind(&payment.application_id)
    .bind(payment.amount)
    .bind(payment.method.as_str())
    .bind(&payment.transaction_id)
    .bind(payment.status.as_str())
    .bind(payment.created_at.timestamp_millis())
    .bind(payment.completed_at.map(|t| t.timestamp_millis()))
    .execute(&mut **tx)
    .await?;
    Ok(())
}

// ─────────────────────────────────────────────────────────
// RecordStore
// ─────────────────────────────────────────────────────────

#[async_trait]
impl RecordStore for SqliteStore {
    async fn create_registration(&self, new: NewRegistration) -> Result<Registration> {
        let registration = Registration::from_new(new, new_record_id(), Utc::now());
        let _writer = self.writer.lock().await;
        let sql = format!(
            "INSERT INTO registrations ({REGISTRATION_COLUMNS}) VALUES \
             (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16, ?17, ?18, \
              ?19, ?20, ?21, ?22, ?23, ?24)"
        );
        sqlx::query(&sql)
            .bind(&registration.id)
            .bind(&registration.application_id)
            .bind(registration.company_type.as_str())
            .bind(&registration.company_name)
            .bind(&registration.business_activity)
            .bind(&registration.registered_address)
            .bind(&registration.contact_person)
            .bind(&registration.email)
            .bind(&registration.phone)
            .bind(&registration.pan_number)
            .bind(registration.number_of_directors.map(i64::from))
            .bind(registration.capital_amount)
            .bind(serde_json::to_string(&registration.additional_services)?)
            .bind(registration.status.as_str())
            .bind(registration.total_fee)
            .bind(i64::from(registration.estimated_completion_days))
            .bind(registration.paid_amount)
            .bind(registration.payment_status.as_str())
            .bind(serde_json::to_string(&registration.documents)?)
            .bind(registration.created_at.timestamp_millis())
            .bind(registration.updated_at.timestamp_millis())
            .bind(
                registration
                    .estimated_completion_date
                    .map(|t| t.timestamp_millis()),
            )
            .bind(registration.completed_at.map(|t| t.timestamp_millis()))
            .bind(&registration.notes)
            .execute(&self.pool)
            .await?;
        Ok(registration)
    }

    async fn get_registration(&self, application_id: &str) -> Result<Option<Registration>> {
        let sql = format!("SELECT {REGISTRATION_COLUMNS} FROM registrations WHERE application_id = ?1");
        let row = sqlx::query_as::<_, RegistrationRow>(&sql)
            .bind(application_id)
            .fetch_optional(&self.pool)
            .await?;
        row.map(Registration::try_from).transpose()
    }

    async fn update_registration(
        &self,
        id: &str,
        patch: RegistrationPatch,
    ) -> Result<Option<Registration>> {
        let _writer = self.writer.lock().await;
        let mut tx = self.pool.begin().await?;
        let Some(mut registration) = fetch_registration(&mut tx, "id", id).await? else {
            return Ok(None);
        };
        registration.apply(patch, Utc::now());
        save_mutable_fields(&mut tx, &registration).await?;
        tx.commit().await?;
        Ok(Some(registration))
    }

    async fn create_payment(&self, new: NewPayment) -> Result<Payment> {
        let payment = Payment::from_new(new, new_record_id(), Utc::now());
        let _writer = self.writer.lock().await;
        let mut tx = self.pool.begin().await?;
        insert_payment(&mut tx, &payment).await?;
        tx.commit().await?;
        Ok(payment)
    }

    async fn list_payments(&self, application_id: &str) -> Result<Vec<Payment>> {
        let sql = format!(
            "SELECT {PAYMENT_COLUMNS} FROM payments WHERE application_id = ?1 \
             ORDER BY created_at ASC, id ASC"
        );
        let rows = sqlx::query_as::<_, PaymentRow>(&sql)
            .bind(application_id)
            .fetch_all(&self.pool)
            .await?;
        rows.into_iter().map(Payment::try_from).collect()
    }

    async fn settle_payment(&self, settlement: Settlement) -> Result<Option<Settled>> {
        let _writer = self.writer.lock().await;
        let mut tx = self.pool.begin().await?;
        let Some(mut registration) =
            fetch_registration(&mut tx, "application_id", &settlement.application_id).await?
        else {
            return Ok(None);
        };

        if let Some(payment) = fetch_settled(&mut tx, &settlement).await? {
            return Ok(Some(Settled {
                registration,
                payment,
                newly_recorded: false,
            }));
        }

        let now = Utc::now();
        let payment = Payment::from_new(settlement.to_payment(now), new_record_id(), now);
        match insert_payment(&mut tx, &payment).await {
            Ok(()) => {}
            // Another process recorded the same transaction since our check.
            Err(e) if is_unique_violation(&e) => {
                tx.rollback().await?;
                warn!(
                    application_id = %settlement.application_id,
                    transaction_id = %settlement.transaction_id,
                    "Concurrent settlement of the same transaction; returning the stored payment"
                );
                return self.already_settled(&settlement).await;
            }
            Err(e) => return Err(e),
        }

        let patch = registration.payment_patch(settlement.amount);
        registration.apply(patch, now);
        save_mutable_fields(&mut tx, &registration).await?;
        tx.commit().await?;

        Ok(Some(Settled {
            registration,
            payment,
            newly_recorded: true,
        }))
    }
}

// ─────────────────────────────────────────────────────────
// Unit tests
// ─────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::fixtures::{new_registration, settlement};

    async fn store() -> SqliteStore {
        SqliteStore::connect("sqlite::memory:").await.unwrap()
    }

    /// A store over a fresh database file, so the pool really has several connections.
    async fn file_store() -> (SqliteStore, std::path::PathBuf) {
        let path = std::env::temp_dir().join(format!("registrar-{}.db", new_record_id()));
        let store = SqliteStore::connect(&path.display().to_string()).await.unwrap();
        (store, path)
    }

    fn remove_db(path: &std::path::Path) {
        for suffix in ["", "-wal", "-shm"] {
            let _ = std::fs::remove_file(format!("{}{suffix}", path.display()));
        }
    }

    #[tokio::test]
    async fn registration_round_trips_through_sqlite() {
        let store = store().await;
        let created = store
            .create_registration(new_registration("NLS-1", 17000))
            .await
            .unwrap();
        let fetched = store.get_registration("NLS-1").await.unwrap().unwrap();

        assert_eq!(fetched.id, created.id);
        assert_eq!(fetched.company_type, CompanyType::Private);
        assert_eq!(fetched.additional_services, created.additional_services);
        assert_eq!(fetched.number_of_directors, Some(2));
        assert_eq!(
            fetched.created_at.timestamp_millis(),
            created.created_at.timestamp_millis()
        );
        assert!(store.get_registration("NLS-2").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn application_id_is_unique() {
        let store = store().await;
        store
            .create_registration(new_registration("NLS-1", 17000))
            .await
            .unwrap();
        let duplicate = store
            .create_registration(new_registration("NLS-1", 5000))
            .await;
        assert!(matches!(duplicate, Err(RegistrarError::Database(_))));
    }

    #[tokio::test]
    async fn update_persists_patch() {
        let store = store().await;
        let created = store
            .create_registration(new_registration("NLS-1", 17000))
            .await
            .unwrap();
        store
            .update_registration(
                &created.id,
                RegistrationPatch {
                    status: Some(RegistrationStatus::Rejected),
                    ..Default::default()
                },
            )
            .await
            .unwrap()
            .unwrap();

        let fetched = store.get_registration("NLS-1").await.unwrap().unwrap();
        assert_eq!(fetched.status, RegistrationStatus::Rejected);
        assert!(store
            .update_registration("missing", RegistrationPatch::default())
            .await
            .unwrap()
            .is_none());
    }

    #[tokio::test]
    async fn settlement_is_idempotent_per_transaction() {
        let store = store().await;
        store
            .create_registration(new_registration("NLS-1", 17000))
            .await
            .unwrap();

        let first = store
            .settle_payment(settlement("NLS-1", 5000, "TXN-1"))
            .await
            .unwrap()
            .unwrap();
        assert!(first.newly_recorded);
        assert_eq!(first.registration.payment_status, PaymentStatus::Partial);

        let replay = store
            .settle_payment(settlement("NLS-1", 5000, "TXN-1"))
            .await
            .unwrap()
            .unwrap();
        assert!(!replay.newly_recorded);
        assert_eq!(replay.payment.id, first.payment.id);

        let second = store
            .settle_payment(settlement("NLS-1", 12000, "TXN-2"))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(second.registration.paid_amount, 17000);
        assert_eq!(second.registration.payment_status, PaymentStatus::Paid);

        let stored = store.get_registration("NLS-1").await.unwrap().unwrap();
        assert_eq!(stored.paid_amount, 17000);
        assert_eq!(store.list_payments("NLS-1").await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn settlement_for_unknown_application_writes_nothing() {
        let store = store().await;
        assert!(store
            .settle_payment(settlement("NLS-404", 100, "TXN-1"))
            .await
            .unwrap()
            .is_none());
        assert!(store.list_payments("NLS-404").await.unwrap().is_empty());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_settlements_on_file_database_all_land() {
        let (store, path) = file_store().await;
        for i in 0..20 {
            store
                .create_registration(new_registration(&format!("NLS-{i}"), 17000))
                .await
                .unwrap();
        }

        let tasks: Vec<_> = (0..20)
            .map(|i| {
                let store = store.clone();
                tokio::spawn(async move {
                    store
                        .settle_payment(settlement(&format!("NLS-{i}"), 17000, &format!("TXN-{i}")))
                        .await
                })
            })
            .collect();
        for task in tasks {
            let settled = task.await.unwrap().unwrap().unwrap();
            assert!(settled.newly_recorded);
        }

        for i in 0..20 {
            let id = format!("NLS-{i}");
            let registration = store.get_registration(&id).await.unwrap().unwrap();
            assert_eq!(registration.paid_amount, 17000);
            assert_eq!(registration.payment_status, PaymentStatus::Paid);
            assert_eq!(store.list_payments(&id).await.unwrap().len(), 1);
        }
        remove_db(&path);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn same_transaction_on_two_applications_records_once() {
        let (store, path) = file_store().await;
        store
            .create_registration(new_registration("NLS-A", 17000))
            .await
            .unwrap();
        store
            .create_registration(new_registration("NLS-B", 17000))
            .await
            .unwrap();

        for round in 0..10 {
            let txn = format!("TXN-{round}");
            let a = tokio::spawn({
                let store = store.clone();
                let txn = txn.clone();
                async move { store.settle_payment(settlement("NLS-A", 1, &txn)).await }
            });
            let b = tokio::spawn({
                let store = store.clone();
                async move { store.settle_payment(settlement("NLS-B", 1, &txn)).await }
            });
            let a = a.await.unwrap().unwrap().unwrap();
            let b = b.await.unwrap().unwrap().unwrap();
            assert_ne!(a.newly_recorded, b.newly_recorded);
            assert_eq!(a.payment.id, b.payment.id);
        }

        let paid = store.get_registration("NLS-A").await.unwrap().unwrap().paid_amount
            + store.get_registration("NLS-B").await.unwrap().unwrap().paid_amount;
        assert_eq!(paid, 10);
        let recorded = store.list_payments("NLS-A").await.unwrap().len()
            + store.list_payments("NLS-B").await.unwrap().len();
        assert_eq!(recorded, 10);
        remove_db(&path);
    }

    #[tokio::test]
    async fn unique_violation_is_recognised() {
        let store = store().await;
        store
            .create_registration(new_registration("NLS-1", 17000))
            .await
            .unwrap();
        let payment = Payment::from_new(
            settlement("NLS-1", 100, "TXN-1").to_payment(Utc::now()),
            new_record_id(),
            Utc::now(),
        );
        let mut tx = store.pool.begin().await.unwrap();
        insert_payment(&mut tx, &payment).await.unwrap();
        let again = Payment {
            id: new_record_id(),
            ..payment.clone()
        };
        let err = insert_payment(&mut tx, &again).await.unwrap_err();
        assert!(is_unique_violation(&err));
        assert!(!is_unique_violation(&RegistrarError::Config("x".to_string())));
    }
}
