//! Outbound customer notifications.
//!
//! Services publish a [`Notification`] through a [`Notifier`] and move on.
//! A background dispatcher drains the channel and hands each message to a
//! [`Mailer`]; delivery failures end up in the log and nowhere else.

use std::sync::Arc;

use async_trait::async_trait;
use reqwest::Client;
use serde_json::json;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::config::{EmailConfig, EmailProvider};
use crate::models::{Payment, Registration};

const SENDGRID_URL: &str = "https://api.sendgrid.com/v3/mail/send";
const RESEND_URL: &str = "https://api.resend.com/emails";

#[derive(Debug, Clone, PartialEq)]
pub enum Notification {
    RegistrationReceived {
        application_id: String,
        contact_person: String,
        email: String,
        company_name: String,
        company_type: String,
        estimated_days: u32,
        total_fee: i64,
    },
    PaymentReceived {
        application_id: String,
        customer_name: String,
        email: String,
        transaction_id: String,
        amount: i64,
        method: String,
    },
}

impl Notification {
    pub fn registration_received(registration: &Registration) -> Self {
        Self::RegistrationReceived {
            application_id: registration.application_id.clone(),
            contact_person: registration.contact_person.clone(),
            email: registration.email.clone(),
            company_name: registration.company_name.clone(),
            company_type: registration.company_type.to_string(),
            estimated_days: registration.estimated_completion_days,
            total_fee: registration.total_fee,
        }
    }

    pub fn payment_received(registration: &Registration, payment: &Payment) -> Self {
        Self::PaymentReceived {
            application_id: registration.application_id.clone(),
            customer_name: registration.contact_person.clone(),
            email: registration.email.clone(),
            transaction_id: payment.transaction_id.clone().unwrap_or_default(),
            amount: payment.amount,
            method: payment.method.as_str().to_string(),
        }
    }

    pub fn application_id(&self) -> &str {
        match self {
            Self::RegistrationReceived { application_id, .. }
            | Self::PaymentReceived { application_id, .. } => application_id,
        }
    }

    /// Turn the event into a plain-text email.
    pub fn compose(&self, site_url: &str) -> Email {
        match self {
            Self::RegistrationReceived {
                application_id,
                contact_person,
                email,
                company_name,
                company_type,
                estimated_days,
                total_fee,
            } => Email {
                to: email.clone(),
                subject: "Company Registration Application Received".to_string(),
                text: format!(
                    "Dear {contact_person},\n\n\
                     We have received your company registration application.\n\n\
                     Application ID: {application_id}\n\
                     Company Name: {company_name}\n\
                     Company Type: {company_type}\n\
                     Estimated Completion: {estimated_days} days\n\
                     Total Fee: NPR {total_fee}\n\n\
                     Complete your payment at {site_url}/payment?applicationId={application_id}&amount={total_fee}\n"
                ),
            },
            Self::PaymentReceived {
                application_id,
                customer_name,
                email,
                transaction_id,
                amount,
                method,
            } => Email {
                to: email.clone(),
                subject: "Payment Received".to_string(),
                text: format!(
                    "Dear {customer_name},\n\n\
                     We have received your payment for application {application_id}.\n\n\
                     Transaction ID: {transaction_id}\n\
                     Amount Paid: NPR {amount}\n\
                     Payment Method: {method}\n"
                ),
            },
        }
    }
}

/// One-way publication of notifications. Never fails the caller.
pub trait Notifier: Send + Sync {
    fn notify(&self, notification: Notification);
}

pub type SharedNotifier = Arc<dyn Notifier>;

/// Publishes onto an unbounded channel drained by [`spawn_dispatcher`].
#[derive(Clone)]
pub struct ChannelNotifier {
    tx: mpsc::UnboundedSender<Notification>,
}

impl ChannelNotifier {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<Notification>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }
}

impl Notifier for ChannelNotifier {
    fn notify(&self, notification: Notification) {
        if let Err(e) = self.tx.send(notification) {
            warn!(
                application_id = %e.0.application_id(),
                "Notification dropped: dispatcher is not running"
            );
        }
    }
}

// ─────────────────────────────────────────────────────────
// Delivery
// ─────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq)]
pub struct Email {
    pub to: String,
    pub subject: String,
    pub text: String,
}

/// Email delivery backend. Returns whether the provider accepted the message.
#[async_trait]
pub trait Mailer: Send + Sync {
    async fn send(&self, email: &Email) -> bool;
}

/// Choose the mailer named by configuration.
pub fn mailer_from_config(client: Client, config: &EmailConfig) -> Arc<dyn Mailer> {
    match &config.provider {
        EmailProvider::SendGrid { api_key } => Arc::new(SendGridMailer {
            client,
            endpoint: SENDGRID_URL.to_string(),
            api_key: api_key.clone(),
            from: config.from.clone(),
        }),
        EmailProvider::Resend { api_key } => Arc::new(ResendMailer {
            client,
            endpoint: RESEND_URL.to_string(),
            api_key: api_key.clone(),
            from: config.from.clone(),
        }),
        EmailProvider::Disabled => Arc::new(LogMailer),
    }
}

pub struct SendGridMailer {
    client: Client,
    endpoint: String,
    api_key: String,
    from: String,
}

#[async_trait]
impl Mailer for SendGridMailer {
    async fn send(&self, email: &Email) -> bool {
        let from = match split_sender(&self.from) {
            (Some(name), address) => json!({ "email": address, "name": name }),
            (None, address) => json!({ "email": address }),
        };
        let body = json!({
            "personalizations": [{ "to": [{ "email": email.to }] }],
            "from": from,
            "subject": email.subject,
            "content": [{ "type": "text/plain", "value": email.text }],
        });
        match self
            .client
            .post(&self.endpoint)
            .bearer_auth(&self.api_key)
            .json(&body)
            .send()
            .await
        {
            Ok(resp) => resp.status().is_success(),
            Err(e) => {
                warn!("SendGrid email error: {e}");
                false
            }
        }
    }
}

/// Split `Display Name <address>` into its parts. A bare address has no name.
fn split_sender(from: &str) -> (Option<&str>, &str) {
    let from = from.trim();
    match from.strip_suffix('>').and_then(|rest| rest.split_once('<')) {
        Some((name, address)) => {
            let name = name.trim().trim_matches('"').trim();
            (Some(name).filter(|n| !n.is_empty()), address.trim())
        }
        None => (None, from),
    }
}

pub struct ResendMailer {
    client: Client,
    endpoint: String,
    api_key: String,
    from: String,
}

#[async_trait]
impl Mailer for ResendMailer {
    async fn send(&self, email: &Email) -> bool {
        let body = json!({
            "from": self.from,
            "to": email.to,
            "subject": email.subject,
            "text": email.text,
        });
        match self
            .client
            .post(&self.endpoint)
            .bearer_auth(&self.api_key)
            .json(&body)
            .send()
            .await
        {
            Ok(resp) => resp.status().is_success(),
            Err(e) => {
                warn!("Resend email error: {e}");
                false
            }
        }
    }
}

/// Used when no email provider is configured.
pub struct LogMailer;

#[async_trait]
impl Mailer for LogMailer {
    async fn send(&self, email: &Email) -> bool {
        info!(to = %email.to, subject = %email.subject, "Email delivery disabled; not sent");
        true
    }
}

/// Drain `rx` in the background, delivering each notification via `mailer`.
/// The task ends once every [`ChannelNotifier`] has been dropped.
pub fn spawn_dispatcher(
    mut rx: mpsc::UnboundedReceiver<Notification>,
    mailer: Arc<dyn Mailer>,
    site_url: String,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        while let Some(notification) = rx.recv().await {
            let email = notification.compose(&site_url);
            if mailer.send(&email).await {
                debug!(application_id = %notification.application_id(), subject = %email.subject, "Email sent");
            } else {
                warn!(
                    application_id = %notification.application_id(),
                    subject = %email.subject,
                    "Email delivery failed"
                );
            }
        }
        info!("Notification dispatcher stopped");
    })
}

/// Captures notifications for assertions.
#[cfg(test)]
#[derive(Default)]
pub(crate) struct RecordingNotifier {
    pub sent: std::sync::Mutex<Vec<Notification>>,
}

#[cfg(test)]
impl RecordingNotifier {
    pub fn sent(&self) -> Vec<Notification> {
        self.sent.lock().unwrap().clone()
    }
}

#[cfg(test)]
impl Notifier for RecordingNotifier {
    fn notify(&self, notification: Notification) {
        self.sent.lock().unwrap().push(notification);
    }
}
