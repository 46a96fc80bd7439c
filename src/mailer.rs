use std::sync::Arc;

use async_trait::async_trait;
use serde::Serialize;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::model::Booking;
use crate::observability::{MAIL_DROPPED_TOTAL, MAIL_FAILED_TOTAL, MAIL_SENT_TOTAL};

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Mail {
    pub subject: String,
    pub body: String,
    pub recipients: Vec<String>,
}

#[derive(Debug, thiserror::Error)]
#[error("notification failed: {0}")]
pub struct NotifyError(pub String);

/// Outbound message transport.
#[async_trait]
pub trait Notifier: Send + Sync {
    async fn send(&self, from: &str, mail: &Mail) -> Result<(), NotifyError>;
}

/// Writes messages to the log instead of delivering them.
pub struct LogNotifier;

#[async_trait]
impl Notifier for LogNotifier {
    async fn send(&self, from: &str, mail: &Mail) -> Result<(), NotifyError> {
        info!(
            from,
            to = ?mail.recipients,
            subject = %mail.subject,
            "mail (log only)"
        );
        debug!(body = %mail.body, "mail body");
        Ok(())
    }
}

/// Posts each message as JSON to a mail relay.
pub struct WebhookNotifier {
    client: reqwest::Client,
    url: String,
}

#[derive(Serialize)]
struct RelayPayload<'a> {
    from: &'a str,
    to: &'a [String],
    subject: &'a str,
    body: &'a str,
}

impl WebhookNotifier {
    pub fn new(url: String) -> Self {
        Self {
            client: reqwest::Client::new(),
            url,
        }
    }
}

#[async_trait]
impl Notifier for WebhookNotifier {
    async fn send(&self, from: &str, mail: &Mail) -> Result<(), NotifyError> {
        let payload = RelayPayload {
            from,
            to: &mail.recipients,
            subject: &mail.subject,
            body: &mail.body,
        };
        self.client
            .post(&self.url)
            .json(&payload)
            .send()
            .await
            .and_then(|resp| resp.error_for_status())
            .map_err(|e| NotifyError(e.to_string()))?;
        Ok(())
    }
}

/// Bounded, non-blocking queue in front of the [`Notifier`]. Enqueueing never waits:
/// when the queue is full the message is dropped and counted.
#[derive(Clone)]
pub struct Outbox {
    tx: Option<mpsc::Sender<Mail>>,
    operator: Option<String>,
}

impl Outbox {
    pub fn channel(capacity: usize, operator: Option<String>) -> (Self, mpsc::Receiver<Mail>) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        (Self { tx: Some(tx), operator }, rx)
    }

    /// An outbox that discards everything.
    pub fn disabled() -> Self {
        Self {
            tx: None,
            operator: None,
        }
    }

    pub fn enqueue(&self, mail: Mail) {
        let Some(tx) = &self.tx else { return };
        match tx.try_send(mail) {
            Ok(()) => {}
            Err(mpsc::error::TrySendError::Full(mail)) => {
                metrics::counter!(MAIL_DROPPED_TOTAL).increment(1);
                warn!(subject = %mail.subject, "outbox full, dropping message");
            }
            Err(mpsc::error::TrySendError::Closed(mail)) => {
                metrics::counter!(MAIL_DROPPED_TOTAL).increment(1);
                warn!(subject = %mail.subject, "outbox closed, dropping message");
            }
        }
    }

    /// Customer confirmation plus operator alert.
    pub fn booking_confirmed(&self, booking: &Booking) {
        self.enqueue(customer_confirmation(booking));
        if let Some(operator) = &self.operator {
            self.enqueue(operator_alert(booking, operator));
        }
    }

    pub fn contact_message(&self, name: &str, email: &str, phone: &str, message: &str) {
        let Some(operator) = &self.operator else {
            warn!("contact message received but no operator address is configured");
            return;
        };
        self.enqueue(Mail {
            subject: "Message from the ParkKing contact form".into(),
            body: format!("Name: {name}\nEmail: {email}\nPhone: {phone}\nMessage:\n{message}"),
            recipients: vec![operator.clone()],
        });
    }
}

fn comments_line(booking: &Booking) -> &str {
    booking.contact.comments.as_deref().unwrap_or("-")
}

fn customer_confirmation(booking: &Booking) -> Mail {
    Mail {
        subject: "Booking confirmation".into(),
        body: format!(
            "Hello, {name}!\n\n\
             Your booking has been created.\n\
             Date: {date}\n\
             Time: {time}\n\
             Guests: {guests}\n\
             Comments: {comments}\n\n\
             Thank you for your booking.",
            name = booking.contact.name,
            date = booking.date,
            time = booking.time.format("%H:%M"),
            guests = booking.guests,
            comments = comments_line(booking),
        ),
        recipients: vec![booking.contact.email.clone()],
    }
}

fn operator_alert(booking: &Booking, operator: &str) -> Mail {
    Mail {
        subject: "New booking".into(),
        body: format!(
            "A new booking has been created.\n\
             Customer: {name}\n\
             Date: {date}\n\
             Time: {time}\n\
             Guests: {guests}\n\
             Tables: {tables}\n\
             Comments: {comments}",
            name = booking.contact.name,
            date = booking.date,
            time = booking.time.format("%H:%M"),
            guests = booking.guests,
            tables = booking.table_ids.len(),
            comments = comments_line(booking),
        ),
        recipients: vec![operator.to_string()],
    }
}

/// Drain the outbox into `notifier`. Failures are logged and counted, never retried.
/// Returns when every [`Outbox`] clone has been dropped.
pub async fn run_dispatcher(mut rx: mpsc::Receiver<Mail>, notifier: Arc<dyn Notifier>, from: String) {
    while let Some(mail) = rx.recv().await {
        match notifier.send(&from, &mail).await {
            Ok(()) => {
                metrics::counter!(MAIL_SENT_TOTAL).increment(1);
                debug!(subject = %mail.subject, "mail dispatched");
            }
            Err(e) => {
                metrics::counter!(MAIL_FAILED_TOTAL).increment(1);
                warn!(subject = %mail.subject, to = ?mail.recipients, "{e}");
            }
        }
    }
    info!("mail dispatcher stopped");
}
