use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use thiserror::Error;
use tracing::info;

/// An outbound email.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Email {
    pub to: String,
    pub subject: String,
    pub text: String,
    pub html: Option<String>,
}

impl Email {
    pub fn new(to: impl Into<String>, subject: impl Into<String>, text: impl Into<String>) -> Self {
        Self {
            to: to.into(),
            subject: subject.into(),
            text: text.into(),
            html: None,
        }
    }

    pub fn with_html(mut self, html: impl Into<String>) -> Self {
        self.html = Some(html.into());
        self
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum NotifyError {
    #[error("email to {to} rejected: {reason}")]
    Rejected { to: String, reason: String },
    #[error("mailer buffer poisoned")]
    BufferPoisoned,
}

/// Outbound email transport.
pub trait Mailer: Send + Sync {
    fn send_email(&self, email: &Email) -> Result<(), NotifyError>;
}

impl<M: Mailer + ?Sized> Mailer for Arc<M> {
    fn send_email(&self, email: &Email) -> Result<(), NotifyError> {
        (**self).send_email(email)
    }
}

/// A mailer that logs emails, optionally capturing them in a buffer.
#[derive(Clone, Default)]
pub struct LogMailer {
    buffer: Option<Arc<Mutex<Vec<Email>>>>,
    failing: Arc<AtomicBool>,
}

impl LogMailer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_buffer(buffer: Arc<Mutex<Vec<Email>>>) -> Self {
        Self {
            buffer: Some(buffer),
            failing: Arc::new(AtomicBool::new(false)),
        }
    }

    /// While set, every send is rejected.
    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    /// Captured emails (empty without a buffer).
    pub fn sent(&self) -> Vec<Email> {
        match &self.buffer {
            Some(buffer) => buffer.lock().map(|b| b.clone()).unwrap_or_default(),
            None => Vec::new(),
        }
    }

    pub fn sent_to(&self, to: &str) -> Vec<Email> {
        self.sent().into_iter().filter(|e| e.to == to).collect()
    }
}

impl Mailer for LogMailer {
    fn send_email(&self, email: &Email) -> Result<(), NotifyError> {
        if self.failing.load(Ordering::SeqCst) {
            return Err(NotifyError::Rejected {
                to: email.to.clone(),
                reason: "mailer unavailable".into(),
            });
        }

        info!(to = %email.to, subject = %email.subject, "[MAIL]");
        if let Some(buffer) = &self.buffer {
            let mut buffer = buffer.lock().map_err(|_| NotifyError::BufferPoisoned)?;
            buffer.push(email.clone());
        }
        Ok(())
    }
}
