//! Notify - outbound email and signed download links.

mod links;
mod mailer;

pub use links::{DownloadLinks, LinkError, SignedLinkGenerator};
pub use mailer::{Email, LogMailer, Mailer, NotifyError};
