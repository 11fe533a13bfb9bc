//! IMAP synchronization and SMTP dispatch for external mailboxes.

use std::sync::Arc;

pub mod dispatch;
pub mod engine;
pub mod error;
pub mod imap_client;
pub mod service;
pub mod settings;
pub mod smtp_client;
pub mod sync;
pub mod transport;
pub mod verify;

#[cfg(test)]
mod testing;

pub use dispatch::{Dispatcher, OutgoingAttachment, SendRequest, SentMessage};
pub use engine::{MailCommand, MailEngine, MailEvent};
pub use error::MailError;
pub use service::{AccountPreferences, AccountRequest, MailService};
pub use settings::{ResolvedSettings, SettingsOverride, resolve_settings, validate_settings};
pub use sync::{SyncOptions, SyncOrchestrator, SyncOutcome, SyncReport};
pub use transport::{Credentials, ImapConnector, SmtpConnector};
pub use verify::{VerifiedConnection, verify_connection};

/// The protocol clients used for every connection attempt.
#[derive(Clone)]
pub struct Connectors {
    pub imap: Arc<dyn ImapConnector>,
    pub smtp: Arc<dyn SmtpConnector>,
}

impl Connectors {
    pub fn new(imap: Arc<dyn ImapConnector>, smtp: Arc<dyn SmtpConnector>) -> Self {
        Self { imap, smtp }
    }

    /// Real network clients: native-tls IMAP and lettre SMTP.
    pub fn live() -> Self {
        Self::new(
            Arc::new(imap_client::NativeImapConnector),
            Arc::new(smtp_client::LettreSmtpConnector),
        )
    }
}
