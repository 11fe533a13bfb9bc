use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;

use mailsync_core::{ImapSettings, SmtpSettings};

use crate::transport::{
    Credentials, ImapAttempt, SmtpAttempt, open_imap_session, with_smtp,
};
use crate::{Connectors, MailError};

/// The strategies that succeeded for each protocol.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct VerifiedConnection {
    pub imap: String,
    pub smtp: String,
    #[serde(skip)]
    pub imap_attempt: Option<ImapAttempt>,
    #[serde(skip)]
    pub smtp_attempt: Option<SmtpAttempt>,
}

/// Logs in over IMAP and SMTP using the fallback order and closes both sessions.
pub async fn verify_connection(
    connectors: &Connectors,
    credentials: &Credentials,
    imap: &ImapSettings,
    smtp: &SmtpSettings,
    timeout: Duration,
) -> Result<VerifiedConnection, MailError> {
    let (imap_attempt, session) =
        open_imap_session(Arc::clone(&connectors.imap), imap, credentials, timeout).await?;
    if let Err(err) = session.call(|session| session.logout()).await {
        tracing::warn!(error = %err, "imap logout after verification failed");
    }

    let (smtp_attempt, ()) = with_smtp(smtp, |attempt| {
        let connector = Arc::clone(&connectors.smtp);
        let credentials = credentials.clone();
        async move { connector.probe(&attempt, &credentials, timeout).await }
    })
    .await?;

    tracing::info!(
        username = %credentials.username,
        imap = %imap_attempt,
        smtp = %smtp_attempt,
        "connection verified"
    );
    Ok(VerifiedConnection {
        imap: imap_attempt.to_string(),
        smtp: smtp_attempt.to_string(),
        imap_attempt: Some(imap_attempt),
        smtp_attempt: Some(smtp_attempt),
    })
}
