use std::time::Duration;

use mailsync_content::ParseError;
use mailsync_core::CredentialError;

#[derive(Debug, thiserror::Error)]
pub enum MailError {
    #[error("invalid configuration: {0}")]
    Config(String),

    #[error("connection failed: {0}")]
    Transport(String),

    #[error("timed out after {}s", .0.as_secs())]
    Timeout(Duration),

    #[error("authentication failed: {0}")]
    Authentication(String),

    #[error("protocol error: {0}")]
    Protocol(String),

    #[error(transparent)]
    Parse(#[from] ParseError),

    #[error(transparent)]
    Credential(#[from] CredentialError),

    #[error("storage error: {0}")]
    Storage(String),

    #[error("{0} not found")]
    NotFound(String),

    #[error("account {0} is being synced elsewhere")]
    SyncInProgress(i64),
}

impl MailError {
    /// Connection-level failures; the negotiation policy moves to the next strategy on these.
    pub fn is_transport(&self) -> bool {
        matches!(self, MailError::Transport(_) | MailError::Timeout(_))
    }
}

impl From<anyhow::Error> for MailError {
    fn from(err: anyhow::Error) -> Self {
        MailError::Storage(format!("{:#}", err))
    }
}

impl From<std::io::Error> for MailError {
    fn from(err: std::io::Error) -> Self {
        MailError::Transport(err.to_string())
    }
}

impl From<imap::Error> for MailError {
    fn from(err: imap::Error) -> Self {
        match err {
            imap::Error::Io(io) => MailError::Transport(io.to_string()),
            imap::Error::ConnectionLost => MailError::Transport("connection lost".to_string()),
            other => MailError::Protocol(other.to_string()),
        }
    }
}

impl From<lettre::transport::smtp::Error> for MailError {
    fn from(err: lettre::transport::smtp::Error) -> Self {
        if err.is_timeout() {
            MailError::Transport(format!("smtp timeout: {}", err))
        } else if err.is_permanent() {
            // 5xx during AUTH is the server rejecting the credential.
            let text = err.to_string();
            if text.contains("535") || text.to_lowercase().contains("auth") {
                MailError::Authentication(text)
            } else {
                MailError::Protocol(text)
            }
        } else if err.is_transient() {
            MailError::Protocol(err.to_string())
        } else {
            MailError::Transport(err.to_string())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_connection_failures_are_transport() {
        assert!(MailError::Transport("refused".into()).is_transport());
        assert!(MailError::Timeout(Duration::from_secs(30)).is_transport());
        assert!(!MailError::Authentication("bad password".into()).is_transport());
        assert!(!MailError::Protocol("BAD".into()).is_transport());
        assert!(!MailError::Config("empty host".into()).is_transport());
    }

    #[test]
    fn storage_errors_keep_context_chain() {
        let err = anyhow::anyhow!("disk full").context("insert message");
        let mail: MailError = err.into();
        assert_eq!(mail.to_string(), "storage error: insert message: disk full");
    }
}
