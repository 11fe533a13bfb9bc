//! Connection strategies and the seams the live protocol clients plug into.
//!
//! A strategy list is a plain value: [`imap_strategies`] and [`smtp_strategies`]
//! return the order in which connection attempts are made, and [`negotiate`]
//! walks that order, moving on only when an attempt fails at the transport level.

use std::fmt;
use std::future::Future;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::NaiveDate;
use secrecy::SecretString;

use mailsync_core::{ImapSettings, SmtpSettings};

use crate::MailError;

pub const DEFAULT_ATTEMPT_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ImapSecurity {
    ImplicitTls,
    Plaintext,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImapAttempt {
    pub host: String,
    pub port: u16,
    pub security: ImapSecurity,
}

impl fmt::Display for ImapAttempt {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "imap {}:{} ({:?})", self.host, self.port, self.security)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SmtpSecurity {
    ImplicitTls,
    StartTls,
    Plaintext,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SmtpAttempt {
    pub host: String,
    pub port: u16,
    pub security: SmtpSecurity,
}

impl fmt::Display for SmtpAttempt {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "smtp {}:{} ({:?})", self.host, self.port, self.security)
    }
}

/// Implicit TLS first, then plaintext on the same port.
pub fn imap_strategies(settings: &ImapSettings) -> Vec<ImapAttempt> {
    let mut attempts = Vec::with_capacity(2);
    if settings.use_tls {
        attempts.push(ImapAttempt {
            host: settings.host.clone(),
            port: settings.port,
            security: ImapSecurity::ImplicitTls,
        });
    }
    attempts.push(ImapAttempt {
        host: settings.host.clone(),
        port: settings.port,
        security: ImapSecurity::Plaintext,
    });
    attempts
}

/// Port 465 tries implicit TLS then STARTTLS on 587. Any other port is a single attempt.
pub fn smtp_strategies(settings: &SmtpSettings) -> Vec<SmtpAttempt> {
    if settings.port == 465 {
        return vec![
            SmtpAttempt {
                host: settings.host.clone(),
                port: 465,
                security: SmtpSecurity::ImplicitTls,
            },
            SmtpAttempt {
                host: settings.host.clone(),
                port: 587,
                security: SmtpSecurity::StartTls,
            },
        ];
    }
    let security = if settings.use_starttls {
        SmtpSecurity::StartTls
    } else {
        SmtpSecurity::Plaintext
    };
    vec![SmtpAttempt {
        host: settings.host.clone(),
        port: settings.port,
        security,
    }]
}

/// Tries each attempt in order. A transport failure moves to the next attempt;
/// any other failure is returned immediately.
pub async fn negotiate<A, T, F, Fut>(attempts: &[A], mut attempt_fn: F) -> Result<(A, T), MailError>
where
    A: Clone + fmt::Display,
    F: FnMut(A) -> Fut,
    Fut: Future<Output = Result<T, MailError>>,
{
    let mut last_err = None;
    for (idx, attempt) in attempts.iter().enumerate() {
        match attempt_fn(attempt.clone()).await {
            Ok(value) => {
                tracing::debug!(%attempt, "connection established");
                return Ok((attempt.clone(), value));
            }
            Err(err) if err.is_transport() => {
                let remaining = attempts.len() - idx - 1;
                tracing::warn!(%attempt, error = %err, remaining, "connection attempt failed");
                last_err = Some(err);
            }
            Err(err) => return Err(err),
        }
    }
    Err(last_err.unwrap_or_else(|| MailError::Config("no connection strategies".to_string())))
}

/// Runs blocking protocol work on the blocking pool, bounded by `timeout`.
pub async fn run_blocking<T, F>(timeout: Duration, f: F) -> Result<T, MailError>
where
    T: Send + 'static,
    F: FnOnce() -> Result<T, MailError> + Send + 'static,
{
    match tokio::time::timeout(timeout, tokio::task::spawn_blocking(f)).await {
        Ok(Ok(result)) => result,
        Ok(Err(join_err)) => Err(MailError::Protocol(format!("worker failed: {}", join_err))),
        Err(_) => Err(MailError::Timeout(timeout)),
    }
}

#[derive(Clone)]
pub struct Credentials {
    pub username: String,
    pub secret: SecretString,
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("username", &self.username)
            .finish_non_exhaustive()
    }
}

/// Result of the cheap header-only fetch for one UID.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HeaderProbe {
    pub uid: u32,
    pub header: Vec<u8>,
    pub seen: bool,
    pub flagged: bool,
}

/// An authenticated IMAP session. Calls block.
pub trait ImapSession: Send {
    /// Selects `folder` and returns its message count.
    fn select(&mut self, folder: &str) -> Result<u32, MailError>;
    fn search_since(&mut self, since: NaiveDate) -> Result<Vec<u32>, MailError>;
    fn fetch_headers(&mut self, uids: &[u32]) -> Result<Vec<HeaderProbe>, MailError>;
    fn fetch_message(&mut self, uid: u32) -> Result<Vec<u8>, MailError>;
    fn logout(&mut self) -> Result<(), MailError>;
}

pub trait ImapConnector: Send + Sync {
    /// Connects and logs in. `timeout` bounds every socket read and write.
    fn connect(
        &self,
        attempt: &ImapAttempt,
        credentials: &Credentials,
        timeout: Duration,
    ) -> Result<Box<dyn ImapSession>, MailError>;
}

#[async_trait]
pub trait SmtpConnector: Send + Sync {
    /// Connects, authenticates and quits.
    async fn probe(
        &self,
        attempt: &SmtpAttempt,
        credentials: &Credentials,
        timeout: Duration,
    ) -> Result<(), MailError>;

    async fn submit(
        &self,
        attempt: &SmtpAttempt,
        credentials: &Credentials,
        timeout: Duration,
        message: lettre::Message,
    ) -> Result<(), MailError>;
}

/// Shares one blocking session across `spawn_blocking` calls.
#[derive(Clone)]
pub struct SessionHandle {
    inner: Arc<Mutex<Box<dyn ImapSession>>>,
    timeout: Duration,
}

impl SessionHandle {
    pub fn new(session: Box<dyn ImapSession>, timeout: Duration) -> Self {
        Self {
            inner: Arc::new(Mutex::new(session)),
            timeout,
        }
    }

    pub async fn call<T, F>(&self, f: F) -> Result<T, MailError>
    where
        T: Send + 'static,
        F: FnOnce(&mut dyn ImapSession) -> Result<T, MailError> + Send + 'static,
    {
        let inner = Arc::clone(&self.inner);
        run_blocking(self.timeout, move || {
            let mut guard = inner
                .lock()
                .map_err(|_| MailError::Protocol("imap session poisoned".to_string()))?;
            f(guard.as_mut())
        })
        .await
    }
}

/// Opens an IMAP session using the strategy order for `settings`.
pub async fn open_imap_session(
    connector: Arc<dyn ImapConnector>,
    settings: &ImapSettings,
    credentials: &Credentials,
    timeout: Duration,
) -> Result<(ImapAttempt, SessionHandle), MailError> {
    let attempts = imap_strategies(settings);
    let (attempt, session) = negotiate(&attempts, |attempt| {
        let connector = Arc::clone(&connector);
        let credentials = credentials.clone();
        run_blocking(timeout, move || {
            connector.connect(&attempt, &credentials, timeout)
        })
    })
    .await?;
    Ok((attempt, SessionHandle::new(session, timeout)))
}

/// Finds the SMTP strategy that accepts the credential, then runs `f` against it.
pub async fn with_smtp<T, F, Fut>(
    settings: &SmtpSettings,
    f: F,
) -> Result<(SmtpAttempt, T), MailError>
where
    F: FnMut(SmtpAttempt) -> Fut,
    Fut: Future<Output = Result<T, MailError>>,
{
    negotiate(&smtp_strategies(settings), f).await
}
