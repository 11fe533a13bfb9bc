//! In-memory IMAP and SMTP connectors plus store helpers for tests.

use std::collections::{BTreeMap, BTreeSet};
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use async_trait::async_trait;
use chrono::NaiveDate;

use mailsync_core::{
    CredentialCipher, MailAccount, MailStore, NewMailAccount, ProviderKind, SqliteMailStore,
};

use crate::MailError;
use crate::settings::resolve_settings;
use crate::transport::{
    Credentials, HeaderProbe, ImapAttempt, ImapConnector, ImapSecurity, ImapSession, SmtpAttempt,
    SmtpConnector, SmtpSecurity,
};

pub fn credentials() -> Credentials {
    Credentials {
        username: "a@example.com".to_string(),
        secret: "app-password".to_string().into(),
    }
}

pub fn raw_message(message_id: &str, date: NaiveDate, subject: &str, body: &str) -> Vec<u8> {
    let date = date
        .and_hms_opt(10, 0, 0)
        .map(|dt| dt.format("%a, %d %b %Y %H:%M:%S +0000").to_string())
        .unwrap_or_default();
    format!(
        "Message-ID: <{}>\r\nFrom: Sender <sender@example.com>\r\nTo: a@example.com\r\nSubject: {}\r\nDate: {}\r\nContent-Type: text/plain; charset=utf-8\r\n\r\n{}\r\n",
        message_id, subject, date, body
    )
    .into_bytes()
}

struct FakeMessage {
    date: NaiveDate,
    header: Vec<u8>,
    raw: Vec<u8>,
    seen: bool,
}

#[derive(Default)]
struct MailboxState {
    folders: BTreeMap<String, BTreeMap<u32, FakeMessage>>,
    fail_tls: bool,
    refuse: bool,
    reject_login: bool,
    missing_folders: BTreeSet<String>,
    connects: Vec<ImapSecurity>,
    body_fetches: usize,
    logouts: usize,
}

#[derive(Clone, Default)]
pub struct FakeMailbox {
    state: Arc<Mutex<MailboxState>>,
}

impl FakeMailbox {
    fn with_state<T>(&self, f: impl FnOnce(&mut MailboxState) -> T) -> T {
        let mut guard = self.state.lock().expect("mailbox lock");
        f(&mut guard)
    }

    pub fn add(&self, folder: &str, uid: u32, date: NaiveDate, raw: Vec<u8>, seen: bool) {
        let header = match raw.windows(4).position(|w| w == b"\r\n\r\n") {
            Some(pos) => raw[..pos + 4].to_vec(),
            None => raw.clone(),
        };
        self.insert(folder, uid, FakeMessage { date, header, raw, seen });
    }

    /// Header probe and full body disagree, as with a truncated message.
    pub fn add_split(&self, folder: &str, uid: u32, date: NaiveDate, header: Vec<u8>, raw: Vec<u8>) {
        self.insert(folder, uid, FakeMessage { date, header, raw, seen: false });
    }

    fn insert(&self, folder: &str, uid: u32, message: FakeMessage) {
        self.with_state(|state| {
            state
                .folders
                .entry(folder.to_string())
                .or_default()
                .insert(uid, message);
        });
    }

    pub fn fail_tls(&self) {
        self.with_state(|state| state.fail_tls = true);
    }

    pub fn refuse_connections(&self) {
        self.with_state(|state| state.refuse = true);
    }

    pub fn reject_login(&self) {
        self.with_state(|state| state.reject_login = true);
    }

    /// SELECT on `folder` answers NO, as for a mailbox that does not exist.
    pub fn reject_select(&self, folder: &str) {
        self.with_state(|state| {
            state.missing_folders.insert(folder.to_string());
        });
    }

    pub fn connects(&self) -> Vec<ImapSecurity> {
        self.with_state(|state| state.connects.clone())
    }

    pub fn body_fetches(&self) -> usize {
        self.with_state(|state| state.body_fetches)
    }

    pub fn logouts(&self) -> usize {
        self.with_state(|state| state.logouts)
    }
}

impl ImapConnector for FakeMailbox {
    fn connect(
        &self,
        attempt: &ImapAttempt,
        _credentials: &Credentials,
        _timeout: Duration,
    ) -> Result<Box<dyn ImapSession>, MailError> {
        self.with_state(|state| {
            state.connects.push(attempt.security);
            if state.refuse {
                return Err(MailError::Transport("connection refused".to_string()));
            }
            if state.fail_tls && attempt.security == ImapSecurity::ImplicitTls {
                return Err(MailError::Transport("tls handshake failed".to_string()));
            }
            if state.reject_login {
                return Err(MailError::Authentication("invalid credentials".to_string()));
            }
            Ok(())
        })?;
        Ok(Box::new(FakeSession {
            mailbox: self.clone(),
            selected: None,
        }))
    }
}

struct FakeSession {
    mailbox: FakeMailbox,
    selected: Option<String>,
}

impl FakeSession {
    fn folder(&self) -> Result<String, MailError> {
        self.selected
            .clone()
            .ok_or_else(|| MailError::Protocol("no folder selected".to_string()))
    }
}

impl ImapSession for FakeSession {
    fn select(&mut self, folder: &str) -> Result<u32, MailError> {
        let count = self.mailbox.with_state(|state| {
            if state.missing_folders.contains(folder) {
                return Err(MailError::Protocol(format!(
                    "NO [NONEXISTENT] unknown mailbox {}",
                    folder
                )));
            }
            Ok(state
                .folders
                .get(folder)
                .map(|messages| messages.len() as u32)
                .unwrap_or(0))
        })?;
        self.selected = Some(folder.to_string());
        Ok(count)
    }

    fn search_since(&mut self, since: NaiveDate) -> Result<Vec<u32>, MailError> {
        let folder = self.folder()?;
        Ok(self.mailbox.with_state(|state| {
            state
                .folders
                .get(&folder)
                .map(|messages| {
                    messages
                        .iter()
                        .filter(|(_, message)| message.date >= since)
                        .map(|(uid, _)| *uid)
                        .collect()
                })
                .unwrap_or_default()
        }))
    }

    fn fetch_headers(&mut self, uids: &[u32]) -> Result<Vec<HeaderProbe>, MailError> {
        let folder = self.folder()?;
        Ok(self.mailbox.with_state(|state| {
            let Some(messages) = state.folders.get(&folder) else {
                return Vec::new();
            };
            uids.iter()
                .filter_map(|uid| {
                    messages.get(uid).map(|message| HeaderProbe {
                        uid: *uid,
                        header: message.header.clone(),
                        seen: message.seen,
                        flagged: false,
                    })
                })
                .collect()
        }))
    }

    fn fetch_message(&mut self, uid: u32) -> Result<Vec<u8>, MailError> {
        let folder = self.folder()?;
        self.mailbox.with_state(|state| {
            state.body_fetches += 1;
            state
                .folders
                .get(&folder)
                .and_then(|messages| messages.get(&uid))
                .map(|message| message.raw.clone())
                .ok_or_else(|| MailError::Protocol(format!("no uid {}", uid)))
        })
    }

    fn logout(&mut self) -> Result<(), MailError> {
        self.mailbox.with_state(|state| state.logouts += 1);
        Ok(())
    }
}

#[derive(Debug, Clone)]
pub struct SubmittedMessage {
    pub attempt: SmtpAttempt,
    pub recipients: Vec<String>,
    pub formatted: Vec<u8>,
}

#[derive(Default)]
struct SmtpState {
    reject_implicit_tls: bool,
    reject_auth: bool,
    attempts: Vec<SmtpAttempt>,
    submitted: Vec<SubmittedMessage>,
}

#[derive(Clone, Default)]
pub struct FakeSmtp {
    state: Arc<Mutex<SmtpState>>,
}

impl FakeSmtp {
    /// A server that refuses port 465 but accepts STARTTLS on 587.
    pub fn rejecting_implicit_tls() -> Self {
        let smtp = Self::default();
        smtp.with_state(|state| state.reject_implicit_tls = true);
        smtp
    }

    pub fn rejecting_auth() -> Self {
        let smtp = Self::default();
        smtp.with_state(|state| state.reject_auth = true);
        smtp
    }

    fn with_state<T>(&self, f: impl FnOnce(&mut SmtpState) -> T) -> T {
        let mut guard = self.state.lock().expect("smtp lock");
        f(&mut guard)
    }

    pub fn attempts(&self) -> Vec<SmtpAttempt> {
        self.with_state(|state| state.attempts.clone())
    }

    pub fn submitted(&self) -> Vec<SubmittedMessage> {
        self.with_state(|state| state.submitted.clone())
    }

    fn check(&self, attempt: &SmtpAttempt) -> Result<(), MailError> {
        self.with_state(|state| {
            state.attempts.push(attempt.clone());
            if state.reject_implicit_tls && attempt.security == SmtpSecurity::ImplicitTls {
                return Err(MailError::Transport("connection reset".to_string()));
            }
            if state.reject_auth {
                return Err(MailError::Authentication("535 rejected".to_string()));
            }
            Ok(())
        })
    }
}

#[async_trait]
impl SmtpConnector for FakeSmtp {
    async fn probe(
        &self,
        attempt: &SmtpAttempt,
        _credentials: &Credentials,
        _timeout: Duration,
    ) -> Result<(), MailError> {
        self.check(attempt)
    }

    async fn submit(
        &self,
        attempt: &SmtpAttempt,
        _credentials: &Credentials,
        _timeout: Duration,
        message: lettre::Message,
    ) -> Result<(), MailError> {
        self.check(attempt)?;
        let recipients = message
            .envelope()
            .to()
            .iter()
            .map(|addr| addr.to_string())
            .collect();
        self.with_state(|state| {
            state.submitted.push(SubmittedMessage {
                attempt: attempt.clone(),
                recipients,
                formatted: message.formatted(),
            })
        });
        Ok(())
    }
}

fn temp_db_path() -> PathBuf {
    let ts = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_nanos())
        .unwrap_or(0);
    std::env::temp_dir().join(format!(
        "mailsync-mail-test-{}-{}.db",
        std::process::id(),
        ts
    ))
}

pub async fn temp_store()
-> anyhow::Result<(Arc<SqliteMailStore>, Arc<CredentialCipher>, PathBuf)> {
    let db_path = temp_db_path();
    let _ = std::fs::remove_file(&db_path);
    let store = SqliteMailStore::connect(
        db_path
            .to_str()
            .ok_or_else(|| anyhow::anyhow!("invalid temp db path"))?,
    )
    .await?;
    store.init().await?;
    let cipher = CredentialCipher::from_base64_key(&CredentialCipher::generate_key())?;
    Ok((Arc::new(store), Arc::new(cipher), db_path))
}

pub async fn seed_account(
    store: &Arc<SqliteMailStore>,
    cipher: &CredentialCipher,
    address: &str,
) -> anyhow::Result<MailAccount> {
    let resolved = resolve_settings(address, None, None);
    let new_account = NewMailAccount {
        owner: "user-1".to_string(),
        address: address.to_string(),
        display_name: address.to_string(),
        provider: ProviderKind::Generic,
        imap: resolved.imap,
        smtp: resolved.smtp,
        encrypted_credential: cipher.encrypt(&"app-password".to_string().into())?,
        sync: Default::default(),
    };
    let id = store.insert_account(&new_account).await?;
    store
        .get_account(id)
        .await?
        .ok_or_else(|| anyhow::anyhow!("seeded account missing"))
}

pub async fn save_preferences(
    store: &Arc<SqliteMailStore>,
    account: &MailAccount,
) -> anyhow::Result<()> {
    let update = NewMailAccount {
        owner: account.owner.clone(),
        address: account.address.clone(),
        display_name: account.display_name.clone(),
        provider: account.provider,
        imap: account.imap.clone(),
        smtp: account.smtp.clone(),
        encrypted_credential: account.encrypted_credential.clone(),
        sync: account.sync.clone(),
    };
    store.update_account(account.id, &update).await
}
