//! Shared records and the SQLite persistence layer for synchronized mail.

use std::collections::HashSet;
use std::fmt;
use std::str::FromStr;

use anyhow::{Result, anyhow};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions, SqliteRow};
use sqlx::{Row, SqlitePool};

pub mod credentials;

pub use credentials::{CredentialCipher, CredentialError};

/// Attachments up to this size are stored inline; larger ones keep only a reference.
pub const INLINE_ATTACHMENT_LIMIT: usize = 1024 * 1024;

/// Folder name recorded on messages created by the outbound path.
pub const SENT_FOLDER_MARKER: &str = "Sent";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProviderKind {
    Gmail,
    Outlook,
    Yahoo,
    Generic,
}

impl ProviderKind {
    pub fn as_str(self) -> &'static str {
        match self {
            ProviderKind::Gmail => "gmail",
            ProviderKind::Outlook => "outlook",
            ProviderKind::Yahoo => "yahoo",
            ProviderKind::Generic => "generic",
        }
    }
}

impl FromStr for ProviderKind {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "gmail" | "google" => Ok(ProviderKind::Gmail),
            "outlook" | "microsoft" | "office365" => Ok(ProviderKind::Outlook),
            "yahoo" => Ok(ProviderKind::Yahoo),
            "generic" | "other" => Ok(ProviderKind::Generic),
            other => Err(anyhow!("unknown provider '{}'", other)),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SyncState {
    Active,
    Syncing,
    Error,
}

impl SyncState {
    pub fn as_str(self) -> &'static str {
        match self {
            SyncState::Active => "active",
            SyncState::Syncing => "syncing",
            SyncState::Error => "error",
        }
    }
}

impl FromStr for SyncState {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "active" => Ok(SyncState::Active),
            "syncing" => Ok(SyncState::Syncing),
            "error" => Ok(SyncState::Error),
            other => Err(anyhow!("unknown sync state '{}'", other)),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    Incoming,
    Outgoing,
}

impl Direction {
    pub fn as_str(self) -> &'static str {
        match self {
            Direction::Incoming => "incoming",
            Direction::Outgoing => "outgoing",
        }
    }
}

impl FromStr for Direction {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "incoming" => Ok(Direction::Incoming),
            "outgoing" => Ok(Direction::Outgoing),
            other => Err(anyhow!("unknown direction '{}'", other)),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageStatus {
    Unread,
    Read,
    Archived,
}

impl MessageStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            MessageStatus::Unread => "unread",
            MessageStatus::Read => "read",
            MessageStatus::Archived => "archived",
        }
    }
}

impl FromStr for MessageStatus {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "unread" => Ok(MessageStatus::Unread),
            "read" => Ok(MessageStatus::Read),
            "archived" => Ok(MessageStatus::Archived),
            other => Err(anyhow!("unknown message status '{}'", other)),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImapSettings {
    pub host: String,
    pub port: u16,
    pub use_tls: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SmtpSettings {
    pub host: String,
    pub port: u16,
    pub use_starttls: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncPreferences {
    pub enabled: bool,
    pub frequency_minutes: u32,
    pub sync_inbox: bool,
    pub sync_sent: bool,
    pub sent_folder: String,
    pub lookback_days: u32,
}

impl Default for SyncPreferences {
    fn default() -> Self {
        Self {
            enabled: true,
            frequency_minutes: 15,
            sync_inbox: true,
            sync_sent: false,
            sent_folder: SENT_FOLDER_MARKER.to_string(),
            lookback_days: 30,
        }
    }
}

/// One external mailbox bound to one internal owner.
#[derive(Debug, Clone, Serialize)]
pub struct MailAccount {
    pub id: i64,
    pub owner: String,
    pub address: String,
    pub display_name: String,
    pub provider: ProviderKind,
    pub imap: ImapSettings,
    pub smtp: SmtpSettings,
    #[serde(skip_serializing)]
    pub encrypted_credential: String,
    pub sync: SyncPreferences,
    pub sync_state: SyncState,
    pub last_sync_error: Option<String>,
    pub last_sync_at: Option<i64>,
}

impl MailAccount {
    /// Whether the scheduler should start a run at `now` (unix seconds).
    pub fn is_sync_due(&self, now: i64) -> bool {
        if !self.sync.enabled || self.sync_state == SyncState::Syncing {
            return false;
        }
        match self.last_sync_at {
            Some(last) => now - last >= i64::from(self.sync.frequency_minutes) * 60,
            None => true,
        }
    }
}

/// Everything needed to persist a verified account.
#[derive(Debug, Clone)]
pub struct NewMailAccount {
    pub owner: String,
    pub address: String,
    pub display_name: String,
    pub provider: ProviderKind,
    pub imap: ImapSettings,
    pub smtp: SmtpSettings,
    pub encrypted_credential: String,
    pub sync: SyncPreferences,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MessageFlags {
    pub important: bool,
    pub starred: bool,
    pub has_attachments: bool,
}

/// Output of the content heuristics pass.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContentInsights {
    pub contains_meeting_info: bool,
    pub extracted_dates: Vec<String>,
    pub action_items: Vec<String>,
}

/// Normalized, provider-agnostic message.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MessageRecord {
    pub message_id: String,
    pub thread_id: String,
    pub subject: String,
    pub from_address: String,
    pub from_name: Option<String>,
    pub to: Vec<String>,
    pub cc: Vec<String>,
    pub bcc: Vec<String>,
    pub reply_to: Vec<String>,
    pub body_text: Option<String>,
    pub body_html: Option<String>,
    pub direction: Direction,
    pub status: MessageStatus,
    pub sent_at: i64,
    pub received_at: i64,
    pub folder: String,
    pub flags: MessageFlags,
    pub insights: ContentInsights,
}

/// Inline bytes serialize as their length only; listings never carry payloads.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub enum AttachmentContent {
    #[serde(serialize_with = "serialize_inline_len")]
    Inline(Vec<u8>),
    External(String),
}

fn serialize_inline_len<S: serde::Serializer>(data: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
    serializer.serialize_u64(data.len() as u64)
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AttachmentRecord {
    pub filename: String,
    pub content_type: String,
    pub size: usize,
    pub content: AttachmentContent,
    pub inline: bool,
    pub calendar_invite: bool,
}

impl AttachmentRecord {
    /// Keeps `data` inline when it fits under [`INLINE_ATTACHMENT_LIMIT`],
    /// otherwise records `reference` instead.
    pub fn from_bytes(
        filename: String,
        content_type: String,
        data: Vec<u8>,
        reference: impl FnOnce() -> String,
        inline: bool,
    ) -> Self {
        let size = data.len();
        let calendar_invite = is_calendar_invite(&filename, &content_type);
        let content = if size <= INLINE_ATTACHMENT_LIMIT {
            AttachmentContent::Inline(data)
        } else {
            AttachmentContent::External(reference())
        };
        Self {
            filename,
            content_type,
            size,
            content,
            inline,
            calendar_invite,
        }
    }
}

pub fn is_calendar_invite(filename: &str, content_type: &str) -> bool {
    let lower = filename.to_ascii_lowercase();
    lower.ends_with(".ics") || lower.ends_with(".vcs") || content_type.eq_ignore_ascii_case("text/calendar")
}

#[derive(Debug, Clone, Serialize)]
pub struct StoredMessage {
    pub id: i64,
    pub account_id: i64,
    #[serde(flatten)]
    pub record: MessageRecord,
}

/// Persistence operations the sync and dispatch paths rely on.
#[async_trait]
pub trait MailStore: Send + Sync {
    async fn insert_account(&self, account: &NewMailAccount) -> Result<i64>;
    async fn update_account(&self, account_id: i64, account: &NewMailAccount) -> Result<()>;
    async fn get_account(&self, account_id: i64) -> Result<Option<MailAccount>>;
    async fn list_accounts(&self) -> Result<Vec<MailAccount>>;
    /// Removes the account with its messages and attachments. Returns false,
    /// leaving everything in place, when the account is missing or mid-sync.
    async fn delete_account(&self, account_id: i64) -> Result<bool>;
    /// Moves the account into `syncing`; returns false when a run already holds it.
    async fn try_begin_sync(&self, account_id: i64) -> Result<bool>;
    async fn finish_sync(
        &self,
        account_id: i64,
        state: SyncState,
        error: Option<&str>,
        finished_at: i64,
    ) -> Result<()>;
    async fn known_message_ids(&self, account_id: i64) -> Result<HashSet<String>>;
    /// Inserts the message and its attachments atomically. Returns `None` when
    /// the (account, message id) pair is already stored.
    async fn insert_message(
        &self,
        account_id: i64,
        message: &MessageRecord,
        attachments: &[AttachmentRecord],
    ) -> Result<Option<i64>>;
    async fn update_insights(&self, message_id: i64, insights: &ContentInsights) -> Result<()>;
    async fn set_message_status(&self, message_id: i64, status: MessageStatus) -> Result<()>;
    async fn list_messages(
        &self,
        account_id: i64,
        folder: Option<&str>,
        limit: Option<i64>,
    ) -> Result<Vec<StoredMessage>>;
    async fn list_attachments(&self, message_id: i64) -> Result<Vec<AttachmentRecord>>;
}

#[derive(Clone)]
pub struct SqliteMailStore {
    pool: SqlitePool,
}

impl fmt::Debug for SqliteMailStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SqliteMailStore").finish_non_exhaustive()
    }
}

impl SqliteMailStore {
    pub async fn connect(path: &str) -> Result<Self> {
        let url = if path.starts_with("sqlite:") {
            path.to_string()
        } else {
            format!("sqlite:{}", path)
        };
        let options = SqliteConnectOptions::new()
            .filename(url.trim_start_matches("sqlite:"))
            .create_if_missing(true)
            .foreign_keys(true);
        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect_with(options)
            .await?;
        Ok(Self { pool })
    }

    pub async fn init(&self) -> Result<()> {
        sqlx::migrate!("../../migrations").run(&self.pool).await?;
        Ok(())
    }

    /// Returns accounts left in `syncing` by an interrupted process to `active`.
    pub async fn reset_interrupted_syncs(&self) -> Result<u64> {
        let result = sqlx::query(
            "UPDATE accounts SET sync_state = 'active', last_sync_error = 'sync interrupted'
             WHERE sync_state = 'syncing'",
        )
        .execute(&self.pool)
        .await?;
        if result.rows_affected() > 0 {
            tracing::warn!(
                count = result.rows_affected(),
                "reset accounts left in syncing state"
            );
        }
        Ok(result.rows_affected())
    }

    pub async fn count_messages(&self, account_id: i64) -> Result<i64> {
        let row = sqlx::query_as::<_, (i64,)>("SELECT COUNT(*) FROM messages WHERE account_id = ?")
            .bind(account_id)
            .fetch_one(&self.pool)
            .await?;
        Ok(row.0)
    }
}

const ACCOUNT_COLUMNS: &str = "id, owner, address, display_name, provider, imap_host, imap_port,
    imap_use_tls, smtp_host, smtp_port, smtp_use_starttls, encrypted_credential, sync_enabled,
    sync_frequency_minutes, sync_inbox, sync_sent, sent_folder, lookback_days, sync_state,
    last_sync_error, last_sync_at";

const MESSAGE_COLUMNS: &str = "id, account_id, message_id, thread_id, subject, from_addr,
    from_name, to_addrs, cc_addrs, bcc_addrs, reply_to, body_text, body_html, direction, status,
    sent_at, received_at, folder, is_important, is_starred, has_attachments,
    contains_meeting_info, extracted_dates, action_items";

fn account_from_row(row: &SqliteRow) -> Result<MailAccount> {
    Ok(MailAccount {
        id: row.try_get("id")?,
        owner: row.try_get("owner")?,
        address: row.try_get("address")?,
        display_name: row.try_get("display_name")?,
        provider: row.try_get::<String, _>("provider")?.parse()?,
        imap: ImapSettings {
            host: row.try_get("imap_host")?,
            port: u16::try_from(row.try_get::<i64, _>("imap_port")?)?,
            use_tls: row.try_get::<i64, _>("imap_use_tls")? != 0,
        },
        smtp: SmtpSettings {
            host: row.try_get("smtp_host")?,
            port: u16::try_from(row.try_get::<i64, _>("smtp_port")?)?,
            use_starttls: row.try_get::<i64, _>("smtp_use_starttls")? != 0,
        },
        encrypted_credential: row.try_get("encrypted_credential")?,
        sync: SyncPreferences {
            enabled: row.try_get::<i64, _>("sync_enabled")? != 0,
            frequency_minutes: u32::try_from(row.try_get::<i64, _>("sync_frequency_minutes")?)?,
            sync_inbox: row.try_get::<i64, _>("sync_inbox")? != 0,
            sync_sent: row.try_get::<i64, _>("sync_sent")? != 0,
            sent_folder: row.try_get("sent_folder")?,
            lookback_days: u32::try_from(row.try_get::<i64, _>("lookback_days")?)?,
        },
        sync_state: row.try_get::<String, _>("sync_state")?.parse()?,
        last_sync_error: row.try_get("last_sync_error")?,
        last_sync_at: row.try_get("last_sync_at")?,
    })
}

fn message_from_row(row: &SqliteRow) -> Result<StoredMessage> {
    let list = |name: &str| -> Result<Vec<String>> {
        let raw: String = row.try_get(name)?;
        Ok(serde_json::from_str(&raw)?)
    };
    Ok(StoredMessage {
        id: row.try_get("id")?,
        account_id: row.try_get("account_id")?,
        record: MessageRecord {
            message_id: row.try_get("message_id")?,
            thread_id: row.try_get("thread_id")?,
            subject: row.try_get("subject")?,
            from_address: row.try_get("from_addr")?,
            from_name: row.try_get("from_name")?,
            to: list("to_addrs")?,
            cc: list("cc_addrs")?,
            bcc: list("bcc_addrs")?,
            reply_to: list("reply_to")?,
            body_text: row.try_get("body_text")?,
            body_html: row.try_get("body_html")?,
            direction: row.try_get::<String, _>("direction")?.parse()?,
            status: row.try_get::<String, _>("status")?.parse()?,
            sent_at: row.try_get("sent_at")?,
            received_at: row.try_get("received_at")?,
            folder: row.try_get("folder")?,
            flags: MessageFlags {
                important: row.try_get::<i64, _>("is_important")? != 0,
                starred: row.try_get::<i64, _>("is_starred")? != 0,
                has_attachments: row.try_get::<i64, _>("has_attachments")? != 0,
            },
            insights: ContentInsights {
                contains_meeting_info: row.try_get::<i64, _>("contains_meeting_info")? != 0,
                extracted_dates: list("extracted_dates")?,
                action_items: list("action_items")?,
            },
        },
    })
}

fn flag(value: bool) -> i64 {
    if value { 1 } else { 0 }
}

fn now_ts() -> i64 {
    chrono::Utc::now().timestamp()
}

#[async_trait]
impl MailStore for SqliteMailStore {
    async fn insert_account(&self, account: &NewMailAccount) -> Result<i64> {
        let result = sqlx::query(
            "INSERT INTO accounts (owner, address, display_name, provider, imap_host, imap_port,
                imap_use_tls, smtp_host, smtp_port, smtp_use_starttls, encrypted_credential,
                sync_enabled, sync_frequency_minutes, sync_inbox, sync_sent, sent_folder,
                lookback_days, sync_state, created_at)
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, 'active', ?)",
        )
        .bind(&account.owner)
        .bind(&account.address)
        .bind(&account.display_name)
        .bind(account.provider.as_str())
        .bind(&account.imap.host)
        .bind(i64::from(account.imap.port))
        .bind(flag(account.imap.use_tls))
        .bind(&account.smtp.host)
        .bind(i64::from(account.smtp.port))
        .bind(flag(account.smtp.use_starttls))
        .bind(&account.encrypted_credential)
        .bind(flag(account.sync.enabled))
        .bind(i64::from(account.sync.frequency_minutes))
        .bind(flag(account.sync.sync_inbox))
        .bind(flag(account.sync.sync_sent))
        .bind(&account.sync.sent_folder)
        .bind(i64::from(account.sync.lookback_days))
        .bind(now_ts())
        .execute(&self.pool)
        .await?;
        Ok(result.last_insert_rowid())
    }

    async fn update_account(&self, account_id: i64, account: &NewMailAccount) -> Result<()> {
        let result = sqlx::query(
            "UPDATE accounts SET owner = ?, address = ?, display_name = ?, provider = ?,
                imap_host = ?, imap_port = ?, imap_use_tls = ?, smtp_host = ?, smtp_port = ?,
                smtp_use_starttls = ?, encrypted_credential = ?, sync_enabled = ?,
                sync_frequency_minutes = ?, sync_inbox = ?, sync_sent = ?, sent_folder = ?,
                lookback_days = ?
             WHERE id = ?",
        )
        .bind(&account.owner)
        .bind(&account.address)
        .bind(&account.display_name)
        .bind(account.provider.as_str())
        .bind(&account.imap.host)
        .bind(i64::from(account.imap.port))
        .bind(flag(account.imap.use_tls))
        .bind(&account.smtp.host)
        .bind(i64::from(account.smtp.port))
        .bind(flag(account.smtp.use_starttls))
        .bind(&account.encrypted_credential)
        .bind(flag(account.sync.enabled))
        .bind(i64::from(account.sync.frequency_minutes))
        .bind(flag(account.sync.sync_inbox))
        .bind(flag(account.sync.sync_sent))
        .bind(&account.sync.sent_folder)
        .bind(i64::from(account.sync.lookback_days))
        .bind(account_id)
        .execute(&self.pool)
        .await?;
        if result.rows_affected() == 0 {
            return Err(anyhow!("account {} not found", account_id));
        }
        Ok(())
    }

    async fn get_account(&self, account_id: i64) -> Result<Option<MailAccount>> {
        let query = format!("SELECT {} FROM accounts WHERE id = ?", ACCOUNT_COLUMNS);
        let row = sqlx::query(&query)
            .bind(account_id)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(account_from_row).transpose()
    }

    async fn list_accounts(&self) -> Result<Vec<MailAccount>> {
        let query = format!("SELECT {} FROM accounts ORDER BY id", ACCOUNT_COLUMNS);
        let rows = sqlx::query(&query).fetch_all(&self.pool).await?;
        rows.iter().map(account_from_row).collect()
    }

    async fn delete_account(&self, account_id: i64) -> Result<bool> {
        let mut tx = self.pool.begin().await?;
        let removed = sqlx::query("DELETE FROM accounts WHERE id = ? AND sync_state != 'syncing'")
            .bind(account_id)
            .execute(&mut *tx)
            .await?
            .rows_affected();
        if removed == 0 {
            tx.rollback().await?;
            return Ok(false);
        }
        sqlx::query(
            "DELETE FROM attachments WHERE message_id IN
             (SELECT id FROM messages WHERE account_id = ?)",
        )
        .bind(account_id)
        .execute(&mut *tx)
        .await?;
        sqlx::query("DELETE FROM messages WHERE account_id = ?")
            .bind(account_id)
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;
        Ok(true)
    }

    async fn try_begin_sync(&self, account_id: i64) -> Result<bool> {
        let result = sqlx::query(
            "UPDATE accounts SET sync_state = 'syncing' WHERE id = ? AND sync_state != 'syncing'",
        )
        .bind(account_id)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() == 1)
    }

    async fn finish_sync(
        &self,
        account_id: i64,
        state: SyncState,
        error: Option<&str>,
        finished_at: i64,
    ) -> Result<()> {
        sqlx::query(
            "UPDATE accounts SET sync_state = ?, last_sync_error = ?, last_sync_at = ? WHERE id = ?",
        )
        .bind(state.as_str())
        .bind(error)
        .bind(finished_at)
        .bind(account_id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn known_message_ids(&self, account_id: i64) -> Result<HashSet<String>> {
        let rows =
            sqlx::query_as::<_, (String,)>("SELECT message_id FROM messages WHERE account_id = ?")
                .bind(account_id)
                .fetch_all(&self.pool)
                .await?;
        Ok(rows.into_iter().map(|row| row.0).collect())
    }

    async fn insert_message(
        &self,
        account_id: i64,
        message: &MessageRecord,
        attachments: &[AttachmentRecord],
    ) -> Result<Option<i64>> {
        let mut tx = self.pool.begin().await?;
        // ON CONFLICT keeps concurrent or retried runs from duplicating a message.
        let result = sqlx::query(
            "INSERT INTO messages (account_id, message_id, thread_id, subject, from_addr,
                from_name, to_addrs, cc_addrs, bcc_addrs, reply_to, body_text, body_html,
                direction, status, sent_at, received_at, folder, is_important, is_starred,
                has_attachments, contains_meeting_info, extracted_dates, action_items)
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
             ON CONFLICT(account_id, message_id) DO NOTHING",
        )
        .bind(account_id)
        .bind(&message.message_id)
        .bind(&message.thread_id)
        .bind(&message.subject)
        .bind(&message.from_address)
        .bind(&message.from_name)
        .bind(serde_json::to_string(&message.to)?)
        .bind(serde_json::to_string(&message.cc)?)
        .bind(serde_json::to_string(&message.bcc)?)
        .bind(serde_json::to_string(&message.reply_to)?)
        .bind(&message.body_text)
        .bind(&message.body_html)
        .bind(message.direction.as_str())
        .bind(message.status.as_str())
        .bind(message.sent_at)
        .bind(message.received_at)
        .bind(&message.folder)
        .bind(flag(message.flags.important))
        .bind(flag(message.flags.starred))
        .bind(flag(message.flags.has_attachments || !attachments.is_empty()))
        .bind(flag(message.insights.contains_meeting_info))
        .bind(serde_json::to_string(&message.insights.extracted_dates)?)
        .bind(serde_json::to_string(&message.insights.action_items)?)
        .execute(&mut *tx)
        .await?;
        if result.rows_affected() == 0 {
            tx.rollback().await?;
            return Ok(None);
        }
        let row_id = result.last_insert_rowid();

        for attachment in attachments {
            let (content, storage_ref) = match &attachment.content {
                AttachmentContent::Inline(data) => (Some(data.as_slice()), None),
                AttachmentContent::External(reference) => (None, Some(reference.as_str())),
            };
            sqlx::query(
                "INSERT INTO attachments (message_id, filename, content_type, size_bytes, content,
                    storage_ref, is_inline, is_calendar_invite)
                 VALUES (?, ?, ?, ?, ?, ?, ?, ?)",
            )
            .bind(row_id)
            .bind(&attachment.filename)
            .bind(&attachment.content_type)
            .bind(i64::try_from(attachment.size)?)
            .bind(content)
            .bind(storage_ref)
            .bind(flag(attachment.inline))
            .bind(flag(attachment.calendar_invite))
            .execute(&mut *tx)
            .await?;
        }
        tx.commit().await?;
        Ok(Some(row_id))
    }

    async fn update_insights(&self, message_id: i64, insights: &ContentInsights) -> Result<()> {
        sqlx::query(
            "UPDATE messages SET contains_meeting_info = ?, extracted_dates = ?, action_items = ?
             WHERE id = ?",
        )
        .bind(flag(insights.contains_meeting_info))
        .bind(serde_json::to_string(&insights.extracted_dates)?)
        .bind(serde_json::to_string(&insights.action_items)?)
        .bind(message_id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn set_message_status(&self, message_id: i64, status: MessageStatus) -> Result<()> {
        let result = sqlx::query("UPDATE messages SET status = ? WHERE id = ?")
            .bind(status.as_str())
            .bind(message_id)
            .execute(&self.pool)
            .await?;
        if result.rows_affected() == 0 {
            return Err(anyhow!("message {} not found", message_id));
        }
        Ok(())
    }

    async fn list_messages(
        &self,
        account_id: i64,
        folder: Option<&str>,
        limit: Option<i64>,
    ) -> Result<Vec<StoredMessage>> {
        let mut query = format!("SELECT {} FROM messages WHERE account_id = ?", MESSAGE_COLUMNS);
        if folder.is_some() {
            query.push_str(" AND folder = ?");
        }
        query.push_str(" ORDER BY sent_at DESC, id DESC");
        if limit.is_some() {
            query.push_str(" LIMIT ?");
        }
        let mut q = sqlx::query(&query).bind(account_id);
        if let Some(folder) = folder {
            q = q.bind(folder);
        }
        if let Some(limit) = limit {
            q = q.bind(limit);
        }
        let rows = q.fetch_all(&self.pool).await?;
        rows.iter().map(message_from_row).collect()
    }

    async fn list_attachments(&self, message_id: i64) -> Result<Vec<AttachmentRecord>> {
        let rows = sqlx::query(
            "SELECT filename, content_type, size_bytes, content, storage_ref, is_inline,
                is_calendar_invite
             FROM attachments WHERE message_id = ? ORDER BY id",
        )
        .bind(message_id)
        .fetch_all(&self.pool)
        .await?;
        rows.iter()
            .map(|row| {
                let content: Option<Vec<u8>> = row.try_get("content")?;
                let storage_ref: Option<String> = row.try_get("storage_ref")?;
                let content = match (content, storage_ref) {
                    (Some(data), _) => AttachmentContent::Inline(data),
                    (None, Some(reference)) => AttachmentContent::External(reference),
                    (None, None) => return Err(anyhow!("attachment without content or reference")),
                };
                Ok(AttachmentRecord {
                    filename: row.try_get("filename")?,
                    content_type: row.try_get("content_type")?,
                    size: usize::try_from(row.try_get::<i64, _>("size_bytes")?)?,
                    content,
                    inline: row.try_get::<i64, _>("is_inline")? != 0,
                    calendar_invite: row.try_get::<i64, _>("is_calendar_invite")? != 0,
                })
            })
            .collect()
    }
}
