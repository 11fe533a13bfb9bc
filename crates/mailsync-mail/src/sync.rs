//! Pulls new messages from an account's folders into the store.
//!
//! One run per account at a time. A run claims the account in-process and in
//! the store, walks each folder in UID batches, probes Message-IDs before
//! downloading bodies, and always writes a final state back to the account.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::{Days, Utc};
use serde::Serialize;
use tokio::sync::Notify;

use mailsync_content::{HeuristicMatcher, message_id_from_headers, parse_message};
use mailsync_core::{
    CredentialCipher, Direction, MailAccount, MailStore, MessageStatus, SyncState,
};

use crate::transport::{Credentials, DEFAULT_ATTEMPT_TIMEOUT, SessionHandle, open_imap_session};
use crate::{Connectors, MailError};

pub const INBOX: &str = "INBOX";

#[derive(Debug, Clone)]
pub struct SyncOptions {
    pub batch_size: usize,
    pub attempt_timeout: Duration,
}

impl Default for SyncOptions {
    fn default() -> Self {
        Self {
            batch_size: 50,
            attempt_timeout: DEFAULT_ATTEMPT_TIMEOUT,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct SyncReport {
    pub account_id: i64,
    pub folders: Vec<String>,
    pub candidates: usize,
    pub stored: usize,
    pub skipped: usize,
    pub failed: usize,
    /// Folders the server refused to open or search.
    pub failed_folders: Vec<String>,
    pub cancelled: bool,
}

impl SyncReport {
    /// Error text recorded on an account that otherwise finished cleanly.
    pub fn status_message(&self) -> Option<String> {
        if self.cancelled {
            return Some("sync cancelled".to_string());
        }
        let mut parts = Vec::new();
        if !self.failed_folders.is_empty() {
            parts.push(format!("folder(s) unavailable: {}", self.failed_folders.join(", ")));
        }
        if self.failed > 0 {
            parts.push(format!("{} message(s) failed to sync", self.failed));
        }
        if parts.is_empty() {
            None
        } else {
            Some(parts.join("; "))
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum SyncOutcome {
    Completed(SyncReport),
    AlreadyRunning,
    Disabled,
}

type Registry = Arc<Mutex<HashMap<i64, Arc<AtomicBool>>>>;

#[derive(Clone)]
pub struct SyncOrchestrator {
    store: Arc<dyn MailStore>,
    cipher: Arc<CredentialCipher>,
    connectors: Connectors,
    matcher: Arc<HeuristicMatcher>,
    options: SyncOptions,
    in_flight: Registry,
    idle: Arc<Notify>,
}

/// A registered run. Dropping it releases the account for the next trigger.
pub struct SyncRun {
    orchestrator: SyncOrchestrator,
    account_id: i64,
    cancel: Arc<AtomicBool>,
}

impl Drop for SyncRun {
    fn drop(&mut self) {
        if let Ok(mut in_flight) = self.orchestrator.in_flight.lock() {
            in_flight.remove(&self.account_id);
        }
        self.orchestrator.idle.notify_waiters();
    }
}

impl SyncRun {
    pub fn account_id(&self) -> i64 {
        self.account_id
    }

    pub async fn execute(self) -> Result<SyncOutcome, MailError> {
        self.orchestrator
            .run_registered(self.account_id, &self.cancel)
            .await
    }
}

impl SyncOrchestrator {
    pub fn new(
        store: Arc<dyn MailStore>,
        cipher: Arc<CredentialCipher>,
        connectors: Connectors,
        matcher: Arc<HeuristicMatcher>,
        options: SyncOptions,
    ) -> Self {
        Self {
            store,
            cipher,
            connectors,
            matcher,
            options,
            in_flight: Arc::new(Mutex::new(HashMap::new())),
            idle: Arc::new(Notify::new()),
        }
    }

    /// Registers a run for `account_id`, or `None` when one is already in flight.
    pub fn start(&self, account_id: i64) -> Option<SyncRun> {
        let mut in_flight = self.in_flight.lock().ok()?;
        if in_flight.contains_key(&account_id) {
            return None;
        }
        let cancel = Arc::new(AtomicBool::new(false));
        in_flight.insert(account_id, Arc::clone(&cancel));
        Some(SyncRun {
            orchestrator: self.clone(),
            account_id,
            cancel,
        })
    }

    /// Runs a sync to completion in the current task.
    pub async fn run(&self, account_id: i64) -> Result<SyncOutcome, MailError> {
        match self.start(account_id) {
            Some(run) => run.execute().await,
            None => Ok(SyncOutcome::AlreadyRunning),
        }
    }

    /// Spawns a run and returns immediately. False when the account is already syncing.
    pub fn trigger(&self, account_id: i64) -> bool {
        let Some(run) = self.start(account_id) else {
            tracing::debug!(account_id, "sync already in flight");
            return false;
        };
        tokio::spawn(async move {
            if let Err(err) = run.execute().await {
                tracing::error!(account_id, error = %err, "sync run failed");
            }
        });
        true
    }

    pub fn is_running(&self, account_id: i64) -> bool {
        self.in_flight
            .lock()
            .map(|in_flight| in_flight.contains_key(&account_id))
            .unwrap_or(false)
    }

    /// Asks an in-flight run to stop after its current batch.
    pub fn cancel(&self, account_id: i64) -> bool {
        let Ok(in_flight) = self.in_flight.lock() else {
            return false;
        };
        match in_flight.get(&account_id) {
            Some(flag) => {
                flag.store(true, Ordering::SeqCst);
                true
            }
            None => false,
        }
    }

    pub async fn wait_idle(&self, account_id: i64) {
        loop {
            let notified = self.idle.notified();
            if !self.is_running(account_id) {
                return;
            }
            notified.await;
        }
    }

    /// Triggers every account whose frequency has elapsed at `now`.
    pub async fn sync_due(&self, now: i64) -> Result<Vec<i64>, MailError> {
        let accounts = self.store.list_accounts().await?;
        let mut triggered = Vec::new();
        for account in accounts.iter().filter(|account| account.is_sync_due(now)) {
            if self.trigger(account.id) {
                triggered.push(account.id);
            }
        }
        if !triggered.is_empty() {
            tracing::info!(count = triggered.len(), "scheduled syncs started");
        }
        Ok(triggered)
    }

    async fn run_registered(
        &self,
        account_id: i64,
        cancel: &AtomicBool,
    ) -> Result<SyncOutcome, MailError> {
        let account = self
            .store
            .get_account(account_id)
            .await?
            .ok_or_else(|| MailError::NotFound(format!("account {}", account_id)))?;
        if !account.sync.enabled {
            return Ok(SyncOutcome::Disabled);
        }
        if !self.store.try_begin_sync(account_id).await? {
            tracing::debug!(account_id, "account already claimed by another run");
            return Ok(SyncOutcome::AlreadyRunning);
        }
        tracing::info!(account_id, address = %account.address, "sync started");

        let result = self.sync_account(&account, cancel).await;
        let finished_at = Utc::now().timestamp();
        let (state, error) = match &result {
            Ok(report) => (SyncState::Active, report.status_message()),
            Err(err) => (SyncState::Error, Some(err.to_string())),
        };
        if let Err(first) = self
            .store
            .finish_sync(account_id, state, error.as_deref(), finished_at)
            .await
        {
            tracing::warn!(account_id, error = %first, "recording sync result failed, retrying");
            if let Err(err) = self
                .store
                .finish_sync(account_id, state, error.as_deref(), finished_at)
                .await
            {
                tracing::error!(account_id, error = %err, "account left in syncing state");
                return Err(err.into());
            }
        }

        match result {
            Ok(report) => {
                tracing::info!(
                    account_id,
                    stored = report.stored,
                    skipped = report.skipped,
                    failed = report.failed,
                    cancelled = report.cancelled,
                    "sync finished"
                );
                Ok(SyncOutcome::Completed(report))
            }
            Err(err) => {
                tracing::warn!(account_id, error = %err, "sync failed");
                Err(err)
            }
        }
    }

    async fn sync_account(
        &self,
        account: &MailAccount,
        cancel: &AtomicBool,
    ) -> Result<SyncReport, MailError> {
        let credentials = Credentials {
            username: account.address.clone(),
            secret: self.cipher.decrypt(&account.encrypted_credential)?,
        };
        let (_, session) = open_imap_session(
            Arc::clone(&self.connectors.imap),
            &account.imap,
            &credentials,
            self.options.attempt_timeout,
        )
        .await?;

        let mut report = SyncReport {
            account_id: account.id,
            ..SyncReport::default()
        };
        let result = self.sync_folders(&session, account, cancel, &mut report).await;
        if let Err(err) = session.call(|session| session.logout()).await {
            tracing::debug!(account_id = account.id, error = %err, "imap logout failed");
        }
        result.map(|()| report)
    }

    async fn sync_folders(
        &self,
        session: &SessionHandle,
        account: &MailAccount,
        cancel: &AtomicBool,
        report: &mut SyncReport,
    ) -> Result<(), MailError> {
        let mut folders = Vec::new();
        if account.sync.sync_inbox {
            folders.push((INBOX.to_string(), Direction::Incoming));
        }
        if account.sync.sync_sent {
            folders.push((account.sync.sent_folder.clone(), Direction::Outgoing));
        }
        let since = Utc::now()
            .date_naive()
            .checked_sub_days(Days::new(u64::from(account.sync.lookback_days)))
            .unwrap_or_default();
        let mut known = self.store.known_message_ids(account.id).await?;

        for (folder, direction) in folders {
            if cancel.load(Ordering::SeqCst) {
                report.cancelled = true;
                break;
            }
            report.folders.push(folder.clone());
            self.sync_folder(session, account, &folder, direction, since, &mut known, cancel, report)
                .await?;
        }
        Ok(())
    }

    #[allow(clippy::too_many_arguments)]
    async fn sync_folder(
        &self,
        session: &SessionHandle,
        account: &MailAccount,
        folder: &str,
        direction: Direction,
        since: chrono::NaiveDate,
        known: &mut HashSet<String>,
        cancel: &AtomicBool,
        report: &mut SyncReport,
    ) -> Result<(), MailError> {
        let name = folder.to_string();
        let opened = match session.call(move |s| s.select(&name)).await {
            Ok(0) => {
                tracing::debug!(account_id = account.id, folder, "folder empty");
                return Ok(());
            }
            Ok(_) => session.call(move |s| s.search_since(since)).await,
            Err(err) => Err(err),
        };
        let uids = match opened {
            Ok(uids) => uids,
            Err(err) if err.is_transport() => return Err(err),
            Err(err) => {
                tracing::warn!(account_id = account.id, folder, error = %err, "folder unavailable, skipping");
                report.failed_folders.push(folder.to_string());
                return Ok(());
            }
        };
        report.candidates += uids.len();
        tracing::debug!(account_id = account.id, folder, candidates = uids.len(), %since, "uid search");

        for batch in uids.chunks(self.options.batch_size.max(1)) {
            if cancel.load(Ordering::SeqCst) {
                report.cancelled = true;
                return Ok(());
            }
            let batch = batch.to_vec();
            let probes = session.call(move |s| s.fetch_headers(&batch)).await?;

            for probe in probes {
                let Some(message_id) = message_id_from_headers(&probe.header) else {
                    tracing::warn!(account_id = account.id, folder, uid = probe.uid, "message has no Message-ID");
                    report.failed += 1;
                    continue;
                };
                if known.contains(&message_id) {
                    report.skipped += 1;
                    continue;
                }

                let uid = probe.uid;
                let raw = match session.call(move |s| s.fetch_message(uid)).await {
                    Ok(raw) => raw,
                    Err(err) if err.is_transport() => return Err(err),
                    Err(err) => {
                        tracing::warn!(account_id = account.id, folder, uid, error = %err, "fetch failed");
                        report.failed += 1;
                        continue;
                    }
                };
                let parsed = match parse_message(&raw) {
                    Ok(parsed) => parsed,
                    Err(err) => {
                        tracing::warn!(account_id = account.id, folder, uid, error = %err, "parse failed");
                        report.failed += 1;
                        continue;
                    }
                };

                let status = match direction {
                    Direction::Outgoing => MessageStatus::Read,
                    Direction::Incoming if probe.seen => MessageStatus::Read,
                    Direction::Incoming => MessageStatus::Unread,
                };
                let (record, attachments) = parsed.into_record(
                    folder,
                    direction,
                    status,
                    probe.flagged,
                    Utc::now().timestamp(),
                );
                let Some(row_id) = self
                    .store
                    .insert_message(account.id, &record, &attachments)
                    .await?
                else {
                    known.insert(record.message_id);
                    report.skipped += 1;
                    continue;
                };
                known.insert(message_id);
                known.insert(record.message_id.clone());
                report.stored += 1;

                let insights = self
                    .matcher
                    .analyze(record.body_text.as_deref(), record.body_html.as_deref());
                if insights != record.insights {
                    if let Err(err) = self.store.update_insights(row_id, &insights).await {
                        tracing::warn!(account_id = account.id, message = row_id, error = %err, "storing insights failed");
                    }
                }
            }
        }
        Ok(())
    }
}
