use std::sync::Arc;
use std::time::Duration;

use secrecy::SecretString;
use serde::Deserialize;

use mailsync_content::HeuristicMatcher;
use mailsync_core::{
    CredentialCipher, MailAccount, MailStore, MessageStatus, NewMailAccount, ProviderKind,
    StoredMessage, SyncPreferences,
};

use crate::dispatch::{Dispatcher, SendRequest, SentMessage};
use crate::settings::{ResolvedSettings, SettingsOverride, resolve_settings, validate_settings};
use crate::sync::{SyncOptions, SyncOrchestrator};
use crate::transport::Credentials;
use crate::verify::verify_connection;
use crate::{Connectors, MailError};

/// Partial sync preferences; unset fields take the defaults.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct AccountPreferences {
    pub enabled: Option<bool>,
    pub frequency_minutes: Option<u32>,
    pub sync_inbox: Option<bool>,
    pub sync_sent: Option<bool>,
    pub lookback_days: Option<u32>,
}

impl AccountPreferences {
    fn apply(&self, base: SyncPreferences, sent_folder: String) -> SyncPreferences {
        SyncPreferences {
            enabled: self.enabled.unwrap_or(base.enabled),
            frequency_minutes: self.frequency_minutes.unwrap_or(base.frequency_minutes),
            sync_inbox: self.sync_inbox.unwrap_or(base.sync_inbox),
            sync_sent: self.sync_sent.unwrap_or(base.sync_sent),
            sent_folder,
            lookback_days: self.lookback_days.unwrap_or(base.lookback_days),
        }
    }
}

#[derive(Debug, Clone)]
pub struct AccountRequest {
    pub owner: String,
    pub address: String,
    pub display_name: Option<String>,
    pub secret: SecretString,
    pub provider_hint: Option<ProviderKind>,
    pub overrides: Option<SettingsOverride>,
    pub preferences: AccountPreferences,
}

/// Entry point for callers: account lifecycle, sync triggers and sending.
#[derive(Clone)]
pub struct MailService {
    store: Arc<dyn MailStore>,
    cipher: Arc<CredentialCipher>,
    connectors: Connectors,
    orchestrator: SyncOrchestrator,
    dispatcher: Dispatcher,
    timeout: Duration,
}

impl MailService {
    pub fn new(
        store: Arc<dyn MailStore>,
        cipher: Arc<CredentialCipher>,
        connectors: Connectors,
        matcher: HeuristicMatcher,
        options: SyncOptions,
    ) -> Self {
        let timeout = options.attempt_timeout;
        let orchestrator = SyncOrchestrator::new(
            Arc::clone(&store),
            Arc::clone(&cipher),
            connectors.clone(),
            Arc::new(matcher),
            options,
        );
        let dispatcher = Dispatcher::new(Arc::clone(&store), Arc::clone(&cipher), connectors.clone())
            .with_timeout(timeout);
        Self {
            store,
            cipher,
            connectors,
            orchestrator,
            dispatcher,
            timeout,
        }
    }

    pub fn orchestrator(&self) -> &SyncOrchestrator {
        &self.orchestrator
    }

    /// Verifies the mailbox live, then persists it with an encrypted credential.
    pub async fn create_account(&self, request: AccountRequest) -> Result<MailAccount, MailError> {
        let resolved = self.resolve_and_verify(&request).await?;
        let account = self.new_account(&request, resolved, SyncPreferences::default())?;
        let id = self.store.insert_account(&account).await?;
        tracing::info!(account_id = id, address = %request.address, "account created");
        self.load_account(id).await
    }

    /// Re-verifies before committing changed settings or credentials.
    pub async fn update_account(
        &self,
        account_id: i64,
        request: AccountRequest,
    ) -> Result<MailAccount, MailError> {
        let existing = self.load_account(account_id).await?;
        let resolved = self.resolve_and_verify(&request).await?;
        let account = self.new_account(&request, resolved, existing.sync)?;
        self.store.update_account(account_id, &account).await?;
        tracing::info!(account_id, "account updated");
        self.load_account(account_id).await
    }

    pub fn trigger_sync(&self, account_id: i64) -> bool {
        self.orchestrator.trigger(account_id)
    }

    pub fn cancel_sync(&self, account_id: i64) -> bool {
        self.orchestrator.cancel(account_id)
    }

    pub async fn sync_due(&self, now: i64) -> Result<Vec<i64>, MailError> {
        self.orchestrator.sync_due(now).await
    }

    pub async fn send_message(
        &self,
        account_id: i64,
        request: &SendRequest,
    ) -> Result<SentMessage, MailError> {
        let account = self.load_account(account_id).await?;
        self.dispatcher.send_message(&account, request).await
    }

    /// Stops any in-flight sync, waits for it, then removes the account and its messages.
    ///
    /// A sync claimed outside this process cannot be cancelled from here, so the
    /// account is left untouched and [`MailError::SyncInProgress`] is returned.
    pub async fn delete_account(&self, account_id: i64) -> Result<(), MailError> {
        self.load_account(account_id).await?;
        if self.orchestrator.cancel(account_id) {
            tracing::info!(account_id, "waiting for in-flight sync before delete");
        }
        self.orchestrator.wait_idle(account_id).await;
        if !self.store.delete_account(account_id).await? {
            tracing::warn!(account_id, "account is syncing elsewhere, not deleted");
            return Err(MailError::SyncInProgress(account_id));
        }
        tracing::info!(account_id, "account deleted");
        Ok(())
    }

    pub async fn set_message_status(
        &self,
        message_id: i64,
        status: MessageStatus,
    ) -> Result<(), MailError> {
        self.store.set_message_status(message_id, status).await?;
        Ok(())
    }

    pub async fn list_accounts(&self) -> Result<Vec<MailAccount>, MailError> {
        Ok(self.store.list_accounts().await?)
    }

    pub async fn list_messages(
        &self,
        account_id: i64,
        folder: Option<&str>,
        limit: Option<i64>,
    ) -> Result<Vec<StoredMessage>, MailError> {
        Ok(self.store.list_messages(account_id, folder, limit).await?)
    }

    async fn load_account(&self, account_id: i64) -> Result<MailAccount, MailError> {
        self.store
            .get_account(account_id)
            .await?
            .ok_or_else(|| MailError::NotFound(format!("account {}", account_id)))
    }

    async fn resolve_and_verify(
        &self,
        request: &AccountRequest,
    ) -> Result<ResolvedSettings, MailError> {
        let resolved = resolve_settings(
            &request.address,
            request.provider_hint,
            request.overrides.as_ref(),
        );
        validate_settings(&request.address, &resolved)?;
        let credentials = Credentials {
            username: request.address.clone(),
            secret: request.secret.clone(),
        };
        verify_connection(
            &self.connectors,
            &credentials,
            &resolved.imap,
            &resolved.smtp,
            self.timeout,
        )
        .await?;
        Ok(resolved)
    }

    fn new_account(
        &self,
        request: &AccountRequest,
        resolved: ResolvedSettings,
        base: SyncPreferences,
    ) -> Result<NewMailAccount, MailError> {
        Ok(NewMailAccount {
            owner: request.owner.clone(),
            address: request.address.trim().to_lowercase(),
            display_name: request
                .display_name
                .clone()
                .unwrap_or_else(|| request.address.clone()),
            provider: resolved.provider,
            sync: request.preferences.apply(base, resolved.sent_folder),
            imap: resolved.imap,
            smtp: resolved.smtp,
            encrypted_credential: self.cipher.encrypt(&request.secret)?,
        })
    }
}

#[cfg(test)]
mod tests {
    use mailsync_core::{SqliteMailStore, SyncState};

    use super::*;
    use crate::sync::{INBOX, SyncOutcome};
    use crate::testing::{FakeMailbox, FakeSmtp, raw_message, temp_store};

    fn service(
        store: &Arc<SqliteMailStore>,
        cipher: &Arc<CredentialCipher>,
        mailbox: &FakeMailbox,
        smtp: &FakeSmtp,
    ) -> MailService {
        MailService::new(
            store.clone(),
            Arc::clone(cipher),
            Connectors::new(Arc::new(mailbox.clone()), Arc::new(smtp.clone())),
            HeuristicMatcher::default(),
            SyncOptions {
                batch_size: 50,
                attempt_timeout: Duration::from_secs(5),
            },
        )
    }

    fn request(address: &str) -> AccountRequest {
        AccountRequest {
            owner: "user-1".to_string(),
            address: address.to_string(),
            display_name: Some("Alice".to_string()),
            secret: "app-password".to_string().into(),
            provider_hint: None,
            overrides: None,
            preferences: AccountPreferences {
                lookback_days: Some(7),
                ..AccountPreferences::default()
            },
        }
    }

    #[tokio::test]
    async fn create_account_verifies_and_encrypts() -> anyhow::Result<()> {
        let (store, cipher, db_path) = temp_store().await?;
        let smtp = FakeSmtp::rejecting_implicit_tls();
        let mail = service(&store, &cipher, &FakeMailbox::default(), &smtp);

        let account = mail.create_account(request("a@example.com")).await?;

        assert_eq!(account.imap.host, "imap.example.com");
        assert_eq!(account.sync.lookback_days, 7);
        assert_ne!(account.encrypted_credential, "app-password");
        let secret = cipher.decrypt(&account.encrypted_credential)?;
        assert_eq!(secrecy::ExposeSecret::expose_secret(&secret), "app-password");
        assert_eq!(smtp.attempts().len(), 2);

        let _ = std::fs::remove_file(&db_path);
        Ok(())
    }

    #[tokio::test]
    async fn failed_verification_persists_nothing() -> anyhow::Result<()> {
        let (store, cipher, db_path) = temp_store().await?;
        let mail = service(&store, &cipher, &FakeMailbox::default(), &FakeSmtp::rejecting_auth());

        let result = mail.create_account(request("a@example.com")).await;

        assert!(matches!(result, Err(MailError::Authentication(_))));
        assert!(mail.list_accounts().await?.is_empty());

        let _ = std::fs::remove_file(&db_path);
        Ok(())
    }

    #[tokio::test]
    async fn invalid_settings_fail_before_connecting() -> anyhow::Result<()> {
        let (store, cipher, db_path) = temp_store().await?;
        let mailbox = FakeMailbox::default();
        let mail = service(&store, &cipher, &mailbox, &FakeSmtp::default());

        let result = mail.create_account(request("not-an-address")).await;

        assert!(matches!(result, Err(MailError::Config(_))));
        assert!(mailbox.connects().is_empty());

        let _ = std::fs::remove_file(&db_path);
        Ok(())
    }

    #[tokio::test]
    async fn update_reverifies_and_keeps_preferences() -> anyhow::Result<()> {
        let (store, cipher, db_path) = temp_store().await?;
        let mailbox = FakeMailbox::default();
        let mail = service(&store, &cipher, &mailbox, &FakeSmtp::default());
        let account = mail.create_account(request("a@example.com")).await?;

        let mut update = request("a@example.com");
        update.preferences = AccountPreferences::default();
        update.overrides = Some(SettingsOverride {
            imap: mailsync_core::ImapSettings {
                host: "mail.example.com".to_string(),
                port: 993,
                use_tls: true,
            },
            smtp: mailsync_core::SmtpSettings {
                host: "mail.example.com".to_string(),
                port: 587,
                use_starttls: true,
            },
            sent_folder: Some("Sent Messages".to_string()),
        });
        let updated = mail.update_account(account.id, update).await?;

        assert_eq!(updated.imap.host, "mail.example.com");
        assert_eq!(updated.sync.sent_folder, "Sent Messages");
        assert_eq!(updated.sync.lookback_days, 7);
        assert_eq!(mailbox.connects().len(), 2);

        let _ = std::fs::remove_file(&db_path);
        Ok(())
    }

    #[tokio::test]
    async fn delete_waits_for_sync_and_cascades() -> anyhow::Result<()> {
        let (store, cipher, db_path) = temp_store().await?;
        let mailbox = FakeMailbox::default();
        let today = chrono::Utc::now().date_naive();
        mailbox.add(INBOX, 1, today, raw_message("d1@example.com", today, "hi", "body"), false);
        let mail = service(&store, &cipher, &mailbox, &FakeSmtp::default());
        let account = mail.create_account(request("a@example.com")).await?;

        let outcome = mail.orchestrator().run(account.id).await?;
        assert!(matches!(outcome, SyncOutcome::Completed(ref r) if r.stored == 1));

        assert!(mail.trigger_sync(account.id));
        mail.delete_account(account.id).await?;

        assert!(!mail.orchestrator().is_running(account.id));
        assert!(mail.list_accounts().await?.is_empty());
        assert_eq!(store.count_messages(account.id).await?, 0);

        let _ = std::fs::remove_file(&db_path);
        Ok(())
    }

    #[tokio::test]
    async fn delete_refuses_account_claimed_by_another_process() -> anyhow::Result<()> {
        let (store, cipher, db_path) = temp_store().await?;
        let mailbox = FakeMailbox::default();
        let today = chrono::Utc::now().date_naive();
        mailbox.add(INBOX, 1, today, raw_message("p1@example.com", today, "hi", "body"), false);
        let mail = service(&store, &cipher, &mailbox, &FakeSmtp::default());
        let account = mail.create_account(request("a@example.com")).await?;
        mail.orchestrator().run(account.id).await?;

        // Claimed in the store with no run registered in this orchestrator.
        assert!(store.try_begin_sync(account.id).await?);
        assert!(!mail.orchestrator().is_running(account.id));

        let result = mail.delete_account(account.id).await;
        assert!(matches!(result, Err(MailError::SyncInProgress(id)) if id == account.id));
        assert_eq!(mail.list_accounts().await?.len(), 1);
        assert_eq!(store.count_messages(account.id).await?, 1);

        store
            .finish_sync(account.id, SyncState::Active, None, chrono::Utc::now().timestamp())
            .await?;
        mail.delete_account(account.id).await?;
        assert!(mail.list_accounts().await?.is_empty());

        let _ = std::fs::remove_file(&db_path);
        Ok(())
    }

    #[tokio::test]
    async fn message_status_can_be_changed() -> anyhow::Result<()> {
        let (store, cipher, db_path) = temp_store().await?;
        let mailbox = FakeMailbox::default();
        let today = chrono::Utc::now().date_naive();
        mailbox.add(INBOX, 1, today, raw_message("s1@example.com", today, "hi", "body"), false);
        let mail = service(&store, &cipher, &mailbox, &FakeSmtp::default());
        let account = mail.create_account(request("a@example.com")).await?;
        mail.orchestrator().run(account.id).await?;

        let messages = mail.list_messages(account.id, Some(INBOX), Some(10)).await?;
        assert_eq!(messages[0].record.status, MessageStatus::Unread);
        mail.set_message_status(messages[0].id, MessageStatus::Archived)
            .await?;

        let messages = mail.list_messages(account.id, Some(INBOX), Some(10)).await?;
        assert_eq!(messages[0].record.status, MessageStatus::Archived);
        assert!(matches!(
            mail.set_message_status(9999, MessageStatus::Read).await,
            Err(MailError::Storage(_))
        ));

        let _ = std::fs::remove_file(&db_path);
        Ok(())
    }
}
