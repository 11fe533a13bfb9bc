use std::path::Path;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result, anyhow};
use chrono::Utc;
use secrecy::SecretString;
use serde_json::json;

use mailsync_content::HeuristicMatcher;
use mailsync_core::{CredentialCipher, MailAccount, MessageStatus, ProviderKind, SqliteMailStore};
use mailsync_mail::{
    AccountPreferences, AccountRequest, Connectors, MailCommand, MailEngine, MailEvent,
    MailService, OutgoingAttachment, SendRequest, SettingsOverride, resolve_settings,
};

use crate::cli::{
    AccountArgs, AccountCommand, Cli, CliCommand, MarkCmd, MessagesCmd, SendCmd, ServeCmd,
    SyncCmd,
};
use crate::config::{MailsyncConfig, load_config};
use crate::output::output_ok;

const SHUTDOWN_GRACE: Duration = Duration::from_secs(30);

struct Runtime {
    service: MailService,
    store: Arc<SqliteMailStore>,
    cipher: Arc<CredentialCipher>,
}

async fn open_runtime(config: &MailsyncConfig) -> Result<Runtime> {
    let cipher = Arc::new(
        CredentialCipher::from_env_var(&config.credential_key_env)
            .with_context(|| format!("loading credential key from ${}", config.credential_key_env))?,
    );
    let store = SqliteMailStore::connect(&config.database).await?;
    store.init().await?;
    let store = Arc::new(store);
    let service = MailService::new(
        store.clone(),
        Arc::clone(&cipher),
        Connectors::live(),
        HeuristicMatcher::new(&config.heuristics),
        config.sync.options(),
    );
    Ok(Runtime {
        service,
        store,
        cipher,
    })
}

pub(crate) async fn run_cli(cli: Cli) -> Result<()> {
    let config = load_config(cli.config.as_deref())?;
    if let CliCommand::Keygen = cli.command {
        return output_ok(json!({
            "env": config.credential_key_env,
            "key": CredentialCipher::generate_key(),
        }));
    }
    let runtime = open_runtime(&config).await?;
    match cli.command {
        CliCommand::Account(cmd) => match cmd.command {
            AccountCommand::Add(args) => add_account(&runtime, &config, &args).await,
            AccountCommand::Update { id, args } => update_account(&runtime, id, &args).await,
            AccountCommand::List => {
                let accounts = runtime.service.list_accounts().await?;
                output_ok(serde_json::to_value(accounts)?)
            }
            AccountCommand::Remove { id } => {
                runtime.service.delete_account(id).await?;
                output_ok(json!({ "removed": id }))
            }
        },
        CliCommand::Sync(cmd) => sync(&runtime, &cmd).await,
        CliCommand::Send(cmd) => send(&runtime, &cmd).await,
        CliCommand::Messages(cmd) => messages(&runtime, &cmd).await,
        CliCommand::Mark(cmd) => mark(&runtime, &cmd).await,
        CliCommand::Serve(cmd) => serve(runtime, &config, &cmd).await,
        CliCommand::Keygen => Ok(()),
    }
}

fn read_secret(args: &AccountArgs) -> Option<SecretString> {
    args.password
        .clone()
        .or_else(|| std::env::var(&args.password_env).ok())
        .filter(|secret| !secret.is_empty())
        .map(SecretString::from)
}

fn parse_provider(args: &AccountArgs) -> Result<Option<ProviderKind>> {
    args.provider
        .as_deref()
        .map(ProviderKind::from_str)
        .transpose()
}

fn has_server_flags(args: &AccountArgs) -> bool {
    args.imap_host.is_some()
        || args.imap_port.is_some()
        || args.imap_plain
        || args.smtp_host.is_some()
        || args.smtp_port.is_some()
        || args.smtp_no_starttls
        || args.sent_folder.is_some()
}

/// Layers host/port flags over `base`, which is the stored account on update
/// and the provider defaults on add.
fn settings_override(args: &AccountArgs, base: SettingsOverride) -> SettingsOverride {
    let mut settings = base;
    if let Some(host) = &args.imap_host {
        settings.imap.host = host.clone();
    }
    if let Some(port) = args.imap_port {
        settings.imap.port = port;
    }
    if args.imap_plain {
        settings.imap.use_tls = false;
    }
    if let Some(host) = &args.smtp_host {
        settings.smtp.host = host.clone();
    }
    if let Some(port) = args.smtp_port {
        settings.smtp.port = port;
    }
    if args.smtp_no_starttls {
        settings.smtp.use_starttls = false;
    }
    if let Some(folder) = &args.sent_folder {
        settings.sent_folder = Some(folder.clone());
    }
    settings
}

fn preferences(args: &AccountArgs, defaults: AccountPreferences) -> AccountPreferences {
    AccountPreferences {
        enabled: args.enabled.or(defaults.enabled),
        frequency_minutes: args.frequency_minutes.or(defaults.frequency_minutes),
        sync_inbox: args.sync_inbox.or(defaults.sync_inbox),
        sync_sent: args.sync_sent.or(defaults.sync_sent),
        lookback_days: args.lookback_days.or(defaults.lookback_days),
    }
}

fn new_account_request(
    args: &AccountArgs,
    config: &MailsyncConfig,
    secret: SecretString,
) -> Result<AccountRequest> {
    let address = args
        .address
        .clone()
        .ok_or_else(|| anyhow!("--address is required"))?;
    let provider_hint = parse_provider(args)?;
    let overrides = if has_server_flags(args) {
        let defaults = resolve_settings(&address, provider_hint, None);
        Some(settings_override(
            args,
            SettingsOverride {
                imap: defaults.imap,
                smtp: defaults.smtp,
                sent_folder: Some(defaults.sent_folder),
            },
        ))
    } else {
        None
    };
    Ok(AccountRequest {
        owner: args.owner.clone().unwrap_or_else(|| config.owner.clone()),
        address,
        display_name: args.name.clone(),
        secret,
        provider_hint,
        overrides,
        preferences: preferences(args, config.sync.preference_defaults()),
    })
}

fn update_account_request(
    args: &AccountArgs,
    existing: &MailAccount,
    secret: SecretString,
) -> Result<AccountRequest> {
    let overrides = settings_override(
        args,
        SettingsOverride {
            imap: existing.imap.clone(),
            smtp: existing.smtp.clone(),
            sent_folder: Some(existing.sync.sent_folder.clone()),
        },
    );
    Ok(AccountRequest {
        owner: args.owner.clone().unwrap_or_else(|| existing.owner.clone()),
        address: args.address.clone().unwrap_or_else(|| existing.address.clone()),
        display_name: args
            .name
            .clone()
            .or_else(|| Some(existing.display_name.clone())),
        secret,
        provider_hint: parse_provider(args)?.or(Some(existing.provider)),
        overrides: Some(overrides),
        preferences: preferences(args, AccountPreferences::default()),
    })
}

async fn add_account(runtime: &Runtime, config: &MailsyncConfig, args: &AccountArgs) -> Result<()> {
    let secret = read_secret(args)
        .ok_or_else(|| anyhow!("no password: pass --password or set ${}", args.password_env))?;
    let request = new_account_request(args, config, secret)?;
    let account = runtime.service.create_account(request).await?;
    output_ok(serde_json::to_value(account)?)
}

async fn update_account(runtime: &Runtime, id: i64, args: &AccountArgs) -> Result<()> {
    let existing = runtime
        .service
        .list_accounts()
        .await?
        .into_iter()
        .find(|account| account.id == id)
        .ok_or_else(|| anyhow!("account {} not found", id))?;
    let secret = match read_secret(args) {
        Some(secret) => secret,
        None => runtime.cipher.decrypt(&existing.encrypted_credential)?,
    };
    let request = update_account_request(args, &existing, secret)?;
    let account = runtime.service.update_account(id, request).await?;
    output_ok(serde_json::to_value(account)?)
}

async fn sync(runtime: &Runtime, cmd: &SyncCmd) -> Result<()> {
    let orchestrator = runtime.service.orchestrator();
    if let Some(account_id) = cmd.account {
        let outcome = orchestrator.run(account_id).await?;
        return output_ok(serde_json::to_value(outcome)?);
    }
    let triggered = runtime.service.sync_due(Utc::now().timestamp()).await?;
    for account_id in &triggered {
        orchestrator.wait_idle(*account_id).await;
    }
    let accounts = runtime
        .service
        .list_accounts()
        .await?
        .into_iter()
        .filter(|account| triggered.contains(&account.id))
        .map(|account| {
            json!({
                "id": account.id,
                "address": account.address,
                "sync_state": account.sync_state,
                "last_sync_error": account.last_sync_error,
                "last_sync_at": account.last_sync_at,
            })
        })
        .collect::<Vec<_>>();
    output_ok(json!({ "triggered": triggered, "accounts": accounts }))
}

fn read_attachment(path: &Path) -> Result<OutgoingAttachment> {
    let data = std::fs::read(path).with_context(|| format!("reading {}", path.display()))?;
    let filename = path
        .file_name()
        .map(|name| name.to_string_lossy().to_string())
        .ok_or_else(|| anyhow!("attachment path has no file name: {}", path.display()))?;
    let content_type = mime_guess::from_path(path)
        .first_or_octet_stream()
        .essence_str()
        .to_string();
    Ok(OutgoingAttachment {
        filename,
        content_type,
        data,
    })
}

fn send_request(cmd: &SendCmd) -> Result<SendRequest> {
    let body_text = match (&cmd.body, &cmd.body_file) {
        (Some(body), _) => Some(body.clone()),
        (None, Some(path)) => Some(
            std::fs::read_to_string(path).with_context(|| format!("reading {}", path.display()))?,
        ),
        (None, None) => None,
    };
    let body_html = cmd
        .html_file
        .as_deref()
        .map(|path| {
            std::fs::read_to_string(path).with_context(|| format!("reading {}", path.display()))
        })
        .transpose()?;
    let attachments = cmd
        .attachments
        .iter()
        .map(|path| read_attachment(path))
        .collect::<Result<Vec<_>>>()?;
    Ok(SendRequest {
        to: cmd.to.clone(),
        cc: cmd.cc.clone(),
        bcc: cmd.bcc.clone(),
        subject: cmd.subject.clone(),
        body_text,
        body_html,
        in_reply_to: cmd.in_reply_to.clone(),
        attachments,
    })
}

async fn send(runtime: &Runtime, cmd: &SendCmd) -> Result<()> {
    let request = send_request(cmd)?;
    let sent = runtime.service.send_message(cmd.account, &request).await?;
    output_ok(serde_json::to_value(sent)?)
}

async fn messages(runtime: &Runtime, cmd: &MessagesCmd) -> Result<()> {
    let messages = runtime
        .service
        .list_messages(cmd.account, cmd.folder.as_deref(), Some(cmd.limit))
        .await?;
    output_ok(serde_json::to_value(messages)?)
}

async fn mark(runtime: &Runtime, cmd: &MarkCmd) -> Result<()> {
    let status = MessageStatus::from_str(&cmd.status)?;
    runtime.service.set_message_status(cmd.id, status).await?;
    output_ok(json!({ "id": cmd.id, "status": status }))
}

fn log_event(event: &MailEvent) {
    match event {
        MailEvent::SyncStarted(account_id) => tracing::info!(account_id, "sync started"),
        MailEvent::SyncFinished {
            account_id,
            result: Ok(report),
        } => tracing::info!(
            account_id,
            stored = report.stored,
            skipped = report.skipped,
            failed = report.failed,
            cancelled = report.cancelled,
            "sync finished"
        ),
        MailEvent::SyncFinished {
            account_id,
            result: Err(err),
        } => tracing::warn!(account_id, error = %err, "sync failed"),
        MailEvent::SyncSkipped { account_id, reason } => {
            tracing::debug!(account_id, reason, "sync skipped")
        }
        MailEvent::SendCompleted { account_id, sent } => {
            tracing::info!(account_id, message_id = %sent.message_id, "message sent")
        }
        MailEvent::SendFailed { account_id, reason } => {
            tracing::warn!(account_id, reason = %reason, "send failed")
        }
    }
}

/// Scheduler loop: checks for due accounts every tick until ctrl-c.
async fn serve(runtime: Runtime, config: &MailsyncConfig, cmd: &ServeCmd) -> Result<()> {
    let reset = runtime.store.reset_interrupted_syncs().await?;
    let period = Duration::from_secs(cmd.interval.unwrap_or(config.sync.poll_seconds).max(1));
    tracing::info!(interval_secs = period.as_secs(), reset, "scheduler started");

    let service = runtime.service.clone();
    let (engine, mut events) = MailEngine::start(runtime.service);
    let mut ticker = tokio::time::interval(period);
    let shutdown = tokio::signal::ctrl_c();
    tokio::pin!(shutdown);
    loop {
        tokio::select! {
            _ = ticker.tick() => {
                if let Err(err) = engine.send(MailCommand::SyncDue(None)) {
                    tracing::warn!(error = %err, "scheduling tick dropped");
                }
            }
            Some(event) = events.recv() => log_event(&event),
            _ = &mut shutdown => {
                tracing::info!("shutdown requested");
                break;
            }
        }
    }

    let accounts = service.list_accounts().await?;
    let running = accounts
        .iter()
        .map(|account| account.id)
        .filter(|id| service.cancel_sync(*id))
        .collect::<Vec<_>>();
    let drain = async {
        for account_id in &running {
            service.orchestrator().wait_idle(*account_id).await;
        }
    };
    if tokio::time::timeout(SHUTDOWN_GRACE, drain).await.is_err() {
        tracing::warn!(count = running.len(), "syncs still running at shutdown");
    }
    output_ok(json!({ "stopped": true, "cancelled": running }))
}
