use anyhow::{Result, anyhow};
use chrono::Utc;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;

use crate::dispatch::{SendRequest, SentMessage};
use crate::service::MailService;
use crate::sync::{SyncOutcome, SyncReport};

const MAIL_CMD_QUEUE_CAPACITY: usize = 256;
const MAIL_EVENT_QUEUE_CAPACITY: usize = 256;

#[derive(Debug, Clone)]
pub enum MailCommand {
    TriggerSync(i64),
    /// Triggers every account due at the given unix time, or now.
    SyncDue(Option<i64>),
    CancelSync(i64),
    Send {
        account_id: i64,
        request: Box<SendRequest>,
    },
}

#[derive(Debug, Clone)]
pub enum MailEvent {
    SyncStarted(i64),
    SyncFinished {
        account_id: i64,
        result: Result<SyncReport, String>,
    },
    SyncSkipped {
        account_id: i64,
        reason: &'static str,
    },
    SendCompleted {
        account_id: i64,
        sent: SentMessage,
    },
    SendFailed {
        account_id: i64,
        reason: String,
    },
}

/// Queue-driven front end over [`MailService`]; commands never block the caller.
#[derive(Clone)]
pub struct MailEngine {
    tx: mpsc::Sender<MailCommand>,
}

impl MailEngine {
    pub fn start(service: MailService) -> (Self, mpsc::Receiver<MailEvent>) {
        let (cmd_tx, mut cmd_rx) = mpsc::channel::<MailCommand>(MAIL_CMD_QUEUE_CAPACITY);
        let (evt_tx, evt_rx) = mpsc::channel::<MailEvent>(MAIL_EVENT_QUEUE_CAPACITY);

        tokio::spawn(async move {
            while let Some(cmd) = cmd_rx.recv().await {
                match cmd {
                    MailCommand::TriggerSync(account_id) => {
                        spawn_sync(&service, &evt_tx, account_id).await;
                    }
                    MailCommand::SyncDue(at) => {
                        let now = at.unwrap_or_else(|| Utc::now().timestamp());
                        match service.list_accounts().await {
                            Ok(accounts) => {
                                for account in accounts.iter().filter(|a| a.is_sync_due(now)) {
                                    spawn_sync(&service, &evt_tx, account.id).await;
                                }
                            }
                            Err(err) => {
                                tracing::error!(error = %err, "listing accounts for scheduled sync failed");
                            }
                        }
                    }
                    MailCommand::CancelSync(account_id) => {
                        if !service.cancel_sync(account_id) {
                            tracing::debug!(account_id, "no sync to cancel");
                        }
                    }
                    MailCommand::Send {
                        account_id,
                        request,
                    } => {
                        let service = service.clone();
                        let tx = evt_tx.clone();
                        tokio::spawn(async move {
                            let event = match service.send_message(account_id, &request).await {
                                Ok(sent) => MailEvent::SendCompleted { account_id, sent },
                                Err(err) => MailEvent::SendFailed {
                                    account_id,
                                    reason: err.to_string(),
                                },
                            };
                            let _ = tx.send(event).await;
                        });
                    }
                }
            }
        });

        (Self { tx: cmd_tx }, evt_rx)
    }

    pub fn send(&self, cmd: MailCommand) -> Result<()> {
        match self.tx.try_send(cmd) {
            Ok(()) => Ok(()),
            Err(TrySendError::Full(cmd)) => {
                tracing::warn!(?cmd, "mail command queue full, dropping");
                Err(anyhow!("mail command queue full"))
            }
            Err(TrySendError::Closed(_)) => Err(anyhow!("mail command queue closed")),
        }
    }
}

async fn spawn_sync(service: &MailService, evt_tx: &mpsc::Sender<MailEvent>, account_id: i64) {
    let Some(run) = service.orchestrator().start(account_id) else {
        let _ = evt_tx
            .send(MailEvent::SyncSkipped {
                account_id,
                reason: "already syncing",
            })
            .await;
        return;
    };
    let tx = evt_tx.clone();
    tokio::spawn(async move {
        let _ = tx.send(MailEvent::SyncStarted(account_id)).await;
        let event = match run.execute().await {
            Ok(SyncOutcome::Completed(report)) => MailEvent::SyncFinished {
                account_id,
                result: Ok(report),
            },
            Ok(SyncOutcome::AlreadyRunning) => MailEvent::SyncSkipped {
                account_id,
                reason: "already syncing",
            },
            Ok(SyncOutcome::Disabled) => MailEvent::SyncSkipped {
                account_id,
                reason: "sync disabled",
            },
            Err(err) => MailEvent::SyncFinished {
                account_id,
                result: Err(err.to_string()),
            },
        };
        let _ = tx.send(event).await;
    });
}
