use std::path::PathBuf;

use clap::{Args, Parser, Subcommand};

#[derive(Parser, Debug)]
#[command(name = "mailsync", version, about = "Mailbox sync and dispatch engine")]
pub(crate) struct Cli {
    /// Config file; defaults to ./mailsync.toml then $XDG_CONFIG_HOME/mailsync/mailsync.toml.
    #[arg(short = 'c', long = "config", global = true)]
    pub(crate) config: Option<PathBuf>,
    #[command(subcommand)]
    pub(crate) command: CliCommand,
}

#[derive(Subcommand, Debug)]
pub(crate) enum CliCommand {
    Account(AccountCmd),
    Sync(SyncCmd),
    Send(SendCmd),
    Messages(MessagesCmd),
    Mark(MarkCmd),
    Serve(ServeCmd),
    /// Prints a fresh base64 credential key.
    Keygen,
}

#[derive(Args, Debug)]
pub(crate) struct AccountCmd {
    #[command(subcommand)]
    pub(crate) command: AccountCommand,
}

#[derive(Subcommand, Debug)]
pub(crate) enum AccountCommand {
    Add(AccountArgs),
    Update {
        id: i64,
        #[command(flatten)]
        args: AccountArgs,
    },
    List,
    Remove {
        id: i64,
    },
}

#[derive(Args, Debug, Clone)]
pub(crate) struct AccountArgs {
    #[arg(long)]
    pub(crate) address: Option<String>,
    #[arg(long)]
    pub(crate) name: Option<String>,
    #[arg(long)]
    pub(crate) owner: Option<String>,
    /// App password; prefer --password-env so it stays out of shell history.
    #[arg(long, conflicts_with = "password_env")]
    pub(crate) password: Option<String>,
    #[arg(long, default_value = "MAILSYNC_PASSWORD")]
    pub(crate) password_env: String,
    /// gmail, outlook, yahoo or generic.
    #[arg(long)]
    pub(crate) provider: Option<String>,
    #[arg(long)]
    pub(crate) imap_host: Option<String>,
    #[arg(long)]
    pub(crate) imap_port: Option<u16>,
    #[arg(long)]
    pub(crate) imap_plain: bool,
    #[arg(long)]
    pub(crate) smtp_host: Option<String>,
    #[arg(long)]
    pub(crate) smtp_port: Option<u16>,
    #[arg(long)]
    pub(crate) smtp_no_starttls: bool,
    #[arg(long)]
    pub(crate) sent_folder: Option<String>,
    #[arg(long)]
    pub(crate) enabled: Option<bool>,
    #[arg(long)]
    pub(crate) frequency_minutes: Option<u32>,
    #[arg(long)]
    pub(crate) sync_inbox: Option<bool>,
    #[arg(long)]
    pub(crate) sync_sent: Option<bool>,
    #[arg(long)]
    pub(crate) lookback_days: Option<u32>,
}

#[derive(Args, Debug)]
pub(crate) struct SyncCmd {
    /// Account to sync; without it every due account runs.
    #[arg(long)]
    pub(crate) account: Option<i64>,
}

#[derive(Args, Debug)]
pub(crate) struct SendCmd {
    #[arg(long)]
    pub(crate) account: i64,
    #[arg(long, required = true)]
    pub(crate) to: Vec<String>,
    #[arg(long)]
    pub(crate) cc: Vec<String>,
    #[arg(long)]
    pub(crate) bcc: Vec<String>,
    #[arg(long, default_value = "")]
    pub(crate) subject: String,
    #[arg(long, conflicts_with = "body_file")]
    pub(crate) body: Option<String>,
    #[arg(long)]
    pub(crate) body_file: Option<PathBuf>,
    #[arg(long)]
    pub(crate) html_file: Option<PathBuf>,
    #[arg(long)]
    pub(crate) in_reply_to: Option<String>,
    #[arg(long = "attach")]
    pub(crate) attachments: Vec<PathBuf>,
}

#[derive(Args, Debug)]
pub(crate) struct MessagesCmd {
    #[arg(long)]
    pub(crate) account: i64,
    #[arg(long)]
    pub(crate) folder: Option<String>,
    #[arg(long, default_value_t = 50)]
    pub(crate) limit: i64,
}

#[derive(Args, Debug)]
pub(crate) struct MarkCmd {
    pub(crate) id: i64,
    /// unread, read or archived.
    pub(crate) status: String,
}

#[derive(Args, Debug)]
pub(crate) struct ServeCmd {
    /// Seconds between due-account checks; overrides [sync].poll_seconds.
    #[arg(long)]
    pub(crate) interval: Option<u64>,
}
