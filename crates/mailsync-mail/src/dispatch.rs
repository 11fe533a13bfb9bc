use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use lettre::message::{
    Attachment, Body, Mailbox, Message, MultiPart, SinglePart,
    header::{ContentTransferEncoding, ContentType},
};
use mailparse::{MailAddr, addrparse};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use mailsync_core::{
    AttachmentRecord, ContentInsights, CredentialCipher, Direction, MailAccount, MailStore,
    MessageFlags, MessageRecord, MessageStatus, SENT_FOLDER_MARKER,
};

use crate::settings::address_domain;
use crate::transport::{Credentials, DEFAULT_ATTEMPT_TIMEOUT, with_smtp};
use crate::{Connectors, MailError};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OutgoingAttachment {
    pub filename: String,
    pub content_type: String,
    #[serde(skip)]
    pub data: Vec<u8>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SendRequest {
    pub to: Vec<String>,
    #[serde(default)]
    pub cc: Vec<String>,
    #[serde(default)]
    pub bcc: Vec<String>,
    pub subject: String,
    #[serde(default)]
    pub body_text: Option<String>,
    #[serde(default)]
    pub body_html: Option<String>,
    #[serde(default)]
    pub in_reply_to: Option<String>,
    #[serde(default)]
    pub attachments: Vec<OutgoingAttachment>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SentMessage {
    pub id: i64,
    pub message_id: String,
    pub transport: String,
}

#[derive(Clone)]
pub struct Dispatcher {
    store: Arc<dyn MailStore>,
    cipher: Arc<CredentialCipher>,
    connectors: Connectors,
    timeout: Duration,
}

impl Dispatcher {
    pub fn new(
        store: Arc<dyn MailStore>,
        cipher: Arc<CredentialCipher>,
        connectors: Connectors,
    ) -> Self {
        Self {
            store,
            cipher,
            connectors,
            timeout: DEFAULT_ATTEMPT_TIMEOUT,
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Sends `request` from `account` and records it as a sent message.
    /// Failures are returned as-is; nothing is retried here.
    pub async fn send_message(
        &self,
        account: &MailAccount,
        request: &SendRequest,
    ) -> Result<SentMessage, MailError> {
        let domain = address_domain(&account.address).unwrap_or_else(|| "localhost".to_string());
        let message_id = format!("{}@{}", Uuid::new_v4(), domain);
        let email = build_email(account, request, &message_id)?;

        let credentials = Credentials {
            username: account.address.clone(),
            secret: self.cipher.decrypt(&account.encrypted_credential)?,
        };
        let timeout = self.timeout;
        let (attempt, ()) = with_smtp(&account.smtp, |attempt| {
            let connector = Arc::clone(&self.connectors.smtp);
            let credentials = credentials.clone();
            let email = email.clone();
            async move { connector.submit(&attempt, &credentials, timeout, email).await }
        })
        .await?;
        tracing::info!(account_id = account.id, message_id = %message_id, transport = %attempt, "message sent");

        let (record, attachments) = sent_record(account, request, &message_id);
        let id = self
            .store
            .insert_message(account.id, &record, &attachments)
            .await?
            .ok_or_else(|| MailError::Storage(format!("message {} already stored", message_id)))?;

        Ok(SentMessage {
            id,
            message_id,
            transport: attempt.to_string(),
        })
    }
}

fn sent_record(
    account: &MailAccount,
    request: &SendRequest,
    message_id: &str,
) -> (MessageRecord, Vec<AttachmentRecord>) {
    let now = Utc::now().timestamp();
    let attachments: Vec<AttachmentRecord> = request
        .attachments
        .iter()
        .enumerate()
        .map(|(idx, attachment)| {
            AttachmentRecord::from_bytes(
                attachment.filename.clone(),
                attachment.content_type.clone(),
                attachment.data.clone(),
                || format!("mime-part:{}/{}", message_id, idx + 1),
                false,
            )
        })
        .collect();
    let record = MessageRecord {
        message_id: message_id.to_string(),
        thread_id: request
            .in_reply_to
            .as_deref()
            .and_then(mailsync_content::normalize_message_id)
            .unwrap_or_else(|| message_id.to_string()),
        subject: request.subject.clone(),
        from_address: account.address.clone(),
        from_name: (!account.display_name.is_empty()).then(|| account.display_name.clone()),
        to: request.to.clone(),
        cc: request.cc.clone(),
        bcc: request.bcc.clone(),
        reply_to: Vec::new(),
        body_text: request.body_text.clone(),
        body_html: request.body_html.clone(),
        direction: Direction::Outgoing,
        status: MessageStatus::Read,
        sent_at: now,
        received_at: now,
        folder: SENT_FOLDER_MARKER.to_string(),
        flags: MessageFlags {
            has_attachments: !attachments.is_empty(),
            ..MessageFlags::default()
        },
        insights: ContentInsights::default(),
    };
    (record, attachments)
}

/// Builds the MIME message: alternative text/HTML, wrapped in mixed when there are attachments.
pub fn build_email(
    account: &MailAccount,
    request: &SendRequest,
    message_id: &str,
) -> Result<Message, MailError> {
    let from = Mailbox::new(
        (!account.display_name.is_empty()).then(|| account.display_name.clone()),
        account
            .address
            .parse()
            .map_err(|e| MailError::Config(format!("invalid sender address: {}", e)))?,
    );
    let to = parse_mailbox_list(&request.to)?;
    let cc = parse_mailbox_list(&request.cc)?;
    let bcc = parse_mailbox_list(&request.bcc)?;
    if to.is_empty() && cc.is_empty() && bcc.is_empty() {
        return Err(MailError::Config("no recipients".to_string()));
    }

    let mut builder = Message::builder()
        .from(from)
        .subject(request.subject.clone())
        .message_id(Some(format!("<{}>", message_id)));
    if let Some(parent) = request
        .in_reply_to
        .as_deref()
        .and_then(mailsync_content::normalize_message_id)
    {
        builder = builder
            .in_reply_to(format!("<{}>", parent))
            .references(format!("<{}>", parent));
    }
    for addr in to {
        builder = builder.to(addr);
    }
    for addr in cc {
        builder = builder.cc(addr);
    }
    for addr in bcc {
        builder = builder.bcc(addr);
    }

    let text = request.body_text.clone().unwrap_or_default();
    let email = if request.attachments.is_empty() {
        match &request.body_html {
            Some(html) => builder.multipart(MultiPart::alternative_plain_html(text, html.clone())),
            None => builder.singlepart(SinglePart::plain(text)),
        }
    } else {
        let mut multipart = match &request.body_html {
            Some(html) => MultiPart::mixed()
                .multipart(MultiPart::alternative_plain_html(text, html.clone())),
            None => MultiPart::mixed().singlepart(SinglePart::plain(text)),
        };
        for attachment in &request.attachments {
            let content_type = ContentType::parse(&attachment.content_type)
                .or_else(|_| ContentType::parse("application/octet-stream"))
                .map_err(|e| MailError::Config(format!("invalid content type: {}", e)))?;
            let body = Body::new_with_encoding(attachment.data.clone(), ContentTransferEncoding::Base64)
                .map_err(|_| MailError::Config(format!("cannot encode {}", attachment.filename)))?;
            multipart = multipart
                .singlepart(Attachment::new(attachment.filename.clone()).body(body, content_type));
        }
        builder.multipart(multipart)
    };
    email.map_err(|e| MailError::Config(format!("cannot build message: {}", e)))
}

fn parse_mailbox_list(entries: &[String]) -> Result<Vec<Mailbox>, MailError> {
    let mut out = Vec::new();
    for entry in entries.iter().map(|e| e.trim()).filter(|e| !e.is_empty()) {
        let parsed = addrparse(entry)
            .map_err(|e| MailError::Config(format!("invalid recipient '{}': {}", entry, e)))?;
        out.extend(mailaddrs_to_mailboxes(&parsed)?);
    }
    Ok(out)
}

fn mailaddrs_to_mailboxes(addrs: &[MailAddr]) -> Result<Vec<Mailbox>, MailError> {
    let mut out = Vec::new();
    let mut push = |name: &Option<String>, addr: &str| -> Result<(), MailError> {
        let parsed = addr
            .parse()
            .map_err(|e| MailError::Config(format!("invalid recipient '{}': {}", addr, e)))?;
        out.push(Mailbox::new(name.clone(), parsed));
        Ok(())
    };
    for addr in addrs {
        match addr {
            MailAddr::Single(info) => push(&info.display_name, &info.addr)?,
            MailAddr::Group(group) => {
                for info in &group.addrs {
                    push(&info.display_name, &info.addr)?;
                }
            }
        }
    }
    Ok(out)
}
