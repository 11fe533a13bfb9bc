use std::sync::LazyLock;

use base64::Engine;
use base64::engine::general_purpose::{STANDARD as BASE64_STD, STANDARD_NO_PAD};
use mailparse::{
    DispositionType, MailAddr, MailHeader, MailHeaderMap, ParsedMail, addrparse_header,
};
use regex::Regex;

use mailsync_core::{
    AttachmentRecord, ContentInsights, Direction, MessageFlags, MessageRecord, MessageStatus,
};

static ENCODED_WORD: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"=\?([^?\s]+)\?([BbQq])\?([^?\s]*)\?=").expect("encoded-word regex")
});

static FROM_WITH_NAME: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#"^\s*"?([^"<]*?)"?\s*<([^<>\s]+@[^<>\s]+)>"#).expect("from regex")
});

static BARE_ADDRESS: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"[A-Za-z0-9._%+\-]+@[A-Za-z0-9.\-]+").expect("address regex"));

#[derive(Debug, thiserror::Error)]
pub enum ParseError {
    #[error("message has no usable Message-ID")]
    MissingMessageId,
    #[error("malformed message: {0}")]
    Malformed(#[from] mailparse::MailParseError),
}

/// A fetched message reduced to the fields the store keeps.
#[derive(Debug, Clone)]
pub struct ParsedMessage {
    pub message_id: String,
    pub thread_id: String,
    pub subject: String,
    pub from_address: String,
    pub from_name: Option<String>,
    pub to: Vec<String>,
    pub cc: Vec<String>,
    pub bcc: Vec<String>,
    pub reply_to: Vec<String>,
    pub sent_at: i64,
    pub body_text: Option<String>,
    pub body_html: Option<String>,
    pub important: bool,
    pub attachments: Vec<AttachmentRecord>,
}

impl ParsedMessage {
    pub fn into_record(
        self,
        folder: &str,
        direction: Direction,
        status: MessageStatus,
        starred: bool,
        received_at: i64,
    ) -> (MessageRecord, Vec<AttachmentRecord>) {
        let record = MessageRecord {
            message_id: self.message_id,
            thread_id: self.thread_id,
            subject: self.subject,
            from_address: self.from_address,
            from_name: self.from_name,
            to: self.to,
            cc: self.cc,
            bcc: self.bcc,
            reply_to: self.reply_to,
            body_text: self.body_text,
            body_html: self.body_html,
            direction,
            status,
            sent_at: self.sent_at,
            received_at,
            folder: folder.to_string(),
            flags: MessageFlags {
                important: self.important,
                starred,
                has_attachments: !self.attachments.is_empty(),
            },
            insights: ContentInsights::default(),
        };
        (record, self.attachments)
    }
}

pub fn parse_message(raw: &[u8]) -> Result<ParsedMessage, ParseError> {
    let parsed = mailparse::parse_mail(raw)?;
    let headers = &parsed.headers;

    let message_id = headers
        .get_first_value("Message-ID")
        .and_then(|value| normalize_message_id(&value))
        .ok_or(ParseError::MissingMessageId)?;

    let subject = raw_header_text(headers.get_first_header("Subject"))
        .map(|value| decode_encoded_words(&value))
        .unwrap_or_default();

    let (from_address, from_name) = raw_header_text(headers.get_first_header("From"))
        .map(|value| parse_from(&value))
        .unwrap_or_default();

    let sent_at = headers
        .get_first_value("Date")
        .and_then(|value| mailparse::dateparse(&value).ok())
        // dateparse yields 0 for text with no date tokens.
        .filter(|ts| *ts > 0)
        .unwrap_or_else(|| chrono::Utc::now().timestamp());

    let thread_id = headers
        .get_first_value("References")
        .and_then(|value| first_message_id(&value))
        .or_else(|| {
            headers
                .get_first_value("In-Reply-To")
                .and_then(|value| first_message_id(&value))
        })
        .unwrap_or_else(|| message_id.clone());

    let (body_text, body_html) = select_bodies(&parsed);
    let mut attachments = Vec::new();
    let mut part_index = 0usize;
    collect_attachments(&parsed, &message_id, &mut part_index, &mut attachments)?;

    Ok(ParsedMessage {
        thread_id,
        subject,
        from_address,
        from_name,
        to: header_addresses(headers, "To"),
        cc: header_addresses(headers, "Cc"),
        bcc: header_addresses(headers, "Bcc"),
        reply_to: header_addresses(headers, "Reply-To"),
        sent_at,
        body_text,
        body_html,
        important: is_important(headers),
        attachments,
        message_id,
    })
}

/// Reads the Message-ID out of a header-only fetch.
pub fn message_id_from_headers(raw: &[u8]) -> Option<String> {
    let (headers, _) = mailparse::parse_headers(raw).ok()?;
    headers
        .get_first_value("Message-ID")
        .and_then(|value| normalize_message_id(&value))
}

/// Strips whitespace and enclosing angle brackets; `None` when nothing remains.
pub fn normalize_message_id(value: &str) -> Option<String> {
    let trimmed = value.trim();
    let trimmed = trimmed.strip_prefix('<').unwrap_or(trimmed);
    let trimmed = trimmed.strip_suffix('>').unwrap_or(trimmed).trim();
    if trimmed.is_empty() {
        None
    } else {
        Some(trimmed.to_string())
    }
}

/// Decodes RFC 2047 encoded words in place. Spans that fail to decode stay literal.
pub fn decode_encoded_words(input: &str) -> String {
    let mut out = String::with_capacity(input.len());
    let mut last_end = 0;
    let mut previous_decoded = false;

    for caps in ENCODED_WORD.captures_iter(input) {
        let Some(whole) = caps.get(0) else {
            continue;
        };
        let gap = &input[last_end..whole.start()];
        let decoded = decode_word(&caps[1], &caps[2], &caps[3]);

        // Whitespace between two adjacent encoded words is not part of the text.
        if !(previous_decoded && decoded.is_some() && gap.trim().is_empty()) {
            out.push_str(gap);
        }
        match decoded {
            Some(text) => {
                out.push_str(&text);
                previous_decoded = true;
            }
            None => {
                out.push_str(whole.as_str());
                previous_decoded = false;
            }
        }
        last_end = whole.end();
    }
    out.push_str(&input[last_end..]);
    out
}

fn decode_word(charset: &str, encoding: &str, payload: &str) -> Option<String> {
    let bytes = match encoding {
        "B" | "b" => BASE64_STD
            .decode(payload)
            .or_else(|_| STANDARD_NO_PAD.decode(payload.trim_end_matches('=')))
            .ok()?,
        _ => decode_q(payload)?,
    };
    decode_charset(charset, bytes)
}

fn decode_q(payload: &str) -> Option<Vec<u8>> {
    let bytes = payload.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        match bytes[i] {
            b'_' => out.push(b' '),
            b'=' => {
                let hex = payload.get(i + 1..i + 3)?;
                out.push(u8::from_str_radix(hex, 16).ok()?);
                i += 2;
            }
            other => out.push(other),
        }
        i += 1;
    }
    Some(out)
}

fn decode_charset(charset: &str, bytes: Vec<u8>) -> Option<String> {
    // RFC 2231 allows a language suffix such as `utf-8*en`.
    let charset = charset.split('*').next().unwrap_or(charset);
    match charset.to_ascii_lowercase().as_str() {
        "iso-8859-1" | "latin1" | "latin-1" | "windows-1252" | "cp1252" => {
            Some(bytes.iter().map(|&b| b as char).collect())
        }
        _ => String::from_utf8(bytes).ok(),
    }
}

fn raw_header_text(header: Option<&MailHeader>) -> Option<String> {
    let header = header?;
    let raw = String::from_utf8_lossy(header.get_value_raw());
    let unfolded = raw
        .split(['\r', '\n'])
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .collect::<Vec<_>>()
        .join(" ");
    Some(unfolded)
}

fn parse_from(value: &str) -> (String, Option<String>) {
    if let Some(caps) = FROM_WITH_NAME.captures(value) {
        let name = decode_encoded_words(caps[1].trim());
        let name = (!name.is_empty()).then_some(name);
        return (caps[2].trim().to_ascii_lowercase(), name);
    }
    let address = BARE_ADDRESS
        .find(value)
        .map(|m| m.as_str().to_ascii_lowercase())
        .unwrap_or_else(|| value.trim().to_string());
    (address, None)
}

fn header_addresses(headers: &[MailHeader], name: &str) -> Vec<String> {
    let Some(header) = headers.get_first_header(name) else {
        return Vec::new();
    };
    match addrparse_header(header) {
        Ok(list) => mailaddrs_to_emails(&list),
        Err(_) => header
            .get_value()
            .split(',')
            .filter_map(|entry| BARE_ADDRESS.find(entry).map(|m| m.as_str().to_string()))
            .collect(),
    }
}

fn mailaddrs_to_emails(addrs: &[MailAddr]) -> Vec<String> {
    let mut out = Vec::new();
    for addr in addrs {
        match addr {
            MailAddr::Single(info) => push_address(&mut out, &info.addr),
            MailAddr::Group(group) => {
                for info in &group.addrs {
                    push_address(&mut out, &info.addr);
                }
            }
        }
    }
    out
}

fn push_address(out: &mut Vec<String>, addr: &str) {
    let email = addr.trim();
    if !email.is_empty() {
        out.push(email.to_string());
    }
}

fn first_message_id(value: &str) -> Option<String> {
    value
        .split_whitespace()
        .find(|token| token.contains('@'))
        .and_then(normalize_message_id)
}

fn is_important(headers: &[MailHeader]) -> bool {
    let importance = headers
        .get_first_value("Importance")
        .is_some_and(|value| value.trim().eq_ignore_ascii_case("high"));
    let priority = headers.get_first_value("X-Priority").is_some_and(|value| {
        matches!(value.trim().chars().next(), Some('1') | Some('2'))
    });
    importance || priority
}

fn is_attachment_part(part: &ParsedMail) -> bool {
    matches!(
        part.get_content_disposition().disposition,
        DispositionType::Attachment
    )
}

fn select_bodies(parsed: &ParsedMail) -> (Option<String>, Option<String>) {
    let mut text_plain: Option<String> = None;
    let mut text_html: Option<String> = None;

    walk_parts(parsed, &mut |part| {
        if !part.subparts.is_empty() || is_attachment_part(part) {
            return;
        }
        let ctype = part.ctype.mimetype.to_lowercase();
        if ctype == "text/plain" && text_plain.is_none() {
            if let Ok(body) = part.get_body() {
                text_plain = Some(body);
            }
        }
        if ctype == "text/html" && text_html.is_none() {
            if let Ok(body) = part.get_body() {
                text_html = Some(body);
            }
        }
    });

    (text_plain, text_html)
}

fn walk_parts<F>(parsed: &ParsedMail, cb: &mut F)
where
    F: FnMut(&ParsedMail),
{
    cb(parsed);
    for part in &parsed.subparts {
        walk_parts(part, cb);
    }
}

fn collect_attachments(
    parsed: &ParsedMail,
    message_id: &str,
    part_index: &mut usize,
    out: &mut Vec<AttachmentRecord>,
) -> Result<(), ParseError> {
    if !parsed.subparts.is_empty() {
        for part in &parsed.subparts {
            collect_attachments(part, message_id, part_index, out)?;
        }
        return Ok(());
    }

    let index = *part_index;
    *part_index += 1;

    let disposition = parsed.get_content_disposition();
    let filename = disposition
        .params
        .get("filename")
        .cloned()
        .or_else(|| parsed.ctype.params.get("name").cloned());
    let ctype = parsed.ctype.mimetype.to_lowercase();
    let inline = match disposition.disposition {
        DispositionType::Attachment => false,
        // Inline parts only count when they carry a file, e.g. embedded images.
        DispositionType::Inline if filename.is_some() && !ctype.starts_with("text/") => true,
        _ => return Ok(()),
    };

    let data = parsed.get_body_raw()?;
    let name = filename
        .map(|name| decode_encoded_words(&name))
        .unwrap_or_else(|| format!("attachment-{}", index));
    tracing::trace!(part = index, filename = %name, size = data.len(), "attachment part");
    out.push(AttachmentRecord::from_bytes(
        name,
        ctype,
        data,
        || format!("mime-part:{}/{}", message_id, index),
        inline,
    ));
    Ok(())
}

#[cfg(test)]
mod tests {
    use mailsync_core::{AttachmentContent, INLINE_ATTACHMENT_LIMIT};

    use super::*;

    #[test]
    fn decodes_base64_subject() {
        // "Grüße aus Köln"
        let encoded = format!("=?utf-8?B?{}?=", BASE64_STD.encode("Grüße aus Köln"));
        assert_eq!(decode_encoded_words(&encoded), "Grüße aus Köln");
    }

    #[test]
    fn splices_encoded_words_into_literal_text() {
        let encoded = format!(
            "Re: =?UTF-8?B?{}?= =?UTF-8?B?{}?= (2)",
            BASE64_STD.encode("caf"),
            BASE64_STD.encode("é ouvert")
        );
        assert_eq!(decode_encoded_words(&encoded), "Re: café ouvert (2)");
    }

    #[test]
    fn decodes_q_encoding_and_latin1() {
        assert_eq!(
            decode_encoded_words("=?iso-8859-1?Q?Caf=E9_cr=E8me?="),
            "Café crème"
        );
    }

    #[test]
    fn malformed_encoded_word_stays_literal() {
        let input = "Hello =?utf-8?B?###?= world";
        assert_eq!(decode_encoded_words(input), input);
        let bad_utf8 = format!("=?utf-8?B?{}?=", BASE64_STD.encode([0xff, 0xfe]));
        assert_eq!(decode_encoded_words(&bad_utf8), bad_utf8);
    }

    #[test]
    fn parses_headers_and_bodies() {
        let raw = b"Message-ID: <abc@example.com>\r\n\
From: \"Alice Example\" <Alice@Example.com>\r\n\
To: Bob <bob@example.com>, carol@example.com\r\n\
Cc: dave@example.com\r\n\
Reply-To: replies@example.com\r\n\
References: <root@example.com> <mid@example.com>\r\n\
X-Priority: 1\r\n\
Subject: =?utf-8?B?SGVsbG8=?= there\r\n\
Date: Tue, 01 Jul 2025 10:00:00 +0000\r\n\
MIME-Version: 1.0\r\n\
Content-Type: multipart/alternative; boundary=\"b1\"\r\n\
\r\n\
--b1\r\n\
Content-Type: text/plain; charset=utf-8\r\n\
\r\n\
plain body\r\n\
--b1\r\n\
Content-Type: text/html; charset=utf-8\r\n\
\r\n\
<p>html body</p>\r\n\
--b1--\r\n";

        let parsed = parse_message(raw).expect("parse");
        assert_eq!(parsed.message_id, "abc@example.com");
        assert_eq!(parsed.thread_id, "root@example.com");
        assert_eq!(parsed.subject, "Hello there");
        assert_eq!(parsed.from_address, "alice@example.com");
        assert_eq!(parsed.from_name.as_deref(), Some("Alice Example"));
        assert_eq!(parsed.to, vec!["bob@example.com", "carol@example.com"]);
        assert_eq!(parsed.cc, vec!["dave@example.com"]);
        assert_eq!(parsed.reply_to, vec!["replies@example.com"]);
        assert_eq!(parsed.sent_at, 1_751_364_000);
        assert!(parsed.important);
        assert_eq!(parsed.body_text.as_deref().map(str::trim), Some("plain body"));
        assert_eq!(
            parsed.body_html.as_deref().map(str::trim),
            Some("<p>html body</p>")
        );
        assert!(parsed.attachments.is_empty());
    }

    #[test]
    fn missing_message_id_is_an_error() {
        let raw = b"From: a@example.com\r\nSubject: hi\r\n\r\nbody";
        assert!(matches!(
            parse_message(raw),
            Err(ParseError::MissingMessageId)
        ));
    }

    #[test]
    fn unparsable_date_defaults_to_now() {
        for date in ["not a date", "garbage"] {
            let raw = format!("Message-ID: <d@example.com>\r\nDate: {}\r\n\r\nbody", date);
            let before = chrono::Utc::now().timestamp();
            let parsed = parse_message(raw.as_bytes()).expect("parse");
            assert!(parsed.sent_at >= before, "date {:?} gave {}", date, parsed.sent_at);
            assert_eq!(parsed.thread_id, "d@example.com");
        }
    }

    #[test]
    fn collects_attachments_and_skips_them_as_body() {
        let raw = b"Message-ID: <att@example.com>\r\n\
From: a@example.com\r\n\
Content-Type: multipart/mixed; boundary=\"m\"\r\n\
\r\n\
--m\r\n\
Content-Type: text/plain\r\n\
\r\n\
see attached\r\n\
--m\r\n\
Content-Type: text/plain; name=\"notes.txt\"\r\n\
Content-Disposition: attachment; filename=\"notes.txt\"\r\n\
\r\n\
not the body\r\n\
--m\r\n\
Content-Type: text/calendar\r\n\
Content-Disposition: attachment; filename=\"invite.ics\"\r\n\
Content-Transfer-Encoding: base64\r\n\
\r\n\
QkVHSU46VkNBTEVOREFS\r\n\
--m--\r\n";

        let parsed = parse_message(raw).expect("parse");
        assert_eq!(parsed.body_text.as_deref().map(str::trim), Some("see attached"));
        assert_eq!(parsed.attachments.len(), 2);

        let notes = &parsed.attachments[0];
        assert_eq!(notes.filename, "notes.txt");
        assert!(!notes.calendar_invite);

        let invite = &parsed.attachments[1];
        assert!(invite.calendar_invite);
        assert_eq!(invite.size, "BEGIN:VCALENDAR".len());
        assert_eq!(
            invite.content,
            AttachmentContent::Inline(b"BEGIN:VCALENDAR".to_vec())
        );
    }

    #[test]
    fn large_attachment_keeps_only_a_reference() {
        let payload = BASE64_STD.encode(vec![b'x'; INLINE_ATTACHMENT_LIMIT + 10]);
        let raw = format!(
            "Message-ID: <big@example.com>\r\n\
Content-Type: multipart/mixed; boundary=\"m\"\r\n\
\r\n\
--m\r\n\
Content-Type: text/plain\r\n\
\r\n\
body\r\n\
--m\r\n\
Content-Type: application/octet-stream\r\n\
Content-Disposition: attachment; filename=\"big.bin\"\r\n\
Content-Transfer-Encoding: base64\r\n\
\r\n\
{}\r\n\
--m--\r\n",
            payload
        );

        let parsed = parse_message(raw.as_bytes()).expect("parse");
        let big = &parsed.attachments[0];
        assert_eq!(big.size, INLINE_ATTACHMENT_LIMIT + 10);
        assert_eq!(
            big.content,
            AttachmentContent::External("mime-part:big@example.com/1".to_string())
        );
    }

    #[test]
    fn message_id_from_header_probe() {
        let raw = b"Message-ID:   <probe@example.com>  \r\n\r\n";
        assert_eq!(
            message_id_from_headers(raw).as_deref(),
            Some("probe@example.com")
        );
        assert_eq!(message_id_from_headers(b"Subject: none\r\n\r\n"), None);
    }
}
