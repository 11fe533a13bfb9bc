//! Provider lookup for IMAP/SMTP connection parameters.

use serde::{Deserialize, Serialize};

use mailsync_core::{ImapSettings, ProviderKind, SENT_FOLDER_MARKER, SmtpSettings};

use crate::MailError;

/// Operator-supplied settings. Returned as-is by [`resolve_settings`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SettingsOverride {
    pub imap: ImapSettings,
    pub smtp: SmtpSettings,
    #[serde(default)]
    pub sent_folder: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ResolvedSettings {
    pub provider: ProviderKind,
    pub imap: ImapSettings,
    pub smtp: SmtpSettings,
    pub sent_folder: String,
}

struct ProviderEntry {
    kind: ProviderKind,
    domains: &'static [&'static str],
    imap: (&'static str, u16),
    smtp: (&'static str, u16, bool),
    sent_folder: &'static str,
}

const PROVIDERS: &[ProviderEntry] = &[
    ProviderEntry {
        kind: ProviderKind::Gmail,
        domains: &["gmail.com", "googlemail.com"],
        imap: ("imap.gmail.com", 993),
        smtp: ("smtp.gmail.com", 587, true),
        sent_folder: "[Gmail]/Sent Mail",
    },
    ProviderEntry {
        kind: ProviderKind::Outlook,
        domains: &["outlook.com", "hotmail.com", "live.com", "msn.com"],
        imap: ("outlook.office365.com", 993),
        smtp: ("smtp.office365.com", 587, true),
        sent_folder: "Sent Items",
    },
    ProviderEntry {
        kind: ProviderKind::Yahoo,
        domains: &["yahoo.com", "ymail.com", "rocketmail.com"],
        imap: ("imap.mail.yahoo.com", 993),
        smtp: ("smtp.mail.yahoo.com", 465, false),
        sent_folder: "Sent",
    },
];

pub fn address_domain(address: &str) -> Option<String> {
    let (_, domain) = address.trim().rsplit_once('@')?;
    let domain = domain.trim().trim_end_matches('>').to_lowercase();
    (!domain.is_empty()).then_some(domain)
}

/// Maps an address to connection settings. Pure; performs no I/O.
pub fn resolve_settings(
    address: &str,
    provider_hint: Option<ProviderKind>,
    overrides: Option<&SettingsOverride>,
) -> ResolvedSettings {
    let domain = address_domain(address).unwrap_or_default();
    let by_domain = PROVIDERS
        .iter()
        .find(|entry| entry.domains.contains(&domain.as_str()));
    let entry = by_domain.or_else(|| {
        provider_hint.and_then(|hint| PROVIDERS.iter().find(|entry| entry.kind == hint))
    });

    if let Some(overrides) = overrides {
        return ResolvedSettings {
            provider: provider_hint
                .or(by_domain.map(|entry| entry.kind))
                .unwrap_or(ProviderKind::Generic),
            imap: overrides.imap.clone(),
            smtp: overrides.smtp.clone(),
            sent_folder: overrides
                .sent_folder
                .clone()
                .or_else(|| entry.map(|entry| entry.sent_folder.to_string()))
                .unwrap_or_else(|| SENT_FOLDER_MARKER.to_string()),
        };
    }

    match entry {
        Some(entry) => ResolvedSettings {
            provider: entry.kind,
            imap: ImapSettings {
                host: entry.imap.0.to_string(),
                port: entry.imap.1,
                use_tls: true,
            },
            smtp: SmtpSettings {
                host: entry.smtp.0.to_string(),
                port: entry.smtp.1,
                use_starttls: entry.smtp.2,
            },
            sent_folder: entry.sent_folder.to_string(),
        },
        None => ResolvedSettings {
            provider: ProviderKind::Generic,
            imap: ImapSettings {
                host: format!("imap.{}", domain),
                port: 993,
                use_tls: true,
            },
            smtp: SmtpSettings {
                host: format!("smtp.{}", domain),
                port: 465,
                use_starttls: false,
            },
            sent_folder: SENT_FOLDER_MARKER.to_string(),
        },
    }
}

/// Rejects settings that cannot possibly connect, before any I/O happens.
pub fn validate_settings(address: &str, settings: &ResolvedSettings) -> Result<(), MailError> {
    if address_domain(address).is_none() {
        return Err(MailError::Config(format!(
            "address '{}' has no domain",
            address
        )));
    }
    if settings.imap.host.trim().is_empty() || settings.smtp.host.trim().is_empty() {
        return Err(MailError::Config("host must not be empty".to_string()));
    }
    if settings.imap.port == 0 || settings.smtp.port == 0 {
        return Err(MailError::Config("port must not be 0".to_string()));
    }
    if settings.sent_folder.trim().is_empty() {
        return Err(MailError::Config("sent folder must not be empty".to_string()));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn known_domain_uses_provider_table() {
        let resolved = resolve_settings("Someone@GMail.com", None, None);
        assert_eq!(resolved.provider, ProviderKind::Gmail);
        assert_eq!(resolved.imap.host, "imap.gmail.com");
        assert_eq!(resolved.smtp.port, 587);
        assert!(resolved.smtp.use_starttls);
        assert_eq!(resolved.sent_folder, "[Gmail]/Sent Mail");
    }

    #[test]
    fn unknown_domain_gets_generic_defaults() {
        let resolved = resolve_settings("a@example.com", None, None);
        assert_eq!(resolved.provider, ProviderKind::Generic);
        assert_eq!(
            resolved.imap,
            ImapSettings {
                host: "imap.example.com".to_string(),
                port: 993,
                use_tls: true
            }
        );
        assert_eq!(
            resolved.smtp,
            SmtpSettings {
                host: "smtp.example.com".to_string(),
                port: 465,
                use_starttls: false
            }
        );
    }

    #[test]
    fn hint_selects_provider_for_custom_domain() {
        let resolved = resolve_settings("me@company.io", Some(ProviderKind::Outlook), None);
        assert_eq!(resolved.provider, ProviderKind::Outlook);
        assert_eq!(resolved.imap.host, "outlook.office365.com");
    }

    #[test]
    fn overrides_are_returned_verbatim() {
        let overrides = SettingsOverride {
            imap: ImapSettings {
                host: "mail.internal".to_string(),
                port: 143,
                use_tls: false,
            },
            smtp: SmtpSettings {
                host: "relay.internal".to_string(),
                port: 25,
                use_starttls: false,
            },
            sent_folder: None,
        };
        let resolved = resolve_settings("a@gmail.com", None, Some(&overrides));
        assert_eq!(resolved.imap, overrides.imap);
        assert_eq!(resolved.smtp, overrides.smtp);
        assert_eq!(resolved.provider, ProviderKind::Gmail);
    }

    #[test]
    fn validation_rejects_unusable_settings() {
        let mut resolved = resolve_settings("a@example.com", None, None);
        assert!(validate_settings("a@example.com", &resolved).is_ok());
        assert!(matches!(
            validate_settings("no-domain", &resolved),
            Err(MailError::Config(_))
        ));

        resolved.smtp.port = 0;
        assert!(matches!(
            validate_settings("a@example.com", &resolved),
            Err(MailError::Config(_))
        ));
    }
}
