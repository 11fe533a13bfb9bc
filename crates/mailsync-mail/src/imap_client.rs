use std::io::{Read, Write};
use std::net::{TcpStream, ToSocketAddrs};
use std::time::Duration;

use chrono::{Datelike, NaiveDate};
use native_tls::TlsConnector;
use secrecy::ExposeSecret;

use crate::MailError;
use crate::transport::{
    Credentials, HeaderProbe, ImapAttempt, ImapConnector, ImapSecurity, ImapSession,
};

/// Live IMAP connector over `std::net` with native-tls.
#[derive(Debug, Default, Clone)]
pub struct NativeImapConnector;

impl ImapConnector for NativeImapConnector {
    fn connect(
        &self,
        attempt: &ImapAttempt,
        credentials: &Credentials,
        timeout: Duration,
    ) -> Result<Box<dyn ImapSession>, MailError> {
        tracing::debug!(host = %attempt.host, port = attempt.port, security = ?attempt.security, "imap connect");
        let tcp = open_tcp(&attempt.host, attempt.port, timeout)?;
        match attempt.security {
            ImapSecurity::ImplicitTls => {
                let tls = TlsConnector::builder()
                    .build()
                    .map_err(|e| MailError::Transport(format!("tls setup failed: {}", e)))?;
                let stream = tls.connect(&attempt.host, tcp).map_err(|e| {
                    MailError::Transport(format!("tls handshake with {} failed: {}", attempt.host, e))
                })?;
                Ok(Box::new(login(stream, credentials)?))
            }
            ImapSecurity::Plaintext => Ok(Box::new(login(tcp, credentials)?)),
        }
    }
}

fn open_tcp(host: &str, port: u16, timeout: Duration) -> Result<TcpStream, MailError> {
    let addrs = (host, port)
        .to_socket_addrs()
        .map_err(|e| MailError::Transport(format!("resolve {}:{} failed: {}", host, port, e)))?;
    let mut last_err = None;
    for addr in addrs {
        match TcpStream::connect_timeout(&addr, timeout) {
            Ok(stream) => {
                stream.set_read_timeout(Some(timeout))?;
                stream.set_write_timeout(Some(timeout))?;
                return Ok(stream);
            }
            Err(err) => last_err = Some(err),
        }
    }
    Err(MailError::Transport(match last_err {
        Some(err) => format!("connect {}:{} failed: {}", host, port, err),
        None => format!("no addresses for {}:{}", host, port),
    }))
}

fn login<T>(stream: T, credentials: &Credentials) -> Result<NativeImapSession<T>, MailError>
where
    T: Read + Write + Send + 'static,
{
    let mut client = imap::Client::new(stream);
    client.read_greeting()?;
    let session = client
        .login(&credentials.username, credentials.secret.expose_secret())
        .map_err(|(err, _)| match err {
            imap::Error::Io(io) => MailError::Transport(io.to_string()),
            imap::Error::ConnectionLost => MailError::Transport("connection lost".to_string()),
            other => MailError::Authentication(other.to_string()),
        })?;
    tracing::debug!(username = %credentials.username, "imap login ok");
    Ok(NativeImapSession { session })
}

pub struct NativeImapSession<T: Read + Write> {
    session: imap::Session<T>,
}

impl<T> ImapSession for NativeImapSession<T>
where
    T: Read + Write + Send + 'static,
{
    fn select(&mut self, folder: &str) -> Result<u32, MailError> {
        let mailbox = self.session.select(folder)?;
        Ok(mailbox.exists)
    }

    fn search_since(&mut self, since: NaiveDate) -> Result<Vec<u32>, MailError> {
        let query = format!(
            "SINCE {}",
            imap_date_from_parts(since.year(), since.month(), since.day())
        );
        let mut uids: Vec<u32> = self.session.uid_search(&query)?.into_iter().collect();
        uids.sort_unstable();
        Ok(uids)
    }

    fn fetch_headers(&mut self, uids: &[u32]) -> Result<Vec<HeaderProbe>, MailError> {
        if uids.is_empty() {
            return Ok(Vec::new());
        }
        let fetches = self
            .session
            .uid_fetch(uid_set(uids), "(UID FLAGS BODY.PEEK[HEADER])")?;
        let mut probes = Vec::with_capacity(uids.len());
        for fetch in fetches.iter() {
            let Some(uid) = fetch.uid else {
                continue;
            };
            let flags = fetch.flags();
            probes.push(HeaderProbe {
                uid,
                header: fetch.header().unwrap_or(&[]).to_vec(),
                seen: flags.iter().any(|f| matches!(f, imap::types::Flag::Seen)),
                flagged: flags
                    .iter()
                    .any(|f| matches!(f, imap::types::Flag::Flagged)),
            });
        }
        Ok(probes)
    }

    fn fetch_message(&mut self, uid: u32) -> Result<Vec<u8>, MailError> {
        let fetches = self.session.uid_fetch(uid.to_string(), "BODY.PEEK[]")?;
        fetches
            .iter()
            .find_map(|fetch| fetch.body().map(|body| body.to_vec()))
            .ok_or_else(|| MailError::Protocol(format!("uid {} returned no body", uid)))
    }

    fn logout(&mut self) -> Result<(), MailError> {
        self.session.logout()?;
        Ok(())
    }
}

fn uid_set(uids: &[u32]) -> String {
    uids.iter()
        .map(|uid| uid.to_string())
        .collect::<Vec<_>>()
        .join(",")
}

fn imap_date_from_parts(year: i32, month: u32, day: u32) -> String {
    let month = match month {
        1 => "Jan",
        2 => "Feb",
        3 => "Mar",
        4 => "Apr",
        5 => "May",
        6 => "Jun",
        7 => "Jul",
        8 => "Aug",
        9 => "Sep",
        10 => "Oct",
        11 => "Nov",
        12 => "Dec",
        _ => "Jan",
    };
    format!("{}-{}-{}", day, month, year)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn search_date_uses_imap_format() {
        assert_eq!(imap_date_from_parts(2025, 3, 7), "7-Mar-2025");
        assert_eq!(imap_date_from_parts(2024, 12, 31), "31-Dec-2024");
    }

    #[test]
    fn uid_set_is_comma_separated() {
        assert_eq!(uid_set(&[3, 5, 8]), "3,5,8");
    }

    #[test]
    fn refused_connection_is_a_transport_error() {
        let attempt = ImapAttempt {
            host: "127.0.0.1".to_string(),
            port: 1,
            security: ImapSecurity::Plaintext,
        };
        let credentials = Credentials {
            username: "a@example.com".to_string(),
            secret: "pw".to_string().into(),
        };
        let result = NativeImapConnector.connect(&attempt, &credentials, Duration::from_secs(2));
        assert!(matches!(result, Err(err) if err.is_transport()));
    }
}
