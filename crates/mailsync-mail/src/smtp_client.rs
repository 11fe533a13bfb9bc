use std::time::Duration;

use async_trait::async_trait;
use lettre::{
    AsyncSmtpTransport, AsyncTransport, Message, Tokio1Executor,
    transport::smtp::{
        authentication::Credentials as SmtpCredentials,
        client::{Tls, TlsParameters},
    },
};
use secrecy::ExposeSecret;

use crate::MailError;
use crate::transport::{Credentials, SmtpAttempt, SmtpConnector, SmtpSecurity};

/// Live SMTP connector backed by lettre's tokio transport.
#[derive(Debug, Default, Clone)]
pub struct LettreSmtpConnector;

fn build_transport(
    attempt: &SmtpAttempt,
    credentials: &Credentials,
    timeout: Duration,
) -> Result<AsyncSmtpTransport<Tokio1Executor>, MailError> {
    let tls = match attempt.security {
        SmtpSecurity::ImplicitTls => Tls::Wrapper(TlsParameters::new(attempt.host.clone())?),
        SmtpSecurity::StartTls => Tls::Required(TlsParameters::new(attempt.host.clone())?),
        SmtpSecurity::Plaintext => Tls::None,
    };
    let creds = SmtpCredentials::new(
        credentials.username.clone(),
        credentials.secret.expose_secret().to_string(),
    );
    Ok(
        AsyncSmtpTransport::<Tokio1Executor>::builder_dangerous(&attempt.host)
            .port(attempt.port)
            .tls(tls)
            .timeout(Some(timeout))
            .credentials(creds)
            .build(),
    )
}

#[async_trait]
impl SmtpConnector for LettreSmtpConnector {
    async fn probe(
        &self,
        attempt: &SmtpAttempt,
        credentials: &Credentials,
        timeout: Duration,
    ) -> Result<(), MailError> {
        tracing::debug!(%attempt, "smtp probe");
        let mailer = build_transport(attempt, credentials, timeout)?;
        let connected = tokio::time::timeout(timeout, mailer.test_connection())
            .await
            .map_err(|_| MailError::Timeout(timeout))??;
        if connected {
            Ok(())
        } else {
            Err(MailError::Transport(format!("{} did not respond", attempt)))
        }
    }

    async fn submit(
        &self,
        attempt: &SmtpAttempt,
        credentials: &Credentials,
        timeout: Duration,
        message: Message,
    ) -> Result<(), MailError> {
        tracing::debug!(%attempt, "smtp submit");
        let mailer = build_transport(attempt, credentials, timeout)?;
        let response = tokio::time::timeout(timeout, mailer.send(message))
            .await
            .map_err(|_| MailError::Timeout(timeout))??;
        tracing::debug!(code = %response.code(), "smtp accepted message");
        Ok(())
    }
}
