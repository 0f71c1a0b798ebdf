//! SMTP client holding one authenticated implicit-TLS session.
//!
//! The session is probed with NOOP before each send and redialed when the
//! probe fails. A failed transaction is retried on a fixed delay until the
//! caller's deadline.

use super::EmailSender;
use crate::error::{NotificationError, NotificationResult};
use amqp_worker::Attempts;
use async_trait::async_trait;
use core_config::{ConfigError, FromEnv, env_duration_secs, env_required, env_required_parse};
use lettre::Address;
use lettre::address::Envelope;
use lettre::transport::smtp::authentication::{Credentials, Mechanism};
use lettre::transport::smtp::client::{AsyncSmtpConnection, TlsParameters};
use lettre::transport::smtp::commands::Rset;
use lettre::transport::smtp::extension::ClientId;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, info, warn};

/// SMTP configuration.
#[derive(Debug, Clone)]
pub struct SmtpConfig {
    /// SMTP server host (also the TLS server name).
    pub host: String,
    /// Implicit TLS port, usually 465.
    pub port: u16,
    pub username: String,
    pub password: String,
    /// Envelope sender address.
    pub from: String,
    /// Pause between transaction attempts.
    pub retry_delay: Duration,
    /// Socket timeout for each SMTP command.
    pub command_timeout: Duration,
}

impl SmtpConfig {
    pub fn new(
        host: impl Into<String>,
        port: u16,
        username: impl Into<String>,
        password: impl Into<String>,
        from: impl Into<String>,
    ) -> Self {
        Self {
            host: host.into(),
            port,
            username: username.into(),
            password: password.into(),
            from: from.into(),
            retry_delay: Duration::from_secs(30),
            command_timeout: Duration::from_secs(30),
        }
    }

    /// Builder method to set the retry delay.
    pub fn with_retry_delay(mut self, delay: Duration) -> Self {
        self.retry_delay = delay;
        self
    }
}

impl FromEnv for SmtpConfig {
    fn from_env() -> Result<Self, ConfigError> {
        Ok(Self::new(
            env_required("SMTP_HOST")?,
            env_required_parse("SMTP_PORT")?,
            env_required("SMTP_USERNAME")?,
            env_required("SMTP_PASSWORD")?,
            env_required("SMTP_FROM")?,
        )
        .with_retry_delay(env_duration_secs(
            "SMTP_RETRY_DELAY_SECS",
            Duration::from_secs(30),
        )?))
    }
}

pub struct SmtpClient {
    config: SmtpConfig,
    from: Address,
    connection: Option<AsyncSmtpConnection>,
}

impl SmtpClient {
    /// Create a client without dialing. The first send opens the session.
    pub fn new(config: SmtpConfig) -> NotificationResult<Self> {
        let from: Address = config.from.parse()?;
        Ok(Self {
            config,
            from,
            connection: None,
        })
    }

    /// Create a client and open its session, retrying within `window`.
    pub async fn connect(config: SmtpConfig, window: Duration) -> NotificationResult<Self> {
        let mut client = Self::new(config)?;
        let mut attempts = Attempts::within(window, client.config.retry_delay);
        let mut last_error = None;

        while attempts.next().await {
            match client.dial().await {
                Ok(connection) => {
                    client.connection = Some(connection);
                    return Ok(client);
                }
                Err(e) => {
                    warn!(
                        host = %client.config.host,
                        attempt = attempts.attempt(),
                        error = %e,
                        "SMTP connect failed"
                    );
                    last_error = Some(e);
                }
            }
        }

        Err(last_error.unwrap_or(NotificationError::Timeout(window)))
    }

    pub fn is_connected(&self) -> bool {
        self.connection.is_some()
    }

    async fn dial(&self) -> NotificationResult<AsyncSmtpConnection> {
        let tls = TlsParameters::new(self.config.host.clone())?;
        let mut connection = AsyncSmtpConnection::connect_tokio1(
            (self.config.host.as_str(), self.config.port),
            Some(self.config.command_timeout),
            &ClientId::default(),
            Some(tls),
            None,
        )
        .await?;

        let credentials = Credentials::new(self.config.username.clone(), self.config.password.clone());
        connection.auth(&[Mechanism::Plain], &credentials).await?;

        info!(host = %self.config.host, port = self.config.port, "SMTP session established");
        Ok(connection)
    }

    /// Return a live session, redialing when NOOP fails.
    async fn ensure_connected(&mut self) -> NotificationResult<&mut AsyncSmtpConnection> {
        let alive = match self.connection.as_mut() {
            Some(connection) => connection.test_connected().await,
            None => false,
        };

        if !alive {
            if let Some(mut stale) = self.connection.take() {
                debug!(host = %self.config.host, "SMTP session lost, reconnecting");
                stale.abort().await;
            }
            self.connection = Some(self.dial().await?);
        }

        self.connection
            .as_mut()
            .ok_or_else(|| NotificationError::Smtp("no SMTP session".to_string()))
    }

    /// One MAIL/RCPT/DATA transaction followed by RSET.
    async fn transaction(&mut self, envelope: &Envelope, email: &[u8]) -> NotificationResult<()> {
        let connection = self.ensure_connected().await?;

        match connection.send(envelope, email).await {
            Ok(_) => {
                // The message is already accepted; a failed RSET only costs the session.
                if let Err(e) = connection.command(Rset).await {
                    warn!(error = %e, "SMTP RSET failed after send, dropping session");
                    self.connection = None;
                }
                Ok(())
            }
            Err(e) => {
                if connection.command(Rset).await.is_err() {
                    self.connection = None;
                }
                Err(e.into())
            }
        }
    }

    /// Close the session with QUIT.
    pub async fn quit(&mut self) {
        if let Some(mut connection) = self.connection.take() {
            if let Err(e) = connection.quit().await {
                debug!(error = %e, "SMTP QUIT failed");
            }
            info!(host = %self.config.host, "SMTP session closed");
        }
    }
}

#[async_trait]
impl EmailSender for SmtpClient {
    async fn send_email(
        &mut self,
        recipient: &str,
        email: &[u8],
        deadline: Instant,
    ) -> NotificationResult<()> {
        let to: Address = recipient.parse()?;
        let envelope = Envelope::new(Some(self.from.clone()), vec![to])?;

        let mut attempts = Attempts::until(deadline, self.config.retry_delay);
        let mut last_error = None;

        while attempts.next().await {
            let remaining = attempts.remaining();
            if remaining.is_zero() {
                break;
            }

            match tokio::time::timeout(remaining, self.transaction(&envelope, email)).await {
                Ok(Ok(())) => {
                    debug!(recipient = %recipient, attempt = attempts.attempt(), "SMTP transaction complete");
                    return Ok(());
                }
                Ok(Err(e)) => {
                    warn!(
                        recipient = %recipient,
                        attempt = attempts.attempt(),
                        error = %e,
                        "SMTP send failed"
                    );
                    last_error = Some(e);
                }
                Err(_) => {
                    self.connection = None;
                    last_error = Some(NotificationError::Timeout(remaining));
                }
            }
        }

        Err(last_error.unwrap_or_else(|| {
            NotificationError::Smtp(format!("send window closed before sending to {}", recipient))
        }))
    }

    async fn quit(&mut self) {
        SmtpClient::quit(self).await;
    }
}
