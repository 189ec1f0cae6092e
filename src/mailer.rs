//! Delivery of a queued email
//!
//! [`SmtpMailer`] hands messages to an SMTP relay. [`LogMailer`] only writes
//! them to the log and is meant for local runs without a relay.
use super::email::SendEmailArgs;
use async_trait::async_trait;
use lettre::message::{Mailbox, header::ContentType};
use lettre::transport::smtp::authentication::Credentials;
use lettre::{AsyncSmtpTransport, AsyncTransport, Message, Tokio1Executor};
use tracing::{debug, info};

#[async_trait]
pub trait Mailer: Send + Sync {
    /// Delivers `email`. Returning [`Undeliverable`] tells the worker that
    /// trying again cannot succeed.
    async fn send(&self, email: &SendEmailArgs) -> anyhow::Result<()>;
}

/// A delivery failure that retrying will not fix.
#[derive(thiserror::Error, Debug)]
#[error("undeliverable: {0}")]
pub struct Undeliverable(pub String);

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SmtpSettings {
    pub host: String,
    pub port: u16,
    /// User name and password for PLAIN/LOGIN auth.
    pub credentials: Option<(String, String)>,
}

/// Sends over SMTP with STARTTLS.
pub struct SmtpMailer {
    transport: AsyncSmtpTransport<Tokio1Executor>,
}

impl SmtpMailer {
    pub fn new(settings: &SmtpSettings) -> anyhow::Result<Self> {
        let mut builder = AsyncSmtpTransport::<Tokio1Executor>::starttls_relay(&settings.host)?
            .port(settings.port);
        if let Some((user, pass)) = &settings.credentials {
            builder = builder.credentials(Credentials::new(user.clone(), pass.clone()));
        }

        Ok(Self {
            transport: builder.build(),
        })
    }
}

#[async_trait]
impl Mailer for SmtpMailer {
    async fn send(&self, email: &SendEmailArgs) -> anyhow::Result<()> {
        let message = build_message(email)?;

        match self.transport.send(message).await {
            Ok(_) => {
                debug!(recipient = %email.email_recipient, "relay accepted email");
                Ok(())
            }
            Err(err) if err.is_permanent() => Err(Undeliverable(err.to_string()).into()),
            Err(err) => Err(err.into()),
        }
    }
}

/// Builds the MIME message. Addresses that do not parse are undeliverable.
pub fn build_message(email: &SendEmailArgs) -> anyhow::Result<Message> {
    let from: Mailbox = email
        .email_sender
        .parse()
        .map_err(|e| Undeliverable(format!("email_sender: {e}")))?;
    let to: Mailbox = email
        .email_recipient
        .parse()
        .map_err(|e| Undeliverable(format!("email_recipient: {e}")))?;

    let message = Message::builder()
        .from(from)
        .to(to)
        .subject(email.subject.clone())
        .header(ContentType::TEXT_PLAIN)
        .body(email.body.clone())?;

    Ok(message)
}

/// Renders the message and writes it to the log instead of a mail server.
pub struct LogMailer;

#[async_trait]
impl Mailer for LogMailer {
    async fn send(&self, email: &SendEmailArgs) -> anyhow::Result<()> {
        let message = render_message(email);
        info!(
            recipient = %email.email_recipient,
            sender = %email.email_sender,
            bytes = message.len(),
            "delivering email"
        );
        debug!(%message);
        Ok(())
    }
}

pub fn render_message(email: &SendEmailArgs) -> String {
    format!(
        "To: {}\r\nFrom: {}\r\nSubject: {}\r\n\r\n{}\r\n",
        email.email_recipient, email.email_sender, email.subject, email.body
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use uuid::Uuid;

    fn email() -> SendEmailArgs {
        SendEmailArgs {
            account_id: Uuid::new_v4(),
            body: "Hello".into(),
            email_recipient: "r@example.com".into(),
            email_sender: "s@example.com".into(),
            idempotency_key: Uuid::new_v4(),
            subject: "Hi".into(),
        }
    }

    #[test]
    fn renders_headers_then_body() {
        assert_eq!(
            render_message(&email()),
            "To: r@example.com\r\nFrom: s@example.com\r\nSubject: Hi\r\n\r\nHello\r\n"
        );
    }

    #[test]
    fn builds_mime_message_from_payload() {
        let message = build_message(&email()).unwrap();
        let formatted = String::from_utf8(message.formatted()).unwrap();

        assert!(formatted.contains("From: s@example.com\r\n"), "{formatted}");
        assert!(formatted.contains("To: r@example.com\r\n"), "{formatted}");
        assert!(formatted.contains("Subject: Hi\r\n"), "{formatted}");
        assert!(formatted.contains("\r\n\r\nHello"), "{formatted}");
    }

    #[test]
    fn local_addresses_are_deliverable() {
        let local = SendEmailArgs {
            email_recipient: "root@localhost".into(),
            ..email()
        };

        assert!(build_message(&local).is_ok());
    }

    #[test]
    fn unparseable_address_is_undeliverable() {
        let broken = SendEmailArgs {
            email_recipient: "nobody".into(),
            ..email()
        };

        let err = build_message(&broken).unwrap_err();

        assert!(err.is::<Undeliverable>(), "{err:#}");
        assert!(err.to_string().contains("email_recipient"));
    }

    #[tokio::test]
    async fn log_mailer_always_succeeds() {
        assert!(LogMailer.send(&email()).await.is_ok());
    }
}
