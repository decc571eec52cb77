//! SMTP email channel
//!
//! Transports are built per send from the stored notification settings:
//! STARTTLS on the submission port, or implicit TLS when the operator
//! disabled STARTTLS (typically port 465).

use lettre::message::header::ContentType;
use lettre::transport::smtp::authentication::Credentials;
use lettre::{AsyncSmtpTransport, AsyncTransport, Message, Tokio1Executor};
use zfsync_common::{Error, NotificationSettings, Result};

pub struct EmailService;

impl EmailService {
    /// Send an HTML email to every configured recipient.
    pub async fn send(settings: &NotificationSettings, subject: &str, html_body: &str) -> Result<()> {
        let host = settings
            .smtp_host
            .as_deref()
            .ok_or_else(|| Error::BadRequest("SMTP server not configured".to_string()))?;

        let from = settings
            .smtp_from
            .as_deref()
            .or(settings.smtp_user.as_deref())
            .ok_or_else(|| Error::BadRequest("SMTP sender not configured".to_string()))?;

        let recipients: Vec<&str> = settings
            .smtp_to
            .as_deref()
            .unwrap_or("")
            .split(',')
            .map(|s| s.trim())
            .filter(|s| !s.is_empty())
            .collect();

        if recipients.is_empty() {
            return Err(Error::BadRequest("No recipients configured".to_string()));
        }

        let mailer = build_transport(settings, host)?;
        let full_subject = format!("{} {}", settings.smtp_subject_prefix, subject);

        for recipient in recipients {
            let email = Message::builder()
                .from(from
                    .parse()
                    .map_err(|e| Error::BadRequest(format!("Invalid from address: {}", e)))?)
                .to(recipient
                    .parse()
                    .map_err(|e| Error::BadRequest(format!("Invalid recipient '{}': {}", recipient, e)))?)
                .subject(&full_subject)
                .header(ContentType::TEXT_HTML)
                .body(html_body.to_string())
                .map_err(|e| Error::Internal(format!("Failed to build email: {}", e)))?;

            mailer
                .send(email)
                .await
                .map_err(|e| Error::Internal(format!("Failed to send email to {}: {}", recipient, e)))?;

            tracing::info!("Email sent to {}: {}", recipient, subject);
        }

        Ok(())
    }
}

fn build_transport(
    settings: &NotificationSettings,
    host: &str,
) -> Result<AsyncSmtpTransport<Tokio1Executor>> {
    let mut builder = if settings.smtp_tls {
        AsyncSmtpTransport::<Tokio1Executor>::starttls_relay(host)
            .map_err(|e| Error::Internal(format!("SMTP connection setup failed: {}", e)))?
    } else {
        AsyncSmtpTransport::<Tokio1Executor>::relay(host)
            .map_err(|e| Error::Internal(format!("SMTP connection setup failed: {}", e)))?
    };

    builder = builder.port(settings.smtp_port);

    if let (Some(user), Some(password)) = (&settings.smtp_user, &settings.smtp_password) {
        builder = builder.credentials(Credentials::new(user.clone(), password.clone()));
    }

    Ok(builder.build())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn settings() -> NotificationSettings {
        NotificationSettings {
            smtp_enabled: true,
            smtp_host: Some("mail.example.com".to_string()),
            smtp_port: 587,
            smtp_user: Some("zfsync@example.com".to_string()),
            smtp_password: Some("secret".to_string()),
            smtp_from: None,
            smtp_to: Some("ops@example.com, backup@example.com".to_string()),
            smtp_subject_prefix: "[zfsync]".to_string(),
            smtp_tls: true,
            ..NotificationSettings::default()
        }
    }

    #[tokio::test]
    async fn test_send_requires_host() {
        let mut s = settings();
        s.smtp_host = None;
        let err = EmailService::send(&s, "subject", "<p>body</p>").await.unwrap_err();
        assert!(matches!(err, Error::BadRequest(_)));
    }

    #[tokio::test]
    async fn test_send_requires_recipients() {
        let mut s = settings();
        s.smtp_to = Some("  ,  ".to_string());
        let err = EmailService::send(&s, "subject", "<p>body</p>").await.unwrap_err();
        assert!(matches!(err, Error::BadRequest(_)));
    }

    #[test]
    fn test_transport_builds_for_both_tls_modes() {
        assert!(build_transport(&settings(), "mail.example.com").is_ok());

        let mut implicit = settings();
        implicit.smtp_tls = false;
        implicit.smtp_port = 465;
        assert!(build_transport(&implicit, "mail.example.com").is_ok());
    }
}
