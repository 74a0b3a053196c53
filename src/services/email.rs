use anyhow::Context;
use lettre::{
    message::{header::ContentType, Mailbox},
    transport::smtp::authentication::Credentials,
    AsyncSmtpTransport, AsyncTransport, Message, Tokio1Executor,
};
use uuid::Uuid;

use crate::config::Config;

#[derive(Clone)]
pub struct EmailService {
    transport: AsyncSmtpTransport<Tokio1Executor>,
    from: Mailbox,
}

impl EmailService {
    /// Returns None if SMTP is not fully configured.
    pub fn new(config: &Config) -> Option<Self> {
        let host = config.smtp_host.as_deref()?;
        let username = config.smtp_username.clone()?;
        let password = config.smtp_password.clone()?;
        let from_addr = config.smtp_from.as_deref()?;

        let port = config.smtp_port.unwrap_or(587);
        let creds = Credentials::new(username, password);

        let transport = if port == 465 {
            AsyncSmtpTransport::<Tokio1Executor>::relay(host)
                .ok()?
                .credentials(creds)
                .build()
        } else {
            AsyncSmtpTransport::<Tokio1Executor>::starttls_relay(host)
                .ok()?
                .port(port)
                .credentials(creds)
                .build()
        };

        let from: Mailbox = from_addr.parse().ok()?;

        Some(Self { transport, from })
    }

    fn new_message_id(&self) -> String {
        format!("<{}@{}>", Uuid::new_v4(), self.from.email.domain())
    }

    async fn send_text(&self, to: Mailbox, subject: &str, text: &str) -> anyhow::Result<()> {
        let email = Message::builder()
            .message_id(Some(self.new_message_id()))
            .from(self.from.clone())
            .to(to)
            .subject(subject)
            .header(ContentType::TEXT_PLAIN)
            .body(text.to_string())
            .context("Failed to build email message")?;

        self.transport
            .send(email)
            .await
            .context("Failed to send email")?;

        Ok(())
    }

    pub async fn send_password_reset(
        &self,
        to_email: &str,
        site_slug: &str,
        reset_url: &str,
    ) -> anyhow::Result<()> {
        let to: Mailbox = to_email
            .parse()
            .with_context(|| format!("invalid recipient address: {to_email}"))?;
        let site = if site_slug.is_empty() { "sua conta" } else { site_slug };

        let subject = format!("Redefinição de senha: {site}");
        let text = format!(
            "Olá,\n\n\
            Recebemos um pedido para redefinir a senha de {site}.\n\n\
            Use este link em até 30 minutos:\n\
            {reset_url}\n\n\
            Se você não fez este pedido, ignore este email."
        );

        self.send_text(to, &subject, &text).await
    }

    /// Operator digest of sites past their grace period. Sent to the
    /// configured sender address.
    pub async fn send_lapsed_report(&self, lapsed: &[String], blocked: &[String]) -> anyhow::Result<()> {
        let subject = format!("{} site(s) com pagamento vencido", lapsed.len());
        let mut text = String::from("Sites fora do período de carência:\n\n");
        for slug in lapsed {
            let mark = if blocked.contains(slug) { " (bloqueado)" } else { "" };
            text.push_str(&format!("- {slug}{mark}\n"));
        }
        self.send_text(self.from.clone(), &subject, &text).await
    }
}
