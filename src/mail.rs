//! Transactional email: welcome, invitation and resend-invitation messages
//! over a pooled SMTP connection.

use lettre::message::header::ContentType;
use lettre::transport::smtp::authentication::Credentials;
use lettre::{AsyncSmtpTransport, AsyncTransport, Message, Tokio1Executor};
use tracing::{debug, info};

use crate::config::SmtpConfig;
use crate::error::{AppError, AppResult};

/// Sends transactional mail. When no SMTP block is configured the mailer is
/// disabled and sends become logged no-ops, so the service still runs in
/// development.
#[derive(Clone)]
pub struct Mailer {
    transport: Option<AsyncSmtpTransport<Tokio1Executor>>,
    from: String,
    base_url: String,
}

impl Mailer {
    pub fn new(smtp: Option<&SmtpConfig>, base_url: String) -> AppResult<Self> {
        let (transport, from) = match smtp {
            None => (None, String::new()),
            Some(cfg) => {
                let creds = Credentials::new(cfg.username.clone(), cfg.password.clone());
                let transport = AsyncSmtpTransport::<Tokio1Executor>::starttls_relay(&cfg.host)
                    .map_err(|e| AppError::Mail(e.to_string()))?
                    .port(cfg.port)
                    .credentials(creds)
                    .build();
                info!(host = %cfg.host, port = cfg.port, "smtp transport ready");
                (Some(transport), cfg.from.clone())
            }
        };
        Ok(Self {
            transport,
            from,
            base_url,
        })
    }

    pub async fn send_welcome(&self, to: &str, name: &str) -> AppResult<()> {
        let body = format!(
            "Hi {name},\n\n\
             Welcome to FairShare! Your shared expenses and balances are\n\
             waiting for you at {base}.\n",
            base = self.base_url,
        );
        self.send(to, "Welcome to FairShare", body).await
    }

    pub async fn send_invitation(
        &self,
        to: &str,
        inviter_name: &str,
        friend_id: &str,
        token: &str,
    ) -> AppResult<()> {
        let link = join_link(&self.base_url, friend_id, to, token);
        let body = format!(
            "Hi,\n\n\
             {inviter_name} is tracking shared expenses with you on FairShare.\n\
             Join them here: {link}\n",
        );
        self.send(to, "You have been invited to FairShare", body)
            .await
    }

    async fn send(&self, to: &str, subject: &str, body: String) -> AppResult<()> {
        let Some(transport) = &self.transport else {
            debug!(to, subject, "mail disabled, skipping send");
            return Ok(());
        };

        let message = Message::builder()
            .from(
                self.from
                    .parse()
                    .map_err(|e| AppError::Mail(format!("from address: {e}")))?,
            )
            .to(to
                .parse()
                .map_err(|e| AppError::Mail(format!("to address '{to}': {e}")))?)
            .subject(subject)
            .header(ContentType::TEXT_PLAIN)
            .body(body)
            .map_err(|e| AppError::Mail(e.to_string()))?;

        transport
            .send(message)
            .await
            .map_err(|e| AppError::Mail(e.to_string()))?;
        info!(to, subject, "email sent");
        Ok(())
    }
}

/// The invitation link carries everything the join endpoint needs to
/// recompute and check the token.
pub fn join_link(base_url: &str, friend_id: &str, email: &str, token: &str) -> String {
    format!("{base_url}/join?friend={friend_id}&email={email}&token={token}")
}
