//! Environment-driven configuration.

use std::env;

use crate::error::{AppError, AppResult};

#[derive(Clone, Debug)]
pub struct SmtpConfig {
    pub host: String,
    pub port: u16,
    pub username: String,
    pub password: String,
    pub from: String,
}

#[derive(Clone, Debug)]
pub struct Config {
    pub mongodb_uri: String,
    pub database: String,
    pub bind_addr: String,
    /// Server secret for invitation tokens.
    pub invite_secret: String,
    /// Public base URL used in email bodies.
    pub base_url: String,
    pub smtp: Option<SmtpConfig>,
}

impl Config {
    /// Required: `MONGODB_URI`, `INVITE_SECRET`. The SMTP block is read only
    /// when `SMTP_HOST` is set; mail is disabled otherwise.
    pub fn from_env() -> AppResult<Self> {
        let mongodb_uri = require("MONGODB_URI")?;
        let invite_secret = require("INVITE_SECRET")?;
        let database = env::var("FAIRSHARE_DB").unwrap_or_else(|_| "fairshare".to_string());
        let bind_addr = env::var("BIND_ADDR").unwrap_or_else(|_| "0.0.0.0:8080".to_string());
        let base_url =
            env::var("APP_BASE_URL").unwrap_or_else(|_| "https://fairshare.app".to_string());

        let smtp = match env::var("SMTP_HOST") {
            Err(_) => None,
            Ok(host) => {
                let port = env::var("SMTP_PORT")
                    .unwrap_or_else(|_| "587".to_string())
                    .parse::<u16>()
                    .map_err(|e| AppError::Config(format!("invalid SMTP_PORT: {e}")))?;
                let username = require("SMTP_USERNAME")?;
                let password = require("SMTP_PASSWORD")?;
                let from = env::var("MAIL_FROM").unwrap_or_else(|_| username.clone());
                Some(SmtpConfig {
                    host,
                    port,
                    username,
                    password,
                    from,
                })
            }
        };

        Ok(Self {
            mongodb_uri,
            database,
            bind_addr,
            invite_secret,
            base_url,
            smtp,
        })
    }
}

fn require(name: &'static str) -> AppResult<String> {
    env::var(name).map_err(|_| AppError::Config(format!("{name} must be set")))
}
