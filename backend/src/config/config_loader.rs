use std::time::Duration;

use anyhow::{Context, Result};
use crates::payments::mpesa_client::{MpesaConfig, MpesaEnvironment};

use super::config_model::{
    BackendServer, Database, DotEnvyConfig, JwtSecret, SubscriptionSettings,
};

const DEFAULT_SERVER_TIMEOUT_SECS: u64 = 10;
const DEFAULT_MPESA_TIMEOUT_SECS: u64 = 30;
const DEFAULT_STALE_PENDING_MINUTES: i64 = 15;

pub fn load() -> Result<DotEnvyConfig> {
    dotenvy::dotenv().ok();

    let backend_server = BackendServer {
        port: required("SERVER_PORT_BACKEND")?
            .parse()
            .context("SERVER_PORT_BACKEND is invalid")?,
        body_limit: required("SERVER_BODY_LIMIT")?
            .parse()
            .context("SERVER_BODY_LIMIT is invalid")?,
        timeout: optional_parsed("SERVER_TIMEOUT", DEFAULT_SERVER_TIMEOUT_SECS)?,
    };

    let database = Database {
        url: required("DATABASE_URL")?,
    };

    let mpesa = MpesaConfig {
        consumer_key: required("MPESA_CONSUMER_KEY")?,
        consumer_secret: required("MPESA_CONSUMER_SECRET")?,
        shortcode: required("MPESA_SHORTCODE")?,
        passkey: required("MPESA_PASSKEY")?,
        callback_url: required("MPESA_CALLBACK_URL")?,
        environment: MpesaEnvironment::from_setting(
            &std::env::var("MPESA_ENVIRONMENT").unwrap_or_default(),
        ),
        timeout: Duration::from_secs(optional_parsed(
            "MPESA_TIMEOUT",
            DEFAULT_MPESA_TIMEOUT_SECS,
        )?),
    };

    let subscriptions = SubscriptionSettings {
        fallback_phone: std::env::var("MPESA_FALLBACK_PHONE")
            .ok()
            .map(|phone| phone.trim().to_string())
            .filter(|phone| !phone.is_empty()),
        stale_pending_minutes: optional_parsed(
            "STALE_PENDING_MINUTES",
            DEFAULT_STALE_PENDING_MINUTES,
        )?,
    };

    Ok(DotEnvyConfig {
        backend_server,
        database,
        mpesa,
        subscriptions,
    })
}

pub fn get_jwt_secret() -> Result<JwtSecret> {
    dotenvy::dotenv().ok();

    Ok(JwtSecret {
        secret: required("JWT_SECRET")?,
    })
}

fn required(key: &str) -> Result<String> {
    std::env::var(key).with_context(|| format!("{key} is invalid"))
}

fn optional_parsed<T>(key: &str, default: T) -> Result<T>
where
    T: std::str::FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    match std::env::var(key) {
        Ok(raw) if !raw.trim().is_empty() => raw
            .trim()
            .parse()
            .with_context(|| format!("{key} is invalid")),
        _ => Ok(default),
    }
}
