use crates::payments::mpesa_client::MpesaConfig;

#[derive(Debug, Clone)]
pub struct DotEnvyConfig {
    pub backend_server: BackendServer,
    pub database: Database,
    pub mpesa: MpesaConfig,
    pub subscriptions: SubscriptionSettings,
}

#[derive(Debug, Clone)]
pub struct BackendServer {
    pub port: u16,
    pub body_limit: u64,
    pub timeout: u64,
}

#[derive(Debug, Clone)]
pub struct Database {
    pub url: String,
}

#[derive(Debug, Clone)]
pub struct SubscriptionSettings {
    /// Used when a subscribe request carries no phone.
    pub fallback_phone: Option<String>,
    pub stale_pending_minutes: i64,
}

#[derive(Debug, Clone)]
pub struct JwtSecret {
    pub secret: String,
}
