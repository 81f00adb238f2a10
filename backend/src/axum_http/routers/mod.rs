pub mod admin_subscriptions;
pub mod mpesa_callback;
pub mod subscriptions;
