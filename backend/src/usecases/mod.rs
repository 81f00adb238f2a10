pub mod entitlements;
pub mod payment_callbacks;
pub mod subscription_admin;
pub mod subscriptions;
