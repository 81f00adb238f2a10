pub mod app_users;
pub mod plans;
pub mod subscriptions;
