pub mod enums;
pub mod mpesa_callback;
pub mod phone_numbers;
pub mod plans;
pub mod subscriptions;
