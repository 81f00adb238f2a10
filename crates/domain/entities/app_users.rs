use chrono::{DateTime, Utc};
use diesel::prelude::*;
use uuid::Uuid;

use crate::infra::db::postgres::schema::users;

/// Entitlement columns of the user record. The rest of the user row belongs to
/// the account service.
#[derive(Debug, Clone, PartialEq, Identifiable, Selectable, Queryable)]
#[diesel(table_name = users)]
pub struct UserEntitlementEntity {
    pub id: Uuid,
    pub has_subscription: bool,
    pub subscription_expiry: Option<DateTime<Utc>>,
    pub last_payment_date: Option<DateTime<Utc>>,
}

impl UserEntitlementEntity {
    pub fn covers(&self, expires_at: DateTime<Utc>) -> bool {
        self.has_subscription
            && self
                .subscription_expiry
                .is_some_and(|stored| stored >= expires_at)
    }
}
