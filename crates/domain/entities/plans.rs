use chrono::{DateTime, Duration, Utc};
use diesel::prelude::*;
use uuid::Uuid;

use crate::infra::db::postgres::schema::subscription_plans;

#[derive(Debug, Clone, PartialEq, Identifiable, Selectable, Queryable)]
#[diesel(table_name = subscription_plans)]
pub struct PlanEntity {
    pub id: Uuid,
    pub name: String,
    pub description: Option<String>,
    pub price_minor: i32,
    pub duration_days: i32,
    pub is_active: bool,
    pub created_at: DateTime<Utc>,
}

impl PlanEntity {
    /// End of a subscription period that starts at `starts_at`.
    pub fn expiry_from(&self, starts_at: DateTime<Utc>) -> Option<DateTime<Utc>> {
        let duration = Duration::try_days(i64::from(self.duration_days))?;
        starts_at.checked_add_signed(duration)
    }
}
