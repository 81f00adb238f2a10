use anyhow::Result;
use async_trait::async_trait;
use mockall::automock;
use uuid::Uuid;

use crate::domain::entities::plans::PlanEntity;

#[automock]
#[async_trait]
pub trait PlanRepository {
    /// Active plans only; inactive plans cannot be purchased.
    async fn find_active_plan_by_id(&self, plan_id: Uuid) -> Result<Option<PlanEntity>>;

    /// Any plan, active or not. Existing subscriptions keep pointing at retired plans.
    async fn find_by_id(&self, plan_id: Uuid) -> Result<Option<PlanEntity>>;

    async fn list_active_plans(&self) -> Result<Vec<PlanEntity>>;
}
