use serde::Serialize;
use uuid::Uuid;

use crate::domain::entities::plans::PlanEntity;

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct PlanDto {
    pub id: Uuid,
    pub name: String,
    pub description: Option<String>,
    pub price_minor: i32,
    pub duration_days: i32,
}

impl From<PlanEntity> for PlanDto {
    fn from(value: PlanEntity) -> Self {
        Self {
            id: value.id,
            name: value.name,
            description: value.description,
            price_minor: value.price_minor,
            duration_days: value.duration_days,
        }
    }
}
