#![allow(dead_code)]

use std::{
    collections::HashMap,
    sync::{
        Arc, Mutex,
        atomic::{AtomicBool, AtomicUsize, Ordering},
    },
    time::Duration,
};

use anyhow::{Result, anyhow, bail};
use async_trait::async_trait;
use axum::Router;
use backend::{
    auth::Claims,
    axum_http::routers,
    usecases::{
        entitlements::EntitlementProjector, payment_callbacks::PaymentCallbackUseCase,
        subscription_admin::SubscriptionAdminUseCase,
        subscriptions::{PaymentInitiator, SubscriptionUseCase},
    },
};
use chrono::{DateTime, Utc};
use crates::{
    domain::{
        entities::{
            app_users::UserEntitlementEntity,
            plans::PlanEntity,
            subscriptions::{InsertSubscriptionEntity, SubscriptionEntity},
        },
        repositories::{
            app_users::EntitlementRepository, plans::PlanRepository,
            subscriptions::SubscriptionRepository,
        },
        value_objects::{
            enums::subscription_statuses::SubscriptionStatus,
            mpesa_callback::ConfirmedPayment,
            subscriptions::{PendingCreation, StatusTransition},
        },
    },
    payments::mpesa_client::StkPushAccepted,
};
use jsonwebtoken::{EncodingKey, Header, encode};
use uuid::Uuid;

pub const JWT_SECRET: &str = "integration-test-secret-0123456789";

pub struct InMemoryPlans {
    plans: Mutex<Vec<PlanEntity>>,
}

impl InMemoryPlans {
    pub fn seeded() -> Self {
        let plan = |name: &str, price_minor: i32, duration_days: i32, is_active: bool| PlanEntity {
            id: Uuid::new_v4(),
            name: name.to_string(),
            description: None,
            price_minor,
            duration_days,
            is_active,
            created_at: Utc::now(),
        };

        Self {
            plans: Mutex::new(vec![
                plan("1-Month Premium", 3000, 30, true),
                plan("5-Day Basic", 10, 5, true),
                plan("Retired", 50, 7, false),
                plan("2-Week Pro", 1000, 14, true),
            ]),
        }
    }

    pub fn id_of(&self, name: &str) -> Uuid {
        self.plans
            .lock()
            .unwrap()
            .iter()
            .find(|plan| plan.name == name)
            .map(|plan| plan.id)
            .unwrap()
    }

    pub fn update(&self, plan_id: Uuid, price_minor: i32, duration_days: i32) {
        let mut plans = self.plans.lock().unwrap();
        let plan = plans.iter_mut().find(|plan| plan.id == plan_id).unwrap();
        plan.price_minor = price_minor;
        plan.duration_days = duration_days;
    }
}

#[async_trait]
impl PlanRepository for InMemoryPlans {
    async fn find_active_plan_by_id(&self, plan_id: Uuid) -> Result<Option<PlanEntity>> {
        Ok(self
            .plans
            .lock()
            .unwrap()
            .iter()
            .find(|plan| plan.id == plan_id && plan.is_active)
            .cloned())
    }

    async fn find_by_id(&self, plan_id: Uuid) -> Result<Option<PlanEntity>> {
        Ok(self
            .plans
            .lock()
            .unwrap()
            .iter()
            .find(|plan| plan.id == plan_id)
            .cloned())
    }

    async fn list_active_plans(&self) -> Result<Vec<PlanEntity>> {
        let mut plans: Vec<PlanEntity> = self
            .plans
            .lock()
            .unwrap()
            .iter()
            .filter(|plan| plan.is_active)
            .cloned()
            .collect();
        plans.sort_by_key(|plan| plan.price_minor);
        Ok(plans)
    }
}

/// Ledger fake. Every operation runs under one lock, which gives the same
/// compare-and-set and per-user serialization guarantees as the SQL version.
#[derive(Default)]
pub struct InMemorySubscriptions {
    rows: Mutex<HashMap<Uuid, SubscriptionEntity>>,
    fail_attach: AtomicBool,
}

impl InMemorySubscriptions {
    pub fn get(&self, subscription_id: Uuid) -> SubscriptionEntity {
        self.rows.lock().unwrap().get(&subscription_id).cloned().unwrap()
    }

    pub fn by_checkout(&self, checkout_request_id: &str) -> SubscriptionEntity {
        self.rows
            .lock()
            .unwrap()
            .values()
            .find(|row| row.checkout_request_id.as_deref() == Some(checkout_request_id))
            .cloned()
            .unwrap()
    }

    pub fn all(&self) -> Vec<SubscriptionEntity> {
        self.rows.lock().unwrap().values().cloned().collect()
    }

    pub fn fail_next_attach(&self) {
        self.fail_attach.store(true, Ordering::SeqCst);
    }

    /// Moves a row into the past, as if it had been created `age` ago.
    pub fn age(&self, subscription_id: Uuid, age: chrono::Duration) {
        let mut rows = self.rows.lock().unwrap();
        let row = rows.get_mut(&subscription_id).unwrap();
        row.created_at = row.created_at - age;
        row.starts_at = row.starts_at - age;
        row.expires_at = row.expires_at - age;
    }

    fn is_current(row: &SubscriptionEntity, user_id: Uuid, now: DateTime<Utc>) -> bool {
        row.user_id == user_id
            && matches!(
                row.status(),
                SubscriptionStatus::Pending | SubscriptionStatus::Active
            )
            && row.expires_at > now
    }

    fn transition(
        &self,
        subscription_id: Uuid,
        apply: impl FnOnce(&mut SubscriptionEntity),
    ) -> Result<StatusTransition> {
        let mut rows = self.rows.lock().unwrap();
        let row = rows
            .get_mut(&subscription_id)
            .ok_or_else(|| anyhow!("subscription {subscription_id} not found"))?;

        if row.status() != SubscriptionStatus::Pending {
            return Ok(StatusTransition::InvalidState(row.clone()));
        }

        apply(row);
        Ok(StatusTransition::Applied(row.clone()))
    }
}

#[async_trait]
impl SubscriptionRepository for InMemorySubscriptions {
    async fn create_pending(
        &self,
        insert: InsertSubscriptionEntity,
        now: DateTime<Utc>,
    ) -> Result<PendingCreation> {
        let mut rows = self.rows.lock().unwrap();

        if let Some(existing) = rows
            .values()
            .filter(|row| Self::is_current(row, insert.user_id, now))
            .max_by_key(|row| row.created_at)
        {
            return Ok(PendingCreation::Conflict(existing.clone()));
        }

        let created = SubscriptionEntity {
            id: Uuid::new_v4(),
            user_id: insert.user_id,
            plan_id: insert.plan_id,
            status: insert.status,
            starts_at: insert.starts_at,
            expires_at: insert.expires_at,
            quoted_amount_minor: insert.quoted_amount_minor,
            amount_minor: insert.amount_minor,
            amount_mismatch: false,
            phone_used: insert.phone_used,
            checkout_request_id: None,
            merchant_request_id: None,
            provider_receipt: None,
            payer_phone: None,
            provider_transaction_date: None,
            failure_reason: None,
            paid_at: None,
            created_at: now,
            updated_at: now,
        };
        rows.insert(created.id, created.clone());

        Ok(PendingCreation::Created(created))
    }

    async fn find_by_id(&self, subscription_id: Uuid) -> Result<Option<SubscriptionEntity>> {
        Ok(self.rows.lock().unwrap().get(&subscription_id).cloned())
    }

    async fn find_by_checkout_request_id(
        &self,
        checkout_request_id: &str,
    ) -> Result<Option<SubscriptionEntity>> {
        Ok(self
            .rows
            .lock()
            .unwrap()
            .values()
            .find(|row| row.checkout_request_id.as_deref() == Some(checkout_request_id))
            .cloned())
    }

    async fn find_current_subscription(
        &self,
        user_id: Uuid,
        now: DateTime<Utc>,
    ) -> Result<Option<SubscriptionEntity>> {
        Ok(self
            .rows
            .lock()
            .unwrap()
            .values()
            .filter(|row| Self::is_current(row, user_id, now))
            .max_by_key(|row| row.created_at)
            .cloned())
    }

    async fn find_latest_active_subscription(
        &self,
        user_id: Uuid,
        now: DateTime<Utc>,
    ) -> Result<Option<SubscriptionEntity>> {
        Ok(self
            .rows
            .lock()
            .unwrap()
            .values()
            .filter(|row| row.user_id == user_id && row.is_entitling(now))
            .max_by_key(|row| row.expires_at)
            .cloned())
    }

    async fn attach_checkout_request(
        &self,
        subscription_id: Uuid,
        checkout_request_id: &str,
        merchant_request_id: Option<String>,
    ) -> Result<()> {
        if self.fail_attach.swap(false, Ordering::SeqCst) {
            bail!("connection closed while storing checkout request id");
        }

        let mut rows = self.rows.lock().unwrap();
        if rows
            .values()
            .any(|row| row.checkout_request_id.as_deref() == Some(checkout_request_id))
        {
            bail!("duplicate checkout_request_id {checkout_request_id}");
        }

        let row = rows
            .get_mut(&subscription_id)
            .ok_or_else(|| anyhow!("subscription {subscription_id} not found"))?;
        row.checkout_request_id = Some(checkout_request_id.to_string());
        row.merchant_request_id = merchant_request_id;
        row.updated_at = Utc::now();
        Ok(())
    }

    async fn transition_to_active(
        &self,
        subscription_id: Uuid,
        payment: ConfirmedPayment,
        now: DateTime<Utc>,
    ) -> Result<StatusTransition> {
        self.transition(subscription_id, |row| {
            row.status = SubscriptionStatus::Active.to_string();
            row.amount_mismatch = row.amount_minor != payment.amount_minor;
            row.amount_minor = payment.amount_minor;
            row.provider_receipt = Some(payment.receipt);
            row.payer_phone = payment.payer_phone;
            row.provider_transaction_date = payment.transaction_date;
            row.paid_at = Some(now);
            row.updated_at = now;
        })
    }

    async fn transition_to_failed(
        &self,
        subscription_id: Uuid,
        reason: &str,
        now: DateTime<Utc>,
    ) -> Result<StatusTransition> {
        self.transition(subscription_id, |row| {
            row.status = SubscriptionStatus::Failed.to_string();
            row.failure_reason = Some(reason.to_string());
            row.updated_at = now;
        })
    }

    async fn list_stale_pending(
        &self,
        created_before: DateTime<Utc>,
    ) -> Result<Vec<SubscriptionEntity>> {
        let mut stale: Vec<SubscriptionEntity> = self
            .rows
            .lock()
            .unwrap()
            .values()
            .filter(|row| {
                row.status() == SubscriptionStatus::Pending && row.created_at < created_before
            })
            .cloned()
            .collect();
        stale.sort_by_key(|row| row.created_at);
        Ok(stale)
    }
}

#[derive(Default)]
pub struct InMemoryEntitlements {
    rows: Mutex<HashMap<Uuid, UserEntitlementEntity>>,
    failing: AtomicBool,
}

impl InMemoryEntitlements {
    pub fn get(&self, user_id: Uuid) -> Option<UserEntitlementEntity> {
        self.rows.lock().unwrap().get(&user_id).cloned()
    }

    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }
}

#[async_trait]
impl EntitlementRepository for InMemoryEntitlements {
    async fn apply_entitlement(
        &self,
        user_id: Uuid,
        expires_at: DateTime<Utc>,
        paid_at: DateTime<Utc>,
    ) -> Result<()> {
        if self.failing.load(Ordering::SeqCst) {
            bail!("users table unavailable");
        }

        self.rows.lock().unwrap().insert(
            user_id,
            UserEntitlementEntity {
                id: user_id,
                has_subscription: true,
                subscription_expiry: Some(expires_at),
                last_payment_date: Some(paid_at),
            },
        );
        Ok(())
    }

    async fn find_entitlement(&self, user_id: Uuid) -> Result<Option<UserEntitlementEntity>> {
        Ok(self.get(user_id))
    }
}

/// Payment initiator fake handing out sequential checkout request ids.
#[derive(Default)]
pub struct FakeInitiator {
    calls: AtomicUsize,
    failure: Mutex<Option<String>>,
    phones: Mutex<Vec<String>>,
    delay: Mutex<Option<Duration>>,
}

impl FakeInitiator {
    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn fail_with(&self, message: &str) {
        *self.failure.lock().unwrap() = Some(message.to_string());
    }

    pub fn phones(&self) -> Vec<String> {
        self.phones.lock().unwrap().clone()
    }

    /// Holds every later call for `delay` before answering.
    pub fn respond_after(&self, delay: Duration) {
        *self.delay.lock().unwrap() = Some(delay);
    }
}

#[async_trait]
impl PaymentInitiator for FakeInitiator {
    async fn start(
        &self,
        phone: &str,
        _amount_minor: i32,
        _account_reference: &str,
        _description: &str,
    ) -> Result<StkPushAccepted> {
        let call = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
        self.phones.lock().unwrap().push(phone.to_string());

        let delay = *self.delay.lock().unwrap();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }

        if let Some(message) = self.failure.lock().unwrap().clone() {
            bail!(message);
        }

        Ok(StkPushAccepted {
            checkout_request_id: format!("ws_CO_{call:04}"),
            merchant_request_id: Some(format!("mr-{call:04}")),
            customer_message: Some("Success. Request accepted for processing".to_string()),
        })
    }
}

pub type Engine =
    SubscriptionUseCase<InMemoryPlans, InMemorySubscriptions, InMemoryEntitlements, FakeInitiator>;
pub type Callbacks = PaymentCallbackUseCase<InMemorySubscriptions, InMemoryEntitlements>;
pub type Admin = SubscriptionAdminUseCase<InMemorySubscriptions>;

pub struct Harness {
    pub plans: Arc<InMemoryPlans>,
    pub subscriptions: Arc<InMemorySubscriptions>,
    pub entitlements: Arc<InMemoryEntitlements>,
    pub initiator: Arc<FakeInitiator>,
    pub engine: Arc<Engine>,
    pub callbacks: Arc<Callbacks>,
    pub admin: Arc<Admin>,
}

impl Harness {
    pub fn new() -> Self {
        Self::build(None, Duration::from_secs(5))
    }

    pub fn with_fallback_phone(fallback_phone: Option<&str>) -> Self {
        Self::build(fallback_phone, Duration::from_secs(5))
    }

    pub fn with_initiation_timeout(initiation_timeout: Duration) -> Self {
        Self::build(None, initiation_timeout)
    }

    fn build(fallback_phone: Option<&str>, initiation_timeout: Duration) -> Self {
        let plans = Arc::new(InMemoryPlans::seeded());
        let subscriptions = Arc::new(InMemorySubscriptions::default());
        let entitlements = Arc::new(InMemoryEntitlements::default());
        let initiator = Arc::new(FakeInitiator::default());

        let projector = Arc::new(EntitlementProjector::new(
            Arc::clone(&subscriptions),
            Arc::clone(&entitlements),
        ));

        let engine = Arc::new(SubscriptionUseCase::new(
            Arc::clone(&plans),
            Arc::clone(&subscriptions),
            Arc::clone(&projector),
            Arc::clone(&initiator),
            fallback_phone.map(str::to_string),
            initiation_timeout,
        ));
        let callbacks = Arc::new(PaymentCallbackUseCase::new(
            Arc::clone(&subscriptions),
            projector,
        ));
        let admin = Arc::new(SubscriptionAdminUseCase::new(Arc::clone(&subscriptions), 15));

        Self {
            plans,
            subscriptions,
            entitlements,
            initiator,
            engine,
            callbacks,
            admin,
        }
    }

    pub fn basic_plan_id(&self) -> Uuid {
        self.plans.id_of("5-Day Basic")
    }

    /// Same route layout as the server, backed by the fakes.
    pub fn router(&self) -> Router {
        self.router_with_payment_timeout(Duration::from_secs(10))
    }

    pub fn router_with_payment_timeout(&self, payment_timeout: Duration) -> Router {
        let timeout = Duration::from_secs(10);
        Router::new()
            .nest(
                "/api/v1",
                routers::subscriptions::router(
                    Arc::clone(&self.engine),
                    timeout,
                    payment_timeout,
                ),
            )
            .nest(
                "/api/v1/mpesa",
                routers::mpesa_callback::router(Arc::clone(&self.callbacks)),
            )
            .nest(
                "/api/v1/admin",
                routers::admin_subscriptions::router(Arc::clone(&self.admin)),
            )
    }
}

pub fn bearer(user_id: Uuid, role: &str) -> String {
    unsafe {
        std::env::set_var("JWT_SECRET", JWT_SECRET);
    }

    let claims = Claims {
        sub: user_id.to_string(),
        role: role.to_string(),
        exp: 9_999_999_999,
    };
    let token = encode(
        &Header::default(),
        &claims,
        &EncodingKey::from_secret(JWT_SECRET.as_bytes()),
    )
    .unwrap();

    format!("Bearer {token}")
}

pub fn success_payload(checkout_request_id: &str, amount: i64, receipt: &str) -> String {
    serde_json::json!({
        "Body": {
            "stkCallback": {
                "MerchantRequestID": "29115-34620561-1",
                "CheckoutRequestID": checkout_request_id,
                "ResultCode": 0,
                "ResultDesc": "The service request is processed successfully.",
                "CallbackMetadata": {
                    "Item": [
                        {"Name": "Amount", "Value": amount},
                        {"Name": "MpesaReceiptNumber", "Value": receipt},
                        {"Name": "TransactionDate", "Value": 20250115103000_i64},
                        {"Name": "PhoneNumber", "Value": 254712345678_i64}
                    ]
                }
            }
        }
    })
    .to_string()
}

pub fn failure_payload(checkout_request_id: &str, result_code: i64, description: &str) -> String {
    serde_json::json!({
        "Body": {
            "stkCallback": {
                "MerchantRequestID": "29115-34620561-1",
                "CheckoutRequestID": checkout_request_id,
                "ResultCode": result_code,
                "ResultDesc": description
            }
        }
    })
    .to_string()
}
