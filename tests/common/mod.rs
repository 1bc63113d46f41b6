//! Common test utilities
#![allow(dead_code)]

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::NaiveDate;
use serde_json::{json, Value};
use uuid::Uuid;

use care_market::clock::SystemClock;
use care_market::domain::{Booking, Identity, OperationContext, ReviewAction, Role, StageId};
use care_market::external::{HmacPaymentVerifier, PaymentVerifier, StaticIdentityVerifier};
use care_market::handlers::{
    CreateRequestCommand, PaymentCreditCommand, RegisterProviderCommand, ReviewStageCommand,
};
use care_market::store::{KvStore, MemoryStore, PgKvStore, StoreError, VersionedValue, WriteOp};
use care_market::{db, AppError, Engine, EngineSettings};

pub const PAYMENT_SECRET: &str = "test_payment_secret";

// =========================================================================
// Stores and collaborators
// =========================================================================

/// In-memory store that can be told to reject writes to provider records
#[derive(Default)]
pub struct FlakyStore {
    inner: MemoryStore,
    fail_provider_writes: AtomicBool,
}

impl FlakyStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn fail_provider_writes(&self, fail: bool) {
        self.fail_provider_writes.store(fail, Ordering::SeqCst);
    }
}

#[async_trait]
impl KvStore for FlakyStore {
    async fn get(&self, key: &str) -> Result<Option<VersionedValue>, StoreError> {
        self.inner.get(key).await
    }

    async fn list_by_prefix(&self, prefix: &str) -> Result<Vec<(String, VersionedValue)>, StoreError> {
        self.inner.list_by_prefix(prefix).await
    }

    async fn commit(&self, ops: Vec<WriteOp>) -> Result<Vec<u64>, StoreError> {
        if self.fail_provider_writes.load(Ordering::SeqCst)
            && ops.iter().any(|op| op.key.starts_with("provider:"))
        {
            return Err(StoreError::Database(sqlx::Error::PoolTimedOut));
        }
        self.inner.commit(ops).await
    }
}

/// Payment gateway that cannot be reached
pub struct UnreachablePayments;

#[async_trait]
impl PaymentVerifier for UnreachablePayments {
    async fn verify_signature(&self, _: &str, _: &str, _: &str) -> Result<bool, AppError> {
        Err(AppError::UpstreamFailure("payment gateway timed out".to_string()))
    }
}

// =========================================================================
// Engine fixture
// =========================================================================

pub struct TestMarket {
    pub engine: Arc<Engine>,
    pub store: Arc<FlakyStore>,
    pub identity: Arc<StaticIdentityVerifier>,
    pub admin: OperationContext,
}

impl TestMarket {
    pub fn new() -> Self {
        Self::with_settings(EngineSettings::default())
    }

    pub fn with_settings(settings: EngineSettings) -> Self {
        Self::build(settings, Arc::new(HmacPaymentVerifier::new(PAYMENT_SECRET)))
    }

    pub fn with_payments(payments: Arc<dyn PaymentVerifier>) -> Self {
        Self::build(EngineSettings::default(), payments)
    }

    fn build(settings: EngineSettings, payments: Arc<dyn PaymentVerifier>) -> Self {
        let store = Arc::new(FlakyStore::new());
        let identity = Arc::new(StaticIdentityVerifier::new());
        let engine = Arc::new(Engine::new(
            store.clone(),
            identity.clone(),
            payments,
            Arc::new(SystemClock),
            settings,
        ));
        Self {
            engine,
            store,
            identity,
            admin: ctx(Uuid::new_v4(), Role::Admin),
        }
    }

    /// Register a bearer token for `identity` and return the header value
    pub fn bearer(&self, identity: Identity) -> String {
        let token = format!("tok-{}", Uuid::new_v4());
        self.identity.register(token.clone(), identity);
        format!("Bearer {}", token)
    }

    /// Register, approve all four stages and go available
    pub async fn verified_provider(&self, skill: &str) -> Uuid {
        verified_provider(&self.engine, &self.admin, skill).await
    }

    pub async fn open_request(&self, client_id: Uuid, service: &str, cost: &str) -> Booking {
        let date = NaiveDate::from_ymd_opt(2026, 11, 20).unwrap();
        self.engine
            .bookings
            .create_request(
                CreateRequestCommand::new(service, date, cost).with_address("7 Lake View, Bengaluru"),
                &ctx(client_id, Role::Client),
            )
            .await
            .unwrap()
    }

    /// Top up a wallet through a signed payment
    pub async fn fund(&self, account_id: Uuid, role: Role, amount: &str) {
        let payment_id = format!("pay_{}", Uuid::new_v4().simple());
        self.engine
            .ledger
            .credit_from_payment(account_id, signed_payment(amount, "order_1", &payment_id), &ctx(account_id, role))
            .await
            .unwrap();
    }
}

pub fn ctx(id: Uuid, role: Role) -> OperationContext {
    OperationContext::for_caller(Identity::new(id, role).with_display_name("Test User"))
}

pub fn signed_payment(amount: &str, order_id: &str, payment_id: &str) -> PaymentCreditCommand {
    PaymentCreditCommand {
        amount: amount.to_string(),
        order_id: order_id.to_string(),
        payment_id: payment_id.to_string(),
        signature: HmacPaymentVerifier::new(PAYMENT_SECRET)
            .sign(order_id, payment_id)
            .unwrap(),
    }
}

pub async fn verified_provider(engine: &Engine, admin: &OperationContext, skill: &str) -> Uuid {
    let id = Uuid::new_v4();
    let me = ctx(id, Role::Provider);
    engine
        .providers
        .register(
            RegisterProviderCommand::new("Meera", "400").with_skills([skill]),
            &me,
        )
        .await
        .unwrap();
    for stage in StageId::ALL {
        engine
            .verification
            .submit_stage(id, stage, stage_payload(stage), &me)
            .await
            .unwrap();
        engine
            .verification
            .review(
                id,
                stage,
                ReviewStageCommand {
                    action: ReviewAction::Approve,
                    notes: Some("Looks good".to_string()),
                },
                admin,
            )
            .await
            .unwrap();
    }
    engine.providers.set_availability(id, true, &me).await.unwrap();
    id
}

pub fn stage_payload(stage: StageId) -> Value {
    match stage {
        StageId::Identity => json!({"phone": "+91 98450 12345", "address": "Indiranagar"}),
        StageId::Documents => json!({"documents": ["aadhaar.pdf", "police_clearance.pdf"]}),
        StageId::Skills => json!({"years_experience": 6, "certifications": ["First Aid"]}),
        StageId::Behavioral => json!({"assessment_score": 87}),
    }
}

// =========================================================================
// Postgres
// =========================================================================

/// Engine over the database at DATABASE_URL with a clean record table
pub async fn setup_pg_engine() -> Arc<Engine> {
    dotenvy::dotenv().ok();
    let database_url = std::env::var("DATABASE_URL").expect("DATABASE_URL must be set for tests");

    let pool = db::connect(&database_url, 10)
        .await
        .expect("Failed to connect to DB");

    sqlx::query("TRUNCATE TABLE kv_records")
        .execute(&pool)
        .await
        .expect("Failed to clean up DB");

    let store: Arc<dyn KvStore> = Arc::new(PgKvStore::new(pool));
    Arc::new(Engine::new(
        store,
        Arc::new(StaticIdentityVerifier::new()),
        Arc::new(HmacPaymentVerifier::new(PAYMENT_SECRET)),
        Arc::new(SystemClock),
        EngineSettings {
            max_retries: 20,
            ..Default::default()
        },
    ))
}
