//! Accept race stress tool
//!
//! Run with: cargo run --bin accept_race --release -- --providers 50 --rounds 20
//!
//! Uses Postgres when DATABASE_URL is set, the in-memory store otherwise.
//! Every round opens one request and lets all providers accept it at once;
//! exactly one accept per round must win.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Instant;

use chrono::NaiveDate;
use serde_json::json;
use uuid::Uuid;

use care_market::clock::SystemClock;
use care_market::domain::{Identity, OperationContext, ReviewAction, Role, StageId};
use care_market::external::{HmacPaymentVerifier, StaticIdentityVerifier};
use care_market::handlers::{CreateRequestCommand, RegisterProviderCommand, ReviewStageCommand};
use care_market::store::{KvStore, MemoryStore, PgKvStore};
use care_market::{db, Engine, EngineSettings};

fn arg_or(args: &[String], flag: &str, default: usize) -> usize {
    args.iter()
        .position(|a| a == flag)
        .and_then(|i| args.get(i + 1))
        .and_then(|s| s.parse().ok())
        .unwrap_or(default)
}

fn context(id: Uuid, role: Role) -> OperationContext {
    OperationContext::for_caller(Identity::new(id, role).with_display_name("Race Tester"))
}

async fn verified_provider(engine: &Engine, admin: &OperationContext) -> anyhow::Result<Uuid> {
    let id = Uuid::new_v4();
    let me = context(id, Role::Provider);
    engine
        .providers
        .register(
            RegisterProviderCommand::new("Race Provider", "300").with_skills(["cooking"]),
            &me,
        )
        .await?;
    for stage in StageId::ALL {
        engine
            .verification
            .submit_stage(id, stage, json!({"stage": stage.number()}), &me)
            .await?;
        engine
            .verification
            .review(
                id,
                stage,
                ReviewStageCommand {
                    action: ReviewAction::Approve,
                    notes: None,
                },
                admin,
            )
            .await?;
    }
    Ok(id)
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();

    let args: Vec<String> = std::env::args().collect();
    let provider_count = arg_or(&args, "--providers", 50);
    let rounds = arg_or(&args, "--rounds", 20);

    let store: Arc<dyn KvStore> = match std::env::var("DATABASE_URL") {
        Ok(url) => {
            println!("Connecting to database...");
            Arc::new(PgKvStore::new(db::connect(&url, 20).await?))
        }
        Err(_) => Arc::new(MemoryStore::new()),
    };

    let settings = EngineSettings {
        max_retries: 20,
        ..Default::default()
    };
    let engine = Arc::new(Engine::new(
        store,
        Arc::new(StaticIdentityVerifier::new()),
        Arc::new(HmacPaymentVerifier::new("accept-race")),
        Arc::new(SystemClock),
        settings,
    ));
    let admin = context(Uuid::new_v4(), Role::Admin);

    println!("Accept race - {} providers, {} rounds", provider_count, rounds);
    let mut providers = Vec::with_capacity(provider_count);
    for _ in 0..provider_count {
        providers.push(verified_provider(&engine, &admin).await?);
    }

    let client = context(Uuid::new_v4(), Role::Client);
    let date = NaiveDate::from_ymd_opt(2030, 1, 1)
        .ok_or_else(|| anyhow::anyhow!("invalid scheduled date"))?;

    let start = Instant::now();
    let mut violations = 0usize;
    let mut losses: BTreeMap<String, usize> = BTreeMap::new();

    for round in 0..rounds {
        // Winners of the previous round are busy; free everyone again
        for &id in &providers {
            engine
                .providers
                .set_availability(id, true, &context(id, Role::Provider))
                .await?;
        }

        let request = engine
            .bookings
            .create_request(CreateRequestCommand::new("Cooking", date, "500"), &client)
            .await?;

        let mut tasks = Vec::with_capacity(providers.len());
        for &id in &providers {
            let engine = engine.clone();
            let request_id = request.id;
            tasks.push(tokio::spawn(async move {
                engine
                    .matching
                    .accept(id, request_id, &context(id, Role::Provider))
                    .await
            }));
        }

        let mut winners = 0usize;
        for task in tasks {
            match task.await? {
                Ok(_) => winners += 1,
                Err(e) => *losses.entry(e.kind().as_str().to_string()).or_default() += 1,
            }
        }

        if winners != 1 {
            violations += 1;
            println!("Round {}: {} winners", round + 1, winners);
        }
    }

    let elapsed = start.elapsed();
    let attempts = provider_count * rounds;

    println!("\n=== Accept Race Results ===");
    println!("Rounds: {}", rounds);
    println!("Accept attempts: {}", attempts);
    for (kind, count) in &losses {
        println!("Rejected ({}): {}", kind, count);
    }
    println!("Rounds with != 1 winner: {}", violations);
    println!("Time: {:.2}s", elapsed.as_secs_f64());
    println!("Rate: {:.0} accepts/sec", attempts as f64 / elapsed.as_secs_f64());

    if violations > 0 {
        return Err(anyhow::anyhow!("{} rounds violated single-winner acceptance", violations));
    }
    Ok(())
}
