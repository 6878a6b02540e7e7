//! Shared fixtures for the in-crate test suites.

use std::sync::Arc;

use sqlx::sqlite::SqlitePoolOptions;
use sqlx::SqlitePool;

use crate::api::ApiState;
use crate::config::Config;
use crate::db;
use crate::models::{Order, Product, Role, User};

/// Fresh in-memory database with migrations applied. A single connection
/// keeps every handle on the same memory store.
pub async fn pool() -> SqlitePool {
    let pool = SqlitePoolOptions::new()
        .max_connections(1)
        .connect("sqlite::memory:")
        .await
        .expect("in-memory pool");
    sqlx::migrate!("./migrations")
        .run(&pool)
        .await
        .expect("migrations");
    pool
}

pub fn state(pool: SqlitePool) -> Arc<ApiState> {
    Arc::new(ApiState {
        pool,
        config: Config {
            database_url: "sqlite::memory:".to_string(),
            api_port: 0,
            amount_tolerance: 1000,
            admin_email: "admin@test".to_string(),
        },
    })
}

pub async fn seed_user(pool: &SqlitePool, email: &str, role: Role, parent_id: Option<i64>) -> User {
    db::insert_user(pool, email, email, role, parent_id)
        .await
        .expect("seed user")
}

pub async fn seed_product(pool: &SqlitePool, name: &str, price: i64) -> Product {
    db::insert_product(pool, name, price).await.expect("seed product")
}

pub async fn seed_unit(pool: &SqlitePool, product_id: i64, credential: &str) {
    db::insert_unit(pool, product_id, credential)
        .await
        .expect("seed unit");
}

pub async fn seed_order(
    pool: &SqlitePool,
    code: &str,
    product: &Product,
    quantity: i64,
    notes: &str,
    buyer_email: &str,
    referrer_id: Option<i64>,
) -> Order {
    let mut conn = pool.acquire().await.expect("conn");
    let id = db::insert_order(
        &mut conn,
        code,
        product.id,
        product.price,
        quantity,
        notes,
        buyer_email,
        referrer_id,
        None,
    )
    .await
    .expect("seed order");
    drop(conn);

    db::get_order(pool, id)
        .await
        .expect("get order")
        .expect("order exists")
}

/// Referrer chain ctv → agent → distributor, with the agent and the
/// distributor padded to the override-eligibility threshold of direct
/// subordinates.
pub async fn seed_referrer_chain(pool: &SqlitePool) -> (User, User, User) {
    let distributor = seed_user(pool, "distributor@chain", Role::Distributor, None).await;
    let agent = seed_user(pool, "agent@chain", Role::Agent, Some(distributor.id)).await;
    let ctv = seed_user(pool, "ctv@chain", Role::Ctv, Some(agent.id)).await;

    for i in 0..2 {
        seed_user(pool, &format!("agent{i}@chain"), Role::Agent, Some(distributor.id)).await;
        seed_user(pool, &format!("ctv{i}@chain"), Role::Ctv, Some(agent.id)).await;
    }

    (ctv, agent, distributor)
}

/// In-memory order row for pure decision tests.
pub fn order_fixture(code: &str, price: i64, quantity: i64, status: &str, notes: &str) -> Order {
    Order {
        id: 1,
        code: code.to_string(),
        product_id: 1,
        price,
        quantity,
        status: status.to_string(),
        notes: notes.to_string(),
        buyer_email: "buyer@test".to_string(),
        referrer_id: None,
        referral_code: None,
        created_at: 0,
        updated_at: 0,
    }
}
