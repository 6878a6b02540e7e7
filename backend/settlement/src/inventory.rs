//! Inventory allocation pool — single-use activation credentials.
//!
//! A product's pool normally hands each credential out exactly once
//! ("exclusive" mode). A pool holding exactly one unit in total is treated
//! as permanently shared (e.g. a group invite link): the unit is never
//! marked used and every order binds to the same credential.

use sqlx::{SqliteConnection, SqlitePool};
use tracing::warn;

use crate::db;
use crate::errors::{AppError, Result};
use crate::models::InventoryUnit;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClaimOutcome {
    /// Oldest unused unit, now marked used and bound to the order.
    Claimed { credential: String },
    /// Shared-mode pool; the unit stays unused and unbound.
    Shared { credential: String },
    /// No usable unit left; the order confirms anyway and is flagged for
    /// manual delivery.
    Exhausted,
}

/// Claim a credential for `order_id` inside the caller's transaction.
///
/// "Select oldest unused, mark used" relies on the surrounding transaction
/// to serialize concurrent claims against the same product's pool.
pub async fn claim_unit(
    conn: &mut SqliteConnection,
    product_id: i64,
    order_id: i64,
) -> Result<ClaimOutcome> {
    let total: i64 =
        sqlx::query_scalar("SELECT COUNT(*) FROM inventory_units WHERE product_id = ?1")
            .bind(product_id)
            .fetch_one(&mut *conn)
            .await?;

    // A one-unit pool is a permanently shared resource.
    if total == 1 {
        let credential: String =
            sqlx::query_scalar("SELECT credential FROM inventory_units WHERE product_id = ?1")
                .bind(product_id)
                .fetch_one(&mut *conn)
                .await?;
        return Ok(ClaimOutcome::Shared { credential });
    }

    let row: Option<(i64, String)> = sqlx::query_as(
        "SELECT id, credential FROM inventory_units \
         WHERE product_id = ?1 AND used = 0 \
         ORDER BY id ASC LIMIT 1",
    )
    .bind(product_id)
    .fetch_optional(&mut *conn)
    .await?;

    let Some((unit_id, credential)) = row else {
        warn!("Inventory exhausted for product {product_id} (order {order_id})");
        return Ok(ClaimOutcome::Exhausted);
    };

    sqlx::query("UPDATE inventory_units SET used = 1, order_id = ?1 WHERE id = ?2")
        .bind(order_id)
        .bind(unit_id)
        .execute(&mut *conn)
        .await?;

    Ok(ClaimOutcome::Claimed { credential })
}

/// Replace a product's shared delivery credential.
///
/// Creates the unit when the pool is empty and rewrites it when the pool
/// holds exactly one. A multi-unit pool is exclusive; collapsing it to
/// shared would discard units, so the request is rejected.
pub async fn relink_shared(
    pool: &SqlitePool,
    product_id: i64,
    credential: &str,
) -> Result<InventoryUnit> {
    let total: i64 =
        sqlx::query_scalar("SELECT COUNT(*) FROM inventory_units WHERE product_id = ?1")
            .bind(product_id)
            .fetch_one(pool)
            .await?;

    match total {
        0 => db::insert_unit(pool, product_id, credential).await,
        1 => {
            sqlx::query("UPDATE inventory_units SET credential = ?1 WHERE product_id = ?2")
                .bind(credential)
                .bind(product_id)
                .execute(pool)
                .await?;

            let unit = sqlx::query_as::<_, InventoryUnit>(
                "SELECT id, product_id, credential, used, order_id, created_at \
                 FROM inventory_units WHERE product_id = ?1",
            )
            .bind(product_id)
            .fetch_one(pool)
            .await?;
            Ok(unit)
        }
        _ => Err(AppError::Conflict(format!(
            "product {product_id} holds {total} inventory units; shared relink applies to a single-unit pool"
        ))),
    }
}

// ─────────────────────────────────────────────────────────
// Unit tests
// ─────────────────────────────────────────────────────────
