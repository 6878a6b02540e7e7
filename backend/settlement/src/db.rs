//! Database layer — pool setup, migrations, and row-level queries.
//!
//! Domain algorithms that must run inside a transaction (credential
//! allocation, commission settlement, webhook apply) issue their own
//! statements; everything row-shaped lives here.

use sqlx::sqlite::SqlitePoolOptions;
use sqlx::{SqliteConnection, SqlitePool};
use tracing::info;

use crate::errors::{AppError, Result};
use crate::models::{
    Commission, CommissionSetting, InventoryUnit, InventoryUnitAudit, Order, OrderStatus, Product,
    ReferralLink, Role, SubordinateLinkStats, User,
};

/// Establish a SQLite connection pool and run pending migrations.
pub async fn init_pool(database_url: &str) -> Result<SqlitePool> {
    // Make sure the file is created if it doesn't exist yet.
    let url = if database_url.starts_with("sqlite:") {
        database_url.to_string()
    } else {
        format!("sqlite:{database_url}")
    };

    let pool = SqlitePoolOptions::new()
        .max_connections(5)
        .connect(&url)
        .await?;

    sqlx::migrate!("./migrations").run(&pool).await?;
    info!("Database migrations applied successfully");
    Ok(pool)
}

/// Current unix timestamp in seconds.
pub fn now() -> i64 {
    chrono::Utc::now().timestamp()
}

/// Create the bootstrap administrator account if it does not exist yet.
pub async fn ensure_admin(pool: &SqlitePool, email: &str) -> Result<()> {
    let inserted = sqlx::query(
        "INSERT OR IGNORE INTO users (email, name, role, created_at) \
         VALUES (?1, 'Administrator', 'admin', ?2)",
    )
    .bind(email)
    .bind(now())
    .execute(pool)
    .await?
    .rows_affected();

    if inserted > 0 {
        info!("Bootstrap administrator created: {email}");
    }
    Ok(())
}

// ─────────────────────────────────────────────────────────
// Users
// ─────────────────────────────────────────────────────────

pub async fn get_user(pool: &SqlitePool, id: i64) -> Result<Option<User>> {
    let row = sqlx::query_as::<_, User>(
        "SELECT id, email, name, role, parent_id, balance, created_at \
         FROM users WHERE id = ?1",
    )
    .bind(id)
    .fetch_optional(pool)
    .await?;
    Ok(row)
}

pub async fn get_user_by_email(pool: &SqlitePool, email: &str) -> Result<Option<User>> {
    let row = sqlx::query_as::<_, User>(
        "SELECT id, email, name, role, parent_id, balance, created_at \
         FROM users WHERE email = ?1",
    )
    .bind(email)
    .fetch_optional(pool)
    .await?;
    Ok(row)
}

pub async fn insert_user(
    pool: &SqlitePool,
    email: &str,
    name: &str,
    role: Role,
    parent_id: Option<i64>,
) -> Result<User> {
    let id = sqlx::query(
        "INSERT INTO users (email, name, role, parent_id, created_at) \
         VALUES (?1, ?2, ?3, ?4, ?5)",
    )
    .bind(email)
    .bind(name)
    .bind(role.as_str())
    .bind(parent_id)
    .bind(now())
    .execute(pool)
    .await?
    .last_insert_rowid();

    get_user(pool, id)
        .await?
        .ok_or_else(|| AppError::NotFound(format!("user {id}")))
}

/// Count of a principal's direct subordinates (children only, not the whole
/// subtree) — the override-commission eligibility input.
pub async fn count_direct_subordinates(pool: &SqlitePool, user_id: i64) -> Result<i64> {
    let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM users WHERE parent_id = ?1")
        .bind(user_id)
        .fetch_one(pool)
        .await?;
    Ok(count)
}

/// Raw parent-pointer write. Cycle validation happens in the referral
/// module before this is called.
pub async fn set_user_parent(pool: &SqlitePool, id: i64, parent_id: Option<i64>) -> Result<()> {
    sqlx::query("UPDATE users SET parent_id = ?1 WHERE id = ?2")
        .bind(parent_id)
        .bind(id)
        .execute(pool)
        .await?;
    Ok(())
}

// ─────────────────────────────────────────────────────────
// Products
// ─────────────────────────────────────────────────────────

pub async fn get_product(pool: &SqlitePool, id: i64) -> Result<Option<Product>> {
    let row = sqlx::query_as::<_, Product>(
        "SELECT id, name, price, created_at FROM products WHERE id = ?1",
    )
    .bind(id)
    .fetch_optional(pool)
    .await?;
    Ok(row)
}

pub async fn insert_product(pool: &SqlitePool, name: &str, price: i64) -> Result<Product> {
    let id = sqlx::query("INSERT INTO products (name, price, created_at) VALUES (?1, ?2, ?3)")
        .bind(name)
        .bind(price)
        .bind(now())
        .execute(pool)
        .await?
        .last_insert_rowid();

    get_product(pool, id)
        .await?
        .ok_or_else(|| AppError::NotFound(format!("product {id}")))
}

pub async fn list_products(pool: &SqlitePool) -> Result<Vec<Product>> {
    let rows = sqlx::query_as::<_, Product>(
        "SELECT id, name, price, created_at FROM products ORDER BY id ASC",
    )
    .fetch_all(pool)
    .await?;
    Ok(rows)
}

// ─────────────────────────────────────────────────────────
// Orders
// ─────────────────────────────────────────────────────────

const ORDER_COLUMNS: &str = "id, code, product_id, price, quantity, status, notes, \
                             buyer_email, referrer_id, referral_code, created_at, updated_at";

pub async fn get_order(pool: &SqlitePool, id: i64) -> Result<Option<Order>> {
    let sql = format!("SELECT {ORDER_COLUMNS} FROM orders WHERE id = ?1");
    let row = sqlx::query_as::<_, Order>(&sql)
        .bind(id)
        .fetch_optional(pool)
        .await?;
    Ok(row)
}

pub async fn get_order_by_code(pool: &SqlitePool, code: &str) -> Result<Option<Order>> {
    let sql = format!("SELECT {ORDER_COLUMNS} FROM orders WHERE code = ?1");
    let row = sqlx::query_as::<_, Order>(&sql)
        .bind(code)
        .fetch_optional(pool)
        .await?;
    Ok(row)
}

#[allow(clippy::too_many_arguments)]
pub async fn insert_order(
    conn: &mut SqliteConnection,
    code: &str,
    product_id: i64,
    price: i64,
    quantity: i64,
    notes: &str,
    buyer_email: &str,
    referrer_id: Option<i64>,
    referral_code: Option<&str>,
) -> Result<i64> {
    let ts = now();
    let id = sqlx::query(
        "INSERT INTO orders \
             (code, product_id, price, quantity, status, notes, buyer_email, \
              referrer_id, referral_code, created_at, updated_at) \
         VALUES (?1, ?2, ?3, ?4, 'pending', ?5, ?6, ?7, ?8, ?9, ?9)",
    )
    .bind(code)
    .bind(product_id)
    .bind(price)
    .bind(quantity)
    .bind(notes)
    .bind(buyer_email)
    .bind(referrer_id)
    .bind(referral_code)
    .bind(ts)
    .execute(&mut *conn)
    .await?
    .last_insert_rowid();
    Ok(id)
}

/// Guarded status write: only succeeds when the order is still in `from`.
/// Returns whether a row was updated.
pub async fn update_order_status(
    pool: &SqlitePool,
    id: i64,
    from: OrderStatus,
    to: OrderStatus,
) -> Result<bool> {
    let n = sqlx::query("UPDATE orders SET status = ?1, updated_at = ?2 WHERE id = ?3 AND status = ?4")
        .bind(to.as_str())
        .bind(now())
        .bind(id)
        .bind(from.as_str())
        .execute(pool)
        .await?
        .rows_affected();
    Ok(n > 0)
}

/// Append a line to an order's free-text notes.
pub async fn append_order_note(pool: &SqlitePool, id: i64, note: &str) -> Result<()> {
    sqlx::query(
        "UPDATE orders \
         SET notes = CASE WHEN notes = '' THEN ?1 ELSE notes || char(10) || ?1 END, \
             updated_at = ?2 \
         WHERE id = ?3",
    )
    .bind(note)
    .bind(now())
    .bind(id)
    .execute(pool)
    .await?;
    Ok(())
}

// ─────────────────────────────────────────────────────────
// Inventory
// ─────────────────────────────────────────────────────────

pub async fn get_unit(pool: &SqlitePool, id: i64) -> Result<Option<InventoryUnit>> {
    let row = sqlx::query_as::<_, InventoryUnit>(
        "SELECT id, product_id, credential, used, order_id, created_at \
         FROM inventory_units WHERE id = ?1",
    )
    .bind(id)
    .fetch_optional(pool)
    .await?;
    Ok(row)
}

pub async fn insert_unit(
    pool: &SqlitePool,
    product_id: i64,
    credential: &str,
) -> Result<InventoryUnit> {
    let id = sqlx::query(
        "INSERT INTO inventory_units (product_id, credential, used, created_at) \
         VALUES (?1, ?2, 0, ?3)",
    )
    .bind(product_id)
    .bind(credential)
    .bind(now())
    .execute(pool)
    .await?
    .last_insert_rowid();

    get_unit(pool, id)
        .await?
        .ok_or_else(|| AppError::NotFound(format!("inventory unit {id}")))
}

pub async fn delete_unit(pool: &SqlitePool, id: i64) -> Result<bool> {
    let n = sqlx::query("DELETE FROM inventory_units WHERE id = ?1")
        .bind(id)
        .execute(pool)
        .await?
        .rows_affected();
    Ok(n > 0)
}

/// Units for one product joined with the bound order's code, for audit.
pub async fn list_units_with_orders(
    pool: &SqlitePool,
    product_id: i64,
) -> Result<Vec<InventoryUnitAudit>> {
    let rows = sqlx::query_as::<_, InventoryUnitAudit>(
        "SELECT iu.id, iu.product_id, iu.credential, iu.used, iu.order_id, \
                o.code AS order_code, iu.created_at \
         FROM   inventory_units iu \
         LEFT   JOIN orders o ON o.id = iu.order_id \
         WHERE  iu.product_id = ?1 \
         ORDER  BY iu.id ASC",
    )
    .bind(product_id)
    .fetch_all(pool)
    .await?;
    Ok(rows)
}

// ─────────────────────────────────────────────────────────
// Referral links
// ─────────────────────────────────────────────────────────

const LINK_COLUMNS: &str = "id, user_id, code, clicks, orders, revenue, active, created_at";

pub async fn get_link_by_user(pool: &SqlitePool, user_id: i64) -> Result<Option<ReferralLink>> {
    let sql = format!("SELECT {LINK_COLUMNS} FROM referral_links WHERE user_id = ?1");
    let row = sqlx::query_as::<_, ReferralLink>(&sql)
        .bind(user_id)
        .fetch_optional(pool)
        .await?;
    Ok(row)
}

pub async fn get_link_by_code(pool: &SqlitePool, code: &str) -> Result<Option<ReferralLink>> {
    let sql = format!("SELECT {LINK_COLUMNS} FROM referral_links WHERE code = ?1");
    let row = sqlx::query_as::<_, ReferralLink>(&sql)
        .bind(code)
        .fetch_optional(pool)
        .await?;
    Ok(row)
}

pub async fn insert_link(pool: &SqlitePool, user_id: i64, code: &str) -> Result<ReferralLink> {
    let id = sqlx::query(
        "INSERT INTO referral_links (user_id, code, active, created_at) VALUES (?1, ?2, 1, ?3)",
    )
    .bind(user_id)
    .bind(code)
    .bind(now())
    .execute(pool)
    .await?
    .last_insert_rowid();

    let sql = format!("SELECT {LINK_COLUMNS} FROM referral_links WHERE id = ?1");
    sqlx::query_as::<_, ReferralLink>(&sql)
        .bind(id)
        .fetch_optional(pool)
        .await?
        .ok_or_else(|| AppError::NotFound(format!("referral link {id}")))
}

/// Link visit: bumps the click counter of an active link only.
/// Returns whether a link matched.
pub async fn increment_clicks(pool: &SqlitePool, code: &str) -> Result<bool> {
    let n = sqlx::query("UPDATE referral_links SET clicks = clicks + 1 WHERE code = ?1 AND active = 1")
        .bind(code)
        .execute(pool)
        .await?
        .rows_affected();
    Ok(n > 0)
}

/// Attribution event at order creation: bump the link's order and revenue
/// counters. The commission engine never touches these.
pub async fn record_attribution(
    conn: &mut SqliteConnection,
    code: &str,
    amount: i64,
) -> Result<()> {
    sqlx::query(
        "UPDATE referral_links SET orders = orders + 1, revenue = revenue + ?1 \
         WHERE code = ?2 AND active = 1",
    )
    .bind(amount)
    .bind(code)
    .execute(&mut *conn)
    .await?;
    Ok(())
}

/// Link stats of a principal's direct subordinates.
pub async fn subordinate_link_stats(
    pool: &SqlitePool,
    parent_id: i64,
) -> Result<Vec<SubordinateLinkStats>> {
    let rows = sqlx::query_as::<_, SubordinateLinkStats>(
        "SELECT u.id AS user_id, u.name, u.email, l.code, l.clicks, l.orders, l.revenue \
         FROM   users u \
         JOIN   referral_links l ON l.user_id = u.id \
         WHERE  u.parent_id = ?1 \
         ORDER  BY u.id ASC",
    )
    .bind(parent_id)
    .fetch_all(pool)
    .await?;
    Ok(rows)
}

// ─────────────────────────────────────────────────────────
// Commissions
// ─────────────────────────────────────────────────────────

const COMMISSION_COLUMNS: &str = "id, user_id, order_id, level, percent, amount, status, created_at";

pub async fn list_commissions_for_user(pool: &SqlitePool, user_id: i64) -> Result<Vec<Commission>> {
    let sql = format!(
        "SELECT {COMMISSION_COLUMNS} FROM commissions WHERE user_id = ?1 ORDER BY id DESC"
    );
    let rows = sqlx::query_as::<_, Commission>(&sql)
        .bind(user_id)
        .fetch_all(pool)
        .await?;
    Ok(rows)
}

pub async fn list_commissions_for_order(
    pool: &SqlitePool,
    order_id: i64,
) -> Result<Vec<Commission>> {
    let sql = format!(
        "SELECT {COMMISSION_COLUMNS} FROM commissions WHERE order_id = ?1 ORDER BY level ASC"
    );
    let rows = sqlx::query_as::<_, Commission>(&sql)
        .bind(order_id)
        .fetch_all(pool)
        .await?;
    Ok(rows)
}

// ─────────────────────────────────────────────────────────
// Settings
// ─────────────────────────────────────────────────────────

pub async fn get_setting(conn: &mut SqliteConnection, key: &str) -> Result<Option<String>> {
    let row: Option<(String,)> = sqlx::query_as("SELECT value FROM settings WHERE key = ?1")
        .bind(key)
        .fetch_optional(&mut *conn)
        .await?;
    Ok(row.map(|(v,)| v))
}

pub async fn upsert_setting(pool: &SqlitePool, key: &str, value: &str) -> Result<()> {
    sqlx::query(
        "INSERT INTO settings (key, value) VALUES (?1, ?2) \
         ON CONFLICT(key) DO UPDATE SET value = excluded.value",
    )
    .bind(key)
    .bind(value)
    .execute(pool)
    .await?;
    Ok(())
}

pub async fn list_commission_settings(pool: &SqlitePool) -> Result<Vec<CommissionSetting>> {
    let rows = sqlx::query_as::<_, CommissionSetting>(
        "SELECT role, kind, percent FROM commission_settings ORDER BY role ASC",
    )
    .fetch_all(pool)
    .await?;
    Ok(rows)
}

pub async fn upsert_commission_setting(
    pool: &SqlitePool,
    role: Role,
    percent: f64,
) -> Result<()> {
    sqlx::query(
        "INSERT INTO commission_settings (role, kind, percent) VALUES (?1, 'retail', ?2) \
         ON CONFLICT(role) DO UPDATE SET percent = excluded.percent",
    )
    .bind(role.as_str())
    .bind(percent)
    .execute(pool)
    .await?;
    Ok(())
}
