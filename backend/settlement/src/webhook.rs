//! Payment confirmation ingestor — the bank-transfer webhook.
//!
//! Split into three steps:
//! * **decide** — pure: parse the transfer content, match an order, verify
//!   the amount. No side effects, unit-testable without a datastore.
//! * **apply** — one atomic transaction: delivery resolution (inventory
//!   claim or premium link lookup) and the pending→confirmed flip commit
//!   together or not at all.
//! * **notify** — best-effort follow-ups (account provisioning, commission
//!   settlement) that run after the commit and may fail independently.
//!
//! The gateway delivers at least once and possibly concurrently; the
//! status guard in the apply step is what makes redelivery harmless.

use std::sync::Arc;

use axum::extract::State;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::Deserialize;
use sqlx::SqlitePool;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::api::ApiState;
use crate::commission;
use crate::db;
use crate::errors::{AppError, Result};
use crate::inventory::{self, ClaimOutcome};
use crate::models::{Order, OrderStatus, Role, Tier};

/// Order codes look like `BOT` + `ddmmyy` + 5 alphanumerics.
pub const ORDER_CODE_PREFIX: &str = "BOT";
const ORDER_DATE_DIGITS: usize = 6;
const ORDER_SUFFIX_LEN: usize = 5;

const TRANSFER_IN: &str = "in";

// ─────────────────────────────────────────────────────────
// Gateway payload
// ─────────────────────────────────────────────────────────

/// Inbound bank-transfer notification. Gateway metadata beyond the three
/// fields the ingestor reads is accepted and ignored.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BankTransferNotification {
    #[serde(default)]
    pub gateway: Option<String>,
    #[serde(default)]
    pub transaction_date: Option<String>,
    #[serde(default)]
    pub account_number: Option<String>,
    #[serde(default)]
    pub reference_code: Option<String>,
    /// Free-text transfer description; carries the order code.
    #[serde(default)]
    pub content: String,
    /// `"in"` for customer payments, `"out"` for outbound transfers.
    pub transfer_type: String,
    pub transfer_amount: i64,
}

// ─────────────────────────────────────────────────────────
// Pure helpers
// ─────────────────────────────────────────────────────────

/// Extract an order code from free-text transfer content.
/// Matching is case-insensitive; the result is uppercased.
pub fn parse_order_code(content: &str) -> Option<String> {
    let bytes = content.as_bytes();
    let prefix = ORDER_CODE_PREFIX.as_bytes();
    let code_len = prefix.len() + ORDER_DATE_DIGITS + ORDER_SUFFIX_LEN;

    if bytes.len() < code_len {
        return None;
    }

    for start in 0..=bytes.len() - code_len {
        let candidate = &bytes[start..start + code_len];
        if !candidate[..prefix.len()].eq_ignore_ascii_case(prefix) {
            continue;
        }
        let digits = &candidate[prefix.len()..prefix.len() + ORDER_DATE_DIGITS];
        if !digits.iter().all(u8::is_ascii_digit) {
            continue;
        }
        let suffix = &candidate[prefix.len() + ORDER_DATE_DIGITS..];
        if !suffix.iter().all(u8::is_ascii_alphanumeric) {
            continue;
        }
        return Some(String::from_utf8_lossy(candidate).to_uppercase());
    }

    None
}

/// Generate a fresh order code for checkout, in the same shape the parser
/// recognises.
pub fn generate_order_code() -> String {
    let date = chrono::Utc::now().format("%d%m%y");
    let hex = Uuid::new_v4().simple().to_string();
    format!(
        "{ORDER_CODE_PREFIX}{date}{}",
        hex[..ORDER_SUFFIX_LEN].to_uppercase()
    )
}

/// Tier classification by keyword inspection of the order's notes.
/// Substring collisions are a known limitation of this encoding.
pub fn classify_tier(notes: &str) -> Tier {
    let lowered = notes.to_lowercase();
    if lowered.contains("platinum") {
        Tier::Platinum
    } else if lowered.contains("gold") {
        Tier::Gold
    } else {
        Tier::Standard
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Decision {
    AlreadyProcessed,
    AmountMismatch { expected: i64, received: i64 },
    Confirm { tier: Tier },
}

/// Pure verification step over a matched order.
pub fn decide(order: &Order, received: i64, tolerance: i64) -> Decision {
    if order.status() != Some(OrderStatus::Pending) {
        return Decision::AlreadyProcessed;
    }

    let expected = order.total();
    if (received - expected).abs() > tolerance {
        return Decision::AmountMismatch { expected, received };
    }

    Decision::Confirm {
        tier: classify_tier(&order.notes),
    }
}

// ─────────────────────────────────────────────────────────
// Apply — the one atomic transaction
// ─────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ApplyOutcome {
    Confirmed { delivery_note: String },
    AlreadyProcessed,
}

/// Resolve delivery and flip the order to `confirmed` in one transaction.
///
/// The status write is guarded on `status = 'pending'`; zero affected rows
/// means a concurrent delivery won, and dropping the transaction rolls the
/// inventory claim back with it.
pub async fn apply(pool: &SqlitePool, order: &Order, tier: Tier) -> Result<ApplyOutcome> {
    let mut tx = pool.begin().await?;

    let delivery_note = match tier.delivery_link_key() {
        Some(key) => match db::get_setting(&mut tx, key).await? {
            Some(link) => format!("Delivery: {link}"),
            None => {
                warn!(
                    "No {} delivery link configured (order {})",
                    tier.as_str(),
                    order.code
                );
                format!("Delivery pending: {} link unset", tier.as_str())
            }
        },
        None => match inventory::claim_unit(&mut tx, order.product_id, order.id).await? {
            ClaimOutcome::Claimed { credential } | ClaimOutcome::Shared { credential } => {
                format!("Delivery: {credential}")
            }
            ClaimOutcome::Exhausted => "Delivery pending: inventory exhausted".to_string(),
        },
    };

    let updated = sqlx::query(
        "UPDATE orders \
         SET status = 'confirmed', \
             notes = CASE WHEN notes = '' THEN ?1 ELSE notes || char(10) || ?1 END, \
             updated_at = ?2 \
         WHERE id = ?3 AND status = 'pending'",
    )
    .bind(&delivery_note)
    .bind(db::now())
    .bind(order.id)
    .execute(&mut *tx)
    .await?
    .rows_affected();

    if updated == 0 {
        return Ok(ApplyOutcome::AlreadyProcessed);
    }

    tx.commit().await?;
    Ok(ApplyOutcome::Confirmed { delivery_note })
}

// ─────────────────────────────────────────────────────────
// Notify — best-effort follow-ups
// ─────────────────────────────────────────────────────────

/// Post-commit follow-ups. Failures are logged and swallowed; a confirmed
/// payment is never unwound by fulfillment- or accounting-side trouble.
pub async fn notify(pool: &SqlitePool, order: &Order) {
    match provision_account(pool, order).await {
        Ok(true) => info!("Account provisioned for {}", order.buyer_email),
        Ok(false) => {}
        Err(e) => error!(
            "Account provisioning failed for order {}: {e}",
            order.code
        ),
    }

    if order.referrer_id.is_some() {
        if let Err(e) = commission::settle_order(pool, order).await {
            error!("Commission settlement failed for order {}: {e}", order.code);
        }
    }
}

async fn provision_account(pool: &SqlitePool, order: &Order) -> Result<bool> {
    if db::get_user_by_email(pool, &order.buyer_email).await?.is_some() {
        return Ok(false);
    }

    db::insert_user(pool, &order.buyer_email, "", Role::Customer, None).await?;
    db::append_order_note(
        pool,
        order.id,
        &format!("Account provisioned: {}", order.buyer_email),
    )
    .await?;
    Ok(true)
}

// ─────────────────────────────────────────────────────────
// HTTP handler
// ─────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum WebhookOutcome {
    Ignored(&'static str),
    AlreadyProcessed,
    Confirmed,
}

impl WebhookOutcome {
    fn message(&self) -> &'static str {
        match self {
            Self::Ignored(reason) => reason,
            Self::AlreadyProcessed => "already processed",
            Self::Confirmed => "order confirmed",
        }
    }
}

/// `POST /webhook/bank`
///
/// 200 for classified no-ops and successful confirmation (unrelated bank
/// activity must never surface as an error), 400 on amount mismatch, 500
/// only on unexpected internal failure so the gateway retries.
pub async fn handle_bank_webhook(
    State(state): State<Arc<ApiState>>,
    Json(notification): Json<BankTransferNotification>,
) -> Response {
    match process(&state, &notification).await {
        Ok(outcome) => (
            StatusCode::OK,
            Json(serde_json::json!({ "success": true, "message": outcome.message() })),
        )
            .into_response(),
        Err(e) => e.into_response(),
    }
}

async fn process(
    state: &ApiState,
    notification: &BankTransferNotification,
) -> Result<WebhookOutcome> {
    if notification.transfer_type != TRANSFER_IN {
        return Ok(WebhookOutcome::Ignored("outbound transfer"));
    }

    let Some(code) = parse_order_code(&notification.content) else {
        debug!("No order code in transfer content, ignoring");
        return Ok(WebhookOutcome::Ignored("no order code"));
    };

    let Some(order) = db::get_order_by_code(&state.pool, &code).await? else {
        debug!("Transfer references unknown order {code}, ignoring");
        return Ok(WebhookOutcome::Ignored("unknown order"));
    };

    match decide(&order, notification.transfer_amount, state.config.amount_tolerance) {
        Decision::AlreadyProcessed => Ok(WebhookOutcome::AlreadyProcessed),
        Decision::AmountMismatch { expected, received } => {
            warn!(
                "Amount mismatch for order {}: expected {expected}, received {received}",
                order.code
            );
            Err(AppError::AmountMismatch {
                expected,
                received,
                tolerance: state.config.amount_tolerance,
            })
        }
        Decision::Confirm { tier } => match apply(&state.pool, &order, tier).await? {
            ApplyOutcome::AlreadyProcessed => Ok(WebhookOutcome::AlreadyProcessed),
            ApplyOutcome::Confirmed { .. } => {
                info!("Order {} confirmed ({} tier)", order.code, tier.as_str());
                // Reload so notify sees the appended delivery note.
                let order = db::get_order(&state.pool, order.id).await?.unwrap_or(order);
                notify(&state.pool, &order).await;
                Ok(WebhookOutcome::Confirmed)
            }
        },
    }
}

// ─────────────────────────────────────────────────────────
// Unit tests
// ─────────────────────────────────────────────────────────
