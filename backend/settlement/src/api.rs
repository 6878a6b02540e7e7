//! Axum REST API — router, role gate, and the CRUD-ish handlers around
//! the settlement core.
//!
//! Authentication mechanics live upstream; handlers trust the `x-user-id`
//! header and enforce roles against the users table.

use std::sync::Arc;

use axum::extract::{Path, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::IntoResponse;
use axum::routing::{delete, get, post, put};
use axum::{Json, Router};
use serde::Deserialize;
use sqlx::SqlitePool;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

use crate::config::Config;
use crate::db;
use crate::errors::{AppError, Result};
use crate::inventory;
use crate::models::{OrderStatus, Role, User};
use crate::referral;
use crate::webhook;

#[derive(Clone)]
pub struct ApiState {
    pub pool: SqlitePool,
    pub config: Config,
}

pub fn router(state: Arc<ApiState>) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/webhook/bank", post(webhook::handle_bank_webhook))
        .route("/orders", post(create_order))
        .route("/orders/:code", get(get_order))
        .route("/orders/:code/status", put(update_order_status))
        .route("/products", get(list_products).post(create_product))
        .route(
            "/products/:id/inventory",
            get(list_inventory).post(add_inventory_unit),
        )
        .route("/products/:id/shared-link", put(relink_shared))
        .route("/inventory/:id", delete(delete_inventory_unit))
        .route("/referral/link", post(create_referral_link))
        .route("/referral/link/stats", get(referral_link_stats))
        .route("/referral/subordinates/stats", get(subordinate_stats))
        .route("/r/:code", get(visit_referral_link))
        .route(
            "/settings/commissions",
            get(get_commission_settings).put(put_commission_settings),
        )
        .route("/settings/delivery-links", put(put_delivery_links))
        .route("/users", post(create_user))
        .route("/users/:id/parent", put(set_user_parent))
        .route("/users/:id/commissions", get(list_user_commissions))
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

// ─────────────────────────────────────────────────────────
// Role gate
// ─────────────────────────────────────────────────────────

async fn current_user(state: &ApiState, headers: &HeaderMap) -> Result<User> {
    let id = headers
        .get("x-user-id")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.parse::<i64>().ok())
        .ok_or_else(|| AppError::Forbidden("missing or invalid x-user-id header".to_string()))?;

    db::get_user(&state.pool, id)
        .await?
        .ok_or_else(|| AppError::Forbidden(format!("unknown user {id}")))
}

async fn require_admin(state: &ApiState, headers: &HeaderMap) -> Result<User> {
    let user = current_user(state, headers).await?;
    if user.role() != Some(Role::Admin) {
        return Err(AppError::Forbidden("administrator role required".to_string()));
    }
    Ok(user)
}

// ─────────────────────────────────────────────────────────
// Health
// ─────────────────────────────────────────────────────────

/// `GET /health`
pub async fn health() -> impl IntoResponse {
    Json(serde_json::json!({
        "status": "ok",
        "version": env!("CARGO_PKG_VERSION"),
    }))
}

// ─────────────────────────────────────────────────────────
// Orders
// ─────────────────────────────────────────────────────────

fn default_quantity() -> i64 {
    1
}

#[derive(Debug, Deserialize)]
pub struct CheckoutRequest {
    pub product_id: i64,
    #[serde(default = "default_quantity")]
    pub quantity: i64,
    pub buyer_email: String,
    #[serde(default)]
    pub notes: String,
    #[serde(default)]
    pub referral_code: Option<String>,
}

/// `POST /orders`
///
/// Checkout: creates a `pending` order with a generated code and fixes
/// referral attribution. An unknown or inactive referral code attributes
/// nothing and is dropped silently.
pub async fn create_order(
    State(state): State<Arc<ApiState>>,
    Json(req): Json<CheckoutRequest>,
) -> Result<impl IntoResponse> {
    if req.quantity < 1 {
        return Err(AppError::Validation("quantity must be at least 1".to_string()));
    }
    if req.buyer_email.trim().is_empty() {
        return Err(AppError::Validation("buyer_email is required".to_string()));
    }

    let product = db::get_product(&state.pool, req.product_id)
        .await?
        .ok_or_else(|| AppError::NotFound(format!("product {}", req.product_id)))?;

    let referral = match req.referral_code.as_deref().map(str::trim) {
        Some(code) if !code.is_empty() => referral::resolve_referrer(&state.pool, code)
            .await?
            .map(|user_id| (code.to_string(), user_id)),
        _ => None,
    };

    let total = product.price * req.quantity;
    let mut tx = state.pool.begin().await?;

    let mut order_id = None;
    for _ in 0..5 {
        let code = webhook::generate_order_code();
        match db::insert_order(
            &mut tx,
            &code,
            product.id,
            product.price,
            req.quantity,
            &req.notes,
            &req.buyer_email,
            referral.as_ref().map(|(_, id)| *id),
            referral.as_ref().map(|(code, _)| code.as_str()),
        )
        .await
        {
            Ok(id) => {
                order_id = Some(id);
                break;
            }
            Err(AppError::Database(sqlx::Error::Database(e))) if e.is_unique_violation() => {
                continue;
            }
            Err(e) => return Err(e),
        }
    }
    let order_id = order_id.ok_or(AppError::CodeExhausted(5))?;

    if let Some((code, _)) = &referral {
        db::record_attribution(&mut tx, code, total).await?;
    }

    tx.commit().await?;

    let order = db::get_order(&state.pool, order_id)
        .await?
        .ok_or_else(|| AppError::NotFound(format!("order {order_id}")))?;
    Ok((StatusCode::CREATED, Json(order)))
}

/// `GET /orders/:code`
pub async fn get_order(
    State(state): State<Arc<ApiState>>,
    Path(code): Path<String>,
) -> Result<impl IntoResponse> {
    let order = db::get_order_by_code(&state.pool, &code)
        .await?
        .ok_or_else(|| AppError::NotFound(format!("order {code}")))?;
    Ok(Json(order))
}

#[derive(Debug, Deserialize)]
pub struct StatusUpdateRequest {
    pub status: String,
}

/// `PUT /orders/:code/status`
///
/// Manual admin transition. Confirmation goes through the same fulfillment
/// pipeline as the webhook, including the commission duplicate-guard.
pub async fn update_order_status(
    State(state): State<Arc<ApiState>>,
    Path(code): Path<String>,
    headers: HeaderMap,
    Json(req): Json<StatusUpdateRequest>,
) -> Result<impl IntoResponse> {
    require_admin(&state, &headers).await?;

    let target = OrderStatus::parse(&req.status)
        .ok_or_else(|| AppError::Validation(format!("unknown status {}", req.status)))?;
    let order = db::get_order_by_code(&state.pool, &code)
        .await?
        .ok_or_else(|| AppError::NotFound(format!("order {code}")))?;
    let current = order.status().ok_or_else(|| {
        AppError::Validation(format!("order {code} has unknown status {}", order.status))
    })?;

    if !current.can_transition_to(target) {
        return Err(AppError::InvalidTransition {
            from: order.status.clone(),
            to: req.status,
        });
    }

    if target == OrderStatus::Confirmed {
        let tier = webhook::classify_tier(&order.notes);
        match webhook::apply(&state.pool, &order, tier).await? {
            webhook::ApplyOutcome::AlreadyProcessed => {
                return Err(AppError::Conflict(format!(
                    "order {code} was confirmed concurrently"
                )));
            }
            webhook::ApplyOutcome::Confirmed { .. } => {
                let fresh = db::get_order(&state.pool, order.id).await?.unwrap_or(order);
                webhook::notify(&state.pool, &fresh).await;
            }
        }
    } else if !db::update_order_status(&state.pool, order.id, current, target).await? {
        return Err(AppError::Conflict(format!("order {code} changed concurrently")));
    }

    let order = db::get_order_by_code(&state.pool, &code)
        .await?
        .ok_or_else(|| AppError::NotFound(format!("order {code}")))?;
    Ok(Json(order))
}

// ─────────────────────────────────────────────────────────
// Products & inventory administration
// ─────────────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
pub struct CreateProductRequest {
    pub name: String,
    pub price: i64,
}

/// `POST /products`
pub async fn create_product(
    State(state): State<Arc<ApiState>>,
    headers: HeaderMap,
    Json(req): Json<CreateProductRequest>,
) -> Result<impl IntoResponse> {
    require_admin(&state, &headers).await?;
    if req.price < 0 {
        return Err(AppError::Validation("price must not be negative".to_string()));
    }
    let product = db::insert_product(&state.pool, &req.name, req.price).await?;
    Ok((StatusCode::CREATED, Json(product)))
}

/// `GET /products`
pub async fn list_products(State(state): State<Arc<ApiState>>) -> Result<impl IntoResponse> {
    let products = db::list_products(&state.pool).await?;
    Ok(Json(products))
}

/// `GET /products/:id/inventory`
///
/// Units joined with the bound order code, for audit.
pub async fn list_inventory(
    State(state): State<Arc<ApiState>>,
    Path(product_id): Path<i64>,
    headers: HeaderMap,
) -> Result<impl IntoResponse> {
    require_admin(&state, &headers).await?;
    let units = db::list_units_with_orders(&state.pool, product_id).await?;
    Ok(Json(units))
}

#[derive(Debug, Deserialize)]
pub struct AddUnitRequest {
    pub credential: String,
}

/// `POST /products/:id/inventory`
pub async fn add_inventory_unit(
    State(state): State<Arc<ApiState>>,
    Path(product_id): Path<i64>,
    headers: HeaderMap,
    Json(req): Json<AddUnitRequest>,
) -> Result<impl IntoResponse> {
    require_admin(&state, &headers).await?;
    if req.credential.trim().is_empty() {
        return Err(AppError::Validation("credential is required".to_string()));
    }
    if db::get_product(&state.pool, product_id).await?.is_none() {
        return Err(AppError::NotFound(format!("product {product_id}")));
    }
    let unit = db::insert_unit(&state.pool, product_id, req.credential.trim()).await?;
    Ok((StatusCode::CREATED, Json(unit)))
}

/// `DELETE /inventory/:id`
pub async fn delete_inventory_unit(
    State(state): State<Arc<ApiState>>,
    Path(id): Path<i64>,
    headers: HeaderMap,
) -> Result<impl IntoResponse> {
    require_admin(&state, &headers).await?;
    if !db::delete_unit(&state.pool, id).await? {
        return Err(AppError::NotFound(format!("inventory unit {id}")));
    }
    Ok(StatusCode::NO_CONTENT)
}

/// `PUT /products/:id/shared-link`
pub async fn relink_shared(
    State(state): State<Arc<ApiState>>,
    Path(product_id): Path<i64>,
    headers: HeaderMap,
    Json(req): Json<AddUnitRequest>,
) -> Result<impl IntoResponse> {
    require_admin(&state, &headers).await?;
    if db::get_product(&state.pool, product_id).await?.is_none() {
        return Err(AppError::NotFound(format!("product {product_id}")));
    }
    let unit = inventory::relink_shared(&state.pool, product_id, req.credential.trim()).await?;
    Ok(Json(unit))
}

// ─────────────────────────────────────────────────────────
// Referral links
// ─────────────────────────────────────────────────────────

/// `POST /referral/link` — fetch-or-create the caller's link.
pub async fn create_referral_link(
    State(state): State<Arc<ApiState>>,
    headers: HeaderMap,
) -> Result<impl IntoResponse> {
    let user = current_user(&state, &headers).await?;
    let link = referral::fetch_or_create_link(&state.pool, &user).await?;
    Ok(Json(link))
}

/// `GET /referral/link/stats` — the caller's aggregate counters.
pub async fn referral_link_stats(
    State(state): State<Arc<ApiState>>,
    headers: HeaderMap,
) -> Result<impl IntoResponse> {
    let user = current_user(&state, &headers).await?;
    let link = db::get_link_by_user(&state.pool, user.id)
        .await?
        .ok_or_else(|| AppError::NotFound(format!("no referral link for user {}", user.id)))?;
    Ok(Json(link))
}

/// `GET /referral/subordinates/stats`
pub async fn subordinate_stats(
    State(state): State<Arc<ApiState>>,
    headers: HeaderMap,
) -> Result<impl IntoResponse> {
    let user = current_user(&state, &headers).await?;
    let permitted = user.role().map(|r| r.can_view_subordinates()).unwrap_or(false);
    if !permitted {
        return Err(AppError::Forbidden(format!(
            "role {} cannot view subordinate stats",
            user.role
        )));
    }
    let stats = db::subordinate_link_stats(&state.pool, user.id).await?;
    Ok(Json(stats))
}

/// `GET /r/:code` — a link visit bumps the click counter only.
pub async fn visit_referral_link(
    State(state): State<Arc<ApiState>>,
    Path(code): Path<String>,
) -> Result<impl IntoResponse> {
    if !db::increment_clicks(&state.pool, &code).await? {
        return Err(AppError::NotFound(format!("referral link {code}")));
    }
    Ok(Json(serde_json::json!({ "success": true })))
}

// ─────────────────────────────────────────────────────────
// Settings
// ─────────────────────────────────────────────────────────

/// `GET /settings/commissions`
pub async fn get_commission_settings(
    State(state): State<Arc<ApiState>>,
    headers: HeaderMap,
) -> Result<impl IntoResponse> {
    require_admin(&state, &headers).await?;
    let settings = db::list_commission_settings(&state.pool).await?;
    Ok(Json(settings))
}

#[derive(Debug, Deserialize)]
pub struct RateUpdate {
    pub role: String,
    pub percent: f64,
}

/// `PUT /settings/commissions`
///
/// Takes effect for subsequent settlements only; existing commission rows
/// are never touched.
pub async fn put_commission_settings(
    State(state): State<Arc<ApiState>>,
    headers: HeaderMap,
    Json(updates): Json<Vec<RateUpdate>>,
) -> Result<impl IntoResponse> {
    require_admin(&state, &headers).await?;

    for update in &updates {
        let role = Role::parse(&update.role)
            .filter(|r| r.can_hold_link())
            .ok_or_else(|| {
                AppError::Validation(format!("{} is not a referrer tier", update.role))
            })?;
        if !(0.0..=100.0).contains(&update.percent) {
            return Err(AppError::Validation(format!(
                "percent for {} must be between 0 and 100",
                update.role
            )));
        }
        db::upsert_commission_setting(&state.pool, role, update.percent).await?;
    }

    let settings = db::list_commission_settings(&state.pool).await?;
    Ok(Json(settings))
}

#[derive(Debug, Deserialize)]
pub struct DeliveryLinksRequest {
    #[serde(default)]
    pub gold: Option<String>,
    #[serde(default)]
    pub platinum: Option<String>,
}

/// `PUT /settings/delivery-links` — premium tier delivery links.
pub async fn put_delivery_links(
    State(state): State<Arc<ApiState>>,
    headers: HeaderMap,
    Json(req): Json<DeliveryLinksRequest>,
) -> Result<impl IntoResponse> {
    require_admin(&state, &headers).await?;

    if let Some(link) = &req.gold {
        db::upsert_setting(&state.pool, "gold_delivery_link", link).await?;
    }
    if let Some(link) = &req.platinum {
        db::upsert_setting(&state.pool, "platinum_delivery_link", link).await?;
    }
    Ok(Json(serde_json::json!({ "success": true })))
}

// ─────────────────────────────────────────────────────────
// Principals
// ─────────────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
pub struct CreateUserRequest {
    pub email: String,
    #[serde(default)]
    pub name: String,
    pub role: String,
    #[serde(default)]
    pub parent_id: Option<i64>,
}

/// `POST /users`
pub async fn create_user(
    State(state): State<Arc<ApiState>>,
    headers: HeaderMap,
    Json(req): Json<CreateUserRequest>,
) -> Result<impl IntoResponse> {
    require_admin(&state, &headers).await?;

    let role = Role::parse(&req.role)
        .ok_or_else(|| AppError::Validation(format!("unknown role {}", req.role)))?;
    if req.email.trim().is_empty() {
        return Err(AppError::Validation("email is required".to_string()));
    }
    if let Some(parent_id) = req.parent_id {
        if db::get_user(&state.pool, parent_id).await?.is_none() {
            return Err(AppError::NotFound(format!("user {parent_id}")));
        }
    }

    let user =
        db::insert_user(&state.pool, req.email.trim(), &req.name, role, req.parent_id).await?;
    Ok((StatusCode::CREATED, Json(user)))
}

#[derive(Debug, Deserialize)]
pub struct SetParentRequest {
    #[serde(default)]
    pub parent_id: Option<i64>,
}

/// `PUT /users/:id/parent` — cycle-checked reassignment.
pub async fn set_user_parent(
    State(state): State<Arc<ApiState>>,
    Path(id): Path<i64>,
    headers: HeaderMap,
    Json(req): Json<SetParentRequest>,
) -> Result<impl IntoResponse> {
    require_admin(&state, &headers).await?;
    referral::assign_parent(&state.pool, id, req.parent_id).await?;
    let user = db::get_user(&state.pool, id)
        .await?
        .ok_or_else(|| AppError::NotFound(format!("user {id}")))?;
    Ok(Json(user))
}

/// `GET /users/:id/commissions` — admin or self.
pub async fn list_user_commissions(
    State(state): State<Arc<ApiState>>,
    Path(id): Path<i64>,
    headers: HeaderMap,
) -> Result<impl IntoResponse> {
    let caller = current_user(&state, &headers).await?;
    if caller.id != id && caller.role() != Some(Role::Admin) {
        return Err(AppError::Forbidden(
            "only administrators may read other principals' commissions".to_string(),
        ));
    }
    let rows = db::list_commissions_for_user(&state.pool, id).await?;
    Ok(Json(rows))
}

// ─────────────────────────────────────────────────────────
// Unit tests
// ─────────────────────────────────────────────────────────
