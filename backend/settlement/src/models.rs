//! Row and wire types shared across the service.
//!
//! Enums are stored as short identifier strings in SQLite; each carries an
//! `as_str`/`parse` pair so handlers and queries agree on the encoding.

use serde::{Deserialize, Serialize};

// ─────────────────────────────────────────────────────────
// Enumerations
// ─────────────────────────────────────────────────────────

/// Principal roles. `ctv`, `agent` and `distributor` are the referrer tiers
/// (lowest first); they are the only roles eligible for a referral link.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    Customer,
    Ctv,
    Agent,
    Distributor,
    Admin,
}

impl Role {
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "customer" => Some(Self::Customer),
            "ctv" => Some(Self::Ctv),
            "agent" => Some(Self::Agent),
            "distributor" => Some(Self::Distributor),
            "admin" => Some(Self::Admin),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Customer => "customer",
            Self::Ctv => "ctv",
            Self::Agent => "agent",
            Self::Distributor => "distributor",
            Self::Admin => "admin",
        }
    }

    /// Referrer tiers may hold a referral link.
    pub fn can_hold_link(&self) -> bool {
        matches!(self, Self::Ctv | Self::Agent | Self::Distributor)
    }

    /// Roles permitted to read their direct subordinates' link stats.
    pub fn can_view_subordinates(&self) -> bool {
        matches!(self, Self::Agent | Self::Distributor | Self::Admin)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OrderStatus {
    Pending,
    Confirmed,
    InProgress,
    Completed,
    Cancelled,
}

impl OrderStatus {
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(Self::Pending),
            "confirmed" => Some(Self::Confirmed),
            "in_progress" => Some(Self::InProgress),
            "completed" => Some(Self::Completed),
            "cancelled" => Some(Self::Cancelled),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Confirmed => "confirmed",
            Self::InProgress => "in_progress",
            Self::Completed => "completed",
            Self::Cancelled => "cancelled",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Cancelled)
    }

    /// Monotonic lifecycle: pending → confirmed → in_progress → completed,
    /// with cancellation allowed from any non-terminal state.
    pub fn can_transition_to(&self, next: OrderStatus) -> bool {
        match (self, next) {
            (Self::Pending, Self::Confirmed) => true,
            (Self::Confirmed, Self::InProgress) => true,
            (Self::InProgress, Self::Completed) => true,
            (s, Self::Cancelled) if !s.is_terminal() => true,
            _ => false,
        }
    }
}

/// Product tier, derived from keyword inspection of an order's notes.
/// Premium tiers are fulfilled from a dedicated delivery link in global
/// settings instead of the per-product inventory pool.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Tier {
    Standard,
    Gold,
    Platinum,
}

impl Tier {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Standard => "standard",
            Self::Gold => "gold",
            Self::Platinum => "platinum",
        }
    }

    /// Settings key holding the tier's dedicated delivery link.
    pub fn delivery_link_key(&self) -> Option<&'static str> {
        match self {
            Self::Standard => None,
            Self::Gold => Some("gold_delivery_link"),
            Self::Platinum => Some("platinum_delivery_link"),
        }
    }
}

// ─────────────────────────────────────────────────────────
// Rows
// ─────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct User {
    pub id: i64,
    pub email: String,
    pub name: String,
    pub role: String,
    pub parent_id: Option<i64>,
    pub balance: i64,
    pub created_at: i64,
}

impl User {
    pub fn role(&self) -> Option<Role> {
        Role::parse(&self.role)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct Product {
    pub id: i64,
    pub name: String,
    pub price: i64,
    pub created_at: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct Order {
    pub id: i64,
    pub code: String,
    pub product_id: i64,
    pub price: i64,
    pub quantity: i64,
    pub status: String,
    pub notes: String,
    pub buyer_email: String,
    pub referrer_id: Option<i64>,
    pub referral_code: Option<String>,
    pub created_at: i64,
    pub updated_at: i64,
}

impl Order {
    pub fn status(&self) -> Option<OrderStatus> {
        OrderStatus::parse(&self.status)
    }

    /// Order value used for the amount gate, attribution counters and the
    /// commission base.
    pub fn total(&self) -> i64 {
        self.price * self.quantity
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct InventoryUnit {
    pub id: i64,
    pub product_id: i64,
    pub credential: String,
    pub used: bool,
    pub order_id: Option<i64>,
    pub created_at: i64,
}

/// Inventory unit joined with its bound order's code, for the admin audit
/// listing.
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct InventoryUnitAudit {
    pub id: i64,
    pub product_id: i64,
    pub credential: String,
    pub used: bool,
    pub order_id: Option<i64>,
    pub order_code: Option<String>,
    pub created_at: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct ReferralLink {
    pub id: i64,
    pub user_id: i64,
    pub code: String,
    pub clicks: i64,
    pub orders: i64,
    pub revenue: i64,
    pub active: bool,
    pub created_at: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct CommissionSetting {
    pub role: String,
    pub kind: String,
    pub percent: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct Commission {
    pub id: i64,
    pub user_id: i64,
    pub order_id: i64,
    pub level: i64,
    pub percent: f64,
    pub amount: i64,
    pub status: String,
    pub created_at: i64,
}

/// One direct subordinate's link performance, as returned to upward-permitted
/// roles.
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct SubordinateLinkStats {
    pub user_id: i64,
    pub name: String,
    pub email: String,
    pub code: String,
    pub clicks: i64,
    pub orders: i64,
    pub revenue: i64,
}

// ─────────────────────────────────────────────────────────
// Unit tests
// ─────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn role_round_trip() {
        for s in ["customer", "ctv", "agent", "distributor", "admin"] {
            assert_eq!(Role::parse(s).unwrap().as_str(), s);
        }
        assert_eq!(Role::parse("manager"), None);
    }

    #[test]
    fn link_eligibility_by_role() {
        assert!(!Role::Customer.can_hold_link());
        assert!(Role::Ctv.can_hold_link());
        assert!(Role::Agent.can_hold_link());
        assert!(Role::Distributor.can_hold_link());
        assert!(!Role::Admin.can_hold_link());
    }

    #[test]
    fn status_transitions_monotonic() {
        use OrderStatus::*;
        assert!(Pending.can_transition_to(Confirmed));
        assert!(Confirmed.can_transition_to(InProgress));
        assert!(InProgress.can_transition_to(Completed));

        assert!(Pending.can_transition_to(Cancelled));
        assert!(Confirmed.can_transition_to(Cancelled));
        assert!(InProgress.can_transition_to(Cancelled));

        assert!(!Confirmed.can_transition_to(Pending));
        assert!(!Pending.can_transition_to(Completed));
        assert!(!Completed.can_transition_to(Cancelled));
        assert!(!Cancelled.can_transition_to(Confirmed));
        assert!(!Pending.can_transition_to(Pending));
    }

    #[test]
    fn tier_delivery_link_keys() {
        assert_eq!(Tier::Standard.delivery_link_key(), None);
        assert_eq!(Tier::Gold.delivery_link_key(), Some("gold_delivery_link"));
        assert_eq!(
            Tier::Platinum.delivery_link_key(),
            Some("platinum_delivery_link")
        );
    }
}
