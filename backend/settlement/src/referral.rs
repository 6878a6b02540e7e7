//! Referral hierarchy & link registry.
//!
//! Each eligible principal owns at most one referral link with an immutable
//! code. Principals form a parent-pointer forest; the upward walk feeds the
//! commission engine. Cycles are rejected when a parent is assigned, so
//! read-time walks trust the pointer.

use sqlx::SqlitePool;
use tracing::info;
use uuid::Uuid;

use crate::db;
use crate::errors::{AppError, Result};
use crate::models::{ReferralLink, User};

pub const CODE_PREFIX: &str = "REF";
const CODE_SUFFIX_LEN: usize = 8;
const MAX_CODE_ATTEMPTS: usize = 5;

fn generate_code() -> String {
    let hex = Uuid::new_v4().simple().to_string();
    format!("{CODE_PREFIX}{}", hex[..CODE_SUFFIX_LEN].to_uppercase())
}

/// Fetch the principal's link, creating it on first request.
/// An existing active link is returned unchanged.
pub async fn fetch_or_create_link(pool: &SqlitePool, user: &User) -> Result<ReferralLink> {
    let eligible = user.role().map(|r| r.can_hold_link()).unwrap_or(false);
    if !eligible {
        return Err(AppError::Forbidden(format!(
            "role {} cannot hold a referral link",
            user.role
        )));
    }

    if let Some(link) = db::get_link_by_user(pool, user.id).await? {
        if link.active {
            return Ok(link);
        }
        return Err(AppError::Conflict(format!(
            "referral link {} is deactivated",
            link.code
        )));
    }

    for _ in 0..MAX_CODE_ATTEMPTS {
        let code = generate_code();
        match db::insert_link(pool, user.id, &code).await {
            Ok(link) => {
                info!("Referral link {} created for user {}", link.code, user.id);
                return Ok(link);
            }
            Err(AppError::Database(sqlx::Error::Database(e))) if e.is_unique_violation() => {
                // Either a code collision or a concurrent create for the
                // same principal; re-check the owner before retrying.
                if let Some(link) = db::get_link_by_user(pool, user.id).await? {
                    return Ok(link);
                }
            }
            Err(e) => return Err(e),
        }
    }

    Err(AppError::CodeExhausted(MAX_CODE_ATTEMPTS))
}

/// Resolve a referral code supplied at checkout to its owning principal.
/// Unknown or deactivated codes attribute nothing.
pub async fn resolve_referrer(pool: &SqlitePool, code: &str) -> Result<Option<i64>> {
    Ok(db::get_link_by_code(pool, code)
        .await?
        .filter(|l| l.active)
        .map(|l| l.user_id))
}

/// One entry of the referrer-first ancestor chain.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChainMember {
    pub user_id: i64,
    pub role: String,
    pub direct_subordinates: i64,
}

/// Walk parent pointers starting at the referrer, referrer first.
pub async fn ancestor_chain(pool: &SqlitePool, referrer_id: i64) -> Result<Vec<ChainMember>> {
    let mut chain = Vec::new();
    let mut cursor = Some(referrer_id);

    while let Some(id) = cursor {
        let Some(user) = db::get_user(pool, id).await? else {
            break;
        };
        let direct_subordinates = db::count_direct_subordinates(pool, id).await?;
        chain.push(ChainMember {
            user_id: user.id,
            role: user.role.clone(),
            direct_subordinates,
        });
        cursor = user.parent_id;
    }

    Ok(chain)
}

/// Reassign a principal's parent, rejecting assignments that would close a
/// cycle. Validation walks upward from the proposed parent; encountering
/// the child means the child would become its own ancestor.
pub async fn assign_parent(
    pool: &SqlitePool,
    child_id: i64,
    parent_id: Option<i64>,
) -> Result<()> {
    if db::get_user(pool, child_id).await?.is_none() {
        return Err(AppError::NotFound(format!("user {child_id}")));
    }

    if let Some(parent_id) = parent_id {
        if parent_id == child_id {
            return Err(AppError::CycleDetected(child_id));
        }
        let Some(parent) = db::get_user(pool, parent_id).await? else {
            return Err(AppError::NotFound(format!("user {parent_id}")));
        };

        let mut cursor = parent.parent_id;
        while let Some(id) = cursor {
            if id == child_id {
                return Err(AppError::CycleDetected(child_id));
            }
            cursor = db::get_user(pool, id).await?.and_then(|u| u.parent_id);
        }
    }

    db::set_user_parent(pool, child_id, parent_id).await
}

// ─────────────────────────────────────────────────────────
// Unit tests
// ─────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::Role;
    use crate::testutil;

    #[test]
    fn generated_codes_are_well_formed() {
        let code = generate_code();
        assert!(code.starts_with(CODE_PREFIX));
        assert_eq!(code.len(), CODE_PREFIX.len() + CODE_SUFFIX_LEN);
        assert!(code[CODE_PREFIX.len()..]
            .chars()
            .all(|c| c.is_ascii_uppercase() || c.is_ascii_digit()));
    }

    #[tokio::test]
    async fn fetch_or_create_is_idempotent() {
        let pool = testutil::pool().await;
        let ctv = testutil::seed_user(&pool, "ctv@test", Role::Ctv, None).await;

        let first = fetch_or_create_link(&pool, &ctv).await.unwrap();
        let second = fetch_or_create_link(&pool, &ctv).await.unwrap();

        assert_eq!(first.id, second.id);
        assert_eq!(first.code, second.code);
    }

    #[tokio::test]
    async fn customers_cannot_hold_links() {
        let pool = testutil::pool().await;
        let customer = testutil::seed_user(&pool, "buyer@test", Role::Customer, None).await;

        let err = fetch_or_create_link(&pool, &customer).await.unwrap_err();
        assert!(matches!(err, AppError::Forbidden(_)));
    }

    #[tokio::test]
    async fn deactivated_links_resolve_to_nothing() {
        let pool = testutil::pool().await;
        let ctv = testutil::seed_user(&pool, "ctv@test", Role::Ctv, None).await;
        let link = fetch_or_create_link(&pool, &ctv).await.unwrap();

        assert_eq!(
            resolve_referrer(&pool, &link.code).await.unwrap(),
            Some(ctv.id)
        );

        sqlx::query("UPDATE referral_links SET active = 0 WHERE id = ?1")
            .bind(link.id)
            .execute(&pool)
            .await
            .unwrap();

        assert_eq!(resolve_referrer(&pool, &link.code).await.unwrap(), None);
        assert_eq!(resolve_referrer(&pool, "REFMISSING").await.unwrap(), None);
    }

    #[tokio::test]
    async fn visits_only_bump_clicks() {
        let pool = testutil::pool().await;
        let ctv = testutil::seed_user(&pool, "ctv@test", Role::Ctv, None).await;
        let link = fetch_or_create_link(&pool, &ctv).await.unwrap();

        assert!(db::increment_clicks(&pool, &link.code).await.unwrap());
        assert!(db::increment_clicks(&pool, &link.code).await.unwrap());
        assert!(!db::increment_clicks(&pool, "REFMISSING").await.unwrap());

        let link = db::get_link_by_user(&pool, ctv.id).await.unwrap().unwrap();
        assert_eq!(link.clicks, 2);
        assert_eq!(link.orders, 0);
        assert_eq!(link.revenue, 0);
    }

    #[tokio::test]
    async fn ancestor_chain_is_referrer_first() {
        let pool = testutil::pool().await;
        let (ctv, agent, distributor) = testutil::seed_referrer_chain(&pool).await;

        let chain = ancestor_chain(&pool, ctv.id).await.unwrap();
        assert_eq!(chain.len(), 3);
        assert_eq!(chain[0].user_id, ctv.id);
        assert_eq!(chain[0].role, "ctv");
        assert_eq!(chain[0].direct_subordinates, 0);
        assert_eq!(chain[1].user_id, agent.id);
        assert_eq!(chain[1].direct_subordinates, 3);
        assert_eq!(chain[2].user_id, distributor.id);
        assert_eq!(chain[2].direct_subordinates, 3);
    }

    #[tokio::test]
    async fn parent_assignment_rejects_cycles() {
        let pool = testutil::pool().await;
        let a = testutil::seed_user(&pool, "a@test", Role::Distributor, None).await;
        let b = testutil::seed_user(&pool, "b@test", Role::Agent, Some(a.id)).await;
        let c = testutil::seed_user(&pool, "c@test", Role::Ctv, Some(b.id)).await;

        let err = assign_parent(&pool, a.id, Some(a.id)).await.unwrap_err();
        assert!(matches!(err, AppError::CycleDetected(_)));

        let err = assign_parent(&pool, a.id, Some(c.id)).await.unwrap_err();
        assert!(matches!(err, AppError::CycleDetected(_)));

        // Re-rooting a leaf elsewhere stays legal.
        let d = testutil::seed_user(&pool, "d@test", Role::Distributor, None).await;
        assign_parent(&pool, c.id, Some(d.id)).await.unwrap();
        let c = db::get_user(&pool, c.id).await.unwrap().unwrap();
        assert_eq!(c.parent_id, Some(d.id));
    }
}
