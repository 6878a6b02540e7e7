//! Commission calculation engine.
//!
//! Retail commission goes to the order's direct referrer. Override
//! commission goes to ancestors that maintain enough direct subordinates,
//! paid as the difference between their retail percent and the percent of
//! the chain member immediately below them. The computation itself is a
//! pure function of (order total, ancestor chain, rate snapshot);
//! [`settle_order`] wires it to live data and guards against duplicate
//! settlement.

use std::collections::HashMap;

use sqlx::SqlitePool;
use tracing::{debug, info};

use crate::db;
use crate::errors::Result;
use crate::models::{CommissionSetting, Order};
use crate::referral::{self, ChainMember};

/// Minimum number of direct subordinates an ancestor needs before it earns
/// override commission.
pub const MIN_DIRECT_SUBORDINATES: i64 = 3;

/// Snapshot of per-role retail percents, read once per settlement.
/// Later edits to the settings never touch rows already written.
#[derive(Debug, Clone, Default)]
pub struct RateTable {
    percents: HashMap<String, f64>,
}

impl RateTable {
    pub fn from_settings(settings: &[CommissionSetting]) -> Self {
        let percents = settings
            .iter()
            .filter(|s| s.kind == "retail")
            .map(|s| (s.role.clone(), s.percent))
            .collect();
        Self { percents }
    }

    /// Roles without a configured rate earn nothing.
    pub fn percent_for(&self, role: &str) -> f64 {
        self.percents.get(role).copied().unwrap_or(0.0)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct CommissionDraft {
    pub user_id: i64,
    pub level: i64,
    pub percent: f64,
    pub amount: i64,
}

fn amount_for(total: i64, percent: f64) -> i64 {
    (total as f64 * percent / 100.0).round() as i64
}

/// Compute the commission rows a confirmed, referred order produces.
///
/// `chain` is the referrer-first ancestor walk. Level 1 always pays at the
/// referrer's full retail percent. Higher levels pay the differential
/// against the chain member immediately below, gated on the ancestor's own
/// direct-subordinate count. An ineligible or zero-differential level
/// produces no row and never stops the walk.
pub fn compute(total: i64, chain: &[ChainMember], rates: &RateTable) -> Vec<CommissionDraft> {
    let mut drafts = Vec::new();
    let mut below_percent = 0.0;

    for (idx, member) in chain.iter().enumerate() {
        let own = rates.percent_for(&member.role);
        let level = (idx + 1) as i64;

        if idx == 0 {
            if own > 0.0 {
                drafts.push(CommissionDraft {
                    user_id: member.user_id,
                    level,
                    percent: own,
                    amount: amount_for(total, own),
                });
            }
        } else if member.direct_subordinates >= MIN_DIRECT_SUBORDINATES {
            let effective = own - below_percent;
            if effective > 0.0 {
                drafts.push(CommissionDraft {
                    user_id: member.user_id,
                    level,
                    percent: effective,
                    amount: amount_for(total, effective),
                });
            }
        }

        // The differential basis is chain position, not eligibility.
        below_percent = own;
    }

    drafts
}

/// Settle a confirmed, referred order: walk the chain, snapshot the live
/// rates, and insert the commission rows exactly once.
///
/// The duplicate guard (any existing row for this order id) runs inside
/// the insert transaction, so webhook redelivery and the manual admin path
/// cannot both settle the same order. Returns the number of rows written.
pub async fn settle_order(pool: &SqlitePool, order: &Order) -> Result<usize> {
    let Some(referrer_id) = order.referrer_id else {
        return Ok(0);
    };

    let chain = referral::ancestor_chain(pool, referrer_id).await?;
    let rates = RateTable::from_settings(&db::list_commission_settings(pool).await?);
    let drafts = compute(order.total(), &chain, &rates);

    let mut tx = pool.begin().await?;

    let existing: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM commissions WHERE order_id = ?1")
        .bind(order.id)
        .fetch_one(&mut *tx)
        .await?;
    if existing > 0 {
        debug!(
            "Order {} already settled ({existing} rows), skipping",
            order.code
        );
        return Ok(0);
    }

    let now = db::now();
    for draft in &drafts {
        sqlx::query(
            "INSERT INTO commissions (user_id, order_id, level, percent, amount, status, created_at) \
             VALUES (?1, ?2, ?3, ?4, ?5, 'pending', ?6)",
        )
        .bind(draft.user_id)
        .bind(order.id)
        .bind(draft.level)
        .bind(draft.percent)
        .bind(draft.amount)
        .bind(now)
        .execute(&mut *tx)
        .await?;
    }

    tx.commit().await?;

    if !drafts.is_empty() {
        info!(
            "Settled order {}: {} commission rows",
            order.code,
            drafts.len()
        );
    }
    Ok(drafts.len())
}

// ─────────────────────────────────────────────────────────
// Unit tests
// ─────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::Role;
    use crate::testutil;

    fn member(user_id: i64, role: &str, direct_subordinates: i64) -> ChainMember {
        ChainMember {
            user_id,
            role: role.to_string(),
            direct_subordinates,
        }
    }

    fn default_rates() -> RateTable {
        RateTable::from_settings(&[
            CommissionSetting {
                role: "ctv".into(),
                kind: "retail".into(),
                percent: 10.0,
            },
            CommissionSetting {
                role: "agent".into(),
                kind: "retail".into(),
                percent: 15.0,
            },
            CommissionSetting {
                role: "distributor".into(),
                kind: "retail".into(),
                percent: 20.0,
            },
        ])
    }

    #[test]
    fn fan_out_over_three_levels() {
        let chain = vec![
            member(1, "ctv", 0),
            member(2, "agent", 3),
            member(3, "distributor", 3),
        ];
        let drafts = compute(1_000_000, &chain, &default_rates());

        assert_eq!(
            drafts,
            vec![
                CommissionDraft {
                    user_id: 1,
                    level: 1,
                    percent: 10.0,
                    amount: 100_000
                },
                CommissionDraft {
                    user_id: 2,
                    level: 2,
                    percent: 5.0,
                    amount: 50_000
                },
                CommissionDraft {
                    user_id: 3,
                    level: 3,
                    percent: 5.0,
                    amount: 50_000
                },
            ]
        );
    }

    #[test]
    fn under_threshold_ancestor_is_skipped_entirely() {
        let chain = vec![
            member(1, "ctv", 0),
            member(2, "agent", 2),
            member(3, "distributor", 3),
        ];
        let drafts = compute(1_000_000, &chain, &default_rates());

        // No zero-amount row for the agent; the distributor is still
        // evaluated against the agent's percent.
        assert_eq!(drafts.len(), 2);
        assert_eq!(drafts[0].level, 1);
        assert_eq!(drafts[1].level, 3);
        assert_eq!(drafts[1].percent, 5.0);
        assert_eq!(drafts[1].amount, 50_000);
    }

    #[test]
    fn non_positive_differential_is_a_noop() {
        let rates = RateTable::from_settings(&[
            CommissionSetting {
                role: "ctv".into(),
                kind: "retail".into(),
                percent: 10.0,
            },
            CommissionSetting {
                role: "agent".into(),
                kind: "retail".into(),
                percent: 15.0,
            },
            CommissionSetting {
                role: "distributor".into(),
                kind: "retail".into(),
                percent: 15.0,
            },
        ]);
        let chain = vec![
            member(1, "ctv", 0),
            member(2, "agent", 3),
            member(3, "distributor", 3),
        ];
        let drafts = compute(1_000_000, &chain, &rates);

        assert_eq!(drafts.len(), 2);
        assert!(drafts.iter().all(|d| d.level != 3));
    }

    #[test]
    fn unconfigured_role_counts_as_zero_percent() {
        let chain = vec![
            member(1, "ctv", 0),
            member(2, "customer", 5),
            member(3, "distributor", 3),
        ];
        let drafts = compute(1_000_000, &chain, &default_rates());

        // The unrated middle member produces nothing but still resets the
        // differential basis, so the distributor earns its full percent.
        assert_eq!(drafts.len(), 2);
        assert_eq!(drafts[1].level, 3);
        assert_eq!(drafts[1].percent, 20.0);
        assert_eq!(drafts[1].amount, 200_000);
    }

    #[test]
    fn unreferred_referrer_role_yields_nothing() {
        let chain = vec![member(1, "customer", 0)];
        let drafts = compute(1_000_000, &chain, &default_rates());
        assert!(drafts.is_empty());
    }

    #[test]
    fn amounts_round_to_nearest_unit() {
        let chain = vec![member(1, "ctv", 0)];
        let drafts = compute(333, &chain, &default_rates());
        assert_eq!(drafts[0].amount, 33);

        let drafts = compute(335, &chain, &default_rates());
        assert_eq!(drafts[0].amount, 34);
    }

    #[test]
    fn empty_chain_yields_nothing() {
        assert!(compute(1_000_000, &[], &default_rates()).is_empty());
    }

    #[tokio::test]
    async fn settle_order_writes_rows_once() {
        let pool = testutil::pool().await;
        let (ctv, agent, distributor) = testutil::seed_referrer_chain(&pool).await;
        let product = testutil::seed_product(&pool, "bot-basic", 1_000_000).await;
        let order = testutil::seed_order(
            &pool,
            "BOT010126AAAAA",
            &product,
            1,
            "",
            "buyer@test",
            Some(ctv.id),
        )
        .await;

        let written = settle_order(&pool, &order).await.unwrap();
        assert_eq!(written, 3);

        let rows = db::list_commissions_for_order(&pool, order.id).await.unwrap();
        assert_eq!(rows.len(), 3);
        assert_eq!(rows[0].user_id, ctv.id);
        assert_eq!(rows[0].amount, 100_000);
        assert_eq!(rows[1].user_id, agent.id);
        assert_eq!(rows[1].amount, 50_000);
        assert_eq!(rows[2].user_id, distributor.id);
        assert_eq!(rows[2].amount, 50_000);
        assert!(rows.iter().all(|r| r.status == "pending"));

        // Redelivery or a second manual trigger adds nothing.
        let written = settle_order(&pool, &order).await.unwrap();
        assert_eq!(written, 0);
        let rows = db::list_commissions_for_order(&pool, order.id).await.unwrap();
        assert_eq!(rows.len(), 3);
    }

    #[tokio::test]
    async fn unreferred_orders_settle_to_nothing() {
        let pool = testutil::pool().await;
        let product = testutil::seed_product(&pool, "bot-basic", 1_000_000).await;
        let order =
            testutil::seed_order(&pool, "BOT010126BBBBB", &product, 1, "", "buyer@test", None)
                .await;

        assert_eq!(settle_order(&pool, &order).await.unwrap(), 0);
        assert!(db::list_commissions_for_order(&pool, order.id)
            .await
            .unwrap()
            .is_empty());
    }

    #[tokio::test]
    async fn rate_edits_only_affect_later_settlements() {
        let pool = testutil::pool().await;
        let ctv = testutil::seed_user(&pool, "solo-ctv@test", Role::Ctv, None).await;
        let product = testutil::seed_product(&pool, "bot-basic", 1_000_000).await;

        let first = testutil::seed_order(
            &pool,
            "BOT010126CCCCC",
            &product,
            1,
            "",
            "one@test",
            Some(ctv.id),
        )
        .await;
        settle_order(&pool, &first).await.unwrap();

        db::upsert_commission_setting(&pool, Role::Ctv, 12.0)
            .await
            .unwrap();

        let second = testutil::seed_order(
            &pool,
            "BOT010126DDDDD",
            &product,
            1,
            "",
            "two@test",
            Some(ctv.id),
        )
        .await;
        settle_order(&pool, &second).await.unwrap();

        let first_rows = db::list_commissions_for_order(&pool, first.id).await.unwrap();
        let second_rows = db::list_commissions_for_order(&pool, second.id).await.unwrap();
        assert_eq!(first_rows[0].amount, 100_000);
        assert_eq!(second_rows[0].amount, 120_000);
    }
}
