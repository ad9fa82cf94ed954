//! Expense mutation coordinator.
//!
//! Every mutation (add / edit / delete) is first turned into a pure
//! [`MutationPlan`] listing the exact records to write and the balance
//! deltas to apply, then executed inside a single session transaction. Branch
//! selection is determined solely by the nullity of the owning Friend's
//! `registered_user_id`:
//!
//! - unidirectional (unregistered contact): one expense record plus one
//!   balance `$inc`;
//! - bidirectional (registered counterparty): both mirrored expense records
//!   plus both balance `$inc`s, against the reciprocal Friend resolved by
//!   `user_id == counterparty && registered_user_id == owner`.
//!
//! Any error aborts the transaction; nothing is applied and no retry is
//! attempted. Cache invalidation happens after commit, best effort.

use mongodb::ClientSession;
use tracing::info;

use crate::balance::{self, round_to_2_decimals, SplitMode};
use crate::cache::{self, ReadCache};
use crate::error::{AppError, AppResult};
use crate::schemas::{new_id, Expense, ExpensePayload, Friend};
use crate::store::Store;

/// A signed adjustment to one friend's running balance.
#[derive(Clone, Debug, PartialEq)]
pub struct BalanceChange {
    pub friend_id: String,
    pub delta: f64,
}

/// The records a mutation will touch, computed before anything is written.
#[derive(Clone, Debug, PartialEq)]
pub enum MutationPlan {
    Add {
        primary: Expense,
        mirror: Option<Expense>,
        changes: Vec<BalanceChange>,
    },
    Edit {
        primary: Expense,
        mirror: Option<Expense>,
        changes: Vec<BalanceChange>,
    },
    Delete {
        primary_id: String,
        mirror_id: Option<String>,
        changes: Vec<BalanceChange>,
    },
}

impl MutationPlan {
    /// True when the plan touches two mirrored ledgers.
    pub fn is_bidirectional(&self) -> bool {
        match self {
            MutationPlan::Add { mirror, .. } | MutationPlan::Edit { mirror, .. } => {
                mirror.is_some()
            }
            MutationPlan::Delete { mirror_id, .. } => mirror_id.is_some(),
        }
    }
}

/// Resolve the reciprocal record a bidirectional plan needs, failing the
/// mutation before any write when the friend claims a registered
/// counterparty but no reciprocal exists.
fn require_reciprocal<'a>(
    friend: &Friend,
    reciprocal: Option<&'a Friend>,
) -> AppResult<Option<&'a Friend>> {
    match friend.registered_user_id {
        None => Ok(None),
        Some(_) => reciprocal.map(Some).ok_or_else(|| {
            AppError::ReciprocalNotFound {
                friend_id: friend.id.clone(),
            }
        }),
    }
}

/// Plan adding a new expense to `friend`'s ledger.
pub fn plan_add(
    friend: &Friend,
    reciprocal: Option<&Friend>,
    payload: &ExpensePayload,
) -> AppResult<MutationPlan> {
    payload.validate()?;
    let split = SplitMode::parse(&payload.split)?;
    let share = balance::user_share(payload.amount, split, payload.paid_by_user)?;

    let mut primary = Expense {
        id: new_id(),
        friend_id: friend.id.clone(),
        amount: payload.amount,
        user_share: share,
        paid_by_user: payload.paid_by_user,
        date: payload.date,
        category: payload.category.clone(),
        description: payload.description.clone(),
        mirror_id: None,
    };
    let mut changes = vec![BalanceChange {
        friend_id: friend.id.clone(),
        delta: share,
    }];

    let mirror = match require_reciprocal(friend, reciprocal)? {
        None => None,
        Some(reciprocal) => {
            let mirror = primary.mirrored(&reciprocal.id);
            primary.mirror_id = Some(mirror.id.clone());
            changes.push(BalanceChange {
                friend_id: reciprocal.id.clone(),
                delta: mirror.user_share,
            });
            Some(mirror)
        }
    };

    Ok(MutationPlan::Add {
        primary,
        mirror,
        changes,
    })
}

/// Plan replacing an existing expense's amount/share/date/paid-by in place.
/// The balance moves by `new_share - previous_share` on the owner's side,
/// negated on the mirror.
pub fn plan_edit(
    friend: &Friend,
    stored: &Expense,
    mirror_stored: Option<&Expense>,
    payload: &ExpensePayload,
) -> AppResult<MutationPlan> {
    payload.validate()?;
    let split = SplitMode::parse(&payload.split)?;
    let new_share = balance::user_share(payload.amount, split, payload.paid_by_user)?;
    let delta = balance::edit_delta(stored.user_share, new_share);

    let primary = Expense {
        amount: payload.amount,
        user_share: new_share,
        paid_by_user: payload.paid_by_user,
        date: payload.date,
        category: payload.category.clone(),
        description: payload.description.clone(),
        ..stored.clone()
    };
    let mut changes = vec![BalanceChange {
        friend_id: friend.id.clone(),
        delta,
    }];

    let mirror = match mirror_stored {
        None => None,
        Some(mirror_stored) => {
            let mirror = Expense {
                amount: payload.amount,
                user_share: round_to_2_decimals(-new_share),
                paid_by_user: !payload.paid_by_user,
                date: payload.date,
                category: payload.category.clone(),
                description: payload.description.clone(),
                ..mirror_stored.clone()
            };
            changes.push(BalanceChange {
                friend_id: mirror_stored.friend_id.clone(),
                delta: balance::edit_delta(mirror_stored.user_share, mirror.user_share),
            });
            Some(mirror)
        }
    };

    Ok(MutationPlan::Edit {
        primary,
        mirror,
        changes,
    })
}

/// Plan removing an expense, reversing its stored share on every ledger it
/// touches.
pub fn plan_delete(
    friend: &Friend,
    stored: &Expense,
    mirror_stored: Option<&Expense>,
) -> AppResult<MutationPlan> {
    let mut changes = vec![BalanceChange {
        friend_id: friend.id.clone(),
        delta: balance::delete_delta(stored.user_share),
    }];
    let mirror_id = match mirror_stored {
        None => None,
        Some(mirror) => {
            changes.push(BalanceChange {
                friend_id: mirror.friend_id.clone(),
                delta: balance::delete_delta(mirror.user_share),
            });
            Some(mirror.id.clone())
        }
    };
    Ok(MutationPlan::Delete {
        primary_id: stored.id.clone(),
        mirror_id,
        changes,
    })
}

/// Sequences expense mutations against the store and keeps the read cache
/// coherent.
#[derive(Clone)]
pub struct Coordinator {
    store: Store,
    cache: ReadCache,
}

impl Coordinator {
    pub fn new(store: Store, cache: ReadCache) -> Self {
        Self { store, cache }
    }

    /// Add an expense to the ledger identified by `friend_id`.
    pub async fn add_expense(&self, friend_id: &str, payload: &ExpensePayload) -> AppResult<Expense> {
        let friend = self.store.friend(friend_id).await?;
        let reciprocal = self.resolve_reciprocal(&friend).await?;
        let plan = plan_add(&friend, reciprocal.as_ref(), payload)?;
        let expense = self.execute(&plan).await?;
        info!(
            friend_id,
            bidirectional = plan.is_bidirectional(),
            "expense added"
        );
        self.invalidate_for(&friend, reciprocal.as_ref()).await;
        Ok(expense.expect("add plan carries the primary expense"))
    }

    /// Replace an expense in place, keeping the ledger invariant.
    pub async fn edit_expense(
        &self,
        expense_id: &str,
        payload: &ExpensePayload,
    ) -> AppResult<Expense> {
        let stored = self.store.expense(expense_id).await?;
        let friend = self.store.friend(&stored.friend_id).await?;
        let mirror_stored = self.load_mirror(&stored).await?;
        let reciprocal = self.resolve_reciprocal(&friend).await?;
        let plan = plan_edit(&friend, &stored, mirror_stored.as_ref(), payload)?;
        let expense = self.execute(&plan).await?;
        info!(
            expense_id,
            bidirectional = plan.is_bidirectional(),
            "expense edited"
        );
        self.invalidate_for(&friend, reciprocal.as_ref()).await;
        Ok(expense.expect("edit plan carries the primary expense"))
    }

    /// Delete an expense, reversing its effect on the balance(s).
    pub async fn delete_expense(&self, expense_id: &str) -> AppResult<()> {
        let stored = self.store.expense(expense_id).await?;
        let friend = self.store.friend(&stored.friend_id).await?;
        let mirror_stored = self.load_mirror(&stored).await?;
        let reciprocal = self.resolve_reciprocal(&friend).await?;
        let plan = plan_delete(&friend, &stored, mirror_stored.as_ref())?;
        self.execute(&plan).await?;
        info!(
            expense_id,
            bidirectional = plan.is_bidirectional(),
            "expense deleted"
        );
        self.invalidate_for(&friend, reciprocal.as_ref()).await;
        Ok(())
    }

    async fn resolve_reciprocal(&self, friend: &Friend) -> AppResult<Option<Friend>> {
        match &friend.registered_user_id {
            None => Ok(None),
            Some(counterparty) => self
                .store
                .reciprocal_friend(counterparty, &friend.user_id)
                .await,
        }
    }

    async fn load_mirror(&self, stored: &Expense) -> AppResult<Option<Expense>> {
        match &stored.mirror_id {
            None => Ok(None),
            Some(mirror_id) => Ok(Some(self.store.expense(mirror_id).await?)),
        }
    }

    /// Apply a plan inside one transaction. On any error the transaction is
    /// aborted and nothing is applied.
    async fn execute(&self, plan: &MutationPlan) -> AppResult<Option<Expense>> {
        let mut session = self.store.start_session().await?;
        session.start_transaction(None).await?;
        let result = self.apply(&mut session, plan).await;
        match result {
            Ok(expense) => {
                session.commit_transaction().await?;
                Ok(expense)
            }
            Err(err) => {
                if let Err(abort_err) = session.abort_transaction().await {
                    tracing::warn!(%abort_err, "failed to abort transaction");
                }
                Err(err)
            }
        }
    }

    async fn apply(
        &self,
        session: &mut ClientSession,
        plan: &MutationPlan,
    ) -> AppResult<Option<Expense>> {
        match plan {
            MutationPlan::Add {
                primary,
                mirror,
                changes,
            } => {
                self.store.insert_expense_tx(session, primary).await?;
                if let Some(mirror) = mirror {
                    self.store.insert_expense_tx(session, mirror).await?;
                }
                self.apply_changes(session, changes).await?;
                Ok(Some(primary.clone()))
            }
            MutationPlan::Edit {
                primary,
                mirror,
                changes,
            } => {
                self.store.update_expense_tx(session, primary).await?;
                if let Some(mirror) = mirror {
                    self.store.update_expense_tx(session, mirror).await?;
                }
                self.apply_changes(session, changes).await?;
                Ok(Some(primary.clone()))
            }
            MutationPlan::Delete {
                primary_id,
                mirror_id,
                changes,
            } => {
                self.store.delete_expense_tx(session, primary_id).await?;
                if let Some(mirror_id) = mirror_id {
                    self.store.delete_expense_tx(session, mirror_id).await?;
                }
                self.apply_changes(session, changes).await?;
                Ok(None)
            }
        }
    }

    async fn apply_changes(
        &self,
        session: &mut ClientSession,
        changes: &[BalanceChange],
    ) -> AppResult<()> {
        for change in changes {
            self.store
                .inc_balance_tx(session, &change.friend_id, change.delta)
                .await?;
        }
        Ok(())
    }

    async fn invalidate_for(&self, friend: &Friend, reciprocal: Option<&Friend>) {
        self.cache
            .invalidate(&cache::friends_key(&friend.user_id))
            .await;
        self.cache
            .invalidate(&cache::expenses_key(&friend.user_id, &friend.id))
            .await;
        if let Some(reciprocal) = reciprocal {
            self.cache
                .invalidate(&cache::friends_key(&reciprocal.user_id))
                .await;
            self.cache
                .invalidate(&cache::expenses_key(&reciprocal.user_id, &reciprocal.id))
                .await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn contact_friend() -> Friend {
        Friend {
            id: "f-owner".to_string(),
            user_id: "alice".to_string(),
            name: "Bob".to_string(),
            email: Some("bob@example.com".to_string()),
            phone: None,
            balance: 0.0,
            registered_user_id: None,
        }
    }

    fn registered_pair() -> (Friend, Friend) {
        let owner_side = Friend {
            registered_user_id: Some("bob".to_string()),
            ..contact_friend()
        };
        let reciprocal = Friend {
            id: "f-reciprocal".to_string(),
            user_id: "bob".to_string(),
            name: "Alice".to_string(),
            email: Some("alice@example.com".to_string()),
            phone: None,
            balance: 0.0,
            registered_user_id: Some("alice".to_string()),
        };
        (owner_side, reciprocal)
    }

    fn payload(amount: f64, split: &str, paid_by_user: bool) -> ExpensePayload {
        ExpensePayload {
            amount,
            split: split.to_string(),
            paid_by_user,
            date: Utc::now(),
            category: "groceries".to_string(),
            description: None,
        }
    }

    #[test]
    fn unregistered_contact_plans_a_single_sided_add() {
        let friend = contact_friend();
        let plan = plan_add(&friend, None, &payload(100.0, "equally", true)).unwrap();
        assert!(!plan.is_bidirectional());
        match plan {
            MutationPlan::Add {
                primary,
                mirror,
                changes,
            } => {
                assert_eq!(primary.user_share, 50.0);
                assert!(mirror.is_none());
                assert_eq!(
                    changes,
                    vec![BalanceChange {
                        friend_id: "f-owner".to_string(),
                        delta: 50.0,
                    }]
                );
            }
            other => panic!("expected add plan, got {other:?}"),
        }
    }

    #[test]
    fn registered_counterparty_plans_a_mirrored_add() {
        let (friend, reciprocal) = registered_pair();
        let plan = plan_add(&friend, Some(&reciprocal), &payload(100.0, "equally", true)).unwrap();
        assert!(plan.is_bidirectional());
        match plan {
            MutationPlan::Add {
                primary,
                mirror,
                changes,
            } => {
                let mirror = mirror.unwrap();
                assert_eq!(primary.user_share + mirror.user_share, 0.0);
                assert_eq!(mirror.paid_by_user, !primary.paid_by_user);
                assert_eq!(mirror.friend_id, "f-reciprocal");
                assert_eq!(primary.mirror_id.as_deref(), Some(mirror.id.as_str()));
                assert_eq!(mirror.mirror_id.as_deref(), Some(primary.id.as_str()));
                assert_eq!(changes.len(), 2);
                assert_eq!(changes[0].delta + changes[1].delta, 0.0);
            }
            other => panic!("expected add plan, got {other:?}"),
        }
    }

    #[test]
    fn registered_friend_without_reciprocal_aborts_before_any_write() {
        let (friend, _) = registered_pair();
        let err = plan_add(&friend, None, &payload(100.0, "equally", true)).unwrap_err();
        assert!(matches!(err, AppError::ReciprocalNotFound { .. }));
    }

    #[test]
    fn invalid_split_mode_aborts_the_plan() {
        let friend = contact_friend();
        let err = plan_add(&friend, None, &payload(100.0, "thirds", true)).unwrap_err();
        assert!(matches!(err, AppError::InvalidSplitMode(_)));
    }

    #[test]
    fn edit_moves_the_balance_by_the_share_difference() {
        let friend = contact_friend();
        let stored = Expense {
            id: "e1".to_string(),
            friend_id: friend.id.clone(),
            amount: 100.0,
            user_share: 50.0,
            paid_by_user: true,
            date: Utc::now(),
            category: "groceries".to_string(),
            description: None,
            mirror_id: None,
        };
        // +50 edited down to +30: delta is -20
        let plan = plan_edit(&friend, &stored, None, &payload(60.0, "equally", true)).unwrap();
        match plan {
            MutationPlan::Edit {
                primary, changes, ..
            } => {
                assert_eq!(primary.user_share, 30.0);
                assert_eq!(changes[0].delta, -20.0);
            }
            other => panic!("expected edit plan, got {other:?}"),
        }
    }

    #[test]
    fn mirrored_edit_keeps_the_pair_sum_at_zero() {
        let (friend, reciprocal) = registered_pair();
        let stored = Expense {
            id: "e1".to_string(),
            friend_id: friend.id.clone(),
            amount: 100.0,
            user_share: 50.0,
            paid_by_user: true,
            date: Utc::now(),
            category: "groceries".to_string(),
            description: None,
            mirror_id: Some("e2".to_string()),
        };
        let mirror_stored = Expense {
            id: "e2".to_string(),
            friend_id: reciprocal.id.clone(),
            user_share: -50.0,
            paid_by_user: false,
            mirror_id: Some("e1".to_string()),
            ..stored.clone()
        };
        let plan = plan_edit(
            &friend,
            &stored,
            Some(&mirror_stored),
            &payload(80.0, "friend_owes_all", true),
        )
        .unwrap();
        match plan {
            MutationPlan::Edit {
                primary,
                mirror,
                changes,
            } => {
                let mirror = mirror.unwrap();
                assert_eq!(primary.user_share, 80.0);
                assert_eq!(mirror.user_share, -80.0);
                assert_eq!(changes[0].delta, 30.0);
                assert_eq!(changes[1].delta, -30.0);
            }
            other => panic!("expected edit plan, got {other:?}"),
        }
    }

    #[test]
    fn delete_reverses_the_stored_share_on_both_sides() {
        let (friend, reciprocal) = registered_pair();
        let stored = Expense {
            id: "e1".to_string(),
            friend_id: friend.id.clone(),
            amount: 40.0,
            user_share: -40.0,
            paid_by_user: false,
            date: Utc::now(),
            category: "dinner".to_string(),
            description: None,
            mirror_id: Some("e2".to_string()),
        };
        let mirror_stored = Expense {
            id: "e2".to_string(),
            friend_id: reciprocal.id.clone(),
            user_share: 40.0,
            paid_by_user: true,
            mirror_id: Some("e1".to_string()),
            ..stored.clone()
        };
        let plan = plan_delete(&friend, &stored, Some(&mirror_stored)).unwrap();
        match plan {
            MutationPlan::Delete {
                primary_id,
                mirror_id,
                changes,
            } => {
                assert_eq!(primary_id, "e1");
                assert_eq!(mirror_id.as_deref(), Some("e2"));
                // the owner owed 40; deleting gives the 40 back
                assert_eq!(changes[0].delta, 40.0);
                assert_eq!(changes[1].delta, -40.0);
            }
            other => panic!("expected delete plan, got {other:?}"),
        }
    }

    #[test]
    fn repeated_identical_edits_plan_a_zero_delta_the_second_time() {
        let friend = contact_friend();
        let stored = Expense {
            id: "e1".to_string(),
            friend_id: friend.id.clone(),
            amount: 100.0,
            user_share: 50.0,
            paid_by_user: true,
            date: Utc::now(),
            category: "groceries".to_string(),
            description: None,
            mirror_id: None,
        };
        let edit = payload(60.0, "equally", true);
        let first = plan_edit(&friend, &stored, None, &edit).unwrap();
        let after_first = match &first {
            MutationPlan::Edit { primary, .. } => primary.clone(),
            other => panic!("expected edit plan, got {other:?}"),
        };
        let second = plan_edit(&friend, &after_first, None, &edit).unwrap();
        match second {
            MutationPlan::Edit { changes, .. } => assert_eq!(changes[0].delta, 0.0),
            other => panic!("expected edit plan, got {other:?}"),
        }
    }
}
