//! Invitation tokens and the linking of pending invitations when the
//! invited person registers.

use hmac::{Hmac, Mac};
use sha2::{Digest, Sha256};
use tracing::{info, warn};

use crate::balance::round_to_2_decimals;
use crate::cache::{self, ReadCache};
use crate::error::{AppError, AppResult};
use crate::schemas::{new_id, Friend, Profile};
use crate::store::Store;

type HmacSha256 = Hmac<Sha256>;

/// Token embedded in invitation emails: HMAC-SHA256 over the invited
/// contact's identity, keyed by a digest of the server secret.
pub fn invite_token(secret: &str, friend_id: &str, email: &str) -> String {
    let content = [
        format!("email={email}"),
        format!("friend={friend_id}"),
    ]
    .join("\n");

    let mut hasher = Sha256::new();
    hasher.update(secret.as_bytes());
    let key = hasher.finalize();

    let mut mac = HmacSha256::new_from_slice(&key).expect("hmac accepts any key length");
    mac.update(content.as_bytes());
    hex::encode(mac.finalize().into_bytes())
}

pub fn verify_invite_token(secret: &str, friend_id: &str, email: &str, token: &str) -> bool {
    let Ok(given) = hex::decode(token) else {
        return false;
    };
    let Ok(expected) = hex::decode(invite_token(secret, friend_id, email)) else {
        return false;
    };
    given == expected
}

/// The reciprocal ledger for a newly registered counterparty, negating the
/// pending record's balance.
fn reciprocal_of(friend: &Friend, owner: &Profile, profile: &Profile) -> Friend {
    Friend {
        id: new_id(),
        user_id: profile.id.clone(),
        name: owner.name.clone(),
        email: Some(owner.email.clone()),
        phone: None,
        balance: round_to_2_decimals(-friend.balance),
        registered_user_id: Some(friend.user_id.clone()),
    }
}

/// Upgrade every pending Friend record that invited `profile`'s email:
/// mark it registered, create the reciprocal ledger with the negated
/// balance, and mirror the existing expenses so the pair invariant holds.
/// Each upgrade runs in its own transaction; a failed one is skipped and
/// reported, the rest still link.
pub async fn link_pending_invitations(
    store: &Store,
    cache: &ReadCache,
    profile: &Profile,
) -> AppResult<usize> {
    let pending = store.pending_friends_by_email(&profile.email).await?;
    let mut linked = 0;

    for friend in pending {
        let owner = match store.profile(&friend.user_id).await {
            Ok(owner) => owner,
            Err(err) => {
                warn!(friend_id = %friend.id, %err, "skipping invitation with unknown owner");
                continue;
            }
        };

        match link_one(store, &friend.id, &owner, profile).await {
            Ok(()) => {
                linked += 1;
                cache.invalidate(&cache::friends_key(&friend.user_id)).await;
                cache
                    .invalidate(&cache::expenses_key(&friend.user_id, &friend.id))
                    .await;
                cache.invalidate(&cache::friends_key(&profile.id)).await;
            }
            Err(err) => {
                warn!(friend_id = %friend.id, %err, "failed to link invitation");
            }
        }
    }

    info!(user_id = %profile.id, linked, "linked pending invitations");
    Ok(linked)
}

/// The friend's balance and expense list are read inside the transaction,
/// so the reciprocal is built from the same snapshot it mirrors and the
/// `$set` on the friend document conflicts with any concurrent balance
/// `$inc` on it.
async fn link_one(
    store: &Store,
    friend_id: &str,
    owner: &Profile,
    profile: &Profile,
) -> AppResult<()> {
    let mut session = store.start_session().await?;
    session.start_transaction(None).await?;
    let result: AppResult<()> = async {
        let friend = store.friend_tx(&mut session, friend_id).await?;
        if friend.registered_user_id.is_some() {
            return Err(AppError::InvitationNotPending(friend.id));
        }
        let expenses = store.expenses_of_tx(&mut session, friend_id).await?;
        let reciprocal = reciprocal_of(&friend, owner, profile);

        store
            .link_registered_user_tx(&mut session, &friend.id, &profile.id)
            .await?;
        store.insert_friend_tx(&mut session, &reciprocal).await?;
        for expense in &expenses {
            let mirror = expense.mirrored(&reciprocal.id);
            store.insert_expense_tx(&mut session, &mirror).await?;
            store
                .set_mirror_id_tx(&mut session, &expense.id, &mirror.id)
                .await?;
        }
        Ok(())
    }
    .await;

    match result {
        Ok(()) => {
            session.commit_transaction().await?;
            Ok(())
        }
        Err(err) => {
            if let Err(abort_err) = session.abort_transaction().await {
                warn!(%abort_err, "failed to abort linking transaction");
            }
            Err(err)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schemas::Expense;
    use chrono::Utc;

    #[test]
    fn tokens_are_deterministic() {
        let a = invite_token("secret", "f1", "bob@example.com");
        let b = invite_token("secret", "f1", "bob@example.com");
        assert_eq!(a, b);
    }

    #[test]
    fn tokens_depend_on_every_input() {
        let base = invite_token("secret", "f1", "bob@example.com");
        assert_ne!(base, invite_token("other", "f1", "bob@example.com"));
        assert_ne!(base, invite_token("secret", "f2", "bob@example.com"));
        assert_ne!(base, invite_token("secret", "f1", "eve@example.com"));
    }

    #[test]
    fn verification_accepts_the_issued_token_only() {
        let token = invite_token("secret", "f1", "bob@example.com");
        assert!(verify_invite_token("secret", "f1", "bob@example.com", &token));
        assert!(!verify_invite_token("secret", "f1", "eve@example.com", &token));
        assert!(!verify_invite_token(
            "secret",
            "f1",
            "bob@example.com",
            "not-hex"
        ));
    }

    #[test]
    fn reciprocal_is_built_from_the_snapshot_it_mirrors() {
        let expense = |id: &str, share: f64| Expense {
            id: id.to_string(),
            friend_id: "f1".to_string(),
            amount: share.abs() * 2.0,
            user_share: share,
            paid_by_user: share > 0.0,
            date: Utc::now(),
            category: "groceries".to_string(),
            description: None,
            mirror_id: None,
        };
        let expenses = vec![expense("e1", 10.0), expense("e2", -4.0)];
        let friend = Friend {
            id: "f1".to_string(),
            user_id: "u1".to_string(),
            name: "Bob".to_string(),
            email: Some("bob@example.com".to_string()),
            phone: None,
            balance: 6.0,
            registered_user_id: None,
        };
        let owner = Profile {
            id: "u1".to_string(),
            name: "Alice".to_string(),
            email: "alice@example.com".to_string(),
        };
        let profile = Profile {
            id: "u2".to_string(),
            name: "Bob".to_string(),
            email: "bob@example.com".to_string(),
        };

        let reciprocal = reciprocal_of(&friend, &owner, &profile);
        assert_eq!(reciprocal.balance, -6.0);
        assert_eq!(reciprocal.user_id, "u2");
        assert_eq!(reciprocal.registered_user_id.as_deref(), Some("u1"));

        // The mirrored history sums to the reciprocal balance exactly when
        // both come from the same snapshot of the pending ledger.
        let mirrored_sum: f64 = expenses
            .iter()
            .map(|e| e.mirrored(&reciprocal.id).user_share)
            .sum();
        assert_eq!(mirrored_sum, reciprocal.balance);
        assert_eq!(
            friend.balance + reciprocal.balance,
            0.0,
            "linked pair balances must cancel"
        );
    }
}
