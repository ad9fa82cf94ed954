//! Document types for the three collections (friends, expenses, profiles)
//! and the JSON payloads accepted by the HTTP surface.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::balance::round_to_2_decimals;
use crate::error::AppError;

pub type UserId = String;

pub fn new_id() -> String {
    bson::oid::ObjectId::new().to_hex()
}

/// A directed ledger record: "my running balance against this other party".
///
/// `balance` is signed: positive means the counterparty owes the owner.
/// `registered_user_id` non-null means the counterparty is itself a
/// registered user and a reciprocal Friend record exists (the record where
/// `user_id` is the counterparty and `registered_user_id` is the owner).
#[derive(Clone, Debug, PartialEq, Deserialize, Serialize)]
pub struct Friend {
    pub id: String,
    pub user_id: UserId,
    pub name: String,
    pub email: Option<String>,
    pub phone: Option<String>,
    pub balance: f64,
    pub registered_user_id: Option<UserId>,
}

/// One shared cost booked against a Friend ledger.
///
/// `user_share` is the owner's signed delta. When the counterparty is
/// registered the logical expense exists as two records with negated shares
/// and flipped `paid_by_user`, linked through `mirror_id`.
#[derive(Clone, Debug, PartialEq, Deserialize, Serialize)]
pub struct Expense {
    pub id: String,
    pub friend_id: String,
    pub amount: f64,
    pub user_share: f64,
    pub paid_by_user: bool,
    pub date: DateTime<Utc>,
    pub category: String,
    pub description: Option<String>,
    pub mirror_id: Option<String>,
}

impl Expense {
    /// The counterparty's record of this expense: negated share, flipped
    /// payer, linked back through `mirror_id`.
    pub fn mirrored(&self, reciprocal_friend_id: &str) -> Expense {
        Expense {
            id: new_id(),
            friend_id: reciprocal_friend_id.to_string(),
            amount: self.amount,
            user_share: round_to_2_decimals(-self.user_share),
            paid_by_user: !self.paid_by_user,
            date: self.date,
            category: self.category.clone(),
            description: self.description.clone(),
            mirror_id: Some(self.id.clone()),
        }
    }
}

/// A registered user.
#[derive(Clone, Debug, PartialEq, Deserialize, Serialize)]
pub struct Profile {
    pub id: UserId,
    pub name: String,
    pub email: String,
}

// ---- request payloads ----

#[derive(Clone, Debug, Deserialize)]
pub struct NewProfile {
    pub name: String,
    pub email: String,
}

impl NewProfile {
    pub fn validate(&self) -> Result<(), AppError> {
        if self.name.trim().is_empty() {
            return Err(AppError::MissingField("name"));
        }
        if self.email.trim().is_empty() {
            return Err(AppError::MissingField("email"));
        }
        Ok(())
    }
}

#[derive(Clone, Debug, Deserialize)]
pub struct NewFriend {
    pub name: String,
    pub email: Option<String>,
    pub phone: Option<String>,
}

impl NewFriend {
    pub fn validate(&self) -> Result<(), AppError> {
        if self.name.trim().is_empty() {
            return Err(AppError::MissingField("name"));
        }
        Ok(())
    }
}

/// Payload for adding or editing an expense. The split selector is kept as
/// a raw string so an unrecognized mode is rejected by the rule engine
/// before any write, not by the JSON decoder.
#[derive(Clone, Debug, Deserialize)]
pub struct ExpensePayload {
    pub amount: f64,
    pub split: String,
    pub paid_by_user: bool,
    pub date: DateTime<Utc>,
    pub category: String,
    pub description: Option<String>,
}

impl ExpensePayload {
    pub fn validate(&self) -> Result<(), AppError> {
        if self.category.trim().is_empty() {
            return Err(AppError::MissingField("category"));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_friend_name_is_rejected() {
        let payload = NewFriend {
            name: "  ".to_string(),
            email: None,
            phone: None,
        };
        assert!(matches!(
            payload.validate(),
            Err(AppError::MissingField("name"))
        ));
    }

    #[test]
    fn expense_payload_requires_a_category() {
        let payload = ExpensePayload {
            amount: 10.0,
            split: "equally".to_string(),
            paid_by_user: true,
            date: Utc::now(),
            category: String::new(),
            description: None,
        };
        assert!(matches!(
            payload.validate(),
            Err(AppError::MissingField("category"))
        ));
    }

    #[test]
    fn generated_ids_are_unique() {
        assert_ne!(new_id(), new_id());
    }

    #[test]
    fn mirrored_negates_share_and_flips_payer() {
        let expense = Expense {
            id: "e1".to_string(),
            friend_id: "f1".to_string(),
            amount: 30.0,
            user_share: 15.0,
            paid_by_user: true,
            date: Utc::now(),
            category: "coffee".to_string(),
            description: None,
            mirror_id: None,
        };
        let mirror = expense.mirrored("f2");
        assert_eq!(mirror.user_share, -15.0);
        assert!(!mirror.paid_by_user);
        assert_eq!(mirror.friend_id, "f2");
        assert_eq!(mirror.mirror_id.as_deref(), Some("e1"));
        assert_ne!(mirror.id, expense.id);
    }
}
