//! Balance ledger rule engine.
//!
//! Pure arithmetic: given an expense amount and a split mode, compute the
//! signed share booked against the owner's ledger, and the balance deltas
//! that follow from adding, editing or deleting an expense. Positive share
//! means the friend owes the owner; negative means the owner owes.

use crate::error::AppError;

/// How a total amount maps to a signed share.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SplitMode {
    /// Split in half; the payer is owed the other half.
    Equally,
    /// The friend owes the full amount.
    FriendOwesAll,
    /// The owner owes the full amount.
    UserOwesAll,
}

impl SplitMode {
    pub fn parse(s: &str) -> Result<SplitMode, AppError> {
        match s.to_lowercase().as_str() {
            "equally" => Ok(SplitMode::Equally),
            "friend_owes_all" => Ok(SplitMode::FriendOwesAll),
            "user_owes_all" => Ok(SplitMode::UserOwesAll),
            _ => Err(AppError::InvalidSplitMode(s.to_string())),
        }
    }
}

pub fn round_to_2_decimals(n: f64) -> f64 {
    (n * 100.0).round() / 100.0
}

/// The owner's signed share of a new expense.
///
/// Fails with `InvalidAmount` before anything is written if the amount is
/// not strictly positive.
pub fn user_share(amount: f64, split: SplitMode, paid_by_user: bool) -> Result<f64, AppError> {
    if !amount.is_finite() || amount <= 0.0 {
        return Err(AppError::InvalidAmount(amount));
    }
    let share = match split {
        SplitMode::Equally => {
            let half = amount / 2.0;
            if paid_by_user {
                half
            } else {
                -half
            }
        }
        SplitMode::FriendOwesAll => amount,
        SplitMode::UserOwesAll => -amount,
    };
    Ok(round_to_2_decimals(share))
}

/// Balance delta for an edited expense: the old effect is reversed before
/// the new one is applied.
pub fn edit_delta(previous_share: f64, new_share: f64) -> f64 {
    round_to_2_decimals(new_share - previous_share)
}

/// Balance delta for a deleted expense.
pub fn delete_delta(deleted_share: f64) -> f64 {
    round_to_2_decimals(-deleted_share)
}
