//! FairShare: pairwise expense-splitting service.
//!
//! Friends track shared expenses and a signed running balance per ledger.
//! The mutation coordinator keeps the ledger invariant (balance equals the
//! sum of expense shares) across single-sided and mirrored updates.

pub mod balance;
pub mod cache;
pub mod config;
pub mod error;
pub mod invite;
pub mod mail;
pub mod mutation;
pub mod schemas;
pub mod store;
