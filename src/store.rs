//! Table-like persistence over MongoDB: insert/update/delete/select with
//! equality filters against the `friends`, `expenses` and `profiles`
//! collections.
//!
//! Balance adjustments are atomic `$inc` updates, never read-modify-write,
//! so concurrent mutations cannot lose each other's deltas. Multi-record
//! mutations go through the `*_tx` variants inside one session transaction.

use bson::doc;
use futures::TryStreamExt;
use mongodb::{Client, ClientSession, Collection, Database};

use crate::error::{AppError, AppResult};
use crate::schemas::{Expense, Friend, Profile};

#[derive(Clone)]
pub struct Store {
    client: Client,
    db: Database,
}

impl Store {
    pub fn new(client: Client, db_name: &str) -> Self {
        let db = client.database(db_name);
        Self { client, db }
    }

    pub async fn start_session(&self) -> AppResult<ClientSession> {
        Ok(self.client.start_session(None).await?)
    }

    fn friends(&self) -> Collection<Friend> {
        self.db.collection("friends")
    }

    fn expenses(&self) -> Collection<Expense> {
        self.db.collection("expenses")
    }

    fn profiles(&self) -> Collection<Profile> {
        self.db.collection("profiles")
    }

    // ---- profiles ----

    pub async fn insert_profile(&self, profile: &Profile) -> AppResult<()> {
        self.profiles().insert_one(profile, None).await?;
        Ok(())
    }

    pub async fn profile(&self, id: &str) -> AppResult<Profile> {
        self.profiles()
            .find_one(doc! { "id": id }, None)
            .await?
            .ok_or_else(|| AppError::not_found("profile", id))
    }

    pub async fn profile_by_email(&self, email: &str) -> AppResult<Option<Profile>> {
        Ok(self
            .profiles()
            .find_one(doc! { "email": email }, None)
            .await?)
    }

    // ---- friends ----

    pub async fn insert_friend(&self, friend: &Friend) -> AppResult<()> {
        self.friends().insert_one(friend, None).await?;
        Ok(())
    }

    pub async fn friend(&self, id: &str) -> AppResult<Friend> {
        self.friends()
            .find_one(doc! { "id": id }, None)
            .await?
            .ok_or_else(|| AppError::not_found("friend", id))
    }

    pub async fn friends_of(&self, user_id: &str) -> AppResult<Vec<Friend>> {
        let cursor = self.friends().find(doc! { "user_id": user_id }, None).await?;
        Ok(cursor.try_collect().await?)
    }

    /// The counterparty's ledger record for the owner: the Friend where
    /// `user_id` is the counterparty and `registered_user_id` is the owner.
    pub async fn reciprocal_friend(
        &self,
        counterparty_user_id: &str,
        owner_user_id: &str,
    ) -> AppResult<Option<Friend>> {
        Ok(self
            .friends()
            .find_one(
                doc! {
                    "user_id": counterparty_user_id,
                    "registered_user_id": owner_user_id,
                },
                None,
            )
            .await?)
    }

    /// Friend records that invited this email address and are still pending
    /// (no registered counterparty yet).
    pub async fn pending_friends_by_email(&self, email: &str) -> AppResult<Vec<Friend>> {
        let cursor = self
            .friends()
            .find(
                doc! { "email": email, "registered_user_id": bson::Bson::Null },
                None,
            )
            .await?;
        Ok(cursor.try_collect().await?)
    }

    /// Create both sides of a registered friendship in one transaction.
    pub async fn insert_linked_friends(&self, owner_side: &Friend, reciprocal: &Friend) -> AppResult<()> {
        let mut session = self.start_session().await?;
        session.start_transaction(None).await?;
        let result: AppResult<()> = async {
            self.insert_friend_tx(&mut session, owner_side).await?;
            self.insert_friend_tx(&mut session, reciprocal).await?;
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
                    tracing::warn!(%abort_err, "failed to abort transaction");
                }
                Err(err)
            }
        }
    }

    // ---- expenses ----

    pub async fn expense(&self, id: &str) -> AppResult<Expense> {
        self.expenses()
            .find_one(doc! { "id": id }, None)
            .await?
            .ok_or_else(|| AppError::not_found("expense", id))
    }

    pub async fn expenses_of(&self, friend_id: &str) -> AppResult<Vec<Expense>> {
        let cursor = self
            .expenses()
            .find(doc! { "friend_id": friend_id }, None)
            .await?;
        Ok(cursor.try_collect().await?)
    }

    // ---- transactional reads ----

    /// Read a friend through the session so the transaction observes its
    /// own writes and conflicts with concurrent ones.
    pub async fn friend_tx(&self, session: &mut ClientSession, id: &str) -> AppResult<Friend> {
        self.friends()
            .find_one_with_session(doc! { "id": id }, None, session)
            .await?
            .ok_or_else(|| AppError::not_found("friend", id))
    }

    pub async fn expenses_of_tx(
        &self,
        session: &mut ClientSession,
        friend_id: &str,
    ) -> AppResult<Vec<Expense>> {
        let mut cursor = self
            .expenses()
            .find_with_session(doc! { "friend_id": friend_id }, None, session)
            .await?;
        let mut expenses = Vec::new();
        while let Some(expense) = cursor.next(session).await {
            expenses.push(expense?);
        }
        Ok(expenses)
    }

    // ---- transactional writes ----

    pub async fn insert_friend_tx(
        &self,
        session: &mut ClientSession,
        friend: &Friend,
    ) -> AppResult<()> {
        self.friends()
            .insert_one_with_session(friend, None, session)
            .await?;
        Ok(())
    }

    pub async fn insert_expense_tx(
        &self,
        session: &mut ClientSession,
        expense: &Expense,
    ) -> AppResult<()> {
        self.expenses()
            .insert_one_with_session(expense, None, session)
            .await?;
        Ok(())
    }

    /// Replace the mutable fields of an expense in place.
    pub async fn update_expense_tx(
        &self,
        session: &mut ClientSession,
        expense: &Expense,
    ) -> AppResult<()> {
        let update = doc! {
            "$set": {
                "amount": expense.amount,
                "user_share": expense.user_share,
                "paid_by_user": expense.paid_by_user,
                "date": bson::to_bson(&expense.date)?,
                "category": expense.category.as_str(),
                "description": bson::to_bson(&expense.description)?,
                "mirror_id": bson::to_bson(&expense.mirror_id)?,
            }
        };
        let result = self
            .expenses()
            .update_one_with_session(doc! { "id": expense.id.as_str() }, update, None, session)
            .await?;
        if result.matched_count == 0 {
            return Err(AppError::not_found("expense", &expense.id));
        }
        Ok(())
    }

    pub async fn delete_expense_tx(
        &self,
        session: &mut ClientSession,
        expense_id: &str,
    ) -> AppResult<()> {
        let result = self
            .expenses()
            .delete_one_with_session(doc! { "id": expense_id }, None, session)
            .await?;
        if result.deleted_count == 0 {
            return Err(AppError::not_found("expense", expense_id));
        }
        Ok(())
    }

    /// Atomically add `delta` to a friend's running balance.
    pub async fn inc_balance_tx(
        &self,
        session: &mut ClientSession,
        friend_id: &str,
        delta: f64,
    ) -> AppResult<()> {
        let result = self
            .friends()
            .update_one_with_session(
                doc! { "id": friend_id },
                doc! { "$inc": { "balance": delta } },
                None,
                session,
            )
            .await?;
        if result.matched_count == 0 {
            return Err(AppError::not_found("friend", friend_id));
        }
        Ok(())
    }

    /// Mark a pending friend as registered, linking it to the counterparty's
    /// user id.
    pub async fn link_registered_user_tx(
        &self,
        session: &mut ClientSession,
        friend_id: &str,
        registered_user_id: &str,
    ) -> AppResult<()> {
        let result = self
            .friends()
            .update_one_with_session(
                doc! { "id": friend_id },
                doc! { "$set": { "registered_user_id": registered_user_id } },
                None,
                session,
            )
            .await?;
        if result.matched_count == 0 {
            return Err(AppError::not_found("friend", friend_id));
        }
        Ok(())
    }

    pub async fn set_mirror_id_tx(
        &self,
        session: &mut ClientSession,
        expense_id: &str,
        mirror_id: &str,
    ) -> AppResult<()> {
        self.expenses()
            .update_one_with_session(
                doc! { "id": expense_id },
                doc! { "$set": { "mirror_id": mirror_id } },
                None,
                session,
            )
            .await?;
        Ok(())
    }
}
