//! Ledger storage. Every financial operation runs inside exactly one
//! `LedgerStore::transaction`; returning `Err` from the closure rolls back
//! every write made through the `LedgerTx` handle.

use chrono::NaiveDate;
use rust_decimal::Decimal;
use uuid::Uuid;

use crate::error::LedgerError;
use crate::models::*;
use crate::sql_types::WithdrawalStatus;

pub mod memory;
#[cfg(feature = "postgres")]
pub mod pg;

pub use self::memory::MemoryStore;
#[cfg(feature = "postgres")]
pub use self::pg::PgStore;

pub type LedgerResult<T> = Result<T, LedgerError>;

pub trait LedgerStore: Send + Sync {
    fn transaction<T, F>(&self, f: F) -> LedgerResult<T>
    where
        F: FnOnce(&mut dyn LedgerTx) -> LedgerResult<T>;
}

/// Repository operations available inside a unit of work.
///
/// Mutations that can be refused (debits, reservations, status changes) are
/// conditional: they return `None` instead of writing when the guard does
/// not hold, so two concurrent writers can never both pass a check that only
/// one of them should.
pub trait LedgerTx {
    // Token accounts

    fn token_balance(&mut self, user_id: Uuid) -> LedgerResult<Option<TokenBalance>>;

    /// Decrements the balance only if it covers `amount`.
    fn debit_token_balance(
        &mut self,
        user_id: Uuid,
        amount: i64,
    ) -> LedgerResult<Option<TokenBalance>>;

    /// Increments the balance, creating the account if absent.
    fn credit_token_balance(&mut self, user_id: Uuid, amount: i64) -> LedgerResult<TokenBalance>;

    fn insert_token_transaction(
        &mut self,
        tx: NewTokenTransaction,
    ) -> LedgerResult<TokenTransaction>;

    fn token_transactions(&mut self, user_id: Uuid) -> LedgerResult<Vec<TokenTransaction>>;

    fn token_transaction_sum(&mut self, user_id: Uuid) -> LedgerResult<i64>;

    /// Every user with a token account, token transaction or bonus wallet.
    fn ledger_user_ids(&mut self) -> LedgerResult<Vec<Uuid>>;

    // Account holds

    fn account_hold(&mut self, user_id: Uuid) -> LedgerResult<Option<AccountHold>>;

    fn place_account_hold(&mut self, user_id: Uuid, reason: &str) -> LedgerResult<AccountHold>;

    fn release_account_hold(&mut self, user_id: Uuid) -> LedgerResult<bool>;

    // Catalog, read-only

    fn model(&mut self, model_id: Uuid) -> LedgerResult<Option<CreatorModel>>;

    fn referrer_of(&mut self, user_id: Uuid) -> LedgerResult<Option<Uuid>>;

    // Creator earnings

    fn creator_earnings(&mut self, model_id: Uuid) -> LedgerResult<Option<ModelCreatorEarnings>>;

    /// A creator's earnings rows, oldest first, locked for the rest of the
    /// unit of work.
    fn creator_earnings_for(&mut self, creator_id: Uuid)
        -> LedgerResult<Vec<ModelCreatorEarnings>>;

    fn accrue_creator_earnings(
        &mut self,
        accrual: EarningsAccrual,
    ) -> LedgerResult<ModelCreatorEarnings>;

    /// Adds `delta` to `total_earnings` only if the result stays non-negative.
    fn adjust_creator_earnings(
        &mut self,
        model_id: Uuid,
        delta: Decimal,
    ) -> LedgerResult<Option<ModelCreatorEarnings>>;

    fn insert_earnings_transaction(
        &mut self,
        tx: NewEarningsTransaction,
    ) -> LedgerResult<EarningsTransaction>;

    fn earnings_transactions(&mut self, creator_id: Uuid)
        -> LedgerResult<Vec<EarningsTransaction>>;

    fn earnings_transactions_for_withdrawal(
        &mut self,
        withdrawal_request_id: Uuid,
    ) -> LedgerResult<Vec<EarningsTransaction>>;

    // Analytics

    fn bump_model_analytics(
        &mut self,
        model_id: Uuid,
        date: NaiveDate,
        usage_count: i64,
        tokens_consumed: i64,
        earnings: Decimal,
    ) -> LedgerResult<ModelAnalytics>;

    fn model_analytics(
        &mut self,
        model_id: Uuid,
        date: NaiveDate,
    ) -> LedgerResult<Option<ModelAnalytics>>;

    // Bonus wallets

    fn bonus_wallet(&mut self, user_id: Uuid) -> LedgerResult<Option<BonusWallet>>;

    /// Increments `balance` and `lifetime_earnings`, creating the wallet if
    /// absent.
    fn credit_bonus_wallet(&mut self, user_id: Uuid, amount: Decimal)
        -> LedgerResult<BonusWallet>;

    /// Moves `amount` from `balance` into `withdrawn_amount` only if the
    /// balance covers it.
    fn reserve_bonus_balance(
        &mut self,
        user_id: Uuid,
        amount: Decimal,
    ) -> LedgerResult<Option<BonusWallet>>;

    /// Moves `amount` from `withdrawn_amount` back into `balance`.
    fn release_bonus_reservation(
        &mut self,
        user_id: Uuid,
        amount: Decimal,
    ) -> LedgerResult<BonusWallet>;

    fn insert_bonus_transaction(
        &mut self,
        tx: NewBonusTransaction,
    ) -> LedgerResult<BonusTransaction>;

    fn bonus_transactions(&mut self, user_id: Uuid) -> LedgerResult<Vec<BonusTransaction>>;

    fn bonus_transactions_for_payment(
        &mut self,
        payment_id: &str,
    ) -> LedgerResult<Vec<BonusTransaction>>;

    // Withdrawals

    fn insert_withdrawal(
        &mut self,
        request: NewWithdrawalRequest,
    ) -> LedgerResult<WithdrawalRequest>;

    /// Loads and locks a withdrawal request.
    fn withdrawal(&mut self, id: Uuid) -> LedgerResult<Option<WithdrawalRequest>>;

    /// The user's pending, approved or processing request, if any.
    fn open_withdrawal_for(&mut self, user_id: Uuid) -> LedgerResult<Option<WithdrawalRequest>>;

    /// Writes `update` only if the request is still in `expected`.
    fn update_withdrawal(
        &mut self,
        id: Uuid,
        expected: WithdrawalStatus,
        update: WithdrawalUpdate,
    ) -> LedgerResult<Option<WithdrawalRequest>>;

    fn insert_withdrawal_history(
        &mut self,
        entry: NewWithdrawalHistory,
    ) -> LedgerResult<WithdrawalHistory>;

    fn withdrawal_history(&mut self, id: Uuid) -> LedgerResult<Vec<WithdrawalHistory>>;

    // Idempotency

    fn processed_event(&mut self, event_key: &str) -> LedgerResult<Option<ProcessedEvent>>;

    /// Records `event_key` as pending. Returns false if the key exists.
    fn claim_event(&mut self, event_key: &str) -> LedgerResult<bool>;

    /// `pending → completed`. Returns false if no pending row was changed.
    fn complete_event(&mut self, event_key: &str) -> LedgerResult<bool>;

    fn insert_payment_session(&mut self, session: NewPaymentSession)
        -> LedgerResult<PaymentSession>;

    fn payment_session(&mut self, session_id: &str) -> LedgerResult<Option<PaymentSession>>;

    /// `pending → completed`. Returns false if no pending row was changed.
    fn complete_payment_session(&mut self, session_id: &str) -> LedgerResult<bool>;
}
