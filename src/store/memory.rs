//! In-process ledger store. A unit of work runs against a copy of the tables
//! while holding the store lock and swaps it in on success, so units of work
//! are serialized and a failed one leaves no trace.

use std::collections::HashMap;
use std::sync::Mutex;

use chrono::{NaiveDate, NaiveDateTime, Utc};
use rust_decimal::Decimal;
use uuid::Uuid;

use super::{LedgerResult, LedgerStore, LedgerTx};
use crate::error::LedgerError;
use crate::models::*;
use crate::sql_types::*;

#[derive(Clone, Default)]
struct Tables {
    token_balances: HashMap<Uuid, TokenBalance>,
    token_transactions: Vec<TokenTransaction>,
    holds: HashMap<Uuid, AccountHold>,
    models: HashMap<Uuid, CreatorModel>,
    referrers: HashMap<Uuid, Uuid>,
    creator_earnings: Vec<ModelCreatorEarnings>,
    earnings_transactions: Vec<EarningsTransaction>,
    analytics: HashMap<(Uuid, NaiveDate), ModelAnalytics>,
    bonus_wallets: HashMap<Uuid, BonusWallet>,
    bonus_transactions: Vec<BonusTransaction>,
    withdrawals: HashMap<Uuid, WithdrawalRequest>,
    withdrawal_history: Vec<WithdrawalHistory>,
    events: HashMap<String, ProcessedEvent>,
    payment_sessions: HashMap<String, PaymentSession>,
    last_id: i64,
    fail_analytics: bool,
}

impl Tables {
    fn next_id(&mut self) -> i64 {
        self.last_id += 1;
        self.last_id
    }
}

#[derive(Default)]
pub struct MemoryStore {
    tables: Mutex<Tables>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Publishes a model in the catalog the ledger reads from.
    pub fn insert_model(&self, model: CreatorModel) -> LedgerResult<()> {
        let mut tables = self.lock()?;
        tables.models.insert(model.id, model);
        Ok(())
    }

    pub fn set_referrer(&self, user_id: Uuid, referrer_id: Uuid) -> LedgerResult<()> {
        let mut tables = self.lock()?;
        tables.referrers.insert(user_id, referrer_id);
        Ok(())
    }

    /// Overwrites a stored token balance without a matching transaction.
    /// Only useful for exercising reconciliation.
    #[cfg(test)]
    pub(crate) fn corrupt_token_balance(&self, user_id: Uuid, balance: i64) {
        let mut tables = self.tables.lock().unwrap();
        let entry = tables
            .token_balances
            .entry(user_id)
            .or_insert_with(|| TokenBalance {
                user_id,
                balance: 0,
                updated_at: now(),
            });
        entry.balance = balance;
    }

    #[cfg(test)]
    pub(crate) fn fail_analytics(&self, fail: bool) {
        self.tables.lock().unwrap().fail_analytics = fail;
    }

    fn lock(&self) -> LedgerResult<std::sync::MutexGuard<'_, Tables>> {
        self.tables.lock().map_err(|_| LedgerError::DatabaseError {
            err: "memory store lock poisoned".into(),
        })
    }
}

impl LedgerStore for MemoryStore {
    fn transaction<T, F>(&self, f: F) -> LedgerResult<T>
    where
        F: FnOnce(&mut dyn LedgerTx) -> LedgerResult<T>,
    {
        let mut tables = self.lock()?;
        let mut working = tables.clone();
        let result = f(&mut MemoryTx {
            tables: &mut working,
        })?;
        *tables = working;
        Ok(result)
    }
}

struct MemoryTx<'a> {
    tables: &'a mut Tables,
}

fn now() -> NaiveDateTime {
    Utc::now().naive_utc()
}

impl<'a> LedgerTx for MemoryTx<'a> {
    fn token_balance(&mut self, user_id: Uuid) -> LedgerResult<Option<TokenBalance>> {
        Ok(self.tables.token_balances.get(&user_id).cloned())
    }

    fn debit_token_balance(
        &mut self,
        user_id: Uuid,
        amount: i64,
    ) -> LedgerResult<Option<TokenBalance>> {
        match self.tables.token_balances.get_mut(&user_id) {
            Some(account) if account.balance >= amount => {
                account.balance -= amount;
                account.updated_at = now();
                Ok(Some(account.clone()))
            }
            _ => Ok(None),
        }
    }

    fn credit_token_balance(&mut self, user_id: Uuid, amount: i64) -> LedgerResult<TokenBalance> {
        let account = self
            .tables
            .token_balances
            .entry(user_id)
            .or_insert_with(|| TokenBalance {
                user_id,
                balance: 0,
                updated_at: now(),
            });
        account.balance += amount;
        account.updated_at = now();
        Ok(account.clone())
    }

    fn insert_token_transaction(
        &mut self,
        tx: NewTokenTransaction,
    ) -> LedgerResult<TokenTransaction> {
        let row = TokenTransaction {
            id: self.tables.next_id(),
            user_id: tx.user_id,
            amount: tx.amount,
            tx_type: tx.tx_type,
            description: tx.description,
            metadata: tx.metadata,
            created_at: now(),
        };
        self.tables.token_transactions.push(row.clone());
        Ok(row)
    }

    fn token_transactions(&mut self, user_id: Uuid) -> LedgerResult<Vec<TokenTransaction>> {
        Ok(self
            .tables
            .token_transactions
            .iter()
            .filter(|tx| tx.user_id == user_id)
            .cloned()
            .collect())
    }

    fn token_transaction_sum(&mut self, user_id: Uuid) -> LedgerResult<i64> {
        Ok(self
            .tables
            .token_transactions
            .iter()
            .filter(|tx| tx.user_id == user_id)
            .map(|tx| tx.amount)
            .sum())
    }

    fn ledger_user_ids(&mut self) -> LedgerResult<Vec<Uuid>> {
        let mut ids: Vec<Uuid> = self
            .tables
            .token_balances
            .keys()
            .cloned()
            .chain(self.tables.token_transactions.iter().map(|tx| tx.user_id))
            .chain(self.tables.bonus_wallets.keys().cloned())
            .collect();
        ids.sort();
        ids.dedup();
        Ok(ids)
    }

    fn account_hold(&mut self, user_id: Uuid) -> LedgerResult<Option<AccountHold>> {
        Ok(self.tables.holds.get(&user_id).cloned())
    }

    fn place_account_hold(&mut self, user_id: Uuid, reason: &str) -> LedgerResult<AccountHold> {
        Ok(self
            .tables
            .holds
            .entry(user_id)
            .or_insert_with(|| AccountHold {
                user_id,
                reason: reason.to_string(),
                created_at: now(),
            })
            .clone())
    }

    fn release_account_hold(&mut self, user_id: Uuid) -> LedgerResult<bool> {
        Ok(self.tables.holds.remove(&user_id).is_some())
    }

    fn model(&mut self, model_id: Uuid) -> LedgerResult<Option<CreatorModel>> {
        Ok(self.tables.models.get(&model_id).cloned())
    }

    fn referrer_of(&mut self, user_id: Uuid) -> LedgerResult<Option<Uuid>> {
        Ok(self.tables.referrers.get(&user_id).cloned())
    }

    fn creator_earnings(&mut self, model_id: Uuid) -> LedgerResult<Option<ModelCreatorEarnings>> {
        Ok(self
            .tables
            .creator_earnings
            .iter()
            .find(|row| row.model_id == model_id)
            .cloned())
    }

    fn creator_earnings_for(
        &mut self,
        creator_id: Uuid,
    ) -> LedgerResult<Vec<ModelCreatorEarnings>> {
        let mut rows: Vec<ModelCreatorEarnings> = self
            .tables
            .creator_earnings
            .iter()
            .filter(|row| row.creator_id == creator_id)
            .cloned()
            .collect();
        // Stable, so rows created in the same instant keep insertion order.
        rows.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        Ok(rows)
    }

    fn accrue_creator_earnings(
        &mut self,
        accrual: EarningsAccrual,
    ) -> LedgerResult<ModelCreatorEarnings> {
        let timestamp = now();
        let position = self
            .tables
            .creator_earnings
            .iter()
            .position(|row| row.model_id == accrual.model_id);
        let index = match position {
            Some(index) => index,
            None => {
                self.tables.creator_earnings.push(ModelCreatorEarnings {
                    model_id: accrual.model_id,
                    creator_id: accrual.creator_id,
                    total_usage_count: 0,
                    total_tokens_consumed: 0,
                    total_earnings: Decimal::ZERO,
                    last_usage_at: None,
                    created_at: timestamp,
                    updated_at: timestamp,
                });
                self.tables.creator_earnings.len() - 1
            }
        };
        let row = &mut self.tables.creator_earnings[index];
        row.total_usage_count += accrual.usage_count;
        row.total_tokens_consumed += accrual.tokens_consumed;
        row.total_earnings += accrual.earnings;
        if accrual.usage_count > 0 {
            row.last_usage_at = Some(timestamp);
        }
        row.updated_at = timestamp;
        Ok(row.clone())
    }

    fn adjust_creator_earnings(
        &mut self,
        model_id: Uuid,
        delta: Decimal,
    ) -> LedgerResult<Option<ModelCreatorEarnings>> {
        match self
            .tables
            .creator_earnings
            .iter_mut()
            .find(|row| row.model_id == model_id)
        {
            Some(row) if row.total_earnings + delta >= Decimal::ZERO => {
                row.total_earnings += delta;
                row.updated_at = now();
                Ok(Some(row.clone()))
            }
            _ => Ok(None),
        }
    }

    fn insert_earnings_transaction(
        &mut self,
        tx: NewEarningsTransaction,
    ) -> LedgerResult<EarningsTransaction> {
        let row = EarningsTransaction {
            id: self.tables.next_id(),
            creator_id: tx.creator_id,
            model_id: tx.model_id,
            amount: tx.amount,
            transaction_type: tx.transaction_type,
            status: tx.status,
            withdrawal_request_id: tx.withdrawal_request_id,
            description: tx.description,
            metadata: tx.metadata,
            created_at: now(),
        };
        self.tables.earnings_transactions.push(row.clone());
        Ok(row)
    }

    fn earnings_transactions(
        &mut self,
        creator_id: Uuid,
    ) -> LedgerResult<Vec<EarningsTransaction>> {
        Ok(self
            .tables
            .earnings_transactions
            .iter()
            .filter(|tx| tx.creator_id == creator_id)
            .cloned()
            .collect())
    }

    fn earnings_transactions_for_withdrawal(
        &mut self,
        withdrawal_request_id: Uuid,
    ) -> LedgerResult<Vec<EarningsTransaction>> {
        Ok(self
            .tables
            .earnings_transactions
            .iter()
            .filter(|tx| tx.withdrawal_request_id == Some(withdrawal_request_id))
            .cloned()
            .collect())
    }

    fn bump_model_analytics(
        &mut self,
        model_id: Uuid,
        date: NaiveDate,
        usage_count: i64,
        tokens_consumed: i64,
        earnings: Decimal,
    ) -> LedgerResult<ModelAnalytics> {
        if self.tables.fail_analytics {
            return Err(LedgerError::DatabaseError {
                err: "model_analytics unavailable".into(),
            });
        }
        let row = self
            .tables
            .analytics
            .entry((model_id, date))
            .or_insert_with(|| ModelAnalytics {
                model_id,
                date,
                usage_count: 0,
                tokens_consumed: 0,
                earnings_generated: Decimal::ZERO,
            });
        row.usage_count += usage_count;
        row.tokens_consumed += tokens_consumed;
        row.earnings_generated += earnings;
        Ok(row.clone())
    }

    fn model_analytics(
        &mut self,
        model_id: Uuid,
        date: NaiveDate,
    ) -> LedgerResult<Option<ModelAnalytics>> {
        Ok(self.tables.analytics.get(&(model_id, date)).cloned())
    }

    fn bonus_wallet(&mut self, user_id: Uuid) -> LedgerResult<Option<BonusWallet>> {
        Ok(self.tables.bonus_wallets.get(&user_id).cloned())
    }

    fn credit_bonus_wallet(
        &mut self,
        user_id: Uuid,
        amount: Decimal,
    ) -> LedgerResult<BonusWallet> {
        let wallet = self
            .tables
            .bonus_wallets
            .entry(user_id)
            .or_insert_with(|| BonusWallet {
                user_id,
                balance: Decimal::ZERO,
                withdrawn_amount: Decimal::ZERO,
                lifetime_earnings: Decimal::ZERO,
                updated_at: now(),
            });
        wallet.balance += amount;
        wallet.lifetime_earnings += amount;
        wallet.updated_at = now();
        Ok(wallet.clone())
    }

    fn reserve_bonus_balance(
        &mut self,
        user_id: Uuid,
        amount: Decimal,
    ) -> LedgerResult<Option<BonusWallet>> {
        match self.tables.bonus_wallets.get_mut(&user_id) {
            Some(wallet) if wallet.balance >= amount => {
                wallet.balance -= amount;
                wallet.withdrawn_amount += amount;
                wallet.updated_at = now();
                Ok(Some(wallet.clone()))
            }
            _ => Ok(None),
        }
    }

    fn release_bonus_reservation(
        &mut self,
        user_id: Uuid,
        amount: Decimal,
    ) -> LedgerResult<BonusWallet> {
        let wallet = self
            .tables
            .bonus_wallets
            .get_mut(&user_id)
            .ok_or(LedgerError::NotFound)?;
        wallet.balance += amount;
        wallet.withdrawn_amount -= amount;
        wallet.updated_at = now();
        Ok(wallet.clone())
    }

    fn insert_bonus_transaction(
        &mut self,
        tx: NewBonusTransaction,
    ) -> LedgerResult<BonusTransaction> {
        if let (Some(payment_id), Some(level)) = (tx.payment_id.as_ref(), tx.level) {
            let duplicate = self.tables.bonus_transactions.iter().any(|row| {
                row.payment_id.as_ref() == Some(payment_id) && row.level == Some(level)
            });
            if duplicate {
                return Err(LedgerError::Conflict {
                    detail: format!("payment {} already paid level {}", payment_id, level),
                });
            }
        }
        let row = BonusTransaction {
            id: self.tables.next_id(),
            user_id: tx.user_id,
            transaction_type: tx.transaction_type,
            amount: tx.amount,
            from_user_id: tx.from_user_id,
            payment_id: tx.payment_id,
            level: tx.level,
            withdrawal_request_id: tx.withdrawal_request_id,
            status: EarningsStatus::Completed,
            created_at: now(),
        };
        self.tables.bonus_transactions.push(row.clone());
        Ok(row)
    }

    fn bonus_transactions(&mut self, user_id: Uuid) -> LedgerResult<Vec<BonusTransaction>> {
        Ok(self
            .tables
            .bonus_transactions
            .iter()
            .filter(|tx| tx.user_id == user_id)
            .cloned()
            .collect())
    }

    fn bonus_transactions_for_payment(
        &mut self,
        payment_id: &str,
    ) -> LedgerResult<Vec<BonusTransaction>> {
        Ok(self
            .tables
            .bonus_transactions
            .iter()
            .filter(|tx| tx.payment_id.as_ref().map(String::as_str) == Some(payment_id))
            .cloned()
            .collect())
    }

    fn insert_withdrawal(
        &mut self,
        request: NewWithdrawalRequest,
    ) -> LedgerResult<WithdrawalRequest> {
        if let Some(open) = self.open_withdrawal_for(request.user_id)? {
            return Err(LedgerError::Conflict {
                detail: format!("withdrawal {} is still {}", open.id, open.status),
            });
        }
        let timestamp = now();
        let row = WithdrawalRequest {
            id: Uuid::new_v4(),
            user_id: request.user_id,
            kind: request.kind,
            amount: request.amount,
            reserved_amount: request.reserved_amount,
            payout_method: request.payout_method,
            payment_details: request.payment_details,
            status: WithdrawalStatus::Pending,
            created_at: timestamp,
            updated_at: timestamp,
            approved_by: None,
            approved_at: None,
            completed_at: None,
            rejection_reason: None,
            admin_notes: None,
        };
        self.tables.withdrawals.insert(row.id, row.clone());
        Ok(row)
    }

    fn withdrawal(&mut self, id: Uuid) -> LedgerResult<Option<WithdrawalRequest>> {
        Ok(self.tables.withdrawals.get(&id).cloned())
    }

    fn open_withdrawal_for(&mut self, user_id: Uuid) -> LedgerResult<Option<WithdrawalRequest>> {
        Ok(self
            .tables
            .withdrawals
            .values()
            .find(|request| request.user_id == user_id && request.status.is_open())
            .cloned())
    }

    fn update_withdrawal(
        &mut self,
        id: Uuid,
        expected: WithdrawalStatus,
        update: WithdrawalUpdate,
    ) -> LedgerResult<Option<WithdrawalRequest>> {
        match self.tables.withdrawals.get_mut(&id) {
            Some(request) if request.status == expected => {
                request.status = update.status;
                request.reserved_amount = update.reserved_amount;
                request.approved_by = update.approved_by;
                request.approved_at = update.approved_at;
                request.completed_at = update.completed_at;
                request.rejection_reason = update.rejection_reason;
                request.admin_notes = update.admin_notes;
                request.updated_at = now();
                Ok(Some(request.clone()))
            }
            _ => Ok(None),
        }
    }

    fn insert_withdrawal_history(
        &mut self,
        entry: NewWithdrawalHistory,
    ) -> LedgerResult<WithdrawalHistory> {
        let row = WithdrawalHistory {
            id: self.tables.next_id(),
            withdrawal_request_id: entry.withdrawal_request_id,
            action: entry.action,
            performed_by: entry.performed_by,
            notes: entry.notes,
            created_at: now(),
        };
        self.tables.withdrawal_history.push(row.clone());
        Ok(row)
    }

    fn withdrawal_history(&mut self, id: Uuid) -> LedgerResult<Vec<WithdrawalHistory>> {
        Ok(self
            .tables
            .withdrawal_history
            .iter()
            .filter(|entry| entry.withdrawal_request_id == id)
            .cloned()
            .collect())
    }

    fn processed_event(&mut self, event_key: &str) -> LedgerResult<Option<ProcessedEvent>> {
        Ok(self.tables.events.get(event_key).cloned())
    }

    fn claim_event(&mut self, event_key: &str) -> LedgerResult<bool> {
        if self.tables.events.contains_key(event_key) {
            return Ok(false);
        }
        self.tables.events.insert(
            event_key.to_string(),
            ProcessedEvent {
                event_key: event_key.to_string(),
                status: EventStatus::Pending,
                created_at: now(),
                completed_at: None,
            },
        );
        Ok(true)
    }

    fn complete_event(&mut self, event_key: &str) -> LedgerResult<bool> {
        match self.tables.events.get_mut(event_key) {
            Some(event) if event.status == EventStatus::Pending => {
                event.status = EventStatus::Completed;
                event.completed_at = Some(now());
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    fn insert_payment_session(
        &mut self,
        session: NewPaymentSession,
    ) -> LedgerResult<PaymentSession> {
        if self
            .tables
            .payment_sessions
            .contains_key(&session.session_id)
        {
            return Err(LedgerError::Conflict {
                detail: format!("payment session {} exists", session.session_id),
            });
        }
        let row = PaymentSession {
            session_id: session.session_id,
            user_id: session.user_id,
            amount: session.amount,
            tokens: session.tokens,
            status: EventStatus::Pending,
            created_at: now(),
            completed_at: None,
        };
        self.tables
            .payment_sessions
            .insert(row.session_id.clone(), row.clone());
        Ok(row)
    }

    fn payment_session(&mut self, session_id: &str) -> LedgerResult<Option<PaymentSession>> {
        Ok(self.tables.payment_sessions.get(session_id).cloned())
    }

    fn complete_payment_session(&mut self, session_id: &str) -> LedgerResult<bool> {
        match self.tables.payment_sessions.get_mut(session_id) {
            Some(session) if session.status == EventStatus::Pending => {
                session.status = EventStatus::Completed;
                session.completed_at = Some(now());
                Ok(true)
            }
            _ => Ok(false),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_failed_unit_of_work_rolls_back() {
        let store = MemoryStore::new();
        let user = Uuid::new_v4();

        let result: LedgerResult<()> = store.transaction(|tx| {
            tx.credit_token_balance(user, 100)?;
            Err(LedgerError::NotFound)
        });
        assert!(result.is_err());

        let balance = store.transaction(|tx| tx.token_balance(user)).unwrap();
        assert_eq!(balance, None);
    }

    #[test]
    fn test_conditional_debit() {
        let store = MemoryStore::new();
        let user = Uuid::new_v4();

        store
            .transaction(|tx| tx.credit_token_balance(user, 10))
            .unwrap();

        let refused = store
            .transaction(|tx| tx.debit_token_balance(user, 11))
            .unwrap();
        assert_eq!(refused, None);

        let debited = store
            .transaction(|tx| tx.debit_token_balance(user, 10))
            .unwrap()
            .unwrap();
        assert_eq!(debited.balance, 0);

        // Missing accounts are never debited
        let missing = store
            .transaction(|tx| tx.debit_token_balance(Uuid::new_v4(), 1))
            .unwrap();
        assert_eq!(missing, None);
    }

    #[test]
    fn test_event_claims() {
        let store = MemoryStore::new();

        assert!(store.transaction(|tx| tx.claim_event("usage:1")).unwrap());
        assert!(!store.transaction(|tx| tx.claim_event("usage:1")).unwrap());
        assert!(store.transaction(|tx| tx.complete_event("usage:1")).unwrap());
        assert!(!store.transaction(|tx| tx.complete_event("usage:1")).unwrap());
        assert!(!store.transaction(|tx| tx.complete_event("usage:2")).unwrap());
    }

    #[test]
    fn test_single_open_withdrawal() {
        let store = MemoryStore::new();
        let user = Uuid::new_v4();
        let new_request = || NewWithdrawalRequest {
            user_id: user,
            kind: WithdrawalKind::CreatorEarnings,
            amount: Decimal::new(50, 0),
            reserved_amount: Decimal::ZERO,
            payout_method: PayoutMethod::Paypal,
            payment_details: serde_json::json!({"email": "a@example.com"}),
        };

        store
            .transaction(|tx| tx.insert_withdrawal(new_request()))
            .unwrap();
        match store.transaction(|tx| tx.insert_withdrawal(new_request())) {
            Err(LedgerError::Conflict { .. }) => (),
            other => panic!("expected conflict, got {:?}", other),
        }
    }
}
