//! Per-user token balances. Every balance mutation is paired with a
//! `token_transactions` row in the same unit of work, so the transaction
//! sum always equals the stored balance.

use serde_json::{json, Value};
use uuid::Uuid;

use crate::error::LedgerError;
use crate::models::*;
use crate::sql_types::TokenTransactionType;
use crate::store::{LedgerResult, LedgerTx};

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TokenReceipt {
    pub transaction: TokenTransaction,
    pub balance: i64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Reconciliation {
    pub user_id: Uuid,
    pub stored_balance: i64,
    pub transaction_sum: i64,
    pub bonus_wallet_consistent: bool,
}

impl Reconciliation {
    pub fn is_balanced(&self) -> bool {
        self.stored_balance == self.transaction_sum && self.bonus_wallet_consistent
    }

    pub fn describe(&self) -> String {
        format!(
            "stored token balance {} vs transaction sum {}, bonus wallet consistent: {}",
            self.stored_balance, self.transaction_sum, self.bonus_wallet_consistent
        )
    }
}

fn validate_amount(amount: i64) -> LedgerResult<()> {
    if amount <= 0 {
        return Err(LedgerError::invalid_amount(format!(
            "token amount must be positive, got {}",
            amount
        )));
    }
    Ok(())
}

/// Fails with `AccountFrozen` while an account hold is in place.
pub fn ensure_writable(tx: &mut dyn LedgerTx, user_id: Uuid) -> LedgerResult<()> {
    match tx.account_hold(user_id)? {
        Some(hold) => Err(LedgerError::AccountFrozen {
            user_id,
            reason: hold.reason,
        }),
        None => Ok(()),
    }
}

/// Returns 0 for users without an account; never creates one.
pub fn get_balance(tx: &mut dyn LedgerTx, user_id: Uuid) -> LedgerResult<i64> {
    Ok(tx
        .token_balance(user_id)?
        .map(|account| account.balance)
        .unwrap_or(0))
}

pub fn debit(
    tx: &mut dyn LedgerTx,
    user_id: Uuid,
    amount: i64,
    reason: &str,
    metadata: Value,
) -> LedgerResult<TokenReceipt> {
    debit_as(
        tx,
        user_id,
        amount,
        TokenTransactionType::Usage,
        reason,
        metadata,
    )
}

pub fn debit_as(
    tx: &mut dyn LedgerTx,
    user_id: Uuid,
    amount: i64,
    tx_type: TokenTransactionType,
    reason: &str,
    metadata: Value,
) -> LedgerResult<TokenReceipt> {
    validate_amount(amount)?;
    if !tx_type.is_debit() {
        return Err(LedgerError::invalid_amount(format!(
            "{:?} transactions cannot debit",
            tx_type
        )));
    }
    ensure_writable(tx, user_id)?;

    let account = match tx.debit_token_balance(user_id, amount)? {
        Some(account) => account,
        None => {
            return Err(LedgerError::InsufficientFunds {
                balance: get_balance(tx, user_id)?,
                requested: amount,
            })
        }
    };

    let transaction = tx.insert_token_transaction(NewTokenTransaction {
        user_id,
        amount: -amount,
        tx_type,
        description: reason.to_string(),
        metadata,
    })?;

    debug!(
        "debited {} tokens from {} ({}), balance now {}",
        amount, user_id, reason, account.balance
    );

    Ok(TokenReceipt {
        transaction,
        balance: account.balance,
    })
}

pub fn credit(
    tx: &mut dyn LedgerTx,
    user_id: Uuid,
    amount: i64,
    tx_type: TokenTransactionType,
    reason: &str,
    metadata: Value,
) -> LedgerResult<TokenReceipt> {
    validate_amount(amount)?;
    if tx_type.is_debit() {
        return Err(LedgerError::invalid_amount(format!(
            "{:?} transactions cannot credit",
            tx_type
        )));
    }
    ensure_writable(tx, user_id)?;
    write_credit(tx, user_id, amount, tx_type, reason, metadata)
}

fn write_credit(
    tx: &mut dyn LedgerTx,
    user_id: Uuid,
    amount: i64,
    tx_type: TokenTransactionType,
    reason: &str,
    metadata: Value,
) -> LedgerResult<TokenReceipt> {
    let account = tx.credit_token_balance(user_id, amount)?;
    let transaction = tx.insert_token_transaction(NewTokenTransaction {
        user_id,
        amount,
        tx_type,
        description: reason.to_string(),
        metadata,
    })?;

    debug!(
        "credited {} tokens to {} ({:?}: {}), balance now {}",
        amount, user_id, tx_type, reason, account.balance
    );

    Ok(TokenReceipt {
        transaction,
        balance: account.balance,
    })
}

/// Reverses a debit whose paid-for action failed.
pub fn refund(
    tx: &mut dyn LedgerTx,
    user_id: Uuid,
    amount: i64,
    reason: &str,
    metadata: Value,
) -> LedgerResult<TokenReceipt> {
    credit(
        tx,
        user_id,
        amount,
        TokenTransactionType::Refund,
        reason,
        metadata,
    )
}

/// Returns the tokens taken by `debit` after its paid-for action failed.
/// Unlike `refund` this goes through an account hold, since it only undoes a
/// debit that already passed the hold check. A debit is reversed at most
/// once.
pub fn reverse_debit(
    tx: &mut dyn LedgerTx,
    debit: &TokenTransaction,
    reason: &str,
    error: &str,
) -> LedgerResult<TokenReceipt> {
    if debit.amount >= 0 || !debit.tx_type.is_debit() {
        return Err(LedgerError::invalid_amount(format!(
            "transaction {} is not a debit",
            debit.id
        )));
    }

    let reversed = tx
        .token_transactions(debit.user_id)?
        .iter()
        .any(|row| {
            row.tx_type == TokenTransactionType::Refund
                && row.metadata["refunded_transaction"] == json!(debit.id)
        });
    if reversed {
        return Err(LedgerError::Conflict {
            detail: format!("transaction {} was already refunded", debit.id),
        });
    }

    if let Some(hold) = tx.account_hold(debit.user_id)? {
        warn!(
            "reversing debit {} for held account {} ({})",
            debit.id, debit.user_id, hold.reason
        );
    }

    write_credit(
        tx,
        debit.user_id,
        -debit.amount,
        TokenTransactionType::Refund,
        reason,
        json!({
            "refunded_transaction": debit.id,
            "error": error,
        }),
    )
}

/// Compares the stored balance with the transaction log and checks the
/// bonus wallet identity. A mismatch places an account hold; the caller
/// must commit before surfacing the violation.
pub fn reconcile(tx: &mut dyn LedgerTx, user_id: Uuid) -> LedgerResult<Reconciliation> {
    let report = Reconciliation {
        user_id,
        stored_balance: get_balance(tx, user_id)?,
        transaction_sum: tx.token_transaction_sum(user_id)?,
        bonus_wallet_consistent: tx
            .bonus_wallet(user_id)?
            .map(|wallet| wallet.is_consistent())
            .unwrap_or(true),
    };

    if !report.is_balanced() {
        error!(
            "LEDGER INVARIANT VIOLATED for {}: {}; placing account hold",
            user_id,
            report.describe()
        );
        tx.place_account_hold(user_id, &report.describe())?;
    }

    Ok(report)
}
