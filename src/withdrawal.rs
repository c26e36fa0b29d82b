//! Withdrawal requests and their adjudication.
//!
//! ```text
//! pending  --approve-->  approved  --mark processing-->  processing  --complete-->  completed
//!    |                      |                               |
//!    +-------reject---------+------------reject-------------+-->  rejected
//!                                                                    |
//!                  approved  <------------approve (reopen)-----------+
//! ```
//!
//! Affiliate bonus withdrawals reserve the bonus wallet when requested and
//! release exactly the reserved amount on rejection. Creator earnings
//! withdrawals drain the creator's earnings rows, oldest first, only when
//! approved; every deduction is an earnings transaction tagged with the
//! request id, and rejection restores the net tagged amount per model.

use std::collections::BTreeMap;

use chrono::Utc;
use regex::Regex;
use rust_decimal::Decimal;
use serde_json::{json, Value};
use uuid::Uuid;

use crate::earnings::available_earnings;
use crate::error::LedgerError;
use crate::models::*;
use crate::settings::LedgerSettings;
use crate::sql_types::*;
use crate::store::{LedgerResult, LedgerTx};
use crate::token_account::ensure_writable;

lazy_static! {
    static ref EMAIL: Regex =
        Regex::new(r"^[^@\s]+@[^@\s]+\.[^@\s]+$").expect("email pattern compiles");
}

/// The status an admin action leads to, or `None` if not allowed.
pub fn next(from: WithdrawalStatus, action: AdminAction) -> Option<WithdrawalStatus> {
    use AdminAction::*;
    use WithdrawalStatus::*;

    match (from, action) {
        (Pending, Approve) => Some(Approved),
        (Approved, MarkProcessing) => Some(Processing),
        (Processing, Complete) => Some(Completed),
        (Pending, Reject) | (Approved, Reject) | (Processing, Reject) => Some(Rejected),
        (Rejected, Approve) => Some(Approved),
        _ => None,
    }
}

fn history_action(from: WithdrawalStatus, to: WithdrawalStatus) -> WithdrawalAction {
    match (from, to) {
        (WithdrawalStatus::Rejected, WithdrawalStatus::Approved) => WithdrawalAction::Reopened,
        (_, WithdrawalStatus::Approved) => WithdrawalAction::Approved,
        (_, WithdrawalStatus::Processing) => WithdrawalAction::Processing,
        (_, WithdrawalStatus::Completed) => WithdrawalAction::Completed,
        (_, WithdrawalStatus::Rejected) => WithdrawalAction::Rejected,
        (_, WithdrawalStatus::Pending) => WithdrawalAction::Requested,
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Adjudication {
    pub previous_status: WithdrawalStatus,
    pub request: WithdrawalRequest,
}

/// Recorded when an admin rejects without giving a reason.
pub const DEFAULT_REJECTION_REASON: &str = "rejected by admin";

pub fn minimum_for(settings: &LedgerSettings, kind: WithdrawalKind) -> Decimal {
    match kind {
        WithdrawalKind::CreatorEarnings => settings.min_creator_withdrawal,
        WithdrawalKind::AffiliateBonus => settings.min_bonus_withdrawal,
    }
}

pub fn validate_payment_details(
    settings: &LedgerSettings,
    method: PayoutMethod,
    details: &Value,
) -> LedgerResult<()> {
    if !settings.payout_methods.contains(&method) {
        return Err(LedgerError::invalid_details(format!(
            "payout method {} is not supported",
            method
        )));
    }

    let fields = details
        .as_object()
        .ok_or_else(|| LedgerError::invalid_details("payment details must be an object"))?;

    for field in method.required_fields() {
        let value = fields
            .get(*field)
            .and_then(Value::as_str)
            .map(str::trim)
            .unwrap_or("");
        if value.is_empty() {
            return Err(LedgerError::invalid_details(format!(
                "{} payouts require {}",
                method, field
            )));
        }
    }

    if method == PayoutMethod::Paypal {
        let email = fields.get("email").and_then(Value::as_str).unwrap_or("");
        if !EMAIL.is_match(email.trim()) {
            return Err(LedgerError::invalid_details(format!(
                "{:?} is not a valid email address",
                email
            )));
        }
    }
    Ok(())
}

/// Balance a new request of `kind` can draw on.
pub fn available_balance(
    tx: &mut dyn LedgerTx,
    user_id: Uuid,
    kind: WithdrawalKind,
) -> LedgerResult<Decimal> {
    match kind {
        WithdrawalKind::CreatorEarnings => available_earnings(tx, user_id),
        WithdrawalKind::AffiliateBonus => Ok(tx
            .bonus_wallet(user_id)?
            .map(|wallet| wallet.balance)
            .unwrap_or(Decimal::ZERO)),
    }
}

pub fn request_withdrawal(
    tx: &mut dyn LedgerTx,
    settings: &LedgerSettings,
    user_id: Uuid,
    kind: WithdrawalKind,
    amount: Decimal,
    method: PayoutMethod,
    details: Value,
) -> LedgerResult<WithdrawalRequest> {
    if amount.normalize().scale() > AMOUNT_SCALE {
        return Err(LedgerError::invalid_amount(format!(
            "withdrawal amount {} has more than {} decimal places",
            amount, AMOUNT_SCALE
        )));
    }
    let minimum = minimum_for(settings, kind);
    if amount <= Decimal::ZERO || amount < minimum {
        return Err(LedgerError::invalid_amount(format!(
            "withdrawal amount {} is below the minimum of {}",
            amount, minimum
        )));
    }
    validate_payment_details(settings, method, &details)?;
    ensure_writable(tx, user_id)?;

    let available = available_balance(tx, user_id, kind)?;
    if available < amount {
        return Err(LedgerError::InsufficientBalance {
            available,
            requested: amount,
        });
    }

    if let Some(open) = tx.open_withdrawal_for(user_id)? {
        return Err(LedgerError::DuplicateRequest {
            user_id,
            request_id: open.id,
        });
    }

    let reserved_amount = match kind {
        WithdrawalKind::AffiliateBonus => amount,
        WithdrawalKind::CreatorEarnings => Decimal::ZERO,
    };
    let request = tx.insert_withdrawal(NewWithdrawalRequest {
        user_id,
        kind,
        amount,
        reserved_amount,
        payout_method: method,
        payment_details: details,
    })?;

    if kind == WithdrawalKind::AffiliateBonus {
        reserve_bonus(tx, &request)?;
    }

    tx.insert_withdrawal_history(NewWithdrawalHistory {
        withdrawal_request_id: request.id,
        action: WithdrawalAction::Requested,
        performed_by: user_id,
        notes: None,
    })?;

    info!(
        "withdrawal {} requested by {}: {} {:?} via {}",
        request.id, user_id, amount, kind, method
    );
    Ok(request)
}

fn reserve_bonus(tx: &mut dyn LedgerTx, request: &WithdrawalRequest) -> LedgerResult<()> {
    if tx
        .reserve_bonus_balance(request.user_id, request.amount)?
        .is_none()
    {
        return Err(LedgerError::InsufficientBalance {
            available: available_balance(tx, request.user_id, request.kind)?,
            requested: request.amount,
        });
    }
    tx.insert_bonus_transaction(NewBonusTransaction {
        user_id: request.user_id,
        transaction_type: BonusTransactionType::Withdrawal,
        amount: -request.amount,
        from_user_id: None,
        payment_id: None,
        level: None,
        withdrawal_request_id: Some(request.id),
    })?;
    Ok(())
}

fn release_bonus(tx: &mut dyn LedgerTx, request: &WithdrawalRequest) -> LedgerResult<()> {
    if request.reserved_amount <= Decimal::ZERO {
        return Ok(());
    }
    tx.release_bonus_reservation(request.user_id, request.reserved_amount)?;
    tx.insert_bonus_transaction(NewBonusTransaction {
        user_id: request.user_id,
        transaction_type: BonusTransactionType::WithdrawalRefund,
        amount: request.reserved_amount,
        from_user_id: None,
        payment_id: None,
        level: None,
        withdrawal_request_id: Some(request.id),
    })?;
    Ok(())
}

/// Deducts the request amount from the creator's earnings rows, oldest
/// first, after checking the current total still covers it.
fn drain_earnings(tx: &mut dyn LedgerTx, request: &WithdrawalRequest) -> LedgerResult<()> {
    let rows = tx.creator_earnings_for(request.user_id)?;
    let total: Decimal = rows.iter().map(|row| row.total_earnings).sum();
    if request.amount > total {
        return Err(LedgerError::InsufficientBalance {
            available: total,
            requested: request.amount,
        });
    }

    let mut remaining = request.amount;
    for row in rows {
        if remaining <= Decimal::ZERO {
            break;
        }
        let take = remaining.min(row.total_earnings);
        if take <= Decimal::ZERO {
            continue;
        }
        if tx.adjust_creator_earnings(row.model_id, -take)?.is_none() {
            return Err(LedgerError::Conflict {
                detail: format!("earnings for model {} changed during approval", row.model_id),
            });
        }
        tx.insert_earnings_transaction(NewEarningsTransaction {
            creator_id: request.user_id,
            model_id: row.model_id,
            amount: -take,
            transaction_type: EarningsTransactionType::Withdrawal,
            status: EarningsStatus::Completed,
            withdrawal_request_id: Some(request.id),
            description: format!("withdrawal {}", request.id),
            metadata: json!({ "payout_method": request.payout_method }),
        })?;
        remaining -= take;
    }
    Ok(())
}

/// Puts back, per model, whatever this request still has drained.
fn restore_earnings(tx: &mut dyn LedgerTx, request: &WithdrawalRequest) -> LedgerResult<()> {
    let mut net: BTreeMap<Uuid, Decimal> = BTreeMap::new();
    for row in tx.earnings_transactions_for_withdrawal(request.id)? {
        *net.entry(row.model_id).or_insert(Decimal::ZERO) += row.amount;
    }

    for (model_id, drained) in net {
        if drained >= Decimal::ZERO {
            continue;
        }
        let restored = -drained;
        if tx.adjust_creator_earnings(model_id, restored)?.is_none() {
            return Err(LedgerError::NotFound);
        }
        tx.insert_earnings_transaction(NewEarningsTransaction {
            creator_id: request.user_id,
            model_id,
            amount: restored,
            transaction_type: EarningsTransactionType::WithdrawalReversal,
            status: EarningsStatus::Completed,
            withdrawal_request_id: Some(request.id),
            description: format!("withdrawal {} rejected", request.id),
            metadata: json!({}),
        })?;
    }
    Ok(())
}

pub fn adjudicate(
    tx: &mut dyn LedgerTx,
    request_id: Uuid,
    action: AdminAction,
    admin_id: Uuid,
    notes: Option<String>,
) -> LedgerResult<Adjudication> {
    let request = tx.withdrawal(request_id)?.ok_or(LedgerError::NotFound)?;
    let from = request.status;
    let to = next(from, action).ok_or(LedgerError::InvalidTransition { from, action })?;

    let mut update = WithdrawalUpdate::from_request(&request, to);
    if notes.is_some() {
        update.admin_notes = notes.clone();
    }
    let timestamp = Utc::now().naive_utc();

    match to {
        WithdrawalStatus::Approved => {
            ensure_writable(tx, request.user_id)?;
            if from == WithdrawalStatus::Rejected {
                if let Some(open) = tx.open_withdrawal_for(request.user_id)? {
                    return Err(LedgerError::DuplicateRequest {
                        user_id: request.user_id,
                        request_id: open.id,
                    });
                }
                if request.kind == WithdrawalKind::AffiliateBonus {
                    reserve_bonus(tx, &request)?;
                    update.reserved_amount = request.amount;
                }
                update.rejection_reason = None;
            }
            if request.kind == WithdrawalKind::CreatorEarnings {
                drain_earnings(tx, &request)?;
            }
            update.approved_by = Some(admin_id);
            update.approved_at = Some(timestamp);
        }
        WithdrawalStatus::Completed => {
            update.completed_at = Some(timestamp);
        }
        WithdrawalStatus::Rejected => {
            match request.kind {
                WithdrawalKind::AffiliateBonus => release_bonus(tx, &request)?,
                WithdrawalKind::CreatorEarnings => restore_earnings(tx, &request)?,
            }
            update.reserved_amount = Decimal::ZERO;
            update.rejection_reason = Some(
                notes
                    .as_ref()
                    .map(|notes| notes.trim())
                    .filter(|notes| !notes.is_empty())
                    .unwrap_or(DEFAULT_REJECTION_REASON)
                    .to_string(),
            );
        }
        WithdrawalStatus::Processing | WithdrawalStatus::Pending => (),
    }

    let updated = tx
        .update_withdrawal(request_id, from, update)?
        .ok_or_else(|| LedgerError::Conflict {
            detail: format!("withdrawal {} is no longer {}", request_id, from),
        })?;

    tx.insert_withdrawal_history(NewWithdrawalHistory {
        withdrawal_request_id: request_id,
        action: history_action(from, to),
        performed_by: admin_id,
        notes,
    })?;

    info!(
        "withdrawal {} moved {} -> {} by {}",
        request_id, from, to, admin_id
    );
    Ok(Adjudication {
        previous_status: from,
        request: updated,
    })
}
