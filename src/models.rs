use chrono::{NaiveDate, NaiveDateTime};
use rust_decimal::{Decimal, RoundingStrategy};
use serde_json::Value;
use uuid::Uuid;

use crate::sql_types::*;

/// Decimal places kept for every monetary amount.
pub const AMOUNT_SCALE: u32 = 4;

/// Rounds half away from zero to `AMOUNT_SCALE` places.
pub fn round_amount(amount: Decimal) -> Decimal {
    amount.round_dp_with_strategy(AMOUNT_SCALE, RoundingStrategy::MidpointAwayFromZero)
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TokenBalance {
    pub user_id: Uuid,
    pub balance: i64,
    pub updated_at: NaiveDateTime,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TokenTransaction {
    pub id: i64,
    pub user_id: Uuid,
    pub amount: i64,
    pub tx_type: TokenTransactionType,
    pub description: String,
    pub metadata: Value,
    pub created_at: NaiveDateTime,
}

#[derive(Debug, Clone)]
pub struct NewTokenTransaction {
    pub user_id: Uuid,
    pub amount: i64,
    pub tx_type: TokenTransactionType,
    pub description: String,
    pub metadata: Value,
}

/// A monetized model as published by its creator. Owned by the catalog,
/// read-only to the ledger.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CreatorModel {
    pub id: Uuid,
    pub creator_id: Uuid,
    pub earnings_per_use: Decimal,
    /// Falls back to the platform default when unset.
    pub earnings_per_token: Option<Decimal>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ModelCreatorEarnings {
    pub model_id: Uuid,
    pub creator_id: Uuid,
    pub total_usage_count: i64,
    pub total_tokens_consumed: i64,
    pub total_earnings: Decimal,
    pub last_usage_at: Option<NaiveDateTime>,
    pub created_at: NaiveDateTime,
    pub updated_at: NaiveDateTime,
}

/// Increments applied to a `ModelCreatorEarnings` row, creating it if absent.
#[derive(Debug, Clone)]
pub struct EarningsAccrual {
    pub model_id: Uuid,
    pub creator_id: Uuid,
    pub usage_count: i64,
    pub tokens_consumed: i64,
    pub earnings: Decimal,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct EarningsTransaction {
    pub id: i64,
    pub creator_id: Uuid,
    pub model_id: Uuid,
    pub amount: Decimal,
    pub transaction_type: EarningsTransactionType,
    pub status: EarningsStatus,
    pub withdrawal_request_id: Option<Uuid>,
    pub description: String,
    pub metadata: Value,
    pub created_at: NaiveDateTime,
}

#[derive(Debug, Clone)]
pub struct NewEarningsTransaction {
    pub creator_id: Uuid,
    pub model_id: Uuid,
    pub amount: Decimal,
    pub transaction_type: EarningsTransactionType,
    pub status: EarningsStatus,
    pub withdrawal_request_id: Option<Uuid>,
    pub description: String,
    pub metadata: Value,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ModelAnalytics {
    pub model_id: Uuid,
    pub date: NaiveDate,
    pub usage_count: i64,
    pub tokens_consumed: i64,
    pub earnings_generated: Decimal,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BonusWallet {
    pub user_id: Uuid,
    pub balance: Decimal,
    /// Includes amounts reserved by open withdrawal requests, so that
    /// `balance == lifetime_earnings - withdrawn_amount` always holds.
    pub withdrawn_amount: Decimal,
    pub lifetime_earnings: Decimal,
    pub updated_at: NaiveDateTime,
}

impl BonusWallet {
    pub fn is_consistent(&self) -> bool {
        self.balance == self.lifetime_earnings - self.withdrawn_amount
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BonusTransaction {
    pub id: i64,
    pub user_id: Uuid,
    pub transaction_type: BonusTransactionType,
    pub amount: Decimal,
    pub from_user_id: Option<Uuid>,
    pub payment_id: Option<String>,
    pub level: Option<i16>,
    pub withdrawal_request_id: Option<Uuid>,
    pub status: EarningsStatus,
    pub created_at: NaiveDateTime,
}

#[derive(Debug, Clone)]
pub struct NewBonusTransaction {
    pub user_id: Uuid,
    pub transaction_type: BonusTransactionType,
    pub amount: Decimal,
    pub from_user_id: Option<Uuid>,
    pub payment_id: Option<String>,
    pub level: Option<i16>,
    pub withdrawal_request_id: Option<Uuid>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct WithdrawalRequest {
    pub id: Uuid,
    pub user_id: Uuid,
    pub kind: WithdrawalKind,
    pub amount: Decimal,
    /// Held out of the bonus wallet while the request is open. Always zero
    /// for creator earnings withdrawals.
    pub reserved_amount: Decimal,
    pub payout_method: PayoutMethod,
    pub payment_details: Value,
    pub status: WithdrawalStatus,
    pub created_at: NaiveDateTime,
    pub updated_at: NaiveDateTime,
    pub approved_by: Option<Uuid>,
    pub approved_at: Option<NaiveDateTime>,
    pub completed_at: Option<NaiveDateTime>,
    pub rejection_reason: Option<String>,
    pub admin_notes: Option<String>,
}

#[derive(Debug, Clone)]
pub struct NewWithdrawalRequest {
    pub user_id: Uuid,
    pub kind: WithdrawalKind,
    pub amount: Decimal,
    pub reserved_amount: Decimal,
    pub payout_method: PayoutMethod,
    pub payment_details: Value,
}

/// Column changes written together with a status transition.
#[derive(Debug, Clone)]
pub struct WithdrawalUpdate {
    pub status: WithdrawalStatus,
    pub reserved_amount: Decimal,
    pub approved_by: Option<Uuid>,
    pub approved_at: Option<NaiveDateTime>,
    pub completed_at: Option<NaiveDateTime>,
    pub rejection_reason: Option<String>,
    pub admin_notes: Option<String>,
}

impl WithdrawalUpdate {
    /// Starts from the request's current column values.
    pub fn from_request(request: &WithdrawalRequest, status: WithdrawalStatus) -> Self {
        Self {
            status,
            reserved_amount: request.reserved_amount,
            approved_by: request.approved_by,
            approved_at: request.approved_at,
            completed_at: request.completed_at,
            rejection_reason: request.rejection_reason.clone(),
            admin_notes: request.admin_notes.clone(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct WithdrawalHistory {
    pub id: i64,
    pub withdrawal_request_id: Uuid,
    pub action: WithdrawalAction,
    pub performed_by: Uuid,
    pub notes: Option<String>,
    pub created_at: NaiveDateTime,
}

#[derive(Debug, Clone)]
pub struct NewWithdrawalHistory {
    pub withdrawal_request_id: Uuid,
    pub action: WithdrawalAction,
    pub performed_by: Uuid,
    pub notes: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ProcessedEvent {
    pub event_key: String,
    pub status: EventStatus,
    pub created_at: NaiveDateTime,
    pub completed_at: Option<NaiveDateTime>,
}

/// A checkout session created by the payment layer and completed by its
/// webhook.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PaymentSession {
    pub session_id: String,
    pub user_id: Uuid,
    pub amount: Decimal,
    pub tokens: i64,
    pub status: EventStatus,
    pub created_at: NaiveDateTime,
    pub completed_at: Option<NaiveDateTime>,
}

#[derive(Debug, Clone)]
pub struct NewPaymentSession {
    pub session_id: String,
    pub user_id: Uuid,
    pub amount: Decimal,
    pub tokens: i64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AccountHold {
    pub user_id: Uuid,
    pub reason: String,
    pub created_at: NaiveDateTime,
}
