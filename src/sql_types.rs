use std::fmt;
use std::str::FromStr;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[cfg_attr(feature = "postgres", derive(DbEnum))]
#[cfg_attr(feature = "postgres", PgType = "token_transaction_type")]
#[cfg_attr(feature = "postgres", DieselType = "Token_transaction_type")]
#[serde(rename_all = "snake_case")]
pub enum TokenTransactionType {
    #[cfg_attr(feature = "postgres", db_rename = "usage")]
    Usage,
    #[cfg_attr(feature = "postgres", db_rename = "purchase")]
    Purchase,
    #[cfg_attr(feature = "postgres", db_rename = "refund")]
    Refund,
    #[cfg_attr(feature = "postgres", db_rename = "bonus")]
    Bonus,
    #[cfg_attr(feature = "postgres", db_rename = "withdrawal")]
    Withdrawal,
}

impl TokenTransactionType {
    /// Debits carry a negative amount; every other type is a credit.
    pub fn is_debit(self) -> bool {
        match self {
            TokenTransactionType::Usage | TokenTransactionType::Withdrawal => true,
            _ => false,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[cfg_attr(feature = "postgres", derive(DbEnum))]
#[cfg_attr(feature = "postgres", PgType = "earnings_transaction_type")]
#[cfg_attr(feature = "postgres", DieselType = "Earnings_transaction_type")]
#[serde(rename_all = "snake_case")]
pub enum EarningsTransactionType {
    #[cfg_attr(feature = "postgres", db_rename = "usage")]
    Usage,
    #[cfg_attr(feature = "postgres", db_rename = "admin_credit")]
    AdminCredit,
    #[cfg_attr(feature = "postgres", db_rename = "withdrawal")]
    Withdrawal,
    #[cfg_attr(feature = "postgres", db_rename = "withdrawal_reversal")]
    WithdrawalReversal,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[cfg_attr(feature = "postgres", derive(DbEnum))]
#[cfg_attr(feature = "postgres", PgType = "earnings_status")]
#[cfg_attr(feature = "postgres", DieselType = "Earnings_status")]
#[serde(rename_all = "snake_case")]
pub enum EarningsStatus {
    #[cfg_attr(feature = "postgres", db_rename = "completed")]
    Completed,
    #[cfg_attr(feature = "postgres", db_rename = "pending")]
    Pending,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[cfg_attr(feature = "postgres", derive(DbEnum))]
#[cfg_attr(feature = "postgres", PgType = "bonus_transaction_type")]
#[cfg_attr(feature = "postgres", DieselType = "Bonus_transaction_type")]
#[serde(rename_all = "snake_case")]
pub enum BonusTransactionType {
    #[cfg_attr(feature = "postgres", db_rename = "commission_level1")]
    #[serde(rename = "commission_level1")]
    CommissionLevel1,
    #[cfg_attr(feature = "postgres", db_rename = "commission_level2")]
    #[serde(rename = "commission_level2")]
    CommissionLevel2,
    #[cfg_attr(feature = "postgres", db_rename = "commission_level3")]
    #[serde(rename = "commission_level3")]
    CommissionLevel3,
    #[cfg_attr(feature = "postgres", db_rename = "withdrawal")]
    Withdrawal,
    #[cfg_attr(feature = "postgres", db_rename = "withdrawal_refund")]
    WithdrawalRefund,
}

impl BonusTransactionType {
    pub fn commission(level: u8) -> Option<Self> {
        match level {
            1 => Some(BonusTransactionType::CommissionLevel1),
            2 => Some(BonusTransactionType::CommissionLevel2),
            3 => Some(BonusTransactionType::CommissionLevel3),
            _ => None,
        }
    }

    pub fn is_commission(self) -> bool {
        match self {
            BonusTransactionType::CommissionLevel1
            | BonusTransactionType::CommissionLevel2
            | BonusTransactionType::CommissionLevel3 => true,
            _ => false,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[cfg_attr(feature = "postgres", derive(DbEnum))]
#[cfg_attr(feature = "postgres", PgType = "withdrawal_kind")]
#[cfg_attr(feature = "postgres", DieselType = "Withdrawal_kind")]
#[serde(rename_all = "snake_case")]
pub enum WithdrawalKind {
    /// Drains `model_creator_earnings`, deducted at approval.
    #[cfg_attr(feature = "postgres", db_rename = "creator_earnings")]
    CreatorEarnings,
    /// Drains the bonus wallet, reserved at request time.
    #[cfg_attr(feature = "postgres", db_rename = "affiliate_bonus")]
    AffiliateBonus,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[cfg_attr(feature = "postgres", derive(DbEnum))]
#[cfg_attr(feature = "postgres", PgType = "withdrawal_status")]
#[cfg_attr(feature = "postgres", DieselType = "Withdrawal_status")]
#[serde(rename_all = "snake_case")]
pub enum WithdrawalStatus {
    #[cfg_attr(feature = "postgres", db_rename = "pending")]
    Pending,
    #[cfg_attr(feature = "postgres", db_rename = "approved")]
    Approved,
    #[cfg_attr(feature = "postgres", db_rename = "processing")]
    Processing,
    #[cfg_attr(feature = "postgres", db_rename = "completed")]
    Completed,
    #[cfg_attr(feature = "postgres", db_rename = "rejected")]
    Rejected,
}

impl WithdrawalStatus {
    pub const OPEN: [WithdrawalStatus; 3] = [
        WithdrawalStatus::Pending,
        WithdrawalStatus::Approved,
        WithdrawalStatus::Processing,
    ];

    pub fn is_open(self) -> bool {
        Self::OPEN.contains(&self)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            WithdrawalStatus::Pending => "pending",
            WithdrawalStatus::Approved => "approved",
            WithdrawalStatus::Processing => "processing",
            WithdrawalStatus::Completed => "completed",
            WithdrawalStatus::Rejected => "rejected",
        }
    }
}

impl fmt::Display for WithdrawalStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[cfg_attr(feature = "postgres", derive(DbEnum))]
#[cfg_attr(feature = "postgres", PgType = "withdrawal_action")]
#[cfg_attr(feature = "postgres", DieselType = "Withdrawal_action")]
#[serde(rename_all = "snake_case")]
pub enum WithdrawalAction {
    #[cfg_attr(feature = "postgres", db_rename = "requested")]
    Requested,
    #[cfg_attr(feature = "postgres", db_rename = "approved")]
    Approved,
    #[cfg_attr(feature = "postgres", db_rename = "reopened")]
    Reopened,
    #[cfg_attr(feature = "postgres", db_rename = "processing")]
    Processing,
    #[cfg_attr(feature = "postgres", db_rename = "completed")]
    Completed,
    #[cfg_attr(feature = "postgres", db_rename = "rejected")]
    Rejected,
}

/// What an administrator asks the withdrawal workflow to do.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AdminAction {
    Approve,
    MarkProcessing,
    Complete,
    Reject,
}

impl AdminAction {
    pub fn as_str(self) -> &'static str {
        match self {
            AdminAction::Approve => "approve",
            AdminAction::MarkProcessing => "mark processing",
            AdminAction::Complete => "complete",
            AdminAction::Reject => "reject",
        }
    }
}

impl fmt::Display for AdminAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for AdminAction {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "approve" => Ok(AdminAction::Approve),
            "processing" | "mark_processing" => Ok(AdminAction::MarkProcessing),
            "complete" | "completed" => Ok(AdminAction::Complete),
            "reject" => Ok(AdminAction::Reject),
            _ => Err(format!("unknown withdrawal action {:?}", s)),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[cfg_attr(feature = "postgres", derive(DbEnum))]
#[cfg_attr(feature = "postgres", PgType = "payout_method")]
#[cfg_attr(feature = "postgres", DieselType = "Payout_method")]
#[serde(rename_all = "snake_case")]
pub enum PayoutMethod {
    #[cfg_attr(feature = "postgres", db_rename = "paypal")]
    Paypal,
    #[cfg_attr(feature = "postgres", db_rename = "bank_transfer")]
    BankTransfer,
    #[cfg_attr(feature = "postgres", db_rename = "crypto")]
    Crypto,
}

impl PayoutMethod {
    pub fn as_str(self) -> &'static str {
        match self {
            PayoutMethod::Paypal => "paypal",
            PayoutMethod::BankTransfer => "bank_transfer",
            PayoutMethod::Crypto => "crypto",
        }
    }

    /// Fields that must be present and non-empty in the payment details.
    pub fn required_fields(self) -> &'static [&'static str] {
        match self {
            PayoutMethod::Paypal => &["email"],
            PayoutMethod::BankTransfer => &["account_holder", "account_number", "bank_name"],
            PayoutMethod::Crypto => &["wallet_address", "network"],
        }
    }
}

impl fmt::Display for PayoutMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for PayoutMethod {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim() {
            "paypal" => Ok(PayoutMethod::Paypal),
            "bank_transfer" | "bank" => Ok(PayoutMethod::BankTransfer),
            "crypto" => Ok(PayoutMethod::Crypto),
            other => Err(format!("unsupported payout method {:?}", other)),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[cfg_attr(feature = "postgres", derive(DbEnum))]
#[cfg_attr(feature = "postgres", PgType = "event_status")]
#[cfg_attr(feature = "postgres", DieselType = "Event_status")]
#[serde(rename_all = "snake_case")]
pub enum EventStatus {
    #[cfg_attr(feature = "postgres", db_rename = "pending")]
    Pending,
    #[cfg_attr(feature = "postgres", db_rename = "completed")]
    Completed,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_open_statuses() {
        assert!(WithdrawalStatus::Pending.is_open());
        assert!(WithdrawalStatus::Approved.is_open());
        assert!(WithdrawalStatus::Processing.is_open());
        assert!(!WithdrawalStatus::Completed.is_open());
        assert!(!WithdrawalStatus::Rejected.is_open());
    }

    #[test]
    fn test_payout_method_parsing() {
        assert_eq!("paypal".parse(), Ok(PayoutMethod::Paypal));
        assert_eq!(" bank ".parse(), Ok(PayoutMethod::BankTransfer));
        assert!("venmo".parse::<PayoutMethod>().is_err());
    }

    #[test]
    fn test_commission_types() {
        assert_eq!(
            BonusTransactionType::commission(2),
            Some(BonusTransactionType::CommissionLevel2)
        );
        assert_eq!(BonusTransactionType::commission(4), None);
        assert!(!BonusTransactionType::Withdrawal.is_commission());
        assert_eq!(
            serde_json::to_string(&BonusTransactionType::CommissionLevel3).unwrap(),
            "\"commission_level3\""
        );
    }
}
