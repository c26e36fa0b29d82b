use rust_decimal::Decimal;
use uuid::Uuid;

use crate::sql_types::{AdminAction, WithdrawalStatus};

#[derive(Debug, Fail)]
pub enum LedgerError {
    #[fail(
        display = "insufficient funds: balance {} is below requested {}",
        balance, requested
    )]
    InsufficientFunds { balance: i64, requested: i64 },
    #[fail(
        display = "insufficient balance: available {} is below requested {}",
        available, requested
    )]
    InsufficientBalance {
        available: Decimal,
        requested: Decimal,
    },
    #[fail(display = "invalid amount: {}", reason)]
    InvalidAmount { reason: String },
    #[fail(display = "invalid payment details: {}", reason)]
    InvalidPaymentDetails { reason: String },
    #[fail(display = "user {} already has an open withdrawal request {}", user_id, request_id)]
    DuplicateRequest { user_id: Uuid, request_id: Uuid },
    #[fail(display = "not found")]
    NotFound,
    #[fail(display = "cannot {} a withdrawal that is {}", action, from)]
    InvalidTransition {
        from: WithdrawalStatus,
        action: AdminAction,
    },
    #[fail(display = "account {} is on hold: {}", user_id, reason)]
    AccountFrozen { user_id: Uuid, reason: String },
    #[fail(display = "ledger invariant violated for {}: {}", user_id, detail)]
    InvariantViolation { user_id: Uuid, detail: String },
    #[fail(display = "concurrent modification: {}", detail)]
    Conflict { detail: String },
    #[fail(display = "configuration error: {}", err)]
    Configuration { err: String },
    #[fail(display = "database error: {}", err)]
    DatabaseError { err: String },
}

impl LedgerError {
    pub fn invalid_amount<S: Into<String>>(reason: S) -> Self {
        Self::InvalidAmount {
            reason: reason.into(),
        }
    }

    pub fn invalid_details<S: Into<String>>(reason: S) -> Self {
        Self::InvalidPaymentDetails {
            reason: reason.into(),
        }
    }

    /// Errors a caller can show to the user; everything else is internal.
    pub fn is_user_facing(&self) -> bool {
        match self {
            Self::InsufficientFunds { .. }
            | Self::InsufficientBalance { .. }
            | Self::InvalidAmount { .. }
            | Self::InvalidPaymentDetails { .. }
            | Self::DuplicateRequest { .. }
            | Self::NotFound
            | Self::InvalidTransition { .. }
            | Self::AccountFrozen { .. } => true,
            _ => false,
        }
    }
}

#[cfg(feature = "postgres")]
impl From<diesel::result::Error> for LedgerError {
    fn from(err: diesel::result::Error) -> LedgerError {
        match err {
            diesel::result::Error::NotFound => LedgerError::NotFound,
            _ => LedgerError::DatabaseError {
                err: format!("{}", err),
            },
        }
    }
}

#[cfg(feature = "postgres")]
impl From<diesel::r2d2::PoolError> for LedgerError {
    fn from(err: diesel::r2d2::PoolError) -> LedgerError {
        LedgerError::DatabaseError {
            err: format!("{}", err),
        }
    }
}

impl From<toml::de::Error> for LedgerError {
    fn from(err: toml::de::Error) -> LedgerError {
        LedgerError::Configuration {
            err: format!("{}", err),
        }
    }
}

impl From<std::io::Error> for LedgerError {
    fn from(err: std::io::Error) -> LedgerError {
        LedgerError::Configuration {
            err: format!("{}", err),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_user_facing() {
        assert!(LedgerError::InsufficientFunds {
            balance: 10,
            requested: 15
        }
        .is_user_facing());
        assert!(LedgerError::invalid_amount("zero").is_user_facing());
        assert!(!LedgerError::InvariantViolation {
            user_id: Uuid::new_v4(),
            detail: "sum mismatch".into()
        }
        .is_user_facing());
        assert!(!LedgerError::DatabaseError { err: "gone".into() }.is_user_facing());
    }

    #[test]
    fn test_display() {
        let err = LedgerError::InvalidTransition {
            from: WithdrawalStatus::Completed,
            action: AdminAction::Reject,
        };
        assert_eq!(err.to_string(), "cannot reject a withdrawal that is completed");
    }
}
