//! Multi-level affiliate commission. A completed payment pays each referrer
//! up the buyer's chain a fixed share into their bonus wallet.

use std::collections::HashSet;

use rust_decimal::Decimal;
use uuid::Uuid;

use crate::error::LedgerError;
use crate::models::*;
use crate::sql_types::BonusTransactionType;
use crate::store::{LedgerResult, LedgerTx};
use crate::token_account::ensure_writable;

pub const MAX_LEVELS: u8 = 3;

/// Share of the payment paid at `level`, or `None` past the last level.
pub fn commission_rate(level: u8) -> Option<Decimal> {
    match level {
        1 => Some(Decimal::new(50, 2)),
        2 | 3 => Some(Decimal::new(5, 2)),
        _ => None,
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CommissionCredit {
    pub level: u8,
    pub referrer_id: Uuid,
    pub amount: Decimal,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CommissionOutcome {
    pub credited: Vec<CommissionCredit>,
    /// True when an earlier delivery of the payment already paid out.
    pub already_distributed: bool,
}

impl CommissionOutcome {
    pub fn credited_levels(&self) -> Vec<u8> {
        self.credited.iter().map(|credit| credit.level).collect()
    }

    pub fn total(&self) -> Decimal {
        self.credited.iter().map(|credit| credit.amount).sum()
    }
}

/// Resolves up to `MAX_LEVELS` referrers above `buyer_id`. The walk stops at
/// the first user without a referrer or at a user already seen.
pub fn referrer_chain(tx: &mut dyn LedgerTx, buyer_id: Uuid) -> LedgerResult<Vec<Uuid>> {
    let mut chain = Vec::with_capacity(MAX_LEVELS as usize);
    let mut visited = HashSet::new();
    visited.insert(buyer_id);

    let mut current = buyer_id;
    while chain.len() < MAX_LEVELS as usize {
        let referrer = match tx.referrer_of(current)? {
            Some(referrer) => referrer,
            None => break,
        };
        if !visited.insert(referrer) {
            warn!(
                "referrer cycle at {} while walking chain of {}",
                referrer, buyer_id
            );
            break;
        }
        chain.push(referrer);
        current = referrer;
    }
    Ok(chain)
}

pub fn distribute(
    tx: &mut dyn LedgerTx,
    payment_id: &str,
    buyer_id: Uuid,
    payment_amount: Decimal,
) -> LedgerResult<CommissionOutcome> {
    if payment_amount <= Decimal::ZERO {
        return Err(LedgerError::invalid_amount(format!(
            "payment amount must be positive, got {}",
            payment_amount
        )));
    }

    let paid = tx
        .bonus_transactions_for_payment(payment_id)?
        .iter()
        .any(|row| row.transaction_type.is_commission());
    if paid {
        debug!("commission for payment {} already distributed", payment_id);
        return Ok(CommissionOutcome {
            credited: vec![],
            already_distributed: true,
        });
    }

    let mut credited = vec![];
    for (index, referrer_id) in referrer_chain(tx, buyer_id)?.into_iter().enumerate() {
        let level = index as u8 + 1;
        let (rate, transaction_type) =
            match (commission_rate(level), BonusTransactionType::commission(level)) {
                (Some(rate), Some(transaction_type)) => (rate, transaction_type),
                _ => break,
            };

        let amount = round_amount(payment_amount * rate);
        if amount <= Decimal::ZERO {
            continue;
        }
        match ensure_writable(tx, referrer_id) {
            Ok(()) => {}
            Err(LedgerError::AccountFrozen { reason, .. }) => {
                warn!(
                    "skipping level {} commission for held referrer {} on payment {}: {}",
                    level, referrer_id, payment_id, reason
                );
                continue;
            }
            Err(err) => return Err(err),
        }

        tx.credit_bonus_wallet(referrer_id, amount)?;
        tx.insert_bonus_transaction(NewBonusTransaction {
            user_id: referrer_id,
            transaction_type,
            amount,
            from_user_id: Some(buyer_id),
            payment_id: Some(payment_id.to_string()),
            level: Some(i16::from(level)),
            withdrawal_request_id: None,
        })?;

        info!(
            "paid level {} commission {} to {} for payment {}",
            level, amount, referrer_id, payment_id
        );
        credited.push(CommissionCredit {
            level,
            referrer_id,
            amount,
        });
    }

    Ok(CommissionOutcome {
        credited,
        already_distributed: false,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{LedgerStore, MemoryStore};
    use rust_decimal_macros::dec;

    fn wallet_balance(store: &MemoryStore, user_id: Uuid) -> Decimal {
        store
            .transaction(|tx| tx.bonus_wallet(user_id))
            .unwrap()
            .map(|wallet| wallet.balance)
            .unwrap_or(Decimal::ZERO)
    }

    #[test]
    fn test_rates() {
        assert_eq!(commission_rate(1), Some(dec!(0.5)));
        assert_eq!(commission_rate(2), Some(dec!(0.05)));
        assert_eq!(commission_rate(3), Some(dec!(0.05)));
        assert_eq!(commission_rate(4), None);
    }

    #[test]
    fn test_two_level_chain() {
        let store = MemoryStore::new();
        let (buyer, a, b) = (Uuid::new_v4(), Uuid::new_v4(), Uuid::new_v4());
        store.set_referrer(buyer, a).unwrap();
        store.set_referrer(a, b).unwrap();

        let outcome = store
            .transaction(|tx| distribute(tx, "pay_1", buyer, dec!(20)))
            .unwrap();
        assert_eq!(outcome.credited_levels(), vec![1, 2]);
        assert!(!outcome.already_distributed);
        assert_eq!(wallet_balance(&store, a), dec!(10.00));
        assert_eq!(wallet_balance(&store, b), dec!(1.00));

        let wallet = store
            .transaction(|tx| tx.bonus_wallet(a))
            .unwrap()
            .unwrap();
        assert_eq!(wallet.lifetime_earnings, dec!(10));
        assert!(wallet.is_consistent());

        let rows = store.transaction(|tx| tx.bonus_transactions(b)).unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].from_user_id, Some(buyer));
        assert_eq!(rows[0].level, Some(2));
        assert_eq!(rows[0].payment_id.as_ref().map(String::as_str), Some("pay_1"));
    }

    #[test]
    fn test_replay_pays_once() {
        let store = MemoryStore::new();
        let (buyer, a, b) = (Uuid::new_v4(), Uuid::new_v4(), Uuid::new_v4());
        store.set_referrer(buyer, a).unwrap();
        store.set_referrer(a, b).unwrap();

        for _ in 0..3 {
            store
                .transaction(|tx| distribute(tx, "pay_2", buyer, dec!(20)))
                .unwrap();
        }

        let replay = store
            .transaction(|tx| distribute(tx, "pay_2", buyer, dec!(20)))
            .unwrap();
        assert!(replay.already_distributed);
        assert!(replay.credited.is_empty());

        assert_eq!(wallet_balance(&store, a), dec!(10));
        assert_eq!(wallet_balance(&store, b), dec!(1));
        let rows = store
            .transaction(|tx| tx.bonus_transactions_for_payment("pay_2"))
            .unwrap();
        assert_eq!(rows.len(), 2);
    }

    #[test]
    fn test_chain_stops_after_three_levels() {
        let store = MemoryStore::new();
        let users: Vec<Uuid> = (0..6).map(|_| Uuid::new_v4()).collect();
        for pair in users.windows(2) {
            store.set_referrer(pair[0], pair[1]).unwrap();
        }

        let outcome = store
            .transaction(|tx| distribute(tx, "pay_3", users[0], dec!(100)))
            .unwrap();
        assert_eq!(outcome.credited_levels(), vec![1, 2, 3]);
        assert_eq!(outcome.total(), dec!(60));
        assert_eq!(wallet_balance(&store, users[3]), dec!(5));
        assert_eq!(wallet_balance(&store, users[4]), Decimal::ZERO);
    }

    #[test]
    fn test_buyer_without_referrer() {
        let store = MemoryStore::new();
        let outcome = store
            .transaction(|tx| distribute(tx, "pay_4", Uuid::new_v4(), dec!(20)))
            .unwrap();
        assert!(outcome.credited.is_empty());
        assert!(!outcome.already_distributed);
    }

    #[test]
    fn test_referrer_cycle() {
        let store = MemoryStore::new();
        let (buyer, a) = (Uuid::new_v4(), Uuid::new_v4());
        store.set_referrer(buyer, a).unwrap();
        store.set_referrer(a, buyer).unwrap();

        let outcome = store
            .transaction(|tx| distribute(tx, "pay_5", buyer, dec!(20)))
            .unwrap();
        assert_eq!(outcome.credited_levels(), vec![1]);
        assert_eq!(wallet_balance(&store, buyer), Decimal::ZERO);
    }

    #[test]
    fn test_odd_amounts_round_to_four_places() {
        let store = MemoryStore::new();
        let (buyer, a, b) = (Uuid::new_v4(), Uuid::new_v4(), Uuid::new_v4());
        store.set_referrer(buyer, a).unwrap();
        store.set_referrer(a, b).unwrap();

        store
            .transaction(|tx| distribute(tx, "pay_6", buyer, dec!(0.00333)))
            .unwrap();
        // 0.00333 * 0.5 = 0.001665 -> 0.0017, 0.00333 * 0.05 = 0.0001665 -> 0.0002
        assert_eq!(wallet_balance(&store, a), dec!(0.0017));
        assert_eq!(wallet_balance(&store, b), dec!(0.0002));
    }

    #[test]
    fn test_held_referrer_is_skipped() {
        let store = MemoryStore::new();
        let (buyer, a, b) = (Uuid::new_v4(), Uuid::new_v4(), Uuid::new_v4());
        store.set_referrer(buyer, a).unwrap();
        store.set_referrer(a, b).unwrap();
        store
            .transaction(|tx| tx.place_account_hold(a, "chargeback review"))
            .unwrap();

        let outcome = store
            .transaction(|tx| distribute(tx, "pay_8", buyer, dec!(20)))
            .unwrap();
        assert_eq!(outcome.credited_levels(), vec![2]);
        assert_eq!(outcome.credited[0].referrer_id, b);
        assert_eq!(store.transaction(|tx| tx.bonus_wallet(a)).unwrap(), None);
        assert_eq!(wallet_balance(&store, b), dec!(1));
        assert!(store
            .transaction(|tx| tx.bonus_transactions(a))
            .unwrap()
            .is_empty());
    }

    #[test]
    fn test_invalid_payment_amount() {
        let store = MemoryStore::new();
        assert!(matches!(
            store.transaction(|tx| distribute(tx, "pay_7", Uuid::new_v4(), dec!(0))),
            Err(LedgerError::InvalidAmount { .. })
        ));
    }
}
