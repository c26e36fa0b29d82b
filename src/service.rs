use std::sync::Arc;

use chrono::NaiveDate;
use instrumented::{instrument, prometheus, register};
use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;
use serde_json::{json, Value};
use uuid::Uuid;

use crate::commission::{self, CommissionOutcome};
use crate::earnings::{self, EarningsOutcome, UsageEvent};
use crate::error::LedgerError;
use crate::idempotency::{claim_payment_session, Claim};
use crate::models::*;
use crate::settings::{ConfigProvider, LedgerSettings};
use crate::sql_types::*;
use crate::store::{LedgerResult, LedgerStore};
use crate::token_account::{self, Reconciliation, TokenReceipt};
use crate::withdrawal::{self, Adjudication};

lazy_static! {
    static ref TOKENS_DEBITED: prometheus::HistogramVec = {
        let histogram_opts =
            prometheus::HistogramOpts::new("tokens_debited_amount", "Histogram of tokens debited");
        let histogram = prometheus::HistogramVec::new(histogram_opts, &[]).unwrap();
        register(Box::new(histogram.clone())).unwrap();
        histogram
    };
    static ref TOKENS_CREDITED: prometheus::HistogramVec = {
        let histogram_opts = prometheus::HistogramOpts::new(
            "tokens_credited_amount",
            "Histogram of tokens credited, refunds included",
        );
        let histogram = prometheus::HistogramVec::new(histogram_opts, &[]).unwrap();
        register(Box::new(histogram.clone())).unwrap();
        histogram
    };
    static ref COMMISSION_PAID: prometheus::HistogramVec = {
        let histogram_opts = prometheus::HistogramOpts::new(
            "commission_paid_amount",
            "Histogram of affiliate commission paid per payment",
        );
        let histogram = prometheus::HistogramVec::new(histogram_opts, &[]).unwrap();
        register(Box::new(histogram.clone())).unwrap();
        histogram
    };
    static ref WITHDRAWAL_SETTLED: prometheus::HistogramVec = {
        let histogram_opts = prometheus::HistogramOpts::new(
            "withdrawal_settled_amount",
            "Histogram of completed withdrawal amounts",
        );
        let histogram = prometheus::HistogramVec::new(histogram_opts, &["method"]).unwrap();
        register(Box::new(histogram.clone())).unwrap();
        histogram
    };
}

fn observe_tokens(histogram: &prometheus::HistogramVec, receipt: &TokenReceipt) {
    histogram
        .with_label_values(&[])
        .observe(receipt.transaction.amount.abs() as f64);
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub enum PaymentOutcome {
    Completed {
        receipt: TokenReceipt,
        /// `None` if distribution failed; a replay of the webhook retries it.
        commission: Option<CommissionOutcome>,
    },
    AlreadyProcessed,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ReconcileSummary {
    pub checked: usize,
    pub violations: Vec<Uuid>,
    pub errors: usize,
}

/// Entry point for every ledger operation. Each public method runs at most
/// one unit of work per financial effect and resolves platform settings at
/// call time.
pub struct PayMaster<S> {
    store: Arc<S>,
    settings: Arc<dyn ConfigProvider>,
}

impl<S> Clone for PayMaster<S> {
    fn clone(&self) -> Self {
        PayMaster {
            store: Arc::clone(&self.store),
            settings: Arc::clone(&self.settings),
        }
    }
}

impl<S: LedgerStore> PayMaster<S> {
    pub fn new(store: S, settings: Arc<dyn ConfigProvider>) -> Self {
        PayMaster {
            store: Arc::new(store),
            settings,
        }
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    fn settings(&self) -> LedgerResult<LedgerSettings> {
        LedgerSettings::resolve(self.settings.as_ref())
    }

    // Tokens

    pub fn get_balance(&self, user_id: Uuid) -> LedgerResult<i64> {
        self.store
            .transaction(|tx| token_account::get_balance(tx, user_id))
    }

    pub fn token_transactions(&self, user_id: Uuid) -> LedgerResult<Vec<TokenTransaction>> {
        self.store.transaction(|tx| tx.token_transactions(user_id))
    }

    #[instrument(INFO)]
    pub fn debit_tokens(
        &self,
        user_id: Uuid,
        amount: i64,
        reason: &str,
        metadata: Value,
    ) -> LedgerResult<TokenReceipt> {
        let receipt = self
            .store
            .transaction(|tx| token_account::debit(tx, user_id, amount, reason, metadata))?;
        observe_tokens(&TOKENS_DEBITED, &receipt);
        Ok(receipt)
    }

    #[instrument(INFO)]
    pub fn credit_tokens(
        &self,
        user_id: Uuid,
        amount: i64,
        tx_type: TokenTransactionType,
        reason: &str,
        metadata: Value,
    ) -> LedgerResult<TokenReceipt> {
        let receipt = self.store.transaction(|tx| {
            token_account::credit(tx, user_id, amount, tx_type, reason, metadata)
        })?;
        info!(
            "credited {} tokens to {} ({:?})",
            amount, user_id, tx_type
        );
        observe_tokens(&TOKENS_CREDITED, &receipt);
        Ok(receipt)
    }

    #[instrument(INFO)]
    pub fn refund_tokens(
        &self,
        user_id: Uuid,
        amount: i64,
        reason: &str,
        metadata: Value,
    ) -> LedgerResult<TokenReceipt> {
        let receipt = self
            .store
            .transaction(|tx| token_account::refund(tx, user_id, amount, reason, metadata))?;
        observe_tokens(&TOKENS_CREDITED, &receipt);
        Ok(receipt)
    }

    /// Debits `amount`, runs the paid-for `action`, and refunds the debit if
    /// the action fails. The action's error is returned either way.
    pub fn charge_tokens<T, F>(
        &self,
        user_id: Uuid,
        amount: i64,
        reason: &str,
        action: F,
    ) -> LedgerResult<T>
    where
        F: FnOnce(&TokenReceipt) -> LedgerResult<T>,
    {
        let receipt = self.debit_tokens(user_id, amount, reason, json!({}))?;

        match action(&receipt) {
            Ok(value) => Ok(value),
            Err(err) => {
                warn!(
                    "{} failed for {} after debiting {} tokens, refunding: {}",
                    reason, user_id, amount, err
                );
                let refund_reason = format!("{} failed", reason);
                let error = err.to_string();
                match self.store.transaction(|tx| {
                    token_account::reverse_debit(tx, &receipt.transaction, &refund_reason, &error)
                }) {
                    Ok(refund) => observe_tokens(&TOKENS_CREDITED, &refund),
                    Err(refund_err) => error!(
                        "REFUND FAILED for {} ({} tokens, transaction {}): {}",
                        user_id, amount, receipt.transaction.id, refund_err
                    ),
                }
                Err(err)
            }
        }
    }

    // Earnings

    /// Accrues creator earnings for one usage event. Daily analytics are a
    /// separate unit of work whose failure is only logged.
    #[instrument(INFO)]
    pub fn record_usage(&self, event: &UsageEvent) -> LedgerResult<EarningsOutcome> {
        let settings = self.settings()?;
        let outcome = self
            .store
            .transaction(|tx| earnings::accrue_usage(tx, &settings, event))?;

        if let EarningsOutcome::Accrued(calculation) = &outcome {
            let today = earnings::today();
            if let Err(err) = self
                .store
                .transaction(|tx| earnings::record_analytics(tx, calculation, today))
            {
                warn!(
                    "failed to record analytics for model {}: {}",
                    calculation.model_id, err
                );
            }
        }
        Ok(outcome)
    }

    #[instrument(INFO)]
    pub fn add_admin_earnings(
        &self,
        model_id: Uuid,
        amount: Decimal,
        admin_id: Uuid,
        note: &str,
    ) -> LedgerResult<ModelCreatorEarnings> {
        self.store
            .transaction(|tx| earnings::add_admin_earnings(tx, model_id, amount, admin_id, note))
    }

    pub fn creator_earnings(&self, creator_id: Uuid) -> LedgerResult<Vec<ModelCreatorEarnings>> {
        self.store.transaction(|tx| tx.creator_earnings_for(creator_id))
    }

    pub fn earnings_transactions(
        &self,
        creator_id: Uuid,
    ) -> LedgerResult<Vec<EarningsTransaction>> {
        self.store
            .transaction(|tx| tx.earnings_transactions(creator_id))
    }

    pub fn model_analytics(
        &self,
        model_id: Uuid,
        date: NaiveDate,
    ) -> LedgerResult<Option<ModelAnalytics>> {
        self.store
            .transaction(|tx| tx.model_analytics(model_id, date))
    }

    // Withdrawals

    #[instrument(INFO)]
    pub fn request_withdrawal(
        &self,
        user_id: Uuid,
        kind: WithdrawalKind,
        amount: Decimal,
        method: PayoutMethod,
        details: Value,
    ) -> LedgerResult<WithdrawalRequest> {
        let settings = self.settings()?;
        self.store.transaction(|tx| {
            withdrawal::request_withdrawal(tx, &settings, user_id, kind, amount, method, details)
        })
    }

    #[instrument(INFO)]
    pub fn adjudicate_withdrawal(
        &self,
        request_id: Uuid,
        action: AdminAction,
        admin_id: Uuid,
        notes: Option<String>,
    ) -> LedgerResult<Adjudication> {
        let adjudication = self
            .store
            .transaction(|tx| withdrawal::adjudicate(tx, request_id, action, admin_id, notes))?;
        let request = &adjudication.request;
        if request.status == WithdrawalStatus::Completed {
            WITHDRAWAL_SETTLED
                .with_label_values(&[request.payout_method.as_str()])
                .observe(request.amount.to_f64().unwrap_or_default());
        }
        Ok(adjudication)
    }

    pub fn withdrawal(&self, request_id: Uuid) -> LedgerResult<WithdrawalRequest> {
        self.store
            .transaction(|tx| tx.withdrawal(request_id)?.ok_or(LedgerError::NotFound))
    }

    pub fn withdrawal_history(&self, request_id: Uuid) -> LedgerResult<Vec<WithdrawalHistory>> {
        self.store
            .transaction(|tx| tx.withdrawal_history(request_id))
    }

    // Affiliate commission

    pub fn bonus_wallet(&self, user_id: Uuid) -> LedgerResult<Option<BonusWallet>> {
        self.store.transaction(|tx| tx.bonus_wallet(user_id))
    }

    pub fn bonus_transactions(&self, user_id: Uuid) -> LedgerResult<Vec<BonusTransaction>> {
        self.store.transaction(|tx| tx.bonus_transactions(user_id))
    }

    #[instrument(INFO)]
    pub fn distribute_commission(
        &self,
        payment_id: &str,
        buyer_id: Uuid,
        amount: Decimal,
    ) -> LedgerResult<CommissionOutcome> {
        let outcome = self
            .store
            .transaction(|tx| commission::distribute(tx, payment_id, buyer_id, amount))?;
        if !outcome.credited.is_empty() {
            COMMISSION_PAID
                .with_label_values(&[])
                .observe(outcome.total().to_f64().unwrap_or_default());
        }
        Ok(outcome)
    }

    // Payments

    pub fn create_payment_session(
        &self,
        session: NewPaymentSession,
    ) -> LedgerResult<PaymentSession> {
        if session.tokens <= 0 {
            return Err(LedgerError::invalid_amount(format!(
                "payment session must grant tokens, got {}",
                session.tokens
            )));
        }
        if session.amount <= Decimal::ZERO {
            return Err(LedgerError::invalid_amount(format!(
                "payment amount must be positive, got {}",
                session.amount
            )));
        }
        self.store
            .transaction(|tx| tx.insert_payment_session(session))
    }

    /// Applies a completed checkout: flips the session to completed before
    /// crediting the purchased tokens, then pays affiliate commission.
    #[instrument(INFO)]
    pub fn complete_payment(&self, session_id: &str) -> LedgerResult<PaymentOutcome> {
        let claimed = self.store.transaction(|tx| {
            let session = match claim_payment_session(tx, session_id)? {
                Claim::Claimed(session) => session,
                Claim::AlreadyProcessed => return Ok(None),
            };
            let receipt = token_account::credit(
                tx,
                session.user_id,
                session.tokens,
                TokenTransactionType::Purchase,
                "token purchase",
                json!({ "session_id": session_id, "amount": session.amount }),
            )?;
            Ok(Some((session, receipt)))
        })?;

        match claimed {
            Some((session, receipt)) => {
                info!(
                    "payment session {} completed: {} tokens to {}",
                    session_id, session.tokens, session.user_id
                );
                observe_tokens(&TOKENS_CREDITED, &receipt);
                let commission = self.try_distribute(&session);
                Ok(PaymentOutcome::Completed {
                    receipt,
                    commission,
                })
            }
            None => {
                // Retry commission a failed first delivery left undistributed.
                if let Some(session) = self
                    .store
                    .transaction(|tx| tx.payment_session(session_id))?
                {
                    self.try_distribute(&session);
                }
                Ok(PaymentOutcome::AlreadyProcessed)
            }
        }
    }

    fn try_distribute(&self, session: &PaymentSession) -> Option<CommissionOutcome> {
        match self.distribute_commission(&session.session_id, session.user_id, session.amount) {
            Ok(outcome) => Some(outcome),
            Err(err) => {
                warn!(
                    "commission for payment {} not distributed: {}",
                    session.session_id, err
                );
                None
            }
        }
    }

    // Reconciliation

    /// Checks the account's ledgers. On a mismatch the account hold is
    /// committed before `InvariantViolation` is returned.
    #[instrument(INFO)]
    pub fn reconcile_account(&self, user_id: Uuid) -> LedgerResult<Reconciliation> {
        let report = self
            .store
            .transaction(|tx| token_account::reconcile(tx, user_id))?;
        if !report.is_balanced() {
            return Err(LedgerError::InvariantViolation {
                user_id,
                detail: report.describe(),
            });
        }
        Ok(report)
    }

    pub fn reconcile_all(&self) -> LedgerResult<ReconcileSummary> {
        let user_ids = self.store.transaction(|tx| tx.ledger_user_ids())?;
        let mut summary = ReconcileSummary::default();

        for user_id in user_ids {
            summary.checked += 1;
            match self.reconcile_account(user_id) {
                Ok(_) => (),
                Err(LedgerError::InvariantViolation { .. }) => summary.violations.push(user_id),
                Err(err) => {
                    warn!("could not reconcile {}: {}", user_id, err);
                    summary.errors += 1;
                }
            }
        }
        Ok(summary)
    }

    pub fn release_account_hold(&self, user_id: Uuid, admin_id: Uuid) -> LedgerResult<bool> {
        let released = self
            .store
            .transaction(|tx| tx.release_account_hold(user_id))?;
        if released {
            info!("account hold on {} released by {}", user_id, admin_id);
        }
        Ok(released)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::earnings::{SkipReason, UsageType};
    use crate::settings::{SettingValue, SettingsSnapshot, StaticSettings, MONETIZATION_ENABLED};
    use crate::store::MemoryStore;
    use rand::Rng;
    use rust_decimal_macros::dec;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::thread;

    fn paymaster() -> PayMaster<MemoryStore> {
        PayMaster::new(MemoryStore::new(), Arc::new(StaticSettings::default()))
    }

    fn check_zero_sum(paymaster: &PayMaster<MemoryStore>, user_id: Uuid) {
        let sum: i64 = paymaster
            .token_transactions(user_id)
            .unwrap()
            .iter()
            .map(|tx| tx.amount)
            .sum();
        assert_eq!(sum, paymaster.get_balance(user_id).unwrap());
    }

    fn buy(paymaster: &PayMaster<MemoryStore>, user_id: Uuid, tokens: i64) {
        paymaster
            .credit_tokens(
                user_id,
                tokens,
                TokenTransactionType::Purchase,
                "token pack",
                json!({}),
            )
            .unwrap();
    }

    fn chat_model(paymaster: &PayMaster<MemoryStore>) -> CreatorModel {
        let model = CreatorModel {
            id: Uuid::new_v4(),
            creator_id: Uuid::new_v4(),
            earnings_per_use: Decimal::ZERO,
            earnings_per_token: Some(dec!(0.0001)),
        };
        paymaster.store().insert_model(model.clone()).unwrap();
        model
    }

    #[test]
    fn test_concurrent_debits_never_overdraw() {
        let paymaster = paymaster();
        let user = Uuid::new_v4();
        buy(&paymaster, user, 100);

        let handles: Vec<_> = (0..20)
            .map(|_| {
                let paymaster = paymaster.clone();
                thread::spawn(move || paymaster.debit_tokens(user, 7, "chat", json!({})))
            })
            .collect();

        let mut succeeded = 0;
        for handle in handles {
            match handle.join().unwrap() {
                Ok(_) => succeeded += 1,
                Err(LedgerError::InsufficientFunds { requested: 7, .. }) => (),
                Err(err) => panic!("unexpected error {:?}", err),
            }
        }

        assert_eq!(succeeded, 14);
        assert_eq!(paymaster.get_balance(user).unwrap(), 2);
        check_zero_sum(&paymaster, user);
    }

    #[test]
    fn test_conservation_over_random_operations() {
        let paymaster = paymaster();
        let user = Uuid::new_v4();
        let mut rng = rand::thread_rng();

        for _ in 0..50 {
            let amount = rng.gen_range(1, 500);
            if rng.gen_bool(0.5) {
                buy(&paymaster, user, amount);
            } else {
                match paymaster.debit_tokens(user, amount, "image generation", json!({})) {
                    Ok(receipt) => assert!(receipt.balance >= 0),
                    Err(LedgerError::InsufficientFunds { .. }) => (),
                    Err(err) => panic!("unexpected error {:?}", err),
                }
            }
            check_zero_sum(&paymaster, user);
        }
    }

    #[test]
    fn test_charge_refunds_failed_action() {
        let paymaster = paymaster();
        let user = Uuid::new_v4();
        buy(&paymaster, user, 50);

        let result: LedgerResult<()> =
            paymaster.charge_tokens(user, 30, "video generation", |receipt| {
                assert_eq!(receipt.balance, 20);
                Err(LedgerError::DatabaseError {
                    err: "provider timed out".into(),
                })
            });
        assert!(matches!(result, Err(LedgerError::DatabaseError { .. })));
        assert_eq!(paymaster.get_balance(user).unwrap(), 50);

        let log = paymaster.token_transactions(user).unwrap();
        let types: Vec<TokenTransactionType> = log.iter().map(|tx| tx.tx_type).collect();
        assert_eq!(
            types,
            vec![
                TokenTransactionType::Purchase,
                TokenTransactionType::Usage,
                TokenTransactionType::Refund
            ]
        );
        check_zero_sum(&paymaster, user);

        let value = paymaster
            .charge_tokens(user, 30, "video generation", |_| Ok("clip.mp4"))
            .unwrap();
        assert_eq!(value, "clip.mp4");
        assert_eq!(paymaster.get_balance(user).unwrap(), 20);
    }

    #[test]
    fn test_charge_refunds_when_hold_lands_mid_action() {
        let paymaster = paymaster();
        let user = Uuid::new_v4();
        buy(&paymaster, user, 50);

        let result: LedgerResult<()> = paymaster.charge_tokens(user, 30, "video generation", |_| {
            paymaster
                .store()
                .transaction(|tx| tx.place_account_hold(user, "chargeback"))?;
            Err(LedgerError::DatabaseError {
                err: "provider timed out".into(),
            })
        });
        assert!(matches!(result, Err(LedgerError::DatabaseError { .. })));
        assert_eq!(paymaster.get_balance(user).unwrap(), 50);
        check_zero_sum(&paymaster, user);

        let log = paymaster.token_transactions(user).unwrap();
        assert_eq!(log.last().map(|tx| tx.tx_type), Some(TokenTransactionType::Refund));
        assert!(matches!(
            paymaster.credit_tokens(user, 5, TokenTransactionType::Bonus, "bonus", json!({})),
            Err(LedgerError::AccountFrozen { .. })
        ));
    }

    #[test]
    fn test_charge_without_funds_skips_action() {
        let paymaster = paymaster();
        let user = Uuid::new_v4();

        let result = paymaster.charge_tokens(user, 5, "chat", |_| -> LedgerResult<()> {
            panic!("action must not run without a debit")
        });
        assert!(matches!(result, Err(LedgerError::InsufficientFunds { .. })));
    }

    #[test]
    fn test_record_usage_writes_analytics() {
        let paymaster = paymaster();
        let model = chat_model(&paymaster);

        let outcome = paymaster
            .record_usage(&UsageEvent {
                event_id: Some("log-1".into()),
                user_id: Uuid::new_v4(),
                model_id: model.id,
                tokens_consumed: 100,
                usage_type: UsageType::Chat,
            })
            .unwrap();
        assert_eq!(outcome.earnings_delta(), dec!(0.008));

        let analytics = paymaster
            .model_analytics(model.id, earnings::today())
            .unwrap()
            .unwrap();
        assert_eq!(analytics.usage_count, 1);
        assert_eq!(analytics.tokens_consumed, 100);
        assert_eq!(analytics.earnings_generated, dec!(0.008));
    }

    #[test]
    fn test_analytics_failure_is_swallowed() {
        let paymaster = paymaster();
        let model = chat_model(&paymaster);
        paymaster.store().fail_analytics(true);

        let outcome = paymaster
            .record_usage(&UsageEvent {
                event_id: None,
                user_id: Uuid::new_v4(),
                model_id: model.id,
                tokens_consumed: 100,
                usage_type: UsageType::Chat,
            })
            .unwrap();
        assert_eq!(outcome.earnings_delta(), dec!(0.008));

        let earnings = paymaster.creator_earnings(model.creator_id).unwrap();
        assert_eq!(earnings[0].total_earnings, dec!(0.008));
        assert_eq!(
            paymaster
                .model_analytics(model.id, earnings::today())
                .unwrap(),
            None
        );
    }

    struct Switch(AtomicBool);

    impl ConfigProvider for Switch {
        fn snapshot(&self) -> LedgerResult<SettingsSnapshot> {
            let mut values = SettingsSnapshot::new();
            values.insert(
                MONETIZATION_ENABLED.to_string(),
                SettingValue::Bool(self.0.load(Ordering::SeqCst)),
            );
            Ok(values)
        }
    }

    #[test]
    fn test_settings_read_at_call_time() {
        let switch = Arc::new(Switch(AtomicBool::new(false)));
        let paymaster = PayMaster::new(MemoryStore::new(), switch.clone());
        let model = chat_model(&paymaster);
        let usage = |event_id: &str| UsageEvent {
            event_id: Some(event_id.to_string()),
            user_id: Uuid::new_v4(),
            model_id: model.id,
            tokens_consumed: 100,
            usage_type: UsageType::Chat,
        };

        assert_eq!(
            paymaster.record_usage(&usage("log_1")).unwrap(),
            EarningsOutcome::Skipped(SkipReason::MonetizationDisabled)
        );

        switch.0.store(true, Ordering::SeqCst);
        match paymaster.record_usage(&usage("log_2")).unwrap() {
            EarningsOutcome::Accrued(calculation) => {
                assert_eq!(calculation.total_earnings, dec!(0.008))
            }
            other => panic!("expected accrual, got {:?}", other),
        }
    }

    #[test]
    fn test_complete_payment_once() {
        let paymaster = paymaster();
        let (buyer, referrer) = (Uuid::new_v4(), Uuid::new_v4());
        paymaster.store().set_referrer(buyer, referrer).unwrap();

        paymaster
            .create_payment_session(NewPaymentSession {
                session_id: "cs_live_1".into(),
                user_id: buyer,
                amount: dec!(20),
                tokens: 2000,
            })
            .unwrap();

        match paymaster.complete_payment("cs_live_1").unwrap() {
            PaymentOutcome::Completed {
                receipt,
                commission,
            } => {
                assert_eq!(receipt.balance, 2000);
                assert_eq!(receipt.transaction.tx_type, TokenTransactionType::Purchase);
                assert_eq!(commission.unwrap().credited_levels(), vec![1]);
            }
            other => panic!("expected completed payment, got {:?}", other),
        }

        assert_eq!(
            paymaster.complete_payment("cs_live_1").unwrap(),
            PaymentOutcome::AlreadyProcessed
        );
        assert_eq!(paymaster.get_balance(buyer).unwrap(), 2000);
        assert_eq!(
            paymaster.bonus_wallet(referrer).unwrap().unwrap().balance,
            dec!(10)
        );
        assert_eq!(paymaster.bonus_transactions(referrer).unwrap().len(), 1);
        check_zero_sum(&paymaster, buyer);

        assert!(matches!(
            paymaster.complete_payment("cs_unknown"),
            Err(LedgerError::NotFound)
        ));
    }

    #[test]
    fn test_held_buyer_payment_stays_pending() {
        let paymaster = paymaster();
        let buyer = Uuid::new_v4();
        paymaster
            .create_payment_session(NewPaymentSession {
                session_id: "cs_live_2".into(),
                user_id: buyer,
                amount: dec!(5),
                tokens: 500,
            })
            .unwrap();
        paymaster
            .store()
            .transaction(|tx| tx.place_account_hold(buyer, "review"))
            .unwrap();

        assert!(matches!(
            paymaster.complete_payment("cs_live_2"),
            Err(LedgerError::AccountFrozen { .. })
        ));
        let session = paymaster
            .store()
            .transaction(|tx| tx.payment_session("cs_live_2"))
            .unwrap()
            .unwrap();
        assert_eq!(session.status, EventStatus::Pending);

        paymaster.release_account_hold(buyer, Uuid::new_v4()).unwrap();
        assert!(matches!(
            paymaster.complete_payment("cs_live_2").unwrap(),
            PaymentOutcome::Completed { .. }
        ));
    }

    #[test]
    fn test_reconcile_holds_broken_account() {
        let paymaster = paymaster();
        let (good, bad) = (Uuid::new_v4(), Uuid::new_v4());
        buy(&paymaster, good, 10);
        buy(&paymaster, bad, 10);
        paymaster.store().corrupt_token_balance(bad, 15);

        assert!(paymaster.reconcile_account(good).unwrap().is_balanced());
        assert!(matches!(
            paymaster.reconcile_account(bad),
            Err(LedgerError::InvariantViolation { .. })
        ));
        assert!(matches!(
            paymaster.debit_tokens(bad, 1, "chat", json!({})),
            Err(LedgerError::AccountFrozen { .. })
        ));

        let summary = paymaster.reconcile_all().unwrap();
        assert_eq!(summary.checked, 2);
        assert_eq!(summary.violations, vec![bad]);

        assert!(paymaster.release_account_hold(bad, Uuid::new_v4()).unwrap());
        assert!(!paymaster.release_account_hold(bad, Uuid::new_v4()).unwrap());
    }

    #[test]
    fn test_withdrawal_round_trip() {
        let paymaster = paymaster();
        let user = Uuid::new_v4();
        let admin = Uuid::new_v4();
        paymaster
            .store()
            .transaction(|tx| tx.credit_bonus_wallet(user, dec!(100)))
            .unwrap();

        let request = paymaster
            .request_withdrawal(
                user,
                WithdrawalKind::AffiliateBonus,
                dec!(100),
                PayoutMethod::Crypto,
                json!({ "wallet_address": "0xabc", "network": "ethereum" }),
            )
            .unwrap();
        assert_eq!(
            paymaster.bonus_wallet(user).unwrap().unwrap().balance,
            Decimal::ZERO
        );

        let rejected = paymaster
            .adjudicate_withdrawal(request.id, AdminAction::Reject, admin, Some("kyc".into()))
            .unwrap();
        assert_eq!(rejected.request.status, WithdrawalStatus::Rejected);

        let wallet = paymaster.bonus_wallet(user).unwrap().unwrap();
        assert_eq!(wallet.balance, dec!(100));
        assert_eq!(wallet.withdrawn_amount, Decimal::ZERO);

        let history = paymaster.withdrawal_history(request.id).unwrap();
        assert_eq!(history.len(), 2);
        assert_eq!(history[1].performed_by, admin);
        assert_eq!(history[1].notes.as_ref().map(String::as_str), Some("kyc"));
        assert_eq!(
            paymaster.withdrawal(request.id).unwrap().status,
            WithdrawalStatus::Rejected
        );
    }
}
