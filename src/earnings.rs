//! Creator earnings accrued from model usage.

use std::fmt;

use chrono::{NaiveDate, Utc};
use rust_decimal::Decimal;
use serde_json::json;
use uuid::Uuid;

use crate::error::LedgerError;
use crate::idempotency::{apply_once, event_key, Claim, EventSource};
use crate::models::*;
use crate::settings::LedgerSettings;
use crate::sql_types::{EarningsStatus, EarningsTransactionType};
use crate::store::{LedgerResult, LedgerTx};
use crate::token_account::ensure_writable;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UsageType {
    ImageGeneration,
    Chat,
    Other,
}

impl UsageType {
    pub fn multiplier(self) -> Decimal {
        match self {
            UsageType::ImageGeneration => Decimal::ONE,
            UsageType::Chat => Decimal::new(8, 1),
            UsageType::Other => Decimal::new(6, 1),
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            UsageType::ImageGeneration => "image_generation",
            UsageType::Chat => "chat",
            UsageType::Other => "other",
        }
    }
}

impl fmt::Display for UsageType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl From<&str> for UsageType {
    fn from(s: &str) -> Self {
        match s {
            "image_generation" => UsageType::ImageGeneration,
            "chat" => UsageType::Chat,
            _ => UsageType::Other,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct UsageEvent {
    /// Usage log id; replays of the same id are applied once.
    pub event_id: Option<String>,
    pub user_id: Uuid,
    pub model_id: Uuid,
    pub tokens_consumed: i64,
    pub usage_type: UsageType,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct EarningsCalculation {
    pub model_id: Uuid,
    pub creator_id: Uuid,
    pub tokens_consumed: i64,
    pub base_earnings: Decimal,
    pub type_multiplier: Decimal,
    pub total_earnings: Decimal,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SkipReason {
    ModelNotFound,
    MonetizationDisabled,
    CreatorOnHold,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub enum EarningsOutcome {
    Accrued(EarningsCalculation),
    Skipped(SkipReason),
    AlreadyProcessed,
}

impl EarningsOutcome {
    pub fn earnings_delta(&self) -> Decimal {
        match self {
            EarningsOutcome::Accrued(calculation) => calculation.total_earnings,
            _ => Decimal::ZERO,
        }
    }
}

pub fn calculate_earnings(
    model: &CreatorModel,
    default_earnings_per_token: Decimal,
    tokens_consumed: i64,
    usage_type: UsageType,
) -> EarningsCalculation {
    let per_token = model
        .earnings_per_token
        .unwrap_or(default_earnings_per_token);
    let base_earnings = model.earnings_per_use + Decimal::from(tokens_consumed) * per_token;
    let type_multiplier = usage_type.multiplier();

    EarningsCalculation {
        model_id: model.id,
        creator_id: model.creator_id,
        tokens_consumed,
        base_earnings,
        type_multiplier,
        total_earnings: round_amount(base_earnings * type_multiplier),
    }
}

/// Appends the usage earnings transaction and bumps the model's aggregate.
/// Daily analytics are written separately by `record_analytics`.
pub fn accrue_usage(
    tx: &mut dyn LedgerTx,
    settings: &LedgerSettings,
    event: &UsageEvent,
) -> LedgerResult<EarningsOutcome> {
    if event.tokens_consumed < 0 {
        return Err(LedgerError::invalid_amount(format!(
            "tokens consumed must not be negative, got {}",
            event.tokens_consumed
        )));
    }

    if let Some(event_id) = &event.event_id {
        if let Claim::AlreadyProcessed = apply_once(tx, &event_key(EventSource::Usage, event_id))? {
            debug!("usage event {} already applied", event_id);
            return Ok(EarningsOutcome::AlreadyProcessed);
        }
    }

    if !settings.monetization_enabled {
        return Ok(EarningsOutcome::Skipped(SkipReason::MonetizationDisabled));
    }

    let model = match tx.model(event.model_id)? {
        Some(model) => model,
        None => {
            warn!(
                "no model {} for usage by {}, skipping earnings",
                event.model_id, event.user_id
            );
            return Ok(EarningsOutcome::Skipped(SkipReason::ModelNotFound));
        }
    };

    match ensure_writable(tx, model.creator_id) {
        Ok(()) => {}
        Err(LedgerError::AccountFrozen { reason, .. }) => {
            warn!(
                "creator {} of model {} is held ({}), skipping earnings",
                model.creator_id, model.id, reason
            );
            return Ok(EarningsOutcome::Skipped(SkipReason::CreatorOnHold));
        }
        Err(err) => return Err(err),
    }

    let calculation = calculate_earnings(
        &model,
        settings.default_earnings_per_token,
        event.tokens_consumed,
        event.usage_type,
    );

    tx.insert_earnings_transaction(NewEarningsTransaction {
        creator_id: calculation.creator_id,
        model_id: calculation.model_id,
        amount: calculation.total_earnings,
        transaction_type: EarningsTransactionType::Usage,
        status: EarningsStatus::Completed,
        withdrawal_request_id: None,
        description: format!("{} usage", event.usage_type),
        metadata: json!({
            "user_id": event.user_id,
            "usage_type": event.usage_type,
            "tokens_consumed": event.tokens_consumed,
            "event_id": event.event_id,
        }),
    })?;

    tx.accrue_creator_earnings(EarningsAccrual {
        model_id: calculation.model_id,
        creator_id: calculation.creator_id,
        usage_count: 1,
        tokens_consumed: event.tokens_consumed,
        earnings: calculation.total_earnings,
    })?;

    Ok(EarningsOutcome::Accrued(calculation))
}

pub fn record_analytics(
    tx: &mut dyn LedgerTx,
    calculation: &EarningsCalculation,
    date: NaiveDate,
) -> LedgerResult<ModelAnalytics> {
    tx.bump_model_analytics(
        calculation.model_id,
        date,
        1,
        calculation.tokens_consumed,
        calculation.total_earnings,
    )
}

pub fn today() -> NaiveDate {
    Utc::now().naive_utc().date()
}

/// Credits earnings to a model's creator outside of usage, e.g. a manual
/// correction.
pub fn add_admin_earnings(
    tx: &mut dyn LedgerTx,
    model_id: Uuid,
    amount: Decimal,
    admin_id: Uuid,
    note: &str,
) -> LedgerResult<ModelCreatorEarnings> {
    let amount = round_amount(amount);
    if amount <= Decimal::ZERO {
        return Err(LedgerError::invalid_amount(format!(
            "earnings credit must be positive, got {}",
            amount
        )));
    }
    let model = tx.model(model_id)?.ok_or(LedgerError::NotFound)?;
    ensure_writable(tx, model.creator_id)?;

    tx.insert_earnings_transaction(NewEarningsTransaction {
        creator_id: model.creator_id,
        model_id,
        amount,
        transaction_type: EarningsTransactionType::AdminCredit,
        status: EarningsStatus::Completed,
        withdrawal_request_id: None,
        description: note.to_string(),
        metadata: json!({ "added_by_admin": admin_id }),
    })?;

    let earnings = tx.accrue_creator_earnings(EarningsAccrual {
        model_id,
        creator_id: model.creator_id,
        usage_count: 0,
        tokens_consumed: 0,
        earnings: amount,
    })?;

    info!(
        "admin {} credited {} to creator {} on model {}",
        admin_id, amount, model.creator_id, model_id
    );
    Ok(earnings)
}

/// Sum of `total_earnings` across the creator's models.
pub fn available_earnings(tx: &mut dyn LedgerTx, creator_id: Uuid) -> LedgerResult<Decimal> {
    Ok(tx
        .creator_earnings_for(creator_id)?
        .iter()
        .map(|row| row.total_earnings)
        .sum())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{LedgerStore, MemoryStore};
    use rust_decimal_macros::dec;

    fn model(creator_id: Uuid, per_use: Decimal, per_token: Option<Decimal>) -> CreatorModel {
        CreatorModel {
            id: Uuid::new_v4(),
            creator_id,
            earnings_per_use: per_use,
            earnings_per_token: per_token,
        }
    }

    fn usage(model_id: Uuid, tokens: i64, usage_type: UsageType) -> UsageEvent {
        UsageEvent {
            event_id: None,
            user_id: Uuid::new_v4(),
            model_id,
            tokens_consumed: tokens,
            usage_type,
        }
    }

    #[test]
    fn test_calculate_earnings() {
        let creator = Uuid::new_v4();

        let chat = calculate_earnings(
            &model(creator, Decimal::ZERO, Some(dec!(0.0001))),
            dec!(0.0001),
            100,
            UsageType::Chat,
        );
        assert_eq!(chat.base_earnings, dec!(0.01));
        assert_eq!(chat.total_earnings, dec!(0.008));

        let image = calculate_earnings(
            &model(creator, dec!(0.05), None),
            dec!(0.0002),
            250,
            UsageType::ImageGeneration,
        );
        assert_eq!(image.total_earnings, dec!(0.1));

        // 0.00015 * 0.6 = 0.00009, rounds half away from zero to 0.0001
        let other = calculate_earnings(
            &model(creator, Decimal::ZERO, Some(dec!(0.00015))),
            dec!(0.0001),
            1,
            UsageType::Other,
        );
        assert_eq!(other.total_earnings, dec!(0.0001));
    }

    #[test]
    fn test_usage_type_from_str() {
        assert_eq!(UsageType::from("chat"), UsageType::Chat);
        assert_eq!(UsageType::from("image_generation"), UsageType::ImageGeneration);
        assert_eq!(UsageType::from("video"), UsageType::Other);
    }

    #[test]
    fn test_accrue_usage() {
        let store = MemoryStore::new();
        let creator = Uuid::new_v4();
        let m = model(creator, Decimal::ZERO, Some(dec!(0.0001)));
        store.insert_model(m.clone()).unwrap();
        let settings = LedgerSettings::default();

        let outcome = store
            .transaction(|tx| accrue_usage(tx, &settings, &usage(m.id, 100, UsageType::Chat)))
            .unwrap();
        assert_eq!(outcome.earnings_delta(), dec!(0.008));

        store
            .transaction(|tx| accrue_usage(tx, &settings, &usage(m.id, 50, UsageType::Chat)))
            .unwrap();

        let row = store
            .transaction(|tx| tx.creator_earnings(m.id))
            .unwrap()
            .unwrap();
        assert_eq!(row.creator_id, creator);
        assert_eq!(row.total_usage_count, 2);
        assert_eq!(row.total_tokens_consumed, 150);
        assert_eq!(row.total_earnings, dec!(0.012));
        assert!(row.last_usage_at.is_some());

        let log = store
            .transaction(|tx| tx.earnings_transactions(creator))
            .unwrap();
        assert_eq!(log.len(), 2);
        assert!(log
            .iter()
            .all(|tx| tx.transaction_type == EarningsTransactionType::Usage));
    }

    #[test]
    fn test_missing_model_is_skipped() {
        let store = MemoryStore::new();
        let settings = LedgerSettings::default();

        let outcome = store
            .transaction(|tx| {
                accrue_usage(tx, &settings, &usage(Uuid::new_v4(), 10, UsageType::Chat))
            })
            .unwrap();
        assert_eq!(outcome, EarningsOutcome::Skipped(SkipReason::ModelNotFound));
    }

    #[test]
    fn test_monetization_disabled() {
        let store = MemoryStore::new();
        let m = model(Uuid::new_v4(), dec!(1), None);
        store.insert_model(m.clone()).unwrap();
        let settings = LedgerSettings {
            monetization_enabled: false,
            ..LedgerSettings::default()
        };

        let outcome = store
            .transaction(|tx| accrue_usage(tx, &settings, &usage(m.id, 10, UsageType::Chat)))
            .unwrap();
        assert_eq!(
            outcome,
            EarningsOutcome::Skipped(SkipReason::MonetizationDisabled)
        );
        assert_eq!(store.transaction(|tx| tx.creator_earnings(m.id)).unwrap(), None);
    }

    #[test]
    fn test_held_creator_is_skipped() {
        let store = MemoryStore::new();
        let creator = Uuid::new_v4();
        let m = model(creator, dec!(1), None);
        store.insert_model(m.clone()).unwrap();
        store
            .transaction(|tx| tx.place_account_hold(creator, "balance mismatch"))
            .unwrap();
        let settings = LedgerSettings::default();
        let event = UsageEvent {
            event_id: Some("log-held".into()),
            ..usage(m.id, 10, UsageType::ImageGeneration)
        };

        let outcome = store
            .transaction(|tx| accrue_usage(tx, &settings, &event))
            .unwrap();
        assert_eq!(outcome, EarningsOutcome::Skipped(SkipReason::CreatorOnHold));
        assert_eq!(outcome.earnings_delta(), Decimal::ZERO);
        assert_eq!(store.transaction(|tx| tx.creator_earnings(m.id)).unwrap(), None);
        assert!(store
            .transaction(|tx| tx.earnings_transactions(creator))
            .unwrap()
            .is_empty());
    }

    #[test]
    fn test_admin_earnings_for_held_creator() {
        let store = MemoryStore::new();
        let creator = Uuid::new_v4();
        let m = model(creator, Decimal::ZERO, None);
        store.insert_model(m.clone()).unwrap();
        store
            .transaction(|tx| tx.place_account_hold(creator, "balance mismatch"))
            .unwrap();

        assert!(matches!(
            store.transaction(|tx| add_admin_earnings(tx, m.id, dec!(5), Uuid::new_v4(), "bonus")),
            Err(LedgerError::AccountFrozen { .. })
        ));
        assert_eq!(store.transaction(|tx| tx.creator_earnings(m.id)).unwrap(), None);
    }

    #[test]
    fn test_replayed_usage_event() {
        let store = MemoryStore::new();
        let m = model(Uuid::new_v4(), Decimal::ZERO, Some(dec!(0.001)));
        store.insert_model(m.clone()).unwrap();
        let settings = LedgerSettings::default();
        let event = UsageEvent {
            event_id: Some("log-99".into()),
            ..usage(m.id, 1000, UsageType::ImageGeneration)
        };

        let first = store
            .transaction(|tx| accrue_usage(tx, &settings, &event))
            .unwrap();
        assert_eq!(first.earnings_delta(), dec!(1));
        let second = store
            .transaction(|tx| accrue_usage(tx, &settings, &event))
            .unwrap();
        assert_eq!(second, EarningsOutcome::AlreadyProcessed);

        let row = store
            .transaction(|tx| tx.creator_earnings(m.id))
            .unwrap()
            .unwrap();
        assert_eq!(row.total_usage_count, 1);
        assert_eq!(row.total_earnings, dec!(1));
    }

    #[test]
    fn test_add_admin_earnings() {
        let store = MemoryStore::new();
        let creator = Uuid::new_v4();
        let admin = Uuid::new_v4();
        let m = model(creator, Decimal::ZERO, None);
        store.insert_model(m.clone()).unwrap();

        let row = store
            .transaction(|tx| add_admin_earnings(tx, m.id, dec!(12.5), admin, "launch bonus"))
            .unwrap();
        assert_eq!(row.total_earnings, dec!(12.5));
        assert_eq!(row.total_usage_count, 0);

        let log = store
            .transaction(|tx| tx.earnings_transactions(creator))
            .unwrap();
        assert_eq!(log[0].transaction_type, EarningsTransactionType::AdminCredit);
        assert_eq!(log[0].metadata["added_by_admin"], json!(admin));

        assert!(matches!(
            store.transaction(|tx| add_admin_earnings(tx, m.id, dec!(0), admin, "noop")),
            Err(LedgerError::InvalidAmount { .. })
        ));
        assert!(matches!(
            store.transaction(|tx| add_admin_earnings(
                tx,
                Uuid::new_v4(),
                dec!(1),
                admin,
                "no such model"
            )),
            Err(LedgerError::NotFound)
        ));
    }
}
