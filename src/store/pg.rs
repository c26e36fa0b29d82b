//! Postgres ledger store. Amounts are stored as BIGINT ten-thousandths and
//! model rates as BIGINT hundred-millionths.

use std::collections::BTreeSet;

use chrono::{NaiveDate, NaiveDateTime, Utc};
use diesel::dsl::sql;
use diesel::pg::PgConnection;
use diesel::prelude::*;
use diesel::r2d2::{ConnectionManager, PooledConnection};
use diesel::result::{DatabaseErrorKind, Error as DieselError};
use diesel::sql_types::BigInt;
use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;
use serde_json::Value;
use uuid::Uuid;

use super::{LedgerResult, LedgerStore, LedgerTx};
use crate::database::PgPool;
use crate::error::LedgerError;
use crate::models::*;
use crate::schema::*;
use crate::settings::{ConfigProvider, SettingValue, SettingsSnapshot};
use crate::sql_types::*;

type Conn = PooledConnection<ConnectionManager<PgConnection>>;

const AMOUNT_UNITS: i64 = 10_000;
const RATE_SCALE: u32 = 8;

fn to_units(amount: Decimal) -> LedgerResult<i64> {
    (round_amount(amount) * Decimal::from(AMOUNT_UNITS))
        .to_i64()
        .ok_or_else(|| LedgerError::invalid_amount(format!("{} is out of range", amount)))
}

fn from_units(units: i64) -> Decimal {
    Decimal::new(units, AMOUNT_SCALE)
}

fn rate_from_units(units: i64) -> Decimal {
    Decimal::new(units, RATE_SCALE).normalize()
}

// SUM over BIGINT is NUMERIC in Postgres.
const TOKEN_SUM: &str = "COALESCE(SUM(amount), 0)::BIGINT";

fn now() -> NaiveDateTime {
    Utc::now().naive_utc()
}

fn conflict_on_unique(err: DieselError, detail: String) -> LedgerError {
    match err {
        DieselError::DatabaseError(DatabaseErrorKind::UniqueViolation, _) => {
            LedgerError::Conflict { detail }
        }
        err => err.into(),
    }
}

#[derive(Queryable)]
struct TokenBalanceRow {
    user_id: Uuid,
    balance: i64,
    updated_at: NaiveDateTime,
}

impl From<TokenBalanceRow> for TokenBalance {
    fn from(row: TokenBalanceRow) -> Self {
        TokenBalance {
            user_id: row.user_id,
            balance: row.balance,
            updated_at: row.updated_at,
        }
    }
}

#[derive(Queryable)]
struct TokenTransactionRow {
    id: i64,
    user_id: Uuid,
    amount: i64,
    tx_type: TokenTransactionType,
    description: String,
    metadata: Value,
    created_at: NaiveDateTime,
}

impl From<TokenTransactionRow> for TokenTransaction {
    fn from(row: TokenTransactionRow) -> Self {
        TokenTransaction {
            id: row.id,
            user_id: row.user_id,
            amount: row.amount,
            tx_type: row.tx_type,
            description: row.description,
            metadata: row.metadata,
            created_at: row.created_at,
        }
    }
}

#[derive(Insertable)]
#[table_name = "token_transactions"]
struct NewTokenTransactionRow {
    user_id: Uuid,
    amount: i64,
    tx_type: TokenTransactionType,
    description: String,
    metadata: Value,
}

#[derive(Queryable)]
struct AccountHoldRow {
    user_id: Uuid,
    reason: String,
    created_at: NaiveDateTime,
}

impl From<AccountHoldRow> for AccountHold {
    fn from(row: AccountHoldRow) -> Self {
        AccountHold {
            user_id: row.user_id,
            reason: row.reason,
            created_at: row.created_at,
        }
    }
}

#[derive(Queryable)]
struct CreatorModelRow {
    id: Uuid,
    creator_id: Uuid,
    earnings_per_use: i64,
    earnings_per_token: Option<i64>,
}

impl From<CreatorModelRow> for CreatorModel {
    fn from(row: CreatorModelRow) -> Self {
        CreatorModel {
            id: row.id,
            creator_id: row.creator_id,
            earnings_per_use: rate_from_units(row.earnings_per_use),
            earnings_per_token: row.earnings_per_token.map(rate_from_units),
        }
    }
}

#[derive(Queryable)]
struct CreatorEarningsRow {
    model_id: Uuid,
    creator_id: Uuid,
    total_usage_count: i64,
    total_tokens_consumed: i64,
    total_earnings: i64,
    last_usage_at: Option<NaiveDateTime>,
    created_at: NaiveDateTime,
    updated_at: NaiveDateTime,
}

impl From<CreatorEarningsRow> for ModelCreatorEarnings {
    fn from(row: CreatorEarningsRow) -> Self {
        ModelCreatorEarnings {
            model_id: row.model_id,
            creator_id: row.creator_id,
            total_usage_count: row.total_usage_count,
            total_tokens_consumed: row.total_tokens_consumed,
            total_earnings: from_units(row.total_earnings),
            last_usage_at: row.last_usage_at,
            created_at: row.created_at,
            updated_at: row.updated_at,
        }
    }
}

#[derive(Insertable)]
#[table_name = "model_creator_earnings"]
struct NewCreatorEarningsRow {
    model_id: Uuid,
    creator_id: Uuid,
    total_usage_count: i64,
    total_tokens_consumed: i64,
    total_earnings: i64,
    last_usage_at: Option<NaiveDateTime>,
    created_at: NaiveDateTime,
    updated_at: NaiveDateTime,
}

#[derive(Queryable)]
struct EarningsTransactionRow {
    id: i64,
    creator_id: Uuid,
    model_id: Uuid,
    amount: i64,
    transaction_type: EarningsTransactionType,
    status: EarningsStatus,
    withdrawal_request_id: Option<Uuid>,
    description: String,
    metadata: Value,
    created_at: NaiveDateTime,
}

impl From<EarningsTransactionRow> for EarningsTransaction {
    fn from(row: EarningsTransactionRow) -> Self {
        EarningsTransaction {
            id: row.id,
            creator_id: row.creator_id,
            model_id: row.model_id,
            amount: from_units(row.amount),
            transaction_type: row.transaction_type,
            status: row.status,
            withdrawal_request_id: row.withdrawal_request_id,
            description: row.description,
            metadata: row.metadata,
            created_at: row.created_at,
        }
    }
}

#[derive(Insertable)]
#[table_name = "earnings_transactions"]
struct NewEarningsTransactionRow {
    creator_id: Uuid,
    model_id: Uuid,
    amount: i64,
    transaction_type: EarningsTransactionType,
    status: EarningsStatus,
    withdrawal_request_id: Option<Uuid>,
    description: String,
    metadata: Value,
}

#[derive(Queryable)]
struct AnalyticsRow {
    model_id: Uuid,
    date: NaiveDate,
    usage_count: i64,
    tokens_consumed: i64,
    earnings_generated: i64,
}

impl From<AnalyticsRow> for ModelAnalytics {
    fn from(row: AnalyticsRow) -> Self {
        ModelAnalytics {
            model_id: row.model_id,
            date: row.date,
            usage_count: row.usage_count,
            tokens_consumed: row.tokens_consumed,
            earnings_generated: from_units(row.earnings_generated),
        }
    }
}

#[derive(Queryable)]
struct BonusWalletRow {
    user_id: Uuid,
    balance: i64,
    withdrawn_amount: i64,
    lifetime_earnings: i64,
    updated_at: NaiveDateTime,
}

impl From<BonusWalletRow> for BonusWallet {
    fn from(row: BonusWalletRow) -> Self {
        BonusWallet {
            user_id: row.user_id,
            balance: from_units(row.balance),
            withdrawn_amount: from_units(row.withdrawn_amount),
            lifetime_earnings: from_units(row.lifetime_earnings),
            updated_at: row.updated_at,
        }
    }
}

#[derive(Queryable)]
struct BonusTransactionRow {
    id: i64,
    user_id: Uuid,
    transaction_type: BonusTransactionType,
    amount: i64,
    from_user_id: Option<Uuid>,
    payment_id: Option<String>,
    level: Option<i16>,
    withdrawal_request_id: Option<Uuid>,
    status: EarningsStatus,
    created_at: NaiveDateTime,
}

impl From<BonusTransactionRow> for BonusTransaction {
    fn from(row: BonusTransactionRow) -> Self {
        BonusTransaction {
            id: row.id,
            user_id: row.user_id,
            transaction_type: row.transaction_type,
            amount: from_units(row.amount),
            from_user_id: row.from_user_id,
            payment_id: row.payment_id,
            level: row.level,
            withdrawal_request_id: row.withdrawal_request_id,
            status: row.status,
            created_at: row.created_at,
        }
    }
}

#[derive(Insertable)]
#[table_name = "bonus_transactions"]
struct NewBonusTransactionRow {
    user_id: Uuid,
    transaction_type: BonusTransactionType,
    amount: i64,
    from_user_id: Option<Uuid>,
    payment_id: Option<String>,
    level: Option<i16>,
    withdrawal_request_id: Option<Uuid>,
}

#[derive(Queryable)]
struct WithdrawalRow {
    id: Uuid,
    user_id: Uuid,
    kind: WithdrawalKind,
    amount: i64,
    reserved_amount: i64,
    payout_method: PayoutMethod,
    payment_details: Value,
    status: WithdrawalStatus,
    created_at: NaiveDateTime,
    updated_at: NaiveDateTime,
    approved_by: Option<Uuid>,
    approved_at: Option<NaiveDateTime>,
    completed_at: Option<NaiveDateTime>,
    rejection_reason: Option<String>,
    admin_notes: Option<String>,
}

impl From<WithdrawalRow> for WithdrawalRequest {
    fn from(row: WithdrawalRow) -> Self {
        WithdrawalRequest {
            id: row.id,
            user_id: row.user_id,
            kind: row.kind,
            amount: from_units(row.amount),
            reserved_amount: from_units(row.reserved_amount),
            payout_method: row.payout_method,
            payment_details: row.payment_details,
            status: row.status,
            created_at: row.created_at,
            updated_at: row.updated_at,
            approved_by: row.approved_by,
            approved_at: row.approved_at,
            completed_at: row.completed_at,
            rejection_reason: row.rejection_reason,
            admin_notes: row.admin_notes,
        }
    }
}

#[derive(Insertable)]
#[table_name = "withdrawal_requests"]
struct NewWithdrawalRow {
    id: Uuid,
    user_id: Uuid,
    kind: WithdrawalKind,
    amount: i64,
    reserved_amount: i64,
    payout_method: PayoutMethod,
    payment_details: Value,
}

#[derive(AsChangeset)]
#[table_name = "withdrawal_requests"]
#[changeset_options(treat_none_as_null = "true")]
struct WithdrawalChangeset {
    status: WithdrawalStatus,
    reserved_amount: i64,
    updated_at: NaiveDateTime,
    approved_by: Option<Uuid>,
    approved_at: Option<NaiveDateTime>,
    completed_at: Option<NaiveDateTime>,
    rejection_reason: Option<String>,
    admin_notes: Option<String>,
}

#[derive(Queryable)]
struct WithdrawalHistoryRow {
    id: i64,
    withdrawal_request_id: Uuid,
    action: WithdrawalAction,
    performed_by: Uuid,
    notes: Option<String>,
    created_at: NaiveDateTime,
}

impl From<WithdrawalHistoryRow> for WithdrawalHistory {
    fn from(row: WithdrawalHistoryRow) -> Self {
        WithdrawalHistory {
            id: row.id,
            withdrawal_request_id: row.withdrawal_request_id,
            action: row.action,
            performed_by: row.performed_by,
            notes: row.notes,
            created_at: row.created_at,
        }
    }
}

#[derive(Insertable)]
#[table_name = "withdrawal_history"]
struct NewWithdrawalHistoryRow {
    withdrawal_request_id: Uuid,
    action: WithdrawalAction,
    performed_by: Uuid,
    notes: Option<String>,
}

#[derive(Queryable)]
struct ProcessedEventRow {
    event_key: String,
    status: EventStatus,
    created_at: NaiveDateTime,
    completed_at: Option<NaiveDateTime>,
}

impl From<ProcessedEventRow> for ProcessedEvent {
    fn from(row: ProcessedEventRow) -> Self {
        ProcessedEvent {
            event_key: row.event_key,
            status: row.status,
            created_at: row.created_at,
            completed_at: row.completed_at,
        }
    }
}

#[derive(Queryable)]
struct PaymentSessionRow {
    session_id: String,
    user_id: Uuid,
    amount: i64,
    tokens: i64,
    status: EventStatus,
    created_at: NaiveDateTime,
    completed_at: Option<NaiveDateTime>,
}

impl From<PaymentSessionRow> for PaymentSession {
    fn from(row: PaymentSessionRow) -> Self {
        PaymentSession {
            session_id: row.session_id,
            user_id: row.user_id,
            amount: from_units(row.amount),
            tokens: row.tokens,
            status: row.status,
            created_at: row.created_at,
            completed_at: row.completed_at,
        }
    }
}

#[derive(Clone)]
pub struct PgStore {
    db_reader: PgPool,
    db_writer: PgPool,
}

impl PgStore {
    pub fn new(db_reader: PgPool, db_writer: PgPool) -> Self {
        PgStore {
            db_reader,
            db_writer,
        }
    }

    /// Platform settings read from `platform_settings` on the reader pool.
    pub fn settings(&self) -> PgSettings {
        PgSettings {
            db_reader: self.db_reader.clone(),
        }
    }
}

impl LedgerStore for PgStore {
    fn transaction<T, F>(&self, f: F) -> LedgerResult<T>
    where
        F: FnOnce(&mut dyn LedgerTx) -> LedgerResult<T>,
    {
        let conn = self.db_writer.get()?;
        conn.transaction::<T, LedgerError, _>(|| f(&mut PgTx { conn: &conn }))
    }
}

struct PgTx<'a> {
    conn: &'a Conn,
}

impl<'a> LedgerTx for PgTx<'a> {
    fn token_balance(&mut self, user_id: Uuid) -> LedgerResult<Option<TokenBalance>> {
        Ok(user_tokens::table
            .find(user_id)
            .first::<TokenBalanceRow>(self.conn)
            .optional()?
            .map(Into::into))
    }

    fn debit_token_balance(
        &mut self,
        user_id: Uuid,
        amount: i64,
    ) -> LedgerResult<Option<TokenBalance>> {
        use crate::schema::user_tokens::columns as cols;

        Ok(diesel::update(
            user_tokens::table
                .filter(cols::user_id.eq(user_id))
                .filter(cols::balance.ge(amount)),
        )
        .set((
            cols::balance.eq(cols::balance - amount),
            cols::updated_at.eq(now()),
        ))
        .get_result::<TokenBalanceRow>(self.conn)
        .optional()?
        .map(Into::into))
    }

    fn credit_token_balance(&mut self, user_id: Uuid, amount: i64) -> LedgerResult<TokenBalance> {
        use crate::schema::user_tokens::columns as cols;

        let timestamp = now();
        Ok(diesel::insert_into(user_tokens::table)
            .values((
                cols::user_id.eq(user_id),
                cols::balance.eq(amount),
                cols::updated_at.eq(timestamp),
            ))
            .on_conflict(cols::user_id)
            .do_update()
            .set((
                cols::balance.eq(cols::balance + amount),
                cols::updated_at.eq(timestamp),
            ))
            .get_result::<TokenBalanceRow>(self.conn)?
            .into())
    }

    fn insert_token_transaction(
        &mut self,
        tx: NewTokenTransaction,
    ) -> LedgerResult<TokenTransaction> {
        let row = NewTokenTransactionRow {
            user_id: tx.user_id,
            amount: tx.amount,
            tx_type: tx.tx_type,
            description: tx.description,
            metadata: tx.metadata,
        };
        Ok(diesel::insert_into(token_transactions::table)
            .values(&row)
            .get_result::<TokenTransactionRow>(self.conn)?
            .into())
    }

    fn token_transactions(&mut self, user_id: Uuid) -> LedgerResult<Vec<TokenTransaction>> {
        Ok(token_transactions::table
            .filter(token_transactions::user_id.eq(user_id))
            .order(token_transactions::id.asc())
            .load::<TokenTransactionRow>(self.conn)?
            .into_iter()
            .map(Into::into)
            .collect())
    }

    fn token_transaction_sum(&mut self, user_id: Uuid) -> LedgerResult<i64> {
        Ok(token_transactions::table
            .filter(token_transactions::user_id.eq(user_id))
            .select(sql::<BigInt>(TOKEN_SUM))
            .first::<i64>(self.conn)?)
    }

    fn ledger_user_ids(&mut self) -> LedgerResult<Vec<Uuid>> {
        let mut ids = BTreeSet::new();
        ids.extend(
            user_tokens::table
                .select(user_tokens::user_id)
                .load::<Uuid>(self.conn)?,
        );
        ids.extend(
            token_transactions::table
                .select(token_transactions::user_id)
                .distinct()
                .load::<Uuid>(self.conn)?,
        );
        ids.extend(
            bonus_wallets::table
                .select(bonus_wallets::user_id)
                .load::<Uuid>(self.conn)?,
        );
        Ok(ids.into_iter().collect())
    }

    fn account_hold(&mut self, user_id: Uuid) -> LedgerResult<Option<AccountHold>> {
        Ok(account_holds::table
            .find(user_id)
            .first::<AccountHoldRow>(self.conn)
            .optional()?
            .map(Into::into))
    }

    fn place_account_hold(&mut self, user_id: Uuid, reason: &str) -> LedgerResult<AccountHold> {
        diesel::insert_into(account_holds::table)
            .values((
                account_holds::user_id.eq(user_id),
                account_holds::reason.eq(reason),
                account_holds::created_at.eq(now()),
            ))
            .on_conflict(account_holds::user_id)
            .do_nothing()
            .execute(self.conn)?;
        Ok(account_holds::table
            .find(user_id)
            .first::<AccountHoldRow>(self.conn)?
            .into())
    }

    fn release_account_hold(&mut self, user_id: Uuid) -> LedgerResult<bool> {
        Ok(diesel::delete(account_holds::table.find(user_id)).execute(self.conn)? > 0)
    }

    fn model(&mut self, model_id: Uuid) -> LedgerResult<Option<CreatorModel>> {
        Ok(creator_models::table
            .find(model_id)
            .first::<CreatorModelRow>(self.conn)
            .optional()?
            .map(Into::into))
    }

    fn referrer_of(&mut self, user_id: Uuid) -> LedgerResult<Option<Uuid>> {
        Ok(users::table
            .find(user_id)
            .select(users::referrer_id)
            .first::<Option<Uuid>>(self.conn)
            .optional()?
            .and_then(|referrer| referrer))
    }

    fn creator_earnings(&mut self, model_id: Uuid) -> LedgerResult<Option<ModelCreatorEarnings>> {
        Ok(model_creator_earnings::table
            .find(model_id)
            .first::<CreatorEarningsRow>(self.conn)
            .optional()?
            .map(Into::into))
    }

    fn creator_earnings_for(
        &mut self,
        creator_id: Uuid,
    ) -> LedgerResult<Vec<ModelCreatorEarnings>> {
        Ok(model_creator_earnings::table
            .filter(model_creator_earnings::creator_id.eq(creator_id))
            .order((
                model_creator_earnings::created_at.asc(),
                model_creator_earnings::model_id.asc(),
            ))
            .for_update()
            .load::<CreatorEarningsRow>(self.conn)?
            .into_iter()
            .map(Into::into)
            .collect())
    }

    fn accrue_creator_earnings(
        &mut self,
        accrual: EarningsAccrual,
    ) -> LedgerResult<ModelCreatorEarnings> {
        use crate::schema::model_creator_earnings::columns::*;

        let timestamp = now();
        let earnings = to_units(accrual.earnings)?;
        let row = NewCreatorEarningsRow {
            model_id: accrual.model_id,
            creator_id: accrual.creator_id,
            total_usage_count: accrual.usage_count,
            total_tokens_consumed: accrual.tokens_consumed,
            total_earnings: earnings,
            last_usage_at: if accrual.usage_count > 0 {
                Some(timestamp)
            } else {
                None
            },
            created_at: timestamp,
            updated_at: timestamp,
        };

        let upsert = diesel::insert_into(model_creator_earnings::table)
            .values(&row)
            .on_conflict(model_id)
            .do_update();

        // Admin credits leave last_usage_at untouched.
        let accrued = if accrual.usage_count > 0 {
            upsert
                .set((
                    total_usage_count.eq(total_usage_count + accrual.usage_count),
                    total_tokens_consumed.eq(total_tokens_consumed + accrual.tokens_consumed),
                    total_earnings.eq(total_earnings + earnings),
                    last_usage_at.eq(Some(timestamp)),
                    updated_at.eq(timestamp),
                ))
                .get_result::<CreatorEarningsRow>(self.conn)?
        } else {
            upsert
                .set((
                    total_tokens_consumed.eq(total_tokens_consumed + accrual.tokens_consumed),
                    total_earnings.eq(total_earnings + earnings),
                    updated_at.eq(timestamp),
                ))
                .get_result::<CreatorEarningsRow>(self.conn)?
        };
        Ok(accrued.into())
    }

    fn adjust_creator_earnings(
        &mut self,
        model_id: Uuid,
        delta: Decimal,
    ) -> LedgerResult<Option<ModelCreatorEarnings>> {
        use crate::schema::model_creator_earnings::columns as cols;

        let delta = to_units(delta)?;
        Ok(diesel::update(
            model_creator_earnings::table
                .filter(cols::model_id.eq(model_id))
                .filter(cols::total_earnings.ge(-delta)),
        )
        .set((
            cols::total_earnings.eq(cols::total_earnings + delta),
            cols::updated_at.eq(now()),
        ))
        .get_result::<CreatorEarningsRow>(self.conn)
        .optional()?
        .map(Into::into))
    }

    fn insert_earnings_transaction(
        &mut self,
        tx: NewEarningsTransaction,
    ) -> LedgerResult<EarningsTransaction> {
        let row = NewEarningsTransactionRow {
            creator_id: tx.creator_id,
            model_id: tx.model_id,
            amount: to_units(tx.amount)?,
            transaction_type: tx.transaction_type,
            status: tx.status,
            withdrawal_request_id: tx.withdrawal_request_id,
            description: tx.description,
            metadata: tx.metadata,
        };
        Ok(diesel::insert_into(earnings_transactions::table)
            .values(&row)
            .get_result::<EarningsTransactionRow>(self.conn)?
            .into())
    }

    fn earnings_transactions(
        &mut self,
        creator_id: Uuid,
    ) -> LedgerResult<Vec<EarningsTransaction>> {
        Ok(earnings_transactions::table
            .filter(earnings_transactions::creator_id.eq(creator_id))
            .order(earnings_transactions::id.asc())
            .load::<EarningsTransactionRow>(self.conn)?
            .into_iter()
            .map(Into::into)
            .collect())
    }

    fn earnings_transactions_for_withdrawal(
        &mut self,
        withdrawal_request_id: Uuid,
    ) -> LedgerResult<Vec<EarningsTransaction>> {
        Ok(earnings_transactions::table
            .filter(earnings_transactions::withdrawal_request_id.eq(withdrawal_request_id))
            .order(earnings_transactions::id.asc())
            .load::<EarningsTransactionRow>(self.conn)?
            .into_iter()
            .map(Into::into)
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
        use crate::schema::model_analytics::columns as cols;

        let earnings = to_units(earnings)?;
        Ok(diesel::insert_into(model_analytics::table)
            .values((
                cols::model_id.eq(model_id),
                cols::date.eq(date),
                cols::usage_count.eq(usage_count),
                cols::tokens_consumed.eq(tokens_consumed),
                cols::earnings_generated.eq(earnings),
            ))
            .on_conflict((cols::model_id, cols::date))
            .do_update()
            .set((
                cols::usage_count.eq(cols::usage_count + usage_count),
                cols::tokens_consumed.eq(cols::tokens_consumed + tokens_consumed),
                cols::earnings_generated.eq(cols::earnings_generated + earnings),
            ))
            .get_result::<AnalyticsRow>(self.conn)?
            .into())
    }

    fn model_analytics(
        &mut self,
        model_id: Uuid,
        date: NaiveDate,
    ) -> LedgerResult<Option<ModelAnalytics>> {
        Ok(model_analytics::table
            .find((model_id, date))
            .first::<AnalyticsRow>(self.conn)
            .optional()?
            .map(Into::into))
    }

    fn bonus_wallet(&mut self, user_id: Uuid) -> LedgerResult<Option<BonusWallet>> {
        Ok(bonus_wallets::table
            .find(user_id)
            .first::<BonusWalletRow>(self.conn)
            .optional()?
            .map(Into::into))
    }

    fn credit_bonus_wallet(
        &mut self,
        user_id: Uuid,
        amount: Decimal,
    ) -> LedgerResult<BonusWallet> {
        use crate::schema::bonus_wallets::columns as cols;

        let amount = to_units(amount)?;
        let timestamp = now();
        Ok(diesel::insert_into(bonus_wallets::table)
            .values((
                cols::user_id.eq(user_id),
                cols::balance.eq(amount),
                cols::withdrawn_amount.eq(0),
                cols::lifetime_earnings.eq(amount),
                cols::updated_at.eq(timestamp),
            ))
            .on_conflict(cols::user_id)
            .do_update()
            .set((
                cols::balance.eq(cols::balance + amount),
                cols::lifetime_earnings.eq(cols::lifetime_earnings + amount),
                cols::updated_at.eq(timestamp),
            ))
            .get_result::<BonusWalletRow>(self.conn)?
            .into())
    }

    fn reserve_bonus_balance(
        &mut self,
        user_id: Uuid,
        amount: Decimal,
    ) -> LedgerResult<Option<BonusWallet>> {
        use crate::schema::bonus_wallets::columns as cols;

        let amount = to_units(amount)?;
        Ok(diesel::update(
            bonus_wallets::table
                .filter(cols::user_id.eq(user_id))
                .filter(cols::balance.ge(amount)),
        )
        .set((
            cols::balance.eq(cols::balance - amount),
            cols::withdrawn_amount.eq(cols::withdrawn_amount + amount),
            cols::updated_at.eq(now()),
        ))
        .get_result::<BonusWalletRow>(self.conn)
        .optional()?
        .map(Into::into))
    }

    fn release_bonus_reservation(
        &mut self,
        user_id: Uuid,
        amount: Decimal,
    ) -> LedgerResult<BonusWallet> {
        use crate::schema::bonus_wallets::columns as cols;

        let amount = to_units(amount)?;
        Ok(diesel::update(bonus_wallets::table.find(user_id))
            .set((
                cols::balance.eq(cols::balance + amount),
                cols::withdrawn_amount.eq(cols::withdrawn_amount - amount),
                cols::updated_at.eq(now()),
            ))
            .get_result::<BonusWalletRow>(self.conn)?
            .into())
    }

    fn insert_bonus_transaction(
        &mut self,
        tx: NewBonusTransaction,
    ) -> LedgerResult<BonusTransaction> {
        let detail = format!(
            "payment {:?} already paid level {:?}",
            tx.payment_id, tx.level
        );
        let row = NewBonusTransactionRow {
            user_id: tx.user_id,
            transaction_type: tx.transaction_type,
            amount: to_units(tx.amount)?,
            from_user_id: tx.from_user_id,
            payment_id: tx.payment_id,
            level: tx.level,
            withdrawal_request_id: tx.withdrawal_request_id,
        };
        diesel::insert_into(bonus_transactions::table)
            .values(&row)
            .get_result::<BonusTransactionRow>(self.conn)
            .map(Into::into)
            .map_err(|err| conflict_on_unique(err, detail))
    }

    fn bonus_transactions(&mut self, user_id: Uuid) -> LedgerResult<Vec<BonusTransaction>> {
        Ok(bonus_transactions::table
            .filter(bonus_transactions::user_id.eq(user_id))
            .order(bonus_transactions::id.asc())
            .load::<BonusTransactionRow>(self.conn)?
            .into_iter()
            .map(Into::into)
            .collect())
    }

    fn bonus_transactions_for_payment(
        &mut self,
        payment_id: &str,
    ) -> LedgerResult<Vec<BonusTransaction>> {
        Ok(bonus_transactions::table
            .filter(bonus_transactions::payment_id.eq(payment_id))
            .order(bonus_transactions::id.asc())
            .load::<BonusTransactionRow>(self.conn)?
            .into_iter()
            .map(Into::into)
            .collect())
    }

    fn insert_withdrawal(
        &mut self,
        request: NewWithdrawalRequest,
    ) -> LedgerResult<WithdrawalRequest> {
        let detail = format!("user {} already has an open withdrawal", request.user_id);
        let row = NewWithdrawalRow {
            id: Uuid::new_v4(),
            user_id: request.user_id,
            kind: request.kind,
            amount: to_units(request.amount)?,
            reserved_amount: to_units(request.reserved_amount)?,
            payout_method: request.payout_method,
            payment_details: request.payment_details,
        };
        diesel::insert_into(withdrawal_requests::table)
            .values(&row)
            .get_result::<WithdrawalRow>(self.conn)
            .map(Into::into)
            .map_err(|err| conflict_on_unique(err, detail))
    }

    fn withdrawal(&mut self, id: Uuid) -> LedgerResult<Option<WithdrawalRequest>> {
        Ok(withdrawal_requests::table
            .find(id)
            .for_update()
            .first::<WithdrawalRow>(self.conn)
            .optional()?
            .map(Into::into))
    }

    fn open_withdrawal_for(&mut self, user_id: Uuid) -> LedgerResult<Option<WithdrawalRequest>> {
        use crate::schema::withdrawal_requests::columns as cols;
        use diesel::sql_types::Text;

        // Serializes withdrawal checks per user until the unit of work ends.
        diesel::sql_query("SELECT pg_advisory_xact_lock(hashtext($1))")
            .bind::<Text, _>(user_id.to_string())
            .execute(self.conn)?;

        Ok(withdrawal_requests::table
            .filter(cols::user_id.eq(user_id))
            .filter(cols::status.ne(WithdrawalStatus::Completed))
            .filter(cols::status.ne(WithdrawalStatus::Rejected))
            .first::<WithdrawalRow>(self.conn)
            .optional()?
            .map(Into::into))
    }

    fn update_withdrawal(
        &mut self,
        id: Uuid,
        expected: WithdrawalStatus,
        update: WithdrawalUpdate,
    ) -> LedgerResult<Option<WithdrawalRequest>> {
        use crate::schema::withdrawal_requests::columns as cols;

        let changeset = WithdrawalChangeset {
            status: update.status,
            reserved_amount: to_units(update.reserved_amount)?,
            updated_at: now(),
            approved_by: update.approved_by,
            approved_at: update.approved_at,
            completed_at: update.completed_at,
            rejection_reason: update.rejection_reason,
            admin_notes: update.admin_notes,
        };
        let detail = format!("withdrawal {} cannot be reopened", id);
        diesel::update(
            withdrawal_requests::table
                .filter(cols::id.eq(id))
                .filter(cols::status.eq(expected)),
        )
        .set(&changeset)
        .get_result::<WithdrawalRow>(self.conn)
        .optional()
        .map(|row| row.map(Into::into))
        .map_err(|err| conflict_on_unique(err, detail))
    }

    fn insert_withdrawal_history(
        &mut self,
        entry: NewWithdrawalHistory,
    ) -> LedgerResult<WithdrawalHistory> {
        let row = NewWithdrawalHistoryRow {
            withdrawal_request_id: entry.withdrawal_request_id,
            action: entry.action,
            performed_by: entry.performed_by,
            notes: entry.notes,
        };
        Ok(diesel::insert_into(withdrawal_history::table)
            .values(&row)
            .get_result::<WithdrawalHistoryRow>(self.conn)?
            .into())
    }

    fn withdrawal_history(&mut self, id: Uuid) -> LedgerResult<Vec<WithdrawalHistory>> {
        Ok(withdrawal_history::table
            .filter(withdrawal_history::withdrawal_request_id.eq(id))
            .order(withdrawal_history::id.asc())
            .load::<WithdrawalHistoryRow>(self.conn)?
            .into_iter()
            .map(Into::into)
            .collect())
    }

    fn processed_event(&mut self, event_key: &str) -> LedgerResult<Option<ProcessedEvent>> {
        Ok(processed_events::table
            .find(event_key)
            .first::<ProcessedEventRow>(self.conn)
            .optional()?
            .map(Into::into))
    }

    fn claim_event(&mut self, event_key: &str) -> LedgerResult<bool> {
        use crate::schema::processed_events::columns as cols;

        let inserted = diesel::insert_into(processed_events::table)
            .values((
                cols::event_key.eq(event_key),
                cols::status.eq(EventStatus::Pending),
                cols::created_at.eq(now()),
            ))
            .on_conflict(cols::event_key)
            .do_nothing()
            .execute(self.conn)?;
        Ok(inserted == 1)
    }

    fn complete_event(&mut self, event_key: &str) -> LedgerResult<bool> {
        use crate::schema::processed_events::columns as cols;

        let updated = diesel::update(
            processed_events::table
                .filter(cols::event_key.eq(event_key))
                .filter(cols::status.eq(EventStatus::Pending)),
        )
        .set((
            cols::status.eq(EventStatus::Completed),
            cols::completed_at.eq(Some(now())),
        ))
        .execute(self.conn)?;
        Ok(updated == 1)
    }

    fn insert_payment_session(
        &mut self,
        session: NewPaymentSession,
    ) -> LedgerResult<PaymentSession> {
        use crate::schema::payment_sessions::columns as cols;

        let detail = format!("payment session {} exists", session.session_id);
        diesel::insert_into(payment_sessions::table)
            .values((
                cols::session_id.eq(session.session_id),
                cols::user_id.eq(session.user_id),
                cols::amount.eq(to_units(session.amount)?),
                cols::tokens.eq(session.tokens),
                cols::status.eq(EventStatus::Pending),
                cols::created_at.eq(now()),
            ))
            .get_result::<PaymentSessionRow>(self.conn)
            .map(Into::into)
            .map_err(|err| conflict_on_unique(err, detail))
    }

    fn payment_session(&mut self, session_id: &str) -> LedgerResult<Option<PaymentSession>> {
        Ok(payment_sessions::table
            .find(session_id)
            .first::<PaymentSessionRow>(self.conn)
            .optional()?
            .map(Into::into))
    }

    fn complete_payment_session(&mut self, session_id: &str) -> LedgerResult<bool> {
        use crate::schema::payment_sessions::columns as cols;

        let updated = diesel::update(
            payment_sessions::table
                .filter(cols::session_id.eq(session_id))
                .filter(cols::status.eq(EventStatus::Pending)),
        )
        .set((
            cols::status.eq(EventStatus::Completed),
            cols::completed_at.eq(Some(now())),
        ))
        .execute(self.conn)?;
        Ok(updated == 1)
    }
}

/// Reads `platform_settings` rows, parsing each value once.
#[derive(Clone)]
pub struct PgSettings {
    db_reader: PgPool,
}

impl ConfigProvider for PgSettings {
    fn snapshot(&self) -> Result<SettingsSnapshot, LedgerError> {
        let conn = self.db_reader.get()?;
        let rows = platform_settings::table
            .select((platform_settings::key, platform_settings::value))
            .load::<(String, String)>(&conn)?;

        Ok(rows
            .into_iter()
            .map(|(key, value)| (key, SettingValue::parse(&value)))
            .collect())
    }
}
