table! {
    use diesel::sql_types::*;
    use crate::sql_types::*;

    account_holds (user_id) {
        user_id -> Uuid,
        reason -> Text,
        created_at -> Timestamp,
    }
}

table! {
    use diesel::sql_types::*;
    use crate::sql_types::*;

    bonus_transactions (id) {
        id -> Int8,
        user_id -> Uuid,
        transaction_type -> Bonus_transaction_type,
        amount -> Int8,
        from_user_id -> Nullable<Uuid>,
        payment_id -> Nullable<Text>,
        level -> Nullable<Int2>,
        withdrawal_request_id -> Nullable<Uuid>,
        status -> Earnings_status,
        created_at -> Timestamp,
    }
}

table! {
    use diesel::sql_types::*;
    use crate::sql_types::*;

    bonus_wallets (user_id) {
        user_id -> Uuid,
        balance -> Int8,
        withdrawn_amount -> Int8,
        lifetime_earnings -> Int8,
        updated_at -> Timestamp,
    }
}

table! {
    use diesel::sql_types::*;
    use crate::sql_types::*;

    creator_models (id) {
        id -> Uuid,
        creator_id -> Uuid,
        earnings_per_use -> Int8,
        earnings_per_token -> Nullable<Int8>,
    }
}

table! {
    use diesel::sql_types::*;
    use crate::sql_types::*;

    earnings_transactions (id) {
        id -> Int8,
        creator_id -> Uuid,
        model_id -> Uuid,
        amount -> Int8,
        transaction_type -> Earnings_transaction_type,
        status -> Earnings_status,
        withdrawal_request_id -> Nullable<Uuid>,
        description -> Text,
        metadata -> Jsonb,
        created_at -> Timestamp,
    }
}

table! {
    use diesel::sql_types::*;
    use crate::sql_types::*;

    model_analytics (model_id, date) {
        model_id -> Uuid,
        date -> Date,
        usage_count -> Int8,
        tokens_consumed -> Int8,
        earnings_generated -> Int8,
    }
}

table! {
    use diesel::sql_types::*;
    use crate::sql_types::*;

    model_creator_earnings (model_id) {
        model_id -> Uuid,
        creator_id -> Uuid,
        total_usage_count -> Int8,
        total_tokens_consumed -> Int8,
        total_earnings -> Int8,
        last_usage_at -> Nullable<Timestamp>,
        created_at -> Timestamp,
        updated_at -> Timestamp,
    }
}

table! {
    use diesel::sql_types::*;
    use crate::sql_types::*;

    payment_sessions (session_id) {
        session_id -> Text,
        user_id -> Uuid,
        amount -> Int8,
        tokens -> Int8,
        status -> Event_status,
        created_at -> Timestamp,
        completed_at -> Nullable<Timestamp>,
    }
}

table! {
    use diesel::sql_types::*;
    use crate::sql_types::*;

    platform_settings (key) {
        key -> Text,
        value -> Text,
        updated_at -> Timestamp,
    }
}

table! {
    use diesel::sql_types::*;
    use crate::sql_types::*;

    processed_events (event_key) {
        event_key -> Text,
        status -> Event_status,
        created_at -> Timestamp,
        completed_at -> Nullable<Timestamp>,
    }
}

table! {
    use diesel::sql_types::*;
    use crate::sql_types::*;

    token_transactions (id) {
        id -> Int8,
        user_id -> Uuid,
        amount -> Int8,
        tx_type -> Token_transaction_type,
        description -> Text,
        metadata -> Jsonb,
        created_at -> Timestamp,
    }
}

table! {
    use diesel::sql_types::*;
    use crate::sql_types::*;

    user_tokens (user_id) {
        user_id -> Uuid,
        balance -> Int8,
        updated_at -> Timestamp,
    }
}

table! {
    use diesel::sql_types::*;
    use crate::sql_types::*;

    users (id) {
        id -> Uuid,
        referrer_id -> Nullable<Uuid>,
    }
}

table! {
    use diesel::sql_types::*;
    use crate::sql_types::*;

    withdrawal_history (id) {
        id -> Int8,
        withdrawal_request_id -> Uuid,
        action -> Withdrawal_action,
        performed_by -> Uuid,
        notes -> Nullable<Text>,
        created_at -> Timestamp,
    }
}

table! {
    use diesel::sql_types::*;
    use crate::sql_types::*;

    withdrawal_requests (id) {
        id -> Uuid,
        user_id -> Uuid,
        kind -> Withdrawal_kind,
        amount -> Int8,
        reserved_amount -> Int8,
        payout_method -> Payout_method,
        payment_details -> Jsonb,
        status -> Withdrawal_status,
        created_at -> Timestamp,
        updated_at -> Timestamp,
        approved_by -> Nullable<Uuid>,
        approved_at -> Nullable<Timestamp>,
        completed_at -> Nullable<Timestamp>,
        rejection_reason -> Nullable<Text>,
        admin_notes -> Nullable<Text>,
    }
}

allow_tables_to_appear_in_same_query!(
    account_holds,
    bonus_transactions,
    bonus_wallets,
    creator_models,
    earnings_transactions,
    model_analytics,
    model_creator_earnings,
    payment_sessions,
    platform_settings,
    processed_events,
    token_transactions,
    user_tokens,
    users,
    withdrawal_history,
    withdrawal_requests,
);
