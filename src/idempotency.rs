//! At-most-once application of external events. An event is identified by
//! its external key (usage log id, payment session id); the first handler to
//! flip the key from pending to completed wins, and every later delivery
//! observes it as already processed.

use crate::error::LedgerError;
use crate::models::PaymentSession;
use crate::sql_types::EventStatus;
use crate::store::{LedgerResult, LedgerTx};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventSource {
    Usage,
    Payment,
}

impl EventSource {
    fn prefix(self) -> &'static str {
        match self {
            EventSource::Usage => "usage",
            EventSource::Payment => "payment",
        }
    }
}

pub fn event_key(source: EventSource, external_id: &str) -> String {
    format!("{}:{}", source.prefix(), external_id.trim())
}

#[derive(Debug, Clone, PartialEq)]
pub enum Claim<T> {
    Claimed(T),
    AlreadyProcessed,
}

/// Claims `key` and marks it completed within the current unit of work, so
/// the claim is rolled back with everything else if the unit fails.
pub fn apply_once(tx: &mut dyn LedgerTx, key: &str) -> LedgerResult<Claim<()>> {
    if let Some(event) = tx.processed_event(key)? {
        if event.status == EventStatus::Completed {
            return Ok(Claim::AlreadyProcessed);
        }
    } else if !tx.claim_event(key)? {
        return Ok(Claim::AlreadyProcessed);
    }

    if !tx.complete_event(key)? {
        debug!("lost the race to complete event {}", key);
        return Ok(Claim::AlreadyProcessed);
    }
    Ok(Claim::Claimed(()))
}

/// Moves a payment session from pending to completed before any of its
/// effects are applied.
pub fn claim_payment_session(
    tx: &mut dyn LedgerTx,
    session_id: &str,
) -> LedgerResult<Claim<PaymentSession>> {
    let session = tx
        .payment_session(session_id)?
        .ok_or(LedgerError::NotFound)?;

    if session.status == EventStatus::Completed {
        return Ok(Claim::AlreadyProcessed);
    }

    if !tx.complete_payment_session(session_id)? {
        info!(
            "payment session {} was completed by a concurrent delivery",
            session_id
        );
        return Ok(Claim::AlreadyProcessed);
    }

    Ok(Claim::Claimed(session))
}
