#[macro_use]
extern crate failure;
#[macro_use]
extern crate log;

extern crate dotenv;
extern crate env_logger;
extern crate instrumented;
extern crate paymaster;

use std::env;
use std::sync::Arc;

use paymaster::config;
use paymaster::database;
use paymaster::settings::{CachedSettings, LayeredSettings};
use paymaster::store::PgStore;
use paymaster::{LedgerError, PayMaster};

#[derive(Debug, Fail)]
pub enum Error {
    #[fail(display = "ledger error: {}", err)]
    LedgerError { err: String },
    #[fail(display = "{} accounts failed reconciliation", count)]
    Violations { count: usize },
}

impl From<LedgerError> for Error {
    fn from(err: LedgerError) -> Self {
        Self::LedgerError {
            err: err.to_string(),
        }
    }
}

fn do_reconcile() -> Result<(), Error> {
    let config = config::load_config()?;

    // Allow disablement of metrics reporting for testing
    if env::var_os("DISABLE_INSTRUMENTED").is_none() {
        instrumented::init(&config.metrics.bind_to_address);
    }

    let db_reader = database::get_db_pool(&config.database.reader)?;
    let db_writer = database::get_db_pool(&config.database.writer)?;

    let store = PgStore::new(db_reader, db_writer);
    let settings = CachedSettings::new(
        LayeredSettings::new(store.settings(), config.static_settings()?),
        config.settings_ttl(),
    );
    let paymaster = PayMaster::new(store, Arc::new(settings));

    let summary = paymaster.reconcile_all()?;
    info!(
        "reconciled {} accounts ({} violations, {} errors)",
        summary.checked,
        summary.violations.len(),
        summary.errors
    );

    for user_id in summary.violations.iter() {
        // The account is already on hold; it stays frozen until an admin
        // releases it.
        error!("ledger mismatch for {}, account held", user_id);
    }

    if summary.violations.is_empty() {
        Ok(())
    } else {
        Err(Error::Violations {
            count: summary.violations.len(),
        })
    }
}

pub fn main() -> Result<(), Error> {
    dotenv::dotenv().ok();

    ::env_logger::init();

    do_reconcile()
}
