#[cfg(feature = "postgres")]
#[macro_use]
extern crate diesel_derive_enum;
#[cfg(feature = "postgres")]
#[macro_use]
extern crate diesel;
#[macro_use]
extern crate failure;
#[macro_use]
extern crate log;
#[macro_use]
extern crate lazy_static;
#[macro_use]
extern crate serde_derive;

extern crate chrono;
extern crate instrumented;
extern crate regex;
extern crate rust_decimal;
extern crate serde_json;
extern crate toml;
extern crate uuid;
extern crate yansi;

pub mod commission;
pub mod config;
#[cfg(feature = "postgres")]
pub mod database;
pub mod earnings;
pub mod error;
pub mod idempotency;
pub mod models;
#[cfg(feature = "postgres")]
pub mod schema;
pub mod service;
pub mod settings;
pub mod sql_types;
pub mod store;
pub mod token_account;
pub mod withdrawal;

pub use crate::error::LedgerError;
pub use crate::service::PayMaster;
