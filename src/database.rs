use diesel::pg::PgConnection;
use diesel::r2d2::{ConnectionManager, Pool};

use crate::config::Database;
use crate::error::LedgerError;

pub type PgPool = Pool<ConnectionManager<PgConnection>>;

pub fn get_db_pool(database: &Database) -> Result<PgPool, LedgerError> {
    let manager = ConnectionManager::<PgConnection>::new(database.url());
    let pool = Pool::builder()
        .max_size(database.connection_pool_size)
        .build(manager)?;

    info!(
        "connected to {}:{}/{} (pool size {})",
        database.host, database.port, database.name, database.connection_pool_size
    );
    Ok(pool)
}
