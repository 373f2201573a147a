use crate::{
    database::{schema::HISTORY_TABLE_PREFIX, DatabaseError},
    decoder::{DecodeError, EncryptionParams, TableSchema},
};

use std::{convert::TryFrom, path::Path, str::FromStr};

use rusqlite::{params, Connection, Params, Row, Transaction, TransactionBehavior};

// As the bundled sqlite is compiled with SQLITE_THREADSAFE, quoting sqlite.org:
// > Multi-thread. In this mode, SQLite can be safely used by multiple threads provided that
// > no single database connection is used simultaneously in two or more threads.
// Therefore the below routines create a new connection and can be used from any thread.
// For concurrent write accesses, we rely on the 'unlock_notify' feature of SQLite:
// https://sqlite.org/unlock_notify.html

/// Perform a set of modifications to a database inside a single transaction
pub fn db_exec<F>(path: &Path, modifications: F) -> Result<(), DatabaseError>
where
    F: FnOnce(&Transaction) -> Result<(), DatabaseError>,
{
    let mut conn = Connection::open(path)
        .map_err(|e| DatabaseError(format!("Opening database: {}", e)))?;
    conn.busy_timeout(std::time::Duration::from_secs(60))?;
    let tx = conn
        .transaction_with_behavior(TransactionBehavior::Immediate)
        .map_err(|e| DatabaseError(format!("Creating transaction: {}", e)))?;

    modifications(&tx)?;
    tx.commit()
        .map_err(|e| DatabaseError(format!("Comitting transaction: {}", e)))?;

    Ok(())
}

// Internal helper for queries boilerplate
fn db_query<P, F, T>(path: &Path, stmt_str: &str, params: P, f: F) -> Result<Vec<T>, DatabaseError>
where
    P: Params,
    F: FnMut(&Row<'_>) -> rusqlite::Result<T>,
{
    let conn = Connection::open(path)
        .map_err(|e| DatabaseError(format!("Opening database for query: {}", e)))?;

    // The statement borrows the connection, end the borrow before `conn` is
    // dropped.
    let rows = conn
        .prepare(stmt_str)
        .map_err(|e| DatabaseError(format!("Preparing query: '{}'", e)))?
        .query_map(params, f)
        .map_err(|e| DatabaseError(format!("Executing query: '{}'", e)))?
        .collect::<rusqlite::Result<Vec<T>>>()
        .map_err(|e| DatabaseError(format!("Parsing query result: '{}'", e)));

    rows
}

/// Get the catalog database version
pub fn db_version(db_path: &Path) -> Result<u32, DatabaseError> {
    let mut rows = db_query(db_path, "SELECT version FROM version", [], |row| {
        row.get::<_, u32>(0)
    })?;

    rows.pop()
        .ok_or_else(|| DatabaseError("No row in version table?".to_string()))
}

/// A data chain a shared database is mirrored on, as stored in the catalog
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DbChain {
    pub chain_id: String,
    pub network_url: String,
}

/// A shared table row of the catalog, still in its raw text form
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DbSharedTable {
    pub chain_id: String,
    pub table_name: String,
    pub contract_address: String,
    pub column_types: String,
    pub encryption_key: String,
    pub iv: String,
}

/// A shared table with its schema parsed and its key material decoded, what
/// the decoder works with.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SharedTable {
    pub name: String,
    pub schema: TableSchema,
    pub encryption: Option<EncryptionParams>,
}

impl TryFrom<DbSharedTable> for SharedTable {
    type Error = DecodeError;

    fn try_from(db_table: DbSharedTable) -> Result<SharedTable, DecodeError> {
        // An empty key in the catalog means plaintext payloads
        let encryption = if db_table.encryption_key.is_empty() {
            None
        } else {
            Some(EncryptionParams::from_hex(
                &db_table.encryption_key,
                &db_table.iv,
            )?)
        };

        Ok(SharedTable {
            name: db_table.table_name,
            schema: TableSchema::from_str(&db_table.column_types)?,
            encryption,
        })
    }
}

/// The names of all the shared databases known to the catalog
pub fn db_shared_databases(db_path: &Path) -> Result<Vec<String>, DatabaseError> {
    db_query(
        db_path,
        "SELECT database_name FROM shared_databases ORDER BY database_name",
        [],
        |row| row.get::<_, String>(0),
    )
}

/// The data chains a shared database is mirrored on
pub fn db_chains(db_path: &Path, database: &str) -> Result<Vec<DbChain>, DatabaseError> {
    db_query(
        db_path,
        "SELECT chain_id, network_url FROM data_chains WHERE database_name = (?1) \
         ORDER BY chain_id",
        params![database],
        |row| {
            Ok(DbChain {
                chain_id: row.get(0)?,
                network_url: row.get(1)?,
            })
        },
    )
}

/// All the shared tables of a database, across all its chains
pub fn db_shared_tables(db_path: &Path, database: &str) -> Result<Vec<DbSharedTable>, DatabaseError> {
    db_query(
        db_path,
        "SELECT chain_id, table_name, contract_address, column_types, encryption_key, iv \
         FROM shared_tables WHERE database_name = (?1) ORDER BY chain_id, table_name",
        params![database],
        |row| {
            Ok(DbSharedTable {
                chain_id: row.get(0)?,
                table_name: row.get(1)?,
                contract_address: row.get(2)?,
                column_types: row.get(3)?,
                encryption_key: row.get(4)?,
                iv: row.get(5)?,
            })
        },
    )
}

/// The highest block number recorded for this chain in one history table, if
/// the table holds any row for it.
pub fn db_max_block_number(
    db_path: &Path,
    table_name: &str,
    chain_id: &str,
) -> Result<Option<i64>, DatabaseError> {
    let mut rows = db_query(
        db_path,
        &format!(
            "SELECT MAX(block_number) FROM {}{} WHERE chain_id = (?1)",
            HISTORY_TABLE_PREFIX, table_name
        ),
        params![chain_id],
        |row| row.get::<_, Option<i64>>(0),
    )?;

    Ok(rows.pop().flatten())
}
