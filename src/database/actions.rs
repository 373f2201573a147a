use crate::{
    database::{
        interface::{
            db_chains, db_exec, db_max_block_number, db_shared_databases, db_shared_tables,
            db_version, DbChain, SharedTable,
        },
        schema::{history_table_ddl, CATALOG_SCHEMA},
        DatabaseError, DB_VERSION,
    },
    decoder::DecodedTuple,
};

use std::{
    collections::HashMap,
    convert::{TryFrom, TryInto},
    fs,
    path::{Path, PathBuf},
};

use rusqlite::params;

// Sqlite supports up to i64, thus rusqlite prevents us from inserting u64's.
fn block_number_to_i64(n: u64) -> Result<i64, DatabaseError> {
    n.try_into()
        .map_err(|_| DatabaseError(format!("Block number doesn't fit in i64: {}", n)))
}

// Create the db file with RW permissions only for the user
fn create_db_file(db_path: &Path) -> Result<(), std::io::Error> {
    let mut options = fs::OpenOptions::new();
    let options = options.read(true).write(true).create_new(true);

    #[cfg(unix)]
    return {
        use std::os::unix::fs::OpenOptionsExt;

        options.mode(0o600).open(db_path)?;
        Ok(())
    };

    #[cfg(not(unix))]
    return {
        options.open(db_path)?;
        Ok(())
    };
}

// No catalog yet ? In a single tx, create a new one from the schema.
fn create_catalog(catalog_path: &Path) -> Result<(), DatabaseError> {
    // Rusqlite could create it for us, but we want custom permissions
    create_db_file(catalog_path)
        .map_err(|e| DatabaseError(format!("Creating db file: {}", e)))?;

    db_exec(catalog_path, |tx| {
        tx.execute_batch(CATALOG_SCHEMA)
            .map_err(|e| DatabaseError(format!("Creating catalog: {}", e)))?;
        tx.execute(
            "INSERT INTO version (version) VALUES (?1)",
            params![DB_VERSION],
        )
        .map_err(|e| DatabaseError(format!("Inserting version: {}", e)))?;

        Ok(())
    })
}

// Called at startup to check the catalog isn't from a (hypothetical) newer
// version of ourselves.
fn check_db(catalog_path: &Path) -> Result<(), DatabaseError> {
    let version = db_version(catalog_path)?;
    if version != DB_VERSION {
        return Err(DatabaseError(format!(
            "Unexpected database version: got '{}', expected '{}'",
            version, DB_VERSION
        )));
    }

    Ok(())
}

/// Create the catalog database if it doesn't exist already, and sanity check it
pub fn setup_db(sink: &SqliteSink) -> Result<(), DatabaseError> {
    let catalog_path = sink.catalog_file();
    if !catalog_path.exists() {
        log::info!("No catalog database at '{:?}', creating a new one", catalog_path);
        create_catalog(&catalog_path)?;
    }

    check_db(&catalog_path)
}

/// Interface of the storage backend the monitor reconciles into. It ensures
/// the history tables exist, tells us where each chain's watermark should be
/// seeded from, and persists the decoded tuples.
pub trait OutputSink {
    /// Can the storage backend be reached at all right now?
    fn is_alive(&self) -> bool;

    /// The names of all the shared databases to monitor
    fn shared_databases(&self) -> Result<Vec<String>, DatabaseError>;

    /// The data chains a shared database lives on
    fn chains(&self, database: &str) -> Result<Vec<DbChain>, DatabaseError>;

    /// The shared tables of a database, as chain id -> contract address ->
    /// table (name, parsed schema, key material)
    fn shared_tables(
        &self,
        database: &str,
    ) -> Result<HashMap<String, HashMap<String, SharedTable>>, DatabaseError>;

    /// Make sure a `history_<name>` table exists for each given shared table
    /// name. Idempotent.
    fn init_history_tables(&self, database: &str, table_names: &[String])
        -> Result<(), DatabaseError>;

    /// The highest block number already recorded for this chain across the
    /// database's history tables, -1 if there is none.
    fn last_processed_block(&self, database: &str, chain_id: &str) -> Result<i64, DatabaseError>;

    /// Append one decoded tuple to a history table. Appending the same
    /// (primary key hash, block number, transaction) again must be a no-op,
    /// the monitor re-scans block ranges after partial failures.
    fn append_tuple(
        &self,
        database: &str,
        table_name: &str,
        chain_id: &str,
        tuple: &DecodedTuple,
    ) -> Result<(), DatabaseError>;
}

/// SQLite-backed sink: one catalog file plus one file per shared database
/// holding its history tables, all under the daemon data directory.
pub struct SqliteSink {
    data_dir: PathBuf,
}

impl SqliteSink {
    pub fn new(data_dir: PathBuf) -> SqliteSink {
        SqliteSink { data_dir }
    }

    pub fn catalog_file(&self) -> PathBuf {
        self.data_dir.join("trustdble.sqlite3")
    }

    /// The file holding one shared database's history tables
    pub fn database_file(&self, database: &str) -> PathBuf {
        self.data_dir.join(format!("{}.sqlite3", database))
    }
}

impl OutputSink for SqliteSink {
    fn is_alive(&self) -> bool {
        db_version(&self.catalog_file()).is_ok()
    }

    fn shared_databases(&self) -> Result<Vec<String>, DatabaseError> {
        db_shared_databases(&self.catalog_file())
    }

    fn chains(&self, database: &str) -> Result<Vec<DbChain>, DatabaseError> {
        db_chains(&self.catalog_file(), database)
    }

    fn shared_tables(
        &self,
        database: &str,
    ) -> Result<HashMap<String, HashMap<String, SharedTable>>, DatabaseError> {
        let mut tables: HashMap<String, HashMap<String, SharedTable>> = HashMap::new();

        for db_table in db_shared_tables(&self.catalog_file(), database)? {
            let chain_id = db_table.chain_id.clone();
            let contract_address = db_table.contract_address.clone();
            let table = SharedTable::try_from(db_table).map_err(|e| {
                DatabaseError(format!(
                    "Invalid schema or key material in catalog for database '{}': {}",
                    database, e
                ))
            })?;
            tables
                .entry(chain_id)
                .or_insert_with(HashMap::new)
                .insert(contract_address, table);
        }

        Ok(tables)
    }

    fn init_history_tables(
        &self,
        database: &str,
        table_names: &[String],
    ) -> Result<(), DatabaseError> {
        let db_path = self.database_file(database);

        db_exec(&db_path, |tx| {
            for name in table_names {
                tx.execute_batch(&history_table_ddl(name))
                    .map_err(|e| {
                        DatabaseError(format!("Creating history table for '{}': {}", name, e))
                    })?;
            }

            Ok(())
        })
    }

    fn last_processed_block(&self, database: &str, chain_id: &str) -> Result<i64, DatabaseError> {
        let db_path = self.database_file(database);
        if !db_path.exists() {
            return Ok(-1);
        }

        let mut names: Vec<String> = db_shared_tables(&self.catalog_file(), database)?
            .into_iter()
            .map(|t| t.table_name)
            .collect();
        names.sort();
        names.dedup();

        let mut last_processed = -1;
        for name in names {
            if let Some(max) = db_max_block_number(&db_path, &name, chain_id)? {
                last_processed = std::cmp::max(last_processed, max);
            }
        }

        Ok(last_processed)
    }

    fn append_tuple(
        &self,
        database: &str,
        table_name: &str,
        chain_id: &str,
        tuple: &DecodedTuple,
    ) -> Result<(), DatabaseError> {
        let db_path = self.database_file(database);
        let block_number = block_number_to_i64(tuple.block_number)?;
        let timestamp = block_number_to_i64(tuple.timestamp)?;

        db_exec(&db_path, |tx| {
            // OR IGNORE: the unique index across (primary_key_hash,
            // block_number, tx_id) absorbs re-scans of already recorded
            // blocks.
            tx.execute(
                &format!(
                    "INSERT OR IGNORE INTO history_{} \
                     (chain_id, block_number, timestamp, editor, tx_id, tx_type, \
                      primary_key_hash, value) \
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
                    table_name
                ),
                params![
                    chain_id,
                    block_number,
                    timestamp,
                    tuple.editor,
                    tuple.tx_id,
                    tuple.kind.as_str(),
                    tuple.key_hash,
                    tuple.value,
                ],
            )
            .map_err(|e| {
                DatabaseError(format!(
                    "Inserting history row for '{}.{}': {}",
                    database, table_name, e
                ))
            })?;

            Ok(())
        })
    }
}
