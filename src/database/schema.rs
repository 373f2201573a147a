/// Schema of the catalog database: which databases are shared, on which
/// chains, and which contracts back which tables. This is what the monitor
/// reads at the start of every cycle.
pub const CATALOG_SCHEMA: &str = "\
CREATE TABLE version (
    version INTEGER NOT NULL
);

CREATE TABLE shared_databases (
    database_name TEXT PRIMARY KEY NOT NULL,
    blockchain_type TEXT NOT NULL
);

CREATE TABLE data_chains (
    database_name TEXT NOT NULL,
    chain_id TEXT NOT NULL,
    network_url TEXT NOT NULL,
    PRIMARY KEY (database_name, chain_id),
    FOREIGN KEY (database_name) REFERENCES shared_databases (database_name)
        ON UPDATE RESTRICT
        ON DELETE RESTRICT
);

CREATE TABLE shared_tables (
    database_name TEXT NOT NULL,
    chain_id TEXT NOT NULL,
    table_name TEXT NOT NULL,
    contract_address TEXT NOT NULL,
    column_types TEXT NOT NULL,
    encryption_key TEXT NOT NULL,
    iv TEXT NOT NULL,
    PRIMARY KEY (database_name, chain_id, table_name),
    FOREIGN KEY (database_name) REFERENCES shared_databases (database_name)
        ON UPDATE RESTRICT
        ON DELETE RESTRICT
);
";

/// Every shared table gets one append-only history table, `history_<name>`.
pub const HISTORY_TABLE_PREFIX: &str = "history_";

/// DDL of one history table. Rows are never updated nor deleted, and the
/// unique index makes re-appending a tuple after a partially failed cycle a
/// no-op.
pub fn history_table_ddl(table_name: &str) -> String {
    format!(
        "CREATE TABLE IF NOT EXISTS {}{} (
    id INTEGER PRIMARY KEY NOT NULL,
    chain_id TEXT NOT NULL,
    block_number INTEGER NOT NULL,
    timestamp INTEGER NOT NULL,
    editor TEXT NOT NULL,
    tx_id TEXT NOT NULL,
    tx_type TEXT NOT NULL,
    primary_key_hash TEXT NOT NULL,
    value TEXT,
    UNIQUE (primary_key_hash, block_number, tx_id)
);",
        HISTORY_TABLE_PREFIX, table_name
    )
}
