#[cfg(test)]
pub mod test_utils {
    use crate::database::{actions::SqliteSink, interface::db_exec};

    use std::{
        fs,
        path::PathBuf,
        sync::atomic::{AtomicU64, Ordering},
    };

    use rusqlite::params;

    pub fn test_datadir() -> PathBuf {
        static COUNTER: AtomicU64 = AtomicU64::new(0);
        let datadir: PathBuf = format!(
            "scratch_test_{:?}-{}",
            std::thread::current().id(),
            COUNTER.fetch_add(1, Ordering::Relaxed)
        )
        .into();
        fs::create_dir_all(&datadir).expect("Creating test datadir");
        datadir
    }

    /// Register a shared database and its data chains in the catalog
    pub fn insert_shared_database(sink: &SqliteSink, database: &str, chains: &[(&str, &str)]) {
        db_exec(&sink.catalog_file(), |tx| {
            tx.execute(
                "INSERT INTO shared_databases (database_name, blockchain_type) VALUES (?1, 'ETHEREUM')",
                params![database],
            )?;
            for (chain_id, network_url) in chains {
                tx.execute(
                    "INSERT INTO data_chains (database_name, chain_id, network_url) \
                     VALUES (?1, ?2, ?3)",
                    params![database, chain_id, network_url],
                )?;
            }
            Ok(())
        })
        .expect("Inserting shared database");
    }

    /// Register one shared table in the catalog
    #[allow(clippy::too_many_arguments)]
    pub fn insert_shared_table(
        sink: &SqliteSink,
        database: &str,
        chain_id: &str,
        table_name: &str,
        contract_address: &str,
        column_types: &str,
        encryption_key: &str,
        iv: &str,
    ) {
        db_exec(&sink.catalog_file(), |tx| {
            tx.execute(
                "INSERT INTO shared_tables (database_name, chain_id, table_name, \
                 contract_address, column_types, encryption_key, iv) \
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
                params![
                    database,
                    chain_id,
                    table_name,
                    contract_address,
                    column_types,
                    encryption_key,
                    iv
                ],
            )?;
            Ok(())
        })
        .expect("Inserting shared table");
    }
}
