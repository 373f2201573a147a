//! The reconciliation loop: one cycle per tick, then a fixed delay.
//!
//! Within a cycle all shared databases are polled concurrently, and within a
//! database all its data chains are. A failure anywhere (unreachable node,
//! undecodable payload, failed write) is logged and isolated to its own
//! branch of the cycle, it never takes down a sibling chain nor the loop.

use crate::{
    chain::{ethereum::EthereumAdapter, ChainError, ChainSource},
    database::{
        actions::{OutputSink, SqliteSink},
        interface::{DbChain, SharedTable},
        DatabaseError,
    },
    decoder::{HexDecoder, KeyValueDecoder},
    monitord::MonitorD,
};

use std::{collections::HashMap, convert::TryFrom, sync::Mutex, thread};

/// Last block number fully reconciled into history, per (database, chain).
///
/// Seeded lazily from the history tables on first contact with a chain and
/// only ever advanced by the poller, after a cycle fully processed a range.
pub struct Watermarks(Mutex<HashMap<(String, String), i64>>);

impl Watermarks {
    pub fn new() -> Watermarks {
        Watermarks(Mutex::new(HashMap::new()))
    }

    pub fn get(&self, database: &str, chain_id: &str) -> Option<i64> {
        self.0
            .lock()
            .unwrap()
            .get(&(database.to_string(), chain_id.to_string()))
            .copied()
    }

    /// Watermarks are monotonic, moving one backwards is a no-op
    pub fn advance(&self, database: &str, chain_id: &str, height: i64) {
        let mut map = self.0.lock().unwrap();
        let watermark = map
            .entry((database.to_string(), chain_id.to_string()))
            .or_insert(-1);
        if height > *watermark {
            *watermark = height;
        }
    }
}

/// Poll the storage backend and all the data chains until we die
pub fn monitor_main_loop(monitord: &MonitorD, sink: &SqliteSink) {
    let decoder = HexDecoder;
    let watermarks = Watermarks::new();
    let connect = |network_url: &str| EthereumAdapter::new(network_url);

    loop {
        monitor_cycle(sink, &connect, &decoder, &watermarks);
        thread::sleep(monitord.poll_interval);
    }
}

/// One reconciliation cycle across all shared databases. Skipped entirely if
/// the storage backend can't be reached.
pub fn monitor_cycle<S, C, F, D>(sink: &S, connect: &F, decoder: &D, watermarks: &Watermarks)
where
    S: OutputSink + Sync,
    C: ChainSource,
    F: Fn(&str) -> Result<C, ChainError> + Sync,
    D: KeyValueDecoder + Sync,
{
    if !sink.is_alive() {
        log::error!("Storage backend unavailable. Skipping this cycle.");
        return;
    }

    let databases = match sink.shared_databases() {
        Ok(databases) => databases,
        Err(e) => {
            log::error!("Error listing shared databases: {}", e);
            return;
        }
    };

    thread::scope(|s| {
        for database in &databases {
            s.spawn(move || {
                if let Err(e) = monitor_database(sink, connect, decoder, watermarks, database) {
                    log::error!("Error monitoring database '{}': {}", database, e);
                }
            });
        }
    });
}

// Discover one database's tables and chains, then poll its chains
// concurrently.
fn monitor_database<S, C, F, D>(
    sink: &S,
    connect: &F,
    decoder: &D,
    watermarks: &Watermarks,
    database: &str,
) -> Result<(), DatabaseError>
where
    S: OutputSink + Sync,
    C: ChainSource,
    F: Fn(&str) -> Result<C, ChainError> + Sync,
    D: KeyValueDecoder + Sync,
{
    let tables = sink.shared_tables(database)?;

    let mut table_names: Vec<String> = tables
        .values()
        .flat_map(|per_contract| per_contract.values().map(|t| t.name.clone()))
        .collect();
    table_names.sort();
    table_names.dedup();
    sink.init_history_tables(database, &table_names)?;

    let chains = sink.chains(database)?;
    let no_tables = HashMap::new();

    thread::scope(|s| {
        for chain in &chains {
            let chain_tables = tables.get(&chain.chain_id).unwrap_or(&no_tables);
            s.spawn(move || {
                let adapter = match connect(&chain.network_url) {
                    Ok(adapter) => adapter,
                    Err(e) => {
                        log::error!(
                            "Could not set up an adapter for chain node at '{}': {}",
                            chain.network_url,
                            e
                        );
                        return;
                    }
                };
                if let Err(e) =
                    monitor_chain(sink, &adapter, decoder, watermarks, database, chain, chain_tables)
                {
                    log::error!(
                        "Error monitoring chain '{}' of database '{}': {}",
                        chain.chain_id,
                        database,
                        e
                    );
                }
            });
        }
    });

    Ok(())
}

// Reconcile one chain of one database: read everything above the watermark,
// decode and append in block order, then advance the watermark.
fn monitor_chain<S, C, D>(
    sink: &S,
    adapter: &C,
    decoder: &D,
    watermarks: &Watermarks,
    database: &str,
    chain: &DbChain,
    tables: &HashMap<String, SharedTable>,
) -> Result<(), DatabaseError>
where
    S: OutputSink,
    C: ChainSource,
    D: KeyValueDecoder,
{
    let latest = match adapter.latest_block_number() {
        Ok(latest) => latest,
        Err(e) => {
            log::error!(
                "Chain node at '{}' is not available: {}",
                chain.network_url,
                e
            );
            return Ok(());
        }
    };
    let latest = match i64::try_from(latest) {
        Ok(latest) => latest,
        Err(_) => {
            log::error!(
                "Chain node at '{}' reported an insane height: {}",
                chain.network_url,
                latest
            );
            return Ok(());
        }
    };

    // First contact with this chain since startup? Seed from history.
    let last_processed = match watermarks.get(database, &chain.chain_id) {
        Some(last_processed) => last_processed,
        None => sink.last_processed_block(database, &chain.chain_id)?,
    };

    if last_processed < latest {
        let events = match adapter.read_history((last_processed + 1) as u64, latest as u64) {
            Ok(events) => events,
            Err(e) => {
                log::error!(
                    "Error reading history of chain '{}' at '{}': {}",
                    chain.chain_id,
                    chain.network_url,
                    e
                );
                return Ok(());
            }
        };

        // The adapter returns events in ascending block order, and in
        // transaction order within a block. Appends preserve it.
        for event in events {
            let table = match tables.get(&event.contract_address) {
                Some(table) => table,
                None => {
                    log::info!(
                        "Skipping transaction from block {}. No shared table at contract '{}'",
                        event.block_number,
                        event.contract_address
                    );
                    continue;
                }
            };

            let tuple = match decoder.decode(&event, &table.schema, table.encryption.as_ref()) {
                Ok(tuple) => tuple,
                Err(e) => {
                    // Leave the watermark where it is, we'll retry the whole
                    // range next cycle.
                    log::error!(
                        "Error decoding transaction '{}' of block {} for table '{}': {}",
                        event.tx_id,
                        event.block_number,
                        table.name,
                        e
                    );
                    return Ok(());
                }
            };

            if let Err(e) = sink.append_tuple(database, &table.name, &chain.chain_id, &tuple) {
                log::error!(
                    "Error writing transaction from block {} to history_{}: {}",
                    tuple.block_number,
                    table.name,
                    e
                );
                return Ok(());
            }
            log::info!(
                "Successfully wrote transaction from block {} to history_{}",
                tuple.block_number,
                table.name
            );
        }
    }

    // Advance even when nothing matched: it bounds the next scan
    watermarks.advance(database, &chain.chain_id, latest);

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        chain::{OperationKind, RawEvent},
        database::actions::setup_db,
        decoder::{encode, ColumnType, DecodedTuple},
        utils::test_utils::{insert_shared_database, insert_shared_table, test_datadir},
    };

    use std::fs;

    const CONTRACT: &str = "0xf5993a0df24a0ccc5b1f9bc0b9eed5a157eeb1a4";

    /// A canned chain: a height and a list of events, or no connectivity at
    /// all.
    struct MockChain {
        latest: u64,
        events: Vec<RawEvent>,
        available: bool,
    }

    impl ChainSource for MockChain {
        fn latest_block_number(&self) -> Result<u64, ChainError> {
            if !self.available {
                return Err(ChainError::InvalidResponse("connection refused".to_string()));
            }
            Ok(self.latest)
        }

        fn read_history(&self, from_block: u64, to_block: u64) -> Result<Vec<RawEvent>, ChainError> {
            Ok(self
                .events
                .iter()
                .filter(|e| e.block_number >= from_block && e.block_number <= to_block)
                .cloned()
                .collect())
        }
    }

    fn put_event(block_number: u64, tx_seq: u32, id: u64, name: &str) -> RawEvent {
        let mut payload = "ab".repeat(32);
        payload.push_str(&encode::encode_int(id, &ColumnType::Int));
        payload.push_str(&encode::encode_varchar(name, 3));

        RawEvent {
            contract_address: CONTRACT.to_string(),
            timestamp: 1659045600,
            editor: "0x07b83c4d6d8fda4f2f1b5d9e135ee44a5c2bff22".to_string(),
            tx_id: format!("0xtx{}_{}", block_number, tx_seq),
            kind: OperationKind::Put,
            block_number,
            payload,
        }
    }

    // One shared database on the given chains, one "patients" table per chain
    fn seeded_sink(datadir: &std::path::Path, chains: &[(&str, &str)]) -> SqliteSink {
        let sink = SqliteSink::new(datadir.to_path_buf());
        setup_db(&sink).unwrap();
        insert_shared_database(&sink, "hospital", chains);
        for (chain_id, _) in chains {
            insert_shared_table(
                &sink,
                "hospital",
                chain_id,
                "patients",
                CONTRACT,
                "int,varchar(3)",
                "",
                "",
            );
        }
        sink
    }

    fn history_rows(sink: &SqliteSink) -> Vec<(i64, String, Option<String>)> {
        let conn = rusqlite::Connection::open(sink.database_file("hospital")).unwrap();
        let mut stmt = conn
            .prepare("SELECT block_number, tx_id, value FROM history_patients ORDER BY id")
            .unwrap();
        let rows = stmt
            .query_map([], |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)))
            .unwrap()
            .collect::<rusqlite::Result<Vec<_>>>()
            .unwrap();
        rows
    }

    #[test]
    fn empty_cycle_still_advances_watermark() {
        let datadir = test_datadir();
        let sink = seeded_sink(&datadir, &[("0", "mock://a")]);
        let watermarks = Watermarks::new();

        let connect = |_: &str| {
            Ok(MockChain {
                latest: 5,
                events: vec![],
                available: true,
            })
        };
        monitor_cycle(&sink, &connect, &HexDecoder, &watermarks);

        assert_eq!(watermarks.get("hospital", "0"), Some(5));
        assert!(history_rows(&sink).is_empty());

        fs::remove_dir_all(&datadir).unwrap();
    }

    #[test]
    fn events_are_appended_in_block_and_transaction_order() {
        let datadir = test_datadir();
        let sink = seeded_sink(&datadir, &[("0", "mock://a")]);
        let watermarks = Watermarks::new();

        let connect = |_: &str| {
            Ok(MockChain {
                latest: 11,
                events: vec![
                    put_event(10, 1, 5, "Sam"),
                    put_event(10, 2, 6, "Tom"),
                    put_event(11, 1, 7, "Kim"),
                ],
                available: true,
            })
        };
        monitor_cycle(&sink, &connect, &HexDecoder, &watermarks);

        let rows = history_rows(&sink);
        assert_eq!(
            rows,
            vec![
                (10, "0xtx10_1".to_string(), Some("5,Sam".to_string())),
                (10, "0xtx10_2".to_string(), Some("6,Tom".to_string())),
                (11, "0xtx11_1".to_string(), Some("7,Kim".to_string())),
            ]
        );
        assert_eq!(watermarks.get("hospital", "0"), Some(11));

        // The next cycle only scans new blocks and appends nothing new
        monitor_cycle(&sink, &connect, &HexDecoder, &watermarks);
        assert_eq!(history_rows(&sink).len(), 3);

        fs::remove_dir_all(&datadir).unwrap();
    }

    #[test]
    fn unreachable_chain_does_not_block_its_siblings() {
        let datadir = test_datadir();
        let sink = seeded_sink(&datadir, &[("0", "mock://down"), ("1", "mock://up")]);
        let watermarks = Watermarks::new();

        let connect = |url: &str| {
            Ok(MockChain {
                latest: 8,
                events: vec![put_event(8, 1, 5, "Sam")],
                available: url == "mock://up",
            })
        };
        monitor_cycle(&sink, &connect, &HexDecoder, &watermarks);

        // Chain 1 made progress
        assert_eq!(watermarks.get("hospital", "1"), Some(8));
        assert_eq!(history_rows(&sink).len(), 1);
        // Chain 0's watermark is untouched
        assert_eq!(watermarks.get("hospital", "0"), None);
        assert_eq!(sink.last_processed_block("hospital", "0").unwrap(), -1);

        fs::remove_dir_all(&datadir).unwrap();
    }

    #[test]
    fn events_at_unknown_contracts_are_filtered() {
        let datadir = test_datadir();
        let sink = seeded_sink(&datadir, &[("0", "mock://a")]);
        let watermarks = Watermarks::new();

        let mut foreign = put_event(3, 1, 5, "Sam");
        foreign.contract_address = "0x000000000000000000000000000000000000dead".to_string();
        let connect = move |_: &str| {
            Ok(MockChain {
                latest: 3,
                events: vec![foreign.clone()],
                available: true,
            })
        };
        monitor_cycle(&sink, &connect, &HexDecoder, &watermarks);

        assert!(history_rows(&sink).is_empty());
        // Still nothing to re-scan next cycle
        assert_eq!(watermarks.get("hospital", "0"), Some(3));

        fs::remove_dir_all(&datadir).unwrap();
    }

    #[test]
    fn undecodable_payload_leaves_watermark_for_a_retry() {
        let datadir = test_datadir();
        let sink = seeded_sink(&datadir, &[("0", "mock://a")]);
        let watermarks = Watermarks::new();

        let mut garbage = put_event(4, 1, 5, "Sam");
        garbage.payload.truncate(66);
        let connect = move |_: &str| {
            Ok(MockChain {
                latest: 4,
                events: vec![garbage.clone()],
                available: true,
            })
        };
        monitor_cycle(&sink, &connect, &HexDecoder, &watermarks);

        assert!(history_rows(&sink).is_empty());
        assert_eq!(watermarks.get("hospital", "0"), None);

        fs::remove_dir_all(&datadir).unwrap();
    }

    #[test]
    fn watermarks_are_keyed_per_database_and_chain() {
        let watermarks = Watermarks::new();

        watermarks.advance("hospital", "0", 10);
        watermarks.advance("insurance", "0", 20);
        watermarks.advance("hospital", "1", 30);

        assert_eq!(watermarks.get("hospital", "0"), Some(10));
        assert_eq!(watermarks.get("insurance", "0"), Some(20));
        assert_eq!(watermarks.get("hospital", "1"), Some(30));

        // Never backwards
        watermarks.advance("hospital", "0", 5);
        assert_eq!(watermarks.get("hospital", "0"), Some(10));
    }

    /// A sink that fails all appends after the first one, to exercise the
    /// partial failure path.
    struct FailingSink {
        inner: SqliteSink,
        appended: Mutex<u32>,
    }

    impl OutputSink for FailingSink {
        fn is_alive(&self) -> bool {
            self.inner.is_alive()
        }

        fn shared_databases(&self) -> Result<Vec<String>, DatabaseError> {
            self.inner.shared_databases()
        }

        fn chains(&self, database: &str) -> Result<Vec<DbChain>, DatabaseError> {
            self.inner.chains(database)
        }

        fn shared_tables(
            &self,
            database: &str,
        ) -> Result<HashMap<String, HashMap<String, SharedTable>>, DatabaseError> {
            self.inner.shared_tables(database)
        }

        fn init_history_tables(
            &self,
            database: &str,
            table_names: &[String],
        ) -> Result<(), DatabaseError> {
            self.inner.init_history_tables(database, table_names)
        }

        fn last_processed_block(
            &self,
            database: &str,
            chain_id: &str,
        ) -> Result<i64, DatabaseError> {
            self.inner.last_processed_block(database, chain_id)
        }

        fn append_tuple(
            &self,
            database: &str,
            table_name: &str,
            chain_id: &str,
            tuple: &DecodedTuple,
        ) -> Result<(), DatabaseError> {
            let mut appended = self.appended.lock().unwrap();
            if *appended >= 1 {
                return Err(DatabaseError("disk full".to_string()));
            }
            *appended += 1;
            self.inner.append_tuple(database, table_name, chain_id, tuple)
        }
    }

    #[test]
    fn failed_append_aborts_the_chain_and_keeps_the_watermark() {
        let datadir = test_datadir();
        let inner = seeded_sink(&datadir, &[("0", "mock://a")]);
        let sink = FailingSink {
            inner,
            appended: Mutex::new(0),
        };
        let watermarks = Watermarks::new();

        let connect = |_: &str| {
            Ok(MockChain {
                latest: 11,
                events: vec![put_event(10, 1, 5, "Sam"), put_event(11, 1, 6, "Tom")],
                available: true,
            })
        };
        monitor_cycle(&sink, &connect, &HexDecoder, &watermarks);

        // The first append went through, the second did not, and the
        // watermark was left at its cycle-start value.
        assert_eq!(history_rows(&sink.inner).len(), 1);
        assert_eq!(watermarks.get("hospital", "0"), None);

        // The next cycle re-scans the same range. The already persisted
        // tuple is absorbed by the unique index, the missing one lands.
        let plain_sink = SqliteSink::new(datadir.clone());
        monitor_cycle(&plain_sink, &connect, &HexDecoder, &watermarks);
        assert_eq!(history_rows(&plain_sink).len(), 2);
        assert_eq!(watermarks.get("hospital", "0"), Some(11));

        fs::remove_dir_all(&datadir).unwrap();
    }
}
