use std::{
    collections::BTreeMap,
    path::Path,
    sync::{
        atomic::{AtomicUsize, Ordering},
        RwLock,
    },
};

use log::*;

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("RocksDB failed: {0}")]
    RocksDB(#[from] rocksdb::Error),

    #[error("decoding failed: {0}")]
    Decode(#[from] bitcoin::consensus::encode::Error),

    #[error("invalid {column} row: key={key}")]
    InvalidRow { column: Column, key: String },

    #[error("DB was created for {stored}, not for {expected}")]
    NetworkMismatch {
        stored: String,
        expected: bitcoin::Network,
    },

    #[error("write to {0} was rejected")]
    Rejected(Column),

    #[error("read from {0} failed")]
    Unavailable(Column),
}

impl Error {
    pub(crate) fn invalid_row(column: Column, key: &[u8]) -> Self {
        Self::InvalidRow {
            column,
            key: hex::encode(key),
        }
    }
}

#[derive(Debug, PartialEq, Eq, PartialOrd, Ord, Clone, Copy, Hash)]
pub enum Column {
    Blocks,
    AugmentedBlocks,
    TxoLocations,
    BlockIndex,
    Metadata,
}

impl Column {
    pub const ALL: &'static [Column] = &[
        Column::Blocks,
        Column::AugmentedBlocks,
        Column::TxoLocations,
        Column::BlockIndex,
        Column::Metadata,
    ];

    pub fn name(&self) -> &'static str {
        match self {
            Column::Blocks => "blocks",
            Column::AugmentedBlocks => "augmented_blocks",
            Column::TxoLocations => "txo_locations",
            Column::BlockIndex => "block_index",
            Column::Metadata => "metadata",
        }
    }
}

impl std::fmt::Display for Column {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

/// Read access inside a `Database::view` or `Database::update` scope.
pub trait ReadTx {
    fn get(&self, column: Column, key: &[u8]) -> Result<Option<Vec<u8>>, Error>;
}

/// Write access inside a `Database::update` scope.
///
/// Writes are staged and become visible only after the scope commits.
/// Reads keep observing the last committed state.
pub trait WriteTx: ReadTx {
    fn put(&mut self, column: Column, key: &[u8], value: &[u8]);
}

/// Transactional key-value engine.
///
/// `update` commits the staged writes only when its closure returns `Ok`,
/// so a failing closure leaves the database untouched.
pub trait Database {
    fn view<T, E>(&self, f: impl FnOnce(&dyn ReadTx) -> Result<T, E>) -> Result<T, E>
    where
        E: From<Error>;

    fn update<T, E>(&self, f: impl FnOnce(&mut dyn WriteTx) -> Result<T, E>) -> Result<T, E>
    where
        E: From<Error>;

    /// All rows of `column`, sorted by key.
    fn scan(&self, column: Column) -> Result<Vec<(Vec<u8>, Vec<u8>)>, Error>;
}

const NETWORK_KEY: &[u8] = b"network";

fn check_network(db: &impl Database, network: bitcoin::Network) -> Result<(), Error> {
    let stored = db.view(|tx| tx.get(Column::Metadata, NETWORK_KEY))?;
    match stored {
        Some(name) if name == network.to_string().as_bytes() => Ok(()),
        Some(name) => Err(Error::NetworkMismatch {
            stored: String::from_utf8_lossy(&name).into_owned(),
            expected: network,
        }),
        None => db.update(|tx| {
            tx.put(Column::Metadata, NETWORK_KEY, network.to_string().as_bytes());
            Ok(())
        }),
    }
}

pub struct RocksDb {
    db: rocksdb::DB,
}

fn default_opts(create: bool) -> rocksdb::Options {
    let mut opts = rocksdb::Options::default();
    opts.create_if_missing(create);
    opts.create_missing_column_families(true);
    opts.set_compaction_style(rocksdb::DBCompactionStyle::Level);
    opts.set_compression_type(rocksdb::DBCompressionType::Zstd);
    opts.set_max_open_files(256);
    opts.set_keep_log_file_num(10);

    let parallelism = std::thread::available_parallelism()
        .ok()
        .and_then(|v| u16::try_from(v.get()).ok())
        .unwrap_or(2)
        .clamp(1, 8);
    opts.increase_parallelism(parallelism.into());
    opts.set_max_subcompactions(parallelism.into());
    opts
}

fn cf_descriptors(
    opts: &rocksdb::Options,
) -> impl IntoIterator<Item = rocksdb::ColumnFamilyDescriptor> + '_ {
    Column::ALL
        .iter()
        .map(|column| rocksdb::ColumnFamilyDescriptor::new(column.name(), opts.clone()))
}

impl RocksDb {
    /// Create the DB if missing, then open it.
    pub fn create(path: impl AsRef<Path>, network: bitcoin::Network) -> Result<Self, Error> {
        Self::open_with(path.as_ref(), network, true)
    }

    /// Open an existing DB (fails if missing).
    pub fn open(path: impl AsRef<Path>, network: bitcoin::Network) -> Result<Self, Error> {
        Self::open_with(path.as_ref(), network, false)
    }

    fn open_with(path: &Path, network: bitcoin::Network, create: bool) -> Result<Self, Error> {
        let opts = default_opts(create);
        let db = rocksdb::DB::open_cf_descriptors(&opts, path, cf_descriptors(&opts))?;
        let store = Self { db };
        for &column in Column::ALL {
            let metadata = store.db.get_column_family_metadata_cf(store.cf(column));
            info!(
                "CF {}: {} files, {:.6} MBs",
                column,
                metadata.file_count,
                metadata.size as f64 / 1e6
            );
        }
        check_network(&store, network)?;
        Ok(store)
    }

    fn cf(&self, column: Column) -> &rocksdb::ColumnFamily {
        self.db
            .cf_handle(column.name())
            .unwrap_or_else(|| panic!("missing CF: {}", column))
    }

    pub fn flush(&self) -> Result<(), Error> {
        let opts = rocksdb::FlushOptions::new();
        for &column in Column::ALL {
            self.db.flush_cf_opt(self.cf(column), &opts)?;
        }
        Ok(())
    }
}

struct RocksView<'a> {
    store: &'a RocksDb,
    snapshot: rocksdb::Snapshot<'a>,
}

impl ReadTx for RocksView<'_> {
    fn get(&self, column: Column, key: &[u8]) -> Result<Option<Vec<u8>>, Error> {
        Ok(self.snapshot.get_cf(self.store.cf(column), key)?)
    }
}

struct RocksUpdate<'a> {
    store: &'a RocksDb,
    batch: rocksdb::WriteBatch,
}

impl ReadTx for RocksUpdate<'_> {
    fn get(&self, column: Column, key: &[u8]) -> Result<Option<Vec<u8>>, Error> {
        Ok(self.store.db.get_cf(self.store.cf(column), key)?)
    }
}

impl WriteTx for RocksUpdate<'_> {
    fn put(&mut self, column: Column, key: &[u8], value: &[u8]) {
        self.batch.put_cf(self.store.cf(column), key, value);
    }
}

impl Database for RocksDb {
    fn view<T, E>(&self, f: impl FnOnce(&dyn ReadTx) -> Result<T, E>) -> Result<T, E>
    where
        E: From<Error>,
    {
        let tx = RocksView {
            store: self,
            snapshot: self.db.snapshot(),
        };
        f(&tx)
    }

    fn update<T, E>(&self, f: impl FnOnce(&mut dyn WriteTx) -> Result<T, E>) -> Result<T, E>
    where
        E: From<Error>,
    {
        let mut tx = RocksUpdate {
            store: self,
            batch: rocksdb::WriteBatch::default(),
        };
        let result = f(&mut tx)?;
        let mut opts = rocksdb::WriteOptions::default();
        opts.disable_wal(false);
        opts.set_sync(true);
        let rows = tx.batch.len();
        self.db
            .write_opt(tx.batch, &opts)
            .map_err(|e| E::from(Error::from(e)))?;
        trace!("committed {} rows", rows);
        Ok(result)
    }

    fn scan(&self, column: Column) -> Result<Vec<(Vec<u8>, Vec<u8>)>, Error> {
        let mut result = vec![];
        for kv in self
            .db
            .iterator_cf(self.cf(column), rocksdb::IteratorMode::Start)
        {
            let (key, value) = kv?;
            result.push((key.into_vec(), value.into_vec()));
        }
        Ok(result)
    }
}

type Rows = BTreeMap<(Column, Vec<u8>), Vec<u8>>;

/// In-memory `Database`, for tests and tooling.
///
/// Counts committed updates and reads, and can be told to reject commits
/// touching a given column or to fail reads from it.
#[derive(Default)]
pub struct MemoryDb {
    rows: RwLock<Rows>,
    reject: RwLock<Option<Column>>,
    unavailable: RwLock<Option<Column>>,
    updates: AtomicUsize,
    reads: AtomicUsize,
}

struct MemoryView<'a> {
    db: &'a MemoryDb,
}

impl ReadTx for MemoryView<'_> {
    fn get(&self, column: Column, key: &[u8]) -> Result<Option<Vec<u8>>, Error> {
        self.db.reads.fetch_add(1, Ordering::Relaxed);
        if *self.db.unavailable.read().unwrap() == Some(column) {
            return Err(Error::Unavailable(column));
        }
        let rows = self.db.rows.read().unwrap();
        Ok(rows.get(&(column, key.to_vec())).cloned())
    }
}

struct MemoryUpdate<'a> {
    view: MemoryView<'a>,
    staged: Vec<(Column, Vec<u8>, Vec<u8>)>,
}

impl ReadTx for MemoryUpdate<'_> {
    fn get(&self, column: Column, key: &[u8]) -> Result<Option<Vec<u8>>, Error> {
        self.view.get(column, key)
    }
}

impl WriteTx for MemoryUpdate<'_> {
    fn put(&mut self, column: Column, key: &[u8], value: &[u8]) {
        self.staged.push((column, key.to_vec(), value.to_vec()));
    }
}

impl MemoryDb {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_network(network: bitcoin::Network) -> Result<Self, Error> {
        let db = Self::new();
        check_network(&db, network)?;
        Ok(db)
    }

    /// Reject every later commit writing into `column` (`None` accepts all).
    pub fn reject_writes(&self, column: Option<Column>) {
        *self.reject.write().unwrap() = column;
    }

    /// Fail every later read from `column` (`None` serves all).
    pub fn fail_reads(&self, column: Option<Column>) {
        *self.unavailable.write().unwrap() = column;
    }

    /// Number of successfully committed `update` scopes.
    pub fn committed_updates(&self) -> usize {
        self.updates.load(Ordering::Relaxed)
    }

    /// Number of point reads served so far.
    pub fn reads(&self) -> usize {
        self.reads.load(Ordering::Relaxed)
    }

    pub fn len(&self, column: Column) -> usize {
        let rows = self.rows.read().unwrap();
        rows.keys().filter(|(c, _)| *c == column).count()
    }
}

impl Database for MemoryDb {
    fn view<T, E>(&self, f: impl FnOnce(&dyn ReadTx) -> Result<T, E>) -> Result<T, E>
    where
        E: From<Error>,
    {
        f(&MemoryView { db: self })
    }

    fn update<T, E>(&self, f: impl FnOnce(&mut dyn WriteTx) -> Result<T, E>) -> Result<T, E>
    where
        E: From<Error>,
    {
        let mut tx = MemoryUpdate {
            view: MemoryView { db: self },
            staged: vec![],
        };
        let result = f(&mut tx)?;
        if let Some(column) = *self.reject.read().unwrap() {
            if tx.staged.iter().any(|(c, _, _)| *c == column) {
                return Err(Error::Rejected(column).into());
            }
        }
        let mut rows = self.rows.write().unwrap();
        for (column, key, value) in tx.staged {
            rows.insert((column, key), value);
        }
        self.updates.fetch_add(1, Ordering::Relaxed);
        Ok(result)
    }

    fn scan(&self, column: Column) -> Result<Vec<(Vec<u8>, Vec<u8>)>, Error> {
        let rows = self.rows.read().unwrap();
        Ok(rows
            .iter()
            .filter(|((c, _), _)| *c == column)
            .map(|((_, key), value)| (key.clone(), value.clone()))
            .collect())
    }
}
