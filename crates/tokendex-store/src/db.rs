//! RocksDB wrapper: column family plumbing, atomic writes, bounded retry.

use std::path::Path;
use std::time::Duration;

use rocksdb::{ColumnFamily, ColumnFamilyDescriptor, Options, WriteBatch};
use serde::{Deserialize, Serialize};

use crate::{Error, Result};

/// Retry policy for batch writes.
///
/// Storage I/O faults are retried with exponential backoff; exhausting the
/// attempts is fatal to the caller. Consistency is preferred over
/// availability: a write either lands atomically or the synchronizer stops.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_delay_ms: u64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        RetryPolicy {
            max_attempts: 5,
            base_delay_ms: 100,
        }
    }
}

impl RetryPolicy {
    fn delay(&self, attempt: u32) -> Duration {
        // Exponential backoff, capped at ~10s.
        let exp = attempt.min(7);
        Duration::from_millis((self.base_delay_ms << exp).min(10_000))
    }
}

/// Ordered key-value store with named column families.
pub struct Db {
    db: rocksdb::DB,
}

pub type CF = ColumnFamily;

impl Db {
    /// Open or create the database at `path` with all column families the
    /// store uses.
    pub fn open(path: &Path) -> Result<Self> {
        let mut db_opts = Options::default();
        db_opts.create_if_missing(true);
        db_opts.create_missing_column_families(true);
        db_opts.set_write_buffer_size(64 * 1024 * 1024);
        db_opts.set_compression_type(rocksdb::DBCompressionType::Lz4);

        let mut block_opts = rocksdb::BlockBasedOptions::default();
        block_opts.set_bloom_filter(10.0, false);
        db_opts.set_block_based_table_factory(&block_opts);

        let cf_descriptors = Self::column_families()
            .iter()
            .map(|name| ColumnFamilyDescriptor::new(*name, Options::default()))
            .collect::<Vec<_>>();

        let db = rocksdb::DB::open_cf_descriptors(&db_opts, path, cf_descriptors)?;
        Ok(Db { db })
    }

    pub fn column_families() -> &'static [&'static str] {
        &[
            crate::blocks::CF_BLOCK_BY_HEIGHT,
            crate::blocks::CF_BLOCK_HEIGHT_BY_HASH,
            crate::txs::CF_TX_BY_NUM,
            crate::txs::CF_TX_NUM_BY_TXID,
            crate::utxos::CF_UTXO_BY_OUTPOINT,
            crate::utxos::CF_SCRIPT_UTXOS,
            crate::spends::CF_SPEND_BY_OUTPOINT,
            crate::history::CF_SCRIPT_HISTORY,
            crate::tokens::CF_TOKEN_TX,
            crate::tokens::CF_TOKEN_META,
            crate::undo::CF_UNDO,
            crate::store::CF_META,
        ]
    }

    pub fn cf(&self, name: &'static str) -> Result<&CF> {
        self.db
            .cf_handle(name)
            .ok_or(Error::NoSuchColumnFamily(name))
    }

    pub fn get(&self, cf: &CF, key: impl AsRef<[u8]>) -> Result<Option<Vec<u8>>> {
        Ok(self.db.get_cf(cf, key)?)
    }

    /// Iterate all `(key, value)` pairs whose key starts with `prefix`, in
    /// ascending key order.
    pub fn iter_prefix(
        &self,
        cf: &CF,
        prefix: &[u8],
    ) -> impl Iterator<Item = Result<(Box<[u8]>, Box<[u8]>)>> + '_ {
        let prefix = prefix.to_vec();
        let iter = self.db.iterator_cf(
            cf,
            rocksdb::IteratorMode::From(&prefix, rocksdb::Direction::Forward),
        );
        iter.map(|item| item.map_err(Error::from))
            .take_while(move |item| match item {
                Ok((key, _)) => key.starts_with(&prefix),
                Err(_) => true,
            })
    }

    pub fn write(&self, batch: WriteBatch) -> Result<()> {
        Ok(self.db.write(batch)?)
    }

    /// Write a batch, retrying transient failures with backoff.
    ///
    /// `build` is re-invoked per attempt since a `WriteBatch` is consumed by
    /// the write.
    pub fn write_with_retry(
        &self,
        policy: &RetryPolicy,
        build: impl Fn() -> Result<WriteBatch>,
    ) -> Result<()> {
        let mut attempt = 0;
        loop {
            match self.db.write(build()?) {
                Ok(()) => return Ok(()),
                Err(err) if attempt + 1 < policy.max_attempts => {
                    attempt += 1;
                    let delay = policy.delay(attempt);
                    tracing::warn!(
                        %err,
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        "Batch write failed, retrying"
                    );
                    std::thread::sleep(delay);
                }
                Err(err) => return Err(err.into()),
            }
        }
    }
}
