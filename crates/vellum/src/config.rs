use serde::Deserialize;
use std::time::Duration;

/// Engine tuning. Every field has a default; deserialize from whatever
/// configuration source the embedding process uses, or take `Config::default()`.
#[derive(Clone, Debug, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Config {
    /// Parent rows consumed per map pass transaction.
    pub map_batch: usize,
    /// View rows consumed per reduce pass.
    pub reduce_batch: usize,
    /// Records walked per compaction transaction.
    pub compact_batch: usize,
    /// Link heads examined per integrity-check pass.
    pub check_batch: usize,
    /// Attempts before a contended statement fails `Busy`.
    pub busy_retries: u32,
    /// Backoff between busy retries, milliseconds (grows linearly).
    pub busy_backoff_ms: u64,
    /// How long the reduce worker sleeps waiting for fresh map output.
    pub reduce_wait_ms: u64,
    /// Threads per background pool (compact, check, view-map, view-reduce).
    pub pool_workers: usize,
    /// SQLite page-cache budget per collection file, KiB.
    pub cache_kib: u32,
    /// SQLite synchronous mode for collection files.
    pub synchronous: Synchronous,
    /// Length of generated record ids.
    pub id_length: usize,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Synchronous {
    Off,
    Normal,
    Full,
}

impl Synchronous {
    pub(crate) fn as_pragma(&self) -> &'static str {
        match self {
            Synchronous::Off => "OFF",
            Synchronous::Normal => "NORMAL",
            Synchronous::Full => "FULL",
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Config {
            map_batch: 100,
            reduce_batch: 100,
            compact_batch: 100,
            check_batch: 1000,
            busy_retries: 5,
            busy_backoff_ms: 20,
            reduce_wait_ms: 250,
            pool_workers: 2,
            cache_kib: 2048,
            synchronous: Synchronous::Normal,
            id_length: 32,
        }
    }
}

impl Config {
    pub(crate) fn busy_backoff(&self) -> Duration {
        Duration::from_millis(self.busy_backoff_ms)
    }

    pub(crate) fn reduce_wait(&self) -> Duration {
        Duration::from_millis(self.reduce_wait_ms)
    }
}
