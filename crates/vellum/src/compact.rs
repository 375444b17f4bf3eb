//! Space reclamation: superseded revisions are dropped in batches behind
//! a persisted watermark, then the file's free pages are returned with
//! VACUUM. Link collections additionally purge ids whose latest revision
//! is a tombstone.

use crate::{sql, DocStore, LinkStore, Result};
use parking_lot::Mutex;
use rusqlite::params;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// At most one run per collection; a request during a run just asks for
/// another round after it finishes.
#[derive(Default)]
pub(crate) struct RunFlag {
    inner: Mutex<RunState>,
}

#[derive(Default)]
struct RunState {
    running: bool,
    redo: bool,
}

impl RunFlag {
    /// Returns true when the caller should start a run; false when one is
    /// active (the redo flag is set instead).
    pub fn try_start(&self) -> bool {
        let mut state = self.inner.lock();
        if state.running {
            state.redo = true;
            false
        } else {
            state.running = true;
            true
        }
    }

    /// Clears the running flag; returns whether a redo was requested.
    pub fn finish(&self) -> bool {
        let mut state = self.inner.lock();
        state.running = false;
        std::mem::take(&mut state.redo)
    }

    pub fn is_running(&self) -> bool {
        self.inner.lock().running
    }
}

impl DocStore {
    /// Request compaction. Runs on the compact pool; a second request
    /// while one is running schedules another round.
    pub fn compact(self: &Arc<Self>) {
        if !self.compact.try_start() {
            debug!(collection = %self.name(), "compaction already running, flagging redo");
            return;
        }
        let Some(reg) = self.registry.upgrade() else {
            self.compact.finish();
            return;
        };
        let store = self.clone();
        reg.compact_pool.spawn(move || store.compact_worker());
    }

    pub fn is_compacting(&self) -> bool {
        self.compact.is_running()
    }

    fn compact_worker(self: Arc<Self>) {
        info!(collection = %self.name(), "compaction starting");
        loop {
            match self.compact_batch() {
                Err(err) => {
                    warn!(collection = %self.name(), %err, "compaction failed");
                    self.record_error(format!("compaction: {err}"));
                    break;
                }
                Ok(n) if n < self.handle.config.compact_batch => {
                    if let Err(err) = self.reclaim() {
                        warn!(collection = %self.name(), %err, "reclaim failed");
                        self.record_error(format!("reclaim: {err}"));
                    }
                    break;
                }
                Ok(_) => {}
            }
            if self.handle.should_quit() {
                break;
            }
        }
        info!(collection = %self.name(), "compaction finished");
        if self.compact.finish() && !self.handle.should_quit() {
            self.compact();
        }
    }

    /// Walk one batch of head rows past the watermark and delete every
    /// superseded revision beneath them.
    fn compact_batch(&self) -> Result<usize> {
        let batch = self.handle.config.compact_batch;
        let conn = self.handle.conn.lock();
        let compact_id: i64 =
            conn.query_row("SELECT compact_id FROM store_meta", [], |row| row.get(0))?;

        let heads: Vec<(i64, String, i64)> = {
            let mut stmt = conn.prepare(
                "SELECT seq, id, rev FROM records r
                 WHERE r.rev = (SELECT max(rev) FROM records r2 WHERE r2.id = r.id)
                   AND r.seq > ?1
                 ORDER BY r.seq LIMIT ?2",
            )?;
            let rows = stmt.query_map(params![compact_id, batch as i64], |row| {
                Ok((row.get(0)?, row.get(1)?, row.get(2)?))
            })?;
            rows.collect::<rusqlite::Result<_>>()?
        };
        if heads.is_empty() {
            return Ok(0);
        }

        sql::with_txn(&self.handle.config, &conn, |conn| {
            let mut last_seq = compact_id;
            for (seq, id, rev) in &heads {
                conn.execute(
                    "DELETE FROM records WHERE id = ?1 AND rev < ?2",
                    params![id, rev],
                )?;
                last_seq = last_seq.max(*seq);
            }
            conn.execute(
                "UPDATE store_meta SET compact_id = ?1",
                params![last_seq],
            )?;
            Ok(())
        })?;
        Ok(heads.len())
    }

    fn reclaim(&self) -> Result<()> {
        let conn = self.handle.conn.lock();
        conn.execute_batch("VACUUM; ANALYZE records;")?;
        Ok(())
    }
}

impl LinkStore {
    /// Request compaction with the purge variant: a link whose head is a
    /// tombstone loses all of its rows and leaves the gone-counters.
    pub fn compact(self: &Arc<Self>) {
        if !self.compact.try_start() {
            debug!(collection = %self.name(), "compaction already running, flagging redo");
            return;
        }
        let Some(reg) = self.registry.upgrade() else {
            self.compact.finish();
            return;
        };
        let store = self.clone();
        reg.compact_pool.spawn(move || store.compact_worker());
    }

    pub fn is_compacting(&self) -> bool {
        self.compact.is_running()
    }

    fn compact_worker(self: Arc<Self>) {
        info!(collection = %self.name(), "link compaction starting");
        loop {
            match self.compact_batch() {
                Err(err) => {
                    warn!(collection = %self.name(), %err, "compaction failed");
                    self.record_error(format!("compaction: {err}"));
                    break;
                }
                Ok(n) if n < self.handle.config.compact_batch => {
                    if let Err(err) = self.reclaim() {
                        warn!(collection = %self.name(), %err, "reclaim failed");
                        self.record_error(format!("reclaim: {err}"));
                    }
                    break;
                }
                Ok(_) => {}
            }
            if self.handle.should_quit() {
                break;
            }
        }
        info!(collection = %self.name(), "link compaction finished");
        if self.compact.finish() && !self.handle.should_quit() {
            self.compact();
        }
    }

    fn compact_batch(&self) -> Result<usize> {
        let batch = self.handle.config.compact_batch;
        let conn = self.handle.conn.lock();
        let compact_id: i64 =
            conn.query_row("SELECT compact_id FROM store_meta", [], |row| row.get(0))?;

        let heads: Vec<(i64, String, i64, bool, bool)> = {
            let mut stmt = conn.prepare(
                "SELECT seq, id, rev, deleted, is_weblink FROM records
                 WHERE rev_head = 1 AND seq > ?1
                 ORDER BY seq LIMIT ?2",
            )?;
            let rows = stmt.query_map(params![compact_id, batch as i64], |row| {
                Ok((
                    row.get(0)?,
                    row.get(1)?,
                    row.get(2)?,
                    row.get(3)?,
                    row.get(4)?,
                ))
            })?;
            rows.collect::<rusqlite::Result<_>>()?
        };
        if heads.is_empty() {
            return Ok(0);
        }

        sql::with_txn(&self.handle.config, &conn, |conn| {
            let mut last_seq = compact_id;
            for (seq, id, rev, deleted, weblink) in &heads {
                if *deleted {
                    // Purge: the tombstone and its history all go.
                    conn.execute("DELETE FROM records WHERE id = ?1", params![id])?;
                    let gone_col = if *weblink {
                        "total_webl_gone"
                    } else {
                        "total_rel_gone"
                    };
                    conn.execute(
                        &format!("UPDATE store_meta SET {gone_col} = {gone_col} - 1"),
                        [],
                    )?;
                } else {
                    conn.execute(
                        "DELETE FROM records WHERE id = ?1 AND rev < ?2",
                        params![id, rev],
                    )?;
                }
                last_seq = last_seq.max(*seq);
            }
            conn.execute(
                "UPDATE store_meta SET compact_id = ?1",
                params![last_seq],
            )?;
            Ok(())
        })?;
        Ok(heads.len())
    }

    fn reclaim(&self) -> Result<()> {
        let conn = self.handle.conn.lock();
        conn.execute_batch("VACUUM; ANALYZE records;")?;
        Ok(())
    }
}
