//! The link integrity checker. Relationships are not bound at write
//! time, so a link can outlive the record its `context_id` names; the
//! checker walks heads past the `check_id` watermark and tombstones any
//! link whose endpoint vanished or whose expiry passed.

use crate::changes::now_us;
use crate::registry::RegistryInner;
use crate::{LinkStore, Result};
use rusqlite::params;
use std::sync::Arc;
use tracing::{debug, info, warn};

struct CheckRow {
    seq: i64,
    id: String,
    context_id: String,
    expire_us: i64,
}

impl LinkStore {
    /// Request an integrity check. Runs on the check pool; a request
    /// during a run schedules another round afterwards.
    pub fn check(self: &Arc<Self>) {
        if !self.checker.try_start() {
            debug!(collection = %self.name(), "check already running, flagging redo");
            return;
        }
        let Some(reg) = self.registry.upgrade() else {
            self.checker.finish();
            return;
        };
        let store = self.clone();
        let worker_reg = reg.clone();
        reg.check_pool.spawn(move || store.check_worker(worker_reg));
    }

    pub fn is_checking(&self) -> bool {
        self.checker.is_running()
    }

    fn check_worker(self: Arc<Self>, reg: Arc<RegistryInner>) {
        info!(collection = %self.name(), "link check starting");
        loop {
            match self.check_batch(&reg) {
                Err(err) => {
                    warn!(collection = %self.name(), %err, "link check failed");
                    self.record_error(format!("link check: {err}"));
                    break;
                }
                Ok(n) if n < self.handle.config.check_batch => break,
                Ok(_) => {}
            }
            if self.handle.should_quit() {
                break;
            }
        }
        info!(collection = %self.name(), "link check finished");
        if self.checker.finish() && !self.handle.should_quit() {
            self.check();
        }
    }

    fn check_batch(&self, reg: &Arc<RegistryInner>) -> Result<usize> {
        let batch = self.handle.config.check_batch;
        let rows: Vec<CheckRow> = {
            let conn = self.handle.conn.lock();
            let check_id: i64 =
                conn.query_row("SELECT check_id FROM store_meta", [], |row| row.get(0))?;
            let mut stmt = conn.prepare(
                "SELECT seq, id, context_id, expire_tm FROM records
                 WHERE rev_head = 1 AND deleted = 0 AND seq > ?1
                 ORDER BY seq LIMIT ?2",
            )?;
            let rows = stmt.query_map(params![check_id, batch as i64], |row| {
                Ok(CheckRow {
                    seq: row.get(0)?,
                    id: row.get(1)?,
                    context_id: row.get(2)?,
                    expire_us: row.get(3)?,
                })
            })?;
            rows.collect::<rusqlite::Result<_>>()?
        };
        if rows.is_empty() {
            return Ok(0);
        }

        let (parent_name, parent_is_docs) = self.parent();
        let parent_name = parent_name.to_owned();
        let now = now_us();
        let mut last_seq = 0i64;
        for row in &rows {
            last_seq = last_seq.max(row.seq);

            let expired = row.expire_us != 0 && row.expire_us <= now;
            let vanished = if expired {
                true
            } else if parent_is_docs {
                match reg.docs_named(&parent_name) {
                    Some(parent) => !parent.is_live(&row.context_id)?,
                    None => true,
                }
            } else {
                match reg.links_named(&parent_name) {
                    Some(parent) => !parent.is_live(&row.context_id)?,
                    None => true,
                }
            };

            if vanished {
                debug!(
                    collection = %self.name(),
                    link = %row.id,
                    context = %row.context_id,
                    expired,
                    "retiring dangling link"
                );
                self.tombstone_head(&row.id)?;
            }
        }

        let conn = self.handle.conn.lock();
        conn.execute("UPDATE store_meta SET check_id = ?1", params![last_seq])?;
        Ok(rows.len())
    }
}
