//! The view engine's background machinery: a map worker and a reduce
//! worker cooperate per view, checkpointed through the persisted
//! watermarks so a restart resumes where the last run stopped.

use crate::registry::RegistryInner;
use crate::views::{self, SourceKind, View};
use crate::{sql, Error, Result};
use parking_lot::{Condvar, Mutex};
use rusqlite::params;
use serde_json::{json, Map, Value};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

/// Where a view's sync machinery stands.
#[derive(Clone, Debug, PartialEq)]
pub enum SyncPhase {
    Idle,
    Mapping,
    Reducing,
    ReReducing,
    Failed(String),
}

#[derive(Default)]
pub(crate) struct SyncState {
    inner: Mutex<SyncInner>,
    cond: Condvar,
}

#[derive(Default)]
struct SyncInner {
    dirty: bool,
    map_running: bool,
    reduce_running: bool,
    rereducing: bool,
    /// Bumped whenever a map batch lands rows; the reduce worker's wake
    /// signal.
    mapped_marker: u64,
    failure: Option<String>,
    /// Fingerprint (key text, row count, max seq) of the last offending
    /// re-reduce group, for jam detection.
    offender: Option<(String, i64, i64)>,
}

struct SourceRow {
    pid: Vec<String>,
    seq: u64,
    doc: Value,
}

struct Group {
    seqs: Vec<i64>,
    keys: Vec<Value>,
    pids: Vec<Vec<String>>,
    values: Vec<Value>,
    max_seq: i64,
}

impl View {
    /// Current phase of the state machine.
    pub fn state(&self) -> SyncPhase {
        let inner = self.sync.inner.lock();
        if let Some(msg) = &inner.failure {
            return SyncPhase::Failed(msg.clone());
        }
        if inner.map_running {
            SyncPhase::Mapping
        } else if inner.reduce_running {
            if inner.rereducing {
                SyncPhase::ReReducing
            } else {
                SyncPhase::Reducing
            }
        } else {
            SyncPhase::Idle
        }
    }

    /// Mark the view dirty and make sure its workers are scheduled. Every
    /// parent write lands here.
    pub(crate) fn touch(self: &Arc<Self>) {
        let mut inner = self.sync.inner.lock();
        inner.dirty = true;
        inner.failure = None;
        self.schedule_locked(&mut inner);
    }

    /// Block until the view is in sync with its parent (Idle, nothing
    /// dirty). Returns the recorded failure if the machinery broke.
    pub fn sync_now(self: &Arc<Self>) -> Result<()> {
        self.touch();
        let mut inner = self.sync.inner.lock();
        loop {
            if let Some(msg) = &inner.failure {
                return Err(Error::Internal(format!("view sync failed: {msg}")));
            }
            if !inner.map_running && !inner.reduce_running && !inner.dirty {
                return Ok(());
            }
            if self.handle.should_quit() {
                return Ok(());
            }
            self.sync
                .cond
                .wait_for(&mut inner, Duration::from_millis(50));
        }
    }

    fn schedule_locked(self: &Arc<Self>, inner: &mut SyncInner) {
        if self.handle.should_quit() {
            return;
        }
        let Some(reg) = self.registry.upgrade() else {
            return;
        };
        if !inner.map_running {
            inner.map_running = true;
            let view = self.clone();
            reg.map_pool.spawn(move || view.map_worker());
        }
        if self.reduce_spec.is_some() && !inner.reduce_running {
            inner.reduce_running = true;
            let view = self.clone();
            reg.reduce_pool.spawn(move || view.reduce_worker());
        }
    }

    // ---- map side ----

    fn map_worker(self: Arc<Self>) {
        debug!(view = %self.name(), "map worker starting");
        loop {
            if self.handle.should_quit() {
                self.sync.inner.lock().map_running = false;
                break;
            }
            self.sync.inner.lock().dirty = false;

            match self.map_batch() {
                Err(err) => {
                    warn!(view = %self.name(), %err, "map pass failed");
                    self.record_error(format!("map pass: {err}"));
                    let mut inner = self.sync.inner.lock();
                    inner.failure = Some(err.to_string());
                    inner.map_running = false;
                    break;
                }
                Ok(processed) => {
                    let mut inner = self.sync.inner.lock();
                    if processed > 0 {
                        inner.mapped_marker += 1;
                        self.sync.cond.notify_all();
                    }
                    if processed < self.handle.config.map_batch {
                        if inner.dirty {
                            // A parent write slipped in while this batch
                            // ran; go around again.
                            continue;
                        }
                        inner.map_running = false;
                        break;
                    }
                }
            }
        }
        self.sync.cond.notify_all();
        debug!(view = %self.name(), "map worker parked");
    }

    /// One batched map pass: read parent rows past the watermark, invoke
    /// the map function, land emitted rows together with the watermark
    /// advance in a single transaction.
    fn map_batch(&self) -> Result<usize> {
        let Some(reg) = self.registry.upgrade() else {
            return Ok(0);
        };
        let batch = self.handle.config.map_batch;
        let since = {
            let conn = self.handle.conn.lock();
            views::meta_u64(&conn, "sync_map_id")?
        };

        let source_rows = self.fetch_source_rows(&reg, since, batch)?;
        if source_rows.is_empty() {
            return Ok(0);
        }
        let compiled = reg
            .script
            .compile(&self.map_spec.source, self.map_spec.language)?;

        let forward_to = match (&self.reduce_spec, &self.output) {
            (None, Some(output)) => reg.docs_named(output),
            _ => None,
        };

        let mut inserts: Vec<(String, String, String)> = Vec::new();
        for row in &source_rows {
            let emits = match reg.script.invoke_map(&compiled, &row.doc) {
                Ok(emits) => emits,
                Err(msg) => {
                    self.record_warning(format!(
                        "map failed for {:?}: {msg}",
                        row.pid.first().map(String::as_str).unwrap_or("?")
                    ));
                    continue;
                }
            };
            for emit in emits {
                let key_text = collation::to_canonical_string(&emit.key);
                let obj = match &forward_to {
                    Some(output) => forward_value(output, emit.value),
                    None => emit.value,
                };
                inserts.push((
                    serde_json::to_string(&row.pid)?,
                    key_text,
                    serde_json::to_string(&obj)?,
                ));
            }
        }

        let last_seq = source_rows.last().map(|r| r.seq).unwrap_or(since);
        {
            let conn = self.handle.conn.lock();
            sql::with_txn(&self.handle.config, &conn, |conn| {
                for (pid, key, obj) in &inserts {
                    conn.execute(
                        "INSERT INTO rows (pid, key, obj) VALUES (?1, ?2, ?3)",
                        params![pid, key, obj],
                    )?;
                }
                if !inserts.is_empty() {
                    let flagged = views::meta_u64(conn, "last_to_delete_id")?;
                    if flagged != 0 {
                        conn.execute("DELETE FROM rows WHERE seq = ?1", params![flagged as i64])?;
                        views::meta_set_u64(conn, "last_to_delete_id", 0)?;
                    }
                }
                views::meta_set_u64(conn, "sync_map_id", last_seq)?;
                Ok(())
            })?;
        }

        if !inserts.is_empty() {
            for name in self.views.read().clone() {
                if let Some(child) = reg.view_named(&name) {
                    child.touch();
                }
            }
        }
        Ok(source_rows.len())
    }

    fn fetch_source_rows(
        &self,
        reg: &Arc<RegistryInner>,
        since: u64,
        batch: usize,
    ) -> Result<Vec<SourceRow>> {
        match self.parent_kind {
            SourceKind::Docs => {
                let Some(parent) = reg.docs_named(&self.parent) else {
                    self.record_error(format!("parent collection '{}' is gone", self.parent));
                    return Ok(Vec::new());
                };
                Ok(parent
                    .map_source_batch(since, batch)?
                    .into_iter()
                    .map(|rev| SourceRow {
                        pid: vec![rev.id.clone()],
                        seq: rev.seq,
                        doc: rev.projected(),
                    })
                    .collect())
            }
            SourceKind::Links => {
                let Some(parent) = reg.links_named(&self.parent) else {
                    self.record_error(format!("parent collection '{}' is gone", self.parent));
                    return Ok(Vec::new());
                };
                Ok(parent
                    .map_source_batch(since, batch)?
                    .into_iter()
                    .map(|link| SourceRow {
                        pid: vec![link.id.clone()],
                        seq: link.seq,
                        doc: link.projected(),
                    })
                    .collect())
            }
            SourceKind::View => {
                let Some(parent) = reg.view_named(&self.parent) else {
                    self.record_error(format!("parent collection '{}' is gone", self.parent));
                    return Ok(Vec::new());
                };
                Ok(parent
                    .map_source_batch(since, batch)?
                    .into_iter()
                    .map(|row| {
                        let mut doc = Map::new();
                        doc.insert("_id".into(), Value::from(row.seq.to_string()));
                        doc.insert("key".into(), row.key);
                        doc.insert("value".into(), row.value);
                        SourceRow {
                            pid: row.pid,
                            seq: row.seq,
                            doc: Value::Object(doc),
                        }
                    })
                    .collect())
            }
        }
    }

    // ---- reduce side ----

    fn reduce_worker(self: Arc<Self>) {
        debug!(view = %self.name(), "reduce worker starting");
        loop {
            if self.handle.should_quit() {
                break;
            }
            let marker_at_start = self.sync.inner.lock().mapped_marker;

            // Drain first-pass batches.
            loop {
                match self.reduce_batch() {
                    Err(err) => {
                        warn!(view = %self.name(), %err, "reduce pass failed");
                        self.record_error(format!("reduce pass: {err}"));
                        let mut inner = self.sync.inner.lock();
                        inner.failure = Some(err.to_string());
                        inner.reduce_running = false;
                        self.sync.cond.notify_all();
                        return;
                    }
                    Ok(n) if n < self.handle.config.reduce_batch => break,
                    Ok(_) => {}
                }
                if self.handle.should_quit() {
                    break;
                }
            }

            let map_running = self.sync.inner.lock().map_running;
            if map_running {
                // Map is still producing; wait for the next bunch.
                let mut inner = self.sync.inner.lock();
                if inner.mapped_marker == marker_at_start && inner.map_running {
                    self.sync
                        .cond
                        .wait_for(&mut inner, self.handle.config.reduce_wait());
                }
                continue;
            }

            // Map is done: fold duplicate keys until each appears once.
            if let Err(err) = self.rereduce_until_clean() {
                warn!(view = %self.name(), %err, "re-reduce failed");
                self.record_error(format!("re-reduce: {err}"));
                let mut inner = self.sync.inner.lock();
                inner.failure = Some(err.to_string());
                inner.reduce_running = false;
                self.sync.cond.notify_all();
                return;
            }

            let mut inner = self.sync.inner.lock();
            if inner.map_running || inner.dirty || inner.mapped_marker != marker_at_start {
                continue;
            }
            inner.reduce_running = false;
            inner.rereducing = false;
            break;
        }
        {
            let mut inner = self.sync.inner.lock();
            inner.reduce_running = false;
            inner.rereducing = false;
        }
        self.sync.cond.notify_all();
        debug!(view = %self.name(), "reduce worker parked");
    }

    /// One first-pass reduce batch: group fresh rows by key and compress
    /// each group to its newest row, idempotently and atomically per
    /// group.
    fn reduce_batch(&self) -> Result<usize> {
        let Some(reg) = self.registry.upgrade() else {
            return Ok(0);
        };
        let Some(spec) = &self.reduce_spec else {
            return Ok(0);
        };
        let compiled = reg.script.compile(&spec.source, spec.language)?;
        let batch = self.handle.config.reduce_batch;

        let rows = {
            let conn = self.handle.conn.lock();
            let since = views::meta_u64(&conn, "sync_reduce_id")?;
            let mut stmt = conn.prepare(
                "SELECT seq, pid, key, obj FROM rows
                 WHERE seq > ?1 AND seq != (SELECT last_to_delete_id FROM view_meta)
                 ORDER BY seq LIMIT ?2",
            )?;
            let rows = stmt
                .query_map(params![since as i64, batch as i64], raw_row)?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            rows
        };
        if rows.is_empty() {
            return Ok(0);
        }

        let mut groups: BTreeMap<String, Group> = BTreeMap::new();
        let mut last_seq = 0i64;
        for (seq, pid, key_text, value) in &rows {
            last_seq = last_seq.max(*seq);
            let key: Value = serde_json::from_str(key_text).unwrap_or(Value::Null);
            let group = groups.entry(key_text.clone()).or_insert_with(|| Group {
                seqs: Vec::new(),
                keys: Vec::new(),
                pids: Vec::new(),
                values: Vec::new(),
                max_seq: 0,
            });
            group.seqs.push(*seq);
            group.keys.push(key);
            group.pids.push(pid.clone());
            group.values.push(value.clone());
            group.max_seq = group.max_seq.max(*seq);
        }

        for (key_text, group) in &groups {
            let keys: Value = group
                .keys
                .iter()
                .zip(&group.pids)
                .map(|(key, pid)| {
                    let first = pid.first().cloned().map(Value::from).unwrap_or(Value::Null);
                    json!([key, first])
                })
                .collect();
            let reduced = match reg
                .script
                .invoke_reduce(&compiled, Some(&keys), &group.values, false)
            {
                Ok(value) => value,
                Err(msg) => {
                    self.record_warning(format!("reduce failed for key {key_text}: {msg}"));
                    continue;
                }
            };
            self.compress_group(group, key_text, &reduced)?;
        }

        let conn = self.handle.conn.lock();
        views::meta_set_u64(&conn, "sync_reduce_id", last_seq as u64)?;
        Ok(rows.len())
    }

    /// Loop the re-reduce pass until every key appears exactly once. The
    /// first offending key (in collation order) is the checkpoint; a
    /// group which fails to shrink across two consecutive passes is
    /// dropped with a warning rather than stalling the view.
    fn rereduce_until_clean(&self) -> Result<()> {
        let Some(reg) = self.registry.upgrade() else {
            return Ok(());
        };
        let Some(spec) = &self.reduce_spec else {
            return Ok(());
        };
        let compiled = reg.script.compile(&spec.source, spec.language)?;

        loop {
            if self.handle.should_quit() {
                return Ok(());
            }
            let offender = {
                let conn = self.handle.conn.lock();
                conn.query_row(
                    "SELECT key, count(*), max(seq) FROM rows
                     WHERE seq != (SELECT last_to_delete_id FROM view_meta)
                     GROUP BY key HAVING count(*) > 1
                     ORDER BY key LIMIT 1",
                    [],
                    |row| {
                        Ok((
                            row.get::<_, String>(0)?,
                            row.get::<_, i64>(1)?,
                            row.get::<_, i64>(2)?,
                        ))
                    },
                )
                .map(Some)
                .or_else(|err| match err {
                    rusqlite::Error::QueryReturnedNoRows => Ok(None),
                    other => Err(other),
                })?
            };

            let Some((key_text, count, max_seq)) = offender else {
                let conn = self.handle.conn.lock();
                views::meta_set_rereduce(&conn, false)?;
                let mut inner = self.sync.inner.lock();
                inner.rereducing = false;
                inner.offender = None;
                return Ok(());
            };

            {
                let conn = self.handle.conn.lock();
                views::meta_set_rereduce(&conn, true)?;
                self.sync.inner.lock().rereducing = true;
            }

            let fingerprint = (key_text.clone(), count, max_seq);
            let jammed = {
                let mut inner = self.sync.inner.lock();
                if inner.offender.as_ref() == Some(&fingerprint) {
                    inner.offender = None;
                    true
                } else {
                    inner.offender = Some(fingerprint);
                    false
                }
            };
            if jammed {
                warn!(view = %self.name(), key = %key_text, "dropping jammed reduce group");
                self.record_warning(format!("dropped jammed reduce group for key {key_text}"));
                let conn = self.handle.conn.lock();
                sql::with_txn(&self.handle.config, &conn, |conn| {
                    conn.execute("DELETE FROM rows WHERE key = ?1", params![key_text])?;
                    Ok(())
                })?;
                continue;
            }

            let group = {
                let conn = self.handle.conn.lock();
                let mut stmt = conn.prepare(
                    "SELECT seq, pid, key, obj FROM rows
                     WHERE key = ?1 AND seq != (SELECT last_to_delete_id FROM view_meta)
                     ORDER BY seq",
                )?;
                let rows = stmt
                    .query_map(params![key_text], raw_row)?
                    .collect::<rusqlite::Result<Vec<_>>>()?;
                rows
            };
            if group.len() < 2 {
                continue;
            }
            let values: Vec<Value> = group.iter().map(|(_, _, _, v)| v.clone()).collect();
            let reduced = match reg.script.invoke_reduce(&compiled, None, &values, true) {
                Ok(value) => value,
                Err(msg) => {
                    // The fingerprint stays put, so a second failure drops
                    // the group.
                    self.record_warning(format!("re-reduce failed for key {key_text}: {msg}"));
                    continue;
                }
            };
            let folded = Group {
                seqs: group.iter().map(|(seq, ..)| *seq).collect(),
                keys: Vec::new(),
                pids: group.iter().map(|(_, pid, ..)| pid.clone()).collect(),
                values,
                max_seq: group.iter().map(|(seq, ..)| *seq).max().unwrap_or(0),
            };
            self.compress_group(&folded, &key_text, &reduced)?;
        }
    }

    /// Delete all of a group's rows but the newest; rewrite the newest
    /// with the reduced value and the concatenated producing ids.
    fn compress_group(&self, group: &Group, key_text: &str, reduced: &Value) -> Result<()> {
        let mut merged: Vec<String> = Vec::new();
        for pid in &group.pids {
            for id in pid {
                if !merged.contains(id) {
                    merged.push(id.clone());
                }
            }
        }
        let conn = self.handle.conn.lock();
        sql::with_txn(&self.handle.config, &conn, |conn| {
            for seq in &group.seqs {
                if *seq != group.max_seq {
                    conn.execute("DELETE FROM rows WHERE seq = ?1", params![seq])?;
                }
            }
            conn.execute(
                "UPDATE rows SET obj = ?1, pid = ?2, key = ?3 WHERE seq = ?4",
                params![
                    serde_json::to_string(reduced)?,
                    serde_json::to_string(&merged)?,
                    key_text,
                    group.max_seq,
                ],
            )?;
            Ok(())
        })
    }
}

type RawRow = (i64, Vec<String>, String, Value);

fn raw_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<RawRow> {
    let pid: Option<String> = row.get(1)?;
    let pid = pid
        .as_deref()
        .and_then(|text| serde_json::from_str::<Vec<String>>(text).ok())
        .unwrap_or_default();
    let key: Option<String> = row.get(2)?;
    let obj: Option<String> = row.get(3)?;
    let value = obj
        .as_deref()
        .and_then(|text| serde_json::from_str(text).ok())
        .unwrap_or(Value::Null);
    Ok((row.get(0)?, pid, key.unwrap_or_else(|| "null".into()), value))
}

/// Forward an emitted value into the output collection; the stored row
/// records the outcome. Failures never fail the view.
fn forward_value(output: &Arc<crate::DocStore>, value: Value) -> Value {
    match output.create(value, None) {
        Ok((id, rev)) => json!({"ok": true, "id": id, "rev": rev}),
        Err(err) => json!({"ok": false, "error": err.to_string()}),
    }
}
