use crate::changes::now_us;
use crate::handle::{Handle, Slots};
use crate::registry::RegistryInner;
use crate::script::ScriptSpec;
use crate::sql::{self, SchemaDef};
use crate::sync::SyncState;
use crate::{Config, Error, Language, Result};
use parking_lot::RwLock;
use rusqlite::{params, Connection, OptionalExtension};
use serde_json::Value;
use std::path::PathBuf;
use std::sync::{Arc, Weak};
use tracing::warn;

pub(crate) const SCHEMA: SchemaDef = SchemaDef {
    create: "\
        CREATE TABLE IF NOT EXISTS rows (
          seq INTEGER PRIMARY KEY AUTOINCREMENT,
          pid TEXT,
          key TEXT COLLATE json_order,
          obj TEXT
        );
        CREATE INDEX IF NOT EXISTS rows_by_key ON rows (key);
        CREATE INDEX IF NOT EXISTS rows_by_pid ON rows (pid);
        CREATE TABLE IF NOT EXISTS view_meta (
          parent            TEXT NOT NULL,
          parent_kind       TEXT NOT NULL,
          map_src           TEXT NOT NULL,
          map_lang          TEXT NOT NULL,
          reduce_src        TEXT,
          reduce_lang       TEXT,
          output            TEXT,
          creation_tm       INTEGER NOT NULL DEFAULT 0,
          sync_map_id       INTEGER NOT NULL DEFAULT 0,
          sync_reduce_id    INTEGER NOT NULL DEFAULT 0,
          sync_rereduce     INTEGER NOT NULL DEFAULT 0,
          last_to_delete_id INTEGER NOT NULL DEFAULT 0
        );",
    upgrades: [
        "ALTER TABLE view_meta ADD COLUMN output TEXT;",
        "ALTER TABLE view_meta ADD COLUMN sync_rereduce INTEGER NOT NULL DEFAULT 0;",
        "ALTER TABLE view_meta ADD COLUMN last_to_delete_id INTEGER NOT NULL DEFAULT 0;",
        "CREATE INDEX IF NOT EXISTS rows_by_pid ON rows (pid);",
    ],
};

/// What a view reads: a document store, a link store, or another view.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum SourceKind {
    Docs,
    Links,
    View,
}

impl SourceKind {
    pub(crate) fn as_str(&self) -> &'static str {
        match self {
            SourceKind::Docs => "docs",
            SourceKind::Links => "links",
            SourceKind::View => "view",
        }
    }

    pub(crate) fn from_str(s: &str) -> Result<SourceKind> {
        match s {
            "docs" => Ok(SourceKind::Docs),
            "links" => Ok(SourceKind::Links),
            "view" => Ok(SourceKind::View),
            other => Err(Error::CorruptMetadata(format!(
                "unknown view parent kind '{other}'"
            ))),
        }
    }
}

/// Parameters for view creation.
#[derive(Clone, Debug)]
pub struct ViewParams {
    pub parent_kind: SourceKind,
    pub parent: String,
    pub map: ScriptSpec,
    pub reduce: Option<ScriptSpec>,
    /// Reduce-less views may forward emitted values into this document
    /// collection, enabling pipelines.
    pub output: Option<String>,
}

/// One materialized row: the producing parent ids, the emitted key, and
/// the (possibly reduced) value.
#[derive(Clone, Debug, PartialEq)]
pub struct ViewRow {
    pub seq: u64,
    pub pid: Vec<String>,
    pub key: Value,
    pub value: Value,
}

/// Key-range query over the materialized table, ordered by the domain
/// collation.
#[derive(Clone, Debug)]
pub struct ViewQuery {
    pub start_key: Option<Value>,
    pub end_key: Option<Value>,
    pub inclusive_end: bool,
    pub descending: bool,
    pub limit: Option<usize>,
    pub offset: usize,
}

impl Default for ViewQuery {
    fn default() -> Self {
        ViewQuery {
            start_key: None,
            end_key: None,
            inclusive_end: true,
            descending: false,
            limit: None,
            offset: 0,
        }
    }
}

/// The persisted checkpoints of a view's background workers.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Watermarks {
    /// Last parent row the map pass consumed.
    pub sync_map_id: u64,
    /// Last mapped row absorbed into reduce.
    pub sync_reduce_id: u64,
    /// A re-reduce pass is pending.
    pub sync_rereduce: bool,
    /// Row scheduled for removal with the next insert.
    pub last_to_delete_id: u64,
}

/// A materialized map/reduce index over an upstream collection.
pub struct View {
    pub(crate) handle: Handle,
    pub(crate) registry: Weak<RegistryInner>,
    pub(crate) parent_kind: SourceKind,
    pub(crate) parent: String,
    pub(crate) map_spec: ScriptSpec,
    pub(crate) reduce_spec: Option<ScriptSpec>,
    pub(crate) output: Option<String>,
    pub(crate) views: RwLock<Vec<String>>,
    pub(crate) sync: SyncState,
}

impl View {
    pub(crate) fn open_at(
        name: String,
        path: PathBuf,
        config: Config,
        registry: Weak<RegistryInner>,
        spec: Option<ViewParams>,
    ) -> Result<Arc<View>> {
        let create = spec.is_some();
        let conn = sql::open_file(&path, create, &config, &SCHEMA)?;
        if let Some(p) = &spec {
            conn.execute(
                "INSERT INTO view_meta
                   (parent, parent_kind, map_src, map_lang, reduce_src, reduce_lang, output, creation_tm)
                 SELECT ?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8
                 WHERE NOT EXISTS (SELECT 1 FROM view_meta)",
                params![
                    p.parent,
                    p.parent_kind.as_str(),
                    p.map.source,
                    p.map.language.as_str(),
                    p.reduce.as_ref().map(|r| r.source.clone()),
                    p.reduce.as_ref().map(|r| r.language.as_str()),
                    p.output,
                    now_us(),
                ],
            )?;
        }

        let meta = conn
            .query_row(
                "SELECT parent, parent_kind, map_src, map_lang, reduce_src, reduce_lang, output
                 FROM view_meta",
                [],
                |row| {
                    Ok((
                        row.get::<_, String>(0)?,
                        row.get::<_, String>(1)?,
                        row.get::<_, String>(2)?,
                        row.get::<_, String>(3)?,
                        row.get::<_, Option<String>>(4)?,
                        row.get::<_, Option<String>>(5)?,
                        row.get::<_, Option<String>>(6)?,
                    ))
                },
            )
            .optional()?
            .ok_or_else(|| Error::CorruptMetadata(format!("view '{name}' has no metadata row")))?;

        let (parent, kind, map_src, map_lang, reduce_src, reduce_lang, output) = meta;
        let reduce_spec = match (reduce_src, reduce_lang) {
            (Some(source), Some(lang)) => Some(ScriptSpec {
                source,
                language: Language::from_tag(&lang)?,
            }),
            _ => None,
        };

        Ok(Arc::new(View {
            handle: Handle::new(name, path, conn, config),
            registry,
            parent_kind: SourceKind::from_str(&kind)?,
            parent,
            map_spec: ScriptSpec {
                source: map_src,
                language: Language::from_tag(&map_lang)?,
            },
            reduce_spec,
            output,
            views: RwLock::new(Vec::new()),
            sync: SyncState::default(),
        }))
    }

    pub fn name(&self) -> &str {
        &self.handle.name
    }

    /// Parent collection name and kind.
    pub fn parent(&self) -> (SourceKind, &str) {
        (self.parent_kind, &self.parent)
    }

    pub fn has_reduce(&self) -> bool {
        self.reduce_spec.is_some()
    }

    pub fn output(&self) -> Option<&str> {
        self.output.as_deref()
    }

    pub fn slots(&self) -> Slots {
        self.handle.slots()
    }

    pub fn clear_slots(&self) {
        self.handle.clear_slots()
    }

    /// Rows in key order. Reads never block the sync workers beyond
    /// per-statement locking, so a trailing edge of stale rows may be
    /// visible while a sync is in flight; `sync_now` gives a snapshot.
    pub fn get_list(&self, query: &ViewQuery) -> Result<Vec<ViewRow>> {
        let conn = self.handle.conn.lock();
        let mut sql = String::from("SELECT seq, pid, key, obj FROM rows");
        let mut args: Vec<Box<dyn rusqlite::types::ToSql>> = Vec::new();
        // A row flagged by deletion propagation is invisible until it is
        // physically removed with the next insert.
        let mut clauses: Vec<String> =
            vec!["seq != (SELECT last_to_delete_id FROM view_meta)".to_owned()];
        if let Some(start) = &query.start_key {
            args.push(Box::new(collation::to_canonical_string(start)));
            clauses.push(format!("key >= ?{}", args.len()));
        }
        if let Some(end) = &query.end_key {
            args.push(Box::new(collation::to_canonical_string(end)));
            let op = if query.inclusive_end { "<=" } else { "<" };
            clauses.push(format!("key {op} ?{}", args.len()));
        }
        sql.push_str(" WHERE ");
        sql.push_str(&clauses.join(" AND "));
        sql.push_str(if query.descending {
            " ORDER BY key DESC, seq DESC"
        } else {
            " ORDER BY key, seq"
        });
        if let Some(limit) = query.limit {
            sql.push_str(&format!(" LIMIT {limit}"));
            if query.offset > 0 {
                sql.push_str(&format!(" OFFSET {}", query.offset));
            }
        } else if query.offset > 0 {
            sql.push_str(&format!(" LIMIT -1 OFFSET {}", query.offset));
        }

        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt.query_map(rusqlite::params_from_iter(args.iter().map(|a| a.as_ref())), row_to_view_row)?;
        Ok(rows.collect::<rusqlite::Result<_>>()?)
    }

    pub fn get_total(&self) -> Result<u64> {
        let conn = self.handle.conn.lock();
        Ok(conn.query_row(
            "SELECT count(*) FROM rows
             WHERE seq != (SELECT last_to_delete_id FROM view_meta)",
            [],
            |row| row.get::<_, i64>(0),
        )? as u64)
    }

    /// Drop every row produced by |pid|, except the newest, which is
    /// flagged and removed together with the next map insert so the row
    /// sequence never regresses while feed consumers page through it.
    pub(crate) fn propagate_delete(&self, pid: &str) -> Result<()> {
        {
            let conn = self.handle.conn.lock();
            sql::with_txn(&self.handle.config, &conn, |conn| {
                let max: Option<i64> = conn.query_row(
                    "SELECT max(seq) FROM rows WHERE pid_contains(pid, ?1)",
                    params![pid],
                    |row| row.get(0),
                )?;
                let Some(max) = max else {
                    return Ok(());
                };
                let table_max: i64 =
                    conn.query_row("SELECT max(seq) FROM rows", [], |row| row.get(0))?;
                if max < table_max {
                    // Not the newest row of the table, so removal cannot
                    // make the sequence regress.
                    conn.execute(
                        "DELETE FROM rows WHERE pid_contains(pid, ?1)",
                        params![pid],
                    )?;
                    return Ok(());
                }
                conn.execute(
                    "DELETE FROM rows WHERE pid_contains(pid, ?1) AND seq < ?2",
                    params![pid, max],
                )?;
                let flagged = meta_u64(conn, "last_to_delete_id")?;
                if flagged != 0 && flagged != max as u64 {
                    // The previously flagged row is no longer newest, so
                    // it can go now.
                    conn.execute("DELETE FROM rows WHERE seq = ?1", params![flagged as i64])?;
                }
                meta_set_u64(conn, "last_to_delete_id", max as u64)?;
                Ok(())
            })?;
        }

        // The cascade: dependent views carry the same producing ids.
        if let Some(reg) = self.registry.upgrade() {
            for name in self.views.read().clone() {
                if let Some(child) = reg.view_named(&name) {
                    if let Err(err) = child.propagate_delete(pid) {
                        warn!(view = %name, %err, "cascading deletion propagation failed");
                        child.record_error(format!("propagating '{pid}': {err}"));
                    }
                }
            }
        }
        Ok(())
    }

    pub(crate) fn attach_view(&self, name: &str) {
        let mut views = self.views.write();
        if !views.iter().any(|v| v == name) {
            views.push(name.to_owned());
        }
    }

    pub(crate) fn detach_view(&self, name: &str) {
        self.views.write().retain(|v| v != name);
    }

    /// Rows past |since| in insertion order, as a cascading view's map
    /// input.
    pub(crate) fn map_source_batch(&self, since: u64, limit: usize) -> Result<Vec<ViewRow>> {
        let conn = self.handle.conn.lock();
        let mut stmt = conn.prepare(
            "SELECT seq, pid, key, obj FROM rows
             WHERE seq > ?1 AND seq != (SELECT last_to_delete_id FROM view_meta)
             ORDER BY seq LIMIT ?2",
        )?;
        let rows = stmt.query_map(params![since as i64, limit as i64], row_to_view_row)?;
        Ok(rows.collect::<rusqlite::Result<_>>()?)
    }

    /// The persisted worker checkpoints, part of the collection metadata.
    pub fn watermarks(&self) -> Result<Watermarks> {
        let conn = self.handle.conn.lock();
        conn.query_row(
            "SELECT sync_map_id, sync_reduce_id, sync_rereduce, last_to_delete_id FROM view_meta",
            [],
            |row| {
                Ok(Watermarks {
                    sync_map_id: row.get::<_, i64>(0)? as u64,
                    sync_reduce_id: row.get::<_, i64>(1)? as u64,
                    sync_rereduce: row.get(2)?,
                    last_to_delete_id: row.get::<_, i64>(3)? as u64,
                })
            },
        )
        .map_err(Error::from)
    }

    pub(crate) fn record_error(&self, message: String) {
        self.handle.set_error(message);
    }

    pub(crate) fn record_warning(&self, message: String) {
        self.handle.set_warning(message);
    }
}

pub(crate) fn meta_u64(conn: &Connection, column: &str) -> Result<u64> {
    debug_assert!(matches!(
        column,
        "sync_map_id" | "sync_reduce_id" | "last_to_delete_id"
    ));
    let value: i64 = conn.query_row(&format!("SELECT {column} FROM view_meta"), [], |row| {
        row.get(0)
    })?;
    Ok(value as u64)
}

pub(crate) fn meta_set_u64(conn: &Connection, column: &str, value: u64) -> Result<()> {
    debug_assert!(matches!(
        column,
        "sync_map_id" | "sync_reduce_id" | "last_to_delete_id"
    ));
    conn.execute(
        &format!("UPDATE view_meta SET {column} = ?1"),
        params![value as i64],
    )?;
    Ok(())
}

pub(crate) fn meta_set_rereduce(conn: &Connection, value: bool) -> Result<()> {
    conn.execute("UPDATE view_meta SET sync_rereduce = ?1", params![value])?;
    Ok(())
}

fn row_to_view_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<ViewRow> {
    let pid: Option<String> = row.get(1)?;
    let pid = pid
        .as_deref()
        .and_then(|text| serde_json::from_str::<Vec<String>>(text).ok())
        .unwrap_or_default();
    let key: Option<String> = row.get(2)?;
    let key = key
        .as_deref()
        .and_then(|text| serde_json::from_str(text).ok())
        .unwrap_or(Value::Null);
    let obj: Option<String> = row.get(3)?;
    let value = obj
        .as_deref()
        .and_then(|text| serde_json::from_str(text).ok())
        .unwrap_or(Value::Null);
    Ok(ViewRow {
        seq: row.get::<_, i64>(0)? as u64,
        pid,
        key,
        value,
    })
}
