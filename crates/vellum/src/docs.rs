use crate::changes::{now_us, ChangeItem, ChangesPage, ChangesQuery, CountType};
use crate::handle::{Handle, Slots};
use crate::mvcc::{content_hash, Mvcc};
use crate::registry::RegistryInner;
use crate::sql::{self, SchemaDef};
use crate::{ids, Config, Error, Result};
use parking_lot::RwLock;
use rusqlite::{params, Connection, OptionalExtension};
use serde::Deserialize;
use serde_json::{Map, Value};
use std::path::PathBuf;
use std::sync::{Arc, Weak};
use std::time::Duration;
use tracing::warn;

pub(crate) const SCHEMA: SchemaDef = SchemaDef {
    create: "\
        CREATE TABLE IF NOT EXISTS records (
          seq     INTEGER PRIMARY KEY AUTOINCREMENT,
          id      TEXT NOT NULL,
          rev     INTEGER NOT NULL DEFAULT 1,
          hash    TEXT NOT NULL,
          body    TEXT,
          deleted INTEGER NOT NULL DEFAULT 0,
          tm      INTEGER NOT NULL,
          UNIQUE (id, rev)
        );
        CREATE INDEX IF NOT EXISTS records_by_id ON records (id);
        CREATE INDEX IF NOT EXISTS records_by_deleted ON records (deleted);
        CREATE INDEX IF NOT EXISTS records_by_tm ON records (tm);
        CREATE TABLE IF NOT EXISTS store_meta (
          creation_tm INTEGER NOT NULL DEFAULT 0,
          compact_id  INTEGER NOT NULL DEFAULT 0
        );",
    upgrades: [
        "CREATE INDEX IF NOT EXISTS records_by_deleted ON records (deleted);",
        "ALTER TABLE store_meta ADD COLUMN creation_tm INTEGER NOT NULL DEFAULT 0;",
        "CREATE INDEX IF NOT EXISTS records_by_tm ON records (tm);",
        "DROP INDEX IF EXISTS records_by_hash;",
    ],
};

/// One revision of a document. The latest revision per id is the
/// document's current state; `deleted` marks a tombstone.
#[derive(Clone, Debug, PartialEq)]
pub struct Revision {
    pub id: String,
    pub rev: i64,
    pub hash: String,
    pub seq: u64,
    pub deleted: bool,
    pub created_us: i64,
    pub body: Value,
}

impl Revision {
    pub fn mvcc(&self) -> String {
        Mvcc::new(self.rev, self.hash.clone()).to_string()
    }

    /// The document handed to map functions: the body plus synthetic
    /// `_id`/`_rev`/`_created` fields, never persisted back.
    pub(crate) fn projected(&self) -> Value {
        let mut fields = match &self.body {
            Value::Object(fields) => fields.clone(),
            other => {
                let mut m = Map::new();
                m.insert("value".into(), other.clone());
                m
            }
        };
        fields.insert("_id".into(), Value::from(self.id.clone()));
        fields.insert("_rev".into(), Value::from(self.mvcc()));
        fields.insert("_created".into(), Value::from(self.created_us));
        Value::Object(fields)
    }
}

/// Simple field predicate for listings: equality, substring, prefix, or
/// presence on one top-level body field.
#[derive(Clone, Debug)]
pub struct FieldFilter {
    pub field: String,
    pub op: FilterOp,
    pub value: String,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum FilterOp {
    Eq,
    Contains,
    StartsWith,
    Present,
}

impl FilterOp {
    pub(crate) fn as_str(&self) -> &'static str {
        match self {
            FilterOp::Eq => "eq",
            FilterOp::Contains => "contains",
            FilterOp::StartsWith => "starts_with",
            FilterOp::Present => "present",
        }
    }
}

/// Listing query over head revisions.
#[derive(Clone, Debug, Default)]
pub struct ListQuery {
    pub since: u64,
    pub to: Option<u64>,
    pub limit: Option<usize>,
    pub offset: usize,
    pub descending: bool,
    pub count_type: CountType,
    pub filter: Option<FieldFilter>,
}

/// One record of a bulk request. `rev` present means update (or delete,
/// with `deleted`); absent means create.
#[derive(Clone, Debug, Deserialize)]
pub struct BulkDoc {
    pub id: Option<String>,
    pub rev: Option<String>,
    #[serde(default)]
    pub deleted: bool,
    #[serde(default)]
    pub body: Value,
}

/// Per-record outcome of a bulk request.
#[derive(Clone, Debug, PartialEq)]
pub enum BulkResult {
    Ok { id: String, rev: String },
    Err { id: Option<String>, error: String },
}

pub(crate) struct HeadRow {
    pub seq: u64,
    pub rev: i64,
    pub hash: String,
    pub deleted: bool,
}

/// Names of derived collections attached to a document store. Held as
/// names, not handles: fan-out resolves them against the registry at
/// mutation time, so a deleted dependent is simply skipped.
#[derive(Clone, Debug, Default)]
pub(crate) struct DocDeps {
    pub links: Vec<String>,
    pub blobs: Vec<String>,
    pub views: Vec<String>,
}

/// A versioned JSON document collection backed by one SQLite file.
pub struct DocStore {
    pub(crate) handle: Handle,
    pub(crate) registry: Weak<RegistryInner>,
    pub(crate) deps: RwLock<DocDeps>,
    pub(crate) compact: crate::compact::RunFlag,
}

enum CreateOutcome {
    Fresh { seq: u64, tm: i64 },
    Idempotent,
}

impl DocStore {
    pub(crate) fn open_at(
        name: String,
        path: PathBuf,
        config: Config,
        registry: Weak<RegistryInner>,
        create: bool,
    ) -> Result<Arc<DocStore>> {
        let conn = sql::open_file(&path, create, &config, &SCHEMA)?;
        conn.execute(
            "INSERT INTO store_meta (creation_tm, compact_id)
             SELECT ?1, 0 WHERE NOT EXISTS (SELECT 1 FROM store_meta)",
            params![now_us()],
        )?;
        Ok(Arc::new(DocStore {
            handle: Handle::new(name, path, conn, config),
            registry,
            deps: RwLock::new(DocDeps::default()),
            compact: crate::compact::RunFlag::default(),
        }))
    }

    pub fn name(&self) -> &str {
        &self.handle.name
    }

    /// Error/warning slots; derivation failures surface here.
    pub fn slots(&self) -> Slots {
        self.handle.slots()
    }

    pub fn clear_slots(&self) {
        self.handle.clear_slots()
    }

    /// Create a document. A missing id is generated; re-issuing an
    /// identical create (same id, same content) is idempotent.
    pub fn create(&self, body: Value, id: Option<&str>) -> Result<(String, String)> {
        let body = sanitize_body(body)?;
        let id = match id {
            Some(id) => {
                ids::validate_record_id(id)?;
                id.to_owned()
            }
            None => self.generate_id()?,
        };
        let hash = content_hash(&body);
        let body_text = serde_json::to_string(&body)?;

        let outcome = {
            let conn = self.handle.conn.lock();
            self.in_txn(&conn, |conn| {
                match head(conn, &id)? {
                    Some(h) if h.rev == 1 && !h.deleted && h.hash == hash => {
                        Ok(CreateOutcome::Idempotent)
                    }
                    Some(_) => Err(Error::Conflict(id.clone())),
                    None => {
                        let tm = now_us();
                        conn.execute(
                            "INSERT INTO records (id, rev, hash, body, deleted, tm)
                             VALUES (?1, 1, ?2, ?3, 0, ?4)",
                            params![id, hash, body_text, tm],
                        )?;
                        Ok(CreateOutcome::Fresh {
                            seq: conn.last_insert_rowid() as u64,
                            tm,
                        })
                    }
                }
            })?
        };

        let token = Mvcc::new(1, hash).to_string();
        if let CreateOutcome::Fresh { seq, tm } = outcome {
            self.publish(seq, &id, false, tm, &token);
            self.fan_out_touch();
        }
        Ok((id, token))
    }

    /// Read the latest revision; a tombstone comes back with
    /// `deleted = true`.
    pub fn read(&self, id: &str) -> Result<Revision> {
        let conn = self.handle.conn.lock();
        read_head(&conn, id)?.ok_or_else(|| Error::NotFound(id.to_owned()))
    }

    /// Read one specific revision, which may have been compacted away.
    pub fn read_rev(&self, id: &str, rev: i64) -> Result<Revision> {
        let conn = self.handle.conn.lock();
        conn.query_row(
            "SELECT seq, id, rev, hash, body, deleted, tm FROM records
             WHERE id = ?1 AND rev = ?2",
            params![id, rev],
            row_to_revision,
        )
        .optional()?
        .ok_or_else(|| Error::NotFound(format!("{id}@{rev}")))
    }

    /// Replace the document body. The supplied token must match the
    /// current head exactly.
    pub fn update(&self, id: &str, mvcc: &str, body: Value) -> Result<(String, String)> {
        let token = Mvcc::parse(mvcc)?;
        let body = sanitize_body(body)?;
        let hash = content_hash(&body);
        let body_text = serde_json::to_string(&body)?;

        let (seq, tm, new_rev) = {
            let conn = self.handle.conn.lock();
            self.in_txn(&conn, |conn| {
                let h = head(conn, id)?.ok_or_else(|| Error::NotFound(id.to_owned()))?;
                if h.rev != token.rev || h.hash != token.hash {
                    return Err(Error::Conflict(id.to_owned()));
                }
                let tm = now_us();
                conn.execute(
                    "INSERT INTO records (id, rev, hash, body, deleted, tm)
                     VALUES (?1, ?2, ?3, ?4, 0, ?5)",
                    params![id, h.rev + 1, hash, body_text, tm],
                )?;
                Ok((conn.last_insert_rowid() as u64, tm, h.rev + 1))
            })?
        };

        let new_token = Mvcc::new(new_rev, hash).to_string();
        self.publish(seq, id, false, tm, &new_token);
        self.fan_out_replaced(id);
        Ok((id.to_owned(), new_token))
    }

    /// Write a tombstone revision. Deleting an already-deleted document
    /// fails `NotFound`, matching reads of a tombstone being "gone".
    pub fn delete(&self, id: &str, mvcc: &str) -> Result<String> {
        let token = Mvcc::parse(mvcc)?;
        let body = Value::Object(Map::new());
        let hash = content_hash(&body);

        let (seq, tm, new_rev) = {
            let conn = self.handle.conn.lock();
            self.in_txn(&conn, |conn| {
                let h = head(conn, id)?.ok_or_else(|| Error::NotFound(id.to_owned()))?;
                if h.deleted {
                    return Err(Error::NotFound(id.to_owned()));
                }
                if h.rev != token.rev || h.hash != token.hash {
                    return Err(Error::Conflict(id.to_owned()));
                }
                let tm = now_us();
                conn.execute(
                    "INSERT INTO records (id, rev, hash, body, deleted, tm)
                     VALUES (?1, ?2, ?3, '{}', 1, ?4)",
                    params![id, h.rev + 1, hash, tm],
                )?;
                Ok((conn.last_insert_rowid() as u64, tm, h.rev + 1))
            })?
        };

        let new_token = Mvcc::new(new_rev, hash).to_string();
        self.publish(seq, id, true, tm, &new_token);
        self.fan_out_deleted(id);
        Ok(new_token)
    }

    /// Apply records independently; one failure never aborts the rest.
    /// Cross-record atomicity requires an explicit transaction on the
    /// handle (`begin_transaction` / `commit_transaction`).
    pub fn bulk(&self, records: Vec<BulkDoc>) -> Vec<BulkResult> {
        records
            .into_iter()
            .map(|record| {
                let id = record.id.clone();
                let outcome = match (&record.rev, record.deleted) {
                    (Some(rev), true) => match &id {
                        Some(id) => self.delete(id, rev).map(|token| (id.clone(), token)),
                        None => Err(Error::InvalidId(String::new())),
                    },
                    (Some(rev), false) => match &id {
                        Some(id) => self
                            .update(id, rev, record.body)
                            .map(|(id, token)| (id, token)),
                        None => Err(Error::InvalidId(String::new())),
                    },
                    (None, true) => Err(Error::InvalidMvcc(String::new())),
                    (None, false) => self.create(record.body, id.as_deref()),
                };
                match outcome {
                    Ok((id, rev)) => BulkResult::Ok { id, rev },
                    Err(err) => BulkResult::Err {
                        id,
                        error: err.to_string(),
                    },
                }
            })
            .collect()
    }

    /// Open a caller-scoped transaction on this handle. Writes issued
    /// until `commit_transaction`/`rollback_transaction` share it; the
    /// caller is responsible for finishing it.
    pub fn begin_transaction(&self) -> Result<()> {
        let conn = self.handle.conn.lock();
        sql::busy_retry(&self.handle.config, || conn.execute_batch("BEGIN IMMEDIATE;"))?;
        self.handle.set_bulk(true);
        Ok(())
    }

    pub fn commit_transaction(&self) -> Result<()> {
        let conn = self.handle.conn.lock();
        self.handle.set_bulk(false);
        sql::busy_retry(&self.handle.config, || conn.execute_batch("COMMIT;"))?;
        Ok(())
    }

    pub fn rollback_transaction(&self) -> Result<()> {
        let conn = self.handle.conn.lock();
        self.handle.set_bulk(false);
        conn.execute_batch("ROLLBACK;")?;
        Ok(())
    }

    /// A fresh id no current record uses.
    pub fn generate_id(&self) -> Result<String> {
        let conn = self.handle.conn.lock();
        loop {
            let id = ids::random_id(self.handle.config.id_length);
            let taken: Option<i64> = conn
                .query_row(
                    "SELECT 1 FROM records WHERE id = ?1 LIMIT 1",
                    params![id],
                    |row| row.get(0),
                )
                .optional()?;
            if taken.is_none() {
                return Ok(id);
            }
        }
    }

    /// Live, deleted, or total record count (one row per id).
    pub fn count(&self, count_type: CountType) -> Result<u64> {
        let conn = self.handle.conn.lock();
        let predicate = match count_type {
            CountType::All => "",
            CountType::Live => "AND r.deleted = 0",
            CountType::Deleted => "AND r.deleted = 1",
        };
        let sql = format!(
            "SELECT count(*) FROM records r
             WHERE r.rev = (SELECT max(rev) FROM records r2 WHERE r2.id = r.id) {predicate}"
        );
        Ok(conn.query_row(&sql, [], |row| row.get::<_, i64>(0))? as u64)
    }

    /// Head revisions in sequence order, optionally filtered.
    pub fn list(&self, query: &ListQuery) -> Result<Vec<Revision>> {
        let conn = self.handle.conn.lock();
        let mut sql = String::from(
            "SELECT seq, id, rev, hash, body, deleted, tm FROM records r
             WHERE r.rev = (SELECT max(rev) FROM records r2 WHERE r2.id = r.id)
               AND seq > ?1",
        );
        let mut args: Vec<Box<dyn rusqlite::types::ToSql>> = vec![Box::new(query.since as i64)];
        if let Some(to) = query.to {
            args.push(Box::new(to as i64));
            sql.push_str(&format!(" AND seq <= ?{}", args.len()));
        }
        match query.count_type {
            CountType::All => {}
            CountType::Live => sql.push_str(" AND deleted = 0"),
            CountType::Deleted => sql.push_str(" AND deleted = 1"),
        }
        if let Some(filter) = &query.filter {
            args.push(Box::new(filter.field.clone()));
            let field = args.len();
            args.push(Box::new(filter.op.as_str()));
            let op = args.len();
            args.push(Box::new(filter.value.clone()));
            sql.push_str(&format!(
                " AND json_field_matches(body, ?{field}, ?{op}, ?{})",
                args.len()
            ));
        }
        sql.push_str(" ORDER BY seq");
        if query.descending {
            sql.push_str(" DESC");
        }
        push_paging(&mut sql, &mut args, query.limit, query.offset);

        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt.query_map(rusqlite::params_from_iter(args.iter().map(|a| a.as_ref())), row_to_revision)?;
        Ok(rows.collect::<rusqlite::Result<_>>()?)
    }

    /// One-shot change feed page.
    pub fn changes(&self, query: &ChangesQuery) -> Result<ChangesPage> {
        let conn = self.handle.conn.lock();
        let mut sql = String::from(
            "SELECT seq, id, rev, hash, deleted, tm FROM records WHERE seq > ?1",
        );
        let mut args: Vec<Box<dyn rusqlite::types::ToSql>> = vec![Box::new(query.since as i64)];
        if let Some(to) = query.to {
            args.push(Box::new(to as i64));
            sql.push_str(&format!(" AND seq <= ?{}", args.len()));
        }
        match query.count_type {
            CountType::All => {}
            CountType::Live => sql.push_str(" AND deleted = 0"),
            CountType::Deleted => sql.push_str(" AND deleted = 1"),
        }
        sql.push_str(" ORDER BY seq");
        if query.descending {
            sql.push_str(" DESC");
        }
        push_paging(&mut sql, &mut args, query.limit, query.offset);

        let mut stmt = conn.prepare(&sql)?;
        let items = stmt
            .query_map(rusqlite::params_from_iter(args.iter().map(|a| a.as_ref())), |row| {
                let rev: i64 = row.get(2)?;
                let hash: String = row.get(3)?;
                Ok(ChangeItem {
                    seq: row.get::<_, i64>(0)? as u64,
                    id: row.get(1)?,
                    deleted: row.get(4)?,
                    created_us: row.get(5)?,
                    expire_us: None,
                    rev: Mvcc::new(rev, hash).to_string(),
                    link: None,
                })
            })?
            .collect::<rusqlite::Result<Vec<_>>>()?;

        let last_seq = items.iter().map(|i| i.seq).max().unwrap_or(query.since);
        Ok(ChangesPage { items, last_seq })
    }

    /// Long-poll variant: if the one-shot page is empty, block until a
    /// write lands past `since`, the timeout passes, or shutdown.
    pub fn changes_wait(&self, query: &ChangesQuery, timeout: Duration) -> Result<ChangesPage> {
        let page = self.changes(query)?;
        if !page.items.is_empty() {
            return Ok(page);
        }
        self.handle
            .notifier
            .wait_past(query.since, timeout, self.handle.quit_flag());
        self.changes(query)
    }

    /// Number of feed items the query would return, without paging.
    pub fn total_changes(&self, query: &ChangesQuery) -> Result<u64> {
        let conn = self.handle.conn.lock();
        let mut sql = String::from("SELECT count(*) FROM records WHERE seq > ?1");
        let mut args: Vec<Box<dyn rusqlite::types::ToSql>> = vec![Box::new(query.since as i64)];
        if let Some(to) = query.to {
            args.push(Box::new(to as i64));
            sql.push_str(&format!(" AND seq <= ?{}", args.len()));
        }
        match query.count_type {
            CountType::All => {}
            CountType::Live => sql.push_str(" AND deleted = 0"),
            CountType::Deleted => sql.push_str(" AND deleted = 1"),
        }
        Ok(conn.query_row(&sql, rusqlite::params_from_iter(args.iter().map(|a| a.as_ref())), |row| {
            row.get::<_, i64>(0)
        })? as u64)
    }

    /// Largest sequence number ever assigned (0 when empty).
    pub fn max_seq(&self) -> Result<u64> {
        let conn = self.handle.conn.lock();
        let max: Option<i64> =
            conn.query_row("SELECT max(seq) FROM records", [], |row| row.get(0))?;
        Ok(max.unwrap_or(0) as u64)
    }

    /// Register a continuous-feed handler; it runs on every committed write.
    pub fn subscribe(
        &self,
        handler: impl Fn(&ChangeItem) + Send + Sync + 'static,
    ) -> crate::changes::SubscriptionId {
        self.handle.notifier.subscribe(std::sync::Arc::new(handler))
    }

    pub fn unsubscribe(&self, id: crate::changes::SubscriptionId) {
        self.handle.notifier.unsubscribe(id);
    }

    // ---- internals ----

    fn in_txn<T>(
        &self,
        conn: &Connection,
        f: impl FnOnce(&Connection) -> Result<T>,
    ) -> Result<T> {
        if self.handle.in_bulk() {
            f(conn)
        } else {
            sql::with_txn(&self.handle.config, conn, f)
        }
    }

    fn publish(&self, seq: u64, id: &str, deleted: bool, tm: i64, rev: &str) {
        self.handle.notifier.publish(&ChangeItem {
            seq,
            id: id.to_owned(),
            deleted,
            created_us: tm,
            expire_us: None,
            rev: rev.to_owned(),
            link: None,
        });
    }

    /// Wake dependent views after an insert.
    fn fan_out_touch(&self) {
        let Some(reg) = self.registry.upgrade() else {
            return;
        };
        for name in self.deps.read().views.clone() {
            if let Some(view) = reg.view_named(&name) {
                view.touch();
            }
        }
    }

    /// An update supersedes the old head: dependent views drop its rows,
    /// then remap.
    fn fan_out_replaced(&self, id: &str) {
        let Some(reg) = self.registry.upgrade() else {
            return;
        };
        for name in self.deps.read().views.clone() {
            if let Some(view) = reg.view_named(&name) {
                if let Err(err) = view.propagate_delete(id) {
                    warn!(view = %name, %err, "deletion propagation failed");
                    view.record_error(format!("propagating '{id}': {err}"));
                }
                view.touch();
            }
        }
    }

    /// A delete cascades: attachments go, owned links tombstone, views
    /// drop the document's rows.
    fn fan_out_deleted(&self, id: &str) {
        let Some(reg) = self.registry.upgrade() else {
            return;
        };
        let deps = self.deps.read().clone();
        for name in &deps.blobs {
            if let Some(blobs) = reg.blobs_named(name) {
                if let Err(err) = blobs.delete_all(id) {
                    warn!(attachments = %name, %err, "cascade delete failed");
                    blobs.record_error(format!("cascading delete of '{id}': {err}"));
                }
            }
        }
        for name in &deps.links {
            if let Some(links) = reg.links_named(name) {
                if let Err(err) = links.tombstone_context(id) {
                    warn!(links = %name, %err, "context cascade failed");
                    links.record_error(format!("cascading context '{id}': {err}"));
                }
            }
        }
        for name in &deps.views {
            if let Some(view) = reg.view_named(name) {
                if let Err(err) = view.propagate_delete(id) {
                    warn!(view = %name, %err, "deletion propagation failed");
                    view.record_error(format!("propagating '{id}': {err}"));
                }
                view.touch();
            }
        }
    }

    // Dependent bookkeeping, driven by the registry.
    pub(crate) fn attach_view(&self, name: &str) {
        let mut deps = self.deps.write();
        if !deps.views.iter().any(|v| v == name) {
            deps.views.push(name.to_owned());
        }
    }
    pub(crate) fn detach_view(&self, name: &str) {
        self.deps.write().views.retain(|v| v != name);
    }
    pub(crate) fn attach_links(&self, name: &str) {
        let mut deps = self.deps.write();
        if !deps.links.iter().any(|v| v == name) {
            deps.links.push(name.to_owned());
        }
    }
    pub(crate) fn detach_links(&self, name: &str) {
        self.deps.write().links.retain(|v| v != name);
    }
    pub(crate) fn attach_blobs(&self, name: &str) {
        let mut deps = self.deps.write();
        if !deps.blobs.iter().any(|v| v == name) {
            deps.blobs.push(name.to_owned());
        }
    }
    pub(crate) fn detach_blobs(&self, name: &str) {
        self.deps.write().blobs.retain(|v| v != name);
    }

    /// Live head revisions past |since|, in sequence order: the map
    /// pass's input batch.
    pub(crate) fn map_source_batch(&self, since: u64, limit: usize) -> Result<Vec<Revision>> {
        let conn = self.handle.conn.lock();
        let mut stmt = conn.prepare(
            "SELECT seq, id, rev, hash, body, deleted, tm FROM records r
             WHERE r.rev = (SELECT max(rev) FROM records r2 WHERE r2.id = r.id)
               AND r.deleted = 0 AND r.seq > ?1
             ORDER BY r.seq LIMIT ?2",
        )?;
        let rows = stmt.query_map(params![since as i64, limit as i64], row_to_revision)?;
        Ok(rows.collect::<rusqlite::Result<_>>()?)
    }

    /// Whether the id currently resolves to a live (non-tombstone) head.
    pub(crate) fn is_live(&self, id: &str) -> Result<bool> {
        let conn = self.handle.conn.lock();
        let head = head(&conn, id)?;
        Ok(matches!(head, Some(h) if !h.deleted))
    }

    pub(crate) fn record_error(&self, message: String) {
        self.handle.set_error(message);
    }
}

fn push_paging(
    sql: &mut String,
    args: &mut Vec<Box<dyn rusqlite::types::ToSql>>,
    limit: Option<usize>,
    offset: usize,
) {
    if limit.is_some() || offset > 0 {
        let limit = limit.map(|l| l as i64).unwrap_or(-1);
        args.push(Box::new(limit));
        sql.push_str(&format!(" LIMIT ?{}", args.len()));
        if offset > 0 {
            args.push(Box::new(offset as i64));
            sql.push_str(&format!(" OFFSET ?{}", args.len()));
        }
    }
}

/// Reject non-object bodies and drop reserved `_`-prefixed user fields.
pub(crate) fn sanitize_body(body: Value) -> Result<Value> {
    match body {
        Value::Object(fields) => Ok(Value::Object(
            fields
                .into_iter()
                .filter(|(k, _)| !k.starts_with('_'))
                .collect(),
        )),
        other => Err(Error::InvalidJson(format!(
            "document body must be an object, got {other}"
        ))),
    }
}

pub(crate) fn head(conn: &Connection, id: &str) -> Result<Option<HeadRow>> {
    Ok(conn
        .query_row(
            "SELECT seq, rev, hash, deleted FROM records
             WHERE id = ?1 ORDER BY rev DESC LIMIT 1",
            params![id],
            |row| {
                Ok(HeadRow {
                    seq: row.get::<_, i64>(0)? as u64,
                    rev: row.get(1)?,
                    hash: row.get(2)?,
                    deleted: row.get(3)?,
                })
            },
        )
        .optional()?)
}

fn read_head(conn: &Connection, id: &str) -> Result<Option<Revision>> {
    Ok(conn
        .query_row(
            "SELECT seq, id, rev, hash, body, deleted, tm FROM records
             WHERE id = ?1 ORDER BY rev DESC LIMIT 1",
            params![id],
            row_to_revision,
        )
        .optional()?)
}

fn row_to_revision(row: &rusqlite::Row<'_>) -> rusqlite::Result<Revision> {
    let body: Option<String> = row.get(4)?;
    let body = body
        .as_deref()
        .and_then(|text| serde_json::from_str(text).ok())
        .unwrap_or(Value::Null);
    Ok(Revision {
        seq: row.get::<_, i64>(0)? as u64,
        id: row.get(1)?,
        rev: row.get(2)?,
        hash: row.get(3)?,
        body,
        deleted: row.get(5)?,
        created_us: row.get(6)?,
    })
}

#[cfg(test)]
mod test {
    use super::*;
    use serde_json::json;
    use tempfile::TempDir;

    fn store(dir: &TempDir) -> Arc<DocStore> {
        DocStore::open_at(
            "notes".into(),
            dir.path().join("notes.docs"),
            Config::default(),
            Weak::new(),
            true,
        )
        .unwrap()
    }

    #[test]
    fn create_read_round_trip() {
        let dir = TempDir::new().unwrap();
        let store = store(&dir);
        let (id, rev) = store.create(json!({"x": 1}), None).unwrap();
        assert!(rev.starts_with("1-"));

        let doc = store.read(&id).unwrap();
        assert_eq!(doc.body, json!({"x": 1}));
        assert_eq!(doc.mvcc(), rev);
        assert!(!doc.deleted);
    }

    #[test]
    fn reserved_fields_are_dropped() {
        let dir = TempDir::new().unwrap();
        let store = store(&dir);
        let (id, _) = store
            .create(json!({"x": 1, "_rev": "boo", "_mine": 2}), None)
            .unwrap();
        assert_eq!(store.read(&id).unwrap().body, json!({"x": 1}));
    }

    #[test]
    fn non_object_bodies_are_rejected() {
        let dir = TempDir::new().unwrap();
        let store = store(&dir);
        assert!(matches!(
            store.create(json!([1, 2]), None),
            Err(Error::InvalidJson(_))
        ));
    }

    #[test]
    fn update_advances_and_conflicts() {
        let dir = TempDir::new().unwrap();
        let store = store(&dir);
        let (id, rev1) = store.create(json!({"x": 1}), None).unwrap();
        let (_, rev2) = store.update(&id, &rev1, json!({"x": 2})).unwrap();
        assert!(rev2.starts_with("2-"));
        assert_eq!(store.read(&id).unwrap().body, json!({"x": 2}));

        // Stale token conflicts, and the store is unchanged.
        assert!(matches!(
            store.update(&id, &rev1, json!({"x": 3})),
            Err(Error::Conflict(_))
        ));
        assert_eq!(store.read(&id).unwrap().body, json!({"x": 2}));
    }

    #[test]
    fn delete_writes_a_tombstone() {
        let dir = TempDir::new().unwrap();
        let store = store(&dir);
        let (id, rev1) = store.create(json!({"x": 1}), None).unwrap();
        let rev2 = store.delete(&id, &rev1).unwrap();
        assert!(rev2.starts_with("2-"));

        let doc = store.read(&id).unwrap();
        assert!(doc.deleted);
        assert_eq!(doc.rev, 2);

        // A tombstone is "gone" for delete purposes.
        assert!(matches!(store.delete(&id, &rev2), Err(Error::NotFound(_))));
        // But resurrectable by an update carrying its token.
        let (_, rev3) = store.update(&id, &rev2, json!({"x": 9})).unwrap();
        assert!(rev3.starts_with("3-"));
        assert!(!store.read(&id).unwrap().deleted);
    }

    #[test]
    fn explicit_create_conflicts_on_existing_id() {
        let dir = TempDir::new().unwrap();
        let store = store(&dir);
        store.create(json!({"x": 1}), Some("d1")).unwrap();
        assert!(matches!(
            store.create(json!({"y": 2}), Some("d1")),
            Err(Error::Conflict(_))
        ));
        // Identical re-issue is idempotent.
        let (id, rev) = store.create(json!({"x": 1}), Some("d1")).unwrap();
        assert_eq!(id, "d1");
        assert!(rev.starts_with("1-"));
    }

    #[test]
    fn revisions_are_contiguous_from_one() {
        let dir = TempDir::new().unwrap();
        let store = store(&dir);
        let (id, mut rev) = store.create(json!({"n": 0}), None).unwrap();
        for n in 1..=5 {
            let (_, next) = store.update(&id, &rev, json!({ "n": n })).unwrap();
            rev = next;
        }
        for n in 1..=6 {
            let r = store.read_rev(&id, n).unwrap();
            assert_eq!(r.rev, n);
            assert_eq!(r.mvcc(), format!("{n}-{}", r.hash));
        }
        assert!(store.read_rev(&id, 7).is_err());
    }

    #[test]
    fn bulk_mixes_outcomes() {
        let dir = TempDir::new().unwrap();
        let store = store(&dir);
        let (id, rev) = store.create(json!({"x": 1}), Some("keep")).unwrap();

        let results = store.bulk(vec![
            BulkDoc {
                id: None,
                rev: None,
                deleted: false,
                body: json!({"a": 1}),
            },
            BulkDoc {
                id: Some(id.clone()),
                rev: Some(rev),
                deleted: false,
                body: json!({"x": 2}),
            },
            BulkDoc {
                id: Some(id.clone()),
                rev: Some(format!("1-{}", "0".repeat(64))),
                deleted: false,
                body: json!({"x": 3}),
            },
        ]);

        assert!(matches!(&results[0], BulkResult::Ok { .. }));
        assert!(matches!(&results[1], BulkResult::Ok { .. }));
        assert!(matches!(&results[2], BulkResult::Err { .. }));
        assert_eq!(store.read(&id).unwrap().body, json!({"x": 2}));
    }

    #[test]
    fn changes_pages_by_seq() {
        let dir = TempDir::new().unwrap();
        let store = store(&dir);

        let empty = store.changes(&ChangesQuery::since(0)).unwrap();
        assert!(empty.items.is_empty());
        assert_eq!(empty.last_seq, 0);

        for n in 0..3 {
            store.create(json!({ "n": n }), None).unwrap();
        }
        let page = store.changes(&ChangesQuery::since(0)).unwrap();
        assert_eq!(page.items.len(), 3);
        let seqs: Vec<u64> = page.items.iter().map(|i| i.seq).collect();
        assert!(seqs.windows(2).all(|w| w[0] < w[1]));
        assert_eq!(page.last_seq, seqs[2]);

        let tail = store.changes(&ChangesQuery::since(seqs[1])).unwrap();
        assert_eq!(tail.items.len(), 1);
        assert_eq!(tail.items[0].seq, seqs[2]);
    }

    #[test]
    fn counts_track_tombstones() {
        let dir = TempDir::new().unwrap();
        let store = store(&dir);
        let (id, rev) = store.create(json!({"x": 1}), None).unwrap();
        store.create(json!({"y": 2}), None).unwrap();
        store.delete(&id, &rev).unwrap();

        assert_eq!(store.count(CountType::All).unwrap(), 2);
        assert_eq!(store.count(CountType::Live).unwrap(), 1);
        assert_eq!(store.count(CountType::Deleted).unwrap(), 1);
    }

    #[test]
    fn list_filters_on_fields() {
        let dir = TempDir::new().unwrap();
        let store = store(&dir);
        store.create(json!({"t": "alpha"}), None).unwrap();
        store.create(json!({"t": "beta"}), None).unwrap();
        store.create(json!({"u": 1}), None).unwrap();

        let hits = store
            .list(&ListQuery {
                filter: Some(FieldFilter {
                    field: "t".into(),
                    op: FilterOp::StartsWith,
                    value: "al".into(),
                }),
                ..ListQuery::default()
            })
            .unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].body, json!({"t": "alpha"}));

        let present = store
            .list(&ListQuery {
                filter: Some(FieldFilter {
                    field: "t".into(),
                    op: FilterOp::Present,
                    value: String::new(),
                }),
                ..ListQuery::default()
            })
            .unwrap();
        assert_eq!(present.len(), 2);
    }

    #[test]
    fn map_source_batch_skips_tombstones_and_old_heads() {
        let dir = TempDir::new().unwrap();
        let store = store(&dir);
        let (a, rev_a) = store.create(json!({"t": "a"}), None).unwrap();
        store.create(json!({"t": "b"}), None).unwrap();
        store.update(&a, &rev_a, json!({"t": "a2"})).unwrap();

        let batch = store.map_source_batch(0, 10).unwrap();
        assert_eq!(batch.len(), 2);
        // The updated head sorts after the untouched doc.
        assert_eq!(batch[0].body, json!({"t": "b"}));
        assert_eq!(batch[1].body, json!({"t": "a2"}));
    }

    #[test]
    fn explicit_transaction_scopes_writes() {
        let dir = TempDir::new().unwrap();
        let store = store(&dir);
        store.begin_transaction().unwrap();
        store.create(json!({"x": 1}), Some("t1")).unwrap();
        store.create(json!({"x": 2}), Some("t2")).unwrap();
        store.rollback_transaction().unwrap();
        assert!(store.read("t1").is_err());
        assert!(store.read("t2").is_err());

        store.begin_transaction().unwrap();
        store.create(json!({"x": 1}), Some("t3")).unwrap();
        store.commit_transaction().unwrap();
        assert!(store.read("t3").is_ok());
    }

    #[test]
    fn generated_ids_do_not_collide_with_existing() {
        let dir = TempDir::new().unwrap();
        let store = store(&dir);
        let id = store.generate_id().unwrap();
        assert_eq!(id.len(), Config::default().id_length);
        store.create(json!({}), Some(&id)).unwrap();
        assert_ne!(store.generate_id().unwrap(), id);
    }
}
