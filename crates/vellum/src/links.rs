use crate::changes::{now_us, ChangeItem, ChangesPage, ChangesQuery, CountType, LinkChange};
use crate::docs::sanitize_body;
use crate::handle::{Handle, Slots};
use crate::mvcc::{content_hash, Mvcc};
use crate::registry::RegistryInner;
use crate::sql::{self, SchemaDef};
use crate::{ids, Config, Error, Result};
use parking_lot::RwLock;
use rusqlite::{params, Connection, OptionalExtension};
use serde_json::{json, Map, Value};
use std::path::PathBuf;
use std::sync::{Arc, Weak};
use std::time::Duration;
use tracing::warn;
use url::Url;

pub(crate) const SCHEMA: SchemaDef = SchemaDef {
    create: "\
        CREATE TABLE IF NOT EXISTS records (
          seq         INTEGER PRIMARY KEY AUTOINCREMENT,
          id          TEXT NOT NULL,
          rev         INTEGER NOT NULL DEFAULT 1,
          hash        TEXT NOT NULL,
          body        TEXT,
          deleted     INTEGER NOT NULL DEFAULT 0,
          tm          INTEGER NOT NULL,
          expire_tm   INTEGER NOT NULL DEFAULT 0,
          context_id  TEXT NOT NULL,
          label       TEXT NOT NULL,
          href        TEXT NOT NULL,
          rel         TEXT,
          authority   TEXT,
          is_weblink  INTEGER NOT NULL DEFAULT 0,
          rev_head    INTEGER NOT NULL DEFAULT 1,
          UNIQUE (id, rev)
        );
        CREATE INDEX IF NOT EXISTS records_by_id ON records (id);
        CREATE INDEX IF NOT EXISTS records_by_id_head ON records (id, rev_head);
        CREATE INDEX IF NOT EXISTS records_by_context ON records (context_id);
        CREATE INDEX IF NOT EXISTS records_by_href ON records (href, deleted, authority);
        CREATE TABLE IF NOT EXISTS store_meta (
          parent          TEXT NOT NULL,
          parent_is_docs  INTEGER NOT NULL DEFAULT 1,
          creation_tm     INTEGER NOT NULL DEFAULT 0,
          compact_id      INTEGER NOT NULL DEFAULT 0,
          check_id        INTEGER NOT NULL DEFAULT 0,
          total_webl_live INTEGER NOT NULL DEFAULT 0,
          total_webl_gone INTEGER NOT NULL DEFAULT 0,
          total_rel_live  INTEGER NOT NULL DEFAULT 0,
          total_rel_gone  INTEGER NOT NULL DEFAULT 0
        );",
    upgrades: [
        "ALTER TABLE records ADD COLUMN authority TEXT;
         DROP INDEX IF EXISTS records_by_href_label;
         CREATE INDEX IF NOT EXISTS records_by_href ON records (href, deleted, authority);",
        "ALTER TABLE records ADD COLUMN expire_tm INTEGER NOT NULL DEFAULT 0;",
        "ALTER TABLE store_meta ADD COLUMN creation_tm INTEGER NOT NULL DEFAULT 0;",
        "CREATE INDEX IF NOT EXISTS records_by_id_head ON records (id, rev_head);",
    ],
};

/// A link is a web link when its href is an absolute URI (it leaves the
/// store), otherwise a relationship to another local record.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum LinkKind {
    WebLink,
    Relationship,
}

pub(crate) fn classify_href(href: &str) -> LinkKind {
    // Any absolute URI (scheme and all) is a web link; only hrefs with no
    // scheme name local records.
    if Url::parse(href).is_ok() {
        LinkKind::WebLink
    } else {
        LinkKind::Relationship
    }
}

/// The head revision view of a link.
#[derive(Clone, Debug, PartialEq)]
pub struct LinkRecord {
    pub id: String,
    pub rev: i64,
    pub hash: String,
    pub seq: u64,
    pub deleted: bool,
    pub created_us: i64,
    pub expire_us: Option<i64>,
    pub context_id: String,
    pub label: String,
    pub href: String,
    pub rel: Option<String>,
    pub authority: Option<String>,
    pub is_weblink: bool,
    pub body: Value,
}

impl LinkRecord {
    pub fn mvcc(&self) -> String {
        Mvcc::new(self.rev, self.hash.clone()).to_string()
    }

    pub fn kind(&self) -> LinkKind {
        if self.is_weblink {
            LinkKind::WebLink
        } else {
            LinkKind::Relationship
        }
    }

    /// The document handed to map functions: the body plus the link's
    /// synthetic fields.
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
        fields.insert("_context_id".into(), Value::from(self.context_id.clone()));
        fields.insert("_href".into(), Value::from(self.href.clone()));
        fields.insert("_label".into(), Value::from(self.label.clone()));
        fields.insert("_is_weblink".into(), Value::from(self.is_weblink));
        if let Some(rel) = &self.rel {
            fields.insert("_rel".into(), Value::from(rel.clone()));
        }
        Value::Object(fields)
    }

    fn change_fields(&self) -> LinkChange {
        LinkChange {
            context_id: self.context_id.clone(),
            label: self.label.clone(),
            href: self.href.clone(),
            rel: self.rel.clone(),
            authority: self.authority.clone(),
            is_weblink: self.is_weblink,
        }
    }
}

/// Parameters for link creation. `context_id`, `label` and `href` are
/// required; everything else is optional.
#[derive(Clone, Debug)]
pub struct NewLink {
    pub context_id: String,
    pub label: String,
    pub href: String,
    pub rel: Option<String>,
    pub authority: Option<String>,
    pub expire_us: Option<i64>,
    pub body: Value,
    pub id: Option<String>,
}

impl NewLink {
    pub fn new(
        context_id: impl Into<String>,
        label: impl Into<String>,
        href: impl Into<String>,
    ) -> NewLink {
        NewLink {
            context_id: context_id.into(),
            label: label.into(),
            href: href.into(),
            rel: None,
            authority: None,
            expire_us: None,
            body: json!({}),
            id: None,
        }
    }
}

/// Field changes applied by a link update; `None` keeps the current
/// value, the nested options clear optional fields. The context id is
/// fixed at creation.
#[derive(Clone, Debug, Default)]
pub struct LinkPatch {
    pub label: Option<String>,
    pub href: Option<String>,
    pub rel: Option<Option<String>>,
    pub authority: Option<Option<String>>,
    pub expire_us: Option<Option<i64>>,
    pub body: Option<Value>,
}

/// Authority filter predicates for listings.
#[derive(Clone, Debug)]
pub enum AuthorityFilter {
    Equals(String),
    Contains(String),
    StartsWith(String),
    Present,
}

/// Listing query over link heads.
#[derive(Clone, Debug, Default)]
pub struct LinkQuery {
    pub since: u64,
    pub to: Option<u64>,
    pub limit: Option<usize>,
    pub offset: usize,
    pub descending: bool,
    pub count_type: CountType,
    pub context_id: Option<String>,
    pub label: Option<String>,
    pub kind: Option<LinkKind>,
    pub authority: Option<AuthorityFilter>,
}

/// A typed-edge collection whose records point at documents of a parent
/// collection through `context_id`.
pub struct LinkStore {
    pub(crate) handle: Handle,
    pub(crate) registry: Weak<RegistryInner>,
    parent: String,
    parent_is_docs: bool,
    pub(crate) views: RwLock<Vec<String>>,
    pub(crate) compact: crate::compact::RunFlag,
    pub(crate) checker: crate::compact::RunFlag,
}

enum CreateOutcome {
    Fresh { seq: u64, tm: i64 },
    Idempotent,
}

impl LinkStore {
    pub(crate) fn open_at(
        name: String,
        path: PathBuf,
        config: Config,
        registry: Weak<RegistryInner>,
        parent: Option<(String, bool)>,
    ) -> Result<Arc<LinkStore>> {
        let create = parent.is_some();
        let conn = sql::open_file(&path, create, &config, &SCHEMA)?;
        if let Some((parent, parent_is_docs)) = &parent {
            conn.execute(
                "INSERT INTO store_meta (parent, parent_is_docs, creation_tm)
                 SELECT ?1, ?2, ?3 WHERE NOT EXISTS (SELECT 1 FROM store_meta)",
                params![parent, parent_is_docs, now_us()],
            )?;
        }
        let (parent, parent_is_docs) = conn
            .query_row(
                "SELECT parent, parent_is_docs FROM store_meta",
                [],
                |row| Ok((row.get::<_, String>(0)?, row.get::<_, bool>(1)?)),
            )
            .optional()?
            .ok_or_else(|| {
                Error::CorruptMetadata(format!("link store '{name}' has no metadata row"))
            })?;

        Ok(Arc::new(LinkStore {
            handle: Handle::new(name, path, conn, config),
            registry,
            parent,
            parent_is_docs,
            views: RwLock::new(Vec::new()),
            compact: crate::compact::RunFlag::default(),
            checker: crate::compact::RunFlag::default(),
        }))
    }

    pub fn name(&self) -> &str {
        &self.handle.name
    }

    /// Parent collection name and whether it is a document store.
    pub fn parent(&self) -> (&str, bool) {
        (&self.parent, self.parent_is_docs)
    }

    pub fn slots(&self) -> Slots {
        self.handle.slots()
    }

    pub fn clear_slots(&self) {
        self.handle.clear_slots()
    }

    /// Create a link. Binding of a relationship's href to a local record
    /// is not enforced here; the checker retires dangling links later.
    pub fn create(&self, new: NewLink) -> Result<(String, String)> {
        ids::validate_record_id(&new.context_id)?;
        if new.label.is_empty() {
            return Err(Error::InvalidJson("link label is required".into()));
        }
        if new.href.is_empty() {
            return Err(Error::InvalidJson("link href is required".into()));
        }
        let body = sanitize_body(new.body)?;
        let id = match &new.id {
            Some(id) => {
                ids::validate_record_id(id)?;
                id.clone()
            }
            None => self.generate_id()?,
        };
        let weblink = classify_href(&new.href) == LinkKind::WebLink;
        let hash = link_hash(
            &new.context_id,
            &new.label,
            &new.href,
            new.rel.as_deref(),
            new.authority.as_deref(),
            &body,
        );
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
                            "INSERT INTO records
                               (id, rev, hash, body, deleted, tm, expire_tm,
                                context_id, label, href, rel, authority, is_weblink, rev_head)
                             VALUES (?1, 1, ?2, ?3, 0, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, 1)",
                            params![
                                id,
                                hash,
                                body_text,
                                tm,
                                new.expire_us.unwrap_or(0),
                                new.context_id,
                                new.label,
                                new.href,
                                new.rel,
                                new.authority,
                                weblink,
                            ],
                        )?;
                        bump_counters(conn, weblink, 1, 0)?;
                        Ok(CreateOutcome::Fresh {
                            seq: conn.last_insert_rowid() as u64,
                            tm,
                        })
                    }
                }
            })?
        };

        let token = Mvcc::new(1, hash).to_string();
        if let CreateOutcome::Fresh { seq: _, tm: _ } = outcome {
            let record = self.read(&id)?;
            self.publish(&record);
            self.fan_out_touch();
        }
        Ok((id, token))
    }

    pub fn read(&self, id: &str) -> Result<LinkRecord> {
        let conn = self.handle.conn.lock();
        read_head(&conn, id)?.ok_or_else(|| Error::NotFound(id.to_owned()))
    }

    pub fn read_rev(&self, id: &str, rev: i64) -> Result<LinkRecord> {
        let conn = self.handle.conn.lock();
        conn.query_row(
            &format!("{SELECT_RECORD} WHERE id = ?1 AND rev = ?2"),
            params![id, rev],
            row_to_record,
        )
        .optional()?
        .ok_or_else(|| Error::NotFound(format!("{id}@{rev}")))
    }

    /// Apply a patch as a new revision. Exactly one revision per id stays
    /// flagged as the head.
    pub fn update(&self, id: &str, mvcc: &str, patch: LinkPatch) -> Result<(String, String)> {
        let token = Mvcc::parse(mvcc)?;

        let record = {
            let conn = self.handle.conn.lock();
            self.in_txn(&conn, |conn| {
                let current =
                    read_head(conn, id)?.ok_or_else(|| Error::NotFound(id.to_owned()))?;
                if current.rev != token.rev || current.hash != token.hash {
                    return Err(Error::Conflict(id.to_owned()));
                }

                let label = patch.label.clone().unwrap_or(current.label.clone());
                let href = patch.href.clone().unwrap_or(current.href.clone());
                let rel = patch.rel.clone().unwrap_or(current.rel.clone());
                let authority = patch
                    .authority
                    .clone()
                    .unwrap_or(current.authority.clone());
                let expire_us = patch.expire_us.unwrap_or(current.expire_us);
                let body = match patch.body.clone() {
                    Some(body) => sanitize_body(body)?,
                    None => current.body.clone(),
                };
                if label.is_empty() {
                    return Err(Error::InvalidJson("link label is required".into()));
                }
                if href.is_empty() {
                    return Err(Error::InvalidJson("link href is required".into()));
                }

                let weblink = classify_href(&href) == LinkKind::WebLink;
                let hash = link_hash(
                    &current.context_id,
                    &label,
                    &href,
                    rel.as_deref(),
                    authority.as_deref(),
                    &body,
                );
                let tm = now_us();
                conn.execute(
                    "INSERT INTO records
                       (id, rev, hash, body, deleted, tm, expire_tm,
                        context_id, label, href, rel, authority, is_weblink, rev_head)
                     VALUES (?1, ?2, ?3, ?4, 0, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, 1)",
                    params![
                        id,
                        current.rev + 1,
                        hash,
                        serde_json::to_string(&body)?,
                        tm,
                        expire_us.unwrap_or(0),
                        current.context_id,
                        label,
                        href,
                        rel,
                        authority,
                        weblink,
                    ],
                )?;
                let seq = conn.last_insert_rowid() as u64;
                conn.execute(
                    "UPDATE records SET rev_head = 0 WHERE id = ?1 AND rev <= ?2",
                    params![id, current.rev],
                )?;
                if weblink != current.is_weblink {
                    bump_counters(conn, current.is_weblink, -1, 0)?;
                    bump_counters(conn, weblink, 1, 0)?;
                }
                Ok(LinkRecord {
                    id: id.to_owned(),
                    rev: current.rev + 1,
                    hash,
                    seq,
                    deleted: false,
                    created_us: tm,
                    expire_us,
                    context_id: current.context_id,
                    label,
                    href,
                    rel,
                    authority,
                    is_weblink: weblink,
                    body,
                })
            })?
        };

        self.publish(&record);
        self.fan_out_replaced(id);
        Ok((id.to_owned(), record.mvcc()))
    }

    /// Tombstone a link under MVCC control.
    pub fn delete(&self, id: &str, mvcc: &str) -> Result<String> {
        let token = Mvcc::parse(mvcc)?;
        let record = {
            let conn = self.handle.conn.lock();
            self.in_txn(&conn, |conn| {
                let current =
                    read_head(conn, id)?.ok_or_else(|| Error::NotFound(id.to_owned()))?;
                if current.deleted {
                    return Err(Error::NotFound(id.to_owned()));
                }
                if current.rev != token.rev || current.hash != token.hash {
                    return Err(Error::Conflict(id.to_owned()));
                }
                tombstone_in_txn(conn, &current)
            })?
        };
        self.publish(&record);
        self.fan_out_deleted(id);
        Ok(record.mvcc())
    }

    /// Tombstone every live link owned by |context_id|: the cascade a
    /// parent document delete triggers. Returns how many were retired.
    pub(crate) fn tombstone_context(&self, context_id: &str) -> Result<usize> {
        let ids: Vec<String> = {
            let conn = self.handle.conn.lock();
            let mut stmt = conn.prepare(
                "SELECT id FROM records WHERE context_id = ?1 AND rev_head = 1 AND deleted = 0",
            )?;
            let rows = stmt.query_map(params![context_id], |row| row.get(0))?;
            rows.collect::<rusqlite::Result<_>>()?
        };
        for id in &ids {
            self.tombstone_head(id)?;
        }
        Ok(ids.len())
    }

    /// Tombstone a link regardless of its token; the checker's retirement
    /// path. No-op when the head is already gone.
    pub(crate) fn tombstone_head(&self, id: &str) -> Result<bool> {
        let record = {
            let conn = self.handle.conn.lock();
            self.in_txn(&conn, |conn| match read_head(conn, id)? {
                Some(current) if !current.deleted => tombstone_in_txn(conn, &current).map(Some),
                _ => Ok(None),
            })?
        };
        match record {
            Some(record) => {
                self.publish(&record);
                self.fan_out_deleted(id);
                Ok(true)
            }
            None => Ok(false),
        }
    }

    /// Counter-backed totals; never a table scan.
    pub fn count(&self, kind: Option<LinkKind>, count_type: CountType) -> Result<u64> {
        let conn = self.handle.conn.lock();
        let (webl_live, webl_gone, rel_live, rel_gone) = conn.query_row(
            "SELECT total_webl_live, total_webl_gone, total_rel_live, total_rel_gone
             FROM store_meta",
            [],
            |row| {
                Ok((
                    row.get::<_, i64>(0)?,
                    row.get::<_, i64>(1)?,
                    row.get::<_, i64>(2)?,
                    row.get::<_, i64>(3)?,
                ))
            },
        )?;
        let (live, gone) = match kind {
            Some(LinkKind::WebLink) => (webl_live, webl_gone),
            Some(LinkKind::Relationship) => (rel_live, rel_gone),
            None => (webl_live + rel_live, webl_gone + rel_gone),
        };
        let total = match count_type {
            CountType::Live => live,
            CountType::Deleted => gone,
            CountType::All => live + gone,
        };
        Ok(total.max(0) as u64)
    }

    /// Filtered listing over head revisions.
    pub fn list(&self, query: &LinkQuery) -> Result<Vec<LinkRecord>> {
        let conn = self.handle.conn.lock();
        let mut sql = format!("{SELECT_RECORD} WHERE rev_head = 1 AND seq > ?1");
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
        if let Some(context_id) = &query.context_id {
            args.push(Box::new(context_id.clone()));
            sql.push_str(&format!(" AND context_id = ?{}", args.len()));
        }
        if let Some(label) = &query.label {
            args.push(Box::new(label.clone()));
            sql.push_str(&format!(" AND label = ?{}", args.len()));
        }
        if let Some(kind) = query.kind {
            sql.push_str(match kind {
                LinkKind::WebLink => " AND is_weblink = 1",
                LinkKind::Relationship => " AND is_weblink = 0",
            });
        }
        match &query.authority {
            None => {}
            Some(AuthorityFilter::Present) => {
                sql.push_str(" AND authority IS NOT NULL AND authority != ''");
            }
            Some(AuthorityFilter::Equals(value)) => {
                args.push(Box::new(value.clone()));
                sql.push_str(&format!(" AND authority = ?{}", args.len()));
            }
            Some(AuthorityFilter::Contains(value)) => {
                args.push(Box::new(value.clone()));
                sql.push_str(&format!(" AND instr(authority, ?{}) > 0", args.len()));
            }
            Some(AuthorityFilter::StartsWith(value)) => {
                args.push(Box::new(value.clone()));
                let n = args.len();
                sql.push_str(&format!(
                    " AND substr(authority, 1, length(?{n})) = ?{n}"
                ));
            }
        }
        sql.push_str(" ORDER BY seq");
        if query.descending {
            sql.push_str(" DESC");
        }
        if let Some(limit) = query.limit {
            sql.push_str(&format!(" LIMIT {limit}"));
            if query.offset > 0 {
                sql.push_str(&format!(" OFFSET {}", query.offset));
            }
        } else if query.offset > 0 {
            sql.push_str(&format!(" LIMIT -1 OFFSET {}", query.offset));
        }

        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt.query_map(rusqlite::params_from_iter(args.iter().map(|a| a.as_ref())), row_to_record)?;
        Ok(rows.collect::<rusqlite::Result<_>>()?)
    }

    pub fn changes(&self, query: &ChangesQuery) -> Result<ChangesPage> {
        let conn = self.handle.conn.lock();
        let mut sql = format!("{SELECT_RECORD} WHERE seq > ?1");
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
        if let Some(context_id) = &query.context_id {
            args.push(Box::new(context_id.clone()));
            sql.push_str(&format!(" AND context_id = ?{}", args.len()));
        }
        if let Some(label) = &query.label {
            args.push(Box::new(label.clone()));
            sql.push_str(&format!(" AND label = ?{}", args.len()));
        }
        sql.push_str(" ORDER BY seq");
        if query.descending {
            sql.push_str(" DESC");
        }
        if let Some(limit) = query.limit {
            sql.push_str(&format!(" LIMIT {limit}"));
            if query.offset > 0 {
                sql.push_str(&format!(" OFFSET {}", query.offset));
            }
        }

        let mut stmt = conn.prepare(&sql)?;
        let items = stmt
            .query_map(rusqlite::params_from_iter(args.iter().map(|a| a.as_ref())), |row| {
                row_to_record(row).map(|r| to_change_item(&r))
            })?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        let last_seq = items.iter().map(|i| i.seq).max().unwrap_or(query.since);
        Ok(ChangesPage { items, last_seq })
    }

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
        if let Some(context_id) = &query.context_id {
            args.push(Box::new(context_id.clone()));
            sql.push_str(&format!(" AND context_id = ?{}", args.len()));
        }
        if let Some(label) = &query.label {
            args.push(Box::new(label.clone()));
            sql.push_str(&format!(" AND label = ?{}", args.len()));
        }
        Ok(conn.query_row(
            &sql,
            rusqlite::params_from_iter(args.iter().map(|a| a.as_ref())),
            |row| row.get::<_, i64>(0),
        )? as u64)
    }

    pub fn max_seq(&self) -> Result<u64> {
        let conn = self.handle.conn.lock();
        let max: Option<i64> =
            conn.query_row("SELECT max(seq) FROM records", [], |row| row.get(0))?;
        Ok(max.unwrap_or(0) as u64)
    }

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

    pub fn subscribe(
        &self,
        handler: impl Fn(&ChangeItem) + Send + Sync + 'static,
    ) -> crate::changes::SubscriptionId {
        self.handle.notifier.subscribe(std::sync::Arc::new(handler))
    }

    pub fn unsubscribe(&self, id: crate::changes::SubscriptionId) {
        self.handle.notifier.unsubscribe(id);
    }

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

    fn publish(&self, record: &LinkRecord) {
        self.handle.notifier.publish(&to_change_item(record));
    }

    fn fan_out_touch(&self) {
        let Some(reg) = self.registry.upgrade() else {
            return;
        };
        for name in self.views.read().clone() {
            if let Some(view) = reg.view_named(&name) {
                view.touch();
            }
        }
    }

    fn fan_out_replaced(&self, id: &str) {
        self.fan_out_drop_rows(id);
    }

    fn fan_out_deleted(&self, id: &str) {
        self.fan_out_drop_rows(id);
    }

    fn fan_out_drop_rows(&self, id: &str) {
        let Some(reg) = self.registry.upgrade() else {
            return;
        };
        for name in self.views.read().clone() {
            if let Some(view) = reg.view_named(&name) {
                if let Err(err) = view.propagate_delete(id) {
                    warn!(view = %name, %err, "deletion propagation failed");
                    view.record_error(format!("propagating '{id}': {err}"));
                }
                view.touch();
            }
        }
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

    /// Live heads past |since| in sequence order: the map pass's input.
    pub(crate) fn map_source_batch(&self, since: u64, limit: usize) -> Result<Vec<LinkRecord>> {
        let conn = self.handle.conn.lock();
        let mut stmt = conn.prepare(&format!(
            "{SELECT_RECORD} WHERE rev_head = 1 AND deleted = 0 AND seq > ?1
             ORDER BY seq LIMIT ?2"
        ))?;
        let rows = stmt.query_map(params![since as i64, limit as i64], row_to_record)?;
        Ok(rows.collect::<rusqlite::Result<_>>()?)
    }

    pub(crate) fn is_live(&self, id: &str) -> Result<bool> {
        let conn = self.handle.conn.lock();
        Ok(matches!(head(&conn, id)?, Some(h) if !h.deleted))
    }

    pub(crate) fn record_error(&self, message: String) {
        self.handle.set_error(message);
    }
}

const SELECT_RECORD: &str = "SELECT seq, id, rev, hash, body, deleted, tm, expire_tm,
        context_id, label, href, rel, authority, is_weblink FROM records";

struct HeadRow {
    rev: i64,
    hash: String,
    deleted: bool,
}

fn head(conn: &Connection, id: &str) -> Result<Option<HeadRow>> {
    Ok(conn
        .query_row(
            "SELECT rev, hash, deleted FROM records
             WHERE id = ?1 ORDER BY rev DESC LIMIT 1",
            params![id],
            |row| {
                Ok(HeadRow {
                    rev: row.get(0)?,
                    hash: row.get(1)?,
                    deleted: row.get(2)?,
                })
            },
        )
        .optional()?)
}

fn read_head(conn: &Connection, id: &str) -> Result<Option<LinkRecord>> {
    Ok(conn
        .query_row(
            &format!("{SELECT_RECORD} WHERE id = ?1 ORDER BY rev DESC LIMIT 1"),
            params![id],
            row_to_record,
        )
        .optional()?)
}

fn row_to_record(row: &rusqlite::Row<'_>) -> rusqlite::Result<LinkRecord> {
    let body: Option<String> = row.get(4)?;
    let body = body
        .as_deref()
        .and_then(|text| serde_json::from_str(text).ok())
        .unwrap_or(Value::Null);
    let expire_tm: i64 = row.get(7)?;
    Ok(LinkRecord {
        seq: row.get::<_, i64>(0)? as u64,
        id: row.get(1)?,
        rev: row.get(2)?,
        hash: row.get(3)?,
        body,
        deleted: row.get(5)?,
        created_us: row.get(6)?,
        expire_us: (expire_tm != 0).then_some(expire_tm),
        context_id: row.get(8)?,
        label: row.get(9)?,
        href: row.get(10)?,
        rel: row.get(11)?,
        authority: row.get(12)?,
        is_weblink: row.get(13)?,
    })
}

fn to_change_item(record: &LinkRecord) -> ChangeItem {
    ChangeItem {
        seq: record.seq,
        id: record.id.clone(),
        deleted: record.deleted,
        created_us: record.created_us,
        expire_us: record.expire_us,
        rev: record.mvcc(),
        link: Some(record.change_fields()),
    }
}

/// Write the tombstone revision for |current| and maintain head flags and
/// counters. Runs inside the caller's transaction.
fn tombstone_in_txn(conn: &Connection, current: &LinkRecord) -> Result<LinkRecord> {
    let body = Value::Object(Map::new());
    let hash = content_hash(&body);
    let tm = now_us();
    conn.execute(
        "INSERT INTO records
           (id, rev, hash, body, deleted, tm, expire_tm,
            context_id, label, href, rel, authority, is_weblink, rev_head)
         VALUES (?1, ?2, ?3, '{}', 1, ?4, 0, ?5, ?6, ?7, ?8, ?9, ?10, 1)",
        params![
            current.id,
            current.rev + 1,
            hash,
            tm,
            current.context_id,
            current.label,
            current.href,
            current.rel,
            current.authority,
            current.is_weblink,
        ],
    )?;
    let seq = conn.last_insert_rowid() as u64;
    conn.execute(
        "UPDATE records SET rev_head = 0 WHERE id = ?1 AND rev <= ?2",
        params![current.id, current.rev],
    )?;
    bump_counters(conn, current.is_weblink, -1, 1)?;
    Ok(LinkRecord {
        rev: current.rev + 1,
        hash,
        seq,
        deleted: true,
        created_us: tm,
        expire_us: None,
        body,
        ..current.clone()
    })
}

fn bump_counters(conn: &Connection, weblink: bool, live: i64, gone: i64) -> Result<()> {
    let (live_col, gone_col) = if weblink {
        ("total_webl_live", "total_webl_gone")
    } else {
        ("total_rel_live", "total_rel_gone")
    };
    conn.execute(
        &format!(
            "UPDATE store_meta SET {live_col} = {live_col} + ?1, {gone_col} = {gone_col} + ?2"
        ),
        params![live, gone],
    )?;
    Ok(())
}

fn link_hash(
    context_id: &str,
    label: &str,
    href: &str,
    rel: Option<&str>,
    authority: Option<&str>,
    body: &Value,
) -> String {
    content_hash(&json!({
        "authority": authority,
        "body": body,
        "context_id": context_id,
        "href": href,
        "label": label,
        "rel": rel,
    }))
}
