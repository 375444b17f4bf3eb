use crate::changes::now_us;
use crate::handle::{Handle, Slots};
use crate::registry::RegistryInner;
use crate::sql::{self, SchemaDef};
use crate::{ids, Config, Error, Result};
use rusqlite::{params, OptionalExtension};
use sha2::{Digest, Sha256};
use std::path::PathBuf;
use std::sync::{Arc, Weak};

pub(crate) const SCHEMA: SchemaDef = SchemaDef {
    create: "\
        CREATE TABLE IF NOT EXISTS blobs (
          id      TEXT NOT NULL,
          title   TEXT NOT NULL,
          mime    TEXT NOT NULL DEFAULT 'application/octet-stream',
          length  INTEGER NOT NULL DEFAULT 0,
          hash    TEXT,
          content BLOB NOT NULL DEFAULT x'',
          tm      INTEGER NOT NULL DEFAULT 0,
          PRIMARY KEY (id, title)
        );
        CREATE INDEX IF NOT EXISTS blobs_by_id ON blobs (id);
        CREATE TABLE IF NOT EXISTS store_meta (
          parent      TEXT NOT NULL,
          creation_tm INTEGER NOT NULL DEFAULT 0
        );",
    upgrades: [
        "CREATE INDEX IF NOT EXISTS blobs_by_id ON blobs (id);",
        "ALTER TABLE blobs ADD COLUMN tm INTEGER NOT NULL DEFAULT 0;",
        "ALTER TABLE store_meta ADD COLUMN creation_tm INTEGER NOT NULL DEFAULT 0;",
        "DROP INDEX IF EXISTS blobs_by_title;",
    ],
};

/// One stored blob, keyed `(doc_id, title)`. No revisions: writing over
/// an existing title replaces it.
#[derive(Clone, Debug, PartialEq)]
pub struct Attachment {
    pub doc_id: String,
    pub title: String,
    pub mime: String,
    pub length: u64,
    pub hash: String,
    pub content: Vec<u8>,
    pub created_us: i64,
}

/// Attachment metadata without the blob, for listings.
#[derive(Clone, Debug, PartialEq)]
pub struct AttachmentInfo {
    pub doc_id: String,
    pub title: String,
    pub mime: String,
    pub length: u64,
    pub hash: String,
}

/// Binary attachments belonging to documents of a parent collection.
pub struct AttachmentStore {
    pub(crate) handle: Handle,
    #[allow(dead_code)]
    pub(crate) registry: Weak<RegistryInner>,
    parent: String,
}

impl AttachmentStore {
    pub(crate) fn open_at(
        name: String,
        path: PathBuf,
        config: Config,
        registry: Weak<RegistryInner>,
        parent: Option<String>,
    ) -> Result<Arc<AttachmentStore>> {
        let create = parent.is_some();
        let conn = sql::open_file(&path, create, &config, &SCHEMA)?;
        if let Some(parent) = &parent {
            conn.execute(
                "INSERT INTO store_meta (parent, creation_tm)
                 SELECT ?1, ?2 WHERE NOT EXISTS (SELECT 1 FROM store_meta)",
                params![parent, now_us()],
            )?;
        }
        let parent: String = conn
            .query_row("SELECT parent FROM store_meta", [], |row| row.get(0))
            .optional()?
            .ok_or_else(|| {
                Error::CorruptMetadata(format!("attachment store '{name}' has no metadata row"))
            })?;

        Ok(Arc::new(AttachmentStore {
            handle: Handle::new(name, path, conn, config),
            registry,
            parent,
        }))
    }

    pub fn name(&self) -> &str {
        &self.handle.name
    }

    pub fn parent(&self) -> &str {
        &self.parent
    }

    pub fn slots(&self) -> Slots {
        self.handle.slots()
    }

    /// Store a blob, replacing any previous content under the same title.
    pub fn put(&self, doc_id: &str, title: &str, mime: &str, content: &[u8]) -> Result<()> {
        ids::validate_record_id(doc_id)?;
        if title.is_empty() {
            return Err(Error::InvalidId("attachment title is required".into()));
        }
        let hash = hex::encode(Sha256::digest(content));
        let conn = self.handle.conn.lock();
        sql::busy_retry(&self.handle.config, || {
            conn.execute(
                "INSERT OR REPLACE INTO blobs (id, title, mime, length, hash, content, tm)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
                params![doc_id, title, mime, content.len() as i64, hash, content, now_us()],
            )
        })?;
        Ok(())
    }

    pub fn get(&self, doc_id: &str, title: &str) -> Result<Attachment> {
        let conn = self.handle.conn.lock();
        conn.query_row(
            "SELECT id, title, mime, length, hash, content, tm FROM blobs
             WHERE id = ?1 AND title = ?2",
            params![doc_id, title],
            |row| {
                Ok(Attachment {
                    doc_id: row.get(0)?,
                    title: row.get(1)?,
                    mime: row.get(2)?,
                    length: row.get::<_, i64>(3)? as u64,
                    hash: row.get::<_, Option<String>>(4)?.unwrap_or_default(),
                    content: row.get(5)?,
                    created_us: row.get(6)?,
                })
            },
        )
        .optional()?
        .ok_or_else(|| Error::NotFound(format!("{doc_id}/{title}")))
    }

    pub fn delete(&self, doc_id: &str, title: &str) -> Result<()> {
        let conn = self.handle.conn.lock();
        let n = conn.execute(
            "DELETE FROM blobs WHERE id = ?1 AND title = ?2",
            params![doc_id, title],
        )?;
        if n == 0 {
            return Err(Error::NotFound(format!("{doc_id}/{title}")));
        }
        Ok(())
    }

    /// Attachment metadata for one document, ordered by title.
    pub fn list(&self, doc_id: &str) -> Result<Vec<AttachmentInfo>> {
        let conn = self.handle.conn.lock();
        let mut stmt = conn.prepare(
            "SELECT id, title, mime, length, hash FROM blobs
             WHERE id = ?1 ORDER BY title",
        )?;
        let rows = stmt.query_map(params![doc_id], |row| {
            Ok(AttachmentInfo {
                doc_id: row.get(0)?,
                title: row.get(1)?,
                mime: row.get(2)?,
                length: row.get::<_, i64>(3)? as u64,
                hash: row.get::<_, Option<String>>(4)?.unwrap_or_default(),
            })
        })?;
        Ok(rows.collect::<rusqlite::Result<_>>()?)
    }

    pub fn count(&self) -> Result<u64> {
        let conn = self.handle.conn.lock();
        Ok(conn.query_row("SELECT count(*) FROM blobs", [], |row| row.get::<_, i64>(0))? as u64)
    }

    /// Drop every attachment of a document; the cascade a parent delete
    /// triggers. Returns how many were removed.
    pub(crate) fn delete_all(&self, doc_id: &str) -> Result<usize> {
        let conn = self.handle.conn.lock();
        Ok(conn.execute("DELETE FROM blobs WHERE id = ?1", params![doc_id])?)
    }

    pub(crate) fn record_error(&self, message: String) {
        self.handle.set_error(message);
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use tempfile::TempDir;

    fn store(dir: &TempDir) -> Arc<AttachmentStore> {
        AttachmentStore::open_at(
            "files".into(),
            dir.path().join("files.blobs"),
            Config::default(),
            Weak::new(),
            Some("notes".into()),
        )
        .unwrap()
    }

    #[test]
    fn put_get_round_trip() {
        let dir = TempDir::new().unwrap();
        let store = store(&dir);
        store.put("d1", "cover.png", "image/png", b"PNG...").unwrap();

        let att = store.get("d1", "cover.png").unwrap();
        assert_eq!(att.mime, "image/png");
        assert_eq!(att.length, 6);
        assert_eq!(att.content, b"PNG...");
        assert_eq!(att.hash.len(), 64);
    }

    #[test]
    fn put_replaces() {
        let dir = TempDir::new().unwrap();
        let store = store(&dir);
        store.put("d1", "a.txt", "text/plain", b"one").unwrap();
        store.put("d1", "a.txt", "text/plain", b"two").unwrap();
        assert_eq!(store.get("d1", "a.txt").unwrap().content, b"two");
        assert_eq!(store.count().unwrap(), 1);
    }

    #[test]
    fn list_and_cascade_delete() {
        let dir = TempDir::new().unwrap();
        let store = store(&dir);
        store.put("d1", "b.txt", "text/plain", b"b").unwrap();
        store.put("d1", "a.txt", "text/plain", b"a").unwrap();
        store.put("d2", "c.txt", "text/plain", b"c").unwrap();

        let listed = store.list("d1").unwrap();
        assert_eq!(listed.len(), 2);
        assert_eq!(listed[0].title, "a.txt");

        assert_eq!(store.delete_all("d1").unwrap(), 2);
        assert!(store.get("d1", "a.txt").is_err());
        assert_eq!(store.count().unwrap(), 1);
    }

    #[test]
    fn delete_missing_is_not_found() {
        let dir = TempDir::new().unwrap();
        let store = store(&dir);
        assert!(matches!(
            store.delete("d1", "nope"),
            Err(Error::NotFound(_))
        ));
    }
}
