use crate::{Config, Error, Result};
use rusqlite::{Connection, ErrorCode, OpenFlags};
use std::path::Path;
use tracing::{debug, warn};

/// Highest schema version the engine writes. A file reporting a greater
/// `user_version` was produced by a newer engine and is refused.
pub(crate) const LATEST_VERSION: i32 = 5;

/// Per-collection schema: the batch creating a fresh file at
/// [`LATEST_VERSION`], and one upgrade batch per historical version.
/// `upgrades[n]` carries version `n + 1` to `n + 2`.
pub(crate) struct SchemaDef {
    pub create: &'static str,
    pub upgrades: [&'static str; (LATEST_VERSION - 1) as usize],
}

/// Open (or create) a collection file: flags, collation and scalar
/// function install, PRAGMAs, then the migration ladder. The collation
/// must be installed before any statement that references it, including
/// index creation inside migrations.
pub(crate) fn open_file(
    path: &Path,
    create: bool,
    config: &Config,
    schema: &SchemaDef,
) -> Result<Connection> {
    let mut flags = OpenFlags::SQLITE_OPEN_READ_WRITE | OpenFlags::SQLITE_OPEN_NO_MUTEX;
    if create {
        flags |= OpenFlags::SQLITE_OPEN_CREATE;
    }
    let conn = Connection::open_with_flags(path, flags)?;

    collation::install(&conn)?;

    conn.busy_timeout(config.busy_backoff())?;
    conn.execute_batch("PRAGMA encoding = 'UTF-8';")?;
    conn.query_row("PRAGMA journal_mode=WAL", [], |_| Ok(()))?;
    conn.pragma_update(None, "synchronous", config.synchronous.as_pragma())?;
    conn.pragma_update(None, "cache_size", -(config.cache_kib as i64))?;

    migrate(&conn, path, schema)?;
    Ok(conn)
}

fn migrate(conn: &Connection, path: &Path, schema: &SchemaDef) -> Result<()> {
    let version: i32 = conn.query_row("PRAGMA user_version", [], |row| row.get(0))?;

    if version == 0 {
        conn.execute_batch("BEGIN;")?;
        if let Err(err) = conn.execute_batch(schema.create) {
            let _ = conn.execute_batch("ROLLBACK;");
            return Err(err.into());
        }
        conn.execute_batch("COMMIT;")?;
        conn.pragma_update(None, "user_version", LATEST_VERSION)?;
        return Ok(());
    }
    if version > LATEST_VERSION {
        return Err(Error::CorruptMetadata(format!(
            "{} reports schema version {version}, newer than supported {LATEST_VERSION}",
            path.display()
        )));
    }
    for step in version..LATEST_VERSION {
        debug!(file = %path.display(), from = step, to = step + 1, "upgrading collection schema");
        conn.execute_batch("BEGIN;")?;
        if let Err(err) = conn.execute_batch(schema.upgrades[(step - 1) as usize]) {
            let _ = conn.execute_batch("ROLLBACK;");
            return Err(err.into());
        }
        conn.execute_batch("COMMIT;")?;
        conn.pragma_update(None, "user_version", step + 1)?;
    }
    Ok(())
}

pub(crate) fn is_busy(err: &rusqlite::Error) -> bool {
    matches!(
        err,
        rusqlite::Error::SqliteFailure(e, _)
            if e.code == ErrorCode::DatabaseBusy || e.code == ErrorCode::DatabaseLocked
    )
}

/// Run |op| with bounded retries on contention. Backoff grows linearly;
/// when attempts are exhausted the caller sees `Busy`, never a raw
/// SQLITE_BUSY.
pub(crate) fn busy_retry<T>(
    config: &Config,
    mut op: impl FnMut() -> rusqlite::Result<T>,
) -> Result<T> {
    let mut attempt = 0u32;
    loop {
        match op() {
            Ok(value) => return Ok(value),
            Err(err) if is_busy(&err) => {
                attempt += 1;
                if attempt >= config.busy_retries {
                    warn!(attempts = attempt, "statement contention exhausted retries");
                    return Err(Error::Busy(attempt));
                }
                std::thread::sleep(config.busy_backoff() * attempt);
            }
            Err(err) => return Err(err.into()),
        }
    }
}

/// Run |f| inside an immediate transaction. The begin and commit retry on
/// contention; any error rolls back before propagating.
pub(crate) fn with_txn<T>(
    config: &Config,
    conn: &Connection,
    f: impl FnOnce(&Connection) -> Result<T>,
) -> Result<T> {
    busy_retry(config, || conn.execute_batch("BEGIN IMMEDIATE;"))?;
    match f(conn) {
        Ok(value) => {
            busy_retry(config, || conn.execute_batch("COMMIT;"))?;
            Ok(value)
        }
        Err(err) => {
            let _ = conn.execute_batch("ROLLBACK;");
            Err(err)
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::Config;
    use tempfile::TempDir;

    const SCHEMA: SchemaDef = SchemaDef {
        create: "CREATE TABLE t (k TEXT COLLATE json_order, v TEXT);
                 CREATE INDEX t_k ON t (k);",
        upgrades: [
            "ALTER TABLE t ADD COLUMN v TEXT;",
            "CREATE INDEX IF NOT EXISTS t_k ON t (k);",
            "ANALYZE;",
            "ANALYZE;",
        ],
    };

    #[test]
    fn fresh_file_lands_on_latest_version() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("a.docs");
        let conn = open_file(&path, true, &Config::default(), &SCHEMA).unwrap();
        let version: i32 = conn
            .query_row("PRAGMA user_version", [], |r| r.get(0))
            .unwrap();
        assert_eq!(version, LATEST_VERSION);
    }

    #[test]
    fn reopen_is_a_no_op() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("a.docs");
        drop(open_file(&path, true, &Config::default(), &SCHEMA).unwrap());
        drop(open_file(&path, false, &Config::default(), &SCHEMA).unwrap());
    }

    #[test]
    fn old_versions_walk_the_ladder() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("a.docs");
        {
            let conn = rusqlite::Connection::open(&path).unwrap();
            conn.execute_batch("CREATE TABLE t (k TEXT);").unwrap();
            conn.pragma_update(None, "user_version", 1).unwrap();
        }
        let conn = open_file(&path, false, &Config::default(), &SCHEMA).unwrap();
        let version: i32 = conn
            .query_row("PRAGMA user_version", [], |r| r.get(0))
            .unwrap();
        assert_eq!(version, LATEST_VERSION);
        // The v1->v2 step added the column.
        conn.execute("INSERT INTO t (k, v) VALUES ('1', 'x')", [])
            .unwrap();
    }

    #[test]
    fn future_versions_are_refused() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("a.docs");
        {
            let conn = rusqlite::Connection::open(&path).unwrap();
            conn.pragma_update(None, "user_version", LATEST_VERSION + 1)
                .unwrap();
        }
        let err = open_file(&path, false, &Config::default(), &SCHEMA).unwrap_err();
        assert!(matches!(err, Error::CorruptMetadata(_)), "{err}");
    }

    #[test]
    fn busy_retry_surfaces_busy() {
        let cfg = Config {
            busy_retries: 3,
            busy_backoff_ms: 1,
            ..Config::default()
        };
        let err = busy_retry::<()>(&cfg, || {
            Err(rusqlite::Error::SqliteFailure(
                rusqlite::ffi::Error::new(rusqlite::ffi::SQLITE_BUSY),
                None,
            ))
        })
        .unwrap_err();
        assert!(matches!(err, Error::Busy(3)));
    }
}
