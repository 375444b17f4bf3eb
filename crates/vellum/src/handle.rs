use crate::changes::Notifier;
use crate::Config;
use parking_lot::{Mutex, RwLock};
use rusqlite::Connection;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use tracing::{info, warn};

/// Error/warning slots surfaced to consumers. Background derivation never
/// fails a foreground mutation; its failures land here instead.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct Slots {
    pub error: Option<String>,
    pub warning: Option<String>,
}

/// Plumbing common to every collection: the backing connection, soft
/// flags, diagnostics slots, and the write notifier. The owning registry
/// map entry holds the Arc; every in-flight operation and background run
/// borrows a clone, so the last drop is the "no borrower left" point at
/// which a soft-deleted file is unlinked.
pub(crate) struct Handle {
    pub name: String,
    pub path: PathBuf,
    pub conn: Mutex<Connection>,
    pub config: Config,
    pub notifier: Notifier,
    slots: RwLock<Slots>,
    to_delete: AtomicBool,
    to_quit: AtomicBool,
    in_bulk: AtomicBool,
}

impl Handle {
    pub fn new(name: String, path: PathBuf, conn: Connection, config: Config) -> Handle {
        Handle {
            name,
            path,
            conn: Mutex::new(conn),
            config,
            notifier: Notifier::default(),
            slots: RwLock::new(Slots::default()),
            to_delete: AtomicBool::new(false),
            to_quit: AtomicBool::new(false),
            in_bulk: AtomicBool::new(false),
        }
    }

    /// Caller-scoped transaction flag: while set, write paths skip their
    /// own BEGIN/COMMIT and join the open transaction.
    pub fn set_bulk(&self, on: bool) {
        self.in_bulk.store(on, Ordering::SeqCst);
    }

    pub fn in_bulk(&self) -> bool {
        self.in_bulk.load(Ordering::SeqCst)
    }

    pub fn slots(&self) -> Slots {
        self.slots.read().clone()
    }

    pub fn set_error(&self, message: impl Into<String>) {
        let message = message.into();
        warn!(collection = %self.name, %message, "recording collection error");
        self.slots.write().error = Some(message);
    }

    pub fn set_warning(&self, message: impl Into<String>) {
        self.slots.write().warning = Some(message.into());
    }

    pub fn clear_slots(&self) {
        *self.slots.write() = Slots::default();
    }

    pub fn mark_for_deletion(&self) {
        self.to_delete.store(true, Ordering::SeqCst);
        self.to_quit.store(true, Ordering::SeqCst);
        self.notifier.wake_all();
    }

    pub fn is_marked_for_deletion(&self) -> bool {
        self.to_delete.load(Ordering::SeqCst)
    }

    pub fn request_quit(&self) {
        self.to_quit.store(true, Ordering::SeqCst);
        self.notifier.wake_all();
    }

    pub fn should_quit(&self) -> bool {
        self.to_quit.load(Ordering::SeqCst)
    }

    pub fn quit_flag(&self) -> &AtomicBool {
        &self.to_quit
    }
}

impl Drop for Handle {
    fn drop(&mut self) {
        if self.is_marked_for_deletion() {
            info!(collection = %self.name, file = %self.path.display(), "unlinking deleted collection");
            if let Err(err) = std::fs::remove_file(&self.path) {
                warn!(collection = %self.name, %err, "failed to unlink collection file");
            }
            // WAL side files go with the main file.
            for suffix in ["-wal", "-shm"] {
                let mut side = self.path.as_os_str().to_owned();
                side.push(suffix);
                let _ = std::fs::remove_file(PathBuf::from(side));
            }
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::sql::{self, SchemaDef};
    use tempfile::TempDir;

    const SCHEMA: SchemaDef = SchemaDef {
        create: "CREATE TABLE t (x);",
        upgrades: ["", "", "", ""],
    };

    fn fixture(dir: &TempDir) -> Handle {
        let path = dir.path().join("h.docs");
        let conn = sql::open_file(&path, true, &Config::default(), &SCHEMA).unwrap();
        Handle::new("h".into(), path, conn, Config::default())
    }

    #[test]
    fn slots_round_trip() {
        let dir = TempDir::new().unwrap();
        let handle = fixture(&dir);
        assert_eq!(handle.slots(), Slots::default());
        handle.set_error("boom");
        handle.set_warning("odd");
        let slots = handle.slots();
        assert_eq!(slots.error.as_deref(), Some("boom"));
        assert_eq!(slots.warning.as_deref(), Some("odd"));
        handle.clear_slots();
        assert_eq!(handle.slots(), Slots::default());
    }

    #[test]
    fn drop_unlinks_only_when_marked() {
        let dir = TempDir::new().unwrap();
        let path = {
            let handle = fixture(&dir);
            handle.path.clone()
        };
        assert!(path.exists(), "unmarked handle keeps its file");

        let handle = Handle::new(
            "h".into(),
            path.clone(),
            sql::open_file(&path, false, &Config::default(), &SCHEMA).unwrap(),
            Config::default(),
        );
        handle.mark_for_deletion();
        assert!(handle.should_quit());
        drop(handle);
        assert!(!path.exists(), "marked handle unlinks on last drop");
    }
}
