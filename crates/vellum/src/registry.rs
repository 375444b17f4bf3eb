use crate::attachments::AttachmentStore;
use crate::docs::{BulkDoc, BulkResult, DocStore};
use crate::links::LinkStore;
use crate::pool::Pool;
use crate::script::{NativeHost, ScriptHost};
use crate::views::{SourceKind, View, ViewParams};
use crate::{ids, Config, Error, Result};
use parking_lot::RwLock;
use serde_json::Value;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{info, warn};

/// The four collection kinds a registry manages.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Kind {
    Docs,
    Links,
    Attachments,
    Views,
}

impl Kind {
    pub(crate) fn suffix(&self) -> &'static str {
        match self {
            Kind::Docs => "docs",
            Kind::Links => "links",
            Kind::Attachments => "blobs",
            Kind::Views => "views",
        }
    }

    fn from_suffix(suffix: &str) -> Option<Kind> {
        match suffix {
            "docs" => Some(Kind::Docs),
            "links" => Some(Kind::Links),
            "blobs" => Some(Kind::Attachments),
            "views" => Some(Kind::Views),
            _ => None,
        }
    }
}

pub(crate) struct RegistryInner {
    pub(crate) root: PathBuf,
    pub(crate) config: Config,
    pub(crate) script: Arc<dyn ScriptHost>,
    docs: RwLock<HashMap<String, Arc<DocStore>>>,
    links: RwLock<HashMap<String, Arc<LinkStore>>>,
    blobs: RwLock<HashMap<String, Arc<AttachmentStore>>>,
    views: RwLock<HashMap<String, Arc<View>>>,
    pub(crate) compact_pool: Pool,
    pub(crate) check_pool: Pool,
    pub(crate) map_pool: Pool,
    pub(crate) reduce_pool: Pool,
    shutting_down: AtomicBool,
}

impl RegistryInner {
    pub(crate) fn path_for(&self, kind: Kind, name: &str) -> PathBuf {
        self.root.join(format!("{name}.{}", kind.suffix()))
    }

    pub(crate) fn docs_named(&self, name: &str) -> Option<Arc<DocStore>> {
        self.docs.read().get(name).cloned()
    }

    pub(crate) fn links_named(&self, name: &str) -> Option<Arc<LinkStore>> {
        self.links.read().get(name).cloned()
    }

    pub(crate) fn blobs_named(&self, name: &str) -> Option<Arc<AttachmentStore>> {
        self.blobs.read().get(name).cloned()
    }

    pub(crate) fn view_named(&self, name: &str) -> Option<Arc<View>> {
        self.views.read().get(name).cloned()
    }
}

/// The process-embedded engine: one root directory, four name→handle
/// maps, and the background pools. Lookups clone the Arc and release the
/// registry lock before touching the collection.
pub struct Registry {
    inner: Arc<RegistryInner>,
}

impl Registry {
    /// Open the root directory with a closure-backed script host.
    pub fn init(root: impl AsRef<Path>, config: Config) -> Result<Registry> {
        Registry::init_with_host(root, config, Arc::new(NativeHost::new()))
    }

    /// Open (creating if needed) the root directory, discover existing
    /// collections by suffix, and rebuild the derivation graph.
    pub fn init_with_host(
        root: impl AsRef<Path>,
        config: Config,
        script: Arc<dyn ScriptHost>,
    ) -> Result<Registry> {
        let root = root.as_ref().to_path_buf();
        std::fs::create_dir_all(&root)?;

        let workers = config.pool_workers;
        let inner = Arc::new(RegistryInner {
            root: root.clone(),
            config: config.clone(),
            script,
            docs: RwLock::new(HashMap::new()),
            links: RwLock::new(HashMap::new()),
            blobs: RwLock::new(HashMap::new()),
            views: RwLock::new(HashMap::new()),
            compact_pool: Pool::new("compact", workers),
            check_pool: Pool::new("check", workers),
            map_pool: Pool::new("view-map", workers),
            reduce_pool: Pool::new("view-reduce", workers),
            shutting_down: AtomicBool::new(false),
        });

        let mut discovered: Vec<(Kind, String)> = Vec::new();
        for entry in std::fs::read_dir(&root)? {
            let entry = entry?;
            if !entry.file_type()?.is_file() {
                continue;
            }
            let file_name = entry.file_name();
            let Some(file_name) = file_name.to_str() else {
                continue;
            };
            let Some((name, suffix)) = file_name.rsplit_once('.') else {
                continue;
            };
            let Some(kind) = Kind::from_suffix(suffix) else {
                continue;
            };
            if ids::validate_name(name).is_ok() {
                discovered.push((kind, name.to_owned()));
            }
        }
        // Parents before dependents.
        discovered.sort_by_key(|(kind, _)| match kind {
            Kind::Docs => 0,
            Kind::Links => 1,
            Kind::Attachments => 2,
            Kind::Views => 3,
        });

        for (kind, name) in discovered {
            let path = inner.path_for(kind, &name);
            info!(kind = kind.suffix(), collection = %name, "opening collection");
            match kind {
                Kind::Docs => {
                    let store = DocStore::open_at(
                        name.clone(),
                        path,
                        config.clone(),
                        Arc::downgrade(&inner),
                        false,
                    )?;
                    inner.docs.write().insert(name, store);
                }
                Kind::Links => {
                    let store = LinkStore::open_at(
                        name.clone(),
                        path,
                        config.clone(),
                        Arc::downgrade(&inner),
                        None,
                    )?;
                    inner.links.write().insert(name, store);
                }
                Kind::Attachments => {
                    let store = AttachmentStore::open_at(
                        name.clone(),
                        path,
                        config.clone(),
                        Arc::downgrade(&inner),
                        None,
                    )?;
                    inner.blobs.write().insert(name, store);
                }
                Kind::Views => {
                    let view = View::open_at(
                        name.clone(),
                        path,
                        config.clone(),
                        Arc::downgrade(&inner),
                        None,
                    )?;
                    inner.views.write().insert(name, view);
                }
            }
        }

        let registry = Registry { inner };
        registry.rewire();
        // Resume any interrupted syncs from their watermarks.
        for view in registry.inner.views.read().values() {
            view.touch();
        }
        Ok(registry)
    }

    /// Rebuild parent→dependent pointers from collection metadata.
    fn rewire(&self) {
        let inner = &self.inner;
        for (name, store) in inner.links.read().iter() {
            let (parent, is_docs) = store.parent();
            if is_docs {
                match inner.docs_named(parent) {
                    Some(parent) => parent.attach_links(name),
                    None => warn!(links = %name, parent, "link store parent is missing"),
                }
            }
        }
        for (name, store) in inner.blobs.read().iter() {
            match inner.docs_named(store.parent()) {
                Some(parent) => parent.attach_blobs(name),
                None => warn!(attachments = %name, parent = store.parent(), "attachment store parent is missing"),
            }
        }
        for (name, view) in inner.views.read().iter() {
            let (kind, parent) = view.parent();
            let attached = match kind {
                SourceKind::Docs => inner
                    .docs_named(parent)
                    .map(|p| p.attach_view(name))
                    .is_some(),
                SourceKind::Links => inner
                    .links_named(parent)
                    .map(|p| p.attach_view(name))
                    .is_some(),
                SourceKind::View => inner
                    .view_named(parent)
                    .map(|p| p.attach_view(name))
                    .is_some(),
            };
            if !attached {
                warn!(view = %name, parent, "view parent is missing");
                view.record_error(format!("parent collection '{parent}' is missing"));
            }
        }
    }

    pub fn config(&self) -> &Config {
        &self.inner.config
    }

    pub fn root(&self) -> &Path {
        &self.inner.root
    }

    /// Snapshot of names of one kind; order unspecified but stable for
    /// the call.
    pub fn list(&self, kind: Kind) -> Vec<String> {
        match kind {
            Kind::Docs => self.inner.docs.read().keys().cloned().collect(),
            Kind::Links => self.inner.links.read().keys().cloned().collect(),
            Kind::Attachments => self.inner.blobs.read().keys().cloned().collect(),
            Kind::Views => self.inner.views.read().keys().cloned().collect(),
        }
    }

    pub fn open_docs(&self, name: &str) -> Result<Arc<DocStore>> {
        self.inner
            .docs_named(name)
            .ok_or_else(|| Error::NotFound(name.to_owned()))
    }

    pub fn open_links(&self, name: &str) -> Result<Arc<LinkStore>> {
        self.inner
            .links_named(name)
            .ok_or_else(|| Error::NotFound(name.to_owned()))
    }

    pub fn open_attachments(&self, name: &str) -> Result<Arc<AttachmentStore>> {
        self.inner
            .blobs_named(name)
            .ok_or_else(|| Error::NotFound(name.to_owned()))
    }

    pub fn open_view(&self, name: &str) -> Result<Arc<View>> {
        self.inner
            .view_named(name)
            .ok_or_else(|| Error::NotFound(name.to_owned()))
    }

    pub fn create_docs(&self, name: &str) -> Result<Arc<DocStore>> {
        ids::validate_name(name)?;
        let path = self.ensure_absent(Kind::Docs, name)?;
        let store = DocStore::open_at(
            name.to_owned(),
            path,
            self.inner.config.clone(),
            Arc::downgrade(&self.inner),
            true,
        )?;
        self.inner
            .docs
            .write()
            .insert(name.to_owned(), store.clone());
        Ok(store)
    }

    pub fn create_links(
        &self,
        name: &str,
        parent: &str,
        parent_is_docs: bool,
    ) -> Result<Arc<LinkStore>> {
        ids::validate_name(name)?;
        if parent_is_docs {
            self.open_docs(parent)?;
        } else {
            self.open_links(parent)?;
        }
        let path = self.ensure_absent(Kind::Links, name)?;
        let store = LinkStore::open_at(
            name.to_owned(),
            path,
            self.inner.config.clone(),
            Arc::downgrade(&self.inner),
            Some((parent.to_owned(), parent_is_docs)),
        )?;
        self.inner
            .links
            .write()
            .insert(name.to_owned(), store.clone());
        if parent_is_docs {
            if let Some(parent) = self.inner.docs_named(parent) {
                parent.attach_links(name);
            }
        }
        Ok(store)
    }

    pub fn create_attachments(&self, name: &str, parent: &str) -> Result<Arc<AttachmentStore>> {
        ids::validate_name(name)?;
        self.open_docs(parent)?;
        let path = self.ensure_absent(Kind::Attachments, name)?;
        let store = AttachmentStore::open_at(
            name.to_owned(),
            path,
            self.inner.config.clone(),
            Arc::downgrade(&self.inner),
            Some(parent.to_owned()),
        )?;
        self.inner
            .blobs
            .write()
            .insert(name.to_owned(), store.clone());
        if let Some(parent) = self.inner.docs_named(parent) {
            parent.attach_blobs(name);
        }
        Ok(store)
    }

    pub fn create_view(&self, name: &str, params: ViewParams) -> Result<Arc<View>> {
        ids::validate_name(name)?;
        match params.parent_kind {
            SourceKind::Docs => {
                self.open_docs(&params.parent)?;
            }
            SourceKind::Links => {
                self.open_links(&params.parent)?;
            }
            SourceKind::View => {
                self.open_view(&params.parent)?;
            }
        }
        if let Some(output) = &params.output {
            self.open_docs(output)?;
        }
        // Surface bad functions at creation, not first sync.
        self.inner
            .script
            .compile(&params.map.source, params.map.language)?;
        if let Some(reduce) = &params.reduce {
            self.inner.script.compile(&reduce.source, reduce.language)?;
        }

        let path = self.ensure_absent(Kind::Views, name)?;
        let parent = params.parent.clone();
        let parent_kind = params.parent_kind;
        let view = View::open_at(
            name.to_owned(),
            path,
            self.inner.config.clone(),
            Arc::downgrade(&self.inner),
            Some(params),
        )?;
        self.inner
            .views
            .write()
            .insert(name.to_owned(), view.clone());
        match parent_kind {
            SourceKind::Docs => {
                if let Some(p) = self.inner.docs_named(&parent) {
                    p.attach_view(name);
                }
            }
            SourceKind::Links => {
                if let Some(p) = self.inner.links_named(&parent) {
                    p.attach_view(name);
                }
            }
            SourceKind::View => {
                if let Some(p) = self.inner.view_named(&parent) {
                    p.attach_view(name);
                }
            }
        }
        // Build the initial content from whatever the parent already has.
        view.touch();
        Ok(view)
    }

    /// Soft-delete: the name disappears from the registry now; the file
    /// is unlinked when the last borrower lets go.
    pub fn delete(&self, kind: Kind, name: &str) -> Result<()> {
        match kind {
            Kind::Docs => {
                let store = self
                    .inner
                    .docs
                    .write()
                    .remove(name)
                    .ok_or_else(|| Error::NotFound(name.to_owned()))?;
                store.handle.mark_for_deletion();
            }
            Kind::Links => {
                let store = self
                    .inner
                    .links
                    .write()
                    .remove(name)
                    .ok_or_else(|| Error::NotFound(name.to_owned()))?;
                let (parent, is_docs) = store.parent();
                if is_docs {
                    if let Some(parent) = self.inner.docs_named(parent) {
                        parent.detach_links(name);
                    }
                }
                store.handle.mark_for_deletion();
            }
            Kind::Attachments => {
                let store = self
                    .inner
                    .blobs
                    .write()
                    .remove(name)
                    .ok_or_else(|| Error::NotFound(name.to_owned()))?;
                if let Some(parent) = self.inner.docs_named(store.parent()) {
                    parent.detach_blobs(name);
                }
                store.handle.mark_for_deletion();
            }
            Kind::Views => {
                let view = self
                    .inner
                    .views
                    .write()
                    .remove(name)
                    .ok_or_else(|| Error::NotFound(name.to_owned()))?;
                let (parent_kind, parent) = view.parent();
                match parent_kind {
                    SourceKind::Docs => {
                        if let Some(p) = self.inner.docs_named(parent) {
                            p.detach_view(name);
                        }
                    }
                    SourceKind::Links => {
                        if let Some(p) = self.inner.links_named(parent) {
                            p.detach_view(name);
                        }
                    }
                    SourceKind::View => {
                        if let Some(p) = self.inner.view_named(parent) {
                            p.detach_view(name);
                        }
                    }
                }
                view.handle.mark_for_deletion();
            }
        }
        Ok(())
    }

    /// Drain the background pools, flush WAL state, and close every
    /// collection.
    pub fn shutdown(&self) {
        if self.inner.shutting_down.swap(true, Ordering::SeqCst) {
            return;
        }
        info!("registry shutting down");
        for store in self.inner.docs.read().values() {
            store.handle.request_quit();
        }
        for store in self.inner.links.read().values() {
            store.handle.request_quit();
        }
        for store in self.inner.blobs.read().values() {
            store.handle.request_quit();
        }
        for view in self.inner.views.read().values() {
            view.handle.request_quit();
        }

        self.inner.map_pool.shutdown();
        self.inner.reduce_pool.shutdown();
        self.inner.compact_pool.shutdown();
        self.inner.check_pool.shutdown();

        for store in self.inner.docs.read().values() {
            let _ = store
                .handle
                .conn
                .lock()
                .execute_batch("PRAGMA wal_checkpoint(TRUNCATE);");
        }
        for store in self.inner.links.read().values() {
            let _ = store
                .handle
                .conn
                .lock()
                .execute_batch("PRAGMA wal_checkpoint(TRUNCATE);");
        }
        for store in self.inner.blobs.read().values() {
            let _ = store
                .handle
                .conn
                .lock()
                .execute_batch("PRAGMA wal_checkpoint(TRUNCATE);");
        }
        for view in self.inner.views.read().values() {
            let _ = view
                .handle
                .conn
                .lock()
                .execute_batch("PRAGMA wal_checkpoint(TRUNCATE);");
        }

        self.inner.docs.write().clear();
        self.inner.links.write().clear();
        self.inner.blobs.write().clear();
        self.inner.views.write().clear();
    }

    // ---- administrative surface ----

    pub fn compact(&self, kind: Kind, name: &str) -> Result<()> {
        match kind {
            Kind::Docs => self.open_docs(name)?.compact(),
            Kind::Links => self.open_links(name)?.compact(),
            _ => {
                return Err(Error::InvalidName(format!(
                    "'{name}': only document and link collections compact"
                )))
            }
        }
        Ok(())
    }

    pub fn check(&self, name: &str) -> Result<()> {
        self.open_links(name)?.check();
        Ok(())
    }

    /// Synchronize one view and wait for it to reach Idle.
    pub fn sync(&self, name: &str) -> Result<()> {
        self.open_view(name)?.sync_now()
    }

    /// Synchronize every view, parents before children, so one pass
    /// settles cascading pipelines.
    pub fn sync_all(&self) -> Result<()> {
        let views: Vec<Arc<View>> = self.inner.views.read().values().cloned().collect();
        let depth = |view: &Arc<View>| {
            let mut depth = 0usize;
            let mut current = view.clone();
            while depth <= views.len() {
                let (kind, parent) = current.parent();
                if kind != SourceKind::View {
                    break;
                }
                match self.inner.view_named(parent) {
                    Some(parent) => {
                        current = parent;
                        depth += 1;
                    }
                    None => break,
                }
            }
            depth
        };
        let mut ordered: Vec<(usize, Arc<View>)> =
            views.iter().map(|v| (depth(v), v.clone())).collect();
        ordered.sort_by_key(|(depth, _)| *depth);
        for (_, view) in ordered {
            view.sync_now()?;
        }
        Ok(())
    }

    pub fn rebuild_indexes(&self, kind: Kind, name: &str) -> Result<()> {
        let rebuild = |conn: &rusqlite::Connection| -> Result<()> {
            conn.execute_batch("REINDEX; ANALYZE;")?;
            Ok(())
        };
        match kind {
            Kind::Docs => rebuild(&self.open_docs(name)?.handle.conn.lock()),
            Kind::Links => rebuild(&self.open_links(name)?.handle.conn.lock()),
            Kind::Attachments => rebuild(&self.open_attachments(name)?.handle.conn.lock()),
            Kind::Views => rebuild(&self.open_view(name)?.handle.conn.lock()),
        }
    }

    pub fn bulk_insert(&self, name: &str, records: Vec<BulkDoc>) -> Result<Vec<BulkResult>> {
        Ok(self.open_docs(name)?.bulk(records))
    }

    /// Wire-form dump of a collection's change feed, for debugging and
    /// the admin CLI.
    pub fn changes_dump(&self, name: &str, since: u64) -> Result<Vec<Value>> {
        let query = crate::ChangesQuery::since(since);
        let page = if let Some(docs) = self.inner.docs_named(name) {
            docs.changes(&query)?
        } else if let Some(links) = self.inner.links_named(name) {
            links.changes(&query)?
        } else {
            return Err(Error::NotFound(name.to_owned()));
        };
        Ok(page.items.iter().map(|item| item.to_wire()).collect())
    }

    fn ensure_absent(&self, kind: Kind, name: &str) -> Result<PathBuf> {
        let exists = match kind {
            Kind::Docs => self.inner.docs.read().contains_key(name),
            Kind::Links => self.inner.links.read().contains_key(name),
            Kind::Attachments => self.inner.blobs.read().contains_key(name),
            Kind::Views => self.inner.views.read().contains_key(name),
        };
        let path = self.inner.path_for(kind, name);
        if exists || path.exists() {
            return Err(Error::AlreadyExists(name.to_owned()));
        }
        Ok(path)
    }
}

impl Drop for Registry {
    fn drop(&mut self) {
        self.shutdown();
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::ScriptSpec;
    use serde_json::json;
    use tempfile::TempDir;

    #[test]
    fn init_creates_root_and_lists_empty() {
        let dir = TempDir::new().unwrap();
        let root = dir.path().join("data");
        let reg = Registry::init(&root, Config::default()).unwrap();
        assert!(root.is_dir());
        assert!(reg.list(Kind::Docs).is_empty());
    }

    #[test]
    fn create_open_delete_round_trip() {
        let dir = TempDir::new().unwrap();
        let reg = Registry::init(dir.path(), Config::default()).unwrap();

        let docs = reg.create_docs("notes").unwrap();
        assert_eq!(docs.name(), "notes");
        assert!(matches!(
            reg.create_docs("notes"),
            Err(Error::AlreadyExists(_))
        ));
        assert_eq!(reg.list(Kind::Docs), vec!["notes".to_owned()]);
        assert!(reg.open_docs("notes").is_ok());
        assert!(matches!(reg.open_docs("nope"), Err(Error::NotFound(_))));

        let path = dir.path().join("notes.docs");
        assert!(path.exists());
        drop(docs);
        reg.delete(Kind::Docs, "notes").unwrap();
        assert!(reg.open_docs("notes").is_err());
        assert!(!path.exists(), "file unlinked once the last borrow drops");
    }

    #[test]
    fn deletion_waits_for_borrowers() {
        let dir = TempDir::new().unwrap();
        let reg = Registry::init(dir.path(), Config::default()).unwrap();
        let docs = reg.create_docs("notes").unwrap();
        let path = dir.path().join("notes.docs");

        reg.delete(Kind::Docs, "notes").unwrap();
        assert!(path.exists(), "borrow still held");
        drop(docs);
        assert!(!path.exists());
    }

    #[test]
    fn invalid_names_are_rejected() {
        let dir = TempDir::new().unwrap();
        let reg = Registry::init(dir.path(), Config::default()).unwrap();
        assert!(matches!(reg.create_docs("_sys"), Err(Error::InvalidName(_))));
        assert!(matches!(reg.create_docs("a/b"), Err(Error::InvalidName(_))));
        assert!(matches!(reg.create_docs(""), Err(Error::InvalidName(_))));
    }

    #[test]
    fn scan_reopens_collections_and_wires_parents() {
        let dir = TempDir::new().unwrap();
        {
            let reg = Registry::init(dir.path(), Config::default()).unwrap();
            let docs = reg.create_docs("notes").unwrap();
            reg.create_links("edges", "notes", true).unwrap();
            reg.create_attachments("files", "notes").unwrap();
            docs.create(json!({"x": 1}), Some("d1")).unwrap();
            reg.shutdown();
        }

        let reg = Registry::init(dir.path(), Config::default()).unwrap();
        assert_eq!(reg.list(Kind::Docs), vec!["notes".to_owned()]);
        assert_eq!(reg.list(Kind::Links), vec!["edges".to_owned()]);
        assert_eq!(reg.list(Kind::Attachments), vec!["files".to_owned()]);

        let docs = reg.open_docs("notes").unwrap();
        assert_eq!(docs.read("d1").unwrap().body, json!({"x": 1}));
        let links = reg.open_links("edges").unwrap();
        assert_eq!(links.parent(), ("notes", true));
    }

    #[test]
    fn create_links_requires_parent() {
        let dir = TempDir::new().unwrap();
        let reg = Registry::init(dir.path(), Config::default()).unwrap();
        assert!(matches!(
            reg.create_links("edges", "missing", true),
            Err(Error::NotFound(_))
        ));
    }

    #[test]
    fn create_view_validates_functions_and_parent() {
        let dir = TempDir::new().unwrap();
        let host = NativeHost::new().with_map("by_t", |doc| {
            doc.get("t")
                .map(|t| {
                    vec![crate::MapEmit {
                        key: t.clone(),
                        value: json!(1),
                    }]
                })
                .unwrap_or_default()
        });
        let reg = Registry::init_with_host(dir.path(), Config::default(), Arc::new(host)).unwrap();
        reg.create_docs("notes").unwrap();

        assert!(matches!(
            reg.create_view(
                "v",
                ViewParams {
                    parent_kind: SourceKind::Docs,
                    parent: "missing".into(),
                    map: ScriptSpec::native("by_t"),
                    reduce: None,
                    output: None,
                }
            ),
            Err(Error::NotFound(_))
        ));
        assert!(matches!(
            reg.create_view(
                "v",
                ViewParams {
                    parent_kind: SourceKind::Docs,
                    parent: "notes".into(),
                    map: ScriptSpec::native("unregistered"),
                    reduce: None,
                    output: None,
                }
            ),
            Err(Error::Script(_))
        ));
        assert!(reg
            .create_view(
                "v",
                ViewParams {
                    parent_kind: SourceKind::Docs,
                    parent: "notes".into(),
                    map: ScriptSpec::native("by_t"),
                    reduce: None,
                    output: None,
                }
            )
            .is_ok());
    }
}
