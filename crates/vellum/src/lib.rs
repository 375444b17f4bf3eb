//! Vellum is a process-embedded, document-oriented storage engine:
//! schemaless JSON documents with optimistic MVCC revisions, typed
//! inter-document links, binary attachments, and materialized map/reduce
//! views, each collection backed by its own SQLite file under one root
//! directory. Background workers keep derived state (views, link
//! integrity, compaction) converging with source state without ever
//! blocking foreground writes.
//!
//! The entry point is [`Registry::init`]; collections are created and
//! borrowed through it. Map/reduce functions reach the engine through
//! the [`ScriptHost`] seam, with [`NativeHost`] providing closure-backed
//! functions for embedders and tests.

mod attachments;
mod changes;
mod check;
mod compact;
mod config;
mod docs;
mod error;
mod handle;
mod ids;
mod links;
mod mvcc;
mod pool;
mod registry;
mod script;
mod sql;
mod sync;
mod views;

pub use attachments::{Attachment, AttachmentInfo, AttachmentStore};
pub use changes::{
    ChangeItem, ChangesPage, ChangesQuery, CountType, LinkChange, SubscriptionId,
};
pub use config::{Config, Synchronous};
pub use docs::{BulkDoc, BulkResult, DocStore, FieldFilter, FilterOp, ListQuery, Revision};
pub use error::{Error, ErrorKind, Result};
pub use handle::Slots;
pub use links::{
    AuthorityFilter, LinkKind, LinkPatch, LinkQuery, LinkRecord, LinkStore, NewLink,
};
pub use mvcc::{Mvcc, HASH_LEN};
pub use registry::{Kind, Registry};
pub use script::{
    CompiledFn, Language, MapEmit, NativeHost, ScriptHost, ScriptResult, ScriptSpec,
};
pub use sync::SyncPhase;
pub use views::{SourceKind, View, ViewParams, ViewQuery, ViewRow, Watermarks};
