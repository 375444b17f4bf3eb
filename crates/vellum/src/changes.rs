use chrono::{TimeZone, Utc};
use parking_lot::{Condvar, Mutex};
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::{Duration, Instant};

/// Restrict a listing to live records, tombstones, or both.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub enum CountType {
    #[default]
    All,
    Live,
    Deleted,
}

/// A change-feed query. `since` is exclusive and `to` inclusive, both in
/// sequence numbers; `limit`/`offset` page the result.
#[derive(Clone, Debug, Default)]
pub struct ChangesQuery {
    pub since: u64,
    pub to: Option<u64>,
    pub limit: Option<usize>,
    pub offset: usize,
    pub descending: bool,
    pub count_type: CountType,
    /// Link collections only: restrict to one context id.
    pub context_id: Option<String>,
    /// Link collections only: restrict to one label.
    pub label: Option<String>,
}

impl ChangesQuery {
    pub fn since(since: u64) -> ChangesQuery {
        ChangesQuery {
            since,
            ..ChangesQuery::default()
        }
    }
}

/// Link attributes echoed inside a link collection's change items.
#[derive(Clone, Debug, PartialEq)]
pub struct LinkChange {
    pub context_id: String,
    pub label: String,
    pub href: String,
    pub rel: Option<String>,
    pub authority: Option<String>,
    pub is_weblink: bool,
}

/// One completed write, addressed by its sequence number.
#[derive(Clone, Debug, PartialEq)]
pub struct ChangeItem {
    pub seq: u64,
    pub id: String,
    pub deleted: bool,
    pub created_us: i64,
    pub expire_us: Option<i64>,
    pub rev: String,
    pub link: Option<LinkChange>,
}

impl ChangeItem {
    /// Wire form consumed by the HTTP front end.
    pub fn to_wire(&self) -> Value {
        let mut change = serde_json::Map::new();
        change.insert("rev".into(), json!(self.rev));
        if let Some(link) = &self.link {
            change.insert("context_id".into(), json!(link.context_id));
            change.insert("label".into(), json!(link.label));
            change.insert("href".into(), json!(link.href));
            change.insert("is_weblink".into(), json!(link.is_weblink));
            if let Some(rel) = &link.rel {
                change.insert("rel".into(), json!(rel));
            }
            if let Some(authority) = &link.authority {
                change.insert("authority".into(), json!(authority));
            }
        }

        let mut item = serde_json::Map::new();
        item.insert("seq".into(), json!(self.seq));
        item.insert("id".into(), json!(self.id));
        if self.deleted {
            item.insert("deleted".into(), json!(true));
        }
        item.insert("created".into(), json!(http_date(self.created_us)));
        if let Some(expire) = self.expire_us {
            item.insert("expire".into(), json!(http_date(expire)));
        }
        item.insert("changes".into(), Value::Array(vec![Value::Object(change)]));
        Value::Object(item)
    }
}

/// One page of a feed plus the cursor to resume from.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct ChangesPage {
    pub items: Vec<ChangeItem>,
    pub last_seq: u64,
}

/// Current time as a microsecond unix timestamp, the engine's revision
/// timestamp unit.
pub(crate) fn now_us() -> i64 {
    Utc::now().timestamp_micros()
}

/// RFC 7231 date from a microsecond unix timestamp. Out-of-range
/// timestamps fall back to the epoch rather than failing a feed read.
pub(crate) fn http_date(us: i64) -> String {
    match Utc.timestamp_micros(us) {
        chrono::LocalResult::Single(ts) => ts.format("%a, %d %b %Y %H:%M:%S GMT").to_string(),
        _ => "Thu, 01 Jan 1970 00:00:00 GMT".to_owned(),
    }
}

pub type SubscriptionId = u64;
type Handler = std::sync::Arc<dyn Fn(&ChangeItem) + Send + Sync>;

/// Per-collection write notifier: one wake-all condition plus registered
/// handlers. Long-poll waiters re-check their predicate on every wake;
/// handlers back the continuous feed without polling.
#[derive(Default)]
pub(crate) struct Notifier {
    last_seq: Mutex<u64>,
    cond: Condvar,
    handlers: Mutex<HashMap<SubscriptionId, Handler>>,
    next_id: AtomicU64,
}

impl Notifier {
    pub fn publish(&self, item: &ChangeItem) {
        {
            let mut last = self.last_seq.lock();
            if item.seq > *last {
                *last = item.seq;
            }
        }
        // Snapshot first: a handler may itself subscribe, unsubscribe, or
        // write.
        let handlers: Vec<Handler> = self.handlers.lock().values().cloned().collect();
        for handler in handlers {
            handler(item);
        }
        self.cond.notify_all();
    }

    /// Block until a write past |since| lands, the deadline passes, or
    /// |quit| flips. Returns whether new data is available.
    pub fn wait_past(&self, since: u64, timeout: Duration, quit: &AtomicBool) -> bool {
        let deadline = Instant::now() + timeout;
        let mut last = self.last_seq.lock();
        loop {
            if *last > since {
                return true;
            }
            if quit.load(Ordering::Relaxed) {
                return false;
            }
            let now = Instant::now();
            if now >= deadline {
                return false;
            }
            // Cap each wait so the quit flag is polled even without wakes.
            let slice = (deadline - now).min(Duration::from_millis(100));
            self.cond.wait_for(&mut last, slice);
        }
    }

    pub fn subscribe(&self, handler: Handler) -> SubscriptionId {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.handlers.lock().insert(id, handler);
        id
    }

    pub fn unsubscribe(&self, id: SubscriptionId) {
        self.handlers.lock().remove(&id);
    }

    pub fn wake_all(&self) {
        self.cond.notify_all();
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use std::sync::Arc;

    fn item(seq: u64) -> ChangeItem {
        ChangeItem {
            seq,
            id: "d1".into(),
            deleted: false,
            created_us: 1_700_000_000_000_000,
            expire_us: None,
            rev: format!("{seq}-{}", "0".repeat(64)),
            link: None,
        }
    }

    #[test]
    fn wire_form_shape() {
        let mut it = item(7);
        it.deleted = true;
        let wire = it.to_wire();
        assert_eq!(wire["seq"], 7);
        assert_eq!(wire["id"], "d1");
        assert_eq!(wire["deleted"], true);
        assert!(wire["created"].as_str().unwrap().ends_with("GMT"));
        assert_eq!(wire["changes"][0]["rev"], it.rev);
    }

    #[test]
    fn wire_form_includes_link_fields() {
        let mut it = item(1);
        it.link = Some(LinkChange {
            context_id: "d9".into(),
            label: "cites".into(),
            href: "http://example.org/x".into(),
            rel: None,
            authority: Some("alice".into()),
            is_weblink: true,
        });
        let change = &it.to_wire()["changes"][0];
        assert_eq!(change["context_id"], "d9");
        assert_eq!(change["label"], "cites");
        assert_eq!(change["is_weblink"], true);
        assert_eq!(change["authority"], "alice");
        assert!(change.get("rel").is_none());
    }

    #[test]
    fn wait_past_sees_published_seq() {
        let notifier = Arc::new(Notifier::default());
        let quit = Arc::new(AtomicBool::new(false));

        let waiter = {
            let notifier = notifier.clone();
            let quit = quit.clone();
            std::thread::spawn(move || notifier.wait_past(0, Duration::from_secs(5), &quit))
        };
        std::thread::sleep(Duration::from_millis(20));
        notifier.publish(&item(1));
        assert!(waiter.join().unwrap());
    }

    #[test]
    fn wait_past_honors_quit() {
        let notifier = Notifier::default();
        let quit = AtomicBool::new(true);
        assert!(!notifier.wait_past(0, Duration::from_secs(5), &quit));
    }

    #[test]
    fn subscribers_observe_each_publish() {
        let notifier = Notifier::default();
        let hits = Arc::new(AtomicUsize::new(0));
        let sub = {
            let hits = hits.clone();
            notifier.subscribe(std::sync::Arc::new(move |_| {
                hits.fetch_add(1, Ordering::SeqCst);
            }))
        };
        notifier.publish(&item(1));
        notifier.publish(&item(2));
        notifier.unsubscribe(sub);
        notifier.publish(&item(3));
        assert_eq!(hits.load(Ordering::SeqCst), 2);
    }
}
