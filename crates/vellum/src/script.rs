use crate::{Error, Result};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

/// Language tag carried next to a stored map/reduce source.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Language {
    Native,
    Javascript,
}

impl Language {
    pub fn as_str(&self) -> &'static str {
        match self {
            Language::Native => "native",
            Language::Javascript => "javascript",
        }
    }

    pub fn from_tag(tag: &str) -> Result<Language> {
        match tag {
            "native" => Ok(Language::Native),
            "javascript" => Ok(Language::Javascript),
            other => Err(Error::Script(format!("unknown script language '{other}'"))),
        }
    }
}

impl fmt::Display for Language {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A stored function: source text plus its language tag.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ScriptSpec {
    pub source: String,
    pub language: Language,
}

impl ScriptSpec {
    pub fn native(source: impl Into<String>) -> ScriptSpec {
        ScriptSpec {
            source: source.into(),
            language: Language::Native,
        }
    }
}

/// Host-validated handle to a compiled function. Hosts resolve the actual
/// callable at invocation time, which keeps the handle serializable and
/// the trait object-safe.
#[derive(Clone, Debug)]
pub struct CompiledFn {
    pub source: String,
    pub language: Language,
}

/// One `{key, value}` pair emitted by a map invocation.
#[derive(Clone, Debug, PartialEq)]
pub struct MapEmit {
    pub key: Value,
    pub value: Value,
}

/// Per-invocation failures carry an error string; the engine skips the
/// offending row and records the string in the view's warning slot rather
/// than failing the view.
pub type ScriptResult<T> = std::result::Result<T, String>;

/// The seam to the scripting engine. The engine only ever calls through
/// this trait, so a JavaScript binding and the closure-backed
/// [`NativeHost`] are interchangeable.
pub trait ScriptHost: Send + Sync {
    fn compile(&self, source: &str, language: Language) -> Result<CompiledFn>;

    fn invoke_map(&self, func: &CompiledFn, doc: &Value) -> ScriptResult<Vec<MapEmit>>;

    fn invoke_reduce(
        &self,
        func: &CompiledFn,
        keys: Option<&Value>,
        values: &[Value],
        rereduce: bool,
    ) -> ScriptResult<Value>;
}

type NativeMap = dyn Fn(&Value) -> Vec<MapEmit> + Send + Sync;
type NativeReduce = dyn Fn(Option<&Value>, &[Value], bool) -> Value + Send + Sync;

/// A script host whose functions are Rust closures registered by name;
/// the stored "source" of a native function is that name. This is the
/// host used by embedders which don't need scripting, and by every test.
#[derive(Default)]
pub struct NativeHost {
    maps: HashMap<String, Arc<NativeMap>>,
    reduces: HashMap<String, Arc<NativeReduce>>,
}

impl NativeHost {
    pub fn new() -> NativeHost {
        NativeHost::default()
    }

    pub fn with_map(
        mut self,
        name: impl Into<String>,
        func: impl Fn(&Value) -> Vec<MapEmit> + Send + Sync + 'static,
    ) -> Self {
        self.maps.insert(name.into(), Arc::new(func));
        self
    }

    pub fn with_reduce(
        mut self,
        name: impl Into<String>,
        func: impl Fn(Option<&Value>, &[Value], bool) -> Value + Send + Sync + 'static,
    ) -> Self {
        self.reduces.insert(name.into(), Arc::new(func));
        self
    }

    /// Register the stock numeric sum reducer under |name|.
    pub fn with_sum_reduce(self, name: impl Into<String>) -> Self {
        self.with_reduce(name, |_keys, values, _rereduce| {
            let total: f64 = values.iter().filter_map(Value::as_f64).sum();
            collation::normalize(serde_json::json!(total))
        })
    }
}

impl ScriptHost for NativeHost {
    fn compile(&self, source: &str, language: Language) -> Result<CompiledFn> {
        if language != Language::Native {
            return Err(Error::Script(format!(
                "native host cannot evaluate '{language}' functions"
            )));
        }
        if !self.maps.contains_key(source) && !self.reduces.contains_key(source) {
            return Err(Error::Script(format!(
                "no native function registered as '{source}'"
            )));
        }
        Ok(CompiledFn {
            source: source.to_owned(),
            language,
        })
    }

    fn invoke_map(&self, func: &CompiledFn, doc: &Value) -> ScriptResult<Vec<MapEmit>> {
        match self.maps.get(&func.source) {
            Some(map) => Ok(map(doc)),
            None => Err(format!("no native map function '{}'", func.source)),
        }
    }

    fn invoke_reduce(
        &self,
        func: &CompiledFn,
        keys: Option<&Value>,
        values: &[Value],
        rereduce: bool,
    ) -> ScriptResult<Value> {
        match self.reduces.get(&func.source) {
            Some(reduce) => Ok(reduce(keys, values, rereduce)),
            None => Err(format!("no native reduce function '{}'", func.source)),
        }
    }
}
