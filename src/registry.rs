//! Process-wide directory of tasks, queues, variables and callable functions.
//!
//! ```text
//!   tasks      module-name            → TaskId
//!   queues     module-name            → QueueHandle
//!   vars       class → var            → VarTemplate
//!   functions  "<module>:<function>"  → FunctionKind
//! ```
//!
//! Registration is last-writer-wins and lookups return `None` on miss. All
//! access goes through one mutex; function handlers are cloned out and run
//! after the lock is released, so a handler may itself use the registry.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use log::{debug, warn};
use serde::Serialize;
use serde_json::{Map, Value, json};

use crate::bus::QueueHandle;
use crate::error::RegistryError;
use crate::task::TaskId;

pub type FunctionResult = Result<Value, RegistryError>;
pub type FunctionPtr = fn(&Value) -> FunctionResult;
pub type DynFunction = Arc<dyn Fn(&Value) -> FunctionResult + Send + Sync>;

/// How a registered function is invoked.
#[derive(Clone)]
pub enum FunctionKind {
    /// Dispatched to the owning module's `call_function_by_name`.
    ByName { handle_name: String },
    Pointer(FunctionPtr),
    Dynamic(DynFunction),
    /// Accepted for registration; calls return `Unsupported`.
    Eval { code: String },
}

impl FunctionKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::ByName { .. } => "NAME",
            Self::Pointer(_) => "POINTER",
            Self::Dynamic(_) => "DYNAMIC",
            Self::Eval { .. } => "EVAL",
        }
    }
}

impl fmt::Debug for FunctionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::ByName { handle_name } => write!(f, "ByName({handle_name})"),
            Self::Eval { code } => write!(f, "Eval({} bytes)", code.len()),
            other => f.write_str(other.as_str()),
        }
    }
}

/// Target of `ByName` calls; implemented by the lifecycle manager.
pub trait NameDispatch {
    fn dispatch_by_name(&self, module: &str, handle_name: &str, params: &Value) -> FunctionResult;
}

/// A named value plus the metadata exported for telemetry.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct VarTemplate {
    #[serde(rename = "n")]
    pub name: String,
    #[serde(rename = "t")]
    pub type_tag: String,
    #[serde(rename = "s")]
    pub size: usize,
    #[serde(rename = "c")]
    pub count: u32,
    #[serde(rename = "v")]
    pub value: Value,
}

fn type_tag_of(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "bool",
        Value::Number(n) if n.is_f64() => "float",
        Value::Number(_) => "int",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

impl VarTemplate {
    pub fn new(name: &str, value: Value) -> Self {
        let count = match &value {
            Value::Array(a) => a.len() as u32,
            _ => 1,
        };
        Self {
            name: name.to_string(),
            type_tag: type_tag_of(&value).to_string(),
            size: value.to_string().len(),
            count,
            value,
        }
    }

    fn from_export(var: &str, doc: &Value) -> Option<Self> {
        let obj = doc.as_object()?;
        let value = obj.get("v")?.clone();
        let mut t = Self::new(obj.get("n").and_then(Value::as_str).unwrap_or(var), value);
        if let Some(tag) = obj.get("t").and_then(Value::as_str) {
            tag.clone_into(&mut t.type_tag);
        }
        if let Some(c) = obj.get("c").and_then(Value::as_u64) {
            t.count = c as u32;
        }
        Some(t)
    }
}

fn function_key(module: &str, function: &str) -> String {
    format!("{module}:{function}")
}

#[derive(Default)]
struct Inner {
    tasks: BTreeMap<String, TaskId>,
    queues: BTreeMap<String, QueueHandle>,
    vars: BTreeMap<String, BTreeMap<String, VarTemplate>>,
    functions: BTreeMap<String, FunctionKind>,
}

#[derive(Default)]
pub struct Registry {
    inner: Mutex<Inner>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    // ── Tasks ─────────────────────────────────────────────────

    pub fn register_task(&self, module: &str, task: TaskId) {
        self.lock().tasks.insert(module.to_string(), task);
    }

    pub fn find_task(&self, module: &str) -> Option<TaskId> {
        self.lock().tasks.get(module).copied()
    }

    pub fn unregister_task(&self, module: &str) -> Option<TaskId> {
        self.lock().tasks.remove(module)
    }

    // ── Queues ────────────────────────────────────────────────

    pub fn register_queue(&self, module: &str, queue: QueueHandle) {
        self.lock().queues.insert(module.to_string(), queue);
    }

    pub fn find_queue(&self, module: &str) -> Option<QueueHandle> {
        self.lock().queues.get(module).cloned()
    }

    pub fn unregister_queue(&self, module: &str) -> Option<QueueHandle> {
        self.lock().queues.remove(module)
    }

    // ── Variables ─────────────────────────────────────────────

    pub fn set_var(&self, class: &str, var: &str, template: VarTemplate) {
        self.lock()
            .vars
            .entry(class.to_string())
            .or_default()
            .insert(var.to_string(), template);
    }

    pub fn get_var(&self, class: &str, var: &str) -> Option<VarTemplate> {
        self.lock().vars.get(class)?.get(var).cloned()
    }

    // ── Functions ─────────────────────────────────────────────

    pub fn register_function(&self, module: &str, function: &str, kind: FunctionKind) {
        debug!("Registry: function {}:{} ({})", module, function, kind.as_str());
        self.lock().functions.insert(function_key(module, function), kind);
    }

    pub fn unregister_function(&self, module: &str, function: &str) -> bool {
        self.lock().functions.remove(&function_key(module, function)).is_some()
    }

    pub fn is_function_registered(&self, module: &str, function: &str) -> bool {
        self.lock().functions.contains_key(&function_key(module, function))
    }

    /// Function names (without the module prefix) registered for `module`.
    pub fn list_functions_for_module(&self, module: &str) -> Vec<String> {
        let prefix = format!("{module}:");
        self.lock()
            .functions
            .keys()
            .filter_map(|k| k.strip_prefix(&prefix).map(str::to_string))
            .collect()
    }

    /// Invoke `module:function`. `ByName` entries need a dispatcher.
    pub fn call_function(
        &self,
        module: &str,
        function: &str,
        params: &Value,
        by_name: Option<&dyn NameDispatch>,
    ) -> FunctionResult {
        let kind = self
            .lock()
            .functions
            .get(&function_key(module, function))
            .cloned()
            .ok_or(RegistryError::NotFound)?;

        match kind {
            FunctionKind::Pointer(f) => f(params),
            FunctionKind::Dynamic(f) => f(params),
            FunctionKind::ByName { handle_name } => match by_name {
                Some(d) => d.dispatch_by_name(module, &handle_name, params),
                None => {
                    warn!("Registry: {}:{} needs a by-name dispatcher", module, function);
                    Err(RegistryError::Unsupported)
                }
            },
            FunctionKind::Eval { .. } => {
                warn!("Registry: eval call {}:{} rejected", module, function);
                Err(RegistryError::Unsupported)
            }
        }
    }

    // ── Import / export ───────────────────────────────────────

    /// Snapshot for debugging and telemetry.
    pub fn export_json(&self) -> String {
        let inner = self.lock();
        let tasks: Map<String, Value> = inner
            .tasks
            .iter()
            .map(|(k, t)| (k.clone(), json!(t.raw())))
            .collect();
        let queues: Map<String, Value> = inner
            .queues
            .iter()
            .map(|(k, q)| {
                (
                    k.clone(),
                    json!({ "id": q.id().raw(), "len": q.len(), "cap": q.capacity() }),
                )
            })
            .collect();
        let vars: Map<String, Value> = inner
            .vars
            .iter()
            .map(|(class, vs)| {
                let entries: Map<String, Value> = vs
                    .iter()
                    .map(|(k, t)| (k.clone(), serde_json::to_value(t).unwrap_or(Value::Null)))
                    .collect();
                (class.clone(), Value::Object(entries))
            })
            .collect();
        let functions: Map<String, Value> = inner
            .functions
            .iter()
            .map(|(k, f)| (k.clone(), json!(f.as_str())))
            .collect();
        json!({ "t": tasks, "q": queues, "v": vars, "f": functions }).to_string()
    }

    /// Restore variables from an [`export_json`](Self::export_json)
    /// document. Task, queue and function sections are runtime-only and are
    /// ignored. Returns how many variables were imported.
    pub fn import_json(&self, doc: &str) -> Result<usize, RegistryError> {
        let parsed: Value = serde_json::from_str(doc).map_err(|_| RegistryError::Malformed)?;
        let Some(classes) = parsed.get("v") else {
            return Ok(0);
        };
        let classes = classes.as_object().ok_or(RegistryError::Malformed)?;

        let mut imported = Vec::new();
        for (class, vars) in classes {
            let vars = vars.as_object().ok_or(RegistryError::Malformed)?;
            for (var, entry) in vars {
                let t = VarTemplate::from_export(var, entry).ok_or(RegistryError::Malformed)?;
                imported.push((class.clone(), var.clone(), t));
            }
        }

        let count = imported.len();
        let mut inner = self.lock();
        for (class, var, t) in imported {
            inner.vars.entry(class).or_default().insert(var, t);
        }
        Ok(count)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::{ModuleQueue, QueueConfig};

    fn double(params: &Value) -> FunctionResult {
        params
            .as_i64()
            .map(|n| json!(n * 2))
            .ok_or(RegistryError::CallFailed)
    }

    struct Echo;

    impl NameDispatch for Echo {
        fn dispatch_by_name(&self, module: &str, handle_name: &str, params: &Value) -> FunctionResult {
            Ok(json!([module, handle_name, params]))
        }
    }

    #[test]
    fn last_writer_wins_for_queues_and_tasks() {
        let r = Registry::new();
        let a = ModuleQueue::new("M", QueueConfig::default());
        let b = ModuleQueue::new("M", QueueConfig::default());
        r.register_queue("M", a.handle().clone());
        r.register_queue("M", b.handle().clone());
        assert_eq!(r.find_queue("M").unwrap().id(), b.id());
        assert!(r.find_queue("X").is_none());

        r.register_task("M", TaskId::from_raw(7));
        assert_eq!(r.find_task("M"), Some(TaskId::from_raw(7)));
        assert_eq!(r.unregister_task("M"), Some(TaskId::from_raw(7)));
        assert!(r.find_task("M").is_none());
    }

    #[test]
    fn function_kinds_dispatch() {
        let r = Registry::new();
        r.register_function("M", "double", FunctionKind::Pointer(double));
        let offset = 10;
        r.register_function(
            "M",
            "add",
            FunctionKind::Dynamic(Arc::new(move |p: &Value| {
                Ok(json!(p.as_i64().unwrap_or(0) + offset))
            })),
        );
        r.register_function("M", "named", FunctionKind::ByName { handle_name: "do_it".into() });
        r.register_function("M", "script", FunctionKind::Eval { code: "1+1".into() });

        assert_eq!(r.call_function("M", "double", &json!(4), None), Ok(json!(8)));
        assert_eq!(r.call_function("M", "double", &json!("x"), None), Err(RegistryError::CallFailed));
        assert_eq!(r.call_function("M", "add", &json!(1), None), Ok(json!(11)));
        assert_eq!(
            r.call_function("M", "named", &json!(null), Some(&Echo)),
            Ok(json!(["M", "do_it", null]))
        );
        assert_eq!(r.call_function("M", "named", &json!(null), None), Err(RegistryError::Unsupported));
        assert!(r.is_function_registered("M", "script"));
        assert_eq!(r.call_function("M", "script", &json!(null), None), Err(RegistryError::Unsupported));
        assert_eq!(r.call_function("M", "nope", &json!(null), None), Err(RegistryError::NotFound));

        let mut names = r.list_functions_for_module("M");
        names.sort();
        assert_eq!(names, ["add", "double", "named", "script"]);
        assert!(r.unregister_function("M", "add"));
        assert!(!r.unregister_function("M", "add"));
    }

    #[test]
    fn export_then_import_restores_vars() {
        let r = Registry::new();
        r.set_var("net", "ip", VarTemplate::new("ip", json!("192.168.1.2")));
        r.set_var("net", "rssi", VarTemplate::new("rssi", json!(-61)));
        r.register_function("M", "f", FunctionKind::Pointer(double));
        let exported = r.export_json();
        let doc: Value = serde_json::from_str(&exported).unwrap();
        assert_eq!(doc["v"]["net"]["ip"]["t"], "string");
        assert_eq!(doc["f"]["M:f"], "POINTER");

        let fresh = Registry::new();
        assert_eq!(fresh.import_json(&exported), Ok(2));
        assert_eq!(fresh.get_var("net", "rssi").unwrap().value, json!(-61));
        assert_eq!(fresh.get_var("net", "rssi").unwrap().type_tag, "int");
    }

    #[test]
    fn import_rejects_malformed() {
        let r = Registry::new();
        assert_eq!(r.import_json("not json"), Err(RegistryError::Malformed));
        assert_eq!(r.import_json(r#"{"v": 3}"#), Err(RegistryError::Malformed));
        assert_eq!(r.import_json(r#"{"v": {"c": {"x": {"n": "x"}}}}"#), Err(RegistryError::Malformed));
        assert_eq!(r.import_json(r#"{"t": {}}"#), Ok(0));
    }
}
