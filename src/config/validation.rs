//! Rule-table validation of configuration documents.
//!
//! Checks run in a fixed order and stop at the first failure:
//!
//! 1. version compatibility (`MIN_VERSION ..= CURRENT_VERSION`)
//! 2. schema shape (`version` string, `modules` object, each module with
//!    `state`, `priority`, `version`)
//! 3. required rules
//! 4. type, range and enum rules
//!
//! Rule paths may contain `*`, which matches every key of an object.

use core::fmt;

use serde_json::{Map, Value, json};

use super::path;
use super::version::Version;
use super::{CURRENT_VERSION, MIN_VERSION};
use crate::error::ConfigError;

/// Outcome of a validation pass. Exactly one per document.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ValidationResult {
    Valid,
    InvalidVersion,
    InvalidSchema,
    MissingRequired,
    InvalidValue,
    FileNotFound,
    ParseError,
}

impl ValidationResult {
    pub const fn code(self) -> &'static str {
        match self {
            Self::Valid => "CONFIG_VALID",
            Self::InvalidVersion => "CONFIG_INVALID_VERSION",
            Self::InvalidSchema => "CONFIG_INVALID_SCHEMA",
            Self::MissingRequired => "CONFIG_MISSING_REQUIRED",
            Self::InvalidValue => "CONFIG_INVALID_VALUE",
            Self::FileNotFound => "CONFIG_FILE_NOT_FOUND",
            Self::ParseError => "CONFIG_PARSE_ERROR",
        }
    }

    pub const fn message(self) -> &'static str {
        match self {
            Self::Valid => "Configuration is valid",
            Self::InvalidVersion => "Invalid or unsupported configuration version",
            Self::InvalidSchema => "Configuration does not match the expected schema",
            Self::MissingRequired => "Required configuration field is missing",
            Self::InvalidValue => "Configuration field has an invalid value",
            Self::FileNotFound => "Configuration file not found",
            Self::ParseError => "Configuration file could not be parsed",
        }
    }

    pub const fn is_valid(self) -> bool {
        matches!(self, Self::Valid)
    }

    pub fn into_result(self) -> Result<(), ConfigError> {
        match self {
            Self::Valid => Ok(()),
            Self::InvalidVersion => Err(ConfigError::InvalidVersion),
            Self::InvalidSchema => Err(ConfigError::InvalidSchema),
            Self::MissingRequired => Err(ConfigError::MissingRequired),
            Self::InvalidValue => Err(ConfigError::InvalidValue),
            Self::FileNotFound => Err(ConfigError::FileNotFound),
            Self::ParseError => Err(ConfigError::ParseError),
        }
    }
}

impl fmt::Display for ValidationResult {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.code(), self.message())
    }
}

impl From<ConfigError> for ValidationResult {
    fn from(e: ConfigError) -> Self {
        match e {
            ConfigError::FileNotFound => Self::FileNotFound,
            ConfigError::ParseError => Self::ParseError,
            ConfigError::InvalidVersion => Self::InvalidVersion,
            ConfigError::InvalidSchema => Self::InvalidSchema,
            ConfigError::MissingRequired => Self::MissingRequired,
            _ => Self::InvalidValue,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ValueType {
    Int,
    Bool,
    String,
    Float,
    Array,
    Object,
}

impl ValueType {
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "int" => Some(Self::Int),
            "bool" => Some(Self::Bool),
            "string" => Some(Self::String),
            "float" => Some(Self::Float),
            "array" => Some(Self::Array),
            "object" => Some(Self::Object),
            _ => None,
        }
    }

    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Int => "int",
            Self::Bool => "bool",
            Self::String => "string",
            Self::Float => "float",
            Self::Array => "array",
            Self::Object => "object",
        }
    }

    /// Floats accept integers; ints do not accept floats.
    pub fn matches(self, v: &Value) -> bool {
        match self {
            Self::Int => v.is_i64() || v.is_u64(),
            Self::Bool => v.is_boolean(),
            Self::String => v.is_string(),
            Self::Float => v.is_number(),
            Self::Array => v.is_array(),
            Self::Object => v.is_object(),
        }
    }

    const fn json_schema_type(self) -> &'static str {
        match self {
            Self::Int => "integer",
            Self::Bool => "boolean",
            Self::String => "string",
            Self::Float => "number",
            Self::Array => "array",
            Self::Object => "object",
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ValidationRule {
    pub path: String,
    pub value_type: ValueType,
    pub required: bool,
    pub default: Option<Value>,
    pub min: Option<f64>,
    pub max: Option<f64>,
    pub allowed: Vec<String>,
}

impl ValidationRule {
    pub fn new(path: &str, value_type: ValueType) -> Self {
        Self {
            path: path.to_string(),
            value_type,
            required: false,
            default: None,
            min: None,
            max: None,
            allowed: Vec::new(),
        }
    }

    #[must_use]
    pub fn required(mut self) -> Self {
        self.required = true;
        self
    }

    #[must_use]
    pub fn range(mut self, min: f64, max: f64) -> Self {
        self.min = Some(min);
        self.max = Some(max);
        self
    }

    #[must_use]
    pub fn one_of(mut self, allowed: &[&str]) -> Self {
        self.allowed = allowed.iter().map(|s| (*s).to_string()).collect();
        self
    }

    #[must_use]
    pub fn with_default(mut self, value: Value) -> Self {
        self.default = Some(value);
        self
    }

    /// Type, range and enum check of a present value.
    fn accepts(&self, v: &Value) -> bool {
        if !self.value_type.matches(v) {
            return false;
        }
        if let Some(n) = v.as_f64() {
            if self.min.is_some_and(|m| n < m) || self.max.is_some_and(|m| n > m) {
                return false;
            }
        }
        if !self.allowed.is_empty() {
            return v.as_str().is_some_and(|s| self.allowed.iter().any(|a| a == s));
        }
        true
    }
}

pub const MODULE_STATES: [&str; 3] = ["enabled", "disabled", "error"];

/// The rule table used unless callers add their own.
pub fn default_rules() -> Vec<ValidationRule> {
    use ValueType::*;
    let mut rules = vec![
        ValidationRule::new("version", String).required(),
        ValidationRule::new("modules", Object).required(),
        ValidationRule::new("modules.*.state", String)
            .required()
            .one_of(&MODULE_STATES)
            .with_default(json!("enabled")),
        ValidationRule::new("modules.*.priority", Int)
            .required()
            .range(0.0, 255.0)
            .with_default(json!(0)),
        ValidationRule::new("modules.*.version", String)
            .required()
            .with_default(json!("1.0.0")),
    ];
    for flag in ["autostart", "debug", "critical"] {
        rules.push(ValidationRule::new(&format!("modules.*.{flag}"), Bool));
    }
    rules.extend([
        ValidationRule::new("modules.*.freertos.task.stack", Int).range(1024.0, 65536.0),
        ValidationRule::new("modules.*.freertos.task.priority", Int).range(0.0, 24.0),
        ValidationRule::new("modules.*.freertos.task.core", Int).range(-1.0, 1.0),
        ValidationRule::new("modules.*.freertos.queue.length", Int).range(1.0, 64.0),
        ValidationRule::new("system.watchdog.timeout_ms", Int).range(1000.0, 120_000.0),
    ]);
    rules
}

#[derive(Debug, Clone)]
pub struct Validator {
    rules: Vec<ValidationRule>,
}

impl Default for Validator {
    fn default() -> Self {
        Self { rules: default_rules() }
    }
}

impl Validator {
    pub fn empty() -> Self {
        Self { rules: Vec::new() }
    }

    pub fn rules(&self) -> &[ValidationRule] {
        &self.rules
    }

    pub fn add_rule(&mut self, rule: ValidationRule) {
        self.rules.push(rule);
    }

    pub fn validate(&self, doc: &Value) -> ValidationResult {
        if let Err(r) = check_version(doc) {
            return r;
        }
        if let Err(r) = check_schema(doc) {
            return r;
        }
        for rule in self.rules.iter().filter(|r| r.required) {
            if path::expand(doc, &rule.path).iter().any(|(_, v)| v.is_none()) {
                log::debug!("Config: missing required '{}'", rule.path);
                return ValidationResult::MissingRequired;
            }
        }
        for rule in &self.rules {
            for (p, v) in path::expand(doc, &rule.path) {
                if let Some(v) = v {
                    if !rule.accepts(v) {
                        log::debug!("Config: invalid value at '{}': {}", p, v);
                        return ValidationResult::InvalidValue;
                    }
                }
            }
        }
        ValidationResult::Valid
    }

    /// Validate a single module-config object against the `modules.*.`
    /// rules.
    pub fn validate_module(&self, module: &Value) -> ValidationResult {
        let Some(obj) = module.as_object() else {
            return ValidationResult::InvalidSchema;
        };
        if !["state", "priority", "version"].iter().all(|k| obj.contains_key(*k)) {
            return ValidationResult::InvalidSchema;
        }
        for rule in &self.rules {
            let Some(sub) = rule.path.strip_prefix("modules.*.") else {
                continue;
            };
            for (_, v) in path::expand(module, sub) {
                match v {
                    None if rule.required => return ValidationResult::MissingRequired,
                    Some(v) if !rule.accepts(v) => return ValidationResult::InvalidValue,
                    _ => {}
                }
            }
        }
        ValidationResult::Valid
    }

    /// Fill every absent rule path that has a default. Wildcard rules are
    /// applied to each existing key. Returns the number of values written.
    pub fn apply_defaults(&self, doc: &mut Value) -> usize {
        let mut written = 0;
        for rule in &self.rules {
            let Some(default) = &rule.default else {
                continue;
            };
            let missing: Vec<String> = path::expand(doc, &rule.path)
                .into_iter()
                .filter_map(|(p, v)| v.is_none().then_some(p))
                .collect();
            for p in missing {
                if path::set(doc, &p, default.clone()).is_ok() {
                    written += 1;
                }
            }
        }
        written
    }

    /// Draft-07 document describing the rule table. Runtime checks always
    /// come from the table itself.
    pub fn schema_document(&self) -> Value {
        let mut root = json!({
            "$schema": "http://json-schema.org/draft-07/schema#",
            "type": "object",
            "properties": {},
            "required": [],
        });
        for rule in &self.rules {
            let mut node = &mut root;
            let parts: Vec<&str> = rule.path.split('.').collect();
            for (i, seg) in parts.iter().enumerate() {
                let leaf = i + 1 == parts.len();
                let obj = match node.as_object_mut() {
                    Some(o) => o,
                    None => break,
                };
                if rule.required && leaf && *seg != "*" {
                    if let Some(Value::Array(req)) = obj.get_mut("required") {
                        if !req.iter().any(|r| r == seg) {
                            req.push(json!(seg));
                        }
                    }
                }
                let key = if *seg == "*" { "additionalProperties" } else { "properties" };
                let container = if *seg == "*" {
                    obj.entry(key).or_insert_with(|| json!({ "type": "object", "properties": {}, "required": [] }))
                } else {
                    let props = obj.entry(key).or_insert_with(|| Value::Object(Map::new()));
                    match props.as_object_mut() {
                        Some(p) => p
                            .entry((*seg).to_string())
                            .or_insert_with(|| json!({ "type": "object", "properties": {}, "required": [] })),
                        None => break,
                    }
                };
                if leaf {
                    container["type"] = json!(rule.value_type.json_schema_type());
                    if let Some(min) = rule.min {
                        container["minimum"] = json!(min);
                    }
                    if let Some(max) = rule.max {
                        container["maximum"] = json!(max);
                    }
                    if !rule.allowed.is_empty() {
                        container["enum"] = json!(rule.allowed);
                    }
                    if let Some(d) = &rule.default {
                        container["default"] = d.clone();
                    }
                }
                node = container;
            }
        }
        root
    }
}

fn check_version(doc: &Value) -> Result<(), ValidationResult> {
    let Some(raw) = doc.get("version").and_then(Value::as_str) else {
        // Shape problem, reported by the schema check.
        return Ok(());
    };
    let v = Version::parse(raw).ok_or(ValidationResult::InvalidVersion)?;
    if v < MIN_VERSION || v > CURRENT_VERSION {
        log::debug!("Config: version {} outside {}..={}", v, MIN_VERSION, CURRENT_VERSION);
        return Err(ValidationResult::InvalidVersion);
    }
    Ok(())
}

fn check_schema(doc: &Value) -> Result<(), ValidationResult> {
    let root = doc.as_object().ok_or(ValidationResult::InvalidSchema)?;
    if !root.get("version").is_some_and(Value::is_string) {
        return Err(ValidationResult::InvalidSchema);
    }
    let modules = root
        .get("modules")
        .and_then(Value::as_object)
        .ok_or(ValidationResult::InvalidSchema)?;
    for (name, m) in modules {
        let ok = m
            .as_object()
            .is_some_and(|o| ["state", "priority", "version"].iter().all(|k| o.contains_key(*k)));
        if !ok {
            log::debug!("Config: module '{}' lacks state/priority/version", name);
            return Err(ValidationResult::InvalidSchema);
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn doc() -> Value {
        json!({
            "version": "2.0.0",
            "modules": {
                "CONTROL_FS": { "state": "enabled", "priority": 100, "version": "1.0.0" }
            }
        })
    }

    #[test]
    fn valid_document_passes() {
        assert_eq!(Validator::default().validate(&doc()), ValidationResult::Valid);
    }

    #[test]
    fn rejection_order() {
        let v = Validator::default();

        let mut d = doc();
        d["version"] = json!("9.9.9");
        assert_eq!(v.validate(&d), ValidationResult::InvalidVersion);
        d["version"] = json!("0.9.0");
        assert_eq!(v.validate(&d), ValidationResult::InvalidVersion);
        d["version"] = json!("two");
        assert_eq!(v.validate(&d), ValidationResult::InvalidVersion);

        let mut d = doc();
        d.as_object_mut().unwrap().remove("modules");
        assert_eq!(v.validate(&d), ValidationResult::InvalidSchema);

        let mut d = doc();
        d.as_object_mut().unwrap().remove("version");
        assert_eq!(v.validate(&d), ValidationResult::InvalidSchema);

        let mut d = doc();
        d["modules"]["X"] = json!({ "state": "banana", "priority": 1, "version": "1.0.0" });
        assert_eq!(v.validate(&d), ValidationResult::InvalidValue);

        let mut d = doc();
        d["modules"]["CONTROL_FS"]["priority"] = json!(256);
        assert_eq!(v.validate(&d), ValidationResult::InvalidValue);

        let mut d = doc();
        d["system"] = json!({ "watchdog": { "timeout_ms": 10 } });
        assert_eq!(v.validate(&d), ValidationResult::InvalidValue);
    }

    #[test]
    fn custom_required_rule() {
        let mut v = Validator::default();
        v.add_rule(ValidationRule::new("system.name", ValueType::String).required());
        assert_eq!(v.validate(&doc()), ValidationResult::MissingRequired);
        let mut d = doc();
        d["system"] = json!({ "name": 5 });
        assert_eq!(v.validate(&d), ValidationResult::InvalidValue);
    }

    #[test]
    fn module_validation() {
        let v = Validator::default();
        assert_eq!(
            v.validate_module(&json!({"state": "enabled", "priority": 5, "version": "1.0.0"})),
            ValidationResult::Valid
        );
        assert_eq!(v.validate_module(&json!({"state": "enabled"})), ValidationResult::InvalidSchema);
        assert_eq!(
            v.validate_module(&json!({"state": "on", "priority": 5, "version": "1.0.0"})),
            ValidationResult::InvalidValue
        );
        assert_eq!(
            v.validate_module(&json!({"state": "enabled", "priority": 5, "version": "1.0.0",
                                      "freertos": {"task": {"core": 2}}})),
            ValidationResult::InvalidValue
        );
    }

    #[test]
    fn defaults_fill_module_fields() {
        let mut d = json!({ "version": "2.0.0", "modules": { "M": {} } });
        let v = Validator::default();
        assert_eq!(v.validate(&d), ValidationResult::InvalidSchema);
        assert_eq!(v.apply_defaults(&mut d), 3);
        assert_eq!(d["modules"]["M"]["state"], "enabled");
        assert_eq!(v.validate(&d), ValidationResult::Valid);
        assert_eq!(v.apply_defaults(&mut d), 0);
    }

    #[test]
    fn result_codes_and_errors() {
        assert_eq!(ValidationResult::InvalidVersion.code(), "CONFIG_INVALID_VERSION");
        assert_eq!(ValidationResult::Valid.into_result(), Ok(()));
        assert_eq!(ValidationResult::InvalidValue.into_result(), Err(ConfigError::InvalidValue));
        assert_eq!(ValidationResult::from(ConfigError::ParseError), ValidationResult::ParseError);
    }

    #[test]
    fn schema_document_shape() {
        let s = Validator::default().schema_document();
        assert_eq!(s["$schema"], "http://json-schema.org/draft-07/schema#");
        assert_eq!(s["properties"]["version"]["type"], "string");
        let module = &s["properties"]["modules"]["additionalProperties"];
        assert_eq!(module["properties"]["priority"]["maximum"], 255.0);
        assert_eq!(module["properties"]["state"]["enum"], json!(["enabled", "disabled", "error"]));
        assert!(s["required"].as_array().unwrap().contains(&json!("modules")));
    }
}
