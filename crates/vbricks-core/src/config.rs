//! Typed per-brick configuration.
//!
//! Every brick type declares a schema of [`Parameter`]s. A [`Config`] holds
//! one [`Value`] per parameter and converts values to and from the strings
//! used by the console grammar and the project file.

use crate::error::{CoreError, Result};
use std::collections::BTreeMap;
use std::fmt::Write as _;

// ============================================================================
// Parameters and values
// ============================================================================

/// Type and default of a configuration key.
#[derive(Debug, Clone, PartialEq)]
pub enum Parameter {
    /// Unbounded integer.
    Integer(i64),
    /// Integer constrained to `[min, max]`.
    SpinInt {
        /// Default value
        default: i64,
        /// Smallest accepted value
        min: i64,
        /// Largest accepted value
        max: i64,
    },
    /// Floating point number.
    Float(f64),
    /// Free-form string.
    Str(&'static str),
    /// `True`/`False` flag.
    Boolean(bool),
    /// Reference to another engine object (disk image, event). Never persisted.
    Object,
}

/// A configuration value.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Int(i64),
    Float(f64),
    Str(String),
    Bool(bool),
    /// Name of the referenced object, if bound.
    Object(Option<String>),
}

impl Value {
    /// String content, empty for non-string values.
    pub fn as_str(&self) -> &str {
        match self {
            Value::Str(s) => s,
            Value::Object(Some(s)) => s,
            _ => "",
        }
    }

    /// Integer content, `0` for non-integer values.
    pub fn as_int(&self) -> i64 {
        match self {
            Value::Int(i) => *i,
            Value::Float(f) => *f as i64,
            _ => 0,
        }
    }

    /// Boolean content, `false` for non-boolean values.
    pub fn as_bool(&self) -> bool {
        matches!(self, Value::Bool(true))
    }

    /// Float content.
    pub fn as_float(&self) -> f64 {
        match self {
            Value::Float(f) => *f,
            Value::Int(i) => *i as f64,
            _ => 0.0,
        }
    }
}

impl Parameter {
    /// The value a fresh config holds for this parameter.
    pub fn default_value(&self) -> Value {
        match self {
            Parameter::Integer(d) => Value::Int(*d),
            Parameter::SpinInt { default, .. } => Value::Int(*default),
            Parameter::Float(d) => Value::Float(*d),
            Parameter::Str(d) => Value::Str((*d).to_string()),
            Parameter::Boolean(d) => Value::Bool(*d),
            Parameter::Object => Value::Object(None),
        }
    }

    /// Render a value in the textual form read back by [`from_string`](Self::from_string).
    pub fn to_string(&self, value: &Value) -> String {
        match value {
            Value::Int(i) => i.to_string(),
            Value::Float(f) => f.to_string(),
            Value::Str(s) => s.clone(),
            Value::Bool(true) => "True".into(),
            Value::Bool(false) => "False".into(),
            Value::Object(name) => name.clone().unwrap_or_default(),
        }
    }

    /// Parse text into a value of this parameter's type.
    pub fn from_string(&self, key: &str, text: &str) -> Result<Value> {
        let trimmed = text.trim();
        match self {
            Parameter::Integer(_) => trimmed
                .parse()
                .map(Value::Int)
                .map_err(|_| CoreError::invalid_value(key, format!("{text:?} is not an integer"))),
            Parameter::SpinInt { min, max, .. } => {
                let n: i64 = trimmed.parse().map_err(|_| {
                    CoreError::invalid_value(key, format!("{text:?} is not an integer"))
                })?;
                if n < *min || n > *max {
                    return Err(CoreError::invalid_value(
                        key,
                        format!("{n} is out of range [{min}, {max}]"),
                    ));
                }
                Ok(Value::Int(n))
            }
            Parameter::Float(_) => trimmed
                .parse()
                .map(Value::Float)
                .map_err(|_| CoreError::invalid_value(key, format!("{text:?} is not a number"))),
            Parameter::Str(_) => Ok(Value::Str(text.to_string())),
            Parameter::Boolean(_) => match trimmed.to_ascii_lowercase().as_str() {
                "true" | "1" | "*" | "on" | "yes" => Ok(Value::Bool(true)),
                "false" | "0" | "" | "off" | "no" => Ok(Value::Bool(false)),
                _ => Err(CoreError::invalid_value(
                    key,
                    format!("{text:?} is not a boolean"),
                )),
            },
            Parameter::Object => Ok(Value::Object(
                (!trimmed.is_empty()).then(|| trimmed.to_string()),
            )),
        }
    }

    /// Check that `value` has the variant this parameter stores.
    fn accepts(&self, value: &Value) -> bool {
        matches!(
            (self, value),
            (Parameter::Integer(_) | Parameter::SpinInt { .. }, Value::Int(_))
                | (Parameter::Float(_), Value::Float(_))
                | (Parameter::Str(_), Value::Str(_))
                | (Parameter::Boolean(_), Value::Bool(_))
                | (Parameter::Object, Value::Object(_))
        )
    }
}

// ============================================================================
// Line cursor
// ============================================================================

/// Forward-only cursor over the lines of a project file.
///
/// Section parsers stop in front of the first line they do not own, so the
/// caller resumes exactly there.
#[derive(Debug)]
pub struct LineCursor {
    lines: Vec<String>,
    pos: usize,
}

impl LineCursor {
    pub fn new(text: &str) -> Self {
        Self {
            lines: text.lines().map(|l| l.trim_end_matches('\r').to_string()).collect(),
            pos: 0,
        }
    }

    /// Next line without consuming it.
    pub fn peek(&self) -> Option<&str> {
        self.lines.get(self.pos).map(String::as_str)
    }

    /// Consume and return the next line.
    pub fn next_line(&mut self) -> Option<String> {
        let line = self.lines.get(self.pos).cloned();
        if line.is_some() {
            self.pos += 1;
        }
        line
    }

    /// 1-based number of the line most recently consumed.
    pub fn line_no(&self) -> usize {
        self.pos
    }
}

/// Split `key=value` at the first `=`, when the key is an identifier.
pub fn split_assignment(line: &str) -> Option<(&str, &str)> {
    let (key, value) = line.split_once('=')?;
    let key = key.trim();
    if key.is_empty() || !key.chars().all(|c| c.is_ascii_alphanumeric() || c == '_') {
        return None;
    }
    Some((key, value))
}

// ============================================================================
// Config
// ============================================================================

#[derive(Debug, Clone)]
struct Entry {
    param: Parameter,
    value: Value,
}

/// Typed key/value map built from a brick type's schema.
#[derive(Debug, Clone)]
pub struct Config {
    entries: BTreeMap<String, Entry>,
}

impl Config {
    /// Build a config holding the default of every parameter in `schema`.
    pub fn new(schema: &[(&str, Parameter)]) -> Self {
        let entries = schema
            .iter()
            .map(|(key, param)| {
                (
                    (*key).to_string(),
                    Entry {
                        value: param.default_value(),
                        param: param.clone(),
                    },
                )
            })
            .collect();
        Self { entries }
    }

    /// Add a parameter after construction (VM NIC keys, per-disk keys).
    pub fn add_parameter(&mut self, key: &str, param: Parameter) {
        self.entries.entry(key.to_string()).or_insert_with(|| Entry {
            value: param.default_value(),
            param,
        });
    }

    pub fn contains(&self, key: &str) -> bool {
        self.entries.contains_key(key)
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.entries.get(key).map(|e| &e.value)
    }

    pub fn parameter(&self, key: &str) -> Option<&Parameter> {
        self.entries.get(key).map(|e| &e.param)
    }

    /// String value of `key`, empty if missing.
    pub fn str(&self, key: &str) -> &str {
        self.get(key).map(Value::as_str).unwrap_or("")
    }

    /// Integer value of `key`, `0` if missing.
    pub fn int(&self, key: &str) -> i64 {
        self.get(key).map(Value::as_int).unwrap_or(0)
    }

    /// Boolean value of `key`, `false` if missing.
    pub fn bool(&self, key: &str) -> bool {
        self.get(key).map(Value::as_bool).unwrap_or(false)
    }

    /// Store a typed value. The variant must match the parameter type.
    pub fn set_value(&mut self, key: &str, value: Value) -> Result<()> {
        let entry = self
            .entries
            .get_mut(key)
            .ok_or_else(|| CoreError::invalid_value(key, "unknown parameter"))?;
        if !entry.param.accepts(&value) {
            return Err(CoreError::invalid_value(key, "wrong value type"));
        }
        if let (Parameter::SpinInt { min, max, .. }, Value::Int(n)) = (&entry.param, &value) {
            if n < min || n > max {
                return Err(CoreError::invalid_value(
                    key,
                    format!("{n} is out of range [{min}, {max}]"),
                ));
            }
        }
        entry.value = value;
        Ok(())
    }

    /// Parse `text` with the parameter's type and store it.
    pub fn set_string(&mut self, key: &str, text: &str) -> Result<Value> {
        let entry = self
            .entries
            .get_mut(key)
            .ok_or_else(|| CoreError::invalid_value(key, "unknown parameter"))?;
        let value = entry.param.from_string(key, text)?;
        entry.value = value.clone();
        Ok(value)
    }

    /// Apply a console assignment `key=value`.
    ///
    /// Everything after the first `=` is the value, so values may contain
    /// `=` themselves. One pair of surrounding quotes is stripped.
    pub fn set(&mut self, assignment: &str) -> Result<(String, Value)> {
        let (key, raw) = parse_assignment(assignment)?;
        let value = self.set_string(&key, &raw)?;
        Ok((key, value))
    }

    /// Textual value of `key`.
    pub fn to_string(&self, key: &str) -> Option<String> {
        self.entries.get(key).map(|e| e.param.to_string(&e.value))
    }

    pub fn is_default(&self, key: &str) -> bool {
        self.entries
            .get(key)
            .map(|e| e.value == e.param.default_value())
            .unwrap_or(true)
    }

    /// Keys in sorted order.
    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.entries.keys().map(String::as_str)
    }

    /// `(key, text)` for every non-Object parameter, sorted by key.
    pub fn string_pairs(&self) -> Vec<(String, String)> {
        self.entries
            .iter()
            .filter(|(_, e)| e.param != Parameter::Object)
            .map(|(k, e)| (k.clone(), e.param.to_string(&e.value)))
            .collect()
    }

    /// Write a `[Type:Name]` section with non-default, non-Object values.
    pub fn save_to(&self, out: &mut String, type_name: &str, name: &str) {
        let _ = writeln!(out, "[{type_name}:{name}]");
        for (key, entry) in &self.entries {
            if entry.param == Parameter::Object || entry.value == entry.param.default_value() {
                continue;
            }
            let _ = writeln!(out, "{key}={}", entry.param.to_string(&entry.value));
        }
    }

    /// Read `key=value` lines until the end of the section.
    ///
    /// Stops on EOF, a blank or comment line (consumed), or any other line
    /// that is not an assignment, such as the next `[...]` header (left for
    /// the caller). Keys missing from the schema are returned for the
    /// caller to interpret. Values that fail to parse are logged and
    /// skipped.
    pub fn load_from(&mut self, cursor: &mut LineCursor) -> Vec<(String, String)> {
        let mut unknown = Vec::new();
        while let Some(line) = cursor.peek() {
            let trimmed = line.trim();
            if trimmed.is_empty() || trimmed.starts_with('#') || trimmed.starts_with(';') {
                cursor.next_line();
                break;
            }
            let Some((key, value)) = split_assignment(line) else {
                break;
            };
            let (key, value) = (key.to_string(), value.to_string());
            cursor.next_line();
            if !self.contains(&key) {
                unknown.push((key, value));
                continue;
            }
            if let Err(e) = self.set_string(&key, &value) {
                tracing::warn!(line = cursor.line_no(), error = %e, "Skipping config value");
            }
        }
        unknown
    }
}

/// Split a console assignment into key and unquoted value.
pub fn parse_assignment(assignment: &str) -> Result<(String, String)> {
    let (key, value) = assignment
        .split_once('=')
        .ok_or_else(|| CoreError::invalid_value(assignment, "expected key=value"))?;
    let key = key.trim();
    if key.is_empty() {
        return Err(CoreError::invalid_value(assignment, "empty key"));
    }
    Ok((key.to_string(), unquote(value.trim()).to_string()))
}

fn unquote(s: &str) -> &str {
    for q in ['"', '\''] {
        if s.len() >= 2 && s.starts_with(q) && s.ends_with(q) {
            return &s[1..s.len() - 1];
        }
    }
    s
}

#[cfg(test)]
mod tests {
    use super::*;

    fn schema() -> Vec<(&'static str, Parameter)> {
        vec![
            ("numports", Parameter::SpinInt { default: 32, min: 1, max: 128 }),
            ("hub", Parameter::Boolean(false)),
            ("name", Parameter::Str("")),
            ("delay", Parameter::Integer(0)),
            ("ratio", Parameter::Float(1.0)),
            ("hda", Parameter::Object),
        ]
    }

    #[test]
    fn test_spinint_range() {
        let p = Parameter::SpinInt { default: 32, min: 1, max: 128 };
        assert!(matches!(
            p.from_string("numports", "200"),
            Err(CoreError::InvalidValue { .. })
        ));
        assert_eq!(p.from_string("numports", "64").unwrap(), Value::Int(64));
    }

    #[test]
    fn test_values_survive_text_form() {
        let cases = [
            (Parameter::Integer(0), Value::Int(-17)),
            (Parameter::SpinInt { default: 32, min: 1, max: 128 }, Value::Int(128)),
            (Parameter::Float(0.0), Value::Float(2.5)),
            (Parameter::Str(""), Value::Str("a=b c".into())),
            (Parameter::Boolean(false), Value::Bool(true)),
            (Parameter::Boolean(true), Value::Bool(false)),
        ];
        for (param, value) in cases {
            let text = param.to_string(&value);
            assert_eq!(param.from_string("k", &text).unwrap(), value);
        }
    }

    #[test]
    fn test_boolean_spellings() {
        let p = Parameter::Boolean(false);
        assert_eq!(p.from_string("k", "True").unwrap(), Value::Bool(true));
        assert_eq!(p.from_string("k", "*").unwrap(), Value::Bool(true));
        assert_eq!(p.from_string("k", "").unwrap(), Value::Bool(false));
        assert!(p.from_string("k", "maybe").is_err());
    }

    #[test]
    fn test_set_greedy_value() {
        let mut config = Config::new(&schema());
        let (key, value) = config.set("name=\"a=b=c\"").unwrap();
        assert_eq!(key, "name");
        assert_eq!(value, Value::Str("a=b=c".into()));
        assert!(config.set("numports").is_err());
        assert!(config.set("bogus=1").is_err());
    }

    #[test]
    fn test_save_skips_defaults_and_objects() {
        let mut config = Config::new(&schema());
        config.set("numports=64").unwrap();
        config.set("hub=True").unwrap();
        config.set_value("hda", Value::Object(Some("disk".into()))).unwrap();

        let mut out = String::new();
        config.save_to(&mut out, "Switch", "sw1");
        assert_eq!(out, "[Switch:sw1]\nhub=True\nnumports=64\n");
    }

    #[test]
    fn test_load_stops_at_next_section() {
        let text = "hub=True\nnumports=8\nhomehost=10.0.0.1\n[Wire:w1]\nhub=False\n";
        let mut cursor = LineCursor::new(text);
        let mut config = Config::new(&schema());
        let unknown = config.load_from(&mut cursor);

        assert!(config.bool("hub"));
        assert_eq!(config.int("numports"), 8);
        assert_eq!(unknown, vec![("homehost".to_string(), "10.0.0.1".to_string())]);
        assert_eq!(cursor.peek(), Some("[Wire:w1]"));
    }

    #[test]
    fn test_load_stops_at_link_record() {
        let mut cursor = LineCursor::new("numports=4\nlink|w1|sw1_port\n");
        let mut config = Config::new(&schema());
        config.load_from(&mut cursor);
        assert_eq!(cursor.peek(), Some("link|w1|sw1_port"));
    }
}
