//! `%{name}` variable tables.
//!
//! Variables may reference each other. A table is resolved once, after
//! all layers are composed, and then used to expand environment values,
//! config strings and public data.

use crate::ConfigMap;
use indexmap::IndexMap;
use once_cell::sync::Lazy;
use regex::Regex;
use serde_json::Value;

static VARIABLE_REF: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"%\{([a-zA-Z][a-zA-Z0-9_-]*)\}").expect("valid variable regex")
});

/// Variable expansion errors
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum VariableError {
    /// A reference to a variable nobody defines
    #[error("undefined variable '{name}' referenced in '{referenced_by}'")]
    Undefined {
        /// Missing variable
        name: String,
        /// Variable or text containing the reference
        referenced_by: String,
    },

    /// Variables that reference each other in a loop
    #[error("circular variable reference: {}", chain.join(" -> "))]
    Cycle {
        /// The loop, first variable repeated at the end
        chain: Vec<String>,
    },
}

/// A fully resolved variable table
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Variables {
    values: IndexMap<String, String>,
}

impl Variables {
    /// Resolve a raw table whose values may contain `%{...}` references
    ///
    /// # Errors
    ///
    /// Returns error on undefined or circular references
    pub fn resolve(raw: &IndexMap<String, String>) -> Result<Self, VariableError> {
        let mut done = IndexMap::with_capacity(raw.len());
        let mut stack = Vec::new();
        for name in raw.keys() {
            expand(name, raw, &mut done, &mut stack)?;
        }

        // Keep declaration order rather than resolution order
        let values = raw
            .keys()
            .filter_map(|k| done.get(k).map(|v| (k.clone(), v.clone())))
            .collect();
        Ok(Self { values })
    }

    /// Look up a resolved value
    #[must_use]
    pub fn get(&self, name: &str) -> Option<&str> {
        self.values.get(name).map(String::as_str)
    }

    /// Iterate in declaration order
    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.values.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    /// Number of variables
    #[must_use]
    pub fn len(&self) -> usize {
        self.values.len()
    }

    /// Check if the table is empty
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    /// Expand every reference in `text`
    ///
    /// # Errors
    ///
    /// Returns error if `text` references an undefined variable
    pub fn subst(&self, text: &str) -> Result<String, VariableError> {
        replace_refs(text, |name| {
            self.get(name)
                .map(str::to_string)
                .ok_or_else(|| VariableError::Undefined {
                    name: name.to_string(),
                    referenced_by: text.to_string(),
                })
        })
    }

    /// Expand every string inside a config value, recursively
    ///
    /// # Errors
    ///
    /// Returns error on the first undefined reference
    pub fn subst_value(&self, value: &Value) -> Result<Value, VariableError> {
        Ok(match value {
            Value::String(s) => Value::String(self.subst(s)?),
            Value::Array(items) => Value::Array(
                items
                    .iter()
                    .map(|v| self.subst_value(v))
                    .collect::<Result<_, _>>()?,
            ),
            Value::Object(map) => Value::Object(self.subst_map(map)?),
            other => other.clone(),
        })
    }

    /// Expand every string inside a config map
    ///
    /// # Errors
    ///
    /// Returns error on the first undefined reference
    pub fn subst_map(&self, map: &ConfigMap) -> Result<ConfigMap, VariableError> {
        map.iter()
            .map(|(k, v)| self.subst_value(v).map(|value| (k.clone(), value)))
            .collect()
    }
}

fn expand(
    name: &str,
    raw: &IndexMap<String, String>,
    done: &mut IndexMap<String, String>,
    stack: &mut Vec<String>,
) -> Result<String, VariableError> {
    if let Some(value) = done.get(name) {
        return Ok(value.clone());
    }
    if let Some(pos) = stack.iter().position(|s| s == name) {
        let mut chain = stack[pos..].to_vec();
        chain.push(name.to_string());
        return Err(VariableError::Cycle { chain });
    }
    let Some(template) = raw.get(name) else {
        return Err(VariableError::Undefined {
            name: name.to_string(),
            referenced_by: stack.last().cloned().unwrap_or_default(),
        });
    };

    stack.push(name.to_string());
    let value = replace_refs(template, |inner| expand(inner, raw, done, stack))?;
    stack.pop();

    done.insert(name.to_string(), value.clone());
    Ok(value)
}

fn replace_refs(
    text: &str,
    mut lookup: impl FnMut(&str) -> Result<String, VariableError>,
) -> Result<String, VariableError> {
    let mut out = String::with_capacity(text.len());
    let mut last = 0;
    for caps in VARIABLE_REF.captures_iter(text) {
        let (Some(whole), Some(name)) = (caps.get(0), caps.get(1)) else {
            continue;
        };
        out.push_str(&text[last..whole.start()]);
        out.push_str(&lookup(name.as_str())?);
        last = whole.end();
    }
    out.push_str(&text[last..]);
    Ok(out)
}

/// Names referenced by `text`, in order of appearance
#[must_use]
pub fn references(text: &str) -> Vec<&str> {
    VARIABLE_REF
        .captures_iter(text)
        .filter_map(|c| c.get(1).map(|m| m.as_str()))
        .collect()
}
