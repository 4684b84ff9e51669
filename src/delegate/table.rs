//! Declarative delegate backed by a JSON table.
//!
//! The loaded code is a JSON object mapping method names to the value each
//! method returns:
//!
//! ```json
//! {
//!   "resolver::source": "filesystem",
//!   "overlay.text": "(c) Example Museum",
//!   "extra_cache_key_options": {"watermark": "v2"}
//! }
//! ```
//!
//! Names are normalized through [`MethodName`], so `a.b` and `a::b` denote
//! the same method. Arguments are ignored.

use super::{DelegateError, DelegateProvider, MethodName};
use serde_json::{Map, Value};
use std::collections::HashMap;

#[derive(Debug, Default, Clone)]
pub struct TableDelegate {
    methods: HashMap<String, Value>,
}

impl TableDelegate {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.methods.len()
    }

    pub fn is_empty(&self) -> bool {
        self.methods.is_empty()
    }

    fn parse_table(code: &str) -> Result<HashMap<String, Value>, DelegateError> {
        let table: Map<String, Value> = match serde_json::from_str(code) {
            Ok(Value::Object(table)) => table,
            Ok(_) => return Err(DelegateError::Load("expected a JSON object".into())),
            Err(e) => return Err(DelegateError::Load(e.to_string())),
        };
        table
            .into_iter()
            .map(|(name, value)| {
                let name = MethodName::parse(&name)
                    .map_err(|e| DelegateError::Load(e.to_string()))?;
                Ok((name.qualified(), value))
            })
            .collect()
    }
}

impl DelegateProvider for TableDelegate {
    fn load(&mut self, code: &str) -> Result<(), DelegateError> {
        self.methods = Self::parse_table(code)?;
        Ok(())
    }

    fn invoke(&self, method: &MethodName, _args: &[Value]) -> Result<Value, DelegateError> {
        self.methods
            .get(&method.qualified())
            .cloned()
            .ok_or_else(|| DelegateError::MethodNotFound(method.qualified()))
    }
}
