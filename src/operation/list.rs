//! [`OperationList`]: the unit of cache addressing.
//!
//! An operation list is built incrementally by request handling code, then
//! usually [frozen](OperationList::freeze) before it is handed to the cache
//! and the representation layer. Every mutator checks the frozen flag first
//! and fails with [`OperationError::Immutable`] without touching state.
//!
//! # Canonical state
//!
//! Equality, ordering, hashing, the display string and the cache key are all
//! derived from the same canonical parts:
//!
//! ```text
//! identifier
//! <kind>:<fragment>     for every operation whose has_effect() is true, in order
//! <key>:<value>         for every option, sorted by key
//! ```
//!
//! Operations without effect never influence any of them, so a list carrying
//! an extra `rotate:0` is the same derivative as one without it.

use super::{Dimensions, Operation, OperationError, OperationKind};
use crate::cache::content_hash;
use crate::format::{Format, Identifier};
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use std::cmp::Ordering;
use std::collections::BTreeMap;
use std::fmt;
use std::hash::{Hash, Hasher};

/// Separator between canonical parts.
const SEPARATOR: &str = "_";

/// Ordered chain of operations plus the metadata identifying a derivative.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OperationList {
    identifier: Identifier,
    #[serde(default)]
    operations: Vec<Operation>,
    output_format: Format,
    /// Auxiliary options (e.g. delegate-supplied cache-key components).
    #[serde(default)]
    options: BTreeMap<String, String>,
    #[serde(skip)]
    frozen: bool,
}

impl OperationList {
    pub fn new(identifier: impl Into<Identifier>, output_format: Format) -> Self {
        Self {
            identifier: identifier.into(),
            operations: Vec::new(),
            output_format,
            options: BTreeMap::new(),
            frozen: false,
        }
    }

    // =========================================================================
    // Freezing and mutation
    // =========================================================================

    /// Make the list permanently read-only. Idempotent.
    pub fn freeze(&mut self) {
        self.frozen = true;
    }

    pub fn is_frozen(&self) -> bool {
        self.frozen
    }

    fn ensure_mutable(&self) -> Result<(), OperationError> {
        if self.frozen {
            Err(OperationError::Immutable)
        } else {
            Ok(())
        }
    }

    /// Append an operation to the end of the chain.
    pub fn add(&mut self, op: impl Into<Operation>) -> Result<(), OperationError> {
        self.ensure_mutable()?;
        self.operations.push(op.into());
        Ok(())
    }

    /// Remove every operation.
    pub fn clear(&mut self) -> Result<(), OperationError> {
        self.ensure_mutable()?;
        self.operations.clear();
        Ok(())
    }

    /// Keep only the operations for which `keep` returns true.
    pub fn retain(&mut self, keep: impl FnMut(&Operation) -> bool) -> Result<(), OperationError> {
        self.ensure_mutable()?;
        self.operations.retain(keep);
        Ok(())
    }

    pub fn set_identifier(&mut self, identifier: impl Into<Identifier>) -> Result<(), OperationError> {
        self.ensure_mutable()?;
        self.identifier = identifier.into();
        Ok(())
    }

    pub fn set_output_format(&mut self, format: Format) -> Result<(), OperationError> {
        self.ensure_mutable()?;
        self.output_format = format;
        Ok(())
    }

    pub fn set_option(
        &mut self,
        key: impl Into<String>,
        value: impl Into<String>,
    ) -> Result<(), OperationError> {
        self.ensure_mutable()?;
        self.options.insert(key.into(), value.into());
        Ok(())
    }

    pub fn remove_option(&mut self, key: &str) -> Result<Option<String>, OperationError> {
        self.ensure_mutable()?;
        Ok(self.options.remove(key))
    }

    // =========================================================================
    // Accessors
    // =========================================================================

    pub fn identifier(&self) -> &Identifier {
        &self.identifier
    }

    pub fn output_format(&self) -> Format {
        self.output_format
    }

    pub fn options(&self) -> &BTreeMap<String, String> {
        &self.options
    }

    pub fn iter(&self) -> std::slice::Iter<'_, Operation> {
        self.operations.iter()
    }

    pub fn len(&self) -> usize {
        self.operations.len()
    }

    pub fn is_empty(&self) -> bool {
        self.operations.is_empty()
    }

    /// First operation of the given kind, with or without effect.
    pub fn first(&self, kind: OperationKind) -> Option<&Operation> {
        self.operations.iter().find(|op| op.kind() == kind)
    }

    // =========================================================================
    // Canonicalization
    // =========================================================================

    /// True when the derivative would be byte-identical to a source in
    /// `source_format`, so the source can be streamed without processing.
    ///
    /// [`MetadataCopy`](Operation::MetadataCopy) never disqualifies a no-op.
    pub fn is_no_op_for(&self, source_format: Format) -> bool {
        source_format == self.output_format
            && self
                .operations
                .iter()
                .filter(|op| op.kind() != OperationKind::MetadataCopy)
                .all(|op| !op.has_effect())
    }

    /// Like [`is_no_op_for`](Self::is_no_op_for), with the source format
    /// inferred from the identifier. An identifier without a recognizable
    /// suffix is never a no-op.
    pub fn is_no_op(&self) -> bool {
        self.identifier
            .source_format()
            .is_some_and(|format| self.is_no_op_for(format))
    }

    /// Fold every operation's dimension projection over `full_size`, in order.
    pub fn resulting_size(&self, full_size: Dimensions) -> Dimensions {
        self.operations
            .iter()
            .fold(full_size, |size, op| op.resulting_size(size))
    }

    /// Canonical parts after the identifier: effect-bearing operations, then
    /// options.
    fn canonical_parts(&self) -> Vec<String> {
        self.operations
            .iter()
            .filter(|op| op.has_effect())
            .map(|op| format!("{}:{}", op.kind().name(), op.canonical_fragment()))
            .chain(self.options.iter().map(|(k, v)| format!("{k}:{v}")))
            .collect()
    }

    /// Human-readable canonical form, used for equality, ordering and logs.
    ///
    /// `cat.jpg_crop:5,6,20,22_scale:40%_animal:cat.jpg`
    pub fn display_string(&self) -> String {
        let mut parts = vec![self.identifier.to_string()];
        parts.extend(self.canonical_parts());
        format!(
            "{}.{}",
            parts.join(SEPARATOR),
            self.output_format.preferred_extension()
        )
    }

    /// Filesystem-safe cache key:
    /// `<hash(identifier)>_<hash(operations and options)>.<extension>`.
    ///
    /// Stable across runs and platforms; equal lists always share a key.
    pub fn cache_key(&self) -> String {
        format!(
            "{}{}{}.{}",
            content_hash(self.identifier.as_str()),
            SEPARATOR,
            content_hash(&self.canonical_parts().join(SEPARATOR)),
            self.output_format.preferred_extension()
        )
    }

    /// Structured form including only operations with an effect at
    /// `full_size`.
    pub fn to_map(&self, full_size: Dimensions) -> Value {
        let operations: Vec<Value> = self
            .operations
            .iter()
            .filter(|op| op.has_effect_at(full_size, self.output_format))
            .map(|op| op.to_map(full_size))
            .collect();
        json!({
            "identifier": self.identifier.as_str(),
            "operations": operations,
            "options": self.options,
            "output_format": {
                "extension": self.output_format.preferred_extension(),
                "media_type": self.output_format.media_type(),
            },
        })
    }
}

impl<'a> IntoIterator for &'a OperationList {
    type Item = &'a Operation;
    type IntoIter = std::slice::Iter<'a, Operation>;

    fn into_iter(self) -> Self::IntoIter {
        self.iter()
    }
}

impl fmt::Display for OperationList {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.display_string())
    }
}

impl PartialEq for OperationList {
    fn eq(&self, other: &Self) -> bool {
        self.display_string() == other.display_string()
    }
}

impl Eq for OperationList {}

impl PartialOrd for OperationList {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for OperationList {
    fn cmp(&self, other: &Self) -> Ordering {
        self.display_string().cmp(&other.display_string())
    }
}

impl Hash for OperationList {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.display_string().hash(state);
    }
}
