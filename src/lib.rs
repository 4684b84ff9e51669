//! # image-derivatives
//!
//! The derivative core of a dynamic image server: describe a transformed
//! image as an operation list, serve it from a cache when possible, and
//! otherwise produce it exactly once while streaming it to the client.
//!
//! # Request Flow
//!
//! ```text
//! OperationList ──freeze──▶ ImageRepresentation::write
//!                               │
//!                               ├─ cache hit  → copy cached bytes
//!                               └─ cache miss → verbatim copy or processor
//!                                               teed into client + cache
//! ```
//!
//! # Module Map
//!
//! | Module | Role |
//! |--------|------|
//! | [`format`] | Image formats and identifiers |
//! | [`operation`] | Operation kinds, their parameters, dimension math and [`OperationList`](operation::OperationList) |
//! | [`cache`] | Cache stores, the derivative cache coordinator, content hashing |
//! | [`tee`] | Writer duplicating bytes into client and cache |
//! | [`processor`] | Processor capabilities and the built-in pure Rust processor |
//! | [`representation`] | The cache-aware write path and Content-Disposition |
//! | [`delegate`] | Delegate method dispatch with load/invoke locking and memoization |
//! | [`config`] | `config.toml` loading and validation |
//!
//! # Design Decisions
//!
//! ## Canonical State
//!
//! Equality, ordering, display strings and cache keys of an operation list
//! all come from one canonical form that skips steps without effect. Two
//! requests that only differ by identity steps (`rotate:0`, a full crop)
//! are the same derivative and share a cache entry.
//!
//! ## Complete-or-Absent Cache Entries
//!
//! Cache writers publish on commit only. The write path purges a key whenever
//! anything fails mid-stream, including the client going away, so a reader
//! never sees a derivative that stopped halfway.
//!
//! ## Pure-Rust Imaging
//!
//! [`processor::RustProcessor`] uses the `image` crate (Lanczos3 resampling)
//! and needs no system libraries. Heavier engines plug in through the same
//! [`processor::Processor`] traits.

pub mod cache;
pub mod config;
pub mod delegate;
pub mod format;
pub mod operation;
pub mod processor;
pub mod representation;
pub mod tee;

#[cfg(test)]
pub(crate) mod test_helpers;
