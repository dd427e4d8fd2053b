//! Lander Stores
//!
//! The two stores scripts can reach, shared by every runtime generation:
//!
//! - [`DocumentStore`]: named collections of JSON records with equality
//!   queries, auto-assigned ids and whole-file JSON persistence
//! - [`KeyValueStore`]: an in-memory map of JSON values
//!
//! Both are internally synchronized and are handed to runtimes as `Arc`s.

pub mod document;
pub mod kv;

pub use document::{matches, values_equal, DocumentStore, Record};
pub use kv::KeyValueStore;
