// Copyright 2024 The RegionServer Authors. Licensed under Apache-2.0.

//! Row keys, qualified columns, and cell values.
//!
//! Keys have a raw representation only: unlike a transactional MVCC store
//! there is no timestamp-oracle encoding to hide from callers, so `RowKey`
//! is a thin ordered wrapper rather than `txn_types::Key`'s dual
//! raw/encoded representation.

use std::cmp::Ordering;
use std::fmt;

use crate::errors::{Error, Result};

/// An opaque, ordered row key.
#[derive(Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Debug)]
pub struct RowKey(Vec<u8>);

impl RowKey {
    pub fn new(bytes: impl Into<Vec<u8>>) -> RowKey {
        RowKey(bytes.into())
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    pub fn into_bytes(self) -> Vec<u8> {
        self.0
    }
}

impl From<&str> for RowKey {
    fn from(s: &str) -> RowKey {
        RowKey(s.as_bytes().to_vec())
    }
}

impl From<String> for RowKey {
    fn from(s: String) -> RowKey {
        RowKey(s.into_bytes())
    }
}

impl fmt::Display for RowKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match std::str::from_utf8(&self.0) {
            Ok(s) => write!(f, "{}", s),
            Err(_) => write!(f, "{:?}", self.0),
        }
    }
}

/// A qualified column name, `family:qualifier`.
#[derive(Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Debug)]
pub struct Column {
    pub family: String,
    pub qualifier: String,
}

impl Column {
    pub fn new(family: impl Into<String>, qualifier: impl Into<String>) -> Column {
        Column {
            family: family.into(),
            qualifier: qualifier.into(),
        }
    }

    pub fn parse(spec: &str) -> Result<Column> {
        let mut parts = spec.splitn(2, ':');
        let family = parts
            .next()
            .filter(|s| !s.is_empty())
            .ok_or_else(|| Error::Config(format!("malformed column spec: {}", spec)))?;
        let qualifier = parts.next().unwrap_or("");
        Ok(Column::new(family, qualifier))
    }
}

impl fmt::Display for Column {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.family, self.qualifier)
    }
}

/// Monotonic per-server sequence id, also used as the default write
/// timestamp when a caller does not supply one.
pub type SeqId = u64;

/// A cell's value: either a put, or a tombstone shadowing older cells for
/// the same (row, column).
#[derive(Clone, Eq, PartialEq, Debug)]
pub enum Value {
    Put(Vec<u8>),
    Tombstone,
}

impl Value {
    pub fn as_put(&self) -> Option<&[u8]> {
        match self {
            Value::Put(v) => Some(v),
            Value::Tombstone => None,
        }
    }

    pub fn is_tombstone(&self) -> bool {
        matches!(self, Value::Tombstone)
    }
}

/// Ordering key for one cell inside a store: `(row asc, column asc, ts desc)`
/// so that a forward scan visits newest versions of a (row, column) first.
#[derive(Clone, Eq, PartialEq, Debug)]
pub struct CellKey {
    pub row: RowKey,
    pub column: Column,
    pub timestamp: u64,
}

impl Ord for CellKey {
    fn cmp(&self, other: &Self) -> Ordering {
        self.row
            .cmp(&other.row)
            .then_with(|| self.column.cmp(&other.column))
            .then_with(|| other.timestamp.cmp(&self.timestamp))
    }
}

impl PartialOrd for CellKey {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

#[derive(Clone, Debug)]
pub struct Cell {
    pub key: CellKey,
    pub value: Value,
}

impl Cell {
    pub fn row(&self) -> &RowKey {
        &self.key.row
    }

    pub fn column(&self) -> &Column {
        &self.key.column
    }

    pub fn timestamp(&self) -> u64 {
        self.key.timestamp
    }
}
