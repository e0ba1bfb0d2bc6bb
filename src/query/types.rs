//! Values exchanged between the query front end, the shard mapper and the
//! storage engine.

use crate::Result;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};

/// Type of a field or the result of an iterator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum DataType {
    #[default]
    Unknown,
    Float,
    Integer,
    Unsigned,
    String,
    Boolean,
    Time,
    Duration,
    Tag,
    AnyField,
}

impl DataType {
    fn precedence(self) -> u8 {
        match self {
            DataType::Unknown => 0,
            DataType::AnyField => 1,
            DataType::Tag => 2,
            DataType::Duration => 3,
            DataType::Time => 4,
            DataType::Boolean => 5,
            DataType::String => 6,
            DataType::Unsigned => 7,
            DataType::Integer => 8,
            DataType::Float => 9,
        }
    }

    /// True when `other` is the more general type.
    pub fn less_than(self, other: DataType) -> bool {
        self.precedence() < other.precedence()
    }

    /// The more general of two types.
    pub fn wider(self, other: DataType) -> DataType {
        if self.less_than(other) {
            other
        } else {
            self
        }
    }
}

/// A single field value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum FieldValue {
    Float(f64),
    Integer(i64),
    Unsigned(u64),
    String(String),
    Boolean(bool),
}

impl FieldValue {
    pub fn data_type(&self) -> DataType {
        match self {
            FieldValue::Float(_) => DataType::Float,
            FieldValue::Integer(_) => DataType::Integer,
            FieldValue::Unsigned(_) => DataType::Unsigned,
            FieldValue::String(_) => DataType::String,
            FieldValue::Boolean(_) => DataType::Boolean,
        }
    }
}

/// A point; `time` is nanoseconds since the Unix epoch.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Point {
    pub name: String,
    pub tags: BTreeMap<String, String>,
    pub fields: BTreeMap<String, FieldValue>,
    pub time: i64,
}

impl Point {
    pub fn new(name: impl Into<String>, time: i64) -> Self {
        Self {
            name: name.into(),
            tags: BTreeMap::new(),
            fields: BTreeMap::new(),
            time,
        }
    }

    pub fn tag(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.tags.insert(key.into(), value.into());
        self
    }

    pub fn field(mut self, key: impl Into<String>, value: FieldValue) -> Self {
        self.fields.insert(key.into(), value);
        self
    }

    /// Series key: measurement name plus sorted tag set.
    pub fn series_key(&self) -> String {
        let mut key = self.name.clone();
        for (k, v) in &self.tags {
            key.push(',');
            key.push_str(k);
            key.push('=');
            key.push_str(v);
        }
        key
    }
}

/// A measurement reference from a query source. `regex`, when set, replaces
/// `name` and is matched against the shard group's measurement catalog.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Measurement {
    pub database: String,
    pub retention_policy: String,
    pub name: String,
    pub regex: Option<String>,
    /// Name of a system iterator that stands in for the measurement.
    pub system_iterator: Option<String>,
}

impl Measurement {
    pub fn new(
        database: impl Into<String>,
        retention_policy: impl Into<String>,
        name: impl Into<String>,
    ) -> Self {
        Self {
            database: database.into(),
            retention_policy: retention_policy.into(),
            name: name.into(),
            regex: None,
            system_iterator: None,
        }
    }

    pub fn with_regex(
        database: impl Into<String>,
        retention_policy: impl Into<String>,
        pattern: impl Into<String>,
    ) -> Self {
        Self {
            regex: Some(pattern.into()),
            ..Self::new(database, retention_policy, "")
        }
    }

    pub fn compiled_regex(&self) -> Result<Option<Regex>> {
        match &self.regex {
            Some(pattern) => Ok(Some(Regex::new(pattern)?)),
            None => Ok(None),
        }
    }

    /// Same source, concrete measurement name, regex cleared.
    pub fn with_name(&self, name: &str) -> Self {
        Self {
            name: name.to_string(),
            regex: None,
            ..self.clone()
        }
    }
}

/// Options for creating an iterator. Times are inclusive nanoseconds.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IteratorOptions {
    pub start_time: i64,
    pub end_time: i64,
    pub ascending: bool,
    /// Field projection; empty selects every field.
    pub fields: Vec<String>,
    /// Read only shards hosted by this node, when set.
    pub node_id: Option<u64>,
    /// Maximum points per series; zero is unlimited.
    pub limit: usize,
}

impl Default for IteratorOptions {
    fn default() -> Self {
        Self {
            start_time: i64::MIN,
            end_time: i64::MAX,
            ascending: true,
            fields: Vec::new(),
            node_id: None,
            limit: 0,
        }
    }
}

impl IteratorOptions {
    pub fn range(start_time: i64, end_time: i64) -> Self {
        Self {
            start_time,
            end_time,
            ..Default::default()
        }
    }

    /// Clip the time range to the optional bounds.
    pub fn clamp(&mut self, min_time: Option<i64>, max_time: Option<i64>) {
        if let Some(min) = min_time {
            if self.start_time < min {
                self.start_time = min;
            }
        }
        if let Some(max) = max_time {
            if self.end_time > max {
                self.end_time = max;
            }
        }
    }
}

/// Estimated work for an iterator.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct IteratorCost {
    pub num_shards: i64,
    pub num_series: i64,
    pub cached_values: i64,
    pub num_files: i64,
    pub blocks_read: i64,
    pub block_size: i64,
}

impl IteratorCost {
    /// Additive combination of two estimates.
    pub fn combine(self, other: IteratorCost) -> IteratorCost {
        IteratorCost {
            num_shards: self.num_shards + other.num_shards,
            num_series: self.num_series + other.num_series,
            cached_values: self.cached_values + other.cached_values,
            num_files: self.num_files + other.num_files,
            blocks_read: self.blocks_read + other.blocks_read,
            block_size: self.block_size + other.block_size,
        }
    }
}

/// Execution statistics reported by an iterator.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct IteratorStats {
    pub series_n: i64,
    pub point_n: i64,
}

impl IteratorStats {
    pub fn add(&mut self, other: IteratorStats) {
        self.series_n += other.series_n;
        self.point_n += other.point_n;
    }
}

/// Field types and tag keys of one or more measurements.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FieldDimensions {
    pub fields: BTreeMap<String, DataType>,
    pub dimensions: BTreeSet<String>,
}

impl FieldDimensions {
    /// Merge another set in, keeping the wider type on conflict.
    pub fn merge(&mut self, other: FieldDimensions) {
        for (name, typ) in other.fields {
            self.fields
                .entry(name)
                .and_modify(|existing| *existing = existing.wider(typ))
                .or_insert(typ);
        }
        self.dimensions.extend(other.dimensions);
    }
}

/// A logical query source: a measurement, or a subquery over more sources.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum QuerySource {
    Measurement(Measurement),
    SubQuery(Vec<QuerySource>),
}
