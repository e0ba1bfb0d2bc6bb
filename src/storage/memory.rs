//! In-memory shard store.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::RwLock;
use regex::Regex;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::coordinator::{ShardGroup, ShardGroupProvider, ShardStore};
use crate::query::{
    BoxIterator, DataType, FieldDimensions, IteratorCost, IteratorOptions, IteratorStats,
    Measurement, Point, VecIterator,
};
use crate::{Error, Result};

#[derive(Debug, Default)]
struct Shard {
    database: String,
    retention_policy: String,
    enabled: bool,
    /// measurement -> series key -> time -> point
    measurements: BTreeMap<String, BTreeMap<String, BTreeMap<i64, Point>>>,
}

type Shards = Arc<RwLock<HashMap<u64, Shard>>>;

/// Shards held in memory. Points with the same series and time overwrite
/// each other field by field.
#[derive(Debug, Clone, Default)]
pub struct MemoryStore {
    shards: Shards,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn shard_ids(&self) -> Vec<u64> {
        let mut ids: Vec<u64> = self.shards.read().keys().copied().collect();
        ids.sort_unstable();
        ids
    }

    /// Database and retention policy a shard was created for.
    pub fn shard_owner(&self, shard_id: u64) -> Option<(String, String)> {
        self.shards
            .read()
            .get(&shard_id)
            .map(|s| (s.database.clone(), s.retention_policy.clone()))
    }

    pub fn point_count(&self, shard_id: u64) -> usize {
        self.shards.read().get(&shard_id).map_or(0, |s| {
            s.measurements
                .values()
                .flat_map(|series| series.values())
                .map(|points| points.len())
                .sum()
        })
    }

    pub fn drop_shard(&self, shard_id: u64) -> bool {
        self.shards.write().remove(&shard_id).is_some()
    }
}

impl ShardGroupProvider for MemoryStore {
    fn shard_group(&self, ids: &[u64]) -> Arc<dyn ShardGroup> {
        Arc::new(MemoryShardGroup {
            shards: self.shards.clone(),
            ids: ids.to_vec(),
        })
    }
}

#[async_trait]
impl ShardStore for MemoryStore {
    fn shards(&self, ids: &[u64]) -> Vec<u64> {
        let shards = self.shards.read();
        ids.iter().copied().filter(|id| shards.contains_key(id)).collect()
    }

    async fn create_shard(
        &self,
        database: &str,
        retention_policy: &str,
        shard_id: u64,
        enabled: bool,
    ) -> Result<()> {
        let mut shards = self.shards.write();
        let shard = shards.entry(shard_id).or_insert_with(|| {
            debug!(shard_id, database, retention_policy, "Creating shard");
            Shard {
                database: database.to_string(),
                retention_policy: retention_policy.to_string(),
                ..Default::default()
            }
        });
        shard.enabled = enabled;
        Ok(())
    }

    async fn write_to_shard(&self, shard_id: u64, points: &[Point]) -> Result<()> {
        let mut shards = self.shards.write();
        let shard = shards.get_mut(&shard_id).ok_or(Error::ShardNotFound(shard_id))?;
        if !shard.enabled {
            return Err(Error::Internal(format!("shard {} is disabled", shard_id)));
        }
        for point in points {
            let slot = shard
                .measurements
                .entry(point.name.clone())
                .or_default()
                .entry(point.series_key())
                .or_default()
                .entry(point.time)
                .or_insert_with(|| Point {
                    fields: BTreeMap::new(),
                    ..point.clone()
                });
            slot.fields
                .extend(point.fields.iter().map(|(k, v)| (k.clone(), v.clone())));
        }
        Ok(())
    }
}

/// A view over a fixed set of in-memory shards. Unknown ids are ignored.
pub struct MemoryShardGroup {
    shards: Shards,
    ids: Vec<u64>,
}

impl MemoryShardGroup {
    fn with_series<F>(&self, measurement: &str, mut f: F)
    where
        F: FnMut(&BTreeMap<i64, Point>),
    {
        let shards = self.shards.read();
        for id in &self.ids {
            let Some(series) = shards.get(id).and_then(|s| s.measurements.get(measurement)) else {
                continue;
            };
            series.values().for_each(&mut f);
        }
    }
}

#[async_trait]
impl ShardGroup for MemoryShardGroup {
    fn measurements_by_regex(&self, re: &Regex) -> Vec<String> {
        let shards = self.shards.read();
        let names: BTreeSet<String> = self
            .ids
            .iter()
            .filter_map(|id| shards.get(id))
            .flat_map(|s| s.measurements.keys())
            .filter(|name| re.is_match(name))
            .cloned()
            .collect();
        names.into_iter().collect()
    }

    fn field_dimensions(&self, measurements: &[String]) -> Result<FieldDimensions> {
        let mut fd = FieldDimensions::default();
        for name in measurements {
            self.with_series(name, |points| {
                for point in points.values() {
                    let mut found = FieldDimensions::default();
                    for (field, value) in &point.fields {
                        found.fields.insert(field.clone(), value.data_type());
                    }
                    found.dimensions.extend(point.tags.keys().cloned());
                    fd.merge(found);
                }
            });
        }
        Ok(fd)
    }

    fn map_type(&self, measurement: &str, field: &str) -> DataType {
        let mut typ = DataType::Unknown;
        self.with_series(measurement, |points| {
            for point in points.values() {
                if let Some(value) = point.fields.get(field) {
                    typ = typ.wider(value.data_type());
                } else if point.tags.contains_key(field) {
                    typ = typ.wider(DataType::Tag);
                }
            }
        });
        typ
    }

    fn iterator_cost(&self, measurement: &str, opt: &IteratorOptions) -> Result<IteratorCost> {
        let mut cost = IteratorCost::default();
        if opt.start_time > opt.end_time {
            return Ok(cost);
        }
        let shards = self.shards.read();
        for id in &self.ids {
            let Some(series) = shards.get(id).and_then(|s| s.measurements.get(measurement)) else {
                continue;
            };
            cost.num_shards += 1;
            for points in series.values() {
                let n = points.range(opt.start_time..=opt.end_time).count() as i64;
                if n > 0 {
                    cost.num_series += 1;
                    cost.cached_values += n;
                }
            }
        }
        Ok(cost)
    }

    async fn create_iterator(
        &self,
        cancel: &CancellationToken,
        measurement: &Measurement,
        opt: &IteratorOptions,
    ) -> Result<BoxIterator> {
        if cancel.is_cancelled() {
            return Err(Error::Cancelled);
        }
        if opt.start_time > opt.end_time {
            return Ok(Box::new(VecIterator::empty()));
        }

        let mut points = Vec::new();
        let mut stats = IteratorStats::default();
        self.with_series(&measurement.name, |series| {
            let mut selected: Vec<Point> = series
                .range(opt.start_time..=opt.end_time)
                .map(|(_, p)| project(p, &opt.fields))
                .filter(|p| !p.fields.is_empty())
                .collect();
            if !opt.ascending {
                selected.reverse();
            }
            if opt.limit > 0 {
                selected.truncate(opt.limit);
            }
            if !selected.is_empty() {
                stats.series_n += 1;
                stats.point_n += selected.len() as i64;
                points.extend(selected);
            }
        });

        points.sort_by(|a, b| {
            let by_time = if opt.ascending {
                a.time.cmp(&b.time)
            } else {
                b.time.cmp(&a.time)
            };
            by_time.then_with(|| a.series_key().cmp(&b.series_key()))
        });
        Ok(Box::new(VecIterator::new(points, stats)))
    }
}

fn project(point: &Point, fields: &[String]) -> Point {
    if fields.is_empty() {
        return point.clone();
    }
    Point {
        fields: point
            .fields
            .iter()
            .filter(|(k, _)| fields.contains(k))
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect(),
        ..point.clone()
    }
}
