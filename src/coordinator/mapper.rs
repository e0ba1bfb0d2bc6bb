//! Resolve query sources to local and remote shards.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use futures::future::try_join_all;
use metrics::counter;
use parking_lot::Mutex;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use super::dialer::NodeDialer;
use super::remote::RemoteIteratorCreator;
use super::{ShardGroup, ShardStore, Source};
use crate::config::{CoordinatorConfig, ReconcilePolicy};
use crate::meta::{ShardGroupInfo, ShardInfo, TimeRange, TopologyReader};
use crate::query::{
    close_all, merge, BoxIterator, DataType, FieldDimensions, IteratorCost, IteratorOptions,
    Measurement, QuerySource,
};
use crate::{Error, Result};

/// Builds per-query [`ShardMapping`]s for the local data node.
pub struct ShardMapper {
    node_id: u64,
    topology: Arc<dyn TopologyReader>,
    store: Arc<dyn ShardStore>,
    dialer: Arc<NodeDialer>,
    min_time: Option<i64>,
    max_time: Option<i64>,
    reconcile_policy: ReconcilePolicy,
    rng: Mutex<StdRng>,
}

impl ShardMapper {
    pub fn new(
        node_id: u64,
        topology: Arc<dyn TopologyReader>,
        store: Arc<dyn ShardStore>,
        config: &CoordinatorConfig,
    ) -> Self {
        let dialer = Arc::new(NodeDialer::new(topology.clone(), config.dial_timeout));
        Self {
            node_id,
            topology,
            store,
            dialer,
            min_time: config.shard_mapper_min_time,
            max_time: config.shard_mapper_max_time,
            reconcile_policy: config.reconcile_policy,
            rng: Mutex::new(StdRng::from_entropy()),
        }
    }

    /// Replace the owner selection source, e.g. with a seeded generator.
    pub fn with_rng(mut self, rng: StdRng) -> Self {
        self.rng = Mutex::new(rng);
        self
    }

    pub fn node_id(&self) -> u64 {
        self.node_id
    }

    /// Resolve every source (recursing into subqueries) overlapping `range`.
    /// Each distinct (database, policy) pair is looked up once.
    pub async fn map_shards(&self, sources: &[QuerySource], range: TimeRange) -> Result<ShardMapping> {
        let mut mapping = ShardMapping {
            sources: HashMap::new(),
            node_id: self.node_id,
            store: self.store.clone(),
            dialer: self.dialer.clone(),
            min_time: self.min_time,
            max_time: self.max_time,
            closed: false,
        };

        let mut pending: Vec<&QuerySource> = sources.iter().rev().collect();
        while let Some(source) = pending.pop() {
            match source {
                QuerySource::Measurement(m) => {
                    let key = Source::from(m);
                    if mapping.sources.contains_key(&key) {
                        continue;
                    }
                    let resolved = self.resolve(&key, range).await?;
                    mapping.sources.insert(key, resolved);
                }
                QuerySource::SubQuery(inner) => pending.extend(inner.iter().rev()),
            }
        }
        Ok(mapping)
    }

    async fn resolve(&self, source: &Source, range: TimeRange) -> Result<SourceMapping> {
        let groups = self
            .topology
            .shard_groups_by_time_range(&source.database, &source.retention_policy, range)
            .await?;
        if groups.is_empty() {
            debug!(
                database = %source.database,
                retention_policy = %source.retention_policy,
                "No shard groups in range"
            );
            return Ok(SourceMapping::default());
        }

        let (local_ids, remote_ids) = self.partition(&groups);
        let shards = groups
            .iter()
            .flat_map(|sg| sg.shards.iter())
            .filter(|shard| !shard.owners.is_empty())
            .cloned()
            .collect();

        let local = if local_ids.is_empty() {
            None
        } else {
            self.reconcile(source, &local_ids).await?;
            Some(self.store.shard_group(&local_ids))
        };

        let remotes = remote_ids
            .into_iter()
            .map(|(node_id, ids)| RemoteIteratorCreator::new(self.dialer.clone(), node_id, ids))
            .collect();

        Ok(SourceMapping {
            local,
            remotes,
            shards,
        })
    }

    /// Split shards into those this node owns and those to fetch from a
    /// randomly chosen owner, grouped by node.
    fn partition(&self, groups: &[ShardGroupInfo]) -> (Vec<u64>, BTreeMap<u64, Vec<u64>>) {
        let mut local = Vec::new();
        let mut remote: BTreeMap<u64, Vec<u64>> = BTreeMap::new();
        let mut rng = self.rng.lock();

        for sg in groups {
            for shard in &sg.shards {
                if shard.owners.is_empty() {
                    warn!(shard_id = shard.id, shard_group_id = sg.id, "Shard has no owners, skipping");
                    continue;
                }
                if shard.owned_by(self.node_id) {
                    local.push(shard.id);
                    continue;
                }
                let owner = &shard.owners[rng.gen_range(0..shard.owners.len())];
                remote.entry(owner.node_id).or_default().push(shard.id);
            }
        }
        (local, remote)
    }

    /// Create local shards the storage engine does not know yet.
    async fn reconcile(&self, source: &Source, ids: &[u64]) -> Result<()> {
        let known = self.store.shards(ids);
        for &id in ids.iter().filter(|id| !known.contains(id)) {
            let result = self
                .store
                .create_shard(&source.database, &source.retention_policy, id, true)
                .await;
            let Err(e) = result else {
                debug!(shard_id = id, "Created missing local shard");
                continue;
            };
            match self.reconcile_policy {
                ReconcilePolicy::Ignore => {}
                ReconcilePolicy::Warn => {
                    counter!("tidemark_mapper_reconcile_failures_total").increment(1);
                    warn!(shard_id = id, database = %source.database, error = %e, "Failed to create local shard");
                }
                ReconcilePolicy::Fail => {
                    return Err(Error::Internal(format!("create shard {}: {}", id, e)));
                }
            }
        }
        Ok(())
    }
}

#[derive(Default)]
struct SourceMapping {
    local: Option<Arc<dyn ShardGroup>>,
    remotes: Vec<RemoteIteratorCreator>,
    /// Every owned shard in range, for node-pinned reads.
    shards: Vec<ShardInfo>,
}

/// Routing table for one query. Not shared between queries.
pub struct ShardMapping {
    sources: HashMap<Source, SourceMapping>,
    node_id: u64,
    store: Arc<dyn ShardStore>,
    dialer: Arc<NodeDialer>,
    min_time: Option<i64>,
    max_time: Option<i64>,
    closed: bool,
}

impl std::fmt::Debug for ShardMapping {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ShardMapping")
            .field("node_id", &self.node_id)
            .field("min_time", &self.min_time)
            .field("max_time", &self.max_time)
            .field("closed", &self.closed)
            .finish_non_exhaustive()
    }
}

impl ShardMapping {
    pub fn sources(&self) -> impl Iterator<Item = &Source> {
        self.sources.keys()
    }

    /// Remote nodes serving `source`, in node id order.
    pub fn remote_nodes(&self, source: &Source) -> Vec<u64> {
        self.sources
            .get(source)
            .map(|s| s.remotes.iter().map(|r| r.node_id()).collect())
            .unwrap_or_default()
    }

    pub fn has_local(&self, source: &Source) -> bool {
        self.sources.get(source).map_or(false, |s| s.local.is_some())
    }

    /// Concrete measurement names for `m`: the regex matches in the local
    /// catalog, or the plain name.
    fn measurement_names(m: &Measurement, local: &dyn ShardGroup) -> Result<Vec<String>> {
        match m.compiled_regex()? {
            Some(re) => Ok(local.measurements_by_regex(&re)),
            None => Ok(vec![m.name.clone()]),
        }
    }

    /// Field types and tag keys across local and remote shards.
    pub async fn field_dimensions(&self, m: &Measurement) -> Result<FieldDimensions> {
        let mut fd = FieldDimensions::default();
        let Some(mapping) = self.sources.get(&Source::from(m)) else {
            return Ok(fd);
        };

        if let Some(local) = &mapping.local {
            let names = Self::measurement_names(m, local.as_ref())?;
            fd.merge(local.field_dimensions(&names)?);
        }
        let remote = try_join_all(mapping.remotes.iter().map(|r| r.field_dimensions(m))).await?;
        for found in remote {
            fd.merge(found);
        }
        Ok(fd)
    }

    /// Most general type of `field` across matching local measurements.
    pub fn map_type(&self, m: &Measurement, field: &str) -> DataType {
        let Some(local) = self
            .sources
            .get(&Source::from(m))
            .and_then(|s| s.local.as_ref())
        else {
            return DataType::Unknown;
        };
        let names = match Self::measurement_names(m, local.as_ref()) {
            Ok(names) => names,
            Err(e) => {
                debug!(error = %e, "Invalid measurement regex");
                return DataType::Unknown;
            }
        };

        let mut typ = DataType::Unknown;
        for name in &names {
            let name = m.system_iterator.as_deref().unwrap_or(name);
            typ = typ.wider(local.map_type(name, field));
        }
        typ
    }

    /// One merged iterator over every local and remote shard of the source.
    /// Remote failures drop that remote; a local failure fails the call.
    /// With `opt.node_id` set, only shards hosted by that node are read,
    /// all of them from that node.
    pub async fn create_iterator(
        &self,
        cancel: &CancellationToken,
        m: &Measurement,
        opt: &IteratorOptions,
    ) -> Result<BoxIterator> {
        let mut opt = opt.clone();
        opt.clamp(self.min_time, self.max_time);

        let Some(mapping) = self.sources.get(&Source::from(m)) else {
            return Ok(merge(Vec::new(), opt.ascending));
        };

        let pinned = opt.node_id.map(|node_id| self.pin(mapping, node_id));
        let (local, remotes) = match &pinned {
            Some((local, remotes)) => (local.as_ref(), remotes.as_slice()),
            None => (mapping.local.as_ref(), mapping.remotes.as_slice()),
        };

        let mut inputs: Vec<BoxIterator> = Vec::new();
        if let Some(local) = local {
            for name in Self::measurement_names(m, local.as_ref())? {
                match local.create_iterator(cancel, &m.with_name(&name), &opt).await {
                    Ok(itr) => inputs.push(itr),
                    Err(e) => {
                        close_all(&mut inputs).await;
                        return Err(e);
                    }
                }
            }
        }

        // Remotes expand a regex against their own catalog.
        for remote in remotes {
            match remote.create_iterator(cancel, m, &opt).await {
                Ok(itr) => inputs.push(itr),
                Err(e) => {
                    counter!("tidemark_mapper_remote_iterator_failures_total").increment(1);
                    warn!(
                        node_id = remote.node_id(),
                        measurement = %m.name,
                        error = %e,
                        "Skipping remote iterator"
                    );
                }
            }
        }
        Ok(merge(inputs, opt.ascending))
    }

    /// Route every shard hosted by `node_id` to that node alone.
    fn pin(
        &self,
        mapping: &SourceMapping,
        node_id: u64,
    ) -> (Option<Arc<dyn ShardGroup>>, Vec<RemoteIteratorCreator>) {
        let ids: Vec<u64> = mapping
            .shards
            .iter()
            .filter(|shard| shard.owned_by(node_id))
            .map(|shard| shard.id)
            .collect();
        if ids.is_empty() {
            return (None, Vec::new());
        }
        if node_id == self.node_id {
            (Some(self.store.shard_group(&ids)), Vec::new())
        } else {
            let remote = RemoteIteratorCreator::new(self.dialer.clone(), node_id, ids);
            (None, vec![remote])
        }
    }

    /// Local cost estimate summed across matching measurements.
    pub fn iterator_cost(&self, m: &Measurement, opt: &IteratorOptions) -> Result<IteratorCost> {
        let mut opt = opt.clone();
        opt.clamp(self.min_time, self.max_time);

        let Some(local) = self
            .sources
            .get(&Source::from(m))
            .and_then(|s| s.local.as_ref())
        else {
            return Ok(IteratorCost::default());
        };

        let mut cost = IteratorCost::default();
        for name in Self::measurement_names(m, local.as_ref())? {
            cost = cost.combine(local.iterator_cost(&name, &opt)?);
        }
        Ok(cost)
    }

    /// Release the routing table. Safe to call more than once.
    pub fn close(&mut self) {
        if self.closed {
            return;
        }
        self.sources.clear();
        self.closed = true;
    }
}
