//! End-to-end write and query through a live meta node
//!
//! A point is forwarded by the shard writer to the owning data node, then
//! read back through the shard mapper both remotely and locally.

mod support;

use std::sync::Arc;
use std::time::Duration;

use support::{cpu, fast_meta_config, start_cluster_service, start_meta_node, SECOND};
use tidemark::config::CoordinatorConfig;
use tidemark::coordinator::{ShardMapper, ShardWriter, Source};
use tidemark::meta::{TimeRange, TopologyReader};
use tidemark::query::{collect_points, FieldValue, IteratorOptions, Measurement, QuerySource};
use tidemark::storage::MemoryStore;
use tokio_util::sync::CancellationToken;

const T: i64 = 1_700_000_000 * SECOND;

#[tokio::test]
async fn test_forwarded_write_is_queryable() {
    let meta = start_meta_node(fast_meta_config(None)).await;
    let topology: Arc<dyn TopologyReader> = meta.store.clone();
    let cancel = CancellationToken::new();

    // Data node backed by memory, serving cluster RPC.
    let store = MemoryStore::new();
    let rpc_addr = start_cluster_service(Arc::new(store.clone()), topology.clone(), &cancel).await;
    let data_node = meta
        .store
        .create_data_node("127.0.0.1:0", &rpc_addr)
        .await
        .unwrap();

    meta.store.create_database("db0", None).await.unwrap();
    let sg = meta.store.create_shard_group("db0", "autogen", T).await.unwrap();
    let shard = &sg.shards[0];
    assert_eq!(shard.owners.len(), 1);
    assert_eq!(shard.owners[0].node_id, data_node.id);

    // Write through the owner.
    let config = CoordinatorConfig {
        shard_writer_timeout: Duration::from_secs(5),
        ..Default::default()
    };
    let writer = ShardWriter::new(topology.clone(), &config);
    writer
        .write_shard(shard.id, data_node.id, vec![cpu("server01", T, 100.0)])
        .await
        .unwrap();
    assert_eq!(store.point_count(shard.id), 1, "first write creates the shard");

    let m = Measurement::new("db0", "autogen", "cpu");
    let sources = [QuerySource::Measurement(m.clone())];
    let range = TimeRange::new(T - SECOND, T + SECOND);
    let opt = IteratorOptions::range(T - SECOND, T + SECOND);

    // From a coordinator that owns nothing, the read is remote.
    let remote_mapper = ShardMapper::new(
        data_node.id + 100,
        topology.clone(),
        Arc::new(MemoryStore::new()),
        &config,
    );
    let mapping = remote_mapper.map_shards(&sources, range).await.unwrap();
    assert_eq!(mapping.remote_nodes(&Source::from(&m)), vec![data_node.id]);

    let points = collect_points(mapping.create_iterator(&cancel, &m, &opt).await.unwrap())
        .await
        .unwrap();
    assert_eq!(points.len(), 1);
    assert_eq!(points[0].time, T);
    assert_eq!(points[0].tags["host"], "server01");
    assert_eq!(points[0].fields["value"], FieldValue::Float(100.0));

    // On the owner itself the same read is local.
    let local_mapper = ShardMapper::new(data_node.id, topology.clone(), Arc::new(store.clone()), &config);
    let mapping = local_mapper.map_shards(&sources, range).await.unwrap();
    assert!(mapping.has_local(&Source::from(&m)));
    assert!(mapping.remote_nodes(&Source::from(&m)).is_empty());

    let points = collect_points(mapping.create_iterator(&cancel, &m, &opt).await.unwrap())
        .await
        .unwrap();
    assert_eq!(points.len(), 1);
    assert_eq!(points[0].fields["value"], FieldValue::Float(100.0));

    // Outside the written instant there is nothing.
    let later = IteratorOptions::range(T + 1, T + SECOND);
    let points = collect_points(mapping.create_iterator(&cancel, &m, &later).await.unwrap())
        .await
        .unwrap();
    assert!(points.is_empty());

    writer.close().await;
    cancel.cancel();
    meta.close().await;
}
