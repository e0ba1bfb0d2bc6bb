//! Server side of the cluster RPC protocol.

use std::sync::Arc;

use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::messages::{
    CreateIteratorRequest, CreateIteratorResponse, FieldDimensionsRequest, FieldDimensionsResponse,
    IteratorEnd, WriteShardRequest, WriteShardResponse, CREATE_ITERATOR_REQUEST,
    CREATE_ITERATOR_RESPONSE, FIELD_DIMENSIONS_REQUEST, FIELD_DIMENSIONS_RESPONSE, ITERATOR_END,
    ITERATOR_POINT, WRITE_FAILED, WRITE_OK, WRITE_SHARD_REQUEST, WRITE_SHARD_RESPONSE,
};
use super::{ShardGroup, ShardStore};
use crate::meta::TopologyReader;
use crate::net::{decode, ClusterConn, MuxListener};
use crate::query::{
    close_all, merge, BoxIterator, DataType, FieldDimensions, IteratorStats, Measurement, Point,
};
use crate::{Error, Result};

/// Answers shard writes, iterator and field dimension requests against the
/// local store.
pub struct ClusterService {
    store: Arc<dyn ShardStore>,
    topology: Arc<dyn TopologyReader>,
}

impl ClusterService {
    pub fn new(store: Arc<dyn ShardStore>, topology: Arc<dyn TopologyReader>) -> Self {
        Self { store, topology }
    }

    /// Accept connections from `listener` until `cancel` fires. Each
    /// connection is served on its own task.
    pub async fn serve(self: Arc<Self>, mut listener: MuxListener, cancel: CancellationToken) {
        info!(addr = %listener.local_addr(), "Cluster service listening");
        loop {
            let stream = tokio::select! {
                _ = cancel.cancelled() => break,
                stream = listener.accept() => match stream {
                    Some(stream) => stream,
                    None => break,
                },
            };
            let peer = stream
                .peer_addr()
                .map(|a| a.to_string())
                .unwrap_or_else(|_| "unknown".to_string());
            let service = self.clone();
            let cancel = cancel.child_token();
            tokio::spawn(async move {
                let mut conn = ClusterConn::new(stream, peer);
                if let Err(e) = service.handle_conn(&mut conn, &cancel).await {
                    debug!(peer = conn.peer(), error = %e, "Cluster connection closed");
                }
                conn.shutdown().await;
            });
        }
        info!("Cluster service stopped");
    }

    async fn handle_conn(&self, conn: &mut ClusterConn, cancel: &CancellationToken) -> Result<()> {
        loop {
            let frame = tokio::select! {
                _ = cancel.cancelled() => return Ok(()),
                frame = conn.try_read_frame() => frame?,
            };
            let Some((typ, payload)) = frame else {
                return Ok(());
            };

            match typ {
                // Writes share one connection across many requests.
                WRITE_SHARD_REQUEST => {
                    let req: WriteShardRequest = decode(&payload)?;
                    let resp = match self.write_shard(req.shard_id, &req.points).await {
                        Ok(()) => WriteShardResponse {
                            code: WRITE_OK,
                            message: String::new(),
                        },
                        Err(e) => {
                            warn!(shard_id = req.shard_id, error = %e, "Shard write failed");
                            WriteShardResponse {
                                code: WRITE_FAILED,
                                message: e.to_string(),
                            }
                        }
                    };
                    conn.write_frame(WRITE_SHARD_RESPONSE, &resp).await?;
                }
                CREATE_ITERATOR_REQUEST => {
                    let req: CreateIteratorRequest = decode(&payload)?;
                    return self.stream_iterator(conn, cancel, req).await;
                }
                FIELD_DIMENSIONS_REQUEST => {
                    let req: FieldDimensionsRequest = decode(&payload)?;
                    let resp = match self.field_dimensions(&req) {
                        Ok(fd) => FieldDimensionsResponse {
                            field_dimensions: fd,
                            error: None,
                        },
                        Err(e) => FieldDimensionsResponse {
                            field_dimensions: Default::default(),
                            error: Some(e.to_string()),
                        },
                    };
                    conn.write_frame(FIELD_DIMENSIONS_RESPONSE, &resp).await?;
                    return Ok(());
                }
                other => {
                    return Err(Error::Serialization(format!(
                        "unknown cluster message type {}",
                        other
                    )));
                }
            }
        }
    }

    /// Write to a local shard, creating it from the topology if the store
    /// does not know it yet.
    pub async fn write_shard(&self, shard_id: u64, points: &[Point]) -> Result<()> {
        match self.store.write_to_shard(shard_id, points).await {
            Err(Error::ShardNotFound(_)) => {}
            other => return other.map_err(|e| write_error(shard_id, e)),
        }

        let location = self
            .topology
            .shard_location(shard_id)
            .await?
            .ok_or_else(|| write_error(shard_id, Error::ShardNotFound(shard_id)))?;
        self.store
            .create_shard(&location.database, &location.retention_policy, shard_id, true)
            .await
            .map_err(|e| write_error(shard_id, e))?;
        info!(
            shard_id,
            database = %location.database,
            retention_policy = %location.retention_policy,
            "Created shard on first write"
        );
        self.store
            .write_to_shard(shard_id, points)
            .await
            .map_err(|e| write_error(shard_id, e))
    }

    fn field_dimensions(&self, req: &FieldDimensionsRequest) -> Result<FieldDimensions> {
        let sg = self.store.shard_group(&req.shard_ids);
        let names = match req.measurement.compiled_regex()? {
            Some(re) => sg.measurements_by_regex(&re),
            None => vec![req.measurement.name.clone()],
        };
        sg.field_dimensions(&names)
    }

    async fn open_iterator(
        &self,
        sg: &dyn ShardGroup,
        cancel: &CancellationToken,
        req: &CreateIteratorRequest,
    ) -> Result<(BoxIterator, DataType)> {
        let m = &req.measurement;
        let targets: Vec<Measurement> = match m.compiled_regex()? {
            Some(re) => sg
                .measurements_by_regex(&re)
                .iter()
                .map(|name| m.with_name(name))
                .collect(),
            None => vec![m.clone()],
        };

        let mut inputs = Vec::with_capacity(targets.len());
        let mut data_type = DataType::Unknown;
        for target in &targets {
            for field in &req.options.fields {
                data_type = data_type.wider(sg.map_type(&target.name, field));
            }
            match sg.create_iterator(cancel, target, &req.options).await {
                Ok(itr) => inputs.push(itr),
                Err(e) => {
                    close_all(&mut inputs).await;
                    return Err(e);
                }
            }
        }
        Ok((merge(inputs, req.options.ascending), data_type))
    }

    async fn stream_iterator(
        &self,
        conn: &mut ClusterConn,
        cancel: &CancellationToken,
        req: CreateIteratorRequest,
    ) -> Result<()> {
        let sg = self.store.shard_group(&req.shard_ids);
        let (mut itr, data_type) = match self.open_iterator(sg.as_ref(), cancel, &req).await {
            Ok(opened) => opened,
            Err(e) => {
                let resp = CreateIteratorResponse {
                    data_type: DataType::Unknown,
                    stats: IteratorStats::default(),
                    error: Some(e.to_string()),
                };
                return conn.write_frame(CREATE_ITERATOR_RESPONSE, &resp).await;
            }
        };

        let resp = CreateIteratorResponse {
            data_type,
            stats: itr.stats(),
            error: None,
        };
        conn.write_frame(CREATE_ITERATOR_RESPONSE, &resp).await?;

        let mut error = None;
        loop {
            let next = tokio::select! {
                _ = cancel.cancelled() => Err(Error::Cancelled),
                next = itr.next_point() => next,
            };
            match next {
                Ok(Some(point)) => {
                    if let Err(e) = conn.write_frame(ITERATOR_POINT, &point).await {
                        let _ = itr.close().await;
                        return Err(e);
                    }
                }
                Ok(None) => break,
                Err(e) => {
                    error = Some(e.to_string());
                    break;
                }
            }
        }
        if let Err(e) = itr.close().await {
            error.get_or_insert(e.to_string());
        }

        let end = IteratorEnd {
            stats: itr.stats(),
            error,
        };
        conn.write_frame(ITERATOR_END, &end).await
    }
}

fn write_error(shard_id: u64, err: Error) -> Error {
    Error::Internal(format!("write shard {}: {}", shard_id, err))
}
