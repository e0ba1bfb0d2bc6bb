//! Client side of the cluster RPC protocol: iterators and field dimensions
//! served by another data node.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use super::dialer::NodeDialer;
use super::messages::{
    CreateIteratorRequest, CreateIteratorResponse, FieldDimensionsRequest, FieldDimensionsResponse,
    IteratorEnd, CREATE_ITERATOR_REQUEST, CREATE_ITERATOR_RESPONSE, FIELD_DIMENSIONS_REQUEST,
    FIELD_DIMENSIONS_RESPONSE, ITERATOR_END, ITERATOR_POINT,
};
use crate::net::{decode, ClusterConn};
use crate::query::{
    BoxIterator, DataType, FieldDimensions, IteratorOptions, IteratorStats, Measurement, Point,
    PointIterator,
};
use crate::{Error, Result};

/// Creates iterators over a fixed set of shards on one remote node.
#[derive(Clone)]
pub struct RemoteIteratorCreator {
    dialer: Arc<NodeDialer>,
    node_id: u64,
    shard_ids: Vec<u64>,
}

impl RemoteIteratorCreator {
    pub fn new(dialer: Arc<NodeDialer>, node_id: u64, shard_ids: Vec<u64>) -> Self {
        Self {
            dialer,
            node_id,
            shard_ids,
        }
    }

    pub fn node_id(&self) -> u64 {
        self.node_id
    }

    pub fn shard_ids(&self) -> &[u64] {
        &self.shard_ids
    }

    /// Ask the owner for an iterator. On success the connection becomes the
    /// iterator's data source and is closed with it.
    pub async fn create_iterator(
        &self,
        cancel: &CancellationToken,
        measurement: &Measurement,
        opt: &IteratorOptions,
    ) -> Result<BoxIterator> {
        let mut conn = self.dialer.dial(self.node_id).await?;
        let request = CreateIteratorRequest {
            shard_ids: self.shard_ids.clone(),
            measurement: measurement.clone(),
            options: opt.clone(),
        };

        let resp: CreateIteratorResponse = tokio::select! {
            _ = cancel.cancelled() => {
                conn.shutdown().await;
                return Err(Error::Cancelled);
            }
            resp = round_trip(&mut conn, CREATE_ITERATOR_REQUEST, &request, CREATE_ITERATOR_RESPONSE) => resp,
        }?;

        if let Some(err) = resp.error {
            conn.shutdown().await;
            return Err(Error::Remote(err));
        }
        debug!(
            node_id = self.node_id,
            shards = self.shard_ids.len(),
            measurement = %measurement.name,
            "Remote iterator opened"
        );
        Ok(Box::new(RemoteIterator::new(
            conn,
            cancel.clone(),
            self.dialer.timeout(),
            resp.data_type,
            resp.stats,
        )))
    }

    /// Single request/response; the connection is closed afterwards.
    pub async fn field_dimensions(&self, measurement: &Measurement) -> Result<FieldDimensions> {
        let mut conn = self.dialer.dial(self.node_id).await?;
        let request = FieldDimensionsRequest {
            shard_ids: self.shard_ids.clone(),
            measurement: measurement.clone(),
        };
        let resp: Result<FieldDimensionsResponse> = round_trip(
            &mut conn,
            FIELD_DIMENSIONS_REQUEST,
            &request,
            FIELD_DIMENSIONS_RESPONSE,
        )
        .await;
        conn.shutdown().await;

        let resp = resp?;
        match resp.error {
            Some(err) => Err(Error::Remote(err)),
            None => Ok(resp.field_dimensions),
        }
    }
}

async fn round_trip<Req, Resp>(conn: &mut ClusterConn, typ: u8, req: &Req, resp_typ: u8) -> Result<Resp>
where
    Req: serde::Serialize,
    Resp: serde::de::DeserializeOwned,
{
    conn.write_frame(typ, req).await?;
    conn.read_message(resp_typ).await
}

/// Streams points from a remote node. Every frame read gets a fresh
/// deadline so long scans survive while the peer keeps producing.
pub struct RemoteIterator {
    conn: Option<ClusterConn>,
    cancel: CancellationToken,
    timeout: Duration,
    data_type: DataType,
    stats: IteratorStats,
}

impl RemoteIterator {
    fn new(
        conn: ClusterConn,
        cancel: CancellationToken,
        timeout: Duration,
        data_type: DataType,
        stats: IteratorStats,
    ) -> Self {
        Self {
            conn: Some(conn),
            cancel,
            timeout,
            data_type,
            stats,
        }
    }

    pub fn data_type(&self) -> DataType {
        self.data_type
    }

    async fn read_next(conn: &mut ClusterConn) -> Result<Frame> {
        let (typ, payload) = conn.read_frame().await?;
        match typ {
            ITERATOR_POINT => Ok(Frame::Point(decode(&payload)?)),
            ITERATOR_END => Ok(Frame::End(decode(&payload)?)),
            other => Err(Error::Serialization(format!(
                "unexpected iterator frame type {} from {}",
                other,
                conn.peer()
            ))),
        }
    }
}

enum Frame {
    Point(Point),
    End(IteratorEnd),
}

#[async_trait]
impl PointIterator for RemoteIterator {
    async fn next_point(&mut self) -> Result<Option<Point>> {
        let Some(conn) = self.conn.as_mut() else {
            return Ok(None);
        };
        conn.extend_deadline(self.timeout);

        let frame = tokio::select! {
            _ = self.cancel.cancelled() => Err(Error::Cancelled),
            frame = Self::read_next(conn) => frame,
        };

        match frame {
            Ok(Frame::Point(point)) => Ok(Some(point)),
            Ok(Frame::End(end)) => {
                self.stats = end.stats;
                self.close().await?;
                match end.error {
                    Some(err) => Err(Error::Remote(err)),
                    None => Ok(None),
                }
            }
            Err(e) => {
                self.close().await?;
                Err(e)
            }
        }
    }

    async fn close(&mut self) -> Result<()> {
        if let Some(mut conn) = self.conn.take() {
            conn.shutdown().await;
        }
        Ok(())
    }

    fn stats(&self) -> IteratorStats {
        self.stats
    }
}
