//! Cluster TCP plumbing
//!
//! Every inbound cluster connection starts with a single header byte that
//! selects the service; the rest of the stream is a sequence of typed,
//! length-prefixed frames.

mod conn;
mod mux;

pub use conn::{decode, encode_frame, ClusterConn, MAX_FRAME_LEN};
pub use mux::{Mux, MuxListener};

/// Header byte for shard RPC (iterators, field dimensions, writes)
pub const MUX_HEADER_CLUSTER: u8 = 2;
/// Header byte for consensus traffic between meta nodes
pub const MUX_HEADER_RAFT: u8 = 8;
