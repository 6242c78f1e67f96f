//! Framing and sizing constants shared by the transfer engine and the
//! network-IO collaborator.

/// Size of a hash bucket: the unit of integrity verification and disk flush.
pub const BUCKET_SIZE: u64 = 1 << BUCKET_SHIFT;

/// `log2(BUCKET_SIZE)`.
pub const BUCKET_SHIFT: u32 = 20;

/// Buckets in flight to the hashing/flush path above which new requests are
/// throttled to a single bucket.
pub const HASH_BUCKET_QUEUE_CONGESTION_THRESHOLD: usize = 16;

/// Buckets in flight above which no new bucket requests go out until the
/// backlog drains.
pub const HASH_BUCKET_QUEUE_CRITICAL_THRESHOLD: usize = 256;

/// Total datagram budget.
pub const PACKET_MTU: usize = 1436;

/// Data bytes carried per data packet after headers.
pub const PACKET_DATA_MTU: usize = 1402;

/// Length of a tree-hash root.
pub const CONTENT_HASH_LEN: usize = 24;

/// `[2 reserved][8 offset][24 hash]`
pub const ROUTED_DATA_HEADER_LEN: usize = 2 + 8 + CONTENT_HASH_LEN;

/// `[4 segment id][8 offset]`
pub const DIRECT_DATA_HEADER_LEN: usize = 4 + 8;

/// One tree entry: `[4 bucket number][24 bucket hash]`.
pub const TTH_TREE_ENTRY_LEN: usize = 4 + CONTENT_HASH_LEN;

/// Segment id reserved for "no segment" (routed delivery).
pub const NO_SEGMENT_ID: u32 = 0;
