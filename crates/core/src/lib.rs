pub mod clock;
pub mod events;
pub mod id;
pub mod peer_id;
pub mod spawn;

pub use events::{BroadcastEventPublisher, Event, EventPublisher, NullEventPublisher};
pub use id::NodeId;

pub const CHUNK_SIZE: u32 = 16 * 1024;

/// How many pieces a metadata blob of `total_size` bytes splits into.
pub fn metadata_piece_count(total_size: u32) -> u32 {
    total_size.div_ceil(CHUNK_SIZE)
}
