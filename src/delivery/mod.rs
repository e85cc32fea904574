//! Push delivery to session subscribers.
//!
//! Two channels per session with different contracts:
//! - stream: best-effort partial output, drop-oldest on overflow
//! - state: committed snapshots in version order, resync on overflow

mod messages;
mod router;

pub use messages::{PushMessage, StateNotice, StreamMessage};
pub use router::{ChannelRouter, ChunkEmitter, Subscriber};
