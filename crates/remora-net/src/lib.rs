pub mod handshake;
pub mod message;
pub mod session;
pub mod tracker_http;
pub mod tracker_udp;

pub use message::{PeerMessage, BLOCK_SIZE};
pub use session::{PeerCommand, PeerEvent};
pub use tracker_http::TrackerEvent;
