use std::path::PathBuf;
use std::time::Duration;

/// Knobs for one download run. The defaults are the intended operating
/// point; the CLI only overrides the output directory and listen port.
#[derive(Clone, Debug)]
pub struct Settings {
    pub output_dir: PathBuf,
    /// Port reported to trackers. Nothing listens on it; this client only
    /// dials out.
    pub listen_port: u16,

    /// Peers dialled from the start-up announce.
    pub initial_dial_count: usize,
    /// Peers dialled from each replenishment announce.
    pub refill_dial_count: usize,
    /// Hard cap on concurrent peer sockets.
    pub max_active_peers: usize,
    /// Below this many live peers the pool is considered drained.
    pub min_active_peers: usize,
    /// Outstanding piece assignments allowed per ready, unchoked peer.
    pub max_assignments_per_peer: usize,

    pub dial_timeout: Duration,
    pub piece_deadline: Duration,
    pub tick_interval: Duration,
    /// Minimum spacing between replenishment announces.
    pub refresh_floor: Duration,
    /// Consecutive empty tracker batches tolerated before giving up.
    pub max_empty_refreshes: u32,
}

impl Default for Settings {
    fn default() -> Self {
        Settings {
            output_dir: PathBuf::from("."),
            listen_port: 6881,
            initial_dial_count: 30,
            refill_dial_count: 50,
            max_active_peers: 50,
            min_active_peers: 5,
            max_assignments_per_peer: 3,
            dial_timeout: Duration::from_secs(5),
            piece_deadline: Duration::from_secs(30),
            tick_interval: Duration::from_secs(2),
            refresh_floor: Duration::from_secs(15),
            max_empty_refreshes: 5,
        }
    }
}
