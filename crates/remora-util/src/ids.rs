use std::sync::OnceLock;

use rand::Rng;

const PEER_ID_PREFIX: &[u8; 8] = b"-RM0001-";

static PEER_ID: OnceLock<[u8; 20]> = OnceLock::new();

/// The 20-byte peer id announced to trackers and peers. Azureus-style tag
/// followed by random bytes, generated once per process.
pub fn peer_id() -> [u8; 20] {
    *PEER_ID.get_or_init(|| {
        let mut id = [0u8; 20];
        id[..8].copy_from_slice(PEER_ID_PREFIX);
        rand::thread_rng().fill(&mut id[8..]);
        id
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn peer_id_carries_prefix() {
        assert_eq!(&peer_id()[..8], PEER_ID_PREFIX);
    }

    #[test]
    fn peer_id_is_stable_within_process() {
        assert_eq!(peer_id(), peer_id());
    }
}
