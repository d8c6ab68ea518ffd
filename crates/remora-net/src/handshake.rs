use anyhow::Result;

pub const HANDSHAKE_LEN: usize = 68;

const PROTOCOL_STRING: &[u8; 19] = b"BitTorrent protocol";
const PROTOCOL_STRING_LEN: u8 = 19;

/// The fixed 68-byte opening exchange. Reserved bytes are transmitted as all
/// zeros; incoming reserved bytes are ignored.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Handshake {
    pub info_hash: [u8; 20],
    pub peer_id: [u8; 20],
}

impl Handshake {
    pub fn new(info_hash: [u8; 20], peer_id: [u8; 20]) -> Self {
        Handshake { info_hash, peer_id }
    }

    pub fn to_bytes(&self) -> [u8; HANDSHAKE_LEN] {
        let mut buf = [0u8; HANDSHAKE_LEN];
        buf[0] = PROTOCOL_STRING_LEN;
        buf[1..20].copy_from_slice(PROTOCOL_STRING);
        buf[28..48].copy_from_slice(&self.info_hash);
        buf[48..68].copy_from_slice(&self.peer_id);
        buf
    }

    pub fn parse(raw: &[u8; HANDSHAKE_LEN]) -> Result<Self> {
        if raw[0] != PROTOCOL_STRING_LEN {
            anyhow::bail!("handshake: bad protocol string length {}", raw[0]);
        }
        if &raw[1..20] != PROTOCOL_STRING {
            anyhow::bail!("handshake: unknown protocol string");
        }

        let mut info_hash = [0u8; 20];
        info_hash.copy_from_slice(&raw[28..48]);
        let mut peer_id = [0u8; 20];
        peer_id.copy_from_slice(&raw[48..68]);

        Ok(Handshake { info_hash, peer_id })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn outgoing_layout_is_exact() {
        let info_hash = [0xaa; 20];
        let peer_id = [0xbb; 20];
        let bytes = Handshake::new(info_hash, peer_id).to_bytes();

        assert_eq!(bytes.len(), HANDSHAKE_LEN);
        assert_eq!(bytes[0], 19);
        assert_eq!(&bytes[1..20], b"BitTorrent protocol");
        assert_eq!(&bytes[20..28], &[0u8; 8]);
        assert_eq!(&bytes[28..48], &info_hash);
        assert_eq!(&bytes[48..68], &peer_id);
    }

    #[test]
    fn parse_round_trips() {
        let sent = Handshake::new([1; 20], [2; 20]);
        assert_eq!(Handshake::parse(&sent.to_bytes()).unwrap(), sent);
    }

    #[test]
    fn parse_tolerates_nonzero_reserved_bytes() {
        let mut raw = Handshake::new([1; 20], [2; 20]).to_bytes();
        raw[20] = 0xff;
        assert!(Handshake::parse(&raw).is_ok());
    }

    #[test]
    fn parse_rejects_foreign_protocol_string() {
        let mut raw = Handshake::new([1; 20], [2; 20]).to_bytes();
        raw[1] = b'b';
        assert!(Handshake::parse(&raw).is_err());
    }

    #[test]
    fn parse_rejects_bad_length_prefix() {
        let mut raw = Handshake::new([1; 20], [2; 20]).to_bytes();
        raw[0] = 18;
        assert!(Handshake::parse(&raw).is_err());
    }
}
