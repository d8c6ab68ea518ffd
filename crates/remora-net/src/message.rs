use anyhow::Result;

/// Unit of peer-to-peer transfer. The final block of a piece may be shorter.
pub const BLOCK_SIZE: u32 = 16384;

/// Upper bound on a single frame's payload. Large enough for the bitfield of
/// a torrent with two million pieces and for any legal piece message.
pub const MAX_PAYLOAD_LEN: u32 = 256 * 1024 + 16;

const ID_CHOKE: u8 = 0;
const ID_UNCHOKE: u8 = 1;
const ID_INTERESTED: u8 = 2;
const ID_NOT_INTERESTED: u8 = 3;
const ID_HAVE: u8 = 4;
const ID_BITFIELD: u8 = 5;
const ID_REQUEST: u8 = 6;
const ID_PIECE: u8 = 7;
const ID_CANCEL: u8 = 8;
const ID_PORT: u8 = 9;

/// One frame of the peer wire protocol, after the 4-byte length prefix has
/// been stripped. A zero-length frame is a keep-alive.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PeerMessage {
    KeepAlive,
    Choke,
    Unchoke,
    Interested,
    NotInterested,
    Have { index: u32 },
    Bitfield { raw: Vec<u8> },
    Request { index: u32, begin: u32, length: u32 },
    Piece { index: u32, begin: u32, block: Vec<u8> },
    Cancel { index: u32, begin: u32, length: u32 },
    Port { port: u16 },
    /// Ids this client does not speak. Logged and skipped by the session.
    Unknown { id: u8 },
}

impl PeerMessage {
    /// Serializes the message with its length prefix, ready for the socket.
    pub fn to_frame(&self) -> Vec<u8> {
        match self {
            PeerMessage::KeepAlive => vec![0, 0, 0, 0],
            PeerMessage::Choke => frame_id_only(ID_CHOKE),
            PeerMessage::Unchoke => frame_id_only(ID_UNCHOKE),
            PeerMessage::Interested => frame_id_only(ID_INTERESTED),
            PeerMessage::NotInterested => frame_id_only(ID_NOT_INTERESTED),
            PeerMessage::Have { index } => {
                let mut buf = frame_header(5, ID_HAVE);
                buf.extend_from_slice(&index.to_be_bytes());
                buf
            }
            PeerMessage::Bitfield { raw } => {
                let mut buf = frame_header(1 + raw.len() as u32, ID_BITFIELD);
                buf.extend_from_slice(raw);
                buf
            }
            PeerMessage::Request {
                index,
                begin,
                length,
            } => frame_triple(ID_REQUEST, *index, *begin, *length),
            PeerMessage::Piece {
                index,
                begin,
                block,
            } => {
                let mut buf = frame_header(9 + block.len() as u32, ID_PIECE);
                buf.extend_from_slice(&index.to_be_bytes());
                buf.extend_from_slice(&begin.to_be_bytes());
                buf.extend_from_slice(block);
                buf
            }
            PeerMessage::Cancel {
                index,
                begin,
                length,
            } => frame_triple(ID_CANCEL, *index, *begin, *length),
            PeerMessage::Port { port } => {
                let mut buf = frame_header(3, ID_PORT);
                buf.extend_from_slice(&port.to_be_bytes());
                buf
            }
            PeerMessage::Unknown { id } => frame_id_only(*id),
        }
    }

    /// Parses a frame payload. Unknown ids parse to [`PeerMessage::Unknown`]
    /// so callers can skip them; malformed payloads for known ids are errors.
    pub fn parse(payload: &[u8]) -> Result<Self> {
        if payload.is_empty() {
            return Ok(PeerMessage::KeepAlive);
        }

        let id = payload[0];
        let body = &payload[1..];
        match id {
            ID_CHOKE => Ok(PeerMessage::Choke),
            ID_UNCHOKE => Ok(PeerMessage::Unchoke),
            ID_INTERESTED => Ok(PeerMessage::Interested),
            ID_NOT_INTERESTED => Ok(PeerMessage::NotInterested),
            ID_HAVE => {
                let index = read_u32(body, 0, "have")?;
                Ok(PeerMessage::Have { index })
            }
            ID_BITFIELD => Ok(PeerMessage::Bitfield {
                raw: body.to_vec(),
            }),
            ID_REQUEST => {
                let (index, begin, length) = read_triple(body, "request")?;
                Ok(PeerMessage::Request {
                    index,
                    begin,
                    length,
                })
            }
            ID_PIECE => {
                if body.len() < 8 {
                    anyhow::bail!("piece message truncated ({} bytes)", body.len());
                }
                let index = read_u32(body, 0, "piece")?;
                let begin = read_u32(body, 4, "piece")?;
                Ok(PeerMessage::Piece {
                    index,
                    begin,
                    block: body[8..].to_vec(),
                })
            }
            ID_CANCEL => {
                let (index, begin, length) = read_triple(body, "cancel")?;
                Ok(PeerMessage::Cancel {
                    index,
                    begin,
                    length,
                })
            }
            ID_PORT => {
                if body.len() < 2 {
                    anyhow::bail!("port message truncated");
                }
                Ok(PeerMessage::Port {
                    port: u16::from_be_bytes([body[0], body[1]]),
                })
            }
            id => Ok(PeerMessage::Unknown { id }),
        }
    }
}

fn frame_header(payload_len: u32, id: u8) -> Vec<u8> {
    let mut buf = Vec::with_capacity(4 + payload_len as usize);
    buf.extend_from_slice(&payload_len.to_be_bytes());
    buf.push(id);
    buf
}

fn frame_id_only(id: u8) -> Vec<u8> {
    frame_header(1, id)
}

fn frame_triple(id: u8, index: u32, begin: u32, length: u32) -> Vec<u8> {
    let mut buf = frame_header(13, id);
    buf.extend_from_slice(&index.to_be_bytes());
    buf.extend_from_slice(&begin.to_be_bytes());
    buf.extend_from_slice(&length.to_be_bytes());
    buf
}

fn read_u32(body: &[u8], at: usize, what: &str) -> Result<u32> {
    let bytes = body
        .get(at..at + 4)
        .ok_or_else(|| anyhow::anyhow!("{} message truncated", what))?;
    Ok(u32::from_be_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]))
}

fn read_triple(body: &[u8], what: &str) -> Result<(u32, u32, u32)> {
    Ok((
        read_u32(body, 0, what)?,
        read_u32(body, 4, what)?,
        read_u32(body, 8, what)?,
    ))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn round_trip(msg: PeerMessage) {
        let frame = msg.to_frame();
        let len = u32::from_be_bytes([frame[0], frame[1], frame[2], frame[3]]) as usize;
        assert_eq!(len, frame.len() - 4);
        assert_eq!(PeerMessage::parse(&frame[4..]).unwrap(), msg);
    }

    #[test]
    fn keep_alive_is_empty_frame() {
        assert_eq!(PeerMessage::KeepAlive.to_frame(), vec![0, 0, 0, 0]);
        assert_eq!(PeerMessage::parse(&[]).unwrap(), PeerMessage::KeepAlive);
    }

    #[test]
    fn control_messages_round_trip() {
        round_trip(PeerMessage::Choke);
        round_trip(PeerMessage::Unchoke);
        round_trip(PeerMessage::Interested);
        round_trip(PeerMessage::NotInterested);
        round_trip(PeerMessage::Have { index: 7 });
        round_trip(PeerMessage::Port { port: 6881 });
    }

    #[test]
    fn request_wire_layout() {
        let frame = PeerMessage::Request {
            index: 1,
            begin: 16384,
            length: 16384,
        }
        .to_frame();
        assert_eq!(
            frame,
            vec![0, 0, 0, 13, 6, 0, 0, 0, 1, 0, 0, 0x40, 0, 0, 0, 0x40, 0]
        );
    }

    #[test]
    fn piece_carries_block_bytes() {
        round_trip(PeerMessage::Piece {
            index: 3,
            begin: 32768,
            block: vec![0xab; 64],
        });
    }

    #[test]
    fn bitfield_round_trips() {
        round_trip(PeerMessage::Bitfield {
            raw: vec![0b1010_0000, 0b0000_0001],
        });
    }

    #[test]
    fn unknown_id_is_not_an_error() {
        assert_eq!(
            PeerMessage::parse(&[42, 1, 2, 3]).unwrap(),
            PeerMessage::Unknown { id: 42 }
        );
    }

    #[test]
    fn truncated_known_messages_are_errors() {
        assert!(PeerMessage::parse(&[ID_HAVE, 0, 0]).is_err());
        assert!(PeerMessage::parse(&[ID_REQUEST, 0, 0, 0, 1]).is_err());
        assert!(PeerMessage::parse(&[ID_PIECE, 0, 0, 0, 1, 0]).is_err());
    }
}
