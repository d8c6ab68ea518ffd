//! SHA-1 helpers shared by the metainfo loader, the piece store and the
//! tracker query builder.

pub fn sha1(data: &[u8]) -> [u8; 20] {
    use sha1::{Digest, Sha1};
    let digest = Sha1::digest(data);
    let mut out = [0u8; 20];
    out.copy_from_slice(&digest);
    out
}

pub fn hex(data: &[u8]) -> String {
    let mut out = String::with_capacity(data.len() * 2);
    for b in data {
        out.push_str(&format!("{:02x}", b));
    }
    out
}

/// Percent-encodes raw bytes for a tracker query string. Only unreserved
/// characters pass through unescaped.
pub fn percent_encode(data: &[u8]) -> String {
    let mut out = String::with_capacity(data.len() * 3);
    for &b in data {
        match b {
            b'0'..=b'9' | b'a'..=b'z' | b'A'..=b'Z' | b'-' | b'_' | b'.' | b'~' => {
                out.push(b as char)
            }
            _ => out.push_str(&format!("%{:02X}", b)),
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sha1_known_vector() {
        assert_eq!(
            hex(&sha1(b"abc")),
            "a9993e364706816aba3e25717850c26c9cd0d89d"
        );
    }

    #[test]
    fn percent_encode_passes_unreserved() {
        assert_eq!(percent_encode(b"aZ9-_.~"), "aZ9-_.~");
    }

    #[test]
    fn percent_encode_escapes_binary() {
        assert_eq!(percent_encode(&[0x00, 0xff, b' ']), "%00%FF%20");
    }
}
