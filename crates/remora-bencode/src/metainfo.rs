use std::path::Path;

use thiserror::Error;

use crate::decode::{decode_with_info_range, DecodeError, Value};
use remora_util::hash;

const HASH_LEN: usize = 20;

#[derive(Error, Debug)]
pub enum MetainfoError {
    #[error("bencode decode error: {0}")]
    Decode(#[from] DecodeError),
    #[error("could not read metainfo file: {0}")]
    Io(#[from] std::io::Error),
    #[error("missing required field: {0}")]
    MissingField(&'static str),
    #[error("invalid field: {0}")]
    InvalidField(&'static str),
    #[error("pieces length is not a multiple of 20")]
    InvalidPiecesLength,
    #[error("multi-file torrents are not supported")]
    MultiFile,
    #[error("no usable tracker URL")]
    NoTrackers,
    #[error("unsafe file name: {0}")]
    UnsafeName(String),
}

pub type Result<T> = std::result::Result<T, MetainfoError>;

/// Immutable description of a single-file torrent, built once from the
/// metainfo descriptor and shared read-only afterwards.
#[derive(Debug, Clone)]
pub struct TorrentMeta {
    pub info_hash: [u8; 20],
    pub piece_hashes: Vec<[u8; 20]>,
    pub piece_length: u64,
    pub total_length: u64,
    pub file_name: String,
    /// Tracker URLs, deduplicated, primary announce first.
    pub announce_list: Vec<String>,
}

impl TorrentMeta {
    pub fn load(path: &Path) -> Result<Self> {
        let data = std::fs::read(path)?;
        Self::from_bytes(&data)
    }

    pub fn from_bytes(data: &[u8]) -> Result<Self> {
        let (root, info_span) = decode_with_info_range(data)?;
        let root_dict = root
            .as_dict()
            .ok_or(MetainfoError::InvalidField("root must be a dictionary"))?;

        let announce_list = collect_trackers(&root)?;

        let info = root_dict
            .get(b"info".as_ref())
            .ok_or(MetainfoError::MissingField("info"))?;
        let info_dict = info
            .as_dict()
            .ok_or(MetainfoError::InvalidField("info must be a dictionary"))?;

        if info_dict.contains_key(b"files".as_ref()) {
            return Err(MetainfoError::MultiFile);
        }

        let file_name = info_dict
            .get(b"name".as_ref())
            .and_then(|v| v.as_str())
            .ok_or(MetainfoError::MissingField("name"))
            .and_then(sanitize_file_name)?;

        let piece_length = info_dict
            .get(b"piece length".as_ref())
            .and_then(|v| v.as_integer())
            .ok_or(MetainfoError::MissingField("piece length"))?;
        if piece_length <= 0 {
            return Err(MetainfoError::InvalidField("piece length must be positive"));
        }
        let piece_length = piece_length as u64;

        let total_length = info_dict
            .get(b"length".as_ref())
            .and_then(|v| v.as_integer())
            .ok_or(MetainfoError::MissingField("length"))?;
        if total_length <= 0 {
            return Err(MetainfoError::InvalidField("length must be positive"));
        }
        let total_length = total_length as u64;

        let pieces = info_dict
            .get(b"pieces".as_ref())
            .and_then(|v| v.as_bytes())
            .ok_or(MetainfoError::MissingField("pieces"))?;
        if pieces.is_empty() || pieces.len() % HASH_LEN != 0 {
            return Err(MetainfoError::InvalidPiecesLength);
        }

        let mut piece_hashes = Vec::with_capacity(pieces.len() / HASH_LEN);
        for chunk in pieces.chunks_exact(HASH_LEN) {
            let mut digest = [0u8; HASH_LEN];
            digest.copy_from_slice(chunk);
            piece_hashes.push(digest);
        }

        let count = piece_hashes.len() as u64;
        if count * piece_length < total_length || total_length <= (count - 1) * piece_length {
            return Err(MetainfoError::InvalidField(
                "piece count does not cover total length",
            ));
        }

        let (start, end) = info_span.ok_or(MetainfoError::MissingField("info"))?;
        let info_hash = hash::sha1(&data[start..end]);

        Ok(TorrentMeta {
            info_hash,
            piece_hashes,
            piece_length,
            total_length,
            file_name,
            announce_list,
        })
    }

    pub fn piece_count(&self) -> usize {
        self.piece_hashes.len()
    }

    /// Size of piece `index` in bytes; every piece is `piece_length` except
    /// possibly the last.
    pub fn piece_size(&self, index: u32) -> u32 {
        let start = index as u64 * self.piece_length;
        let end = (start + self.piece_length).min(self.total_length);
        (end - start) as u32
    }

    pub fn piece_offset(&self, index: u32) -> u64 {
        index as u64 * self.piece_length
    }
}

/// Flattens `announce` plus every `announce-list` tier into one deduplicated
/// URL list, preserving discovery order with the primary announce first.
fn collect_trackers(root: &Value) -> Result<Vec<String>> {
    let mut urls: Vec<String> = Vec::new();

    if let Some(primary) = root.get(b"announce").and_then(|v| v.as_str()) {
        if !primary.is_empty() {
            urls.push(primary.to_string());
        }
    }

    if let Some(tiers) = root.get(b"announce-list").and_then(|v| v.as_list()) {
        for tier in tiers {
            for url in tier.as_list().unwrap_or(&[]) {
                if let Some(url) = url.as_str() {
                    if !url.is_empty() && !urls.iter().any(|known| known == url) {
                        urls.push(url.to_string());
                    }
                }
            }
        }
    }

    if urls.is_empty() {
        return Err(MetainfoError::NoTrackers);
    }
    Ok(urls)
}

fn sanitize_file_name(name: &str) -> Result<String> {
    if name.is_empty() || name == "." || name == ".." {
        return Err(MetainfoError::UnsafeName(name.to_string()));
    }
    if name.contains('/') || name.contains('\\') {
        return Err(MetainfoError::UnsafeName(name.to_string()));
    }
    Ok(name.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn bstr(data: &[u8], out: &mut Vec<u8>) {
        out.extend_from_slice(data.len().to_string().as_bytes());
        out.push(b':');
        out.extend_from_slice(data);
    }

    /// Assembles a metainfo document around a raw `info` dictionary, with an
    /// optional `announce` and optional `announce-list` tiers.
    fn build_doc(announce: Option<&str>, tiers: &[&[&str]], info: &[u8]) -> Vec<u8> {
        let mut doc = vec![b'd'];
        if let Some(url) = announce {
            bstr(b"announce", &mut doc);
            bstr(url.as_bytes(), &mut doc);
        }
        if !tiers.is_empty() {
            bstr(b"announce-list", &mut doc);
            doc.push(b'l');
            for tier in tiers {
                doc.push(b'l');
                for url in *tier {
                    bstr(url.as_bytes(), &mut doc);
                }
                doc.push(b'e');
            }
            doc.push(b'e');
        }
        bstr(b"info", &mut doc);
        doc.extend_from_slice(info);
        doc.push(b'e');
        doc
    }

    fn info_dict() -> Vec<u8> {
        let mut pieces = vec![b'A'; 20];
        pieces.extend_from_slice(&[b'B'; 20]);
        small_info(&pieces, 40, 32, "file.bin")
    }

    fn small_info(pieces: &[u8], length: i64, piece_length: i64, name: &str) -> Vec<u8> {
        let mut info = vec![b'd'];
        bstr(b"length", &mut info);
        info.extend_from_slice(format!("i{}e", length).as_bytes());
        bstr(b"name", &mut info);
        bstr(name.as_bytes(), &mut info);
        bstr(b"piece length", &mut info);
        info.extend_from_slice(format!("i{}e", piece_length).as_bytes());
        bstr(b"pieces", &mut info);
        bstr(pieces, &mut info);
        info.push(b'e');
        info
    }

    fn single_file_doc() -> Vec<u8> {
        build_doc(
            Some("http://tracker.one/ann"),
            &[
                &["http://tracker.one/ann", "udp://tracker.two:80"],
                &["http://tracker.three/a"],
            ],
            &info_dict(),
        )
    }

    #[test]
    fn parses_single_file_torrent() {
        let meta = TorrentMeta::from_bytes(&single_file_doc()).unwrap();
        assert_eq!(meta.file_name, "file.bin");
        assert_eq!(meta.piece_length, 32);
        assert_eq!(meta.total_length, 40);
        assert_eq!(meta.piece_count(), 2);
        assert_eq!(meta.piece_hashes[0], [b'A'; 20]);
        assert_eq!(meta.piece_hashes[1], [b'B'; 20]);
    }

    #[test]
    fn info_hash_is_sha1_of_raw_info_bytes() {
        let meta = TorrentMeta::from_bytes(&single_file_doc()).unwrap();
        assert_eq!(meta.info_hash, hash::sha1(&info_dict()));
    }

    #[test]
    fn trackers_are_deduped_in_discovery_order() {
        let meta = TorrentMeta::from_bytes(&single_file_doc()).unwrap();
        assert_eq!(
            meta.announce_list,
            vec![
                "http://tracker.one/ann".to_string(),
                "udp://tracker.two:80".to_string(),
                "http://tracker.three/a".to_string(),
            ]
        );
    }

    #[test]
    fn announce_list_alone_is_enough() {
        let doc = build_doc(
            None,
            &[&["udp://tracker.two:80"]],
            &small_info(&[b'A'; 20], 4, 4, "f"),
        );
        let meta = TorrentMeta::from_bytes(&doc).unwrap();
        assert_eq!(meta.announce_list, vec!["udp://tracker.two:80".to_string()]);
    }

    #[test]
    fn last_piece_may_be_short() {
        let meta = TorrentMeta::from_bytes(&single_file_doc()).unwrap();
        assert_eq!(meta.piece_size(0), 32);
        assert_eq!(meta.piece_size(1), 8);
        assert_eq!(meta.piece_offset(1), 32);
    }

    #[test]
    fn rejects_multi_file_torrents() {
        let mut info = vec![b'd'];
        bstr(b"files", &mut info);
        info.extend_from_slice(b"ld");
        bstr(b"length", &mut info);
        info.extend_from_slice(b"i4e");
        bstr(b"path", &mut info);
        info.push(b'l');
        bstr(b"f", &mut info);
        info.extend_from_slice(b"eee");
        bstr(b"name", &mut info);
        bstr(b"d", &mut info);
        bstr(b"piece length", &mut info);
        info.extend_from_slice(b"i4e");
        bstr(b"pieces", &mut info);
        bstr(&[b'A'; 20], &mut info);
        info.push(b'e');

        let doc = build_doc(Some("http://t/a"), &[], &info);
        assert!(matches!(
            TorrentMeta::from_bytes(&doc),
            Err(MetainfoError::MultiFile)
        ));
    }

    #[test]
    fn rejects_ragged_pieces_field() {
        let doc = build_doc(Some("http://t/a"), &[], &small_info(&[b'A'; 19], 4, 4, "f"));
        assert!(matches!(
            TorrentMeta::from_bytes(&doc),
            Err(MetainfoError::InvalidPiecesLength)
        ));
    }

    #[test]
    fn rejects_piece_count_mismatch() {
        // One 32-byte piece cannot cover 40 bytes.
        let doc = build_doc(Some("http://t/a"), &[], &small_info(&[b'A'; 20], 40, 32, "f"));
        assert!(matches!(
            TorrentMeta::from_bytes(&doc),
            Err(MetainfoError::InvalidField(_))
        ));
    }

    #[test]
    fn rejects_missing_trackers() {
        let doc = build_doc(None, &[], &small_info(&[b'A'; 20], 4, 4, "f"));
        assert!(matches!(
            TorrentMeta::from_bytes(&doc),
            Err(MetainfoError::NoTrackers)
        ));
    }

    #[test]
    fn rejects_path_separators_in_name() {
        let doc = build_doc(Some("http://t/a"), &[], &small_info(&[b'A'; 20], 4, 4, "a/b"));
        assert!(matches!(
            TorrentMeta::from_bytes(&doc),
            Err(MetainfoError::UnsafeName(_))
        ));
    }
}
