pub mod decode;
pub mod encode;
pub mod metainfo;

pub use decode::{decode, decode_with_info_range, DecodeError, Value};
pub use encode::encode;
pub use metainfo::{MetainfoError, TorrentMeta};
