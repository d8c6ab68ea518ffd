pub mod bitfield;
pub mod hash;
pub mod ids;

pub use bitfield::Bitfield;
