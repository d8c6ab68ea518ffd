pub mod disk;
pub mod piece;
pub mod store;

pub use piece::{PieceCompletion, PieceState};
pub use store::{PieceStore, StoreError, StoreStats};
