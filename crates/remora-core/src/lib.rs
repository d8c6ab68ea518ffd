pub mod announcer;
pub mod coordinator;
pub mod settings;
pub mod types;

pub use coordinator::Coordinator;
pub use settings::Settings;
pub use types::DownloadSummary;
