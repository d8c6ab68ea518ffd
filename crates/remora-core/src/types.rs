use std::path::PathBuf;
use std::time::Duration;

/// Final report of a successful download.
#[derive(Clone, Debug)]
pub struct DownloadSummary {
    pub file_path: PathBuf,
    pub total_bytes: u64,
    pub pieces: usize,
    pub elapsed: Duration,
}

impl DownloadSummary {
    pub fn mean_rate_bytes_per_sec(&self) -> u64 {
        let secs = self.elapsed.as_secs_f64();
        if secs <= 0.0 {
            return self.total_bytes;
        }
        (self.total_bytes as f64 / secs) as u64
    }
}
