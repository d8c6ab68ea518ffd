use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::Parser;
use log::error;

use remora_bencode::TorrentMeta;
use remora_core::{Coordinator, Settings};

#[derive(Parser, Debug)]
#[command(name = "remora", version, about = "A leeching BitTorrent client")]
struct Args {
    /// Path to the .torrent file (single-file torrents only)
    torrent: PathBuf,

    /// Directory the downloaded file is written into
    #[arg(short, long, default_value = ".")]
    output_dir: PathBuf,

    /// Port reported to trackers
    #[arg(short, long, default_value_t = 6881)]
    port: u16,
}

fn run(args: Args) -> Result<()> {
    let meta = TorrentMeta::load(&args.torrent)
        .with_context(|| format!("load {}", args.torrent.display()))?;

    let settings = Settings {
        output_dir: args.output_dir,
        listen_port: args.port,
        ..Settings::default()
    };

    let summary = Coordinator::new(meta, settings)?.run()?;
    println!(
        "saved {} ({} bytes, {} pieces)",
        summary.file_path.display(),
        summary.total_bytes,
        summary.pieces,
    );
    Ok(())
}

fn main() {
    pretty_env_logger::init_timed();

    if let Err(err) = run(Args::parse()) {
        error!("{:#}", err);
        eprintln!("error: {:#}", err);
        std::process::exit(1);
    }
}
