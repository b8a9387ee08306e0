// vodl: CLI front-end for the vodl-engine HLS downloader.

use std::path::PathBuf;
use std::process::ExitCode;
use std::time::Duration;

use clap::{Parser, Subcommand};
use tracing::debug;
use tracing_subscriber::EnvFilter;

use vodl_engine::{
    DownloadRequest, Engine, EngineConfig, JobState, Playlist, PlaylistHint, Source,
};

#[derive(Parser)]
#[command(name = "vodl", version, about = "HLS VOD downloader")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Download a media playlist and mux it into a single file
    Download {
        /// Playlist URL (http/https) or local file path
        url: String,

        /// Output file name (default: derived from the source)
        #[arg(long)]
        name: Option<String>,

        /// Verbose progress logging
        #[arg(short, long)]
        verbose: bool,

        /// Decryption key override (hex, 16 bytes)
        #[arg(long, value_name = "HEX")]
        key: Option<String>,

        /// IV override (hex, 16 bytes)
        #[arg(long, value_name = "HEX")]
        iv: Option<String>,

        /// Output directory
        #[arg(short, long, default_value = ".")]
        output: PathBuf,

        /// Muxer binary
        #[arg(long, default_value = "ffmpeg")]
        muxer: PathBuf,
    },

    /// List the variant streams of a master playlist
    Extract {
        /// Playlist URL (http/https) or local file path
        url: String,
    },

    /// Show version, defaults, and muxer availability
    Info,
}

fn init_tracing(verbose: bool) {
    let default = if verbose { "vodl=debug,vodl_engine=debug" } else { "warn" };
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default)),
        )
        .init();
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    match cli.command {
        Commands::Download {
            url,
            name,
            verbose,
            key,
            iv,
            output,
            muxer,
        } => {
            init_tracing(verbose);
            download(url, name, verbose, key, iv, output, muxer).await
        }
        Commands::Extract { url } => {
            init_tracing(false);
            extract(url).await
        }
        Commands::Info => {
            init_tracing(false);
            info()
        }
    }
}

async fn download(
    url: String,
    name: Option<String>,
    verbose: bool,
    key: Option<String>,
    iv: Option<String>,
    output: PathBuf,
    muxer: PathBuf,
) -> ExitCode {
    let config = EngineConfig {
        muxer_path: muxer,
        ..Default::default()
    };
    let engine = match Engine::new(config) {
        Ok(engine) => engine,
        Err(e) => {
            eprintln!("error [{}]: {e}\nhint: {}", e.code(), e.suggestion());
            return ExitCode::FAILURE;
        }
    };

    let source = match Source::parse(&url) {
        Ok(source) => source,
        Err(e) => {
            eprintln!("error [{}]: {e}\nhint: {}", e.code(), e.suggestion());
            return ExitCode::FAILURE;
        }
    };

    let mut request = DownloadRequest::new(source, output);
    request.output_name = name;
    request.key_hex = key;
    request.iv_hex = iv;
    request.verbose = verbose;

    let id = match engine.submit(request) {
        Ok(id) => id,
        Err(e) => {
            eprintln!("error [{}]: {e}\nhint: {}", e.code(), e.suggestion());
            return ExitCode::FAILURE;
        }
    };
    println!("downloading ({id})...");

    let mut interrupted = false;
    let state = loop {
        let poll = tokio::time::sleep(Duration::from_millis(250));
        tokio::select! {
            _ = tokio::signal::ctrl_c(), if !interrupted => {
                eprintln!("interrupt received, cancelling...");
                interrupted = true;
                let _ = engine.cancel(&id);
            }
            _ = poll => {}
        }
        match engine.status(&id) {
            Some(state) if state.is_terminal() => break state,
            Some(state) => debug!(?state, "waiting"),
            None => {
                eprintln!("error: job vanished from the engine");
                return ExitCode::FAILURE;
            }
        }
    };

    match state {
        JobState::Succeeded => {
            println!("done");
            ExitCode::SUCCESS
        }
        JobState::Cancelled => {
            eprintln!("cancelled");
            ExitCode::FAILURE
        }
        _ => {
            match engine.job_error(&id) {
                Some(e) => eprintln!("error [{}]: {e}\nhint: {}", e.code(), e.suggestion()),
                None => eprintln!("error: job failed"),
            }
            ExitCode::FAILURE
        }
    }
}

async fn extract(url: String) -> ExitCode {
    // Extraction has no per-job state to track, so it runs on the
    // process-wide engine surface.
    if let Err(e) = vodl_engine::initialize(EngineConfig::default()) {
        eprintln!("error [{}]: {e}", e.code());
        return ExitCode::FAILURE;
    }
    let source = match Source::parse(&url) {
        Ok(source) => source,
        Err(e) => {
            eprintln!("error [{}]: {e}", e.code());
            return ExitCode::FAILURE;
        }
    };

    // Try the master flavor first; fall back to a media summary.
    match vodl_engine::parse(&source, PlaylistHint::Master).await {
        Ok(Playlist::Master(master)) => {
            println!("{} variant stream(s):", master.variants.len());
            for variant in &master.variants {
                let resolution = variant
                    .resolution
                    .map(|(w, h)| format!("{w}x{h}"))
                    .unwrap_or_else(|| "-".to_owned());
                let codecs = variant.codecs.as_deref().unwrap_or("-");
                println!(
                    "  {:>9} bps  {:>9}  {:<24} {}",
                    variant.bandwidth, resolution, codecs, variant.uri
                );
            }
            ExitCode::SUCCESS
        }
        Ok(Playlist::Media(_)) => unreachable!("master hint never yields a media playlist"),
        Err(_) => match vodl_engine::parse(&source, PlaylistHint::Media).await {
            Ok(Playlist::Media(media)) => {
                println!(
                    "media playlist: {} segment(s), {:.1}s total{}",
                    media.segments.len(),
                    media.total_duration(),
                    if media.has_encrypted_segments() {
                        ", AES-128 encrypted"
                    } else {
                        ""
                    }
                );
                ExitCode::SUCCESS
            }
            Ok(Playlist::Master(_)) => unreachable!("media hint never yields a master playlist"),
            Err(e) => {
                eprintln!("error [{}]: {e}\nhint: {}", e.code(), e.suggestion());
                ExitCode::FAILURE
            }
        },
    }
}

fn info() -> ExitCode {
    let config = EngineConfig::default();
    let muxer = vodl_engine::mux::MuxerAdapter::new(config.muxer_path.clone());
    println!("vodl {}", env!("CARGO_PKG_VERSION"));
    println!("muxer:                    {}", config.muxer_path.display());
    println!(
        "muxer available:          {}",
        if muxer.ensure_available().is_ok() { "yes" } else { "no" }
    );
    println!(
        "max concurrent downloads: {}",
        config.max_concurrent_downloads
    );
    println!("max concurrent tasks:     {}", config.max_concurrent_tasks);
    println!(
        "download timeout:         {}s",
        config.download_timeout.as_secs()
    );
    ExitCode::SUCCESS
}
