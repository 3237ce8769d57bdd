use clap::Parser;
use reqwest::Url;

#[cfg(feature = "prod-backend")]
const DEFAULT_BACKEND_URL: &str = "https://zero.sjeng.org/";

#[cfg(not(feature = "prod-backend"))]
const DEFAULT_BACKEND_URL: &str = "http://127.0.0.1:8080";

fn default_backend_url() -> Url {
    Url::parse(DEFAULT_BACKEND_URL).expect("DEFAULT_BACKEND_URL must be a valid URL")
}

/// Distributed self-play worker: fetches work orders from a coordination
/// server, drives a GTP engine subprocess to execute them, and uploads the
/// resulting games.
#[derive(Debug, Clone, Parser)]
#[command(name = "goclient", version, about = "Self-play/validation GTP worker")]
pub struct Cli {
    /// Base URL of the coordination server.
    #[arg(long, env = "LEELAZ_BACKEND_URL", default_value_t = default_backend_url())]
    pub backend_url: Url,

    /// Path to the GTP engine binary to drive.
    #[arg(long, env = "LEELAZ_ENGINE_PATH", default_value = "./leelaz")]
    pub engine_path: String,

    /// Minimum accepted engine version, e.g. "0.17".
    #[arg(long, default_value = "0.17")]
    pub engine_version: String,

    /// Client protocol version reported to the server.
    #[arg(long, default_value_t = 22)]
    pub client_version: u32,

    /// Number of concurrent games per accelerator (or in total, if `--gpus`
    /// is not given).
    #[arg(short = 'g', long = "games-num", default_value_t = 1)]
    pub games_num: usize,

    /// GPU identifier to pass to the engine (`--gpu=<id>`); repeat for
    /// multiple accelerators.
    #[arg(short = 'u', long = "gpus")]
    pub gpus: Vec<String>,

    /// Directory to archive a copy of every finished game's SGF into.
    #[arg(short = 'k', long = "keep-sgf")]
    pub keep_sgf: Option<std::path::PathBuf>,

    /// Directory to archive training/debug dumps into; also enables
    /// debug-dump generation for self-play games.
    #[arg(short = 'd', long = "debug")]
    pub debug: Option<std::path::PathBuf>,

    /// Working directory for in-progress game files and the checkpoint
    /// queue.
    #[arg(long, default_value = ".")]
    pub work_dir: std::path::PathBuf,

    /// Exit after this many minutes, finishing in-flight games first.
    #[arg(short = 't', long)]
    pub timeout: Option<u64>,

    /// Exit after completing a single game.
    #[arg(short = 's', long)]
    pub single: bool,

    /// Exit after completing this many games in total.
    #[arg(long)]
    pub maxgames: Option<u64>,

    /// Delete cached network files not referenced by any queued order, then
    /// exit.
    #[arg(short = 'e', long)]
    pub erase: bool,

    /// Disable the interactive `q<Enter>`-to-quit console reader (useful
    /// when stdin is not a terminal, e.g. under a supervisor).
    #[arg(long)]
    pub no_console: bool,
}
