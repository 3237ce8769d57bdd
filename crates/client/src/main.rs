mod cli;
mod shutdown;

use std::sync::Arc;
use std::time::Duration;

use clap::Parser;

use goclient_engine::gtp::parse_version;
use goclient_engine::management::{Management, Settings};
use goclient_engine::sprt::SprtTracker;

use crate::cli::Cli;
use crate::shutdown::{ShutdownController, spawn_console_quit_reader, spawn_ctrl_c_handler};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let min_engine_version = parse_version(&cli.engine_version)
        .ok_or_else(|| anyhow::anyhow!("invalid --engine-version: {}", cli.engine_version))?;

    let gpu_flags: Vec<String> = cli.gpus.iter().map(|id| format!(" --gpu={id}")).collect();

    let settings = Settings {
        backend_url: cli.backend_url.clone(),
        engine_path: cli.engine_path.clone(),
        client_version: cli.client_version,
        engine_version: Some(cli.engine_version.clone()),
        min_engine_version,
        gpu_flags,
        games_per_gpu: cli.games_num,
        work_dir: cli.work_dir.clone(),
        keep_sgf_dir: cli.keep_sgf.clone(),
        debug_dir: cli.debug.clone(),
        dump_debug: cli.debug.is_some(),
        single: cli.single,
        maxgames: cli.maxgames,
    };

    let sprt = Arc::new(SprtTracker::new(0.0, 35.0, 0.05, 0.05));
    let management = Management::new(settings, Some(sprt))?;

    if cli.erase {
        management.erase_stale_networks().await?;
        return Ok(());
    }

    println!("goclient {} starting", env!("CARGO_PKG_VERSION"));

    let (shutdown_tx, shutdown_rx) = tokio::sync::mpsc::unbounded_channel();

    let controller = Arc::new(ShutdownController::new());
    spawn_ctrl_c_handler(controller, shutdown_tx.clone());

    if !cli.no_console {
        spawn_console_quit_reader(shutdown_tx.clone());
    }

    if let Some(minutes) = cli.timeout {
        let timeout_tx = shutdown_tx.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(minutes * 60)).await;
            let _ = timeout_tx.send(goclient_engine::ShutdownSignal::Graceful);
        });
    }
    drop(shutdown_tx);

    match management.run(shutdown_rx).await {
        Ok(()) => {
            println!("goclient exiting cleanly");
            Ok(())
        }
        Err(e) => {
            eprintln!("goclient exiting with fatal error: {e:#}");
            Err(e)
        }
    }
}
