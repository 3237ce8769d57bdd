use std::sync::Arc;
use std::sync::atomic::{AtomicU8, Ordering};

use tokio::sync::mpsc;

use goclient_engine::ShutdownSignal;

#[derive(Debug)]
pub struct ShutdownController {
    forced: AtomicU8,
}

impl ShutdownController {
    pub fn new() -> Self {
        Self {
            forced: AtomicU8::new(0),
        }
    }

    pub fn bump_forced(&self) -> u8 {
        self.forced.fetch_add(1, Ordering::SeqCst) + 1
    }
}

pub fn spawn_ctrl_c_handler(
    shutdown: Arc<ShutdownController>,
    shutdown_tx: mpsc::UnboundedSender<ShutdownSignal>,
) {
    tokio::spawn(async move {
        loop {
            if tokio::signal::ctrl_c().await.is_err() {
                return;
            }
            let n = shutdown.bump_forced();
            if n == 1 {
                let _ = shutdown_tx.send(ShutdownSignal::Graceful);
            } else {
                let _ = shutdown_tx.send(ShutdownSignal::Immediate);
                return;
            }
        }
    });
}

/// Spawns a blocking stdin reader that sends a graceful shutdown signal the
/// first time it sees a `q` (followed by Enter), unless `--no-console` asked
/// us to skip it — e.g. because stdin isn't an interactive terminal.
pub fn spawn_console_quit_reader(shutdown_tx: mpsc::UnboundedSender<ShutdownSignal>) {
    std::thread::spawn(move || {
        let mut line = String::new();
        loop {
            line.clear();
            if std::io::stdin().read_line(&mut line).unwrap_or(0) == 0 {
                return;
            }
            if line.trim().eq_ignore_ascii_case("q") {
                let _ = shutdown_tx.send(ShutdownSignal::Graceful);
                return;
            }
        }
    });
}
