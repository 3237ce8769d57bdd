//! C8: Management — the top-level scheduler. Owns the task-server client,
//! the [`crate::store::OrderStore`], every [`crate::worker::WorkerHandle`],
//! and (during a validation run) the [`crate::sprt::SprtTracker`]. Routes
//! each [`crate::worker::WorkerEvent`] to an upload, a checkpoint write, or a
//! process-ending decision, and drives the startup/shutdown sequence.
//!
//! Grounded on `autogtp/Management.cpp`: `wait()`'s startup sequence (drain
//! the upload queue, prefer stored Orders before asking the server for new
//! ones, spawn one Worker per accelerator slot), `getResult()`'s dispatch on
//! Outcome kind, and `~Management()`'s `storeGames()`-then-join shutdown. No
//! UI/progress-bar concern is carried — see SPEC_FULL.md §7 on plain
//! `println!` status lines replacing the teacher's `indicatif` bars, which
//! have no analogue in an engine that is never driven by a TTY frontend of
//! its own.

use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;

use crate::backend;
use crate::gtp::VersionTriple;
use crate::job::JobContext;
use crate::order::{Order, OrderKind};
use crate::outcome::Outcome;
use crate::sprt::{GameResult, SprtTracker};
use crate::store::{OrderStore, QueuedUpload};
use crate::worker::{self, WorkerEvent, WorkerHandle};

/// How long [`Management::drain_upload_queue`] waits between two successful
/// uploads, so a reconnecting client doesn't hammer the server with a burst.
const UPLOAD_PACING: Duration = Duration::from_secs(10);

/// A request to wind down, fed by whichever of the timer / stdin reader /
/// SIGINT handler / game-budget check fires first (SPEC_FULL.md §9).
#[derive(Debug, Clone, Copy)]
pub enum ShutdownSignal {
    /// Finish checkpointing in-flight games, then exit.
    Graceful,
    /// A second interrupt: stop waiting on in-flight games.
    Immediate,
}

/// Configuration built once from CLI flags and environment variables,
/// threaded explicitly into every component that needs it (SPEC_FULL.md §3)
/// rather than re-read from a persisted config file.
#[derive(Debug, Clone)]
pub struct Settings {
    pub backend_url: reqwest::Url,
    pub engine_path: String,
    pub client_version: u32,
    pub engine_version: Option<String>,
    pub min_engine_version: VersionTriple,
    pub gpu_flags: Vec<String>,
    pub games_per_gpu: usize,
    pub work_dir: PathBuf,
    pub keep_sgf_dir: Option<PathBuf>,
    pub debug_dir: Option<PathBuf>,
    pub dump_debug: bool,
    pub single: bool,
    pub maxgames: Option<u64>,
}

impl Settings {
    fn job_context(&self, gpu_flag: String) -> JobContext {
        JobContext {
            engine_path: self.engine_path.clone(),
            gpu_flag,
            min_engine_version: self.min_engine_version,
            engine_version: self.engine_version.clone().unwrap_or_default(),
            dump_debug: self.dump_debug,
            work_dir: self.work_dir.clone(),
            keep_sgf_dir: self.keep_sgf_dir.clone(),
            debug_dir: self.debug_dir.clone(),
        }
    }

    fn worker_count(&self) -> usize {
        if self.gpu_flags.is_empty() {
            self.games_per_gpu.max(1)
        } else {
            self.gpu_flags.len() * self.games_per_gpu.max(1)
        }
    }
}

/// Top-level scheduler. Construct with [`Management::new`], then drive it
/// with [`Management::run`].
pub struct Management {
    settings: Settings,
    http: reqwest::Client,
    store: OrderStore,
    sprt: Option<Arc<SprtTracker>>,
    games_completed: AtomicU64,
}

impl Management {
    pub fn new(settings: Settings, sprt: Option<Arc<SprtTracker>>) -> anyhow::Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(60))
            .build()?;
        let store = OrderStore::new(settings.work_dir.join("queue"));
        Ok(Self {
            settings,
            http,
            store,
            sprt,
            games_completed: AtomicU64::new(0),
        })
    }

    /// Runs until every worker has stopped: either a fatal error was
    /// reported, the game budget (`--single`/`--maxgames`) was reached, or
    /// `shutdown_rx` delivered a signal.
    pub async fn run(
        &self,
        mut shutdown_rx: mpsc::UnboundedReceiver<ShutdownSignal>,
    ) -> anyhow::Result<()> {
        tokio::fs::create_dir_all(self.store.dir()).await?;
        tokio::fs::create_dir_all(self.settings.work_dir.join("networks")).await?;

        let drained = self.drain_upload_queue().await;
        if drained > 0 {
            println!("resumed {drained} queued upload(s) from a previous run");
        }

        let (events_tx, mut events_rx) = mpsc::unbounded_channel();
        let mut handles = self.spawn_workers(&events_tx);
        drop(events_tx);

        let mut fatal: Option<anyhow::Error> = None;
        let mut shutting_down = false;
        // Kept separate from `shutting_down`: a `Graceful` signal sets
        // `shutting_down` but must not stop polling this channel, since a
        // following `Immediate` (second Ctrl-C) still needs to be read.
        let mut shutdown_open = true;

        loop {
            if handles.is_empty() {
                break;
            }
            tokio::select! {
                event = events_rx.recv() => {
                    let Some(event) = event else { break };
                    match event {
                        WorkerEvent::Started { index } => {
                            println!("worker {index}: started");
                        }
                        WorkerEvent::Stopped { index } => {
                            println!("worker {index}: stopped");
                            handles.retain(|h| h.index() != index);
                        }
                        WorkerEvent::Result(result) => {
                            let index = result.index;
                            match self.handle_result(result).await {
                                Ok(should_stop) => {
                                    // Budget exhaustion lets each worker finish its
                                    // current game naturally and upload it; only an
                                    // external quit forces a mid-game checkpoint.
                                    if should_stop && !shutting_down {
                                        shutting_down = true;
                                        for h in &handles {
                                            h.request_finish();
                                        }
                                    }
                                }
                                Err(e) => {
                                    eprintln!("worker {index}: fatal error: {e:#}");
                                    fatal = Some(e);
                                    if !shutting_down {
                                        shutting_down = true;
                                        for h in &handles {
                                            h.request_store();
                                        }
                                    }
                                }
                            }
                        }
                    }
                }
                signal = shutdown_rx.recv(), if shutdown_open => {
                    match signal {
                        Some(ShutdownSignal::Immediate) => {
                            println!("shutting down immediately: not waiting on in-flight games");
                            return Ok(());
                        }
                        Some(ShutdownSignal::Graceful) => {
                            if !shutting_down {
                                println!("shutting down: storing in-flight games");
                                shutting_down = true;
                                for h in &handles {
                                    h.request_store();
                                }
                            }
                        }
                        None => {
                            shutdown_open = false;
                            if !shutting_down {
                                shutting_down = true;
                                for h in &handles {
                                    h.request_store();
                                }
                            }
                        }
                    }
                }
            }
        }

        if let Some(e) = fatal {
            return Err(e);
        }
        Ok(())
    }

    fn spawn_workers(
        &self,
        events_tx: &mpsc::UnboundedSender<WorkerEvent>,
    ) -> Vec<WorkerHandle> {
        let count = self.settings.worker_count();
        let mut handles = Vec::with_capacity(count);
        for index in 0..count {
            let gpu_flag = self
                .settings
                .gpu_flags
                .get(index % self.settings.gpu_flags.len().max(1))
                .cloned()
                .unwrap_or_default();
            let ctx = self.settings.job_context(gpu_flag);
            let store = self.store.clone();
            let http = self.http.clone();
            let backend_url = self.settings.backend_url.clone();
            let client_version = self.settings.client_version;
            let engine_version = self.settings.engine_version.clone();
            let networks_dir = self.settings.work_dir.join("networks");

            let fallback = Arc::new(std::sync::Mutex::new(None::<Order>));
            let (handle, _join) = worker::spawn(
                index,
                ctx,
                move || {
                    let store = store.clone();
                    let http = http.clone();
                    let backend_url = backend_url.clone();
                    let engine_version = engine_version.clone();
                    let networks_dir = networks_dir.clone();
                    let fallback = Arc::clone(&fallback);
                    async move {
                        next_order(
                            &store,
                            &http,
                            &backend_url,
                            client_version,
                            engine_version.as_deref(),
                            &networks_dir,
                            &fallback,
                        )
                        .await
                    }
                },
                events_tx.clone(),
            );
            handles.push(handle);
        }
        handles
    }

    /// Routes one finished/checkpointed/failed order. Returns `Ok(true)` if
    /// the game budget was just reached and the process should wind down.
    async fn handle_result(&self, result: worker::WorkerResult) -> anyhow::Result<bool> {
        let order = result.order;
        match result.outcome {
            Outcome::Error => {
                anyhow::bail!("engine reported a fatal condition on order {:?}", order.kind());
            }
            Outcome::Waited => Ok(false),
            Outcome::StoreSelfPlayed { sgf, moves } => {
                let mut restore = order.clone();
                restore.set_kind(OrderKind::RestoreSelfPlayed);
                restore.add("sgf", format!("{sgf}.sgf"));
                restore.add("moves", moves.to_string());
                self.store.store_order(&restore).await?;
                Ok(false)
            }
            Outcome::StoreMatch { sgf, moves } => {
                let mut restore = order.clone();
                restore.set_kind(OrderKind::RestoreMatch);
                restore.add("sgf", format!("{sgf}.sgf"));
                restore.add("moves", moves.to_string());
                self.store.store_order(&restore).await?;
                Ok(false)
            }
            Outcome::File { file, winner, moves } => {
                self.enqueue_selfplay_upload(&order, &file, winner, moves)
                    .await?;
                self.drain_upload_queue().await;
                Ok(self.bump_games_and_check_budget())
            }
            Outcome::Win { file, winner, moves, score } => {
                if let Some(sprt) = &self.sprt {
                    // `firstNet` always plays Black in a Validation order
                    // (SPEC_FULL.md Open Question ii: no post-game colour
                    // swap; the server balances colours across games by
                    // reissuing Orders with firstNet/secondNet swapped).
                    let result = if winner == crate::game::Color::Black {
                        GameResult::Win
                    } else {
                        GameResult::Loss
                    };
                    sprt.add_result(result);
                    let status = sprt.status();
                    let (w, l, d) = sprt.counts();
                    println!(
                        "sprt: w{w} l{l} d{d} llr={:.3} bounds=[{:.3}, {:.3}] verdict={:?}",
                        status.llr, status.lower_bound, status.upper_bound, status.verdict
                    );
                }
                self.enqueue_match_upload(&order, &file, winner, moves, &score)
                    .await?;
                self.drain_upload_queue().await;
                Ok(self.bump_games_and_check_budget())
            }
        }
    }

    fn bump_games_and_check_budget(&self) -> bool {
        let played = self.games_completed.fetch_add(1, Ordering::SeqCst) + 1;
        if self.settings.single && played >= 1 {
            return true;
        }
        if let Some(max) = self.settings.maxgames {
            if played >= max {
                return true;
            }
        }
        false
    }

    async fn enqueue_selfplay_upload(
        &self,
        order: &Order,
        file: &str,
        winner: crate::game::Color,
        moves: u32,
    ) -> anyhow::Result<()> {
        let tokens = vec![
            order.get("network").unwrap_or_default().to_string(),
            self.settings.client_version.to_string(),
            order.get("optHash").unwrap_or_default().to_string(),
            moves.to_string(),
            winner.as_gtp().to_string(),
            order.get("rndSeed").unwrap_or_default().to_string(),
        ];
        self.store
            .enqueue_upload(&QueuedUpload {
                basename: file.to_string(),
                tokens,
            })
            .await?;
        Ok(())
    }

    async fn enqueue_match_upload(
        &self,
        order: &Order,
        file: &str,
        winner: crate::game::Color,
        moves: u32,
        score: &str,
    ) -> anyhow::Result<()> {
        let (winner_hash, loser_hash) = if winner == crate::game::Color::Black {
            (
                order.get("firstNet").unwrap_or_default(),
                order.get("secondNet").unwrap_or_default(),
            )
        } else {
            (
                order.get("secondNet").unwrap_or_default(),
                order.get("firstNet").unwrap_or_default(),
            )
        };
        let tokens = vec![
            winner_hash.to_string(),
            loser_hash.to_string(),
            self.settings.client_version.to_string(),
            winner.as_gtp().to_string(),
            moves.to_string(),
            score.to_string(),
            order.get("optHash").unwrap_or_default().to_string(),
            order.get("rndSeed").unwrap_or_default().to_string(),
        ];
        self.store
            .enqueue_upload(&QueuedUpload {
                basename: file.to_string(),
                tokens,
            })
            .await?;
        Ok(())
    }

    /// Drains every queued upload, pacing successive submissions so a client
    /// reconnecting after an outage doesn't burst-upload a backlog.
    async fn drain_upload_queue(&self) -> usize {
        let http = self.http.clone();
        let backend_url = self.settings.backend_url.clone();
        let work_dir = self.settings.work_dir.clone();
        let mut first = true;
        self.store
            .drain_uploads(move |item| {
                let http = http.clone();
                let backend_url = backend_url.clone();
                let work_dir = work_dir.clone();
                let paced = !first;
                first = false;
                async move {
                    if paced {
                        tokio::time::sleep(UPLOAD_PACING).await;
                    }
                    upload_one(&http, &backend_url, &work_dir, &item).await
                }
            })
            .await
            .unwrap_or(0)
    }

    /// Deletes any cached network blob not referenced by a checkpointed
    /// order still sitting in the queue (`--erase`), so a `RestoreSelfPlayed`/
    /// `RestoreMatch` order can still find its network on resume.
    pub async fn erase_stale_networks(&self) -> anyhow::Result<()> {
        let referenced = self.store.referenced_network_hashes().await?;
        let networks_dir = self.settings.work_dir.join("networks");
        let mut entries = match tokio::fs::read_dir(&networks_dir).await {
            Ok(e) => e,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(()),
            Err(e) => return Err(e.into()),
        };
        let mut removed = 0u32;
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some("gz") {
                continue;
            }
            let hash = path.file_stem().and_then(|s| s.to_str()).unwrap_or_default();
            if referenced.contains(hash) {
                continue;
            }
            tokio::fs::remove_file(&path).await?;
            removed += 1;
        }
        if removed > 0 {
            println!("erased {removed} cached network file(s)");
        }
        Ok(())
    }
}

/// Attempts before giving up on one fetch cycle and letting the worker's own
/// idle backoff take over (SPEC_FULL.md §8's "fails three times" scenario).
const MAX_RETRIES: u32 = 3;
const BACKOFF_INITIAL: Duration = Duration::from_millis(30_000);
const BACKOFF_MULTIPLIER: f64 = 1.5;
const BACKOFF_MAX: Duration = Duration::from_secs(3600);

async fn next_order(
    store: &OrderStore,
    http: &reqwest::Client,
    backend_url: &reqwest::Url,
    client_version: u32,
    engine_version: Option<&str>,
    networks_dir: &std::path::Path,
    fallback: &std::sync::Mutex<Option<Order>>,
) -> Option<Order> {
    if let Ok(Some(order)) = store.take_next_order().await {
        return Some(order);
    }

    let mut backoff = BACKOFF_INITIAL;
    for attempt in 1..=MAX_RETRIES {
        match backend::fetch_order(http, backend_url, client_version, engine_version, networks_dir)
            .await
        {
            Ok(order) => {
                if matches!(order.kind(), OrderKind::Production | OrderKind::Validation) {
                    *fallback.lock().expect("fallback lock poisoned") = Some(order.clone());
                }
                return Some(order);
            }
            Err(e) => {
                eprintln!(
                    "warning: failed to fetch order from server (attempt {attempt}/{MAX_RETRIES}): {e:#}"
                );
                if attempt == MAX_RETRIES {
                    break;
                }
                tokio::time::sleep(backoff).await;
                backoff = backoff
                    .mul_f64(BACKOFF_MULTIPLIER)
                    .min(BACKOFF_MAX);
            }
        }
    }

    // `autogtp/Management.cpp`'s `getWork`: once every retry has failed,
    // fall back to replaying the last network/options pairing the server
    // handed out rather than idling, drawing a fresh random seed so the
    // replayed game doesn't just repeat the previous one move-for-move.
    let last = fallback.lock().expect("fallback lock poisoned").clone();
    if let Some(last) = last {
        println!("server unreachable after {MAX_RETRIES} attempts: replaying last order with a fresh seed");
        Some(regenerate_seed(&last))
    } else {
        None
    }
}

/// Rewrites `rndSeed` and the `-s <seed> ` flag embedded in `options`/
/// `optionsSecond` with a freshly drawn seed, mirroring the `QUuid`-derived
/// reseed `autogtp/Management.cpp`'s `getWork` performs on its fallback
/// order.
fn regenerate_seed(order: &Order) -> Order {
    let seed = rand::random::<u32>().to_string();
    let mut fresh = order.clone();
    fresh.add("rndSeed", seed.clone());
    for key in ["options", "optionsSecond"] {
        if let Some(options) = fresh.get(key).map(str::to_string) {
            fresh.add(key, patch_seed_flag(&options, &seed));
        }
    }
    fresh
}

fn patch_seed_flag(options: &str, seed: &str) -> String {
    let replacement = format!("-s {seed} ");
    let re = regex::Regex::new(r"-s \S+ ").expect("valid regex");
    if re.is_match(options) {
        re.replace(options, replacement.as_str()).into_owned()
    } else {
        format!("{options}{replacement}")
    }
}

async fn upload_one(
    http: &reqwest::Client,
    backend_url: &reqwest::Url,
    work_dir: &std::path::Path,
    item: &QueuedUpload,
) -> bool {
    match try_upload(http, backend_url, work_dir, item).await {
        Ok(()) => true,
        Err(e) => {
            eprintln!("warning: upload of {} failed, will retry: {e:#}", item.basename);
            false
        }
    }
}

async fn try_upload(
    http: &reqwest::Client,
    backend_url: &reqwest::Url,
    work_dir: &std::path::Path,
    item: &QueuedUpload,
) -> anyhow::Result<()> {
    let sgf_path = work_dir.join(format!("{}.sgf", item.basename));
    let sgf_gz = gzip_file(&sgf_path).await?;

    match item.tokens.len() {
        6 => {
            let [network, client_version, opt_hash, moves, winner, seed]: [String; 6] = item
                .tokens
                .clone()
                .try_into()
                .map_err(|_| anyhow::anyhow!("malformed selfplay upload tokens"))?;
            let training_path = work_dir.join(format!("{}.txt.0", item.basename));
            let training_gz = gzip_file(&training_path).await?;
            backend::submit_selfplay(
                http,
                backend_url,
                &network,
                client_version.parse()?,
                &opt_hash,
                moves.parse()?,
                &winner,
                &seed,
                sgf_gz,
                training_gz,
            )
            .await?;
        }
        8 => {
            let [winner_hash, loser_hash, client_version, winner_color, moves, score, opt_hash, seed]: [String; 8] =
                item.tokens
                    .clone()
                    .try_into()
                    .map_err(|_| anyhow::anyhow!("malformed match upload tokens"))?;
            backend::submit_match(
                http,
                backend_url,
                &winner_hash,
                &loser_hash,
                client_version.parse()?,
                &winner_color,
                moves.parse()?,
                &score,
                &opt_hash,
                &seed,
                sgf_gz,
            )
            .await?;
        }
        n => anyhow::bail!("unrecognised upload token count: {n}"),
    }

    let _ = tokio::fs::remove_file(&sgf_path).await;
    let _ = tokio::fs::remove_file(work_dir.join(format!("{}.txt.0", item.basename))).await;
    let _ = tokio::fs::remove_file(work_dir.join(format!("{}.debug.txt.0", item.basename))).await;
    Ok(())
}

async fn gzip_file(path: &std::path::Path) -> anyhow::Result<Vec<u8>> {
    use std::io::Write;
    let raw = tokio::fs::read(path).await?;
    let mut encoder = flate2::write::GzEncoder::new(Vec::new(), flate2::Compression::default());
    encoder.write_all(&raw)?;
    Ok(encoder.finish()?)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn patch_seed_flag_replaces_existing_seed() {
        let patched = patch_seed_flag("-g -p 1600 -s 42 -v 3200 ", "99");
        assert_eq!(patched, "-g -p 1600 -s 99 -v 3200 ");
    }

    #[test]
    fn patch_seed_flag_appends_when_absent() {
        let patched = patch_seed_flag("-g -p 1600 ", "99");
        assert_eq!(patched, "-g -p 1600 -s 99 ");
    }

    #[test]
    fn regenerate_seed_rewrites_rnd_seed_and_both_option_strings() {
        let mut order = Order::new(OrderKind::Validation, std::collections::BTreeMap::new());
        order.add("rndSeed", "0");
        order.add("options", "-g -s 0 ");
        order.add("optionsSecond", "-g -s 0 ");

        let fresh = regenerate_seed(&order);

        assert_ne!(fresh.get("rndSeed").unwrap(), "0");
        assert!(fresh.get("options").unwrap().contains("-s "));
        assert!(!fresh.get("options").unwrap().contains("-s 0 "));
        assert_eq!(
            fresh.get("rndSeed").unwrap(),
            fresh
                .get("options")
                .unwrap()
                .split("-s ")
                .nth(1)
                .unwrap()
                .split(' ')
                .next()
                .unwrap()
        );
    }
}
