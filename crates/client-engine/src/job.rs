//! C3: Job — executes one [`Order`] (production / validation / wait) using
//! one or two [`GameDriver`]s and returns an [`Outcome`].
//!
//! Grounded on `autogtp/Job.cpp`: `ProductionJob::execute`,
//! `ValidationJob::execute` (including the move-relay role swap and the
//! colour-alternation bookkeeping), and `WaitJob::execute`.

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use crate::game::{Color, GameDriver};
use crate::gtp::{self, VersionTriple};
use crate::order::{Order, OrderKind};
use crate::outcome::Outcome;

/// Immutable context shared by every Job a Worker runs: everything needed to
/// spawn an engine subprocess and place its artifacts, independent of which
/// Order is currently being executed.
#[derive(Debug, Clone)]
pub struct JobContext {
    /// Path to the engine binary (e.g. `./leelaz`).
    pub engine_path: String,
    /// `" --gpu=<id> "` or empty, appended to every engine's options.
    pub gpu_flag: String,
    /// Minimum accepted engine version, used when an Order carries no
    /// `leelazVer` of its own.
    pub min_engine_version: VersionTriple,
    /// Engine version string stamped into a game's SGF `PW[]`/comment tags
    /// when the Order itself carries no `leelazVer`.
    pub engine_version: String,
    /// Whether to additionally dump debug artifacts alongside training data.
    pub dump_debug: bool,
    /// Directory self-play/.sgf/.txt files are written to before archival.
    pub work_dir: PathBuf,
    /// Archive directory for `.sgf` files (`--keep-sgf`), if set.
    pub keep_sgf_dir: Option<PathBuf>,
    /// Archive directory for training/debug files (`--debug`), if set.
    pub debug_dir: Option<PathBuf>,
}

/// One of the three kinds of work a Worker can be asked to run.
pub enum Job {
    Production(ProductionJob),
    Validation(ValidationJob),
    Wait(WaitJob),
}

impl Job {
    /// Constructs the right Job variant for an order's kind, matching
    /// `Worker::createJob`'s type switch (`Production`/`RestoreSelfPlayed` →
    /// production, `Validation`/`RestoreMatch` → validation, `Wait` → wait).
    pub fn for_kind(kind: OrderKind) -> Self {
        match kind {
            OrderKind::Production | OrderKind::RestoreSelfPlayed => {
                Job::Production(ProductionJob::default())
            }
            OrderKind::Validation | OrderKind::RestoreMatch => {
                Job::Validation(ValidationJob::default())
            }
            OrderKind::Wait | OrderKind::Error => Job::Wait(WaitJob::default()),
        }
    }

    /// Whether the currently-constructed variant still matches the order
    /// kind about to be executed (a Worker rebuilds the Job when it
    /// doesn't).
    pub fn matches(&self, kind: OrderKind) -> bool {
        matches!(
            (self, kind),
            (Job::Production(_), OrderKind::Production | OrderKind::RestoreSelfPlayed)
                | (Job::Validation(_), OrderKind::Validation | OrderKind::RestoreMatch)
                | (Job::Wait(_), OrderKind::Wait | OrderKind::Error)
        )
    }

    pub async fn execute(
        &mut self,
        order: &Order,
        ctx: &JobContext,
        store_requested: &AtomicBool,
    ) -> Outcome {
        match self {
            Job::Production(job) => job.execute(order, ctx, store_requested).await,
            Job::Validation(job) => job.execute(order, ctx, store_requested).await,
            Job::Wait(job) => job.execute(order, store_requested).await,
        }
    }
}

/// The minimum engine version to enforce for this order: the per-Order
/// `leelazVer` the server handed out (`autogtp/Job.cpp::init`'s
/// `m_leelazMinVersion`), falling back to the context-wide default if the
/// order carries none or it fails to parse.
fn min_version(order: &Order, ctx: &JobContext) -> VersionTriple {
    order
        .get("leelazVer")
        .and_then(gtp::parse_version)
        .unwrap_or(ctx.min_engine_version)
}

fn gtp_commands(order: &Order, key: &str) -> Vec<String> {
    order
        .get(key)
        .map(|s| s.split(',').map(str::trim).filter(|s| !s.is_empty()).map(String::from).collect())
        .unwrap_or_default()
}

/// Self-play: one network plays itself.
#[derive(Default)]
pub struct ProductionJob;

impl ProductionJob {
    pub async fn execute(
        &mut self,
        order: &Order,
        ctx: &JobContext,
        store_requested: &AtomicBool,
    ) -> Outcome {
        let network = order.get("network").unwrap_or_default();
        let options = format!(
            "{}{} -g -q -w",
            order.get("options").unwrap_or_default(),
            ctx.gpu_flag
        );
        let commands = gtp_commands(order, "gtpCommands");
        let network_path = ctx.work_dir.join("networks").join(format!("{network}.gz"));

        let seed = match (order.get("sgf"), order.get("moves")) {
            (Some(sgf), Some(moves)) => {
                let moves: u32 = moves.parse().unwrap_or(0);
                Some((sgf, moves))
            }
            _ => None,
        };
        let resumed = seed.is_some();

        let mut driver = match GameDriver::start(
            &ctx.work_dir,
            &ctx.engine_path,
            &options,
            &network_path.to_string_lossy(),
            &commands,
            min_version(order, ctx),
            seed,
        )
        .await
        {
            Ok(driver) => driver,
            Err(_) => return Outcome::Error,
        };

        if resumed {
            let basename = order.get("sgf").unwrap_or_default();
            let basename = basename.trim_end_matches(".sgf");
            if driver.load_training(basename).await.is_err() {
                return Outcome::Error;
            }
            let stale_train = ctx.work_dir.join(format!("{basename}.train"));
            let _ = tokio::fs::remove_file(stale_train).await;
        }

        loop {
            if store_requested.load(Ordering::Acquire) {
                if driver.save_training().await.is_err() {
                    return Outcome::Error;
                }
                return Outcome::StoreSelfPlayed {
                    sgf: driver.file_name().to_string(),
                    moves: driver.state().move_num,
                };
            }
            if driver.check_game_end() {
                break;
            }
            if driver.generate_move().await.is_err() {
                return Outcome::Error;
            }
        }

        let score = match driver.score().await {
            Ok(s) => s,
            Err(_) => return Outcome::Error,
        };
        let winner = driver.state().winner.unwrap_or(Color::Black);
        let moves = driver.state().move_num;
        let black_resigned = driver.state().black_resigned;

        let sgf_path = match driver.emit_artifacts(true, ctx.dump_debug).await {
            Ok(p) => p,
            Err(_) => return Outcome::Error,
        };
        let engine_version = order.get("leelazVer").unwrap_or(&ctx.engine_version);
        if let Err(e) = patch_self_play_sgf(
            &sgf_path,
            engine_version,
            network,
            &options,
            &commands,
            &score,
            black_resigned,
        )
        .await
        {
            eprintln!("warning: failed to patch sgf {}: {e}", sgf_path.display());
        }
        archive(&sgf_path, ctx, driver.file_name(), ctx.dump_debug).await;

        Outcome::File {
            file: driver.file_name().to_string(),
            winner,
            moves,
        }
    }
}

/// Head-to-head match between two networks.
#[derive(Default)]
pub struct ValidationJob;

impl ValidationJob {
    pub async fn execute(
        &mut self,
        order: &Order,
        ctx: &JobContext,
        store_requested: &AtomicBool,
    ) -> Outcome {
        let first_net = order.get("firstNet").unwrap_or_default();
        let second_net = order.get("secondNet").unwrap_or_default();
        let first_options = format!(
            "{}{} -g -q -w",
            order.get("options").unwrap_or_default(),
            ctx.gpu_flag
        );
        let second_options = format!(
            "{}{} -g -q -w",
            order.get("optionsSecond").unwrap_or_default(),
            ctx.gpu_flag
        );
        let first_commands = gtp_commands(order, "gtpCommands");
        let second_commands = gtp_commands(order, "gtpCommandsSecond");

        let first_path = ctx.work_dir.join("networks").join(format!("{first_net}.gz"));
        let second_path = ctx
            .work_dir
            .join("networks")
            .join(format!("{second_net}.gz"));

        let seed = match (order.get("sgf"), order.get("moves")) {
            (Some(sgf), Some(moves)) => {
                let moves: u32 = moves.parse().unwrap_or(0);
                Some((sgf, moves))
            }
            _ => None,
        };

        let order_min_version = min_version(order, ctx);
        let mut first = match GameDriver::start(
            &ctx.work_dir,
            &ctx.engine_path,
            &first_options,
            &first_path.to_string_lossy(),
            &first_commands,
            order_min_version,
            seed,
        )
        .await
        {
            Ok(d) => d,
            Err(_) => return Outcome::Error,
        };
        let mut second = match GameDriver::start(
            &ctx.work_dir,
            &ctx.engine_path,
            &second_options,
            &second_path.to_string_lossy(),
            &second_commands,
            order_min_version,
            seed,
        )
        .await
        {
            Ok(d) => d,
            Err(_) => return Outcome::Error,
        };

        // The move-relay loop swaps "generator"/"listener" roles each ply;
        // the initial assignment is chosen so the first swap lands the true
        // side-to-move on the generator, which is why handicap games start
        // with the second (white) driver generating.
        let mut first_generates = !first.state().is_handicap;

        loop {
            if store_requested.load(Ordering::Acquire) {
                return Outcome::StoreMatch {
                    sgf: first.file_name().to_string(),
                    moves: first.state().move_num,
                };
            }
            let (generator, listener): (&mut GameDriver, &mut GameDriver) = if first_generates {
                (&mut first, &mut second)
            } else {
                (&mut second, &mut first)
            };
            if generator.check_game_end() {
                break;
            }
            let color = if generator.state().black_to_move {
                Color::Black
            } else {
                Color::White
            };
            let mv = match generator.generate_move().await {
                Ok(mv) => mv,
                Err(_) => return Outcome::Error,
            };
            if listener.relay_move(color, &mv).await.is_err() {
                return Outcome::Error;
            }
            first_generates = !first_generates;
        }

        let score = match first.score().await {
            Ok(s) => s,
            Err(_) => return Outcome::Error,
        };
        let winner = first.state().winner.unwrap_or(Color::Black);
        let moves = first.state().move_num;
        let black_resigned = score.starts_with("B+Resign") || first.state().black_resigned;

        let sgf_path = match first.emit_artifacts(false, false).await {
            Ok(p) => p,
            Err(_) => return Outcome::Error,
        };
        let _ = second.emit_artifacts(false, false).await;

        let engine_version = order.get("leelazVer").unwrap_or(&ctx.engine_version);
        if let Err(e) = patch_match_sgf(
            &sgf_path,
            engine_version,
            second_net,
            first_net,
            second_net,
            &first_options,
            &second_options,
            &first_commands,
            &second_commands,
            black_resigned,
        )
        .await
        {
            eprintln!("warning: failed to patch sgf {}: {e}", sgf_path.display());
        }
        archive(&sgf_path, ctx, first.file_name(), false).await;

        Outcome::Win {
            file: first.file_name().to_string(),
            winner,
            moves,
            score,
        }
    }
}

/// Idle wait, no game played.
#[derive(Default)]
pub struct WaitJob;

impl WaitJob {
    pub async fn execute(&mut self, order: &Order, store_requested: &AtomicBool) -> Outcome {
        let minutes: u64 = order.get("minutes").and_then(|s| s.parse().ok()).unwrap_or(0);
        let mut remaining = Duration::from_secs(minutes * 60);
        const TICK: Duration = Duration::from_secs(1);
        while !remaining.is_zero() {
            if store_requested.load(Ordering::Acquire) {
                break;
            }
            let step = remaining.min(TICK);
            tokio::time::sleep(step).await;
            remaining -= step;
        }
        Outcome::Waited
    }
}

#[allow(clippy::too_many_arguments)]
async fn patch_self_play_sgf(
    path: &std::path::Path,
    engine_version: &str,
    network_hash: &str,
    options: &str,
    commands: &[String],
    score: &str,
    black_resigned: bool,
) -> std::io::Result<()> {
    let text = tokio::fs::read_to_string(path).await?;
    let text = crate::sgf::fix_player(&text, engine_version, network_hash);
    let info = format!("{network_hash} {options} {}", commands.join(","));
    let text = crate::sgf::fix_comment(&text, &info, &info, false);
    let text = crate::sgf::fix_result(&text, black_resigned && score.ends_with("Resign"));
    tokio::fs::write(path, text).await
}

#[allow(clippy::too_many_arguments)]
async fn patch_match_sgf(
    path: &std::path::Path,
    engine_version: &str,
    white_hash: &str,
    first_net: &str,
    second_net: &str,
    first_options: &str,
    second_options: &str,
    first_commands: &[String],
    second_commands: &[String],
    black_resigned: bool,
) -> std::io::Result<()> {
    let text = tokio::fs::read_to_string(path).await?;
    let text = crate::sgf::fix_player(&text, engine_version, white_hash);
    let text = crate::sgf::fix_comment(
        &text,
        &format!("{first_net} {first_options} {}", first_commands.join(",")),
        &format!("{second_net} {second_options} {}", second_commands.join(",")),
        true,
    );
    let text = crate::sgf::fix_result(&text, black_resigned);
    tokio::fs::write(path, text).await
}

async fn archive(sgf_path: &std::path::Path, ctx: &JobContext, basename: &str, dump_debug: bool) {
    if let Some(dir) = &ctx.keep_sgf_dir {
        let _ = tokio::fs::create_dir_all(dir).await;
        let dest = dir.join(sgf_path.file_name().unwrap_or_default());
        let _ = tokio::fs::copy(sgf_path, dest).await;
    }
    if let Some(dir) = &ctx.debug_dir {
        let _ = tokio::fs::create_dir_all(dir).await;
        let train = ctx.work_dir.join(format!("{basename}.txt.0"));
        if train.exists() {
            let _ = tokio::fs::copy(&train, dir.join(format!("{basename}.txt.0"))).await;
        }
        if dump_debug {
            let debug = ctx.work_dir.join(format!("{basename}.debug.txt.0"));
            if debug.exists() {
                let _ = tokio::fs::copy(&debug, dir.join(format!("{basename}.debug.txt.0"))).await;
            }
        }
    }
}
