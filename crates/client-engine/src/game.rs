//! C2: Game Driver — plays one game to termination over one or two GTP
//! sessions and produces SGF + training artifacts.
//!
//! Grounded on `autogtp/Game.cpp` in full: `checkGameEnd`, `gameStart`
//! (handicap sniffing, starting commands), the `genmove`/score move loop,
//! and `writeSgf`/`loadTraining`/`saveTraining`/`dumpTraining`/`dumpDebug`.

use uuid::Uuid;

use crate::gtp::{GtpError, GtpSession, VersionTriple};
use crate::sgf;

/// A side to move.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Color {
    Black,
    White,
}

impl Color {
    pub fn as_gtp(self) -> char {
        match self {
            Color::Black => 'b',
            Color::White => 'w',
        }
    }

    pub fn opposite(self) -> Color {
        match self {
            Color::Black => Color::White,
            Color::White => Color::Black,
        }
    }
}

/// A single game's running state, mirroring `autogtp/Game.h`'s member
/// variables.
#[derive(Debug, Clone)]
pub struct GameState {
    pub file_name: String,
    pub is_handicap: bool,
    pub resignation: bool,
    pub black_to_move: bool,
    pub black_resigned: bool,
    pub passes: u32,
    pub move_num: u32,
    pub last_move: String,
    pub winner: Option<Color>,
    pub result: String,
}

impl GameState {
    fn fresh() -> Self {
        Self {
            file_name: Uuid::new_v4().simple().to_string(),
            is_handicap: false,
            resignation: false,
            black_to_move: true,
            black_resigned: false,
            passes: 0,
            move_num: 0,
            last_move: String::new(),
            winner: None,
            result: String::new(),
        }
    }

    /// `resignation ∨ passes > 1 ∨ moveNum > 722`.
    pub fn check_game_end(&self) -> bool {
        self.resignation || self.passes > 1 || self.move_num > 19 * 19 * 2
    }
}

/// Resume-from-SGF handicap parity: handicap stones are not counted as
/// moves, so black's turns are odd-numbered.
pub fn black_to_move_after_resume(moves: u32, is_handicap: bool) -> bool {
    (moves % 2) == u32::from(is_handicap)
}

/// Errors raised while driving a game, beyond the underlying [`GtpError`].
#[derive(Debug, thiserror::Error)]
pub enum DriverError {
    #[error("engine failed to start")]
    NoEngine,
    #[error(transparent)]
    Gtp(#[from] GtpError),
    #[error("io error writing game artifact: {0}")]
    Io(#[from] std::io::Error),
}

/// Owns one GTP session and plays it through a single-engine (self-play) or
/// one-side-of-a-match game.
pub struct GameDriver {
    session: GtpSession,
    state: GameState,
    dir: std::path::PathBuf,
}

impl GameDriver {
    /// Spawns `binary options network`, checks its version, and applies the
    /// starting commands / seed-SGF resume sequence from SPEC_FULL.md §4.2
    /// step 1.
    pub async fn start(
        dir: impl Into<std::path::PathBuf>,
        binary: &str,
        options: &str,
        network: &str,
        starting_commands: &[String],
        min_version: VersionTriple,
        seed: Option<(&str, u32)>,
    ) -> Result<Self, DriverError> {
        let mut session = GtpSession::spawn(binary, options, network).await?;
        session.check_version(min_version).await?;

        let mut state = GameState::fresh();

        if let Some((seed_sgf_path, moves)) = seed {
            let text = tokio::fs::read_to_string(seed_sgf_path).await?;
            state.is_handicap = sgf::is_handicap(&text);
            state.black_to_move = black_to_move_after_resume(moves, state.is_handicap);
            state.move_num = moves;
            session
                .command(&format!("loadsgf {seed_sgf_path} {}", moves + 1))
                .await?;
        } else {
            for cmd in starting_commands {
                if cmd.to_lowercase().contains("handicap") {
                    session.command(cmd).await?;
                    state.is_handicap = true;
                    state.black_to_move = false;
                }
            }
            for cmd in starting_commands {
                if !cmd.to_lowercase().contains("handicap") {
                    session.command(cmd).await?;
                }
            }
        }

        Ok(Self {
            session,
            state,
            dir: dir.into(),
        })
    }

    pub fn state(&self) -> &GameState {
        &self.state
    }

    pub fn file_name(&self) -> &str {
        &self.state.file_name
    }

    /// Generates a move for `state.black_to_move`'s colour and updates the
    /// move/pass/resignation counters.
    pub async fn generate_move(&mut self) -> Result<String, DriverError> {
        let color = if self.state.black_to_move {
            Color::Black
        } else {
            Color::White
        };
        let mv = self.session.genmove(color.as_gtp()).await?;
        self.apply_move(color, &mv);
        Ok(mv)
    }

    /// Tells this session about a move generated by another driver (the
    /// validation-mode move relay).
    pub async fn relay_move(&mut self, color: Color, mv: &str) -> Result<(), DriverError> {
        self.session
            .command(&format!("play {} {mv}", color.as_gtp()))
            .await?;
        self.apply_move(color, mv);
        Ok(())
    }

    fn apply_move(&mut self, color: Color, mv: &str) {
        let lower = mv.to_lowercase();
        if lower == "pass" {
            self.state.passes += 1;
        } else if lower == "resign" {
            self.state.resignation = true;
            self.state.black_resigned = color == Color::Black;
        } else {
            self.state.passes = 0;
        }
        self.state.last_move = mv.to_string();
        self.state.move_num += 1;
        self.state.black_to_move = !self.state.black_to_move;
    }

    pub fn check_game_end(&self) -> bool {
        self.state.check_game_end()
    }

    /// Scores the game: synthesised `W+Resign`/`B+Resign` if someone
    /// resigned, else the engine's `final_score` answer.
    pub async fn score(&mut self) -> Result<String, DriverError> {
        let result = if self.state.resignation {
            if self.state.black_resigned {
                "W+Resign".to_string()
            } else {
                "B+Resign".to_string()
            }
        } else {
            self.session.command("final_score").await?
        };
        self.state.winner = match result.chars().next() {
            Some('B') => Some(Color::Black),
            Some('W') => Some(Color::White),
            _ => None,
        };
        self.state.result = result.clone();
        Ok(result)
    }

    /// Emits `<uuid>.sgf` (and, when requested, training/debug dumps), then
    /// `quit`s the engine. Returns the raw SGF file path written.
    pub async fn emit_artifacts(
        &mut self,
        dump_training: bool,
        dump_debug: bool,
    ) -> Result<std::path::PathBuf, DriverError> {
        let sgf_path = self.dir.join(format!("{}.sgf", self.state.file_name));
        self.session
            .command(&format!("printsgf {}", sgf_path.display()))
            .await?;
        if dump_training {
            let winner = self.state.winner.map(Color::as_gtp).unwrap_or('b');
            self.session
                .command(&format!(
                    "dump_training {winner} {}.txt",
                    self.dir.join(&self.state.file_name).display()
                ))
                .await?;
            if dump_debug {
                self.session
                    .command(&format!(
                        "dump_debug {}.debug.txt",
                        self.dir.join(&self.state.file_name).display()
                    ))
                    .await?;
            }
        }
        self.session.quit().await?;
        Ok(sgf_path)
    }

    /// Saves a training-snapshot checkpoint (used when a Production job is
    /// asked to store mid-game).
    pub async fn save_training(&mut self) -> Result<(), DriverError> {
        self.session
            .command(&format!(
                "save_training {}.train",
                self.dir.join(&self.state.file_name).display()
            ))
            .await?;
        Ok(())
    }

    /// Loads a previously saved training snapshot when resuming from a
    /// checkpoint.
    pub async fn load_training(&mut self, basename: &str) -> Result<(), DriverError> {
        self.session
            .command(&format!(
                "load_training {}",
                self.dir.join(format!("{basename}.train")).display()
            ))
            .await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn handicap_parity_matches_source_formula() {
        assert!(!black_to_move_after_resume(50, false));
        assert!(black_to_move_after_resume(51, false));
        assert!(black_to_move_after_resume(50, true));
        assert!(!black_to_move_after_resume(51, true));
    }

    #[test]
    fn game_end_conditions() {
        let mut state = GameState::fresh();
        assert!(!state.check_game_end());
        state.passes = 2;
        assert!(state.check_game_end());
        state.passes = 0;
        state.move_num = 723;
        assert!(state.check_game_end());
        state.move_num = 0;
        state.resignation = true;
        assert!(state.check_game_end());
    }
}
