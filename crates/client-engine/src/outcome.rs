//! The outcome a [`crate::job::Job`] hands back to a [`crate::worker::Worker`].
//!
//! Named `Outcome` rather than `Result` to avoid colliding with
//! [`std::result::Result`] everywhere it is used. Grounded on
//! `autogtp/Result.h`, which is a bare `(type, QMap<QString,QString>)` pair;
//! this is its typed Rust equivalent.

use crate::game::Color;

/// What a finished (or checkpointed, or failed) Job produced.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    /// A self-play game finished normally.
    File {
        /// Basename (no extension) of the written `.sgf`/`.txt.0` artifacts.
        file: String,
        /// The winning colour.
        winner: Color,
        /// Number of moves played.
        moves: u32,
    },
    /// A match game finished normally with a win for `first_net` or
    /// `second_net` (which one is determined by comparing `winner` against
    /// the colour each network played — see [`crate::management`]).
    Win {
        /// Basename of the written `.sgf` artifact.
        file: String,
        /// The winning colour on the board.
        winner: Color,
        /// Number of moves played.
        moves: u32,
        /// Raw score string as reported by the engine (`"B+12.5"`, …).
        score: String,
    },
    /// A Wait order completed (slept its duration).
    Waited,
    /// A Production job was asked to checkpoint mid-game.
    StoreSelfPlayed {
        /// Basename of the in-progress SGF.
        sgf: String,
        /// Moves played so far.
        moves: u32,
    },
    /// A Validation job was asked to checkpoint mid-game.
    StoreMatch {
        /// Basename of the in-progress SGF.
        sgf: String,
        /// Moves played so far.
        moves: u32,
    },
    /// The job could not complete: an engine-level fatal condition. This is
    /// also how an interrupted order that has nothing to checkpoint (a dead
    /// engine before any move was played) is reported.
    Error,
}

impl Outcome {
    /// `true` for the two `Store*` variants.
    pub fn is_checkpoint(&self) -> bool {
        matches!(self, Outcome::StoreSelfPlayed { .. } | Outcome::StoreMatch { .. })
    }

    /// Moves played, for variants that track it.
    pub fn moves(&self) -> Option<u32> {
        match self {
            Outcome::File { moves, .. }
            | Outcome::Win { moves, .. }
            | Outcome::StoreSelfPlayed { moves, .. }
            | Outcome::StoreMatch { moves, .. } => Some(*moves),
            Outcome::Waited | Outcome::Error => None,
        }
    }

    /// SGF basename, for variants that wrote one.
    pub fn sgf_basename(&self) -> Option<&str> {
        match self {
            Outcome::File { file, .. } | Outcome::Win { file, .. } => Some(file),
            Outcome::StoreSelfPlayed { sgf, .. } | Outcome::StoreMatch { sgf, .. } => Some(sgf),
            Outcome::Waited | Outcome::Error => None,
        }
    }
}
