//! Shared contract between board game implementations and the search engine.
//!
//! The search crate is game-agnostic: it drives any type implementing the
//! [`Position`] trait. A position knows its legal moves, how to apply one,
//! how to serialize itself into neural-network input planes, and how to map
//! a move onto the network's policy head. Everything else (tree statistics,
//! batching, transpositions) lives on the search side of this seam.

use std::fmt::Debug;

/// Side to move in a two-player zero-sum game.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Color {
    White,
    Black,
}

impl Color {
    /// The opposing side.
    #[inline]
    pub fn flip(self) -> Color {
        match self {
            Color::White => Color::Black,
            Color::Black => Color::White,
        }
    }
}

/// Per-move bookkeeping filled in by [`Position::do_move`].
///
/// One `StateInfo` is produced per ply of a search descent; the descent owns
/// the list and drops it wholesale when the descent ends.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StateInfo {
    /// Plies since the last irreversible move (or game start).
    pub plies_from_null: u16,
    /// Repetition count of the position reached by the move (0 = first
    /// occurrence).
    pub repetition: u8,
}

/// Outcome of a finished game from the first player's perspective.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GameResult {
    Loss,
    Draw,
    Win,
}

impl GameResult {
    /// Integer encoding used by training data (-1, 0, +1).
    #[inline]
    pub fn as_i16(self) -> i16 {
        match self {
            GameResult::Loss => -1,
            GameResult::Draw => 0,
            GameResult::Win => 1,
        }
    }
}

/// A two-player zero-sum board game position.
///
/// Implementations are cheap to clone: the search clones the root position
/// once per descent and advances the clone move by move.
pub trait Position: Clone + Send + Sync + 'static {
    /// Move representation. Kept `Copy` so move lists can be reordered and
    /// passed around freely.
    type Move: Copy + PartialEq + Debug + Send + Sync + 'static;

    /// Number of input planes fed to the neural network.
    const CHANNELS: usize;
    /// Board height in squares.
    const HEIGHT: usize;
    /// Board width in squares.
    const WIDTH: usize;
    /// Length of the network's policy output per position.
    const POLICY_LEN: usize;

    /// Flat length of one encoded position (`CHANNELS * HEIGHT * WIDTH`).
    fn plane_size() -> usize {
        Self::CHANNELS * Self::HEIGHT * Self::WIDTH
    }

    /// Zobrist-style hash key identifying this position.
    fn hash_key(&self) -> u64;

    /// Side to move.
    fn side_to_move(&self) -> Color;

    /// All legal moves in generation order. Empty iff the game is over.
    fn legal_moves(&self) -> Vec<Self::Move>;

    /// Whether `mv` gives check (or the game's closest analogue, e.g. an
    /// immediate winning threat). Used only for policy enhancement.
    fn gives_check(&self, mv: Self::Move) -> bool;

    /// Apply `mv` in place, filling `st` with the resulting bookkeeping.
    fn do_move(&mut self, mv: Self::Move, st: &mut StateInfo);

    /// How often the current position occurred before in the game.
    fn number_repetitions(&self) -> u8;

    /// Plies since the last irreversible move.
    fn plies_from_null(&self) -> u16;

    /// Whether the game is over in this position.
    fn is_terminal(&self) -> bool;

    /// Game-theoretic value of a terminal position from the side to move's
    /// perspective (-1 loss, 0 draw, +1 win). Only meaningful when
    /// [`is_terminal`](Position::is_terminal) returns true.
    fn terminal_value(&self) -> f32;

    /// Endgame oracle probe; `Some(v)` pre-sets the node value from the side
    /// to move's perspective. Games without tablebases use the default.
    fn tablebase_value(&self) -> Option<f32> {
        None
    }

    /// Serialize the position into `out`, which holds exactly
    /// [`plane_size`](Position::plane_size) floats in CHW order.
    fn encode_planes(&self, out: &mut [f32]);

    /// Index of `mv` in the policy output for the given side to move.
    /// Implementations with mirrored policy heads dispatch on `side`.
    fn policy_index(mv: Self::Move, side: Color) -> usize;
}
