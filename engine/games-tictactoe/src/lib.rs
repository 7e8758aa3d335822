//! TicTacToe implementation of the [`game_core::Position`] contract.
//!
//! This crate exists as the reference game for the search engine's tests and
//! benches: it is small enough to reason about exhaustively while still
//! exercising every part of the contract (zobrist hashing, plane encoding,
//! policy lookup, terminal detection, and a check analogue).
//!
//! "Check" is mapped to TicTacToe's closest concept: a move that creates an
//! immediate winning threat (a line with two own marks and an empty square).

use game_core::{Color, Position, StateInfo};
use once_cell::sync::Lazy;
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha20Rng;

/// The eight winning lines, as cell index triples.
const LINES: [[usize; 3]; 8] = [
    [0, 1, 2],
    [3, 4, 5],
    [6, 7, 8],
    [0, 3, 6],
    [1, 4, 7],
    [2, 5, 8],
    [0, 4, 8],
    [2, 4, 6],
];

/// Zobrist keys for hashing: one key per (side, cell) plus a side-to-move key.
struct Zobrist {
    piece: [[u64; 9]; 2],
    black_to_move: u64,
}

static ZOBRIST: Lazy<Zobrist> = Lazy::new(|| {
    let mut rng = ChaCha20Rng::seed_from_u64(0x7ac7_0e5);
    let mut piece = [[0u64; 9]; 2];
    for side in &mut piece {
        for key in side.iter_mut() {
            *key = rng.gen();
        }
    }
    Zobrist {
        piece,
        black_to_move: rng.gen(),
    }
});

/// A TicTacToe position. X is [`Color::White`] and moves first.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TicTacToe {
    /// 0 = empty, 1 = X, 2 = O
    board: [u8; 9],
    side: Color,
    ply: u16,
}

impl TicTacToe {
    pub fn new() -> Self {
        Self {
            board: [0; 9],
            side: Color::White,
            ply: 0,
        }
    }

    fn mark_of(side: Color) -> u8 {
        match side {
            Color::White => 1,
            Color::Black => 2,
        }
    }

    /// The side holding a completed line, if any.
    pub fn winner(&self) -> Option<Color> {
        for line in &LINES {
            let m = self.board[line[0]];
            if m != 0 && m == self.board[line[1]] && m == self.board[line[2]] {
                return Some(if m == 1 { Color::White } else { Color::Black });
            }
        }
        None
    }

    fn board_full(&self) -> bool {
        self.board.iter().all(|&c| c != 0)
    }

    /// Whether `side` has a line with two own marks and one empty square.
    fn has_winning_threat(board: &[u8; 9], side: Color) -> bool {
        let mark = Self::mark_of(side);
        LINES.iter().any(|line| {
            let own = line.iter().filter(|&&c| board[c] == mark).count();
            let empty = line.iter().filter(|&&c| board[c] == 0).count();
            own == 2 && empty == 1
        })
    }
}

impl Default for TicTacToe {
    fn default() -> Self {
        Self::new()
    }
}

impl Position for TicTacToe {
    type Move = u8;

    const CHANNELS: usize = 3;
    const HEIGHT: usize = 3;
    const WIDTH: usize = 3;
    const POLICY_LEN: usize = 9;

    fn hash_key(&self) -> u64 {
        let z = &*ZOBRIST;
        let mut key = 0u64;
        for (cell, &m) in self.board.iter().enumerate() {
            if m != 0 {
                key ^= z.piece[(m - 1) as usize][cell];
            }
        }
        if self.side == Color::Black {
            key ^= z.black_to_move;
        }
        key
    }

    fn side_to_move(&self) -> Color {
        self.side
    }

    fn legal_moves(&self) -> Vec<u8> {
        if self.winner().is_some() {
            return Vec::new();
        }
        (0..9u8).filter(|&c| self.board[c as usize] == 0).collect()
    }

    fn gives_check(&self, mv: u8) -> bool {
        let mark = Self::mark_of(self.side);
        let mut board = self.board;
        board[mv as usize] = mark;
        // A move that completes a line wins outright; only unresolved threats
        // count as the check analogue.
        let wins = LINES
            .iter()
            .any(|line| line.iter().all(|&c| board[c] == mark));
        !wins && Self::has_winning_threat(&board, self.side)
    }

    fn do_move(&mut self, mv: u8, st: &mut StateInfo) {
        debug_assert_eq!(self.board[mv as usize], 0, "move targets an empty cell");
        self.board[mv as usize] = Self::mark_of(self.side);
        self.side = self.side.flip();
        self.ply += 1;
        st.plies_from_null = self.ply;
        st.repetition = 0;
    }

    fn number_repetitions(&self) -> u8 {
        // Stones only ever get added; positions cannot repeat.
        0
    }

    fn plies_from_null(&self) -> u16 {
        self.ply
    }

    fn is_terminal(&self) -> bool {
        self.winner().is_some() || self.board_full()
    }

    fn terminal_value(&self) -> f32 {
        // The winning mark is always placed by the previous mover, so a
        // decided position is a loss for the side to move.
        if self.winner().is_some() {
            -1.0
        } else {
            0.0
        }
    }

    fn encode_planes(&self, out: &mut [f32]) {
        debug_assert_eq!(out.len(), Self::plane_size());
        out.fill(0.0);
        let own = Self::mark_of(self.side);
        for (cell, &m) in self.board.iter().enumerate() {
            if m == own {
                out[cell] = 1.0;
            } else if m != 0 {
                out[9 + cell] = 1.0;
            }
        }
        let stm = if self.side == Color::White { 1.0 } else { 0.0 };
        out[18..27].fill(stm);
    }

    fn policy_index(mv: u8, _side: Color) -> usize {
        // The board is symmetric under color swap, so both sides share one
        // policy layout indexed by cell.
        mv as usize
    }
}
