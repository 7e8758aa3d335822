//! Shared helpers for the crate's tests: a deterministic stub evaluator, a
//! tiny ladder game whose states transpose by construction, and root
//! preparation shortcuts.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use game_core::{Color, Position, StateInfo};
use games_tictactoe::TicTacToe;

use crate::config::SearchSettings;
use crate::evaluator::{Evaluator, EvaluatorError};
use crate::node::Node;
use crate::session::evaluate_single;

/// Evaluator returning a fixed value and flat logits, counting predict
/// calls across clones. Can be switched into a failing mode.
#[derive(Clone)]
pub struct StubEvaluator {
    value: f32,
    policy_len: usize,
    fail: bool,
    calls: Arc<AtomicU32>,
}

impl StubEvaluator {
    pub fn new(value: f32, policy_len: usize) -> Self {
        Self {
            value,
            policy_len,
            fail: false,
            calls: Arc::new(AtomicU32::new(0)),
        }
    }

    pub fn failing(policy_len: usize) -> Self {
        Self {
            value: 0.0,
            policy_len,
            fail: true,
            calls: Arc::new(AtomicU32::new(0)),
        }
    }

    pub fn predict_calls(&self) -> u32 {
        self.calls.load(Ordering::Acquire)
    }
}

impl Evaluator for StubEvaluator {
    fn predict(
        &self,
        _input_planes: &[f32],
        value_out: &mut [f32],
        policy_out: &mut [f32],
    ) -> Result<(), EvaluatorError> {
        self.calls.fetch_add(1, Ordering::AcqRel);
        if self.fail {
            return Err(EvaluatorError::InferenceFailed("stub failure".into()));
        }
        value_out.fill(self.value);
        policy_out.fill(0.0);
        Ok(())
    }

    fn policy_output_length(&self) -> usize {
        self.policy_len
    }
}

/// Minimal game whose hash depends only on the distance from the start:
/// every sibling subtree reaches "the same" state at equal depth, forcing
/// verified transpositions deterministically.
#[derive(Debug, Clone, PartialEq)]
pub struct LadderGame {
    step: u8,
    branch: u8,
    max_step: u8,
    moves: u8,
    losing: bool,
    tb: Option<f32>,
}

impl LadderGame {
    /// Draw-terminated ladder with two moves per state.
    pub fn with_depth(max_step: u8) -> Self {
        Self {
            step: 0,
            branch: 0,
            max_step,
            moves: 2,
            losing: false,
            tb: None,
        }
    }

    /// Single forced move into a lost terminal position.
    pub fn losing_in_one() -> Self {
        Self {
            step: 0,
            branch: 0,
            max_step: 1,
            moves: 1,
            losing: true,
            tb: None,
        }
    }

    /// Ladder whose non-terminal states all probe to a fixed tablebase
    /// value.
    pub fn tablebase(value: f32) -> Self {
        Self {
            tb: Some(value),
            ..Self::with_depth(4)
        }
    }
}

impl Position for LadderGame {
    type Move = u8;

    const CHANNELS: usize = 1;
    const HEIGHT: usize = 1;
    const WIDTH: usize = 2;
    const POLICY_LEN: usize = 2;

    fn hash_key(&self) -> u64 {
        (self.step as u64 + 1).wrapping_mul(0x9E37_79B9_7F4A_7C15)
    }

    fn side_to_move(&self) -> Color {
        if self.step % 2 == 0 {
            Color::White
        } else {
            Color::Black
        }
    }

    fn legal_moves(&self) -> Vec<u8> {
        if self.step >= self.max_step {
            Vec::new()
        } else {
            (0..self.moves).collect()
        }
    }

    fn gives_check(&self, _mv: u8) -> bool {
        false
    }

    fn do_move(&mut self, mv: u8, st: &mut StateInfo) {
        self.step += 1;
        self.branch = mv;
        st.plies_from_null = self.step as u16;
        st.repetition = 0;
    }

    fn number_repetitions(&self) -> u8 {
        0
    }

    fn plies_from_null(&self) -> u16 {
        self.step as u16
    }

    fn is_terminal(&self) -> bool {
        self.step >= self.max_step
    }

    fn terminal_value(&self) -> f32 {
        if self.losing {
            -1.0
        } else {
            0.0
        }
    }

    fn tablebase_value(&self) -> Option<f32> {
        if self.is_terminal() {
            None
        } else {
            self.tb
        }
    }

    fn encode_planes(&self, out: &mut [f32]) {
        out[0] = self.step as f32;
        out[1] = self.branch as f32;
    }

    fn policy_index(mv: u8, _side: Color) -> usize {
        mv as usize
    }
}

/// TicTacToe position with exactly two empty cells (7 and 8), no completed
/// line, and no immediate win available: X holds 0, 1, 5, 6 and O holds
/// 2, 3, 4 with O to move. Both replies lead to non-terminal positions.
pub fn two_empties_position() -> TicTacToe {
    let mut pos = TicTacToe::new();
    let mut st = StateInfo::default();
    for mv in [0u8, 2, 1, 3, 5, 4, 6] {
        pos.do_move(mv, &mut st);
    }
    debug_assert!(!pos.is_terminal());
    pos
}

/// Build a root node for `pos` and run it through the normal single-position
/// evaluation path.
pub fn prepare_root<P: Position, E: Evaluator>(
    pos: P,
    evaluator: &E,
    settings: &SearchSettings,
) -> Arc<Node<P>> {
    let node = Arc::new(Node::new_root(pos.clone()));
    evaluate_single(&node, &pos, evaluator, settings).expect("stub evaluation succeeds");
    node
}
