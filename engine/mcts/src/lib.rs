//! Parallel batched Monte Carlo Tree Search guided by a policy/value network.
//!
//! This crate is game-agnostic: it searches any game implementing the
//! `game-core` Position trait, using any [`Evaluator`] as the network
//! backend.
//!
//! # Overview
//!
//! N worker threads share one tree and one transposition table. Each worker
//! repeats:
//!
//! 1. **Selection**: descend from the root with PUCT, applying a virtual
//!    loss to every chosen edge so concurrent workers diverge
//! 2. **Batching**: collect new leaves until a mini-batch is full (terminal
//!    hits back up immediately; collisions and verified transpositions fill
//!    their own buffers)
//! 3. **Evaluation**: one synchronous network call for the whole batch
//! 4. **Backup**: credit sign-flipped values from every leaf to the root and
//!    revert the virtual losses of collided descents
//!
//! # Usage
//!
//! ```rust,ignore
//! use games_tictactoe::TicTacToe;
//! use game_core::Position;
//! use mcts::{SearchLimits, SearchSession, SearchSettings, UniformEvaluator};
//!
//! let settings = SearchSettings::default().with_threads(4);
//! let evaluator = UniformEvaluator::new(TicTacToe::POLICY_LEN);
//!
//! let mut session = SearchSession::new(settings, evaluator);
//! session.set_position(TicTacToe::new());
//! session.set_search_limits(SearchLimits::nodes(800));
//!
//! let info = session.start()?;
//! println!("best move: {:?} (q = {})", info.best_move(), info.best_move_q);
//! ```
//!
//! # Architecture
//!
//! ```text
//! SearchSession ──spawns──> SearchWorker (per thread)
//!      │                        │  select / expand / collide
//!      │                        v
//!      │                 shared Node tree  <──aliases── TranspositionTable
//!      │                        │
//!      └── EvalInfo <──backup───┘        Evaluator::predict (per batch)
//! ```

pub mod buffers;
pub mod config;
pub mod evaluator;
pub mod node;
pub mod search;
pub mod session;
pub mod transposition;

#[cfg(feature = "onnx")]
pub mod onnx;

#[cfg(test)]
pub(crate) mod test_util;

// Re-export main types
pub use buffers::FixedBuffer;
pub use config::{SearchLimits, SearchSettings};
pub use evaluator::{Evaluator, EvaluatorError, UniformEvaluator};
pub use node::{Node, NodeSnapshot, NodeStep};
pub use search::{backup_value_to_root, SearchError, SearchWorker, TERMINAL_NODE_CACHE};
pub use session::{EvalInfo, SearchSession, SearchStopper};
pub use transposition::{is_transposition_verified, TranspositionTable};

#[cfg(feature = "onnx")]
pub use onnx::{OnnxEvaluator, PlaneDims, SharedOnnxEvaluator};
