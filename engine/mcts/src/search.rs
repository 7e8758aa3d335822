//! Worker-side search loop.
//!
//! Each worker thread repeatedly assembles a mini-batch of leaves (selection
//! with virtual loss), evaluates the new ones in a single network call,
//! assigns the results, and backs values up to the root. Terminal hits are
//! backed up immediately; collisions only revert their virtual loss;
//! verified transpositions reuse an existing evaluation instead of
//! consuming a network slot.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use game_core::{Color, Position, StateInfo};
use thiserror::Error;
use tracing::trace;

use crate::buffers::FixedBuffer;
use crate::config::{SearchLimits, SearchSettings};
use crate::evaluator::{Evaluator, EvaluatorError};
use crate::node::{Node, NodeStep};
use crate::transposition::{is_transposition_verified, TranspositionTable};

/// Upper bound on terminal hits folded into one mini-batch; keeps a worker
/// from spinning on a solved subtree without ever reaching the evaluator.
pub const TERMINAL_NODE_CACHE: usize = 8;

/// Errors that can abort a search.
#[derive(Debug, Error)]
pub enum SearchError {
    #[error("evaluator error: {0}")]
    Evaluator(#[from] EvaluatorError),

    #[error("root position has no legal moves")]
    NoLegalMoves,

    #[error("search started without a root")]
    MissingRoot,

    #[error("worker thread panicked")]
    WorkerPanic,
}

/// Classification of one root-to-leaf descent.
#[derive(Debug, Default, Clone, Copy)]
struct DescentInfo {
    depth: usize,
    is_collision: bool,
    is_terminal: bool,
}

/// Where a descent ended: the parent holding the reserved slot plus the
/// slot's classification.
struct Leaf<P: Position> {
    parent: Arc<Node<P>>,
    child_idx: usize,
    kind: LeafKind<P>,
}

enum LeafKind<P: Position> {
    /// Empty slot: create a node (or alias a transposition) there.
    Expansion,
    /// Existing terminal child: back up its value without evaluation.
    Terminal(Arc<Node<P>>),
    /// Existing child awaiting another worker's evaluation.
    Collision(Arc<Node<P>>),
}

/// Walk from `node` to the root, reverting the virtual loss and crediting
/// the sign-flipped value at every ancestor.
pub fn backup_value_to_root<P: Position>(node: &Arc<Node<P>>, vloss: f32, terminal: bool) {
    let mut value = node.value();
    let mut current = Arc::clone(node);
    while let Some((parent, child_idx)) = current.parent_link() {
        value = -value;
        parent.backup_value(child_idx, vloss, value, terminal);
        current = parent;
    }
}

/// One search thread's state: its own batch buffers and network I/O arrays,
/// sharing only the tree, the transposition table, and the stop flag.
pub struct SearchWorker<'a, P: Position, E: Evaluator> {
    settings: &'a SearchSettings,
    limits: SearchLimits,
    root_node: Arc<Node<P>>,
    root_pos: P,
    table: &'a TranspositionTable<P>,
    evaluator: E,
    running: &'a AtomicBool,

    new_nodes: FixedBuffer<Arc<Node<P>>>,
    new_node_side_to_move: FixedBuffer<Color>,
    transposition_nodes: FixedBuffer<Arc<Node<P>>>,
    collision_nodes: FixedBuffer<Arc<Node<P>>>,

    input_planes: Vec<f32>,
    value_outputs: Vec<f32>,
    policy_outputs: Vec<f32>,

    /// State-info list of the descent in progress.
    states: Vec<StateInfo>,
    tb_hits: u64,
}

impl<'a, P: Position, E: Evaluator> SearchWorker<'a, P, E> {
    pub fn new(
        settings: &'a SearchSettings,
        limits: SearchLimits,
        root_node: Arc<Node<P>>,
        root_pos: P,
        table: &'a TranspositionTable<P>,
        evaluator: E,
        running: &'a AtomicBool,
    ) -> Self {
        let batch = settings.batch_size;
        let stride = evaluator.policy_output_length();
        Self {
            settings,
            limits,
            root_node,
            root_pos,
            table,
            running,
            new_nodes: FixedBuffer::with_capacity(batch),
            new_node_side_to_move: FixedBuffer::with_capacity(batch),
            transposition_nodes: FixedBuffer::with_capacity(batch * 2),
            collision_nodes: FixedBuffer::with_capacity(batch),
            input_planes: vec![0.0; batch * P::plane_size()],
            value_outputs: vec![0.0; batch],
            policy_outputs: vec![0.0; batch * stride],
            evaluator,
            states: Vec::new(),
            tb_hits: 0,
        }
    }

    /// Drive iterations until stopped, out of node budget, or the root is
    /// decided. An evaluator failure clears the shared flag so sibling
    /// workers drain, and surfaces the error.
    pub fn run(mut self) -> Result<u64, SearchError> {
        while self.running.load(Ordering::Acquire)
            && self.nodes_limit_ok()
            && !self.root_node.is_terminal()
        {
            if let Err(err) = self.iteration() {
                self.running.store(false, Ordering::Release);
                return Err(err);
            }
        }
        Ok(self.tb_hits)
    }

    /// One full cycle: assemble a mini-batch, evaluate the new leaves,
    /// assign results, back everything up, reset the buffers.
    pub fn iteration(&mut self) -> Result<(), SearchError> {
        self.create_mini_batch();
        let batch = self.new_nodes.len();
        trace!(
            new = batch,
            transpositions = self.transposition_nodes.len(),
            collisions = self.collision_nodes.len(),
            "mini-batch assembled"
        );
        if batch > 0 {
            let plane = P::plane_size();
            let stride = self.evaluator.policy_output_length();
            self.evaluator.predict(
                &self.input_planes[..batch * plane],
                &mut self.value_outputs[..batch],
                &mut self.policy_outputs[..batch * stride],
            )?;
            self.set_nn_results_to_child_nodes();
        }
        self.backup_value_outputs();
        self.backup_collisions();
        Ok(())
    }

    /// Tablebase hits recorded by this worker so far.
    pub fn tb_hits(&self) -> u64 {
        self.tb_hits
    }

    fn nodes_limit_ok(&self) -> bool {
        self.limits.nodes == 0
            || ((self.root_node.visits() - self.root_node.terminal_visits()) as u64)
                < self.limits.nodes
    }

    /// Repeat descents until a buffer fills or the terminal cap is hit.
    fn create_mini_batch(&mut self) {
        let mut terminal_hits = 0;
        while !self.new_nodes.is_full()
            && !self.collision_nodes.is_full()
            && !self.transposition_nodes.is_full()
            && terminal_hits < TERMINAL_NODE_CACHE
        {
            let mut pos = self.root_pos.clone();
            let (leaf, info) = self.select_leaf(&mut pos);
            trace!(
                depth = info.depth,
                collision = info.is_collision,
                terminal = info.is_terminal,
                "descent"
            );

            match leaf.kind {
                LeafKind::Terminal(child) => {
                    terminal_hits += 1;
                    backup_value_to_root(&child, self.settings.virtual_loss, true);
                }
                LeafKind::Collision(child) => {
                    self.collision_nodes.push(child);
                }
                LeafKind::Expansion => {
                    self.add_new_node_to_tree(pos, &leaf.parent, leaf.child_idx);
                }
            }
        }
    }

    /// One descent: repeatedly select-and-reserve under the current node's
    /// lock, advancing the local position between locks, until the descent
    /// ends at an empty slot, a terminal child, or a collision.
    fn select_leaf(&mut self, pos: &mut P) -> (Leaf<P>, DescentInfo) {
        let mut current = Arc::clone(&self.root_node);
        let mut info = DescentInfo::default();
        self.states.clear();

        loop {
            info.depth += 1;
            let step = current.select_and_reserve(self.settings);
            match step {
                NodeStep::Expand { child_idx, mv } => {
                    self.advance(pos, mv);
                    let leaf = Leaf {
                        parent: current,
                        child_idx,
                        kind: LeafKind::Expansion,
                    };
                    return (leaf, info);
                }
                NodeStep::Terminal { child_idx, mv, child } => {
                    info.is_terminal = true;
                    self.advance(pos, mv);
                    let leaf = Leaf {
                        parent: current,
                        child_idx,
                        kind: LeafKind::Terminal(child),
                    };
                    return (leaf, info);
                }
                NodeStep::Collision { child_idx, mv, child } => {
                    info.is_collision = true;
                    self.advance(pos, mv);
                    let leaf = Leaf {
                        parent: current,
                        child_idx,
                        kind: LeafKind::Collision(child),
                    };
                    return (leaf, info);
                }
                NodeStep::Descend { mv, child, .. } => {
                    self.advance(pos, mv);
                    current = child;
                }
            }
        }
    }

    fn advance(&mut self, pos: &mut P, mv: P::Move) {
        let mut st = StateInfo::default();
        pos.do_move(mv, &mut st);
        self.states.push(st);
    }

    /// Install the reserved slot: a snapshot of a verified transposition, or
    /// a fresh node whose planes go into the network input at the next free
    /// batch slot.
    fn add_new_node_to_tree(&mut self, pos: P, parent: &Arc<Node<P>>, child_idx: usize) {
        let key = pos.hash_key();
        let st = self.states.last().copied().unwrap_or_default();

        let verified = if self.settings.use_transpositions {
            self.table
                .lookup(key)
                .filter(|hit| is_transposition_verified(hit, &st))
        } else {
            None
        };

        if let Some(source) = verified {
            let child = Arc::new(Node::transposition_child(pos, parent, child_idx, &source));
            parent.add_transposition_child(child_idx, Arc::clone(&child));
            parent.increment_no_visit_idx();
            self.transposition_nodes.push(child);
        } else {
            parent.increment_no_visit_idx();
            let side = pos.side_to_move();
            let plane = P::plane_size();
            let offset = self.new_nodes.len() * plane;
            pos.encode_planes(&mut self.input_planes[offset..offset + plane]);

            let child = Arc::new(Node::new_child(pos, parent, child_idx));
            parent.add_new_child(child_idx, Arc::clone(&child));
            self.new_nodes.push(child);
            self.new_node_side_to_move.push(side);
        }
    }

    /// Assign network outputs to the batch's nodes and register them in the
    /// transposition table. Registration happens only after
    /// `enable_has_nn_results`, so any hit another worker sees is usable.
    fn set_nn_results_to_child_nodes(&mut self) {
        let stride = self.evaluator.policy_output_length();
        let policy_map = self.evaluator.is_policy_map();
        for (k, node) in self.new_nodes.iter().enumerate() {
            if !node.is_terminal() {
                let policy = &self.policy_outputs[k * stride..(k + 1) * stride];
                node.set_probabilities_for_moves(policy, *self.new_node_side_to_move.get(k));
                node.post_process_policy(policy_map, self.settings);
                if node.assign_value(self.value_outputs[k]) {
                    self.tb_hits += 1;
                }
                node.enable_has_nn_results();
            }
            self.table.insert(node.hash_key(), Arc::clone(node));
        }
    }

    /// Back up the values of all evaluated and transposed leaves.
    fn backup_value_outputs(&mut self) {
        for node in self.new_nodes.iter() {
            backup_value_to_root(node, self.settings.virtual_loss, node.is_terminal());
        }
        self.new_nodes.clear();
        self.new_node_side_to_move.clear();

        for node in self.transposition_nodes.iter() {
            backup_value_to_root(node, self.settings.virtual_loss, false);
        }
        self.transposition_nodes.clear();
    }

    /// Revert the virtual loss of collided descents at the immediate parent
    /// only; the corresponding value backups of other descents settle the
    /// levels above.
    fn backup_collisions(&mut self) {
        for node in self.collision_nodes.iter() {
            if let Some((parent, child_idx)) = node.parent_link() {
                parent.backup_collision(child_idx, self.settings.virtual_loss);
            }
        }
        self.collision_nodes.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_util::{prepare_root, two_empties_position, LadderGame, StubEvaluator};
    use games_tictactoe::TicTacToe;

    fn run_worker<P: Position, E: Evaluator>(
        settings: &SearchSettings,
        limits: SearchLimits,
        root: Arc<Node<P>>,
        pos: P,
        table: &TranspositionTable<P>,
        evaluator: E,
    ) -> Result<u64, SearchError> {
        let running = AtomicBool::new(true);
        let worker = SearchWorker::new(settings, limits, root, pos, table, evaluator, &running);
        worker.run()
    }

    #[test]
    fn single_descent_backs_up_sign_flipped_value() {
        // One-ply search with batch size 1: the root's best slot is expanded,
        // evaluated at 0.5 and stored with the sign flipped.
        let settings = SearchSettings::for_testing().with_batch_size(1);
        let evaluator = StubEvaluator::new(0.5, TicTacToe::POLICY_LEN);
        let pos = two_empties_position();
        assert_eq!(pos.legal_moves().len(), 2);

        let root = prepare_root(pos, &evaluator, &settings);
        let table = TranspositionTable::new();
        run_worker(
            &settings,
            SearchLimits::nodes(1),
            Arc::clone(&root),
            pos,
            &table,
            evaluator.clone(),
        )
        .unwrap();

        assert!((root.visits() - 1.0).abs() < 1e-6);
        let snap = root.snapshot();
        assert!((snap.visits[0] - 1.0).abs() < 1e-6);
        assert!((snap.action_values[0] - (-0.5)).abs() < 1e-5);
        assert!((snap.q_values[0] - (-0.5)).abs() < 1e-5);
        // Exactly one evaluator call for the single new leaf.
        assert_eq!(evaluator.predict_calls(), 2); // root preparation + search
    }

    #[test]
    fn collisions_revert_virtual_loss_without_visits() {
        // Batch of 3 over a two-move position: two expansions, then only
        // collisions remain. After the iteration every virtual loss must be
        // reverted and both children carry exactly one real visit.
        let settings = SearchSettings::for_testing().with_batch_size(3);
        let evaluator = StubEvaluator::new(0.5, TicTacToe::POLICY_LEN);
        let pos = two_empties_position();

        let root = prepare_root(pos, &evaluator, &settings);
        let table = TranspositionTable::new();
        let running = AtomicBool::new(true);
        let mut worker = SearchWorker::new(
            &settings,
            SearchLimits::default(),
            Arc::clone(&root),
            pos,
            &table,
            evaluator.clone(),
            &running,
        );
        worker.iteration().unwrap();

        let snap = root.snapshot();
        assert!((root.visits() - 2.0).abs() < 1e-6);
        for i in 0..2 {
            assert!((snap.visits[i] - 1.0).abs() < 1e-6, "child {i} visits");
            assert!((snap.q_values[i] - (-0.5)).abs() < 1e-5, "child {i} q");
        }
    }

    #[test]
    fn terminal_children_are_backed_up_without_evaluation() {
        // Root with a single move that ends the game: the first iteration
        // expands the terminal child (one predict call for the batch), every
        // later descent hits it terminally with no further network work.
        let settings = SearchSettings::for_testing().with_batch_size(1);
        let evaluator = StubEvaluator::new(0.0, LadderGame::POLICY_LEN);
        let pos = LadderGame::losing_in_one();

        let root = prepare_root(pos.clone(), &evaluator, &settings);
        let table = TranspositionTable::new();
        let running = AtomicBool::new(true);
        let mut worker = SearchWorker::new(
            &settings,
            SearchLimits::default(),
            Arc::clone(&root),
            pos,
            &table,
            evaluator.clone(),
            &running,
        );

        worker.iteration().unwrap();
        let after_expand = evaluator.predict_calls();
        // The losing child's value (-1 for the side that just lost there)
        // arrives at the root as +1.
        let snap = root.snapshot();
        assert!((snap.q_values[0] - 1.0).abs() < 1e-6);
        assert!((root.terminal_visits() - 1.0).abs() < 1e-6);

        worker.iteration().unwrap();
        // Only terminal hits: no additional evaluator call, capped per batch.
        assert_eq!(evaluator.predict_calls(), after_expand);
        assert!((root.terminal_visits() - (1 + TERMINAL_NODE_CACHE) as f32).abs() < 1e-6);
        let snap = root.snapshot();
        assert!((snap.q_values[0] - 1.0).abs() < 1e-6);
    }

    #[test]
    fn verified_transpositions_reuse_evaluations() {
        // LadderGame hashes by depth only, so every sibling subtree reaches
        // the "same" state: later expansions of an already evaluated depth
        // must alias it instead of consuming batch slots.
        let settings = SearchSettings::for_testing().with_batch_size(2);
        let evaluator = StubEvaluator::new(0.25, LadderGame::POLICY_LEN);
        let pos = LadderGame::with_depth(4);

        let root = prepare_root(pos.clone(), &evaluator, &settings);
        let table = TranspositionTable::new();
        run_worker(
            &settings,
            SearchLimits::nodes(24),
            Arc::clone(&root),
            pos,
            &table,
            evaluator.clone(),
        )
        .unwrap();

        let mut transpositions = 0;
        let mut stack = vec![Arc::clone(&root)];
        while let Some(node) = stack.pop() {
            if node.is_transposition() {
                transpositions += 1;
                assert!(node.has_nn_results());
            }
            for child in node.children().into_iter().flatten() {
                stack.push(child);
            }
        }
        assert!(transpositions > 0, "no transposition node was installed");
    }

    #[test]
    fn transpositions_can_be_disabled() {
        let mut settings = SearchSettings::for_testing().with_batch_size(2);
        settings.use_transpositions = false;
        let evaluator = StubEvaluator::new(0.25, LadderGame::POLICY_LEN);
        let pos = LadderGame::with_depth(4);

        let root = prepare_root(pos.clone(), &evaluator, &settings);
        let table = TranspositionTable::new();
        run_worker(
            &settings,
            SearchLimits::nodes(24),
            Arc::clone(&root),
            pos,
            &table,
            evaluator.clone(),
        )
        .unwrap();

        let mut stack = vec![Arc::clone(&root)];
        while let Some(node) = stack.pop() {
            assert!(!node.is_transposition());
            for child in node.children().into_iter().flatten() {
                stack.push(child);
            }
        }
    }

    #[test]
    fn evaluator_failure_stops_the_search() {
        let settings = SearchSettings::for_testing().with_batch_size(1);
        let evaluator = StubEvaluator::new(0.0, TicTacToe::POLICY_LEN);
        let pos = TicTacToe::new();
        let root = prepare_root(pos, &evaluator, &settings);
        let table = TranspositionTable::new();

        let failing = StubEvaluator::failing(TicTacToe::POLICY_LEN);
        let running = AtomicBool::new(true);
        let worker = SearchWorker::new(
            &settings,
            SearchLimits::default(),
            root,
            pos,
            &table,
            failing,
            &running,
        );
        let err = worker.run().unwrap_err();
        assert!(matches!(err, SearchError::Evaluator(_)));
        assert!(!running.load(Ordering::Acquire));
    }

    #[test]
    fn node_budget_counts_only_non_terminal_visits() {
        let settings = SearchSettings::for_testing().with_batch_size(2);
        let evaluator = StubEvaluator::new(0.0, TicTacToe::POLICY_LEN);
        let pos = TicTacToe::new();
        let root = prepare_root(pos, &evaluator, &settings);
        let table = TranspositionTable::new();

        run_worker(
            &settings,
            SearchLimits::nodes(10),
            Arc::clone(&root),
            pos,
            &table,
            evaluator,
        )
        .unwrap();

        let searched = root.visits() - root.terminal_visits();
        assert!(searched >= 10.0, "budget not reached: {searched}");
        // At most one batch of overshoot (new leaves plus transpositions).
        assert!(searched < 10.0 + 3.0 * settings.batch_size as f32);
    }
}
