//! Search session: the surface consumed by engine front ends.
//!
//! A session owns the root node and position, the transposition table, and
//! the evaluator. `start` prepares the root (network evaluation plus
//! optional Dirichlet noise), fans out the worker threads, joins them, and
//! condenses the root statistics into an [`EvalInfo`] from which the caller
//! picks a move.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;

use game_core::Position;
use rand::SeedableRng;
use rand_chacha::ChaCha20Rng;
use rand_distr::{Distribution, Gamma};
use tracing::{debug, info};

use crate::config::{SearchLimits, SearchSettings};
use crate::evaluator::Evaluator;
use crate::node::Node;
use crate::search::{SearchError, SearchWorker};
use crate::transposition::TranspositionTable;

/// Root statistics of a finished (or stopped) search.
#[derive(Debug, Clone)]
pub struct EvalInfo<M> {
    /// Root moves in the tree's (prior-sorted) order.
    pub legal_moves: Vec<M>,
    /// Visit distribution over `legal_moves`, sharpened by the settings'
    /// root policy temperature (greedy one-hot at 0); sums to 1.
    pub policy_prob_small: Vec<f32>,
    /// Index of the most visited root move.
    pub best_move_idx: usize,
    /// Q value of the most visited root move, from the root's perspective.
    pub best_move_q: f32,
    /// Root value estimate.
    pub value: f32,
    /// Completed descents through the root.
    pub total_visits: f32,
    /// Tablebase hits across all workers.
    pub tb_hits: u64,
}

impl<M: Copy> EvalInfo<M> {
    /// The most visited root move.
    pub fn best_move(&self) -> M {
        self.legal_moves[self.best_move_idx]
    }
}

/// Cloneable handle that stops a running search cooperatively. The in-flight
/// iteration of every worker completes before its thread exits.
#[derive(Clone)]
pub struct SearchStopper {
    running: Arc<AtomicBool>,
}

impl SearchStopper {
    pub fn stop(&self) {
        self.running.store(false, Ordering::Release);
    }
}

/// One search over one root, run by `settings.threads` worker threads.
pub struct SearchSession<P: Position, E: Evaluator + Clone> {
    settings: SearchSettings,
    limits: SearchLimits,
    evaluator: E,
    table: Arc<TranspositionTable<P>>,
    root_node: Option<Arc<Node<P>>>,
    root_pos: Option<P>,
    running: Arc<AtomicBool>,
    rng: ChaCha20Rng,
}

impl<P: Position, E: Evaluator + Clone> SearchSession<P, E> {
    pub fn new(settings: SearchSettings, evaluator: E) -> Self {
        Self::with_rng(settings, evaluator, ChaCha20Rng::from_entropy())
    }

    /// Deterministic variant for tests and reproducible self-play.
    pub fn with_seed(settings: SearchSettings, evaluator: E, seed: u64) -> Self {
        Self::with_rng(settings, evaluator, ChaCha20Rng::seed_from_u64(seed))
    }

    fn with_rng(settings: SearchSettings, evaluator: E, rng: ChaCha20Rng) -> Self {
        Self {
            settings,
            limits: SearchLimits::default(),
            evaluator,
            table: Arc::new(TranspositionTable::new()),
            root_node: None,
            root_pos: None,
            running: Arc::new(AtomicBool::new(false)),
            rng,
        }
    }

    pub fn set_root_node(&mut self, node: Arc<Node<P>>) {
        self.root_node = Some(node);
    }

    pub fn set_root_pos(&mut self, pos: P) {
        self.root_pos = Some(pos);
    }

    /// Convenience: install `pos` as both root position and a fresh root
    /// node.
    pub fn set_position(&mut self, pos: P) {
        self.root_node = Some(Arc::new(Node::new_root(pos.clone())));
        self.root_pos = Some(pos);
    }

    pub fn set_search_limits(&mut self, limits: SearchLimits) {
        self.limits = limits;
    }

    pub fn root_node(&self) -> Option<&Arc<Node<P>>> {
        self.root_node.as_ref()
    }

    /// Handle for stopping this session from another thread.
    pub fn stopper(&self) -> SearchStopper {
        SearchStopper {
            running: Arc::clone(&self.running),
        }
    }

    /// Request cooperative stop.
    pub fn stop(&self) {
        self.running.store(false, Ordering::Release);
    }

    /// Drop all transposition entries (e.g. after swapping the model).
    pub fn clear_transpositions(&self) {
        self.table.clear();
    }

    /// Run the search to completion (budget, stop request, or error) and
    /// return the root statistics.
    pub fn start(&mut self) -> Result<EvalInfo<P::Move>, SearchError> {
        let root_pos = self.root_pos.clone().ok_or(SearchError::MissingRoot)?;
        let root_node = self
            .root_node
            .as_ref()
            .map(Arc::clone)
            .ok_or(SearchError::MissingRoot)?;
        if root_node.is_terminal() {
            return Err(SearchError::NoLegalMoves);
        }

        let mut tb_hits: u64 = 0;
        if !root_node.has_nn_results() {
            tb_hits +=
                evaluate_single(&root_node, &root_pos, &self.evaluator, &self.settings)? as u64;
        }
        self.table.insert(root_node.hash_key(), Arc::clone(&root_node));

        if self.settings.dirichlet_epsilon > 0.0 && self.settings.dirichlet_alpha > 0.0 {
            let noise = dirichlet_noise(
                root_node.n_children(),
                self.settings.dirichlet_alpha,
                &mut self.rng,
            );
            root_node.mix_noise(self.settings.dirichlet_epsilon, &noise);
        }

        self.running.store(true, Ordering::Release);
        info!(
            threads = self.settings.threads,
            batch_size = self.settings.batch_size,
            nodes = self.limits.nodes,
            "search started"
        );

        let settings = &self.settings;
        let limits = self.limits;
        let table: &TranspositionTable<P> = &self.table;
        let running: &AtomicBool = &self.running;
        let evaluator = &self.evaluator;

        let results: Vec<Result<u64, SearchError>> = thread::scope(|scope| {
            let handles: Vec<_> = (0..settings.threads.max(1))
                .map(|_| {
                    let root = Arc::clone(&root_node);
                    let pos = root_pos.clone();
                    let eval = evaluator.clone();
                    scope.spawn(move || {
                        SearchWorker::new(settings, limits, root, pos, table, eval, running).run()
                    })
                })
                .collect();
            handles
                .into_iter()
                .map(|handle| handle.join().unwrap_or(Err(SearchError::WorkerPanic)))
                .collect()
        });
        self.running.store(false, Ordering::Release);

        let mut first_err = None;
        for result in results {
            match result {
                Ok(worker_tb_hits) => tb_hits += worker_tb_hits,
                Err(err) => {
                    if first_err.is_none() {
                        first_err = Some(err);
                    }
                }
            }
        }
        if let Some(err) = first_err {
            return Err(err);
        }

        let info = eval_info(&root_node, tb_hits, self.settings.temperature);
        debug!(
            visits = info.total_visits,
            best_idx = info.best_move_idx,
            q = info.best_move_q,
            tb_hits,
            "search finished"
        );
        Ok(info)
    }
}

/// Evaluate a single node outside the batched worker path (used for the
/// root before workers start).
pub(crate) fn evaluate_single<P: Position, E: Evaluator>(
    node: &Arc<Node<P>>,
    pos: &P,
    evaluator: &E,
    settings: &SearchSettings,
) -> Result<bool, SearchError> {
    let mut input = vec![0.0f32; P::plane_size()];
    pos.encode_planes(&mut input);
    let mut value = [0.0f32; 1];
    let mut policy = vec![0.0f32; evaluator.policy_output_length()];
    evaluator.predict(&input, &mut value, &mut policy)?;

    node.set_probabilities_for_moves(&policy, pos.side_to_move());
    node.post_process_policy(evaluator.is_policy_map(), settings);
    let tb_hit = node.assign_value(value[0]);
    node.enable_has_nn_results();
    Ok(tb_hit)
}

/// Condense the root's statistics into caller-facing form: the
/// temperature-sharpened visit distribution as the improved policy, the
/// most visited move as best.
fn eval_info<P: Position>(root: &Arc<Node<P>>, tb_hits: u64, temperature: f32) -> EvalInfo<P::Move> {
    let snap = root.snapshot();
    let rows = root.child_summaries();
    let legal_moves: Vec<P::Move> = rows.iter().map(|&(mv, _, _)| mv).collect();

    let mut best_move_idx = 0;
    let mut best_visits = f32::NEG_INFINITY;
    for (i, &v) in snap.visits.iter().enumerate() {
        if v > best_visits {
            best_visits = v;
            best_move_idx = i;
        }
    }

    let visit_sum: f32 = snap.visits.iter().sum();
    let policy_prob_small: Vec<f32> = if visit_sum <= 0.0 {
        snap.prior.clone()
    } else if temperature < 1e-6 {
        // Greedy: all mass on the most visited move.
        let mut policy = vec![0.0; snap.visits.len()];
        policy[best_move_idx] = 1.0;
        policy
    } else {
        let scaled: Vec<f32> = snap
            .visits
            .iter()
            .map(|&v| {
                if temperature == 1.0 {
                    v
                } else {
                    v.powf(1.0 / temperature)
                }
            })
            .collect();
        let total: f32 = scaled.iter().sum();
        scaled.iter().map(|v| v / total).collect()
    };

    EvalInfo {
        legal_moves,
        policy_prob_small,
        best_move_idx,
        best_move_q: snap.q_values.get(best_move_idx).copied().unwrap_or(0.0),
        value: snap.value,
        total_visits: snap.total_visits - 1.0,
        tb_hits,
    }
}

/// Normalized Dirichlet(alpha) noise via Gamma variates.
fn dirichlet_noise(n: usize, alpha: f32, rng: &mut ChaCha20Rng) -> Vec<f32> {
    if n == 0 {
        return Vec::new();
    }
    let gamma = Gamma::new(alpha as f64, 1.0).expect("alpha is checked positive by the caller");
    let mut samples: Vec<f32> = (0..n).map(|_| gamma.sample(rng) as f32).collect();
    let sum: f32 = samples.iter().sum();
    if sum > 0.0 {
        for s in &mut samples {
            *s /= sum;
        }
    }
    samples
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::evaluator::UniformEvaluator;
    use crate::test_util::{prepare_root, StubEvaluator};
    use game_core::{Position, StateInfo};
    use games_tictactoe::TicTacToe;

    fn winning_position() -> TicTacToe {
        // X: 0, 1 / O: 3, 4; X to move wins immediately at 2.
        let mut pos = TicTacToe::new();
        let mut st = StateInfo::default();
        for mv in [0u8, 3, 1, 4] {
            pos.do_move(mv, &mut st);
        }
        pos
    }

    fn validate_tree(root: &Arc<Node<TicTacToe>>, require_integral: bool) {
        let mut stack = vec![Arc::clone(root)];
        while let Some(node) = stack.pop() {
            let snap = node.snapshot();
            if node.has_nn_results() {
                let prior_sum: f32 = snap.prior.iter().sum();
                assert!(
                    (prior_sum - 1.0).abs() < 1e-3,
                    "prior sum {prior_sum} at {node:?}"
                );
            }
            let visit_sum: f32 = snap.visits.iter().sum();
            assert!(
                (snap.total_visits - 1.0 - visit_sum).abs() < 1e-2,
                "visit bookkeeping off: total {} vs children {visit_sum}",
                snap.total_visits
            );
            for (i, &v) in snap.visits.iter().enumerate() {
                assert!(v >= -1e-4, "negative visits at child {i}");
                if require_integral {
                    assert!(
                        (v - v.round()).abs() < 1e-3,
                        "unreverted virtual loss: visits[{i}] = {v}"
                    );
                }
            }
            for child in node.children().into_iter().flatten() {
                stack.push(child);
            }
        }
    }

    #[test]
    fn search_finds_the_winning_move() {
        let settings = SearchSettings::for_testing().with_batch_size(4);
        let mut session =
            SearchSession::with_seed(settings, UniformEvaluator::new(TicTacToe::POLICY_LEN), 7);
        session.set_position(winning_position());
        session.set_search_limits(SearchLimits::nodes(200));

        let info = session.start().unwrap();

        assert_eq!(info.best_move(), 2, "should pick the immediate win");
        assert!(info.best_move_q > 0.9, "q of a won move: {}", info.best_move_q);
        let policy_sum: f32 = info.policy_prob_small.iter().sum();
        assert!((policy_sum - 1.0).abs() < 1e-4);
        assert!(info.total_visits >= 200.0);
        assert!(info.value > -1.0);
    }

    #[test]
    fn parallel_search_conserves_virtual_loss() {
        // Four threads, transpositions off so every visit is integral: any
        // fractional residue means an unreverted virtual loss.
        let mut settings = SearchSettings::for_testing()
            .with_threads(4)
            .with_batch_size(4);
        settings.use_transpositions = false;

        let mut session =
            SearchSession::with_seed(settings, UniformEvaluator::new(TicTacToe::POLICY_LEN), 3);
        session.set_position(TicTacToe::new());
        session.set_search_limits(SearchLimits::nodes(300));

        let info = session.start().unwrap();
        assert!(info.total_visits >= 300.0);

        let root = Arc::clone(session.root_node().unwrap());
        validate_tree(&root, true);
    }

    #[test]
    fn single_thread_search_with_transpositions_is_consistent() {
        let settings = SearchSettings::for_testing().with_batch_size(4);
        let mut session =
            SearchSession::with_seed(settings, UniformEvaluator::new(TicTacToe::POLICY_LEN), 11);
        session.set_position(TicTacToe::new());
        session.set_search_limits(SearchLimits::nodes(150));

        session.start().unwrap();
        let root = Arc::clone(session.root_node().unwrap());
        validate_tree(&root, true);
    }

    #[test]
    fn same_seed_same_result() {
        let run = || {
            let mut settings = SearchSettings::for_testing().with_batch_size(2);
            settings.dirichlet_alpha = 0.3;
            settings.dirichlet_epsilon = 0.25;
            let mut session = SearchSession::with_seed(
                settings,
                UniformEvaluator::new(TicTacToe::POLICY_LEN),
                99,
            );
            session.set_position(TicTacToe::new());
            session.set_search_limits(SearchLimits::nodes(60));
            session.start().unwrap()
        };

        let a = run();
        let b = run();
        assert_eq!(a.best_move_idx, b.best_move_idx);
        assert_eq!(a.policy_prob_small, b.policy_prob_small);
        assert_eq!(a.total_visits, b.total_visits);
    }

    #[test]
    fn missing_root_is_an_error() {
        let mut session: SearchSession<TicTacToe, _> = SearchSession::with_seed(
            SearchSettings::for_testing(),
            UniformEvaluator::new(TicTacToe::POLICY_LEN),
            0,
        );
        assert!(matches!(session.start(), Err(SearchError::MissingRoot)));
    }

    #[test]
    fn terminal_root_is_an_error() {
        // X wins on the last setup move; the resulting root is decided.
        let mut pos = TicTacToe::new();
        let mut st = StateInfo::default();
        for mv in [0u8, 3, 1, 4, 2] {
            pos.do_move(mv, &mut st);
        }
        assert!(pos.is_terminal());

        let mut session = SearchSession::with_seed(
            SearchSettings::for_testing(),
            UniformEvaluator::new(TicTacToe::POLICY_LEN),
            0,
        );
        session.set_position(pos);
        assert!(matches!(session.start(), Err(SearchError::NoLegalMoves)));
    }

    #[test]
    fn evaluator_failure_aborts_the_session() {
        let mut session = SearchSession::with_seed(
            SearchSettings::for_testing(),
            StubEvaluator::failing(TicTacToe::POLICY_LEN),
            0,
        );
        session.set_position(TicTacToe::new());
        assert!(matches!(
            session.start(),
            Err(SearchError::Evaluator(_))
        ));
    }

    #[test]
    fn stopper_ends_an_unbounded_search() {
        let settings = SearchSettings::for_testing().with_batch_size(2);
        let mut session =
            SearchSession::with_seed(settings, UniformEvaluator::new(TicTacToe::POLICY_LEN), 5);
        session.set_position(TicTacToe::new());
        // No node limit: only the stopper ends this search.
        session.set_search_limits(SearchLimits::default());

        let stopper = session.stopper();
        let canceller = std::thread::spawn(move || {
            std::thread::sleep(std::time::Duration::from_millis(30));
            // Keep signalling for a while so a stop issued before the
            // session raised its flag cannot be lost.
            let deadline = std::time::Instant::now() + std::time::Duration::from_secs(2);
            while std::time::Instant::now() < deadline {
                stopper.stop();
                std::thread::sleep(std::time::Duration::from_millis(1));
            }
        });

        let info = session.start().unwrap();
        canceller.join().unwrap();
        assert!(info.total_visits > 0.0);
    }

    #[test]
    fn eval_info_applies_temperature() {
        let settings = SearchSettings::for_testing();
        let evaluator = UniformEvaluator::new(TicTacToe::POLICY_LEN);
        let root = prepare_root(TicTacToe::new(), &evaluator, &settings);
        root.increment_no_visit_idx();
        for _ in 0..3 {
            root.backup_value(0, 0.0, 0.1, false);
        }
        for _ in 0..7 {
            root.backup_value(1, 0.0, 0.2, false);
        }

        // Temperature 1: proportional to visit counts.
        let proportional = eval_info(&root, 0, 1.0);
        assert!((proportional.policy_prob_small[0] - 0.3).abs() < 1e-5);
        assert!((proportional.policy_prob_small[1] - 0.7).abs() < 1e-5);

        // Temperature 0: all mass on the most visited move.
        let greedy = eval_info(&root, 0, 0.0);
        assert_eq!(greedy.best_move_idx, 1);
        assert!((greedy.policy_prob_small[1] - 1.0).abs() < 1e-6);
        assert!(greedy.policy_prob_small[0].abs() < 1e-6);

        // A low temperature sharpens toward the most visited move.
        let sharp = eval_info(&root, 0, 0.5);
        assert!(sharp.policy_prob_small[1] > 0.8);
        let sum: f32 = sharp.policy_prob_small.iter().sum();
        assert!((sum - 1.0).abs() < 1e-5);
    }

    #[test]
    fn dirichlet_noise_is_normalized() {
        let mut rng = ChaCha20Rng::seed_from_u64(42);
        let noise = dirichlet_noise(5, 0.3, &mut rng);
        assert_eq!(noise.len(), 5);
        let sum: f32 = noise.iter().sum();
        assert!((sum - 1.0).abs() < 1e-3);
        assert!(noise.iter().all(|&v| v >= 0.0));
    }
}
