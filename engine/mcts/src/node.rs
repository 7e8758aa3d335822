//! Search tree node.
//!
//! Each node represents one game state. Children own their subtrees through
//! `Arc`; parents are referenced through non-owning `Weak` back-links, so
//! dropping the root releases the whole tree and promoting a child to root
//! severs its parent link.
//!
//! All mutable statistics live behind one short-lived mutex per node. A
//! selection step (child choice, virtual loss, child pointer read) happens in
//! a single critical section; at most one node lock is ever held at a time.

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock, Weak};

use game_core::{Color, Position};

use crate::config::SearchSettings;

/// Non-owning link to the parent together with this node's slot in the
/// parent's child table.
struct ParentLink<P: Position> {
    node: Weak<Node<P>>,
    child_idx: usize,
}

/// Per-child and per-node statistics, guarded by the node lock.
struct NodeStats<P: Position> {
    /// Value estimate in [-1, 1] from the side to move's perspective.
    value: f32,
    /// Legal moves, reordered by descending prior once results arrive.
    legal_moves: Vec<P::Move>,
    /// Normalized prior policy over `legal_moves`.
    prior: Vec<f32>,
    /// Fractional visit counters (virtual loss makes them transiently
    /// non-integral).
    visits: Vec<f32>,
    /// Accumulated action values (W).
    action_values: Vec<f32>,
    /// `action_values[i] / visits[i]`, 0 while unvisited.
    q_values: Vec<f32>,
    /// Child pointers; `None` until the slot is expanded.
    children: Vec<Option<Arc<Node<P>>>>,
    /// Children with index below this are visible to PUCT selection.
    no_visit_idx: usize,
    /// Sum of child visits plus one for the node itself (virtual losses
    /// included while outstanding).
    total_visits: f32,
    /// Completed descents through this node that ended in a terminal node.
    terminal_visits: f32,
}

/// Outcome of one selection step at a node, taken under its lock.
pub enum NodeStep<P: Position> {
    /// The chosen slot is empty: expand it.
    Expand { child_idx: usize, mv: P::Move },
    /// The chosen child is terminal: back its value up without evaluation.
    Terminal {
        child_idx: usize,
        mv: P::Move,
        child: Arc<Node<P>>,
    },
    /// The chosen child exists but has no network results yet: another
    /// worker owns its evaluation, revert our virtual loss later.
    Collision {
        child_idx: usize,
        mv: P::Move,
        child: Arc<Node<P>>,
    },
    /// The chosen child is fully evaluated: continue the descent there.
    Descend {
        child_idx: usize,
        mv: P::Move,
        child: Arc<Node<P>>,
    },
}

/// Read-only copy of a node's statistics, for result extraction and tests.
#[derive(Debug, Clone)]
pub struct NodeSnapshot {
    pub value: f32,
    pub prior: Vec<f32>,
    pub visits: Vec<f32>,
    pub action_values: Vec<f32>,
    pub q_values: Vec<f32>,
    pub no_visit_idx: usize,
    pub total_visits: f32,
    pub terminal_visits: f32,
}

/// One game state in the shared search tree.
pub struct Node<P: Position> {
    pos: P,
    hash: u64,
    side: Color,
    plies_from_null: u16,
    n_children: usize,
    terminal: bool,
    tablebase: bool,
    transposition: bool,
    /// Set with release ordering only after the statistics arrays are fully
    /// initialized and the prior is normalized.
    has_nn_results: AtomicBool,
    parent: RwLock<Option<ParentLink<P>>>,
    stats: Mutex<NodeStats<P>>,
}

impl<P: Position> Node<P> {
    fn build(pos: P, parent: Option<ParentLink<P>>, transposition: bool) -> Self {
        let legal_moves = pos.legal_moves();
        let n_children = legal_moves.len();
        let terminal = legal_moves.is_empty() || pos.is_terminal();

        let mut tablebase = false;
        let mut value = 0.0;
        if terminal {
            value = pos.terminal_value();
        } else if let Some(tb) = pos.tablebase_value() {
            tablebase = true;
            value = tb;
        }

        Self {
            hash: pos.hash_key(),
            side: pos.side_to_move(),
            plies_from_null: pos.plies_from_null(),
            n_children,
            terminal,
            tablebase,
            transposition,
            has_nn_results: AtomicBool::new(false),
            parent: RwLock::new(parent),
            stats: Mutex::new(NodeStats {
                value,
                legal_moves,
                prior: Vec::new(),
                visits: Vec::new(),
                action_values: Vec::new(),
                q_values: Vec::new(),
                children: Vec::new(),
                no_visit_idx: 0,
                total_visits: 1.0,
                terminal_visits: 0.0,
            }),
            pos,
        }
    }

    /// Create a root node (no parent).
    pub fn new_root(pos: P) -> Self {
        Self::build(pos, None, false)
    }

    /// Create a child node attached below `parent` at `child_idx`.
    pub fn new_child(pos: P, parent: &Arc<Node<P>>, child_idx: usize) -> Self {
        Self::build(
            pos,
            Some(ParentLink {
                node: Arc::downgrade(parent),
                child_idx,
            }),
            false,
        )
    }

    /// Create a child seeded from an already evaluated node with the same
    /// hash key. The evaluated state and statistics are copied as a
    /// snapshot; the child table starts empty so backups never cross the
    /// transposition.
    pub fn transposition_child(
        pos: P,
        parent: &Arc<Node<P>>,
        child_idx: usize,
        source: &Node<P>,
    ) -> Self {
        debug_assert!(source.has_nn_results());
        let src = source.lock_stats();
        let n = src.legal_moves.len();
        let mut node = Self::build(
            pos,
            Some(ParentLink {
                node: Arc::downgrade(parent),
                child_idx,
            }),
            true,
        );
        {
            let stats = node.stats.get_mut().unwrap_or_else(PoisonError::into_inner);
            stats.value = src.value;
            stats.legal_moves = src.legal_moves.clone();
            stats.prior = src.prior.clone();
            stats.visits = src.visits.clone();
            stats.action_values = src.action_values.clone();
            stats.q_values = src.q_values.clone();
            stats.children = vec![None; n];
            stats.no_visit_idx = src.no_visit_idx;
            stats.total_visits = src.total_visits;
            stats.terminal_visits = src.terminal_visits;
        }
        node.has_nn_results.store(true, Ordering::Release);
        node
    }

    fn lock_stats(&self) -> MutexGuard<'_, NodeStats<P>> {
        // Poisoning is ignored; statistics stay usable if a worker panicked.
        self.stats.lock().unwrap_or_else(PoisonError::into_inner)
    }

    // ---------------------------------------------------------------------
    // Selection
    // ---------------------------------------------------------------------

    /// One selection step under the node lock: pick the PUCT-best exposed
    /// child, apply the virtual loss to its slot, and classify the slot.
    pub fn select_and_reserve(&self, settings: &SearchSettings) -> NodeStep<P> {
        let mut s = self.lock_stats();
        let child_idx = s.select_idx(settings);
        s.apply_virtual_loss(child_idx, settings.virtual_loss);
        let mv = s.legal_moves[child_idx];

        match &s.children[child_idx] {
            None => NodeStep::Expand { child_idx, mv },
            Some(child) if child.is_terminal() => NodeStep::Terminal {
                child_idx,
                mv,
                child: Arc::clone(child),
            },
            Some(child) if !child.has_nn_results() => NodeStep::Collision {
                child_idx,
                mv,
                child: Arc::clone(child),
            },
            Some(child) => NodeStep::Descend {
                child_idx,
                mv,
                child: Arc::clone(child),
            },
        }
    }

    /// PUCT argmax over the exposed children. Exposed for tests; the search
    /// itself uses [`select_and_reserve`](Node::select_and_reserve).
    pub fn select_child(&self, settings: &SearchSettings) -> usize {
        self.lock_stats().select_idx(settings)
    }

    /// Apply a virtual loss to child `idx`.
    pub fn apply_virtual_loss(&self, idx: usize, vloss: f32) {
        self.lock_stats().apply_virtual_loss(idx, vloss);
    }

    /// Revert the virtual loss on child `idx` and credit one completed
    /// descent carrying `value` (already from this node's perspective).
    pub fn backup_value(&self, idx: usize, vloss: f32, value: f32, terminal: bool) {
        let mut s = self.lock_stats();
        s.visits[idx] += 1.0 - vloss;
        s.action_values[idx] += value + vloss;
        s.q_values[idx] = if s.visits[idx] > 0.0 {
            s.action_values[idx] / s.visits[idx]
        } else {
            0.0
        };
        s.total_visits += 1.0 - vloss;
        if terminal {
            s.terminal_visits += 1.0;
        }
    }

    /// Revert the virtual loss on child `idx` with no visit or value credit.
    /// Exactly inverts [`apply_virtual_loss`](Node::apply_virtual_loss).
    pub fn backup_collision(&self, idx: usize, vloss: f32) {
        let mut s = self.lock_stats();
        s.visits[idx] -= vloss;
        s.action_values[idx] += vloss;
        s.q_values[idx] = if s.visits[idx] > 0.0 {
            s.action_values[idx] / s.visits[idx]
        } else {
            0.0
        };
        s.total_visits -= vloss;
    }

    // ---------------------------------------------------------------------
    // Expansion
    // ---------------------------------------------------------------------

    /// Install an ordinary child pointer.
    pub fn add_new_child(&self, idx: usize, child: Arc<Node<P>>) {
        self.lock_stats().children[idx] = Some(child);
    }

    /// Install a transposition child pointer.
    pub fn add_transposition_child(&self, idx: usize, child: Arc<Node<P>>) {
        debug_assert!(child.is_transposition());
        self.lock_stats().children[idx] = Some(child);
    }

    /// Expose one more child to PUCT selection, saturating at the number of
    /// legal moves.
    pub fn increment_no_visit_idx(&self) {
        let mut s = self.lock_stats();
        s.no_visit_idx = (s.no_visit_idx + 1).min(s.legal_moves.len());
    }

    // ---------------------------------------------------------------------
    // Network result assignment
    // ---------------------------------------------------------------------

    /// Gather the raw policy entries for the legal moves using the
    /// side-to-move aware lookup.
    pub fn set_probabilities_for_moves(&self, policy: &[f32], side: Color) {
        let mut s = self.lock_stats();
        s.prior = s
            .legal_moves
            .iter()
            .map(|&mv| policy[P::policy_index(mv, side)])
            .collect();
    }

    /// Post-process the gathered policy: softmax over legal moves (unless
    /// the network output is a policy map), check enhancement, temperature,
    /// then reorder children by descending prior and size the statistics
    /// arrays. Must run before [`enable_has_nn_results`](Node::enable_has_nn_results).
    pub fn post_process_policy(&self, is_policy_map: bool, settings: &SearchSettings) {
        debug_assert!(!self.terminal);
        let mut s = self.lock_stats();

        if is_policy_map {
            normalize(&mut s.prior);
        } else {
            softmax(&mut s.prior);
        }

        if settings.enhance_checks {
            let max_prior = s.prior.iter().cloned().fold(0.0f32, f32::max);
            let mut boosted = false;
            for i in 0..s.prior.len() {
                if s.prior[i] < settings.check_enhance_threshold
                    && self.pos.gives_check(s.legal_moves[i])
                {
                    s.prior[i] += settings.check_enhance_factor * max_prior;
                    boosted = true;
                }
            }
            if boosted {
                normalize(&mut s.prior);
            }
        }

        if (settings.policy_temperature - 1.0).abs() > f32::EPSILON {
            let inv_t = 1.0 / settings.policy_temperature;
            for p in s.prior.iter_mut() {
                *p = p.powf(inv_t);
            }
            normalize(&mut s.prior);
        }

        s.sort_by_prior();

        let n = s.legal_moves.len();
        s.visits = vec![0.0; n];
        s.action_values = vec![0.0; n];
        s.q_values = vec![0.0; n];
        s.children = vec![None; n];
        s.no_visit_idx = n.min(1);
    }

    /// Assign the network value estimate, blending with a tablebase value
    /// when both this node and its parent are tablebase positions. Returns
    /// whether a tablebase hit occurred.
    pub fn assign_value(&self, nn_value: f32) -> bool {
        if !self.tablebase {
            self.lock_stats().value = nn_value;
            return false;
        }
        let parent_is_tb = self
            .parent_link()
            .map(|(parent, _)| parent.is_tablebase())
            .unwrap_or(false);
        let mut s = self.lock_stats();
        if s.value != 0.0 && parent_is_tb {
            // Average the tablebase entry and the network eval for non-draws.
            s.value = (nn_value + s.value) * 0.5;
        }
        true
    }

    /// Publish the network results. Callers must have sized and normalized
    /// the statistics arrays first.
    pub fn enable_has_nn_results(&self) {
        #[cfg(debug_assertions)]
        {
            let s = self.lock_stats();
            let sum: f32 = s.prior.iter().sum();
            debug_assert!(
                s.prior.is_empty() || (sum - 1.0).abs() < 1e-3,
                "prior not normalized: {sum}"
            );
            debug_assert_eq!(s.visits.len(), s.legal_moves.len());
        }
        self.has_nn_results.store(true, Ordering::Release);
    }

    /// Mix Dirichlet noise into the prior: `p <- (1-eps)*p + eps*noise`.
    pub fn mix_noise(&self, epsilon: f32, noise: &[f32]) {
        let mut s = self.lock_stats();
        debug_assert_eq!(noise.len(), s.prior.len());
        for (p, &n) in s.prior.iter_mut().zip(noise) {
            *p = (1.0 - epsilon) * *p + epsilon * n;
        }
    }

    // ---------------------------------------------------------------------
    // Accessors
    // ---------------------------------------------------------------------

    #[inline]
    pub fn has_nn_results(&self) -> bool {
        self.has_nn_results.load(Ordering::Acquire)
    }

    #[inline]
    pub fn is_terminal(&self) -> bool {
        self.terminal
    }

    #[inline]
    pub fn is_tablebase(&self) -> bool {
        self.tablebase
    }

    #[inline]
    pub fn is_transposition(&self) -> bool {
        self.transposition
    }

    #[inline]
    pub fn hash_key(&self) -> u64 {
        self.hash
    }

    #[inline]
    pub fn side_to_move(&self) -> Color {
        self.side
    }

    #[inline]
    pub fn plies_from_null(&self) -> u16 {
        self.plies_from_null
    }

    #[inline]
    pub fn n_children(&self) -> usize {
        self.n_children
    }

    pub fn position(&self) -> &P {
        &self.pos
    }

    /// Current value estimate.
    pub fn value(&self) -> f32 {
        self.lock_stats().value
    }

    /// Completed descents through this node (outstanding virtual losses
    /// included while a batch is in flight).
    pub fn visits(&self) -> f32 {
        self.lock_stats().total_visits - 1.0
    }

    /// Descents through this node that ended at a terminal node.
    pub fn terminal_visits(&self) -> f32 {
        self.lock_stats().terminal_visits
    }

    /// The parent and this node's child index there, while the parent is
    /// alive and the link has not been severed.
    pub fn parent_link(&self) -> Option<(Arc<Node<P>>, usize)> {
        let guard = self
            .parent
            .read()
            .unwrap_or_else(PoisonError::into_inner);
        guard
            .as_ref()
            .and_then(|link| link.node.upgrade().map(|p| (p, link.child_idx)))
    }

    /// Sever the parent link, making this node a root.
    pub fn make_root(&self) {
        *self.parent.write().unwrap_or_else(PoisonError::into_inner) = None;
    }

    /// Child pointer at `idx`, if expanded.
    pub fn child(&self, idx: usize) -> Option<Arc<Node<P>>> {
        self.lock_stats().children[idx].as_ref().map(Arc::clone)
    }

    /// All child pointers, for tree traversals.
    pub fn children(&self) -> Vec<Option<Arc<Node<P>>>> {
        self.lock_stats()
            .children
            .iter()
            .map(|c| c.as_ref().map(Arc::clone))
            .collect()
    }

    /// Per-child `(move, visits, q)` rows in prior order.
    pub fn child_summaries(&self) -> Vec<(P::Move, f32, f32)> {
        let s = self.lock_stats();
        (0..s.legal_moves.len())
            .map(|i| {
                (
                    s.legal_moves[i],
                    s.visits.get(i).copied().unwrap_or(0.0),
                    s.q_values.get(i).copied().unwrap_or(0.0),
                )
            })
            .collect()
    }

    /// Copy of the node statistics.
    pub fn snapshot(&self) -> NodeSnapshot {
        let s = self.lock_stats();
        NodeSnapshot {
            value: s.value,
            prior: s.prior.clone(),
            visits: s.visits.clone(),
            action_values: s.action_values.clone(),
            q_values: s.q_values.clone(),
            no_visit_idx: s.no_visit_idx,
            total_visits: s.total_visits,
            terminal_visits: s.terminal_visits,
        }
    }
}

impl<P: Position> fmt::Debug for Node<P> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Node")
            .field("hash", &self.hash)
            .field("terminal", &self.terminal)
            .field("tablebase", &self.tablebase)
            .field("transposition", &self.transposition)
            .field("has_nn_results", &self.has_nn_results())
            .finish_non_exhaustive()
    }
}

impl<P: Position> NodeStats<P> {
    /// PUCT argmax over children below `no_visit_idx`. Unvisited children
    /// score with first-play urgency; ties break toward the smallest index.
    fn select_idx(&self, settings: &SearchSettings) -> usize {
        debug_assert!(self.no_visit_idx >= 1, "selection before expansion");
        let sqrt_total = self.total_visits.sqrt();
        let fpu = (self.value - settings.fpu_reduction).clamp(-1.0, 1.0);

        let mut best_idx = 0;
        let mut best_score = f32::NEG_INFINITY;
        for i in 0..self.no_visit_idx {
            let q = if self.visits[i] > 0.0 {
                self.q_values[i]
            } else {
                fpu
            };
            let u = settings.c_puct * self.prior[i] * sqrt_total / (1.0 + self.visits[i]);
            let score = q + u;
            if score > best_score {
                best_score = score;
                best_idx = i;
            }
        }
        best_idx
    }

    fn apply_virtual_loss(&mut self, idx: usize, vloss: f32) {
        self.visits[idx] += vloss;
        self.action_values[idx] -= vloss;
        self.q_values[idx] = self.action_values[idx] / self.visits[idx];
        self.total_visits += vloss;
    }

    /// Stable sort of the move list by descending prior, keeping the two
    /// vectors aligned. Runs before the statistics arrays are sized.
    fn sort_by_prior(&mut self) {
        let mut order: Vec<usize> = (0..self.prior.len()).collect();
        order.sort_by(|&a, &b| {
            self.prior[b]
                .partial_cmp(&self.prior[a])
                .unwrap_or(std::cmp::Ordering::Equal)
        });
        let prior: Vec<f32> = order.iter().map(|&i| self.prior[i]).collect();
        let moves: Vec<P::Move> = order.iter().map(|&i| self.legal_moves[i]).collect();
        self.prior = prior;
        self.legal_moves = moves;
    }
}

/// In-place numerically stable softmax.
fn softmax(values: &mut [f32]) {
    if values.is_empty() {
        return;
    }
    let max = values.iter().cloned().fold(f32::NEG_INFINITY, f32::max);
    let mut sum = 0.0;
    for v in values.iter_mut() {
        *v = (*v - max).exp();
        sum += *v;
    }
    for v in values.iter_mut() {
        *v /= sum;
    }
}

/// In-place renormalization; falls back to uniform on a zero sum.
fn normalize(values: &mut [f32]) {
    if values.is_empty() {
        return;
    }
    let sum: f32 = values.iter().sum();
    if sum > 0.0 {
        for v in values.iter_mut() {
            *v /= sum;
        }
    } else {
        let uniform = 1.0 / values.len() as f32;
        values.fill(uniform);
    }
}
