//! Self-play training sample exporter.
//!
//! During a self-play game the controller calls [`TrainExporter::save_sample`]
//! once per ply with the searched position and its root statistics; samples
//! accumulate in game-local buffers. When the game ends,
//! [`TrainExporter::export_game_samples`] stamps the final result over every
//! ply (sign-alternated for the loser's moves) and appends the game to the
//! chunked store. The store has a fixed capacity; over-capacity samples are
//! dropped with a warning rather than failing the self-play run.

mod store;

pub use store::{ChunkStore, Dataset, Dtype, Element, ExportError, StoreDims};

use std::marker::PhantomData;
use std::path::Path;

use game_core::{GameResult, Position};
use mcts::EvalInfo;
use ndarray::{concatenate, Array1, Array2, Array4, Axis};
use tracing::warn;

/// Game-buffered exporter over a [`ChunkStore`].
#[derive(Debug)]
pub struct TrainExporter<P: Position> {
    store: ChunkStore,
    number_samples: usize,
    /// Next free sample row in the store.
    start_idx: usize,
    /// Next row of the `start_indices` dataset to fill.
    game_idx: usize,
    first_move: bool,
    game_planes: Array4<i16>,
    game_policy: Array2<f32>,
    game_best_move_q: Array1<f32>,
    _game: PhantomData<P>,
}

impl<P: Position> TrainExporter<P> {
    /// Open or create the store at `path` with `number_chunks * chunk_size`
    /// sample slots. An existing file is reused with overwrite semantics for
    /// its already-filled prefix.
    pub fn new(path: &Path, number_chunks: usize, chunk_size: usize) -> Result<Self, ExportError> {
        let dims = StoreDims {
            channels: P::CHANNELS,
            height: P::HEIGHT,
            width: P::WIDTH,
            policy_len: P::POLICY_LEN,
            number_chunks,
            chunk_size,
        };

        let fresh = !ChunkStore::exists(path);
        let store = if fresh {
            ChunkStore::create(path, dims)?
        } else {
            warn!(path = %path.display(), "export file already exists, it will be overwritten");
            let store = ChunkStore::open(path)?;
            if store.dims() != dims {
                return Err(ExportError::Schema(format!(
                    "existing store {:?} does not match requested {:?}",
                    store.dims(),
                    dims
                )));
            }
            store
        };

        let mut exporter = Self {
            number_samples: dims.number_samples(),
            store,
            start_idx: 0,
            game_idx: 0,
            first_move: true,
            game_planes: Array4::zeros((0, P::CHANNELS, P::HEIGHT, P::WIDTH)),
            game_policy: Array2::zeros((0, P::POLICY_LEN)),
            game_best_move_q: Array1::zeros(0),
            _game: PhantomData,
        };
        if fresh {
            exporter.save_start_idx()?;
        }
        Ok(exporter)
    }

    /// Buffer one ply: the position's planes, the one-hot-scattered search
    /// policy, and the best move's Q value. The game result is stamped later
    /// by [`export_game_samples`](TrainExporter::export_game_samples).
    pub fn save_sample(
        &mut self,
        pos: &P,
        eval: &EvalInfo<P::Move>,
        idx_offset: usize,
    ) -> Result<(), ExportError> {
        if self.start_idx + idx_offset >= self.number_samples {
            warn!(
                start_idx = self.start_idx,
                idx_offset, "sample capacity exhausted, dropping sample"
            );
            return Ok(());
        }

        let mut planes_f = vec![0.0f32; P::plane_size()];
        pos.encode_planes(&mut planes_f);
        let planes_i: Vec<i16> = planes_f.iter().map(|&v| v as i16).collect();
        let planes =
            Array4::from_shape_vec((1, P::CHANNELS, P::HEIGHT, P::WIDTH), planes_i)?;

        let mut policy = Array2::<f32>::zeros((1, P::POLICY_LEN));
        let side = pos.side_to_move();
        for (j, &mv) in eval.legal_moves.iter().enumerate() {
            policy[[0, P::policy_index(mv, side)]] = eval.policy_prob_small[j];
        }

        let best_move_q = Array1::from_vec(vec![eval.best_move_q]);

        if self.first_move {
            self.game_planes = planes;
            self.game_policy = policy;
            self.game_best_move_q = best_move_q;
        } else {
            self.game_planes =
                concatenate(Axis(0), &[self.game_planes.view(), planes.view()])?;
            self.game_policy =
                concatenate(Axis(0), &[self.game_policy.view(), policy.view()])?;
            self.game_best_move_q = concatenate(
                Axis(0),
                &[self.game_best_move_q.view(), best_move_q.view()],
            )?;
        }
        self.first_move = false;
        Ok(())
    }

    /// Write the buffered game into the store: `result` for the first
    /// mover's plies, sign-flipped on the alternate plies unless drawn.
    /// `plys` is clamped to the remaining capacity.
    pub fn export_game_samples(
        &mut self,
        result: GameResult,
        plys: usize,
    ) -> Result<(), ExportError> {
        if self.start_idx >= self.number_samples {
            warn!("export file is full, dropping game");
            return Ok(());
        }
        let mut plys = plys;
        if self.start_idx + plys > self.number_samples {
            plys = self.number_samples - self.start_idx;
            warn!(adjusted = plys, "clamping exported plies to remaining capacity");
        }
        debug_assert!(plys <= self.game_planes.shape()[0], "more plies than buffered samples");

        let mut value = vec![result.as_i16(); plys];
        if result != GameResult::Draw {
            // Invert the result on every second ply.
            for v in value.iter_mut().skip(1).step_by(2) {
                *v = -result.as_i16();
            }
        }

        let plane_len = P::plane_size();
        let planes: Vec<i16> = self
            .game_planes
            .iter()
            .take(plys * plane_len)
            .copied()
            .collect();
        let policy: Vec<f32> = self
            .game_policy
            .iter()
            .take(plys * P::POLICY_LEN)
            .copied()
            .collect();
        let best_move_q: Vec<f32> = self
            .game_best_move_q
            .iter()
            .take(plys)
            .copied()
            .collect();

        self.store.x.write_rows(self.start_idx, &planes)?;
        self.store.y_value.write_rows(self.start_idx, &value)?;
        self.store
            .y_best_move_q
            .write_rows(self.start_idx, &best_move_q)?;
        self.store.y_policy.write_rows(self.start_idx, &policy)?;

        self.start_idx += plys;
        self.game_idx += 1;
        self.save_start_idx()
    }

    /// Reset the per-game buffers; the next
    /// [`save_sample`](TrainExporter::save_sample) starts a new game.
    pub fn new_game(&mut self) {
        self.first_move = true;
    }

    /// Whether every sample slot has been used.
    pub fn is_file_full(&self) -> bool {
        self.start_idx >= self.number_samples
    }

    pub fn number_samples(&self) -> usize {
        self.number_samples
    }

    pub fn start_idx(&self) -> usize {
        self.start_idx
    }

    pub fn game_idx(&self) -> usize {
        self.game_idx
    }

    pub fn store(&self) -> &ChunkStore {
        &self.store
    }

    fn save_start_idx(&mut self) -> Result<(), ExportError> {
        self.store
            .start_indices
            .write_rows(self.game_idx, &[self.start_idx as i32])
    }
}
