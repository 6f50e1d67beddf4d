//! AlgDb - graph (GAS) processing layered on SeqDb.
//!
//! Single-node run:
//! 1. SeqDb fixed point over the single-entry filters
//! 2. collect vertices from local keys, build the vertex arena
//! 3. compute rounds, delivering scattered messages locally, until no
//!    vertex program ends a round ACTIVE
//! 4. stage and commit every effect of the graph run, then tear down
//!
//! The distributed variant in `par_db` drives the same [`GraphEngine`]
//! with the vertex set and the per-round messages exchanged over the mesh.

mod board;
mod gas;
mod graph;

use std::sync::Arc;

use crate::error::Result;
use crate::filter::FilterCatalog;
use crate::seq_db::SeqDb;

pub use board::{MessageBoard, VertexMessage};
pub use gas::{GasProgram, GasValue, GasVertex};
pub use graph::{GraphEngine, GroupAccess, OutEdge, RoundOutcome, VertexState};

/// Summary of one `AlgDb::process` call.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct AlgReport {
    pub seq_rounds: usize,
    /// Graph iterations run; 0 when the graph stage was skipped.
    pub iterations: u64,
    pub effects: usize,
}

pub struct AlgDb {
    seq: SeqDb,
    engine: GraphEngine,
    skip_group_filters: bool,
}

impl AlgDb {
    pub fn new(catalog: Arc<FilterCatalog>) -> Self {
        Self::with_seq(SeqDb::new(catalog))
    }

    pub fn with_seq(seq: SeqDb) -> Self {
        Self { seq, engine: GraphEngine::new(), skip_group_filters: false }
    }

    pub fn seq(&self) -> &SeqDb {
        &self.seq
    }

    pub fn seq_mut(&mut self) -> &mut SeqDb {
        &mut self.seq
    }

    pub fn disable_group_filters(&mut self) {
        self.skip_group_filters = true;
    }

    pub fn skip_group_filters(&self) -> bool {
        self.skip_group_filters
    }

    pub fn process(&mut self) -> Result<AlgReport> {
        let mut report = AlgReport { seq_rounds: self.seq.process()?, ..AlgReport::default() };

        let filters = self.seq.filters().group();
        if self.skip_group_filters || filters.is_empty() {
            return Ok(report);
        }

        let mut effects = Vec::new();
        {
            let store = self.seq.read();
            self.engine.add_vertices(GraphEngine::local_vertices(&store));
            self.engine.setup(&store, filters, &*store, &mut effects)?;
            loop {
                let round = self.engine.compute_round(&*store, &mut effects)?;
                self.engine.deliver(round.iter, round.outgoing);
                if !round.active {
                    break;
                }
            }
            report.iterations = self.engine.iter();
        }
        self.engine.teardown();

        report.effects = effects.len();
        for mutation in effects {
            self.seq.stage(mutation);
        }
        self.seq.stage_close()?;
        tracing::debug!(iterations = report.iterations, effects = report.effects, "graph stage done");
        Ok(report)
    }
}
