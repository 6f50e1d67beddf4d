//! Per-iteration vertex message queues.
//!
//! Messages are filed under the iteration they are read in. A vertex
//! scattering during iteration `i` posts to `i + 1`; the board for `i` is
//! dropped once the round that reads it has run.

use std::collections::{BTreeMap, HashMap};

use crate::key::{GraphId, VertexId};

/// One scattered value addressed to `(graph, vtx)`.
#[derive(Debug, Clone, PartialEq)]
pub struct VertexMessage {
    pub graph: GraphId,
    pub vtx: VertexId,
    pub payload: Vec<u8>,
}

type Inboxes = HashMap<(GraphId, VertexId), Vec<Vec<u8>>>;

#[derive(Debug, Default)]
pub struct MessageBoard {
    by_iter: BTreeMap<u64, Inboxes>,
}

impl MessageBoard {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn post(&mut self, iter: u64, msg: VertexMessage) {
        self.by_iter
            .entry(iter)
            .or_default()
            .entry((msg.graph, msg.vtx))
            .or_default()
            .push(msg.payload);
    }

    pub fn extend(&mut self, iter: u64, msgs: impl IntoIterator<Item = VertexMessage>) {
        for msg in msgs {
            self.post(iter, msg);
        }
    }

    pub fn inbox(&self, iter: u64, graph: GraphId, vtx: VertexId) -> &[Vec<u8>] {
        self.by_iter
            .get(&iter)
            .and_then(|inboxes| inboxes.get(&(graph, vtx)))
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }

    /// Drop every iteration older than `iter`.
    pub fn discard_before(&mut self, iter: u64) {
        self.by_iter = self.by_iter.split_off(&iter);
    }

    /// Number of queued payloads across all iterations.
    pub fn len(&self) -> usize {
        self.by_iter.values().flat_map(HashMap::values).map(Vec::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn clear(&mut self) {
        self.by_iter.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn msg(graph: GraphId, vtx: VertexId, v: u8) -> VertexMessage {
        VertexMessage { graph, vtx, payload: vec![v] }
    }

    #[test]
    fn test_inbox_per_iteration() {
        let mut board = MessageBoard::new();
        board.post(1, msg(7, 2, 10));
        board.post(1, msg(7, 2, 11));
        board.post(2, msg(7, 2, 12));
        board.post(1, msg(8, 2, 13));

        assert_eq!(board.inbox(1, 7, 2), &[vec![10], vec![11]]);
        assert_eq!(board.inbox(2, 7, 2), &[vec![12]]);
        assert_eq!(board.inbox(1, 8, 2), &[vec![13]]);
        assert!(board.inbox(3, 7, 2).is_empty());
        assert_eq!(board.len(), 4);
    }

    #[test]
    fn test_discard_before_keeps_future() {
        let mut board = MessageBoard::new();
        board.extend(1, vec![msg(1, 1, 1)]);
        board.extend(2, vec![msg(1, 1, 2)]);
        board.discard_before(2);
        assert!(board.inbox(1, 1, 1).is_empty());
        assert_eq!(board.inbox(2, 1, 1), &[vec![2]]);
        board.clear();
        assert!(board.is_empty());
    }
}
