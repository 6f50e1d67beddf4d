//! Built-in filter bundle.
//!
//! | filter                      | kind          |
//! |-----------------------------|---------------|
//! | `BTC_block_to_tx`           | single entry  |
//! | `DOGE_block_to_tx`          | single entry  |
//! | `BTC_tx_subgraph_search`    | group entries |
//! | `DOGE_tx_subgraph_search`   | group entries |

mod block_to_tx;
mod tx_subgraph_distance;

use crate::filter::Filter;
use crate::key::chain;

pub use block_to_tx::BlockToTx;
pub use tx_subgraph_distance::{TxDistance, TxSubgraphSearch, UNREACHED};

pub const BUILTIN_BUNDLE: &str = "builtin";

pub fn builtin_filters() -> Vec<Filter> {
    vec![
        Filter::single(BlockToTx::new("BTC", chain::BTC)),
        Filter::single(BlockToTx::new("DOGE", chain::DOGE)),
        Filter::group(TxSubgraphSearch::new("BTC", chain::BTC)),
        Filter::group(TxSubgraphSearch::new("DOGE", chain::DOGE)),
    ]
}

/// Tag a filter leaves on entries it has handled.
pub(crate) fn done_tag(filter: &str) -> String {
    format!("{}:done", filter)
}

pub(crate) fn fail_tag(filter: &str) -> String {
    format!("{}:fail", filter)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::filter::{FilterCatalog, FilterKind};

    #[test]
    fn test_builtin_bundle_contents() {
        let catalog = FilterCatalog::builtin();
        let bundle = catalog.bundle(BUILTIN_BUNDLE).unwrap();
        let names: Vec<_> = bundle.iter().map(|f| f.name().to_string()).collect();
        assert_eq!(
            names,
            ["BTC_block_to_tx", "DOGE_block_to_tx", "BTC_tx_subgraph_search", "DOGE_tx_subgraph_search"]
        );
        assert_eq!(bundle[0].kind(), FilterKind::SingleEntry);
        assert_eq!(bundle[3].kind(), FilterKind::GroupEntries);
    }
}
