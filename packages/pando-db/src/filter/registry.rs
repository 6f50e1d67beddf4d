//! Static filter registry.
//!
//! Filters are compiled in and grouped into named bundles. Making a bundle
//! available (`add_filter_dir`) and installing a filter by name are
//! separate steps, so every agent can hold the same catalog while the
//! installed set is driven over the wire.

use std::collections::BTreeMap;
use std::sync::Arc;

use super::{Filter, GroupFilter, SingleEntryFilter};
use crate::error::{PandoError, Result};

#[derive(Debug, Clone, Default)]
pub struct FilterCatalog {
    bundles: BTreeMap<String, Vec<Filter>>,
}

impl FilterCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Catalog holding the `"builtin"` bundle.
    pub fn builtin() -> Self {
        let mut catalog = Self::new();
        catalog.register_bundle(crate::filters::BUILTIN_BUNDLE, crate::filters::builtin_filters());
        catalog
    }

    /// Add or replace a bundle.
    pub fn register_bundle(&mut self, name: impl Into<String>, filters: Vec<Filter>) {
        self.bundles.insert(name.into(), filters);
    }

    pub fn bundle(&self, name: &str) -> Result<&[Filter]> {
        self.bundles
            .get(name)
            .map(Vec::as_slice)
            .ok_or_else(|| PandoError::FilterBundleNotFound(name.to_string()))
    }

    pub fn bundle_names(&self) -> impl Iterator<Item = &str> {
        self.bundles.keys().map(String::as_str)
    }
}

/// Filters available to and installed on one database.
#[derive(Debug, Clone)]
pub struct FilterSet {
    catalog: Arc<FilterCatalog>,
    available: BTreeMap<String, Filter>,
    /// Install order is run order.
    installed: Vec<Filter>,
}

impl FilterSet {
    pub fn new(catalog: Arc<FilterCatalog>) -> Self {
        Self { catalog, available: BTreeMap::new(), installed: Vec::new() }
    }

    /// Make every filter of a bundle installable. Returns how many.
    pub fn add_bundle(&mut self, bundle: &str) -> Result<usize> {
        let filters = self.catalog.bundle(bundle)?;
        for filter in filters {
            self.available.insert(filter.name().to_string(), filter.clone());
        }
        tracing::debug!(bundle, count = filters.len(), "filter bundle added");
        Ok(filters.len())
    }

    /// Install an available filter; installing twice is a no-op.
    pub fn install(&mut self, name: &str) -> Result<()> {
        if self.installed.iter().any(|f| f.name() == name) {
            return Ok(());
        }
        let filter = self
            .available
            .get(name)
            .cloned()
            .ok_or_else(|| PandoError::FilterNotFound(name.to_string()))?;
        self.installed.push(filter);
        Ok(())
    }

    pub fn clear(&mut self) {
        self.installed.clear();
    }

    pub fn installed_names(&self) -> Vec<String> {
        self.installed.iter().map(|f| f.name().to_string()).collect()
    }

    pub fn single_entry(&self) -> Vec<Arc<dyn SingleEntryFilter>> {
        self.installed
            .iter()
            .filter_map(|f| match f {
                Filter::Single(s) => Some(Arc::clone(s)),
                Filter::Group(_) => None,
            })
            .collect()
    }

    pub fn group(&self) -> Vec<Arc<dyn GroupFilter>> {
        self.installed
            .iter()
            .filter_map(|f| match f {
                Filter::Group(g) => Some(Arc::clone(g)),
                Filter::Single(_) => None,
            })
            .collect()
    }

    pub fn has_group_filters(&self) -> bool {
        self.installed.iter().any(|f| matches!(f, Filter::Group(_)))
    }
}
