//! Source id to adapter mapping, resolved once at startup.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use scout_core::{Criteria, Listing, SourceId};
use scout_storage::HttpFetcher;
use tracing::info;

use crate::{
    AdapterError, AmazonAdapter, DetailPolicy, EbayAdapter, GenericAdapter, MomoAdapter,
    PchomeAdapter, Rent591Adapter, SourceAdapter,
};

#[derive(Clone, Default)]
pub struct AdapterRegistry {
    adapters: BTreeMap<SourceId, Arc<dyn SourceAdapter>>,
}

impl fmt::Debug for AdapterRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AdapterRegistry")
            .field("sources", &self.sources())
            .finish()
    }
}

impl AdapterRegistry {
    pub fn empty() -> Self {
        Self::default()
    }

    /// Every built-in marketplace adapter.
    pub fn with_defaults(detail: DetailPolicy) -> Self {
        let mut registry = Self::empty();
        registry.register(Arc::new(Rent591Adapter::new(detail)));
        registry.register(Arc::new(MomoAdapter));
        registry.register(Arc::new(PchomeAdapter));
        registry.register(Arc::new(AmazonAdapter));
        registry.register(Arc::new(EbayAdapter));
        registry.register(Arc::new(GenericAdapter));
        registry
    }

    /// Registers an adapter under its own source id, returning the one it replaced.
    pub fn register(&mut self, adapter: Arc<dyn SourceAdapter>) -> Option<Arc<dyn SourceAdapter>> {
        self.adapters.insert(adapter.source_id(), adapter)
    }

    /// Drops adapters whose source is not enabled.
    pub fn retain_enabled(&mut self, enabled: impl Fn(SourceId) -> bool) {
        self.adapters.retain(|source, _| {
            let keep = enabled(*source);
            if !keep {
                info!(source = %source, "source disabled by configuration");
            }
            keep
        });
    }

    pub fn get(&self, source: SourceId) -> Option<Arc<dyn SourceAdapter>> {
        self.adapters.get(&source).cloned()
    }

    pub fn sources(&self) -> Vec<SourceId> {
        self.adapters.keys().copied().collect()
    }

    pub fn len(&self) -> usize {
        self.adapters.len()
    }

    pub fn is_empty(&self) -> bool {
        self.adapters.is_empty()
    }

    fn adapter(&self, source: SourceId) -> Result<Arc<dyn SourceAdapter>, AdapterError> {
        self.get(source).ok_or(AdapterError::UnknownSource(source))
    }

    pub fn build_search_url(&self, source: SourceId, criteria: &Criteria) -> Result<String, AdapterError> {
        self.adapter(source)?.build_search_url(criteria)
    }

    /// Fetches listings, surfacing adapter errors to the caller.
    pub async fn fetch(
        &self,
        source: SourceId,
        http: &HttpFetcher,
        criteria: &Criteria,
    ) -> Result<Vec<Listing>, AdapterError> {
        self.adapter(source)?.fetch_listings(http, criteria).await
    }
}
