//! Direct fetch for users configuring an alert. Unlike a scheduled run, errors surface.

use scout_adapters::{AdapterError, AdapterRegistry};
use scout_core::{Criteria, Listing, SourceId};
use scout_storage::HttpFetcher;
use serde::Serialize;
use tracing::info;

use crate::runner::filter_property;

#[derive(Debug, Clone, Serialize)]
pub struct Preview {
    pub source: SourceId,
    pub url: String,
    pub listings: Vec<Listing>,
}

/// The URL that would be monitored, without any I/O.
pub fn preview_url(registry: &AdapterRegistry, source: SourceId, criteria: &Criteria) -> Result<String, AdapterError> {
    registry.build_search_url(source, criteria)
}

/// Fetches and filters exactly as an alert run would, but returns the listings
/// instead of persisting them.
pub async fn preview(
    registry: &AdapterRegistry,
    http: &HttpFetcher,
    source: SourceId,
    criteria: &Criteria,
) -> Result<Preview, AdapterError> {
    let url = preview_url(registry, source, criteria)?;
    let mut listings = registry.fetch(source, http, criteria).await?;
    if let Criteria::Property(property) = criteria {
        listings = filter_property(listings, property);
    }
    info!(source = %source, url = %url, listings = listings.len(), "preview fetched");
    Ok(Preview {
        source,
        url,
        listings,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use scout_core::{ProductCriteria, PropertyCriteria};

    #[test]
    fn preview_url_needs_no_network() {
        let registry = AdapterRegistry::with_defaults(Default::default());
        let criteria = Criteria::Product(ProductCriteria::new(SourceId::Ebay, "mechanical keyboard"));
        let url = preview_url(&registry, SourceId::Ebay, &criteria).expect("url");
        assert!(url.starts_with("https://www.ebay.com/sch/i.html?"));
        assert!(url.contains("_nkw=mechanical+keyboard"));
    }

    #[test]
    fn preview_url_reports_unregistered_source() {
        let registry = AdapterRegistry::empty();
        let criteria = Criteria::Property(PropertyCriteria {
            city: "台北市".into(),
            ..Default::default()
        });
        let err = preview_url(&registry, SourceId::Rent591, &criteria).unwrap_err();
        assert!(matches!(err, AdapterError::UnknownSource(SourceId::Rent591)));
    }
}
