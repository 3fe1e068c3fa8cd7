use async_trait::async_trait;

use crate::core::registry::{QueryParams, RawListing, Source};
use crate::error::SourceFetchError;

/// Fixed listing set, used when no search provider is configured.
pub struct StaticSource {
    listings: Vec<RawListing>,
}

impl StaticSource {
    pub fn new(listings: Vec<RawListing>) -> Self {
        Self { listings }
    }

    /// A handful of sample postings for local runs.
    pub fn demo() -> Self {
        let sample = [
            ("Rust Backend Engineer", "Acme Remote", "https://jobs.example.com/acme/rust-backend"),
            ("Platform Engineer", "Northwind", "https://jobs.example.com/northwind/platform"),
            ("Data Engineer", "Maple Labs", "https://jobs.example.com/maple/data"),
        ];
        Self::new(
            sample
                .iter()
                .map(|(title, company, url)| {
                    let mut listing = RawListing::new(*title, Some(url.to_string()));
                    listing.company = Some(company.to_string());
                    listing.location = Some("Remote".to_string());
                    listing.is_remote = true;
                    listing
                })
                .collect(),
        )
    }
}

#[async_trait]
impl Source for StaticSource {
    async fn fetch(&self, query: &QueryParams) -> Result<Vec<RawListing>, SourceFetchError> {
        let limit = query.max_results.unwrap_or(self.listings.len());
        Ok(self.listings.iter().take(limit).cloned().collect())
    }
}
