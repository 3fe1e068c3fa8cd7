use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use log::info;
use serde::{Deserialize, Serialize};

use crate::error::{RegistryError, SourceFetchError, UnknownSourceError};
use crate::utils::build_external_id;

/// Scheduling priority of a source. Decides which sources survive LIGHT and
/// HEAVY throttling on scheduled runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SourcePriority {
    High,
    Normal,
    Low,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SourceDescriptor {
    pub name: String,
    pub max_concurrency: usize,
    pub priority: SourcePriority,
}

impl SourceDescriptor {
    pub fn new(name: impl Into<String>, max_concurrency: usize, priority: SourcePriority) -> Self {
        Self {
            name: name.into(),
            max_concurrency,
            priority,
        }
    }
}

/// Search parameters handed to a source. Empty fields mean "use the source's
/// own configured defaults".
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueryParams {
    #[serde(default)]
    pub queries: Vec<String>,
    #[serde(default)]
    pub max_results: Option<usize>,
}

/// One posting as returned by a provider, before any persistence.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RawListing {
    pub external_id: String,
    pub title: String,
    pub company: Option<String>,
    pub location: Option<String>,
    pub url: Option<String>,
    pub summary: Option<String>,
    pub is_remote: bool,
}

impl RawListing {
    /// Creates a listing whose id is derived from its URL, or its title when
    /// the provider gave no URL.
    pub fn new(title: impl Into<String>, url: Option<String>) -> Self {
        let title = title.into();
        let external_id = build_external_id(url.as_deref().unwrap_or(&title), &title);
        Self {
            external_id,
            title,
            company: None,
            location: None,
            url,
            summary: None,
            is_remote: false,
        }
    }
}

/// Fetch capability every scraper plugin implements.
#[async_trait]
pub trait Source: Send + Sync {
    async fn fetch(&self, query: &QueryParams) -> Result<Vec<RawListing>, SourceFetchError>;
}

pub type SourceRef = Arc<dyn Source>;

struct Entry {
    descriptor: SourceDescriptor,
    source: SourceRef,
}

/// Named scraper plugins in registration order.
///
/// Built once at startup, then shared behind an `Arc`; there is no way to
/// unregister a source.
#[derive(Default)]
pub struct SourceRegistry {
    entries: Vec<Entry>,
    index: HashMap<String, usize>,
}

impl SourceRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(
        &mut self,
        descriptor: SourceDescriptor,
        source: SourceRef,
    ) -> Result<(), RegistryError> {
        if descriptor.max_concurrency == 0 {
            return Err(RegistryError::ZeroConcurrency(descriptor.name));
        }
        if self.index.contains_key(&descriptor.name) {
            return Err(RegistryError::Duplicate(descriptor.name));
        }
        info!(
            "Registered source '{}' (priority {:?}, max concurrency {})",
            descriptor.name, descriptor.priority, descriptor.max_concurrency
        );
        self.index.insert(descriptor.name.clone(), self.entries.len());
        self.entries.push(Entry { descriptor, source });
        Ok(())
    }

    pub fn lookup(&self, name: &str) -> Result<&SourceDescriptor, UnknownSourceError> {
        self.entry(name).map(|e| &e.descriptor)
    }

    pub fn get(&self, name: &str) -> Result<SourceRef, UnknownSourceError> {
        self.entry(name).map(|e| Arc::clone(&e.source))
    }

    pub fn list(&self) -> Vec<SourceDescriptor> {
        self.entries.iter().map(|e| e.descriptor.clone()).collect()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    fn entry(&self, name: &str) -> Result<&Entry, UnknownSourceError> {
        self.index
            .get(name)
            .map(|&i| &self.entries[i])
            .ok_or_else(|| UnknownSourceError::new(name))
    }
}
