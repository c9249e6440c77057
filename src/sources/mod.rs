//! Per-product download sources and the registry the workers dispatch through.

use crate::{ProductDescriptor, VersionRecord};
use anyhow::Error;
use async_trait::async_trait;
use std::collections::BTreeMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

mod arch;
mod browsers;
mod debian;
mod github;
mod http;
mod table;
mod ubuntu;

pub use http::{extract_filename, find_checksum, HttpClient};
pub use table::{Download, FixedSource};

#[derive(Debug, thiserror::Error)]
pub enum SourceError {
    #[error("request to {url} failed: {source}")]
    Http {
        url: String,
        #[source]
        source: reqwest::Error,
    },

    #[error("{url} returned {status}")]
    Status {
        url: String,
        status: reqwest::StatusCode,
    },

    #[error("failed to parse {what}: {reason}")]
    Parse { what: &'static str, reason: String },

    #[error("{0}")]
    Unavailable(String),

    #[error("no downloads found")]
    Empty,

    #[error("fetch cancelled")]
    Cancelled,

    #[error("fetch timed out after {0:?}")]
    TimedOut(Duration),
}

/// Operation budget handed to a source for one fetch.
#[derive(Debug, Clone, Default)]
pub struct FetchContext {
    cancel: CancellationToken,
}

impl FetchContext {
    pub fn new(cancel: CancellationToken) -> Self {
        FetchContext { cancel }
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    pub fn check(&self) -> Result<(), SourceError> {
        if self.is_cancelled() {
            return Err(SourceError::Cancelled);
        }
        Ok(())
    }

    /// Runs `fut` unless the context is cancelled first.
    pub async fn run<F, T>(&self, fut: F) -> Result<T, SourceError>
    where
        F: Future<Output = Result<T, SourceError>>,
    {
        tokio::select! {
            _ = self.cancel.cancelled() => Err(SourceError::Cancelled),
            result = fut => result,
        }
    }
}

#[async_trait]
pub trait Source: Send + Sync {
    fn descriptor(&self) -> &ProductDescriptor;

    /// Must return a record for every platform/architecture the source claims.
    async fn fetch(&self, cx: &FetchContext) -> Result<Vec<VersionRecord>, SourceError>;
}

/// Product id to source. Built once at startup, read-only afterwards.
#[derive(Default, Clone)]
pub struct SourceRegistry {
    sources: BTreeMap<&'static str, Arc<dyn Source>>,
}

impl SourceRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Every product this build knows how to fetch.
    pub fn builtin(http: HttpClient) -> Result<Self, Error> {
        let mut registry = SourceRegistry::new();
        registry.register(Arc::new(ubuntu::Ubuntu::new(http.clone())?));
        registry.register(Arc::new(debian::Debian::new(http.clone())?));
        registry.register(Arc::new(arch::ArchLinux::new(http.clone())?));
        registry.register(Arc::new(browsers::Firefox::new(http.clone())));
        registry.register(Arc::new(browsers::Chrome::new(http.clone())));
        registry.register(Arc::new(browsers::VsCode::new(http.clone())));
        for source in github::releases(&http)? {
            registry.register(Arc::new(source));
        }
        for source in table::fixed(&http) {
            registry.register(Arc::new(source));
        }
        Ok(registry)
    }

    /// Later registrations replace earlier ones for the same product.
    pub fn register(&mut self, source: Arc<dyn Source>) {
        self.sources.insert(source.descriptor().id, source);
    }

    pub fn with(mut self, source: Arc<dyn Source>) -> Self {
        self.register(source);
        self
    }

    pub fn get(&self, product_id: &str) -> Option<Arc<dyn Source>> {
        self.sources.get(product_id).cloned()
    }

    pub fn product_ids(&self) -> impl Iterator<Item = &'static str> + '_ {
        self.sources.keys().copied()
    }

    pub fn descriptors(&self) -> impl Iterator<Item = &ProductDescriptor> + '_ {
        self.sources.values().map(|source| source.descriptor())
    }
}
