//! Sources of initial peer endpoints.

use async_trait::async_trait;

use crate::error::Result;

/// Provides the endpoints the mesh dials to join.
#[async_trait]
pub trait SeedProvider: Send + Sync {
    /// Current seed endpoints (`host:port`).
    async fn get_seeds(&self) -> Result<Vec<String>>;
}

/// A fixed list of seeds.
#[derive(Debug, Clone, Default)]
pub struct StaticSeedProvider {
    seeds: Vec<String>,
}

impl StaticSeedProvider {
    /// Seeds from a list; blank entries are dropped.
    pub fn new<S: AsRef<str>>(seeds: &[S]) -> Self {
        Self {
            seeds: seeds
                .iter()
                .map(|s| s.as_ref().trim().to_string())
                .filter(|s| !s.is_empty())
                .collect(),
        }
    }
}

#[async_trait]
impl SeedProvider for StaticSeedProvider {
    async fn get_seeds(&self) -> Result<Vec<String>> {
        Ok(self.seeds.clone())
    }
}
