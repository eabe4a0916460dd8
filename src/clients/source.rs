//! File-backed product source (JSON array or JSON Lines)

use async_trait::async_trait;
use std::path::{Path, PathBuf};
use tracing::{info, warn};

use super::{ClientError, ClientResult, ProductSource};
use crate::model::Product;

/// Largest product file accepted (64MB)
const MAX_PRODUCTS_FILE_SIZE: u64 = 64 * 1024 * 1024;

/// Reads products from a JSON file
///
/// The file is either one JSON array of products or one product object per
/// line (`.jsonl`/`.ndjson`). Blank lines are ignored; a malformed line fails
/// the whole load with its line number.
#[derive(Debug, Clone)]
pub struct JsonProductSource {
    path: PathBuf,
}

impl JsonProductSource {
    /// Create a source for the given file
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// Path being read
    pub fn path(&self) -> &Path {
        &self.path
    }
}

/// Parse products from JSON array or JSON Lines text
pub fn parse_products(content: &str) -> ClientResult<Vec<Product>> {
    let trimmed = content.trim_start();
    if trimmed.starts_with('[') {
        return serde_json::from_str(trimmed)
            .map_err(|e| ClientError::malformed(format!("invalid products array: {e}")));
    }

    content
        .lines()
        .enumerate()
        .filter(|(_, line)| !line.trim().is_empty())
        .map(|(idx, line)| {
            serde_json::from_str::<Product>(line)
                .map_err(|e| ClientError::malformed(format!("line {}: {e}", idx + 1)))
        })
        .collect()
}

#[async_trait]
impl ProductSource for JsonProductSource {
    async fn products(&self) -> ClientResult<Vec<Product>> {
        let metadata = tokio::fs::metadata(&self.path).await.map_err(|e| {
            ClientError::other(format!("cannot read {}: {e}", self.path.display()))
        })?;
        if metadata.len() > MAX_PRODUCTS_FILE_SIZE {
            return Err(ClientError::other(format!(
                "products file too large: {} bytes (max: {} bytes)",
                metadata.len(),
                MAX_PRODUCTS_FILE_SIZE
            )));
        }

        let content = tokio::fs::read_to_string(&self.path).await.map_err(|e| {
            ClientError::other(format!("cannot read {}: {e}", self.path.display()))
        })?;
        let products = parse_products(&content)?;
        if products.is_empty() {
            warn!(path = %self.path.display(), "products file contains no products");
        }
        info!(path = %self.path.display(), count = products.len(), "Loaded products");
        Ok(products)
    }
}

/// In-memory source, handy for embedding and tests
#[derive(Debug, Clone, Default)]
pub struct StaticProductSource {
    products: Vec<Product>,
}

impl StaticProductSource {
    /// Wrap a list of products
    pub fn new(products: Vec<Product>) -> Self {
        Self { products }
    }
}

#[async_trait]
impl ProductSource for StaticProductSource {
    async fn products(&self) -> ClientResult<Vec<Product>> {
        Ok(self.products.clone())
    }
}
