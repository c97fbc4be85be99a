//! Document registry.

mod index;

pub use index::{normalize_path, DocumentRegistry, DocumentUpdate, INDEX_FILE};
