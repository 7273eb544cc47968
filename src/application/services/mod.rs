pub mod document_cache;

pub use document_cache::{CacheConfig, DocumentCache};
