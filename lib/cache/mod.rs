/// Per-path cache of listing and attribute results.
pub mod result_cache;

pub use result_cache::{CachedResult, Op, OperationResultCache, ResultReference};
