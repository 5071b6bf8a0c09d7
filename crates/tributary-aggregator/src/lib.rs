//! Stream aggregation across installed scrapers.
//!
//! A query fans out to every eligible scraper in the current store
//! snapshot, per-source outcomes are streamed back as they finish, and the
//! successful results are merged into one deduplicated list. Title
//! metadata is looked up once per key and attached to the final outcome.

pub mod aggregator;
pub mod enrichment;
pub mod error;
pub mod merge;

pub use aggregator::{
    AggregationEvent, AggregationOutcome, AggregationStream, Aggregator, AggregatorConfig,
    SkipReason, SourceOutcome, SourceStatus,
};
pub use enrichment::{
    EnrichmentCache, EnrichmentEntry, EnrichmentFetcher, EnrichmentKey, HttpMetadataFetcher,
    Lookup, Metadata,
};
pub use error::{AggregationError, EnrichmentError};
pub use merge::{merge_results, MergedStream};
