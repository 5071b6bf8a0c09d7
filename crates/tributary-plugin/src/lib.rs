//! Tributary plugin system
//!
//! Untrusted scrapers are WASM modules run through Extism (wasmtime), one
//! fresh instance per invocation, with a host-function surface limited to
//! allow-listed HTTP and a few codec helpers. Repositories of scrapers are
//! fetched as JSON manifests, validated, and kept in a persisted store that
//! publishes immutable snapshots.

pub mod descriptor;
pub mod error;
pub mod events;
pub mod fetcher;
pub mod host_functions;
pub mod manager;
pub mod manifest;
pub mod persistence;
pub mod sandbox;
pub mod store;
pub mod stream;

pub use descriptor::{
    canonical_key, canonicalize_url, repository_id_for, CapabilityManifest, ContentKind,
    RepositoryDescriptor, ScraperDescriptor,
};
pub use error::{InvocationError, PluginError};
pub use events::{StoreEvent, StoreUpdate};
pub use fetcher::{HttpManifestFetcher, ManifestFetcher};
pub use host_functions::HostContext;
pub use manager::{ApplyReport, ManagerConfig, RefreshReport, RepositoryManager};
pub use manifest::RepositoryManifest;
pub use persistence::{DescriptorPersistence, JsonFilePersistence, MemoryPersistence, PersistedState};
pub use sandbox::{SandboxConfig, ScraperRuntime, WasmRuntime};
pub use store::{PluginStore, StoreSnapshot};
pub use stream::{AggregationQuery, StreamLocator, StreamResult};
