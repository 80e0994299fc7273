//! rcx-transfer: resumable, encrypted key-ring chunk transfers
//!
//! ```text
//! LocationService ─► Orchestrator ─► fetcher ─► TransferStore (raw chunks)
//!                        │                │
//!                        │                └─► ChainDecryptor ─► OrderedWriter ─► ByteSink
//!                        └─► ProxyDownloader
//! ```

pub mod collab;
pub mod events;
pub mod fetcher;
pub mod manifest;
pub mod metrics;
pub mod orchestrator;
pub mod store;
pub mod strategy;
pub mod writer;

pub use collab::{
    ChunkLocations, LocationError, LocationService, ProxyDownloader, UploadRequest, UploadTicket,
};
pub use events::TransferEvent;
pub use fetcher::{
    fetch_all, fetch_stream, submit_all, FetchError, FetchEvent, FetchOptions, FetchOrder,
    FetchSummary, ReadAhead, SubmitEvent,
};
pub use manifest::{ChunkManifest, ManifestLocations};
pub use metrics::TransferMetrics;
pub use orchestrator::{
    decrypt_ring, DownloadRequest, Orchestrator, TaskSnapshot, TransferContext,
};
pub use store::{FsStore, MemoryStore, StorageUsage, StoreBackend, TransferStore};
#[cfg(feature = "rocksdb")]
pub use store::RocksStore;
pub use strategy::{select_strategy, Capabilities, SizeCategory};
pub use writer::{
    ByteSink, DirSinkFactory, MemorySink, OrderedWriter, SinkFactory, SinkOutput, WriterError,
    WriterSummary,
};
