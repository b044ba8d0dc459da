//! CAFIO Adapters - External collaborator interfaces
//!
//! The pipeline and façade talk to four collaborators: the object store the
//! source bytes come from, the remote blob service finished containers ship
//! to, the relational catalog, and the work queue. Each is a capability
//! trait here, so concrete cloud backends stay out of the core.
//!
//! The crate also ships local implementations: filesystem-backed variants
//! that make the worker binary operable end-to-end, a redb-backed catalog,
//! and in-memory doubles for tests.

pub mod blob;
pub mod catalog;
pub mod object_store;
pub mod queue;

pub use blob::{BlobService, FlakyBlobService, FsBlobService};
pub use catalog::{Catalog, CatalogRecord, MemoryCatalog, RedbCatalog, WorkerIdentity};
pub use object_store::{ByteStream, FsObjectStore, MemoryObjectStore, ObjectStore};
pub use queue::{Delivery, DirQueue, MemoryQueue, UploadRequest, WorkQueue};
