//! CAFIO packing pipeline
//!
//! Single-consumer state machine that drains upload requests from the work
//! queue, streams each source object into the in-flight CAF container, and
//! hands finished containers off to the blob service and catalog before
//! acknowledging the batch.
//!
//! ```text
//!             first message
//! Idle ───────────────────────────► Open
//!                                     │
//!  capacity-hit / count-hit / timeout │
//!                                     ▼
//!                                  Finalizing ──► Uploading ──► Indexing ──► Acking ──► Idle
//! ```
//!
//! The append-one-at-a-time invariant is enforced by a single mutex around
//! the in-flight container, independent of the queue prefetch setting.

mod pipeline;

pub use pipeline::{PackingPipeline, PipelineConfig};
