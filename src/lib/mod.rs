//! # vnstream
//!
//! Command streaming and synchronization for a GPU that lives in another
//! process. The driver side encodes API calls into a byte stream, pushes it
//! through a shared-memory ring to the renderer that owns the real device,
//! and reads synchronous results back from a reply buffer. Fences,
//! semaphores and queue idleness are tracked with sync objects both sides
//! can observe.
//!
//! ## Core Modules
//!
//! - `ring`: SPSC byte ring over shared memory with IDLE/notify handshake.
//! - `cs` / `protocol`: command stream encoding and the wire commands.
//! - `instance`: one connection; submission pipeline, replies, roundtrips.
//! - `device`, `queue`, `fence`, `semaphore`, `sync`: the synchronization
//!   multiplexer that turns queue submissions into remote work plus sync
//!   signals.
//! - `sim`: an in-process renderer used by tests and `stream_bench`.
//! - `workload`: command mixes for benchmarking the pipeline.

pub mod config;
pub mod cs;
pub mod device;
pub mod error;
pub mod fence;
pub mod instance;
pub mod protocol;
pub mod queue;
pub mod renderer;
pub mod ring;
pub mod semaphore;
pub mod shm;
pub mod sim;
pub mod stats;
pub mod sync;
pub mod wait;
pub mod workload;

pub use config::{DebugFlags, StreamConfig, WaitPolicy};
pub use device::{Device, DeviceCreateInfo};
pub use error::{Error, ImportFdError, Result, Status};
pub use fence::Fence;
pub use instance::{Instance, DEFAULT_API_VERSION};
pub use queue::{Queue, SubmitInfo};
pub use renderer::{Renderer, RendererInfo, RendererSync, SyncRef};
pub use semaphore::{Semaphore, SemaphorePoint, SemaphoreType};
pub use sim::{SimConfig, SimRenderer};
pub use stats::StreamStats;
pub use sync::{HandleType, ImportFdInfo};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
