//! Persistent key-value storage for the scheduler.
//!
//! The scheduler and its authentication collaborator only ever need a narrow
//! string-keyed `get`/`put` interface over JSON values. Writers to different
//! keys never conflict; writers to the same key race and the last `put` wins.

mod error;
mod file;
mod memory;
mod traits;

pub use error::KvError;
pub use file::FileKv;
pub use memory::MemoryKv;
pub use traits::{get_json, put_json, KvBackend};
