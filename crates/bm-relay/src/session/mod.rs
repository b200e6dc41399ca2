//! Session bookkeeping

mod allocator;
mod reaper;
mod registry;

pub use allocator::PortAllocator;
pub use reaper::run_reaper;
pub use registry::{CloseTarget, ReapStats, SessionEvent, SessionRegistry};
