mod consistency;

pub use consistency::{ConsistencyWorker, RecomputeQueue, RecomputeState, RecomputeStatus};
