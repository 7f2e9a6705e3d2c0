//! cogtask: a cognitive task manager.
//!
//! Tracks many interruptible tasks across sessions, decides which one
//! deserves attention now, keeps a bounded set of them hot in a working
//! memory pool, and checkpoints its state so a crash or context reset loses
//! nothing.

pub mod checkpoint;
pub mod config;
pub mod consolidation;
pub mod controller;
pub mod error;
pub mod pool;
pub mod queue;
pub mod registry;
pub mod scorer;
pub mod session;
pub mod store;
pub mod task;

pub use checkpoint::{Checkpoint, CheckpointReason, CheckpointStore, CheckpointSummary, FileCheckpointStore};
pub use config::Config;
pub use consolidation::{ConsolidationReport, Consolidator, DecisionSink, IndexTrigger, SummarySink};
pub use controller::{Clock, Completion, ControllerSettings, LifecycleController, SpawnRequest};
pub use error::{Error, ErrorKind, Result};
pub use pool::{Admission, PoolEntry, WorkingMemoryPool};
pub use queue::{PriorityQueue, RankedTask};
pub use registry::TaskRegistry;
pub use session::{Briefing, SessionEnd};
pub use store::{ControllerState, FileTaskStore, MemoryTaskStore, TaskStore};
pub use task::{Task, TaskId, TaskStatus};
