// Scheduling core: job registry, function table, delay timer and timeout supervisor,
// coordinated by the engine

pub mod engine;
pub mod funcs;
pub mod registry;
pub mod supervisor;
pub mod timer;

pub use engine::{unix_now, unix_now_millis, Sched};
pub use funcs::FunctionTable;
pub use registry::JobRegistry;
pub use supervisor::TimeoutSupervisor;
pub use timer::DelayTimer;
