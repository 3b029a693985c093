//! Task scheduling for the snippet pool.
//!
//! Admission, priority queueing, worker handles, the two executors, sessions
//! and the pool coordinator that ties them together.

mod executor;
mod handle;
mod pool;
mod pool_executor;
mod priority;
mod queue;
mod sequential;
mod session;
mod task;

pub use executor::{CapacityListener, ExecutorError, ReserveFuture, TaskExecutor};
pub use handle::{HandleError, HandleState, IdleListener, WorkerHandle};
pub use pool::{EvalOptions, Pool, PoolBuilder, PoolStats, TaskHandle};
pub use pool_executor::WorkerPoolExecutor;
pub use priority::Priority;
pub use queue::{QueueError, TaskQueue};
pub use sequential::SequentialExecutor;
pub use session::{Session, SessionEvalOptions};
pub use task::{InternalTask, QueuedTask, Responder, Task};
