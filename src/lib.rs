//! Snippet Pool
//!
//! Runs short, untrusted script snippets on a fixed-size pool of isolated
//! workers, falling back to sequential in-process evaluation when parallel
//! workers are unavailable.
//!
//! # Design
//!
//! - **Isolated**: each worker owns one evaluator; nothing is shared between workers
//! - **Bounded**: at most one task per worker, at most `pool_size` workers
//! - **Settled**: every admitted task resolves exactly once, as a value or a [`TaskError`]
//! - **Pluggable**: evaluators and worker transports sit behind traits
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use snippet_pool::{EchoEvaluator, EvalOptions, Pool, PoolConfig};
//!
//! # async fn run() -> Result<(), snippet_pool::PoolError> {
//! let pool = Pool::new(Arc::new(EchoEvaluator::factory()), PoolConfig::default()).await?;
//! let value = pool.eval_code("\"hello\"", EvalOptions::default()).await;
//! assert_eq!(value, Ok(serde_json::json!("hello")));
//! pool.dispose();
//! # Ok(())
//! # }
//! ```

pub mod capabilities;
pub mod config;
pub mod error;
pub mod evaluator;
pub mod protocol;
pub mod scheduler;
pub mod telemetry;
pub mod transport;
pub mod worker;

pub use capabilities::Capabilities;
pub use config::PoolConfig;
pub use error::PoolError;
pub use evaluator::{EchoEvaluator, Evaluator, EvaluatorFactory, Interrupt};
pub use protocol::{InitOptions, SessionId, TaskError, TaskId, TaskResult, Variant, WorkerId};
pub use scheduler::{
    EvalOptions, Pool, PoolBuilder, PoolStats, Priority, Session, SessionEvalOptions, Task,
    TaskHandle,
};
