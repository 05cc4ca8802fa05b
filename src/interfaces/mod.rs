//! Contracts between the middleware core and its collaborators.
//!
//! Everything the core touches at runtime is polymorphic behind a small
//! capability trait: the broker [`Driver`], the advisory [`Idempotent`]
//! lease, the [`DeadLetterStore`] and [`TxStore`] persistence hooks, and
//! the [`Logger`] error sink. Implementations are interchangeable; the
//! delivery and transaction protocols are defined purely over these
//! contracts.

mod driver;
mod idempotent;
mod logger;
mod storage;

pub use driver::{DeliveryFn, Driver, DriverError};
pub use idempotent::{Idempotent, NullIdempotent};
pub use logger::{Logger, TracingLogger};
pub use storage::{DeadLetterStore, NullDeadLetterStore, StoreError, TxStore};
