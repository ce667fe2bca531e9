//! # Plinth Core
//!
//! Shared primitives for the Plinth infrastructure crates: the unified error
//! type, the time-source abstraction, the wire codec and the metrics surface.

pub mod clock;
pub mod error;
pub mod metrics;
pub mod serializer;

pub use clock::{Clock, ManualClock, SystemClock};
pub use error::{Error, Result};
pub use metrics::{InMemoryMetricsClient, MetricsClient, NullMetricsClient, TimerSnapshot};
pub use serializer::Serializer;
