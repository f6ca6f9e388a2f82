pub mod layer;

#[cfg(feature = "tracing-basic")]
pub mod tracing;

pub use layer::ObservabilityLayer;

#[cfg(feature = "tracing-basic")]
pub use self::tracing::{init_tracing, init_tracing_with, LogFormat};
