//! Observability subsystem.
//!
//! # Data Flow
//! ```text
//! Request enters:
//!     → logging.rs attaches a RequestLogger (span with request ID)
//!     → cache and storage layers log through that logger
//!     → logging.rs SpyBody logs one summary line per response
//!
//! All subsystems produce:
//!     → metrics.rs (counters, histograms)
//! ```
//!
//! # Design Decisions
//! - Structured logging (JSON optional) for machine parsing
//! - Request ID flows through all subsystems via the explicit logger
//! - Metrics are cheap (atomic increments)

pub mod logging;
pub mod metrics;

pub use logging::{init_tracing, logging_middleware, RequestLogger};
