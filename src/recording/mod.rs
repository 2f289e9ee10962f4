//! Record mode
//!
//! Intercepted requests are replayed against their real upstream and both
//! legs are kept, in arrival order, as recorded exchanges.

mod engine;

pub use engine::RecordingEngine;
