//! Process-wide tracing setup shared by the uppe binaries.

mod subscriber;

pub use subscriber::{LogConfig, LogFormat, init};
