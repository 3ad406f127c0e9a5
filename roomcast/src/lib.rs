pub mod audio;
pub mod config;
pub mod conn;
pub mod encoder;
pub mod engine;
pub mod pipeline;
pub mod proto;
pub mod util;

/// Product name reported in HTTP responses and discovery replies.
pub const PRODUCT: &str = "Roomcast";

/// Build version, process-wide.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
