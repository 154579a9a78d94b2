pub mod config;
pub mod core;
pub mod error;
pub mod log;
pub mod orchestration;
pub mod registry;
pub mod runtime;
pub mod shutdown;
pub mod store;
pub mod util;
pub mod workspace;

pub use error::{Error, Result};
pub use runtime::Runtime;
