//! Type definitions

pub mod job;
pub mod options;
pub mod progress;
pub mod route;
pub mod schedule;

pub use job::*;
pub use options::*;
pub use progress::*;
pub use route::*;
pub use schedule::*;
