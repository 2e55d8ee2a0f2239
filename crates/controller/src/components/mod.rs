//! Bundled components.

mod job;

pub use job::{JobComponent, JOB_KIND};
