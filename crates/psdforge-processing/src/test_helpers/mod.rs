//! Test helpers: synthetic PSD containers and images

mod fixtures;

pub use fixtures::*;
