//! psdforge core
//!
//! Domain types shared by every psdforge crate: jobs and their status machine,
//! conversion requests and results, perceptual-hash index records, the error
//! taxonomy and env-driven configuration.

pub mod config;
pub mod error;
pub mod models;
pub mod utils;
pub mod validation;

pub use config::Config;
pub use error::{AppError, AppResult};
pub use models::*;
