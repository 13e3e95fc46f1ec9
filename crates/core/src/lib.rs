//! Core crate for the tempora frame-interpolation pipeline.

pub mod align;
pub mod config;
pub mod error;
pub mod io;
pub mod logging;
pub mod model;
pub mod motion;
pub mod pipeline;
pub mod runtime;
pub mod scheduler;
pub mod types;
