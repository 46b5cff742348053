//! Batch LaTeX rendering through a shared, script-driven typesetting surface.

pub mod application;
pub mod cache;
pub mod config;
pub mod infra;
mod util;
