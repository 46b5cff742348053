pub mod error;
pub mod render;
