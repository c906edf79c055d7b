//! Core crate for the fluidframe frame-rate up-conversion pipeline.

pub mod cli;
pub mod config;
pub mod engine;
pub mod logging;
pub mod models;
pub mod pipeline;
pub mod tensor;
pub mod types;
pub mod video_input;
pub mod video_output;
pub mod warp;
