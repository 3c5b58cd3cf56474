//! kiln-lib: recipe execution pipeline.
//!
//! This crate turns an already-parsed [`Recipe`](recipe::Recipe) into a
//! verified, installed tool:
//! - `fetch`: download the source with retry and backoff
//! - `verify`: compare the content digest against the recipe
//! - `build`: run the declared build command in an isolated work directory
//! - `install`: stage artifacts and move them into the prefix atomically
//! - `selftest`: run the smoke test against the installed binary
//!
//! [`RecipePipeline`](pipeline::RecipePipeline) drives these stages in strict
//! order and reports a [`PipelineResult`](pipeline::PipelineResult).

pub mod build;
pub mod config;
pub mod consts;
pub mod error;
pub mod extract;
pub mod fetch;
pub mod install;
pub mod install_lock;
pub mod paths;
pub mod pipeline;
pub mod process;
pub mod recipe;
pub mod selftest;
pub mod verify;
pub mod workspace;

pub use config::PipelineConfig;
pub use error::{ErrorKind, PipelineError};
pub use pipeline::{CancelHandle, PipelineResult, RecipePipeline, Stage};
pub use recipe::Recipe;
