//! # Touca Core
//!
//! Core functionality for the touca regression testing SDK.
//!
//! This crate provides the fundamental building blocks for touca, including:
//! - Typed values and test cases that accumulate captured results
//! - The binary container results are stored and submitted in
//! - Resolution of options from arguments, files, profiles and the environment
//! - The client that workflows capture their results through
//! - The runner that executes workflows and reports their progress
//!
//! ## Architecture (block diagram)
//!
//! ```text
//! +---------------------+      +---------------------+      +---------------------+
//! | arguments, config   | ---> | options (resolver)  | ---> | runner (execution)  |
//! | profiles, env vars  |      | + remote options    |      | skip / save / post  |
//! +---------------------+      +---------------------+      +---------------------+
//!                                        |                     |            |
//!                                        v                     v            v
//! +---------------------+      +---------------------+      +---------------------+
//! | transport (reqwest) | <--- | client              |      | reporter (output)   |
//! | submit / seal       |      | active case per ctx |      | Progress/Null       |
//! +---------------------+      +---------------------+      +---------------------+
//!                                        |
//!                                        v
//!                              +---------------------+
//!                              | case + value model  |
//!                              | json / container    |
//!                              +---------------------+
//! ```
//!
//! Most users should use the main `touca` crate rather than importing `touca-core` directly.

pub mod case;
pub mod client;
pub mod container;
pub mod error;
pub mod options;
pub mod reporter;
pub mod runner;
pub mod transport;
pub mod value;

// Re-export error handling crates
pub use eyre;

// Re-export key functionality
pub use case::{Case, ComparisonRule, Metadata, ResultCategory, ResultEntry};
pub use client::{scoped, Client, SaveFormat, ScopedTimer};
pub use error::{ConfigError, Error, Result};
pub use options::{Options, SubmissionMode, WorkflowOptions};
pub use reporter::{NullReporter, ProgressReporter, Reporter};
pub use runner::{CaseReport, RunSummary, Runner, Status, Workflow, WorkflowInfo, WorkflowSummary};
pub use value::{ToTypedValue, TypeRegistry, TypedValue};
