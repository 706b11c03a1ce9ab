//! # Touca - Regression Testing SDK
//!
//! Touca captures the results of your code under test, test case by test case,
//! and submits them to a server that compares them against a previous version.
//! Instead of writing expected values by hand, you describe *what* to capture
//! and let the server tell you what changed.
//!
//! ## Quick Start
//!
//! You can install `touca` and `tokio` by running the following commands in your terminal:
//! ```bash
//! cargo add touca
//! cargo add tokio --features full
//! ```
//!
//! Register a workflow and hand the runner to the CLI app:
//!
//! ```rust,no_run
//! use touca::{eyre, Client, Runner};
//!
//! async fn students(client: Client, username: String) -> eyre::Result<()> {
//!     let gpa = if username == "alice" { 3.9 } else { 3.1 };
//!     client.check("username", username.as_str())?;
//!     client.check("gpa", gpa)?;
//!     client.add_metric("lookup", 12)?;
//!     Ok(())
//! }
//!
//! #[tokio::main]
//! async fn main() -> eyre::Result<()> {
//!     let mut runner = Runner::new();
//!     runner.register("students", students);
//!     let app = touca::App::new();
//!     app.run(runner).await?;
//!     Ok(())
//! }
//! ```
//!
//! Then run the workflow for a version of your code:
//!
//! ```bash
//! cargo run -- test --offline --revision v1.0 --testcase alice,bob
//! ```
//!
//! Running the same command again skips test cases whose results are already
//! stored in `~/.touca/results`. Pass `--overwrite` to run them again.
//!
//! ## Capturing Without the Runner
//!
//! The [`Client`] can be used on its own, for example from an existing test
//! harness:
//!
//! ```rust,no_run
//! use touca::{Client, Options, SaveFormat};
//!
//! # async fn capture() -> touca::Result<()> {
//! let client = Client::new();
//! client
//!     .configure(Options {
//!         api_key: Some("<key>".into()),
//!         api_url: Some("https://api.touca.io/@/acme/students/v1.0".into()),
//!         ..Default::default()
//!     })
//!     .await?;
//! for testcase in client.get_testcases().await? {
//!     client.declare_testcase(&testcase);
//!     client.check("length", testcase.len())?;
//! }
//! client.save("results.json", None, true, SaveFormat::Json)?;
//! client.post().await?;
//! client.seal().await?;
//! # Ok(())
//! # }
//! ```
//!
//! ## Options
//!
//! Options are resolved from, in order of precedence:
//!
//! - the `TOUCA_API_KEY`, `TOUCA_API_URL` and `TOUCA_TEST_VERSION` environment
//!   variables, which override every other source
//! - command-line arguments, or the options passed to [`Client::configure`]
//! - the JSON file given as `config_file`
//! - the profile in `~/.touca/profiles`
//! - team, suite and version embedded in `api_url`
//!
//! ## Custom Types
//!
//! Anything implementing [`ToTypedValue`] can be captured directly. Other
//! types implementing `serde::Serialize` go through [`Client::transform`],
//! which uses a converter registered with [`Client::add_serializer`] if any.

mod app;

// Re-export error handling crates for user convenience
pub use eyre;

// Re-export main application struct
pub use app::App;

// Re-export core functionality
pub use touca_core::{
    case::{Case, ComparisonRule, Metadata, ResultCategory},
    client::{self, scoped, Client, SaveFormat, ScopedTimer},
    container,
    error::{ConfigError, Error, Result},
    options::{Options, SubmissionMode, WorkflowOptions},
    reporter::{NullReporter, ProgressReporter, Reporter},
    runner::{self, CaseReport, RunSummary, Runner, Status, WorkflowInfo, WorkflowSummary},
    value::{ToTypedValue, TypeRegistry, TypedValue},
};
