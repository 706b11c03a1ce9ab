/// touca's test runner
///
/// Workflows run one after another, and so do the test cases of a workflow.
/// Results of every executed test case are stored under
/// `{output_directory}/{suite}/{version}/{testcase}`; a later run of the same
/// version skips test cases whose results are already there.
use futures::FutureExt;
use std::{
    future::Future,
    path::{Path, PathBuf},
    pin::Pin,
    sync::Arc,
    time::{Duration, Instant},
};
use tracing::*;

use crate::{
    client::{self, Client, SaveFormat},
    options::{self, Mode, Options, ResolveContext, WorkflowOptions},
    reporter::Reporter,
};

/// A workflow receives the client and the name of the test case to run.
pub type Workflow = Arc<
    dyn Fn(Client, String) -> Pin<Box<dyn Future<Output = eyre::Result<()>> + Send + 'static>>
        + Send
        + Sync
        + 'static,
>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, strum::Display, strum::AsRefStr)]
#[strum(serialize_all = "lowercase")]
pub enum Status {
    /// Submitted to the server.
    Sent,
    Pass,
    Skip,
    /// Submitted and reported different from the baseline.
    Diff,
    Fail,
}

/// Resolved options of the workflow being run.
#[derive(Debug, Clone)]
pub struct WorkflowInfo {
    pub name: String,
    pub suite: String,
    pub version: String,
    pub testcases: Vec<String>,
}

#[derive(Debug, Clone)]
pub struct CaseReport {
    pub testcase: String,
    pub status: Status,
    pub elapsed: Duration,
    pub errors: Vec<String>,
}

#[derive(Debug, Clone)]
pub struct WorkflowSummary {
    pub info: WorkflowInfo,
    pub cases: Vec<CaseReport>,
    /// Errors not attributable to a single test case, such as a failed seal.
    pub errors: Vec<String>,
    pub elapsed: Duration,
    pub output_directory: Option<PathBuf>,
}

impl WorkflowSummary {
    pub fn count(&self, status: Status) -> usize {
        self.cases.iter().filter(|case| case.status == status).count()
    }
}

#[derive(Debug, Clone, Default)]
pub struct RunSummary {
    pub workflows: Vec<WorkflowSummary>,
    pub elapsed: Duration,
}

impl RunSummary {
    pub fn has_failures(&self) -> bool {
        self.workflows
            .iter()
            .any(|w| !w.errors.is_empty() || w.count(Status::Fail) > 0)
    }
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        format!("panicked with message: {message}")
    } else if let Some(message) = payload.downcast_ref::<String>() {
        format!("panicked with message: {message}")
    } else {
        "panicked with unknown message".to_string()
    }
}

fn result_files(options: &Options) -> Vec<(&'static str, SaveFormat)> {
    let mut files = Vec::new();
    if options.save_binary.unwrap_or(true) {
        files.push(("touca.bin", SaveFormat::Binary));
    }
    if options.save_json.unwrap_or(false) {
        files.push(("touca.json", SaveFormat::Json));
    }
    files
}

/// Whether every requested result file of a previous run exists.
fn has_previous_results(directory: &Path, files: &[(&'static str, SaveFormat)]) -> bool {
    !files.is_empty() && files.iter().all(|(name, _)| directory.join(name).exists())
}

pub struct Runner {
    context: Option<ResolveContext>,
    workflows: Vec<(WorkflowOptions, Workflow)>,
    reporters: Vec<Box<dyn Reporter + Send>>,
}

impl Default for Runner {
    fn default() -> Runner {
        Runner::new()
    }
}

impl Runner {
    /// Construct a runner that reads environment variables and profiles of
    /// the current process when it runs.
    pub fn new() -> Runner {
        Runner {
            context: None,
            workflows: Vec::new(),
            reporters: Vec::new(),
        }
    }

    pub fn with_context(context: ResolveContext) -> Runner {
        Runner {
            context: Some(context),
            ..Runner::new()
        }
    }

    pub fn add_reporter(&mut self, reporter: impl Reporter + 'static + Send) {
        self.reporters.push(Box::new(reporter));
    }

    pub fn add_boxed_reporter(&mut self, reporter: Box<dyn Reporter + 'static + Send>) {
        self.reporters.push(reporter);
    }

    /// Register a workflow whose suite, version and test cases come from the
    /// run options.
    pub fn register<F, Fut>(&mut self, name: impl Into<String>, workflow: F)
    where
        F: Fn(Client, String) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = eyre::Result<()>> + Send + 'static,
    {
        self.register_with(WorkflowOptions::new(name), workflow);
    }

    pub fn register_with<F, Fut>(&mut self, options: WorkflowOptions, workflow: F)
    where
        F: Fn(Client, String) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = eyre::Result<()>> + Send + 'static,
    {
        let workflow: Workflow = Arc::new(move |client, testcase| Box::pin(workflow(client, testcase)));
        self.workflows.push((options, workflow));
    }

    /// Registered workflows, in registration order.
    pub fn list(&self) -> Vec<&WorkflowOptions> {
        self.workflows.iter().map(|(options, _)| options).collect()
    }

    /// Run every registered workflow against its test cases.
    ///
    /// Errors are returned only when the options are invalid or a reporter
    /// fails. Failing test cases are recorded in the returned summary.
    pub async fn run(&mut self, cli: &Options) -> eyre::Result<RunSummary> {
        let started = Instant::now();
        let incoming = Options {
            workflows: self.workflows.iter().map(|(w, _)| w.clone()).collect(),
            ..cli.clone()
        };
        let context = self
            .context
            .clone()
            .unwrap_or_else(ResolveContext::from_process);
        let resolved = options::resolve(&incoming, Mode::Runner, &context).await?;
        let options = resolved.options;
        if !options.colored_output.unwrap_or(true) {
            console::set_colors_enabled(false);
        }

        // Environment variables and profiles are already part of the resolved
        // options and must not override the per-workflow suite and version.
        let client = Client::with_context(ResolveContext::default());
        let mut summary = RunSummary::default();
        for workflow in &options.workflows {
            let Some(callback) = self
                .workflows
                .iter()
                .find(|(registered, _)| registered.name == workflow.name)
                .map(|(_, callback)| callback.clone())
            else {
                continue;
            };
            let result = self.run_workflow(&client, &options, workflow, callback).await?;
            summary.workflows.push(result);
        }
        summary.elapsed = started.elapsed();

        for reporter in &mut self.reporters {
            reporter.on_run_end(&summary).await?;
        }
        debug!("runner stopped");
        Ok(summary)
    }

    async fn run_workflow(
        &mut self,
        client: &Client,
        options: &Options,
        workflow: &WorkflowOptions,
        callback: Workflow,
    ) -> eyre::Result<WorkflowSummary> {
        let started = Instant::now();
        let info = WorkflowInfo {
            name: workflow.name.clone(),
            suite: workflow.suite.clone().unwrap_or_else(|| workflow.name.clone()),
            version: workflow.version.clone().unwrap_or_default(),
            testcases: workflow.testcases.clone().unwrap_or_default(),
        };
        client
            .configure(Options {
                api_key: options.api_key.clone(),
                api_url: options.api_url.clone(),
                team: Some(options.team.clone().unwrap_or_else(|| "unknown".into())),
                suite: Some(info.suite.clone()),
                version: Some(info.version.clone()),
                offline: options.offline,
                concurrency: options.concurrency,
                handshake: Some(false),
                submission_mode: options.submission_mode,
                testcases: Some(info.testcases.clone()),
                ..Default::default()
            })
            .await?;

        for reporter in &mut self.reporters {
            reporter.on_workflow_start(&info).await?;
        }

        let files = result_files(options);
        let offline = options.is_offline();
        let overwrite = options.overwrite_results.unwrap_or(false);
        let output_directory = options
            .output_directory
            .as_ref()
            .map(|dir| dir.join(&info.suite).join(&info.version));

        let mut cases = Vec::with_capacity(info.testcases.len());
        for testcase in &info.testcases {
            let directory = output_directory.as_ref().map(|dir| dir.join(testcase));
            let report = match &directory {
                Some(directory) if !overwrite && has_previous_results(directory, &files) => {
                    debug!("skipping {testcase}: results of a previous run exist");
                    CaseReport {
                        testcase: testcase.clone(),
                        status: Status::Skip,
                        elapsed: Duration::ZERO,
                        errors: Vec::new(),
                    }
                }
                _ => {
                    let report = run_case(
                        client,
                        &callback,
                        testcase,
                        directory.as_deref(),
                        &files,
                        offline,
                    )
                    .await;
                    client.forget_testcase(testcase);
                    report
                }
            };
            for reporter in &mut self.reporters {
                reporter.on_case_end(&info, &report).await?;
            }
            cases.push(report);
        }

        let mut errors = Vec::new();
        if !offline {
            if let Err(e) = client.seal().await {
                error!("failed to seal version {} of suite {}: {e}", info.version, info.suite);
                errors.push(format!("failed to seal version: {e}"));
            }
        }

        let summary = WorkflowSummary {
            info,
            cases,
            errors,
            elapsed: started.elapsed(),
            output_directory: if files.is_empty() { None } else { output_directory },
        };
        for reporter in &mut self.reporters {
            reporter.on_workflow_end(&summary).await?;
        }
        Ok(summary)
    }
}

async fn run_case(
    client: &Client,
    callback: &Workflow,
    testcase: &str,
    directory: Option<&Path>,
    files: &[(&'static str, SaveFormat)],
    offline: bool,
) -> CaseReport {
    let started = Instant::now();
    let mut errors = Vec::new();

    if let Some(directory) = directory {
        if directory.exists() {
            if let Err(e) = std::fs::remove_dir_all(directory) {
                warn!("failed to remove stale results in {directory:?}: {e}");
            }
        }
    }

    let task_client = client.clone();
    let callback = callback.clone();
    let name = testcase.to_string();
    let res = client::scoped(
        std::panic::AssertUnwindSafe(async move {
            task_client.declare_testcase(name.clone());
            callback(task_client, name).await
        })
        .catch_unwind(),
    )
    .await;
    match res {
        Ok(Ok(())) => debug!("{testcase} ok"),
        Ok(Err(e)) => {
            debug!("{testcase} failed: {e:#}");
            errors.push(format!("{e:#}"));
        }
        Err(payload) => {
            let message = panic_message(payload.as_ref());
            debug!("{testcase} {message}");
            errors.push(message);
        }
    }

    let status = if !errors.is_empty() {
        Status::Fail
    } else {
        if !client.has_captured(testcase) {
            warn!("test case \"{testcase}\" produced neither results nor metrics");
        }
        match persist(client, testcase, directory, files) {
            Err(e) => {
                errors.push(format!("failed to save results: {e}"));
                Status::Fail
            }
            Ok(()) if offline => Status::Pass,
            Ok(()) => match client.post().await {
                Ok(overview) => match overview.iter().find(|o| o.testcase == testcase) {
                    Some(comparison) if comparison.matched => Status::Pass,
                    Some(_) => Status::Diff,
                    None => Status::Sent,
                },
                Err(e) => {
                    error!("failed to submit {testcase}: {e}");
                    errors.push(e.to_string());
                    Status::Fail
                }
            },
        }
    };

    CaseReport {
        testcase: testcase.to_string(),
        status,
        elapsed: started.elapsed(),
        errors,
    }
}

fn persist(
    client: &Client,
    testcase: &str,
    directory: Option<&Path>,
    files: &[(&'static str, SaveFormat)],
) -> crate::Result<()> {
    let Some(directory) = directory else {
        return Ok(());
    };
    if files.is_empty() {
        return Ok(());
    }
    std::fs::create_dir_all(directory)?;
    let selection = [testcase.to_string()];
    for (name, format) in files {
        client.save(directory.join(name), Some(selection.as_slice()), true, *format)?;
    }
    Ok(())
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::Error;
    use pretty_assertions::assert_eq;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn offline_options(output: &Path) -> Options {
        Options {
            version: Some("v1.0".into()),
            testcases: Some(vec!["alice".into(), "bob".into(), "carol".into()]),
            output_directory: Some(output.to_path_buf()),
            ..Default::default()
        }
    }

    fn statuses(summary: &RunSummary) -> Vec<Status> {
        summary.workflows[0].cases.iter().map(|c| c.status).collect()
    }

    fn counting_runner(calls: Arc<AtomicUsize>) -> Runner {
        let mut runner = Runner::with_context(ResolveContext::default());
        runner.register("students", move |client: Client, testcase: String| {
            let calls = calls.clone();
            async move {
                calls.fetch_add(1, Ordering::SeqCst);
                client.check("name", testcase.as_str())?;
                client.add_metric("load", 3)?;
                eyre::Ok(())
            }
        });
        runner
    }

    #[tokio::test]
    async fn rerun_skips_previous_results() -> eyre::Result<()> {
        let dir = tempfile::tempdir()?;
        let calls = Arc::new(AtomicUsize::new(0));
        let mut runner = counting_runner(calls.clone());
        let options = offline_options(dir.path());

        let first = runner.run(&options).await?;
        assert_eq!(statuses(&first), vec![Status::Pass; 3]);
        assert!(dir.path().join("students/v1.0/alice/touca.bin").exists());
        assert!(!dir.path().join("students/v1.0/alice/touca.json").exists());

        let second = runner.run(&options).await?;
        assert_eq!(statuses(&second), vec![Status::Skip; 3]);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
        assert!(!second.has_failures());
        Ok(())
    }

    #[tokio::test]
    async fn overwrite_runs_again() -> eyre::Result<()> {
        let dir = tempfile::tempdir()?;
        let calls = Arc::new(AtomicUsize::new(0));
        let mut runner = counting_runner(calls.clone());
        let options = offline_options(dir.path());

        runner.run(&options).await?;
        let options = Options {
            overwrite_results: Some(true),
            ..options
        };
        let second = runner.run(&options).await?;
        assert_eq!(statuses(&second), vec![Status::Pass; 3]);
        assert_eq!(calls.load(Ordering::SeqCst), 6);
        Ok(())
    }

    #[tokio::test]
    async fn skip_requires_every_requested_format() -> eyre::Result<()> {
        let dir = tempfile::tempdir()?;
        let calls = Arc::new(AtomicUsize::new(0));
        let mut runner = counting_runner(calls.clone());
        let options = offline_options(dir.path());
        runner.run(&options).await?;

        let options = Options {
            save_json: Some(true),
            ..options
        };
        let second = runner.run(&options).await?;
        assert_eq!(statuses(&second), vec![Status::Pass; 3]);
        let json = std::fs::read_to_string(dir.path().join("students/v1.0/bob/touca.json"))?;
        let documents: serde_json::Value = serde_json::from_str(&json)?;
        assert_eq!(documents[0]["metadata"]["testcase"], "bob");
        assert_eq!(documents[0]["results"][0]["value"], "bob");

        let options = Options {
            save_binary: Some(false),
            save_json: Some(false),
            ..options
        };
        let third = runner.run(&options).await?;
        assert_eq!(statuses(&third), vec![Status::Pass; 3]);
        assert_eq!(calls.load(Ordering::SeqCst), 9);
        Ok(())
    }

    #[tokio::test]
    async fn failing_cases_do_not_abort_the_run() -> eyre::Result<()> {
        let dir = tempfile::tempdir()?;
        let mut runner = Runner::with_context(ResolveContext::default());
        runner.register("students", |client: Client, testcase: String| async move {
            match testcase.as_str() {
                "bob" => eyre::bail!("bob is not enrolled"),
                "carol" => panic!("carol is missing"),
                _ => client.check("enrolled", true)?,
            }
            eyre::Ok(())
        });

        let summary = runner.run(&offline_options(dir.path())).await?;
        assert_eq!(
            statuses(&summary),
            vec![Status::Pass, Status::Fail, Status::Fail]
        );
        let cases = &summary.workflows[0].cases;
        assert_eq!(cases[1].errors, vec!["bob is not enrolled".to_string()]);
        assert!(cases[2].errors[0].contains("carol is missing"));
        assert!(!dir.path().join("students/v1.0/bob").exists());
        assert!(summary.has_failures());
        Ok(())
    }

    #[tokio::test]
    async fn panic_before_first_await_fails_only_its_case() -> eyre::Result<()> {
        let dir = tempfile::tempdir()?;
        let mut runner = Runner::with_context(ResolveContext::default());
        runner.register("students", |client: Client, testcase: String| {
            if testcase == "bob" {
                panic!("bob could not be loaded");
            }
            async move {
                client.check("enrolled", true)?;
                eyre::Ok(())
            }
        });

        let summary = runner.run(&offline_options(dir.path())).await?;
        assert_eq!(
            statuses(&summary),
            vec![Status::Pass, Status::Fail, Status::Pass]
        );
        assert!(summary.workflows[0].cases[1].errors[0].contains("bob could not be loaded"));
        assert!(dir.path().join("students/v1.0/carol/touca.bin").exists());
        Ok(())
    }

    #[tokio::test]
    async fn type_mismatch_fails_the_case() -> eyre::Result<()> {
        let dir = tempfile::tempdir()?;
        let mut runner = Runner::with_context(ResolveContext::default());
        runner.register("students", |client: Client, _testcase: String| async move {
            client.check("courses", 1i64)?;
            client.add_array_element("courses", "math")?;
            eyre::Ok(())
        });

        let summary = runner.run(&offline_options(dir.path())).await?;
        assert_eq!(statuses(&summary), vec![Status::Fail; 3]);
        Ok(())
    }

    #[tokio::test]
    async fn run_without_workflows_fails() -> eyre::Result<()> {
        let dir = tempfile::tempdir()?;
        let mut runner = Runner::with_context(ResolveContext::default());
        let err = runner.run(&offline_options(dir.path())).await.unwrap_err();
        assert!(
            matches!(err.downcast_ref::<Error>(), Some(Error::WorkflowRegistrationMissing)),
            "{err:?}"
        );
        Ok(())
    }

    #[tokio::test]
    async fn filter_selects_one_workflow() -> eyre::Result<()> {
        let dir = tempfile::tempdir()?;
        let mut runner = Runner::with_context(ResolveContext::default());
        runner.register("students", |_: Client, _: String| async { eyre::Ok(()) });
        runner.register("teachers", |_: Client, _: String| async { eyre::Ok(()) });
        assert_eq!(runner.list().len(), 2);

        let options = Options {
            workflow_filter: Some("teachers".into()),
            ..offline_options(dir.path())
        };
        let summary = runner.run(&options).await?;
        assert_eq!(summary.workflows.len(), 1);
        assert_eq!(summary.workflows[0].info.name, "teachers");
        Ok(())
    }

    #[tokio::test]
    async fn submission_reports_comparison() -> eyre::Result<()> {
        let mut server = mockito::Server::new_async().await;
        let verify = server
            .mock("POST", "/client/verify")
            .with_status(204)
            .expect(1)
            .create_async()
            .await;
        server
            .mock("POST", "/client/submit")
            .with_status(200)
            .with_body(r#"[{"testcase": "alice", "matched": false}]"#)
            .create_async()
            .await;
        let seal = server
            .mock("POST", "/batch/acme/students/v1.0/seal2")
            .with_status(204)
            .expect(1)
            .create_async()
            .await;

        let dir = tempfile::tempdir()?;
        let mut runner = Runner::with_context(ResolveContext::default());
        runner.register("students", |client: Client, _: String| async move {
            client.check("gpa", 3.9)?;
            eyre::Ok(())
        });
        let options = Options {
            api_key: Some("key".into()),
            api_url: Some(server.url()),
            team: Some("acme".into()),
            submission_mode: Some(options::SubmissionMode::Sync),
            testcases: Some(vec!["alice".into(), "bob".into()]),
            ..offline_options(dir.path())
        };
        let summary = runner.run(&options).await?;

        verify.assert_async().await;
        seal.assert_async().await;
        assert_eq!(statuses(&summary), vec![Status::Diff, Status::Sent]);
        Ok(())
    }

    #[tokio::test]
    async fn workflow_version_survives_version_variable() -> eyre::Result<()> {
        let dir = tempfile::tempdir()?;
        let mut runner = Runner::with_context(ResolveContext {
            env: [("TOUCA_TEST_VERSION".to_string(), "v1".to_string())].into(),
            home: None,
        });
        runner.register_with(
            WorkflowOptions {
                version: Some("v2".into()),
                ..WorkflowOptions::new("students")
            },
            |client: Client, testcase: String| async move {
                client.check("name", testcase.as_str())?;
                eyre::Ok(())
            },
        );
        let options = Options {
            version: None,
            save_json: Some(true),
            ..offline_options(dir.path())
        };

        let summary = runner.run(&options).await?;
        assert_eq!(summary.workflows[0].info.version, "v2");
        let json = std::fs::read_to_string(dir.path().join("students/v2/alice/touca.json"))?;
        let documents: serde_json::Value = serde_json::from_str(&json)?;
        assert_eq!(documents[0]["metadata"]["version"], "v2");
        Ok(())
    }

    #[tokio::test]
    async fn online_rerun_skips_submitted_cases() -> eyre::Result<()> {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("POST", "/client/verify")
            .with_status(204)
            .create_async()
            .await;
        let submit = server
            .mock("POST", "/client/submit")
            .with_status(204)
            .expect(2)
            .create_async()
            .await;
        server
            .mock("POST", "/batch/acme/students/v1.0/seal2")
            .with_status(204)
            .create_async()
            .await;

        let dir = tempfile::tempdir()?;
        let calls = Arc::new(AtomicUsize::new(0));
        let mut runner = counting_runner(calls.clone());
        let options = Options {
            api_key: Some("key".into()),
            api_url: Some(server.url()),
            team: Some("acme".into()),
            testcases: Some(vec!["alice".into(), "bob".into()]),
            ..offline_options(dir.path())
        };

        let first = runner.run(&options).await?;
        assert_eq!(statuses(&first), vec![Status::Sent; 2]);
        let second = runner.run(&options).await?;
        assert_eq!(statuses(&second), vec![Status::Skip; 2]);

        submit.assert_async().await;
        assert_eq!(calls.load(Ordering::SeqCst), 2);
        Ok(())
    }
}
