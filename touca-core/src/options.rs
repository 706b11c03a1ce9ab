//! # Configuration Resolver
//!
//! Resolves the options of a test run from every source a user may configure
//! them in, and validates the result before anything runs.
//!
//! ## Resolution Pipeline (block diagram)
//!
//! ```text
//! +-------------------+     +-------------------+     +-------------------+
//! | 1. arguments      | --> | 2. config file    | --> | 3. active profile |
//! | (CLI / configure) |     | {"touca": {...}}  |     | ~/.touca/profiles |
//! +-------------------+     +-------------------+     +-------------------+
//!                                                              |
//!          +---------------------------------------------------+
//!          v
//! +-------------------+     +-------------------+     +-------------------+
//! | 4. environment    | --> | 5. api_url slugs  | --> | 6. defaults       |
//! | TOUCA_API_KEY ... |     | https://h/@/t/s/v |     | offline, url, ... |
//! +-------------------+     +-------------------+     +-------------------+
//!                                                              |
//!          +---------------------------------------------------+
//!          v
//! +-------------------+     +-------------------+     +-------------------+
//! | 7. authenticate   | --> | 8. remote options | --> | 9. validate       |
//! | (when online)     |     | (runner only)     |     |                   |
//! +-------------------+     +-------------------+     +-------------------+
//! ```
//!
//! Steps 1 to 6 are pure functions of the incoming options and a
//! [`ResolveContext`] holding the environment and home directory. The config
//! file and the profile only fill options that are still unset, the three
//! environment variables always win, and the slugs embedded in `api_url` only
//! fill what is still missing.
//!
//! ## Config File
//!
//! ```json
//! {
//!   "touca": {
//!     "api_key": "a66fe9d2-00b7-4f7c-95d9-e1b950d0c906",
//!     "api_url": "https://api.touca.io/@/acme/students",
//!     "version": "v1.0",
//!     "save_as_json": true
//!   }
//! }
//! ```

use serde_json::Value;
use std::{
    collections::HashMap,
    path::{Path, PathBuf},
};
use tracing::*;

use crate::{
    transport::{OptionsRequest, Transport},
    ConfigError, Error, Result,
};

/// Server used when an API key is given without an API URL.
pub const DEFAULT_API_URL: &str = "https://api.touca.io";

const ENV_API_KEY: &str = "TOUCA_API_KEY";
const ENV_API_URL: &str = "TOUCA_API_URL";
const ENV_TEST_VERSION: &str = "TOUCA_TEST_VERSION";

/// Which surface the options are resolved for. The runner needs workflows,
/// test cases and output settings that library use does not.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mode {
    Core,
    Runner,
}

#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, strum::EnumString, strum::Display, strum::AsRefStr,
)]
#[strum(serialize_all = "lowercase")]
pub enum SubmissionMode {
    #[default]
    Sync,
    Async,
}

/// Options of one registered workflow.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct WorkflowOptions {
    pub name: String,
    pub suite: Option<String>,
    pub version: Option<String>,
    pub testcases: Option<Vec<String>>,
    pub testcase_file: Option<PathBuf>,
}

impl WorkflowOptions {
    pub fn new(name: impl Into<String>) -> WorkflowOptions {
        WorkflowOptions {
            name: name.into(),
            ..Default::default()
        }
    }
}

/// Every option touca understands. `None` means "not specified by this
/// source".
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Options {
    pub api_key: Option<String>,
    pub api_url: Option<String>,
    pub team: Option<String>,
    pub suite: Option<String>,
    pub version: Option<String>,
    pub offline: Option<bool>,
    pub concurrency: Option<bool>,
    pub handshake: Option<bool>,
    pub submission_mode: Option<SubmissionMode>,
    pub save_binary: Option<bool>,
    pub save_json: Option<bool>,
    pub overwrite_results: Option<bool>,
    pub output_directory: Option<PathBuf>,
    pub testcases: Option<Vec<String>>,
    pub testcase_file: Option<PathBuf>,
    pub workflow_filter: Option<String>,
    pub colored_output: Option<bool>,
    pub log_level: Option<String>,
    pub config_file: Option<PathBuf>,
    pub profile: Option<String>,
    pub workflows: Vec<WorkflowOptions>,
}

macro_rules! combine_fields {
    ($target:expr, $source:expr, $overwrite:expr, $($field:ident),* $(,)?) => {
        $(
            if $source.$field.is_some() && ($overwrite || $target.$field.is_none()) {
                $target.$field = $source.$field.clone();
            }
        )*
    };
}

impl Options {
    /// Take every option specified in `other`, overriding the ones in `self`.
    pub fn merge(mut self, other: &Options) -> Options {
        self.combine(other, true);
        self
    }

    /// Take the options specified in `other` that are not yet set in `self`.
    pub fn fill(mut self, other: &Options) -> Options {
        self.combine(other, false);
        self
    }

    fn combine(&mut self, other: &Options, overwrite: bool) {
        combine_fields!(
            self,
            other,
            overwrite,
            api_key,
            api_url,
            team,
            suite,
            version,
            offline,
            concurrency,
            handshake,
            submission_mode,
            save_binary,
            save_json,
            overwrite_results,
            output_directory,
            testcases,
            testcase_file,
            workflow_filter,
            colored_output,
            log_level,
            config_file,
            profile,
        );
        if !other.workflows.is_empty() && (overwrite || self.workflows.is_empty()) {
            self.workflows = other.workflows.clone();
        }
    }

    /// Set one option from an untyped source such as the config file or a
    /// profile. Booleans and lists may also be given as strings.
    pub fn apply_entry(&mut self, key: &str, value: &Value) -> Result<()> {
        match key {
            "api_key" => self.api_key = Some(as_string(key, value)?),
            "api_url" => self.api_url = Some(as_string(key, value)?),
            "team" => self.team = Some(as_string(key, value)?),
            "suite" => self.suite = Some(as_string(key, value)?),
            "version" | "revision" => self.version = Some(as_string(key, value)?),
            "offline" => self.offline = Some(as_bool(key, value)?),
            "concurrency" => self.concurrency = Some(as_bool(key, value)?),
            "handshake" => self.handshake = Some(as_bool(key, value)?),
            "submission_mode" => {
                let mode = as_string(key, value)?;
                self.submission_mode =
                    Some(mode.parse().map_err(|_| ConfigError::WrongType {
                        key: key.to_string(),
                        expected: "either \"sync\" or \"async\"",
                    })?);
            }
            "save_binary" | "save_as_binary" => self.save_binary = Some(as_bool(key, value)?),
            "save_json" | "save_as_json" => self.save_json = Some(as_bool(key, value)?),
            "overwrite_results" | "overwrite" => {
                self.overwrite_results = Some(as_bool(key, value)?)
            }
            "output_directory" => self.output_directory = Some(as_string(key, value)?.into()),
            "testcases" | "testcase" => self.testcases = Some(as_list(key, value)?),
            "testcase_file" => self.testcase_file = Some(as_string(key, value)?.into()),
            "workflow_filter" | "filter" => self.workflow_filter = Some(as_string(key, value)?),
            "colored_output" => self.colored_output = Some(as_bool(key, value)?),
            "log_level" => self.log_level = Some(as_string(key, value)?),
            "config_file" => self.config_file = Some(as_string(key, value)?.into()),
            "profile" => self.profile = Some(as_string(key, value)?),
            _ => warn!("ignoring unknown option \"{key}\""),
        }
        Ok(())
    }

    pub fn is_offline(&self) -> bool {
        self.offline.unwrap_or(true)
    }
}

fn as_string(key: &str, value: &Value) -> Result<String> {
    match value {
        Value::String(s) => Ok(s.clone()),
        _ => Err(ConfigError::WrongType {
            key: key.to_string(),
            expected: "a string",
        }
        .into()),
    }
}

fn as_bool(key: &str, value: &Value) -> Result<bool> {
    match value {
        Value::Bool(b) => Ok(*b),
        Value::String(s) if s.eq_ignore_ascii_case("true") => Ok(true),
        Value::String(s) if s.eq_ignore_ascii_case("false") => Ok(false),
        _ => Err(ConfigError::WrongType {
            key: key.to_string(),
            expected: "a boolean",
        }
        .into()),
    }
}

fn as_list(key: &str, value: &Value) -> Result<Vec<String>> {
    let wrong_type = || ConfigError::WrongType {
        key: key.to_string(),
        expected: "a list of strings",
    };
    match value {
        Value::String(s) => Ok(s
            .split(',')
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(String::from)
            .collect()),
        Value::Array(items) => items
            .iter()
            .map(|item| item.as_str().map(String::from).ok_or_else(wrong_type))
            .collect::<std::result::Result<_, _>>()
            .map_err(Error::from),
        _ => Err(wrong_type().into()),
    }
}

/// Process state the pipeline reads from.
#[derive(Debug, Clone, Default)]
pub struct ResolveContext {
    pub env: HashMap<String, String>,
    pub home: Option<PathBuf>,
}

impl ResolveContext {
    pub fn from_process() -> ResolveContext {
        ResolveContext {
            env: std::env::vars().collect(),
            home: dirs::home_dir(),
        }
    }

    fn touca_dir(&self) -> Option<PathBuf> {
        self.home.as_ref().map(|home| home.join(".touca"))
    }
}

/// Step 1: options given on the command line or passed to `configure`.
pub fn apply_arguments(options: Options, incoming: &Options) -> Options {
    options.merge(incoming)
}

/// Step 2: options in the file referenced by `config_file`.
pub fn apply_config_file(options: Options) -> Result<Options> {
    let Some(path) = options.config_file.clone() else {
        return Ok(options);
    };
    if !path.is_file() {
        return Err(ConfigError::FileNotFound(path).into());
    }
    let content = std::fs::read_to_string(&path)?;
    let document: Value =
        serde_json::from_str(&content).map_err(|e| ConfigError::Malformed {
            path: path.clone(),
            reason: e.to_string(),
        })?;
    let Some(Value::Object(fields)) = document.get("touca") else {
        return Err(ConfigError::MissingTopLevelKey(path).into());
    };

    let mut from_file = Options::default();
    for (key, value) in fields {
        from_file.apply_entry(key, value)?;
    }
    debug!("loaded options from {path:?}");
    Ok(options.fill(&from_file))
}

/// Step 3: options in the active profile.
pub fn apply_profile(options: Options, ctx: &ResolveContext) -> Result<Options> {
    let Some(dir) = ctx.touca_dir() else {
        return Ok(options);
    };
    let name = match &options.profile {
        Some(name) => name.clone(),
        None => read_ini_settings(&dir.join("config"))?
            .and_then(|settings| settings.get("profile").cloned())
            .unwrap_or_else(|| "default".to_string()),
    };
    let path = dir.join("profiles").join(&name);
    let Some(settings) = read_ini_settings(&path)? else {
        debug!("profile \"{name}\" not found at {path:?}");
        return Ok(options);
    };

    let mut from_profile = Options::default();
    for (key, value) in &settings {
        from_profile.apply_entry(key, &Value::String(value.clone()))?;
    }
    debug!("loaded options from profile \"{name}\"");
    Ok(options.fill(&from_profile))
}

/// Read the `[settings]` section of an ini-style file. Returns `None` when the
/// file does not exist.
fn read_ini_settings(path: &Path) -> Result<Option<HashMap<String, String>>> {
    if !path.is_file() {
        return Ok(None);
    }
    let content = std::fs::read_to_string(path)?;
    let mut settings = HashMap::new();
    let mut in_settings = false;
    for line in content.lines().map(str::trim) {
        if line.is_empty() || line.starts_with('#') || line.starts_with(';') {
            continue;
        }
        if let Some(section) = line.strip_prefix('[').and_then(|l| l.strip_suffix(']')) {
            in_settings = section.trim() == "settings";
            continue;
        }
        if !in_settings {
            continue;
        }
        let Some((key, value)) = line.split_once('=').or_else(|| line.split_once(':')) else {
            return Err(ConfigError::Malformed {
                path: path.to_path_buf(),
                reason: format!("expected \"key = value\", found \"{line}\""),
            }
            .into());
        };
        settings.insert(key.trim().to_string(), value.trim().to_string());
    }
    Ok(Some(settings))
}

/// Step 4: `TOUCA_API_KEY`, `TOUCA_API_URL` and `TOUCA_TEST_VERSION`.
pub fn apply_environment(mut options: Options, ctx: &ResolveContext) -> Options {
    let lookup = |name: &str| ctx.env.get(name).filter(|v| !v.is_empty()).cloned();
    if let Some(api_key) = lookup(ENV_API_KEY) {
        options.api_key = Some(api_key);
    }
    if let Some(api_url) = lookup(ENV_API_URL) {
        options.api_url = Some(api_url);
    }
    if let Some(version) = lookup(ENV_TEST_VERSION) {
        options.version = Some(version);
    }
    options
}

/// Step 5: split `https://host/@/team/suite/version` into its root URL and
/// slugs.
pub fn apply_api_url(mut options: Options) -> Result<Options> {
    let Some(api_url) = options.api_url.take() else {
        return Ok(options);
    };
    let (root, slugs) = match api_url.split_once("/@/") {
        Some((root, slugs)) => (root.to_string(), slugs.to_string()),
        None => (api_url, String::new()),
    };
    let root = root.trim_end_matches('/').to_string();
    url::Url::parse(&root).map_err(|_| ConfigError::WrongType {
        key: "api_url".to_string(),
        expected: "a valid URL",
    })?;

    let mut slugs = slugs.split('/').filter(|s| !s.is_empty()).map(String::from);
    for slot in [&mut options.team, &mut options.suite, &mut options.version] {
        match slugs.next() {
            Some(slug) if slot.is_none() => *slot = Some(slug),
            _ => {}
        }
    }
    options.api_url = Some(root);
    Ok(options)
}

/// Step 6: values derived from what is set so far.
pub fn apply_defaults(mut options: Options, mode: Mode, ctx: &ResolveContext) -> Result<Options> {
    options.concurrency.get_or_insert(true);
    options.handshake.get_or_insert(true);
    options.submission_mode.get_or_insert_with(SubmissionMode::default);
    if options.offline.is_none() {
        options.offline = Some(options.api_key.is_none() && options.api_url.is_none());
    }
    if options.api_key.is_some() && options.api_url.is_none() {
        options.api_url = Some(DEFAULT_API_URL.to_string());
    }
    if mode == Mode::Core {
        return Ok(options);
    }

    options.save_binary.get_or_insert(true);
    options.save_json.get_or_insert(false);
    options.overwrite_results.get_or_insert(false);
    options.colored_output.get_or_insert(true);
    if options.output_directory.is_none() {
        options.output_directory = Some(match ctx.touca_dir() {
            Some(dir) => dir.join("results"),
            None => PathBuf::from(".touca").join("results"),
        });
    }
    if options.testcases.is_none() {
        if let Some(path) = &options.testcase_file {
            options.testcases = Some(read_testcase_file(path)?);
        }
    }

    if let Some(filter) = &options.workflow_filter {
        options.workflows.retain(|workflow| &workflow.name == filter);
    }
    for workflow in &mut options.workflows {
        if workflow.suite.is_none() {
            workflow.suite = Some(
                options
                    .suite
                    .clone()
                    .unwrap_or_else(|| workflow.name.clone()),
            );
        }
        if workflow.version.is_none() {
            workflow.version = options.version.clone();
        }
        if workflow.testcases.is_none() {
            workflow.testcases = match &workflow.testcase_file {
                Some(path) => Some(read_testcase_file(path)?),
                None => options.testcases.clone(),
            };
        }
    }
    Ok(options)
}

/// One test case per line. Blank lines and lines starting with `#` are
/// skipped.
pub fn read_testcase_file(path: &Path) -> Result<Vec<String>> {
    if !path.is_file() {
        return Err(ConfigError::FileNotFound(path.to_path_buf()).into());
    }
    let content = std::fs::read_to_string(path)?;
    Ok(content
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty() && !line.starts_with('#'))
        .map(String::from)
        .collect())
}

/// Steps 1 to 6.
pub fn resolve_local(incoming: &Options, mode: Mode, ctx: &ResolveContext) -> Result<Options> {
    let options = apply_arguments(Options::default(), incoming);
    let options = apply_config_file(options)?;
    let options = apply_profile(options, ctx)?;
    let options = apply_environment(options, ctx);
    let options = apply_api_url(options)?;
    apply_defaults(options, mode, ctx)
}

/// Step 7: establish the transport when the options allow contacting the
/// server.
pub async fn authenticate(
    mut options: Options,
    mode: Mode,
) -> Result<(Options, Option<Transport>)> {
    let (Some(api_key), Some(api_url)) = (&options.api_key, &options.api_url) else {
        return Ok((options, None));
    };
    if options.is_offline() {
        return Ok((options, None));
    }
    let transport = Transport::new(api_url, api_key)?;
    if options.handshake.unwrap_or(true) {
        transport.authenticate().await?;
    }

    if mode == Mode::Core && options.testcases.is_none() {
        if let (Some(team), Some(suite)) = (&options.team, &options.suite) {
            options.testcases = Some(transport.get_testcases(team, suite).await?);
        }
    }
    Ok((options, Some(transport)))
}

/// Step 8: ask the server for the version and test cases of every workflow
/// that did not specify them.
pub async fn fetch_remote_options(
    mut options: Options,
    transport: Option<&Transport>,
) -> Result<Options> {
    let Some(transport) = transport else {
        return Ok(options);
    };
    let Some(team) = options.team.clone() else {
        return Ok(options);
    };
    let pending: Vec<usize> = options
        .workflows
        .iter()
        .enumerate()
        .filter(|(_, w)| {
            w.version.is_none() || w.testcases.as_ref().is_none_or(|tc| tc.is_empty())
        })
        .map(|(index, _)| index)
        .collect();
    if pending.is_empty() {
        return Ok(options);
    }

    let requests: Vec<OptionsRequest> = pending
        .iter()
        .map(|&index| {
            let workflow = &options.workflows[index];
            OptionsRequest {
                team: team.clone(),
                suite: workflow.suite.clone().unwrap_or_else(|| workflow.name.clone()),
                version: workflow.version.clone(),
                testcases: workflow.testcases.clone().filter(|tc| !tc.is_empty()),
            }
        })
        .collect();
    let responses = transport.fetch_options(&requests).await?;
    for (index, response) in pending.into_iter().zip(responses) {
        let workflow = &mut options.workflows[index];
        if workflow.version.is_none() {
            workflow.version = Some(response.version);
        }
        if workflow.testcases.as_ref().is_none_or(|tc| tc.is_empty()) {
            workflow.testcases = Some(response.testcases);
        }
    }
    Ok(options)
}

/// Step 9: reject options that cannot be used.
pub fn validate(options: &Options, mode: Mode) -> Result<()> {
    if mode == Mode::Runner && options.workflows.is_empty() {
        return Err(Error::WorkflowRegistrationMissing);
    }
    if !options.is_offline() {
        if options.api_key.is_none() {
            return Err(ConfigError::MissingOption("api_key").into());
        }
        if options.api_url.is_none() {
            return Err(ConfigError::MissingOption("api_url").into());
        }
    }

    match mode {
        Mode::Core => {
            let slugs = [&options.team, &options.suite, &options.version];
            let present = slugs.iter().filter(|slug| slug.is_some()).count();
            if present != 0 && present != slugs.len() {
                return Err(ConfigError::IncompleteSlugs.into());
            }
        }
        Mode::Runner => {
            if !options.is_offline() && options.team.is_none() {
                return Err(ConfigError::MissingOption("team").into());
            }
            for workflow in &options.workflows {
                if workflow.version.is_none() {
                    return Err(ConfigError::MissingOption("version").into());
                }
                if workflow.testcases.as_ref().is_none_or(|tc| tc.is_empty()) {
                    return Err(ConfigError::NoTestcases(workflow.name.clone()).into());
                }
            }
        }
    }
    Ok(())
}

/// Outcome of the full pipeline.
#[derive(Debug)]
pub struct Resolved {
    pub options: Options,
    pub transport: Option<Transport>,
}

/// Run all nine steps.
pub async fn resolve(incoming: &Options, mode: Mode, ctx: &ResolveContext) -> Result<Resolved> {
    let options = resolve_local(incoming, mode, ctx)?;
    let (options, transport) = authenticate(options, mode).await?;
    let options = match mode {
        Mode::Core => options,
        Mode::Runner => fetch_remote_options(options, transport.as_ref()).await?,
    };
    validate(&options, mode)?;
    debug!(
        "resolved options: team={:?} offline={} workflows={}",
        options.team,
        options.is_offline(),
        options.workflows.len()
    );
    Ok(Resolved { options, transport })
}
