use clap::{value_parser, Arg, ArgAction, ArgMatches, Command as ClapCommand};
use console::{style, Term};
use itertools::Itertools;
use std::{path::PathBuf, str::FromStr};
use tracing::*;
use tracing_subscriber::EnvFilter;

use crate::{Options, ProgressReporter, Reporter, Runner, SubmissionMode};

/// Build the CLI with clap's builder pattern
fn build_cli() -> ClapCommand {
    ClapCommand::new("touca")
        .about("touca CLI runs registered workflows and submits their results for comparison")
        .version(env!("CARGO_PKG_VERSION"))
        .subcommand_required(true)
        .subcommand(
            ClapCommand::new("test")
                .about("Run workflows against their test cases")
                .arg(Arg::new("api-key")
                    .long("api-key")
                    .help("API key issued by the server"))
                .arg(Arg::new("api-url")
                    .long("api-url")
                    .help("URL of the server. May embed team, suite and version as /@/team/suite/version"))
                .arg(Arg::new("team")
                    .long("team")
                    .help("Slug of the team results belong to"))
                .arg(Arg::new("suite")
                    .long("suite")
                    .help("Slug of the suite results belong to. Defaults to the workflow name"))
                .arg(Arg::new("revision")
                    .long("revision")
                    .help("Version of the code under test"))
                .arg(Arg::new("offline")
                    .long("offline")
                    .help("Store results locally without submitting them")
                    .action(ArgAction::SetTrue))
                .arg(Arg::new("testcase")
                    .long("testcase")
                    .alias("testcases")
                    .help("Test cases to run in comma-separated string. e.g. --testcase alice,bob")
                    .value_delimiter(',')
                    .action(ArgAction::Append))
                .arg(Arg::new("testcase-file")
                    .long("testcase-file")
                    .help("File listing one test case per line")
                    .value_parser(value_parser!(PathBuf)))
                .arg(Arg::new("filter")
                    .long("filter")
                    .help("Name of the only workflow to run"))
                .arg(Arg::new("output-directory")
                    .long("output-directory")
                    .help("Directory to store results in. Default is \"~/.touca/results\"")
                    .value_parser(value_parser!(PathBuf)))
                .arg(Arg::new("save-as-binary")
                    .long("save-as-binary")
                    .help("Store results in binary format. Default is true")
                    .value_parser(value_parser!(bool))
                    .num_args(0..=1)
                    .default_missing_value("true"))
                .arg(Arg::new("save-as-json")
                    .long("save-as-json")
                    .help("Store results in json format. Default is false")
                    .value_parser(value_parser!(bool))
                    .num_args(0..=1)
                    .default_missing_value("true"))
                .arg(Arg::new("overwrite")
                    .long("overwrite")
                    .help("Run test cases even if their results already exist")
                    .action(ArgAction::SetTrue))
                .arg(Arg::new("config-file")
                    .long("config-file")
                    .help("JSON file with options under a top-level \"touca\" key")
                    .value_parser(value_parser!(PathBuf)))
                .arg(Arg::new("profile")
                    .long("profile")
                    .help("Name of the profile in ~/.touca/profiles to read options from"))
                .arg(Arg::new("submission-mode")
                    .long("submission-mode")
                    .help("Wait for the comparison of submitted results (sync) or not (async)")
                    .value_parser(["sync", "async"]))
                .arg(Arg::new("no-color")
                    .long("no-color")
                    .help("Do not use colors in the output")
                    .action(ArgAction::SetTrue))
                .arg(Arg::new("log-level")
                    .long("log-level")
                    .help("Level of touca's internal logs. Default is \"warn\" [env: RUST_LOG]")
                    .value_parser(["trace", "debug", "info", "warn", "error"]))
                .arg(Arg::new("color")
                    .long("color")
                    .help("Produce color output. Default is \"auto\" [env: CARGO_TERM_COLOR]")
                    .value_parser(["auto", "always", "never"]))
        )
        .subcommand(
            ClapCommand::new("ls")
                .about("List registered workflows")
        )
}

fn flag(matches: &ArgMatches, id: &str) -> Option<bool> {
    matches.get_flag(id).then_some(true)
}

fn string(matches: &ArgMatches, id: &str) -> Option<String> {
    matches.get_one::<String>(id).cloned()
}

/// Map the arguments of the `test` subcommand to options. Arguments that were
/// not given stay unset so that lower precedence sources can fill them.
fn options_from_matches(matches: &ArgMatches) -> eyre::Result<Options> {
    let submission_mode = string(matches, "submission-mode")
        .map(|mode| SubmissionMode::from_str(&mode))
        .transpose()
        .map_err(|e| eyre::eyre!("invalid submission mode: {e}"))?;
    Ok(Options {
        api_key: string(matches, "api-key"),
        api_url: string(matches, "api-url"),
        team: string(matches, "team"),
        suite: string(matches, "suite"),
        version: string(matches, "revision"),
        offline: flag(matches, "offline"),
        submission_mode,
        save_binary: matches.get_one::<bool>("save-as-binary").copied(),
        save_json: matches.get_one::<bool>("save-as-json").copied(),
        overwrite_results: flag(matches, "overwrite"),
        output_directory: matches.get_one::<PathBuf>("output-directory").cloned(),
        testcases: matches
            .get_many::<String>("testcase")
            .map(|vals| vals.cloned().collect()),
        testcase_file: matches.get_one::<PathBuf>("testcase-file").cloned(),
        workflow_filter: string(matches, "filter"),
        colored_output: matches.get_flag("no-color").then_some(false),
        log_level: string(matches, "log-level"),
        config_file: matches.get_one::<PathBuf>("config-file").cloned(),
        profile: string(matches, "profile"),
        ..Default::default()
    })
}

fn install_subscriber(log_level: Option<&str>) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(log_level.unwrap_or("warn")));
    if let Err(e) = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .try_init()
    {
        debug!("tracing subscriber is already installed: {e}");
    }
}

/// touca CLI.
#[derive(Default)]
pub struct App {
    reporters: Vec<Box<dyn Reporter + 'static + Send>>,
}

impl App {
    pub fn new() -> App {
        App {
            reporters: Vec::new(),
        }
    }

    /// Install a reporter in addition to the progress output.
    pub fn install_reporter(&mut self, reporter: impl Reporter + 'static + Send) {
        self.reporters.push(Box::new(reporter));
    }

    /// Parse command-line args and run touca CLI sub command.
    pub async fn run(self, mut runner: Runner) -> eyre::Result<()> {
        let matches = build_cli().get_matches();
        color_eyre::install()?;
        dotenv::dotenv().ok();

        let term = Term::stdout();

        match matches.subcommand() {
            Some(("test", test_matches)) => {
                let options = options_from_matches(test_matches)?;
                install_subscriber(options.log_level.as_deref());

                let color_command = test_matches
                    .get_one::<String>("color")
                    .and_then(|s| Color::from_str(s).ok());
                let color_env = std::env::var("CARGO_TERM_COLOR");
                let color = match (color_command, color_env) {
                    (color @ Some(Color::Always), _) => color,
                    (color @ Some(Color::Never), _) => color,
                    (None, Ok(color)) => Color::from_str(&color).ok(),
                    _ => None,
                };
                match color {
                    Some(Color::Always) => {
                        console::set_colors_enabled(true);
                        console::set_colors_enabled_stderr(true);
                    }
                    Some(Color::Never) => {
                        console::set_colors_enabled(false);
                        console::set_colors_enabled_stderr(false);
                    }
                    _ => {}
                }

                runner.add_reporter(ProgressReporter::new());
                for reporter in self.reporters {
                    runner.add_boxed_reporter(reporter);
                }

                let summary = runner.run(&options).await?;
                if summary.has_failures() {
                    debug!("one or more test cases failed");
                }
                Ok(())
            }
            Some(("ls", _)) => {
                let list = runner.list();
                if list.is_empty() {
                    term.write_line("no workflows registered")?;
                }
                for workflow in list {
                    let details = [
                        workflow.suite.as_ref().map(|suite| format!("suite: {suite}")),
                        workflow.version.as_ref().map(|version| format!("version: {version}")),
                        workflow
                            .testcases
                            .as_ref()
                            .map(|testcases| format!("{} test cases", testcases.len())),
                    ]
                    .into_iter()
                    .flatten()
                    .join(", ");
                    if details.is_empty() {
                        term.write_line(&format!("* {}", workflow.name))?;
                    } else {
                        term.write_line(&format!(
                            "* {} {}",
                            workflow.name,
                            style(format!("({details})")).dim()
                        ))?;
                    }
                }
                Ok(())
            }
            _ => unreachable!("Subcommand required is set to true"),
        }
    }
}

#[derive(Debug, Clone, Default, strum::EnumString)]
#[strum(serialize_all = "lowercase")]
pub enum Color {
    #[default]
    Auto,
    Always,
    Never,
}
