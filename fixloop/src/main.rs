//! Build-test-fix loop CLI.
//!
//! `fixloop run` drives one pipeline run for a repository; `fixloop parse`
//! runs the failure analysis alone over saved test output.

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result, bail};
use clap::{Parser, Subcommand};
use fixloop::core::log_parser::parse_test_log;
use fixloop::core::state::RepoSource;
use fixloop::exit_codes;
use fixloop::io::config::{DEFAULT_CONFIG_FILE, PipelineConfig, load_config, write_config};
use fixloop::io::docker::DockerBackend;
use fixloop::io::fixer::CodexFixProposer;
use fixloop::io::git::GitAcquirer;
use fixloop::io::report::analyze;
use fixloop::logging;
use fixloop::pipeline::{Collaborators, PipelineOutcome, run_pipeline};

#[derive(Parser)]
#[command(
    name = "fixloop",
    version,
    about = "Build, test, diagnose and patch a repository in a bounded loop"
)]
struct Cli {
    /// Increase log verbosity (-v info, -vv debug). `RUST_LOG` overrides.
    #[arg(short, long, global = true, action = clap::ArgAction::Count)]
    verbose: u8,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run the pipeline for a git remote or a local working copy.
    Run {
        /// Remote URL (cloned fresh) or path to an existing working copy.
        source: String,
        /// Config file; defaults apply when it does not exist.
        #[arg(short, long, default_value = DEFAULT_CONFIG_FILE)]
        config: PathBuf,
    },
    /// Parse saved test output and print the failure report as JSON.
    Parse {
        /// Combined stdout/stderr of a test run.
        log: PathBuf,
        /// JUnit XML report; preferred over the log when it parses.
        #[arg(short, long)]
        report: Option<PathBuf>,
    },
    /// Write a config file with default values.
    Init {
        #[arg(short, long, default_value = DEFAULT_CONFIG_FILE)]
        config: PathBuf,
        /// Overwrite an existing file.
        #[arg(short, long)]
        force: bool,
    },
}

fn main() {
    let cli = Cli::parse();
    logging::init(cli.verbose);
    match run(cli.command) {
        Ok(code) => std::process::exit(code),
        Err(err) => {
            eprintln!("{err:#}");
            std::process::exit(exit_codes::INVALID);
        }
    }
}

fn run(command: Command) -> Result<i32> {
    match command {
        Command::Run { source, config } => cmd_run(&source, &config),
        Command::Parse { log, report } => cmd_parse(&log, report.as_deref()),
        Command::Init { config, force } => cmd_init(&config, force),
    }
}

fn cmd_run(source: &str, config_path: &Path) -> Result<i32> {
    if source.trim().is_empty() {
        bail!("repository source must not be empty");
    }
    let config = load_config(config_path)?;
    let acquirer = GitAcquirer {
        repos_dir: config.repos_dir.clone(),
        output_limit_bytes: config.output_limit_bytes,
    };
    let backend = DockerBackend::from_config(&config);
    let proposer = CodexFixProposer::from_config(&config.fixer, config.output_limit_bytes);

    let outcome = run_pipeline(
        RepoSource::parse(source),
        &Collaborators {
            acquirer: &acquirer,
            builder: &backend,
            runner: &backend,
            proposer: &proposer,
        },
        &config,
    )?;
    print!("{}", render_outcome(&outcome));
    Ok(if outcome.succeeded() {
        exit_codes::OK
    } else {
        exit_codes::ABORTED
    })
}

fn cmd_parse(log: &Path, report: Option<&Path>) -> Result<i32> {
    let text = fs::read_to_string(log).with_context(|| format!("read {}", log.display()))?;
    let failure = match report {
        Some(path) => analyze(path, &text),
        None => parse_test_log(&text),
    };
    let mut out = serde_json::to_string_pretty(&failure).context("serialize failure report")?;
    out.push('\n');
    print!("{out}");
    Ok(exit_codes::OK)
}

fn cmd_init(path: &Path, force: bool) -> Result<i32> {
    if path.exists() && !force {
        bail!("{} already exists (use --force to overwrite)", path.display());
    }
    write_config(path, &PipelineConfig::default())?;
    Ok(exit_codes::OK)
}

/// Human-readable end-of-run report.
fn render_outcome(outcome: &PipelineOutcome) -> String {
    let mut buf = String::new();
    match outcome.abort_reason {
        None => buf.push_str("status: success\n"),
        Some(reason) => buf.push_str(&format!("status: aborted ({reason})\n")),
    }
    buf.push_str(&format!("last stage: {}\n", outcome.last_stage));
    if let Some(revision) = &outcome.revision {
        buf.push_str(&format!("revision: {revision}\n"));
    }
    buf.push_str(&format!(
        "patch attempts: {}, build attempts: {}\n",
        outcome.patch_attempt_count, outcome.build_attempts
    ));
    if let Some(error) = &outcome.error {
        buf.push_str(&format!("error: {error}\n"));
    }
    if let Some(tail) = &outcome.build_error_tail {
        buf.push_str("build output (tail):\n");
        for line in tail.lines() {
            buf.push_str(&format!("  {line}\n"));
        }
    }
    if let Some(path) = &outcome.build_log {
        buf.push_str(&format!("build log: {}\n", path.display()));
    }
    if !outcome.error_categories.is_empty() {
        buf.push_str(&format!(
            "error categories: {}\n",
            outcome.error_categories.join(", ")
        ));
    }
    for test in &outcome.failing_tests {
        buf.push_str(&format!("failing: {test}\n"));
    }
    for message in &outcome.error_messages {
        buf.push_str(&format!("  {message}\n"));
    }
    if let Some(path) = &outcome.changelog_path {
        buf.push_str(&format!("change log: {}\n", path.display()));
    }
    buf.push_str(&format!("run dir: {}\n", outcome.run_dir.display()));
    buf
}
