//! CLI front-end: maps `gru run` flags onto run options, initializes the
//! logger, and writes reports.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{bail, Context as _, Result};
use clap::{Args, Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use crate::report;
use crate::runner::{CaseResult, RunOptions, RunSummary, Runner};

#[derive(Parser)]
#[command(name = "gru", version, about = "Execute declarative .bru HTTP test collections")]
pub struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Execute .bru files
    Run(RunArgs),
}

#[derive(Args)]
struct RunArgs {
    /// Folder or file to run (defaults to the current directory)
    target: Option<String>,

    /// Environment .bru file, or a name resolved to environments/<name>.bru
    #[arg(long)]
    env: Option<String>,
    /// Override variable (key=value)
    #[arg(long = "var")]
    vars: Vec<String>,
    /// Override environment variable (alias for --var)
    #[arg(long = "env-var")]
    env_vars: Vec<String>,
    /// Only run cases with these tags
    #[arg(long, value_delimiter = ',')]
    tags: Vec<String>,
    /// Skip cases with these tags
    #[arg(long = "exclude-tags", value_delimiter = ',')]
    exclude_tags: Vec<String>,
    /// Only run cases that define tests or asserts
    #[arg(long = "tests-only")]
    tests_only: bool,
    /// Delay between requests (ms)
    #[arg(long, default_value_t = 0)]
    delay: u64,
    /// Stop after first failure
    #[arg(long)]
    bail: bool,
    /// Recurse into subfolders
    #[arg(short, long)]
    recursive: bool,
    /// Per-request timeout in seconds
    #[arg(long, default_value_t = 15)]
    timeout: u64,
    /// Write summary to file (see --format)
    #[arg(short, long)]
    output: Option<String>,
    /// Output format: json|junit|html
    #[arg(short, long, default_value = "json")]
    format: String,
    /// Write JSON report to path
    #[arg(long = "reporter-json")]
    reporter_json: Option<String>,
    /// Write JUnit XML report to path
    #[arg(long = "reporter-junit")]
    reporter_junit: Option<String>,
    /// Write HTML report to path
    #[arg(long = "reporter-html")]
    reporter_html: Option<String>,
    /// CSV dataset for data-driven iterations
    #[arg(long = "csv-file-path")]
    csv_file_path: Option<String>,
    /// JSON dataset for data-driven iterations
    #[arg(long = "json-file-path")]
    json_file_path: Option<String>,
    /// Execute the collection this many times (default 1)
    #[arg(long = "iteration-count", default_value_t = 0)]
    iteration_count: usize,
    /// Run requests in parallel
    #[arg(long)]
    parallel: bool,
    /// Omit all headers from reporter outputs
    #[arg(long = "reporter-skip-all-headers")]
    reporter_skip_all_headers: bool,
    /// Skip specific headers (case-insensitive) from reporter outputs
    #[arg(long = "reporter-skip-headers", value_delimiter = ',')]
    reporter_skip_headers: Vec<String>,
    /// Executable (with args) to run before each request
    #[arg(long = "run-pre-request")]
    run_pre_request: Option<String>,
    /// Executable (with args) to run after each request
    #[arg(long = "run-post-request")]
    run_post_request: Option<String>,
    /// Log level: trace|debug|info|warn|error
    #[arg(long = "log-level")]
    log_level: Option<String>,
    /// Emit logs as JSON lines
    #[arg(long = "log-json")]
    log_json: bool,
}

impl Cli {
    pub fn run(self) -> Result<()> {
        match self.command {
            Command::Run(args) => run(args),
        }
    }
}

fn init_logging(level: Option<&str>, json: bool) {
    let filter = match level {
        Some(level) => EnvFilter::new(level),
        None => EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
    };
    let builder = tracing_subscriber::fmt().with_env_filter(filter);
    if json {
        let _ = builder.json().try_init();
    } else {
        let _ = builder.try_init();
    }
}

fn run(args: RunArgs) -> Result<()> {
    init_logging(args.log_level.as_deref(), args.log_json);

    if args.csv_file_path.is_some() && args.json_file_path.is_some() {
        bail!("choose either --csv-file-path or --json-file-path");
    }

    let env_path = args
        .env
        .as_deref()
        .map(resolve_env_path)
        .transpose()?;

    let mut vars = HashMap::new();
    for kv in args.vars.iter().chain(args.env_vars.iter()) {
        let Some((key, val)) = kv.split_once('=') else {
            bail!("invalid --var {kv:?} (expected key=value)");
        };
        vars.insert(key.to_string(), val.to_string());
    }

    let opts = RunOptions {
        env_path,
        vars,
        tags: args.tags,
        exclude_tags: args.exclude_tags,
        tests_only: args.tests_only,
        bail: args.bail,
        csv_file_path: args.csv_file_path.clone(),
        json_file_path: args.json_file_path.clone(),
        iteration_count: args.iteration_count,
        parallel: args.parallel,
        delay: Duration::from_millis(args.delay),
        timeout: Some(Duration::from_secs(args.timeout)),
        recursive: Some(args.recursive),
        output_path: args.output.clone(),
        output_format: Some(args.format.clone()),
        reporter_json: args.reporter_json.clone(),
        reporter_junit: args.reporter_junit.clone(),
        reporter_html: args.reporter_html.clone(),
        reporter_skip_all_headers: args.reporter_skip_all_headers,
        reporter_skip_headers: args.reporter_skip_headers,
        pre_hook_cmd: split_cmd(args.run_pre_request.as_deref()),
        post_hook_cmd: split_cmd(args.run_post_request.as_deref()),
    };

    let runner = Runner::new()?.with_timeout(Duration::from_secs(args.timeout));

    let target = args.target.as_deref().unwrap_or(".");
    let info = std::fs::metadata(target).with_context(|| format!("stat {target}"))?;

    let run_as_collection = info.is_dir()
        || opts.csv_file_path.is_some()
        || opts.json_file_path.is_some()
        || opts.iteration_count > 1
        || opts.parallel;

    if run_as_collection {
        let summary = runner.run_folder(Path::new(target), &opts)?;
        write_outputs(&opts, &summary)?;
        print_summary(&summary);
        if summary.failed > 0 {
            bail!("{} case(s) failed", summary.failed);
        }
        return Ok(());
    }

    let res = runner.run_file(Path::new(target), &opts)?;
    print_single(&res);
    let summary = RunSummary {
        total: 1,
        passed: usize::from(res.passed),
        failed: usize::from(!res.passed && !res.skipped),
        skipped: usize::from(res.skipped),
        total_elapsed: res.duration,
        cases: vec![res.clone()],
    };
    write_outputs(&opts, &summary)?;
    if !res.passed {
        bail!("case failed: {}", res.file_path);
    }
    Ok(())
}

/// `--env local` resolves to `environments/local.bru`; anything containing a
/// path separator or `.bru` suffix is used as-is.
fn resolve_env_path(env: &str) -> Result<PathBuf> {
    let path = if !env.contains(std::path::MAIN_SEPARATOR) && !env.ends_with(".bru") {
        Path::new("environments").join(format!("{env}.bru"))
    } else {
        PathBuf::from(env)
    };
    if !path.exists() {
        bail!("env file not found: {}", path.display());
    }
    Ok(path)
}

fn split_cmd(s: Option<&str>) -> Vec<String> {
    s.map(|s| s.split_whitespace().map(str::to_string).collect())
        .unwrap_or_default()
}

fn print_summary(summary: &RunSummary) {
    for case in &summary.cases {
        print_single(case);
    }
    tracing::info!(
        total = summary.total,
        passed = summary.passed,
        failed = summary.failed,
        skipped = summary.skipped,
        elapsed = ?summary.total_elapsed,
        "summary"
    );
}

fn print_single(res: &CaseResult) {
    if res.skipped {
        tracing::info!(name = %res.name, file = %res.file_path, "skip");
        return;
    }
    if res.passed {
        tracing::info!(name = %res.name, file = %res.file_path, dur = ?res.duration, "pass");
        return;
    }
    tracing::error!(
        name = %res.name,
        file = %res.file_path,
        dur = ?res.duration,
        err = %res.error_text,
        "fail"
    );
    for failure in &res.failures {
        tracing::error!(name = %failure.name, msg = %failure.message, "assert");
    }
    for line in &res.console {
        tracing::debug!(msg = %line, "console");
    }
}

fn write_outputs(opts: &RunOptions, summary: &RunSummary) -> Result<()> {
    let filtered = report::filter_report_headers(summary, opts);
    if let Some(path) = &opts.output_path {
        let format = opts.output_format.as_deref().unwrap_or("json");
        report::write_report(format, Path::new(path), &filtered)?;
    }
    if let Some(path) = &opts.reporter_json {
        report::write_report_json(Path::new(path), &filtered)?;
    }
    if let Some(path) = &opts.reporter_junit {
        report::write_report_junit(Path::new(path), &filtered)?;
    }
    if let Some(path) = &opts.reporter_html {
        report::write_report_html(Path::new(path), &filtered)?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hook_commands_split_on_whitespace() {
        assert_eq!(
            split_cmd(Some("notify-send done now")),
            vec!["notify-send", "done", "now"]
        );
        assert!(split_cmd(None).is_empty());
        assert!(split_cmd(Some("  ")).is_empty());
    }

    #[test]
    fn cli_parses_run_flags() {
        let cli = Cli::try_parse_from([
            "gru",
            "run",
            "collection",
            "--tags",
            "smoke,fast",
            "--bail",
            "--parallel",
            "--iteration-count",
            "3",
            "--var",
            "a=1",
        ])
        .unwrap();
        let Command::Run(args) = cli.command;
        assert_eq!(args.target.as_deref(), Some("collection"));
        assert_eq!(args.tags, vec!["smoke", "fast"]);
        assert!(args.bail);
        assert!(args.parallel);
        assert_eq!(args.iteration_count, 3);
        assert_eq!(args.vars, vec!["a=1"]);
    }

    #[test]
    fn env_name_resolution_requires_existing_file() {
        let err = resolve_env_path("no-such-env").unwrap_err();
        assert!(err.to_string().contains("environments"));
    }
}
