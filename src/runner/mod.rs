//! Execution engine: orders cases, expands variables, issues HTTP requests,
//! drives the embedded JS VMs, and aggregates results under iteration,
//! parallelism, tag filtering, bail, delay, and hook semantics.

pub mod expand;
mod hooks;
mod http_client;
mod iteration;
mod js;
mod request;

pub use hooks::{PostRequestHook, PreRequestHook};
pub use http_client::HttpClient;

use std::cell::RefCell;
use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::rc::Rc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{bail, Context as _, Result};
use http::{HeaderMap, Request};
use http_body_util::Full;
use hyper::body::Bytes;
use serde::{Deserialize, Serialize};
use serde_json::Map;

use crate::parser::{self, ParsedCase};

use expand::Expander;

const DEFAULT_TIMEOUT: Duration = Duration::from_secs(15);

/// Controls execution of one or more `.bru` cases.
#[derive(Debug, Clone, Default)]
pub struct RunOptions {
    pub env_path: Option<PathBuf>,
    pub vars: HashMap<String, String>,
    pub tags: Vec<String>,
    pub exclude_tags: Vec<String>,
    /// CSV dataset for data-driven iterations.
    pub csv_file_path: Option<String>,
    /// JSON array dataset for data-driven iterations.
    pub json_file_path: Option<String>,
    /// Number of iterations when no dataset is given (0 behaves as 1).
    pub iteration_count: usize,
    /// Run the cases of each iteration on parallel threads.
    pub parallel: bool,
    /// Per-request timeout; `None` means the runner default (15s).
    pub timeout: Option<Duration>,
    /// Delay between sequential cases.
    pub delay: Duration,
    /// Stop after the first case-level failure.
    pub bail: bool,
    /// Skip cases that define neither tests nor asserts.
    pub tests_only: bool,
    /// Walk subfolders; `None` recurses by default.
    pub recursive: Option<bool>,

    // Reporter/output hints consumed by the CLI layer.
    pub output_path: Option<String>,
    pub output_format: Option<String>,
    pub reporter_json: Option<String>,
    pub reporter_junit: Option<String>,
    pub reporter_html: Option<String>,
    pub reporter_skip_all_headers: bool,
    pub reporter_skip_headers: Vec<String>,

    /// Executable (with args) launched before each request.
    pub pre_hook_cmd: Vec<String>,
    /// Executable (with args) launched after each request.
    pub post_hook_cmd: Vec<String>,
}

/// Request metadata handed to hooks without leaking parser internals.
/// `method` and `url` reflect the possibly script-mutated request.
#[derive(Debug, Clone, Default)]
pub struct HookInfo {
    pub name: String,
    pub file_path: String,
    pub seq: f64,
    pub tags: Vec<String>,
    pub method: String,
    pub url: String,
}

/// Outcome of a single case.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CaseResult {
    pub name: String,
    pub file_path: String,
    pub request_url: String,
    pub request_headers: Option<HashMap<String, String>>,
    pub response_headers: Option<HashMap<String, String>>,
    pub status: u16,
    pub seq: f64,
    pub tags: Vec<String>,
    #[serde(with = "duration_nanos")]
    pub duration: Duration,
    pub passed: bool,
    pub skipped: bool,
    pub failures: Vec<AssertionFailure>,
    pub console: Vec<String>,
    /// Set when execution failed before or outside assertions.
    pub error_text: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct AssertionFailure {
    pub name: String,
    pub message: String,
}

/// Aggregated results of a folder run.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RunSummary {
    pub cases: Vec<CaseResult>,
    pub total: usize,
    pub passed: usize,
    pub failed: usize,
    pub skipped: usize,
    #[serde(with = "duration_nanos")]
    pub total_elapsed: Duration,
}

/// Durations travel as nanosecond integers in reports.
pub(crate) mod duration_nanos {
    use serde::{Deserialize, Deserializer, Serialize, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        (d.as_nanos() as u64).serialize(s)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        Ok(Duration::from_nanos(u64::deserialize(d)?))
    }
}

/// Executes `.bru` files and folders. Safe to share across threads; the
/// embedded JS VMs are created per case and never cross a thread.
pub struct Runner {
    client: HttpClient,
    runtime: Arc<tokio::runtime::Runtime>,
    timeout: Duration,
    pre_hook: Option<PreRequestHook>,
    post_hook: Option<PostRequestHook>,
}

impl Runner {
    pub fn new() -> Result<Self> {
        let runtime = tokio::runtime::Builder::new_multi_thread()
            .enable_all()
            .build()
            .context("tokio runtime")?;
        Ok(Self {
            client: HttpClient::new()?,
            runtime: Arc::new(runtime),
            timeout: DEFAULT_TIMEOUT,
            pre_hook: None,
            post_hook: None,
        })
    }

    /// Replaces the HTTP client (TLS, proxy, and cookie policy live there).
    pub fn with_client(mut self, client: HttpClient) -> Self {
        self.client = client;
        self
    }

    /// Default per-request timeout when neither the case nor the run options
    /// set one.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Registers an in-process hook invoked before each request is sent.
    pub fn with_pre_request_hook(mut self, hook: PreRequestHook) -> Self {
        self.pre_hook = Some(hook);
        self
    }

    /// Registers an in-process hook invoked after each case completes.
    pub fn with_post_request_hook(mut self, hook: PostRequestHook) -> Self {
        self.post_hook = Some(hook);
        self
    }

    /// Executes a single `.bru` file across the iteration plan and returns the
    /// last iteration's result.
    pub fn run_file(&self, path: &Path, opts: &RunOptions) -> Result<CaseResult> {
        let parsed = parser::parse_file(path)?;
        let mut env_vars = load_env_vars(opts)?;
        env_vars.extend(opts.vars.clone());

        let iterations = iteration::build_iterations(opts)?;
        let total_iterations = iterations.len();
        let never_cancel = AtomicBool::new(false);

        let mut last = CaseResult::default();
        for (iter_idx, iter) in iterations.iter().enumerate() {
            let mut iter_vars = env_vars.clone();
            iter_vars.extend(iter.vars.clone());
            let res = self.execute_parsed(
                &parsed,
                opts,
                &mut iter_vars,
                iter_idx,
                total_iterations,
                &iter.data,
                &never_cancel,
            )?;
            let bail_hit = opts.bail && !res.passed && !res.skipped;
            last = res;
            if bail_hit {
                return Ok(last);
            }
            if iter_idx < total_iterations - 1 && !opts.delay.is_zero() {
                std::thread::sleep(opts.delay);
            }
        }
        Ok(last)
    }

    /// Discovers, sorts, and executes all `.bru` files under `path`.
    pub fn run_folder(&self, path: &Path, opts: &RunOptions) -> Result<RunSummary> {
        let start = Instant::now();

        let recursive = opts.recursive.unwrap_or(true);
        let mut files = parser::discover_bru_files(path, recursive)?;
        files.sort_by(|a, b| {
            a.meta
                .seq
                .partial_cmp(&b.meta.seq)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| a.file_path.cmp(&b.file_path))
        });

        let mut env_vars = load_env_vars(opts)?;
        env_vars.extend(opts.vars.clone());

        let iterations = iteration::build_iterations(opts)?;
        let total_iterations = iterations.len();

        // tag filtering happens once, up front: counts reflect executed cases
        let runnable: Vec<&ParsedCase> = files
            .iter()
            .filter(|f| passes_tag_filter(&f.meta.tags, &opts.tags, &opts.exclude_tags))
            .collect();

        let mut summary = RunSummary {
            total: runnable.len() * total_iterations,
            ..RunSummary::default()
        };
        let mut case_count = 0usize;
        let never_cancel = AtomicBool::new(false);

        for (iter_idx, iter) in iterations.iter().enumerate() {
            // each iteration starts from fresh env/caller vars so
            // post-response vars do not leak across iteration boundaries
            let mut iter_vars = env_vars.clone();
            iter_vars.extend(iter.vars.clone());

            if opts.parallel {
                let bail_triggered = self.run_iteration_parallel(
                    &runnable,
                    opts,
                    &iter_vars,
                    iter_idx,
                    total_iterations,
                    &iter.data,
                    &mut summary,
                )?;
                case_count += runnable.len();
                if bail_triggered {
                    summary.total_elapsed = start.elapsed();
                    return Ok(summary);
                }
                continue;
            }

            // sequential mode: var mutations stay visible within the iteration
            for f in &runnable {
                let mut delay = opts.delay;
                if f.meta.delay_ms > 0 {
                    delay += Duration::from_millis(f.meta.delay_ms);
                }
                if !delay.is_zero() && case_count > 0 {
                    std::thread::sleep(delay);
                }

                let res = self.execute_parsed(
                    f,
                    opts,
                    &mut iter_vars,
                    iter_idx,
                    total_iterations,
                    &iter.data,
                    &never_cancel,
                )?;
                let bail_hit = opts.bail && !res.passed && !res.skipped;
                accumulate(&mut summary, res);
                case_count += 1;
                if bail_hit {
                    summary.total_elapsed = start.elapsed();
                    return Ok(summary);
                }
            }
        }

        summary.total_elapsed = start.elapsed();
        Ok(summary)
    }

    /// Launches every runnable case on its own thread. Results land in their
    /// input slot so summary order matches input order regardless of
    /// completion order. Returns whether bail was triggered.
    #[allow(clippy::too_many_arguments)]
    fn run_iteration_parallel(
        &self,
        runnable: &[&ParsedCase],
        opts: &RunOptions,
        iter_vars: &HashMap<String, String>,
        iter_idx: usize,
        total_iterations: usize,
        iter_data: &Map<String, serde_json::Value>,
        summary: &mut RunSummary,
    ) -> Result<bool> {
        let cancel = Arc::new(AtomicBool::new(false));
        let (tx, rx) = crossbeam_channel::unbounded::<(usize, Result<CaseResult>)>();
        let mut slots: Vec<Option<CaseResult>> = vec![None; runnable.len()];
        let mut iter_err: Option<anyhow::Error> = None;

        std::thread::scope(|scope| {
            for (idx, f) in runnable.iter().enumerate() {
                let tx = tx.clone();
                // per-case clone: parallel cases never share var mutations
                let mut case_vars = iter_vars.clone();
                let cancel = Arc::clone(&cancel);
                let file: &ParsedCase = f;
                scope.spawn(move || {
                    let res = self.execute_parsed(
                        file,
                        opts,
                        &mut case_vars,
                        iter_idx,
                        total_iterations,
                        iter_data,
                        &cancel,
                    );
                    let _ = tx.send((idx, res));
                });
            }
            drop(tx);
            for _ in 0..runnable.len() {
                let Ok((idx, res)) = rx.recv() else { break };
                match res {
                    Ok(r) => slots[idx] = Some(r),
                    Err(e) => {
                        if iter_err.is_none() {
                            cancel.store(true, Ordering::Relaxed);
                            iter_err = Some(e);
                        }
                    }
                }
            }
        });

        if let Some(err) = iter_err {
            return Err(err);
        }
        let mut bail_triggered = false;
        for res in slots.into_iter().flatten() {
            if opts.bail && !res.passed && !res.skipped {
                bail_triggered = true;
            }
            accumulate(summary, res);
        }
        Ok(bail_triggered)
    }

    /// Per-case lifecycle: filter, build, hooks, send, scripts, asserts,
    /// hooks, repeat.
    #[allow(clippy::too_many_arguments)]
    fn execute_parsed(
        &self,
        parsed: &ParsedCase,
        opts: &RunOptions,
        vars: &mut HashMap<String, String>,
        iter_idx: usize,
        iter_total: usize,
        iter_data: &Map<String, serde_json::Value>,
        cancel: &AtomicBool,
    ) -> Result<CaseResult> {
        let timeout = if parsed.meta.timeout_ms > 0 {
            Duration::from_millis(parsed.meta.timeout_ms)
        } else {
            opts.timeout.unwrap_or(self.timeout)
        };

        if !passes_tag_filter(&parsed.meta.tags, &opts.tags, &opts.exclude_tags)
            || parsed.meta.skip
            || (opts.tests_only && parsed.tests_raw.is_empty() && parsed.assert.is_empty())
        {
            return Ok(skipped_result(parsed));
        }

        let expander = Rc::new(RefCell::new(Expander::new(vars)));
        expander.borrow_mut().seed(&parsed.vars_pre);

        let prelude = load_prelude(parsed, opts)?;

        let js_env = js::JsEnv {
            expander: expander.clone(),
            iteration_index: iter_idx,
            total_iterations: iter_total,
            iteration_data: Rc::new(RefCell::new(iter_data.clone())),
        };

        let repeat = parsed.meta.repeat.max(1);
        let mut result = CaseResult::default();

        for _ in 0..repeat {
            if parsed.meta.delay_ms > 0 {
                sleep_cancellable(Duration::from_millis(parsed.meta.delay_ms), cancel)?;
            }

            let mut req = match request::build_http_request(parsed, &expander.borrow()) {
                Ok(req) => req,
                Err(err) => return Ok(error_result(parsed, err.to_string())),
            };

            if let Some(hook) = &self.pre_hook {
                hook(&hook_info(parsed, Some(&req)), &mut req)?;
            }
            if !opts.pre_hook_cmd.is_empty() {
                hooks::run_external_hook("pre", &opts.pre_hook_cmd, parsed, None)?;
            }
            if !parsed.scripts.pre_request.trim().is_empty() {
                if let Err(err) =
                    js::run_pre_request_script(&parsed.scripts.pre_request, &mut req, &js_env)
                {
                    return Ok(error_result(parsed, format!("pre script: {err}")));
                }
            }

            let request_url = req.uri().to_string();
            let request_method = req.method().to_string();
            let request_headers = header_map(req.headers());

            if cancel.load(Ordering::Relaxed) {
                bail!("run cancelled");
            }

            let start = Instant::now();
            let dispatched = self
                .runtime
                .block_on(async { tokio::time::timeout(timeout, self.client.request(req)).await });
            let duration = start.elapsed();

            let response = match dispatched {
                Ok(Ok(resp)) => resp,
                Ok(Err(err)) => {
                    return Ok(transport_failure(
                        parsed,
                        &request_url,
                        duration,
                        format!("http request failed: {err}"),
                    ))
                }
                Err(_) => {
                    return Ok(transport_failure(
                        parsed,
                        &request_url,
                        duration,
                        format!("http request failed: timed out after {timeout:?}"),
                    ))
                }
            };

            let (parts, body) = response.into_parts();
            let status = parts.status.as_u16();

            let outcome = js::execute_tests(
                parsed,
                status,
                &parts.headers,
                &body,
                duration,
                &prelude,
                &js_env,
            );
            let (passed, failures, console, error_text) = match outcome {
                Ok(o) => (o.passed, o.failures, o.console, String::new()),
                Err(err) => (false, Vec::new(), Vec::new(), err.to_string()),
            };

            // vars:post-response merge back
            for (k, v) in &parsed.vars_post {
                expander.borrow_mut().set(k, v);
            }

            result = CaseResult {
                name: case_name(parsed),
                file_path: parsed.file_path.clone(),
                request_url: request_url.clone(),
                request_headers: Some(request_headers),
                response_headers: Some(header_map(&parts.headers)),
                status,
                seq: parsed.meta.seq,
                tags: parsed.meta.tags.clone(),
                duration,
                passed,
                skipped: false,
                failures,
                console,
                error_text,
            };

            let info = HookInfo {
                name: case_name(parsed),
                file_path: parsed.file_path.clone(),
                seq: parsed.meta.seq,
                tags: parsed.meta.tags.clone(),
                method: request_method,
                url: request_url,
            };
            if let Some(hook) = &self.post_hook {
                hook(&info, &result)?;
            }
            if !opts.post_hook_cmd.is_empty() {
                hooks::run_external_hook("post", &opts.post_hook_cmd, parsed, Some(&result))?;
            }

            if !result.passed {
                break;
            }
        }

        // publish script-set vars so later cases in a sequential iteration
        // observe them; parallel callers hand in a clone and discard this
        let mutations = expander.borrow().mutations().clone();
        vars.extend(mutations);

        Ok(result)
    }
}

fn load_env_vars(opts: &RunOptions) -> Result<HashMap<String, String>> {
    match &opts.env_path {
        Some(path) => parser::load_env(path).context("load env"),
        None => Ok(HashMap::new()),
    }
}

/// A `settings.script` prelude resolves relative to the env-file directory
/// when one is set, else to the case's directory.
fn load_prelude(parsed: &ParsedCase, opts: &RunOptions) -> Result<String> {
    let script = &parsed.meta.settings.script;
    if script.is_empty() {
        return Ok(String::new());
    }
    let script_path = if Path::new(script).is_absolute() {
        PathBuf::from(script)
    } else if let Some(env_path) = &opts.env_path {
        env_path
            .parent()
            .unwrap_or_else(|| Path::new("."))
            .join(script)
    } else {
        Path::new(&parsed.file_path)
            .parent()
            .unwrap_or_else(|| Path::new("."))
            .join(script)
    };
    fs::read_to_string(&script_path)
        .with_context(|| format!("load prelude {}", script_path.display()))
}

pub(crate) fn passes_tag_filter(tags: &[String], include: &[String], exclude: &[String]) -> bool {
    if !include.is_empty() && !tags.iter().any(|t| include.contains(t)) {
        return false;
    }
    !tags.iter().any(|t| exclude.contains(t))
}

fn accumulate(summary: &mut RunSummary, res: CaseResult) {
    if res.skipped {
        summary.skipped += 1;
    } else if res.passed {
        summary.passed += 1;
    } else {
        summary.failed += 1;
    }
    summary.cases.push(res);
}

fn case_name(parsed: &ParsedCase) -> String {
    if !parsed.meta.name.is_empty() {
        return parsed.meta.name.clone();
    }
    Path::new(&parsed.file_path)
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| parsed.file_path.clone())
}

fn skipped_result(parsed: &ParsedCase) -> CaseResult {
    CaseResult {
        name: case_name(parsed),
        file_path: parsed.file_path.clone(),
        seq: parsed.meta.seq,
        tags: parsed.meta.tags.clone(),
        passed: true,
        skipped: true,
        ..CaseResult::default()
    }
}

fn error_result(parsed: &ParsedCase, error_text: String) -> CaseResult {
    CaseResult {
        name: case_name(parsed),
        file_path: parsed.file_path.clone(),
        request_url: parsed.request.url.clone(),
        seq: parsed.meta.seq,
        tags: parsed.meta.tags.clone(),
        passed: false,
        error_text,
        ..CaseResult::default()
    }
}

fn transport_failure(
    parsed: &ParsedCase,
    request_url: &str,
    duration: Duration,
    error_text: String,
) -> CaseResult {
    CaseResult {
        name: case_name(parsed),
        file_path: parsed.file_path.clone(),
        request_url: request_url.to_string(),
        seq: parsed.meta.seq,
        tags: parsed.meta.tags.clone(),
        duration,
        passed: false,
        error_text,
        ..CaseResult::default()
    }
}

fn hook_info(parsed: &ParsedCase, req: Option<&Request<Full<Bytes>>>) -> HookInfo {
    let mut info = HookInfo {
        name: case_name(parsed),
        file_path: parsed.file_path.clone(),
        seq: parsed.meta.seq,
        tags: parsed.meta.tags.clone(),
        method: parsed.request.verb.to_uppercase(),
        url: parsed.request.url.clone(),
    };
    if let Some(req) = req {
        info.method = req.method().to_string();
        info.url = req.uri().to_string();
    }
    info
}

/// Lowercased header map; repeated header names keep their first value.
fn header_map(headers: &HeaderMap) -> HashMap<String, String> {
    let mut out = HashMap::new();
    for (k, v) in headers {
        out.entry(k.as_str().to_lowercase())
            .or_insert_with(|| v.to_str().unwrap_or_default().to_string());
    }
    out
}

/// Sleeps in short slices so a cancelled run does not sit out a long delay.
fn sleep_cancellable(total: Duration, cancel: &AtomicBool) -> Result<()> {
    let step = Duration::from_millis(50);
    let mut remaining = total;
    while !remaining.is_zero() {
        if cancel.load(Ordering::Relaxed) {
            bail!("run cancelled");
        }
        let chunk = remaining.min(step);
        std::thread::sleep(chunk);
        remaining -= chunk;
    }
    Ok(())
}
