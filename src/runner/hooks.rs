//! Hook dispatch: in-process callbacks registered on the runner and external
//! subprocess hooks configured per run. Either kind returning an error aborts
//! the whole run.

use std::io::{BufRead, BufReader};
use std::process::{Command, Stdio};
use std::sync::Arc;

use anyhow::{bail, Context as _, Result};
use http::Request;
use http_body_util::Full;
use hyper::body::Bytes;

use crate::parser::ParsedCase;

use super::{CaseResult, HookInfo};

/// Invoked after the HTTP request has been built, before the pre-request
/// script runs. May mutate the request; an error aborts the run.
pub type PreRequestHook =
    Arc<dyn Fn(&HookInfo, &mut Request<Full<Bytes>>) -> Result<()> + Send + Sync>;

/// Invoked after assertions with the assembled result; an error aborts the run.
pub type PostRequestHook = Arc<dyn Fn(&HookInfo, &CaseResult) -> Result<()> + Send + Sync>;

/// Launches an external hook process with the `GRU_*` environment injected,
/// streaming its stdout/stderr lines to the logger and mirroring them to the
/// process stdout. Non-zero exit aborts the run.
pub(crate) fn run_external_hook(
    phase: &str,
    cmd: &[String],
    parsed: &ParsedCase,
    res: Option<&CaseResult>,
) -> Result<()> {
    if cmd.is_empty() {
        return Ok(());
    }

    let mut command = Command::new(&cmd[0]);
    command
        .args(&cmd[1..])
        .envs(hook_env(phase, parsed, res))
        .stdout(Stdio::piped())
        .stderr(Stdio::piped());

    let mut child = command
        .spawn()
        .with_context(|| format!("{phase}-hook start"))?;

    let mut readers = Vec::new();
    if let Some(stdout) = child.stdout.take() {
        readers.push(spawn_stream_reader(phase, &cmd[0], "stdout", stdout));
    }
    if let Some(stderr) = child.stderr.take() {
        readers.push(spawn_stream_reader(phase, &cmd[0], "stderr", stderr));
    }

    let status = child.wait().with_context(|| format!("{phase}-hook wait"))?;
    for reader in readers {
        let _ = reader.join();
    }
    if !status.success() {
        bail!("{phase}-hook failed: {status}");
    }
    Ok(())
}

fn spawn_stream_reader<R: std::io::Read + Send + 'static>(
    phase: &str,
    cmd: &str,
    stream: &'static str,
    source: R,
) -> std::thread::JoinHandle<()> {
    let phase = phase.to_string();
    let cmd = cmd.to_string();
    std::thread::spawn(move || {
        let reader = BufReader::new(source);
        for line in reader.lines() {
            let Ok(line) = line else { break };
            tracing::info!(phase = %phase, cmd = %cmd, stream = %stream, line = %line, "hook");
            println!("{line}");
        }
    })
}

fn hook_env(phase: &str, parsed: &ParsedCase, res: Option<&CaseResult>) -> Vec<(String, String)> {
    let mut vals = vec![
        ("GRU_HOOK_PHASE".to_string(), phase.to_string()),
        ("GRU_FILE".to_string(), parsed.file_path.clone()),
        ("GRU_NAME".to_string(), parsed.meta.name.clone()),
        ("GRU_SEQ".to_string(), format!("{}", parsed.meta.seq)),
        ("GRU_METHOD".to_string(), parsed.request.verb.to_uppercase()),
        ("GRU_URL".to_string(), parsed.request.url.clone()),
        ("GRU_TAGS".to_string(), parsed.meta.tags.join(",")),
    ];
    if let Some(res) = res {
        vals.push(("GRU_STATUS".to_string(), res.status.to_string()));
        vals.push(("GRU_PASSED".to_string(), res.passed.to_string()));
        vals.push((
            "GRU_FAILED_COUNT".to_string(),
            res.failures.len().to_string(),
        ));
        vals.push((
            "GRU_DURATION_MS".to_string(),
            res.duration.as_millis().to_string(),
        ));
    }
    vals
}
