//! Report writers consuming the `RunSummary` shape: JSON, JUnit XML, and a
//! single-page HTML table, plus the reporter header filter.

use std::collections::HashMap;
use std::fs;
use std::path::Path;

use anyhow::{bail, Result};

use crate::runner::{CaseResult, RunOptions, RunSummary};

/// Applies reporter skip/redaction options to a summary before writing
/// outputs. `authorization` and `proxy-authorization` are always masked when
/// present and not dropped.
pub fn filter_report_headers(summary: &RunSummary, opts: &RunOptions) -> RunSummary {
    filter_headers(
        summary,
        opts.reporter_skip_all_headers,
        &opts.reporter_skip_headers,
    )
}

fn filter_headers(summary: &RunSummary, skip_all: bool, skip_list: &[String]) -> RunSummary {
    let skip_set: Vec<String> = skip_list
        .iter()
        .map(|h| h.trim().to_lowercase())
        .collect();

    let mut out = summary.clone();
    for case in &mut out.cases {
        if skip_all {
            case.request_headers = None;
            case.response_headers = None;
            continue;
        }
        case.request_headers = case
            .request_headers
            .take()
            .map(|h| filter_header_map(h, &skip_set));
        case.response_headers = case
            .response_headers
            .take()
            .map(|h| filter_header_map(h, &skip_set));
    }
    out
}

fn filter_header_map(
    headers: HashMap<String, String>,
    skip_set: &[String],
) -> HashMap<String, String> {
    headers
        .into_iter()
        .filter(|(k, _)| !skip_set.contains(&k.to_lowercase()))
        .map(|(k, v)| {
            let lower = k.to_lowercase();
            if lower == "authorization" || lower == "proxy-authorization" {
                (k, "********".to_string())
            } else {
                (k, v)
            }
        })
        .collect()
}

/// Writes a summary to a JSON file (camelCase fields, nanosecond durations).
pub fn write_report_json(path: &Path, summary: &RunSummary) -> Result<()> {
    let data = serde_json::to_vec_pretty(summary)?;
    fs::write(path, data)?;
    Ok(())
}

/// Minimal JUnit reporter for CI compatibility.
pub fn write_report_junit(path: &Path, summary: &RunSummary) -> Result<()> {
    let mut xml = String::from("<?xml version=\"1.0\" encoding=\"UTF-8\"?>\n");
    xml.push_str(&format!(
        "<testsuite name=\"gru\" tests=\"{}\" failures=\"{}\" skipped=\"{}\" time=\"{:.3}\">\n",
        summary.cases.len(),
        summary.failed,
        summary.skipped,
        summary.total_elapsed.as_secs_f64(),
    ));
    for case in &summary.cases {
        xml.push_str(&format!(
            "  <testcase name=\"{}\" classname=\"{}\" time=\"{:.3}\"",
            xml_escape(&case.name),
            xml_escape(&case.file_path),
            case.duration.as_secs_f64(),
        ));
        if case.skipped {
            xml.push_str(">\n    <skipped/>\n  </testcase>\n");
        } else if !case.passed {
            let msg = if let Some(first) = case.failures.first() {
                if first.message.is_empty() {
                    case.error_text.clone()
                } else {
                    first.message.clone()
                }
            } else {
                case.error_text.clone()
            };
            xml.push_str(&format!(
                ">\n    <failure message=\"{}\" type=\"assertion\">{}</failure>\n  </testcase>\n",
                xml_escape(&msg),
                xml_escape(&msg),
            ));
        } else {
            xml.push_str("/>\n");
        }
    }
    xml.push_str("</testsuite>\n");
    fs::write(path, xml)?;
    Ok(())
}

/// Renders a single-page HTML table summary.
pub fn write_report_html(path: &Path, summary: &RunSummary) -> Result<()> {
    let mut rows = String::new();
    for (idx, case) in summary.cases.iter().enumerate() {
        let status = if case.skipped {
            "<span class=\"status-skip\">skipped</span>"
        } else if case.passed {
            "<span class=\"status-pass\">passed</span>"
        } else {
            "<span class=\"status-fail\">failed</span>"
        };
        let error = if case.error_text.is_empty() {
            String::new()
        } else {
            format!("<span class=\"mono\">{}</span>", html_escape(&case.error_text))
        };
        rows.push_str(&format!(
            "      <tr>\n        <td>{idx}</td>\n        <td>{}</td>\n        <td class=\"mono\">{}</td>\n        <td>{status}</td>\n        <td>{:?}</td>\n        <td>{error}</td>\n      </tr>\n",
            html_escape(&case.name),
            html_escape(&case.file_path),
            case.duration,
        ));
    }
    let html = format!(
        r#"<!doctype html>
<html lang="en">
<head>
  <meta charset="UTF-8" />
  <title>gru report</title>
  <style>
    body {{ font-family: Arial, sans-serif; margin: 16px; background: #fafafa; }}
    h1 {{ margin-bottom: 8px; }}
    .summary {{ margin-bottom: 16px; }}
    table {{ width: 100%; border-collapse: collapse; background: #fff; }}
    th, td {{ padding: 8px 10px; border: 1px solid #e0e0e0; font-size: 14px; }}
    th {{ background: #f5f5f5; text-align: left; }}
    .status-pass {{ color: #2e7d32; font-weight: 600; }}
    .status-fail {{ color: #c62828; font-weight: 600; }}
    .status-skip {{ color: #9e9e9e; font-weight: 600; }}
    .mono {{ font-family: "SFMono-Regular", Consolas, "Liberation Mono", Menlo, monospace; font-size: 12px; }}
  </style>
</head>
<body>
  <h1>gru report</h1>
  <div class="summary">
    <div>Total: {total} &nbsp; Passed: {passed} &nbsp; Failed: {failed} &nbsp; Skipped: {skipped} &nbsp; Time: {elapsed:?}</div>
  </div>
  <table>
    <thead>
      <tr>
        <th>#</th>
        <th>Name</th>
        <th>File</th>
        <th>Status</th>
        <th>Duration</th>
        <th>Error</th>
      </tr>
    </thead>
    <tbody>
{rows}    </tbody>
  </table>
</body>
</html>"#,
        total = summary.total,
        passed = summary.passed,
        failed = summary.failed,
        skipped = summary.skipped,
        elapsed = summary.total_elapsed,
        rows = rows,
    );
    fs::write(path, html)?;
    Ok(())
}

/// Picks the reporter by format name (`json` is the default).
pub fn write_report(format: &str, path: &Path, summary: &RunSummary) -> Result<()> {
    match format.to_lowercase().as_str() {
        "json" | "" => write_report_json(path, summary),
        "junit" => write_report_junit(path, summary),
        "html" => write_report_html(path, summary),
        other => bail!("unknown format {other}"),
    }
}

fn xml_escape(s: &str) -> String {
    s.replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
        .replace('"', "&quot;")
        .replace('\'', "&apos;")
}

fn html_escape(s: &str) -> String {
    s.replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn sample_summary() -> RunSummary {
        let mut req_headers = HashMap::new();
        req_headers.insert("authorization".to_string(), "Bearer secret".to_string());
        req_headers.insert("x-trace".to_string(), "t-1".to_string());
        let mut resp_headers = HashMap::new();
        resp_headers.insert("proxy-authorization".to_string(), "Basic xyz".to_string());
        resp_headers.insert("content-type".to_string(), "application/json".to_string());

        RunSummary {
            cases: vec![
                CaseResult {
                    name: "passing".into(),
                    file_path: "cases/passing.bru".into(),
                    request_url: "http://x/a".into(),
                    request_headers: Some(req_headers),
                    response_headers: Some(resp_headers),
                    status: 200,
                    seq: 1.0,
                    tags: vec!["smoke".into()],
                    duration: Duration::from_millis(12),
                    passed: true,
                    ..CaseResult::default()
                },
                CaseResult {
                    name: "failing".into(),
                    file_path: "cases/failing.bru".into(),
                    status: 500,
                    seq: 2.0,
                    duration: Duration::from_millis(5),
                    passed: false,
                    failures: vec![crate::runner::AssertionFailure {
                        name: "status".into(),
                        message: "expected 500 to equal 200 (status=500, body=\"{}\")".into(),
                    }],
                    ..CaseResult::default()
                },
                CaseResult {
                    name: "skipped".into(),
                    file_path: "cases/skipped.bru".into(),
                    passed: true,
                    skipped: true,
                    ..CaseResult::default()
                },
            ],
            total: 3,
            passed: 1,
            failed: 1,
            skipped: 1,
            total_elapsed: Duration::from_millis(20),
        }
    }

    fn opts(skip_all: bool, skip: &[&str]) -> RunOptions {
        RunOptions {
            reporter_skip_all_headers: skip_all,
            reporter_skip_headers: skip.iter().map(|s| s.to_string()).collect(),
            ..RunOptions::default()
        }
    }

    #[test]
    fn sensitive_headers_are_masked() {
        let filtered = filter_report_headers(&sample_summary(), &opts(false, &[]));
        let req = filtered.cases[0].request_headers.as_ref().unwrap();
        assert_eq!(req.get("authorization").map(String::as_str), Some("********"));
        assert_eq!(req.get("x-trace").map(String::as_str), Some("t-1"));
        let resp = filtered.cases[0].response_headers.as_ref().unwrap();
        assert_eq!(
            resp.get("proxy-authorization").map(String::as_str),
            Some("********")
        );
    }

    #[test]
    fn skip_all_drops_both_header_maps() {
        let filtered = filter_report_headers(&sample_summary(), &opts(true, &[]));
        assert!(filtered.cases[0].request_headers.is_none());
        assert!(filtered.cases[0].response_headers.is_none());
    }

    #[test]
    fn skip_list_is_case_insensitive() {
        let filtered = filter_report_headers(&sample_summary(), &opts(false, &["X-Trace"]));
        let req = filtered.cases[0].request_headers.as_ref().unwrap();
        assert!(!req.contains_key("x-trace"));
        assert_eq!(req.get("authorization").map(String::as_str), Some("********"));
    }

    #[test]
    fn filtering_is_idempotent() {
        let opts = opts(false, &["x-trace"]);
        let once = filter_report_headers(&sample_summary(), &opts);
        let twice = filter_report_headers(&once, &opts);
        let a: serde_json::Value = serde_json::to_value(&once).unwrap();
        let b: serde_json::Value = serde_json::to_value(&twice).unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn json_report_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("report.json");
        let summary = sample_summary();
        write_report_json(&path, &summary).unwrap();

        let raw = fs::read_to_string(&path).unwrap();
        // camelCase fields and nanosecond durations
        assert!(raw.contains("\"filePath\""));
        assert!(raw.contains("\"errorText\""));
        assert!(raw.contains("\"totalElapsed\": 20000000"));

        let decoded: RunSummary = serde_json::from_str(&raw).unwrap();
        assert_eq!(decoded.cases.len(), 3);
        assert_eq!(decoded.cases[0].duration, Duration::from_millis(12));
        let a: serde_json::Value = serde_json::to_value(&decoded).unwrap();
        let b: serde_json::Value = serde_json::to_value(&summary).unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn junit_report_carries_failures_and_skips() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("report.xml");
        write_report_junit(&path, &sample_summary()).unwrap();
        let xml = fs::read_to_string(&path).unwrap();
        assert!(xml.contains("<testsuite name=\"gru\" tests=\"3\" failures=\"1\" skipped=\"1\""));
        assert!(xml.contains("classname=\"cases/failing.bru\""));
        assert!(xml.contains("<failure message=\"expected 500 to equal 200"));
        assert!(xml.contains("<skipped/>"));
    }

    #[test]
    fn html_report_renders_status_classes() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("report.html");
        write_report_html(&path, &sample_summary()).unwrap();
        let html = fs::read_to_string(&path).unwrap();
        assert!(html.contains("status-pass"));
        assert!(html.contains("status-fail"));
        assert!(html.contains("status-skip"));
        assert!(html.contains("cases/passing.bru"));
    }

    #[test]
    fn unknown_format_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let err = write_report("yaml", &dir.path().join("r"), &sample_summary()).unwrap_err();
        assert!(err.to_string().contains("unknown format"));
    }
}
