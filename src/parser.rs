//! Parser for the `.bru` case format: block-structured, whitespace-tolerant,
//! `//` comments. A file without a request block is an environment file and
//! surfaces as [`ParseError::MissingRequest`] so discovery can skip it.

use std::collections::HashMap;
use std::fs;
use std::path::Path;
use std::sync::OnceLock;

use regex::Regex;
use thiserror::Error;
use walkdir::WalkDir;

/// Matches `{{var}}` placeholders inside URLs, headers, and bodies.
pub fn var_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| Regex::new(r"\{\{([^}]+)\}\}").unwrap())
}

#[derive(Debug, Error)]
pub enum ParseError {
    #[error("missing request block")]
    MissingRequest,
    #[error("{section}: {message}")]
    Block { section: String, message: String },
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error(transparent)]
    Walk(#[from] walkdir::Error),
}

impl ParseError {
    fn block(section: &str, message: impl Into<String>) -> Self {
        ParseError::Block {
            section: section.to_string(),
            message: message.into(),
        }
    }
}

/// A parsed `.bru` case. Immutable during execution.
#[derive(Debug, Clone, Default)]
pub struct ParsedCase {
    pub file_path: String,
    pub meta: MetaBlock,
    pub request: RequestBlock,
    pub tests_raw: String,
    pub docs: String,
    pub assert: Vec<AssertRule>,
    pub scripts: ScriptBlock,
    pub vars_pre: HashMap<String, String>,
    pub vars_post: HashMap<String, String>,
}

#[derive(Debug, Clone, Default)]
pub struct MetaBlock {
    pub name: String,
    pub kind: String,
    pub seq: f64,
    pub tags: Vec<String>,
    pub description: String,
    pub skip: bool,
    pub delay_ms: u64,
    pub repeat: u32,
    pub timeout_ms: u64,
    pub settings: MetaSettings,
}

#[derive(Debug, Clone, Default)]
pub struct MetaSettings {
    pub script: String,
}

#[derive(Debug, Clone, Default)]
pub struct RequestBlock {
    pub verb: String,
    pub url: String,
    pub headers: HashMap<String, String>,
    pub body: BodyBlock,
    pub query: HashMap<String, String>,
    pub path_params: HashMap<String, String>,
    pub graphql_vars: HashMap<String, String>,
}

/// Body section. `kind` is the parsed tag (empty defaults to json at build
/// time); `fields` is only populated for form bodies, the authoritative field
/// order lives in `raw`.
#[derive(Debug, Clone, Default)]
pub struct BodyBlock {
    pub raw: String,
    pub kind: String,
    pub fields: HashMap<String, String>,
    pub present: bool,
}

#[derive(Debug, Clone, Default)]
pub struct ScriptBlock {
    pub pre_request: String,
    pub post_response: String,
}

#[derive(Debug, Clone, PartialEq)]
pub struct AssertRule {
    pub left: String,
    pub op: String,
    pub right: String,
}

const VERBS: &[&str] = &[
    "get", "post", "put", "patch", "delete", "options", "head", "trace",
];

/// Walks a folder and parses every `.bru` case, skipping any directory named
/// `environments` (case-insensitive). Files without a request block are env
/// files and are silently ignored; other parse failures abort discovery.
pub fn discover_bru_files(folder: &Path, recursive: bool) -> Result<Vec<ParsedCase>, ParseError> {
    let mut walker = WalkDir::new(folder);
    if !recursive {
        walker = walker.max_depth(1);
    }
    let mut files = Vec::new();
    let entries = walker.into_iter().filter_entry(|e| {
        !(e.file_type().is_dir() && e.file_name().eq_ignore_ascii_case("environments"))
    });
    for entry in entries {
        let entry = entry?;
        if !entry.file_type().is_file() {
            continue;
        }
        let name = entry.file_name().to_string_lossy().to_lowercase();
        if !name.ends_with(".bru") {
            continue;
        }
        match parse_file(entry.path()) {
            Ok(pf) => files.push(pf),
            Err(ParseError::MissingRequest) => {}
            Err(err) => return Err(err),
        }
    }
    Ok(files)
}

/// Reads and parses a single `.bru` file.
pub fn parse_file(path: &Path) -> Result<ParsedCase, ParseError> {
    let content = fs::read_to_string(path)?;
    parse(&path.to_string_lossy(), &content)
}

pub fn parse(path: &str, content: &str) -> Result<ParsedCase, ParseError> {
    let mut cursor = LineCursor::new(content);
    let mut pf = ParsedCase {
        file_path: path.to_string(),
        ..ParsedCase::default()
    };

    while let Some(raw_line) = cursor.next() {
        let line = raw_line.trim().to_string();
        if line.is_empty() || line.starts_with("//") {
            continue;
        }
        let lower = line.to_lowercase();
        if lower.starts_with("meta") {
            let block = read_block(&mut cursor, &line).map_err(|m| ParseError::block("meta", m))?;
            pf.meta = parse_meta(&block).map_err(|m| ParseError::block("meta", m))?;
        } else if lower.starts_with("tests") {
            pf.tests_raw = read_block_braces(&mut cursor, &line)
                .map_err(|m| ParseError::block("tests", m))?;
        } else if lower.starts_with("docs") {
            pf.docs =
                read_block_braces(&mut cursor, &line).map_err(|m| ParseError::block("docs", m))?;
        } else if lower.starts_with("assert") {
            let block =
                read_block(&mut cursor, &line).map_err(|m| ParseError::block("assert", m))?;
            pf.assert = parse_assert(&block);
        } else if lower.starts_with("script:pre-request") {
            pf.scripts.pre_request = read_block_braces(&mut cursor, &line)
                .map_err(|m| ParseError::block("script pre", m))?;
        } else if lower.starts_with("script:post-response") {
            pf.scripts.post_response = read_block_braces(&mut cursor, &line)
                .map_err(|m| ParseError::block("script post", m))?;
        } else if lower.starts_with("vars:pre-request") {
            let block =
                read_block(&mut cursor, &line).map_err(|m| ParseError::block("vars pre", m))?;
            pf.vars_pre = parse_kv_block(&block);
        } else if lower.starts_with("vars:post-response") {
            let block =
                read_block(&mut cursor, &line).map_err(|m| ParseError::block("vars post", m))?;
            pf.vars_post = parse_kv_block(&block);
        } else if lower.starts_with("headers") {
            let block =
                read_block(&mut cursor, &line).map_err(|m| ParseError::block("headers", m))?;
            pf.request.headers.extend(parse_kv_block(&block));
        } else if lower.starts_with("query") {
            let block =
                read_block(&mut cursor, &line).map_err(|m| ParseError::block("query", m))?;
            pf.request.query = parse_kv_block(&block);
        } else if lower.starts_with("params:query") {
            let block =
                read_block(&mut cursor, &line).map_err(|m| ParseError::block("params:query", m))?;
            pf.request.query = parse_kv_block(&block);
        } else if lower.starts_with("params:path") {
            let block =
                read_block(&mut cursor, &line).map_err(|m| ParseError::block("params:path", m))?;
            pf.request.path_params = parse_kv_block(&block);
        } else if lower.starts_with("body:graphql:vars") {
            let block = read_block_braces(&mut cursor, &line)
                .map_err(|m| ParseError::block("graphql vars", m))?;
            pf.request.graphql_vars = parse_json_map(&block)
                .unwrap_or_else(|| parse_kv_block(&split_lines(&block)));
        } else if lower.starts_with("body:") {
            let kind = lower
                .trim_start_matches("body:")
                .trim()
                .trim_end_matches('{')
                .trim()
                .to_string();
            let block =
                read_block_braces(&mut cursor, &line).map_err(|m| ParseError::block("body", m))?;
            pf.request.body.present = true;
            pf.request.body.kind = if kind.is_empty() { "json".into() } else { kind };
            pf.request.body.raw = block;
            if pf.request.body.kind == "form-urlencoded" || pf.request.body.kind == "multipart-form"
            {
                pf.request.body.fields = parse_kv_block(&split_lines(&pf.request.body.raw));
            }
        } else if lower.starts_with("body") {
            // bare body block defaults to JSON
            let block =
                read_block_braces(&mut cursor, &line).map_err(|m| ParseError::block("body", m))?;
            pf.request.body.present = true;
            pf.request.body.kind = "json".into();
            pf.request.body.raw = block;
        } else if let Some(verb) = VERBS.iter().find(|v| lower.starts_with(*v)) {
            let block =
                read_block(&mut cursor, &line).map_err(|m| ParseError::block("request", m))?;
            let req = parse_request(verb, &block);
            pf.request.verb = req.verb;
            pf.request.url = req.url;
            pf.request.headers.extend(req.headers);
            if req.body.present && !pf.request.body.present {
                pf.request.body = req.body;
            }
        }
    }

    if pf.request.verb.is_empty() {
        return Err(ParseError::MissingRequest);
    }
    Ok(pf)
}

/// Parses an environment `.bru` file: only the `vars { k: v }` block is read,
/// everything else is ignored.
pub fn load_env(path: &Path) -> Result<HashMap<String, String>, ParseError> {
    let content = fs::read_to_string(path)?;
    let mut vars = HashMap::new();
    let mut in_vars = false;
    for raw in content.lines() {
        let line = raw.trim();
        if line.is_empty() || line.starts_with("//") {
            continue;
        }
        if !in_vars {
            if line.starts_with("vars") {
                in_vars = true;
            }
            continue;
        }
        if line == "}" {
            break;
        }
        if let Some((key, val)) = line.split_once(':') {
            let val = val.trim().trim_end_matches(',');
            vars.insert(key.trim().to_string(), val.to_string());
        }
    }
    Ok(vars)
}

struct LineCursor {
    lines: Vec<String>,
    pos: usize,
}

impl LineCursor {
    fn new(content: &str) -> Self {
        Self {
            lines: content.lines().map(str::to_string).collect(),
            pos: 0,
        }
    }

    fn next(&mut self) -> Option<String> {
        let line = self.lines.get(self.pos).cloned();
        self.pos += 1;
        line
    }
}

fn split_lines(raw: &str) -> Vec<String> {
    raw.lines().map(str::to_string).collect()
}

fn parse_meta(lines: &[String]) -> Result<MetaBlock, String> {
    let mut m = MetaBlock::default();
    for l in lines {
        let l = l.trim();
        if l.is_empty() || l.starts_with("//") {
            continue;
        }
        let Some((key, val)) = l.split_once(':') else {
            continue;
        };
        let key = key.trim();
        let val = val.trim().trim_end_matches(',');
        match key {
            "name" => m.name = val.to_string(),
            "type" => m.kind = val.to_string(),
            "seq" => {
                m.seq = val
                    .parse::<f64>()
                    .map_err(|e| format!("seq {val:?}: {e}"))?;
            }
            "description" => m.description = val.trim_matches('"').to_string(),
            "skip" => m.skip = val.eq_ignore_ascii_case("true"),
            "delay" => m.delay_ms = val.parse().unwrap_or(0),
            "repeat" => m.repeat = val.parse().unwrap_or(0),
            "timeout" => m.timeout_ms = val.parse().unwrap_or(0),
            "tags" => {
                let inner = val.trim_matches(|c: char| c == '[' || c == ']' || c == '"' || c == ' ');
                for part in inner.split(',') {
                    let tag = part.trim().trim_matches('"');
                    if !tag.is_empty() {
                        m.tags.push(tag.to_string());
                    }
                }
            }
            "settings" => {
                // settings: { script: "prelude.js" }
                let inner = val.trim_matches(|c: char| c == '{' || c == '}' || c == ' ');
                if let Some(rest) = inner.strip_prefix("script") {
                    let rest = rest.trim_start().trim_start_matches(':');
                    m.settings.script = rest.trim().trim_matches('"').to_string();
                }
            }
            "enabled" => m.skip = val.eq_ignore_ascii_case("false"),
            _ => {}
        }
    }
    Ok(m)
}

fn parse_request(verb: &str, lines: &[String]) -> RequestBlock {
    let mut req = RequestBlock {
        verb: verb.to_uppercase(),
        ..RequestBlock::default()
    };
    let mut in_headers = false;
    let mut in_body = false;
    let mut body_lines: Vec<String> = Vec::new();

    for l in lines {
        let trimmed = l.trim();
        if trimmed.is_empty() || trimmed.starts_with("//") {
            continue;
        }

        if let Some(rest) = trimmed.strip_prefix("url:") {
            let mut url_part = rest.trim();
            if let Some(sp) = url_part.find(' ') {
                url_part = url_part[..sp].trim();
            }
            req.url = url_part.to_string();
        }

        // inline headers on one line: headers { X: 1 }
        if let Some(idx) = trimmed.find("headers") {
            if let Some(brace) = trimmed[idx..].find('{') {
                if let Some((content, _)) = find_balanced_at(trimmed, idx + brace) {
                    req.headers.extend(parse_kv_block(&split_lines(content)));
                }
            }
        }

        // inline body on one line: body:json { ... }
        if let Some(idx) = trimmed.find("body:") {
            if let Some(brace) = trimmed[idx..].find('{') {
                if let Some((content, _)) = find_balanced_at(trimmed, idx + brace) {
                    req.body.present = true;
                    req.body.kind = detect_body_kind(&trimmed[idx..]);
                    req.body.raw = content.to_string();
                    continue;
                }
            }
        }

        if trimmed.starts_with("headers") {
            in_headers = true;
            continue;
        }
        if trimmed.starts_with("body:") || trimmed.starts_with("body ") {
            req.body.kind = detect_body_kind(trimmed);
            req.body.present = true;
            in_body = true;
            continue;
        }
        if in_headers {
            if trimmed == "}" {
                in_headers = false;
                continue;
            }
            if let Some((k, v)) = trimmed.split_once(':') {
                let key = k.trim().trim_matches('"');
                let val = v.trim().trim_end_matches(',');
                req.headers.insert(key.to_string(), val.to_string());
            }
            continue;
        }
        if in_body {
            if trimmed == "}" {
                in_body = false;
                continue;
            }
            body_lines.push(l.clone());
        }
    }
    if !body_lines.is_empty() {
        req.body.raw = body_lines.join("\n");
    }
    req
}

fn parse_kv_block(lines: &[String]) -> HashMap<String, String> {
    let mut m = HashMap::new();
    for l in lines {
        let trimmed = l.trim();
        if trimmed.is_empty() || trimmed.starts_with("//") || trimmed.starts_with('~') {
            continue;
        }
        let Some((k, v)) = trimmed.split_once(':') else {
            continue;
        };
        let key = k.trim().trim_matches('"');
        let val = v.trim().trim_end_matches(',');
        m.insert(key.to_string(), val.to_string());
    }
    m
}

fn parse_json_map(raw: &str) -> Option<HashMap<String, String>> {
    serde_json::from_str::<HashMap<String, String>>(raw).ok()
}

fn detect_body_kind(line: &str) -> String {
    let lower = line.to_lowercase();
    for kind in [
        "form-urlencoded",
        "multipart-form",
        "xml",
        "text",
        "graphql",
    ] {
        if lower.contains(kind) {
            return kind.to_string();
        }
    }
    "json".to_string()
}

fn parse_assert(lines: &[String]) -> Vec<AssertRule> {
    let mut rules = Vec::new();
    for l in lines {
        let trimmed = l.trim();
        if trimmed.is_empty() || trimmed.starts_with("//") {
            continue;
        }
        let Some((left, rest)) = trimmed.split_once(':') else {
            continue;
        };
        let mut parts = rest.trim().split_whitespace();
        let Some(op) = parts.next() else { continue };
        let right: Vec<&str> = parts.collect();
        if right.is_empty() {
            continue;
        }
        rules.push(AssertRule {
            left: left.trim().to_string(),
            op: op.to_string(),
            right: right.join(" "),
        });
    }
    rules
}

/// Returns the content between the brace at `start` and its matching closing
/// brace, plus the index of that closing brace.
fn find_balanced_at(s: &str, start: usize) -> Option<(&str, usize)> {
    let bytes = s.as_bytes();
    let mut depth = 0usize;
    let mut content_start = None;
    for (i, b) in bytes.iter().enumerate().skip(start) {
        match b {
            b'{' => {
                if depth == 0 {
                    content_start = Some(i + 1);
                }
                depth += 1;
            }
            b'}' => {
                depth = depth.saturating_sub(1);
                if depth == 0 {
                    if let Some(cs) = content_start {
                        return Some((&s[cs..i], i));
                    }
                }
            }
            _ => {}
        }
    }
    None
}

fn find_balanced_inline(s: &str) -> Option<(usize, usize)> {
    let idx = s.find('{')?;
    let (_, end) = find_balanced_at(s, idx)?;
    Some((idx + 1, end))
}

/// Reads the key/value lines of a block whose opening line is `first_line`.
fn read_block(cursor: &mut LineCursor, first_line: &str) -> Result<Vec<String>, String> {
    if !first_line.contains('{') {
        return Err("missing opening brace".into());
    }
    if let Some((start, end)) = find_balanced_inline(first_line) {
        let inner = first_line[start..end].trim();
        if inner.is_empty() {
            return Ok(Vec::new());
        }
        return Ok(vec![inner.to_string()]);
    }

    let mut depth = brace_delta(first_line);
    let mut lines = Vec::new();
    while let Some(line) = cursor.next() {
        depth += brace_delta(&line);
        if depth <= 0 {
            if depth < 0 {
                return Err("unbalanced braces".into());
            }
            return Ok(lines);
        }
        lines.push(line);
    }
    Err("unbalanced braces".into())
}

/// Reads a block verbatim (scripts, tests, docs, bodies), preserving inner
/// newlines and nesting.
fn read_block_braces(cursor: &mut LineCursor, first_line: &str) -> Result<String, String> {
    if let Some((start, end)) = find_balanced_inline(first_line) {
        return Ok(first_line[start..end].trim().to_string());
    }

    let mut depth = brace_delta(first_line);
    let mut out = String::new();
    while let Some(line) = cursor.next() {
        depth += brace_delta(&line);
        if depth <= 0 {
            if depth < 0 {
                return Err("unbalanced braces".into());
            }
            return Ok(out);
        }
        out.push_str(&line);
        out.push('\n');
    }
    Err("unbalanced braces".into())
}

fn brace_delta(line: &str) -> i32 {
    let opens = line.matches('{').count() as i32;
    let closes = line.matches('}').count() as i32;
    opens - closes
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    const BASIC: &str = r#"
meta {
  name: Create user
  type: http
  seq: 2
  tags: [smoke, users]
  delay: 50
  repeat: 2
  timeout: 2000
}

post {
  url: {{baseUrl}}/users
}

headers {
  Content-Type: application/json
  X-Trace: {{trace}}
}

body:json {
  {
    "name": "alpha"
  }
}

assert {
  res.status: eq 201
  res.body.name: eq alpha
}

tests {
  test("created", function() {
    expect(res.status).to.equal(201);
  });
}
"#;

    #[test]
    fn parses_basic_case() {
        let pf = parse("create.bru", BASIC).unwrap();
        assert_eq!(pf.meta.name, "Create user");
        assert_eq!(pf.meta.seq, 2.0);
        assert_eq!(pf.meta.tags, vec!["smoke", "users"]);
        assert_eq!(pf.meta.delay_ms, 50);
        assert_eq!(pf.meta.repeat, 2);
        assert_eq!(pf.meta.timeout_ms, 2000);
        assert_eq!(pf.request.verb, "POST");
        assert_eq!(pf.request.url, "{{baseUrl}}/users");
        assert_eq!(
            pf.request.headers.get("Content-Type").map(String::as_str),
            Some("application/json")
        );
        assert!(pf.request.body.present);
        assert_eq!(pf.request.body.kind, "json");
        assert!(pf.request.body.raw.contains("\"name\": \"alpha\""));
        assert_eq!(pf.assert.len(), 2);
        assert_eq!(pf.assert[0].left, "res.status");
        assert_eq!(pf.assert[0].op, "eq");
        assert_eq!(pf.assert[0].right, "201");
        assert!(pf.tests_raw.contains("expect(res.status)"));
    }

    #[test]
    fn missing_request_block_is_env_file() {
        let err = parse("env.bru", "vars {\n  baseUrl: http://x\n}\n").unwrap_err();
        assert!(matches!(err, ParseError::MissingRequest));
    }

    #[test]
    fn enabled_false_means_skip() {
        let src = "meta {\n  name: off\n  enabled: false\n}\nget {\n  url: http://x\n}\n";
        let pf = parse("off.bru", src).unwrap();
        assert!(pf.meta.skip);
    }

    #[test]
    fn settings_script_is_extracted() {
        let src =
            "meta {\n  name: s\n  settings: { script: \"prelude.js\" }\n}\nget {\n  url: http://x\n}\n";
        let pf = parse("s.bru", src).unwrap();
        assert_eq!(pf.meta.settings.script, "prelude.js");
    }

    #[test]
    fn inline_request_blocks() {
        let src = "get {\n  url: http://x/a headers { X-K: v } body:json { {\"a\":1} }\n}\n";
        let pf = parse("inline.bru", src).unwrap();
        assert_eq!(pf.request.url, "http://x/a");
        assert_eq!(pf.request.headers.get("X-K").map(String::as_str), Some("v"));
        assert!(pf.request.body.present);
        assert_eq!(pf.request.body.kind, "json");
    }

    #[test]
    fn path_and_query_params() {
        let src = "get {\n  url: http://x/users/:id\n}\nparams:path {\n  id: 7\n}\nparams:query {\n  page: 2\n}\n";
        let pf = parse("p.bru", src).unwrap();
        assert_eq!(pf.request.path_params.get("id").map(String::as_str), Some("7"));
        assert_eq!(pf.request.query.get("page").map(String::as_str), Some("2"));
    }

    #[test]
    fn vars_blocks_and_scripts() {
        let src = r#"
get {
  url: http://x
}
vars:pre-request {
  token: abc
}
vars:post-response {
  sessionId: xyz
}
script:pre-request {
  bru.setVar("k", "v");
}
script:post-response {
  console.log(res.status);
}
"#;
        let pf = parse("v.bru", src).unwrap();
        assert_eq!(pf.vars_pre.get("token").map(String::as_str), Some("abc"));
        assert_eq!(pf.vars_post.get("sessionId").map(String::as_str), Some("xyz"));
        assert!(pf.scripts.pre_request.contains("setVar"));
        assert!(pf.scripts.post_response.contains("console.log"));
    }

    #[test]
    fn graphql_body_with_vars() {
        let src = r#"
post {
  url: http://x/graphql
}
body:graphql {
  query Q { user(id: $id) { name } }
}
body:graphql:vars {
  {"id": "42"}
}
"#;
        let pf = parse("g.bru", src).unwrap();
        assert_eq!(pf.request.body.kind, "graphql");
        assert_eq!(
            pf.request.graphql_vars.get("id").map(String::as_str),
            Some("42")
        );
    }

    #[test]
    fn form_body_fields() {
        let src = "post {\n  url: http://x\n}\nbody:form-urlencoded {\n  user: alice\n  pass: s3cret\n}\n";
        let pf = parse("f.bru", src).unwrap();
        assert_eq!(pf.request.body.kind, "form-urlencoded");
        assert_eq!(
            pf.request.body.fields.get("user").map(String::as_str),
            Some("alice")
        );
    }

    #[test]
    fn load_env_reads_only_vars_block() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("local.bru");
        let mut f = fs::File::create(&path).unwrap();
        writeln!(
            f,
            "meta {{\n  name: local\n}}\nvars {{\n  baseUrl: http://localhost:8080\n  token: t1,\n}}"
        )
        .unwrap();
        let vars = load_env(&path).unwrap();
        assert_eq!(
            vars.get("baseUrl").map(String::as_str),
            Some("http://localhost:8080")
        );
        assert_eq!(vars.get("token").map(String::as_str), Some("t1"));
        assert!(!vars.contains_key("name"));
    }

    #[test]
    fn discovery_skips_environments_dir() {
        let dir = tempfile::tempdir().unwrap();
        fs::create_dir(dir.path().join("environments")).unwrap();
        fs::write(
            dir.path().join("environments/local.bru"),
            "get {\n  url: http://x\n}\n",
        )
        .unwrap();
        fs::write(
            dir.path().join("a.bru"),
            "meta {\n  seq: 1\n}\nget {\n  url: http://x\n}\n",
        )
        .unwrap();
        fs::write(dir.path().join("env.bru"), "vars {\n  k: v\n}\n").unwrap();
        fs::write(dir.path().join("notes.txt"), "ignored").unwrap();

        let files = discover_bru_files(dir.path(), true).unwrap();
        assert_eq!(files.len(), 1);
        assert!(files[0].file_path.ends_with("a.bru"));
    }

    #[test]
    fn discovery_non_recursive_skips_subfolders() {
        let dir = tempfile::tempdir().unwrap();
        fs::create_dir(dir.path().join("nested")).unwrap();
        fs::write(
            dir.path().join("nested/b.bru"),
            "get {\n  url: http://x\n}\n",
        )
        .unwrap();
        fs::write(dir.path().join("a.bru"), "get {\n  url: http://x\n}\n").unwrap();

        let all = discover_bru_files(dir.path(), true).unwrap();
        assert_eq!(all.len(), 2);
        let top = discover_bru_files(dir.path(), false).unwrap();
        assert_eq!(top.len(), 1);
    }
}
