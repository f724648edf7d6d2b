//! Builds the concrete HTTP request for a case: URL expansion with path
//! params, per-kind body encoding, header and query application.

use std::collections::{BTreeMap, HashMap};
use std::fs;
use std::path::Path;
use std::sync::OnceLock;

use anyhow::{bail, Context as _, Result};
use http::{Method, Request};
use http_body_util::Full;
use hyper::body::Bytes;
use regex::Regex;
use url::Url;

use crate::parser::ParsedCase;

use super::expand::{unresolved_names, Expander};

pub fn build_http_request(p: &ParsedCase, exp: &Expander) -> Result<Request<Full<Bytes>>> {
    let mut url = exp.expand(&p.request.url);
    for (k, v) in &p.request.path_params {
        url = url.replace(&format!(":{k}"), &exp.expand(v));
    }
    let missing = unresolved_names(&url);
    if !missing.is_empty() {
        bail!(
            "unresolved variable(s) in url: {} (provide --env/--var)",
            missing.join(", ")
        );
    }

    let mut headers: HashMap<String, String> = p.request.headers.clone();
    let mut body = Bytes::new();

    if p.request.body.present {
        let kind = if p.request.body.kind.is_empty() {
            "json"
        } else {
            p.request.body.kind.as_str()
        };
        match kind {
            "json" => {
                let expanded = exp.expand(&p.request.body.raw);
                body = Bytes::from(normalize_json_body(&expanded));
                default_header(&mut headers, "Content-Type", "application/json");
            }
            "graphql" => {
                let query = exp.expand(&p.request.body.raw).trim().to_string();
                let mut payload = serde_json::Map::new();
                payload.insert("query".into(), serde_json::Value::String(query));
                if !p.request.graphql_vars.is_empty() {
                    let vars: serde_json::Map<String, serde_json::Value> = p
                        .request
                        .graphql_vars
                        .iter()
                        .map(|(k, v)| (k.clone(), serde_json::Value::String(exp.expand(v))))
                        .collect();
                    payload.insert("variables".into(), serde_json::Value::Object(vars));
                }
                body = Bytes::from(serde_json::to_vec(&serde_json::Value::Object(payload))?);
                default_header(&mut headers, "Content-Type", "application/json");
            }
            "form-urlencoded" => {
                let fields = form_fields(p);
                let mut ser = url::form_urlencoded::Serializer::new(String::new());
                for (k, v) in &fields {
                    ser.append_pair(&exp.expand(k), &exp.expand(v));
                }
                body = Bytes::from(ser.finish());
                headers.insert(
                    "Content-Type".into(),
                    "application/x-www-form-urlencoded".into(),
                );
            }
            "multipart-form" => {
                let fields = form_fields(p);
                let (bytes, boundary) = write_multipart(&fields, exp)?;
                body = Bytes::from(bytes);
                match find_header(&headers, "content-type") {
                    Some((key, val)) if val.to_lowercase().contains("multipart/related") => {
                        if !val.contains("boundary=") {
                            let appended = format!("{val}; boundary={boundary}");
                            headers.insert(key, appended);
                        }
                    }
                    _ => {
                        headers.insert(
                            "Content-Type".into(),
                            format!("multipart/form-data; boundary={boundary}"),
                        );
                    }
                }
            }
            "xml" => {
                body = Bytes::from(exp.expand(&p.request.body.raw));
                default_header(&mut headers, "Content-Type", "application/xml");
            }
            "text" => {
                body = Bytes::from(exp.expand(&p.request.body.raw));
                default_header(&mut headers, "Content-Type", "text/plain");
            }
            _ => {
                body = Bytes::from(exp.expand(&p.request.body.raw));
            }
        }
    }

    let url = apply_query(&url, &p.request.query, exp)?;

    let method = Method::from_bytes(p.request.verb.as_bytes())
        .with_context(|| format!("invalid method {}", p.request.verb))?;
    let mut builder = Request::builder().method(method).uri(url.as_str());
    for (k, v) in &headers {
        builder = builder.header(k.as_str(), exp.expand(v));
    }
    builder
        .body(Full::new(body))
        .context("build http request")
}

/// Merges case query params into the URL. Keys are sorted so the wire form is
/// stable; case params override same-named URL params.
fn apply_query(url: &str, query: &HashMap<String, String>, exp: &Expander) -> Result<Url> {
    let mut parsed = Url::parse(url).with_context(|| format!("invalid url {url}"))?;
    if query.is_empty() {
        return Ok(parsed);
    }
    let mut merged: BTreeMap<String, String> = parsed
        .query_pairs()
        .map(|(k, v)| (k.into_owned(), v.into_owned()))
        .collect();
    for (k, v) in query {
        merged.insert(k.clone(), exp.expand(v));
    }
    let mut ser = url::form_urlencoded::Serializer::new(String::new());
    for (k, v) in &merged {
        ser.append_pair(k, v);
    }
    parsed.set_query(Some(&ser.finish()));
    Ok(parsed)
}

fn default_header(headers: &mut HashMap<String, String>, name: &str, value: &str) {
    if find_header(headers, &name.to_lowercase()).is_none() {
        headers.insert(name.to_string(), value.to_string());
    }
}

fn find_header(headers: &HashMap<String, String>, lower_name: &str) -> Option<(String, String)> {
    headers
        .iter()
        .find(|(k, _)| k.to_lowercase() == lower_name)
        .map(|(k, v)| (k.clone(), v.clone()))
}

/// Field order for form and multipart bodies follows the order they appear in
/// the raw body text; the parsed map is only a fallback.
fn form_fields(p: &ParsedCase) -> Vec<(String, String)> {
    let ordered = ordered_form_fields(&p.request.body.raw);
    if !ordered.is_empty() {
        return ordered;
    }
    p.request
        .body
        .fields
        .iter()
        .map(|(k, v)| (k.clone(), v.clone()))
        .collect()
}

fn ordered_form_fields(raw: &str) -> Vec<(String, String)> {
    let mut fields = Vec::new();
    for line in raw.lines() {
        let trimmed = line.trim();
        if trimmed.is_empty() || trimmed.starts_with("//") || trimmed.starts_with('~') {
            continue;
        }
        let Some((k, v)) = trimmed.split_once(':') else {
            continue;
        };
        let val = v.trim().trim_end_matches(',');
        fields.push((k.trim().to_string(), val.to_string()));
    }
    fields
}

#[derive(Debug, Default, PartialEq)]
struct MultipartPart {
    is_file: bool,
    value: String,
    content_type: String,
    content_id: String,
}

/// Splits a multipart field value into its payload and attribute suffixes:
///
///   @/path/to/file;type=application/octet-stream;cid=<attach1>
///   raw text;type=application/xop+xml;cid=<rootpart>
fn parse_multipart_value(raw: &str) -> MultipartPart {
    let mut part = MultipartPart::default();
    let mut segments = raw.split(';');
    let first = segments.next().unwrap_or(raw);
    if let Some(path) = first.strip_prefix('@') {
        part.is_file = true;
        part.value = path.to_string();
    } else {
        part.value = first.to_string();
    }
    for seg in segments {
        let seg = seg.trim();
        if seg.is_empty() {
            continue;
        }
        if let Some((k, v)) = seg.split_once('=') {
            match k.trim().to_lowercase().as_str() {
                "type" | "content-type" => part.content_type = v.trim_matches('"').to_string(),
                "cid" | "content-id" => part.content_id = v.trim().to_string(),
                _ => {}
            }
        }
    }
    part
}

fn write_multipart(fields: &[(String, String)], exp: &Expander) -> Result<(Vec<u8>, String)> {
    let boundary = format!("{:032x}", rand::random::<u128>());
    let mut buf: Vec<u8> = Vec::new();

    for (name, raw_value) in fields {
        let part = parse_multipart_value(raw_value);
        buf.extend_from_slice(format!("--{boundary}\r\n").as_bytes());
        if part.is_file {
            let path = exp.expand(&part.value);
            let data =
                fs::read(&path).with_context(|| format!("multipart file {path}"))?;
            let base = Path::new(&path)
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_else(|| path.clone());
            buf.extend_from_slice(
                format!("Content-Disposition: form-data; name=\"{name}\"; filename=\"{base}\"\r\n")
                    .as_bytes(),
            );
            if !part.content_type.is_empty() {
                buf.extend_from_slice(
                    format!("Content-Type: {}\r\n", part.content_type).as_bytes(),
                );
            }
            if !part.content_id.is_empty() {
                buf.extend_from_slice(format!("Content-ID: {}\r\n", part.content_id).as_bytes());
            }
            buf.extend_from_slice(b"\r\n");
            buf.extend_from_slice(&data);
            buf.extend_from_slice(b"\r\n");
        } else {
            buf.extend_from_slice(
                format!("Content-Disposition: form-data; name=\"{name}\"\r\n").as_bytes(),
            );
            if !part.content_type.is_empty() {
                buf.extend_from_slice(
                    format!("Content-Type: {}\r\n", part.content_type).as_bytes(),
                );
            }
            if !part.content_id.is_empty() {
                buf.extend_from_slice(format!("Content-ID: {}\r\n", part.content_id).as_bytes());
            }
            buf.extend_from_slice(b"\r\n");
            buf.extend_from_slice(exp.expand(&part.value).as_bytes());
            buf.extend_from_slice(b"\r\n");
        }
    }
    buf.extend_from_slice(format!("--{boundary}--\r\n").as_bytes());
    Ok((buf, boundary))
}

/// Coerces Bruno-style pseudo-JSON into valid JSON: exact JSON passes through
/// re-serialized; otherwise bare identifier values are quoted and the text is
/// evaluated as a JS object literal and stringified. Any failure sends the raw
/// bytes verbatim; the server is the source of truth.
fn normalize_json_body(raw: &str) -> Vec<u8> {
    let trimmed = raw.trim();
    if let Ok(direct) = serde_json::from_str::<serde_json::Value>(trimmed) {
        if let Ok(bytes) = serde_json::to_vec(&direct) {
            return bytes;
        }
        return trimmed.as_bytes().to_vec();
    }

    let quoted = quote_bare_values(raw);
    let script = if quoted.trim_start().starts_with('(') {
        quoted
    } else {
        format!("({quoted})")
    };
    if let Ok(rt) = rquickjs::Runtime::new() {
        if let Ok(ctx) = rquickjs::Context::full(&rt) {
            let out =
                ctx.with(|ctx| ctx.eval::<String, _>(format!("JSON.stringify({script})")).ok());
            if let Some(s) = out {
                return s.into_bytes();
            }
        }
    }
    trimmed.as_bytes().to_vec()
}

fn bare_value_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| Regex::new(r": ([A-Za-z0-9_.-]+)([\s,\n])").unwrap())
}

fn quote_bare_values(raw: &str) -> String {
    bare_value_pattern()
        .replace_all(raw, |caps: &regex::Captures<'_>| {
            let val = &caps[1];
            let tail = &caps[2];
            if val == "true" || val == "false" || val.parse::<f64>().is_ok() {
                caps[0].to_string()
            } else {
                format!(": \"{val}\"{tail}")
            }
        })
        .into_owned()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::parser::parse;

    fn expander(pairs: &[(&str, &str)]) -> Expander {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        Expander::new(&map)
    }

    fn body_bytes(req: &Request<Full<Bytes>>) -> Vec<u8> {
        use http_body_util::BodyExt;
        let full = req.body().clone();
        let rt = tokio::runtime::Builder::new_current_thread()
            .build()
            .unwrap();
        rt.block_on(async move { full.collect().await.unwrap().to_bytes().to_vec() })
    }

    #[test]
    fn unresolved_url_vars_name_every_missing_variable() {
        let pf = parse("u.bru", "get {\n  url: {{baseUrl}}/{{route}}\n}\n").unwrap();
        let err = build_http_request(&pf, &expander(&[])).unwrap_err();
        let msg = err.to_string();
        assert!(msg.contains("unresolved"));
        assert!(msg.contains("baseUrl"));
        assert!(msg.contains("route"));
    }

    #[test]
    fn path_params_are_substituted() {
        let src = "get {\n  url: http://x/users/:id/posts/:post\n}\nparams:path {\n  id: {{uid}}\n  post: 9\n}\n";
        let pf = parse("p.bru", src).unwrap();
        let req = build_http_request(&pf, &expander(&[("uid", "42")])).unwrap();
        assert_eq!(req.uri().path(), "/users/42/posts/9");
    }

    #[test]
    fn json_body_gets_default_content_type() {
        let src = "post {\n  url: http://x/a\n}\nbody:json {\n  {\"ok\": true}\n}\n";
        let pf = parse("j.bru", src).unwrap();
        let req = build_http_request(&pf, &expander(&[])).unwrap();
        assert_eq!(
            req.headers().get("content-type").unwrap(),
            "application/json"
        );
        assert_eq!(body_bytes(&req), br#"{"ok":true}"#);
    }

    #[test]
    fn explicit_content_type_is_not_overwritten() {
        let src = "post {\n  url: http://x/a\n}\nheaders {\n  Content-Type: application/vnd.api+json\n}\nbody:json {\n  {\"ok\": true}\n}\n";
        let pf = parse("j.bru", src).unwrap();
        let req = build_http_request(&pf, &expander(&[])).unwrap();
        assert_eq!(
            req.headers().get("content-type").unwrap(),
            "application/vnd.api+json"
        );
    }

    #[test]
    fn pseudo_json_bare_values_are_coerced() {
        let body = normalize_json_body("{\n  name: alpha,\n  count: 3\n}");
        let parsed: serde_json::Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(parsed["name"], "alpha");
        assert_eq!(parsed["count"], 3);
    }

    #[test]
    fn unparseable_body_is_sent_verbatim() {
        let raw = "this is not json at all {{";
        assert_eq!(normalize_json_body(raw), raw.as_bytes());
    }

    #[test]
    fn graphql_body_wraps_query_and_variables() {
        let src = "post {\n  url: http://x/gql\n}\nbody:graphql {\n  query { user({{uid}}) }\n}\nbody:graphql:vars {\n  {\"id\": \"{{uid}}\"}\n}\n";
        let pf = parse("g.bru", src).unwrap();
        let req = build_http_request(&pf, &expander(&[("uid", "7")])).unwrap();
        let parsed: serde_json::Value = serde_json::from_slice(&body_bytes(&req)).unwrap();
        assert!(parsed["query"].as_str().unwrap().contains("user(7)"));
        assert_eq!(parsed["variables"]["id"], "7");
    }

    #[test]
    fn form_urlencoded_preserves_field_order() {
        let src = "post {\n  url: http://x\n}\nbody:form-urlencoded {\n  zeta: 1\n  alpha: {{v}}\n  mid dle: a b\n}\n";
        let pf = parse("f.bru", src).unwrap();
        let req = build_http_request(&pf, &expander(&[("v", "2")])).unwrap();
        assert_eq!(
            req.headers().get("content-type").unwrap(),
            "application/x-www-form-urlencoded"
        );
        let body = String::from_utf8(body_bytes(&req)).unwrap();
        assert_eq!(body, "zeta=1&alpha=2&mid+dle=a+b");
    }

    #[test]
    fn multipart_preserves_order_and_attributes() {
        let dir = tempfile::tempdir().unwrap();
        let file_path = dir.path().join("payload.bin");
        fs::write(&file_path, b"FILEDATA").unwrap();

        let src = format!(
            "post {{\n  url: http://x\n}}\nbody:multipart-form {{\n  first: plain value\n  doc: @{};type=application/octet-stream;cid=<attach1>\n  second: tagged;type=application/xop+xml\n}}\n",
            file_path.display()
        );
        let pf = parse("m.bru", &src).unwrap();
        let req = build_http_request(&pf, &expander(&[])).unwrap();

        let ct = req.headers().get("content-type").unwrap().to_str().unwrap();
        assert!(ct.starts_with("multipart/form-data; boundary="));

        let body = String::from_utf8(body_bytes(&req)).unwrap();
        let first = body.find("name=\"first\"").unwrap();
        let doc = body.find("name=\"doc\"").unwrap();
        let second = body.find("name=\"second\"").unwrap();
        assert!(first < doc && doc < second);
        assert!(body.contains("filename=\"payload.bin\""));
        assert!(body.contains("Content-Type: application/octet-stream"));
        assert!(body.contains("Content-ID: <attach1>"));
        assert!(body.contains("FILEDATA"));
        assert!(body.contains("Content-Type: application/xop+xml"));
    }

    #[test]
    fn multipart_related_keeps_existing_content_type() {
        let src = "post {\n  url: http://x\n}\nheaders {\n  Content-Type: multipart/related\n}\nbody:multipart-form {\n  part: value\n}\n";
        let pf = parse("mr.bru", src).unwrap();
        let req = build_http_request(&pf, &expander(&[])).unwrap();
        let ct = req.headers().get("content-type").unwrap().to_str().unwrap();
        assert!(ct.starts_with("multipart/related; boundary="));
    }

    #[test]
    fn query_params_are_expanded_and_sorted() {
        let src = "get {\n  url: http://x/a?keep=1\n}\nquery {\n  page: {{p}}\n  size: 10\n}\n";
        let pf = parse("q.bru", src).unwrap();
        let req = build_http_request(&pf, &expander(&[("p", "3")])).unwrap();
        assert_eq!(req.uri().query(), Some("keep=1&page=3&size=10"));
    }

    #[test]
    fn rebuilding_with_same_vars_is_identical() {
        let src = "post {\n  url: {{base}}/items\n}\nbody:json {\n  {\"k\": \"{{v}}\"}\n}\n";
        let pf = parse("r.bru", src).unwrap();
        let exp = expander(&[("base", "http://x"), ("v", "1")]);
        let a = build_http_request(&pf, &exp).unwrap();
        let b = build_http_request(&pf, &exp).unwrap();
        assert_eq!(a.uri(), b.uri());
        assert_eq!(body_bytes(&a), body_bytes(&b));
    }
}
