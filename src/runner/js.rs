//! Embedded JS execution surface. Each case gets two fresh single-threaded
//! VMs: one that lets the pre-request script mutate the outgoing request, and
//! one that runs the post-response script, declarative asserts, and `test`
//! registrations against `res`. Nothing is shared across cases.

use std::cell::RefCell;
use std::collections::HashSet;
use std::rc::Rc;
use std::time::Duration;

use anyhow::{anyhow, Result};
use http::{HeaderMap, HeaderName, HeaderValue, Request, Uri};
use http_body_util::Full;
use hyper::body::Bytes;
use rquickjs::{
    CatchResultExt, Coerced, Context, Ctx, FromJs, Function, IntoJs, Object, Runtime, Value,
};
use serde_json::Map;

use crate::parser::{AssertRule, ParsedCase};

use super::expand::Expander;
use super::AssertionFailure;

/// Per-case state shared between the two VMs through the expander.
pub(crate) struct JsEnv {
    pub expander: Rc<RefCell<Expander>>,
    pub iteration_index: usize,
    pub total_iterations: usize,
    pub iteration_data: Rc<RefCell<Map<String, serde_json::Value>>>,
}

#[derive(Debug)]
pub(crate) struct ScriptOutcome {
    pub passed: bool,
    pub failures: Vec<AssertionFailure>,
    pub console: Vec<String>,
}

/// Installs `expect` chains. Kept in JS: the chain is pure object wiring and
/// the thrown Error messages carry through the engine unchanged.
const EXPECT_PRELUDE: &str = r#"
(function (global) {
    function fmt(v) {
        if (typeof v === 'string') return v;
        try {
            var s = JSON.stringify(v);
            if (s !== undefined) return s;
        } catch (e) {}
        return String(v);
    }
    function lengthOf(v) {
        if (v === null || v === undefined) return 0;
        if (typeof v === 'string' || Array.isArray(v)) return v.length;
        if (typeof v === 'object' && typeof v.length === 'number') return v.length;
        return 0;
    }
    function makeLength(val, neg) {
        var len = lengthOf(val);
        function assertThat(ok, msg) {
            if (neg ? ok : !ok) throw new Error(msg);
        }
        function greaterThan(want) {
            assertThat(len > want, 'expected length ' + len + ' to be greater than ' + want);
        }
        return {
            greaterThan: greaterThan,
            above: greaterThan,
            equal: function (want) {
                assertThat(len === want, 'expected length ' + len + ' to equal ' + want);
            },
            below: function (want) {
                assertThat(len < want, 'expected length ' + len + ' to be below ' + want);
            }
        };
    }
    function makeChain(val, neg) {
        function assertThat(ok, msg) {
            if (neg ? ok : !ok) throw new Error(msg);
        }
        function equal(other) {
            assertThat(val === other, 'expected ' + fmt(val) + ' to equal ' + fmt(other));
        }
        function include(target) {
            if (typeof val === 'string') {
                assertThat(val.indexOf(String(target)) !== -1,
                    'expected ' + fmt(val) + ' to include ' + fmt(target));
                return;
            }
            if (Array.isArray(val)) {
                assertThat(val.indexOf(target) !== -1, 'expected array to include ' + fmt(target));
                return;
            }
            throw new Error('include not supported for value ' + fmt(val));
        }
        function an(kind) {
            kind = String(kind).toLowerCase();
            var ok = false;
            if (kind === 'string') ok = typeof val === 'string';
            else if (kind === 'number') ok = typeof val === 'number' && !isNaN(val);
            else if (kind === 'array') ok = Array.isArray(val);
            else if (kind === 'object') ok = typeof val === 'object' && val !== null && !Array.isArray(val);
            assertThat(ok, 'expected ' + fmt(val) + ' to be ' + kind);
        }
        var base = {};
        var to = {}, be = {}, deep = {}, have = {}, at = {};
        base.to = to; base.be = be; base.deep = deep; base.have = have; base.at = at;
        to.be = be; to.deep = deep; to.have = have; to.at = at;
        be.at = at;

        base.equal = equal;
        base.eql = equal;
        base.include = include;
        base.contain = include;
        base.exist = function () {
            assertThat(!(val === null || val === undefined), 'expected value to exist');
        };
        to.equal = equal;
        to.eql = equal;
        to.include = include;
        to.contain = include;
        to.exist = base.exist;
        be.below = function (want) {
            assertThat(Number(val) < want, 'expected ' + fmt(val) + ' to be below ' + want);
        };
        be.greaterThan = function (want) {
            assertThat(Number(val) > want, 'expected ' + fmt(val) + ' to be greater than ' + want);
        };
        be.within = function (min, max) {
            var n = Number(val);
            assertThat(n >= min && n <= max,
                'expected ' + fmt(val) + ' to be within ' + min + '..' + max);
        };
        be.an = an;
        be.a = an;
        be.undefined = function () {
            assertThat(val === null || val === undefined, 'expected value to be undefined');
        };
        deep.equal = function (other) {
            assertThat(JSON.stringify(val) === JSON.stringify(other),
                'expected ' + fmt(val) + ' to deep equal ' + fmt(other));
        };
        have.property = function (name) {
            var prop = (val === null || val === undefined) ? undefined : val[name];
            assertThat(prop !== null && prop !== undefined,
                'expected property ' + name + ' on ' + fmt(val));
            return prop;
        };
        have.length = makeLength(val, neg);
        at.least = function (want) {
            assertThat(Number(val) >= want, 'expected ' + fmt(val) + ' to be at least ' + want);
        };
        at.most = function (want) {
            assertThat(Number(val) <= want, 'expected ' + fmt(val) + ' to be at most ' + want);
        };
        return base;
    }
    global.expect = function (val) {
        var pos = makeChain(val, false);
        var neg = makeChain(val, true);
        pos.not = neg;
        pos.to.not = neg;
        pos.be.not = neg;
        pos.deep.not = neg;
        pos.have.not = neg;
        pos.at.not = neg;
        return pos;
    };
})(globalThis);
"#;

/// Normalizes common fields so JS string helpers (`match`, etc.) are present.
/// The prototype patch stays non-enumerable so `for...in` loops are unchanged.
const PROTO_PATCH: &str = r#"
if (typeof Object.prototype.match !== 'function') {
    Object.defineProperty(Object.prototype, 'match', {
        value: function (re) { return String(this).match(re); },
        enumerable: false
    });
}
if (typeof res !== 'undefined' && res && res.body && res.body.message
    && typeof res.body.message.match !== 'function') {
    res.body.message = String(res.body.message);
}
"#;

/// Runs the post-response script, declarative asserts, and `test(...)`
/// registrations against the response. An error return means the tests source
/// itself failed to evaluate; the caller surfaces that as the case error.
pub(crate) fn execute_tests(
    p: &ParsedCase,
    status: u16,
    headers: &HeaderMap,
    body: &[u8],
    duration: Duration,
    prelude: &str,
    env: &JsEnv,
) -> Result<ScriptOutcome> {
    let runtime = Runtime::new()?;
    let context = Context::full(&runtime)?;
    context.with(|ctx| run_case_scripts(&ctx, p, status, headers, body, duration, prelude, env))
}

#[allow(clippy::too_many_arguments)]
fn run_case_scripts<'js>(
    ctx: &Ctx<'js>,
    p: &ParsedCase,
    status: u16,
    headers: &HeaderMap,
    body: &[u8],
    duration: Duration,
    prelude: &str,
    env: &JsEnv,
) -> Result<ScriptOutcome> {
    let console: Rc<RefCell<Vec<String>>> = Rc::new(RefCell::new(Vec::new()));
    register_console(ctx, console.clone()).map_err(js_err)?;
    register_env(ctx, env.expander.clone()).map_err(js_err)?;
    register_process_env(ctx, &env.expander.borrow()).map_err(js_err)?;
    register_bru(ctx, env).map_err(js_err)?;

    let res_obj =
        new_response_object(ctx, status, headers, body, duration).map_err(js_err)?;
    ctx.globals().set("res", res_obj.clone()).map_err(js_err)?;
    let _: Value = ctx.eval(EXPECT_PRELUDE).map_err(js_err)?;

    if !prelude.trim().is_empty() {
        let _ = ctx.eval::<Value, _>(prelude).catch(ctx);
    }
    let _ = ctx.eval::<Value, _>(PROTO_PATCH).catch(ctx);

    if !p.scripts.post_response.trim().is_empty() {
        let _ = ctx.eval::<Value, _>(p.scripts.post_response.as_str()).catch(ctx);
    }
    // Re-run the pre-request script here so variable writes it performs are
    // visible to the published expander state; the request itself already
    // went out.
    if !p.scripts.pre_request.trim().is_empty() {
        let _ = ctx.eval::<Value, _>(p.scripts.pre_request.as_str()).catch(ctx);
    }

    let tests: Rc<RefCell<Vec<(String, Function<'js>)>>> = Rc::new(RefCell::new(Vec::new()));
    let registry = tests.clone();
    ctx.globals()
        .set(
            "test",
            Function::new(ctx.clone(), move |name: String, func: Function<'js>| {
                registry.borrow_mut().push((name, func));
            })
            .map_err(js_err)?,
        )
        .map_err(js_err)?;

    if !p.tests_raw.trim().is_empty() {
        if let Err(caught) = ctx.eval::<Value, _>(p.tests_raw.as_str()).catch(ctx) {
            return Err(anyhow!("{caught}"));
        }
    }

    let mut outcome = ScriptOutcome {
        passed: true,
        failures: Vec::new(),
        console: Vec::new(),
    };

    // declarative asserts run before test registrations
    for rule in &p.assert {
        if let Err(msg) = eval_assert(ctx, rule) {
            outcome.passed = false;
            outcome.failures.push(AssertionFailure {
                name: rule.left.clone(),
                message: with_http_context(&msg, status, body),
            });
        }
    }

    let registered = tests.borrow().clone();
    for (name, func) in registered {
        if let Err(caught) = func.call::<_, ()>(()).catch(ctx) {
            outcome.passed = false;
            outcome.failures.push(AssertionFailure {
                name,
                message: with_http_context(&caught.to_string(), status, body),
            });
        }
    }

    outcome.console = console.borrow().clone();
    Ok(outcome)
}

/// Runs the pre-request script against a `req` object and applies header/url
/// mutations back onto the outgoing request. The script's literal `req.url`
/// string is used verbatim; it is not re-expanded.
pub(crate) fn run_pre_request_script(
    code: &str,
    req: &mut Request<Full<Bytes>>,
    env: &JsEnv,
) -> Result<()> {
    if code.trim().is_empty() {
        return Ok(());
    }
    let runtime = Runtime::new()?;
    let context = Context::full(&runtime)?;

    let original_url = req.uri().to_string();
    let mut header_updates: Vec<(String, String)> = Vec::new();
    let mut new_url: Option<String> = None;

    context.with(|ctx| -> Result<()> {
        let req_obj = Object::new(ctx.clone()).map_err(js_err)?;
        let hdr_obj = Object::new(ctx.clone()).map_err(js_err)?;
        for (k, v) in req.headers() {
            if let Ok(val) = v.to_str() {
                hdr_obj.set(k.as_str(), val).map_err(js_err)?;
            }
        }
        req_obj.set("headers", hdr_obj.clone()).map_err(js_err)?;
        req_obj.set("url", original_url.as_str()).map_err(js_err)?;
        let set_header_target = hdr_obj.clone();
        req_obj
            .set(
                "setHeader",
                Function::new(
                    ctx.clone(),
                    move |name: Coerced<String>, val: rquickjs::function::Opt<Coerced<String>>| {
                        let value = val.0.map(|c| c.0).unwrap_or_default();
                        let _ = set_header_target.set(name.0.to_lowercase(), value);
                    },
                )
                .map_err(js_err)?,
            )
            .map_err(js_err)?;
        ctx.globals().set("req", req_obj.clone()).map_err(js_err)?;

        register_env(&ctx, env.expander.clone()).map_err(js_err)?;
        register_process_env(&ctx, &env.expander.borrow()).map_err(js_err)?;
        register_bru(&ctx, env).map_err(js_err)?;

        if let Err(caught) = ctx.eval::<Value, _>(code).catch(&ctx) {
            return Err(anyhow!("{caught}"));
        }

        let headers_back: Object = req_obj.get("headers").map_err(js_err)?;
        for key in headers_back.keys::<String>() {
            let key = key.map_err(js_err)?;
            let val: Coerced<String> = headers_back.get(key.as_str()).map_err(js_err)?;
            header_updates.push((key, val.0));
        }
        let url_back: Coerced<String> = req_obj.get("url").map_err(js_err)?;
        if !url_back.0.is_empty() && url_back.0 != original_url {
            new_url = Some(url_back.0);
        }
        Ok(())
    })?;

    for (key, val) in header_updates {
        if let (Ok(name), Ok(value)) = (
            HeaderName::from_bytes(key.as_bytes()),
            HeaderValue::from_str(&val),
        ) {
            req.headers_mut().insert(name, value);
        }
    }
    if let Some(url) = new_url {
        if let Ok(uri) = url.parse::<Uri>() {
            *req.uri_mut() = uri;
        }
    }
    Ok(())
}

fn register_console(ctx: &Ctx<'_>, logs: Rc<RefCell<Vec<String>>>) -> rquickjs::Result<()> {
    let console = Object::new(ctx.clone())?;
    console.set(
        "log",
        Function::new(
            ctx.clone(),
            move |args: rquickjs::function::Rest<Coerced<String>>| {
                let line = args
                    .0
                    .iter()
                    .map(|c| c.0.as_str())
                    .collect::<Vec<_>>()
                    .join(" ");
                tracing::debug!(msg = %line, "js");
                logs.borrow_mut().push(line);
            },
        )?,
    )?;
    ctx.globals().set("console", console)
}

fn register_env(ctx: &Ctx<'_>, exp: Rc<RefCell<Expander>>) -> rquickjs::Result<()> {
    ctx.globals().set(
        "env",
        Function::new(ctx.clone(), move |key: String| -> Option<String> {
            exp.borrow().get(&key)
        })?,
    )
}

/// `process.env` exposes expander vars merged over the OS environment, the
/// expander winning on conflict.
fn register_process_env(ctx: &Ctx<'_>, exp: &Expander) -> rquickjs::Result<()> {
    let env_obj = Object::new(ctx.clone())?;
    for (k, v) in exp.vars() {
        env_obj.set(k.as_str(), v.as_str())?;
    }
    for (k, v) in std::env::vars() {
        if !exp.vars().contains_key(&k) {
            env_obj.set(k, v)?;
        }
    }
    let proc = Object::new(ctx.clone())?;
    proc.set("env", env_obj)?;
    ctx.globals().set("process", proc)
}

fn register_bru<'js>(ctx: &Ctx<'js>, env: &JsEnv) -> rquickjs::Result<()> {
    let bru = Object::new(ctx.clone())?;

    let exp = env.expander.clone();
    bru.set(
        "setVar",
        Function::new(
            ctx.clone(),
            move |ctx: Ctx<'js>, key: String, val: Coerced<String>| -> rquickjs::Result<()> {
                exp.borrow_mut().set(&key, &val.0);
                set_process_env_var(&ctx, &key, &val.0)
            },
        )?,
    )?;

    let exp = env.expander.clone();
    bru.set(
        "setEnvVar",
        Function::new(
            ctx.clone(),
            move |ctx: Ctx<'js>, key: String, val: Coerced<String>| -> rquickjs::Result<()> {
                exp.borrow_mut().set(&key, &val.0);
                std::env::set_var(&key, &val.0);
                set_process_env_var(&ctx, &key, &val.0)
            },
        )?,
    )?;

    let exp = env.expander.clone();
    let data = env.iteration_data.clone();
    bru.set(
        "getVar",
        Function::new(
            ctx.clone(),
            move |ctx: Ctx<'js>, key: String| -> rquickjs::Result<Value<'js>> {
                if let Some(v) = data.borrow().get(&key) {
                    if let Ok(json) = serde_json::to_string(v) {
                        return ctx.json_parse(json);
                    }
                }
                if let Some(v) = exp.borrow().get(&key) {
                    return v.into_js(&ctx);
                }
                Ok(Value::new_undefined(ctx.clone()))
            },
        )?,
    )?;

    let runner_obj = Object::new(ctx.clone())?;
    runner_obj.set("iterationIndex", env.iteration_index as i32)?;
    runner_obj.set("totalIterations", env.total_iterations.max(1) as i32)?;
    runner_obj.set("iterationData", new_iteration_data_object(ctx, env)?)?;
    bru.set("runner", runner_obj)?;

    ctx.globals().set("bru", bru)
}

fn set_process_env_var(ctx: &Ctx<'_>, key: &str, val: &str) -> rquickjs::Result<()> {
    let proc: Object = ctx.globals().get("process")?;
    let env_obj: Object = proc.get("env")?;
    env_obj.set(key, val)
}

fn new_iteration_data_object<'js>(ctx: &Ctx<'js>, env: &JsEnv) -> rquickjs::Result<Object<'js>> {
    let obj = Object::new(ctx.clone())?;

    let data = env.iteration_data.clone();
    obj.set(
        "has",
        Function::new(ctx.clone(), move |key: String| -> bool {
            data.borrow().contains_key(&key)
        })?,
    )?;

    let data = env.iteration_data.clone();
    obj.set(
        "get",
        Function::new(
            ctx.clone(),
            move |ctx: Ctx<'js>, key: String| -> rquickjs::Result<Value<'js>> {
                match data.borrow().get(&key).and_then(|v| serde_json::to_string(v).ok()) {
                    Some(json) => ctx.json_parse(json),
                    None => Ok(Value::new_undefined(ctx.clone())),
                }
            },
        )?,
    )?;

    let data = env.iteration_data.clone();
    obj.set(
        "getAll",
        Function::new(ctx.clone(), move |ctx: Ctx<'js>| -> rquickjs::Result<Value<'js>> {
            let json = serde_json::to_string(&*data.borrow()).unwrap_or_else(|_| "{}".into());
            ctx.json_parse(json)
        })?,
    )?;

    let data = env.iteration_data.clone();
    obj.set(
        "stringify",
        Function::new(ctx.clone(), move || -> String {
            serde_json::to_string(&*data.borrow()).unwrap_or_else(|_| "{}".into())
        })?,
    )?;

    let data = env.iteration_data.clone();
    let exp = env.expander.clone();
    obj.set(
        "set",
        Function::new(
            ctx.clone(),
            move |ctx: Ctx<'js>, key: String, val: Value<'js>| -> rquickjs::Result<()> {
                let as_string = Coerced::<String>::from_js(&ctx, val.clone())
                    .map(|c| c.0)
                    .unwrap_or_default();
                let json_val = ctx
                    .json_stringify(val)?
                    .and_then(|s| s.to_string().ok())
                    .and_then(|s| serde_json::from_str(&s).ok())
                    .unwrap_or(serde_json::Value::Null);
                data.borrow_mut().insert(key.clone(), json_val);
                exp.borrow_mut().set(&key, &as_string);
                Ok(())
            },
        )?,
    )?;

    let data = env.iteration_data.clone();
    let exp = env.expander.clone();
    obj.set(
        "unset",
        Function::new(ctx.clone(), move |key: String| {
            data.borrow_mut().remove(&key);
            exp.borrow_mut().unset(&key);
        })?,
    )?;

    Ok(obj)
}

fn new_response_object<'js>(
    ctx: &Ctx<'js>,
    status: u16,
    headers: &HeaderMap,
    body: &[u8],
    duration: Duration,
) -> rquickjs::Result<Object<'js>> {
    let obj = Object::new(ctx.clone())?;
    obj.set("status", status as i32)?;
    let duration_ms = duration.as_millis() as f64;
    obj.set("durationMs", duration_ms)?;
    obj.set(
        "getResponseTime",
        Function::new(ctx.clone(), move || -> f64 { duration_ms })?,
    )?;

    // repeated header names keep their first value
    let hdr_obj = Object::new(ctx.clone())?;
    let mut seen = HashSet::new();
    for (k, v) in headers {
        if !seen.insert(k.as_str()) {
            continue;
        }
        if let Ok(val) = v.to_str() {
            hdr_obj.set(k.as_str(), val)?;
        }
    }
    obj.set("headers", hdr_obj)?;

    let text = String::from_utf8_lossy(body).into_owned();
    let text_for_fn = text.clone();
    obj.set(
        "text",
        Function::new(ctx.clone(), move || -> String { text_for_fn.clone() })?,
    )?;
    let text_for_json = text.clone();
    obj.set(
        "json",
        Function::new(ctx.clone(), move |ctx: Ctx<'js>| -> rquickjs::Result<Value<'js>> {
            ctx.json_parse(text_for_json.clone())
        })?,
    )?;

    // res.body is the parsed JSON value when the body parses, the raw string
    // otherwise
    if !body.is_empty() {
        match ctx.json_parse(text.clone()) {
            Ok(parsed) => obj.set("body", parsed)?,
            Err(_) => obj.set("body", text)?,
        }
    }
    Ok(obj)
}

/// Resolves a dotted/bracketed path against `res` and compares it to the
/// literal right-hand side. Only `eq` is supported.
fn eval_assert<'js>(ctx: &Ctx<'js>, rule: &AssertRule) -> Result<(), String> {
    if rule.op != "eq" {
        return Err(format!("unsupported op {}", rule.op));
    }
    let left = rule.left.trim();
    let expr = if left == "res" || left.starts_with("res.") {
        left.to_string()
    } else {
        format!("res.{left}")
    };
    let code =
        format!("(function() {{ try {{ return {expr}; }} catch (e) {{ return undefined; }} }})()");
    let actual: Value<'js> = ctx
        .eval(code)
        .map_err(|_| format!("invalid assert path {left}"))?;

    let lit = rule.right.as_str();
    let matched = if lit == "true" || lit == "false" {
        actual.as_bool() == Some(lit == "true")
    } else if let Ok(num) = lit.parse::<f64>() {
        value_as_f64(&actual) == Some(num)
    } else {
        actual
            .as_string()
            .and_then(|s| s.to_string().ok())
            .as_deref()
            == Some(lit)
    };
    if matched {
        Ok(())
    } else {
        Err(format!(
            "expected {} to equal {}",
            render_value(ctx, &actual),
            lit
        ))
    }
}

fn value_as_f64(v: &Value<'_>) -> Option<f64> {
    if let Some(i) = v.as_int() {
        return Some(i as f64);
    }
    v.as_float()
}

fn render_value<'js>(ctx: &Ctx<'js>, v: &Value<'js>) -> String {
    Coerced::<String>::from_js(ctx, v.clone())
        .map(|c| c.0)
        .unwrap_or_else(|_| "undefined".to_string())
}

fn js_err(err: rquickjs::Error) -> anyhow::Error {
    anyhow!("js: {err}")
}

/// Appends status/body snippets so failed assertions carry their HTTP context.
pub(crate) fn with_http_context(msg: &str, status: u16, body: &[u8]) -> String {
    const MAX_BODY: usize = 256;
    let text = String::from_utf8_lossy(body);
    let trimmed = text.trim();
    let snippet: String = if trimmed.chars().count() > MAX_BODY {
        let mut s: String = trimmed.chars().take(MAX_BODY).collect();
        s.push('…');
        s
    } else {
        trimmed.to_string()
    };
    format!("{msg} (status={status}, body={snippet:?})")
}
