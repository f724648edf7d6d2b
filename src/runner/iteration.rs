//! Iteration planning: CSV/JSON datasets or a plain count. The planner always
//! yields at least one iteration.

use std::collections::HashMap;
use std::fs::File;
use std::path::Path;

use anyhow::{anyhow, bail, Context, Result};
use serde_json::{Map, Value};

use super::RunOptions;

#[derive(Debug, Clone, Default)]
pub struct IterationSpec {
    pub vars: HashMap<String, String>,
    pub data: Map<String, Value>,
}

pub fn build_iterations(opts: &RunOptions) -> Result<Vec<IterationSpec>> {
    if opts.csv_file_path.is_some() && opts.json_file_path.is_some() {
        bail!("csv-file-path and json-file-path cannot be used together");
    }
    if let Some(path) = &opts.csv_file_path {
        return read_csv_iterations(Path::new(path));
    }
    if let Some(path) = &opts.json_file_path {
        return read_json_iterations(Path::new(path));
    }

    let count = opts.iteration_count.max(1);
    Ok(vec![IterationSpec::default(); count])
}

fn read_csv_iterations(path: &Path) -> Result<Vec<IterationSpec>> {
    let file = File::open(path).with_context(|| format!("csv-file-path {}", path.display()))?;
    let mut reader = csv::ReaderBuilder::new()
        .has_headers(false)
        .flexible(true)
        .from_reader(file);

    let mut records = reader.records();
    let headers: Vec<String> = match records.next() {
        Some(row) => row
            .with_context(|| format!("csv-file-path {}", path.display()))?
            .iter()
            .map(|h| h.trim().to_string())
            .collect(),
        None => bail!("csv-file-path {} is empty", path.display()),
    };

    let mut out = Vec::new();
    for row in records {
        let row = row.with_context(|| format!("csv-file-path {}", path.display()))?;
        let mut vars = HashMap::new();
        let mut data = Map::new();
        for (i, header) in headers.iter().enumerate() {
            let val = row.get(i).map(str::trim).unwrap_or("").to_string();
            vars.insert(header.clone(), val.clone());
            data.insert(header.clone(), Value::String(val));
        }
        out.push(IterationSpec { vars, data });
    }
    if out.is_empty() {
        bail!("csv-file-path {} contains no data rows", path.display());
    }
    Ok(out)
}

fn read_json_iterations(path: &Path) -> Result<Vec<IterationSpec>> {
    let file = File::open(path).with_context(|| format!("json-file-path {}", path.display()))?;
    let raw: Value = serde_json::from_reader(file)
        .with_context(|| format!("json-file-path {}", path.display()))?;
    let arr = raw
        .as_array()
        .ok_or_else(|| anyhow!("json-file-path {} must be a JSON array", path.display()))?;

    let mut out = Vec::new();
    for item in arr {
        let obj = item
            .as_object()
            .ok_or_else(|| anyhow!("json-file-path {} must contain objects", path.display()))?;
        let mut vars = HashMap::new();
        for (k, v) in obj {
            vars.insert(k.clone(), json_value_string(v));
        }
        out.push(IterationSpec {
            vars,
            data: obj.clone(),
        });
    }
    if out.is_empty() {
        bail!("json-file-path {} contains no data rows", path.display());
    }
    Ok(out)
}

/// String form of a dataset value as exposed to `{{var}}` expansion: strings
/// verbatim, everything else in its JSON rendering.
fn json_value_string(v: &Value) -> String {
    match v {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn default_plan_is_single_iteration() {
        let plan = build_iterations(&RunOptions::default()).unwrap();
        assert_eq!(plan.len(), 1);
        assert!(plan[0].vars.is_empty());
    }

    #[test]
    fn iteration_count_zero_behaves_as_one() {
        let opts = RunOptions {
            iteration_count: 0,
            ..RunOptions::default()
        };
        assert_eq!(build_iterations(&opts).unwrap().len(), 1);
        let opts = RunOptions {
            iteration_count: 3,
            ..RunOptions::default()
        };
        assert_eq!(build_iterations(&opts).unwrap().len(), 3);
    }

    #[test]
    fn csv_and_json_are_mutually_exclusive() {
        let opts = RunOptions {
            csv_file_path: Some("a.csv".into()),
            json_file_path: Some("b.json".into()),
            ..RunOptions::default()
        };
        let err = build_iterations(&opts).unwrap_err();
        assert!(err.to_string().contains("cannot be used together"));
    }

    #[test]
    fn csv_rows_become_iterations() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("data.csv");
        let mut f = File::create(&path).unwrap();
        write!(f, "user, role\nalpha,admin\nbeta, viewer\n").unwrap();

        let opts = RunOptions {
            csv_file_path: Some(path.to_string_lossy().into_owned()),
            ..RunOptions::default()
        };
        let plan = build_iterations(&opts).unwrap();
        assert_eq!(plan.len(), 2);
        assert_eq!(plan[0].vars.get("user").map(String::as_str), Some("alpha"));
        assert_eq!(plan[0].vars.get("role").map(String::as_str), Some("admin"));
        assert_eq!(plan[1].vars.get("role").map(String::as_str), Some("viewer"));
        assert_eq!(plan[1].data.get("user"), Some(&Value::String("beta".into())));
    }

    #[test]
    fn empty_csv_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("empty.csv");
        File::create(&path).unwrap();
        let opts = RunOptions {
            csv_file_path: Some(path.to_string_lossy().into_owned()),
            ..RunOptions::default()
        };
        assert!(build_iterations(&opts).is_err());
    }

    #[test]
    fn csv_without_data_rows_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("headers.csv");
        let mut f = File::create(&path).unwrap();
        write!(f, "user,role\n").unwrap();
        let opts = RunOptions {
            csv_file_path: Some(path.to_string_lossy().into_owned()),
            ..RunOptions::default()
        };
        let err = build_iterations(&opts).unwrap_err();
        assert!(err.to_string().contains("no data rows"));
    }

    #[test]
    fn json_array_of_objects() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("data.json");
        let mut f = File::create(&path).unwrap();
        write!(f, r#"[{{"user":"alpha","count":3}},{{"user":"beta","count":4}}]"#).unwrap();

        let opts = RunOptions {
            json_file_path: Some(path.to_string_lossy().into_owned()),
            ..RunOptions::default()
        };
        let plan = build_iterations(&opts).unwrap();
        assert_eq!(plan.len(), 2);
        assert_eq!(plan[0].vars.get("user").map(String::as_str), Some("alpha"));
        assert_eq!(plan[0].vars.get("count").map(String::as_str), Some("3"));
        assert_eq!(plan[1].data.get("count"), Some(&Value::from(4)));
    }

    #[test]
    fn json_must_be_array_of_objects() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("bad.json");
        let mut f = File::create(&path).unwrap();
        write!(f, r#"{{"user":"alpha"}}"#).unwrap();
        let opts = RunOptions {
            json_file_path: Some(path.to_string_lossy().into_owned()),
            ..RunOptions::default()
        };
        let err = build_iterations(&opts).unwrap_err();
        assert!(err.to_string().contains("must be a JSON array"));
    }
}
