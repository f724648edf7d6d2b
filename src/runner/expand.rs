//! `{{var}}` expansion against a merged variable map with OS-environment
//! read-through. Expansion is single-pass: expanded values are opaque and are
//! never re-scanned for placeholders.

use std::collections::HashMap;

use crate::parser::var_pattern;

#[derive(Debug, Default)]
pub struct Expander {
    vars: HashMap<String, String>,
    // keys written during execution (scripts, varsPost); sequential mode
    // publishes these back to the iteration map so later cases see them
    mutated: HashMap<String, String>,
}

impl Expander {
    pub fn new(vars: &HashMap<String, String>) -> Self {
        Self {
            vars: vars.clone(),
            mutated: HashMap::new(),
        }
    }

    /// Looks up a name. `process.env.`-prefixed names read the OS environment
    /// for the suffix; other names consult the local map first, then fall back
    /// to the OS environment.
    pub fn get(&self, key: &str) -> Option<String> {
        if let Some(suffix) = key.strip_prefix("process.env.") {
            return std::env::var(suffix).ok();
        }
        if let Some(v) = self.vars.get(key) {
            return Some(v.clone());
        }
        std::env::var(key).ok()
    }

    /// Sets a name in the local map only and records the mutation.
    pub fn set(&mut self, key: &str, val: &str) {
        self.vars.insert(key.to_string(), val.to_string());
        self.mutated.insert(key.to_string(), val.to_string());
    }

    /// Merges a map in without recording mutations (seeding, varsPre).
    pub fn seed(&mut self, vars: &HashMap<String, String>) {
        for (k, v) in vars {
            self.vars.insert(k.clone(), v.clone());
        }
    }

    pub fn unset(&mut self, key: &str) {
        self.vars.remove(key);
        self.mutated.remove(key);
    }

    /// Replaces every `{{name}}` with its value; unknown names stay literal so
    /// callers can detect them.
    pub fn expand(&self, s: &str) -> String {
        var_pattern()
            .replace_all(s, |caps: &regex::Captures<'_>| {
                let inner = caps[1].trim();
                self.get(inner).unwrap_or_else(|| caps[0].to_string())
            })
            .into_owned()
    }

    /// Snapshot of the current map (used to build `process.env`).
    pub fn vars(&self) -> &HashMap<String, String> {
        &self.vars
    }

    /// Keys written through [`set`](Self::set) during this case.
    pub fn mutations(&self) -> &HashMap<String, String> {
        &self.mutated
    }
}

/// Names of `{{var}}` placeholders still present in `s` after expansion.
pub fn unresolved_names(s: &str) -> Vec<String> {
    var_pattern()
        .captures_iter(s)
        .map(|c| c[1].trim().to_string())
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn expander(pairs: &[(&str, &str)]) -> Expander {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        Expander::new(&map)
    }

    #[test]
    fn expands_known_names() {
        let exp = expander(&[("baseUrl", "http://x"), ("id", "7")]);
        assert_eq!(exp.expand("{{baseUrl}}/users/{{id}}"), "http://x/users/7");
    }

    #[test]
    fn unknown_names_stay_literal() {
        let exp = expander(&[]);
        assert_eq!(exp.expand("{{nope_gru_test}}/x"), "{{nope_gru_test}}/x");
        assert_eq!(unresolved_names("{{a}}/{{ b }}"), vec!["a", "b"]);
    }

    #[test]
    fn expansion_is_single_pass() {
        let exp = expander(&[("a", "{{b}}"), ("b", "v")]);
        assert_eq!(exp.expand("{{a}}"), "{{b}}");
    }

    #[test]
    fn process_env_prefix_reads_os_environment() {
        std::env::set_var("GRU_EXPAND_TEST_1", "os-value");
        let exp = expander(&[("GRU_EXPAND_TEST_1", "local-value")]);
        assert_eq!(
            exp.get("process.env.GRU_EXPAND_TEST_1").as_deref(),
            Some("os-value")
        );
        assert_eq!(exp.get("GRU_EXPAND_TEST_1").as_deref(), Some("local-value"));
        std::env::remove_var("GRU_EXPAND_TEST_1");
    }

    #[test]
    fn os_environment_fallback() {
        std::env::set_var("GRU_EXPAND_TEST_2", "fallback");
        let exp = expander(&[]);
        assert_eq!(exp.expand("{{GRU_EXPAND_TEST_2}}"), "fallback");
        std::env::remove_var("GRU_EXPAND_TEST_2");
    }

    #[test]
    fn set_records_mutations() {
        let mut exp = expander(&[("seeded", "1")]);
        exp.set("token", "abc");
        assert_eq!(exp.get("token").as_deref(), Some("abc"));
        assert_eq!(exp.mutations().len(), 1);
        assert!(exp.mutations().contains_key("token"));
        exp.unset("token");
        assert!(exp.mutations().is_empty());
    }
}
