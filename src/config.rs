//! YAML configuration with overlay semantics.
//!
//! Later loads merge into earlier ones: mappings merge key-wise, lists are
//! concatenated, scalars are overwritten. `${VAR}` references in the raw
//! text are substituted from the environment before parsing.

use std::env;
use std::fs;
use std::path::Path;

use lazy_static::lazy_static;
use regex::{Captures, Regex};
use serde_yaml::{Mapping, Value};

use crate::result::{LdapError, Result};

lazy_static! {
    static ref ENV_REF: Regex =
        Regex::new(r"\$\{([A-Za-z_][A-Za-z0-9_]*)\}").expect("env ref regex");
}

fn substitute_env(raw: &str) -> String {
    ENV_REF
        .replace_all(raw, |caps: &Captures| {
            env::var(&caps[1]).unwrap_or_else(|_| caps[0].to_owned())
        })
        .into_owned()
}

#[derive(Clone, Debug, Default)]
pub struct Config {
    root: Mapping,
}

impl Config {
    pub fn new() -> Config {
        Config::default()
    }

    pub fn from_value(value: Value) -> Result<Config> {
        match value {
            Value::Mapping(root) => Ok(Config { root }),
            _ => Err(LdapError::Config("config must be a mapping".to_owned())),
        }
    }

    pub fn load_file<P: AsRef<Path>>(&mut self, path: P) -> Result<()> {
        let raw = fs::read_to_string(path.as_ref()).map_err(|e| {
            LdapError::Config(format!("cannot read {}: {}", path.as_ref().display(), e))
        })?;
        self.load_str(&raw)
    }

    pub fn load_str(&mut self, raw: &str) -> Result<()> {
        let value: Value = serde_yaml::from_str(&substitute_env(raw))
            .map_err(|e| LdapError::Config(format!("invalid YAML: {}", e)))?;
        match value {
            Value::Mapping(data) => {
                merge_mapping(&mut self.root, data);
                Ok(())
            }
            Value::Null => Ok(()),
            _ => Err(LdapError::Config("config must be a mapping".to_owned())),
        }
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.root.get(&Value::String(key.to_owned()))
    }

    /// Traverse nested mappings by key, returning `None` on the first miss.
    pub fn mget(&self, keys: &[&str]) -> Option<&Value> {
        let mut current = self.root.get(&Value::String(keys.first()?.to_string()))?;
        for key in &keys[1..] {
            current = current
                .as_mapping()?
                .get(&Value::String((*key).to_owned()))?;
        }
        Some(current)
    }

    pub fn get_str(&self, key: &str) -> Option<&str> {
        self.get(key).and_then(Value::as_str)
    }

    pub fn get_bool(&self, key: &str, default: bool) -> bool {
        self.get(key).and_then(Value::as_bool).unwrap_or(default)
    }

    pub fn get_mapping(&self, key: &str) -> Option<&Mapping> {
        self.get(key).and_then(Value::as_mapping)
    }

    /// A nested mapping as its own `Config`.
    pub fn section(&self, key: &str) -> Option<Config> {
        self.get_mapping(key).map(|m| Config { root: m.clone() })
    }

    pub fn root(&self) -> &Mapping {
        &self.root
    }
}

/// Helper for turning arbitrary sub-values into `Config` sections.
pub fn value_config(value: &Value) -> Result<Config> {
    Config::from_value(value.clone())
}

fn merge_mapping(current: &mut Mapping, data: Mapping) {
    for (key, val) in data {
        match current.get_mut(&key) {
            Some(Value::Mapping(cur)) => {
                if let Value::Mapping(new) = val {
                    merge_mapping(cur, new);
                } else {
                    current.insert(key, val);
                }
            }
            Some(Value::Sequence(cur)) => {
                if let Value::Sequence(new) = val {
                    cur.extend(new);
                } else {
                    current.insert(key, val);
                }
            }
            Some(slot) => {
                *slot = val;
            }
            None => {
                current.insert(key, val);
            }
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn overlay_merges_dicts_extends_lists_overwrites_scalars() {
        let mut conf = Config::new();
        conf.load_str("a:\n  b:\n    c: d\n  e:\n    h: i\n").unwrap();
        conf.load_str("a:\n  e:\n    h: X\n  f: X\ng: X\n").unwrap();
        assert_eq!(conf.mget(&["a", "b", "c"]).unwrap().as_str(), Some("d"));
        assert_eq!(conf.mget(&["a", "e", "h"]).unwrap().as_str(), Some("X"));
        assert_eq!(conf.mget(&["a", "f"]).unwrap().as_str(), Some("X"));
        assert_eq!(conf.get("g").unwrap().as_str(), Some("X"));
    }

    #[test]
    fn overlay_concatenates_lists() {
        let mut conf = Config::new();
        conf.load_str("xs: [1, 2]\n").unwrap();
        conf.load_str("xs: [3]\n").unwrap();
        let xs: Vec<i64> = conf
            .get("xs")
            .unwrap()
            .as_sequence()
            .unwrap()
            .iter()
            .map(|v| v.as_i64().unwrap())
            .collect();
        assert_eq!(xs, vec![1, 2, 3]);
    }

    #[test]
    fn env_substitution() {
        std::env::set_var("LAURELIN_TEST_PORT", "1389");
        let mut conf = Config::new();
        conf.load_str("port: \"${LAURELIN_TEST_PORT}\"\nmissing: \"${LAURELIN_TEST_UNSET}\"\n")
            .unwrap();
        assert_eq!(conf.get_str("port"), Some("1389"));
        assert_eq!(conf.get_str("missing"), Some("${LAURELIN_TEST_UNSET}"));
    }

    #[test]
    fn non_mapping_rejected() {
        let mut conf = Config::new();
        assert!(conf.load_str("- just\n- a\n- list\n").is_err());
    }
}
