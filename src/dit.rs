//! The DIT router: maps a DN to the backend whose suffix is the deepest
//! RDN-wise match.

use std::sync::Arc;

use serde_yaml::Mapping;

use crate::backend::DataBackend;
use crate::config::Config;
use crate::dn::{parse_dn, Dn};
use crate::memory_backend::MemoryBackend;
use crate::result::{LdapError, Result};
use crate::schema::Schema;

struct DitNode {
    suffix: Dn,
    backend: Arc<dyn DataBackend>,
}

pub struct Dit {
    schema: Arc<Schema>,
    /// Sorted by descending RDN count, so the first suffix match is the
    /// deepest one.
    nodes: Vec<DitNode>,
}

impl Dit {
    pub fn new(dit_conf: &Mapping, schema: Arc<Schema>) -> Result<Dit> {
        let mut nodes = Vec::new();
        for (suffix, node_conf) in dit_conf {
            let suffix = suffix
                .as_str()
                .ok_or_else(|| LdapError::Config("DIT suffix must be a string".to_owned()))?;
            let conf = Config::from_value(node_conf.clone())?;
            let backend_type = conf.get_str("data_backend").unwrap_or("memory");
            let backend: Arc<dyn DataBackend> = match backend_type {
                "memory" => Arc::new(MemoryBackend::new(suffix, &conf, schema.clone())?),
                other => {
                    return Err(LdapError::Config(format!(
                        "unknown data backend type {}",
                        other
                    )))
                }
            };
            nodes.push(DitNode {
                suffix: parse_dn(suffix, &schema)?,
                backend,
            });
        }
        if nodes.is_empty() {
            return Err(LdapError::Config("no DIT nodes configured".to_owned()));
        }
        if nodes.iter().filter(|n| n.backend.is_default()).count() > 1 {
            return Err(LdapError::Config(
                "multiple DIT nodes marked as default".to_owned(),
            ));
        }
        nodes.sort_by(|a, b| b.suffix.len().cmp(&a.suffix.len()));
        Ok(Dit { schema, nodes })
    }

    pub fn schema(&self) -> &Arc<Schema> {
        &self.schema
    }

    /// Obtain the backend for a given DN.
    pub fn backend(&self, dn: &Dn) -> Result<&Arc<dyn DataBackend>> {
        for node in &self.nodes {
            if dn.ends_with(&node.suffix) {
                return Ok(&node.backend);
            }
        }
        Err(LdapError::NoSuchObject(format!(
            "could not find a backend to handle the DN {}",
            dn
        )))
    }

    /// Like [`backend()`](Dit::backend), parsing the DN first. The empty DN
    /// names the root DSE, which no backend serves.
    pub fn backend_for(&self, dn: &str) -> Result<&Arc<dyn DataBackend>> {
        let dn = parse_dn(dn, &self.schema)?;
        self.backend(&dn)
    }

    /// Canonical string form of every configured suffix.
    pub fn naming_contexts(&self) -> Vec<String> {
        self.nodes
            .iter()
            .map(|n| n.suffix.canonical())
            .collect()
    }

    /// The configured default, or the sole suffix if only one exists.
    pub fn default_naming_context(&self) -> Option<String> {
        if let Some(node) = self.nodes.iter().find(|n| n.backend.is_default()) {
            return Some(node.suffix.canonical());
        }
        if self.nodes.len() == 1 {
            return Some(self.nodes[0].suffix.canonical());
        }
        None
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::schema::test_schema;

    fn dit_from_yaml(yaml: &str) -> Result<Dit> {
        let value: serde_yaml::Value = serde_yaml::from_str(yaml).unwrap();
        Dit::new(value.as_mapping().unwrap(), test_schema())
    }

    #[test]
    fn deepest_suffix_wins() {
        let dit = dit_from_yaml(
            "o=example: {data_backend: memory}\nou=special,o=example: {data_backend: memory}\n",
        )
        .unwrap();
        let schema = dit.schema().clone();

        let dn = parse_dn("cn=a,ou=special,o=example", &schema).unwrap();
        let backend = dit.backend(&dn).unwrap();
        assert_eq!(backend.suffix_str(), "ou=special,o=example");

        let dn = parse_dn("cn=a,ou=other,o=example", &schema).unwrap();
        let backend = dit.backend(&dn).unwrap();
        assert_eq!(backend.suffix_str(), "o=example");

        let dn = parse_dn("cn=a,o=elsewhere", &schema).unwrap();
        assert!(matches!(
            dit.backend(&dn),
            Err(LdapError::NoSuchObject(_))
        ));
    }

    #[test]
    fn default_naming_context_rules() {
        let dit = dit_from_yaml("o=example: {data_backend: memory}\n").unwrap();
        assert_eq!(dit.default_naming_context().as_deref(), Some("o=example"));

        let dit = dit_from_yaml(
            "o=one: {data_backend: memory}\no=two: {data_backend: memory, default: true}\n",
        )
        .unwrap();
        assert_eq!(dit.default_naming_context().as_deref(), Some("o=two"));

        let dit = dit_from_yaml(
            "o=one: {data_backend: memory}\no=two: {data_backend: memory}\n",
        )
        .unwrap();
        assert_eq!(dit.default_naming_context(), None);
    }

    #[test]
    fn config_errors() {
        assert!(dit_from_yaml("{}").is_err());
        assert!(dit_from_yaml("o=x: {data_backend: exotic}\n").is_err());
        assert!(dit_from_yaml(
            "o=one: {data_backend: memory, default: true}\no=two: {data_backend: memory, default: true}\n"
        )
        .is_err());
    }
}
