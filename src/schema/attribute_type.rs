//! Attribute type definitions.

use std::sync::Arc;

use serde::Deserialize;

use super::{MatchingRule, Schema, SyntaxRule};
use crate::result::{LdapError, Result};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Deserialize)]
pub enum Usage {
    #[serde(rename = "userApplications")]
    UserApplications,
    #[serde(rename = "directoryOperation")]
    DirectoryOperation,
    #[serde(rename = "distributedOperation")]
    DistributedOperation,
    #[serde(rename = "dSAOperation", alias = "dsaOperation")]
    DsaOperation,
}

impl Default for Usage {
    fn default() -> Self {
        Usage::UserApplications
    }
}

#[derive(Clone, Debug, Deserialize)]
pub struct AttributeType {
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub desc: String,
    #[serde(default)]
    pub oid: Option<String>,
    #[serde(default)]
    pub syntax: Option<String>,
    #[serde(default)]
    pub equality_rule: Option<String>,
    #[serde(default)]
    pub ordering_rule: Option<String>,
    #[serde(default)]
    pub substrings_rule: Option<String>,
    #[serde(default)]
    pub single_value: bool,
    #[serde(default)]
    pub collective: bool,
    #[serde(default)]
    pub no_user_modification: bool,
    #[serde(default)]
    pub obsolete: bool,
    #[serde(default)]
    pub usage: Usage,
    #[serde(default)]
    pub inherits: Option<String>,
}

impl AttributeType {
    /// Definitions require one of `syntax` or `inherits`.
    pub fn check(&self) -> Result<()> {
        if self.syntax.is_none() && self.inherits.is_none() {
            return Err(LdapError::InvalidSchema(format!(
                "attribute type {} requires one of \"syntax\" or \"inherits\"",
                self.name
            )));
        }
        Ok(())
    }

    /// The default definition fabricated for attribute names absent from
    /// the catalog: octet-string syntax, bytewise equality.
    pub fn default_for(name: &str) -> AttributeType {
        AttributeType {
            name: name.to_owned(),
            desc: name.to_owned(),
            oid: None,
            syntax: Some("octetString".to_owned()),
            equality_rule: Some("octetStringMatch".to_owned()),
            ordering_rule: Some("octetStringOrderingMatch".to_owned()),
            substrings_rule: Some("octetStringMatch".to_owned()),
            single_value: false,
            collective: false,
            no_user_modification: false,
            obsolete: false,
            usage: Usage::UserApplications,
            inherits: None,
        }
    }

    pub fn syntax_rule(&self, schema: &Schema) -> Result<Arc<SyntaxRule>> {
        let syntax = self.syntax.as_deref().ok_or_else(|| {
            LdapError::InvalidSchema(format!("attribute type {} has no syntax", self.name))
        })?;
        schema.get_syntax_rule(syntax)
    }

    fn rule(&self, schema: &Schema, key: &str, name: &Option<String>) -> Result<Arc<MatchingRule>> {
        let rule = name.as_deref().ok_or_else(|| LdapError::NeededRule {
            attr: self.name.clone(),
            rule: key.to_owned(),
        })?;
        schema.get_matching_rule(rule)
    }

    pub fn equality_rule(&self, schema: &Schema) -> Result<Arc<MatchingRule>> {
        self.rule(schema, "equality_rule", &self.equality_rule)
    }

    pub fn ordering_rule(&self, schema: &Schema) -> Result<Arc<MatchingRule>> {
        self.rule(schema, "ordering_rule", &self.ordering_rule)
    }

    pub fn substrings_rule(&self, schema: &Schema) -> Result<Arc<MatchingRule>> {
        self.rule(schema, "substrings_rule", &self.substrings_rule)
    }

    /// Prepare a value with the equality rule, as done for RDN values.
    pub fn prepare_value(&self, schema: &Schema, value: &str) -> Result<String> {
        self.equality_rule(schema)?.prepare(value)
    }

    /// Validate a value list against this type.
    pub fn validate(&self, schema: &Schema, values: &[String]) -> Result<()> {
        if self.single_value && values.len() > 1 {
            return Err(LdapError::SchemaValidation(format!(
                "{} is single-value",
                self.name
            )));
        }
        let syntax = self.syntax_rule(schema)?;
        for value in values {
            syntax.validate(value).map_err(|_| {
                LdapError::SchemaValidation(format!(
                    "not a valid attribute value for {}",
                    self.desc
                ))
            })?;
        }
        Ok(())
    }
}
