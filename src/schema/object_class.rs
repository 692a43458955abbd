//! Object class definitions and attribute-set validation.

use std::collections::BTreeSet;

use serde::Deserialize;

use super::{Schema, Usage};
use crate::attrs::AttrsDict;
use crate::result::{LdapError, Result};

pub const EXTENSIBLE_OBJECT_OID: &str = "1.3.6.1.4.1.1466.101.120.111";

#[derive(Clone, Copy, Debug, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ObjectClassKind {
    Abstract,
    Structural,
    Auxiliary,
}

impl Default for ObjectClassKind {
    fn default() -> Self {
        ObjectClassKind::Structural
    }
}

#[derive(Clone, Debug, Deserialize)]
pub struct ObjectClass {
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub desc: String,
    #[serde(default)]
    pub oid: Option<String>,
    #[serde(default, rename = "type")]
    pub kind: ObjectClassKind,
    #[serde(default)]
    pub required_attributes: Vec<String>,
    #[serde(default)]
    pub allowed_attributes: Vec<String>,
    #[serde(default)]
    pub inherits: Option<String>,
    #[serde(default)]
    pub obsolete: bool,
    /// Lowercased views of the attribute lists, kept current by `finish()`
    /// and inheritance resolution.
    #[serde(skip)]
    pub required_attrs: BTreeSet<String>,
    #[serde(skip)]
    pub allowed_attrs: BTreeSet<String>,
    /// extensibleObject semantics: any userApplications attribute goes.
    #[serde(skip)]
    pub extensible: bool,
}

impl ObjectClass {
    /// Populate the lowercased attribute sets after deserialization.
    pub fn finish(&mut self) {
        self.required_attrs = self
            .required_attributes
            .iter()
            .map(|a| a.to_ascii_lowercase())
            .collect();
        self.allowed_attrs = self
            .allowed_attributes
            .iter()
            .map(|a| a.to_ascii_lowercase())
            .collect();
    }

    /// Base for the virtual class combining all classes on one entry.
    pub fn virtual_merged() -> ObjectClass {
        ObjectClass {
            name: "virtualMergedObjectClass".to_owned(),
            desc: "combined object classes".to_owned(),
            oid: None,
            kind: ObjectClassKind::Structural,
            required_attributes: Vec::new(),
            allowed_attributes: Vec::new(),
            inherits: None,
            obsolete: false,
            required_attrs: BTreeSet::new(),
            allowed_attrs: BTreeSet::new(),
            extensible: false,
        }
    }

    /// Combine another class into this one.
    pub fn merge(&mut self, other: &ObjectClass) {
        self.required_attrs
            .extend(other.required_attrs.iter().cloned());
        self.allowed_attrs
            .extend(other.allowed_attrs.iter().cloned());
        self.extensible |= other.extensible;
    }

    /// Ensure a set of attributes conforms to this class, then validate each
    /// value list against its attribute type.
    pub fn validate(&self, schema: &Schema, attrs: &AttrsDict) -> Result<()> {
        let present: BTreeSet<String> = attrs.keys_lower().map(str::to_owned).collect();

        if self.extensible {
            for attr in &present {
                let attr_type = schema.get_attribute_type(attr)?;
                if attr_type.usage != Usage::UserApplications {
                    return Err(LdapError::SchemaValidation(
                        "non-user attribute on extensibleObject".to_owned(),
                    ));
                }
            }
        } else {
            let missing: Vec<&str> = self
                .required_attrs
                .difference(&present)
                .map(String::as_str)
                .collect();
            if !missing.is_empty() {
                return Err(LdapError::SchemaValidation(format!(
                    "missing required attributes: {}",
                    missing.join(", ")
                )));
            }
            let not_allowed: Vec<&str> = present
                .iter()
                .filter(|a| !self.required_attrs.contains(*a) && !self.allowed_attrs.contains(*a))
                .map(String::as_str)
                .collect();
            if !not_allowed.is_empty() {
                return Err(LdapError::SchemaValidation(format!(
                    "attribute types are not allowed: {}",
                    not_allowed.join(", ")
                )));
            }
        }

        self.attr_type_validate(schema, attrs)
    }

    fn attr_type_validate(&self, schema: &Schema, attrs: &AttrsDict) -> Result<()> {
        for (attr, values) in attrs.iter() {
            let attr_type = schema.get_attribute_type(attr)?;
            attr_type.validate(schema, values.values())?;
        }
        Ok(())
    }
}
