//! The schema registry.
//!
//! Four case-insensitive name-indexed catalogs plus a parallel OID index.
//! Loading is two-phase: parse + insert from the built-in YAML bundle and any
//! configured directory, then [`resolve()`](Schema::resolve) flattens
//! inheritance. The registry is constructed before any listener starts and
//! is read-only thereafter.

pub mod attribute_type;
pub mod matching_rule;
pub mod object_class;
pub mod syntax;

use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;

use log::warn;
use serde_yaml::Value;

pub use attribute_type::{AttributeType, Usage};
pub use matching_rule::{MatchingRule, PrepStep, RuleUsage};
pub use object_class::{ObjectClass, ObjectClassKind};
pub use syntax::SyntaxRule;

use crate::attrs::CaseIgnoreMap;
use crate::result::{LdapError, Result};

pub const OID_SYNTAX_OID: &str = "1.3.6.1.4.1.1466.115.121.1.38";

#[derive(Clone, Debug)]
pub enum SchemaElement {
    Syntax(Arc<SyntaxRule>),
    MatchingRule(Arc<MatchingRule>),
    AttributeType(Arc<AttributeType>),
    ObjectClass(Arc<ObjectClass>),
}

#[derive(Debug, Default)]
pub struct Schema {
    syntax_rules: CaseIgnoreMap<Arc<SyntaxRule>>,
    matching_rules: CaseIgnoreMap<Arc<MatchingRule>>,
    attribute_types: CaseIgnoreMap<Arc<AttributeType>>,
    object_classes: CaseIgnoreMap<Arc<ObjectClass>>,
    oids: HashMap<String, SchemaElement>,
}

impl Schema {
    /// A registry holding only the bootstrap elements required before any
    /// other schema loads.
    pub fn new() -> Schema {
        let mut schema = Schema::default();

        let oid_syntax = SyntaxRule::regex("oid", Some(OID_SYNTAX_OID), "OID", "{oid}")
            .expect("bootstrap oid syntax");
        schema.insert_syntax_rule(Arc::new(oid_syntax));

        schema.insert_attribute_type(Arc::new(AttributeType {
            name: "objectClass".to_owned(),
            desc: "object class".to_owned(),
            oid: Some("2.5.4.0".to_owned()),
            syntax: Some(OID_SYNTAX_OID.to_owned()),
            equality_rule: Some("objectIdentifierMatch".to_owned()),
            ordering_rule: None,
            substrings_rule: None,
            single_value: false,
            collective: false,
            no_user_modification: false,
            obsolete: false,
            usage: Usage::UserApplications,
            inherits: None,
        }));

        let mut top = ObjectClass {
            name: "top".to_owned(),
            desc: "top".to_owned(),
            oid: Some("2.5.6.0".to_owned()),
            kind: ObjectClassKind::Abstract,
            required_attributes: vec!["objectClass".to_owned()],
            allowed_attributes: Vec::new(),
            inherits: None,
            obsolete: false,
            required_attrs: Default::default(),
            allowed_attrs: Default::default(),
            extensible: false,
        };
        top.finish();
        schema.insert_object_class(Arc::new(top));

        let mut extensible = ObjectClass {
            name: "extensibleObject".to_owned(),
            desc: "extensibleObject".to_owned(),
            oid: Some(object_class::EXTENSIBLE_OBJECT_OID.to_owned()),
            kind: ObjectClassKind::Auxiliary,
            required_attributes: Vec::new(),
            allowed_attributes: Vec::new(),
            inherits: Some("top".to_owned()),
            obsolete: false,
            required_attrs: Default::default(),
            allowed_attrs: Default::default(),
            extensible: true,
        };
        extensible.finish();
        schema.insert_object_class(Arc::new(extensible));

        schema
    }

    fn insert_syntax_rule(&mut self, rule: Arc<SyntaxRule>) {
        if let Some(oid) = &rule.oid {
            self.oids
                .insert(oid.clone(), SchemaElement::Syntax(rule.clone()));
        }
        let name = rule.name.clone();
        self.syntax_rules.insert(&name, rule);
    }

    fn insert_matching_rule(&mut self, rule: Arc<MatchingRule>) {
        if let Some(oid) = &rule.oid {
            self.oids
                .insert(oid.clone(), SchemaElement::MatchingRule(rule.clone()));
        }
        let name = rule.name.clone();
        self.matching_rules.insert(&name, rule);
    }

    fn insert_attribute_type(&mut self, at: Arc<AttributeType>) {
        if let Some(oid) = &at.oid {
            self.oids
                .insert(oid.clone(), SchemaElement::AttributeType(at.clone()));
        }
        let name = at.name.clone();
        self.attribute_types.insert(&name, at);
    }

    fn insert_object_class(&mut self, oc: Arc<ObjectClass>) {
        if let Some(oid) = &oc.oid {
            self.oids
                .insert(oid.clone(), SchemaElement::ObjectClass(oc.clone()));
        }
        let name = oc.name.clone();
        self.object_classes.insert(&name, oc);
    }

    /// Load the built-in schema bundle.
    pub fn load_builtin(&mut self) -> Result<()> {
        self.load_str(include_str!("builtin/syntax.yaml"))?;
        self.load_str(include_str!("builtin/matching_rules.yaml"))?;
        self.load_str(include_str!("builtin/schema.yaml"))?;
        Ok(())
    }

    /// Load every `*.yaml` / `*.yml` file from a directory, sorted by name.
    pub fn load_dir(&mut self, dir: &Path) -> Result<()> {
        let entries = match std::fs::read_dir(dir) {
            Ok(entries) => entries,
            Err(_) => {
                warn!("no schema files found in {}", dir.display());
                return Ok(());
            }
        };
        let mut files: Vec<_> = entries
            .filter_map(|e| e.ok().map(|e| e.path()))
            .filter(|p| {
                matches!(
                    p.extension().and_then(|e| e.to_str()),
                    Some("yaml") | Some("yml")
                )
            })
            .collect();
        if files.is_empty() {
            warn!("no schema files found in {}", dir.display());
            return Ok(());
        }
        files.sort();
        for file in files {
            self.load_file(&file)?;
        }
        Ok(())
    }

    pub fn load_file(&mut self, path: &Path) -> Result<()> {
        let raw = std::fs::read_to_string(path)
            .map_err(|e| LdapError::SchemaLoad(format!("{}: {}", path.display(), e)))?;
        self.load_str(&raw)
    }

    pub fn load_str(&mut self, raw: &str) -> Result<()> {
        let data: Value = serde_yaml::from_str(raw)
            .map_err(|e| LdapError::SchemaLoad(format!("invalid YAML: {}", e)))?;
        self.load_value(data)
    }

    pub fn load_value(&mut self, data: Value) -> Result<()> {
        let mapping = match data {
            Value::Mapping(m) => m,
            _ => {
                return Err(LdapError::SchemaLoad(
                    "schema data must be a mapping".to_owned(),
                ))
            }
        };
        for (kind, elements) in mapping {
            let kind = kind
                .as_str()
                .ok_or_else(|| LdapError::SchemaLoad("element kind must be a string".to_owned()))?
                .to_owned();
            let elements = match elements {
                Value::Mapping(m) => m,
                _ => {
                    return Err(LdapError::SchemaLoad(format!(
                        "{} must be a mapping of name to params",
                        kind
                    )))
                }
            };
            for (name, params) in elements {
                let name = name
                    .as_str()
                    .ok_or_else(|| {
                        LdapError::SchemaLoad("element name must be a string".to_owned())
                    })?
                    .to_owned();
                self.load_element(&kind, &name, params)?;
            }
        }
        Ok(())
    }

    fn load_element(&mut self, kind: &str, name: &str, params: Value) -> Result<()> {
        match kind {
            "syntax_rules" => {
                let rule = SyntaxRule::from_params(name, params)?;
                self.insert_syntax_rule(Arc::new(rule));
            }
            "matching_rules" => {
                let mut rule: MatchingRule = serde_yaml::from_value(params)
                    .map_err(|e| LdapError::SchemaLoad(format!("matching rule {}: {}", name, e)))?;
                if rule.name.is_empty() {
                    rule.name = name.to_owned();
                }
                if rule.desc.is_empty() {
                    rule.desc = rule.name.clone();
                }
                self.insert_matching_rule(Arc::new(rule));
            }
            "attribute_types" => {
                let mut at: AttributeType = serde_yaml::from_value(params).map_err(|e| {
                    LdapError::SchemaLoad(format!("attribute type {}: {}", name, e))
                })?;
                if at.name.is_empty() {
                    at.name = name.to_owned();
                }
                if at.desc.is_empty() {
                    at.desc = at.name.clone();
                }
                at.check()?;
                self.insert_attribute_type(Arc::new(at));
            }
            "object_classes" => {
                let mut oc: ObjectClass = serde_yaml::from_value(params)
                    .map_err(|e| LdapError::SchemaLoad(format!("object class {}: {}", name, e)))?;
                if oc.name.is_empty() {
                    oc.name = name.to_owned();
                }
                if oc.desc.is_empty() {
                    oc.desc = oc.name.clone();
                }
                oc.finish();
                self.insert_object_class(Arc::new(oc));
            }
            _ => {
                return Err(LdapError::SchemaLoad(format!(
                    "unknown schema element kind {}",
                    kind
                )))
            }
        }
        Ok(())
    }

    /// Flatten all inheritance. Idempotent; call once after loading.
    pub fn resolve(&mut self) -> Result<()> {
        let names: Vec<String> = self.attribute_types.iter().map(|(k, _)| k.to_owned()).collect();
        for name in names {
            self.resolve_attribute_type(&name, &mut Vec::new())?;
        }
        let names: Vec<String> = self.object_classes.iter().map(|(k, _)| k.to_owned()).collect();
        for name in names {
            self.resolve_object_class(&name, &mut Vec::new())?;
        }
        Ok(())
    }

    fn resolve_attribute_type(
        &mut self,
        name: &str,
        visiting: &mut Vec<String>,
    ) -> Result<Arc<AttributeType>> {
        let at = self.attribute_types.get(name).cloned().ok_or_else(|| {
            LdapError::InvalidSchema(format!("missing inherited schema element {}", name))
        })?;
        let parent_name = match &at.inherits {
            Some(parent) => parent.clone(),
            None => return Ok(at),
        };
        let key = name.to_ascii_lowercase();
        if visiting.contains(&key) {
            return Err(LdapError::InvalidSchema(format!(
                "attribute type inheritance cycle at {}",
                name
            )));
        }
        visiting.push(key);
        let parent = self.resolve_attribute_type(&parent_name, visiting)?;
        visiting.pop();

        let mut resolved = (*at).clone();
        if resolved.syntax.is_none() {
            resolved.syntax = parent.syntax.clone();
        }
        if resolved.equality_rule.is_none() {
            resolved.equality_rule = parent.equality_rule.clone();
        }
        if resolved.ordering_rule.is_none() {
            resolved.ordering_rule = parent.ordering_rule.clone();
        }
        if resolved.substrings_rule.is_none() {
            resolved.substrings_rule = parent.substrings_rule.clone();
        }
        let resolved = Arc::new(resolved);
        self.insert_attribute_type(resolved.clone());
        Ok(resolved)
    }

    fn resolve_object_class(
        &mut self,
        name: &str,
        visiting: &mut Vec<String>,
    ) -> Result<Arc<ObjectClass>> {
        let oc = self.object_classes.get(name).cloned().ok_or_else(|| {
            LdapError::InvalidSchema(format!("missing inherited schema element {}", name))
        })?;
        let parent_name = match &oc.inherits {
            Some(parent) => parent.clone(),
            None => return Ok(oc),
        };
        let key = name.to_ascii_lowercase();
        if visiting.contains(&key) {
            return Err(LdapError::InvalidSchema(format!(
                "object class inheritance cycle at {}",
                name
            )));
        }
        visiting.push(key);
        let parent = self.resolve_object_class(&parent_name, visiting)?;
        visiting.pop();

        let mut resolved = (*oc).clone();
        resolved
            .required_attrs
            .extend(parent.required_attrs.iter().cloned());
        resolved
            .allowed_attrs
            .extend(parent.allowed_attrs.iter().cloned());
        let resolved = Arc::new(resolved);
        self.insert_object_class(resolved.clone());
        Ok(resolved)
    }

    fn is_oid(ident: &str) -> bool {
        ident.chars().next().map_or(false, |c| c.is_ascii_digit())
    }

    /// Look up an attribute type by name or OID. Unknown names get a default
    /// definition (octet-string syntax, bytewise equality); unknown OIDs
    /// fail.
    pub fn get_attribute_type(&self, ident: &str) -> Result<Arc<AttributeType>> {
        if Self::is_oid(ident) {
            return match self.oids.get(ident) {
                Some(SchemaElement::AttributeType(at)) => Ok(at.clone()),
                _ => Err(LdapError::UndefinedSchemaElement(ident.to_owned())),
            };
        }
        match self.attribute_types.get(ident) {
            Some(at) => Ok(at.clone()),
            None => Ok(Arc::new(AttributeType::default_for(ident))),
        }
    }

    pub fn get_object_class(&self, ident: &str) -> Result<Arc<ObjectClass>> {
        if Self::is_oid(ident) {
            return match self.oids.get(ident) {
                Some(SchemaElement::ObjectClass(oc)) => Ok(oc.clone()),
                _ => Err(LdapError::UndefinedSchemaElement(ident.to_owned())),
            };
        }
        self.object_classes
            .get(ident)
            .cloned()
            .ok_or_else(|| LdapError::UndefinedSchemaElement(ident.to_owned()))
    }

    pub fn get_matching_rule(&self, ident: &str) -> Result<Arc<MatchingRule>> {
        if Self::is_oid(ident) {
            return match self.oids.get(ident) {
                Some(SchemaElement::MatchingRule(mr)) => Ok(mr.clone()),
                _ => Err(LdapError::UndefinedSchemaElement(ident.to_owned())),
            };
        }
        self.matching_rules
            .get(ident)
            .cloned()
            .ok_or_else(|| LdapError::UndefinedSchemaElement(ident.to_owned()))
    }

    pub fn get_syntax_rule(&self, ident: &str) -> Result<Arc<SyntaxRule>> {
        if Self::is_oid(ident) {
            return match self.oids.get(ident) {
                Some(SchemaElement::Syntax(s)) => Ok(s.clone()),
                _ => Err(LdapError::UndefinedSchemaElement(ident.to_owned())),
            };
        }
        self.syntax_rules
            .get(ident)
            .cloned()
            .ok_or_else(|| LdapError::UndefinedSchemaElement(ident.to_owned()))
    }

    /// The virtual class combining every object class attached to an entry;
    /// required and allowed sets are the unions.
    pub fn merged_object_class<'a, I>(&self, names: I) -> Result<ObjectClass>
    where
        I: IntoIterator<Item = &'a str>,
    {
        let mut merged = ObjectClass::virtual_merged();
        for name in names {
            merged.merge(self.get_object_class(name)?.as_ref());
        }
        Ok(merged)
    }
}

/// A fully loaded and resolved registry for tests.
#[cfg(test)]
pub(crate) fn test_schema() -> Arc<Schema> {
    let mut schema = Schema::new();
    schema.load_builtin().expect("builtin schema");
    schema.resolve().expect("schema resolution");
    Arc::new(schema)
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::attrs::AttrsDict;

    #[test]
    fn inheritance_lifts_rules_and_unions_sets() {
        let schema = test_schema();
        // cn inherits name; the rule references come from the supertype
        let cn = schema.get_attribute_type("cn").unwrap();
        assert_eq!(cn.equality_rule.as_deref(), Some("caseIgnoreMatch"));
        assert_eq!(cn.syntax.as_deref(), Some("directoryString"));
        // person inherits top, so objectClass is required transitively
        let person = schema.get_object_class("person").unwrap();
        assert!(person.required_attrs.contains("objectclass"));
        assert!(person.required_attrs.contains("cn"));
        assert!(person.required_attrs.contains("sn"));
    }

    #[test]
    fn resolution_is_idempotent() {
        let mut schema = Schema::new();
        schema.load_builtin().unwrap();
        schema.resolve().unwrap();
        let before = schema.get_object_class("inetOrgPerson").unwrap();
        schema.resolve().unwrap();
        let after = schema.get_object_class("inetOrgPerson").unwrap();
        assert_eq!(before.required_attrs, after.required_attrs);
        assert_eq!(before.allowed_attrs, after.allowed_attrs);
    }

    #[test]
    fn undefined_names_fabricate_oids_fail() {
        let schema = test_schema();
        let made_up = schema.get_attribute_type("noSuchAttrAnywhere").unwrap();
        assert_eq!(made_up.syntax.as_deref(), Some("octetString"));
        assert_eq!(made_up.equality_rule.as_deref(), Some("octetStringMatch"));
        assert!(schema.get_attribute_type("2.999.1.2.3").is_err());
        assert!(schema.get_object_class("noSuchClass").is_err());
    }

    #[test]
    fn oid_lookup() {
        let schema = test_schema();
        let by_oid = schema.get_attribute_type("2.5.4.0").unwrap();
        assert_eq!(by_oid.name, "objectClass");
        let syntax = schema.get_syntax_rule(OID_SYNTAX_OID).unwrap();
        assert_eq!(syntax.name, "oid");
    }

    #[test]
    fn object_class_validation() {
        let schema = test_schema();
        let person = schema.get_object_class("person").unwrap();

        let mut attrs = AttrsDict::new(schema.clone());
        attrs.set("objectClass", vec!["top".into(), "person".into()]);
        attrs.set("cn", vec!["Test User".into()]);
        attrs.set("sn", vec!["User".into()]);
        person.validate(&schema, &attrs).unwrap();

        let mut missing = AttrsDict::new(schema.clone());
        missing.set("objectClass", vec!["person".into()]);
        missing.set("cn", vec!["Test User".into()]);
        assert!(person.validate(&schema, &missing).is_err());

        attrs.set("mail", vec!["u@example.org".into()]);
        assert!(person.validate(&schema, &attrs).is_err());
    }

    #[test]
    fn extensible_object_checks_usage_only() {
        let schema = test_schema();
        let merged = schema
            .merged_object_class(["extensibleObject"])
            .unwrap();
        let mut attrs = AttrsDict::new(schema.clone());
        attrs.set("objectClass", vec!["extensibleObject".into()]);
        attrs.set("whatever", vec!["goes".into()]);
        merged.validate(&schema, &attrs).unwrap();

        let mut operational = AttrsDict::new(schema.clone());
        operational.set("objectClass", vec!["extensibleObject".into()]);
        operational.set("namingContexts", vec!["o=example".into()]);
        assert!(merged.validate(&schema, &operational).is_err());
    }

    #[test]
    fn single_value_enforced() {
        let schema = test_schema();
        let display_name = schema.get_attribute_type("displayName").unwrap();
        display_name
            .validate(&schema, &["One Name".to_owned()])
            .unwrap();
        assert!(display_name
            .validate(&schema, &["One".to_owned(), "Two".to_owned()])
            .is_err());
    }

    #[test]
    fn inheritance_cycle_detected() {
        let mut schema = Schema::new();
        schema
            .load_str(
                "attribute_types:\n  attrA:\n    inherits: attrB\n  attrB:\n    inherits: attrA\n",
            )
            .unwrap();
        assert!(schema.resolve().is_err());
    }
}
