//! Syntax rules: the lexical shape of valid attribute values.
//!
//! A rule is one of: an anchored regex (with named subpattern expansion), the
//! octet-string sink, or a named custom implementation (telephone and
//! facsimile number normalization).

use std::collections::BTreeMap;

use regex::Regex;
use serde::Deserialize;
use serde_yaml::Value;

use crate::result::{LdapError, Result};

pub const TELEPHONE_NUMBER_OID: &str = "1.3.6.1.4.1.1466.115.121.1.50";
pub const FACSIMILE_NUMBER_OID: &str = "1.3.6.1.4.1.1466.115.121.1.22";

/// Subpatterns available to every regex syntax, named after RFC 4512
/// productions.
fn builtin_subpatterns() -> BTreeMap<String, String> {
    let mut subs = BTreeMap::new();
    subs.insert("keystring".to_owned(), "[A-Za-z][A-Za-z0-9-]*".to_owned());
    subs.insert("numericoid".to_owned(), r"[0-9]+(?:\.[0-9]+)*".to_owned());
    subs.insert(
        "oid".to_owned(),
        r"(?:[A-Za-z][A-Za-z0-9-]*|[0-9]+(?:\.[0-9]+)*)".to_owned(),
    );
    subs
}

/// Expand `{name}` references. Regex repetition braces (`{2}`, `{1,5}`)
/// don't look like identifiers and pass through untouched.
fn expand_subpatterns(pattern: &str, subs: &BTreeMap<String, String>) -> Result<String> {
    let reference = Regex::new(r"\{([A-Za-z_][A-Za-z0-9_]*)\}").expect("subpattern regex");
    let mut out = pattern.to_owned();
    for _ in 0..16 {
        let mut replaced = false;
        let mut next = String::with_capacity(out.len());
        let mut last = 0;
        for caps in reference.captures_iter(&out) {
            let whole = caps.get(0).expect("capture");
            let name = &caps[1];
            let sub = subs.get(name).ok_or_else(|| {
                LdapError::InvalidSchema(format!("unknown syntax subpattern {{{}}}", name))
            })?;
            next.push_str(&out[last..whole.start()]);
            next.push_str(sub);
            last = whole.end();
            replaced = true;
        }
        next.push_str(&out[last..]);
        out = next;
        if !replaced {
            break;
        }
    }
    Ok(out)
}

#[derive(Debug)]
enum SyntaxKind {
    Regex(Regex),
    OctetString,
    Telephone,
    Facsimile,
}

#[derive(Debug)]
pub struct SyntaxRule {
    pub name: String,
    pub desc: String,
    pub oid: Option<String>,
    kind: SyntaxKind,
}

#[derive(Debug, Deserialize)]
struct SyntaxParams {
    #[serde(default)]
    desc: Option<String>,
    #[serde(default)]
    oid: Option<String>,
    #[serde(default)]
    regex: Option<String>,
    #[serde(default)]
    subpatterns: BTreeMap<String, String>,
    #[serde(default)]
    octet_string: bool,
    #[serde(default)]
    custom: bool,
    #[serde(default)]
    peg: Option<String>,
}

impl SyntaxRule {
    pub fn regex(name: &str, oid: Option<&str>, desc: &str, pattern: &str) -> Result<SyntaxRule> {
        Self::compile_regex(name, oid, desc, pattern, &BTreeMap::new())
    }

    fn compile_regex(
        name: &str,
        oid: Option<&str>,
        desc: &str,
        pattern: &str,
        subpatterns: &BTreeMap<String, String>,
    ) -> Result<SyntaxRule> {
        let mut subs = builtin_subpatterns();
        for (sub_name, sub_pattern) in subpatterns {
            subs.insert(sub_name.clone(), sub_pattern.clone());
        }
        let expanded = expand_subpatterns(pattern, &subs)?;
        let anchored = format!("^(?:{})$", expanded);
        let re = Regex::new(&anchored).map_err(|_| {
            LdapError::InvalidSchema(format!("failed to compile regex syntax for {}", name))
        })?;
        Ok(SyntaxRule {
            name: name.to_owned(),
            desc: desc.to_owned(),
            oid: oid.map(str::to_owned),
            kind: SyntaxKind::Regex(re),
        })
    }

    pub fn from_params(name: &str, params: Value) -> Result<SyntaxRule> {
        let params: SyntaxParams = serde_yaml::from_value(params)
            .map_err(|e| LdapError::SchemaLoad(format!("syntax rule {}: {}", name, e)))?;
        let desc = params.desc.unwrap_or_else(|| name.to_owned());
        if params.peg.is_some() {
            return Err(LdapError::InvalidSchema(format!(
                "PEG grammar syntaxes are not supported ({})",
                name
            )));
        }
        if let Some(pattern) = params.regex {
            return Self::compile_regex(
                name,
                params.oid.as_deref(),
                &desc,
                &pattern,
                &params.subpatterns,
            );
        }
        if params.octet_string {
            return Ok(SyntaxRule {
                name: name.to_owned(),
                desc,
                oid: params.oid,
                kind: SyntaxKind::OctetString,
            });
        }
        if params.custom {
            let oid = params.oid.clone().ok_or_else(|| {
                LdapError::InvalidSchema(
                    "oid is required for custom syntax implementations".to_owned(),
                )
            })?;
            let kind = match oid.as_str() {
                TELEPHONE_NUMBER_OID => SyntaxKind::Telephone,
                FACSIMILE_NUMBER_OID => SyntaxKind::Facsimile,
                _ => {
                    return Err(LdapError::InvalidSchema(format!(
                        "no custom syntax implementation for {}",
                        oid
                    )))
                }
            };
            return Ok(SyntaxRule {
                name: name.to_owned(),
                desc,
                oid: params.oid,
                kind,
            });
        }
        Err(LdapError::InvalidSchema(format!(
            "syntax implementation unknown for {}",
            name
        )))
    }

    fn parse_error(&self, value: &str) -> LdapError {
        LdapError::SyntaxParse {
            value: value.to_owned(),
            syntax: self.desc.clone(),
        }
    }

    pub fn validate(&self, value: &str) -> Result<()> {
        match &self.kind {
            SyntaxKind::Regex(re) => {
                if re.is_match(value) {
                    Ok(())
                } else {
                    Err(self.parse_error(value))
                }
            }
            SyntaxKind::OctetString => Ok(()),
            SyntaxKind::Telephone => normalize_phone_number(value)
                .map(|_| ())
                .map_err(|_| self.parse_error(value)),
            SyntaxKind::Facsimile => {
                let mut params = value.split('$');
                let number = params.next().unwrap_or("");
                normalize_phone_number(number).map_err(|_| self.parse_error(value))?;
                for param in params {
                    if !FAX_PARAMETERS.contains(&param.to_ascii_lowercase().as_str()) {
                        return Err(self.parse_error(value));
                    }
                }
                Ok(())
            }
        }
    }
}

const FAX_PARAMETERS: &[&str] = &[
    "twodimensional",
    "fineresolution",
    "unlimitedlength",
    "b4length",
    "a3width",
    "b4width",
    "uncompressed",
];

/// Strip separators from a telephone number and check its shape.
pub fn normalize_phone_number(value: &str) -> Result<String> {
    let mut s: String = value.chars().filter(|c| c.is_ascii_digit() || *c == '+').collect();
    let has_plus = s.starts_with('+');
    if has_plus {
        s.remove(0);
    }
    if s.contains('+') || !s.chars().all(|c| c.is_ascii_digit()) {
        return Err(LdapError::SchemaValidation("invalid phone number".to_owned()));
    }
    let len = s.len();
    if !(7..=15).contains(&len) {
        return Err(LdapError::SchemaValidation("invalid phone number".to_owned()));
    }
    if has_plus {
        s.insert(0, '+');
    }
    Ok(s)
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn oid_regex_syntax() {
        let rule = SyntaxRule::regex("oid", Some("1.3.6.1.4.1.1466.115.121.1.38"), "OID", "{oid}")
            .unwrap();
        assert!(rule.validate("2.5.4.0").is_ok());
        assert!(rule.validate("inetOrgPerson").is_ok());
        assert!(rule.validate("not an oid!").is_err());
    }

    #[test]
    fn subpattern_expansion_keeps_repetitions() {
        let mut subs = BTreeMap::new();
        subs.insert("digit".to_owned(), "[0-9]".to_owned());
        let expanded = expand_subpatterns("{digit}{2,4}", &subs).unwrap();
        assert_eq!(expanded, "[0-9]{2,4}");
        assert!(expand_subpatterns("{nosuch}", &subs).is_err());
    }

    #[test]
    fn octet_string_accepts_anything() {
        let rule = SyntaxRule::from_params(
            "octetString",
            serde_yaml::from_str("octet_string: true").unwrap(),
        )
        .unwrap();
        assert!(rule.validate("\u{1}\u{2}anything").is_ok());
    }

    #[test]
    fn telephone_normalization() {
        assert_eq!(
            normalize_phone_number("+1 (555) 123-4567").unwrap(),
            "+15551234567"
        );
        assert!(normalize_phone_number("123").is_err());
        let rule = SyntaxRule::from_params(
            "telephoneNumber",
            serde_yaml::from_str(&format!("custom: true\noid: {}", TELEPHONE_NUMBER_OID)).unwrap(),
        )
        .unwrap();
        assert!(rule.validate("+1 555 123 4567").is_ok());
        assert!(rule.validate("nonsense").is_err());
    }

    #[test]
    fn facsimile_parameters() {
        let rule = SyntaxRule::from_params(
            "facsimileTelephoneNumber",
            serde_yaml::from_str(&format!("custom: true\noid: {}", FACSIMILE_NUMBER_OID)).unwrap(),
        )
        .unwrap();
        assert!(rule.validate("+15551234567$fineResolution").is_ok());
        assert!(rule.validate("+15551234567$wat").is_err());
    }

    #[test]
    fn peg_rules_rejected() {
        let res = SyntaxRule::from_params(
            "pegThing",
            serde_yaml::from_str("peg: \"expr = term\"").unwrap(),
        );
        assert!(res.is_err());
    }
}
