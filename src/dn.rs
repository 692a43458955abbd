//! Distinguished name model.
//!
//! A [`Dn`] is an ordered sequence of [`Rdn`]s from most-specific to suffix.
//! RDN attribute values are prepared with the attribute's equality rule at
//! parse time, so name comparison is schema-aware; the user-supplied original
//! string is kept for round-tripping in responses.

use std::collections::BTreeSet;
use std::fmt;

use crate::result::{LdapError, Result};
use crate::schema::Schema;

/// Split `s` on `sep` wherever the separator is not escaped by a backslash.
pub fn split_unescaped(s: &str, sep: char) -> Vec<String> {
    let mut parts = vec![String::new()];
    let mut escaped = false;
    for c in s.chars() {
        if escaped {
            parts.last_mut().expect("part").push(c);
            escaped = false;
        } else if c == '\\' {
            parts.last_mut().expect("part").push(c);
            escaped = true;
        } else if c == sep {
            parts.push(String::new());
        } else {
            parts.last_mut().expect("part").push(c);
        }
    }
    parts
}

/// Relative distinguished name: an unordered set of (attribute, prepared
/// value) pairs. Equality and hashing are set equality on the pairs.
#[derive(Clone, Debug, Default, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Rdn {
    avas: BTreeSet<(String, String)>,
}

impl Rdn {
    pub fn from_avas(avas: Vec<(String, String)>) -> Rdn {
        Rdn {
            avas: avas.into_iter().collect(),
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = &(String, String)> {
        self.avas.iter()
    }

    pub fn is_empty(&self) -> bool {
        self.avas.is_empty()
    }

    pub fn len(&self) -> usize {
        self.avas.len()
    }
}

impl fmt::Display for Rdn {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let joined = self
            .avas
            .iter()
            .map(|(a, v)| format!("{}={}", a, v))
            .collect::<Vec<_>>()
            .join("+");
        f.write_str(&joined)
    }
}

/// Distinguished name; most-specific RDN first.
#[derive(Clone, Debug, Default)]
pub struct Dn {
    rdns: Vec<Rdn>,
    original: Option<String>,
}

impl PartialEq for Dn {
    fn eq(&self, other: &Dn) -> bool {
        self.rdns == other.rdns
    }
}

impl Eq for Dn {}

impl std::hash::Hash for Dn {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        self.rdns.hash(state);
    }
}

impl Dn {
    pub fn from_rdns(rdns: Vec<Rdn>) -> Dn {
        Dn {
            rdns,
            original: None,
        }
    }

    pub fn rdns(&self) -> &[Rdn] {
        &self.rdns
    }

    pub fn len(&self) -> usize {
        self.rdns.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rdns.is_empty()
    }

    /// The most-specific RDN.
    pub fn first(&self) -> Option<&Rdn> {
        self.rdns.first()
    }

    /// Split into the most-specific RDN and the parent DN.
    pub fn split_first(&self) -> Result<(Rdn, Dn)> {
        let (first, rest) = self
            .rdns
            .split_first()
            .ok_or_else(|| LdapError::InvalidDn("empty DN cannot be split".to_owned()))?;
        Ok((first.clone(), Dn::from_rdns(rest.to_vec())))
    }

    /// The last `n` RDNs as a DN.
    pub fn suffix(&self, n: usize) -> Dn {
        let start = self.rdns.len().saturating_sub(n);
        Dn::from_rdns(self.rdns[start..].to_vec())
    }

    /// True if `suffix` is an RDN-wise suffix of this DN.
    pub fn ends_with(&self, suffix: &Dn) -> bool {
        suffix.len() <= self.len() && self.suffix(suffix.len()) == *suffix
    }

    /// Canonical string form, joined from RDN canonical forms.
    pub fn canonical(&self) -> String {
        self.rdns
            .iter()
            .map(|rdn| rdn.to_string())
            .collect::<Vec<_>>()
            .join(",")
    }
}

impl fmt::Display for Dn {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match &self.original {
            Some(original) => f.write_str(original),
            None => f.write_str(&self.canonical()),
        }
    }
}

/// Parse one RDN, preparing each attribute value with the attribute's
/// equality rule.
pub fn parse_rdn(rdn: &str, schema: &Schema) -> Result<Rdn> {
    if rdn.is_empty() {
        return Ok(Rdn::default());
    }
    let mut avas = Vec::new();
    for ava in split_unescaped(rdn, '+') {
        let parts = split_unescaped(&ava, '=');
        if parts.len() != 2 {
            return Err(LdapError::InvalidDn(
                "no equals sign or equals sign needs escaping in RDN".to_owned(),
            ));
        }
        let attr = parts[0].trim_start();
        let value = parts[1].as_str();
        let attr_type = schema.get_attribute_type(attr).map_err(|_| {
            LdapError::InvalidDn(format!("attribute type {} does not exist", attr))
        })?;
        let prepared = attr_type.prepare_value(schema, value).map_err(|e| match e {
            LdapError::NeededRule { attr, .. } => LdapError::InvalidDn(format!(
                "attribute type {} cannot be used for an RDN attribute because a matching rule \
                 is not available to compare values",
                attr
            )),
            e => e,
        })?;
        avas.push((attr.to_ascii_lowercase(), prepared));
    }
    Ok(Rdn::from_avas(avas))
}

/// Parse a DN string, most-specific RDN first.
pub fn parse_dn(dn: &str, schema: &Schema) -> Result<Dn> {
    if dn.is_empty() {
        return Ok(Dn {
            rdns: Vec::new(),
            original: Some(String::new()),
        });
    }
    let mut rdns = Vec::new();
    for rdn in split_unescaped(dn, ',') {
        rdns.push(parse_rdn(&rdn, schema)?);
    }
    Ok(Dn {
        rdns,
        original: Some(dn.to_owned()),
    })
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::schema::test_schema;

    #[test]
    fn split_unescaped_honors_escapes() {
        assert_eq!(split_unescaped("a,b,c", ','), vec!["a", "b", "c"]);
        assert_eq!(split_unescaped("a\\,b,c", ','), vec!["a\\,b", "c"]);
        assert_eq!(split_unescaped("", ','), vec![""]);
    }

    #[test]
    fn rdn_equality_is_set_equality() {
        let schema = test_schema();
        let a = parse_rdn("cn=web+ou=hosts", &schema).unwrap();
        let b = parse_rdn("ou=Hosts+cn=Web", &schema).unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn dn_equality_prepares_values() {
        let schema = test_schema();
        let a = parse_dn("cn=Some User,o=Example", &schema).unwrap();
        let b = parse_dn("CN=some  user,O=example", &schema).unwrap();
        assert_eq!(a, b);
        assert_eq!(a.to_string(), "cn=Some User,o=Example");
    }

    #[test]
    fn dn_suffix_matching() {
        let schema = test_schema();
        let dn = parse_dn("cn=a,ou=b,o=example", &schema).unwrap();
        let suffix = parse_dn("o=example", &schema).unwrap();
        let other = parse_dn("o=other", &schema).unwrap();
        assert!(dn.ends_with(&suffix));
        assert!(!dn.ends_with(&other));
        assert!(dn.ends_with(&dn));
    }

    #[test]
    fn split_first_yields_rdn_and_parent() {
        let schema = test_schema();
        let dn = parse_dn("cn=a,ou=b,o=example", &schema).unwrap();
        let (rdn, parent) = dn.split_first().unwrap();
        assert_eq!(rdn, parse_rdn("cn=a", &schema).unwrap());
        assert_eq!(parent, parse_dn("ou=b,o=example", &schema).unwrap());
    }

    #[test]
    fn missing_equals_is_invalid() {
        let schema = test_schema();
        assert!(matches!(
            parse_dn("nonsense,o=example", &schema),
            Err(crate::result::LdapError::InvalidDn(_))
        ));
    }

    #[test]
    fn undefined_attrs_get_default_definition() {
        // undefined names fall back to the octet-string default; only OID
        // lookups fail
        let schema = test_schema();
        assert!(parse_dn("abc=bcd,cn=test", &schema).is_ok());
        assert!(parse_dn("2.999.1=bcd,cn=test", &schema).is_err());
    }
}
