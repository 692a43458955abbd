//! Matching rules: value preparation pipelines plus comparison.
//!
//! A rule prepares both sides with its configured pipeline and then compares
//! per its usage (equality, ordering, substring). The preparation steps are
//! a pragmatic rendition of the RFC 4518 string preparation stages.

use serde::Deserialize;

use crate::dn::split_unescaped;
use crate::result::{LdapError, Result};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PrepStep {
    /// Values arrive as UTF-8; transcoding is the identity here.
    Transcode,
    /// Drop mapped-to-nothing characters, fold other whitespace to space.
    Map,
    /// `Map` plus case folding.
    MapCaseFold,
    Normalize,
    /// Reject values carrying prohibited code points.
    Prohibit,
    /// Collapse insignificant space.
    InsignificantSpace,
    /// Textual DN canonicalization for distinguishedNameMatch.
    ParseDn,
    None,
}

fn mapped_to_nothing(c: char) -> bool {
    matches!(c, '\u{00}'..='\u{08}' | '\u{0E}'..='\u{1F}' | '\u{7F}' | '\u{AD}')
}

fn map_chars(value: &str) -> String {
    value
        .chars()
        .filter(|c| !mapped_to_nothing(*c))
        .map(|c| if ('\u{09}'..='\u{0D}').contains(&c) { ' ' } else { c })
        .collect()
}

fn collapse_space(value: &str) -> String {
    value.split_whitespace().collect::<Vec<_>>().join(" ")
}

fn canonicalize_dn_text(value: &str) -> String {
    let rdns: Vec<String> = split_unescaped(value, ',')
        .iter()
        .map(|rdn| {
            let mut avas: Vec<String> = split_unescaped(rdn, '+')
                .iter()
                .map(|ava| ava.trim().to_lowercase())
                .collect();
            avas.sort();
            avas.join("+")
        })
        .collect();
    rdns.join(",")
}

impl PrepStep {
    fn apply(&self, value: String) -> Result<String> {
        Ok(match self {
            PrepStep::Transcode | PrepStep::Normalize | PrepStep::None => value,
            PrepStep::Map => map_chars(&value),
            PrepStep::MapCaseFold => map_chars(&value).to_lowercase(),
            PrepStep::Prohibit => {
                if value.contains(['\u{0}', '\u{FFFD}']) {
                    return Err(LdapError::SchemaValidation(
                        "prohibited character in value".to_owned(),
                    ));
                }
                value
            }
            PrepStep::InsignificantSpace => collapse_space(&value),
            PrepStep::ParseDn => canonicalize_dn_text(&value),
        })
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RuleUsage {
    Equality,
    Ordering,
    Substring,
}

impl Default for RuleUsage {
    fn default() -> Self {
        RuleUsage::Equality
    }
}

#[derive(Clone, Debug, Deserialize)]
pub struct MatchingRule {
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub desc: String,
    #[serde(default)]
    pub oid: Option<String>,
    #[serde(default)]
    pub syntax: Option<String>,
    #[serde(default)]
    pub usage: RuleUsage,
    #[serde(default)]
    pub prepare: Vec<PrepStep>,
}

impl MatchingRule {
    /// Run the preparation pipeline over a value.
    pub fn prepare(&self, value: &str) -> Result<String> {
        let mut out = value.to_owned();
        for step in &self.prepare {
            out = step.apply(out)?;
        }
        Ok(out)
    }

    pub fn equals(&self, value: &str, assertion: &str) -> Result<bool> {
        Ok(self.prepare(value)? == self.prepare(assertion)?)
    }

    /// Ordering comparison: numeric when both prepared sides parse as
    /// integers, lexicographic otherwise.
    pub fn less_than(&self, value: &str, assertion: &str) -> Result<bool> {
        let value = self.prepare(value)?;
        let assertion = self.prepare(assertion)?;
        match (value.parse::<i64>(), assertion.parse::<i64>()) {
            (Ok(v), Ok(a)) => Ok(v < a),
            _ => Ok(value < assertion),
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn rule(prepare: Vec<PrepStep>) -> MatchingRule {
        MatchingRule {
            name: "testMatch".to_owned(),
            desc: "test".to_owned(),
            oid: None,
            syntax: None,
            usage: RuleUsage::Equality,
            prepare,
        }
    }

    #[test]
    fn case_fold_and_space_collapse() {
        let r = rule(vec![
            PrepStep::Transcode,
            PrepStep::MapCaseFold,
            PrepStep::Normalize,
            PrepStep::Prohibit,
            PrepStep::InsignificantSpace,
        ]);
        assert!(r.equals("Some  User ", "some user").unwrap());
        assert!(!r.equals("some user", "some users").unwrap());
    }

    #[test]
    fn case_exact_preserves_case() {
        let r = rule(vec![PrepStep::Map, PrepStep::InsignificantSpace]);
        assert!(!r.equals("Some User", "some user").unwrap());
        assert!(r.equals("Some  User", "Some User").unwrap());
    }

    #[test]
    fn numeric_ordering() {
        let r = rule(vec![PrepStep::None]);
        assert!(r.less_than("9", "10").unwrap());
        assert!(!r.less_than("10", "9").unwrap());
        // lexicographic fallback
        assert!(r.less_than("abc", "abd").unwrap());
    }

    #[test]
    fn dn_canonicalization() {
        let r = rule(vec![PrepStep::ParseDn]);
        assert!(r
            .equals("CN=Web+OU=Hosts, O=Example", "ou=hosts+cn=web,o=example")
            .unwrap());
    }

    #[test]
    fn prohibited_character() {
        let r = rule(vec![PrepStep::Prohibit]);
        assert!(r.prepare("ok value").is_ok());
        assert!(r.prepare("bad\u{0}value").is_err());
    }
}
