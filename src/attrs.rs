//! Case-insensitive attribute maps and matching-rule aware value lists.

use std::collections::HashMap;
use std::sync::Arc;

use crate::result::Result;
use crate::schema::{AttributeType, MatchingRule, Schema};

/// Minimum similarity ratio (0-100) for an approximate match to succeed.
pub const APPROX_MATCH_MIN_RATIO: f64 = 75.0;

/// A map whose keys compare case-insensitively while preserving the
/// first-seen spelling.
#[derive(Clone, Debug)]
pub struct CaseIgnoreMap<V> {
    inner: HashMap<String, (String, V)>,
}

impl<V> Default for CaseIgnoreMap<V> {
    fn default() -> Self {
        CaseIgnoreMap {
            inner: HashMap::new(),
        }
    }
}

impl<V> CaseIgnoreMap<V> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, key: &str, value: V) -> Option<V> {
        self.inner
            .insert(key.to_ascii_lowercase(), (key.to_owned(), value))
            .map(|(_, v)| v)
    }

    pub fn get(&self, key: &str) -> Option<&V> {
        self.inner.get(&key.to_ascii_lowercase()).map(|(_, v)| v)
    }

    pub fn get_mut(&mut self, key: &str) -> Option<&mut V> {
        self.inner
            .get_mut(&key.to_ascii_lowercase())
            .map(|(_, v)| v)
    }

    pub fn remove(&mut self, key: &str) -> Option<V> {
        self.inner.remove(&key.to_ascii_lowercase()).map(|(_, v)| v)
    }

    pub fn contains_key(&self, key: &str) -> bool {
        self.inner.contains_key(&key.to_ascii_lowercase())
    }

    /// Iterate as (first-seen key spelling, value).
    pub fn iter(&self) -> impl Iterator<Item = (&str, &V)> {
        self.inner.values().map(|(k, v)| (k.as_str(), v))
    }

    pub fn values(&self) -> impl Iterator<Item = &V> {
        self.inner.values().map(|(_, v)| v)
    }

    pub fn keys_lower(&self) -> impl Iterator<Item = &str> {
        self.inner.keys().map(|k| k.as_str())
    }

    pub fn len(&self) -> usize {
        self.inner.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.is_empty()
    }
}

/// Ordered list of values bound to one attribute type.
///
/// All comparisons go through the attribute's matching rules, so two values
/// are "the same" when the equality rule says so after preparation, not when
/// they are byte-identical.
#[derive(Clone, Debug)]
pub struct AttrValueList {
    attr: String,
    values: Vec<String>,
    schema: Arc<Schema>,
}

impl AttrValueList {
    pub fn new(schema: Arc<Schema>, attr: &str) -> AttrValueList {
        AttrValueList {
            attr: attr.to_owned(),
            values: Vec::new(),
            schema,
        }
    }

    pub fn from_values(schema: Arc<Schema>, attr: &str, values: Vec<String>) -> AttrValueList {
        AttrValueList {
            attr: attr.to_owned(),
            values,
            schema,
        }
    }

    pub fn attr(&self) -> &str {
        &self.attr
    }

    pub fn values(&self) -> &[String] {
        &self.values
    }

    pub fn iter(&self) -> impl Iterator<Item = &String> {
        self.values.iter()
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    pub fn set_values(&mut self, values: Vec<String>) {
        self.values = values;
    }

    fn attr_type(&self) -> Result<Arc<AttributeType>> {
        self.schema.get_attribute_type(&self.attr)
    }

    fn equality_rule(&self) -> Result<Arc<MatchingRule>> {
        self.attr_type()?.equality_rule(&self.schema)
    }

    /// Position of the first value equal to `assertion` per the equality rule.
    pub fn index_of(&self, assertion: &str) -> Result<Option<usize>> {
        let equal = self.equality_rule()?;
        for (i, value) in self.values.iter().enumerate() {
            if equal.equals(value, assertion)? {
                return Ok(Some(i));
            }
        }
        Ok(None)
    }

    pub fn equals(&self, assertion: &str) -> Result<bool> {
        Ok(self.index_of(assertion)?.is_some())
    }

    /// Append `value` unless an equal value is already present.
    pub fn push_unique(&mut self, value: String) -> Result<bool> {
        if self.index_of(&value)?.is_some() {
            return Ok(false);
        }
        self.values.push(value);
        Ok(true)
    }

    /// Remove the first value equal to `assertion`. Returns whether a value
    /// was removed.
    pub fn remove_value(&mut self, assertion: &str) -> Result<bool> {
        match self.index_of(assertion)? {
            Some(i) => {
                self.values.remove(i);
                Ok(true)
            }
            None => Ok(false),
        }
    }

    /// True if any value orders strictly below `assertion`.
    pub fn less_than(&self, assertion: &str) -> Result<bool> {
        let ordering = self.attr_type()?.ordering_rule(&self.schema)?;
        for value in &self.values {
            if ordering.less_than(value, assertion)? {
                return Ok(true);
            }
        }
        Ok(false)
    }

    /// Match a substring assertion against any value.
    ///
    /// The concatenated pattern is anchored; a missing initial or final
    /// component relaxes the corresponding anchor to a lazy wildcard.
    pub fn match_substrings(
        &self,
        initial: Option<&str>,
        any: &[String],
        fin: Option<&str>,
    ) -> Result<bool> {
        let rule = self.attr_type()?.substrings_rule(&self.schema)?;
        let mut parts = Vec::with_capacity(any.len() + 2);
        parts.push(match initial {
            Some(i) => regex::escape(&rule.prepare(i)?),
            None => String::new(),
        });
        for sub in any {
            parts.push(regex::escape(&rule.prepare(sub)?));
        }
        parts.push(match fin {
            Some(f) => regex::escape(&rule.prepare(f)?),
            None => String::new(),
        });
        let pattern = format!("^{}$", parts.join(".*?"));
        let re = regex::Regex::new(&pattern)
            .map_err(|e| crate::result::LdapError::Internal(format!("substring pattern: {}", e)))?;
        for value in &self.values {
            if re.is_match(&rule.prepare(value)?) {
                return Ok(true);
            }
        }
        Ok(false)
    }

    /// Fuzzy equality via the equality rule's preparation and a string
    /// similarity score against [`APPROX_MATCH_MIN_RATIO`].
    pub fn match_approx(&self, assertion: &str) -> Result<bool> {
        let equal = self.equality_rule()?;
        let assertion = equal.prepare(assertion)?;
        for value in &self.values {
            let value = equal.prepare(value)?;
            if strsim::normalized_levenshtein(&value, &assertion) * 100.0
                >= APPROX_MATCH_MIN_RATIO
            {
                return Ok(true);
            }
        }
        Ok(false)
    }
}

/// Case-insensitive mapping from attribute type name to a value list.
#[derive(Clone, Debug)]
pub struct AttrsDict {
    schema: Arc<Schema>,
    map: CaseIgnoreMap<AttrValueList>,
}

impl AttrsDict {
    pub fn new(schema: Arc<Schema>) -> AttrsDict {
        AttrsDict {
            schema,
            map: CaseIgnoreMap::new(),
        }
    }

    pub fn from_pairs(schema: Arc<Schema>, pairs: Vec<(String, Vec<String>)>) -> AttrsDict {
        let mut attrs = AttrsDict::new(schema);
        for (attr, values) in pairs {
            attrs.set(&attr, values);
        }
        attrs
    }

    pub fn schema(&self) -> &Arc<Schema> {
        &self.schema
    }

    pub fn get(&self, attr: &str) -> Option<&AttrValueList> {
        self.map.get(attr)
    }

    pub fn get_mut(&mut self, attr: &str) -> Option<&mut AttrValueList> {
        self.map.get_mut(attr)
    }

    pub fn contains_attr(&self, attr: &str) -> bool {
        self.map.contains_key(attr)
    }

    pub fn set(&mut self, attr: &str, values: Vec<String>) {
        if let Some(existing) = self.map.get_mut(attr) {
            existing.set_values(values);
        } else {
            let avl = AttrValueList::from_values(self.schema.clone(), attr, values);
            self.map.insert(attr, avl);
        }
    }

    /// Get the value list for `attr`, inserting an empty one if absent.
    pub fn setdefault(&mut self, attr: &str) -> &mut AttrValueList {
        if !self.map.contains_key(attr) {
            self.map
                .insert(attr, AttrValueList::new(self.schema.clone(), attr));
        }
        self.map.get_mut(attr).expect("attr just inserted")
    }

    pub fn remove(&mut self, attr: &str) -> Option<AttrValueList> {
        self.map.remove(attr)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &AttrValueList)> {
        self.map.iter()
    }

    pub fn keys_lower(&self) -> impl Iterator<Item = &str> {
        self.map.keys_lower()
    }

    pub fn len(&self) -> usize {
        self.map.len()
    }

    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }

    /// Deep copy, optionally limited to a selection of attribute names and
    /// optionally with the value lists emptied (`typesOnly`).
    pub fn deepcopy(&self, selection: Option<&[String]>, types_only: bool) -> AttrsDict {
        let mut ret = AttrsDict::new(self.schema.clone());
        for (attr, vals) in self.map.iter() {
            if let Some(selection) = selection {
                if !selection.iter().any(|s| s.eq_ignore_ascii_case(attr)) {
                    continue;
                }
            }
            let values = if types_only {
                Vec::new()
            } else {
                vals.values().to_vec()
            };
            ret.set(attr, values);
        }
        ret
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::schema::test_schema;

    #[test]
    fn case_ignore_map_preserves_spelling() {
        let mut map = CaseIgnoreMap::new();
        map.insert("objectClass", 1);
        assert_eq!(map.get("OBJECTCLASS"), Some(&1));
        assert_eq!(map.get("objectclass"), Some(&1));
        let keys: Vec<&str> = map.iter().map(|(k, _)| k).collect();
        assert_eq!(keys, vec!["objectClass"]);
        map.insert("OBJECTCLASS", 2);
        assert_eq!(map.get("objectClass"), Some(&2));
        assert_eq!(map.len(), 1);
    }

    #[test]
    fn value_list_equality_uses_matching_rule() {
        let schema = test_schema();
        let avl = AttrValueList::from_values(schema, "cn", vec!["Some User".into()]);
        assert!(avl.equals("some user").unwrap());
        assert!(avl.equals("SOME  USER").unwrap());
        assert!(!avl.equals("other user").unwrap());
    }

    #[test]
    fn push_unique_skips_equal_values() {
        let schema = test_schema();
        let mut avl = AttrValueList::new(schema, "cn");
        assert!(avl.push_unique("widget".into()).unwrap());
        assert!(!avl.push_unique("Widget".into()).unwrap());
        assert_eq!(avl.len(), 1);
    }

    #[test]
    fn substring_match() {
        let schema = test_schema();
        let avl = AttrValueList::from_values(schema, "cn", vec!["John Fitzgerald Doe".into()]);
        assert!(avl
            .match_substrings(Some("john"), &["fitz".into()], None)
            .unwrap());
        assert!(avl.match_substrings(None, &[], Some("DOE")).unwrap());
        assert!(!avl
            .match_substrings(Some("doe"), &[], None)
            .unwrap());
    }

    #[test]
    fn approx_match() {
        let schema = test_schema();
        let avl = AttrValueList::from_values(schema, "cn", vec!["Jonathan".into()]);
        assert!(avl.match_approx("Jonathen").unwrap());
        assert!(!avl.match_approx("completely different").unwrap());
    }

    #[test]
    fn attrs_dict_projection() {
        let schema = test_schema();
        let mut attrs = AttrsDict::new(schema);
        attrs.set("cn", vec!["test".into()]);
        attrs.set("mail", vec!["test@example.org".into()]);
        let copy = attrs.deepcopy(Some(&["CN".to_owned()]), false);
        assert!(copy.contains_attr("cn"));
        assert!(!copy.contains_attr("mail"));
        let types = attrs.deepcopy(None, true);
        assert!(types.get("mail").unwrap().is_empty());
    }
}
