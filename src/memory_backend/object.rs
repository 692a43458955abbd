//! Tree nodes of the in-memory store.

use std::collections::HashMap;

use crate::attrs::AttrsDict;
use crate::dn::Rdn;
use crate::filter::{self, Filter};
use crate::proto::{ModType, ModifyOp, SearchResultEntry};
use crate::result::{LdapError, Result};
use crate::schema::ObjectClass;

/// One entry plus its children, keyed by child RDN. Parent context flows
/// with the call stack; there are no back-pointers at rest.
pub struct LdapObject {
    pub rdn: Rdn,
    /// Cached full DN string, refreshed when the object moves.
    pub dn: String,
    pub attrs: AttrsDict,
    object_class: Option<ObjectClass>,
    pub children: HashMap<Rdn, LdapObject>,
}

impl LdapObject {
    /// Build an object. The RDN's attribute-value pairs are folded into the
    /// attributes, and the entry's object classes are combined into one
    /// virtual merged class for validation.
    pub fn new(rdn: Rdn, dn: String, mut attrs: AttrsDict) -> Result<LdapObject> {
        for (attr, value) in rdn.iter() {
            attrs.setdefault(attr).push_unique(value.clone())?;
        }
        let schema = attrs.schema().clone();
        let object_class = match attrs.get("objectClass") {
            Some(classes) => Some(
                schema.merged_object_class(classes.values().iter().map(String::as_str))?,
            ),
            None => None,
        };
        Ok(LdapObject {
            rdn,
            dn,
            attrs,
            object_class,
            children: HashMap::new(),
        })
    }

    pub fn validate(&self) -> Result<()> {
        if let Some(object_class) = &self.object_class {
            object_class.validate(self.attrs.schema(), &self.attrs)?;
        }
        Ok(())
    }

    pub fn matches_filter(&self, fil: Option<&Filter>) -> Result<bool> {
        filter::matches(fil, &self.attrs)
    }

    /// Projection into a result entry, honoring the requested attribute
    /// selection and the typesOnly flag.
    pub fn to_result(&self, selection: Option<&[String]>, types_only: bool) -> SearchResultEntry {
        let projected = self.attrs.deepcopy(selection, types_only);
        SearchResultEntry {
            dn: self.dn.clone(),
            attrs: projected
                .iter()
                .map(|(attr, vals)| (attr.to_owned(), vals.values().to_vec()))
                .collect(),
        }
    }

    /// Walk down `path` (most-specific RDN first). Misses report the
    /// deepest matched DN.
    pub fn descend(&self, path: &[Rdn]) -> Result<&LdapObject> {
        let mut current = self;
        for rdn in path.iter().rev() {
            current = current.children.get(rdn).ok_or_else(|| {
                LdapError::BaseObjectNotFound {
                    matched: current.dn.clone(),
                }
            })?;
        }
        Ok(current)
    }

    pub fn descend_mut(&mut self, path: &[Rdn]) -> Result<&mut LdapObject> {
        let mut current = self;
        for rdn in path.iter().rev() {
            let matched = current.dn.clone();
            current = current
                .children
                .get_mut(rdn)
                .ok_or(LdapError::BaseObjectNotFound { matched })?;
        }
        Ok(current)
    }

    /// Refresh the cached DN of this object and its whole subtree.
    pub fn set_dn(&mut self, parent_dn: &str) {
        self.dn = format!("{},{}", self.rdn, parent_dn);
        let dn = self.dn.clone();
        for child in self.children.values_mut() {
            child.set_dn(&dn);
        }
    }

    pub fn add_child(&mut self, rdn: Rdn, dn: String, attrs: AttrsDict) -> Result<()> {
        let obj = LdapObject::new(rdn, dn, attrs)?;
        obj.validate()?;
        self.add_child_ref(obj)
    }

    pub fn add_child_ref(&mut self, obj: LdapObject) -> Result<()> {
        if self.children.contains_key(&obj.rdn) {
            return Err(LdapError::EntryAlreadyExists(obj.dn.clone()));
        }
        self.children.insert(obj.rdn.clone(), obj);
        Ok(())
    }

    pub fn take_child(&mut self, rdn: &Rdn) -> Result<LdapObject> {
        self.children
            .remove(rdn)
            .ok_or_else(|| LdapError::NoSuchObject(format!("{},{}", rdn, self.dn)))
    }

    /// Remove a leaf child.
    pub fn delete_child(&mut self, rdn: &Rdn) -> Result<()> {
        let child = self
            .children
            .get(rdn)
            .ok_or_else(|| LdapError::NoSuchObject(format!("{},{}", rdn, self.dn)))?;
        if !child.children.is_empty() {
            return Err(LdapError::Other(
                "object is non-leaf, cannot delete".to_owned(),
            ));
        }
        self.children.remove(rdn);
        Ok(())
    }

    /// Rename a child in place. The new RDN's attribute-value pairs are
    /// folded in; the old RDN's pair is removed when `delete_old_rdn` is
    /// set. Also refreshes the subtree's cached DNs, so it doubles as the
    /// final step of a move under a new superior.
    pub fn mod_rdn(&mut self, rdn: &Rdn, new_rdn: &Rdn, delete_old_rdn: bool) -> Result<()> {
        let parent_dn = self.dn.clone();
        if rdn == new_rdn {
            if let Some(child) = self.children.get_mut(rdn) {
                child.set_dn(&parent_dn);
            }
            return Ok(());
        }
        if self.children.contains_key(new_rdn) {
            return Err(LdapError::EntryAlreadyExists(format!(
                "{},{}",
                new_rdn, parent_dn
            )));
        }
        let mut obj = self.take_child(rdn)?;
        obj.rdn = new_rdn.clone();
        for (attr, value) in new_rdn.iter() {
            obj.attrs.setdefault(attr).push_unique(value.clone())?;
        }
        if delete_old_rdn {
            for (attr, value) in rdn.iter() {
                obj.delete_attr_value(attr, value)?;
            }
        }
        obj.set_dn(&parent_dn);
        self.children.insert(obj.rdn.clone(), obj);
        Ok(())
    }

    /// Remove one value of one attribute, silently if either is absent.
    pub fn delete_attr_value(&mut self, attr: &str, value: &str) -> Result<()> {
        if let Some(vals) = self.attrs.get_mut(attr) {
            vals.remove_value(value)?;
        }
        Ok(())
    }

    /// Apply a change list in order.
    pub fn modify(&mut self, changes: &[ModifyOp]) -> Result<()> {
        for change in changes {
            match change.op {
                ModType::Add => {
                    let vals = self.attrs.setdefault(&change.attr);
                    for value in &change.values {
                        vals.push_unique(value.clone())?;
                    }
                }
                ModType::Replace => {
                    if change.values.is_empty() {
                        if self.attrs.remove(&change.attr).is_none() {
                            return Err(LdapError::NoSuchAttribute(change.attr.clone()));
                        }
                    } else {
                        self.attrs.set(&change.attr, change.values.clone());
                    }
                }
                ModType::Delete => {
                    if change.values.is_empty() {
                        if self.attrs.remove(&change.attr).is_none() {
                            return Err(LdapError::NoSuchAttribute(change.attr.clone()));
                        }
                    } else {
                        match self.attrs.get_mut(&change.attr) {
                            Some(vals) => {
                                for value in &change.values {
                                    vals.remove_value(value)?;
                                }
                            }
                            None => {
                                return Err(LdapError::NoSuchAttribute(change.attr.clone()))
                            }
                        }
                    }
                }
            }
        }
        Ok(())
    }
}
