//! In-memory ephemeral LDAP backend store.
//!
//! A node-linked tree keyed by RDN, rooted at the backend's suffix. Search
//! results stream through a bounded channel so the producer co-suspends with
//! the consuming session; mutations take the tree lock for their whole
//! read-modify-write.

mod object;

pub use object::LdapObject;

use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::{mpsc, Mutex};

use crate::attrs::AttrsDict;
use crate::backend::{DataBackend, SearchItem, SearchParams, SearchStream};
use crate::config::Config;
use crate::dn::{parse_dn, parse_rdn, Dn, Rdn};
use crate::proto::{DerefAliases, ModifyOp, Scope, SearchDone};
use crate::result::{LdapError, Result};
use crate::schema::Schema;

/// Alias chains longer than this fail with aliasProblem.
const MAX_ALIAS_HOPS: usize = 16;

pub struct MemoryBackend {
    suffix: Dn,
    suffix_str: String,
    default: bool,
    schema: Arc<Schema>,
    root: Arc<Mutex<LdapObject>>,
}

impl MemoryBackend {
    pub fn new(suffix: &str, conf: &Config, schema: Arc<Schema>) -> Result<MemoryBackend> {
        let suffix_dn = parse_dn(suffix, &schema)?;
        if suffix_dn.is_empty() {
            return Err(LdapError::Config(
                "DIT node suffix cannot be empty".to_owned(),
            ));
        }
        let root_rdn = suffix_dn.first().expect("non-empty suffix").clone();
        let root = LdapObject::new(root_rdn, suffix.to_owned(), AttrsDict::new(schema.clone()))?;
        Ok(MemoryBackend {
            suffix: suffix_dn,
            suffix_str: suffix.to_owned(),
            default: conf.get_bool("default", false),
            schema,
            root: Arc::new(Mutex::new(root)),
        })
    }

    /// RDNs between `dn` and the suffix, most-specific first.
    fn path_for(&self, dn: &Dn) -> Result<Vec<Rdn>> {
        if !dn.ends_with(&self.suffix) {
            return Err(LdapError::BaseObjectNotFound {
                matched: String::new(),
            });
        }
        Ok(dn.rdns()[..dn.len() - self.suffix.len()].to_vec())
    }
}

fn is_alias(obj: &LdapObject) -> bool {
    obj.attrs
        .get("objectClass")
        .map(|oc| oc.values().iter().any(|v| v.eq_ignore_ascii_case("alias")))
        .unwrap_or(false)
}

/// Follow an alias chain to a non-alias object.
fn deref_alias<'a>(
    root: &'a LdapObject,
    mut obj: &'a LdapObject,
    schema: &Schema,
    suffix: &Dn,
) -> Result<&'a LdapObject> {
    let mut hops = 0;
    while is_alias(obj) {
        hops += 1;
        if hops > MAX_ALIAS_HOPS {
            return Err(LdapError::AliasProblem(
                "alias dereference limit exceeded".to_owned(),
            ));
        }
        let target = obj
            .attrs
            .get("aliasedObjectName")
            .and_then(|vals| vals.values().first().cloned())
            .ok_or_else(|| {
                LdapError::AliasProblem("alias without an aliasedObjectName value".to_owned())
            })?;
        let target_dn = parse_dn(&target, schema)?;
        if !target_dn.ends_with(suffix) {
            return Err(LdapError::AliasProblem(format!(
                "aliasedObjectName {} is outside this naming context",
                target
            )));
        }
        let path = target_dn.rdns()[..target_dn.len() - suffix.len()].to_vec();
        obj = root
            .descend(&path)
            .map_err(|_| LdapError::AliasProblem(format!("dangling alias to {}", target)))?;
    }
    Ok(obj)
}

async fn stream_search(
    root: &LdapObject,
    suffix: &Dn,
    schema: &Schema,
    path: &[Rdn],
    params: &SearchParams,
    tx: &mpsc::Sender<Result<SearchItem>>,
) -> Result<()> {
    let mut base = root.descend(path)?;
    if matches!(
        params.deref,
        DerefAliases::FindingBaseObject | DerefAliases::Always
    ) {
        base = deref_alias(root, base, schema, suffix)?;
    }
    let base_dn = base.dn.clone();
    let selection = if params.attrs.is_empty() {
        None
    } else {
        Some(params.attrs.as_slice())
    };
    let deref_results = matches!(params.deref, DerefAliases::InSearch | DerefAliases::Always);
    let fil = params.filter.as_ref();
    let mut sent = 0i64;

    match params.scope {
        Scope::Base => {
            if base.matches_filter(fil)? {
                let _ = tx
                    .send(Ok(SearchItem::Entry(
                        base.to_result(selection, params.types_only),
                    )))
                    .await;
            }
        }
        Scope::OneLevel | Scope::Subtree => {
            let mut stack = vec![base];
            while let Some(obj) = stack.pop() {
                // a one-level walk descends exactly one step from the base
                if params.scope == Scope::Subtree || std::ptr::eq(obj, base) {
                    for child in obj.children.values() {
                        stack.push(child);
                    }
                }
                if !obj.matches_filter(fil)? {
                    continue;
                }
                let obj = if deref_results {
                    deref_alias(root, obj, schema, suffix)?
                } else {
                    obj
                };
                if tx
                    .send(Ok(SearchItem::Entry(
                        obj.to_result(selection, params.types_only),
                    )))
                    .await
                    .is_err()
                {
                    // consumer went away; nothing more to do
                    return Ok(());
                }
                sent += 1;
                if params.size_limit > 0 && sent >= params.size_limit {
                    break;
                }
            }
        }
    }

    let _ = tx
        .send(Ok(SearchItem::Done(SearchDone::success(&base_dn))))
        .await;
    Ok(())
}

#[async_trait]
impl DataBackend for MemoryBackend {
    fn suffix(&self) -> &Dn {
        &self.suffix
    }

    fn suffix_str(&self) -> &str {
        &self.suffix_str
    }

    fn is_default(&self) -> bool {
        self.default
    }

    fn schema(&self) -> &Arc<Schema> {
        &self.schema
    }

    async fn search_params(&self, params: SearchParams) -> Result<SearchStream> {
        if params.base.is_empty() {
            return Err(LdapError::Internal(
                "root DSE search request was dispatched to backend".to_owned(),
            ));
        }
        let path = self.path_for(&params.base)?;
        {
            // resolve the base up front so the caller sees resolution
            // failures before the stream starts
            let root = self.root.lock().await;
            root.descend(&path)?;
        }
        let (tx, stream) = SearchStream::channel();
        let root = self.root.clone();
        let schema = self.schema.clone();
        let suffix = self.suffix.clone();
        tokio::spawn(async move {
            let guard = root.lock().await;
            if let Err(e) = stream_search(&guard, &suffix, &schema, &path, &params, &tx).await {
                let _ = tx.send(Err(e)).await;
            }
        });
        Ok(stream)
    }

    async fn compare_params(&self, dn: &Dn, attr: &str, value: &str) -> Result<bool> {
        let path = self.path_for(dn)?;
        let root = self.root.lock().await;
        let obj = root.descend(&path)?;
        match obj.attrs.get(attr) {
            Some(vals) => vals.equals(value),
            None => Err(LdapError::NoSuchAttribute(attr.to_owned())),
        }
    }

    async fn add_params(&self, dn: &Dn, attrs: Vec<(String, Vec<String>)>) -> Result<()> {
        let (rdn, parent_dn) = dn.split_first()?;
        let parent_path = self.path_for(&parent_dn)?;
        let mut root = self.root.lock().await;
        let parent = root.descend_mut(&parent_path)?;
        let attrs = AttrsDict::from_pairs(self.schema.clone(), attrs);
        parent.add_child(rdn, dn.to_string(), attrs)
    }

    async fn modify_params(&self, dn: &Dn, changes: &[ModifyOp]) -> Result<()> {
        let path = self.path_for(dn)?;
        let mut root = self.root.lock().await;
        let obj = root.descend_mut(&path)?;
        obj.modify(changes)
    }

    async fn mod_dn_params(
        &self,
        dn: &Dn,
        new_rdn: &str,
        delete_old_rdn: bool,
        new_superior: Option<&Dn>,
    ) -> Result<()> {
        let (rdn, parent_dn) = dn.split_first()?;
        let new_rdn = parse_rdn(new_rdn, &self.schema)?;
        let parent_path = self.path_for(&parent_dn)?;
        let mut root = self.root.lock().await;
        if let Some(new_superior) = new_superior {
            let new_parent_path = self.path_for(new_superior)?;
            {
                let new_parent = root.descend(&new_parent_path)?;
                if new_parent.children.contains_key(&rdn) {
                    return Err(LdapError::EntryAlreadyExists(format!(
                        "{},{}",
                        rdn, new_parent.dn
                    )));
                }
            }
            let obj = root.descend_mut(&parent_path)?.take_child(&rdn)?;
            let new_parent = root.descend_mut(&new_parent_path)?;
            new_parent.add_child_ref(obj)?;
            new_parent.mod_rdn(&rdn, &new_rdn, delete_old_rdn)
        } else {
            let parent = root.descend_mut(&parent_path)?;
            parent.mod_rdn(&rdn, &new_rdn, delete_old_rdn)
        }
    }

    async fn delete_params(&self, dn: &Dn) -> Result<()> {
        let (rdn, parent_dn) = dn.split_first()?;
        let parent_path = self.path_for(&parent_dn)?;
        let mut root = self.root.lock().await;
        let parent = root.descend_mut(&parent_path)?;
        parent.delete_child(&rdn)
    }
}
