//! In-process client over the DIT router.
//!
//! Presents the backend-facing API the way a network client would see it;
//! used by components that need to read or write the directory from inside
//! the server, such as the simple-password auth backend.

use std::sync::Arc;

use crate::backend::{SearchItem, SearchParams};
use crate::dit::Dit;
use crate::dn::parse_dn;
use crate::filter::Filter;
use crate::proto::{DerefAliases, ModType, ModifyOp, Scope, SearchResultEntry};
use crate::result::Result;

#[derive(Clone)]
pub struct InternalClient {
    dit: Arc<Dit>,
}

impl InternalClient {
    pub fn new(dit: Arc<Dit>) -> InternalClient {
        InternalClient { dit }
    }

    /// Search, yielding entries up to (but not including) the terminal Done.
    #[allow(clippy::too_many_arguments)]
    pub async fn search(
        &self,
        base: &str,
        scope: Scope,
        fil: Option<Filter>,
        attrs: Vec<String>,
        deref_aliases: Option<DerefAliases>,
        types_only: bool,
        limit: i64,
        time_limit: i64,
    ) -> Result<Vec<SearchResultEntry>> {
        let backend = self.dit.backend_for(base)?;
        let params = SearchParams {
            base: parse_dn(base, backend.schema())?,
            scope,
            deref: deref_aliases.unwrap_or(DerefAliases::Never),
            types_only,
            filter: fil,
            attrs,
            size_limit: limit,
            time_limit,
        };
        let mut stream = backend.search_params(params).await?;
        let mut entries = Vec::new();
        while let Some(item) = stream.next().await {
            match item? {
                SearchItem::Entry(entry) => entries.push(entry),
                SearchItem::Done(_) => break,
            }
        }
        Ok(entries)
    }

    pub async fn compare(&self, dn: &str, attr_type: &str, attr_value: &str) -> Result<bool> {
        let backend = self.dit.backend_for(dn)?;
        let dn = parse_dn(dn, backend.schema())?;
        backend.compare_params(&dn, attr_type, attr_value).await
    }

    pub async fn add(&self, dn: &str, attrs: Vec<(String, Vec<String>)>) -> Result<()> {
        let backend = self.dit.backend_for(dn)?;
        let dn = parse_dn(dn, backend.schema())?;
        backend.add_params(&dn, attrs).await
    }

    pub async fn modify(&self, dn: &str, mod_list: Vec<ModifyOp>) -> Result<()> {
        let backend = self.dit.backend_for(dn)?;
        let dn = parse_dn(dn, backend.schema())?;
        backend.modify_params(&dn, &mod_list).await
    }

    pub async fn mod_dn(
        &self,
        dn: &str,
        new_rdn: &str,
        del_old_rdn_attr: bool,
        new_parent: Option<&str>,
    ) -> Result<()> {
        let backend = self.dit.backend_for(dn)?;
        let dn = parse_dn(dn, backend.schema())?;
        let new_parent = match new_parent {
            Some(parent) => Some(parse_dn(parent, backend.schema())?),
            None => None,
        };
        backend
            .mod_dn_params(&dn, new_rdn, del_old_rdn_attr, new_parent.as_ref())
            .await
    }

    pub async fn delete(&self, dn: &str) -> Result<()> {
        let backend = self.dit.backend_for(dn)?;
        let dn = parse_dn(dn, backend.schema())?;
        backend.delete_params(&dn).await
    }

    async fn modify_one(&self, dn: &str, op: ModType, attr: &str, vals: Vec<String>) -> Result<()> {
        self.modify(
            dn,
            vec![ModifyOp {
                op,
                attr: attr.to_owned(),
                values: vals,
            }],
        )
        .await
    }

    pub async fn add_attrs(&self, dn: &str, attr: &str, vals: Vec<String>) -> Result<()> {
        self.modify_one(dn, ModType::Add, attr, vals).await
    }

    pub async fn replace_attrs(&self, dn: &str, attr: &str, vals: Vec<String>) -> Result<()> {
        self.modify_one(dn, ModType::Replace, attr, vals).await
    }

    pub async fn delete_attrs(&self, dn: &str, attr: &str, vals: Vec<String>) -> Result<()> {
        self.modify_one(dn, ModType::Delete, attr, vals).await
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::schema::test_schema;

    fn client() -> InternalClient {
        let value: serde_yaml::Value =
            serde_yaml::from_str("o=example: {data_backend: memory}").unwrap();
        let dit = Dit::new(value.as_mapping().unwrap(), test_schema()).unwrap();
        InternalClient::new(Arc::new(dit))
    }

    #[tokio::test]
    async fn add_search_modify_delete() {
        let client = client();
        client
            .add(
                "cn=user,o=example",
                vec![("sn".to_owned(), vec!["User".to_owned()])],
            )
            .await
            .unwrap();

        let entries = client
            .search(
                "cn=user,o=example",
                Scope::Base,
                None,
                vec![],
                None,
                false,
                0,
                0,
            )
            .await
            .unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].dn, "cn=user,o=example");

        client
            .add_attrs("cn=user,o=example", "mail", vec!["u@example.org".to_owned()])
            .await
            .unwrap();
        assert!(client
            .compare("cn=user,o=example", "mail", "u@example.org")
            .await
            .unwrap());

        client
            .replace_attrs("cn=user,o=example", "mail", vec!["v@example.org".to_owned()])
            .await
            .unwrap();
        assert!(!client
            .compare("cn=user,o=example", "mail", "u@example.org")
            .await
            .unwrap());

        client
            .delete_attrs("cn=user,o=example", "mail", vec!["v@example.org".to_owned()])
            .await
            .unwrap();
        client.delete("cn=user,o=example").await.unwrap();
    }
}
