//! The data-backend contract.
//!
//! Every operation comes in a pair: a protocol-level method taking the
//! decoded request, and a params-level method taking parsed values. Storage
//! backends implement the params side; the protocol side is provided in
//! terms of it. The internal client talks to the params side directly.

use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::dn::{parse_dn, Dn};
use crate::filter::Filter;
use crate::proto::{
    AddRequest, CompareRequest, DelRequest, DerefAliases, ModDnRequest, ModifyOp, ModifyRequest,
    Scope, SearchDone, SearchRequest, SearchResultEntry,
};
use crate::result::Result;
use crate::schema::Schema;

/// One item of a search stream: entries, then a terminal done marker.
#[derive(Clone, Debug)]
pub enum SearchItem {
    Entry(SearchResultEntry),
    Done(SearchDone),
}

/// Pull-based sequence of search results.
///
/// The producer sends over a bounded channel of depth one, so it suspends
/// until the consumer is ready for the next item; projection, size limits
/// and time limits compose without buffering the result set.
pub struct SearchStream {
    rx: mpsc::Receiver<Result<SearchItem>>,
}

impl SearchStream {
    pub fn channel() -> (mpsc::Sender<Result<SearchItem>>, SearchStream) {
        let (tx, rx) = mpsc::channel(1);
        (tx, SearchStream { rx })
    }

    pub async fn next(&mut self) -> Option<Result<SearchItem>> {
        self.rx.recv().await
    }
}

/// Parsed search parameters.
#[derive(Clone, Debug)]
pub struct SearchParams {
    pub base: Dn,
    pub scope: Scope,
    pub deref: DerefAliases,
    pub types_only: bool,
    pub filter: Option<Filter>,
    pub attrs: Vec<String>,
    pub size_limit: i64,
    pub time_limit: i64,
}

impl SearchParams {
    pub fn from_request(schema: &Schema, req: &SearchRequest) -> Result<SearchParams> {
        Ok(SearchParams {
            base: parse_dn(&req.base, schema)?,
            scope: req.scope,
            deref: req.deref,
            types_only: req.types_only,
            filter: req.filter.clone(),
            attrs: req.attrs.clone(),
            size_limit: req.size_limit,
            time_limit: req.time_limit,
        })
    }
}

#[async_trait]
pub trait DataBackend: Send + Sync {
    fn suffix(&self) -> &Dn;
    fn suffix_str(&self) -> &str;
    fn is_default(&self) -> bool;
    fn schema(&self) -> &Arc<Schema>;

    async fn search_params(&self, params: SearchParams) -> Result<SearchStream>;
    async fn compare_params(&self, dn: &Dn, attr: &str, value: &str) -> Result<bool>;
    async fn add_params(&self, dn: &Dn, attrs: Vec<(String, Vec<String>)>) -> Result<()>;
    async fn modify_params(&self, dn: &Dn, changes: &[ModifyOp]) -> Result<()>;
    async fn mod_dn_params(
        &self,
        dn: &Dn,
        new_rdn: &str,
        delete_old_rdn: bool,
        new_superior: Option<&Dn>,
    ) -> Result<()>;
    async fn delete_params(&self, dn: &Dn) -> Result<()>;

    async fn search(&self, req: &SearchRequest) -> Result<SearchStream> {
        let params = SearchParams::from_request(self.schema(), req)?;
        self.search_params(params).await
    }

    async fn compare(&self, req: &CompareRequest) -> Result<bool> {
        let dn = parse_dn(&req.entry, self.schema())?;
        self.compare_params(&dn, &req.attr, &req.value).await
    }

    async fn add(&self, req: &AddRequest) -> Result<()> {
        let dn = parse_dn(&req.entry, self.schema())?;
        self.add_params(&dn, req.attrs.clone()).await
    }

    async fn modify(&self, req: &ModifyRequest) -> Result<()> {
        let dn = parse_dn(&req.object, self.schema())?;
        self.modify_params(&dn, &req.changes).await
    }

    async fn mod_dn(&self, req: &ModDnRequest) -> Result<()> {
        let dn = parse_dn(&req.entry, self.schema())?;
        let new_superior = match &req.new_superior {
            Some(sup) => Some(parse_dn(sup, self.schema())?),
            None => None,
        };
        self.mod_dn_params(&dn, &req.new_rdn, req.delete_old_rdn, new_superior.as_ref())
            .await
    }

    async fn delete(&self, req: &DelRequest) -> Result<()> {
        let dn = parse_dn(&req.dn, self.schema())?;
        self.delete_params(&dn).await
    }
}
