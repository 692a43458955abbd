//! Per-connection client session.
//!
//! The session frames bytes through [`LdapCodec`], dispatches each decoded
//! request, and streams responses back in order. Any fatal decode failure or
//! unrecognized operation sends the notice of disconnection (messageID 0)
//! and tears the session down. Messages from one client are processed
//! strictly in the order they were read off the socket.

use std::sync::Arc;

use futures::{SinkExt, StreamExt};
use log::{debug, error, info, warn};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::time::{timeout, Duration};
use tokio_util::codec::Framed;

use crate::backend::SearchItem;
use crate::proto::{
    BindRequest, CompareRequest, ExtendedResponse, LdapMsg, ProtocolOp, Scope, SearchRequest,
    SearchResultEntry,
};
use crate::protocol::LdapCodec;
use crate::request::Request;
use crate::result::{LdapError, Result, ResultCode};
use crate::Globals;

pub const VENDOR_NAME: &str = "laurelin";

pub struct ClientHandler<T> {
    framed: Framed<T, LdapCodec>,
    peer: String,
    globals: Arc<Globals>,
    root_dse: SearchResultEntry,
}

impl<T: AsyncRead + AsyncWrite + Unpin> ClientHandler<T> {
    pub fn new(stream: T, peer: String, globals: Arc<Globals>) -> ClientHandler<T> {
        let root_dse = build_root_dse(&globals);
        ClientHandler {
            framed: Framed::new(stream, LdapCodec),
            peer,
            globals,
            root_dse,
        }
    }

    /// Handle the client's requests until unbind or disconnect.
    pub async fn run(mut self) {
        debug!("{}: started new client", self.peer);
        loop {
            match self.framed.next().await {
                None => {
                    info!("{}: client has exited", self.peer);
                    return;
                }
                Some(Err(e)) => {
                    error!("{}: caught fatal disconnect error: {}", self.peer, e);
                    self.disconnect(&e.to_string()).await;
                    return;
                }
                Some(Ok(msg)) => {
                    let req = Request::from_msg(msg);
                    info!(
                        "{}: received message_id={} operation={}",
                        self.peer,
                        req.id,
                        req.operation()
                    );
                    match &req.op {
                        ProtocolOp::UnbindRequest => {
                            info!("{}: client has unbound", self.peer);
                            return;
                        }
                        ProtocolOp::AbandonRequest(_) => {
                            warn!("{}: received abandon request - ignoring", self.peer);
                            continue;
                        }
                        _ if !req.is_request() => {
                            let text = format!(
                                "message {} does not appear to contain a standard LDAP request",
                                req.id
                            );
                            error!("{}: {}", self.peer, text);
                            self.disconnect(&text).await;
                            return;
                        }
                        _ => {
                            if self.respond(req).await.is_err() {
                                // transport is gone
                                return;
                            }
                        }
                    }
                }
            }
        }
    }

    /// Send the notice of disconnection and close the transport.
    async fn disconnect(&mut self, text: &str) {
        let notice = LdapMsg::new(
            0,
            ProtocolOp::ExtendedResponse(ExtendedResponse::notice_of_disconnection(text)),
        );
        let _ = self.framed.send(notice).await;
        let _ = self.framed.close().await;
    }

    async fn send(&mut self, msg: LdapMsg) -> Result<()> {
        self.framed.send(msg).await.map_err(LdapError::from)
    }

    async fn respond(&mut self, req: Request) -> Result<()> {
        match self.dispatch(&req).await {
            Ok(()) => Ok(()),
            Err(e) => {
                let code = e.result_code();
                if code == ResultCode::Other {
                    error!(
                        "{}: {} {} failed: {}",
                        self.peer,
                        req.operation(),
                        req.id,
                        e
                    );
                } else {
                    info!(
                        "{}: {} {} failed gracefully with result {}: {}",
                        self.peer,
                        req.operation(),
                        req.id,
                        code.name(),
                        e
                    );
                }
                let op = req.result_response(code, req.matched_dn(), &e.diagnostic());
                self.send(LdapMsg::new(req.id, op)).await
            }
        }
    }

    async fn dispatch(&mut self, req: &Request) -> Result<()> {
        match &req.op {
            ProtocolOp::BindRequest(bind) => self.handle_bind(req, bind.clone()).await,
            ProtocolOp::SearchRequest(search) => self.handle_search(req, search.clone()).await,
            ProtocolOp::CompareRequest(compare) => {
                self.handle_compare(req, compare.clone()).await
            }
            ProtocolOp::AddRequest(add) => {
                let backend = self.globals.dit.backend_for(&add.entry)?.clone();
                backend.add(add).await?;
                self.send_success(req).await
            }
            ProtocolOp::ModifyRequest(modify) => {
                let backend = self.globals.dit.backend_for(&modify.object)?.clone();
                backend.modify(modify).await?;
                self.send_success(req).await
            }
            ProtocolOp::ModDnRequest(mod_dn) => {
                let backend = self.globals.dit.backend_for(&mod_dn.entry)?.clone();
                backend.mod_dn(mod_dn).await?;
                self.send_success(req).await
            }
            ProtocolOp::DelRequest(del) => {
                let backend = self.globals.dit.backend_for(&del.dn)?.clone();
                backend.delete(del).await?;
                self.send_success(req).await
            }
            ProtocolOp::ExtendedRequest(_) => Err(LdapError::Other(
                "extended operations not yet implemented".to_owned(),
            )),
            _ => Err(LdapError::Internal(
                "dispatch on a non-request operation".to_owned(),
            )),
        }
    }

    async fn send_success(&mut self, req: &Request) -> Result<()> {
        debug!("{}: {} {} successful", self.peer, req.operation(), req.id);
        let op = req.result_response(ResultCode::Success, req.matched_dn(), "");
        self.send(LdapMsg::new(req.id, op)).await
    }

    async fn handle_bind(&mut self, req: &Request, bind: BindRequest) -> Result<()> {
        let auth = self.globals.auth.clone();
        let authed_name = auth.authenticate(&bind.name, &bind.auth).await?;
        info!("{}: client has bound as {}", self.peer, authed_name);
        self.send_success(req).await
    }

    async fn handle_compare(&mut self, req: &Request, compare: CompareRequest) -> Result<()> {
        let backend = self.globals.dit.backend_for(&compare.entry)?.clone();
        let cmp = backend.compare(&compare).await?;
        let code = if cmp {
            ResultCode::CompareTrue
        } else {
            ResultCode::CompareFalse
        };
        let op = req.result_response(code, req.matched_dn(), "Compare successful");
        self.send(LdapMsg::new(req.id, op)).await
    }

    async fn handle_search(&mut self, req: &Request, search: SearchRequest) -> Result<()> {
        if search.base.is_empty() && search.scope == Scope::Base {
            debug!("{}: got root DSE request", self.peer);
            let entry = self.root_dse.clone();
            self.send(LdapMsg::new(req.id, ProtocolOp::SearchResultEntry(entry)))
                .await?;
            let done = req.result_response(ResultCode::Success, "", "");
            return self.send(LdapMsg::new(req.id, done)).await;
        }

        let backend = self.globals.dit.backend_for(&search.base)?.clone();
        let mut stream = backend
            .search(&search)
            .await
            .map_err(|e| base_not_found_diag(&search.base, e))?;

        let time_limit = search.time_limit;
        let msgid = req.id;
        let stream_loop = async {
            while let Some(item) = stream.next().await {
                match item.map_err(|e| base_not_found_diag(&search.base, e))? {
                    SearchItem::Entry(entry) => {
                        self.send(LdapMsg::new(msgid, ProtocolOp::SearchResultEntry(entry)))
                            .await?;
                    }
                    SearchItem::Done(done) => {
                        self.send(LdapMsg::new(
                            msgid,
                            ProtocolOp::SearchResultDone(done.into_result()),
                        ))
                        .await?;
                    }
                }
            }
            Ok::<(), LdapError>(())
        };
        if time_limit > 0 {
            match timeout(Duration::from_secs(time_limit as u64), stream_loop).await {
                Ok(res) => res?,
                Err(_) => return Err(LdapError::TimeLimitExceeded(time_limit)),
            }
        } else {
            stream_loop.await?;
        }
        debug!("{}: search successfully completed", self.peer);
        Ok(())
    }
}

/// Root DSE synthesis from the DIT router state at session construction.
fn build_root_dse(globals: &Globals) -> SearchResultEntry {
    let naming_contexts = globals.dit.naming_contexts();
    let default_naming_context = globals
        .dit
        .default_naming_context()
        .map(|d| vec![d])
        .unwrap_or_default();
    SearchResultEntry {
        dn: String::new(),
        attrs: vec![
            ("namingContexts".to_owned(), naming_contexts),
            ("defaultNamingContext".to_owned(), default_naming_context),
            ("supportedLDAPVersion".to_owned(), vec!["3".to_owned()]),
            ("vendorName".to_owned(), vec![VENDOR_NAME.to_owned()]),
        ],
    }
}

fn base_not_found_diag(base: &str, e: LdapError) -> LdapError {
    match e {
        LdapError::BaseObjectNotFound { matched } => {
            let (matched, unmatched) = if matched.is_empty() {
                ("<none>".to_owned(), base.to_owned())
            } else {
                let unmatched = base.replace(&format!(",{}", matched), "");
                (matched, unmatched)
            };
            LdapError::NoSuchObject(format!(
                "Search base object was not found, found up to: {} Could not find: {}",
                matched, unmatched
            ))
        }
        e => e,
    }
}
