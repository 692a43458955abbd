//! An LDAPv3 directory server (RFC 4511) with a pluggable data-storage
//! layer.
//!
//! Clients connect over cleartext TCP, TLS-wrapped TCP, or local stream
//! sockets. BER-encoded messages are decoded and dispatched through a
//! schema-aware authentication and authorization pipeline to a storage
//! backend; search results stream back lazily. See [`server::run_config_file`]
//! for the assembly entry point.

use std::sync::Arc;

pub mod asn1 {
    //! ASN.1 structure construction and parsing, re-exported from `lber`.
    pub use lber::common::TagClass;
    pub use lber::parse::{parse_tag, parse_uint};
    pub use lber::structure::{StructureTag, PL};
    pub use lber::structures::{
        ASNTag, Boolean, Enumerated, ExplicitTag, Integer, Null, OctetString, Sequence, Set, Tag,
    };
    pub use lber::universal::Types;
    pub use lber::write;
}

pub mod attrs;
pub mod auth;
pub mod backend;
pub mod client;
pub mod config;
pub mod dit;
pub mod dn;
pub mod filter;
pub mod internal_client;
pub mod memory_backend;
pub mod password;
pub mod proto;
pub mod protocol;
pub mod request;
pub mod result;
pub mod schema;
pub mod server;
pub mod simple_auth;

pub use client::ClientHandler;
pub use protocol::LdapCodec;
pub use result::{LdapError, ResultCode};
pub use server::{run_config_file, LaurelinServer};

/// Read-only state shared by every client session: the schema registry, the
/// DIT router, and the authentication stack.
pub struct Globals {
    pub schema: Arc<schema::Schema>,
    pub dit: Arc<dit::Dit>,
    pub auth: Arc<auth::AuthStack>,
}
