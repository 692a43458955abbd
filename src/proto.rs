//! Wire model for LDAPv3 messages (RFC 4511).
//!
//! An [`LdapMsg`] decodes from / encodes into a BER [`StructureTag`]. The
//! protocol op is a tagged union covering every request this server accepts
//! and every response it produces; anything else decodes to
//! [`ProtocolOp::Unrecognized`] and takes the disconnect path at the session
//! layer. Controls are carried as the raw wire field.

use std::convert::TryFrom;

use lber::common::TagClass;
use lber::structure::{PL, StructureTag};
use lber::structures::{
    ASNTag, Boolean, Enumerated, Integer, Null, OctetString, Sequence, Set, Tag,
};
use lber::universal::Types;

use crate::filter::Filter;
use crate::result::{LdapError, Result, ResultCode};

/// RFC 4511 sec 4.4.1
pub const OID_NOTICE_OF_DISCONNECTION: &str = "1.3.6.1.4.1.1466.20036";

#[derive(Clone, Debug, PartialEq)]
pub struct LdapMsg {
    pub msgid: i32,
    pub op: ProtocolOp,
    pub ctrl: Option<StructureTag>,
}

impl LdapMsg {
    pub fn new(msgid: i32, op: ProtocolOp) -> LdapMsg {
        LdapMsg {
            msgid,
            op,
            ctrl: None,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Scope {
    Base = 0,
    OneLevel = 1,
    Subtree = 2,
}

impl TryFrom<i64> for Scope {
    type Error = LdapError;

    fn try_from(v: i64) -> Result<Scope> {
        match v {
            0 => Ok(Scope::Base),
            1 => Ok(Scope::OneLevel),
            2 => Ok(Scope::Subtree),
            _ => Err(proto_err("search scope out of range")),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DerefAliases {
    Never = 0,
    InSearch = 1,
    FindingBaseObject = 2,
    Always = 3,
}

impl TryFrom<i64> for DerefAliases {
    type Error = LdapError;

    fn try_from(v: i64) -> Result<DerefAliases> {
        match v {
            0 => Ok(DerefAliases::Never),
            1 => Ok(DerefAliases::InSearch),
            2 => Ok(DerefAliases::FindingBaseObject),
            3 => Ok(DerefAliases::Always),
            _ => Err(proto_err("derefAliases out of range")),
        }
    }
}

impl DerefAliases {
    /// Configuration spellings used by the auth backends.
    pub fn from_name(name: &str) -> Option<DerefAliases> {
        Some(match name.to_ascii_uppercase().as_str() {
            "NEVER" => DerefAliases::Never,
            "SEARCH" => DerefAliases::InSearch,
            "BASE" | "FINDING" => DerefAliases::FindingBaseObject,
            "ALWAYS" => DerefAliases::Always,
            _ => return None,
        })
    }
}

#[derive(Clone, Debug, PartialEq)]
pub enum AuthChoice {
    Simple(String),
    Sasl {
        mechanism: String,
        credentials: Option<String>,
    },
    Unknown(u64),
}

#[derive(Clone, Debug, PartialEq)]
pub struct BindRequest {
    pub version: i64,
    pub name: String,
    pub auth: AuthChoice,
}

#[derive(Clone, Debug, PartialEq)]
pub struct SearchRequest {
    pub base: String,
    pub scope: Scope,
    pub deref: DerefAliases,
    pub size_limit: i64,
    pub time_limit: i64,
    pub types_only: bool,
    pub filter: Option<Filter>,
    pub attrs: Vec<String>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ModType {
    Add = 0,
    Delete = 1,
    Replace = 2,
}

impl TryFrom<i64> for ModType {
    type Error = LdapError;

    fn try_from(v: i64) -> Result<ModType> {
        match v {
            0 => Ok(ModType::Add),
            1 => Ok(ModType::Delete),
            2 => Ok(ModType::Replace),
            _ => Err(proto_err("invalid modify operation")),
        }
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct ModifyOp {
    pub op: ModType,
    pub attr: String,
    pub values: Vec<String>,
}

#[derive(Clone, Debug, PartialEq)]
pub struct ModifyRequest {
    pub object: String,
    pub changes: Vec<ModifyOp>,
}

#[derive(Clone, Debug, PartialEq)]
pub struct AddRequest {
    pub entry: String,
    pub attrs: Vec<(String, Vec<String>)>,
}

#[derive(Clone, Debug, PartialEq)]
pub struct DelRequest {
    pub dn: String,
}

#[derive(Clone, Debug, PartialEq)]
pub struct ModDnRequest {
    pub entry: String,
    pub new_rdn: String,
    pub delete_old_rdn: bool,
    pub new_superior: Option<String>,
}

#[derive(Clone, Debug, PartialEq)]
pub struct CompareRequest {
    pub entry: String,
    pub attr: String,
    pub value: String,
}

#[derive(Clone, Debug, PartialEq)]
pub struct ExtendedRequest {
    pub name: String,
    pub value: Option<Vec<u8>>,
}

/// Common components of an LDAP operation result.
#[derive(Clone, Debug, PartialEq)]
pub struct LdapResult {
    pub code: ResultCode,
    pub matched_dn: String,
    pub text: String,
}

impl LdapResult {
    pub fn new(code: ResultCode, matched_dn: &str, text: &str) -> LdapResult {
        LdapResult {
            code,
            matched_dn: matched_dn.to_owned(),
            text: text.to_owned(),
        }
    }

    pub fn success(matched_dn: &str) -> LdapResult {
        LdapResult::new(ResultCode::Success, matched_dn, "")
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct ExtendedResponse {
    pub res: LdapResult,
    pub name: Option<String>,
    pub value: Option<Vec<u8>>,
}

impl ExtendedResponse {
    /// The unsolicited notice sent before closing on a fatal protocol error.
    pub fn notice_of_disconnection(text: &str) -> ExtendedResponse {
        ExtendedResponse {
            res: LdapResult::new(ResultCode::ProtocolError, "", text),
            name: Some(OID_NOTICE_OF_DISCONNECTION.to_owned()),
            value: None,
        }
    }
}

/// One search result entry, ready for BER encoding.
#[derive(Clone, Debug, PartialEq)]
pub struct SearchResultEntry {
    pub dn: String,
    pub attrs: Vec<(String, Vec<String>)>,
}

impl SearchResultEntry {
    pub fn get_attr(&self, attr: &str) -> Option<&Vec<String>> {
        self.attrs
            .iter()
            .find(|(a, _)| a.eq_ignore_ascii_case(attr))
            .map(|(_, v)| v)
    }
}

/// Terminal marker of a search stream, bearing the base DN.
#[derive(Clone, Debug, PartialEq)]
pub struct SearchDone {
    pub matched_dn: String,
    pub code: ResultCode,
    pub text: String,
}

impl SearchDone {
    pub fn success(matched_dn: &str) -> SearchDone {
        SearchDone {
            matched_dn: matched_dn.to_owned(),
            code: ResultCode::Success,
            text: "Search successful".to_owned(),
        }
    }

    pub fn into_result(self) -> LdapResult {
        LdapResult {
            code: self.code,
            matched_dn: self.matched_dn,
            text: self.text,
        }
    }
}

#[derive(Clone, Debug, PartialEq)]
pub enum ProtocolOp {
    BindRequest(BindRequest),
    UnbindRequest,
    SearchRequest(SearchRequest),
    ModifyRequest(ModifyRequest),
    AddRequest(AddRequest),
    DelRequest(DelRequest),
    ModDnRequest(ModDnRequest),
    CompareRequest(CompareRequest),
    AbandonRequest(i32),
    ExtendedRequest(ExtendedRequest),

    BindResponse(LdapResult),
    SearchResultEntry(SearchResultEntry),
    SearchResultDone(LdapResult),
    ModifyResponse(LdapResult),
    AddResponse(LdapResult),
    DelResponse(LdapResult),
    ModDnResponse(LdapResult),
    CompareResponse(LdapResult),
    ExtendedResponse(ExtendedResponse),

    /// Any protocol op this server does not handle.
    Unrecognized(u64),
}

impl ProtocolOp {
    pub fn operation_name(&self) -> &'static str {
        match self {
            ProtocolOp::BindRequest(_) => "bindRequest",
            ProtocolOp::UnbindRequest => "unbindRequest",
            ProtocolOp::SearchRequest(_) => "searchRequest",
            ProtocolOp::ModifyRequest(_) => "modifyRequest",
            ProtocolOp::AddRequest(_) => "addRequest",
            ProtocolOp::DelRequest(_) => "delRequest",
            ProtocolOp::ModDnRequest(_) => "modDNRequest",
            ProtocolOp::CompareRequest(_) => "compareRequest",
            ProtocolOp::AbandonRequest(_) => "abandonRequest",
            ProtocolOp::ExtendedRequest(_) => "extendedReq",
            ProtocolOp::BindResponse(_) => "bindResponse",
            ProtocolOp::SearchResultEntry(_) => "searchResEntry",
            ProtocolOp::SearchResultDone(_) => "searchResDone",
            ProtocolOp::ModifyResponse(_) => "modifyResponse",
            ProtocolOp::AddResponse(_) => "addResponse",
            ProtocolOp::DelResponse(_) => "delResponse",
            ProtocolOp::ModDnResponse(_) => "modDNResponse",
            ProtocolOp::CompareResponse(_) => "compareResponse",
            ProtocolOp::ExtendedResponse(_) => "extendedResp",
            ProtocolOp::Unrecognized(_) => "unrecognized",
        }
    }

    /// The operation string with the trailing `Request` / `Req` removed.
    pub fn root_op(&self) -> &'static str {
        match self {
            ProtocolOp::BindRequest(_) => "bind",
            ProtocolOp::UnbindRequest => "unbind",
            ProtocolOp::SearchRequest(_) => "search",
            ProtocolOp::ModifyRequest(_) => "modify",
            ProtocolOp::AddRequest(_) => "add",
            ProtocolOp::DelRequest(_) => "delete",
            ProtocolOp::ModDnRequest(_) => "modDN",
            ProtocolOp::CompareRequest(_) => "compare",
            ProtocolOp::AbandonRequest(_) => "abandon",
            ProtocolOp::ExtendedRequest(_) => "extended",
            _ => "",
        }
    }

    pub fn is_request(&self) -> bool {
        matches!(
            self,
            ProtocolOp::BindRequest(_)
                | ProtocolOp::UnbindRequest
                | ProtocolOp::SearchRequest(_)
                | ProtocolOp::ModifyRequest(_)
                | ProtocolOp::AddRequest(_)
                | ProtocolOp::DelRequest(_)
                | ProtocolOp::ModDnRequest(_)
                | ProtocolOp::CompareRequest(_)
                | ProtocolOp::AbandonRequest(_)
                | ProtocolOp::ExtendedRequest(_)
        )
    }

    /// The DN used as the error-matched DN for this request.
    pub fn dn(&self) -> &str {
        match self {
            ProtocolOp::SearchRequest(r) => &r.base,
            ProtocolOp::ModifyRequest(r) => &r.object,
            ProtocolOp::BindRequest(r) => &r.name,
            ProtocolOp::AddRequest(r) => &r.entry,
            ProtocolOp::DelRequest(r) => &r.dn,
            ProtocolOp::ModDnRequest(r) => &r.entry,
            ProtocolOp::CompareRequest(r) => &r.entry,
            _ => "",
        }
    }
}

fn proto_err(msg: &str) -> LdapError {
    LdapError::DisconnectionProtocol(msg.to_owned())
}

fn read_string(tag: StructureTag) -> Result<String> {
    tag.expect_primitive()
        .map(|bytes| String::from_utf8_lossy(&bytes).into_owned())
        .ok_or_else(|| proto_err("expected a primitive string element"))
}

fn read_bytes(tag: StructureTag) -> Result<Vec<u8>> {
    tag.expect_primitive()
        .ok_or_else(|| proto_err("expected a primitive element"))
}

fn read_uint(tag: StructureTag) -> Result<i64> {
    let bytes = tag
        .expect_primitive()
        .ok_or_else(|| proto_err("expected an integer element"))?;
    match lber::parse::parse_uint(&bytes) {
        Ok((_, v)) => Ok(v as i64),
        _ => Err(proto_err("malformed integer element")),
    }
}

fn read_bool(tag: StructureTag) -> Result<bool> {
    let bytes = tag
        .expect_primitive()
        .ok_or_else(|| proto_err("expected a boolean element"))?;
    Ok(bytes.first().copied().unwrap_or(0) != 0)
}

fn read_constructed(tag: StructureTag) -> Result<Vec<StructureTag>> {
    tag.expect_constructed()
        .ok_or_else(|| proto_err("expected a constructed element"))
}

impl TryFrom<StructureTag> for LdapMsg {
    type Error = LdapError;

    fn try_from(tag: StructureTag) -> Result<LdapMsg> {
        let mut tags = tag
            .match_class(TagClass::Universal)
            .and_then(|t| t.match_id(Types::Sequence as u64))
            .and_then(|t| t.expect_constructed())
            .ok_or_else(|| proto_err("LDAPMessage is not a sequence"))?;
        if tags.len() < 2 {
            return Err(proto_err("LDAPMessage is too short"));
        }
        let maybe_controls = tags.pop().expect("element");
        let has_controls = maybe_controls.class == TagClass::Context && maybe_controls.id == 0;
        if has_controls && matches!(maybe_controls.payload, PL::P(_)) {
            return Err(proto_err("malformed controls"));
        }
        let (protoop, ctrl) = if has_controls {
            let op = tags
                .pop()
                .ok_or_else(|| proto_err("LDAPMessage is too short"))?;
            (op, Some(maybe_controls))
        } else {
            (maybe_controls, None)
        };
        let msgid = read_uint(
            tags.pop()
                .ok_or_else(|| proto_err("LDAPMessage is too short"))?,
        )? as i32;
        let op = ProtocolOp::try_from(protoop)?;
        Ok(LdapMsg { msgid, op, ctrl })
    }
}

impl TryFrom<StructureTag> for ProtocolOp {
    type Error = LdapError;

    fn try_from(tag: StructureTag) -> Result<ProtocolOp> {
        if tag.class != TagClass::Application {
            return Ok(ProtocolOp::Unrecognized(tag.id));
        }
        match tag.id {
            0 => decode_bind(tag).map(ProtocolOp::BindRequest),
            2 => Ok(ProtocolOp::UnbindRequest),
            3 => decode_search(tag).map(ProtocolOp::SearchRequest),
            6 => decode_modify(tag).map(ProtocolOp::ModifyRequest),
            8 => decode_add(tag).map(ProtocolOp::AddRequest),
            10 => Ok(ProtocolOp::DelRequest(DelRequest {
                dn: read_string(tag)?,
            })),
            12 => decode_mod_dn(tag).map(ProtocolOp::ModDnRequest),
            14 => decode_compare(tag).map(ProtocolOp::CompareRequest),
            16 => Ok(ProtocolOp::AbandonRequest(read_uint(tag)? as i32)),
            23 => decode_extended(tag).map(ProtocolOp::ExtendedRequest),
            1 => decode_result(tag).map(ProtocolOp::BindResponse),
            4 => decode_entry(tag).map(ProtocolOp::SearchResultEntry),
            5 => decode_result(tag).map(ProtocolOp::SearchResultDone),
            7 => decode_result(tag).map(ProtocolOp::ModifyResponse),
            9 => decode_result(tag).map(ProtocolOp::AddResponse),
            11 => decode_result(tag).map(ProtocolOp::DelResponse),
            13 => decode_result(tag).map(ProtocolOp::ModDnResponse),
            15 => decode_result(tag).map(ProtocolOp::CompareResponse),
            24 => decode_extended_resp(tag).map(ProtocolOp::ExtendedResponse),
            other => Ok(ProtocolOp::Unrecognized(other)),
        }
    }
}

fn decode_bind(tag: StructureTag) -> Result<BindRequest> {
    let mut it = read_constructed(tag)?.into_iter();
    let version = read_uint(it.next().ok_or_else(|| proto_err("truncated bindRequest"))?)?;
    let name = read_string(it.next().ok_or_else(|| proto_err("truncated bindRequest"))?)?;
    let auth_tag = it.next().ok_or_else(|| proto_err("truncated bindRequest"))?;
    let auth = match (auth_tag.class, auth_tag.id) {
        (TagClass::Context, 0) => AuthChoice::Simple(read_string(auth_tag)?),
        (TagClass::Context, 3) => {
            let mut sasl = read_constructed(auth_tag)?.into_iter();
            let mechanism =
                read_string(sasl.next().ok_or_else(|| proto_err("truncated sasl credentials"))?)?;
            let credentials = sasl.next().map(read_string).transpose()?;
            AuthChoice::Sasl {
                mechanism,
                credentials,
            }
        }
        (_, id) => AuthChoice::Unknown(id),
    };
    Ok(BindRequest {
        version,
        name,
        auth,
    })
}

fn decode_search(tag: StructureTag) -> Result<SearchRequest> {
    let mut it = read_constructed(tag)?.into_iter();
    let mut next = |what: &str| -> Result<StructureTag> {
        it.next()
            .ok_or_else(|| proto_err(&format!("truncated searchRequest at {}", what)))
    };
    let base = read_string(next("baseObject")?)?;
    let scope = Scope::try_from(read_uint(next("scope")?)?)?;
    let deref = DerefAliases::try_from(read_uint(next("derefAliases")?)?)?;
    let size_limit = read_uint(next("sizeLimit")?)?;
    let time_limit = read_uint(next("timeLimit")?)?;
    let types_only = read_bool(next("typesOnly")?)?;
    let filter = Some(Filter::try_from(next("filter")?)?);
    let attrs = match it.next() {
        Some(attr_tags) => read_constructed(attr_tags)?
            .into_iter()
            .map(read_string)
            .collect::<Result<Vec<String>>>()?,
        None => Vec::new(),
    };
    Ok(SearchRequest {
        base,
        scope,
        deref,
        size_limit,
        time_limit,
        types_only,
        filter,
        attrs,
    })
}

fn decode_modify(tag: StructureTag) -> Result<ModifyRequest> {
    let mut it = read_constructed(tag)?.into_iter();
    let object = read_string(it.next().ok_or_else(|| proto_err("truncated modifyRequest"))?)?;
    let change_tags =
        read_constructed(it.next().ok_or_else(|| proto_err("truncated modifyRequest"))?)?;
    let mut changes = Vec::with_capacity(change_tags.len());
    for change in change_tags {
        let mut cit = read_constructed(change)?.into_iter();
        let op = ModType::try_from(read_uint(
            cit.next().ok_or_else(|| proto_err("truncated change"))?,
        )?)?;
        let mut pit =
            read_constructed(cit.next().ok_or_else(|| proto_err("truncated change"))?)?.into_iter();
        let attr = read_string(pit.next().ok_or_else(|| proto_err("truncated modification"))?)?;
        let values = match pit.next() {
            Some(vals) => read_constructed(vals)?
                .into_iter()
                .map(read_string)
                .collect::<Result<Vec<String>>>()?,
            None => Vec::new(),
        };
        changes.push(ModifyOp { op, attr, values });
    }
    Ok(ModifyRequest { object, changes })
}

fn decode_add(tag: StructureTag) -> Result<AddRequest> {
    let mut it = read_constructed(tag)?.into_iter();
    let entry = read_string(it.next().ok_or_else(|| proto_err("truncated addRequest"))?)?;
    let attr_list =
        read_constructed(it.next().ok_or_else(|| proto_err("truncated addRequest"))?)?;
    let mut attrs = Vec::with_capacity(attr_list.len());
    for attr in attr_list {
        let mut ait = read_constructed(attr)?.into_iter();
        let attr_type = read_string(ait.next().ok_or_else(|| proto_err("truncated attribute"))?)?;
        let values = read_constructed(
            ait.next().ok_or_else(|| proto_err("truncated attribute"))?,
        )?
        .into_iter()
        .map(read_string)
        .collect::<Result<Vec<String>>>()?;
        attrs.push((attr_type, values));
    }
    Ok(AddRequest { entry, attrs })
}

fn decode_mod_dn(tag: StructureTag) -> Result<ModDnRequest> {
    let mut it = read_constructed(tag)?.into_iter();
    let entry = read_string(it.next().ok_or_else(|| proto_err("truncated modDNRequest"))?)?;
    let new_rdn = read_string(it.next().ok_or_else(|| proto_err("truncated modDNRequest"))?)?;
    let delete_old_rdn =
        read_bool(it.next().ok_or_else(|| proto_err("truncated modDNRequest"))?)?;
    let new_superior = it.next().map(read_string).transpose()?;
    Ok(ModDnRequest {
        entry,
        new_rdn,
        delete_old_rdn,
        new_superior,
    })
}

fn decode_compare(tag: StructureTag) -> Result<CompareRequest> {
    let mut it = read_constructed(tag)?.into_iter();
    let entry = read_string(it.next().ok_or_else(|| proto_err("truncated compareRequest"))?)?;
    let mut ava =
        read_constructed(it.next().ok_or_else(|| proto_err("truncated compareRequest"))?)?
            .into_iter();
    let attr = read_string(ava.next().ok_or_else(|| proto_err("truncated ava"))?)?;
    let value = read_string(ava.next().ok_or_else(|| proto_err("truncated ava"))?)?;
    Ok(CompareRequest { entry, attr, value })
}

fn decode_extended(tag: StructureTag) -> Result<ExtendedRequest> {
    let parts = read_constructed(tag)?;
    let mut name = None;
    let mut value = None;
    for part in parts {
        match part.id {
            0 => name = Some(read_string(part)?),
            1 => value = Some(read_bytes(part)?),
            _ => return Err(proto_err("malformed extendedReq")),
        }
    }
    Ok(ExtendedRequest {
        name: name.ok_or_else(|| proto_err("extendedReq without requestName"))?,
        value,
    })
}

fn decode_result_parts(
    it: &mut std::vec::IntoIter<StructureTag>,
) -> Result<LdapResult> {
    let code = read_uint(it.next().ok_or_else(|| proto_err("truncated LDAPResult"))?)?;
    let code = ResultCode::try_from(code)
        .map_err(|_| proto_err("unknown result code in LDAPResult"))?;
    let matched_dn = read_string(it.next().ok_or_else(|| proto_err("truncated LDAPResult"))?)?;
    let text = read_string(it.next().ok_or_else(|| proto_err("truncated LDAPResult"))?)?;
    Ok(LdapResult {
        code,
        matched_dn,
        text,
    })
}

fn decode_result(tag: StructureTag) -> Result<LdapResult> {
    decode_result_parts(&mut read_constructed(tag)?.into_iter())
}

fn decode_entry(tag: StructureTag) -> Result<SearchResultEntry> {
    let mut it = read_constructed(tag)?.into_iter();
    let dn = read_string(it.next().ok_or_else(|| proto_err("truncated searchResEntry"))?)?;
    let attr_list =
        read_constructed(it.next().ok_or_else(|| proto_err("truncated searchResEntry"))?)?;
    let mut attrs = Vec::with_capacity(attr_list.len());
    for attr in attr_list {
        let mut ait = read_constructed(attr)?.into_iter();
        let attr_type = read_string(ait.next().ok_or_else(|| proto_err("truncated attribute"))?)?;
        let values = match ait.next() {
            Some(vals) => read_constructed(vals)?
                .into_iter()
                .map(read_string)
                .collect::<Result<Vec<String>>>()?,
            None => Vec::new(),
        };
        attrs.push((attr_type, values));
    }
    Ok(SearchResultEntry { dn, attrs })
}

fn decode_extended_resp(tag: StructureTag) -> Result<ExtendedResponse> {
    let mut parts = read_constructed(tag)?.into_iter();
    let res = decode_result_parts(&mut parts)?;
    let mut name = None;
    let mut value = None;
    for part in parts {
        match part.id {
            10 => name = Some(read_string(part)?),
            11 => value = Some(read_bytes(part)?),
            _ => return Err(proto_err("malformed extendedResp")),
        }
    }
    Ok(ExtendedResponse { res, name, value })
}

fn octet_string(value: String) -> Tag {
    Tag::OctetString(OctetString {
        inner: value.into_bytes(),
        ..Default::default()
    })
}

fn int_tag(value: i64) -> Tag {
    Tag::Integer(Integer {
        inner: value,
        ..Default::default()
    })
}

fn result_tags(res: LdapResult) -> Vec<Tag> {
    vec![
        Tag::Enumerated(Enumerated {
            inner: res.code as i64,
            ..Default::default()
        }),
        octet_string(res.matched_dn),
        octet_string(res.text),
    ]
}

fn app_sequence(id: u64, inner: Vec<Tag>) -> Tag {
    Tag::Sequence(Sequence {
        id,
        class: TagClass::Application,
        inner,
    })
}

impl ProtocolOp {
    fn into_tag(self) -> Tag {
        match self {
            ProtocolOp::BindRequest(req) => {
                let auth = match req.auth {
                    AuthChoice::Simple(pw) => Tag::OctetString(OctetString {
                        id: 0,
                        class: TagClass::Context,
                        inner: pw.into_bytes(),
                    }),
                    AuthChoice::Sasl {
                        mechanism,
                        credentials,
                    } => {
                        let mut inner = vec![octet_string(mechanism)];
                        if let Some(credentials) = credentials {
                            inner.push(octet_string(credentials));
                        }
                        Tag::Sequence(Sequence {
                            id: 3,
                            class: TagClass::Context,
                            inner,
                        })
                    }
                    AuthChoice::Unknown(id) => Tag::Null(Null {
                        id,
                        class: TagClass::Context,
                        inner: (),
                    }),
                };
                app_sequence(0, vec![int_tag(req.version), octet_string(req.name), auth])
            }
            ProtocolOp::UnbindRequest => Tag::Null(Null {
                id: 2,
                class: TagClass::Application,
                inner: (),
            }),
            ProtocolOp::SearchRequest(req) => app_sequence(
                3,
                vec![
                    octet_string(req.base),
                    Tag::Enumerated(Enumerated {
                        inner: req.scope as i64,
                        ..Default::default()
                    }),
                    Tag::Enumerated(Enumerated {
                        inner: req.deref as i64,
                        ..Default::default()
                    }),
                    int_tag(req.size_limit),
                    int_tag(req.time_limit),
                    Tag::Boolean(Boolean {
                        inner: req.types_only,
                        ..Default::default()
                    }),
                    req.filter
                        .map(Tag::from)
                        .unwrap_or_else(|| Tag::from(Filter::Present("objectClass".to_owned()))),
                    Tag::Sequence(Sequence {
                        inner: req.attrs.into_iter().map(octet_string).collect(),
                        ..Default::default()
                    }),
                ],
            ),
            ProtocolOp::ModifyRequest(req) => app_sequence(
                6,
                vec![
                    octet_string(req.object),
                    Tag::Sequence(Sequence {
                        inner: req
                            .changes
                            .into_iter()
                            .map(|change| {
                                Tag::Sequence(Sequence {
                                    inner: vec![
                                        Tag::Enumerated(Enumerated {
                                            inner: change.op as i64,
                                            ..Default::default()
                                        }),
                                        partial_attribute(change.attr, change.values),
                                    ],
                                    ..Default::default()
                                })
                            })
                            .collect(),
                        ..Default::default()
                    }),
                ],
            ),
            ProtocolOp::AddRequest(req) => app_sequence(
                8,
                vec![
                    octet_string(req.entry),
                    Tag::Sequence(Sequence {
                        inner: req
                            .attrs
                            .into_iter()
                            .map(|(attr, values)| partial_attribute(attr, values))
                            .collect(),
                        ..Default::default()
                    }),
                ],
            ),
            ProtocolOp::DelRequest(req) => Tag::OctetString(OctetString {
                id: 10,
                class: TagClass::Application,
                inner: req.dn.into_bytes(),
            }),
            ProtocolOp::ModDnRequest(req) => {
                let mut inner = vec![
                    octet_string(req.entry),
                    octet_string(req.new_rdn),
                    Tag::Boolean(Boolean {
                        inner: req.delete_old_rdn,
                        ..Default::default()
                    }),
                ];
                if let Some(new_superior) = req.new_superior {
                    inner.push(Tag::OctetString(OctetString {
                        id: 0,
                        class: TagClass::Context,
                        inner: new_superior.into_bytes(),
                    }));
                }
                app_sequence(12, inner)
            }
            ProtocolOp::CompareRequest(req) => app_sequence(
                14,
                vec![
                    octet_string(req.entry),
                    Tag::Sequence(Sequence {
                        inner: vec![octet_string(req.attr), octet_string(req.value)],
                        ..Default::default()
                    }),
                ],
            ),
            ProtocolOp::AbandonRequest(id) => Tag::Integer(Integer {
                id: 16,
                class: TagClass::Application,
                inner: id as i64,
            }),
            ProtocolOp::ExtendedRequest(req) => {
                let mut inner = vec![Tag::OctetString(OctetString {
                    id: 0,
                    class: TagClass::Context,
                    inner: req.name.into_bytes(),
                })];
                if let Some(value) = req.value {
                    inner.push(Tag::OctetString(OctetString {
                        id: 1,
                        class: TagClass::Context,
                        inner: value,
                    }));
                }
                app_sequence(23, inner)
            }
            ProtocolOp::BindResponse(res) => app_sequence(1, result_tags(res)),
            ProtocolOp::SearchResultEntry(entry) => app_sequence(
                4,
                vec![
                    octet_string(entry.dn),
                    Tag::Sequence(Sequence {
                        inner: entry
                            .attrs
                            .into_iter()
                            .map(|(attr, values)| partial_attribute(attr, values))
                            .collect(),
                        ..Default::default()
                    }),
                ],
            ),
            ProtocolOp::SearchResultDone(res) => app_sequence(5, result_tags(res)),
            ProtocolOp::ModifyResponse(res) => app_sequence(7, result_tags(res)),
            ProtocolOp::AddResponse(res) => app_sequence(9, result_tags(res)),
            ProtocolOp::DelResponse(res) => app_sequence(11, result_tags(res)),
            ProtocolOp::ModDnResponse(res) => app_sequence(13, result_tags(res)),
            ProtocolOp::CompareResponse(res) => app_sequence(15, result_tags(res)),
            ProtocolOp::ExtendedResponse(res) => {
                let mut inner = result_tags(res.res);
                if let Some(name) = res.name {
                    inner.push(Tag::OctetString(OctetString {
                        id: 10,
                        class: TagClass::Context,
                        inner: name.into_bytes(),
                    }));
                }
                if let Some(value) = res.value {
                    inner.push(Tag::OctetString(OctetString {
                        id: 11,
                        class: TagClass::Context,
                        inner: value,
                    }));
                }
                app_sequence(24, inner)
            }
            ProtocolOp::Unrecognized(id) => Tag::Null(Null {
                id,
                class: TagClass::Application,
                inner: (),
            }),
        }
    }
}

fn partial_attribute(attr: String, values: Vec<String>) -> Tag {
    Tag::Sequence(Sequence {
        inner: vec![
            octet_string(attr),
            Tag::Set(Set {
                inner: values.into_iter().map(octet_string).collect(),
                ..Default::default()
            }),
        ],
        ..Default::default()
    })
}

impl From<LdapMsg> for StructureTag {
    fn from(msg: LdapMsg) -> StructureTag {
        let mut inner = vec![int_tag(msg.msgid as i64), msg.op.into_tag()];
        if let Some(ctrl) = msg.ctrl {
            inner.push(Tag::StructureTag(ctrl));
        }
        Tag::Sequence(Sequence {
            inner,
            ..Default::default()
        })
        .into_structure()
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn round_trip(msg: LdapMsg) -> LdapMsg {
        let encoded: StructureTag = msg.into();
        LdapMsg::try_from(encoded).expect("decode")
    }

    #[test]
    fn bind_request_round_trip() {
        let msg = LdapMsg::new(
            1,
            ProtocolOp::BindRequest(BindRequest {
                version: 3,
                name: "cn=admin,o=example".to_owned(),
                auth: AuthChoice::Simple("hunter2".to_owned()),
            }),
        );
        assert_eq!(round_trip(msg.clone()), msg);
    }

    #[test]
    fn search_request_round_trip() {
        let msg = LdapMsg::new(
            7,
            ProtocolOp::SearchRequest(SearchRequest {
                base: "ou=people,o=example".to_owned(),
                scope: Scope::Subtree,
                deref: DerefAliases::Never,
                size_limit: 17,
                time_limit: 5,
                types_only: false,
                filter: Some(Filter::And(vec![
                    Filter::Present("objectClass".to_owned()),
                    Filter::Equality("cn".to_owned(), "test".to_owned()),
                    Filter::Not(Box::new(Filter::Equality(
                        "sn".to_owned(),
                        "nope".to_owned(),
                    ))),
                ])),
                attrs: vec!["cn".to_owned(), "mail".to_owned()],
            }),
        );
        assert_eq!(round_trip(msg.clone()), msg);
    }

    #[test]
    fn modify_request_round_trip() {
        let msg = LdapMsg::new(
            3,
            ProtocolOp::ModifyRequest(ModifyRequest {
                object: "cn=x,o=example".to_owned(),
                changes: vec![
                    ModifyOp {
                        op: ModType::Add,
                        attr: "mail".to_owned(),
                        values: vec!["foo@x".to_owned()],
                    },
                    ModifyOp {
                        op: ModType::Delete,
                        attr: "description".to_owned(),
                        values: vec![],
                    },
                ],
            }),
        );
        assert_eq!(round_trip(msg.clone()), msg);
    }

    #[test]
    fn unbind_and_abandon_round_trip() {
        let msg = LdapMsg::new(4, ProtocolOp::UnbindRequest);
        assert_eq!(round_trip(msg.clone()), msg);
        let msg = LdapMsg::new(5, ProtocolOp::AbandonRequest(4));
        assert_eq!(round_trip(msg.clone()), msg);
    }

    #[test]
    fn mod_dn_round_trip() {
        let msg = LdapMsg::new(
            9,
            ProtocolOp::ModDnRequest(ModDnRequest {
                entry: "cn=a,ou=b,o=example".to_owned(),
                new_rdn: "cn=z".to_owned(),
                delete_old_rdn: true,
                new_superior: Some("ou=c,o=example".to_owned()),
            }),
        );
        assert_eq!(round_trip(msg.clone()), msg);
    }

    #[test]
    fn responses_round_trip_but_are_not_requests() {
        let msg = LdapMsg::new(
            2,
            ProtocolOp::SearchResultDone(LdapResult::success("o=example")),
        );
        let decoded = round_trip(msg.clone());
        assert_eq!(decoded, msg);
        assert!(!decoded.op.is_request());

        let msg = LdapMsg::new(
            3,
            ProtocolOp::SearchResultEntry(SearchResultEntry {
                dn: "cn=a,o=example".to_owned(),
                attrs: vec![("cn".to_owned(), vec!["a".to_owned()])],
            }),
        );
        assert_eq!(round_trip(msg.clone()), msg);
    }

    #[test]
    fn notice_of_disconnection_shape() {
        let notice = ExtendedResponse::notice_of_disconnection("bad message");
        assert_eq!(notice.res.code, ResultCode::ProtocolError);
        assert_eq!(notice.name.as_deref(), Some(OID_NOTICE_OF_DISCONNECTION));
    }
}
