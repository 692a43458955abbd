//! Decoded request wrapper: classification and response derivation.

use crate::proto::{LdapMsg, LdapResult, ProtocolOp};
use crate::result::ResultCode;

/// One decoded client request, with the pieces the dispatcher needs.
#[derive(Clone, Debug)]
pub struct Request {
    pub id: i32,
    pub op: ProtocolOp,
}

impl Request {
    pub fn from_msg(msg: LdapMsg) -> Request {
        Request {
            id: msg.msgid,
            op: msg.op,
        }
    }

    pub fn operation(&self) -> &'static str {
        self.op.operation_name()
    }

    pub fn root_op(&self) -> &'static str {
        self.op.root_op()
    }

    pub fn is_request(&self) -> bool {
        self.op.is_request()
    }

    /// The DN reported as matched-DN in error responses, derived from the
    /// request payload (`baseObject` for search, `object` for modify,
    /// `name` for bind, `entry` for the others).
    pub fn matched_dn(&self) -> &str {
        self.op.dn()
    }

    /// The response name for this request's root operation.
    ///
    /// | root op  | response op     |
    /// |----------|-----------------|
    /// | bind     | bindResponse    |
    /// | search   | searchResDone   |
    /// | compare  | compareResponse |
    /// | add      | addResponse     |
    /// | modify   | modifyResponse  |
    /// | modDN    | modDNResponse   |
    /// | delete   | deleteResponse  |
    /// | extended | extendedResp    |
    pub fn response_name(&self) -> &'static str {
        match self.op {
            ProtocolOp::BindRequest(_) => "bindResponse",
            ProtocolOp::SearchRequest(_) => "searchResDone",
            ProtocolOp::CompareRequest(_) => "compareResponse",
            ProtocolOp::AddRequest(_) => "addResponse",
            ProtocolOp::ModifyRequest(_) => "modifyResponse",
            ProtocolOp::ModDnRequest(_) => "modDNResponse",
            ProtocolOp::DelRequest(_) => "deleteResponse",
            ProtocolOp::ExtendedRequest(_) => "extendedResp",
            _ => "",
        }
    }

    /// Build the result-bearing response op matching this request.
    pub fn result_response(&self, code: ResultCode, matched_dn: &str, text: &str) -> ProtocolOp {
        let res = LdapResult::new(code, matched_dn, text);
        match self.op {
            ProtocolOp::BindRequest(_) => ProtocolOp::BindResponse(res),
            ProtocolOp::SearchRequest(_) => ProtocolOp::SearchResultDone(res),
            ProtocolOp::CompareRequest(_) => ProtocolOp::CompareResponse(res),
            ProtocolOp::AddRequest(_) => ProtocolOp::AddResponse(res),
            ProtocolOp::ModifyRequest(_) => ProtocolOp::ModifyResponse(res),
            ProtocolOp::ModDnRequest(_) => ProtocolOp::ModDnResponse(res),
            ProtocolOp::DelRequest(_) => ProtocolOp::DelResponse(res),
            ProtocolOp::ExtendedRequest(_) => {
                ProtocolOp::ExtendedResponse(crate::proto::ExtendedResponse {
                    res,
                    name: None,
                    value: None,
                })
            }
            // no natural response shape; an extended response is the only
            // op that may be sent unsolicited
            _ => ProtocolOp::ExtendedResponse(crate::proto::ExtendedResponse {
                res,
                name: None,
                value: None,
            }),
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::proto::{DelRequest, SearchRequest, Scope, DerefAliases};

    #[test]
    fn response_table() {
        let req = Request {
            id: 1,
            op: ProtocolOp::DelRequest(DelRequest {
                dn: "cn=gone,o=example".to_owned(),
            }),
        };
        assert_eq!(req.root_op(), "delete");
        assert_eq!(req.response_name(), "deleteResponse");
        assert_eq!(req.matched_dn(), "cn=gone,o=example");
        assert!(matches!(
            req.result_response(ResultCode::Success, "", ""),
            ProtocolOp::DelResponse(_)
        ));
    }

    #[test]
    fn search_dn_is_base_object() {
        let req = Request {
            id: 2,
            op: ProtocolOp::SearchRequest(SearchRequest {
                base: "ou=x,o=example".to_owned(),
                scope: Scope::Base,
                deref: DerefAliases::Never,
                size_limit: 0,
                time_limit: 0,
                types_only: false,
                filter: None,
                attrs: vec![],
            }),
        };
        assert_eq!(req.matched_dn(), "ou=x,o=example");
        assert_eq!(req.response_name(), "searchResDone");
    }

    #[test]
    fn unrecognized_is_not_a_request() {
        let req = Request {
            id: 3,
            op: ProtocolOp::Unrecognized(19),
        };
        assert!(!req.is_request());
    }
}
