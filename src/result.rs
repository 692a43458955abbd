//! Result codes and the server-side error taxonomy.
//!
//! Operation handlers work in terms of [`LdapError`]; errors that correspond
//! to an RFC 4511 result code are mapped onto [`ResultCode`] at the protocol
//! boundary, everything else surfaces as `other` with a generic diagnostic.

use std::io;

use thiserror::Error;

pub type Result<T> = std::result::Result<T, LdapError>;

/// LDAP result codes, as dictated by the standard.
///
/// Generally, the value of zero indicates successful completion, but there's
/// a number of other non-error codes arising as a result of various operations.
/// See [Section A.1 of RFC 4511](https://tools.ietf.org/html/rfc4511#appendix-A.1).
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(i64)]
pub enum ResultCode {
    Success = 0,
    OperationsError = 1,
    ProtocolError = 2,
    TimeLimitExceeded = 3,
    SizeLimitExceeded = 4,
    CompareFalse = 5,
    CompareTrue = 6,
    AuthMethodNotSupported = 7,
    StrongerAuthRequired = 8,
    Referral = 10,
    AdminLimitExceeded = 11,
    UnavailableCriticalExtension = 12,
    ConfidentialityRequired = 13,
    SaslBindInProgress = 14,
    NoSuchAttribute = 16,
    UndefinedAttributeType = 17,
    InappropriateMatching = 18,
    ConstraintViolation = 19,
    AttributeOrValueExists = 20,
    InvalidAttributeSyntax = 21,
    NoSuchObject = 32,
    AliasProblem = 33,
    InvalidDnSyntax = 34,
    AliasDereferencingProblem = 36,
    InappropriateAuthentication = 48,
    InvalidCredentials = 49,
    InsufficientAccessRights = 50,
    Busy = 51,
    Unavailable = 52,
    UnwillingToPerform = 53,
    LoopDetect = 54,
    NamingViolation = 64,
    ObjectClassViolation = 65,
    NotAllowedOnNonLeaf = 66,
    NotAllowedOnRdn = 67,
    EntryAlreadyExists = 68,
    ObjectClassModsProhibited = 69,
    AffectsMultipleDsas = 71,
    Other = 80,
}

impl ResultCode {
    pub fn name(&self) -> &'static str {
        match self {
            ResultCode::Success => "success",
            ResultCode::OperationsError => "operationsError",
            ResultCode::ProtocolError => "protocolError",
            ResultCode::TimeLimitExceeded => "timeLimitExceeded",
            ResultCode::SizeLimitExceeded => "sizeLimitExceeded",
            ResultCode::CompareFalse => "compareFalse",
            ResultCode::CompareTrue => "compareTrue",
            ResultCode::AuthMethodNotSupported => "authMethodNotSupported",
            ResultCode::StrongerAuthRequired => "strongerAuthRequired",
            ResultCode::Referral => "referral",
            ResultCode::AdminLimitExceeded => "adminLimitExceeded",
            ResultCode::UnavailableCriticalExtension => "unavailableCriticalExtension",
            ResultCode::ConfidentialityRequired => "confidentialityRequired",
            ResultCode::SaslBindInProgress => "saslBindInProgress",
            ResultCode::NoSuchAttribute => "noSuchAttribute",
            ResultCode::UndefinedAttributeType => "undefinedAttributeType",
            ResultCode::InappropriateMatching => "inappropriateMatching",
            ResultCode::ConstraintViolation => "constraintViolation",
            ResultCode::AttributeOrValueExists => "attributeOrValueExists",
            ResultCode::InvalidAttributeSyntax => "invalidAttributeSyntax",
            ResultCode::NoSuchObject => "noSuchObject",
            ResultCode::AliasProblem => "aliasProblem",
            ResultCode::InvalidDnSyntax => "invalidDNSyntax",
            ResultCode::AliasDereferencingProblem => "aliasDereferencingProblem",
            ResultCode::InappropriateAuthentication => "inappropriateAuthentication",
            ResultCode::InvalidCredentials => "invalidCredentials",
            ResultCode::InsufficientAccessRights => "insufficientAccessRights",
            ResultCode::Busy => "busy",
            ResultCode::Unavailable => "unavailable",
            ResultCode::UnwillingToPerform => "unwillingToPerform",
            ResultCode::LoopDetect => "loopDetect",
            ResultCode::NamingViolation => "namingViolation",
            ResultCode::ObjectClassViolation => "objectClassViolation",
            ResultCode::NotAllowedOnNonLeaf => "notAllowedOnNonLeaf",
            ResultCode::NotAllowedOnRdn => "notAllowedOnRDN",
            ResultCode::EntryAlreadyExists => "entryAlreadyExists",
            ResultCode::ObjectClassModsProhibited => "objectClassModsProhibited",
            ResultCode::AffectsMultipleDsas => "affectsMultipleDSAs",
            ResultCode::Other => "other",
        }
    }
}

impl TryFrom<i64> for ResultCode {
    type Error = ();

    fn try_from(v: i64) -> std::result::Result<ResultCode, ()> {
        use ResultCode::*;
        Ok(match v {
            0 => Success,
            1 => OperationsError,
            2 => ProtocolError,
            3 => TimeLimitExceeded,
            4 => SizeLimitExceeded,
            5 => CompareFalse,
            6 => CompareTrue,
            7 => AuthMethodNotSupported,
            8 => StrongerAuthRequired,
            10 => Referral,
            11 => AdminLimitExceeded,
            12 => UnavailableCriticalExtension,
            13 => ConfidentialityRequired,
            14 => SaslBindInProgress,
            16 => NoSuchAttribute,
            17 => UndefinedAttributeType,
            18 => InappropriateMatching,
            19 => ConstraintViolation,
            20 => AttributeOrValueExists,
            21 => InvalidAttributeSyntax,
            32 => NoSuchObject,
            33 => AliasProblem,
            34 => InvalidDnSyntax,
            36 => AliasDereferencingProblem,
            48 => InappropriateAuthentication,
            49 => InvalidCredentials,
            50 => InsufficientAccessRights,
            51 => Busy,
            52 => Unavailable,
            53 => UnwillingToPerform,
            54 => LoopDetect,
            64 => NamingViolation,
            65 => ObjectClassViolation,
            66 => NotAllowedOnNonLeaf,
            67 => NotAllowedOnRdn,
            68 => EntryAlreadyExists,
            69 => ObjectClassModsProhibited,
            71 => AffectsMultipleDsas,
            80 => Other,
            _ => return Err(()),
        })
    }
}

impl std::fmt::Display for ResultCode {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(f, "{} ({})", self.name(), *self as i64)
    }
}

/// Internal error taxonomy.
///
/// Variants with a dedicated result code are surfaced on the wire as that
/// code via [`result_code()`](LdapError::result_code); the rest map to
/// `other`. BER decoder failures and `DisconnectionProtocol` take the
/// notice-of-disconnection exit path instead of producing a result.
#[derive(Debug, Error)]
pub enum LdapError {
    #[error("invalid DN: {0}")]
    InvalidDn(String),

    #[error("schema validation failed: {0}")]
    SchemaValidation(String),

    #[error("invalid schema: {0}")]
    InvalidSchema(String),

    #[error("could not load schema: {0}")]
    SchemaLoad(String),

    #[error("undefined schema element {0}")]
    UndefinedSchemaElement(String),

    #[error("\"{value}\" is not valid syntax {syntax}")]
    SyntaxParse { value: String, syntax: String },

    #[error("attribute {attr} does not have a defined {rule}")]
    NeededRule { attr: String, rule: String },

    #[error("configuration error: {0}")]
    Config(String),

    #[error("internal error: {0}")]
    Internal(String),

    #[error("no such object: {0}")]
    NoSuchObject(String),

    /// Base-object resolution failure carrying the deepest matched DN.
    #[error("object not found, matched up to \"{matched}\"")]
    BaseObjectNotFound { matched: String },

    #[error("no such attribute {0} on object")]
    NoSuchAttribute(String),

    #[error("entry already exists: {0}")]
    EntryAlreadyExists(String),

    #[error("requested time limit of {0} seconds was exceeded during search request")]
    TimeLimitExceeded(i64),

    #[error("alias problem: {0}")]
    AliasProblem(String),

    #[error("authentication method \"{0}\" is not supported")]
    AuthMethodNotSupported(String),

    #[error("invalid credentials: {0}")]
    InvalidCredentials(String),

    /// Fatal protocol violation; the session sends the notice of
    /// disconnection and closes.
    #[error("disconnecting client: {0}")]
    DisconnectionProtocol(String),

    #[error("{0}")]
    Other(String),

    #[error(transparent)]
    Io(#[from] io::Error),
}

impl LdapError {
    /// The result code sent on the wire for this error.
    pub fn result_code(&self) -> ResultCode {
        use LdapError::*;
        match self {
            InvalidDn(_) => ResultCode::InvalidDnSyntax,
            NoSuchObject(_) | BaseObjectNotFound { .. } => ResultCode::NoSuchObject,
            NoSuchAttribute(_) => ResultCode::NoSuchAttribute,
            EntryAlreadyExists(_) => ResultCode::EntryAlreadyExists,
            TimeLimitExceeded(_) => ResultCode::TimeLimitExceeded,
            AliasProblem(_) => ResultCode::AliasProblem,
            AuthMethodNotSupported(_) => ResultCode::AuthMethodNotSupported,
            InvalidCredentials(_) => ResultCode::InvalidCredentials,
            DisconnectionProtocol(_) => ResultCode::ProtocolError,
            _ => ResultCode::Other,
        }
    }

    /// Diagnostic message for the response. Internal and transport errors
    /// get a generic text; their details only go to the log.
    pub fn diagnostic(&self) -> String {
        match self {
            LdapError::Internal(_) | LdapError::Io(_) => "Internal server error".to_owned(),
            e => e.to_string(),
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn result_code_names() {
        assert_eq!(ResultCode::Success.name(), "success");
        assert_eq!(ResultCode::InvalidDnSyntax.name(), "invalidDNSyntax");
        assert_eq!(ResultCode::Other as i64, 80);
        assert_eq!(ResultCode::InvalidCredentials as i64, 49);
    }

    #[test]
    fn error_mapping() {
        let e = LdapError::NoSuchAttribute("mail".into());
        assert_eq!(e.result_code(), ResultCode::NoSuchAttribute);
        let e = LdapError::Internal("boom".into());
        assert_eq!(e.result_code(), ResultCode::Other);
        assert_eq!(e.diagnostic(), "Internal server error");
        let e = LdapError::BaseObjectNotFound {
            matched: "o=example".into(),
        };
        assert_eq!(e.result_code(), ResultCode::NoSuchObject);
    }
}
