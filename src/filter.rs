//! LDAP filters: text parsing (RFC 4515 plus infix AND/OR/NOT words),
//! wire decoding, and evaluation against an attribute map.

use std::convert::TryFrom;

use lber::common::TagClass;
use lber::structure::StructureTag;
use lber::structures::{Boolean, ExplicitTag, Null, OctetString, Sequence, Tag};
use lber::universal::Types;
use nom::branch::alt;
use nom::bytes::complete::{tag, take_while1};
use nom::character::complete::{char, multispace1};
use nom::combinator::{all_consuming, map, opt, recognize, verify};
use nom::multi::many0;
use nom::sequence::{delimited, pair, preceded};
use nom::IResult;

use crate::attrs::AttrsDict;
use crate::result::{LdapError, Result};

#[derive(Clone, Debug, PartialEq, Default)]
pub struct SubstringFilter {
    pub initial: Option<String>,
    pub any: Vec<String>,
    pub fin: Option<String>,
}

#[derive(Clone, Debug, PartialEq)]
pub struct ExtensibleFilter {
    pub rule: Option<String>,
    pub attr: Option<String>,
    pub value: String,
    pub dn_attributes: bool,
}

#[derive(Clone, Debug, PartialEq)]
pub enum Filter {
    And(Vec<Filter>),
    Or(Vec<Filter>),
    Not(Box<Filter>),
    Equality(String, String),
    Substrings(String, SubstringFilter),
    GreaterOrEqual(String, String),
    LessOrEqual(String, String),
    Present(String),
    Approx(String, String),
    Extensible(ExtensibleFilter),
    /// A wire filter choice this server does not know. Decodes fine,
    /// evaluates to a protocol-level `other`.
    Unrecognized(u64),
}

const AND_FILT: u64 = 0;
const OR_FILT: u64 = 1;
const NOT_FILT: u64 = 2;

const EQ_MATCH: u64 = 3;
const SUBSTR_MATCH: u64 = 4;
const GTE_MATCH: u64 = 5;
const LTE_MATCH: u64 = 6;
const PRES_MATCH: u64 = 7;
const APPROX_MATCH: u64 = 8;
const EXT_MATCH: u64 = 9;

const SUB_INITIAL: u64 = 0;
const SUB_ANY: u64 = 1;
const SUB_FINAL: u64 = 2;

/// Parse a filter string. Standard parenthesized syntax is accepted, as are
/// infix `AND` / `OR` / `NOT` words between parenthesized components.
pub fn parse(input: &str) -> Result<Filter> {
    match all_consuming(simple_expr)(input.trim().as_bytes()) {
        Ok((_, filter)) => Ok(filter),
        Err(_) => Err(LdapError::Other(format!("\"{}\" is not a valid filter", input))),
    }
}

fn simple_expr(input: &[u8]) -> IResult<&[u8], Filter> {
    let (input, first) = unary(input)?;
    let (input, rest) = many0(pair(
        delimited(multispace1, alt((tag("AND"), tag("OR"))), multispace1),
        unary,
    ))(input)?;
    let mut filter = first;
    for (op, operand) in rest {
        filter = match op {
            b"AND" => Filter::And(vec![filter, operand]),
            _ => Filter::Or(vec![filter, operand]),
        };
    }
    Ok((input, filter))
}

fn unary(input: &[u8]) -> IResult<&[u8], Filter> {
    alt((
        map(preceded(pair(tag("NOT"), multispace1), filtexpr), |f| {
            Filter::Not(Box::new(f))
        }),
        filtexpr,
    ))(input)
}

fn filtexpr(input: &[u8]) -> IResult<&[u8], Filter> {
    alt((filter, item))(input)
}

fn filter(input: &[u8]) -> IResult<&[u8], Filter> {
    delimited(char('('), filtercomp, char(')'))(input)
}

fn filtercomp(input: &[u8]) -> IResult<&[u8], Filter> {
    alt((and, or, not, item))(input)
}

fn filterlist(input: &[u8]) -> IResult<&[u8], Vec<Filter>> {
    many0(filter)(input)
}

fn and(input: &[u8]) -> IResult<&[u8], Filter> {
    map(preceded(char('&'), filterlist), Filter::And)(input)
}

fn or(input: &[u8]) -> IResult<&[u8], Filter> {
    map(preceded(char('|'), filterlist), Filter::Or)(input)
}

fn not(input: &[u8]) -> IResult<&[u8], Filter> {
    map(preceded(char('!'), filter), |f| Filter::Not(Box::new(f)))(input)
}

fn item(input: &[u8]) -> IResult<&[u8], Filter> {
    alt((eq, non_eq, extensible))(input)
}

enum Unescaper {
    WantFirst,
    WantSecond(u8),
    Value(u8),
    Error,
}

impl Unescaper {
    fn feed(&self, c: u8) -> Unescaper {
        match *self {
            Unescaper::Error => Unescaper::Error,
            Unescaper::WantFirst => {
                if c.is_ascii_hexdigit() {
                    Unescaper::WantSecond(c - if c <= b'9' { b'0' } else { (c & 0x20) + b'A' - 10 })
                } else {
                    Unescaper::Error
                }
            }
            Unescaper::WantSecond(partial) => {
                if c.is_ascii_hexdigit() {
                    Unescaper::Value(
                        (partial << 4) + (c - if c <= b'9' { b'0' } else { (c & 0x20) + b'A' - 10 }),
                    )
                } else {
                    Unescaper::Error
                }
            }
            Unescaper::Value(_) => {
                if c != b'\\' {
                    Unescaper::Value(c)
                } else {
                    Unescaper::WantFirst
                }
            }
        }
    }
}

fn is_value_char(c: u8) -> bool {
    c != 0 && c != b'(' && c != b')' && c != b'*'
}

// Any byte in the assertion value may be represented by \NN, where N is a hex
// digit. Parentheses, asterisk and backslash itself must be represented that
// way.
fn unescaped(input: &[u8]) -> IResult<&[u8], String> {
    let mut u = Unescaper::Value(0);
    let mut out = Vec::new();
    let mut end = input.len();
    for (i, &c) in input.iter().enumerate() {
        if !is_value_char(c) {
            end = i;
            break;
        }
        u = u.feed(c);
        match u {
            Unescaper::Value(v) => out.push(v),
            Unescaper::Error => {
                return Err(nom::Err::Error(nom::error::Error::new(
                    input,
                    nom::error::ErrorKind::Verify,
                )))
            }
            _ => {}
        }
    }
    match u {
        Unescaper::Value(_) => Ok((&input[end..], String::from_utf8_lossy(&out).into_owned())),
        _ => Err(nom::Err::Error(nom::error::Error::new(
            input,
            nom::error::ErrorKind::Verify,
        ))),
    }
}

fn eq(input: &[u8]) -> IResult<&[u8], Filter> {
    let (input, attr) = attributedescription(input)?;
    let (input, _) = char('=')(input)?;
    let (input, initial) = unescaped(input)?;
    let (input, mid_final) = many0(preceded(char('*'), unescaped))(input)?;
    // an empty element may exist only at the very end; otherwise, we have
    // two adjacent asterisks
    if mid_final
        .iter()
        .enumerate()
        .any(|(n, v)| v.is_empty() && n + 1 != mid_final.len())
    {
        return Err(nom::Err::Error(nom::error::Error::new(
            input,
            nom::error::ErrorKind::Verify,
        )));
    }
    let attr = String::from_utf8_lossy(attr).into_owned();
    let filter = if mid_final.is_empty() {
        // simple equality, no asterisks in assertion value
        Filter::Equality(attr, initial)
    } else if initial.is_empty() && mid_final.len() == 1 && mid_final[0].is_empty() {
        // presence, single asterisk in assertion value
        Filter::Present(attr)
    } else {
        let n = mid_final.len();
        let mut sub = SubstringFilter {
            initial: if initial.is_empty() { None } else { Some(initial) },
            ..Default::default()
        };
        for (i, elem) in mid_final.into_iter().enumerate() {
            if elem.is_empty() {
                break;
            }
            if i + 1 != n {
                sub.any.push(elem);
            } else {
                sub.fin = Some(elem);
            }
        }
        Filter::Substrings(attr, sub)
    };
    Ok((input, filter))
}

fn non_eq(input: &[u8]) -> IResult<&[u8], Filter> {
    let (input, attr) = attributedescription(input)?;
    let (input, filterop) = alt((tag(">="), tag("<="), tag("~=")))(input)?;
    let (input, value) = unescaped(input)?;
    let attr = String::from_utf8_lossy(attr).into_owned();
    let filter = match filterop {
        b">=" => Filter::GreaterOrEqual(attr, value),
        b"<=" => Filter::LessOrEqual(attr, value),
        _ => Filter::Approx(attr, value),
    };
    Ok((input, filter))
}

fn extensible(input: &[u8]) -> IResult<&[u8], Filter> {
    alt((attr_dn_mrule, dn_mrule))(input)
}

fn attr_dn_mrule(input: &[u8]) -> IResult<&[u8], Filter> {
    let (input, attr) = attributedescription(input)?;
    let (input, dn) = opt(tag(":dn"))(input)?;
    let (input, mrule) = opt(preceded(char(':'), attributetype))(input)?;
    let (input, _) = tag(":=")(input)?;
    let (input, value) = unescaped(input)?;
    Ok((
        input,
        Filter::Extensible(ExtensibleFilter {
            rule: mrule.map(|m| String::from_utf8_lossy(m).into_owned()),
            attr: Some(String::from_utf8_lossy(attr).into_owned()),
            value,
            dn_attributes: dn.is_some(),
        }),
    ))
}

fn dn_mrule(input: &[u8]) -> IResult<&[u8], Filter> {
    let (input, dn) = opt(tag(":dn"))(input)?;
    let (input, mrule) = preceded(char(':'), attributetype)(input)?;
    let (input, _) = tag(":=")(input)?;
    let (input, value) = unescaped(input)?;
    Ok((
        input,
        Filter::Extensible(ExtensibleFilter {
            rule: Some(String::from_utf8_lossy(mrule).into_owned()),
            attr: None,
            value,
            dn_attributes: dn.is_some(),
        }),
    ))
}

fn attributedescription(input: &[u8]) -> IResult<&[u8], &[u8]> {
    recognize(pair(
        attributetype,
        many0(preceded(char(';'), take_while1(is_alnum_hyphen))),
    ))(input)
}

fn attributetype(input: &[u8]) -> IResult<&[u8], &[u8]> {
    alt((numericoid, descr))(input)
}

fn numericoid(input: &[u8]) -> IResult<&[u8], &[u8]> {
    recognize(pair(number, many0(preceded(char('.'), number))))(input)
}

// A number may be zero, but must not have superfluous leading zeroes
fn number(input: &[u8]) -> IResult<&[u8], &[u8]> {
    verify(take_while1(|c: u8| c.is_ascii_digit()), |d: &[u8]| {
        d.len() == 1 || d[0] != b'0'
    })(input)
}

fn descr(input: &[u8]) -> IResult<&[u8], &[u8]> {
    verify(take_while1(is_alnum_hyphen), |s: &[u8]| {
        s[0].is_ascii_alphabetic()
    })(input)
}

fn is_alnum_hyphen(c: u8) -> bool {
    c.is_ascii_alphanumeric() || c == b'-'
}

fn decode_err(what: &str) -> LdapError {
    LdapError::Other(format!("malformed {} filter", what))
}

fn primitive_string(tag: StructureTag) -> Result<String> {
    tag.expect_primitive()
        .map(|bytes| String::from_utf8_lossy(&bytes).into_owned())
        .ok_or_else(|| decode_err("component of"))
}

impl TryFrom<StructureTag> for Filter {
    type Error = LdapError;

    fn try_from(tag: StructureTag) -> Result<Filter> {
        if tag.class != TagClass::Context {
            return Err(decode_err("untagged"));
        }
        match tag.id {
            AND_FILT | OR_FILT => {
                let id = tag.id;
                let children = tag.expect_constructed().ok_or_else(|| decode_err("and/or"))?;
                let mut inner = Vec::with_capacity(children.len());
                for child in children {
                    inner.push(Filter::try_from(child)?);
                }
                Ok(if id == AND_FILT {
                    Filter::And(inner)
                } else {
                    Filter::Or(inner)
                })
            }
            NOT_FILT => {
                let mut children = tag.expect_constructed().ok_or_else(|| decode_err("not"))?;
                if children.len() != 1 {
                    return Err(decode_err("not"));
                }
                Ok(Filter::Not(Box::new(Filter::try_from(
                    children.pop().expect("single child"),
                )?)))
            }
            EQ_MATCH | GTE_MATCH | LTE_MATCH | APPROX_MATCH => {
                let id = tag.id;
                let mut parts = tag.expect_constructed().ok_or_else(|| decode_err("ava"))?;
                if parts.len() != 2 {
                    return Err(decode_err("ava"));
                }
                let value = primitive_string(parts.pop().expect("value"))?;
                let attr = primitive_string(parts.pop().expect("attr"))?;
                Ok(match id {
                    EQ_MATCH => Filter::Equality(attr, value),
                    GTE_MATCH => Filter::GreaterOrEqual(attr, value),
                    LTE_MATCH => Filter::LessOrEqual(attr, value),
                    _ => Filter::Approx(attr, value),
                })
            }
            SUBSTR_MATCH => {
                let mut parts = tag
                    .expect_constructed()
                    .ok_or_else(|| decode_err("substrings"))?;
                if parts.len() != 2 {
                    return Err(decode_err("substrings"));
                }
                let subs = parts
                    .pop()
                    .expect("substrings")
                    .expect_constructed()
                    .ok_or_else(|| decode_err("substrings"))?;
                let attr = primitive_string(parts.pop().expect("attr"))?;
                let mut sub = SubstringFilter::default();
                for part in subs {
                    let id = part.id;
                    let value = primitive_string(part)?;
                    match id {
                        SUB_INITIAL => sub.initial = Some(value),
                        SUB_ANY => sub.any.push(value),
                        SUB_FINAL => sub.fin = Some(value),
                        _ => return Err(decode_err("substrings")),
                    }
                }
                Ok(Filter::Substrings(attr, sub))
            }
            PRES_MATCH => Ok(Filter::Present(primitive_string(tag)?)),
            EXT_MATCH => {
                let parts = tag
                    .expect_constructed()
                    .ok_or_else(|| decode_err("extensibleMatch"))?;
                let mut ext = ExtensibleFilter {
                    rule: None,
                    attr: None,
                    value: String::new(),
                    dn_attributes: false,
                };
                for part in parts {
                    let id = part.id;
                    match id {
                        1 => ext.rule = Some(primitive_string(part)?),
                        2 => ext.attr = Some(primitive_string(part)?),
                        3 => ext.value = primitive_string(part)?,
                        4 => {
                            let bytes = part
                                .expect_primitive()
                                .ok_or_else(|| decode_err("extensibleMatch"))?;
                            ext.dn_attributes = bytes.first().copied().unwrap_or(0) != 0;
                        }
                        _ => return Err(decode_err("extensibleMatch")),
                    }
                }
                Ok(Filter::Extensible(ext))
            }
            other => Ok(Filter::Unrecognized(other)),
        }
    }
}

/// Evaluate a filter against an attribute map. An absent filter matches
/// every object.
pub fn matches(filter: Option<&Filter>, attrs: &AttrsDict) -> Result<bool> {
    let filter = match filter {
        Some(filter) => filter,
        None => return Ok(true),
    };
    match filter {
        Filter::And(children) => {
            for child in children {
                if !matches(Some(child), attrs)? {
                    return Ok(false);
                }
            }
            Ok(true)
        }
        Filter::Or(children) => {
            for child in children {
                if matches(Some(child), attrs)? {
                    return Ok(true);
                }
            }
            Ok(false)
        }
        Filter::Not(child) => Ok(!matches(Some(child), attrs)?),
        Filter::Equality(attr, value) => match attrs.get(attr) {
            Some(vals) => vals.equals(value),
            None => Ok(false),
        },
        Filter::Substrings(attr, sub) => match attrs.get(attr) {
            Some(vals) => vals.match_substrings(sub.initial.as_deref(), &sub.any, sub.fin.as_deref()),
            None => Ok(false),
        },
        Filter::GreaterOrEqual(attr, value) => match attrs.get(attr) {
            Some(vals) => Ok(!vals.less_than(value)?),
            None => Ok(false),
        },
        Filter::LessOrEqual(attr, value) => match attrs.get(attr) {
            Some(vals) => Ok(vals.less_than(value)? || vals.equals(value)?),
            None => Ok(false),
        },
        // every object has an objectClass, even when the entry does not
        // spell it out
        Filter::Present(attr) => {
            Ok(attr.eq_ignore_ascii_case("objectClass") || attrs.contains_attr(attr))
        }
        Filter::Approx(attr, value) => match attrs.get(attr) {
            Some(vals) => vals.match_approx(value),
            None => Ok(false),
        },
        Filter::Extensible(_) => Err(LdapError::Other(
            "extensible match filters are not implemented".to_owned(),
        )),
        Filter::Unrecognized(id) => Err(LdapError::Other(format!(
            "non-standard filter type {} in search request is unhandled",
            id
        ))),
    }
}

impl From<Filter> for Tag {
    fn from(filter: Filter) -> Tag {
        fn octets(class: TagClass, id: u64, value: String) -> Tag {
            Tag::OctetString(OctetString {
                class,
                id,
                inner: value.into_bytes(),
            })
        }
        fn ava(id: u64, attr: String, value: String) -> Tag {
            Tag::Sequence(Sequence {
                class: TagClass::Context,
                id,
                inner: vec![
                    octets(TagClass::Universal, Types::OctetString as u64, attr),
                    octets(TagClass::Universal, Types::OctetString as u64, value),
                ],
            })
        }
        match filter {
            Filter::And(children) => Tag::Sequence(Sequence {
                class: TagClass::Context,
                id: AND_FILT,
                inner: children.into_iter().map(Tag::from).collect(),
            }),
            Filter::Or(children) => Tag::Sequence(Sequence {
                class: TagClass::Context,
                id: OR_FILT,
                inner: children.into_iter().map(Tag::from).collect(),
            }),
            Filter::Not(child) => Tag::ExplicitTag(ExplicitTag {
                class: TagClass::Context,
                id: NOT_FILT,
                inner: Box::new(Tag::from(*child)),
            }),
            Filter::Equality(attr, value) => ava(EQ_MATCH, attr, value),
            Filter::GreaterOrEqual(attr, value) => ava(GTE_MATCH, attr, value),
            Filter::LessOrEqual(attr, value) => ava(LTE_MATCH, attr, value),
            Filter::Approx(attr, value) => ava(APPROX_MATCH, attr, value),
            Filter::Present(attr) => octets(TagClass::Context, PRES_MATCH, attr),
            Filter::Substrings(attr, sub) => {
                let mut parts = Vec::new();
                if let Some(initial) = sub.initial {
                    parts.push(octets(TagClass::Context, SUB_INITIAL, initial));
                }
                for any in sub.any {
                    parts.push(octets(TagClass::Context, SUB_ANY, any));
                }
                if let Some(fin) = sub.fin {
                    parts.push(octets(TagClass::Context, SUB_FINAL, fin));
                }
                Tag::Sequence(Sequence {
                    class: TagClass::Context,
                    id: SUBSTR_MATCH,
                    inner: vec![
                        octets(TagClass::Universal, Types::OctetString as u64, attr),
                        Tag::Sequence(Sequence {
                            inner: parts,
                            ..Default::default()
                        }),
                    ],
                })
            }
            Filter::Extensible(ext) => {
                let mut inner = Vec::new();
                if let Some(rule) = ext.rule {
                    inner.push(octets(TagClass::Context, 1, rule));
                }
                if let Some(attr) = ext.attr {
                    inner.push(octets(TagClass::Context, 2, attr));
                }
                inner.push(octets(TagClass::Context, 3, ext.value));
                if ext.dn_attributes {
                    inner.push(Tag::Boolean(Boolean {
                        class: TagClass::Context,
                        id: 4,
                        inner: true,
                    }));
                }
                Tag::Sequence(Sequence {
                    class: TagClass::Context,
                    id: EXT_MATCH,
                    inner,
                })
            }
            Filter::Unrecognized(id) => Tag::Null(Null {
                class: TagClass::Context,
                id,
                inner: (),
            }),
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::schema::test_schema;

    #[test]
    fn parse_eq_and_presence() {
        assert_eq!(
            parse("(cn=test)").unwrap(),
            Filter::Equality("cn".into(), "test".into())
        );
        assert_eq!(parse("(cn=*)").unwrap(), Filter::Present("cn".into()));
    }

    #[test]
    fn parse_substrings() {
        let f = parse("(cn=ab*cd*ef)").unwrap();
        assert_eq!(
            f,
            Filter::Substrings(
                "cn".into(),
                SubstringFilter {
                    initial: Some("ab".into()),
                    any: vec!["cd".into()],
                    fin: Some("ef".into()),
                }
            )
        );
        let f = parse("(cn=ab*)").unwrap();
        assert_eq!(
            f,
            Filter::Substrings(
                "cn".into(),
                SubstringFilter {
                    initial: Some("ab".into()),
                    any: vec![],
                    fin: None,
                }
            )
        );
    }

    #[test]
    fn parse_boolean_composition() {
        let f = parse("(&(objectClass=person)(|(cn=a*)(sn=b)))").unwrap();
        match f {
            Filter::And(children) => {
                assert_eq!(children.len(), 2);
                assert!(matches!(children[1], Filter::Or(_)));
            }
            other => panic!("expected And, got {:?}", other),
        }
    }

    #[test]
    fn parse_infix_words() {
        let f = parse("NOT (foo=nope) AND (abc=def) AND (ghi=mno)").unwrap();
        match f {
            Filter::And(children) => {
                assert!(matches!(children[0], Filter::And(_)));
            }
            other => panic!("expected And, got {:?}", other),
        }
    }

    #[test]
    fn parse_escapes() {
        assert_eq!(
            parse("(cn=a\\2ab)").unwrap(),
            Filter::Equality("cn".into(), "a*b".into())
        );
        assert!(parse("(cn=a**b)").is_err());
        assert!(parse("(cn=\\zz)").is_err());
    }

    #[test]
    fn evaluation_semantics() {
        let schema = test_schema();
        let attrs = crate::attrs::AttrsDict::from_pairs(
            schema,
            vec![
                ("foo".into(), vec!["bar".into(), "baz".into()]),
                ("abc".into(), vec!["def".into()]),
                ("ghi".into(), vec!["jkl".into(), "mno".into()]),
            ],
        );
        for good in [
            "(foo=bar)",
            "(&(foo=bar)(abc=def)(ghi=jkl))",
            "(|(ghi=mno)(doesnotexist=foo))",
            "(!(foo=nope))",
            "NOT (foo=nope) AND (abc=def) AND (ghi=mno)",
        ] {
            let f = parse(good).unwrap();
            assert!(matches(Some(&f), &attrs).unwrap(), "expected pass: {}", good);
        }
        let f = parse("(foo=nope)").unwrap();
        assert!(!matches(Some(&f), &attrs).unwrap());
        // absent filter matches everything
        assert!(matches(None, &attrs).unwrap());
        // objectClass presence is unconditionally true
        let f = parse("(objectClass=*)").unwrap();
        assert!(matches(Some(&f), &attrs).unwrap());
    }

    #[test]
    fn extensible_is_unevaluated() {
        let schema = test_schema();
        let attrs = crate::attrs::AttrsDict::new(schema);
        let f = parse("(cn:dn:2.5.13.2:=test)").unwrap();
        assert!(matches!(f, Filter::Extensible(_)));
        assert!(matches(Some(&f), &attrs).is_err());
    }

    #[test]
    fn wire_decode() {
        use lber::structures::{ASNTag, OctetString, Sequence, Tag};

        let tag = Tag::Sequence(Sequence {
            class: TagClass::Context,
            id: EQ_MATCH,
            inner: vec![
                Tag::OctetString(OctetString {
                    inner: b"cn".to_vec(),
                    ..Default::default()
                }),
                Tag::OctetString(OctetString {
                    inner: b"test".to_vec(),
                    ..Default::default()
                }),
            ],
        })
        .into_structure();
        assert_eq!(
            Filter::try_from(tag).unwrap(),
            Filter::Equality("cn".into(), "test".into())
        );

        let pres = Tag::OctetString(OctetString {
            class: TagClass::Context,
            id: PRES_MATCH,
            inner: b"objectClass".to_vec(),
        })
        .into_structure();
        assert_eq!(
            Filter::try_from(pres).unwrap(),
            Filter::Present("objectClass".into())
        );
    }
}
