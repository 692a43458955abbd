//! Tokio codec for framing BER-encoded LDAP messages.
//!
//! The decoder buffers raw bytes and retries until a full message is
//! available; a partial element is not an error, the framed reader simply
//! waits for more bytes. Anything else the parser rejects is fatal and is
//! surfaced to the session layer, which takes the notice-of-disconnection
//! exit path.

use std::convert::TryFrom;
use std::io;

use bytes::{Buf, BytesMut};
use lber::parse::Parser;
use lber::structure::StructureTag;
use lber::write as lber_write;
use log::trace;
use nom::Err as NomErr;
use tokio_util::codec::{Decoder, Encoder};

use crate::proto::LdapMsg;

pub struct LdapCodec;

impl Decoder for LdapCodec {
    type Item = LdapMsg;
    type Error = io::Error;

    fn decode(&mut self, buf: &mut BytesMut) -> io::Result<Option<LdapMsg>> {
        let mut parser = Parser::new();
        let input = &buf[..];
        let (rest_len, tag) = match parser.parse(input) {
            Err(NomErr::Incomplete(_)) => return Ok(None),
            Err(_) => return Err(io::Error::new(io::ErrorKind::Other, "BER parse error")),
            Ok((rest, tag)) => (rest.len(), tag),
        };
        let size = input.len() - rest_len;
        if size == buf.len() {
            buf.clear();
        } else {
            buf.advance(size);
        }
        trace!("received tag: {:?}", tag);
        LdapMsg::try_from(tag)
            .map(Some)
            .map_err(|e| io::Error::new(io::ErrorKind::Other, e.to_string()))
    }
}

impl Encoder<LdapMsg> for LdapCodec {
    type Error = io::Error;

    fn encode(&mut self, msg: LdapMsg, buf: &mut BytesMut) -> io::Result<()> {
        let encoded: StructureTag = msg.into();
        trace!("sending tag: {:?}", encoded);
        lber_write::encode_into(buf, encoded)?;
        Ok(())
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::proto::{AuthChoice, BindRequest, ProtocolOp};

    #[test]
    fn decode_handles_arbitrary_segmentation() {
        let msg = LdapMsg::new(
            1,
            ProtocolOp::BindRequest(BindRequest {
                version: 3,
                name: "cn=admin,o=example".to_owned(),
                auth: AuthChoice::Simple("secret".to_owned()),
            }),
        );
        let mut full = BytesMut::new();
        LdapCodec.encode(msg.clone(), &mut full).unwrap();
        let full = full.to_vec();

        // feed one byte at a time; decoder keeps asking for more until the
        // whole element arrives
        let mut buf = BytesMut::new();
        let mut decoded = None;
        for byte in &full {
            buf.extend_from_slice(&[*byte]);
            if let Some(got) = LdapCodec.decode(&mut buf).unwrap() {
                decoded = Some(got);
            }
        }
        assert_eq!(decoded, Some(msg));
        assert!(buf.is_empty());
    }

    #[test]
    fn decode_two_messages_in_one_buffer() {
        let first = LdapMsg::new(1, ProtocolOp::UnbindRequest);
        let second = LdapMsg::new(2, ProtocolOp::AbandonRequest(1));
        let mut buf = BytesMut::new();
        LdapCodec.encode(first.clone(), &mut buf).unwrap();
        LdapCodec.encode(second.clone(), &mut buf).unwrap();
        assert_eq!(LdapCodec.decode(&mut buf).unwrap(), Some(first));
        assert_eq!(LdapCodec.decode(&mut buf).unwrap(), Some(second));
        assert_eq!(LdapCodec.decode(&mut buf).unwrap(), None);
    }

    #[test]
    fn garbage_is_fatal() {
        // a well-formed BER INTEGER is not an LDAPMessage
        let mut buf = BytesMut::from(&b"\x02\x01\x01"[..]);
        assert!(LdapCodec.decode(&mut buf).is_err());
    }
}
