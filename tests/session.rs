//! End-to-end session scenarios over an in-memory transport.
//!
//! A real `ClientHandler` runs against one end of a duplex pipe; the tests
//! speak BER through the same codec from the other end.

use std::sync::Arc;

use futures::{SinkExt, StreamExt};
use tokio_util::codec::Framed;

use laurelin_server::auth::AuthStack;
use laurelin_server::client::ClientHandler;
use laurelin_server::dit::Dit;
use laurelin_server::password::prepare_password;
use laurelin_server::proto::{
    AddRequest, AuthChoice, BindRequest, CompareRequest, DerefAliases, LdapMsg, LdapResult,
    ProtocolOp, Scope, SearchRequest, OID_NOTICE_OF_DISCONNECTION,
};
use laurelin_server::protocol::LdapCodec;
use laurelin_server::result::ResultCode;
use laurelin_server::schema::Schema;
use laurelin_server::Globals;

type Client = Framed<tokio::io::DuplexStream, LdapCodec>;

fn make_schema() -> Arc<Schema> {
    let mut schema = Schema::new();
    schema.load_builtin().expect("builtin schema");
    schema.resolve().expect("schema resolution");
    Arc::new(schema)
}

fn make_globals(flat_auth: Option<&std::path::Path>) -> Arc<Globals> {
    let schema = make_schema();
    let dit_conf: serde_yaml::Value =
        serde_yaml::from_str("o=example: {data_backend: memory, default: true}").unwrap();
    let dit = Arc::new(Dit::new(dit_conf.as_mapping().unwrap(), schema.clone()).unwrap());

    let (stack_conf, backend_conf) = match flat_auth {
        Some(path) => (
            serde_yaml::from_str::<serde_yaml::Value>("- {backend: files}").unwrap(),
            serde_yaml::from_str::<serde_yaml::Value>(&format!(
                "files: {{type: simple, storage: flat, flat_filename: {}}}",
                path.display()
            ))
            .unwrap(),
        ),
        None => (
            serde_yaml::Value::Sequence(vec![]),
            serde_yaml::Value::Mapping(Default::default()),
        ),
    };
    let auth = Arc::new(
        AuthStack::new(
            stack_conf.as_sequence().unwrap(),
            backend_conf.as_mapping().unwrap(),
            &dit,
        )
        .unwrap(),
    );
    Arc::new(Globals { schema, dit, auth })
}

fn start_session(globals: Arc<Globals>) -> Client {
    let (client_io, server_io) = tokio::io::duplex(64 * 1024);
    tokio::spawn(ClientHandler::new(server_io, "test-client".to_owned(), globals).run());
    Framed::new(client_io, LdapCodec)
}

async fn recv(client: &mut Client) -> LdapMsg {
    client
        .next()
        .await
        .expect("connection still open")
        .expect("clean decode")
}

fn search(base: &str, scope: Scope) -> SearchRequest {
    SearchRequest {
        base: base.to_owned(),
        scope,
        deref: DerefAliases::Never,
        size_limit: 0,
        time_limit: 0,
        types_only: false,
        filter: None,
        attrs: vec![],
    }
}

fn result_of(op: ProtocolOp) -> LdapResult {
    match op {
        ProtocolOp::BindResponse(res)
        | ProtocolOp::SearchResultDone(res)
        | ProtocolOp::ModifyResponse(res)
        | ProtocolOp::AddResponse(res)
        | ProtocolOp::DelResponse(res)
        | ProtocolOp::ModDnResponse(res)
        | ProtocolOp::CompareResponse(res) => res,
        other => panic!("expected a result-bearing response, got {:?}", other),
    }
}

#[tokio::test]
async fn root_dse_search() {
    let mut client = start_session(make_globals(None));
    client
        .send(LdapMsg::new(1, ProtocolOp::SearchRequest(search("", Scope::Base))))
        .await
        .unwrap();

    let entry_msg = recv(&mut client).await;
    assert_eq!(entry_msg.msgid, 1);
    let entry = match entry_msg.op {
        ProtocolOp::SearchResultEntry(entry) => entry,
        other => panic!("expected root DSE entry, got {:?}", other),
    };
    assert_eq!(entry.dn, "");
    assert_eq!(
        entry.get_attr("namingContexts"),
        Some(&vec!["o=example".to_owned()])
    );
    assert_eq!(
        entry.get_attr("defaultNamingContext"),
        Some(&vec!["o=example".to_owned()])
    );
    assert_eq!(
        entry.get_attr("supportedLDAPVersion"),
        Some(&vec!["3".to_owned()])
    );
    assert_eq!(
        entry.get_attr("vendorName"),
        Some(&vec!["laurelin".to_owned()])
    );

    let done = recv(&mut client).await;
    assert_eq!(done.msgid, 1);
    assert_eq!(result_of(done.op).code, ResultCode::Success);
}

#[tokio::test]
async fn notice_of_disconnection_on_non_request() {
    let mut client = start_session(make_globals(None));
    // a response op is decodable but is not a recognized request
    client
        .send(LdapMsg::new(
            9,
            ProtocolOp::SearchResultDone(LdapResult::success("")),
        ))
        .await
        .unwrap();

    let notice = recv(&mut client).await;
    assert_eq!(notice.msgid, 0);
    match notice.op {
        ProtocolOp::ExtendedResponse(resp) => {
            assert_eq!(resp.res.code, ResultCode::ProtocolError);
            assert_eq!(resp.name.as_deref(), Some(OID_NOTICE_OF_DISCONNECTION));
        }
        other => panic!("expected notice of disconnection, got {:?}", other),
    }
    // and the server closes the connection
    assert!(client.next().await.is_none());
}

#[tokio::test]
async fn add_search_compare_flow() {
    let mut client = start_session(make_globals(None));

    for (i, (dn, sn)) in [
        ("ou=people,o=example", None),
        ("cn=alice,ou=people,o=example", Some("Liddell")),
        ("cn=bob,ou=people,o=example", Some("Builder")),
    ]
    .iter()
    .enumerate()
    {
        let mut attrs = vec![];
        if let Some(sn) = sn {
            attrs.push(("sn".to_owned(), vec![(*sn).to_owned()]));
        }
        client
            .send(LdapMsg::new(
                i as i32 + 1,
                ProtocolOp::AddRequest(AddRequest {
                    entry: (*dn).to_owned(),
                    attrs,
                }),
            ))
            .await
            .unwrap();
        let res = recv(&mut client).await;
        assert_eq!(result_of(res.op).code, ResultCode::Success);
    }

    // subtree search streams every entry, then exactly one done
    client
        .send(LdapMsg::new(
            10,
            ProtocolOp::SearchRequest(search("o=example", Scope::Subtree)),
        ))
        .await
        .unwrap();
    let mut entries = 0;
    loop {
        let msg = recv(&mut client).await;
        assert_eq!(msg.msgid, 10);
        match msg.op {
            ProtocolOp::SearchResultEntry(_) => entries += 1,
            ProtocolOp::SearchResultDone(res) => {
                assert_eq!(res.code, ResultCode::Success);
                break;
            }
            other => panic!("unexpected message {:?}", other),
        }
    }
    assert_eq!(entries, 4);

    // size limit truncates the stream
    let mut limited = search("o=example", Scope::Subtree);
    limited.size_limit = 2;
    client
        .send(LdapMsg::new(11, ProtocolOp::SearchRequest(limited)))
        .await
        .unwrap();
    let mut entries = 0;
    loop {
        let msg = recv(&mut client).await;
        match msg.op {
            ProtocolOp::SearchResultEntry(_) => entries += 1,
            ProtocolOp::SearchResultDone(_) => break,
            other => panic!("unexpected message {:?}", other),
        }
    }
    assert_eq!(entries, 2);

    // compare is three-valued
    client
        .send(LdapMsg::new(
            12,
            ProtocolOp::CompareRequest(CompareRequest {
                entry: "cn=alice,ou=people,o=example".to_owned(),
                attr: "sn".to_owned(),
                value: "Liddell".to_owned(),
            }),
        ))
        .await
        .unwrap();
    assert_eq!(
        result_of(recv(&mut client).await.op).code,
        ResultCode::CompareTrue
    );

    client
        .send(LdapMsg::new(
            13,
            ProtocolOp::CompareRequest(CompareRequest {
                entry: "cn=alice,ou=people,o=example".to_owned(),
                attr: "mail".to_owned(),
                value: "nope".to_owned(),
            }),
        ))
        .await
        .unwrap();
    assert_eq!(
        result_of(recv(&mut client).await.op).code,
        ResultCode::NoSuchAttribute
    );

    // searching under a missing base reports noSuchObject
    client
        .send(LdapMsg::new(
            14,
            ProtocolOp::SearchRequest(search("cn=nobody,ou=people,o=example", Scope::Base)),
        ))
        .await
        .unwrap();
    let res = result_of(recv(&mut client).await.op);
    assert_eq!(res.code, ResultCode::NoSuchObject);
    assert!(res.text.contains("found up to: ou=people,o=example"));
}

#[tokio::test]
async fn bind_against_flat_auth() {
    use base64::engine::general_purpose::STANDARD;
    use base64::Engine;
    use std::io::Write;

    let mut file = tempfile::NamedTempFile::new().unwrap();
    let stored = prepare_password("hunter2", "SSHA256").unwrap();
    writeln!(
        file,
        "{}:{}",
        STANDARD.encode("cn=admin,o=example"),
        stored
    )
    .unwrap();
    file.flush().unwrap();

    let mut client = start_session(make_globals(Some(file.path())));
    client
        .send(LdapMsg::new(
            1,
            ProtocolOp::BindRequest(BindRequest {
                version: 3,
                name: "cn=admin,o=example".to_owned(),
                auth: AuthChoice::Simple("hunter2".to_owned()),
            }),
        ))
        .await
        .unwrap();
    let res = result_of(recv(&mut client).await.op);
    assert_eq!(res.code, ResultCode::Success);

    client
        .send(LdapMsg::new(
            2,
            ProtocolOp::BindRequest(BindRequest {
                version: 3,
                name: "cn=admin,o=example".to_owned(),
                auth: AuthChoice::Simple("wrong".to_owned()),
            }),
        ))
        .await
        .unwrap();
    let res = result_of(recv(&mut client).await.op);
    assert_eq!(res.code, ResultCode::InvalidCredentials);

    // unbind closes the session without a response
    client
        .send(LdapMsg::new(3, ProtocolOp::UnbindRequest))
        .await
        .unwrap();
    assert!(client.next().await.is_none());
}

#[tokio::test]
async fn abandon_is_ignored() {
    let mut client = start_session(make_globals(None));
    client
        .send(LdapMsg::new(1, ProtocolOp::AbandonRequest(99)))
        .await
        .unwrap();
    // the session keeps serving requests afterwards
    client
        .send(LdapMsg::new(2, ProtocolOp::SearchRequest(search("", Scope::Base))))
        .await
        .unwrap();
    let msg = recv(&mut client).await;
    assert_eq!(msg.msgid, 2);
    assert!(matches!(msg.op, ProtocolOp::SearchResultEntry(_)));
}
