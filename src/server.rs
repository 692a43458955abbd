//! Listener set and server assembly.
//!
//! One acceptor per configured URI: `ldap://` is cleartext TCP, `ldaps://`
//! wraps the accepted stream in a server-side TLS context, `ldapi://` is a
//! UNIX stream socket. All acceptors run concurrently and forever.

use std::path::Path;
use std::sync::Arc;

use futures::future::try_join_all;
use log::{debug, info, warn};
use percent_encoding::percent_decode_str;
use serde_yaml::{Mapping, Value};
use tokio::net::TcpListener;
#[cfg(unix)]
use tokio::net::UnixListener;
use tokio_rustls::TlsAcceptor;
use url::Url;

use crate::auth::AuthStack;
use crate::client::ClientHandler;
use crate::config::Config;
use crate::dit::Dit;
use crate::result::{LdapError, Result};
use crate::schema::Schema;
use crate::Globals;

pub struct LdapServer {
    uri: String,
    conf: Config,
    globals: Arc<Globals>,
}

impl LdapServer {
    pub fn new(uri: &str, conf: Config, globals: Arc<Globals>) -> LdapServer {
        LdapServer {
            uri: uri.to_owned(),
            conf,
            globals,
        }
    }

    pub async fn run(&self) -> Result<()> {
        if let Some(path) = self.uri.strip_prefix("ldapi://") {
            let path = percent_decode_str(path).decode_utf8_lossy().into_owned();
            if path.is_empty() {
                return Err(LdapError::Config(
                    "empty Unix domain socket path".to_owned(),
                ));
            }
            return self.run_unix(&path).await;
        }
        let url = Url::parse(&self.uri)
            .map_err(|e| LdapError::Config(format!("invalid listener URI {}: {}", self.uri, e)))?;
        let mut port = 389;
        let tls = match url.scheme() {
            "ldap" => false,
            "ldaps" => {
                port = 636;
                true
            }
            scheme => {
                return Err(LdapError::Config(format!(
                    "unsupported scheme {}",
                    scheme
                )))
            }
        };
        if let Some(url_port) = url.port() {
            port = url_port;
        }
        let addr = format!("{}:{}", url.host_str().unwrap_or("localhost"), port);
        if tls {
            self.run_tls(&addr).await
        } else {
            self.run_tcp(&addr).await
        }
    }

    async fn run_tcp(&self, addr: &str) -> Result<()> {
        let listener = TcpListener::bind(addr).await?;
        info!("listening on ldap://{}", addr);
        loop {
            let (stream, peer) = listener.accept().await?;
            let globals = self.globals.clone();
            tokio::spawn(async move {
                ClientHandler::new(stream, peer.to_string(), globals)
                    .run()
                    .await;
            });
        }
    }

    async fn run_tls(&self, addr: &str) -> Result<()> {
        let acceptor = self.tls_acceptor()?;
        let listener = TcpListener::bind(addr).await?;
        info!("listening on ldaps://{}", addr);
        loop {
            let (stream, peer) = listener.accept().await?;
            let acceptor = acceptor.clone();
            let globals = self.globals.clone();
            tokio::spawn(async move {
                match acceptor.accept(stream).await {
                    Ok(tls_stream) => {
                        ClientHandler::new(tls_stream, peer.to_string(), globals)
                            .run()
                            .await;
                    }
                    Err(e) => warn!("{}: TLS accept failed: {}", peer, e),
                }
            });
        }
    }

    #[cfg(unix)]
    async fn run_unix(&self, path: &str) -> Result<()> {
        let listener = UnixListener::bind(path)?;
        info!("listening on ldapi://{}", path);
        loop {
            let (stream, _) = listener.accept().await?;
            let globals = self.globals.clone();
            tokio::spawn(async move {
                ClientHandler::new(stream, format!("ldapi:{}", std::process::id()), globals)
                    .run()
                    .await;
            });
        }
    }

    #[cfg(not(unix))]
    async fn run_unix(&self, _path: &str) -> Result<()> {
        Err(LdapError::Config(
            "ldapi listeners are only available on unix".to_owned(),
        ))
    }

    /// Server-side TLS context from the listener's `certificate`,
    /// `private_key` and `client_verify` settings.
    fn tls_acceptor(&self) -> Result<TlsAcceptor> {
        let cert_path = self.conf.get_str("certificate").ok_or_else(|| {
            LdapError::Config("ldaps listeners require a certificate".to_owned())
        })?;
        let key_path = self.conf.get_str("private_key").ok_or_else(|| {
            LdapError::Config("ldaps listeners require a private_key".to_owned())
        })?;
        let certs = load_certs(cert_path)?;
        let key = load_private_key(key_path)?;

        let builder = rustls::ServerConfig::builder().with_safe_defaults();
        let config = match self.conf.section("client_verify") {
            Some(verify) => {
                let mut roots = rustls::RootCertStore::empty();
                if verify.get_bool("use_system_ca_store", true) {
                    let native = rustls_native_certs::load_native_certs().map_err(|e| {
                        LdapError::Config(format!("cannot load system CA store: {}", e))
                    })?;
                    for cert in native {
                        let _ = roots.add(&rustls::Certificate(cert.0));
                    }
                }
                if let Some(ca_file) = verify.get_str("ca_file") {
                    for cert in load_certs(ca_file)? {
                        roots.add(&cert).map_err(|e| {
                            LdapError::Config(format!("bad CA certificate in {}: {}", ca_file, e))
                        })?;
                    }
                }
                if let Some(ca_path) = verify.get_str("ca_path") {
                    for entry in std::fs::read_dir(ca_path)
                        .map_err(|e| LdapError::Config(format!("cannot read {}: {}", ca_path, e)))?
                    {
                        let path = entry
                            .map_err(|e| LdapError::Config(e.to_string()))?
                            .path();
                        if path.extension().and_then(|e| e.to_str()) == Some("pem") {
                            for cert in load_certs(&path.to_string_lossy())? {
                                let _ = roots.add(&cert);
                            }
                        }
                    }
                }
                if verify.get_bool("check_crl", false) {
                    warn!(
                        "client_verify.check_crl needs CRLs supplied to the TLS backend and is \
                         ignored"
                    );
                }
                let verifier = if verify.get_bool("required", false) {
                    rustls::server::AllowAnyAuthenticatedClient::new(roots).boxed()
                } else {
                    rustls::server::AllowAnyAnonymousOrAuthenticatedClient::new(roots).boxed()
                };
                builder.with_client_cert_verifier(verifier)
            }
            None => builder.with_no_client_auth(),
        }
        .with_single_cert(certs, key)
        .map_err(|e| LdapError::Config(format!("TLS configuration: {}", e)))?;
        Ok(TlsAcceptor::from(Arc::new(config)))
    }
}

fn load_certs(path: &str) -> Result<Vec<rustls::Certificate>> {
    let file = std::fs::File::open(path)
        .map_err(|e| LdapError::Config(format!("cannot read {}: {}", path, e)))?;
    let mut reader = std::io::BufReader::new(file);
    let certs = rustls_pemfile::certs(&mut reader)
        .map_err(|e| LdapError::Config(format!("bad PEM in {}: {}", path, e)))?;
    if certs.is_empty() {
        return Err(LdapError::Config(format!("no certificates in {}", path)));
    }
    Ok(certs.into_iter().map(rustls::Certificate).collect())
}

fn load_private_key(path: &str) -> Result<rustls::PrivateKey> {
    let open = || {
        std::fs::File::open(path)
            .map(std::io::BufReader::new)
            .map_err(|e| LdapError::Config(format!("cannot read {}: {}", path, e)))
    };
    let mut keys = rustls_pemfile::pkcs8_private_keys(&mut open()?)
        .map_err(|e| LdapError::Config(format!("bad PEM in {}: {}", path, e)))?;
    if keys.is_empty() {
        keys = rustls_pemfile::rsa_private_keys(&mut open()?)
            .map_err(|e| LdapError::Config(format!("bad PEM in {}: {}", path, e)))?;
    }
    keys.into_iter()
        .next()
        .map(rustls::PrivateKey)
        .ok_or_else(|| LdapError::Config(format!("no private key in {}", path)))
}

pub struct LaurelinServer {
    servers: Vec<LdapServer>,
}

impl LaurelinServer {
    pub fn new(conf: &Config, globals: Arc<Globals>) -> Result<LaurelinServer> {
        let listeners = conf
            .get_mapping("listeners")
            .ok_or_else(|| LdapError::Config("no listeners configured".to_owned()))?;
        let mut servers = Vec::new();
        for (uri, server_conf) in listeners {
            let uri = uri
                .as_str()
                .ok_or_else(|| LdapError::Config("listener URI must be a string".to_owned()))?;
            debug!("setting up LDAP server {}", uri);
            let server_conf = match server_conf {
                Value::Null => Config::new(),
                value => Config::from_value(value.clone())?,
            };
            servers.push(LdapServer::new(uri, server_conf, globals.clone()));
        }
        if servers.is_empty() {
            return Err(LdapError::Config("no listeners configured".to_owned()));
        }
        Ok(LaurelinServer { servers })
    }

    pub async fn run(&self) -> Result<()> {
        debug!("running LaurelinServer");
        try_join_all(self.servers.iter().map(|server| server.run())).await?;
        Ok(())
    }
}

/// Load a config file and run the server it describes. Schema first, then
/// the DIT, the auth stack, and finally the listeners.
pub async fn run_config_file(path: &str) -> Result<()> {
    let mut conf = Config::new();
    conf.load_file(path)?;
    debug!("loaded config file {}", path);

    let mut schema = Schema::new();
    schema.load_builtin()?;
    if let Some(dir) = conf.mget(&["schema", "extra_dir"]).and_then(Value::as_str) {
        schema.load_dir(Path::new(dir))?;
    }
    schema.resolve()?;
    let schema = Arc::new(schema);

    let dit_conf = conf
        .get_mapping("dit")
        .ok_or_else(|| LdapError::Config("no DIT nodes configured".to_owned()))?;
    let dit = Arc::new(Dit::new(dit_conf, schema.clone())?);

    let stack_conf = conf
        .get("auth_stack")
        .and_then(Value::as_sequence)
        .cloned()
        .unwrap_or_default();
    let empty = Mapping::new();
    let backend_conf = conf.get_mapping("auth_backends").unwrap_or(&empty);
    let auth = Arc::new(AuthStack::new(&stack_conf, backend_conf, &dit)?);

    let globals = Arc::new(Globals { schema, dit, auth });
    LaurelinServer::new(&conf, globals)?.run().await
}
