//! The authentication stack.
//!
//! An ordered list of backends is tried in turn; each entry can override the
//! action taken per failure kind (`break` or `continue`). Failure counters
//! shape the composite error surfaced when no backend succeeds.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use log::{debug, info};
use serde_yaml::{Mapping, Value};

use crate::config::Config;
use crate::dit::Dit;
use crate::proto::AuthChoice;
use crate::result::{LdapError, Result};
use crate::simple_auth::SimpleAuthBackend;

/// Failure kinds an auth backend can report.
#[derive(Clone, Debug)]
pub enum AuthError {
    /// The name does not map to a stored credential.
    NameDoesNotExist,
    /// Credentials were found but do not match.
    InvalidCredentials,
    /// The request's authentication choice is not supported; surfaces
    /// immediately regardless of stack configuration.
    MethodNotSupported(String),
    /// Any other failure.
    Failure(String),
}

impl AuthError {
    pub fn stack_key(&self) -> &'static str {
        match self {
            AuthError::NameDoesNotExist => "user_unknown",
            AuthError::InvalidCredentials => "bad_creds",
            AuthError::MethodNotSupported(_) | AuthError::Failure(_) => "error",
        }
    }

    pub fn default_action(&self) -> StackAction {
        match self {
            AuthError::NameDoesNotExist => StackAction::Continue,
            _ => StackAction::Break,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum StackAction {
    Break,
    Continue,
}

impl StackAction {
    fn parse(action: &str) -> Result<StackAction> {
        match action {
            "break" => Ok(StackAction::Break),
            "continue" => Ok(StackAction::Continue),
            _ => Err(LdapError::Config(
                "unknown auth stack action, must be break/continue".to_owned(),
            )),
        }
    }
}

#[async_trait]
pub trait AuthBackend: Send + Sync {
    /// Authenticate `name` with the given choice, returning the
    /// authenticated (possibly mapped) name.
    async fn authenticate(
        &self,
        name: &str,
        auth_choice: &AuthChoice,
    ) -> std::result::Result<String, AuthError>;
}

struct AuthStackEntry {
    backend: String,
    actions: HashMap<&'static str, StackAction>,
}

const STACK_KEYS: [&str; 3] = ["user_unknown", "bad_creds", "error"];

pub struct AuthStack {
    stack: Vec<AuthStackEntry>,
    backends: HashMap<String, Arc<dyn AuthBackend>>,
}

impl AuthStack {
    pub fn new(stack_conf: &[Value], backend_conf: &Mapping, dit: &Arc<Dit>) -> Result<AuthStack> {
        let mut backends: HashMap<String, Arc<dyn AuthBackend>> = HashMap::new();
        for (name, conf) in backend_conf {
            let name = name
                .as_str()
                .ok_or_else(|| LdapError::Config("auth backend name must be a string".to_owned()))?;
            let conf = Config::from_value(conf.clone())?;
            let backend: Arc<dyn AuthBackend> = match conf.get_str("type").unwrap_or("simple") {
                "simple" => Arc::new(SimpleAuthBackend::new(&conf, dit.clone())?),
                other => {
                    return Err(LdapError::Config(format!(
                        "unknown auth backend type {}",
                        other
                    )))
                }
            };
            backends.insert(name.to_owned(), backend);
        }

        let mut stack = Vec::new();
        for entry in stack_conf {
            let entry = entry.as_mapping().ok_or_else(|| {
                LdapError::Config("auth_stack entries must be mappings".to_owned())
            })?;
            let backend = entry
                .get(&Value::String("backend".to_owned()))
                .and_then(Value::as_str)
                .ok_or_else(|| {
                    LdapError::Config("auth_stack entries must name a backend".to_owned())
                })?
                .to_owned();
            if !backends.contains_key(&backend) {
                return Err(LdapError::Config(format!(
                    "auth_stack backend {} does not exist",
                    backend
                )));
            }
            let mut actions = HashMap::new();
            for key in STACK_KEYS {
                if let Some(action) = entry
                    .get(&Value::String(key.to_owned()))
                    .and_then(Value::as_str)
                {
                    actions.insert(key, StackAction::parse(action)?);
                }
            }
            stack.push(AuthStackEntry { backend, actions });
        }
        Ok(AuthStack { stack, backends })
    }

    pub async fn authenticate(&self, name: &str, auth_choice: &AuthChoice) -> Result<String> {
        info!("{} trying to authenticate", name);
        let mut res_counters: HashMap<&'static str, u32> = HashMap::new();
        for entry in &self.stack {
            let backend = self
                .backends
                .get(&entry.backend)
                .expect("stack entries are validated against the backend map");
            match backend.authenticate(name, auth_choice).await {
                Ok(authed_name) => {
                    info!(
                        "{} successfully authenticated as {} with auth_backend {}",
                        name, authed_name, entry.backend
                    );
                    return Ok(authed_name);
                }
                Err(AuthError::MethodNotSupported(method)) => {
                    return Err(LdapError::AuthMethodNotSupported(method));
                }
                Err(e) => {
                    debug!(
                        "{} failed to authenticate with backend {}: {:?}",
                        name, entry.backend, e
                    );
                    let key = e.stack_key();
                    *res_counters.entry(key).or_insert(0) += 1;
                    let action = entry
                        .actions
                        .get(key)
                        .copied()
                        .unwrap_or_else(|| e.default_action());
                    match action {
                        StackAction::Break => break,
                        StackAction::Continue => continue,
                    }
                }
            }
        }

        // no auth backend could authenticate the user with the provided
        // credentials
        let summary = {
            let mut parts: Vec<String> = res_counters
                .iter()
                .map(|(key, count)| format!("{}={}", key, count))
                .collect();
            parts.sort();
            parts.join(", ")
        };
        info!("{} failed to authenticate. Stack results: {}", name, summary);
        if res_counters.get("bad_creds").copied().unwrap_or(0) > 0 {
            Err(LdapError::InvalidCredentials(format!(
                "provided bind credentials are not valid. Stack results: {}",
                summary
            )))
        } else if res_counters.get("user_unknown").copied().unwrap_or(0) > 0 {
            Err(LdapError::InvalidCredentials(format!(
                "provided bind user does not exist. Stack results: {}",
                summary
            )))
        } else {
            Err(LdapError::InvalidCredentials(format!(
                "could not complete authentication, stack results: {}",
                summary
            )))
        }
    }
}
