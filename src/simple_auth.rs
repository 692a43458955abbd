//! Simple-password authentication backend.
//!
//! Credentials come either from `userPassword` attributes in the global DIT
//! (via the internal client) or from a `b64(user):stored` flat file. Client
//! names pass through an ordered list of regex maps before lookup.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use regex::Regex;

use crate::auth::{AuthBackend, AuthError};
use crate::config::Config;
use crate::dit::Dit;
use crate::filter::{self, Filter};
use crate::internal_client::InternalClient;
use crate::password::check_password;
use crate::proto::{AuthChoice, DerefAliases, Scope};
use crate::result::{LdapError, Result};

const MAIN_FILTER: &str = "(userPassword=*)";
const RETURN_ATTRS: &[&str] = &["userPassword"];

/// Utilizes standard userPassword attributes on objects in the global DIT.
struct LdapStorage {
    client: InternalClient,
    filter: Filter,
    deref: DerefAliases,
    multi: bool,
}

impl LdapStorage {
    fn new(conf: &Config, dit: Arc<Dit>) -> Result<LdapStorage> {
        let filter = match conf.get_str("ldap_filter") {
            Some(custom) => filter::parse(&format!("{} AND {}", MAIN_FILTER, custom))
                .map_err(|_| LdapError::Config("ldap_filter is not a valid filter".to_owned()))?,
            None => filter::parse(MAIN_FILTER).expect("main password filter"),
        };
        let deref = match conf.get_str("ldap_deref_aliases") {
            Some(name) => DerefAliases::from_name(name).ok_or_else(|| {
                LdapError::Config("invalid value for ldap_deref_aliases".to_owned())
            })?,
            None => DerefAliases::Never,
        };
        Ok(LdapStorage {
            client: InternalClient::new(dit),
            filter,
            deref,
            multi: conf.get_bool("ldap_multiple_passwords", false),
        })
    }

    async fn authenticate(
        &self,
        mapped_name: &str,
        input_password: &str,
    ) -> std::result::Result<(), AuthError> {
        let entries = self
            .client
            .search(
                mapped_name,
                Scope::Base,
                Some(self.filter.clone()),
                RETURN_ATTRS.iter().map(|a| (*a).to_owned()).collect(),
                Some(self.deref),
                false,
                0,
                0,
            )
            .await
            .map_err(|e| match e {
                LdapError::NoSuchObject(_)
                | LdapError::BaseObjectNotFound { .. }
                | LdapError::InvalidDn(_) => AuthError::NameDoesNotExist,
                e => AuthError::Failure(e.to_string()),
            })?;
        let user = entries
            .into_iter()
            .next()
            .ok_or(AuthError::NameDoesNotExist)?;
        let passwords = user.get_attr("userPassword").ok_or_else(|| {
            AuthError::Failure("no userPassword attribute on returned user object".to_owned())
        })?;
        if !self.multi && passwords.len() > 1 {
            return Err(AuthError::Failure(
                "multiple userPassword values are present but ldap_multiple_passwords is false"
                    .to_owned(),
            ));
        }
        for stored_pw in passwords {
            match check_password(input_password, stored_pw) {
                Ok(true) => return Ok(()),
                Ok(false) => continue,
                Err(e) => return Err(AuthError::Failure(e.to_string())),
            }
        }
        Err(AuthError::InvalidCredentials)
    }
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum ReadMode {
    Startup,
    Auth,
}

/// Stores credentials in a `b64(user):stored` mapping in a local flat file.
struct FlatFileStorage {
    filename: PathBuf,
    read_mode: ReadMode,
    cred_map: HashMap<String, String>,
}

impl FlatFileStorage {
    fn new(conf: &Config) -> Result<FlatFileStorage> {
        let filename = PathBuf::from(conf.get_str("flat_filename").ok_or_else(|| {
            LdapError::Config("flat storage requires flat_filename".to_owned())
        })?);
        let read_mode = match conf.get_str("flat_read_mode").unwrap_or("startup") {
            "startup" => ReadMode::Startup,
            "auth" => ReadMode::Auth,
            other => {
                return Err(LdapError::Config(format!(
                    "invalid flat_read_mode {}",
                    other
                )))
            }
        };
        let cred_map = if read_mode == ReadMode::Startup {
            Self::read_map(&filename)?
        } else {
            HashMap::new()
        };
        Ok(FlatFileStorage {
            filename,
            read_mode,
            cred_map,
        })
    }

    fn read_map(filename: &PathBuf) -> Result<HashMap<String, String>> {
        let raw = std::fs::read_to_string(filename).map_err(|e| {
            LdapError::Config(format!("cannot read {}: {}", filename.display(), e))
        })?;
        let mut map = HashMap::new();
        for line in raw.lines() {
            if line.is_empty() {
                continue;
            }
            let (b64_user, stored_pw) = line.split_once(':').ok_or_else(|| {
                LdapError::Config(format!("malformed credential line in {}", filename.display()))
            })?;
            let user = STANDARD.decode(b64_user).map_err(|_| {
                LdapError::Config(format!("malformed user name in {}", filename.display()))
            })?;
            map.insert(
                String::from_utf8_lossy(&user).into_owned(),
                stored_pw.trim_end().to_owned(),
            );
        }
        Ok(map)
    }

    async fn authenticate(
        &self,
        mapped_name: &str,
        input_password: &str,
    ) -> std::result::Result<(), AuthError> {
        let fresh;
        let cred_map = if self.read_mode == ReadMode::Auth {
            fresh = Self::read_map(&self.filename)
                .map_err(|e| AuthError::Failure(e.to_string()))?;
            &fresh
        } else {
            &self.cred_map
        };
        let stored_pw = cred_map
            .get(mapped_name)
            .ok_or(AuthError::NameDoesNotExist)?;
        match check_password(input_password, stored_pw) {
            Ok(true) => Ok(()),
            Ok(false) => Err(AuthError::InvalidCredentials),
            Err(e) => Err(AuthError::Failure(e.to_string())),
        }
    }
}

enum Storage {
    Ldap(LdapStorage),
    Flat(FlatFileStorage),
}

pub struct SimpleAuthBackend {
    storage: Storage,
    name_maps: Vec<(Regex, String)>,
}

impl SimpleAuthBackend {
    pub fn new(conf: &Config, dit: Arc<Dit>) -> Result<SimpleAuthBackend> {
        let storage = match conf.get_str("storage").unwrap_or("ldap") {
            "ldap" => Storage::Ldap(LdapStorage::new(conf, dit)?),
            "flat" => Storage::Flat(FlatFileStorage::new(conf)?),
            other => {
                return Err(LdapError::Config(format!(
                    "unknown simple storage backend {}",
                    other
                )))
            }
        };
        let mut name_maps = Vec::new();
        if let Some(maps) = conf.get("name_maps").and_then(|v| v.as_sequence()) {
            for map_conf in maps {
                let search = map_conf
                    .get("search")
                    .and_then(|v| v.as_str())
                    .ok_or_else(|| {
                        LdapError::Config("name_maps entries require search".to_owned())
                    })?;
                let replace = map_conf
                    .get("replace")
                    .and_then(|v| v.as_str())
                    .ok_or_else(|| {
                        LdapError::Config("name_maps entries require replace".to_owned())
                    })?;
                let pattern = Regex::new(search).map_err(|e| {
                    LdapError::Config(format!("invalid name_maps pattern: {}", e))
                })?;
                name_maps.push((pattern, replace.to_owned()));
            }
        }
        Ok(SimpleAuthBackend { storage, name_maps })
    }

    /// Apply the first matching name map to the client-supplied name.
    fn map_auth_name(&self, input_name: &str) -> String {
        for (pattern, replace) in &self.name_maps {
            if pattern.is_match(input_name) {
                return pattern.replace_all(input_name, replace.as_str()).into_owned();
            }
        }
        input_name.to_owned()
    }
}

#[async_trait]
impl AuthBackend for SimpleAuthBackend {
    async fn authenticate(
        &self,
        name: &str,
        auth_choice: &AuthChoice,
    ) -> std::result::Result<String, AuthError> {
        let mapped_name = self.map_auth_name(name);
        let input_pw = match auth_choice {
            AuthChoice::Simple(password) => password.clone(),
            AuthChoice::Sasl {
                credentials: Some(credentials),
                ..
            } => credentials.clone(),
            AuthChoice::Sasl {
                credentials: None, ..
            } => {
                return Err(AuthError::Failure(
                    "no credentials value set in sasl auth request".to_owned(),
                ))
            }
            AuthChoice::Unknown(id) => {
                return Err(AuthError::MethodNotSupported(format!(
                    "authentication choice {}",
                    id
                )))
            }
        };
        match &self.storage {
            Storage::Ldap(storage) => storage.authenticate(&mapped_name, &input_pw).await?,
            Storage::Flat(storage) => storage.authenticate(&mapped_name, &input_pw).await?,
        }
        Ok(mapped_name)
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::auth::AuthStack;
    use crate::password::prepare_password;
    use crate::schema::test_schema;
    use std::io::Write;

    fn test_dit() -> Arc<Dit> {
        let value: serde_yaml::Value =
            serde_yaml::from_str("o=example: {data_backend: memory}").unwrap();
        Arc::new(Dit::new(value.as_mapping().unwrap(), test_schema()).unwrap())
    }

    fn flat_file(users: &[(&str, &str)]) -> tempfile::NamedTempFile {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        for (user, password) in users {
            let stored = prepare_password(password, "SSHA256").unwrap();
            writeln!(file, "{}:{}", STANDARD.encode(user), stored).unwrap();
        }
        file.flush().unwrap();
        file
    }

    fn flat_conf(path: &str) -> Config {
        let mut conf = Config::new();
        conf.load_str(&format!(
            "type: simple\nstorage: flat\nflat_filename: {}\n",
            path
        ))
        .unwrap();
        conf
    }

    #[tokio::test]
    async fn flat_storage_round_trip() {
        let file = flat_file(&[("cn=admin,o=example", "hunter2")]);
        let backend =
            SimpleAuthBackend::new(&flat_conf(file.path().to_str().unwrap()), test_dit()).unwrap();

        let ok = backend
            .authenticate(
                "cn=admin,o=example",
                &AuthChoice::Simple("hunter2".to_owned()),
            )
            .await
            .unwrap();
        assert_eq!(ok, "cn=admin,o=example");

        let err = backend
            .authenticate(
                "cn=admin,o=example",
                &AuthChoice::Simple("wrong".to_owned()),
            )
            .await
            .err()
            .expect("bad password should fail");
        assert!(matches!(err, AuthError::InvalidCredentials));

        let err = backend
            .authenticate("cn=nobody", &AuthChoice::Simple("hunter2".to_owned()))
            .await
            .err()
            .expect("unknown user should fail");
        assert!(matches!(err, AuthError::NameDoesNotExist));
    }

    #[tokio::test]
    async fn unknown_choice_is_not_supported() {
        let file = flat_file(&[("user", "pw")]);
        let backend =
            SimpleAuthBackend::new(&flat_conf(file.path().to_str().unwrap()), test_dit()).unwrap();
        let err = backend
            .authenticate("user", &AuthChoice::Unknown(7))
            .await
            .err()
            .expect("unknown choice should fail");
        assert!(matches!(err, AuthError::MethodNotSupported(_)));
    }

    #[tokio::test]
    async fn name_maps_rewrite_before_lookup() {
        let file = flat_file(&[("cn=short,o=example", "pw")]);
        let mut conf = flat_conf(file.path().to_str().unwrap());
        conf.load_str(
            "name_maps:\n  - search: '^([a-z]+)$'\n    replace: 'cn=$1,o=example'\n",
        )
        .unwrap();
        let backend = SimpleAuthBackend::new(&conf, test_dit()).unwrap();
        let authed = backend
            .authenticate("short", &AuthChoice::Simple("pw".to_owned()))
            .await
            .unwrap();
        assert_eq!(authed, "cn=short,o=example");
    }

    #[tokio::test]
    async fn ldap_storage_checks_user_password() {
        let dit = test_dit();
        let client = InternalClient::new(dit.clone());
        let stored = prepare_password("hunter2", "SSHA256").unwrap();
        client
            .add(
                "cn=admin,o=example",
                vec![("userPassword".to_owned(), vec![stored])],
            )
            .await
            .unwrap();

        let mut conf = Config::new();
        conf.load_str("type: simple\nstorage: ldap\n").unwrap();
        let backend = SimpleAuthBackend::new(&conf, dit).unwrap();

        let authed = backend
            .authenticate(
                "cn=admin,o=example",
                &AuthChoice::Simple("hunter2".to_owned()),
            )
            .await
            .unwrap();
        assert_eq!(authed, "cn=admin,o=example");

        let err = backend
            .authenticate(
                "cn=admin,o=example",
                &AuthChoice::Simple("nope".to_owned()),
            )
            .await
            .err()
            .expect("wrong password should fail");
        assert!(matches!(err, AuthError::InvalidCredentials));

        let err = backend
            .authenticate(
                "cn=missing,o=example",
                &AuthChoice::Simple("hunter2".to_owned()),
            )
            .await
            .err()
            .expect("missing user should fail");
        assert!(matches!(err, AuthError::NameDoesNotExist));
    }

    #[tokio::test]
    async fn stack_actions_and_composite_errors() {
        let unknown_users = flat_file(&[("other", "pw")]);
        let real_users = flat_file(&[("user", "pw")]);
        let backends_yaml = format!(
            "first: {{type: simple, storage: flat, flat_filename: {}}}\n\
             second: {{type: simple, storage: flat, flat_filename: {}}}\n",
            unknown_users.path().display(),
            real_users.path().display()
        );
        let backends: serde_yaml::Value = serde_yaml::from_str(&backends_yaml).unwrap();
        let stack_yaml = "- {backend: first}\n- {backend: second}\n";
        let stack: serde_yaml::Value = serde_yaml::from_str(stack_yaml).unwrap();
        let auth = AuthStack::new(
            stack.as_sequence().unwrap(),
            backends.as_mapping().unwrap(),
            &test_dit(),
        )
        .unwrap();

        // user_unknown defaults to continue, so the second backend wins
        let authed = auth
            .authenticate("user", &AuthChoice::Simple("pw".to_owned()))
            .await
            .unwrap();
        assert_eq!(authed, "user");

        // a wrong password on the first matching backend breaks the stack
        let err = auth
            .authenticate("other", &AuthChoice::Simple("wrong".to_owned()))
            .await
            .err()
            .expect("bad creds should fail");
        assert!(err.to_string().contains("not valid"));

        // unknown everywhere surfaces the user-unknown diagnostic
        let err = auth
            .authenticate("nobody", &AuthChoice::Simple("pw".to_owned()))
            .await
            .err()
            .expect("unknown user should fail");
        assert!(err.to_string().contains("does not exist"));

        // user_unknown can be overridden to break
        let stack: serde_yaml::Value =
            serde_yaml::from_str("- {backend: first, user_unknown: break}\n- {backend: second}\n")
                .unwrap();
        let auth = AuthStack::new(
            stack.as_sequence().unwrap(),
            backends.as_mapping().unwrap(),
            &test_dit(),
        )
        .unwrap();
        assert!(auth
            .authenticate("user", &AuthChoice::Simple("pw".to_owned()))
            .await
            .is_err());
    }
}
