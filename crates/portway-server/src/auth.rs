//! Client authentication stores
//!
//! Credentials come from one of three places: a single static `auth`
//! config value, a JSON file mapping id to password, or the database table.
//! File and table stores accept writes when `auth_write` is enabled; the
//! static store never does. Stored passwords are either plain strings or
//! PHC-formatted argon2id hashes.

use argon2::password_hash::{PasswordHash, PasswordHasher, PasswordVerifier, SaltString};
use argon2::Argon2;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::RwLock;
use tracing::warn;

use portway_server_db::AuthStore;

use crate::error::{Error, Result};
use crate::registry::ClientRegistry;

/// One credential.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClientAuth {
    pub id: String,
    pub password: String,
}

impl ClientAuth {
    /// Verify a candidate password against the stored value.
    pub fn verify(&self, candidate: &str) -> bool {
        if self.password.starts_with("$argon2") {
            match PasswordHash::new(&self.password) {
                Ok(parsed) => Argon2::default()
                    .verify_password(candidate.as_bytes(), &parsed)
                    .is_ok(),
                Err(e) => {
                    warn!(auth_id = %self.id, error = %e, "stored hash unparseable");
                    false
                }
            }
        } else {
            self.password == candidate
        }
    }
}

/// Hash a password for storage.
pub fn hash_password(password: &str) -> Result<String> {
    let salt = SaltString::generate(&mut argon2::password_hash::rand_core::OsRng);
    Argon2::default()
        .hash_password(password.as_bytes(), &salt)
        .map(|hash| hash.to_string())
        .map_err(|e| Error::Internal(format!("failed to hash password: {e}")))
}

/// Parse the static `auth = "id:password"` config value.
pub fn parse_auth_pair(raw: &str) -> Result<ClientAuth> {
    let (id, password) = raw
        .split_once(':')
        .ok_or_else(|| Error::Validation(format!("invalid auth {raw:?}: expected \"id:password\"")))?;
    if id.is_empty() {
        return Err(Error::Validation("auth id must not be empty".to_string()));
    }
    Ok(ClientAuth {
        id: id.to_string(),
        password: password.to_string(),
    })
}

/// Store of client credentials.
#[async_trait]
pub trait ClientAuthProvider: Send + Sync {
    async fn get(&self, id: &str) -> Result<Option<ClientAuth>>;
    async fn get_all(&self) -> Result<Vec<ClientAuth>>;
    async fn save(&self, auth: &ClientAuth) -> Result<()>;
    async fn delete(&self, id: &str) -> Result<()>;
    fn is_writeable(&self) -> bool;
}

/// The single credential from `server.auth`. Read-only.
pub struct SingleAuthProvider {
    auth: ClientAuth,
}

impl SingleAuthProvider {
    pub fn new(auth: ClientAuth) -> Self {
        Self { auth }
    }
}

#[async_trait]
impl ClientAuthProvider for SingleAuthProvider {
    async fn get(&self, id: &str) -> Result<Option<ClientAuth>> {
        Ok((self.auth.id == id).then(|| self.auth.clone()))
    }

    async fn get_all(&self) -> Result<Vec<ClientAuth>> {
        Ok(vec![self.auth.clone()])
    }

    async fn save(&self, _auth: &ClientAuth) -> Result<()> {
        Err(Error::Auth(
            "client auth is static and cannot be modified".to_string(),
        ))
    }

    async fn delete(&self, _id: &str) -> Result<()> {
        Err(Error::Auth(
            "client auth is static and cannot be modified".to_string(),
        ))
    }

    fn is_writeable(&self) -> bool {
        false
    }
}

/// JSON file of `{"id": "password", ...}`, cached in memory. Mutations
/// rewrite the file before touching the cache.
pub struct FileAuthProvider {
    path: PathBuf,
    cache: RwLock<HashMap<String, String>>,
    writeable: bool,
}

impl FileAuthProvider {
    pub fn load(path: PathBuf, writeable: bool) -> Result<Self> {
        let contents = std::fs::read_to_string(&path).map_err(|e| {
            Error::Internal(format!("failed to read auth file {}: {e}", path.display()))
        })?;
        let cache: HashMap<String, String> = serde_json::from_str(&contents).map_err(|e| {
            Error::Internal(format!("invalid auth file {}: {e}", path.display()))
        })?;
        Ok(Self {
            path,
            cache: RwLock::new(cache),
            writeable,
        })
    }

    fn persist(&self, entries: &HashMap<String, String>) -> Result<()> {
        let json = serde_json::to_string_pretty(entries)
            .map_err(|e| Error::Internal(format!("failed to encode auth file: {e}")))?;
        std::fs::write(&self.path, json).map_err(|e| {
            Error::Internal(format!("failed to write auth file {}: {e}", self.path.display()))
        })
    }

    fn require_writeable(&self) -> Result<()> {
        if !self.writeable {
            return Err(Error::Auth("client auth writes are disabled".to_string()));
        }
        Ok(())
    }
}

#[async_trait]
impl ClientAuthProvider for FileAuthProvider {
    async fn get(&self, id: &str) -> Result<Option<ClientAuth>> {
        let cache = self.cache.read().unwrap();
        Ok(cache.get(id).map(|password| ClientAuth {
            id: id.to_string(),
            password: password.clone(),
        }))
    }

    async fn get_all(&self) -> Result<Vec<ClientAuth>> {
        let cache = self.cache.read().unwrap();
        Ok(cache
            .iter()
            .map(|(id, password)| ClientAuth {
                id: id.clone(),
                password: password.clone(),
            })
            .collect())
    }

    async fn save(&self, auth: &ClientAuth) -> Result<()> {
        self.require_writeable()?;
        let mut next = self.cache.read().unwrap().clone();
        next.insert(auth.id.clone(), auth.password.clone());
        self.persist(&next)?;
        *self.cache.write().unwrap() = next;
        Ok(())
    }

    async fn delete(&self, id: &str) -> Result<()> {
        self.require_writeable()?;
        let mut next = self.cache.read().unwrap().clone();
        if next.remove(id).is_none() {
            return Err(Error::NotFound(format!("client auth {id:?}")));
        }
        self.persist(&next)?;
        *self.cache.write().unwrap() = next;
        Ok(())
    }

    fn is_writeable(&self) -> bool {
        self.writeable
    }
}

/// Database-backed credentials (`server.auth_table`).
pub struct DbAuthProvider {
    store: AuthStore,
    writeable: bool,
}

impl DbAuthProvider {
    pub fn new(store: AuthStore, writeable: bool) -> Self {
        Self { store, writeable }
    }
}

#[async_trait]
impl ClientAuthProvider for DbAuthProvider {
    async fn get(&self, id: &str) -> Result<Option<ClientAuth>> {
        Ok(self
            .store
            .get(id)
            .await?
            .map(|(id, password)| ClientAuth { id, password }))
    }

    async fn get_all(&self) -> Result<Vec<ClientAuth>> {
        Ok(self
            .store
            .get_all()
            .await?
            .into_iter()
            .map(|(id, password)| ClientAuth { id, password })
            .collect())
    }

    async fn save(&self, auth: &ClientAuth) -> Result<()> {
        if !self.writeable {
            return Err(Error::Auth("client auth writes are disabled".to_string()));
        }
        self.store.save(&auth.id, &auth.password).await?;
        Ok(())
    }

    async fn delete(&self, id: &str) -> Result<()> {
        if !self.writeable {
            return Err(Error::Auth("client auth writes are disabled".to_string()));
        }
        if !self.store.delete(id).await? {
            return Err(Error::NotFound(format!("client auth {id:?}")));
        }
        Ok(())
    }

    fn is_writeable(&self) -> bool {
        self.writeable
    }
}

/// Delete a credential, refusing while any non-obsolete client still uses
/// it.
pub async fn delete_client_auth(
    provider: &dyn ClientAuthProvider,
    registry: &ClientRegistry,
    id: &str,
) -> Result<()> {
    let bound = registry.get_all_by_auth_id(id);
    if !bound.is_empty() {
        return Err(Error::Conflict(format!(
            "client auth {id:?} is still used by {} client(s)",
            bound.len()
        )));
    }
    provider.delete(id).await
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn plain_password_verification() {
        let auth = ClientAuth {
            id: "a".to_string(),
            password: "secret".to_string(),
        };
        assert!(auth.verify("secret"));
        assert!(!auth.verify("Secret"));
        assert!(!auth.verify(""));
    }

    #[test]
    fn hashed_password_verification() {
        let hash = hash_password("hunter2").unwrap();
        assert!(hash.starts_with("$argon2id$"));

        let auth = ClientAuth {
            id: "a".to_string(),
            password: hash,
        };
        assert!(auth.verify("hunter2"));
        assert!(!auth.verify("hunter3"));
    }

    #[test]
    fn auth_pair_parsing() {
        let auth = parse_auth_pair("agent:pa:ss").unwrap();
        assert_eq!(auth.id, "agent");
        assert_eq!(auth.password, "pa:ss");

        assert!(parse_auth_pair("no-separator").is_err());
        assert!(parse_auth_pair(":empty-id").is_err());
    }

    #[tokio::test]
    async fn single_provider_is_read_only() {
        let provider = SingleAuthProvider::new(ClientAuth {
            id: "only".to_string(),
            password: "pw".to_string(),
        });

        assert!(provider.get("only").await.unwrap().is_some());
        assert!(provider.get("other").await.unwrap().is_none());
        assert!(!provider.is_writeable());

        let err = provider
            .save(&ClientAuth {
                id: "new".to_string(),
                password: "pw".to_string(),
            })
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Auth(_)));
    }

    #[tokio::test]
    async fn file_provider_roundtrip() {
        let dir = std::env::temp_dir().join(format!("portway-auth-{}", std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join("auth.json");
        std::fs::write(&path, r#"{"agent-1": "pw1"}"#).unwrap();

        let provider = FileAuthProvider::load(path.clone(), true).unwrap();
        assert_eq!(provider.get("agent-1").await.unwrap().unwrap().password, "pw1");

        provider
            .save(&ClientAuth {
                id: "agent-2".to_string(),
                password: "pw2".to_string(),
            })
            .await
            .unwrap();

        // A fresh load sees the write.
        let reloaded = FileAuthProvider::load(path.clone(), false).unwrap();
        assert!(reloaded.get("agent-2").await.unwrap().is_some());

        // Read-only instance refuses mutations.
        let err = reloaded.delete("agent-2").await.unwrap_err();
        assert!(matches!(err, Error::Auth(_)));

        std::fs::remove_dir_all(&dir).ok();
    }

    #[tokio::test]
    async fn delete_refuses_while_clients_bound() {
        let registry = ClientRegistry::new(None, None);
        let mut client = crate::clients::Client {
            id: "c1".to_string(),
            client_auth_id: "shared".to_string(),
            ..Default::default()
        };
        registry.save(&client).await.unwrap();

        let dir = std::env::temp_dir().join(format!("portway-auth-del-{}", std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join("auth.json");
        std::fs::write(&path, r#"{"shared": "pw"}"#).unwrap();
        let provider = FileAuthProvider::load(path, true).unwrap();

        let err = delete_client_auth(&provider, &registry, "shared")
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Conflict(_)));

        // Unbind the client, delete succeeds.
        client.client_auth_id = "other".to_string();
        registry.save(&client).await.unwrap();
        delete_client_auth(&provider, &registry, "shared")
            .await
            .unwrap();

        std::fs::remove_dir_all(std::env::temp_dir().join(format!(
            "portway-auth-del-{}",
            std::process::id()
        )))
        .ok();
    }
}
