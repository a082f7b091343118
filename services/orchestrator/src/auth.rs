//! Credentials, sessions and the periodically re-synced user table.

use std::collections::{BTreeSet, HashMap};
use std::path::PathBuf;
use std::sync::{Arc, RwLock};
use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use babel_id::SessionId;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tokio::sync::watch;
use tracing::{error, info, instrument};

/// What a login may touch.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "RawPermissions", into = "RawPermissions")]
pub enum Permissions {
    /// Every command on every language.
    Admin,
    /// Non-admin commands on every language.
    All,
    /// Non-admin commands on these languages.
    Langs(BTreeSet<String>),
}

#[derive(Serialize, Deserialize)]
#[serde(untagged)]
enum RawPermissions {
    Word(String),
    List(Vec<String>),
}

impl TryFrom<RawPermissions> for Permissions {
    type Error = String;

    fn try_from(raw: RawPermissions) -> Result<Self, Self::Error> {
        match raw {
            RawPermissions::Word(w) if w == "admin" => Ok(Permissions::Admin),
            RawPermissions::Word(w) if w == "*" => Ok(Permissions::All),
            RawPermissions::Word(w) => Err(format!("unknown permission '{w}'")),
            RawPermissions::List(langs) => Ok(Permissions::Langs(langs.into_iter().collect())),
        }
    }
}

impl From<Permissions> for RawPermissions {
    fn from(p: Permissions) -> Self {
        match p {
            Permissions::Admin => RawPermissions::Word("admin".into()),
            Permissions::All => RawPermissions::Word("*".into()),
            Permissions::Langs(langs) => RawPermissions::List(langs.into_iter().collect()),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Credential {
    pub login: String,
    /// Hex SHA-256 of the password.
    pub password_hash: String,
    pub permissions: Permissions,
}

pub fn hash_password(password: &str) -> String {
    hex::encode(Sha256::digest(password.as_bytes()))
}

/// Supplies the current credential list.
#[async_trait]
pub trait CredentialSource: Send + Sync {
    async fn load(&self) -> anyhow::Result<Vec<Credential>>;
}

/// A JSON array of [`Credential`]s on disk.
#[derive(Debug, Clone)]
pub struct FileCredentialSource {
    path: PathBuf,
}

impl FileCredentialSource {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

#[async_trait]
impl CredentialSource for FileCredentialSource {
    async fn load(&self) -> anyhow::Result<Vec<Credential>> {
        let raw = tokio::fs::read_to_string(&self.path)
            .await
            .with_context(|| format!("reading {}", self.path.display()))?;
        serde_json::from_str(&raw).with_context(|| format!("parsing {}", self.path.display()))
    }
}

/// A fixed credential list.
#[derive(Debug, Clone, Default)]
pub struct StaticCredentialSource(pub Vec<Credential>);

#[async_trait]
impl CredentialSource for StaticCredentialSource {
    async fn load(&self) -> anyhow::Result<Vec<Credential>> {
        Ok(self.0.clone())
    }
}

/// The authorized users as of the last sync.
#[derive(Debug, Default)]
pub struct UserTable {
    users: RwLock<HashMap<String, Credential>>,
}

impl UserTable {
    pub fn replace(&self, credentials: Vec<Credential>) {
        let users = credentials
            .into_iter()
            .map(|c| (c.login.clone(), c))
            .collect();
        *self.users.write().unwrap_or_else(|p| p.into_inner()) = users;
    }

    pub fn clear(&self) {
        self.users.write().unwrap_or_else(|p| p.into_inner()).clear();
    }

    pub fn len(&self) -> usize {
        self.users.read().unwrap_or_else(|p| p.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn authenticate(&self, login: &str, password: &str) -> Option<Permissions> {
        let users = self.users.read().unwrap_or_else(|p| p.into_inner());
        let user = users.get(login)?;
        (user.password_hash.eq_ignore_ascii_case(&hash_password(password)))
            .then(|| user.permissions.clone())
    }

    /// Current permissions of `login`, re-read on every command.
    pub fn permissions(&self, login: &str) -> Option<Permissions> {
        self.users
            .read()
            .unwrap_or_else(|p| p.into_inner())
            .get(login)
            .map(|u| u.permissions.clone())
    }
}

/// An open session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Session {
    pub id: SessionId,
    /// `None` for an anonymous session.
    pub login: Option<String>,
}

impl Session {
    pub fn anonymous() -> Self {
        Self {
            id: SessionId::new(),
            login: None,
        }
    }

    pub fn user(login: impl Into<String>) -> Self {
        Self {
            id: SessionId::new(),
            login: Some(login.into()),
        }
    }
}

/// Who issued a command, resolved fresh for each command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Caller {
    /// The orchestrator itself (timing subsystem, startup).
    Internal,
    /// The anonymous session currently selected as controller source.
    ActiveConsole,
    /// Any other anonymous session.
    Anonymous,
    User {
        login: String,
        permissions: Permissions,
    },
}

impl Caller {
    pub fn is_admin(&self) -> bool {
        matches!(
            self,
            Caller::Internal
                | Caller::User {
                    permissions: Permissions::Admin,
                    ..
                }
        )
    }

    pub fn describe(&self) -> String {
        match self {
            Caller::Internal => "internal".to_string(),
            Caller::ActiveConsole => "active console".to_string(),
            Caller::Anonymous => "anonymous".to_string(),
            Caller::User { login, .. } => login.clone(),
        }
    }
}

/// Re-derives the user table from the credential source every tick.
pub struct CredentialSync {
    source: Arc<dyn CredentialSource>,
    users: Arc<UserTable>,
    interval: Duration,
}

impl CredentialSync {
    pub fn new(source: Arc<dyn CredentialSource>, users: Arc<UserTable>, interval: Duration) -> Self {
        Self {
            source,
            users,
            interval,
        }
    }

    /// One sync. On failure the table is emptied rather than kept stale.
    pub async fn sync_once(&self) -> anyhow::Result<usize> {
        match self.source.load().await {
            Ok(credentials) => {
                let count = credentials.len();
                self.users.replace(credentials);
                Ok(count)
            }
            Err(e) => {
                self.users.clear();
                Err(e)
            }
        }
    }

    #[instrument(skip(self, shutdown))]
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        info!(
            interval_secs = self.interval.as_secs(),
            "Starting credential sync"
        );

        let mut interval = tokio::time::interval(self.interval);
        loop {
            tokio::select! {
                _ = interval.tick() => {
                    match self.sync_once().await {
                        Ok(users) => info!(users, "Credentials synced"),
                        Err(e) => error!(error = %e, "Credential sync failed; all logins revoked"),
                    }
                }
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        info!("Credential sync shutting down");
                        break;
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn cred(login: &str, password: &str, permissions: Permissions) -> Credential {
        Credential {
            login: login.into(),
            password_hash: hash_password(password),
            permissions,
        }
    }

    #[test]
    fn permissions_wire_forms() {
        let admin: Permissions = serde_json::from_value(json!("admin")).unwrap();
        let all: Permissions = serde_json::from_value(json!("*")).unwrap();
        let some: Permissions = serde_json::from_value(json!(["Fra", "Deu"])).unwrap();
        assert_eq!(admin, Permissions::Admin);
        assert_eq!(all, Permissions::All);
        assert_eq!(
            some,
            Permissions::Langs(["Deu".to_string(), "Fra".to_string()].into())
        );
        assert!(serde_json::from_value::<Permissions>(json!("root")).is_err());
        assert_eq!(serde_json::to_value(Permissions::All).unwrap(), json!("*"));
    }

    #[test]
    fn authenticate_checks_hash() {
        let users = UserTable::default();
        users.replace(vec![cred("ops", "secret", Permissions::Admin)]);
        assert_eq!(users.authenticate("ops", "secret"), Some(Permissions::Admin));
        assert_eq!(users.authenticate("ops", "wrong"), None);
        assert_eq!(users.authenticate("nobody", "secret"), None);
    }

    struct FlakySource;

    #[async_trait]
    impl CredentialSource for FlakySource {
        async fn load(&self) -> anyhow::Result<Vec<Credential>> {
            anyhow::bail!("source unavailable")
        }
    }

    #[tokio::test]
    async fn failed_sync_revokes_everyone() {
        let users = Arc::new(UserTable::default());
        users.replace(vec![cred("ops", "secret", Permissions::Admin)]);

        let sync = CredentialSync::new(Arc::new(FlakySource), users.clone(), Duration::from_secs(60));
        assert!(sync.sync_once().await.is_err());
        assert!(users.is_empty());
    }

    #[tokio::test]
    async fn file_source_reads_credentials() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("users.json");
        let body = json!([{
            "login": "fra-op",
            "password_hash": hash_password("pw"),
            "permissions": ["Fra"],
        }]);
        tokio::fs::write(&path, body.to_string()).await.unwrap();

        let users = Arc::new(UserTable::default());
        let sync = CredentialSync::new(
            Arc::new(FileCredentialSource::new(&path)),
            users.clone(),
            Duration::from_secs(60),
        );
        assert_eq!(sync.sync_once().await.unwrap(), 1);
        assert_eq!(
            users.permissions("fra-op"),
            Some(Permissions::Langs(["Fra".to_string()].into()))
        );
    }
}
