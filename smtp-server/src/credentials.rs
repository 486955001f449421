use std::collections::HashMap;

use camino::Utf8Path;
use miette::{Context, IntoDiagnostic, Result};
use pwhash::bcrypt;
use tokio::fs;
use tracing::{error, info, warn};

/// Username to bcrypt hash table, read once at startup.
#[derive(Debug, Default)]
pub struct CredentialStore {
    users: HashMap<String, String>,
}

impl CredentialStore {
    pub async fn load(path: &Utf8Path) -> Result<Self> {
        let contents = fs::read_to_string(path)
            .await
            .into_diagnostic()
            .wrap_err_with(|| format!("reading user database {path}"))?;

        let store = Self::parse(&contents);
        info!(%path, users = store.len(), "loaded user database");
        Ok(store)
    }

    /// Parses `username:hash` lines. Blank lines and `#` comments are skipped,
    /// lines without a `:` are logged and skipped, and a repeated username
    /// replaces the earlier entry.
    pub fn parse(contents: &str) -> Self {
        let mut users = HashMap::new();

        for (index, line) in contents.lines().enumerate() {
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }

            match line.split_once(':') {
                Some((username, hash)) => {
                    users.insert(username.to_string(), hash.to_string());
                }
                None => {
                    warn!(line = index + 1, "skipping malformed line in user database");
                }
            }
        }

        CredentialStore { users }
    }

    pub fn len(&self) -> usize {
        self.users.len()
    }

    /// Checks `password` against the stored hash. Unknown users and wrong
    /// passwords are indistinguishable to the caller.
    pub async fn verify(&self, username: &str, password: &str) -> bool {
        let Some(hash) = self.users.get(username).cloned() else {
            return false;
        };

        let password = password.to_string();
        match tokio::task::spawn_blocking(move || bcrypt::verify(password, &hash)).await {
            Ok(valid) => valid,
            Err(e) => {
                error!(error = %e, "password verification task failed");
                false
            }
        }
    }
}
