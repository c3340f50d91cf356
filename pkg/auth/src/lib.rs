use std::{
    collections::BTreeMap,
    path::{Path, PathBuf},
};

use serde_json::Value;

pub const DEFAULT_TOKEN_HEADER: &str = "X-JSON-Collector-Token";

#[derive(Debug, thiserror::Error)]
pub enum ManifestError {
    #[error("authorized tokens file not found at {}", .0.display())]
    NotFound(PathBuf),
    #[error("reading authorized tokens file {} failed: {source}", .path.display())]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("authorized tokens file at {} is not valid JSON: {source}", .path.display())]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
    #[error("authorized tokens file must contain a JSON object mapping usernames to tokens")]
    NotAnObject,
    #[error("authorized tokens file must map string usernames to string tokens (entry '{0}')")]
    NonStringToken(String),
    #[error("authorized tokens file contains blank usernames or tokens")]
    BlankEntry,
    #[error("authorized tokens file is empty")]
    Empty,
    #[error("username '{0}' appears more than once after trimming")]
    DuplicateUsername(String),
    #[error("users '{first}' and '{second}' share the same token")]
    DuplicateToken { first: String, second: String },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AuthDecision {
    /// Carries the authenticated username, or `None` in open mode.
    Allowed(Option<String>),
    Unauthorized(String),
    Forbidden(&'static str),
}

/// Username to token mapping, ordered by username.
#[derive(Clone, PartialEq, Eq)]
pub struct TokenManifest {
    entries: Vec<(String, String)>,
}

impl std::fmt::Debug for TokenManifest {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TokenManifest")
            .field("users", &self.usernames().collect::<Vec<_>>())
            .finish()
    }
}

impl TokenManifest {
    pub fn load(path: &Path) -> Result<Self, ManifestError> {
        if !path.exists() {
            return Err(ManifestError::NotFound(path.to_path_buf()));
        }
        let raw = std::fs::read(path).map_err(|source| ManifestError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        let value: Value = serde_json::from_slice(&raw).map_err(|source| ManifestError::Parse {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_json(&value)
    }

    pub fn from_json(value: &Value) -> Result<Self, ManifestError> {
        let Value::Object(object) = value else {
            return Err(ManifestError::NotAnObject);
        };

        let mut by_user = BTreeMap::new();
        for (username, token) in object {
            let Value::String(token) = token else {
                return Err(ManifestError::NonStringToken(username.clone()));
            };
            let username = username.trim();
            let token = token.trim();
            if username.is_empty() || token.is_empty() {
                return Err(ManifestError::BlankEntry);
            }
            if by_user
                .insert(username.to_string(), token.to_string())
                .is_some()
            {
                return Err(ManifestError::DuplicateUsername(username.to_string()));
            }
        }
        if by_user.is_empty() {
            return Err(ManifestError::Empty);
        }

        let mut owners: BTreeMap<&str, &str> = BTreeMap::new();
        for (username, token) in &by_user {
            if let Some(first) = owners.insert(token.as_str(), username.as_str()) {
                return Err(ManifestError::DuplicateToken {
                    first: first.to_string(),
                    second: username.clone(),
                });
            }
        }

        Ok(Self {
            entries: by_user.into_iter().collect(),
        })
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn usernames(&self) -> impl Iterator<Item = &str> {
        self.entries.iter().map(|(username, _)| username.as_str())
    }

    /// Looks up the owner of `presented`. Every entry is compared so the
    /// time taken does not depend on where (or whether) a match sits.
    pub fn user_for_token(&self, presented: &str) -> Option<&str> {
        let mut found = None;
        for (username, token) in &self.entries {
            if constant_time_eq(presented.as_bytes(), token.as_bytes()) && found.is_none() {
                found = Some(username.as_str());
            }
        }
        found
    }
}

#[derive(Debug, Clone)]
pub struct TokenStore {
    header_name: String,
    manifest: Option<TokenManifest>,
}

impl TokenStore {
    pub fn open(header_name: impl Into<String>) -> Self {
        Self {
            header_name: header_name.into(),
            manifest: None,
        }
    }

    pub fn with_manifest(header_name: impl Into<String>, manifest: TokenManifest) -> Self {
        Self {
            header_name: header_name.into(),
            manifest: Some(manifest),
        }
    }

    pub fn load(
        manifest_path: Option<&Path>,
        header_name: impl Into<String>,
    ) -> Result<Self, ManifestError> {
        match manifest_path {
            None => Ok(Self::open(header_name)),
            Some(path) => Ok(Self::with_manifest(header_name, TokenManifest::load(path)?)),
        }
    }

    pub fn header_name(&self) -> &str {
        &self.header_name
    }

    pub fn is_enabled(&self) -> bool {
        self.manifest.is_some()
    }

    pub fn manifest(&self) -> Option<&TokenManifest> {
        self.manifest.as_ref()
    }

    pub fn authenticate(&self, header_value: Option<&str>) -> AuthDecision {
        let Some(manifest) = self.manifest.as_ref() else {
            return AuthDecision::Allowed(None);
        };
        let presented = header_value.map(str::trim).unwrap_or_default();
        if presented.is_empty() {
            return AuthDecision::Unauthorized(format!(
                "Missing required token header '{}'",
                self.header_name
            ));
        }
        match manifest.user_for_token(presented) {
            Some(username) => AuthDecision::Allowed(Some(username.to_string())),
            None => AuthDecision::Forbidden("Provided token is not recognized"),
        }
    }
}

pub fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    let mut diff: u8 = (a.len() != b.len()) as u8;
    for i in 0..a.len().max(b.len()) {
        let left = a.get(i).copied().unwrap_or(0);
        let right = b.get(i).copied().unwrap_or(0);
        diff |= left ^ right;
    }
    diff == 0
}
