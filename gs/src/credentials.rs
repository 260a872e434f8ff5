//! Authenticated remote URI construction
//!
//! Credentials are resolved fresh on every sync attempt so that a rotated
//! token file is picked up without restarting the supervisor.

use std::fmt;
use std::fs;
use std::path::PathBuf;

use tracing::debug;

/// Scheme assumed when the remote location carries none
pub const DEFAULT_SCHEME: &str = "https";

/// Placeholder written wherever a token would otherwise be displayed
const REDACTED: &str = "***";

/// Error types for credential resolution
#[derive(Debug, thiserror::Error)]
pub enum CredentialError {
    #[error("No git target configured")]
    MissingTarget,

    #[error("No git credential configured (set a token or a token file)")]
    MissingCredential,

    #[error("Failed to read token file {path}: {source}")]
    TokenUnreadable {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// Whether the caller can live with an unauthenticated URI
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthRequirement {
    /// Fail with [`CredentialError::MissingCredential`] when no token resolves
    Required,
    /// Fall back to a URI without an authentication segment
    Optional,
}

/// Where the configuration comes from and where it lands on disk
#[derive(Clone, Default)]
pub struct SyncTarget {
    /// Remote repository location, optionally prefixed with `scheme://`
    pub remote: Option<String>,

    /// Identity prepended to the token in the URI
    pub username: Option<String>,

    /// Raw token value, takes priority over `token_file`
    pub token: Option<String>,

    /// File whose contents (minus whitespace) are the token
    pub token_file: Option<PathBuf>,

    /// Local working directory for the repository
    pub base_path: PathBuf,
}

impl SyncTarget {
    /// Create a target with no remote configured
    pub fn local(base_path: impl Into<PathBuf>) -> Self {
        Self {
            base_path: base_path.into(),
            ..Default::default()
        }
    }

    /// True when both a remote and some token source are configured
    pub fn has_source(&self) -> bool {
        let has_remote = self.remote.as_deref().is_some_and(|r| !r.trim().is_empty());
        let has_token = self.token.as_deref().and_then(clean).is_some() || self.token_file.is_some();
        debug!(has_remote, has_token, "SyncTarget::has_source: checked");
        has_remote && has_token
    }
}

impl fmt::Debug for SyncTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SyncTarget")
            .field("remote", &self.remote)
            .field("username", &self.username)
            .field("token", &self.token.as_ref().map(|_| REDACTED))
            .field("token_file", &self.token_file)
            .field("base_path", &self.base_path)
            .finish()
    }
}

/// A remote URI that may embed a secret
///
/// `Display` and `Debug` never show the token; use [`AuthenticatedUri::expose`]
/// only when handing the URI to the version-control client.
#[derive(Clone, PartialEq, Eq)]
pub struct AuthenticatedUri {
    scheme: String,
    username: Option<String>,
    token: Option<String>,
    location: String,
}

impl AuthenticatedUri {
    /// The full URI, credentials included
    pub fn expose(&self) -> String {
        match &self.token {
            Some(token) => format!("{}://{}@{}", self.scheme, self.userinfo(token), self.location),
            None => self.public(),
        }
    }

    /// The URI with the authentication segment removed
    pub fn public(&self) -> String {
        format!("{}://{}", self.scheme, self.location)
    }

    /// The scheme in use (`https` when the remote carried none)
    pub fn scheme(&self) -> &str {
        &self.scheme
    }

    /// Whether a token was embedded
    pub fn is_authenticated(&self) -> bool {
        self.token.is_some()
    }

    /// Scrub the token from arbitrary text, e.g. git's stderr
    pub fn redact(&self, text: &str) -> String {
        match &self.token {
            Some(token) if !token.is_empty() => text.replace(token.as_str(), REDACTED),
            _ => text.to_string(),
        }
    }

    fn userinfo(&self, token: &str) -> String {
        match &self.username {
            Some(user) => format!("{}:{}", user, token),
            None => token.to_string(),
        }
    }
}

impl fmt::Display for AuthenticatedUri {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.token.is_some() {
            write!(f, "{}://{}@{}", self.scheme, self.userinfo(REDACTED), self.location)
        } else {
            write!(f, "{}", self.public())
        }
    }
}

impl fmt::Debug for AuthenticatedUri {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "AuthenticatedUri({})", self)
    }
}

/// Build the authenticated remote URI for a target
pub fn resolve(target: &SyncTarget, requirement: AuthRequirement) -> Result<AuthenticatedUri, CredentialError> {
    debug!(?target, ?requirement, "resolve: called");
    let remote = target
        .remote
        .as_deref()
        .map(str::trim)
        .filter(|r| !r.is_empty())
        .ok_or(CredentialError::MissingTarget)?;

    let (scheme, location) = match remote.split_once("://") {
        Some((scheme, rest)) if !scheme.is_empty() => (scheme.to_string(), rest.to_string()),
        _ => (DEFAULT_SCHEME.to_string(), remote.to_string()),
    };

    let token = resolve_token(target)?;
    if token.is_none() && requirement == AuthRequirement::Required {
        debug!("resolve: no token resolved but authentication is required");
        return Err(CredentialError::MissingCredential);
    }

    // A username without a token has nothing to authenticate with
    let username = token
        .as_ref()
        .and_then(|_| target.username.as_deref().and_then(clean));

    let uri = AuthenticatedUri {
        scheme,
        username,
        token,
        location,
    };
    debug!(%uri, "resolve: returning");
    Ok(uri)
}

fn resolve_token(target: &SyncTarget) -> Result<Option<String>, CredentialError> {
    if let Some(token) = target.token.as_deref().and_then(clean) {
        debug!("resolve_token: using raw token");
        return Ok(Some(token));
    }

    let Some(path) = &target.token_file else {
        debug!("resolve_token: no token source");
        return Ok(None);
    };

    debug!(?path, "resolve_token: reading token file");
    let contents = fs::read_to_string(path).map_err(|source| CredentialError::TokenUnreadable {
        path: path.clone(),
        source,
    })?;
    Ok(clean(&contents))
}

/// Remove every whitespace character; `None` if nothing is left
fn clean(value: &str) -> Option<String> {
    let cleaned: String = value.chars().filter(|c| !c.is_whitespace()).collect();
    if cleaned.is_empty() { None } else { Some(cleaned) }
}
