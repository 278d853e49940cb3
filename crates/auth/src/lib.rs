use http::HeaderMap;
use http::header;
use jsonwebtoken::{Algorithm, DecodingKey, Validation, decode};
use serde_json::Value;

pub const PRINCIPAL_HEADER: &str = "x-sqlgate-principal-id";
pub const ROLES_HEADER: &str = "x-sqlgate-roles";
pub const DEFAULT_LOCAL_ROLE: &str = "viewer";

const ACCESS_TOKEN_TYPE: &str = "access";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Principal {
    pub principal_id: String,
    pub roles: Vec<String>,
}

impl Principal {
    pub fn has_role(&self, role: &str) -> bool {
        self.roles.iter().any(|r| r.eq_ignore_ascii_case(role))
    }
}

#[derive(Debug, Clone)]
pub struct AuthError {
    pub code: &'static str,
    pub message: String,
}

impl AuthError {
    fn required(message: impl Into<String>) -> Self {
        Self {
            code: "AUTH_REQUIRED",
            message: message.into(),
        }
    }

    fn invalid(message: impl Into<String>) -> Self {
        Self {
            code: "AUTH_INVALID",
            message: message.into(),
        }
    }
}

impl std::fmt::Display for AuthError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.code, self.message)
    }
}

impl std::error::Error for AuthError {}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthMode {
    /// Trusts `x-sqlgate-principal-id` / `x-sqlgate-roles`. Loopback only.
    Local,
    /// HS256 access tokens issued by the login service.
    Token,
}

impl AuthMode {
    pub fn parse(raw: &str) -> Option<Self> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "local" => Some(AuthMode::Local),
            "token" => Some(AuthMode::Token),
            _ => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            AuthMode::Local => "local",
            AuthMode::Token => "token",
        }
    }
}

#[derive(Clone)]
pub struct TokenAuthenticator {
    key: DecodingKey,
    validation: Validation,
}

impl TokenAuthenticator {
    pub fn new(secret: &str, leeway_secs: u64) -> Result<Self, AuthError> {
        if secret.trim().is_empty() {
            return Err(AuthError {
                code: "ERR_INVALID_CONFIG",
                message: "token secret must be non-empty".to_string(),
            });
        }

        let mut validation = Validation::new(Algorithm::HS256);
        validation.leeway = leeway_secs;
        validation.validate_aud = false;
        validation.set_required_spec_claims(&["exp", "sub"]);

        Ok(Self {
            key: DecodingKey::from_secret(secret.as_bytes()),
            validation,
        })
    }

    pub fn authenticate(&self, headers: &HeaderMap) -> Result<Principal, AuthError> {
        let token = bearer_token(headers)?;

        let decoded = decode::<Value>(&token, &self.key, &self.validation)
            .map_err(|_| AuthError::invalid("token validation failed"))?;
        let claims = decoded.claims;

        let token_type = claims.get("type").and_then(Value::as_str);
        if token_type != Some(ACCESS_TOKEN_TYPE) {
            return Err(AuthError::invalid("token is not an access token"));
        }

        let principal_id = claim_string(&claims, "sub")?;
        let roles = claim_string_vec(&claims, "roles")?;

        Ok(Principal {
            principal_id,
            roles,
        })
    }
}

/// Resolves the caller identity for a request according to the configured mode.
#[derive(Clone)]
pub enum Authenticator {
    Local,
    Token(TokenAuthenticator),
}

impl Authenticator {
    pub fn mode(&self) -> AuthMode {
        match self {
            Authenticator::Local => AuthMode::Local,
            Authenticator::Token(_) => AuthMode::Token,
        }
    }

    pub fn authenticate(&self, headers: &HeaderMap) -> Result<Principal, AuthError> {
        match self {
            Authenticator::Local => local_principal(headers),
            Authenticator::Token(auth) => auth.authenticate(headers),
        }
    }
}

fn local_principal(headers: &HeaderMap) -> Result<Principal, AuthError> {
    let principal_id = headers
        .get(PRINCIPAL_HEADER)
        .and_then(|v| v.to_str().ok())
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .ok_or_else(|| AuthError::required(format!("missing {} header", PRINCIPAL_HEADER)))?;

    if principal_id.len() > 256 {
        return Err(AuthError::invalid("principal id is too long"));
    }

    let mut roles = match headers.get(ROLES_HEADER) {
        Some(value) => value
            .to_str()
            .map_err(|_| AuthError::invalid(format!("{} must be ASCII", ROLES_HEADER)))?
            .split(',')
            .map(str::trim)
            .filter(|r| !r.is_empty())
            .map(str::to_string)
            .collect::<Vec<_>>(),
        None => Vec::new(),
    };
    if roles.is_empty() {
        roles.push(DEFAULT_LOCAL_ROLE.to_string());
    }
    roles.sort();
    roles.dedup();

    Ok(Principal {
        principal_id: principal_id.to_string(),
        roles,
    })
}

fn bearer_token(headers: &HeaderMap) -> Result<String, AuthError> {
    let authz = headers
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .map(|v| v.trim())
        .filter(|v| !v.is_empty())
        .ok_or_else(|| AuthError::required("missing Authorization header"))?;

    let token = authz
        .strip_prefix("Bearer ")
        .or_else(|| authz.strip_prefix("bearer "))
        .ok_or_else(|| AuthError::invalid("Authorization must be a Bearer token"))?;

    if token.trim().is_empty() {
        return Err(AuthError::invalid("Bearer token is empty"));
    }

    Ok(token.trim().to_string())
}

fn claim_string(claims: &Value, claim: &str) -> Result<String, AuthError> {
    claims
        .get(claim)
        .and_then(|v| v.as_str())
        .map(|s| s.trim())
        .filter(|s| !s.is_empty())
        .map(|s| s.to_string())
        .ok_or_else(|| {
            AuthError::invalid(format!(
                "required claim `{}` is missing or not a string",
                claim
            ))
        })
}

fn claim_string_vec(claims: &Value, claim: &str) -> Result<Vec<String>, AuthError> {
    let Some(value) = claims.get(claim) else {
        return Ok(Vec::new());
    };

    match value {
        Value::Null => Ok(Vec::new()),
        Value::String(s) => {
            let s = s.trim();
            if s.is_empty() {
                Ok(Vec::new())
            } else {
                Ok(vec![s.to_string()])
            }
        }
        Value::Array(items) => {
            let mut out = Vec::with_capacity(items.len());
            for item in items {
                let Some(s) = item.as_str() else {
                    return Err(AuthError::invalid(format!(
                        "claim `{}` must be a string array",
                        claim
                    )));
                };
                let s = s.trim();
                if !s.is_empty() {
                    out.push(s.to_string());
                }
            }
            out.sort();
            out.dedup();
            Ok(out)
        }
        _ => Err(AuthError::invalid(format!(
            "claim `{}` must be a string or a string array",
            claim
        ))),
    }
}
