use std::collections::HashMap;
use std::path::PathBuf;
use std::time::Duration;

use reqwest::StatusCode;
use reqwest::header::{ACCEPT, WWW_AUTHENTICATE};
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tracing::debug;

use crate::error::FetchError;
use crate::image::DEFAULT_DOMAIN;

pub(crate) mod manifest;
pub mod sort;
pub mod tags;

const fn default_timeout() -> Duration {
    Duration::from_secs(5)
}

fn default_user_agent() -> String {
    format!("tagwatch/{}", env!("CARGO_PKG_VERSION"))
}

fn default_os() -> String {
    "linux".to_string()
}

fn default_arch() -> String {
    "amd64".to_string()
}

/// A named registry-options profile. Resolved once per profile; the resulting
/// client's transport state (auth, TLS policy, user agent, timeout) is
/// immutable for its lifetime.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RegistryOptions {
    pub username: Option<String>,
    pub password: Option<String>,
    pub username_file: Option<PathBuf>,
    pub password_file: Option<PathBuf>,
    pub insecure_tls: bool,
    #[serde(with = "crate::config::duration")]
    pub timeout: Duration,
    pub user_agent: String,
    pub image_os: String,
    pub image_arch: String,
    pub image_variant: Option<String>,
}

impl Default for RegistryOptions {
    fn default() -> Self {
        Self {
            username: None,
            password: None,
            username_file: None,
            password_file: None,
            insecure_tls: false,
            timeout: default_timeout(),
            user_agent: default_user_agent(),
            image_os: default_os(),
            image_arch: default_arch(),
            image_variant: None,
        }
    }
}

impl RegistryOptions {
    /// Inline credentials win over file references; file contents are read
    /// once, when the profile is resolved into a client.
    fn credentials(&self) -> anyhow::Result<Option<(String, String)>> {
        let username = match (&self.username, &self.username_file) {
            (Some(username), _) => Some(username.clone()),
            (None, Some(path)) => Some(read_secret(path)?),
            (None, None) => None,
        };
        let password = match (&self.password, &self.password_file) {
            (Some(password), _) => Some(password.clone()),
            (None, Some(path)) => Some(read_secret(path)?),
            (None, None) => None,
        };
        Ok(username.zip(password))
    }
}

fn read_secret(path: &PathBuf) -> anyhow::Result<String> {
    let content = std::fs::read_to_string(path)
        .map_err(|err| anyhow::anyhow!("unable to read credential file {path:?}: {err}"))?;
    Ok(content.trim().to_string())
}

/// A registry client bound to one options profile. One client exists per
/// distinct profile; clients are never shared mutably across jobs with
/// different credentials.
pub struct Client {
    http: reqwest::Client,
    auth: Option<(String, String)>,
    pub(crate) image_os: String,
    pub(crate) image_arch: String,
    pub(crate) image_variant: Option<String>,
    // bearer token per (registry host, repository), negotiated lazily on 401
    // challenges; tokens are scoped to one registry and must never be
    // replayed to another host
    tokens: Mutex<HashMap<String, String>>,
}

impl Client {
    pub fn new(options: &RegistryOptions) -> anyhow::Result<Client> {
        let http = reqwest::Client::builder()
            .user_agent(&options.user_agent)
            .danger_accept_invalid_certs(options.insecure_tls)
            .timeout(options.timeout)
            .build()?;

        Ok(Client {
            http,
            auth: options.credentials()?,
            image_os: options.image_os.clone(),
            image_arch: options.image_arch.clone(),
            image_variant: options.image_variant.clone(),
            tokens: Mutex::new(HashMap::new()),
        })
    }

    /// GET with registry auth: basic credentials when configured, upgraded to
    /// a bearer token when the registry answers with a token challenge.
    pub(crate) async fn get(
        &self,
        url: &str,
        accept: Option<&str>,
        repository: &str,
    ) -> Result<reqwest::Response, FetchError> {
        let token_key = token_cache_key(url, repository);
        let mut token = self.tokens.lock().await.get(&token_key).cloned();

        for attempt in 0..2 {
            let mut builder = self.http.get(url);
            if let Some(accept) = accept {
                builder = builder.header(ACCEPT, accept);
            }
            builder = match &token {
                Some(token) => builder.bearer_auth(token),
                None => match &self.auth {
                    Some((username, password)) => builder.basic_auth(username, Some(password)),
                    None => builder,
                },
            };

            let response = builder
                .send()
                .await
                .map_err(|err| FetchError::from_reqwest(url, err))?;

            match response.status() {
                StatusCode::UNAUTHORIZED if attempt == 0 => {
                    let challenge = response
                        .headers()
                        .get(WWW_AUTHENTICATE)
                        .and_then(|value| value.to_str().ok())
                        .and_then(parse_bearer_challenge);
                    let Some(challenge) = challenge else {
                        return Err(FetchError::Unauthorized(url.to_string()));
                    };

                    debug!(repository, realm = %challenge.realm, "negotiating bearer token");
                    let fresh = self.fetch_token(&challenge, repository).await?;
                    self.tokens
                        .lock()
                        .await
                        .insert(token_key.clone(), fresh.clone());
                    token = Some(fresh);
                }
                StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => {
                    return Err(FetchError::Unauthorized(url.to_string()));
                }
                StatusCode::NOT_FOUND => return Err(FetchError::NotFound(url.to_string())),
                status if !status.is_success() => {
                    return Err(FetchError::Network(
                        url.to_string(),
                        format!("unexpected status {status}"),
                    ));
                }
                _ => return Ok(response),
            }
        }

        Err(FetchError::Unauthorized(url.to_string()))
    }

    async fn fetch_token(
        &self,
        challenge: &BearerChallenge,
        repository: &str,
    ) -> Result<String, FetchError> {
        #[derive(Deserialize)]
        struct TokenResponse {
            #[serde(default)]
            token: Option<String>,
            #[serde(default)]
            access_token: Option<String>,
        }

        let scope = challenge
            .scope
            .clone()
            .unwrap_or_else(|| format!("repository:{repository}:pull"));

        let mut builder = self.http.get(&challenge.realm).query(&[("scope", scope)]);
        if let Some(service) = &challenge.service {
            builder = builder.query(&[("service", service)]);
        }
        if let Some((username, password)) = &self.auth {
            builder = builder.basic_auth(username, Some(password));
        }

        let response = builder
            .send()
            .await
            .map_err(|err| FetchError::from_reqwest(&challenge.realm, err))?;
        if !response.status().is_success() {
            return Err(FetchError::Unauthorized(challenge.realm.clone()));
        }

        let body: TokenResponse = response
            .json()
            .await
            .map_err(|err| FetchError::from_reqwest(&challenge.realm, err))?;
        body.token.or(body.access_token).ok_or_else(|| {
            FetchError::Malformed(
                challenge.realm.clone(),
                "token response carries no token".to_string(),
            )
        })
    }
}

/// Cache key for negotiated bearer tokens: the request's host (with port)
/// plus the repository, so the same repository path on two registries never
/// shares a token.
fn token_cache_key(url: &str, repository: &str) -> String {
    let host = reqwest::Url::parse(url)
        .ok()
        .and_then(|url| {
            url.host_str().map(|host| match url.port() {
                Some(port) => format!("{host}:{port}"),
                None => host.to_string(),
            })
        })
        .unwrap_or_default();
    format!("{host}/{repository}")
}

/// Base URL for a registry domain. The public registry name maps to its
/// actual API host; loopback hosts speak plain HTTP (local proxies, tests).
pub(crate) fn base_url(domain: &str) -> String {
    if domain == DEFAULT_DOMAIN {
        return "https://registry-1.docker.io".to_string();
    }
    let host = match domain.rsplit_once(':') {
        Some((host, _port)) => host,
        None => domain,
    };
    if host == "localhost" || host == "127.0.0.1" {
        return format!("http://{domain}");
    }
    format!("https://{domain}")
}

#[derive(Debug, PartialEq, Eq)]
struct BearerChallenge {
    realm: String,
    service: Option<String>,
    scope: Option<String>,
}

fn parse_bearer_challenge(header: &str) -> Option<BearerChallenge> {
    let rest = header.strip_prefix("Bearer ")?;

    let mut realm = None;
    let mut service = None;
    let mut scope = None;
    for part in rest.split(',') {
        let (key, value) = part.trim().split_once('=')?;
        let value = value.trim_matches('"').to_string();
        match key {
            "realm" => realm = Some(value),
            "service" => service = Some(value),
            "scope" => scope = Some(value),
            _ => {}
        }
    }

    Some(BearerChallenge {
        realm: realm?,
        service,
        scope,
    })
}
