use crate::config::Config;
use crate::controller::CONTROLLER_NAME;
use crate::credentials::{RegistryAuth, RegistryCredentials};
use crate::image_reference::{ImageReference, ParseError, normalize_registry_host};
use anyhow::Context;
use async_trait::async_trait;
use regex::Regex;
use reqwest::header::{ACCEPT, WWW_AUTHENTICATE};
use reqwest::{Certificate, Client, RequestBuilder, Response, StatusCode};
use serde::Deserialize;
use std::collections::{HashMap, HashSet};
use std::fs;
use tracing::{debug, info};

#[cfg(test)]
use mockall::automock;

static MANIFEST_MEDIA_TYPES: &str = "application/vnd.oci.image.index.v1+json, \
    application/vnd.oci.image.manifest.v1+json, \
    application/vnd.docker.distribution.manifest.list.v2+json, \
    application/vnd.docker.distribution.manifest.v2+json";
static DOCKER_CONTENT_DIGEST_HEADER: &str = "Docker-Content-Digest";

#[derive(Debug, thiserror::Error)]
pub enum RegistryError {
    #[error("invalid image reference {image}: {source}")]
    InvalidImage {
        image: String,
        #[source]
        source: ParseError,
    },
    #[error("registry {registry} is unavailable: {source}")]
    Unavailable {
        registry: String,
        #[source]
        source: reqwest::Error,
    },
    #[error("registry {registry} rate limited the manifest request")]
    RateLimited { registry: String },
    #[error("registry {registry} rejected authentication with status {status}")]
    AuthFailed { registry: String, status: StatusCode },
    #[error("registry {registry} returned unexpected status {status} for {url}")]
    UnexpectedStatus {
        registry: String,
        url: String,
        status: StatusCode,
    },
    #[error("registry {registry} did not return a Docker-Content-Digest header")]
    MissingDigest { registry: String },
}

impl RegistryError {
    /// Rate limiting aborts the whole update cycle, every other error only affects one container.
    pub fn is_rate_limited(&self) -> bool {
        matches!(self, RegistryError::RateLimited { .. })
    }
}

#[cfg_attr(test, automock)]
#[async_trait]
pub trait VersionChecker: Send + Sync {
    /// Whether `observed_digest` is the digest currently published for `image`.
    async fn is_latest(
        &self,
        image: &str,
        observed_digest: &str,
        credentials: &RegistryCredentials,
    ) -> Result<bool, RegistryError>;
}

pub fn create_client(config: &Config) -> anyhow::Result<Client> {
    info!("Initializing OCI Registry HTTP client");
    // System certificates are loaded automatically with rustls-tls-native-roots
    let mut client_builder = Client::builder().timeout(config.registry_timeout());

    for file_path in &config.tls.ca_certificate_paths {
        let file_content = fs::read(file_path)
            .with_context(|| format!("Failed to read file {}", file_path.display()))?;
        let cert = Certificate::from_pem(&file_content).context("Failed to parse certificate")?;
        client_builder = client_builder.add_root_certificate(cert);
    }

    client_builder.build().context("Failed to build HTTP client")
}

/// Looks up published digests through the OCI distribution manifest endpoint.
#[derive(Clone)]
pub struct OciVersionChecker {
    client: Client,
    insecure_registries: HashSet<String>,
}

#[derive(Debug, Deserialize)]
struct TokenResponse {
    token: Option<String>,
    access_token: Option<String>,
}

impl OciVersionChecker {
    pub fn new(client: Client, insecure_registries: &[String]) -> Self {
        Self {
            client,
            insecure_registries: insecure_registries
                .iter()
                .map(|registry| normalize_registry_host(registry))
                .collect(),
        }
    }

    pub async fn fetch_digest_from_tag(
        &self,
        image_reference: &ImageReference,
        credentials: &RegistryCredentials,
    ) -> Result<String, RegistryError> {
        let scheme = if self.insecure_registries.contains(&image_reference.registry) {
            "http"
        } else {
            "https"
        };
        let url = format!(
            "{}://{}/v2/{}/manifests/{}",
            scheme,
            image_reference.api_host(),
            image_reference.repository,
            image_reference.tag
        );
        let auth = credentials.for_registry(&image_reference.registry);

        let mut response = self.fetch_manifest(image_reference, &url, auth).await?;
        if response.status() == StatusCode::UNAUTHORIZED {
            if let Some(challenge) = parse_bearer_challenge(&response) {
                let token = self
                    .fetch_bearer_token(image_reference, &challenge, auth)
                    .await?;
                let token_auth = RegistryAuth::Bearer(token.into());
                response = self
                    .fetch_manifest(image_reference, &url, Some(&token_auth))
                    .await?;
            }
        }

        let response = check_status(&image_reference.registry, &url, response)?;
        let digest = get_digest_from_response(&image_reference.registry, &response)?;
        debug!("Registry publishes digest {} for {}", digest, image_reference);
        Ok(digest)
    }

    async fn fetch_manifest(
        &self,
        image_reference: &ImageReference,
        url: &str,
        auth: Option<&RegistryAuth>,
    ) -> Result<Response, RegistryError> {
        debug!("Fetching image manifest from URL {}", url);
        let request = self.client.get(url).header(ACCEPT, MANIFEST_MEDIA_TYPES);
        with_auth(request, auth)
            .send()
            .await
            .map_err(|source| RegistryError::Unavailable {
                registry: image_reference.registry.clone(),
                source,
            })
    }

    async fn fetch_bearer_token(
        &self,
        image_reference: &ImageReference,
        challenge: &HashMap<String, String>,
        auth: Option<&RegistryAuth>,
    ) -> Result<String, RegistryError> {
        let registry = &image_reference.registry;
        let Some(realm) = challenge.get("realm") else {
            return Err(RegistryError::AuthFailed {
                registry: registry.clone(),
                status: StatusCode::UNAUTHORIZED,
            });
        };
        let scope = challenge
            .get("scope")
            .cloned()
            .unwrap_or_else(|| format!("repository:{}:pull", image_reference.repository));

        let mut query = vec![("scope", scope)];
        if let Some(service) = challenge.get("service") {
            query.push(("service", service.clone()));
        }

        let request = match auth {
            // OAuth2 refresh token grant, the identity token is never sent to the registry itself
            Some(RegistryAuth::IdentityToken(refresh_token)) => {
                debug!("Exchanging identity token at {}", realm);
                query.extend([
                    ("grant_type", "refresh_token".to_string()),
                    ("refresh_token", refresh_token.expose_secret().to_string()),
                    ("client_id", CONTROLLER_NAME.to_string()),
                ]);
                self.client.post(realm).form(&query)
            }
            // Bearer credentials are what failed already
            Some(auth @ RegistryAuth::Basic { .. }) => {
                debug!("Requesting registry token from {}", realm);
                with_auth(self.client.get(realm).query(&query), Some(auth))
            }
            _ => {
                debug!("Requesting anonymous registry token from {}", realm);
                self.client.get(realm).query(&query)
            }
        };
        let response = request
            .send()
            .await
            .map_err(|source| RegistryError::Unavailable {
                registry: registry.clone(),
                source,
            })?;
        let response = check_status(registry, realm, response)?;

        let token_response: TokenResponse =
            response
                .json()
                .await
                .map_err(|source| RegistryError::Unavailable {
                    registry: registry.clone(),
                    source,
                })?;
        token_response
            .token
            .or(token_response.access_token)
            .filter(|token| !token.is_empty())
            .ok_or_else(|| RegistryError::AuthFailed {
                registry: registry.clone(),
                status: StatusCode::UNAUTHORIZED,
            })
    }
}

#[async_trait]
impl VersionChecker for OciVersionChecker {
    async fn is_latest(
        &self,
        image: &str,
        observed_digest: &str,
        credentials: &RegistryCredentials,
    ) -> Result<bool, RegistryError> {
        let image_reference =
            ImageReference::parse(image).map_err(|source| RegistryError::InvalidImage {
                image: image.to_string(),
                source,
            })?;

        let published_digest = match &image_reference.digest {
            Some(pinned) => pinned.clone(),
            None => {
                self.fetch_digest_from_tag(&image_reference, credentials)
                    .await?
            }
        };

        Ok(published_digest == observed_digest)
    }
}

fn with_auth(request: RequestBuilder, auth: Option<&RegistryAuth>) -> RequestBuilder {
    match auth {
        Some(RegistryAuth::Basic { username, password }) => {
            request.basic_auth(username, Some(password.expose_secret()))
        }
        Some(RegistryAuth::Bearer(token)) => request.bearer_auth(token.expose_secret()),
        // Only usable at the token endpoint
        Some(RegistryAuth::IdentityToken(_)) | None => request,
    }
}

fn check_status(registry: &str, url: &str, response: Response) -> Result<Response, RegistryError> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    Err(match status {
        StatusCode::TOO_MANY_REQUESTS => RegistryError::RateLimited {
            registry: registry.to_string(),
        },
        StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => RegistryError::AuthFailed {
            registry: registry.to_string(),
            status,
        },
        _ => RegistryError::UnexpectedStatus {
            registry: registry.to_string(),
            url: url.to_string(),
            status,
        },
    })
}

/// Parses `WWW-Authenticate: Bearer realm="...",service="...",scope="..."` into its parameters.
fn parse_bearer_challenge(response: &Response) -> Option<HashMap<String, String>> {
    let header = response.headers().get(WWW_AUTHENTICATE)?.to_str().ok()?;
    let (scheme, params) = header.trim().split_once(' ')?;
    if !scheme.eq_ignore_ascii_case("bearer") {
        return None;
    }

    let re = Regex::new(r#"(\w+)="([^"]*)""#).ok()?;
    let challenge: HashMap<String, String> = re
        .captures_iter(params)
        .map(|caps| (caps[1].to_ascii_lowercase(), caps[2].to_string()))
        .collect();
    Some(challenge)
}

fn get_digest_from_response(registry: &str, response: &Response) -> Result<String, RegistryError> {
    response
        .headers()
        .get(DOCKER_CONTENT_DIGEST_HEADER)
        .and_then(|value| value.to_str().ok())
        .map(|digest| digest.trim().to_owned())
        .filter(|digest| !digest.is_empty())
        .ok_or_else(|| RegistryError::MissingDigest {
            registry: registry.to_string(),
        })
}
