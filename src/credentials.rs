use crate::image_reference::normalize_registry_host;
use crate::secret_string::SecretString;
use anyhow::{Context, Result};
use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use serde::Deserialize;
use std::collections::{BTreeMap, HashMap};
use tracing::{debug, info};

/// Name of the image pull secret read from the namespace of every checked pod.
pub static REGISTRY_PULL_SECRET: &str = "agent-registry-pull-secret";

/// Secret data keys, in lookup order.
pub static DOCKER_CONFIG_JSON_KEY: &str = ".dockerconfigjson";
pub static DOCKER_CFG_KEY: &str = ".dockercfg";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RegistryAuth {
    Basic {
        username: String,
        password: SecretString,
    },
    Bearer(SecretString),
    /// OAuth2 refresh token, only exchanged at the registry's token endpoint
    IdentityToken(SecretString),
}

/// Authentication material per registry host. An empty set means anonymous access.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RegistryCredentials {
    auths: HashMap<String, RegistryAuth>,
}

#[derive(Debug, Deserialize)]
struct DockerConfig {
    auths: BTreeMap<String, DockerConfigEntry>,
}

#[derive(Debug, Deserialize)]
struct DockerConfigEntry {
    #[serde(default)]
    username: Option<String>,
    #[serde(default)]
    password: Option<SecretString>,
    #[serde(default)]
    auth: Option<SecretString>,
    #[serde(default, rename = "identitytoken")]
    identity_token: Option<SecretString>,
    #[serde(default, rename = "registrytoken")]
    registry_token: Option<SecretString>,
}

impl RegistryCredentials {
    pub fn anonymous() -> Self {
        Self::default()
    }

    pub fn is_anonymous(&self) -> bool {
        self.auths.is_empty()
    }

    pub fn for_registry(&self, registry: &str) -> Option<&RegistryAuth> {
        self.auths.get(&normalize_registry_host(registry))
    }

    /// Resolves the pull secret payload into credentials.
    ///
    /// A missing or malformed payload resolves to anonymous access: public images must still
    /// be checked when no pull secret is configured.
    pub fn resolve(payload: Option<&[u8]>) -> Self {
        let Some(payload) = payload else {
            debug!("No registry pull secret found, using anonymous registry access");
            return Self::anonymous();
        };
        match Self::parse(payload) {
            Ok(credentials) => credentials,
            Err(e) => {
                info!(
                    "Ignoring malformed registry pull secret, using anonymous registry access: {:#}",
                    e
                );
                Self::anonymous()
            }
        }
    }

    fn parse(payload: &[u8]) -> Result<Self> {
        let value: serde_json::Value =
            serde_json::from_slice(payload).context("Pull secret is not valid JSON")?;

        // .dockerconfigjson nests hosts under "auths", legacy .dockercfg has them at the top level
        let config: DockerConfig = if value.get("auths").is_some() {
            serde_json::from_value(value).context("Failed to parse docker config")?
        } else {
            DockerConfig {
                auths: serde_json::from_value(value).context("Failed to parse legacy docker config")?,
            }
        };

        let mut auths = HashMap::new();
        for (server, entry) in config.auths {
            let host = registry_host_from_server(&server);
            match entry.into_auth() {
                Ok(Some(auth)) => {
                    auths.insert(host, auth);
                }
                Ok(None) => debug!("No usable credentials for registry {}", server),
                Err(e) => info!("Ignoring invalid credentials for registry {}: {:#}", server, e),
            }
        }
        Ok(Self { auths })
    }
}

impl DockerConfigEntry {
    fn into_auth(self) -> Result<Option<RegistryAuth>> {
        if let Some(token) = self.registry_token.filter(|token| !token.is_empty()) {
            return Ok(Some(RegistryAuth::Bearer(token)));
        }
        if let Some(token) = self.identity_token.filter(|token| !token.is_empty()) {
            return Ok(Some(RegistryAuth::IdentityToken(token)));
        }

        if let (Some(username), Some(password)) = (self.username, self.password) {
            if !username.is_empty() {
                return Ok(Some(RegistryAuth::Basic { username, password }));
            }
        }

        match self.auth {
            Some(auth) if !auth.is_empty() => {
                let decoded = STANDARD
                    .decode(auth.expose_secret())
                    .context("auth field is not valid base64")?;
                let decoded = String::from_utf8(decoded).context("auth field is not valid UTF-8")?;
                let (username, password) = decoded
                    .split_once(':')
                    .context("auth field is not in user:password format")?;
                Ok(Some(RegistryAuth::Basic {
                    username: username.to_string(),
                    password: SecretString::new(password),
                }))
            }
            _ => Ok(None),
        }
    }
}

/// Docker config keys may be bare hosts or URLs like `https://index.docker.io/v1/`.
fn registry_host_from_server(server: &str) -> String {
    let without_scheme = server
        .strip_prefix("https://")
        .or_else(|| server.strip_prefix("http://"))
        .unwrap_or(server);
    let host = without_scheme.split('/').next().unwrap_or(without_scheme);
    normalize_registry_host(host)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_resolve_docker_config_json_with_username_and_password() {
        let payload = br#"{"auths": {"registry.example.com": {"username": "agent", "password": "s3cret"}}}"#;
        let credentials = RegistryCredentials::resolve(Some(payload));

        assert_eq!(
            credentials.for_registry("registry.example.com"),
            Some(&RegistryAuth::Basic {
                username: "agent".to_string(),
                password: SecretString::new("s3cret"),
            })
        );
        assert_eq!(credentials.for_registry("quay.io"), None);
    }

    #[test]
    fn test_resolve_decodes_auth_field() {
        // base64("agent:pa:ss")
        let payload = br#"{"auths": {"https://index.docker.io/v1/": {"auth": "YWdlbnQ6cGE6c3M="}}}"#;
        let credentials = RegistryCredentials::resolve(Some(payload));

        assert_eq!(
            credentials.for_registry("docker.io"),
            Some(&RegistryAuth::Basic {
                username: "agent".to_string(),
                password: SecretString::new("pa:ss"),
            })
        );
    }

    #[test]
    fn test_resolve_prefers_registry_token() {
        let payload = br#"{"auths": {"quay.io": {"username": "agent", "password": "pw", "registrytoken": "tok", "identitytoken": "refresh"}}}"#;
        let credentials = RegistryCredentials::resolve(Some(payload));

        assert_eq!(
            credentials.for_registry("quay.io"),
            Some(&RegistryAuth::Bearer(SecretString::new("tok")))
        );
    }

    #[test]
    fn test_resolve_identity_token_is_not_a_bearer_token() {
        let payload = br#"{"auths": {"myregistry.azurecr.io": {"username": "00000000-0000-0000-0000-000000000000", "identitytoken": "refresh"}}}"#;
        let credentials = RegistryCredentials::resolve(Some(payload));

        assert_eq!(
            credentials.for_registry("myregistry.azurecr.io"),
            Some(&RegistryAuth::IdentityToken(SecretString::new("refresh")))
        );
    }

    #[test]
    fn test_resolve_skips_invalid_entry_and_keeps_the_rest() {
        // base64("nocolon")
        let payload = br#"{"auths": {"quay.io": {"username": "agent", "password": "pw"}, "other.io": {"auth": "bm9jb2xvbg=="}}}"#;
        let credentials = RegistryCredentials::resolve(Some(payload));

        assert_eq!(
            credentials.for_registry("quay.io"),
            Some(&RegistryAuth::Basic {
                username: "agent".to_string(),
                password: SecretString::new("pw"),
            })
        );
        assert_eq!(credentials.for_registry("other.io"), None);
    }

    #[test]
    fn test_resolve_legacy_dockercfg() {
        let payload = br#"{"quay.io": {"username": "agent", "password": "pw"}}"#;
        let credentials = RegistryCredentials::resolve(Some(payload));

        assert!(credentials.for_registry("quay.io").is_some());
    }

    #[test]
    fn test_resolve_missing_secret_is_anonymous() {
        assert!(RegistryCredentials::resolve(None).is_anonymous());
    }

    #[test]
    fn test_resolve_malformed_secret_is_anonymous() {
        assert!(RegistryCredentials::resolve(Some(b"not json")).is_anonymous());
        assert!(
            RegistryCredentials::resolve(Some(br#"{"auths": {"quay.io": {"auth": "%%%"}}}"#))
                .is_anonymous()
        );
    }

    #[test]
    fn test_registry_host_from_server() {
        assert_eq!(registry_host_from_server("https://index.docker.io/v1/"), "docker.io");
        assert_eq!(registry_host_from_server("localhost:5000"), "localhost:5000");
        assert_eq!(registry_host_from_server("http://Quay.io"), "quay.io");
    }
}
