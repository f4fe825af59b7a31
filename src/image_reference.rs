use std::fmt;

pub const DOCKER_HUB_REGISTRY: &str = "docker.io";
const DOCKER_HUB_API_HOST: &str = "registry-1.docker.io";
const DEFAULT_TAG: &str = "latest";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImageReference {
    pub registry: String,
    pub repository: String,
    pub tag: String,
    /// Set when the reference is pinned with `@sha256:...`
    pub digest: Option<String>,
}

#[derive(Debug, PartialEq, Eq)]
pub enum ParseError {
    Empty,
    MissingRepository,
    InvalidDigest(String),
    InvalidFormat(String),
}

impl std::error::Error for ParseError {}
impl fmt::Display for ParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ParseError::Empty => write!(f, "image reference is empty"),
            ParseError::MissingRepository => write!(f, "repository is missing"),
            ParseError::InvalidDigest(digest) => write!(f, "invalid digest: {}", digest),
            ParseError::InvalidFormat(image) => write!(f, "invalid image format: {}", image),
        }
    }
}

impl fmt::Display for ImageReference {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}:{}", self.registry, self.repository, self.tag)?;
        if let Some(digest) = &self.digest {
            write!(f, "@{}", digest)?;
        }
        Ok(())
    }
}

impl ImageReference {
    pub fn parse(s: &str) -> Result<Self, ParseError> {
        let s = s.trim();
        if s.is_empty() {
            return Err(ParseError::Empty);
        }

        let (name, digest) = match s.split_once('@') {
            Some((name, digest)) => {
                if !is_valid_digest(digest) {
                    return Err(ParseError::InvalidDigest(digest.to_string()));
                }
                (name, Some(digest.to_string()))
            }
            None => (s, None),
        };

        // A tag is a colon after the last slash, otherwise the colon belongs to a registry port
        let last_slash = name.rfind('/');
        let (without_tag, tag) = match name.rfind(':') {
            Some(pos) if last_slash.is_none_or(|slash| pos > slash) => {
                (&name[..pos], Some(&name[pos + 1..]))
            }
            _ => (name, None),
        };
        if tag.is_some_and(str::is_empty) {
            return Err(ParseError::InvalidFormat(s.to_string()));
        }

        let (registry, repository) = match without_tag.split_once('/') {
            Some((first, rest)) if looks_like_registry_host(first) => (first, rest.to_string()),
            _ => (DOCKER_HUB_REGISTRY, without_tag.to_string()),
        };
        if repository.is_empty() || repository.split('/').any(str::is_empty) {
            return Err(ParseError::MissingRepository);
        }

        let registry = normalize_registry_host(registry);
        let repository = if registry == DOCKER_HUB_REGISTRY && !repository.contains('/') {
            format!("library/{}", repository)
        } else {
            repository
        };

        Ok(Self {
            registry,
            repository,
            tag: tag.unwrap_or(DEFAULT_TAG).to_string(),
            digest,
        })
    }

    /// Host that serves the registry's `/v2/` API
    pub fn api_host(&self) -> &str {
        if self.registry == DOCKER_HUB_REGISTRY {
            DOCKER_HUB_API_HOST
        } else {
            &self.registry
        }
    }
}

/// Maps the aliases Docker Hub is known under to a single host name.
pub fn normalize_registry_host(host: &str) -> String {
    let host = host.to_ascii_lowercase();
    match host.as_str() {
        "index.docker.io" | "registry-1.docker.io" | "registry.hub.docker.com" => {
            DOCKER_HUB_REGISTRY.to_string()
        }
        _ => host,
    }
}

/// Extracts the content digest from a container status `imageID`.
///
/// Container runtimes report values like `docker-pullable://repo@sha256:...` or
/// `repo@sha256:...`. A bare `sha256:...` is the local image config ID, which never
/// matches a manifest digest. Returns an empty string when the image has not been
/// pulled yet or the value carries no manifest digest.
pub fn digest_from_image_id(image_id: &str) -> String {
    match image_id.rsplit_once('@') {
        Some((_, digest)) if is_valid_digest(digest) => digest.to_string(),
        _ => String::new(),
    }
}

fn is_valid_digest(digest: &str) -> bool {
    match digest.split_once(':') {
        Some((algorithm, hex)) => {
            !algorithm.is_empty()
                && !hex.is_empty()
                && algorithm.chars().all(|c| c.is_ascii_alphanumeric())
                && hex.chars().all(|c| c.is_ascii_hexdigit())
        }
        None => false,
    }
}

fn looks_like_registry_host(segment: &str) -> bool {
    segment.contains('.') || segment.contains(':') || segment == "localhost"
}

#[cfg(test)]
mod tests {
    use super::*;

    const DIGEST: &str = "sha256:4b2d7f6a9c1e0b3d5f7a9c1e0b3d5f7a9c1e0b3d5f7a9c1e0b3d5f7a9c1e0b3d";

    #[test]
    fn test_parse_fully_qualified_reference() {
        let reference = ImageReference::parse("registry.example.com/agents/collector:1.2.3")
            .expect("Should parse");
        assert_eq!(reference.registry, "registry.example.com");
        assert_eq!(reference.repository, "agents/collector");
        assert_eq!(reference.tag, "1.2.3");
        assert_eq!(reference.digest, None);
        assert_eq!(reference.api_host(), "registry.example.com");
    }

    #[test]
    fn test_parse_defaults_to_docker_hub_and_latest() {
        let reference = ImageReference::parse("busybox").expect("Should parse");
        assert_eq!(reference.registry, "docker.io");
        assert_eq!(reference.repository, "library/busybox");
        assert_eq!(reference.tag, "latest");
        assert_eq!(reference.api_host(), "registry-1.docker.io");

        let reference = ImageReference::parse("grafana/agent:v1").expect("Should parse");
        assert_eq!(reference.registry, "docker.io");
        assert_eq!(reference.repository, "grafana/agent");
        assert_eq!(reference.tag, "v1");
    }

    #[test]
    fn test_parse_registry_with_port() {
        let reference = ImageReference::parse("localhost:5000/agent").expect("Should parse");
        assert_eq!(reference.registry, "localhost:5000");
        assert_eq!(reference.repository, "agent");
        assert_eq!(reference.tag, "latest");
    }

    #[test]
    fn test_parse_pinned_digest() {
        let input = format!("quay.io/agents/collector:1.0@{}", DIGEST);
        let reference = ImageReference::parse(&input).expect("Should parse");
        assert_eq!(reference.tag, "1.0");
        assert_eq!(reference.digest.as_deref(), Some(DIGEST));
        assert_eq!(reference.to_string(), input);
    }

    #[test]
    fn test_parse_rejects_invalid_references() {
        assert_eq!(ImageReference::parse("  "), Err(ParseError::Empty));
        assert_eq!(
            ImageReference::parse("quay.io/"),
            Err(ParseError::MissingRepository)
        );
        assert!(matches!(
            ImageReference::parse("quay.io/agent@latest"),
            Err(ParseError::InvalidDigest(_))
        ));
        assert!(matches!(
            ImageReference::parse("quay.io/agent:"),
            Err(ParseError::InvalidFormat(_))
        ));
    }

    #[test]
    fn test_normalize_docker_hub_aliases() {
        assert_eq!(normalize_registry_host("index.docker.io"), "docker.io");
        assert_eq!(normalize_registry_host("Registry-1.Docker.io"), "docker.io");
        assert_eq!(normalize_registry_host("quay.io"), "quay.io");
    }

    #[test]
    fn test_digest_from_image_id() {
        assert_eq!(
            digest_from_image_id(&format!("docker-pullable://quay.io/agent@{}", DIGEST)),
            DIGEST
        );
        assert_eq!(digest_from_image_id(&format!("quay.io/agent@{}", DIGEST)), DIGEST);
        assert_eq!(digest_from_image_id(&format!("quay.io/agent@{}", "sha256:zz")), "");
        assert_eq!(digest_from_image_id(""), "");
        assert_eq!(digest_from_image_id("quay.io/agent:1.0"), "");
    }

    #[test]
    fn test_digest_from_image_id_ignores_bare_config_id() {
        // cri-dockerd reports the config ID when the image was loaded without a repo digest
        assert_eq!(digest_from_image_id(DIGEST), "");
        assert_eq!(digest_from_image_id(&format!("docker://{}", DIGEST)), "");
    }
}
