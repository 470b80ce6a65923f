use std::fmt;

const DOCKER_TRANSPORT: &str = "docker://";
const DEFAULT_REGISTRY: &str = "docker.io";
const SHA256_PREFIX: &str = "sha256:";

/// A digest pinned image reference, e.g. `quay.io/org/app@sha256:<hex>`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImageReference {
    pub registry: String,
    pub repository: String,
    /// Including the algorithm prefix.
    pub digest: String,
}

#[derive(Debug, PartialEq, Eq)]
pub enum ParseError {
    UnsupportedTransport(String),
    MissingRepository,
    MissingDigest,
    InvalidDigest(String),
    InvalidFormat(String),
}

impl std::error::Error for ParseError {}
impl fmt::Display for ParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ParseError::UnsupportedTransport(image) => {
                write!(f, "unsupported transport in reference: {}", image)
            }
            ParseError::MissingRepository => write!(f, "repository is missing"),
            ParseError::MissingDigest => write!(f, "reference does not contain digest"),
            ParseError::InvalidDigest(digest) => write!(f, "invalid digest: {}", digest),
            ParseError::InvalidFormat(image) => write!(f, "invalid image format: {}", image),
        }
    }
}

impl fmt::Display for ImageReference {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}@{}", self.registry, self.repository, self.digest)
    }
}

impl ImageReference {
    pub fn parse(s: &str) -> Result<Self, ParseError> {
        let s = match s.strip_prefix(DOCKER_TRANSPORT) {
            Some(rest) => rest,
            None if s.contains("://") => return Err(ParseError::UnsupportedTransport(s.to_string())),
            None => s,
        };

        let (name, digest) = s.split_once('@').ok_or(ParseError::MissingDigest)?;
        validate_digest(digest)?;

        // a tag in front of the digest carries no information, the digest wins
        let name = match name.rfind(':') {
            Some(pos) if pos > name.rfind('/').unwrap_or(0) => &name[..pos],
            _ => name,
        };
        if name.is_empty() {
            return Err(ParseError::MissingRepository);
        }
        if name.chars().any(char::is_whitespace) {
            return Err(ParseError::InvalidFormat(s.to_string()));
        }

        // Docker's rules: the first component is a registry host only if it looks like one
        let (registry, repository) = match name.split_once('/') {
            Some((first, rest))
                if first.contains('.') || first.contains(':') || first == "localhost" =>
            {
                (first.to_string(), rest.to_string())
            }
            Some(_) => (DEFAULT_REGISTRY.to_string(), name.to_string()),
            None => (DEFAULT_REGISTRY.to_string(), format!("library/{}", name)),
        };

        if repository.is_empty() || repository.split('/').any(str::is_empty) {
            return Err(ParseError::InvalidFormat(s.to_string()));
        }

        Ok(Self {
            registry,
            repository,
            digest: digest.to_string(),
        })
    }

    /// The digest without its algorithm prefix. ImageScans are named after it.
    pub fn digest_hex(&self) -> &str {
        self.digest
            .strip_prefix(SHA256_PREFIX)
            .unwrap_or(&self.digest)
    }
}

fn validate_digest(digest: &str) -> Result<(), ParseError> {
    let hex = digest
        .strip_prefix(SHA256_PREFIX)
        .ok_or_else(|| ParseError::InvalidDigest(digest.to_string()))?;
    let valid = hex.len() == 64
        && hex
            .chars()
            .all(|c| c.is_ascii_digit() || ('a'..='f').contains(&c));
    if !valid {
        return Err(ParseError::InvalidDigest(digest.to_string()));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    const HEX: &str = "4bf0b5cb6ac1a2c5a3c4fd84a4d0f4b0c1e88c3c4d2e2f0a1b2c3d4e5f607182";

    #[test]
    fn test_parse_with_transport() {
        let reference = ImageReference::parse(&format!("docker://quay.io/org/app@sha256:{HEX}"))
            .expect("Should parse");
        assert_eq!(reference.registry, "quay.io");
        assert_eq!(reference.repository, "org/app");
        assert_eq!(reference.digest_hex(), HEX);
        assert_eq!(reference.to_string(), format!("quay.io/org/app@sha256:{HEX}"));
    }

    #[test]
    fn test_parse_defaults_to_docker_hub() {
        let reference = ImageReference::parse(&format!("r/i@sha256:{HEX}")).unwrap();
        assert_eq!(reference.registry, "docker.io");
        assert_eq!(reference.repository, "r/i");

        let reference = ImageReference::parse(&format!("nginx@sha256:{HEX}")).unwrap();
        assert_eq!(reference.repository, "library/nginx");
    }

    #[test]
    fn test_parse_registry_with_port_and_tag() {
        let reference =
            ImageReference::parse(&format!("localhost:5000/app:v1@sha256:{HEX}")).unwrap();
        assert_eq!(reference.registry, "localhost:5000");
        assert_eq!(reference.repository, "app");
    }

    #[test]
    fn test_parse_errors() {
        assert_eq!(
            ImageReference::parse("quay.io/org/app:latest"),
            Err(ParseError::MissingDigest)
        );
        assert!(matches!(
            ImageReference::parse(&format!("oci://quay.io/org/app@sha256:{HEX}")),
            Err(ParseError::UnsupportedTransport(_))
        ));
        assert!(matches!(
            ImageReference::parse("quay.io/org/app@sha256:abc"),
            Err(ParseError::InvalidDigest(_))
        ));
        assert!(matches!(
            ImageReference::parse(&format!("quay.io/org/app@md5:{HEX}")),
            Err(ParseError::InvalidDigest(_))
        ));
        assert_eq!(
            ImageReference::parse(&format!("@sha256:{HEX}")),
            Err(ParseError::MissingRepository)
        );
    }
}
