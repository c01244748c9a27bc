//! Canonical (repository, content-hash) extraction from the image
//! identifier strings the various sources report.

use thiserror::Error;

#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum IdentityError {
    #[error("malformed image identity {0:?}")]
    Malformed(String),
}

/// Parses a container image identifier of the shape
/// `[scheme://]<name>@sha256:<hex>` into `(name, hex)`.
///
/// The scheme prefix (e.g. a `docker-pullable://` pull-source marker) is
/// optional and stripped. The digest hex is treated as an opaque
/// comparison key; only non-emptiness is validated.
pub fn parse_image_id(raw: &str) -> Result<(String, String), IdentityError> {
    let malformed = || IdentityError::Malformed(raw.to_string());

    let rest = match raw.split_once("://") {
        Some((_, rest)) => rest,
        None => raw,
    };
    let (name, digest) = rest.split_once('@').ok_or_else(malformed)?;
    let hex = digest.strip_prefix("sha256:").ok_or_else(malformed)?;
    if name.is_empty() || hex.is_empty() {
        return Err(malformed());
    }
    Ok((name.to_string(), hex.to_string()))
}

/// Splits `repo[:tag]` into `(repo, tag)`.
///
/// The rightmost colon only separates a tag when it occurs after the
/// rightmost slash; otherwise it belongs to a registry host:port segment
/// and the tag is empty.
pub fn parse_repo_tag(raw: &str) -> (String, String) {
    let colon = match raw.rfind(':') {
        Some(idx) => idx,
        None => return (raw.to_string(), String::new()),
    };
    let tag_colon = match raw.rfind('/') {
        Some(slash) => colon > slash,
        None => true,
    };
    if tag_colon {
        (raw[..colon].to_string(), raw[colon + 1..].to_string())
    } else {
        (raw.to_string(), String::new())
    }
}

/// Parses a Docker Swarm service image string
/// `<repo>[:tag]@sha256:<hex>` into `(repo, tag, hex)`.
pub fn parse_swarm_image(raw: &str) -> Result<(String, String, String), IdentityError> {
    let (repo_tag, hex) = parse_image_id(raw)?;
    let (repo, tag) = parse_repo_tag(&repo_tag);
    Ok((repo, tag, hex))
}
