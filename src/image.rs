use std::fmt;
use std::sync::LazyLock;

use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::error::ParseError;

/// Registry assumed when a reference carries no domain.
pub const DEFAULT_DOMAIN: &str = "docker.io";

static PATH_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^[a-z0-9]+(?:(?:\.|_|__|-+)[a-z0-9]+)*(?:/[a-z0-9]+(?:(?:\.|_|__|-+)[a-z0-9]+)*)*$")
        .unwrap()
});

static TAG_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[A-Za-z0-9_][A-Za-z0-9._-]{0,127}$").unwrap());

static DIGEST_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[a-z0-9]+(?:[.+_-][a-z0-9]+)*:[a-fA-F0-9]{32,}$").unwrap());

#[derive(Debug, Clone, Default)]
pub struct ParseOptions {
    /// Overrides the built-in web link templates. Supports `{domain}` and
    /// `{path}` placeholders.
    pub link_template: Option<String>,
}

/// A parsed, normalized image reference. Immutable once constructed; the
/// canonical string form is the manifest store key.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Image {
    pub domain: String,
    pub path: String,
    pub tag: String,
    pub digest: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    link: Option<String>,
}

impl Image {
    /// Parses a free-form image name such as `crazymax/diun:4` or
    /// `ghcr.io/foo/bar@sha256:...`. The domain defaults to the public
    /// registry and the tag to `latest` when neither a tag nor a digest is
    /// present.
    pub fn parse(name: &str, options: &ParseOptions) -> Result<Image, ParseError> {
        let trimmed = name.trim();
        if trimmed.is_empty() {
            return Err(ParseError::Invalid {
                name: name.to_string(),
                reason: "empty reference",
            });
        }

        let (rest, digest) = match trimmed.split_once('@') {
            Some((rest, digest)) => {
                if !DIGEST_RE.is_match(digest) {
                    return Err(ParseError::Invalid {
                        name: name.to_string(),
                        reason: "malformed digest",
                    });
                }
                (rest, Some(digest.to_string()))
            }
            None => (trimmed, None),
        };

        let (domain, remainder) = match rest.split_once('/') {
            Some((first, tail))
                if first.contains('.') || first.contains(':') || first == "localhost" =>
            {
                (first.to_string(), tail.to_string())
            }
            _ => (DEFAULT_DOMAIN.to_string(), rest.to_string()),
        };

        let (path, tag) = match remainder.rsplit_once(':') {
            Some((path, tag)) if !tag.contains('/') => (path.to_string(), tag.to_string()),
            _ => (remainder, String::new()),
        };

        let tag = if tag.is_empty() && digest.is_none() {
            "latest".to_string()
        } else {
            tag
        };

        let path = if domain == DEFAULT_DOMAIN && !path.contains('/') {
            format!("library/{path}")
        } else {
            path
        };

        if path.chars().any(|c| c.is_ascii_uppercase()) {
            return Err(ParseError::Invalid {
                name: name.to_string(),
                reason: "repository path must be lowercase",
            });
        }
        if !PATH_RE.is_match(&path) {
            return Err(ParseError::Invalid {
                name: name.to_string(),
                reason: "invalid characters in repository path",
            });
        }
        if !tag.is_empty() && !TAG_RE.is_match(&tag) {
            return Err(ParseError::Invalid {
                name: name.to_string(),
                reason: "invalid tag",
            });
        }

        let link = link_for(&domain, &path, options)?;

        Ok(Image {
            domain,
            path,
            tag,
            digest,
            link,
        })
    }

    /// The canonical store key: `domain/path:tag`, or `domain/path@digest`
    /// when the reference is digest-pinned without a tag. This is a
    /// wire-format contract; changing it requires a store migration.
    pub fn canonical(&self) -> String {
        if self.tag.is_empty() {
            if let Some(digest) = &self.digest {
                return format!("{}/{}@{}", self.domain, self.path, digest);
            }
        }
        format!("{}/{}:{}", self.domain, self.path, self.tag)
    }

    /// `domain/path` without a tag or digest.
    pub fn repository(&self) -> String {
        format!("{}/{}", self.domain, self.path)
    }

    /// The reference to fetch: the digest when pinned, the tag otherwise.
    pub fn reference(&self) -> &str {
        match &self.digest {
            Some(digest) => digest,
            None => &self.tag,
        }
    }

    /// Best-effort human-readable URL to the image's page on well-known
    /// registries. `None` for unrecognized domains.
    pub fn external_link(&self) -> Option<&str> {
        self.link.as_deref()
    }

    /// The same repository pointed at another tag. Used when a repository
    /// watch fans out into per-tag checks; any digest pin is dropped since it
    /// only identifies the original reference.
    pub fn with_tag(&self, tag: &str) -> Image {
        Image {
            domain: self.domain.clone(),
            path: self.path.clone(),
            tag: tag.to_string(),
            digest: None,
            link: self.link.clone(),
        }
    }
}

impl fmt::Display for Image {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.canonical())
    }
}

fn link_for(
    domain: &str,
    path: &str,
    options: &ParseOptions,
) -> Result<Option<String>, ParseError> {
    if let Some(template) = &options.link_template {
        return render_template(template, domain, path).map(Some);
    }

    Ok(match domain {
        DEFAULT_DOMAIN => Some(match path.strip_prefix("library/") {
            Some(official) => format!("https://hub.docker.com/_/{official}"),
            None => format!("https://hub.docker.com/r/{path}"),
        }),
        "quay.io" => Some(format!("https://quay.io/repository/{path}")),
        "ghcr.io" => path.split_once('/').map(|(owner, package)| {
            format!(
                "https://github.com/users/{owner}/packages/container/package/{}",
                package.replace('/', "%2F")
            )
        }),
        "registry.gitlab.com" => Some(format!("https://gitlab.com/{path}/container_registry")),
        "registry.access.redhat.com" => Some(format!(
            "https://access.redhat.com/containers/#/registry.access.redhat.com/{path}"
        )),
        d if d == "gcr.io" || d.ends_with(".gcr.io") => Some(format!("https://{domain}/{path}")),
        _ => None,
    })
}

fn render_template(template: &str, domain: &str, path: &str) -> Result<String, ParseError> {
    let mut out = String::with_capacity(template.len() + path.len());
    let mut chars = template.char_indices();

    while let Some((idx, c)) = chars.next() {
        if c != '{' {
            out.push(c);
            continue;
        }
        let Some(end) = template[idx..].find('}') else {
            return Err(ParseError::Template {
                template: template.to_string(),
                reason: "unterminated placeholder",
            });
        };
        let key = &template[idx + 1..idx + end];
        match key {
            "domain" => out.push_str(domain),
            "path" => out.push_str(path),
            _ => {
                return Err(ParseError::Template {
                    template: template.to_string(),
                    reason: "unknown placeholder",
                });
            }
        }
        // skip past the placeholder body and the closing brace
        for _ in 0..end {
            chars.next();
        }
    }

    Ok(out)
}
