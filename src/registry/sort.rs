use std::cmp::Ordering;

use semver::Version;
use serde::{Deserialize, Serialize};
use strum::{Display, EnumString};

/// Tag-ordering strategy applied after filtering and before truncation.
///
/// Every policy is a total order (ties broken lexicographically) so that
/// repeated calls over the same tag set return the same ordering.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, Display, EnumString,
)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum SortPolicy {
    /// Registry order, typically oldest-first.
    #[default]
    Default,
    /// Array reversal of `default`.
    Reverse,
    /// Byte-wise ascending.
    Lexicographical,
    /// Semantic-version-like, newest first; non-coercible tags last.
    Semver,
}

pub fn sort_tags(tags: &mut [String], policy: SortPolicy) {
    match policy {
        SortPolicy::Default => {}
        SortPolicy::Reverse => tags.reverse(),
        SortPolicy::Lexicographical => tags.sort(),
        SortPolicy::Semver => tags.sort_by(|a, b| compare_semver(a, b)),
    }
}

/// Coerces a tag to a semantic version by stripping any leading non-digit
/// prefix and padding the numeric core to `MAJOR.MINOR.PATCH`. Tags with more
/// than three numeric components keep the first three.
fn coerce(tag: &str) -> Option<Version> {
    let trimmed = tag.trim_start_matches(|c: char| !c.is_ascii_digit());
    if trimmed.is_empty() {
        return None;
    }
    if let Ok(version) = Version::parse(trimmed) {
        return Some(version);
    }

    let (core, suffix) = match trimmed.find(['-', '+']) {
        Some(idx) => trimmed.split_at(idx),
        None => (trimmed, ""),
    };

    let candidate = match core.matches('.').count() {
        0 => format!("{core}.0.0{suffix}"),
        1 => format!("{core}.0{suffix}"),
        2 => format!("{core}{suffix}"),
        _ => {
            let mut parts = core.splitn(4, '.');
            let major = parts.next()?;
            let minor = parts.next()?;
            let patch = parts.next()?;
            format!("{major}.{minor}.{patch}{suffix}")
        }
    };

    Version::parse(&candidate).ok()
}

fn dots(tag: &str) -> usize {
    tag.matches('.').count()
}

fn compare_semver(a: &str, b: &str) -> Ordering {
    match (coerce(a), coerce(b)) {
        // newest first; equal versions keep more-specific tags ahead
        (Some(va), Some(vb)) => vb
            .cmp(&va)
            .then(dots(b).cmp(&dots(a)))
            .then_with(|| a.cmp(b)),
        (Some(_), None) => Ordering::Less,
        (None, Some(_)) => Ordering::Greater,
        (None, None) => a.cmp(b),
    }
}
