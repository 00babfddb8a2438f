use regex::Regex;
use serde::Deserialize;
use tracing::debug;

use crate::error::FetchError;
use crate::image::Image;
use crate::registry::sort::{SortPolicy, sort_tags};
use crate::registry::{Client, base_url};

const PAGE_SIZE: usize = 1000;

#[derive(Debug, Default, Clone)]
pub struct TagsOptions {
    /// Truncate the final list to this many entries; 0 means no limit.
    pub max: usize,
    pub sort: SortPolicy,
    pub include: Vec<Regex>,
    pub exclude: Vec<Regex>,
}

/// Filtered and sorted tags plus counts over the pre-filter tag set.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TagsResult {
    pub list: Vec<String>,
    pub not_included_count: usize,
    pub excluded_count: usize,
    pub total_count: usize,
}

#[derive(Debug, Deserialize)]
struct TagList {
    #[serde(default)]
    tags: Option<Vec<String>>,
}

impl Client {
    /// Lists the repository's tags, then applies the fixed
    /// filter → sort → truncate pipeline.
    pub async fn list_tags(
        &self,
        image: &Image,
        options: &TagsOptions,
    ) -> Result<TagsResult, FetchError> {
        let base = base_url(&image.domain);
        let mut url = format!("{base}/v2/{}/tags/list?n={PAGE_SIZE}", image.path);
        let mut all = Vec::new();

        loop {
            let response = self.get(&url, None, &image.path).await?;
            let next = response
                .headers()
                .get("link")
                .and_then(|value| value.to_str().ok())
                .and_then(parse_next_link);

            let page: TagList = response
                .json()
                .await
                .map_err(|err| FetchError::from_reqwest(&url, err))?;
            all.extend(page.tags.unwrap_or_default());

            match next {
                Some(next) => url = resolve_link(&base, &next),
                None => break,
            }
        }

        debug!(image = %image, tags = all.len(), "listed repository tags");
        Ok(filter_sort_truncate(all, options))
    }
}

/// Whether a single tag survives the include/exclude filters. Include is a
/// match against at least one pattern (or an empty list); exclude wins over
/// include.
pub fn keep_tag(tag: &str, include: &[Regex], exclude: &[Regex]) -> bool {
    if !include.is_empty() && !include.iter().any(|re| re.is_match(tag)) {
        return false;
    }
    !exclude.iter().any(|re| re.is_match(tag))
}

fn filter_sort_truncate(all: Vec<String>, options: &TagsOptions) -> TagsResult {
    let total_count = all.len();
    let mut not_included_count = 0;
    let mut excluded_count = 0;

    let mut list = Vec::with_capacity(all.len());
    for tag in all {
        if !options.include.is_empty() && !options.include.iter().any(|re| re.is_match(&tag)) {
            not_included_count += 1;
            continue;
        }
        if options.exclude.iter().any(|re| re.is_match(&tag)) {
            excluded_count += 1;
            continue;
        }
        list.push(tag);
    }

    sort_tags(&mut list, options.sort);
    if options.max > 0 && list.len() > options.max {
        list.truncate(options.max);
    }

    TagsResult {
        list,
        not_included_count,
        excluded_count,
        total_count,
    }
}

/// Extracts the `rel="next"` target from an RFC 5988 `Link` header. Parts
/// without parameters cannot be the next relation and are skipped.
fn parse_next_link(header: &str) -> Option<String> {
    for part in header.split(',') {
        let part = part.trim();
        let Some((target, params)) = part.split_once(';') else {
            continue;
        };
        if params.contains("rel=\"next\"") {
            return Some(
                target
                    .trim()
                    .trim_start_matches('<')
                    .trim_end_matches('>')
                    .to_string(),
            );
        }
    }
    None
}

fn resolve_link(base: &str, link: &str) -> String {
    if link.starts_with("http://") || link.starts_with("https://") {
        link.to_string()
    } else {
        format!("{base}{link}")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::image::ParseOptions;
    use crate::registry::RegistryOptions;
    use test_log::test;
    use wiremock::matchers::{method, path, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn regexes(patterns: &[&str]) -> Vec<Regex> {
        patterns.iter().map(|p| Regex::new(p).unwrap()).collect()
    }

    fn tags(input: &[&str]) -> Vec<String> {
        input.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn include_filter_counts_against_prefilter_set() {
        let result = filter_sort_truncate(
            tags(&["v1.0.0", "v2.0.0", "v1.1.0"]),
            &TagsOptions {
                include: regexes(&[r"^v1\..*"]),
                ..Default::default()
            },
        );
        assert_eq!(result.list, tags(&["v1.0.0", "v1.1.0"]));
        assert_eq!(result.not_included_count, 1);
        assert_eq!(result.excluded_count, 0);
        assert_eq!(result.total_count, 3);
    }

    #[test]
    fn exclude_wins_over_include() {
        let result = filter_sort_truncate(
            tags(&["v1.0.0", "v1.1.0-rc.1", "v1.1.0"]),
            &TagsOptions {
                include: regexes(&[r"^v1\..*"]),
                exclude: regexes(&[r".*-rc\..*"]),
                ..Default::default()
            },
        );
        assert_eq!(result.list, tags(&["v1.0.0", "v1.1.0"]));
        assert_eq!(result.excluded_count, 1);
        assert_eq!(result.not_included_count, 0);
    }

    #[test]
    fn truncation_happens_after_filter_and_sort() {
        let result = filter_sort_truncate(
            tags(&["latest", "v1.2.0", "v1.10.0", "v2.0.0-beta.1"]),
            &TagsOptions {
                max: 2,
                sort: SortPolicy::Semver,
                exclude: regexes(&["^latest$"]),
                ..Default::default()
            },
        );
        assert_eq!(result.list, tags(&["v2.0.0-beta.1", "v1.10.0"]));
        assert_eq!(result.excluded_count, 1);
        assert_eq!(result.total_count, 4);
    }

    #[test]
    fn max_zero_means_unlimited() {
        let result = filter_sort_truncate(tags(&["a", "b", "c"]), &TagsOptions::default());
        assert_eq!(result.list.len(), 3);
    }

    #[test]
    fn single_tag_filtering() {
        let include = regexes(&[r"^v\d+$"]);
        let exclude = regexes(&["^v2$"]);
        assert!(keep_tag("v1", &include, &exclude));
        assert!(!keep_tag("v2", &include, &exclude));
        assert!(!keep_tag("latest", &include, &exclude));
        assert!(keep_tag("anything", &[], &[]));
    }

    #[test]
    fn next_link_parsing() {
        assert_eq!(
            parse_next_link("</v2/library/alpine/tags/list?last=3.9&n=1000>; rel=\"next\""),
            Some("/v2/library/alpine/tags/list?last=3.9&n=1000".to_string())
        );
        assert_eq!(parse_next_link("</other>; rel=\"prev\""), None);
    }

    #[test]
    fn next_link_survives_parameterless_parts() {
        // a bare part earlier in the header must not hide a later next link
        assert_eq!(
            parse_next_link("</bare>, </page2>; rel=\"next\""),
            Some("/page2".to_string())
        );
        assert_eq!(parse_next_link("</bare>"), None);
    }

    #[test(tokio::test)]
    async fn list_tags_follows_pagination() {
        let server = MockServer::start().await;

        Mock::given(method("GET"))
            .and(path("/v2/library/alpine/tags/list"))
            .and(query_param("last", "3.18"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_json(serde_json::json!({"name": "library/alpine", "tags": ["3.19", "latest"]})),
            )
            .mount(&server)
            .await;

        Mock::given(method("GET"))
            .and(path("/v2/library/alpine/tags/list"))
            .respond_with(
                ResponseTemplate::new(200)
                    .insert_header(
                        "link",
                        "</v2/library/alpine/tags/list?last=3.18&n=1000>; rel=\"next\"",
                    )
                    .set_body_json(serde_json::json!({"name": "library/alpine", "tags": ["3.17", "3.18"]})),
            )
            .mount(&server)
            .await;

        let client = Client::new(&RegistryOptions::default()).unwrap();
        let domain = server.uri().strip_prefix("http://").unwrap().to_string();
        let image = Image::parse(
            &format!("{domain}/library/alpine"),
            &ParseOptions::default(),
        )
        .unwrap();

        let result = client
            .list_tags(
                &image,
                &TagsOptions {
                    sort: SortPolicy::Lexicographical,
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        assert_eq!(result.list, tags(&["3.17", "3.18", "3.19", "latest"]));
        assert_eq!(result.total_count, 4);
    }
}
