// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// https://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or https://opensource.org/licenses/MIT>, at your
// option. This file may not be copied, modified, or distributed
// except according to those terms.

//! Tag and repository selection.

use std::cmp::Reverse;

use super::types::TagFilter;
use crate::error::{Error, Result};

/// Apply a tag filter to the tags a repository actually has
pub fn resolve_tags(available: &[String], filter: &TagFilter) -> Result<Vec<String>> {
    match filter {
        TagFilter::All => Ok(available.to_vec()),
        TagFilter::Explicit(wanted) => Ok(available
            .iter()
            .filter(|tag| wanted.contains(tag))
            .cloned()
            .collect()),
        TagFilter::Pattern(pattern) => {
            let re = regex::Regex::new(pattern).map_err(|err| {
                Error::invalid_input(format!("invalid tag pattern {pattern:?}: {err}"))
            })?;
            Ok(available
                .iter()
                .filter(|tag| re.is_match(tag))
                .cloned()
                .collect())
        }
        TagFilter::Semver(constraint) => {
            let req = semver::VersionReq::parse(constraint).map_err(|err| {
                Error::invalid_input(format!(
                    "invalid semver constraint {constraint:?}: {err}"
                ))
            })?;
            Ok(available
                .iter()
                .filter(|tag| parse_version(tag).map(|v| req.matches(&v)).unwrap_or(false))
                .cloned()
                .collect())
        }
        TagFilter::LatestN(n) => {
            let mut tags = available.to_vec();
            // Semver-aware ordering; non-semver tags sort last,
            // lexicographically
            tags.sort_by_key(|tag| match parse_version(tag) {
                Some(v) => (Reverse(Some(v)), Reverse(tag.clone())),
                None => (Reverse(None), Reverse(tag.clone())),
            });
            tags.truncate(*n);
            Ok(tags)
        }
    }
}

/// Include/exclude filtering layered on top of a resolved tag set
pub fn apply_tag_lists(tags: Vec<String>, include: &[String], exclude: &[String]) -> Vec<String> {
    tags.into_iter()
        .filter(|tag| include.is_empty() || include.contains(tag))
        .filter(|tag| !exclude.contains(tag))
        .collect()
}

/// Drop repositories whose path (relative to the prefix) matches an
/// exclusion
pub fn apply_repo_excludes(repositories: Vec<String>, exclude: &[String]) -> Vec<String> {
    repositories
        .into_iter()
        .filter(|repo| {
            !exclude
                .iter()
                .any(|ex| repo == ex || repo.ends_with(&format!("/{ex}")))
        })
        .collect()
}

fn parse_version(tag: &str) -> Option<semver::Version> {
    semver::Version::parse(tag.trim_start_matches('v')).ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tags(list: &[&str]) -> Vec<String> {
        list.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_all_filter() {
        let available = tags(&["v1", "v2", "latest"]);
        assert_eq!(
            resolve_tags(&available, &TagFilter::All).unwrap(),
            available
        );
    }

    #[test]
    fn test_explicit_filter_intersects() {
        let available = tags(&["v1.0", "v1.1", "v2.0"]);
        let filter = TagFilter::Explicit(tags(&["v1.0", "v9.9"]));
        assert_eq!(resolve_tags(&available, &filter).unwrap(), tags(&["v1.0"]));
    }

    #[test]
    fn test_pattern_filter() {
        let available = tags(&["v1.0", "v1.1", "nightly-2024", "latest"]);
        let filter = TagFilter::Pattern(r"^v1\.".to_string());
        assert_eq!(
            resolve_tags(&available, &filter).unwrap(),
            tags(&["v1.0", "v1.1"])
        );

        assert!(resolve_tags(&available, &TagFilter::Pattern("[".into())).is_err());
    }

    #[test]
    fn test_semver_filter() {
        let available = tags(&["v1.0.0", "v1.5.0", "v2.0.0", "latest"]);
        let filter = TagFilter::Semver(">=1.5.0, <2.0.0".to_string());
        assert_eq!(
            resolve_tags(&available, &filter).unwrap(),
            tags(&["v1.5.0"])
        );
    }

    #[test]
    fn test_latest_n_prefers_semver_order() {
        let available = tags(&["v1.0.0", "v10.0.0", "v2.0.0", "nightly"]);
        let filter = TagFilter::LatestN(2);
        assert_eq!(
            resolve_tags(&available, &filter).unwrap(),
            tags(&["v10.0.0", "v2.0.0"])
        );
    }

    #[test]
    fn test_latest_n_larger_than_set() {
        let available = tags(&["v1.0.0"]);
        assert_eq!(
            resolve_tags(&available, &TagFilter::LatestN(5)).unwrap(),
            tags(&["v1.0.0"])
        );
    }

    #[test]
    fn test_include_exclude_layering() {
        let selected = apply_tag_lists(
            tags(&["v1", "v2", "v3", "debug"]),
            &tags(&["v1", "v2", "debug"]),
            &tags(&["debug"]),
        );
        assert_eq!(selected, tags(&["v1", "v2"]));
    }

    #[test]
    fn test_repo_excludes_match_suffix() {
        let repos = tags(&["prod/app", "prod/api", "prod/internal/tools"]);
        let kept = apply_repo_excludes(repos, &tags(&["api", "prod/internal/tools"]));
        assert_eq!(kept, tags(&["prod/app"]));
    }
}
