//! Release-group extraction from media file names.
//!
//! Extraction is strategy-ordered: hyphen suffix, then bracketed suffix, then
//! the last dot-delimited segment. A strategy only wins if the token it
//! extracts is one of the configured groups; otherwise the next one is tried.
use once_cell::sync::Lazy;
use regex::Regex;
use std::collections::HashMap;
use std::fmt;

// Always stripped. Other extension-shaped suffixes are stripped too, but the
// unstripped name is kept as a fallback in case the suffix was the group.
const MEDIA_EXTENSIONS: &[&str] = &[
    "mkv", "mp4", "avi", "m4v", "m2ts", "ts", "wmv", "mov", "webm", "mpg", "mpeg", "iso", "srt",
    "ass", "sub", "nfo",
];

// Token characters exclude whitespace, dots, brackets, parens and path separators.
// Internal hyphens are allowed so `-D-Z0N3` captures the whole group.
static HYPHEN_SUFFIX: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"-([^\s.\[\]()/\\-][^\s.\[\]()/\\]*)$").expect("valid regex"));
static BRACKET_SUFFIX: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\[\s*([^\[\]]+?)\s*\]\s*$").expect("valid regex"));
static DOT_SUFFIX: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\.([^.\s\[\]()/\\]+)$").expect("valid regex"));
static EXTENSION_LIKE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^[A-Za-z0-9]{1,5}$").expect("valid regex"));

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MatchStrategy {
    HyphenSuffix,
    Bracketed,
    DotSuffix,
}

impl fmt::Display for MatchStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            MatchStrategy::HyphenSuffix => "hyphen-suffix",
            MatchStrategy::Bracketed => "bracketed",
            MatchStrategy::DotSuffix => "dot-suffix",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReleaseGroupMatch {
    pub file_name: String,
    /// The configured spelling of the group, not the file's casing.
    pub group: String,
    pub strategy: MatchStrategy,
}

#[derive(Debug, Clone)]
pub struct ReleaseGroupMatcher {
    groups: Vec<String>,
    lookup: HashMap<String, usize>,
    case_insensitive: bool,
}

impl ReleaseGroupMatcher {
    pub fn new<I, S>(groups: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        Self::with_case_sensitivity(groups, true)
    }

    pub fn with_case_sensitivity<I, S>(groups: I, case_insensitive: bool) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut out = Self {
            groups: Vec::new(),
            lookup: HashMap::new(),
            case_insensitive,
        };
        for group in groups {
            let group = group.as_ref().trim();
            if group.is_empty() {
                continue;
            }
            let key = out.key(group);
            if out.lookup.contains_key(&key) {
                continue;
            }
            out.lookup.insert(key, out.groups.len());
            out.groups.push(group.to_string());
        }
        out
    }

    pub fn is_empty(&self) -> bool {
        self.groups.is_empty()
    }

    /// First configured group found in `file_name`, in strategy order.
    pub fn find(&self, file_name: &str) -> Option<ReleaseGroupMatch> {
        if self.groups.is_empty() {
            return None;
        }
        candidates(file_name)
            .into_iter()
            .find_map(|(strategy, token)| {
                self.lookup.get(&self.key(&token)).map(|&idx| ReleaseGroupMatch {
                    file_name: file_name.to_string(),
                    group: self.groups[idx].clone(),
                    strategy,
                })
            })
    }

    fn key(&self, token: &str) -> String {
        if self.case_insensitive {
            token.to_lowercase()
        } else {
            token.to_string()
        }
    }
}

/// One-shot form of [`ReleaseGroupMatcher::find`] returning only the group.
pub fn match_release_group(
    file_name: &str,
    target_groups: &[String],
    case_insensitive: bool,
) -> Option<String> {
    ReleaseGroupMatcher::with_case_sensitivity(target_groups, case_insensitive)
        .find(file_name)
        .map(|m| m.group)
}

/// Every token each strategy extracts from `file_name`, in evaluation order.
pub fn candidates(file_name: &str) -> Vec<(MatchStrategy, String)> {
    let (stem, fallback) = split_extension(file_name);
    let mut out = Vec::new();
    extract(stem, &mut out);
    if let Some(whole) = fallback {
        let mut more = Vec::new();
        extract(whole, &mut more);
        for candidate in more {
            if !out.contains(&candidate) {
                out.push(candidate);
            }
        }
    }
    out
}

fn extract(stem: &str, out: &mut Vec<(MatchStrategy, String)>) {
    if stem.is_empty() {
        return;
    }
    if let Some(token) = HYPHEN_SUFFIX.captures(stem).and_then(|c| c.get(1)) {
        // Longest first: `D-Z0N3`, then `Z0N3`.
        let token = token.as_str();
        out.push((MatchStrategy::HyphenSuffix, token.to_string()));
        for (idx, _) in token.match_indices('-') {
            let rest = &token[idx + 1..];
            if !rest.is_empty() {
                out.push((MatchStrategy::HyphenSuffix, rest.to_string()));
            }
        }
    }
    if let Some(token) = BRACKET_SUFFIX.captures(stem).and_then(|c| c.get(1)) {
        out.push((MatchStrategy::Bracketed, token.as_str().to_string()));
    }
    if let Some(token) = DOT_SUFFIX.captures(stem).and_then(|c| c.get(1)) {
        out.push((MatchStrategy::DotSuffix, token.as_str().to_string()));
    }
}

/// Base name without its extension, plus the unstripped base name when the
/// removed suffix is not a known media extension.
fn split_extension(file_name: &str) -> (&str, Option<&str>) {
    let base = file_name
        .rsplit(['/', '\\'])
        .next()
        .unwrap_or(file_name)
        .trim();
    match base.rsplit_once('.') {
        Some((stem, ext)) if MEDIA_EXTENSIONS.iter().any(|e| e.eq_ignore_ascii_case(ext)) => {
            (stem.trim_end(), None)
        }
        Some((stem, ext))
            if !stem.trim().is_empty()
                && EXTENSION_LIKE.is_match(ext)
                && ext.chars().any(|c| c.is_ascii_alphabetic()) =>
        {
            (stem.trim_end(), Some(base))
        }
        _ => (base, None),
    }
}
