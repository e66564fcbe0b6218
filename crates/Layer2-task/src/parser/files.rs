//! File-creation hints
//!
//! Attachment-style hints carry a full path and are read directly. Generic
//! hints only carry a file name, which must look like `stem.ext`; anything
//! else is reported as ambiguous instead of guessed at.

use regex::Regex;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::OnceLock;
use tracing::warn;

/// How the worker announced the file
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HintStyle {
    /// Full filesystem path
    Attachment,
    /// File name only
    Generic,
}

/// A file the worker claims to have written
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FileHint {
    pub file_name: String,
    /// Set for attachment-style hints
    pub path: Option<PathBuf>,
    pub style: HintStyle,
}

/// Result of matching one line
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HintMatch {
    Hint(FileHint),
    /// Matched a phrasing but the name is not a plain `stem.ext`
    Ambiguous { candidate: String },
}

struct HintPattern {
    style: HintStyle,
    regex: Regex,
}

fn patterns() -> &'static [HintPattern] {
    static PATTERNS: OnceLock<Vec<HintPattern>> = OnceLock::new();
    PATTERNS.get_or_init(|| {
        let table: [(HintStyle, &str); 6] = [
            (
                HintStyle::Attachment,
                r"📎\s*(?:Attach(?:ed|ing) file|Attachment):\s*(?P<target>.+?)\s*$",
            ),
            (
                HintStyle::Generic,
                r"💾\s*Data written to file\s+(?P<target>\S+)",
            ),
            (HintStyle::Generic, r"\bWrote (?:to )?file\s+(?P<target>\S+)"),
            (
                HintStyle::Generic,
                r"\bFile (?:created|saved):\s*(?P<target>\S+)",
            ),
            (HintStyle::Generic, r"\bSaved (?:to|as)\s+(?P<target>\S+)"),
            (
                HintStyle::Generic,
                r"(?i)\bsuccessfully (?:wrote|saved) (?:to )?file\s+(?P<target>\S+)",
            ),
        ];
        table
            .into_iter()
            .filter_map(|(style, pattern)| match Regex::new(pattern) {
                Ok(regex) => Some(HintPattern { style, regex }),
                Err(e) => {
                    warn!("Invalid file hint pattern {}: {}", pattern, e);
                    None
                }
            })
            .collect()
    })
}

fn clean_target(target: &str) -> &str {
    target.trim().trim_matches(|c: char| {
        matches!(c, '\'' | '"' | '`' | ',' | ';' | ':' | ')' | '(' | '[' | ']')
    })
    .trim_end_matches('.')
}

/// True for `stem.ext` without any path separator
pub fn is_plain_file_name(name: &str) -> bool {
    if name.is_empty() || name.contains('/') || name.contains('\\') {
        return false;
    }
    match name.rsplit_once('.') {
        Some((stem, ext)) => {
            !stem.is_empty()
                && !ext.is_empty()
                && ext.len() <= 10
                && ext.chars().all(|c| c.is_ascii_alphanumeric())
        }
        None => false,
    }
}

/// Match a line against the hint phrasings
pub fn detect(line: &str) -> Option<HintMatch> {
    for pattern in patterns() {
        let Some(caps) = pattern.regex.captures(line) else {
            continue;
        };
        let target = clean_target(&caps["target"]);
        if target.is_empty() {
            continue;
        }

        return Some(match pattern.style {
            HintStyle::Attachment => {
                let path = PathBuf::from(target);
                match Path::new(target).file_name().and_then(|n| n.to_str()) {
                    Some(name) if !name.is_empty() => HintMatch::Hint(FileHint {
                        file_name: name.to_string(),
                        path: Some(path),
                        style: HintStyle::Attachment,
                    }),
                    _ => HintMatch::Ambiguous {
                        candidate: target.to_string(),
                    },
                }
            }
            HintStyle::Generic if is_plain_file_name(target) => HintMatch::Hint(FileHint {
                file_name: target.to_string(),
                path: None,
                style: HintStyle::Generic,
            }),
            HintStyle::Generic => HintMatch::Ambiguous {
                candidate: target.to_string(),
            },
        });
    }
    None
}
