// SPDX-License-Identifier: MIT
//! File-to-backend matching.
//!
//! A [`Matcher`] answers "does this backend claim this document?" from three
//! signals, checked in order: declared language id, file extension, then
//! glob patterns against the base filename and the full path. Empty
//! subfields never match — they are not wildcards.

use anyhow::{Context, Result};
use glob::Pattern;
use std::collections::HashSet;
use std::path::Path;

#[derive(Debug)]
pub struct Matcher {
    extensions: HashSet<String>,
    patterns: Vec<Pattern>,
    language_ids: HashSet<String>,
}

fn normalize_ext(ext: &str) -> String {
    let lower = ext.to_lowercase();
    if lower.starts_with('.') {
        lower
    } else {
        format!(".{lower}")
    }
}

impl Matcher {
    /// Compile a matcher. Glob compilation happens once, here; a bad
    /// pattern fails registration rather than being skipped at match time.
    pub fn new(extensions: &[String], patterns: &[String], language_ids: &[String]) -> Result<Self> {
        let mut compiled = Vec::with_capacity(patterns.len());
        for p in patterns {
            compiled.push(Pattern::new(p).with_context(|| format!("compiling pattern {p:?}"))?);
        }
        Ok(Self {
            extensions: extensions.iter().map(|e| normalize_ext(e)).collect(),
            patterns: compiled,
            language_ids: language_ids.iter().map(|l| l.to_lowercase()).collect(),
        })
    }

    pub fn matches_extension(&self, ext: &str) -> bool {
        !self.extensions.is_empty() && self.extensions.contains(&normalize_ext(ext))
    }

    pub fn matches_pattern(&self, path: &str) -> bool {
        if self.patterns.is_empty() {
            return false;
        }
        let filename = Path::new(path)
            .file_name()
            .map(|f| f.to_string_lossy().into_owned())
            .unwrap_or_default();
        self.patterns
            .iter()
            .any(|g| g.matches(&filename) || g.matches(path))
    }

    pub fn matches_language_id(&self, language_id: &str) -> bool {
        !self.language_ids.is_empty() && self.language_ids.contains(&language_id.to_lowercase())
    }

    pub fn matches(&self, path: &str, ext: &str, language_id: &str) -> bool {
        if !language_id.is_empty() && self.matches_language_id(language_id) {
            return true;
        }
        if !ext.is_empty() && self.matches_extension(ext) {
            return true;
        }
        if !path.is_empty() && self.matches_pattern(path) {
            return true;
        }
        false
    }
}

/// An ordered list of named matchers. The first registered backend whose
/// matcher accepts wins; insertion order is the tie-break.
#[derive(Debug, Default)]
pub struct MatcherSet {
    matchers: Vec<(String, Matcher)>,
}

impl MatcherSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(
        &mut self,
        name: &str,
        extensions: &[String],
        patterns: &[String],
        language_ids: &[String],
    ) -> Result<()> {
        let matcher = Matcher::new(extensions, patterns, language_ids)
            .with_context(|| format!("registering matcher for {name:?}"))?;
        self.matchers.push((name.to_string(), matcher));
        Ok(())
    }

    /// First matching backend name, or `None`.
    pub fn match_document(&self, path: &str, ext: &str, language_id: &str) -> Option<&str> {
        self.matchers
            .iter()
            .find(|(_, m)| m.matches(path, ext, language_id))
            .map(|(name, _)| name.as_str())
    }

    pub fn is_empty(&self) -> bool {
        self.matchers.is_empty()
    }
}

// ─── Tests ───────────────────────────────────────────────────────────────────
