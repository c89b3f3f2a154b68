//! File Resolver (C2): glob expansion, bespoke ignore semantics,
//! deterministic ordering (spec.md §4.2).
//!
//! Grounded on the teacher's `glob` and `regex` dependencies (already
//! in `[workspace.dependencies]`); the teacher's own `cuenv-ignore`
//! crate solves a different problem (emitting `.gitignore` files) and
//! is not reused here.

use std::path::Path;

use regex::Regex;

use crate::error::{Error, Result};
use crate::types::RelativePath;

/// A single compiled ignore rule, per spec.md §4.2's four cases.
enum IgnorePattern {
    /// `foo` and `foo/` both match `foo` and anything under `foo/`;
    /// this also covers plain exact-match patterns, since a `foo`
    /// with no nested content still matches candidate `foo` itself.
    DirPrefix(String),
    /// `**/X`: substring / suffix match on `X`.
    SuffixGlob(String),
    /// Any other glob, translated to an anchored regex.
    General(Regex),
}

impl IgnorePattern {
    fn compile(raw: &str) -> Self {
        if let Some(suffix) = raw.strip_prefix("**/") {
            return Self::SuffixGlob(suffix.to_string());
        }
        let trimmed = raw.trim_end_matches('/');
        if !trimmed.contains(['*', '?', '[']) {
            return Self::DirPrefix(trimmed.to_string());
        }
        Self::General(glob_to_anchored_regex(raw))
    }

    fn matches(&self, candidate: &str) -> bool {
        match self {
            Self::DirPrefix(prefix) => {
                candidate == prefix || candidate.starts_with(&format!("{prefix}/"))
            }
            Self::SuffixGlob(suffix) => {
                candidate == suffix || candidate.ends_with(&format!("/{suffix}"))
            }
            Self::General(regex) => regex.is_match(candidate),
        }
    }
}

fn glob_to_anchored_regex(pattern: &str) -> Regex {
    let mut out = String::from("^");
    let mut chars = pattern.chars().peekable();
    while let Some(c) = chars.next() {
        match c {
            '*' => {
                if chars.peek() == Some(&'*') {
                    chars.next();
                    out.push_str(".*");
                } else {
                    out.push_str("[^/]*");
                }
            }
            '?' => out.push_str("[^/]"),
            '.' | '+' | '(' | ')' | '|' | '^' | '$' | '\\' | '{' | '}' => {
                out.push('\\');
                out.push(c);
            }
            other => out.push(other),
        }
    }
    out.push('$');
    Regex::new(&out).unwrap_or_else(|_| Regex::new("$^").expect("trivially valid regex"))
}

fn is_ignored(candidate: &str, patterns: &[IgnorePattern]) -> bool {
    patterns.iter().any(|p| p.matches(candidate))
}

/// Build a reusable ignore-matching closure from a set of pattern
/// strings, using the same bespoke semantics as `resolve`. Shared by
/// the Artifact Codec's per-entry `ignore_filter` callers (spec.md
/// §4.3) so pack/unpack honor the same rules as watcher file
/// resolution.
#[must_use]
pub fn build_ignore_matcher(patterns: &[String]) -> Box<dyn Fn(&Path) -> bool + Send + Sync> {
    let compiled: Vec<IgnorePattern> = patterns.iter().map(|s| IgnorePattern::compile(s)).collect();
    Box::new(move |path: &Path| is_ignored(&path.to_string_lossy(), &compiled))
}

/// Expand `globs` relative to `project_root`, filter to regular files
/// (or also directories when `include_directories` is set), apply
/// `ignores`, and return paths relative to `project_root` in
/// lexicographic order.
///
/// `preserve_nonexistent` keeps literal non-glob paths that do not yet
/// exist on disk, so the dependency-layering plugin can still see
/// edges to artifacts that haven't been built yet.
pub fn resolve(
    project_root: &Path,
    globs: &[String],
    ignores: &[String],
    preserve_nonexistent: bool,
    include_directories: bool,
) -> Result<Vec<RelativePath>> {
    let ignore_patterns: Vec<IgnorePattern> = ignores.iter().map(|s| IgnorePattern::compile(s)).collect();
    let mut results: Vec<RelativePath> = Vec::new();
    let mut seen = std::collections::HashSet::new();

    for pattern in globs {
        let is_literal = !pattern.contains(['*', '?', '[']);
        if is_literal {
            let candidate_path = project_root.join(pattern);
            let exists = candidate_path.exists();
            if !exists && !preserve_nonexistent {
                continue;
            }
            push_candidate(
                project_root,
                &candidate_path,
                pattern,
                exists,
                include_directories,
                &ignore_patterns,
                &mut results,
                &mut seen,
            )?;
            continue;
        }

        let absolute_pattern = project_root.join(pattern);
        let pattern_str = absolute_pattern.to_string_lossy().into_owned();
        let entries = glob::glob(&pattern_str)
            .map_err(|e| Error::config_invalid(format!("invalid glob pattern '{pattern}': {e}")))?;
        for entry in entries {
            let path = entry.map_err(|e| Error::io(e.into_error(), None, "glob expansion"))?;
            let relative_str = path
                .strip_prefix(project_root)
                .unwrap_or(&path)
                .to_string_lossy()
                .into_owned();
            push_candidate(
                project_root,
                &path,
                &relative_str,
                true,
                include_directories,
                &ignore_patterns,
                &mut results,
                &mut seen,
            )?;
        }
    }

    results.sort_by(|a, b| a.to_string_lossy().cmp(&b.to_string_lossy()));
    Ok(results)
}

#[allow(clippy::too_many_arguments)]
fn push_candidate(
    project_root: &Path,
    absolute: &Path,
    relative_str: &str,
    exists: bool,
    include_directories: bool,
    ignore_patterns: &[IgnorePattern],
    results: &mut Vec<RelativePath>,
    seen: &mut std::collections::HashSet<String>,
) -> Result<()> {
    if is_ignored(relative_str, ignore_patterns) {
        return Ok(());
    }
    if exists && absolute.is_dir() && !include_directories {
        return Ok(());
    }
    if !seen.insert(relative_str.to_string()) {
        return Ok(());
    }
    let relative = absolute
        .strip_prefix(project_root)
        .map(|p| p.to_path_buf())
        .unwrap_or_else(|_| absolute.to_path_buf());
    results.push(RelativePath::new(relative)?);
    Ok(())
}

/// Whether `relative` (a project-root-relative path string) matches any
/// of `patterns`, using the same compiled-glob semantics as ignore
/// matching. Used by the Daemon/Watcher (C10) to decide whether a raw
/// filesystem event falls inside a Watcher's declared `files` globs.
#[must_use]
pub fn path_matches_any(relative: &str, patterns: &[String]) -> bool {
    let compiled: Vec<IgnorePattern> = patterns.iter().map(|s| IgnorePattern::compile(s)).collect();
    is_ignored(relative, &compiled)
}
