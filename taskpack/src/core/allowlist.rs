//! Allowlist pattern matching for repository-relative paths.
//!
//! A pattern is one of:
//! - an exact path (`src/a.py`), which also covers everything below it when it
//!   names a directory,
//! - a directory prefix ending in `/` (`docs/`),
//! - a glob (`src/**/*.rs`), where `*` never crosses a `/`.

use globset::{GlobBuilder, GlobSet, GlobSetBuilder};

/// Compiled allowlist.
#[derive(Debug, Clone)]
pub struct Allowlist {
    patterns: Vec<String>,
    literals: Vec<String>,
    globs: GlobSet,
}

impl Allowlist {
    /// Compile patterns, reporting every invalid one.
    pub fn new(patterns: &[String]) -> Result<Self, Vec<String>> {
        let mut errors = Vec::new();
        let mut literals = Vec::new();
        let mut builder = GlobSetBuilder::new();
        for pattern in patterns {
            if let Err(err) = validate_pattern(pattern) {
                errors.push(err);
                continue;
            }
            let normalized = normalize(pattern);
            if is_glob(&normalized) {
                match GlobBuilder::new(&normalized).literal_separator(true).build() {
                    Ok(glob) => {
                        builder.add(glob);
                    }
                    Err(err) => errors.push(format!("invalid glob '{pattern}': {err}")),
                }
            } else {
                literals.push(normalized);
            }
        }
        if !errors.is_empty() {
            return Err(errors);
        }
        let globs = builder
            .build()
            .map_err(|err| vec![format!("compile allowlist: {err}")])?;
        Ok(Self {
            patterns: patterns.to_vec(),
            literals,
            globs,
        })
    }

    pub fn patterns(&self) -> &[String] {
        &self.patterns
    }

    pub fn matches(&self, path: &str) -> bool {
        let path = normalize(path);
        let literal_hit = self.literals.iter().any(|literal| {
            if let Some(dir) = literal.strip_suffix('/') {
                path.starts_with(literal) || path == dir
            } else {
                path == *literal || path.starts_with(&format!("{literal}/"))
            }
        });
        literal_hit || self.globs.is_match(&path)
    }

    /// Split paths into (allowed, disallowed), both sorted and deduplicated.
    pub fn partition<'a>(&self, paths: impl IntoIterator<Item = &'a str>) -> (Vec<String>, Vec<String>) {
        let mut allowed = Vec::new();
        let mut disallowed = Vec::new();
        for path in paths {
            if self.matches(path) {
                allowed.push(normalize(path));
            } else {
                disallowed.push(normalize(path));
            }
        }
        allowed.sort();
        allowed.dedup();
        disallowed.sort();
        disallowed.dedup();
        (allowed, disallowed)
    }
}

/// Check that a pattern is repository-relative and syntactically usable.
pub fn validate_pattern(pattern: &str) -> Result<(), String> {
    let trimmed = pattern.trim();
    if trimmed.is_empty() {
        return Err("allowlist pattern is empty".to_string());
    }
    if trimmed.starts_with('/') {
        return Err(format!("allowlist pattern '{pattern}' must be repository-relative"));
    }
    if trimmed.split('/').any(|part| part == "..") {
        return Err(format!("allowlist pattern '{pattern}' must not contain '..'"));
    }
    if is_glob(trimmed)
        && let Err(err) = GlobBuilder::new(trimmed).literal_separator(true).build()
    {
        return Err(format!("invalid glob '{pattern}': {err}"));
    }
    Ok(())
}

fn is_glob(pattern: &str) -> bool {
    pattern.contains(['*', '?', '[', '{'])
}

fn normalize(path: &str) -> String {
    let trimmed = path.trim();
    trimmed.strip_prefix("./").unwrap_or(trimmed).to_string()
}
