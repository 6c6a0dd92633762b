//! File-name patterns for source listings.
//!
//! Patterns use shell wildcards where `*` may cross `/`. A pattern starting
//! with `/` is anchored at the source root; any other pattern matches the
//! relative path at the root or below any directory.

use regex::Regex;

use crate::error::ConfigError;

/// Include and ignore patterns of a source.
#[derive(Debug, Clone)]
pub struct FileFilter {
    files: Vec<Regex>,
    ignore: Vec<Regex>,
}

impl FileFilter {
    pub fn new(files: &[String], ignore: &[String]) -> Result<Self, ConfigError> {
        Ok(FileFilter {
            files: compile(files, "source.files")?,
            ignore: compile(ignore, "source.ignore")?,
        })
    }

    /// True if `rel_path` is wanted: it matches a file pattern and no ignore pattern.
    pub fn matches(&self, rel_path: &str) -> bool {
        let any = |patterns: &[Regex]| patterns.iter().any(|p| p.is_match(rel_path));
        any(&self.files) && !any(&self.ignore)
    }
}

fn compile(patterns: &[String], key: &str) -> Result<Vec<Regex>, ConfigError> {
    patterns
        .iter()
        .map(|p| p.trim())
        .filter(|p| !p.is_empty())
        .map(|raw| {
            let bad = |reason: String| {
                ConfigError::invalid(key, format!("bad pattern '{}': {}", raw, reason))
            };
            let source = match raw.strip_prefix('/') {
                Some(anchored) => format!("^{}$", translate(anchored).map_err(bad)?),
                None => format!("^(?:.*/)?{}$", translate(raw).map_err(bad)?),
            };
            Regex::new(&source).map_err(|e| bad(e.to_string()))
        })
        .collect()
}

/// Translate shell wildcards (`*`, `?`, `[...]`, `[!...]`) into regex syntax.
fn translate(pattern: &str) -> Result<String, String> {
    let mut out = String::with_capacity(pattern.len() * 2);
    let mut chars = pattern.chars().peekable();
    while let Some(c) = chars.next() {
        match c {
            '*' => out.push_str(".*"),
            '?' => out.push('.'),
            '[' => {
                let mut class = String::from("[");
                if matches!(chars.peek(), Some('!') | Some('^')) {
                    chars.next();
                    class.push('^');
                }
                // A leading ']' is literal
                if chars.peek() == Some(&']') {
                    chars.next();
                    class.push_str("\\]");
                }
                let mut closed = false;
                for c in chars.by_ref() {
                    match c {
                        ']' => {
                            closed = true;
                            break;
                        }
                        '\\' | '[' | '&' | '~' | '^' => {
                            class.push('\\');
                            class.push(c);
                        }
                        _ => class.push(c),
                    }
                }
                if !closed {
                    return Err("unclosed '['".to_string());
                }
                class.push(']');
                out.push_str(&class);
            }
            _ => out.push_str(&regex::escape(&c.to_string())),
        }
    }
    Ok(out)
}
