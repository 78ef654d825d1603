//! `.syncignore` — gitignore-style exclusion of files from sync
//!
//! Patterns come from `~/.syncignore` plus the `ignored_extensions`
//! config list, and are applied on the sender before anything is
//! announced or shipped inline. Blank lines and `#` comments are
//! skipped, `!` negates, a trailing `/` marks directory intent, and
//! globs support `*`, `?`, and `[...]` classes.

use std::path::{Path, PathBuf};
use tracing::{debug, info};

const DEFAULT_FILE: &str = "\
# yank ignore file
# Files matching these patterns are never synced.

# System files
.DS_Store
Thumbs.db
desktop.ini

# Temporary files
*.tmp
*.temp
*.bak
*.swp
*~

# Version control
.git/
.svn/
";

/// Loaded ignore patterns.
#[derive(Debug, Clone, Default)]
pub struct SyncIgnore {
    patterns: Vec<String>,
    negations: Vec<String>,
}

impl SyncIgnore {
    /// Default location: `~/.syncignore`.
    pub fn default_path() -> PathBuf {
        dirs::home_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join(".syncignore")
    }

    /// Load from `path`, writing a commented default file when absent.
    pub fn load(path: &Path) -> std::io::Result<Self> {
        if !path.exists() {
            std::fs::write(path, DEFAULT_FILE)?;
            info!(path = %path.display(), "created default .syncignore");
        }
        let raw = std::fs::read_to_string(path)?;
        Ok(Self::from_lines(raw.lines()))
    }

    pub fn from_lines<'a>(lines: impl IntoIterator<Item = &'a str>) -> Self {
        let mut ignore = Self::default();
        for line in lines {
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            if let Some(negated) = line.strip_prefix('!') {
                let negated = negated.trim();
                if !negated.is_empty() {
                    ignore.negations.push(negated.to_string());
                }
            } else {
                ignore.patterns.push(line.to_string());
            }
        }
        ignore
    }

    /// Append `*{ext}` patterns for the config's ignored extensions.
    pub fn with_extensions(mut self, extensions: &[String]) -> Self {
        for ext in extensions {
            let ext = ext.trim();
            if ext.is_empty() {
                continue;
            }
            let pattern = if ext.starts_with('.') {
                format!("*{ext}")
            } else {
                format!("*.{ext}")
            };
            self.patterns.push(pattern);
        }
        self
    }

    /// Whether `path` should be excluded from sync.
    pub fn is_ignored(&self, path: &Path) -> bool {
        let name = crate::clipboard::basename(path);

        // Negations override ignores.
        for pattern in &self.negations {
            if Self::matches(path, &name, pattern) {
                return false;
            }
        }
        for pattern in &self.patterns {
            if Self::matches(path, &name, pattern) {
                debug!(file = %name, pattern, "ignored by filter");
                return true;
            }
        }
        false
    }

    fn matches(path: &Path, name: &str, pattern: &str) -> bool {
        if let Some(dir_pattern) = pattern.strip_suffix('/') {
            // Directory intent: match any ancestor component.
            return path
                .parent()
                .map(|parent| {
                    parent
                        .components()
                        .any(|c| glob_match(dir_pattern, &c.as_os_str().to_string_lossy()))
                })
                .unwrap_or(false);
        }
        glob_match(pattern, name)
    }

    /// Drop ignored paths; an empty result means nothing is sent.
    pub fn filter(&self, paths: &[PathBuf]) -> Vec<PathBuf> {
        paths
            .iter()
            .filter(|p| !self.is_ignored(p))
            .cloned()
            .collect()
    }
}

/// fnmatch-style glob: `*` any run, `?` one char, `[...]` classes with
/// `!` negation and `a-z` ranges. Matches the whole of `text`.
pub fn glob_match(pattern: &str, text: &str) -> bool {
    let p: Vec<char> = pattern.chars().collect();
    let t: Vec<char> = text.chars().collect();

    let mut pi = 0;
    let mut ti = 0;
    let mut star: Option<usize> = None;
    let mut star_ti = 0;

    while ti < t.len() {
        if pi < p.len() {
            match p[pi] {
                '*' => {
                    star = Some(pi);
                    star_ti = ti;
                    pi += 1;
                    continue;
                }
                '?' => {
                    pi += 1;
                    ti += 1;
                    continue;
                }
                '[' => {
                    if let Some((matched, next_pi)) = match_class(&p, pi, t[ti]) {
                        if matched {
                            pi = next_pi;
                            ti += 1;
                            continue;
                        }
                    }
                }
                c => {
                    if c == t[ti] {
                        pi += 1;
                        ti += 1;
                        continue;
                    }
                }
            }
        }
        // Mismatch: backtrack to the last `*` if there is one.
        match star {
            Some(star_pi) => {
                pi = star_pi + 1;
                star_ti += 1;
                ti = star_ti;
            }
            None => return false,
        }
    }

    while pi < p.len() && p[pi] == '*' {
        pi += 1;
    }
    pi == p.len()
}

/// Try to match `c` against the class starting at `p[start] == '['`.
/// Returns `(matched, index past the closing bracket)`, or `None` when
/// the class is unterminated (treated as a literal mismatch).
fn match_class(p: &[char], start: usize, c: char) -> Option<(bool, usize)> {
    let mut i = start + 1;
    let negated = matches!(p.get(i), Some('!') | Some('^'));
    if negated {
        i += 1;
    }

    let mut matched = false;
    let mut first = true;
    while i < p.len() {
        if p[i] == ']' && !first {
            let result = if negated { !matched } else { matched };
            return Some((result, i + 1));
        }
        first = false;

        if i + 2 < p.len() && p[i + 1] == '-' && p[i + 2] != ']' {
            if p[i] <= c && c <= p[i + 2] {
                matched = true;
            }
            i += 3;
        } else {
            if p[i] == c {
                matched = true;
            }
            i += 1;
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn glob_basics() {
        assert!(glob_match("*.log", "foo.log"));
        assert!(!glob_match("*.log", "foo.log.txt"));
        assert!(glob_match("*", "anything"));
        assert!(glob_match("foo?", "food"));
        assert!(!glob_match("foo?", "foo"));
        assert!(glob_match("a*b*c", "aXXbYYc"));
        assert!(!glob_match("a*b*c", "aXXbYY"));
    }

    #[test]
    fn glob_classes() {
        assert!(glob_match("file[0-9].txt", "file7.txt"));
        assert!(!glob_match("file[0-9].txt", "filex.txt"));
        assert!(glob_match("file[!0-9].txt", "filex.txt"));
        assert!(glob_match("[abc]*", "banana"));
        // Unterminated class never matches.
        assert!(!glob_match("file[0-9", "file7"));
    }

    #[test]
    fn patterns_apply_to_basenames() {
        let ignore = SyncIgnore::from_lines(["*.log", "# comment", "", "secret.txt"]);
        assert!(ignore.is_ignored(Path::new("/var/tmp/foo.log")));
        assert!(!ignore.is_ignored(Path::new("/var/tmp/foo.log.txt")));
        assert!(ignore.is_ignored(Path::new("/home/user/secret.txt")));
        assert!(!ignore.is_ignored(Path::new("/home/user/public.txt")));
    }

    #[test]
    fn negation_overrides_ignore() {
        let ignore = SyncIgnore::from_lines(["*.log", "!keep.log"]);
        assert!(ignore.is_ignored(Path::new("/tmp/drop.log")));
        assert!(!ignore.is_ignored(Path::new("/tmp/keep.log")));
    }

    #[test]
    fn directory_patterns_match_ancestors() {
        let ignore = SyncIgnore::from_lines(["node_modules/"]);
        assert!(ignore.is_ignored(Path::new("/src/node_modules/pkg/index.js")));
        assert!(!ignore.is_ignored(Path::new("/src/lib/index.js")));
        // The pattern has directory intent, so a file named node_modules
        // is not matched.
        assert!(!ignore.is_ignored(Path::new("/src/node_modules")));
    }

    #[test]
    fn config_extensions_are_appended() {
        let ignore =
            SyncIgnore::from_lines([]).with_extensions(&[".iso".to_string(), "dmg".to_string()]);
        assert!(ignore.is_ignored(Path::new("/tmp/disk.iso")));
        assert!(ignore.is_ignored(Path::new("/tmp/installer.dmg")));
        assert!(!ignore.is_ignored(Path::new("/tmp/notes.txt")));
    }

    #[test]
    fn filter_drops_only_matches() {
        let ignore = SyncIgnore::from_lines(["*.tmp"]);
        let paths = vec![
            PathBuf::from("/a/keep.txt"),
            PathBuf::from("/a/drop.tmp"),
            PathBuf::from("/a/also.txt"),
        ];
        let kept = ignore.filter(&paths);
        assert_eq!(kept.len(), 2);
        assert!(kept.iter().all(|p| p.extension().unwrap() == "txt"));
    }

    #[test]
    fn default_file_is_created_and_parsed() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(".syncignore");
        let ignore = SyncIgnore::load(&path).unwrap();
        assert!(path.exists());
        assert!(ignore.is_ignored(Path::new("/x/.DS_Store")));
        assert!(ignore.is_ignored(Path::new("/x/scratch.tmp")));
    }
}
