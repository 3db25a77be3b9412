//! Discovery of the commands reachable from the executable search path.
//!
//! The catalog is deliberately lazy: [`CommandCatalog::entries`] yields one [`CommandEntry`] at a
//! time, listing a directory only when the previous one has been exhausted.  Callers that stop
//! early (see [`CommandCatalog::discover`]) never touch the remaining directories.
//!
//! Nothing is cached between calls; the search path is read fresh every time a catalog is built.
use crate::config::{DiscoveryConfig, MatchMode};
use regex::{Regex, RegexBuilder};
use serde::Serialize;
use std::collections::HashSet;
use std::ffi::OsString;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::*;

/// A command visible on the search path.  When the same name appears in multiple directories,
/// only the first one (in search order) is reported.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct CommandEntry {
    pub name: String,
    pub path: PathBuf,
}

/// Result of a single discovery call, as returned to the client
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct Discovery {
    pub commands: Vec<CommandEntry>,

    /// There were more matches than `max_results` allowed
    pub truncated: bool,

    pub search_paths: Vec<PathBuf>,
}

#[derive(Debug, Error)]
#[error("invalid pattern '{pattern}': {reason}")]
pub struct PatternError {
    pub pattern: String,
    pub reason: String,
}

/// Decides whether a command name matches the user-supplied pattern.
#[derive(Clone, Debug)]
pub enum PatternMatcher {
    /// The empty pattern, matches everything regardless of mode
    Any,
    Substring {
        needle: String,
        case_sensitive: bool,
    },
    Regex(Regex),
}

impl PatternMatcher {
    pub fn new(
        pattern: &str,
        mode: MatchMode,
        case_sensitive: bool,
    ) -> Result<Self, PatternError> {
        if pattern.is_empty() {
            return Ok(Self::Any);
        }

        let regex_source = match mode {
            MatchMode::Substring => {
                let needle = if case_sensitive {
                    pattern.to_string()
                } else {
                    pattern.to_lowercase()
                };
                return Ok(Self::Substring {
                    needle,
                    case_sensitive,
                });
            }
            MatchMode::Glob => glob_to_regex(pattern)?,
            MatchMode::Regex => pattern.to_string(),
        };

        RegexBuilder::new(&regex_source)
            .case_insensitive(!case_sensitive)
            .build()
            .map(Self::Regex)
            .map_err(|e| PatternError {
                pattern: pattern.to_string(),
                reason: e.to_string(),
            })
    }

    pub fn is_match(&self, name: &str) -> bool {
        match self {
            Self::Any => true,
            Self::Substring {
                needle,
                case_sensitive: true,
            } => name.contains(needle.as_str()),
            Self::Substring {
                needle,
                case_sensitive: false,
            } => name.to_lowercase().contains(needle.as_str()),
            Self::Regex(regex) => regex.is_match(name),
        }
    }
}

/// Translate a shell-style glob into an anchored regex.  Supports `*`, `?` and `[...]` classes
/// (with `!` or `^` for negation).
fn glob_to_regex(glob: &str) -> Result<String, PatternError> {
    let mut out = String::with_capacity(glob.len() * 2 + 2);
    out.push('^');

    let mut chars = glob.chars();
    while let Some(c) = chars.next() {
        match c {
            '*' => out.push_str(".*"),
            '?' => out.push('.'),
            '[' => {
                let mut class = String::new();
                let mut closed = false;
                for c in chars.by_ref() {
                    if c == ']' && !class.is_empty() {
                        closed = true;
                        break;
                    }
                    class.push(c);
                }
                if !closed {
                    return Err(PatternError {
                        pattern: glob.to_string(),
                        reason: "unterminated character class".to_string(),
                    });
                }

                out.push('[');
                let negated = class
                    .strip_prefix('!')
                    .or_else(|| class.strip_prefix('^'));
                let body = match negated {
                    Some(rest) => {
                        out.push('^');
                        rest
                    }
                    None => class.as_str(),
                };
                for c in body.chars() {
                    // Only ranges are meaningful inside a glob class
                    if c == '-' {
                        out.push(c);
                    } else {
                        out.push_str(&regex::escape(&c.to_string()));
                    }
                }
                out.push(']');
            }
            other => out.push_str(&regex::escape(&other.to_string())),
        }
    }

    out.push('$');
    Ok(out)
}

/// Snapshot of the executable search path, ready to be enumerated.
#[derive(Clone, Debug)]
pub struct CommandCatalog {
    search_paths: Vec<PathBuf>,
    include_hidden: bool,
}

impl CommandCatalog {
    /// Build a catalog over the host's `PATH` followed by the configured additional paths.
    pub fn from_env(config: &DiscoveryConfig) -> Self {
        Self::with_path_var(std::env::var_os("PATH"), config)
    }

    /// Build a catalog from an explicit `PATH`-style value instead of the process environment.
    pub fn with_path_var(path_var: Option<OsString>, config: &DiscoveryConfig) -> Self {
        let host_paths: Vec<PathBuf> = path_var
            .map(|value| std::env::split_paths(&value).collect())
            .unwrap_or_default();

        let mut seen = HashSet::new();
        let search_paths = host_paths
            .into_iter()
            .chain(config.additional_paths.iter().cloned())
            .filter(|dir| !dir.as_os_str().is_empty())
            .filter(|dir| !is_excluded(dir, &config.exclude_paths))
            .filter(|dir| seen.insert(dir.clone()))
            .collect();

        Self {
            search_paths,
            include_hidden: config.include_hidden,
        }
    }

    pub fn search_paths(&self) -> &[PathBuf] {
        &self.search_paths
    }

    /// Lazily enumerate every command on the search path, earlier directories shadowing later
    /// ones.
    pub fn entries(&self) -> Entries<'_> {
        Entries {
            dirs: self.search_paths.iter(),
            current: Vec::new().into_iter(),
            seen: HashSet::new(),
            include_hidden: self.include_hidden,
            dirs_listed: 0,
        }
    }

    /// Find up to `max_results` commands whose names match `matcher`.
    ///
    /// Stops scanning as soon as it knows whether there are more than `max_results` matches.
    #[instrument(skip(self, matcher), fields(search_paths = self.search_paths.len()))]
    pub fn discover(&self, matcher: &PatternMatcher, max_results: usize) -> Discovery {
        let mut entries = self.entries();
        let mut commands = first_matches(&mut entries, matcher, max_results);

        let truncated = commands.len() > max_results;
        commands.truncate(max_results);
        debug!(
            found = commands.len(),
            truncated,
            dirs_listed = entries.dirs_listed(),
            "Discovery complete"
        );

        Discovery {
            commands,
            truncated,
            search_paths: self.search_paths.clone(),
        }
    }
}

/// One more match than `max_results` if there are that many, so the caller can tell whether the
/// list was cut short.  Directories past the last one needed are never listed.
fn first_matches(
    entries: &mut Entries<'_>,
    matcher: &PatternMatcher,
    max_results: usize,
) -> Vec<CommandEntry> {
    entries
        .filter(|entry| matcher.is_match(&entry.name))
        .take(max_results.saturating_add(1))
        .collect()
}

fn is_excluded(dir: &Path, exclude_paths: &[PathBuf]) -> bool {
    exclude_paths.iter().any(|excluded| dir.starts_with(excluded))
}

/// Iterator returned by [`CommandCatalog::entries`]
pub struct Entries<'a> {
    dirs: std::slice::Iter<'a, PathBuf>,
    current: std::vec::IntoIter<CommandEntry>,
    seen: HashSet<String>,
    include_hidden: bool,
    dirs_listed: usize,
}

impl Entries<'_> {
    /// How many search path directories have been read so far
    pub fn dirs_listed(&self) -> usize {
        self.dirs_listed
    }
}

impl Iterator for Entries<'_> {
    type Item = CommandEntry;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            for entry in self.current.by_ref() {
                if self.seen.insert(entry.name.clone()) {
                    return Some(entry);
                }
            }

            let dir = self.dirs.next()?;
            self.current = list_directory(dir, self.include_hidden).into_iter();
            self.dirs_listed += 1;
        }
    }
}

/// List the executables directly inside `dir`, sorted by name.  Unreadable directories are
/// treated as empty.
fn list_directory(dir: &Path, include_hidden: bool) -> Vec<CommandEntry> {
    let read_dir = match std::fs::read_dir(dir) {
        Ok(read_dir) => read_dir,
        Err(e) => {
            debug!(dir = %dir.display(), error = %e, "Skipping unreadable search path directory");
            return Vec::new();
        }
    };

    let mut entries: Vec<CommandEntry> = read_dir
        .filter_map(|entry| entry.ok())
        .filter_map(|entry| {
            // Names that aren't valid UTF-8 can't be sent back over JSON anyway
            let name = entry.file_name().into_string().ok()?;
            if !include_hidden && name.starts_with('.') {
                return None;
            }

            let path = entry.path();
            is_executable(&path).then_some(CommandEntry { name, path })
        })
        .collect();

    entries.sort_by(|a, b| a.name.cmp(&b.name));
    trace!(dir = %dir.display(), count = entries.len(), "Listed search path directory");
    entries
}

/// Whether `path` looks runnable, going by file type and permission bits only.  Symlinks are
/// followed.
#[cfg(unix)]
fn is_executable(path: &Path) -> bool {
    use std::os::unix::fs::PermissionsExt;

    std::fs::metadata(path)
        .map(|meta| meta.is_file() && meta.permissions().mode() & 0o111 != 0)
        .unwrap_or(false)
}

#[cfg(not(unix))]
fn is_executable(path: &Path) -> bool {
    std::fs::metadata(path)
        .map(|meta| meta.is_file())
        .unwrap_or(false)
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use crate::test_helpers::{fake_executable, init_test_logging};
    use proptest::prelude::*;
    use tempfile::TempDir;

    fn path_var(dirs: &[&Path]) -> Option<OsString> {
        Some(std::env::join_paths(dirs).unwrap())
    }

    fn catalog(dirs: &[&Path]) -> CommandCatalog {
        CommandCatalog::with_path_var(path_var(dirs), &DiscoveryConfig::default())
    }

    fn names(discovery: &Discovery) -> Vec<&str> {
        discovery.commands.iter().map(|c| c.name.as_str()).collect()
    }

    fn substring(pattern: &str) -> PatternMatcher {
        PatternMatcher::new(pattern, MatchMode::Substring, true).unwrap()
    }

    #[test]
    fn lists_executables_in_path_order() {
        init_test_logging();
        let first = TempDir::new().unwrap();
        let second = TempDir::new().unwrap();
        fake_executable(first.path(), "zeta");
        fake_executable(first.path(), "alpha");
        fake_executable(second.path(), "beta");

        let found = catalog(&[first.path(), second.path()]).discover(&substring(""), 10);
        assert_eq!(names(&found), vec!["alpha", "zeta", "beta"]);
        assert!(!found.truncated);
        assert_eq!(
            found.search_paths,
            vec![first.path().to_path_buf(), second.path().to_path_buf()]
        );
    }

    #[test]
    fn earlier_directories_shadow_later_ones() {
        let first = TempDir::new().unwrap();
        let second = TempDir::new().unwrap();
        let winner = fake_executable(first.path(), "tool");
        fake_executable(second.path(), "tool");

        let found = catalog(&[first.path(), second.path()]).discover(&substring("tool"), 10);
        assert_eq!(found.commands.len(), 1);
        assert_eq!(found.commands[0].path, winner);
    }

    #[test]
    fn skips_non_executables_directories_and_hidden_files() {
        let dir = TempDir::new().unwrap();
        fake_executable(dir.path(), "runme");
        fake_executable(dir.path(), ".hidden");
        std::fs::write(dir.path().join("plain.txt"), "data").unwrap();
        std::fs::create_dir(dir.path().join("subdir")).unwrap();

        let found = catalog(&[dir.path()]).discover(&substring(""), 10);
        assert_eq!(names(&found), vec!["runme"]);

        let config = DiscoveryConfig {
            include_hidden: true,
            ..Default::default()
        };
        let found = CommandCatalog::with_path_var(path_var(&[dir.path()]), &config)
            .discover(&substring(""), 10);
        assert_eq!(names(&found), vec![".hidden", "runme"]);
    }

    #[test]
    fn missing_directories_are_ignored() {
        let dir = TempDir::new().unwrap();
        fake_executable(dir.path(), "present");
        let missing = dir.path().join("does-not-exist");

        let found = catalog(&[missing.as_path(), dir.path()]).discover(&substring(""), 10);
        assert_eq!(names(&found), vec!["present"]);
    }

    #[test]
    fn stops_at_max_results_and_reports_truncation() {
        let dir = TempDir::new().unwrap();
        for name in ["a1", "a2", "a3", "b1"] {
            fake_executable(dir.path(), name);
        }

        let catalog = catalog(&[dir.path()]);
        let found = catalog.discover(&substring("a"), 2);
        assert_eq!(names(&found), vec!["a1", "a2"]);
        assert!(found.truncated);

        let found = catalog.discover(&substring("a"), 3);
        assert_eq!(names(&found), vec!["a1", "a2", "a3"]);
        assert!(!found.truncated);
    }

    #[test]
    fn later_directories_are_not_listed_once_enough_matches_are_found() {
        let dirs: Vec<TempDir> = (0..3).map(|_| tempfile::tempdir().unwrap()).collect();
        fake_executable(dirs[0].path(), "zzmcpr-a1");
        fake_executable(dirs[0].path(), "zzmcpr-a2");
        fake_executable(dirs[1].path(), "zzmcpr-b1");
        fake_executable(dirs[2].path(), "zzmcpr-c1");
        let catalog = catalog(&[dirs[0].path(), dirs[1].path(), dirs[2].path()]);
        let matcher = substring("zzmcpr-");

        // One result plus the one that proves truncation, both in the first directory
        let mut entries = catalog.entries();
        let found = first_matches(&mut entries, &matcher, 1);
        assert_eq!(found.len(), 2);
        assert_eq!(entries.dirs_listed(), 1);

        // The third match lives in the second directory, so the last one is never read
        let mut entries = catalog.entries();
        let found = first_matches(&mut entries, &matcher, 2);
        assert_eq!(found[2].name, "zzmcpr-b1");
        assert_eq!(entries.dirs_listed(), 2);

        // Without enough matches every directory is read
        let mut entries = catalog.entries();
        assert_eq!(first_matches(&mut entries, &matcher, 10).len(), 4);
        assert_eq!(entries.dirs_listed(), 3);
    }

    #[test]
    fn no_match_is_empty_not_error() {
        let dir = TempDir::new().unwrap();
        fake_executable(dir.path(), "echo");
        let found = catalog(&[dir.path()]).discover(&substring("nothing-like-this"), 5);
        assert!(found.commands.is_empty());
        assert!(!found.truncated);
    }

    #[test]
    fn additional_and_excluded_paths() {
        let host = TempDir::new().unwrap();
        let extra = TempDir::new().unwrap();
        fake_executable(host.path(), "from-host");
        fake_executable(extra.path(), "from-extra");

        let config = DiscoveryConfig {
            additional_paths: vec![extra.path().to_path_buf()],
            ..Default::default()
        };
        let found = CommandCatalog::with_path_var(path_var(&[host.path()]), &config)
            .discover(&PatternMatcher::Any, 10);
        assert_eq!(names(&found), vec!["from-host", "from-extra"]);

        let config = DiscoveryConfig {
            additional_paths: vec![extra.path().to_path_buf()],
            exclude_paths: vec![host.path().to_path_buf()],
            ..Default::default()
        };
        let catalog = CommandCatalog::with_path_var(path_var(&[host.path()]), &config);
        assert_eq!(catalog.search_paths(), &[extra.path().to_path_buf()]);
    }

    #[test]
    fn duplicate_and_empty_path_entries_are_collapsed() {
        let dir = TempDir::new().unwrap();
        let value = format!("{}::{}", dir.path().display(), dir.path().display());
        let catalog = CommandCatalog::with_path_var(
            Some(OsString::from(value)),
            &DiscoveryConfig::default(),
        );
        assert_eq!(catalog.search_paths(), &[dir.path().to_path_buf()]);
    }

    #[test]
    fn substring_matching() {
        let sensitive = PatternMatcher::new("Git", MatchMode::Substring, true).unwrap();
        assert!(sensitive.is_match("myGit"));
        assert!(!sensitive.is_match("git"));

        let insensitive = PatternMatcher::new("Git", MatchMode::Substring, false).unwrap();
        assert!(insensitive.is_match("git-lfs"));
        assert!(insensitive.is_match("GIT"));
    }

    #[test]
    fn glob_matching() {
        let glob = PatternMatcher::new("git*", MatchMode::Glob, true).unwrap();
        assert!(glob.is_match("git"));
        assert!(glob.is_match("git-upload-pack"));
        assert!(!glob.is_match("legit"));

        let glob = PatternMatcher::new("py?hon[0-9]", MatchMode::Glob, true).unwrap();
        assert!(glob.is_match("python3"));
        assert!(!glob.is_match("python"));

        let glob = PatternMatcher::new("x[!a]", MatchMode::Glob, true).unwrap();
        assert!(glob.is_match("xb"));
        assert!(!glob.is_match("xa"));

        // Regex metacharacters are literal in a glob
        let glob = PatternMatcher::new("c++", MatchMode::Glob, true).unwrap();
        assert!(glob.is_match("c++"));
        assert!(!glob.is_match("cc"));

        assert!(PatternMatcher::new("bad[", MatchMode::Glob, true).is_err());
    }

    #[test]
    fn regex_matching() {
        let regex = PatternMatcher::new("^ls$|^cat$", MatchMode::Regex, true).unwrap();
        assert!(regex.is_match("ls"));
        assert!(regex.is_match("cat"));
        assert!(!regex.is_match("lsblk"));

        let err = PatternMatcher::new("(unclosed", MatchMode::Regex, true).unwrap_err();
        assert_eq!(err.pattern, "(unclosed");
    }

    #[test]
    fn empty_pattern_matches_everything_in_every_mode() {
        for mode in [MatchMode::Substring, MatchMode::Glob, MatchMode::Regex] {
            for case_sensitive in [true, false] {
                let matcher = PatternMatcher::new("", mode, case_sensitive).unwrap();
                assert!(matcher.is_match("anything"));
                assert!(matcher.is_match(".x"));
            }
        }
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(32))]

        #[test]
        fn never_returns_more_than_max_results(count in 0usize..12, max_results in 1usize..15) {
            let dir = TempDir::new().unwrap();
            for i in 0..count {
                fake_executable(dir.path(), &format!("cmd{i:02}"));
            }

            let found = catalog(&[dir.path()]).discover(&substring("cmd"), max_results);
            prop_assert!(found.commands.len() <= max_results);
            prop_assert_eq!(found.commands.len(), count.min(max_results));
            prop_assert_eq!(found.truncated, count > max_results);
        }

        #[test]
        fn empty_pattern_result_ignores_case_setting(count in 0usize..6) {
            let dir = TempDir::new().unwrap();
            for i in 0..count {
                fake_executable(dir.path(), &format!("Tool{i}"));
            }
            let catalog = catalog(&[dir.path()]);

            let sensitive = PatternMatcher::new("", MatchMode::Substring, true).unwrap();
            let insensitive = PatternMatcher::new("", MatchMode::Substring, false).unwrap();
            prop_assert_eq!(
                catalog.discover(&sensitive, 10),
                catalog.discover(&insensitive, 10)
            );
        }
    }
}
