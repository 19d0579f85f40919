//! SVN property synthesis from `.gitattributes` and `.gitignore`.
//!
//! Properties are never stored as such: for any `(revision, path)` they are
//! derived from the attribute files in effect along the path at that
//! revision. Later rules in a file override earlier ones, and deeper files
//! override shallower ones for their subtree.

use std::collections::BTreeMap;

use crate::filter::{FilterChain, FilterKind};

/// Property name to raw value. Values may be binary.
pub type PropertyMap = BTreeMap<String, Vec<u8>>;

/// Well-known property names.
pub mod props {
    pub const EOL_STYLE: &str = "svn:eol-style";
    pub const MIME_TYPE: &str = "svn:mime-type";
    pub const IGNORE: &str = "svn:ignore";
    pub const INHERITABLE_IGNORES: &str = "svn:global-ignores";
    pub const AUTO_PROPS: &str = "svn:auto-props";
    pub const NEEDS_LOCK: &str = "svn:needs-lock";
    pub const EXECUTABLE: &str = "svn:executable";
    pub const SPECIAL: &str = "svn:special";
    pub const MERGE_INFO: &str = "svn:mergeinfo";

    pub const ENTRY_COMMITTED_REV: &str = "svn:entry:committed-rev";
    pub const ENTRY_COMMITTED_DATE: &str = "svn:entry:committed-date";
    pub const ENTRY_LAST_AUTHOR: &str = "svn:entry:last-author";
    pub const ENTRY_UUID: &str = "svn:entry:uuid";

    pub const MIME_BINARY: &str = "application/octet-stream";

    /// Reserved namespace for properties that drive the server itself and
    /// never reach the wire.
    pub const INTERNAL_PREFIX: &str = "gitsvn:";
    pub const INTERNAL_FILTER: &str = "gitsvn:filter";

    pub fn is_internal(name: &str) -> bool {
        name.starts_with(INTERNAL_PREFIX)
    }

    pub fn is_entry_prop(name: &str) -> bool {
        name.starts_with("svn:entry:")
    }
}

/// How a single attribute is assigned by a matching rule.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum AttrState {
    Set,
    Unset,
    Value(String),
}

#[derive(Clone, Debug, PartialEq)]
struct AttrRule {
    pattern: GitPattern,
    attrs: Vec<(String, AttrState)>,
}

/// One parsed `.gitattributes` file.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct AttrRules {
    rules: Vec<AttrRule>,
}

impl AttrRules {
    pub fn parse(content: &[u8]) -> AttrRules {
        let text = String::from_utf8_lossy(content);
        let mut rules = Vec::new();
        for line in text.lines() {
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            let mut fields = line.split_whitespace();
            let Some(pattern) = fields.next() else { continue };
            let Some(pattern) = GitPattern::parse(pattern) else { continue };
            let attrs: Vec<(String, AttrState)> = fields
                .map(|field| {
                    if let Some(name) = field.strip_prefix('-') {
                        (name.to_string(), AttrState::Unset)
                    } else if let Some((name, value)) = field.split_once('=') {
                        (name.to_string(), AttrState::Value(value.to_string()))
                    } else {
                        (field.to_string(), AttrState::Set)
                    }
                })
                .collect();
            if !attrs.is_empty() {
                rules.push(AttrRule { pattern, attrs });
            }
        }
        AttrRules { rules }
    }

    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }

    /// Applies this file's rules to `rel` (path relative to the file's
    /// directory), merging into `out`.
    fn apply(&self, rel: &str, out: &mut BTreeMap<String, AttrState>) {
        for rule in &self.rules {
            if rule.pattern.matches(rel, false) {
                for (name, state) in &rule.attrs {
                    out.insert(name.clone(), state.clone());
                }
            }
        }
    }
}

/// The `.gitattributes` layers inherited along a path, shallowest first.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct PropertyStack {
    /// `(directory path, parsed rules)`; directory `/` for the root file.
    layers: Vec<(String, AttrRules)>,
}

impl PropertyStack {
    pub fn push(&mut self, dir: impl Into<String>, rules: AttrRules) {
        self.layers.push((dir.into(), rules));
    }

    /// Effective attribute assignments for an absolute file path.
    pub fn attributes_for(&self, path: &str) -> BTreeMap<String, AttrState> {
        let mut out = BTreeMap::new();
        for (dir, rules) in &self.layers {
            if let Some(rel) = relative_to(path, dir) {
                rules.apply(rel, &mut out);
            }
        }
        out
    }

    /// The content filter chain for a file path. Filters unknown to this
    /// server are ignored with a warning; declaring them is a repository
    /// configuration problem, not a per-request failure.
    pub fn filter_chain_for(&self, path: &str) -> FilterChain {
        match self.attributes_for(path).get("filter") {
            Some(AttrState::Value(name)) => match FilterKind::by_name(name) {
                Some(kind) => FilterChain::single(kind),
                None => {
                    tracing::warn!(filter = %name, path, "ignoring unknown content filter");
                    FilterChain::identity()
                }
            },
            _ => FilterChain::identity(),
        }
    }

    /// Synthesized regular properties for a file path.
    pub fn file_props(&self, path: &str) -> PropertyMap {
        let attrs = self.attributes_for(path);
        let mut out = PropertyMap::new();

        // The attribute files themselves are always native text.
        let basename = path.rsplit('/').next().unwrap_or(path);
        if basename == ".gitattributes" || basename == ".gitignore" {
            out.insert(props::EOL_STYLE.to_string(), b"native".to_vec());
            return out;
        }

        let text = attrs.get("text");
        let binary = matches!(attrs.get("binary"), Some(AttrState::Set))
            || matches!(text, Some(AttrState::Unset));
        if binary {
            out.insert(
                props::MIME_TYPE.to_string(),
                props::MIME_BINARY.as_bytes().to_vec(),
            );
        } else {
            let eol = match attrs.get("eol") {
                Some(AttrState::Value(v)) if v.eq_ignore_ascii_case("lf") => Some("LF"),
                Some(AttrState::Value(v)) if v.eq_ignore_ascii_case("crlf") => Some("CRLF"),
                Some(AttrState::Value(v)) if v.eq_ignore_ascii_case("cr") => Some("CR"),
                _ => match text {
                    Some(AttrState::Set) | Some(AttrState::Value(_)) => Some("native"),
                    _ => None,
                },
            };
            if let Some(eol) = eol {
                out.insert(props::EOL_STYLE.to_string(), eol.as_bytes().to_vec());
            }
        }

        if matches!(attrs.get("lockable"), Some(AttrState::Set)) {
            out.insert(props::NEEDS_LOCK.to_string(), b"*".to_vec());
        }

        if let Some(AttrState::Value(name)) = attrs.get("filter") {
            out.insert(
                props::INTERNAL_FILTER.to_string(),
                name.as_bytes().to_vec(),
            );
        }
        out
    }

    /// `svn:auto-props` content generated from simple extension patterns,
    /// surfaced on the root directory so clients pick sensible defaults.
    pub fn auto_props(&self) -> Option<Vec<u8>> {
        let mut lines = Vec::new();
        for (dir, rules) in &self.layers {
            if dir != "/" {
                continue;
            }
            for rule in &rules.rules {
                let Some(pattern) = rule.pattern.as_simple_glob() else {
                    continue;
                };
                let mut assignments = Vec::new();
                for (name, state) in &rule.attrs {
                    match (name.as_str(), state) {
                        ("binary", AttrState::Set) => {
                            assignments.push(format!("{}={}", props::MIME_TYPE, props::MIME_BINARY));
                        }
                        ("text", AttrState::Set) => {
                            assignments.push(format!("{}=native", props::EOL_STYLE));
                        }
                        ("eol", AttrState::Value(v)) => {
                            let style = match v.as_str() {
                                "lf" => "LF",
                                "crlf" => "CRLF",
                                _ => continue,
                            };
                            assignments.push(format!("{}={}", props::EOL_STYLE, style));
                        }
                        _ => {}
                    }
                }
                if !assignments.is_empty() {
                    lines.push(format!("{pattern} = {}", assignments.join(";")));
                }
            }
        }
        if lines.is_empty() {
            None
        } else {
            Some((lines.join("\n") + "\n").into_bytes())
        }
    }
}

/// Directory properties synthesized from a `.gitignore` file.
pub fn ignore_props(content: &[u8]) -> PropertyMap {
    let text = String::from_utf8_lossy(content);
    let mut local = Vec::new();
    let mut inherited = Vec::new();
    for line in text.lines() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') || line.starts_with('!') {
            continue;
        }
        if let Some(anchored) = line.strip_prefix('/') {
            if !anchored.contains('/') {
                local.push(anchored.to_string());
            }
        } else if !line.contains('/') {
            inherited.push(line.trim_end_matches('/').to_string());
        }
    }
    let mut out = PropertyMap::new();
    if !local.is_empty() {
        out.insert(
            props::IGNORE.to_string(),
            (local.join("\n") + "\n").into_bytes(),
        );
    }
    if !inherited.is_empty() {
        out.insert(
            props::INHERITABLE_IGNORES.to_string(),
            (inherited.join("\n") + "\n").into_bytes(),
        );
    }
    out
}

fn relative_to<'a>(path: &'a str, dir: &str) -> Option<&'a str> {
    if dir == "/" {
        return Some(path.trim_start_matches('/'));
    }
    path.strip_prefix(dir)
        .and_then(|rest| rest.strip_prefix('/'))
}

/// A gitignore-style match pattern.
#[derive(Clone, Debug, PartialEq)]
pub struct GitPattern {
    /// Anchored patterns match relative to the attribute file's directory;
    /// unanchored ones match the basename anywhere below it.
    anchored: bool,
    dir_only: bool,
    segments: Vec<String>,
    raw: String,
}

impl GitPattern {
    pub fn parse(raw: &str) -> Option<GitPattern> {
        let mut pattern = raw.trim();
        if pattern.is_empty() || pattern.starts_with('#') || pattern.starts_with('!') {
            return None;
        }
        let dir_only = pattern.ends_with('/');
        pattern = pattern.trim_end_matches('/');
        let anchored = pattern.starts_with('/') || pattern.contains('/');
        let pattern = pattern.trim_start_matches('/');
        let segments: Vec<String> = pattern.split('/').map(str::to_string).collect();
        if segments.is_empty() {
            return None;
        }
        Some(GitPattern {
            anchored,
            dir_only,
            segments,
            raw: raw.to_string(),
        })
    }

    /// Matches `rel`, a path relative to the pattern's directory.
    pub fn matches(&self, rel: &str, is_dir: bool) -> bool {
        if self.dir_only && !is_dir {
            return false;
        }
        let parts: Vec<&str> = rel.split('/').filter(|s| !s.is_empty()).collect();
        if parts.is_empty() {
            return false;
        }
        if !self.anchored {
            // Basename match anywhere below.
            let name = parts[parts.len() - 1];
            return glob_match(&self.segments[0], name);
        }
        match_segments(&self.segments, &parts)
    }

    /// `Some("*.ext")` for patterns usable in `svn:auto-props`.
    fn as_simple_glob(&self) -> Option<&str> {
        if !self.anchored && self.segments.len() == 1 && !self.dir_only {
            Some(&self.segments[0])
        } else {
            None
        }
    }

    pub fn raw(&self) -> &str {
        &self.raw
    }
}

fn match_segments(pattern: &[String], parts: &[&str]) -> bool {
    if pattern.is_empty() {
        return parts.is_empty();
    }
    if pattern[0] == "**" {
        // `**` swallows zero or more leading segments.
        (0..=parts.len()).any(|skip| match_segments(&pattern[1..], &parts[skip..]))
    } else if parts.is_empty() {
        false
    } else if glob_match(&pattern[0], parts[0]) {
        match_segments(&pattern[1..], &parts[1..])
    } else {
        false
    }
}

/// Single-segment glob: `*`, `?` and `[...]` classes.
fn glob_match(pattern: &str, text: &str) -> bool {
    let p: Vec<char> = pattern.chars().collect();
    let t: Vec<char> = text.chars().collect();
    glob_match_at(&p, 0, &t, 0)
}

fn glob_match_at(p: &[char], mut pi: usize, t: &[char], mut ti: usize) -> bool {
    while pi < p.len() {
        match p[pi] {
            '*' => {
                // Collapse runs of stars, then try every suffix.
                while pi < p.len() && p[pi] == '*' {
                    pi += 1;
                }
                if pi == p.len() {
                    return true;
                }
                return (ti..=t.len()).any(|next| glob_match_at(p, pi, t, next));
            }
            '?' => {
                if ti >= t.len() {
                    return false;
                }
                ti += 1;
                pi += 1;
            }
            '[' => {
                let Some(close) = p[pi + 1..].iter().position(|&c| c == ']') else {
                    return false;
                };
                let class = &p[pi + 1..pi + 1 + close];
                if ti >= t.len() || !char_class_matches(class, t[ti]) {
                    return false;
                }
                ti += 1;
                pi += close + 2;
            }
            ch => {
                if ti >= t.len() || t[ti] != ch {
                    return false;
                }
                ti += 1;
                pi += 1;
            }
        }
    }
    ti == t.len()
}

fn char_class_matches(class: &[char], ch: char) -> bool {
    let (negate, class) = match class.first() {
        Some('!') | Some('^') => (true, &class[1..]),
        _ => (false, class),
    };
    let mut matched = false;
    let mut i = 0;
    while i < class.len() {
        if i + 2 < class.len() && class[i + 1] == '-' {
            if class[i] <= ch && ch <= class[i + 2] {
                matched = true;
            }
            i += 3;
        } else {
            if class[i] == ch {
                matched = true;
            }
            i += 1;
        }
    }
    matched != negate
}

#[cfg(test)]
mod tests {
    use super::*;

    fn stack(layers: &[(&str, &str)]) -> PropertyStack {
        let mut stack = PropertyStack::default();
        for (dir, content) in layers {
            stack.push(dir.to_string(), AttrRules::parse(content.as_bytes()));
        }
        stack
    }

    #[test]
    fn filter_attribute_selects_chain() {
        let stack = stack(&[("/", "*.z\t\t\tfilter=gzip\n")]);
        assert_eq!(stack.filter_chain_for("/data.z").cache_key(), "gzip");
        assert!(stack.filter_chain_for("/data.x").is_identity());
        assert!(stack.filter_chain_for("/sub/data.x").is_identity());
        // Unanchored patterns apply below subdirectories too.
        assert_eq!(stack.filter_chain_for("/sub/data.z").cache_key(), "gzip");
    }

    #[test]
    fn unknown_filter_degrades_to_identity() {
        let stack = stack(&[("/", "*.q filter=frobnicate\n")]);
        assert!(stack.filter_chain_for("/a.q").is_identity());
    }

    #[test]
    fn eol_and_binary_properties() {
        let stack = stack(&[(
            "/",
            "*.txt text\n*.bin binary\n*.win eol=crlf\n*.nix text eol=lf\n",
        )]);
        assert_eq!(
            stack.file_props("/a.txt").get(props::EOL_STYLE).unwrap(),
            b"native"
        );
        assert_eq!(
            stack.file_props("/a.bin").get(props::MIME_TYPE).unwrap(),
            props::MIME_BINARY.as_bytes()
        );
        assert!(stack.file_props("/a.bin").get(props::EOL_STYLE).is_none());
        assert_eq!(
            stack.file_props("/a.win").get(props::EOL_STYLE).unwrap(),
            b"CRLF"
        );
        assert_eq!(
            stack.file_props("/a.nix").get(props::EOL_STYLE).unwrap(),
            b"LF"
        );
    }

    #[test]
    fn minus_text_means_binary() {
        let stack = stack(&[("/", "*.dat -text\n")]);
        let props_map = stack.file_props("/x.dat");
        assert_eq!(
            props_map.get(props::MIME_TYPE).unwrap(),
            props::MIME_BINARY.as_bytes()
        );
    }

    #[test]
    fn later_rules_and_deeper_files_override() {
        let stack = stack(&[
            ("/", "*.txt eol=lf\n*.txt eol=crlf\n"),
            ("/sub", "*.txt eol=lf\n"),
        ]);
        // Same file: the later rule wins.
        assert_eq!(
            stack.file_props("/a.txt").get(props::EOL_STYLE).unwrap(),
            b"CRLF"
        );
        // Deeper file: overrides for its subtree only.
        assert_eq!(
            stack.file_props("/sub/a.txt").get(props::EOL_STYLE).unwrap(),
            b"LF"
        );
    }

    #[test]
    fn anchored_patterns_do_not_cross_directories() {
        let stack = stack(&[("/", "/top/*.z filter=gzip\n")]);
        assert_eq!(stack.filter_chain_for("/top/a.z").cache_key(), "gzip");
        assert!(stack.filter_chain_for("/other/a.z").is_identity());
        assert!(stack.filter_chain_for("/top/deep/a.z").is_identity());
    }

    #[test]
    fn double_star_spans_directories() {
        let pattern = GitPattern::parse("docs/**/*.md").unwrap();
        assert!(pattern.matches("docs/a.md", false));
        assert!(pattern.matches("docs/x/y/a.md", false));
        assert!(!pattern.matches("src/a.md", false));
    }

    #[test]
    fn lockable_maps_to_needs_lock() {
        let stack = stack(&[("/", "*.psd lockable\n")]);
        assert_eq!(stack.file_props("/a.psd").get(props::NEEDS_LOCK).unwrap(), b"*");
    }

    #[test]
    fn gitignore_splits_local_and_inherited() {
        let map = ignore_props(b"# comment\n*.o\n/local.tmp\nbuild/\n!keep.o\n");
        assert_eq!(
            map.get(props::IGNORE).map(|v| v.as_slice()),
            Some(b"local.tmp\n".as_slice())
        );
        assert_eq!(
            map.get(props::INHERITABLE_IGNORES).map(|v| v.as_slice()),
            Some(b"*.o\nbuild\n".as_slice())
        );
    }

    #[test]
    fn auto_props_from_root_attributes() {
        let stack = stack(&[("/", "*.txt text\n*.png binary\nsub/*.raw binary\n")]);
        let auto = String::from_utf8(stack.auto_props().unwrap()).unwrap();
        assert!(auto.contains("*.txt = svn:eol-style=native"));
        assert!(auto.contains("*.png = svn:mime-type=application/octet-stream"));
        // Anchored patterns have no auto-props form.
        assert!(!auto.contains("raw"));
    }

    #[test]
    fn char_classes() {
        assert!(glob_match("file[0-9].txt", "file7.txt"));
        assert!(!glob_match("file[0-9].txt", "filex.txt"));
        assert!(glob_match("[!a]*", "bfoo"));
        assert!(!glob_match("[!a]*", "afoo"));
    }
}
