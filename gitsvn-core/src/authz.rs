//! Path-based authorization.
//!
//! The ACL oracle consulted once per command with
//! `(user, operation, path)`. The standard provider reads SVN-style authz
//! configuration files with `[groups]` and per-path sections; the most
//! specific matching section wins, and an explicit empty grant revokes
//! access inherited from shallower sections.

use std::collections::{HashMap, HashSet};
use std::path::Path;

use crate::paths;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum AccessLevel {
    None,
    Read,
    Write,
}

/// Operation classes checked against the ACL.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Operation {
    Read,
    Write,
    /// Lock administration (breaking other users' locks).
    Admin,
}

pub trait AuthzProvider: Send + Sync {
    /// Best access level for `user` (None = anonymous) at `path`.
    fn access_level(&self, user: Option<&str>, path: &str) -> AccessLevel;

    fn check(&self, user: Option<&str>, op: Operation, path: &str) -> bool {
        let level = self.access_level(user, path);
        match op {
            Operation::Read => level >= AccessLevel::Read,
            Operation::Write | Operation::Admin => level >= AccessLevel::Write,
        }
    }
}

/// Grants everyone read/write; the default when no authz file is
/// configured.
#[derive(Clone, Default)]
pub struct AllowAll;

impl AuthzProvider for AllowAll {
    fn access_level(&self, _user: Option<&str>, _path: &str) -> AccessLevel {
        AccessLevel::Write
    }
}

#[derive(Debug, Clone)]
struct Grant {
    /// `*` for everyone, `$anonymous`, `$authenticated`, `@group` or a
    /// user name.
    subject: String,
    level: AccessLevel,
}

/// SVN-style authz configuration.
///
/// ```text
/// [groups]
/// devs = alice, bob
///
/// [/]
/// * = r
/// @devs = rw
///
/// [/private]
/// * =
/// alice = rw
/// ```
#[derive(Clone, Default)]
pub struct SvnAuthz {
    groups: HashMap<String, HashSet<String>>,
    /// Path section -> grants, in file order.
    sections: HashMap<String, Vec<Grant>>,
}

impl SvnAuthz {
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, String> {
        let content = std::fs::read_to_string(path.as_ref())
            .map_err(|err| format!("failed to read authz file: {err}"))?;
        Self::from_content(&content)
    }

    pub fn from_content(content: &str) -> Result<Self, String> {
        let mut groups: HashMap<String, HashSet<String>> = HashMap::new();
        let mut sections: HashMap<String, Vec<Grant>> = HashMap::new();
        let mut current: Option<String> = None;

        for (line_no, raw) in content.lines().enumerate() {
            let line = raw.trim();
            if line.is_empty() || line.starts_with('#') || line.starts_with(';') {
                continue;
            }
            if let Some(section) = line.strip_prefix('[').and_then(|s| s.strip_suffix(']')) {
                current = Some(section.trim().to_string());
                continue;
            }
            let Some((key, value)) = line.split_once('=') else {
                return Err(format!("authz line {}: missing '='", line_no + 1));
            };
            let key = key.trim();
            let value = value.trim();
            match current.as_deref() {
                Some("groups") => {
                    let members: HashSet<String> = value
                        .split(',')
                        .map(|m| m.trim().to_string())
                        .filter(|m| !m.is_empty())
                        .collect();
                    groups.insert(key.to_string(), members);
                }
                Some(section) if section.starts_with('/') => {
                    let level = match value {
                        "" => AccessLevel::None,
                        "r" => AccessLevel::Read,
                        "rw" => AccessLevel::Write,
                        other => {
                            return Err(format!(
                                "authz line {}: invalid access '{other}'",
                                line_no + 1
                            ));
                        }
                    };
                    sections
                        .entry(paths::canonical(section))
                        .or_default()
                        .push(Grant {
                            subject: key.to_string(),
                            level,
                        });
                }
                Some(other) => {
                    return Err(format!("authz: unsupported section [{other}]"));
                }
                None => {
                    return Err(format!(
                        "authz line {}: entry outside any section",
                        line_no + 1
                    ));
                }
            }
        }
        Ok(Self { groups, sections })
    }

    fn subject_matches(&self, subject: &str, user: Option<&str>) -> bool {
        match subject {
            "*" => true,
            "$anonymous" => user.is_none(),
            "$authenticated" => user.is_some(),
            _ => {
                if let Some(group) = subject.strip_prefix('@') {
                    user.is_some_and(|u| {
                        self.groups.get(group).is_some_and(|members| members.contains(u))
                    })
                } else {
                    user == Some(subject)
                }
            }
        }
    }

    fn section_level(&self, section: &str, user: Option<&str>) -> Option<AccessLevel> {
        let grants = self.sections.get(section)?;
        let mut level = None;
        for grant in grants {
            if self.subject_matches(&grant.subject, user) {
                // Named/group grants shadow the wildcard within a section.
                let specific = grant.subject != "*";
                if specific || level.is_none() {
                    level = Some(grant.level);
                }
            }
        }
        level
    }
}

impl AuthzProvider for SvnAuthz {
    fn access_level(&self, user: Option<&str>, path: &str) -> AccessLevel {
        // Deepest matching section wins.
        let mut probe = Some(paths::canonical(path));
        while let Some(section) = probe {
            if let Some(level) = self.section_level(&section, user) {
                return level;
            }
            probe = paths::parent(&section).map(str::to_string);
        }
        AccessLevel::None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const CONF: &str = "
[groups]
devs = alice, bob
admins = carol

[/]
* = r
@admins = rw

[/trunk]
@devs = rw

[/private]
* =
carol = rw
";

    fn authz() -> SvnAuthz {
        SvnAuthz::from_content(CONF).unwrap()
    }

    #[test]
    fn wildcard_read_at_root() {
        let authz = authz();
        assert_eq!(authz.access_level(None, "/"), AccessLevel::Read);
        assert_eq!(authz.access_level(Some("dave"), "/README"), AccessLevel::Read);
        assert!(!authz.check(Some("dave"), Operation::Write, "/README"));
    }

    #[test]
    fn group_grant_on_subtree() {
        let authz = authz();
        assert!(authz.check(Some("alice"), Operation::Write, "/trunk/src/main.rs"));
        assert!(!authz.check(Some("alice"), Operation::Write, "/branches/x"));
        assert!(authz.check(Some("carol"), Operation::Write, "/branches/x"));
    }

    #[test]
    fn explicit_revocation() {
        let authz = authz();
        assert_eq!(authz.access_level(Some("alice"), "/private/x"), AccessLevel::None);
        assert_eq!(authz.access_level(None, "/private"), AccessLevel::None);
        assert!(authz.check(Some("carol"), Operation::Read, "/private/x"));
    }

    #[test]
    fn named_grant_shadows_wildcard() {
        let authz = SvnAuthz::from_content("[/]\n* = rw\nguest = r\n").unwrap();
        assert_eq!(authz.access_level(Some("guest"), "/"), AccessLevel::Read);
        assert_eq!(authz.access_level(Some("other"), "/"), AccessLevel::Write);
    }

    #[test]
    fn rejects_bad_config() {
        assert!(SvnAuthz::from_content("[/]\nuser = rwx\n").is_err());
        assert!(SvnAuthz::from_content("dangling = r\n").is_err());
        assert!(SvnAuthz::from_content("[weird]\na = r\n").is_err());
    }

    #[test]
    fn allow_all_default() {
        let authz = AllowAll;
        assert!(authz.check(None, Operation::Write, "/anything"));
    }
}
