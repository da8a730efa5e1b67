use regex::Regex;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::OnceLock;

/// What a peer link is resolved against: the branch name plus the secondary
/// identifier (issue number) extracted from it. A change in either one
/// invalidates any link found for the previous key.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub struct IdentityKey {
    pub branch: Option<String>,
    pub secondary_id: Option<String>,
}

impl IdentityKey {
    pub fn for_branch(branch: Option<&str>) -> Self {
        Self {
            branch: branch.map(str::to_string),
            secondary_id: branch.and_then(secondary_id_from_branch),
        }
    }

    /// Only resources on a named branch carrying a secondary id are worth a
    /// remote lookup.
    pub fn is_candidate(&self) -> bool {
        self.branch.is_some() && self.secondary_id.is_some()
    }
}

impl fmt::Display for IdentityKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let branch = self.branch.as_deref().unwrap_or("(detached)");
        match self.secondary_id.as_deref() {
            Some(id) => write!(f, "{branch}#{id}"),
            None => f.write_str(branch),
        }
    }
}

fn issue_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| {
        Regex::new(r"(?i)(?:^|[/_-])(?:issue-?|gh-?)?#?([0-9]+)(?:[-_/]|$)").expect("valid regex")
    })
}

/// Extracts the first standalone number segment of a branch name, e.g.
/// `feature/42-login` or `fix/#7`. Version-like fragments (`v2`, `1.4`) are
/// not treated as identifiers.
pub fn secondary_id_from_branch(branch: &str) -> Option<String> {
    issue_pattern()
        .captures(branch)
        .and_then(|captures| captures.get(1))
        .map(|m| m.as_str().trim_start_matches('0').to_string())
        .filter(|id| !id.is_empty())
}
