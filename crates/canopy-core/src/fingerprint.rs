use crate::ChangeSet;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fmt;

/// Order-independent digest of a change set's (path, status, insertions,
/// deletions) tuples. Mtimes are deliberately left out.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Fingerprint(String);

impl Fingerprint {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

pub fn fingerprint(changes: &ChangeSet) -> Fingerprint {
    let mut tuples: Vec<(&str, &str, Option<u32>, Option<u32>)> = changes
        .files
        .iter()
        .map(|file| {
            (
                file.path.as_str(),
                file.status.as_str(),
                file.insertions,
                file.deletions,
            )
        })
        .collect();
    tuples.sort();

    let mut hasher = Sha256::new();
    for (path, status, insertions, deletions) in tuples {
        hasher.update(path.as_bytes());
        hasher.update(b"\0");
        hasher.update(status.as_bytes());
        hasher.update(b"\0");
        hasher.update(stat_token(insertions).as_bytes());
        hasher.update(b"\0");
        hasher.update(stat_token(deletions).as_bytes());
        hasher.update(b"\n");
    }
    let digest = hasher.finalize();
    let mut output = String::with_capacity(digest.len() * 2);
    for byte in digest {
        output.push_str(&format!("{byte:02x}"));
    }
    Fingerprint(output)
}

fn stat_token(value: Option<u32>) -> String {
    match value {
        Some(value) => value.to_string(),
        None => "-".to_string(),
    }
}
