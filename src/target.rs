//! Scrape targets and the validated desired set the manager reconciles against.

use anyhow::{anyhow, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;

/// One node to poll, for one `(group, target)`.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Target {
    pub group: String,
    pub target: String,
    /// `host:port` or an `http(s)://` base URL of the sidecar.
    pub address: String,
}

impl Target {
    pub fn new(group: &str, target: &str, address: &str) -> Self {
        Self {
            group: group.to_string(),
            target: target.to_string(),
            address: address.to_string(),
        }
    }

    /// Base URL of the sidecar, without a trailing slash.
    pub fn base_url(&self) -> String {
        let a = self.address.trim_end_matches('/');
        if a.starts_with("http://") || a.starts_with("https://") {
            a.to_string()
        } else {
            format!("http://{}", a)
        }
    }

    fn check(&self) -> Result<()> {
        for (what, v) in [
            ("group", &self.group),
            ("target", &self.target),
            ("address", &self.address),
        ] {
            if v.trim().is_empty() {
                return Err(anyhow!("{} is empty", what));
            }
            if v.chars().any(char::is_whitespace) {
                return Err(anyhow!("{} '{}' contains whitespace", what, v));
            }
        }
        Ok(())
    }
}

impl fmt::Display for Target {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}@{}", self.group, self.target, self.address)
    }
}

/// An entry that did not make it into a [`TargetSet`], with the reason.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct Rejected {
    pub target: Target,
    pub reason: String,
}

/// Immutable, validated desired target set.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct TargetSet {
    targets: BTreeSet<Target>,
    rejected: Vec<Rejected>,
}

impl TargetSet {
    pub fn empty() -> Self {
        Self::default()
    }

    /// Build a set, skipping malformed and duplicate entries.
    ///
    /// Skipped entries are kept in [`TargetSet::rejected`] so callers can
    /// report them.
    pub fn from_targets<I: IntoIterator<Item = Target>>(targets: I) -> Self {
        let mut set = Self::default();
        for t in targets {
            if let Err(e) = t.check() {
                set.rejected.push(Rejected { target: t, reason: e.to_string() });
                continue;
            }
            if set.targets.contains(&t) {
                set.rejected.push(Rejected { target: t, reason: "duplicate target".to_string() });
                continue;
            }
            set.targets.insert(t);
        }
        set
    }

    /// Reload schema: a non-empty list with at least one acceptable entry.
    pub fn validate(targets: Vec<Target>) -> Result<Self> {
        if targets.is_empty() {
            return Err(anyhow!("target list is empty"));
        }
        let set = Self::from_targets(targets);
        if set.targets.is_empty() {
            let reasons: Vec<String> = set
                .rejected
                .iter()
                .map(|r| format!("{}: {}", r.target, r.reason))
                .collect();
            return Err(anyhow!("no valid targets ({})", reasons.join("; ")));
        }
        Ok(set)
    }

    pub fn contains(&self, t: &Target) -> bool {
        self.targets.contains(t)
    }

    pub fn iter(&self) -> impl Iterator<Item = &Target> {
        self.targets.iter()
    }

    pub fn rejected(&self) -> &[Rejected] {
        &self.rejected
    }

    pub fn len(&self) -> usize {
        self.targets.len()
    }

    pub fn is_empty(&self) -> bool {
        self.targets.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn base_url_forms() {
        assert_eq!(Target::new("g", "t", "10.0.0.1:13080").base_url(), "http://10.0.0.1:13080");
        assert_eq!(Target::new("g", "t", "https://node/").base_url(), "https://node");
    }

    #[test]
    fn duplicates_and_malformed_are_skipped() {
        let set = TargetSet::from_targets(vec![
            Target::new("g", "t", "a:1"),
            Target::new("g", "t", "a:1"),
            Target::new("g", "", "b:1"),
            Target::new("g", "t", "bad addr"),
            Target::new("g", "t", "b:1"),
        ]);
        assert_eq!(set.len(), 2);
        assert_eq!(set.rejected().len(), 3);
        assert_eq!(set.rejected()[0].reason, "duplicate target");
    }

    #[test]
    fn validate_rejects_empty_and_all_bad() {
        assert!(TargetSet::validate(Vec::new()).is_err());
        assert!(TargetSet::validate(vec![Target::new("", "t", "a:1")]).is_err());
        let ok = TargetSet::validate(vec![Target::new("g", "t", "a:1")]).unwrap();
        assert!(ok.contains(&Target::new("g", "t", "a:1")));
    }
}
