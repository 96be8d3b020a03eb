//! Revision parsing, ordering, and the revision tree.
//!
//! A revision is a `"<generation>-<hash>"` string. Histories travel between
//! instances as prefix-compressed chains (a start generation plus hash
//! suffixes, newest first). Two divergent writes are decided by the total
//! order on `(generation, hash)`, so both instances independently pick the
//! same winner.

use std::cmp::Ordering;
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// A parsed revision. Ordered by `(generation, hash)`.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Revision {
    pub generation: u64,
    pub hash: String,
}

impl Revision {
    /// Parse a `"<generation>-<hash>"` string.
    pub fn parse(rev: &str) -> Result<Self> {
        let (gen, hash) = rev
            .split_once('-')
            .ok_or_else(|| Error::MalformedRevision(rev.to_string()))?;
        let generation: u64 = gen
            .parse()
            .map_err(|_| Error::MalformedRevision(rev.to_string()))?;
        if generation == 0 || hash.is_empty() {
            return Err(Error::MalformedRevision(rev.to_string()));
        }
        Ok(Self {
            generation,
            hash: hash.to_string(),
        })
    }

    /// The revision a fresh write on top of this one gets.
    pub fn child(&self, hash: impl Into<String>) -> Self {
        Self {
            generation: self.generation + 1,
            hash: hash.into(),
        }
    }
}

impl fmt::Display for Revision {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{}", self.generation, self.hash)
    }
}

/// Compare two revision strings by `(generation, hash)`.
pub fn compare(a: &str, b: &str) -> Result<Ordering> {
    Ok(Revision::parse(a)?.cmp(&Revision::parse(b)?))
}

/// A prefix-compressed revision chain, newest first.
///
/// `start` is the generation of `ids[0]`; each following hash belongs to the
/// preceding generation. This is the shape revisions take on the wire.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct RevChain {
    pub start: u64,
    pub ids: Vec<String>,
}

impl RevChain {
    /// Chain holding a single revision.
    pub fn single(rev: &str) -> Result<Self> {
        let parsed = Revision::parse(rev)?;
        Ok(Self {
            start: parsed.generation,
            ids: vec![parsed.hash],
        })
    }

    /// Compress a list of full revision strings, newest first.
    ///
    /// The list is walked while generations stay contiguous; a gap ends the
    /// chain, since anything past it cannot be expressed by prefix
    /// compression.
    pub fn from_revisions(revs: &[String]) -> Result<Self> {
        let first = revs
            .first()
            .ok_or_else(|| Error::MalformedRevision("empty revision list".to_string()))?;
        let head = Revision::parse(first)?;
        let start = head.generation;
        let mut ids = vec![head.hash];
        for (i, rev) in revs.iter().enumerate().skip(1) {
            let parsed = Revision::parse(rev)?;
            if start < i as u64 || parsed.generation != start - i as u64 {
                break;
            }
            ids.push(parsed.hash);
        }
        Ok(Self { start, ids })
    }

    /// The newest revision of the chain.
    pub fn head(&self) -> Revision {
        Revision {
            generation: self.start,
            hash: self.ids[0].clone(),
        }
    }

    /// The newest revision as a `"<gen>-<hash>"` string.
    pub fn head_str(&self) -> String {
        format!("{}-{}", self.start, self.ids[0])
    }

    pub fn len(&self) -> usize {
        self.ids.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ids.is_empty()
    }

    /// Whether the chain knows the given revision.
    pub fn contains(&self, rev: &Revision) -> bool {
        if rev.generation > self.start {
            return false;
        }
        let offset = (self.start - rev.generation) as usize;
        match self.ids.get(offset) {
            Some(hash) => *hash == rev.hash,
            None => false,
        }
    }

    /// Full revision strings, oldest first.
    ///
    /// This is the order bulk updates are applied in, so ancestors always
    /// land before their descendants.
    pub fn ancestor_first(&self) -> Vec<String> {
        self.ids
            .iter()
            .enumerate()
            .map(|(i, hash)| format!("{}-{}", self.start - i as u64, hash))
            .rev()
            .collect()
    }

    /// Full revision strings, newest first.
    pub fn newest_first(&self) -> Vec<String> {
        self.ids
            .iter()
            .enumerate()
            .map(|(i, hash)| format!("{}-{}", self.start - i as u64, hash))
            .collect()
    }
}

/// Outcome of comparing an incoming chain against local history.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ConflictKind {
    /// Local is a strict ancestor of the remote head: fast-forward.
    NoConflict,
    /// The remote head is already part of local history, or lost the
    /// deterministic pick: discard the remote revision.
    LostConflict,
    /// Divergent histories and the remote head sorts higher: apply it and
    /// record the local head as the losing side.
    WonConflict,
}

/// Classify an incoming chain against the locally known one.
///
/// `local` is `None` for a document this instance has never seen.
pub fn classify(local: Option<&RevChain>, remote: &RevChain) -> Result<ConflictKind> {
    if remote.is_empty() {
        return Err(Error::MalformedRevision("empty revision chain".to_string()));
    }
    let local = match local {
        Some(chain) if !chain.is_empty() => chain,
        _ => return Ok(ConflictKind::NoConflict),
    };
    let local_head = local.head();
    let remote_head = remote.head();

    if local_head == remote_head {
        // Nothing new: applying the same update twice is a no-op.
        return Ok(ConflictKind::LostConflict);
    }
    if remote.contains(&local_head) {
        return Ok(ConflictKind::NoConflict);
    }
    if local.contains(&remote_head) {
        return Ok(ConflictKind::LostConflict);
    }
    match remote_head.cmp(&local_head) {
        Ordering::Greater => Ok(ConflictKind::WonConflict),
        _ => Ok(ConflictKind::LostConflict),
    }
}

/// The branching history of a single document.
///
/// Most documents have exactly one branch; a divergent write adds a second
/// one until the deterministic winner pick resolves it. The tree keeps the
/// losing heads around so nothing is silently discarded.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct RevTree {
    branches: Vec<RevChain>,
}

impl RevTree {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_chain(chain: RevChain) -> Self {
        Self {
            branches: vec![chain],
        }
    }

    /// Merge a chain into the tree.
    ///
    /// A chain that extends an existing branch replaces it; a chain already
    /// covered by one is dropped; anything else opens a new branch.
    pub fn add(&mut self, chain: RevChain) {
        if chain.is_empty() {
            return;
        }
        let head = chain.head();
        for branch in &mut self.branches {
            if chain.contains(&branch.head()) {
                *branch = chain;
                return;
            }
            if branch.contains(&head) {
                return;
            }
        }
        self.branches.push(chain);
    }

    /// The branch whose head wins the `(generation, hash)` pick.
    pub fn winning(&self) -> Option<&RevChain> {
        self.branches.iter().max_by_key(|chain| chain.head())
    }

    /// Heads of every losing branch.
    pub fn conflicts(&self) -> Vec<Revision> {
        let winner = match self.winning() {
            Some(chain) => chain.head(),
            None => return Vec::new(),
        };
        self.branches
            .iter()
            .map(|chain| chain.head())
            .filter(|head| *head != winner)
            .collect()
    }

    pub fn branch_count(&self) -> usize {
        self.branches.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn chain(revs: &[&str]) -> RevChain {
        let revs: Vec<String> = revs.iter().map(|r| r.to_string()).collect();
        RevChain::from_revisions(&revs).unwrap()
    }

    #[test]
    fn test_parse_and_order() {
        let a = Revision::parse("2-b1a").unwrap();
        let b = Revision::parse("2-ca2").unwrap();
        let c = Revision::parse("10-aaa").unwrap();
        assert!(b > a, "same generation falls back to hash order");
        assert!(c > b, "generation dominates hash");
        assert!(Revision::parse("nope").is_err());
        assert!(Revision::parse("0-x").is_err());
        assert!(Revision::parse("3-").is_err());
    }

    #[test]
    fn test_chain_compression() {
        let c = chain(&["3-ccc", "2-bbb", "1-aaa"]);
        assert_eq!(c.start, 3);
        assert_eq!(c.ids, vec!["ccc", "bbb", "aaa"]);
        assert_eq!(c.head_str(), "3-ccc");
        assert_eq!(c.ancestor_first(), vec!["1-aaa", "2-bbb", "3-ccc"]);
        assert_eq!(c.newest_first(), vec!["3-ccc", "2-bbb", "1-aaa"]);
    }

    #[test]
    fn test_chain_stops_at_gap() {
        // 1-aaa is not the parent generation of 3-ccc's chain once 2-* is
        // missing, so the compressed form ends before it.
        let revs = vec!["3-ccc".to_string(), "1-aaa".to_string()];
        let c = RevChain::from_revisions(&revs).unwrap();
        assert_eq!(c.ids, vec!["ccc"]);
    }

    #[test]
    fn test_chain_contains() {
        let c = chain(&["3-ccc", "2-bbb", "1-aaa"]);
        assert!(c.contains(&Revision::parse("2-bbb").unwrap()));
        assert!(!c.contains(&Revision::parse("2-xxx").unwrap()));
        assert!(!c.contains(&Revision::parse("4-ddd").unwrap()));
    }

    #[test]
    fn test_classify_fast_forward() {
        let local = chain(&["1-aaa"]);
        let remote = chain(&["2-bbb", "1-aaa"]);
        assert_eq!(
            classify(Some(&local), &remote).unwrap(),
            ConflictKind::NoConflict
        );
        assert_eq!(classify(None, &remote).unwrap(), ConflictKind::NoConflict);
    }

    #[test]
    fn test_classify_already_known() {
        let local = chain(&["2-bbb", "1-aaa"]);
        let remote = chain(&["2-bbb", "1-aaa"]);
        assert_eq!(
            classify(Some(&local), &remote).unwrap(),
            ConflictKind::LostConflict
        );
        let older = chain(&["1-aaa"]);
        assert_eq!(
            classify(Some(&local), &older).unwrap(),
            ConflictKind::LostConflict
        );
    }

    #[test]
    fn test_classify_divergent() {
        let local = chain(&["2-b1a", "1-aaa"]);
        let remote = chain(&["2-ca2", "1-aaa"]);
        assert_eq!(
            classify(Some(&local), &remote).unwrap(),
            ConflictKind::WonConflict
        );
        // The mirror image loses on the other instance.
        assert_eq!(
            classify(Some(&remote), &local).unwrap(),
            ConflictKind::LostConflict
        );
    }

    #[test]
    fn test_tree_fast_forward_replaces_branch() {
        let mut tree = RevTree::from_chain(chain(&["1-aaa"]));
        tree.add(chain(&["2-bbb", "1-aaa"]));
        assert_eq!(tree.branch_count(), 1);
        assert_eq!(tree.winning().unwrap().head_str(), "2-bbb");
        assert!(tree.conflicts().is_empty());
    }

    #[test]
    fn test_tree_divergence_and_winner() {
        let mut tree = RevTree::from_chain(chain(&["2-b1a", "1-aaa"]));
        tree.add(chain(&["2-ca2", "1-aaa"]));
        assert_eq!(tree.branch_count(), 2);
        assert_eq!(tree.winning().unwrap().head_str(), "2-ca2");
        let conflicts = tree.conflicts();
        assert_eq!(conflicts.len(), 1);
        assert_eq!(conflicts[0].to_string(), "2-b1a");
    }

    #[test]
    fn test_tree_ignores_covered_chain() {
        let mut tree = RevTree::from_chain(chain(&["2-bbb", "1-aaa"]));
        tree.add(chain(&["1-aaa"]));
        assert_eq!(tree.branch_count(), 1);
        assert_eq!(tree.winning().unwrap().head_str(), "2-bbb");
    }
}
