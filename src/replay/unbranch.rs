//! Linearise-and-squash: flatten a history onto its first-parent chain,
//! folding side-branch subjects into the merge commit's message.

use std::collections::HashSet;
use std::collections::VecDeque;

use crate::errors::ZetaError;
use crate::hash::ObjectHash;
use crate::internal::object::commit::Commit;
use crate::internal::object::AnyObject;

use super::{reachable_from, ReplayStore, Rewriter};

/// Squash messages never exceed this; excess commits collapse into a
/// single notice line.
pub const MAX_SQUASH_MESSAGE: usize = 4 << 20;

impl<S: ReplayStore> Rewriter<'_, S> {
    /// Linearise `chain` (first-parent order, oldest first), keeping only
    /// the last `keep_last` commits when set. Returns the new tip.
    pub async fn unbranch(
        &self,
        chain: &[ObjectHash],
        keep_last: Option<usize>,
    ) -> Result<Option<ObjectHash>, ZetaError> {
        let chain = match keep_last {
            Some(k) if k < chain.len() => &chain[chain.len() - k..],
            _ => chain,
        };

        let mut tip = None;
        for &id in chain {
            let original = self.store.commit(id).await?;

            // First parent only; a parent outside the kept range is
            // omitted so the first kept commit becomes a root.
            let new_parents: Vec<ObjectHash> = original
                .parent_ids
                .first()
                .and_then(|p| self.mapped(*p))
                .into_iter()
                .collect();

            let message = if original.parent_ids.len() > 1 {
                self.squash_message(&original).await?
            } else {
                original.message.clone()
            };

            let new = Commit::with_extra_headers(
                self.store.hash_kind(),
                original.author.clone(),
                original.committer.clone(),
                original.tree_id,
                new_parents,
                original.extra_headers.clone(),
                message,
            )?;

            let new_id = if original.equal(&new) {
                id
            } else {
                self.store.write(&AnyObject::Commit(new.clone())).await?;
                new.id
            };
            self.record_commit(id, new_id);
            tip = Some(new_id);
        }
        Ok(tip)
    }

    /// The merge's own message followed by a `* <subject>` line per commit
    /// unique to its side branches. Merge commits on the side branch
    /// contribute no lines. Bounded at [`MAX_SQUASH_MESSAGE`].
    async fn squash_message(&self, merge: &Commit) -> Result<String, ZetaError> {
        let first_parent = merge.parent_ids[0];
        let mainline = reachable_from(self.store, first_parent).await?;

        // Side commits in breadth-first order from the second parent on:
        // newest first, which reads like a changelog.
        let mut side = Vec::new();
        let mut seen: HashSet<ObjectHash> = HashSet::new();
        let mut queue: VecDeque<ObjectHash> =
            merge.parent_ids.iter().skip(1).copied().collect();
        while let Some(id) = queue.pop_front() {
            if mainline.contains(&id) || !seen.insert(id) {
                continue;
            }
            let commit = self.store.commit(id).await?;
            for parent in &commit.parent_ids {
                queue.push_back(*parent);
            }
            if commit.parent_ids.len() <= 1 {
                side.push(commit);
            }
        }

        let mut message = merge.message.clone();
        if !message.ends_with('\n') {
            message.push('\n');
        }
        let mut ignored = 0usize;
        for (i, commit) in side.iter().enumerate() {
            let line = format!("* {}\n", commit.subject());
            if message.len() + line.len() > MAX_SQUASH_MESSAGE {
                ignored = side.len() - i;
                break;
            }
            message.push_str(&line);
        }
        if ignored > 0 {
            message.push_str(&format!(
                "{ignored} more commit(s) ignored to avoid oversized message\n"
            ));
        }
        Ok(message)
    }
}

#[cfg(test)]
mod tests {
    use super::super::first_parent_chain;
    use super::*;
    use crate::hash::HashKind;
    use crate::internal::object::signature::Signature;
    use crate::internal::object::tree::Tree;
    use crate::odb::testutil::MemorySource;

    const KIND: HashKind = HashKind::Sha1;

    fn sig(n: &str) -> Signature {
        Signature::new(n, format!("{n}@zeta.dev"), 1700000000)
    }

    struct Repo {
        store: MemorySource,
        root: ObjectHash,
    }

    impl Repo {
        fn new() -> Repo {
            let store = MemorySource::default();
            let root = store.insert(AnyObject::Tree(
                Tree::from_entries(KIND, vec![]).unwrap(),
            ));
            Repo { store, root }
        }

        fn commit(&self, parents: Vec<ObjectHash>, msg: &str) -> ObjectHash {
            let c = Commit::new(KIND, sig("a"), sig("c"), self.root, parents, msg).unwrap();
            self.store.insert(AnyObject::Commit(c))
        }
    }

    /// Scenario C: `M` merges `[A→B→C]` and `[D→E]`; the squashed merge's
    /// message lists the side-branch subjects newest-first, merges
    /// contribute no lines, and history is linear afterwards.
    #[tokio::test]
    async fn linearise_and_squash() {
        let repo = Repo::new();
        let a = repo.commit(vec![], "A subject\n");
        let b = repo.commit(vec![a], "B subject\n");
        let c = repo.commit(vec![b], "C subject\n");
        let d = repo.commit(vec![a], "D subject\n\nbody\n");
        let e = repo.commit(vec![d], "E subject\n");
        let m = repo.commit(vec![c, e], "Merge branch 'side'\n");

        let rewriter = Rewriter::new(&repo.store);
        let chain = first_parent_chain(&repo.store, m).await.unwrap();
        assert_eq!(chain, vec![a, b, c, m]);

        let tip = rewriter.unbranch(&chain, None).await.unwrap().unwrap();
        let squashed = repo.store.commit_of(tip);

        // Linear: single parent chain down to the root.
        assert_eq!(squashed.parent_ids.len(), 1);
        assert!(squashed.message.starts_with("Merge branch 'side'\n"));
        let lines: Vec<&str> = squashed.message.lines().collect();
        assert_eq!(lines[1], "* E subject");
        assert_eq!(lines[2], "* D subject");
        assert_eq!(lines.len(), 3, "mainline commits contribute no lines");

        // Non-merge ancestors with unchanged parents keep their ids.
        assert_eq!(rewriter.mapped(a), Some(a));
        assert_eq!(rewriter.mapped(b), Some(b));
        assert_eq!(rewriter.mapped(c), Some(c));
    }

    /// Dropping older history: only the last K commits survive, the first
    /// kept commit becomes a root.
    #[tokio::test]
    async fn keep_last_k() {
        let repo = Repo::new();
        let c1 = repo.commit(vec![], "1\n");
        let c2 = repo.commit(vec![c1], "2\n");
        let c3 = repo.commit(vec![c2], "3\n");

        let rewriter = Rewriter::new(&repo.store);
        let chain = first_parent_chain(&repo.store, c3).await.unwrap();
        let tip = rewriter.unbranch(&chain, Some(2)).await.unwrap().unwrap();

        let new_c3 = repo.store.commit_of(tip);
        assert_eq!(new_c3.message, "3\n");
        assert_eq!(new_c3.parent_ids.len(), 1);
        let new_c2 = repo.store.commit_of(new_c3.parent_ids[0]);
        assert_eq!(new_c2.message, "2\n");
        assert!(new_c2.parent_ids.is_empty(), "history truncates to a root");
        assert_eq!(rewriter.mapped(c1), None);
    }

    /// The 4 MiB cap replaces excess side commits with the notice line.
    #[tokio::test]
    async fn oversized_squash_notice() {
        let repo = Repo::new();
        let base = repo.commit(vec![], "base\n");
        // Side branch of commits with huge subjects.
        let big_subject = "s".repeat(1 << 20);
        let mut side = base;
        for i in 0..6 {
            side = repo.commit(vec![side], &format!("{i}-{big_subject}\n"));
        }
        let m = repo.commit(vec![base, side], "Merge big\n");

        let rewriter = Rewriter::new(&repo.store);
        let chain = first_parent_chain(&repo.store, m).await.unwrap();
        let tip = rewriter.unbranch(&chain, None).await.unwrap().unwrap();
        let squashed = repo.store.commit_of(tip);

        assert!(squashed.message.len() <= MAX_SQUASH_MESSAGE + 128);
        let last = squashed.message.lines().last().unwrap();
        assert!(
            last.ends_with("more commit(s) ignored to avoid oversized message"),
            "unexpected last line: {last}"
        );
    }

    /// An empty chain produces no tip.
    #[tokio::test]
    async fn empty_chain() {
        let repo = Repo::new();
        let rewriter = Rewriter::new(&repo.store);
        assert!(rewriter.unbranch(&[], None).await.unwrap().is_none());
    }
}
