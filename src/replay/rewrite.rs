//! Tree and commit rewriting: the Drop pass and the HEAD-only graft.

use crate::errors::ZetaError;
use crate::hash::ObjectHash;
use crate::internal::object::commit::Commit;
use crate::internal::object::tree::Tree;
use crate::internal::object::AnyObject;

use super::matcher::DropMatcher;
use super::{ReplayStore, Rewriter};

fn entry_sig(abs_path: &str, id: &ObjectHash) -> String {
    format!("{abs_path}:{id}")
}

impl<S: ReplayStore> Rewriter<'_, S> {
    /// Rewrite one tree, dropping matched entries. Returns the original
    /// tree id unchanged when nothing below it changed (stable-hash
    /// short-circuit), so untouched subtrees keep their ids across the
    /// whole history.
    pub async fn rewrite_tree(
        &self,
        matcher: &dyn DropMatcher,
        commit_id: ObjectHash,
        tree_id: ObjectHash,
        parent_path: &str,
    ) -> Result<ObjectHash, ZetaError> {
        let tree = self.store.tree(tree_id).await?;
        let mut rewritten = Vec::with_capacity(tree.entries.len());

        for entry in &tree.entries {
            let abs_path = if parent_path.is_empty() {
                entry.name.clone()
            } else {
                format!("{parent_path}/{}", entry.name)
            };

            if matcher.matches(entry, &abs_path) {
                tracing::debug!(commit = %commit_id, path = %abs_path, "dropping entry");
                continue;
            }

            if !entry.mode.is_subtree() {
                // Blobs, symlinks, fragments and submodule pointers keep
                // their target as-is.
                rewritten.push(entry.clone());
                continue;
            }

            let sig = entry_sig(&abs_path, &entry.id);
            if let Some(cached) = self.cached_entry(&sig) {
                let mut from_cache = cached;
                from_cache.mode = entry.mode;
                rewritten.push(from_cache);
                continue;
            }

            let new_id =
                Box::pin(self.rewrite_tree(matcher, commit_id, entry.id, &abs_path)).await?;
            let mut new_entry = entry.clone();
            new_entry.id = new_id;
            self.record_entry(sig, new_entry.clone());
            rewritten.push(new_entry);
        }

        if rewritten == tree.entries {
            return Ok(tree_id);
        }
        let new_tree = Tree::from_entries(self.store.hash_kind(), rewritten)?;
        self.store.write(&AnyObject::Tree(new_tree.clone())).await?;
        Ok(new_tree.id)
    }

    /// Drop pass over a commit list in reverse topological order
    /// (parents first). Parents outside the rewrite set stay verbatim —
    /// the partial-migration boundary.
    pub async fn rewrite_commits(
        &self,
        matcher: &dyn DropMatcher,
        commits: &[ObjectHash],
    ) -> Result<(), ZetaError> {
        for &id in commits {
            let original = self.store.commit(id).await?;
            let new_tree = self
                .rewrite_tree(matcher, id, original.tree_id, "")
                .await?;

            let new_parents: Vec<ObjectHash> = original
                .parent_ids
                .iter()
                .map(|p| self.mapped(*p).unwrap_or(*p))
                .collect();

            let new = Commit::with_extra_headers(
                self.store.hash_kind(),
                original.author.clone(),
                original.committer.clone(),
                new_tree,
                new_parents,
                original.extra_headers.clone(),
                original.message.clone(),
            )?;

            let new_id = if original.equal(&new) {
                id
            } else {
                self.store.write(&AnyObject::Commit(new.clone())).await?;
                new.id
            };
            self.record_commit(id, new_id);
        }
        Ok(())
    }

    /// Graft the tip of HEAD onto rewritten parents, leaving every
    /// ancestor untouched. Tree and message stay as they are; the id only
    /// changes when a parent actually remapped.
    pub async fn graft_head(&self, tip: ObjectHash) -> Result<ObjectHash, ZetaError> {
        let original = self.store.commit(tip).await?;
        let new_parents: Vec<ObjectHash> = original
            .parent_ids
            .iter()
            .map(|p| self.mapped(*p).unwrap_or(*p))
            .collect();
        if new_parents == original.parent_ids {
            self.record_commit(tip, tip);
            return Ok(tip);
        }
        let new = Commit::with_extra_headers(
            self.store.hash_kind(),
            original.author.clone(),
            original.committer.clone(),
            original.tree_id,
            new_parents,
            original.extra_headers.clone(),
            original.message.clone(),
        )?;
        self.store.write(&AnyObject::Commit(new.clone())).await?;
        self.record_commit(tip, new.id);
        tracing::info!(old = %tip, new = %new.id, "grafted HEAD tip");
        Ok(new.id)
    }
}
