//! Thread navigation: the ancestor/descendant graph of replies around an
//! entry.

use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};

use tracing::warn;

use crate::client::ElogApi;
use crate::search::ElogSearch;
use crate::{ElogError, ElogHit};

/// Loop-free reply graph rooted at the queried entry, or at its oldest
/// ancestor when parents were requested.
#[derive(Debug, Clone)]
pub struct ThreadGraph {
    pub root: u64,
    pub queried: u64,
    pub nodes: HashMap<u64, ElogHit>,
    /// parent id → reply ids, each list sorted by reply timestamp
    /// ascending (undated replies last).
    pub children: BTreeMap<u64, Vec<u64>>,
}

impl ThreadGraph {
    pub fn contains(&self, id: u64) -> bool {
        self.nodes.contains_key(&id)
    }

    pub fn edge_count(&self) -> usize {
        self.children.values().map(Vec::len).sum()
    }

    /// Depth-first preorder over the graph, for rendering.
    pub fn preorder(&self) -> Vec<u64> {
        let mut order = Vec::with_capacity(self.nodes.len());
        let mut stack = vec![self.root];
        while let Some(id) = stack.pop() {
            if !self.nodes.contains_key(&id) {
                continue;
            }
            order.push(id);
            if let Some(replies) = self.children.get(&id) {
                for reply in replies.iter().rev() {
                    stack.push(*reply);
                }
            }
        }
        order
    }
}

impl ElogSearch {
    /// Assemble the thread around `message_id`.
    ///
    /// Walks parent pointers up to the root when `include_parents`, then
    /// reply pointers breadth-first when `include_replies`.  Cycles should
    /// be impossible in server data but are rejected rather than looped on.
    pub async fn thread(
        &self,
        message_id: u64,
        include_replies: bool,
        include_parents: bool,
    ) -> Result<ThreadGraph, ElogError> {
        // The queried entry must exist; everything else degrades gracefully.
        let queried_entry = self.api().read(message_id).await?;

        // Ancestor chain, root last.
        let mut chain = vec![message_id];
        if include_parents {
            let mut seen: HashSet<u64> = chain.iter().copied().collect();
            let mut current = message_id;
            loop {
                let links = self.api().thread(current).await?;
                match links.parent {
                    Some(parent) => {
                        if !seen.insert(parent) {
                            return Err(ElogError::ThreadCycle(parent));
                        }
                        chain.push(parent);
                        current = parent;
                    }
                    None => break,
                }
            }
        }
        let root = *chain.last().unwrap_or(&message_id);

        // parent_of doubles as the cycle guard: a reply reached through two
        // different parents, or pointing back at the root, is rejected.
        let mut parent_of: HashMap<u64, u64> = HashMap::new();
        for pair in chain.windows(2) {
            parent_of.insert(pair[0], pair[1]);
        }
        let mut children: BTreeMap<u64, Vec<u64>> = BTreeMap::new();
        for pair in chain.windows(2) {
            children.entry(pair[1]).or_default().push(pair[0]);
        }

        if include_replies {
            let start = if include_parents { root } else { message_id };
            let mut processed: HashSet<u64> = HashSet::new();
            let mut queue = VecDeque::from([start]);
            while let Some(node) = queue.pop_front() {
                if !processed.insert(node) {
                    continue;
                }
                let links = self.api().thread(node).await?;
                for reply in links.replies {
                    if reply == root || reply == node {
                        return Err(ElogError::ThreadCycle(reply));
                    }
                    match parent_of.get(&reply) {
                        Some(&existing) if existing != node => {
                            return Err(ElogError::ThreadCycle(reply));
                        }
                        Some(_) => {} // chain edge rediscovered
                        None => {
                            parent_of.insert(reply, node);
                            children.entry(node).or_default().push(reply);
                        }
                    }
                    queue.push_back(reply);
                }
            }
        }

        // Fetch every node; unreadable non-queried nodes are dropped.
        let mut ids: Vec<u64> = parent_of.keys().copied().collect();
        ids.push(root);
        ids.sort_unstable();
        ids.dedup();
        ids.retain(|&id| id != message_id);

        let mut nodes: HashMap<u64, ElogHit> = HashMap::new();
        nodes.insert(message_id, self.build_hit(queried_entry));
        for entry in self.bulk_read(&ids).await {
            nodes.insert(entry.id, self.build_hit(entry));
        }
        let dropped = ids.iter().filter(|id| !nodes.contains_key(id)).count();
        if dropped > 0 {
            warn!(dropped, "thread nodes unreadable, pruned from graph");
        }

        for replies in children.values_mut() {
            replies.retain(|id| nodes.contains_key(id));
            replies.sort_by(|a, b| {
                let ta = nodes.get(a).and_then(|h| h.timestamp);
                let tb = nodes.get(b).and_then(|h| h.timestamp);
                match (ta, tb) {
                    (Some(ta), Some(tb)) => ta.cmp(&tb).then(a.cmp(b)),
                    (Some(_), None) => std::cmp::Ordering::Less,
                    (None, Some(_)) => std::cmp::Ordering::Greater,
                    (None, None) => a.cmp(b),
                }
            });
        }
        children.retain(|parent, replies| nodes.contains_key(parent) && !replies.is_empty());

        Ok(ThreadGraph {
            root,
            queried: message_id,
            nodes,
            children,
        })
    }
}

// ── Tests ────────────────────────────────────────────────────────────────────
