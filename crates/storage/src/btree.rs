//! On-disk B+tree over opaque byte keys and values (§3, §4.1, §4.4).
//!
//! Keys are compared lexicographically as byte strings; callers (the
//! document store and secondary indexes) are responsible for producing
//! byte-ordered keys via [`lauradb_core::key`] so that tree order matches
//! the logical order they need (numeric, compound, non-unique-with-id,
//! etc). Values are opaque too: the document store stores either an
//! encoded document or, past [`crate::overflow::OVERFLOW_THRESHOLD`], a
//! pointer into an overflow chain.
//!
//! Leaf pages are sibling-linked so range scans only ever hold a single
//! leaf pin at a time. Splits propagate upward, growing the tree height
//! by one whenever the root splits. Deletes are the mirror image: a leaf
//! or internal node left underfull by a removal first tries to borrow an
//! entry from an adjacent sibling (rotating through the parent
//! separator), and merges with a sibling — pulling the parent separator
//! down — only when neither sibling has anything to spare. Merging can
//! itself leave the parent underfull, so rebalancing propagates upward
//! exactly like a split does, and the root collapses by one level
//! whenever it's reduced to a single child (§4.4, §8).

use crate::bufferpool::BufferPool;
use crate::page::{PageId, PageKind, PAGE_HEADER_SIZE};
use crate::pagefile::NONE_PAGE;
use lauradb_core::{Error, Result};
use lauradb_durability::TxId;

/// Whether a tree enforces at most one entry per key.
#[derive(Debug, Clone, Copy)]
pub struct BTreeConfig {
    pub unique: bool,
}

impl Default for BTreeConfig {
    fn default() -> Self {
        BTreeConfig { unique: true }
    }
}

type Entry = (Vec<u8>, Vec<u8>);

struct LeafNode {
    next: PageId,
    prev: PageId,
    entries: Vec<Entry>,
}

struct InternalNode {
    children: Vec<PageId>,
    keys: Vec<Vec<u8>>,
}

fn encode_leaf(node: &LeafNode) -> Vec<u8> {
    let mut out = Vec::new();
    out.extend_from_slice(&node.next.to_be_bytes());
    out.extend_from_slice(&node.prev.to_be_bytes());
    out.extend_from_slice(&(node.entries.len() as u16).to_be_bytes());
    for (k, v) in &node.entries {
        out.extend_from_slice(&(k.len() as u16).to_be_bytes());
        out.extend_from_slice(k);
        out.extend_from_slice(&(v.len() as u32).to_be_bytes());
        out.extend_from_slice(v);
    }
    out
}

fn decode_leaf(body: &[u8]) -> LeafNode {
    let next = u32::from_be_bytes(body[0..4].try_into().unwrap());
    let prev = u32::from_be_bytes(body[4..8].try_into().unwrap());
    let count = u16::from_be_bytes(body[8..10].try_into().unwrap()) as usize;
    let mut pos = 10;
    let mut entries = Vec::with_capacity(count);
    for _ in 0..count {
        let klen = u16::from_be_bytes(body[pos..pos + 2].try_into().unwrap()) as usize;
        pos += 2;
        let key = body[pos..pos + klen].to_vec();
        pos += klen;
        let vlen = u32::from_be_bytes(body[pos..pos + 4].try_into().unwrap()) as usize;
        pos += 4;
        let value = body[pos..pos + vlen].to_vec();
        pos += vlen;
        entries.push((key, value));
    }
    LeafNode { next, prev, entries }
}

fn encode_internal(node: &InternalNode) -> Vec<u8> {
    let mut out = Vec::new();
    out.extend_from_slice(&(node.keys.len() as u16).to_be_bytes());
    for child in &node.children {
        out.extend_from_slice(&child.to_be_bytes());
    }
    for key in &node.keys {
        out.extend_from_slice(&(key.len() as u16).to_be_bytes());
        out.extend_from_slice(key);
    }
    out
}

fn decode_internal(body: &[u8]) -> InternalNode {
    let num_keys = u16::from_be_bytes(body[0..2].try_into().unwrap()) as usize;
    let mut pos = 2;
    let mut children = Vec::with_capacity(num_keys + 1);
    for _ in 0..=num_keys {
        children.push(u32::from_be_bytes(body[pos..pos + 4].try_into().unwrap()));
        pos += 4;
    }
    let mut keys = Vec::with_capacity(num_keys);
    for _ in 0..num_keys {
        let klen = u16::from_be_bytes(body[pos..pos + 2].try_into().unwrap()) as usize;
        pos += 2;
        keys.push(body[pos..pos + klen].to_vec());
        pos += klen;
    }
    InternalNode { children, keys }
}

/// Result of a node-level insert that outgrew its page: the separator
/// key to promote and the new sibling created to its right.
type SplitResult = Option<(Vec<u8>, PageId)>;

/// An on-disk B+tree rooted at a single page.
pub struct BTree<'a> {
    pool: &'a BufferPool,
    root: PageId,
    config: BTreeConfig,
}

impl<'a> BTree<'a> {
    /// Allocate a fresh, empty tree.
    pub fn create(pool: &'a BufferPool, tx_id: TxId, config: BTreeConfig) -> Result<Self> {
        let root = pool.allocate_page(tx_id, PageKind::BTreeLeaf)?;
        pool.pin(root)?;
        pool.write_page(tx_id, root, |page| {
            page.body = encode_leaf(&LeafNode {
                next: NONE_PAGE,
                prev: NONE_PAGE,
                entries: Vec::new(),
            });
        })?;
        pool.unpin(root, true);
        Ok(BTree { pool, root, config })
    }

    /// Attach to an existing tree whose root is already on disk.
    pub fn open(pool: &'a BufferPool, root: PageId, config: BTreeConfig) -> Self {
        BTree { pool, root, config }
    }

    /// This tree's current root page id. Callers persist this in the
    /// catalog entry describing the collection or index; it can change
    /// after any insert that splits the root.
    pub fn root(&self) -> PageId {
        self.root
    }

    /// Whether this tree is configured to enforce at most one entry per
    /// key. Enforcement itself happens one layer up (the document store
    /// checks for a conflicting owner via [`BTree::get`] before calling
    /// [`BTree::insert`]), since this layer cannot tell "overwrite my own
    /// entry" apart from "collide with someone else's".
    pub fn is_unique(&self) -> bool {
        self.config.unique
    }

    fn node_capacity(&self) -> usize {
        self.pool.page_size() - PAGE_HEADER_SIZE
    }

    /// Point lookup.
    pub fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>> {
        let mut node_id = self.root;
        loop {
            let page = self.pool.pin(node_id)?;
            self.pool.unpin(node_id, false);
            match page.kind {
                PageKind::BTreeLeaf => {
                    let leaf = decode_leaf(&page.body);
                    return Ok(leaf
                        .entries
                        .binary_search_by(|(k, _)| k.as_slice().cmp(key))
                        .ok()
                        .map(|idx| leaf.entries[idx].1.clone()));
                }
                PageKind::BTreeInternal => {
                    let internal = decode_internal(&page.body);
                    node_id = child_for_key(&internal, key);
                }
                other => {
                    return Err(Error::corruption(format!(
                        "expected btree node, found page kind {other:?}"
                    )))
                }
            }
        }
    }

    /// Insert or overwrite `key` with `value`. For a unique tree, a
    /// distinct existing key is never silently replaced with unrelated
    /// semantics by this layer: the document store and index maintenance
    /// code are responsible for checking uniqueness ahead of time with
    /// [`BTree::get`] when the existing entry belongs to a different
    /// document, so a raw overwrite here always means "same logical
    /// entry, new value."
    pub fn insert(&mut self, tx_id: TxId, key: &[u8], value: &[u8]) -> Result<()> {
        if let Some((sep, new_right)) = self.insert_into(tx_id, self.root, key, value)? {
            let new_root = self.pool.allocate_page(tx_id, PageKind::BTreeInternal)?;
            self.pool.pin(new_root)?;
            let old_root = self.root;
            self.pool.write_page(tx_id, new_root, |page| {
                page.body = encode_internal(&InternalNode {
                    children: vec![old_root, new_right],
                    keys: vec![sep],
                });
            })?;
            self.pool.unpin(new_root, true);
            self.root = new_root;
        }
        Ok(())
    }

    fn insert_into(&self, tx_id: TxId, node_id: PageId, key: &[u8], value: &[u8]) -> Result<SplitResult> {
        let page = self.pool.pin(node_id)?;
        match page.kind {
            PageKind::BTreeLeaf => {
                let mut leaf = decode_leaf(&page.body);
                match leaf.entries.binary_search_by(|(k, _)| k.as_slice().cmp(key)) {
                    Ok(idx) => leaf.entries[idx].1 = value.to_vec(),
                    Err(idx) => leaf.entries.insert(idx, (key.to_vec(), value.to_vec())),
                }
                let result = if encode_leaf(&leaf).len() > self.node_capacity() {
                    self.split_leaf(tx_id, node_id, leaf)?
                } else {
                    self.pool.write_page(tx_id, node_id, |p| p.body = encode_leaf(&leaf))?;
                    None
                };
                self.pool.unpin(node_id, true);
                Ok(result)
            }
            PageKind::BTreeInternal => {
                let mut internal = decode_internal(&page.body);
                self.pool.unpin(node_id, false);
                let child_idx = child_index_for_key(&internal, key);
                let child_id = internal.children[child_idx];
                match self.insert_into(tx_id, child_id, key, value)? {
                    None => Ok(None),
                    Some((sep, new_child)) => {
                        internal.keys.insert(child_idx, sep);
                        internal.children.insert(child_idx + 1, new_child);
                        self.pool.pin(node_id)?;
                        let result = if encode_internal(&internal).len() > self.node_capacity() {
                            self.split_internal(tx_id, node_id, internal)?
                        } else {
                            self.pool
                                .write_page(tx_id, node_id, |p| p.body = encode_internal(&internal))?;
                            None
                        };
                        self.pool.unpin(node_id, true);
                        Ok(result)
                    }
                }
            }
            other => Err(Error::corruption(format!(
                "expected btree node, found page kind {other:?}"
            ))),
        }
    }

    fn split_leaf(&self, tx_id: TxId, node_id: PageId, leaf: LeafNode) -> Result<SplitResult> {
        let mid = leaf.entries.len() / 2;
        let right_entries = leaf.entries[mid..].to_vec();
        let left_entries = leaf.entries[..mid].to_vec();
        let separator = right_entries[0].0.clone();

        let new_right_id = self.pool.allocate_page(tx_id, PageKind::BTreeLeaf)?;
        let old_next = leaf.next;

        self.pool.write_page(tx_id, node_id, |p| {
            p.body = encode_leaf(&LeafNode {
                next: new_right_id,
                prev: leaf.prev,
                entries: left_entries,
            })
        })?;

        self.pool.pin(new_right_id)?;
        self.pool.write_page(tx_id, new_right_id, |p| {
            p.body = encode_leaf(&LeafNode {
                next: old_next,
                prev: node_id,
                entries: right_entries,
            })
        })?;
        self.pool.unpin(new_right_id, true);

        if old_next != NONE_PAGE {
            self.pool.pin(old_next)?;
            self.pool.write_page(tx_id, old_next, |p| {
                let mut next_leaf = decode_leaf(&p.body);
                next_leaf.prev = new_right_id;
                p.body = encode_leaf(&next_leaf);
            })?;
            self.pool.unpin(old_next, true);
        }

        Ok(Some((separator, new_right_id)))
    }

    fn split_internal(&self, tx_id: TxId, node_id: PageId, internal: InternalNode) -> Result<SplitResult> {
        let mid = internal.keys.len() / 2;
        let separator = internal.keys[mid].clone();
        let left_keys = internal.keys[..mid].to_vec();
        let right_keys = internal.keys[mid + 1..].to_vec();
        let left_children = internal.children[..=mid].to_vec();
        let right_children = internal.children[mid + 1..].to_vec();

        let new_right_id = self.pool.allocate_page(tx_id, PageKind::BTreeInternal)?;
        self.pool.write_page(tx_id, node_id, |p| {
            p.body = encode_internal(&InternalNode {
                children: left_children,
                keys: left_keys,
            })
        })?;
        self.pool.pin(new_right_id)?;
        self.pool.write_page(tx_id, new_right_id, |p| {
            p.body = encode_internal(&InternalNode {
                children: right_children,
                keys: right_keys,
            })
        })?;
        self.pool.unpin(new_right_id, true);

        Ok(Some((separator, new_right_id)))
    }

    /// Remove `key`, returning its prior value if present. Does not free
    /// an overflow chain the value may have pointed to; callers holding
    /// overflow pointers must free that chain themselves first.
    pub fn delete(&mut self, tx_id: TxId, key: &[u8]) -> Result<Option<Vec<u8>>> {
        let (removed, _) = self.delete_from(tx_id, self.root, key)?;
        if removed.is_some() {
            self.collapse_root_if_needed(tx_id)?;
        }
        Ok(removed)
    }

    /// Remove `key` from the subtree rooted at `node_id`. Returns the
    /// removed value (if the key was present) and whether `node_id` is
    /// now underfull and needs rebalancing by its parent. The root is
    /// never reported underfull here; [`BTree::collapse_root_if_needed`]
    /// handles it separately once the whole recursion unwinds.
    fn delete_from(&mut self, tx_id: TxId, node_id: PageId, key: &[u8]) -> Result<(Option<Vec<u8>>, bool)> {
        let page = self.pool.pin(node_id)?;
        match page.kind {
            PageKind::BTreeLeaf => {
                let mut leaf = decode_leaf(&page.body);
                let removed = match leaf.entries.binary_search_by(|(k, _)| k.as_slice().cmp(key)) {
                    Ok(idx) => Some(leaf.entries.remove(idx).1),
                    Err(_) => None,
                };
                if removed.is_some() {
                    self.pool.write_page(tx_id, node_id, |p| p.body = encode_leaf(&leaf))?;
                }
                let underfull = node_id != self.root && self.leaf_is_thin(&leaf);
                self.pool.unpin(node_id, removed.is_some());
                Ok((removed, underfull))
            }
            PageKind::BTreeInternal => {
                let mut internal = decode_internal(&page.body);
                self.pool.unpin(node_id, false);
                let child_idx = child_index_for_key(&internal, key);
                let child_id = internal.children[child_idx];
                let (removed, child_underfull) = self.delete_from(tx_id, child_id, key)?;
                if !child_underfull {
                    return Ok((removed, false));
                }
                self.pool.pin(node_id)?;
                self.rebalance_child(tx_id, &mut internal, child_idx)?;
                self.pool
                    .write_page(tx_id, node_id, |p| p.body = encode_internal(&internal))?;
                let underfull = node_id != self.root && self.internal_is_thin(&internal);
                self.pool.unpin(node_id, true);
                Ok((removed, underfull))
            }
            other => {
                self.pool.unpin(node_id, false);
                Err(Error::corruption(format!(
                    "expected btree node, found page kind {other:?}"
                )))
            }
        }
    }

    /// A leaf below half its node capacity is too thin to stand alone;
    /// its parent should try to borrow it an entry or merge it into a
    /// sibling.
    fn leaf_is_thin(&self, leaf: &LeafNode) -> bool {
        encode_leaf(leaf).len() < self.node_capacity() / 2
    }

    /// An internal node below half capacity, or reduced to a single
    /// child, needs rebalancing the same way a thin leaf does.
    fn internal_is_thin(&self, internal: &InternalNode) -> bool {
        internal.children.len() <= 1 || encode_internal(internal).len() < self.node_capacity() / 2
    }

    fn can_donate_leaf_from_back(&self, sibling: &LeafNode) -> bool {
        if sibling.entries.len() <= 1 {
            return false;
        }
        let probe = LeafNode {
            next: sibling.next,
            prev: sibling.prev,
            entries: sibling.entries[..sibling.entries.len() - 1].to_vec(),
        };
        !self.leaf_is_thin(&probe)
    }

    fn can_donate_leaf_from_front(&self, sibling: &LeafNode) -> bool {
        if sibling.entries.len() <= 1 {
            return false;
        }
        let probe = LeafNode {
            next: sibling.next,
            prev: sibling.prev,
            entries: sibling.entries[1..].to_vec(),
        };
        !self.leaf_is_thin(&probe)
    }

    /// A sibling with more than two children can give one up and still
    /// remain a valid (non-degenerate) internal node.
    fn can_donate_internal(&self, sibling: &InternalNode) -> bool {
        sibling.children.len() > 2
    }

    /// Fix up `internal`'s child at `child_idx`, known to be underfull,
    /// by borrowing from a sibling or merging with one. Tries the left
    /// sibling first, then the right, preferring a borrow (which touches
    /// only the two siblings and the parent separator) over a merge
    /// (which frees a page and shrinks the parent).
    fn rebalance_child(&mut self, tx_id: TxId, internal: &mut InternalNode, child_idx: usize) -> Result<()> {
        let child_id = internal.children[child_idx];
        let kind = self.pool.pin(child_id)?.kind;
        self.pool.unpin(child_id, false);
        match kind {
            PageKind::BTreeLeaf => self.rebalance_leaf_child(tx_id, internal, child_idx),
            PageKind::BTreeInternal => self.rebalance_internal_child(tx_id, internal, child_idx),
            other => Err(Error::corruption(format!(
                "expected btree node, found page kind {other:?}"
            ))),
        }
    }

    fn rebalance_leaf_child(&mut self, tx_id: TxId, internal: &mut InternalNode, child_idx: usize) -> Result<()> {
        if child_idx > 0 {
            let left_id = internal.children[child_idx - 1];
            let left = decode_leaf(&self.pool.pin(left_id)?.body);
            self.pool.unpin(left_id, false);
            if self.can_donate_leaf_from_back(&left) {
                return self.borrow_from_left_leaf(tx_id, internal, child_idx, left);
            }
        }
        if child_idx + 1 < internal.children.len() {
            let right_id = internal.children[child_idx + 1];
            let right = decode_leaf(&self.pool.pin(right_id)?.body);
            self.pool.unpin(right_id, false);
            if self.can_donate_leaf_from_front(&right) {
                return self.borrow_from_right_leaf(tx_id, internal, child_idx, right);
            }
        }
        if child_idx > 0 {
            self.merge_leaf_with_left(tx_id, internal, child_idx)
        } else {
            self.merge_leaf_with_right(tx_id, internal, child_idx)
        }
    }

    fn borrow_from_left_leaf(
        &mut self,
        tx_id: TxId,
        internal: &mut InternalNode,
        child_idx: usize,
        mut left: LeafNode,
    ) -> Result<()> {
        let left_id = internal.children[child_idx - 1];
        let child_id = internal.children[child_idx];
        let moved = left.entries.pop().expect("can_donate_leaf_from_back checked len > 1");

        self.pool.pin(left_id)?;
        self.pool.write_page(tx_id, left_id, |p| p.body = encode_leaf(&left))?;
        self.pool.unpin(left_id, true);

        let mut child = decode_leaf(&self.pool.pin(child_id)?.body);
        self.pool.unpin(child_id, false);
        child.entries.insert(0, moved.clone());
        self.pool.pin(child_id)?;
        self.pool.write_page(tx_id, child_id, |p| p.body = encode_leaf(&child))?;
        self.pool.unpin(child_id, true);

        internal.keys[child_idx - 1] = moved.0;
        Ok(())
    }

    fn borrow_from_right_leaf(
        &mut self,
        tx_id: TxId,
        internal: &mut InternalNode,
        child_idx: usize,
        mut right: LeafNode,
    ) -> Result<()> {
        let right_id = internal.children[child_idx + 1];
        let child_id = internal.children[child_idx];
        let moved = right.entries.remove(0);

        self.pool.pin(right_id)?;
        self.pool.write_page(tx_id, right_id, |p| p.body = encode_leaf(&right))?;
        self.pool.unpin(right_id, true);

        let mut child = decode_leaf(&self.pool.pin(child_id)?.body);
        self.pool.unpin(child_id, false);
        child.entries.push(moved);
        self.pool.pin(child_id)?;
        self.pool.write_page(tx_id, child_id, |p| p.body = encode_leaf(&child))?;
        self.pool.unpin(child_id, true);

        internal.keys[child_idx] = right.entries[0].0.clone();
        Ok(())
    }

    fn merge_leaf_with_left(&mut self, tx_id: TxId, internal: &mut InternalNode, child_idx: usize) -> Result<()> {
        let left_id = internal.children[child_idx - 1];
        let child_id = internal.children[child_idx];
        let mut left = decode_leaf(&self.pool.pin(left_id)?.body);
        self.pool.unpin(left_id, false);
        let child = decode_leaf(&self.pool.pin(child_id)?.body);
        self.pool.unpin(child_id, false);

        left.entries.extend(child.entries);
        left.next = child.next;
        self.pool.pin(left_id)?;
        self.pool.write_page(tx_id, left_id, |p| p.body = encode_leaf(&left))?;
        self.pool.unpin(left_id, true);

        if child.next != NONE_PAGE {
            self.pool.pin(child.next)?;
            self.pool.write_page(tx_id, child.next, |p| {
                let mut next_leaf = decode_leaf(&p.body);
                next_leaf.prev = left_id;
                p.body = encode_leaf(&next_leaf);
            })?;
            self.pool.unpin(child.next, true);
        }

        self.pool.free_page(tx_id, child_id)?;
        internal.keys.remove(child_idx - 1);
        internal.children.remove(child_idx);
        Ok(())
    }

    fn merge_leaf_with_right(&mut self, tx_id: TxId, internal: &mut InternalNode, child_idx: usize) -> Result<()> {
        let child_id = internal.children[child_idx];
        let right_id = internal.children[child_idx + 1];
        let mut child = decode_leaf(&self.pool.pin(child_id)?.body);
        self.pool.unpin(child_id, false);
        let right = decode_leaf(&self.pool.pin(right_id)?.body);
        self.pool.unpin(right_id, false);

        child.entries.extend(right.entries);
        child.next = right.next;
        self.pool.pin(child_id)?;
        self.pool.write_page(tx_id, child_id, |p| p.body = encode_leaf(&child))?;
        self.pool.unpin(child_id, true);

        if right.next != NONE_PAGE {
            self.pool.pin(right.next)?;
            self.pool.write_page(tx_id, right.next, |p| {
                let mut next_leaf = decode_leaf(&p.body);
                next_leaf.prev = child_id;
                p.body = encode_leaf(&next_leaf);
            })?;
            self.pool.unpin(right.next, true);
        }

        self.pool.free_page(tx_id, right_id)?;
        internal.keys.remove(child_idx);
        internal.children.remove(child_idx + 1);
        Ok(())
    }

    fn rebalance_internal_child(&mut self, tx_id: TxId, internal: &mut InternalNode, child_idx: usize) -> Result<()> {
        if child_idx > 0 {
            let left_id = internal.children[child_idx - 1];
            let left = decode_internal(&self.pool.pin(left_id)?.body);
            self.pool.unpin(left_id, false);
            if self.can_donate_internal(&left) {
                return self.borrow_from_left_internal(tx_id, internal, child_idx, left);
            }
        }
        if child_idx + 1 < internal.children.len() {
            let right_id = internal.children[child_idx + 1];
            let right = decode_internal(&self.pool.pin(right_id)?.body);
            self.pool.unpin(right_id, false);
            if self.can_donate_internal(&right) {
                return self.borrow_from_right_internal(tx_id, internal, child_idx, right);
            }
        }
        if child_idx > 0 {
            self.merge_internal_with_left(tx_id, internal, child_idx)
        } else {
            self.merge_internal_with_right(tx_id, internal, child_idx)
        }
    }

    fn borrow_from_left_internal(
        &mut self,
        tx_id: TxId,
        internal: &mut InternalNode,
        child_idx: usize,
        mut left: InternalNode,
    ) -> Result<()> {
        let left_id = internal.children[child_idx - 1];
        let child_id = internal.children[child_idx];
        let moved_child = left.children.pop().expect("can_donate_internal checked size");
        let promoted_key = left.keys.pop().expect("can_donate_internal checked size");

        self.pool.pin(left_id)?;
        self.pool.write_page(tx_id, left_id, |p| p.body = encode_internal(&left))?;
        self.pool.unpin(left_id, true);

        let mut child = decode_internal(&self.pool.pin(child_id)?.body);
        self.pool.unpin(child_id, false);
        let old_separator = internal.keys[child_idx - 1].clone();
        child.keys.insert(0, old_separator);
        child.children.insert(0, moved_child);
        self.pool.pin(child_id)?;
        self.pool.write_page(tx_id, child_id, |p| p.body = encode_internal(&child))?;
        self.pool.unpin(child_id, true);

        internal.keys[child_idx - 1] = promoted_key;
        Ok(())
    }

    fn borrow_from_right_internal(
        &mut self,
        tx_id: TxId,
        internal: &mut InternalNode,
        child_idx: usize,
        mut right: InternalNode,
    ) -> Result<()> {
        let right_id = internal.children[child_idx + 1];
        let child_id = internal.children[child_idx];
        let moved_child = right.children.remove(0);
        let promoted_key = right.keys.remove(0);

        self.pool.pin(right_id)?;
        self.pool.write_page(tx_id, right_id, |p| p.body = encode_internal(&right))?;
        self.pool.unpin(right_id, true);

        let mut child = decode_internal(&self.pool.pin(child_id)?.body);
        self.pool.unpin(child_id, false);
        let old_separator = internal.keys[child_idx].clone();
        child.keys.push(old_separator);
        child.children.push(moved_child);
        self.pool.pin(child_id)?;
        self.pool.write_page(tx_id, child_id, |p| p.body = encode_internal(&child))?;
        self.pool.unpin(child_id, true);

        internal.keys[child_idx] = promoted_key;
        Ok(())
    }

    fn merge_internal_with_left(&mut self, tx_id: TxId, internal: &mut InternalNode, child_idx: usize) -> Result<()> {
        let left_id = internal.children[child_idx - 1];
        let child_id = internal.children[child_idx];
        let mut left = decode_internal(&self.pool.pin(left_id)?.body);
        self.pool.unpin(left_id, false);
        let child = decode_internal(&self.pool.pin(child_id)?.body);
        self.pool.unpin(child_id, false);

        left.keys.push(internal.keys[child_idx - 1].clone());
        left.keys.extend(child.keys);
        left.children.extend(child.children);

        self.pool.pin(left_id)?;
        self.pool.write_page(tx_id, left_id, |p| p.body = encode_internal(&left))?;
        self.pool.unpin(left_id, true);

        self.pool.free_page(tx_id, child_id)?;
        internal.keys.remove(child_idx - 1);
        internal.children.remove(child_idx);
        Ok(())
    }

    fn merge_internal_with_right(&mut self, tx_id: TxId, internal: &mut InternalNode, child_idx: usize) -> Result<()> {
        let child_id = internal.children[child_idx];
        let right_id = internal.children[child_idx + 1];
        let mut child = decode_internal(&self.pool.pin(child_id)?.body);
        self.pool.unpin(child_id, false);
        let right = decode_internal(&self.pool.pin(right_id)?.body);
        self.pool.unpin(right_id, false);

        child.keys.push(internal.keys[child_idx].clone());
        child.keys.extend(right.keys);
        child.children.extend(right.children);

        self.pool.pin(child_id)?;
        self.pool.write_page(tx_id, child_id, |p| p.body = encode_internal(&child))?;
        self.pool.unpin(child_id, true);

        self.pool.free_page(tx_id, right_id)?;
        internal.keys.remove(child_idx);
        internal.children.remove(child_idx + 1);
        Ok(())
    }

    /// Collapse the root by one level for as long as it's an internal
    /// node with exactly one child — the degenerate shape a merge can
    /// leave behind at the top of the tree (§8).
    fn collapse_root_if_needed(&mut self, tx_id: TxId) -> Result<()> {
        loop {
            let page = self.pool.pin(self.root)?;
            if page.kind != PageKind::BTreeInternal {
                self.pool.unpin(self.root, false);
                return Ok(());
            }
            let internal = decode_internal(&page.body);
            self.pool.unpin(self.root, false);
            if internal.children.len() != 1 {
                return Ok(());
            }
            let old_root = self.root;
            self.root = internal.children[0];
            self.pool.free_page(tx_id, old_root)?;
        }
    }

    /// Range scan over `[start, end)`; `None` on either bound means
    /// unbounded in that direction. Holds only one leaf pin at a time.
    pub fn scan(&self, start: Option<&[u8]>, end: Option<&[u8]>) -> Result<Vec<Entry>> {
        let mut node_id = self.root;
        loop {
            let page = self.pool.pin(node_id)?;
            match page.kind {
                PageKind::BTreeLeaf => {
                    self.pool.unpin(node_id, false);
                    break;
                }
                PageKind::BTreeInternal => {
                    let internal = decode_internal(&page.body);
                    self.pool.unpin(node_id, false);
                    node_id = match start {
                        Some(k) => child_for_key(&internal, k),
                        None => internal.children[0],
                    };
                }
                other => {
                    self.pool.unpin(node_id, false);
                    return Err(Error::corruption(format!(
                        "expected btree node, found page kind {other:?}"
                    )));
                }
            }
        }

        let mut out = Vec::new();
        let mut current = node_id;
        'chain: while current != NONE_PAGE {
            let page = self.pool.pin(current)?;
            let leaf = decode_leaf(&page.body);
            self.pool.unpin(current, false);
            for (k, v) in leaf.entries {
                if let Some(s) = start {
                    if k.as_slice() < s {
                        continue;
                    }
                }
                if let Some(e) = end {
                    if k.as_slice() >= e {
                        break 'chain;
                    }
                }
                out.push((k, v));
            }
            current = leaf.next;
        }
        Ok(out)
    }

    /// Build a tree from already-sorted `(key, value)` pairs. Implemented
    /// as repeated inserts rather than a dedicated bottom-up bulk-load
    /// pass; correct, not the fastest possible path for large imports
    /// (used by backup restore, where import volume is modest).
    pub fn bulk_load(pool: &'a BufferPool, tx_id: TxId, config: BTreeConfig, entries: &[Entry]) -> Result<Self> {
        let mut tree = Self::create(pool, tx_id, config)?;
        for (k, v) in entries {
            tree.insert(tx_id, k, v)?;
        }
        Ok(tree)
    }

    /// Free every page this tree owns: a breadth-first walk from the
    /// root freeing internal nodes as they're visited and every leaf in
    /// the sibling chain. Used when a collection or index is dropped for
    /// real (as opposed to just forgetting its catalog entry), so repair
    /// and defragmentation can actually reclaim space rather than leak
    /// it.
    pub fn destroy(&self, tx_id: TxId) -> Result<()> {
        let mut frontier = vec![self.root];
        while let Some(node_id) = frontier.pop() {
            let page = self.pool.pin(node_id)?;
            match page.kind {
                PageKind::BTreeInternal => {
                    let internal = decode_internal(&page.body);
                    self.pool.unpin(node_id, false);
                    frontier.extend(internal.children);
                    self.pool.free_page(tx_id, node_id)?;
                }
                PageKind::BTreeLeaf => {
                    self.pool.unpin(node_id, false);
                    self.pool.free_page(tx_id, node_id)?;
                }
                other => {
                    self.pool.unpin(node_id, false);
                    return Err(Error::corruption(format!(
                        "expected btree node, found page kind {other:?}"
                    )));
                }
            }
        }
        Ok(())
    }
}

fn child_index_for_key(internal: &InternalNode, key: &[u8]) -> usize {
    internal.keys.partition_point(|k| k.as_slice() <= key)
}

fn child_for_key(internal: &InternalNode, key: &[u8]) -> PageId {
    internal.children[child_index_for_key(internal, key)]
}

#[cfg(test)]
mod tests {
    use super::*;
    use lauradb_durability::{DurabilityMode, WalWriter};
    use std::sync::Arc;
    use tempfile::tempdir;

    fn new_pool(dir: &std::path::Path) -> BufferPool {
        let pf = crate::pagefile::PageFile::create(&dir.join("pages.db"), crate::pagefile::PAGE_SIZE).unwrap();
        let wal = Arc::new(WalWriter::open(dir.join("wal"), DurabilityMode::Sync).unwrap());
        BufferPool::new(pf, wal, 256)
    }

    #[test]
    fn insert_then_get_round_trips() {
        let dir = tempdir().unwrap();
        let pool = new_pool(dir.path());
        let mut tree = BTree::create(&pool, 1, BTreeConfig::default()).unwrap();
        tree.insert(1, b"alpha", b"1").unwrap();
        tree.insert(1, b"beta", b"2").unwrap();
        assert_eq!(tree.get(b"alpha").unwrap(), Some(b"1".to_vec()));
        assert_eq!(tree.get(b"beta").unwrap(), Some(b"2".to_vec()));
        assert_eq!(tree.get(b"gamma").unwrap(), None);
    }

    #[test]
    fn many_inserts_trigger_splits_and_stay_ordered() {
        let dir = tempdir().unwrap();
        let pool = new_pool(dir.path());
        let mut tree = BTree::create(&pool, 1, BTreeConfig::default()).unwrap();
        let mut keys: Vec<u32> = (0..2000).collect();
        for &k in &keys {
            tree.insert(1, &k.to_be_bytes(), &k.to_be_bytes()).unwrap();
        }
        for &k in &keys {
            assert_eq!(tree.get(&k.to_be_bytes()).unwrap(), Some(k.to_be_bytes().to_vec()));
        }
        keys.sort();
        let scanned = tree.scan(None, None).unwrap();
        let scanned_keys: Vec<u32> = scanned
            .iter()
            .map(|(k, _)| u32::from_be_bytes(k.as_slice().try_into().unwrap()))
            .collect();
        assert_eq!(scanned_keys, keys);
    }

    #[test]
    fn range_scan_respects_bounds() {
        let dir = tempdir().unwrap();
        let pool = new_pool(dir.path());
        let mut tree = BTree::create(&pool, 1, BTreeConfig::default()).unwrap();
        for k in 0u32..50 {
            tree.insert(1, &k.to_be_bytes(), &k.to_be_bytes()).unwrap();
        }
        let start = 10u32.to_be_bytes();
        let end = 20u32.to_be_bytes();
        let scanned = tree.scan(Some(&start), Some(&end)).unwrap();
        assert_eq!(scanned.len(), 10);
        assert_eq!(
            u32::from_be_bytes(scanned[0].0.as_slice().try_into().unwrap()),
            10
        );
    }

    #[test]
    fn delete_removes_entry() {
        let dir = tempdir().unwrap();
        let pool = new_pool(dir.path());
        let mut tree = BTree::create(&pool, 1, BTreeConfig::default()).unwrap();
        tree.insert(1, b"k", b"v").unwrap();
        assert_eq!(tree.delete(1, b"k").unwrap(), Some(b"v".to_vec()));
        assert_eq!(tree.get(b"k").unwrap(), None);
        assert_eq!(tree.delete(1, b"missing").unwrap(), None);
    }

    #[test]
    fn delete_triggers_sibling_merge_when_node_capacity_is_tight() {
        let dir = tempdir().unwrap();
        let pf = crate::pagefile::PageFile::create(&dir.path().join("pages.db"), 96).unwrap();
        let wal = Arc::new(WalWriter::open(dir.path().join("wal"), DurabilityMode::Sync).unwrap());
        let pool = BufferPool::new(pf, wal, 256);
        let mut tree = BTree::create(&pool, 1, BTreeConfig::default()).unwrap();

        for k in 0u32..12 {
            tree.insert(1, &k.to_be_bytes(), &k.to_be_bytes()).unwrap();
        }
        let root_kind = pool.pin(tree.root()).unwrap().kind;
        pool.unpin(tree.root(), false);
        assert_eq!(root_kind, PageKind::BTreeInternal, "tiny pages should have forced at least one split");

        for k in 0u32..10 {
            assert_eq!(tree.delete(1, &k.to_be_bytes()).unwrap(), Some(k.to_be_bytes().to_vec()));
        }

        for k in 10u32..12 {
            assert_eq!(tree.get(&k.to_be_bytes()).unwrap(), Some(k.to_be_bytes().to_vec()));
        }
        let scanned = tree.scan(None, None).unwrap();
        assert_eq!(scanned.len(), 2);
    }

    #[test]
    fn deleting_nearly_everything_merges_nodes_and_collapses_the_root() {
        let dir = tempdir().unwrap();
        let pf = crate::pagefile::PageFile::create(&dir.path().join("pages.db"), 96).unwrap();
        let wal = Arc::new(WalWriter::open(dir.path().join("wal"), DurabilityMode::Sync).unwrap());
        let pool = BufferPool::new(pf, wal, 256);
        let mut tree = BTree::create(&pool, 1, BTreeConfig::default()).unwrap();

        let keys: Vec<u32> = (0..200).collect();
        for &k in &keys {
            tree.insert(1, &k.to_be_bytes(), &k.to_be_bytes()).unwrap();
        }
        let root_kind = pool.pin(tree.root()).unwrap().kind;
        pool.unpin(tree.root(), false);
        assert_eq!(root_kind, PageKind::BTreeInternal);

        for &k in &keys[..190] {
            assert_eq!(tree.delete(1, &k.to_be_bytes()).unwrap(), Some(k.to_be_bytes().to_vec()));
        }
        for &k in &keys[190..] {
            assert_eq!(tree.get(&k.to_be_bytes()).unwrap(), Some(k.to_be_bytes().to_vec()));
        }
        let scanned = tree.scan(None, None).unwrap();
        let scanned_keys: Vec<u32> = scanned
            .iter()
            .map(|(k, _)| u32::from_be_bytes(k.as_slice().try_into().unwrap()))
            .collect();
        assert_eq!(scanned_keys, keys[190..].to_vec());

        for &k in &keys[190..] {
            assert_eq!(tree.delete(1, &k.to_be_bytes()).unwrap(), Some(k.to_be_bytes().to_vec()));
        }
        assert_eq!(tree.scan(None, None).unwrap().len(), 0);
        let root_kind = pool.pin(tree.root()).unwrap().kind;
        pool.unpin(tree.root(), false);
        assert_eq!(root_kind, PageKind::BTreeLeaf, "root must collapse back to a leaf once emptied");
    }

    #[test]
    fn reopen_by_root_page_id_sees_same_data() {
        let dir = tempdir().unwrap();
        let pool = new_pool(dir.path());
        let root = {
            let mut tree = BTree::create(&pool, 1, BTreeConfig::default()).unwrap();
            tree.insert(1, b"k", b"v").unwrap();
            tree.root()
        };
        let reopened = BTree::open(&pool, root, BTreeConfig::default());
        assert_eq!(reopened.get(b"k").unwrap(), Some(b"v".to_vec()));
    }
}
