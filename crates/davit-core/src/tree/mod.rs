pub mod node;

use serde::{Deserialize, Serialize};

use crate::error::{DavitError, Result};
use crate::id::Id;
use crate::pack::BlobKind;
use crate::repo::{Repository, SavedBlob};

pub use node::{Attribute, Node, NodeKind};

/// A directory listing: nodes sorted by name (byte-wise), serialized as
/// canonical JSON and stored as a tree blob. Trees are not split; a tree blob
/// may be arbitrarily long.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct Tree {
    pub nodes: Vec<Node>,
}

impl Tree {
    pub fn new() -> Self {
        Tree { nodes: Vec::new() }
    }

    /// Insert a node, keeping the byte-wise name order that tree-id
    /// reproducibility depends on. Duplicate names are an error.
    pub fn insert(&mut self, node: Node) -> Result<()> {
        node::validate_node_name(&node.name)?;
        match self
            .nodes
            .binary_search_by(|n| n.name.as_bytes().cmp(node.name.as_bytes()))
        {
            Ok(_) => Err(DavitError::Other(format!(
                "duplicate node name '{}' in tree",
                node.name
            ))),
            Err(pos) => {
                self.nodes.insert(pos, node);
                Ok(())
            }
        }
    }

    pub fn find(&self, name: &str) -> Option<&Node> {
        self.nodes
            .binary_search_by(|n| n.name.as_bytes().cmp(name.as_bytes()))
            .ok()
            .map(|pos| &self.nodes[pos])
    }

    /// Canonical JSON encoding: fixed field order, sorted nodes.
    pub fn to_json(&self) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec(self)?)
    }

    /// Serialize and store as a tree blob; returns the save result so the
    /// caller can count new tree blobs and bytes.
    pub fn save(&self, repo: &Repository) -> Result<SavedBlob> {
        repo.save_blob(BlobKind::Tree, &self.to_json()?)
    }

    /// Load and decode a tree blob.
    pub fn load(repo: &Repository, id: &Id) -> Result<Tree> {
        let bytes = repo.load_blob(BlobKind::Tree, id)?;
        serde_json::from_slice(&bytes).map_err(|e| DavitError::Corrupt {
            kind: "tree",
            id: id.to_hex(),
            detail: format!("unparseable tree JSON: {e}"),
        })
    }
}

/// Walk the tree graph rooted at `root` depth-first, calling `visit` with
/// each node and its path relative to the root. Listing helper for ls-style
/// front-ends and the maintenance ops.
pub fn walk(
    repo: &Repository,
    root: &Id,
    visit: &mut dyn FnMut(&std::path::Path, &Node) -> Result<()>,
) -> Result<()> {
    fn walk_inner(
        repo: &Repository,
        tree_id: &Id,
        prefix: &std::path::Path,
        visit: &mut dyn FnMut(&std::path::Path, &Node) -> Result<()>,
    ) -> Result<()> {
        let tree = Tree::load(repo, tree_id)?;
        for node in &tree.nodes {
            let path = prefix.join(&node.name);
            visit(&path, node)?;
            if node.kind == NodeKind::Dir {
                if let Some(subtree) = node.subtree {
                    walk_inner(repo, &subtree, &path, visit)?;
                }
            }
        }
        Ok(())
    }
    walk_inner(repo, root, std::path::Path::new(""), visit)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::test_repo;

    #[test]
    fn insert_keeps_bytewise_order() {
        let mut tree = Tree::new();
        for name in ["zeta", "Alpha", "beta", "a", "Z"] {
            tree.insert(Node::placeholder(name, NodeKind::File)).unwrap();
        }
        let names: Vec<&str> = tree.nodes.iter().map(|n| n.name.as_str()).collect();
        // Byte-wise: uppercase sorts before lowercase.
        assert_eq!(names, vec!["Alpha", "Z", "a", "beta", "zeta"]);
        assert!(tree.find("beta").is_some());
        assert!(tree.find("missing").is_none());
    }

    #[test]
    fn duplicate_names_rejected() {
        let mut tree = Tree::new();
        tree.insert(Node::placeholder("x", NodeKind::File)).unwrap();
        assert!(tree.insert(Node::placeholder("x", NodeKind::Dir)).is_err());
    }

    #[test]
    fn serialization_is_order_independent() {
        let mut a = Tree::new();
        let mut b = Tree::new();
        for name in ["one", "two", "three"] {
            a.insert(Node::placeholder(name, NodeKind::File)).unwrap();
        }
        for name in ["three", "one", "two"] {
            b.insert(Node::placeholder(name, NodeKind::File)).unwrap();
        }
        assert_eq!(a.to_json().unwrap(), b.to_json().unwrap());
    }

    #[test]
    fn save_load_roundtrip() {
        let repo = test_repo();
        let mut tree = Tree::new();
        let mut file = Node::placeholder("file.txt", NodeKind::File);
        file.size = Some(3);
        file.content = vec![Id::hash(b"abc")];
        tree.insert(file).unwrap();

        let saved = tree.save(&repo).unwrap();
        assert!(saved.new);
        repo.flush().unwrap();

        let loaded = Tree::load(&repo, &saved.id).unwrap();
        assert_eq!(loaded, tree);
    }

    #[test]
    fn walk_visits_every_node_with_relative_paths() {
        let repo = test_repo();

        let mut sub = Tree::new();
        sub.insert(Node::placeholder("inner.txt", NodeKind::File))
            .unwrap();
        let sub_saved = sub.save(&repo).unwrap();

        let mut root = Tree::new();
        let mut dir = Node::placeholder("dir", NodeKind::Dir);
        dir.subtree = Some(sub_saved.id);
        root.insert(dir).unwrap();
        root.insert(Node::placeholder("top.txt", NodeKind::File))
            .unwrap();
        let root_saved = root.save(&repo).unwrap();
        repo.flush().unwrap();

        let mut seen: Vec<(String, NodeKind)> = Vec::new();
        walk(&repo, &root_saved.id, &mut |path, node| {
            seen.push((path.display().to_string(), node.kind));
            Ok(())
        })
        .unwrap();
        assert_eq!(
            seen,
            vec![
                ("dir".to_string(), NodeKind::Dir),
                ("dir/inner.txt".to_string(), NodeKind::File),
                ("top.txt".to_string(), NodeKind::File),
            ]
        );
    }

    #[test]
    fn identical_trees_share_one_blob() {
        let repo = test_repo();
        let mut tree = Tree::new();
        tree.insert(Node::placeholder("n", NodeKind::File)).unwrap();

        let first = tree.save(&repo).unwrap();
        let second = tree.save(&repo).unwrap();
        assert!(first.new);
        assert!(!second.new);
        assert_eq!(first.id, second.id);
    }
}
