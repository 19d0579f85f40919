//! Tree resolution helpers shared by the revision index and the
//! versioned filesystem.

use gix_hash::ObjectId;

use crate::error::Result;
use crate::gitprops::{AttrRules, PropertyStack};
use crate::odb::{read_blob, read_tree, ObjectStore, Tree, TreeEntry};
use crate::paths;

pub const ATTRIBUTES_FILE: &str = ".gitattributes";
pub const IGNORE_FILE: &str = ".gitignore";

/// Resolution of a path inside one tree.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum NodeRef {
    Dir { tree: ObjectId },
    File { blob: ObjectId, mode: u32 },
}

impl NodeRef {
    pub fn is_dir(&self) -> bool {
        matches!(self, NodeRef::Dir { .. })
    }

    pub fn object_id(&self) -> ObjectId {
        match self {
            NodeRef::Dir { tree } => *tree,
            NodeRef::File { blob, .. } => *blob,
        }
    }

    fn from_entry(entry: &TreeEntry) -> NodeRef {
        if entry.is_dir() {
            NodeRef::Dir { tree: entry.oid }
        } else {
            NodeRef::File {
                blob: entry.oid,
                mode: entry.mode,
            }
        }
    }
}

/// Resolves `path` against the tree rooted at `root`.
pub async fn resolve(
    store: &dyn ObjectStore,
    root: ObjectId,
    path: &str,
) -> Result<Option<NodeRef>> {
    let mut node = NodeRef::Dir { tree: root };
    for segment in paths::segments(path) {
        let NodeRef::Dir { tree } = node else {
            return Ok(None);
        };
        let tree = read_tree(store, tree).await?;
        match tree.get(segment) {
            Some(entry) => node = NodeRef::from_entry(entry),
            None => return Ok(None),
        }
    }
    Ok(Some(node))
}

/// Loads the `.gitattributes` layers that govern files inside `dir`
/// (the root file first, then each directory down to `dir`).
pub async fn load_prop_stack(
    store: &dyn ObjectStore,
    root: ObjectId,
    dir: &str,
) -> Result<PropertyStack> {
    let mut stack = PropertyStack::default();
    let mut tree_id = root;
    let mut current = "/".to_string();
    loop {
        let tree = read_tree(store, tree_id).await?;
        if let Some(entry) = tree.get(ATTRIBUTES_FILE) {
            if !entry.is_dir() {
                let content = read_blob(store, entry.oid).await?;
                let rules = AttrRules::parse(&content);
                if !rules.is_empty() {
                    stack.push(current.clone(), rules);
                }
            }
        }
        let rest = if dir == "/" {
            ""
        } else {
            dir.strip_prefix(current.trim_end_matches('/'))
                .unwrap_or("")
                .trim_start_matches('/')
        };
        let Some(next) = rest.split('/').next().filter(|s| !s.is_empty()) else {
            return Ok(stack);
        };
        match tree.get(next) {
            Some(entry) if entry.is_dir() => {
                current = paths::join(&current, next);
                tree_id = entry.oid;
            }
            _ => return Ok(stack),
        }
    }
}

/// Invokes `visit` for every file below `root`, with absolute paths
/// anchored at `base`.
pub async fn walk_files(
    store: &dyn ObjectStore,
    root: ObjectId,
    base: &str,
    visit: &mut (dyn FnMut(String, &TreeEntry) + Send),
) -> Result<()> {
    let mut queue: Vec<(String, ObjectId)> = vec![(base.to_string(), root)];
    while let Some((dir, tree_id)) = queue.pop() {
        let tree = read_tree(store, tree_id).await?;
        for entry in &tree.entries {
            let path = paths::join(&dir, &entry.name);
            if entry.is_dir() {
                queue.push((path, entry.oid));
            } else {
                visit(path, entry);
            }
        }
    }
    Ok(())
}

/// A raw difference between two trees, before copy detection.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TreeDelta {
    pub path: String,
    pub kind: DeltaKind,
    /// Blob id on the new side, for copy detection.
    pub new_blob: Option<ObjectId>,
    pub is_dir: bool,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DeltaKind {
    Added,
    Deleted,
    Modified,
    /// Kind changed at the same path (file <-> dir).
    Replaced,
}

/// Computes the raw delta between two trees. Added directories are
/// expanded into their files; deleted directories are reported as one
/// entry.
pub async fn diff_trees(
    store: &dyn ObjectStore,
    old: Option<ObjectId>,
    new: ObjectId,
) -> Result<Vec<TreeDelta>> {
    let mut out = Vec::new();
    let mut queue: Vec<(String, Option<ObjectId>, ObjectId)> =
        vec![("/".to_string(), old, new)];

    while let Some((dir, old_id, new_id)) = queue.pop() {
        if old_id == Some(new_id) {
            continue;
        }
        let old_tree = match old_id {
            Some(id) => read_tree(store, id).await?,
            None => Tree::default(),
        };
        let new_tree = read_tree(store, new_id).await?;

        for entry in &old_tree.entries {
            let path = paths::join(&dir, &entry.name);
            match new_tree.get(&entry.name) {
                None => out.push(TreeDelta {
                    path,
                    kind: DeltaKind::Deleted,
                    new_blob: None,
                    is_dir: entry.is_dir(),
                }),
                Some(new_entry) if entry.is_dir() != new_entry.is_dir() => {
                    out.push(TreeDelta {
                        path: path.clone(),
                        kind: DeltaKind::Replaced,
                        new_blob: (!new_entry.is_dir()).then_some(new_entry.oid),
                        is_dir: new_entry.is_dir(),
                    });
                    if new_entry.is_dir() {
                        record_added_tree(store, new_entry.oid, &path, &mut out).await?;
                    }
                }
                Some(new_entry) => {
                    if entry.oid == new_entry.oid && entry.mode == new_entry.mode {
                        continue;
                    }
                    if entry.is_dir() {
                        queue.push((path, Some(entry.oid), new_entry.oid));
                    } else {
                        out.push(TreeDelta {
                            path,
                            kind: DeltaKind::Modified,
                            new_blob: Some(new_entry.oid),
                            is_dir: false,
                        });
                    }
                }
            }
        }
        for entry in &new_tree.entries {
            if old_tree.get(&entry.name).is_some() {
                continue;
            }
            let path = paths::join(&dir, &entry.name);
            if entry.is_dir() {
                out.push(TreeDelta {
                    path: path.clone(),
                    kind: DeltaKind::Added,
                    new_blob: None,
                    is_dir: true,
                });
                record_added_tree(store, entry.oid, &path, &mut out).await?;
            } else {
                out.push(TreeDelta {
                    path,
                    kind: DeltaKind::Added,
                    new_blob: Some(entry.oid),
                    is_dir: false,
                });
            }
        }
    }
    out.sort_by(|a, b| a.path.cmp(&b.path));
    Ok(out)
}

async fn record_added_tree(
    store: &dyn ObjectStore,
    tree: ObjectId,
    base: &str,
    out: &mut Vec<TreeDelta>,
) -> Result<()> {
    let mut queue = vec![(base.to_string(), tree)];
    while let Some((dir, tree_id)) = queue.pop() {
        let tree = read_tree(store, tree_id).await?;
        for entry in &tree.entries {
            let path = paths::join(&dir, &entry.name);
            if entry.is_dir() {
                out.push(TreeDelta {
                    path: path.clone(),
                    kind: DeltaKind::Added,
                    new_blob: None,
                    is_dir: true,
                });
                queue.push((path, entry.oid));
            } else {
                out.push(TreeDelta {
                    path,
                    kind: DeltaKind::Added,
                    new_blob: Some(entry.oid),
                    is_dir: false,
                });
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::odb::{mode, write_tree, MemoryStore};
    use gix_object::Kind;

    async fn blob(store: &dyn ObjectStore, data: &[u8]) -> ObjectId {
        store.write(Kind::Blob, data).await.unwrap()
    }

    async fn tree_of(store: &dyn ObjectStore, entries: Vec<TreeEntry>) -> ObjectId {
        write_tree(store, &Tree { entries }).await.unwrap()
    }

    fn file(name: &str, oid: ObjectId) -> TreeEntry {
        TreeEntry { mode: mode::FILE, name: name.into(), oid }
    }

    fn dir(name: &str, oid: ObjectId) -> TreeEntry {
        TreeEntry { mode: mode::DIR, name: name.into(), oid }
    }

    #[tokio::test]
    async fn resolve_walks_nested_paths() {
        let store = MemoryStore::new();
        let leaf = blob(store.as_ref(), b"content").await;
        let sub = tree_of(store.as_ref(), vec![file("b.txt", leaf)]).await;
        let root = tree_of(store.as_ref(), vec![dir("a", sub)]).await;

        let node = resolve(store.as_ref(), root, "/a/b.txt").await.unwrap();
        assert_eq!(node, Some(NodeRef::File { blob: leaf, mode: mode::FILE }));
        assert!(resolve(store.as_ref(), root, "/a").await.unwrap().unwrap().is_dir());
        assert_eq!(resolve(store.as_ref(), root, "/missing").await.unwrap(), None);
        // A file cannot have children.
        assert_eq!(resolve(store.as_ref(), root, "/a/b.txt/c").await.unwrap(), None);
    }

    #[tokio::test]
    async fn prop_stack_layers_root_to_leaf() {
        let store = MemoryStore::new();
        let root_attrs = blob(store.as_ref(), b"*.z filter=gzip\n").await;
        let sub_attrs = blob(store.as_ref(), b"*.z -filter\n").await;
        let sub = tree_of(store.as_ref(), vec![
            TreeEntry { mode: mode::FILE, name: ATTRIBUTES_FILE.into(), oid: sub_attrs },
        ])
        .await;
        let root = tree_of(store.as_ref(), vec![
            TreeEntry { mode: mode::FILE, name: ATTRIBUTES_FILE.into(), oid: root_attrs },
            dir("sub", sub),
        ])
        .await;

        let stack = load_prop_stack(store.as_ref(), root, "/").await.unwrap();
        assert_eq!(stack.filter_chain_for("/data.z").cache_key(), "gzip");

        let stack = load_prop_stack(store.as_ref(), root, "/sub").await.unwrap();
        assert!(stack.filter_chain_for("/sub/data.z").is_identity());
    }

    #[tokio::test]
    async fn diff_reports_adds_deletes_modifies() {
        let store = MemoryStore::new();
        let one = blob(store.as_ref(), b"one").await;
        let two = blob(store.as_ref(), b"two").await;

        let old_root = tree_of(store.as_ref(), vec![
            file("keep.txt", one),
            file("gone.txt", one),
            file("edit.txt", one),
        ])
        .await;
        let sub = tree_of(store.as_ref(), vec![file("new.txt", two)]).await;
        let new_root = tree_of(store.as_ref(), vec![
            file("keep.txt", one),
            file("edit.txt", two),
            dir("subdir", sub),
        ])
        .await;

        let delta = diff_trees(store.as_ref(), Some(old_root), new_root).await.unwrap();
        let by_path: Vec<(&str, DeltaKind)> =
            delta.iter().map(|d| (d.path.as_str(), d.kind)).collect();
        assert_eq!(
            by_path,
            vec![
                ("/edit.txt", DeltaKind::Modified),
                ("/gone.txt", DeltaKind::Deleted),
                ("/subdir", DeltaKind::Added),
                ("/subdir/new.txt", DeltaKind::Added),
            ]
        );
    }

    #[tokio::test]
    async fn diff_reports_kind_change_as_replaced() {
        let store = MemoryStore::new();
        let data = blob(store.as_ref(), b"x").await;
        let old_root = tree_of(store.as_ref(), vec![file("node", data)]).await;
        let inner = tree_of(store.as_ref(), vec![file("child", data)]).await;
        let new_root = tree_of(store.as_ref(), vec![dir("node", inner)]).await;

        let delta = diff_trees(store.as_ref(), Some(old_root), new_root).await.unwrap();
        assert_eq!(delta[0].path, "/node");
        assert_eq!(delta[0].kind, DeltaKind::Replaced);
        assert!(delta.iter().any(|d| d.path == "/node/child"));
    }
}
