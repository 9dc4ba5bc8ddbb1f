use super::{EntryKind, Manifest, SourceEntry, SourceTree};

/// Result of comparing a tree with the prior manifest.
#[derive(Debug, Default, Clone)]
pub struct Diff {
    /// Entries to write, in manifest key order.
    pub to_transfer: Vec<SourceEntry>,
    pub unchanged: Vec<String>,
}

impl Diff {
    pub fn transfer_bytes(&self) -> u64 {
        self.to_transfer.iter().map(|e| e.size).sum()
    }
}

/// Classify every entry of `tree` as changed or unchanged.
///
/// Without a prior manifest everything is transferred. An entry is changed
/// when it is new, its kind differs, a symlink target differs, or a regular
/// file's size or mtime differs.
pub fn diff(tree: &SourceTree, prior: Option<&Manifest>) -> Diff {
    let mut result = Diff::default();

    for (name, entry) in tree {
        let unchanged = prior
            .and_then(|m| m.files.get(name))
            .map(|old| match (&entry.kind, &old.kind) {
                (EntryKind::File, EntryKind::File) => {
                    old.size == entry.size && old.mtime == entry.mtime
                }
                (EntryKind::Symlink { target: now }, EntryKind::Symlink { target: then }) => {
                    now == then
                }
                _ => false,
            })
            .unwrap_or(false);

        if unchanged {
            result.unchanged.push(name.clone());
        } else {
            result.to_transfer.push(entry.clone());
        }
    }

    result
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::Strategy;
    use crate::snapshot::ManifestEntry;
    use std::path::PathBuf;

    fn entry(name: &str, kind: EntryKind, size: u64, mtime: i64) -> SourceEntry {
        SourceEntry {
            name: name.to_string(),
            path: PathBuf::from(format!("/{}", name)),
            kind,
            size,
            mtime,
        }
    }

    fn manifest_of(tree: &SourceTree) -> Manifest {
        let mut manifest = Manifest::new("daily", None, Strategy::Direct);
        for (name, e) in tree {
            manifest.files.insert(
                name.clone(),
                ManifestEntry {
                    kind: e.kind.clone(),
                    size: e.size,
                    mtime: e.mtime,
                    checksum: None,
                    volume_id: "VOL001".to_string(),
                    offset: 0,
                    run_id: "r1".to_string(),
                },
            );
        }
        manifest
    }

    #[test]
    fn test_first_run_transfers_everything() {
        let mut tree = SourceTree::new();
        tree.insert("a".into(), entry("a", EntryKind::File, 1, 1));
        tree.insert("b".into(), entry("b", EntryKind::File, 1, 1));

        let d = diff(&tree, None);
        assert_eq!(d.to_transfer.len(), 2);
        assert!(d.unchanged.is_empty());
    }

    #[test]
    fn test_mtime_size_and_symlink_changes() {
        let mut tree = SourceTree::new();
        tree.insert("a".into(), entry("a", EntryKind::File, 1, 1));
        tree.insert("b".into(), entry("b", EntryKind::File, 1, 1));
        tree.insert("c".into(), entry("c", EntryKind::File, 1, 1));
        tree.insert(
            "l".into(),
            entry("l", EntryKind::Symlink { target: "a".into() }, 0, 1),
        );
        let prior = manifest_of(&tree);

        tree.get_mut("a").unwrap().mtime = 2;
        tree.get_mut("c").unwrap().size = 9;
        tree.get_mut("l").unwrap().kind = EntryKind::Symlink { target: "b".into() };
        tree.insert("new".into(), entry("new", EntryKind::File, 1, 1));

        let d = diff(&tree, Some(&prior));
        let names: Vec<&str> = d.to_transfer.iter().map(|e| e.name.as_str()).collect();
        assert_eq!(names, vec!["a", "c", "l", "new"]);
        assert_eq!(d.unchanged, vec!["b".to_string()]);
        assert_eq!(d.transfer_bytes(), 1 + 9 + 0 + 1);
    }
}
