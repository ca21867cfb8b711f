//! The in-memory tree builder used while committing and while merging
//! OCI-style layers.
//!
//! Nodes exclusively own their children; there are no parent
//! back-pointers. Operations that need to touch an ancestor's cache
//! take the full path and invalidate on the way down rather than
//! walking back up.

use crate::codec::validate_name;
use crate::error::CoreError;
use crate::objects::Checksum;
use std::collections::BTreeMap;

/// The OCI-style opaque-directory marker: clears every entry of the
/// directory it appears in.
const OPAQUE_WHITEOUT: &str = ".wh..wh..opq";
/// Prefix marking a whiteout entry.
const WHITEOUT_PREFIX: &str = ".wh.";

/// A single in-memory directory node: a cached content checksum, a
/// cached metadata checksum, and the name-keyed file and child maps.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct MutableTree {
    content_checksum: Option<Checksum>,
    metadata_checksum: Option<Checksum>,
    files: BTreeMap<String, Checksum>,
    dirs: BTreeMap<String, MutableTree>,
}

/// The result of a [`MutableTree::lookup`].
#[derive(Debug, Clone, Copy)]
pub enum Lookup<'a> {
    /// A file's checksum.
    File(Checksum),
    /// A child directory node.
    Dir(&'a MutableTree),
}

impl MutableTree {
    /// A fresh, empty node.
    pub fn new() -> Self {
        Self::default()
    }

    /// This node's cached metadata (dirmeta) checksum, if set.
    pub fn metadata_checksum(&self) -> Option<Checksum> {
        self.metadata_checksum
    }

    /// Set this node's metadata checksum, e.g. from importer-provided
    /// uid/gid/mode/xattrs once the corresponding dirmeta is written.
    pub fn set_metadata_checksum(&mut self, checksum: Checksum) {
        self.metadata_checksum = Some(checksum);
    }

    /// The file entries directly in this node.
    pub fn files(&self) -> &BTreeMap<String, Checksum> {
        &self.files
    }

    /// The child directory entries directly in this node.
    pub fn dirs(&self) -> &BTreeMap<String, MutableTree> {
        &self.dirs
    }

    fn invalidate(&mut self) {
        self.content_checksum = None;
    }

    /// If the cached content checksum is still valid, return it;
    /// otherwise `None`, signaling the serializer that a rewrite of
    /// this node (and its dirtree) is needed. This node's own cache
    /// does not reflect descendant validity — the serializer recurses
    /// into children that report `None` themselves.
    pub fn get_content_checksum(&self) -> Option<Checksum> {
        self.content_checksum
    }

    /// Record the content checksum the serializer computed for this
    /// node's current `files`/`dirs`.
    pub fn set_content_checksum(&mut self, checksum: Checksum) {
        self.content_checksum = Some(checksum);
    }

    /// Bind `name` to a file checksum. Invalidates this node's cache.
    /// Rejects a `name` that collides with an existing subdirectory.
    pub fn replace_file(&mut self, name: &str, checksum: Checksum) -> Result<(), CoreError> {
        validate_name(name)?;
        if self.dirs.contains_key(name) {
            return Err(CoreError::invalid_format(format!("{name} is a directory, not a file")));
        }
        self.files.insert(name.to_string(), checksum);
        self.invalidate();
        Ok(())
    }

    /// Return the child named `name`, creating an empty one if absent.
    /// Rejects a `name` already bound to a file.
    pub fn ensure_dir(&mut self, name: &str) -> Result<&mut MutableTree, CoreError> {
        validate_name(name)?;
        if self.files.contains_key(name) {
            return Err(CoreError::invalid_format(format!("{name} is a file, not a directory")));
        }
        let created = !self.dirs.contains_key(name);
        let child = self.dirs.entry(name.to_string()).or_default();
        if created {
            self.content_checksum = None;
        }
        Ok(child)
    }

    /// Look up a direct child by name.
    pub fn lookup(&self, name: &str) -> Option<Lookup<'_>> {
        if let Some(checksum) = self.files.get(name) {
            return Some(Lookup::File(*checksum));
        }
        self.dirs.get(name).map(Lookup::Dir)
    }

    /// Walk a path of directory components, creating any that are
    /// absent, and setting each freshly created node's metadata
    /// checksum to `metadata_checksum`. Used by importers laying out a
    /// tree path by path.
    pub fn ensure_parent_dirs(
        &mut self,
        components: &[&str],
        metadata_checksum: Checksum,
    ) -> Result<&mut MutableTree, CoreError> {
        let mut node = self;
        for component in components {
            validate_name(component)?;
            if node.files.contains_key(*component) {
                return Err(CoreError::invalid_format(format!("{component} is a file, not a directory")));
            }
            let created = !node.dirs.contains_key(*component);
            let child = node.dirs.entry(component.to_string()).or_default();
            if created {
                child.metadata_checksum = Some(metadata_checksum);
                node.content_checksum = None;
            }
            node = child;
        }
        Ok(node)
    }

    /// Pure lookup along a path of directory components; fails if any
    /// segment is absent.
    pub fn walk(&self, components: &[&str]) -> Result<&MutableTree, CoreError> {
        let mut node = self;
        for component in components {
            node = node
                .dirs
                .get(*component)
                .ok_or_else(|| CoreError::not_found(format!("tree path component {component}")))?;
        }
        Ok(node)
    }

    /// Merge `other`, an OCI-style layer, into `self`. Runs the
    /// whiteout pass first, then the apply pass, then adopts `other`'s
    /// metadata checksum.
    pub fn merge_layer(&mut self, other: &MutableTree) {
        self.apply_whiteouts(other);
        self.apply_layer(other);
    }

    fn apply_whiteouts(&mut self, other: &MutableTree) {
        for name in other.files.keys() {
            if name == OPAQUE_WHITEOUT {
                if !self.files.is_empty() || !self.dirs.is_empty() {
                    self.files.clear();
                    self.dirs.clear();
                    self.invalidate();
                }
                continue;
            }
            if let Some(target) = name.strip_prefix(WHITEOUT_PREFIX) {
                let removed_file = self.files.remove(target).is_some();
                let removed_dir = self.dirs.remove(target).is_some();
                if removed_file || removed_dir {
                    self.invalidate();
                }
            }
        }
        for (name, other_child) in &other.dirs {
            if let Some(self_child) = self.dirs.get_mut(name) {
                self_child.apply_whiteouts(other_child);
            }
        }
    }

    fn apply_layer(&mut self, other: &MutableTree) {
        for (name, checksum) in &other.files {
            if name.starts_with(WHITEOUT_PREFIX) {
                continue;
            }
            self.dirs.remove(name);
            self.files.insert(name.clone(), *checksum);
        }
        for (name, other_child) in &other.dirs {
            self.files.remove(name);
            let self_child = self.dirs.entry(name.clone()).or_default();
            self_child.apply_layer(other_child);
        }
        if let Some(m) = other.metadata_checksum {
            self.metadata_checksum = Some(m);
        }
        self.invalidate();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn csum(byte: u8) -> Checksum {
        Checksum::from_bytes([byte; 32])
    }

    #[test]
    fn ensure_dir_on_new_name_is_empty_with_no_cached_checksum() {
        let mut root = MutableTree::new();
        let child = root.ensure_dir("etc").unwrap();
        assert!(child.files().is_empty());
        assert!(child.dirs().is_empty());
        assert!(child.get_content_checksum().is_none());
    }

    #[test]
    fn replace_file_rejects_directory_collision() {
        let mut root = MutableTree::new();
        root.ensure_dir("etc").unwrap();
        assert!(root.replace_file("etc", csum(1)).is_err());
    }

    #[test]
    fn ensure_dir_rejects_file_collision() {
        let mut root = MutableTree::new();
        root.replace_file("passwd", csum(1)).unwrap();
        assert!(root.ensure_dir("passwd").is_err());
    }

    #[test]
    fn rejects_bad_component_names() {
        let mut root = MutableTree::new();
        for bad in [".", "..", "a/b", ""] {
            assert!(root.replace_file(bad, csum(1)).is_err());
        }
    }

    #[test]
    fn merging_empty_layer_is_a_noop() {
        let mut tree = MutableTree::new();
        tree.replace_file("a", csum(1)).unwrap();
        tree.ensure_dir("sub").unwrap().replace_file("b", csum(2)).unwrap();
        let before = tree.clone();

        let empty = MutableTree::new();
        tree.merge_layer(&empty);

        assert_eq!(tree.files(), before.files());
        assert_eq!(tree.dirs(), before.dirs());
    }

    /// A whiteout removes the shadowed entry.
    #[test]
    fn whiteout_merge() {
        let mut a = MutableTree::new();
        let etc = a.ensure_dir("etc").unwrap();
        etc.replace_file("passwd", csum(1)).unwrap();
        etc.replace_file("shadow", csum(2)).unwrap();

        let mut layer = MutableTree::new();
        let layer_etc = layer.ensure_dir("etc").unwrap();
        layer_etc.replace_file(".wh.shadow", csum(0)).unwrap();

        a.merge_layer(&layer);

        let etc = match a.lookup("etc").unwrap() {
            Lookup::Dir(d) => d,
            _ => panic!("expected dir"),
        };
        assert!(matches!(etc.lookup("passwd"), Some(Lookup::File(_))));
        assert!(etc.lookup("shadow").is_none());
    }

    #[test]
    fn opaque_whiteout_clears_directory() {
        let mut a = MutableTree::new();
        let etc = a.ensure_dir("etc").unwrap();
        etc.replace_file("passwd", csum(1)).unwrap();
        etc.ensure_dir("sub").unwrap();

        let mut layer = MutableTree::new();
        layer.ensure_dir("etc").unwrap().replace_file(OPAQUE_WHITEOUT, csum(0)).unwrap();
        a.merge_layer(&layer);

        let etc = match a.lookup("etc").unwrap() {
            Lookup::Dir(d) => d,
            _ => panic!("expected dir"),
        };
        assert!(etc.files().is_empty());
        assert!(etc.dirs().is_empty());
    }

    #[test]
    fn apply_pass_shadows_directory_with_file_and_vice_versa() {
        let mut a = MutableTree::new();
        a.ensure_dir("x").unwrap();

        let mut layer = MutableTree::new();
        layer.replace_file("x", csum(9)).unwrap();
        a.merge_layer(&layer);
        assert!(matches!(a.lookup("x"), Some(Lookup::File(_))));

        let mut a = MutableTree::new();
        a.replace_file("y", csum(1)).unwrap();
        let mut layer = MutableTree::new();
        layer.ensure_dir("y").unwrap().replace_file("inner", csum(2)).unwrap();
        a.merge_layer(&layer);
        assert!(matches!(a.lookup("y"), Some(Lookup::Dir(_))));
    }

    #[test]
    fn merge_adopts_metadata_checksum() {
        let mut a = MutableTree::new();
        a.set_metadata_checksum(csum(1));
        let mut layer = MutableTree::new();
        layer.set_metadata_checksum(csum(2));
        a.merge_layer(&layer);
        assert_eq!(a.metadata_checksum(), Some(csum(2)));
    }

    #[test]
    fn merge_preserves_metadata_checksum_when_layer_has_none() {
        let mut a = MutableTree::new();
        a.set_metadata_checksum(csum(1));
        let layer = MutableTree::new();
        a.merge_layer(&layer);
        assert_eq!(a.metadata_checksum(), Some(csum(1)));
    }

    #[test]
    fn ensure_parent_dirs_sets_metadata_only_on_creation() {
        let mut root = MutableTree::new();
        root.ensure_parent_dirs(&["a", "b"], csum(1)).unwrap();
        assert_eq!(root.walk(&["a"]).unwrap().metadata_checksum(), Some(csum(1)));
        assert_eq!(root.walk(&["a", "b"]).unwrap().metadata_checksum(), Some(csum(1)));

        root.walk(&["a"]).unwrap();
        root.ensure_parent_dirs(&["a"], csum(9)).unwrap();
        assert_eq!(root.walk(&["a"]).unwrap().metadata_checksum(), Some(csum(1)));
    }

    #[test]
    fn walk_fails_on_missing_segment() {
        let root = MutableTree::new();
        assert!(root.walk(&["nope"]).is_err());
    }
}
