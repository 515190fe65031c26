use fuser::FUSE_ROOT_ID;
use fxhash::FxHashMap;

/// Bidirectional inode-number-to-path table for the FUSE adapter.
///
/// The overlay core is path-addressed; the kernel speaks inode numbers.
/// Bindings are created on demand during lookup/readdir and re-keyed on
/// rename so a directory move carries its whole subtree. Inode numbers are
/// never recycled within a mount.
pub(crate) struct InodeMap {
    paths: FxHashMap<u64, String>,
    inos: FxHashMap<String, u64>,
    next: u64,
}

impl InodeMap {
    pub fn new() -> Self {
        let mut map = InodeMap {
            paths: FxHashMap::default(),
            inos: FxHashMap::default(),
            // Inode 1 is reserved for the root directory
            next: FUSE_ROOT_ID + 1,
        };
        map.paths.insert(FUSE_ROOT_ID, String::new());
        map.inos.insert(String::new(), FUSE_ROOT_ID);
        map
    }

    pub fn path_of(&self, ino: u64) -> Option<&str> {
        self.paths.get(&ino).map(String::as_str)
    }

    /// The inode bound to `path`, allocating a fresh one on first sight.
    pub fn bind(&mut self, path: &str) -> u64 {
        if let Some(&ino) = self.inos.get(path) {
            return ino;
        }
        let ino = self.next;
        self.next = self.next.wrapping_add(1);
        self.paths.insert(ino, path.to_string());
        self.inos.insert(path.to_string(), ino);
        ino
    }

    pub fn unbind(&mut self, path: &str) {
        if let Some(ino) = self.inos.remove(path) {
            self.paths.remove(&ino);
        }
    }

    /// Re-key `old` and everything under it to live below `new`. Inode
    /// numbers are stable across the move; only the path side changes.
    pub fn rename_subtree(&mut self, old: &str, new: &str) {
        let prefix = format!("{}/", old);
        let moved: Vec<(u64, String)> = self
            .inos
            .iter()
            .filter(|(p, _)| p.as_str() == old || p.starts_with(&prefix))
            .map(|(p, &ino)| (ino, p.clone()))
            .collect();

        for (ino, old_path) in moved {
            let new_path = format!("{}{}", new, &old_path[old.len()..]);
            self.inos.remove(&old_path);
            // An existing binding at the destination is displaced; rename
            // overwrites.
            if let Some(displaced) = self.inos.insert(new_path.clone(), ino) {
                self.paths.remove(&displaced);
            }
            self.paths.insert(ino, new_path);
        }
    }

    #[cfg(test)]
    pub fn len(&self) -> usize {
        self.paths.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_root_is_preset() {
        let map = InodeMap::new();
        assert_eq!(map.path_of(FUSE_ROOT_ID), Some(""));
    }

    #[test]
    fn test_bind_is_stable() {
        let mut map = InodeMap::new();
        let a = map.bind("a");
        let b = map.bind("b");
        assert_ne!(a, b);
        assert_eq!(map.bind("a"), a);
        assert_eq!(map.path_of(a), Some("a"));
    }

    #[test]
    fn test_unbind_forgets_both_sides() {
        let mut map = InodeMap::new();
        let a = map.bind("a");
        map.unbind("a");
        assert_eq!(map.path_of(a), None);
        assert_ne!(map.bind("a"), a, "a fresh binding gets a fresh inode");
    }

    #[test]
    fn test_rename_subtree_rekeys_descendants() {
        let mut map = InodeMap::new();
        let d = map.bind("d");
        let x = map.bind("d/x");
        let deep = map.bind("d/sub/y");
        let other = map.bind("dx"); // shares the prefix string, not the path

        map.rename_subtree("d", "e");

        assert_eq!(map.path_of(d), Some("e"));
        assert_eq!(map.path_of(x), Some("e/x"));
        assert_eq!(map.path_of(deep), Some("e/sub/y"));
        assert_eq!(map.path_of(other), Some("dx"));
        assert_eq!(map.bind("e/x"), x);
    }

    #[test]
    fn test_rename_subtree_displaces_destination() {
        let mut map = InodeMap::new();
        let a = map.bind("a");
        let b = map.bind("b");
        map.rename_subtree("a", "b");
        assert_eq!(map.path_of(a), Some("b"));
        assert_eq!(map.path_of(b), None);
        assert_eq!(map.len(), 2); // root + moved binding
    }
}
