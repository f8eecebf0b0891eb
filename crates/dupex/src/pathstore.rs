//! Compact interning of directory and file paths.

use std::path::PathBuf;
use std::sync::RwLock;

/// Sentinel parent handle for root entries.
pub const NO_PARENT: i32 = -1;

#[derive(Debug, Clone)]
struct PathNode {
    parent: i32,
    name: Box<str>,
}

#[derive(Debug, Default)]
struct Tables {
    dirs: Vec<PathNode>,
    files: Vec<PathNode>,
}

/// Parent-indexed tree store for the paths of a scan.
///
/// Directories and files live in two separate tables, so a directory and
/// a file may share an integer handle without ambiguity; every caller
/// knows which table it is talking about. A node keeps only its own name
/// and the handle of its parent directory, which makes thousands of
/// files below one directory cost a single copy of the directory names.
///
/// `add_*` and `*_path` may run concurrently under the internal lock;
/// [`PathStore::process_files`] assumes writers have gone quiet.
#[derive(Debug, Default)]
pub struct PathStore {
    inner: RwLock<Tables>,
}

impl PathStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Interns a directory under `parent` and returns its handle.
    ///
    /// Panics if `parent` is neither [`NO_PARENT`] nor a known directory
    /// handle.
    pub fn add_dir(&self, parent: i32, name: &str) -> i32 {
        let mut tables = self.inner.write().unwrap();
        tables.check_parent(parent);
        tables.dirs.push(PathNode {
            parent,
            name: name.into(),
        });
        (tables.dirs.len() - 1) as i32
    }

    /// Interns a file under `parent` and returns its handle.
    ///
    /// Panics if `parent` is neither [`NO_PARENT`] nor a known directory
    /// handle.
    pub fn add_file(&self, parent: i32, name: &str) -> i32 {
        let mut tables = self.inner.write().unwrap();
        tables.check_parent(parent);
        tables.files.push(PathNode {
            parent,
            name: name.into(),
        });
        (tables.files.len() - 1) as i32
    }

    /// Reconstructs the path of a directory by walking up its parents.
    pub fn dir_path(&self, dir: i32) -> PathBuf {
        self.inner.read().unwrap().dir_path(dir)
    }

    /// Reconstructs the path of a file by walking up its parents.
    pub fn file_path(&self, file: i32) -> PathBuf {
        let tables = self.inner.read().unwrap();
        tables.node_path(&tables.files[file as usize])
    }

    pub fn file_count(&self) -> usize {
        self.inner.read().unwrap().files.len()
    }

    /// Calls `visit` once per interned file with its handle and
    /// reconstructed path, in insertion order.
    ///
    /// The read lock is held for the whole iteration; no writer may be
    /// active concurrently.
    pub fn process_files<E>(
        &self,
        mut visit: impl FnMut(i32, PathBuf) -> Result<(), E>,
    ) -> Result<(), E> {
        let tables = self.inner.read().unwrap();
        for (index, node) in tables.files.iter().enumerate() {
            visit(index as i32, tables.node_path(node))?;
        }
        Ok(())
    }
}

impl Tables {
    fn check_parent(&self, parent: i32) {
        assert!(
            parent == NO_PARENT || (parent as usize) < self.dirs.len(),
            "unknown parent directory handle {parent}"
        );
    }

    fn dir_path(&self, dir: i32) -> PathBuf {
        self.node_path(&self.dirs[dir as usize])
    }

    fn node_path(&self, node: &PathNode) -> PathBuf {
        let mut path = if node.parent == NO_PARENT {
            PathBuf::new()
        } else {
            self.dir_path(node.parent)
        };
        path.push(&*node.name);
        path
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::Path;

    #[test]
    fn reconstructs_nested_paths() {
        let store = PathStore::new();
        let root = store.add_dir(NO_PARENT, "/mnt/data");
        let sub = store.add_dir(root, "photos");
        let file = store.add_file(sub, "a.jpg");

        assert_eq!(store.dir_path(sub), Path::new("/mnt/data/photos"));
        assert_eq!(store.file_path(file), Path::new("/mnt/data/photos/a.jpg"));
    }

    #[test]
    fn dir_and_file_handles_are_independent() {
        let store = PathStore::new();
        let root = store.add_dir(NO_PARENT, "/");
        let file = store.add_file(root, "swapfile");
        assert_eq!(root, 0);
        assert_eq!(file, 0);
        assert_eq!(store.file_path(file), Path::new("/swapfile"));
    }

    #[test]
    fn processes_files_in_insertion_order() {
        let store = PathStore::new();
        let root = store.add_dir(NO_PARENT, "/srv");
        store.add_file(root, "b");
        store.add_file(root, "a");

        let mut seen = Vec::new();
        store
            .process_files(|handle, path| {
                seen.push((handle, path));
                Ok::<_, ()>(())
            })
            .unwrap();
        assert_eq!(
            seen,
            vec![
                (0, PathBuf::from("/srv/b")),
                (1, PathBuf::from("/srv/a")),
            ]
        );
        assert_eq!(store.file_count(), 2);
    }

    #[test]
    fn process_files_propagates_errors() {
        let store = PathStore::new();
        let root = store.add_dir(NO_PARENT, "/srv");
        store.add_file(root, "a");
        let result = store.process_files(|_, _| Err("boom"));
        assert_eq!(result, Err("boom"));
    }

    #[test]
    #[should_panic(expected = "unknown parent directory handle")]
    fn rejects_unknown_parent() {
        let store = PathStore::new();
        store.add_file(7, "orphan");
    }

    #[test]
    fn concurrent_readers_and_writers() {
        use std::sync::Arc;

        let store = Arc::new(PathStore::new());
        let root = store.add_dir(NO_PARENT, "/var");
        let handles: Vec<_> = (0..4)
            .map(|i| {
                let store = Arc::clone(&store);
                std::thread::spawn(move || {
                    let file = store.add_file(root, &format!("f{i}"));
                    store.file_path(file)
                })
            })
            .collect();
        for handle in handles {
            let path = handle.join().unwrap();
            assert!(path.starts_with("/var"));
        }
        assert_eq!(store.file_count(), 4);
    }
}
