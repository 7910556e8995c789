use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::fs::{self, OpenOptions};
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("store entry '{0}' does not exist")]
    NotFound(String),
    #[error("store entry name '{0}' must not contain path separators")]
    InvalidName(String),
    #[error("store io failed")]
    Io(#[from] std::io::Error),
}

/// shared working directory used as a multi-writer, lock-free data store
///
/// Exclusive creation is the only synchronization primitive: for any path
/// "create if not exists" admits exactly one winner among concurrent
/// callers. No entry is ever overwritten, every mutation is either
/// create-exclusive or delete.
#[derive(Debug, Clone)]
pub enum Store {
    /// directory on a filesystem reachable by every worker; relies on
    /// O_EXCL making creation indivisible
    Dir(PathBuf),
    /// process-local map with the same semantics, for deterministic race
    /// tests and dry runs
    Mem(MemStore),
}

#[derive(Debug, Clone, Default)]
pub struct MemStore {
    entries: Arc<Mutex<BTreeMap<String, Vec<u8>>>>,
}

impl Store {
    pub fn dir(path: impl Into<PathBuf>) -> Result<Self, StoreError> {
        let path = path.into();
        fs::create_dir_all(&path)?;

        // workers may start in a different directory than the driver
        Ok(Self::Dir(fs::canonicalize(path)?))
    }

    pub fn memory() -> Self {
        Self::Mem(MemStore::default())
    }

    pub fn dir_path(&self) -> Option<&Path> {
        match self {
            Self::Dir(path) => Some(path),
            Self::Mem(_) => None,
        }
    }

    // entry names must stay flat, they double as identities
    fn checked(name: &str) -> Result<&str, StoreError> {
        if name.is_empty() || name == "." || name == ".." || name.contains(['/', '\\']) {
            return Err(StoreError::InvalidName(name.to_owned()));
        }

        Ok(name)
    }

    /// create-if-not-exists; `false` means another writer already won this
    /// path and the contents were left untouched
    pub fn create_exclusive(&self, name: &str, contents: &[u8]) -> Result<bool, StoreError> {
        let name = Self::checked(name)?;
        match self {
            Self::Dir(dir) => {
                match OpenOptions::new()
                    .write(true)
                    .create_new(true)
                    .open(dir.join(name))
                {
                    Ok(mut file) => {
                        file.write_all(contents)?;
                        Ok(true)
                    }
                    Err(error) if error.kind() == ErrorKind::AlreadyExists => Ok(false),
                    Err(error) => Err(error.into()),
                }
            }
            Self::Mem(mem) => {
                let mut entries = mem.entries.lock();
                if entries.contains_key(name) {
                    return Ok(false);
                }
                entries.insert(name.to_owned(), contents.to_vec());

                Ok(true)
            }
        }
    }

    pub fn exists(&self, name: &str) -> Result<bool, StoreError> {
        let name = Self::checked(name)?;
        match self {
            Self::Dir(dir) => Ok(dir.join(name).exists()),
            Self::Mem(mem) => Ok(mem.entries.lock().contains_key(name)),
        }
    }

    pub fn read(&self, name: &str) -> Result<Vec<u8>, StoreError> {
        let name = Self::checked(name)?;
        match self {
            Self::Dir(dir) => match fs::read(dir.join(name)) {
                Ok(bytes) => Ok(bytes),
                Err(error) if error.kind() == ErrorKind::NotFound => {
                    Err(StoreError::NotFound(name.to_owned()))
                }
                Err(error) => Err(error.into()),
            },
            Self::Mem(mem) => mem
                .entries
                .lock()
                .get(name)
                .cloned()
                .ok_or_else(|| StoreError::NotFound(name.to_owned())),
        }
    }

    /// entry names ending in `suffix`, sorted for determinism; enumeration
    /// order carries no priority
    pub fn list(&self, suffix: &str) -> Result<Vec<String>, StoreError> {
        match self {
            Self::Dir(dir) => {
                let mut names = Vec::new();
                for entry in fs::read_dir(dir)? {
                    let entry = entry?;
                    if let Ok(name) = entry.file_name().into_string() {
                        if name.ends_with(suffix) {
                            names.push(name);
                        }
                    }
                }
                names.sort_unstable();

                Ok(names)
            }
            Self::Mem(mem) => Ok(mem
                .entries
                .lock()
                .keys()
                .filter(|name| name.ends_with(suffix))
                .cloned()
                .collect()),
        }
    }

    /// remove an entry; removing an absent entry is not an error
    pub fn remove(&self, name: &str) -> Result<(), StoreError> {
        let name = Self::checked(name)?;
        match self {
            Self::Dir(dir) => match fs::remove_file(dir.join(name)) {
                Ok(()) => Ok(()),
                Err(error) if error.kind() == ErrorKind::NotFound => Ok(()),
                Err(error) => Err(error.into()),
            },
            Self::Mem(mem) => {
                mem.entries.lock().remove(name);

                Ok(())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Barrier;
    use std::thread;

    static SCRATCH: AtomicU32 = AtomicU32::new(0);

    fn scratch_store() -> Store {
        let dir = std::env::temp_dir().join(format!(
            "arrayherd-store-{}-{}",
            std::process::id(),
            SCRATCH.fetch_add(1, Ordering::SeqCst)
        ));

        Store::dir(dir).unwrap()
    }

    fn exercise_round_trip(store: &Store) {
        assert!(store.create_exclusive("a-task.json", b"{}").unwrap());
        assert!(!store.create_exclusive("a-task.json", b"other").unwrap());

        // the loser must not clobber the winner's contents
        assert_eq!(store.read("a-task.json").unwrap(), b"{}");
        assert!(store.exists("a-task.json").unwrap());

        assert!(store.create_exclusive("b-worker.txt", b"1").unwrap());
        assert_eq!(store.list("-task.json").unwrap(), vec!["a-task.json"]);

        store.remove("a-task.json").unwrap();
        store.remove("a-task.json").unwrap();
        assert!(!store.exists("a-task.json").unwrap());
        assert!(matches!(
            store.read("a-task.json"),
            Err(StoreError::NotFound(_))
        ));
    }

    #[test]
    fn memory_round_trip() {
        exercise_round_trip(&Store::memory());
    }

    #[test]
    fn directory_round_trip() {
        exercise_round_trip(&scratch_store());
    }

    #[test]
    fn names_must_stay_flat() {
        let store = Store::memory();

        for name in ["", ".", "..", "a/b", "a\\b"] {
            assert!(matches!(
                store.create_exclusive(name, b""),
                Err(StoreError::InvalidName(_))
            ));
        }
    }

    fn exercise_single_winner(store: Store) {
        let racers = 8;
        let barrier = Arc::new(Barrier::new(racers));

        let handles: Vec<_> = (0..racers)
            .map(|index| {
                let store = store.clone();
                let barrier = Arc::clone(&barrier);
                thread::spawn(move || {
                    barrier.wait();
                    store
                        .create_exclusive("contested-worker.txt", index.to_string().as_bytes())
                        .unwrap()
                })
            })
            .collect();

        let winners = handles
            .into_iter()
            .map(|handle| handle.join().unwrap())
            .filter(|won| *won)
            .count();

        assert_eq!(winners, 1);
    }

    #[test]
    fn memory_creation_admits_a_single_winner() {
        exercise_single_winner(Store::memory());
    }

    #[test]
    fn directory_creation_admits_a_single_winner() {
        exercise_single_winner(scratch_store());
    }
}
