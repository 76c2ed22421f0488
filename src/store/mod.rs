use std::{
    ffi::OsString,
    fs,
    io::{self, Write},
    path::{Path, PathBuf},
    process,
    sync::atomic::{AtomicU64, Ordering},
};

use fd_lock::RwLock as FileLock;
use parking_lot::Mutex;
use tracing::debug;

use crate::{
    config::ContentionPolicy,
    error::{LedgerError, Result},
    ledger::LedgerSnapshot,
};

static TEMP_SEQ: AtomicU64 = AtomicU64::new(0);

/// Durable home for ledger state. Implementations must replace the stored
/// snapshot atomically: a reader sees the previous snapshot or the new one.
pub trait LedgerStore: Send + Sync {
    fn load(&self) -> Result<Option<LedgerSnapshot>>;

    /// Unconditional replace. Use [`LedgerStore::update`] for read-modify-write.
    fn save(&self, snapshot: &LedgerSnapshot) -> Result<()>;

    /// Loads the stored snapshot, hands it to `apply` and saves the snapshot
    /// `apply` returns, if any, with every other `update` on the same store
    /// held off until the save is done. A busy store is waited on under
    /// `Queue` and reported as a retryable `Conflict` under `Reject`.
    fn update<R, F>(&self, contention: ContentionPolicy, apply: F) -> Result<R>
    where
        Self: Sized,
        F: FnOnce(Option<LedgerSnapshot>) -> Result<(R, Option<LedgerSnapshot>)>;
}

/// Snapshot kept as pretty JSON on disk, replaced via write-then-rename.
///
/// Writers coordinate through an advisory lock on a sibling `<name>.lock`
/// file, which also covers writers in other processes.
pub struct JsonFileStore {
    path: PathBuf,
}

impl JsonFileStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn sibling(&self, suffix: &str) -> PathBuf {
        let mut name: OsString = self
            .path
            .file_name()
            .map(|s| s.to_os_string())
            .unwrap_or_else(|| "state".into());
        name.push(suffix);
        self.path.with_file_name(name)
    }

    fn lock_path(&self) -> PathBuf {
        self.sibling(".lock")
    }

    /// Unique per call, so concurrent writers never share a temp file.
    fn temp_path(&self) -> PathBuf {
        let seq = TEMP_SEQ.fetch_add(1, Ordering::Relaxed);
        self.sibling(&format!(".{}.{seq}.tmp", process::id()))
    }

    fn ensure_parent(&self) -> Result<()> {
        if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent).map_err(|e| LedgerError::io(parent, e))?;
        }
        Ok(())
    }

    fn open_lock(&self) -> Result<FileLock<fs::File>> {
        self.ensure_parent()?;
        let path = self.lock_path();
        let file = fs::OpenOptions::new()
            .create(true)
            .truncate(false)
            .write(true)
            .open(&path)
            .map_err(|e| LedgerError::io(&path, e))?;
        Ok(FileLock::new(file))
    }

    fn busy(&self) -> LedgerError {
        LedgerError::Conflict {
            resource: format!("state file {}", self.path.display()),
        }
    }
}

impl LedgerStore for JsonFileStore {
    fn load(&self) -> Result<Option<LedgerSnapshot>> {
        if !self.path.exists() {
            return Ok(None);
        }
        let bytes = fs::read(&self.path).map_err(|e| LedgerError::io(&self.path, e))?;
        let snapshot: LedgerSnapshot = serde_json::from_slice(&bytes)?;
        debug!(path = %self.path.display(), ledgers = snapshot.ledgers.len(), "loaded snapshot");
        Ok(Some(snapshot))
    }

    fn save(&self, snapshot: &LedgerSnapshot) -> Result<()> {
        self.ensure_parent()?;
        let json = serde_json::to_vec_pretty(snapshot)?;
        let tmp = self.temp_path();
        let written = fs::File::create(&tmp).and_then(|mut file| {
            file.write_all(&json)?;
            file.sync_all()
        });
        if let Err(e) = written.and_then(|()| fs::rename(&tmp, &self.path)) {
            let _ = fs::remove_file(&tmp);
            return Err(LedgerError::io(&self.path, e));
        }
        debug!(path = %self.path.display(), root = %hex::encode(snapshot.state_root), "saved snapshot");
        Ok(())
    }

    fn update<R, F>(&self, contention: ContentionPolicy, apply: F) -> Result<R>
    where
        F: FnOnce(Option<LedgerSnapshot>) -> Result<(R, Option<LedgerSnapshot>)>,
    {
        let mut lock = self.open_lock()?;
        let _held = match contention {
            ContentionPolicy::Queue => lock
                .write()
                .map_err(|e| LedgerError::io(self.lock_path(), e))?,
            ContentionPolicy::Reject => match lock.try_write() {
                Ok(held) => held,
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => return Err(self.busy()),
                Err(e) => return Err(LedgerError::io(self.lock_path(), e)),
            },
        };
        let (out, next) = apply(self.load()?)?;
        if let Some(next) = next {
            self.save(&next)?;
        }
        Ok(out)
    }
}

#[derive(Default)]
pub struct MemoryStore {
    slot: Mutex<Option<LedgerSnapshot>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl LedgerStore for MemoryStore {
    fn load(&self) -> Result<Option<LedgerSnapshot>> {
        Ok(self.slot.lock().clone())
    }

    fn save(&self, snapshot: &LedgerSnapshot) -> Result<()> {
        *self.slot.lock() = Some(snapshot.clone());
        Ok(())
    }

    fn update<R, F>(&self, contention: ContentionPolicy, apply: F) -> Result<R>
    where
        F: FnOnce(Option<LedgerSnapshot>) -> Result<(R, Option<LedgerSnapshot>)>,
    {
        let mut slot = match contention {
            ContentionPolicy::Queue => self.slot.lock(),
            ContentionPolicy::Reject => self.slot.try_lock().ok_or_else(|| LedgerError::Conflict {
                resource: "memory store".into(),
            })?,
        };
        let (out, next) = apply(slot.clone())?;
        if let Some(next) = next {
            *slot = Some(next);
        }
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        clock::ManualClock,
        config::ServiceConfig,
        ledger::{BatteryBank, Identity, ProducerLedger},
        service::LedgerService,
    };
    use std::{collections::BTreeMap, sync::mpsc, sync::Arc, thread};

    fn sample() -> LedgerSnapshot {
        let bank = BatteryBank::new("owner".into(), 5);
        let mut ledger = ProducerLedger::open(&bank, "alice".into(), 100, 2, 1).unwrap();
        ledger.consume(30, 2).unwrap();
        let mut ledgers = BTreeMap::new();
        ledgers.insert(ledger.key, ledger);
        LedgerSnapshot::new(Some(bank), ledgers)
    }

    fn id(name: &str) -> Identity {
        Identity::from(name)
    }

    /// One CLI-style session: load, apply `op` to a restored service, save.
    fn session(
        store: &JsonFileStore,
        contention: ContentionPolicy,
        op: impl FnOnce(&LedgerService) -> Result<()>,
    ) -> Result<()> {
        store.update(contention, |snapshot| {
            let svc = LedgerService::restore(
                snapshot.unwrap_or_else(LedgerSnapshot::empty),
                ServiceConfig::default(),
                Arc::new(ManualClock::new(10)),
            )?;
            op(&svc)?;
            Ok(((), Some(svc.snapshot())))
        })
    }

    fn scratch_dir(tag: &str) -> PathBuf {
        let dir = std::env::temp_dir().join(format!(
            "gridbalance-store-{tag}-{}",
            std::process::id()
        ));
        let _ = fs::remove_dir_all(&dir);
        dir
    }

    #[test]
    fn json_store_persists_snapshots() {
        let dir = scratch_dir("persist");
        let store = JsonFileStore::new(dir.join("nested").join("state.json"));
        assert!(store.load().unwrap().is_none());

        let snapshot = sample();
        store.save(&snapshot).unwrap();
        let loaded = store.load().unwrap().unwrap();
        assert_eq!(loaded, snapshot);
        loaded.verify().unwrap();
        let leftovers: Vec<_> = fs::read_dir(dir.join("nested"))
            .unwrap()
            .filter_map(|entry| entry.ok())
            .filter(|entry| entry.file_name().to_string_lossy().ends_with(".tmp"))
            .collect();
        assert!(leftovers.is_empty());
        let _ = fs::remove_dir_all(&dir);
    }

    #[test]
    fn garbage_on_disk_is_a_codec_error() {
        let dir = scratch_dir("garbage");
        fs::create_dir_all(&dir).unwrap();
        let path = dir.join("state.json");
        fs::write(&path, b"not json").unwrap();
        let err = JsonFileStore::new(&path).load().unwrap_err();
        assert!(matches!(err, LedgerError::Codec(_)));
        let _ = fs::remove_dir_all(&dir);
    }

    #[test]
    fn memory_store_keeps_latest() {
        let store = MemoryStore::new();
        assert!(store.load().unwrap().is_none());
        store.save(&LedgerSnapshot::empty()).unwrap();
        store.save(&sample()).unwrap();
        assert_eq!(store.load().unwrap().unwrap(), sample());
    }

    #[test]
    fn temp_files_are_unique_per_write() {
        let store = JsonFileStore::new("state.json");
        let a = store.temp_path();
        let b = store.temp_path();
        assert_ne!(a, b);
        assert_ne!(a, store.path());
        assert_ne!(a, store.lock_path());
    }

    #[test]
    fn overlapping_sessions_cannot_erase_each_other() {
        let dir = scratch_dir("overlap");
        let path = dir.join("state.json");
        session(&JsonFileStore::new(&path), ContentionPolicy::Queue, |svc| {
            svc.initialize(5, id("owner"))?;
            svc.store_energy(&id("p"), &id("p"), 100, 2)?;
            Ok(())
        })
        .unwrap();

        let (entered_tx, entered_rx) = mpsc::channel();
        let (release_tx, release_rx) = mpsc::channel::<()>();
        let depositor = {
            let path = path.clone();
            thread::spawn(move || {
                session(&JsonFileStore::new(path), ContentionPolicy::Queue, |svc| {
                    svc.store_energy(&id("p"), &id("p"), 50, 2)?;
                    entered_tx.send(()).unwrap();
                    release_rx.recv().unwrap();
                    Ok(())
                })
            })
        };
        entered_rx.recv().unwrap();

        // A second writer cannot slip in between the depositor's load and save.
        let owner = JsonFileStore::new(&path);
        let consume = |svc: &LedgerService| -> Result<()> {
            svc.consume_energy(&id("owner"), &id("p"), 100)?;
            Ok(())
        };
        let err = session(&owner, ContentionPolicy::Reject, consume).unwrap_err();
        assert!(err.is_retryable());

        release_tx.send(()).unwrap();
        depositor.join().unwrap().unwrap();
        session(&owner, ContentionPolicy::Queue, consume).unwrap();

        let saved = owner.load().unwrap().unwrap();
        saved.verify().unwrap();
        let ledger = saved.ledgers.values().next().unwrap();
        assert_eq!(ledger.stored_amount(), 150);
        assert_eq!(ledger.consumed_amount(), 100);
        assert_eq!(ledger.transactions().len(), 3);
        let _ = fs::remove_dir_all(&dir);
    }

    #[test]
    fn queued_sessions_apply_every_deposit() {
        let dir = scratch_dir("queued");
        let path = dir.join("state.json");
        session(&JsonFileStore::new(&path), ContentionPolicy::Queue, |svc| {
            svc.initialize(1, id("owner"))?;
            Ok(())
        })
        .unwrap();

        let workers: Vec<_> = (0..4)
            .map(|_| {
                let path = path.clone();
                thread::spawn(move || {
                    let store = JsonFileStore::new(path);
                    for _ in 0..5 {
                        session(&store, ContentionPolicy::Queue, |svc| {
                            svc.store_energy(&id("p"), &id("p"), 1, 1)?;
                            Ok(())
                        })
                        .unwrap();
                    }
                })
            })
            .collect();
        for worker in workers {
            worker.join().unwrap();
        }

        let saved = JsonFileStore::new(&path).load().unwrap().unwrap();
        let ledger = saved.ledgers.values().next().unwrap();
        assert_eq!(ledger.stored_amount(), 20);
        assert_eq!(ledger.transactions().len(), 20);
        let _ = fs::remove_dir_all(&dir);
    }

    #[test]
    fn failed_session_leaves_the_file_alone() {
        let dir = scratch_dir("failed");
        let store = JsonFileStore::new(dir.join("state.json"));
        store.save(&sample()).unwrap();
        let err = session(&store, ContentionPolicy::Queue, |svc| {
            svc.consume_energy(&id("owner"), &id("alice"), 1_000)?;
            Ok(())
        })
        .unwrap_err();
        assert!(matches!(err, LedgerError::InsufficientBalance { .. }));
        assert_eq!(store.load().unwrap().unwrap(), sample());
        let _ = fs::remove_dir_all(&dir);
    }

    #[test]
    fn memory_store_rejects_nested_update_under_reject() {
        let store = MemoryStore::new();
        let inner = store
            .update(ContentionPolicy::Queue, |_| {
                let nested = store.update(ContentionPolicy::Reject, |_| Ok(((), None)));
                Ok((nested, Some(sample())))
            })
            .unwrap();
        assert!(matches!(inner, Err(LedgerError::Conflict { .. })));
        assert_eq!(store.load().unwrap().unwrap(), sample());
    }
}
