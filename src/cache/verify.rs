//! Integrity checks of cached bundle files against their manifest records.
//!
//! The multithreaded pass hashes files on the rayon pool and posts results
//! back through a channel drained once per update. Workers drop their result
//! when the owning group has been torn down.

use std::{
    cell::RefCell,
    collections::{HashSet, VecDeque},
    fs,
    path::{Path, PathBuf},
    rc::Rc,
};

use crossbeam_channel::{unbounded, Receiver, Sender};
use log::{debug, warn};

use super::{CacheEntry, CacheIndex, CacheLayout};
use crate::{
    error::{Error, IoContext, Result},
    hasher::{content_hash, crc32, digest_file},
    manifest::{BundleRecord, Manifest},
    operation::{Operation, OperationState},
    scheduler::GroupToken,
    settings::{VerifyLevel, VerifyMode},
};

/// Check a file on disk against its record
pub fn verify_file(path: &Path, record: &BundleRecord, level: VerifyLevel) -> Result<()> {
    let metadata = fs::metadata(path).at_path(path)?;
    if level == VerifyLevel::Low {
        return Ok(());
    }

    if metadata.len() != record.size {
        return Err(Error::SizeMismatch {
            file: record.name.clone(),
            expected: record.size,
            actual: metadata.len(),
        });
    }
    if level == VerifyLevel::Middle {
        return Ok(());
    }

    let digest = digest_file(path, false)?;
    if digest.crc != record.crc {
        return Err(Error::CrcMismatch {
            file: record.name.clone(),
            expected: record.crc,
            actual: digest.crc,
        });
    }
    Ok(())
}

fn check_digest(record: &BundleRecord, size: u64, crc: u32, hash: &str) -> Result<()> {
    if size != record.size {
        return Err(Error::SizeMismatch {
            file: record.name.clone(),
            expected: record.size,
            actual: size,
        });
    }
    if crc != record.crc {
        return Err(Error::CrcMismatch {
            file: record.name.clone(),
            expected: record.crc,
            actual: crc,
        });
    }
    if hash != record.hash {
        return Err(Error::HashMismatch {
            file: record.name.clone(),
            expected: record.hash.clone(),
            actual: hash.to_string(),
        });
    }
    Ok(())
}

/// Full check of a freshly downloaded file: size, CRC and content hash,
/// whatever level the cache is verified at
pub fn verify_download(path: &Path, record: &BundleRecord) -> Result<()> {
    let digest = digest_file(path, true)?;
    let hash = digest.hash.unwrap_or_default();
    check_digest(record, digest.size, digest.crc, &hash)
}

/// Full check of a download kept in memory
pub fn verify_bytes(bytes: &[u8], record: &BundleRecord) -> Result<()> {
    check_digest(record, bytes.len() as u64, crc32(bytes), &content_hash(bytes))
}

#[derive(Debug, Clone)]
pub struct VerifyItem {
    pub record: BundleRecord,
    pub path: PathBuf,
}

type VerifyResult = (VerifyItem, Result<()>);

/// Verification pass over cached bundle files.
///
/// Verified files are registered in the cache index, failures are collected in
/// the fail list and left on disk.
pub struct VerifyCacheOperation {
    state: OperationState,
    index: Rc<RefCell<CacheIndex>>,
    level: VerifyLevel,
    mode: VerifyMode,
    max_in_flight: usize,
    token: GroupToken,
    waiting: VecDeque<VerifyItem>,
    in_flight: usize,
    total: usize,
    verified: usize,
    fail_list: Vec<(BundleRecord, Error)>,
    tx: Sender<VerifyResult>,
    rx: Receiver<VerifyResult>,
}

impl VerifyCacheOperation {
    pub fn new(
        items: Vec<VerifyItem>,
        index: Rc<RefCell<CacheIndex>>,
        level: VerifyLevel,
        mode: VerifyMode,
        max_in_flight: usize,
        token: GroupToken,
    ) -> Self {
        let (tx, rx) = unbounded();
        Self {
            state: OperationState::default(),
            index,
            level,
            mode,
            max_in_flight: max_in_flight.max(1),
            token,
            total: items.len(),
            waiting: items.into(),
            in_flight: 0,
            verified: 0,
            fail_list: Vec::new(),
            tx,
            rx,
        }
    }

    /// Every cached file of the manifest's downloadable bundles
    pub fn for_manifest(
        manifest: &Manifest,
        layout: &CacheLayout,
        index: Rc<RefCell<CacheIndex>>,
        level: VerifyLevel,
        mode: VerifyMode,
        max_in_flight: usize,
        token: GroupToken,
    ) -> Self {
        let mut seen = HashSet::new();
        let items = manifest
            .bundles
            .iter()
            .filter(|b| !b.is_builtin && seen.insert(b.hash.as_str()))
            .map(|b| VerifyItem {
                record: b.clone(),
                path: layout.bundle_path(b),
            })
            .filter(|item| item.path.exists())
            .collect();
        Self::new(items, index, level, mode, max_in_flight, token)
    }

    pub fn verified_count(&self) -> usize {
        self.verified
    }

    pub fn verify_fail_list(&self) -> &[(BundleRecord, Error)] {
        &self.fail_list
    }

    fn record_result(&mut self, item: VerifyItem, result: Result<()>) {
        match result {
            Ok(()) => {
                self.verified += 1;
                self.index.borrow_mut().insert(
                    &item.record.hash,
                    CacheEntry {
                        path: item.path,
                        size: item.record.size,
                    },
                );
            }
            Err(e) => {
                warn!("Cached bundle {} failed verification: {e}", item.record.name);
                self.index.borrow_mut().remove(&item.record.hash);
                self.fail_list.push((item.record, e));
            }
        }
    }

    fn update_single_thread(&mut self) {
        for _ in 0..self.max_in_flight {
            let Some(item) = self.waiting.pop_front() else {
                break;
            };
            let result = verify_file(&item.path, &item.record, self.level);
            self.record_result(item, result);
        }
    }

    fn update_multi_thread(&mut self) {
        while let Ok((item, result)) = self.rx.try_recv() {
            self.in_flight -= 1;
            self.record_result(item, result);
        }

        while self.in_flight < self.max_in_flight {
            let Some(item) = self.waiting.pop_front() else {
                break;
            };
            self.in_flight += 1;
            let tx = self.tx.clone();
            let token = self.token.clone();
            let level = self.level;
            rayon::spawn(move || {
                let result = verify_file(&item.path, &item.record, level);
                if token.is_alive() {
                    // The operation may be gone already
                    let _ = tx.send((item, result));
                } else {
                    debug!("Dropping verification of {} for a dead group", item.record.name);
                }
            });
        }
    }
}

impl Operation for VerifyCacheOperation {
    fn state(&self) -> &OperationState {
        &self.state
    }

    fn state_mut(&mut self) -> &mut OperationState {
        &mut self.state
    }

    fn update(&mut self) {
        match self.mode {
            VerifyMode::SingleThread => self.update_single_thread(),
            VerifyMode::MultiThread => self.update_multi_thread(),
        }

        let done = self.verified + self.fail_list.len();
        if self.total > 0 {
            self.state.set_progress(done as f32 / self.total as f32);
        }
        if self.waiting.is_empty() && self.in_flight == 0 {
            debug!(
                "Cache verification finished, {} verified, {} failed",
                self.verified,
                self.fail_list.len()
            );
            self.state.succeed();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::{thread, time::Duration};

    use crate::{
        operation::{step, Operation, OperationStatus},
        scheduler::Scheduler,
        settings::FileNameStyle,
        test_utils::bundle_record,
    };

    fn setup(dir: &Path) -> (CacheLayout, Vec<BundleRecord>) {
        let layout = CacheLayout::new(dir, FileNameStyle::Hash);
        layout.ensure_dirs().unwrap();
        let records: Vec<_> = (0..6)
            .map(|i| bundle_record(&format!("b{i}"), format!("content {i}").as_bytes()))
            .collect();
        for (i, record) in records.iter().enumerate() {
            fs::write(layout.bundle_path(record), format!("content {i}")).unwrap();
        }
        (layout, records)
    }

    fn run(mode: VerifyMode, corrupt: bool) -> (usize, Vec<String>, Rc<RefCell<CacheIndex>>) {
        let dir = tempfile::tempdir().unwrap();
        let (layout, records) = setup(dir.path());
        if corrupt {
            // Same size, one byte flipped
            fs::write(layout.bundle_path(&records[2]), "content X").unwrap();
        }
        let manifest = Manifest::new("main", "v1", records, vec![]).unwrap();
        let index = Rc::new(RefCell::new(CacheIndex::default()));
        let scheduler = Scheduler::default();

        let mut op = VerifyCacheOperation::for_manifest(
            &manifest,
            &layout,
            index.clone(),
            VerifyLevel::High,
            mode,
            2,
            scheduler.group_token(Some("main")),
        );
        op.wait_for_async_complete();
        assert!(op.is_done());

        let failed = op
            .verify_fail_list()
            .iter()
            .map(|(r, _)| r.name.clone())
            .collect();
        (op.verified_count(), failed, index)
    }

    #[test]
    fn both_modes_agree() {
        for mode in [VerifyMode::SingleThread, VerifyMode::MultiThread] {
            let (verified, failed, index) = run(mode, false);
            assert_eq!(verified, 6);
            assert!(failed.is_empty());
            assert_eq!(index.borrow().len(), 6);

            let (verified, failed, index) = run(mode, true);
            assert_eq!(verified, 5);
            assert_eq!(failed, vec!["b2".to_string()]);
            assert_eq!(index.borrow().len(), 5);
        }
    }

    #[test]
    fn reverifying_is_idempotent_and_keeps_failed_files() {
        let dir = tempfile::tempdir().unwrap();
        let (layout, records) = setup(dir.path());
        let index = Rc::new(RefCell::new(CacheIndex::default()));
        let scheduler = Scheduler::default();
        let manifest = Manifest::new("main", "v1", records.clone(), vec![]).unwrap();

        for _ in 0..2 {
            let mut op = VerifyCacheOperation::for_manifest(
                &manifest,
                &layout,
                index.clone(),
                VerifyLevel::High,
                VerifyMode::MultiThread,
                4,
                scheduler.group_token(None),
            );
            op.wait_for_async_complete();
            assert_eq!(op.verified_count(), 6);
        }

        fs::write(layout.bundle_path(&records[0]), "content 9").unwrap();
        let mut op = VerifyCacheOperation::for_manifest(
            &manifest,
            &layout,
            index.clone(),
            VerifyLevel::High,
            VerifyMode::SingleThread,
            4,
            scheduler.group_token(None),
        );
        op.wait_for_async_complete();
        assert_eq!(op.verify_fail_list().len(), 1);
        assert!(!index.borrow().is_cached(&records[0].hash));
        // Reported, not deleted
        assert!(layout.bundle_path(&records[0]).exists());
    }

    #[test]
    fn torn_down_group_ignores_running_workers() {
        let dir = tempfile::tempdir().unwrap();
        let (layout, records) = setup(dir.path());
        let manifest = Manifest::new("main", "v1", records, vec![]).unwrap();
        let index = Rc::new(RefCell::new(CacheIndex::default()));
        let scheduler = Scheduler::default();

        let op = scheduler.submit(
            Some("main"),
            VerifyCacheOperation::for_manifest(
                &manifest,
                &layout,
                index.clone(),
                VerifyLevel::High,
                VerifyMode::MultiThread,
                2,
                scheduler.group_token(Some("main")),
            ),
        );
        scheduler.tick();
        let op = op.upgrade().unwrap();
        assert!(op.borrow().in_flight > 0);

        scheduler.clear_group("main");
        thread::sleep(Duration::from_millis(100));
        for _ in 0..3 {
            scheduler.tick();
        }

        assert!(scheduler.is_empty());
        assert!(index.borrow().is_empty());
        assert_eq!(op.borrow().status(), OperationStatus::Failed);
        assert!(matches!(op.borrow().error(), Some(Error::GroupCleared(_))));
    }

    #[test]
    fn workers_of_a_dead_group_post_nothing() {
        let dir = tempfile::tempdir().unwrap();
        let (layout, records) = setup(dir.path());
        let manifest = Manifest::new("main", "v1", records, vec![]).unwrap();
        let index = Rc::new(RefCell::new(CacheIndex::default()));
        let scheduler = Scheduler::default();
        let token = scheduler.group_token(Some("main"));
        scheduler.clear_group("main");

        let mut op = VerifyCacheOperation::for_manifest(
            &manifest,
            &layout,
            index.clone(),
            VerifyLevel::High,
            VerifyMode::MultiThread,
            6,
            token,
        );
        step(&mut op);
        assert_eq!(op.in_flight, 6);
        thread::sleep(Duration::from_millis(100));
        step(&mut op);

        assert!(op.rx.try_recv().is_err());
        assert_eq!(op.verified_count(), 0);
        assert!(op.verify_fail_list().is_empty());
        assert!(index.borrow().is_empty());
    }

    #[test]
    fn levels() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("f");
        fs::write(&path, b"abcd").unwrap();
        let record = bundle_record("f", b"abce");

        assert!(verify_file(&path, &record, VerifyLevel::Low).is_ok());
        assert!(verify_file(&path, &record, VerifyLevel::Middle).is_ok());
        assert!(matches!(
            verify_file(&path, &record, VerifyLevel::High),
            Err(Error::CrcMismatch { .. })
        ));
        assert!(matches!(
            verify_file(&dir.path().join("missing"), &record, VerifyLevel::Low),
            Err(Error::Io { .. })
        ));
        assert!(verify_bytes(b"abce", &record).is_ok());
        assert!(matches!(
            verify_bytes(b"abc", &record),
            Err(Error::SizeMismatch { .. })
        ));

        fs::write(&path, b"abce").unwrap();
        assert!(verify_download(&path, &record).is_ok());
    }
}
