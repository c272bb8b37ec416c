//! Batch downloads of bundle files.
//!
//! A [`DownloaderOperation`] keeps a bounded number of [`FileFetchOperation`]s
//! in flight. Once any file exhausts its retries no new fetch is started; the
//! ones already running finish and the batch fails naming the first failed file.

use std::{
    cell::RefCell,
    collections::{HashSet, VecDeque},
    mem,
    rc::Rc,
    time::Duration,
};

use log::{debug, error, info};

use crate::{
    error::Error,
    file_system::FileSystemSet,
    manifest::BundleRecord,
    operation::{step, Notification, Operation, OperationState, OperationStatus},
    settings::MAX_DOWNLOAD_CONCURRENCY,
};

pub mod file_fetch;

pub use file_fetch::{FetchTarget, FileFetchOperation};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DownloadProgress {
    pub total_count: usize,
    pub total_bytes: u64,
    pub current_count: usize,
    pub current_bytes: u64,
}

type ProgressCallback = Rc<RefCell<dyn FnMut(DownloadProgress)>>;
type ErrorCallback = Rc<RefCell<dyn FnMut(&str, &Error)>>;
type FinishCallback = Rc<RefCell<dyn FnMut(bool)>>;

pub struct DownloaderOperation {
    state: OperationState,
    package_name: String,
    file_systems: Rc<FileSystemSet>,
    queue: VecDeque<BundleRecord>,
    downloading: Vec<Rc<RefCell<FileFetchOperation>>>,
    succeeded: Vec<BundleRecord>,
    failed: Vec<(BundleRecord, Error)>,
    max_concurrency: usize,
    retry: u32,
    timeout: Duration,
    total_count: usize,
    total_bytes: u64,
    current_count: usize,
    current_bytes: u64,
    last_reported: Option<DownloadProgress>,
    paused: bool,
    on_progress: Option<ProgressCallback>,
    on_error: Option<ErrorCallback>,
    on_finish: Option<FinishCallback>,
    notifications: Vec<Notification>,
}

impl DownloaderOperation {
    pub fn new(
        package_name: &str,
        file_systems: Rc<FileSystemSet>,
        records: Vec<BundleRecord>,
        max_concurrency: usize,
        retry: u32,
        timeout: Duration,
    ) -> Self {
        let mut downloader = Self {
            state: OperationState::default(),
            package_name: package_name.to_string(),
            file_systems,
            queue: VecDeque::new(),
            downloading: Vec::new(),
            succeeded: Vec::new(),
            failed: Vec::new(),
            max_concurrency: max_concurrency.clamp(1, MAX_DOWNLOAD_CONCURRENCY),
            retry,
            timeout,
            total_count: 0,
            total_bytes: 0,
            current_count: 0,
            current_bytes: 0,
            last_reported: None,
            paused: false,
            on_progress: None,
            on_error: None,
            on_finish: None,
            notifications: Vec::new(),
        };
        downloader.enqueue(records);
        downloader
    }

    // Queue records not already queued, by content hash
    fn enqueue(&mut self, records: impl IntoIterator<Item = BundleRecord>) {
        let mut seen: HashSet<String> = self.queue.iter().map(|r| r.hash.clone()).collect();
        for record in records {
            if seen.insert(record.hash.clone()) {
                self.total_count += 1;
                self.total_bytes += record.size;
                self.queue.push_back(record);
            }
        }
    }

    pub fn package_name(&self) -> &str {
        &self.package_name
    }

    pub fn total_download_count(&self) -> usize {
        self.total_count
    }

    pub fn total_download_bytes(&self) -> u64 {
        self.total_bytes
    }

    pub fn current_download_count(&self) -> usize {
        self.current_count
    }

    pub fn current_download_bytes(&self) -> u64 {
        self.current_bytes
    }

    pub fn succeeded(&self) -> &[BundleRecord] {
        &self.succeeded
    }

    pub fn failed(&self) -> &[(BundleRecord, Error)] {
        &self.failed
    }

    pub fn is_paused(&self) -> bool {
        self.paused
    }

    pub fn set_progress_callback(&mut self, f: impl FnMut(DownloadProgress) + 'static) {
        self.on_progress = Some(Rc::new(RefCell::new(f)));
    }

    pub fn set_error_callback(&mut self, f: impl FnMut(&str, &Error) + 'static) {
        self.on_error = Some(Rc::new(RefCell::new(f)));
    }

    pub fn set_finish_callback(&mut self, f: impl FnMut(bool) + 'static) {
        self.on_finish = Some(Rc::new(RefCell::new(f)));
    }

    /// Merge another downloader of the same package into this one. Only
    /// allowed before either has started.
    pub fn combine(&mut self, other: &DownloaderOperation) -> bool {
        if self.status() != OperationStatus::None || other.status() != OperationStatus::None {
            error!("Downloaders can only be combined before they start");
            return false;
        }
        if self.package_name != other.package_name {
            error!(
                "Cannot combine downloaders of packages {} and {}",
                self.package_name, other.package_name
            );
            return false;
        }
        self.enqueue(other.queue.iter().cloned());
        true
    }

    /// Stop starting new files, in-flight ones keep going
    pub fn pause(&mut self) {
        self.paused = true;
    }

    pub fn resume(&mut self) {
        self.paused = false;
    }

    /// Drop every pending and in-flight file and fail with a cancellation.
    /// Files already downloaded stay cached.
    pub fn cancel(&mut self) {
        self.cancel_with(Error::UserCancelled);
    }

    fn cancel_with(&mut self, reason: Error) {
        if self.is_done() {
            return;
        }
        info!(
            "Cancelling download of {} after {}/{} files",
            self.package_name, self.current_count, self.total_count
        );
        for op in self.downloading.drain(..) {
            // Fetches shared with a bundle loader keep running for it
            if Rc::strong_count(&op) == 1 {
                op.borrow_mut().abort(reason.clone());
            }
        }
        self.queue.clear();
        self.state.fail(reason);
        self.notify_finish(false);
    }

    fn snapshot(&self) -> DownloadProgress {
        let in_flight: u64 = self
            .downloading
            .iter()
            .map(|op| op.borrow().downloaded_bytes())
            .sum();
        // In-flight bytes drop back when a transfer restarts from scratch
        let reported = self.last_reported.map_or(0, |p| p.current_bytes);
        DownloadProgress {
            total_count: self.total_count,
            total_bytes: self.total_bytes,
            current_count: self.current_count,
            current_bytes: (self.current_bytes + in_flight)
                .max(reported)
                .min(self.total_bytes),
        }
    }

    fn notify_progress(&mut self) {
        let progress = self.snapshot();
        if self.last_reported == Some(progress) {
            return;
        }
        self.last_reported = Some(progress);
        if self.total_bytes > 0 {
            self.state
                .set_progress(progress.current_bytes as f32 / self.total_bytes as f32);
        }
        if let Some(cb) = &self.on_progress {
            let cb = cb.clone();
            self.notifications.push(Box::new(move || {
                (&mut *cb.borrow_mut())(progress);
            }));
        }
    }

    fn notify_error(&mut self, file: &str, e: &Error) {
        if let Some(cb) = &self.on_error {
            let cb = cb.clone();
            let file = file.to_string();
            let e = e.clone();
            self.notifications.push(Box::new(move || {
                (&mut *cb.borrow_mut())(&file, &e);
            }));
        }
    }

    fn notify_finish(&mut self, succeeded: bool) {
        if let Some(cb) = &self.on_finish {
            let cb = cb.clone();
            self.notifications.push(Box::new(move || {
                (&mut *cb.borrow_mut())(succeeded);
            }));
        }
    }

    fn record_success(&mut self, record: BundleRecord) {
        self.current_count += 1;
        self.current_bytes += record.size;
        self.succeeded.push(record);
    }

    fn record_failure(&mut self, record: BundleRecord, e: Error) {
        self.notify_error(&record.name, &e);
        self.failed.push((record, e));
    }

    fn poll_in_flight(&mut self) {
        for op in mem::take(&mut self.downloading) {
            let (status, error) = {
                let mut fetch = op.borrow_mut();
                step(&mut *fetch);
                (fetch.status(), fetch.error().cloned())
            };
            match status {
                OperationStatus::Succeeded => {
                    let record = op.borrow().record().clone();
                    self.record_success(record);
                }
                OperationStatus::Failed => {
                    let record = op.borrow().record().clone();
                    let e = error.unwrap_or(Error::UserCancelled);
                    self.record_failure(record, e);
                }
                _ => self.downloading.push(op),
            }
        }
    }

    fn spawn_new(&mut self) {
        while self.downloading.len() < self.max_concurrency {
            let Some(record) = self.queue.pop_front() else {
                break;
            };
            if !self.file_systems.need_download(&record) {
                debug!("{} is already available, skipping", record.name);
                self.record_success(record);
                continue;
            }

            let fetch = self
                .file_systems
                .select(&record)
                .and_then(|fs| fs.fetch(&record, self.retry, self.timeout));
            match fetch {
                Ok(op) => self.downloading.push(op),
                Err(e) => {
                    self.record_failure(record, e);
                    break;
                }
            }
        }
    }
}

impl Operation for DownloaderOperation {
    fn state(&self) -> &OperationState {
        &self.state
    }

    fn state_mut(&mut self) -> &mut OperationState {
        &mut self.state
    }

    fn start(&mut self) {
        info!(
            "Downloading {} files ({} bytes) for {}",
            self.total_count, self.total_bytes, self.package_name
        );
    }

    fn update(&mut self) {
        self.poll_in_flight();
        if !self.paused && self.failed.is_empty() {
            self.spawn_new();
        }
        self.notify_progress();

        if !self.downloading.is_empty() {
            return;
        }
        if let Some((record, e)) = self.failed.first() {
            let e = Error::DownloadFailed {
                file: record.name.clone(),
                reason: Box::new(e.clone()),
            };
            self.state.fail(e);
            self.notify_finish(false);
        } else if self.queue.is_empty() {
            self.state.succeed();
            self.notify_finish(true);
        }
    }

    fn abort(&mut self, reason: Error) {
        self.cancel_with(reason);
    }

    fn take_notifications(&mut self) -> Vec<Notification> {
        mem::take(&mut self.notifications)
    }
}

#[cfg(test)]
mod tests {
    use std::{cell::Cell, sync::Arc, thread};

    use url::Url;

    use super::*;
    use crate::{
        cache::{CacheIndex, CacheLayout},
        file_system::CacheFileSystem,
        remote::RemoteServices,
        settings::{FileNameStyle, VerifyLevel},
        test_utils::{bundle_record, MemoryFetcher},
    };

    struct Setup {
        _dir: tempfile::TempDir,
        layout: CacheLayout,
        index: Rc<RefCell<CacheIndex>>,
        fetcher: Arc<MemoryFetcher>,
        file_systems: Rc<FileSystemSet>,
        records: Vec<BundleRecord>,
    }

    fn setup(count: usize) -> Setup {
        let dir = tempfile::tempdir().unwrap();
        let layout = CacheLayout::new(dir.path(), FileNameStyle::Hash);
        layout.ensure_dirs().unwrap();
        let index = Rc::new(RefCell::new(CacheIndex::default()));
        let fetcher = Arc::new(MemoryFetcher::default());
        let records: Vec<_> = (0..count)
            .map(|i| {
                let data = format!("bundle number {i}").into_bytes();
                let record = bundle_record(&format!("b{i}"), &data);
                fetcher.insert(&record.hash, data);
                record
            })
            .collect();
        let cache = CacheFileSystem::new(
            layout.clone(),
            index.clone(),
            Rc::new(RemoteServices::new(
                Url::parse("https://primary.test/main/").unwrap(),
                Some(Url::parse("https://fallback.test/main/").unwrap()),
            )),
            fetcher.clone(),
        );
        Setup {
            _dir: dir,
            layout,
            index,
            fetcher,
            file_systems: Rc::new(FileSystemSet::new(None, Some(Box::new(cache)))),
            records,
        }
    }

    fn downloader(
        s: &Setup,
        records: Vec<BundleRecord>,
        concurrency: usize,
    ) -> DownloaderOperation {
        DownloaderOperation::new(
            "main",
            s.file_systems.clone(),
            records,
            concurrency,
            1,
            Duration::from_secs(5),
        )
    }

    fn drive(op: &mut DownloaderOperation) {
        while !op.is_done() {
            step(op);
            op.take_notifications().into_iter().for_each(|n| n());
            thread::sleep(Duration::from_millis(1));
        }
        op.take_notifications().into_iter().for_each(|n| n());
    }

    #[test]
    fn downloads_everything_and_reports_progress() {
        let s = setup(5);
        let mut op = downloader(&s, s.records.clone(), 2);

        let reports = Rc::new(RefCell::new(Vec::new()));
        let finished = Rc::new(Cell::new(None));
        {
            let reports = reports.clone();
            op.set_progress_callback(move |p| reports.borrow_mut().push(p));
            let finished = finished.clone();
            op.set_finish_callback(move |ok| finished.set(Some(ok)));
        }
        drive(&mut op);

        assert_eq!(op.status(), OperationStatus::Succeeded);
        assert_eq!(op.current_download_count(), 5);
        assert_eq!(finished.get(), Some(true));
        for record in &s.records {
            assert!(s.index.borrow().is_cached(&record.hash));
        }
        let reports = reports.borrow();
        assert_eq!(reports.last().unwrap().current_count, 5);
        // Only changes are reported
        assert!(reports.windows(2).all(|w| w[0] != w[1]));
    }

    #[test]
    fn progress_survives_a_restarted_transfer() {
        let s = setup(0);
        let data: Vec<u8> = (0..300_000u32).map(|i| (i % 253) as u8).collect();
        let record = bundle_record("big", &data);
        s.fetcher.insert(&record.hash, data);
        // The retry cannot resume and starts over from byte zero
        s.fetcher.ignore_ranges();
        s.fetcher.fail_after_bytes(&record.hash, 200_000);

        let mut op = downloader(&s, vec![record.clone()], 1);
        let reported = Rc::new(RefCell::new(Vec::new()));
        {
            let reported = reported.clone();
            op.set_progress_callback(move |p| reported.borrow_mut().push(p.current_bytes));
        }
        drive(&mut op);

        assert_eq!(op.status(), OperationStatus::Succeeded);
        let reported = reported.borrow();
        assert!(reported.windows(2).all(|w| w[0] <= w[1]));
        assert_eq!(reported.last().copied(), Some(record.size));
    }

    #[test]
    fn stops_spawning_after_first_exhausted_file() {
        let s = setup(6);
        s.fetcher.fail_always(&s.records[2].hash);
        let mut op = downloader(&s, s.records.clone(), 1);

        let errors = Rc::new(RefCell::new(Vec::new()));
        {
            let errors = errors.clone();
            op.set_error_callback(move |file, _| errors.borrow_mut().push(file.to_string()));
        }
        drive(&mut op);

        assert!(matches!(
            op.error(),
            Some(Error::DownloadFailed { file, .. }) if file == "b2"
        ));
        assert_eq!(*errors.borrow(), vec!["b2".to_string()]);
        let requested: HashSet<_> = s.fetcher.requests().into_iter().map(|r| r.name).collect();
        for later in &s.records[3..] {
            assert!(!requested.contains(&later.hash));
        }
        // Finished work is kept
        assert!(s.index.borrow().is_cached(&s.records[0].hash));
        assert!(s.index.borrow().is_cached(&s.records[1].hash));
    }

    #[test]
    fn cancel_keeps_finished_files() {
        let s = setup(10);
        for record in &s.records[3..] {
            s.fetcher.block(&record.hash);
        }
        let mut op = downloader(&s, s.records.clone(), 4);

        while op.current_download_count() < 3 {
            step(&mut op);
            thread::sleep(Duration::from_millis(1));
        }
        op.cancel();
        s.fetcher.unblock_all();

        assert_eq!(op.status(), OperationStatus::Failed);
        assert!(matches!(op.error(), Some(Error::UserCancelled)));
        for record in &s.records[..3] {
            assert!(s.index.borrow().is_cached(&record.hash));
            assert!(crate::cache::verify_file(
                &s.layout.bundle_path(record),
                record,
                VerifyLevel::High
            )
            .is_ok());
        }
        for record in &s.records[3..] {
            assert!(!s.index.borrow().is_cached(&record.hash));
        }
    }

    #[test]
    fn pause_holds_new_fetches() {
        let s = setup(3);
        let mut op = downloader(&s, s.records.clone(), 1);
        op.pause();
        for _ in 0..20 {
            step(&mut op);
        }
        assert!(s.fetcher.requests().is_empty());
        assert!(!op.is_done());

        op.resume();
        drive(&mut op);
        assert_eq!(op.status(), OperationStatus::Succeeded);
    }

    #[test]
    fn combine_dedupes_by_hash() {
        let s = setup(4);
        let mut first = downloader(&s, s.records[..3].to_vec(), 2);
        let second = downloader(&s, s.records[1..].to_vec(), 2);
        assert!(first.combine(&second));
        assert_eq!(first.total_download_count(), 4);

        let other_package = DownloaderOperation::new(
            "dlc",
            s.file_systems.clone(),
            vec![],
            1,
            0,
            Duration::from_secs(1),
        );
        assert!(!first.combine(&other_package));

        drive(&mut first);
        assert_eq!(first.current_download_count(), 4);
        assert!(!first.combine(&second));
    }
}
