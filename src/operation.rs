//! Pollable units of asynchronous work.
//!
//! Every long-running task in the engine (file fetches, downloaders, bundle
//! loaders, providers, cache passes) implements [`Operation`]. Operations are
//! driven by the [`Scheduler`](crate::scheduler::Scheduler) on a single thread
//! and must return promptly from [`Operation::update`].

use std::{
    cell::RefCell,
    rc::{Rc, Weak},
    thread,
    time::Duration,
};

use log::debug;

use crate::error::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OperationStatus {
    None,
    Running,
    Succeeded,
    Failed,
}

/// Status, progress and error shared by every operation.
#[derive(Debug, Clone)]
pub struct OperationState {
    status: OperationStatus,
    progress: f32,
    error: Option<Error>,
}

impl Default for OperationState {
    fn default() -> Self {
        Self {
            status: OperationStatus::None,
            progress: 0.0,
            error: None,
        }
    }
}

impl OperationState {
    pub fn status(&self) -> OperationStatus {
        self.status
    }

    pub fn progress(&self) -> f32 {
        self.progress
    }

    pub fn error(&self) -> Option<&Error> {
        self.error.as_ref()
    }

    pub fn is_done(&self) -> bool {
        matches!(
            self.status,
            OperationStatus::Succeeded | OperationStatus::Failed
        )
    }

    pub fn set_progress(&mut self, progress: f32) {
        if !self.is_done() {
            self.progress = progress.clamp(0.0, 1.0);
        }
    }

    /// `None -> Running`. Any other transition is ignored.
    pub(crate) fn begin(&mut self) {
        if self.status == OperationStatus::None {
            self.status = OperationStatus::Running;
        }
    }

    pub fn succeed(&mut self) {
        if self.is_done() {
            debug!("Ignoring success on an already finished operation");
            return;
        }
        self.status = OperationStatus::Succeeded;
        self.progress = 1.0;
    }

    pub fn fail(&mut self, error: Error) {
        if self.is_done() {
            debug!("Ignoring failure on an already finished operation: {error}");
            return;
        }
        self.status = OperationStatus::Failed;
        self.error = Some(error);
    }
}

/// Deferred callback, run by whoever drove the operation once its borrow has
/// been released.
pub type Notification = Box<dyn FnOnce()>;

pub trait Operation {
    fn state(&self) -> &OperationState;

    fn state_mut(&mut self) -> &mut OperationState;

    /// Called once, right after the operation enters `Running`.
    fn start(&mut self) {}

    fn update(&mut self);

    /// Invalidate the operation. Called when its scheduler group is cleared
    /// or its owner cancels it.
    fn abort(&mut self, reason: Error) {
        self.state_mut().fail(reason);
    }

    /// Callbacks queued during the last update.
    fn take_notifications(&mut self) -> Vec<Notification> {
        Vec::new()
    }

    /// Drive the operation to completion on the calling thread.
    fn wait_for_async_complete(&mut self) {
        while !self.is_done() {
            step(self);
            if !self.is_done() {
                thread::sleep(Duration::from_millis(1));
            }
        }
    }

    fn status(&self) -> OperationStatus {
        self.state().status()
    }

    fn progress(&self) -> f32 {
        self.state().progress()
    }

    fn error(&self) -> Option<&Error> {
        self.state().error()
    }

    fn is_done(&self) -> bool {
        self.state().is_done()
    }
}

/// One scheduling step: start the operation on first call, then update it.
pub fn step<O: Operation + ?Sized>(op: &mut O) {
    if op.is_done() {
        return;
    }
    if op.status() == OperationStatus::None {
        op.state_mut().begin();
        op.start();
    }
    if !op.is_done() {
        op.update();
    }
}

/// Run an operation to completion synchronously and deliver its notifications
/// outside of the borrow.
pub fn complete_now<T: Operation + ?Sized>(op: &Rc<RefCell<T>>) {
    let notifications = {
        let mut op = op.borrow_mut();
        op.wait_for_async_complete();
        op.take_notifications()
    };
    notifications.into_iter().for_each(|n| n());
}

/// Weak, caller-side view of a scheduled operation.
///
/// The scheduler owns the operation; once it has been retired the reference
/// reports `None` for status queries.
pub struct OperationRef<T: ?Sized> {
    inner: Weak<RefCell<T>>,
}

impl<T: ?Sized> Clone for OperationRef<T> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<T: Operation + ?Sized> OperationRef<T> {
    pub(crate) fn new(op: &Rc<RefCell<T>>) -> Self {
        Self {
            inner: Rc::downgrade(op),
        }
    }

    pub fn upgrade(&self) -> Option<Rc<RefCell<T>>> {
        self.inner.upgrade()
    }

    pub fn status(&self) -> Option<OperationStatus> {
        self.with(|op| op.status())
    }

    pub fn progress(&self) -> Option<f32> {
        self.with(|op| op.progress())
    }

    pub fn error(&self) -> Option<Error> {
        self.with(|op| op.error().cloned()).flatten()
    }

    /// A retired operation counts as done.
    pub fn is_done(&self) -> bool {
        self.with(|op| op.is_done()).unwrap_or(true)
    }

    pub fn is_alive(&self) -> bool {
        self.inner.strong_count() > 0
    }

    pub fn with<R>(&self, f: impl FnOnce(&T) -> R) -> Option<R> {
        let op = self.inner.upgrade()?;
        let op = op.borrow();
        Some(f(&op))
    }

    pub fn with_mut<R>(&self, f: impl FnOnce(&mut T) -> R) -> Option<R> {
        let op = self.inner.upgrade()?;
        let mut op = op.borrow_mut();
        Some(f(&mut op))
    }
}
