//! Cooperative scheduler polling every live operation once per tick.

use std::{
    cell::{Cell, RefCell},
    collections::HashMap,
    mem,
    rc::Rc,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    time::{Duration, Instant},
};

use log::{debug, warn};

use crate::{
    error::Error,
    operation::{step, Notification, Operation, OperationRef},
};

/// Liveness flag of an operation group.
///
/// Cheap to clone and `Send`, so background workers can check it before
/// posting results for a group that may have been torn down.
#[derive(Debug, Clone)]
pub struct GroupToken(Arc<AtomicBool>);

impl GroupToken {
    fn new() -> Self {
        Self(Arc::new(AtomicBool::new(true)))
    }

    pub fn is_alive(&self) -> bool {
        self.0.load(Ordering::Acquire)
    }

    fn kill(&self) {
        self.0.store(false, Ordering::Release);
    }
}

struct Entry {
    group: Option<String>,
    token: GroupToken,
    op: Rc<RefCell<dyn Operation>>,
    /// Reached a terminal state, removed at the start of the next tick.
    retired: bool,
}

impl Entry {
    /// Abort the operation, handing back the callbacks it queued on the way
    /// out. They must run once no scheduler list is borrowed.
    fn abort(&self) -> Vec<Notification> {
        let group = self.group.clone().unwrap_or_default();
        match self.op.try_borrow_mut() {
            Ok(mut op) => {
                if !op.is_done() {
                    op.abort(Error::GroupCleared(group));
                }
                op.take_notifications()
            }
            // Being updated further up the stack, its own update sees the dead token.
            Err(_) => {
                debug!("Skipping abort of busy operation in group {group}");
                Vec::new()
            }
        }
    }
}

// Drop dead entries, collecting what their aborts queued
fn remove_dead(entries: &mut Vec<Entry>, notifications: &mut Vec<Notification>) {
    entries.retain(|entry| {
        let alive = entry.token.is_alive();
        if !alive {
            notifications.extend(entry.abort());
        }
        alive
    });
}

struct Inner {
    running: RefCell<Vec<Entry>>,
    pending: RefCell<Vec<Entry>>,
    groups: RefCell<HashMap<String, GroupToken>>,
    global: GroupToken,
    max_time_slice: Cell<Duration>,
    ticking: Cell<bool>,
}

/// Registry of live operations. Clones share the same registry.
#[derive(Clone)]
pub struct Scheduler {
    inner: Rc<Inner>,
}

impl Scheduler {
    pub fn new(max_time_slice: Duration) -> Self {
        Self {
            inner: Rc::new(Inner {
                running: RefCell::new(Vec::new()),
                pending: RefCell::new(Vec::new()),
                groups: RefCell::new(HashMap::new()),
                global: GroupToken::new(),
                max_time_slice: Cell::new(max_time_slice),
                ticking: Cell::new(false),
            }),
        }
    }

    pub fn set_max_time_slice(&self, max_time_slice: Duration) {
        self.inner.max_time_slice.set(max_time_slice);
    }

    /// Liveness token for a group, `None` being the global bucket.
    pub fn group_token(&self, group: Option<&str>) -> GroupToken {
        match group {
            None => self.inner.global.clone(),
            Some(name) => self
                .inner
                .groups
                .borrow_mut()
                .entry(name.to_string())
                .or_insert_with(GroupToken::new)
                .clone(),
        }
    }

    /// Register an operation. It is started on the next tick.
    pub fn submit<T: Operation + 'static>(&self, group: Option<&str>, op: T) -> OperationRef<T> {
        self.submit_shared(group, Rc::new(RefCell::new(op)))
    }

    /// Register an operation that the caller also keeps a strong reference to.
    pub fn submit_shared<T: Operation + 'static>(
        &self,
        group: Option<&str>,
        op: Rc<RefCell<T>>,
    ) -> OperationRef<T> {
        let op_ref = OperationRef::new(&op);
        let entry = Entry {
            group: group.map(str::to_string),
            token: self.group_token(group),
            op,
            retired: false,
        };
        self.inner.pending.borrow_mut().push(entry);
        op_ref
    }

    /// Number of registered operations, including those not yet started.
    pub fn len(&self) -> usize {
        self.inner.running.borrow().len() + self.inner.pending.borrow().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Poll every registered operation once, stopping early when the time
    /// slice is exhausted. Operations skipped by an early stop are polled
    /// first on the next tick.
    pub fn tick(&self) {
        if self.inner.ticking.replace(true) {
            warn!("Scheduler::tick called re-entrantly, ignoring");
            return;
        }

        let started = Instant::now();
        let max_time_slice = self.inner.max_time_slice.get();

        let mut running = mem::take(&mut *self.inner.running.borrow_mut());
        running.retain(|entry| !entry.retired);
        running.append(&mut self.inner.pending.borrow_mut());

        let mut stopped_at = None;
        for (index, entry) in running.iter_mut().enumerate() {
            if index > 0 && started.elapsed() >= max_time_slice {
                stopped_at = Some(index);
                break;
            }
            if entry.retired || !entry.token.is_alive() {
                continue;
            }

            let notifications = {
                let mut op = entry.op.borrow_mut();
                step(&mut *op);
                entry.retired = op.is_done();
                op.take_notifications()
            };
            notifications.into_iter().for_each(|n| n());
        }

        if let Some(index) = stopped_at {
            running.rotate_left(index);
        }

        let mut aborted = Vec::new();
        remove_dead(&mut running, &mut aborted);

        // Operations submitted during the tick stay pending until the next one.
        let mut slot = self.inner.running.borrow_mut();
        running.append(&mut slot);
        *slot = running;
        drop(slot);

        self.inner.ticking.set(false);
        aborted.into_iter().for_each(|n| n());
    }

    /// Remove and invalidate every operation of a group. Workers holding the
    /// group's token observe it as dead from now on.
    pub fn clear_group(&self, group: &str) {
        let Some(token) = self.inner.groups.borrow_mut().remove(group) else {
            return;
        };
        token.kill();
        debug!("Cleared operation group {group}");

        let mut aborted = Vec::new();
        remove_dead(&mut self.inner.pending.borrow_mut(), &mut aborted);
        // While ticking, the running list is owned by `tick`, which drops dead entries itself.
        if let Ok(mut running) = self.inner.running.try_borrow_mut() {
            remove_dead(&mut running, &mut aborted);
        }
        aborted.into_iter().for_each(|n| n());
    }
}

impl Default for Scheduler {
    fn default() -> Self {
        Self::new(Duration::from_millis(30))
    }
}

#[cfg(test)]
mod tests {
    use std::thread;

    use super::*;
    use crate::operation::{tests::CountdownOperation, OperationState, OperationStatus};

    struct SlowOperation {
        state: OperationState,
        updates: Rc<Cell<u32>>,
    }

    impl Operation for SlowOperation {
        fn state(&self) -> &OperationState {
            &self.state
        }

        fn state_mut(&mut self) -> &mut OperationState {
            &mut self.state
        }

        fn update(&mut self) {
            self.updates.set(self.updates.get() + 1);
            thread::sleep(Duration::from_millis(5));
        }
    }

    #[test]
    fn finished_operations_are_retired_one_tick_later() {
        let scheduler = Scheduler::default();
        let op = scheduler.submit(None, CountdownOperation::new(0));
        assert_eq!(scheduler.len(), 1);

        scheduler.tick();
        assert_eq!(op.status(), Some(OperationStatus::Succeeded));

        scheduler.tick();
        assert!(scheduler.is_empty());
        assert_eq!(op.status(), None);
    }

    #[test]
    fn time_slice_bounds_work_and_rotates() {
        let scheduler = Scheduler::new(Duration::from_millis(1));
        let counters: Vec<_> = (0..3).map(|_| Rc::new(Cell::new(0))).collect();
        for updates in &counters {
            scheduler.submit(
                None,
                SlowOperation {
                    state: OperationState::default(),
                    updates: updates.clone(),
                },
            );
        }

        scheduler.tick();
        let total: u32 = counters.iter().map(|c| c.get()).sum();
        assert_eq!(total, 1);

        scheduler.tick();
        scheduler.tick();
        assert!(counters.iter().all(|c| c.get() == 1));
    }

    #[test]
    fn clearing_a_group_invalidates_its_operations() {
        let scheduler = Scheduler::default();
        let token = scheduler.group_token(Some("pkg"));
        let doomed = scheduler.submit(Some("pkg"), CountdownOperation::new(10));
        let other = scheduler.submit(None, CountdownOperation::new(10));
        scheduler.tick();

        let keep_alive = doomed.upgrade().unwrap();
        scheduler.clear_group("pkg");

        assert!(!token.is_alive());
        assert_eq!(scheduler.len(), 1);
        assert_eq!(keep_alive.borrow().status(), OperationStatus::Failed);
        assert!(matches!(
            keep_alive.borrow().error(),
            Some(Error::GroupCleared(g)) if g == "pkg"
        ));
        assert_eq!(other.status(), Some(OperationStatus::Running));

        // A new submission under the same name gets a fresh token.
        assert!(scheduler.group_token(Some("pkg")).is_alive());
    }

    #[test]
    fn aborted_operations_still_notify() {
        struct Watched {
            state: OperationState,
            aborts: Rc<Cell<u32>>,
            queued: Vec<Notification>,
        }

        impl Operation for Watched {
            fn state(&self) -> &OperationState {
                &self.state
            }
            fn state_mut(&mut self) -> &mut OperationState {
                &mut self.state
            }
            fn update(&mut self) {}
            fn abort(&mut self, reason: Error) {
                self.state.fail(reason);
                let aborts = self.aborts.clone();
                self.queued.push(Box::new(move || aborts.set(aborts.get() + 1)));
            }
            fn take_notifications(&mut self) -> Vec<Notification> {
                mem::take(&mut self.queued)
            }
        }

        let scheduler = Scheduler::default();
        let aborts = Rc::new(Cell::new(0));
        let watched = || Watched {
            state: OperationState::default(),
            aborts: aborts.clone(),
            queued: Vec::new(),
        };
        scheduler.submit(Some("pkg"), watched());
        scheduler.tick();
        // Still pending when the group goes
        scheduler.submit(Some("pkg"), watched());

        scheduler.clear_group("pkg");
        assert_eq!(aborts.get(), 2);
        assert!(scheduler.is_empty());
        scheduler.tick();
        assert_eq!(aborts.get(), 2);
    }

    #[test]
    fn submissions_from_notifications_run_next_tick() {
        struct Spawner {
            state: OperationState,
            scheduler: Scheduler,
            spawned: Rc<RefCell<Option<OperationRef<CountdownOperation>>>>,
        }

        impl Operation for Spawner {
            fn state(&self) -> &OperationState {
                &self.state
            }
            fn state_mut(&mut self) -> &mut OperationState {
                &mut self.state
            }
            fn update(&mut self) {
                self.state.succeed();
            }
            fn take_notifications(&mut self) -> Vec<crate::operation::Notification> {
                let scheduler = self.scheduler.clone();
                let spawned = self.spawned.clone();
                vec![Box::new(move || {
                    *spawned.borrow_mut() =
                        Some(scheduler.submit(None, CountdownOperation::new(0)));
                })]
            }
        }

        let scheduler = Scheduler::default();
        let spawned = Rc::new(RefCell::new(None));
        scheduler.submit(
            None,
            Spawner {
                state: OperationState::default(),
                scheduler: scheduler.clone(),
                spawned: spawned.clone(),
            },
        );

        scheduler.tick();
        let child = spawned.borrow().clone().unwrap();
        assert_eq!(child.status(), Some(OperationStatus::None));
        scheduler.tick();
        assert_eq!(child.status(), Some(OperationStatus::Succeeded));
    }
}
