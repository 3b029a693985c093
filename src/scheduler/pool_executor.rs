//! Multi-worker executor.
//!
//! Every worker lives in one slot table keyed by worker id. A slot is
//! `Starting` while its worker initializes, then `Idle`, `Busy` with a task,
//! or `Reserved` by a session. Dead workers are evicted from the table so
//! their capacity can be spawned again.

use std::collections::BTreeMap;
use std::sync::{Arc, Weak};

use futures::future::{self, BoxFuture, FutureExt};
use parking_lot::Mutex;
use tracing::{debug, info, warn};

use super::executor::{CapacityListener, ExecutorError, ReserveFuture, TaskExecutor};
use super::handle::{HandleState, WorkerHandle};
use super::task::InternalTask;
use crate::protocol::{InitOptions, TaskError, TaskId, TaskResult, WorkerId};
use crate::transport::TransportFactory;

#[derive(Debug, Clone, PartialEq, Eq)]
enum Purpose {
    Warm,
    Task { task_id: TaskId, cancelled: bool },
    Session,
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum SlotState {
    Starting(Purpose),
    Idle,
    Busy(TaskId),
    Reserved,
}

struct Slot {
    state: SlotState,
    handle: Option<Arc<WorkerHandle>>,
}

impl Slot {
    fn is_dead(&self) -> bool {
        self.handle.as_ref().is_some_and(|h| !h.is_alive())
    }

    fn is_idle_ready(&self) -> bool {
        self.state == SlotState::Idle && self.handle.as_ref().is_some_and(|h| h.is_idle())
    }
}

#[derive(Default)]
struct Table {
    slots: BTreeMap<WorkerId, Slot>,
    next_id: u64,
    disposed: bool,
}

impl Table {
    /// Evict dead workers that no task future is still tracking.
    fn prune(&mut self) -> Vec<Arc<WorkerHandle>> {
        let dead: Vec<WorkerId> = self
            .slots
            .iter()
            .filter(|(_, slot)| {
                matches!(slot.state, SlotState::Idle | SlotState::Reserved) && slot.is_dead()
            })
            .map(|(id, _)| *id)
            .collect();
        dead.into_iter()
            .filter_map(|id| {
                warn!(worker_id = id.0, "evicting dead worker");
                self.slots.remove(&id).and_then(|slot| slot.handle)
            })
            .collect()
    }

    fn claim_idle(&mut self, state: SlotState) -> Option<(WorkerId, Arc<WorkerHandle>)> {
        let (id, slot) = self.slots.iter_mut().find(|(_, slot)| slot.is_idle_ready())?;
        slot.state = state;
        slot.handle.clone().map(|handle| (*id, handle))
    }

    fn start_new(&mut self, pool_size: usize, purpose: Purpose) -> Option<WorkerId> {
        if self.slots.len() >= pool_size {
            return None;
        }
        self.next_id += 1;
        let id = WorkerId(self.next_id);
        self.slots.insert(id, Slot { state: SlotState::Starting(purpose), handle: None });
        Some(id)
    }

    fn available(&self, pool_size: usize) -> usize {
        let idle = self.slots.values().filter(|slot| slot.is_idle_ready()).count();
        idle + pool_size.saturating_sub(self.slots.len())
    }
}

enum Claim {
    Existing(WorkerId, Arc<WorkerHandle>),
    Spawn(WorkerId),
}

struct Shared {
    pool_size: usize,
    transports: Arc<dyn TransportFactory>,
    init: InitOptions,
    table: Mutex<Table>,
    listener: Mutex<Option<CapacityListener>>,
}

impl Shared {
    fn notify(&self) {
        let listener = self.listener.lock().clone();
        if let Some(listener) = listener {
            listener();
        }
    }

    fn on_worker_event(&self, worker_id: WorkerId) {
        let evicted = self.table.lock().prune();
        debug!(worker_id = worker_id.0, evicted = evicted.len(), "worker capacity changed");
        for handle in evicted {
            handle.dispose();
        }
        self.notify();
    }

    async fn spawn_worker(self: Arc<Self>, id: WorkerId) -> Result<Arc<WorkerHandle>, ExecutorError> {
        let handle = WorkerHandle::spawn(id, self.transports.as_ref(), self.init.clone())
            .await
            .map_err(|e| ExecutorError::WorkerInit(e.to_string()))?;
        let weak: Weak<Shared> = Arc::downgrade(&self);
        handle.set_idle_listener(Arc::new(move |worker_id| {
            if let Some(shared) = weak.upgrade() {
                shared.on_worker_event(worker_id);
            }
        }));
        Ok(handle)
    }

    /// Move a started worker into its slot. `None` if the slot is gone.
    fn install(&self, id: WorkerId, handle: &Arc<WorkerHandle>, next: SlotState) -> Option<Purpose> {
        let mut table = self.table.lock();
        if table.disposed {
            return None;
        }
        let slot = table.slots.get_mut(&id)?;
        let SlotState::Starting(purpose) = slot.state.clone() else {
            return None;
        };
        slot.handle = Some(Arc::clone(handle));
        slot.state = next;
        Some(purpose)
    }

    /// Return a worker to the idle set after a task, or evict it if it died.
    fn finish(&self, id: WorkerId, handle: &Arc<WorkerHandle>) {
        let evicted = {
            let mut table = self.table.lock();
            if !handle.is_alive() {
                table.slots.remove(&id).is_some()
            } else {
                if let Some(slot) = table.slots.get_mut(&id) {
                    if matches!(slot.state, SlotState::Busy(_)) {
                        slot.state = SlotState::Idle;
                    }
                }
                false
            }
        };
        if evicted {
            warn!(worker_id = id.0, "evicting crashed worker");
            handle.dispose();
        }
    }
}

/// Removes a `Starting` slot unless the start completed.
struct StartGuard {
    shared: Arc<Shared>,
    id: WorkerId,
    armed: bool,
}

impl StartGuard {
    fn new(shared: &Arc<Shared>, id: WorkerId) -> Self {
        Self { shared: Arc::clone(shared), id, armed: true }
    }

    fn disarm(mut self) {
        self.armed = false;
    }
}

impl Drop for StartGuard {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        let removed = {
            let mut table = self.shared.table.lock();
            let starting = table
                .slots
                .get(&self.id)
                .is_some_and(|slot| matches!(slot.state, SlotState::Starting(_)));
            if starting {
                table.slots.remove(&self.id);
            }
            starting
        };
        if removed {
            self.shared.notify();
        }
    }
}

pub struct WorkerPoolExecutor {
    shared: Arc<Shared>,
}

impl WorkerPoolExecutor {
    pub fn new(pool_size: usize, transports: Arc<dyn TransportFactory>, init: InitOptions) -> Self {
        Self {
            shared: Arc::new(Shared {
                pool_size: pool_size.max(1),
                transports,
                init,
                table: Mutex::new(Table::default()),
                listener: Mutex::new(None),
            }),
        }
    }

    /// Start every worker up front. Any failure disposes the executor.
    pub async fn pre_warm(&self) -> Result<(), ExecutorError> {
        let ids: Vec<WorkerId> = {
            let mut table = self.shared.table.lock();
            if table.disposed {
                return Err(ExecutorError::Disposed);
            }
            std::iter::from_fn(|| table.start_new(self.shared.pool_size, Purpose::Warm)).collect()
        };
        info!(workers = ids.len(), "pre-warming worker pool");

        let starts = ids.into_iter().map(|id| {
            let shared = Arc::clone(&self.shared);
            async move {
                let guard = StartGuard::new(&shared, id);
                let handle = Arc::clone(&shared).spawn_worker(id).await?;
                match shared.install(id, &handle, SlotState::Idle) {
                    Some(_) => {
                        guard.disarm();
                        Ok::<(), ExecutorError>(())
                    }
                    None => {
                        handle.dispose();
                        Err(ExecutorError::Disposed)
                    }
                }
            }
        });
        if let Err(e) = future::try_join_all(starts).await {
            warn!(error = %e, "pre-warm failed");
            self.dispose();
            return Err(e);
        }
        Ok(())
    }

    /// Number of worker slots in use, starting ones included.
    pub fn worker_count(&self) -> usize {
        self.shared.table.lock().slots.len()
    }

    fn track(
        &self,
        id: WorkerId,
        handle: Arc<WorkerHandle>,
        run: BoxFuture<'static, TaskResult>,
    ) -> BoxFuture<'static, TaskResult> {
        let shared = Arc::clone(&self.shared);
        async move {
            let result = run.await;
            shared.finish(id, &handle);
            result
        }
        .boxed()
    }

    fn spawn_and_run(&self, id: WorkerId, task: InternalTask) -> BoxFuture<'static, TaskResult> {
        let shared = Arc::clone(&self.shared);
        async move {
            let guard = StartGuard::new(&shared, id);
            let handle = match Arc::clone(&shared).spawn_worker(id).await {
                Ok(handle) => handle,
                Err(e) => {
                    drop(guard);
                    return Err(TaskError::worker_crash(&task.id, &e.to_string()));
                }
            };
            let purpose = shared.install(id, &handle, SlotState::Busy(task.id.clone()));
            guard.disarm();
            match purpose {
                None => {
                    handle.dispose();
                    return Err(TaskError::disposed());
                }
                Some(Purpose::Task { cancelled: true, .. }) => {
                    shared.finish(id, &handle);
                    shared.notify();
                    return Err(TaskError::cancelled());
                }
                Some(_) => {}
            }

            debug!(worker_id = id.0, task_id = %task.id, "dispatching to new worker");
            let result = match handle.execute(task.id.clone(), task.code, task.filename, task.timeout) {
                Ok(run) => run.await,
                Err(e) => Err(TaskError::worker_crash(&task.id, &e.to_string())),
            };
            shared.finish(id, &handle);
            result
        }
        .boxed()
    }
}

impl TaskExecutor for WorkerPoolExecutor {
    fn execute(&self, task: &InternalTask) -> Result<BoxFuture<'static, TaskResult>, ExecutorError> {
        loop {
            let (claim, evicted) = {
                let mut table = self.shared.table.lock();
                if table.disposed {
                    return Err(ExecutorError::Disposed);
                }
                let evicted = table.prune();
                let claim = if let Some((id, handle)) =
                    table.claim_idle(SlotState::Busy(task.id.clone()))
                {
                    Some(Claim::Existing(id, handle))
                } else {
                    let purpose = Purpose::Task { task_id: task.id.clone(), cancelled: false };
                    table.start_new(self.shared.pool_size, purpose).map(Claim::Spawn)
                };
                (claim, evicted)
            };
            for handle in evicted {
                handle.dispose();
            }

            match claim {
                None => return Err(ExecutorError::NoWorkerAvailable),
                Some(Claim::Spawn(id)) => {
                    info!(worker_id = id.0, task_id = %task.id, "spawning worker");
                    return Ok(self.spawn_and_run(id, task.clone()));
                }
                Some(Claim::Existing(id, handle)) => {
                    match handle.execute(
                        task.id.clone(),
                        task.code.clone(),
                        task.filename.clone(),
                        task.timeout,
                    ) {
                        Ok(run) => {
                            debug!(worker_id = id.0, task_id = %task.id, "dispatching to idle worker");
                            return Ok(self.track(id, handle, run));
                        }
                        // Lost a race with a crash or drain; release and look again.
                        Err(_) => self.shared.finish(id, &handle),
                    }
                }
            }
        }
    }

    fn cancel(&self, task_id: &TaskId) -> bool {
        let handle = {
            let mut table = self.shared.table.lock();
            let mut found = None;
            for slot in table.slots.values_mut() {
                match &mut slot.state {
                    SlotState::Busy(id) if id == task_id => {
                        found = slot.handle.clone();
                        break;
                    }
                    SlotState::Starting(Purpose::Task { task_id: id, cancelled }) if id == task_id => {
                        *cancelled = true;
                        return true;
                    }
                    _ => {}
                }
            }
            found
        };
        handle.is_some_and(|h| h.cancel_current(task_id))
    }

    fn available_count(&self) -> usize {
        let (available, evicted) = {
            let mut table = self.shared.table.lock();
            if table.disposed {
                return 0;
            }
            let evicted = table.prune();
            (table.available(self.shared.pool_size), evicted)
        };
        for handle in evicted {
            handle.dispose();
        }
        available
    }

    fn busy_count(&self) -> usize {
        let table = self.shared.table.lock();
        table
            .slots
            .values()
            .filter(|slot| match &slot.state {
                SlotState::Busy(_) | SlotState::Starting(Purpose::Task { .. }) => true,
                SlotState::Idle | SlotState::Reserved => slot
                    .handle
                    .as_ref()
                    .is_some_and(|h| matches!(h.state(), HandleState::Busy | HandleState::Draining)),
                SlotState::Starting(_) => false,
            })
            .count()
    }

    fn max_concurrency(&self) -> usize {
        self.shared.pool_size
    }

    fn is_multi_threaded(&self) -> bool {
        true
    }

    fn reserve_worker_for_session(&self) -> ReserveFuture {
        let claim = {
            let mut table = self.shared.table.lock();
            if table.disposed {
                return future::ready(Err(ExecutorError::Disposed)).boxed();
            }
            let evicted = table.prune();
            let claim = match table.claim_idle(SlotState::Reserved) {
                Some((id, handle)) => Some(Claim::Existing(id, handle)),
                None => table.start_new(self.shared.pool_size, Purpose::Session).map(Claim::Spawn),
            };
            drop(table);
            for handle in evicted {
                handle.dispose();
            }
            claim
        };

        match claim {
            None => future::ready(Err(ExecutorError::NoWorkerAvailable)).boxed(),
            Some(Claim::Existing(id, handle)) => {
                debug!(worker_id = id.0, "reserved idle worker for session");
                future::ready(Ok(handle)).boxed()
            }
            Some(Claim::Spawn(id)) => {
                let shared = Arc::clone(&self.shared);
                async move {
                    let guard = StartGuard::new(&shared, id);
                    let handle = Arc::clone(&shared).spawn_worker(id).await?;
                    match shared.install(id, &handle, SlotState::Reserved) {
                        Some(_) => {
                            guard.disarm();
                            debug!(worker_id = id.0, "reserved new worker for session");
                            Ok::<_, ExecutorError>(handle)
                        }
                        None => {
                            handle.dispose();
                            Err(ExecutorError::Disposed)
                        }
                    }
                }
                .boxed()
            }
        }
    }

    fn release_reserved_worker(&self, worker_id: WorkerId) {
        let evicted = {
            let mut table = self.shared.table.lock();
            let Some(slot) = table.slots.get_mut(&worker_id) else {
                return;
            };
            if slot.state != SlotState::Reserved {
                return;
            }
            if slot.is_dead() {
                table.slots.remove(&worker_id).and_then(|slot| slot.handle)
            } else {
                slot.state = SlotState::Idle;
                None
            }
        };
        if let Some(handle) = evicted {
            handle.dispose();
        }
        debug!(worker_id = worker_id.0, "released session worker");
        self.shared.notify();
    }

    fn reserved_count(&self) -> usize {
        let table = self.shared.table.lock();
        table
            .slots
            .values()
            .filter(|slot| {
                matches!(slot.state, SlotState::Reserved | SlotState::Starting(Purpose::Session))
            })
            .count()
    }

    fn set_capacity_listener(&self, listener: CapacityListener) {
        *self.shared.listener.lock() = Some(listener);
    }

    fn dispose(&self) {
        let handles: Vec<Arc<WorkerHandle>> = {
            let mut table = self.shared.table.lock();
            if table.disposed {
                return;
            }
            table.disposed = true;
            std::mem::take(&mut table.slots).into_values().filter_map(|slot| slot.handle).collect()
        };
        *self.shared.listener.lock() = None;
        info!(workers = handles.len(), "disposing worker pool executor");
        for handle in handles {
            handle.dispose();
        }
    }

    fn kind(&self) -> &'static str {
        "worker-pool"
    }
}

impl Drop for WorkerPoolExecutor {
    fn drop(&mut self) {
        self.dispose();
    }
}
