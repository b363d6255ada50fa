//! Bookkeeping of live download engines for coordinated shutdown

use bundlekit_types::WorkerPriority;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::{Arc, Weak};
use tracing::info;
use uuid::Uuid;

/// Something the registry can shut down
pub(crate) trait Abortable: Send + Sync {
    fn abort(&self);
    fn priority(&self) -> WorkerPriority;
}

/// Registry of running engines
///
/// Engines register on construction and deregister when aborted. The owner
/// calls [`WorkerRegistry::shutdown_all`] when the process winds down.
#[derive(Clone, Default)]
pub struct WorkerRegistry {
    workers: Arc<Mutex<HashMap<Uuid, Weak<dyn Abortable>>>>,
}

impl WorkerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub(crate) fn add(&self, id: Uuid, worker: Weak<dyn Abortable>) {
        self.workers.lock().insert(id, worker);
    }

    pub(crate) fn remove(&self, id: Uuid) {
        self.workers.lock().remove(&id);
    }

    /// Number of registered engines
    pub fn len(&self) -> usize {
        self.workers.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Abort every registered engine, lowest priority lane first
    pub fn shutdown_all(&self) {
        // Engines deregister themselves while aborting, so collect first.
        let mut live: Vec<Arc<dyn Abortable>> = self
            .workers
            .lock()
            .drain()
            .filter_map(|(_, worker)| worker.upgrade())
            .collect();
        live.sort_by_key(|worker| worker.priority());

        info!("Shutting down {} download engine(s)", live.len());
        for worker in live {
            worker.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, Ordering};

    struct Fake {
        aborted: AtomicBool,
        registry: WorkerRegistry,
        id: Uuid,
    }

    impl Abortable for Fake {
        fn abort(&self) {
            self.registry.remove(self.id);
            self.aborted.store(true, Ordering::SeqCst);
        }

        fn priority(&self) -> WorkerPriority {
            WorkerPriority::Normal
        }
    }

    #[test]
    fn test_shutdown_all_aborts_and_empties() {
        let registry = WorkerRegistry::new();
        let id = Uuid::new_v4();
        let fake = Arc::new(Fake {
            aborted: AtomicBool::new(false),
            registry: registry.clone(),
            id,
        });
        let as_dyn: Arc<dyn Abortable> = fake.clone();
        registry.add(id, Arc::downgrade(&as_dyn));
        assert_eq!(registry.len(), 1);

        registry.shutdown_all();

        assert!(fake.aborted.load(Ordering::SeqCst));
        assert!(registry.is_empty());
    }

    struct Ranked {
        priority: WorkerPriority,
        aborted: Arc<Mutex<Vec<WorkerPriority>>>,
    }

    impl Abortable for Ranked {
        fn abort(&self) {
            self.aborted.lock().push(self.priority);
        }

        fn priority(&self) -> WorkerPriority {
            self.priority
        }
    }

    #[test]
    fn test_shutdown_all_aborts_lowest_priority_first() {
        let registry = WorkerRegistry::new();
        let aborted = Arc::new(Mutex::new(Vec::new()));
        let workers: Vec<Arc<dyn Abortable>> = [
            WorkerPriority::High,
            WorkerPriority::Low,
            WorkerPriority::Normal,
        ]
        .into_iter()
        .map(|priority| {
            Arc::new(Ranked {
                priority,
                aborted: aborted.clone(),
            }) as Arc<dyn Abortable>
        })
        .collect();
        for worker in &workers {
            registry.add(Uuid::new_v4(), Arc::downgrade(worker));
        }

        registry.shutdown_all();

        assert_eq!(
            aborted.lock().as_slice(),
            [
                WorkerPriority::Low,
                WorkerPriority::Normal,
                WorkerPriority::High
            ]
        );
        assert!(registry.is_empty());
    }

    #[test]
    fn test_dead_entries_are_skipped() {
        let registry = WorkerRegistry::new();
        let id = Uuid::new_v4();
        {
            let fake: Arc<dyn Abortable> = Arc::new(Fake {
                aborted: AtomicBool::new(false),
                registry: registry.clone(),
                id,
            });
            registry.add(id, Arc::downgrade(&fake));
        }
        registry.shutdown_all();
        assert!(registry.is_empty());
    }
}
