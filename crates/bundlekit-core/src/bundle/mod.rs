//! Bundle lifecycle graph
//!
//! A [`Bundle`] is a reference-counted handle to one loadable resource
//! container. Bundles depend on other bundles; a bundle becomes ready once its
//! own payload is decoded and every dependency is ready. Subscribers attached
//! with [`Bundle::on_completed`] run exactly once, on the first transition to
//! ready.
//!
//! Handles are `Rc`-based and therefore `!Send`: all graph mutation and all
//! notifications happen on the thread that owns the graph, without locks.

mod payload;

pub use payload::*;

use crate::error::BundleKitError;
use bundlekit_types::BundleInfo;
use std::cell::{Cell, RefCell};
use std::fmt;
use std::fs::File;
use std::io::{BufReader, Read};
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::path::Path;
use std::rc::{Rc, Weak};
use tracing::{debug, error, warn};

/// Readiness state of a bundle
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BundleState {
    /// Own payload or a dependency is still missing
    Pending,
    /// Own payload loaded and every dependency ready
    Ready,
    /// Released; emits nothing and holds no references
    Disposed,
}

/// Handle returned by [`Bundle::on_completed`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionId(u64);

type Subscriber = Box<dyn FnOnce(&Bundle)>;

struct Edge {
    bundle: Bundle,
    watcher: SubscriptionId,
}

struct BundleCell {
    info: BundleInfo,
    ref_count: Cell<usize>,
    state: Cell<BundleState>,
    loaded: Cell<bool>,
    dependencies: RefCell<Vec<Edge>>,
    dependents: RefCell<Vec<Weak<BundleCell>>>,
    subscribers: RefCell<Vec<(SubscriptionId, Subscriber)>>,
    next_subscription: Cell<u64>,
    payload: RefCell<Box<dyn BundlePayload>>,
}

/// A loadable, reference-counted resource container
///
/// Cloning the handle does not touch the reference count; holders declare
/// themselves with [`Bundle::add_ref`] and [`Bundle::remove_ref`].
#[derive(Clone)]
pub struct Bundle(Rc<BundleCell>);

impl Bundle {
    pub fn new(info: BundleInfo, payload: impl BundlePayload + 'static) -> Self {
        Self(Rc::new(BundleCell {
            info,
            ref_count: Cell::new(0),
            state: Cell::new(BundleState::Pending),
            loaded: Cell::new(false),
            dependencies: RefCell::new(Vec::new()),
            dependents: RefCell::new(Vec::new()),
            subscribers: RefCell::new(Vec::new()),
            next_subscription: Cell::new(0),
            payload: RefCell::new(Box::new(payload)),
        }))
    }

    /// Bundle whose payload is kept in memory as raw bytes
    pub fn with_bytes(info: BundleInfo) -> Self {
        Self::new(info, BytesPayload::new())
    }

    pub fn info(&self) -> &BundleInfo {
        &self.0.info
    }

    pub fn name(&self) -> &str {
        &self.0.info.name
    }

    pub fn state(&self) -> BundleState {
        self.0.state.get()
    }

    pub fn is_ready(&self) -> bool {
        self.state() == BundleState::Ready
    }

    pub fn is_disposed(&self) -> bool {
        self.state() == BundleState::Disposed
    }

    /// Whether the bundle's own payload has been decoded
    pub fn is_loaded(&self) -> bool {
        self.0.loaded.get()
    }

    pub fn ref_count(&self) -> usize {
        self.0.ref_count.get()
    }

    pub fn dependencies(&self) -> Vec<Bundle> {
        self.0
            .dependencies
            .borrow()
            .iter()
            .map(|edge| edge.bundle.clone())
            .collect()
    }

    /// Run `f` against the decoded payload
    pub fn with_payload<R>(&self, f: impl FnOnce(&dyn BundlePayload) -> R) -> R {
        f(self.0.payload.borrow().as_ref())
    }

    /// Whether both handles point at the same bundle
    pub fn ptr_eq(&self, other: &Bundle) -> bool {
        Rc::ptr_eq(&self.0, &other.0)
    }

    pub fn add_ref(&self) -> usize {
        let count = self.0.ref_count.get() + 1;
        self.0.ref_count.set(count);
        count
    }

    /// Drop one reference; the last one releases the bundle
    pub fn remove_ref(&self) -> usize {
        let count = self.0.ref_count.get();
        if count == 0 {
            warn!("remove_ref on bundle {} with no references", self.name());
            return 0;
        }

        self.0.ref_count.set(count - 1);
        if count == 1 {
            self.release();
        }
        count - 1
    }

    /// Depend on `other`, taking one reference on it
    ///
    /// Returns false for self, for a dependency that is already present and
    /// when this bundle is disposed.
    pub fn add_dependency(&self, other: &Bundle) -> bool {
        if self.ptr_eq(other) || self.is_disposed() {
            return false;
        }
        if self
            .0
            .dependencies
            .borrow()
            .iter()
            .any(|edge| edge.bundle.ptr_eq(other))
        {
            return false;
        }

        other.add_ref();
        self.0.dependencies.borrow_mut().push(Edge {
            bundle: other.clone(),
            watcher: SubscriptionId(u64::MAX),
        });
        {
            let mut dependents = other.0.dependents.borrow_mut();
            dependents.retain(|weak| weak.strong_count() > 0);
            dependents.push(Rc::downgrade(&self.0));
        }

        if self.is_ready() && !other.is_ready() {
            self.demote();
        }
        self.watch(other);

        debug!("Bundle {} now depends on {}", self.name(), other.name());
        true
    }

    /// Run `subscriber` once this bundle is ready
    ///
    /// Invoked right away when already ready; dropped when disposed.
    pub fn on_completed<F>(&self, subscriber: F) -> SubscriptionId
    where
        F: FnOnce(&Bundle) + 'static,
    {
        let id = SubscriptionId(self.0.next_subscription.get());
        self.0.next_subscription.set(id.0 + 1);

        match self.state() {
            BundleState::Ready => self.invoke(id, Box::new(subscriber)),
            BundleState::Pending => {
                self.0.subscribers.borrow_mut().push((id, Box::new(subscriber)))
            }
            BundleState::Disposed => {
                debug!("Ignoring subscriber on disposed bundle {}", self.name())
            }
        }
        id
    }

    /// Remove a pending subscriber without running it
    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        let mut subscribers = self.0.subscribers.borrow_mut();
        let before = subscribers.len();
        subscribers.retain(|(pending, _)| *pending != id);
        subscribers.len() != before
    }

    /// Decode the bundle's own payload from `stream`
    pub fn load(&self, stream: &mut dyn Read) -> Result<(), BundleKitError> {
        if self.is_disposed() {
            return Err(BundleKitError::Disposed(self.name().to_string()));
        }

        self.0.payload.borrow_mut().decode(&self.0.info, stream)?;
        self.0.loaded.set(true);
        debug!("Loaded payload of bundle {}", self.name());

        self.check_ready();
        Ok(())
    }

    pub fn load_file(&self, path: &Path) -> Result<(), BundleKitError> {
        let mut reader = BufReader::new(File::open(path)?);
        self.load(&mut reader)
    }

    /// Tear the bundle down regardless of its reference count
    ///
    /// Releases one reference per dependency, which may cascade. A second
    /// call is a no-op.
    pub fn release(&self) {
        if self.is_disposed() {
            return;
        }
        self.0.state.set(BundleState::Disposed);
        self.0.ref_count.set(0);

        let edges = std::mem::take(&mut *self.0.dependencies.borrow_mut());
        for edge in edges {
            edge.bundle.unsubscribe(edge.watcher);
            edge.bundle.remove_ref();
        }

        self.0.dependents.borrow_mut().clear();
        let dropped = std::mem::take(&mut *self.0.subscribers.borrow_mut());
        drop(dropped);
        self.0.payload.borrow_mut().unload();

        debug!("Released bundle {}", self.name());
    }

    /// Re-check readiness of `self` whenever `other` becomes ready
    fn watch(&self, other: &Bundle) {
        let weak: Weak<BundleCell> = Rc::downgrade(&self.0);
        let watcher = other.on_completed(move |_| {
            if let Some(cell) = weak.upgrade() {
                Bundle(cell).check_ready();
            }
        });

        if let Some(edge) = self
            .0
            .dependencies
            .borrow_mut()
            .iter_mut()
            .find(|edge| edge.bundle.ptr_eq(other))
        {
            edge.watcher = watcher;
        }
    }

    /// Drop a ready bundle back to pending, along with every ready dependent
    ///
    /// Subscribers that already ran stay gone. Dependents re-arm a watcher on
    /// this bundle so they are re-checked once it is ready again.
    fn demote(&self) {
        if !self.is_ready() {
            return;
        }
        self.0.state.set(BundleState::Pending);
        debug!("Bundle {} is pending again", self.name());

        let dependents: Vec<Bundle> = self
            .0
            .dependents
            .borrow()
            .iter()
            .filter_map(Weak::upgrade)
            .map(Bundle)
            .collect();
        for dependent in dependents.iter().filter(|d| d.is_ready()) {
            dependent.watch(self);
            dependent.demote();
        }
    }

    /// Move to ready when the own payload and every dependency are ready
    fn check_ready(&self) {
        if self.state() != BundleState::Pending || !self.is_loaded() {
            return;
        }
        let dependencies_ready = self
            .0
            .dependencies
            .borrow()
            .iter()
            .all(|edge| edge.bundle.is_ready());
        if !dependencies_ready {
            return;
        }

        self.0.state.set(BundleState::Ready);
        debug!("Bundle {} is ready", self.name());

        let subscribers = std::mem::take(&mut *self.0.subscribers.borrow_mut());
        for (id, subscriber) in subscribers {
            // A subscriber may have released us
            if self.is_disposed() {
                break;
            }
            self.invoke(id, subscriber);
        }
    }

    fn invoke(&self, id: SubscriptionId, subscriber: Subscriber) {
        if let Err(panic) = catch_unwind(AssertUnwindSafe(|| subscriber(self))) {
            let message = panic
                .downcast_ref::<&str>()
                .map(|s| s.to_string())
                .or_else(|| panic.downcast_ref::<String>().cloned())
                .unwrap_or_else(|| "unknown panic".to_string());
            error!(
                "Completion subscriber {:?} of bundle {} panicked: {}",
                id,
                self.name(),
                message
            );
        }
    }
}

impl fmt::Debug for Bundle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Bundle")
            .field("name", &self.name())
            .field("state", &self.state())
            .field("loaded", &self.is_loaded())
            .field("ref_count", &self.ref_count())
            .field("dependencies", &self.0.dependencies.borrow().len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn bundle(name: &str) -> Bundle {
        Bundle::with_bytes(BundleInfo::new(name))
    }

    fn load(bundle: &Bundle) {
        bundle.load(&mut &b"payload"[..]).unwrap();
    }

    fn counter(bundle: &Bundle) -> Rc<Cell<u32>> {
        let fired = Rc::new(Cell::new(0));
        let inner = fired.clone();
        bundle.on_completed(move |_| inner.set(inner.get() + 1));
        fired
    }

    fn chain() -> (Bundle, Bundle, Bundle) {
        let (a, b, c) = (bundle("a"), bundle("b"), bundle("c"));
        assert!(a.add_dependency(&b));
        assert!(b.add_dependency(&c));
        (a, b, c)
    }

    #[test]
    fn test_readiness_propagates_through_chain() {
        let (a, b, c) = chain();
        let fired = counter(&a);

        load(&c);
        assert!(c.is_ready());
        assert_eq!(fired.get(), 0);
        load(&b);
        assert!(b.is_ready());
        assert_eq!(fired.get(), 0);
        load(&a);

        assert!(a.is_ready());
        assert_eq!(fired.get(), 1);
    }

    #[test]
    fn test_readiness_independent_of_dependency_load_order() {
        let (a, b, c) = chain();
        let fired = counter(&a);

        load(&b);
        assert!(!b.is_ready());
        load(&c);
        assert!(b.is_ready());
        load(&a);

        assert_eq!(fired.get(), 1);
    }

    #[test]
    fn test_subscriber_on_ready_bundle_runs_immediately() {
        let c = bundle("c");
        load(&c);

        let fired = counter(&c);
        assert_eq!(fired.get(), 1);
    }

    #[test]
    fn test_notification_is_idempotent() {
        let (a, b, c) = chain();
        let fired = counter(&a);
        load(&c);
        load(&b);
        load(&a);

        // Re-evaluating readiness must not fire again
        load(&a);
        load(&b);
        a.check_ready();

        assert_eq!(fired.get(), 1);
    }

    #[test]
    fn test_unsubscribe_before_ready() {
        let a = bundle("a");
        let fired = Rc::new(Cell::new(false));
        let inner = fired.clone();
        let id = a.on_completed(move |_| inner.set(true));

        assert!(a.unsubscribe(id));
        assert!(!a.unsubscribe(id));
        load(&a);

        assert!(!fired.get());
    }

    #[test]
    fn test_panicking_subscriber_is_isolated() {
        let a = bundle("a");
        a.on_completed(|_| panic!("subscriber exploded"));
        let fired = counter(&a);

        load(&a);

        assert!(a.is_ready());
        assert_eq!(fired.get(), 1);
    }

    #[test]
    fn test_no_self_or_duplicate_dependency() {
        let a = bundle("a");
        let b = bundle("b");

        assert!(!a.add_dependency(&a));
        assert!(a.dependencies().is_empty());
        assert_eq!(a.ref_count(), 0);

        assert!(a.add_dependency(&b));
        assert!(!a.add_dependency(&b));
        assert_eq!(a.dependencies().len(), 1);
        assert_eq!(b.ref_count(), 1);
    }

    #[test]
    fn test_ready_dependency_added_late() {
        let c = bundle("c");
        let d = bundle("d");
        load(&d);
        let fired = counter(&c);
        assert!(c.add_dependency(&d));
        load(&c);
        assert_eq!(fired.get(), 1);
    }

    #[test]
    fn test_ready_bundle_waits_for_unloaded_dependency() {
        let a = bundle("a");
        let b = bundle("b");
        load(&a);
        assert!(a.is_ready());

        assert!(a.add_dependency(&b));
        assert_eq!(a.state(), BundleState::Pending);
        let fired = counter(&a);
        assert_eq!(fired.get(), 0);

        load(&b);
        assert!(a.is_ready());
        assert_eq!(fired.get(), 1);
    }

    #[test]
    fn test_unloaded_dependency_demotes_ready_dependents() {
        let top = bundle("top");
        let a = bundle("a");
        let b = bundle("b");
        assert!(top.add_dependency(&a));
        load(&a);
        load(&top);
        let early = counter(&top);
        assert_eq!(early.get(), 1);

        assert!(a.add_dependency(&b));
        assert!(!top.is_ready());
        let late = counter(&top);
        assert_eq!(late.get(), 0);

        load(&b);
        assert!(a.is_ready());
        assert!(top.is_ready());
        assert_eq!(early.get(), 1);
        assert_eq!(late.get(), 1);
    }

    #[test]
    fn test_remove_ref_cascades_to_sole_dependency() {
        let (a, b, c) = chain();
        a.add_ref();

        assert_eq!(a.remove_ref(), 0);

        assert!(a.is_disposed());
        assert!(b.is_disposed());
        assert!(c.is_disposed());
        assert!(a.dependencies().is_empty());
    }

    #[test]
    fn test_shared_dependency_survives_one_holder() {
        let a = bundle("a");
        let x = bundle("x");
        let b = bundle("b");
        a.add_ref();
        x.add_ref();
        a.add_dependency(&b);
        x.add_dependency(&b);
        assert_eq!(b.ref_count(), 2);

        a.remove_ref();
        assert!(a.is_disposed());
        assert!(!b.is_disposed());
        assert_eq!(b.ref_count(), 1);

        x.remove_ref();
        assert!(b.is_disposed());
    }

    #[test]
    fn test_release_is_idempotent() {
        let a = bundle("a");
        let b = bundle("b");
        b.add_ref();
        a.add_dependency(&b);
        assert_eq!(b.ref_count(), 2);

        a.release();
        a.release();

        assert_eq!(b.ref_count(), 1);
        assert!(!b.is_disposed());
    }

    #[test]
    fn test_remove_ref_at_zero_is_ignored() {
        let a = bundle("a");
        assert_eq!(a.remove_ref(), 0);
        assert!(!a.is_disposed());
    }

    #[test]
    fn test_disposed_bundle_is_inert() {
        let (a, b, c) = chain();
        let fired = counter(&a);
        load(&c);
        a.release();

        assert!(matches!(
            a.load(&mut &b"x"[..]),
            Err(BundleKitError::Disposed(_))
        ));
        assert!(!a.add_dependency(&c));
        assert!(b.is_disposed());
        assert!(c.is_disposed());

        let late = counter(&a);
        assert_eq!(fired.get(), 0);
        assert_eq!(late.get(), 0);
        assert!(a.with_payload(|p| p.data().map_or(true, <[u8]>::is_empty)));
    }

    #[test]
    fn test_released_dependency_stops_watching() {
        let (a, b, c) = chain();
        b.add_ref();
        let fired = counter(&a);

        a.release();
        load(&c);
        load(&b);

        assert!(b.is_ready());
        assert_eq!(fired.get(), 0);
        assert!(b.0.subscribers.borrow().is_empty());
    }

    #[test]
    fn test_subscriber_releasing_bundle_stops_notification() {
        let a = bundle("a");
        a.on_completed(|bundle| bundle.release());
        let fired = counter(&a);

        load(&a);

        assert!(a.is_disposed());
        assert_eq!(fired.get(), 0);
    }

    #[test]
    fn test_dependency_cycle_never_becomes_ready() {
        let a = bundle("a");
        let b = bundle("b");
        assert!(a.add_dependency(&b));
        assert!(b.add_dependency(&a));
        let fired = counter(&a);

        load(&a);
        load(&b);

        assert!(!a.is_ready());
        assert_eq!(fired.get(), 0);
    }

    #[test]
    fn test_load_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(b"bundle bytes").unwrap();

        let a = Bundle::with_bytes(BundleInfo::new("a").with_size(12));
        a.load_file(file.path()).unwrap();

        assert!(a.is_ready());
        let data = a.with_payload(|p| p.data().map(<[u8]>::to_vec));
        assert_eq!(data, Some(b"bundle bytes".to_vec()));
    }
}
