//! Scope tree: explicit, cascading lifetime management
//!
//! An [`NdScope`] owns every resource created through it: leaf arrays and
//! child scopes alike. Closing a scope releases its whole sub-tree exactly
//! once, in a cascade that keeps going past individual release failures.
//!
//! The tree is anchored by a root sentinel created by the runtime. The root
//! never tracks resources and never closes, so anything attached to it is
//! the caller's responsibility to release. Every other scope starts open,
//! registers its resources in an identity-keyed registry, and flips a
//! one-way closed flag when released.
//!
//! Locking discipline: a scope's registry lock is never held across a call
//! into a resource or into the backend. The cascade snapshots the registry,
//! drops the lock, then closes each resource. Transfers between two scopes
//! take both registry locks in scope-id order.

pub mod array;
mod factory;

pub use array::NdArray;

use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};

use crate::backend::NativeBackend;
use crate::device::Device;
use crate::error::{NdResult, NdScopeError};

static NEXT_RESOURCE_ID: AtomicU64 = AtomicU64::new(1);

/// Process-unique identity of a scope or array.
///
/// Registry keys and lock-ordering decisions both use this id; it is never
/// reused within a process.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ResourceId(u64);

impl ResourceId {
    pub(crate) fn next() -> ResourceId {
        ResourceId(NEXT_RESOURCE_ID.fetch_add(1, Ordering::Relaxed))
    }
}

impl fmt::Display for ResourceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "res-{}", self.0)
    }
}

/// Anything a scope can own: arrays and child scopes.
pub(crate) trait ScopedResource: Send + Sync {
    fn resource_id(&self) -> ResourceId;

    /// Release the resource's native memory (for a child scope: cascade).
    /// Called at most once per resource by the owning scope's close.
    fn release(&self) -> NdResult<()>;
}

/// Position of a scope in the tree.
pub(crate) enum ScopeKind {
    /// Sentinel anchoring the tree. Never tracks, never closes.
    Root,
    /// Ordinary scope with a parent it reports to on close.
    Child { parent: Weak<ScopeInner> },
}

pub(crate) struct ScopeInner {
    pub(crate) id: ResourceId,
    kind: ScopeKind,
    pub(crate) device: Device,
    pub(crate) backend: Arc<dyn NativeBackend>,
    registry: Mutex<HashMap<ResourceId, Arc<dyn ScopedResource>>>,
    closed: AtomicBool,
}

impl ScopeInner {
    pub(crate) fn is_root(&self) -> bool {
        matches!(self.kind, ScopeKind::Root)
    }

    pub(crate) fn is_open(&self) -> bool {
        self.is_root() || !self.closed.load(Ordering::SeqCst)
    }

    /// Register a resource. The closed flag is checked under the registry
    /// lock so a resource can never slip in behind a concurrent close and
    /// leak.
    pub(crate) fn attach_resource(&self, resource: Arc<dyn ScopedResource>) -> NdResult<()> {
        if self.is_root() {
            // The sentinel tracks nothing; attached resources are the
            // caller's responsibility.
            return Ok(());
        }
        let mut registry = self.registry.lock()?;
        if self.closed.load(Ordering::SeqCst) {
            return Err(NdScopeError::ScopeClosed);
        }
        registry.insert(resource.resource_id(), resource);
        Ok(())
    }

    /// Unregister a resource on behalf of the caller, who takes over its
    /// lifetime. Errors if the scope has already been closed.
    pub(crate) fn detach_resource(&self, id: ResourceId) -> NdResult<()> {
        if self.is_root() {
            return Ok(());
        }
        let mut registry = self.registry.lock()?;
        if self.closed.load(Ordering::SeqCst) {
            return Err(NdScopeError::ScopeClosed);
        }
        registry.remove(&id);
        Ok(())
    }

    /// Unregister without a liveness check. Used by a resource's own close
    /// to tell its owner it is gone; during a cascade the entry has already
    /// been drained and this is a no-op.
    pub(crate) fn detach_quiet(&self, id: ResourceId) {
        if self.is_root() {
            return;
        }
        if let Ok(mut registry) = self.registry.lock() {
            registry.remove(&id);
        }
    }

    /// Close the scope and release everything it owns.
    ///
    /// Idempotent: the first caller wins the closed flag and runs the
    /// cascade; later calls return immediately. Individual release failures
    /// are logged and counted, never propagated, so one stubborn buffer
    /// cannot strand the rest of the sub-tree.
    pub(crate) fn close_cascade(&self) -> NdResult<()> {
        if self.is_root() {
            return Ok(());
        }
        if self.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }

        let snapshot: Vec<Arc<dyn ScopedResource>> = {
            let mut registry = self.registry.lock()?;
            std::mem::take(&mut *registry).into_values().collect()
        };

        tracing::debug!(scope = %self.id, resources = snapshot.len(), "closing scope");

        let mut failures = 0usize;
        for resource in snapshot {
            if let Err(err) = resource.release() {
                failures += 1;
                tracing::warn!(
                    scope = %self.id,
                    resource = %resource.resource_id(),
                    error = %err,
                    "resource release failed during scope close"
                );
            }
        }
        if failures > 0 {
            tracing::warn!(
                scope = %self.id,
                failures,
                "scope closed with release failures; affected native memory may leak"
            );
        }

        if let ScopeKind::Child { parent } = &self.kind {
            if let Some(parent) = parent.upgrade() {
                parent.detach_quiet(self.id);
            }
        }
        Ok(())
    }
}

impl ScopedResource for ScopeInner {
    fn resource_id(&self) -> ResourceId {
        self.id
    }

    fn release(&self) -> NdResult<()> {
        self.close_cascade()
    }
}

/// Move a resource from one scope's registry to another, atomically with
/// respect to closes on either side. Registry locks are taken in scope-id
/// order. Fails with `ScopeClosed` (and leaves the resource where it was)
/// if the destination has been closed.
pub(crate) fn transfer_resource(
    from: &Arc<ScopeInner>,
    to: &Arc<ScopeInner>,
    id: ResourceId,
    resource: Arc<dyn ScopedResource>,
) -> NdResult<()> {
    if to.is_root() {
        // Destination tracks nothing; just drop the old registration.
        if !from.is_root() {
            from.detach_quiet(id);
        }
        return Ok(());
    }
    if from.is_root() {
        return to.attach_resource(resource);
    }

    let (first, second) = if from.id <= to.id {
        (from, to)
    } else {
        (to, from)
    };
    let mut first_guard = first.registry.lock()?;
    let mut second_guard = second.registry.lock()?;
    let (from_registry, to_registry) = if from.id <= to.id {
        (&mut *first_guard, &mut *second_guard)
    } else {
        (&mut *second_guard, &mut *first_guard)
    };

    if to.closed.load(Ordering::SeqCst) {
        return Err(NdScopeError::ScopeClosed);
    }
    from_registry.remove(&id);
    to_registry.insert(id, resource);
    Ok(())
}

/// A node in the scope tree.
///
/// `NdScope` is a cheap clonable handle; all clones refer to the same
/// underlying scope. Closing any clone closes the scope for all of them.
#[derive(Clone)]
pub struct NdScope {
    pub(crate) inner: Arc<ScopeInner>,
}

impl NdScope {
    pub(crate) fn new_root(backend: Arc<dyn NativeBackend>, device: Device) -> NdScope {
        NdScope {
            inner: Arc::new(ScopeInner {
                id: ResourceId::next(),
                kind: ScopeKind::Root,
                device,
                backend,
                registry: Mutex::new(HashMap::new()),
                closed: AtomicBool::new(false),
            }),
        }
    }

    /// Create a child scope owned by this one.
    ///
    /// The child inherits this scope's device unless `device` overrides it,
    /// and is released when this scope closes. Fails with `ScopeClosed` if
    /// this scope has already been closed.
    pub fn new_sub_scope(&self, device: Option<Device>) -> NdResult<NdScope> {
        let resolved = Device::default_if_none(device, self.inner.device);
        let child = Arc::new(ScopeInner {
            id: ResourceId::next(),
            kind: ScopeKind::Child {
                parent: Arc::downgrade(&self.inner),
            },
            device: resolved,
            backend: self.inner.backend.clone(),
            registry: Mutex::new(HashMap::new()),
            closed: AtomicBool::new(false),
        });
        self.inner
            .attach_resource(child.clone() as Arc<dyn ScopedResource>)?;
        tracing::debug!(scope = %child.id, parent = %self.inner.id, device = %resolved, "opened scope");
        Ok(NdScope { inner: child })
    }

    /// Take ownership of an array, detaching it from its current scope.
    ///
    /// Equivalent to [`NdArray::move_to`]. Fails with `ScopeClosed` if this
    /// scope has already been closed; the array then stays where it was.
    pub fn attach(&self, array: &NdArray) -> NdResult<()> {
        array.move_to(self)
    }

    /// Give up ownership of an array without releasing it. The caller
    /// becomes responsible for closing the array.
    ///
    /// Fails with `ScopeClosed` if this scope has already been closed.
    pub fn detach(&self, array: &NdArray) -> NdResult<()> {
        self.inner.detach_resource(array.id())?;
        array.clear_owner()?;
        Ok(())
    }

    /// Close this scope and release every resource it owns, recursively.
    ///
    /// Safe to call more than once; only the first call does work. On the
    /// root sentinel this is a no-op.
    pub fn close(&self) -> NdResult<()> {
        self.inner.close_cascade()
    }

    /// Scope identity
    pub fn id(&self) -> ResourceId {
        self.inner.id
    }

    /// Default device for allocations made through this scope
    pub fn device(&self) -> Device {
        self.inner.device
    }

    /// Whether resources can still be attached. The root sentinel is always
    /// open.
    pub fn is_open(&self) -> bool {
        self.inner.is_open()
    }

    /// Whether this is the tree's root sentinel
    pub fn is_root(&self) -> bool {
        self.inner.is_root()
    }

    /// Number of directly-owned live resources (arrays and child scopes)
    pub fn resource_count(&self) -> usize {
        if self.inner.is_root() {
            return 0;
        }
        self.inner
            .registry
            .lock()
            .map(|registry| registry.len())
            .unwrap_or(0)
    }

    /// Parent scope, if this scope has one and it is still alive
    pub fn parent(&self) -> Option<NdScope> {
        match &self.inner.kind {
            ScopeKind::Root => None,
            ScopeKind::Child { parent } => parent.upgrade().map(|inner| NdScope { inner }),
        }
    }
}

impl fmt::Debug for NdScope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("NdScope")
            .field("id", &self.inner.id)
            .field("device", &self.inner.device)
            .field("root", &self.inner.is_root())
            .field("open", &self.inner.is_open())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::HostBackend;
    use crate::tensor::{DataType, Shape};

    fn root_with_backend() -> (NdScope, Arc<HostBackend>) {
        let backend = Arc::new(HostBackend::new());
        let root = NdScope::new_root(backend.clone(), Device::Cpu);
        (root, backend)
    }

    #[test]
    fn test_root_sentinel_never_closes() {
        let (root, _) = root_with_backend();
        assert!(root.is_root());
        assert!(root.is_open());
        root.close().unwrap();
        assert!(root.is_open());
    }

    #[test]
    fn test_root_does_not_track_children() {
        let (root, _) = root_with_backend();
        let scope = root.new_sub_scope(None).unwrap();
        assert_eq!(root.resource_count(), 0);
        assert!(scope.is_open());
        scope.close().unwrap();
    }

    #[test]
    fn test_close_is_idempotent() {
        let (root, backend) = root_with_backend();
        let scope = root.new_sub_scope(None).unwrap();
        scope
            .create(Shape::of(&[4]), DataType::F32, None)
            .unwrap();

        scope.close().unwrap();
        scope.close().unwrap();
        assert_eq!(backend.release_count(), 1);
    }

    #[test]
    fn test_sub_scope_on_closed_scope_fails() {
        let (root, _) = root_with_backend();
        let scope = root.new_sub_scope(None).unwrap();
        scope.close().unwrap();

        let err = scope.new_sub_scope(None).unwrap_err();
        assert!(err.is_lifecycle_violation());
    }

    #[test]
    fn test_device_inheritance() {
        let backend = Arc::new(HostBackend::new());
        let root = NdScope::new_root(backend, Device::Gpu(1));
        let child = root.new_sub_scope(None).unwrap();
        assert_eq!(child.device(), Device::Gpu(1));

        let pinned = child.new_sub_scope(Some(Device::Cpu)).unwrap();
        assert_eq!(pinned.device(), Device::Cpu);
        let grandchild = pinned.new_sub_scope(None).unwrap();
        assert_eq!(grandchild.device(), Device::Cpu);
    }

    #[test]
    fn test_close_releases_nested_tree() {
        let (root, backend) = root_with_backend();
        let outer = root.new_sub_scope(None).unwrap();
        let inner = outer.new_sub_scope(None).unwrap();

        let a = outer.create(Shape::of(&[2]), DataType::F32, None).unwrap();
        let b = inner.create(Shape::of(&[2]), DataType::F32, None).unwrap();

        outer.close().unwrap();

        assert!(a.is_released());
        assert!(b.is_released());
        assert!(!inner.is_open());
        assert_eq!(backend.live_handles(), 0);
    }

    #[test]
    fn test_detach_transfers_responsibility() {
        let (root, backend) = root_with_backend();
        let scope = root.new_sub_scope(None).unwrap();
        let array = scope.create(Shape::of(&[2]), DataType::F32, None).unwrap();

        scope.detach(&array).unwrap();
        scope.close().unwrap();

        // Detached array survives the cascade
        assert!(!array.is_released());
        assert_eq!(backend.live_handles(), 1);

        array.close().unwrap();
        assert_eq!(backend.live_handles(), 0);
    }

    #[test]
    fn test_detach_on_closed_scope_fails() {
        let (root, _) = root_with_backend();
        let scope = root.new_sub_scope(None).unwrap();
        let array = scope.create(Shape::of(&[2]), DataType::F32, None).unwrap();
        scope.close().unwrap();

        let err = scope.detach(&array).unwrap_err();
        assert!(err.is_lifecycle_violation());
    }

    #[test]
    fn test_resource_count_tracks_registry() {
        let (root, _) = root_with_backend();
        let scope = root.new_sub_scope(None).unwrap();
        assert_eq!(scope.resource_count(), 0);

        let array = scope.create(Shape::of(&[2]), DataType::F32, None).unwrap();
        let _child = scope.new_sub_scope(None).unwrap();
        assert_eq!(scope.resource_count(), 2);

        array.close().unwrap();
        assert_eq!(scope.resource_count(), 1);
    }

    #[test]
    fn test_child_close_unregisters_from_parent() {
        let (root, _) = root_with_backend();
        let parent = root.new_sub_scope(None).unwrap();
        let child = parent.new_sub_scope(None).unwrap();
        assert_eq!(parent.resource_count(), 1);

        child.close().unwrap();
        assert_eq!(parent.resource_count(), 0);
    }

    #[test]
    fn test_parent_accessor() {
        let (root, _) = root_with_backend();
        let scope = root.new_sub_scope(None).unwrap();
        assert!(root.parent().is_none());
        assert_eq!(scope.parent().unwrap().id(), root.id());
    }
}
