use std::{
    any::Any,
    ptr::NonNull,
    sync::{
        atomic::{AtomicU32, AtomicUsize, Ordering},
        Arc,
    },
};

use atomic_refcell::AtomicRefCell;
use parking_lot::{
    lock_api::RawRwLock as _,
    RawRwLock, RwLock,
};
use slotmap::SecondaryMap;

use crate::{
    error::RegistryError,
    resource::{Res, ResMut, ResourceId},
    universe::Universe,
};

/// Storage slot of one resource value.
///
/// The outer raw rwlock is what the scheduler acquires for the duration of
/// a generation; the inner refcell is what individual systems borrow
/// through while the generation runs.
pub(crate) struct ResourceCell {
    lock: RawRwLock,
    // number of open lock acquisitions
    locks: AtomicU32,
    value: AtomicRefCell<Box<dyn Any + Send>>,
}

// SAFETY: the boxed value is `Send` but not `Sync`; concurrent access is
// serialized by `lock` at the world level and by the synchronization
// commands the scheduler injects between systems, with the refcell as the
// runtime check of last resort.
unsafe impl Sync for ResourceCell {}

impl ResourceCell {
    fn new(value: Box<dyn Any + Send>) -> Box<Self> {
        Box::new(Self {
            lock: RawRwLock::INIT,
            locks: AtomicU32::new(0),
            value: AtomicRefCell::new(value),
        })
    }

    /// Borrows the value immutably. Panics on a type mismatch or when an
    /// exclusive borrow is active.
    pub(crate) fn borrow<T: 'static>(&self) -> Res<'_, T> {
        Res::map(self.value.borrow(), |v| {
            v.downcast_ref::<T>().expect("resource type mismatch")
        })
    }

    /// Borrows the value mutably. Panics on a type mismatch or when any
    /// other borrow is active.
    pub(crate) fn borrow_mut<T: 'static>(&self) -> ResMut<'_, T> {
        ResMut::map(self.value.borrow_mut(), |v| {
            v.downcast_mut::<T>().expect("resource type mismatch")
        })
    }
}

/// The resource map one or more groups are scheduled over.
pub struct World {
    universe: Arc<Universe>,
    cells: RwLock<SecondaryMap<ResourceId, Box<ResourceCell>>>,
    groups: AtomicUsize,
}

impl World {
    pub fn new(universe: Arc<Universe>) -> Arc<Self> {
        Arc::new(Self {
            universe,
            cells: RwLock::new(SecondaryMap::new()),
            groups: AtomicUsize::new(0),
        })
    }

    #[inline]
    pub fn universe(&self) -> &Arc<Universe> {
        &self.universe
    }

    /// Stores a value for a registered resource.
    pub fn add_resource<T: Send + 'static>(
        &self,
        id: ResourceId,
        value: T,
    ) -> Result<(), RegistryError> {
        let mut cells = self.cells.write();
        if cells.contains_key(id) {
            return Err(RegistryError::Duplicate);
        }
        self.universe.reference_resource(id)?;
        cells.insert(id, ResourceCell::new(Box::new(value)));
        Ok(())
    }

    /// Removes a resource value and returns it.
    ///
    /// Fails with [`RegistryError::InUse`] while a generation holds the
    /// resource locked.
    pub fn remove_resource<T: Send + 'static>(&self, id: ResourceId) -> Result<T, RegistryError> {
        let mut cells = self.cells.write();
        {
            let cell = cells.get(id).ok_or(RegistryError::NotFound)?;
            if cell.locks.load(Ordering::Acquire) > 0 {
                return Err(RegistryError::InUse);
            }
            if !cell.value.borrow().is::<T>() {
                return Err(RegistryError::NotFound);
            }
        }
        let cell = cells.remove(id).expect("present above");
        let value = cell
            .value
            .into_inner()
            .downcast::<T>()
            .expect("type checked above");
        self.universe.release_resource(id);
        Ok(*value)
    }

    pub fn has_resource(&self, id: ResourceId) -> bool {
        self.cells.read().contains_key(id)
    }

    /// Acquires the given resources exclusively and appends their cell
    /// handles to `out`, in input order.
    ///
    /// `ids` must be sorted by resource identity; acquiring in that order
    /// is what makes concurrent groups of the same world deadlock-free.
    pub(crate) fn lock_resources(&self, ids: &[ResourceId], out: &mut Vec<NonNull<ResourceCell>>) {
        debug_assert!(
            ids.windows(2).all(|w| w[0].identity() < w[1].identity()),
            "resource locks must be acquired in ascending identity order"
        );
        let cells = self.cells.read();
        for &id in ids {
            let cell = cells
                .get(id)
                .unwrap_or_else(|| panic!("resource {id:?} has no value in this world"));
            cell.lock.lock_exclusive();
            cell.locks.fetch_add(1, Ordering::AcqRel);
            out.push(NonNull::from(&**cell));
        }
    }

    pub(crate) fn unlock_resource_exclusive(&self, id: ResourceId) {
        let cells = self.cells.read();
        let cell = cells.get(id).expect("unlocking an unknown resource");
        cell.locks.fetch_sub(1, Ordering::AcqRel);
        // SAFETY: paired with the `lock_exclusive` in `lock_resources`
        unsafe { cell.lock.unlock_exclusive() };
    }

    pub(crate) fn group_created(&self) {
        self.groups.fetch_add(1, Ordering::AcqRel);
    }

    pub(crate) fn group_dropped(&self) {
        let prev = self.groups.fetch_sub(1, Ordering::AcqRel);
        debug_assert!(prev > 0, "world group count underflow");
    }

    pub fn group_count(&self) -> usize {
        self.groups.load(Ordering::Acquire)
    }
}
