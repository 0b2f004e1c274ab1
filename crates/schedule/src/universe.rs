use std::sync::{
    atomic::{AtomicU32, Ordering},
    Arc,
};

use fnv::FnvHashSet;
use parking_lot::{RwLock, RwLockReadGuard};
use slotmap::SlotMap;

use crate::{
    error::RegistryError,
    resource::{ResourceDescriptor, ResourceId},
    system::{SystemDescriptor, SystemId},
};

pub(crate) struct ResourceEntry {
    pub(crate) descriptor: ResourceDescriptor,
    // systems naming this resource + worlds holding a value for it
    refs: AtomicU32,
}

impl ResourceEntry {
    pub(crate) fn acquire(&self) {
        self.refs.fetch_add(1, Ordering::AcqRel);
    }

    pub(crate) fn release(&self) {
        let prev = self.refs.fetch_sub(1, Ordering::AcqRel);
        debug_assert!(prev > 0, "resource reference count underflow");
    }

    fn is_referenced(&self) -> bool {
        self.refs.load(Ordering::Acquire) > 0
    }
}

pub(crate) struct Registry {
    pub(crate) resources: SlotMap<ResourceId, ResourceEntry>,
    pub(crate) systems: SlotMap<SystemId, Arc<SystemDescriptor>>,
}

impl Registry {
    #[inline]
    pub(crate) fn system(&self, id: SystemId) -> Option<&Arc<SystemDescriptor>> {
        self.systems.get(id)
    }
}

/// The registry that vends resource and system descriptors.
///
/// A universe is shared between worlds and groups; registration takes the
/// write lock, scheduling operations take the read lock.
pub struct Universe {
    registry: RwLock<Registry>,
}

impl Universe {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            registry: RwLock::new(Registry {
                resources: SlotMap::with_key(),
                systems: SlotMap::with_key(),
            }),
        })
    }

    pub(crate) fn registry(&self) -> RwLockReadGuard<'_, Registry> {
        self.registry.read()
    }

    pub fn register_resource(&self, descriptor: ResourceDescriptor) -> ResourceId {
        let mut registry = self.registry.write();
        let id = registry.resources.insert(ResourceEntry {
            descriptor,
            refs: AtomicU32::new(0),
        });
        tracing::debug!(?id, "registered resource");
        id
    }

    /// Removes a resource descriptor.
    ///
    /// Fails with [`RegistryError::InUse`] while any system or world still
    /// references the resource.
    pub fn unregister_resource(&self, id: ResourceId) -> Result<ResourceDescriptor, RegistryError> {
        let mut registry = self.registry.write();
        let entry = registry.resources.get(id).ok_or(RegistryError::NotFound)?;
        if entry.is_referenced() {
            return Err(RegistryError::InUse);
        }
        let entry = registry.resources.remove(id).expect("present above");
        tracing::debug!(?id, "unregistered resource");
        Ok(entry.descriptor)
    }

    /// Validates and registers a system descriptor.
    ///
    /// Every named resource and dependency target gains a reference and
    /// cannot be unregistered before this system.
    pub fn register_system(
        &self,
        descriptor: SystemDescriptor,
    ) -> Result<SystemId, RegistryError> {
        let mut registry = self.registry.write();
        Self::validate(&registry, &descriptor)?;

        for resource in descriptor
            .exclusive_resources()
            .iter()
            .chain(descriptor.shared_resources())
        {
            registry.resources[*resource].acquire();
        }
        for target in descriptor.dependency_targets() {
            registry.systems[target].acquire();
        }
        let label = descriptor.label().to_owned();
        let id = registry.systems.insert(Arc::new(descriptor));
        tracing::debug!(?id, label, "registered system");
        Ok(id)
    }

    fn validate(registry: &Registry, descriptor: &SystemDescriptor) -> Result<(), RegistryError> {
        let mut exclusive = FnvHashSet::default();
        for resource in descriptor.exclusive_resources() {
            if !registry.resources.contains_key(*resource) {
                return Err(RegistryError::NotFound);
            }
            if !exclusive.insert(*resource) {
                return Err(RegistryError::Deadlock("resource repeated in exclusive list"));
            }
        }
        let mut shared = FnvHashSet::default();
        for resource in descriptor.shared_resources() {
            if !registry.resources.contains_key(*resource) {
                return Err(RegistryError::NotFound);
            }
            if exclusive.contains(resource) {
                return Err(RegistryError::Deadlock(
                    "resource in both exclusive and shared lists",
                ));
            }
            if !shared.insert(*resource) {
                return Err(RegistryError::Duplicate);
            }
        }
        let before: FnvHashSet<SystemId> = descriptor.before().iter().map(|d| d.system).collect();
        for dependency in descriptor.after() {
            if before.contains(&dependency.system) {
                return Err(RegistryError::Deadlock(
                    "system named in both before and after",
                ));
            }
        }
        for target in descriptor.dependency_targets() {
            if !registry.systems.contains_key(target) {
                return Err(RegistryError::NotFound);
            }
        }
        Ok(())
    }

    /// Removes a system descriptor.
    ///
    /// Fails with [`RegistryError::InUse`] while the system is part of a
    /// group or referenced by another system's ordering edges.
    pub fn unregister_system(&self, id: SystemId) -> Result<(), RegistryError> {
        let mut registry = self.registry.write();
        let descriptor = registry.systems.get(id).ok_or(RegistryError::NotFound)?;
        if descriptor.is_referenced() {
            return Err(RegistryError::InUse);
        }
        let descriptor = registry.systems.remove(id).expect("present above");
        for resource in descriptor
            .exclusive_resources()
            .iter()
            .chain(descriptor.shared_resources())
        {
            registry.resources[*resource].release();
        }
        for target in descriptor.dependency_targets() {
            registry.systems[target].release();
        }
        tracing::debug!(?id, "unregistered system");
        Ok(())
    }

    pub fn system(&self, id: SystemId) -> Option<Arc<SystemDescriptor>> {
        self.registry.read().systems.get(id).cloned()
    }

    pub fn resource_label(&self, id: ResourceId) -> Option<String> {
        self.registry
            .read()
            .resources
            .get(id)
            .map(|e| e.descriptor.label().to_owned())
    }

    pub fn has_resource(&self, id: ResourceId) -> bool {
        self.registry.read().resources.contains_key(id)
    }

    pub fn has_system(&self, id: SystemId) -> bool {
        self.registry.read().systems.contains_key(id)
    }

    /// Bumps the reference count of a resource on behalf of a world value.
    pub(crate) fn reference_resource(&self, id: ResourceId) -> Result<(), RegistryError> {
        let registry = self.registry.read();
        let entry = registry.resources.get(id).ok_or(RegistryError::NotFound)?;
        entry.acquire();
        Ok(())
    }

    pub(crate) fn release_resource(&self, id: ResourceId) {
        if let Some(entry) = self.registry.read().resources.get(id) {
            entry.release();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::system::Dependency;

    struct Noop;
    impl crate::system::System for Noop {
        fn run(&mut self, _ctx: &mut crate::group::SystemRunContext<'_>) {}
    }

    fn noop_system(label: &'static str) -> crate::system::SystemDescriptorBuilder {
        SystemDescriptor::builder(label).value(|| Noop)
    }

    #[test]
    fn rejects_unknown_resource() {
        let universe = Universe::new();
        let bogus = {
            let other = Universe::new();
            other.register_resource(ResourceDescriptor::new("r"))
        };
        let result = universe.register_system(noop_system("s").exclusive(bogus).build());
        assert_eq!(result.unwrap_err(), RegistryError::NotFound);
    }

    #[test]
    fn rejects_exclusive_duplicate() {
        let universe = Universe::new();
        let r = universe.register_resource(ResourceDescriptor::new("r"));
        let result = universe.register_system(noop_system("s").exclusive(r).exclusive(r).build());
        assert!(matches!(result, Err(RegistryError::Deadlock(_))));
    }

    #[test]
    fn rejects_exclusive_shared_overlap() {
        let universe = Universe::new();
        let r = universe.register_resource(ResourceDescriptor::new("r"));
        let result = universe.register_system(noop_system("s").exclusive(r).shared(r).build());
        assert!(matches!(result, Err(RegistryError::Deadlock(_))));
    }

    #[test]
    fn rejects_shared_duplicate() {
        let universe = Universe::new();
        let r = universe.register_resource(ResourceDescriptor::new("r"));
        let result = universe.register_system(noop_system("s").shared(r).shared(r).build());
        assert_eq!(result.unwrap_err(), RegistryError::Duplicate);
    }

    #[test]
    fn rejects_before_after_overlap() {
        let universe = Universe::new();
        let target = universe.register_system(noop_system("t").build()).unwrap();
        let result = universe.register_system(
            noop_system("s")
                .before(target)
                .after(Dependency::ignore_deferred(target))
                .build(),
        );
        assert!(matches!(result, Err(RegistryError::Deadlock(_))));
    }

    #[test]
    fn unregister_fails_while_referenced() {
        let universe = Universe::new();
        let r = universe.register_resource(ResourceDescriptor::new("r"));
        let s = universe
            .register_system(noop_system("s").exclusive(r).build())
            .unwrap();
        assert_eq!(
            universe.unregister_resource(r).unwrap_err(),
            RegistryError::InUse
        );
        let t = universe
            .register_system(noop_system("t").after(s).build())
            .unwrap();
        assert_eq!(
            universe.unregister_system(s).unwrap_err(),
            RegistryError::InUse
        );
        universe.unregister_system(t).unwrap();
        universe.unregister_system(s).unwrap();
        universe.unregister_resource(r).unwrap();
    }
}
