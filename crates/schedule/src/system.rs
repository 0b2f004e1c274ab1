use std::{
    borrow::Cow,
    sync::atomic::{AtomicU32, Ordering},
};

use crate::{error::SystemInitError, group::SystemRunContext, resource::ResourceId};

slotmap::new_key_type! {
    /// Identifies a system registered in a [`Universe`](crate::universe::Universe).
    pub struct SystemId;
}

/// An ordering constraint against another system.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Dependency {
    pub system: SystemId,
    /// When `false`, waiting on the target also waits for the target's
    /// deferred fence, not just the return of its `run`.
    pub ignore_deferred: bool,
}

impl Dependency {
    #[inline]
    pub fn new(system: SystemId) -> Self {
        Self {
            system,
            ignore_deferred: false,
        }
    }

    /// A constraint on the target's `run` only; subjobs the target spawned
    /// may still be in flight when the dependent starts.
    #[inline]
    pub fn ignore_deferred(system: SystemId) -> Self {
        Self {
            system,
            ignore_deferred: true,
        }
    }
}

impl From<SystemId> for Dependency {
    #[inline]
    fn from(system: SystemId) -> Self {
        Self::new(system)
    }
}

/// The per-instance state of a system inside a group.
///
/// A fresh value is produced by the descriptor's factory every time the
/// system is added to a group, and torn down when it leaves the group.
pub trait System: Send {
    /// Runs the system for one generation.
    fn run(&mut self, ctx: &mut SystemRunContext<'_>);

    /// Called when the instance is removed from its group.
    fn deinit(&mut self) {}
}

type SystemFactory = Box<dyn Fn() -> Result<Box<dyn System>, SystemInitError> + Send + Sync>;

/// Describes a system: its resource accesses, its ordering edges and the
/// factory that produces per-group instances.
pub struct SystemDescriptor {
    label: Cow<'static, str>,
    exclusive: Vec<ResourceId>,
    shared: Vec<ResourceId>,
    before: Vec<Dependency>,
    after: Vec<Dependency>,
    factory: SystemFactory,
    // number of group contexts currently built from this descriptor
    external_refs: AtomicU32,
}

impl SystemDescriptor {
    pub fn builder(label: impl Into<Cow<'static, str>>) -> SystemDescriptorBuilder {
        SystemDescriptorBuilder {
            label: label.into(),
            exclusive: Vec::new(),
            shared: Vec::new(),
            before: Vec::new(),
            after: Vec::new(),
            factory: None,
        }
    }

    #[inline]
    pub fn label(&self) -> &str {
        &self.label
    }

    #[inline]
    pub fn exclusive_resources(&self) -> &[ResourceId] {
        &self.exclusive
    }

    #[inline]
    pub fn shared_resources(&self) -> &[ResourceId] {
        &self.shared
    }

    #[inline]
    pub fn before(&self) -> &[Dependency] {
        &self.before
    }

    #[inline]
    pub fn after(&self) -> &[Dependency] {
        &self.after
    }

    /// All systems named in `before` or `after`.
    pub(crate) fn dependency_targets(&self) -> impl Iterator<Item = SystemId> + '_ {
        self.before
            .iter()
            .chain(self.after.iter())
            .map(|d| d.system)
    }

    pub(crate) fn instantiate(&self) -> Result<Box<dyn System>, SystemInitError> {
        (self.factory)()
    }

    pub(crate) fn acquire(&self) {
        self.external_refs.fetch_add(1, Ordering::AcqRel);
    }

    pub(crate) fn release(&self) {
        let prev = self.external_refs.fetch_sub(1, Ordering::AcqRel);
        debug_assert!(prev > 0, "system descriptor reference count underflow");
    }

    #[inline]
    pub fn is_referenced(&self) -> bool {
        self.external_refs.load(Ordering::Acquire) > 0
    }
}

impl std::fmt::Debug for SystemDescriptor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SystemDescriptor")
            .field("label", &self.label)
            .field("exclusive", &self.exclusive)
            .field("shared", &self.shared)
            .field("before", &self.before)
            .field("after", &self.after)
            .finish_non_exhaustive()
    }
}

pub struct SystemDescriptorBuilder {
    label: Cow<'static, str>,
    exclusive: Vec<ResourceId>,
    shared: Vec<ResourceId>,
    before: Vec<Dependency>,
    after: Vec<Dependency>,
    factory: Option<SystemFactory>,
}

impl SystemDescriptorBuilder {
    /// Declares exclusive access to `resource`.
    pub fn exclusive(mut self, resource: ResourceId) -> Self {
        self.exclusive.push(resource);
        self
    }

    /// Declares shared access to `resource`.
    pub fn shared(mut self, resource: ResourceId) -> Self {
        self.shared.push(resource);
        self
    }

    /// Orders this system before `target`.
    pub fn before(mut self, target: impl Into<Dependency>) -> Self {
        self.before.push(target.into());
        self
    }

    /// Orders this system after `target`.
    pub fn after(mut self, target: impl Into<Dependency>) -> Self {
        self.after.push(target.into());
        self
    }

    /// Sets the factory producing per-group instances.
    pub fn factory<F, S>(mut self, factory: F) -> Self
    where
        F: Fn() -> Result<S, SystemInitError> + Send + Sync + 'static,
        S: System + 'static,
    {
        self.factory = Some(Box::new(move || {
            factory().map(|s| Box::new(s) as Box<dyn System>)
        }));
        self
    }

    /// Shorthand for a factory that cannot fail.
    pub fn value<F, S>(self, factory: F) -> Self
    where
        F: Fn() -> S + Send + Sync + 'static,
        S: System + 'static,
    {
        self.factory(move || Ok(factory()))
    }

    pub fn build(self) -> SystemDescriptor {
        SystemDescriptor {
            label: self.label,
            exclusive: self.exclusive,
            shared: self.shared,
            before: self.before,
            after: self.after,
            factory: self.factory.expect("system descriptor without a factory"),
            external_refs: AtomicU32::new(0),
        }
    }
}
