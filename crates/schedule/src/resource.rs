use std::borrow::Cow;

pub use atomic_refcell::{AtomicRef as Res, AtomicRefMut as ResMut};

slotmap::new_key_type! {
    /// Identifies a resource registered in a [`Universe`](crate::universe::Universe).
    pub struct ResourceId;
}

impl ResourceId {
    /// A stable numeric identity, used to order lock acquisition.
    #[inline]
    pub(crate) fn identity(self) -> u64 {
        slotmap::Key::data(&self).as_ffi()
    }
}

/// Describes a resource before it is registered.
///
/// The descriptor only carries metadata; the value itself is added to a
/// [`World`](crate::world::World) separately.
#[derive(Debug, Clone)]
pub struct ResourceDescriptor {
    label: Cow<'static, str>,
}

impl ResourceDescriptor {
    pub fn new(label: impl Into<Cow<'static, str>>) -> Self {
        Self {
            label: label.into(),
        }
    }

    #[inline]
    pub fn label(&self) -> &str {
        &self.label
    }
}
