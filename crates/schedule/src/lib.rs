#![warn(
    // missing_docs,
    // rustdoc::missing_doc_code_examples,
    future_incompatible,
    rust_2018_idioms,
    unused,
    trivial_casts,
    trivial_numeric_casts,
    unused_lifetimes,
    unused_qualifications,
    unused_crate_dependencies,
    clippy::cargo,
    clippy::multiple_crate_versions,
    clippy::empty_line_after_outer_attr,
    clippy::fallible_impl_from,
    clippy::redundant_pub_crate,
    clippy::use_self,
    clippy::suspicious_operation_groupings,
    clippy::useless_let_if_seq,
    clippy::wildcard_imports
)]
#![doc(html_no_source)]
#![doc = include_str!("../README.md")]

pub mod alloc;
pub mod error;
pub mod group;
pub mod resource;
pub mod system;
pub mod universe;
pub mod world;

pub use fray_executor as executor;
pub use fray_sync as sync;

pub mod prelude {
    pub use crate::{
        alloc::AllocStrategy,
        error::{RegistryError, ScheduleError, SystemInitError},
        executor::ThreadPool,
        group::{Deferred, SystemGroup, SystemRunContext},
        resource::{Res, ResMut, ResourceDescriptor, ResourceId},
        sync::{Fence, TimelineSemaphore},
        system::{Dependency, System, SystemDescriptor, SystemId},
        universe::Universe,
        world::World,
    };
}
