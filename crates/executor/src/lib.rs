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

mod command;
mod pool;

pub use self::{
    command::{Command, CommandBuffer, SubmitHandle},
    pool::{global, replace_global_pool, ThreadPool},
};
