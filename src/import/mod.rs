//! The migration engine.
//!
//! Imports an entire project out of a remote tracker into the local store:
//!
//! 1. staging collections accumulate translated entities in memory
//!    ([`staging`]),
//! 2. the session state threads them through every stage ([`context`]),
//! 3. mappers translate remote entities, resolving forward references
//!    lazily ([`mapper`], [`rewrite`]),
//! 4. ordered pipeline steps drive the run ([`pipeline`]),
//! 5. a bounded worker pool transfers attachment bytes ([`transfer`]),
//! 6. one transaction commits the whole graph in dependency order
//!    ([`commit`]),
//! 7. a supervisor tracks sessions, enforces one active import per actor,
//!    and sweeps old records ([`registry`]).

pub mod commit;
pub mod context;
pub mod mapper;
pub mod pipeline;
pub mod registry;
pub mod rewrite;
pub mod staging;
pub mod transfer;

pub use context::{
    AttachmentDescriptor, AttachmentSource, BadAttachment, CounterSnapshot, ImportContext,
    ImportEnv, ImportRequest, ImportStatus, Outcome, Stage,
};
pub use registry::ImportRegistry;
