//! Core domain types shared across the docsd workspace.
//!
//! This crate has no orchestration logic of its own: it exists so that
//! `docsd-core`, `docsd-cli`, and any future HTTP or storage adapter can
//! agree on the same event, job, and report shapes without depending on
//! the full orchestration engine.
//!
//! - [`event`] — bus payload taxonomy (`BuildRequested`, `BuildNow`, ...)
//! - [`job`] — build job identity, priority, and lifecycle status
//! - [`repository`] — repository descriptors
//! - [`report`] — build report consumed from the site generator and
//!   enriched by the pipeline's post-persistence stage
//! - [`hash`] — content-addressed hashing for doc file path sets
//! - [`duration`] — humantime/millisecond duration (de)serialization helpers

pub mod duration;
pub mod event;
pub mod hash;
pub mod job;
pub mod report;
pub mod repository;

pub use event::{
    BuildNow, BuildRequested, DaemonEvent, DebounceCause, RepoRemoved, RepoUpdateRequested,
    RepoUpdated, WebhookReceived,
};
pub use hash::{hash_bytes, hash_doc_paths};
pub use job::{JobPriority, JobSnapshot, JobStatus, JobType};
pub use report::{BuildOutcome, BuildReport, DeltaDecision};
pub use repository::RepositoryDescriptor;
