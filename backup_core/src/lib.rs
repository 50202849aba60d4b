#![deny(rustdoc::broken_intra_doc_links, rustdoc::bare_urls, rust_2018_idioms)]
#![warn(
    missing_debug_implementations,
    clippy::explicit_iter_loop,
    clippy::use_self,
    clippy::clone_on_ref_ptr
)]

//! The per-field backup engine.
//!
//! Every `(measurement, field)` pair is an independent backup unit with its
//! own resume point, derived at job start from the destination database
//! itself. There is no watermark store and no shared watermark state: the
//! newest non-null value of a field *on the destination* is where that field
//! resumes, and nothing a sibling field writes can move it.
//!
//! The pieces, bottom up:
//!
//! - [`influx`] — the client seam the engine runs against
//! - [`catalog`] — field discovery and include/exclude/type/obsolescence
//!   filtering
//! - [`watermark`] + [`window`] — resume points and time pagination
//! - [`job`] — the per-field copy loop
//! - [`pool`] — bounded parallel execution
//! - [`orchestrator`] — one configuration end to end, including the cron
//!   schedule loop with overlap protection
//! - [`report`] — what happened, per field and per run

pub mod catalog;
pub mod influx;
pub mod job;
pub mod mock;
pub mod orchestrator;
pub mod pool;
pub mod report;
pub mod shutdown;
pub mod watermark;
pub mod window;

pub use catalog::FieldRef;
pub use job::{FieldBackupJob, JobOutcome, JobStatus};
pub use orchestrator::Orchestrator;
pub use report::Report;
pub use shutdown::ShutdownFlag;
