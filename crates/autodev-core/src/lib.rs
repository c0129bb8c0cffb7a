//! Core engine of the Auto-Dev scheduler.
//!
//! Drives concurrent CLI coding agents through a dependency-ordered task
//! graph parsed from a Markdown plan file. The [`scheduler::Scheduler`]
//! handle is the public entry point; everything else is the machinery it
//! coordinates: plan parsing and writeback, worker supervision, the
//! watchdog, the issue tracker, session persistence, and log archival.

pub mod agent;
pub mod config;
pub mod events;
pub mod issue;
pub mod logs;
pub mod plan;
pub mod resilience;
pub mod scheduler;
pub mod session;
pub mod task;
pub mod watchdog;
pub mod worker;

pub use config::SchedulerConfig;
pub use events::{Notice, PauseReason};
pub use scheduler::{LoadSummary, Scheduler, StateSnapshot};
pub use task::{Task, TaskStatus};
