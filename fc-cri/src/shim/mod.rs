//! Containerd-facing task service.
//!
//! The embedding shim binary owns the ttrpc transport; this module provides
//! the state machine behind it: one sandbox per service instance, a process
//! table for init and exec processes, and an advisory event stream.

pub mod events;
pub mod service;
pub mod task;

pub use events::{EventPublisher, EventQueue, TaskEvent};
pub use service::TaskService;
pub use task::*;
