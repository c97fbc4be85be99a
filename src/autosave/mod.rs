//! Autosave scheduling.

mod scheduler;

pub use scheduler::{AutosaveEvent, AutosaveScheduler};
