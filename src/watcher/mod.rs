//! Unit-watch engine
//!
//! A `Watcher` validates its watch list against the service manager and then
//! either polls unit properties on a timer or relays live property-change
//! notifications, publishing `UnitEvent`s and errors on its own channel pair.

pub mod config;
pub mod engine;
pub mod event;

pub use config::{normalize_watch_list, WatchConfig};
pub use engine::{WatchHandle, WatchMode, Watcher};
pub use event::UnitEvent;
