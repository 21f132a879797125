//! Cooperative edit locks for schedule slots.
//!
//! [`EditLockManager`](protocol::EditLockManager) takes, extends and gives up
//! time-bounded leases through guarded row updates and auto-releases leases
//! it stops extending. Observers keep a board of lock-relevant rows, fed
//! either by the realtime pool ([`push`]) or by a fixed-interval fetch
//! ([`polling`]). [`LockController`](controller::LockController) ties one of
//! each together.

pub mod config;
pub mod controller;
pub mod error;
pub mod memory;
pub mod observer;
pub mod polling;
pub mod protocol;
pub mod push;
pub mod timers;

pub use config::LockConfig;
pub use controller::{LockController, LockStatus};
pub use error::LockError;
pub use memory::InMemoryScheduleStore;
pub use observer::{BoardChange, LockBoard, LockObserver, ObserverMode, RowSource};
pub use polling::PollingLockObserver;
pub use protocol::{EditLockManager, ExtendReport, HeldLock};
pub use push::PushLockObserver;
