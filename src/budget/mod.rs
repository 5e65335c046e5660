/// Daily usage accounting and enforcement
pub mod clock;
pub mod credit;
pub mod enforcement;
pub mod engine;
pub mod scheduler;
pub mod tracker;

#[cfg(test)]
pub mod testing;

pub use clock::{Clock, SystemClock};
pub use credit::{Credit, CreditStore, FileCreditStore};
pub use enforcement::{DesktopNotifier, LogSync, ScreenLocker};
pub use engine::{BlockingStateMachine, Collaborators, ExtensionError};
pub use scheduler::{AdaptiveScheduler, FallbackJob};
pub use tracker::UsageEventSource;
