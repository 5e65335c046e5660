// Remote control over the local network
//
// A parent device finds this one with an unencrypted UDP broadcast, then sends
// commands sealed with a key derived from the device identifier.

pub mod channel;
pub mod client;
pub mod identity;
pub mod protocol;
pub mod responder;
pub mod watchdog;

pub use client::ParentClient;
pub use identity::{DeviceIdentity, normalize_device_id};
pub use protocol::{Command, CommandProcessor, Response};
pub use responder::{DiscoveryResponder, ResponderSettings};
pub use watchdog::ResponderWatchdog;
