//! The `persistence` module is the durable message store.
//!
//! Durable messages are written to `sled` before they are dispatched and
//! stay there until their receiver quota is met or they expire. Topic
//! definitions are stored alongside so a restarted broker comes back with
//! its topics and unsettled messages.

pub mod sled_store;

pub use sled_store::{ArchivedMessage, DurableHandle, Persistence, Settlement, StoredMessage};

#[cfg(test)]
mod tests;
