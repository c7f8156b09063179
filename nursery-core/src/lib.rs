#![crate_name = "utxo_nursery"]

//! Shepherds on-chain outputs of closed payment channels through their
//! maturity timelocks and sweeps them into the wallet.
//! See [`nursery::UtxoNursery`] for the entry point.

#![forbid(unsafe_code)]
#![warn(rustdoc::broken_intra_doc_links)]
#![warn(missing_docs)]

pub use bitcoin;

/// Chain event sources and the transaction broadcaster
pub mod chain;
/// The nursery state machine
pub mod nursery;
/// Tracked output records
pub mod output;
/// Persistent state storage
pub mod store;
/// Batched sweep transaction construction
pub mod sweep;
/// Various utilities
pub mod util;

pub use std::sync::{Arc, Weak};

/// std collection aliases and common traits
pub mod prelude {
    pub use std::collections::BTreeMap as OrderedMap;
    pub use std::collections::BTreeSet as OrderedSet;
    pub use std::collections::HashMap as Map;
    pub use std::collections::HashSet as UnorderedSet;
    pub use std::sync::{Mutex, MutexGuard};

    /// Convenience trait for Send + Sync
    pub trait SendSync: Send + Sync {}
}

pub use prelude::SendSync;
