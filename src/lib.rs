#![deny(unsafe_code)]
#![warn(missing_docs)]

//! A blocking client core for managing IPMI-style management controllers.
//!
//! The crate implements:
//! - request/response correlation over a shared frame channel, with
//!   sequence-number slots, FIFO admission, and deadline-driven retransmit
//! - reservation-protected synchronization of controller record
//!   repositories (sensor records and the event log)
//! - periodic discovery of bus controllers with an active/inactive
//!   lifecycle and a controller directory
//! - a single notification queue carrying adds, removals, repository
//!   changes, and unsolicited controller events
//!
//! It exposes a small public API (`Domain`, `DomainBuilder`, the
//! directory types, and the commands) while keeping framing and
//! correlation details internal.

mod commands;
mod conn;
mod debug;
mod directory;
mod discovery;
mod domain;
mod error;
mod observe;
pub mod protocol;
mod repository;
mod transport;
mod types;

pub use crate::commands::{
    Command, GetDeviceId, GetRecord, GetRepositoryInfo, RecordSlice, ReserveRepository, NETFN_APP,
    NETFN_RESPONSE_BIT, NETFN_STORAGE,
};
pub use crate::conn::{Conn, ConnConfig};
pub use crate::directory::{Controller, Directory};
pub use crate::discovery::DiscoveryConfig;
pub use crate::domain::{Domain, DomainBuilder};
pub use crate::error::{Error, Result};
pub use crate::repository::{synchronize, CommandIo, Repository, SyncOutcome};
pub use crate::transport::{Channel, UdpChannel};
pub use crate::types::{
    cc, Address, DeviceId, DeviceSupport, IdentitySignature, Message, Notification, RawRecord,
    RawResponse, Reply, RepositoryCaps, RepositoryInfo, RepositoryKind, END_OF_RECORDS,
    FIRST_RECORD_ID, RECORD_TYPE_CONTROLLER_LOCATOR,
};
