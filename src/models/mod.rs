//! Data models of events and export registrations.

mod event;
mod registration;

pub use event::{Event, Reading};
pub use registration::{Addressable, Compression, Destination, EncryptionAlgorithm, EncryptionDetails, ExportFormat, Filter, NotifyOperation, NotifyUpdate, Registration};
