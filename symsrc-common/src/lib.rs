//! Common functionality for `symsrc`.
//!
//! This crate exposes the record types exchanged between the debug-info
//! loaders and the symbol-source front-end:
//!
//!  - [`SymbolInfo`]: A normalized symbol record with address, size and name
//!    information.
//!  - [`SourceLineInfo`]: An address-to-source-line mapping record.
//!  - [`ByteView`]: Gives access to binary data in-memory or on the file
//!    system.
//!  - [`MemoryReader`]: The abstract memory-access collaborator used to page
//!    in mapped images.
//!
//! [`SymbolInfo`]: struct.SymbolInfo.html
//! [`SourceLineInfo`]: struct.SourceLineInfo.html
//! [`ByteView`]: struct.ByteView.html
//! [`MemoryReader`]: trait.MemoryReader.html

#![warn(missing_docs)]

mod byteview;
mod read;
mod types;

pub use crate::byteview::*;
pub use crate::read::*;
pub use crate::types::*;

pub use debugid::DebugId;
pub use uuid::Uuid;
