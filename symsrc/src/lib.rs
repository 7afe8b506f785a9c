//! The symbol-source front-end of the debugger.
//!
//! A symbol source owns the in-memory symbol and line indices for one
//! loaded module and serves the debugger's queries:
//!
//!  - address lookups, exact or nearest-lower with displacement,
//!  - name lookups, exact or by prefix, case-sensitive or folded,
//!  - address-to-source-line lookups,
//!  - full enumeration.
//!
//! Loading happens on background threads while queries are already being
//! answered; loading is cancellable, and everything indexed before a
//! cancellation remains queryable. See [`PdbSymbolSource`] for modules with
//! PDB debug information, [`DwarfSymbolSource`] for PE-embedded DWARF, and
//! [`NullSymbolSource`] for modules without debug information.
//!
//! [`PdbSymbolSource`]: struct.PdbSymbolSource.html
//! [`DwarfSymbolSource`]: struct.DwarfSymbolSource.html
//! [`NullSymbolSource`]: struct.NullSymbolSource.html

#![warn(missing_docs)]

use thiserror::Error;

mod dwarf;
mod index;
mod pdb;
mod source;

pub use crate::dwarf::DwarfSymbolSource;
pub use crate::pdb::PdbSymbolSource;
pub use crate::source::{AnySymbolSource, NullSymbolSource, SymbolSource};

pub use symsrc_common::{SourceLineInfo, SymbolInfo, SymbolKind};
pub use symsrc_debuginfo::dia::{PdbValidation, SymbolQueryKind};

/// The name demangler, re-exported for the debugger's display layers.
pub use symsrc_demangle as demangle;

/// An error loading debug information into a symbol source.
#[derive(Debug, Error)]
pub enum SourceError {
    /// The symbol provider failed to load or validate the debug file.
    #[error("symbol provider error")]
    Dia(#[from] symsrc_debuginfo::DiaError),

    /// The module's PE image could not be parsed.
    #[error("invalid PE image")]
    Pe(#[from] symsrc_debuginfo::PeError),

    /// The DWARF debug information could not be processed.
    #[error("failed to process DWARF information")]
    Dwarf(#[from] symsrc_debuginfo::DwarfError),

    /// An operating system error, for example when spawning loader threads.
    #[error("i/o error")]
    Io(#[from] std::io::Error),
}

impl SourceError {
    /// Returns the provider error kind, if this is a provider error.
    pub fn dia_kind(&self) -> Option<symsrc_debuginfo::DiaErrorKind> {
        match self {
            SourceError::Dia(error) => Some(error.kind()),
            _ => None,
        }
    }
}
