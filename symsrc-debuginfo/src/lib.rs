//! Debug-information loaders for the symsrc symbol source.
//!
//! This crate contains the format-level half of the subsystem:
//!
//!  - [`pe`]: a view over a mapped Portable Executable image, deep enough to
//!    enumerate sections and the COFF symbol and string tables.
//!  - [`dwarf`]: the object-access adapter that projects the PE view into the
//!    world of the external DWARF reader, plus symbol and line extraction.
//!  - [`dia`]: the DIA-style PDB symbol provider: library init gates,
//!    provider resolution with fallbacks, file validation, the lexical
//!    enumerator and the source-line extractor.
//!
//! The symbol-source front-end in the `symsrc` crate drives these loaders
//! from background threads and owns the resulting indices.

#![warn(missing_docs)]

pub mod dia;
pub mod dwarf;
pub mod pe;

#[cfg(any(test, feature = "test-support"))]
pub mod testutils;

pub use crate::dia::{
    init_library, is_library_initialized, open_provider, resolve_provider, shutdown_library,
    DiaError, DiaErrorKind, DiaLineRecord, EnumerateOptions, LoadCallback, PdbValidation,
    ProviderLoader, ProviderSession, SymbolProvider, SymbolQueryKind, SymbolTag,
};
pub use crate::dwarf::{DwarfError, DwarfErrorKind, ObjectAccess, SectionInfo};
pub use crate::pe::{PeError, PeModuleView};
