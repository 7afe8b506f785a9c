//! The debugger-facing symbol-source abstraction.
//!
//! Every module the debugger loads gets a symbol source: PDB-backed,
//! DWARF-backed, or empty when no debug information could be found. The
//! [`SymbolSource`] trait is the capability set the rest of the debugger
//! consumes; [`AnySymbolSource`] packages the variants as one tagged type.
//!
//! [`SymbolSource`]: trait.SymbolSource.html
//! [`AnySymbolSource`]: enum.AnySymbolSource.html

use symsrc_common::{SourceLineInfo, SymbolInfo};

use crate::dwarf::DwarfSymbolSource;
use crate::pdb::PdbSymbolSource;

/// Query surface of a module's symbol information.
///
/// Queries are safe to issue while the source is still loading in the
/// background: they answer from whatever has been indexed so far and report
/// "not found" rather than blocking or returning stale data.
pub trait SymbolSource: Send + Sync {
    /// Whether debug information was successfully opened.
    ///
    /// This turns `true` as soon as the provider has a session, before
    /// loading finishes.
    fn is_open(&self) -> bool;

    /// Whether background loaders are still running.
    fn is_loading(&self) -> bool {
        false
    }

    /// Requests cooperative cancellation of the background loaders.
    ///
    /// Loaders stop at the next unit of work; everything indexed up to that
    /// point remains queryable.
    fn cancel_loading(&self) {}

    /// Finds the symbol whose start equals `rva`.
    fn find_symbol_exact(&self, rva: u64) -> Option<SymbolInfo>;

    /// Finds the closest symbol at or below `rva`.
    ///
    /// The returned record's `displacement` is the distance from the
    /// symbol's start to the query.
    fn find_symbol_exact_or_lower(&self, rva: u64) -> Option<SymbolInfo>;

    /// Exact name lookup.
    fn find_symbol_by_name(&self, name: &str, case_sensitive: bool) -> Option<SymbolInfo>;

    /// Finds all symbols whose name starts with `prefix`.
    fn find_symbols_by_prefix(&self, prefix: &str, case_sensitive: bool) -> Vec<SymbolInfo>;

    /// Address-exact source-line lookup.
    ///
    /// Callers wanting nearest-lower behavior scan the address-ordered keys
    /// themselves.
    fn find_source_line_info(&self, rva: u64) -> Option<SourceLineInfo>;

    /// Visits all symbols; the callback returns `false` to stop early.
    fn enum_symbols(&self, callback: &mut dyn FnMut(&SymbolInfo) -> bool);
}

/// The empty symbol source, used when a module has no debug information.
#[derive(Clone, Copy, Debug, Default)]
pub struct NullSymbolSource;

impl SymbolSource for NullSymbolSource {
    fn is_open(&self) -> bool {
        false
    }

    fn find_symbol_exact(&self, _rva: u64) -> Option<SymbolInfo> {
        None
    }

    fn find_symbol_exact_or_lower(&self, _rva: u64) -> Option<SymbolInfo> {
        None
    }

    fn find_symbol_by_name(&self, _name: &str, _case_sensitive: bool) -> Option<SymbolInfo> {
        None
    }

    fn find_symbols_by_prefix(&self, _prefix: &str, _case_sensitive: bool) -> Vec<SymbolInfo> {
        Vec::new()
    }

    fn find_source_line_info(&self, _rva: u64) -> Option<SourceLineInfo> {
        None
    }

    fn enum_symbols(&self, _callback: &mut dyn FnMut(&SymbolInfo) -> bool) {}
}

/// A symbol source of any supported backing.
pub enum AnySymbolSource {
    /// Symbols served from a PDB through the DIA-style provider.
    Pdb(PdbSymbolSource),
    /// Symbols served from DWARF data embedded in the PE image.
    Dwarf(DwarfSymbolSource),
    /// No debug information.
    Empty(NullSymbolSource),
}

macro_rules! match_inner {
    ($value:expr, $pat:pat => $expr:expr) => {
        match $value {
            AnySymbolSource::Pdb($pat) => $expr,
            AnySymbolSource::Dwarf($pat) => $expr,
            AnySymbolSource::Empty($pat) => $expr,
        }
    };
}

impl SymbolSource for AnySymbolSource {
    fn is_open(&self) -> bool {
        match_inner!(self, source => source.is_open())
    }

    fn is_loading(&self) -> bool {
        match_inner!(self, source => source.is_loading())
    }

    fn cancel_loading(&self) {
        match_inner!(self, source => source.cancel_loading())
    }

    fn find_symbol_exact(&self, rva: u64) -> Option<SymbolInfo> {
        match_inner!(self, source => source.find_symbol_exact(rva))
    }

    fn find_symbol_exact_or_lower(&self, rva: u64) -> Option<SymbolInfo> {
        match_inner!(self, source => source.find_symbol_exact_or_lower(rva))
    }

    fn find_symbol_by_name(&self, name: &str, case_sensitive: bool) -> Option<SymbolInfo> {
        match_inner!(self, source => source.find_symbol_by_name(name, case_sensitive))
    }

    fn find_symbols_by_prefix(&self, prefix: &str, case_sensitive: bool) -> Vec<SymbolInfo> {
        match_inner!(self, source => source.find_symbols_by_prefix(prefix, case_sensitive))
    }

    fn find_source_line_info(&self, rva: u64) -> Option<SourceLineInfo> {
        match_inner!(self, source => source.find_source_line_info(rva))
    }

    fn enum_symbols(&self, callback: &mut dyn FnMut(&SymbolInfo) -> bool) {
        match_inner!(self, source => source.enum_symbols(callback))
    }
}

impl From<PdbSymbolSource> for AnySymbolSource {
    fn from(source: PdbSymbolSource) -> Self {
        AnySymbolSource::Pdb(source)
    }
}

impl From<DwarfSymbolSource> for AnySymbolSource {
    fn from(source: DwarfSymbolSource) -> Self {
        AnySymbolSource::Dwarf(source)
    }
}

impl From<NullSymbolSource> for AnySymbolSource {
    fn from(source: NullSymbolSource) -> Self {
        AnySymbolSource::Empty(source)
    }
}
