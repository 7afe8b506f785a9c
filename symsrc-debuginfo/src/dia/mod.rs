//! The DIA-style PDB symbol provider.
//!
//! Debug information for Windows modules lives in PDB files, queried through
//! a Debug-Interface-Access-style provider. This module defines the narrow
//! interface the rest of the subsystem is written against:
//!
//!  - [`SymbolProvider`] is a data source that can load a PDB (or find the
//!    PDB belonging to an executable) and open a [`ProviderSession`].
//!  - [`ProviderSession`] answers queries: the lexical tree via
//!    [`global_scope`] and per-symbol accessors, nearest-lower address
//!    lookups, and source-line enumeration.
//!  - [`ProviderLoader`] abstracts the platform's class registry and library
//!    loader; [`resolve_provider`] walks it, falling back through the
//!    well-known provider libraries when the primary class is missing.
//!
//! The built-in provider in [`native`] reads PDBs directly and registers as
//! the primary class, so the subsystem works without any platform services.
//! The [`enumerate`] module walks a session's lexical hierarchy into symbol
//! records and extracts line information.
//!
//! [`SymbolProvider`]: trait.SymbolProvider.html
//! [`ProviderSession`]: trait.ProviderSession.html
//! [`ProviderLoader`]: trait.ProviderLoader.html
//! [`resolve_provider`]: fn.resolve_provider.html
//! [`global_scope`]: trait.ProviderSession.html#tymethod.global_scope
//! [`native`]: native/index.html
//! [`enumerate`]: enumerate/index.html

use std::error::Error;
use std::fmt;
use std::path::Path;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use debugid::DebugId;
use thiserror::Error;
use uuid::Uuid;

mod enumerate;
#[cfg(any(test, feature = "test-support"))]
pub mod mock;
pub mod native;

pub use enumerate::{
    convert_symbol, enumerate_lexical_hierarchy, extract_line_info, EnumerateOptions,
};
pub use native::NativeProvider;

/// The error kind for [`DiaError`].
#[non_exhaustive]
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DiaErrorKind {
    /// No provider could be initialized or instantiated.
    ProviderUnavailable,

    /// The primary provider class is not registered.
    ///
    /// Provider resolution reacts to this kind by walking the fallback
    /// libraries; it is never surfaced to the debugger.
    NotRegistered,

    /// The PDB or DBG file could not be located.
    FileNotFound,

    /// The validation tuple did not match the file (signature or age).
    Mismatch,

    /// The PDB uses an obsolete format.
    ObsoleteFormat,

    /// The provider failed to open the file for another reason.
    OpenFailed,
}

impl fmt::Display for DiaErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::ProviderUnavailable => write!(f, "no symbol provider is available"),
            Self::NotRegistered => write!(f, "the provider class is not registered"),
            Self::FileNotFound => write!(f, "the debug file could not be located"),
            Self::Mismatch => write!(f, "the debug file does not match the image"),
            Self::ObsoleteFormat => write!(f, "the debug file uses an obsolete format"),
            Self::OpenFailed => write!(f, "the provider failed to open the debug file"),
        }
    }
}

/// An error interacting with the symbol provider.
#[derive(Debug, Error)]
#[error("{kind}")]
pub struct DiaError {
    kind: DiaErrorKind,
    #[source]
    source: Option<Box<dyn Error + Send + Sync + 'static>>,
}

impl DiaError {
    /// Creates a new error from a known kind of error as well as an
    /// arbitrary error payload.
    pub(crate) fn new<E>(kind: DiaErrorKind, source: E) -> Self
    where
        E: Into<Box<dyn Error + Send + Sync>>,
    {
        let source = Some(source.into());
        Self { kind, source }
    }

    /// Returns the corresponding [`DiaErrorKind`] for this error.
    ///
    /// [`DiaErrorKind`]: enum.DiaErrorKind.html
    pub fn kind(&self) -> DiaErrorKind {
        self.kind
    }
}

impl From<DiaErrorKind> for DiaError {
    fn from(kind: DiaErrorKind) -> Self {
        Self { kind, source: None }
    }
}

/// The tag of a symbol in the provider's lexical tree.
///
/// Tags distinguish both the entities of the lexical hierarchy (compilands,
/// functions, data, blocks, labels, publics) and the type symbols reached
/// through [`ProviderSession::symbol_type`] during size resolution.
///
/// [`ProviderSession::symbol_type`]: trait.ProviderSession.html#tymethod.symbol_type
#[non_exhaustive]
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum SymbolTag {
    /// The absence of a usable tag.
    Null,
    /// The root of the lexical tree.
    Exe,
    /// A compilation unit.
    Compiland,
    /// A function.
    Function,
    /// A data item.
    Data,
    /// A nested lexical scope.
    Block,
    /// A code label.
    Label,
    /// A public (linker-visible) symbol.
    PublicSymbol,
    /// A function type.
    FunctionType,
    /// A pointer type.
    PointerType,
    /// An array type.
    ArrayType,
    /// A user-defined type (class, struct, union).
    Udt,
    /// A native scalar type.
    BaseType,
}

/// The storage location class of a symbol.
#[non_exhaustive]
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum LocationKind {
    /// The symbol has a fixed address in the image.
    Static,
    /// The symbol lives in a register or on the stack.
    Dynamic,
}

/// The symbol kind filter for [`ProviderSession::find_symbol_by_rva`].
///
/// [`ProviderSession::find_symbol_by_rva`]: trait.ProviderSession.html#tymethod.find_symbol_by_rva
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum SymbolQueryKind {
    /// Match any addressable symbol.
    #[default]
    Any,
    /// Match only functions.
    Function,
    /// Match only blocks.
    Block,
    /// Match only labels.
    Label,
    /// Match only public symbols.
    Public,
}

/// An opaque handle to a symbol inside a [`ProviderSession`].
///
/// Handles are plain indices with no lifetime attached; they are only
/// meaningful for the session that produced them.
///
/// [`ProviderSession`]: trait.ProviderSession.html
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct SymbolHandle(pub(crate) u32);

/// The tuple a PDB is validated against before it is trusted.
///
/// The GUID and age are recorded in the image's CodeView debug directory;
/// the signature is the timestamp used by the 2.0-era format. A PDB matches
/// when GUID and age are equal, or, for files without a GUID, when signature
/// and age are equal.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct PdbValidation {
    /// The GUID the PDB must carry.
    pub guid: Uuid,
    /// The legacy signature for GUID-less PDBs.
    pub signature: u32,
    /// The age the PDB must carry.
    pub age: u32,
}

impl PdbValidation {
    /// Returns the debug identifier formed by GUID and age.
    pub fn debug_id(&self) -> DebugId {
        DebugId::from_parts(self.guid, self.age)
    }
}

/// A debug directory entry observed while loading from an executable.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct DebugDirectoryInfo {
    /// The type of the debug data (2 is CodeView).
    pub data_type: u32,
    /// The timestamp recorded in the directory.
    pub time_date_stamp: u32,
    /// The size of the referenced debug data.
    pub size_of_data: u32,
}

/// Observes the provider's search for debug information.
///
/// When a provider loads debug information from an executable, it probes
/// candidate files and reads the image's debug directories. The debugger can
/// install a callback to surface these steps; all methods have logging
/// default implementations.
pub trait LoadCallback {
    /// Called for every debug directory seen in the executable.
    fn on_debug_dir(&mut self, executable: bool, directory: &DebugDirectoryInfo) {
        log::debug!(
            "[dia] debug directory (executable: {executable}): type {} timestamp {:#x} size {:#x}",
            directory.data_type,
            directory.time_date_stamp,
            directory.size_of_data
        );
    }

    /// Called for every `.pdb` candidate the provider tried to open.
    fn on_open_pdb(&mut self, path: &Path, opened: bool) {
        log::debug!("[dia] open pdb {}: {opened}", path.display());
    }

    /// Called for every `.dbg` candidate the provider tried to open.
    fn on_open_dbg(&mut self, path: &Path, opened: bool) {
        log::debug!("[dia] open dbg {}: {opened}", path.display());
    }
}

/// A [`LoadCallback`] that only forwards to the log.
///
/// [`LoadCallback`]: trait.LoadCallback.html
#[derive(Clone, Copy, Debug, Default)]
pub struct LogLoadCallback;

impl LoadCallback for LogLoadCallback {}

/// A source-line record produced by the provider.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct DiaLineRecord {
    /// The address of the line's first instruction, relative to the image
    /// base.
    pub rva: u32,
    /// The 1-based line number in the source file.
    pub line_number: u32,
    /// The section index of the line's address.
    pub segment: u32,
    /// The section-relative offset of the line's address.
    pub offset: u32,
    /// The name of the source file.
    pub file_name: String,
}

/// A DIA-style symbol data source.
///
/// A data source is loaded from a file exactly once and then opens a session
/// for queries. Loading and validation are the blocking half of the
/// provider; sessions are immutable and cheap to share.
pub trait SymbolProvider: Send {
    /// Loads debug information directly from a PDB file.
    ///
    /// When a validation tuple is given, the PDB must match it exactly;
    /// mismatches fail with [`DiaErrorKind::Mismatch`] and 2.0-era files
    /// with [`DiaErrorKind::ObsoleteFormat`].
    ///
    /// [`DiaErrorKind::Mismatch`]: enum.DiaErrorKind.html#variant.Mismatch
    /// [`DiaErrorKind::ObsoleteFormat`]: enum.DiaErrorKind.html#variant.ObsoleteFormat
    fn load_pdb(&mut self, path: &Path, validation: Option<&PdbValidation>)
        -> Result<(), DiaError>;

    /// Loads debug information for an executable.
    ///
    /// The provider reads the executable's debug directories and probes
    /// matching `.dbg`/`.pdb` files next to it, notifying the callback for
    /// every attempt.
    fn load_exe(&mut self, path: &Path, callback: &mut dyn LoadCallback) -> Result<(), DiaError>;

    /// Opens a session over the loaded debug information.
    ///
    /// A non-zero `load_address` relocates all virtual addresses served by
    /// the session.
    fn open_session(&mut self, load_address: u64) -> Result<Arc<dyn ProviderSession>, DiaError>;
}

/// A query session over loaded debug information.
///
/// All per-symbol accessors mirror the provider's property getters: they
/// return `None` when the underlying property is absent, and a caller
/// normalizing a symbol treats that as a reason to reject the record, not as
/// an error that stops a walk.
pub trait ProviderSession: Send + Sync {
    /// The load address this session relocates to.
    fn load_address(&self) -> u64;

    /// Returns the root of the lexical tree.
    fn global_scope(&self) -> Result<SymbolHandle, DiaError>;

    /// The provider-assigned unique id of the symbol.
    fn symbol_id(&self, symbol: SymbolHandle) -> Option<u32>;

    /// The tag of the symbol.
    fn symbol_tag(&self, symbol: SymbolHandle) -> Option<SymbolTag>;

    /// The raw name of the symbol.
    fn symbol_name(&self, symbol: SymbolHandle) -> Option<String>;

    /// The section index of the symbol's address.
    fn symbol_segment(&self, symbol: SymbolHandle) -> Option<u32>;

    /// The section-relative offset of the symbol's address.
    fn symbol_offset(&self, symbol: SymbolHandle) -> Option<u32>;

    /// The symbol's address relative to the image base.
    fn symbol_rva(&self, symbol: SymbolHandle) -> Option<u32>;

    /// The symbol's virtual address after relocation by the load address.
    fn symbol_virtual_address(&self, symbol: SymbolHandle) -> Option<u64>;

    /// The length of the symbol in bytes.
    fn symbol_length(&self, symbol: SymbolHandle) -> Option<u64>;

    /// The storage location class of the symbol.
    fn symbol_location(&self, symbol: SymbolHandle) -> Option<LocationKind>;

    /// The type symbol associated with the symbol, if any.
    fn symbol_type(&self, symbol: SymbolHandle) -> Option<SymbolHandle>;

    /// Returns the children of a scope with the given tag, in lexical order.
    fn children(&self, symbol: SymbolHandle, tag: SymbolTag) -> Vec<SymbolHandle>;

    /// Finds the symbol of the requested kind closest at or below `rva`.
    ///
    /// Returns the symbol and the displacement of `rva` from its start.
    fn find_symbol_by_rva(
        &self,
        rva: u32,
        kind: SymbolQueryKind,
    ) -> Option<(SymbolHandle, u64)>;

    /// Enumerates the line records intersecting `[rva, rva + length)`.
    fn find_lines_by_rva(&self, rva: u32, length: u32) -> Vec<DiaLineRecord>;
}

/// Library init state: 0 = down, 1 = initialized.
static LIBRARY_STATE: AtomicU32 = AtomicU32::new(0);

/// Initializes the provider library for this process.
///
/// The gate is idempotent: every call after a successful init reports
/// success as well. This must be called before any provider is resolved.
pub fn init_library() -> bool {
    match LIBRARY_STATE.compare_exchange(0, 1, Ordering::AcqRel, Ordering::Acquire) {
        Ok(_) => true,
        Err(previous) => previous == 1,
    }
}

/// Tears down the provider library.
///
/// Only one teardown is accepted per successful init; later calls return
/// `false`.
pub fn shutdown_library() -> bool {
    LIBRARY_STATE
        .compare_exchange(1, 0, Ordering::AcqRel, Ordering::Acquire)
        .is_ok()
}

/// Returns whether the provider library is currently initialized.
pub fn is_library_initialized() -> bool {
    LIBRARY_STATE.load(Ordering::Acquire) == 1
}

/// Provider libraries probed when the primary class is not registered,
/// newest first.
pub const FALLBACK_PROVIDERS: &[&str] = &[
    "msdia140.dll",
    "msdia120.dll",
    "msdia100.dll",
    "msdia90.dll",
    "msdia80.dll",
];

/// Instantiates symbol providers.
///
/// This is the seam to the platform's class registry and library loader; the
/// debugger may substitute its own implementation. The built-in
/// [`NativeProviderLoader`] serves the bundled provider as the primary class
/// and has no library loading.
///
/// [`NativeProviderLoader`]: struct.NativeProviderLoader.html
pub trait ProviderLoader: Send + Sync {
    /// Instantiates the registered primary provider class.
    ///
    /// Fails with [`DiaErrorKind::NotRegistered`] when no class is
    /// registered, which triggers the fallback chain.
    ///
    /// [`DiaErrorKind::NotRegistered`]: enum.DiaErrorKind.html#variant.NotRegistered
    fn create_registered(&self) -> Result<Box<dyn SymbolProvider>, DiaError>;

    /// Loads a provider library directly, bypassing registration.
    fn load_library(&self, name: &str) -> Result<Box<dyn SymbolProvider>, DiaError>;
}

/// The built-in loader serving the bundled [`NativeProvider`].
///
/// [`NativeProvider`]: native/struct.NativeProvider.html
#[derive(Clone, Copy, Debug, Default)]
pub struct NativeProviderLoader;

impl ProviderLoader for NativeProviderLoader {
    fn create_registered(&self) -> Result<Box<dyn SymbolProvider>, DiaError> {
        Ok(Box::new(NativeProvider::new()))
    }

    fn load_library(&self, _name: &str) -> Result<Box<dyn SymbolProvider>, DiaError> {
        // Direct library loading goes through the platform loader, which is
        // not part of this crate.
        Err(DiaErrorKind::ProviderUnavailable.into())
    }
}

/// Resolves a symbol provider through the given loader.
///
/// The registered primary class is tried first. If it is not registered, the
/// well-known provider libraries in [`FALLBACK_PROVIDERS`] are tried in
/// order, stopping at the first that loads. All other failures, and
/// exhaustion of the fallbacks, surface as
/// [`DiaErrorKind::ProviderUnavailable`].
///
/// [`FALLBACK_PROVIDERS`]: constant.FALLBACK_PROVIDERS.html
/// [`DiaErrorKind::ProviderUnavailable`]: enum.DiaErrorKind.html#variant.ProviderUnavailable
pub fn resolve_provider(loader: &dyn ProviderLoader) -> Result<Box<dyn SymbolProvider>, DiaError> {
    if !is_library_initialized() {
        return Err(DiaErrorKind::ProviderUnavailable.into());
    }

    match loader.create_registered() {
        Ok(provider) => Ok(provider),
        Err(error) if error.kind() == DiaErrorKind::NotRegistered => {
            for name in FALLBACK_PROVIDERS {
                match loader.load_library(name) {
                    Ok(provider) => {
                        log::debug!("[dia] using fallback provider {name}");
                        return Ok(provider);
                    }
                    Err(error) => {
                        log::debug!("[dia] fallback provider {name} unavailable: {error}");
                    }
                }
            }

            Err(DiaErrorKind::ProviderUnavailable.into())
        }
        Err(error) => {
            log::warn!("[dia] unable to instantiate the symbol provider: {error}");
            Err(DiaError::new(DiaErrorKind::ProviderUnavailable, error))
        }
    }
}

/// Loads debug information from a path, dispatching on the file extension.
///
/// Paths ending in `.pdb` are loaded (and validated) directly; anything else
/// is treated as an executable whose companion debug file is searched next
/// to it.
pub fn open_provider(
    provider: &mut dyn SymbolProvider,
    path: &Path,
    validation: Option<&PdbValidation>,
    callback: &mut dyn LoadCallback,
) -> Result<(), DiaError> {
    let is_pdb = path
        .extension()
        .map_or(false, |ext| ext.eq_ignore_ascii_case("pdb"));

    if is_pdb {
        provider.load_pdb(path, validation)
    } else {
        provider.load_exe(path, callback)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use similar_asserts::assert_eq;

    use super::*;

    /// A loader that records the order of load attempts.
    struct RecordingLoader {
        registered: bool,
        succeed_on: Option<&'static str>,
        attempts: Mutex<Vec<String>>,
    }

    struct DummyProvider;

    impl SymbolProvider for DummyProvider {
        fn load_pdb(
            &mut self,
            _path: &Path,
            _validation: Option<&PdbValidation>,
        ) -> Result<(), DiaError> {
            Ok(())
        }

        fn load_exe(
            &mut self,
            _path: &Path,
            _callback: &mut dyn LoadCallback,
        ) -> Result<(), DiaError> {
            Ok(())
        }

        fn open_session(
            &mut self,
            _load_address: u64,
        ) -> Result<Arc<dyn ProviderSession>, DiaError> {
            Err(DiaErrorKind::OpenFailed.into())
        }
    }

    impl ProviderLoader for RecordingLoader {
        fn create_registered(&self) -> Result<Box<dyn SymbolProvider>, DiaError> {
            self.attempts.lock().unwrap().push("registered".into());
            if self.registered {
                Ok(Box::new(DummyProvider))
            } else {
                Err(DiaErrorKind::NotRegistered.into())
            }
        }

        fn load_library(&self, name: &str) -> Result<Box<dyn SymbolProvider>, DiaError> {
            self.attempts.lock().unwrap().push(name.into());
            if self.succeed_on == Some(name) {
                Ok(Box::new(DummyProvider))
            } else {
                Err(DiaErrorKind::ProviderUnavailable.into())
            }
        }
    }

    /// Serializes tests that toggle the process-wide init gate.
    static LIBRARY_LOCK: Mutex<()> = Mutex::new(());

    fn with_library<R>(f: impl FnOnce() -> R) -> R {
        let _guard = LIBRARY_LOCK.lock().unwrap();
        init_library();
        let result = f();
        shutdown_library();
        result
    }

    #[test]
    fn test_init_library_idempotent() {
        let _guard = LIBRARY_LOCK.lock().unwrap();

        assert!(init_library());
        assert!(init_library());
        assert!(is_library_initialized());

        assert!(shutdown_library());
        assert!(!shutdown_library());
        assert!(!is_library_initialized());
    }

    #[test]
    fn test_resolve_requires_init() {
        let _guard = LIBRARY_LOCK.lock().unwrap();

        let loader = RecordingLoader {
            registered: true,
            succeed_on: None,
            attempts: Mutex::new(Vec::new()),
        };

        let error = resolve_provider(&loader).unwrap_err();
        assert_eq!(error.kind(), DiaErrorKind::ProviderUnavailable);
        assert!(loader.attempts.lock().unwrap().is_empty());
    }

    #[test]
    fn test_resolve_primary() {
        with_library(|| {
            let loader = RecordingLoader {
                registered: true,
                succeed_on: None,
                attempts: Mutex::new(Vec::new()),
            };

            assert!(resolve_provider(&loader).is_ok());
            assert_eq!(*loader.attempts.lock().unwrap(), vec!["registered"]);
        });
    }

    #[test]
    fn test_resolve_fallback_order() {
        with_library(|| {
            let loader = RecordingLoader {
                registered: false,
                succeed_on: Some("msdia100.dll"),
                attempts: Mutex::new(Vec::new()),
            };

            assert!(resolve_provider(&loader).is_ok());
            assert_eq!(
                *loader.attempts.lock().unwrap(),
                vec!["registered", "msdia140.dll", "msdia120.dll", "msdia100.dll"]
            );
        });
    }

    #[test]
    fn test_resolve_all_fallbacks_fail() {
        with_library(|| {
            let loader = RecordingLoader {
                registered: false,
                succeed_on: None,
                attempts: Mutex::new(Vec::new()),
            };

            let error = resolve_provider(&loader).unwrap_err();
            assert_eq!(error.kind(), DiaErrorKind::ProviderUnavailable);

            let attempts = loader.attempts.lock().unwrap();
            assert_eq!(attempts.len(), 1 + FALLBACK_PROVIDERS.len());
            for (attempt, expected) in attempts[1..].iter().zip(FALLBACK_PROVIDERS) {
                assert_eq!(attempt, expected);
            }
        });
    }
}
