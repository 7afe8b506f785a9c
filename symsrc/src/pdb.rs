//! The PDB-backed symbol source.
//!
//! Loading a PDB is slow enough to be disruptive on the debugger's event
//! thread, so the front-end opens and validates the provider session on the
//! calling thread (failures surface immediately) and then walks the debug
//! information on two background threads: one driving the lexical
//! enumerator into the symbol index, one driving line extraction into the
//! line index. Queries are served throughout; each index is guarded by its
//! own short-held lock.

use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Instant;

use parking_lot::Mutex;

use symsrc_common::{SourceLineInfo, SymbolInfo};
use symsrc_debuginfo::dia::{
    self, convert_symbol, EnumerateOptions, LogLoadCallback, NativeProviderLoader, PdbValidation,
    ProviderSession, SymbolProvider, SymbolQueryKind,
};

use crate::index::{LineIndex, SymbolIndex};
use crate::source::SymbolSource;
use crate::SourceError;

/// Shared state between the front-end and its loader threads.
struct Shared {
    symbols: Mutex<SymbolIndex>,
    lines: Mutex<LineIndex>,
    requires_shutdown: AtomicBool,
    load_counter: AtomicUsize,
}

/// A symbol source backed by a PDB through the DIA-style provider.
pub struct PdbSymbolSource {
    shared: Arc<Shared>,
    session: Option<Arc<dyn ProviderSession>>,
    symbols_thread: Option<JoinHandle<()>>,
    lines_thread: Option<JoinHandle<()>>,
    image_base: u64,
    image_size: u64,
}

impl Default for PdbSymbolSource {
    fn default() -> Self {
        Self::new()
    }
}

impl PdbSymbolSource {
    /// Creates a source with no debug information loaded.
    pub fn new() -> Self {
        PdbSymbolSource {
            shared: Arc::new(Shared {
                symbols: Mutex::new(SymbolIndex::default()),
                lines: Mutex::new(LineIndex::default()),
                requires_shutdown: AtomicBool::new(false),
                load_counter: AtomicUsize::new(0),
            }),
            session: None,
            symbols_thread: None,
            lines_thread: None,
            image_base: 0,
            image_size: 0,
        }
    }

    /// Initializes the provider library, reporting whether PDB loading is
    /// possible in this process.
    pub fn is_library_available() -> bool {
        dia::init_library()
    }

    /// Loads the PDB at `path` for a module mapped at `image_base`.
    ///
    /// Opens and validates synchronously, then spawns the background
    /// loaders and returns. [`is_loading`] stays `true` until both loaders
    /// finish.
    ///
    /// [`is_loading`]: trait.SymbolSource.html#method.is_loading
    pub fn load_pdb(
        &mut self,
        path: &Path,
        image_base: u64,
        image_size: u64,
    ) -> Result<(), SourceError> {
        self.load_pdb_validated(path, None, image_base, image_size)
    }

    /// Like [`load_pdb`], validating the PDB against the module's
    /// `(guid, signature, age)` tuple.
    ///
    /// [`load_pdb`]: struct.PdbSymbolSource.html#method.load_pdb
    pub fn load_pdb_validated(
        &mut self,
        path: &Path,
        validation: Option<PdbValidation>,
        image_base: u64,
        image_size: u64,
    ) -> Result<(), SourceError> {
        if !Self::is_library_available() {
            return Err(SourceError::Dia(
                dia::DiaErrorKind::ProviderUnavailable.into(),
            ));
        }

        let provider = dia::resolve_provider(&NativeProviderLoader)?;
        self.load_with_provider(provider, path, validation, image_base, image_size)
    }

    /// Loads through an explicit provider instance.
    ///
    /// This is the seam the debugger (and the test suite) uses to supply a
    /// custom provider implementation.
    pub fn load_with_provider(
        &mut self,
        mut provider: Box<dyn SymbolProvider>,
        path: &Path,
        validation: Option<PdbValidation>,
        image_base: u64,
        image_size: u64,
    ) -> Result<(), SourceError> {
        dia::open_provider(
            provider.as_mut(),
            path,
            validation.as_ref(),
            &mut LogLoadCallback,
        )?;

        let session = provider.open_session(image_base)?;

        self.image_base = image_base;
        self.image_size = image_size;
        self.session = Some(Arc::clone(&session));

        self.spawn_symbols_loader(Arc::clone(&session))?;
        self.spawn_lines_loader(session)?;

        Ok(())
    }

    fn spawn_symbols_loader(&mut self, session: Arc<dyn ProviderSession>) -> Result<(), SourceError> {
        let shared = Arc::clone(&self.shared);
        shared.load_counter.fetch_add(1, Ordering::SeqCst);

        let handle = std::thread::Builder::new()
            .name("symsrc-symbols".into())
            .spawn(move || {
                let started = Instant::now();
                let options = EnumerateOptions::default();

                let result =
                    dia::enumerate_lexical_hierarchy(session.as_ref(), &options, &mut |record| {
                        if shared.requires_shutdown.load(Ordering::Relaxed) {
                            return false;
                        }
                        shared.symbols.lock().append(record);
                        true
                    });

                if let Err(error) = result {
                    log::warn!("[symsrc] symbol enumeration failed: {error}");
                }

                // Sort once; partial results of a cancelled walk stay
                // queryable.
                let mut symbols = shared.symbols.lock();
                symbols.publish();
                log::debug!(
                    "[symsrc] loaded {} symbols in {:?}",
                    symbols.len(),
                    started.elapsed()
                );
                drop(symbols);

                shared.load_counter.fetch_sub(1, Ordering::SeqCst);
            })
            .map_err(|error| {
                shared_counter_rollback(&self.shared);
                SourceError::Io(error)
            })?;

        self.symbols_thread = Some(handle);
        Ok(())
    }

    fn spawn_lines_loader(&mut self, session: Arc<dyn ProviderSession>) -> Result<(), SourceError> {
        let shared = Arc::clone(&self.shared);
        shared.load_counter.fetch_add(1, Ordering::SeqCst);

        let handle = std::thread::Builder::new()
            .name("symsrc-lines".into())
            .spawn(move || {
                let started = Instant::now();

                let result = dia::extract_line_info(session.as_ref(), &mut |record| {
                    if shared.requires_shutdown.load(Ordering::Relaxed) {
                        return false;
                    }
                    shared.lines.lock().insert(
                        u64::from(record.rva),
                        record.line_number,
                        &record.file_name,
                    );
                    true
                });

                if let Err(error) = result {
                    log::warn!("[symsrc] line extraction failed: {error}");
                }

                let lines = shared.lines.lock();
                log::debug!(
                    "[symsrc] loaded {} line records in {:?}",
                    lines.len(),
                    started.elapsed()
                );
                drop(lines);

                shared.load_counter.fetch_sub(1, Ordering::SeqCst);
            })
            .map_err(|error| {
                shared_counter_rollback(&self.shared);
                SourceError::Io(error)
            })?;

        self.lines_thread = Some(handle);
        Ok(())
    }

    /// Blocks until both background loaders have finished.
    ///
    /// Mostly useful for tests and shutdown paths; queries do not need it.
    pub fn join(&mut self) {
        if let Some(handle) = self.symbols_thread.take() {
            let _ = handle.join();
        }
        if let Some(handle) = self.lines_thread.take() {
            let _ = handle.join();
        }
    }

    /// Asks the provider session for the symbol of the given kind closest
    /// at or below `rva`.
    ///
    /// The provider performs the nearest-lower match itself, so this works
    /// before the background loaders have published the indices. The
    /// returned record carries the displacement of `rva` from the symbol's
    /// start.
    pub fn find_symbol_by_rva(&self, rva: u32, kind: SymbolQueryKind) -> Option<SymbolInfo> {
        let session = self.session.as_ref()?;
        let (symbol, displacement) = session.find_symbol_by_rva(rva, kind)?;

        let mut record = convert_symbol(session.as_ref(), symbol, &EnumerateOptions::default())?;
        record.displacement = displacement;
        Some(record)
    }

    /// The load address of the module this source describes.
    pub fn image_base(&self) -> u64 {
        self.image_base
    }

    /// The size of the module's image in memory.
    pub fn image_size(&self) -> u64 {
        self.image_size
    }
}

fn shared_counter_rollback(shared: &Shared) {
    shared.load_counter.fetch_sub(1, Ordering::SeqCst);
}

impl SymbolSource for PdbSymbolSource {
    fn is_open(&self) -> bool {
        self.session.is_some()
    }

    fn is_loading(&self) -> bool {
        self.shared.load_counter.load(Ordering::SeqCst) > 0
    }

    fn cancel_loading(&self) {
        self.shared.requires_shutdown.store(true, Ordering::SeqCst);
    }

    fn find_symbol_exact(&self, rva: u64) -> Option<SymbolInfo> {
        self.shared.symbols.lock().find_exact(rva)
    }

    fn find_symbol_exact_or_lower(&self, rva: u64) -> Option<SymbolInfo> {
        self.shared.symbols.lock().find_exact_or_lower(rva)
    }

    fn find_symbol_by_name(&self, name: &str, case_sensitive: bool) -> Option<SymbolInfo> {
        self.shared.symbols.lock().find_by_name(name, case_sensitive)
    }

    fn find_symbols_by_prefix(&self, prefix: &str, case_sensitive: bool) -> Vec<SymbolInfo> {
        let mut out = Vec::new();
        self.shared
            .symbols
            .lock()
            .find_by_prefix(prefix, case_sensitive, &mut out);
        out
    }

    fn find_source_line_info(&self, rva: u64) -> Option<SourceLineInfo> {
        self.shared.lines.lock().find(rva)
    }

    fn enum_symbols(&self, callback: &mut dyn FnMut(&SymbolInfo) -> bool) {
        self.shared.symbols.lock().for_each(callback);
    }
}

impl Drop for PdbSymbolSource {
    fn drop(&mut self) {
        self.shared.requires_shutdown.store(true, Ordering::SeqCst);
        self.join();
    }
}
