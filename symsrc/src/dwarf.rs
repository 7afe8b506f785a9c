//! The DWARF-backed symbol source.
//!
//! Used for modules whose debug information is embedded in the PE image
//! (MinGW-style builds) instead of a PDB. The image is validated on the
//! calling thread; the DWARF walk runs on the same two-loader structure as
//! the PDB source, with each thread re-opening the shared mapping through
//! the object-access adapter. Function symbols come from the DWARF
//! subprograms, public symbols from the COFF symbol table, and line records
//! from the line programs.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;

use parking_lot::Mutex;

use symsrc_common::{ByteView, SourceLineInfo, SymbolInfo, SymbolKind};
use symsrc_debuginfo::dwarf::{self, PeObjectAccess};
use symsrc_debuginfo::pe::PeModuleView;

use crate::index::{LineIndex, SymbolIndex};
use crate::source::SymbolSource;
use crate::SourceError;

struct Shared {
    symbols: Mutex<SymbolIndex>,
    lines: Mutex<LineIndex>,
    requires_shutdown: AtomicBool,
    load_counter: AtomicUsize,
}

/// A symbol source backed by DWARF data embedded in a PE image.
pub struct DwarfSymbolSource {
    shared: Arc<Shared>,
    open: bool,
    symbols_thread: Option<JoinHandle<()>>,
    lines_thread: Option<JoinHandle<()>>,
    image_base: u64,
    image_size: u64,
}

impl Default for DwarfSymbolSource {
    fn default() -> Self {
        Self::new()
    }
}

impl DwarfSymbolSource {
    /// Creates a source with no debug information loaded.
    pub fn new() -> Self {
        DwarfSymbolSource {
            shared: Arc::new(Shared {
                symbols: Mutex::new(SymbolIndex::default()),
                lines: Mutex::new(LineIndex::default()),
                requires_shutdown: AtomicBool::new(false),
                load_counter: AtomicUsize::new(0),
            }),
            open: false,
            symbols_thread: None,
            lines_thread: None,
            image_base: 0,
            image_size: 0,
        }
    }

    /// Loads DWARF debug information from a mapped PE image.
    ///
    /// The image headers are validated synchronously; a malformed image
    /// fails here and leaves the source closed. The symbol and line walks
    /// then run on background threads.
    pub fn load_image(
        &mut self,
        data: ByteView<'static>,
        image_base: u64,
        image_size: u64,
    ) -> Result<(), SourceError> {
        // Parse once on the caller's thread so malformed images are
        // rejected synchronously.
        let view = PeModuleView::parse(&data)?;
        let preferred_base = view.image_base();
        drop(view);

        self.image_base = image_base;
        self.image_size = image_size;
        self.open = true;

        self.spawn_symbols_loader(data.clone(), preferred_base, image_base)?;
        self.spawn_lines_loader(data, preferred_base)?;

        Ok(())
    }

    /// Loads DWARF debug information from an image file on disk.
    pub fn load_file(
        &mut self,
        path: &std::path::Path,
        image_base: u64,
        image_size: u64,
    ) -> Result<(), SourceError> {
        let data = ByteView::open(path)?;
        self.load_image(data, image_base, image_size)
    }

    fn spawn_symbols_loader(
        &mut self,
        data: ByteView<'static>,
        preferred_base: u64,
        load_base: u64,
    ) -> Result<(), SourceError> {
        let shared = Arc::clone(&self.shared);
        shared.load_counter.fetch_add(1, Ordering::SeqCst);

        let handle = std::thread::Builder::new()
            .name("symsrc-dwarf-symbols".into())
            .spawn(move || {
                if let Err(error) = load_symbols(&shared, &data, preferred_base, load_base) {
                    log::warn!("[symsrc] dwarf symbol extraction failed: {error}");
                }

                let mut symbols = shared.symbols.lock();
                symbols.publish();
                log::debug!("[symsrc] loaded {} dwarf symbols", symbols.len());
                drop(symbols);

                shared.load_counter.fetch_sub(1, Ordering::SeqCst);
            })
            .map_err(|error| {
                self.shared.load_counter.fetch_sub(1, Ordering::SeqCst);
                SourceError::Io(error)
            })?;

        self.symbols_thread = Some(handle);
        Ok(())
    }

    fn spawn_lines_loader(
        &mut self,
        data: ByteView<'static>,
        preferred_base: u64,
    ) -> Result<(), SourceError> {
        let shared = Arc::clone(&self.shared);
        shared.load_counter.fetch_add(1, Ordering::SeqCst);

        let handle = std::thread::Builder::new()
            .name("symsrc-dwarf-lines".into())
            .spawn(move || {
                if let Err(error) = load_lines(&shared, &data, preferred_base) {
                    log::warn!("[symsrc] dwarf line extraction failed: {error}");
                }

                let lines = shared.lines.lock();
                log::debug!("[symsrc] loaded {} dwarf line records", lines.len());
                drop(lines);

                shared.load_counter.fetch_sub(1, Ordering::SeqCst);
            })
            .map_err(|error| {
                self.shared.load_counter.fetch_sub(1, Ordering::SeqCst);
                SourceError::Io(error)
            })?;

        self.lines_thread = Some(handle);
        Ok(())
    }

    /// Blocks until both background loaders have finished.
    pub fn join(&mut self) {
        if let Some(handle) = self.symbols_thread.take() {
            let _ = handle.join();
        }
        if let Some(handle) = self.lines_thread.take() {
            let _ = handle.join();
        }
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

fn load_symbols(
    shared: &Shared,
    data: &ByteView<'static>,
    preferred_base: u64,
    load_base: u64,
) -> Result<(), SourceError> {
    let view = PeModuleView::parse(data)?;
    let access = PeObjectAccess::new(&view);
    let dwarf = dwarf::load_dwarf(&access)?;

    dwarf::enumerate_functions(&dwarf, preferred_base, &mut |function| {
        if shared.requires_shutdown.load(Ordering::Relaxed) {
            return false;
        }

        shared.symbols.lock().append(SymbolInfo {
            virtual_address: load_base + function.rva,
            rva: function.rva,
            segment: 0,
            offset: 0,
            size: function.size,
            perfect_size: function.size.is_some(),
            displacement: 0,
            name: function.name,
            undecorated_name: String::new(),
            kind: SymbolKind::Function,
            public_symbol: false,
        });
        true
    })?;

    // The COFF symbol table carries the linker-visible names; serve them as
    // publics alongside the DWARF functions.
    if let Ok(publics) = view.coff_public_symbols() {
        for public in publics {
            if shared.requires_shutdown.load(Ordering::Relaxed) {
                break;
            }

            shared.symbols.lock().append(SymbolInfo {
                virtual_address: load_base + u64::from(public.rva),
                rva: u64::from(public.rva),
                segment: 0,
                offset: 0,
                size: None,
                perfect_size: false,
                displacement: 0,
                name: public.name,
                undecorated_name: String::new(),
                kind: SymbolKind::Public,
                public_symbol: true,
            });
        }
    }

    Ok(())
}

fn load_lines(
    shared: &Shared,
    data: &ByteView<'static>,
    preferred_base: u64,
) -> Result<(), SourceError> {
    let view = PeModuleView::parse(data)?;
    let access = PeObjectAccess::new(&view);
    let dwarf = dwarf::load_dwarf(&access)?;

    dwarf::enumerate_lines(&dwarf, preferred_base, &mut |record| {
        if shared.requires_shutdown.load(Ordering::Relaxed) {
            return false;
        }

        shared
            .lines
            .lock()
            .insert(record.rva, record.line, &record.file);
        true
    })?;

    Ok(())
}

impl SymbolSource for DwarfSymbolSource {
    fn is_open(&self) -> bool {
        self.open
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

impl Drop for DwarfSymbolSource {
    fn drop(&mut self) {
        self.shared.requires_shutdown.store(true, Ordering::SeqCst);
        self.join();
    }
}
