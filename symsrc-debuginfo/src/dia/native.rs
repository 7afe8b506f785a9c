//! The built-in PDB provider.
//!
//! This provider reads PDB files directly through the external `pdb` crate
//! and registers as the primary provider class, so no platform COM services
//! are required. Loading materializes the PDB's lexical tree into plain
//! nodes: compilands from the module list, functions with their nested data,
//! blocks and labels from the module streams, publics and global data from
//! the globals stream, and line records from the per-module line programs.
//! Sessions never touch the file again after loading, which makes them
//! trivially shareable between the loader threads.
//!
//! Lexical scopes inside a function are flattened onto the function itself:
//! a static declared in a nested block is served as a data child of the
//! function, matching how the enumerator recurses one level deep.

use std::cmp::Ordering;
use std::collections::HashMap;
use std::io::Cursor;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use debugid::DebugId;
use pdb::{FallibleIterator, MachineType, SymbolData, TypeData, TypeIndex};
use uuid::Uuid;

use symsrc_common::ByteView;

use super::{
    DebugDirectoryInfo, DiaError, DiaErrorKind, DiaLineRecord, LoadCallback, LocationKind,
    PdbValidation, ProviderSession, SymbolHandle, SymbolProvider, SymbolQueryKind, SymbolTag,
};

/// The magic of the 2.0-era PDB format, which is too old to read.
const MAGIC_SMALL: &[u8] = b"Microsoft C/C++ program database 2.00";

type Pdb<'d> = pdb::PDB<'d, Cursor<&'d [u8]>>;

fn open_failed<E>(source: E) -> DiaError
where
    E: Into<Box<dyn std::error::Error + Send + Sync>>,
{
    DiaError::new(DiaErrorKind::OpenFailed, source)
}

/// One materialized symbol of the lexical tree.
struct Node {
    tag: SymbolTag,
    name: Option<String>,
    segment: Option<u32>,
    offset: Option<u32>,
    rva: Option<u32>,
    length: Option<u64>,
    location: Option<LocationKind>,
    type_node: Option<usize>,
    children: Vec<usize>,
}

impl Node {
    fn scope(tag: SymbolTag, name: Option<String>) -> Self {
        Node {
            tag,
            name,
            segment: None,
            offset: None,
            rva: None,
            length: None,
            location: None,
            type_node: None,
            children: Vec::new(),
        }
    }
}

/// Debug information materialized by a load, waiting for a session.
struct LoadedPdb {
    nodes: Vec<Node>,
    lines: Vec<DiaLineRecord>,
}

/// Maps type indexes to parsed items, loading lazily in one forward pass.
struct TypeMap<'s> {
    iter: pdb::ItemIter<'s, TypeIndex>,
    finder: pdb::ItemFinder<'s, TypeIndex>,
}

impl<'s> TypeMap<'s> {
    fn try_get(&mut self, index: TypeIndex) -> Result<pdb::Item<'s, TypeIndex>, pdb::Error> {
        if index <= self.finder.max_index() {
            return self.finder.find(index);
        }

        while let Some(item) = self.iter.next()? {
            self.finder.update(&self.iter);
            match item.index().partial_cmp(&index) {
                Some(Ordering::Equal) => return Ok(item),
                Some(Ordering::Greater) => break,
                _ => continue,
            }
        }

        Err(pdb::Error::TypeNotFound(index.into()))
    }
}

fn primitive_size(primitive: &pdb::PrimitiveType, pointer_size: u64) -> Option<u64> {
    use pdb::PrimitiveKind;

    if primitive.indirection.is_some() {
        return Some(pointer_size);
    }

    let size = match primitive.kind {
        PrimitiveKind::Char
        | PrimitiveKind::UChar
        | PrimitiveKind::RChar
        | PrimitiveKind::I8
        | PrimitiveKind::U8
        | PrimitiveKind::Bool8 => 1,
        PrimitiveKind::WChar
        | PrimitiveKind::RChar16
        | PrimitiveKind::Short
        | PrimitiveKind::UShort
        | PrimitiveKind::I16
        | PrimitiveKind::U16
        | PrimitiveKind::Bool16
        | PrimitiveKind::F16 => 2,
        PrimitiveKind::RChar32
        | PrimitiveKind::Long
        | PrimitiveKind::ULong
        | PrimitiveKind::I32
        | PrimitiveKind::U32
        | PrimitiveKind::Bool32
        | PrimitiveKind::F32
        | PrimitiveKind::HRESULT => 4,
        PrimitiveKind::Quad
        | PrimitiveKind::UQuad
        | PrimitiveKind::I64
        | PrimitiveKind::U64
        | PrimitiveKind::Bool64
        | PrimitiveKind::F64 => 8,
        PrimitiveKind::Octa | PrimitiveKind::UOcta | PrimitiveKind::I128 | PrimitiveKind::U128 => {
            16
        }
        PrimitiveKind::F48 => 6,
        PrimitiveKind::F80 => 10,
        PrimitiveKind::F128 => 16,
        _ => return None,
    };

    Some(size)
}

/// Builds the node tree while walking the PDB streams.
struct TreeBuilder<'a, 's> {
    nodes: Vec<Node>,
    address_map: &'a pdb::AddressMap<'s>,
    pointer_size: u64,
    /// Function node indexes, promoted to global children after the walk.
    functions: Vec<usize>,
    /// Data already materialized from module streams, keyed by identity, so
    /// the globals stream references the same node instead of duplicating it.
    data_by_identity: HashMap<(u32, u32, String), usize>,
    /// Cache of materialized type nodes.
    type_nodes: HashMap<TypeIndex, usize>,
    /// The shared node for unresolvable types.
    null_type: Option<usize>,
}

impl<'a, 's> TreeBuilder<'a, 's> {
    fn new(address_map: &'a pdb::AddressMap<'s>, pointer_size: u64) -> Self {
        let mut nodes = Vec::new();
        nodes.push(Node::scope(SymbolTag::Exe, None));

        TreeBuilder {
            nodes,
            address_map,
            pointer_size,
            functions: Vec::new(),
            data_by_identity: HashMap::new(),
            type_nodes: HashMap::new(),
            null_type: None,
        }
    }

    fn add(&mut self, node: Node) -> usize {
        self.nodes.push(node);
        self.nodes.len() - 1
    }

    fn add_addressed(
        &mut self,
        tag: SymbolTag,
        name: &pdb::RawString<'_>,
        offset: pdb::PdbInternalSectionOffset,
        length: Option<u64>,
        type_node: Option<usize>,
    ) -> usize {
        let rva = offset.to_rva(self.address_map).map(|rva| rva.0);

        self.add(Node {
            tag,
            name: Some(name.to_string().into_owned()),
            segment: Some(u32::from(offset.section)),
            offset: Some(offset.offset),
            rva,
            length,
            location: Some(LocationKind::Static),
            type_node,
            children: Vec::new(),
        })
    }

    fn null_type_node(&mut self) -> usize {
        if let Some(index) = self.null_type {
            return index;
        }

        let index = self.add(Node::scope(SymbolTag::Null, None));
        self.null_type = Some(index);
        index
    }

    /// Materializes the type node for a type index.
    ///
    /// Unknown and unresolvable indexes map to the shared null-tag node, so
    /// size resolution falls back to the symbol's own length.
    fn type_node(&mut self, types: &mut TypeMap<'_>, index: TypeIndex) -> usize {
        if index == TypeIndex(0) {
            return self.null_type_node();
        }

        if let Some(&node) = self.type_nodes.get(&index) {
            return node;
        }

        let (tag, length) = self.describe_type(types, index, 0);
        let node = self.add(Node {
            tag,
            name: None,
            segment: None,
            offset: None,
            rva: None,
            length,
            location: None,
            type_node: None,
            children: Vec::new(),
        });

        self.type_nodes.insert(index, node);
        node
    }

    fn describe_type(
        &mut self,
        types: &mut TypeMap<'_>,
        index: TypeIndex,
        depth: u32,
    ) -> (SymbolTag, Option<u64>) {
        // Modifier chains are short; the guard only protects against
        // corrupted, self-referential records.
        if depth > 8 || index == TypeIndex(0) {
            return (SymbolTag::Null, None);
        }

        let item = match types.try_get(index) {
            Ok(item) => item,
            Err(_) => return (SymbolTag::Null, None),
        };

        match item.parse() {
            Ok(TypeData::Procedure(_)) | Ok(TypeData::MemberFunction(_)) => {
                (SymbolTag::FunctionType, None)
            }
            Ok(TypeData::Pointer(_)) => (SymbolTag::PointerType, Some(self.pointer_size)),
            Ok(TypeData::Array(array)) => (
                SymbolTag::ArrayType,
                array.dimensions.last().copied().map(u64::from),
            ),
            Ok(TypeData::Class(class)) => (SymbolTag::Udt, Some(class.size as u64)),
            Ok(TypeData::Union(data)) => (SymbolTag::Udt, Some(data.size as u64)),
            Ok(TypeData::Enumeration(data)) => {
                let (_, length) = self.describe_type(types, data.underlying_type, depth + 1);
                (SymbolTag::BaseType, length)
            }
            Ok(TypeData::Bitfield(data)) => {
                let (_, length) = self.describe_type(types, data.underlying_type, depth + 1);
                (SymbolTag::BaseType, length)
            }
            Ok(TypeData::Modifier(data)) => {
                self.describe_type(types, data.underlying_type, depth + 1)
            }
            Ok(TypeData::Primitive(primitive)) => (
                SymbolTag::BaseType,
                primitive_size(&primitive, self.pointer_size),
            ),
            Ok(_) => (SymbolTag::BaseType, None),
            Err(_) => (SymbolTag::Null, None),
        }
    }

    fn data_identity(offset: pdb::PdbInternalSectionOffset, name: &pdb::RawString<'_>) -> (u32, u32, String) {
        (
            u32::from(offset.section),
            offset.offset,
            name.to_string().into_owned(),
        )
    }
}

/// A query session over a materialized PDB.
pub struct NativeSession {
    load_address: u64,
    nodes: Vec<Node>,
    /// Addressable node indexes ordered by RVA, for nearest-lower lookups.
    addr_order: Vec<usize>,
    /// Line records ordered by RVA.
    lines: Vec<DiaLineRecord>,
}

impl NativeSession {
    fn node(&self, handle: SymbolHandle) -> Option<&Node> {
        self.nodes.get(handle.0 as usize)
    }

    fn matches_query(tag: SymbolTag, kind: SymbolQueryKind) -> bool {
        match kind {
            SymbolQueryKind::Any => matches!(
                tag,
                SymbolTag::Function
                    | SymbolTag::Data
                    | SymbolTag::Label
                    | SymbolTag::Block
                    | SymbolTag::PublicSymbol
            ),
            SymbolQueryKind::Function => tag == SymbolTag::Function,
            SymbolQueryKind::Block => tag == SymbolTag::Block,
            SymbolQueryKind::Label => tag == SymbolTag::Label,
            SymbolQueryKind::Public => tag == SymbolTag::PublicSymbol,
        }
    }
}

impl ProviderSession for NativeSession {
    fn load_address(&self) -> u64 {
        self.load_address
    }

    fn global_scope(&self) -> Result<SymbolHandle, DiaError> {
        Ok(SymbolHandle(0))
    }

    fn symbol_id(&self, symbol: SymbolHandle) -> Option<u32> {
        self.node(symbol).map(|_| symbol.0)
    }

    fn symbol_tag(&self, symbol: SymbolHandle) -> Option<SymbolTag> {
        self.node(symbol).map(|node| node.tag)
    }

    fn symbol_name(&self, symbol: SymbolHandle) -> Option<String> {
        self.node(symbol)?.name.clone()
    }

    fn symbol_segment(&self, symbol: SymbolHandle) -> Option<u32> {
        self.node(symbol)?.segment
    }

    fn symbol_offset(&self, symbol: SymbolHandle) -> Option<u32> {
        self.node(symbol)?.offset
    }

    fn symbol_rva(&self, symbol: SymbolHandle) -> Option<u32> {
        self.node(symbol)?.rva
    }

    fn symbol_virtual_address(&self, symbol: SymbolHandle) -> Option<u64> {
        let node = self.node(symbol)?;
        match node.rva {
            Some(rva) => Some(self.load_address + u64::from(rva)),
            // Without a relocation the address degenerates to the raw
            // offset, which normalization rejects.
            None => node.offset.map(u64::from),
        }
    }

    fn symbol_length(&self, symbol: SymbolHandle) -> Option<u64> {
        self.node(symbol)?.length
    }

    fn symbol_location(&self, symbol: SymbolHandle) -> Option<LocationKind> {
        self.node(symbol)?.location
    }

    fn symbol_type(&self, symbol: SymbolHandle) -> Option<SymbolHandle> {
        let index = self.node(symbol)?.type_node?;
        Some(SymbolHandle(index as u32))
    }

    fn children(&self, symbol: SymbolHandle, tag: SymbolTag) -> Vec<SymbolHandle> {
        match self.node(symbol) {
            Some(node) => node
                .children
                .iter()
                .filter(|&&child| self.nodes[child].tag == tag)
                .map(|&child| SymbolHandle(child as u32))
                .collect(),
            None => Vec::new(),
        }
    }

    fn find_symbol_by_rva(&self, rva: u32, kind: SymbolQueryKind) -> Option<(SymbolHandle, u64)> {
        let mut index = self
            .addr_order
            .partition_point(|&node| self.nodes[node].rva.unwrap_or(u32::MAX) <= rva);

        while index > 0 {
            index -= 1;
            let node_index = self.addr_order[index];
            let node = &self.nodes[node_index];
            if Self::matches_query(node.tag, kind) {
                let displacement = u64::from(rva - node.rva.unwrap_or(0));
                return Some((SymbolHandle(node_index as u32), displacement));
            }
        }

        None
    }

    fn find_lines_by_rva(&self, rva: u32, length: u32) -> Vec<DiaLineRecord> {
        let end = u64::from(rva) + u64::from(length);
        let start = self.lines.partition_point(|line| line.rva < rva);

        self.lines[start..]
            .iter()
            .take_while(|line| u64::from(line.rva) < end)
            .cloned()
            .collect()
    }
}

/// The built-in [`SymbolProvider`] reading PDBs with the `pdb` crate.
///
/// [`SymbolProvider`]: ../trait.SymbolProvider.html
#[derive(Default)]
pub struct NativeProvider {
    loaded: Option<LoadedPdb>,
}

impl NativeProvider {
    /// Creates an unloaded provider instance.
    pub fn new() -> Self {
        NativeProvider { loaded: None }
    }

    fn materialize(data: &[u8], validation: Option<&PdbValidation>) -> Result<LoadedPdb, DiaError> {
        if data.starts_with(MAGIC_SMALL) {
            return Err(DiaErrorKind::ObsoleteFormat.into());
        }

        let mut pdb: Pdb<'_> = pdb::PDB::open(Cursor::new(data)).map_err(open_failed)?;

        let pdb_info = pdb.pdb_information().map_err(open_failed)?;
        let debug_info = pdb.debug_information().map_err(open_failed)?;

        if let Some(validation) = validation {
            // Prefer the age from the debug information stream; the info
            // header is bumped independently when the PDB is processed and
            // goes out of sync with the image.
            let age = debug_info.age().unwrap_or(pdb_info.age);
            let guid = Uuid::from_bytes(*pdb_info.guid.as_bytes());

            let matches = if validation.guid != Uuid::nil() {
                guid == validation.guid && age == validation.age
            } else {
                pdb_info.signature == validation.signature && age == validation.age
            };

            if !matches {
                log::warn!(
                    "[dia] pdb does not match the image: {} age {} != {} age {}",
                    guid,
                    age,
                    validation.guid,
                    validation.age
                );
                return Err(DiaErrorKind::Mismatch.into());
            }
        }

        let address_map = pdb.address_map().map_err(open_failed)?;

        // The string table stream is missing from some PDBs; that only
        // leaves line records without file names.
        let string_table = match pdb.string_table() {
            Ok(string_table) => Some(string_table),
            Err(pdb::Error::StreamNameNotFound) => None,
            Err(e) => return Err(open_failed(e)),
        };

        let pointer_size = match debug_info.machine_type() {
            Ok(MachineType::Amd64) | Ok(MachineType::Arm64) | Ok(MachineType::Ia64) => 8,
            _ => 4,
        };

        let type_information = pdb.type_information().map_err(open_failed)?;
        let mut types = TypeMap {
            iter: type_information.iter(),
            finder: type_information.finder(),
        };

        let mut builder = TreeBuilder::new(&address_map, pointer_size);
        let mut lines = Vec::new();

        let modules = debug_info
            .modules()
            .map_err(open_failed)?
            .collect::<Vec<_>>()
            .map_err(open_failed)?;

        for module in &modules {
            let module_info = match pdb.module_info(module).map_err(open_failed)? {
                Some(module_info) => module_info,
                None => continue,
            };

            let compiland = builder.add(Node::scope(
                SymbolTag::Compiland,
                Some(module.module_name().into_owned()),
            ));
            builder.nodes[0].children.push(compiland);

            Self::walk_module_symbols(&mut builder, &mut types, compiland, &module_info)?;
            Self::collect_module_lines(&mut lines, &address_map, &string_table, &module_info)?;
        }

        // Publics and global data live in the globals stream.
        let global_symbols = pdb.global_symbols().map_err(open_failed)?;
        let mut globals = global_symbols.iter();
        while let Some(symbol) = globals.next().map_err(open_failed)? {
            match symbol.parse() {
                Ok(SymbolData::Public(public)) => {
                    let node = builder.add_addressed(
                        SymbolTag::PublicSymbol,
                        &public.name,
                        public.offset,
                        None,
                        None,
                    );
                    builder.nodes[0].children.push(node);
                }
                Ok(SymbolData::Data(data)) => {
                    let identity = TreeBuilder::data_identity(data.offset, &data.name);
                    let node = match builder.data_by_identity.get(&identity) {
                        Some(&node) => node,
                        None => {
                            let type_node = builder.type_node(&mut types, data.type_index);
                            builder.add_addressed(
                                SymbolTag::Data,
                                &data.name,
                                data.offset,
                                None,
                                Some(type_node),
                            )
                        }
                    };
                    builder.nodes[0].children.push(node);
                }
                _ => {}
            }
        }

        // Functions are reachable through their compiland and globally.
        let functions = std::mem::take(&mut builder.functions);
        builder.nodes[0].children.extend(functions);

        lines.sort_by_key(|line: &DiaLineRecord| line.rva);

        Ok(LoadedPdb {
            nodes: builder.nodes,
            lines,
        })
    }

    fn walk_module_symbols(
        builder: &mut TreeBuilder<'_, '_>,
        types: &mut TypeMap<'_>,
        compiland: usize,
        module_info: &pdb::ModuleInfo<'_>,
    ) -> Result<(), DiaError> {
        let mut symbols = module_info.symbols().map_err(open_failed)?;

        let mut depth = 0isize;
        let mut inc_next = false;
        let mut proc_stack: Vec<(isize, usize)> = Vec::new();

        while let Some(symbol) = symbols.next().map_err(open_failed)? {
            if inc_next {
                depth += 1;
            }

            inc_next = symbol.starts_scope();
            if symbol.ends_scope() {
                depth -= 1;

                while proc_stack.last().map_or(false, |&(d, _)| d >= depth) {
                    proc_stack.pop();
                }
            }

            let parent = proc_stack
                .last()
                .map(|&(_, function)| function)
                .unwrap_or(compiland);

            match symbol.parse() {
                Ok(SymbolData::Procedure(proc)) => {
                    let node = builder.add_addressed(
                        SymbolTag::Function,
                        &proc.name,
                        proc.offset,
                        Some(u64::from(proc.len)),
                        None,
                    );
                    builder.nodes[compiland].children.push(node);
                    builder.functions.push(node);
                    proc_stack.push((depth, node));
                }
                Ok(SymbolData::Data(data)) => {
                    let type_node = builder.type_node(types, data.type_index);
                    let node = builder.add_addressed(
                        SymbolTag::Data,
                        &data.name,
                        data.offset,
                        None,
                        Some(type_node),
                    );
                    builder.nodes[parent].children.push(node);

                    let identity = TreeBuilder::data_identity(data.offset, &data.name);
                    builder.data_by_identity.entry(identity).or_insert(node);
                }
                Ok(SymbolData::Label(label)) => {
                    let node = builder.add_addressed(
                        SymbolTag::Label,
                        &label.name,
                        label.offset,
                        None,
                        None,
                    );
                    builder.nodes[parent].children.push(node);
                }
                Ok(SymbolData::Block(block)) => {
                    let node = builder.add_addressed(
                        SymbolTag::Block,
                        &block.name,
                        block.offset,
                        Some(u64::from(block.len)),
                        None,
                    );
                    builder.nodes[parent].children.push(node);
                }
                // The pdb crate does not implement every symbol kind; skip
                // anything it cannot parse instead of failing the module.
                _ => {}
            }
        }

        Ok(())
    }

    fn collect_module_lines(
        lines: &mut Vec<DiaLineRecord>,
        address_map: &pdb::AddressMap<'_>,
        string_table: &Option<pdb::StringTable<'_>>,
        module_info: &pdb::ModuleInfo<'_>,
    ) -> Result<(), DiaError> {
        let program = match module_info.line_program() {
            Ok(program) => program,
            Err(_) => return Ok(()),
        };

        let mut line_iter = program.lines();
        while let Some(line) = line_iter.next().map_err(open_failed)? {
            let rva = match line.offset.to_rva(address_map) {
                Some(rva) => rva.0,
                None => continue,
            };

            let file_info = match program.get_file_info(line.file_index) {
                Ok(file_info) => file_info,
                Err(_) => continue,
            };

            let file_name = match string_table {
                Some(string_table) => match file_info.name.to_string_lossy(string_table) {
                    Ok(name) => name.into_owned(),
                    Err(_) => continue,
                },
                None => String::new(),
            };

            lines.push(DiaLineRecord {
                rva,
                line_number: line.line_start,
                segment: u32::from(line.offset.section),
                offset: line.offset.offset,
                file_name,
            });
        }

        Ok(())
    }

    fn codeview_validation(pe: &goblin::pe::PE<'_>) -> Option<(PdbValidation, PathBuf)> {
        let debug_data = pe.debug_data.as_ref()?;
        let codeview = debug_data.codeview_pdb70_debug_info.as_ref()?;
        let directory = &debug_data.image_debug_directory;

        let debug_id = DebugId::from_guid_age(&codeview.signature, codeview.age).ok()?;

        let validation = PdbValidation {
            guid: debug_id.uuid(),
            signature: directory.time_date_stamp,
            age: codeview.age,
        };

        // The record stores the full build-time path; only the file name is
        // meaningful on this machine.
        let filename = &codeview.filename[..codeview.filename.len().saturating_sub(1)];
        let filename = String::from_utf8_lossy(filename);
        let filename = filename
            .rsplit(['\\', '/'])
            .next()
            .unwrap_or(&filename)
            .to_string();

        Some((validation, PathBuf::from(filename)))
    }
}

impl SymbolProvider for NativeProvider {
    fn load_pdb(
        &mut self,
        path: &Path,
        validation: Option<&PdbValidation>,
    ) -> Result<(), DiaError> {
        let view = ByteView::open(path).map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                DiaError::new(DiaErrorKind::FileNotFound, e)
            } else {
                open_failed(e)
            }
        })?;

        self.loaded = Some(Self::materialize(&view, validation)?);
        Ok(())
    }

    fn load_exe(&mut self, path: &Path, callback: &mut dyn LoadCallback) -> Result<(), DiaError> {
        let view = ByteView::open(path).map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                DiaError::new(DiaErrorKind::FileNotFound, e)
            } else {
                open_failed(e)
            }
        })?;

        let pe = goblin::pe::PE::parse(&view).map_err(open_failed)?;

        let codeview = Self::codeview_validation(&pe);
        if let Some(debug_data) = pe.debug_data.as_ref() {
            let directory = &debug_data.image_debug_directory;
            callback.on_debug_dir(
                true,
                &DebugDirectoryInfo {
                    data_type: directory.data_type,
                    time_date_stamp: directory.time_date_stamp,
                    size_of_data: directory.size_of_data,
                },
            );
        }

        let directory = path.parent().unwrap_or_else(|| Path::new("."));

        // A legacy .dbg companion is probed for completeness but cannot be
        // loaded by this provider.
        let dbg_path = path.with_extension("dbg");
        if dbg_path.exists() {
            callback.on_open_dbg(&dbg_path, false);
        }

        let mut candidates = Vec::new();
        let validation = match codeview {
            Some((validation, pdb_name)) => {
                candidates.push(directory.join(pdb_name));
                Some(validation)
            }
            None => None,
        };

        let referenced = path.with_extension("pdb");
        if !candidates.contains(&referenced) {
            candidates.push(referenced);
        }

        for candidate in &candidates {
            if !candidate.exists() {
                callback.on_open_pdb(candidate, false);
                continue;
            }

            match self.load_pdb(candidate, validation.as_ref()) {
                Ok(()) => {
                    callback.on_open_pdb(candidate, true);
                    return Ok(());
                }
                Err(error) => {
                    callback.on_open_pdb(candidate, false);
                    // A present-but-wrong PDB is a hard failure; anything
                    // else keeps the search going.
                    if matches!(
                        error.kind(),
                        DiaErrorKind::Mismatch | DiaErrorKind::ObsoleteFormat
                    ) {
                        return Err(error);
                    }
                }
            }
        }

        Err(DiaErrorKind::FileNotFound.into())
    }

    fn open_session(&mut self, load_address: u64) -> Result<Arc<dyn ProviderSession>, DiaError> {
        let loaded = self.loaded.take().ok_or(DiaErrorKind::OpenFailed)?;

        let mut addr_order: Vec<usize> = loaded
            .nodes
            .iter()
            .enumerate()
            .filter(|(_, node)| {
                node.rva.is_some() && NativeSession::matches_query(node.tag, SymbolQueryKind::Any)
            })
            .map(|(index, _)| index)
            .collect();
        addr_order.sort_by_key(|&index| loaded.nodes[index].rva);

        Ok(Arc::new(NativeSession {
            load_address,
            nodes: loaded.nodes,
            addr_order,
            lines: loaded.lines,
        }))
    }
}

#[cfg(test)]
mod tests {
    use std::io::Write;

    use similar_asserts::assert_eq;

    use super::*;
    use crate::dia::LogLoadCallback;

    #[test]
    fn test_load_pdb_not_found() {
        let mut provider = NativeProvider::new();
        let error = provider
            .load_pdb(Path::new("/nonexistent/app.pdb"), None)
            .unwrap_err();
        assert_eq!(error.kind(), DiaErrorKind::FileNotFound);
    }

    #[test]
    fn test_load_pdb_obsolete_format() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(b"Microsoft C/C++ program database 2.00\r\n\x1aJG\0\0")
            .unwrap();

        let mut provider = NativeProvider::new();
        let error = provider.load_pdb(file.path(), None).unwrap_err();
        assert_eq!(error.kind(), DiaErrorKind::ObsoleteFormat);
    }

    #[test]
    fn test_load_pdb_garbage() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(b"certainly not a program database").unwrap();

        let mut provider = NativeProvider::new();
        let error = provider.load_pdb(file.path(), None).unwrap_err();
        assert_eq!(error.kind(), DiaErrorKind::OpenFailed);
    }

    #[test]
    fn test_load_exe_without_companion() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(b"MZ").unwrap();

        let mut provider = NativeProvider::new();
        // A bare DOS stub is not a parseable PE.
        let error = provider
            .load_exe(file.path(), &mut LogLoadCallback)
            .unwrap_err();
        assert_eq!(error.kind(), DiaErrorKind::OpenFailed);
    }

    #[test]
    fn test_open_session_requires_load() {
        let mut provider = NativeProvider::new();
        let error = provider.open_session(0).unwrap_err();
        assert_eq!(error.kind(), DiaErrorKind::OpenFailed);
    }
}
