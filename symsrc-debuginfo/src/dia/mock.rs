//! An in-memory symbol provider for tests.
//!
//! The mock builds a small lexical tree by hand and serves it through the
//! [`ProviderSession`] interface, so enumerator and front-end behavior can
//! be exercised without PDB fixtures. Only compiled for tests and with the
//! `test-support` feature.
//!
//! [`ProviderSession`]: ../trait.ProviderSession.html

use std::path::Path;
use std::sync::Arc;

use super::{
    DiaError, DiaErrorKind, DiaLineRecord, LoadCallback, LocationKind, PdbValidation,
    ProviderSession, SymbolHandle, SymbolProvider, SymbolQueryKind, SymbolTag,
};

/// A hand-built symbol for a [`MockSession`].
///
/// [`MockSession`]: struct.MockSession.html
#[derive(Clone, Debug)]
pub struct MockSymbol {
    /// The symbol's tag.
    pub tag: SymbolTag,
    /// The raw name; `None` makes `symbol_name` fail.
    pub name: Option<String>,
    /// The RVA; `None` makes both `symbol_rva` and the derived virtual
    /// address fail.
    pub rva: Option<u32>,
    /// The section index.
    pub segment: Option<u32>,
    /// The section-relative offset.
    pub offset: u32,
    /// The declared length.
    pub length: Option<u64>,
    /// The storage location class.
    pub location: Option<LocationKind>,
    /// The tag of the symbol's type, if it has one.
    pub type_tag: Option<SymbolTag>,
    /// The length of the symbol's type.
    pub type_length: Option<u64>,
}

impl MockSymbol {
    fn new(tag: SymbolTag, name: &str, rva: u32) -> Self {
        MockSymbol {
            tag,
            name: Some(name.into()),
            rva: Some(rva),
            segment: Some(1),
            offset: rva,
            length: None,
            location: Some(LocationKind::Static),
            type_tag: None,
            type_length: None,
        }
    }

    /// A public symbol.
    pub fn public(name: &str, rva: u32) -> Self {
        MockSymbol::new(SymbolTag::PublicSymbol, name, rva)
    }

    /// A function with a declared length.
    pub fn function(name: &str, rva: u32, length: u64) -> Self {
        let mut symbol = MockSymbol::new(SymbolTag::Function, name, rva);
        symbol.length = Some(length);
        symbol
    }

    /// A data symbol with a declared length.
    pub fn data(name: &str, rva: u32, length: u64) -> Self {
        let mut symbol = MockSymbol::new(SymbolTag::Data, name, rva);
        symbol.length = Some(length);
        symbol
    }

    /// A code label.
    pub fn label(name: &str, rva: u32) -> Self {
        MockSymbol::new(SymbolTag::Label, name, rva)
    }
}

struct MockNode {
    symbol: MockSymbol,
    children: Vec<usize>,
    type_node: Option<usize>,
}

/// An in-memory [`ProviderSession`].
///
/// Node 0 is the global scope; handles are plain node indices and symbol
/// ids equal handles, which keeps deduplication behavior easy to steer from
/// tests.
///
/// [`ProviderSession`]: ../trait.ProviderSession.html
pub struct MockSession {
    load_address: u64,
    nodes: Vec<MockNode>,
    lines: Vec<DiaLineRecord>,
}

impl MockSession {
    /// Creates an empty session relocating to `load_address`.
    pub fn new(load_address: u64) -> Self {
        let global = MockNode {
            symbol: MockSymbol {
                tag: SymbolTag::Exe,
                name: None,
                rva: None,
                segment: None,
                offset: 0,
                length: None,
                location: None,
                type_tag: None,
                type_length: None,
            },
            children: Vec::new(),
            type_node: None,
        };

        MockSession {
            load_address,
            nodes: vec![global],
            lines: Vec::new(),
        }
    }

    /// Overrides the load address (used when a provider opens the session).
    pub fn set_load_address(&mut self, load_address: u64) {
        self.load_address = load_address;
    }

    fn push(&mut self, symbol: MockSymbol) -> usize {
        let type_node = symbol.type_tag.map(|tag| {
            let length = symbol.type_length;
            self.nodes.push(MockNode {
                symbol: MockSymbol {
                    tag,
                    name: None,
                    rva: None,
                    segment: None,
                    offset: 0,
                    length,
                    location: None,
                    type_tag: None,
                    type_length: None,
                },
                children: Vec::new(),
                type_node: None,
            });
            self.nodes.len() - 1
        });

        self.nodes.push(MockNode {
            symbol,
            children: Vec::new(),
            type_node,
        });
        self.nodes.len() - 1
    }

    /// Adds a compiland under the global scope.
    pub fn add_compiland(&mut self, name: &str) -> SymbolHandle {
        let index = self.push(MockSymbol {
            tag: SymbolTag::Compiland,
            name: Some(name.into()),
            rva: None,
            segment: None,
            offset: 0,
            length: None,
            location: None,
            type_tag: None,
            type_length: None,
        });
        self.nodes[0].children.push(index);
        SymbolHandle(index as u32)
    }

    /// Adds a public symbol under the global scope.
    pub fn add_public(&mut self, symbol: MockSymbol) -> SymbolHandle {
        let index = self.push(symbol);
        self.nodes[0].children.push(index);
        SymbolHandle(index as u32)
    }

    /// Adds a function under a compiland.
    ///
    /// Like the real provider, the function is also reachable through the
    /// global scope, with the same id.
    pub fn add_function(&mut self, compiland: SymbolHandle, symbol: MockSymbol) -> SymbolHandle {
        let index = self.push(symbol);
        self.nodes[compiland.0 as usize].children.push(index);
        self.nodes[0].children.push(index);
        SymbolHandle(index as u32)
    }

    /// Adds a child symbol (data, block, label) to a function.
    pub fn add_function_child(
        &mut self,
        function: SymbolHandle,
        symbol: MockSymbol,
    ) -> SymbolHandle {
        let index = self.push(symbol);
        self.nodes[function.0 as usize].children.push(index);
        SymbolHandle(index as u32)
    }

    /// Adds a child symbol directly to a compiland.
    pub fn add_compiland_child(
        &mut self,
        compiland: SymbolHandle,
        symbol: MockSymbol,
    ) -> SymbolHandle {
        let index = self.push(symbol);
        self.nodes[compiland.0 as usize].children.push(index);
        SymbolHandle(index as u32)
    }

    /// Also lists an existing symbol under the global scope, the way
    /// providers expose functions both per compiland and globally.
    pub fn promote_to_global(&mut self, symbol: SymbolHandle) {
        self.nodes[0].children.push(symbol.0 as usize);
    }

    /// Adds a source-line record.
    pub fn add_line(&mut self, file: &str, rva: u32, line_number: u32) {
        self.lines.push(DiaLineRecord {
            rva,
            line_number,
            segment: 1,
            offset: rva,
            file_name: file.into(),
        });
        self.lines.sort_by_key(|line| line.rva);
    }

    fn node(&self, handle: SymbolHandle) -> Option<&MockNode> {
        self.nodes.get(handle.0 as usize)
    }
}

impl ProviderSession for MockSession {
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
        self.node(symbol).map(|node| node.symbol.tag)
    }

    fn symbol_name(&self, symbol: SymbolHandle) -> Option<String> {
        self.node(symbol)?.symbol.name.clone()
    }

    fn symbol_segment(&self, symbol: SymbolHandle) -> Option<u32> {
        self.node(symbol)?.symbol.segment
    }

    fn symbol_offset(&self, symbol: SymbolHandle) -> Option<u32> {
        Some(self.node(symbol)?.symbol.offset)
    }

    fn symbol_rva(&self, symbol: SymbolHandle) -> Option<u32> {
        self.node(symbol)?.symbol.rva
    }

    fn symbol_virtual_address(&self, symbol: SymbolHandle) -> Option<u64> {
        let rva = self.node(symbol)?.symbol.rva?;
        Some(self.load_address + u64::from(rva))
    }

    fn symbol_length(&self, symbol: SymbolHandle) -> Option<u64> {
        self.node(symbol)?.symbol.length
    }

    fn symbol_location(&self, symbol: SymbolHandle) -> Option<LocationKind> {
        self.node(symbol)?.symbol.location
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
                .filter(|&&child| self.nodes[child].symbol.tag == tag)
                .map(|&child| SymbolHandle(child as u32))
                .collect(),
            None => Vec::new(),
        }
    }

    fn find_symbol_by_rva(&self, rva: u32, kind: SymbolQueryKind) -> Option<(SymbolHandle, u64)> {
        let matches_kind = |tag: SymbolTag| match kind {
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
        };

        let mut best: Option<(usize, u32)> = None;
        for (index, node) in self.nodes.iter().enumerate() {
            let symbol_rva = match node.symbol.rva {
                Some(symbol_rva) if symbol_rva <= rva => symbol_rva,
                _ => continue,
            };
            if !matches_kind(node.symbol.tag) {
                continue;
            }
            if best.map_or(true, |(_, best_rva)| symbol_rva > best_rva) {
                best = Some((index, symbol_rva));
            }
        }

        best.map(|(index, symbol_rva)| {
            (SymbolHandle(index as u32), u64::from(rva - symbol_rva))
        })
    }

    fn find_lines_by_rva(&self, rva: u32, length: u32) -> Vec<DiaLineRecord> {
        let end = u64::from(rva) + u64::from(length);
        self.lines
            .iter()
            .filter(|line| u64::from(line.rva) >= u64::from(rva) && u64::from(line.rva) < end)
            .cloned()
            .collect()
    }
}

/// A [`SymbolProvider`] serving a prebuilt [`MockSession`].
///
/// [`SymbolProvider`]: ../trait.SymbolProvider.html
/// [`MockSession`]: struct.MockSession.html
pub struct MockProvider {
    session: Option<MockSession>,
    error: Option<DiaErrorKind>,
}

impl MockProvider {
    /// A provider that loads successfully and serves `session`.
    pub fn with_session(session: MockSession) -> Self {
        MockProvider {
            session: Some(session),
            error: None,
        }
    }

    /// A provider whose load fails with the given error kind.
    pub fn failing(error: DiaErrorKind) -> Self {
        MockProvider {
            session: None,
            error: Some(error),
        }
    }
}

impl SymbolProvider for MockProvider {
    fn load_pdb(
        &mut self,
        _path: &Path,
        _validation: Option<&PdbValidation>,
    ) -> Result<(), DiaError> {
        match self.error {
            Some(kind) => Err(kind.into()),
            None => Ok(()),
        }
    }

    fn load_exe(&mut self, path: &Path, callback: &mut dyn LoadCallback) -> Result<(), DiaError> {
        callback.on_open_pdb(path, self.error.is_none());
        match self.error {
            Some(kind) => Err(kind.into()),
            None => Ok(()),
        }
    }

    fn open_session(&mut self, load_address: u64) -> Result<Arc<dyn ProviderSession>, DiaError> {
        let mut session = self.session.take().ok_or(DiaErrorKind::OpenFailed)?;
        if load_address != 0 {
            session.set_load_address(load_address);
        }
        Ok(Arc::new(session))
    }
}
