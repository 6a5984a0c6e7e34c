//! Fault and warning types surfaced by the shader interpreter and the
//! module linker.
//!
//! Every fallible operation in this crate returns a `Result` keyed to one
//! of the enums below; nothing here is retried by the caller, and nothing
//! unwinds via `panic!` in non-test code.

use thiserror::Error;

/// Faults raised while executing a shader program.
#[derive(Debug, Error, Eq, PartialEq, Clone, Copy)]
pub enum ShaderFault {
    /// One of the loop/if/call control-flow stacks exceeded its bound.
    #[error("shader control-flow stack overflow")]
    StackOverflow,

    /// The decoded opcode has no entry in the dispatch table.
    #[error("unknown shader opcode {0:#04x}")]
    UnknownOpcode(u8),

    /// A float-uniform commit targeted an index outside `0..96`.
    #[error("float uniform index {0} is out of range")]
    BadUniformIndex(u8),
}

/// Faults raised while loading, rebasing, linking, or registering a CRO.
#[derive(Debug, Error, Eq, PartialEq, Clone, Copy)]
pub enum LinkerFault {
    /// The header's `magic` field was not `"CRO0"`.
    #[error("bad CRO magic")]
    BadMagic,

    /// `next`/`prev` were already nonzero at load time.
    #[error("module is already loaded")]
    AlreadyLoaded,

    /// A request address or size argument was not page-aligned, or the
    /// image was smaller than the fixed header.
    #[error("unaligned or undersized linker request")]
    UnalignedRequest,

    /// A CRO operation was requested before `Initialize` registered a CRS.
    #[error("no CRS has been loaded")]
    CrsNotLoaded,

    /// A segment table entry named a segment id outside `{TEXT,RODATA,DATA,BSS}`.
    #[error("unknown segment id {0}")]
    UnknownSegmentId(u32),

    /// A relocation-patch record named a patch type this linker can't apply.
    #[error("unknown relocation patch type {0}")]
    UnknownPatchType(u8),

    /// The module import table was non-empty.
    #[error("module-import linkage is not implemented")]
    ModuleImportUnimplemented,

    /// A static anonymous symbol relocation was encountered.
    #[error("static anonymous symbol relocation is not implemented")]
    StaticAnonymousUnimplemented,

    /// A named import had no matching export in any live module.
    #[error("named import {0:?} could not be resolved")]
    SymbolUnresolved(SymbolName),

    /// An IPC request named a command id outside `{Initialize, LoadCRR, LoadCRONew}`.
    #[error("unknown LDR-RO command {0:#010x}")]
    UnknownCommand(u32),
}

/// Non-fatal conditions logged during a link; execution continues.
#[derive(Debug, Error, Eq, PartialEq, Clone, Copy)]
pub enum LinkerWarning {
    /// No live module exported `__aeabi_atexit`'s callback symbol.
    #[error("exit symbol nnroAeabiAtexit_ could not be resolved")]
    ExitSymbolUnresolved,

    /// `LoadCRONew`'s `fix_level` argument was nonzero.
    #[error("fix_level {0} is ignored by this linker")]
    FixLevelIgnored(u32),
}

/// A bounded stack-allocated copy of an import/export name, for embedding
/// in fault values without heap allocation or lifetime plumbing.
#[derive(Debug, Eq, PartialEq, Clone, Copy)]
pub struct SymbolName {
    buf: [u8; 32],
    len: usize,
}

impl SymbolName {
    pub fn new(name: &str) -> Self {
        let bytes = name.as_bytes();
        let len = bytes.len().min(32);
        let mut buf = [0u8; 32];
        buf[..len].copy_from_slice(&bytes[..len]);
        SymbolName { buf, len }
    }

    pub fn as_str(&self) -> &str {
        std::str::from_utf8(&self.buf[..self.len]).unwrap_or("<invalid utf8>")
    }
}

impl std::fmt::Display for SymbolName {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}
