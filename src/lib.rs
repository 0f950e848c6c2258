//! Recompiles an IR module into machine code, data, and rodata staged in
//! local buffers but linked as if resident at caller-chosen target virtual
//! addresses, ready for byte-for-byte injection into a separate program by
//! an external patching tool.

pub mod backend;
pub mod build;
pub mod error;
pub mod ir;
pub mod passes;
