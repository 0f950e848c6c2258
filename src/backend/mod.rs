pub mod codegen;
pub mod mnemonics;

/// The only instruction set this backend targets.
pub const TARGET: &str = "x86_64";
