use std::collections::HashMap;

use tracing::debug;

use super::layout::TargetAddress;
use crate::error::{BuildError, Result};

/// Whether a pre-existing symbol survives a module definition of the same
/// name. `Strong` entries always win; `Weak` entries are shadowed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Strength {
    Strong,
    Weak,
}

/// Per-name lifecycle. Names absent from the table are unregistered.
/// `PreExisting` and `Compiled` are terminal; `Pending` marks a symbol
/// whose materialization is underway.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SymbolState {
    PreExisting {
        address: TargetAddress,
        strength: Strength,
    },
    Pending,
    Compiled(TargetAddress),
}

/// Merges the caller-supplied pre-existing namespace with the symbols this
/// build defines, and keeps the ordered log of function names the module
/// brought in (the export worklist).
#[derive(Debug, Default)]
pub struct SymbolResolver {
    states: HashMap<String, SymbolState>,
    new_functions: Vec<String>,
}

impl SymbolResolver {
    pub fn new() -> Self {
        Self::default()
    }

    /// Loads pre-existing symbols from tabular text: one `name,addr,size`
    /// row per line, both numbers hex. The size column is validated but
    /// ignored. A repeated name keeps the last row.
    pub fn load_table(&mut self, text: &str, strength: Strength) -> Result<usize> {
        let mut loaded = 0;
        for (i, line) in text.lines().enumerate() {
            let line_no = i + 1;
            if line.trim().is_empty() {
                continue;
            }
            let malformed = || BuildError::MalformedSymbolRow {
                line: line_no,
                row: line.to_string(),
            };

            let fields: Vec<&str> = line.split(',').map(str::trim).collect();
            let &[name, address, size] = fields.as_slice() else {
                return Err(malformed());
            };
            if name.is_empty() {
                return Err(malformed());
            }
            let address = parse_hex(address).ok_or_else(malformed)?;
            parse_hex(size).ok_or_else(malformed)?;

            self.add_pre_existing(name, TargetAddress(address), strength);
            loaded += 1;
        }
        Ok(loaded)
    }

    pub fn add_pre_existing(&mut self, name: &str, address: TargetAddress, strength: Strength) {
        debug!(name, %address, ?strength, "pre-existing symbol");
        self.states.insert(
            name.to_string(),
            SymbolState::PreExisting { address, strength },
        );
    }

    /// Records a function name observed while ingesting the module.
    pub fn log_function(&mut self, name: &str) {
        self.new_functions.push(name.to_string());
    }

    pub fn new_functions(&self) -> &[String] {
        &self.new_functions
    }

    pub fn state(&self, name: &str) -> Option<SymbolState> {
        self.states.get(name).copied()
    }

    pub fn mark_pending(&mut self, name: &str) {
        self.states
            .entry(name.to_string())
            .or_insert(SymbolState::Pending);
    }

    /// Records where a materialized definition landed. A strong
    /// pre-existing entry is never displaced; a weak one is. Re-defining a
    /// compiled symbol keeps the first address.
    pub fn define_compiled(&mut self, name: &str, address: TargetAddress) {
        match self.states.get(name) {
            Some(SymbolState::PreExisting {
                strength: Strength::Strong,
                ..
            })
            | Some(SymbolState::Compiled(_)) => (),
            _ => {
                debug!(name, %address, "compiled symbol");
                self.states
                    .insert(name.to_string(), SymbolState::Compiled(address));
            }
        }
    }

    /// The address of a terminal symbol, if it has one.
    pub fn address(&self, name: &str) -> Option<TargetAddress> {
        match self.states.get(name)? {
            SymbolState::PreExisting { address, .. } => Some(*address),
            SymbolState::Compiled(address) => Some(*address),
            SymbolState::Pending => None,
        }
    }
}

fn parse_hex(field: &str) -> Option<u64> {
    let digits = field.strip_prefix("0x").unwrap_or(field);
    u64::from_str_radix(digits, 16).ok()
}
