use tracing::debug;

use super::layout::TargetAddress;
use crate::error::{BuildError, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RelocKind {
    /// Absolute 64-bit target address, S + A, little endian.
    Abs64,
    /// RIP-relative 32-bit displacement, S + A - P. The x86 call/jump
    /// forms measure from the end of the instruction, which the addend
    /// accounts for.
    PcRel32,
}

/// One patch site the backend recorded while emitting a section. `offset`
/// is relative to the start of the section's bytes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Relocation {
    pub offset: usize,
    pub symbol: String,
    pub kind: RelocKind,
    pub addend: i64,
}

/// Patches one section's staging bytes in place. All arithmetic runs on
/// target addresses, so the bytes end up as if the section had been linked
/// at `section_target`; `resolve` maps a symbol name to its target address
/// through the session's translation table.
pub fn apply(
    bytes: &mut [u8],
    section_target: TargetAddress,
    relocations: &[Relocation],
    mut resolve: impl FnMut(&str) -> Result<TargetAddress>,
) -> Result<()> {
    for reloc in relocations {
        let symbol = resolve(&reloc.symbol)?.get();
        let site = section_target.get() + reloc.offset as u64;
        match reloc.kind {
            RelocKind::Abs64 => {
                let value = symbol.wrapping_add(reloc.addend as u64);
                bytes[reloc.offset..reloc.offset + 8].copy_from_slice(&value.to_le_bytes());
                debug!(symbol = %reloc.symbol, site = %TargetAddress(site), value = %TargetAddress(value), "abs64");
            }
            RelocKind::PcRel32 => {
                let value = (symbol as i128 + reloc.addend as i128) - site as i128;
                let value = i32::try_from(value).map_err(|_| BuildError::RelocationOutOfRange {
                    symbol: reloc.symbol.clone(),
                    site,
                })?;
                bytes[reloc.offset..reloc.offset + 4].copy_from_slice(&value.to_le_bytes());
                debug!(symbol = %reloc.symbol, site = %TargetAddress(site), value, "pcrel32");
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn resolve_to(addr: u64) -> impl FnMut(&str) -> Result<TargetAddress> {
        move |_| Ok(TargetAddress(addr))
    }

    #[test]
    fn test_abs64_writes_target_address() {
        let mut bytes = vec![0u8; 12];
        let relocations = vec![Relocation {
            offset: 2,
            symbol: "msg".to_string(),
            kind: RelocKind::Abs64,
            addend: 0,
        }];
        apply(&mut bytes, TargetAddress(0xa000), &relocations, resolve_to(0xb010)).unwrap();
        assert_eq!(&bytes[2..10], &0xb010_u64.to_le_bytes());
        assert_eq!(bytes[0], 0);
        assert_eq!(bytes[10], 0);
    }

    #[test]
    fn test_pcrel32_measures_from_field_plus_addend() {
        // call at section start; rel32 field at offset 1, addend -4.
        let mut bytes = vec![0xE8, 0, 0, 0, 0];
        let relocations = vec![Relocation {
            offset: 1,
            symbol: "h".to_string(),
            kind: RelocKind::PcRel32,
            addend: -4,
        }];
        apply(&mut bytes, TargetAddress(0xa000), &relocations, resolve_to(0xa020)).unwrap();
        // S + A - P = 0xa020 - 4 - 0xa001 = 0x1b
        assert_eq!(&bytes[1..5], &0x1b_i32.to_le_bytes());
    }

    #[test]
    fn test_pcrel32_backward_branch() {
        let mut bytes = vec![0xE8, 0, 0, 0, 0];
        let relocations = vec![Relocation {
            offset: 1,
            symbol: "h".to_string(),
            kind: RelocKind::PcRel32,
            addend: -4,
        }];
        apply(&mut bytes, TargetAddress(0xa100), &relocations, resolve_to(0xa000)).unwrap();
        let value = i32::from_le_bytes(bytes[1..5].try_into().unwrap());
        assert_eq!(value, 0xa000 - 4 - 0xa101);
    }

    #[test]
    fn test_pcrel32_out_of_range() {
        let mut bytes = vec![0xE8, 0, 0, 0, 0];
        let relocations = vec![Relocation {
            offset: 1,
            symbol: "far".to_string(),
            kind: RelocKind::PcRel32,
            addend: -4,
        }];
        let result = apply(
            &mut bytes,
            TargetAddress(0),
            &relocations,
            resolve_to(1 << 40),
        );
        assert!(matches!(
            result,
            Err(BuildError::RelocationOutOfRange { .. })
        ));
    }

    #[test]
    fn test_unresolved_symbol_propagates() {
        let mut bytes = vec![0u8; 8];
        let relocations = vec![Relocation {
            offset: 0,
            symbol: "nope".to_string(),
            kind: RelocKind::Abs64,
            addend: 0,
        }];
        let result = apply(&mut bytes, TargetAddress(0), &relocations, |name| {
            Err(BuildError::UnresolvedSymbol(name.to_string()))
        });
        assert!(matches!(result, Err(BuildError::UnresolvedSymbol(_))));
    }
}
