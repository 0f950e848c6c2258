use std::fmt;

use tracing::debug;

use crate::error::{BuildError, Result};

/// One of the three logical address spaces of the target program.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Region {
    Code,
    MutableData,
    ReadOnlyData,
}

impl Region {
    /// Stem used for segment artifact file names.
    pub fn artifact_stem(&self) -> &'static str {
        match self {
            Region::Code => "code",
            Region::MutableData => "data",
            Region::ReadOnlyData => "rodata",
        }
    }
}

impl fmt::Display for Region {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.artifact_stem())
    }
}

/// A virtual address in the target program's address space. Never valid to
/// dereference in this process.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct TargetAddress(pub u64);

impl TargetAddress {
    pub fn get(self) -> u64 {
        self.0
    }
}

impl fmt::Display for TargetAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#x}", self.0)
    }
}

/// A byte offset into one region's staging buffer. Only meaningful next to
/// the buffer it indexes; kept distinct from [`TargetAddress`] so the two
/// address spaces cannot be mixed up.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct LocalOffset(pub usize);

impl LocalOffset {
    pub fn get(self) -> usize {
        self.0
    }
}

impl fmt::Display for LocalOffset {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "+{:#x}", self.0)
    }
}

#[derive(Debug, Clone, Copy)]
struct RegionCursor {
    next: u64,
    ceiling: Option<u64>,
}

/// Bump allocator for target virtual addresses, one monotonic free pointer
/// per region. Addresses never overlap, never decrease, and are never
/// handed back. Alignment is the caller's business.
#[derive(Debug)]
pub struct AddressPlanner {
    code: RegionCursor,
    data: RegionCursor,
    rodata: RegionCursor,
}

impl AddressPlanner {
    pub fn new(code_base: u64, rodata_base: u64, data_base: u64) -> Self {
        let cursor = |base| RegionCursor {
            next: base,
            ceiling: None,
        };
        AddressPlanner {
            code: cursor(code_base),
            data: cursor(data_base),
            rodata: cursor(rodata_base),
        }
    }

    /// Addresses at or past `ceiling` are never issued for `region`.
    pub fn set_ceiling(&mut self, region: Region, ceiling: u64) {
        self.cursor_mut(region).ceiling = Some(ceiling);
    }

    /// Issues the next `size` bytes of `region` and advances the free
    /// pointer past them.
    pub fn request_addr(&mut self, region: Region, size: usize) -> Result<TargetAddress> {
        let cursor = self.cursor_mut(region);
        let base = cursor.next;
        let end = base
            .checked_add(size as u64)
            .ok_or(BuildError::AddressOverflow {
                region,
                requested: size,
            })?;
        if let Some(ceiling) = cursor.ceiling {
            if end > ceiling {
                return Err(BuildError::RegionExhausted {
                    region,
                    requested: size,
                    ceiling,
                });
            }
        }
        cursor.next = end;
        debug!(%region, size, address = %TargetAddress(base), "planned target range");
        Ok(TargetAddress(base))
    }

    fn cursor_mut(&mut self, region: Region) -> &mut RegionCursor {
        match region {
            Region::Code => &mut self.code,
            Region::MutableData => &mut self.data,
            Region::ReadOnlyData => &mut self.rodata,
        }
    }
}
