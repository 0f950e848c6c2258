use std::collections::BTreeMap;

use bitflags::bitflags;
use tracing::{debug, info};

use super::layout::{AddressPlanner, LocalOffset, Region, TargetAddress};
use crate::error::{BuildError, Result};

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct SectionAttributes: u8 {
        const EXECUTABLE = 1 << 0;
        const WRITABLE = 1 << 1;
    }
}

/// Where one section's bytes live in both address spaces. Created once per
/// section request and immutable afterwards.
#[derive(Debug, Clone)]
pub struct SectionAllocation {
    pub name: String,
    pub region: Region,
    /// Index of the staging-buffer set the section was carved from.
    pub object: usize,
    pub local: LocalOffset,
    pub target: TargetAddress,
    pub size: usize,
    pub attributes: SectionAttributes,
}

/// One reservation's worth of staging buffers, one per region, sized
/// exactly to the bytes declared for the object being materialized.
#[derive(Debug)]
pub struct StagingBuffers {
    code: StagingBuffer,
    data: StagingBuffer,
    rodata: StagingBuffer,
}

#[derive(Debug)]
struct StagingBuffer {
    bytes: Vec<u8>,
    free: usize,
}

impl StagingBuffers {
    fn reserve(code: usize, rodata: usize, data: usize) -> Result<Self> {
        Ok(StagingBuffers {
            code: StagingBuffer::reserve(Region::Code, code)?,
            data: StagingBuffer::reserve(Region::MutableData, data)?,
            rodata: StagingBuffer::reserve(Region::ReadOnlyData, rodata)?,
        })
    }

    pub fn region(&self, region: Region) -> &[u8] {
        match region {
            Region::Code => &self.code.bytes,
            Region::MutableData => &self.data.bytes,
            Region::ReadOnlyData => &self.rodata.bytes,
        }
    }

    fn buffer_mut(&mut self, region: Region) -> &mut StagingBuffer {
        match region {
            Region::Code => &mut self.code,
            Region::MutableData => &mut self.data,
            Region::ReadOnlyData => &mut self.rodata,
        }
    }
}

impl StagingBuffer {
    fn reserve(region: Region, size: usize) -> Result<Self> {
        let mut bytes = Vec::new();
        bytes
            .try_reserve_exact(size)
            .map_err(|_| BuildError::StagingExhausted { region, size })?;
        bytes.resize(size, 0);
        Ok(StagingBuffer { bytes, free: 0 })
    }
}

/// The dual-address section allocator. Every section request carves local
/// staging storage out of the current buffer set and, in lock-step, a
/// target range out of the shared planner, recording both sides in the
/// section table. The table doubles as the local-to-target translation
/// table the relocation engine consults.
#[derive(Debug)]
pub struct SectionAllocator {
    planner: AddressPlanner,
    objects: Vec<StagingBuffers>,
    sections: BTreeMap<String, SectionAllocation>,
}

impl SectionAllocator {
    pub fn new(planner: AddressPlanner) -> Self {
        SectionAllocator {
            planner,
            objects: vec![],
            sections: BTreeMap::new(),
        }
    }

    /// Declares the total bytes the next object needs per region and
    /// creates its staging buffers. Must precede that object's section
    /// allocations; target addresses keep rising across reservations.
    pub fn reserve(&mut self, code: usize, rodata: usize, data: usize) -> Result<usize> {
        let index = self.objects.len();
        info!(object = index, code, rodata, data, "reserving staging buffers");
        self.objects.push(StagingBuffers::reserve(code, rodata, data)?);
        Ok(index)
    }

    pub fn allocate_code(&mut self, size: usize, name: &str) -> Result<LocalOffset> {
        self.allocate(size, name, Region::Code, SectionAttributes::EXECUTABLE)
    }

    pub fn allocate_data(&mut self, size: usize, name: &str, read_only: bool) -> Result<LocalOffset> {
        let (region, attributes) = if read_only {
            (Region::ReadOnlyData, SectionAttributes::empty())
        } else {
            (Region::MutableData, SectionAttributes::WRITABLE)
        };
        self.allocate(size, name, region, attributes)
    }

    fn allocate(
        &mut self,
        size: usize,
        name: &str,
        region: Region,
        attributes: SectionAttributes,
    ) -> Result<LocalOffset> {
        if self.sections.contains_key(name) {
            return Err(BuildError::DuplicateSection(name.to_string()));
        }

        let object = self.objects.len().checked_sub(1).ok_or_else(|| {
            BuildError::ReservationExceeded {
                name: name.to_string(),
                region,
                size,
            }
        })?;
        let buffer = self.objects[object].buffer_mut(region);
        if buffer.free + size > buffer.bytes.len() {
            return Err(BuildError::ReservationExceeded {
                name: name.to_string(),
                region,
                size,
            });
        }
        let local = LocalOffset(buffer.free);
        buffer.free += size;

        let target = self.planner.request_addr(region, size)?;
        debug!(section = name, %region, %local, %target, size, "allocated section");

        self.sections.insert(
            name.to_string(),
            SectionAllocation {
                name: name.to_string(),
                region,
                object,
                local,
                target,
                size,
                attributes,
            },
        );
        Ok(local)
    }

    pub fn section(&self, name: &str) -> Option<&SectionAllocation> {
        self.sections.get(name)
    }

    pub fn sections(&self) -> impl Iterator<Item = &SectionAllocation> {
        self.sections.values()
    }

    /// The staging bytes backing one section. This is where the backend
    /// writes generated bytes and where relocations get patched.
    pub fn section_bytes_mut(&mut self, name: &str) -> Result<&mut [u8]> {
        let alloc = self
            .sections
            .get(name)
            .ok_or_else(|| BuildError::UnresolvedSymbol(name.to_string()))?;
        let start = alloc.local.get();
        let buffer = self.objects[alloc.object].buffer_mut(alloc.region);
        Ok(&mut buffer.bytes[start..start + alloc.size])
    }

    pub fn objects(&self) -> &[StagingBuffers] {
        &self.objects
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn allocator() -> SectionAllocator {
        SectionAllocator::new(AddressPlanner::new(0xa000, 0xb000, 0xc000))
    }

    #[test]
    fn test_code_sections_get_lockstep_addresses() {
        let mut allocator = allocator();
        allocator.reserve(0x100, 0, 0).unwrap();

        let local = allocator.allocate_code(0x10, "f").unwrap();
        assert_eq!(local, LocalOffset(0));
        let f = allocator.section("f").unwrap();
        assert_eq!(f.target, TargetAddress(0xa000));
        assert!(f.attributes.contains(SectionAttributes::EXECUTABLE));

        let local = allocator.allocate_code(0x20, "g").unwrap();
        assert_eq!(local, LocalOffset(0x10));
        assert_eq!(allocator.section("g").unwrap().target, TargetAddress(0xa010));
    }

    #[test]
    fn test_data_split_by_read_only() {
        let mut allocator = allocator();
        allocator.reserve(0, 8, 8).unwrap();

        allocator.allocate_data(8, "msg", true).unwrap();
        let msg = allocator.section("msg").unwrap();
        assert_eq!(msg.region, Region::ReadOnlyData);
        assert_eq!(msg.target, TargetAddress(0xb000));
        assert!(msg.attributes.is_empty());

        allocator.allocate_data(8, "ctr", false).unwrap();
        let ctr = allocator.section("ctr").unwrap();
        assert_eq!(ctr.region, Region::MutableData);
        assert_eq!(ctr.target, TargetAddress(0xc000));
        assert!(ctr.attributes.contains(SectionAttributes::WRITABLE));
    }

    #[test]
    fn test_duplicate_section_name_rejected() {
        let mut allocator = allocator();
        allocator.reserve(0x100, 0, 0).unwrap();
        allocator.allocate_code(0x10, "f").unwrap();
        assert!(matches!(
            allocator.allocate_code(0x10, "f"),
            Err(BuildError::DuplicateSection(_))
        ));
    }

    #[test]
    fn test_allocation_bounded_by_reservation() {
        let mut allocator = allocator();
        allocator.reserve(0x10, 0, 0).unwrap();
        allocator.allocate_code(0x10, "f").unwrap();
        assert!(matches!(
            allocator.allocate_code(1, "g"),
            Err(BuildError::ReservationExceeded { .. })
        ));
    }

    #[test]
    fn test_allocation_without_reservation_rejected() {
        let mut allocator = allocator();
        assert!(allocator.allocate_code(1, "f").is_err());
    }

    #[test]
    fn test_addresses_keep_rising_across_reservations() {
        let mut allocator = allocator();
        allocator.reserve(0x10, 0, 0).unwrap();
        allocator.allocate_code(0x10, "f").unwrap();

        allocator.reserve(0x10, 0, 0).unwrap();
        let local = allocator.allocate_code(0x10, "g").unwrap();
        // Fresh buffer, so the local offset restarts; the target does not.
        assert_eq!(local, LocalOffset(0));
        assert_eq!(allocator.section("g").unwrap().target, TargetAddress(0xa010));
    }

    #[test]
    fn test_section_bytes_are_writable_in_place() {
        let mut allocator = allocator();
        allocator.reserve(4, 0, 0).unwrap();
        allocator.allocate_code(4, "f").unwrap();
        allocator
            .section_bytes_mut("f")
            .unwrap()
            .copy_from_slice(&[1, 2, 3, 4]);
        assert_eq!(allocator.objects()[0].region(Region::Code), &[1, 2, 3, 4]);
    }
}
