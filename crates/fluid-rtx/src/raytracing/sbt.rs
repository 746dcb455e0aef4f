//! Shader Binding Table (SBT) layout and storage.
//!
//! The table holds one entry per shader group, ordered ray generation, miss,
//! callable, hit. Each entry is the group handle followed by an optional user
//! record. Entries of a group share a stride aligned to the handle alignment,
//! and each group's span starts on the base alignment.
//!
//! Records are patched in a host-visible staging copy and transferred to the
//! device-local table by [`ShaderBindingTable::stage`].

use ash::vk;
use gpu_allocator::MemoryLocation;

use super::device::{align_up, BufferDesc, DeviceBuffer, RtDevice, RtProperties};
use super::error::{Result, RtError};

/// Shader group kinds, in table order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum GroupType {
    RayGen,
    Miss,
    Callable,
    Hit,
}

impl GroupType {
    pub const ALL: [GroupType; 4] = [GroupType::RayGen, GroupType::Miss, GroupType::Callable, GroupType::Hit];

    pub fn index(self) -> usize {
        self as usize
    }
}

/// Byte layout of the table, independent of any device memory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SbtLayout {
    pub handle_size: u64,
    pub base_alignment: u64,
    pub counts: [usize; 4],
    pub max_record_sizes: [usize; 4],
    pub strides: [u64; 4],
    pub spans: [u64; 4],
}

impl SbtLayout {
    pub fn new(props: &RtProperties, counts: [usize; 4], max_record_sizes: [usize; 4]) -> Self {
        let handle_size = props.shader_group_handle_size as u64;
        let handle_alignment = props.shader_group_handle_alignment as u64;
        let base_alignment = props.shader_group_base_alignment as u64;

        let mut strides = [0; 4];
        let mut spans = [0; 4];
        for i in 0..4 {
            strides[i] = align_up(handle_size + max_record_sizes[i] as u64, handle_alignment);
            spans[i] = align_up(counts[i] as u64 * strides[i], base_alignment);
        }

        Self {
            handle_size,
            base_alignment,
            counts,
            max_record_sizes,
            strides,
            spans,
        }
    }

    pub fn group_count(&self) -> usize {
        self.counts.iter().sum()
    }

    /// Offset of a group's span from the start of the table.
    pub fn group_offset(&self, group: GroupType) -> u64 {
        self.spans[..group.index()].iter().sum()
    }

    /// Table length without alignment padding.
    pub fn table_size(&self) -> u64 {
        self.spans.iter().sum()
    }

    /// Table length plus room to shift its start onto the base alignment.
    pub fn buffer_size(&self) -> u64 {
        self.table_size() + self.base_alignment.saturating_sub(1)
    }

    /// Offset of a record from the start of the table.
    pub fn record_offset(&self, group: GroupType, index: usize) -> u64 {
        let g = group.index();
        self.group_offset(group) + self.strides[g] * index as u64 + self.handle_size
    }

    /// Lay out `handles` (one per group, in table order) with zeroed records.
    pub fn table_data(&self, handles: &[u8]) -> Vec<u8> {
        let handle_size = self.handle_size as usize;
        let mut data = vec![0u8; self.table_size() as usize];
        let mut handle_index = 0;

        for group in GroupType::ALL {
            let g = group.index();
            let mut offset = self.group_offset(group) as usize;
            for _ in 0..self.counts[g] {
                let src = handle_index * handle_size;
                if let Some(handle) = handles.get(src..src + handle_size) {
                    data[offset..offset + handle_size].copy_from_slice(handle);
                }
                offset += self.strides[g] as usize;
                handle_index += 1;
            }
        }

        data
    }
}

/// Device-resident shader binding table with a staging copy.
pub struct ShaderBindingTable<D: RtDevice> {
    layout: SbtLayout,
    staging: D::Buffer,
    buffer: D::Buffer,
    start_offset: u64,
    regions: [vk::StridedDeviceAddressRegionKHR; 4],
    staged: bool,
}

impl<D: RtDevice> ShaderBindingTable<D> {
    /// Allocate the table and write `handles` into the staging copy.
    ///
    /// The table is placed in the staging buffer at the offset that puts its
    /// start on the base alignment in the device buffer once copied.
    pub fn new(device: &D, layout: SbtLayout, handles: &[u8]) -> Result<Self> {
        let size = layout.buffer_size();

        let mut staging = device
            .create_buffer(&BufferDesc {
                size,
                usage: vk::BufferUsageFlags::TRANSFER_SRC,
                location: MemoryLocation::CpuToGpu,
                name: "sbt_staging",
            })
            .map_err(|e| {
                log::error!("Failed to create SBT staging buffer: {}", e);
                e
            })?;

        let buffer = match device.create_buffer(&BufferDesc {
            size,
            usage: vk::BufferUsageFlags::TRANSFER_DST
                | vk::BufferUsageFlags::SHADER_DEVICE_ADDRESS
                | vk::BufferUsageFlags::SHADER_BINDING_TABLE_KHR,
            location: MemoryLocation::GpuOnly,
            name: "sbt",
        }) {
            Ok(buffer) => buffer,
            Err(e) => {
                log::error!("Failed to create SBT buffer: {}", e);
                device.destroy_buffer(staging);
                return Err(e);
            }
        };

        let address = buffer.device_address();
        let start_offset = align_up(address, layout.base_alignment) - address;

        let mut contents = vec![0u8; size as usize];
        let table = layout.table_data(handles);
        let start = start_offset as usize;
        contents[start..start + table.len()].copy_from_slice(&table);

        if let Err(e) = staging.write(0, &contents) {
            device.destroy_buffer(staging);
            device.destroy_buffer(buffer);
            return Err(e);
        }

        let mut regions = [vk::StridedDeviceAddressRegionKHR::default(); 4];
        for group in GroupType::ALL {
            let g = group.index();
            regions[g] = vk::StridedDeviceAddressRegionKHR {
                device_address: address + start_offset + layout.group_offset(group),
                stride: layout.strides[g],
                size: layout.counts[g] as u64 * layout.strides[g],
            };
        }

        log::debug!(
            "SBT layout: strides {:?}, spans {:?}, {} bytes ({} with padding), start offset {}",
            layout.strides,
            layout.spans,
            layout.table_size(),
            size,
            start_offset
        );

        Ok(Self {
            layout,
            staging,
            buffer,
            start_offset,
            regions,
            staged: false,
        })
    }

    pub fn layout(&self) -> &SbtLayout {
        &self.layout
    }

    /// Offset of the table inside both buffers.
    pub fn start_offset(&self) -> u64 {
        self.start_offset
    }

    pub fn is_staged(&self) -> bool {
        self.staged
    }

    pub fn region(&self, group: GroupType) -> vk::StridedDeviceAddressRegionKHR {
        self.regions[group.index()]
    }

    /// Region covering a single ray generation entry.
    pub fn gen_region(&self, index: u32) -> Result<vk::StridedDeviceAddressRegionKHR> {
        let count = self.layout.counts[GroupType::RayGen.index()];
        if index as usize >= count {
            return Err(RtError::RayGenIndexOutOfRange { index, count });
        }
        let mut region = self.region(GroupType::RayGen);
        region.device_address += index as u64 * region.stride;
        region.size = region.stride;
        Ok(region)
    }

    /// Patch the user record of one entry in the staging copy.
    ///
    /// Nothing is written when the record does not fit or the index is out of
    /// range.
    pub fn set_record(&mut self, group: GroupType, index: u32, record: &[u8]) -> Result<()> {
        let g = group.index();
        let max = self.layout.max_record_sizes[g];
        if record.len() > max {
            log::error!("{:?} record of {} bytes exceeds the maximum of {}", group, record.len(), max);
            return Err(RtError::RecordTooLarge { group, size: record.len(), max });
        }
        let count = self.layout.counts[g];
        if index as usize >= count {
            log::error!("{:?} record index {} out of range ({} entries)", group, index, count);
            return Err(RtError::RecordIndexOutOfRange { group, index, count });
        }

        let offset = self.start_offset + self.layout.record_offset(group, index as usize);
        self.staging.write(offset as usize, record)?;
        self.staged = false;
        Ok(())
    }

    /// Copy the staging table to the device if a record changed since the
    /// last copy. Only the table itself is copied, not the alignment padding
    /// around it. The copy is ordered before any later trace.
    pub fn stage(&mut self, device: &D, cmd: vk::CommandBuffer) {
        if self.staged {
            return;
        }
        let region = vk::BufferCopy {
            src_offset: self.start_offset,
            dst_offset: self.start_offset,
            size: self.layout.table_size(),
        };
        device.cmd_copy_buffer(cmd, &self.staging, &self.buffer, &[region]);

        let barrier = vk::MemoryBarrier::default()
            .src_access_mask(vk::AccessFlags::TRANSFER_WRITE)
            .dst_access_mask(vk::AccessFlags::SHADER_BINDING_TABLE_READ_KHR);
        device.cmd_pipeline_barrier(
            cmd,
            vk::PipelineStageFlags::TRANSFER,
            vk::PipelineStageFlags::RAY_TRACING_SHADER_KHR,
            &[barrier],
        );
        self.staged = true;
    }

    pub fn destroy(self, device: &D) {
        device.destroy_buffer(self.staging);
        device.destroy_buffer(self.buffer);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::raytracing::mock::{Event, MockDevice};

    const CMD: vk::CommandBuffer = vk::CommandBuffer::null();

    /// 2 ray-gen entries with 16 byte records, 1 miss, 0 callable, 1 hit with
    /// 8 byte records.
    fn layout() -> SbtLayout {
        SbtLayout::new(&RtProperties::default(), [2, 1, 0, 1], [16, 0, 0, 8])
    }

    fn handles(layout: &SbtLayout) -> Vec<u8> {
        let mut data = Vec::new();
        for group in 0..layout.group_count() {
            data.extend(std::iter::repeat((group + 1) as u8).take(layout.handle_size as usize));
        }
        data
    }

    fn table(device: &MockDevice) -> ShaderBindingTable<MockDevice> {
        let layout = layout();
        let handles = handles(&layout);
        ShaderBindingTable::new(device, layout, &handles).unwrap()
    }

    // ============================================================
    // Layout
    // ============================================================

    #[test]
    fn test_strides_and_spans() {
        let l = layout();
        // handle 32 + record 16 -> 64, two entries -> 128
        assert_eq!(l.strides, [64, 32, 32, 64]);
        assert_eq!(l.spans, [128, 64, 0, 64]);
        assert_eq!(l.table_size(), 256);
        assert_eq!(l.buffer_size(), 256 + 63);
    }

    #[test]
    fn test_group_offsets_are_consecutive() {
        let l = layout();
        assert_eq!(l.group_offset(GroupType::RayGen), 0);
        assert_eq!(l.group_offset(GroupType::Miss), 128);
        assert_eq!(l.group_offset(GroupType::Callable), 192);
        assert_eq!(l.group_offset(GroupType::Hit), 192);
    }

    #[test]
    fn test_spans_honour_base_alignment_with_odd_strides() {
        let props = RtProperties {
            shader_group_handle_size: 32,
            shader_group_handle_alignment: 32,
            shader_group_base_alignment: 64,
            ..RtProperties::default()
        };
        let l = SbtLayout::new(&props, [3, 1, 1, 1], [0, 4, 0, 0]);
        assert_eq!(l.strides, [32, 64, 32, 32]);
        assert_eq!(l.spans, [128, 64, 64, 64]);
    }

    #[test]
    fn test_table_data_places_handles_at_stride() {
        let l = layout();
        let data = l.table_data(&handles(&l));
        assert!(data[0..32].iter().all(|&b| b == 1));
        assert!(data[32..64].iter().all(|&b| b == 0));
        assert!(data[64..96].iter().all(|&b| b == 2));
        assert!(data[128..160].iter().all(|&b| b == 3));
        assert!(data[192..224].iter().all(|&b| b == 4));
    }

    // ============================================================
    // Device table
    // ============================================================

    #[test]
    fn test_regions_start_on_base_alignment() {
        let device = MockDevice::with_address_offset(16);
        let sbt = table(&device);
        assert_eq!(sbt.start_offset(), 48);
        for group in GroupType::ALL {
            assert_eq!(sbt.region(group).device_address % 64, 0);
        }
        let raygen = sbt.region(GroupType::RayGen);
        assert_eq!((raygen.stride, raygen.size), (64, 128));
        let hit = sbt.region(GroupType::Hit);
        assert_eq!(hit.device_address, raygen.device_address + 192);
        assert_eq!(sbt.region(GroupType::Callable).size, 0);
    }

    #[test]
    fn test_staging_holds_table_at_start_offset() {
        let device = MockDevice::with_address_offset(16);
        let _sbt = table(&device);
        let staging = device.contents("sbt_staging");
        assert_eq!(staging.len(), 319);
        assert!(staging[..48].iter().all(|&b| b == 0));
        assert!(staging[48..80].iter().all(|&b| b == 1));
        assert!(staging[48 + 64..48 + 96].iter().all(|&b| b == 2));
    }

    #[test]
    fn test_gen_region_selects_single_entry() {
        let device = MockDevice::new();
        let sbt = table(&device);
        let base = sbt.region(GroupType::RayGen).device_address;
        let second = sbt.gen_region(1).unwrap();
        assert_eq!(second.device_address, base + 64);
        assert_eq!(second.size, 64);
        assert!(matches!(
            sbt.gen_region(2),
            Err(RtError::RayGenIndexOutOfRange { index: 2, count: 2 })
        ));
    }

    // ============================================================
    // Records
    // ============================================================

    #[test]
    fn test_oversized_record_leaves_table_unchanged() {
        let device = MockDevice::new();
        let mut sbt = table(&device);
        sbt.stage(&device, CMD);
        let before = device.contents("sbt_staging");

        let err = sbt.set_record(GroupType::RayGen, 1, &[0xAB; 20]);
        assert_eq!(err, Err(RtError::RecordTooLarge { group: GroupType::RayGen, size: 20, max: 16 }));
        assert_eq!(device.contents("sbt_staging"), before);
        assert!(sbt.is_staged());

        sbt.set_record(GroupType::RayGen, 1, &[0xAB; 16]).unwrap();
        assert!(!sbt.is_staged());
        let after = device.contents("sbt_staging");
        let offset = (sbt.start_offset() + 64 + 32) as usize;
        assert!(after[offset..offset + 16].iter().all(|&b| b == 0xAB));
    }

    #[test]
    fn test_record_index_out_of_range() {
        let device = MockDevice::new();
        let mut sbt = table(&device);
        assert_eq!(
            sbt.set_record(GroupType::Hit, 1, &[1; 8]),
            Err(RtError::RecordIndexOutOfRange { group: GroupType::Hit, index: 1, count: 1 })
        );
    }

    fn table_barrier() -> Event {
        Event::Barrier {
            src_stage: vk::PipelineStageFlags::TRANSFER,
            dst_stage: vk::PipelineStageFlags::RAY_TRACING_SHADER_KHR,
            access: Some((vk::AccessFlags::TRANSFER_WRITE, vk::AccessFlags::SHADER_BINDING_TABLE_READ_KHR)),
        }
    }

    #[test]
    fn test_patched_record_visible_before_trace() {
        let device = MockDevice::new();
        let mut sbt = table(&device);
        sbt.stage(&device, CMD);
        sbt.set_record(GroupType::Hit, 0, &[9; 8]).unwrap();
        device.clear_events();

        sbt.stage(&device, CMD);
        let events = device.events();
        assert!(matches!(events[0], Event::Copy { .. }));
        assert_eq!(events[1..], [table_barrier()]);
        assert!(sbt.is_staged());
    }

    #[test]
    fn test_stage_copies_table_once() {
        let device = MockDevice::new();
        let mut sbt = table(&device);
        device.clear_events();

        sbt.stage(&device, CMD);
        sbt.stage(&device, CMD);
        assert_eq!(
            device.events(),
            vec![Event::Copy {
                src: "sbt_staging".into(),
                dst: "sbt".into(),
                regions: vec![(0, 0, 256)],
            }, table_barrier()]
        );
        assert_eq!(device.contents("sbt")[..256], device.contents("sbt_staging")[..256]);
    }

    #[test]
    fn test_stage_copies_from_aligned_start() {
        let device = MockDevice::with_address_offset(16);
        let mut sbt = table(&device);
        device.clear_events();

        sbt.stage(&device, CMD);
        assert_eq!(
            device.events(),
            vec![Event::Copy {
                src: "sbt_staging".into(),
                dst: "sbt".into(),
                regions: vec![(48, 48, 256)],
            }, table_barrier()]
        );
    }

    #[test]
    fn test_destroy_releases_both_buffers() {
        let device = MockDevice::new();
        let sbt = table(&device);
        device.clear_events();
        sbt.destroy(&device);
        assert_eq!(
            device.events(),
            vec![
                Event::DestroyBuffer { name: "sbt_staging".into() },
                Event::DestroyBuffer { name: "sbt".into() },
            ]
        );
    }
}
