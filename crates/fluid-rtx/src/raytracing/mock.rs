//! Recording device used by the unit tests.

use std::cell::{Cell, RefCell};
use std::collections::HashMap;
use std::rc::Rc;

use ash::vk;
use ash::vk::Handle;
use gpu_allocator::MemoryLocation;

use super::device::{align_up, BufferDesc, BuildSizes, DeviceBuffer, RtDevice, RtProperties};
use super::error::{Result, RtError};

type Contents = Rc<RefCell<Vec<u8>>>;

#[derive(Debug, Clone, PartialEq)]
pub enum Event {
    CreateBuffer { name: String, size: vk::DeviceSize },
    DestroyBuffer { name: String },
    Write { name: String, offset: usize, len: usize },
    WaitIdle,
    CreateAccelerationStructure { ty: vk::AccelerationStructureTypeKHR, size: vk::DeviceSize },
    DestroyAccelerationStructure,
    Build {
        ty: vk::AccelerationStructureTypeKHR,
        mode: vk::BuildAccelerationStructureModeKHR,
        primitive_counts: Vec<u32>,
        scratch: vk::DeviceAddress,
        updates_in_place: bool,
    },
    Barrier {
        src_stage: vk::PipelineStageFlags,
        dst_stage: vk::PipelineStageFlags,
        access: Option<(vk::AccessFlags, vk::AccessFlags)>,
    },
    Copy { src: String, dst: String, regions: Vec<(u64, u64, u64)> },
    CreateShaderModule,
    DestroyShaderModule,
    CreatePipeline { stage_count: u32, group_types: Vec<vk::RayTracingShaderGroupTypeKHR>, max_recursion: u32 },
    DestroyPipeline,
    BindPipeline,
    TraceRays {
        raygen: (u64, u64, u64),
        miss: (u64, u64, u64),
        hit: (u64, u64, u64),
        callable: (u64, u64, u64),
        extent: (u32, u32, u32),
    },
}

pub struct MockBuffer {
    handle: vk::Buffer,
    name: String,
    size: vk::DeviceSize,
    address: vk::DeviceAddress,
    mapped: bool,
    contents: Contents,
    events: Rc<RefCell<Vec<Event>>>,
}

impl DeviceBuffer for MockBuffer {
    fn handle(&self) -> vk::Buffer {
        self.handle
    }

    fn size(&self) -> vk::DeviceSize {
        self.size
    }

    fn device_address(&self) -> vk::DeviceAddress {
        self.address
    }

    fn write(&mut self, offset: usize, data: &[u8]) -> Result<()> {
        if !self.mapped {
            return Err(RtError::Device(format!("buffer {} is not host visible", self.name)));
        }
        let mut contents = self.contents.borrow_mut();
        if offset + data.len() > contents.len() {
            return Err(RtError::Device(format!("write past the end of {}", self.name)));
        }
        contents[offset..offset + data.len()].copy_from_slice(data);
        self.events.borrow_mut().push(Event::Write {
            name: self.name.clone(),
            offset,
            len: data.len(),
        });
        Ok(())
    }
}

pub struct MockDevice {
    pub props: RtProperties,
    events: Rc<RefCell<Vec<Event>>>,
    buffers: RefCell<HashMap<String, Contents>>,
    next_handle: Cell<u64>,
    address_cursor: Cell<u64>,
    address_offset: u64,
    fail_buffers: RefCell<Vec<String>>,
    fail_structures: Cell<bool>,
}

impl MockDevice {
    pub fn new() -> Self {
        Self::with_address_offset(0)
    }

    /// Buffers get addresses `offset` bytes past a 4 KiB boundary.
    pub fn with_address_offset(address_offset: u64) -> Self {
        Self {
            props: RtProperties::default(),
            events: Rc::new(RefCell::new(Vec::new())),
            buffers: RefCell::new(HashMap::new()),
            next_handle: Cell::new(1),
            address_cursor: Cell::new(0x1000_0000),
            address_offset,
            fail_buffers: RefCell::new(Vec::new()),
            fail_structures: Cell::new(false),
        }
    }

    pub fn fail_buffer(&self, name: &str) {
        self.fail_buffers.borrow_mut().push(name.to_string());
    }

    pub fn fail_structures(&self, fail: bool) {
        self.fail_structures.set(fail);
    }

    pub fn events(&self) -> Vec<Event> {
        self.events.borrow().clone()
    }

    pub fn clear_events(&self) {
        self.events.borrow_mut().clear();
    }

    /// Contents of the most recently created buffer with this name.
    pub fn contents(&self, name: &str) -> Vec<u8> {
        self.buffers
            .borrow()
            .get(name)
            .map(|c| c.borrow().clone())
            .unwrap_or_default()
    }

    pub fn writes_to(&self, name: &str) -> Vec<(usize, usize)> {
        self.events
            .borrow()
            .iter()
            .filter_map(|e| match e {
                Event::Write { name: n, offset, len } if n == name => Some((*offset, *len)),
                _ => None,
            })
            .collect()
    }

    pub fn builds(&self) -> Vec<Event> {
        self.events
            .borrow()
            .iter()
            .filter(|e| matches!(e, Event::Build { .. }))
            .cloned()
            .collect()
    }

    fn next_raw(&self) -> u64 {
        let raw = self.next_handle.get();
        self.next_handle.set(raw + 1);
        raw
    }

    fn push(&self, event: Event) {
        self.events.borrow_mut().push(event);
    }
}

fn region(r: &vk::StridedDeviceAddressRegionKHR) -> (u64, u64, u64) {
    (r.device_address, r.stride, r.size)
}

impl RtDevice for MockDevice {
    type Buffer = MockBuffer;

    fn properties(&self) -> RtProperties {
        self.props
    }

    fn create_buffer(&self, desc: &BufferDesc<'_>) -> Result<MockBuffer> {
        if self.fail_buffers.borrow().iter().any(|n| n == desc.name) {
            return Err(RtError::Device(format!("Failed to create buffer: {}", desc.name)));
        }

        let cursor = self.address_cursor.get();
        self.address_cursor.set(cursor + align_up(desc.size.max(1), 4096) + 4096);
        let address = if desc.usage.contains(vk::BufferUsageFlags::SHADER_DEVICE_ADDRESS) {
            cursor + self.address_offset
        } else {
            0
        };

        let contents: Contents = Rc::new(RefCell::new(vec![0xCD; desc.size as usize]));
        self.buffers.borrow_mut().insert(desc.name.to_string(), contents.clone());
        self.push(Event::CreateBuffer { name: desc.name.to_string(), size: desc.size });

        Ok(MockBuffer {
            handle: vk::Buffer::from_raw(self.next_raw()),
            name: desc.name.to_string(),
            size: desc.size,
            address,
            mapped: desc.location != MemoryLocation::GpuOnly,
            contents,
            events: self.events.clone(),
        })
    }

    fn destroy_buffer(&self, buffer: MockBuffer) {
        self.push(Event::DestroyBuffer { name: buffer.name });
    }

    fn wait_idle(&self) -> Result<()> {
        self.push(Event::WaitIdle);
        Ok(())
    }

    fn acceleration_structure_build_sizes(
        &self,
        _info: &vk::AccelerationStructureBuildGeometryInfoKHR<'_>,
        max_primitive_counts: &[u32],
    ) -> BuildSizes {
        let total: u64 = max_primitive_counts.iter().map(|&c| c as u64).sum();
        BuildSizes {
            acceleration_structure_size: 1024 + 64 * total,
            build_scratch_size: 512 + 32 * total,
            update_scratch_size: 256 + 16 * total,
        }
    }

    fn create_acceleration_structure(
        &self,
        info: &vk::AccelerationStructureCreateInfoKHR<'_>,
    ) -> Result<vk::AccelerationStructureKHR> {
        if self.fail_structures.get() {
            return Err(RtError::Device("Failed to create acceleration structure".to_string()));
        }
        self.push(Event::CreateAccelerationStructure { ty: info.ty, size: info.size });
        Ok(vk::AccelerationStructureKHR::from_raw(self.next_raw()))
    }

    fn acceleration_structure_address(&self, handle: vk::AccelerationStructureKHR) -> vk::DeviceAddress {
        0xA000_0000 + handle.as_raw() * 0x1000
    }

    fn destroy_acceleration_structure(&self, _handle: vk::AccelerationStructureKHR) {
        self.push(Event::DestroyAccelerationStructure);
    }

    fn create_shader_module(&self, _code: &[u32]) -> Result<vk::ShaderModule> {
        self.push(Event::CreateShaderModule);
        Ok(vk::ShaderModule::from_raw(self.next_raw()))
    }

    fn destroy_shader_module(&self, _module: vk::ShaderModule) {
        self.push(Event::DestroyShaderModule);
    }

    fn create_ray_tracing_pipeline(
        &self,
        info: &vk::RayTracingPipelineCreateInfoKHR<'_>,
    ) -> Result<vk::Pipeline> {
        // SAFETY: the caller keeps the group array alive for the duration of the call.
        let groups = unsafe { std::slice::from_raw_parts(info.p_groups, info.group_count as usize) };
        self.push(Event::CreatePipeline {
            stage_count: info.stage_count,
            group_types: groups.iter().map(|g| g.ty).collect(),
            max_recursion: info.max_pipeline_ray_recursion_depth,
        });
        Ok(vk::Pipeline::from_raw(self.next_raw()))
    }

    fn ray_tracing_shader_group_handles(
        &self,
        _pipeline: vk::Pipeline,
        group_count: u32,
        data_size: usize,
    ) -> Result<Vec<u8>> {
        let handle_size = self.props.shader_group_handle_size as usize;
        let mut data = Vec::with_capacity(data_size);
        for group in 0..group_count as usize {
            data.extend(std::iter::repeat((group + 1) as u8).take(handle_size));
        }
        data.resize(data_size, 0);
        Ok(data)
    }

    fn destroy_pipeline(&self, _pipeline: vk::Pipeline) {
        self.push(Event::DestroyPipeline);
    }

    fn cmd_build_acceleration_structure(
        &self,
        _cmd: vk::CommandBuffer,
        info: &vk::AccelerationStructureBuildGeometryInfoKHR<'_>,
        ranges: &[vk::AccelerationStructureBuildRangeInfoKHR],
    ) {
        // SAFETY: scratch_data is written as a device address by every caller.
        let scratch = unsafe { info.scratch_data.device_address };
        self.push(Event::Build {
            ty: info.ty,
            mode: info.mode,
            primitive_counts: ranges.iter().map(|r| r.primitive_count).collect(),
            scratch,
            updates_in_place: info.src_acceleration_structure == info.dst_acceleration_structure
                && info.src_acceleration_structure != vk::AccelerationStructureKHR::null(),
        });
    }

    fn cmd_pipeline_barrier(
        &self,
        _cmd: vk::CommandBuffer,
        src_stage: vk::PipelineStageFlags,
        dst_stage: vk::PipelineStageFlags,
        memory_barriers: &[vk::MemoryBarrier<'_>],
    ) {
        self.push(Event::Barrier {
            src_stage,
            dst_stage,
            access: memory_barriers.first().map(|b| (b.src_access_mask, b.dst_access_mask)),
        });
    }

    fn cmd_copy_buffer(
        &self,
        _cmd: vk::CommandBuffer,
        src: &MockBuffer,
        dst: &MockBuffer,
        regions: &[vk::BufferCopy],
    ) {
        for r in regions {
            let data = src.contents.borrow()[r.src_offset as usize..(r.src_offset + r.size) as usize].to_vec();
            dst.contents.borrow_mut()[r.dst_offset as usize..(r.dst_offset + r.size) as usize]
                .copy_from_slice(&data);
        }
        self.push(Event::Copy {
            src: src.name.clone(),
            dst: dst.name.clone(),
            regions: regions.iter().map(|r| (r.src_offset, r.dst_offset, r.size)).collect(),
        });
    }

    fn cmd_bind_pipeline(
        &self,
        _cmd: vk::CommandBuffer,
        _bind_point: vk::PipelineBindPoint,
        _pipeline: vk::Pipeline,
    ) {
        self.push(Event::BindPipeline);
    }

    fn cmd_trace_rays(
        &self,
        _cmd: vk::CommandBuffer,
        raygen: &vk::StridedDeviceAddressRegionKHR,
        miss: &vk::StridedDeviceAddressRegionKHR,
        hit: &vk::StridedDeviceAddressRegionKHR,
        callable: &vk::StridedDeviceAddressRegionKHR,
        width: u32,
        height: u32,
        depth: u32,
    ) {
        self.push(Event::TraceRays {
            raygen: region(raygen),
            miss: region(miss),
            hit: region(hit),
            callable: region(callable),
            extent: (width, height, depth),
        });
    }
}
