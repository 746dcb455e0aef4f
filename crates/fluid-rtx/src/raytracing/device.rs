//! Device seam used by the ray tracing core.
//!
//! Everything the acceleration structures, the build scheduler and the
//! pipeline need from the GPU goes through [`RtDevice`]. The Vulkan
//! implementation lives in [`crate::vulkan::VulkanRtDevice`].

use ash::vk;
use gpu_allocator::MemoryLocation;

use super::error::Result;

/// Hardware constants of the ray tracing pipeline and acceleration structure
/// extensions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RtProperties {
    pub shader_group_handle_size: u32,
    pub shader_group_handle_alignment: u32,
    pub shader_group_base_alignment: u32,
    pub max_ray_recursion_depth: u32,
    pub min_scratch_offset_alignment: u32,
    pub max_instance_count: u64,
}

impl Default for RtProperties {
    fn default() -> Self {
        Self {
            shader_group_handle_size: 32,
            shader_group_handle_alignment: 32,
            shader_group_base_alignment: 64,
            max_ray_recursion_depth: 1,
            min_scratch_offset_alignment: 128,
            max_instance_count: u32::MAX as u64,
        }
    }
}

/// Result of a build size query.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BuildSizes {
    pub acceleration_structure_size: vk::DeviceSize,
    pub build_scratch_size: vk::DeviceSize,
    pub update_scratch_size: vk::DeviceSize,
}

impl BuildSizes {
    /// Scratch needed to either build or update the structure.
    pub fn scratch_size(&self) -> vk::DeviceSize {
        self.build_scratch_size.max(self.update_scratch_size)
    }
}

/// Buffer creation parameters.
#[derive(Debug, Clone, Copy)]
pub struct BufferDesc<'a> {
    pub size: vk::DeviceSize,
    pub usage: vk::BufferUsageFlags,
    pub location: MemoryLocation,
    pub name: &'a str,
}

/// A device buffer created through [`RtDevice::create_buffer`].
pub trait DeviceBuffer {
    fn handle(&self) -> vk::Buffer;

    fn size(&self) -> vk::DeviceSize;

    /// Device address, or 0 when the buffer was created without
    /// `SHADER_DEVICE_ADDRESS` usage.
    fn device_address(&self) -> vk::DeviceAddress;

    /// Copy `data` into the mapped memory at `offset`.
    ///
    /// Fails for buffers that are not host visible or when the write does
    /// not fit.
    fn write(&mut self, offset: usize, data: &[u8]) -> Result<()>;
}

/// Device operations consumed by the ray tracing core.
///
/// Command recording methods never block; [`RtDevice::wait_idle`] is the
/// only synchronous wait.
pub trait RtDevice {
    type Buffer: DeviceBuffer;

    fn properties(&self) -> RtProperties;

    fn create_buffer(&self, desc: &BufferDesc<'_>) -> Result<Self::Buffer>;

    fn destroy_buffer(&self, buffer: Self::Buffer);

    fn wait_idle(&self) -> Result<()>;

    fn acceleration_structure_build_sizes(
        &self,
        info: &vk::AccelerationStructureBuildGeometryInfoKHR<'_>,
        max_primitive_counts: &[u32],
    ) -> BuildSizes;

    fn create_acceleration_structure(
        &self,
        info: &vk::AccelerationStructureCreateInfoKHR<'_>,
    ) -> Result<vk::AccelerationStructureKHR>;

    fn acceleration_structure_address(&self, handle: vk::AccelerationStructureKHR) -> vk::DeviceAddress;

    fn destroy_acceleration_structure(&self, handle: vk::AccelerationStructureKHR);

    fn create_shader_module(&self, code: &[u32]) -> Result<vk::ShaderModule>;

    fn destroy_shader_module(&self, module: vk::ShaderModule);

    fn create_ray_tracing_pipeline(
        &self,
        info: &vk::RayTracingPipelineCreateInfoKHR<'_>,
    ) -> Result<vk::Pipeline>;

    fn ray_tracing_shader_group_handles(
        &self,
        pipeline: vk::Pipeline,
        group_count: u32,
        data_size: usize,
    ) -> Result<Vec<u8>>;

    fn destroy_pipeline(&self, pipeline: vk::Pipeline);

    fn cmd_build_acceleration_structure(
        &self,
        cmd: vk::CommandBuffer,
        info: &vk::AccelerationStructureBuildGeometryInfoKHR<'_>,
        ranges: &[vk::AccelerationStructureBuildRangeInfoKHR],
    );

    fn cmd_pipeline_barrier(
        &self,
        cmd: vk::CommandBuffer,
        src_stage: vk::PipelineStageFlags,
        dst_stage: vk::PipelineStageFlags,
        memory_barriers: &[vk::MemoryBarrier<'_>],
    );

    fn cmd_copy_buffer(
        &self,
        cmd: vk::CommandBuffer,
        src: &Self::Buffer,
        dst: &Self::Buffer,
        regions: &[vk::BufferCopy],
    );

    fn cmd_bind_pipeline(
        &self,
        cmd: vk::CommandBuffer,
        bind_point: vk::PipelineBindPoint,
        pipeline: vk::Pipeline,
    );

    #[allow(clippy::too_many_arguments)]
    fn cmd_trace_rays(
        &self,
        cmd: vk::CommandBuffer,
        raygen: &vk::StridedDeviceAddressRegionKHR,
        miss: &vk::StridedDeviceAddressRegionKHR,
        hit: &vk::StridedDeviceAddressRegionKHR,
        callable: &vk::StridedDeviceAddressRegionKHR,
        width: u32,
        height: u32,
        depth: u32,
    );
}

/// Align a value up to the given power-of-two alignment.
pub fn align_up(value: u64, alignment: u64) -> u64 {
    if alignment == 0 {
        return value;
    }
    (value + alignment - 1) & !(alignment - 1)
}
