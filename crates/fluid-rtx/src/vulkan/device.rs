//! [`RtDevice`] implemented on a Vulkan context.

use ash::vk;
use std::sync::Arc;

use super::memory::{Buffer, MemoryManager};
use super::VulkanContext;
use crate::raytracing::{BufferDesc, BuildSizes, Result, RtDevice, RtError, RtProperties};

/// Vulkan device used by the acceleration structures and pipelines.
pub struct VulkanRtDevice {
    // Dropped before the context it allocates from.
    memory: MemoryManager,
    ctx: Arc<VulkanContext>,
}

impl VulkanRtDevice {
    /// # Safety
    /// Every object created through this device must be destroyed through it
    /// before the context is dropped.
    pub unsafe fn new(ctx: Arc<VulkanContext>) -> std::result::Result<Self, String> {
        let memory = MemoryManager::new(&ctx)?;
        Ok(Self { memory, ctx })
    }

    pub fn context(&self) -> &VulkanContext {
        &self.ctx
    }

    pub fn memory(&self) -> &MemoryManager {
        &self.memory
    }
}

impl RtDevice for VulkanRtDevice {
    type Buffer = Buffer;

    fn properties(&self) -> RtProperties {
        self.ctx.rt_properties
    }

    fn create_buffer(&self, desc: &BufferDesc<'_>) -> Result<Buffer> {
        unsafe {
            self.memory
                .create_buffer(desc.size, desc.usage, desc.location, desc.name)
                .map_err(RtError::from)
        }
    }

    fn destroy_buffer(&self, buffer: Buffer) {
        unsafe { self.memory.destroy_buffer(buffer) }
    }

    fn wait_idle(&self) -> Result<()> {
        self.ctx.wait_idle().map_err(RtError::from)
    }

    fn acceleration_structure_build_sizes(
        &self,
        info: &vk::AccelerationStructureBuildGeometryInfoKHR<'_>,
        max_primitive_counts: &[u32],
    ) -> BuildSizes {
        let mut size_info = vk::AccelerationStructureBuildSizesInfoKHR::default();
        unsafe {
            self.ctx.accel_struct_loader.get_acceleration_structure_build_sizes(
                vk::AccelerationStructureBuildTypeKHR::DEVICE,
                info,
                max_primitive_counts,
                &mut size_info,
            );
        }
        BuildSizes {
            acceleration_structure_size: size_info.acceleration_structure_size,
            build_scratch_size: size_info.build_scratch_size,
            update_scratch_size: size_info.update_scratch_size,
        }
    }

    fn create_acceleration_structure(
        &self,
        info: &vk::AccelerationStructureCreateInfoKHR<'_>,
    ) -> Result<vk::AccelerationStructureKHR> {
        unsafe {
            self.ctx
                .accel_struct_loader
                .create_acceleration_structure(info, None)
                .map_err(|e| RtError::Device(format!("Failed to create acceleration structure: {:?}", e)))
        }
    }

    fn acceleration_structure_address(&self, handle: vk::AccelerationStructureKHR) -> vk::DeviceAddress {
        let addr_info = vk::AccelerationStructureDeviceAddressInfoKHR::default().acceleration_structure(handle);
        unsafe {
            self.ctx
                .accel_struct_loader
                .get_acceleration_structure_device_address(&addr_info)
        }
    }

    fn destroy_acceleration_structure(&self, handle: vk::AccelerationStructureKHR) {
        unsafe {
            self.ctx
                .accel_struct_loader
                .destroy_acceleration_structure(handle, None);
        }
    }

    fn create_shader_module(&self, code: &[u32]) -> Result<vk::ShaderModule> {
        let create_info = vk::ShaderModuleCreateInfo::default().code(code);
        unsafe {
            self.ctx
                .device
                .create_shader_module(&create_info, None)
                .map_err(|e| RtError::Device(format!("Failed to create shader module: {:?}", e)))
        }
    }

    fn destroy_shader_module(&self, module: vk::ShaderModule) {
        unsafe { self.ctx.device.destroy_shader_module(module, None) }
    }

    fn create_ray_tracing_pipeline(&self, info: &vk::RayTracingPipelineCreateInfoKHR<'_>) -> Result<vk::Pipeline> {
        let pipelines = unsafe {
            self.ctx.rt_pipeline_loader.create_ray_tracing_pipelines(
                vk::DeferredOperationKHR::null(),
                vk::PipelineCache::null(),
                std::slice::from_ref(info),
                None,
            )
        };

        match pipelines {
            Ok(pipelines) => pipelines
                .first()
                .copied()
                .ok_or_else(|| RtError::Device("No ray tracing pipeline returned".to_string())),
            Err((partial, e)) => {
                for pipeline in partial.into_iter().filter(|p| *p != vk::Pipeline::null()) {
                    self.destroy_pipeline(pipeline);
                }
                Err(RtError::Device(format!("Failed to create ray tracing pipeline: {:?}", e)))
            }
        }
    }

    fn ray_tracing_shader_group_handles(
        &self,
        pipeline: vk::Pipeline,
        group_count: u32,
        data_size: usize,
    ) -> Result<Vec<u8>> {
        unsafe {
            self.ctx
                .rt_pipeline_loader
                .get_ray_tracing_shader_group_handles(pipeline, 0, group_count, data_size)
                .map_err(|e| RtError::Device(format!("Failed to get shader group handles: {:?}", e)))
        }
    }

    fn destroy_pipeline(&self, pipeline: vk::Pipeline) {
        unsafe { self.ctx.device.destroy_pipeline(pipeline, None) }
    }

    fn cmd_build_acceleration_structure(
        &self,
        cmd: vk::CommandBuffer,
        info: &vk::AccelerationStructureBuildGeometryInfoKHR<'_>,
        ranges: &[vk::AccelerationStructureBuildRangeInfoKHR],
    ) {
        unsafe {
            self.ctx
                .accel_struct_loader
                .cmd_build_acceleration_structures(cmd, std::slice::from_ref(info), &[ranges]);
        }
    }

    fn cmd_pipeline_barrier(
        &self,
        cmd: vk::CommandBuffer,
        src_stage: vk::PipelineStageFlags,
        dst_stage: vk::PipelineStageFlags,
        memory_barriers: &[vk::MemoryBarrier<'_>],
    ) {
        unsafe {
            self.ctx.device.cmd_pipeline_barrier(
                cmd,
                src_stage,
                dst_stage,
                vk::DependencyFlags::empty(),
                memory_barriers,
                &[],
                &[],
            );
        }
    }

    fn cmd_copy_buffer(&self, cmd: vk::CommandBuffer, src: &Buffer, dst: &Buffer, regions: &[vk::BufferCopy]) {
        unsafe { self.ctx.device.cmd_copy_buffer(cmd, src.handle, dst.handle, regions) }
    }

    fn cmd_bind_pipeline(&self, cmd: vk::CommandBuffer, bind_point: vk::PipelineBindPoint, pipeline: vk::Pipeline) {
        unsafe { self.ctx.device.cmd_bind_pipeline(cmd, bind_point, pipeline) }
    }

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
    ) {
        unsafe {
            self.ctx
                .rt_pipeline_loader
                .cmd_trace_rays(cmd, raygen, miss, hit, callable, width, height, depth);
        }
    }
}
