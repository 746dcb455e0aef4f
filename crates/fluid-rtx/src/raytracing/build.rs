//! Batched acceleration structure builds and the barriers around them.

use ash::vk;
use bytemuck::Pod;

use super::blas::Blas;
use super::device::RtDevice;
use super::error::Result;
use super::scratch::ScratchAllocator;
use super::tlas::Tlas;

/// Anything the build scheduler can record.
pub trait AccelerationStructure<D: RtDevice> {
    fn scratch_size(&self) -> vk::DeviceSize;

    fn build(&mut self, device: &D, cmd: vk::CommandBuffer, scratch_address: vk::DeviceAddress) -> Result<()>;
}

impl<D: RtDevice> AccelerationStructure<D> for Blas<D> {
    fn scratch_size(&self) -> vk::DeviceSize {
        Blas::scratch_size(self)
    }

    fn build(&mut self, device: &D, cmd: vk::CommandBuffer, scratch_address: vk::DeviceAddress) -> Result<()> {
        Blas::build(self, device, cmd, scratch_address)
    }
}

impl<D: RtDevice, T: Pod> AccelerationStructure<D> for Tlas<D, T> {
    fn scratch_size(&self) -> vk::DeviceSize {
        Tlas::scratch_size(self)
    }

    fn build(&mut self, device: &D, cmd: vk::CommandBuffer, scratch_address: vk::DeviceAddress) -> Result<()> {
        Tlas::build(self, device, cmd, scratch_address)
    }
}

const STRUCTURE_ACCESS: vk::AccessFlags = vk::AccessFlags::from_raw(
    vk::AccessFlags::ACCELERATION_STRUCTURE_READ_KHR.as_raw()
        | vk::AccessFlags::ACCELERATION_STRUCTURE_WRITE_KHR.as_raw(),
);

/// Stages that write frame data read by traces: structure builds and the
/// payload copy recorded with the TLAS build.
pub const FRAME_UPDATE_STAGES: vk::PipelineStageFlags = vk::PipelineStageFlags::from_raw(
    vk::PipelineStageFlags::ACCELERATION_STRUCTURE_BUILD_KHR.as_raw() | vk::PipelineStageFlags::TRANSFER.as_raw(),
);

const FRAME_UPDATE_WRITES: vk::AccessFlags = vk::AccessFlags::from_raw(
    STRUCTURE_ACCESS.as_raw() | vk::AccessFlags::TRANSFER_WRITE.as_raw(),
);

const TRACE_READS: vk::AccessFlags = vk::AccessFlags::from_raw(
    vk::AccessFlags::ACCELERATION_STRUCTURE_READ_KHR.as_raw() | vk::AccessFlags::SHADER_READ.as_raw(),
);

/// Record builds for one batch: every BLAS first, then every TLAS.
///
/// All builds share one scratch region sized for the largest structure of
/// the batch. Each build is followed by a structure read/write barrier, so
/// later builds see the results of earlier ones. Structures outside the batch
/// are left untouched.
pub fn build_acceleration_structures<'a, D: RtDevice>(
    device: &D,
    cmd: vk::CommandBuffer,
    blas: &mut [&'a mut dyn AccelerationStructure<D>],
    tlas: &mut [&'a mut dyn AccelerationStructure<D>],
    scratch: &mut ScratchAllocator<D>,
) -> Result<()> {
    let required = blas
        .iter()
        .chain(tlas.iter())
        .map(|s| s.scratch_size())
        .max()
        .unwrap_or(0);

    let scratch_address = scratch.ensure(device, required)?;

    for structure in blas.iter_mut().chain(tlas.iter_mut()) {
        structure.build(device, cmd, scratch_address)?;
        structure_barrier(device, cmd);
    }

    Ok(())
}

fn structure_barrier<D: RtDevice>(device: &D, cmd: vk::CommandBuffer) {
    let barrier = vk::MemoryBarrier::default()
        .src_access_mask(STRUCTURE_ACCESS)
        .dst_access_mask(STRUCTURE_ACCESS);

    device.cmd_pipeline_barrier(
        cmd,
        vk::PipelineStageFlags::ACCELERATION_STRUCTURE_BUILD_KHR,
        vk::PipelineStageFlags::ACCELERATION_STRUCTURE_BUILD_KHR,
        &[barrier],
    );
}

/// Wait for the previous frame's traces before the structures and payloads
/// they read are rewritten.
pub fn wait_last_trace<D: RtDevice>(device: &D, cmd: vk::CommandBuffer) {
    device.cmd_pipeline_barrier(
        cmd,
        vk::PipelineStageFlags::RAY_TRACING_SHADER_KHR,
        FRAME_UPDATE_STAGES,
        &[],
    );
}

/// Make finished builds and payload uploads visible to ray tracing shaders.
pub fn wait_as_build<D: RtDevice>(device: &D, cmd: vk::CommandBuffer) {
    let barrier = vk::MemoryBarrier::default()
        .src_access_mask(FRAME_UPDATE_WRITES)
        .dst_access_mask(TRACE_READS);

    device.cmd_pipeline_barrier(
        cmd,
        FRAME_UPDATE_STAGES,
        vk::PipelineStageFlags::RAY_TRACING_SHADER_KHR,
        &[barrier],
    );
}
