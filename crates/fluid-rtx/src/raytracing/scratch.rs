//! Shared scratch memory for acceleration structure builds.

use ash::vk;
use gpu_allocator::MemoryLocation;

use super::device::{BufferDesc, DeviceBuffer, RtDevice};
use super::error::Result;

/// One scratch buffer reused by every build of a batch and kept across frames.
///
/// The buffer only grows. Replacing it waits for the device to go idle since
/// a previous frame's builds may still be reading the old allocation.
pub struct ScratchAllocator<D: RtDevice> {
    buffer: Option<D::Buffer>,
}

impl<D: RtDevice> Default for ScratchAllocator<D> {
    fn default() -> Self {
        Self::new()
    }
}

impl<D: RtDevice> ScratchAllocator<D> {
    pub fn new() -> Self {
        Self { buffer: None }
    }

    pub fn size(&self) -> vk::DeviceSize {
        self.buffer.as_ref().map_or(0, |b| b.size())
    }

    pub fn device_address(&self) -> vk::DeviceAddress {
        self.buffer.as_ref().map_or(0, |b| b.device_address())
    }

    /// Make sure at least `required` bytes are available and return the
    /// scratch address.
    pub fn ensure(&mut self, device: &D, required: vk::DeviceSize) -> Result<vk::DeviceAddress> {
        if required == 0 || self.size() >= required {
            return Ok(self.device_address());
        }

        if let Some(old) = self.buffer.take() {
            log::warn!(
                "Relocating acceleration structure scratch buffer ({} -> {} bytes), waiting for device idle",
                old.size(),
                required
            );
            device.wait_idle()?;
            device.destroy_buffer(old);
        }

        let buffer = device
            .create_buffer(&BufferDesc {
                size: required,
                usage: vk::BufferUsageFlags::STORAGE_BUFFER | vk::BufferUsageFlags::SHADER_DEVICE_ADDRESS,
                location: MemoryLocation::GpuOnly,
                name: "as_scratch",
            })
            .map_err(|e| {
                log::error!("Failed to allocate {} bytes of scratch memory: {}", required, e);
                e
            })?;

        log::debug!("Allocated {} bytes of scratch memory", required);
        let address = buffer.device_address();
        self.buffer = Some(buffer);
        Ok(address)
    }

    pub fn destroy(&mut self, device: &D) {
        if let Some(buffer) = self.buffer.take() {
            device.destroy_buffer(buffer);
        }
    }
}
