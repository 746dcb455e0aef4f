//! GPU memory management using gpu-allocator.

use ash::vk;
use gpu_allocator::vulkan::{Allocation, AllocationCreateDesc, AllocationScheme, Allocator, AllocatorCreateDesc};
use gpu_allocator::{AllocatorDebugSettings, MemoryLocation};
use parking_lot::Mutex;
use std::sync::Arc;

use super::VulkanContext;
use crate::raytracing::{DeviceBuffer, RtError};

/// GPU buffer with associated memory.
pub struct Buffer {
    pub handle: vk::Buffer,
    pub allocation: Option<Allocation>,
    pub size: vk::DeviceSize,
    pub usage: vk::BufferUsageFlags,
    pub device_address: Option<vk::DeviceAddress>,
}

impl Buffer {
    /// Mapped pointer for CPU access, `None` for GPU-only memory.
    pub fn mapped_ptr(&self) -> Option<*mut u8> {
        self.allocation
            .as_ref()
            .and_then(|a| a.mapped_ptr())
            .map(|p| p.as_ptr() as *mut u8)
    }
}

impl DeviceBuffer for Buffer {
    fn handle(&self) -> vk::Buffer {
        self.handle
    }

    fn size(&self) -> vk::DeviceSize {
        self.size
    }

    fn device_address(&self) -> vk::DeviceAddress {
        self.device_address.unwrap_or(0)
    }

    fn write(&mut self, offset: usize, data: &[u8]) -> Result<(), RtError> {
        let Some(ptr) = self.mapped_ptr() else {
            return Err(RtError::Device("Buffer is not host visible".to_string()));
        };
        if offset as u64 + data.len() as u64 > self.size {
            return Err(RtError::Device(format!(
                "Write of {} bytes at offset {} exceeds buffer size {}",
                data.len(),
                offset,
                self.size
            )));
        }

        // SAFETY: the range was checked against the buffer size and the
        // allocation stays mapped while the buffer lives.
        unsafe {
            std::ptr::copy_nonoverlapping(data.as_ptr(), ptr.add(offset), data.len());
        }
        Ok(())
    }
}

/// Memory manager wrapping gpu-allocator.
pub struct MemoryManager {
    allocator: Arc<Mutex<Allocator>>,
    device: ash::Device,
    min_scratch_alignment: vk::DeviceSize,
}

impl MemoryManager {
    /// Create a new memory manager with buffer device addresses enabled.
    ///
    /// # Safety
    /// The context must outlive the manager.
    pub unsafe fn new(ctx: &VulkanContext) -> Result<Self, String> {
        let mut debug_settings = AllocatorDebugSettings::default();
        debug_settings.log_memory_information = cfg!(debug_assertions);
        debug_settings.log_leaks_on_shutdown = true;

        let allocator = Allocator::new(&AllocatorCreateDesc {
            instance: ctx.instance.clone(),
            device: ctx.device.clone(),
            physical_device: ctx.physical_device,
            debug_settings,
            buffer_device_address: true,
            allocation_sizes: Default::default(),
        })
        .map_err(|e| format!("Failed to create allocator: {:?}", e))?;

        Ok(Self {
            allocator: Arc::new(Mutex::new(allocator)),
            device: ctx.device.clone(),
            min_scratch_alignment: ctx.rt_properties.min_scratch_offset_alignment as vk::DeviceSize,
        })
    }

    /// Create a buffer with the specified usage and memory location.
    ///
    /// Buffers with a device address are aligned for use as build scratch.
    ///
    /// # Safety
    /// The returned buffer must be released with [`MemoryManager::destroy_buffer`].
    pub unsafe fn create_buffer(
        &self,
        size: vk::DeviceSize,
        usage: vk::BufferUsageFlags,
        location: MemoryLocation,
        name: &str,
    ) -> Result<Buffer, String> {
        let buffer_info = vk::BufferCreateInfo::default()
            .size(size.max(1))
            .usage(usage)
            .sharing_mode(vk::SharingMode::EXCLUSIVE);

        let handle = self
            .device
            .create_buffer(&buffer_info, None)
            .map_err(|e| format!("Failed to create buffer {}: {:?}", name, e))?;

        let mut requirements = self.device.get_buffer_memory_requirements(handle);
        let addressable = usage.contains(vk::BufferUsageFlags::SHADER_DEVICE_ADDRESS);
        if addressable {
            requirements.alignment = requirements.alignment.max(self.min_scratch_alignment);
        }

        let allocation = match self.allocator.lock().allocate(&AllocationCreateDesc {
            name,
            requirements,
            location,
            linear: true,
            allocation_scheme: AllocationScheme::GpuAllocatorManaged,
        }) {
            Ok(allocation) => allocation,
            Err(e) => {
                self.device.destroy_buffer(handle, None);
                return Err(format!("Failed to allocate memory for {}: {:?}", name, e));
            }
        };

        if let Err(e) = self
            .device
            .bind_buffer_memory(handle, allocation.memory(), allocation.offset())
        {
            self.device.destroy_buffer(handle, None);
            if let Err(free_err) = self.allocator.lock().free(allocation) {
                log::warn!("Failed to free memory of {}: {:?}", name, free_err);
            }
            return Err(format!("Failed to bind buffer memory for {}: {:?}", name, e));
        }

        let device_address = if addressable {
            let addr_info = vk::BufferDeviceAddressInfo::default().buffer(handle);
            Some(self.device.get_buffer_device_address(&addr_info))
        } else {
            None
        };

        Ok(Buffer {
            handle,
            allocation: Some(allocation),
            size,
            usage,
            device_address,
        })
    }

    /// Destroy a buffer.
    ///
    /// # Safety
    /// The GPU must no longer use the buffer.
    pub unsafe fn destroy_buffer(&self, buffer: Buffer) {
        self.device.destroy_buffer(buffer.handle, None);
        if let Some(allocation) = buffer.allocation {
            if let Err(e) = self.allocator.lock().free(allocation) {
                log::warn!("Failed to free buffer memory: {:?}", e);
            }
        }
    }
}
