//! Command buffers for structure builds and traces.

use ash::vk;

use super::VulkanContext;

/// Number of frames recorded ahead of the GPU.
pub const MAX_FRAMES_IN_FLIGHT: usize = 2;

/// Pool and primary buffer owned by one frame slot.
pub struct FrameCommands {
    pub pool: vk::CommandPool,
    pub primary: vk::CommandBuffer,
}

/// Per-frame command buffers plus a transient pool for one-shot work such
/// as the initial structure build.
pub struct CommandManager {
    frames: Vec<FrameCommands>,
    transient_pool: vk::CommandPool,
    device: ash::Device,
}

unsafe fn create_pool(
    device: &ash::Device,
    queue_family: u32,
    flags: vk::CommandPoolCreateFlags,
) -> Result<vk::CommandPool, String> {
    let info = vk::CommandPoolCreateInfo::default()
        .queue_family_index(queue_family)
        .flags(flags);
    device
        .create_command_pool(&info, None)
        .map_err(|e| format!("Failed to create command pool: {:?}", e))
}

unsafe fn allocate_primary(device: &ash::Device, pool: vk::CommandPool) -> Result<vk::CommandBuffer, String> {
    let info = vk::CommandBufferAllocateInfo::default()
        .command_pool(pool)
        .level(vk::CommandBufferLevel::PRIMARY)
        .command_buffer_count(1);
    device
        .allocate_command_buffers(&info)
        .map_err(|e| format!("Failed to allocate command buffer: {:?}", e))?
        .pop()
        .ok_or_else(|| "Driver returned no command buffer".to_string())
}

unsafe fn begin_one_time(device: &ash::Device, cmd: vk::CommandBuffer) -> Result<(), String> {
    let info = vk::CommandBufferBeginInfo::default().flags(vk::CommandBufferUsageFlags::ONE_TIME_SUBMIT);
    device
        .begin_command_buffer(cmd, &info)
        .map_err(|e| format!("Failed to begin command buffer: {:?}", e))
}

impl CommandManager {
    /// # Safety
    /// Call [`CommandManager::destroy`] before the context is dropped.
    pub unsafe fn new(ctx: &VulkanContext) -> Result<Self, String> {
        let mut manager = Self {
            frames: Vec::with_capacity(MAX_FRAMES_IN_FLIGHT),
            transient_pool: vk::CommandPool::null(),
            device: ctx.device.clone(),
        };

        if let Err(e) = manager.create_pools(ctx.queue_family) {
            manager.destroy(ctx);
            return Err(e);
        }
        Ok(manager)
    }

    unsafe fn create_pools(&mut self, queue_family: u32) -> Result<(), String> {
        for _ in 0..MAX_FRAMES_IN_FLIGHT {
            let pool = create_pool(&self.device, queue_family, vk::CommandPoolCreateFlags::RESET_COMMAND_BUFFER)?;
            self.frames.push(FrameCommands {
                pool,
                primary: vk::CommandBuffer::null(),
            });
            let frame = self.frames.len() - 1;
            self.frames[frame].primary = allocate_primary(&self.device, pool)?;
        }
        self.transient_pool = create_pool(&self.device, queue_family, vk::CommandPoolCreateFlags::TRANSIENT)?;
        Ok(())
    }

    fn frame(&self, frame_index: usize) -> &FrameCommands {
        &self.frames[frame_index % self.frames.len()]
    }

    /// Reset and begin the primary buffer of a frame slot.
    pub unsafe fn begin_frame(&self, frame_index: usize) -> Result<vk::CommandBuffer, String> {
        let cmd = self.frame(frame_index).primary;
        self.device
            .reset_command_buffer(cmd, vk::CommandBufferResetFlags::empty())
            .map_err(|e| format!("Failed to reset command buffer: {:?}", e))?;
        begin_one_time(&self.device, cmd)?;
        Ok(cmd)
    }

    /// End the frame's buffer and submit it; `fence` signals on completion.
    pub unsafe fn submit_frame(&self, ctx: &VulkanContext, frame_index: usize, fence: vk::Fence) -> Result<(), String> {
        let cmd = [self.frame(frame_index).primary];
        self.device
            .end_command_buffer(cmd[0])
            .map_err(|e| format!("Failed to end command buffer: {:?}", e))?;

        let submit = vk::SubmitInfo::default().command_buffers(&cmd);
        self.device
            .queue_submit(ctx.queue, &[submit], fence)
            .map_err(|e| format!("Failed to submit frame: {:?}", e))
    }

    pub unsafe fn begin_single_time(&self) -> Result<vk::CommandBuffer, String> {
        let cmd = allocate_primary(&self.device, self.transient_pool)?;
        if let Err(e) = begin_one_time(&self.device, cmd) {
            self.device.free_command_buffers(self.transient_pool, &[cmd]);
            return Err(e);
        }
        Ok(cmd)
    }

    /// Submit a buffer from [`CommandManager::begin_single_time`] and block
    /// until the queue drains. The buffer is freed on every path.
    pub unsafe fn end_single_time(&self, ctx: &VulkanContext, cmd: vk::CommandBuffer) -> Result<(), String> {
        let cmds = [cmd];
        let result = self.submit_and_wait(ctx, &cmds);
        self.device.free_command_buffers(self.transient_pool, &cmds);
        result
    }

    unsafe fn submit_and_wait(&self, ctx: &VulkanContext, cmds: &[vk::CommandBuffer]) -> Result<(), String> {
        for &cmd in cmds {
            self.device
                .end_command_buffer(cmd)
                .map_err(|e| format!("Failed to end command buffer: {:?}", e))?;
        }
        let submit = vk::SubmitInfo::default().command_buffers(cmds);
        self.device
            .queue_submit(ctx.queue, &[submit], vk::Fence::null())
            .map_err(|e| format!("Failed to submit command buffer: {:?}", e))?;
        self.device
            .queue_wait_idle(ctx.queue)
            .map_err(|e| format!("Failed to wait for queue: {:?}", e))
    }

    /// Record `record` into a one-shot buffer and run it to completion.
    pub unsafe fn one_shot<T>(
        &self,
        ctx: &VulkanContext,
        record: impl FnOnce(vk::CommandBuffer) -> Result<T, String>,
    ) -> Result<T, String> {
        let cmd = self.begin_single_time()?;
        match record(cmd) {
            Ok(value) => self.end_single_time(ctx, cmd).map(|_| value),
            Err(e) => {
                self.device.free_command_buffers(self.transient_pool, &[cmd]);
                Err(e)
            }
        }
    }

    /// Destroy all pools. Buffers allocated from them go with them.
    pub unsafe fn destroy(&mut self, ctx: &VulkanContext) {
        for frame in self.frames.drain(..) {
            ctx.device.destroy_command_pool(frame.pool, None);
        }
        if self.transient_pool != vk::CommandPool::null() {
            ctx.device.destroy_command_pool(self.transient_pool, None);
            self.transient_pool = vk::CommandPool::null();
        }
    }
}
