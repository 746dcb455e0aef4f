//! Vulkan backend for the ray tracing core.
//!
//! Owns the instance, device and allocator, and implements
//! [`crate::raytracing::RtDevice`] on top of them.

pub mod commands;
pub mod context;
pub mod device;
pub mod memory;

pub use commands::CommandManager;
pub use context::VulkanContext;
pub use device::VulkanRtDevice;
pub use memory::{Buffer, MemoryManager};

use ash::vk;
use std::ffi::CStr;

/// Buffer device addresses are core from 1.2; the ray tracing
/// extensions build on them.
pub const REQUIRED_VK_VERSION: u32 = vk::API_VERSION_1_2;

pub const APP_NAME: &CStr = c"FluidRtx";
pub const ENGINE_NAME: &CStr = c"FluidRtx Renderer";
pub const ENGINE_VERSION: u32 = vk::make_api_version(0, 0, 1, 0);
