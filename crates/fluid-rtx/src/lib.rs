#![allow(clippy::too_many_arguments, clippy::missing_safety_doc)]
// Acceleration structures and ray tracing pipelines for the fluid renderer

// Ray tracing core, written against the RtDevice seam
pub mod raytracing;

// Vulkan backend implementing RtDevice
pub mod vulkan;

pub mod config;

pub use config::RtConfig;
pub use raytracing::{
    Blas, GroupType, InstanceHandle, InstanceTarget, MeshHandle, RayTracingPipeline, RtDevice, RtError,
    RtInstance, RtProperties, RtScene, ScratchAllocator, Tlas,
};
pub use vulkan::{CommandManager, VulkanContext, VulkanRtDevice};
