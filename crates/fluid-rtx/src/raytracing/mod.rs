//! Ray tracing support via Vulkan KHR extensions.
//!
//! This module provides acceleration structure management (BLAS/TLAS) over a
//! dynamic instance table, batched structure builds, shader binding tables
//! and ray tracing pipeline creation. Device work goes through [`RtDevice`].

pub mod blas;
pub mod build;
pub mod device;
pub mod error;
pub mod instance;
pub mod instance_table;
pub mod pipeline;
pub mod sbt;
pub mod scene;
pub mod scratch;
pub mod tlas;

#[cfg(test)]
mod mock;

pub use blas::Blas;
pub use build::{build_acceleration_structures, wait_as_build, wait_last_trace, AccelerationStructure};
pub use device::{align_up, BufferDesc, BuildSizes, DeviceBuffer, RtDevice, RtProperties};
pub use error::{Result, RtError};
pub use instance::{transform_rows, RtInstance};
pub use instance_table::{InstanceHandle, InstanceTable};
pub use pipeline::{PipelineState, RayTracingPipeline};
pub use sbt::{GroupType, SbtLayout, ShaderBindingTable};
pub use scene::{InstanceTarget, MeshHandle, RtScene};
pub use scratch::ScratchAllocator;
pub use tlas::Tlas;
