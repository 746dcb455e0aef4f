//! Ray tracing configuration derived from requested values and device limits.

use ash::vk;

use crate::raytracing::RtProperties;

/// Default capacity of the instance table.
pub const DEFAULT_MAX_INSTANCES: u32 = 4096;

/// Settings for the acceleration structures and the pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RtConfig {
    /// Capacity of the top-level instance table
    pub max_instances: u32,
    /// Build flags of the top-level structure
    pub tlas_flags: vk::BuildAccelerationStructureFlagsKHR,
    /// Build flags of every bottom-level structure
    pub blas_flags: vk::BuildAccelerationStructureFlagsKHR,
    /// Recursion depth requested for the pipeline, at most the device limit
    pub max_ray_recursion_depth: u32,
    /// Whether the Vulkan validation layer is enabled
    pub enable_validation: bool,
}

impl Default for RtConfig {
    fn default() -> Self {
        Self {
            max_instances: DEFAULT_MAX_INSTANCES,
            tlas_flags: vk::BuildAccelerationStructureFlagsKHR::PREFER_FAST_TRACE
                | vk::BuildAccelerationStructureFlagsKHR::ALLOW_UPDATE,
            blas_flags: vk::BuildAccelerationStructureFlagsKHR::PREFER_FAST_TRACE,
            max_ray_recursion_depth: 1,
            enable_validation: cfg!(debug_assertions),
        }
    }
}

impl RtConfig {
    /// Create a config from requested values, clamped to device limits.
    ///
    /// # Arguments
    /// * `props` - Ray tracing properties of the physical device
    /// * `max_instances` - Requested instance table capacity (0 = default)
    /// * `max_ray_recursion_depth` - Requested recursion depth (0 = 1)
    pub fn new(props: &RtProperties, max_instances: u32, max_ray_recursion_depth: u32) -> Self {
        let requested = if max_instances == 0 { DEFAULT_MAX_INSTANCES } else { max_instances };
        let device_max = props.max_instance_count.min(u32::MAX as u64) as u32;
        let max_instances = requested.min(device_max);
        if max_instances < requested {
            log::warn!(
                "Requested {} instances, device supports {}",
                requested,
                device_max
            );
        }

        let max_ray_recursion_depth = max_ray_recursion_depth
            .max(1)
            .min(props.max_ray_recursion_depth.max(1));

        Self {
            max_instances,
            max_ray_recursion_depth,
            ..Self::default()
        }
    }

    /// Allow refitting of dynamic meshes instead of full rebuilds.
    pub fn with_blas_updates(mut self) -> Self {
        self.blas_flags |= vk::BuildAccelerationStructureFlagsKHR::ALLOW_UPDATE;
        self
    }

    pub fn with_validation(mut self, enable: bool) -> Self {
        self.enable_validation = enable;
        self
    }
}
