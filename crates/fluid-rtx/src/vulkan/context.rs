//! Vulkan context: instance, physical device, logical device, and queue.

use ash::khr::{acceleration_structure, deferred_host_operations, ray_tracing_pipeline};
use ash::{vk, Device, Entry, Instance};
use std::ffi::CStr;
use std::os::raw::c_char;

use super::{APP_NAME, ENGINE_NAME, ENGINE_VERSION, REQUIRED_VK_VERSION};
use crate::config::RtConfig;
use crate::raytracing::RtProperties;

const VALIDATION_LAYER: &CStr = c"VK_LAYER_KHRONOS_validation";

const DEVICE_EXTENSIONS: [&CStr; 3] = [
    acceleration_structure::NAME,
    ray_tracing_pipeline::NAME,
    deferred_host_operations::NAME,
];

/// Main Vulkan context holding the core Vulkan objects.
///
/// The selected device always supports acceleration structures, ray tracing
/// pipelines and buffer device addresses; devices without them are skipped.
pub struct VulkanContext {
    pub entry: Entry,
    pub instance: Instance,
    pub physical_device: vk::PhysicalDevice,
    pub device: Device,

    /// Family with graphics and compute support, used for builds and traces
    pub queue_family: u32,
    pub queue: vk::Queue,

    pub accel_struct_loader: acceleration_structure::Device,
    pub rt_pipeline_loader: ray_tracing_pipeline::Device,

    pub rt_properties: RtProperties,
    pub device_properties: vk::PhysicalDeviceProperties,

    debug: Option<DebugMessenger>,
}

/// Validation message sink, present only with validation enabled.
struct DebugMessenger {
    loader: ash::ext::debug_utils::Instance,
    messenger: vk::DebugUtilsMessengerEXT,
}

impl DebugMessenger {
    unsafe fn destroy(&self) {
        self.loader.destroy_debug_utils_messenger(self.messenger, None);
    }
}

impl VulkanContext {
    /// [`VulkanContext::new`] with the validation setting of `config`.
    ///
    /// # Safety
    /// See [`VulkanContext::new`].
    pub unsafe fn from_config(
        display_handle: Option<raw_window_handle::RawDisplayHandle>,
        config: &RtConfig,
    ) -> Result<Self, String> {
        Self::new(display_handle, config.enable_validation)
    }

    /// Bring up a device for ray tracing. `display_handle` adds the surface
    /// instance extensions; pass `None` for headless builds.
    ///
    /// # Safety
    /// The display handle must stay valid for the lifetime of the context.
    pub unsafe fn new(
        display_handle: Option<raw_window_handle::RawDisplayHandle>,
        enable_validation: bool,
    ) -> Result<Self, String> {
        let entry = Entry::linked();
        check_instance_version(&entry)?;

        let instance = Self::create_instance(&entry, display_handle, enable_validation)?;

        let debug = enable_validation
            .then(|| Self::setup_debug_messenger(&entry, &instance))
            .and_then(|created| created.map_err(|e| log::warn!("{}", e)).ok());

        let picked = Self::pick_physical_device(&instance).and_then(|(physical_device, queue_family)| {
            Self::create_logical_device(&instance, physical_device, queue_family)
                .map(|device| (physical_device, queue_family, device))
        });
        let (physical_device, queue_family, device) = match picked {
            Ok(picked) => picked,
            Err(e) => {
                if let Some(debug) = &debug {
                    debug.destroy();
                }
                instance.destroy_instance(None);
                return Err(e);
            }
        };

        let device_properties = instance.get_physical_device_properties(physical_device);
        let rt_properties = Self::query_rt_properties(&instance, physical_device);

        let name = CStr::from_ptr(device_properties.device_name.as_ptr()).to_string_lossy();
        log::info!(
            "Selected GPU: {} (handle size {}, base alignment {}, max recursion {})",
            name,
            rt_properties.shader_group_handle_size,
            rt_properties.shader_group_base_alignment,
            rt_properties.max_ray_recursion_depth
        );

        let queue = device.get_device_queue(queue_family, 0);

        let accel_struct_loader = acceleration_structure::Device::new(&instance, &device);
        let rt_pipeline_loader = ray_tracing_pipeline::Device::new(&instance, &device);

        Ok(Self {
            entry,
            instance,
            physical_device,
            device,
            queue_family,
            queue,
            accel_struct_loader,
            rt_pipeline_loader,
            rt_properties,
            device_properties,
            debug,
        })
    }

    /// Create Vulkan instance with required extensions.
    unsafe fn create_instance(
        entry: &Entry,
        display_handle: Option<raw_window_handle::RawDisplayHandle>,
        enable_validation: bool,
    ) -> Result<Instance, String> {
        let app_info = vk::ApplicationInfo::default()
            .application_name(APP_NAME)
            .application_version(ENGINE_VERSION)
            .engine_name(ENGINE_NAME)
            .engine_version(ENGINE_VERSION)
            .api_version(REQUIRED_VK_VERSION);

        let mut extensions = match display_handle {
            Some(display) => ash_window::enumerate_required_extensions(display)
                .map_err(|e| format!("Failed to get required extensions: {:?}", e))?
                .to_vec(),
            None => Vec::new(),
        };

        if enable_validation {
            extensions.push(ash::ext::debug_utils::NAME.as_ptr());
        }

        let layers: &[*const c_char] = if enable_validation {
            &[VALIDATION_LAYER.as_ptr()]
        } else {
            &[]
        };

        let create_info = vk::InstanceCreateInfo::default()
            .application_info(&app_info)
            .enabled_extension_names(&extensions)
            .enabled_layer_names(layers);

        entry
            .create_instance(&create_info, None)
            .map_err(|e| format!("Failed to create Vulkan instance: {:?}", e))
    }

    /// Route validation errors and warnings to the log. Failure is not fatal.
    unsafe fn setup_debug_messenger(entry: &Entry, instance: &Instance) -> Result<DebugMessenger, String> {
        type Severity = vk::DebugUtilsMessageSeverityFlagsEXT;
        type Kind = vk::DebugUtilsMessageTypeFlagsEXT;

        let loader = ash::ext::debug_utils::Instance::new(entry, instance);
        let info = vk::DebugUtilsMessengerCreateInfoEXT::default()
            .message_severity(Severity::ERROR | Severity::WARNING)
            .message_type(Kind::VALIDATION | Kind::PERFORMANCE)
            .pfn_user_callback(Some(debug_callback));

        loader
            .create_debug_utils_messenger(&info, None)
            .map(|messenger| DebugMessenger { loader, messenger })
            .map_err(|e| format!("Validation output unavailable: {:?}", e))
    }

    /// Select the best ray tracing capable device.
    unsafe fn pick_physical_device(instance: &Instance) -> Result<(vk::PhysicalDevice, u32), String> {
        let candidates = instance
            .enumerate_physical_devices()
            .map_err(|e| format!("Failed to enumerate physical devices: {:?}", e))?;

        candidates
            .into_iter()
            .filter(|&device| Self::supports_ray_tracing(instance, device))
            .filter_map(|device| {
                let family = Self::find_queue_family(instance, device)?;
                Some((device, family, Self::device_score(instance, device)))
            })
            .max_by_key(|&(_, _, score)| score)
            .map(|(device, family, _)| (device, family))
            .ok_or_else(|| "No GPU with ray tracing support found".to_string())
    }

    /// Ordering key among ray tracing devices: device class first, then
    /// device-local memory in MiB.
    unsafe fn device_score(instance: &Instance, device: vk::PhysicalDevice) -> (u8, u64) {
        let class = match instance.get_physical_device_properties(device).device_type {
            vk::PhysicalDeviceType::DISCRETE_GPU => 2,
            vk::PhysicalDeviceType::INTEGRATED_GPU => 1,
            _ => 0,
        };

        let memory = instance.get_physical_device_memory_properties(device);
        let local_mib = memory
            .memory_heaps_as_slice()
            .iter()
            .filter(|heap| heap.flags.contains(vk::MemoryHeapFlags::DEVICE_LOCAL))
            .map(|heap| heap.size >> 20)
            .sum();

        (class, local_mib)
    }

    /// First queue family with graphics and compute support.
    unsafe fn find_queue_family(instance: &Instance, device: vk::PhysicalDevice) -> Option<u32> {
        instance
            .get_physical_device_queue_family_properties(device)
            .iter()
            .position(|family| {
                family
                    .queue_flags
                    .contains(vk::QueueFlags::GRAPHICS | vk::QueueFlags::COMPUTE)
            })
            .map(|i| i as u32)
    }

    /// Check extensions and features needed by the ray tracing core.
    unsafe fn supports_ray_tracing(instance: &Instance, device: vk::PhysicalDevice) -> bool {
        let Ok(available) = instance.enumerate_device_extension_properties(device) else {
            return false;
        };

        let all_present = DEVICE_EXTENSIONS.iter().all(|wanted| {
            available
                .iter()
                .any(|ext| ext.extension_name_as_c_str().is_ok_and(|name| name == *wanted))
        });
        if !all_present {
            return false;
        }

        let mut vulkan_12_features = vk::PhysicalDeviceVulkan12Features::default();
        let mut accel_features = vk::PhysicalDeviceAccelerationStructureFeaturesKHR::default();
        let mut rt_features = vk::PhysicalDeviceRayTracingPipelineFeaturesKHR::default();
        let mut features2 = vk::PhysicalDeviceFeatures2::default()
            .push_next(&mut vulkan_12_features)
            .push_next(&mut accel_features)
            .push_next(&mut rt_features);

        instance.get_physical_device_features2(device, &mut features2);

        vulkan_12_features.buffer_device_address == vk::TRUE
            && accel_features.acceleration_structure == vk::TRUE
            && rt_features.ray_tracing_pipeline == vk::TRUE
    }

    /// Query the hardware constants used for table layout and scratch sizing.
    unsafe fn query_rt_properties(instance: &Instance, device: vk::PhysicalDevice) -> RtProperties {
        let mut rt_props = vk::PhysicalDeviceRayTracingPipelinePropertiesKHR::default();
        let mut accel_props = vk::PhysicalDeviceAccelerationStructurePropertiesKHR::default();
        let mut props2 = vk::PhysicalDeviceProperties2::default()
            .push_next(&mut rt_props)
            .push_next(&mut accel_props);

        instance.get_physical_device_properties2(device, &mut props2);

        RtProperties {
            shader_group_handle_size: rt_props.shader_group_handle_size,
            shader_group_handle_alignment: rt_props.shader_group_handle_alignment,
            shader_group_base_alignment: rt_props.shader_group_base_alignment,
            max_ray_recursion_depth: rt_props.max_ray_recursion_depth,
            min_scratch_offset_alignment: accel_props.min_acceleration_structure_scratch_offset_alignment,
            max_instance_count: accel_props.max_instance_count,
        }
    }

    /// Create logical device with the ray tracing features enabled.
    unsafe fn create_logical_device(
        instance: &Instance,
        physical_device: vk::PhysicalDevice,
        queue_family: u32,
    ) -> Result<Device, String> {
        let priority = [1.0f32];
        let queue_info = [vk::DeviceQueueCreateInfo::default()
            .queue_family_index(queue_family)
            .queue_priorities(&priority)];

        let extension_names: Vec<*const c_char> = DEVICE_EXTENSIONS.iter().map(|name| name.as_ptr()).collect();

        let mut address_features = vk::PhysicalDeviceVulkan12Features::default().buffer_device_address(true);
        let mut as_features = vk::PhysicalDeviceAccelerationStructureFeaturesKHR::default().acceleration_structure(true);
        let mut pipeline_features = vk::PhysicalDeviceRayTracingPipelineFeaturesKHR::default().ray_tracing_pipeline(true);
        let mut features = vk::PhysicalDeviceFeatures2::default()
            .push_next(&mut address_features)
            .push_next(&mut as_features)
            .push_next(&mut pipeline_features);

        let create_info = vk::DeviceCreateInfo::default()
            .queue_create_infos(&queue_info)
            .enabled_extension_names(&extension_names)
            .push_next(&mut features);

        instance
            .create_device(physical_device, &create_info, None)
            .map_err(|e| format!("Failed to create logical device: {:?}", e))
    }

    /// Wait for all device operations to complete.
    pub fn wait_idle(&self) -> Result<(), String> {
        unsafe {
            self.device
                .device_wait_idle()
                .map_err(|e| format!("Failed to wait for device idle: {:?}", e))
        }
    }
}

impl Drop for VulkanContext {
    fn drop(&mut self) {
        unsafe {
            if let Err(e) = self.wait_idle() {
                log::warn!("{}", e);
            }

            if let Some(debug) = self.debug.take() {
                debug.destroy();
            }

            self.device.destroy_device(None);
            self.instance.destroy_instance(None);
        }
    }
}

/// Fail early on loaders that predate the required core version.
fn check_instance_version(entry: &Entry) -> Result<(), String> {
    let version = unsafe { entry.try_enumerate_instance_version() }
        .map_err(|e| format!("Failed to enumerate instance version: {:?}", e))?
        .unwrap_or(vk::API_VERSION_1_0);

    if version < REQUIRED_VK_VERSION {
        return Err(format!(
            "Vulkan {}.{} or newer required, loader reports {}.{}",
            vk::api_version_major(REQUIRED_VK_VERSION),
            vk::api_version_minor(REQUIRED_VK_VERSION),
            vk::api_version_major(version),
            vk::api_version_minor(version)
        ));
    }
    Ok(())
}

unsafe extern "system" fn debug_callback(
    severity: vk::DebugUtilsMessageSeverityFlagsEXT,
    _ty: vk::DebugUtilsMessageTypeFlagsEXT,
    data: *const vk::DebugUtilsMessengerCallbackDataEXT<'_>,
    _user_data: *mut std::ffi::c_void,
) -> vk::Bool32 {
    let message = CStr::from_ptr((*data).p_message).to_string_lossy();
    let level = if severity.contains(vk::DebugUtilsMessageSeverityFlagsEXT::ERROR) {
        log::Level::Error
    } else {
        log::Level::Warn
    };
    log::log!(target: "fluid_rtx::validation", level, "{}", message);

    vk::FALSE
}
