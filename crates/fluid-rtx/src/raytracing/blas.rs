//! Bottom-level acceleration structures.

use ash::vk;
use gpu_allocator::MemoryLocation;

use super::device::{BufferDesc, BuildSizes, DeviceBuffer, RtDevice};
use super::error::{Result, RtError};

#[derive(Clone, Copy)]
struct GeometryEntry {
    geometry: vk::AccelerationStructureGeometryKHR<'static>,
    range: vk::AccelerationStructureBuildRangeInfoKHR,
}

/// Bottom-level acceleration structure (BLAS) over one mesh.
///
/// Geometry is collected with the `add_*` calls and frozen by [`Blas::create`].
/// Afterwards only the primitive counts may change, and never above the counts
/// the structure was sized for.
pub struct Blas<D: RtDevice> {
    geometries: Vec<GeometryEntry>,
    sized_counts: Vec<u32>,
    flags: vk::BuildAccelerationStructureFlagsKHR,
    handle: vk::AccelerationStructureKHR,
    buffer: Option<D::Buffer>,
    device_address: vk::DeviceAddress,
    sizes: BuildSizes,
    built: bool,
    counts_changed: bool,
    destroyed: bool,
}

impl<D: RtDevice> Default for Blas<D> {
    fn default() -> Self {
        Self::new()
    }
}

impl<D: RtDevice> Blas<D> {
    pub fn new() -> Self {
        Self {
            geometries: Vec::new(),
            sized_counts: Vec::new(),
            flags: vk::BuildAccelerationStructureFlagsKHR::empty(),
            handle: vk::AccelerationStructureKHR::null(),
            buffer: None,
            device_address: 0,
            sizes: BuildSizes::default(),
            built: false,
            counts_changed: false,
            destroyed: false,
        }
    }

    /// Append a geometry descriptor and return its index.
    pub fn add_geometry(
        &mut self,
        data: vk::AccelerationStructureGeometryDataKHR<'static>,
        ty: vk::GeometryTypeKHR,
        range: vk::AccelerationStructureBuildRangeInfoKHR,
        flags: vk::GeometryFlagsKHR,
    ) -> Result<usize> {
        if self.is_created() || self.destroyed {
            log::error!("Cannot add geometry to a BLAS that was already created");
            return Err(RtError::GeometryLocked);
        }

        let geometry = vk::AccelerationStructureGeometryKHR::default()
            .geometry_type(ty)
            .geometry(data)
            .flags(flags);

        self.geometries.push(GeometryEntry { geometry, range });
        Ok(self.geometries.len() - 1)
    }

    /// Add an indexed triangle mesh with `R32G32B32_SFLOAT` positions and
    /// `u32` indices.
    #[allow(clippy::too_many_arguments)]
    pub fn add_triangles(
        &mut self,
        vertex_address: vk::DeviceAddress,
        vertex_stride: vk::DeviceSize,
        vertex_count: u32,
        index_address: vk::DeviceAddress,
        index_count: u32,
        flags: vk::GeometryFlagsKHR,
    ) -> Result<usize> {
        let triangles = vk::AccelerationStructureGeometryTrianglesDataKHR::default()
            .vertex_format(vk::Format::R32G32B32_SFLOAT)
            .vertex_data(vk::DeviceOrHostAddressConstKHR { device_address: vertex_address })
            .vertex_stride(vertex_stride)
            .max_vertex(vertex_count.saturating_sub(1))
            .index_type(vk::IndexType::UINT32)
            .index_data(vk::DeviceOrHostAddressConstKHR { device_address: index_address });

        let range = vk::AccelerationStructureBuildRangeInfoKHR::default().primitive_count(index_count / 3);

        self.add_geometry(
            vk::AccelerationStructureGeometryDataKHR { triangles },
            vk::GeometryTypeKHR::TRIANGLES,
            range,
            flags,
        )
    }

    /// Add procedural geometry as an array of `VkAabbPositionsKHR`.
    pub fn add_aabbs(
        &mut self,
        aabb_address: vk::DeviceAddress,
        stride: vk::DeviceSize,
        count: u32,
        flags: vk::GeometryFlagsKHR,
    ) -> Result<usize> {
        let aabbs = vk::AccelerationStructureGeometryAabbsDataKHR::default()
            .data(vk::DeviceOrHostAddressConstKHR { device_address: aabb_address })
            .stride(stride);

        let range = vk::AccelerationStructureBuildRangeInfoKHR::default().primitive_count(count);

        self.add_geometry(
            vk::AccelerationStructureGeometryDataKHR { aabbs },
            vk::GeometryTypeKHR::AABBS,
            range,
            flags,
        )
    }

    /// Change how many primitives of a geometry the next build consumes.
    ///
    /// Used by meshes generated on the GPU every frame. After creation the
    /// count may not exceed the one the structure was sized for.
    pub fn set_primitive_count(&mut self, geometry: usize, count: u32) -> Result<()> {
        let total = self.geometries.len();
        let entry = self
            .geometries
            .get_mut(geometry)
            .ok_or(RtError::GeometryIndexOutOfRange { index: geometry, count: total })?;

        if let Some(&sized) = self.sized_counts.get(geometry) {
            if count > sized {
                return Err(RtError::PrimitiveCountTooLarge { requested: count, sized });
            }
        }

        if entry.range.primitive_count != count {
            entry.range.primitive_count = count;
            self.counts_changed = true;
        }
        Ok(())
    }

    /// Query build sizes, allocate the backing buffer and create the
    /// structure object.
    pub fn create(&mut self, device: &D, flags: vk::BuildAccelerationStructureFlagsKHR) -> Result<()> {
        if self.destroyed {
            return Err(RtError::Destroyed);
        }
        if self.is_created() {
            return Err(RtError::AlreadyCreated);
        }

        let geometries: Vec<_> = self.geometries.iter().map(|g| g.geometry).collect();
        let max_counts: Vec<u32> = self.geometries.iter().map(|g| g.range.primitive_count).collect();

        let info = vk::AccelerationStructureBuildGeometryInfoKHR::default()
            .ty(vk::AccelerationStructureTypeKHR::BOTTOM_LEVEL)
            .flags(flags)
            .mode(vk::BuildAccelerationStructureModeKHR::BUILD)
            .geometries(&geometries);

        let sizes = device.acceleration_structure_build_sizes(&info, &max_counts);
        log::debug!(
            "BLAS sizes: structure {} bytes, build scratch {}, update scratch {}",
            sizes.acceleration_structure_size,
            sizes.build_scratch_size,
            sizes.update_scratch_size
        );

        let buffer = device
            .create_buffer(&BufferDesc {
                size: sizes.acceleration_structure_size,
                usage: vk::BufferUsageFlags::ACCELERATION_STRUCTURE_STORAGE_KHR
                    | vk::BufferUsageFlags::SHADER_DEVICE_ADDRESS,
                location: MemoryLocation::GpuOnly,
                name: "blas_buffer",
            })
            .map_err(|e| {
                log::error!("Failed to create BLAS buffer: {}", e);
                e
            })?;

        let create_info = vk::AccelerationStructureCreateInfoKHR::default()
            .buffer(buffer.handle())
            .size(sizes.acceleration_structure_size)
            .ty(vk::AccelerationStructureTypeKHR::BOTTOM_LEVEL);

        let handle = match device.create_acceleration_structure(&create_info) {
            Ok(handle) => handle,
            Err(e) => {
                log::error!("Failed to create BLAS: {}", e);
                device.destroy_buffer(buffer);
                return Err(e);
            }
        };

        self.flags = flags;
        self.sized_counts = max_counts;
        self.sizes = sizes;
        self.handle = handle;
        self.buffer = Some(buffer);
        self.device_address = device.acceleration_structure_address(handle);
        Ok(())
    }

    /// Record a build into `cmd`.
    ///
    /// Refits in place when the structure was already built with
    /// `ALLOW_UPDATE` and its primitive counts did not change since.
    pub fn build(&mut self, device: &D, cmd: vk::CommandBuffer, scratch_address: vk::DeviceAddress) -> Result<()> {
        if self.destroyed {
            log::warn!("Build requested on a destroyed BLAS");
            return Err(RtError::Destroyed);
        }
        if self.handle == vk::AccelerationStructureKHR::null() {
            log::error!("Cannot build a BLAS that was never created");
            return Err(RtError::InvalidHandle);
        }

        let update = self.built
            && !self.counts_changed
            && self.flags.contains(vk::BuildAccelerationStructureFlagsKHR::ALLOW_UPDATE);

        let (mode, src) = if update {
            (vk::BuildAccelerationStructureModeKHR::UPDATE, self.handle)
        } else {
            (vk::BuildAccelerationStructureModeKHR::BUILD, vk::AccelerationStructureKHR::null())
        };

        let geometries: Vec<_> = self.geometries.iter().map(|g| g.geometry).collect();
        let ranges: Vec<_> = self.geometries.iter().map(|g| g.range).collect();

        let info = vk::AccelerationStructureBuildGeometryInfoKHR::default()
            .ty(vk::AccelerationStructureTypeKHR::BOTTOM_LEVEL)
            .flags(self.flags)
            .mode(mode)
            .src_acceleration_structure(src)
            .dst_acceleration_structure(self.handle)
            .geometries(&geometries)
            .scratch_data(vk::DeviceOrHostAddressKHR { device_address: scratch_address });

        device.cmd_build_acceleration_structure(cmd, &info, &ranges);

        self.built = true;
        self.counts_changed = false;
        Ok(())
    }

    /// Release the structure and its buffer. Safe to call repeatedly.
    pub fn destroy(&mut self, device: &D) {
        if self.handle != vk::AccelerationStructureKHR::null() {
            device.destroy_acceleration_structure(self.handle);
            self.handle = vk::AccelerationStructureKHR::null();
        }
        if let Some(buffer) = self.buffer.take() {
            device.destroy_buffer(buffer);
        }
        self.device_address = 0;
        self.built = false;
        self.destroyed = true;
    }

    pub fn handle(&self) -> vk::AccelerationStructureKHR {
        self.handle
    }

    pub fn device_address(&self) -> vk::DeviceAddress {
        self.device_address
    }

    pub fn build_sizes(&self) -> BuildSizes {
        self.sizes
    }

    /// Scratch needed for either a build or an update; 0 before creation.
    pub fn scratch_size(&self) -> vk::DeviceSize {
        self.sizes.scratch_size()
    }

    pub fn geometry_count(&self) -> usize {
        self.geometries.len()
    }

    pub fn primitive_count(&self, geometry: usize) -> Option<u32> {
        self.geometries.get(geometry).map(|g| g.range.primitive_count)
    }

    pub fn is_created(&self) -> bool {
        self.handle != vk::AccelerationStructureKHR::null()
    }

    pub fn is_built(&self) -> bool {
        self.built
    }
}
