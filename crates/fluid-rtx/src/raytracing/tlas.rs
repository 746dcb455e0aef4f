//! Top-level acceleration structure over a dynamic instance table.

use std::mem::size_of;
use std::slice;

use ash::vk;
use bytemuck::Pod;
use glam::Affine3A;
use gpu_allocator::MemoryLocation;

use super::blas::Blas;
use super::device::{BufferDesc, BuildSizes, DeviceBuffer, RtDevice};
use super::error::{Result, RtError};
use super::instance::{transform_rows, RtInstance};
use super::instance_table::{InstanceHandle, InstanceTable};

/// Top-level acceleration structure (TLAS) with a per-instance payload of
/// type `T`.
///
/// Instances are edited on the CPU through opaque handles. [`Tlas::build`]
/// compacts the table, uploads only the slots touched since the previous
/// build and records the structure build. The payload array is mirrored into
/// a device-local storage buffer indexed by `gl_InstanceID`.
pub struct Tlas<D: RtDevice, T> {
    table: InstanceTable<T>,
    flags: vk::BuildAccelerationStructureFlagsKHR,
    geometry: vk::AccelerationStructureGeometryKHR<'static>,
    handle: vk::AccelerationStructureKHR,
    device_address: vk::DeviceAddress,
    as_buffer: Option<D::Buffer>,
    instance_buffer: Option<D::Buffer>,
    payload_staging: Option<D::Buffer>,
    payload_buffer: Option<D::Buffer>,
    sizes: BuildSizes,
    built: bool,
    last_primitive_count: u32,
    destroyed: bool,
}

impl<D: RtDevice, T: Pod> Default for Tlas<D, T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<D: RtDevice, T: Pod> Tlas<D, T> {
    pub fn new() -> Self {
        Self {
            table: InstanceTable::new(0),
            flags: vk::BuildAccelerationStructureFlagsKHR::empty(),
            geometry: vk::AccelerationStructureGeometryKHR::default(),
            handle: vk::AccelerationStructureKHR::null(),
            device_address: 0,
            as_buffer: None,
            instance_buffer: None,
            payload_staging: None,
            payload_buffer: None,
            sizes: BuildSizes::default(),
            built: false,
            last_primitive_count: 0,
            destroyed: false,
        }
    }

    /// Allocate buffers and the structure object for `max_instances` slots.
    ///
    /// Calling this on a created TLAS releases the old resources first and
    /// starts over with an empty table. The instance buffer is zero-filled, so
    /// slots that were never written read as empty instances.
    pub fn create(
        &mut self,
        device: &D,
        max_instances: u32,
        flags: vk::BuildAccelerationStructureFlagsKHR,
    ) -> Result<()> {
        if self.is_created() {
            self.destroy(device);
        }
        self.destroyed = false;
        self.built = false;
        self.last_primitive_count = 0;
        self.flags = flags;

        if let Err(e) = self.allocate(device, max_instances) {
            log::error!("Failed to create TLAS for {} instances: {}", max_instances, e);
            self.release(device);
            return Err(e);
        }

        self.table = InstanceTable::new(max_instances);
        Ok(())
    }

    fn allocate(&mut self, device: &D, max_instances: u32) -> Result<()> {
        let instance_bytes = max_instances as u64 * size_of::<RtInstance>() as u64;
        let payload_bytes = max_instances as u64 * size_of::<T>() as u64;

        let mut instances = device.create_buffer(&BufferDesc {
            size: instance_bytes,
            usage: vk::BufferUsageFlags::ACCELERATION_STRUCTURE_BUILD_INPUT_READ_ONLY_KHR
                | vk::BufferUsageFlags::SHADER_DEVICE_ADDRESS,
            location: MemoryLocation::CpuToGpu,
            name: "tlas_instances",
        })?;
        let zeroed = instances.write(0, &vec![0u8; instance_bytes as usize]);
        let instance_address = instances.device_address();
        self.instance_buffer = Some(instances);
        zeroed?;

        let mut staging = device.create_buffer(&BufferDesc {
            size: payload_bytes,
            usage: vk::BufferUsageFlags::TRANSFER_SRC,
            location: MemoryLocation::CpuToGpu,
            name: "tlas_payload_staging",
        })?;
        let zeroed = staging.write(0, &vec![0u8; payload_bytes as usize]);
        self.payload_staging = Some(staging);
        zeroed?;

        self.payload_buffer = Some(device.create_buffer(&BufferDesc {
            size: payload_bytes,
            usage: vk::BufferUsageFlags::TRANSFER_DST
                | vk::BufferUsageFlags::STORAGE_BUFFER
                | vk::BufferUsageFlags::SHADER_DEVICE_ADDRESS,
            location: MemoryLocation::GpuOnly,
            name: "tlas_payload",
        })?);

        let instances_data = vk::AccelerationStructureGeometryInstancesDataKHR::default()
            .array_of_pointers(false)
            .data(vk::DeviceOrHostAddressConstKHR { device_address: instance_address });

        self.geometry = vk::AccelerationStructureGeometryKHR::default()
            .geometry_type(vk::GeometryTypeKHR::INSTANCES)
            .geometry(vk::AccelerationStructureGeometryDataKHR { instances: instances_data });

        let info = vk::AccelerationStructureBuildGeometryInfoKHR::default()
            .ty(vk::AccelerationStructureTypeKHR::TOP_LEVEL)
            .flags(self.flags)
            .mode(vk::BuildAccelerationStructureModeKHR::BUILD)
            .geometries(slice::from_ref(&self.geometry));

        self.sizes = device.acceleration_structure_build_sizes(&info, &[max_instances]);
        log::debug!(
            "TLAS sizes for {} instances: structure {} bytes, build scratch {}, update scratch {}",
            max_instances,
            self.sizes.acceleration_structure_size,
            self.sizes.build_scratch_size,
            self.sizes.update_scratch_size
        );

        let as_buffer = device.create_buffer(&BufferDesc {
            size: self.sizes.acceleration_structure_size,
            usage: vk::BufferUsageFlags::ACCELERATION_STRUCTURE_STORAGE_KHR
                | vk::BufferUsageFlags::SHADER_DEVICE_ADDRESS,
            location: MemoryLocation::GpuOnly,
            name: "tlas_buffer",
        })?;

        let create_info = vk::AccelerationStructureCreateInfoKHR::default()
            .buffer(as_buffer.handle())
            .size(self.sizes.acceleration_structure_size)
            .ty(vk::AccelerationStructureTypeKHR::TOP_LEVEL);
        self.as_buffer = Some(as_buffer);

        self.handle = device.create_acceleration_structure(&create_info)?;
        self.device_address = device.acceleration_structure_address(self.handle);
        Ok(())
    }

    // ------------------------------------------------------------
    // Instance lifecycle
    // ------------------------------------------------------------

    /// Add an instance record with its payload.
    ///
    /// Returns `None` when the table is full (or was never created).
    pub fn add_instance(&mut self, instance: RtInstance, payload: T) -> Option<InstanceHandle> {
        let handle = self.table.add(instance, payload);
        if handle.is_none() {
            log::warn!(
                "TLAS instance table full ({} instances), dropping add",
                self.table.max_instances()
            );
        }
        handle
    }

    /// Add an instance of `blas` placed by `transform`.
    pub fn add_blas_instance(
        &mut self,
        blas: &Blas<D>,
        transform: &Affine3A,
        payload: T,
        shader_offset: u32,
        custom_index: u32,
    ) -> Option<InstanceHandle> {
        let instance = RtInstance::new(transform_rows(transform), custom_index, blas.device_address())
            .with_sbt_offset(shader_offset, vk::GeometryInstanceFlagsKHR::empty());
        self.add_instance(instance, payload)
    }

    pub fn remove_instance(&mut self, handle: InstanceHandle) -> Result<()> {
        self.table.remove(handle)
    }

    pub fn set_instance_transform(&mut self, handle: InstanceHandle, transform: &Affine3A) -> Result<()> {
        self.table.set_transform(handle, transform_rows(transform))
    }

    /// Replace the whole instance record.
    pub fn set_instance(&mut self, handle: InstanceHandle, instance: RtInstance) -> Result<()> {
        *self.table.instance_mut(handle)? = instance;
        Ok(())
    }

    pub fn set_instance_data(&mut self, handle: InstanceHandle, payload: T) -> Result<()> {
        self.table.set_payload(handle, payload)
    }

    /// Include the instance in the next build although its record did not
    /// change, e.g. because the referenced BLAS was rebuilt.
    pub fn set_change_flag(&mut self, handle: InstanceHandle) -> Result<()> {
        self.table.mark_changed(handle)
    }

    pub fn clear_all_instances(&mut self) {
        self.table.clear();
    }

    pub fn instance(&self, handle: InstanceHandle) -> Result<&RtInstance> {
        self.table.instance(handle)
    }

    pub fn instance_data(&self, handle: InstanceHandle) -> Result<&T> {
        self.table.payload(handle)
    }

    pub fn contains(&self, handle: InstanceHandle) -> bool {
        self.table.contains(handle)
    }

    pub fn slot_of(&self, handle: InstanceHandle) -> Option<u32> {
        self.table.slot_of(handle)
    }

    pub fn instance_count(&self) -> u32 {
        self.table.instance_count()
    }

    pub fn max_instance_count(&self) -> u32 {
        self.table.max_instances()
    }

    pub fn table(&self) -> &InstanceTable<T> {
        &self.table
    }

    // ------------------------------------------------------------
    // Build
    // ------------------------------------------------------------

    /// Compact the table, upload the dirty slots and record the build.
    ///
    /// Does nothing when no slot changed since the previous build. The
    /// structure always spans the whole occupied prefix.
    pub fn build(&mut self, device: &D, cmd: vk::CommandBuffer, scratch_address: vk::DeviceAddress) -> Result<()> {
        if self.destroyed {
            log::warn!("Build requested on a destroyed TLAS");
            return Err(RtError::Destroyed);
        }
        if self.handle == vk::AccelerationStructureKHR::null() {
            log::error!("Cannot build a TLAS that was never created");
            return Err(RtError::InvalidHandle);
        }

        self.table.defragment();

        let Some(range) = self.table.dirty_range() else {
            return Ok(());
        };
        let (lo, hi) = (*range.start() as usize, *range.end() as usize);
        let count = hi - lo + 1;
        let stride = size_of::<T>();

        let (Some(instances), Some(staging), Some(payloads)) = (
            self.instance_buffer.as_mut(),
            self.payload_staging.as_mut(),
            self.payload_buffer.as_ref(),
        ) else {
            return Err(RtError::InvalidHandle);
        };

        instances.write(
            lo * size_of::<RtInstance>(),
            bytemuck::cast_slice(&self.table.instances()[lo..=hi]),
        )?;
        staging.write(lo * stride, bytemuck::cast_slice(&self.table.payloads()[lo..=hi]))?;

        let primitive_count = self.table.instance_count();
        let update = self.built
            && primitive_count == self.last_primitive_count
            && self.flags.contains(vk::BuildAccelerationStructureFlagsKHR::ALLOW_UPDATE);

        let (mode, src) = if update {
            (vk::BuildAccelerationStructureModeKHR::UPDATE, self.handle)
        } else {
            (vk::BuildAccelerationStructureModeKHR::BUILD, vk::AccelerationStructureKHR::null())
        };

        let info = vk::AccelerationStructureBuildGeometryInfoKHR::default()
            .ty(vk::AccelerationStructureTypeKHR::TOP_LEVEL)
            .flags(self.flags)
            .mode(mode)
            .src_acceleration_structure(src)
            .dst_acceleration_structure(self.handle)
            .geometries(slice::from_ref(&self.geometry))
            .scratch_data(vk::DeviceOrHostAddressKHR { device_address: scratch_address });

        let range_info = vk::AccelerationStructureBuildRangeInfoKHR::default().primitive_count(primitive_count);
        device.cmd_build_acceleration_structure(cmd, &info, &[range_info]);

        if stride > 0 {
            let offset = (lo * stride) as vk::DeviceSize;
            let region = vk::BufferCopy {
                src_offset: offset,
                dst_offset: offset,
                size: (count * stride) as vk::DeviceSize,
            };
            device.cmd_copy_buffer(cmd, staging, payloads, &[region]);
        }

        log::debug!(
            "TLAS build ({:?}): uploaded slots {}..={}, {} instances",
            mode,
            lo,
            hi,
            primitive_count
        );

        self.table.take_dirty_range();
        self.built = true;
        self.last_primitive_count = primitive_count;
        Ok(())
    }

    // ------------------------------------------------------------
    // Accessors
    // ------------------------------------------------------------

    pub fn handle(&self) -> vk::AccelerationStructureKHR {
        self.handle
    }

    pub fn device_address(&self) -> vk::DeviceAddress {
        self.device_address
    }

    /// Descriptor write payload for binding the structure.
    pub fn descriptor_info(&self) -> vk::WriteDescriptorSetAccelerationStructureKHR<'_> {
        vk::WriteDescriptorSetAccelerationStructureKHR::default()
            .acceleration_structures(slice::from_ref(&self.handle))
    }

    /// Descriptor info of the payload storage buffer.
    pub fn payload_descriptor_info(&self) -> vk::DescriptorBufferInfo {
        vk::DescriptorBufferInfo {
            buffer: self.payload_buffer.as_ref().map_or(vk::Buffer::null(), |b| b.handle()),
            offset: 0,
            range: vk::WHOLE_SIZE,
        }
    }

    pub fn payload_address(&self) -> vk::DeviceAddress {
        self.payload_buffer.as_ref().map_or(0, |b| b.device_address())
    }

    pub fn build_sizes(&self) -> BuildSizes {
        self.sizes
    }

    pub fn scratch_size(&self) -> vk::DeviceSize {
        self.sizes.scratch_size()
    }

    pub fn is_created(&self) -> bool {
        self.handle != vk::AccelerationStructureKHR::null()
    }

    pub fn is_built(&self) -> bool {
        self.built
    }

    /// Release every buffer and the structure object. Safe to call repeatedly.
    pub fn destroy(&mut self, device: &D) {
        self.release(device);
        self.table = InstanceTable::new(0);
        self.built = false;
        self.destroyed = true;
    }

    fn release(&mut self, device: &D) {
        if self.handle != vk::AccelerationStructureKHR::null() {
            device.destroy_acceleration_structure(self.handle);
            self.handle = vk::AccelerationStructureKHR::null();
        }
        self.device_address = 0;
        self.sizes = BuildSizes::default();
        self.geometry = vk::AccelerationStructureGeometryKHR::default();

        for buffer in [
            self.instance_buffer.take(),
            self.payload_staging.take(),
            self.payload_buffer.take(),
            self.as_buffer.take(),
        ]
        .into_iter()
        .flatten()
        {
            device.destroy_buffer(buffer);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::raytracing::mock::{Event, MockDevice};
    use bytemuck::Zeroable;
    use glam::Vec3;

    const CMD: vk::CommandBuffer = vk::CommandBuffer::null();
    const SCRATCH: vk::DeviceAddress = 0x5000;

    #[repr(C)]
    #[derive(Clone, Copy, Debug, PartialEq, Pod, Zeroable)]
    struct Payload {
        material: u32,
        scale: f32,
    }

    fn payload(material: u32) -> Payload {
        Payload { material, scale: 1.0 }
    }

    fn record(tag: u64) -> RtInstance {
        RtInstance::new(RtInstance::default().transform, tag as u32, 0x1000 * tag)
    }

    fn created(capacity: u32, flags: vk::BuildAccelerationStructureFlagsKHR) -> (MockDevice, Tlas<MockDevice, Payload>) {
        let device = MockDevice::new();
        let mut tlas = Tlas::new();
        tlas.create(&device, capacity, flags).unwrap();
        device.clear_events();
        (device, tlas)
    }

    fn slot_bytes(device: &MockDevice, slot: usize) -> Vec<u8> {
        device.contents("tlas_instances")[slot * 64..(slot + 1) * 64].to_vec()
    }

    fn build_event(device: &MockDevice) -> (vk::BuildAccelerationStructureModeKHR, Vec<u32>) {
        match device.builds().pop() {
            Some(Event::Build { mode, primitive_counts, .. }) => (mode, primitive_counts),
            other => panic!("expected a build, got {:?}", other),
        }
    }

    // ============================================================
    // Create
    // ============================================================

    #[test]
    fn test_create_allocates_all_buffers() {
        let device = MockDevice::new();
        let mut tlas: Tlas<MockDevice, Payload> = Tlas::new();
        tlas.create(&device, 16, vk::BuildAccelerationStructureFlagsKHR::PREFER_FAST_TRACE).unwrap();

        let created: Vec<_> = device
            .events()
            .into_iter()
            .filter_map(|e| match e {
                Event::CreateBuffer { name, size } => Some((name, size)),
                _ => None,
            })
            .collect();
        assert_eq!(
            created,
            vec![
                ("tlas_instances".to_string(), 16 * 64),
                ("tlas_payload_staging".to_string(), 16 * 8),
                ("tlas_payload".to_string(), 16 * 8),
                ("tlas_buffer".to_string(), 1024 + 64 * 16),
            ]
        );
        assert!(tlas.is_created());
        assert_eq!(tlas.max_instance_count(), 16);
        assert_eq!(tlas.scratch_size(), 512 + 32 * 16);
    }

    #[test]
    fn test_instance_buffer_zero_initialised() {
        let (device, _tlas) = created(8, vk::BuildAccelerationStructureFlagsKHR::empty());
        let contents = device.contents("tlas_instances");
        assert_eq!(contents.len(), 8 * 64);
        assert!(contents.iter().all(|&b| b == 0));
    }

    #[test]
    fn test_create_failure_releases_partial_resources() {
        let device = MockDevice::new();
        device.fail_buffer("tlas_buffer");
        let mut tlas: Tlas<MockDevice, Payload> = Tlas::new();
        assert!(tlas.create(&device, 4, vk::BuildAccelerationStructureFlagsKHR::empty()).is_err());

        let destroyed: Vec<_> = device
            .events()
            .into_iter()
            .filter_map(|e| match e {
                Event::DestroyBuffer { name } => Some(name),
                _ => None,
            })
            .collect();
        assert_eq!(destroyed, vec!["tlas_instances", "tlas_payload_staging", "tlas_payload"]);
        assert!(!tlas.is_created());
        assert!(tlas.add_instance(record(1), payload(1)).is_none());
    }

    #[test]
    fn test_recreate_starts_with_empty_table() {
        let (device, mut tlas) = created(4, vk::BuildAccelerationStructureFlagsKHR::empty());
        let h = tlas.add_instance(record(1), payload(1)).unwrap();
        tlas.create(&device, 8, vk::BuildAccelerationStructureFlagsKHR::empty()).unwrap();
        assert!(!tlas.contains(h));
        assert_eq!(tlas.max_instance_count(), 8);
        assert_eq!(tlas.instance_count(), 0);
    }

    // ============================================================
    // Build
    // ============================================================

    #[test]
    fn test_build_before_create_is_invalid() {
        let device = MockDevice::new();
        let mut tlas: Tlas<MockDevice, Payload> = Tlas::new();
        assert_eq!(tlas.build(&device, CMD, SCRATCH), Err(RtError::InvalidHandle));
    }

    #[test]
    fn test_build_with_no_changes_is_noop() {
        let (device, mut tlas) = created(8, vk::BuildAccelerationStructureFlagsKHR::empty());
        tlas.build(&device, CMD, SCRATCH).unwrap();
        assert!(device.events().is_empty());
        assert!(!tlas.is_built());
    }

    #[test]
    fn test_first_build_uploads_added_slots() {
        let (device, mut tlas) = created(8, vk::BuildAccelerationStructureFlagsKHR::empty());
        for i in 1..=3 {
            tlas.add_instance(record(i), payload(i as u32)).unwrap();
        }
        tlas.build(&device, CMD, SCRATCH).unwrap();

        assert_eq!(device.writes_to("tlas_instances"), vec![(0, 3 * 64)]);
        assert_eq!(device.writes_to("tlas_payload_staging"), vec![(0, 3 * 8)]);
        assert_eq!(build_event(&device), (vk::BuildAccelerationStructureModeKHR::BUILD, vec![3]));
        assert!(device.events().contains(&Event::Copy {
            src: "tlas_payload_staging".into(),
            dst: "tlas_payload".into(),
            regions: vec![(0, 0, 24)],
        }));
        assert_eq!(slot_bytes(&device, 2), bytemuck::bytes_of(&record(3)).to_vec());
    }

    #[test]
    fn test_second_build_without_mutation_touches_nothing() {
        let (device, mut tlas) = created(8, vk::BuildAccelerationStructureFlagsKHR::empty());
        tlas.add_instance(record(1), payload(1)).unwrap();
        tlas.build(&device, CMD, SCRATCH).unwrap();
        device.clear_events();

        tlas.build(&device, CMD, SCRATCH).unwrap();
        assert!(device.events().is_empty());
    }

    #[test]
    fn test_single_change_uploads_single_slot() {
        let (device, mut tlas) = created(8, vk::BuildAccelerationStructureFlagsKHR::empty());
        let hs: Vec<_> = (1..=5).map(|i| tlas.add_instance(record(i), payload(i as u32)).unwrap()).collect();
        tlas.build(&device, CMD, SCRATCH).unwrap();
        device.clear_events();

        tlas.set_change_flag(hs[2]).unwrap();
        tlas.build(&device, CMD, SCRATCH).unwrap();

        assert_eq!(device.writes_to("tlas_instances"), vec![(2 * 64, 64)]);
        assert_eq!(device.writes_to("tlas_payload_staging"), vec![(2 * 8, 8)]);
        assert_eq!(build_event(&device).1, vec![5]);
    }

    #[test]
    fn test_transform_change_is_uploaded() {
        let (device, mut tlas) = created(4, vk::BuildAccelerationStructureFlagsKHR::empty());
        let h = tlas.add_instance(record(1), payload(1)).unwrap();
        tlas.build(&device, CMD, SCRATCH).unwrap();

        let moved = Affine3A::from_translation(Vec3::new(3.0, 0.0, -2.0));
        tlas.set_instance_transform(h, &moved).unwrap();
        tlas.build(&device, CMD, SCRATCH).unwrap();

        let uploaded: RtInstance = *bytemuck::from_bytes(&slot_bytes(&device, 0));
        assert_eq!(uploaded.transform, transform_rows(&moved));
    }

    #[test]
    fn test_removal_compacts_before_upload() {
        let (device, mut tlas) = created(8, vk::BuildAccelerationStructureFlagsKHR::empty());
        let hs: Vec<_> = (1..=5).map(|i| tlas.add_instance(record(i), payload(i as u32)).unwrap()).collect();
        tlas.build(&device, CMD, SCRATCH).unwrap();
        device.clear_events();

        tlas.remove_instance(hs[1]).unwrap();
        tlas.build(&device, CMD, SCRATCH).unwrap();

        assert_eq!(tlas.slot_of(hs[4]), Some(1));
        assert_eq!(device.writes_to("tlas_instances"), vec![(64, 4 * 64)]);
        assert_eq!(build_event(&device).1, vec![4]);
        assert_eq!(slot_bytes(&device, 1), bytemuck::bytes_of(&record(5)).to_vec());
        assert!(slot_bytes(&device, 4).iter().all(|&b| b == 0));
    }

    #[test]
    fn test_payload_reaches_device_buffer() {
        let (device, mut tlas) = created(4, vk::BuildAccelerationStructureFlagsKHR::empty());
        let _a = tlas.add_instance(record(1), payload(1)).unwrap();
        let b = tlas.add_instance(record(2), payload(2)).unwrap();
        tlas.build(&device, CMD, SCRATCH).unwrap();

        tlas.set_instance_data(b, payload(77)).unwrap();
        tlas.build(&device, CMD, SCRATCH).unwrap();

        let device_payloads = device.contents("tlas_payload");
        let slot: &Payload = bytemuck::from_bytes(&device_payloads[8..16]);
        assert_eq!(*slot, payload(77));
        assert_eq!(*tlas.instance_data(b).unwrap(), payload(77));
    }

    #[test]
    fn test_update_mode_requires_unchanged_count() {
        let (device, mut tlas) = created(8, vk::BuildAccelerationStructureFlagsKHR::ALLOW_UPDATE);
        let h = tlas.add_instance(record(1), payload(1)).unwrap();
        tlas.build(&device, CMD, SCRATCH).unwrap();
        assert_eq!(build_event(&device).0, vk::BuildAccelerationStructureModeKHR::BUILD);

        tlas.set_instance_transform(h, &Affine3A::from_translation(Vec3::X)).unwrap();
        tlas.build(&device, CMD, SCRATCH).unwrap();
        assert_eq!(build_event(&device).0, vk::BuildAccelerationStructureModeKHR::UPDATE);
        assert!(matches!(device.builds().pop(), Some(Event::Build { updates_in_place: true, .. })));

        tlas.add_instance(record(2), payload(2)).unwrap();
        tlas.build(&device, CMD, SCRATCH).unwrap();
        assert_eq!(build_event(&device), (vk::BuildAccelerationStructureModeKHR::BUILD, vec![2]));
    }

    #[test]
    fn test_capacity_four_scenario() {
        let (device, mut tlas) = created(4, vk::BuildAccelerationStructureFlagsKHR::empty());
        let a = tlas.add_instance(record(1), payload(1)).unwrap();
        let b = tlas.add_instance(record(2), payload(2)).unwrap();
        let c = tlas.add_instance(record(3), payload(3)).unwrap();
        let d = tlas.add_instance(record(4), payload(4)).unwrap();
        assert!(tlas.add_instance(record(5), payload(5)).is_none());

        tlas.remove_instance(b).unwrap();
        let f = tlas.add_instance(record(6), payload(6)).unwrap();
        assert_eq!(tlas.slot_of(f), Some(1));

        tlas.build(&device, CMD, SCRATCH).unwrap();
        assert_eq!(tlas.instance_count(), 4);
        for (h, slot) in [(a, 0), (f, 1), (c, 2), (d, 3)] {
            assert_eq!(tlas.slot_of(h), Some(slot));
        }
        assert!(!tlas.contains(b));
    }

    #[test]
    fn test_clear_all_instances_zeroes_uploaded_prefix() {
        let (device, mut tlas) = created(4, vk::BuildAccelerationStructureFlagsKHR::empty());
        for i in 1..=3 {
            tlas.add_instance(record(i), payload(i as u32)).unwrap();
        }
        tlas.build(&device, CMD, SCRATCH).unwrap();
        tlas.clear_all_instances();
        tlas.build(&device, CMD, SCRATCH).unwrap();

        assert_eq!(build_event(&device).1, vec![0]);
        assert!(device.contents("tlas_instances").iter().all(|&b| b == 0));
    }

    // ============================================================
    // Handles
    // ============================================================

    #[test]
    fn test_unknown_handle_is_reported() {
        let (_device, mut tlas) = created(4, vk::BuildAccelerationStructureFlagsKHR::empty());
        let h = tlas.add_instance(record(1), payload(1)).unwrap();
        tlas.remove_instance(h).unwrap();
        assert_eq!(tlas.remove_instance(h), Err(RtError::UnknownInstance(h)));
        assert_eq!(tlas.set_change_flag(h), Err(RtError::UnknownInstance(h)));
        assert_eq!(
            tlas.set_instance_transform(h, &Affine3A::IDENTITY),
            Err(RtError::UnknownInstance(h))
        );
    }

    #[test]
    fn test_add_blas_instance_references_blas() {
        let (device, mut tlas) = created(4, vk::BuildAccelerationStructureFlagsKHR::empty());
        let mut blas = Blas::new();
        blas.add_triangles(0x100, 12, 3, 0x200, 3, vk::GeometryFlagsKHR::OPAQUE).unwrap();
        blas.create(&device, vk::BuildAccelerationStructureFlagsKHR::empty()).unwrap();

        let transform = Affine3A::from_translation(Vec3::new(1.0, 2.0, 3.0));
        let h = tlas.add_blas_instance(&blas, &transform, payload(9), 2, 42).unwrap();
        let inst = tlas.instance(h).unwrap();
        assert_eq!(inst.blas_address, blas.device_address());
        assert_eq!(inst.transform, transform_rows(&transform));
        assert_eq!(inst.sbt_offset(), 2);
        assert_eq!(inst.custom_index(), 42);
        assert_eq!(inst.mask(), 0xFF);
    }

    // ============================================================
    // Accessors / destroy
    // ============================================================

    #[test]
    fn test_descriptor_accessors() {
        let (_device, tlas) = created(4, vk::BuildAccelerationStructureFlagsKHR::empty());
        let write = tlas.descriptor_info();
        assert_eq!(write.acceleration_structure_count, 1);
        let info = tlas.payload_descriptor_info();
        assert_ne!(info.buffer, vk::Buffer::null());
        assert_eq!(info.range, vk::WHOLE_SIZE);
        assert_ne!(tlas.payload_address(), 0);
    }

    #[test]
    fn test_destroy_is_idempotent() {
        let (device, mut tlas) = created(4, vk::BuildAccelerationStructureFlagsKHR::empty());
        tlas.destroy(&device);
        let first = device.events();
        assert_eq!(
            first.iter().filter(|e| matches!(e, Event::DestroyBuffer { .. })).count(),
            4
        );
        assert!(first.contains(&Event::DestroyAccelerationStructure));

        device.clear_events();
        tlas.destroy(&device);
        assert!(device.events().is_empty());
        assert_eq!(tlas.build(&device, CMD, SCRATCH), Err(RtError::Destroyed));
        assert!(tlas.add_instance(record(1), payload(1)).is_none());
    }
}
