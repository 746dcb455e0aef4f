//! Top-level instance records.

use ash::vk;
use bytemuck::{Pod, Zeroable};
use glam::Affine3A;

/// Row-major 3x4 identity.
pub const IDENTITY_ROWS: [[f32; 4]; 3] = [
    [1.0, 0.0, 0.0, 0.0],
    [0.0, 1.0, 0.0, 0.0],
    [0.0, 0.0, 1.0, 0.0],
];

const LOW_24: u32 = 0x00FF_FFFF;

fn pack(low: u32, high: u8) -> u32 {
    ((high as u32) << 24) | (low & LOW_24)
}

/// One slot of the TLAS instance buffer.
///
/// Binary compatible with `VkAccelerationStructureInstanceKHR` (64 bytes).
/// An all-zero record is an empty slot: it references no BLAS and has a
/// zero visibility mask.
#[repr(C)]
#[derive(Clone, Copy, Debug, PartialEq, Pod, Zeroable)]
pub struct RtInstance {
    pub transform: [[f32; 4]; 3],
    /// Custom index (low 24 bits) and visibility mask (high 8 bits)
    pub index_mask: u32,
    /// Hit group offset (low 24 bits) and instance flags (high 8 bits)
    pub sbt_offset_flags: u32,
    pub blas_address: vk::DeviceAddress,
}

/// Identity placement, visible to every ray, no BLAS yet.
impl Default for RtInstance {
    fn default() -> Self {
        Self::new(IDENTITY_ROWS, 0, 0)
    }
}

impl RtInstance {
    /// An empty slot.
    pub fn empty() -> Self {
        Self::zeroed()
    }

    /// Instance of the BLAS at `blas_address`, visible to every ray.
    /// Only the low 24 bits of `custom_index` are kept.
    pub fn new(transform: [[f32; 4]; 3], custom_index: u32, blas_address: vk::DeviceAddress) -> Self {
        Self {
            transform,
            index_mask: pack(custom_index, 0xFF),
            sbt_offset_flags: 0,
            blas_address,
        }
    }

    pub fn with_mask(self, mask: u8) -> Self {
        Self {
            index_mask: pack(self.custom_index(), mask),
            ..self
        }
    }

    /// Select the hit group and set the instance flags.
    pub fn with_sbt_offset(self, offset: u32, flags: vk::GeometryInstanceFlagsKHR) -> Self {
        Self {
            sbt_offset_flags: pack(offset, flags.as_raw() as u8),
            ..self
        }
    }

    pub fn custom_index(&self) -> u32 {
        self.index_mask & LOW_24
    }

    pub fn mask(&self) -> u8 {
        (self.index_mask >> 24) as u8
    }

    pub fn sbt_offset(&self) -> u32 {
        self.sbt_offset_flags & LOW_24
    }

    pub fn flags(&self) -> vk::GeometryInstanceFlagsKHR {
        vk::GeometryInstanceFlagsKHR::from_raw(self.sbt_offset_flags >> 24)
    }

    pub fn is_empty(&self) -> bool {
        self.blas_address == 0
    }
}

/// Convert an affine transform into the row-major 3x4 matrix the
/// acceleration structure expects.
pub fn transform_rows(affine: &Affine3A) -> [[f32; 4]; 3] {
    let x = affine.matrix3.x_axis;
    let y = affine.matrix3.y_axis;
    let z = affine.matrix3.z_axis;
    let w = affine.translation;
    [
        [x.x, y.x, z.x, w.x],
        [x.y, y.y, z.y, w.y],
        [x.z, y.z, z.z, w.z],
    ]
}

#[cfg(test)]
mod tests {
    use super::*;
    use glam::{Quat, Vec3};

    // ============================================================
    // Layout
    // ============================================================

    #[test]
    fn test_instance_is_64_bytes() {
        assert_eq!(std::mem::size_of::<RtInstance>(), 64);
        assert_eq!(
            std::mem::size_of::<RtInstance>(),
            std::mem::size_of::<vk::AccelerationStructureInstanceKHR>()
        );
    }

    #[test]
    fn test_empty_instance_is_all_zero() {
        let empty = RtInstance::empty();
        assert!(bytemuck::bytes_of(&empty).iter().all(|&b| b == 0));
        assert!(empty.is_empty());
        assert_eq!(empty.mask(), 0);
    }

    // ============================================================
    // Packing
    // ============================================================

    #[test]
    fn test_new_packs_custom_index_and_full_mask() {
        let inst = RtInstance::new(IDENTITY_ROWS, 0x12_3456, 0xBEEF);
        assert_eq!(inst.custom_index(), 0x12_3456);
        assert_eq!(inst.mask(), 0xFF);
        assert_eq!(inst.blas_address, 0xBEEF);
    }

    #[test]
    fn test_custom_index_truncated_to_24_bits() {
        let inst = RtInstance::new(IDENTITY_ROWS, 0xFF12_3456, 1);
        assert_eq!(inst.custom_index(), 0x12_3456);
        assert_eq!(inst.mask(), 0xFF);
    }

    #[test]
    fn test_with_mask_keeps_custom_index() {
        let inst = RtInstance::new(IDENTITY_ROWS, 7, 1).with_mask(0x0F);
        assert_eq!(inst.mask(), 0x0F);
        assert_eq!(inst.custom_index(), 7);
    }

    #[test]
    fn test_with_sbt_offset_packs_flags() {
        let inst = RtInstance::default()
            .with_sbt_offset(3, vk::GeometryInstanceFlagsKHR::TRIANGLE_FACING_CULL_DISABLE);
        assert_eq!(inst.sbt_offset(), 3);
        assert_eq!(inst.flags(), vk::GeometryInstanceFlagsKHR::TRIANGLE_FACING_CULL_DISABLE);
        assert_eq!(inst.mask(), 0xFF);
    }

    // ============================================================
    // transform_rows
    // ============================================================

    #[test]
    fn test_identity_transform_rows() {
        assert_eq!(transform_rows(&Affine3A::IDENTITY), IDENTITY_ROWS);
    }

    #[test]
    fn test_translation_lands_in_last_column() {
        let rows = transform_rows(&Affine3A::from_translation(Vec3::new(1.0, 2.0, 3.0)));
        assert_eq!(rows[0][3], 1.0);
        assert_eq!(rows[1][3], 2.0);
        assert_eq!(rows[2][3], 3.0);
    }

    #[test]
    fn test_rows_transform_points_like_affine() {
        let affine = Affine3A::from_scale_rotation_translation(
            Vec3::new(2.0, 1.0, 0.5),
            Quat::from_rotation_y(0.7),
            Vec3::new(-1.0, 4.0, 2.0),
        );
        let rows = transform_rows(&affine);
        let p = Vec3::new(0.3, -1.2, 5.0);
        let expected = affine.transform_point3(p);
        for (i, row) in rows.iter().enumerate() {
            let got = row[0] * p.x + row[1] * p.y + row[2] * p.z + row[3];
            assert!((got - expected[i]).abs() < 1e-5);
        }
    }
}
