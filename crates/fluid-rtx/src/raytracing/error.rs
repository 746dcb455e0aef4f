//! Error type shared by the ray tracing layer.

use super::instance_table::InstanceHandle;
use super::sbt::GroupType;
use super::scene::MeshHandle;

pub type Result<T> = std::result::Result<T, RtError>;

/// Failures reported by acceleration structure and pipeline operations.
///
/// Capacity exhaustion of the instance table is not an error; see
/// [`super::Tlas::add_instance`].
#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum RtError {
    /// Device object or buffer creation failed. Fatal at setup time.
    #[error("device error: {0}")]
    Device(String),

    #[error("unknown instance handle {0:?}")]
    UnknownInstance(InstanceHandle),

    #[error("unknown mesh {0:?}")]
    UnknownMesh(MeshHandle),

    #[error("geometry cannot be added after the structure was created")]
    GeometryLocked,

    #[error("acceleration structure already created")]
    AlreadyCreated,

    #[error("geometry index {index} out of range ({count} geometries)")]
    GeometryIndexOutOfRange { index: usize, count: usize },

    #[error("primitive count {requested} exceeds the {sized} primitives the structure was sized for")]
    PrimitiveCountTooLarge { requested: u32, sized: u32 },

    #[error("acceleration structure has no valid handle")]
    InvalidHandle,

    #[error("required shader groups missing (ray_gen present: {ray_gen}, miss present: {miss}, hit present: {hit})")]
    MissingShaderGroups { ray_gen: bool, miss: bool, hit: bool },

    #[error("{group:?} record of {size} bytes exceeds the group maximum of {max} bytes")]
    RecordTooLarge { group: GroupType, size: usize, max: usize },

    #[error("{group:?} record index {index} out of range ({count} entries)")]
    RecordIndexOutOfRange { group: GroupType, index: u32, count: usize },

    #[error("ray generation index {index} out of range ({count} entries)")]
    RayGenIndexOutOfRange { index: u32, count: usize },

    #[error("pipeline already built")]
    PipelineAlreadyBuilt,

    #[error("pipeline not built")]
    PipelineNotBuilt,

    #[error("invalid shader code: {0}")]
    InvalidShader(String),

    #[error("hit group has no shader stage")]
    EmptyHitGroup,

    #[error("structure was destroyed")]
    Destroyed,
}

impl From<String> for RtError {
    fn from(message: String) -> Self {
        RtError::Device(message)
    }
}
