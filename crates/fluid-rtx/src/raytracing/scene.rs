//! Scene-facing facade over the acceleration structures.
//!
//! The scene graph owns transforms and calls into [`InstanceTarget`]; the
//! renderer calls [`RtScene::build_frame`] once per frame before tracing.

use std::collections::HashMap;

use ash::vk;
use bytemuck::Pod;
use glam::Affine3A;

use super::blas::Blas;
use super::build::{build_acceleration_structures, wait_as_build, wait_last_trace, AccelerationStructure};
use super::device::RtDevice;
use super::error::{Result, RtError};
use super::instance_table::InstanceHandle;
use super::scratch::ScratchAllocator;
use super::tlas::Tlas;
use crate::config::RtConfig;

/// Index of a mesh registered with [`RtScene::register_mesh`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct MeshHandle(pub usize);

/// Instance lifecycle as seen by the scene graph.
pub trait InstanceTarget {
    /// Place an instance of `mesh`. Returns `None` when the instance table is
    /// full or the mesh is unknown; the caller logs and drops the add.
    fn add_instance(&mut self, mesh: MeshHandle, transform: &Affine3A) -> Option<InstanceHandle>;

    fn remove_instance(&mut self, instance: InstanceHandle) -> Result<()>;

    fn set_instance_transform(&mut self, instance: InstanceHandle, transform: &Affine3A) -> Result<()>;

    /// Force the instance into the next top-level build.
    fn set_change_flag(&mut self, instance: InstanceHandle) -> Result<()>;
}

struct Mesh<D: RtDevice> {
    blas: Blas<D>,
    hit_group: u32,
    dynamic: bool,
}

/// Meshes, their instances and the scratch memory shared by their builds.
pub struct RtScene<D: RtDevice, T> {
    config: RtConfig,
    meshes: Vec<Mesh<D>>,
    tlas: Tlas<D, T>,
    instance_meshes: HashMap<InstanceHandle, MeshHandle>,
    scratch: ScratchAllocator<D>,
    created: bool,
}

impl<D: RtDevice, T: Pod> RtScene<D, T> {
    pub fn new(config: RtConfig) -> Self {
        Self {
            config,
            meshes: Vec::new(),
            tlas: Tlas::new(),
            instance_meshes: HashMap::new(),
            scratch: ScratchAllocator::new(),
            created: false,
        }
    }

    pub fn config(&self) -> &RtConfig {
        &self.config
    }

    pub fn is_created(&self) -> bool {
        self.created
    }

    /// Register a mesh whose instances use hit group `hit_group`.
    ///
    /// Meshes registered after [`RtScene::create`] are created right away and
    /// built with the next frame.
    pub fn register_mesh(&mut self, device: &D, mut blas: Blas<D>, hit_group: u32) -> Result<MeshHandle> {
        if self.created && !blas.is_created() {
            blas.create(device, self.config.blas_flags)?;
        }
        let handle = MeshHandle(self.meshes.len());
        self.meshes.push(Mesh {
            blas,
            hit_group,
            dynamic: false,
        });
        Ok(handle)
    }

    /// Rebuild `mesh` every frame.
    pub fn mark_dynamic(&mut self, mesh: MeshHandle, dynamic: bool) -> Result<()> {
        let Some(entry) = self.meshes.get_mut(mesh.0) else {
            log::error!("Cannot mark unknown mesh {:?} as dynamic", mesh);
            return Err(RtError::UnknownMesh(mesh));
        };
        entry.dynamic = dynamic;
        Ok(())
    }

    pub fn mesh(&self, mesh: MeshHandle) -> Option<&Blas<D>> {
        self.meshes.get(mesh.0).map(|m| &m.blas)
    }

    /// Mutable access, e.g. to update primitive counts of a generated mesh.
    pub fn mesh_mut(&mut self, mesh: MeshHandle) -> Option<&mut Blas<D>> {
        self.meshes.get_mut(mesh.0).map(|m| &mut m.blas)
    }

    pub fn mesh_count(&self) -> usize {
        self.meshes.len()
    }

    pub fn tlas(&self) -> &Tlas<D, T> {
        &self.tlas
    }

    /// Mesh an instance was created from.
    pub fn instance_mesh(&self, instance: InstanceHandle) -> Option<MeshHandle> {
        self.instance_meshes.get(&instance).copied()
    }

    /// Create every registered BLAS and the TLAS.
    pub fn create(&mut self, device: &D) -> Result<()> {
        if self.created {
            return Err(RtError::AlreadyCreated);
        }

        for mesh in self.meshes.iter_mut().filter(|m| !m.blas.is_created()) {
            mesh.blas.create(device, self.config.blas_flags)?;
        }
        self.tlas.create(device, self.config.max_instances, self.config.tlas_flags)?;
        self.created = true;

        log::info!(
            "Ray tracing scene created: {} meshes, {} instance slots",
            self.meshes.len(),
            self.config.max_instances
        );
        Ok(())
    }

    /// Add an instance carrying `payload`.
    pub fn add_instance_with_data(
        &mut self,
        mesh: MeshHandle,
        transform: &Affine3A,
        payload: T,
    ) -> Option<InstanceHandle> {
        let Some(entry) = self.meshes.get(mesh.0) else {
            log::error!("Instance of unknown mesh {:?} dropped", mesh);
            return None;
        };
        let handle = self
            .tlas
            .add_blas_instance(&entry.blas, transform, payload, entry.hit_group, mesh.0 as u32)?;
        self.instance_meshes.insert(handle, mesh);
        Some(handle)
    }

    pub fn set_instance_data(&mut self, instance: InstanceHandle, payload: T) -> Result<()> {
        self.tlas.set_instance_data(instance, payload)
    }

    /// Record this frame's structure builds.
    ///
    /// BLAS that were never built and BLAS of dynamic meshes are rebuilt;
    /// instances of dynamic meshes are flagged so the TLAS picks up their new
    /// geometry. Static meshes are left alone. The builds are fenced by a
    /// barrier against the previous frame's traces and one making the results
    /// visible to ray tracing shaders.
    pub fn build_frame(&mut self, device: &D, cmd: vk::CommandBuffer) -> Result<()> {
        if !self.created {
            log::error!("Cannot build a scene that was never created");
            return Err(RtError::InvalidHandle);
        }

        for (instance, mesh) in &self.instance_meshes {
            if self.meshes[mesh.0].dynamic {
                self.tlas.set_change_flag(*instance)?;
            }
        }

        let mut blas: Vec<&mut dyn AccelerationStructure<D>> = self
            .meshes
            .iter_mut()
            .filter(|m| m.dynamic || !m.blas.is_built())
            .map(|m| &mut m.blas as &mut dyn AccelerationStructure<D>)
            .collect();

        wait_last_trace(device, cmd);
        build_acceleration_structures(device, cmd, &mut blas, &mut [&mut self.tlas], &mut self.scratch)?;
        wait_as_build(device, cmd);
        Ok(())
    }

    /// Release every structure and the scratch buffer.
    pub fn destroy(&mut self, device: &D) {
        for mesh in &mut self.meshes {
            mesh.blas.destroy(device);
        }
        self.meshes.clear();
        self.tlas.destroy(device);
        self.instance_meshes.clear();
        self.scratch.destroy(device);
        self.created = false;
    }
}

impl<D: RtDevice, T: Pod> InstanceTarget for RtScene<D, T> {
    fn add_instance(&mut self, mesh: MeshHandle, transform: &Affine3A) -> Option<InstanceHandle> {
        self.add_instance_with_data(mesh, transform, T::zeroed())
    }

    fn remove_instance(&mut self, instance: InstanceHandle) -> Result<()> {
        self.tlas.remove_instance(instance)?;
        self.instance_meshes.remove(&instance);
        Ok(())
    }

    fn set_instance_transform(&mut self, instance: InstanceHandle, transform: &Affine3A) -> Result<()> {
        self.tlas.set_instance_transform(instance, transform)
    }

    fn set_change_flag(&mut self, instance: InstanceHandle) -> Result<()> {
        self.tlas.set_change_flag(instance)
    }
}
