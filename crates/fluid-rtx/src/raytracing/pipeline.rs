//! Ray tracing pipeline with its shader binding table.

use ash::vk;

use super::device::{RtDevice, RtProperties};
use super::error::{Result, RtError};
use super::sbt::{GroupType, SbtLayout, ShaderBindingTable};
use crate::config::RtConfig;

struct GeneralStage {
    module: vk::ShaderModule,
    record_size: usize,
}

struct HitGroup {
    closest_hit: Option<vk::ShaderModule>,
    any_hit: Option<vk::ShaderModule>,
    intersection: Option<vk::ShaderModule>,
    triangles: bool,
    record_size: usize,
}

/// Observable pipeline state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PipelineState {
    /// Shader stages may still be added.
    Configuring,
    /// Built, with record changes not yet copied to the device table.
    Unstaged,
    /// Built, and the device table matches the staging copy.
    Staged,
}

/// Ray tracing pipeline.
///
/// Shader stages are collected per group type, then [`RayTracingPipeline::setup`]
/// creates the pipeline and its shader binding table. Records can be patched
/// afterwards. [`RayTracingPipeline::bind`] copies pending patches to the
/// device before binding.
pub struct RayTracingPipeline<D: RtDevice> {
    layout: vk::PipelineLayout,
    props: RtProperties,
    max_recursion_depth: u32,
    ray_gen: Vec<GeneralStage>,
    miss: Vec<GeneralStage>,
    callable: Vec<GeneralStage>,
    hit: Vec<HitGroup>,
    pipeline: vk::Pipeline,
    sbt: Option<ShaderBindingTable<D>>,
}

impl<D: RtDevice> RayTracingPipeline<D> {
    /// Empty pipeline using the recursion depth of `config`, clamped to the
    /// device limit.
    pub fn new(device: &D, layout: vk::PipelineLayout, config: &RtConfig) -> Self {
        let props = device.properties();
        Self {
            layout,
            props,
            max_recursion_depth: config.max_ray_recursion_depth.clamp(1, props.max_ray_recursion_depth.max(1)),
            ray_gen: Vec::new(),
            miss: Vec::new(),
            callable: Vec::new(),
            hit: Vec::new(),
            pipeline: vk::Pipeline::null(),
            sbt: None,
        }
    }

    pub fn state(&self) -> PipelineState {
        match &self.sbt {
            None => PipelineState::Configuring,
            Some(sbt) if sbt.is_staged() => PipelineState::Staged,
            Some(_) => PipelineState::Unstaged,
        }
    }

    pub fn handle(&self) -> vk::Pipeline {
        self.pipeline
    }

    pub fn max_recursion_depth(&self) -> u32 {
        self.max_recursion_depth
    }

    // ------------------------------------------------------------
    // Configuration
    // ------------------------------------------------------------

    pub fn add_ray_gen_shader(&mut self, device: &D, code: &[u8], record_size: usize) -> Result<()> {
        let module = self.create_stage(device, code)?;
        self.ray_gen.push(GeneralStage { module, record_size });
        Ok(())
    }

    pub fn add_miss_shader(&mut self, device: &D, code: &[u8], record_size: usize) -> Result<()> {
        let module = self.create_stage(device, code)?;
        self.miss.push(GeneralStage { module, record_size });
        Ok(())
    }

    pub fn add_call_shader(&mut self, device: &D, code: &[u8], record_size: usize) -> Result<()> {
        let module = self.create_stage(device, code)?;
        self.callable.push(GeneralStage { module, record_size });
        Ok(())
    }

    /// Add a hit group of up to three stages. `triangles` selects a triangle
    /// hit group, otherwise the group is procedural.
    pub fn add_hit_shader_group(
        &mut self,
        device: &D,
        closest_hit: Option<&[u8]>,
        any_hit: Option<&[u8]>,
        intersection: Option<&[u8]>,
        triangles: bool,
        record_size: usize,
    ) -> Result<()> {
        if self.sbt.is_some() {
            log::error!("Cannot add shader stages after the pipeline was built");
            return Err(RtError::PipelineAlreadyBuilt);
        }
        if closest_hit.is_none() && any_hit.is_none() && intersection.is_none() {
            log::error!("Hit group needs at least one shader stage");
            return Err(RtError::EmptyHitGroup);
        }

        let mut modules = [None; 3];
        for (slot, code) in [closest_hit, any_hit, intersection].into_iter().enumerate() {
            let Some(code) = code else { continue };
            match self.create_stage(device, code) {
                Ok(module) => modules[slot] = Some(module),
                Err(e) => {
                    for module in modules.into_iter().flatten() {
                        device.destroy_shader_module(module);
                    }
                    return Err(e);
                }
            }
        }

        let [closest_hit, any_hit, intersection] = modules;
        self.hit.push(HitGroup {
            closest_hit,
            any_hit,
            intersection,
            triangles,
            record_size,
        });
        Ok(())
    }

    pub fn add_closest_hit_shader(
        &mut self,
        device: &D,
        code: &[u8],
        triangles: bool,
        record_size: usize,
    ) -> Result<()> {
        self.add_hit_shader_group(device, Some(code), None, None, triangles, record_size)
    }

    /// Clamped to the device maximum.
    pub fn set_max_recursion_depth(&mut self, depth: u32) -> Result<()> {
        if self.sbt.is_some() {
            log::error!("Cannot change the recursion depth after the pipeline was built");
            return Err(RtError::PipelineAlreadyBuilt);
        }
        self.max_recursion_depth = depth.min(self.props.max_ray_recursion_depth);
        Ok(())
    }

    fn create_stage(&self, device: &D, code: &[u8]) -> Result<vk::ShaderModule> {
        if self.sbt.is_some() {
            log::error!("Cannot add shader stages after the pipeline was built");
            return Err(RtError::PipelineAlreadyBuilt);
        }
        if code.is_empty() || code.len() % 4 != 0 {
            log::error!("Shader code of {} bytes is not valid SPIR-V", code.len());
            return Err(RtError::InvalidShader(format!(
                "SPIR-V length {} is not a non-zero multiple of 4",
                code.len()
            )));
        }

        // SPIR-V bytecode must be aligned to 4 bytes
        let words: Vec<u32> = code
            .chunks_exact(4)
            .map(|chunk| u32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]))
            .collect();

        device.create_shader_module(&words).map_err(|e| {
            log::error!("Failed to create shader module: {}", e);
            e
        })
    }

    // ------------------------------------------------------------
    // Setup
    // ------------------------------------------------------------

    /// Create the pipeline and lay out its shader binding table.
    ///
    /// Fails without touching the device when ray generation, miss or hit
    /// groups are missing.
    pub fn setup(&mut self, device: &D) -> Result<()> {
        if self.sbt.is_some() {
            return Err(RtError::PipelineAlreadyBuilt);
        }

        let ray_gen = !self.ray_gen.is_empty();
        let miss = !self.miss.is_empty();
        let hit = !self.hit.is_empty();
        if !(ray_gen && miss && hit) {
            log::error!(
                "Required shader groups missing: ray_gen present: {}, miss present: {}, hit present: {}",
                ray_gen,
                miss,
                hit
            );
            return Err(RtError::MissingShaderGroups { ray_gen, miss, hit });
        }

        let mut stages = Vec::new();
        let mut groups = Vec::new();
        let mut max_record_sizes = [0usize; 4];

        let general = [
            (GroupType::RayGen, &self.ray_gen, vk::ShaderStageFlags::RAYGEN_KHR),
            (GroupType::Miss, &self.miss, vk::ShaderStageFlags::MISS_KHR),
            (GroupType::Callable, &self.callable, vk::ShaderStageFlags::CALLABLE_KHR),
        ];
        for (group, list, stage) in general {
            for entry in list.iter() {
                let index = stages.len() as u32;
                stages.push(stage_info(stage, entry.module));
                groups.push(
                    vk::RayTracingShaderGroupCreateInfoKHR::default()
                        .ty(vk::RayTracingShaderGroupTypeKHR::GENERAL)
                        .general_shader(index)
                        .closest_hit_shader(vk::SHADER_UNUSED_KHR)
                        .any_hit_shader(vk::SHADER_UNUSED_KHR)
                        .intersection_shader(vk::SHADER_UNUSED_KHR),
                );
                let g = group.index();
                max_record_sizes[g] = max_record_sizes[g].max(entry.record_size);
            }
        }

        for entry in &self.hit {
            let mut push = |module: Option<vk::ShaderModule>, stage: vk::ShaderStageFlags| match module {
                Some(module) => {
                    stages.push(stage_info(stage, module));
                    stages.len() as u32 - 1
                }
                None => vk::SHADER_UNUSED_KHR,
            };
            let closest_hit = push(entry.closest_hit, vk::ShaderStageFlags::CLOSEST_HIT_KHR);
            let any_hit = push(entry.any_hit, vk::ShaderStageFlags::ANY_HIT_KHR);
            let intersection = push(entry.intersection, vk::ShaderStageFlags::INTERSECTION_KHR);

            let ty = if entry.triangles {
                vk::RayTracingShaderGroupTypeKHR::TRIANGLES_HIT_GROUP
            } else {
                vk::RayTracingShaderGroupTypeKHR::PROCEDURAL_HIT_GROUP
            };
            groups.push(
                vk::RayTracingShaderGroupCreateInfoKHR::default()
                    .ty(ty)
                    .general_shader(vk::SHADER_UNUSED_KHR)
                    .closest_hit_shader(closest_hit)
                    .any_hit_shader(any_hit)
                    .intersection_shader(intersection),
            );
            let g = GroupType::Hit.index();
            max_record_sizes[g] = max_record_sizes[g].max(entry.record_size);
        }

        let create_info = vk::RayTracingPipelineCreateInfoKHR::default()
            .stages(&stages)
            .groups(&groups)
            .max_pipeline_ray_recursion_depth(self.max_recursion_depth)
            .layout(self.layout);

        let pipeline = device.create_ray_tracing_pipeline(&create_info).map_err(|e| {
            log::error!("Failed to create ray tracing pipeline: {}", e);
            e
        })?;

        let counts = [self.ray_gen.len(), self.miss.len(), self.callable.len(), self.hit.len()];
        let layout = SbtLayout::new(&self.props, counts, max_record_sizes);
        let group_count = groups.len() as u32;
        let data_size = layout.handle_size as usize * groups.len();

        let sbt = device
            .ray_tracing_shader_group_handles(pipeline, group_count, data_size)
            .and_then(|handles| ShaderBindingTable::new(device, layout, &handles));

        match sbt {
            Ok(sbt) => {
                self.pipeline = pipeline;
                self.sbt = Some(sbt);
                Ok(())
            }
            Err(e) => {
                log::error!("Failed to build shader binding table: {}", e);
                device.destroy_pipeline(pipeline);
                Err(e)
            }
        }
    }

    // ------------------------------------------------------------
    // Records
    // ------------------------------------------------------------

    pub fn set_record(&mut self, group: GroupType, index: u32, record: &[u8]) -> Result<()> {
        match self.sbt.as_mut() {
            Some(sbt) => sbt.set_record(group, index, record),
            None => {
                log::error!("Cannot set a shader record before the pipeline was built");
                Err(RtError::PipelineNotBuilt)
            }
        }
    }

    pub fn set_gen_record(&mut self, index: u32, record: &[u8]) -> Result<()> {
        self.set_record(GroupType::RayGen, index, record)
    }

    pub fn set_miss_record(&mut self, index: u32, record: &[u8]) -> Result<()> {
        self.set_record(GroupType::Miss, index, record)
    }

    pub fn set_call_record(&mut self, index: u32, record: &[u8]) -> Result<()> {
        self.set_record(GroupType::Callable, index, record)
    }

    pub fn set_hit_record(&mut self, index: u32, record: &[u8]) -> Result<()> {
        self.set_record(GroupType::Hit, index, record)
    }

    // ------------------------------------------------------------
    // Regions
    // ------------------------------------------------------------

    fn table(&self) -> Result<&ShaderBindingTable<D>> {
        self.sbt.as_ref().ok_or(RtError::PipelineNotBuilt)
    }

    pub fn gen_region(&self, index: u32) -> Result<vk::StridedDeviceAddressRegionKHR> {
        self.table()?.gen_region(index)
    }

    pub fn miss_region(&self) -> Result<vk::StridedDeviceAddressRegionKHR> {
        Ok(self.table()?.region(GroupType::Miss))
    }

    pub fn hit_region(&self) -> Result<vk::StridedDeviceAddressRegionKHR> {
        Ok(self.table()?.region(GroupType::Hit))
    }

    pub fn callable_region(&self) -> Result<vk::StridedDeviceAddressRegionKHR> {
        Ok(self.table()?.region(GroupType::Callable))
    }

    // ------------------------------------------------------------
    // Recording
    // ------------------------------------------------------------

    /// Stage pending record changes and bind the pipeline.
    pub fn bind(&mut self, device: &D, cmd: vk::CommandBuffer) -> Result<()> {
        let Some(sbt) = self.sbt.as_mut() else {
            log::error!("Cannot bind a pipeline that was not built");
            return Err(RtError::PipelineNotBuilt);
        };
        sbt.stage(device, cmd);
        device.cmd_bind_pipeline(cmd, vk::PipelineBindPoint::RAY_TRACING_KHR, self.pipeline);
        Ok(())
    }

    /// Bind and trace a `width` x `height` x `depth` grid of rays starting at
    /// the ray generation entry `ray_gen_index`.
    pub fn bind_and_trace(
        &mut self,
        device: &D,
        cmd: vk::CommandBuffer,
        width: u32,
        height: u32,
        depth: u32,
        ray_gen_index: u32,
    ) -> Result<()> {
        let raygen = self.gen_region(ray_gen_index)?;
        self.bind(device, cmd)?;

        let sbt = self.table()?;
        device.cmd_trace_rays(
            cmd,
            &raygen,
            &sbt.region(GroupType::Miss),
            &sbt.region(GroupType::Hit),
            &sbt.region(GroupType::Callable),
            width,
            height,
            depth,
        );
        Ok(())
    }

    /// Release the pipeline, its table and all shader modules. The pipeline
    /// returns to the configuring state with no stages.
    pub fn teardown(&mut self, device: &D) {
        if let Some(sbt) = self.sbt.take() {
            sbt.destroy(device);
        }
        if self.pipeline != vk::Pipeline::null() {
            device.destroy_pipeline(self.pipeline);
            self.pipeline = vk::Pipeline::null();
        }

        let general = self.ray_gen.drain(..).chain(self.miss.drain(..)).chain(self.callable.drain(..));
        for stage in general {
            device.destroy_shader_module(stage.module);
        }
        for group in self.hit.drain(..) {
            for module in [group.closest_hit, group.any_hit, group.intersection].into_iter().flatten() {
                device.destroy_shader_module(module);
            }
        }
    }
}

fn stage_info(stage: vk::ShaderStageFlags, module: vk::ShaderModule) -> vk::PipelineShaderStageCreateInfo<'static> {
    vk::PipelineShaderStageCreateInfo::default()
        .stage(stage)
        .module(module)
        .name(c"main")
}
