// Shader programs
//
// A program is a set of SPIR-V stage modules plus everything needed to feed
// them resources: one descriptor set layout, a pool with `set_count` sets of
// that layout, and the pipeline layout. SPIR-V is opaque here; the only checks
// are that the artifact exists and that its length is a whole number of words.

use ash::vk;
use std::collections::BTreeMap;
use std::ffi::CStr;
use std::io::Cursor;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use super::buffer::Buffer;
use super::device::DeviceContext;
use super::image::Image;
use crate::error::{vk_check, RenderError, Result};

/// Entry point every stage is expected to export.
pub const ENTRY_POINT: &CStr = c"main";

/// One binding of the program's descriptor set.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UniformBinding {
    pub binding: u32,
    pub descriptor_type: vk::DescriptorType,
    pub count: u32,
    pub stages: vk::ShaderStageFlags,
}

impl UniformBinding {
    pub fn new(
        binding: u32,
        descriptor_type: vk::DescriptorType,
        stages: vk::ShaderStageFlags,
    ) -> Self {
        Self {
            binding,
            descriptor_type,
            count: 1,
            stages,
        }
    }

    pub fn uniform_buffer(binding: u32, stages: vk::ShaderStageFlags) -> Self {
        Self::new(binding, vk::DescriptorType::UNIFORM_BUFFER, stages)
    }

    pub fn storage_buffer(binding: u32, stages: vk::ShaderStageFlags) -> Self {
        Self::new(binding, vk::DescriptorType::STORAGE_BUFFER, stages)
    }

    pub fn sampled_image(binding: u32, stages: vk::ShaderStageFlags) -> Self {
        Self::new(binding, vk::DescriptorType::COMBINED_IMAGE_SAMPLER, stages)
    }

    pub fn storage_image(binding: u32, stages: vk::ShaderStageFlags) -> Self {
        Self::new(binding, vk::DescriptorType::STORAGE_IMAGE, stages)
    }

    fn layout_binding(&self) -> vk::DescriptorSetLayoutBinding {
        vk::DescriptorSetLayoutBinding::builder()
            .binding(self.binding)
            .descriptor_type(self.descriptor_type)
            .descriptor_count(self.count)
            .stage_flags(self.stages)
            .build()
    }
}

/// Pool sizes for `set_count` sets of `bindings`, one entry per descriptor type.
fn pool_sizes(bindings: &[UniformBinding], set_count: u32) -> Vec<vk::DescriptorPoolSize> {
    let mut per_type: BTreeMap<i32, u32> = BTreeMap::new();
    for binding in bindings {
        *per_type.entry(binding.descriptor_type.as_raw()).or_default() += binding.count;
    }
    per_type
        .into_iter()
        .map(|(ty, count)| vk::DescriptorPoolSize {
            ty: vk::DescriptorType::from_raw(ty),
            descriptor_count: count * set_count,
        })
        .collect()
}

/// Decode SPIR-V words, rejecting lengths that are not a multiple of four.
fn decode_spirv(bytes: &[u8], origin: &Path) -> Result<Vec<u32>> {
    ash::util::read_spv(&mut Cursor::new(bytes)).map_err(|source| RenderError::ShaderArtifact {
        path: origin.to_path_buf(),
        source,
    })
}

pub struct ShaderProgram {
    ctx: Arc<DeviceContext>,
    stages: Vec<(vk::ShaderStageFlags, vk::ShaderModule)>,
    bindings: Vec<UniformBinding>,
    set_layout: vk::DescriptorSetLayout,
    descriptor_pool: vk::DescriptorPool,
    descriptor_sets: Vec<vk::DescriptorSet>,
    pipeline_layout: vk::PipelineLayout,
}

impl ShaderProgram {
    /// Build a program from in-memory SPIR-V, one `(stage, bytes)` per module.
    pub fn from_spirv(
        ctx: &Arc<DeviceContext>,
        stages: &[(vk::ShaderStageFlags, &[u8])],
        bindings: &[UniformBinding],
        set_count: u32,
    ) -> Result<Arc<Self>> {
        let inline = PathBuf::from("<inline spir-v>");
        let code = stages
            .iter()
            .map(|&(stage, bytes)| Ok((stage, decode_spirv(bytes, &inline)?)))
            .collect::<Result<Vec<_>>>()?;
        Self::new(ctx, &code, bindings, set_count)
    }

    /// Build a program from SPIR-V files on disk.
    pub fn from_files<P: AsRef<Path>>(
        ctx: &Arc<DeviceContext>,
        stages: &[(vk::ShaderStageFlags, P)],
        bindings: &[UniformBinding],
        set_count: u32,
    ) -> Result<Arc<Self>> {
        let code = stages
            .iter()
            .map(|(stage, path)| {
                let path = path.as_ref();
                let bytes = std::fs::read(path).map_err(|source| RenderError::ShaderArtifact {
                    path: path.to_path_buf(),
                    source,
                })?;
                log::debug!("Loaded shader {:?} ({} bytes)", path, bytes.len());
                Ok((*stage, decode_spirv(&bytes, path)?))
            })
            .collect::<Result<Vec<_>>>()?;
        Self::new(ctx, &code, bindings, set_count)
    }

    /// Vertex + fragment pair.
    pub fn graphics(
        ctx: &Arc<DeviceContext>,
        vertex: &[u8],
        fragment: &[u8],
        bindings: &[UniformBinding],
        set_count: u32,
    ) -> Result<Arc<Self>> {
        Self::from_spirv(
            ctx,
            &[
                (vk::ShaderStageFlags::VERTEX, vertex),
                (vk::ShaderStageFlags::FRAGMENT, fragment),
            ],
            bindings,
            set_count,
        )
    }

    pub fn compute(
        ctx: &Arc<DeviceContext>,
        code: &[u8],
        bindings: &[UniformBinding],
        set_count: u32,
    ) -> Result<Arc<Self>> {
        Self::from_spirv(
            ctx,
            &[(vk::ShaderStageFlags::COMPUTE, code)],
            bindings,
            set_count,
        )
    }

    fn new(
        ctx: &Arc<DeviceContext>,
        code: &[(vk::ShaderStageFlags, Vec<u32>)],
        bindings: &[UniformBinding],
        set_count: u32,
    ) -> Result<Arc<Self>> {
        let driver = ctx.driver();

        // Every handle starts null so `Drop` can unwind a partial build.
        let mut program = Self {
            ctx: Arc::clone(ctx),
            stages: Vec::with_capacity(code.len()),
            bindings: bindings.to_vec(),
            set_layout: vk::DescriptorSetLayout::null(),
            descriptor_pool: vk::DescriptorPool::null(),
            descriptor_sets: Vec::new(),
            pipeline_layout: vk::PipelineLayout::null(),
        };

        for (stage, words) in code {
            let module = vk_check(driver.create_shader_module(words), "vkCreateShaderModule")?;
            program.stages.push((*stage, module));
        }

        let layout_bindings: Vec<_> = bindings.iter().map(UniformBinding::layout_binding).collect();
        program.set_layout = vk_check(
            driver.create_descriptor_set_layout(&layout_bindings),
            "vkCreateDescriptorSetLayout",
        )?;

        if !bindings.is_empty() && set_count > 0 {
            program.descriptor_pool = vk_check(
                driver.create_descriptor_pool(set_count, &pool_sizes(bindings, set_count)),
                "vkCreateDescriptorPool",
            )?;
            let layouts = vec![program.set_layout; set_count as usize];
            program.descriptor_sets = vk_check(
                driver.allocate_descriptor_sets(program.descriptor_pool, &layouts),
                "vkAllocateDescriptorSets",
            )?;
        }

        program.pipeline_layout = vk_check(
            driver.create_pipeline_layout(&[program.set_layout], &[]),
            "vkCreatePipelineLayout",
        )?;

        log::debug!(
            "Created shader program: {} stage(s), {} binding(s), {} descriptor set(s)",
            program.stages.len(),
            bindings.len(),
            program.descriptor_sets.len()
        );

        Ok(Arc::new(program))
    }

    /// Stage create infos pointing at [`ENTRY_POINT`].
    pub fn stage_infos(&self) -> Vec<vk::PipelineShaderStageCreateInfo> {
        self.stages
            .iter()
            .map(|&(stage, module)| {
                vk::PipelineShaderStageCreateInfo::builder()
                    .stage(stage)
                    .module(module)
                    .name(ENTRY_POINT)
                    .build()
            })
            .collect()
    }

    pub fn has_stage(&self, stage: vk::ShaderStageFlags) -> bool {
        self.stages.iter().any(|&(s, _)| s == stage)
    }

    pub fn pipeline_layout(&self) -> vk::PipelineLayout {
        self.pipeline_layout
    }

    pub fn descriptor_set_layout(&self) -> vk::DescriptorSetLayout {
        self.set_layout
    }

    pub fn descriptor_set_count(&self) -> usize {
        self.descriptor_sets.len()
    }

    /// Panics if `index` is out of range, like slice indexing.
    pub fn descriptor_set(&self, index: usize) -> vk::DescriptorSet {
        self.descriptor_sets[index]
    }

    pub fn try_descriptor_set(&self, index: usize) -> Option<vk::DescriptorSet> {
        self.descriptor_sets.get(index).copied()
    }

    pub fn bindings(&self) -> &[UniformBinding] {
        &self.bindings
    }

    fn binding_type(&self, binding: u32) -> Result<vk::DescriptorType> {
        self.bindings
            .iter()
            .find(|b| b.binding == binding)
            .map(|b| b.descriptor_type)
            .ok_or_else(|| {
                RenderError::Initialization(format!(
                    "binding {binding} is not part of the program layout"
                ))
            })
    }

    /// Point `binding` of set `set` at the whole of `buffer`.
    pub fn update_uniform_buffer(&self, set: usize, binding: u32, buffer: &Buffer) -> Result<()> {
        let descriptor_type = self.binding_type(binding)?;
        let buffer_info = [buffer.descriptor_info()];
        let write = vk::WriteDescriptorSet::builder()
            .dst_set(self.descriptor_set(set))
            .dst_binding(binding)
            .descriptor_type(descriptor_type)
            .buffer_info(&buffer_info)
            .build();
        self.ctx.driver().update_descriptor_sets(&[write]);
        Ok(())
    }

    /// Point `binding` of set `set` at `image` in its current layout.
    pub fn update_image(&self, set: usize, binding: u32, image: &Image) -> Result<()> {
        let descriptor_type = self.binding_type(binding)?;
        let image_info = [image.descriptor_info()];
        let write = vk::WriteDescriptorSet::builder()
            .dst_set(self.descriptor_set(set))
            .dst_binding(binding)
            .descriptor_type(descriptor_type)
            .image_info(&image_info)
            .build();
        self.ctx.driver().update_descriptor_sets(&[write]);
        Ok(())
    }
}

impl Drop for ShaderProgram {
    fn drop(&mut self) {
        let driver = self.ctx.driver();
        if self.pipeline_layout != vk::PipelineLayout::null() {
            driver.destroy_pipeline_layout(self.pipeline_layout);
        }
        // Destroying the pool frees its sets.
        if self.descriptor_pool != vk::DescriptorPool::null() {
            driver.destroy_descriptor_pool(self.descriptor_pool);
        }
        if self.set_layout != vk::DescriptorSetLayout::null() {
            driver.destroy_descriptor_set_layout(self.set_layout);
        }
        for &(_, module) in &self.stages {
            driver.destroy_shader_module(module);
        }
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::backend::fake::FakeDriver;

    /// Smallest header-only module; the fake driver never inspects it.
    pub(crate) fn spirv_stub() -> Vec<u8> {
        bytemuck::cast_slice(&[0x0723_0203u32, 0x0001_0000, 0, 1, 0]).to_vec()
    }

    #[test]
    fn builds_layout_pool_and_sets() {
        let (fake, ctx) = FakeDriver::context();
        let code = spirv_stub();
        let program = ShaderProgram::graphics(
            &ctx,
            &code,
            &code,
            &[
                UniformBinding::uniform_buffer(0, vk::ShaderStageFlags::VERTEX),
                UniformBinding::sampled_image(1, vk::ShaderStageFlags::FRAGMENT),
            ],
            3,
        )
        .unwrap();

        assert_eq!(program.stage_infos().len(), 2);
        assert!(program.has_stage(vk::ShaderStageFlags::FRAGMENT));
        assert_eq!(program.descriptor_set_count(), 3);
        assert_eq!(fake.live("shader module"), 2);
        assert_eq!(fake.live("descriptor pool"), 1);
        assert_eq!(fake.live("pipeline layout"), 1);

        drop(program);
        assert_eq!(fake.live("shader module"), 0);
        assert_eq!(fake.live("descriptor pool"), 0);
        assert_eq!(fake.live("descriptor set layout"), 0);
        assert_eq!(fake.live("pipeline layout"), 0);
    }

    #[test]
    fn pool_sizes_merge_types_and_scale_by_sets() {
        let stages = vk::ShaderStageFlags::COMPUTE;
        let sizes = pool_sizes(
            &[
                UniformBinding::storage_buffer(0, stages),
                UniformBinding::storage_buffer(1, stages),
                UniformBinding::uniform_buffer(2, stages),
            ],
            2,
        );
        let storage = sizes
            .iter()
            .find(|s| s.ty == vk::DescriptorType::STORAGE_BUFFER)
            .unwrap();
        assert_eq!(storage.descriptor_count, 4);
        assert_eq!(sizes.len(), 2);
    }

    #[test]
    fn misaligned_bytecode_is_rejected() {
        let (_fake, ctx) = FakeDriver::context();
        let err = ShaderProgram::compute(&ctx, &[3, 2, 0x23, 7, 1], &[], 0)
            .err()
            .unwrap();
        assert!(matches!(err, RenderError::ShaderArtifact { .. }));
    }

    #[test]
    fn missing_file_names_the_path() {
        let (_fake, ctx) = FakeDriver::context();
        let err = ShaderProgram::from_files(
            &ctx,
            &[(vk::ShaderStageFlags::COMPUTE, "does/not/exist.spv")],
            &[],
            0,
        )
        .err()
        .unwrap();
        match err {
            RenderError::ShaderArtifact { path, .. } => {
                assert_eq!(path, PathBuf::from("does/not/exist.spv"))
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[test]
    fn descriptor_updates_use_declared_types() {
        let (fake, ctx) = FakeDriver::context();
        let program = ShaderProgram::compute(
            &ctx,
            &spirv_stub(),
            &[UniformBinding::storage_buffer(0, vk::ShaderStageFlags::COMPUTE)],
            1,
        )
        .unwrap();
        let buffer = Buffer::new(
            &ctx,
            64,
            vk::BufferUsageFlags::STORAGE_BUFFER,
            vk::MemoryPropertyFlags::DEVICE_LOCAL,
        )
        .unwrap();

        program.update_uniform_buffer(0, 0, &buffer).unwrap();
        assert_eq!(
            fake.descriptor_writes(),
            vec![(program.descriptor_set(0), 0, vk::DescriptorType::STORAGE_BUFFER)]
        );
        assert!(program.update_uniform_buffer(0, 5, &buffer).is_err());
    }
}
