// Graphics pipeline composition
//
// A pipeline is described by a handful of components (shader program, vertex
// layout, color blend, depth/stencil) that each write their part into a
// `PipelineDescription`. The GPU object needs a render pass, which only the
// render target knows, so it is built lazily on first use and cached per
// render pass. Everything not covered by a component is fixed:
// fill mode, no culling, CCW front faces, one sample, dynamic viewport/scissor.

use ash::vk;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;

use super::device::DeviceContext;
use super::render_pass::RenderPass;
use super::shader::ShaderProgram;
use crate::error::{vk_check, RenderError, Result};

/// Vertex input: one interleaved binding plus its attributes.
#[derive(Debug, Clone)]
pub struct VertexLayout {
    bindings: Vec<vk::VertexInputBindingDescription>,
    attributes: Vec<vk::VertexInputAttributeDescription>,
    topology: vk::PrimitiveTopology,
}

impl VertexLayout {
    /// Binding 0 with `stride` bytes per vertex; attribute `i` gets location `i`.
    pub fn new(stride: u32, attributes: &[(vk::Format, u32)]) -> Self {
        Self {
            bindings: vec![vk::VertexInputBindingDescription {
                binding: 0,
                stride,
                input_rate: vk::VertexInputRate::VERTEX,
            }],
            attributes: attributes
                .iter()
                .enumerate()
                .map(|(location, &(format, offset))| vk::VertexInputAttributeDescription {
                    location: location as u32,
                    binding: 0,
                    format,
                    offset,
                })
                .collect(),
            topology: vk::PrimitiveTopology::TRIANGLE_LIST,
        }
    }

    /// No vertex buffers; positions come from the vertex index.
    pub fn empty() -> Self {
        Self {
            bindings: Vec::new(),
            attributes: Vec::new(),
            topology: vk::PrimitiveTopology::TRIANGLE_LIST,
        }
    }

    pub fn topology(mut self, topology: vk::PrimitiveTopology) -> Self {
        self.topology = topology;
        self
    }

    pub fn stride(&self) -> Option<u32> {
        self.bindings.first().map(|b| b.stride)
    }

    pub fn attribute_count(&self) -> usize {
        self.attributes.len()
    }
}

impl Default for VertexLayout {
    fn default() -> Self {
        Self::empty()
    }
}

#[derive(Debug, Clone, Copy)]
pub struct ColorBlend {
    enabled: bool,
    src_color: vk::BlendFactor,
    dst_color: vk::BlendFactor,
    color_op: vk::BlendOp,
    src_alpha: vk::BlendFactor,
    dst_alpha: vk::BlendFactor,
    alpha_op: vk::BlendOp,
    write_mask: vk::ColorComponentFlags,
    constants: [f32; 4],
}

impl Default for ColorBlend {
    fn default() -> Self {
        Self {
            enabled: false,
            src_color: vk::BlendFactor::ONE,
            dst_color: vk::BlendFactor::ZERO,
            color_op: vk::BlendOp::ADD,
            src_alpha: vk::BlendFactor::ONE,
            dst_alpha: vk::BlendFactor::ZERO,
            alpha_op: vk::BlendOp::ADD,
            write_mask: vk::ColorComponentFlags::RGBA,
            constants: [1.0; 4],
        }
    }
}

impl ColorBlend {
    /// Same factors for color and alpha.
    pub fn blend(self, src: vk::BlendFactor, dst: vk::BlendFactor) -> Self {
        self.blend_separate(src, dst, src, dst)
    }

    pub fn blend_separate(
        mut self,
        src_color: vk::BlendFactor,
        dst_color: vk::BlendFactor,
        src_alpha: vk::BlendFactor,
        dst_alpha: vk::BlendFactor,
    ) -> Self {
        self.enabled = true;
        self.src_color = src_color;
        self.dst_color = dst_color;
        self.src_alpha = src_alpha;
        self.dst_alpha = dst_alpha;
        self
    }

    /// Classic straight-alpha blending.
    pub fn alpha() -> Self {
        Self::default().blend(vk::BlendFactor::SRC_ALPHA, vk::BlendFactor::ONE_MINUS_SRC_ALPHA)
    }

    pub fn ops(mut self, color_op: vk::BlendOp, alpha_op: vk::BlendOp) -> Self {
        self.color_op = color_op;
        self.alpha_op = alpha_op;
        self
    }

    pub fn write_mask(mut self, mask: vk::ColorComponentFlags) -> Self {
        self.write_mask = mask;
        self
    }

    pub fn constants(mut self, constants: [f32; 4]) -> Self {
        self.constants = constants;
        self
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    fn attachment_state(&self) -> vk::PipelineColorBlendAttachmentState {
        vk::PipelineColorBlendAttachmentState::builder()
            .blend_enable(self.enabled)
            .src_color_blend_factor(self.src_color)
            .dst_color_blend_factor(self.dst_color)
            .color_blend_op(self.color_op)
            .src_alpha_blend_factor(self.src_alpha)
            .dst_alpha_blend_factor(self.dst_alpha)
            .alpha_blend_op(self.alpha_op)
            .color_write_mask(self.write_mask)
            .build()
    }
}

#[derive(Debug, Clone, Copy)]
pub struct DepthStencil {
    depth_test: bool,
    depth_write: bool,
    compare_op: vk::CompareOp,
}

impl Default for DepthStencil {
    fn default() -> Self {
        Self {
            depth_test: false,
            depth_write: false,
            compare_op: vk::CompareOp::LESS,
        }
    }
}

impl DepthStencil {
    /// Test and write enabled, closer fragments win.
    pub fn enabled() -> Self {
        Self::default().enable_depth_test(true)
    }

    /// Toggles both the depth test and depth writes.
    pub fn enable_depth_test(mut self, enabled: bool) -> Self {
        self.depth_test = enabled;
        self.depth_write = enabled;
        self
    }

    pub fn depth_write(mut self, enabled: bool) -> Self {
        self.depth_write = enabled;
        self
    }

    pub fn compare_op(mut self, op: vk::CompareOp) -> Self {
        self.compare_op = op;
        self
    }

    pub fn is_enabled(&self) -> bool {
        self.depth_test
    }
}

/// Everything the components contributed.
#[derive(Clone, Default)]
pub struct PipelineDescription {
    pub shader: Option<Arc<ShaderProgram>>,
    pub vertex_layout: VertexLayout,
    pub color_blend: ColorBlend,
    pub depth_stencil: DepthStencil,
    pub subpass: u32,
}

#[derive(Clone)]
pub enum PipelineComponent {
    Shader(Arc<ShaderProgram>),
    VertexLayout(VertexLayout),
    ColorBlend(ColorBlend),
    DepthStencil(DepthStencil),
}

impl PipelineComponent {
    /// Later components of the same kind replace earlier ones.
    pub fn contribute_to(&self, description: &mut PipelineDescription) {
        match self {
            PipelineComponent::Shader(program) => description.shader = Some(Arc::clone(program)),
            PipelineComponent::VertexLayout(layout) => description.vertex_layout = layout.clone(),
            PipelineComponent::ColorBlend(blend) => description.color_blend = *blend,
            PipelineComponent::DepthStencil(depth) => description.depth_stencil = *depth,
        }
    }
}

impl From<Arc<ShaderProgram>> for PipelineComponent {
    fn from(program: Arc<ShaderProgram>) -> Self {
        PipelineComponent::Shader(program)
    }
}

impl From<VertexLayout> for PipelineComponent {
    fn from(layout: VertexLayout) -> Self {
        PipelineComponent::VertexLayout(layout)
    }
}

impl From<ColorBlend> for PipelineComponent {
    fn from(blend: ColorBlend) -> Self {
        PipelineComponent::ColorBlend(blend)
    }
}

impl From<DepthStencil> for PipelineComponent {
    fn from(depth: DepthStencil) -> Self {
        PipelineComponent::DepthStencil(depth)
    }
}

pub struct GraphicsPipeline {
    ctx: Arc<DeviceContext>,
    description: PipelineDescription,
    /// Built pipelines, keyed by the id of the render pass they were built
    /// against. Handle values can be reused once a pass is destroyed.
    built: Mutex<HashMap<u64, vk::Pipeline>>,
}

impl GraphicsPipeline {
    pub fn new(ctx: &Arc<DeviceContext>) -> Self {
        Self {
            ctx: Arc::clone(ctx),
            description: PipelineDescription::default(),
            built: Mutex::new(HashMap::new()),
        }
    }

    pub fn add_component(&mut self, component: impl Into<PipelineComponent>) -> &mut Self {
        component.into().contribute_to(&mut self.description);
        self
    }

    /// Consuming form of [`add_component`](Self::add_component).
    pub fn with(mut self, component: impl Into<PipelineComponent>) -> Self {
        self.add_component(component);
        self
    }

    pub fn set_subpass(&mut self, subpass: u32) -> &mut Self {
        self.description.subpass = subpass;
        self
    }

    pub fn description(&self) -> &PipelineDescription {
        &self.description
    }

    pub fn shader(&self) -> Option<&Arc<ShaderProgram>> {
        self.description.shader.as_ref()
    }

    pub fn layout(&self) -> Option<vk::PipelineLayout> {
        self.shader().map(|program| program.pipeline_layout())
    }

    /// The pipeline for `render_pass`, built on first request.
    pub fn pipeline_for(&self, render_pass: &RenderPass) -> Result<vk::Pipeline> {
        let mut built = self.built.lock();
        if let Some(&pipeline) = built.get(&render_pass.id()) {
            return Ok(pipeline);
        }
        let pipeline = self.build(render_pass)?;
        built.insert(render_pass.id(), pipeline);
        Ok(pipeline)
    }

    pub fn built_count(&self) -> usize {
        self.built.lock().len()
    }

    fn build(&self, render_pass: &RenderPass) -> Result<vk::Pipeline> {
        let desc = &self.description;
        let program = desc.shader.as_ref().ok_or_else(|| {
            RenderError::Initialization("graphics pipeline has no shader program".into())
        })?;

        let stages = program.stage_infos();

        let vertex_input = vk::PipelineVertexInputStateCreateInfo::builder()
            .vertex_binding_descriptions(&desc.vertex_layout.bindings)
            .vertex_attribute_descriptions(&desc.vertex_layout.attributes);

        let input_assembly = vk::PipelineInputAssemblyStateCreateInfo::builder()
            .topology(desc.vertex_layout.topology)
            .primitive_restart_enable(false);

        // Set per command buffer by the render target.
        let viewport_state = vk::PipelineViewportStateCreateInfo::builder()
            .viewport_count(1)
            .scissor_count(1);
        let dynamic_states = [vk::DynamicState::VIEWPORT, vk::DynamicState::SCISSOR];
        let dynamic_state =
            vk::PipelineDynamicStateCreateInfo::builder().dynamic_states(&dynamic_states);

        let rasterizer = vk::PipelineRasterizationStateCreateInfo::builder()
            .depth_clamp_enable(false)
            .rasterizer_discard_enable(false)
            .polygon_mode(vk::PolygonMode::FILL)
            .line_width(1.0)
            .cull_mode(vk::CullModeFlags::NONE)
            .front_face(vk::FrontFace::COUNTER_CLOCKWISE)
            .depth_bias_enable(false);

        let multisampling = vk::PipelineMultisampleStateCreateInfo::builder()
            .sample_shading_enable(false)
            .rasterization_samples(vk::SampleCountFlags::TYPE_1);

        let depth_stencil = vk::PipelineDepthStencilStateCreateInfo::builder()
            .depth_test_enable(desc.depth_stencil.depth_test)
            .depth_write_enable(desc.depth_stencil.depth_write)
            .depth_compare_op(desc.depth_stencil.compare_op)
            .depth_bounds_test_enable(false)
            .stencil_test_enable(false);

        let blend_attachments = [desc.color_blend.attachment_state()];
        let color_blending = vk::PipelineColorBlendStateCreateInfo::builder()
            .logic_op_enable(false)
            .attachments(&blend_attachments)
            .blend_constants(desc.color_blend.constants);

        let pipeline_info = vk::GraphicsPipelineCreateInfo::builder()
            .stages(&stages)
            .vertex_input_state(&vertex_input)
            .input_assembly_state(&input_assembly)
            .viewport_state(&viewport_state)
            .rasterization_state(&rasterizer)
            .multisample_state(&multisampling)
            .depth_stencil_state(&depth_stencil)
            .color_blend_state(&color_blending)
            .dynamic_state(&dynamic_state)
            .layout(program.pipeline_layout())
            .render_pass(render_pass.handle())
            .subpass(desc.subpass);

        let pipeline = vk_check(
            self.ctx.driver().create_graphics_pipeline(&pipeline_info),
            "vkCreateGraphicsPipelines",
        )?;

        log::debug!(
            "Built graphics pipeline for render pass {:?} (subpass {}, blend {}, depth {})",
            render_pass.handle(),
            desc.subpass,
            desc.color_blend.enabled,
            desc.depth_stencil.depth_test
        );

        Ok(pipeline)
    }
}

impl Drop for GraphicsPipeline {
    fn drop(&mut self) {
        for (_, pipeline) in self.built.get_mut().drain() {
            self.ctx.driver().destroy_pipeline(pipeline);
        }
    }
}
