//! Shader modules, layouts and graphics pipelines.

use std::mem::{offset_of, size_of};

use ash::prelude::VkResult;
use ash::vk;
use bytemuck::{Pod, Zeroable};

use super::conversion::{convert_polygon_mode, convert_samples, convert_topology};
use crate::backend::types::{DrawConstants, PipelineSettings, Vertex};

/// SPIR-V for the draw and blur pipelines.
///
/// Draw shaders see:
/// - vertex input at binding 0 laid out as [`Vertex`]: position (location 0),
///   uv (1), color (2), point size (3) and texture layer (4);
/// - a sampler at set 0, binding 0 and a sampled image at set 1, binding 0;
/// - [`DrawConstants`] as vertex and fragment push constants;
/// - specialization constant 0 set to 1 for multitextured draws and
///   constant 1 set to 1 when the sampler clamps to a border color.
///
/// Blur shaders draw a full-screen triangle from `gl_VertexIndex` and see a
/// sampler at set 0, binding 0, the source image at set 0, binding 1, and
/// [`BlurConstants`] as fragment push constants.
#[derive(Debug, Clone)]
pub struct ShaderSet {
    pub draw_vertex: Vec<u32>,
    pub draw_fragment: Vec<u32>,
    pub blur_vertex: Vec<u32>,
    pub blur_fragment: Vec<u32>,
}

/// Push constants of one blur pass.
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Default, Pod, Zeroable)]
pub struct BlurConstants {
    pub amount: [f32; 2],
    pub inv_extent: [f32; 2],
    /// 0 horizontal, 1 vertical.
    pub direction: u32,
    /// 1 box, 2 gaussian.
    pub blur_type: u32,
}

pub(super) struct ShaderModules {
    draw_vertex: vk::ShaderModule,
    draw_fragment: vk::ShaderModule,
    blur_vertex: vk::ShaderModule,
    blur_fragment: vk::ShaderModule,
}

impl ShaderModules {
    pub(super) unsafe fn new(device: &ash::Device, set: &ShaderSet) -> VkResult<Self> {
        let mut created = Vec::with_capacity(4);
        for code in [
            &set.draw_vertex,
            &set.draw_fragment,
            &set.blur_vertex,
            &set.blur_fragment,
        ] {
            let info = vk::ShaderModuleCreateInfo::default().code(code);
            match device.create_shader_module(&info, None) {
                Ok(module) => created.push(module),
                Err(e) => {
                    for module in created {
                        device.destroy_shader_module(module, None);
                    }
                    return Err(e);
                }
            }
        }
        Ok(Self {
            draw_vertex: created[0],
            draw_fragment: created[1],
            blur_vertex: created[2],
            blur_fragment: created[3],
        })
    }

    pub(super) unsafe fn destroy(self, device: &ash::Device) {
        device.destroy_shader_module(self.draw_vertex, None);
        device.destroy_shader_module(self.draw_fragment, None);
        device.destroy_shader_module(self.blur_vertex, None);
        device.destroy_shader_module(self.blur_fragment, None);
    }
}

/// Descriptor set and pipeline layouts shared by every pipeline.
pub(super) struct SharedLayouts {
    pub sampler_set: vk::DescriptorSetLayout,
    pub texture_set: vk::DescriptorSetLayout,
    pub uniform_set: vk::DescriptorSetLayout,
    pub blur_set: vk::DescriptorSetLayout,
    pub draw: vk::PipelineLayout,
    pub blur: vk::PipelineLayout,
}

unsafe fn single_binding_layout(
    device: &ash::Device,
    ty: vk::DescriptorType,
    stages: vk::ShaderStageFlags,
) -> VkResult<vk::DescriptorSetLayout> {
    let bindings = [vk::DescriptorSetLayoutBinding::default()
        .binding(0)
        .descriptor_type(ty)
        .descriptor_count(1)
        .stage_flags(stages)];
    let info = vk::DescriptorSetLayoutCreateInfo::default().bindings(&bindings);
    device.create_descriptor_set_layout(&info, None)
}

impl SharedLayouts {
    pub(super) unsafe fn new(device: &ash::Device) -> VkResult<Self> {
        let all_graphics = vk::ShaderStageFlags::VERTEX | vk::ShaderStageFlags::FRAGMENT;
        let sampler_set =
            single_binding_layout(device, vk::DescriptorType::SAMPLER, all_graphics)?;
        let texture_set =
            single_binding_layout(device, vk::DescriptorType::SAMPLED_IMAGE, all_graphics)?;
        let uniform_set =
            single_binding_layout(device, vk::DescriptorType::UNIFORM_BUFFER, all_graphics)?;

        let blur_bindings = [
            vk::DescriptorSetLayoutBinding::default()
                .binding(0)
                .descriptor_type(vk::DescriptorType::SAMPLER)
                .descriptor_count(1)
                .stage_flags(vk::ShaderStageFlags::FRAGMENT),
            vk::DescriptorSetLayoutBinding::default()
                .binding(1)
                .descriptor_type(vk::DescriptorType::SAMPLED_IMAGE)
                .descriptor_count(1)
                .stage_flags(vk::ShaderStageFlags::FRAGMENT),
        ];
        let blur_set = device.create_descriptor_set_layout(
            &vk::DescriptorSetLayoutCreateInfo::default().bindings(&blur_bindings),
            None,
        )?;

        let draw_sets = [sampler_set, texture_set];
        let draw_ranges = [vk::PushConstantRange {
            stage_flags: all_graphics,
            offset: 0,
            size: size_of::<DrawConstants>() as u32,
        }];
        let draw = device.create_pipeline_layout(
            &vk::PipelineLayoutCreateInfo::default()
                .set_layouts(&draw_sets)
                .push_constant_ranges(&draw_ranges),
            None,
        )?;

        let blur_sets = [blur_set];
        let blur_ranges = [vk::PushConstantRange {
            stage_flags: vk::ShaderStageFlags::FRAGMENT,
            offset: 0,
            size: size_of::<BlurConstants>() as u32,
        }];
        let blur = device.create_pipeline_layout(
            &vk::PipelineLayoutCreateInfo::default()
                .set_layouts(&blur_sets)
                .push_constant_ranges(&blur_ranges),
            None,
        )?;

        Ok(Self {
            sampler_set,
            texture_set,
            uniform_set,
            blur_set,
            draw,
            blur,
        })
    }

    pub(super) unsafe fn destroy(&self, device: &ash::Device) {
        device.destroy_pipeline_layout(self.draw, None);
        device.destroy_pipeline_layout(self.blur, None);
        for layout in [
            self.sampler_set,
            self.texture_set,
            self.uniform_set,
            self.blur_set,
        ] {
            device.destroy_descriptor_set_layout(layout, None);
        }
    }
}

fn alpha_blend() -> vk::PipelineColorBlendAttachmentState {
    vk::PipelineColorBlendAttachmentState::default()
        .blend_enable(true)
        .src_color_blend_factor(vk::BlendFactor::SRC_ALPHA)
        .dst_color_blend_factor(vk::BlendFactor::ONE_MINUS_SRC_ALPHA)
        .color_blend_op(vk::BlendOp::ADD)
        .src_alpha_blend_factor(vk::BlendFactor::ONE)
        .dst_alpha_blend_factor(vk::BlendFactor::ONE_MINUS_SRC_ALPHA)
        .alpha_blend_op(vk::BlendOp::ADD)
        .color_write_mask(vk::ColorComponentFlags::RGBA)
}

pub(super) unsafe fn create_draw_pipeline(
    device: &ash::Device,
    layouts: &SharedLayouts,
    modules: &ShaderModules,
    render_pass: vk::RenderPass,
    settings: &PipelineSettings,
    non_solid_fill: bool,
) -> VkResult<vk::Pipeline> {
    let spec_data = [settings.multitextured as u32, settings.border_color as u32];
    let spec_entries = [
        vk::SpecializationMapEntry {
            constant_id: 0,
            offset: 0,
            size: 4,
        },
        vk::SpecializationMapEntry {
            constant_id: 1,
            offset: 4,
            size: 4,
        },
    ];
    let spec_info = vk::SpecializationInfo::default()
        .map_entries(&spec_entries)
        .data(bytemuck::cast_slice(&spec_data));

    let stages = [
        vk::PipelineShaderStageCreateInfo::default()
            .stage(vk::ShaderStageFlags::VERTEX)
            .module(modules.draw_vertex)
            .name(c"main")
            .specialization_info(&spec_info),
        vk::PipelineShaderStageCreateInfo::default()
            .stage(vk::ShaderStageFlags::FRAGMENT)
            .module(modules.draw_fragment)
            .name(c"main")
            .specialization_info(&spec_info),
    ];

    let bindings = [vk::VertexInputBindingDescription {
        binding: 0,
        stride: size_of::<Vertex>() as u32,
        input_rate: vk::VertexInputRate::VERTEX,
    }];
    let attributes = [
        vk::VertexInputAttributeDescription {
            location: 0,
            binding: 0,
            format: vk::Format::R32G32_SFLOAT,
            offset: offset_of!(Vertex, position) as u32,
        },
        vk::VertexInputAttributeDescription {
            location: 1,
            binding: 0,
            format: vk::Format::R32G32_SFLOAT,
            offset: offset_of!(Vertex, uv) as u32,
        },
        vk::VertexInputAttributeDescription {
            location: 2,
            binding: 0,
            format: vk::Format::R32G32B32A32_SFLOAT,
            offset: offset_of!(Vertex, color) as u32,
        },
        vk::VertexInputAttributeDescription {
            location: 3,
            binding: 0,
            format: vk::Format::R32_SFLOAT,
            offset: offset_of!(Vertex, point_size) as u32,
        },
        vk::VertexInputAttributeDescription {
            location: 4,
            binding: 0,
            format: vk::Format::R32_UINT,
            offset: offset_of!(Vertex, single_texture_layer) as u32,
        },
    ];
    let vertex_input = vk::PipelineVertexInputStateCreateInfo::default()
        .vertex_binding_descriptions(&bindings)
        .vertex_attribute_descriptions(&attributes);

    let input_assembly = vk::PipelineInputAssemblyStateCreateInfo::default()
        .topology(convert_topology(settings.topology));

    let polygon_mode = if non_solid_fill {
        convert_polygon_mode(settings.polygon_mode)
    } else {
        vk::PolygonMode::FILL
    };
    let rasterization = vk::PipelineRasterizationStateCreateInfo::default()
        .polygon_mode(polygon_mode)
        .cull_mode(vk::CullModeFlags::NONE)
        .front_face(vk::FrontFace::COUNTER_CLOCKWISE)
        .line_width(1.0);

    create_pipeline(
        device,
        layouts.draw,
        render_pass,
        &stages,
        &vertex_input,
        &input_assembly,
        &rasterization,
        convert_samples(settings.samples),
        &[
            vk::DynamicState::VIEWPORT,
            vk::DynamicState::SCISSOR,
            vk::DynamicState::LINE_WIDTH,
        ],
    )
}

pub(super) unsafe fn create_blur_pipeline(
    device: &ash::Device,
    layouts: &SharedLayouts,
    modules: &ShaderModules,
    render_pass: vk::RenderPass,
) -> VkResult<vk::Pipeline> {
    let stages = [
        vk::PipelineShaderStageCreateInfo::default()
            .stage(vk::ShaderStageFlags::VERTEX)
            .module(modules.blur_vertex)
            .name(c"main"),
        vk::PipelineShaderStageCreateInfo::default()
            .stage(vk::ShaderStageFlags::FRAGMENT)
            .module(modules.blur_fragment)
            .name(c"main"),
    ];
    let vertex_input = vk::PipelineVertexInputStateCreateInfo::default();
    let input_assembly = vk::PipelineInputAssemblyStateCreateInfo::default()
        .topology(vk::PrimitiveTopology::TRIANGLE_LIST);
    let rasterization = vk::PipelineRasterizationStateCreateInfo::default()
        .polygon_mode(vk::PolygonMode::FILL)
        .cull_mode(vk::CullModeFlags::NONE)
        .line_width(1.0);

    create_pipeline(
        device,
        layouts.blur,
        render_pass,
        &stages,
        &vertex_input,
        &input_assembly,
        &rasterization,
        vk::SampleCountFlags::TYPE_1,
        &[vk::DynamicState::VIEWPORT, vk::DynamicState::SCISSOR],
    )
}

#[allow(clippy::too_many_arguments)]
unsafe fn create_pipeline(
    device: &ash::Device,
    layout: vk::PipelineLayout,
    render_pass: vk::RenderPass,
    stages: &[vk::PipelineShaderStageCreateInfo<'_>],
    vertex_input: &vk::PipelineVertexInputStateCreateInfo<'_>,
    input_assembly: &vk::PipelineInputAssemblyStateCreateInfo<'_>,
    rasterization: &vk::PipelineRasterizationStateCreateInfo<'_>,
    samples: vk::SampleCountFlags,
    dynamic_states: &[vk::DynamicState],
) -> VkResult<vk::Pipeline> {
    // Viewport and scissor are dynamic; only their counts matter here.
    let viewport = vk::PipelineViewportStateCreateInfo::default()
        .viewport_count(1)
        .scissor_count(1);
    let multisample =
        vk::PipelineMultisampleStateCreateInfo::default().rasterization_samples(samples);
    let blend_attachments = [alpha_blend()];
    let color_blend =
        vk::PipelineColorBlendStateCreateInfo::default().attachments(&blend_attachments);
    let dynamic = vk::PipelineDynamicStateCreateInfo::default().dynamic_states(dynamic_states);

    let info = vk::GraphicsPipelineCreateInfo::default()
        .stages(stages)
        .vertex_input_state(vertex_input)
        .input_assembly_state(input_assembly)
        .viewport_state(&viewport)
        .rasterization_state(rasterization)
        .multisample_state(&multisample)
        .color_blend_state(&color_blend)
        .dynamic_state(&dynamic)
        .layout(layout)
        .render_pass(render_pass)
        .subpass(0);

    device
        .create_graphics_pipelines(vk::PipelineCache::null(), &[info], None)
        .map(|pipelines| pipelines[0])
        .map_err(|(_, e)| e)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_push_constants_fit_the_guaranteed_minimum() {
        assert!(size_of::<DrawConstants>() <= 128);
        assert_eq!(size_of::<BlurConstants>(), 24);
    }

    #[test]
    fn test_vertex_attribute_offsets() {
        assert_eq!(offset_of!(Vertex, uv), 8);
        assert_eq!(offset_of!(Vertex, color), 16);
        assert_eq!(offset_of!(Vertex, single_texture_layer), 36);
    }
}
