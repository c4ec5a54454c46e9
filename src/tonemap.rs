//! Tone-map pass: a compute pipeline that reads the accumulated HDR image
//! and writes the display-ready image, in 8x8 workgroups.

use ash::vk;
use log::info;

use crate::context::DeviceContext;
use crate::resources::GpuBuffer;
use crate::shader_dir::ShaderDirectory;

pub const TONEMAP_SHADER: &str = "tonemap.comp";

const WORKGROUP_SIZE: u32 = 8;

const BINDING_HDR_INPUT: u32 = 0;
const BINDING_OUTPUT: u32 = 1;
const BINDING_FLAGS: u32 = 2;

/// Dispatch dimensions covering a `width` x `height` image.
pub fn group_counts(width: u32, height: u32) -> (u32, u32) {
    (
        width.div_ceil(WORKGROUP_SIZE),
        height.div_ceil(WORKGROUP_SIZE),
    )
}

/// The tone-map compute pipeline, its descriptor set, and the flag
/// uniform selecting linear vs gamma-encoded output.
pub struct TonemapPipeline {
    descriptor_set_layout: vk::DescriptorSetLayout,
    pipeline_layout: vk::PipelineLayout,
    pipeline: vk::Pipeline,
    descriptor_pool: vk::DescriptorPool,
    descriptor_set: vk::DescriptorSet,
    flag_buffer: GpuBuffer,
}

impl TonemapPipeline {
    pub fn new(ctx: &mut DeviceContext, shaders: &ShaderDirectory) -> Result<Self, String> {
        let device = ctx.device.clone();

        let bindings = [
            vk::DescriptorSetLayoutBinding::default()
                .binding(BINDING_HDR_INPUT)
                .descriptor_type(vk::DescriptorType::STORAGE_IMAGE)
                .descriptor_count(1)
                .stage_flags(vk::ShaderStageFlags::COMPUTE),
            vk::DescriptorSetLayoutBinding::default()
                .binding(BINDING_OUTPUT)
                .descriptor_type(vk::DescriptorType::STORAGE_IMAGE)
                .descriptor_count(1)
                .stage_flags(vk::ShaderStageFlags::COMPUTE),
            vk::DescriptorSetLayoutBinding::default()
                .binding(BINDING_FLAGS)
                .descriptor_type(vk::DescriptorType::UNIFORM_BUFFER)
                .descriptor_count(1)
                .stage_flags(vk::ShaderStageFlags::COMPUTE),
        ];
        let layout_info = vk::DescriptorSetLayoutCreateInfo::default().bindings(&bindings);
        let descriptor_set_layout = unsafe {
            device
                .create_descriptor_set_layout(&layout_info, None)
                .map_err(|e| format!("Failed to create tonemap descriptor layout: {:?}", e))?
        };

        let set_layouts = [descriptor_set_layout];
        let pipeline_layout_info =
            vk::PipelineLayoutCreateInfo::default().set_layouts(&set_layouts);
        let pipeline_layout = unsafe {
            device
                .create_pipeline_layout(&pipeline_layout_info, None)
                .map_err(|e| format!("Failed to create tonemap pipeline layout: {:?}", e))?
        };

        let pipeline = create_pipeline(ctx, shaders, pipeline_layout)?;

        let pool_sizes = [
            vk::DescriptorPoolSize::default()
                .ty(vk::DescriptorType::STORAGE_IMAGE)
                .descriptor_count(2),
            vk::DescriptorPoolSize::default()
                .ty(vk::DescriptorType::UNIFORM_BUFFER)
                .descriptor_count(1),
        ];
        let pool_info = vk::DescriptorPoolCreateInfo::default()
            .max_sets(1)
            .pool_sizes(&pool_sizes);
        let descriptor_pool = unsafe {
            device
                .create_descriptor_pool(&pool_info, None)
                .map_err(|e| format!("Failed to create tonemap descriptor pool: {:?}", e))?
        };

        let alloc_layouts = [descriptor_set_layout];
        let alloc_info = vk::DescriptorSetAllocateInfo::default()
            .descriptor_pool(descriptor_pool)
            .set_layouts(&alloc_layouts);
        let descriptor_set = unsafe {
            device
                .allocate_descriptor_sets(&alloc_info)
                .map_err(|e| format!("Failed to allocate tonemap descriptor set: {:?}", e))?[0]
        };

        let flag_buffer = GpuBuffer::new(
            &device,
            ctx.allocator_mut(),
            std::mem::size_of::<u32>() as u64,
            vk::BufferUsageFlags::UNIFORM_BUFFER,
            gpu_allocator::MemoryLocation::CpuToGpu,
            "tonemap_flags",
        )?;

        info!("Tonemap pipeline created");

        let mut pipeline = TonemapPipeline {
            descriptor_set_layout,
            pipeline_layout,
            pipeline,
            descriptor_pool,
            descriptor_set,
            flag_buffer,
        };
        pipeline.set_linear_output(false)?;
        Ok(pipeline)
    }

    /// Swap in freshly compiled bytecode. Caller drains the GPU first.
    pub fn rebuild(&mut self, ctx: &DeviceContext, shaders: &ShaderDirectory) -> Result<(), String> {
        unsafe {
            ctx.device.destroy_pipeline(self.pipeline, None);
        }
        self.pipeline = create_pipeline(ctx, shaders, self.pipeline_layout)?;
        Ok(())
    }

    /// Select linear output (extended-sRGB surfaces) or gamma encoding.
    /// Only changes across a swapchain rebuild, when the GPU is idle.
    pub fn set_linear_output(&mut self, linear: bool) -> Result<(), String> {
        self.flag_buffer.write(&(linear as u32).to_le_bytes())
    }

    /// Point the set at the current HDR input and output images (both in
    /// GENERAL layout when the dispatch runs).
    pub fn write_descriptors(
        &self,
        device: &ash::Device,
        hdr_view: vk::ImageView,
        output_view: vk::ImageView,
    ) {
        let hdr_info = [vk::DescriptorImageInfo::default()
            .image_view(hdr_view)
            .image_layout(vk::ImageLayout::GENERAL)];
        let output_info = [vk::DescriptorImageInfo::default()
            .image_view(output_view)
            .image_layout(vk::ImageLayout::GENERAL)];
        let flag_info = [vk::DescriptorBufferInfo::default()
            .buffer(self.flag_buffer.buffer)
            .range(vk::WHOLE_SIZE)];
        let writes = [
            vk::WriteDescriptorSet::default()
                .dst_set(self.descriptor_set)
                .dst_binding(BINDING_HDR_INPUT)
                .descriptor_type(vk::DescriptorType::STORAGE_IMAGE)
                .image_info(&hdr_info),
            vk::WriteDescriptorSet::default()
                .dst_set(self.descriptor_set)
                .dst_binding(BINDING_OUTPUT)
                .descriptor_type(vk::DescriptorType::STORAGE_IMAGE)
                .image_info(&output_info),
            vk::WriteDescriptorSet::default()
                .dst_set(self.descriptor_set)
                .dst_binding(BINDING_FLAGS)
                .descriptor_type(vk::DescriptorType::UNIFORM_BUFFER)
                .buffer_info(&flag_info),
        ];
        unsafe {
            device.update_descriptor_sets(&writes, &[]);
        }
    }

    /// Record the dispatch covering the full image.
    pub fn cmd_dispatch(
        &self,
        device: &ash::Device,
        cmd: vk::CommandBuffer,
        width: u32,
        height: u32,
    ) {
        let (groups_x, groups_y) = group_counts(width, height);
        unsafe {
            device.cmd_bind_pipeline(cmd, vk::PipelineBindPoint::COMPUTE, self.pipeline);
            device.cmd_bind_descriptor_sets(
                cmd,
                vk::PipelineBindPoint::COMPUTE,
                self.pipeline_layout,
                0,
                &[self.descriptor_set],
                &[],
            );
            device.cmd_dispatch(cmd, groups_x, groups_y, 1);
        }
    }

    pub fn destroy(&mut self, ctx: &mut DeviceContext) {
        let device = ctx.device.clone();
        unsafe {
            device.destroy_pipeline(self.pipeline, None);
            device.destroy_pipeline_layout(self.pipeline_layout, None);
            device.destroy_descriptor_pool(self.descriptor_pool, None);
            device.destroy_descriptor_set_layout(self.descriptor_set_layout, None);
        }
        self.flag_buffer.destroy(&device, ctx.allocator_mut());
    }
}

fn create_pipeline(
    ctx: &DeviceContext,
    shaders: &ShaderDirectory,
    pipeline_layout: vk::PipelineLayout,
) -> Result<vk::Pipeline, String> {
    let device = &ctx.device;
    let words = shaders
        .bytecode(TONEMAP_SHADER)
        .ok_or_else(|| format!("Shader '{}' is not loaded", TONEMAP_SHADER))?;
    let module_info = vk::ShaderModuleCreateInfo::default().code(words);
    let module = unsafe {
        device
            .create_shader_module(&module_info, None)
            .map_err(|e| format!("Failed to create tonemap shader module: {:?}", e))?
    };

    let stage = vk::PipelineShaderStageCreateInfo::default()
        .stage(vk::ShaderStageFlags::COMPUTE)
        .module(module)
        .name(c"main");
    let pipeline_info = vk::ComputePipelineCreateInfo::default()
        .stage(stage)
        .layout(pipeline_layout);

    let result = unsafe {
        device.create_compute_pipelines(vk::PipelineCache::null(), &[pipeline_info], None)
    };
    unsafe {
        device.destroy_shader_module(module, None);
    }
    let pipeline =
        result.map_err(|(_, e)| format!("Failed to create tonemap pipeline: {:?}", e))?[0];
    Ok(pipeline)
}

#[cfg(test)]
mod tests {
    use super::group_counts;

    #[test]
    fn group_counts_cover_the_image() {
        assert_eq!(group_counts(1920, 1080), (240, 135));
        assert_eq!(group_counts(1, 1), (1, 1));
        assert_eq!(group_counts(8, 8), (1, 1));
        assert_eq!(group_counts(9, 17), (2, 3));
    }
}
