//! Ray tracing pipeline: fixed descriptor table, pipeline layout with a
//! single device-address push constant, shader binding table, and the
//! per-frame uniform.
//!
//! The descriptor layout is fixed rather than reflected from the shaders;
//! the bindings below are the contract the GLSL sources are written
//! against.

use ash::vk;
use bytemuck::{Pod, Zeroable};
use log::info;

use crate::camera::CameraMatrices;
use crate::context::DeviceContext;
use crate::resources::{align_up, device_address, GpuBuffer, Texture};
use crate::shader_dir::ShaderDirectory;

pub const RAYGEN_SHADER: &str = "candela.rgen";
pub const MISS_SHADER: &str = "candela.rmiss";
pub const CLOSEST_HIT_SHADER: &str = "candela.rchit";

/// Size of the sampler array at binding 4. The shaders declare the same
/// fixed count; unused slots are padded with a repeat of slot 0.
pub const MAX_TEXTURES: u32 = 16;

const BINDING_TLAS: u32 = 0;
const BINDING_STORAGE_IMAGE: u32 = 1;
const BINDING_FRAME_UNIFORM: u32 = 2;
const BINDING_MATERIALS: u32 = 3;
const BINDING_TEXTURES: u32 = 4;

/// Per-frame uniform as the shaders read it. The inverse matrices
/// reconstruct primary rays; the emitter table is reached through its raw
/// device address.
#[repr(C)]
#[derive(Clone, Copy, Debug, Pod, Zeroable)]
pub struct FrameUniform {
    pub view_inverse: [f32; 16],
    pub proj_inverse: [f32; 16],
    pub emitter_address: u64,
    pub emitter_count: u32,
    /// Accumulation counter; resets to zero whenever the image history is
    /// invalidated (resize, shader reload).
    pub frame_index: u32,
}

/// Shader binding table geometry derived from the device's RT properties.
/// Three regions (raygen, miss, hit), one handle each.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct SbtLayout {
    /// Stride between handles inside a region.
    pub handle_stride: u64,
    /// Size of each region; regions start at multiples of this.
    pub region_size: u64,
    pub total_size: u64,
}

/// Compute the table geometry from the device alignment rules.
pub fn sbt_layout(handle_size: u64, handle_alignment: u64, base_alignment: u64) -> SbtLayout {
    let handle_stride = align_up(handle_size, handle_alignment);
    let region_size = align_up(handle_stride, base_alignment);
    SbtLayout {
        handle_stride,
        region_size,
        total_size: region_size * 3,
    }
}

/// The ray tracing pipeline and everything keyed to its shader bytecode.
///
/// The descriptor set layout, pool, set, and uniform buffer outlive a hot
/// reload; `rebuild` replaces only the pipeline and the shader binding
/// table.
pub struct RtPipeline {
    pub descriptor_set_layout: vk::DescriptorSetLayout,
    pub pipeline_layout: vk::PipelineLayout,
    pub pipeline: vk::Pipeline,
    descriptor_pool: vk::DescriptorPool,
    pub descriptor_set: vk::DescriptorSet,

    sbt_buffer: GpuBuffer,
    raygen_region: vk::StridedDeviceAddressRegionKHR,
    miss_region: vk::StridedDeviceAddressRegionKHR,
    hit_region: vk::StridedDeviceAddressRegionKHR,

    uniform_buffer: GpuBuffer,
    frame_index: u32,
}

impl RtPipeline {
    pub fn new(ctx: &mut DeviceContext, shaders: &ShaderDirectory) -> Result<Self, String> {
        let device = ctx.device.clone();

        let descriptor_set_layout = create_descriptor_set_layout(&device)?;

        let push_constant_range = vk::PushConstantRange::default()
            .stage_flags(vk::ShaderStageFlags::RAYGEN_KHR | vk::ShaderStageFlags::CLOSEST_HIT_KHR)
            .offset(0)
            .size(std::mem::size_of::<u64>() as u32);
        let set_layouts = [descriptor_set_layout];
        let push_ranges = [push_constant_range];
        let layout_info = vk::PipelineLayoutCreateInfo::default()
            .set_layouts(&set_layouts)
            .push_constant_ranges(&push_ranges);
        let pipeline_layout = unsafe {
            device
                .create_pipeline_layout(&layout_info, None)
                .map_err(|e| format!("Failed to create pipeline layout: {:?}", e))?
        };

        let pipeline = create_pipeline(ctx, shaders, pipeline_layout)?;
        let (sbt_buffer, raygen_region, miss_region, hit_region) = create_sbt(ctx, pipeline)?;

        // --- Descriptor pool and set ---
        let pool_sizes = [
            vk::DescriptorPoolSize::default()
                .ty(vk::DescriptorType::ACCELERATION_STRUCTURE_KHR)
                .descriptor_count(1),
            vk::DescriptorPoolSize::default()
                .ty(vk::DescriptorType::STORAGE_IMAGE)
                .descriptor_count(1),
            vk::DescriptorPoolSize::default()
                .ty(vk::DescriptorType::UNIFORM_BUFFER)
                .descriptor_count(1),
            vk::DescriptorPoolSize::default()
                .ty(vk::DescriptorType::STORAGE_BUFFER)
                .descriptor_count(1),
            vk::DescriptorPoolSize::default()
                .ty(vk::DescriptorType::COMBINED_IMAGE_SAMPLER)
                .descriptor_count(MAX_TEXTURES),
        ];
        let pool_info = vk::DescriptorPoolCreateInfo::default()
            .max_sets(1)
            .pool_sizes(&pool_sizes);
        let descriptor_pool = unsafe {
            device
                .create_descriptor_pool(&pool_info, None)
                .map_err(|e| format!("Failed to create descriptor pool: {:?}", e))?
        };

        let alloc_layouts = [descriptor_set_layout];
        let alloc_info = vk::DescriptorSetAllocateInfo::default()
            .descriptor_pool(descriptor_pool)
            .set_layouts(&alloc_layouts);
        let descriptor_set = unsafe {
            device
                .allocate_descriptor_sets(&alloc_info)
                .map_err(|e| format!("Failed to allocate descriptor set: {:?}", e))?[0]
        };

        let uniform_buffer = GpuBuffer::new(
            &device,
            ctx.allocator_mut(),
            std::mem::size_of::<FrameUniform>() as u64,
            vk::BufferUsageFlags::UNIFORM_BUFFER,
            gpu_allocator::MemoryLocation::CpuToGpu,
            "frame_uniform",
        )?;

        info!("Ray tracing pipeline created");

        Ok(RtPipeline {
            descriptor_set_layout,
            pipeline_layout,
            pipeline,
            descriptor_pool,
            descriptor_set,
            sbt_buffer,
            raygen_region,
            miss_region,
            hit_region,
            uniform_buffer,
            frame_index: 0,
        })
    }

    /// Replace the pipeline and shader binding table after a shader reload.
    /// Layouts, descriptor set, and uniform buffer are untouched; the
    /// caller must have drained the GPU first.
    pub fn rebuild(&mut self, ctx: &mut DeviceContext, shaders: &ShaderDirectory) -> Result<(), String> {
        let device = ctx.device.clone();
        unsafe {
            device.destroy_pipeline(self.pipeline, None);
        }
        self.sbt_buffer.destroy(&device, ctx.allocator_mut());

        self.pipeline = create_pipeline(ctx, shaders, self.pipeline_layout)?;
        let (sbt_buffer, raygen_region, miss_region, hit_region) = create_sbt(ctx, self.pipeline)?;
        self.sbt_buffer = sbt_buffer;
        self.raygen_region = raygen_region;
        self.miss_region = miss_region;
        self.hit_region = hit_region;
        info!("Ray tracing pipeline rebuilt");
        Ok(())
    }

    /// Point the descriptor set at the current scene resources. Called
    /// once after scene upload and again whenever the storage image is
    /// recreated.
    pub fn write_descriptors(
        &self,
        device: &ash::Device,
        tlas: vk::AccelerationStructureKHR,
        storage_image_view: vk::ImageView,
        material_buffer: vk::Buffer,
        textures: &[&Texture],
    ) -> Result<(), String> {
        if textures.is_empty() {
            return Err("Descriptor write requires at least one texture".to_string());
        }

        let structures = [tlas];
        let mut tlas_write_info = vk::WriteDescriptorSetAccelerationStructureKHR::default()
            .acceleration_structures(&structures);
        let mut tlas_write = vk::WriteDescriptorSet::default()
            .dst_set(self.descriptor_set)
            .dst_binding(BINDING_TLAS)
            .descriptor_type(vk::DescriptorType::ACCELERATION_STRUCTURE_KHR)
            .push_next(&mut tlas_write_info);
        // The AS write carries its payload in the pNext chain.
        tlas_write.descriptor_count = 1;

        let image_info = [vk::DescriptorImageInfo::default()
            .image_view(storage_image_view)
            .image_layout(vk::ImageLayout::GENERAL)];
        let image_write = vk::WriteDescriptorSet::default()
            .dst_set(self.descriptor_set)
            .dst_binding(BINDING_STORAGE_IMAGE)
            .descriptor_type(vk::DescriptorType::STORAGE_IMAGE)
            .image_info(&image_info);

        let uniform_info = [vk::DescriptorBufferInfo::default()
            .buffer(self.uniform_buffer.buffer)
            .range(vk::WHOLE_SIZE)];
        let uniform_write = vk::WriteDescriptorSet::default()
            .dst_set(self.descriptor_set)
            .dst_binding(BINDING_FRAME_UNIFORM)
            .descriptor_type(vk::DescriptorType::UNIFORM_BUFFER)
            .buffer_info(&uniform_info);

        let material_info = [vk::DescriptorBufferInfo::default()
            .buffer(material_buffer)
            .range(vk::WHOLE_SIZE)];
        let material_write = vk::WriteDescriptorSet::default()
            .dst_set(self.descriptor_set)
            .dst_binding(BINDING_MATERIALS)
            .descriptor_type(vk::DescriptorType::STORAGE_BUFFER)
            .buffer_info(&material_info);

        // Pad the fixed-size array by repeating slot 0.
        let texture_infos: Vec<vk::DescriptorImageInfo> = (0..MAX_TEXTURES as usize)
            .map(|i| {
                let texture = textures.get(i).unwrap_or(&textures[0]);
                vk::DescriptorImageInfo::default()
                    .sampler(texture.sampler)
                    .image_view(texture.image.view)
                    .image_layout(vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL)
            })
            .collect();
        let texture_write = vk::WriteDescriptorSet::default()
            .dst_set(self.descriptor_set)
            .dst_binding(BINDING_TEXTURES)
            .descriptor_type(vk::DescriptorType::COMBINED_IMAGE_SAMPLER)
            .image_info(&texture_infos);

        unsafe {
            device.update_descriptor_sets(
                &[
                    tlas_write,
                    image_write,
                    uniform_write,
                    material_write,
                    texture_write,
                ],
                &[],
            );
        }
        Ok(())
    }

    /// Upload this frame's uniform. `reset` zeroes the accumulation
    /// counter; otherwise it advances by one per call. The caller must
    /// order this after the frame fence wait, since the buffer is shared
    /// across frames.
    pub fn update_uniform(
        &mut self,
        matrices: &CameraMatrices,
        emitter_address: u64,
        emitter_count: u32,
        reset: bool,
    ) -> Result<(), String> {
        if reset {
            self.frame_index = 0;
        }
        let uniform = frame_uniform(matrices, emitter_address, emitter_count, self.frame_index);
        self.uniform_buffer.write(bytemuck::bytes_of(&uniform))?;
        self.frame_index += 1;
        Ok(())
    }

    pub fn frame_index(&self) -> u32 {
        self.frame_index
    }

    /// Record the trace: bind, push the per-mesh array address, dispatch
    /// one ray per pixel.
    pub fn cmd_trace_rays(
        &self,
        ctx: &DeviceContext,
        cmd: vk::CommandBuffer,
        width: u32,
        height: u32,
        per_mesh_address: u64,
    ) {
        unsafe {
            ctx.device
                .cmd_bind_pipeline(cmd, vk::PipelineBindPoint::RAY_TRACING_KHR, self.pipeline);
            ctx.device.cmd_bind_descriptor_sets(
                cmd,
                vk::PipelineBindPoint::RAY_TRACING_KHR,
                self.pipeline_layout,
                0,
                &[self.descriptor_set],
                &[],
            );
            ctx.device.cmd_push_constants(
                cmd,
                self.pipeline_layout,
                vk::ShaderStageFlags::RAYGEN_KHR | vk::ShaderStageFlags::CLOSEST_HIT_KHR,
                0,
                &per_mesh_address.to_le_bytes(),
            );
            let callable_region = vk::StridedDeviceAddressRegionKHR::default();
            ctx.rt_pipeline_loader.cmd_trace_rays(
                cmd,
                &self.raygen_region,
                &self.miss_region,
                &self.hit_region,
                &callable_region,
                width,
                height,
                1,
            );
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
        self.sbt_buffer.destroy(&device, ctx.allocator_mut());
        self.uniform_buffer.destroy(&device, ctx.allocator_mut());
    }
}

/// Assemble the uniform contents for one frame.
pub fn frame_uniform(
    matrices: &CameraMatrices,
    emitter_address: u64,
    emitter_count: u32,
    frame_index: u32,
) -> FrameUniform {
    FrameUniform {
        view_inverse: matrices.view.inverse().to_cols_array(),
        proj_inverse: matrices.proj.inverse().to_cols_array(),
        emitter_address,
        emitter_count,
        frame_index,
    }
}

/// The fixed set-0 layout shared by all three RT stages.
fn create_descriptor_set_layout(device: &ash::Device) -> Result<vk::DescriptorSetLayout, String> {
    let bindings = [
        vk::DescriptorSetLayoutBinding::default()
            .binding(BINDING_TLAS)
            .descriptor_type(vk::DescriptorType::ACCELERATION_STRUCTURE_KHR)
            .descriptor_count(1)
            .stage_flags(vk::ShaderStageFlags::RAYGEN_KHR | vk::ShaderStageFlags::CLOSEST_HIT_KHR),
        vk::DescriptorSetLayoutBinding::default()
            .binding(BINDING_STORAGE_IMAGE)
            .descriptor_type(vk::DescriptorType::STORAGE_IMAGE)
            .descriptor_count(1)
            .stage_flags(vk::ShaderStageFlags::RAYGEN_KHR),
        vk::DescriptorSetLayoutBinding::default()
            .binding(BINDING_FRAME_UNIFORM)
            .descriptor_type(vk::DescriptorType::UNIFORM_BUFFER)
            .descriptor_count(1)
            .stage_flags(
                vk::ShaderStageFlags::RAYGEN_KHR
                    | vk::ShaderStageFlags::MISS_KHR
                    | vk::ShaderStageFlags::CLOSEST_HIT_KHR,
            ),
        vk::DescriptorSetLayoutBinding::default()
            .binding(BINDING_MATERIALS)
            .descriptor_type(vk::DescriptorType::STORAGE_BUFFER)
            .descriptor_count(1)
            .stage_flags(vk::ShaderStageFlags::CLOSEST_HIT_KHR),
        vk::DescriptorSetLayoutBinding::default()
            .binding(BINDING_TEXTURES)
            .descriptor_type(vk::DescriptorType::COMBINED_IMAGE_SAMPLER)
            .descriptor_count(MAX_TEXTURES)
            .stage_flags(vk::ShaderStageFlags::CLOSEST_HIT_KHR),
    ];
    let layout_info = vk::DescriptorSetLayoutCreateInfo::default().bindings(&bindings);
    unsafe {
        device
            .create_descriptor_set_layout(&layout_info, None)
            .map_err(|e| format!("Failed to create descriptor set layout: {:?}", e))
    }
}

fn create_shader_module(
    device: &ash::Device,
    words: &[u32],
    name: &str,
) -> Result<vk::ShaderModule, String> {
    let create_info = vk::ShaderModuleCreateInfo::default().code(words);
    unsafe {
        device
            .create_shader_module(&create_info, None)
            .map_err(|e| format!("Failed to create shader module '{}': {:?}", name, e))
    }
}

/// Build the three-stage pipeline from the directory's current bytecode.
fn create_pipeline(
    ctx: &DeviceContext,
    shaders: &ShaderDirectory,
    pipeline_layout: vk::PipelineLayout,
) -> Result<vk::Pipeline, String> {
    let device = &ctx.device;

    let mut modules = Vec::with_capacity(3);
    for name in [RAYGEN_SHADER, MISS_SHADER, CLOSEST_HIT_SHADER] {
        let words = shaders
            .bytecode(name)
            .ok_or_else(|| format!("Shader '{}' is not loaded", name))?;
        modules.push(create_shader_module(device, words, name)?);
    }

    let entry_name = c"main";
    let shader_stages = [
        vk::PipelineShaderStageCreateInfo::default()
            .stage(vk::ShaderStageFlags::RAYGEN_KHR)
            .module(modules[0])
            .name(entry_name),
        vk::PipelineShaderStageCreateInfo::default()
            .stage(vk::ShaderStageFlags::MISS_KHR)
            .module(modules[1])
            .name(entry_name),
        vk::PipelineShaderStageCreateInfo::default()
            .stage(vk::ShaderStageFlags::CLOSEST_HIT_KHR)
            .module(modules[2])
            .name(entry_name),
    ];

    let shader_groups = [
        vk::RayTracingShaderGroupCreateInfoKHR::default()
            .ty(vk::RayTracingShaderGroupTypeKHR::GENERAL)
            .general_shader(0)
            .closest_hit_shader(vk::SHADER_UNUSED_KHR)
            .any_hit_shader(vk::SHADER_UNUSED_KHR)
            .intersection_shader(vk::SHADER_UNUSED_KHR),
        vk::RayTracingShaderGroupCreateInfoKHR::default()
            .ty(vk::RayTracingShaderGroupTypeKHR::GENERAL)
            .general_shader(1)
            .closest_hit_shader(vk::SHADER_UNUSED_KHR)
            .any_hit_shader(vk::SHADER_UNUSED_KHR)
            .intersection_shader(vk::SHADER_UNUSED_KHR),
        vk::RayTracingShaderGroupCreateInfoKHR::default()
            .ty(vk::RayTracingShaderGroupTypeKHR::TRIANGLES_HIT_GROUP)
            .general_shader(vk::SHADER_UNUSED_KHR)
            .closest_hit_shader(2)
            .any_hit_shader(vk::SHADER_UNUSED_KHR)
            .intersection_shader(vk::SHADER_UNUSED_KHR),
    ];

    let pipeline_info = vk::RayTracingPipelineCreateInfoKHR::default()
        .stages(&shader_stages)
        .groups(&shader_groups)
        .max_pipeline_ray_recursion_depth(1)
        .layout(pipeline_layout);

    let result = unsafe {
        ctx.rt_pipeline_loader.create_ray_tracing_pipelines(
            vk::DeferredOperationKHR::null(),
            vk::PipelineCache::null(),
            &[pipeline_info],
            None,
        )
    };

    for module in modules {
        unsafe {
            device.destroy_shader_module(module, None);
        }
    }

    let pipeline =
        result.map_err(|e| format!("Failed to create ray tracing pipeline: {:?}", e))?[0];
    Ok(pipeline)
}

/// Build the shader binding table: one handle per region at base-aligned
/// offsets, in a host-visible buffer.
fn create_sbt(
    ctx: &mut DeviceContext,
    pipeline: vk::Pipeline,
) -> Result<
    (
        GpuBuffer,
        vk::StridedDeviceAddressRegionKHR,
        vk::StridedDeviceAddressRegionKHR,
        vk::StridedDeviceAddressRegionKHR,
    ),
    String,
> {
    let device = ctx.device.clone();
    let layout = sbt_layout(
        ctx.rt_properties.shader_group_handle_size as u64,
        ctx.rt_properties.shader_group_handle_alignment as u64,
        ctx.rt_properties.shader_group_base_alignment as u64,
    );
    let handle_size = ctx.rt_properties.shader_group_handle_size as usize;

    let group_count = 3u32;
    let handles = unsafe {
        ctx.rt_pipeline_loader
            .get_ray_tracing_shader_group_handles(
                pipeline,
                0,
                group_count,
                handle_size * group_count as usize,
            )
            .map_err(|e| format!("Failed to get shader group handles: {:?}", e))?
    };

    let mut table = vec![0u8; layout.total_size as usize];
    for group in 0..group_count as usize {
        let src = &handles[group * handle_size..(group + 1) * handle_size];
        let dst = group * layout.region_size as usize;
        table[dst..dst + handle_size].copy_from_slice(src);
    }

    let sbt_buffer = GpuBuffer::new_with_data(
        &device,
        ctx.allocator_mut(),
        &table,
        vk::BufferUsageFlags::SHADER_BINDING_TABLE_KHR
            | vk::BufferUsageFlags::SHADER_DEVICE_ADDRESS,
        "shader_binding_table",
    )?;

    let base = device_address(&device, sbt_buffer.buffer);
    let raygen_region = vk::StridedDeviceAddressRegionKHR {
        device_address: base,
        stride: layout.handle_stride,
        size: layout.region_size,
    };
    let miss_region = vk::StridedDeviceAddressRegionKHR {
        device_address: base + layout.region_size,
        stride: layout.handle_stride,
        size: layout.region_size,
    };
    let hit_region = vk::StridedDeviceAddressRegionKHR {
        device_address: base + 2 * layout.region_size,
        stride: layout.handle_stride,
        size: layout.region_size,
    };

    info!(
        "SBT created: raygen=0x{:X}, miss=0x{:X}, hit=0x{:X}, total={}",
        raygen_region.device_address,
        miss_region.device_address,
        hit_region.device_address,
        layout.total_size
    );

    Ok((sbt_buffer, raygen_region, miss_region, hit_region))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sbt_layout_respects_alignments() {
        // Typical NVIDIA values.
        let layout = sbt_layout(32, 32, 64);
        assert_eq!(layout.handle_stride, 32);
        assert_eq!(layout.region_size, 64);
        assert_eq!(layout.total_size, 192);
        assert_eq!(layout.handle_stride % 32, 0);
        assert_eq!(layout.region_size % 64, 0);
    }

    #[test]
    fn sbt_layout_with_oversized_handles() {
        let layout = sbt_layout(48, 64, 64);
        assert_eq!(layout.handle_stride, 64);
        assert_eq!(layout.region_size, 64);
        assert_eq!(layout.total_size, 192);
        assert!(layout.handle_stride >= 48);
    }

    #[test]
    fn sbt_layout_is_deterministic() {
        assert_eq!(sbt_layout(32, 64, 128), sbt_layout(32, 64, 128));
    }

    #[test]
    fn frame_uniform_layout_is_stable() {
        assert_eq!(std::mem::size_of::<FrameUniform>(), 144);
    }

    #[test]
    fn frame_uniform_inverts_the_camera_and_keeps_the_counter() {
        let matrices = crate::camera::DefaultCamera::matrices(16.0 / 9.0);
        let uniform = frame_uniform(&matrices, 0xD000_1000, 2, 7);
        assert_eq!(uniform.frame_index, 7);
        assert_eq!(uniform.emitter_address, 0xD000_1000);
        assert_eq!(uniform.emitter_count, 2);
        assert_eq!(uniform.view_inverse, matrices.view.inverse().to_cols_array());
        assert_eq!(uniform.proj_inverse, matrices.proj.inverse().to_cols_array());
    }
}
