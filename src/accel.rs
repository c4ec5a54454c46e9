//! Acceleration structures: one bottom-level structure per mesh, one
//! top-level structure over the full instance set.
//!
//! Both follow the same build protocol: describe geometry, query build
//! sizes from the device, allocate the acceleration and scratch buffers,
//! create the structure object, then record the build in a one-shot
//! command. Any API failure is fatal.

use ash::vk;
use log::info;

use crate::context::DeviceContext;
use crate::resources::{device_address, GpuBuffer};
use crate::scene::{Mesh, Vertex};

/// Identity 3x4 row-major transform, as consumed by triangle geometry and
/// instance records.
pub const IDENTITY_TRANSFORM: vk::TransformMatrixKHR = vk::TransformMatrixKHR {
    matrix: [
        1.0, 0.0, 0.0, 0.0, //
        0.0, 1.0, 0.0, 0.0, //
        0.0, 0.0, 1.0, 0.0,
    ],
};

const ACCEL_INPUT_USAGE: vk::BufferUsageFlags = vk::BufferUsageFlags::from_raw(
    vk::BufferUsageFlags::ACCELERATION_STRUCTURE_BUILD_INPUT_READ_ONLY_KHR.as_raw()
        | vk::BufferUsageFlags::SHADER_DEVICE_ADDRESS.as_raw(),
);

/// Bottom-level acceleration structure over one mesh's triangles.
///
/// Owns the acceleration buffer and the vertex/index buffers: hit shaders
/// read geometry through the buffer device addresses recorded in the
/// per-mesh metadata, so those buffers must live as long as the structure.
pub struct BottomLevelAccel {
    pub accel: vk::AccelerationStructureKHR,
    accel_buffer: GpuBuffer,
    vertex_buffer: GpuBuffer,
    index_buffer: GpuBuffer,
    transform_buffer: GpuBuffer,
    accel_address: u64,
    pub primitive_count: u32,
}

impl BottomLevelAccel {
    /// Upload one mesh and build its structure through a one-shot submit.
    pub fn build(ctx: &mut DeviceContext, mesh: &Mesh, name: &str) -> Result<Self, String> {
        let device = ctx.device.clone();
        let accel_loader = ctx.accel_loader.clone();

        let vertex_buffer = GpuBuffer::new_with_data(
            &device,
            ctx.allocator_mut(),
            bytemuck::cast_slice(&mesh.vertices),
            ACCEL_INPUT_USAGE | vk::BufferUsageFlags::STORAGE_BUFFER,
            name,
        )?;
        let index_buffer = GpuBuffer::new_with_data(
            &device,
            ctx.allocator_mut(),
            bytemuck::cast_slice(&mesh.indices),
            ACCEL_INPUT_USAGE | vk::BufferUsageFlags::STORAGE_BUFFER,
            name,
        )?;
        let transform_bytes: [u8; 48] =
            unsafe { std::mem::transmute(IDENTITY_TRANSFORM.matrix) };
        let transform_buffer = GpuBuffer::new_with_data(
            &device,
            ctx.allocator_mut(),
            &transform_bytes,
            ACCEL_INPUT_USAGE,
            name,
        )?;

        let triangles = vk::AccelerationStructureGeometryTrianglesDataKHR::default()
            .vertex_format(vk::Format::R32G32B32_SFLOAT)
            .vertex_data(vk::DeviceOrHostAddressConstKHR {
                device_address: device_address(&device, vertex_buffer.buffer),
            })
            .vertex_stride(std::mem::size_of::<Vertex>() as u64)
            .max_vertex(mesh.vertices.len() as u32 - 1)
            .index_type(vk::IndexType::UINT32)
            .index_data(vk::DeviceOrHostAddressConstKHR {
                device_address: device_address(&device, index_buffer.buffer),
            })
            .transform_data(vk::DeviceOrHostAddressConstKHR {
                device_address: device_address(&device, transform_buffer.buffer),
            });

        let geometry = vk::AccelerationStructureGeometryKHR::default()
            .geometry_type(vk::GeometryTypeKHR::TRIANGLES)
            .flags(vk::GeometryFlagsKHR::OPAQUE)
            .geometry(vk::AccelerationStructureGeometryDataKHR { triangles });

        let primitive_count = mesh.indices.len() as u32 / 3;

        let (accel, accel_buffer, accel_address) = build_structure(
            ctx,
            &accel_loader,
            vk::AccelerationStructureTypeKHR::BOTTOM_LEVEL,
            &geometry,
            primitive_count,
            name,
            false,
        )?;

        info!(
            "BLAS '{}' built: {} triangles, address 0x{:016X}",
            name, primitive_count, accel_address
        );

        Ok(BottomLevelAccel {
            accel,
            accel_buffer,
            vertex_buffer,
            index_buffer,
            transform_buffer,
            accel_address,
            primitive_count,
        })
    }

    /// Acceleration-structure device address; immutable after the build.
    pub fn accel_address(&self) -> u64 {
        self.accel_address
    }

    /// Vertex buffer address for the per-mesh metadata record.
    pub fn vertex_address(&self, device: &ash::Device) -> u64 {
        device_address(device, self.vertex_buffer.buffer)
    }

    /// Index buffer address for the per-mesh metadata record.
    pub fn index_address(&self, device: &ash::Device) -> u64 {
        device_address(device, self.index_buffer.buffer)
    }

    pub fn destroy(&mut self, ctx: &mut DeviceContext) {
        let device = ctx.device.clone();
        unsafe {
            ctx.accel_loader.destroy_acceleration_structure(self.accel, None);
        }
        self.accel_buffer.destroy(&device, ctx.allocator_mut());
        self.vertex_buffer.destroy(&device, ctx.allocator_mut());
        self.index_buffer.destroy(&device, ctx.allocator_mut());
        self.transform_buffer.destroy(&device, ctx.allocator_mut());
    }
}

/// Top-level acceleration structure over the full bottom-level set.
///
/// Enumerates exactly the bottom-level structures present at its last
/// build; a changed geometry set requires a wholesale rebuild.
pub struct TopLevelAccel {
    pub accel: vk::AccelerationStructureKHR,
    accel_buffer: GpuBuffer,
    pub instance_count: u32,
}

impl TopLevelAccel {
    pub fn build(
        ctx: &mut DeviceContext,
        bottom_levels: &[BottomLevelAccel],
    ) -> Result<Self, String> {
        if bottom_levels.is_empty() {
            return Err("Cannot build a top-level structure over zero meshes".to_string());
        }

        let device = ctx.device.clone();
        let accel_loader = ctx.accel_loader.clone();

        let addresses: Vec<u64> = bottom_levels.iter().map(|b| b.accel_address()).collect();
        let instances = build_instances(&addresses);
        let instance_count = instances.len() as u32;

        let instance_bytes: &[u8] = unsafe {
            std::slice::from_raw_parts(
                instances.as_ptr() as *const u8,
                instances.len() * std::mem::size_of::<vk::AccelerationStructureInstanceKHR>(),
            )
        };
        let mut instance_buffer = GpuBuffer::new_with_data(
            &device,
            ctx.allocator_mut(),
            instance_bytes,
            ACCEL_INPUT_USAGE,
            "tlas_instances",
        )?;

        let instances_data = vk::AccelerationStructureGeometryInstancesDataKHR::default()
            .array_of_pointers(false)
            .data(vk::DeviceOrHostAddressConstKHR {
                device_address: device_address(&device, instance_buffer.buffer),
            });

        let geometry = vk::AccelerationStructureGeometryKHR::default()
            .geometry_type(vk::GeometryTypeKHR::INSTANCES)
            .flags(vk::GeometryFlagsKHR::OPAQUE)
            .geometry(vk::AccelerationStructureGeometryDataKHR {
                instances: instances_data,
            });

        let (accel, accel_buffer, _) = build_structure(
            ctx,
            &accel_loader,
            vk::AccelerationStructureTypeKHR::TOP_LEVEL,
            &geometry,
            instance_count,
            "tlas",
            true,
        )?;

        instance_buffer.destroy(&device, ctx.allocator_mut());

        info!("TLAS built over {} instances", instance_count);

        Ok(TopLevelAccel {
            accel,
            accel_buffer,
            instance_count,
        })
    }

    pub fn destroy(&mut self, ctx: &mut DeviceContext) {
        let device = ctx.device.clone();
        unsafe {
            ctx.accel_loader.destroy_acceleration_structure(self.accel, None);
        }
        self.accel_buffer.destroy(&device, ctx.allocator_mut());
    }
}

/// One instance per bottom-level address, in input order: identity
/// transform, full visibility mask, triangle facing cull disabled, custom
/// index = mesh index (hit shaders use it to look up per-mesh metadata).
pub fn build_instances(
    bottom_level_addresses: &[u64],
) -> Vec<vk::AccelerationStructureInstanceKHR> {
    bottom_level_addresses
        .iter()
        .enumerate()
        .map(|(index, &address)| vk::AccelerationStructureInstanceKHR {
            transform: IDENTITY_TRANSFORM,
            instance_custom_index_and_mask: vk::Packed24_8::new(index as u32, 0xFF),
            instance_shader_binding_table_record_offset_and_flags: vk::Packed24_8::new(
                0,
                vk::GeometryInstanceFlagsKHR::TRIANGLE_FACING_CULL_DISABLE.as_raw() as u8,
            ),
            acceleration_structure_reference: vk::AccelerationStructureReferenceKHR {
                device_handle: address,
            },
        })
        .collect()
}

/// Shared size-query/allocate/create/build protocol for both levels.
fn build_structure(
    ctx: &mut DeviceContext,
    accel_loader: &ash::khr::acceleration_structure::Device,
    ty: vk::AccelerationStructureTypeKHR,
    geometry: &vk::AccelerationStructureGeometryKHR,
    primitive_count: u32,
    name: &str,
    barrier_before_build: bool,
) -> Result<(vk::AccelerationStructureKHR, GpuBuffer, u64), String> {
    let device = ctx.device.clone();

    let build_info = vk::AccelerationStructureBuildGeometryInfoKHR::default()
        .ty(ty)
        .flags(vk::BuildAccelerationStructureFlagsKHR::PREFER_FAST_TRACE)
        .mode(vk::BuildAccelerationStructureModeKHR::BUILD)
        .geometries(std::slice::from_ref(geometry));

    let mut build_sizes = vk::AccelerationStructureBuildSizesInfoKHR::default();
    unsafe {
        accel_loader.get_acceleration_structure_build_sizes(
            vk::AccelerationStructureBuildTypeKHR::DEVICE,
            &build_info,
            &[primitive_count],
            &mut build_sizes,
        );
    }

    let accel_buffer = GpuBuffer::new(
        &device,
        ctx.allocator_mut(),
        build_sizes.acceleration_structure_size,
        vk::BufferUsageFlags::ACCELERATION_STRUCTURE_STORAGE_KHR
            | vk::BufferUsageFlags::SHADER_DEVICE_ADDRESS,
        gpu_allocator::MemoryLocation::GpuOnly,
        name,
    )?;

    let create_info = vk::AccelerationStructureCreateInfoKHR::default()
        .buffer(accel_buffer.buffer)
        .size(build_sizes.acceleration_structure_size)
        .ty(ty);
    let accel = unsafe {
        accel_loader
            .create_acceleration_structure(&create_info, None)
            .map_err(|e| format!("Failed to create acceleration structure '{}': {:?}", name, e))?
    };

    let mut scratch_buffer = GpuBuffer::new(
        &device,
        ctx.allocator_mut(),
        build_sizes.build_scratch_size,
        vk::BufferUsageFlags::STORAGE_BUFFER | vk::BufferUsageFlags::SHADER_DEVICE_ADDRESS,
        gpu_allocator::MemoryLocation::GpuOnly,
        name,
    )?;

    let build_info_final = vk::AccelerationStructureBuildGeometryInfoKHR::default()
        .ty(ty)
        .flags(vk::BuildAccelerationStructureFlagsKHR::PREFER_FAST_TRACE)
        .mode(vk::BuildAccelerationStructureModeKHR::BUILD)
        .dst_acceleration_structure(accel)
        .geometries(std::slice::from_ref(geometry))
        .scratch_data(vk::DeviceOrHostAddressKHR {
            device_address: device_address(&device, scratch_buffer.buffer),
        });

    let build_range = vk::AccelerationStructureBuildRangeInfoKHR::default()
        .primitive_count(primitive_count);

    let cmd = ctx.begin_single_commands()?;
    if barrier_before_build {
        // Top-level builds read the bottom-level structures.
        let memory_barrier = vk::MemoryBarrier::default()
            .src_access_mask(
                vk::AccessFlags::ACCELERATION_STRUCTURE_WRITE_KHR
                    | vk::AccessFlags::ACCELERATION_STRUCTURE_READ_KHR,
            )
            .dst_access_mask(
                vk::AccessFlags::ACCELERATION_STRUCTURE_WRITE_KHR
                    | vk::AccessFlags::ACCELERATION_STRUCTURE_READ_KHR,
            );
        unsafe {
            device.cmd_pipeline_barrier(
                cmd,
                vk::PipelineStageFlags::ACCELERATION_STRUCTURE_BUILD_KHR,
                vk::PipelineStageFlags::ACCELERATION_STRUCTURE_BUILD_KHR,
                vk::DependencyFlags::empty(),
                &[memory_barrier],
                &[],
                &[],
            );
        }
    }
    unsafe {
        accel_loader.cmd_build_acceleration_structures(
            cmd,
            &[build_info_final],
            &[std::slice::from_ref(&build_range)],
        );
    }
    ctx.end_single_commands(cmd)?;

    scratch_buffer.destroy(&device, ctx.allocator_mut());

    let addr_info =
        vk::AccelerationStructureDeviceAddressInfoKHR::default().acceleration_structure(accel);
    let address = unsafe { accel_loader.get_acceleration_structure_device_address(&addr_info) };

    Ok((accel, accel_buffer, address))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn instances_correspond_one_to_one_with_addresses() {
        let addresses = [0x1000u64, 0x2000, 0x3000];
        let instances = build_instances(&addresses);
        assert_eq!(instances.len(), addresses.len());
        for (i, inst) in instances.iter().enumerate() {
            assert_eq!(
                unsafe { inst.acceleration_structure_reference.device_handle },
                addresses[i]
            );
            // Custom index in low 24 bits, mask 0xFF in high 8.
            assert_eq!(inst.instance_custom_index_and_mask.low_24(), i as u32);
            assert_eq!(inst.instance_custom_index_and_mask.high_8(), 0xFF);
            assert_eq!(inst.transform.matrix, IDENTITY_TRANSFORM.matrix);
        }
    }

    #[test]
    fn instances_disable_facing_cull() {
        let instances = build_instances(&[42]);
        let flags = instances[0]
            .instance_shader_binding_table_record_offset_and_flags
            .high_8();
        assert_eq!(
            flags as u32,
            vk::GeometryInstanceFlagsKHR::TRIANGLE_FACING_CULL_DISABLE.as_raw()
        );
        assert_eq!(
            instances[0]
                .instance_shader_binding_table_record_offset_and_flags
                .low_24(),
            0
        );
    }
}
