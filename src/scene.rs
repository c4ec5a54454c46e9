//! Scene collaborator types: meshes, material table, emitter table, and the
//! packed per-mesh records the shaders read through a device address.

use bytemuck::{Pod, Zeroable};
use glam::Vec3;

/// Mesh vertex: position + normal + UV = 32 bytes.
#[repr(C)]
#[derive(Clone, Copy, Debug, Pod, Zeroable)]
pub struct Vertex {
    pub position: [f32; 3],
    pub normal: [f32; 3],
    pub uv: [f32; 2],
}

/// One immutable mesh as delivered by the scene importer.
#[derive(Clone)]
pub struct Mesh {
    pub vertices: Vec<Vertex>,
    pub indices: Vec<u32>,
    pub material_id: u32,
    /// Emitted radiance; zero for non-emitting meshes.
    pub emission: [f32; 3],
}

/// Fixed-layout material record uploaded once into the material table.
///
/// `albedo_texture` indexes the sampler array binding; `u32::MAX` means
/// untextured (the shader falls back to `base_color`).
#[repr(C)]
#[derive(Clone, Copy, Debug, Pod, Zeroable)]
pub struct MaterialRecord {
    pub base_color: [f32; 3],
    pub roughness: f32,
    pub metallic: f32,
    pub ior: f32,
    pub albedo_texture: u32,
    pub _pad: u32,
}

/// One emitting (mesh, triangle) pair in the emitter table.
#[repr(C)]
#[derive(Clone, Copy, Debug, Pod, Zeroable)]
pub struct EmitterEntry {
    pub mesh_index: u32,
    pub triangle_index: u32,
    pub radiance: [f32; 3],
    pub _pad: [u32; 3],
}

/// An RGBA8 texture image owned by the scene.
#[derive(Clone)]
pub struct TextureData {
    pub pixels: Vec<u8>,
    pub width: u32,
    pub height: u32,
}

/// Packed per-mesh record; the array's device address is the pipeline's
/// single push constant. Hit shaders index it by instance custom index.
#[repr(C)]
#[derive(Clone, Copy, Debug, Pod, Zeroable)]
pub struct PerMeshData {
    pub vertex_address: u64,
    pub index_address: u64,
    pub material_id: u32,
    pub _pad: u32,
    pub emission: [f32; 3],
    pub _pad2: f32,
}

/// Build the emitter table by scanning meshes for nonzero emission.
///
/// Every triangle of an emitting mesh gets one entry, so the shader can
/// sample emitters uniformly by table index.
pub fn build_emitter_table(meshes: &[Mesh]) -> Vec<EmitterEntry> {
    let mut entries = Vec::new();
    for (mesh_index, mesh) in meshes.iter().enumerate() {
        if mesh.emission == [0.0; 3] {
            continue;
        }
        for triangle_index in 0..mesh.indices.len() as u32 / 3 {
            entries.push(EmitterEntry {
                mesh_index: mesh_index as u32,
                triangle_index,
                radiance: mesh.emission,
                _pad: [0; 3],
            });
        }
    }
    entries
}

fn quad(a: Vec3, b: Vec3, c: Vec3, d: Vec3, material_id: u32, emission: [f32; 3]) -> Mesh {
    let normal = (b - a).cross(d - a).normalize();
    let n = normal.to_array();
    let vertices = vec![
        Vertex { position: a.to_array(), normal: n, uv: [0.0, 0.0] },
        Vertex { position: b.to_array(), normal: n, uv: [1.0, 0.0] },
        Vertex { position: c.to_array(), normal: n, uv: [1.0, 1.0] },
        Vertex { position: d.to_array(), normal: n, uv: [0.0, 1.0] },
    ];
    Mesh {
        vertices,
        indices: vec![0, 1, 2, 0, 2, 3],
        material_id,
        emission,
    }
}

/// Built-in Cornell-style demo scene: five walls and an area emitter near
/// the ceiling. Lets the binary run without any imported assets.
pub fn demo_scene() -> (Vec<Mesh>, Vec<MaterialRecord>, Vec<TextureData>) {
    let white = MaterialRecord {
        base_color: [0.73, 0.73, 0.73],
        roughness: 1.0,
        metallic: 0.0,
        ior: 1.5,
        albedo_texture: u32::MAX,
        _pad: 0,
    };
    let red = MaterialRecord { base_color: [0.65, 0.05, 0.05], ..white };
    let green = MaterialRecord { base_color: [0.12, 0.45, 0.15], ..white };
    let checker = MaterialRecord { albedo_texture: 0, ..white };

    let s = 1.0;
    let meshes = vec![
        // floor (checker-textured)
        quad(
            Vec3::new(-s, -s, -s),
            Vec3::new(s, -s, -s),
            Vec3::new(s, -s, s),
            Vec3::new(-s, -s, s),
            3,
            [0.0; 3],
        ),
        // ceiling
        quad(
            Vec3::new(-s, s, s),
            Vec3::new(s, s, s),
            Vec3::new(s, s, -s),
            Vec3::new(-s, s, -s),
            0,
            [0.0; 3],
        ),
        // back wall
        quad(
            Vec3::new(-s, -s, -s),
            Vec3::new(-s, s, -s),
            Vec3::new(s, s, -s),
            Vec3::new(s, -s, -s),
            0,
            [0.0; 3],
        ),
        // left wall
        quad(
            Vec3::new(-s, -s, s),
            Vec3::new(-s, s, s),
            Vec3::new(-s, s, -s),
            Vec3::new(-s, -s, -s),
            1,
            [0.0; 3],
        ),
        // right wall
        quad(
            Vec3::new(s, -s, -s),
            Vec3::new(s, s, -s),
            Vec3::new(s, s, s),
            Vec3::new(s, -s, s),
            2,
            [0.0; 3],
        ),
        // area light just under the ceiling
        quad(
            Vec3::new(-0.3, s - 0.01, 0.3),
            Vec3::new(0.3, s - 0.01, 0.3),
            Vec3::new(0.3, s - 0.01, -0.3),
            Vec3::new(-0.3, s - 0.01, -0.3),
            0,
            [15.0, 15.0, 15.0],
        ),
    ];

    let materials = vec![white, red, green, checker];
    let textures = vec![checker_texture(256)];
    (meshes, materials, textures)
}

/// Procedural RGBA8 checker texture.
pub fn checker_texture(size: u32) -> TextureData {
    let mut pixels = Vec::with_capacity((size * size * 4) as usize);
    for y in 0..size {
        for x in 0..size {
            let cx = (x * 8 / size) % 2;
            let cy = (y * 8 / size) % 2;
            let v = if cx ^ cy != 0 { 220 } else { 90 };
            pixels.push(v);
            pixels.push(v);
            pixels.push(v);
            pixels.push(255);
        }
    }
    TextureData {
        pixels,
        width: size,
        height: size,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn per_mesh_data_layout_is_stable() {
        // Shaders read these records through raw device addresses; the
        // sizes are part of the GPU ABI.
        assert_eq!(std::mem::size_of::<PerMeshData>(), 40);
        assert_eq!(std::mem::size_of::<MaterialRecord>(), 32);
        assert_eq!(std::mem::size_of::<EmitterEntry>(), 32);
        assert_eq!(std::mem::size_of::<Vertex>(), 32);
    }

    #[test]
    fn emitter_table_lists_every_emitting_triangle() {
        let (meshes, _, _) = demo_scene();
        let table = build_emitter_table(&meshes);
        // Only the light quad emits: 2 triangles.
        assert_eq!(table.len(), 2);
        assert!(table.iter().all(|e| e.mesh_index == 5));
        assert_eq!(table[0].triangle_index, 0);
        assert_eq!(table[1].triangle_index, 1);
        assert_eq!(table[0].radiance, [15.0, 15.0, 15.0]);
    }

    #[test]
    fn demo_scene_references_stay_in_range() {
        let (meshes, materials, textures) = demo_scene();
        for mesh in &meshes {
            assert!((mesh.material_id as usize) < materials.len());
        }
        for mat in &materials {
            if mat.albedo_texture != u32::MAX {
                assert!((mat.albedo_texture as usize) < textures.len());
            }
        }
    }
}
