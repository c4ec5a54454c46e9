//! Camera math: perspective projection and look-at view matrix.
//!
//! All matrices use Vulkan clip-space conventions:
//! - Y is flipped (negative in projection)
//! - Depth range [0, 1]
//! - Column-major storage (glam default)

use glam::{Mat4, Vec3};

/// The (view, projection) pair the renderer uploads each frame.
///
/// The ray generation shader uses the inverses to reconstruct primary
/// rays, so both matrices must be invertible.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct CameraMatrices {
    pub view: Mat4,
    pub proj: Mat4,
}

/// Callback computing camera matrices for a framebuffer aspect ratio.
/// Re-invoked whenever the swapchain extent changes.
pub type CameraFn = Box<dyn FnMut(f32) -> CameraMatrices>;

/// Create a perspective projection matrix for Vulkan clip space.
///
/// The Y axis is flipped (m[1][1] = -f) to match Vulkan's top-down
/// convention. Depth maps to [0, 1].
pub fn perspective(fov_y: f32, aspect: f32, near: f32, far: f32) -> Mat4 {
    let f = 1.0 / (fov_y / 2.0).tan();
    Mat4::from_cols(
        glam::Vec4::new(f / aspect, 0.0, 0.0, 0.0),
        glam::Vec4::new(0.0, -f, 0.0, 0.0),
        glam::Vec4::new(0.0, 0.0, far / (near - far), -1.0),
        glam::Vec4::new(0.0, 0.0, (near * far) / (near - far), 0.0),
    )
}

/// Create a look-at view matrix (column-major).
pub fn look_at(eye: Vec3, target: Vec3, up: Vec3) -> Mat4 {
    let f = (target - eye).normalize();
    let s = f.cross(up).normalize();
    let u = s.cross(f);
    Mat4::from_cols(
        glam::Vec4::new(s.x, u.x, -f.x, 0.0),
        glam::Vec4::new(s.y, u.y, -f.y, 0.0),
        glam::Vec4::new(s.z, u.z, -f.z, 0.0),
        glam::Vec4::new(-s.dot(eye), -u.dot(eye), f.dot(eye), 1.0),
    )
}

/// Default camera parameters for the demo scene.
pub struct DefaultCamera;

impl DefaultCamera {
    pub const EYE: Vec3 = Vec3::new(0.0, 0.0, 3.5);
    pub const TARGET: Vec3 = Vec3::ZERO;
    pub const UP: Vec3 = Vec3::new(0.0, 1.0, 0.0);
    pub const FOV_Y_DEG: f32 = 45.0;
    pub const NEAR: f32 = 0.1;
    pub const FAR: f32 = 100.0;

    pub fn matrices(aspect: f32) -> CameraMatrices {
        CameraMatrices {
            view: look_at(Self::EYE, Self::TARGET, Self::UP),
            proj: perspective(Self::FOV_Y_DEG.to_radians(), aspect, Self::NEAR, Self::FAR),
        }
    }

    /// Boxed callback form consumed by the renderer.
    pub fn callback() -> CameraFn {
        Box::new(Self::matrices)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn matrices_are_invertible() {
        let m = DefaultCamera::matrices(16.0 / 9.0);
        assert!(m.view.determinant().abs() > 1e-6);
        assert!(m.proj.determinant().abs() > 1e-6);
    }

    #[test]
    fn projection_flips_y() {
        let proj = perspective(1.0, 1.0, 0.1, 100.0);
        assert!(proj.col(1).y < 0.0);
    }

    #[test]
    fn view_places_eye_at_origin() {
        let view = look_at(DefaultCamera::EYE, DefaultCamera::TARGET, DefaultCamera::UP);
        let eye_in_view = view * DefaultCamera::EYE.extend(1.0);
        assert!(eye_in_view.truncate().length() < 1e-5);
    }
}
