use glam::{Mat3, Vec2, Vec3};
use log::debug;

use crate::intersect::MAX_T;
use crate::scene::CompiledScene;

const ROTATE_SENSITIVITY: f32 = 0.005;
const FOV_STEP: f32 = 0.05;
const MOVING_RES_SCALE: f32 = 0.25;

/// Mutable view state. Pose, lens, FOV and environment rotation changes
/// invalidate the accumulator; the tone-map settings do not.
#[derive(Debug, Clone)]
pub struct Camera {
    pub position: Vec3,
    pub direction: Vec3,
    pub fov_scale: f32,
    /// `(1 - 1/focal_depth, aperture)` as consumed by the camera shader.
    pub lens: Vec2,
    pub aperture: f32,
    pub focal_depth: f32,
    pub env_theta: f32,
    pub exposure: f32,
    pub saturation: f32,
    pub denoise: bool,
    pub max_sigma: f32,
}

impl Camera {
    pub fn from_scene(scene: &CompiledScene) -> Self {
        let mut camera = Self {
            position: scene.camera_pos,
            direction: scene.camera_dir,
            fov_scale: scene.fov_scale,
            lens: Vec2::new(1.0, 0.0),
            aperture: 0.0,
            focal_depth: f32::INFINITY,
            env_theta: scene.environment_theta,
            exposure: scene.exposure,
            saturation: 1.0,
            denoise: false,
            max_sigma: 1.0,
        };
        if camera.direction == Vec3::ZERO {
            camera.direction = Vec3::Z;
        }
        camera
    }

    /// Feeds an autofocus probe result into the lens model. Misses leave the
    /// focal plane at infinity.
    pub fn refocus(&mut self, distance: f32) {
        if distance >= MAX_T {
            self.focal_depth = f32::INFINITY;
            self.lens = Vec2::new(1.0, self.aperture);
        } else {
            self.focal_depth = distance;
            self.lens = Vec2::new(1.0 - 1.0 / distance, self.aperture);
        }
        debug!("focal depth {}", self.focal_depth);
    }

    fn rotate(&mut self, dx: f32, dy: f32) {
        let yawed = Mat3::from_rotation_y(-dx * ROTATE_SENSITIVITY) * self.direction;
        let right = yawed.cross(Vec3::Y).normalize_or_zero();
        if right == Vec3::ZERO {
            return;
        }
        let pitched = Mat3::from_axis_angle(right, -dy * ROTATE_SENSITIVITY) * yawed;
        // Refuse pitches that reach the poles; yaw still applies.
        self.direction = if pitched.cross(Vec3::Y).length_squared() > 1e-4 {
            pitched.normalize()
        } else {
            yawed.normalize()
        };
    }

    fn translate(&mut self, local: Vec3) {
        let forward = self.direction;
        let right = forward.cross(Vec3::Y).normalize_or_zero();
        self.position += right * local.x + Vec3::Y * local.y + forward * local.z;
    }
}

/// Input messages produced by the windowing layer.
#[derive(Debug, Clone, Copy)]
pub enum Input {
    DragStart,
    DragMove { dx: f32, dy: f32 },
    DragEnd,
    Wheel { delta: f32 },
    /// Local-space step: x right, y up, z forward.
    Translate(Vec3),
    EnvTheta { delta: f32 },
    Aperture { delta: f32 },
    Exposure { delta: f32 },
    Saturation { delta: f32 },
    MaxSigma { delta: f32 },
    ToggleDenoise,
    Active(bool),
}

/// What a tick asked the GPU adapter to do. The adapter owns the actual
/// passes; keeping the loop behind this trait makes its ordering testable.
pub trait FramePasses {
    fn draw_camera(&mut self, camera: &Camera, res_scale: f32, seed: f32);
    fn draw_tracer(&mut self, camera: &Camera, sample: u32, res_scale: f32);
    fn draw_present(&mut self, camera: &Camera, sample: u32, res_scale: f32);
    fn clear_accumulators(&mut self);
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TickResult {
    Continue,
    Finished,
}

/// Progressive sampling state: ping-pong counter, invalidation flags and the
/// sample budget.
pub struct RenderState {
    pub camera: Camera,
    pub pingpong: u32,
    pub max_samples: u32,
    pub frame: i32,
    pub dirty: bool,
    pub moving: bool,
    pub active: bool,
    pub res_scale: f32,
}

impl RenderState {
    pub fn new(scene: &CompiledScene, frame: i32) -> Self {
        Self {
            camera: Camera::from_scene(scene),
            pingpong: 0,
            max_samples: scene.samples,
            frame,
            dirty: false,
            moving: false,
            active: true,
            res_scale: 1.0,
        }
    }

    pub fn apply(&mut self, input: Input) {
        match input {
            Input::DragStart => self.moving = true,
            Input::DragMove { dx, dy } => {
                self.camera.rotate(dx, dy);
                self.dirty = true;
            }
            Input::DragEnd => {
                self.moving = false;
                self.dirty = true;
            }
            Input::Wheel { delta } => {
                self.camera.fov_scale =
                    (self.camera.fov_scale * (1.0 + delta * FOV_STEP)).clamp(0.05, 10.0);
                self.dirty = true;
            }
            Input::Translate(step) => {
                self.camera.translate(step);
                self.dirty = true;
            }
            Input::EnvTheta { delta } => {
                self.camera.env_theta += delta;
                self.dirty = true;
            }
            Input::Aperture { delta } => {
                self.camera.aperture = (self.camera.aperture + delta).max(0.0);
                self.camera.lens.y = self.camera.aperture;
                self.dirty = true;
            }
            Input::Exposure { delta } => {
                self.camera.exposure = (self.camera.exposure + delta).max(0.0);
            }
            Input::Saturation { delta } => {
                self.camera.saturation = (self.camera.saturation + delta).clamp(0.0, 2.0);
            }
            Input::MaxSigma { delta } => {
                self.camera.max_sigma = (self.camera.max_sigma + delta).max(0.0);
            }
            Input::ToggleDenoise => self.camera.denoise = !self.camera.denoise,
            Input::Active(active) => self.active = active,
        }
    }

    /// One frame of the progressive loop: optionally take a sample, always
    /// present, then handle invalidation and the sample budget.
    pub fn tick(&mut self, passes: &mut impl FramePasses, seed: f32) -> TickResult {
        self.res_scale = if self.moving { MOVING_RES_SCALE } else { 1.0 };

        if self.max_samples > 0 && self.pingpong <= self.max_samples && self.active {
            passes.draw_camera(&self.camera, self.res_scale, seed);
            passes.draw_tracer(&self.camera, self.pingpong, self.res_scale);
            self.pingpong += 1;
        }

        passes.draw_present(&self.camera, self.pingpong, self.res_scale);

        if self.dirty {
            // While moving, the next quarter-resolution pass overwrites the
            // accumulator anyway; skip the clear.
            if !self.moving {
                passes.clear_accumulators();
            }
            self.pingpong = 0;
            self.dirty = false;
        }

        if self.pingpong >= self.max_samples && self.frame >= 0 {
            return TickResult::Finished;
        }
        TickResult::Continue
    }
}
