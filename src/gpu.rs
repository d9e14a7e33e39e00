use std::borrow::Cow;
use std::path::Path;
use std::sync::Arc;

use anyhow::{Context, Result};
use bytemuck::{Pod, Zeroable};
use log::{error, info};
use wgpu::util::DeviceExt;

use crate::pack::PackedBuffer;
use crate::render::{Camera, FramePasses};
use crate::scene::{CompiledScene, RunMode};

/// Device, queue and the window surface. All GPU state is created once at
/// init and lives for the process lifetime.
pub struct Gpu {
    pub device: wgpu::Device,
    pub queue: wgpu::Queue,
    surface: wgpu::Surface<'static>,
    surface_config: wgpu::SurfaceConfiguration,
}

impl Gpu {
    pub fn new(window: Arc<winit::window::Window>, width: u32, height: u32) -> Result<Self> {
        let instance = wgpu::Instance::new(wgpu::InstanceDescriptor::default());
        let surface = instance
            .create_surface(window)
            .context("creating window surface")?;
        let adapter = pollster::block_on(instance.request_adapter(&wgpu::RequestAdapterOptions {
            power_preference: wgpu::PowerPreference::HighPerformance,
            compatible_surface: Some(&surface),
            force_fallback_adapter: false,
        }));
        let Some(adapter) = adapter else {
            error!("no compatible GPU adapter found; cannot continue");
            anyhow::bail!("no compatible GPU adapter");
        };
        info!("rendering on {}", adapter.get_info().name);

        let (device, queue) = pollster::block_on(adapter.request_device(
            &wgpu::DeviceDescriptor {
                label: None,
                required_features: wgpu::Features::empty(),
                required_limits: wgpu::Limits::default(),
                memory_hints: wgpu::MemoryHints::default(),
            },
            None,
        ))
        .context("requesting GPU device")?;

        let capabilities = surface.get_capabilities(&adapter);
        let format = capabilities
            .formats
            .first()
            .copied()
            .context("surface reports no formats")?;
        let surface_config = wgpu::SurfaceConfiguration {
            usage: wgpu::TextureUsages::RENDER_ATTACHMENT,
            format,
            width,
            height,
            present_mode: wgpu::PresentMode::Fifo,
            alpha_mode: capabilities.alpha_modes[0],
            view_formats: vec![],
            desired_maximum_frame_latency: 2,
        };
        surface.configure(&device, &surface_config);

        Ok(Self {
            device,
            queue,
            surface,
            surface_config,
        })
    }

    pub fn resize(&mut self, width: u32, height: u32) {
        if width > 0 && height > 0 {
            self.surface_config.width = width;
            self.surface_config.height = height;
            self.surface.configure(&self.device, &self.surface_config);
        }
    }
}

/// Per-pass uniform block. Written fresh before every draw; the layout
/// mirrors the std140 `Frame` block in the shaders.
#[repr(C)]
#[derive(Debug, Clone, Copy, Pod, Zeroable)]
struct FrameUniforms {
    position: [f32; 4],
    direction: [f32; 4],
    lens: [f32; 2],
    fov_scale: f32,
    seed: f32,
    env_theta: f32,
    exposure: f32,
    saturation: f32,
    max_sigma: f32,
    res_scale: f32,
    denoise: u32,
    sample_index: u32,
    width: u32,
    height: u32,
    _pad: [u32; 3],
}

impl FrameUniforms {
    fn new(camera: &Camera, sample: u32, res_scale: f32, seed: f32, width: u32, height: u32) -> Self {
        Self {
            position: [camera.position.x, camera.position.y, camera.position.z, 1.0],
            direction: [camera.direction.x, camera.direction.y, camera.direction.z, 0.0],
            lens: camera.lens.to_array(),
            fov_scale: camera.fov_scale,
            seed,
            env_theta: camera.env_theta,
            exposure: camera.exposure,
            saturation: camera.saturation,
            max_sigma: camera.max_sigma,
            res_scale,
            denoise: camera.denoise as u32,
            sample_index: sample,
            width,
            height,
            _pad: [0; 3],
        }
    }
}

/// Texture-shape table for the packed buffers, mirroring the std140 `Dims`
/// block.
#[repr(C)]
#[derive(Clone, Copy, Pod, Zeroable)]
struct BufferDims {
    bvh: [u32; 2],
    triangles: [u32; 2],
    normals: [u32; 2],
    uvs: [u32; 2],
    materials: [u32; 2],
    lights: [u32; 2],
    env: [u32; 2],
    atlas: [u32; 2],
}

struct PassUniform {
    buffer: wgpu::Buffer,
    bind_group: wgpu::BindGroup,
}

/// Everything uploaded once at startup: packed storage buffers, range and
/// bin tables, the environment strip and the material atlas array.
struct SceneResources {
    bind_group: wgpu::BindGroup,
    layout: wgpu::BindGroupLayout,
}

/// Render targets: the accumulator ping-pong pair and the camera ray pair.
struct Targets {
    accumulators: [wgpu::TextureView; 2],
    ray_origin: wgpu::TextureView,
    ray_direction: wgpu::TextureView,
    width: u32,
    height: u32,
}

pub struct ScenePasses {
    gpu: Gpu,
    targets: Targets,
    camera_pipeline: wgpu::RenderPipeline,
    tracer_pipeline: wgpu::RenderPipeline,
    present_pipeline: wgpu::RenderPipeline,
    export_pipeline: wgpu::RenderPipeline,
    camera_uniform: PassUniform,
    tracer_uniform: PassUniform,
    present_uniform: PassUniform,
    scene: SceneResources,
    tracer_groups: [wgpu::BindGroup; 2],
    present_groups: [wgpu::BindGroup; 2],
}

const EXPORT_FORMAT: wgpu::TextureFormat = wgpu::TextureFormat::Rgba8UnormSrgb;

impl ScenePasses {
    pub fn new(
        gpu: Gpu,
        scene: &CompiledScene,
        shader_dir: &Path,
        mode: RunMode,
        width: u32,
        height: u32,
    ) -> Result<Self> {
        let device = &gpu.device;

        let frame_layout = device.create_bind_group_layout(&wgpu::BindGroupLayoutDescriptor {
            label: Some("frame uniforms"),
            entries: &[wgpu::BindGroupLayoutEntry {
                binding: 0,
                visibility: wgpu::ShaderStages::VERTEX | wgpu::ShaderStages::FRAGMENT,
                ty: wgpu::BindingType::Buffer {
                    ty: wgpu::BufferBindingType::Uniform,
                    has_dynamic_offset: false,
                    min_binding_size: None,
                },
                count: None,
            }],
        });

        let scene_resources = upload_scene(&gpu, scene)?;
        let targets = create_targets(device, width, height);

        let texture_entry = |binding: u32| wgpu::BindGroupLayoutEntry {
            binding,
            visibility: wgpu::ShaderStages::FRAGMENT,
            ty: wgpu::BindingType::Texture {
                sample_type: wgpu::TextureSampleType::Float { filterable: false },
                view_dimension: wgpu::TextureViewDimension::D2,
                multisampled: false,
            },
            count: None,
        };
        let tracer_tex_layout = device.create_bind_group_layout(&wgpu::BindGroupLayoutDescriptor {
            label: Some("tracer inputs"),
            entries: &[texture_entry(0), texture_entry(1), texture_entry(2)],
        });
        let present_tex_layout = device.create_bind_group_layout(&wgpu::BindGroupLayoutDescriptor {
            label: Some("present input"),
            entries: &[
                texture_entry(0),
                wgpu::BindGroupLayoutEntry {
                    binding: 1,
                    visibility: wgpu::ShaderStages::FRAGMENT,
                    ty: wgpu::BindingType::Sampler(wgpu::SamplerBindingType::NonFiltering),
                    count: None,
                },
            ],
        });
        let present_sampler = device.create_sampler(&wgpu::SamplerDescriptor {
            label: Some("present point"),
            ..Default::default()
        });

        let defines = define_map(&scene.defines);
        let vert = load_shader(device, &shader_dir.join("quad.vert"), naga::ShaderStage::Vertex, &defines)?;
        let camera_frag = load_shader(
            device,
            &shader_dir.join("camera.frag"),
            naga::ShaderStage::Fragment,
            &defines,
        )?;
        let tracer_name = if mode.test { "tracer_test.frag" } else { "tracer.frag" };
        let tracer_frag = load_shader(
            device,
            &shader_dir.join(tracer_name),
            naga::ShaderStage::Fragment,
            &defines,
        )?;
        let present_frag = load_shader(
            device,
            &shader_dir.join("present.frag"),
            naga::ShaderStage::Fragment,
            &defines,
        )?;

        let pipeline = |label: &str,
                        layouts: &[&wgpu::BindGroupLayout],
                        fragment: &wgpu::ShaderModule,
                        formats: &[wgpu::TextureFormat]| {
            let layout = device.create_pipeline_layout(&wgpu::PipelineLayoutDescriptor {
                label: Some(label),
                bind_group_layouts: layouts,
                push_constant_ranges: &[],
            });
            let targets: Vec<Option<wgpu::ColorTargetState>> = formats
                .iter()
                .map(|&format| {
                    Some(wgpu::ColorTargetState {
                        format,
                        blend: None,
                        write_mask: wgpu::ColorWrites::ALL,
                    })
                })
                .collect();
            device.create_render_pipeline(&wgpu::RenderPipelineDescriptor {
                label: Some(label),
                layout: Some(&layout),
                vertex: wgpu::VertexState {
                    module: &vert,
                    entry_point: "main",
                    compilation_options: Default::default(),
                    buffers: &[],
                },
                primitive: wgpu::PrimitiveState::default(),
                depth_stencil: None,
                multisample: wgpu::MultisampleState::default(),
                fragment: Some(wgpu::FragmentState {
                    module: fragment,
                    entry_point: "main",
                    compilation_options: Default::default(),
                    targets: &targets,
                }),
                multiview: None,
                cache: None,
            })
        };

        let ray_format = wgpu::TextureFormat::Rgba32Float;
        let camera_pipeline = pipeline(
            "camera pass",
            &[&frame_layout],
            &camera_frag,
            &[ray_format, ray_format],
        );
        let tracer_pipeline = pipeline(
            "tracer pass",
            &[&frame_layout, &scene_resources.layout, &tracer_tex_layout],
            &tracer_frag,
            &[ray_format],
        );
        let present_pipeline = pipeline(
            "present pass",
            &[&frame_layout, &present_tex_layout],
            &present_frag,
            &[gpu.surface_config.format],
        );
        let export_pipeline = pipeline(
            "export pass",
            &[&frame_layout, &present_tex_layout],
            &present_frag,
            &[EXPORT_FORMAT],
        );

        let pass_uniform = |label: &str| {
            let buffer = device.create_buffer(&wgpu::BufferDescriptor {
                label: Some(label),
                size: std::mem::size_of::<FrameUniforms>() as u64,
                usage: wgpu::BufferUsages::UNIFORM | wgpu::BufferUsages::COPY_DST,
                mapped_at_creation: false,
            });
            let bind_group = device.create_bind_group(&wgpu::BindGroupDescriptor {
                label: Some(label),
                layout: &frame_layout,
                entries: &[wgpu::BindGroupEntry {
                    binding: 0,
                    resource: buffer.as_entire_binding(),
                }],
            });
            PassUniform { buffer, bind_group }
        };
        let camera_uniform = pass_uniform("camera uniforms");
        let tracer_uniform = pass_uniform("tracer uniforms");
        let present_uniform = pass_uniform("present uniforms");

        let tracer_groups = [0usize, 1].map(|read| {
            device.create_bind_group(&wgpu::BindGroupDescriptor {
                label: Some("tracer inputs"),
                layout: &tracer_tex_layout,
                entries: &[
                    wgpu::BindGroupEntry {
                        binding: 0,
                        resource: wgpu::BindingResource::TextureView(
                            &targets.accumulators[read],
                        ),
                    },
                    wgpu::BindGroupEntry {
                        binding: 1,
                        resource: wgpu::BindingResource::TextureView(&targets.ray_origin),
                    },
                    wgpu::BindGroupEntry {
                        binding: 2,
                        resource: wgpu::BindingResource::TextureView(&targets.ray_direction),
                    },
                ],
            })
        });
        let present_groups = [0usize, 1].map(|read| {
            device.create_bind_group(&wgpu::BindGroupDescriptor {
                label: Some("present input"),
                layout: &present_tex_layout,
                entries: &[
                    wgpu::BindGroupEntry {
                        binding: 0,
                        resource: wgpu::BindingResource::TextureView(&targets.accumulators[read]),
                    },
                    wgpu::BindGroupEntry {
                        binding: 1,
                        resource: wgpu::BindingResource::Sampler(&present_sampler),
                    },
                ],
            })
        });

        Ok(Self {
            gpu,
            targets,
            camera_pipeline,
            tracer_pipeline,
            present_pipeline,
            export_pipeline,
            camera_uniform,
            tracer_uniform,
            present_uniform,
            scene: scene_resources,
            tracer_groups,
            present_groups,
        })
    }

    pub fn resize(&mut self, width: u32, height: u32) {
        self.gpu.resize(width, height);
    }

    fn write_uniform(&self, uniform: &PassUniform, value: &FrameUniforms) {
        self.gpu
            .queue
            .write_buffer(&uniform.buffer, 0, bytemuck::bytes_of(value));
    }

    fn scaled_extent(&self, res_scale: f32) -> (f32, f32) {
        let w = (self.targets.width as f32 * res_scale).max(1.0);
        let h = (self.targets.height as f32 * res_scale).max(1.0);
        (w, h)
    }

    /// Renders the tone-mapped image for the finished frame into an
    /// offscreen target and saves it as a PNG.
    pub fn save_frame(&mut self, camera: &Camera, sample: u32, path: &Path) -> Result<()> {
        let device = &self.gpu.device;
        let (width, height) = (self.targets.width, self.targets.height);

        let uniforms = FrameUniforms::new(camera, sample, 1.0, 0.0, width, height);
        self.write_uniform(&self.present_uniform, &uniforms);

        let texture = device.create_texture(&wgpu::TextureDescriptor {
            label: Some("export target"),
            size: wgpu::Extent3d {
                width,
                height,
                depth_or_array_layers: 1,
            },
            mip_level_count: 1,
            sample_count: 1,
            dimension: wgpu::TextureDimension::D2,
            format: EXPORT_FORMAT,
            usage: wgpu::TextureUsages::RENDER_ATTACHMENT | wgpu::TextureUsages::COPY_SRC,
            view_formats: &[],
        });
        let view = texture.create_view(&wgpu::TextureViewDescriptor::default());

        let padded_row = (width * 4).div_ceil(256) * 256;
        let readback = device.create_buffer(&wgpu::BufferDescriptor {
            label: Some("export readback"),
            size: padded_row as u64 * height as u64,
            usage: wgpu::BufferUsages::COPY_DST | wgpu::BufferUsages::MAP_READ,
            mapped_at_creation: false,
        });

        let mut encoder = device.create_command_encoder(&wgpu::CommandEncoderDescriptor::default());
        {
            let mut pass = encoder.begin_render_pass(&wgpu::RenderPassDescriptor {
                label: Some("export pass"),
                color_attachments: &[Some(wgpu::RenderPassColorAttachment {
                    view: &view,
                    resolve_target: None,
                    ops: wgpu::Operations {
                        load: wgpu::LoadOp::Clear(wgpu::Color::BLACK),
                        store: wgpu::StoreOp::Store,
                    },
                })],
                depth_stencil_attachment: None,
                timestamp_writes: None,
                occlusion_query_set: None,
            });
            pass.set_pipeline(&self.export_pipeline);
            pass.set_bind_group(0, &self.present_uniform.bind_group, &[]);
            pass.set_bind_group(1, &self.present_groups[((sample + 1) % 2) as usize], &[]);
            pass.draw(0..3, 0..1);
        }
        encoder.copy_texture_to_buffer(
            wgpu::ImageCopyTexture {
                texture: &texture,
                mip_level: 0,
                origin: wgpu::Origin3d::ZERO,
                aspect: wgpu::TextureAspect::All,
            },
            wgpu::ImageCopyBuffer {
                buffer: &readback,
                layout: wgpu::ImageDataLayout {
                    offset: 0,
                    bytes_per_row: Some(padded_row),
                    rows_per_image: Some(height),
                },
            },
            wgpu::Extent3d {
                width,
                height,
                depth_or_array_layers: 1,
            },
        );
        self.gpu.queue.submit(Some(encoder.finish()));

        let slice = readback.slice(..);
        slice.map_async(wgpu::MapMode::Read, |_| {});
        device.poll(wgpu::Maintain::Wait);
        let data = slice.get_mapped_range();

        let mut pixels = Vec::with_capacity((width * height * 4) as usize);
        for row in data.chunks(padded_row as usize) {
            pixels.extend_from_slice(&row[..(width * 4) as usize]);
        }
        drop(data);
        readback.unmap();

        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("creating {}", parent.display()))?;
        }
        let image = image::RgbaImage::from_raw(width, height, pixels)
            .context("export dimensions mismatch")?;
        image
            .save(path)
            .with_context(|| format!("saving {}", path.display()))?;
        Ok(())
    }
}

impl FramePasses for ScenePasses {
    fn draw_camera(&mut self, camera: &Camera, res_scale: f32, seed: f32) {
        let uniforms = FrameUniforms::new(
            camera,
            0,
            res_scale,
            seed,
            self.targets.width,
            self.targets.height,
        );
        self.write_uniform(&self.camera_uniform, &uniforms);

        let mut encoder = self
            .gpu
            .device
            .create_command_encoder(&wgpu::CommandEncoderDescriptor::default());
        {
            let mut pass = encoder.begin_render_pass(&wgpu::RenderPassDescriptor {
                label: Some("camera pass"),
                color_attachments: &[
                    Some(wgpu::RenderPassColorAttachment {
                        view: &self.targets.ray_origin,
                        resolve_target: None,
                        ops: wgpu::Operations {
                            load: wgpu::LoadOp::Clear(wgpu::Color::BLACK),
                            store: wgpu::StoreOp::Store,
                        },
                    }),
                    Some(wgpu::RenderPassColorAttachment {
                        view: &self.targets.ray_direction,
                        resolve_target: None,
                        ops: wgpu::Operations {
                            load: wgpu::LoadOp::Clear(wgpu::Color::BLACK),
                            store: wgpu::StoreOp::Store,
                        },
                    }),
                ],
                depth_stencil_attachment: None,
                timestamp_writes: None,
                occlusion_query_set: None,
            });
            pass.set_pipeline(&self.camera_pipeline);
            pass.set_bind_group(0, &self.camera_uniform.bind_group, &[]);
            let (w, h) = self.scaled_extent(res_scale);
            pass.set_viewport(0.0, 0.0, w, h, 0.0, 1.0);
            pass.draw(0..3, 0..1);
        }
        self.gpu.queue.submit(Some(encoder.finish()));
    }

    fn draw_tracer(&mut self, camera: &Camera, sample: u32, res_scale: f32) {
        let uniforms = FrameUniforms::new(
            camera,
            sample,
            res_scale,
            0.0,
            self.targets.width,
            self.targets.height,
        );
        self.write_uniform(&self.tracer_uniform, &uniforms);

        let write = (sample % 2) as usize;
        let read = ((sample + 1) % 2) as usize;
        let mut encoder = self
            .gpu
            .device
            .create_command_encoder(&wgpu::CommandEncoderDescriptor::default());
        {
            let mut pass = encoder.begin_render_pass(&wgpu::RenderPassDescriptor {
                label: Some("tracer pass"),
                color_attachments: &[Some(wgpu::RenderPassColorAttachment {
                    view: &self.targets.accumulators[write],
                    resolve_target: None,
                    ops: wgpu::Operations {
                        load: wgpu::LoadOp::Load,
                        store: wgpu::StoreOp::Store,
                    },
                })],
                depth_stencil_attachment: None,
                timestamp_writes: None,
                occlusion_query_set: None,
            });
            pass.set_pipeline(&self.tracer_pipeline);
            pass.set_bind_group(0, &self.tracer_uniform.bind_group, &[]);
            pass.set_bind_group(1, &self.scene.bind_group, &[]);
            pass.set_bind_group(2, &self.tracer_groups[read], &[]);
            let (w, h) = self.scaled_extent(res_scale);
            pass.set_viewport(0.0, 0.0, w, h, 0.0, 1.0);
            pass.draw(0..3, 0..1);
        }
        self.gpu.queue.submit(Some(encoder.finish()));
    }

    fn draw_present(&mut self, camera: &Camera, sample: u32, res_scale: f32) {
        let uniforms = FrameUniforms::new(
            camera,
            sample,
            res_scale,
            0.0,
            self.targets.width,
            self.targets.height,
        );
        self.write_uniform(&self.present_uniform, &uniforms);

        let frame = match self.gpu.surface.get_current_texture() {
            Ok(frame) => frame,
            Err(_) => {
                let (w, h) = (self.gpu.surface_config.width, self.gpu.surface_config.height);
                self.gpu.resize(w, h);
                return;
            }
        };
        let view = frame
            .texture
            .create_view(&wgpu::TextureViewDescriptor::default());

        // The newest accumulator is the one the previous tracer pass wrote.
        let latest = ((sample + 1) % 2) as usize;
        let mut encoder = self
            .gpu
            .device
            .create_command_encoder(&wgpu::CommandEncoderDescriptor::default());
        {
            let mut pass = encoder.begin_render_pass(&wgpu::RenderPassDescriptor {
                label: Some("present pass"),
                color_attachments: &[Some(wgpu::RenderPassColorAttachment {
                    view: &view,
                    resolve_target: None,
                    ops: wgpu::Operations {
                        load: wgpu::LoadOp::Clear(wgpu::Color::BLACK),
                        store: wgpu::StoreOp::Store,
                    },
                })],
                depth_stencil_attachment: None,
                timestamp_writes: None,
                occlusion_query_set: None,
            });
            pass.set_pipeline(&self.present_pipeline);
            pass.set_bind_group(0, &self.present_uniform.bind_group, &[]);
            pass.set_bind_group(1, &self.present_groups[latest], &[]);
            pass.draw(0..3, 0..1);
        }
        self.gpu.queue.submit(Some(encoder.finish()));
        frame.present();
    }

    fn clear_accumulators(&mut self) {
        let mut encoder = self
            .gpu
            .device
            .create_command_encoder(&wgpu::CommandEncoderDescriptor::default());
        for view in &self.targets.accumulators {
            encoder.begin_render_pass(&wgpu::RenderPassDescriptor {
                label: Some("clear accumulator"),
                color_attachments: &[Some(wgpu::RenderPassColorAttachment {
                    view,
                    resolve_target: None,
                    ops: wgpu::Operations {
                        load: wgpu::LoadOp::Clear(wgpu::Color::TRANSPARENT),
                        store: wgpu::StoreOp::Store,
                    },
                })],
                depth_stencil_attachment: None,
                timestamp_writes: None,
                occlusion_query_set: None,
            });
        }
        self.gpu.queue.submit(Some(encoder.finish()));
    }
}

fn create_targets(device: &wgpu::Device, width: u32, height: u32) -> Targets {
    let make = |label: &str| {
        let texture = device.create_texture(&wgpu::TextureDescriptor {
            label: Some(label),
            size: wgpu::Extent3d {
                width,
                height,
                depth_or_array_layers: 1,
            },
            mip_level_count: 1,
            sample_count: 1,
            dimension: wgpu::TextureDimension::D2,
            format: wgpu::TextureFormat::Rgba32Float,
            usage: wgpu::TextureUsages::RENDER_ATTACHMENT | wgpu::TextureUsages::TEXTURE_BINDING,
            view_formats: &[],
        });
        texture.create_view(&wgpu::TextureViewDescriptor::default())
    };
    Targets {
        accumulators: [make("accumulator 0"), make("accumulator 1")],
        ray_origin: make("ray origins"),
        ray_direction: make("ray directions"),
        width,
        height,
    }
}

fn upload_scene(gpu: &Gpu, scene: &CompiledScene) -> Result<SceneResources> {
    let device = &gpu.device;

    let storage = |label: &str, buffer: &PackedBuffer| {
        device.create_buffer_init(&wgpu::util::BufferInitDescriptor {
            label: Some(label),
            contents: bytemuck::cast_slice(&buffer.data),
            usage: wgpu::BufferUsages::STORAGE,
        })
    };
    let bvh = storage("bvh buffer", &scene.buffers.bvh);
    let triangles = storage("triangle buffer", &scene.buffers.triangles);
    let normals = storage("normal buffer", &scene.buffers.normals);
    let uvs = storage("uv buffer", &scene.buffers.uvs);
    let materials = storage("material buffer", &scene.buffers.materials);
    let lights = storage("light buffer", &scene.buffers.lights);

    let dims = BufferDims {
        bvh: [scene.buffers.bvh.width as u32, scene.buffers.bvh.height as u32],
        triangles: [
            scene.buffers.triangles.width as u32,
            scene.buffers.triangles.height as u32,
        ],
        normals: [
            scene.buffers.normals.width as u32,
            scene.buffers.normals.height as u32,
        ],
        uvs: [scene.buffers.uvs.width as u32, scene.buffers.uvs.height as u32],
        materials: [
            scene.buffers.materials.width as u32,
            scene.buffers.materials.height as u32,
        ],
        lights: [
            scene.buffers.lights.width as u32,
            scene.buffers.lights.height as u32,
        ],
        env: [scene.environment.width, scene.environment.height],
        atlas: [scene.atlas_res, scene.atlas_layers.len().max(1) as u32],
    };
    let dims = device.create_buffer_init(&wgpu::util::BufferInitDescriptor {
        label: Some("buffer dims"),
        contents: bytemuck::bytes_of(&dims),
        usage: wgpu::BufferUsages::UNIFORM,
    });

    // std140 pads ivec2/uvec4 array elements to 16 bytes.
    let ranges: Vec<[i32; 4]> = scene
        .light_ranges
        .iter()
        .map(|&[first, last]| [first, last, -1, -1])
        .collect();
    let light_ranges = device.create_buffer_init(&wgpu::util::BufferInitDescriptor {
        label: Some("light ranges"),
        contents: bytemuck::cast_slice(&ranges),
        usage: wgpu::BufferUsages::UNIFORM,
    });
    let bins = device.create_buffer_init(&wgpu::util::BufferInitDescriptor {
        label: Some("radiance bins"),
        contents: bytemuck::cast_slice(&scene.environment.bins),
        usage: wgpu::BufferUsages::UNIFORM,
    });

    let env_texture = device.create_texture(&wgpu::TextureDescriptor {
        label: Some("environment"),
        size: wgpu::Extent3d {
            width: scene.environment.width,
            height: scene.environment.height,
            depth_or_array_layers: 1,
        },
        mip_level_count: 1,
        sample_count: 1,
        dimension: wgpu::TextureDimension::D2,
        format: wgpu::TextureFormat::Rgba32Float,
        usage: wgpu::TextureUsages::TEXTURE_BINDING | wgpu::TextureUsages::COPY_DST,
        view_formats: &[],
    });
    gpu.queue.write_texture(
        wgpu::ImageCopyTexture {
            texture: &env_texture,
            mip_level: 0,
            origin: wgpu::Origin3d::ZERO,
            aspect: wgpu::TextureAspect::All,
        },
        bytemuck::cast_slice(&scene.environment.pixels),
        wgpu::ImageDataLayout {
            offset: 0,
            bytes_per_row: Some(scene.environment.width * 16),
            rows_per_image: Some(scene.environment.height),
        },
        wgpu::Extent3d {
            width: scene.environment.width,
            height: scene.environment.height,
            depth_or_array_layers: 1,
        },
    );
    let env_view = env_texture.create_view(&wgpu::TextureViewDescriptor::default());

    let layer_count = scene.atlas_layers.len().max(1) as u32;
    let atlas_texture = device.create_texture(&wgpu::TextureDescriptor {
        label: Some("material atlas"),
        size: wgpu::Extent3d {
            width: scene.atlas_res,
            height: scene.atlas_res,
            depth_or_array_layers: layer_count,
        },
        mip_level_count: 1,
        sample_count: 1,
        dimension: wgpu::TextureDimension::D2,
        format: wgpu::TextureFormat::Rgba8Unorm,
        usage: wgpu::TextureUsages::TEXTURE_BINDING | wgpu::TextureUsages::COPY_DST,
        view_formats: &[],
    });
    for (layer, image) in scene.atlas_layers.iter().enumerate() {
        gpu.queue.write_texture(
            wgpu::ImageCopyTexture {
                texture: &atlas_texture,
                mip_level: 0,
                origin: wgpu::Origin3d {
                    x: 0,
                    y: 0,
                    z: layer as u32,
                },
                aspect: wgpu::TextureAspect::All,
            },
            image.as_raw(),
            wgpu::ImageDataLayout {
                offset: 0,
                bytes_per_row: Some(scene.atlas_res * 4),
                rows_per_image: Some(scene.atlas_res),
            },
            wgpu::Extent3d {
                width: scene.atlas_res,
                height: scene.atlas_res,
                depth_or_array_layers: 1,
            },
        );
    }
    let atlas_view = atlas_texture.create_view(&wgpu::TextureViewDescriptor {
        dimension: Some(wgpu::TextureViewDimension::D2Array),
        ..Default::default()
    });

    let point_sampler = device.create_sampler(&wgpu::SamplerDescriptor {
        label: Some("point"),
        ..Default::default()
    });
    let linear_sampler = device.create_sampler(&wgpu::SamplerDescriptor {
        label: Some("linear"),
        mag_filter: wgpu::FilterMode::Linear,
        min_filter: wgpu::FilterMode::Linear,
        ..Default::default()
    });

    let storage_entry = |binding: u32| wgpu::BindGroupLayoutEntry {
        binding,
        visibility: wgpu::ShaderStages::FRAGMENT,
        ty: wgpu::BindingType::Buffer {
            ty: wgpu::BufferBindingType::Storage { read_only: true },
            has_dynamic_offset: false,
            min_binding_size: None,
        },
        count: None,
    };
    let uniform_entry = |binding: u32| wgpu::BindGroupLayoutEntry {
        binding,
        visibility: wgpu::ShaderStages::FRAGMENT,
        ty: wgpu::BindingType::Buffer {
            ty: wgpu::BufferBindingType::Uniform,
            has_dynamic_offset: false,
            min_binding_size: None,
        },
        count: None,
    };

    let layout = device.create_bind_group_layout(&wgpu::BindGroupLayoutDescriptor {
        label: Some("scene resources"),
        entries: &[
            storage_entry(0),
            storage_entry(1),
            storage_entry(2),
            storage_entry(3),
            storage_entry(4),
            storage_entry(5),
            uniform_entry(6),
            uniform_entry(7),
            uniform_entry(8),
            wgpu::BindGroupLayoutEntry {
                binding: 9,
                visibility: wgpu::ShaderStages::FRAGMENT,
                ty: wgpu::BindingType::Texture {
                    sample_type: wgpu::TextureSampleType::Float { filterable: false },
                    view_dimension: wgpu::TextureViewDimension::D2,
                    multisampled: false,
                },
                count: None,
            },
            wgpu::BindGroupLayoutEntry {
                binding: 10,
                visibility: wgpu::ShaderStages::FRAGMENT,
                ty: wgpu::BindingType::Texture {
                    sample_type: wgpu::TextureSampleType::Float { filterable: true },
                    view_dimension: wgpu::TextureViewDimension::D2Array,
                    multisampled: false,
                },
                count: None,
            },
            wgpu::BindGroupLayoutEntry {
                binding: 11,
                visibility: wgpu::ShaderStages::FRAGMENT,
                ty: wgpu::BindingType::Sampler(wgpu::SamplerBindingType::NonFiltering),
                count: None,
            },
            wgpu::BindGroupLayoutEntry {
                binding: 12,
                visibility: wgpu::ShaderStages::FRAGMENT,
                ty: wgpu::BindingType::Sampler(wgpu::SamplerBindingType::Filtering),
                count: None,
            },
        ],
    });

    let bind_group = device.create_bind_group(&wgpu::BindGroupDescriptor {
        label: Some("scene resources"),
        layout: &layout,
        entries: &[
            wgpu::BindGroupEntry {
                binding: 0,
                resource: bvh.as_entire_binding(),
            },
            wgpu::BindGroupEntry {
                binding: 1,
                resource: triangles.as_entire_binding(),
            },
            wgpu::BindGroupEntry {
                binding: 2,
                resource: normals.as_entire_binding(),
            },
            wgpu::BindGroupEntry {
                binding: 3,
                resource: uvs.as_entire_binding(),
            },
            wgpu::BindGroupEntry {
                binding: 4,
                resource: materials.as_entire_binding(),
            },
            wgpu::BindGroupEntry {
                binding: 5,
                resource: lights.as_entire_binding(),
            },
            wgpu::BindGroupEntry {
                binding: 6,
                resource: dims.as_entire_binding(),
            },
            wgpu::BindGroupEntry {
                binding: 7,
                resource: light_ranges.as_entire_binding(),
            },
            wgpu::BindGroupEntry {
                binding: 8,
                resource: bins.as_entire_binding(),
            },
            wgpu::BindGroupEntry {
                binding: 9,
                resource: wgpu::BindingResource::TextureView(&env_view),
            },
            wgpu::BindGroupEntry {
                binding: 10,
                resource: wgpu::BindingResource::TextureView(&atlas_view),
            },
            wgpu::BindGroupEntry {
                binding: 11,
                resource: wgpu::BindingResource::Sampler(&point_sampler),
            },
            wgpu::BindGroupEntry {
                binding: 12,
                resource: wgpu::BindingResource::Sampler(&linear_sampler),
            },
        ],
    });

    Ok(SceneResources { bind_group, layout })
}

fn define_map(defines: &[(String, String)]) -> naga::FastHashMap<String, String> {
    let mut map = naga::FastHashMap::default();
    for (key, value) in defines {
        map.insert(key.clone(), value.clone());
    }
    map
}

fn load_shader(
    device: &wgpu::Device,
    path: &Path,
    stage: naga::ShaderStage,
    defines: &naga::FastHashMap<String, String>,
) -> Result<wgpu::ShaderModule> {
    let source = std::fs::read_to_string(path)
        .with_context(|| format!("reading shader {}", path.display()))?;
    info!("compiling shader {}", path.display());
    Ok(device.create_shader_module(wgpu::ShaderModuleDescriptor {
        label: path.file_name().and_then(|n| n.to_str()),
        source: wgpu::ShaderSource::Glsl {
            shader: Cow::Owned(source),
            stage,
            defines: defines.clone(),
        },
    }))
}
