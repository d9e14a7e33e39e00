use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use glam::Vec3;
use log::{error, info};
use winit::dpi::PhysicalSize;
use winit::event::{ElementState, Event, KeyEvent, MouseButton, MouseScrollDelta, WindowEvent};
use winit::event_loop::EventLoop;
use winit::keyboard::{KeyCode, PhysicalKey};
use winit::window::WindowBuilder;

use crate::bvh::DEFAULT_LEAF_SIZE;
use crate::gpu::{Gpu, ScenePasses};
use crate::intersect::{closest_hit, Ray};
use crate::render::{Input, RenderState, TickResult};
use crate::scene::{self, CompiledScene, RunMode};

const MOVE_STEP: f32 = 0.1;

/// Launch parameters.
#[derive(Parser, Debug)]
#[command(version, about = "Progressive GPU path tracer")]
pub struct Args {
    /// Render resolution: WxH, a single square dimension, or empty for the
    /// default
    #[arg(long, default_value = "1280x720")]
    pub res: String,

    /// Frame index: -1 renders interactively, >= 0 saves the finished frame
    /// and exits
    #[arg(long, default_value_t = -1)]
    pub frame: i32,

    /// Scene name, resolved to scenes/<name>.json
    #[arg(long, default_value = "bunny")]
    pub scene: String,

    /// Underscore-joined run mode tags: test, nee, alpha
    #[arg(long, default_value = "")]
    pub mode: String,
}

pub fn parse_resolution(spec: &str) -> Result<(u32, u32)> {
    if spec.is_empty() {
        return Ok((1280, 720));
    }
    if let Some((w, h)) = spec.split_once('x') {
        let width = w.parse().with_context(|| format!("bad width in res \"{spec}\""))?;
        let height = h
            .parse()
            .with_context(|| format!("bad height in res \"{spec}\""))?;
        Ok((width, height))
    } else {
        let side = spec
            .parse()
            .with_context(|| format!("bad resolution \"{spec}\""))?;
        Ok((side, side))
    }
}

fn frame_path(scene_name: &str, frame: i32) -> PathBuf {
    PathBuf::from("render").join(scene_name).join(format!("{frame}.png"))
}

fn probe_focus(state: &mut RenderState, scene: &CompiledScene) {
    let ray = Ray::new(state.camera.position, state.camera.direction);
    let distance = closest_hit(&scene.bvh, &scene.triangles, &ray);
    state.camera.refocus(distance);
}

pub fn run(args: Args) -> Result<()> {
    let (width, height) = parse_resolution(&args.res)?;
    let mode = RunMode::parse(&args.mode);
    let scene_path = PathBuf::from("scenes").join(format!("{}.json", args.scene));
    let root = scene_path
        .parent()
        .unwrap_or_else(|| Path::new("."))
        .to_path_buf();

    let descriptor = scene::load_descriptor(&scene_path)?;
    let compiled = scene::compile(&descriptor, &root, mode, DEFAULT_LEAF_SIZE)?;

    let event_loop = EventLoop::new().context("creating event loop")?;
    let window = Arc::new(
        WindowBuilder::new()
            .with_title("fray")
            .with_inner_size(PhysicalSize::new(width, height))
            .with_resizable(false)
            .build(&event_loop)
            .context("creating window")?,
    );

    let gpu = Gpu::new(window.clone(), width, height)?;
    let mut passes = ScenePasses::new(gpu, &compiled, Path::new("shaders"), mode, width, height)?;

    let mut state = RenderState::new(&compiled, args.frame);
    probe_focus(&mut state, &compiled);

    let scene_name = args.scene.clone();
    let mut dragging = false;
    let mut last_cursor: Option<(f64, f64)> = None;

    event_loop
        .run(move |event, target| match event {
            Event::AboutToWait => window.request_redraw(),
            Event::WindowEvent { event, .. } => match event {
                WindowEvent::CloseRequested => target.exit(),
                WindowEvent::Focused(focused) => state.apply(Input::Active(focused)),
                WindowEvent::Resized(size) => passes.resize(size.width, size.height),
                WindowEvent::MouseInput {
                    state: element,
                    button: MouseButton::Left,
                    ..
                } => match element {
                    ElementState::Pressed => {
                        dragging = true;
                        state.apply(Input::DragStart);
                    }
                    ElementState::Released => {
                        dragging = false;
                        last_cursor = None;
                        state.apply(Input::DragEnd);
                        probe_focus(&mut state, &compiled);
                    }
                },
                WindowEvent::CursorMoved { position, .. } => {
                    if dragging {
                        if let Some((x, y)) = last_cursor {
                            state.apply(Input::DragMove {
                                dx: (position.x - x) as f32,
                                dy: (position.y - y) as f32,
                            });
                        }
                        last_cursor = Some((position.x, position.y));
                    }
                }
                WindowEvent::MouseWheel { delta, .. } => {
                    let amount = match delta {
                        MouseScrollDelta::LineDelta(_, y) => y,
                        MouseScrollDelta::PixelDelta(position) => position.y as f32 / 60.0,
                    };
                    state.apply(Input::Wheel { delta: amount });
                }
                WindowEvent::KeyboardInput { event, .. } => {
                    handle_key(&mut state, &compiled, &event);
                }
                WindowEvent::RedrawRequested => {
                    if state.tick(&mut passes, rand::random::<f32>()) == TickResult::Finished {
                        let out = frame_path(&scene_name, state.frame);
                        match passes.save_frame(&state.camera, state.pingpong, &out) {
                            Ok(()) => info!(
                                "saved {} after {} samples; next frame index {}",
                                out.display(),
                                state.pingpong,
                                state.frame + 1
                            ),
                            Err(err) => error!("failed to save frame: {err:#}"),
                        }
                        target.exit();
                    }
                }
                _ => {}
            },
            _ => {}
        })
        .context("running event loop")?;
    Ok(())
}

fn handle_key(state: &mut RenderState, scene: &CompiledScene, event: &KeyEvent) {
    let PhysicalKey::Code(code) = event.physical_key else {
        return;
    };
    let is_move_key = matches!(
        code,
        KeyCode::KeyW | KeyCode::KeyA | KeyCode::KeyS | KeyCode::KeyD | KeyCode::KeyR | KeyCode::KeyF
    );

    if event.state == ElementState::Released {
        if is_move_key {
            probe_focus(state, scene);
        }
        return;
    }

    let input = match code {
        KeyCode::KeyW => Some(Input::Translate(Vec3::new(0.0, 0.0, MOVE_STEP))),
        KeyCode::KeyS => Some(Input::Translate(Vec3::new(0.0, 0.0, -MOVE_STEP))),
        KeyCode::KeyD => Some(Input::Translate(Vec3::new(MOVE_STEP, 0.0, 0.0))),
        KeyCode::KeyA => Some(Input::Translate(Vec3::new(-MOVE_STEP, 0.0, 0.0))),
        KeyCode::KeyR => Some(Input::Translate(Vec3::new(0.0, MOVE_STEP, 0.0))),
        KeyCode::KeyF => Some(Input::Translate(Vec3::new(0.0, -MOVE_STEP, 0.0))),
        KeyCode::KeyQ => Some(Input::EnvTheta { delta: -0.05 }),
        KeyCode::KeyE => Some(Input::EnvTheta { delta: 0.05 }),
        KeyCode::Comma => Some(Input::Aperture { delta: -0.01 }),
        KeyCode::Period => Some(Input::Aperture { delta: 0.01 }),
        KeyCode::KeyZ => Some(Input::Exposure { delta: -0.1 }),
        KeyCode::KeyX => Some(Input::Exposure { delta: 0.1 }),
        KeyCode::KeyC => Some(Input::Saturation { delta: -0.05 }),
        KeyCode::KeyV => Some(Input::Saturation { delta: 0.05 }),
        KeyCode::KeyB => Some(Input::ToggleDenoise),
        KeyCode::KeyN => Some(Input::MaxSigma { delta: -0.1 }),
        KeyCode::KeyM => Some(Input::MaxSigma { delta: 0.1 }),
        _ => None,
    };
    if let Some(input) = input {
        state.apply(input);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn resolution_specs_parse() {
        assert_eq!(parse_resolution("1280x720").unwrap(), (1280, 720));
        assert_eq!(parse_resolution("512").unwrap(), (512, 512));
        assert_eq!(parse_resolution("").unwrap(), (1280, 720));
        assert!(parse_resolution("axb").is_err());
    }

    #[test]
    fn frame_paths_nest_under_the_scene_name() {
        assert_eq!(
            frame_path("bunny", 3),
            PathBuf::from("render/bunny/3.png")
        );
    }
}
