//! End-to-end recording tests against a counting mock backend.
//!
//! The mock records every pass, draw, blit and filter request so tests can
//! assert on the encoded work: which draws fold away, when backdrop flips
//! happen, how clips turn into scissors or depth geometry.

use std::cell::RefCell;
use std::rc::Rc;
use std::sync::Arc;

use strato::lyon::math::{point, Box2D, Point};
use strato::{
    BackendError, BlendMode, BlitPass, BlurStyle, BoundsPromise, Canvas, Capabilities, ClipOp,
    Color, Contents, Entity, EntityPassTarget, Geometry, GpuContext, GpuTexture, ImageFilter,
    MaskBlur, Paint, RenderPass, RenderTargetCache, RoundingRadii, SaveLayerOptions, ScissorRect,
    TargetConfig, TextureRef, Transform,
};

#[derive(Debug)]
struct MockTexture {
    size: (u32, u32),
}

impl GpuTexture for MockTexture {
    fn size(&self) -> (u32, u32) {
        self.size
    }
    fn as_any(&self) -> &dyn std::any::Any {
        self
    }
}

fn texture(size: (u32, u32)) -> TextureRef {
    Arc::new(MockTexture { size })
}

#[derive(Default)]
struct PassRecord {
    clear: Option<Color>,
    draws: Vec<Entity>,
    scissors: Vec<Option<ScissorRect>>,
}

#[derive(Default)]
struct Log {
    passes: Vec<PassRecord>,
    blits: u32,
    filters: u32,
    targets_allocated: u32,
}

struct MockRenderPass {
    log: Rc<RefCell<Log>>,
    index: usize,
    size: (u32, u32),
}

impl RenderPass for MockRenderPass {
    fn set_scissor(&mut self, scissor: Option<ScissorRect>) {
        self.log.borrow_mut().passes[self.index].scissors.push(scissor);
    }

    fn draw(&mut self, entity: &Entity) -> bool {
        self.log.borrow_mut().passes[self.index]
            .draws
            .push(entity.clone());
        true
    }

    fn end(self: Box<Self>) -> Result<TextureRef, BackendError> {
        Ok(texture(self.size))
    }
}

struct MockBlitPass {
    log: Rc<RefCell<Log>>,
}

impl BlitPass for MockBlitPass {
    fn copy_texture(&mut self, _: &TextureRef, _: &TextureRef, _: (u32, u32)) -> bool {
        self.log.borrow_mut().blits += 1;
        true
    }

    fn submit(self: Box<Self>) -> Result<(), BackendError> {
        Ok(())
    }
}

struct MockGpu {
    log: Rc<RefCell<Log>>,
    caps: Capabilities,
}

impl MockGpu {
    fn new() -> Self {
        Self {
            log: Rc::new(RefCell::new(Log::default())),
            caps: Capabilities::default(),
        }
    }

    fn with_framebuffer_fetch() -> Self {
        Self {
            caps: Capabilities {
                framebuffer_fetch: true,
                ..Capabilities::default()
            },
            ..Self::new()
        }
    }
}

impl GpuContext for MockGpu {
    fn capabilities(&self) -> Capabilities {
        self.caps
    }

    fn create_offscreen_target(
        &mut self,
        width: u32,
        height: u32,
        config: TargetConfig,
    ) -> Result<EntityPassTarget, BackendError> {
        self.log.borrow_mut().targets_allocated += 1;
        Ok(EntityPassTarget {
            color: texture((width, height)),
            resolve: None,
            depth_stencil: config.depth_stencil.then(|| texture((width, height))),
        })
    }

    fn create_render_pass(
        &mut self,
        target: &EntityPassTarget,
        clear_color: Option<Color>,
    ) -> Result<Box<dyn RenderPass>, BackendError> {
        let mut log = self.log.borrow_mut();
        let index = log.passes.len();
        log.passes.push(PassRecord {
            clear: clear_color,
            ..PassRecord::default()
        });
        Ok(Box::new(MockRenderPass {
            log: self.log.clone(),
            index,
            size: target.size(),
        }))
    }

    fn create_blit_pass(&mut self) -> Result<Box<dyn BlitPass>, BackendError> {
        Ok(Box::new(MockBlitPass {
            log: self.log.clone(),
        }))
    }

    fn render_filter(
        &mut self,
        _filter: &ImageFilter,
        input: &TextureRef,
    ) -> Result<TextureRef, BackendError> {
        self.log.borrow_mut().filters += 1;
        Ok(texture(input.size()))
    }
}

fn rect(x0: f32, y0: f32, x1: f32, y1: f32) -> Box2D {
    Box2D::new(point(x0, y0), point(x1, y1))
}

fn root_target(width: u32, height: u32) -> EntityPassTarget {
    EntityPassTarget {
        color: texture((width, height)),
        resolve: None,
        depth_stencil: Some(texture((width, height))),
    }
}

fn canvas<'a>(
    gpu: &'a mut MockGpu,
    targets: &'a mut RenderTargetCache,
) -> Canvas<'a> {
    Canvas::new(gpu, targets, root_target(100, 100), false, false).unwrap()
}

#[test]
fn save_restore_keeps_stack_balanced() {
    let mut gpu = MockGpu::new();
    let mut targets = RenderTargetCache::new();
    let mut canvas = canvas(&mut gpu, &mut targets);

    let base = canvas.save_count();
    for i in 0..5 {
        canvas.save();
        canvas.translate(i as f32, i as f32);
        canvas.scale(2.0, 2.0);
    }
    assert_eq!(canvas.save_count(), base + 5);
    canvas.restore_to_count(base);
    assert_eq!(canvas.save_count(), base);
    assert_eq!(canvas.current_transform(), Transform::identity());

    // Unbalanced restores must not pop the root scope.
    canvas.restore();
    canvas.restore();
    assert_eq!(canvas.save_count(), base);
    canvas.end_replay().unwrap();
}

#[test]
fn full_cover_opaque_rect_folds_into_clear() {
    let mut gpu = MockGpu::new();
    let mut targets = RenderTargetCache::new();
    let mut canvas = canvas(&mut gpu, &mut targets);

    let red = Color::rgb(255, 0, 0);
    canvas.draw_rect(rect(0.0, 0.0, 100.0, 100.0), &Paint::fill(red));
    canvas.end_replay().unwrap();

    let log = gpu.log.borrow();
    assert_eq!(log.passes.len(), 1);
    assert_eq!(log.passes[0].clear, Some(red));
    assert!(log.passes[0].draws.is_empty());
}

#[test]
fn translucent_full_cover_blends_into_clear() {
    let mut gpu = MockGpu::new();
    let mut targets = RenderTargetCache::new();
    let mut canvas = canvas(&mut gpu, &mut targets);

    canvas.draw_rect(
        rect(0.0, 0.0, 100.0, 100.0),
        &Paint::fill(Color::new(1.0, 0.0, 0.0, 0.5)),
    );
    canvas.end_replay().unwrap();

    let log = gpu.log.borrow();
    assert_eq!(log.passes.len(), 1);
    assert!(log.passes[0].draws.is_empty());
    // Half red over the transparent clear, still straight alpha.
    let clear = log.passes[0].clear.unwrap();
    assert!((clear.r - 1.0).abs() < 1e-5);
    assert!((clear.a - 0.5).abs() < 1e-5);
}

#[test]
fn axis_aligned_clip_reduces_to_scissor() {
    let mut gpu = MockGpu::new();
    let mut targets = RenderTargetCache::new();
    let mut canvas = canvas(&mut gpu, &mut targets);

    canvas.save();
    canvas.clip_rect(rect(0.0, 0.0, 10.0, 10.0), ClipOp::Intersect);
    assert_eq!(canvas.clip_coverage(), Some(rect(0.0, 0.0, 10.0, 10.0)));
    canvas.draw_rect(rect(0.0, 0.0, 20.0, 20.0), &Paint::fill(Color::BLACK));
    canvas.restore();
    assert_eq!(canvas.clip_coverage(), Some(rect(0.0, 0.0, 100.0, 100.0)));
    canvas.end_replay().unwrap();

    let log = gpu.log.borrow();
    assert_eq!(log.passes.len(), 1);
    let pass = &log.passes[0];
    // A rect intersection is pure scissor state, no depth geometry.
    assert!(pass
        .draws
        .iter()
        .all(|e| !matches!(e.contents, Contents::Clip { .. })));
    assert_eq!(
        pass.scissors,
        vec![
            Some(ScissorRect {
                x: 0,
                y: 0,
                width: 10,
                height: 10
            }),
            None,
        ]
    );
}

#[test]
fn shaped_clip_renders_depth_geometry() {
    let mut gpu = MockGpu::new();
    let mut targets = RenderTargetCache::new();
    let mut canvas = canvas(&mut gpu, &mut targets);

    canvas.save();
    canvas.clip_geometry(
        Geometry::Circle {
            center: point(50.0, 50.0),
            radius: 20.0,
        },
        ClipOp::Intersect,
        true,
    );
    canvas.draw_rect(rect(40.0, 40.0, 60.0, 60.0), &Paint::fill(Color::BLACK));
    canvas.restore();
    canvas.end_replay().unwrap();

    let log = gpu.log.borrow();
    let clips: Vec<&Entity> = log.passes[0]
        .draws
        .iter()
        .filter(|e| matches!(e.contents, Contents::Clip { .. }))
        .collect();
    assert_eq!(clips.len(), 1);
    assert_eq!(clips[0].blend_mode, BlendMode::Destination);
    // The clip stamps the scope ceiling, above every draw inside the scope.
    let content_depth = log.passes[0]
        .draws
        .iter()
        .find(|e| !matches!(e.contents, Contents::Clip { .. }))
        .unwrap()
        .clip_depth;
    assert!(clips[0].clip_depth > content_depth);
}

#[test]
fn opacity_only_layer_collapses_without_a_subpass() {
    let mut gpu = MockGpu::new();
    let mut targets = RenderTargetCache::new();
    let mut canvas = canvas(&mut gpu, &mut targets);

    canvas.save_layer(
        &Paint::fill(Color::WHITE.with_alpha(0.5)),
        None,
        SaveLayerOptions {
            can_distribute_opacity: true,
            ..SaveLayerOptions::default()
        },
    );
    canvas.draw_rect(rect(10.0, 10.0, 20.0, 20.0), &Paint::fill(Color::BLACK));
    canvas.restore();
    canvas.end_replay().unwrap();

    assert_eq!(targets.total_acquisitions(), 0);
    let log = gpu.log.borrow();
    assert_eq!(log.passes.len(), 1);
    assert_eq!(log.passes[0].draws.len(), 1);
    assert!((log.passes[0].draws[0].inherited_opacity - 0.5).abs() < 1e-6);
}

#[test]
fn nested_collapsed_layers_multiply_opacity() {
    let mut gpu = MockGpu::new();
    let mut targets = RenderTargetCache::new();
    let mut canvas = canvas(&mut gpu, &mut targets);

    let options = SaveLayerOptions {
        can_distribute_opacity: true,
        ..SaveLayerOptions::default()
    };
    canvas.save_layer(&Paint::fill(Color::WHITE.with_alpha(0.5)), None, options.clone());
    canvas.save_layer(&Paint::fill(Color::WHITE.with_alpha(0.5)), None, options);
    canvas.draw_rect(rect(10.0, 10.0, 20.0, 20.0), &Paint::fill(Color::BLACK));
    canvas.restore();
    canvas.restore();
    canvas.end_replay().unwrap();

    assert_eq!(targets.total_acquisitions(), 0);
    let log = gpu.log.borrow();
    assert!((log.passes[0].draws[0].inherited_opacity - 0.25).abs() < 1e-6);
}

#[test]
fn save_layer_composites_texture_over_parent() {
    let mut gpu = MockGpu::new();
    let mut targets = RenderTargetCache::new();
    let mut canvas = canvas(&mut gpu, &mut targets);

    canvas.save_layer(
        &Paint::fill(Color::WHITE.with_alpha(0.5)),
        Some(rect(0.0, 0.0, 40.0, 40.0)),
        SaveLayerOptions::default(),
    );
    canvas.draw_rect(rect(10.0, 10.0, 20.0, 20.0), &Paint::fill(Color::BLACK));
    canvas.restore();
    canvas.end_replay().unwrap();

    assert_eq!(targets.total_acquisitions(), 1);
    let log = gpu.log.borrow();
    // Layer pass first, then the root pass with the composite quad.
    assert_eq!(log.passes.len(), 2);
    let composite = log.passes[1].draws.last().unwrap();
    match &composite.contents {
        Contents::Texture(c) => assert!((c.opacity - 0.5).abs() < 1e-6),
        other => panic!("expected a texture composite, got {other:?}"),
    }
}

#[test]
fn untouched_save_layer_is_dropped() {
    let mut gpu = MockGpu::new();
    let mut targets = RenderTargetCache::new();
    let mut canvas = canvas(&mut gpu, &mut targets);

    canvas.save_layer(
        &Paint::fill(Color::WHITE.with_alpha(0.5)),
        Some(rect(0.0, 0.0, 40.0, 40.0)),
        SaveLayerOptions::default(),
    );
    canvas.restore();
    canvas.end_replay().unwrap();

    // The target went back to the pool and nothing was composited.
    assert_eq!(targets.pooled(), 1);
    let log = gpu.log.borrow();
    assert_eq!(log.passes.len(), 1);
    assert!(log.passes[0].draws.is_empty());
}

#[test]
fn reserved_scope_jumps_depth_past_its_slots() {
    let mut gpu = MockGpu::new();
    let mut targets = RenderTargetCache::new();
    let mut canvas = canvas(&mut gpu, &mut targets);

    canvas.draw_rect(rect(0.0, 0.0, 5.0, 5.0), &Paint::fill(Color::BLACK));
    canvas.save_reserving(5);
    canvas.draw_rect(rect(10.0, 0.0, 15.0, 5.0), &Paint::fill(Color::BLACK));
    canvas.restore();
    canvas.draw_rect(rect(20.0, 0.0, 25.0, 5.0), &Paint::fill(Color::BLACK));
    canvas.end_replay().unwrap();

    let log = gpu.log.borrow();
    let depths: Vec<u64> = log.passes[0].draws.iter().map(|e| e.clip_depth).collect();
    assert_eq!(depths, vec![0, 1, 6]);
}

#[test]
fn advanced_blend_flips_backdrop_once() {
    let mut gpu = MockGpu::new();
    let mut targets = RenderTargetCache::new();
    let mut canvas = canvas(&mut gpu, &mut targets);

    canvas.draw_rect(rect(0.0, 0.0, 20.0, 20.0), &Paint::fill(Color::rgb(0, 0, 255)));
    canvas.draw_rect(
        rect(10.0, 10.0, 30.0, 30.0),
        &Paint::fill(Color::rgb(255, 0, 0)).with_blend_mode(BlendMode::Multiply),
    );
    canvas.end_replay().unwrap();

    let log = gpu.log.borrow();
    assert_eq!(log.blits, 1);
    assert_eq!(log.passes.len(), 2);
    // The continuation pass loads the blitted snapshot instead of clearing.
    assert_eq!(log.passes[1].clear, None);
    let blended = log.passes[1].draws.last().unwrap();
    match &blended.contents {
        Contents::BackdropBlend {
            mode,
            coverage_hint,
            ..
        } => {
            assert_eq!(*mode, BlendMode::Multiply);
            assert!(coverage_hint.is_some());
        }
        other => panic!("expected a backdrop blend, got {other:?}"),
    }
    assert_eq!(blended.blend_mode, BlendMode::SourceOver);
}

#[test]
fn framebuffer_fetch_avoids_the_flip() {
    let mut gpu = MockGpu::with_framebuffer_fetch();
    let mut targets = RenderTargetCache::new();
    let mut canvas = canvas(&mut gpu, &mut targets);

    canvas.draw_rect(rect(0.0, 0.0, 20.0, 20.0), &Paint::fill(Color::rgb(0, 0, 255)));
    canvas.draw_rect(
        rect(10.0, 10.0, 30.0, 30.0),
        &Paint::fill(Color::rgb(255, 0, 0)).with_blend_mode(BlendMode::Multiply),
    );
    canvas.end_replay().unwrap();

    let log = gpu.log.borrow();
    assert_eq!(log.blits, 0);
    assert_eq!(log.passes.len(), 1);
    let blended = log.passes[0].draws.last().unwrap();
    match &blended.contents {
        Contents::FramebufferBlend { mode, .. } => assert_eq!(*mode, BlendMode::Multiply),
        other => panic!("expected a framebuffer blend, got {other:?}"),
    }
}

#[test]
fn clips_are_replayed_after_a_backdrop_flip() {
    let mut gpu = MockGpu::new();
    let mut targets = RenderTargetCache::new();
    let mut canvas = canvas(&mut gpu, &mut targets);

    canvas.save();
    canvas.clip_geometry(
        Geometry::Circle {
            center: point(50.0, 50.0),
            radius: 30.0,
        },
        ClipOp::Intersect,
        true,
    );
    canvas.draw_rect(
        rect(40.0, 40.0, 60.0, 60.0),
        &Paint::fill(Color::rgb(255, 0, 0)).with_blend_mode(BlendMode::Multiply),
    );
    canvas.restore();
    canvas.end_replay().unwrap();

    let log = gpu.log.borrow();
    assert_eq!(log.passes.len(), 2);
    // The circle clip is stamped once per pass: recorded, then replayed.
    for pass in log.passes.iter() {
        assert_eq!(
            pass.draws
                .iter()
                .filter(|e| matches!(e.contents, Contents::Clip { .. }))
                .count(),
            1
        );
    }
}

#[test]
fn shared_backdrop_id_renders_the_filter_once() {
    let mut gpu = MockGpu::new();
    let mut targets = RenderTargetCache::new();
    let mut canvas = canvas(&mut gpu, &mut targets);

    let options = SaveLayerOptions {
        backdrop_filter: Some(ImageFilter::blur(4.0)),
        backdrop_id: Some(7),
        ..SaveLayerOptions::default()
    };
    for i in 0..2 {
        let origin = 10.0 + i as f32 * 30.0;
        canvas.save_layer(
            &Paint::fill(Color::WHITE),
            Some(rect(origin, 10.0, origin + 20.0, 30.0)),
            options.clone(),
        );
        canvas.restore();
    }
    canvas.end_replay().unwrap();

    let log = gpu.log.borrow();
    assert_eq!(log.filters, 1);
    assert_eq!(log.blits, 1);
}

#[test]
fn distinct_backdrop_filters_do_not_share_snapshots() {
    let mut gpu = MockGpu::new();
    let mut targets = RenderTargetCache::new();
    let mut canvas = canvas(&mut gpu, &mut targets);

    for sigma in [2.0, 8.0] {
        canvas.save_layer(
            &Paint::fill(Color::WHITE),
            Some(rect(10.0, 10.0, 30.0, 30.0)),
            SaveLayerOptions {
                backdrop_filter: Some(ImageFilter::blur(sigma)),
                backdrop_id: Some(7),
                ..SaveLayerOptions::default()
            },
        );
        canvas.restore();
    }
    canvas.end_replay().unwrap();

    let log = gpu.log.borrow();
    // One shared flip, but each filter renders its own snapshot.
    assert_eq!(log.blits, 1);
    assert_eq!(log.filters, 2);
}

#[test]
fn fully_clipped_layer_skips_its_subtree() {
    let mut gpu = MockGpu::new();
    let mut targets = RenderTargetCache::new();
    let mut canvas = canvas(&mut gpu, &mut targets);

    canvas.save();
    canvas.clip_rect(rect(0.0, 0.0, 10.0, 10.0), ClipOp::Intersect);
    canvas.save_layer(
        &Paint::fill(Color::WHITE),
        Some(rect(50.0, 50.0, 60.0, 60.0)),
        SaveLayerOptions::default(),
    );
    canvas.draw_rect(rect(50.0, 50.0, 60.0, 60.0), &Paint::fill(Color::BLACK));
    canvas.restore();
    canvas.restore();
    canvas.end_replay().unwrap();

    assert_eq!(targets.total_acquisitions(), 0);
    let log = gpu.log.borrow();
    assert_eq!(log.passes.len(), 1);
    assert!(log.passes[0].draws.is_empty());
}

#[test]
fn outer_blur_clip_expires_at_restore() {
    let mut gpu = MockGpu::new();
    let mut targets = RenderTargetCache::new();
    let mut canvas = canvas(&mut gpu, &mut targets);

    let paint = Paint {
        mask_blur: Some(MaskBlur::new(BlurStyle::Outer, 4.0)),
        ..Paint::fill(Color::BLACK)
    };
    canvas.draw_round_rect(rect(20.0, 20.0, 60.0, 60.0), RoundingRadii::uniform(8.0), &paint);
    canvas.draw_rect(rect(10.0, 10.0, 90.0, 90.0), &Paint::fill(Color::WHITE));
    canvas.end_replay().unwrap();

    let log = gpu.log.borrow();
    let pass = &log.passes[0];
    let clip = pass
        .draws
        .iter()
        .find(|e| matches!(e.contents, Contents::Clip { .. }))
        .unwrap();
    // A draw recorded after the blur's internal clip scope restores must
    // render at or above the clip's depth stamp; below it the depth test
    // would discard every overlapping pixel.
    let after = pass.draws.last().unwrap();
    assert!(!matches!(after.contents, Contents::Clip { .. }));
    assert!(after.clip_depth >= clip.clip_depth);
}

#[test]
fn solid_blur_layer_keeps_the_paint_blend_mode() {
    let mut gpu = MockGpu::new();
    let mut targets = RenderTargetCache::new();
    let mut canvas = canvas(&mut gpu, &mut targets);

    canvas.draw_rect(rect(0.0, 0.0, 100.0, 100.0), &Paint::fill(Color::rgb(0, 0, 255)));
    let paint = Paint {
        mask_blur: Some(MaskBlur::new(BlurStyle::Solid, 3.0)),
        ..Paint::fill(Color::rgb(255, 0, 0)).with_blend_mode(BlendMode::Multiply)
    };
    canvas.draw_round_rect(rect(20.0, 20.0, 60.0, 60.0), RoundingRadii::uniform(8.0), &paint);
    canvas.end_replay().unwrap();

    let log = gpu.log.borrow();
    // The layer composite carries Multiply, which forces one backdrop flip.
    assert_eq!(log.blits, 1);
    let blended = log
        .passes
        .iter()
        .flat_map(|p| p.draws.iter())
        .find_map(|e| match &e.contents {
            Contents::BackdropBlend { mode, .. } => Some(*mode),
            _ => None,
        });
    assert_eq!(blended, Some(BlendMode::Multiply));
}

#[test]
fn translucent_solid_blur_composites_once() {
    let mut gpu = MockGpu::new();
    let mut targets = RenderTargetCache::new();
    let mut canvas = canvas(&mut gpu, &mut targets);

    let paint = Paint {
        mask_blur: Some(MaskBlur::new(BlurStyle::Solid, 3.0)),
        ..Paint::fill(Color::BLACK.with_alpha(0.5))
    };
    canvas.draw_round_rect(rect(20.0, 20.0, 60.0, 60.0), RoundingRadii::uniform(8.0), &paint);
    canvas.end_replay().unwrap();

    let log = gpu.log.borrow();
    assert_eq!(log.passes.len(), 2);
    // Halo and shape draw at full alpha inside the layer so their overlap
    // blends once; the paint's alpha applies at the composite.
    let layer = &log.passes[0];
    assert_eq!(layer.draws.len(), 2);
    for e in &layer.draws {
        match &e.contents {
            Contents::SolidRRectBlur(sdf) => assert_eq!(sdf.color.a, 1.0),
            Contents::ColorSource(c) => assert_eq!(c.color.a, 1.0),
            other => panic!("unexpected layer contents: {other:?}"),
        }
    }
    let composite = log.passes[1].draws.last().unwrap();
    match &composite.contents {
        Contents::Texture(c) => assert!((c.opacity - 0.5).abs() < 1e-6),
        other => panic!("expected a texture composite, got {other:?}"),
    }
}

#[test]
fn interleaved_scopes_keep_depths_below_their_ceilings() {
    let mut gpu = MockGpu::new();
    let mut targets = RenderTargetCache::new();
    let mut canvas = canvas(&mut gpu, &mut targets);

    const ROOT_CEILING: u64 = 1 << 24;
    let base = canvas.save_count();
    let mut state: u64 = 0x2545F4914F6CDD1D;
    let mut rng = move || {
        state = state
            .wrapping_mul(6364136223846793005)
            .wrapping_add(1442695040888963407);
        (state >> 33) as u32
    };

    // Mirror of the depth contract: a draw takes one slot and clamps at the
    // innermost ceiling, a reserved restore jumps past its reservation, an
    // unreserved scope shares the parent ceiling.
    let mut scopes: Vec<(u64, bool)> = vec![(ROOT_CEILING, false)];
    let mut depth: u64 = 0;
    let mut expected: Vec<u64> = Vec::new();

    for _ in 0..60 {
        match rng() % 5 {
            0 => {
                let parent = scopes.last().unwrap().0;
                canvas.save();
                scopes.push((parent, false));
            }
            1 => {
                let slots = 1 + (rng() % 4) as u64;
                let parent = scopes.last().unwrap().0;
                canvas.save_reserving(slots);
                scopes.push(((depth + slots).min(parent), true));
            }
            2 => {
                // Every clip rect contains the draw rect, so coverage never
                // empties and no draw is culled.
                let inset = (rng() % 10) as f32;
                canvas.clip_rect(rect(0.0, 0.0, 40.0 + inset, 40.0 + inset), ClipOp::Intersect);
            }
            3 => {
                canvas.draw_rect(rect(5.0, 5.0, 15.0, 15.0), &Paint::fill(Color::BLACK));
                let ceiling = scopes.last().unwrap().0;
                if depth >= ceiling {
                    expected.push(ceiling);
                    depth = ceiling;
                } else {
                    expected.push(depth);
                    depth += 1;
                }
            }
            _ => {
                if canvas.save_count() > base {
                    canvas.restore();
                    let (ceiling, reserved) = scopes.pop().unwrap();
                    if reserved {
                        depth = depth.max(ceiling);
                    }
                }
            }
        }
    }
    canvas.restore_to_count(base);
    assert_eq!(canvas.save_count(), base);
    canvas.end_replay().unwrap();

    let log = gpu.log.borrow();
    let depths: Vec<u64> = log.passes[0].draws.iter().map(|e| e.clip_depth).collect();
    assert_eq!(depths, expected);
    assert!(depths.iter().all(|d| *d < ROOT_CEILING));
}

#[test]
fn draw_order_survives_clip_scopes() {
    let mut gpu = MockGpu::new();
    let mut targets = RenderTargetCache::new();
    let mut canvas = canvas(&mut gpu, &mut targets);

    canvas.draw_rect(rect(0.0, 0.0, 5.0, 5.0), &Paint::fill(Color::BLACK));
    canvas.save();
    canvas.clip_rect(rect(0.0, 0.0, 50.0, 50.0), ClipOp::Intersect);
    canvas.draw_rect(rect(10.0, 0.0, 15.0, 5.0), &Paint::fill(Color::BLACK));
    canvas.restore();
    canvas.draw_rect(rect(20.0, 0.0, 25.0, 5.0), &Paint::fill(Color::BLACK));
    canvas.end_replay().unwrap();

    let log = gpu.log.borrow();
    let depths: Vec<u64> = log.passes[0].draws.iter().map(|e| e.clip_depth).collect();
    assert!(depths.windows(2).all(|w| w[0] < w[1]));
}

#[test]
fn offscreen_draws_are_culled() {
    let mut gpu = MockGpu::new();
    let mut targets = RenderTargetCache::new();
    let mut canvas = canvas(&mut gpu, &mut targets);

    canvas.draw_rect(rect(-50.0, -50.0, -10.0, -10.0), &Paint::fill(Color::BLACK));
    canvas.draw_circle(Point::new(500.0, 500.0), 10.0, &Paint::fill(Color::BLACK));
    canvas.end_replay().unwrap();

    let log = gpu.log.borrow();
    assert_eq!(log.passes.len(), 1);
    assert!(log.passes[0].draws.is_empty());
}

#[test]
fn onscreen_readback_blits_through_a_proxy() {
    let mut gpu = MockGpu::new();
    let mut targets = RenderTargetCache::new();
    let mut canvas = Canvas::new(&mut gpu, &mut targets, root_target(64, 64), true, true).unwrap();
    canvas.draw_rect(rect(0.0, 0.0, 10.0, 10.0), &Paint::fill(Color::BLACK));
    canvas.end_replay().unwrap();

    // The proxy came from the cache and was blitted onto the real surface.
    assert_eq!(targets.total_acquisitions(), 1);
    assert_eq!(gpu.log.borrow().blits, 1);
    assert_eq!(targets.pooled(), 1);
}

#[test]
fn bounds_promise_unknown_still_clips_to_bounds() {
    let mut gpu = MockGpu::new();
    let mut targets = RenderTargetCache::new();
    let mut canvas = canvas(&mut gpu, &mut targets);

    canvas.save_layer(
        &Paint::fill(Color::WHITE.with_alpha(0.5)),
        Some(rect(10.0, 10.0, 30.0, 30.0)),
        SaveLayerOptions {
            bounds_promise: BoundsPromise::Unknown,
            ..SaveLayerOptions::default()
        },
    );
    // Partially outside the layer bounds; the subpass extent clips it.
    canvas.draw_rect(rect(20.0, 20.0, 60.0, 60.0), &Paint::fill(Color::BLACK));
    canvas.restore();
    canvas.end_replay().unwrap();

    assert_eq!(targets.total_acquisitions(), 1);
    let log = gpu.log.borrow();
    // The composite quad lands at the layer bounds, not the draw bounds.
    let composite = log.passes[1].draws.last().unwrap();
    match &composite.contents {
        Contents::Texture(c) => {
            assert_eq!(c.quads[0].dst, rect(10.0, 10.0, 30.0, 30.0));
        }
        other => panic!("expected a texture composite, got {other:?}"),
    }
}
