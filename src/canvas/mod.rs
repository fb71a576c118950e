//! The canvas: draw dispatch, the save/clip stack and subpass orchestration.
//!
//! A [`Canvas`] records one frame. Draw calls resolve into entities and are
//! encoded into the current render pass immediately; save layers open
//! offscreen subpasses that composite over their parent at restore. Clipping
//! is emulated with a monotonic depth counter instead of stencil operations,
//! which is why draw order is load-bearing throughout this module.
//!
//! Failure policy: degenerate input and backend exhaustion degrade to logged
//! no-ops. The stack stays balanced either way so callers can always restore
//! what they saved.

mod subpass;

use lyon::math::{point, vector, Box2D, Point};
use lyon::path::{FillRule, Path};
use smallvec::SmallVec;

use crate::backend::{
    BackendError, Capabilities, EntityPassTarget, GpuContext, ScissorRect, TargetConfig,
    TextureRef,
};
use crate::clip_stack::{ClipEntry, ClipOp, ClipStatus};
use crate::color::{BlendMode, Color};
use crate::contents::{
    resolve_contents, wrap_paint_filters, Contents, DrawPlan, TextureContents, TextureQuad,
};
use crate::entity::Entity;
use crate::geometry::{Geometry, RoundingRadii, Transform, VertexMesh};
use crate::paint::{blend_colors, ColorFilter, ImageFilter, Paint, PaintStyle};
use crate::target_cache::RenderTargetCache;
use crate::tessellate::{LyonTessellator, Tessellator};
use crate::text::{TextFrame, TextShadowCache};

use subpass::{
    align_subpass_bounds, BackdropData, LayerInfo, RenderingMode, StackEntry, SubpassState,
};

/// Depth headroom for scopes that reserve no explicit slot count.
const ROOT_DEPTH_CEILING: u64 = 1 << 24;

/// Maximum curve flattening error, in destination pixels.
const PIXEL_TOLERANCE: f32 = 0.25;

/// Promise about how a save layer's explicit bounds relate to what is drawn
/// inside it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum BoundsPromise {
    /// Content may exceed the bounds; the subpass extent clips it.
    #[default]
    Unknown,
    /// Caller guarantees the bounds contain all content.
    ContainsContents,
}

/// Optional save-layer behavior.
#[derive(Clone, Default)]
pub struct SaveLayerOptions {
    /// Filter applied to everything already rendered behind the layer.
    pub backdrop_filter: Option<ImageFilter>,
    /// Layers sharing an id reuse one backdrop snapshot.
    pub backdrop_id: Option<u64>,
    /// Exact depth slot count the layer's subtree will consume. Lets sibling
    /// depth bookkeeping stay correct even when the subtree is skipped.
    pub content_depth: Option<u64>,
    /// Permits the opacity-only peephole collapse.
    pub can_distribute_opacity: bool,
    pub bounds_promise: BoundsPromise,
}

/// Records one frame of drawing into a root render target.
pub struct Canvas<'a> {
    gpu: &'a mut dyn GpuContext,
    targets: &'a mut RenderTargetCache,
    tessellator: Box<dyn Tessellator>,
    shadows: TextShadowCache,
    capabilities: Capabilities,
    stack: SmallVec<[StackEntry; 8]>,
    subpasses: Vec<SubpassState>,
    /// Finished targets held until `end_replay`; their textures may still be
    /// referenced by entities in open passes.
    retired: Vec<EntityPassTarget>,
    backdrops: ahash::AHashMap<u64, BackdropData>,
    current_depth: u64,
    /// Set when rendering through an offscreen proxy that is blitted onto
    /// the real target at `end_replay`.
    readback_dest: Option<EntityPassTarget>,
    finished: bool,
}

impl<'a> Canvas<'a> {
    /// Starts a recording into `root_target`.
    ///
    /// When `is_onscreen` and `requires_readback` are both set, the frame
    /// renders into an offscreen proxy that is blitted onto the target at
    /// [`end_replay`](Self::end_replay), since onscreen surfaces usually
    /// cannot be sampled.
    pub fn new(
        gpu: &'a mut dyn GpuContext,
        targets: &'a mut RenderTargetCache,
        root_target: EntityPassTarget,
        is_onscreen: bool,
        requires_readback: bool,
    ) -> Result<Self, BackendError> {
        targets.start_frame();
        let capabilities = gpu.capabilities();
        let (w, h) = root_target.size();

        let mut readback_dest = None;
        let render_target = if is_onscreen && requires_readback {
            let proxy = targets.acquire(gpu, w, h, root_target.config())?;
            readback_dest = Some(root_target);
            proxy
        } else {
            root_target
        };

        let root_pass = SubpassState::new(
            render_target,
            point(0.0, 0.0),
            (w as f32, h as f32),
            None,
        );
        let mut stack = SmallVec::new();
        stack.push(StackEntry {
            transform: Transform::identity(),
            clip_depth: ROOT_DEPTH_CEILING,
            reserved: false,
            num_clips: 0,
            distributed_opacity: 1.0,
            mode: RenderingMode::Direct,
            skipping: false,
        });

        Ok(Self {
            gpu,
            targets,
            tessellator: Box::new(LyonTessellator::new()),
            shadows: TextShadowCache::new(),
            capabilities,
            stack,
            subpasses: vec![root_pass],
            retired: Vec::new(),
            backdrops: ahash::AHashMap::new(),
            current_depth: 0,
            readback_dest,
            finished: false,
        })
    }

    // --- transform stack ---

    pub fn translate(&mut self, x: f32, y: f32) {
        let top = self.top_mut();
        top.transform = top.transform.pre_translate(vector(x, y));
    }

    pub fn scale(&mut self, x: f32, y: f32) {
        let top = self.top_mut();
        top.transform = top.transform.pre_scale(x, y);
    }

    pub fn rotate(&mut self, degrees: f32) {
        let angle = lyon::geom::euclid::Angle::degrees(degrees);
        let top = self.top_mut();
        top.transform = Transform::rotation(angle).then(&top.transform);
    }

    pub fn concat(&mut self, transform: &Transform) {
        let top = self.top_mut();
        top.transform = transform.then(&top.transform);
    }

    pub fn set_transform(&mut self, transform: Transform) {
        self.top_mut().transform = transform;
    }

    pub fn current_transform(&self) -> Transform {
        self.top().transform
    }

    // --- save / restore ---

    pub fn save(&mut self) {
        self.push_save(None);
    }

    /// Like [`save`](Self::save) but reserves exactly `slots` depth slots for
    /// the scope; restore jumps the depth counter past them.
    pub fn save_reserving(&mut self, slots: u64) {
        self.push_save(Some(slots));
    }

    pub fn save_count(&self) -> usize {
        self.stack.len()
    }

    pub fn restore_to_count(&mut self, count: usize) {
        while self.stack.len() > count.max(1) {
            self.restore();
        }
    }

    /// Opens a save layer: an offscreen subpass composited over the parent
    /// with `paint` at the matching restore.
    ///
    /// An opacity-only paint with no backdrop filter collapses into a plain
    /// save with the opacity distributed to children, skipping the offscreen
    /// pass entirely.
    pub fn save_layer(&mut self, paint: &Paint, bounds: Option<Box2D>, options: SaveLayerOptions) {
        if self.finished {
            return;
        }
        if self.is_skipping() {
            self.push_save(options.content_depth);
            return;
        }

        if options.can_distribute_opacity
            && options.backdrop_filter.is_none()
            && paint.is_opacity_only()
        {
            let opacity = paint.layer_opacity();
            self.push_save(options.content_depth);
            if let Some(top) = self.stack.last_mut() {
                top.distributed_opacity *= opacity;
            }
            return;
        }

        // Subpass extent: content coverage clamped to the parent's clip.
        let parent = match self.subpasses.last() {
            Some(p) => p,
            None => return,
        };
        let parent_origin = parent.origin;
        let parent_msaa = parent.target.is_msaa();
        let Some(clip_cov) = parent.clip_stack.coverage() else {
            self.push_skipping(options.content_depth);
            return;
        };
        let clip_cov_global = clip_cov.translate(vector(parent_origin.x, parent_origin.y));

        let content_global = match bounds {
            Some(b) => {
                let mut c = self.top().transform.outer_transformed_box(&b);
                if let Some(filter) = &paint.image_filter {
                    let pad = filter.coverage_padding();
                    c = c.inflate(pad, pad);
                }
                c
            }
            None => clip_cov_global,
        };
        let Some(coverage) = content_global.intersection(&clip_cov_global) else {
            self.push_skipping(options.content_depth);
            return;
        };

        let aligned = align_subpass_bounds(coverage, paint.image_filter.is_some());
        let width_px = (aligned.width.ceil() as u32).max(1);
        let height_px = (aligned.height.ceil() as u32).max(1);

        let config = TargetConfig {
            msaa: parent_msaa && self.capabilities.offscreen_msaa,
            depth_stencil: true,
        };
        let target = match self
            .targets
            .acquire(&mut *self.gpu, width_px, height_px, config)
        {
            Ok(t) => t,
            Err(err) => {
                tracing::warn!(%err, "save layer target unavailable, skipping its subtree");
                self.push_skipping(options.content_depth);
                return;
            }
        };

        let ceiling = self.reserved_ceiling(options.content_depth);
        let parent_transform = self.top().transform;
        let mode = if options.backdrop_filter.is_some() {
            RenderingMode::SubpassWithBackdrop
        } else {
            RenderingMode::Subpass
        };
        self.stack.push(StackEntry {
            transform: parent_transform,
            clip_depth: ceiling,
            reserved: options.content_depth.is_some(),
            num_clips: 0,
            distributed_opacity: 1.0,
            mode,
            skipping: false,
        });

        let layer = LayerInfo {
            paint: paint.clone(),
            origin: aligned.origin,
            size: (aligned.width, aligned.height),
            did_round_out: aligned.did_round_out,
        };
        self.subpasses.push(SubpassState::new(
            target,
            aligned.origin,
            (aligned.width, aligned.height),
            Some(layer),
        ));

        if let Some(filter) = options.backdrop_filter {
            self.apply_backdrop_filter(&filter, options.backdrop_id);
        }
    }

    pub fn restore(&mut self) {
        if self.stack.len() <= 1 {
            tracing::warn!("restore without a matching save");
            return;
        }
        let Some(entry) = self.stack.pop() else {
            return;
        };
        if entry.reserved {
            self.current_depth = self.current_depth.max(entry.clip_depth);
        }
        match entry.mode {
            RenderingMode::Direct => {
                let idx = self.subpasses.len() - 1;
                if let Some(sp) = self.subpasses.last_mut() {
                    let removed = sp.clip_stack.restore();
                    if removed as u64 != entry.num_clips {
                        tracing::trace!(
                            removed,
                            recorded = entry.num_clips,
                            "clip count mismatch at restore (culled clips)"
                        );
                    }
                }
                self.refresh_scissor(idx);
            }
            RenderingMode::Subpass | RenderingMode::SubpassWithBackdrop => {
                self.composite_finished_layer();
            }
        }
    }

    // --- clipping ---

    pub fn clip_rect(&mut self, rect: Box2D, op: ClipOp) {
        self.clip_geometry(Geometry::Rect(rect), op, true);
    }

    /// Records a clip against the current scope.
    ///
    /// Axis-aligned rect intersections reduce to a scissor update; other
    /// shapes additionally render into the depth buffer so overdraw past the
    /// true boundary is rejected.
    pub fn clip_geometry(&mut self, geometry: Geometry, op: ClipOp, is_aa: bool) {
        if self.finished || self.is_skipping() {
            return;
        }
        let idx = self.subpasses.len() - 1;
        let transform = self.subpasses[idx].local_transform(&self.top().transform);
        let clip_depth = self.top().clip_depth;

        let status =
            self.subpasses[idx]
                .clip_stack
                .record_clip(geometry.clone(), transform, op, is_aa, clip_depth);
        if status == ClipStatus::Culled {
            return;
        }
        self.top_mut().num_clips += 1;
        self.refresh_scissor(idx);

        if status == ClipStatus::NeedsRender {
            let extent = self.subpasses[idx].clip_stack.initial_coverage();
            if let Some(mesh) =
                clip_write_mesh(&mut *self.tessellator, &geometry, &transform, op, extent)
            {
                self.draw_clip_entity(idx, Entity {
                    transform: Transform::identity(),
                    blend_mode: BlendMode::Destination,
                    clip_depth,
                    inherited_opacity: 1.0,
                    contents: Contents::Clip { mesh, op },
                });
            }
        }
    }

    /// Current clip coverage in canvas coordinates, `None` when everything
    /// is clipped away.
    pub fn clip_coverage(&self) -> Option<Box2D> {
        let sp = self.subpasses.last()?;
        Some(
            sp.clip_stack
                .coverage()?
                .translate(vector(sp.origin.x, sp.origin.y)),
        )
    }

    // --- draw operations ---

    pub fn draw_path(&mut self, path: Path, fill_rule: FillRule, paint: &Paint) {
        self.draw_geometry(
            Geometry::FillPath {
                path,
                fill_rule,
                convex: false,
            },
            paint,
        );
    }

    pub fn draw_rect(&mut self, rect: Box2D, paint: &Paint) {
        self.draw_geometry(Geometry::Rect(rect), paint);
    }

    pub fn draw_oval(&mut self, rect: Box2D, paint: &Paint) {
        self.draw_geometry(Geometry::Ellipse(rect), paint);
    }

    pub fn draw_circle(&mut self, center: Point, radius: f32, paint: &Paint) {
        self.draw_geometry(Geometry::Circle { center, radius }, paint);
    }

    pub fn draw_round_rect(&mut self, rect: Box2D, radii: RoundingRadii, paint: &Paint) {
        self.draw_geometry(Geometry::RoundRect { rect, radii }, paint);
    }

    pub fn draw_superellipse(&mut self, rect: Box2D, corner_radius: f32, paint: &Paint) {
        self.draw_geometry(
            Geometry::Superellipse {
                rect,
                corner_radius,
            },
            paint,
        );
    }

    pub fn draw_arc(
        &mut self,
        oval: Box2D,
        start_degrees: f32,
        sweep_degrees: f32,
        include_center: bool,
        paint: &Paint,
    ) {
        self.draw_geometry(
            Geometry::Arc {
                oval,
                start_degrees,
                sweep_degrees,
                include_center,
            },
            paint,
        );
    }

    pub fn draw_line(&mut self, from: Point, to: Point, paint: &Paint) {
        if from == to {
            return;
        }
        let mut builder = Path::builder();
        builder.begin(from);
        builder.line_to(to);
        builder.end(false);
        self.draw_geometry(
            Geometry::StrokePath {
                path: builder.build(),
                stroke: paint.stroke,
            },
            paint,
        );
    }

    /// Draws a dashed line with `on`-length dashes separated by `off`-length
    /// gaps. Non-positive lengths fall back to a solid line.
    pub fn draw_dashed_line(&mut self, from: Point, to: Point, on: f32, off: f32, paint: &Paint) {
        if on <= 0.0 || off <= 0.0 {
            self.draw_line(from, to, paint);
            return;
        }
        let delta = to - from;
        let length = delta.length();
        if !length.is_finite() || length <= 0.0 {
            return;
        }
        let direction = delta / length;
        let mut builder = Path::builder();
        let mut t = 0.0;
        while t < length {
            let end = (t + on).min(length);
            builder.begin(from + direction * t);
            builder.line_to(from + direction * end);
            builder.end(false);
            t += on + off;
        }
        self.draw_geometry(
            Geometry::StrokePath {
                path: builder.build(),
                stroke: paint.stroke,
            },
            paint,
        );
    }

    pub fn draw_points(&mut self, points: &[Point], radius: f32, round: bool, paint: &Paint) {
        self.draw_geometry(
            Geometry::PointField {
                points: points.to_vec(),
                radius,
                round,
            },
            paint,
        );
    }

    /// Fills everything visible under the current clip.
    pub fn draw_paint(&mut self, paint: &Paint) {
        self.draw_geometry(Geometry::Cover, paint);
    }

    pub fn draw_color(&mut self, color: Color, blend_mode: BlendMode) {
        self.draw_paint(&Paint::fill(color).with_blend_mode(blend_mode));
    }

    pub fn draw_vertices(&mut self, mesh: VertexMesh, paint: &Paint) {
        self.draw_geometry(Geometry::Vertices(mesh), paint);
    }

    pub fn draw_image(&mut self, texture: TextureRef, position: Point, paint: &Paint) {
        let (w, h) = texture.size();
        let src = Box2D::new(point(0.0, 0.0), point(w as f32, h as f32));
        let dst = Box2D::new(position, point(position.x + w as f32, position.y + h as f32));
        self.draw_image_rect(texture, src, dst, paint);
    }

    pub fn draw_image_rect(&mut self, texture: TextureRef, src: Box2D, dst: Box2D, paint: &Paint) {
        if self.finished || self.is_skipping() || src.is_empty() || dst.is_empty() {
            return;
        }
        let contents = Contents::Texture(TextureContents {
            texture,
            quads: vec![TextureQuad { src, dst }],
            opacity: paint.color.a,
        });
        self.submit_contents(wrap_paint_filters(contents, paint), paint.blend_mode, true);
    }

    /// Draws many sprites from one texture in a single entity.
    pub fn draw_atlas(&mut self, texture: TextureRef, quads: &[TextureQuad], paint: &Paint) {
        if self.finished || self.is_skipping() || quads.is_empty() {
            return;
        }
        let contents = Contents::Texture(TextureContents {
            texture,
            quads: quads.to_vec(),
            opacity: paint.color.a,
        });
        self.submit_contents(wrap_paint_filters(contents, paint), paint.blend_mode, true);
    }

    /// Draws a pre-shaped text frame at `position`.
    ///
    /// A paint with a mask blur renders the frame as a blurred shadow, served
    /// from the shadow cache when the same run was blurred before.
    pub fn draw_text_frame(&mut self, frame: &TextFrame, position: Point, paint: &Paint) {
        if self.finished || self.is_skipping() {
            return;
        }
        if let Some(blur) = paint.mask_blur.filter(|b| b.is_effective()) {
            self.draw_text_shadow(frame, position, blur.sigma, paint);
            return;
        }
        let offset = vector(position.x, position.y);
        let quads: Vec<TextureQuad> = frame
            .glyphs
            .iter()
            .map(|g| TextureQuad {
                src: g.src,
                dst: g.dst.translate(offset),
            })
            .collect();
        if quads.is_empty() {
            return;
        }
        let contents = Contents::Texture(TextureContents {
            texture: frame.atlas.clone(),
            quads,
            opacity: paint.color.a,
        });
        self.submit_contents(wrap_paint_filters(contents, paint), paint.blend_mode, true);
    }

    /// Draws geometry with `paint`. The escape hatch for shapes without a
    /// dedicated method (convex path hints, vertex meshes built by hand).
    pub fn draw_geometry(&mut self, geometry: Geometry, paint: &Paint) {
        if self.finished || self.is_skipping() {
            return;
        }

        // The full-cover sentinel renders in pass space, not canvas space.
        let (geometry, canvas_space) = if matches!(geometry, Geometry::Cover) {
            let Some(sp) = self.subpasses.last() else {
                return;
            };
            let Some(coverage) = sp.clip_stack.coverage() else {
                return;
            };
            (Geometry::Rect(coverage), false)
        } else {
            (geometry, true)
        };

        let transform = if canvas_space {
            match self.subpasses.last() {
                Some(sp) => sp.local_transform(&self.top().transform),
                None => return,
            }
        } else {
            Transform::identity()
        };
        let tolerance = tolerance_for(&transform);

        let geometry = if paint.style == PaintStyle::Stroke
            && !matches!(geometry, Geometry::StrokePath { .. })
        {
            let Some(path) = geometry.outline_path(tolerance) else {
                return;
            };
            Geometry::StrokePath {
                path,
                stroke: paint.stroke,
            }
        } else {
            geometry
        };

        let Some(plan) = resolve_contents(geometry, paint, &mut *self.tessellator, tolerance)
        else {
            return;
        };
        match plan {
            DrawPlan::Single(contents) => {
                self.submit_contents(contents, paint.blend_mode, canvas_space);
            }
            DrawPlan::BlurredWithCrisp {
                blurred,
                crisp,
                needs_layer,
                layer_alpha,
            } => {
                if needs_layer {
                    // The halo and shape land in the layer at full alpha so
                    // their overlap blends once; the paint's alpha and blend
                    // mode apply at the composite.
                    let layer_paint = Paint {
                        blend_mode: paint.blend_mode,
                        ..Paint::fill(Color::WHITE.with_alpha(layer_alpha))
                    };
                    self.save_layer(&layer_paint, None, SaveLayerOptions::default());
                    self.submit_contents(blurred, BlendMode::SourceOver, canvas_space);
                    self.submit_contents(crisp, BlendMode::SourceOver, canvas_space);
                    self.restore();
                } else {
                    self.submit_contents(blurred, paint.blend_mode, canvas_space);
                    self.submit_contents(crisp, paint.blend_mode, canvas_space);
                }
            }
            DrawPlan::ClippedBlur {
                clip,
                clip_op,
                blurred,
            } => {
                // One slot for the blurred draw plus the ceiling slot the
                // clip stamps; the reserved restore advances the depth
                // counter past the stamp so later draws are not clipped.
                self.save_reserving(2);
                self.clip_geometry(clip, clip_op, true);
                self.submit_contents(blurred, paint.blend_mode, canvas_space);
                self.restore();
            }
        }
    }

    /// Finishes the recording: unwinds open scopes, flushes the root pass
    /// and resolves the readback proxy if one is in play. Returns the final
    /// output texture.
    pub fn end_replay(mut self) -> Result<TextureRef, BackendError> {
        self.finished = false;
        while self.stack.len() > 1 {
            self.restore();
        }
        self.finished = true;

        let Some(mut root) = self.subpasses.pop() else {
            return Err(BackendError::PassCreation);
        };
        if root.pass.is_none() {
            let clear = root.pending_clear.take();
            root.pass = Some(self.gpu.create_render_pass(&root.target, clear)?);
        }
        let Some(pass) = root.pass.take() else {
            return Err(BackendError::PassCreation);
        };
        let texture = pass.end()?;

        let output = match self.readback_dest.take() {
            Some(dest) => {
                let mut blit = self.gpu.create_blit_pass()?;
                blit.copy_texture(&texture, &dest.color, (0, 0));
                blit.submit()?;
                // The root proxy came from the cache; the destination target
                // belongs to the caller.
                self.retired.push(root.target);
                dest.readable()
            }
            None => texture,
        };

        for target in self.retired.drain(..) {
            self.targets.recycle(target);
        }
        self.backdrops.clear();
        self.targets.end_frame();
        Ok(output)
    }

    // --- internals ---

    fn top(&self) -> &StackEntry {
        &self.stack[self.stack.len() - 1]
    }

    fn top_mut(&mut self) -> &mut StackEntry {
        let last = self.stack.len() - 1;
        &mut self.stack[last]
    }

    fn is_skipping(&self) -> bool {
        self.top().skipping
    }

    fn reserved_ceiling(&self, slots: Option<u64>) -> u64 {
        let parent_ceiling = self.top().clip_depth;
        match slots {
            Some(n) => {
                let ceiling = self.current_depth.saturating_add(n);
                if ceiling > parent_ceiling {
                    tracing::warn!(
                        requested = n,
                        parent_ceiling,
                        "depth reservation exceeds the enclosing ceiling, clamping"
                    );
                    parent_ceiling
                } else {
                    ceiling
                }
            }
            None => parent_ceiling,
        }
    }

    fn push_save(&mut self, slots: Option<u64>) {
        let ceiling = self.reserved_ceiling(slots);
        let top = self.top();
        self.stack.push(StackEntry {
            transform: top.transform,
            clip_depth: ceiling,
            reserved: slots.is_some(),
            num_clips: 0,
            distributed_opacity: top.distributed_opacity,
            mode: RenderingMode::Direct,
            skipping: top.skipping,
        });
        if let Some(sp) = self.subpasses.last_mut() {
            sp.clip_stack.save();
        }
    }

    fn push_skipping(&mut self, slots: Option<u64>) {
        self.push_save(slots);
        if let Some(top) = self.stack.last_mut() {
            top.skipping = true;
        }
    }

    /// Hands out the next depth slot, clamping at the scope ceiling.
    fn next_depth(&mut self) -> u64 {
        let ceiling = self.top().clip_depth;
        if self.current_depth >= ceiling {
            tracing::warn!(
                depth = self.current_depth,
                ceiling,
                "draw depth reached the scope ceiling"
            );
            self.current_depth = ceiling;
            return ceiling;
        }
        let depth = self.current_depth;
        self.current_depth += 1;
        depth
    }

    fn submit_contents(&mut self, contents: Contents, blend_mode: BlendMode, canvas_space: bool) {
        let transform = if canvas_space {
            match self.subpasses.last() {
                Some(sp) => sp.local_transform(&self.top().transform),
                None => return,
            }
        } else {
            Transform::identity()
        };
        let entity = Entity {
            transform,
            blend_mode,
            clip_depth: self.next_depth(),
            inherited_opacity: self.top().distributed_opacity,
            contents,
        };
        self.add_render_entity(entity);
    }

    /// Submits one resolved entity to the current pass: culling, the
    /// background-clear fast path, opaque blend downgrade and advanced-blend
    /// dispatch all happen here.
    fn add_render_entity(&mut self, entity: Entity) {
        let idx = self.subpasses.len() - 1;
        let (clip_cov, full) = {
            let sp = &self.subpasses[idx];
            (
                sp.clip_stack.coverage(),
                sp.clip_stack.initial_coverage(),
            )
        };
        let Some(clip_cov) = clip_cov else {
            return;
        };
        let Some(coverage) = entity.coverage() else {
            return;
        };
        if coverage.intersection(&clip_cov).is_none() {
            return;
        }

        // A draw that exactly covers a pass whose clear has not been flushed
        // folds into the clear color instead of emitting anything.
        {
            let sp = &self.subpasses[idx];
            if sp.pass.is_none() && !sp.has_drawn {
                if let (Some(clear), Contents::ColorSource(c)) =
                    (sp.pending_clear, &entity.contents)
                {
                    if c.source.is_none()
                        && matches!(
                            entity.blend_mode,
                            BlendMode::SourceOver | BlendMode::Source
                        )
                        && entity.covers_area(&full)
                    {
                        let color = if entity.blend_mode == BlendMode::Source
                            || c.color.is_opaque()
                        {
                            c.color
                        } else {
                            blend_colors(clear, c.color, BlendMode::SourceOver)
                                .unwrap_or(c.color)
                        };
                        self.subpasses[idx].pending_clear = Some(color);
                        return;
                    }
                }
            }
        }

        let mut entity = entity;
        if entity.blend_mode.can_downgrade_to_source(entity.is_opaque()) {
            entity.blend_mode = BlendMode::Source;
        }

        if entity.blend_mode.is_advanced() {
            let Entity {
                transform,
                blend_mode,
                clip_depth,
                inherited_opacity,
                contents,
            } = entity;
            if self.capabilities.framebuffer_fetch {
                entity = Entity {
                    transform,
                    blend_mode: BlendMode::SourceOver,
                    clip_depth,
                    inherited_opacity,
                    contents: Contents::FramebufferBlend {
                        mode: blend_mode,
                        child: Box::new(contents),
                    },
                };
            } else {
                let backdrop = match self.flip_backdrop(idx) {
                    Ok(texture) => texture,
                    Err(err) => {
                        tracing::warn!(%err, "backdrop flip failed, dropping advanced blend draw");
                        return;
                    }
                };
                entity = Entity {
                    transform,
                    blend_mode: BlendMode::SourceOver,
                    clip_depth,
                    inherited_opacity,
                    contents: Contents::BackdropBlend {
                        mode: blend_mode,
                        backdrop,
                        coverage_hint: coverage.intersection(&clip_cov),
                        child: Box::new(contents),
                    },
                };
            }
        }

        if let Err(err) = self.begin_pass(idx) {
            tracing::warn!(%err, "render pass unavailable, dropping draw");
            return;
        }
        let sp = &mut self.subpasses[idx];
        if let Some(pass) = sp.pass.as_mut() {
            if !pass.draw(&entity) {
                tracing::debug!("backend rejected a draw");
            }
            sp.has_drawn = true;
        }
    }

    fn draw_clip_entity(&mut self, idx: usize, entity: Entity) {
        if let Err(err) = self.begin_pass(idx) {
            tracing::warn!(%err, "render pass unavailable, dropping clip geometry");
            return;
        }
        if let Some(pass) = self.subpasses[idx].pass.as_mut() {
            pass.draw(&entity);
        }
    }

    fn begin_pass(&mut self, idx: usize) -> Result<(), BackendError> {
        if self.subpasses[idx].pass.is_some() {
            return Ok(());
        }
        let clear = self.subpasses[idx].pending_clear.take();
        let pass = self
            .gpu
            .create_render_pass(&self.subpasses[idx].target, clear)?;
        let sp = &mut self.subpasses[idx];
        sp.pass = Some(pass);
        if let (Some(pass), Some(scissor)) = (sp.pass.as_mut(), sp.scissor) {
            pass.set_scissor(Some(scissor));
        }
        Ok(())
    }

    fn refresh_scissor(&mut self, idx: usize) {
        let sp = &mut self.subpasses[idx];
        let scissor = match sp.clip_stack.coverage() {
            Some(coverage) if coverage != sp.clip_stack.initial_coverage() => {
                ScissorRect::from_coverage(&coverage, sp.target.size())
            }
            _ => None,
        };
        if scissor == sp.scissor {
            return;
        }
        sp.scissor = scissor;
        if let Some(pass) = sp.pass.as_mut() {
            pass.set_scissor(scissor);
        }
    }

    /// Ends the pass at `idx` to read its output, then begins a replacement
    /// pass on a fresh target with the output carried over and all active
    /// clips replayed.
    fn flip_backdrop(&mut self, idx: usize) -> Result<TextureRef, BackendError> {
        // Force a real pass so a filter never samples an uninitialized
        // texture.
        self.begin_pass(idx)?;
        let Some(pass) = self.subpasses[idx].pass.take() else {
            return Err(BackendError::PassCreation);
        };
        let texture = pass.end()?;

        let (w, h) = self.subpasses[idx].target.size();
        let config = self.subpasses[idx].target.config();
        let replacement = self.targets.acquire(&mut *self.gpu, w, h, config)?;
        let old = std::mem::replace(&mut self.subpasses[idx].target, replacement);
        self.retired.push(old);

        if self.subpasses[idx].target.is_msaa() {
            // MSAA attachments cannot be blit destinations; redraw the
            // snapshot as the first entity instead.
            let mut pass = self
                .gpu
                .create_render_pass(&self.subpasses[idx].target, Some(Color::TRANSPARENT))?;
            let full = Box2D::new(point(0.0, 0.0), point(w as f32, h as f32));
            pass.draw(&Entity {
                transform: Transform::identity(),
                blend_mode: BlendMode::Source,
                clip_depth: 0,
                inherited_opacity: 1.0,
                contents: Contents::Texture(TextureContents::single(texture.clone(), full, full)),
            });
            self.subpasses[idx].pass = Some(pass);
        } else {
            let mut blit = self.gpu.create_blit_pass()?;
            let dest = self.subpasses[idx].target.color.clone();
            blit.copy_texture(&texture, &dest, (0, 0));
            blit.submit()?;
            self.subpasses[idx].pass = Some(self.gpu.create_render_pass(
                &self.subpasses[idx].target,
                None,
            )?);
        }

        // Replay active clips so clipping survives the pass boundary.
        let entries: Vec<ClipEntry> = self.subpasses[idx]
            .clip_stack
            .active_entries()
            .iter()
            .filter(|e| e.needs_render)
            .cloned()
            .collect();
        let extent = self.subpasses[idx].clip_stack.initial_coverage();
        for entry in entries {
            let Some(mesh) = clip_write_mesh(
                &mut *self.tessellator,
                &entry.geometry,
                &entry.transform,
                entry.op,
                extent,
            ) else {
                continue;
            };
            if let Some(pass) = self.subpasses[idx].pass.as_mut() {
                pass.draw(&Entity {
                    transform: Transform::identity(),
                    blend_mode: BlendMode::Destination,
                    clip_depth: entry.clip_depth,
                    inherited_opacity: 1.0,
                    contents: Contents::Clip {
                        mesh,
                        op: entry.op,
                    },
                });
            }
        }
        let sp = &mut self.subpasses[idx];
        sp.has_drawn = true;
        if let Some(pass) = sp.pass.as_mut() {
            pass.set_scissor(sp.scissor);
        }
        Ok(texture)
    }

    /// Obtains the filtered backdrop for a just-opened save layer and draws
    /// it as the layer's initial content.
    ///
    /// Layers sharing a backdrop id reuse one flipped texture, and one
    /// filtered snapshot when their filters match exactly.
    fn apply_backdrop_filter(&mut self, filter: &ImageFilter, id: Option<u64>) {
        if self.subpasses.len() < 2 {
            return;
        }
        let parent_idx = self.subpasses.len() - 2;

        let (mut flipped, mut snapshot) = (None, None);
        if let Some(id) = id {
            if let Some(data) = self.backdrops.get(&id) {
                flipped = data.flipped.clone();
                if data.filter.as_ref() == Some(filter) {
                    snapshot = data.snapshot.clone();
                }
            }
        }

        let flipped = match flipped {
            Some(texture) => texture,
            None => match self.flip_backdrop(parent_idx) {
                Ok(texture) => texture,
                Err(err) => {
                    tracing::warn!(%err, "backdrop flip failed, layer renders without backdrop");
                    return;
                }
            },
        };
        let snapshot = match snapshot {
            Some(texture) => texture,
            None => match self.gpu.render_filter(filter, &flipped) {
                Ok(texture) => texture,
                Err(err) => {
                    tracing::warn!(%err, "backdrop filter failed, layer renders without backdrop");
                    return;
                }
            },
        };

        if let Some(id) = id {
            let data = self.backdrops.entry(id).or_default();
            if data.flipped.is_none() {
                data.flipped = Some(flipped);
            }
            if data.filter.is_none() {
                data.filter = Some(filter.clone());
                data.snapshot = Some(snapshot.clone());
            }
        }

        // The snapshot region matching this subpass becomes its first
        // content.
        let parent_origin = self.subpasses[parent_idx].origin;
        let sp = &self.subpasses[self.subpasses.len() - 1];
        let (w, h) = (sp.clip_stack.initial_coverage().max.x, sp.clip_stack.initial_coverage().max.y);
        let src_min = point(sp.origin.x - parent_origin.x, sp.origin.y - parent_origin.y);
        let src = Box2D::new(src_min, point(src_min.x + w, src_min.y + h));
        let dst = Box2D::new(point(0.0, 0.0), point(w, h));
        let entity = Entity {
            transform: Transform::identity(),
            blend_mode: BlendMode::Source,
            clip_depth: self.next_depth(),
            inherited_opacity: 1.0,
            contents: Contents::Texture(TextureContents::single(snapshot, src, dst)),
        };
        self.add_render_entity(entity);
    }

    /// Ends the subpass on top of the stack and composites its texture over
    /// the parent pass with the layer's deferred paint.
    fn composite_finished_layer(&mut self) {
        let Some(mut sp) = self.subpasses.pop() else {
            return;
        };
        let Some(layer) = sp.layer.take() else {
            // The root pass never composites; put it back.
            self.subpasses.push(sp);
            return;
        };

        // An untouched transparent layer contributes nothing.
        if sp.pass.is_none() && !sp.has_drawn && sp.pending_clear == Some(Color::TRANSPARENT) {
            self.retired.push(sp.target);
            return;
        }

        if sp.pass.is_none() {
            let clear = sp.pending_clear.take();
            match self.gpu.create_render_pass(&sp.target, clear) {
                Ok(pass) => sp.pass = Some(pass),
                Err(err) => {
                    tracing::warn!(%err, "layer pass unavailable, dropping layer");
                    self.retired.push(sp.target);
                    return;
                }
            }
        }
        let Some(pass) = sp.pass.take() else {
            self.retired.push(sp.target);
            return;
        };
        let texture = match pass.end() {
            Ok(texture) => texture,
            Err(err) => {
                tracing::warn!(%err, "layer pass failed, dropping layer");
                self.retired.push(sp.target);
                return;
            }
        };
        self.retired.push(sp.target);

        let src = Box2D::new(
            point(0.0, 0.0),
            point(layer.size.0.ceil(), layer.size.1.ceil()),
        );
        let dst = Box2D::new(
            layer.origin,
            point(layer.origin.x + layer.size.0, layer.origin.y + layer.size.1),
        );
        let contents = Contents::Texture(TextureContents {
            texture,
            quads: vec![TextureQuad { src, dst }],
            opacity: layer.paint.color.a,
        });
        let contents = wrap_paint_filters(contents, &layer.paint);

        let Some(parent) = self.subpasses.last() else {
            return;
        };
        let transform = Transform::translation(-parent.origin.x, -parent.origin.y);
        let entity = Entity {
            transform,
            blend_mode: layer.paint.blend_mode,
            clip_depth: self.next_depth(),
            inherited_opacity: self.top().distributed_opacity,
            contents,
        };
        self.add_render_entity(entity);
    }

    /// Renders a blurred text shadow, memoized by run identity, sigma and
    /// transform scale.
    fn draw_text_shadow(&mut self, frame: &TextFrame, position: Point, sigma: f32, paint: &Paint) {
        let Some(bounds) = frame.bounds() else {
            return;
        };
        let transform = self.top().transform;
        let scale = (
            (transform.m11 * transform.m11 + transform.m12 * transform.m12).sqrt(),
            (transform.m21 * transform.m21 + transform.m22 * transform.m22).sqrt(),
        );
        let pad = sigma * 3.0;
        let padded = bounds.inflate(pad, pad);

        let texture = match self.shadows.get(frame, sigma, scale) {
            Some(texture) => texture,
            None => {
                let Some(texture) = self.render_text_shadow(frame, &bounds, sigma, pad) else {
                    return;
                };
                self.shadows.insert(frame, sigma, scale, texture.clone());
                texture
            }
        };

        let (w, h) = texture.size();
        let src = Box2D::new(point(0.0, 0.0), point(w as f32, h as f32));
        let dst = padded.translate(vector(position.x, position.y));
        let contents = Contents::Texture(TextureContents {
            texture,
            quads: vec![TextureQuad { src, dst }],
            opacity: paint.color.a,
        });
        // Tint the blurred coverage with the paint color.
        let contents = Contents::ColorFilter {
            filter: ColorFilter::Blend {
                color: paint.color,
                mode: BlendMode::SourceIn,
            },
            child: Box::new(contents),
        };
        self.submit_contents(contents, paint.blend_mode, true);
    }

    fn render_text_shadow(
        &mut self,
        frame: &TextFrame,
        bounds: &Box2D,
        sigma: f32,
        pad: f32,
    ) -> Option<TextureRef> {
        let width = ((bounds.max.x - bounds.min.x) + 2.0 * pad).ceil() as u32;
        let height = ((bounds.max.y - bounds.min.y) + 2.0 * pad).ceil() as u32;
        let config = TargetConfig {
            msaa: false,
            depth_stencil: false,
        };
        let target = match self.targets.acquire(&mut *self.gpu, width.max(1), height.max(1), config)
        {
            Ok(target) => target,
            Err(err) => {
                tracing::warn!(%err, "text shadow target unavailable, dropping shadow");
                return None;
            }
        };
        let mut pass = match self
            .gpu
            .create_render_pass(&target, Some(Color::TRANSPARENT))
        {
            Ok(pass) => pass,
            Err(err) => {
                tracing::warn!(%err, "text shadow pass unavailable, dropping shadow");
                self.retired.push(target);
                return None;
            }
        };
        let offset = vector(pad - bounds.min.x, pad - bounds.min.y);
        let quads: Vec<TextureQuad> = frame
            .glyphs
            .iter()
            .map(|g| TextureQuad {
                src: g.src,
                dst: g.dst.translate(offset),
            })
            .collect();
        pass.draw(&Entity {
            transform: Transform::identity(),
            blend_mode: BlendMode::SourceOver,
            clip_depth: 0,
            inherited_opacity: 1.0,
            contents: Contents::Texture(TextureContents {
                texture: frame.atlas.clone(),
                quads,
                opacity: 1.0,
            }),
        });
        let rendered = match pass.end() {
            Ok(texture) => texture,
            Err(err) => {
                tracing::warn!(%err, "text shadow pass failed, dropping shadow");
                self.retired.push(target);
                return None;
            }
        };
        self.retired.push(target);
        match self.gpu.render_filter(&ImageFilter::blur(sigma), &rendered) {
            Ok(blurred) => Some(blurred),
            Err(err) => {
                tracing::warn!(%err, "text shadow blur failed, dropping shadow");
                None
            }
        }
    }
}

/// Curve flattening tolerance in geometry-local units for a given transform.
fn tolerance_for(transform: &Transform) -> f32 {
    let sx = (transform.m11 * transform.m11 + transform.m12 * transform.m12).sqrt();
    let sy = (transform.m21 * transform.m21 + transform.m22 * transform.m22).sqrt();
    PIXEL_TOLERANCE / sx.max(sy).max(1e-3)
}

/// Builds the depth-write mesh for a rendered clip, in pass space.
///
/// The mesh covers the region the clip forbids: the shape itself for a
/// difference clip, the shape's complement within the pass extent for an
/// intersection. The backend then raises the depth buffer over the mesh so
/// scoped draws are rejected there, with no per-op shader work.
fn clip_write_mesh(
    tessellator: &mut dyn Tessellator,
    geometry: &Geometry,
    transform: &Transform,
    op: ClipOp,
    extent: Box2D,
) -> Option<crate::tessellate::Mesh> {
    let tolerance = tolerance_for(transform);
    let outline = match geometry.outline_path(tolerance) {
        Some(path) => path.transformed(transform),
        None => {
            tracing::debug!("clip geometry has no outline, applying coverage only");
            return None;
        }
    };
    match op {
        ClipOp::Difference => {
            tessellator.tessellate_fill(&outline, FillRule::NonZero, PIXEL_TOLERANCE, [0.0; 4])
        }
        ClipOp::Intersect => {
            let mut builder = Path::builder();
            builder.add_rectangle(&extent, lyon::path::Winding::Positive);
            builder.extend_from_paths(&[outline.as_slice()]);
            tessellator.tessellate_fill(
                &builder.build(),
                FillRule::EvenOdd,
                PIXEL_TOLERANCE,
                [0.0; 4],
            )
        }
    }
}
