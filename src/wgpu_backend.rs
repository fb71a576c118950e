//! The wgpu implementation of the backend contracts.
//!
//! wgpu render passes borrow their command encoder, so [`WgpuRenderPass`]
//! cannot hold one open across canvas calls. It records draw packets instead
//! and encodes everything when the pass ends: entities are flattened to
//! transformed, colored vertices at draw time, then uploaded and drawn in one
//! `wgpu::RenderPass` at [`RenderPass::end`]. Filters and offscreen filter
//! wrappers run as fullscreen-triangle passes submitted ahead of the pass
//! that samples their output.

use std::sync::{Arc, Mutex};

use lyon::math::{point, Box2D};
use wgpu::util::DeviceExt;

use crate::backend::{
    BackendError, BlitPass, Capabilities, EntityPassTarget, GpuContext, GpuTexture, RenderPass,
    ScissorRect, TargetConfig, TextureRef,
};
use crate::color::{BlendMode, Color};
use crate::contents::Contents;
use crate::entity::{normalized_depth, Entity};
use crate::geometry::Transform;
use crate::paint::{BlurStyle, ColorFilter, ImageFilter};
use crate::vertex::GpuVertex;

const COLOR_FORMAT: wgpu::TextureFormat = wgpu::TextureFormat::Rgba8UnormSrgb;
const DEPTH_FORMAT: wgpu::TextureFormat = wgpu::TextureFormat::Depth24PlusStencil8;
const MSAA_SAMPLE_COUNT: u32 = 4;

/// A texture plus its render view.
#[derive(Debug)]
pub struct WgpuTexture {
    texture: wgpu::Texture,
    view: wgpu::TextureView,
    sample_count: u32,
}

impl WgpuTexture {
    pub fn texture(&self) -> &wgpu::Texture {
        &self.texture
    }

    pub fn view(&self) -> &wgpu::TextureView {
        &self.view
    }

    /// Wraps an externally created texture (a surface frame, a loaded image)
    /// so it can be drawn or rendered into.
    pub fn wrap(texture: wgpu::Texture) -> Self {
        let view = texture.create_view(&wgpu::TextureViewDescriptor::default());
        Self {
            texture,
            view,
            sample_count: 1,
        }
    }
}

impl GpuTexture for WgpuTexture {
    fn size(&self) -> (u32, u32) {
        (self.texture.width(), self.texture.height())
    }

    fn sample_count(&self) -> u32 {
        self.sample_count
    }

    fn as_any(&self) -> &dyn std::any::Any {
        self
    }
}

fn native(texture: &TextureRef) -> Option<&WgpuTexture> {
    texture.as_any().downcast_ref::<WgpuTexture>()
}

// --- shaders ---

/// Vertex stage and IO shared by every entity pipeline. Positions arrive in
/// pass pixel space; `order` is the normalized depth.
const ENTITY_PREAMBLE: &str = r#"
struct Globals {
    resolution: vec2<f32>,
    _pad: vec2<f32>,
};

@group(0) @binding(0) var<uniform> globals: Globals;

struct VertexInput {
    @location(0) position: vec2<f32>,
    @location(1) tex_coords: vec2<f32>,
    @location(2) color: vec4<f32>,
    @location(3) order: f32,
};

struct VertexOutput {
    @builtin(position) position: vec4<f32>,
    @location(0) uv: vec2<f32>,
    @location(1) color: vec4<f32>,
};

@vertex
fn vs_main(input: VertexInput) -> VertexOutput {
    var out: VertexOutput;
    let ndc = input.position / globals.resolution * 2.0 - vec2<f32>(1.0, 1.0);
    out.position = vec4<f32>(ndc.x, -ndc.y, input.order, 1.0);
    out.uv = input.tex_coords;
    out.color = input.color;
    return out;
}
"#;

const SHAPE_FS: &str = r#"
@fragment
fn fs_main(input: VertexOutput) -> @location(0) vec4<f32> {
    return input.color;
}
"#;

const TEXTURE_FS: &str = r#"
@group(1) @binding(0) var content_texture: texture_2d<f32>;
@group(1) @binding(1) var content_sampler: sampler;

@fragment
fn fs_main(input: VertexOutput) -> @location(0) vec4<f32> {
    return textureSample(content_texture, content_sampler, input.uv) * input.color;
}
"#;

/// Closed-form rounded-rect blur. `uv` carries the pass-space position; the
/// logistic is a cheap approximation of the Gaussian CDF of the signed
/// distance.
const RRECT_BLUR_FS: &str = r#"
struct RRectParams {
    center: vec2<f32>,
    half_size: vec2<f32>,
    color: vec4<f32>,
    radius: f32,
    sigma: f32,
    _pad: vec2<f32>,
};

@group(1) @binding(0) var<uniform> rrect: RRectParams;

fn rrect_distance(p: vec2<f32>) -> f32 {
    let q = abs(p - rrect.center) - rrect.half_size + vec2<f32>(rrect.radius);
    return length(max(q, vec2<f32>(0.0))) + min(max(q.x, q.y), 0.0) - rrect.radius;
}

@fragment
fn fs_main(input: VertexOutput) -> @location(0) vec4<f32> {
    let d = rrect_distance(input.uv);
    let mask = 1.0 / (1.0 + exp(1.702 * d / max(rrect.sigma, 1e-3)));
    return rrect.color * mask;
}
"#;

/// The separable blend functions from the PDF blend model plus the
/// premultiplied composite wrapper. Mode ids follow `advanced_mode_id`.
const BLEND_LIB: &str = r#"
fn blend_lum(c: vec3<f32>) -> f32 {
    return dot(c, vec3<f32>(0.3, 0.59, 0.11));
}

fn blend_clip_color(c: vec3<f32>) -> vec3<f32> {
    let l = blend_lum(c);
    let n = min(min(c.r, c.g), c.b);
    let x = max(max(c.r, c.g), c.b);
    var out = c;
    if (n < 0.0) {
        out = vec3<f32>(l) + (out - vec3<f32>(l)) * (l / max(l - n, 1e-6));
    }
    if (x > 1.0) {
        out = vec3<f32>(l) + (out - vec3<f32>(l)) * ((1.0 - l) / max(x - l, 1e-6));
    }
    return out;
}

fn blend_set_lum(c: vec3<f32>, l: f32) -> vec3<f32> {
    return blend_clip_color(c + vec3<f32>(l - blend_lum(c)));
}

fn blend_sat(c: vec3<f32>) -> f32 {
    return max(max(c.r, c.g), c.b) - min(min(c.r, c.g), c.b);
}

fn blend_set_sat(c: vec3<f32>, s: f32) -> vec3<f32> {
    let mn = min(min(c.r, c.g), c.b);
    let mx = max(max(c.r, c.g), c.b);
    if (mx > mn) {
        return (c - vec3<f32>(mn)) * (s / (mx - mn));
    }
    return vec3<f32>(0.0);
}

fn blend_hard_light(src: vec3<f32>, dst: vec3<f32>) -> vec3<f32> {
    let lo = 2.0 * src * dst;
    let hi = vec3<f32>(1.0) - 2.0 * (vec3<f32>(1.0) - src) * (vec3<f32>(1.0) - dst);
    return select(hi, lo, src <= vec3<f32>(0.5));
}

fn blend_color_dodge(src: vec3<f32>, dst: vec3<f32>) -> vec3<f32> {
    let raw = min(vec3<f32>(1.0), dst / max(vec3<f32>(1.0) - src, vec3<f32>(1e-6)));
    return select(raw, vec3<f32>(0.0), dst <= vec3<f32>(0.0));
}

fn blend_color_burn(src: vec3<f32>, dst: vec3<f32>) -> vec3<f32> {
    let raw = vec3<f32>(1.0)
        - min(vec3<f32>(1.0), (vec3<f32>(1.0) - dst) / max(src, vec3<f32>(1e-6)));
    return select(raw, vec3<f32>(1.0), dst >= vec3<f32>(1.0));
}

fn blend_soft_light(src: vec3<f32>, dst: vec3<f32>) -> vec3<f32> {
    let dd = select(
        sqrt(dst),
        ((16.0 * dst - vec3<f32>(12.0)) * dst + vec3<f32>(4.0)) * dst,
        dst <= vec3<f32>(0.25),
    );
    let lo = dst - (vec3<f32>(1.0) - 2.0 * src) * dst * (vec3<f32>(1.0) - dst);
    let hi = dst + (2.0 * src - vec3<f32>(1.0)) * (dd - dst);
    return select(hi, lo, src <= vec3<f32>(0.5));
}

fn blend_advanced(mode: u32, src: vec3<f32>, dst: vec3<f32>) -> vec3<f32> {
    switch mode {
        case 0u: { return src + dst - src * dst; }
        case 1u: { return blend_hard_light(dst, src); }
        case 2u: { return min(src, dst); }
        case 3u: { return max(src, dst); }
        case 4u: { return blend_color_dodge(src, dst); }
        case 5u: { return blend_color_burn(src, dst); }
        case 6u: { return blend_hard_light(src, dst); }
        case 7u: { return blend_soft_light(src, dst); }
        case 8u: { return abs(src - dst); }
        case 9u: { return src + dst - 2.0 * src * dst; }
        case 10u: { return src * dst; }
        case 11u: { return blend_set_lum(blend_set_sat(src, blend_sat(dst)), blend_lum(dst)); }
        case 12u: { return blend_set_lum(blend_set_sat(dst, blend_sat(src)), blend_lum(dst)); }
        case 13u: { return blend_set_lum(src, blend_lum(dst)); }
        case 14u: { return blend_set_lum(dst, blend_lum(src)); }
        default: { return src; }
    }
}

fn composite_advanced(mode: u32, src: vec4<f32>, dst: vec4<f32>) -> vec4<f32> {
    let sc = src.rgb / max(src.a, 1e-6);
    let dc = dst.rgb / max(dst.a, 1e-6);
    let blended = blend_advanced(mode, sc, dc);
    let rgb = src.a * dst.a * blended + src.rgb * (1.0 - dst.a) + dst.rgb * (1.0 - src.a);
    let a = src.a + dst.a * (1.0 - src.a);
    return vec4<f32>(rgb, a);
}
"#;

const BLEND_PARAMS: &str = r#"
struct BlendParams {
    backdrop_texel: vec2<f32>,
    mode: u32,
    _pad: u32,
};
"#;

const BACKDROP_SHAPE_FS: &str = r#"
@group(1) @binding(0) var backdrop_texture: texture_2d<f32>;
@group(1) @binding(1) var backdrop_sampler: sampler;
@group(2) @binding(0) var<uniform> blend_params: BlendParams;

@fragment
fn fs_main(input: VertexOutput) -> @location(0) vec4<f32> {
    let dst = textureSample(
        backdrop_texture,
        backdrop_sampler,
        input.position.xy * blend_params.backdrop_texel,
    );
    return composite_advanced(blend_params.mode, input.color, dst);
}
"#;

const BACKDROP_TEXTURE_FS: &str = r#"
@group(1) @binding(0) var content_texture: texture_2d<f32>;
@group(1) @binding(1) var content_sampler: sampler;
@group(2) @binding(0) var<uniform> blend_params: BlendParams;
@group(3) @binding(0) var backdrop_texture: texture_2d<f32>;
@group(3) @binding(1) var backdrop_sampler: sampler;

@fragment
fn fs_main(input: VertexOutput) -> @location(0) vec4<f32> {
    let src = textureSample(content_texture, content_sampler, input.uv) * input.color;
    let dst = textureSample(
        backdrop_texture,
        backdrop_sampler,
        input.position.xy * blend_params.backdrop_texel,
    );
    return composite_advanced(blend_params.mode, src, dst);
}
"#;

/// Fullscreen-triangle vertex stage and input bindings shared by all filter
/// pipelines.
const FILTER_PREAMBLE: &str = r#"
struct FilterOutput {
    @builtin(position) position: vec4<f32>,
    @location(0) uv: vec2<f32>,
};

@vertex
fn vs_quad(@builtin(vertex_index) index: u32) -> FilterOutput {
    var out: FilterOutput;
    let uv = vec2<f32>(f32((index << 1u) & 2u), f32(index & 2u));
    out.position = vec4<f32>(uv * 2.0 - vec2<f32>(1.0), 0.0, 1.0);
    out.uv = vec2<f32>(uv.x, 1.0 - uv.y);
    return out;
}

@group(0) @binding(0) var input_texture: texture_2d<f32>;
@group(0) @binding(1) var input_sampler: sampler;
"#;

const BLUR_FS: &str = r#"
struct BlurParams {
    direction: vec2<f32>,
    texel: vec2<f32>,
    sigma: f32,
    radius: f32,
    _pad: vec2<f32>,
};

@group(1) @binding(0) var<uniform> blur: BlurParams;

@fragment
fn fs_main(input: FilterOutput) -> @location(0) vec4<f32> {
    var sum = vec4<f32>(0.0);
    var weight_sum = 0.0;
    let radius = i32(blur.radius);
    for (var i = -radius; i <= radius; i = i + 1) {
        let offset = f32(i);
        let weight = exp(-0.5 * offset * offset / max(blur.sigma * blur.sigma, 1e-6));
        let coords = input.uv + blur.direction * blur.texel * offset;
        sum += textureSampleLevel(input_texture, input_sampler, coords, 0.0) * weight;
        weight_sum += weight;
    }
    return sum / max(weight_sum, 1e-6);
}
"#;

const MORPHOLOGY_FS: &str = r#"
struct MorphologyParams {
    direction: vec2<f32>,
    texel: vec2<f32>,
    radius: f32,
    mode: u32,
    _pad: vec2<f32>,
};

@group(1) @binding(0) var<uniform> morph: MorphologyParams;

@fragment
fn fs_main(input: FilterOutput) -> @location(0) vec4<f32> {
    var result = textureSampleLevel(input_texture, input_sampler, input.uv, 0.0);
    let radius = i32(morph.radius);
    for (var i = -radius; i <= radius; i = i + 1) {
        let coords = input.uv + morph.direction * morph.texel * f32(i);
        let sample = textureSampleLevel(input_texture, input_sampler, coords, 0.0);
        if (morph.mode == 0u) {
            result = max(result, sample);
        } else {
            result = min(result, sample);
        }
    }
    return result;
}
"#;

/// Applies a color matrix or blend color filter to an already-rendered
/// texture. Mode ids follow `full_mode_id`.
const COLOR_FILTER_FS: &str = r#"
struct ColorFilterParams {
    color: vec4<f32>,
    matrix: array<vec4<f32>, 5>,
    kind: u32,
    mode: u32,
    _pad: vec2<u32>,
};

@group(1) @binding(0) var<uniform> filter_params: ColorFilterParams;

fn mat_at(i: u32) -> f32 {
    return filter_params.matrix[i / 4u][i % 4u];
}

fn composite_mode(mode: u32, src: vec4<f32>, dst: vec4<f32>) -> vec4<f32> {
    switch mode {
        case 0u: { return vec4<f32>(0.0); }
        case 1u: { return src; }
        case 2u: { return dst; }
        case 3u: { return src + dst * (1.0 - src.a); }
        case 4u: { return dst + src * (1.0 - dst.a); }
        case 5u: { return src * dst.a; }
        case 6u: { return dst * src.a; }
        case 7u: { return src * (1.0 - dst.a); }
        case 8u: { return dst * (1.0 - src.a); }
        case 9u: { return src * dst.a + dst * (1.0 - src.a); }
        case 10u: { return dst * src.a + src * (1.0 - dst.a); }
        case 11u: { return src * (1.0 - dst.a) + dst * (1.0 - src.a); }
        case 12u: { return min(src + dst, vec4<f32>(1.0)); }
        case 13u: { return src * dst; }
        default: { return composite_advanced(mode - 14u, src, dst); }
    }
}

@fragment
fn fs_main(input: FilterOutput) -> @location(0) vec4<f32> {
    let dst = textureSampleLevel(input_texture, input_sampler, input.uv, 0.0);
    if (filter_params.kind == 0u) {
        var straight = vec4<f32>(dst.rgb / max(dst.a, 1e-6), dst.a);
        var filtered = vec4<f32>(0.0);
        for (var row = 0u; row < 4u; row = row + 1u) {
            var acc = mat_at(row * 5u + 4u);
            for (var col = 0u; col < 4u; col = col + 1u) {
                acc += mat_at(row * 5u + col) * straight[col];
            }
            filtered[row] = clamp(acc, 0.0, 1.0);
        }
        return vec4<f32>(filtered.rgb * filtered.a, filtered.a);
    }
    let src = vec4<f32>(
        filter_params.color.rgb * filter_params.color.a,
        filter_params.color.a,
    );
    return composite_mode(filter_params.mode, src, dst);
}
"#;

// --- uniform layouts ---

#[repr(C)]
#[derive(Clone, Copy, bytemuck::Pod, bytemuck::Zeroable)]
struct Globals {
    resolution: [f32; 2],
    _pad: [f32; 2],
}

#[repr(C)]
#[derive(Clone, Copy, Debug, bytemuck::Pod, bytemuck::Zeroable)]
struct RRectParams {
    center: [f32; 2],
    half_size: [f32; 2],
    color: [f32; 4],
    radius: f32,
    sigma: f32,
    _pad: [f32; 2],
}

#[repr(C)]
#[derive(Clone, Copy, bytemuck::Pod, bytemuck::Zeroable)]
struct BlendParams {
    backdrop_texel: [f32; 2],
    mode: u32,
    _pad: u32,
}

#[repr(C)]
#[derive(Clone, Copy, bytemuck::Pod, bytemuck::Zeroable)]
struct BlurParams {
    direction: [f32; 2],
    texel: [f32; 2],
    sigma: f32,
    radius: f32,
    _pad: [f32; 2],
}

#[repr(C)]
#[derive(Clone, Copy, bytemuck::Pod, bytemuck::Zeroable)]
struct MorphologyParams {
    direction: [f32; 2],
    texel: [f32; 2],
    radius: f32,
    mode: u32,
    _pad: [f32; 2],
}

#[repr(C)]
#[derive(Clone, Copy, bytemuck::Pod, bytemuck::Zeroable)]
struct ColorFilterParams {
    color: [f32; 4],
    matrix: [[f32; 4]; 5],
    kind: u32,
    mode: u32,
    _pad: [u32; 2],
}

fn advanced_mode_id(mode: BlendMode) -> u32 {
    match mode {
        BlendMode::Screen => 0,
        BlendMode::Overlay => 1,
        BlendMode::Darken => 2,
        BlendMode::Lighten => 3,
        BlendMode::ColorDodge => 4,
        BlendMode::ColorBurn => 5,
        BlendMode::HardLight => 6,
        BlendMode::SoftLight => 7,
        BlendMode::Difference => 8,
        BlendMode::Exclusion => 9,
        BlendMode::Multiply => 10,
        BlendMode::Hue => 11,
        BlendMode::Saturation => 12,
        BlendMode::Color => 13,
        BlendMode::Luminosity => 14,
        _ => 0,
    }
}

fn full_mode_id(mode: BlendMode) -> u32 {
    match mode {
        BlendMode::Clear => 0,
        BlendMode::Source => 1,
        BlendMode::Destination => 2,
        BlendMode::SourceOver => 3,
        BlendMode::DestinationOver => 4,
        BlendMode::SourceIn => 5,
        BlendMode::DestinationIn => 6,
        BlendMode::SourceOut => 7,
        BlendMode::DestinationOut => 8,
        BlendMode::SourceATop => 9,
        BlendMode::DestinationATop => 10,
        BlendMode::Xor => 11,
        BlendMode::Plus => 12,
        BlendMode::Modulate => 13,
        advanced => 14 + advanced_mode_id(advanced),
    }
}

/// Maps a pipeline blend mode to fixed-function blend factors over
/// premultiplied colors.
fn blend_state(mode: BlendMode) -> wgpu::BlendState {
    use wgpu::BlendFactor as F;
    let (src, dst) = match mode {
        BlendMode::Clear => (F::Zero, F::Zero),
        BlendMode::Source => (F::One, F::Zero),
        BlendMode::Destination => (F::Zero, F::One),
        BlendMode::SourceOver => (F::One, F::OneMinusSrcAlpha),
        BlendMode::DestinationOver => (F::OneMinusDstAlpha, F::One),
        BlendMode::SourceIn => (F::DstAlpha, F::Zero),
        BlendMode::DestinationIn => (F::Zero, F::SrcAlpha),
        BlendMode::SourceOut => (F::OneMinusDstAlpha, F::Zero),
        BlendMode::DestinationOut => (F::Zero, F::OneMinusSrcAlpha),
        BlendMode::SourceATop => (F::DstAlpha, F::OneMinusSrcAlpha),
        BlendMode::DestinationATop => (F::OneMinusDstAlpha, F::SrcAlpha),
        BlendMode::Xor => (F::OneMinusDstAlpha, F::OneMinusSrcAlpha),
        BlendMode::Plus => (F::One, F::One),
        BlendMode::Modulate => (F::Dst, F::Zero),
        advanced => {
            tracing::debug!(?advanced, "advanced mode reached fixed-function blending");
            (F::One, F::OneMinusSrcAlpha)
        }
    };
    let component = wgpu::BlendComponent {
        src_factor: src,
        dst_factor: dst,
        operation: wgpu::BlendOperation::Add,
    };
    wgpu::BlendState {
        color: component,
        alpha: component,
    }
}

// --- pipelines ---

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
enum PipelineKind {
    Shape,
    Textured,
    Clip,
    RRectBlur,
    BackdropShape,
    BackdropTextured,
    Blur,
    Morphology,
    ColorFilterPass,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
struct PipelineKey {
    kind: PipelineKind,
    blend: Option<BlendMode>,
    sample_count: u32,
    has_depth: bool,
}

/// Device, queue and the shared pipeline cache. One core is shared by the
/// context, its passes and blits.
struct WgpuCore {
    device: wgpu::Device,
    queue: wgpu::Queue,
    sampler: wgpu::Sampler,
    globals_layout: wgpu::BindGroupLayout,
    texture_layout: wgpu::BindGroupLayout,
    params_layout: wgpu::BindGroupLayout,
    pipelines: Mutex<ahash::AHashMap<PipelineKey, Arc<wgpu::RenderPipeline>>>,
}

impl WgpuCore {
    fn new(device: wgpu::Device, queue: wgpu::Queue) -> Self {
        let sampler = device.create_sampler(&wgpu::SamplerDescriptor {
            address_mode_u: wgpu::AddressMode::ClampToEdge,
            address_mode_v: wgpu::AddressMode::ClampToEdge,
            address_mode_w: wgpu::AddressMode::ClampToEdge,
            mag_filter: wgpu::FilterMode::Linear,
            min_filter: wgpu::FilterMode::Linear,
            mipmap_filter: wgpu::FilterMode::Linear,
            ..Default::default()
        });

        let globals_layout = device.create_bind_group_layout(&wgpu::BindGroupLayoutDescriptor {
            label: Some("strato globals layout"),
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

        let texture_layout = device.create_bind_group_layout(&wgpu::BindGroupLayoutDescriptor {
            label: Some("strato texture layout"),
            entries: &[
                wgpu::BindGroupLayoutEntry {
                    binding: 0,
                    visibility: wgpu::ShaderStages::FRAGMENT,
                    ty: wgpu::BindingType::Texture {
                        sample_type: wgpu::TextureSampleType::Float { filterable: true },
                        view_dimension: wgpu::TextureViewDimension::D2,
                        multisampled: false,
                    },
                    count: None,
                },
                wgpu::BindGroupLayoutEntry {
                    binding: 1,
                    visibility: wgpu::ShaderStages::FRAGMENT,
                    ty: wgpu::BindingType::Sampler(wgpu::SamplerBindingType::Filtering),
                    count: None,
                },
            ],
        });

        let params_layout = device.create_bind_group_layout(&wgpu::BindGroupLayoutDescriptor {
            label: Some("strato params layout"),
            entries: &[wgpu::BindGroupLayoutEntry {
                binding: 0,
                visibility: wgpu::ShaderStages::FRAGMENT,
                ty: wgpu::BindingType::Buffer {
                    ty: wgpu::BufferBindingType::Uniform,
                    has_dynamic_offset: false,
                    min_binding_size: None,
                },
                count: None,
            }],
        });

        Self {
            device,
            queue,
            sampler,
            globals_layout,
            texture_layout,
            params_layout,
            pipelines: Mutex::new(ahash::AHashMap::new()),
        }
    }

    fn pipeline(&self, key: PipelineKey) -> Arc<wgpu::RenderPipeline> {
        let mut cache = self.pipelines.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(pipeline) = cache.get(&key) {
            return pipeline.clone();
        }
        let pipeline = Arc::new(self.build_pipeline(key));
        cache.insert(key, pipeline.clone());
        pipeline
    }

    fn build_pipeline(&self, key: PipelineKey) -> wgpu::RenderPipeline {
        let (source, layouts): (String, Vec<&wgpu::BindGroupLayout>) = match key.kind {
            PipelineKind::Shape | PipelineKind::Clip => (
                format!("{ENTITY_PREAMBLE}{SHAPE_FS}"),
                vec![&self.globals_layout],
            ),
            PipelineKind::Textured => (
                format!("{ENTITY_PREAMBLE}{TEXTURE_FS}"),
                vec![&self.globals_layout, &self.texture_layout],
            ),
            PipelineKind::RRectBlur => (
                format!("{ENTITY_PREAMBLE}{RRECT_BLUR_FS}"),
                vec![&self.globals_layout, &self.params_layout],
            ),
            PipelineKind::BackdropShape => (
                format!("{ENTITY_PREAMBLE}{BLEND_LIB}{BLEND_PARAMS}{BACKDROP_SHAPE_FS}"),
                vec![
                    &self.globals_layout,
                    &self.texture_layout,
                    &self.params_layout,
                ],
            ),
            PipelineKind::BackdropTextured => (
                format!("{ENTITY_PREAMBLE}{BLEND_LIB}{BLEND_PARAMS}{BACKDROP_TEXTURE_FS}"),
                vec![
                    &self.globals_layout,
                    &self.texture_layout,
                    &self.params_layout,
                    &self.texture_layout,
                ],
            ),
            PipelineKind::Blur => (
                format!("{FILTER_PREAMBLE}{BLUR_FS}"),
                vec![&self.texture_layout, &self.params_layout],
            ),
            PipelineKind::Morphology => (
                format!("{FILTER_PREAMBLE}{MORPHOLOGY_FS}"),
                vec![&self.texture_layout, &self.params_layout],
            ),
            PipelineKind::ColorFilterPass => (
                format!("{FILTER_PREAMBLE}{BLEND_LIB}{COLOR_FILTER_FS}"),
                vec![&self.texture_layout, &self.params_layout],
            ),
        };

        let module = self
            .device
            .create_shader_module(wgpu::ShaderModuleDescriptor {
                label: Some("strato shader"),
                source: wgpu::ShaderSource::Wgsl(source.into()),
            });
        let layout = self
            .device
            .create_pipeline_layout(&wgpu::PipelineLayoutDescriptor {
                label: Some("strato pipeline layout"),
                bind_group_layouts: &layouts,
                push_constant_ranges: &[],
            });

        let is_filter = matches!(
            key.kind,
            PipelineKind::Blur | PipelineKind::Morphology | PipelineKind::ColorFilterPass
        );
        let vertex_buffers = if is_filter {
            vec![]
        } else {
            vec![GpuVertex::layout()]
        };
        let vertex_entry = if is_filter { "vs_quad" } else { "vs_main" };

        let write_mask = if key.kind == PipelineKind::Clip {
            wgpu::ColorWrites::empty()
        } else {
            wgpu::ColorWrites::ALL
        };
        let color_target = wgpu::ColorTargetState {
            format: COLOR_FORMAT,
            blend: key.blend.map(blend_state),
            write_mask,
        };

        let depth_stencil = key.has_depth.then(|| wgpu::DepthStencilState {
            format: DEPTH_FORMAT,
            depth_write_enabled: true,
            // Clips stamp their ceiling unconditionally; content only renders
            // where its depth clears what the active clips wrote.
            depth_compare: if key.kind == PipelineKind::Clip {
                wgpu::CompareFunction::Always
            } else {
                wgpu::CompareFunction::GreaterEqual
            },
            stencil: wgpu::StencilState::default(),
            bias: wgpu::DepthBiasState::default(),
        });

        self.device
            .create_render_pipeline(&wgpu::RenderPipelineDescriptor {
                label: Some("strato pipeline"),
                layout: Some(&layout),
                vertex: wgpu::VertexState {
                    module: &module,
                    entry_point: Some(vertex_entry),
                    compilation_options: Default::default(),
                    buffers: &vertex_buffers,
                },
                primitive: wgpu::PrimitiveState {
                    topology: wgpu::PrimitiveTopology::TriangleList,
                    strip_index_format: None,
                    front_face: wgpu::FrontFace::Ccw,
                    cull_mode: None,
                    unclipped_depth: false,
                    polygon_mode: wgpu::PolygonMode::Fill,
                    conservative: false,
                },
                depth_stencil,
                multisample: wgpu::MultisampleState {
                    count: key.sample_count,
                    mask: !0,
                    alpha_to_coverage_enabled: false,
                },
                fragment: Some(wgpu::FragmentState {
                    module: &module,
                    entry_point: Some("fs_main"),
                    compilation_options: Default::default(),
                    targets: &[Some(color_target)],
                }),
                multiview: None,
                cache: None,
            })
    }

    fn texture_bind_group(&self, view: &wgpu::TextureView) -> wgpu::BindGroup {
        self.device.create_bind_group(&wgpu::BindGroupDescriptor {
            label: Some("strato texture bind group"),
            layout: &self.texture_layout,
            entries: &[
                wgpu::BindGroupEntry {
                    binding: 0,
                    resource: wgpu::BindingResource::TextureView(view),
                },
                wgpu::BindGroupEntry {
                    binding: 1,
                    resource: wgpu::BindingResource::Sampler(&self.sampler),
                },
            ],
        })
    }

    fn uniform_bind_group(
        &self,
        layout: &wgpu::BindGroupLayout,
        contents: &[u8],
    ) -> wgpu::BindGroup {
        let buffer = self
            .device
            .create_buffer_init(&wgpu::util::BufferInitDescriptor {
                label: Some("strato uniform buffer"),
                contents,
                usage: wgpu::BufferUsages::UNIFORM,
            });
        self.device.create_bind_group(&wgpu::BindGroupDescriptor {
            label: Some("strato uniform bind group"),
            layout,
            entries: &[wgpu::BindGroupEntry {
                binding: 0,
                resource: buffer.as_entire_binding(),
            }],
        })
    }

    fn create_texture(
        &self,
        width: u32,
        height: u32,
        format: wgpu::TextureFormat,
        sample_count: u32,
        usage: wgpu::TextureUsages,
    ) -> WgpuTexture {
        let texture = self.device.create_texture(&wgpu::TextureDescriptor {
            label: Some("strato texture"),
            size: wgpu::Extent3d {
                width: width.max(1),
                height: height.max(1),
                depth_or_array_layers: 1,
            },
            mip_level_count: 1,
            sample_count,
            dimension: wgpu::TextureDimension::D2,
            format,
            usage,
            view_formats: &[],
        });
        let view = texture.create_view(&wgpu::TextureViewDescriptor::default());
        WgpuTexture {
            texture,
            view,
            sample_count,
        }
    }

    fn create_filter_target(&self, width: u32, height: u32) -> WgpuTexture {
        self.create_texture(
            width,
            height,
            COLOR_FORMAT,
            1,
            wgpu::TextureUsages::RENDER_ATTACHMENT
                | wgpu::TextureUsages::TEXTURE_BINDING
                | wgpu::TextureUsages::COPY_SRC,
        )
    }

    /// Runs one fullscreen filter pass from `input` into a new texture.
    fn fullscreen_pass(
        &self,
        kind: PipelineKind,
        input: &wgpu::TextureView,
        output: &WgpuTexture,
        params: &[u8],
    ) -> Result<(), BackendError> {
        let pipeline = self.pipeline(PipelineKey {
            kind,
            blend: Some(BlendMode::Source),
            sample_count: 1,
            has_depth: false,
        });
        let input_group = self.texture_bind_group(input);
        let params_group = self.uniform_bind_group(&self.params_layout, params);

        let mut encoder = self
            .device
            .create_command_encoder(&wgpu::CommandEncoderDescriptor {
                label: Some("strato filter encoder"),
            });
        {
            let mut pass = encoder.begin_render_pass(&wgpu::RenderPassDescriptor {
                label: Some("strato filter pass"),
                color_attachments: &[Some(wgpu::RenderPassColorAttachment {
                    view: &output.view,
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
            pass.set_pipeline(&pipeline);
            pass.set_bind_group(0, &input_group, &[]);
            pass.set_bind_group(1, &params_group, &[]);
            pass.draw(0..3, 0..1);
        }
        self.queue.submit(std::iter::once(encoder.finish()));
        Ok(())
    }

    /// Applies one filter op, returning the filtered texture.
    fn apply_filter_op(
        &self,
        op: &OffscreenOp,
        input: &WgpuTexture,
    ) -> Result<Arc<WgpuTexture>, BackendError> {
        let (width, height) = input.size();
        let texel = [1.0 / width as f32, 1.0 / height as f32];
        match op {
            OffscreenOp::Image(ImageFilter::Blur { sigma_x, sigma_y }) => {
                let horizontal = self.create_filter_target(width, height);
                let params = BlurParams {
                    direction: [1.0, 0.0],
                    texel,
                    sigma: sigma_x.max(1e-3),
                    radius: (sigma_x * 3.0).ceil().clamp(1.0, 64.0),
                    _pad: [0.0; 2],
                };
                self.fullscreen_pass(
                    PipelineKind::Blur,
                    &input.view,
                    &horizontal,
                    bytemuck::bytes_of(&params),
                )?;
                let vertical = self.create_filter_target(width, height);
                let params = BlurParams {
                    direction: [0.0, 1.0],
                    texel,
                    sigma: sigma_y.max(1e-3),
                    radius: (sigma_y * 3.0).ceil().clamp(1.0, 64.0),
                    _pad: [0.0; 2],
                };
                self.fullscreen_pass(
                    PipelineKind::Blur,
                    &horizontal.view,
                    &vertical,
                    bytemuck::bytes_of(&params),
                )?;
                Ok(Arc::new(vertical))
            }
            OffscreenOp::Image(ImageFilter::Dilate { radius })
            | OffscreenOp::Image(ImageFilter::Erode { radius }) => {
                let mode = match op {
                    OffscreenOp::Image(ImageFilter::Dilate { .. }) => 0,
                    _ => 1,
                };
                let params = |direction: [f32; 2]| MorphologyParams {
                    direction,
                    texel,
                    radius: radius.ceil().clamp(1.0, 64.0),
                    mode,
                    _pad: [0.0; 2],
                };
                let horizontal = self.create_filter_target(width, height);
                self.fullscreen_pass(
                    PipelineKind::Morphology,
                    &input.view,
                    &horizontal,
                    bytemuck::bytes_of(&params([1.0, 0.0])),
                )?;
                let vertical = self.create_filter_target(width, height);
                self.fullscreen_pass(
                    PipelineKind::Morphology,
                    &horizontal.view,
                    &vertical,
                    bytemuck::bytes_of(&params([0.0, 1.0])),
                )?;
                Ok(Arc::new(vertical))
            }
            OffscreenOp::Color(filter) => {
                let params = match filter {
                    ColorFilter::Matrix(m) => {
                        let mut matrix = [[0.0f32; 4]; 5];
                        for (i, value) in m.iter().enumerate() {
                            matrix[i / 4][i % 4] = *value;
                        }
                        ColorFilterParams {
                            color: [0.0; 4],
                            matrix,
                            kind: 0,
                            mode: 0,
                            _pad: [0; 2],
                        }
                    }
                    ColorFilter::Blend { color, mode } => ColorFilterParams {
                        color: color.to_array(),
                        matrix: [[0.0; 4]; 5],
                        kind: 1,
                        mode: full_mode_id(*mode),
                        _pad: [0; 2],
                    },
                };
                let output = self.create_filter_target(width, height);
                self.fullscreen_pass(
                    PipelineKind::ColorFilterPass,
                    &input.view,
                    &output,
                    bytemuck::bytes_of(&params),
                )?;
                Ok(Arc::new(output))
            }
        }
    }
}

// --- draw packets ---

#[derive(Debug)]
enum OffscreenOp {
    Image(ImageFilter),
    Color(ColorFilter),
}

impl OffscreenOp {
    fn padding(&self) -> f32 {
        match self {
            OffscreenOp::Image(filter) => filter.coverage_padding(),
            OffscreenOp::Color(_) => 0.0,
        }
    }
}

#[derive(Debug)]
enum PacketKind {
    Shape,
    Clip,
    Textured(TextureRef),
    RRectBlur(RRectParams),
    BackdropShape {
        mode: BlendMode,
        backdrop: TextureRef,
    },
    BackdropTextured {
        mode: BlendMode,
        backdrop: TextureRef,
        texture: TextureRef,
    },
    /// Child packets rendered to a scratch texture, run through `ops`, then
    /// composited as a quad. Resolved to `Textured`/`BackdropTextured` before
    /// the owning pass encodes.
    Offscreen {
        ops: Vec<OffscreenOp>,
        inner: Vec<DrawPacket>,
        bounds: Box2D,
        backdrop: Option<(BlendMode, TextureRef)>,
    },
}

#[derive(Debug)]
struct DrawPacket {
    vertices: Vec<GpuVertex>,
    indices: Vec<u16>,
    depth: u64,
    blend: BlendMode,
    scissor: Option<ScissorRect>,
    kind: PacketKind,
}

fn unpremultiply(c: [f32; 4]) -> Color {
    if c[3] <= 0.0 {
        return Color::TRANSPARENT;
    }
    Color::new(c[0] / c[3], c[1] / c[3], c[2] / c[3], c[3])
}

fn apply_cpu_filters(mut color: Color, filters: &[ColorFilter]) -> Color {
    // Innermost wrapper last in the stack, applied first.
    for filter in filters.iter().rev() {
        color = filter.apply_to_color(color).unwrap_or(color);
    }
    color
}

/// True when the subtree's colors live entirely in vertex data, so a
/// CPU-applicable color filter can fold into them instead of costing a pass.
fn is_vertex_foldable(contents: &Contents) -> bool {
    match contents {
        Contents::ColorSource(_) => true,
        Contents::ColorFilter { child, .. } => is_vertex_foldable(child),
        _ => false,
    }
}

fn transform_point(transform: &Transform, x: f32, y: f32) -> [f32; 2] {
    let p = transform.transform_point(point(x, y));
    [p.x, p.y]
}

fn is_axis_aligned(transform: &Transform) -> bool {
    transform.m12.abs() < 1e-6 && transform.m21.abs() < 1e-6
}

/// Intersection of two scissors, `None` when they do not overlap and the
/// draw can be skipped outright.
fn intersect_scissor(a: ScissorRect, b: ScissorRect) -> Option<ScissorRect> {
    let x = a.x.max(b.x);
    let y = a.y.max(b.y);
    let right = (a.x + a.width).min(b.x + b.width);
    let bottom = (a.y + a.height).min(b.y + b.height);
    if right <= x || bottom <= y {
        return None;
    }
    Some(ScissorRect {
        x,
        y,
        width: right - x,
        height: bottom - y,
    })
}

fn push_quad(
    vertices: &mut Vec<GpuVertex>,
    indices: &mut Vec<u16>,
    corners: [[f32; 2]; 4],
    uvs: [[f32; 2]; 4],
    color: [f32; 4],
) {
    let base = vertices.len() as u16;
    for (position, tex_coords) in corners.iter().zip(uvs.iter()) {
        vertices.push(GpuVertex {
            position: *position,
            tex_coords: *tex_coords,
            color,
            order: 0.0,
        });
    }
    indices.extend_from_slice(&[base, base + 1, base + 2, base + 2, base + 1, base + 3]);
}

struct Flattener<'a> {
    transform: &'a Transform,
    opacity: f32,
    blend: BlendMode,
    depth: u64,
    scissor: Option<ScissorRect>,
    target_size: (u32, u32),
    cpu_filters: Vec<ColorFilter>,
}

impl<'a> Flattener<'a> {
    fn packet(&self, kind: PacketKind, vertices: Vec<GpuVertex>, indices: Vec<u16>) -> DrawPacket {
        DrawPacket {
            vertices,
            indices,
            depth: self.depth,
            blend: self.blend,
            scissor: self.scissor,
            kind,
        }
    }

    fn flatten(&mut self, contents: &Contents, out: &mut Vec<DrawPacket>) -> bool {
        match contents {
            Contents::ColorSource(c) => {
                let mut vertices = Vec::with_capacity(c.mesh.vertices.len());
                for v in &c.mesh.vertices {
                    let straight = match &c.source {
                        Some(source) => source.evaluate(point(v.position[0], v.position[1])),
                        None => unpremultiply(v.color),
                    };
                    let filtered = apply_cpu_filters(straight, &self.cpu_filters);
                    let mut color = filtered.premultiply();
                    for channel in color.iter_mut() {
                        *channel *= self.opacity;
                    }
                    vertices.push(GpuVertex {
                        position: transform_point(self.transform, v.position[0], v.position[1]),
                        tex_coords: v.position,
                        color,
                        order: 0.0,
                    });
                }
                out.push(self.packet(PacketKind::Shape, vertices, c.mesh.indices.clone()));
                true
            }
            Contents::Texture(c) => {
                let (tw, th) = c.texture.size();
                let (tw, th) = (tw as f32, th as f32);
                let alpha = (self.opacity * c.opacity).clamp(0.0, 1.0);
                let color = [alpha; 4];
                let mut vertices = Vec::with_capacity(c.quads.len() * 4);
                let mut indices = Vec::with_capacity(c.quads.len() * 6);
                for quad in &c.quads {
                    let corners = [
                        transform_point(self.transform, quad.dst.min.x, quad.dst.min.y),
                        transform_point(self.transform, quad.dst.max.x, quad.dst.min.y),
                        transform_point(self.transform, quad.dst.min.x, quad.dst.max.y),
                        transform_point(self.transform, quad.dst.max.x, quad.dst.max.y),
                    ];
                    let uvs = [
                        [quad.src.min.x / tw, quad.src.min.y / th],
                        [quad.src.max.x / tw, quad.src.min.y / th],
                        [quad.src.min.x / tw, quad.src.max.y / th],
                        [quad.src.max.x / tw, quad.src.max.y / th],
                    ];
                    push_quad(&mut vertices, &mut indices, corners, uvs, color);
                }
                out.push(self.packet(
                    PacketKind::Textured(c.texture.clone()),
                    vertices,
                    indices,
                ));
                true
            }
            Contents::SolidRRectBlur(c) => {
                if !is_axis_aligned(self.transform) {
                    tracing::debug!("rotated rounded-rect blur approximated without blur");
                }
                let min = transform_point(self.transform, c.rect.min.x, c.rect.min.y);
                let max = transform_point(self.transform, c.rect.max.x, c.rect.max.y);
                let (min_x, max_x) = (min[0].min(max[0]), min[0].max(max[0]));
                let (min_y, max_y) = (min[1].min(max[1]), min[1].max(max[1]));
                let scale = ((max_x - min_x) / (c.rect.max.x - c.rect.min.x).max(1e-6))
                    .max((max_y - min_y) / (c.rect.max.y - c.rect.min.y).max(1e-6));
                let sigma = (c.sigma * scale).max(1e-3);
                let pad = sigma * 3.0 + 1.0;

                let color = apply_cpu_filters(c.color, &self.cpu_filters)
                    .with_opacity(self.opacity)
                    .premultiply();
                let params = RRectParams {
                    center: [(min_x + max_x) / 2.0, (min_y + max_y) / 2.0],
                    half_size: [(max_x - min_x) / 2.0, (max_y - min_y) / 2.0],
                    color,
                    radius: c.corner_radius * scale,
                    sigma,
                    _pad: [0.0; 2],
                };
                let corners = [
                    [min_x - pad, min_y - pad],
                    [max_x + pad, min_y - pad],
                    [min_x - pad, max_y + pad],
                    [max_x + pad, max_y + pad],
                ];
                // uv carries the pass-space position for the SDF evaluation.
                let mut vertices = Vec::with_capacity(4);
                let mut indices = Vec::with_capacity(6);
                push_quad(&mut vertices, &mut indices, corners, corners, [1.0; 4]);
                out.push(self.packet(PacketKind::RRectBlur(params), vertices, indices));
                true
            }
            Contents::ColorFilter { filter, child } => {
                if filter.cpu_applicable() && is_vertex_foldable(child) {
                    self.cpu_filters.push(filter.clone());
                    let ok = self.flatten(child, out);
                    self.cpu_filters.pop();
                    return ok;
                }
                self.offscreen(vec![OffscreenOp::Color(filter.clone())], child, out)
            }
            Contents::ImageFilter { filter, child } => {
                self.offscreen(vec![OffscreenOp::Image(filter.clone())], child, out)
            }
            Contents::MaskBlur {
                blur,
                color_filter,
                child,
            } => {
                let mut ops = Vec::new();
                if let Some(filter) = color_filter {
                    ops.push(OffscreenOp::Color(filter.clone()));
                }
                ops.push(OffscreenOp::Image(ImageFilter::blur(blur.sigma)));
                if matches!(blur.style, BlurStyle::Inner | BlurStyle::Outer) {
                    tracing::debug!(style = ?blur.style, "mask blur style approximated as normal");
                }
                let ok = self.offscreen(ops, child, out);
                if ok && blur.style == BlurStyle::Solid {
                    return self.flatten(child, out);
                }
                ok
            }
            Contents::FramebufferBlend { .. } => {
                tracing::debug!("framebuffer fetch blending is not available on this backend");
                false
            }
            Contents::BackdropBlend {
                mode,
                backdrop,
                coverage_hint,
                child,
            } => {
                let saved_scissor = self.scissor;
                if let Some(hint) = coverage_hint {
                    // A hint outside the target or disjoint from the current
                    // scissor leaves nothing to blend.
                    let Some(hint_scissor) = ScissorRect::from_coverage(hint, self.target_size)
                    else {
                        return true;
                    };
                    self.scissor = match self.scissor {
                        Some(current) => match intersect_scissor(current, hint_scissor) {
                            Some(merged) => Some(merged),
                            None => return true,
                        },
                        None => Some(hint_scissor),
                    };
                }
                let mut packets = Vec::new();
                let ok = self.flatten(child, &mut packets);
                self.scissor = saved_scissor;
                if !ok {
                    return false;
                }
                for mut packet in packets {
                    packet.kind = match packet.kind {
                        PacketKind::Shape => PacketKind::BackdropShape {
                            mode: *mode,
                            backdrop: backdrop.clone(),
                        },
                        PacketKind::Textured(texture) => PacketKind::BackdropTextured {
                            mode: *mode,
                            backdrop: backdrop.clone(),
                            texture,
                        },
                        PacketKind::Offscreen {
                            ops,
                            inner,
                            bounds,
                            ..
                        } => PacketKind::Offscreen {
                            ops,
                            inner,
                            bounds,
                            backdrop: Some((*mode, backdrop.clone())),
                        },
                        other => {
                            tracing::debug!("unsupported child under an advanced blend");
                            other
                        }
                    };
                    out.push(packet);
                }
                true
            }
            Contents::Clip { mesh, .. } => {
                let vertices = mesh
                    .vertices
                    .iter()
                    .map(|v| GpuVertex {
                        position: v.position,
                        tex_coords: [0.0; 2],
                        color: [0.0; 4],
                        order: 0.0,
                    })
                    .collect();
                out.push(self.packet(PacketKind::Clip, vertices, mesh.indices.clone()));
                true
            }
        }
    }

    fn offscreen(
        &mut self,
        ops: Vec<OffscreenOp>,
        child: &Contents,
        out: &mut Vec<DrawPacket>,
    ) -> bool {
        let Some(bounds) = child.coverage(self.transform) else {
            // Nothing to filter.
            return true;
        };
        let mut inner = Vec::new();
        let saved_scissor = self.scissor.take();
        let ok = self.flatten(child, &mut inner);
        self.scissor = saved_scissor;
        if !ok {
            return false;
        }
        for packet in inner.iter_mut() {
            packet.depth = 0;
        }
        out.push(self.packet(
            PacketKind::Offscreen {
                ops,
                inner,
                bounds,
                backdrop: None,
            },
            Vec::new(),
            Vec::new(),
        ));
        true
    }
}

// --- render pass ---

pub struct WgpuRenderPass {
    core: Arc<WgpuCore>,
    target: EntityPassTarget,
    clear: Option<Color>,
    scissor: Option<ScissorRect>,
    packets: Vec<DrawPacket>,
}

impl RenderPass for WgpuRenderPass {
    fn set_scissor(&mut self, scissor: Option<ScissorRect>) {
        self.scissor = scissor;
    }

    fn draw(&mut self, entity: &Entity) -> bool {
        let mut flattener = Flattener {
            transform: &entity.transform,
            opacity: entity.inherited_opacity.clamp(0.0, 1.0),
            blend: entity.blend_mode,
            depth: entity.clip_depth,
            scissor: self.scissor,
            target_size: self.target.size(),
            cpu_filters: Vec::new(),
        };
        flattener.flatten(&entity.contents, &mut self.packets)
    }

    fn end(self: Box<Self>) -> Result<TextureRef, BackendError> {
        let mut packets = self.packets;
        resolve_offscreen(&self.core, &mut packets)?;

        let max_depth = packets.iter().map(|p| p.depth).max().unwrap_or(0);
        for packet in packets.iter_mut() {
            let order = normalized_depth(packet.depth, max_depth);
            for vertex in packet.vertices.iter_mut() {
                vertex.order = order;
            }
        }

        encode_packets(&self.core, &self.target, self.clear, &packets)?;
        Ok(self.target.readable())
    }
}

/// Pre-renders every offscreen packet: inner packets into a scratch texture,
/// filter ops over it, then the packet becomes a textured composite quad.
fn resolve_offscreen(core: &WgpuCore, packets: &mut [DrawPacket]) -> Result<(), BackendError> {
    for packet in packets.iter_mut() {
        let PacketKind::Offscreen {
            ops,
            inner,
            bounds,
            backdrop,
        } = &mut packet.kind
        else {
            continue;
        };
        resolve_offscreen(core, inner)?;

        let pad = ops.iter().map(|op| op.padding()).sum::<f32>().ceil();
        let width = ((bounds.max.x - bounds.min.x).ceil() + 2.0 * pad).max(1.0) as u32;
        let height = ((bounds.max.y - bounds.min.y).ceil() + 2.0 * pad).max(1.0) as u32;

        // Shift inner geometry into scratch-texture space.
        let offset = [pad - bounds.min.x, pad - bounds.min.y];
        for inner_packet in inner.iter_mut() {
            for vertex in inner_packet.vertices.iter_mut() {
                vertex.position[0] += offset[0];
                vertex.position[1] += offset[1];
            }
        }

        let scratch = Arc::new(core.create_filter_target(width, height));
        let scratch_target = EntityPassTarget {
            color: scratch.clone() as TextureRef,
            resolve: None,
            depth_stencil: None,
        };
        encode_packets(core, &scratch_target, Some(Color::TRANSPARENT), inner)?;

        let mut filtered: Arc<WgpuTexture> = scratch;
        for op in ops.iter() {
            filtered = core.apply_filter_op(op, &filtered)?;
        }

        let quad_min = [bounds.min.x - pad, bounds.min.y - pad];
        let quad_max = [bounds.max.x + pad, bounds.max.y + pad];
        let corners = [
            [quad_min[0], quad_min[1]],
            [quad_max[0], quad_min[1]],
            [quad_min[0], quad_max[1]],
            [quad_max[0], quad_max[1]],
        ];
        let uvs = [[0.0, 0.0], [1.0, 0.0], [0.0, 1.0], [1.0, 1.0]];
        let mut vertices = Vec::with_capacity(4);
        let mut indices = Vec::with_capacity(6);
        push_quad(&mut vertices, &mut indices, corners, uvs, [1.0; 4]);
        packet.vertices = vertices;
        packet.indices = indices;
        packet.kind = match backdrop.take() {
            Some((mode, backdrop)) => PacketKind::BackdropTextured {
                mode,
                backdrop,
                texture: filtered as TextureRef,
            },
            None => PacketKind::Textured(filtered as TextureRef),
        };
    }
    Ok(())
}

fn wgpu_clear_color(color: Color) -> wgpu::Color {
    let p = color.premultiply();
    wgpu::Color {
        r: p[0] as f64,
        g: p[1] as f64,
        b: p[2] as f64,
        a: p[3] as f64,
    }
}

/// Uploads and draws one pass worth of packets.
fn encode_packets(
    core: &WgpuCore,
    target: &EntityPassTarget,
    clear: Option<Color>,
    packets: &[DrawPacket],
) -> Result<(), BackendError> {
    let color = native(&target.color).ok_or(BackendError::PassCreation)?;
    let resolve = match &target.resolve {
        Some(texture) => Some(native(texture).ok_or(BackendError::PassCreation)?),
        None => None,
    };
    let depth = match &target.depth_stencil {
        Some(texture) => Some(native(texture).ok_or(BackendError::PassCreation)?),
        None => None,
    };
    let (width, height) = target.size();
    let sample_count = color.sample_count;
    let has_depth = depth.is_some();

    let mut vertices: Vec<GpuVertex> = Vec::new();
    let mut indices: Vec<u16> = Vec::new();
    struct EncodedDraw {
        index_range: std::ops::Range<u32>,
        base_vertex: i32,
    }
    let mut draws = Vec::with_capacity(packets.len());
    for packet in packets {
        let base_vertex = vertices.len() as i32;
        let index_start = indices.len() as u32;
        vertices.extend_from_slice(&packet.vertices);
        indices.extend_from_slice(&packet.indices);
        draws.push(EncodedDraw {
            index_range: index_start..indices.len() as u32,
            base_vertex,
        });
    }
    if indices.len() % 2 != 0 {
        // Index buffer sizes must be 4-byte aligned.
        indices.push(0);
    }

    let globals = Globals {
        resolution: [width as f32, height as f32],
        _pad: [0.0; 2],
    };
    let globals_group =
        core.uniform_bind_group(&core.globals_layout, bytemuck::bytes_of(&globals));

    let (vertex_buffer, index_buffer) = if vertices.is_empty() {
        (None, None)
    } else {
        let vertex_buffer = core
            .device
            .create_buffer_init(&wgpu::util::BufferInitDescriptor {
                label: Some("strato vertex buffer"),
                contents: bytemuck::cast_slice(&vertices),
                usage: wgpu::BufferUsages::VERTEX,
            });
        let index_buffer = core
            .device
            .create_buffer_init(&wgpu::util::BufferInitDescriptor {
                label: Some("strato index buffer"),
                contents: bytemuck::cast_slice(&indices),
                usage: wgpu::BufferUsages::INDEX,
            });
        (Some(vertex_buffer), Some(index_buffer))
    };

    let mut encoder = core
        .device
        .create_command_encoder(&wgpu::CommandEncoderDescriptor {
            label: Some("strato pass encoder"),
        });
    {
        let load = match clear {
            Some(color) => wgpu::LoadOp::Clear(wgpu_clear_color(color)),
            None => wgpu::LoadOp::Load,
        };
        let mut pass = encoder.begin_render_pass(&wgpu::RenderPassDescriptor {
            label: Some("strato entity pass"),
            color_attachments: &[Some(wgpu::RenderPassColorAttachment {
                view: &color.view,
                resolve_target: resolve.map(|t| &t.view),
                ops: wgpu::Operations {
                    load,
                    store: wgpu::StoreOp::Store,
                },
            })],
            depth_stencil_attachment: depth.map(|t| wgpu::RenderPassDepthStencilAttachment {
                view: &t.view,
                depth_ops: Some(wgpu::Operations {
                    load: wgpu::LoadOp::Clear(0.0),
                    store: wgpu::StoreOp::Store,
                }),
                stencil_ops: Some(wgpu::Operations {
                    load: wgpu::LoadOp::Clear(0),
                    store: wgpu::StoreOp::Store,
                }),
            }),
            timestamp_writes: None,
            occlusion_query_set: None,
        });

        if let (Some(vertex_buffer), Some(index_buffer)) = (&vertex_buffer, &index_buffer) {
            pass.set_vertex_buffer(0, vertex_buffer.slice(..));
            pass.set_index_buffer(index_buffer.slice(..), wgpu::IndexFormat::Uint16);

            for (packet, draw) in packets.iter().zip(draws.iter()) {
                if packet.indices.is_empty() {
                    continue;
                }
                match packet.scissor {
                    Some(s) => pass.set_scissor_rect(
                        s.x.min(width.saturating_sub(1)),
                        s.y.min(height.saturating_sub(1)),
                        s.width.min(width - s.x.min(width.saturating_sub(1))),
                        s.height.min(height - s.y.min(height.saturating_sub(1))),
                    ),
                    None => pass.set_scissor_rect(0, 0, width, height),
                }

                let (kind, blend) = match &packet.kind {
                    PacketKind::Shape => (PipelineKind::Shape, Some(packet.blend)),
                    PacketKind::Clip => (PipelineKind::Clip, None),
                    PacketKind::Textured(_) => (PipelineKind::Textured, Some(packet.blend)),
                    PacketKind::RRectBlur(_) => (PipelineKind::RRectBlur, Some(packet.blend)),
                    PacketKind::BackdropShape { .. } => {
                        (PipelineKind::BackdropShape, Some(BlendMode::Source))
                    }
                    PacketKind::BackdropTextured { .. } => {
                        (PipelineKind::BackdropTextured, Some(BlendMode::Source))
                    }
                    PacketKind::Offscreen { .. } => {
                        // Resolved before encoding; nothing to draw if one
                        // slipped through.
                        continue;
                    }
                };
                let pipeline = core.pipeline(PipelineKey {
                    kind,
                    blend,
                    sample_count,
                    has_depth,
                });
                pass.set_pipeline(&pipeline);
                pass.set_bind_group(0, &globals_group, &[]);

                match &packet.kind {
                    PacketKind::Textured(texture) => {
                        let Some(texture) = native(texture) else {
                            continue;
                        };
                        let group = core.texture_bind_group(&texture.view);
                        pass.set_bind_group(1, &group, &[]);
                        pass.draw_indexed(draw.index_range.clone(), draw.base_vertex, 0..1);
                    }
                    PacketKind::RRectBlur(params) => {
                        let group = core
                            .uniform_bind_group(&core.params_layout, bytemuck::bytes_of(params));
                        pass.set_bind_group(1, &group, &[]);
                        pass.draw_indexed(draw.index_range.clone(), draw.base_vertex, 0..1);
                    }
                    PacketKind::BackdropShape { mode, backdrop } => {
                        let Some(backdrop) = native(backdrop) else {
                            continue;
                        };
                        let (bw, bh) = backdrop.size();
                        let params = BlendParams {
                            backdrop_texel: [1.0 / bw as f32, 1.0 / bh as f32],
                            mode: advanced_mode_id(*mode),
                            _pad: 0,
                        };
                        let backdrop_group = core.texture_bind_group(&backdrop.view);
                        let params_group = core
                            .uniform_bind_group(&core.params_layout, bytemuck::bytes_of(&params));
                        pass.set_bind_group(1, &backdrop_group, &[]);
                        pass.set_bind_group(2, &params_group, &[]);
                        pass.draw_indexed(draw.index_range.clone(), draw.base_vertex, 0..1);
                    }
                    PacketKind::BackdropTextured {
                        mode,
                        backdrop,
                        texture,
                    } => {
                        let (Some(backdrop), Some(texture)) = (native(backdrop), native(texture))
                        else {
                            continue;
                        };
                        let (bw, bh) = backdrop.size();
                        let params = BlendParams {
                            backdrop_texel: [1.0 / bw as f32, 1.0 / bh as f32],
                            mode: advanced_mode_id(*mode),
                            _pad: 0,
                        };
                        let content_group = core.texture_bind_group(&texture.view);
                        let params_group = core
                            .uniform_bind_group(&core.params_layout, bytemuck::bytes_of(&params));
                        let backdrop_group = core.texture_bind_group(&backdrop.view);
                        pass.set_bind_group(1, &content_group, &[]);
                        pass.set_bind_group(2, &params_group, &[]);
                        pass.set_bind_group(3, &backdrop_group, &[]);
                        pass.draw_indexed(draw.index_range.clone(), draw.base_vertex, 0..1);
                    }
                    _ => {
                        pass.draw_indexed(draw.index_range.clone(), draw.base_vertex, 0..1);
                    }
                }
            }
        }
    }
    core.queue.submit(std::iter::once(encoder.finish()));
    Ok(())
}

// --- blit pass ---

pub struct WgpuBlitPass {
    core: Arc<WgpuCore>,
    encoder: wgpu::CommandEncoder,
}

impl BlitPass for WgpuBlitPass {
    fn copy_texture(
        &mut self,
        source: &TextureRef,
        destination: &TextureRef,
        destination_origin: (u32, u32),
    ) -> bool {
        let (Some(src), Some(dst)) = (native(source), native(destination)) else {
            tracing::debug!("blit between foreign textures skipped");
            return false;
        };
        let (sw, sh) = src.size();
        let (dw, dh) = dst.size();
        let width = sw.min(dw.saturating_sub(destination_origin.0));
        let height = sh.min(dh.saturating_sub(destination_origin.1));
        if width == 0 || height == 0 {
            return false;
        }
        self.encoder.copy_texture_to_texture(
            wgpu::TexelCopyTextureInfo {
                texture: &src.texture,
                mip_level: 0,
                origin: wgpu::Origin3d::ZERO,
                aspect: wgpu::TextureAspect::All,
            },
            wgpu::TexelCopyTextureInfo {
                texture: &dst.texture,
                mip_level: 0,
                origin: wgpu::Origin3d {
                    x: destination_origin.0,
                    y: destination_origin.1,
                    z: 0,
                },
                aspect: wgpu::TextureAspect::All,
            },
            wgpu::Extent3d {
                width,
                height,
                depth_or_array_layers: 1,
            },
        );
        true
    }

    fn submit(self: Box<Self>) -> Result<(), BackendError> {
        self.core.queue.submit(std::iter::once(self.encoder.finish()));
        Ok(())
    }
}

// --- context ---

/// [`GpuContext`] over a wgpu device and queue.
pub struct WgpuContext {
    core: Arc<WgpuCore>,
}

impl WgpuContext {
    pub fn new(device: wgpu::Device, queue: wgpu::Queue) -> Self {
        Self {
            core: Arc::new(WgpuCore::new(device, queue)),
        }
    }

    /// Creates a root target suitable for [`crate::Canvas::new`].
    pub fn create_root_target(
        &mut self,
        width: u32,
        height: u32,
        msaa: bool,
    ) -> Result<EntityPassTarget, BackendError> {
        self.create_offscreen_target(
            width,
            height,
            TargetConfig {
                msaa,
                depth_stencil: true,
            },
        )
    }
}

impl GpuContext for WgpuContext {
    fn capabilities(&self) -> Capabilities {
        let max = self.core.device.limits().max_texture_dimension_2d;
        Capabilities {
            framebuffer_fetch: false,
            offscreen_msaa: true,
            read_from_resolve: true,
            max_attachment_size: (max, max),
        }
    }

    fn create_offscreen_target(
        &mut self,
        width: u32,
        height: u32,
        config: TargetConfig,
    ) -> Result<EntityPassTarget, BackendError> {
        let sample_count = if config.msaa { MSAA_SAMPLE_COUNT } else { 1 };
        let color_usage = if config.msaa {
            wgpu::TextureUsages::RENDER_ATTACHMENT
        } else {
            wgpu::TextureUsages::RENDER_ATTACHMENT
                | wgpu::TextureUsages::TEXTURE_BINDING
                | wgpu::TextureUsages::COPY_SRC
                | wgpu::TextureUsages::COPY_DST
        };
        let color = Arc::new(self.core.create_texture(
            width,
            height,
            COLOR_FORMAT,
            sample_count,
            color_usage,
        ));
        let resolve = config.msaa.then(|| {
            Arc::new(self.core.create_texture(
                width,
                height,
                COLOR_FORMAT,
                1,
                wgpu::TextureUsages::RENDER_ATTACHMENT
                    | wgpu::TextureUsages::TEXTURE_BINDING
                    | wgpu::TextureUsages::COPY_SRC,
            )) as TextureRef
        });
        let depth_stencil = config.depth_stencil.then(|| {
            Arc::new(self.core.create_texture(
                width,
                height,
                DEPTH_FORMAT,
                sample_count,
                wgpu::TextureUsages::RENDER_ATTACHMENT,
            )) as TextureRef
        });
        Ok(EntityPassTarget {
            color,
            resolve,
            depth_stencil,
        })
    }

    fn create_render_pass(
        &mut self,
        target: &EntityPassTarget,
        clear_color: Option<Color>,
    ) -> Result<Box<dyn RenderPass>, BackendError> {
        if native(&target.color).is_none() {
            return Err(BackendError::PassCreation);
        }
        Ok(Box::new(WgpuRenderPass {
            core: self.core.clone(),
            target: target.clone(),
            clear: clear_color,
            scissor: None,
            packets: Vec::new(),
        }))
    }

    fn create_blit_pass(&mut self) -> Result<Box<dyn BlitPass>, BackendError> {
        let encoder = self
            .core
            .device
            .create_command_encoder(&wgpu::CommandEncoderDescriptor {
                label: Some("strato blit encoder"),
            });
        Ok(Box::new(WgpuBlitPass {
            core: self.core.clone(),
            encoder,
        }))
    }

    fn render_filter(
        &mut self,
        filter: &ImageFilter,
        input: &TextureRef,
    ) -> Result<TextureRef, BackendError> {
        let Some(texture) = native(input) else {
            return Err(BackendError::FilterRender);
        };
        let op = OffscreenOp::Image(filter.clone());
        let filtered = self.core.apply_filter_op(&op, texture)?;
        Ok(filtered as TextureRef)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn advanced_mode_ids_are_stable() {
        assert_eq!(advanced_mode_id(BlendMode::Screen), 0);
        assert_eq!(advanced_mode_id(BlendMode::Luminosity), 14);
        assert_eq!(full_mode_id(BlendMode::SourceOver), 3);
        assert_eq!(full_mode_id(BlendMode::Multiply), 24);
    }

    #[test]
    fn scissor_intersection_clamps() {
        let a = ScissorRect {
            x: 0,
            y: 0,
            width: 10,
            height: 10,
        };
        let b = ScissorRect {
            x: 5,
            y: 5,
            width: 10,
            height: 10,
        };
        let merged = intersect_scissor(a, b).unwrap();
        assert_eq!((merged.x, merged.y), (5, 5));
        assert_eq!((merged.width, merged.height), (5, 5));
    }

    #[test]
    fn disjoint_scissors_skip_the_draw() {
        let a = ScissorRect {
            x: 0,
            y: 0,
            width: 10,
            height: 10,
        };
        let b = ScissorRect {
            x: 20,
            y: 20,
            width: 10,
            height: 10,
        };
        assert!(intersect_scissor(a, b).is_none());
    }

    #[test]
    fn packet_kinds_are_debug_printable() {
        let kind = PacketKind::RRectBlur(RRectParams {
            center: [10.0, 10.0],
            half_size: [5.0, 5.0],
            color: [0.0, 0.0, 0.0, 1.0],
            radius: 2.0,
            sigma: 3.0,
            _pad: [0.0; 2],
        });
        assert!(format!("{kind:?}").contains("RRectBlur"));
    }

    #[test]
    fn unpremultiply_handles_zero_alpha() {
        assert_eq!(unpremultiply([0.0, 0.0, 0.0, 0.0]), Color::TRANSPARENT);
        let c = unpremultiply([0.25, 0.125, 0.0625, 0.5]);
        assert!((c.r - 0.5).abs() < 1e-6);
        assert!((c.g - 0.25).abs() < 1e-6);
    }
}
