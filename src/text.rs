//! Pre-shaped text and the text shadow cache.
//!
//! Shaping and rasterization happen upstream; a [`TextFrame`] arrives as
//! positioned quads into a glyph atlas texture. The only text-specific work
//! the compositor does is caching blurred shadow renders, which are expensive
//! and extremely repetitive frame to frame.

use std::num::NonZeroUsize;

use lyon::math::Box2D;
use lru::LruCache;

use crate::backend::TextureRef;

/// One glyph: a texel-space rect in the atlas mapped to a destination rect.
#[derive(Debug, Clone, Copy)]
pub struct GlyphQuad {
    pub src: Box2D,
    pub dst: Box2D,
}

/// A shaped run of text ready for compositing.
#[derive(Debug, Clone)]
pub struct TextFrame {
    pub atlas: TextureRef,
    pub glyphs: Vec<GlyphQuad>,
    /// Stable identity of the shaped run (content, font, size). Used as the
    /// shadow cache key; callers hash whatever makes their runs unique.
    pub identity: u64,
}

impl TextFrame {
    /// Union of all glyph destination rects, `None` for an empty frame.
    pub fn bounds(&self) -> Option<Box2D> {
        let mut union: Option<Box2D> = None;
        for glyph in &self.glyphs {
            union = Some(match union {
                Some(u) => u.union(&glyph.dst),
                None => glyph.dst,
            });
        }
        union.filter(|b| !b.is_empty())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
struct ShadowKey {
    identity: u64,
    sigma_bits: u32,
    scale_x_bits: u32,
    scale_y_bits: u32,
}

/// LRU cache of blurred text renders keyed by run identity, blur sigma and
/// the transform scale the run rendered at.
pub(crate) struct TextShadowCache {
    cache: LruCache<ShadowKey, TextureRef>,
    hits: u64,
    misses: u64,
}

const SHADOW_CACHE_CAPACITY: usize = 32;

impl TextShadowCache {
    pub(crate) fn new() -> Self {
        Self {
            cache: LruCache::new(
                NonZeroUsize::new(SHADOW_CACHE_CAPACITY).unwrap_or(NonZeroUsize::MIN),
            ),
            hits: 0,
            misses: 0,
        }
    }

    pub(crate) fn get(
        &mut self,
        frame: &TextFrame,
        sigma: f32,
        scale: (f32, f32),
    ) -> Option<TextureRef> {
        let key = Self::key(frame, sigma, scale);
        match self.cache.get(&key) {
            Some(texture) => {
                self.hits += 1;
                Some(texture.clone())
            }
            None => {
                self.misses += 1;
                None
            }
        }
    }

    pub(crate) fn insert(
        &mut self,
        frame: &TextFrame,
        sigma: f32,
        scale: (f32, f32),
        texture: TextureRef,
    ) {
        self.cache.put(Self::key(frame, sigma, scale), texture);
    }

    #[allow(dead_code)]
    pub(crate) fn hit_rate(&self) -> f64 {
        let total = self.hits + self.misses;
        if total == 0 {
            return 0.0;
        }
        self.hits as f64 / total as f64
    }

    fn key(frame: &TextFrame, sigma: f32, scale: (f32, f32)) -> ShadowKey {
        ShadowKey {
            identity: frame.identity,
            sigma_bits: sigma.to_bits(),
            scale_x_bits: scale.0.to_bits(),
            scale_y_bits: scale.1.to_bits(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::GpuTexture;
    use lyon::math::point;
    use std::sync::Arc;

    #[derive(Debug)]
    struct FakeTexture;

    impl GpuTexture for FakeTexture {
        fn size(&self) -> (u32, u32) {
            (16, 16)
        }
        fn as_any(&self) -> &dyn std::any::Any {
            self
        }
    }

    fn frame(identity: u64) -> TextFrame {
        TextFrame {
            atlas: Arc::new(FakeTexture),
            glyphs: vec![
                GlyphQuad {
                    src: Box2D::new(point(0.0, 0.0), point(8.0, 8.0)),
                    dst: Box2D::new(point(10.0, 10.0), point(18.0, 18.0)),
                },
                GlyphQuad {
                    src: Box2D::new(point(8.0, 0.0), point(16.0, 8.0)),
                    dst: Box2D::new(point(18.0, 10.0), point(26.0, 18.0)),
                },
            ],
            identity,
        }
    }

    #[test]
    fn frame_bounds_union_glyphs() {
        let bounds = frame(1).bounds().unwrap();
        assert_eq!(bounds, Box2D::new(point(10.0, 10.0), point(26.0, 18.0)));
    }

    #[test]
    fn shadow_cache_hits_on_same_key() {
        let mut cache = TextShadowCache::new();
        let f = frame(7);
        assert!(cache.get(&f, 2.0, (1.0, 1.0)).is_none());
        cache.insert(&f, 2.0, (1.0, 1.0), Arc::new(FakeTexture));
        assert!(cache.get(&f, 2.0, (1.0, 1.0)).is_some());
        // Sigma and scale are part of the key.
        assert!(cache.get(&f, 3.0, (1.0, 1.0)).is_none());
        assert!(cache.get(&f, 2.0, (2.0, 2.0)).is_none());
    }
}
