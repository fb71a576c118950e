//! Pooled offscreen render targets.
//!
//! Save layers and backdrop flips churn through offscreen targets every
//! frame. The cache recycles targets between frames so a steady-state scene
//! allocates nothing, and trims targets that sat unused for a few frames.

use crate::backend::{BackendError, EntityPassTarget, GpuContext, TargetConfig};

/// Frames a pooled target may sit unused before it is dropped.
const MAX_IDLE_FRAMES: u32 = 3;

struct PooledTarget {
    target: EntityPassTarget,
    idle_frames: u32,
}

/// A recycling pool of [`EntityPassTarget`]s.
#[derive(Default)]
pub struct RenderTargetCache {
    pool: Vec<PooledTarget>,
    /// Targets handed out since construction, pool hits included. Exposed so
    /// callers can assert that a recording produced no subpasses at all.
    total_acquisitions: u64,
    created: u64,
}

impl RenderTargetCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Marks the start of a frame.
    pub fn start_frame(&mut self) {
        for pooled in self.pool.iter_mut() {
            pooled.idle_frames += 1;
        }
    }

    /// Marks the end of a frame and drops targets idle for too long.
    pub fn end_frame(&mut self) {
        let before = self.pool.len();
        self.pool.retain(|p| p.idle_frames < MAX_IDLE_FRAMES);
        let dropped = before - self.pool.len();
        if dropped > 0 {
            tracing::debug!(dropped, remaining = self.pool.len(), "trimmed target pool");
        }
    }

    /// Hands out a target at least `width`x`height` matching `config`,
    /// reusing a pooled one when possible.
    pub fn acquire(
        &mut self,
        gpu: &mut dyn GpuContext,
        width: u32,
        height: u32,
        config: TargetConfig,
    ) -> Result<EntityPassTarget, BackendError> {
        self.total_acquisitions += 1;

        let found = self.pool.iter().position(|p| {
            let (w, h) = p.target.size();
            w >= width && h >= height && p.target.config() == config
        });
        if let Some(index) = found {
            return Ok(self.pool.swap_remove(index).target);
        }

        let max = gpu.capabilities().max_attachment_size;
        if width > max.0 || height > max.1 {
            return Err(BackendError::TargetAllocation { width, height });
        }
        self.created += 1;
        tracing::debug!(width, height, ?config, "allocating offscreen target");
        gpu.create_offscreen_target(width, height, config)
    }

    /// Returns a target to the pool once its texture is no longer referenced
    /// by pending entities.
    pub fn recycle(&mut self, target: EntityPassTarget) {
        self.pool.push(PooledTarget {
            target,
            idle_frames: 0,
        });
    }

    pub fn total_acquisitions(&self) -> u64 {
        self.total_acquisitions
    }

    pub fn targets_created(&self) -> u64 {
        self.created
    }

    pub fn pooled(&self) -> usize {
        self.pool.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::{BlitPass, Capabilities, GpuTexture, RenderPass, TextureRef};
    use crate::color::Color;
    use crate::paint::ImageFilter;
    use std::sync::Arc;

    #[derive(Debug)]
    struct FakeTexture {
        size: (u32, u32),
    }

    impl GpuTexture for FakeTexture {
        fn size(&self) -> (u32, u32) {
            self.size
        }
        fn as_any(&self) -> &dyn std::any::Any {
            self
        }
    }

    #[derive(Default)]
    struct FakeGpu;

    impl GpuContext for FakeGpu {
        fn capabilities(&self) -> Capabilities {
            Capabilities::default()
        }

        fn create_offscreen_target(
            &mut self,
            width: u32,
            height: u32,
            config: TargetConfig,
        ) -> Result<EntityPassTarget, BackendError> {
            let tex = |s| -> TextureRef { Arc::new(FakeTexture { size: s }) };
            Ok(EntityPassTarget {
                color: tex((width, height)),
                resolve: None,
                depth_stencil: config.depth_stencil.then(|| tex((width, height))),
            })
        }

        fn create_render_pass(
            &mut self,
            _target: &EntityPassTarget,
            _clear_color: Option<Color>,
        ) -> Result<Box<dyn RenderPass>, BackendError> {
            Err(BackendError::PassCreation)
        }

        fn create_blit_pass(&mut self) -> Result<Box<dyn BlitPass>, BackendError> {
            Err(BackendError::BlitCreation)
        }

        fn render_filter(
            &mut self,
            _filter: &ImageFilter,
            _input: &TextureRef,
        ) -> Result<TextureRef, BackendError> {
            Err(BackendError::FilterRender)
        }
    }

    #[test]
    fn recycled_target_is_reused() {
        let mut gpu = FakeGpu;
        let mut cache = RenderTargetCache::new();

        let target = cache
            .acquire(&mut gpu, 64, 64, TargetConfig::default())
            .unwrap();
        cache.recycle(target);
        let _second = cache
            .acquire(&mut gpu, 32, 32, TargetConfig::default())
            .unwrap();

        assert_eq!(cache.total_acquisitions(), 2);
        assert_eq!(cache.targets_created(), 1);
    }

    #[test]
    fn config_mismatch_allocates_fresh() {
        let mut gpu = FakeGpu;
        let mut cache = RenderTargetCache::new();

        let target = cache
            .acquire(&mut gpu, 64, 64, TargetConfig::default())
            .unwrap();
        cache.recycle(target);
        let no_depth = TargetConfig {
            depth_stencil: false,
            ..TargetConfig::default()
        };
        let _second = cache.acquire(&mut gpu, 64, 64, no_depth).unwrap();

        assert_eq!(cache.targets_created(), 2);
    }

    #[test]
    fn idle_targets_are_trimmed() {
        let mut gpu = FakeGpu;
        let mut cache = RenderTargetCache::new();

        let target = cache
            .acquire(&mut gpu, 64, 64, TargetConfig::default())
            .unwrap();
        cache.recycle(target);

        for _ in 0..MAX_IDLE_FRAMES {
            cache.start_frame();
            cache.end_frame();
        }
        assert_eq!(cache.pooled(), 0);
    }

    #[test]
    fn oversized_request_fails() {
        let mut gpu = FakeGpu;
        let mut cache = RenderTargetCache::new();
        let result = cache.acquire(&mut gpu, 10_000, 64, TargetConfig::default());
        assert!(matches!(
            result,
            Err(BackendError::TargetAllocation { .. })
        ));
    }
}
