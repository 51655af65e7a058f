//! Pitch/tempo effect lifecycle.
//!
//! The effect module is loaded at most once per [`EffectAdapter`]. Callers of
//! [`EffectAdapter::ensure_loaded`] share a single in-flight load; a failed
//! load is permanent and every track then plays in bypass mode.

mod stretch;

pub use stretch::{
    FftSize, FrameSource, PitchTempoUnit, StretchModule, PITCH_RANGE, TEMPO_RANGE,
};

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::OnceCell;

/// Errors that can occur while loading the effect module
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum EffectLoadError {
    #[error("Effect module unavailable: {0}")]
    Unavailable(String),
    #[error("Effect module load task failed: {0}")]
    Task(String),
}

/// Lifecycle of the shared effect module
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EffectStatus {
    NotLoaded,
    Loading,
    Ready,
    LoadFailed,
}

/// Produces the shared effect module. Runs on a blocking thread.
pub trait ModuleLoader: Send + Sync + 'static {
    fn load(&self) -> Result<StretchModule, EffectLoadError>;
}

/// Loads the phase vocoder at a fixed FFT size
#[derive(Debug, Clone, Copy, Default)]
pub struct VocoderLoader {
    pub fft_size: FftSize,
}

impl ModuleLoader for VocoderLoader {
    fn load(&self) -> Result<StretchModule, EffectLoadError> {
        Ok(StretchModule::new(self.fft_size))
    }
}

struct AdapterInner {
    loader: Arc<dyn ModuleLoader>,
    module: OnceCell<Result<Arc<StretchModule>, EffectLoadError>>,
    started: AtomicBool,
}

/// Readiness gate for the effect module. Clones share the same module.
#[derive(Clone)]
pub struct EffectAdapter {
    inner: Arc<AdapterInner>,
}

impl std::fmt::Debug for EffectAdapter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EffectAdapter")
            .field("status", &self.status())
            .finish()
    }
}

impl EffectAdapter {
    pub fn new(loader: impl ModuleLoader) -> Self {
        Self {
            inner: Arc::new(AdapterInner {
                loader: Arc::new(loader),
                module: OnceCell::new(),
                started: AtomicBool::new(false),
            }),
        }
    }

    /// Adapter whose module loads the phase vocoder
    pub fn vocoder(fft_size: FftSize) -> Self {
        Self::new(VocoderLoader { fft_size })
    }

    /// Load the module if nobody has yet, and wait for the outcome.
    ///
    /// Concurrent callers await the same load. The result is final: a failed
    /// load is never retried. Must be called from within a tokio runtime.
    pub async fn ensure_loaded(&self) -> EffectStatus {
        self.inner.started.store(true, Ordering::Release);

        let result = self
            .inner
            .module
            .get_or_init(|| async {
                let loader = Arc::clone(&self.inner.loader);
                let outcome = match tokio::task::spawn_blocking(move || loader.load()).await {
                    Ok(result) => result.map(Arc::new),
                    Err(e) => Err(EffectLoadError::Task(e.to_string())),
                };
                match &outcome {
                    Ok(module) => {
                        tracing::info!(fft_size = module.fft_size(), "effect module ready")
                    }
                    Err(e) => tracing::warn!("effect module failed to load, using bypass: {e}"),
                }
                outcome
            })
            .await;

        match result {
            Ok(_) => EffectStatus::Ready,
            Err(_) => EffectStatus::LoadFailed,
        }
    }

    /// Current lifecycle state. Never blocks.
    pub fn status(&self) -> EffectStatus {
        match self.inner.module.get() {
            Some(Ok(_)) => EffectStatus::Ready,
            Some(Err(_)) => EffectStatus::LoadFailed,
            None if self.inner.started.load(Ordering::Acquire) => EffectStatus::Loading,
            None => EffectStatus::NotLoaded,
        }
    }

    /// The loaded module, if ready
    pub fn module(&self) -> Option<Arc<StretchModule>> {
        match self.inner.module.get() {
            Some(Ok(module)) => Some(Arc::clone(module)),
            _ => None,
        }
    }

    /// Why the module failed to load, if it did
    pub fn failure(&self) -> Option<EffectLoadError> {
        match self.inner.module.get() {
            Some(Err(e)) => Some(e.clone()),
            _ => None,
        }
    }

    /// Whether playback is permanently limited to bypass routing
    pub fn bypass_active(&self) -> bool {
        self.status() == EffectStatus::LoadFailed
    }

    /// Instantiate a unit for one track, if the module is ready
    pub fn instantiate(&self) -> Option<PitchTempoUnit> {
        self.inner.module.get()?.as_ref().ok().map(|m| m.instantiate())
    }
}
