//! The status light.
//!
//! [`StatusSignal`] is the only writer to the illumination output. It shows
//! one [`Pattern`] at a time; animated patterns run on their own tokio task
//! so the provisioning pipeline can block on a multi-minute `dd` while the
//! light keeps breathing.
//!
//! Switching patterns is a hand-off: the running animation is cancelled and
//! awaited before the new level is written, so two patterns never write to
//! the output at the same time and nothing from the old pattern is written
//! after [`StatusSignal::set`] returns.

mod output;

#[cfg(test)]
pub(crate) use output::recording::RecordingLight;
pub use output::{Illumination, NullOutput, SysfsPwm};

use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio::time::{self, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// A named light behavior.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Pattern {
    Off,
    /// Ramps 0 -> 100 -> 0 until replaced.
    Breathing,
    /// Full/zero at a fixed short period for up to the given duration.
    FastBlink(Duration),
    /// Held at the given level until replaced.
    Solid(u8),
    /// Off/on the given number of times, then held on. Not interruptible.
    FlashN(u32),
}

impl Pattern {
    /// Two quick blinks: nothing to provision.
    pub const NO_DEVICE: Pattern = Pattern::FastBlink(Duration::from_millis(800));
    /// The burst shown when a run fails, before the light is left on.
    pub const FAILURE_BURST: Pattern = Pattern::FastBlink(Duration::from_secs(4));

    fn is_animated(&self) -> bool {
        matches!(
            self,
            Pattern::Breathing | Pattern::FastBlink(_) | Pattern::FlashN(_)
        )
    }
}

impl fmt::Display for Pattern {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Pattern::Off => write!(f, "off"),
            Pattern::Breathing => write!(f, "breathing"),
            Pattern::FastBlink(d) => write!(f, "fast-blink({}ms)", d.as_millis()),
            Pattern::Solid(level) => write!(f, "solid({level})"),
            Pattern::FlashN(n) => write!(f, "flash({n})"),
        }
    }
}

/// Step sizes and delays for the animated patterns.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct SignalTiming {
    pub breathing_step: u8,
    pub breathing_delay: Duration,
    /// Time spent on, and then off, per fast blink.
    pub blink_half_period: Duration,
    /// Time spent off, and then on, per flash.
    pub flash_half_period: Duration,
}

impl Default for SignalTiming {
    fn default() -> Self {
        Self {
            breathing_step: 5,
            breathing_delay: Duration::from_millis(50),
            blink_half_period: Duration::from_millis(200),
            flash_half_period: Duration::from_millis(300),
        }
    }
}

struct Animation {
    pattern: Pattern,
    cancel: CancellationToken,
    done: CancellationToken,
    handle: JoinHandle<()>,
}

struct Inner {
    output: Arc<dyn Illumination>,
    timing: SignalTiming,
    current: Mutex<Option<Animation>>,
    closed: AtomicBool,
}

/// Owner of the status light. Cheap to clone; clones share the same light.
#[derive(Clone)]
pub struct StatusSignal {
    inner: Arc<Inner>,
}

impl StatusSignal {
    pub fn new(output: Arc<dyn Illumination>) -> Self {
        Self::with_timing(output, SignalTiming::default())
    }

    pub fn with_timing(output: Arc<dyn Illumination>, timing: SignalTiming) -> Self {
        Self {
            inner: Arc::new(Inner {
                output,
                timing,
                current: Mutex::new(None),
                closed: AtomicBool::new(false),
            }),
        }
    }

    /// Checks once that the output accepts writes, leaving the light off.
    pub fn self_test(&self) -> Result<(), crate::error::SignalError> {
        self.inner.output.set_level(0)
    }

    /// Replaces the current pattern.
    ///
    /// Returns once the previous animation has stopped and the new pattern
    /// has taken over. A running [`Pattern::FlashN`] is allowed to finish first.
    pub async fn set(&self, pattern: Pattern) {
        self.start(pattern).await;
    }

    /// Shows a finite pattern and waits for it to finish.
    ///
    /// For patterns that never finish on their own this behaves like [`set`](Self::set).
    pub async fn play(&self, pattern: Pattern) {
        if let Some(done) = self.start(pattern).await {
            if matches!(pattern, Pattern::FastBlink(_) | Pattern::FlashN(_)) {
                done.cancelled().await;
            }
        }
    }

    /// Stops any animation while leaving the last written level in place.
    pub async fn halt(&self) {
        let mut current = self.inner.current.lock().await;
        Self::stop_locked(&mut current).await;
    }

    /// Stops animating, turns the light off and releases the output.
    /// Later calls to [`set`](Self::set) are ignored.
    pub async fn shutdown(&self) {
        let mut current = self.inner.current.lock().await;
        if self.inner.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        Self::stop_locked(&mut current).await;
        if let Err(e) = self.inner.output.release() {
            warn!("Failed to release status light: {e}");
        }
        debug!("Status light released");
    }

    /// Whether an animation task is currently alive.
    pub async fn is_animating(&self) -> bool {
        self.inner
            .current
            .lock()
            .await
            .as_ref()
            .is_some_and(|anim| !anim.handle.is_finished())
    }

    async fn start(&self, pattern: Pattern) -> Option<CancellationToken> {
        let mut current = self.inner.current.lock().await;
        if self.inner.closed.load(Ordering::SeqCst) {
            return None;
        }
        Self::stop_locked(&mut current).await;
        debug!("Status light -> {pattern}");

        match pattern {
            Pattern::Off => {
                write_level(self.inner.output.as_ref(), 0);
                None
            }
            Pattern::Solid(level) => {
                write_level(self.inner.output.as_ref(), level.min(100));
                None
            }
            _ => {
                debug_assert!(pattern.is_animated());
                let cancel = CancellationToken::new();
                let done = CancellationToken::new();
                let handle = tokio::spawn(animate(
                    pattern,
                    self.inner.output.clone(),
                    self.inner.timing,
                    cancel.clone(),
                    done.clone(),
                ));
                *current = Some(Animation {
                    pattern,
                    cancel,
                    done: done.clone(),
                    handle,
                });
                Some(done)
            }
        }
    }

    async fn stop_locked(current: &mut Option<Animation>) {
        if let Some(anim) = current.take() {
            anim.cancel.cancel();
            if let Err(e) = anim.handle.await {
                warn!("{} animation ended abnormally: {e}", anim.pattern);
            }
            debug_assert!(anim.done.is_cancelled());
        }
    }
}

fn write_level(output: &dyn Illumination, level: u8) {
    if let Err(e) = output.set_level(level) {
        warn!("Status light write failed: {e}");
    }
}

/// Writes levels for one animation, warning only on the first failure.
struct Writer {
    output: Arc<dyn Illumination>,
    warned: bool,
}

impl Writer {
    fn write(&mut self, level: u8) {
        if let Err(e) = self.output.set_level(level) {
            if !self.warned {
                warn!("Status light write failed: {e}");
                self.warned = true;
            }
        }
    }
}

/// Sleeps for `delay`; `false` if cancelled first.
async fn pause(cancel: &CancellationToken, delay: Duration) -> bool {
    tokio::select! {
        _ = cancel.cancelled() => false,
        _ = time::sleep(delay) => true,
    }
}

async fn animate(
    pattern: Pattern,
    output: Arc<dyn Illumination>,
    timing: SignalTiming,
    cancel: CancellationToken,
    done: CancellationToken,
) {
    let _done = done.drop_guard();
    let mut light = Writer {
        output,
        warned: false,
    };

    match pattern {
        Pattern::Breathing => {
            let step = usize::from(timing.breathing_step.clamp(1, 100));
            loop {
                let up = (0..=100u8).step_by(step);
                let down = (0..=100u8).rev().step_by(step);
                for level in up.chain(down) {
                    light.write(level);
                    if !pause(&cancel, timing.breathing_delay).await {
                        return;
                    }
                }
            }
        }
        Pattern::FastBlink(duration) => {
            let deadline = Instant::now() + duration;
            while Instant::now() < deadline {
                light.write(100);
                if !pause(&cancel, timing.blink_half_period).await {
                    return;
                }
                light.write(0);
                if !pause(&cancel, timing.blink_half_period).await {
                    return;
                }
            }
        }
        Pattern::FlashN(count) => {
            for _ in 0..count {
                light.write(0);
                time::sleep(timing.flash_half_period).await;
                light.write(100);
                time::sleep(timing.flash_half_period).await;
            }
            light.write(100);
        }
        Pattern::Off | Pattern::Solid(_) => {}
    }
}
