//! Tick clock and client-side time synchronization.
//!
//! Both sides count ticks as `floor(elapsed_ms / tick_duration_ms)`. The
//! server's elapsed time is authoritative; the client estimates it from a
//! ping / pong / result exchange and runs slightly ahead (half RTT plus a
//! headroom) so its input for a tick reaches the server before that tick is
//! simulated.

use std::collections::VecDeque;
use std::ops::Range;

use kestrel_net::SyncResult;

use crate::error::SyncError;

/// Guards `floor` against `n * d / d` landing just below `n`.
const TICK_EPSILON: f64 = 1e-9;

/// Upper bound on fixed steps run for one frame delta.
pub const MAX_STEPS_PER_UPDATE: u64 = 10;

/// Converts accumulated milliseconds into a monotonic tick counter.
#[derive(Debug, Clone)]
pub struct TickClock {
    tick_duration_ms: f64,
    elapsed_ms: f64,
}

impl TickClock {
    /// Creates a clock at time zero.
    pub fn new(tick_duration_ms: f64) -> Result<Self, SyncError> {
        validate_tick_duration(tick_duration_ms)?;
        Ok(Self {
            tick_duration_ms,
            elapsed_ms: 0.0,
        })
    }

    /// The current tick.
    pub fn tick(&self) -> u64 {
        self.tick_at(self.elapsed_ms)
    }

    /// The tick `elapsed_ms` falls into.
    pub fn tick_at(&self, elapsed_ms: f64) -> u64 {
        (elapsed_ms / self.tick_duration_ms + TICK_EPSILON)
            .floor()
            .max(0.0) as u64
    }

    /// Accumulated time in milliseconds.
    pub fn elapsed_ms(&self) -> f64 {
        self.elapsed_ms
    }

    /// Duration of one tick in milliseconds.
    pub fn tick_duration_ms(&self) -> f64 {
        self.tick_duration_ms
    }

    /// Duration of one tick in seconds, the `dt` handed to gameplay systems.
    pub fn tick_seconds(&self) -> f64 {
        self.tick_duration_ms / 1000.0
    }

    /// Adds a frame delta and returns the ticks that were entered.
    ///
    /// Negative or non-finite deltas are ignored.
    pub fn advance(&mut self, delta_ms: f64) -> Range<u64> {
        let before = self.tick();
        if delta_ms.is_finite() && delta_ms > 0.0 {
            self.elapsed_ms += delta_ms;
        }
        before + 1..self.tick() + 1
    }

    /// Moves the clock to `elapsed_ms` without ever moving the tick back.
    ///
    /// If the new time lies in an earlier tick, the clock is clamped to the
    /// start of the current tick instead. Returns `true` if it was clamped.
    pub fn set_elapsed_ms(&mut self, elapsed_ms: f64) -> bool {
        if !elapsed_ms.is_finite() {
            return true;
        }
        let current = self.tick();
        if self.tick_at(elapsed_ms) < current {
            self.elapsed_ms = current as f64 * self.tick_duration_ms;
            true
        } else {
            self.elapsed_ms = elapsed_ms.max(0.0);
            false
        }
    }

    /// Changes the tick duration, keeping the current tick.
    pub fn set_tick_duration_ms(&mut self, tick_duration_ms: f64) -> Result<(), SyncError> {
        validate_tick_duration(tick_duration_ms)?;
        if tick_duration_ms != self.tick_duration_ms {
            let tick = self.tick();
            let fraction = (self.elapsed_ms / self.tick_duration_ms - tick as f64).clamp(0.0, 0.5);
            self.tick_duration_ms = tick_duration_ms;
            self.elapsed_ms = (tick as f64 + fraction) * tick_duration_ms;
        }
        Ok(())
    }
}

fn validate_tick_duration(tick_duration_ms: f64) -> Result<(), SyncError> {
    if tick_duration_ms.is_finite() && tick_duration_ms > 0.0 {
        Ok(())
    } else {
        Err(SyncError::InvalidTickDuration(tick_duration_ms))
    }
}

/// Caps a range of entered ticks to the last [`MAX_STEPS_PER_UPDATE`].
pub fn cap_steps(ticks: Range<u64>) -> Range<u64> {
    let start = ticks.start.max(ticks.end.saturating_sub(MAX_STEPS_PER_UPDATE));
    if start > ticks.start {
        tracing::warn!(
            "Frame spans {} ticks, skipping {} of them",
            ticks.end - ticks.start,
            start - ticks.start
        );
    }
    start..ticks.end
}

// ---------------------------------------------------------------------------
// RttEstimator
// ---------------------------------------------------------------------------

/// Exponentially weighted moving average RTT estimator, in milliseconds.
#[derive(Debug, Clone)]
pub struct RttEstimator {
    samples: VecDeque<f64>,
    max_samples: usize,
    ewma_ms: Option<f64>,
    alpha: f64,
}

impl Default for RttEstimator {
    fn default() -> Self {
        Self {
            samples: VecDeque::new(),
            max_samples: 16,
            ewma_ms: None,
            alpha: 0.125,
        }
    }
}

impl RttEstimator {
    /// Record a new RTT sample and update the EWMA.
    pub fn record_sample(&mut self, rtt_ms: f64) {
        let rtt_ms = rtt_ms.max(0.0);
        self.samples.push_back(rtt_ms);
        if self.samples.len() > self.max_samples {
            self.samples.pop_front();
        }
        self.ewma_ms = Some(match self.ewma_ms {
            Some(ewma) => self.alpha * rtt_ms + (1.0 - self.alpha) * ewma,
            None => rtt_ms,
        });
    }

    /// Smoothed RTT, zero before the first sample.
    pub fn ewma_ms(&self) -> f64 {
        self.ewma_ms.unwrap_or(0.0)
    }

    /// Median of the retained samples, zero before the first sample.
    pub fn median_ms(&self) -> f64 {
        if self.samples.is_empty() {
            return 0.0;
        }
        let mut sorted: Vec<f64> = self.samples.iter().copied().collect();
        sorted.sort_by(f64::total_cmp);
        sorted[sorted.len() / 2]
    }

    /// Number of retained samples.
    pub fn sample_count(&self) -> usize {
        self.samples.len()
    }
}

// ---------------------------------------------------------------------------
// ClientClock
// ---------------------------------------------------------------------------

/// What a sync result did to the client clock.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ClockCorrection {
    /// Tick before the correction.
    pub previous_tick: u64,
    /// Tick after the correction.
    pub tick: u64,
    /// Round trip measured by this exchange.
    pub rtt_ms: f64,
    /// The estimate lay in an earlier tick and was clamped.
    pub clamped: bool,
}

/// The client's estimate of the server clock.
#[derive(Debug, Clone)]
pub struct ClientClock {
    clock: TickClock,
    rtt: RttEstimator,
    headroom_ms: f64,
    synced: bool,
}

impl ClientClock {
    /// Creates an unsynchronized clock.
    pub fn new(tick_duration_ms: f64, headroom_ms: f64) -> Result<Self, SyncError> {
        Ok(Self {
            clock: TickClock::new(tick_duration_ms)?,
            rtt: RttEstimator::default(),
            headroom_ms: headroom_ms.max(0.0),
            synced: false,
        })
    }

    /// Applies a `SERVER_SYNC_RESULT` received at local time `now_ms`.
    ///
    /// The estimated server time is `server_time + rtt / 2 + headroom`. A
    /// result carrying an invalid tick duration is ignored.
    pub fn on_sync_result(&mut self, result: &SyncResult, now_ms: f64) -> Option<ClockCorrection> {
        if let Err(e) = self.clock.set_tick_duration_ms(result.tick_duration_ms) {
            tracing::warn!("Ignoring sync result: {e}");
            return None;
        }
        let rtt_ms = (now_ms - result.client_time_ms).max(0.0);
        self.rtt.record_sample(rtt_ms);

        let previous_tick = self.clock.tick();
        let estimate = result.server_time_ms + rtt_ms / 2.0 + self.headroom_ms;
        let clamped = self.clock.set_elapsed_ms(estimate);
        self.synced = true;

        let correction = ClockCorrection {
            previous_tick,
            tick: self.clock.tick(),
            rtt_ms,
            clamped,
        };
        tracing::debug!(
            "Clock sync: rtt {rtt_ms:.1} ms, server tick {}, client tick {} -> {}{}",
            result.server_tick,
            correction.previous_tick,
            correction.tick,
            if clamped { " (clamped)" } else { "" }
        );
        Some(correction)
    }

    /// Advances the estimate by a frame delta. Does nothing before the first
    /// sync result.
    pub fn advance(&mut self, delta_ms: f64) -> Range<u64> {
        if !self.synced {
            let tick = self.clock.tick();
            return tick + 1..tick + 1;
        }
        self.clock.advance(delta_ms)
    }

    /// Adopts the tick duration announced by the server.
    pub fn set_tick_duration_ms(&mut self, tick_duration_ms: f64) -> Result<(), SyncError> {
        self.clock.set_tick_duration_ms(tick_duration_ms)
    }

    /// Whether at least one sync result has been applied.
    pub fn is_synced(&self) -> bool {
        self.synced
    }

    /// Current estimated tick.
    pub fn tick(&self) -> u64 {
        self.clock.tick()
    }

    /// The underlying tick clock.
    pub fn tick_clock(&self) -> &TickClock {
        &self.clock
    }

    /// RTT statistics.
    pub fn rtt(&self) -> &RttEstimator {
        &self.rtt
    }
}
