//! Rolling statistics per channel.
//!
//! Instantaneous channels keep a bounded FIFO window for mean/min/max/median
//! plus an exponential moving average. The EMA does not look at the window,
//! so "rolling" and "mean" differ on the same series and both are published.
//! Device aggregates and diagnostics pass through their latest value only.

use std::collections::{HashMap, VecDeque};
use time::OffsetDateTime;

use crate::models::{Channel, ChannelId, ChannelKind, ChannelStats, WindowSummary};

/// Fixed-capacity FIFO of the most recent raw values. `len() <= capacity` always.
#[derive(Debug, Clone)]
pub struct RollingWindow {
    capacity: usize,
    samples: VecDeque<f64>,
}

impl RollingWindow {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            capacity,
            samples: VecDeque::with_capacity(capacity),
        }
    }

    pub fn push(&mut self, value: f64) {
        if self.samples.len() == self.capacity {
            self.samples.pop_front();
        }
        self.samples.push_back(value);
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn values(&self) -> impl Iterator<Item = f64> + '_ {
        self.samples.iter().copied()
    }

    pub fn summary(&self) -> Option<WindowSummary> {
        if self.samples.is_empty() {
            return None;
        }

        let count = self.samples.len();
        let mean = self.samples.iter().sum::<f64>() / count as f64;
        let min = self.samples.iter().copied().fold(f64::INFINITY, f64::min);
        let max = self.samples.iter().copied().fold(f64::NEG_INFINITY, f64::max);

        let mut sorted: Vec<f64> = self.samples.iter().copied().collect();
        sorted.sort_by(f64::total_cmp);
        let mid = count / 2;
        let median = if count % 2 == 0 {
            (sorted[mid - 1] + sorted[mid]) / 2.0
        } else {
            sorted[mid]
        };

        Some(WindowSummary {
            mean,
            min,
            max,
            median,
            samples: count,
        })
    }
}

#[derive(Debug, Clone)]
struct ChannelState {
    window: RollingWindow,
    rolling: Option<f64>,
    current: Option<ChannelStats>,
}

/// Cross-cycle numeric state for every channel of one session.
#[derive(Debug, Clone)]
pub struct StatisticsEngine {
    window_size: usize,
    smoothing_factor: f64,
    channels: HashMap<ChannelId, ChannelState>,
}

impl StatisticsEngine {
    pub fn new(window_size: usize, smoothing_factor: f64) -> Self {
        Self {
            window_size,
            smoothing_factor,
            channels: HashMap::new(),
        }
    }

    /// Feed one raw value and return the channel's refreshed output.
    pub fn update(
        &mut self,
        channel: &Channel,
        raw_value: f64,
        timestamp: OffsetDateTime,
    ) -> ChannelStats {
        let window_size = self.window_size;
        let alpha = self.smoothing_factor;
        let state = self
            .channels
            .entry(channel.id.clone())
            .or_insert_with(|| ChannelState {
                window: RollingWindow::new(window_size),
                rolling: None,
                current: None,
            });

        let stats = match channel.kind {
            ChannelKind::Instantaneous => {
                state.window.push(raw_value);
                let rolling = match state.rolling {
                    Some(previous) => alpha * raw_value + (1.0 - alpha) * previous,
                    None => raw_value,
                };
                state.rolling = Some(rolling);
                ChannelStats {
                    latest: raw_value,
                    updated_at: timestamp,
                    window: state.window.summary(),
                    rolling: Some(rolling),
                }
            }
            ChannelKind::StatisticalDerivative | ChannelKind::Diagnostic => ChannelStats {
                latest: raw_value,
                updated_at: timestamp,
                window: None,
                rolling: None,
            },
        };

        state.current = Some(stats.clone());
        stats
    }

    /// Last output for a channel, if it has ever been updated.
    pub fn current(&self, channel_id: &str) -> Option<&ChannelStats> {
        self.channels.get(channel_id).and_then(|s| s.current.as_ref())
    }

    pub fn window(&self, channel_id: &str) -> Option<&RollingWindow> {
        self.channels.get(channel_id).map(|s| &s.window)
    }
}
