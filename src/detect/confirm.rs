//! Two-phase anomaly confirmation.
//!
//! A score at or above the threshold does not raise an anomaly on its own.
//! It opens a confirmation window of `size` cycles; when the window fills,
//! the share of over-threshold cycles inside it is reported and the machine
//! goes back to waiting.

use std::collections::VecDeque;

use super::{DetectError, Verdict};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Label {
    Anomaly,
    Normal,
}

/// Fixed-capacity FIFO of labelled cycles.
///
/// The machine clears it every time it fills, so a push past capacity is a
/// protocol violation rather than an eviction.
#[derive(Debug, Clone)]
pub struct ConfirmationWindow {
    capacity: usize,
    entries: VecDeque<(String, Label)>,
}

impl ConfirmationWindow {
    pub fn new(capacity: usize) -> Result<Self, DetectError> {
        if capacity == 0 {
            return Err(DetectError::InvalidConfig(
                "confirmation window size must be positive".to_string(),
            ));
        }
        Ok(Self {
            capacity,
            entries: VecDeque::with_capacity(capacity),
        })
    }

    pub fn push(&mut self, timestamp: impl Into<String>, label: Label) -> Result<(), DetectError> {
        if self.entries.len() >= self.capacity {
            return Err(DetectError::WindowOverflow {
                capacity: self.capacity,
            });
        }
        self.entries.push_back((timestamp.into(), label));
        Ok(())
    }

    pub fn is_full(&self) -> bool {
        self.entries.len() >= self.capacity
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }

    /// `[first timestamp, last timestamp, anomaly share]`, the share rounded
    /// to three decimals and taken over the full window size.
    pub fn summarize(&self) -> Result<(String, String, f64), DetectError> {
        let (start, _) = self
            .entries
            .front()
            .ok_or(DetectError::Empty("confirmation window"))?;
        let (end, _) = self
            .entries
            .back()
            .ok_or(DetectError::Empty("confirmation window"))?;
        let anomalies = self
            .entries
            .iter()
            .filter(|(_, label)| *label == Label::Anomaly)
            .count();
        let share = anomalies as f64 / self.capacity as f64;
        Ok((start.clone(), end.clone(), (share * 1000.0).round() / 1000.0))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConfirmState {
    Inactive,
    Active,
}

#[derive(Debug, Clone)]
pub struct ConfirmationMachine {
    state: ConfirmState,
    window: ConfirmationWindow,
}

impl ConfirmationMachine {
    pub fn new(window_size: usize) -> Result<Self, DetectError> {
        Ok(Self {
            state: ConfirmState::Inactive,
            window: ConfirmationWindow::new(window_size)?,
        })
    }

    pub fn state(&self) -> ConfirmState {
        self.state
    }

    pub fn window(&self) -> &ConfirmationWindow {
        &self.window
    }

    /// Feed one scored cycle and get its verdict.
    pub fn observe(
        &mut self,
        timestamp: &str,
        score: f64,
        threshold: f64,
    ) -> Result<Verdict, DetectError> {
        let label = if score >= threshold {
            Label::Anomaly
        } else {
            Label::Normal
        };

        match self.state {
            ConfirmState::Inactive => {
                if label == Label::Normal {
                    return Ok(Verdict::Normal);
                }
                self.window.push(timestamp, label)?;
                self.state = ConfirmState::Active;
            }
            ConfirmState::Active => {
                self.window.push(timestamp, label)?;
            }
        }

        if !self.window.is_full() {
            return Ok(Verdict::Observing);
        }

        let (window_start, window_end, percentage) = self.window.summarize()?;
        self.window.clear();
        self.state = ConfirmState::Inactive;
        Ok(Verdict::Anomaly {
            window_start,
            window_end,
            percentage,
        })
    }
}
