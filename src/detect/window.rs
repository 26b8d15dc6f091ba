//! Sliding window of the most recent data points (the "shingle" scored by
//! the forest).

use std::collections::VecDeque;

use super::{DataPoint, DetectError};

#[derive(Debug, Clone)]
pub struct SlidingWindow {
    size: usize,
    dimensions: Option<usize>,
    points: VecDeque<DataPoint>,
}

impl SlidingWindow {
    pub fn new(size: usize) -> Result<Self, DetectError> {
        if size == 0 {
            return Err(DetectError::InvalidConfig(
                "sliding window size must be positive".to_string(),
            ));
        }
        Ok(Self {
            size,
            dimensions: None,
            points: VecDeque::with_capacity(size),
        })
    }

    /// Pin the expected vector length, e.g. from a restored model.
    pub fn with_dimensions(mut self, dimensions: usize) -> Self {
        self.dimensions = Some(dimensions);
        self
    }

    pub fn size(&self) -> usize {
        self.size
    }

    /// Per-point vector length, fixed by the first point seen.
    pub fn dimensions(&self) -> Option<usize> {
        self.dimensions
    }

    pub fn len(&self) -> usize {
        self.points.len()
    }

    pub fn is_empty(&self) -> bool {
        self.points.is_empty()
    }

    pub fn is_full(&self) -> bool {
        self.points.len() >= self.size
    }

    /// Append a point, evicting the oldest one when the window is full.
    pub fn push(&mut self, point: DataPoint) -> Result<Option<DataPoint>, DetectError> {
        if point.values.iter().any(|v| !v.is_finite()) {
            return Err(DetectError::NonFinite(point.timestamp));
        }
        let got = point.values.len();
        match self.dimensions {
            Some(expected) if expected != got => {
                return Err(DetectError::DimensionMismatch { expected, got });
            }
            None if got == 0 => {
                return Err(DetectError::DimensionMismatch { expected: 1, got });
            }
            None => self.dimensions = Some(got),
            _ => {}
        }

        let evicted = if self.is_full() {
            self.points.pop_front()
        } else {
            None
        };
        self.points.push_back(point);
        Ok(evicted)
    }

    /// Points oldest-first.
    pub fn points(&self) -> impl Iterator<Item = &DataPoint> + '_ {
        self.points.iter()
    }

    /// Window contents flattened oldest-first into one vector.
    pub fn flatten(&self) -> Vec<f64> {
        self.points
            .iter()
            .flat_map(|p| p.values.iter().copied())
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn point(ts: &str, up: f64, dn: f64) -> DataPoint {
        DataPoint::new(ts, vec![up, dn])
    }

    #[test]
    fn test_fills_then_evicts_oldest() {
        let mut w = SlidingWindow::new(2).unwrap();
        assert_eq!(w.push(point("1", 1.0, 2.0)).unwrap(), None);
        assert!(!w.is_full());
        assert_eq!(w.push(point("2", 3.0, 4.0)).unwrap(), None);
        assert!(w.is_full());

        let evicted = w.push(point("3", 5.0, 6.0)).unwrap();
        assert_eq!(evicted.map(|p| p.timestamp), Some("1".to_string()));
        assert_eq!(w.len(), 2);
        assert_eq!(w.flatten(), vec![3.0, 4.0, 5.0, 6.0]);
        assert_eq!(w.points().last().map(|p| p.timestamp.as_str()), Some("3"));
    }

    #[test]
    fn test_rejects_non_finite_values() {
        let mut w = SlidingWindow::new(2).unwrap();
        assert_eq!(
            w.push(point("1", f64::INFINITY, 1.0)),
            Err(DetectError::NonFinite("1".to_string()))
        );
        assert_eq!(
            w.push(point("2", 1.0, f64::NAN)),
            Err(DetectError::NonFinite("2".to_string()))
        );
        assert!(w.is_empty());
        assert_eq!(w.dimensions(), None);
    }

    #[test]
    fn test_rejects_points_of_another_dimension() {
        let mut w = SlidingWindow::new(3).unwrap();
        w.push(point("1", 1.0, 2.0)).unwrap();
        assert_eq!(
            w.push(DataPoint::new("2", vec![1.0])),
            Err(DetectError::DimensionMismatch { expected: 2, got: 1 })
        );
    }

    #[test]
    fn test_pinned_dimensions_apply_to_first_point() {
        let mut w = SlidingWindow::new(3).unwrap().with_dimensions(3);
        assert!(w.push(point("1", 1.0, 2.0)).is_err());
    }
}
