use serde::{Deserialize, Serialize};

/// Ordered `(year, value)` points, one per year with data.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct TimeSeries {
    pub points: Vec<(i32, f64)>,
}

impl TimeSeries {
    pub fn new(mut points: Vec<(i32, f64)>) -> Self {
        points.sort_by_key(|(year, _)| *year);
        points.dedup_by_key(|(year, _)| *year);
        Self { points }
    }

    pub fn len(&self) -> usize {
        self.points.len()
    }

    pub fn is_empty(&self) -> bool {
        self.points.is_empty()
    }

    pub fn years(&self) -> Vec<i32> {
        self.points.iter().map(|(y, _)| *y).collect()
    }

    pub fn values(&self) -> Vec<f64> {
        self.points.iter().map(|(_, v)| *v).collect()
    }

    pub fn value_for(&self, year: i32) -> Option<f64> {
        self.points
            .binary_search_by_key(&year, |(y, _)| *y)
            .ok()
            .map(|idx| self.points[idx].1)
    }

    /// Express every value as a ratio of the first year's value.
    ///
    /// A zero or non-finite first value leaves the series unchanged and returns `false`.
    pub fn normalize_to_first(&mut self) -> bool {
        let Some(&(_, first)) = self.points.first() else {
            return true;
        };
        if first == 0.0 || !first.is_finite() {
            return false;
        }
        for (_, v) in &mut self.points {
            *v /= first;
        }
        true
    }

    /// Replace every value with the running sum up to and including it.
    pub fn accumulate(&mut self) {
        let mut running = 0.0;
        for (_, v) in &mut self.points {
            running += *v;
            *v = running;
        }
    }
}

impl FromIterator<(i32, f64)> for TimeSeries {
    fn from_iter<T: IntoIterator<Item = (i32, f64)>>(iter: T) -> Self {
        TimeSeries::new(iter.into_iter().collect())
    }
}
