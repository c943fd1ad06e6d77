//! Segment construction: fixed windows and scene-cut boundaries.

use serde::{Deserialize, Serialize};

/// A half-open time slice of the source media, `start < end`.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Segment {
    pub start: f64,
    pub end: f64,
}

impl Segment {
    pub fn duration(&self) -> f64 {
        (self.end - self.start).max(0.0)
    }
}

/// Uniform windows of `win` seconds until the duration is exhausted.
pub fn fixed_segments(duration: f64, win: f64) -> Vec<Segment> {
    if duration <= 0.0 || win <= 0.0 {
        return Vec::new();
    }
    let mut segments = Vec::new();
    let mut cursor = 0.0;
    while cursor < duration {
        let end = (cursor + win).min(duration);
        segments.push(Segment { start: cursor, end });
        if (end - duration).abs() < f64::EPSILON {
            break;
        }
        cursor = end;
    }
    segments
}

/// Build segments from scene-cut timestamps.
///
/// Cuts outside `(0, total_duration)` are discarded; boundaries are sorted
/// and deduplicated; segments shorter than `min_duration` merge into the
/// previous one; the final segment is extended to `total_duration`.
pub fn segments_from_cuts(cuts: &[f64], min_duration: f64, total_duration: f64) -> Vec<Segment> {
    let mut inner: Vec<f64> = cuts
        .iter()
        .copied()
        .filter(|c| *c > 0.0 && *c < total_duration)
        .collect();
    inner.sort_by(|a, b| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal));
    inner.dedup();
    if inner.is_empty() {
        return Vec::new();
    }

    let mut boundaries = vec![0.0];
    boundaries.extend(inner);
    boundaries.push(total_duration);

    let mut segments: Vec<Segment> = Vec::new();
    for window in boundaries.windows(2) {
        let (start, end) = (window[0], window[1]);
        if end <= start {
            continue;
        }
        let segment = Segment { start, end };
        match segments.last_mut() {
            Some(previous) if segment.duration() < min_duration => {
                previous.end = segment.end;
            }
            _ => segments.push(segment),
        }
    }

    if let Some(last) = segments.last_mut() {
        if last.end < total_duration {
            last.end = total_duration;
        }
    }
    segments
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fixed_segments_exhaust_duration() {
        let segments = fixed_segments(70.0, 30.0);
        assert_eq!(segments.len(), 3);
        assert_eq!(segments[0], Segment { start: 0.0, end: 30.0 });
        assert_eq!(segments[2], Segment { start: 60.0, end: 70.0 });
    }

    #[test]
    fn test_fixed_segments_degenerate_inputs() {
        assert!(fixed_segments(0.0, 30.0).is_empty());
        assert!(fixed_segments(10.0, 0.0).is_empty());
    }

    #[test]
    fn test_fixed_segments_exact_multiple() {
        let segments = fixed_segments(60.0, 30.0);
        assert_eq!(segments.len(), 2);
        assert_eq!(segments[1].end, 60.0);
    }

    #[test]
    fn test_cuts_build_ordered_segments() {
        let segments = segments_from_cuts(&[40.0, 10.0], 5.0, 60.0);
        assert_eq!(
            segments,
            vec![
                Segment { start: 0.0, end: 10.0 },
                Segment { start: 10.0, end: 40.0 },
                Segment { start: 40.0, end: 60.0 },
            ]
        );
    }

    #[test]
    fn test_short_segments_merge_into_previous() {
        // 18..20 is below min_duration and merges backwards.
        let segments = segments_from_cuts(&[18.0, 20.0], 5.0, 60.0);
        assert_eq!(
            segments,
            vec![
                Segment { start: 0.0, end: 20.0 },
                Segment { start: 20.0, end: 60.0 },
            ]
        );
    }

    #[test]
    fn test_final_segment_reaches_total_duration() {
        let segments = segments_from_cuts(&[10.0], 2.0, 30.0);
        assert_eq!(segments.last().unwrap().end, 30.0);
    }

    #[test]
    fn test_out_of_range_cuts_discarded() {
        assert!(segments_from_cuts(&[-5.0, 0.0, 75.0], 5.0, 60.0).is_empty());
        let segments = segments_from_cuts(&[-5.0, 30.0, 75.0], 5.0, 60.0);
        assert_eq!(segments.len(), 2);
    }

    #[test]
    fn test_every_segment_is_forward() {
        let segments = segments_from_cuts(&[3.0, 3.0, 7.0, 30.0, 59.9], 5.0, 60.0);
        for segment in &segments {
            assert!(segment.end > segment.start);
        }
    }
}
