//! Per-second uniform resampling.
//!
//! Devices batch several readings into one second without sub-second
//! ordering. Samples that share `(node, channel, second)` are spread over
//! an even grid centred in that second; singletons keep their timestamp.

use std::collections::HashMap;

use crate::model::{Sample, MAX_SUBSEC_NANOS, NANOS_PER_SEC};

/// A sample with its synthetic uniform-grid timestamp.
#[derive(Debug, Clone, PartialEq)]
pub struct ResampledSample {
    pub sample: Sample,
    pub resampled_ns: i64,
}

/// Resamples one flush worth of samples.
///
/// Groups are emitted in first-seen order; each group is ordered by its
/// original timestamp.
pub fn resample(samples: &[Sample]) -> Vec<ResampledSample> {
    let mut order: Vec<(u32, &str, i64)> = Vec::new();
    let mut groups: HashMap<(u32, &str, i64), Vec<&Sample>> = HashMap::new();

    for s in samples {
        let key = (s.node_id, s.channel.as_str(), s.timestamp_ns.div_euclid(NANOS_PER_SEC));
        groups
            .entry(key)
            .or_insert_with(|| {
                order.push(key);
                Vec::new()
            })
            .push(s);
    }

    let mut out = Vec::with_capacity(samples.len());
    for key in order {
        let Some(mut rows) = groups.remove(&key) else {
            continue;
        };

        if rows.len() == 1 {
            let s = rows[0];
            out.push(ResampledSample {
                sample: s.clone(),
                resampled_ns: s.timestamp_ns,
            });
            continue;
        }

        rows.sort_by_key(|s| s.timestamp_ns);
        let max_hz = rows
            .iter()
            .filter_map(|s| s.sample_rate_hz)
            .filter(|hz| *hz > 0.0)
            .fold(None, |acc: Option<f64>, hz| Some(acc.map_or(hz, |a| a.max(hz))));

        let sec_start = key.2 * NANOS_PER_SEC;
        let step = grid_step(rows.len(), max_hz);
        let used_span = step * (rows.len() as i64 - 1);
        let start = sec_start + (MAX_SUBSEC_NANOS - used_span) / 2;

        for (idx, s) in rows.into_iter().enumerate() {
            out.push(ResampledSample {
                sample: s.clone(),
                resampled_ns: start + idx as i64 * step,
            });
        }
    }

    out
}

/// Grid spacing for a group of `n > 1` samples.
///
/// Uses the reported rate when the whole group fits inside one second at
/// that rate, otherwise divides the second evenly.
fn grid_step(n: usize, max_hz: Option<f64>) -> i64 {
    let gaps = (n as i64 - 1).max(1);
    let auto = (MAX_SUBSEC_NANOS / gaps).max(1);

    let from_rate = max_hz
        .map(|hz| (NANOS_PER_SEC as f64 / hz).round())
        .filter(|step| step.is_finite() && *step < i64::MAX as f64)
        .map(|step| (step as i64).max(1));

    match from_rate {
        Some(step) if step.checked_mul(gaps).is_some_and(|span| span <= MAX_SUBSEC_NANOS) => step,
        _ => auto,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample(channel: &str, ts: i64, hz: Option<f64>) -> Sample {
        Sample {
            node_id: 7,
            channel: channel.to_string(),
            value: ts as f64,
            timestamp_ns: ts,
            source: "test".to_string(),
            tick: None,
            sample_rate_hz: hz,
        }
    }

    const SEC: i64 = 1_700_000_000 * NANOS_PER_SEC;

    #[test]
    fn test_singleton_passes_through() {
        let input = vec![sample("ch1", SEC + 123, None)];
        let out = resample(&input);
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].resampled_ns, SEC + 123);
    }

    #[test]
    fn test_group_without_rate_spreads_over_second() {
        let input: Vec<Sample> = (0..4).map(|_| sample("ch1", SEC + 5, None)).collect();
        let out = resample(&input);
        let ts: Vec<i64> = out.iter().map(|r| r.resampled_ns).collect();
        // step = 999_999_999 / 3 = 333_333_333, used span 999_999_999, start offset 0.
        assert_eq!(ts, vec![SEC, SEC + 333_333_333, SEC + 666_666_666, SEC + 999_999_999]);
    }

    #[test]
    fn test_group_uses_consistent_rate_and_centres() {
        let input: Vec<Sample> = (0..4)
            .map(|i| sample("ch1", SEC + i, Some(8.0)))
            .collect();
        let out = resample(&input);
        let ts: Vec<i64> = out.iter().map(|r| r.resampled_ns).collect();
        // step 125ms, used span 375ms, centred: (999_999_999 - 375_000_000) / 2.
        let start = SEC + 312_499_999;
        assert_eq!(
            ts,
            vec![start, start + 125_000_000, start + 250_000_000, start + 375_000_000]
        );
    }

    #[test]
    fn test_rate_too_slow_for_group_falls_back() {
        // 1 Hz cannot fit 3 samples in a second.
        let input: Vec<Sample> = (0..3).map(|_| sample("ch1", SEC, Some(1.0))).collect();
        let out = resample(&input);
        let ts: Vec<i64> = out.iter().map(|r| r.resampled_ns).collect();
        assert_eq!(ts, vec![SEC, SEC + 499_999_999, SEC + 999_999_998]);
    }

    #[test]
    fn test_span_is_strictly_increasing_within_second() {
        for n in [2usize, 3, 7, 64, 1000] {
            let input: Vec<Sample> = (0..n)
                .map(|i| sample("ch1", SEC + (i as i64 % 5), Some(512.0)))
                .collect();
            let out = resample(&input);
            assert_eq!(out.len(), n);
            for pair in out.windows(2) {
                assert!(pair[0].resampled_ns < pair[1].resampled_ns, "n={n}");
            }
            for r in &out {
                assert!(r.resampled_ns >= SEC && r.resampled_ns < SEC + NANOS_PER_SEC);
            }
        }
    }

    #[test]
    fn test_groups_by_channel_and_second() {
        let input = vec![
            sample("ch1", SEC + 10, None),
            sample("ch2", SEC + 10, None),
            sample("ch1", SEC + NANOS_PER_SEC + 1, None),
            sample("ch1", SEC + 20, None),
        ];
        let out = resample(&input);
        assert_eq!(out.len(), 4);

        // ch1 first second is a pair; ch2 and the next second are singletons.
        let ch1_first: Vec<i64> = out
            .iter()
            .filter(|r| r.sample.channel == "ch1" && r.resampled_ns < SEC + NANOS_PER_SEC)
            .map(|r| r.resampled_ns)
            .collect();
        assert_eq!(ch1_first, vec![SEC, SEC + MAX_SUBSEC_NANOS]);
        assert!(out
            .iter()
            .any(|r| r.sample.channel == "ch2" && r.resampled_ns == SEC + 10));
        assert!(out.iter().any(|r| r.resampled_ns == SEC + NANOS_PER_SEC + 1));
    }

    #[test]
    fn test_group_sorted_by_original_time() {
        let input = vec![sample("ch1", SEC + 900, None), sample("ch1", SEC + 100, None)];
        let out = resample(&input);
        assert_eq!(out[0].sample.timestamp_ns, SEC + 100);
        assert_eq!(out[1].sample.timestamp_ns, SEC + 900);
    }
}
