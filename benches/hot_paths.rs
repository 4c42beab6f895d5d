use criterion::{black_box, criterion_group, criterion_main, Criterion};
use sensorbridge::model::{FieldValue, Point, Sample, NANOS_PER_SEC};
use sensorbridge::sink::influx::encode_lines;
use sensorbridge::stream::dedup::{TieBreakMode, TieBreaker};
use sensorbridge::stream::resample::resample;

const SEC: i64 = 1_700_000_000 * NANOS_PER_SEC;

/// One flush worth of 64 Hz samples for two channels over ten seconds,
/// delivered in same-second bursts.
fn burst_samples() -> Vec<Sample> {
    let mut samples = Vec::with_capacity(2 * 10 * 64);
    for second in 0..10 {
        for channel in ["ch1", "ch2"] {
            for i in 0..64 {
                samples.push(Sample {
                    node_id: 16904,
                    channel: channel.to_string(),
                    value: f64::from(i),
                    timestamp_ns: SEC + second * NANOS_PER_SEC + i64::from(i % 4),
                    source: "mscl_config_stream".to_string(),
                    tick: None,
                    sample_rate_hz: Some(64.0),
                });
            }
        }
    }
    samples
}

fn bench_resample(c: &mut Criterion) {
    let samples = burst_samples();

    c.bench_function("resample/1280_samples_64hz", |b| {
        b.iter(|| black_box(resample(black_box(&samples)).len()))
    });
}

fn bench_tie_break(c: &mut Criterion) {
    let samples = burst_samples();

    for (name, mode) in [
        ("tie_break/original_key", TieBreakMode::OriginalKey),
        ("tie_break/strict", TieBreakMode::Strict),
    ] {
        c.bench_function(name, |b| {
            b.iter(|| {
                let mut ties = TieBreaker::new(mode);
                let mut last = 0;
                for s in &samples {
                    last = ties.assign(s.node_id, &s.channel, black_box(s.timestamp_ns));
                }
                black_box(last)
            })
        });
    }
}

fn bench_line_protocol(c: &mut Criterion) {
    let points: Vec<Point> = burst_samples()
        .iter()
        .map(|s| {
            Point::new("mscl_sensors")
                .tag("node_id", s.node_id.to_string())
                .tag("channel", s.channel.as_str())
                .tag("source", s.source.as_str())
                .field("value", FieldValue::Float(s.value))
                .timestamp(s.timestamp_ns)
        })
        .collect();

    c.bench_function("influx/encode_1280_points", |b| {
        b.iter(|| black_box(encode_lines(black_box(&points)).len()))
    });
}

fn bench_suite(c: &mut Criterion) {
    bench_resample(c);
    bench_tie_break(c);
    bench_line_protocol(c);
}

criterion_group!(benches, bench_suite);
criterion_main!(benches);
