//! Frame and payload codec benchmarks

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use voltage_slmp::dword::PseudoDwordSplitter;
use voltage_slmp::protocol::{decode_response, payload, subcommand, RequestFrame, ResponseFrame};
use voltage_slmp::{Command, DeviceCode, DeviceRanges, DwordItem, FrameVersion, Target};

fn bench_request_encode(c: &mut Criterion) {
    let mut group = c.benchmark_group("request_encode");
    for &count in &[1usize, 64, 960] {
        let words: Vec<u16> = (0..count as u16).collect();
        group.throughput(Throughput::Elements(count as u64));
        group.bench_with_input(BenchmarkId::new("word_write_4e", count), &words, |b, words| {
            b.iter(|| {
                RequestFrame::new(
                    FrameVersion::E4,
                    Command::DeviceWrite,
                    subcommand::WORD_UNITS,
                    payload::word_write(DeviceCode::D, 0, black_box(words)),
                )
                .with_serial(1)
                .encode()
            })
        });
    }
    group.finish();
}

fn bench_response_decode(c: &mut Criterion) {
    let mut group = c.benchmark_group("response_decode");
    for &count in &[1usize, 64, 960] {
        let data: Vec<u8> = (0..count as u16).flat_map(|w| w.to_le_bytes()).collect();
        for version in [FrameVersion::E3, FrameVersion::E4] {
            let frame = ResponseFrame::success(version, 7, Target::local(), data.clone()).encode();
            group.throughput(Throughput::Bytes(frame.len() as u64));
            group.bench_with_input(BenchmarkId::new(version.to_string(), count), &frame, |b, frame| {
                b.iter(|| decode_response(black_box(frame), version))
            });
        }
    }
    group.finish();
}

fn bench_bit_packing(c: &mut Criterion) {
    let bits: Vec<bool> = (0..7168).map(|i| i % 3 == 0).collect();
    let packed = payload::pack_bits_nibble(&bits);
    c.bench_function("pack_bits_nibble_7168", |b| b.iter(|| payload::pack_bits_nibble(black_box(&bits))));
    c.bench_function("unpack_bits_nibble_7168", |b| {
        b.iter(|| payload::unpack_bits_nibble(black_box(&packed), bits.len()))
    });
}

fn bench_dword_split(c: &mut Criterion) {
    let splitter = PseudoDwordSplitter::new(DeviceRanges::default());
    let items: Vec<DwordItem> = (0..480u32)
        .map(|i| DwordItem::new(DeviceCode::D, i * 2, i.wrapping_mul(0x0101_0101)))
        .collect();
    c.bench_function("dword_split_480", |b| b.iter(|| splitter.split(black_box(&items))));
}

criterion_group!(
    benches,
    bench_request_encode,
    bench_response_decode,
    bench_bit_packing,
    bench_dword_split
);
criterion_main!(benches);
