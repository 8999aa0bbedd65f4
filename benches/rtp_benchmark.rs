use criterion::{black_box, criterion_group, criterion_main, Criterion, Throughput};
use rtsp_relay::flv::FlvEncoder;
use rtsp_relay::rtp::{packet_channel, RtpInfo, PACKET_CHANNEL_CAPACITY};

fn create_test_rtp_packet() -> Vec<u8> {
    let mut packet = vec![0u8; 1400];
    packet[0] = 0x80; // Version 2
    packet[1] = 0x60; // PT=96
    packet[2..4].copy_from_slice(&12345u16.to_be_bytes());
    packet[4..8].copy_from_slice(&987654321u32.to_be_bytes());
    packet[8..12].copy_from_slice(&0xDEADBEEFu32.to_be_bytes());
    packet
}

fn benchmark_rtp_parsing(c: &mut Criterion) {
    let packet = create_test_rtp_packet();

    c.bench_function("rtp_parse", |b| {
        b.iter(|| {
            black_box(RtpInfo::parse(black_box(&packet)));
        });
    });
}

fn benchmark_flv_tags(c: &mut Criterion) {
    let packet = RtpInfo::parse(&create_test_rtp_packet()).expect("valid packet");
    let mut encoder = FlvEncoder::new();

    let mut group = c.benchmark_group("flv");
    group.throughput(Throughput::Bytes(packet.payload.len() as u64));
    group.bench_function("video_tag", |b| {
        b.iter(|| {
            black_box(encoder.encode(black_box(&packet)));
        });
    });
    group.finish();
}

fn benchmark_packet_channel(c: &mut Criterion) {
    let packet = RtpInfo::parse(&create_test_rtp_packet()).expect("valid packet");

    let mut group = c.benchmark_group("packet_channel");
    group.throughput(Throughput::Elements(PACKET_CHANNEL_CAPACITY as u64 * 2));
    group.bench_function("push_past_capacity", |b| {
        b.iter(|| {
            let (tx, rx) = packet_channel();
            for _ in 0..PACKET_CHANNEL_CAPACITY * 2 {
                black_box(tx.push(packet.clone()));
            }
            drop(rx);
        });
    });
    group.finish();
}

criterion_group!(
    benches,
    benchmark_rtp_parsing,
    benchmark_flv_tags,
    benchmark_packet_channel
);
criterion_main!(benches);
