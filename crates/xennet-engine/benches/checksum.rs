//! Checksum and loopback round-trip benchmarks.

use std::hint::black_box;
use std::sync::Arc;

use criterion::{criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};

use xennet_core::frame::{RxFrame, SendStatus, TxFrame};
use xennet_core::shim::AdapterShim;
use xennet_core::state::LinkState;
use xennet_core::config::NetfrontConfig;
use xennet_core::wire::PAGE_SIZE;
use xennet_engine::checksum::{ones_complement_checksum, transport_checksum_ipv4, ChecksumAccumulator, IPPROTO_TCP, TCP_CSUM_OFFSET};
use xennet_engine::Netfront;
use xennet_module::loopback::RxDelivery;
use xennet_module::{LocalGrantTable, LoopbackBackend, ParkNotifier};

fn data(n: usize) -> Vec<u8> {
    (0..n).map(|i| (i * 31 + 7) as u8).collect()
}

fn bench_checksum(c: &mut Criterion) {
    let mut group = c.benchmark_group("checksum");
    for size in [64usize, 1500, 9000] {
        let buf = data(size);
        group.throughput(Throughput::Bytes(size as u64));
        group.bench_with_input(BenchmarkId::new("contiguous", size), &buf, |b, buf| {
            b.iter(|| ones_complement_checksum(black_box(buf)))
        });
        group.bench_with_input(BenchmarkId::new("accumulator_odd_chunks", size), &buf, |b, buf| {
            b.iter(|| {
                let mut acc = ChecksumAccumulator::new(0);
                for chunk in black_box(buf).chunks(333) {
                    acc.add(chunk);
                }
                acc.finish()
            })
        });
        group.bench_with_input(BenchmarkId::new("tcp_ipv4", size), &buf, |b, buf| {
            b.iter(|| transport_checksum_ipv4(&[10, 0, 0, 1], &[10, 0, 0, 2], IPPROTO_TCP, black_box(buf), TCP_CSUM_OFFSET))
        });
    }
    group.finish();
}

/// Holds RX frames until the bench returns them.
#[derive(Default)]
struct Sink {
    rx: std::sync::Mutex<Vec<RxFrame>>,
}

impl AdapterShim for Sink {
    fn on_frame_received(&self, frame: RxFrame) {
        self.rx.lock().unwrap().push(frame);
    }
    fn on_frame_sent(&self, _frame: TxFrame, _status: SendStatus) {}
    fn on_link_state_changed(&self, _state: LinkState) {}
}

fn bench_loopback(c: &mut Criterion) {
    let grants = Arc::new(LocalGrantTable::default());
    let shim = Arc::new(Sink::default());
    let to_back = Arc::new(ParkNotifier::new());
    let nf = Netfront::new(NetfrontConfig::new(), grants.clone(), to_back, shim.clone()).unwrap();
    let (tx_ref, rx_ref) = nf.connect().unwrap();
    let mut backend = LoopbackBackend::attach(grants, tx_ref, rx_ref, Arc::new(ParkNotifier::new())).unwrap();

    let mut frame = data(1514);
    frame[..6].copy_from_slice(&[0xff; 6]);
    frame[12..14].copy_from_slice(&0x88b5u16.to_be_bytes());

    let mut group = c.benchmark_group("loopback");
    group.throughput(Throughput::Bytes(frame.len() as u64));
    group.bench_function("tx_1514", |b| {
        b.iter(|| {
            nf.send(TxFrame::from_bytes(&frame, PAGE_SIZE).unwrap()).unwrap();
            backend.process_tx().unwrap();
            nf.handle_event();
        })
    });
    group.bench_function("rx_1514", |b| {
        b.iter(|| {
            backend.deliver(&frame, &RxDelivery::default()).unwrap();
            nf.handle_event();
            for f in std::mem::take(&mut *shim.rx.lock().unwrap()) {
                nf.return_rx_buffer(f);
            }
        })
    });
    group.finish();
}

criterion_group!(benches, bench_checksum, bench_loopback);
criterion_main!(benches);
