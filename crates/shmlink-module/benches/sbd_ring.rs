//! Ring throughput: one producer write plus one consumer read per
//! iteration, on a plain slot ring and on a chaining link-header ring.

use std::sync::Arc;

use criterion::{black_box, criterion_group, criterion_main, BatchSize, Criterion, Throughput};

use shmlink_core::config::ChannelSpec;
use shmlink_core::wire::LinkHeader;
use shmlink_module::layout::{SbdLayout, MIN_REGION_SIZE};
use shmlink_module::region::SharedRegion;
use shmlink_module::sbd::{RingAttrs, SbdRing};

fn ring(spec: ChannelSpec, attrs: RingAttrs) -> (SbdRing, SbdRing) {
    let size = MIN_REGION_SIZE + (4 << 20);
    let region = Arc::new(SharedRegion::anonymous(size).expect("mmap"));
    let layout = SbdLayout::plan(&[spec], size).expect("plan");
    layout.publish(&region).expect("publish");
    let [ul, _] = layout.rings[0];
    // Producer and consumer views of the same UL ring.
    (
        SbdRing::new(region.clone(), ul, attrs).expect("ring"),
        SbdRing::new(region, ul, attrs).expect("ring"),
    )
}

fn bench_tx_rx(c: &mut Criterion) {
    let mut group = c.benchmark_group("sbd_ring");

    for &len in &[64usize, 1500] {
        let (tx, rx) = ring(ChannelSpec::raw(30, 256, 2048), RingAttrs::default());
        let payload = vec![0x5Au8; len];
        group.throughput(Throughput::Bytes(len as u64));
        group.bench_function(format!("raw_{}", len), |b| {
            b.iter(|| {
                tx.tx(0, black_box(&payload)).expect("tx");
                black_box(rx.rx().expect("rx"));
            })
        });
    }

    let attrs = RingAttrs { lnk_hdr: true, ..Default::default() };
    let (tx, rx) = ring(ChannelSpec::fmt(235, 256, 2048), attrs);
    let body = vec![0x7Eu8; 5996];
    let mut frame = LinkHeader::for_payload(235, body.len()).expect("header").encode().to_vec();
    frame.extend_from_slice(&body);
    group.throughput(Throughput::Bytes(frame.len() as u64));
    group.bench_function("chained_6000", |b| {
        b.iter_batched(
            || frame.clone(),
            |f| {
                tx.tx(0, &f).expect("tx");
                while let Some(slot) = rx.rx().expect("rx") {
                    black_box(slot);
                }
            },
            BatchSize::SmallInput,
        )
    });

    group.finish();
}

criterion_group!(benches, bench_tx_rx);
criterion_main!(benches);
