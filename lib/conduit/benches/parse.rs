#[macro_use]
extern crate criterion;

extern crate conduit;

use conduit::annotations::{RaStrip, RouterAnnotations};
use conduit::codec::{sections, Composed};
use conduit::message::{Content, Depth, RaPolicy};
use criterion::{black_box, Criterion};

fn router_message(body_size: usize) -> Vec<u8> {
    let mut ra = Composed::new();
    RouterAnnotations {
        flags: 1,
        ingress_router: Some("R1".to_string()),
        trace: vec!["R1".to_string(), "R2".to_string()],
        ..Default::default()
    }
    .emit(RaStrip::None, None, &mut ra);

    let mut message = ra.into_vec();

    let mut properties = Composed::new();
    properties.put_descriptor(sections::PROPERTIES);
    properties.start_list();
    properties.put_null();
    properties.put_null();
    properties.put_str("dest/bench");
    properties.end();
    message.extend_from_slice(properties.octets());

    let mut data = Composed::new();
    data.put_descriptor(sections::BODY_DATA);
    data.put_binary(&vec![0x5A; body_size]);
    message.extend_from_slice(data.octets());

    message
}

fn bench_receive_parse(c: &mut Criterion) {
    let octets = router_message(16 * 1024);

    c.bench_function("receive and parse 16k message", move |b| {
        b.iter(|| {
            let content = Content::new(RaPolicy::Required, 0);
            content.receive(&octets, true).unwrap();
            black_box(content.check_depth(Depth::Footer));
        })
    });
}

fn bench_receive_chunked(c: &mut Criterion) {
    let octets = router_message(16 * 1024);

    // Octets arriving in network-sized slivers exercise the resumable
    // cursor across buffer boundaries.
    c.bench_function("receive 16k message in 1k chunks", move |b| {
        b.iter(|| {
            let content = Content::new(RaPolicy::Required, 0);

            for chunk in octets.chunks(1024) {
                content.receive(chunk, false).unwrap();
            }

            content.set_receive_complete();
            black_box(content.check_depth(Depth::Footer));
        })
    });
}

fn bench_annotations_roundtrip(c: &mut Criterion) {
    let octets = router_message(64);

    c.bench_function("annotations parse and re-emit", move |b| {
        b.iter(|| {
            let content = Content::new(RaPolicy::Required, 0);
            content.receive(&octets, true).unwrap();
            content.check_depth(Depth::Properties);

            let ra = content.router_annotations().expect("Annotations must parse");
            let mut out = Composed::new();
            ra.emit(RaStrip::None, Some("R3"), &mut out);
            black_box(out.len());
        })
    });
}

criterion_group!(benches, bench_receive_parse, bench_receive_chunked, bench_annotations_roundtrip);
criterion_main!(benches);
