//! 绑定层性能基准测试
//!
//! 签名解析、JSON 值转换以及环回总线上的完整方法调用往返

use alljoyn_js::bus::{BusAttachment, LoopbackBus};
use alljoyn_js::config::BindingConfig;
use alljoyn_js::proxy::RemoteServiceProxy;
use alljoyn_js::registry::{Access, InterfaceDescriptor, ObjectDescriptor, ObjectFlags};
use alljoyn_js::signature::Signature;
use alljoyn_js::value::MsgValue;
use criterion::{criterion_group, criterion_main, BenchmarkId, Criterion};
use serde_json::json;
use std::cell::{Cell, RefCell};
use std::hint::black_box;
use std::rc::Rc;

const IFACE: &str = "org.alljoyn.alljoyn_test";
const PATH: &str = "/org/alljoyn/alljoyn_test";

// ============================================================================
// 签名与值
// ============================================================================

fn bench_signature_parse(c: &mut Criterion) {
    let mut group = c.benchmark_group("signature_parse");
    for sig in ["s", "a{sv}", "(isa{s(ii)})ay"] {
        group.bench_with_input(BenchmarkId::from_parameter(sig), sig, |b, sig| {
            b.iter(|| black_box(Signature::parse(sig)))
        });
    }
    group.finish();
}

fn bench_value_from_json(c: &mut Criterion) {
    let sig = Signature::parse("sua{sv}").unwrap();
    let args = vec![
        json!("lamp"),
        json!(42),
        json!({"brightness": 80, "color": "warm", "on": true}),
    ];
    c.bench_function("value_list_from_json", |b| {
        b.iter(|| black_box(MsgValue::list_from_json(black_box(&args), &sig)))
    });
}

// ============================================================================
// 方法调用往返
// ============================================================================

fn attachment() -> BusAttachment {
    let mut bus = BusAttachment::new(BindingConfig::default());
    bus.define_interface(
        InterfaceDescriptor::builder(IFACE)
            .method("my_ping", &["s"], &["s"])
            .property("int_val", "i", Access::ReadWrite)
            .build()
            .unwrap(),
    )
    .unwrap();
    bus.define_object(ObjectDescriptor::new(PATH, [IFACE], ObjectFlags::ANNOUNCED).unwrap())
        .unwrap();
    bus
}

fn connected_pair() -> (LoopbackBus, BusAttachment, BusAttachment, RemoteServiceProxy) {
    let fabric = LoopbackBus::new();
    let mut service = attachment();
    service.on_method_call(|_, ctx, args| {
        ctx.reply(args);
        Ok(())
    });
    service.attach(fabric.connect()).unwrap();

    let mut client = attachment();
    let found = Rc::new(RefCell::new(None));
    let slot = Rc::clone(&found);
    client.find_service(IFACE, move |_, proxy| {
        slot.borrow_mut().get_or_insert(proxy);
    });
    client.attach(fabric.connect()).unwrap();
    for _ in 0..4 {
        client.poll();
        service.poll();
    }
    let proxy = found.borrow_mut().take().expect("service not found");
    (fabric, service, client, proxy)
}

fn bench_call_round_trip(c: &mut Criterion) {
    let (_fabric, mut service, mut client, proxy) = connected_pair();
    let method = proxy.method("my_ping").unwrap();

    let mut group = c.benchmark_group("call_round_trip");
    for batch in [1usize, 16, 64] {
        group.bench_with_input(BenchmarkId::from_parameter(batch), &batch, |b, &batch| {
            b.iter(|| {
                let replies = Rc::new(Cell::new(0usize));
                for _ in 0..batch {
                    let count = Rc::clone(&replies);
                    let _call = method
                        .call(vec![MsgValue::from("ping")])
                        .unwrap()
                        .on_reply(move |_, _| count.set(count.get() + 1));
                }
                service.poll();
                client.poll();
                black_box(replies.get())
            })
        });
    }
    group.finish();
}

criterion_group!(
    benches,
    bench_signature_parse,
    bench_value_from_json,
    bench_call_round_trip
);
criterion_main!(benches);
