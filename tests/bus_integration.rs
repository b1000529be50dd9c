use alljoyn_js::bus::{error_names, BusAttachment, LoopbackBus};
use alljoyn_js::config::BindingConfig;
use alljoyn_js::core::error::{AjsError, ContractViolation, RegistrationError, ResourceError};
use alljoyn_js::core::TimerId;
use alljoyn_js::proxy::{CallError, RemoteServiceProxy};
use alljoyn_js::registry::{Access, InterfaceDescriptor, ObjectDescriptor, ObjectFlags};
use alljoyn_js::value::MsgValue;
use std::cell::{Cell, RefCell};
use std::rc::Rc;

const IFACE: &str = "org.alljoyn.alljoyn_test";
const PATH: &str = "/org/alljoyn/alljoyn_test";

fn test_interface(extra_method: bool) -> InterfaceDescriptor {
    let mut builder = InterfaceDescriptor::builder(IFACE)
        .method("my_ping", &["s"], &["s"])
        .property("int_val", "i", Access::ReadWrite)
        .property("str_val", "s", Access::Read);
    if extra_method {
        builder = builder.method("my_extra", &[], &[]);
    }
    builder.build().unwrap()
}

fn attachment(extra_method: bool) -> BusAttachment {
    let mut bus = BusAttachment::new(BindingConfig::default());
    bus.define_interface(test_interface(extra_method)).unwrap();
    bus.define_object(ObjectDescriptor::new(PATH, [IFACE], ObjectFlags::ANNOUNCED).unwrap())
        .unwrap();
    bus
}

/// A client that keeps the first proxy it finds for `IFACE`.
fn client_with_proxy(fabric: &LoopbackBus, extra_method: bool) -> (BusAttachment, Rc<RefCell<Option<RemoteServiceProxy>>>) {
    let mut client = attachment(extra_method);
    let found = Rc::new(RefCell::new(None));
    let slot = Rc::clone(&found);
    client.find_service(IFACE, move |_, proxy| {
        slot.borrow_mut().get_or_insert(proxy);
    });
    client.attach(fabric.connect()).unwrap();
    (client, found)
}

fn pump(a: &mut BusAttachment, b: &mut BusAttachment, rounds: usize) {
    for _ in 0..rounds {
        a.poll();
        b.poll();
    }
}

fn proxy_of(found: &Rc<RefCell<Option<RemoteServiceProxy>>>) -> RemoteServiceProxy {
    found.borrow().clone().expect("service was not found")
}

#[test]
fn test_identical_registration_is_idempotent() -> anyhow::Result<()> {
    let mut bus = attachment(false);
    bus.define_interface(test_interface(false))?;
    bus.define_object(ObjectDescriptor::new(PATH, [IFACE], ObjectFlags::ANNOUNCED)?)?;
    assert_eq!(
        bus.define_interface(test_interface(true)),
        Err(RegistrationError::DuplicateName(IFACE.to_string()))
    );
    assert_eq!(bus.registry().interface(IFACE), Some(&test_interface(false)));
    Ok(())
}

#[test]
fn test_calls_are_dispatched_in_arrival_order() {
    let fabric = LoopbackBus::new();
    let mut svc = attachment(false);
    let seen = Rc::new(RefCell::new(Vec::new()));
    let log = Rc::clone(&seen);
    svc.on_method_call(move |_, ctx, args| {
        let text = args[0].as_str().unwrap_or_default().to_string();
        log.borrow_mut().push(text.clone());
        ctx.reply(vec![MsgValue::Str(text.to_uppercase())]);
        Ok(())
    });
    svc.attach(fabric.connect()).unwrap();

    let (mut client, found) = client_with_proxy(&fabric, false);
    pump(&mut client, &mut svc, 4);
    let proxy = proxy_of(&found);

    let replies = Rc::new(RefCell::new(Vec::new()));
    for word in ["one", "two", "three"] {
        let out = Rc::clone(&replies);
        let _call = proxy
            .method("my_ping")
            .unwrap()
            .call(vec![word.into()])
            .unwrap()
            .on_reply(move |_, values| out.borrow_mut().push(values[0].as_str().unwrap_or_default().to_string()));
    }
    pump(&mut client, &mut svc, 3);

    assert_eq!(*seen.borrow(), vec!["one", "two", "three"]);
    assert_eq!(*replies.borrow(), vec!["ONE", "TWO", "THREE"]);
    assert_eq!(svc.dispatch_stats().replied, 3);
}

#[test]
fn test_second_reply_is_a_violation_and_never_sent() {
    let fabric = LoopbackBus::new();
    let mut svc = attachment(false);
    svc.on_method_call(|_, ctx, _| {
        ctx.reply(vec!["first".into()]);
        ctx.reply(vec!["second".into()]);
        Ok(())
    });
    svc.attach(fabric.connect()).unwrap();

    let (mut client, found) = client_with_proxy(&fabric, false);
    pump(&mut client, &mut svc, 4);
    let replies = Rc::new(RefCell::new(Vec::new()));
    let out = Rc::clone(&replies);
    let _call = proxy_of(&found)
        .method("my_ping")
        .unwrap()
        .call(vec!["x".into()])
        .unwrap()
        .on_reply(move |_, values| out.borrow_mut().push(values));
    pump(&mut client, &mut svc, 4);

    assert_eq!(*replies.borrow(), vec![vec![MsgValue::Str("first".into())]]);
    assert!(matches!(
        svc.contract_violations().as_slice(),
        [ContractViolation::AlreadyReplied { member }] if member == "my_ping"
    ));
}

#[test]
fn test_property_set_then_get() {
    let fabric = LoopbackBus::new();
    let mut svc = attachment(false);
    let value = Rc::new(Cell::new(0i32));
    let stored = Rc::clone(&value);
    svc.on_prop_set(move |_, ctx, _, prop, v| {
        assert_eq!(prop, "int_val");
        stored.set(v.as_i64().and_then(|n| i32::try_from(n).ok()).ok_or("int_val must be an i32")?);
        ctx.reply(Vec::new());
        Ok(())
    });
    let current = Rc::clone(&value);
    svc.on_prop_get(move |_, ctx, _, prop| {
        match prop {
            "int_val" => ctx.reply_value(current.get()),
            _ => ctx.reply_value("hello"),
        }
        Ok(())
    });
    svc.attach(fabric.connect()).unwrap();

    let (mut client, found) = client_with_proxy(&fabric, false);
    pump(&mut client, &mut svc, 4);
    let proxy = proxy_of(&found);

    let acked = Rc::new(Cell::new(false));
    let ack = Rc::clone(&acked);
    let _set = proxy
        .set_prop("int_val", 42i32)
        .unwrap()
        .on_reply(move |_, values| {
            assert!(values.is_empty());
            ack.set(true);
        });
    pump(&mut client, &mut svc, 3);
    assert!(acked.get());
    assert_eq!(value.get(), 42);

    let read = Rc::new(Cell::new(None));
    let out = Rc::clone(&read);
    let _get = proxy
        .get_prop("int_val")
        .unwrap()
        .on_reply(move |_, values| out.set(values[0].as_i64()));
    pump(&mut client, &mut svc, 3);
    assert_eq!(read.get(), Some(42));

    // A read-only property cannot be set, and the proxy says so before sending.
    assert!(proxy.set_prop("str_val", "nope").is_err());
}

#[test]
fn test_unknown_member_is_rejected_by_the_service() {
    let fabric = LoopbackBus::new();
    let mut svc = attachment(false);
    let called = Rc::new(Cell::new(false));
    let flag = Rc::clone(&called);
    svc.on_method_call(move |_, ctx, args| {
        flag.set(true);
        ctx.reply(args);
        Ok(())
    });
    svc.attach(fabric.connect()).unwrap();

    // The client's copy of the interface has a method the service lacks.
    let (mut client, found) = client_with_proxy(&fabric, true);
    pump(&mut client, &mut svc, 4);
    let proxy = proxy_of(&found);
    assert!(matches!(
        proxy.method("never_declared"),
        Err(AjsError::Resource(ResourceError::UnknownMember { .. }))
    ));

    let error = Rc::new(RefCell::new(None));
    let out = Rc::clone(&error);
    let _call = proxy
        .method("my_extra")
        .unwrap()
        .call(Vec::new())
        .unwrap()
        .on_error(move |_, err| *out.borrow_mut() = Some(err));
    pump(&mut client, &mut svc, 3);

    assert!(!called.get());
    match error.borrow().as_ref() {
        Some(CallError::Remote { name, .. }) => assert_eq!(name, error_names::UNKNOWN_METHOD),
        other => panic!("expected a remote error, got {other:?}"),
    };
}

#[test]
fn test_timer_cleared_by_earlier_timer_does_not_fire() {
    let mut bus = attachment(false);
    let fired = Rc::new(RefCell::new(Vec::new()));
    let victim: Rc<Cell<Option<TimerId>>> = Rc::new(Cell::new(None));

    let log = Rc::clone(&fired);
    let target = Rc::clone(&victim);
    bus.set_interval(100, move |bus| {
        log.borrow_mut().push("first");
        if let Some(id) = target.take() {
            bus.clear_interval(id).unwrap();
        }
    })
    .unwrap();
    let log = Rc::clone(&fired);
    let id = bus.set_interval(100, move |_| log.borrow_mut().push("second")).unwrap();
    victim.set(Some(id));

    bus.advance(350);
    assert_eq!(*fired.borrow(), vec!["first", "first", "first"]);
    assert_eq!(bus.timer_count(), 1);
}

#[test]
fn test_get_all_returns_every_property() {
    let fabric = LoopbackBus::new();
    let mut svc = attachment(false);
    svc.on_prop_get_all(|_, ctx, iface| {
        assert_eq!(iface, IFACE);
        ctx.reply_props([("int_val", MsgValue::Int32(7)), ("str_val", MsgValue::from("seven"))]);
        Ok(())
    });
    svc.attach(fabric.connect()).unwrap();

    let (mut client, found) = client_with_proxy(&fabric, false);
    pump(&mut client, &mut svc, 4);

    let props = Rc::new(RefCell::new(None));
    let out = Rc::clone(&props);
    let _all = proxy_of(&found)
        .get_all_props(IFACE)
        .unwrap()
        .on_reply(move |_, mut values| *out.borrow_mut() = values.pop());
    pump(&mut client, &mut svc, 3);

    let props = props.borrow();
    let map = props.as_ref().expect("GetAll reply");
    assert_eq!(map.dict_get("int_val").and_then(MsgValue::as_i64), Some(7));
    assert_eq!(map.dict_get("str_val").and_then(MsgValue::as_str), Some("seven"));
}

#[test]
fn test_released_proxy_never_delivers_its_reply() {
    let fabric = LoopbackBus::new();
    let mut svc = attachment(false);
    svc.on_method_call(|_, ctx, args| {
        ctx.reply(args);
        Ok(())
    });
    svc.attach(fabric.connect()).unwrap();

    let (mut client, found) = client_with_proxy(&fabric, false);
    pump(&mut client, &mut svc, 4);

    let delivered = Rc::new(Cell::new(false));
    let flag = Rc::clone(&delivered);
    {
        let proxy = found.borrow_mut().take().expect("service was not found");
        let _call = proxy
            .method("my_ping")
            .unwrap()
            .call(vec!["x".into()])
            .unwrap()
            .on_reply(move |_, _| flag.set(true));
    }
    assert_eq!(client.live_proxies(), 0);
    pump(&mut client, &mut svc, 4);
    assert!(!delivered.get());

    // Retained proxies keep their reply slots alive.
    let retained = Rc::new(Cell::new(false));
    let flag = Rc::clone(&retained);
    client.find_service(IFACE, move |bus, proxy| {
        let flag = Rc::clone(&flag);
        let _call = proxy
            .method("my_ping")
            .unwrap()
            .call(vec!["y".into()])
            .unwrap()
            .on_reply(move |_, _| flag.set(true));
        bus.retain_proxy(proxy);
    });
    pump(&mut client, &mut svc, 6);
    assert!(retained.get());
    assert_eq!(client.live_proxies(), 1);
}
