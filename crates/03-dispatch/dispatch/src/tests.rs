use std::collections::VecDeque;
use std::time::Duration;

use batch::{AllocConfig, Allocator, BufferGroup, ChannelSpec, FieldDict, Reply, SlotId};
use smem::{Device, ElementType, ForeignBuffer};

use crate::*;

/// Engine that hands out slots from a fixed script.
#[derive(Default)]
struct ScriptEngine {
    groups: Vec<BufferGroup>,
    script: VecDeque<(SlotId, usize)>,
    stepped: Vec<SlotId>,
    started: bool,
    stops: usize,
}

impl ScriptEngine {
    fn push(&mut self, slot: u32, size: usize) {
        self.script.push_back((SlotId(slot), size));
    }

    fn write<T: smem::Element>(&self, slot: u32, key: &str, rows: &[&[T]]) {
        let desc = self.groups[slot as usize]
            .inputs
            .iter()
            .find(|d| d.name == key)
            .cloned()
            .expect("descriptor");
        let mut foreign = unsafe { ForeignBuffer::new(desc) }.expect("foreign");
        for (row, values) in rows.iter().enumerate() {
            foreign.write_row(row, values).expect("write row");
        }
    }

    fn read<T: smem::Element>(&self, slot: u32, key: &str, rows: usize) -> Vec<T> {
        let desc = self.groups[slot as usize]
            .replies
            .iter()
            .find(|d| d.name == key)
            .cloned()
            .expect("descriptor");
        let foreign = unsafe { ForeignBuffer::new(desc) }.expect("foreign");
        (0..rows)
            .flat_map(|row| foreign.read_row::<T>(row).expect("read row"))
            .collect()
    }
}

impl Engine for ScriptEngine {
    fn allocate_buffer_group(&mut self, group: &BufferGroup) -> Result<(), EngineError> {
        self.groups.push(group.clone());
        Ok(())
    }

    fn start(&mut self) -> Result<(), EngineError> {
        if self.started {
            return Err(EngineError::AlreadyStarted);
        }
        self.started = true;
        Ok(())
    }

    fn wait(&mut self, _timeout: Option<Duration>) -> Result<Option<ReadySlot>, EngineError> {
        if !self.started {
            return Err(EngineError::NotRunning);
        }
        Ok(self
            .script
            .pop_front()
            .map(|(slot, size)| ReadySlot::new(slot, size)))
    }

    fn step(&mut self, ready: ReadySlot) -> Result<(), EngineError> {
        self.stepped.push(ready.slot());
        Ok(())
    }

    fn stop(&mut self) -> Result<(), EngineError> {
        self.stops += 1;
        Ok(())
    }
}

fn dict() -> FieldDict {
    FieldDict::new()
        .define("x", ElementType::Int32, &[1])
        .and_then(|d| d.define("y", ElementType::Int32, &[1]))
        .and_then(|d| d.define("obs", ElementType::Float32, &[2]))
        .expect("dict")
}

fn echo_allocator() -> Allocator {
    Allocator::new(
        vec![ChannelSpec::new("echo")
            .input(["x"])
            .reply(["y"])
            .capacity(4)],
        dict(),
        AllocConfig::default(),
    )
    .expect("allocator")
}

fn doubler(batch: &batch::Batch<'_>, _: &mut ()) -> anyhow::Result<Option<Reply>> {
    let doubled: Vec<i32> = batch.get::<i32>("x")?.iter().map(|v| v * 2).collect();
    Ok(Some(Reply::new().with("y", doubled)))
}

fn dispatcher(allocator: Allocator) -> Dispatcher<ScriptEngine, ()> {
    Dispatcher::new(allocator, ScriptEngine::default(), DispatcherConfig::default())
        .expect("dispatcher")
}

#[test]
fn echo_cycle_writes_replies_and_steps_once() {
    let mut d = dispatcher(echo_allocator());
    d.register("echo", doubler).expect("register");
    d.engine().write::<i32>(0, "x", &[&[5], &[7], &[9], &[0]]);
    d.engine_mut().push(0, 3);
    d.start().expect("start");

    let cycle = d.run(&mut ()).expect("run");
    assert_eq!(
        cycle,
        Cycle::Dispatched {
            slot: SlotId(0),
            size: 3
        }
    );
    assert_eq!(d.engine().read::<i32>(0, "y", 3), vec![10, 14, 18]);
    assert_eq!(d.engine().stepped, vec![SlotId(0)]);
    assert_eq!(d.run(&mut ()).expect("idle"), Cycle::Idle);

    let stats = d.stats();
    assert_eq!(stats.cycles, 1);
    assert_eq!(stats.rows, 3);
    assert_eq!(stats.idle_waits, 1);
    assert_eq!(stats.channel_cycles("echo"), Some(1));
}

#[test]
fn context_is_threaded_through_callbacks() {
    let mut d: Dispatcher<ScriptEngine, Vec<usize>> = Dispatcher::new(
        echo_allocator(),
        ScriptEngine::default(),
        DispatcherConfig::default(),
    )
    .expect("dispatcher");
    d.register("echo", |batch, seen: &mut Vec<usize>| {
        seen.push(batch.len());
        Ok(Some(Reply::new().with("y", 0i32)))
    })
    .expect("register");
    d.engine_mut().push(0, 2);
    d.engine_mut().push(0, 4);
    d.start().expect("start");

    let mut seen = Vec::new();
    d.run(&mut seen).expect("first");
    d.run(&mut seen).expect("second");
    assert_eq!(seen, vec![2, 4]);
}

#[test]
fn start_requires_every_slot_covered() {
    let alloc = Allocator::new(
        vec![
            ChannelSpec::new("a").input(["x"]).num_slots(2),
            ChannelSpec::new("b").input(["obs"]),
        ],
        dict(),
        AllocConfig::default(),
    )
    .expect("allocator");
    let mut d = dispatcher(alloc);
    d.register("a", |_, _| Ok(None)).expect("register");

    match d.start() {
        Err(Error::Coverage(err)) => {
            assert_eq!(err.missing, vec![(SlotId(2), "b".to_owned())]);
        }
        other => panic!("expected coverage error, got {other:?}"),
    }
    assert_eq!(d.state(), State::Unstarted);

    d.register("b", |_, _| Ok(None)).expect("register");
    d.start().expect("start");
    assert_eq!(d.state(), State::Running);
}

#[test]
fn unknown_channel_is_a_config_error() {
    let mut d = dispatcher(echo_allocator());
    assert!(matches!(
        d.register("nope", |_, _| Ok(None)),
        Err(Error::Config(batch::ConfigError::UnknownChannel(name))) if name == "nope"
    ));
    assert!(!d.register_if_exists("nope", |_, _| Ok(None)).expect("absent"));
    assert!(d.register_if_exists("echo", doubler).expect("present"));
}

#[test]
fn register_if_exists_reports_lifecycle_errors() {
    let mut d = dispatcher(echo_allocator());
    d.stop().expect("stop");
    assert!(matches!(
        d.register_if_exists("echo", doubler),
        Err(Error::Dispatch(DispatchError::Lifecycle {
            state: State::Stopped,
            ..
        }))
    ));
    assert!(!d.register_if_exists("nope", doubler).expect("absent"));
}

#[test]
fn slot_callback_overrides_channel_callback() {
    let alloc = Allocator::new(
        vec![ChannelSpec::new("c").input(["x"]).reply(["y"]).num_slots(2)],
        dict(),
        AllocConfig::default(),
    )
    .expect("allocator");
    let mut d = Dispatcher::builder(alloc, ScriptEngine::default())
        .on("c", |_, _: &mut ()| Ok(Some(Reply::new().with("y", 1i32))))
        .on_slot(SlotId(1), |_, _: &mut ()| {
            Ok(Some(Reply::new().with("y", 2i32)))
        })
        .build()
        .expect("build");
    d.engine_mut().push(0, 1);
    d.engine_mut().push(1, 1);
    d.start().expect("start");
    d.run(&mut ()).expect("slot 0");
    d.run(&mut ()).expect("slot 1");
    assert_eq!(d.engine().read::<i32>(0, "y", 1), vec![1]);
    assert_eq!(d.engine().read::<i32>(1, "y", 1), vec![2]);
}

#[test]
fn builder_rejects_uncovered_slots() {
    let result = Dispatcher::<ScriptEngine, ()>::builder(echo_allocator(), ScriptEngine::default())
        .build();
    assert!(matches!(result, Err(Error::Coverage(_))));
}

#[test]
fn reply_on_no_reply_channel_is_rejected() {
    let alloc = Allocator::new(
        vec![ChannelSpec::new("log").input(["x"])],
        dict(),
        AllocConfig::default(),
    )
    .expect("allocator");
    let mut d = dispatcher(alloc);
    d.register("log", |_, _| Ok(Some(Reply::new().with("y", 1i32))))
        .expect("register");
    d.engine_mut().push(0, 1);
    d.start().expect("start");

    assert!(matches!(
        d.run(&mut ()),
        Err(Error::Dispatch(DispatchError::UnexpectedReply { keys, .. })) if keys == ["y"]
    ));
    assert!(d.engine().stepped.is_empty());
}

#[test]
fn empty_reply_on_no_reply_channel_is_accepted() {
    let alloc = Allocator::new(
        vec![ChannelSpec::new("log").input(["x"])],
        dict(),
        AllocConfig::default(),
    )
    .expect("allocator");
    let mut d = dispatcher(alloc);
    d.register("log", |_, _| Ok(Some(Reply::new()))).expect("register");
    d.engine_mut().push(0, 1);
    d.start().expect("start");
    d.run(&mut ()).expect("run");
    assert_eq!(d.engine().stepped, vec![SlotId(0)]);
}

#[test]
fn missing_reply_keys_fail_reconciliation() {
    let mut d = dispatcher(echo_allocator());
    d.register("echo", |_, _| Ok(Some(Reply::new()))).expect("register");
    d.engine_mut().push(0, 2);
    d.start().expect("start");

    match d.run(&mut ()) {
        Err(Error::Reconciliation(err)) => {
            assert_eq!(err.channel, "echo");
            assert_eq!(err.missing, vec!["y".to_owned()]);
        }
        other => panic!("expected reconciliation error, got {other:?}"),
    }
    assert!(d.engine().stepped.is_empty());
}

#[test]
fn none_on_reply_channel_is_missing_reply() {
    let mut d = dispatcher(echo_allocator());
    d.register("echo", |_, _| Ok(None)).expect("register");
    d.engine_mut().push(0, 1);
    d.start().expect("start");
    assert!(matches!(
        d.run(&mut ()),
        Err(Error::Dispatch(DispatchError::MissingReply { .. }))
    ));
}

#[test]
fn extra_reply_keys_are_counted_not_fatal() {
    let mut d = dispatcher(echo_allocator());
    d.register("echo", |_, _| {
        Ok(Some(Reply::new().with("y", 3i32).with("z", 1i32)))
    })
    .expect("register");
    d.engine_mut().push(0, 2);
    d.start().expect("start");
    d.run(&mut ()).expect("run");
    assert_eq!(d.engine().read::<i32>(0, "y", 2), vec![3, 3]);
    assert_eq!(d.stats().extra_key_warnings, 1);
}

#[test]
fn wrong_reply_type_is_a_type_error() {
    let mut d = dispatcher(echo_allocator());
    d.register("echo", |_, _| Ok(Some(Reply::new().with("y", 1.5f32))))
        .expect("register");
    d.engine_mut().push(0, 1);
    d.start().expect("start");
    assert!(matches!(
        d.run(&mut ()),
        Err(Error::Type { channel, .. }) if channel == "echo"
    ));
}

#[test]
fn callback_errors_propagate_with_channel() {
    let mut d = dispatcher(echo_allocator());
    d.register("echo", |_, _| Err(anyhow::anyhow!("boom")))
        .expect("register");
    d.engine_mut().push(0, 1);
    d.start().expect("start");
    let err = d.run(&mut ()).expect_err("callback error");
    assert!(err.to_string().contains("boom"));
    assert!(d.engine().stepped.is_empty());
}

#[test]
fn sizes_outside_capacity_are_rejected() {
    let mut d = dispatcher(echo_allocator());
    d.register("echo", doubler).expect("register");
    d.engine_mut().push(0, 0);
    d.engine_mut().push(0, 5);
    d.start().expect("start");
    for _ in 0..2 {
        assert!(matches!(
            d.run(&mut ()),
            Err(Error::Dispatch(DispatchError::InvalidSize { capacity: 4, .. }))
        ));
    }
}

#[test]
fn unknown_ready_slot_is_rejected() {
    let mut d = dispatcher(echo_allocator());
    d.register("echo", doubler).expect("register");
    d.engine_mut().push(9, 1);
    d.start().expect("start");
    assert!(matches!(
        d.run(&mut ()),
        Err(Error::Dispatch(DispatchError::UnknownSlot(SlotId(9))))
    ));
}

#[test]
fn accelerator_channels_see_device_batches() {
    let alloc = Allocator::new(
        vec![ChannelSpec::new("gpu")
            .input(["x"])
            .reply(["y"])
            .device(Device::Accelerator(0))],
        dict(),
        AllocConfig::default(),
    )
    .expect("allocator");
    let mut d = dispatcher(alloc);
    d.register("gpu", |batch, _| {
        assert_eq!(batch.device(), Device::Accelerator(0));
        doubler(batch, &mut ())
    })
    .expect("register");
    d.engine().write::<i32>(0, "x", &[&[21]]);
    d.engine_mut().push(0, 1);
    d.start().expect("start");
    d.run(&mut ()).expect("run");
    assert_eq!(d.engine().read::<i32>(0, "y", 1), vec![42]);
}

#[test]
fn lifecycle_is_enforced() {
    let mut d = dispatcher(echo_allocator());
    d.register("echo", doubler).expect("register");
    assert!(matches!(
        d.run(&mut ()),
        Err(Error::Dispatch(DispatchError::Lifecycle {
            state: State::Unstarted,
            ..
        }))
    ));
    d.start().expect("start");
    assert!(matches!(
        d.start(),
        Err(Error::Dispatch(DispatchError::Lifecycle { .. }))
    ));
    d.stop().expect("stop");
    d.stop().expect("stop twice");
    assert_eq!(d.engine().stops, 1);
    assert!(d.start().is_err());
    assert!(d.register("echo", doubler).is_err());
}

#[test]
fn stop_handle_ends_the_loop() {
    let mut d = dispatcher(echo_allocator());
    let handle = d.stop_handle();
    d.register("echo", move |batch, _| {
        handle.stop();
        doubler(batch, &mut ())
    })
    .expect("register");
    d.engine_mut().push(0, 1);
    d.engine_mut().push(0, 1);

    let stats = d.run_until_stopped(&mut ()).expect("run");
    assert_eq!(stats.cycles, 1);
    assert_eq!(d.state(), State::Stopped);
    assert_eq!(d.engine().script.len(), 1);
}

#[test]
fn config_deserializes_with_defaults() {
    let config: DispatcherConfig = serde_json::from_str("{}").expect("config");
    assert_eq!(config, DispatcherConfig::default());
    let config: DispatcherConfig =
        serde_json::from_str(r#"{"wait_timeout": null}"#).expect("config");
    assert_eq!(config.wait_timeout, None);
}

mod prop {
    use super::*;
    use proptest::prelude::*;

    proptest! {
        #[test]
        fn every_valid_size_is_dispatched_and_stepped(sizes in proptest::collection::vec(1usize..=4, 1..12)) {
            let mut d = dispatcher(echo_allocator());
            d.register("echo", doubler).expect("register");
            for &size in &sizes {
                d.engine_mut().push(0, size);
            }
            d.start().expect("start");
            for &size in &sizes {
                prop_assert_eq!(
                    d.run(&mut ()).expect("cycle"),
                    Cycle::Dispatched { slot: SlotId(0), size }
                );
            }
            prop_assert_eq!(d.engine().stepped.len(), sizes.len());
            let stats = d.stats();
            prop_assert_eq!(stats.rows, sizes.iter().sum::<usize>() as u64);
            prop_assert_eq!(stats.cycles, sizes.len() as u64);
        }
    }
}
