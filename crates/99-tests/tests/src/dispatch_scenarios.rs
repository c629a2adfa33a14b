use batch::{AllocConfig, Allocator, Batch, ChannelSpec, ExchangeConfig, FieldDict, Reply, SlotId};
use dispatch::{Cycle, DispatchError, Dispatcher, DispatcherConfig, Error, State};
use engine_native::ManualEngine;
use proptest::prelude::*;
use smem::{ElementType, ALL_ELEMENT_TYPES};

fn fields() -> FieldDict {
    FieldDict::new()
        .define("x", ElementType::Int32, &[1])
        .and_then(|d| d.define("y", ElementType::Int32, &[1]))
        .expect("fields")
}

fn echo_allocator() -> Allocator {
    Allocator::new(
        vec![ChannelSpec::new("echo")
            .input(["x"])
            .reply(["y"])
            .capacity(4)],
        fields(),
        AllocConfig::default(),
    )
    .expect("allocator")
}

fn manual(allocator: Allocator) -> Dispatcher<ManualEngine, ()> {
    Dispatcher::new(allocator, ManualEngine::new(), DispatcherConfig::default())
        .expect("dispatcher")
}

fn doubler(batch: &Batch<'_>, _: &mut ()) -> anyhow::Result<Option<Reply>> {
    let doubled: Vec<i32> = batch.get::<i32>("x")?.iter().map(|v| v * 2).collect();
    Ok(Some(Reply::new().with("y", doubled)))
}

#[test]
fn echo_scenario() {
    let mut d = manual(echo_allocator());
    d.register("echo", doubler).expect("register");
    d.engine_mut()
        .write_rows::<i32>(SlotId(0), "x", &[&[5], &[7], &[9], &[0]])
        .expect("inputs");
    d.engine_mut().mark_ready(SlotId(0), 3).expect("ready");
    d.start().expect("start");

    assert_eq!(
        d.run(&mut ()).expect("cycle"),
        Cycle::Dispatched {
            slot: SlotId(0),
            size: 3
        }
    );
    assert_eq!(
        d.engine()
            .read_rows::<i32>(SlotId(0), "y", 3)
            .expect("replies"),
        vec![10, 14, 18]
    );
    assert_eq!(d.engine().steps(SlotId(0)), 1);
    assert_eq!(d.engine().total_steps(), 1);
}

#[test]
fn slot_ids_are_unique_across_channels() {
    let fields = FieldDict::new()
        .define("s", ElementType::Float32, &[3])
        .expect("fields");
    let allocator = Allocator::new(
        vec![
            ChannelSpec::new("a").input(["s"]).capacity(2),
            ChannelSpec::new("b").input(["s"]).capacity(2).num_slots(2),
        ],
        fields,
        AllocConfig::default(),
    )
    .expect("allocator");

    let a = allocator.slots_of("a").expect("a").to_vec();
    let b = allocator.slots_of("b").expect("b").to_vec();
    assert_eq!(a.len(), 1);
    assert_eq!(b.len(), 2);
    let mut all: Vec<_> = a.iter().chain(&b).copied().collect();
    all.sort();
    all.dedup();
    assert_eq!(all.len(), 3);
    for slot in &b {
        assert_eq!(allocator.channel_of(*slot), Some("b"));
    }
    assert_eq!(allocator.channel_of(a[0]), Some("a"));

    // Independent buffers: a write to one replica is invisible in the other.
    let mut d = manual(allocator);
    d.register("a", |_, _| Ok(None)).expect("a");
    d.register("b", |_, _| Ok(None)).expect("b");
    d.engine_mut()
        .write_row::<f32>(b[0], "s", 0, &[1.0, 2.0, 3.0])
        .expect("write");
    let other = d.allocator().input_batch(b[1], 1).expect("batch");
    assert_eq!(other.get::<f32>("s").expect("s"), &[0.0, 0.0, 0.0]);
    assert_eq!(other.shape("s").expect("shape").as_slice(), &[1, 3]);
}

#[test]
fn extra_reply_keys_warn_and_still_write() {
    let mut d = manual(echo_allocator());
    d.register("echo", |batch, _| {
        let doubled: Vec<i32> = batch.get::<i32>("x")?.iter().map(|v| v * 2).collect();
        Ok(Some(Reply::new().with("y", doubled).with("z", 1i32)))
    })
    .expect("register");
    d.engine_mut()
        .write_rows::<i32>(SlotId(0), "x", &[&[1], &[2]])
        .expect("inputs");
    d.engine_mut().mark_ready(SlotId(0), 2).expect("ready");
    d.start().expect("start");

    d.run(&mut ()).expect("cycle");
    assert_eq!(
        d.engine()
            .read_rows::<i32>(SlotId(0), "y", 2)
            .expect("replies"),
        vec![2, 4]
    );
    assert_eq!(d.stats().extra_key_warnings, 1);
    assert_eq!(d.engine().steps(SlotId(0)), 1);
}

#[test]
fn coverage_gap_blocks_start_until_fixed() {
    let allocator = Allocator::new(
        vec![
            ChannelSpec::new("echo").input(["x"]).reply(["y"]),
            ChannelSpec::new("log").input(["x"]),
        ],
        fields(),
        AllocConfig::default(),
    )
    .expect("allocator");
    let mut d = manual(allocator);
    d.register("echo", doubler).expect("register");

    let err = d.start().expect_err("coverage");
    assert!(matches!(&err, Error::Coverage(gap) if gap.missing == [(SlotId(1), "log".to_owned())]));
    assert!(err.to_string().contains("log"));
    assert_eq!(d.state(), State::Unstarted);

    d.register("log", |_, _| Ok(None)).expect("register");
    d.start().expect("start");
}

#[test]
fn no_reply_channel_rejects_a_reply() {
    let allocator = Allocator::new(
        vec![ChannelSpec::new("log").input(["x"])],
        fields(),
        AllocConfig::default(),
    )
    .expect("allocator");
    let mut d = manual(allocator);
    d.register("log", |_, _| Ok(Some(Reply::new().with("y", 1i32))))
        .expect("register");
    d.engine_mut().mark_ready(SlotId(0), 1).expect("ready");
    d.start().expect("start");

    assert!(matches!(
        d.run(&mut ()),
        Err(Error::Dispatch(DispatchError::UnexpectedReply { .. }))
    ));
    assert_eq!(d.engine().steps(SlotId(0)), 0);
}

#[test]
fn empty_reply_lists_every_missing_key() {
    let fields = fields()
        .define("v", ElementType::Float32, &[1])
        .expect("fields");
    let allocator = Allocator::new(
        vec![ChannelSpec::new("ac").input(["x"]).reply(["y", "v"])],
        fields,
        AllocConfig::default(),
    )
    .expect("allocator");
    let mut d = manual(allocator);
    d.register("ac", |_, _| Ok(Some(Reply::new()))).expect("register");
    d.engine_mut().mark_ready(SlotId(0), 1).expect("ready");
    d.start().expect("start");

    match d.run(&mut ()) {
        Err(Error::Reconciliation(err)) => {
            assert_eq!(err.missing, vec!["y".to_owned(), "v".to_owned()]);
        }
        other => panic!("expected reconciliation error, got {other:?}"),
    }
    assert_eq!(d.engine().steps(SlotId(0)), 0);
}

#[test]
fn config_file_drives_a_full_cycle() {
    let config = ExchangeConfig::from_json_str(
        r#"{
            "alloc": { "default_capacity": 2 },
            "fields": {
                "x": { "type": "int32", "shape": [1] },
                "y": { "type": "int32", "shape": [1] },
                "id": { "type": "int64", "shape": [1] }
            },
            "channels": [
                { "name": "echo", "input": ["x"], "reply": ["y"], "num_slots": 2 }
            ]
        }"#,
    );
    let mut config = config.expect("config");
    config.add_input_labels(&["id"]);
    let allocator = Allocator::from_config(&config).expect("allocator");

    let mut d = Dispatcher::builder(allocator, ManualEngine::new())
        .on("echo", |batch, seen: &mut Vec<i64>| {
            seen.extend_from_slice(batch.get::<i64>("id")?);
            doubler(batch, &mut ())
        })
        .build()
        .expect("build");
    for slot in [SlotId(0), SlotId(1)] {
        d.engine_mut()
            .write_rows::<i64>(slot, "id", &[&[slot.index() as i64 * 10], &[1]])
            .expect("ids");
        d.engine_mut().mark_ready(slot, 2).expect("ready");
    }
    d.start().expect("start");

    let mut seen = Vec::new();
    for _ in 0..2 {
        d.run(&mut seen).expect("cycle");
    }
    assert_eq!(d.run(&mut seen).expect("idle"), Cycle::Idle);
    assert_eq!(seen, vec![0, 1, 10, 1]);
    assert_eq!(d.stats().channel_cycles("echo"), Some(2));
}

proptest! {
    #[test]
    fn native_writes_read_back_through_batches(
        elem_idx in 0usize..ALL_ELEMENT_TYPES.len(),
        rows in 1usize..6,
        seed in any::<u8>(),
    ) {
        let elem = ALL_ELEMENT_TYPES[elem_idx];
        let fields = FieldDict::new().define("f", elem, &[3]).expect("fields");
        let allocator = Allocator::new(
            vec![ChannelSpec::new("c").input(["f"]).capacity(6)],
            fields,
            AllocConfig::default(),
        )
        .expect("allocator");
        let mut d = manual(allocator);
        d.register("c", |_, _| Ok(None)).expect("register");

        let desc = d.engine().groups().next().expect("group").inputs[0].clone();
        let pattern: Vec<u8> = (0..desc.row_bytes() * rows)
            .map(|i| seed.wrapping_add(i as u8))
            .collect();
        let mut foreign = unsafe { smem::ForeignBuffer::new(desc.clone()) }.expect("foreign");
        for (row, chunk) in pattern.chunks(desc.row_bytes()).enumerate() {
            foreign.write_row_bytes(row, chunk).expect("write");
        }

        let batch = d.allocator().input_batch(SlotId(0), rows).expect("batch");
        prop_assert_eq!(batch.field("f").expect("field").as_bytes(), &pattern[..]);
        prop_assert_eq!(d.state(), State::Unstarted);
    }
}
