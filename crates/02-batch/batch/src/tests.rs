use smem::{Array, Device, ElementType, ForeignBuffer, SmemError, TypeError};

use crate::*;

fn dict() -> FieldDict {
    FieldDict::new()
        .define("x", ElementType::Int32, &[1])
        .and_then(|d| d.define("y", ElementType::Int32, &[1]))
        .and_then(|d| d.define("pi", ElementType::Float32, &[3]))
        .and_then(|d| d.define("h", ElementType::UInt8, &[2, 2]))
        .expect("dict")
}

fn allocator(spec: ChannelSpec) -> Allocator {
    Allocator::new(vec![spec], dict(), AllocConfig::default()).expect("allocator")
}

fn fill_input<T: smem::Element>(allocator: &Allocator, key: &str, rows: &[&[T]]) {
    let group = allocator.slot(SlotId(0)).expect("slot").buffer_group();
    let desc = group
        .inputs
        .into_iter()
        .find(|d| d.name == key)
        .expect("input descriptor");
    let mut foreign = unsafe { ForeignBuffer::new(desc) }.expect("foreign");
    for (row, values) in rows.iter().enumerate() {
        foreign.write_row(row, values).expect("write row");
    }
}

#[test]
fn input_batch_views_first_rows() {
    let alloc = allocator(ChannelSpec::new("c").input(["x", "h"]).capacity(4));
    fill_input::<i32>(&alloc, "x", &[&[5], &[7], &[9], &[11]]);

    let batch = alloc.input_batch(SlotId(0), 3).expect("batch");
    assert_eq!(batch.len(), 3);
    assert_eq!(batch.capacity(), 4);
    assert_eq!(batch.channel(), "c");
    assert_eq!(batch.get::<i32>("x").expect("x"), &[5, 7, 9]);
    assert_eq!(batch.shape("h").expect("h").as_slice(), &[3, 2, 2]);
    assert!(batch.contains("x"));
    assert!(!batch.contains("y"));
    assert_eq!(batch.keys().collect::<Vec<_>>(), vec!["x", "h"]);
}

#[test]
fn input_views_are_read_only_and_typed() {
    let alloc = allocator(ChannelSpec::new("c").input(["x"]).capacity(2));
    let mut batch = alloc.input_batch(SlotId(0), 2).expect("batch");
    assert!(matches!(
        batch.get_mut::<i32>("x"),
        Err(BatchError::ReadOnly(field)) if field == "x"
    ));
    assert!(matches!(
        batch.get::<f32>("x"),
        Err(BatchError::Type(TypeError::Mismatch { .. }))
    ));
    assert!(matches!(batch.get::<i32>("q"), Err(BatchError::MissingField(_))));
    assert!(matches!(batch.fill_zero(), Err(BatchError::ReadOnly(_))));
}

#[test]
fn slice_and_row_select_prefixes() {
    let alloc = allocator(ChannelSpec::new("c").input(["x"]).capacity(4));
    fill_input::<i32>(&alloc, "x", &[&[1], &[2], &[3], &[4]]);
    let batch = alloc.input_batch(SlotId(0), 4).expect("batch");

    let head = batch.slice(2).expect("slice");
    assert_eq!(head.get::<i32>("x").expect("x"), &[1, 2]);
    assert_eq!(head.slot(), SlotId(0));
    assert!(matches!(
        head.slice(3),
        Err(BatchError::SizeOutOfRange {
            requested: 3,
            available: 2
        })
    ));

    let third = batch.row(2).expect("row");
    assert_eq!(third.len(), 1);
    assert_eq!(third.get::<i32>("x").expect("x"), &[3]);
    assert!(batch.row(4).is_err());
}

#[test]
fn to_device_copies_and_leaves_source_valid() {
    let alloc = allocator(ChannelSpec::new("c").input(["x"]).capacity(2));
    fill_input::<i32>(&alloc, "x", &[&[3], &[4]]);
    let batch = alloc.input_batch(SlotId(0), 2).expect("batch");

    let mut moved = batch.to_device(Device::Accelerator(0)).expect("to_device");
    assert_eq!(moved.device(), Device::Accelerator(0));
    moved.get_mut::<i32>("x").expect("owned copy is writable")[0] = 99;
    assert_eq!(moved.get::<i32>("x").expect("x"), &[99, 4]);
    assert_eq!(batch.get::<i32>("x").expect("x"), &[3, 4]);
    assert_eq!(batch.device(), Device::Cpu);
}

#[test]
fn hist_selects_time_index() {
    let alloc = allocator(ChannelSpec::new("c").input(["h"]).capacity(2));
    fill_input::<u8>(&alloc, "h", &[&[1, 2, 3, 4], &[5, 6, 7, 8]]);
    let batch = alloc.input_batch(SlotId(0), 2).expect("batch");

    let t1 = batch.hist(1, "h").expect("hist");
    assert_eq!(t1.shape(), &[2, 2]);
    assert_eq!(t1.to_vec::<u8>(), Ok(vec![3, 4, 7, 8]));
    assert!(matches!(
        batch.hist(2, "h"),
        Err(BatchError::IndexOutOfRange { extent: 2, .. })
    ));
}

#[test]
fn to_arrays_snapshots_every_field() {
    let alloc = allocator(ChannelSpec::new("c").input(["x", "pi"]).capacity(2));
    fill_input::<i32>(&alloc, "x", &[&[1], &[2]]);
    let arrays = alloc.input_batch(SlotId(0), 1).expect("batch").to_arrays().expect("arrays");
    assert_eq!(arrays.len(), 2);
    assert_eq!(arrays[0].0, "x");
    assert_eq!(arrays[0].1, Array::new(vec![1i32], &[1, 1]).expect("array"));
    assert_eq!(arrays[1].1.shape(), &[1, 3]);
}

#[test]
fn copy_from_writes_and_reports_keys() {
    let mut alloc = allocator(ChannelSpec::new("c").input(["x"]).reply(["y", "pi"]).capacity(4));
    let reply = Reply::new()
        .with("y", Array::from_vec(vec![10i32, 14, 18]))
        .with("z", 1i32);

    let mut batch = alloc.reply_batch(SlotId(0), 3).expect("reply").expect("has reply");
    let report = batch.copy_from(&reply).expect("copy");
    assert_eq!(report.extra_keys, vec!["z"]);
    assert_eq!(report.missing_keys, vec!["pi"]);
    assert!(!report.is_complete());
    assert_eq!(batch.get::<i32>("y").expect("y"), &[10, 14, 18]);

    let buffer = alloc.slot(SlotId(0)).and_then(|s| s.buffer("y")).expect("y");
    assert_eq!(buffer.as_slice::<i32>().expect("y"), &[10, 14, 18, 0]);
}

#[test]
fn copy_from_broadcasts_scalars_and_accepts_lists() {
    let mut alloc = allocator(ChannelSpec::new("c").input(["x"]).reply(["y", "pi"]).capacity(2));
    let reply = Reply::new()
        .with("y", 7i32)
        .with("pi", vec![0.5f32, 0.25, 0.25, 1.0, 0.0, 0.0]);
    let mut batch = alloc.reply_batch(SlotId(0), 2).expect("reply").expect("has reply");
    let report = batch.copy_from(&reply).expect("copy");
    assert!(report.is_complete());
    assert_eq!(batch.get::<i32>("y").expect("y"), &[7, 7]);
    assert_eq!(batch.get::<f32>("pi").expect("pi")[3], 1.0);
}

#[test]
fn copy_from_squeezes_unit_extents_and_rejects_bad_shapes() {
    let mut alloc = allocator(ChannelSpec::new("c").input(["x"]).reply(["y"]).capacity(4));
    let mut batch = alloc.reply_batch(SlotId(0), 3).expect("reply").expect("has reply");

    let column = Reply::new().with("y", Array::new(vec![1i32, 2, 3], &[3, 1]).expect("array"));
    batch.copy_from(&column).expect("[3,1] matches [3,1]");

    let flat = Reply::new().with("y", Array::from_vec(vec![4i32, 5, 6]));
    batch.copy_from(&flat).expect("[3] matches [3,1] after squeeze");
    assert_eq!(batch.get::<i32>("y").expect("y"), &[4, 5, 6]);

    let wrong = Reply::new().with("y", Array::from_vec(vec![1i32, 2]));
    match batch.copy_from(&wrong) {
        Err(BatchError::Type(TypeError::ShapeMismatch { field, .. })) => assert_eq!(field, "y"),
        other => panic!("expected shape mismatch, got {other:?}"),
    }

    let short = Reply::new().with("y", vec![1i32]);
    assert!(matches!(
        batch.copy_from(&short),
        Err(BatchError::Type(TypeError::ShapeMismatch { .. }))
    ));
}

#[test]
fn copy_from_never_coerces_element_types() {
    let mut alloc = allocator(ChannelSpec::new("c").input(["x"]).reply(["y"]).capacity(2));
    let mut batch = alloc.reply_batch(SlotId(0), 2).expect("reply").expect("has reply");
    let reply = Reply::new().with("y", Array::from_vec(vec![1i64, 2]));
    match batch.copy_from(&reply) {
        Err(BatchError::Type(TypeError::Mismatch {
            field,
            expected,
            found,
        })) => {
            assert_eq!(field, "y");
            assert_eq!(expected, ElementType::Int32);
            assert_eq!(found, ElementType::Int64);
        }
        other => panic!("expected type mismatch, got {other:?}"),
    }
}

#[test]
fn reply_batch_fill_zero_clears_rows_in_view() {
    let mut alloc = allocator(ChannelSpec::new("c").input(["x"]).reply(["y"]).capacity(3));
    {
        let mut batch = alloc.reply_batch(SlotId(0), 3).expect("reply").expect("has reply");
        batch.copy_from(&Reply::new().with("y", 9i32)).expect("copy");
    }
    {
        let mut batch = alloc.reply_batch(SlotId(0), 2).expect("reply").expect("has reply");
        batch.fill_zero().expect("zero");
    }
    let buffer = alloc.slot(SlotId(0)).and_then(|s| s.buffer("y")).expect("y");
    assert_eq!(buffer.as_slice::<i32>().expect("y"), &[0, 0, 9]);
}

#[test]
fn memory_errors_keep_their_kind() {
    let err = BatchError::from(SmemError::RowOutOfRange { row: 3, rows: 2 });
    assert!(matches!(err, BatchError::Memory(_)));
    let err = BatchError::from(SmemError::Type(TypeError::UnknownType {
        name: "double".into(),
    }));
    assert!(matches!(err, BatchError::Type(_)));
}

mod prop {
    use super::*;
    use proptest::collection;
    use proptest::prelude::*;

    proptest! {
        /// Any prefix slice reads back exactly the first n rows.
        #[test]
        fn slice_reads_prefix(values in collection::vec(any::<i32>(), 1..16), cut in 0usize..16) {
            let cap = values.len();
            let n = cut.min(cap);
            let alloc = allocator(ChannelSpec::new("c").input(["x"]).capacity(cap));
            let rows: Vec<[i32; 1]> = values.iter().map(|&v| [v]).collect();
            let refs: Vec<&[i32]> = rows.iter().map(|r| &r[..]).collect();
            fill_input::<i32>(&alloc, "x", &refs);

            let batch = alloc.input_batch(SlotId(0), cap).expect("batch");
            let head = batch.slice(n).expect("slice");
            prop_assert_eq!(head.get::<i32>("x").expect("x"), &values[..n]);
            prop_assert_eq!(
                head.fields().next().expect("field").as_bytes(),
                &batch.fields().next().expect("field").as_bytes()[..n * 4]
            );
        }

        /// Copying the same reply twice leaves the buffers unchanged.
        #[test]
        fn copy_from_is_idempotent(values in collection::vec(-1000i32..1000, 1..8)) {
            let n = values.len();
            let mut alloc = allocator(ChannelSpec::new("c").input(["x"]).reply(["y"]).capacity(8));
            let reply = Reply::new().with("y", Array::from_vec(values.clone()));
            let mut batch = alloc.reply_batch(SlotId(0), n).expect("reply").expect("has reply");
            let first = batch.copy_from(&reply).expect("copy");
            let once = batch.get::<i32>("y").expect("y").to_vec();
            let second = batch.copy_from(&reply).expect("copy again");
            prop_assert_eq!(first, second);
            prop_assert_eq!(batch.get::<i32>("y").expect("y"), &once[..]);
            prop_assert_eq!(once, values);
        }
    }
}
