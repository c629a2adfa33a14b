use std::collections::BTreeMap;
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use batch::{Allocator, Batch, ExchangeConfig, Reply};
use dispatch::{Dispatcher, DispatcherConfig};
use engine_native::{Row, ThreadedEngine};
use parking_lot::Mutex;
use rand::{Rng, SeedableRng};

const CONFIG: &str = r#"
[alloc]
default_capacity = 4

[fields]
obs = { type = "float32", shape = [2] }
act = { type = "int64", shape = [1] }
id = { type = "int32", shape = [1] }

[[channels]]
name = "actor"
input = ["obs", "id"]
reply = ["act"]
timeout_us = 1000
num_slots = 2

[[channels]]
name = "train"
input = ["obs", "id"]
batchsize = 8
timeout_us = 1000
"#;

/// Rows seen per channel, shared between the callbacks and the test body.
#[derive(Default)]
struct Tally {
    rows: BTreeMap<String, usize>,
}

fn actor(batch: &Batch<'_>) -> anyhow::Result<Option<Reply>> {
    let ids = batch.get::<i32>("id")?;
    let obs = batch.get::<f32>("obs")?;
    let act: Vec<i64> = ids
        .iter()
        .zip(obs.chunks(2))
        .map(|(id, pair)| *id as i64 + (pair[0] + pair[1]) as i64)
        .collect();
    Ok(Some(Reply::new().with("act", act)))
}

fn row(id: i32, step: usize) -> Row {
    Row::new()
        .with("obs", vec![step as f32, 1.0])
        .scalar("id", id)
}

#[test]
fn actor_and_trainer_channels_run_side_by_side() {
    let _ = env_logger::builder().is_test(true).try_init();
    const GAMES: i32 = 6;
    const STEPS: usize = 40;

    let config = ExchangeConfig::from_toml_str(CONFIG).expect("config");
    let allocator = Allocator::from_config(&config).expect("allocator");
    let tally = Arc::new(Mutex::new(Tally::default()));

    let actor_tally = Arc::clone(&tally);
    let train_tally = Arc::clone(&tally);
    let mut d = Dispatcher::builder(allocator, ThreadedEngine::new())
        .config(DispatcherConfig {
            wait_timeout: Some(Duration::from_millis(20)),
        })
        .on("actor", move |batch, _: &mut ()| {
            *actor_tally.lock().rows.entry("actor".into()).or_default() += batch.len();
            actor(batch)
        })
        .on("train", move |batch, _: &mut ()| {
            *train_tally.lock().rows.entry("train".into()).or_default() += batch.len();
            assert!(batch.len() <= 8);
            Ok(None)
        })
        .build()
        .expect("build");
    d.start().expect("start");

    let games: Vec<_> = (0..GAMES)
        .map(|id| {
            let act = d.engine().client("actor").expect("actor");
            let train = d.engine().client("train").expect("train");
            thread::spawn(move || {
                let mut rng = rand::rngs::StdRng::seed_from_u64(id as u64);
                for step in 0..STEPS {
                    let reply = act.call(&row(id, step)).expect("actor reply");
                    let expected = id as i64 + step as i64 + 1;
                    assert_eq!(reply.value::<i64>("act"), Some(&[expected][..]));
                    if rng.gen_bool(0.5) {
                        let ack = train.call(&row(id, step)).expect("train ack");
                        assert!(ack.is_empty());
                    }
                }
            })
        })
        .collect();

    let stop = d.stop_handle();
    let referee = thread::spawn(move || {
        for game in games {
            game.join().expect("game thread");
        }
        stop.stop();
    });
    let stats = d.run_until_stopped(&mut ()).expect("dispatch");
    referee.join().expect("referee");

    let tally = tally.lock();
    let actor_rows = GAMES as usize * STEPS;
    assert_eq!(tally.rows.get("actor"), Some(&actor_rows));
    let train_rows = tally.rows.get("train").copied().unwrap_or(0);
    assert_eq!(stats.rows as usize, actor_rows + train_rows);
    assert_eq!(
        stats.channel_cycles("actor").unwrap_or(0) + stats.channel_cycles("train").unwrap_or(0),
        stats.cycles
    );
    assert_eq!(d.engine().stats().rows, stats.rows);
}
