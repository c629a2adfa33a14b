//! Drives simulated games through the threaded engine and echoes inputs back
//! as replies.

use std::path::PathBuf;
use std::thread::{self, JoinHandle};

use anyhow::{anyhow, bail, Context, Result};
use batch::{Allocator, Batch, ExchangeConfig, Reply};
use clap::{Parser, Subcommand};
use dispatch::{Dispatcher, DispatcherConfig};
use engine_native::{Client, NativeError, Row, ThreadedEngine};
use smem::{batch_shape, Array, ElementType};
use tracing::{debug, info};
use tracing_subscriber::{fmt, EnvFilter};

const DEFAULT_CONFIG: &str = r#"
[alloc]
default_capacity = 8

[fields]
x = { type = "int32", shape = [1] }
obs = { type = "float32", shape = [4] }
y = { type = "int32", shape = [1] }
pad = { type = "uint8", shape = [2] }

[[channels]]
name = "echo"
input = ["x", "obs"]
reply = ["y", "pad"]
timeout_us = 500
num_slots = 2
"#;

#[derive(Parser, Debug)]
#[command(author, version, about = "Shared-memory batch exchange demo", long_about = None)]
struct Cli {
    /// Channel config (TOML, or JSON by extension). Defaults to a built-in
    /// echo channel.
    #[arg(long, short, value_name = "PATH", global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Print the slots and buffers the config allocates.
    Inspect,
    /// Run simulated games against every channel.
    ///
    /// Channels need a non-zero timeout so the last partial batch drains.
    Run {
        /// Game threads per channel.
        #[arg(long, default_value_t = 4)]
        games: usize,

        /// Rows each game submits.
        #[arg(long, default_value_t = 1000)]
        steps: usize,

        /// Extra input field appended to every channel (repeatable).
        #[arg(long = "label", value_name = "FIELD")]
        labels: Vec<String>,
    },
}

fn main() -> Result<()> {
    init_tracing();
    let cli = Cli::parse();
    let mut config = load_config(cli.config.as_ref())?;
    match cli.command {
        Command::Inspect => {
            let allocator = Allocator::from_config(&config).context("invalid channel config")?;
            println!("{}", allocator.info());
        }
        Command::Run {
            games,
            steps,
            labels,
        } => {
            let labels: Vec<&str> = labels.iter().map(String::as_str).collect();
            config.add_input_labels(&labels);
            run(&config, games, steps)?;
        }
    }
    Ok(())
}

fn init_tracing() {
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let _ = fmt().with_env_filter(env_filter).try_init();
}

fn load_config(path: Option<&PathBuf>) -> Result<ExchangeConfig> {
    match path {
        Some(path) => ExchangeConfig::from_path(path)
            .with_context(|| format!("failed to load {}", path.display())),
        None => ExchangeConfig::from_toml_str(DEFAULT_CONFIG).context("built-in config"),
    }
}

/// Where one reply field's values come from.
#[derive(Clone, Debug, PartialEq)]
struct EchoField {
    key: String,
    elem: ElementType,
    row_shape: Vec<usize>,
    /// Input with the same element type and row shape, if any.
    source: Option<String>,
}

#[derive(Clone, Debug)]
struct InputField {
    key: String,
    elem: ElementType,
    row_elems: usize,
}

/// Reply and input layout of one channel, taken from its first slot.
#[derive(Clone, Debug)]
struct ChannelPlan {
    channel: String,
    inputs: Vec<InputField>,
    echo: Vec<EchoField>,
}

fn plans(allocator: &Allocator) -> Vec<ChannelPlan> {
    allocator
        .channels()
        .filter_map(|channel| {
            let first = *allocator.slots_of(channel)?.first()?;
            let slot = allocator.slot(first)?;
            let inputs: Vec<InputField> = slot
                .input_keys()
                .filter_map(|key| slot.buffer(key))
                .map(|buffer| InputField {
                    key: buffer.name().to_owned(),
                    elem: buffer.elem(),
                    row_elems: buffer.row_shape().iter().product(),
                })
                .collect();
            let echo = slot
                .reply_keys()
                .filter_map(|key| slot.buffer(key))
                .map(|buffer| {
                    let source = slot
                        .input_keys()
                        .filter_map(|key| slot.buffer(key))
                        .find(|input| {
                            input.elem() == buffer.elem() && input.row_shape() == buffer.row_shape()
                        })
                        .map(|input| input.name().to_owned());
                    EchoField {
                        key: buffer.name().to_owned(),
                        elem: buffer.elem(),
                        row_shape: buffer.row_shape().to_vec(),
                        source,
                    }
                })
                .collect();
            Some(ChannelPlan {
                channel: channel.to_owned(),
                inputs,
                echo,
            })
        })
        .collect()
}

/// Copies each reply field from its matching input, or zeros it.
fn echo(fields: &[EchoField], batch: &Batch<'_>) -> anyhow::Result<Option<Reply>> {
    if fields.is_empty() {
        return Ok(None);
    }
    let mut reply = Reply::new();
    for field in fields {
        let value = match &field.source {
            Some(input) => batch.array(input)?,
            None => Array::zeros(field.elem, &batch_shape(batch.len(), &field.row_shape)),
        };
        reply.insert(field.key.clone(), value);
    }
    Ok(Some(reply))
}

fn game_row(inputs: &[InputField], value: usize) -> Row {
    inputs.iter().fold(Row::new(), |row, field| {
        let n = field.row_elems;
        match field.elem {
            ElementType::Int32 => row.with(field.key.as_str(), vec![value as i32; n]),
            ElementType::Int64 => row.with(field.key.as_str(), vec![value as i64; n]),
            ElementType::Float32 => row.with(field.key.as_str(), vec![value as f32; n]),
            ElementType::UInt8 => row.with(field.key.as_str(), vec![value as u8; n]),
        }
    })
}

/// Submits `steps` rows and counts echoed values that came back different.
fn play(client: Client, plan: ChannelPlan, game: usize, steps: usize) -> Result<u64, NativeError> {
    let mut mismatches = 0;
    for step in 0..steps {
        let row = game_row(&plan.inputs, game * steps + step);
        let reply = client.call(&row)?;
        for field in &plan.echo {
            let Some(source) = &field.source else {
                continue;
            };
            let sent = row.get(source).map(|data| data.as_bytes());
            let got = reply.get(&field.key).map(|array| array.as_bytes());
            if sent != got {
                mismatches += 1;
            }
        }
    }
    Ok(mismatches)
}

fn run(config: &ExchangeConfig, games: usize, steps: usize) -> Result<()> {
    let allocator = Allocator::from_config(config).context("invalid channel config")?;
    debug!("allocated slots:\n{}", allocator.info());
    let plans = plans(&allocator);

    let mut dispatcher: Dispatcher<ThreadedEngine, ()> =
        Dispatcher::new(allocator, ThreadedEngine::new(), DispatcherConfig::default())?;
    for plan in &plans {
        let fields = plan.echo.clone();
        dispatcher.register(&plan.channel, move |batch, _: &mut ()| echo(&fields, batch))?;
    }
    dispatcher.start()?;

    let mut players: Vec<JoinHandle<Result<u64, NativeError>>> = Vec::new();
    for plan in &plans {
        for game in 0..games {
            let client = dispatcher.engine().client(&plan.channel)?;
            let plan = plan.clone();
            players.push(thread::spawn(move || play(client, plan, game, steps)));
        }
    }
    info!(
        "running {} games over {} channels",
        players.len(),
        plans.len()
    );

    let stop = dispatcher.stop_handle();
    let referee = thread::spawn(move || {
        let mut mismatches = 0;
        let mut failures = 0;
        for player in players {
            match player.join() {
                Ok(Ok(count)) => mismatches += count,
                Ok(Err(err)) => {
                    tracing::error!("game failed: {err}");
                    failures += 1;
                }
                Err(_) => failures += 1,
            }
        }
        stop.stop();
        (mismatches, failures)
    });

    let stats = dispatcher.run_until_stopped(&mut ())?;
    let native = dispatcher.engine().stats();
    let (mismatches, failures) = referee
        .join()
        .map_err(|_| anyhow!("referee thread panicked"))?;

    println!(
        "cycles={} rows={} mean_batch={:.2} idle_waits={} partial_batches={}",
        stats.cycles,
        stats.rows,
        stats.mean_batch(),
        stats.idle_waits,
        native.partial_batches
    );
    for (channel, cycles) in &stats.per_channel {
        println!("  {channel}: {cycles} cycles");
    }
    if failures > 0 {
        bail!("{failures} games failed");
    }
    if mismatches > 0 {
        bail!("{mismatches} echoed values differed from their inputs");
    }
    Ok(())
}
