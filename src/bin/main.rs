use std::error::Error;
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use clap::{Args, Parser, Subcommand};
use fabric_bridge::config::{BridgeSettings, load_user_config};
use fabric_bridge::native::NativeValue;
use fabric_bridge::{
    AckMode, HostLoop, HostMessage, HostValue, LockResultExt, OutboundMessage,
    PublicationEventKind, Qos, ReplayEvent, ReplayEventKind, ReplayOptions, RunOutcome,
    SendOptions, Session, SessionEvent, SessionEventKind, SimulatedFabric,
    SubscriptionOptions, Timestamp, connect_blocking,
};
use ulid::Ulid;

type CliResult<T> = Result<T, Box<dyn Error>>;

/// Demo programs for the messaging fabric binding, run against an
/// in-process simulated fabric
#[derive(Parser)]
#[command(name = "fabric-bridge")]
#[command(version)]
#[command(about = "Demo programs for the messaging fabric binding")]
struct Cli {
    #[command(flatten)]
    connection: ConnectionArgs,

    /// Settings file (default: the user config file, if present)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Enable debug logging (RUST_LOG takes precedence)
    #[arg(long, global = true)]
    verbose: bool,

    /// Print received messages as JSON
    #[arg(long, global = true)]
    json: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Args)]
struct ConnectionArgs {
    /// Login user name
    #[arg(long, global = true)]
    user: Option<String>,

    /// Login password
    #[arg(long, global = true)]
    pass: Option<String>,

    /// Primary and optional secondary TMX, as primary[:secondary]
    #[arg(long, global = true)]
    tmx: Option<String>,

    /// Enable guaranteed delivery under this client name
    #[arg(long, global = true)]
    gdname: Option<String>,
}

#[derive(Subcommand)]
enum Commands {
    /// Measure publish-to-subscriber latency
    Ping {
        #[arg(long, default_value = "PING")]
        topic: String,
        #[arg(long, default_value_t = 100)]
        count: usize,
        /// Gap between messages in milliseconds
        #[arg(long, default_value_t = 10)]
        delay: u64,
    },
    /// Publish a number of messages
    Pub {
        #[arg(long, default_value = "TEST.BULK.0")]
        topic: String,
        #[arg(long, default_value_t = 100)]
        count: usize,
        /// Gap between messages in milliseconds
        #[arg(long, default_value_t = 10)]
        delay: u64,
        /// Topic QoS: BE, GC or GD
        #[arg(long, default_value = "GC")]
        qos: Qos,
    },
    /// Subscribe for a while, printing what arrives
    Sub {
        #[arg(long, default_value = "TEST.BULK.*")]
        topic: String,
        /// Test duration in seconds
        #[arg(long, default_value_t = 5)]
        duration: u64,
        /// Subscription QoS: BE, GC or GD
        #[arg(long, default_value = "BE")]
        qos: Qos,
        /// GD acknowledgment mode: auto or manual
        #[arg(long, default_value = "auto")]
        ackmode: AckMode,
        /// GD subscription name
        #[arg(long, default_value = "demo-sub")]
        name: String,
    },
    /// Record a history, then replay it
    Replay {
        #[arg(long, default_value = "REPLAY.DATA")]
        topic: String,
        #[arg(long, default_value_t = 10)]
        count: usize,
    },
}

fn init_logging(verbose: bool) {
    let default = if verbose { "debug" } else { "warn" };
    let _ = env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(default))
        .format_timestamp_millis()
        .try_init();
}

fn load_settings(path: Option<&PathBuf>) -> CliResult<BridgeSettings> {
    let settings = match path {
        Some(path) => BridgeSettings::load(path)?,
        None => load_user_config()?.unwrap_or_default(),
    };
    Ok(settings)
}

/// Run the host loop until `done` holds or `timeout` elapses.
fn pump_until(host: &mut HostLoop, timeout: Duration, mut done: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    while !done() {
        let remaining = deadline.saturating_duration_since(Instant::now());
        if remaining.is_zero() {
            return false;
        }
        if host.run_for(remaining.min(Duration::from_millis(10))) == RunOutcome::Idle {
            return done();
        }
    }
    true
}

fn pump_for(host: &mut HostLoop, duration: Duration) {
    pump_until(host, duration, || false);
}

fn print_message(message: &HostMessage, json: bool) {
    if json {
        println!("{}", message.to_json());
    } else {
        let fields: Vec<String> = message
            .fields
            .iter()
            .map(|field| format!("{}={:?}", field.name, field.value))
            .collect();
        println!("{} [{}]", message.topic, fields.join(", "));
    }
}

struct Demo {
    host: HostLoop,
    sim: SimulatedFabric,
    session: Session,
    run_id: Ulid,
}

impl Demo {
    fn connect(cli: &Cli) -> CliResult<Self> {
        let settings = load_settings(cli.config.as_ref())?;
        let args = &cli.connection;
        let options = settings.connect_options(
            args.user.as_deref(),
            args.pass.as_deref(),
            args.tmx.as_deref(),
            args.gdname.as_deref(),
        )?;
        let host = HostLoop::with_settings(&settings.host)?;
        let sim = SimulatedFabric::new();
        let session = connect_blocking(&host.handle(), Arc::new(sim.clone()), options)?;
        session.on(SessionEventKind::Notify, |event| {
            if let SessionEvent::Notify { code, message } = event {
                println!("* Session notification {} : {}", code.code(), message);
            }
            Ok(())
        })?;
        session.on(SessionEventKind::ConnectionInfo, |event| {
            if let SessionEvent::ConnectionInfo { active, standby } = event {
                match standby {
                    Some(standby) => println!("Connected to {active} (standby {standby})"),
                    None => println!("Connected to {active}"),
                }
            }
            Ok(())
        })?;
        let run_id = Ulid::new();
        log::info!("Run {} logged in", run_id);
        Ok(Self {
            host,
            sim,
            session,
            run_id,
        })
    }

    fn close(mut self) -> CliResult<()> {
        self.session.close_blocking()?;
        if self.host.run_for(Duration::from_secs(2)) == RunOutcome::TimedOut {
            log::debug!("Host loop still busy after close");
        }
        println!("Done.");
        Ok(())
    }
}

fn ping(cli: &Cli, topic: &str, count: usize, delay: Duration) -> CliResult<()> {
    let mut demo = Demo::connect(cli)?;
    let subscription = demo
        .session
        .create_subscription_blocking(topic, SubscriptionOptions::best_effort())?;
    let publication = demo.session.create_publication_blocking(topic)?;

    let latencies = Arc::new(Mutex::new(Vec::with_capacity(count)));
    let sink = Arc::clone(&latencies);
    subscription.on_message(move |message| {
        if let Some(HostValue::Date(sent)) = message.get("sent") {
            let latency = Timestamp::now().saturating_since(*sent);
            sink.lock().recover_poison("ping").push(latency);
        }
        Ok(())
    })?;

    let started = Instant::now();
    for seq in 0..count {
        let message = OutboundMessage::new()
            .with("run", demo.run_id.to_string())
            .with("seq", seq as i32)
            .with("sent", Timestamp::now());
        publication.send_message(topic, message, SendOptions::default())?;
        pump_for(&mut demo.host, delay);
    }
    let received = |latencies: &Arc<Mutex<Vec<Duration>>>| {
        latencies.lock().recover_poison("ping").len()
    };
    if !pump_until(&mut demo.host, Duration::from_secs(5), || {
        received(&latencies) >= count
    }) {
        println!("Timed out with {} of {} replies", received(&latencies), count);
    }
    let elapsed = started.elapsed();

    let latencies = latencies.lock().recover_poison("ping").clone();
    if let (Some(min), Some(max)) = (latencies.iter().min(), latencies.iter().max()) {
        let total: Duration = latencies.iter().sum();
        let average = total / latencies.len() as u32;
        println!(
            "{} messages in {:?}: min {:?}, avg {:?}, max {:?}",
            latencies.len(),
            elapsed,
            min,
            average,
            max
        );
    }

    subscription.stop_blocking()?;
    publication.stop_blocking()?;
    demo.close()
}

fn publish(cli: &Cli, topic: &str, count: usize, delay: Duration, qos: Qos) -> CliResult<()> {
    let mut demo = Demo::connect(cli)?;
    demo.sim.set_topic_qos(topic, qos);
    let publication = demo.session.create_publication_blocking(topic)?;

    let completed = Arc::new(AtomicUsize::new(0));
    let failed = Arc::new(AtomicUsize::new(0));
    let (done, errors) = (Arc::clone(&completed), Arc::clone(&failed));
    publication.on(PublicationEventKind::Message, move |result| {
        done.fetch_add(1, Ordering::Relaxed);
        if let Some(error) = &result.error {
            errors.fetch_add(1, Ordering::Relaxed);
            eprintln!("Send on {} failed: {}", result.topic, error);
        }
        Ok(())
    })?;

    let started = Instant::now();
    for seq in 0..count {
        let message = OutboundMessage::new()
            .with("run", demo.run_id.to_string())
            .with("seq", seq as i32)
            .with("payload", vec![1.5, 2.5, 3.5]);
        publication.send_message(topic, message, SendOptions::default())?;
        pump_for(&mut demo.host, delay);
    }
    pump_until(&mut demo.host, Duration::from_secs(5), || {
        completed.load(Ordering::Relaxed) >= count
    });
    println!(
        "Published {} messages ({} failed, QoS {}) in {:?}",
        completed.load(Ordering::Relaxed),
        failed.load(Ordering::Relaxed),
        publication.qos(),
        started.elapsed()
    );

    publication.stop_blocking()?;
    demo.close()
}

/// A concrete topic matching `pattern`.
fn concrete_topic(pattern: &str) -> String {
    pattern
        .split('.')
        .map(|segment| match segment {
            "*" | ">" => "0",
            other => other,
        })
        .collect::<Vec<_>>()
        .join(".")
}

fn subscribe(
    cli: &Cli,
    topic: &str,
    duration: Duration,
    options: SubscriptionOptions,
) -> CliResult<()> {
    let mut demo = Demo::connect(cli)?;
    let manual = options.ack_mode == AckMode::Manual;
    let subscription = demo.session.create_subscription_blocking(topic, options)?;

    let received = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&received);
    let json = cli.json;
    let acker = subscription.clone();
    subscription.on_message(move |message| {
        counter.fetch_add(1, Ordering::Relaxed);
        print_message(message, json);
        if manual {
            acker.acknowledge(message, |result| {
                if let Err(error) = result {
                    eprintln!("Acknowledge failed: {error}");
                }
                Ok(())
            })?;
        }
        Ok(())
    })?;

    // Stand-in for a remote publisher.
    let running = Arc::new(AtomicBool::new(true));
    let feeder = {
        let sim = demo.sim.clone();
        let running = Arc::clone(&running);
        let topic = concrete_topic(topic);
        thread::spawn(move || {
            let mut seq = 0;
            while running.load(Ordering::Relaxed) {
                sim.inject(&topic, vec![("seq", NativeValue::Int(seq))]);
                seq += 1;
                thread::sleep(Duration::from_millis(100));
            }
        })
    };

    pump_for(&mut demo.host, duration);
    running.store(false, Ordering::Relaxed);
    if feeder.join().is_err() {
        log::warn!("Feeder thread panicked");
    }
    println!("Received {} messages", received.load(Ordering::Relaxed));

    subscription.stop_blocking()?;
    demo.close()
}

fn replay(cli: &Cli, topic: &str, count: usize) -> CliResult<()> {
    let mut demo = Demo::connect(cli)?;
    let base = Timestamp::now().as_millis();
    for seq in 0..count {
        demo.sim.record_history(
            topic,
            vec![("seq", NativeValue::Int(seq as i32))],
            Timestamp::from_millis(base + seq as u64),
        );
    }
    let options = ReplayOptions::new(
        Timestamp::from_millis(base),
        Timestamp::from_millis(base + count as u64),
    );
    let replay = demo.session.create_replay_blocking(topic, options)?;

    let ended = Arc::new(AtomicBool::new(false));
    let json = cli.json;
    replay.on(ReplayEventKind::Message, move |event| {
        if let ReplayEvent::Message(message) = event {
            print_message(message, json);
        }
        Ok(())
    })?;
    let flag = Arc::clone(&ended);
    replay.on(ReplayEventKind::Finish, move |_| {
        println!("Replay finished");
        flag.store(true, Ordering::Relaxed);
        Ok(())
    })?;
    let flag = Arc::clone(&ended);
    replay.on(ReplayEventKind::Error, move |event| {
        if let ReplayEvent::Error { code, message } = event {
            println!("Replay error {} : {}", code.code(), message);
        }
        flag.store(true, Ordering::Relaxed);
        Ok(())
    })?;

    pump_until(&mut demo.host, Duration::from_secs(10), || {
        ended.load(Ordering::Relaxed)
    });
    if replay.stop_blocking().is_err() {
        log::debug!("Replay already closed");
    }
    demo.close()
}

fn run(cli: &Cli) -> CliResult<()> {
    match &cli.command {
        Commands::Ping {
            topic,
            count,
            delay,
        } => ping(cli, topic, *count, Duration::from_millis(*delay)),
        Commands::Pub {
            topic,
            count,
            delay,
            qos,
        } => publish(cli, topic, *count, Duration::from_millis(*delay), *qos),
        Commands::Sub {
            topic,
            duration,
            qos,
            ackmode,
            name,
        } => {
            let options = SubscriptionOptions {
                qos: *qos,
                name: Some(name.clone()),
                ack_mode: *ackmode,
            };
            subscribe(cli, topic, Duration::from_secs(*duration), options)
        }
        Commands::Replay { topic, count } => replay(cli, topic, *count),
    }
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    init_logging(cli.verbose);

    match run(&cli) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("Error: {}", e);
            ExitCode::FAILURE
        }
    }
}
