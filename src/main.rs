use anyhow::{Context, Result, bail};
use carelink::calls::CallHandle;
use carelink::media::{LoopbackMedia, PeerConnectionState};
use carelink::relay::InMemoryRelay;
use carelink::{CallMedia, Client, ClientConfig, Event, EventHandler, UserId};
use carelink_core::RelayPaths;
use chrono::Local;
use clap::{Parser, ValueEnum};
use log::info;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;

// Two clients on one in-memory relay, talking through loopback media.
//
// Usage:
//   cargo run --bin carelink-demo                         # every scenario
//   cargo run --bin carelink-demo -- --scenario decline   # just one
//   RUST_LOG=debug cargo run --bin carelink-demo          # envelope-level logs

#[derive(Clone, Copy, Debug, PartialEq, Eq, ValueEnum)]
enum Scenario {
    Clean,
    Abort,
    Decline,
    Drop,
    All,
}

#[derive(Parser)]
#[command(name = "carelink-demo")]
#[command(about = "Run caregiver/VIU call scenarios over an in-memory relay")]
struct Args {
    #[arg(short, long, value_enum, default_value = "all")]
    scenario: Scenario,

    /// Place audio-only calls.
    #[arg(long)]
    audio: bool,

    #[arg(long, default_value = "caregiver_7")]
    caller: String,

    #[arg(long, default_value = "viu_42")]
    callee: String,

    #[arg(long, default_value_t = 45)]
    ring_timeout_secs: u64,

    #[arg(long, default_value_t = 30)]
    negotiation_timeout_secs: u64,
}

/// Logs every event and hands it to the scenario driving this party.
struct Narrator {
    who: UserId,
    tx: mpsc::UnboundedSender<Event>,
}

impl EventHandler for Narrator {
    fn handle_event(&self, event: &Event) {
        match event {
            Event::SignalReceived(envelope) => {
                log::debug!(target: "Demo", "[{}] <- {} from {}", self.who, envelope.kind, envelope.sender)
            }
            other => info!(target: "Demo", "[{}] {other:?}", self.who),
        }
        let _ = self.tx.send(event.clone());
    }
}

struct Party {
    id: UserId,
    client: Client,
    calls: CallHandle,
    events: mpsc::UnboundedReceiver<Event>,
    media: Arc<LoopbackMedia>,
}

impl Party {
    async fn join(relay: &InMemoryRelay, id: &UserId, config: &ClientConfig) -> Result<Self> {
        let media = Arc::new(LoopbackMedia::new());
        let client = Client::new(id.clone(), Arc::new(relay.clone()), media.clone(), config.clone());
        let (tx, events) = mpsc::unbounded_channel();
        client.add_event_handler(Arc::new(Narrator { who: id.clone(), tx }));
        let calls = client.connect().await?;
        Ok(Self {
            id: id.clone(),
            client,
            calls,
            events,
            media,
        })
    }

    async fn wait_for_event(
        &mut self,
        what: &str,
        predicate: impl Fn(&Event) -> bool,
    ) -> Result<Event> {
        let wait = async {
            while let Some(event) = self.events.recv().await {
                if predicate(&event) {
                    return Some(event);
                }
            }
            None
        };
        match tokio::time::timeout(Duration::from_secs(10), wait).await {
            Ok(Some(event)) => Ok(event),
            Ok(None) => bail!("{}: event stream closed before {what}", self.id),
            Err(_) => bail!("{}: timed out waiting for {what}", self.id),
        }
    }
}

async fn run_scenario(scenario: Scenario, args: &Args, config: &ClientConfig) -> Result<()> {
    info!(target: "Demo", "=== {scenario:?} ===");
    let caller_id: UserId = args.caller.parse().context("invalid caller id")?;
    let callee_id: UserId = args.callee.parse().context("invalid callee id")?;
    let media = if args.audio {
        CallMedia::Audio
    } else {
        CallMedia::Video
    };

    let relay = InMemoryRelay::new();
    let paths = RelayPaths::new(config.relay_root.as_str());
    relay.register_user(&paths, &caller_id);
    relay.register_user(&paths, &callee_id);

    let mut caller = Party::join(&relay, &caller_id, config).await?;
    let mut callee = Party::join(&relay, &callee_id, config).await?;

    caller.calls.call(&callee.id, media).await?;
    callee
        .wait_for_event("incoming call", |e| matches!(e, Event::IncomingCall(_)))
        .await?;

    match scenario {
        Scenario::Abort => {
            caller.calls.hang_up().await?;
            callee
                .wait_for_event("abort", |e| matches!(e, Event::CallAborted(_)))
                .await?;
        }
        Scenario::Decline => {
            callee.calls.decline().await?;
            caller
                .wait_for_event("denial", |e| matches!(e, Event::CallDenied(_)))
                .await?;
        }
        Scenario::Clean | Scenario::Drop => {
            callee.calls.accept().await?;
            caller
                .wait_for_event("connection", |e| matches!(e, Event::CallConnected(_)))
                .await?;
            callee
                .wait_for_event("connection", |e| matches!(e, Event::CallConnected(_)))
                .await?;
            info!(
                target: "Demo",
                "{} sees {} as {}",
                callee.id,
                caller.id,
                callee.client.channel().status_of(&caller.id).await?
            );

            if scenario == Scenario::Clean {
                caller.calls.set_audio_muted(true).await?;
                caller.calls.switch_camera().await?;
                info!(
                    target: "Demo",
                    "Caller session: {}",
                    serde_json::to_string(&caller.calls.snapshot())?
                );
                caller.calls.hang_up().await?;
                callee
                    .wait_for_event("hang-up", |e| matches!(e, Event::CallEnded(_)))
                    .await?;
            } else {
                caller.media.simulate_state(PeerConnectionState::Failed).await;
                caller
                    .wait_for_event("connection loss", |e| matches!(e, Event::ConnectionLost(_)))
                    .await?;
                callee
                    .media
                    .simulate_state(PeerConnectionState::Disconnected)
                    .await;
                callee
                    .wait_for_event("connection loss", |e| matches!(e, Event::ConnectionLost(_)))
                    .await?;
            }
        }
        Scenario::All => bail!("`all` is expanded before running"),
    }

    caller.client.logout().await?;
    callee.client.logout().await?;
    Ok(())
}

fn main() -> Result<()> {
    let args = Args::parse();

    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info"))
        .format(|buf, record| {
            use std::io::Write;
            writeln!(
                buf,
                "{} [{:<5}] [{}] - {}",
                Local::now().format("%H:%M:%S"),
                record.level(),
                record.target(),
                record.args()
            )
        })
        .init();

    let config = ClientConfig {
        ring_timeout: Duration::from_secs(args.ring_timeout_secs),
        negotiation_timeout: Duration::from_secs(args.negotiation_timeout_secs),
        ..ClientConfig::default()
    };

    let scenarios = match args.scenario {
        Scenario::All => vec![
            Scenario::Clean,
            Scenario::Abort,
            Scenario::Decline,
            Scenario::Drop,
        ],
        one => vec![one],
    };

    let rt = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("failed to build tokio runtime")?;

    rt.block_on(async {
        for scenario in scenarios {
            run_scenario(scenario, &args, &config).await?;
        }
        info!(target: "Demo", "All scenarios finished");
        Ok(())
    })
}
