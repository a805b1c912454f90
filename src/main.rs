use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, anyhow, bail};
use chrono::Local;
use clap::Parser;
use log::{error, info, warn};
use tokio::sync::broadcast::{self, error::RecvError};

use roomcall::loopback::{LoopbackDevices, LoopbackFactory, LoopbackNetwork};
use roomcall::relay::MemoryRelay;
use roomcall::{CallConfig, CallController, CallEnv, CallEvent};

// Two participants in one room, calling each other over an in-process relay.
//
// Usage:
//   cargo run                                # audio-only call
//   cargo run -- --video --screen-share      # camera, then a screen share
//   cargo run -- --auto-start                # alice starts the call by speaking

#[derive(Parser)]
#[command(name = "roomcall-demo")]
#[command(about = "Room call signaling demo over a loopback network")]
struct Cli {
    #[arg(long)]
    video: bool,

    /// Share alice's screen once connected, then end the capture.
    #[arg(long)]
    screen_share: bool,

    /// Start the call hands-free from simulated speech.
    #[arg(long)]
    auto_start: bool,

    #[arg(short, long, default_value = "demo-room")]
    room: String,

    /// JSON file with a `CallConfig`.
    #[arg(short, long)]
    config: Option<PathBuf>,

    #[arg(long, default_value_t = 10)]
    timeout_secs: u64,
}

fn participant(
    uid: &str,
    config: CallConfig,
    relay: &Arc<MemoryRelay>,
    network: &LoopbackNetwork,
    devices: Arc<LoopbackDevices>,
) -> Result<CallController, anyhow::Error> {
    let env = CallEnv::new(
        uid,
        config,
        relay.clone(),
        Arc::new(LoopbackFactory::new(network.clone())),
        devices,
    );
    Ok(CallController::new(env)?)
}

async fn wait_for(
    events: &mut broadcast::Receiver<CallEvent>,
    within: Duration,
    what: &str,
    pred: impl Fn(&CallEvent) -> bool,
) -> Result<CallEvent, anyhow::Error> {
    let waiting = async {
        loop {
            match events.recv().await {
                Ok(event) if pred(&event) => return Ok(event),
                Ok(_) => {}
                Err(RecvError::Lagged(n)) => warn!("Event listener lagged by {n}"),
                Err(RecvError::Closed) => bail!("event bus closed while waiting for {what}"),
            }
        }
    };
    tokio::time::timeout(within, waiting)
        .await
        .map_err(|_| anyhow!("timed out waiting for {what}"))?
}

async fn speak(devices: &LoopbackDevices, frames: u32) {
    let mut fed = 0;
    for _ in 0..500 {
        if fed >= frames {
            return;
        }
        if devices.feed_microphone(vec![0.3; 480]) {
            fed += 1;
        } else {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }
    warn!("Microphone never opened; speech not delivered");
}

#[tokio::main]
async fn main() -> Result<(), anyhow::Error> {
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

    let cli = Cli::parse();
    // Sharing needs a sending video line.
    let video = cli.video || cli.screen_share;
    let timeout = Duration::from_secs(cli.timeout_secs);
    let config = match &cli.config {
        Some(path) => {
            let json = std::fs::read_to_string(path)
                .with_context(|| format!("reading {}", path.display()))?;
            CallConfig::from_json(&json)?
        }
        None => CallConfig::default(),
    };

    let relay = Arc::new(MemoryRelay::new());
    let network = LoopbackNetwork::new();
    let participants = vec!["alice".to_string(), "bob".to_string()];

    let mut alice_config = config.clone();
    alice_config.speech.enabled = cli.auto_start;
    let speech_frames = alice_config.speech.required_frames;
    let alice_devices = LoopbackDevices::new();
    let alice = participant("alice", alice_config, &relay, &network, alice_devices.clone())?;
    let bob = participant("bob", config, &relay, &network, LoopbackDevices::new())?;

    let mut alice_events = alice.subscribe_events();
    let mut bob_events = bob.subscribe_events();
    let mut bob_incoming = bob.subscribe_events();

    alice.enter_room(&cli.room, participants.clone()).await?;
    bob.enter_room(&cli.room, participants).await?;

    // Bob picks up every incoming call.
    let answering = tokio::spawn({
        let bob = bob.clone();
        async move {
            while let Ok(event) = bob_incoming.recv().await {
                if let CallEvent::IncomingCall { call_id, .. } = event {
                    match bob.join_call(&call_id, video).await {
                        Ok(attempt) => info!("bob: {attempt:?}"),
                        Err(e) => error!("bob could not join {call_id}: {e}"),
                    }
                }
            }
        }
    });

    if cli.auto_start {
        info!("Simulating speech at alice's microphone");
        speak(&alice_devices, speech_frames).await;
    } else {
        let attempt = alice.start_call(video).await?;
        info!("alice: {attempt:?}");
    }

    wait_for(&mut alice_events, timeout, "alice to connect", |e| {
        matches!(e, CallEvent::PeerConnected { .. })
    })
    .await?;
    wait_for(&mut bob_events, timeout, "bob to connect", |e| {
        matches!(e, CallEvent::PeerConnected { .. })
    })
    .await?;
    info!("Both participants connected");

    if cli.screen_share {
        alice
            .start_screen_share()
            .await
            .context("starting screen share")?;
        tokio::time::sleep(Duration::from_millis(200)).await;
        info!("Ending alice's display capture");
        alice_devices.end_display_capture();
        wait_for(&mut alice_events, timeout, "screen share to stop", |e| {
            matches!(e, CallEvent::ScreenShareStopped { .. })
        })
        .await?;
    }

    for controller in [&alice, &bob] {
        if let Some(snapshot) = controller.session_snapshot().await {
            info!("{}: {snapshot:?}", controller.local_uid());
        }
    }

    alice.end_call().await?;
    wait_for(&mut bob_events, timeout, "bob to see the call end", |e| {
        matches!(e, CallEvent::CallEnded { .. })
    })
    .await?;
    info!("Room is {:?}", alice.room_status().await);

    answering.abort();
    alice.leave_room().await;
    bob.leave_room().await;
    Ok(())
}
