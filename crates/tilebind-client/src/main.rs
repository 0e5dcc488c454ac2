//! Session simulator
//!
//! Replays a short session against in-memory collaborators and prints the
//! tile table after every step:
//! 1. attendee `a1` publishes track `t1`, which reports its size late
//! 2. `a1`'s external user id arrives on the presence feed
//! 3. `a1` republishes as `t2`, replacing the first tile
//! 4. `t2` ends
//!
//! Usage: `tilebind-sim [config-file]`

use std::path::PathBuf;
use std::time::Duration;

use anyhow::Result;
use serde::Serialize;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use tilebind_client::load_binding_config;
use tilebind_media::memory::SimulatedSession;
use tilebind_media::{RemovableObserver, RemoteVideoObserver};
use tilebind_protocol::{CapabilitySnapshot, NegotiationMode, PresenceEvent, Tile};

#[derive(Serialize)]
struct Step<'a> {
    step: &'a str,
    tiles: Vec<Tile>,
}

fn print_tiles(session: &SimulatedSession, step: &str) -> Result<()> {
    let snapshot = Step {
        step,
        tiles: session.tiles.tiles(),
    };
    println!("{}", serde_json::to_string_pretty(&snapshot)?);
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "tilebind_sim=debug,tilebind_client=debug,tilebind_media=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    tracing::info!("Starting Tilebind session simulator...");

    let config_path = std::env::args().nth(1).map(PathBuf::from);
    let config = load_binding_config(config_path.as_deref())?;
    tracing::info!(
        "Presence timeout {}ms, backoff {}..{}ms (max attempts {:?})",
        config.presence_timeout_ms,
        config.backoff.short_bound_ms,
        config.backoff.long_bound_ms,
        config.backoff.max_attempts
    );

    let session = SimulatedSession::new(NegotiationMode::UnifiedPlan);
    let observer = RemoteVideoObserver::install(session.context(), &config);

    // Dimensions show up on the third read
    let (first, first_stream) = session.remote_video("t1", "a1", Some(1));
    first.reveal_dimensions_after(CapabilitySnapshot::new(1280, 720), 2);
    session.transport.add_track(first, first_stream);
    print_tiles(&session, "t1 added")?;

    tokio::time::sleep(Duration::from_millis(50)).await;
    let delivered = session.presence.publish(&PresenceEvent {
        attendee_id: "a1".to_string(),
        present: true,
        external_user_id: Some("ext-7".to_string()),
    });
    tracing::info!("Presence for a1 delivered to {} subscribers", delivered);
    session.identity.insert("a1", "ext-7");
    print_tiles(&session, "a1 presence")?;

    let (second, second_stream) = session.remote_video("t2", "a1", Some(2));
    second.set_settings(CapabilitySnapshot::new(1920, 1080));
    session.transport.add_track(second, second_stream.clone());
    print_tiles(&session, "t2 added")?;

    second_stream.remove_track("t2");
    print_tiles(&session, "t2 removed")?;

    observer.teardown();
    tracing::info!(
        "Simulation done: {} presence subscriptions, {} released",
        session.presence.subscribe_count(),
        session.presence.unsubscribe_count()
    );

    Ok(())
}
