use std::sync::Arc;

use agent_realtime::audio::native::{CpalCapture, CpalPlayback};
use agent_realtime::types::{CredentialPayload, ServerFrame, TurnState};
use agent_realtime::{Client, ClientEvent, Config};
use tracing_subscriber::fmt::time::ChronoLocal;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv_override().ok();

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_timer(ChronoLocal::rfc_3339())
        .init();

    if std::env::args().any(|arg| arg == "--devices") {
        println!("inputs:\n{}", agent_realtime::utils::device::get_available_inputs()?);
        println!("outputs:\n{}", agent_realtime::utils::device::get_available_outputs()?);
        return Ok(());
    }

    let mut config = Config::builder();
    if let Ok(url) = std::env::var("AGENT_AUTH_URL") {
        config = config.with_auth_base_url(&url);
    }

    let client = Client::builder()
        .with_config(config.build())
        .with_capture(Arc::new(CpalCapture::new()))
        .with_playback(Arc::new(CpalPlayback::open(None)?))
        .build();

    // A pre-issued bundle wins; username/password is for local backends only.
    match std::env::var("AGENT_CREDENTIALS") {
        Ok(json) => {
            let payload: CredentialPayload = serde_json::from_str(&json)?;
            client.initialize_from_payload(payload)?;
        }
        Err(_) => {
            let username = std::env::var("AGENT_USERNAME")?;
            let password = std::env::var("AGENT_PASSWORD")?;
            client.login_for_development(&username, &password).await?;
        }
    }

    let mut events = client.subscribe();
    client.connect().await?;
    client.start_capture().await?;
    println!("connected, current session: {:?}", client.current_session().map(|s| s.session_id().to_string()));

    if let Ok(avatar_id) = std::env::var("AGENT_AVATAR") {
        let state = client.start_avatar_session(&avatar_id).await?;
        println!("avatar: {:?}", state);
    }

    let mut turn = client.watch_turn();
    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => break,
            changed = turn.changed() => {
                if changed.is_err() {
                    break;
                }
                let state = turn.borrow_and_update().state;
                if state == TurnState::UserTurn && !client.arm_streaming() {
                    tracing::warn!("could not arm the microphone");
                }
                println!("turn: {:?}", state);
            }
            event = events.recv() => {
                match event {
                    Ok(ClientEvent::Frame(ServerFrame::TextDelta(delta))) => print!("{}", delta.delta()),
                    Ok(ClientEvent::Frame(ServerFrame::TextComplete(_))) => println!(),
                    Ok(ClientEvent::Frame(ServerFrame::ToolNotification(tool))) => {
                        println!("[{}] {}", tool.tool(), tool.message().unwrap_or_default())
                    }
                    Ok(ClientEvent::Frame(_)) => {}
                    Ok(ClientEvent::Reconnecting { attempt, delay }) => println!("reconnecting ({}) in {:?}", attempt, delay),
                    Ok(ClientEvent::Fatal(e)) => {
                        eprintln!("giving up: {} ({:?})", e, e.recovery());
                        break;
                    }
                    Ok(other) => println!("{:?}", other),
                    Err(e) => tracing::warn!("event stream: {}", e),
                }
            }
        }
    }

    client.end_avatar_session().await?;
    client.close().await?;
    println!("stats: {:?}", client.stats());
    Ok(())
}
