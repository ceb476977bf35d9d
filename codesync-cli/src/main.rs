//! codesync: relay server and headless client for collaborative code rooms.
//!
//! ```text
//! codesync serve [--bind 127.0.0.1:8000]
//! codesync room
//! codesync join --name Alice [--url ws://127.0.0.1:8000] [--room ID] [--document PATH]
//! ```

mod console;

use clap::{Parser, Subcommand};
use log::info;
use std::error::Error;
use std::path::PathBuf;
use std::time::Duration;
use uuid::Uuid;

use codesync_collab::{
    ChannelConfig, HandoffPolicy, RelayConfig, RelayServer, Session, SessionConfig, SessionEvent,
    WsChannel,
};

/// Collaborative code rooms from the terminal
#[derive(Parser, Debug)]
#[command(name = "codesync")]
#[command(about = "Relay server and headless client for collaborative code rooms")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run the room relay
    Serve {
        /// Address to listen on
        #[arg(long, default_value = "127.0.0.1:8000")]
        bind: String,

        /// Maximum clients per room
        #[arg(long, default_value_t = 100)]
        max_clients: usize,

        /// Messages queued per client before a stalled client is dropped
        #[arg(long, default_value_t = 256)]
        outbox_capacity: usize,
    },

    /// Print a freshly generated room ID
    Room,

    /// Join a room and print what happens in it until Ctrl-C
    Join(JoinArgs),
}

#[derive(clap::Args, Debug)]
struct JoinArgs {
    /// Display name shown to other participants
    #[arg(long)]
    name: String,

    /// Relay URL
    #[arg(long, default_value = "ws://127.0.0.1:8000")]
    url: String,

    /// Room to join (a new one is generated when omitted)
    #[arg(long)]
    room: Option<String>,

    /// File whose contents are handed to participants who join later
    #[arg(long)]
    document: Option<PathBuf>,

    /// Write documents received from other participants to this file
    #[arg(long)]
    output: Option<PathBuf>,

    /// Connection timeout in seconds
    #[arg(long, default_value_t = 10)]
    connect_timeout: u64,

    /// Give up on the first connection failure
    #[arg(long)]
    no_reconnect: bool,

    /// Only the member with the lowest participant ID hands off the document
    #[arg(long)]
    single_sender: bool,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn Error>> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    match Cli::parse().command {
        Command::Serve {
            bind,
            max_clients,
            outbox_capacity,
        } => {
            serve(RelayConfig {
                bind_addr: bind,
                max_clients_per_room: max_clients,
                outbox_capacity,
            })
            .await
        }
        Command::Room => {
            println!("{}", Uuid::new_v4());
            Ok(())
        }
        Command::Join(args) => join(args).await,
    }
}

async fn serve(config: RelayConfig) -> Result<(), Box<dyn Error>> {
    info!("Starting relay on {}...", config.bind_addr);
    let server = RelayServer::new(config);

    tokio::select! {
        result = server.run() => result.map_err(|e| e as Box<dyn Error>),
        _ = tokio::signal::ctrl_c() => {
            let stats = server.stats().await;
            info!(
                "Relay stopped after {} connections, {} messages",
                stats.total_connections, stats.total_messages
            );
            Ok(())
        }
    }
}

async fn join(args: JoinArgs) -> Result<(), Box<dyn Error>> {
    let room = args.room.unwrap_or_else(|| Uuid::new_v4().to_string());
    println!("Room ID: {room}");

    let channel = WsChannel::new(ChannelConfig {
        connect_timeout: Duration::from_secs(args.connect_timeout),
        reconnection: !args.no_reconnect,
        ..ChannelConfig::new(args.url)
    });
    let config = SessionConfig {
        handoff_policy: if args.single_sender {
            HandoffPolicy::LowestParticipant
        } else {
            HandoffPolicy::EveryMember
        },
    };

    let mut session = Session::open_with(channel, room, args.name, config)?;
    let mut events = session.take_event_rx().ok_or("session events already taken")?;
    let opened = SessionEvent::ConnectionStateChanged(session.connection_state());
    println!("{}", console::describe(&opened));

    if let Some(path) = &args.document {
        let text = tokio::fs::read_to_string(path).await?;
        info!("Loaded {} bytes from {}", text.len(), path.display());
        session.set_document(text)?;
    }

    let ctrl_c = tokio::signal::ctrl_c();
    tokio::pin!(ctrl_c);
    let mut failure = None;

    loop {
        tokio::select! {
            running = session.process_next() => {
                while let Ok(event) = events.try_recv() {
                    println!("{}", console::describe(&event));
                    match event {
                        SessionEvent::DocumentReceived(code) => {
                            if let Some(path) = &args.output {
                                tokio::fs::write(path, code).await?;
                            }
                        }
                        SessionEvent::Failed(e) => failure = Some(e),
                        _ => {}
                    }
                }
                if !running {
                    break;
                }
            }
            _ = &mut ctrl_c => {
                info!("Leaving room {}", session.room_id());
                break;
            }
        }
    }

    session.close();
    while let Ok(event) = events.try_recv() {
        println!("{}", console::describe(&event));
    }

    match failure {
        Some(e) => Err(e.into()),
        None => Ok(()),
    }
}
