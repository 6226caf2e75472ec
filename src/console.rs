//! Line-oriented stdin front end for the headless binary.

use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::broadcast::error::RecvError;

use crate::coordinator::{CoreEvent, Coordinator};
use crate::peer::{PeerId, TransportKind};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    Send { peer_id: PeerId, content: String },
    Broadcast(String),
    Peers,
    Status,
    Start(TransportKind),
    Stop(TransportKind),
    Quit,
}

impl Command {
    /// `Ok(None)` for a blank line.
    pub fn parse(line: &str) -> Result<Option<Command>, String> {
        let line = line.trim();
        if line.is_empty() {
            return Ok(None);
        }
        if let Some(rest) = line.strip_prefix('@') {
            let (peer, content) = rest
                .split_once(char::is_whitespace)
                .ok_or_else(|| "usage: @<peer> <text>".to_string())?;
            return Ok(Some(Command::Send {
                peer_id: PeerId::from(peer),
                content: content.trim().to_string(),
            }));
        }
        if let Some(rest) = line.strip_prefix('/') {
            let mut words = rest.split_whitespace();
            let cmd = match (words.next(), words.next()) {
                (Some("peers"), None) => Command::Peers,
                (Some("status"), None) => Command::Status,
                (Some("quit"), None) => Command::Quit,
                (Some("start"), Some(t)) => Command::Start(t.parse()?),
                (Some("stop"), Some(t)) => Command::Stop(t.parse()?),
                _ => return Err(format!("unknown command: {}", line)),
            };
            return Ok(Some(cmd));
        }
        Ok(Some(Command::Broadcast(line.to_string())))
    }
}

fn print_event(event: &CoreEvent) {
    match event {
        CoreEvent::NewPeer { peer_id, transport } => println!("+ {} via {}", peer_id, transport),
        CoreEvent::PeerInactive { peer_id, transport } => {
            println!("- {} no longer on {}", peer_id, transport)
        }
        CoreEvent::PeerRemoved { peer_id } => println!("x {} removed", peer_id),
        CoreEvent::MessageReceived {
            peer_id,
            content,
            transport,
        } => println!("[{}] {}: {}", transport, peer_id, content),
    }
}

/// Execute one command. Returns false when the session should end.
pub async fn execute(coordinator: &Coordinator, command: Command) -> bool {
    match command {
        Command::Send { peer_id, content } => {
            if !coordinator.send(&peer_id, &content, None).await {
                println!("! could not reach {}", peer_id);
            }
        }
        Command::Broadcast(content) => {
            if !coordinator.broadcast(&content, None).await {
                println!("! some peers could not be reached");
            }
        }
        Command::Peers => {
            let peers = coordinator.peers();
            if peers.is_empty() {
                println!("no peers yet");
            }
            for peer in peers {
                println!("{}", peer);
            }
        }
        Command::Status => {
            for status in coordinator.status() {
                match status.last_error {
                    Some(reason) => println!("{}: {} ({})", status.kind, status.state, reason),
                    None => println!("{}: {}", status.kind, status.state),
                }
            }
        }
        Command::Start(kind) => {
            if let Err(e) = coordinator.start_transport(kind).await {
                println!("! {}", e);
            }
        }
        Command::Stop(kind) => {
            if let Err(e) = coordinator.stop_transport(kind).await {
                println!("! {}", e);
            }
        }
        Command::Quit => return false,
    }
    true
}

/// Read commands from stdin and print events until `/quit`, EOF or Ctrl-C.
pub async fn run(coordinator: &Coordinator) -> std::io::Result<()> {
    let mut events = coordinator.subscribe();
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    println!(
        "{} ready. @<peer> <text>, /peers, /status, /start <t>, /stop <t>, /quit",
        coordinator.local_id()
    );

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => break,
            event = events.recv() => match event {
                Ok(event) => print_event(&event),
                Err(RecvError::Lagged(n)) => tracing::warn!("Console skipped {} events", n),
                Err(RecvError::Closed) => break,
            },
            line = lines.next_line() => {
                let Some(line) = line? else { break };
                match Command::parse(&line) {
                    Ok(Some(command)) => {
                        if !execute(coordinator, command).await {
                            break;
                        }
                    }
                    Ok(None) => {}
                    Err(e) => println!("! {}", e),
                }
            }
        }
    }
    Ok(())
}
