//! Operator Console
//!
//! Line-oriented front end over [`PortRegistry`]: reads commands from stdin,
//! runs them, and renders operator events as they arrive.

mod command;

use std::fmt::Write as _;
use std::io::Write as _;
use std::time::Duration;

use tokio::sync::mpsc;

use crate::events::OperatorEvent;
use crate::listener::{PortRegistry, PortStatus, PortSummary, SendOutcome};
use crate::session::ConnectionInfo;

pub use command::{route, Command, CommandError, Input};

/// How long `exit` waits for read loops to finish
const EXIT_GRACE: Duration = Duration::from_secs(2);

pub const HELP: &str = "\
Commands (prefix with '/' while a connection is focused):
  add <port>               Add new port listener
  remove <port>            Remove port listener
  list                     List listeners
  connections <port>       List active connections for port
  switch <port> [conn_id]  Focus a connection and replay its messages
  send <message>           Send message to the focused connection
  shell [unix|windows]     Start a shell on the focused connection
  stopshell                Stop the shell on the focused connection
  upload <filepath>        Upload file to the focused connection
  help                     Show this help message
  exit                     Remove every listener and quit

While focused, any line without '/' is sent to the connection (or its shell).";

/// Run the console until `exit` or end of input
pub async fn run(
    registry: PortRegistry,
    mut events: mpsc::UnboundedReceiver<OperatorEvent>,
) -> std::io::Result<()> {
    let mut lines = spawn_stdin_reader()?;

    println!("{}", HELP);
    print_prompt(&registry);

    loop {
        tokio::select! {
            Some(event) = events.recv() => {
                println!("{}", render_event(&event));
                print_prompt(&registry);
            }

            line = lines.recv() => {
                let Some(line) = line else {
                    tracing::debug!("stdin closed");
                    break;
                };

                let focused = registry.current().is_some();
                match route(&line, focused) {
                    Ok(Input::Empty) => {}
                    Ok(Input::Message(text)) => send(&registry, &text).await,
                    Ok(Input::Command(Command::Exit)) => break,
                    Ok(Input::Command(command)) => execute(&registry, command).await,
                    Err(e) => println!("[!] {}", e),
                }
                print_prompt(&registry);
            }
        }
    }

    println!("Shutting down...");
    registry.shutdown();
    let deadline = tokio::time::Instant::now() + EXIT_GRACE;
    while registry.connection_count() > 0 && tokio::time::Instant::now() < deadline {
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    Ok(())
}

/// Read stdin lines on a plain thread; a pending blocking read must not
/// hold up runtime shutdown.
fn spawn_stdin_reader() -> std::io::Result<mpsc::UnboundedReceiver<String>> {
    let (tx, rx) = mpsc::unbounded_channel();
    std::thread::Builder::new()
        .name("portdeck::stdin".to_string())
        .spawn(move || {
            let stdin = std::io::stdin();
            loop {
                let mut line = String::new();
                match stdin.read_line(&mut line) {
                    Ok(0) => break,
                    Ok(_) => {
                        if tx.send(line).is_err() {
                            break;
                        }
                    }
                    Err(e) => {
                        tracing::warn!("Failed to read stdin: {}", e);
                        break;
                    }
                }
            }
        })?;
    Ok(rx)
}

fn print_prompt(registry: &PortRegistry) {
    let prompt = match registry.current() {
        Some(conn) => format!("[{}]> ", conn.peer()),
        None => "portdeck> ".to_string(),
    };
    print!("{}", prompt);
    let _ = std::io::stdout().flush();
}

async fn send(registry: &PortRegistry, text: &str) {
    match registry.send_message_to_current(text).await {
        Ok(SendOutcome::Sent) => println!("Message sent."),
        // Output arrives as events
        Ok(SendOutcome::ShellCommand) => {}
        Err(e) => println!("[!] {}", e),
    }
}

async fn execute(registry: &PortRegistry, command: Command) {
    let result = match command {
        Command::Add(port) => registry.add_port(port).await.map(|_| ()),
        Command::Remove(port) => registry.remove_port(port).map(|_| ()),
        Command::List => {
            println!("{}", render_ports(&registry.list()));
            Ok(())
        }
        Command::Connections(port) => registry
            .connections(port)
            .map(|infos| println!("{}", render_connections(&infos))),
        Command::Switch { port, id } => registry.switch_session(port, id).map(|_| ()),
        Command::Send(text) => {
            send(registry, &text).await;
            Ok(())
        }
        Command::Shell(platform) => registry.start_shell_for_current(platform).await,
        Command::StopShell => registry.stop_shell_for_current().await,
        Command::Upload(path) => registry
            .send_file_to_current(&path)
            .await
            .map(|message| println!("{}", message)),
        Command::Help => {
            println!("{}", HELP);
            Ok(())
        }
        Command::Exit => Ok(()),
    };

    if let Err(e) = result {
        println!("[!] {}", e);
    }
}

pub fn render_event(event: &OperatorEvent) -> String {
    match event {
        OperatorEvent::ListenerFailed { .. }
        | OperatorEvent::BinarySkipped { .. }
        | OperatorEvent::FileReceiveFailed { .. } => format!("[!] {}", event),
        OperatorEvent::ShellError { .. } => format!("[stderr] {}", event),
        OperatorEvent::Message { .. }
        | OperatorEvent::ShellCommand { .. }
        | OperatorEvent::ShellOutput { .. } => event.to_string(),
        _ => format!("[*] {}", event),
    }
}

pub fn render_ports(ports: &[PortSummary]) -> String {
    let mut out = format!("{:<8}{:<12}{:<13}{}", "Port", "Status", "Connections", "Focused");
    for summary in ports {
        let status = match summary.status {
            PortStatus::Listening => "Listening",
            PortStatus::Ended => "Ended",
        };
        let _ = write!(
            out,
            "\n{:<8}{:<12}{:<13}{}",
            summary.port,
            status,
            summary.connections,
            if summary.focused { "*" } else { "" }
        );
    }
    out
}

pub fn render_connections(infos: &[ConnectionInfo]) -> String {
    let mut out = format!(
        "{:<5}{:<24}{:<12}{:<7}{}",
        "ID", "Address", "Connected", "Shell", "Focused"
    );
    for info in infos {
        let _ = write!(
            out,
            "\n{:<5}{:<24}{:<12}{:<7}{}",
            info.id,
            info.peer.to_string(),
            format_duration(info.connected_for),
            if info.shell_mode { "yes" } else { "no" },
            if info.focused { "*" } else { "" }
        );
    }
    out
}

/// `H:MM:SS`
fn format_duration(duration: Duration) -> String {
    let secs = duration.as_secs();
    format!("{}:{:02}:{:02}", secs / 3600, (secs / 60) % 60, secs % 60)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_format_duration() {
        assert_eq!(format_duration(Duration::from_secs(0)), "0:00:00");
        assert_eq!(format_duration(Duration::from_secs(3725)), "1:02:05");
    }

    #[test]
    fn test_render_ports() {
        let table = render_ports(&[PortSummary {
            port: 9000,
            status: PortStatus::Listening,
            connections: 2,
            focused: true,
        }]);
        let rows: Vec<&str> = table.lines().collect();
        assert_eq!(rows.len(), 2);
        assert!(rows[0].starts_with("Port"));
        assert!(rows[1].starts_with("9000    Listening   2"));
        assert!(rows[1].ends_with('*'));
    }

    #[test]
    fn test_render_event_tags() {
        let peer = "127.0.0.1:5000".parse().unwrap();
        assert_eq!(
            render_event(&OperatorEvent::ListenerStarted { port: 1 }),
            "[*] Started listening on port 1"
        );
        assert_eq!(
            render_event(&OperatorEvent::BinarySkipped { port: 1, peer, bytes: 3 }),
            "[!] Binary data received and skipped: 127.0.0.1:5000 (3 bytes)"
        );
        assert_eq!(
            render_event(&OperatorEvent::ShellOutput { peer, text: "hi".into() }),
            "hi"
        );
    }
}
