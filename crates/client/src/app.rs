//! The interactive client: one loop over keyboard lines, server events and
//! Ctrl-C, feeding the state machine and carrying out its effects.

use std::{collections::VecDeque, io::BufRead, thread};

use {
    duet_common::HeartbeatSettings,
    duet_config::DuetConfig,
    tokio::sync::mpsc,
    tracing::{info, warn},
};

use crate::{
    connection::{Connection, ConnectionEvent},
    console::{BANNER, Console},
    machine::{Effect, Machine},
};

/// Run the client against `addr` (`host:port`) until the user leaves or the
/// session ends.
pub async fn run(addr: &str, config: &DuetConfig) -> anyhow::Result<()> {
    let mut console = Console::stdout();
    console.line(BANNER)?;

    let heartbeat = HeartbeatSettings {
        interval: config.heartbeat.interval(),
        timeout: config.heartbeat.timeout(),
        max_missed: config.heartbeat.max_missed,
    };
    let mut conn = Connection::connect(addr, heartbeat).await?;
    let mut machine = Machine::new();
    let mut input = spawn_stdin_reader();
    console.prompt(&machine.prompt())?;

    loop {
        let effects = tokio::select! {
            line = input.recv() => match line {
                Some(line) => machine.on_input(&line),
                None => machine.on_interrupt(),
            },
            event = conn.next_event() => match event {
                Some(ConnectionEvent::Message(msg)) => machine.on_message(msg),
                Some(ConnectionEvent::Lost(reason)) => machine.on_transport_lost(&reason),
                None => machine.on_transport_lost("connection closed"),
            },
            _ = tokio::signal::ctrl_c() => {
                console.line("")?;
                machine.on_interrupt()
            },
        };
        if apply(effects, &mut machine, &conn, &mut console).await? {
            break;
        }
    }

    conn.close().await;
    console.line("Bye!")?;
    info!("client exited");
    Ok(())
}

/// Carry out effects in order. Returns `true` once the machine asked to exit.
async fn apply(
    effects: Vec<Effect>,
    machine: &mut Machine,
    conn: &Connection,
    console: &mut Console<std::io::Stdout>,
) -> anyhow::Result<bool> {
    let mut queue = VecDeque::from(effects);
    let mut exit = false;
    while let Some(effect) = queue.pop_front() {
        match effect {
            Effect::Send(msg) => {
                if let Err(e) = conn.send(msg).await {
                    warn!(error = %e, "send failed");
                    queue.extend(machine.on_transport_lost(&e.to_string()));
                }
            },
            Effect::Print(text) => console.line(&text)?,
            Effect::Prompt => console.prompt(&machine.prompt())?,
            Effect::Exit => exit = true,
        }
    }
    Ok(exit)
}

/// Keyboard lines on a plain thread: blocking stdin must not hold up the
/// runtime when the client exits.
fn spawn_stdin_reader() -> mpsc::UnboundedReceiver<String> {
    let (tx, rx) = mpsc::unbounded_channel();
    thread::spawn(move || {
        for line in std::io::stdin().lock().lines() {
            let Ok(line) = line else {
                break;
            };
            if tx.send(line).is_err() {
                break;
            }
        }
    });
    rx
}
