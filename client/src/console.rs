use std::{
    io::{self, BufRead},
    thread::{self, JoinHandle},
};

use crossbeam_channel::{unbounded, Receiver};

use shared::SinkEvent;

/// Prints delivered messages and status changes until every sink is gone.
pub fn spawn_display(events: Receiver<SinkEvent>) -> JoinHandle<()> {
    thread::spawn(move || {
        for event in events {
            match event {
                SinkEvent::Message { sender, text } => println!("{sender}: {text}"),
                SinkEvent::Status { text, connected } => {
                    let marker = if connected { '+' } else { '-' };
                    println!("[{marker}] {text}");
                }
            }
        }
    })
}

/// Reads stdin line by line on a background thread. The channel closes at
/// end of input.
pub fn spawn_input() -> Receiver<String> {
    let (lines, rx) = unbounded();
    thread::spawn(move || {
        for line in io::stdin().lock().lines() {
            let Ok(line) = line else { break };
            if lines.send(line).is_err() {
                break;
            }
        }
    });
    rx
}
