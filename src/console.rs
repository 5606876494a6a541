use std::io::{BufRead, Write};
use std::thread;
use std::time::Duration;

use indicatif::{ProgressBar, ProgressStyle};
use log::debug;
use tokio::sync::mpsc;

/// Forwards stdin lines into a channel so every consumer (menus, prompts,
/// the chat send loop) can `select!` on user input. The channel closes on EOF.
///
/// The blocking read runs on a plain thread, outside the runtime.
pub fn spawn_stdin_reader() -> mpsc::Receiver<String> {
    let (tx, rx) = mpsc::channel(32);
    thread::spawn(move || {
        for line in std::io::stdin().lock().lines() {
            match line {
                Ok(line) => {
                    if tx.blocking_send(line).is_err() {
                        break;
                    }
                }
                Err(e) => {
                    debug!("stdin closed: {}", e);
                    break;
                }
            }
        }
    });
    rx
}

pub fn show_prompt(message: &str) {
    print!("{}", message);
    let _ = std::io::stdout().flush();
}

/// `None` when stdin is closed.
pub async fn prompt(input: &mut mpsc::Receiver<String>, message: &str) -> Option<String> {
    show_prompt(message);
    input.recv().await.map(|line| line.trim().to_string())
}

pub async fn prompt_port(input: &mut mpsc::Receiver<String>, message: &str) -> Option<u16> {
    loop {
        let line = prompt(input, message).await?;
        match line.parse::<u16>() {
            Ok(port) if port != 0 => return Some(port),
            _ => println!("Please enter a port between 1 and 65535."),
        }
    }
}

/// Asks until the user answers yes or no. A closed stdin counts as no.
pub async fn confirm(input: &mut mpsc::Receiver<String>) -> bool {
    loop {
        let Some(answer) = input.recv().await else {
            return false;
        };
        match answer.trim().to_ascii_lowercase().as_str() {
            "y" | "yes" => return true,
            "n" | "no" => return false,
            _ => show_prompt("Please answer y or n: "),
        }
    }
}

pub fn spinner(message: impl Into<String>) -> ProgressBar {
    let spinner = ProgressBar::new_spinner();
    if let Ok(style) = ProgressStyle::default_spinner().template("{spinner} {msg}") {
        spinner.set_style(style);
    }
    spinner.enable_steady_tick(Duration::from_millis(100));
    spinner.set_message(message.into());
    spinner
}
