//! Interactive session over one execution host.
//!
//! Each line is submitted as one execution; a line ending in `\` continues
//! on the next. Commands start with `:`.

use std::sync::Arc;

use scratchpad_core::{ExecutionHost, HostConfig};
use tokio::io::{AsyncBufReadExt, BufReader};

use crate::colors;
use crate::output::TerminalSink;

const HELP: &str = "\
:reset   replace the worker (drops all bindings)
:pid     show the current worker's process id
:quit    leave the session";

/// What a line of input asks for.
#[derive(Debug, PartialEq, Eq)]
enum Input<'a> {
    Reset,
    Pid,
    Quit,
    Help,
    Unknown(&'a str),
    Code(&'a str),
}

fn classify(line: &str) -> Input<'_> {
    let trimmed = line.trim();
    match trimmed {
        ":reset" => Input::Reset,
        ":pid" => Input::Pid,
        ":quit" | ":q" | ":exit" => Input::Quit,
        ":help" | ":h" => Input::Help,
        cmd if cmd.starts_with(':') => Input::Unknown(cmd),
        code => Input::Code(code),
    }
}

fn prompt(continuation: bool) {
    if continuation {
        print!("{}...{} ", colors::DIM, colors::RESET);
    } else {
        print!("{}pad>{} ", colors::BOLD, colors::RESET);
    }
    colors::flush_stdout();
}

/// Start the read-eval-print loop.
pub async fn execute(config: HostConfig, json: bool) -> anyhow::Result<()> {
    let sink = Arc::new(TerminalSink::new(json));
    let host = ExecutionHost::new(config, sink.clone())?;

    println!(
        "{}Scratchpad{} (type {}:help{} for commands)",
        colors::BOLD,
        colors::RESET,
        colors::CYAN,
        colors::RESET
    );

    // Start the first worker while the user types.
    if let Err(e) = host.get_or_create_service().await {
        eprintln!("{}warning:{} {}", colors::YELLOW, colors::RESET, e.with_hint());
    }

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let mut pending = String::new();

    loop {
        prompt(!pending.is_empty());
        let Some(line) = lines.next_line().await? else {
            println!();
            break;
        };

        if let Some(head) = line.strip_suffix('\\') {
            pending.push_str(head);
            pending.push('\n');
            continue;
        }
        pending.push_str(&line);
        let submission = std::mem::take(&mut pending);

        match classify(&submission) {
            Input::Quit => break,
            Input::Help => println!("{}", HELP),
            Input::Pid => match host.worker_pid() {
                Some(pid) => println!("worker pid {}", pid),
                None => println!("no worker running"),
            },
            Input::Reset => {
                host.reset().await;
                println!("{}worker reset{}", colors::DIM, colors::RESET);
            }
            Input::Unknown(cmd) => {
                eprintln!("{}unknown command{} {} (try :help)", colors::RED, colors::RESET, cmd);
            }
            Input::Code("") => {}
            Input::Code(code) => {
                if let Err(e) = host.execute(code).await {
                    eprintln!("{}error:{} {}", colors::RED, colors::RESET, e.with_hint());
                }
                sink.take_summary();
            }
        }
    }

    host.shutdown();
    Ok(())
}
