mod cli;
mod signal;
mod stdin_forwarder;

use anyhow::{Context, Result};
use cli::Cli;
use signal::{current_size, setup_signal_handlers, SignalFlags};
use std::io::{self, IsTerminal, Write};
use std::sync::mpsc::{self, RecvTimeoutError};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;
use stdin_forwarder::RawModeGuard;
use tracing::{debug, info, warn};
use tracing_subscriber::EnvFilter;
use vterm::{Console, ExitStatus, NativeConsole, ReturnCode};

const SIGNAL_POLL_INTERVAL: Duration = Duration::from_millis(50);

fn main() {
    std::process::exit(run());
}

fn run() -> i32 {
    let args = Cli::parse_args();

    if let Err(e) = args.validate() {
        eprintln!("vterm: {}", e);
        eprintln!("Use \"vterm -h\" to get help");
        return e.exit_code();
    }

    init_logging(&args);

    match run_program(&args) {
        Ok(status) => {
            info!(%status, "child exited");
            status.shell_code()
        }
        Err(e) => {
            eprintln!("vterm: {:#}", e);
            e.downcast_ref::<vterm::Error>()
                .map(vterm::Error::exit_code)
                .unwrap_or(ReturnCode::RuntimeError.as_exit_code())
        }
    }
}

/// `VTERM_LOG` takes precedence over the `-v` count
fn init_logging(args: &Cli) {
    let filter = EnvFilter::try_from_env("VTERM_LOG")
        .unwrap_or_else(|_| EnvFilter::new(args.log_level()));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(io::stderr)
        .with_ansi(io::stderr().is_terminal())
        .with_target(false)
        .init();
}

fn run_program(args: &Cli) -> Result<ExitStatus> {
    let signal_flags = setup_signal_handlers().context("Failed to setup signal handlers")?;

    let (cols, rows) = args.geometry(current_size());
    let console = vterm::new(cols, rows)?;
    if let Some(ref dir) = args.cwd {
        console.set_cwd(dir)?;
    }
    console.set_env(&args.env)?;

    console
        .start(&args.command)
        .with_context(|| format!("Failed to start {}", args.command[0]))?;
    let console = Arc::new(console);
    info!(pid = console.pid()?, cols, rows, "child started");

    // Restored before the exit status is reported
    let raw_mode = match RawModeGuard::enable() {
        Ok(guard) => guard,
        Err(e) => {
            warn!(error = %e, "could not switch stdin to raw mode");
            None
        }
    };

    let output = spawn_output_copier(Arc::clone(&console))?;
    stdin_forwarder::spawn(Arc::clone(&console)).context("Failed to start stdin forwarder")?;

    let status = wait_relaying_signals(&console, &signal_flags)?;

    if output.join().is_err() {
        warn!("output thread panicked");
    }
    if let Err(e) = console.close() {
        debug!(error = %e, "close after exit");
    }
    drop(raw_mode);

    Ok(status)
}

/// Copy session output to stdout until end of stream.
fn spawn_output_copier(console: Arc<NativeConsole>) -> Result<JoinHandle<()>> {
    let handle = thread::Builder::new()
        .name("output-copier".into())
        .spawn(move || {
            let mut stdout = io::stdout();
            let mut buffer = [0u8; 4096];
            loop {
                match console.read(&mut buffer) {
                    Ok(0) => break,
                    Ok(n) => {
                        if stdout.write_all(&buffer[..n]).and_then(|_| stdout.flush()).is_err() {
                            break;
                        }
                    }
                    Err(e) => {
                        debug!(error = %e, "session read failed");
                        break;
                    }
                }
            }
        })
        .context("Failed to start output thread")?;
    Ok(handle)
}

/// Wait for the child on a helper thread while the calling thread relays
/// resizes and termination requests.
fn wait_relaying_signals(console: &Arc<NativeConsole>, flags: &SignalFlags) -> Result<ExitStatus> {
    let (tx, rx) = mpsc::channel();
    let waiter = Arc::clone(console);
    thread::Builder::new()
        .name("waiter".into())
        .spawn(move || {
            let _ = tx.send(waiter.wait());
        })
        .context("Failed to start waiter thread")?;

    let mut killed = false;
    loop {
        match rx.recv_timeout(SIGNAL_POLL_INTERVAL) {
            Ok(status) => return Ok(status?),
            Err(RecvTimeoutError::Disconnected) => {
                anyhow::bail!("waiter thread exited without a status")
            }
            Err(RecvTimeoutError::Timeout) => {}
        }

        if flags.check_and_clear_sigwinch() {
            if let Some((cols, rows)) = current_size() {
                debug!(cols, rows, "relaying window resize");
                if let Err(e) = console.set_size(cols, rows) {
                    warn!(error = %e, "failed to resize session");
                }
            }
        }

        if !killed {
            if let Some(signal) = flags.termination() {
                info!(signal, "termination requested, killing child");
                console.kill().context("Failed to kill child")?;
                killed = true;
            }
        }
    }
}
