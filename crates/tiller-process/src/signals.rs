//! Control directives and their signal transport
//!
//! Five directives drive the master: reload, quit (graceful), stop
//! (immediate), reopen (log rotation), upgrade (binary handoff). Each maps
//! to one OS signal; `tiller signal <directive>` resolves the target pid
//! from the pid file and delivers it.

use nix::sys::signal::{kill, Signal};
use nix::unistd::Pid;
use std::path::Path;
use std::str::FromStr;
use tiller_core::{Error, Result};
use tokio::signal::unix::{signal, SignalKind};

/// A control directive for a running master process.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Directive {
    /// Build and commit a new cycle from the configuration file
    Reload,
    /// Graceful shutdown: stop accepting, drain, exit
    Quit,
    /// Immediate shutdown
    Stop,
    /// Reopen registered files (log rotation)
    Reopen,
    /// Binary upgrade: exec the new binary, handing it the sockets
    Upgrade,
}

impl Directive {
    /// The OS signal carrying this directive.
    pub fn signal(self) -> Signal {
        match self {
            Directive::Reload => Signal::SIGHUP,
            Directive::Quit => Signal::SIGQUIT,
            Directive::Stop => Signal::SIGTERM,
            Directive::Reopen => Signal::SIGUSR1,
            Directive::Upgrade => Signal::SIGUSR2,
        }
    }

    /// All directives, for help output.
    pub const ALL: [Directive; 5] = [
        Directive::Reload,
        Directive::Quit,
        Directive::Stop,
        Directive::Reopen,
        Directive::Upgrade,
    ];
}

impl std::fmt::Display for Directive {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Directive::Reload => "reload",
            Directive::Quit => "quit",
            Directive::Stop => "stop",
            Directive::Reopen => "reopen",
            Directive::Upgrade => "upgrade",
        };
        f.write_str(name)
    }
}

impl FromStr for Directive {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "reload" => Ok(Directive::Reload),
            "quit" => Ok(Directive::Quit),
            "stop" => Ok(Directive::Stop),
            "reopen" => Ok(Directive::Reopen),
            "upgrade" => Ok(Directive::Upgrade),
            other => Err(Error::Signal(format!("unknown directive '{other}'"))),
        }
    }
}

/// Deliver `directive` to the process named by the pid file at `pid_path`.
pub fn send_directive(pid_path: impl AsRef<Path>, directive: Directive) -> Result<()> {
    let pid = crate::pidfile::read_pid(pid_path)?;
    deliver(pid, directive)
}

/// Deliver `directive` to `pid`.
pub fn deliver(pid: Pid, directive: Directive) -> Result<()> {
    kill(pid, directive.signal())
        .map_err(|e| Error::Signal(format!("kill({pid}, {}): {e}", directive.signal())))?;
    tracing::info!(%pid, %directive, "directive delivered");
    Ok(())
}

/// The master's inbound directive stream.
///
/// SIGINT is accepted as an alias for stop so foreground runs behave under
/// Ctrl+C.
#[derive(Debug)]
pub struct DirectiveStream {
    hup: tokio::signal::unix::Signal,
    quit: tokio::signal::unix::Signal,
    term: tokio::signal::unix::Signal,
    int: tokio::signal::unix::Signal,
    usr1: tokio::signal::unix::Signal,
    usr2: tokio::signal::unix::Signal,
}

impl DirectiveStream {
    /// Install handlers for every directive signal.
    pub fn install() -> Result<Self> {
        let install = |kind: SignalKind| {
            signal(kind).map_err(|e| Error::Signal(format!("signal handler install: {e}")))
        };
        Ok(Self {
            hup: install(SignalKind::hangup())?,
            quit: install(SignalKind::quit())?,
            term: install(SignalKind::terminate())?,
            int: install(SignalKind::interrupt())?,
            usr1: install(SignalKind::user_defined1())?,
            usr2: install(SignalKind::user_defined2())?,
        })
    }

    /// Wait for the next directive.
    pub async fn recv(&mut self) -> Directive {
        tokio::select! {
            _ = self.hup.recv() => Directive::Reload,
            _ = self.quit.recv() => Directive::Quit,
            _ = self.term.recv() => Directive::Stop,
            _ = self.int.recv() => Directive::Stop,
            _ = self.usr1.recv() => Directive::Reopen,
            _ = self.usr2.recv() => Directive::Upgrade,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_directive_round_trip_names() {
        for directive in Directive::ALL {
            assert_eq!(
                directive.to_string().parse::<Directive>().unwrap(),
                directive
            );
        }
        assert!("restart".parse::<Directive>().is_err());
    }

    #[test]
    fn test_signal_mapping() {
        assert_eq!(Directive::Reload.signal(), Signal::SIGHUP);
        assert_eq!(Directive::Quit.signal(), Signal::SIGQUIT);
        assert_eq!(Directive::Stop.signal(), Signal::SIGTERM);
        assert_eq!(Directive::Reopen.signal(), Signal::SIGUSR1);
        assert_eq!(Directive::Upgrade.signal(), Signal::SIGUSR2);
    }

    #[test]
    fn test_deliver_to_missing_pid_errors() {
        let missing = Pid::from_raw(i32::MAX - 1);
        assert!(deliver(missing, Directive::Reopen).is_err());
    }
}
