//! Signal name handling
//!
//! Interactive clients address signals by POSIX name. Only names on the
//! allow-list are ever delivered; anything else is rejected before it gets
//! near a process group.

use std::str::FromStr;

use nix::sys::signal::Signal;

/// Signal names a client is allowed to deliver to a supervised child
pub const ALLOWED_SIGNALS: &[&str] = &[
    "SIGABRT", "SIGALRM", "SIGBUS", "SIGCHLD", "SIGCONT", "SIGFPE", "SIGHUP", "SIGILL", "SIGINT",
    "SIGIO", "SIGKILL", "SIGPIPE", "SIGPROF", "SIGPWR", "SIGQUIT", "SIGSEGV", "SIGSTKFLT",
    "SIGSTOP", "SIGSYS", "SIGTERM", "SIGTRAP", "SIGTSTP", "SIGTTIN", "SIGTTOU", "SIGURG",
    "SIGUSR1", "SIGUSR2", "SIGVTALRM", "SIGWINCH", "SIGXCPU", "SIGXFSZ",
];

/// Parse a client-supplied signal name against the allow-list
pub fn parse_signal(name: &str) -> Option<Signal> {
    if !ALLOWED_SIGNALS.contains(&name) {
        return None;
    }
    Signal::from_str(name).ok()
}

/// Name for a raw signal number out of a wait status
pub fn signal_name(raw: i32) -> String {
    match Signal::try_from(raw) {
        Ok(signal) => signal.as_str().to_owned(),
        Err(_) => format!("SIG{raw}"),
    }
}
