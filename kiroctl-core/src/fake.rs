//! Scripted [`Host`] for tests (feature `test-support`).
//!
//! Every exec is recorded. Responders are consulted in registration order;
//! the first one that matches the program name answers. A command with no
//! responder fails with `ErrorKind::NotFound`, which is exactly what the real
//! host reports for a tool that is not installed.

use std::collections::{HashMap, HashSet};
use std::io;
use std::path::PathBuf;
use std::sync::Mutex;

use nix::errno::Errno;
use nix::sys::signal::Signal;

use crate::host::{CommandOutput, Host, HostCommand};

type Responder = Box<dyn Fn(&HostCommand) -> io::Result<CommandOutput> + Send + Sync>;

#[derive(Default)]
pub struct FakeHost {
    responders: Mutex<Vec<(String, Responder)>>,
    calls: Mutex<Vec<HostCommand>>,
    signals: Mutex<Vec<(u32, Signal)>>,
    dead_pids: Mutex<HashSet<u32>>,
    elevated: bool,
    env: HashMap<String, String>,
    users: HashMap<String, String>,
    current_user: Option<String>,
    programs: HashMap<String, PathBuf>,
    own_pid: u32,
}

impl FakeHost {
    pub fn new() -> Self {
        Self {
            own_pid: 1,
            ..Self::default()
        }
    }

    pub fn elevated(mut self) -> Self {
        self.elevated = true;
        self
    }

    pub fn with_env(mut self, key: &str, value: &str) -> Self {
        self.env.insert(key.to_string(), value.to_string());
        self
    }

    /// Register an account and its primary group.
    pub fn with_user(mut self, user: &str, group: &str) -> Self {
        self.users.insert(user.to_string(), group.to_string());
        self
    }

    pub fn current_user_is(mut self, user: &str) -> Self {
        self.current_user = Some(user.to_string());
        self
    }

    /// Make `which(program)` resolve to `path`.
    pub fn with_program(mut self, program: &str, path: &str) -> Self {
        self.programs.insert(program.to_string(), PathBuf::from(path));
        self
    }

    pub fn with_own_pid(mut self, pid: u32) -> Self {
        self.own_pid = pid;
        self
    }

    /// Builder form of [`FakeHost::on`].
    pub fn respond<F>(self, program: &str, f: F) -> Self
    where
        F: Fn(&[String]) -> CommandOutput + Send + Sync + 'static,
    {
        self.on(program, f);
        self
    }

    /// Answer every exec of `program` with `f(args)`.
    pub fn on<F>(&self, program: &str, f: F)
    where
        F: Fn(&[String]) -> CommandOutput + Send + Sync + 'static,
    {
        self.on_command(program, move |cmd| Ok(f(&cmd.args)));
    }

    /// Answer every exec of `program` with full access to the command
    /// (working directory included) and the ability to fail the spawn.
    pub fn on_command<F>(&self, program: &str, f: F)
    where
        F: Fn(&HostCommand) -> io::Result<CommandOutput> + Send + Sync + 'static,
    {
        self.responders
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push((program.to_string(), Box::new(f)));
    }

    /// Signals to `pid` fail with `ESRCH` from now on.
    pub fn mark_dead(&self, pid: u32) {
        self.dead_pids
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(pid);
    }

    pub fn calls(&self) -> Vec<HostCommand> {
        self.calls.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    /// Every recorded exec rendered as `program arg1 arg2`.
    pub fn command_lines(&self) -> Vec<String> {
        self.calls().iter().map(HostCommand::display).collect()
    }

    /// Argument lists of every exec of `program`.
    pub fn calls_to(&self, program: &str) -> Vec<Vec<String>> {
        self.calls()
            .into_iter()
            .filter(|c| c.program == program)
            .map(|c| c.args)
            .collect()
    }

    pub fn signals(&self) -> Vec<(u32, Signal)> {
        self.signals.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    pub fn clear_calls(&self) {
        self.calls.lock().unwrap_or_else(|e| e.into_inner()).clear();
        self.signals.lock().unwrap_or_else(|e| e.into_inner()).clear();
    }
}

impl Host for FakeHost {
    fn exec(&self, cmd: &HostCommand) -> io::Result<CommandOutput> {
        self.calls
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(cmd.clone());
        let responders = self.responders.lock().unwrap_or_else(|e| e.into_inner());
        match responders.iter().find(|(program, _)| *program == cmd.program) {
            Some((_, respond)) => respond(cmd),
            None => Err(io::Error::new(
                io::ErrorKind::NotFound,
                format!("{}: command not found", cmd.program),
            )),
        }
    }

    fn signal(&self, pid: u32, signal: Signal) -> Result<(), Errno> {
        self.signals
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push((pid, signal));
        if self
            .dead_pids
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .contains(&pid)
        {
            return Err(Errno::ESRCH);
        }
        Ok(())
    }

    fn is_elevated(&self) -> bool {
        self.elevated
    }

    fn env_var(&self, key: &str) -> Option<String> {
        self.env.get(key).cloned()
    }

    fn which(&self, program: &str) -> Option<PathBuf> {
        self.programs.get(program).cloned()
    }

    fn primary_group(&self, user: &str) -> Option<String> {
        self.users.get(user).cloned()
    }

    fn current_user(&self) -> Option<String> {
        self.current_user.clone()
    }

    fn own_pid(&self) -> u32 {
        self.own_pid
    }
}
