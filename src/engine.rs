// SPDX-FileCopyrightText: 2022-2024 Smart Information Flow Technologies
//
// SPDX-License-Identifier: Apache-2.0 OR MIT

//! The interception engine: stops traced processes at syscalls, asks the policy daemon what to do,
//! and enforces the answer.
//!
//! Callers of [`Interceptor::intercept`] block until the daemon answers. A call that doesn't get a
//! `PERMIT` answer is denied, whether the daemon said no, took too long, went away, or the process
//! exited in the meantime.
//!
//! The daemon's side is a [`Device`]: it reads encoded [`Message`]s and makes [`Ioctl`] requests.
//! Dropping the device is daemon loss.

use crate::{
    errors::{OrphanedRequest, ProtocolMismatch},
    pending::PendingTable,
    policy::PolicyCache,
    pod::ProcessMemory,
    protocol::{
        Answer, Decision, IoOp, IoRequest, Ioctl, Message, Payload, PolicyRequest, SyscallInfo,
        ANSWER_RESULT, ANSWER_SETEGID, ANSWER_SETEUID, MSG_SIZE,
    },
};
use anyhow::{bail, ensure, Result};
use bstr::BString;
use nix::{errno::Errno, unistd::Pid};
use std::{
    collections::{HashMap, HashSet},
    path::PathBuf,
    sync::{
        mpsc::{self, Receiver, RecvTimeoutError, Sender, SyncSender},
        Arc, Mutex, MutexGuard, PoisonError,
    },
    time::Duration,
};

type Wire = Box<[u8; MSG_SIZE]>;

#[derive(Clone, Debug)]
pub struct EngineConfig {
    /// How long a call waits for its answer before it is denied.
    pub orphan_timeout: Duration,
}

impl Default for EngineConfig {
    fn default() -> Self {
        EngineConfig {
            orphan_timeout: Duration::from_secs(10),
        }
    }
}

/// What happens to an intercepted call.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Verdict {
    Permit {
        /// The sequence number to pass to [`Interceptor::report_result`] once the syscall
        /// returns, if the daemon wants its result.
        report: Option<u16>,
        seteuid: Option<u32>,
        setegid: Option<u32>,
    },
    Deny {
        errno: i32,
    },
}

impl Verdict {
    pub const PERMIT: Verdict = Verdict::Permit {
        report: None,
        seteuid: None,
        setegid: None,
    };

    pub fn deny() -> Verdict {
        Verdict::Deny {
            errno: Errno::EPERM as i32,
        }
    }

    pub fn is_permit(&self) -> bool {
        matches!(self, Verdict::Permit { .. })
    }

    fn from_answer(answer: &Answer) -> Verdict {
        match answer.decision {
            Decision::Permit => Verdict::Permit {
                report: (answer.flags & ANSWER_RESULT != 0).then(|| answer.seqnr),
                seteuid: (answer.flags & ANSWER_SETEUID != 0).then(|| answer.seteuid),
                setegid: (answer.flags & ANSWER_SETEGID != 0).then(|| answer.setegid),
            },
            Decision::Never if answer.error != 0 => Verdict::Deny {
                errno: answer.error,
            },
            _ => Verdict::deny(),
        }
    }
}

#[derive(Debug)]
struct Traced {
    emul: String,
    ugid: Option<(u32, u32)>,
}

#[derive(Debug)]
struct State {
    pending: PendingTable<SyncSender<()>>,
    policies: PolicyCache,
    traced: HashMap<Pid, Traced>,
    /// Calls whose answer asked for a result report.
    reports: HashSet<(Pid, u16)>,
    daemon_alive: bool,
}

pub struct Interceptor {
    config: EngineConfig,
    memory: Arc<dyn ProcessMemory>,
    state: Mutex<State>,
    outbox: Mutex<Option<Sender<Wire>>>,
}

impl Interceptor {
    /// Creates an engine and the device the policy daemon uses to talk to it.
    pub fn new(memory: Arc<dyn ProcessMemory>, config: EngineConfig) -> (Arc<Interceptor>, Device) {
        let (tx, rx) = mpsc::channel();
        let engine = Arc::new(Interceptor {
            config,
            memory,
            state: Mutex::new(State {
                pending: PendingTable::new(),
                policies: PolicyCache::new(),
                traced: HashMap::new(),
                reports: HashSet::new(),
                daemon_alive: true,
            }),
            outbox: Mutex::new(Some(tx)),
        });
        let device = Device {
            engine: Arc::clone(&engine),
            inbox: Mutex::new(rx),
        };
        (engine, device)
    }

    fn state(&self) -> MutexGuard<State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Encodes and sends a message.
    fn post(&self, pid: Pid, seqnr: u16, policy: Option<i16>, payload: Payload) -> Delivery {
        let message = Message {
            pid,
            seqnr,
            policy: policy.unwrap_or(-1),
            payload,
        };
        let wire = match message.encode() {
            Ok(wire) => Box::new(wire),
            Err(err) => {
                log::warn!("Dropping message for pid {}: {}", pid, err);
                return Delivery::Unencodable;
            }
        };
        log::trace!("Posting {:?}", message);
        let outbox = self.outbox.lock().unwrap_or_else(PoisonError::into_inner);
        match outbox.as_ref().map(|tx| tx.send(wire)) {
            Some(Ok(())) => Delivery::Sent,
            _ => Delivery::NoDaemon,
        }
    }

    /// Starts tracing a process running under the emulation `emul`.
    pub fn attach(&self, pid: Pid, emul: &str) {
        let policy = {
            let mut state = self.state();
            state.traced.insert(
                pid,
                Traced {
                    emul: emul.to_string(),
                    ugid: None,
                },
            );
            state.policies.policy_of(pid)
        };
        log::debug!("Attached to {} ({})", pid, emul);
        self.post(pid, 0, policy, Payload::Emul(emul.to_string()));
    }

    /// Stops tracing a process. Its outstanding calls are denied.
    pub fn detach(&self, pid: Pid) -> bool {
        let mut state = self.state();
        let was_traced = state.traced.remove(&pid).is_some();
        state.pending.retract_pid(pid);
        state.reports.retain(|&(other, _)| other != pid);
        let freed = state.policies.release(pid);
        drop(state);
        if let Some(num) = freed {
            self.post(pid, 0, Some(num), Payload::PolicyFree);
        }
        was_traced
    }

    pub fn is_traced(&self, pid: Pid) -> bool {
        self.state().traced.contains_key(&pid)
    }

    /// A traced process forked. The child is traced too, under the parent's emulation and
    /// policy.
    pub fn fork(&self, parent: Pid, child: Pid) {
        let policy = {
            let mut state = self.state();
            let (emul, ugid) = match state.traced.get(&parent) {
                Some(traced) => (traced.emul.clone(), traced.ugid),
                None => return,
            };
            state.traced.insert(child, Traced { emul, ugid });
            state.policies.inherit(parent, child);
            state.policies.policy_of(parent)
        };
        log::debug!("{} forked {}", parent, child);
        self.post(parent, 0, policy, Payload::Child(Some(child)));
    }

    pub fn execve(&self, pid: Pid, path: BString) {
        let policy = match self.traced_policy(pid) {
            Some(policy) => policy,
            None => return,
        };
        self.post(pid, 0, policy, Payload::Execve(path));
    }

    /// The process is now running a script; `path` is the script, not its interpreter.
    pub fn script_name(&self, pid: Pid, path: BString) {
        let policy = match self.traced_policy(pid) {
            Some(policy) => policy,
            None => return,
        };
        self.post(pid, 0, policy, Payload::ScriptName(path));
    }

    pub fn set_ugid(&self, pid: Pid, uid: u32, gid: u32) {
        let policy = {
            let mut state = self.state();
            match state.traced.get_mut(&pid) {
                Some(traced) => traced.ugid = Some((uid, gid)),
                None => return,
            }
            state.policies.policy_of(pid)
        };
        self.post(pid, 0, policy, Payload::Ugid { uid, gid });
    }

    /// A traced process exited. Its outstanding calls are denied and its policy released.
    pub fn exit(&self, pid: Pid) {
        let (policy, freed) = {
            let mut state = self.state();
            if state.traced.remove(&pid).is_none() {
                return;
            }
            let retracted = state.pending.retract_pid(pid);
            if !retracted.is_empty() {
                log::debug!("{} exited with {} calls outstanding", pid, retracted.len());
            }
            state.reports.retain(|&(other, _)| other != pid);
            let policy = state.policies.policy_of(pid);
            (policy, state.policies.release(pid))
        };
        self.post(pid, 0, policy, Payload::Child(None));
        if let Some(num) = freed {
            self.post(pid, 0, Some(num), Payload::PolicyFree);
        }
    }

    /// The emulation a traced process runs under.
    pub fn emulation(&self, pid: Pid) -> Option<String> {
        self.state().traced.get(&pid).map(|traced| traced.emul.clone())
    }

    fn traced_policy(&self, pid: Pid) -> Option<Option<i16>> {
        let state = self.state();
        state
            .traced
            .contains_key(&pid)
            .then(|| state.policies.policy_of(pid))
    }

    /// Decides a syscall entry, blocking until the daemon answers or the call is given up on.
    pub fn intercept(&self, pid: Pid, code: i32, args: &[u64]) -> Verdict {
        let (seqnr, policy, rx) = {
            let mut state = self.state();
            if !state.traced.contains_key(&pid) {
                return Verdict::PERMIT;
            }
            match state.policies.lookup(pid, code) {
                Decision::Permit => return Verdict::PERMIT,
                Decision::Never => {
                    log::debug!("Denying syscall {} of {} from the cache", code, pid);
                    return Verdict::deny();
                }
                Decision::Ask => {}
            }
            if !state.daemon_alive {
                log::warn!("No policy daemon; denying syscall {} of {}", code, pid);
                return Verdict::deny();
            }

            let (tx, rx) = mpsc::sync_channel(1);
            let seqnr = match state.pending.insert(pid, code, tx) {
                Ok(seqnr) => seqnr,
                Err(err) => {
                    log::warn!("{}; denying syscall {} of {}", err, code, pid);
                    return Verdict::deny();
                }
            };
            (seqnr, state.policies.policy_of(pid), rx)
        };

        let ask = Payload::Ask(SyscallInfo {
            code,
            args: args.to_vec(),
            rval: [0; 2],
            result: 0,
        });
        match self.post(pid, seqnr, policy, ask) {
            Delivery::Sent => {}
            Delivery::Unencodable => {
                self.state().pending.retract(pid, seqnr);
                return Verdict::deny();
            }
            Delivery::NoDaemon => {
                self.daemon_lost();
                return Verdict::deny();
            }
        }

        let woken = rx.recv_timeout(self.config.orphan_timeout);
        let mut state = self.state();
        if let Some(answer) = state.pending.apply(pid, seqnr) {
            if answer.flags & ANSWER_RESULT != 0 {
                state.reports.insert((pid, seqnr));
            }
            let verdict = Verdict::from_answer(&answer);
            log::debug!("Syscall {} of {}: {:?}", code, pid, verdict);
            return verdict;
        }

        match woken {
            Err(RecvTimeoutError::Timeout) => {
                state.pending.retract(pid, seqnr);
                log::warn!(
                    "{}",
                    OrphanedRequest {
                        pid: pid.as_raw(),
                        seqnr
                    }
                );
                let freed = state.policies.release(pid);
                drop(state);
                if let Some(num) = freed {
                    self.post(pid, 0, Some(num), Payload::PolicyFree);
                }
            }
            _ => log::debug!("Syscall {} of {} was cancelled; denying", code, pid),
        }
        Verdict::deny()
    }

    /// Reports the result of call `seqnr`, whose answer asked for it.
    pub fn report_result(
        &self,
        pid: Pid,
        seqnr: u16,
        code: i32,
        args: &[u64],
        rval: [u64; 2],
        result: i32,
    ) {
        let policy = {
            let mut state = self.state();
            if !state.reports.remove(&(pid, seqnr)) {
                return;
            }
            state.policies.policy_of(pid)
        };
        let res = Payload::Res(SyscallInfo {
            code,
            args: args.to_vec(),
            rval,
            result,
        });
        self.post(pid, seqnr, policy, res);
    }

    /// Ends the message stream; the daemon sees the device close once it has drained it.
    pub fn shutdown(&self) {
        self.outbox
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
    }

    fn daemon_lost(&self) {
        let mut state = self.state();
        if !state.daemon_alive {
            return;
        }
        state.daemon_alive = false;
        let retracted = state.pending.retract_all();
        log::warn!(
            "Lost the policy daemon; denying {} outstanding calls",
            retracted.len()
        );
    }

    fn answer(&self, answer: Answer) -> Result<()> {
        let mut state = self.state();
        let waiter = state.pending.answer(answer)?;
        // Capacity one and only ever answered once, so this can't be full. It fails if the caller
        // gave up already, which the caller handles.
        let _ = waiter.try_send(());
        Ok(())
    }

    fn policy(&self, request: &mut PolicyRequest) -> Result<()> {
        let mut state = self.state();
        match request {
            PolicyRequest::New { maxents, num } => {
                *num = Some(state.policies.new_policy(*maxents)?);
            }
            PolicyRequest::Assign { num, pid } => {
                ensure!(state.traced.contains_key(&*pid), "Pid {} isn't traced", pid);
                let freed = state.policies.assign(*pid, *num)?;
                drop(state);
                if let Some(freed) = freed {
                    self.post(*pid, 0, Some(freed), Payload::PolicyFree);
                }
            }
            PolicyRequest::Modify {
                num,
                code,
                decision,
            } => state.policies.modify(*num, *code, *decision)?,
        }
        Ok(())
    }

    fn io(&self, request: IoRequest, buf: &mut [u8]) -> Result<()> {
        ensure!(
            self.is_traced(request.pid),
            "Pid {} isn't attached",
            request.pid
        );
        ensure!(
            request.len == buf.len() as u64,
            "IO request for {} bytes with a buffer of {}",
            request.len,
            buf.len()
        );
        match request.op {
            IoOp::Read => self.memory.read(request.pid, request.offs, buf),
            IoOp::Write => bail!("Writing to traced processes is not supported"),
        }
    }

    fn report(&self, pid: Pid) -> Result<()> {
        let (emul, ugid, policy) = {
            let state = self.state();
            match state.traced.get(&pid) {
                Some(traced) => (
                    traced.emul.clone(),
                    traced.ugid,
                    state.policies.policy_of(pid),
                ),
                None => bail!("Pid {} isn't traced", pid),
            }
        };
        self.post(pid, 0, policy, Payload::Emul(emul));
        if let Some((uid, gid)) = ugid {
            self.post(pid, 0, policy, Payload::Ugid { uid, gid });
        }
        Ok(())
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Delivery {
    Sent,
    /// The message can't be put on the wire; the daemon is fine.
    Unencodable,
    NoDaemon,
}

/// What [`Device::read_message`] found.
#[derive(Debug)]
pub enum Received {
    Message(Message),
    Timeout,
    /// The engine shut down and every message has been read.
    Closed,
}

/// The policy daemon's handle on the engine.
pub struct Device {
    engine: Arc<Interceptor>,
    inbox: Mutex<Receiver<Wire>>,
}

impl Device {
    pub fn read_message(&self, timeout: Duration) -> Result<Received> {
        let wire = {
            let inbox = self.inbox.lock().unwrap_or_else(PoisonError::into_inner);
            match inbox.recv_timeout(timeout) {
                Ok(wire) => wire,
                Err(RecvTimeoutError::Timeout) => return Ok(Received::Timeout),
                Err(RecvTimeoutError::Disconnected) => return Ok(Received::Closed),
            }
        };
        Ok(Received::Message(Message::decode(&wire[..])?))
    }

    pub fn ioctl(&self, request: Ioctl) -> Result<()> {
        log::trace!("ioctl 0x{:08x}", request.code());
        match request {
            Ioctl::Attach(pid) => {
                if !self.engine.is_traced(pid) {
                    self.engine.attach(pid, "native");
                }
                Ok(())
            }
            Ioctl::Detach(pid) => {
                ensure!(self.engine.detach(pid), "Pid {} isn't traced", pid);
                Ok(())
            }
            Ioctl::Answer(answer) => self.engine.answer(answer),
            Ioctl::Io(request, buf) => self.engine.io(request, buf),
            Ioctl::Policy(request) => self.engine.policy(request),
            Ioctl::Report(pid) => self.engine.report(pid),
        }
    }

    pub fn answer(&self, answer: Answer) -> Result<()> {
        self.ioctl(Ioctl::Answer(answer))
    }

    /// Creates a policy and returns its number.
    pub fn new_policy(&self, maxents: i32) -> Result<i16> {
        let mut request = PolicyRequest::New { maxents, num: None };
        self.ioctl(Ioctl::Policy(&mut request))?;
        match request {
            PolicyRequest::New { num: Some(num), .. } => Ok(num),
            _ => Err(ProtocolMismatch("no policy number in reply".to_string()).into()),
        }
    }

    pub fn policy(&self, mut request: PolicyRequest) -> Result<()> {
        self.ioctl(Ioctl::Policy(&mut request))
    }

    pub fn read_memory(&self, pid: Pid, addr: u64, buf: &mut [u8]) -> Result<()> {
        let request = IoRequest {
            pid,
            op: IoOp::Read,
            offs: addr,
            len: buf.len() as u64,
        };
        self.ioctl(Ioctl::Io(request, buf))
    }

    pub fn detach(&self, pid: Pid) -> Result<()> {
        self.ioctl(Ioctl::Detach(pid))
    }

    /// The emulation `pid` runs under, as the engine knows it. `None` if it isn't traced.
    pub fn emulation(&self, pid: Pid) -> Option<String> {
        self.engine.emulation(pid)
    }
}

impl ProcessMemory for Device {
    fn read(&self, pid: Pid, addr: u64, buf: &mut [u8]) -> Result<()> {
        self.read_memory(pid, addr, buf)
    }

    fn cwd(&self, pid: Pid) -> Option<PathBuf> {
        if self.engine.is_traced(pid) {
            self.engine.memory.cwd(pid)
        } else {
            None
        }
    }

    fn fd_path(&self, pid: Pid, fd: i32) -> Option<PathBuf> {
        if self.engine.is_traced(pid) {
            self.engine.memory.fd_path(pid, fd)
        } else {
            None
        }
    }
}

impl Drop for Device {
    fn drop(&mut self) {
        self.engine.daemon_lost();
    }
}
