// SPDX-FileCopyrightText: 2022-2024 Smart Information Flow Technologies
//
// SPDX-License-Identifier: Apache-2.0 OR MIT

//! The policy daemon: reads messages off the device, decides `ASK`s against a rule set, and keeps
//! track of what it knows about each traced process.

use crate::{
    engine::{Device, Received},
    errors::ProtocolMismatch,
    policy::{Action, PolicySet},
    protocol::{Answer, Decision, Message, Payload, PolicyRequest, SyscallInfo, ANSWER_RESULT},
    registration::{RenderedCall, Registry},
    translate::{ProcessNames, RenderContext},
    SyscallKey, U64AsString,
};
use anyhow::{anyhow, Context, Result};
use bstr::ByteSlice;
use nix::{errno::Errno, unistd::Pid};
use serde::{Deserialize, Serialize};
use std::{
    collections::HashMap,
    path::Path,
    sync::{Arc, Mutex, MutexGuard, PoisonError},
    thread::{self, JoinHandle},
    time::Duration,
};

#[derive(Clone, Debug)]
pub struct DaemonConfig {
    pub workers: usize,
    /// How long a worker waits for a message before checking whether it should stop.
    pub poll: Duration,
    /// The size of the policies the daemon creates for new processes.
    pub maxents: i32,
    /// Cache decisions that can't depend on the arguments, so the same call doesn't come back.
    pub cache_decisions: bool,
    /// Ask for a report of the result of every permitted call.
    pub report_results: bool,
}

impl Default for DaemonConfig {
    fn default() -> Self {
        DaemonConfig {
            workers: 4,
            poll: Duration::from_millis(100),
            maxents: 512,
            cache_decisions: true,
            report_results: false,
        }
    }
}

/// What the daemon knows about a traced process.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ProcessInfo {
    pub name: Option<String>,
    /// The emulation the process runs under; decides how its syscall numbers are read.
    pub platform: String,
    pub uid: Option<u32>,
    pub gid: Option<u32>,
    pub policy: Option<i16>,
}

impl Default for ProcessInfo {
    fn default() -> Self {
        ProcessInfo {
            name: None,
            platform: "native".to_string(),
            uid: None,
            gid: None,
            policy: None,
        }
    }
}

#[derive(Debug, Default)]
pub struct ProcessTable {
    processes: Mutex<HashMap<Pid, ProcessInfo>>,
}

impl ProcessTable {
    fn lock(&self) -> MutexGuard<HashMap<Pid, ProcessInfo>> {
        self.processes
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    pub fn get(&self, pid: Pid) -> Option<ProcessInfo> {
        self.lock().get(&pid).cloned()
    }

    fn update(&self, pid: Pid, f: impl FnOnce(&mut ProcessInfo)) {
        let mut processes = self.lock();
        f(processes.entry(pid).or_default());
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }
}

impl ProcessNames for ProcessTable {
    fn process_name(&self, pid: Pid) -> Option<String> {
        self.lock().get(&pid).and_then(|info| info.name.clone())
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuditArg {
    pub index: usize,
    pub name: String,
    pub value: String,
}

/// One decided call.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuditEntry {
    pub pid: i32,
    pub seqnr: u16,
    pub process: Option<String>,
    pub syscall: String,
    /// The policy name the call was decided under.
    pub policy: String,
    pub code: i32,
    pub args: Vec<U64AsString>,
    pub rendered: Vec<AuditArg>,
    pub action: Action,
    pub errno: Option<i32>,
    /// The rule that decided, or `None` for the default.
    pub rule: Option<String>,
    /// Whether the decision was cached for later calls.
    pub cached: bool,
}

/// The result of a call the daemon asked to hear back about.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuditResult {
    pub pid: i32,
    pub seqnr: u16,
    pub syscall: String,
    pub rval: [U64AsString; 2],
    pub errno: i32,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Audit {
    pub decisions: Vec<AuditEntry>,
    pub results: Vec<AuditResult>,
}

pub struct PolicyDaemon {
    registry: Arc<Registry>,
    rules: PolicySet,
    config: DaemonConfig,
    processes: ProcessTable,
    audit: Mutex<Audit>,
}

/// The running worker threads of a daemon.
pub struct Workers {
    handles: Vec<JoinHandle<()>>,
}

impl Workers {
    /// Waits for the workers, which stop once the device closes.
    pub fn join(self) -> Result<()> {
        for handle in self.handles {
            handle
                .join()
                .map_err(|_| anyhow!("A policy daemon worker panicked"))?;
        }
        Ok(())
    }
}

impl PolicyDaemon {
    pub fn new(registry: Arc<Registry>, rules: PolicySet, config: DaemonConfig) -> PolicyDaemon {
        PolicyDaemon {
            registry,
            rules,
            config,
            processes: ProcessTable::default(),
            audit: Mutex::new(Audit::default()),
        }
    }

    pub fn processes(&self) -> &ProcessTable {
        &self.processes
    }

    pub fn audit(&self) -> Audit {
        self.audit
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Starts the worker threads. They share the device, so calls from different processes are
    /// decided in parallel.
    pub fn serve(self: &Arc<Self>, device: Arc<Device>) -> Result<Workers> {
        let handles = (0..self.config.workers.max(1))
            .map(|i| {
                let daemon = Arc::clone(self);
                let device = Arc::clone(&device);
                thread::Builder::new()
                    .name(format!("policy-worker-{}", i))
                    .spawn(move || daemon.work(&device))
                    .context("Failed to spawn policy daemon worker")
            })
            .collect::<Result<Vec<_>>>()?;
        Ok(Workers { handles })
    }

    fn work(&self, device: &Device) {
        loop {
            match device.read_message(self.config.poll) {
                Ok(Received::Message(message)) => {
                    if let Err(err) = self.handle(device, message) {
                        log::warn!("{:#}", err);
                    }
                }
                Ok(Received::Timeout) => {}
                Ok(Received::Closed) => break,
                Err(err) if err.is::<ProtocolMismatch>() => {
                    log::warn!("Discarding message: {}", err);
                }
                Err(err) => {
                    log::error!("Failed to read from the device: {:#}", err);
                    break;
                }
            }
        }
        log::debug!("Policy daemon worker done");
    }

    /// Handles one message.
    pub fn handle(&self, device: &Device, message: Message) -> Result<()> {
        log::trace!("Handling {:?}", message);
        let pid = message.pid;
        match message.payload {
            Payload::Ask(info) => self.decide(device, pid, message.seqnr, message.policy, info),
            Payload::Res(info) => {
                self.record_result(device, pid, message.seqnr, info);
                Ok(())
            }
            Payload::Emul(emul) => {
                self.processes.update(pid, |info| info.platform = emul);
                self.ensure_policy(device, pid, message.policy)
            }
            Payload::Ugid { uid, gid } => {
                self.processes.update(pid, |info| {
                    info.uid = Some(uid);
                    info.gid = Some(gid);
                });
                Ok(())
            }
            Payload::Execve(path) | Payload::ScriptName(path) => {
                let os_path = path.to_os_str_lossy();
                let name = Path::new(&*os_path)
                    .file_name()
                    .map(|name| name.to_string_lossy().into_owned())
                    .unwrap_or_else(|| path.to_str_lossy().into_owned());
                self.processes.update(pid, |info| info.name = Some(name));
                Ok(())
            }
            Payload::Child(Some(child)) => {
                let parent = self.processes.get(pid).unwrap_or_default();
                // The child's own messages may have been handled first.
                self.processes.update(child, |info| {
                    info.platform = parent.platform;
                    info.uid = info.uid.or(parent.uid);
                    info.gid = info.gid.or(parent.gid);
                    info.policy = info.policy.or(parent.policy);
                    if info.name.is_none() {
                        info.name = parent.name;
                    }
                });
                Ok(())
            }
            Payload::Child(None) => {
                self.processes.lock().remove(&pid);
                Ok(())
            }
            Payload::PolicyFree => {
                for info in self.processes.lock().values_mut() {
                    if info.policy == Some(message.policy) {
                        info.policy = None;
                    }
                }
                Ok(())
            }
        }
    }

    /// Gives a new process a policy of its own, so decisions can be cached for it.
    fn ensure_policy(&self, device: &Device, pid: Pid, policy: i16) -> Result<()> {
        if !self.config.cache_decisions {
            return Ok(());
        }
        if policy >= 0 {
            self.processes.update(pid, |info| info.policy = Some(policy));
            return Ok(());
        }
        let num = device.new_policy(self.config.maxents)?;
        device
            .policy(PolicyRequest::Assign { num, pid })
            .with_context(|| format!("Failed to assign policy {} to {}", num, pid))?;
        self.processes.update(pid, |info| info.policy = Some(num));
        Ok(())
    }

    fn decide(
        &self,
        device: &Device,
        pid: Pid,
        seqnr: u16,
        policy: i16,
        info: SyscallInfo,
    ) -> Result<()> {
        // The EMUL message may not have been handled yet; the engine knows the emulation already.
        let platform = match device.emulation(pid) {
            Some(platform) => platform,
            None => {
                log::warn!("Syscall {} from untraced {}; denying", info.code, pid);
                return device.answer(Answer::deny(pid, seqnr, Errno::EPERM as i32));
            }
        };
        let process = self.processes.get(pid).unwrap_or_default();
        let name = match self.registry.names().name(&platform, info.code) {
            Ok(name) => name,
            Err(err) => {
                log::warn!("{} from {}; denying", err, pid);
                return device.answer(Answer::deny(pid, seqnr, Errno::ENOSYS as i32));
            }
        };

        let ctx = RenderContext {
            pid,
            memory: device,
            processes: &self.processes,
        };
        let call = self
            .registry
            .render_call(&platform, name, &info.args, &ctx);
        let eval = self.rules.evaluate(&call);

        let answer = match eval.action {
            Action::Permit => {
                let mut answer = Answer::permit(pid, seqnr);
                if self.config.report_results {
                    answer.flags |= ANSWER_RESULT;
                }
                answer
            }
            Action::Deny => Answer::deny(pid, seqnr, eval.errno.unwrap_or(Errno::EPERM as i32)),
        };
        log::debug!("{} from {}: {:?}", call, pid, eval.action);

        // Cached before answering, so the caller's next identical call finds it.
        let decision = match eval.action {
            Action::Permit => Decision::Permit,
            // Cached denials fail with EPERM.
            Action::Deny if eval.errno.is_none() => Decision::Never,
            Action::Deny => Decision::Ask,
        };
        let cached = self.config.cache_decisions
            && !self.config.report_results
            && policy >= 0
            && decision != Decision::Ask
            && eval.unconditional
            && self.is_argument_independent(&call)
            && match device.policy(PolicyRequest::Modify {
                num: policy,
                code: info.code,
                decision,
            }) {
                Ok(()) => true,
                Err(err) => {
                    log::debug!("Not caching {}: {:#}", call.syscall, err);
                    false
                }
            };

        // The caller may have given up on this request already.
        if let Err(err) = device.answer(answer) {
            log::warn!("Answer for {} not taken: {:#}", pid, err);
        }

        self.audit
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .decisions
            .push(AuditEntry {
                pid: pid.as_raw(),
                seqnr,
                process: process.name,
                syscall: call.syscall.to_string(),
                policy: call.policy.to_string(),
                code: info.code,
                args: info.args.iter().copied().map(U64AsString).collect(),
                rendered: call
                    .args
                    .iter()
                    .map(|arg| AuditArg {
                        index: arg.index,
                        name: arg.name.to_string(),
                        value: arg.value.clone(),
                    })
                    .collect(),
                action: eval.action,
                errno: eval.errno,
                rule: eval.rule,
                cached,
            });
        Ok(())
    }

    /// Whether the call's outcome can't be changed by anything in its arguments.
    fn is_argument_independent(&self, call: &RenderedCall) -> bool {
        call.policy == call.syscall
            && !self
                .registry
                .translations()
                .has_bindings(&call.syscall.platform, &call.syscall.name)
    }

    fn record_result(&self, device: &Device, pid: Pid, seqnr: u16, info: SyscallInfo) {
        let platform = device
            .emulation(pid)
            .unwrap_or_else(|| self.processes.get(pid).unwrap_or_default().platform);
        let syscall = match self.registry.names().name(&platform, info.code) {
            Ok(name) => SyscallKey::new(&platform, name).to_string(),
            Err(_) => format!("{}-#{}", platform, info.code),
        };
        log::debug!(
            "{} of {} returned {} (errno {})",
            syscall,
            pid,
            info.rval[0] as i64,
            info.result
        );
        self.audit
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .results
            .push(AuditResult {
                pid: pid.as_raw(),
                seqnr,
                syscall,
                rval: [U64AsString(info.rval[0]), U64AsString(info.rval[1])],
                errno: info.result,
            });
    }
}

#[cfg(test)]
mod tests {
    use super::{DaemonConfig, PolicyDaemon};
    use crate::{
        engine::{EngineConfig, Interceptor, Received, Verdict},
        policy::{Action, PolicySet},
        pod::testing::FakeMemory,
        protocol::Payload,
        registration::Registry,
    };
    use bstr::BString;
    use nix::unistd::Pid;
    use std::{sync::Arc, thread, time::Duration};

    const RULES: &str = r#"{
        "default": "deny",
        "rules": {
            "native-fsread": [
                { "action": "permit",
                  "conditions": [ { "arg": "filename", "op": "inpath", "value": "/etc" } ] }
            ],
            "native-fswrite": [
                { "action": "deny", "errno": 30 }
            ],
            "native-getpid": [ { "action": "permit" } ],
            "native-kill": [
                { "action": "permit",
                  "conditions": [ { "arg": "signame", "op": "eq", "value": "SIGTERM" },
                                  { "arg": "pidname", "op": "eq", "value": "worker" } ] }
            ]
        }
    }"#;

    fn setup(config: DaemonConfig) -> (Arc<Interceptor>, Arc<PolicyDaemon>, super::Workers, Arc<FakeMemory>) {
        let memory = Arc::new(FakeMemory::default());
        let (engine, device) = Interceptor::new(
            memory.clone(),
            EngineConfig {
                orphan_timeout: Duration::from_secs(5),
            },
        );
        let rules: PolicySet = serde_json::from_str(RULES).unwrap();
        let registry = Arc::new(Registry::builtin(None).unwrap());
        let daemon = Arc::new(PolicyDaemon::new(registry, rules, config));
        let workers = daemon.serve(Arc::new(device)).unwrap();
        (engine, daemon, workers, memory)
    }

    /// Waits for the daemon to have seen the process' lifecycle messages.
    fn settle(daemon: &PolicyDaemon, pid: Pid, check: impl Fn(&super::ProcessInfo) -> bool) {
        for _ in 0..500 {
            if daemon.processes().get(pid).map_or(false, |info| check(&info)) {
                return;
            }
            std::thread::sleep(Duration::from_millis(10));
        }
        panic!("daemon never caught up with {}", pid);
    }

    #[test]
    fn decides_file_calls_through_aliases() {
        let (engine, daemon, workers, memory) = setup(DaemonConfig::default());
        let pid = Pid::from_raw(2000);
        memory.map(pid, 0x1000, b"/etc/passwd\0");
        memory.map(pid, 0x2000, b"/home/user/.profile\0");
        engine.attach(pid, "native");
        engine.execve(pid, BString::from("/usr/bin/cat"));
        settle(&daemon, pid, |info| info.name.is_some());

        // open("/etc/passwd", O_RDONLY)
        assert_eq!(engine.intercept(pid, 5, &[0x1000, 0, 0]), Verdict::PERMIT);
        // open("/home/user/.profile", O_RDONLY): no rule, so the default
        assert_eq!(engine.intercept(pid, 5, &[0x2000, 0, 0]), Verdict::deny());
        // open("/etc/passwd", O_WRONLY)
        assert_eq!(
            engine.intercept(pid, 5, &[0x1000, 1, 0]),
            Verdict::Deny { errno: 30 }
        );

        engine.exit(pid);
        engine.shutdown();
        workers.join().unwrap();

        let audit = daemon.audit();
        assert_eq!(audit.decisions.len(), 3);
        let first = &audit.decisions[0];
        assert_eq!(first.syscall, "native-open");
        assert_eq!(first.policy, "native-fsread");
        assert_eq!(first.process.as_deref(), Some("cat"));
        assert_eq!(first.rendered[0].value, "/etc/passwd");
        assert_eq!(first.rendered[1].value, "ro");
        assert_eq!(first.rule.as_deref(), Some("native-fsread[0]"));
        assert!(!first.cached);
        assert_eq!(audit.decisions[2].policy, "native-fswrite");
        assert_eq!(audit.decisions[2].action, Action::Deny);
    }

    #[test]
    fn argument_independent_decisions_are_cached() {
        let (engine, daemon, workers, _) = setup(DaemonConfig::default());
        let pid = Pid::from_raw(2001);
        engine.attach(pid, "native");
        settle(&daemon, pid, |info| info.policy.is_some());

        // getpid, twice; only the first reaches the daemon
        assert!(engine.intercept(pid, 20, &[]).is_permit());
        assert!(engine.intercept(pid, 20, &[]).is_permit());
        // sync isn't mentioned, so it's denied by default, and cached as such
        assert_eq!(engine.intercept(pid, 36, &[]), Verdict::deny());
        assert_eq!(engine.intercept(pid, 36, &[]), Verdict::deny());
        // An unknown syscall number
        assert_eq!(
            engine.intercept(pid, 4000, &[]),
            Verdict::Deny {
                errno: nix::errno::Errno::ENOSYS as i32
            }
        );

        engine.shutdown();
        workers.join().unwrap();
        let audit = daemon.audit();
        let syscalls = audit
            .decisions
            .iter()
            .map(|entry| (entry.syscall.as_str(), entry.cached))
            .collect::<Vec<_>>();
        assert_eq!(syscalls, [("native-getpid", true), ("native-sync", true)]);
    }

    #[test]
    fn kill_is_matched_on_rendered_process_names() {
        // One worker, so lifecycle messages are handled in order
        let config = DaemonConfig {
            workers: 1,
            ..DaemonConfig::default()
        };
        let (engine, daemon, workers, _) = setup(config);
        let parent = Pid::from_raw(2002);
        let child = Pid::from_raw(2003);
        engine.attach(parent, "native");
        engine.fork(parent, child);
        engine.execve(child, BString::from("/bin/sh"));
        // Scripts go by the script's name, not the interpreter's
        engine.script_name(child, BString::from("/usr/libexec/worker"));
        settle(&daemon, child, |info| info.name.as_deref() == Some("worker"));

        // kill(child, SIGTERM), then kill(child, SIGKILL)
        assert!(engine.intercept(parent, 37, &[2003, 15]).is_permit());
        assert!(!engine.intercept(parent, 37, &[2003, 9]).is_permit());

        engine.shutdown();
        workers.join().unwrap();
        let audit = daemon.audit();
        assert_eq!(audit.decisions[1].rendered[0].value, "worker");
        assert_eq!(audit.decisions[1].rendered[1].value, "SIGKILL");
        assert!(audit.decisions.iter().all(|entry| !entry.cached));
    }

    #[test]
    fn results_are_reported_when_asked_for() {
        let config = DaemonConfig {
            report_results: true,
            ..DaemonConfig::default()
        };
        let (engine, daemon, workers, _) = setup(config);
        let pid = Pid::from_raw(2004);
        engine.attach(pid, "native");

        let verdict = engine.intercept(pid, 20, &[]);
        assert!(matches!(
            verdict,
            Verdict::Permit {
                report: Some(_),
                seteuid: None,
                setegid: None
            }
        ));
        if let Verdict::Permit {
            report: Some(seqnr),
            ..
        } = verdict
        {
            engine.report_result(pid, seqnr, 20, &[], [2004, 0], 0);
        }

        engine.shutdown();
        workers.join().unwrap();
        let audit = daemon.audit();
        assert_eq!(audit.results.len(), 1);
        assert_eq!(audit.results[0].syscall, "native-getpid");
        assert_eq!(audit.results[0].rval[0].0, 2004);
        assert!(!audit.decisions[0].cached);
    }

    #[cfg(all(target_os = "linux", target_arch = "x86_64"))]
    #[test]
    fn calls_are_read_under_the_engines_emulation() {
        let memory = Arc::new(FakeMemory::default());
        let (engine, device) = Interceptor::new(
            memory.clone(),
            EngineConfig {
                orphan_timeout: Duration::from_secs(5),
            },
        );
        let rules: PolicySet = serde_json::from_str(RULES).unwrap();
        let registry = Arc::new(Registry::builtin(None).unwrap());
        let daemon = PolicyDaemon::new(registry, rules, DaemonConfig::default());

        let pid = Pid::from_raw(2005);
        memory.map(pid, 0x1000, b"/etc/passwd\0");
        engine.attach(pid, "linux");
        let caller = {
            let engine = Arc::clone(&engine);
            // open("/etc/passwd", O_RDONLY); 2 is open on x86_64 and fork natively
            thread::spawn(move || engine.intercept(pid, 2, &[0x1000, 0, 0]))
        };

        // The ASK is handled before the EMUL that precedes it
        let emul = match device.read_message(Duration::from_secs(5)).unwrap() {
            Received::Message(message) => message,
            other => panic!("expected EMUL, got {:?}", other),
        };
        assert_eq!(emul.payload, Payload::Emul("linux".to_string()));
        let ask = match device.read_message(Duration::from_secs(5)).unwrap() {
            Received::Message(message) => message,
            other => panic!("expected ASK, got {:?}", other),
        };
        daemon.handle(&device, ask).unwrap();
        assert_eq!(caller.join().unwrap(), Verdict::PERMIT);
        daemon.handle(&device, emul).unwrap();

        let audit = daemon.audit();
        assert_eq!(audit.decisions[0].syscall, "linux-open");
        assert_eq!(audit.decisions[0].policy, "native-fsread");
        assert_eq!(audit.decisions[0].rendered[0].value, "/etc/passwd");
    }
}
