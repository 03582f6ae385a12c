//! In-process collaborators for driving the manager without privileges.
//!
//! The fake launcher runs the "helper" as a thread that speaks the relay
//! protocol over the real FIFOs in the container's working directory.

#![allow(dead_code)]

use std::collections::{HashMap, HashSet};
use std::fs::{self, File, OpenOptions};
use std::io::{ErrorKind, Read, Write};
use std::net::Ipv4Addr;
use std::os::unix::fs::OpenOptionsExt;
use std::path::{Path, PathBuf};
use std::process::Child;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::thread;
use std::time::Duration;

use nix::sys::signal::Signal;
use tempfile::TempDir;

use nodecore::capability::{
    CGroup, Capabilities, Cgroups, Filesystem, Forward, HostExec, MemoryBroker, MemoryStats,
    PortForwarder, TracingLogSink,
};
use nodecore::error::{CapabilityError, MountError, SandboxError};
use nodecore::relay::{Command, JobResult, JobState, Rewind, RelayPaths, encode_line};
use nodecore::sandbox::{IsolatedProcess, LaunchSpec, Launcher, Mounter};
use nodecore::{AgentConfig, Manager};

const POLL: Duration = Duration::from_millis(10);

/// Host tool runner that records invocations and answers link queries from a table.
#[derive(Default)]
pub struct FakeExec {
    pub calls: Mutex<Vec<String>>,
    /// Host links by name, value is the kind reported by `ip -d link`.
    pub links: Mutex<HashMap<String, String>>,
    /// Veth ends by name, value is the other end.
    pairs: Mutex<HashMap<String, String>>,
}

impl FakeExec {
    pub fn add_link(&self, name: &str, kind: &str) {
        self.links
            .lock()
            .expect("lock")
            .insert(name.to_string(), kind.to_string());
    }

    /// Host links whose name starts with `prefix`.
    pub fn links_with_prefix(&self, prefix: &str) -> Vec<String> {
        self.links
            .lock()
            .expect("lock")
            .keys()
            .filter(|name| name.starts_with(prefix))
            .cloned()
            .collect()
    }

    fn remove_link(&self, links: &mut HashMap<String, String>, name: &str) {
        links.remove(name);
        if let Some(other) = self.pairs.lock().expect("lock").remove(name) {
            links.remove(&other);
        }
    }

    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().expect("lock").clone()
    }

    fn missing(program: &str, args: &[&str]) -> CapabilityError {
        CapabilityError::CommandFailed {
            program: program.to_string(),
            args: args.join(" "),
            stderr: "Device does not exist".to_string(),
        }
    }
}

impl HostExec for FakeExec {
    fn run(&self, program: &str, args: &[&str], _stdin: Option<&str>) -> Result<String, CapabilityError> {
        self.calls
            .lock()
            .expect("lock")
            .push(format!("{program} {}", args.join(" ")));

        let mut links = self.links.lock().expect("lock");
        match (program, args) {
            ("ip", ["link", "add", host, "mtu", _, "type", "veth", "peer", "name", peer, ..]) => {
                links.insert((*host).to_string(), "veth".to_string());
                links.insert((*peer).to_string(), "veth".to_string());
                let mut pairs = self.pairs.lock().expect("lock");
                pairs.insert((*host).to_string(), (*peer).to_string());
                pairs.insert((*peer).to_string(), (*host).to_string());
                Ok(String::new())
            }
            ("ip", ["link", "add", "link", parent, "name", name, "type", kind, ..]) => {
                if !links.contains_key(*parent) {
                    return Err(Self::missing(program, args));
                }
                links.insert((*name).to_string(), (*kind).to_string());
                Ok(String::new())
            }
            ("ip", ["link", "set", name, "netns", _]) => {
                // the other end stays on the host
                links.remove(*name);
                self.pairs.lock().expect("lock").remove(*name);
                Ok(String::new())
            }
            ("ip", ["link", "del", name]) => {
                if !links.contains_key(*name) {
                    return Err(Self::missing(program, args));
                }
                self.remove_link(&mut links, name);
                Ok(String::new())
            }
            ("ip", ["-d", "-j", "link", "show", name]) => match links.get(*name) {
                Some(kind) if kind == "device" => Ok(format!(r#"[{{"ifname":"{name}"}}]"#)),
                Some(kind) => Ok(format!(
                    r#"[{{"ifname":"{name}","linkinfo":{{"info_kind":"{kind}"}}}}]"#
                )),
                None => Err(Self::missing(program, args)),
            },
            ("ip", ["link", "show", name]) if !links.contains_key(*name) => {
                Err(Self::missing(program, args))
            }
            ("btrfs", ["subvolume", "create", path]) => {
                fs::create_dir_all(path).expect("subvolume");
                Ok(String::new())
            }
            ("btrfs", ["subvolume", "delete", path]) => {
                let _ = fs::remove_dir_all(path);
                Ok(String::new())
            }
            _ => Ok(String::new()),
        }
    }

    fn spawn(&self, program: &str, _args: &[&str]) -> Result<Child, CapabilityError> {
        Err(CapabilityError::Failed {
            capability: "exec",
            reason: format!("{program} is not available in tests"),
        })
    }
}

/// Mount table kept in memory.
#[derive(Default)]
pub struct FakeMounter {
    pub mounts: Mutex<HashSet<PathBuf>>,
}

impl Mounter for FakeMounter {
    fn bind(&self, _source: &Path, target: &Path, _read_only: bool) -> Result<(), MountError> {
        self.mounts.lock().expect("lock").insert(target.to_path_buf());
        Ok(())
    }

    fn overlay(&self, _lower: &[PathBuf], _upper: &Path, _work: &Path, target: &Path) -> Result<(), MountError> {
        self.mounts.lock().expect("lock").insert(target.to_path_buf());
        Ok(())
    }

    fn unmount(&self, target: &Path) -> Result<(), MountError> {
        self.mounts.lock().expect("lock").remove(target);
        Ok(())
    }

    fn mounts_under(&self, root: &Path) -> Vec<PathBuf> {
        self.mounts
            .lock()
            .expect("lock")
            .iter()
            .filter(|path| path.starts_with(root))
            .cloned()
            .collect()
    }
}

/// Filesystem collaborator recording image mounts in the mount table.
pub struct FakeFilesystem {
    pub mounter: Arc<FakeMounter>,
    pub merged: Mutex<Vec<(String, PathBuf)>>,
    /// Namespaces holding scratch state.
    pub scratch: Mutex<HashSet<String>>,
}

impl Filesystem for FakeFilesystem {
    fn mount(&self, namespace: &str, _storage: &str, _source: &str, target: &Path) -> Result<(), CapabilityError> {
        fs::create_dir_all(target).expect("image target");
        self.scratch.lock().expect("lock").insert(namespace.to_string());
        self.mounter.bind(Path::new("/"), target, true).expect("record");
        Ok(())
    }

    fn merge_layer(&self, _namespace: &str, _storage: &str, source: &str, target: &Path) -> Result<(), CapabilityError> {
        self.merged
            .lock()
            .expect("lock")
            .push((source.to_string(), target.to_path_buf()));
        Ok(())
    }

    fn release(&self, namespace: &str) -> Result<(), CapabilityError> {
        self.scratch.lock().expect("lock").remove(namespace);
        Ok(())
    }

    fn restore_backup(&self, url: &str, _target: &Path, _name: &str) -> Result<(), CapabilityError> {
        Err(CapabilityError::Failed {
            capability: "filesystem",
            reason: format!("no repository at {url}"),
        })
    }
}

/// Cgroups that exist once created.
#[derive(Default)]
pub struct FakeCgroups {
    pub groups: Mutex<HashSet<CGroup>>,
    pub attached: Mutex<Vec<(CGroup, u32)>>,
}

impl Cgroups for FakeCgroups {
    fn get_or_create(&self, group: &CGroup) -> Result<(), CapabilityError> {
        self.groups.lock().expect("lock").insert(group.clone());
        Ok(())
    }

    fn exists(&self, group: &CGroup) -> bool {
        self.groups.lock().expect("lock").contains(group)
    }

    fn attach(&self, group: &CGroup, pid: u32) -> Result<(), CapabilityError> {
        self.attached.lock().expect("lock").push((group.clone(), pid));
        Ok(())
    }
}

/// Forward table kept in memory.
#[derive(Default)]
pub struct FakeForwarder {
    pub forwards: Mutex<HashMap<u16, Vec<Forward>>>,
}

impl PortForwarder for FakeForwarder {
    fn valid_host(&self, host: &str) -> bool {
        let port = host.rsplit(':').next().unwrap_or_default();
        port.parse::<u16>().is_ok_and(|port| port != 0)
    }

    fn add(&self, owner: u16, ip: Ipv4Addr, host: &str, guest: u16) -> Result<(), CapabilityError> {
        let mut forwards = self.forwards.lock().expect("lock");
        if forwards.values().flatten().any(|f| f.host == host) {
            return Err(CapabilityError::Failed {
                capability: "portforward",
                reason: format!("host port {host} is taken"),
            });
        }
        forwards.entry(owner).or_default().push(Forward {
            host: host.to_string(),
            guest,
            ip,
        });
        Ok(())
    }

    fn remove(&self, owner: u16, host: &str, guest: u16) -> Result<(), CapabilityError> {
        let mut forwards = self.forwards.lock().expect("lock");
        let list = forwards.entry(owner).or_default();
        let before = list.len();
        list.retain(|f| !(f.host == host && f.guest == guest));
        if list.len() == before {
            return Err(CapabilityError::Failed {
                capability: "portforward",
                reason: format!("no forward {host} -> {guest}"),
            });
        }
        Ok(())
    }

    fn remove_all(&self, owner: u16) {
        self.forwards.lock().expect("lock").remove(&owner);
    }

    fn list(&self, owner: u16) -> Vec<Forward> {
        self.forwards
            .lock()
            .expect("lock")
            .get(&owner)
            .cloned()
            .unwrap_or_default()
    }
}

/// How the fake helper treats incoming commands.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Behavior {
    /// Answer every command.
    Answer,
    /// Read commands but never answer.
    Silent,
}

#[derive(Default)]
struct Exit {
    code: Mutex<Option<i32>>,
    done: Condvar,
}

/// A helper thread standing in for the isolated process.
pub struct FakeProcess {
    pid: u32,
    stop: Arc<AtomicBool>,
    kill_code: Arc<Mutex<i32>>,
    ignore_term: bool,
    exit: Arc<Exit>,
}

impl IsolatedProcess for FakeProcess {
    fn pid(&self) -> u32 {
        self.pid
    }

    fn signal(&self, signal: Signal) -> Result<(), SandboxError> {
        match signal {
            Signal::SIGTERM if self.ignore_term => {}
            Signal::SIGTERM => {
                *self.kill_code.lock().expect("lock") = 0;
                self.stop.store(true, Ordering::SeqCst);
            }
            Signal::SIGKILL => {
                *self.kill_code.lock().expect("lock") = 137;
                self.stop.store(true, Ordering::SeqCst);
            }
            _ => {}
        }
        Ok(())
    }

    fn wait(&self) -> Result<i32, SandboxError> {
        let mut code = self.exit.code.lock().expect("lock");
        while code.is_none() {
            code = self.exit.done.wait(code).expect("wait");
        }
        Ok(code.unwrap_or(-1))
    }
}

/// Launcher running [`FakeProcess`] helpers.
pub struct FakeLauncher {
    next_pid: AtomicU32,
    pub behavior: Mutex<Behavior>,
    pub ignore_term: AtomicBool,
    /// Refuse to spawn.
    pub fail: AtomicBool,
    /// Exit on its own after this long.
    pub lifetime: Mutex<Option<Duration>>,
    pub launched: Mutex<Vec<LaunchSpec>>,
}

impl Default for FakeLauncher {
    fn default() -> Self {
        Self {
            next_pid: AtomicU32::new(40_000),
            behavior: Mutex::new(Behavior::Answer),
            ignore_term: AtomicBool::new(false),
            fail: AtomicBool::new(false),
            lifetime: Mutex::new(None),
            launched: Mutex::new(Vec::new()),
        }
    }
}

impl Launcher for FakeLauncher {
    fn launch(&self, spec: &LaunchSpec) -> Result<Arc<dyn IsolatedProcess>, SandboxError> {
        self.launched.lock().expect("lock").push(spec.clone());
        if self.fail.load(Ordering::SeqCst) {
            return Err(SandboxError::LaunchFailed("clone: operation not permitted".to_string()));
        }

        let pid = self.next_pid.fetch_add(1, Ordering::SeqCst);
        let stop = Arc::new(AtomicBool::new(false));
        let kill_code = Arc::new(Mutex::new(0));
        let exit = Arc::new(Exit::default());
        let helper = Helper {
            container: spec.id,
            paths: RelayPaths::new(&spec.relay_dir),
            behavior: *self.behavior.lock().expect("lock"),
            lifetime: *self.lifetime.lock().expect("lock"),
            stop: Arc::clone(&stop),
        };

        let code = Arc::clone(&kill_code);
        let done = Arc::clone(&exit);
        thread::Builder::new()
            .name(format!("fake-helper-{}", spec.id))
            .spawn(move || {
                helper.run();
                let code = *code.lock().expect("lock");
                *done.code.lock().expect("lock") = Some(code);
                done.done.notify_all();
            })
            .map_err(|e| SandboxError::LaunchFailed(e.to_string()))?;

        Ok(Arc::new(FakeProcess {
            pid,
            stop,
            kill_code,
            ignore_term: self.ignore_term.load(Ordering::SeqCst),
            exit,
        }))
    }
}

struct Helper {
    container: u16,
    paths: RelayPaths,
    behavior: Behavior,
    lifetime: Option<Duration>,
    stop: Arc<AtomicBool>,
}

impl Helper {
    fn stopped(&self) -> bool {
        self.stop.load(Ordering::SeqCst)
    }

    fn open_output(&self) -> Option<File> {
        loop {
            if self.stopped() {
                return None;
            }
            match OpenOptions::new()
                .write(true)
                .custom_flags(libc::O_NONBLOCK)
                .open(&self.paths.output)
            {
                Ok(file) => return Some(file),
                Err(_) => thread::sleep(POLL),
            }
        }
    }

    fn run(self) {
        let started = std::time::Instant::now();
        let Some(mut output) = self.open_output() else {
            return;
        };
        let Ok(mut input) = OpenOptions::new()
            .read(true)
            .custom_flags(libc::O_NONBLOCK)
            .open(&self.paths.input)
        else {
            return;
        };

        let mut pending = Vec::new();
        let mut buf = [0u8; 4096];
        while !self.stopped() {
            if self.lifetime.is_some_and(|lifetime| started.elapsed() >= lifetime) {
                break;
            }
            match input.read(&mut buf) {
                Ok(0) => thread::sleep(POLL),
                Ok(n) => pending.extend_from_slice(&buf[..n]),
                Err(e) if e.kind() == ErrorKind::WouldBlock => thread::sleep(POLL),
                Err(_) => break,
            }
            while let Some(end) = pending.iter().position(|b| *b == b'\n') {
                let line: Vec<u8> = pending.drain(..=end).collect();
                let Ok(command) = serde_json::from_slice::<Command>(&line) else {
                    continue;
                };
                if self.behavior == Behavior::Answer {
                    self.answer(&mut output, &command);
                }
            }
        }
    }

    fn answer(&self, output: &mut File, command: &Command) {
        let (state, data) = match command.command.as_str() {
            "test.hang" => return,
            "core.ping" => (JobState::Success, "\"pong\"".to_string()),
            "ovs.vlan-ensure" | "ovs.vxlan-ensure" => (JobState::Success, "\"vlbr\"".to_string()),
            name if name.starts_with("ovs.") => (JobState::Success, "null".to_string()),
            _ => (JobState::UnknownCmd, String::new()),
        };
        let result = JobResult {
            id: command.id.clone(),
            command: command.command.clone(),
            data,
            state,
            container: u64::from(self.container),
            ..JobResult::default()
        };
        let envelope = Rewind::Result(result).envelope().expect("envelope");
        let line = encode_line(&envelope).expect("encode");
        let _ = output.write_all(&line);
    }
}

/// A manager wired to fakes inside a temporary directory.
pub struct Harness {
    pub dir: TempDir,
    pub manager: Manager,
    pub exec: Arc<FakeExec>,
    pub mounter: Arc<FakeMounter>,
    pub filesystem: Arc<FakeFilesystem>,
    pub cgroups: Arc<FakeCgroups>,
    pub forwarder: Arc<FakeForwarder>,
    pub broker: Arc<MemoryBroker>,
    pub launcher: Arc<FakeLauncher>,
}

impl Harness {
    pub fn new() -> Self {
        Self::with_config(|config| config)
    }

    pub fn with_config(tune: impl FnOnce(AgentConfig) -> AgentConfig) -> Self {
        let dir = tempfile::tempdir().expect("tempdir");
        let helper = dir.path().join("corex");
        fs::write(&helper, b"#!/bin/sh\n").expect("helper");

        let config = tune(
            AgentConfig::default()
                .with_backend_dir(dir.path().join("backend"))
                .with_root_dir(dir.path().join("roots"))
                .with_netns_dir(dir.path().join("netns"))
                .with_cgroup_root(dir.path().join("cgroup"))
                .with_helper_path(&helper)
                .with_terminate_grace(Duration::from_millis(500))
                .with_forward_timeout(Duration::from_secs(2))
                .with_result_timeout(Duration::from_secs(5)),
        );

        let exec = Arc::new(FakeExec::default());
        let mounter = Arc::new(FakeMounter::default());
        let filesystem = Arc::new(FakeFilesystem {
            mounter: Arc::clone(&mounter),
            merged: Mutex::new(Vec::new()),
            scratch: Mutex::new(HashSet::new()),
        });
        let cgroups = Arc::new(FakeCgroups::default());
        let forwarder = Arc::new(FakeForwarder::default());
        let broker = Arc::new(MemoryBroker::new());
        let launcher = Arc::new(FakeLauncher::default());

        let caps = Capabilities {
            filesystem: filesystem.clone(),
            cgroups: cgroups.clone(),
            forwarder: forwarder.clone(),
            broker: broker.clone(),
            logger: Arc::new(TracingLogSink),
            stats: Arc::new(MemoryStats::new()),
            exec: exec.clone(),
            mounter: mounter.clone(),
            launcher: launcher.clone(),
        };

        Self {
            manager: Manager::new(config, caps),
            dir,
            exec,
            mounter,
            filesystem,
            cgroups,
            forwarder,
            broker,
            launcher,
        }
    }

    pub fn mounts_under(&self, root: &Path) -> Vec<PathBuf> {
        self.mounter.mounts_under(root)
    }
}

impl Drop for Harness {
    fn drop(&mut self) {
        self.manager.shutdown();
    }
}
