//! OS-level isolation envelope for referee execution.
//!
//! Resource caps are enforced with Linux cgroups v2 (memory hard limit,
//! pid cap, CPU quota) plus per-process rlimits (file size, open files)
//! and `no_new_privs`. Network denial and the read-only root filesystem
//! come from the deployment container the engine itself runs in; the
//! sandbox here is the per-match envelope inside it.
//!
//! # Linux-Only
//!
//! Cgroup enforcement only works on Linux with cgroups v2. Elsewhere, or
//! when cgroup creation fails, the profile's `allow_uncontained` flag
//! decides between failing the execution as `internal` and running with
//! only the wall-clock limit enforced.

use std::time::Duration;

use tracing::warn;

/// Resource caps for one match execution.
///
/// Build with the `with_*` methods or [`SandboxProfile::from_env()`]:
///
/// - `EXECUTOR_TIMEOUT` (u64, seconds): wall-clock limit, default 60
/// - `EXECUTOR_MEMORY_LIMIT` (u64, MiB): memory cap, default 512
/// - `EXECUTOR_CPU_QUOTA` (u32, percent of one core): default 100
/// - `EXECUTOR_ALLOW_UNCONTAINED` (`"true"`): run without cgroups when
///   they are unavailable, default false
#[derive(Debug, Clone)]
pub struct SandboxProfile {
    pub(crate) memory_mib: u64,
    pub(crate) cpu_quota_percent: u32,
    pub(crate) max_pids: u32,
    pub(crate) max_open_files: u64,
    pub(crate) max_file_size_mib: u64,
    pub(crate) wall_clock: Duration,
    pub(crate) allow_uncontained: bool,
}

impl SandboxProfile {
    /// Defaults: 512 MiB, one full core, 100 pids, 256 fds, 10 MiB files,
    /// 60 s wall clock, contained only.
    pub fn new() -> Self {
        Self {
            memory_mib: 512,
            cpu_quota_percent: 100,
            max_pids: 100,
            max_open_files: 256,
            max_file_size_mib: 10,
            wall_clock: Duration::from_secs(60),
            allow_uncontained: false,
        }
    }

    /// Read the profile from environment variables, falling back to the
    /// defaults per field.
    pub fn from_env() -> Self {
        fn parse<T: std::str::FromStr>(var: &str) -> Option<T> {
            std::env::var(var).ok()?.parse().ok()
        }

        let defaults = Self::new();
        Self {
            memory_mib: parse("EXECUTOR_MEMORY_LIMIT").unwrap_or(defaults.memory_mib),
            cpu_quota_percent: parse("EXECUTOR_CPU_QUOTA").unwrap_or(defaults.cpu_quota_percent),
            wall_clock: parse::<u64>("EXECUTOR_TIMEOUT")
                .map(Duration::from_secs)
                .unwrap_or(defaults.wall_clock),
            allow_uncontained: std::env::var("EXECUTOR_ALLOW_UNCONTAINED")
                .map(|v| v.eq_ignore_ascii_case("true"))
                .unwrap_or(defaults.allow_uncontained),
            ..defaults
        }
    }

    /// Memory cap in MiB, clamped to host RAM at sandbox creation.
    #[must_use]
    pub fn with_memory_mib(mut self, mib: u64) -> Self {
        self.memory_mib = mib;
        self
    }

    /// CPU quota as a percentage of one core (100 = one full core).
    #[must_use]
    pub fn with_cpu_quota_percent(mut self, percent: u32) -> Self {
        self.cpu_quota_percent = percent.max(1);
        self
    }

    /// Wall-clock deadline for the whole match, measured from sandbox
    /// creation.
    #[must_use]
    pub fn with_wall_clock(mut self, limit: Duration) -> Self {
        self.wall_clock = limit;
        self
    }

    /// Maximum processes inside the sandbox at any time.
    #[must_use]
    pub fn with_max_pids(mut self, pids: u32) -> Self {
        self.max_pids = pids;
        self
    }

    /// Allow execution without cgroup containment when it is unavailable.
    /// Only the wall clock is enforced in that mode.
    #[must_use]
    pub fn with_allow_uncontained(mut self, value: bool) -> Self {
        self.allow_uncontained = value;
        self
    }

    /// Memory cap in bytes, clamped so a misconfigured profile cannot
    /// exceed what the host actually has.
    pub(crate) fn effective_memory_bytes(&self) -> i64 {
        let mut sys = sysinfo::System::new();
        sys.refresh_memory();
        let host_mib = sys.total_memory() / (1024 * 1024);
        let capped = if host_mib > 0 && self.memory_mib > host_mib {
            warn!(
                requested = self.memory_mib,
                host = host_mib,
                "memory cap exceeds host RAM, clamping"
            );
            host_mib
        } else {
            self.memory_mib
        };
        (capped * 1024 * 1024) as i64
    }
}

impl Default for SandboxProfile {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(target_os = "linux")]
mod imp {
    use std::process::{Child, Command, Stdio};
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::time::{Duration, Instant};

    use anyhow::Context;
    use cgroups_rs::{Cgroup, CgroupPid};
    use tracing::warn;

    use super::SandboxProfile;

    const CPU_PERIOD_US: u64 = 100_000;

    fn current_user_id() -> anyhow::Result<String> {
        let output = Command::new("id")
            .arg("-u")
            .output()
            .context("could not launch 'id -u'")?;
        let raw = std::str::from_utf8(&output.stdout).context("id is not a valid string")?;
        Ok(raw.trim().to_string())
    }

    fn cgroup_path(user_id: &str, group_name: &str) -> String {
        format!("user.slice/user-{user_id}.slice/user@{user_id}.service/{group_name}")
    }

    fn create_cgroup(profile: &SandboxProfile, path: &str) -> anyhow::Result<Cgroup> {
        let quota_us = (CPU_PERIOD_US as i64) * (profile.cpu_quota_percent as i64) / 100;
        cgroups_rs::cgroup_builder::CgroupBuilder::new(path)
            .memory()
            .memory_hard_limit(profile.effective_memory_bytes())
            .done()
            .pid()
            .maximum_number_of_processes(cgroups_rs::MaxValue::Value(profile.max_pids as i64))
            .done()
            .cpu()
            .quota(quota_us)
            .period(CPU_PERIOD_US)
            .done()
            .build(cgroups_rs::hierarchies::auto())
            .context("could not create cgroup")
    }

    /// One per match execution. Created fresh, destroyed unconditionally.
    #[derive(Debug)]
    pub struct Sandbox {
        cgroup: Option<Cgroup>,
        profile: SandboxProfile,
        cleaned_up: bool,
    }

    impl Sandbox {
        /// Allocate the envelope. Falls back to uncontained mode (or
        /// fails) per the profile when cgroups are unavailable.
        pub fn create(profile: &SandboxProfile) -> anyhow::Result<Sandbox> {
            static COUNTER: AtomicU32 = AtomicU32::new(1);
            let user_id = current_user_id().context("could not get user id")?;
            let group_name = format!("TJUDGE_SANDBOX_{}", COUNTER.fetch_add(1, Ordering::Relaxed));
            let path = cgroup_path(&user_id, &group_name);

            match create_cgroup(profile, &path) {
                Ok(cgroup) => Ok(Sandbox {
                    cgroup: Some(cgroup),
                    profile: profile.clone(),
                    cleaned_up: false,
                }),
                Err(e) if profile.allow_uncontained => {
                    warn!("cgroup unavailable, running uncontained: {e:#}");
                    Ok(Sandbox {
                        cgroup: None,
                        profile: profile.clone(),
                        cleaned_up: false,
                    })
                }
                Err(e) => Err(e),
            }
        }

        /// Spawn `command` inside the envelope: rlimits and
        /// `no_new_privs` applied pre-exec, then the process (and every
        /// descendant) joins the cgroup.
        pub fn spawn(&self, command: &mut Command) -> anyhow::Result<Child> {
            let fsize_bytes = self.profile.max_file_size_mib * 1024 * 1024;
            let nofile = self.profile.max_open_files;
            unsafe {
                use std::os::unix::process::CommandExt;
                command.pre_exec(move || {
                    let fsize = libc::rlimit {
                        rlim_cur: fsize_bytes,
                        rlim_max: fsize_bytes,
                    };
                    if libc::setrlimit(libc::RLIMIT_FSIZE, &fsize) != 0 {
                        return Err(std::io::Error::last_os_error());
                    }
                    let files = libc::rlimit {
                        rlim_cur: nofile,
                        rlim_max: nofile,
                    };
                    if libc::setrlimit(libc::RLIMIT_NOFILE, &files) != 0 {
                        return Err(std::io::Error::last_os_error());
                    }
                    if libc::prctl(libc::PR_SET_NO_NEW_PRIVS, 1u64, 0u64, 0u64, 0u64) != 0 {
                        return Err(std::io::Error::last_os_error());
                    }
                    Ok(())
                });
            }
            command.stdin(Stdio::null());

            let child = command.spawn().context("could not spawn referee")?;
            if let Some(cgroup) = &self.cgroup {
                let pid = child.id() as u64;
                if let Err(e) = cgroup.add_task_by_tgid(CgroupPid { pid }) {
                    let mut child = child;
                    let kill = child.kill();
                    return Err(anyhow::anyhow!(e)).with_context(|| {
                        if let Err(err) = kill {
                            format!("could not add process to cgroup, and process could not be killed either ({err})")
                        } else {
                            "could not add process to cgroup".to_string()
                        }
                    });
                }
            }
            Ok(child)
        }

        /// Kill everything in the envelope and reclaim it. Safe to call
        /// more than once.
        pub fn destroy(&mut self, child: &mut Child, cleanup: Duration) {
            if self.cleaned_up {
                return;
            }
            match &self.cgroup {
                Some(cgroup) => {
                    if let Err(e) = cgroup.kill() {
                        warn!("could not kill cgroup tasks: {e}");
                        let _ = child.kill();
                    }
                    let deadline = Instant::now() + cleanup;
                    while !cgroup.tasks().is_empty() && Instant::now() < deadline {
                        std::thread::sleep(Duration::from_millis(10));
                    }
                    if let Err(e) = cgroup.delete() {
                        warn!("failed to remove cgroup; if this happens a lot it may slow down the host: {e}");
                    }
                }
                None => {
                    let _ = child.kill();
                }
            }
            let _ = child.wait();
            self.cleaned_up = true;
        }
    }

    impl Drop for Sandbox {
        fn drop(&mut self) {
            if !self.cleaned_up {
                if let Some(cgroup) = &self.cgroup {
                    let _ = cgroup.kill();
                    let _ = cgroup.delete();
                }
            }
        }
    }
}

#[cfg(not(target_os = "linux"))]
mod imp {
    use std::process::{Child, Command, Stdio};
    use std::time::Duration;

    use anyhow::bail;
    use tracing::warn;

    use super::SandboxProfile;

    /// Uncontained stand-in for platforms without cgroups; only the wall
    /// clock is enforced.
    #[derive(Debug)]
    pub struct Sandbox {
        cleaned_up: bool,
    }

    impl Sandbox {
        pub fn create(profile: &SandboxProfile) -> anyhow::Result<Sandbox> {
            if !profile.allow_uncontained {
                bail!("sandbox containment requires Linux cgroups v2");
            }
            warn!("running uncontained: resource caps are not enforced on this platform");
            Ok(Sandbox { cleaned_up: false })
        }

        pub fn spawn(&self, command: &mut Command) -> anyhow::Result<Child> {
            use anyhow::Context;
            command.stdin(Stdio::null());
            command.spawn().context("could not spawn referee")
        }

        pub fn destroy(&mut self, child: &mut Child, _cleanup: Duration) {
            if self.cleaned_up {
                return;
            }
            let _ = child.kill();
            let _ = child.wait();
            self.cleaned_up = true;
        }
    }
}

pub use imp::Sandbox;
