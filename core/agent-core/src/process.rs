//! OS process inspection and signalling.
//!
//! The supervisor and reconciler only talk to the process table through
//! [`ProcessProbe`], so tests can substitute a fake table.

use std::io;

use sysinfo::{Pid, ProcessRefreshKind, ProcessStatus, System, UpdateKind};

pub trait ProcessProbe: Send + Sync {
    /// Lowest pid whose executable name equals `name`, excluding the agent.
    fn find_by_name(&self, name: &str) -> Option<u32>;

    /// Whether `pid` exists and has not exited. Zombies count as exited.
    fn is_alive(&self, pid: u32) -> bool;

    /// Sends SIGTERM to `pid`.
    fn terminate(&self, pid: u32) -> io::Result<()>;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct SystemProbe;

impl ProcessProbe for SystemProbe {
    fn find_by_name(&self, name: &str) -> Option<u32> {
        if name.is_empty() {
            return None;
        }
        let mut sys = System::new();
        sys.refresh_processes_specifics(
            ProcessRefreshKind::new().with_exe(UpdateKind::OnlyIfNotSet),
        );
        let own_pid = std::process::id();

        sys.processes()
            .iter()
            .filter(|(pid, process)| {
                pid.as_u32() != own_pid
                    && process.status() != ProcessStatus::Zombie
                    && executable_matches(process.name(), process.exe(), name)
            })
            .map(|(pid, _)| pid.as_u32())
            .min()
    }

    fn is_alive(&self, pid: u32) -> bool {
        if !signal_reaches(pid) {
            return false;
        }
        let mut sys = System::new();
        let sys_pid = Pid::from(pid as usize);
        sys.refresh_process_specifics(sys_pid, ProcessRefreshKind::new());
        match sys.process(sys_pid) {
            Some(process) => process.status() != ProcessStatus::Zombie,
            // kill(0) succeeded, so the process exists even if unreadable here.
            None => true,
        }
    }

    fn terminate(&self, pid: u32) -> io::Result<()> {
        let raw = to_raw_pid(pid)?;
        #[cfg(unix)]
        {
            if unsafe { libc::kill(raw, libc::SIGTERM) } == 0 {
                Ok(())
            } else {
                Err(io::Error::last_os_error())
            }
        }
        #[cfg(not(unix))]
        {
            let _ = raw;
            Err(io::Error::new(
                io::ErrorKind::Unsupported,
                "signals are not supported on this platform",
            ))
        }
    }
}

fn executable_matches(
    process_name: &str,
    exe: Option<&std::path::Path>,
    wanted: &str,
) -> bool {
    process_name == wanted
        || exe
            .and_then(|path| path.file_name())
            .map(|file_name| file_name == wanted)
            .unwrap_or(false)
}

/// kill(pid, 0): the process exists. EPERM still means it exists.
fn signal_reaches(pid: u32) -> bool {
    let Ok(raw) = to_raw_pid(pid) else {
        return false;
    };
    #[cfg(unix)]
    {
        if unsafe { libc::kill(raw, 0) } == 0 {
            return true;
        }
        io::Error::last_os_error().raw_os_error() == Some(libc::EPERM)
    }
    #[cfg(not(unix))]
    {
        let _ = raw;
        false
    }
}

/// pid 0 and values past i32::MAX would address process groups.
fn to_raw_pid(pid: u32) -> io::Result<i32> {
    match i32::try_from(pid) {
        Ok(raw) if raw > 0 => Ok(raw),
        _ => Err(io::Error::new(
            io::ErrorKind::InvalidInput,
            format!("invalid pid {}", pid),
        )),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::Path;
    use std::process::Command;

    #[test]
    fn own_process_is_alive() {
        assert!(SystemProbe.is_alive(std::process::id()));
    }

    #[test]
    fn invalid_pids_are_rejected() {
        assert!(!SystemProbe.is_alive(0));
        assert!(SystemProbe.terminate(0).is_err());
        assert!(SystemProbe.terminate(u32::MAX).is_err());
    }

    #[test]
    fn reaped_child_is_not_alive() {
        let mut child = Command::new("/bin/sh")
            .args(["-c", "exit 0"])
            .spawn()
            .expect("spawn sh");
        let pid = child.id();
        child.wait().expect("wait");
        assert!(!SystemProbe.is_alive(pid));
    }

    #[test]
    fn terminate_stops_a_child() {
        let mut child = Command::new("/bin/sh")
            .args(["-c", "sleep 30"])
            .spawn()
            .expect("spawn sh");
        SystemProbe.terminate(child.id()).expect("signal");
        let status = child.wait().expect("wait");
        assert!(!status.success());
    }

    #[test]
    fn matches_on_name_or_exe_basename() {
        assert!(executable_matches("lmp", None, "lmp"));
        assert!(executable_matches(
            "lmp_mpi_wrap",
            Some(Path::new("/hpcaas/code/lmp")),
            "lmp"
        ));
        assert!(!executable_matches("bash", Some(Path::new("/bin/bash")), "lmp"));
    }

    #[test]
    fn empty_name_never_matches() {
        assert!(SystemProbe.find_by_name("").is_none());
    }
}
