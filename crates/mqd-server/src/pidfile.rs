//! PID-file mutual exclusion, the offline sentinel, and the watch-manifest
//! self-restart mechanism for the Daemon Loop (C7).

use std::io::Write;
use std::path::Path;
use std::time::SystemTime;

use anyhow::{bail, Context, Result};

/// Claim `path` for this process. Fails if another live process already
/// holds it (checked via `kill(pid, 0)`).
pub fn acquire(path: &str) -> Result<()> {
    if let Ok(existing) = std::fs::read_to_string(path) {
        if let Ok(pid) = existing.trim().parse::<i32>() {
            if pid_is_alive(pid) {
                bail!("another mqd daemon is already running (pid {pid} from {path})");
            }
        }
    }
    let mut file = std::fs::File::create(path)
        .with_context(|| format!("failed to create pidfile {path:?}"))?;
    writeln!(file, "{}", std::process::id())?;
    Ok(())
}

pub fn release(path: &str) {
    let _ = std::fs::remove_file(path);
}

#[cfg(unix)]
fn pid_is_alive(pid: i32) -> bool {
    // kill(pid, 0) checks for existence/permission without sending a signal.
    unsafe { libc::kill(pid, 0) == 0 }
}

#[cfg(not(unix))]
fn pid_is_alive(_pid: i32) -> bool {
    false
}

/// Read the pid recorded in `path`, if the file exists and its owner is
/// still alive.
pub fn read_live_pid(path: &str) -> Option<i32> {
    let contents = std::fs::read_to_string(path).ok()?;
    let pid: i32 = contents.trim().parse().ok()?;
    pid_is_alive(pid).then_some(pid)
}

pub fn sentinel_present(path: &str) -> bool {
    Path::new(path).exists()
}

pub fn set_sentinel(path: &str, present: bool) -> Result<()> {
    if present {
        std::fs::File::create(path)
            .with_context(|| format!("failed to create sentinel {path:?}"))?;
    } else {
        match std::fs::remove_file(path) {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(e).context(format!("failed to remove sentinel {path:?}")),
        }
    }
    Ok(())
}

/// One `(path, mtime)` pair the Daemon Loop checks every tick to decide
/// whether to self-restart via `execve`.
#[derive(Debug, Clone)]
pub struct WatchEntry {
    pub path: String,
    pub mtime: SystemTime,
}

pub fn watch_manifest(paths: &[String]) -> Vec<WatchEntry> {
    paths
        .iter()
        .filter_map(|p| {
            let mtime = std::fs::metadata(p).ok()?.modified().ok()?;
            Some(WatchEntry {
                path: p.clone(),
                mtime,
            })
        })
        .collect()
}

/// True if any watched path's mtime has advanced since `manifest` was
/// captured (including a path that newly exists).
pub fn has_changed(manifest: &[WatchEntry]) -> bool {
    watch_manifest(&manifest.iter().map(|e| e.path.clone()).collect::<Vec<_>>())
        .iter()
        .zip(manifest.iter())
        .any(|(now, then)| now.mtime != then.mtime)
}

/// Re-exec the current process image in place (Unix `execve`), preserving
/// the pid recorded in the PID file across the restart.
#[cfg(unix)]
pub fn reexec() -> Result<()> {
    use std::ffi::CString;

    let exe = std::env::current_exe().context("current_exe")?;
    let exe_c = CString::new(exe.to_string_lossy().as_bytes())?;
    let args: Vec<CString> = std::env::args()
        .map(|a| CString::new(a).unwrap_or_default())
        .collect();
    let mut argv: Vec<*const libc::c_char> = args.iter().map(|a| a.as_ptr()).collect();
    argv.push(std::ptr::null());

    unsafe {
        libc::execv(exe_c.as_ptr(), argv.as_ptr());
    }
    // execv only returns on failure.
    bail!("execv failed for {}", exe.display())
}

#[cfg(not(unix))]
pub fn reexec() -> Result<()> {
    bail!("self-restart via execve is only supported on unix targets")
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn sentinel_round_trips() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("offline").to_string_lossy().into_owned();
        assert!(!sentinel_present(&path));
        set_sentinel(&path, true).unwrap();
        assert!(sentinel_present(&path));
        set_sentinel(&path, false).unwrap();
        assert!(!sentinel_present(&path));
    }

    #[test]
    fn acquire_then_release_allows_reacquire() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("mqd.pid").to_string_lossy().into_owned();
        acquire(&path).unwrap();
        assert!(read_live_pid(&path).is_some());
        release(&path);
        assert!(!Path::new(&path).exists());
    }

    #[test]
    fn watch_manifest_detects_touch() {
        let dir = tempdir().unwrap();
        let file = dir.path().join("config.toml");
        std::fs::write(&file, "a").unwrap();
        let manifest = watch_manifest(&[file.to_string_lossy().into_owned()]);
        assert!(!has_changed(&manifest));

        std::thread::sleep(std::time::Duration::from_millis(10));
        std::fs::write(&file, "b b").unwrap();
        assert!(has_changed(&manifest));
    }
}
