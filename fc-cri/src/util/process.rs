//! Pid handling for VMM processes.

use std::path::Path;

use fc_cri_shared::{FcError, FcResult};

/// Read a pid from a file written by the VMM or a daemonized jailer.
/// The file holds a decimal pid, optionally newline-terminated.
pub fn read_pid_file(path: &Path) -> FcResult<u32> {
    let content = std::fs::read_to_string(path)
        .map_err(|e| FcError::Internal(format!("read pid file {}: {}", path.display(), e)))?;

    content.trim().parse::<u32>().map_err(|e| {
        FcError::Internal(format!(
            "invalid pid in {}: '{}': {}",
            path.display(),
            content.trim(),
            e
        ))
    })
}

/// Check whether a process exists, via `kill(pid, 0)`.
pub fn is_process_alive(pid: u32) -> bool {
    unsafe { libc::kill(pid as i32, 0) == 0 }
}

/// SIGKILL a process. Returns true if the process was killed or is already
/// gone, false if the signal could not be delivered.
pub fn kill_process(pid: u32) -> bool {
    unsafe { libc::kill(pid as i32, libc::SIGKILL) == 0 || !is_process_alive(pid) }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn current_process_is_alive() {
        assert!(is_process_alive(std::process::id()));
    }

    #[test]
    fn absurd_pid_is_not_alive() {
        assert!(!is_process_alive(999_999_999));
    }

    #[test]
    fn pid_file_round_trip() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "4242").unwrap();
        assert_eq!(read_pid_file(file.path()).unwrap(), 4242);
    }

    #[test]
    fn pid_file_without_newline() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, "77").unwrap();
        assert_eq!(read_pid_file(file.path()).unwrap(), 77);
    }

    #[test]
    fn garbage_pid_file_errors() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "not-a-pid").unwrap();
        assert!(read_pid_file(file.path()).is_err());
    }

    #[test]
    fn missing_pid_file_errors() {
        assert!(read_pid_file(Path::new("/nonexistent/fc.pid")).is_err());
    }
}
