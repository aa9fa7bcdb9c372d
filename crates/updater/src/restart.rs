//! Relaunching the application after the current process exits.
//!
//! A small self-deleting helper script is written next to the executable and
//! started detached. It waits for the host to exit, starts the program again
//! and removes itself. The host is expected to exit right after scheduling.

use crate::error::{Result, UpdaterError};
use std::fs;
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use std::time::Duration;
use tracing::info;

/// What to relaunch and how.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RelaunchRequest {
    pub executable: PathBuf,
    /// Directory the helper is written to and the program is started from.
    pub working_dir: PathBuf,
    pub delay: Duration,
}

/// A scheduled relaunch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RestartTicket {
    /// Helper script that performs the relaunch.
    pub helper: PathBuf,
    /// Process id of the detached helper.
    pub pid: u32,
}

/// Platform capability that arranges for the application to start again.
pub trait ProcessRelauncher: Send + Sync {
    fn name(&self) -> &'static str;

    /// Start a detached helper that relaunches `request.executable`.
    fn schedule(&self, request: &RelaunchRequest) -> Result<RestartTicket>;
}

/// Relauncher for the current platform.
pub fn platform_relauncher() -> Box<dyn ProcessRelauncher> {
    if cfg!(windows) {
        Box::new(WindowsScriptRelauncher)
    } else {
        Box::new(ShellRelauncher)
    }
}

/// POSIX `sh` helper.
#[derive(Debug, Default, Clone, Copy)]
pub struct ShellRelauncher;

impl ShellRelauncher {
    pub const SCRIPT_NAME: &'static str = "restart.sh";

    /// Write the helper script and return its path.
    pub fn prepare(&self, request: &RelaunchRequest) -> Result<PathBuf> {
        let script = request.working_dir.join(Self::SCRIPT_NAME);
        fs::write(&script, render_shell_script(request)).map_err(UpdaterError::fs(&script))?;
        make_executable(&script)?;
        Ok(script)
    }
}

impl ProcessRelauncher for ShellRelauncher {
    fn name(&self) -> &'static str {
        "sh"
    }

    fn schedule(&self, request: &RelaunchRequest) -> Result<RestartTicket> {
        let script = self.prepare(request)?;
        let mut command = Command::new("sh");
        command.arg(&script);
        let pid = spawn_detached(command, &request.working_dir)?;
        info!(helper = %script.display(), pid, "restart scheduled");
        Ok(RestartTicket {
            helper: script,
            pid,
        })
    }
}

/// Batch file run hidden through `wscript.exe`.
#[derive(Debug, Default, Clone, Copy)]
pub struct WindowsScriptRelauncher;

impl WindowsScriptRelauncher {
    pub const BATCH_NAME: &'static str = "restart.bat";
    pub const LAUNCHER_NAME: &'static str = "restart.vbs";

    /// Write both helper scripts and return the path of the `.vbs` launcher.
    pub fn prepare(&self, request: &RelaunchRequest) -> Result<PathBuf> {
        let batch = request.working_dir.join(Self::BATCH_NAME);
        let launcher = request.working_dir.join(Self::LAUNCHER_NAME);
        fs::write(&batch, render_batch_script(request)).map_err(UpdaterError::fs(&batch))?;
        fs::write(&launcher, render_vbs_launcher(&batch)).map_err(UpdaterError::fs(&launcher))?;
        Ok(launcher)
    }
}

impl ProcessRelauncher for WindowsScriptRelauncher {
    fn name(&self) -> &'static str {
        "wscript"
    }

    fn schedule(&self, request: &RelaunchRequest) -> Result<RestartTicket> {
        let launcher = self.prepare(request)?;
        let mut command = Command::new("wscript.exe");
        command.arg(&launcher);
        let pid = spawn_detached(command, &request.working_dir)?;
        info!(helper = %launcher.display(), pid, "restart scheduled");
        Ok(RestartTicket {
            helper: launcher,
            pid,
        })
    }
}

fn spawn_detached(mut command: Command, working_dir: &Path) -> Result<u32> {
    command
        .current_dir(working_dir)
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::null());

    #[cfg(unix)]
    {
        use std::os::unix::process::CommandExt;
        command.process_group(0);
    }
    #[cfg(windows)]
    {
        use std::os::windows::process::CommandExt;
        const DETACHED_PROCESS: u32 = 0x0000_0008;
        const CREATE_NO_WINDOW: u32 = 0x0800_0000;
        command.creation_flags(DETACHED_PROCESS | CREATE_NO_WINDOW);
    }

    let child = command
        .spawn()
        .map_err(|err| UpdaterError::Other(format!("failed to start restart helper: {err}")))?;
    Ok(child.id())
}

#[cfg(unix)]
fn make_executable(path: &Path) -> Result<()> {
    use std::os::unix::fs::PermissionsExt;
    fs::set_permissions(path, fs::Permissions::from_mode(0o755)).map_err(UpdaterError::fs(path))
}

#[cfg(not(unix))]
fn make_executable(_path: &Path) -> Result<()> {
    Ok(())
}

pub fn render_shell_script(request: &RelaunchRequest) -> String {
    format!(
        "#!/bin/sh\nsleep {delay}\ncd {dir} || exit 1\n{exe} >/dev/null 2>&1 &\nrm -- \"$0\"\n",
        delay = request.delay.as_secs(),
        dir = shell_quote(&request.working_dir),
        exe = shell_quote(&request.executable),
    )
}

pub fn render_batch_script(request: &RelaunchRequest) -> String {
    format!(
        "@echo off\r\n\
         timeout /t {delay} /nobreak > nul\r\n\
         cd /d \"{dir}\"\r\n\
         start \"\" \"{exe}\"\r\n\
         del \"%~dp0{launcher}\"\r\n\
         del \"%~f0\"\r\n",
        delay = request.delay.as_secs(),
        dir = request.working_dir.display(),
        exe = request.executable.display(),
        launcher = WindowsScriptRelauncher::LAUNCHER_NAME,
    )
}

pub fn render_vbs_launcher(batch: &Path) -> String {
    format!(
        "CreateObject(\"WScript.Shell\").Run \"\"\"{}\"\"\", 0, False\r\n",
        batch.display()
    )
}

fn shell_quote(path: &Path) -> String {
    format!("'{}'", path.display().to_string().replace('\'', r"'\''"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn request(dir: &Path) -> RelaunchRequest {
        RelaunchRequest {
            executable: dir.join("GCSD Inventory"),
            working_dir: dir.to_path_buf(),
            delay: Duration::from_secs(2),
        }
    }

    #[test]
    fn shell_script_waits_relaunches_and_removes_itself() {
        let script = render_shell_script(&RelaunchRequest {
            executable: PathBuf::from("/opt/it's here/app"),
            working_dir: PathBuf::from("/opt/it's here"),
            delay: Duration::from_secs(2),
        });
        assert!(script.starts_with("#!/bin/sh\nsleep 2\n"));
        assert!(script.contains(r"'/opt/it'\''s here/app' >/dev/null 2>&1 &"));
        assert!(script.ends_with("rm -- \"$0\"\n"));
    }

    #[test]
    fn batch_script_starts_exe_and_cleans_up_both_helpers() {
        let dir = tempdir().unwrap();
        let batch = render_batch_script(&request(dir.path()));
        assert!(batch.contains("timeout /t 2 /nobreak"));
        assert!(batch.contains(&format!(
            "start \"\" \"{}\"",
            dir.path().join("GCSD Inventory").display()
        )));
        assert!(batch.contains("del \"%~dp0restart.vbs\""));
        assert!(batch.contains("del \"%~f0\""));

        let vbs = render_vbs_launcher(Path::new(r"C:\Apps\GCSD\restart.bat"));
        assert_eq!(
            vbs,
            "CreateObject(\"WScript.Shell\").Run \"\"\"C:\\Apps\\GCSD\\restart.bat\"\"\", 0, False\r\n"
        );
    }

    #[test]
    fn prepare_writes_helpers_into_working_dir() {
        let dir = tempdir().unwrap();
        let script = ShellRelauncher.prepare(&request(dir.path())).unwrap();
        assert_eq!(script, dir.path().join("restart.sh"));
        assert!(fs::read_to_string(&script).unwrap().contains("sleep 2"));

        let launcher = WindowsScriptRelauncher.prepare(&request(dir.path())).unwrap();
        assert_eq!(launcher, dir.path().join("restart.vbs"));
        assert!(dir.path().join("restart.bat").exists());
    }

    #[cfg(unix)]
    #[test]
    fn shell_helper_relaunches_and_deletes_itself() {
        let dir = tempdir().unwrap();
        let marker = dir.path().join("relaunched");
        let program = dir.path().join("app.sh");
        fs::write(&program, format!("#!/bin/sh\ntouch '{}'\n", marker.display())).unwrap();
        make_executable(&program).unwrap();

        let ticket = ShellRelauncher
            .schedule(&RelaunchRequest {
                executable: program,
                working_dir: dir.path().to_path_buf(),
                delay: Duration::ZERO,
            })
            .unwrap();
        assert!(ticket.pid > 0);

        let deadline = std::time::Instant::now() + Duration::from_secs(10);
        while (!marker.exists() || ticket.helper.exists()) && std::time::Instant::now() < deadline {
            std::thread::sleep(Duration::from_millis(50));
        }
        assert!(marker.exists(), "program was not relaunched");
        assert!(!ticket.helper.exists(), "helper script was not removed");
    }
}
