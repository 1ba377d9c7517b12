use std::path::PathBuf;
use std::process::{Command, Stdio};
use std::time::Duration;

use tracing::{debug, info, warn};

use super::ChromeError;
use super::discovery::query_version;

/// How a browser process is launched.
pub struct LaunchSpec {
    /// Path to the browser executable.
    pub executable: PathBuf,
    /// CDP port the browser will listen on.
    pub port: u16,
    /// Headless or headful.
    pub headless: bool,
    /// Extra command-line arguments appended verbatim.
    pub extra_args: Vec<String>,
}

/// The daemon's browser process. Owned for the daemon's whole lifetime;
/// its death is fatal to the current daemon instance.
pub struct BrowserProcess {
    child: Option<std::process::Child>,
    port: u16,
    user_data_dir: Option<TempDir>,
}

/// A temporary profile directory removed on drop.
struct TempDir {
    path: PathBuf,
}

impl Drop for TempDir {
    fn drop(&mut self) {
        let _ = std::fs::remove_dir_all(&self.path);
    }
}

impl BrowserProcess {
    /// PID of the browser process.
    #[must_use]
    pub fn pid(&self) -> u32 {
        self.child.as_ref().map_or(0, std::process::Child::id)
    }

    /// The CDP port the browser listens on.
    #[must_use]
    pub fn port(&self) -> u16 {
        self.port
    }

    /// Whether the child has exited on its own.
    pub fn has_exited(&mut self) -> bool {
        match self.child.as_mut() {
            Some(child) => matches!(child.try_wait(), Ok(Some(_))),
            None => true,
        }
    }

    /// Terminate the browser: SIGTERM to the process group, a short
    /// grace period, then SIGKILL if it is still alive.
    pub fn shutdown(&mut self) {
        let Some(child) = self.child.as_mut() else {
            return;
        };
        let pid = child.id();

        #[cfg(unix)]
        {
            // PID values fit in i32 on all supported platforms.
            #[allow(clippy::cast_possible_wrap)]
            let pid_i32 = pid as i32;

            // Negative pid targets the whole process group so renderer
            // and GPU children go down with the main process.
            // SAFETY: plain kill(2) with a pid we own.
            if unsafe { libc::kill(-pid_i32, libc::SIGTERM) } != 0 {
                unsafe { libc::kill(pid_i32, libc::SIGTERM) };
            }

            let deadline = std::time::Instant::now() + Duration::from_secs(2);
            while std::time::Instant::now() < deadline {
                if matches!(child.try_wait(), Ok(Some(_))) {
                    debug!(pid, "browser exited after SIGTERM");
                    self.child = None;
                    return;
                }
                std::thread::sleep(Duration::from_millis(100));
            }

            warn!(pid, "browser ignored SIGTERM, escalating to SIGKILL");
            // SAFETY: as above.
            if unsafe { libc::kill(-pid_i32, libc::SIGKILL) } != 0 {
                unsafe { libc::kill(pid_i32, libc::SIGKILL) };
            }
        }
        #[cfg(not(unix))]
        {
            let _ = child.kill();
        }

        let _ = child.wait();
        self.child = None;
    }
}

impl Drop for BrowserProcess {
    fn drop(&mut self) {
        self.shutdown();
        // user_data_dir drops after the process is gone
        self.user_data_dir = None;
    }
}

/// Pick a free TCP port on localhost for the CDP endpoint.
///
/// # Errors
///
/// Returns `ChromeError::LaunchFailed` if no port can be bound.
pub fn pick_cdp_port() -> Result<u16, ChromeError> {
    let listener = std::net::TcpListener::bind("127.0.0.1:0")
        .map_err(|e| ChromeError::LaunchFailed(format!("could not bind a free port: {e}")))?;
    let port = listener
        .local_addr()
        .map_err(|e| ChromeError::LaunchFailed(format!("could not read local address: {e}")))?
        .port();
    drop(listener);
    Ok(port)
}

/// Spawn the browser and poll its debug endpoint until ready.
///
/// A fresh temporary profile directory is created for the process and
/// removed when the [`BrowserProcess`] drops.
///
/// # Errors
///
/// Returns `ChromeError::LaunchFailed` if the process cannot spawn or
/// exits early, `ChromeError::StartupTimeout` if the endpoint does not
/// come up in time.
pub async fn launch_browser(
    spec: LaunchSpec,
    timeout: Duration,
) -> Result<BrowserProcess, ChromeError> {
    let data_dir = std::env::temp_dir().join(format!("browserd-profile-{}", random_suffix()));
    std::fs::create_dir_all(&data_dir)?;
    let user_data_dir = TempDir {
        path: data_dir.clone(),
    };

    let mut cmd = Command::new(&spec.executable);
    cmd.arg(format!("--remote-debugging-port={}", spec.port))
        .arg(format!("--user-data-dir={}", data_dir.display()))
        .arg("--no-first-run")
        .arg("--no-default-browser-check");

    if spec.headless {
        cmd.arg("--headless=new");
    }

    for arg in &spec.extra_args {
        cmd.arg(arg);
    }

    cmd.stdout(Stdio::null()).stderr(Stdio::null());

    let child = cmd.spawn().map_err(|e| {
        ChromeError::LaunchFailed(format!("failed to spawn {}: {e}", spec.executable.display()))
    })?;

    info!(pid = child.id(), port = spec.port, headless = spec.headless, executable = %spec.executable.display(), "browser spawned");

    let mut process = BrowserProcess {
        child: Some(child),
        port: spec.port,
        user_data_dir: Some(user_data_dir),
    };

    let start = tokio::time::Instant::now();
    loop {
        if start.elapsed() > timeout {
            process.shutdown();
            return Err(ChromeError::StartupTimeout { port: spec.port });
        }

        if process.has_exited() {
            return Err(ChromeError::LaunchFailed(
                "browser exited before its debug endpoint came up".into(),
            ));
        }

        if query_version("127.0.0.1", spec.port).await.is_ok() {
            return Ok(process);
        }

        tokio::time::sleep(Duration::from_millis(100)).await;
    }
}

/// Random hex suffix for profile directory names, from `/dev/urandom`
/// with a PID-based fallback.
fn random_suffix() -> String {
    use std::io::Read;
    let mut buf = [0u8; 8];
    if let Ok(mut f) = std::fs::File::open("/dev/urandom") {
        if f.read_exact(&mut buf).is_ok() {
            return buf.iter().fold(String::with_capacity(16), |mut s, b| {
                use std::fmt::Write;
                let _ = write!(s, "{b:02x}");
                s
            });
        }
    }
    let pid = std::process::id();
    let addr = &raw const buf as usize;
    format!("{pid:x}-{addr:x}")
}
