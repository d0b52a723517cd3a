use std::fs;
use std::io::{BufRead, BufReader, ErrorKind as IoErrorKind, Read};
use std::path::Path;
use std::process::{Command, Stdio};
use std::sync::{Arc, Mutex, mpsc};
use std::time::Instant;

use tracing::{debug, info};

use crate::catalog::Catalog;
use crate::error::{Error, Result};
use crate::invocation::{self, Environment, InvocationSettings, ResolvedInvocation};
use crate::paths::RootPaths;

#[derive(Debug, Clone)]
pub enum ExecEvent {
    FlavorStarted {
        name: String,
    },
    FlavorLog {
        name: String,
        line: String,
    },
    FlavorFinished {
        name: String,
        ok: bool,
        error: Option<String>,
        elapsed_ms: u128,
    },
    RunDone {
        ok: bool,
        error: Option<String>,
    },
}

pub trait ExecSink: Send + Sync {
    fn emit(&self, ev: ExecEvent);
}

#[derive(Default)]
pub struct StdoutSink {
    state: Mutex<StdoutSinkState>,
}

#[derive(Default)]
struct StdoutSinkState {
    started_at: Option<Instant>,
    flavors_ok: Vec<String>,
    flavors_failed: Vec<String>,
}

impl ExecSink for StdoutSink {
    fn emit(&self, ev: ExecEvent) {
        match ev {
            ExecEvent::FlavorStarted { name } => {
                if let Ok(mut s) = self.state.lock() {
                    s.started_at.get_or_insert_with(Instant::now);
                }
                println!("RUN: {name}");
            }
            ExecEvent::FlavorLog { name, line } => println!("[{name}] {line}"),
            ExecEvent::FlavorFinished {
                name,
                ok,
                error,
                elapsed_ms,
            } => {
                if ok {
                    println!("DONE: {name} ({elapsed_ms}ms)");
                } else {
                    println!("FAIL: {name} ({elapsed_ms}ms) {}", error.unwrap_or_default());
                }
                if let Ok(mut s) = self.state.lock() {
                    if ok {
                        s.flavors_ok.push(name);
                    } else {
                        s.flavors_failed.push(name);
                    }
                }
            }
            ExecEvent::RunDone { ok, error } => {
                let Ok(mut s) = self.state.lock() else {
                    return;
                };
                let wall = s.started_at.map(|t| t.elapsed()).unwrap_or_default();
                println!("SUMMARY:");
                println!("  status: {}", if ok { "ok" } else { "failed" });
                println!("  configured: {}", s.flavors_ok.join(", "));
                if !s.flavors_failed.is_empty() {
                    println!("  failed: {}", s.flavors_failed.join(", "));
                }
                println!("  elapsed: {}", format_elapsed_hms(wall.as_secs()));
                if let Some(e) = error {
                    println!("  error: {e}");
                }
                *s = StdoutSinkState::default();
            }
        }
    }
}

#[derive(Clone)]
pub struct ChannelSink {
    tx: mpsc::Sender<ExecEvent>,
}

impl ChannelSink {
    pub fn new(tx: mpsc::Sender<ExecEvent>) -> Self {
        Self { tx }
    }
}

impl ExecSink for ChannelSink {
    fn emit(&self, ev: ExecEvent) {
        let _ = self.tx.send(ev);
    }
}

/// What to do when the stale build directory cannot be removed.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum CleanPolicy {
    /// Swallow every removal error.
    #[default]
    BestEffort,
    /// Ignore only a missing directory; anything else fails the flavor.
    Strict,
}

#[derive(Clone)]
pub struct ExecCtx {
    pub dry_run: bool,
    pub clean: CleanPolicy,
    pub sink: Arc<dyn ExecSink>,
    pub current_flavor: Option<String>,
}

impl ExecCtx {
    pub fn new(dry_run: bool, sink: Arc<dyn ExecSink>) -> Self {
        Self {
            dry_run,
            clean: CleanPolicy::default(),
            sink,
            current_flavor: None,
        }
    }

    pub fn with_clean_policy(mut self, clean: CleanPolicy) -> Self {
        self.clean = clean;
        self
    }

    pub fn set_flavor(&mut self, name: impl Into<String>) {
        self.current_flavor = Some(name.into());
    }

    pub fn log(&self, msg: &str) {
        let name = self
            .current_flavor
            .clone()
            .unwrap_or_else(|| "<none>".into());
        self.sink.emit(ExecEvent::FlavorLog {
            name,
            line: msg.to_string(),
        });
    }

    // Blocks until the child exits; its stdout/stderr are forwarded line by line.
    pub fn run_cmd(&self, mut cmd: Command) -> Result<()> {
        let program = cmd.get_program().to_string_lossy().into_owned();
        if self.dry_run {
            self.log(&format!("DRY-RUN: {:?}", cmd));
            return Ok(());
        }

        let mut child = cmd
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|e| Error::tool(format!("failed to spawn '{program}': {e}")))?;

        let (tx, rx) = mpsc::channel::<String>();
        let mut readers = Vec::new();
        if let Some(out) = child.stdout.take() {
            let tx = tx.clone();
            readers.push(std::thread::spawn(move || read_output_stream(out, tx)));
        }
        if let Some(err) = child.stderr.take() {
            let tx = tx.clone();
            readers.push(std::thread::spawn(move || read_output_stream(err, tx)));
        }
        drop(tx);

        for line in rx {
            if !line.trim().is_empty() {
                self.log(&line);
            }
        }
        for r in readers {
            let _ = r.join();
        }

        let status = child
            .wait()
            .map_err(|e| Error::tool(format!("wait for '{program}' failed: {e}")))?;
        if !status.success() {
            return Err(Error::tool(format!("{program} failed: {status}")));
        }
        Ok(())
    }
}

fn read_output_stream<R: Read>(reader: R, tx: mpsc::Sender<String>) {
    for chunk in BufReader::new(reader).split(b'\n') {
        let Ok(bytes) = chunk else {
            break;
        };
        let line = String::from_utf8_lossy(&bytes);
        let _ = tx.send(line.trim_end_matches('\r').to_string());
    }
}

/// Removes a previous build directory. Returns whether anything was removed.
pub fn remove_stale_build_dir(dir: &Path, policy: CleanPolicy) -> Result<bool> {
    match fs::remove_dir_all(dir) {
        Ok(()) => Ok(true),
        Err(e) if e.kind() == IoErrorKind::NotFound => Ok(false),
        Err(e) => match policy {
            CleanPolicy::BestEffort => {
                debug!(dir = %dir.display(), error = %e, "ignoring stale build dir removal failure");
                Ok(false)
            }
            CleanPolicy::Strict => Err(Error::io(format!(
                "failed to remove stale build dir {}: {e}",
                dir.display()
            ))),
        },
    }
}

fn run_flavor(inv: &ResolvedInvocation, roots: &RootPaths, ctx: &mut ExecCtx) -> Result<()> {
    if !inv.build_dir.starts_with(&roots.output_root) {
        return Err(Error::path(format!(
            "refusing to clean '{}' (outside output root '{}')",
            inv.build_dir.display(),
            roots.output_root.display()
        )));
    }
    debug!(flavor = %inv.flavor, args = ?inv.args, "resolved invocation");

    if ctx.dry_run {
        ctx.log(&format!("DRY-RUN: {}", inv.display_line()));
        return Ok(());
    }

    if remove_stale_build_dir(&inv.build_dir, ctx.clean)? {
        ctx.log(&format!("removed stale {}", inv.build_dir.display()));
    }
    ctx.run_cmd(inv.to_command())
}

/// Configures every flavor of `catalog` in order, stopping at the first failure.
///
/// Returns the names of the flavors that were configured.
pub fn execute_catalog(
    catalog: &Catalog,
    roots: &RootPaths,
    settings: &InvocationSettings,
    ctx: &mut ExecCtx,
) -> Result<Vec<String>> {
    let mut done = Vec::with_capacity(catalog.len());
    for (name, spec) in catalog.iter() {
        ctx.sink.emit(ExecEvent::FlavorStarted { name: name.into() });
        ctx.set_flavor(name);
        info!(flavor = name, "configuring");
        let start = Instant::now();

        // Environment is re-read for every flavor so overrides never leak forward.
        let res = invocation::build(spec, roots, settings, &Environment::ambient())
            .and_then(|inv| run_flavor(&inv, roots, ctx));
        let elapsed_ms = start.elapsed().as_millis();

        match res {
            Ok(()) => {
                ctx.sink.emit(ExecEvent::FlavorFinished {
                    name: name.into(),
                    ok: true,
                    error: None,
                    elapsed_ms,
                });
                info!(flavor = name, elapsed_ms = elapsed_ms as u64, "configured");
                done.push(name.to_string());
            }
            Err(e) => {
                ctx.sink.emit(ExecEvent::FlavorFinished {
                    name: name.into(),
                    ok: false,
                    error: Some(e.to_string()),
                    elapsed_ms,
                });
                let e = e.context(format!("flavor '{name}'"));
                ctx.sink.emit(ExecEvent::RunDone {
                    ok: false,
                    error: Some(e.to_string()),
                });
                return Err(e);
            }
        }
    }
    ctx.sink.emit(ExecEvent::RunDone {
        ok: true,
        error: None,
    });
    Ok(done)
}

/// Resolves every flavor without touching the filesystem or spawning anything.
pub fn plan_catalog(
    catalog: &Catalog,
    roots: &RootPaths,
    settings: &InvocationSettings,
    ambient: &Environment,
) -> Result<Vec<ResolvedInvocation>> {
    catalog
        .iter()
        .map(|(name, spec)| {
            invocation::build(spec, roots, settings, ambient)
                .map_err(|e| e.context(format!("flavor '{name}'")))
        })
        .collect()
}

fn format_elapsed_hms(total_secs: u64) -> String {
    let hours = total_secs / 3600;
    let minutes = (total_secs % 3600) / 60;
    let seconds = total_secs % 60;
    format!("{hours:02}:{minutes:02}:{seconds:02}")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::FlavorSpec;

    fn collect(rx: &mpsc::Receiver<ExecEvent>) -> Vec<ExecEvent> {
        rx.try_iter().collect()
    }

    #[test]
    fn missing_build_dir_is_not_an_error() {
        let tmp = tempfile::tempdir().expect("tempdir");
        let dir = tmp.path().join("output/debug");
        for policy in [CleanPolicy::BestEffort, CleanPolicy::Strict] {
            assert!(!remove_stale_build_dir(&dir, policy).expect("remove"));
        }
    }

    #[test]
    fn existing_build_dir_is_removed_recursively() {
        let tmp = tempfile::tempdir().expect("tempdir");
        let dir = tmp.path().join("output/asan");
        fs::create_dir_all(dir.join("meson-private")).expect("mkdir");
        fs::write(dir.join("build.ninja"), b"stale").expect("write");
        assert!(remove_stale_build_dir(&dir, CleanPolicy::BestEffort).expect("remove"));
        assert!(!dir.exists());
    }

    #[test]
    fn removal_failure_only_surfaces_when_strict() {
        let tmp = tempfile::tempdir().expect("tempdir");
        // A plain file where a directory is expected cannot be removed by remove_dir_all.
        let not_a_dir = tmp.path().join("release");
        fs::write(&not_a_dir, b"x").expect("write");
        assert!(!remove_stale_build_dir(&not_a_dir, CleanPolicy::BestEffort).expect("lenient"));
        let err = remove_stale_build_dir(&not_a_dir, CleanPolicy::Strict).unwrap_err();
        assert_eq!(err.kind(), crate::error::ErrorKind::Io);
    }

    #[test]
    fn dry_run_touches_nothing() {
        let tmp = tempfile::tempdir().expect("tempdir");
        let roots = RootPaths::with_defaults(tmp.path()).expect("roots");
        let stale = roots.output_root.join("debug");
        fs::create_dir_all(&stale).expect("mkdir");

        let settings = InvocationSettings {
            tool: "/nonexistent/meson".into(),
            ..InvocationSettings::default()
        };
        let (tx, rx) = mpsc::channel();
        let mut ctx = ExecCtx::new(true, Arc::new(ChannelSink::new(tx)));
        let done =
            execute_catalog(&Catalog::builtin(), &roots, &settings, &mut ctx).expect("dry run");

        assert_eq!(done.len(), 6);
        assert!(stale.is_dir(), "dry run must not clean");
        let dry_lines = collect(&rx)
            .into_iter()
            .filter(|ev| matches!(ev, ExecEvent::FlavorLog { line, .. } if line.starts_with("DRY-RUN: ")))
            .count();
        assert_eq!(dry_lines, 6);
    }

    #[test]
    fn missing_tool_is_fatal_and_names_flavor() {
        let tmp = tempfile::tempdir().expect("tempdir");
        let roots = RootPaths::with_defaults(tmp.path()).expect("roots");
        let settings = InvocationSettings {
            tool: tmp.path().join("no-such-meson").display().to_string(),
            ..InvocationSettings::default()
        };
        let catalog =
            Catalog::new(vec![FlavorSpec::new("debug"), FlavorSpec::new("release")]).expect("cat");
        let (tx, rx) = mpsc::channel();
        let mut ctx = ExecCtx::new(false, Arc::new(ChannelSink::new(tx)));

        let err = execute_catalog(&catalog, &roots, &settings, &mut ctx).unwrap_err();
        assert_eq!(err.kind(), crate::error::ErrorKind::Tool);
        assert!(err.to_string().starts_with("flavor 'debug': "), "{err}");

        let started: Vec<String> = collect(&rx)
            .into_iter()
            .filter_map(|ev| match ev {
                ExecEvent::FlavorStarted { name } => Some(name),
                _ => None,
            })
            .collect();
        assert_eq!(started, vec!["debug"]);
    }

    #[test]
    fn plan_resolves_every_flavor_in_order() {
        let roots = RootPaths::with_defaults(Path::new("/src/libmpdclient")).expect("roots");
        let plan = plan_catalog(
            &Catalog::builtin(),
            &roots,
            &InvocationSettings::default(),
            &Environment::default(),
        )
        .expect("plan");
        let names: Vec<&str> = plan.iter().map(|i| i.flavor.as_str()).collect();
        assert_eq!(names, vec!["debug", "asan", "release", "musl", "win32", "win64"]);
    }
}
