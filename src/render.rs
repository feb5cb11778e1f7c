//! Running d2 and caching what it prints.

use std::cell::{Cell, RefCell};
use std::ffi::OsStr;
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::process::{Child, Command, Stdio};
use std::sync::LazyLock;

use log::debug;
use regex::Regex;

use crate::cache::{CacheError, CacheKey, CacheStore, Source};
use crate::config::Invocation;
use crate::options::RenderOptions;

/// D2's per-diagram style scope, e.g. `d2-3105263069`
static STYLE_ID: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\bd2-([0-9]{6,})\b").expect("style id pattern is valid"));

/// Outcome of rendering one diagram
///
/// Failures are data: the caller decides how to fall back.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RenderResult {
    /// SVG markup with scoped style ids
    Rendered(String),
    /// Human readable reason, usually d2's stderr
    Failed(String),
}

impl RenderResult {
    /// `Ok(svg)` or `Err(message)`
    pub fn into_result(self) -> Result<String, String> {
        match self {
            Self::Rendered(svg) => Ok(svg),
            Self::Failed(message) => Err(message),
        }
    }
}

/// One process to run
#[derive(Debug, Clone)]
pub struct Execution<'a> {
    /// Executable to spawn
    pub program: &'a Path,
    /// Passed verbatim, never through a shell
    pub args: Vec<String>,
    /// Added to the inherited environment
    pub env: Vec<(String, String)>,
    /// Bytes written to stdin, if any
    pub stdin: Option<&'a [u8]>,
    /// Inherited when `None`
    pub current_dir: Option<&'a Path>,
}

/// Captured result of a finished process
#[derive(Debug, Clone, Default)]
pub struct ExecOutput {
    /// Exited with status zero
    pub success: bool,
    /// Everything written to stdout
    pub stdout: Vec<u8>,
    /// Everything written to stderr
    pub stderr: Vec<u8>,
}

/// Runs external processes
///
/// The seam between the renderer and the operating system.
pub trait Executor {
    /// Runs the process to completion, capturing its output
    ///
    /// Only failing to start or talk to the process is an error; a non-zero
    /// exit is reported through [`ExecOutput::success`].
    fn execute(&self, execution: &Execution<'_>) -> io::Result<ExecOutput>;
}

/// [`Executor`] spawning real child processes
///
/// Blocks until the child exits; there is no timeout.
#[derive(Debug, Default, Clone, Copy)]
pub struct ProcessExecutor;

impl Executor for ProcessExecutor {
    fn execute(&self, execution: &Execution<'_>) -> io::Result<ExecOutput> {
        let mut command = Command::new(execution.program);
        command
            .args(execution.args.iter().map(OsStr::new))
            .envs(execution.env.iter().map(|(k, v)| (k, v)))
            .stdin(if execution.stdin.is_some() {
                Stdio::piped()
            } else {
                Stdio::null()
            })
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());
        if let Some(dir) = execution.current_dir {
            command.current_dir(dir);
        }

        let mut child = command.spawn()?;

        if let Some(input) = execution.stdin {
            // dropping the handle closes stdin so d2 sees EOF
            let mut stdin = child
                .stdin
                .take()
                .ok_or_else(|| io::Error::other("failed to open stdin for d2 process"))?;
            feed(&mut child, &mut stdin, input)?;
        }

        let output = child.wait_with_output()?;
        Ok(ExecOutput {
            success: output.status.success(),
            stdout: output.stdout,
            stderr: output.stderr,
        })
    }
}

/// Writes `input` to the child's stdin
///
/// On any failure but a broken pipe the child is killed and reaped before
/// the error is returned.
fn feed(child: &mut Child, stdin: &mut impl Write, input: &[u8]) -> io::Result<()> {
    match stdin.write_all(input) {
        // d2 may exit before reading everything; its stderr says why
        Err(e) if e.kind() == io::ErrorKind::BrokenPipe => Ok(()),
        Err(e) => {
            let _ = child.kill();
            let _ = child.wait();
            Err(e)
        }
        Ok(()) => Ok(()),
    }
}

/// Turns diagram source and options into SVG, going through the cache
///
/// One renderer exists per build and is shared by both processors.
pub struct Renderer {
    executable: PathBuf,
    invocation: Invocation,
    executor: Box<dyn Executor>,
    store: RefCell<Box<dyn CacheStore>>,
    /// Number of diagrams handed out so far, used to scope style ids
    served: Cell<usize>,
}

impl std::fmt::Debug for Renderer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Renderer")
            .field("executable", &self.executable)
            .field("invocation", &self.invocation)
            .field("served", &self.served.get())
            .finish_non_exhaustive()
    }
}

impl Renderer {
    /// A renderer invoking `executable` through `executor`, caching in `store`
    pub fn new(
        executable: PathBuf,
        invocation: Invocation,
        executor: Box<dyn Executor>,
        store: Box<dyn CacheStore>,
    ) -> Self {
        Self {
            executable,
            invocation,
            executor,
            store: RefCell::new(store),
            served: Cell::new(0),
        }
    }

    /// Renders one diagram
    ///
    /// # Arguments
    /// * `source` - Inline source text or a `.d2` file
    /// * `options` - Resolved rendering options
    /// * `current_dir` - Working directory for inline sources, so relative imports resolve
    pub fn render(
        &self,
        source: Source<'_>,
        options: &RenderOptions,
        current_dir: Option<&Path>,
    ) -> RenderResult {
        let key = CacheKey::new(source, options);

        if let Some(cached) = self.store.borrow().get(&key) {
            debug!("d2 cache hit {key}");
            return RenderResult::Rendered(self.finish(&cached));
        }

        let command_line = options.command_line(self.invocation);
        let mut args = command_line.args;
        let (stdin, dir) = match source {
            Source::Inline(bytes) => {
                args.push(String::from("-"));
                (Some(bytes), current_dir)
            }
            Source::File { path, .. } => {
                args.push(path.to_string_lossy().into_owned());
                (None, path.parent())
            }
        };
        args.push(String::from("-"));

        let execution = Execution {
            program: &self.executable,
            args,
            env: command_line.env,
            stdin,
            current_dir: dir,
        };
        debug!("Running {} {}", self.executable.display(), execution.args.join(" "));

        let output = match self.executor.execute(&execution) {
            Ok(output) => output,
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                return RenderResult::Failed(format!(
                    "failed to find d2 executable `{}`, is it installed?",
                    self.executable.display()
                ));
            }
            Err(e) => {
                return RenderResult::Failed(format!(
                    "failed to run d2 executable `{}`: {e}",
                    self.executable.display()
                ));
            }
        };

        if !output.success {
            return RenderResult::Failed(failure_message(&output));
        }

        let rendered = String::from_utf8_lossy(&output.stdout).trim().to_owned();
        self.store
            .borrow_mut()
            .put(key, rendered.clone().into_bytes());
        RenderResult::Rendered(self.finish(rendered.as_bytes()))
    }

    /// Post-processing shared by fresh and cached output
    fn finish(&self, raw: &[u8]) -> String {
        let serial = self.served.get() + 1;
        self.served.set(serial);
        scope_style_ids(&String::from_utf8_lossy(raw), serial)
    }

    /// Flushes and releases the cache; called once when the build ends
    pub fn close(&self) -> Result<(), CacheError> {
        self.store.borrow_mut().close()
    }
}

fn failure_message(output: &ExecOutput) -> String {
    let stderr = String::from_utf8_lossy(&output.stderr).trim().to_owned();
    if stderr.is_empty() {
        String::from_utf8_lossy(&output.stdout).trim().to_owned()
    } else {
        stderr
    }
}

/// Makes D2's style scope unique per rendered diagram
///
/// Identical sources share one D2 hash and inlined stylesheets are page-wide.
fn scope_style_ids(svg: &str, serial: usize) -> String {
    STYLE_ID
        .replace_all(svg, |caps: &regex::Captures<'_>| format!("d2-{}-{serial}", &caps[1]))
        .into_owned()
}

#[cfg(test)]
pub(crate) mod tests {
    use std::collections::BTreeMap;
    use std::rc::Rc;

    use super::*;
    use crate::cache::NullStore;
    use crate::config::Config;
    use crate::options::{Defaults, Overrides, RawValue};

    /// Replies with a fixed output and counts calls
    #[derive(Clone, Default)]
    pub(crate) struct StubExecutor {
        pub calls: Rc<Cell<usize>>,
        pub last_args: Rc<RefCell<Vec<String>>>,
        pub success: bool,
        pub stdout: String,
        pub stderr: String,
    }

    impl StubExecutor {
        pub(crate) fn ok(stdout: &str) -> Self {
            Self {
                success: true,
                stdout: stdout.to_owned(),
                ..Self::default()
            }
        }

        pub(crate) fn failing(stderr: &str) -> Self {
            Self {
                success: false,
                stderr: stderr.to_owned(),
                ..Self::default()
            }
        }
    }

    impl Executor for StubExecutor {
        fn execute(&self, execution: &Execution<'_>) -> io::Result<ExecOutput> {
            self.calls.set(self.calls.get() + 1);
            *self.last_args.borrow_mut() = execution.args.clone();
            Ok(ExecOutput {
                success: self.success,
                stdout: self.stdout.clone().into_bytes(),
                stderr: self.stderr.clone().into_bytes(),
            })
        }
    }

    /// In-memory store whose contents stay visible to the test
    #[derive(Clone, Default)]
    pub(crate) struct MemoryStore(pub Rc<RefCell<BTreeMap<CacheKey, Vec<u8>>>>);

    impl CacheStore for MemoryStore {
        fn get(&self, key: &CacheKey) -> Option<Vec<u8>> {
            self.0.borrow().get(key).cloned()
        }

        fn put(&mut self, key: CacheKey, value: Vec<u8>) {
            self.0.borrow_mut().insert(key, value);
        }

        fn close(&mut self) -> Result<(), CacheError> {
            Ok(())
        }
    }

    struct MissingExecutable;

    impl Executor for MissingExecutable {
        fn execute(&self, _execution: &Execution<'_>) -> io::Result<ExecOutput> {
            Err(io::Error::from(io::ErrorKind::NotFound))
        }
    }

    fn scenario_options() -> RenderOptions {
        let overrides: Overrides = [
            ("theme", RawValue::Int(0)),
            ("pad", RawValue::Int(100)),
            ("scale", RawValue::Float(-1.0)),
            ("sketch", RawValue::Bool(false)),
        ]
        .into_iter()
        .map(|(k, v)| (k.to_owned(), v))
        .collect();
        Defaults::from_config(&Config::default())
            .unwrap()
            .resolve(&overrides)
            .unwrap()
    }

    fn renderer(executor: &StubExecutor, store: &MemoryStore) -> Renderer {
        Renderer::new(
            PathBuf::from("d2"),
            Invocation::Flags,
            Box::new(executor.clone()),
            Box::new(store.clone()),
        )
    }

    #[test]
    fn successful_render_is_cached() {
        let executor = StubExecutor::ok("  <svg>OK</svg>\n");
        let store = MemoryStore::default();
        let renderer = renderer(&executor, &store);
        let options = scenario_options();

        let result = renderer.render(Source::Inline(b"a -> b"), &options, None);

        assert_eq!(result, RenderResult::Rendered(String::from("<svg>OK</svg>")));
        let key = CacheKey::new(Source::Inline(b"a -> b"), &options);
        assert_eq!(store.0.borrow().get(&key).cloned(), Some(b"<svg>OK</svg>".to_vec()));
        assert_eq!(executor.last_args.borrow().last().unwrap(), "-");
    }

    #[test]
    fn cache_hit_skips_the_process() {
        let executor = StubExecutor::ok("<svg>OK</svg>");
        let store = MemoryStore::default();
        let renderer = renderer(&executor, &store);
        let options = scenario_options();

        let first = renderer.render(Source::Inline(b"a -> b"), &options, None);
        assert_eq!(executor.calls.get(), 1);
        let second = renderer.render(Source::Inline(b"a -> b"), &options, None);

        assert_eq!(first, second);
        assert_eq!(executor.calls.get(), 1);
    }

    #[test]
    fn prepopulated_cache_is_used() {
        let executor = StubExecutor::ok("<svg>fresh</svg>");
        let store = MemoryStore::default();
        let options = scenario_options();
        let key = CacheKey::new(Source::Inline(b"a -> b"), &options);
        store.0.borrow_mut().insert(key, b"<svg>cached</svg>".to_vec());
        let renderer = renderer(&executor, &store);

        for _ in 0..2 {
            let result = renderer.render(Source::Inline(b"a -> b"), &options, None);
            assert_eq!(result, RenderResult::Rendered(String::from("<svg>cached</svg>")));
        }
        assert_eq!(executor.calls.get(), 0);
    }

    #[test]
    fn failures_are_not_cached() {
        let executor = StubExecutor::failing("syntax error\n");
        let store = MemoryStore::default();
        let renderer = renderer(&executor, &store);
        let options = scenario_options();

        let result = renderer.render(Source::Inline(b"a -> b"), &options, None);
        assert_eq!(result, RenderResult::Failed(String::from("syntax error")));
        assert!(store.0.borrow().is_empty());

        renderer.render(Source::Inline(b"a -> b"), &options, None);
        assert_eq!(executor.calls.get(), 2);
    }

    #[test]
    fn missing_executable_is_reported() {
        let renderer = Renderer::new(
            PathBuf::from("/nonexistent/d2"),
            Invocation::Flags,
            Box::new(MissingExecutable),
            Box::new(NullStore),
        );
        let result = renderer.render(Source::Inline(b"a -> b"), &scenario_options(), None);
        let RenderResult::Failed(message) = &result else {
            panic!("expected failure, got {result:?}");
        };
        assert!(message.contains("is it installed"));
    }

    #[test]
    fn dark_variant_renders_separately() {
        let executor = StubExecutor::ok("<svg/>");
        let store = MemoryStore::default();
        let renderer = renderer(&executor, &store);
        let mut overrides = Overrides::new();
        overrides.insert(String::from("dark-theme"), RawValue::Int(200));
        let options = Defaults::from_config(&Config::default())
            .unwrap()
            .resolve(&overrides)
            .unwrap();

        renderer.render(Source::Inline(b"a -> b"), &options.light_variant(), None);
        assert!(executor
            .last_args
            .borrow()
            .contains(&String::from("--theme=0")));
        renderer.render(Source::Inline(b"a -> b"), &options.dark_variant().unwrap(), None);
        assert!(executor
            .last_args
            .borrow()
            .contains(&String::from("--theme=200")));

        assert_eq!(executor.calls.get(), 2);
        assert_eq!(store.0.borrow().len(), 2);
    }

    #[test]
    fn file_sources_are_passed_by_path() {
        let executor = StubExecutor::ok("<svg/>");
        let renderer = renderer(&executor, &MemoryStore::default());
        let path = Path::new("/book/src/arch.d2");

        renderer.render(
            Source::File {
                path,
                modified: None,
            },
            &scenario_options(),
            None,
        );

        let args = executor.last_args.borrow();
        assert_eq!(&args[args.len() - 2..], ["/book/src/arch.d2", "-"]);
    }

    #[test]
    fn style_ids_are_scoped_on_every_path() {
        let svg = r#"<svg class="d2-3105263069"><style>.d2-3105263069 .fill-N1{}</style></svg>"#;
        let executor = StubExecutor::ok(svg);
        let store = MemoryStore::default();
        let renderer = renderer(&executor, &store);
        let options = scenario_options();

        let fresh = renderer.render(Source::Inline(b"x"), &options, None);
        let cached = renderer.render(Source::Inline(b"x"), &options, None);

        assert_eq!(
            fresh,
            RenderResult::Rendered(String::from(
                r#"<svg class="d2-3105263069-1"><style>.d2-3105263069-1 .fill-N1{}</style></svg>"#
            ))
        );
        assert_eq!(
            cached,
            RenderResult::Rendered(String::from(
                r#"<svg class="d2-3105263069-2"><style>.d2-3105263069-2 .fill-N1{}</style></svg>"#
            ))
        );
    }

    /// Fails every write with `kind`
    struct FailingWriter(io::ErrorKind);

    impl Write for FailingWriter {
        fn write(&mut self, _: &[u8]) -> io::Result<usize> {
            Err(io::Error::from(self.0))
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    #[cfg(unix)]
    fn sleeper() -> Child {
        Command::new("sleep")
            .arg("30")
            .stdin(Stdio::null())
            .spawn()
            .unwrap()
    }

    #[cfg(unix)]
    #[test]
    fn failed_write_reaps_the_child() {
        let mut child = sleeper();

        let err = feed(&mut child, &mut FailingWriter(io::ErrorKind::PermissionDenied), b"a -> b")
            .unwrap_err();

        assert_eq!(err.kind(), io::ErrorKind::PermissionDenied);
        assert!(child.try_wait().unwrap().is_some());
    }

    #[cfg(unix)]
    #[test]
    fn broken_pipe_leaves_the_child_to_report() {
        let mut child = sleeper();

        feed(&mut child, &mut FailingWriter(io::ErrorKind::BrokenPipe), b"a -> b").unwrap();

        assert!(child.try_wait().unwrap().is_none());
        child.kill().unwrap();
        child.wait().unwrap();
    }

    #[cfg(unix)]
    #[test]
    fn early_exit_reports_stderr() {
        let input = vec![b'x'; 1 << 20];
        let output = ProcessExecutor
            .execute(&Execution {
                program: Path::new("sh"),
                args: vec![String::from("-c"), String::from("echo bad input >&2; exit 3")],
                env: Vec::new(),
                stdin: Some(input.as_slice()),
                current_dir: None,
            })
            .unwrap();

        assert!(!output.success);
        assert_eq!(String::from_utf8_lossy(&output.stderr).trim(), "bad input");
    }
}
