use std::fs;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};

use mdbook_d2::config::Config;
use mdbook_d2::Build;
use pulldown_cmark::{html, Options, Parser};
use tempfile::TempDir;

/// SVG printed by the fake d2 for every successful render
///
/// The stylesheet and the label would both be mangled if markdown ever
/// parsed them.
pub const FAKE_SVG: &str = r#"<?xml version="1.0" encoding="utf-8"?>
<svg xmlns="http://www.w3.org/2000/svg" viewBox="0 0 1 1"><style>svg > rect { fill: red }</style><rect width="1" height="1"/><text>*emph* label</text></svg>"#;

/// A book directory with a fake `d2` that records every render
pub struct TestBook {
    _dir: TempDir,
    pub root: PathBuf,
    pub src: PathBuf,
    executable: PathBuf,
    log: PathBuf,
    env_log: PathBuf,
}

impl TestBook {
    pub fn new() -> Self {
        Self::with_version("v0.6.5")
    }

    /// A book whose fake d2 reports `version` for `--version`
    pub fn with_version(version: &str) -> Self {
        let dir = TempDir::new().expect("couldn't create temp dir");
        let root = dir.path().to_path_buf();
        let src = root.join("src");
        fs::create_dir_all(&src).expect("couldn't create src dir");

        let log = root.join("d2-calls.log");
        let env_log = root.join("d2-env.log");
        let executable = root.join("fake-d2");
        let script = format!(
            r#"#!/bin/sh
if [ "$1" = "--version" ]; then
  echo "{version}"
  exit 0
fi
prev=""
last=""
for arg in "$@"; do
  prev="$last"
  last="$arg"
done
if [ "$prev" = "-" ]; then
  src=$(cat)
else
  src=$(cat "$prev")
fi
case "$src" in
  *fail*)
    echo "syntax error" >&2
    exit 1
    ;;
esac
echo "$@" >> "{log}"
echo "D2_LAYOUT=${{D2_LAYOUT-}} D2_THEME=${{D2_THEME-}} D2_PAD=${{D2_PAD-}} D2_SKETCH=${{D2_SKETCH-}} ." >> "{env_log}"
cat <<'EOF'
{FAKE_SVG}
EOF
"#,
            log = log.display(),
            env_log = env_log.display()
        );
        fs::write(&executable, script).expect("couldn't write fake d2");
        fs::set_permissions(&executable, fs::Permissions::from_mode(0o755))
            .expect("couldn't make fake d2 executable");

        Self {
            _dir: dir,
            root,
            src,
            executable,
            log,
            env_log,
        }
    }

    /// Default configuration pointing at the fake d2
    pub fn config(&self) -> Config {
        Config {
            executable: self.executable.clone(),
            cache_dir: PathBuf::from("cache"),
            ..Config::default()
        }
    }

    /// Writes a file below the source directory
    pub fn write(&self, path: impl AsRef<Path>, content: &str) {
        let path = self.src.join(path);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).expect("couldn't create parent dir");
        }
        fs::write(path, content).expect("couldn't write source file");
    }

    pub fn open(&self, config: &Config) -> anyhow::Result<Build> {
        Build::open(config, &self.root, self.src.clone())
    }

    /// Runs one build over a single chapter at `chapter.md`
    pub fn render(&self, config: &Config, chapter: &str) -> String {
        self.render_at(config, "chapter.md", chapter)
    }

    pub fn render_at(&self, config: &Config, path: &str, chapter: &str) -> String {
        let build = self.open(config).expect("couldn't open build");
        let output = build
            .process_chapter(chapter, Some(Path::new(path)))
            .expect("couldn't process chapter");
        build.close();
        output
    }

    /// Arguments of every successful render so far
    pub fn calls(&self) -> Vec<String> {
        read_lines(&self.log)
    }

    /// `D2_*` variables seen by every successful render so far
    pub fn envs(&self) -> Vec<String> {
        read_lines(&self.env_log)
    }
}

fn read_lines(path: &Path) -> Vec<String> {
    fs::read_to_string(path)
        .map(|log| log.lines().map(str::to_owned).collect())
        .unwrap_or_default()
}

/// Renders processed chapter markdown the way mdBook's HTML renderer parses it
pub fn to_html(markdown: &str) -> String {
    let mut out = String::new();
    html::push_html(&mut out, Parser::new_ext(markdown, Options::all()));
    out
}
