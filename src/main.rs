use std::path::PathBuf;
use std::{io, process};

use clap::Parser;
use log::{error, warn};
use mdbook::errors::Error;
use mdbook::preprocess::{CmdPreprocessor, Preprocessor};
use mdbook_d2::install::install_stylesheet;
use mdbook_d2::D2;
use semver::{Version, VersionReq};

/// mdBook preprocessor for D2 diagrams.
///
/// Converts fenced `d2` code blocks and images pointing at `.d2` files into inline SVG.
///
/// Configuration options (in `book.toml`):
///
/// [preprocessor.d2]
/// executable = "d2"       # Path to d2 binary (default: "d2")
/// cache = true            # Reuse renders between builds (default: true)
/// cache-dir = ".cache/d2" # Cache directory, relative to the book root
/// layout = "dagre"        # Layout engine (default: "dagre")
/// theme = 0               # Theme id (default: 0)
/// dark-theme = -1         # Dark theme id, -1 disables (default: -1)
/// sketch = false          # Hand-drawn look (default: false)
/// pad = 100               # Padding in pixels (default: 100)
/// scale = -1.0            # Scale factor, -1 fits to screen (default: -1.0)
/// force-appendix = false  # Always add the tooltip/link appendix (default: false)
/// target = "''"           # Board to render (default: root board)
#[derive(clap::Parser)]
#[command(
    name = "mdbook-d2",
    about = "mdBook preprocessor rendering D2 diagrams to inline SVG (see [preprocessor.d2] in book.toml)",
    long_about = "Converts fenced d2 code blocks and images pointing at .d2 files into inline SVG for mdBook.\n\nOptions (set in book.toml):\n  executable: Path to d2 binary (default: 'd2')\n  cache: Reuse renders between builds (default: true)\n  cache-dir: Cache directory relative to the book root (default: '.cache/d2')\n  layout: Layout engine (default: 'dagre')\n  theme: Theme id (default: 0)\n  dark-theme: Dark theme id, -1 disables (default: -1)\n  sketch, pad, scale, force-appendix, target: passed to d2\n  invocation: 'flags' or 'env' (default: 'flags')\n  unknown-options: 'reject' or 'pass-through' (default: 'reject')\n  min-version / version-check: d2 version requirement and severity\n\nExample:\n[preprocessor.d2]\nlayout = 'elk'\ndark-theme = 200\n"
)]
pub struct Args {
    #[clap(subcommand)]
    command: Option<Command>,
}

#[derive(clap::Parser)]
pub enum Command {
    #[clap(
        about = "Check if a renderer is supported",
        long_about = "Checks if the given renderer is supported by this preprocessor. Used internally by mdBook."
    )]
    Supports {
        #[clap(help = "Renderer name (e.g. html)")]
        renderer: String,
    },
    #[clap(
        about = "Install the d2 stylesheet",
        long_about = "Writes d2.css (light/dark variants, error annotations) into the book root."
    )]
    Install {
        #[clap(help = "Book root directory", default_value = ".")]
        dir: PathBuf,
    },
}

fn main() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let args = Args::parse();

    let preprocessor = D2;

    match args.command {
        Some(Command::Supports { renderer }) => handle_supports(&preprocessor, &renderer),
        Some(Command::Install { dir }) => {
            if let Err(e) = install_stylesheet(&dir) {
                error!("Install failed: {e:#}");
                process::exit(1);
            }
        }
        None => {
            if let Err(e) = handle_preprocessing(&preprocessor) {
                error!("Preprocessing failed: {e:#}");
                process::exit(1);
            }
        }
    }
}

fn handle_preprocessing(pre: &dyn Preprocessor) -> Result<(), Error> {
    let (ctx, book) = CmdPreprocessor::parse_input(io::stdin()).map_err(|e| {
        Error::msg(format!(
            "Failed to parse mdBook input: {e}. \
             This preprocessor should be called by mdBook, not directly."
        ))
    })?;

    let book_version = Version::parse(&ctx.mdbook_version).map_err(|e| {
        Error::msg(format!(
            "Invalid mdBook version '{}': {e}",
            ctx.mdbook_version
        ))
    })?;
    let version_req = VersionReq::parse(mdbook::MDBOOK_VERSION)
        .map_err(|e| Error::msg(format!("Invalid version requirement: {e}")))?;

    if !version_req.matches(&book_version) {
        warn!(
            "The {} plugin was built against mdbook version {}, but is being called from version {}",
            pre.name(),
            mdbook::MDBOOK_VERSION,
            ctx.mdbook_version
        );
    }

    let processed_book = pre
        .run(&ctx, book)
        .map_err(|e| e.context(format!("Failed to process book with {} preprocessor", pre.name())))?;

    serde_json::to_writer(io::stdout(), &processed_book)
        .map_err(|e| Error::msg(format!("Failed to write output JSON: {e}")))?;

    Ok(())
}

fn handle_supports(pre: &dyn Preprocessor, renderer: &str) -> ! {
    let supported = pre.supports_renderer(renderer);

    // Signal whether the renderer is supported by exiting with 1 or 0.
    if supported {
        process::exit(0);
    } else {
        process::exit(1);
    }
}
