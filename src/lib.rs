//! [D2] diagram [`Preprocessor`] library for [`MdBook`](https://rust-lang.github.io/mdBook/).
//!
//! Fenced `d2` code blocks and images pointing at `.d2` files are rendered
//! to inline SVG by the `d2` command line tool. Renders are cached on disk
//! between builds, keyed by source and options.
//!
//! [D2]: https://d2lang.com

#![deny(
    clippy::all,
    missing_docs,
    missing_debug_implementations,
    missing_copy_implementations
)]
#![warn(clippy::pedantic, clippy::nursery)]

use std::path::{Path, PathBuf};

use anyhow::Context;
use log::warn;
use mdbook::book::Book;
use mdbook::errors::Error;
use mdbook::preprocess::{Preprocessor, PreprocessorContext};
use mdbook::BookItem;
use pulldown_cmark::{Event, Options, Parser, Tag, TagEnd};
use pulldown_cmark_to_cmark::cmark;

pub mod cache;
pub mod config;
pub mod install;
pub mod options;
pub mod render;
pub mod version;

mod fence;
mod image;
mod svg;

use cache::{CacheStore, FileStore, NullStore, Source};
use config::Config;
use fence::FenceProcessor;
use image::ImageProcessor;
use options::{Defaults, RenderOptions};
use render::{Executor, ProcessExecutor, Renderer};

/// The name of this preprocessor
const PREPROCESSOR_NAME: &str = "d2";

/// Configuration key in book.toml for this preprocessor
const PREPROCESSOR_CONFIG_KEY: &str = "preprocessor.d2";

/// The code block language identifier for D2 diagrams
const D2_CODE_BLOCK_LANG: &str = "d2";

/// [D2] diagram generator [`Preprocessor`] for [`MdBook`](https://rust-lang.github.io/mdBook/).
///
/// [D2]: https://d2lang.com
#[derive(Default, Clone, Copy, Debug)]
pub struct D2;

impl Preprocessor for D2 {
    fn name(&self) -> &'static str {
        PREPROCESSOR_NAME
    }

    fn run(&self, ctx: &PreprocessorContext, mut book: Book) -> Result<Book, Error> {
        let config = config_from_context(ctx)?;
        let src_dir = ctx.root.join(&ctx.config.book.src);
        let build = Build::open(&config, &ctx.root, src_dir)?;

        let mut failure = None;
        book.for_each_mut(|section| {
            if failure.is_some() {
                return;
            }
            if let BookItem::Chapter(chapter) = section {
                match build.process_chapter(&chapter.content, chapter.source_path.as_deref()) {
                    Ok(content) => chapter.content = content,
                    Err(e) => {
                        failure = Some(e.context(format!("failed to process chapter {}", chapter.name)));
                    }
                }
            }
        });

        build.close();
        failure.map_or(Ok(book), Err)
    }

    fn supports_renderer(&self, renderer: &str) -> bool {
        renderer == "html"
    }
}

/// Reads `[preprocessor.d2]`, falling back to the defaults when it is absent
fn config_from_context(ctx: &PreprocessorContext) -> anyhow::Result<Config> {
    let config: Option<Config> = ctx
        .config
        .get_deserialized_opt(PREPROCESSOR_CONFIG_KEY)
        .with_context(|| format!("Unable to deserialize [{PREPROCESSOR_CONFIG_KEY}]"))?;
    Ok(config.unwrap_or_default())
}

/// Everything one book build shares: validated defaults, the renderer and its cache
///
/// Opened once before the first chapter and closed once after the last.
#[derive(Debug)]
pub struct Build {
    defaults: Defaults,
    renderer: Renderer,
    /// Absolute path to the source directory of the book
    src_dir: PathBuf,
    closed: bool,
}

impl Build {
    /// Validates the configuration, checks the d2 version and opens the cache
    ///
    /// # Arguments
    /// * `config` - Configuration for the D2 preprocessor
    /// * `root` - Book root; a relative `cache-dir` is resolved against it
    /// * `src_dir` - Absolute path to the book's source directory
    pub fn open(config: &Config, root: &Path, src_dir: PathBuf) -> anyhow::Result<Self> {
        Self::with_executor(config, root, src_dir, Box::new(ProcessExecutor))
    }

    /// Like [`Build::open`], running d2 through `executor`
    pub fn with_executor(
        config: &Config,
        root: &Path,
        src_dir: PathBuf,
        executor: Box<dyn Executor>,
    ) -> anyhow::Result<Self> {
        let defaults = Defaults::from_config(config)
            .with_context(|| format!("Invalid [{PREPROCESSOR_CONFIG_KEY}] configuration"))?;

        version::check_version(
            executor.as_ref(),
            &config.executable,
            &config.min_version,
            config.version_check,
        )?;

        let store: Box<dyn CacheStore> = if config.cache {
            let dir = root.join(&config.cache_dir);
            Box::new(
                FileStore::open(&dir)
                    .with_context(|| format!("Unable to open d2 cache in {}", dir.display()))?,
            )
        } else {
            Box::new(NullStore)
        };

        let renderer = Renderer::new(
            config.executable.clone(),
            defaults.invocation(),
            executor,
            store,
        );
        Ok(Self {
            defaults,
            renderer,
            src_dir,
            closed: false,
        })
    }

    pub(crate) const fn defaults(&self) -> &Defaults {
        &self.defaults
    }

    pub(crate) fn src_dir(&self) -> &Path {
        &self.src_dir
    }

    /// Rewrites one chapter, rendering its d2 blocks and `.d2` images
    ///
    /// # Arguments
    /// * `content` - Markdown source of the chapter
    /// * `source_path` - Chapter path relative to the source directory, if any
    pub fn process_chapter(
        &self,
        content: &str,
        source_path: Option<&Path>,
    ) -> anyhow::Result<String> {
        let chapter_dir = source_path
            .and_then(Path::parent)
            .map_or_else(|| self.src_dir.clone(), |parent| self.src_dir.join(parent));

        let mut fences = FenceProcessor::new(self, &chapter_dir);
        let mut images = ImageProcessor::new(self, &chapter_dir);
        let events = Parser::new_ext(content, Options::all())
            .flat_map(|event| fences.process_event(event))
            .flat_map(|event| images.process_event(event));

        // create a buffer in which we can place the markdown
        let mut buf = String::with_capacity(content.len() + 128);
        cmark(events, &mut buf).context("Failed to convert markdown events back to markdown")?;
        Ok(buf)
    }

    /// Renders `options`, plus its dark variant when a dark theme is set
    pub(crate) fn render_variants(
        &self,
        source: Source<'_>,
        options: &RenderOptions,
        current_dir: Option<&Path>,
    ) -> Result<Variants, String> {
        let light = self
            .renderer
            .render(source, &options.light_variant(), current_dir)
            .into_result()?;
        let dark = match options.dark_variant() {
            Some(dark) => Some(
                self.renderer
                    .render(source, &dark, current_dir)
                    .into_result()?,
            ),
            None => None,
        };
        Ok(Variants { light, dark })
    }

    /// Flushes the cache; the build is over
    ///
    /// Failing to write the cache is logged, not returned.
    pub fn close(mut self) {
        self.closed = true;
        self.save_cache();
    }

    fn save_cache(&self) {
        if let Err(e) = self.renderer.close() {
            warn!("Unable to save d2 cache, diagrams will render again next build: {e}");
        }
    }
}

impl Drop for Build {
    fn drop(&mut self) {
        if !self.closed {
            self.save_cache();
        }
    }
}

/// Rendered SVG for the light theme and, optionally, the dark theme
#[derive(Debug)]
pub(crate) struct Variants {
    light: String,
    dark: Option<String>,
}

impl Variants {
    /// Joins the variants, passing each SVG through `each` first
    pub(crate) fn markup(
        &self,
        mut each: impl FnMut(&str) -> anyhow::Result<String>,
    ) -> anyhow::Result<String> {
        match &self.dark {
            None => each(&self.light),
            Some(dark) => Ok(format!(
                "<div class=\"d2-light\">{}</div><div class=\"d2-dark\">{}</div>",
                each(&self.light)?,
                each(dark)?
            )),
        }
    }
}

/// Wraps `markup` as a standalone HTML block
///
/// The leading newline moves the markup onto its own line even right after
/// a paragraph line or list item text, where an HTML block may interrupt.
pub(crate) fn html_block(markup: &str) -> Vec<Event<'static>> {
    vec![
        Event::Start(Tag::HtmlBlock),
        Event::Html(format!("\n{markup}\n").into()),
        Event::End(TagEnd::HtmlBlock),
    ]
}

/// Drops blank lines, which would end an HTML block in markdown
pub(crate) fn compact(html: &str) -> String {
    html.lines()
        .filter(|line| !line.trim().is_empty())
        .collect::<Vec<_>>()
        .join("\n")
}

/// Escape HTML special characters.
pub(crate) fn escape_html(s: &str) -> String {
    let mut result = String::with_capacity(s.len());
    for c in s.chars() {
        match c {
            '&' => result.push_str("&amp;"),
            '<' => result.push_str("&lt;"),
            '>' => result.push_str("&gt;"),
            '"' => result.push_str("&quot;"),
            '\'' => result.push_str("&#x27;"),
            _ => result.push(c),
        }
    }
    result
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn compact_drops_blank_lines() {
        assert_eq!(compact("<svg>\n\n  \n<g/>\n</svg>\n"), "<svg>\n<g/>\n</svg>");
    }

    #[test]
    fn escape() {
        assert_eq!(escape_html(r#"<a href="x">'&'</a>"#), "&lt;a href=&quot;x&quot;&gt;&#x27;&amp;&#x27;&lt;/a&gt;");
    }

    #[test]
    fn variants_markup() {
        let single = Variants {
            light: String::from("<svg>L</svg>"),
            dark: None,
        };
        assert_eq!(single.markup(|s| Ok(s.to_owned())).unwrap(), "<svg>L</svg>");

        let dual = Variants {
            light: String::from("<svg>L</svg>"),
            dark: Some(String::from("<svg>D</svg>")),
        };
        assert_eq!(
            dual.markup(|s| Ok(s.to_owned())).unwrap(),
            "<div class=\"d2-light\"><svg>L</svg></div><div class=\"d2-dark\"><svg>D</svg></div>"
        );
    }

    #[test]
    fn only_html_is_supported() {
        assert!(D2.supports_renderer("html"));
        assert!(!D2.supports_renderer("epub"));
    }
}
