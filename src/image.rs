use std::fs;
use std::path::{Path, PathBuf};
use std::sync::LazyLock;

use log::{error, warn};
use pulldown_cmark::{Event, Tag, TagEnd};
use regex::{Captures, Regex};

use crate::cache::Source;
use crate::options::{Overrides, RawValue};
use crate::{compact, html_block, svg, Build};

/// File extension of diagram sources referenced as images
const D2_EXTENSION: &str = "d2";

static IMG_TAG: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)<img\b[^>]*>").expect("img tag pattern is valid"));

static TAG_ATTRIBUTE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#"([A-Za-z_:][-A-Za-z0-9_:.]*)(?:\s*=\s*(?:"([^"]*)"|'([^']*)'|([^\s"'=<>`]+)))?"#)
        .expect("tag attribute pattern is valid")
});

/// A `![alt](diagram.d2)` image being collected
struct OpenImage<'a> {
    dest: String,
    alt: String,
    /// Original events, replayed when rendering fails
    events: Vec<Event<'a>>,
}

/// Replaces images that reference `.d2` files with the rendered SVG
///
/// Handles markdown images as well as raw `<img>` tags; on raw tags every
/// attribute except `src` and `alt` is a rendering option. Rendered diagrams
/// become HTML blocks, so references inside headings and table cells, which
/// cannot hold one, are left alone.
pub struct ImageProcessor<'a, 'b> {
    build: &'b Build,
    chapter_dir: &'b Path,
    image: Option<OpenImage<'a>>,
    /// Nesting depth of headings and table cells
    inline_only: usize,
}

impl<'a, 'b> ImageProcessor<'a, 'b> {
    pub const fn new(build: &'b Build, chapter_dir: &'b Path) -> Self {
        Self {
            build,
            chapter_dir,
            image: None,
            inline_only: 0,
        }
    }

    /// Processes a single markdown event, potentially transforming it
    pub fn process_event(&mut self, event: Event<'a>) -> Vec<Event<'a>> {
        if let Some(image) = self.image.as_mut() {
            if let Event::Text(text) | Event::Code(text) = &event {
                image.alt.push_str(text);
            }
            let is_end = matches!(event, Event::End(TagEnd::Image));
            image.events.push(event);
            return if is_end {
                match self.image.take() {
                    Some(image) => self.end_image(image),
                    None => vec![],
                }
            } else {
                vec![]
            };
        }

        match event {
            Event::Start(Tag::Heading { .. } | Tag::TableCell) => {
                self.inline_only += 1;
                vec![event]
            }
            Event::End(TagEnd::Heading(_) | TagEnd::TableCell) => {
                self.inline_only = self.inline_only.saturating_sub(1);
                vec![event]
            }
            Event::Start(Tag::Image { ref dest_url, .. }) if is_diagram(dest_url) => {
                let dest = dest_url.to_string();
                if self.inline_only > 0 {
                    warn!("{dest}: d2 diagrams cannot be inlined in a heading or table cell");
                    return vec![event];
                }
                self.image = Some(OpenImage {
                    dest,
                    alt: String::new(),
                    events: vec![event],
                });
                vec![]
            }
            Event::Html(html) => match self.replace_tags(&html) {
                Some(replaced) => vec![Event::Html(replaced.into())],
                None => vec![Event::Html(html)],
            },
            Event::InlineHtml(html) if self.inline_only == 0 => match self.replace_tags(&html) {
                Some(replaced) => html_block(&replaced),
                None => vec![Event::InlineHtml(html)],
            },
            other => vec![other],
        }
    }

    fn end_image(&self, image: OpenImage<'a>) -> Vec<Event<'a>> {
        match self.render_reference(&image.dest, &image.alt, &Overrides::new()) {
            Some(markup) => html_block(&markup),
            None => image.events,
        }
    }

    /// Renders every `<img src="*.d2">` tag inside a raw HTML fragment
    ///
    /// Returns `None` when no tag was rendered.
    fn replace_tags(&self, html: &str) -> Option<String> {
        if !IMG_TAG.is_match(html) {
            return None;
        }
        let mut rendered = false;
        let replaced = IMG_TAG.replace_all(html, |caps: &Captures<'_>| {
            let tag = &caps[0];
            self.render_tag(tag).map_or_else(
                || tag.to_owned(),
                |markup| {
                    rendered = true;
                    markup
                },
            )
        });
        rendered.then(|| replaced.into_owned())
    }

    fn render_tag(&self, tag: &str) -> Option<String> {
        // skip the tag name itself
        let attrs = tag.get(4..)?.trim_end_matches('>').trim_end_matches('/');

        let mut src = None;
        let mut alt = String::new();
        let mut overrides = Overrides::new();
        for caps in TAG_ATTRIBUTE.captures_iter(attrs) {
            let key = caps[1].to_owned();
            let value = caps.get(2).or_else(|| caps.get(3)).or_else(|| caps.get(4));
            match (key.to_ascii_lowercase().as_str(), value) {
                ("src", Some(v)) => src = Some(v.as_str().to_owned()),
                ("alt", Some(v)) => v.as_str().clone_into(&mut alt),
                ("src" | "alt", None) => {}
                (_, Some(v)) => {
                    overrides.insert(key, RawValue::from(v.as_str()));
                }
                (_, None) => {
                    overrides.insert(key, RawValue::Bool(true));
                }
            }
        }

        let src = src.filter(|src| is_diagram(src))?;
        self.render_reference(&src, &alt, &overrides)
    }

    /// Renders the `.d2` file at `dest` into an inline SVG block
    ///
    /// Problems are logged and yield `None`, leaving the reference untouched.
    fn render_reference(&self, dest: &str, alt: &str, overrides: &Overrides) -> Option<String> {
        let candidate = self.resolve(dest);
        let Ok(path) = fs::canonicalize(&candidate) else {
            warn!("d2 file not found: {}", candidate.display());
            return None;
        };

        let source = match fs::read(&path) {
            Ok(source) => source,
            Err(e) => {
                error!("Unable to read {}: {e}", path.display());
                return None;
            }
        };
        if source.iter().all(u8::is_ascii_whitespace) {
            warn!("{dest}: empty diagram file");
            return None;
        }

        let options = match self.build.defaults().resolve(overrides) {
            Ok(options) => options,
            Err(e) => {
                error!("{dest}: {e}");
                return None;
            }
        };

        let modified = fs::metadata(&path).and_then(|m| m.modified()).ok();
        let variants = match self.build.render_variants(
            Source::File {
                path: &path,
                modified,
            },
            &options,
            None,
        ) {
            Ok(variants) => variants,
            Err(message) => {
                error!("Failed to render d2 diagram {dest}: {message}");
                return None;
            }
        };

        match variants.markup(|rendered| svg::inline_svg(rendered, alt)) {
            Ok(body) => Some(format!("<div class=\"d2\">{}</div>", compact(&body))),
            Err(e) => {
                error!("Unable to inline d2 diagram {dest}: {e}");
                None
            }
        }
    }

    /// Book-absolute paths start at the source directory, others at the chapter
    fn resolve(&self, dest: &str) -> PathBuf {
        dest.strip_prefix('/').map_or_else(
            || self.chapter_dir.join(dest),
            |rooted| self.build.src_dir().join(rooted),
        )
    }
}

fn is_diagram(dest: &str) -> bool {
    Path::new(dest)
        .extension()
        .is_some_and(|ext| ext == D2_EXTENSION)
}
