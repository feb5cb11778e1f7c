use std::path::Path;
use std::sync::LazyLock;

use log::{error, info};
use pulldown_cmark::{CodeBlockKind, CowStr, Event, Tag, TagEnd};
use regex::Regex;

use crate::cache::Source;
use crate::options::{parse_bool, Overrides, RawValue, ValidationError};
use crate::{compact, escape_html, html_block, Build, D2_CODE_BLOCK_LANG};

/// Hover style shipped with every rendered block
const HOVER_STYLE: &str = "<style>svg>a:hover { text-decoration: underline }</style>";

/// `key`, `key=value`, `key="quoted value"` or `key='quoted value'`
static ATTRIBUTE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#"([^\s=]+)(?:=(?:"([^"]*)"|'([^']*)'|(\S*)))?"#)
        .expect("fence attribute pattern is valid")
});

/// Attributes found on a `d2` fence line
#[derive(Debug, Default, PartialEq)]
pub struct FenceInfo {
    /// Whether the block should be rendered at all (`render=false` opts out)
    pub render: bool,
    pub overrides: Overrides,
}

impl FenceInfo {
    /// Parses an info string such as `d2 pad=10 sketch render=off`
    ///
    /// Returns `None` when the fence is not a d2 block. Bare keys mean `true`.
    pub fn parse(info: &str) -> Option<Result<Self, ValidationError>> {
        let info = info.trim();
        let (lang, rest) = info.split_once(char::is_whitespace).unwrap_or((info, ""));
        if lang != D2_CODE_BLOCK_LANG {
            return None;
        }

        let mut overrides = Overrides::new();
        for caps in ATTRIBUTE.captures_iter(rest) {
            let key = caps[1].to_owned();
            let value = caps
                .get(2)
                .or_else(|| caps.get(3))
                .or_else(|| caps.get(4))
                .map_or(RawValue::Bool(true), |m| RawValue::from(m.as_str()));
            overrides.insert(key, value);
        }

        let render = match overrides.remove("render") {
            None => true,
            Some(value) => match parse_bool("render", &value) {
                Ok(render) => render,
                Err(e) => return Some(Err(ValidationError { errors: vec![e] })),
            },
        };

        Some(Ok(Self { render, overrides }))
    }
}

/// A d2 block being collected
struct OpenBlock {
    info: Result<FenceInfo, ValidationError>,
    /// Windows CRLF line endings can split a code block into several Text
    /// events, so the content is buffered.
    /// See: https://github.com/raphlinus/pulldown-cmark/issues/507
    content: String,
}

/// Replaces d2 fenced blocks in a stream of markdown events
///
/// Nothing survives from one block to the next.
pub struct FenceProcessor<'b> {
    build: &'b Build,
    /// Directory of the chapter, used as d2's working directory
    chapter_dir: &'b Path,
    block: Option<OpenBlock>,
}

impl<'b> FenceProcessor<'b> {
    pub const fn new(build: &'b Build, chapter_dir: &'b Path) -> Self {
        Self {
            build,
            chapter_dir,
            block: None,
        }
    }

    /// Processes a single markdown event, potentially transforming it
    ///
    /// Returns the events to emit (may be empty, one, or multiple events)
    pub fn process_event<'a>(&mut self, event: Event<'a>) -> Vec<Event<'a>> {
        if let Some(block) = self.block.as_mut() {
            return match event {
                Event::Text(text) => {
                    block.content.push_str(&text);
                    vec![]
                }
                Event::End(TagEnd::CodeBlock) => match self.block.take() {
                    Some(block) => self.end_block(block),
                    None => vec![],
                },
                other => vec![other],
            };
        }

        if let Event::Start(Tag::CodeBlock(CodeBlockKind::Fenced(info))) = &event {
            if let Some(info) = FenceInfo::parse(info) {
                self.block = Some(OpenBlock {
                    info,
                    content: String::new(),
                });
                return vec![];
            }
        }
        vec![event]
    }

    /// Renders a completed block, or falls back to the literal source
    fn end_block(&self, block: OpenBlock) -> Vec<Event<'static>> {
        let info = match block.info {
            Ok(info) => info,
            Err(e) => {
                error!("{e}");
                return failure(&e.to_string(), block.content);
            }
        };

        if !info.render {
            info!("Skipping rendering of d2 block");
            return literal(block.content);
        }

        let options = match self.build.defaults().resolve(&info.overrides) {
            Ok(options) => options,
            Err(e) => {
                error!("{e}");
                return failure(&e.to_string(), block.content);
            }
        };

        match self.build.render_variants(
            Source::Inline(block.content.as_bytes()),
            &options,
            Some(self.chapter_dir),
        ) {
            Ok(variants) => {
                let body = variants.markup(|svg| Ok(svg.to_owned()));
                match body {
                    Ok(body) => html_block(&format!(
                        "<div class=\"d2\">{HOVER_STYLE}{}</div>",
                        compact(&body)
                    )),
                    Err(e) => failure(&e.to_string(), block.content),
                }
            }
            Err(message) => {
                error!("Failed to render d2 diagram: {message}");
                failure(&message, block.content)
            }
        }
    }
}

/// The block as a plain `d2` code block
fn literal(content: String) -> Vec<Event<'static>> {
    vec![
        Event::Start(Tag::CodeBlock(CodeBlockKind::Fenced(CowStr::Borrowed(
            D2_CODE_BLOCK_LANG,
        )))),
        Event::Text(content.into()),
        Event::End(TagEnd::CodeBlock),
    ]
}

/// A visible error annotation followed by the original source
fn failure(message: &str, content: String) -> Vec<Event<'static>> {
    let mut events = html_block(&format!(
        "<div class=\"d2-error\"><strong>d2:</strong> <code>{}</code></div>",
        escape_html(message)
    ));
    events.extend(literal(content));
    events
}

#[cfg(test)]
mod tests {
    use test_case::test_case;

    use super::*;

    fn overrides<const N: usize>(pairs: [(&str, RawValue); N]) -> Overrides {
        pairs.into_iter().map(|(k, v)| (k.to_owned(), v)).collect()
    }

    #[test_case("rust"; "other language")]
    #[test_case("d2lang"; "prefix")]
    #[test_case(""; "no language")]
    fn not_a_d2_fence(info: &str) {
        assert!(FenceInfo::parse(info).is_none());
    }

    #[test]
    fn plain_fence_renders() {
        let info = FenceInfo::parse("d2").unwrap().unwrap();
        assert_eq!(
            info,
            FenceInfo {
                render: true,
                overrides: Overrides::new(),
            }
        );
    }

    #[test]
    fn attributes_become_overrides() {
        let info = FenceInfo::parse(r#"d2 pad=10 layout="elk" target='' sketch"#)
            .unwrap()
            .unwrap();
        assert!(info.render);
        assert_eq!(
            info.overrides,
            overrides([
                ("pad", RawValue::from("10")),
                ("layout", RawValue::from("elk")),
                ("target", RawValue::from("")),
                ("sketch", RawValue::Bool(true)),
            ])
        );
    }

    #[test_case("d2 render=false" => false)]
    #[test_case("d2 render=OFF" => false)]
    #[test_case("d2 render=0" => false)]
    #[test_case("d2 render=yes" => true)]
    #[test_case("d2 render" => true)]
    fn render_toggle(info: &str) -> bool {
        FenceInfo::parse(info).unwrap().unwrap().render
    }

    #[test]
    fn bad_render_toggle_is_a_validation_error() {
        let err = FenceInfo::parse("d2 render=perhaps").unwrap().unwrap_err();
        assert_eq!(err.errors[0].field(), "render");
    }

    #[test]
    fn failure_keeps_source_and_escapes_message() {
        let events = failure("unexpected <token>", String::from("a -> b\n"));
        assert_eq!(events.len(), 6);
        assert_eq!(events[0], Event::Start(Tag::HtmlBlock));
        let Event::Html(html) = &events[1] else {
            panic!("expected html, got {:?}", events[1]);
        };
        assert!(html.contains("unexpected &lt;token&gt;"));
        assert_eq!(events[2], Event::End(TagEnd::HtmlBlock));
        assert_eq!(events[4], Event::Text(CowStr::from("a -> b\n")));
    }
}
