//! The stylesheet asset used for hover, error and light/dark presentation.

use std::ffi::OsStr;
use std::fs;
use std::path::{Path, PathBuf};

use anyhow::Context;
use log::{info, warn};

/// File name of the stylesheet written next to `book.toml`
pub const STYLESHEET_NAME: &str = "d2.css";

/// Shows the `d2-dark` variant when mdBook runs one of its dark themes
pub const STYLESHEET: &str = r".d2 svg {
  max-width: 100%;
  height: auto;
}

.d2 svg > a:hover {
  text-decoration: underline;
}

.d2-error {
  border-left: 4px solid #d73a49;
  padding: 0.5em 1em;
  margin: 1em 0 0.5em;
}

.d2-dark {
  display: none;
}

html.coal .d2-light,
html.navy .d2-light,
html.ayu .d2-light {
  display: none;
}

html.coal .d2-dark,
html.navy .d2-dark,
html.ayu .d2-dark {
  display: block;
}
";

/// Writes [`STYLESHEET`] into `book_root`
///
/// Warns when `book.toml` does not list it under `output.html.additional-css`.
/// Returns the path of the written file.
pub fn install_stylesheet(book_root: &Path) -> anyhow::Result<PathBuf> {
    let path = book_root.join(STYLESHEET_NAME);
    fs::write(&path, STYLESHEET)
        .with_context(|| format!("Failed to write stylesheet {}", path.display()))?;
    info!("Wrote {}", path.display());

    let book_toml = book_root.join("book.toml");
    match fs::read_to_string(&book_toml) {
        Ok(text) => {
            let config: toml::Value = toml::from_str(&text)
                .with_context(|| format!("Failed to parse {}", book_toml.display()))?;
            if !references_stylesheet(&config) {
                warn!(
                    "Add \"{STYLESHEET_NAME}\" to output.html.additional-css in {}",
                    book_toml.display()
                );
            }
        }
        Err(e) => warn!("Unable to read {}: {e}", book_toml.display()),
    }

    Ok(path)
}

fn references_stylesheet(config: &toml::Value) -> bool {
    config
        .get("output")
        .and_then(|o| o.get("html"))
        .and_then(|h| h.get("additional-css"))
        .and_then(toml::Value::as_array)
        .is_some_and(|css| {
            css.iter()
                .filter_map(toml::Value::as_str)
                .any(|entry| Path::new(entry).file_name() == Some(OsStr::new(STYLESHEET_NAME)))
        })
}

#[cfg(test)]
mod tests {
    use tempfile::TempDir;
    use test_case::test_case;

    use super::*;

    #[test_case("" => false; "empty")]
    #[test_case("[output.html]\nadditional-css = [\"theme/custom.css\"]" => false; "other css")]
    #[test_case("[output.html]\nadditional-css = [\"d2.css\"]" => true; "listed")]
    #[test_case("[output.html]\nadditional-css = [\"assets/d2.css\"]" => true; "nested")]
    fn detects_reference(input: &str) -> bool {
        references_stylesheet(&toml::from_str(input).unwrap())
    }

    #[test]
    fn writes_stylesheet() {
        let tmp = TempDir::new().unwrap();
        fs::write(tmp.path().join("book.toml"), "[book]\ntitle = \"x\"\n").unwrap();

        let path = install_stylesheet(tmp.path()).unwrap();

        assert_eq!(path, tmp.path().join(STYLESHEET_NAME));
        assert_eq!(fs::read_to_string(path).unwrap(), STYLESHEET);
    }
}
