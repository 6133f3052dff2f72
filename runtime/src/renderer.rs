//! Template rendering for outbound notifications.
//!
//! Templates are Liquid files named `<name>.md` under a template directory.
//! Context values are exposed under `m` (`{{ m.firstname }}`) and are escaped
//! for Telegram `MarkdownV2` before substitution, so user-supplied text can
//! never break the message markup. Static template text is authored
//! pre-escaped.
//!
//! Templates are read from disk on every call; edits take effect on the next
//! message without a restart.
//!
//! # Example
//!
//! ```no_run
//! use relay_runtime::renderer::TemplateRenderer;
//! use std::collections::BTreeMap;
//!
//! # async fn example() -> Result<(), relay_runtime::renderer::RenderError> {
//! let renderer = TemplateRenderer::new("templates")?;
//! let context = BTreeMap::from([("firstname".to_string(), "Ana".to_string())]);
//! let text = renderer.render("greeting", &context).await?;
//! # Ok(())
//! # }
//! ```

use liquid::model::Value;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use thiserror::Error;

/// Name of the template sent to a chat after it subscribes.
pub const SUBSCRIPTION_SUCCESS: &str = "subscription_success";

/// Characters with a meaning in `MarkdownV2`, all of which must be escaped
/// outside of entities.
const MARKDOWN_V2_SPECIAL: &[char] = &[
    '_', '*', '[', ']', '(', ')', '~', '`', '>', '#', '+', '-', '=', '|', '{', '}', '.', '!', '\\',
];

/// Errors produced while rendering a template.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RenderError {
    /// The template name would escape the template directory.
    #[error("Invalid template name: {0:?}")]
    InvalidName(String),

    /// No template file with that name.
    #[error("Template '{name}' not found at {path}")]
    NotFound {
        /// Requested template
        name: String,
        /// Path that was tried
        path: String,
    },

    /// The template file could not be read.
    #[error("Failed to read template '{name}': {reason}")]
    Io {
        /// Requested template
        name: String,
        /// Underlying I/O error
        reason: String,
    },

    /// The template is not valid Liquid.
    #[error("Failed to parse template '{name}': {reason}")]
    Parse {
        /// Requested template
        name: String,
        /// Parser error
        reason: String,
    },

    /// Rendering failed, typically on a reference to a missing field.
    #[error("Failed to render template '{name}': {reason}")]
    Render {
        /// Requested template
        name: String,
        /// Renderer error
        reason: String,
    },

    /// The Liquid engine could not be initialised.
    #[error("Failed to build template engine: {0}")]
    Engine(String),
}

/// Escape `text` for Telegram `MarkdownV2`.
///
/// ```
/// use relay_runtime::renderer::escape_markdown_v2;
///
/// assert_eq!(escape_markdown_v2("Ana"), "Ana");
/// assert_eq!(escape_markdown_v2("a.b-c"), r"a\.b\-c");
/// ```
#[must_use]
pub fn escape_markdown_v2(text: &str) -> String {
    let mut escaped = String::with_capacity(text.len());
    for c in text.chars() {
        if MARKDOWN_V2_SPECIAL.contains(&c) {
            escaped.push('\\');
        }
        escaped.push(c);
    }
    escaped
}

/// Renders named Liquid templates from a directory.
pub struct TemplateRenderer {
    dir: PathBuf,
    parser: liquid::Parser,
}

impl TemplateRenderer {
    /// Create a renderer reading templates from `dir`.
    ///
    /// The directory is not checked here; a missing template is reported by
    /// [`render`](Self::render).
    ///
    /// # Errors
    ///
    /// Returns [`RenderError::Engine`] if the Liquid parser cannot be built.
    pub fn new(dir: impl Into<PathBuf>) -> Result<Self, RenderError> {
        let parser = liquid::ParserBuilder::with_stdlib()
            .build()
            .map_err(|e| RenderError::Engine(e.to_string()))?;

        Ok(Self {
            dir: dir.into(),
            parser,
        })
    }

    /// Directory templates are read from.
    #[must_use]
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Render template `name` with `context` exposed as `m`.
    ///
    /// # Errors
    ///
    /// - [`RenderError::InvalidName`] if `name` contains a path separator or `..`
    /// - [`RenderError::NotFound`] / [`RenderError::Io`] if the file cannot be read
    /// - [`RenderError::Parse`] if the file is not valid Liquid
    /// - [`RenderError::Render`] if the template references a missing field
    pub async fn render(
        &self,
        name: &str,
        context: &BTreeMap<String, String>,
    ) -> Result<String, RenderError> {
        let path = self.template_path(name)?;

        let source = tokio::fs::read_to_string(&path).await.map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                RenderError::NotFound {
                    name: name.to_string(),
                    path: path.display().to_string(),
                }
            } else {
                RenderError::Io {
                    name: name.to_string(),
                    reason: e.to_string(),
                }
            }
        })?;

        let template = self.parser.parse(&source).map_err(|e| RenderError::Parse {
            name: name.to_string(),
            reason: e.to_string(),
        })?;

        let mut fields = liquid::Object::new();
        for (key, value) in context {
            fields.insert(key.clone().into(), Value::scalar(escape_markdown_v2(value)));
        }
        let mut globals = liquid::Object::new();
        globals.insert("m".into(), Value::Object(fields));

        let text = template.render(&globals).map_err(|e| RenderError::Render {
            name: name.to_string(),
            reason: e.to_string(),
        })?;

        tracing::trace!(template = name, bytes = text.len(), "Rendered template");
        Ok(text)
    }

    fn template_path(&self, name: &str) -> Result<PathBuf, RenderError> {
        if name.is_empty() || name.contains(&['/', '\\'][..]) || name.contains("..") {
            return Err(RenderError::InvalidName(name.to_string()));
        }
        Ok(self.dir.join(format!("{name}.md")))
    }
}
