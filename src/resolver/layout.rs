//! Template-driven candidate URL expansion.

use std::iter::FusedIterator;

use url::Url;

use super::ResolveError;
use crate::store::Record;

/// Known historical storage layouts, most likely first.
pub const DEFAULT_LAYOUTS: [&str; 4] = [
    "{base}{run}/match_{id}.pgn.tar.gz",
    "{base}{run}/match_{id}.pgn",
    "{base}match_{id}.pgn.tar.gz",
    "{base}match_{id}.pgn",
];

/// Expands layout templates into candidate URLs.
///
/// Placeholders: `{base}` (storage root, with trailing slash), `{run}`
/// (training run directory), `{id}` (record identifier) and `{filename}`
/// (discovered filename hint).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LayoutResolver {
    base: String,
    run: String,
    templates: Vec<String>,
}

impl LayoutResolver {
    /// Creates a resolver after checking every template once.
    ///
    /// # Errors
    ///
    /// Returns [`ResolveError::InvalidLayout`] if the list is empty, a
    /// template names neither `{id}` nor `{filename}`, or a sample expansion
    /// does not parse as an absolute URL.
    pub fn new(
        base: &str,
        run: &str,
        templates: &[impl AsRef<str>],
    ) -> Result<Self, ResolveError> {
        if templates.is_empty() {
            return Err(ResolveError::InvalidLayout {
                template: String::new(),
                reason: "at least one layout is required".to_string(),
            });
        }

        let base = if base.ends_with('/') {
            base.to_string()
        } else {
            format!("{base}/")
        };
        let resolver = Self {
            base,
            run: run.to_string(),
            templates: templates.iter().map(|t| t.as_ref().to_string()).collect(),
        };

        for template in &resolver.templates {
            if !template.contains("{id}") && !template.contains("{filename}") {
                return Err(ResolveError::InvalidLayout {
                    template: template.clone(),
                    reason: "must contain {id} or {filename}".to_string(),
                });
            }
            let sample = resolver.expand(template, 1, "match_1.pgn.tar.gz");
            if let Err(e) = Url::parse(&sample) {
                return Err(ResolveError::InvalidLayout {
                    template: template.clone(),
                    reason: format!("expands to '{sample}': {e}"),
                });
            }
        }

        Ok(resolver)
    }

    /// Resolver over the default layouts.
    ///
    /// # Errors
    ///
    /// Returns [`ResolveError::InvalidLayout`] if `base` is not a usable URL root.
    pub fn with_default_layouts(base: &str, run: &str) -> Result<Self, ResolveError> {
        Self::new(base, run, &DEFAULT_LAYOUTS)
    }

    /// Number of candidates produced per record.
    #[must_use]
    pub fn layout_count(&self) -> usize {
        self.templates.len()
    }

    /// Returns the candidate URLs for `record`, lazily, in priority order.
    ///
    /// # Errors
    ///
    /// Returns [`ResolveError::MalformedIdentifier`] if the identifier is not
    /// positive or the filename hint is empty or escapes its directory.
    pub fn candidates(&self, record: &Record) -> Result<Candidates<'_>, ResolveError> {
        self.candidates_for(record.id, &record.source_filename)
    }

    /// Same as [`candidates`](Self::candidates) from raw parts.
    ///
    /// # Errors
    ///
    /// See [`candidates`](Self::candidates).
    pub fn candidates_for(
        &self,
        id: i64,
        source_filename: &str,
    ) -> Result<Candidates<'_>, ResolveError> {
        validate_identifier(id, source_filename)?;
        Ok(Candidates {
            resolver: self,
            id,
            filename: source_filename.to_string(),
            next: 0,
        })
    }

    fn expand(&self, template: &str, id: i64, filename: &str) -> String {
        template
            .replace("{base}", &self.base)
            .replace("{run}", &self.run)
            .replace("{id}", &id.to_string())
            .replace("{filename}", filename)
    }
}

fn validate_identifier(id: i64, source_filename: &str) -> Result<(), ResolveError> {
    if id <= 0 {
        return Err(ResolveError::malformed(id, "identifier must be positive"));
    }
    if source_filename.trim().is_empty() {
        return Err(ResolveError::malformed(id, "empty filename hint"));
    }
    if source_filename.contains(['/', '\\']) || source_filename.contains("..") {
        return Err(ResolveError::malformed(
            id,
            format!("filename hint '{source_filename}' is not a plain file name"),
        ));
    }
    if source_filename.chars().any(char::is_control) {
        return Err(ResolveError::malformed(
            id,
            "filename hint contains control characters",
        ));
    }
    Ok(())
}

/// Lazy candidate sequence for one record.
#[derive(Debug, Clone)]
pub struct Candidates<'a> {
    resolver: &'a LayoutResolver,
    id: i64,
    filename: String,
    next: usize,
}

impl Iterator for Candidates<'_> {
    type Item = String;

    fn next(&mut self) -> Option<Self::Item> {
        let template = self.resolver.templates.get(self.next)?;
        self.next += 1;
        Some(self.resolver.expand(template, self.id, &self.filename))
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        let remaining = self.resolver.templates.len().saturating_sub(self.next);
        (remaining, Some(remaining))
    }
}

impl ExactSizeIterator for Candidates<'_> {}

impl FusedIterator for Candidates<'_> {}
