use serde::Serialize;

use crate::errors::EngineError;
use crate::filters::FilterExpr;
use crate::query::Pagination;
use crate::types::SortSpec;

/// One relationship path included in a result, with its own slice options.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct Embed {
    /// Relationship names from the root, e.g. `["tracks", "genre"]`.
    pub path: Vec<String>,
    /// Requested directly (as opposed to implied by a deeper path or a sub-directive).
    pub explicit: bool,
    /// Attributes to render; empty means every visible field.
    pub fields: Vec<String>,
    pub filter: Option<FilterExpr>,
    pub sorts: Vec<SortSpec>,
    pub pagination: Pagination,
}

impl Embed {
    pub fn new<I, S>(path: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            path: path.into_iter().map(Into::into).collect(),
            explicit: true,
            ..Self::default()
        }
    }

    pub fn dotted(&self) -> String {
        self.path.join(".")
    }

    pub fn depth(&self) -> usize {
        self.path.len()
    }

    /// Sub-sorted or sub-paginated embeds need their own per-parent fetch.
    pub fn is_scoped(&self) -> bool {
        !self.sorts.is_empty() || !self.pagination.is_unbounded()
    }

    pub fn with_filter(mut self, filter: FilterExpr) -> Self {
        self.filter = Some(filter);
        self
    }

    pub fn with_sorts(mut self, sorts: Vec<SortSpec>) -> Self {
        self.sorts = sorts;
        self
    }

    pub fn with_pagination(mut self, pagination: Pagination) -> Self {
        self.pagination = pagination;
        self
    }

    pub fn with_fields<I, S>(mut self, fields: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.fields = fields.into_iter().map(Into::into).collect();
        self
    }
}

/// Set of embedded relationship paths. A path appears at most once.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct EmbedSpec {
    embeds: Vec<Embed>,
}

impl EmbedSpec {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds an embed without checking for duplicates; see [`EmbedSpec::validate`].
    pub fn push(&mut self, embed: Embed) {
        self.embeds.push(embed);
    }

    /// Requests `path` explicitly. Implied parent paths are added as needed.
    /// Requesting an explicit path twice is a `DuplicateEmbed`.
    pub fn request(&mut self, path: &[String]) -> Result<&mut Embed, EngineError> {
        if let Some(existing) = self.position(path)
            && self.embeds[existing].explicit
        {
            return Err(EngineError::DuplicateEmbed { path: path.join(".") });
        }
        let index = self.ensure_index(path);
        self.embeds[index].explicit = true;
        Ok(&mut self.embeds[index])
    }

    /// Returns the embed for `path`, adding it (and its parents) implicitly.
    pub fn ensure(&mut self, path: &[String]) -> &mut Embed {
        let index = self.ensure_index(path);
        &mut self.embeds[index]
    }

    fn ensure_index(&mut self, path: &[String]) -> usize {
        for depth in 1..path.len() {
            if self.position(&path[..depth]).is_none() {
                self.embeds.push(Embed {
                    path: path[..depth].to_vec(),
                    ..Embed::default()
                });
            }
        }
        match self.position(path) {
            Some(index) => index,
            None => {
                self.embeds.push(Embed {
                    path: path.to_vec(),
                    ..Embed::default()
                });
                self.embeds.len() - 1
            }
        }
    }

    fn position(&self, path: &[String]) -> Option<usize> {
        self.embeds.iter().position(|embed| embed.path == path)
    }

    pub fn get(&self, path: &[String]) -> Option<&Embed> {
        self.embeds.iter().find(|embed| embed.path == path)
    }

    pub fn get_mut(&mut self, path: &[String]) -> Option<&mut Embed> {
        self.embeds.iter_mut().find(|embed| embed.path == path)
    }

    /// Embeds exactly one level below `parent` (the root when empty).
    pub fn children_of<'a>(&'a self, parent: &'a [String]) -> impl Iterator<Item = &'a Embed> + 'a {
        self.embeds
            .iter()
            .filter(move |embed| embed.path.len() == parent.len() + 1 && embed.path.starts_with(parent))
    }

    pub fn iter(&self) -> impl Iterator<Item = &Embed> {
        self.embeds.iter()
    }

    pub fn is_empty(&self) -> bool {
        self.embeds.is_empty()
    }

    pub fn len(&self) -> usize {
        self.embeds.len()
    }

    /// Rejects specs that name the same path twice and fills in missing parents.
    pub fn validate(&mut self) -> Result<(), EngineError> {
        for (index, embed) in self.embeds.iter().enumerate() {
            if embed.path.is_empty() {
                return Err(EngineError::invalid_field("embeds", "empty embed path"));
            }
            if self.embeds[..index].iter().any(|other| other.path == embed.path) {
                return Err(EngineError::DuplicateEmbed { path: embed.dotted() });
            }
        }
        let paths: Vec<Vec<String>> = self.embeds.iter().map(|embed| embed.path.clone()).collect();
        for path in paths {
            self.ensure_index(&path);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn path(dotted: &str) -> Vec<String> {
        dotted.split('.').map(str::to_string).collect()
    }

    #[test]
    fn requesting_a_path_twice_is_a_duplicate() {
        let mut spec = EmbedSpec::new();
        spec.request(&path("tracks")).unwrap();
        let err = spec.request(&path("tracks")).unwrap_err();
        assert!(matches!(err, EngineError::DuplicateEmbed { ref path } if path == "tracks"));
    }

    #[test]
    fn deeper_paths_imply_parents_without_conflict() {
        let mut spec = EmbedSpec::new();
        spec.request(&path("tracks.genre")).unwrap();
        assert!(!spec.get(&path("tracks")).unwrap().explicit);
        spec.request(&path("tracks")).unwrap();
        assert!(spec.get(&path("tracks")).unwrap().explicit);
        let roots: Vec<_> = spec.children_of(&[]).map(Embed::dotted).collect();
        assert_eq!(roots, vec!["tracks"]);
        let nested: Vec<_> = spec.children_of(&path("tracks")).map(Embed::dotted).collect();
        assert_eq!(nested, vec!["tracks.genre"]);
    }

    #[test]
    fn validate_catches_programmatic_duplicates() {
        let mut spec = EmbedSpec::new();
        spec.push(Embed::new(["tracks"]));
        spec.push(Embed::new(["tracks"]).with_fields(["name"]));
        assert!(matches!(spec.validate(), Err(EngineError::DuplicateEmbed { .. })));

        let mut ok = EmbedSpec::new();
        ok.push(Embed::new(["tracks", "genre"]));
        ok.validate().unwrap();
        assert_eq!(ok.len(), 2);
    }
}
