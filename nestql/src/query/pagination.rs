use serde::{Deserialize, Serialize};

use crate::errors::EngineError;
use crate::query::QueryParams;

pub const LIMIT_PARAM: &str = "limit";
pub const OFFSET_PARAM: &str = "offset";
pub const PAGE_PARAM: &str = "page";

/// Offset/limit window applied at one level of a result tree.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Pagination {
    pub offset: u64,
    pub limit: Option<u64>,
}

impl Pagination {
    pub fn new(offset: u64, limit: Option<u64>) -> Self {
        Self { offset, limit }
    }

    pub fn is_unbounded(&self) -> bool {
        self.offset == 0 && self.limit.is_none()
    }

    /// Applies the window to an already ordered list.
    pub fn apply<T>(&self, items: Vec<T>) -> Vec<T> {
        let skip = usize::try_from(self.offset).unwrap_or(usize::MAX);
        let iter = items.into_iter().skip(skip);
        match self.limit {
            Some(limit) => iter.take(usize::try_from(limit).unwrap_or(usize::MAX)).collect(),
            None => iter.collect(),
        }
    }

    /// Reads `limit`, `offset` and `page`.
    ///
    /// The page size is the explicit limit, else `page_max_size`. A missing
    /// limit defaults to `page_max_size`; an explicit limit above it is rejected.
    /// `page` overrides `offset`.
    pub fn from_params(params: &QueryParams, page_max_size: Option<u64>) -> Result<Self, EngineError> {
        let limit = params
            .get(LIMIT_PARAM)
            .map(|raw| parse_positive(LIMIT_PARAM, raw))
            .transpose()?;
        if let (Some(limit), Some(max)) = (limit, page_max_size)
            && limit > max
        {
            return Err(EngineError::malformed(
                LIMIT_PARAM,
                format!("limit {limit} exceeds the maximum page size of {max}"),
            ));
        }
        let page_size = limit.or(page_max_size);

        let mut offset = match params.get(OFFSET_PARAM) {
            Some(raw) => raw
                .trim()
                .parse::<u64>()
                .map_err(|_| EngineError::malformed(OFFSET_PARAM, "offset must be a non-negative integer"))?,
            None => 0,
        };

        if let Some(raw) = params.get(PAGE_PARAM) {
            let page = parse_positive(PAGE_PARAM, raw)?;
            if page > 1 {
                let Some(size) = page_size else {
                    return Err(EngineError::malformed(
                        PAGE_PARAM,
                        "a page beyond the first requires a limit or a maximum page size",
                    ));
                };
                offset = (page - 1).saturating_mul(size);
            } else {
                offset = 0;
            }
        }

        Ok(Pagination::new(offset, page_size))
    }
}

fn parse_positive(parameter: &str, raw: &str) -> Result<u64, EngineError> {
    match raw.trim().parse::<u64>() {
        Ok(value) if value > 0 => Ok(value),
        _ => Err(EngineError::malformed(parameter, format!("{parameter} must be a positive integer"))),
    }
}

/// Page metadata for a list response.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PaginationInfo {
    pub resources_available: u64,
    pub page_size: Option<u64>,
    pub current_page: u64,
    pub first_page: u64,
    pub last_page: u64,
    pub next_page: Option<u64>,
    pub previous_page: Option<u64>,
}

impl PaginationInfo {
    pub fn new(pagination: &Pagination, resources_available: u64) -> Self {
        let (current_page, last_page) = match pagination.limit {
            Some(size) if size > 0 => {
                let current = pagination.offset / size + 1;
                let last = resources_available.div_ceil(size).max(1);
                (current, last)
            }
            _ => (1, 1),
        };
        Self {
            resources_available,
            page_size: pagination.limit,
            current_page,
            first_page: 1,
            last_page,
            next_page: (current_page < last_page).then_some(current_page + 1),
            previous_page: (current_page > 1).then(|| current_page - 1),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn params(query: &str) -> QueryParams {
        QueryParams::parse(query)
    }

    #[test]
    fn page_translates_to_offset() {
        let pagination = Pagination::from_params(&params("page=3&limit=10"), None).unwrap();
        assert_eq!(pagination, Pagination::new(20, Some(10)));
        let first = Pagination::from_params(&params("page=1&offset=7"), None).unwrap();
        assert_eq!(first, Pagination::new(0, None));
    }

    #[test]
    fn page_max_size_is_default_limit_and_ceiling() {
        let defaulted = Pagination::from_params(&params("page=2"), Some(25)).unwrap();
        assert_eq!(defaulted, Pagination::new(25, Some(25)));
        let err = Pagination::from_params(&params("limit=26"), Some(25)).unwrap_err();
        assert!(matches!(err, EngineError::MalformedQuery { ref parameter, .. } if parameter == "limit"));
    }

    #[test]
    fn invalid_values_are_rejected() {
        for query in ["limit=0", "limit=-1", "limit=x", "offset=-2", "page=0", "page=2"] {
            assert!(Pagination::from_params(&params(query), None).is_err(), "{query}");
        }
    }

    #[test]
    fn info_reports_neighbouring_pages() {
        let info = PaginationInfo::new(&Pagination::new(10, Some(5)), 23);
        assert_eq!(info.current_page, 3);
        assert_eq!(info.last_page, 5);
        assert_eq!(info.next_page, Some(4));
        assert_eq!(info.previous_page, Some(2));

        let single = PaginationInfo::new(&Pagination::default(), 0);
        assert_eq!((single.current_page, single.last_page, single.next_page), (1, 1, None));
    }

    #[test]
    fn apply_windows_items() {
        let window = Pagination::new(1, Some(2)).apply(vec![1, 2, 3, 4]);
        assert_eq!(window, vec![2, 3]);
    }
}
