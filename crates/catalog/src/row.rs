//! CSV header resolution and row normalisation.
//!
//! The parser itself lives in the importer; this module only decides what a
//! header means and whether a row of cells is a usable product row.

use thiserror::Error;

use crate::product::{ProductFields, Sku};

const SKU: &str = "sku";
const NAME: &str = "name";
const DESCRIPTION: &str = "description";
const ACTIVE: &str = "active";

/// Fatal header problems. Any of these fails the whole import.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum HeaderError {
    #[error("CSV file is empty or has no header row")]
    Empty,

    #[error("missing required column(s): {}", .0.join(", "))]
    MissingColumns(Vec<&'static str>),
}

/// Why a single data row was skipped.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RowError {
    #[error("missing sku")]
    MissingSku,

    #[error("missing name")]
    MissingName,

    #[error("invalid active value {0:?}")]
    InvalidActive(String),

    #[error("row is not valid UTF-8")]
    InvalidEncoding,
}

/// Column positions resolved from a header row.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HeaderMap {
    sku: usize,
    name: usize,
    description: Option<usize>,
    active: Option<usize>,
}

/// A validated row ready for upsert.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProductRow {
    pub sku: Sku,
    pub fields: ProductFields,
}

impl HeaderMap {
    /// Resolve column positions. Names are trimmed, case-folded and stripped
    /// of a UTF-8 byte order mark; the first occurrence of a name wins.
    pub fn resolve<I, S>(headers: I) -> Result<Self, HeaderError>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut sku = None;
        let mut name = None;
        let mut description = None;
        let mut active = None;
        let mut seen_any = false;

        for (idx, raw) in headers.into_iter().enumerate() {
            let normalized = raw.as_ref().trim_start_matches('\u{feff}').trim().to_lowercase();
            if !normalized.is_empty() {
                seen_any = true;
            }
            let slot = match normalized.as_str() {
                SKU => &mut sku,
                NAME => &mut name,
                DESCRIPTION => &mut description,
                ACTIVE => &mut active,
                _ => continue,
            };
            if slot.is_none() {
                *slot = Some(idx);
            }
        }

        if !seen_any {
            return Err(HeaderError::Empty);
        }

        match (sku, name) {
            (Some(sku), Some(name)) => Ok(Self {
                sku,
                name,
                description,
                active,
            }),
            (sku, name) => {
                let mut missing = Vec::new();
                if sku.is_none() {
                    missing.push(SKU);
                }
                if name.is_none() {
                    missing.push(NAME);
                }
                Err(HeaderError::MissingColumns(missing))
            }
        }
    }

    pub fn has_active_column(&self) -> bool {
        self.active.is_some()
    }

    /// Normalise one data row. Short rows read missing cells as empty.
    pub fn parse_row<S: AsRef<str>>(&self, cells: &[S]) -> Result<ProductRow, RowError> {
        let cell = |idx: usize| cells.get(idx).map(|c| c.as_ref().trim()).unwrap_or("");

        let sku = Sku::parse(cell(self.sku)).map_err(|_| RowError::MissingSku)?;

        let name = cell(self.name);
        if name.is_empty() {
            return Err(RowError::MissingName);
        }

        let description = self
            .description
            .map(cell)
            .filter(|d| !d.is_empty())
            .map(str::to_string);

        let active = match self.active {
            Some(idx) => parse_active(cell(idx))?,
            None => None,
        };

        Ok(ProductRow {
            sku,
            fields: ProductFields {
                name: name.to_string(),
                description,
                active,
            },
        })
    }

    /// Best-effort SKU for skip samples, even when the row is invalid.
    pub fn raw_sku<'a, S: AsRef<str>>(&self, cells: &'a [S]) -> Option<&'a str> {
        cells
            .get(self.sku)
            .map(|c| c.as_ref().trim())
            .filter(|s| !s.is_empty())
    }
}

/// Parse an `active` cell. Empty means "not specified".
pub fn parse_active(raw: &str) -> Result<Option<bool>, RowError> {
    let value = raw.trim();
    if value.is_empty() {
        return Ok(None);
    }
    match value.to_ascii_lowercase().as_str() {
        "true" | "1" | "yes" | "y" => Ok(Some(true)),
        "false" | "0" | "no" | "n" => Ok(Some(false)),
        _ => Err(RowError::InvalidActive(value.to_string())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn header(cols: &[&str]) -> HeaderMap {
        HeaderMap::resolve(cols.iter().copied()).unwrap()
    }

    #[test]
    fn resolves_required_columns_in_any_order_and_case() {
        let map = header(&["Description", " NAME ", "\u{feff}Sku"]);
        let row = map.parse_row(&["desc", "Widget", "A1"]).unwrap();
        assert_eq!(row.sku.as_str(), "A1");
        assert_eq!(row.fields.name, "Widget");
        assert_eq!(row.fields.description.as_deref(), Some("desc"));
        assert!(!map.has_active_column());
    }

    #[test]
    fn missing_required_columns_are_reported_together() {
        let err = HeaderMap::resolve(["description", "price"]).unwrap_err();
        assert_eq!(err, HeaderError::MissingColumns(vec!["sku", "name"]));
        assert_eq!(err.to_string(), "missing required column(s): sku, name");
    }

    #[test]
    fn blank_header_is_empty() {
        assert_eq!(HeaderMap::resolve(["", " "]).unwrap_err(), HeaderError::Empty);
        assert_eq!(
            HeaderMap::resolve(Vec::<String>::new()).unwrap_err(),
            HeaderError::Empty
        );
    }

    #[test]
    fn first_duplicate_column_wins() {
        let map = header(&["sku", "name", "name"]);
        let row = map.parse_row(&["A1", "first", "second"]).unwrap();
        assert_eq!(row.fields.name, "first");
    }

    #[test]
    fn rows_without_sku_or_name_are_rejected() {
        let map = header(&["sku", "name", "description"]);
        assert_eq!(map.parse_row(&["", "NoSku", "desc3"]), Err(RowError::MissingSku));
        assert_eq!(map.parse_row(&["A1", "  ", ""]), Err(RowError::MissingName));
        assert_eq!(map.parse_row(&["A1"]), Err(RowError::MissingName));
    }

    #[test]
    fn empty_description_becomes_none() {
        let map = header(&["sku", "name", "description"]);
        let row = map.parse_row(&["A1", "Widget", "   "]).unwrap();
        assert_eq!(row.fields.description, None);
    }

    #[test]
    fn active_column_is_optional_and_validated() {
        let map = header(&["sku", "name", "active"]);
        assert!(map.has_active_column());
        assert_eq!(map.parse_row(&["A1", "W", "No"]).unwrap().fields.active, Some(false));
        assert_eq!(map.parse_row(&["A1", "W", ""]).unwrap().fields.active, None);
        assert_eq!(
            map.parse_row(&["A1", "W", "maybe"]),
            Err(RowError::InvalidActive("maybe".into()))
        );
    }

    #[test]
    fn raw_sku_is_available_for_invalid_rows() {
        let map = header(&["sku", "name"]);
        assert_eq!(map.raw_sku(&[" B2 ", ""]), Some("B2"));
        assert_eq!(map.raw_sku(&["", "x"]), None);
    }

    #[cfg(test)]
    mod proptest_tests {
        use super::*;
        use proptest::prelude::*;

        proptest! {
            /// Any casing or padding of the header names resolves.
            #[test]
            fn header_resolution_ignores_case_and_padding(
                sku in "[sS][kK][uU]",
                name in "[nN][aA][mM][eE]",
                pad in " {0,3}",
            ) {
                let cols = vec![format!("{pad}{sku}{pad}"), format!("{name}{pad}")];
                prop_assert!(HeaderMap::resolve(cols).is_ok());
            }

            /// A row with non-blank sku and name is always accepted and keeps
            /// the trimmed values.
            #[test]
            fn non_blank_rows_are_accepted(
                sku in "[A-Za-z0-9-]{1,20}",
                name in "[A-Za-z][A-Za-z0-9 ]{0,40}",
                pad in " {0,2}",
            ) {
                let map = HeaderMap::resolve(["sku", "name"]).unwrap();
                let row = map
                    .parse_row(&[format!("{pad}{sku}{pad}"), format!("{name}{pad}")])
                    .unwrap();
                prop_assert_eq!(row.sku.as_str(), sku.as_str());
                prop_assert_eq!(row.fields.name, name.trim().to_string());
            }
        }
    }
}
