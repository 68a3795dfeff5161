//! Structured queries for the server's text-search index.
//!
//! The query and facet request/response documents are pass-through JSON as
//! far as this layer is concerned; only the constraint shapes sent to the
//! server are typed here.

use chrono::{DateTime, Utc};
use serde::ser::SerializeMap;
use serde::{Serialize, Serializer};

/// Format a timestamp at minute resolution, the granularity the search
/// index stores dates at.
pub fn minute_stamp(t: DateTime<Utc>) -> String {
    t.format("%Y%m%d%H%M").to_string()
}

/// The value shape of a [`SearchParameter`]. Exactly one shape per
/// constraint, enforced by construction.
#[derive(Debug, Clone, PartialEq)]
pub enum ParameterValue {
    Str(String),
    DateRange {
        lower: DateTime<Utc>,
        upper: DateTime<Utc>,
    },
    NumericRange {
        lower: f64,
        upper: f64,
    },
}

/// A parameter constraint for an indexed search: results must carry a
/// parameter with this name/units whose value matches.
#[derive(Debug, Clone, PartialEq)]
pub struct SearchParameter {
    pub name: Option<String>,
    pub units: Option<String>,
    pub value: ParameterValue,
}

impl SearchParameter {
    pub fn string(name: impl Into<String>, units: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            name: Some(name.into()),
            units: Some(units.into()),
            value: ParameterValue::Str(value.into()),
        }
    }

    pub fn date_range(
        name: impl Into<String>,
        units: impl Into<String>,
        lower: DateTime<Utc>,
        upper: DateTime<Utc>,
    ) -> Self {
        Self {
            name: Some(name.into()),
            units: Some(units.into()),
            value: ParameterValue::DateRange { lower, upper },
        }
    }

    pub fn numeric_range(
        name: impl Into<String>,
        units: impl Into<String>,
        lower: f64,
        upper: f64,
    ) -> Self {
        Self {
            name: Some(name.into()),
            units: Some(units.into()),
            value: ParameterValue::NumericRange { lower, upper },
        }
    }
}

impl Serialize for SearchParameter {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        let mut map = serializer.serialize_map(None)?;
        if let Some(name) = &self.name {
            map.serialize_entry("name", name)?;
        }
        if let Some(units) = &self.units {
            map.serialize_entry("units", units)?;
        }
        match &self.value {
            ParameterValue::Str(s) => map.serialize_entry("stringValue", s)?,
            ParameterValue::DateRange { lower, upper } => {
                map.serialize_entry("lowerDateValue", &minute_stamp(*lower))?;
                map.serialize_entry("upperDateValue", &minute_stamp(*upper))?;
            }
            ParameterValue::NumericRange { lower, upper } => {
                map.serialize_entry("lowerNumericValue", lower)?;
                map.serialize_entry("upperNumericValue", upper)?;
            }
        }
        map.end()
    }
}

/// The structured query document sent to the search endpoint. Absent
/// fields are omitted entirely; the facet request is opaque JSON passed
/// through unexamined.
#[derive(Debug, Clone, Serialize)]
pub struct SearchQuery {
    pub target: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub user: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub lower: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub upper: Option<String>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub parameters: Vec<SearchParameter>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub samples: Vec<String>,
    #[serde(rename = "userFullName", skip_serializing_if = "Option::is_none")]
    pub user_full_name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub facets: Option<serde_json::Value>,
}

impl SearchQuery {
    pub fn new(target: impl Into<String>) -> Self {
        Self {
            target: target.into(),
            user: None,
            text: None,
            lower: None,
            upper: None,
            parameters: Vec::new(),
            samples: Vec::new(),
            user_full_name: None,
            facets: None,
        }
    }

    pub fn lower(mut self, t: DateTime<Utc>) -> Self {
        self.lower = Some(minute_stamp(t));
        self
    }

    pub fn upper(mut self, t: DateTime<Utc>) -> Self {
        self.upper = Some(minute_stamp(t));
        self
    }
}
