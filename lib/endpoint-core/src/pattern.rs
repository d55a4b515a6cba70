//! Route patterns with typed path parameters
//!
//! A pattern is a `/`-separated list of segments. A segment is either static
//! text or a parameter written `<name>` or `<converter:name>`:
//!
//! | converter | matches |
//! |---|---|
//! | `string` (default) | any non-empty segment |
//! | `int` | ASCII digits, parsed as `i64` |
//! | `float` | digits with a single `.` |
//! | `slug` | ASCII alphanumerics, `-` and `_` |
//! | `uuid` | a hyphenated UUID |
//! | `path` | the rest of the path, last segment only |

use serde_json::Value;
use std::collections::HashSet;
use thiserror::Error;
use uuid::Uuid;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Converter {
    String,
    Int,
    Float,
    Slug,
    Uuid,
    Path,
}

impl Converter {
    fn parse(name: &str) -> Option<Self> {
        match name {
            "string" => Some(Converter::String),
            "int" => Some(Converter::Int),
            "float" => Some(Converter::Float),
            "slug" => Some(Converter::Slug),
            "uuid" => Some(Converter::Uuid),
            "path" => Some(Converter::Path),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Converter::String => "string",
            Converter::Int => "int",
            Converter::Float => "float",
            Converter::Slug => "slug",
            Converter::Uuid => "uuid",
            Converter::Path => "path",
        }
    }

    /// Lower ranks are tried first when several parameters could match
    pub(crate) fn rank(&self) -> u8 {
        match self {
            Converter::Int => 0,
            Converter::Float => 1,
            Converter::Uuid => 2,
            Converter::Slug => 3,
            Converter::String => 4,
            Converter::Path => 5,
        }
    }

    /// Convert one raw path segment, `None` if it does not match
    pub fn convert(&self, raw: &str) -> Option<PathValue> {
        if raw.is_empty() {
            return None;
        }
        match self {
            Converter::String => Some(PathValue::Str(raw.to_string())),
            Converter::Int => {
                if !raw.bytes().all(|b| b.is_ascii_digit()) {
                    return None;
                }
                raw.parse().ok().map(PathValue::Int)
            }
            Converter::Float => {
                let (int, frac) = raw.split_once('.')?;
                let digits = |s: &str| !s.is_empty() && s.bytes().all(|b| b.is_ascii_digit());
                if !digits(int) || !digits(frac) {
                    return None;
                }
                raw.parse().ok().map(PathValue::Float)
            }
            Converter::Slug => raw
                .bytes()
                .all(|b| b.is_ascii_alphanumeric() || b == b'-' || b == b'_')
                .then(|| PathValue::Str(raw.to_string())),
            Converter::Uuid => Uuid::parse_str(raw).ok().map(PathValue::Uuid),
            Converter::Path => Some(PathValue::Path(raw.to_string())),
        }
    }
}

/// A typed value captured from the request path
#[derive(Clone, Debug, PartialEq)]
pub enum PathValue {
    Str(String),
    Int(i64),
    Float(f64),
    Uuid(Uuid),
    Path(String),
}

impl PathValue {
    pub fn to_json(&self) -> Value {
        match self {
            PathValue::Str(s) | PathValue::Path(s) => Value::String(s.clone()),
            PathValue::Int(i) => Value::from(*i),
            PathValue::Float(f) => Value::from(*f),
            PathValue::Uuid(u) => Value::String(u.to_string()),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Segment {
    Static(String),
    Param { name: String, converter: Converter },
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("{0}")]
pub struct PatternError(pub String);

/// A compiled route pattern
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RoutePattern {
    raw: String,
    segments: Vec<Segment>,
}

impl RoutePattern {
    pub fn parse(raw: &str) -> Result<Self, PatternError> {
        if !raw.starts_with('/') {
            return Err(PatternError("route must start with `/`".to_string()));
        }

        let mut segments: Vec<Segment> = Vec::new();
        let mut names = HashSet::new();
        for part in split_path(raw) {
            if let Some(Segment::Param { converter: Converter::Path, .. }) = segments.last() {
                return Err(PatternError("`path` parameter must be last".to_string()));
            }
            let segment = parse_segment(part)?;
            if let Segment::Param { name, .. } = &segment {
                if !names.insert(name.clone()) {
                    return Err(PatternError(format!("duplicate parameter `{}`", name)));
                }
            }
            segments.push(segment);
        }

        Ok(Self {
            raw: raw.to_string(),
            segments,
        })
    }

    pub fn as_str(&self) -> &str {
        &self.raw
    }

    pub fn segments(&self) -> &[Segment] {
        &self.segments
    }

    pub fn is_static(&self) -> bool {
        self.segments.iter().all(|s| matches!(s, Segment::Static(_)))
    }

    /// Segments with parameter names erased: `/x/<int:id>` becomes `/x/<int>`
    pub fn shape(&self) -> String {
        let parts: Vec<String> = self
            .segments
            .iter()
            .map(|segment| match segment {
                Segment::Static(text) => text.clone(),
                Segment::Param { converter, .. } => format!("<{}>", converter.as_str()),
            })
            .collect();
        format!("/{}", parts.join("/"))
    }
}

/// Key under which route uniqueness is enforced.
///
/// Routes sharing a shape match exactly the same request paths, whatever
/// their parameter names or trailing slashes. Unparsable routes fall back
/// to their canonical segments.
pub fn route_shape(route: &str) -> String {
    match RoutePattern::parse(route) {
        Ok(pattern) => pattern.shape(),
        Err(_) => format!("/{}", split_path(route).collect::<Vec<_>>().join("/")),
    }
}

/// Split a path into non-empty segments, ignoring a trailing slash
pub fn split_path(path: &str) -> impl Iterator<Item = &str> {
    path.trim_start_matches('/')
        .trim_end_matches('/')
        .split('/')
        .filter(|s| !s.is_empty())
}

fn parse_segment(part: &str) -> Result<Segment, PatternError> {
    let Some(inner) = part.strip_prefix('<').and_then(|p| p.strip_suffix('>')) else {
        if part.contains('<') || part.contains('>') {
            return Err(PatternError(format!("malformed segment `{}`", part)));
        }
        return Ok(Segment::Static(part.to_string()));
    };

    let (converter, name) = match inner.split_once(':') {
        Some((conv, name)) => {
            let converter = Converter::parse(conv)
                .ok_or_else(|| PatternError(format!("unknown converter `{}`", conv)))?;
            (converter, name)
        }
        None => (Converter::String, inner),
    };

    let valid_name = name
        .chars()
        .next()
        .is_some_and(|c| c.is_ascii_alphabetic() || c == '_')
        && name.chars().all(|c| c.is_ascii_alphanumeric() || c == '_');
    if !valid_name {
        return Err(PatternError(format!("invalid parameter name `{}`", name)));
    }

    Ok(Segment::Param {
        name: name.to_string(),
        converter,
    })
}
