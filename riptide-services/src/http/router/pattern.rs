//! Route pattern grammar.
//!
//! A pattern is `/`-separated segments, each a literal, a `{name[:type]}`
//! parameter, or a trailing `*` wildcard. A trailing slash is encoded as a
//! trailing empty literal segment, which is what keeps `/a` and `/a/`
//! distinct routes all the way through the trie.

use super::RouteError;

/// Declared parameter types, ranked narrowest-first for match ordering.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum ParamType {
    Int,
    Uint,
    Float,
    Uuid,
    Str,
    /// Captures the rest of the path including `/`; final segment only.
    PathRest,
}

impl ParamType {
    fn parse(name: &str) -> Option<ParamType> {
        match name {
            "int" => Some(ParamType::Int),
            "uint" => Some(ParamType::Uint),
            "float" => Some(ParamType::Float),
            "uuid" => Some(ParamType::Uuid),
            "str" => Some(ParamType::Str),
            "path" => Some(ParamType::PathRest),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ParamType::Int => "int",
            ParamType::Uint => "uint",
            ParamType::Float => "float",
            ParamType::Uuid => "uuid",
            ParamType::Str => "str",
            ParamType::PathRest => "path",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Segment {
    /// Literal bytes, matched case-sensitively. The empty literal is the
    /// trailing-slash marker.
    Static(String),
    Param { name: String, ty: ParamType },
    /// Trailing `*`: matches the remainder without binding it.
    Wildcard,
}

/// A parsed, canonicalized route pattern.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Pattern {
    pub raw: String,
    pub segments: Vec<Segment>,
}

impl Pattern {
    pub fn parse(pattern: &str) -> Result<Pattern, RouteError> {
        let invalid = |reason: &'static str| RouteError::InvalidPattern {
            pattern: pattern.to_string(),
            reason,
        };

        let Some(rest) = pattern.strip_prefix('/') else {
            return Err(invalid("pattern must start with '/'"));
        };

        let mut segments = Vec::new();
        let mut names: Vec<&str> = Vec::new();
        let pieces: Vec<&str> = rest.split('/').collect();
        for (idx, piece) in pieces.iter().enumerate() {
            let last = idx == pieces.len() - 1;
            if let Some(prev) = segments.last() {
                // Nothing may follow a rest capture.
                if matches!(
                    prev,
                    Segment::Wildcard
                        | Segment::Param {
                            ty: ParamType::PathRest,
                            ..
                        }
                ) {
                    return Err(invalid("wildcard and path captures must be final"));
                }
            }
            if *piece == "*" {
                if !last {
                    return Err(invalid("wildcard and path captures must be final"));
                }
                segments.push(Segment::Wildcard);
            } else if piece.starts_with('{') {
                let inner = piece
                    .strip_prefix('{')
                    .and_then(|p| p.strip_suffix('}'))
                    .ok_or_else(|| invalid("unterminated parameter segment"))?;
                let (name, ty) = match inner.split_once(':') {
                    Some((name, ty)) => (
                        name,
                        ParamType::parse(ty).ok_or_else(|| invalid("unknown parameter type"))?,
                    ),
                    None => (inner, ParamType::Str),
                };
                if !valid_param_name(name) {
                    return Err(invalid("invalid parameter name"));
                }
                if names.contains(&name) {
                    return Err(invalid("duplicate parameter name"));
                }
                if ty == ParamType::PathRest && !last {
                    return Err(invalid("wildcard and path captures must be final"));
                }
                names.push(name);
                segments.push(Segment::Param {
                    name: name.to_string(),
                    ty,
                });
            } else if piece.is_empty() {
                // Allowed only as the trailing-slash marker (or the root).
                if !last {
                    return Err(invalid("empty segment"));
                }
                segments.push(Segment::Static(String::new()));
            } else {
                if piece.contains(['{', '}']) {
                    return Err(invalid("braces outside a parameter segment"));
                }
                segments.push(Segment::Static(piece.to_string()));
            }
        }

        Ok(Pattern {
            raw: canonical(&segments),
            segments,
        })
    }
}

fn canonical(segments: &[Segment]) -> String {
    let mut out = String::new();
    for segment in segments {
        out.push('/');
        match segment {
            Segment::Static(s) => out.push_str(s),
            Segment::Param { name, ty } => {
                out.push('{');
                out.push_str(name);
                if *ty != ParamType::Str {
                    out.push(':');
                    out.push_str(ty.as_str());
                }
                out.push('}');
            }
            Segment::Wildcard => out.push('*'),
        }
    }
    out
}

fn valid_param_name(name: &str) -> bool {
    let mut chars = name.chars();
    match chars.next() {
        Some(c) if c.is_ascii_alphabetic() || c == '_' => {}
        _ => return false,
    }
    chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn static_and_param_segments_parse() {
        let p = Pattern::parse("/users/{id:int}/posts").unwrap();
        assert_eq!(p.segments.len(), 3);
        assert_eq!(p.raw, "/users/{id:int}/posts");
        assert_eq!(
            p.segments[1],
            Segment::Param {
                name: "id".into(),
                ty: ParamType::Int
            }
        );
    }

    #[test]
    fn untyped_param_defaults_to_str() {
        let p = Pattern::parse("/users/{name}").unwrap();
        assert_eq!(
            p.segments[1],
            Segment::Param {
                name: "name".into(),
                ty: ParamType::Str
            }
        );
        assert_eq!(p.raw, "/users/{name}");
    }

    #[test]
    fn trailing_slash_is_a_distinct_pattern() {
        let a = Pattern::parse("/a").unwrap();
        let b = Pattern::parse("/a/").unwrap();
        assert_ne!(a.raw, b.raw);
        assert_eq!(b.segments.last(), Some(&Segment::Static(String::new())));
    }

    #[test]
    fn root_is_a_single_empty_segment() {
        let p = Pattern::parse("/").unwrap();
        assert_eq!(p.segments, vec![Segment::Static(String::new())]);
    }

    #[test]
    fn rest_captures_must_be_final() {
        assert!(Pattern::parse("/files/{rest:path}/x").is_err());
        assert!(Pattern::parse("/files/*/x").is_err());
        assert!(Pattern::parse("/files/{rest:path}").is_ok());
        assert!(Pattern::parse("/files/*").is_ok());
    }

    #[test]
    fn malformed_patterns_are_rejected() {
        assert!(Pattern::parse("no-slash").is_err());
        assert!(Pattern::parse("/a//b").is_err());
        assert!(Pattern::parse("/a/{unterminated").is_err());
        assert!(Pattern::parse("/a/{x:nope}").is_err());
        assert!(Pattern::parse("/a/{1bad}").is_err());
        assert!(Pattern::parse("/{x}/{x}").is_err());
        assert!(Pattern::parse("/a/b{inline}").is_err());
    }
}
