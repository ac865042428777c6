use std::fmt::Write;

use serde::{Deserialize, Serialize};

/// One step of a path into a document: an object/map key or an array index.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum PathSeg {
    Key(String),
    Index(usize),
}

impl From<&str> for PathSeg {
    fn from(s: &str) -> Self {
        PathSeg::Key(s.to_string())
    }
}

impl From<String> for PathSeg {
    fn from(s: String) -> Self {
        PathSeg::Key(s)
    }
}

impl From<usize> for PathSeg {
    fn from(i: usize) -> Self {
        PathSeg::Index(i)
    }
}

/// Parse a dotted path such as `items.0.name`. Purely numeric segments
/// become [`PathSeg::Index`]. The empty string is the empty (root) path.
pub fn parse_path(dotted: &str) -> Vec<PathSeg> {
    if dotted.is_empty() {
        return Vec::new();
    }
    dotted
        .split('.')
        .map(|seg| match seg.parse::<usize>() {
            Ok(i) => PathSeg::Index(i),
            Err(_) => PathSeg::Key(seg.to_string()),
        })
        .collect()
}

/// Render a path for log and error messages: `items[0].name`.
pub fn display_path(path: &[PathSeg]) -> String {
    let mut out = String::new();
    for seg in path {
        match seg {
            PathSeg::Key(k) => {
                if !out.is_empty() {
                    out.push('.');
                }
                out.push_str(k);
            }
            PathSeg::Index(i) => {
                let _ = write!(out, "[{i}]");
            }
        }
    }
    if out.is_empty() {
        out.push('$');
    }
    out
}

/// Returns `true` when one path is a prefix of the other (including equality).
pub fn related(a: &[PathSeg], b: &[PathSeg]) -> bool {
    let n = a.len().min(b.len());
    a[..n] == b[..n]
}

#[cfg(test)]
mod tests {
    use proptest::prelude::*;

    use super::*;

    #[test]
    fn parse_mixed_segments() {
        assert_eq!(
            parse_path("items.0.name"),
            vec![
                PathSeg::Key("items".into()),
                PathSeg::Index(0),
                PathSeg::Key("name".into())
            ]
        );
        assert!(parse_path("").is_empty());
    }

    #[test]
    fn display_forms() {
        assert_eq!(display_path(&parse_path("items.0.name")), "items[0].name");
        assert_eq!(display_path(&[]), "$");
    }

    #[test]
    fn related_paths() {
        assert!(related(&parse_path("a.b"), &parse_path("a")));
        assert!(related(&parse_path("a"), &parse_path("a.b.c")));
        assert!(!related(&parse_path("a.b"), &parse_path("a.c")));
    }

    proptest! {
        #[test]
        fn parse_inverts_dotted_join(segs in proptest::collection::vec("[a-z]{1,6}|[0-9]{1,3}", 0..6)) {
            let parsed = parse_path(&segs.join("."));
            prop_assert_eq!(parsed.len(), segs.len());
            for (seg, raw) in parsed.iter().zip(&segs) {
                match seg {
                    PathSeg::Key(k) => prop_assert_eq!(k, raw),
                    PathSeg::Index(i) => prop_assert_eq!(Ok(*i), raw.parse::<usize>()),
                }
            }
        }
    }
}
