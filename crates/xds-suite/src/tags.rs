//! Tag expressions selecting scenarios for a run.
//!
//! An expression is a conjunction of clauses joined by `&&` or `and`. A
//! clause is one `@tag` / `not @tag` term or a disjunction of terms joined
//! by `||`, `or` or `,`, optionally wrapped in parentheses.

use std::fmt;
use std::str::FromStr;

use thiserror::Error;
use xds_types::Variant;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TagError {
    #[error("tag expression is empty")]
    Empty,
    #[error("invalid tag term '{0}': tags start with '@'")]
    InvalidTerm(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct TagTerm {
    tag: String,
    negated: bool,
}

impl TagTerm {
    fn matches<S: AsRef<str>>(&self, tags: &[S]) -> bool {
        let present = tags.iter().any(|tag| tag.as_ref() == self.tag);
        present != self.negated
    }

    fn parse(raw: &str) -> Result<Self, TagError> {
        let (negated, tag) = match raw.strip_prefix("not ") {
            Some(rest) => (true, rest.trim()),
            None => (false, raw),
        };
        let malformed = tag.len() < 2
            || !tag.starts_with('@')
            || tag[1..].contains(|c: char| c.is_whitespace() || "()|&,@".contains(c));
        if malformed {
            return Err(TagError::InvalidTerm(raw.to_string()));
        }
        Ok(Self {
            tag: tag.to_string(),
            negated,
        })
    }
}

impl fmt::Display for TagTerm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.negated {
            write!(f, "not {}", self.tag)
        } else {
            f.write_str(&self.tag)
        }
    }
}

/// Conjunction of clauses, each a disjunction of `@tag` / `not @tag` terms.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct TagExpression {
    clauses: Vec<Vec<TagTerm>>,
}

impl TagExpression {
    /// Selects the scenarios of `variant`, narrowed by `base` when given.
    pub fn for_variant(variant: Variant, base: Option<&TagExpression>) -> Self {
        let mut clauses: Vec<Vec<TagTerm>> = variant
            .tags()
            .into_iter()
            .map(|tag| {
                vec![TagTerm {
                    tag,
                    negated: false,
                }]
            })
            .collect();
        if let Some(base) = base {
            clauses.extend(base.clauses.iter().cloned());
        }
        Self { clauses }
    }

    pub fn matches<S: AsRef<str>>(&self, tags: &[S]) -> bool {
        self.clauses
            .iter()
            .all(|clause| clause.iter().any(|term| term.matches(tags)))
    }
}

fn split_any<'a>(value: &'a str, separators: &'a [&'a str]) -> Vec<&'a str> {
    separators.iter().fold(vec![value], |parts, separator| {
        parts
            .into_iter()
            .flat_map(|part| part.split(separator))
            .collect()
    })
}

impl FromStr for TagExpression {
    type Err = TagError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        let mut clauses = Vec::new();
        for raw in split_any(value, &["&&", " and "])
            .into_iter()
            .map(str::trim)
            .filter(|part| !part.is_empty())
        {
            let inner = match raw.strip_prefix('(').and_then(|rest| rest.strip_suffix(')')) {
                Some(inner) => inner.trim(),
                None => raw,
            };
            let clause = split_any(inner, &["||", " or ", ","])
                .into_iter()
                .map(str::trim)
                .map(|term| {
                    if term.is_empty() {
                        Err(TagError::InvalidTerm(raw.to_string()))
                    } else {
                        TagTerm::parse(term)
                    }
                })
                .collect::<Result<Vec<_>, _>>()?;
            clauses.push(clause);
        }
        if clauses.is_empty() {
            return Err(TagError::Empty);
        }
        Ok(Self { clauses })
    }
}

impl fmt::Display for TagExpression {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let rendered: Vec<String> = self
            .clauses
            .iter()
            .map(|clause| {
                let terms: Vec<String> = clause.iter().map(TagTerm::to_string).collect();
                if terms.len() == 1 {
                    terms.join("")
                } else {
                    format!("({})", terms.join(" || "))
                }
            })
            .collect();
        f.write_str(&rendered.join(" && "))
    }
}

#[cfg(test)]
mod tests {
    use super::{TagError, TagExpression};
    use xds_types::Variant;

    #[test]
    fn variant_expression_joins_its_tags() {
        let expression = TagExpression::for_variant(Variant::SotwNonAggregated, None);
        assert_eq!(expression.to_string(), "@sotw && @non-aggregated");

        let base: TagExpression = "@CDS and not @wip".parse().expect("parse");
        let expression = TagExpression::for_variant(Variant::IncrementalAggregated, Some(&base));
        assert_eq!(
            expression.to_string(),
            "@incremental && @aggregated && @CDS && not @wip"
        );
    }

    #[test]
    fn matching_honours_negation() {
        let expression: TagExpression = "@sotw && not @wip".parse().expect("parse");
        assert!(expression.matches(&["@sotw", "@CDS"]));
        assert!(!expression.matches(&["@sotw", "@wip"]));
        assert!(!expression.matches(&["@incremental"]));
    }

    #[test]
    fn alternatives_accept_any_of_their_tags() {
        for raw in ["@LDS,@CDS", "@LDS || @CDS", "@LDS or @CDS", "(@LDS || @CDS)"] {
            let base: TagExpression = raw.parse().expect("parse");
            assert_eq!(base.to_string(), "(@LDS || @CDS)");
            let expression = TagExpression::for_variant(Variant::SotwNonAggregated, Some(&base));
            assert!(expression.matches(&["@sotw", "@non-aggregated", "@LDS"]), "{raw}");
            assert!(expression.matches(&["@sotw", "@non-aggregated", "@CDS"]), "{raw}");
            assert!(!expression.matches(&["@sotw", "@non-aggregated", "@RDS"]), "{raw}");
            assert!(!expression.matches(&["@incremental", "@non-aggregated", "@LDS"]), "{raw}");
        }

        let expression: TagExpression = "(@LDS || @CDS) && not @wip".parse().expect("parse");
        assert_eq!(expression.to_string(), "(@LDS || @CDS) && not @wip");
        assert!(expression.matches(&["@CDS"]));
        assert!(!expression.matches(&["@CDS", "@wip"]));
        assert_eq!(
            expression.to_string().parse::<TagExpression>(),
            Ok(expression)
        );
    }

    #[test]
    fn rejects_malformed_terms() {
        assert_eq!("  ".parse::<TagExpression>(), Err(TagError::Empty));
        for raw in ["sotw", "@sotw ||", "@a@b", "@LDS | @CDS", "(@LDS && @CDS", "@sotw,,@x"] {
            assert!(
                matches!(raw.parse::<TagExpression>(), Err(TagError::InvalidTerm(_))),
                "{raw}"
            );
        }
    }
}
