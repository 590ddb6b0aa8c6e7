//! Association descriptors.
//!
//! An [`Association`] describes how to reach related objects from a source
//! object: either an ad-hoc query or a named relationship. Descriptors are
//! plain values. Two descriptors built independently at different call sites
//! compare equal when their content matches, so they share one association
//! cache on a proxy.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::hash::{Hash, Hasher};

/// What an association resolves through.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum AssociationKind {
    /// Ad-hoc query text executed in a namespace.
    Query { query: String, namespace: String },
    /// Named relationship (association class), optionally narrowed by the
    /// result class and the role the source plays.
    Relationship {
        name: String,
        result_class: Option<String>,
        role: Option<String>,
    },
}

/// Value-typed descriptor of a relationship or query.
///
/// Equality and hashing cover the [`AssociationKind`] only. Query text is
/// compared exactly; namespaces, relationship names, result classes and roles
/// are compared case-insensitively. The `do_not_update` flag is not part of
/// identity.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Association {
    kind: AssociationKind,
    #[serde(default)]
    do_not_update: bool,
}

impl Association {
    pub fn query(query: impl Into<String>, namespace: impl Into<String>) -> Self {
        Self {
            kind: AssociationKind::Query {
                query: query.into().trim().to_string(),
                namespace: namespace.into().trim().replace('/', "\\"),
            },
            do_not_update: false,
        }
    }

    pub fn relationship(name: impl Into<String>) -> Self {
        Self {
            kind: AssociationKind::Relationship {
                name: name.into(),
                result_class: None,
                role: None,
            },
            do_not_update: false,
        }
    }

    /// Narrow a relationship to related objects of `class`. No effect on
    /// query associations.
    pub fn with_result_class(mut self, class: impl Into<String>) -> Self {
        if let AssociationKind::Relationship { result_class, .. } = &mut self.kind {
            *result_class = Some(class.into());
        }
        self
    }

    /// Narrow a relationship to the given source role. No effect on query
    /// associations.
    pub fn with_role(mut self, source_role: impl Into<String>) -> Self {
        if let AssociationKind::Relationship { role, .. } = &mut self.kind {
            *role = Some(source_role.into());
        }
        self
    }

    /// Exclude this association from every automatic refresh path.
    pub fn excluded_from_refresh(mut self) -> Self {
        self.do_not_update = true;
        self
    }

    pub fn kind(&self) -> &AssociationKind {
        &self.kind
    }

    pub fn do_not_update(&self) -> bool {
        self.do_not_update
    }
}

fn eq_opt_ignore_case(a: &Option<String>, b: &Option<String>) -> bool {
    match (a, b) {
        (Some(a), Some(b)) => a.eq_ignore_ascii_case(b),
        (None, None) => true,
        _ => false,
    }
}

impl PartialEq for Association {
    fn eq(&self, other: &Self) -> bool {
        match (&self.kind, &other.kind) {
            (
                AssociationKind::Query { query: q1, namespace: n1 },
                AssociationKind::Query { query: q2, namespace: n2 },
            ) => q1 == q2 && n1.eq_ignore_ascii_case(n2),
            (
                AssociationKind::Relationship {
                    name: n1,
                    result_class: c1,
                    role: r1,
                },
                AssociationKind::Relationship {
                    name: n2,
                    result_class: c2,
                    role: r2,
                },
            ) => n1.eq_ignore_ascii_case(n2) && eq_opt_ignore_case(c1, c2) && eq_opt_ignore_case(r1, r2),
            _ => false,
        }
    }
}

impl Eq for Association {}

impl Hash for Association {
    fn hash<H: Hasher>(&self, state: &mut H) {
        match &self.kind {
            AssociationKind::Query { query, namespace } => {
                0u8.hash(state);
                query.hash(state);
                namespace.to_ascii_lowercase().hash(state);
            }
            AssociationKind::Relationship {
                name,
                result_class,
                role,
            } => {
                1u8.hash(state);
                name.to_ascii_lowercase().hash(state);
                result_class.as_ref().map(|c| c.to_ascii_lowercase()).hash(state);
                role.as_ref().map(|r| r.to_ascii_lowercase()).hash(state);
            }
        }
    }
}

impl fmt::Display for Association {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.kind {
            AssociationKind::Query { query, namespace } => write!(f, "query[{}]({})", namespace, query),
            AssociationKind::Relationship {
                name,
                result_class,
                role,
            } => {
                write!(f, "{}", name)?;
                if let Some(class) = result_class {
                    write!(f, "->{}", class)?;
                }
                if let Some(role) = role {
                    write!(f, " as {}", role)?;
                }
                Ok(())
            }
        }
    }
}
