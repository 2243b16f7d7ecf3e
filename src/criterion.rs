//! Named structural/annotation predicates over parsed classes.
//!
//! A criterion produces at most one match per class. Rules are tried in a
//! fixed order and the first satisfied one wins:
//!
//! 1. superclass or any interface is a subtype target
//! 2. any interface is an implements target
//! 3. any type annotation is a type-annotation target
//! 4. any method (declaration order) carries a method-annotation target
//! 5. any field (declaration order) carries a field-annotation target
//!
//! Structural checks are cheaper than walking members, so they run first. A
//! class that would satisfy several rules is only recorded under the first.

use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fmt;
use std::str::FromStr;

use crate::classfile::ClassDescriptor;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum MatchKind {
    Subtype,
    Implements,
    TypeAnnotation,
    MethodAnnotation,
    FieldAnnotation,
}

impl MatchKind {
    pub const ALL: [MatchKind; 5] = [
        MatchKind::Subtype,
        MatchKind::Implements,
        MatchKind::TypeAnnotation,
        MatchKind::MethodAnnotation,
        MatchKind::FieldAnnotation,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            MatchKind::Subtype => "subtype",
            MatchKind::Implements => "implements",
            MatchKind::TypeAnnotation => "type-annotation",
            MatchKind::MethodAnnotation => "method-annotation",
            MatchKind::FieldAnnotation => "field-annotation",
        }
    }
}

impl fmt::Display for MatchKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for MatchKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        MatchKind::ALL
            .into_iter()
            .find(|k| k.as_str() == s)
            .ok_or_else(|| format!("unknown match kind: {s}"))
    }
}

/// Index key: a match kind scoped by the criterion that produced it.
/// Rendered as `@<criterion>:<kind>`.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(into = "String", try_from = "String")]
pub struct Category {
    pub scope: String,
    pub kind: MatchKind,
}

impl Category {
    pub fn new(scope: &str, kind: MatchKind) -> Self {
        Self {
            scope: scope.to_string(),
            kind,
        }
    }
}

impl fmt::Display for Category {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "@{}:{}", self.scope, self.kind)
    }
}

impl FromStr for Category {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let body = s
            .strip_prefix('@')
            .ok_or_else(|| format!("category must start with '@': {s}"))?;
        let (scope, kind) = body
            .rsplit_once(':')
            .ok_or_else(|| format!("category must look like @scope:kind: {s}"))?;
        if scope.is_empty() {
            return Err(format!("category scope is empty: {s}"));
        }
        Ok(Category::new(scope, kind.parse()?))
    }
}

impl From<Category> for String {
    fn from(c: Category) -> Self {
        c.to_string()
    }
}

impl TryFrom<String> for Category {
    type Error = String;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        s.parse()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MatchEntry {
    pub category: Category,
    pub class_name: String,
}

#[derive(Debug, Clone, Default)]
pub struct Criterion {
    name: String,
    prefix: Option<String>,
    subtypes: HashSet<String>,
    implements: HashSet<String>,
    type_annotations: HashSet<String>,
    method_annotations: HashSet<String>,
    field_annotations: HashSet<String>,
}

impl Criterion {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            ..Self::default()
        }
    }

    /// Targets registered afterwards are relative to `prefix`
    /// (`common.Plugin` under `taboolib` means `taboolib.common.Plugin`).
    pub fn with_prefix(name: &str, prefix: &str) -> Self {
        Self {
            name: name.to_string(),
            prefix: Some(prefix.trim_end_matches('.').to_string()).filter(|p| !p.is_empty()),
            ..Self::default()
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn category(&self, kind: MatchKind) -> Category {
        Category::new(&self.name, kind)
    }

    /// Stable text form of the name, prefix and every target set.
    pub fn signature(&self) -> String {
        let sorted = |set: &HashSet<String>| {
            let mut names: Vec<&str> = set.iter().map(String::as_str).collect();
            names.sort_unstable();
            names.join(",")
        };
        format!(
            "{}|{}|{}|{}|{}|{}|{}",
            self.name,
            self.prefix.as_deref().unwrap_or(""),
            sorted(&self.subtypes),
            sorted(&self.implements),
            sorted(&self.type_annotations),
            sorted(&self.method_annotations),
            sorted(&self.field_annotations),
        )
    }

    pub fn subtype<I, S>(mut self, targets: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let names = self.qualify(targets);
        self.subtypes.extend(names);
        self
    }

    pub fn implements<I, S>(mut self, targets: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let names = self.qualify(targets);
        self.implements.extend(names);
        self
    }

    pub fn type_annotation<I, S>(mut self, targets: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let names = self.qualify(targets);
        self.type_annotations.extend(names);
        self
    }

    pub fn method_annotation<I, S>(mut self, targets: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let names = self.qualify(targets);
        self.method_annotations.extend(names);
        self
    }

    pub fn field_annotation<I, S>(mut self, targets: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let names = self.qualify(targets);
        self.field_annotations.extend(names);
        self
    }

    fn qualify<I, S>(&self, targets: I) -> Vec<String>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        targets
            .into_iter()
            .map(|t| match &self.prefix {
                Some(prefix) => format!("{prefix}.{}", t.as_ref()),
                None => t.as_ref().to_string(),
            })
            .collect()
    }

    pub fn evaluate(&self, class: &ClassDescriptor) -> Option<MatchEntry> {
        self.match_kind(class).map(|kind| MatchEntry {
            category: self.category(kind),
            class_name: class.name.clone(),
        })
    }

    fn match_kind(&self, class: &ClassDescriptor) -> Option<MatchKind> {
        let super_hit = class
            .super_name
            .as_ref()
            .is_some_and(|s| self.subtypes.contains(s));
        if super_hit || class.interfaces.iter().any(|i| self.subtypes.contains(i)) {
            return Some(MatchKind::Subtype);
        }
        if class.interfaces.iter().any(|i| self.implements.contains(i)) {
            return Some(MatchKind::Implements);
        }
        if class
            .annotations
            .iter()
            .any(|a| self.type_annotations.contains(a))
        {
            return Some(MatchKind::TypeAnnotation);
        }
        for method in &class.methods {
            if method
                .annotations
                .iter()
                .any(|a| self.method_annotations.contains(a))
            {
                return Some(MatchKind::MethodAnnotation);
            }
        }
        for field in &class.fields {
            if field
                .annotations
                .iter()
                .any(|a| self.field_annotations.contains(a))
            {
                return Some(MatchKind::FieldAnnotation);
            }
        }
        None
    }
}
