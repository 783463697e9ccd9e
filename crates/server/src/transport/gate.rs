// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Accept gate: query-parameter constraints evaluated at upgrade time.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

/// Constraint on one expected query parameter.
#[derive(Clone)]
pub enum QueryRule {
    /// The parameter must be present, with any value.
    Present,
    /// The parameter must be absent.
    Absent,
    /// The parameter must equal this exact value.
    Equals(String),
    /// The parameter (or its absence) must satisfy the predicate.
    Predicate(Arc<dyn Fn(Option<&str>) -> bool + Send + Sync>),
}

impl QueryRule {
    pub fn predicate(f: impl Fn(Option<&str>) -> bool + Send + Sync + 'static) -> Self {
        Self::Predicate(Arc::new(f))
    }
}

impl fmt::Debug for QueryRule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Present => f.write_str("Present"),
            Self::Absent => f.write_str("Absent"),
            Self::Equals(value) => f.debug_tuple("Equals").field(value).finish(),
            Self::Predicate(_) => f.write_str("Predicate(..)"),
        }
    }
}

/// Whether the request's query parameters satisfy every configured rule.
pub(crate) fn check(
    rules: &HashMap<String, QueryRule>,
    params: &HashMap<String, String>,
) -> bool {
    rules.iter().all(|(name, rule)| {
        let value = params.get(name).map(String::as_str);
        match rule {
            QueryRule::Present => value.is_some(),
            QueryRule::Absent => value.is_none(),
            QueryRule::Equals(expected) => value == Some(expected.as_str()),
            QueryRule::Predicate(predicate) => predicate(value),
        }
    })
}
