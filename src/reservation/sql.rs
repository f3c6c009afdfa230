//! Category predicates and their SQL rendering.
//!
//! A [`CategoryFilter`] is the structured form: a set of categories OR-ed
//! together, each category an AND of `info.field = value` equalities,
//! optionally negated. [`CategoryFilter::matches`] evaluates it in process;
//! [`CategoryFilter::to_sql`] renders it as a clause appended to a task query.

use serde_json::Value;

use super::category::Category;

/// A disjunction of categories over `task.info`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CategoryFilter {
    pub categories: Vec<Category>,
    /// Select everything *outside* the categories.
    pub negate: bool,
}

impl CategoryFilter {
    /// Builds a filter from categories, dropping duplicates.
    pub fn new(categories: impl IntoIterator<Item = Category>, negate: bool) -> Self {
        let mut categories: Vec<Category> = categories.into_iter().collect();
        categories.sort();
        categories.dedup();
        Self { categories, negate }
    }

    /// Returns true when the filter constrains nothing.
    pub fn is_empty(&self) -> bool {
        self.categories.is_empty()
    }

    /// Evaluates the filter against a task's `info` document.
    ///
    /// Mirrors the SQL three-valued logic: a task lacking a field is not in
    /// the category, so it passes a negated filter.
    pub fn matches(&self, info: &Value) -> bool {
        if self.is_empty() {
            return true;
        }
        let in_any = self.categories.iter().any(|c| c.matches(info));
        in_any != self.negate
    }

    /// Renders the filter as ` AND (...)` or ` AND (...) IS NOT TRUE`.
    ///
    /// Returns an empty string for an empty filter.
    pub fn to_sql(&self) -> String {
        if self.is_empty() {
            return String::new();
        }

        let disjunction = self
            .categories
            .iter()
            .map(category_sql)
            .collect::<Vec<_>>()
            .join(" OR ");

        if self.negate {
            format!(" AND ({}) IS NOT TRUE", disjunction)
        } else {
            format!(" AND ({})", disjunction)
        }
    }
}

fn category_sql(category: &Category) -> String {
    let predicates = category
        .pairs()
        .iter()
        .map(|(field, value)| {
            format!(
                "task.info->>{} = {}",
                quote_literal(field),
                quote_literal(value)
            )
        })
        .collect::<Vec<_>>()
        .join(" AND ");
    format!("({})", predicates)
}

/// Quotes a string as an SQL literal, doubling embedded single quotes.
pub fn quote_literal(value: &str) -> String {
    format!("'{}'", value.replace('\'', "''"))
}
