//! Composable SQL predicates.
//!
//! Filters are built as a tree of clauses combined with AND/OR/NOT and only
//! rendered into SQL at the last moment, pushing every value through
//! [`QueryBuilder::push_bind`]. Clauses use `?` as the placeholder for their
//! binds, in order.

use chrono::{DateTime, Utc};
use sqlx::{QueryBuilder, Sqlite};

/// A value bound into a predicate clause.
#[derive(Debug, Clone, PartialEq)]
pub enum Bind {
    Int(i64),
    Text(String),
    Time(DateTime<Utc>),
}

impl From<i64> for Bind {
    fn from(v: i64) -> Self {
        Bind::Int(v)
    }
}

impl From<&str> for Bind {
    fn from(v: &str) -> Self {
        Bind::Text(v.to_string())
    }
}

impl From<String> for Bind {
    fn from(v: String) -> Self {
        Bind::Text(v)
    }
}

impl From<DateTime<Utc>> for Bind {
    fn from(v: DateTime<Utc>) -> Self {
        Bind::Time(v)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Predicate {
    Always,
    Never,
    Clause { sql: String, binds: Vec<Bind> },
    And(Vec<Predicate>),
    Or(Vec<Predicate>),
    Not(Box<Predicate>),
}

impl Predicate {
    /// A clause without parameters.
    pub fn raw(sql: impl Into<String>) -> Self {
        Predicate::Clause {
            sql: sql.into(),
            binds: Vec::new(),
        }
    }

    /// A clause whose `?` placeholders are filled by `binds`, in order.
    pub fn sql(sql: impl Into<String>, binds: Vec<Bind>) -> Self {
        let sql = sql.into();
        debug_assert_eq!(
            sql.matches('?').count(),
            binds.len(),
            "placeholder count mismatch in {sql}"
        );
        Predicate::Clause { sql, binds }
    }

    /// Conjunction. Empty input means "no restriction".
    pub fn and(preds: impl IntoIterator<Item = Predicate>) -> Self {
        let mut parts = Vec::new();
        for p in preds {
            match p {
                Predicate::Always => {}
                Predicate::Never => return Predicate::Never,
                Predicate::And(inner) => parts.extend(inner),
                other => parts.push(other),
            }
        }
        match parts.len() {
            0 => Predicate::Always,
            1 => parts.remove(0),
            _ => Predicate::And(parts),
        }
    }

    /// Disjunction. Empty input matches nothing.
    pub fn or(preds: impl IntoIterator<Item = Predicate>) -> Self {
        let mut parts = Vec::new();
        for p in preds {
            match p {
                Predicate::Never => {}
                Predicate::Always => return Predicate::Always,
                Predicate::Or(inner) => parts.extend(inner),
                other => parts.push(other),
            }
        }
        match parts.len() {
            0 => Predicate::Never,
            1 => parts.remove(0),
            _ => Predicate::Or(parts),
        }
    }

    pub fn negate(self) -> Self {
        match self {
            Predicate::Always => Predicate::Never,
            Predicate::Never => Predicate::Always,
            Predicate::Not(inner) => *inner,
            other => Predicate::Not(Box::new(other)),
        }
    }

    pub fn is_always(&self) -> bool {
        matches!(self, Predicate::Always)
    }

    /// Render as a parenthesised SQL fragment plus its binds, in order.
    pub fn render(&self) -> (String, Vec<Bind>) {
        match self {
            Predicate::Always => ("1".to_string(), Vec::new()),
            Predicate::Never => ("0".to_string(), Vec::new()),
            Predicate::Clause { sql, binds } => (format!("({sql})"), binds.clone()),
            Predicate::And(parts) => render_joined(parts, " AND "),
            Predicate::Or(parts) => render_joined(parts, " OR "),
            Predicate::Not(inner) => {
                let (sql, binds) = inner.render();
                (format!("NOT {sql}"), binds)
            }
        }
    }

    /// Render into a query builder, pushing every value as a bind.
    pub fn push_to(&self, qb: &mut QueryBuilder<'_, Sqlite>) {
        let (sql, binds) = self.render();
        let mut binds = binds.into_iter();
        for (i, part) in sql.split('?').enumerate() {
            if i > 0 {
                match binds.next() {
                    Some(Bind::Int(v)) => {
                        qb.push_bind(v);
                    }
                    Some(Bind::Text(v)) => {
                        qb.push_bind(v);
                    }
                    Some(Bind::Time(v)) => {
                        qb.push_bind(v);
                    }
                    None => {
                        qb.push("NULL");
                    }
                }
            }
            qb.push(part);
        }
    }

    /// Render as ` WHERE <predicate>`, or nothing for [`Predicate::Always`].
    pub fn push_where(&self, qb: &mut QueryBuilder<'_, Sqlite>) {
        if self.is_always() {
            return;
        }
        qb.push(" WHERE ");
        self.push_to(qb);
    }
}

fn render_joined(parts: &[Predicate], sep: &str) -> (String, Vec<Bind>) {
    let mut sqls = Vec::with_capacity(parts.len());
    let mut binds = Vec::new();
    for part in parts {
        let (sql, b) = part.render();
        sqls.push(sql);
        binds.extend(b);
    }
    (format!("({})", sqls.join(sep)), binds)
}

/// `column IN (?, ?, ...)`; an empty list never matches.
pub fn in_list(column: &str, values: &[i64]) -> Predicate {
    if values.is_empty() {
        return Predicate::Never;
    }
    let placeholders = vec!["?"; values.len()].join(", ");
    Predicate::sql(
        format!("{column} IN ({placeholders})"),
        values.iter().copied().map(Bind::Int).collect(),
    )
}
