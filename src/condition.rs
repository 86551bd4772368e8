//! Composable comparison predicates over a totally ordered value.
//!
//! A [`Condition`] is a small recursive sum type. Two independent folds are defined
//! over it: [`Condition::evaluate`] decides whether a value satisfies the condition,
//! and the `Display` impl renders the clause used in write-failure diagnostics.
//! Both are total: evaluation never fails.
//!
//! The rendered wordings are relied upon verbatim by callers, e.g.
//! `and([gte(0), lt(100), ne(1)])` renders
//! `to be greater than or equal to 0 and to be less than 100 and to not be equal to 1`.

use std::fmt;

/// A predicate over values of type `T`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Condition<T> {
    /// Structurally equal to the value.
    Eq(T),
    /// Not structurally equal to the value.
    Ne(T),
    /// Strictly less than the value.
    Lt(T),
    /// Strictly greater than the value.
    Gt(T),
    /// Less than or equal to the value.
    Lte(T),
    /// Greater than or equal to the value.
    Gte(T),
    /// Every child holds. An empty conjunction holds.
    And(Vec<Condition<T>>),
    /// At least one child holds. An empty disjunction does not hold.
    Or(Vec<Condition<T>>),
    /// The child does not hold.
    Not(Box<Condition<T>>),
}

/// `Condition::Eq(value)`.
pub fn eq<T>(value: T) -> Condition<T> {
    Condition::Eq(value)
}

/// `Condition::Ne(value)`.
pub fn ne<T>(value: T) -> Condition<T> {
    Condition::Ne(value)
}

/// `Condition::Lt(value)`.
pub fn lt<T>(value: T) -> Condition<T> {
    Condition::Lt(value)
}

/// `Condition::Gt(value)`.
pub fn gt<T>(value: T) -> Condition<T> {
    Condition::Gt(value)
}

/// `Condition::Lte(value)`.
pub fn lte<T>(value: T) -> Condition<T> {
    Condition::Lte(value)
}

/// `Condition::Gte(value)`.
pub fn gte<T>(value: T) -> Condition<T> {
    Condition::Gte(value)
}

/// Conjunction of all given conditions.
pub fn and<T>(conditions: impl IntoIterator<Item = Condition<T>>) -> Condition<T> {
    Condition::And(conditions.into_iter().collect())
}

/// Disjunction of all given conditions.
pub fn or<T>(conditions: impl IntoIterator<Item = Condition<T>>) -> Condition<T> {
    Condition::Or(conditions.into_iter().collect())
}

/// Negation of `condition`.
pub fn not<T>(condition: Condition<T>) -> Condition<T> {
    Condition::Not(Box::new(condition))
}

impl<T: Ord> Condition<T> {
    /// Returns `true` if `actual` satisfies this condition.
    ///
    /// `And` and `Or` short-circuit from left to right.
    pub fn evaluate(&self, actual: &T) -> bool {
        match self {
            Condition::Eq(v) => actual == v,
            Condition::Ne(v) => actual != v,
            Condition::Lt(v) => actual < v,
            Condition::Gt(v) => actual > v,
            Condition::Lte(v) => actual <= v,
            Condition::Gte(v) => actual >= v,
            Condition::And(children) => children.iter().all(|c| c.evaluate(actual)),
            Condition::Or(children) => children.iter().any(|c| c.evaluate(actual)),
            Condition::Not(child) => !child.evaluate(actual),
        }
    }

    /// Evaluate against an optional value.
    ///
    /// An absent value is equal to nothing and unordered with respect to everything:
    /// `Ne` holds, `Eq` and the ordering operators do not.
    pub fn evaluate_optional(&self, actual: Option<&T>) -> bool {
        match actual {
            Some(value) => self.evaluate(value),
            None => self.evaluate_missing(),
        }
    }

    fn evaluate_missing(&self) -> bool {
        match self {
            Condition::Ne(_) => true,
            Condition::Eq(_)
            | Condition::Lt(_)
            | Condition::Gt(_)
            | Condition::Lte(_)
            | Condition::Gte(_) => false,
            Condition::And(children) => children.iter().all(|c| c.evaluate_missing()),
            Condition::Or(children) => children.iter().any(|c| c.evaluate_missing()),
            Condition::Not(child) => !child.evaluate_missing(),
        }
    }
}

impl<T> Condition<T> {
    /// Rebuild the same condition tree with every operand transformed by `f`.
    ///
    /// Used by the query compiler to move time conditions into the string domain.
    pub fn map<U, F>(&self, f: &F) -> Condition<U>
    where
        F: Fn(&T) -> U,
    {
        match self {
            Condition::Eq(v) => Condition::Eq(f(v)),
            Condition::Ne(v) => Condition::Ne(f(v)),
            Condition::Lt(v) => Condition::Lt(f(v)),
            Condition::Gt(v) => Condition::Gt(f(v)),
            Condition::Lte(v) => Condition::Lte(f(v)),
            Condition::Gte(v) => Condition::Gte(f(v)),
            Condition::And(children) => Condition::And(children.iter().map(|c| c.map(f)).collect()),
            Condition::Or(children) => Condition::Or(children.iter().map(|c| c.map(f)).collect()),
            Condition::Not(child) => Condition::Not(Box::new(child.map(f))),
        }
    }
}

impl<T: fmt::Display> Condition<T> {
    /// Render the diagnostic clause for this condition.
    pub fn describe(&self) -> String {
        self.to_string()
    }
}

fn write_joined<T: fmt::Display>(
    f: &mut fmt::Formatter<'_>,
    children: &[Condition<T>],
    separator: &str,
) -> fmt::Result {
    for (i, child) in children.iter().enumerate() {
        if i > 0 {
            f.write_str(separator)?;
        }
        write!(f, "{child}")?;
    }
    Ok(())
}

impl<T: fmt::Display> fmt::Display for Condition<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Condition::Eq(v) => write!(f, "to be equal to {v}"),
            Condition::Ne(v) => write!(f, "to not be equal to {v}"),
            Condition::Lt(v) => write!(f, "to be less than {v}"),
            Condition::Gt(v) => write!(f, "to be greater than {v}"),
            Condition::Lte(v) => write!(f, "to be less than or equal to {v}"),
            Condition::Gte(v) => write!(f, "to be greater than or equal to {v}"),
            Condition::And(children) => write_joined(f, children, " and "),
            Condition::Or(children) => write_joined(f, children, " or "),
            Condition::Not(child) => match child.as_ref() {
                // Double negations read as the plain clause.
                Condition::Not(inner) => write!(f, "{inner}"),
                Condition::Ne(v) => write!(f, "to be equal to {v}"),
                other => write!(f, "not {other}"),
            },
        }
    }
}
