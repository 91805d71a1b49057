//! Criteria model shared by every retirement store.
//!
//! Callers describe a query either as a raw [`QuerySpec`] (field / operator / value
//! triples, as received over the wire) or as a typed [`RetirementQuery`]. Both compile
//! into a [`CompiledQuery`], the only form stores consume.

use serde::{Deserialize, Serialize};
use time::OffsetDateTime;

use crate::policy::parse_instant;
use crate::{unix_millis, RetirementError, RetirementRecord};

pub const DEFAULT_QUERY_LIMIT: u32 = 50;
pub const MAX_QUERY_LIMIT: u32 = 1_000;

const LIKE_ESCAPE: char = '\\';

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum QueryField {
    AgreementId,
    Reason,
    RetiredBy,
    RetiredAt,
}

impl QueryField {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::AgreementId => "agreement_id",
            Self::Reason => "reason",
            Self::RetiredBy => "retired_by",
            Self::RetiredAt => "retired_at",
        }
    }

    fn text_of(self, record: &RetirementRecord) -> Option<&str> {
        match self {
            Self::AgreementId => Some(&record.agreement_id),
            Self::Reason => Some(&record.reason),
            Self::RetiredBy => Some(&record.retired_by),
            Self::RetiredAt => None,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Hash)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Operator {
    #[serde(alias = "=")]
    Eq,
    #[serde(alias = "like")]
    Like,
    #[serde(alias = "in")]
    In,
    #[serde(alias = ">")]
    Gt,
    #[serde(alias = "<")]
    Lt,
    #[serde(alias = "between")]
    Between,
}

impl Operator {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Eq => "EQ",
            Self::Like => "LIKE",
            Self::In => "IN",
            Self::Gt => "GT",
            Self::Lt => "LT",
            Self::Between => "BETWEEN",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
#[serde(untagged)]
pub enum CriterionValue {
    One(String),
    Many(Vec<String>),
}

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct Criterion {
    pub field: QueryField,
    pub operator: Operator,
    pub value: CriterionValue,
}

impl Criterion {
    #[must_use]
    pub fn new(field: QueryField, operator: Operator, value: CriterionValue) -> Self {
        Self { field, operator, value }
    }

    /// Type-check this criterion against its field.
    ///
    /// # Errors
    /// Returns [`RetirementError::InvalidArgument`] for unsupported operator/field pairs
    /// or values of the wrong shape.
    pub fn compile(&self) -> Result<Predicate, RetirementError> {
        let field = self.field;
        let invalid = |detail: &str| {
            RetirementError::InvalidArgument(format!(
                "criterion {} {} {detail}",
                field.as_str(),
                self.operator.as_str()
            ))
        };

        if field == QueryField::RetiredAt {
            return match (self.operator, &self.value) {
                (Operator::Eq, CriterionValue::One(raw)) => Ok(Predicate::AtEq(parse_at(raw)?)),
                (Operator::Gt, CriterionValue::One(raw)) => Ok(Predicate::AtGt(parse_at(raw)?)),
                (Operator::Lt, CriterionValue::One(raw)) => Ok(Predicate::AtLt(parse_at(raw)?)),
                (Operator::Between, CriterionValue::Many(values)) if values.len() == 2 => {
                    let from = parse_at(&values[0])?;
                    let to = parse_at(&values[1])?;
                    if from > to {
                        return Err(invalid("requires lower bound <= upper bound"));
                    }
                    Ok(Predicate::AtBetween(from, to))
                }
                (Operator::Between, _) => Err(invalid("requires exactly two timestamps")),
                (Operator::Like | Operator::In, _) => Err(invalid("is not supported")),
                _ => Err(invalid("requires a single timestamp")),
            };
        }

        match (self.operator, &self.value) {
            (Operator::Eq, CriterionValue::One(value)) => {
                Ok(Predicate::TextEq { field, value: value.clone() })
            }
            (Operator::Like, CriterionValue::One(pattern)) => {
                Ok(Predicate::TextLike { field, pattern: pattern.clone() })
            }
            (Operator::In, CriterionValue::Many(values)) => {
                if values.is_empty() {
                    return Err(invalid("requires at least one value"));
                }
                Ok(Predicate::TextIn { field, values: values.clone() })
            }
            (Operator::In, CriterionValue::One(value)) => {
                Ok(Predicate::TextIn { field, values: vec![value.clone()] })
            }
            (Operator::Gt | Operator::Lt | Operator::Between, _) => {
                Err(invalid("is only supported on retired_at"))
            }
            _ => Err(invalid("requires a single value")),
        }
    }
}

/// Type-checked criterion. Timestamps are Unix milliseconds.
#[derive(Debug, Clone, Eq, PartialEq)]
pub enum Predicate {
    TextEq { field: QueryField, value: String },
    TextLike { field: QueryField, pattern: String },
    TextIn { field: QueryField, values: Vec<String> },
    AtEq(i64),
    AtGt(i64),
    AtLt(i64),
    AtBetween(i64, i64),
}

impl Predicate {
    #[must_use]
    pub fn matches(&self, record: &RetirementRecord) -> bool {
        let at = record.retired_at_millis();
        match self {
            Self::TextEq { field, value } => field.text_of(record) == Some(value.as_str()),
            Self::TextLike { field, pattern } => {
                field.text_of(record).is_some_and(|text| like_matches(pattern, text))
            }
            Self::TextIn { field, values } => field
                .text_of(record)
                .is_some_and(|text| values.iter().any(|value| value == text)),
            Self::AtEq(value) => at == *value,
            Self::AtGt(value) => at > *value,
            Self::AtLt(value) => at < *value,
            Self::AtBetween(from, to) => (*from..=*to).contains(&at),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, Eq, PartialEq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum SortField {
    #[default]
    RetiredAt,
    AgreementId,
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, Eq, PartialEq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum SortOrder {
    #[default]
    Asc,
    Desc,
}

fn default_limit() -> u32 {
    DEFAULT_QUERY_LIMIT
}

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct QuerySpec {
    #[serde(default)]
    pub criteria: Vec<Criterion>,
    #[serde(default)]
    pub offset: u32,
    #[serde(default = "default_limit")]
    pub limit: u32,
    #[serde(default)]
    pub sort_field: SortField,
    #[serde(default)]
    pub sort_order: SortOrder,
}

impl Default for QuerySpec {
    fn default() -> Self {
        Self {
            criteria: Vec::new(),
            offset: 0,
            limit: DEFAULT_QUERY_LIMIT,
            sort_field: SortField::default(),
            sort_order: SortOrder::default(),
        }
    }
}

impl QuerySpec {
    /// # Errors
    /// Returns [`RetirementError::InvalidArgument`] when any criterion or the page size is invalid.
    pub fn compile(&self) -> Result<CompiledQuery, RetirementError> {
        let predicates = self.criteria.iter().map(Criterion::compile).collect::<Result<_, _>>()?;
        CompiledQuery::new(predicates, self.offset, self.limit, self.sort_field, self.sort_order)
    }
}

/// Typed filters for the common retirement lookups. Time bounds are exclusive.
#[derive(Debug, Clone, Default, Serialize, Deserialize, Eq, PartialEq)]
pub struct RetirementQuery {
    #[serde(default)]
    pub agreement_id: Option<String>,
    #[serde(default)]
    pub agreement_id_prefix: Option<String>,
    #[serde(default)]
    pub reason: Option<String>,
    #[serde(default)]
    pub reason_prefix: Option<String>,
    #[serde(default, with = "time::serde::rfc3339::option")]
    pub retired_after: Option<OffsetDateTime>,
    #[serde(default, with = "time::serde::rfc3339::option")]
    pub retired_before: Option<OffsetDateTime>,
    #[serde(default)]
    pub offset: Option<u32>,
    #[serde(default)]
    pub limit: Option<u32>,
    #[serde(default)]
    pub order: Option<SortOrder>,
}

impl RetirementQuery {
    /// # Errors
    /// Returns [`RetirementError::InvalidArgument`] when the page size is out of range.
    pub fn compile(&self) -> Result<CompiledQuery, RetirementError> {
        let mut predicates = Vec::new();
        if let Some(agreement_id) = &self.agreement_id {
            predicates
                .push(Predicate::TextEq { field: QueryField::AgreementId, value: agreement_id.clone() });
        }
        if let Some(prefix) = &self.agreement_id_prefix {
            predicates.push(Predicate::TextLike {
                field: QueryField::AgreementId,
                pattern: format!("{}%", escape_like(prefix)),
            });
        }
        if let Some(reason) = &self.reason {
            predicates.push(Predicate::TextEq { field: QueryField::Reason, value: reason.clone() });
        }
        if let Some(prefix) = &self.reason_prefix {
            predicates.push(Predicate::TextLike {
                field: QueryField::Reason,
                pattern: format!("{}%", escape_like(prefix)),
            });
        }
        if let Some(after) = self.retired_after {
            predicates.push(Predicate::AtGt(unix_millis(after)));
        }
        if let Some(before) = self.retired_before {
            predicates.push(Predicate::AtLt(unix_millis(before)));
        }

        CompiledQuery::new(
            predicates,
            self.offset.unwrap_or(0),
            self.limit.unwrap_or(DEFAULT_QUERY_LIMIT),
            SortField::RetiredAt,
            self.order.unwrap_or_default(),
        )
    }
}

#[derive(Debug, Clone, Eq, PartialEq)]
pub struct CompiledQuery {
    pub predicates: Vec<Predicate>,
    pub offset: u32,
    pub limit: u32,
    pub sort_field: SortField,
    pub sort_order: SortOrder,
}

impl CompiledQuery {
    /// # Errors
    /// Returns [`RetirementError::InvalidArgument`] when `limit` is zero or above [`MAX_QUERY_LIMIT`].
    pub fn new(
        predicates: Vec<Predicate>,
        offset: u32,
        limit: u32,
        sort_field: SortField,
        sort_order: SortOrder,
    ) -> Result<Self, RetirementError> {
        if limit == 0 || limit > MAX_QUERY_LIMIT {
            return Err(RetirementError::InvalidArgument(format!(
                "limit MUST be in [1, {MAX_QUERY_LIMIT}], got {limit}"
            )));
        }
        Ok(Self { predicates, offset, limit, sort_field, sort_order })
    }

    #[must_use]
    pub fn matches(&self, record: &RetirementRecord) -> bool {
        self.predicates.iter().all(|predicate| predicate.matches(record))
    }

    /// Order records by the sort field, ties broken by `agreement_id` in the same direction.
    pub fn sort(&self, records: &mut [RetirementRecord]) {
        match self.sort_field {
            SortField::RetiredAt => records.sort_by(|lhs, rhs| {
                lhs.retired_at_millis()
                    .cmp(&rhs.retired_at_millis())
                    .then_with(|| lhs.agreement_id.cmp(&rhs.agreement_id))
            }),
            SortField::AgreementId => records.sort_by(|lhs, rhs| lhs.agreement_id.cmp(&rhs.agreement_id)),
        }
        if self.sort_order == SortOrder::Desc {
            records.reverse();
        }
    }

    /// Filter, sort, and page an in-memory candidate set.
    #[must_use]
    pub fn apply<I>(&self, records: I) -> Vec<RetirementRecord>
    where
        I: IntoIterator<Item = RetirementRecord>,
    {
        let mut matched = records.into_iter().filter(|record| self.matches(record)).collect::<Vec<_>>();
        self.sort(&mut matched);
        matched
            .into_iter()
            .skip(usize::try_from(self.offset).unwrap_or(usize::MAX))
            .take(usize::try_from(self.limit).unwrap_or(usize::MAX))
            .collect()
    }
}

fn parse_at(raw: &str) -> Result<i64, RetirementError> {
    parse_instant(raw).map(unix_millis).ok_or_else(|| {
        RetirementError::InvalidArgument(format!("invalid retired_at timestamp: {raw}"))
    })
}

/// Escape `%`, `_`, and the escape character itself so `value` matches literally in LIKE.
#[must_use]
pub fn escape_like(value: &str) -> String {
    let mut escaped = String::with_capacity(value.len());
    for ch in value.chars() {
        if matches!(ch, '%' | '_' | LIKE_ESCAPE) {
            escaped.push(LIKE_ESCAPE);
        }
        escaped.push(ch);
    }
    escaped
}

/// Case-sensitive SQL LIKE: `%` matches any run, `_` one character, `\` escapes.
#[must_use]
pub fn like_matches(pattern: &str, value: &str) -> bool {
    #[derive(Clone, Copy, PartialEq)]
    enum Token {
        Any,
        One,
        Literal(char),
    }

    let mut tokens = Vec::new();
    let mut chars = pattern.chars();
    while let Some(ch) = chars.next() {
        tokens.push(match ch {
            '%' => Token::Any,
            '_' => Token::One,
            // A dangling escape never matches.
            LIKE_ESCAPE => match chars.next() {
                Some(escaped) => Token::Literal(escaped),
                None => return false,
            },
            other => Token::Literal(other),
        });
    }
    let value = value.chars().collect::<Vec<_>>();

    // Greedy match with single-point backtracking on the last `%`.
    let (mut t, mut v) = (0, 0);
    let mut backtrack: Option<(usize, usize)> = None;
    while v < value.len() {
        match tokens.get(t) {
            Some(Token::Any) => {
                backtrack = Some((t, v));
                t += 1;
            }
            Some(Token::One) => {
                t += 1;
                v += 1;
            }
            Some(Token::Literal(ch)) if *ch == value[v] => {
                t += 1;
                v += 1;
            }
            _ => match backtrack {
                Some((star_t, star_v)) => {
                    backtrack = Some((star_t, star_v + 1));
                    t = star_t + 1;
                    v = star_v + 1;
                }
                None => return false,
            },
        }
    }
    tokens[t..].iter().all(|token| *token == Token::Any)
}
