//! Range queries over the event log.
//!
//! [`QueryOptions::from_params`] turns an untrusted query-string map into
//! bounded options; [`QueryOptions::seq_range`] resolves the four bound
//! fields into one inclusive sequence range.

use std::collections::HashMap;

pub const DEFAULT_LIMIT: usize = 10;
pub const MAX_LIMIT: usize = 1000;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum QueryError {
    #[error("{field} must be a number, got {value:?}")]
    NotANumber { field: &'static str, value: String },

    #[error("limit must be between 1 and {max}, got {0}", max = MAX_LIMIT)]
    Limit(i64),
}

/// Validated view over a range request.
///
/// Bounds are sequence numbers: `gt`/`lt` exclusive, `gte`/`lte` inclusive.
/// `reverse` only flips iteration order; bound meaning is unchanged.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct QueryOptions {
    pub limit: usize,
    pub reverse: bool,
    pub gt: Option<i64>,
    pub gte: Option<i64>,
    pub lt: Option<i64>,
    pub lte: Option<i64>,
    /// Sequence numbers are always part of the result.
    pub include_seqs: bool,
}

impl Default for QueryOptions {
    fn default() -> Self {
        Self {
            limit: DEFAULT_LIMIT,
            reverse: false,
            gt: None,
            gte: None,
            lt: None,
            lte: None,
            include_seqs: true,
        }
    }
}

impl QueryOptions {
    /// Translate raw query parameters.
    ///
    /// - missing or empty values fall back to defaults
    /// - `limit` is floored and capped at [`MAX_LIMIT`]; below 1 is rejected
    /// - `reverse` is set only by the exact string `"true"`
    /// - bounds are floored; a bound that floors to 0 counts as absent
    /// - non-numeric values are rejected
    pub fn from_params(params: &HashMap<String, String>) -> Result<Self, QueryError> {
        let mut opts = Self::default();

        if let Some(limit) = numeric(params, "limit")? {
            if limit < 1 {
                return Err(QueryError::Limit(limit));
            }
            opts.limit = usize::try_from(limit).unwrap_or(MAX_LIMIT).min(MAX_LIMIT);
        }

        opts.reverse = params.get("reverse").map(String::as_str) == Some("true");

        opts.gt = bound(params, "gt")?;
        opts.gte = bound(params, "gte")?;
        opts.lt = bound(params, "lt")?;
        opts.lte = bound(params, "lte")?;

        Ok(opts)
    }

    /// Check options built in code rather than through `from_params`. A
    /// zero limit is rejected; anything above [`MAX_LIMIT`] is clamped by
    /// [`QueryOptions::effective_limit`].
    pub fn validate(&self) -> Result<(), QueryError> {
        if self.limit == 0 {
            return Err(QueryError::Limit(0));
        }
        Ok(())
    }

    pub fn effective_limit(&self) -> usize {
        self.limit.min(MAX_LIMIT)
    }

    /// Collapse the four bounds into one inclusive range. When both forms of
    /// a side are given, the tighter one wins.
    pub fn seq_range(&self) -> SeqRange {
        let lower = [
            self.gt.map(|v| v.saturating_add(1)),
            self.gte,
        ]
        .into_iter()
        .flatten()
        .max()
        .unwrap_or(0);

        let upper = [
            self.lt.map(|v| v.saturating_sub(1)),
            self.lte,
        ]
        .into_iter()
        .flatten()
        .min()
        .unwrap_or(i64::MAX);

        SeqRange {
            start: lower,
            end: upper,
        }
    }
}

/// Inclusive sequence range `[start, end]`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct SeqRange {
    pub start: i64,
    pub end: i64,
}

impl SeqRange {
    pub const ALL: SeqRange = SeqRange {
        start: 0,
        end: i64::MAX,
    };

    pub fn is_empty(&self) -> bool {
        self.start > self.end
    }

}

fn numeric(params: &HashMap<String, String>, field: &'static str) -> Result<Option<i64>, QueryError> {
    let Some(raw) = params.get(field) else {
        return Ok(None);
    };
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return Ok(None);
    }
    match trimmed.parse::<f64>() {
        Ok(v) if v.is_finite() => Ok(Some(v.floor() as i64)),
        _ => Err(QueryError::NotANumber {
            field,
            value: raw.clone(),
        }),
    }
}

fn bound(params: &HashMap<String, String>, field: &'static str) -> Result<Option<i64>, QueryError> {
    Ok(numeric(params, field)?.filter(|v| *v != 0))
}
