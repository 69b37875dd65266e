//! Small, stateless combinators shared by the resolver, the service and the
//! alternate-provider adapter.

use super::provider::{DataError, Dataset, Row, Value};
use std::future::Future;
use tracing::debug;

/// Return the value of the first key in `keys` present and non-null in `row`.
///
/// Providers disagree on column names (`team`, `team_abbr`, `recent_team`...);
/// callers list the synonyms in preference order.
pub fn first_present<'a>(row: &'a Row, keys: &[&str]) -> Option<&'a Value> {
    keys.iter()
        .filter_map(|k| row.get(*k))
        .find(|v| !v.is_null())
}

/// Anything a strategy can yield that may turn out to be empty.
pub trait Emptiness {
    fn is_empty_result(&self) -> bool;
}

impl<T> Emptiness for Vec<T> {
    fn is_empty_result(&self) -> bool {
        self.is_empty()
    }
}

impl Emptiness for Dataset {
    fn is_empty_result(&self) -> bool {
        self.rows.is_empty()
    }
}

/// Run strategies in order and return the first non-empty result.
///
/// Strategies are produced lazily by the iterator, so a strategy after the
/// winning one is never constructed, let alone awaited. Errors for which
/// `tolerate` returns true are logged and skipped; any other error aborts the
/// search. Returns `Ok(None)` when every strategy was empty or tolerated.
pub async fn first_non_empty<T, I, Fut, P>(strategies: I, tolerate: P) -> Result<Option<T>, DataError>
where
    T: Emptiness,
    I: IntoIterator<Item = Fut>,
    Fut: Future<Output = Result<T, DataError>>,
    P: Fn(&DataError) -> bool,
{
    for (index, strategy) in strategies.into_iter().enumerate() {
        match strategy.await {
            Ok(value) if !value.is_empty_result() => return Ok(Some(value)),
            Ok(_) => debug!(strategy = index, "strategy yielded no rows"),
            Err(e) if tolerate(&e) => debug!(strategy = index, error = %e, "strategy skipped"),
            Err(e) => return Err(e),
        }
    }
    Ok(None)
}

/// Tolerate only "not found" outcomes.
pub fn tolerate_not_found(err: &DataError) -> bool {
    err.is_not_found()
}

/// Tolerate every error.
pub fn tolerate_all(_: &DataError) -> bool {
    true
}
