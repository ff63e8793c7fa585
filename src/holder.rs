use crate::error::DbError;
use crate::results::ResultSet;
use crate::types::Statement;

/// Outcome of one holder slot once the worker has run it.
pub type SlotResult = Result<ResultSet, DbError>;

/// A batch of related queries whose results are collected per slot and delivered to
/// one callback.
///
/// Slots run in index order. In a plain holder a failing slot records its error and
/// the rest still run; a transactional holder runs inside one transaction and fails
/// as a whole.
///
/// ```rust
/// use deferred_sql::QueryHolder;
///
/// let mut holder = QueryHolder::new(false);
/// holder.set_size(2);
/// assert!(holder.set_query(0, "SELECT name FROM characters WHERE guid = 1"));
/// assert!(holder.set_query(1, "SELECT item FROM inventory WHERE guid = 1"));
/// assert!(!holder.set_query(2, "SELECT 1"));
/// ```
#[derive(Debug, Default)]
pub struct QueryHolder {
    transactional: bool,
    queries: Vec<Option<Statement>>,
    results: Vec<Option<SlotResult>>,
}

impl QueryHolder {
    #[must_use]
    pub fn new(transactional: bool) -> Self {
        Self {
            transactional,
            ..Self::default()
        }
    }

    /// A holder with `size` empty slots.
    #[must_use]
    pub fn with_capacity(transactional: bool, size: usize) -> Self {
        let mut holder = Self::new(transactional);
        holder.set_size(size);
        holder
    }

    /// Resize the slot table. Shrinking drops trailing slots.
    pub fn set_size(&mut self, size: usize) {
        self.queries.resize_with(size, || None);
        self.results.resize_with(size, || None);
    }

    /// Fill slot `index`. Returns `false` if the index is out of range or already filled.
    pub fn set_query(&mut self, index: usize, statement: impl Into<Statement>) -> bool {
        let size = self.queries.len();
        match self.queries.get_mut(index) {
            Some(slot @ None) => {
                *slot = Some(statement.into());
                true
            }
            Some(Some(existing)) => {
                tracing::warn!(index, sql = existing.sql(), "holder slot already set");
                false
            }
            None => {
                tracing::warn!(index, size, "holder slot out of range");
                false
            }
        }
    }

    /// Append a slot and return its index.
    pub fn push(&mut self, statement: impl Into<Statement>) -> usize {
        self.queries.push(Some(statement.into()));
        self.results.push(None);
        self.queries.len() - 1
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.queries.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.queries.is_empty()
    }

    #[must_use]
    pub fn is_transactional(&self) -> bool {
        self.transactional
    }

    #[must_use]
    pub fn query(&self, index: usize) -> Option<&Statement> {
        self.queries.get(index).and_then(Option::as_ref)
    }

    /// The result of slot `index`, or `None` if it has not run (or was never filled).
    #[must_use]
    pub fn result(&self, index: usize) -> Option<&SlotResult> {
        self.results.get(index).and_then(Option::as_ref)
    }

    pub fn take_result(&mut self, index: usize) -> Option<SlotResult> {
        self.results.get_mut(index).and_then(Option::take)
    }

    /// True when every filled slot produced rows without error.
    #[must_use]
    pub fn succeeded(&self) -> bool {
        self.queries
            .iter()
            .zip(&self.results)
            .filter(|(query, _)| query.is_some())
            .all(|(_, result)| matches!(result, Some(Ok(_))))
    }

    pub(crate) fn filled_slots(&self) -> impl Iterator<Item = (usize, &Statement)> {
        self.queries
            .iter()
            .enumerate()
            .filter_map(|(index, query)| query.as_ref().map(|stmt| (index, stmt)))
    }

    pub(crate) fn store_result(&mut self, index: usize, result: SlotResult) {
        if let Some(slot) = self.results.get_mut(index) {
            *slot = Some(result);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn set_query_rejects_filled_and_out_of_range_slots() {
        let mut holder = QueryHolder::new(false);
        holder.set_size(1);
        assert!(holder.set_query(0, "SELECT 1"));
        assert!(!holder.set_query(0, "SELECT 2"));
        assert!(!holder.set_query(5, "SELECT 3"));
        assert_eq!(holder.query(0).map(Statement::sql), Some("SELECT 1"));
    }

    #[test]
    fn succeeded_ignores_empty_slots() {
        let mut holder = QueryHolder::with_capacity(false, 3);
        holder.set_query(1, "SELECT 1");
        assert!(!holder.succeeded());
        holder.store_result(1, Ok(ResultSet::default()));
        assert!(holder.succeeded());
        holder.store_result(1, Err(DbError::ExecutionError("boom".into())));
        assert!(!holder.succeeded());
        assert!(holder.take_result(1).is_some_and(|r| r.is_err()));
        assert!(holder.result(1).is_none());
    }

    #[test]
    fn push_appends_in_order() {
        let mut holder = QueryHolder::new(true);
        assert_eq!(holder.push("A"), 0);
        assert_eq!(holder.push("B"), 1);
        let order: Vec<_> = holder.filled_slots().map(|(i, s)| (i, s.sql().to_owned())).collect();
        assert_eq!(order, vec![(0, "A".to_owned()), (1, "B".to_owned())]);
        assert!(holder.is_transactional());
    }
}
