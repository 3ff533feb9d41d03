use crate::core::{DbError, Phase, Result, Row, Value};
use crate::rpc::{ResultSetMetadata, StreamingResult, TransactionInfo};
use futures::stream::{BoxStream, StreamExt, TryStreamExt};

/// Rows streamed back from a read or query.
pub type RowStream = BoxStream<'static, Result<Row>>;

/// A streaming result: metadata up front, rows pulled on demand.
pub struct ResultSet {
    metadata: ResultSetMetadata,
    rows: RowStream,
}

impl ResultSet {
    pub(crate) fn from_rpc(result: StreamingResult, phase: Phase) -> Self {
        let rows = result
            .rows
            .map_err(move |status| DbError::from_status(phase, status))
            .boxed();
        Self {
            metadata: result.metadata,
            rows,
        }
    }

    pub fn columns(&self) -> &[String] {
        &self.metadata.columns
    }

    /// The transaction this request began inline, if any.
    pub fn transaction(&self) -> Option<&TransactionInfo> {
        self.metadata.transaction.as_ref()
    }

    pub async fn next(&mut self) -> Option<Result<Row>> {
        self.rows.next().await
    }

    pub fn into_stream(self) -> RowStream {
        self.rows
    }

    /// Drains the stream into memory.
    pub async fn collect(self) -> Result<QueryResult> {
        let rows: Vec<Row> = self.rows.try_collect().await?;
        Ok(QueryResult::new(self.metadata.columns, rows))
    }
}

impl std::fmt::Debug for ResultSet {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ResultSet")
            .field("metadata", &self.metadata)
            .finish_non_exhaustive()
    }
}

/// A fully materialized result.
#[derive(Debug, Clone, PartialEq)]
pub struct QueryResult {
    pub columns: Vec<String>,
    pub rows: Vec<Row>,
}

impl QueryResult {
    pub fn empty() -> Self {
        Self {
            columns: Vec::new(),
            rows: Vec::new(),
        }
    }

    pub fn new(columns: Vec<String>, rows: Vec<Row>) -> Self {
        Self { columns, rows }
    }

    pub fn row_count(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    pub fn rows(&self) -> &[Row] {
        &self.rows
    }

    pub fn first(&self) -> Option<&Row> {
        self.rows.first()
    }

    /// Value of `column` in row `row`.
    pub fn get(&self, row: usize, column: &str) -> Option<&Value> {
        let idx = self.columns.iter().position(|c| c == column)?;
        self.rows.get(row)?.get(idx)
    }
}

impl std::fmt::Display for QueryResult {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.columns.is_empty() {
            return writeln!(f, "Empty result set");
        }

        // Calculate column widths
        let mut widths: Vec<usize> = self.columns.iter().map(|c| c.len()).collect();
        for row in &self.rows {
            for (i, value) in row.iter().enumerate().take(widths.len()) {
                widths[i] = widths[i].max(value.to_string().len());
            }
        }

        let header: Vec<String> = self
            .columns
            .iter()
            .enumerate()
            .map(|(i, col)| format!("{:width$}", col, width = widths[i]))
            .collect();
        writeln!(f, "{}", header.join(" | "))?;

        let separator: String = widths
            .iter()
            .map(|w| "-".repeat(*w))
            .collect::<Vec<_>>()
            .join("-+-");
        writeln!(f, "{}", separator)?;

        for row in &self.rows {
            let row_str: Vec<String> = row
                .iter()
                .enumerate()
                .take(widths.len())
                .map(|(i, val)| format!("{:width$}", val.to_string(), width = widths[i]))
                .collect();
            writeln!(f, "{}", row_str.join(" | "))?;
        }

        write!(f, "\n{} row(s)", self.rows.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::{Code, Status};
    use futures::stream;

    fn streaming(rows: Vec<std::result::Result<Row, Status>>) -> StreamingResult {
        StreamingResult {
            metadata: ResultSetMetadata {
                columns: vec!["id".into(), "name".into()],
                transaction: None,
            },
            rows: stream::iter(rows).boxed(),
        }
    }

    #[tokio::test]
    async fn test_collect_rows() {
        let set = ResultSet::from_rpc(
            streaming(vec![
                Ok(vec![Value::Integer(1), Value::Text("a".into())]),
                Ok(vec![Value::Integer(2), Value::Text("b".into())]),
            ]),
            Phase::Read,
        );
        assert_eq!(set.columns(), &["id".to_string(), "name".to_string()]);

        let result = set.collect().await.unwrap();
        assert_eq!(result.row_count(), 2);
        assert_eq!(result.get(1, "name"), Some(&Value::Text("b".into())));
        assert_eq!(result.get(0, "missing"), None);
    }

    #[tokio::test]
    async fn test_stream_error_is_mapped() {
        let mut set = ResultSet::from_rpc(
            streaming(vec![
                Ok(vec![Value::Integer(1), Value::Null]),
                Err(Status::aborted("conflict mid-stream")),
            ]),
            Phase::Running,
        );
        assert!(set.next().await.unwrap().is_ok());
        let err = set.next().await.unwrap().unwrap_err();
        assert!(err.is_aborted());
        assert_eq!(err.phase(), Some(Phase::Running));
        assert!(set.next().await.is_none());
    }

    #[test]
    fn test_display_table() {
        let result = QueryResult::new(
            vec!["id".into()],
            vec![vec![Value::Integer(10)], vec![Value::Integer(200)]],
        );
        let text = result.to_string();
        assert!(text.starts_with("id "));
        assert!(text.ends_with("2 row(s)"));
        assert_eq!(Status::new(Code::Internal, "x").code, Code::Internal);
    }
}
