//! Postgres coverage source over the market-data tables.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::NaiveDate;
use sqlx::{PgPool, Row};
use tracing::instrument;

use backtestq_analysis::{CoverageError, CoverageSource, SymbolCoverage};

/// Reads per-symbol row counts and date ranges from `daily_stock_price`
/// (`symbol`, `date`) and `score_table_dart_idc` (`stock_code`, `rcept_dt`).
#[derive(Debug, Clone)]
pub struct PgCoverageSource {
    pool: Arc<PgPool>,
}

impl PgCoverageSource {
    pub fn new(pool: PgPool) -> Self {
        Self {
            pool: Arc::new(pool),
        }
    }

    async fn coverage(
        &self,
        sql: &str,
        symbols: &[String],
        start: NaiveDate,
        end: NaiveDate,
    ) -> Result<Vec<SymbolCoverage>, CoverageError> {
        let rows = sqlx::query(sql)
            .bind(symbols)
            .bind(start)
            .bind(end)
            .fetch_all(&*self.pool)
            .await
            .map_err(|e| CoverageError::Unavailable(e.to_string()))?;

        let mut found = HashMap::with_capacity(rows.len());
        for row in rows {
            let read = |e: sqlx::Error| CoverageError::Unavailable(format!("unreadable coverage row: {e}"));
            let symbol: String = row.try_get("symbol").map_err(read)?;
            let row_count: i64 = row.try_get("row_count").map_err(read)?;
            let first_date: Option<NaiveDate> = row.try_get("first_date").map_err(read)?;
            let last_date: Option<NaiveDate> = row.try_get("last_date").map_err(read)?;
            found.insert(
                symbol.clone(),
                SymbolCoverage {
                    symbol,
                    rows: row_count.max(0) as u64,
                    first_date,
                    last_date,
                },
            );
        }

        // One entry per requested symbol, in request order.
        Ok(symbols
            .iter()
            .map(|s| found.remove(s).unwrap_or_else(|| SymbolCoverage::empty(s.clone())))
            .collect())
    }
}

#[async_trait]
impl CoverageSource for PgCoverageSource {
    #[instrument(skip(self, symbols), fields(symbols = symbols.len()), err)]
    async fn price_coverage(
        &self,
        symbols: &[String],
        start: NaiveDate,
        end: NaiveDate,
    ) -> Result<Vec<SymbolCoverage>, CoverageError> {
        self.coverage(
            r#"
            SELECT symbol, COUNT(*) AS row_count, MIN(date) AS first_date, MAX(date) AS last_date
            FROM daily_stock_price
            WHERE symbol = ANY($1) AND date BETWEEN $2 AND $3
            GROUP BY symbol
            "#,
            symbols,
            start,
            end,
        )
        .await
    }

    #[instrument(skip(self, symbols), fields(symbols = symbols.len()), err)]
    async fn disclosure_coverage(
        &self,
        symbols: &[String],
        start: NaiveDate,
        end: NaiveDate,
    ) -> Result<Vec<SymbolCoverage>, CoverageError> {
        self.coverage(
            r#"
            SELECT stock_code AS symbol,
                   COUNT(*) AS row_count,
                   MIN(rcept_dt) AS first_date,
                   MAX(rcept_dt) AS last_date
            FROM score_table_dart_idc
            WHERE stock_code = ANY($1) AND rcept_dt BETWEEN $2 AND $3
            GROUP BY stock_code
            "#,
            symbols,
            start,
            end,
        )
        .await
    }
}
