use polars::prelude::*;
use std::f64::consts::E;
use tracing::{debug, instrument};

use crate::config::FeatureParams;
use crate::data_loader::MarketSeries;
use crate::error::{CrisisError, Result};

pub const LOG_RETURN_COLUMN: &str = "Log_Ret";

/// Derives log return, rolling volatility and a simple moving average from
/// the closing price.
pub struct FeatureEngineer {
    params: FeatureParams,
}

impl FeatureEngineer {
    pub fn new(params: FeatureParams) -> Self {
        Self { params }
    }

    pub fn volatility_column(&self) -> String {
        format!("Vol_{}", self.params.volatility_window)
    }

    pub fn momentum_column(&self) -> String {
        format!("SMA_{}", self.params.momentum_window)
    }

    /// Adds the derived columns and drops every row left with a null.
    ///
    /// Without a closing-price column the series is returned unchanged.
    #[instrument(skip_all, fields(rows = series.height()))]
    pub fn engineer_features(&self, series: &MarketSeries) -> Result<MarketSeries> {
        if !series.has_column(&self.params.close_column) {
            debug!(
                close_column = %self.params.close_column,
                "No closing price column, skipping feature engineering"
            );
            return Ok(series.clone());
        }
        if self.params.volatility_window < 2 || self.params.momentum_window < 1 {
            return Err(CrisisError::Config(format!(
                "Invalid rolling windows: volatility {}, momentum {}",
                self.params.volatility_window, self.params.momentum_window
            )));
        }

        let frame = series
            .frame()
            .clone()
            .lazy()
            .with_columns([self.log_return().alias(LOG_RETURN_COLUMN)])
            .with_columns(self.rolling_features())
            .drop_nulls(None)
            .collect()?;

        debug!(before = series.height(), after = frame.height(), "Features engineered");
        Ok(series.with_frame(frame))
    }

    fn close(&self) -> Expr {
        col(self.params.close_column.as_str()).cast(DataType::Float64)
    }

    /// ln(close[t] / close[t-1]). A non-positive price gives NaN or an
    /// infinite ratio; both become null so the row is dropped and no rolling
    /// window spans it.
    fn log_return(&self) -> Expr {
        finite_or_null((self.close() / self.close().shift(lit(1))).log(E))
    }

    fn rolling_features(&self) -> Vec<Expr> {
        vec![
            finite_or_null(
                col(LOG_RETURN_COLUMN).rolling_std(full_window(self.params.volatility_window)),
            )
            .alias(self.volatility_column()),
            finite_or_null(self.close().rolling_mean(full_window(self.params.momentum_window)))
                .alias(self.momentum_column()),
        ]
    }
}

fn finite_or_null(expr: Expr) -> Expr {
    when(expr.clone().is_finite())
        .then(expr)
        .otherwise(lit(NULL).cast(DataType::Float64))
}

fn full_window(window_size: usize) -> RollingOptionsFixedWindow {
    RollingOptionsFixedWindow {
        window_size,
        min_periods: window_size,
        ..Default::default()
    }
}
