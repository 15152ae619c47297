use chrono::{NaiveDate, NaiveDateTime};
use polars::prelude::*;
use std::fs::File;
use std::path::{Path, PathBuf};
use tracing::{debug, info, instrument, warn};

use crate::config::FeatureParams;
use crate::error::{CrisisError, Result};
use crate::feature_engineering::FeatureEngineer;

const DATETIME_FORMATS: &[&str] = &["%Y-%m-%d %H:%M:%S", "%Y-%m-%dT%H:%M:%S"];
const DATE_FORMATS: &[&str] = &["%Y-%m-%d", "%Y/%m/%d", "%m/%d/%Y"];

/// How `clean` fills missing values when rows are not dropped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FillStrategy {
    /// Propagate the last valid value forward.
    Forward,
    /// Propagate the next valid value backward.
    Backward,
    /// Replace missing numeric values with zero and missing flags with
    /// `false`. Nulls in text columns are left in place.
    Zero,
}

impl FillStrategy {
    /// Resolves a strategy by name. Unknown names fall back to zero fill.
    pub fn from_name(name: &str) -> Self {
        match name {
            "ffill" | "forward" => FillStrategy::Forward,
            "bfill" | "backward" => FillStrategy::Backward,
            "zero" => FillStrategy::Zero,
            other => {
                warn!(strategy = other, "Unknown fill strategy, falling back to zero fill");
                FillStrategy::Zero
            }
        }
    }
}

/// A time-indexed table of market records.
///
/// The time index, when established, lives in the frame as a millisecond
/// `Datetime` column that is unique and strictly increasing. Every transform
/// returns a new value and leaves `self` untouched.
#[derive(Debug, Clone)]
pub struct MarketSeries {
    frame: DataFrame,
    index_column: Option<PlSmallStr>,
}

impl MarketSeries {
    /// Wraps a frame without establishing a time index.
    pub fn from_frame(frame: DataFrame) -> Self {
        Self {
            frame,
            index_column: None,
        }
    }

    /// Reads a delimited or parquet file and indexes it by `date_column`.
    #[instrument(skip(path), fields(path = %path.as_ref().display()))]
    pub fn load<P: AsRef<Path>>(path: P, date_column: &str, separator: u8) -> Result<Self> {
        let path = path.as_ref();
        if !path.exists() {
            return Err(CrisisError::not_found(path));
        }

        info!("Loading data from {}", path.display());
        let frame = read_frame(path, separator)?;
        debug!(shape = ?frame.shape(), "Raw frame read");

        if frame.get_column_names().iter().any(|name| name.as_str() == date_column) {
            Self::with_time_index(frame, date_column)
        } else {
            warn!(
                date_column,
                "Date column not found, rows keep source order and indexing might be incorrect"
            );
            Ok(Self::from_frame(frame))
        }
    }

    /// Parses `date_column` into timestamps, sorts ascending and keeps the
    /// first row of any duplicated timestamp.
    pub fn with_time_index(frame: DataFrame, date_column: &str) -> Result<Self> {
        let mut frame = frame;
        let column = frame.column(date_column)?;
        let millis: Vec<Option<i64>> = match column.dtype() {
            DataType::Date | DataType::Datetime(_, _) => column
                .cast(&DataType::Datetime(TimeUnit::Milliseconds, None))?
                .cast(&DataType::Int64)?
                .i64()?
                .into_iter()
                .collect(),
            DataType::String => column
                .str()?
                .into_iter()
                .map(|raw| raw.map(parse_timestamp).transpose())
                .collect::<Result<_>>()?,
            other => {
                return Err(CrisisError::Config(format!(
                    "Date column '{date_column}' has unsupported type {other}"
                )))
            }
        };

        let stamps = Series::new(date_column.into(), millis)
            .cast(&DataType::Datetime(TimeUnit::Milliseconds, None))?;
        frame.with_column(stamps)?;

        let missing = frame.column(date_column)?.null_count();
        if missing > 0 {
            warn!(missing, date_column, "Dropping rows without a timestamp");
        }

        let sorted = frame
            .lazy()
            .filter(col(date_column).is_not_null())
            .sort([date_column], SortMultipleOptions::default().with_maintain_order(true))
            .collect()?;

        let stamps: Vec<i64> = sorted
            .column(date_column)?
            .cast(&DataType::Int64)?
            .i64()?
            .into_iter()
            .flatten()
            .collect();
        let keep: BooleanChunked = stamps
            .iter()
            .enumerate()
            .map(|(row, stamp)| row == 0 || stamps[row - 1] != *stamp)
            .collect();
        let duplicates = stamps.windows(2).filter(|pair| pair[0] == pair[1]).count();
        let frame = if duplicates > 0 {
            warn!(duplicates, "Dropping rows with duplicated timestamps");
            sorted.filter(&keep)?
        } else {
            sorted
        };

        Ok(Self {
            frame,
            index_column: Some(date_column.into()),
        })
    }

    pub fn frame(&self) -> &DataFrame {
        &self.frame
    }

    /// Name of the time index column, if one was established.
    pub fn index_column(&self) -> Option<&str> {
        self.index_column.as_ref().map(|name| name.as_str())
    }

    pub fn height(&self) -> usize {
        self.frame.height()
    }

    pub fn has_column(&self, name: &str) -> bool {
        self.frame
            .get_column_names()
            .iter()
            .any(|column| column.as_str() == name)
    }

    /// Index timestamps in milliseconds since the epoch.
    pub fn timestamps(&self) -> Result<Option<Vec<i64>>> {
        let Some(index) = self.index_column() else {
            return Ok(None);
        };
        let stamps = self
            .frame
            .column(index)?
            .cast(&DataType::Int64)?
            .i64()?
            .into_iter()
            .flatten()
            .collect();
        Ok(Some(stamps))
    }

    pub(crate) fn with_frame(&self, frame: DataFrame) -> Self {
        Self {
            frame,
            index_column: self.index_column.clone(),
        }
    }

    /// Turns NaN and infinite floats into nulls, then drops or fills nulls.
    #[instrument(skip(self), fields(rows = self.height()))]
    pub fn clean(&self, drop_missing: bool, strategy: FillStrategy) -> Result<Self> {
        let mut frame = self.frame.clone();

        let float_columns: Vec<PlSmallStr> = frame
            .get_columns()
            .iter()
            .filter(|column| column.dtype().is_float())
            .map(|column| column.name().clone())
            .collect();
        for name in float_columns {
            let column = frame.column(name.as_str())?;
            let dtype = column.dtype().clone();
            let finite: Vec<Option<f64>> = column
                .cast(&DataType::Float64)?
                .f64()?
                .into_iter()
                .map(|value| value.filter(|v| v.is_finite()))
                .collect();
            frame.with_column(Series::new(name, finite).cast(&dtype)?)?;
        }

        let frame = if drop_missing {
            frame.lazy().drop_nulls(None).collect()?
        } else {
            match strategy {
                FillStrategy::Forward => frame.fill_null(FillNullStrategy::Forward(None))?,
                FillStrategy::Backward => frame.fill_null(FillNullStrategy::Backward(None))?,
                FillStrategy::Zero => {
                    let zeros: Vec<Expr> = frame
                        .get_columns()
                        .iter()
                        .filter_map(|column| {
                            let name = column.name().clone();
                            match column.dtype() {
                                dtype if dtype.is_numeric() => Some(col(name).fill_null(lit(0))),
                                DataType::Boolean => Some(col(name).fill_null(lit(false))),
                                _ => None,
                            }
                        })
                        .collect();
                    frame.lazy().with_columns(zeros).collect()?
                }
            }
        };

        debug!(before = self.height(), after = frame.height(), "Cleaned data");
        Ok(self.with_frame(frame))
    }

    /// Separates the target column from the feature columns.
    ///
    /// The time index and every name in `excluded` stay out of the feature
    /// table; excluded names that are not present are ignored.
    pub fn split(&self, target_column: &str, excluded: &[String]) -> Result<(FeatureTable, TargetVector)> {
        if !self.has_column(target_column) {
            return Err(CrisisError::Config(format!(
                "Target column '{target_column}' not found in dataset"
            )));
        }

        let target = TargetVector::new(self.frame.column(target_column)?.clone());
        let feature_names: Vec<PlSmallStr> = self
            .frame
            .get_column_names()
            .into_iter()
            .filter(|name| {
                name.as_str() != target_column
                    && Some(name.as_str()) != self.index_column()
                    && !excluded.iter().any(|drop| drop == name.as_str())
            })
            .cloned()
            .collect();
        let index = match self.index_column() {
            Some(name) => Some(self.frame.column(name)?.clone()),
            None => None,
        };
        let features = FeatureTable {
            frame: self.frame.select(feature_names)?,
            index,
        };

        debug!(
            features = features.width(),
            rows = features.height(),
            "Split features and target"
        );
        Ok((features, target))
    }
}

/// Feature matrix (X): one column per feature, rows aligned with the index.
#[derive(Debug, Clone)]
pub struct FeatureTable {
    frame: DataFrame,
    index: Option<Column>,
}

impl FeatureTable {
    pub fn new(frame: DataFrame) -> Self {
        Self { frame, index: None }
    }

    pub fn frame(&self) -> &DataFrame {
        &self.frame
    }

    /// Time index aligned with the rows, when the source had one.
    pub fn index(&self) -> Option<&Column> {
        self.index.as_ref()
    }

    pub fn height(&self) -> usize {
        self.frame.height()
    }

    pub fn width(&self) -> usize {
        self.frame.width()
    }

    pub fn feature_names(&self) -> Vec<String> {
        self.frame
            .get_column_names()
            .iter()
            .map(|name| name.to_string())
            .collect()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.frame
            .get_column_names()
            .iter()
            .any(|column| column.as_str() == name)
    }

    pub fn slice(&self, offset: i64, length: usize) -> Self {
        Self {
            frame: self.frame.slice(offset, length),
            index: self.index.as_ref().map(|index| index.slice(offset, length)),
        }
    }

    /// First NaN or infinite value as `(column, row)`, scanning float columns
    /// in order. Nulls are not reported.
    pub fn first_non_finite(&self) -> Result<Option<(String, usize)>> {
        for column in self.frame.get_columns() {
            if !column.dtype().is_float() {
                continue;
            }
            let values = column.cast(&DataType::Float64)?;
            let row = values
                .f64()?
                .into_iter()
                .position(|value| value.is_some_and(|v| !v.is_finite()));
            if let Some(row) = row {
                return Ok(Some((column.name().to_string(), row)));
            }
        }
        Ok(None)
    }

    /// Reorders the columns to `names`, failing when one is missing.
    pub fn select(&self, names: &[String]) -> Result<Self> {
        if let Some(missing) = names.iter().find(|name| !self.contains(name)) {
            return Err(CrisisError::Config(format!(
                "Feature column '{missing}' is missing from the input"
            )));
        }
        Ok(Self {
            frame: self.frame.select(names.iter().map(|name| name.as_str()))?,
            index: self.index.clone(),
        })
    }
}

/// Label column (y), aligned row for row with a `FeatureTable`.
#[derive(Debug, Clone)]
pub struct TargetVector {
    values: Column,
}

impl TargetVector {
    pub fn new(values: Column) -> Self {
        Self { values }
    }

    pub fn from_series(values: Series) -> Self {
        Self::new(Column::from(values))
    }

    pub fn name(&self) -> &str {
        self.values.name().as_str()
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.len() == 0
    }

    pub fn slice(&self, offset: i64, length: usize) -> Self {
        Self::new(self.values.slice(offset, length))
    }

    /// Reads the labels as 0/1. Any other value, or a null, is an error.
    pub fn labels(&self) -> Result<Vec<u8>> {
        let values = self.values.cast(&DataType::Float64)?;
        values
            .f64()?
            .into_iter()
            .enumerate()
            .map(|(row, value)| match value {
                Some(v) if v == 0.0 => Ok(0),
                Some(v) if v == 1.0 => Ok(1),
                Some(v) => Err(CrisisError::Computation(format!(
                    "Target '{}' has non-binary value {v} at row {row}",
                    self.name()
                ))),
                None => Err(CrisisError::Computation(format!(
                    "Target '{}' is missing at row {row}",
                    self.name()
                ))),
            })
            .collect()
    }
}

pub type Split = (FeatureTable, TargetVector);

/// Splits X/y into a leading train part and a trailing test part of
/// `test_fraction` of the rows, keeping time order.
pub fn chronological_split(
    features: &FeatureTable,
    targets: &TargetVector,
    test_fraction: f64,
) -> Result<(Split, Split)> {
    if features.height() != targets.len() {
        return Err(CrisisError::Computation(format!(
            "Feature rows ({}) and target rows ({}) differ",
            features.height(),
            targets.len()
        )));
    }
    if !(test_fraction > 0.0 && test_fraction < 1.0) {
        return Err(CrisisError::Config(format!(
            "test_fraction must be in (0, 1), got {test_fraction}"
        )));
    }

    let rows = features.height();
    let test_rows = (rows as f64 * test_fraction).round() as usize;
    if test_rows == 0 || test_rows >= rows {
        return Err(CrisisError::Config(format!(
            "Cannot split {rows} rows with test_fraction {test_fraction}"
        )));
    }
    let train_rows = rows - test_rows;

    Ok((
        (features.slice(0, train_rows), targets.slice(0, train_rows)),
        (
            features.slice(train_rows as i64, test_rows),
            targets.slice(train_rows as i64, test_rows),
        ),
    ))
}

/// Position of a `DataLoader` in the load → clean → engineer → split flow.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum LoaderStage {
    Unloaded,
    Loaded,
    Cleaned,
    FeatureEngineered,
    Split,
}

/// DataLoader drives the loading and preprocessing of one market data file.
///
/// It owns the working table and replaces it only when a step succeeds, so a
/// failed step never leaves it half transformed.
pub struct DataLoader {
    path: PathBuf,
    target_column: String,
    date_column: String,
    separator: u8,
    feature_engineer: FeatureEngineer,
    series: Option<MarketSeries>,
    stage: LoaderStage,
}

impl DataLoader {
    pub fn new<P: AsRef<Path>>(path: P, target_column: &str, date_column: &str) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
            target_column: target_column.to_string(),
            date_column: date_column.to_string(),
            separator: b',',
            feature_engineer: FeatureEngineer::new(FeatureParams::default()),
            series: None,
            stage: LoaderStage::Unloaded,
        }
    }

    pub fn with_separator(mut self, separator: u8) -> Self {
        self.separator = separator;
        self
    }

    pub fn with_feature_params(mut self, params: FeatureParams) -> Self {
        self.feature_engineer = FeatureEngineer::new(params);
        self
    }

    pub fn stage(&self) -> LoaderStage {
        self.stage
    }

    pub fn series(&self) -> Option<&MarketSeries> {
        self.series.as_ref()
    }

    /// Reads the file, replacing any previously loaded table.
    pub fn load(&mut self) -> Result<&MarketSeries> {
        let series = MarketSeries::load(&self.path, &self.date_column, self.separator)?;
        self.stage = LoaderStage::Loaded;
        Ok(self.series.insert(series))
    }

    pub fn clean(&mut self, drop_missing: bool, fill_strategy: &str) -> Result<&MarketSeries> {
        let current = self.loaded("clean")?;
        let cleaned = current.clean(drop_missing, FillStrategy::from_name(fill_strategy))?;
        self.stage = LoaderStage::Cleaned;
        Ok(self.series.insert(cleaned))
    }

    pub fn engineer_features(&mut self) -> Result<&MarketSeries> {
        let current = self.loaded("engineer_features")?;
        let engineered = self.feature_engineer.engineer_features(current)?;
        self.stage = LoaderStage::FeatureEngineered;
        Ok(self.series.insert(engineered))
    }

    /// Splits the working table into features and the configured target.
    pub fn split(&mut self, excluded: &[String]) -> Result<(FeatureTable, TargetVector)> {
        let current = self
            .series
            .as_ref()
            .ok_or_else(|| CrisisError::Config("Data not loaded or processed".to_string()))?;
        let split = current.split(&self.target_column, excluded)?;
        self.stage = LoaderStage::Split;
        Ok(split)
    }

    fn loaded(&self, operation: &str) -> Result<&MarketSeries> {
        self.series.as_ref().ok_or_else(|| {
            CrisisError::State(format!("Data not loaded, call load() before {operation}()"))
        })
    }
}

fn read_frame(path: &Path, separator: u8) -> Result<DataFrame> {
    let file = File::open(path)?;
    let is_parquet = path
        .extension()
        .and_then(|ext| ext.to_str())
        .is_some_and(|ext| ext.eq_ignore_ascii_case("parquet"));

    let frame = if is_parquet {
        ParquetReader::new(file).finish()?
    } else {
        let parse_options = CsvParseOptions::default()
            .with_separator(separator)
            .with_try_parse_dates(true);
        CsvReadOptions::default()
            .with_has_header(true)
            .with_infer_schema_length(None)
            .with_parse_options(parse_options)
            .into_reader_with_file_handle(file)
            .finish()?
    };
    Ok(frame)
}

fn parse_timestamp(raw: &str) -> Result<i64> {
    let raw = raw.trim();
    for format in DATETIME_FORMATS {
        if let Ok(stamp) = NaiveDateTime::parse_from_str(raw, format) {
            return Ok(stamp.and_utc().timestamp_millis());
        }
    }
    for format in DATE_FORMATS {
        if let Some(stamp) = NaiveDate::parse_from_str(raw, format)
            .ok()
            .and_then(|date| date.and_hms_opt(0, 0, 0))
        {
            return Ok(stamp.and_utc().timestamp_millis());
        }
    }
    Err(CrisisError::Config(format!("Unparseable timestamp '{raw}'")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    fn create_test_csv() -> NamedTempFile {
        let mut file = tempfile::Builder::new()
            .suffix(".csv")
            .tempfile()
            .unwrap();
        writeln!(file, "Date,Close,Volume,target").unwrap();
        writeln!(file, "2024-01-03,102.0,1300,0").unwrap();
        writeln!(file, "2024-01-01,100.0,1100,0").unwrap();
        writeln!(file, "2024-01-02,101.0,,1").unwrap();
        writeln!(file, "2024-01-04,103.0,1400,1").unwrap();
        file
    }

    #[test]
    fn test_load_sorts_by_date() {
        let file = create_test_csv();
        let series = MarketSeries::load(file.path(), "Date", b',').unwrap();

        assert_eq!(series.height(), 4);
        assert_eq!(series.index_column(), Some("Date"));
        let stamps = series.timestamps().unwrap().unwrap();
        assert!(stamps.windows(2).all(|pair| pair[0] < pair[1]));

        let close: Vec<f64> = series
            .frame()
            .column("Close")
            .unwrap()
            .f64()
            .unwrap()
            .into_no_null_iter()
            .collect();
        assert_eq!(close, vec![100.0, 101.0, 102.0, 103.0]);
    }

    #[test]
    fn test_load_missing_file() {
        let result = MarketSeries::load("no/such/market_data.csv", "Date", b',');
        assert!(matches!(result, Err(CrisisError::NotFound { .. })));
    }

    #[test]
    fn test_load_without_date_column_keeps_order() {
        let file = create_test_csv();
        let series = MarketSeries::load(file.path(), "Timestamp", b',').unwrap();
        assert_eq!(series.index_column(), None);
        assert!(series.timestamps().unwrap().is_none());
        let first = series.frame().column("Close").unwrap().f64().unwrap().get(0);
        assert_eq!(first, Some(102.0));
    }

    #[test]
    fn test_load_with_custom_separator() {
        let mut file = tempfile::Builder::new()
            .suffix(".txt")
            .tempfile()
            .unwrap();
        writeln!(file, "Date;Close;target").unwrap();
        writeln!(file, "2024-03-02;11.5;1").unwrap();
        writeln!(file, "2024-03-01;10.5;0").unwrap();

        let mut loader = DataLoader::new(file.path(), "target", "Date").with_separator(b';');
        let series = loader.load().unwrap();
        assert_eq!(series.height(), 2);
        assert!(series.has_column("Close"));
        let first = series.frame().column("Close").unwrap().f64().unwrap().get(0);
        assert_eq!(first, Some(10.5));
    }

    #[test]
    fn test_time_index_drops_duplicates() {
        let df = df!(
            "Date" => &["2024-02-02", "2024-02-01", "2024-02-02 00:00:00", "2024/02/03"],
            "Close" => &[2.0, 1.0, 9.0, 3.0]
        )
        .unwrap();
        let series = MarketSeries::with_time_index(df, "Date").unwrap();

        assert_eq!(series.height(), 3);
        let stamps = series.timestamps().unwrap().unwrap();
        assert!(stamps.windows(2).all(|pair| pair[0] < pair[1]));
        let close: Vec<f64> = series
            .frame()
            .column("Close")
            .unwrap()
            .f64()
            .unwrap()
            .into_no_null_iter()
            .collect();
        assert_eq!(close, vec![1.0, 2.0, 3.0]);
    }

    #[test]
    fn test_unparseable_date_is_config_error() {
        let df = df!(
            "Date" => &["2024-02-01", "yesterday"],
            "Close" => &[1.0, 2.0]
        )
        .unwrap();
        let result = MarketSeries::with_time_index(df, "Date");
        assert!(matches!(result, Err(CrisisError::Config(_))));
    }

    #[test]
    fn test_clean_drop_missing_is_idempotent() {
        let df = df!(
            "a" => &[Some(1.0), None, Some(f64::INFINITY), Some(4.0), Some(f64::NAN)],
            "b" => &[Some(1i64), Some(2), Some(3), None, Some(5)]
        )
        .unwrap();
        let series = MarketSeries::from_frame(df);

        let once = series.clean(true, FillStrategy::Forward).unwrap();
        let twice = once.clean(true, FillStrategy::Forward).unwrap();

        assert_eq!(once.height(), 1);
        assert!(once.frame().equals_missing(twice.frame()));
    }

    #[test]
    fn test_forward_fill_leaves_no_missing_values() {
        let df = df!(
            "a" => &[Some(1.0), None, Some(f64::NEG_INFINITY), None],
            "b" => &[Some(5i64), None, None, Some(8)]
        )
        .unwrap();
        let cleaned = MarketSeries::from_frame(df)
            .clean(false, FillStrategy::Forward)
            .unwrap();

        let frame = cleaned.frame();
        assert_eq!(frame.height(), 4);
        assert_eq!(frame.column("a").unwrap().null_count(), 0);
        assert_eq!(frame.column("b").unwrap().null_count(), 0);
        let a: Vec<f64> = frame.column("a").unwrap().f64().unwrap().into_no_null_iter().collect();
        assert_eq!(a, vec![1.0, 1.0, 1.0, 1.0]);
    }

    #[test]
    fn test_backward_and_zero_fill() {
        let df = df!("a" => &[None, Some(2.0), None]).unwrap();
        let series = MarketSeries::from_frame(df);

        let back = series.clean(false, FillStrategy::Backward).unwrap();
        let values: Vec<Option<f64>> = back.frame().column("a").unwrap().f64().unwrap().into_iter().collect();
        assert_eq!(values, vec![Some(2.0), Some(2.0), None]);

        let zero = series.clean(false, FillStrategy::from_name("median")).unwrap();
        let values: Vec<Option<f64>> = zero.frame().column("a").unwrap().f64().unwrap().into_iter().collect();
        assert_eq!(values, vec![Some(0.0), Some(2.0), Some(0.0)]);
    }

    #[test]
    fn test_zero_fill_covers_flags_and_skips_text() {
        let df = df!(
            "volume" => &[Some(5i64), None, Some(7)],
            "halted" => &[None, Some(true), None],
            "venue" => &[Some("NYSE"), None, Some("LSE")]
        )
        .unwrap();
        let zero = MarketSeries::from_frame(df).clean(false, FillStrategy::Zero).unwrap();
        let frame = zero.frame();

        let volume: Vec<Option<i64>> = frame.column("volume").unwrap().i64().unwrap().into_iter().collect();
        assert_eq!(volume, vec![Some(5), Some(0), Some(7)]);
        let halted: Vec<Option<bool>> = frame.column("halted").unwrap().bool().unwrap().into_iter().collect();
        assert_eq!(halted, vec![Some(false), Some(true), Some(false)]);
        assert_eq!(frame.column("venue").unwrap().null_count(), 1);
    }

    #[test]
    fn test_split_excludes_target_and_index() {
        let file = create_test_csv();
        let series = MarketSeries::load(file.path(), "Date", b',').unwrap();
        let (features, target) = series
            .split("target", &["Volume".to_string(), "NotAColumn".to_string()])
            .unwrap();

        assert_eq!(features.feature_names(), vec!["Close".to_string()]);
        assert_eq!(features.height(), target.len());
        assert!(features.index().is_some());
        assert_eq!(target.labels().unwrap(), vec![0, 1, 0, 1]);
    }

    #[test]
    fn test_split_missing_target() {
        let series = MarketSeries::from_frame(df!("Close" => &[1.0, 2.0]).unwrap());
        let result = series.split("Crisis_Label", &[]);
        assert!(matches!(result, Err(CrisisError::Config(_))));
    }

    #[test]
    fn test_labels_reject_non_binary() {
        let target = TargetVector::from_series(Series::new("target".into(), &[0.0, 2.0]));
        assert!(matches!(target.labels(), Err(CrisisError::Computation(_))));
    }

    #[test]
    fn test_chronological_split() {
        let features = FeatureTable::new(df!("x" => &[0.0, 1.0, 2.0, 3.0, 4.0]).unwrap());
        let target = TargetVector::from_series(Series::new("y".into(), &[0i32, 0, 1, 1, 1]));

        let ((x_train, y_train), (x_test, y_test)) =
            chronological_split(&features, &target, 0.4).unwrap();
        assert_eq!(x_train.height(), 3);
        assert_eq!(y_train.labels().unwrap(), vec![0, 0, 1]);
        assert_eq!(x_test.height(), 2);
        assert_eq!(y_test.labels().unwrap(), vec![1, 1]);

        assert!(chronological_split(&features, &target, 1.0).is_err());
    }

    #[test]
    fn test_loader_state_machine() {
        let file = create_test_csv();
        let mut loader = DataLoader::new(file.path(), "target", "Date");
        assert_eq!(loader.stage(), LoaderStage::Unloaded);
        assert!(loader.series().is_none());

        assert!(matches!(loader.clean(true, "ffill"), Err(CrisisError::State(_))));
        assert!(matches!(loader.engineer_features(), Err(CrisisError::State(_))));
        assert!(matches!(loader.split(&[]), Err(CrisisError::Config(_))));

        loader.load().unwrap();
        assert_eq!(loader.stage(), LoaderStage::Loaded);
        let cleaned_rows = loader.clean(true, "ffill").unwrap().height();
        assert_eq!(cleaned_rows, 3);
        assert_eq!(loader.stage(), LoaderStage::Cleaned);

        // No history for the rolling windows, so every row is dropped.
        assert_eq!(loader.engineer_features().unwrap().height(), 0);
        assert_eq!(loader.stage(), LoaderStage::FeatureEngineered);

        let (features, target) = loader.split(&[]).unwrap();
        assert_eq!(features.height(), target.len());
        assert_eq!(loader.stage(), LoaderStage::Split);
    }
}
