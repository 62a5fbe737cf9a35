use std::fmt::{self, Display};
use std::fs::File;
use std::io;
use std::path::Path;

use arrow::array::{Array, Float64Array, TimestampMicrosecondArray};
use arrow::compute::cast;
use arrow::datatypes::{DataType, TimeUnit};
use arrow::record_batch::RecordBatch;
use log::debug;
use parquet::arrow::arrow_reader::ParquetRecordBatchReaderBuilder;
use time::OffsetDateTime;

use crate::sink::{PRICE_COLUMNS, TIMESTAMP_COLUMN};
use crate::Error;

/// One row of a bar file.
#[derive(Clone, Debug, PartialEq)]
pub struct BarRow {
    pub timestamp: Option<OffsetDateTime>,
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
    pub volume: f64,
}

impl BarRow {
    fn values(&self) -> [f64; 5] {
        [self.open, self.high, self.low, self.close, self.volume]
    }
}

impl Display for BarRow {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.timestamp {
            Some(timestamp) => write!(f, "{timestamp}")?,
            None => write!(f, "NaT")?,
        }
        write!(
            f,
            "  open {} high {} low {} close {} volume {}",
            self.open, self.high, self.low, self.close, self.volume
        )
    }
}

/// Count, mean, sample standard deviation, min and max of a numeric column. NaN when undefined.
#[derive(Clone, Debug, PartialEq)]
pub struct ColumnStats {
    pub name: String,
    pub count: usize,
    pub mean: f64,
    pub std: f64,
    pub min: f64,
    pub max: f64,
}

impl ColumnStats {
    fn of(name: &str, values: &[f64]) -> ColumnStats {
        let count = values.len();
        if count == 0 {
            return ColumnStats {
                name: name.to_string(),
                count,
                mean: f64::NAN,
                std: f64::NAN,
                min: f64::NAN,
                max: f64::NAN,
            };
        }

        let mean = values.iter().sum::<f64>() / count as f64;
        let std = if count > 1 {
            let squares: f64 = values.iter().map(|v| (v - mean).powi(2)).sum();
            (squares / (count - 1) as f64).sqrt()
        } else {
            f64::NAN
        };

        ColumnStats {
            name: name.to_string(),
            count,
            mean,
            std,
            min: values.iter().copied().fold(f64::INFINITY, f64::min),
            max: values.iter().copied().fold(f64::NEG_INFINITY, f64::max),
        }
    }
}

impl Display for ColumnStats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{:<8} count {:>8} mean {:>14.4} std {:>14.4} min {:>14.4} max {:>14.4}",
            self.name, self.count, self.mean, self.std, self.min, self.max
        )
    }
}

/// Contents of a bar file.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct BarTable {
    rows: Vec<BarRow>,
}

impl BarTable {
    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    pub fn rows(&self) -> &[BarRow] {
        &self.rows
    }

    /// The first `n` rows.
    pub fn head(&self, n: usize) -> &[BarRow] {
        &self.rows[..n.min(self.rows.len())]
    }

    /// The last `n` rows.
    pub fn tail(&self, n: usize) -> &[BarRow] {
        &self.rows[self.rows.len().saturating_sub(n)..]
    }

    /// Statistics of the price and volume columns.
    pub fn describe(&self) -> Vec<ColumnStats> {
        PRICE_COLUMNS
            .iter()
            .enumerate()
            .map(|(i, name)| {
                let values: Vec<f64> = self.rows.iter().map(|row| row.values()[i]).filter(|v| !v.is_nan()).collect();
                ColumnStats::of(name, &values)
            })
            .collect()
    }

    /// Missing values per column, timestamp first.
    pub fn null_counts(&self) -> Vec<(String, usize)> {
        let mut counts = vec![(
            TIMESTAMP_COLUMN.to_string(),
            self.rows.iter().filter(|row| row.timestamp.is_none()).count(),
        )];
        counts.extend(
            PRICE_COLUMNS
                .iter()
                .enumerate()
                .map(|(i, name)| (name.to_string(), self.rows.iter().filter(|row| row.values()[i].is_nan()).count())),
        );
        counts
    }
}

/// Loads a bar file written by [ParquetSink](crate::sink::ParquetSink).
///
/// Price columns of any numeric type are read as `f64`; nulls become NaN.
pub fn read_bars(path: impl AsRef<Path>) -> Result<BarTable, Error> {
    let path = path.as_ref();
    if !path.exists() {
        return Err(Error::Io(io::Error::new(
            io::ErrorKind::NotFound,
            format!("{} does not exist", path.display()),
        )));
    }

    let reader = ParquetRecordBatchReaderBuilder::try_new(File::open(path)?)?.build()?;

    let mut table = BarTable::default();
    for batch in reader {
        append_rows(&mut table, &batch?)?;
    }

    debug!("read {} rows from {}", table.len(), path.display());

    Ok(table)
}

fn append_rows(table: &mut BarTable, batch: &RecordBatch) -> Result<(), Error> {
    let timestamps = column(batch, TIMESTAMP_COLUMN, &DataType::Timestamp(TimeUnit::Microsecond, Some("UTC".into())))?;
    let timestamps = timestamps
        .as_any()
        .downcast_ref::<TimestampMicrosecondArray>()
        .ok_or_else(|| Error::Simple("invalid timestamp column".into()))?;

    let mut prices = Vec::with_capacity(PRICE_COLUMNS.len());
    for name in PRICE_COLUMNS {
        prices.push(column(batch, name, &DataType::Float64)?);
    }
    let prices = prices
        .iter()
        .map(|array| {
            array
                .as_any()
                .downcast_ref::<Float64Array>()
                .ok_or_else(|| Error::Simple("invalid price column".into()))
        })
        .collect::<Result<Vec<_>, Error>>()?;

    let value = |array: &Float64Array, i: usize| if array.is_null(i) { f64::NAN } else { array.value(i) };

    for i in 0..batch.num_rows() {
        let timestamp = if timestamps.is_null(i) {
            None
        } else {
            OffsetDateTime::from_unix_timestamp_nanos(i128::from(timestamps.value(i)) * 1_000).ok()
        };

        table.rows.push(BarRow {
            timestamp,
            open: value(prices[0], i),
            high: value(prices[1], i),
            low: value(prices[2], i),
            close: value(prices[3], i),
            volume: value(prices[4], i),
        });
    }

    Ok(())
}

fn column(batch: &RecordBatch, name: &str, data_type: &DataType) -> Result<arrow::array::ArrayRef, Error> {
    let array = batch
        .column_by_name(name)
        .ok_or_else(|| Error::Simple(format!("missing column {name}")))?;
    Ok(cast(array, data_type)?)
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;
    use tempfile::TempDir;
    use time::macros::datetime;

    use super::*;
    use crate::market_data::historical::Bar;
    use crate::sink::{BarSink, ParquetSink};

    fn bar(date: &str, close: f64, volume: f64) -> Bar {
        Bar {
            date: date.into(),
            open: close,
            high: close,
            low: close,
            close,
            volume,
            ..Default::default()
        }
    }

    #[test]
    fn test_read_bars() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("all_data.parquet");
        let mut sink = ParquetSink::new(&path);
        sink.write_window(&[bar("1695427200", 1.0, 10.0), bar("bad", 2.0, 20.0), bar("1695427210", 3.0, 30.0)])
            .unwrap();
        sink.write_window(&[bar("1695427215", 4.0, 40.0)]).unwrap();
        sink.finish().unwrap();

        let table = read_bars(&path).unwrap();

        assert_eq!(table.len(), 4);
        assert_eq!(table.head(1)[0].timestamp, Some(datetime!(2023-09-23 00:00 UTC)));
        assert_eq!(table.head(10).len(), 4);
        assert_eq!(table.tail(2).iter().map(|r| r.close).collect::<Vec<_>>(), vec![3.0, 4.0]);
        assert_eq!(table.tail(0).len(), 0);

        let nulls = table.null_counts();
        assert_eq!(nulls[0], ("timestamp".to_string(), 1));
        assert_eq!(nulls[5], ("volume".to_string(), 0));

        let stats = table.describe();
        assert_eq!(stats.len(), 5);
        let close = &stats[3];
        assert_eq!(close.name, "close");
        assert_eq!(close.count, 4);
        assert_eq!(close.mean, 2.5);
        assert_eq!(close.min, 1.0);
        assert_eq!(close.max, 4.0);
        assert!((close.std - 1.2909944487358056).abs() < 1e-12);
    }

    #[test]
    fn test_missing_file() {
        let dir = TempDir::new().unwrap();

        let err = read_bars(dir.path().join("missing.parquet")).unwrap_err();

        assert!(err.to_string().contains("does not exist"), "{err}");
    }

    #[test]
    fn test_stats_of_single_value() {
        let stats = ColumnStats::of("open", &[5.0]);
        assert_eq!(stats.count, 1);
        assert_eq!(stats.mean, 5.0);
        assert!(stats.std.is_nan());

        let stats = ColumnStats::of("open", &[]);
        assert_eq!(stats.count, 0);
        assert!(stats.mean.is_nan());
    }
}
