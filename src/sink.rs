//! Destinations for completed windows.
//!
//! [ParquetSink] keeps one Snappy compressed Parquet file with the columns
//! `timestamp, open, high, low, close, volume`. Each window becomes one row group
//! after the rows already in the file.

use std::fs::{self, File};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use arrow::array::{ArrayRef, Float64Array, TimestampMicrosecondArray};
use arrow::datatypes::{DataType, Field, Schema, SchemaRef, TimeUnit};
use arrow::record_batch::RecordBatch;
use log::{debug, error, info, warn};
use parquet::arrow::arrow_reader::ParquetRecordBatchReaderBuilder;
use parquet::arrow::ArrowWriter;
use parquet::basic::Compression;
use parquet::file::properties::WriterProperties;

use crate::market_data::historical::Bar;
use crate::Error;

pub const TIMESTAMP_COLUMN: &str = "timestamp";
pub const PRICE_COLUMNS: [&str; 5] = ["open", "high", "low", "close", "volume"];

/// Receives the bars of each completed window.
pub trait BarSink {
    /// Persists `bars` after everything written before and returns how many rows were written.
    /// Empty input writes nothing.
    fn write_window(&mut self, bars: &[Bar]) -> Result<usize, Error>;

    /// Completes the output. Called once at the end of a run.
    fn finish(&mut self) -> Result<(), Error> {
        Ok(())
    }
}

impl BarSink for Vec<Bar> {
    fn write_window(&mut self, bars: &[Bar]) -> Result<usize, Error> {
        self.extend_from_slice(bars);
        Ok(bars.len())
    }
}

/// Schema of persisted bar files. The timestamp is null for bars whose date could not be parsed.
pub fn bar_schema() -> Schema {
    let mut fields = vec![Field::new(
        TIMESTAMP_COLUMN,
        DataType::Timestamp(TimeUnit::Microsecond, Some("UTC".into())),
        true,
    )];
    fields.extend(PRICE_COLUMNS.iter().map(|name| Field::new(*name, DataType::Float64, false)));

    Schema::new(fields)
}

/// Appends windows to a Parquet file.
///
/// A Parquet footer is written once, so the sink writes a temporary file next to the
/// destination for the whole run. The first window copies the destination's row groups
/// into it; every window is then added as a row group of its own. [BarSink::finish]
/// (or dropping the sink) closes the file and moves it over the destination, which is
/// left untouched until then.
pub struct ParquetSink {
    path: PathBuf,
    schema: SchemaRef,
    writer: Option<ArrowWriter<File>>,
    rows_written: usize,
}

impl ParquetSink {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        ParquetSink {
            path: path.into(),
            schema: Arc::new(bar_schema()),
            writer: None,
            rows_written: 0,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn to_batch(&self, bars: &[Bar]) -> Result<RecordBatch, Error> {
        let timestamps: Vec<Option<i64>> = bars
            .iter()
            .map(|bar| match bar.timestamp() {
                Some(timestamp) => Some((timestamp.unix_timestamp_nanos() / 1_000) as i64),
                None => {
                    warn!("could not convert bar date {:?} to a timestamp, writing null", bar.date);
                    None
                }
            })
            .collect();

        let column = |value: fn(&Bar) -> f64| -> ArrayRef { Arc::new(Float64Array::from(bars.iter().map(value).collect::<Vec<f64>>())) };

        let batch = RecordBatch::try_new(
            self.schema.clone(),
            vec![
                Arc::new(TimestampMicrosecondArray::from(timestamps).with_timezone("UTC")) as ArrayRef,
                column(|bar| bar.open),
                column(|bar| bar.high),
                column(|bar| bar.low),
                column(|bar| bar.close),
                column(|bar| bar.volume),
            ],
        )?;

        Ok(batch)
    }

    fn temporary_path(&self) -> PathBuf {
        let mut name = self.path.file_name().map(|n| n.to_os_string()).unwrap_or_default();
        name.push(".tmp");
        self.path.with_file_name(name)
    }

    fn open_writer(&self) -> Result<ArrowWriter<File>, Error> {
        let properties = WriterProperties::builder().set_compression(Compression::SNAPPY).build();
        let temporary = self.temporary_path();

        let mut writer = ArrowWriter::try_new(File::create(&temporary)?, self.schema.clone(), Some(properties))?;
        if let Err(e) = self.copy_existing(&mut writer) {
            drop(writer);
            if let Err(remove_err) = fs::remove_file(&temporary) {
                debug!("could not remove {}: {remove_err}", temporary.display());
            }
            return Err(e);
        }

        Ok(writer)
    }

    // Copies the destination's rows, one row group at a time, re-tagged with the sink's schema.
    fn copy_existing(&self, writer: &mut ArrowWriter<File>) -> Result<(), Error> {
        if !self.path.exists() {
            return Ok(());
        }

        let file = File::open(&self.path)?;
        let builder = ParquetRecordBatchReaderBuilder::try_new(file.try_clone()?)?;

        let existing = builder.schema().clone();
        let compatible = existing.fields().len() == self.schema.fields().len()
            && existing
                .fields()
                .iter()
                .zip(self.schema.fields())
                .all(|(a, b)| a.name() == b.name() && a.data_type() == b.data_type());
        if !compatible {
            return Err(Error::Simple(format!(
                "{} has schema {existing:?}, expected {:?}",
                self.path.display(),
                self.schema
            )));
        }

        let row_groups = builder.metadata().num_row_groups();
        let mut rows = 0;
        for row_group in 0..row_groups {
            let reader = ParquetRecordBatchReaderBuilder::try_new(file.try_clone()?)?
                .with_row_groups(vec![row_group])
                .build()?;
            for batch in reader {
                let batch = batch?;
                rows += batch.num_rows();
                writer.write(&RecordBatch::try_new(self.schema.clone(), batch.columns().to_vec())?)?;
            }
            writer.flush()?;
        }

        debug!("copied {rows} rows in {row_groups} row groups from {}", self.path.display());

        Ok(())
    }
}

impl BarSink for ParquetSink {
    fn write_window(&mut self, bars: &[Bar]) -> Result<usize, Error> {
        if bars.is_empty() {
            debug!("no bars to write to {}", self.path.display());
            return Ok(0);
        }

        let batch = self.to_batch(bars)?;

        if self.writer.is_none() {
            self.writer = Some(self.open_writer()?);
        }
        if let Some(writer) = self.writer.as_mut() {
            writer.write(&batch)?;
            writer.flush()?;
        }
        self.rows_written += bars.len();

        debug!("added {} rows for {} ({} this run)", bars.len(), self.path.display(), self.rows_written);

        Ok(bars.len())
    }

    fn finish(&mut self) -> Result<(), Error> {
        let Some(writer) = self.writer.take() else {
            return Ok(());
        };

        writer.close()?;
        fs::rename(self.temporary_path(), &self.path)?;

        info!("wrote {} new rows to {}", self.rows_written, self.path.display());
        self.rows_written = 0;

        Ok(())
    }
}

impl Drop for ParquetSink {
    fn drop(&mut self) {
        if let Err(e) = self.finish() {
            error!("could not finish {}: {e}", self.path.display());
        }
    }
}

impl std::fmt::Debug for ParquetSink {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ParquetSink")
            .field("path", &self.path)
            .field("open", &self.writer.is_some())
            .field("rows_written", &self.rows_written)
            .finish()
    }
}
