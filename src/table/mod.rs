//! Arrow table helpers shared by the datasets
//!
//! Every dataset is a single `RecordBatch`. [`normalize`] enforces the canonical
//! column types after any construction path (fresh build, Parquet load,
//! re-filtering), so tables built different ways compare equal.

mod scalar;

pub use scalar::Scalar;

use crate::constants::canonical_type;
use crate::{Error, Result};
use arrow::array::{
    Array, ArrayRef, BooleanArray, Float64Array, Int16Array, Int64Array, RecordBatch,
    RecordBatchOptions, StringArray, UInt32Array,
};
use arrow::compute::{self, CastOptions};
use arrow::datatypes::{DataType, Field, Schema, SchemaRef};
use std::sync::Arc;

fn strict() -> CastOptions<'static> {
    CastOptions {
        safe: false,
        ..Default::default()
    }
}

/// Cast columns to their canonical types and strip schema metadata
///
/// Categorical columns are re-encoded from their string values, so their
/// dictionaries only hold the values present, in first-appearance order.
///
/// # Errors
/// Returns error if a column cannot be losslessly cast to its canonical type
pub fn normalize(batch: &RecordBatch) -> Result<RecordBatch> {
    let schema = batch.schema();
    let mut fields = Vec::with_capacity(batch.num_columns());
    let mut columns = Vec::with_capacity(batch.num_columns());
    for (field, column) in schema.fields().iter().zip(batch.columns()) {
        let column = match canonical_type(field.name()) {
            Some(dtype @ DataType::Dictionary(..)) => {
                let strings = compute::cast_with_options(column, &DataType::Utf8, &strict())?;
                compute::cast_with_options(&strings, &dtype, &strict())?
            }
            Some(dtype) if column.data_type() != &dtype => {
                compute::cast_with_options(column, &dtype, &strict())?
            }
            _ => Arc::clone(column),
        };
        fields.push(Field::new(field.name(), column.data_type().clone(), true));
        columns.push(column);
    }
    with_rows(Arc::new(Schema::new(fields)), columns, batch.num_rows())
}

fn with_rows(schema: SchemaRef, columns: Vec<ArrayRef>, num_rows: usize) -> Result<RecordBatch> {
    let options = RecordBatchOptions::new().with_row_count(Some(num_rows));
    Ok(RecordBatch::try_new_with_options(schema, columns, &options)?)
}

/// Names of the columns, in schema order
#[must_use]
pub fn column_names(batch: &RecordBatch) -> Vec<String> {
    batch
        .schema()
        .fields()
        .iter()
        .map(|f| f.name().clone())
        .collect()
}

/// Column by name
///
/// # Errors
/// Returns a schema error if the column is missing
pub fn column<'a>(batch: &'a RecordBatch, name: &str) -> Result<&'a ArrayRef> {
    batch
        .column_by_name(name)
        .ok_or_else(|| Error::schema("table", format!("missing column {name:?}")))
}

fn non_null<T>(name: &str, values: Vec<Option<T>>) -> Result<Vec<T>> {
    values
        .into_iter()
        .collect::<Option<Vec<_>>>()
        .ok_or_else(|| Error::DataIntegrity(format!("null values in column {name:?}")))
}

macro_rules! typed_values {
    ($opt_fn:ident, $fn:ident, $ty:ty, $array:ty, $dtype:expr) => {
        /// Nullable values of a column, cast to the given type
        ///
        /// # Errors
        /// Returns error if the column is missing or cannot be cast
        pub fn $opt_fn(batch: &RecordBatch, name: &str) -> Result<Vec<Option<$ty>>> {
            let cast = compute::cast_with_options(column(batch, name)?, &$dtype, &strict())?;
            let array = cast
                .as_any()
                .downcast_ref::<$array>()
                .ok_or_else(|| Error::StorageError(format!("Failed to downcast column {name:?}")))?;
            Ok(array.iter().map(|v| v.map(Into::into)).collect())
        }

        /// Values of a column without nulls, cast to the given type
        ///
        /// # Errors
        /// Returns error if the column is missing, cannot be cast, or has nulls
        pub fn $fn(batch: &RecordBatch, name: &str) -> Result<Vec<$ty>> {
            non_null(name, $opt_fn(batch, name)?)
        }
    };
}

typed_values!(opt_i16_values, i16_values, i16, Int16Array, DataType::Int16);
typed_values!(opt_i64_values, i64_values, i64, Int64Array, DataType::Int64);
typed_values!(opt_f64_values, f64_values, f64, Float64Array, DataType::Float64);
typed_values!(opt_str_values, str_values, String, StringArray, DataType::Utf8);

/// Values of any column as [`Scalar`]s
///
/// # Errors
/// Returns error if the column is missing or has an unsupported type
pub fn scalar_values(batch: &RecordBatch, name: &str) -> Result<Vec<Scalar>> {
    let col = column(batch, name)?;
    let wrap = |v: Option<Scalar>| v.unwrap_or(Scalar::Null);
    let values = match col.data_type() {
        DataType::Boolean => {
            let array = col
                .as_any()
                .downcast_ref::<BooleanArray>()
                .ok_or_else(|| Error::StorageError(format!("Failed to downcast column {name:?}")))?;
            array.iter().map(|v| wrap(v.map(Scalar::Bool))).collect()
        }
        dtype if dtype.is_integer() => opt_i64_values(batch, name)?
            .into_iter()
            .map(|v| wrap(v.map(Scalar::Int)))
            .collect(),
        dtype if dtype.is_floating() => opt_f64_values(batch, name)?
            .into_iter()
            .map(|v| wrap(v.map(Scalar::Float)))
            .collect(),
        _ => opt_str_values(batch, name)?
            .into_iter()
            .map(|v| wrap(v.map(Scalar::Str)))
            .collect(),
    };
    Ok(values)
}

/// Build an Arrow column from scalars, inferring the narrowest common type
///
/// Integers mixed with floats become Float64; all-null columns become Utf8.
///
/// # Errors
/// Returns a configuration error when values of incompatible kinds are mixed
pub fn scalar_column(name: &str, values: &[Scalar]) -> Result<ArrayRef> {
    let mut kind: Option<DataType> = None;
    for value in values {
        let this = match value {
            Scalar::Null => continue,
            Scalar::Bool(_) => DataType::Boolean,
            Scalar::Int(_) => DataType::Int64,
            Scalar::Float(_) => DataType::Float64,
            Scalar::Str(_) => DataType::Utf8,
        };
        kind = Some(match (kind, this) {
            (None, t) => t,
            (Some(a), b) if a == b => a,
            (Some(DataType::Int64 | DataType::Float64), DataType::Int64 | DataType::Float64) => {
                DataType::Float64
            }
            (Some(a), b) => {
                return Err(Error::Configuration(format!(
                    "column {name:?} mixes {a} and {b} values"
                )))
            }
        });
    }
    let array: ArrayRef = match kind.unwrap_or(DataType::Utf8) {
        DataType::Boolean => Arc::new(BooleanArray::from(
            values
                .iter()
                .map(|v| match v {
                    Scalar::Bool(b) => Some(*b),
                    _ => None,
                })
                .collect::<Vec<_>>(),
        )),
        DataType::Int64 => Arc::new(Int64Array::from(
            values
                .iter()
                .map(|v| match v {
                    Scalar::Int(i) => Some(*i),
                    _ => None,
                })
                .collect::<Vec<_>>(),
        )),
        DataType::Float64 => Arc::new(Float64Array::from(
            values.iter().map(Scalar::as_f64).collect::<Vec<_>>(),
        )),
        _ => Arc::new(StringArray::from(
            values
                .iter()
                .map(|v| v.as_str().map(str::to_string))
                .collect::<Vec<_>>(),
        )),
    };
    Ok(array)
}

/// Keep the rows where `mask` is true
///
/// # Errors
/// Returns error if the mask length doesn't match the table
pub fn filter_rows(batch: &RecordBatch, mask: Vec<bool>) -> Result<RecordBatch> {
    if mask.len() != batch.num_rows() {
        return Err(Error::StorageError(format!(
            "Filter mask has {} entries for {} rows",
            mask.len(),
            batch.num_rows()
        )));
    }
    let mask = BooleanArray::from(mask);
    Ok(compute::filter_record_batch(batch, &mask)?)
}

/// Select rows by position
///
/// # Errors
/// Returns error if an index is out of bounds
pub fn take_rows(batch: &RecordBatch, indices: &[u32]) -> Result<RecordBatch> {
    let indices = UInt32Array::from(indices.to_vec());
    let columns = batch
        .columns()
        .iter()
        .map(|c| compute::take(c.as_ref(), &indices, None))
        .collect::<std::result::Result<Vec<_>, _>>()?;
    with_rows(batch.schema(), columns, indices.len())
}

/// Drop the named columns, ignoring names that are not present
///
/// # Errors
/// Returns error if the projection fails
pub fn drop_columns(batch: &RecordBatch, names: &[&str]) -> Result<RecordBatch> {
    let indices: Vec<usize> = batch
        .schema()
        .fields()
        .iter()
        .enumerate()
        .filter(|(_, f)| !names.contains(&f.name().as_str()))
        .map(|(i, _)| i)
        .collect();
    Ok(batch.project(&indices)?)
}

/// Concatenate tables sharing the same schema
///
/// # Errors
/// Returns error if the list is empty or the schemas differ
pub fn concat(batches: &[RecordBatch]) -> Result<RecordBatch> {
    let first = batches
        .first()
        .ok_or_else(|| Error::StorageError("No tables to concatenate".to_string()))?;
    if let Some(other) = batches.iter().find(|b| b.schema() != first.schema()) {
        return Err(Error::StorageError(format!(
            "Schema mismatch: expected {:?}, got {:?}",
            column_names(first),
            column_names(other)
        )));
    }
    Ok(compute::concat_batches(&first.schema(), batches)?)
}

/// Incremental builder for normalized tables
#[derive(Debug, Default)]
pub struct TableBuilder {
    fields: Vec<Field>,
    columns: Vec<ArrayRef>,
}

impl TableBuilder {
    /// Create an empty builder
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Append an arbitrary column
    #[must_use]
    pub fn column(mut self, name: &str, array: ArrayRef) -> Self {
        self.fields
            .push(Field::new(name, array.data_type().clone(), true));
        self.columns.push(array);
        self
    }

    /// Append an Int16 column
    #[must_use]
    pub fn int16(self, name: &str, values: Vec<i16>) -> Self {
        self.column(name, Arc::new(Int16Array::from(values)))
    }

    /// Append an Int64 column
    #[must_use]
    pub fn int64(self, name: &str, values: Vec<i64>) -> Self {
        self.column(name, Arc::new(Int64Array::from(values)))
    }

    /// Append a nullable Int64 column
    #[must_use]
    pub fn opt_int64(self, name: &str, values: Vec<Option<i64>>) -> Self {
        self.column(name, Arc::new(Int64Array::from(values)))
    }

    /// Append a Float64 column
    #[must_use]
    pub fn float64(self, name: &str, values: Vec<f64>) -> Self {
        self.column(name, Arc::new(Float64Array::from(values)))
    }

    /// Append a nullable Float64 column
    #[must_use]
    pub fn opt_float64(self, name: &str, values: Vec<Option<f64>>) -> Self {
        self.column(name, Arc::new(Float64Array::from(values)))
    }

    /// Append a Utf8 column (categorical names are re-encoded on build)
    #[must_use]
    pub fn utf8(self, name: &str, values: Vec<String>) -> Self {
        self.column(name, Arc::new(StringArray::from(values)))
    }

    /// Append a nullable Utf8 column
    #[must_use]
    pub fn opt_utf8(self, name: &str, values: Vec<Option<String>>) -> Self {
        self.column(name, Arc::new(StringArray::from(values)))
    }

    /// Append a column inferred from scalars
    ///
    /// # Errors
    /// Returns error if the scalars mix incompatible kinds
    pub fn scalars(self, name: &str, values: &[Scalar]) -> Result<Self> {
        let array = scalar_column(name, values)?;
        Ok(self.column(name, array))
    }

    /// Build and normalize the table
    ///
    /// # Errors
    /// Returns error if the columns have different lengths or cannot be normalized
    pub fn build(self) -> Result<RecordBatch> {
        let num_rows = self.columns.first().map_or(0, |c| c.len());
        let batch = with_rows(Arc::new(Schema::new(self.fields)), self.columns, num_rows)?;
        normalize(&batch)
    }
}
