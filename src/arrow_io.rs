//! Arrow upload handling.
//!
//! Callers may hand us either Arrow format: the random-access *file* layout
//! (magic `ARROW1`) or the forward-only *stream* layout. We probe the first
//! six bytes and dispatch, hiding the choice behind one "give me the schema
//! and batches" call.

use anyhow::{bail, Context, Result};
use arrow::array::{
    Array, BooleanArray, Float32Array, Float64Array, Int16Array, Int32Array, Int64Array,
    Int8Array, LargeStringArray, RecordBatch, StringArray, UInt64Array,
};
use arrow::datatypes::{DataType, SchemaRef};
use arrow::ipc::reader::{FileReader, StreamReader};
use arrow::util::display::array_value_to_string;
use bigdecimal::BigDecimal;
use std::io::Cursor;

const ARROW_FILE_MAGIC: &[u8; 6] = b"ARROW1";

/// True when the blob is the Arrow random-access file format.
pub fn is_arrow_file(data: &[u8]) -> bool {
    data.len() >= ARROW_FILE_MAGIC.len() && &data[..ARROW_FILE_MAGIC.len()] == ARROW_FILE_MAGIC
}

/// Decode an Arrow blob in either format into its schema and batches.
pub fn read_batches(data: &[u8]) -> Result<(SchemaRef, Vec<RecordBatch>)> {
    if is_arrow_file(data) {
        let reader = FileReader::try_new(Cursor::new(data), None)
            .context("failed to open Arrow file reader")?;
        let schema = reader.schema();
        let batches = reader
            .collect::<std::result::Result<Vec<_>, _>>()
            .context("failed to read Arrow file batches")?;
        Ok((schema, batches))
    } else {
        let reader = StreamReader::try_new(Cursor::new(data), None)
            .context("failed to open Arrow stream reader")?;
        let schema = reader.schema();
        let batches = reader
            .collect::<std::result::Result<Vec<_>, _>>()
            .context("failed to read Arrow stream batches")?;
        Ok((schema, batches))
    }
}

/// Postgres column type for an Arrow field. Anything we do not have a
/// tighter mapping for lands as text and gets a chance at promotion from
/// the type inferencer later.
pub fn pg_type_for(data_type: &DataType) -> &'static str {
    match data_type {
        DataType::Utf8 | DataType::LargeUtf8 => "text",
        DataType::Int8 | DataType::Int16 => "smallint",
        DataType::Int32 => "integer",
        DataType::Int64 => "bigint",
        DataType::UInt64 => "numeric",
        DataType::Float32 => "real",
        DataType::Float64 => "double precision",
        DataType::Boolean => "boolean",
        _ => "text",
    }
}

/// One staging cell, typed to match the column DDL from [`pg_type_for`].
#[derive(Debug, Clone, PartialEq)]
pub enum Cell {
    Null,
    Text(String),
    SmallInt(i16),
    Int(i32),
    BigInt(i64),
    Numeric(BigDecimal),
    Real(f32),
    Double(f64),
    Bool(bool),
}

/// Extract row `row` of `array` as a [`Cell`].
pub fn cell_at(array: &dyn Array, row: usize) -> Result<Cell> {
    if array.is_null(row) {
        return Ok(Cell::Null);
    }
    let cell = match array.data_type() {
        DataType::Utf8 => {
            let a = downcast::<StringArray>(array)?;
            Cell::Text(a.value(row).to_string())
        }
        DataType::LargeUtf8 => {
            let a = downcast::<LargeStringArray>(array)?;
            Cell::Text(a.value(row).to_string())
        }
        DataType::Int8 => {
            let a = downcast::<Int8Array>(array)?;
            Cell::SmallInt(a.value(row) as i16)
        }
        DataType::Int16 => {
            let a = downcast::<Int16Array>(array)?;
            Cell::SmallInt(a.value(row))
        }
        DataType::Int32 => {
            let a = downcast::<Int32Array>(array)?;
            Cell::Int(a.value(row))
        }
        DataType::Int64 => {
            let a = downcast::<Int64Array>(array)?;
            Cell::BigInt(a.value(row))
        }
        DataType::UInt64 => {
            let a = downcast::<UInt64Array>(array)?;
            Cell::Numeric(BigDecimal::from(a.value(row)))
        }
        DataType::Float32 => {
            let a = downcast::<Float32Array>(array)?;
            Cell::Real(a.value(row))
        }
        DataType::Float64 => {
            let a = downcast::<Float64Array>(array)?;
            Cell::Double(a.value(row))
        }
        DataType::Boolean => {
            let a = downcast::<BooleanArray>(array)?;
            Cell::Bool(a.value(row))
        }
        _ => Cell::Text(
            array_value_to_string(array, row).context("failed to render Arrow value as text")?,
        ),
    };
    Ok(cell)
}

fn downcast<T: 'static>(array: &dyn Array) -> Result<&T> {
    match array.as_any().downcast_ref::<T>() {
        Some(a) => Ok(a),
        None => bail!("Arrow array type did not match its declared data type"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use arrow::array::{Int64Array, StringArray};
    use arrow::datatypes::{Field, Schema};
    use arrow::ipc::writer::{FileWriter, StreamWriter};
    use std::sync::Arc;

    fn sample_batch() -> RecordBatch {
        let schema = Arc::new(Schema::new(vec![
            Field::new("order_num", DataType::Utf8, true),
            Field::new("qty", DataType::Int64, true),
        ]));
        RecordBatch::try_new(
            schema,
            vec![
                Arc::new(StringArray::from(vec![Some("A"), Some("B"), None])),
                Arc::new(Int64Array::from(vec![Some(1), None, Some(3)])),
            ],
        )
        .unwrap()
    }

    fn encode_file(batch: &RecordBatch) -> Vec<u8> {
        let mut out = Vec::new();
        {
            let mut w = FileWriter::try_new(&mut out, &batch.schema()).unwrap();
            w.write(batch).unwrap();
            w.finish().unwrap();
        }
        out
    }

    fn encode_stream(batch: &RecordBatch) -> Vec<u8> {
        let mut out = Vec::new();
        {
            let mut w = StreamWriter::try_new(&mut out, &batch.schema()).unwrap();
            w.write(batch).unwrap();
            w.finish().unwrap();
        }
        out
    }

    #[test]
    fn probes_file_magic() {
        let batch = sample_batch();
        assert!(is_arrow_file(&encode_file(&batch)));
        assert!(!is_arrow_file(&encode_stream(&batch)));
        assert!(!is_arrow_file(b"ARROW"));
    }

    #[test]
    fn both_formats_decode_to_the_same_rows() {
        let batch = sample_batch();
        let (file_schema, file_batches) = read_batches(&encode_file(&batch)).unwrap();
        let (stream_schema, stream_batches) = read_batches(&encode_stream(&batch)).unwrap();
        assert_eq!(file_schema, stream_schema);
        assert_eq!(file_batches, stream_batches);
        assert_eq!(file_batches[0].num_rows(), 3);
    }

    #[test]
    fn type_mapping_follows_the_table() {
        assert_eq!(pg_type_for(&DataType::Utf8), "text");
        assert_eq!(pg_type_for(&DataType::Int8), "smallint");
        assert_eq!(pg_type_for(&DataType::Int32), "integer");
        assert_eq!(pg_type_for(&DataType::Int64), "bigint");
        assert_eq!(pg_type_for(&DataType::UInt64), "numeric");
        assert_eq!(pg_type_for(&DataType::Float32), "real");
        assert_eq!(pg_type_for(&DataType::Float64), "double precision");
        assert_eq!(pg_type_for(&DataType::Boolean), "boolean");
        assert_eq!(pg_type_for(&DataType::Date32), "text");
    }

    #[test]
    fn cells_carry_nulls_and_values() {
        let batch = sample_batch();
        assert_eq!(
            cell_at(batch.column(0).as_ref(), 0).unwrap(),
            Cell::Text("A".into())
        );
        assert_eq!(cell_at(batch.column(0).as_ref(), 2).unwrap(), Cell::Null);
        assert_eq!(cell_at(batch.column(1).as_ref(), 2).unwrap(), Cell::BigInt(3));
    }
}
