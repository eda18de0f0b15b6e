//! Plain-text tensor archives.
//!
//! An archive is a sequence of named sections:
//!
//! ```text
//! ===WEIGHTS BEGIN===
//! # NUM_ELEMS 3
//! # TYPE float
//! 0.50000000,1.00000000,-2.00000000,
//! ===WEIGHTS END===
//! ```
//!
//! The `GLOBAL` section carries key/value metadata instead of values.

use std::fs;
use std::io::Write;
use std::path::Path;

use ndarray::{ArrayD, IxDyn};

use crate::error::{Error, Result};
use crate::model::DataType;
use crate::ops::tensor::{Tensor, TensorData};

pub const GLOBAL_SECTION: &str = "GLOBAL";
pub const WEIGHTS_SECTION: &str = "WEIGHTS";
pub const DATA_SECTION: &str = "DATA";
pub const LABELS_SECTION: &str = "LABELS";

/// Metadata of the `GLOBAL` section
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GlobalHeader {
    pub architecture: String,
    pub num_layers: usize,
    pub data_alignment: usize,
}

fn begin_marker(section: &str) -> String {
    format!("==={} BEGIN===", section)
}

fn end_marker(section: &str) -> String {
    format!("==={} END===", section)
}

/// Write one section of values
pub fn write_section<W: Write>(writer: &mut W, section: &str, values: &TensorData) -> Result<()> {
    writeln!(writer, "{}", begin_marker(section))?;
    writeln!(writer, "# NUM_ELEMS {}", values.len())?;
    writeln!(writer, "# TYPE {}", values.data_type())?;
    match values {
        TensorData::Float32(a) => {
            for v in a.iter() {
                write!(writer, "{:.8},", v)?;
            }
        }
        TensorData::Int32(a) => {
            for v in a.iter() {
                write!(writer, "{},", v)?;
            }
        }
    }
    writeln!(writer)?;
    writeln!(writer, "{}", end_marker(section))?;
    Ok(())
}

/// Write the `GLOBAL` section
pub fn write_global<W: Write>(writer: &mut W, header: &GlobalHeader) -> Result<()> {
    writeln!(writer, "{}", begin_marker(GLOBAL_SECTION))?;
    writeln!(writer, "# ARCHITECTURE = {}", header.architecture)?;
    writeln!(writer, "# NUM_LAYERS = {}", header.num_layers)?;
    writeln!(writer, "# DATA_ALIGNMENT = {}", header.data_alignment)?;
    writeln!(writer, "{}", end_marker(GLOBAL_SECTION))?;
    Ok(())
}

/// Write the full storage of a tensor (alignment padding included)
pub fn write_tensor<W: Write>(writer: &mut W, section: &str, tensor: &Tensor) -> Result<()> {
    write_section(writer, section, &tensor.storage_values()?)
}

/// An archive held in memory for section lookups
#[derive(Debug, Clone, Default)]
pub struct TensorArchive {
    text: String,
}

impl TensorArchive {
    pub fn parse_str(text: &str) -> Self {
        Self { text: text.to_string() }
    }

    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let text = fs::read_to_string(path)
            .map_err(|e| Error::LoadError(path.to_path_buf(), e.to_string()))?;
        Ok(Self { text })
    }

    /// Lines following the header of `section`
    fn section_body(&self, section: &str) -> Result<std::str::Lines<'_>> {
        let marker = begin_marker(section);
        let mut lines = self.text.lines();
        loop {
            match lines.next() {
                Some(line) if line.starts_with(&marker) => return Ok(lines),
                Some(_) => continue,
                None => {
                    return Err(Error::ArchiveError(format!(
                        "Section '{}' not found in archive",
                        section
                    )))
                }
            }
        }
    }

    /// Read the values of a section
    pub fn read_section(&self, section: &str) -> Result<TensorData> {
        let mut lines = self.section_body(section)?.peekable();
        let end = end_marker(section);
        let corrupt = |what: &str| Error::ArchiveError(format!("Section '{}': {}", section, what));

        let count_line = lines.next().ok_or_else(|| corrupt("missing element count"))?;
        let count: i64 = count_line
            .strip_prefix("# NUM_ELEMS ")
            .and_then(|v| v.trim().parse().ok())
            .ok_or_else(|| corrupt("corrupt element count"))?;
        if count < 0 {
            return Err(corrupt("negative element count"));
        }
        let count = count as usize;

        let type_line = lines.next().ok_or_else(|| corrupt("missing data type"))?;
        let data_type: DataType = type_line
            .strip_prefix("# TYPE ")
            .and_then(|v| v.trim().parse().ok())
            .ok_or_else(|| corrupt("corrupt data type"))?;

        // An empty section may omit its values line
        let values_line = lines.next_if(|line| !line.starts_with(&end)).unwrap_or("");
        let fields = split_values(values_line)?;
        if fields.len() < count {
            return Err(corrupt(&format!("expected {} values, found {}", count, fields.len())));
        }
        let fields = &fields[..count];

        match lines.next() {
            Some(line) if line.starts_with(&end) => {}
            _ => return Err(corrupt("missing end marker")),
        }

        let dims = IxDyn(&[count]);
        let data = match data_type {
            DataType::Float32 => {
                let values = fields
                    .iter()
                    .map(|f| f.parse::<f32>())
                    .collect::<std::result::Result<Vec<_>, _>>()
                    .map_err(|e| corrupt(&format!("invalid float value: {}", e)))?;
                TensorData::Float32(ArrayD::from_shape_vec(dims, values)?)
            }
            DataType::Int32 => {
                let values = fields
                    .iter()
                    .map(|f| f.parse::<i32>())
                    .collect::<std::result::Result<Vec<_>, _>>()
                    .map_err(|e| corrupt(&format!("invalid int value: {}", e)))?;
                TensorData::Int32(ArrayD::from_shape_vec(dims, values)?)
            }
        };
        Ok(data)
    }

    /// Read the `GLOBAL` section
    pub fn read_global(&self) -> Result<GlobalHeader> {
        let mut lines = self.section_body(GLOBAL_SECTION)?;
        let mut field = |key: &str| -> Result<String> {
            let prefix = format!("# {} = ", key);
            lines
                .next()
                .and_then(|line| line.strip_prefix(prefix.as_str()))
                .map(|v| v.trim().to_string())
                .ok_or_else(|| Error::ArchiveError(format!("GLOBAL section: missing {}", key)))
        };

        let architecture = field("ARCHITECTURE")?;
        let num_layers = field("NUM_LAYERS")?
            .parse()
            .map_err(|_| Error::ArchiveError("GLOBAL section: corrupt NUM_LAYERS".to_string()))?;
        let data_alignment = field("DATA_ALIGNMENT")?
            .parse()
            .map_err(|_| Error::ArchiveError("GLOBAL section: corrupt DATA_ALIGNMENT".to_string()))?;

        Ok(GlobalHeader {
            architecture,
            num_layers,
            data_alignment,
        })
    }

    /// Fill a tensor's storage from a section. The section must match the
    /// tensor's element type and may not hold more values than its storage.
    pub fn load_tensor(&self, section: &str, tensor: &Tensor) -> Result<()> {
        let values = self.read_section(section)?;
        if values.data_type() != tensor.data_type() {
            return Err(Error::ArchiveError(format!(
                "Section '{}' holds {} values but tensor '{}' is {}",
                section,
                values.data_type(),
                tensor.name(),
                tensor.data_type()
            )));
        }
        if values.len() > tensor.shape().storage_size() {
            return Err(Error::ArchiveError(format!(
                "Section '{}' holds {} values, more than tensor '{}' can store ({})",
                section,
                values.len(),
                tensor.name(),
                tensor.shape().storage_size()
            )));
        }
        tensor.fill_storage(&values)
    }
}

/// Split a comma-separated values line; the trailing comma is optional
fn split_values(line: &str) -> Result<Vec<String>> {
    let mut reader = csv::ReaderBuilder::new()
        .has_headers(false)
        .trim(csv::Trim::All)
        .from_reader(line.as_bytes());

    let mut record = csv::StringRecord::new();
    if !reader.read_record(&mut record)? {
        return Ok(Vec::new());
    }
    Ok(record
        .iter()
        .filter(|f| !f.is_empty())
        .map(|f| f.to_string())
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::layout::tensor_layout::TensorShape;
    use crate::model::DataLayout;

    fn floats(values: &[f32]) -> TensorData {
        TensorData::Float32(ArrayD::from_shape_vec(IxDyn(&[values.len()]), values.to_vec()).unwrap())
    }

    #[test]
    fn test_write_and_read_sections() {
        let mut buffer = Vec::new();
        write_global(
            &mut buffer,
            &GlobalHeader {
                architecture: "smv".to_string(),
                num_layers: 4,
                data_alignment: 8,
            },
        )
        .unwrap();
        write_section(&mut buffer, WEIGHTS_SECTION, &floats(&[0.5, -1.25, 3.0])).unwrap();
        let labels = TensorData::Int32(ArrayD::from_shape_vec(IxDyn(&[2]), vec![7, -2]).unwrap());
        write_section(&mut buffer, LABELS_SECTION, &labels).unwrap();

        let text = String::from_utf8(buffer).unwrap();
        assert!(text.contains("0.50000000,-1.25000000,3.00000000,"));
        assert!(text.contains("# TYPE int"));

        let archive = TensorArchive::parse_str(&text);
        assert_eq!(archive.read_global().unwrap().data_alignment, 8);
        assert_eq!(archive.read_section(WEIGHTS_SECTION).unwrap(), floats(&[0.5, -1.25, 3.0]));
        assert_eq!(archive.read_section(LABELS_SECTION).unwrap(), labels);
    }

    #[test]
    fn test_missing_section() {
        let archive = TensorArchive::parse_str("===DATA BEGIN===\n# NUM_ELEMS 0\n# TYPE float\n\n===DATA END===\n");
        assert_eq!(archive.read_section(DATA_SECTION).unwrap().len(), 0);
        assert!(matches!(archive.read_section(WEIGHTS_SECTION), Err(Error::ArchiveError(_))));
        assert!(archive.read_global().is_err());
    }

    #[test]
    fn test_empty_section_without_values_line() {
        let archive = TensorArchive::parse_str("===DATA BEGIN===\n# NUM_ELEMS 0\n# TYPE int\n===DATA END===\n");
        assert_eq!(archive.read_section(DATA_SECTION).unwrap().len(), 0);

        let missing = TensorArchive::parse_str("===DATA BEGIN===\n# NUM_ELEMS 2\n# TYPE int\n===DATA END===\n");
        let err = missing.read_section(DATA_SECTION).unwrap_err();
        assert!(err.to_string().contains("expected 2 values, found 0"), "{}", err);
    }

    #[test]
    fn test_corrupt_metadata() {
        let bad_count = TensorArchive::parse_str("===DATA BEGIN===\n# NUM_ELEMS x\n# TYPE float\n1.0,\n===DATA END===\n");
        assert!(bad_count.read_section(DATA_SECTION).is_err());

        let negative = TensorArchive::parse_str("===DATA BEGIN===\n# NUM_ELEMS -1\n# TYPE float\n\n===DATA END===\n");
        assert!(negative.read_section(DATA_SECTION).is_err());

        let bad_type = TensorArchive::parse_str("===DATA BEGIN===\n# NUM_ELEMS 1\n# TYPE double\n1.0,\n===DATA END===\n");
        assert!(bad_type.read_section(DATA_SECTION).is_err());

        let short = TensorArchive::parse_str("===DATA BEGIN===\n# NUM_ELEMS 3\n# TYPE float\n1.0,2.0,\n===DATA END===\n");
        assert!(short.read_section(DATA_SECTION).is_err());

        let no_end = TensorArchive::parse_str("===DATA BEGIN===\n# NUM_ELEMS 1\n# TYPE float\n1.0,\n");
        assert!(no_end.read_section(DATA_SECTION).is_err());
    }

    #[test]
    fn test_load_tensor() {
        let tensor = Tensor::new("t", TensorShape::new(&[1, 3], DataLayout::NC, 4));
        let archive = TensorArchive::parse_str(
            "===WEIGHTS BEGIN===\n# NUM_ELEMS 4\n# TYPE float\n1.0,2.0,3.0,0.0,\n===WEIGHTS END===\n\
             ===DATA BEGIN===\n# NUM_ELEMS 5\n# TYPE float\n1,2,3,4,5,\n===DATA END===\n\
             ===LABELS BEGIN===\n# NUM_ELEMS 1\n# TYPE int\n1,\n===LABELS END===\n",
        );

        archive.load_tensor(WEIGHTS_SECTION, &tensor).unwrap();
        assert_eq!(tensor.logical_values().unwrap(), vec![1.0, 2.0, 3.0]);
        assert!(archive.load_tensor(DATA_SECTION, &tensor).is_err());
        assert!(archive.load_tensor(LABELS_SECTION, &tensor).is_err());

        let mut buffer = Vec::new();
        write_tensor(&mut buffer, DATA_SECTION, &tensor).unwrap();
        let reread = TensorArchive::parse_str(&String::from_utf8(buffer).unwrap());
        assert_eq!(reread.read_section(DATA_SECTION).unwrap(), floats(&[1.0, 2.0, 3.0, 0.0]));
    }
}
